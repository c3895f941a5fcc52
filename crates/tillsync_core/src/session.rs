//! Local authentication session persisted in the `sessions` collection.

use crate::collections::SESSIONS;
use crate::database::{now_canonical, Database};
use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use tracing::{debug, warn};

/// Fixed record id of the session.
pub const SESSION_RECORD_ID: &str = "current";

/// How the session was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    /// Logged in without reaching the remote.
    Offline,
    /// Logged in against the remote.
    Online,
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionMode::Offline => f.write_str("offline"),
            SessionMode::Online => f.write_str("online"),
        }
    }
}

/// The device's local authentication session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalSession {
    /// User id.
    pub uid: String,
    /// RFC 3339 issue time.
    pub issued_at: String,
    /// Device that issued the session.
    pub device_id: String,
    /// How the session was established.
    pub mode: SessionMode,
    /// Hex SHA-256 over the other fields.
    pub integrity_hash: String,
}

impl LocalSession {
    /// Issues a session now.
    pub fn new(uid: impl Into<String>, device_id: impl Into<String>, mode: SessionMode) -> Self {
        let uid = uid.into();
        let device_id = device_id.into();
        let issued_at = now_canonical();
        let integrity_hash = compute_hash(&uid, &issued_at, &device_id, mode);
        Self {
            uid,
            issued_at,
            device_id,
            mode,
            integrity_hash,
        }
    }

    /// A session is valid when `uid` and `integrity_hash` are non-empty.
    pub fn is_valid(&self) -> bool {
        !self.uid.is_empty() && !self.integrity_hash.is_empty()
    }

    /// Recomputes the hash and compares.
    pub fn verify_integrity(&self) -> bool {
        compute_hash(&self.uid, &self.issued_at, &self.device_id, self.mode) == self.integrity_hash
    }
}

fn compute_hash(uid: &str, issued_at: &str, device_id: &str, mode: SessionMode) -> String {
    let digest = Sha256::digest(format!("{uid}|{issued_at}|{device_id}|{mode}").as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Reads and writes the session record.
#[derive(Debug, Clone, Copy)]
pub struct SessionStore<'db> {
    db: &'db Database,
}

impl<'db> SessionStore<'db> {
    /// Creates a store over `db`.
    pub fn new(db: &'db Database) -> Self {
        Self { db }
    }

    /// Returns the stored session.
    ///
    /// A record that no longer decodes is treated as absent.
    pub fn get(&self) -> CoreResult<Option<LocalSession>> {
        let Some(mut doc) = self.db.collection(SESSIONS)?.find_one(SESSION_RECORD_ID)? else {
            return Ok(None);
        };
        doc.remove("id");
        doc.remove("updatedAt");
        match serde_json::from_value::<LocalSession>(Value::Object(doc)) {
            Ok(session) => Ok(Some(session)),
            Err(e) => {
                warn!(error = %e, "stored session is unreadable, ignoring it");
                Ok(None)
            }
        }
    }

    /// Saves `session`, replacing any previous one.
    pub fn save(&self, session: &LocalSession) -> CoreResult<()> {
        let Value::Object(mut doc) =
            serde_json::to_value(session).map_err(|e| CoreError::Codec(e.to_string()))?
        else {
            return Err(CoreError::Codec("session did not serialize to an object".into()));
        };
        doc.insert("id".into(), Value::String(SESSION_RECORD_ID.into()));
        self.db.collection(SESSIONS)?.upsert(doc)?;
        debug!(uid = %session.uid, mode = %session.mode, "session saved");
        Ok(())
    }

    /// Removes the session. Returns false if there was none.
    pub fn clear(&self) -> CoreResult<bool> {
        let removed = self.db.collection(SESSIONS)?.remove(SESSION_RECORD_ID)?;
        debug!(removed, "session cleared");
        Ok(removed)
    }
}
