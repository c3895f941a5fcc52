//! Boot sequencer.
//!
//! `Init -> DbReady -> SessionChecked -> Ready`, each phase strictly after
//! the previous one. The authentication mode is resolved from the local
//! session and the local `users` collection only, so boot works offline.

use crate::collections::USERS;
use crate::database::Database;
use crate::error::{CoreError, CoreResult};
use crate::guardian::DatabaseGuardian;
use crate::session::{LocalSession, SessionMode, SessionStore};
use crate::telemetry::{SharedTelemetry, TelemetryEvent};
use crate::Document;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Boot phase. Ordered; boot never moves backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BootState {
    /// Nothing done yet.
    Init,
    /// Local database acquired.
    DbReady,
    /// Session record read.
    SessionChecked,
    /// Authentication mode resolved.
    Ready,
}

/// Resolved authentication posture of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthMode {
    /// No usable session.
    Anonymous,
    /// Session issued offline and the user exists locally.
    OfflineAuthenticated,
    /// Session issued online and the user exists locally.
    OnlineAuthenticated,
}

impl fmt::Display for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMode::Anonymous => f.write_str("ANONYMOUS"),
            AuthMode::OfflineAuthenticated => f.write_str("OFFLINE_AUTHENTICATED"),
            AuthMode::OnlineAuthenticated => f.write_str("ONLINE_AUTHENTICATED"),
        }
    }
}

/// The signed-in user's local record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    /// User id.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Role, if recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Email, if recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Every other field of the record.
    #[serde(flatten)]
    pub extra: Document,
}

/// Outcome of a boot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BootReport {
    /// Final state; `Ready` on success.
    pub state: BootState,
    /// Resolved mode.
    pub auth_mode: AuthMode,
    /// Profile when authenticated.
    pub profile: Option<UserProfile>,
    /// Every state entered, in order.
    pub transitions: Vec<BootState>,
}

/// Boot stopped before `Ready`.
#[derive(Debug, Error)]
#[error("boot failed after {}: {source}", last_state(.reached))]
pub struct BootError {
    /// States entered before the failure.
    pub reached: Vec<BootState>,
    /// The failure.
    #[source]
    pub source: CoreError,
}

fn last_state(reached: &[BootState]) -> String {
    reached
        .last()
        .map_or_else(|| "nothing".to_string(), |s| format!("{s:?}"))
}

struct Progress {
    transitions: Vec<BootState>,
}

impl Progress {
    fn new() -> Self {
        Self {
            transitions: vec![BootState::Init],
        }
    }

    fn advance(&mut self, next: BootState) {
        debug_assert!(self.transitions.last().is_some_and(|s| *s < next));
        debug!(state = ?next, "boot transition");
        self.transitions.push(next);
    }

    fn fail(self, source: CoreError) -> BootError {
        BootError {
            reached: self.transitions,
            source,
        }
    }
}

/// Runs the boot sequence and keeps the last result.
pub struct BootController {
    guardian: DatabaseGuardian,
    telemetry: SharedTelemetry,
    last: Mutex<Option<BootReport>>,
}

impl fmt::Debug for BootController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootController")
            .field("last", &*self.last.lock())
            .finish_non_exhaustive()
    }
}

impl BootController {
    /// Creates a controller.
    pub fn new(guardian: DatabaseGuardian, telemetry: SharedTelemetry) -> Self {
        Self {
            guardian,
            telemetry,
            last: Mutex::new(None),
        }
    }

    /// The guardian used to acquire the database.
    pub fn guardian(&self) -> &DatabaseGuardian {
        &self.guardian
    }

    /// Runs the sequence.
    ///
    /// Only an unavailable database or an unreadable local store fails
    /// boot. A missing, invalid or orphaned session yields `Anonymous`.
    pub async fn boot(&self) -> Result<BootReport, BootError> {
        let mut progress = Progress::new();

        let db = match self.guardian.get_database_safely().await {
            Ok(db) => db,
            Err(e) => return Err(self.failed(progress, e)),
        };
        progress.advance(BootState::DbReady);

        let session = match SessionStore::new(&db).get() {
            Ok(session) => session,
            Err(e) => return Err(self.failed(progress, e)),
        };
        progress.advance(BootState::SessionChecked);

        let (auth_mode, profile) = match resolve_auth(&db, session.as_ref()) {
            Ok(resolved) => resolved,
            Err(e) => return Err(self.failed(progress, e)),
        };
        progress.advance(BootState::Ready);

        let report = BootReport {
            state: BootState::Ready,
            auth_mode,
            profile,
            transitions: progress.transitions,
        };
        info!(mode = %auth_mode, "boot completed");
        self.telemetry.record(TelemetryEvent::BootCompleted {
            mode: auth_mode.to_string(),
        });
        *self.last.lock() = Some(report.clone());
        Ok(report)
    }

    fn failed(&self, progress: Progress, source: CoreError) -> BootError {
        let err = progress.fail(source);
        warn!(error = %err, "boot failed");
        self.telemetry.record(TelemetryEvent::BootFailed {
            error: err.to_string(),
        });
        err
    }

    /// State of the last successful boot, or `Init`.
    pub fn boot_state(&self) -> BootState {
        self.last.lock().as_ref().map_or(BootState::Init, |r| r.state)
    }

    /// Mode of the last successful boot, or `Anonymous`.
    pub fn auth_mode(&self) -> AuthMode {
        self.last
            .lock()
            .as_ref()
            .map_or(AuthMode::Anonymous, |r| r.auth_mode)
    }

    /// Profile of the last successful boot.
    pub fn profile(&self) -> Option<UserProfile> {
        self.last.lock().as_ref().and_then(|r| r.profile.clone())
    }
}

fn resolve_auth(
    db: &Database,
    session: Option<&LocalSession>,
) -> CoreResult<(AuthMode, Option<UserProfile>)> {
    let Some(session) = session.filter(|s| s.is_valid()) else {
        debug!("no valid session");
        return Ok((AuthMode::Anonymous, None));
    };

    let Some(user) = db.collection(USERS)?.find_one(&session.uid)? else {
        warn!(uid = %session.uid, "session user not found locally, continuing anonymous");
        return Ok((AuthMode::Anonymous, None));
    };

    let profile = match serde_json::from_value::<UserProfile>(Value::Object(user)) {
        Ok(profile) => profile,
        Err(e) => {
            warn!(uid = %session.uid, error = %e, "user record unreadable, continuing anonymous");
            return Ok((AuthMode::Anonymous, None));
        }
    };

    let mode = match session.mode {
        SessionMode::Offline => AuthMode::OfflineAuthenticated,
        SessionMode::Online => AuthMode::OnlineAuthenticated,
    };
    Ok((mode, Some(profile)))
}
