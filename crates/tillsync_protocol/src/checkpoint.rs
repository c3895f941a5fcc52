//! Pull cursor.

use crate::error::ProtocolResult;
use crate::timestamp::ServerTimestamp;
use serde::{Deserialize, Serialize};

/// The last successfully pulled point in a remote collection.
///
/// Holds the canonical `updatedAt` of the newest document applied so far.
/// Canonical strings sort chronologically, so checkpoints compare by
/// their string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Canonical timestamp of the last pulled document.
    #[serde(rename = "updatedAt")]
    pub updated_at: String,
}

impl Checkpoint {
    /// Creates a checkpoint from a canonical timestamp string.
    pub fn new(updated_at: impl Into<String>) -> Self {
        Self {
            updated_at: updated_at.into(),
        }
    }

    /// Creates a checkpoint at a server timestamp.
    pub fn at(ts: ServerTimestamp) -> ProtocolResult<Self> {
        Ok(Self::new(ts.normalize()?))
    }

    /// Parses the cursor back into a server timestamp for range queries.
    pub fn timestamp(&self) -> ProtocolResult<ServerTimestamp> {
        ServerTimestamp::parse(&self.updated_at)
    }

    /// Returns whichever of `self` and `other` is further along.
    #[must_use]
    pub fn max(self, other: Option<Checkpoint>) -> Checkpoint {
        match other {
            Some(other) if other > self => other,
            _ => self,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_follows_time() {
        let early = Checkpoint::at(ServerTimestamp::from_micros(1)).unwrap();
        let late = Checkpoint::at(ServerTimestamp::from_micros(2)).unwrap();
        assert!(early < late);
        assert_eq!(early.clone().max(Some(late.clone())), late);
        assert_eq!(late.clone().max(Some(early)), late);
        assert_eq!(late.clone().max(None), late);
    }

    #[test]
    fn serializes_as_updated_at() {
        let cp = Checkpoint::new("2025-10-16T03:31:00.000000Z");
        let json = serde_json::to_string(&cp).unwrap();
        assert_eq!(json, r#"{"updatedAt":"2025-10-16T03:31:00.000000Z"}"#);
        assert_eq!(cp.timestamp().unwrap(), ServerTimestamp::new(1_760_585_460, 0));
    }
}
