//! The remote store's native timestamp.

use crate::error::{ProtocolError, ProtocolResult};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A server-assigned point in time.
///
/// The remote stamps every committed write with one of these. Locally the
/// value only ever appears in its canonical string form (see
/// [`ServerTimestamp::normalize`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServerTimestamp {
    /// Whole seconds since the Unix epoch.
    pub seconds: i64,
    /// Nanoseconds within the second.
    pub nanos: u32,
}

impl ServerTimestamp {
    /// The Unix epoch.
    pub const EPOCH: Self = Self {
        seconds: 0,
        nanos: 0,
    };

    /// Creates a timestamp.
    pub const fn new(seconds: i64, nanos: u32) -> Self {
        Self { seconds, nanos }
    }

    /// Creates a timestamp from microseconds since the epoch.
    pub fn from_micros(micros: i64) -> Self {
        Self {
            seconds: micros.div_euclid(1_000_000),
            nanos: (micros.rem_euclid(1_000_000) * 1_000) as u32,
        }
    }

    /// Current wall-clock time.
    pub fn now() -> Self {
        let now = Utc::now();
        Self {
            seconds: now.timestamp(),
            nanos: now.timestamp_subsec_nanos(),
        }
    }

    /// Microseconds since the epoch (sub-microsecond precision is dropped).
    pub fn as_micros(&self) -> i64 {
        self.seconds * 1_000_000 + i64::from(self.nanos / 1_000)
    }

    /// Renders the canonical string: RFC 3339, UTC, microsecond precision,
    /// `Z` suffix.
    ///
    /// The format is fixed width, so canonical strings compare in the same
    /// order as the timestamps they came from.
    pub fn normalize(&self) -> ProtocolResult<String> {
        let datetime = DateTime::<Utc>::from_timestamp(self.seconds, self.nanos).ok_or(
            ProtocolError::TimestampOutOfRange {
                seconds: self.seconds,
                nanos: self.nanos,
            },
        )?;
        Ok(datetime.to_rfc3339_opts(SecondsFormat::Micros, true))
    }

    /// Parses a canonical string back into a timestamp.
    pub fn parse(canonical: &str) -> ProtocolResult<Self> {
        let datetime = DateTime::parse_from_rfc3339(canonical)
            .map_err(|_| ProtocolError::InvalidTimestamp(canonical.to_string()))?
            .with_timezone(&Utc);
        Ok(Self {
            seconds: datetime.timestamp(),
            nanos: datetime.timestamp_subsec_nanos(),
        })
    }
}

impl fmt::Display for ServerTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.normalize() {
            Ok(s) => f.write_str(&s),
            Err(_) => write!(f, "{}.{:09}", self.seconds, self.nanos),
        }
    }
}
