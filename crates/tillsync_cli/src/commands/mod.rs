//! CLI command implementations.

pub mod boot;
pub mod inspect;
pub mod sync;

use std::error::Error;
use std::path::Path;
use std::sync::Arc;
use tillsync_core::{DatabaseConfig, DatabaseContext, DatabaseGuardian, TracingTelemetry};

/// Result type shared by the commands.
pub type CommandResult<T = ()> = Result<T, Box<dyn Error>>;

/// Guardian over the database file at `path`.
pub fn guardian(path: &Path) -> DatabaseGuardian {
    let context = Arc::new(DatabaseContext::new(DatabaseConfig::file(path)));
    DatabaseGuardian::new(context, TracingTelemetry::shared())
}

