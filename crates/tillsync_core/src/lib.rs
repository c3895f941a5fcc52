//! # tillsync core
//!
//! The local half of the offline-first bootstrap:
//! - An embedded document database over an append-only record log, with
//!   schema-checked collections, migrations and a change feed
//! - [`DatabaseContext`], the single lazy acquisition point for it
//! - [`DatabaseGuardian`], bounded-time acquisition with one cold rebuild
//! - [`SessionStore`] for the device's local session
//! - [`BootController`], which resolves the authentication mode offline
//! - The [`TelemetrySink`] contract every component reports through
//!
//! ## Boot
//!
//! ```rust,ignore
//! let telemetry = TracingTelemetry::shared();
//! let context = Arc::new(DatabaseContext::new(DatabaseConfig::file("till.db")));
//! let guardian = DatabaseGuardian::new(context, telemetry.clone());
//! let report = BootController::new(guardian, telemetry).boot().await?;
//! println!("{:?} {:?}", report.state, report.auth_mode);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod boot;
mod change_feed;
mod collection;
pub mod collections;
mod config;
mod database;
mod error;
mod guardian;
mod lifecycle;
mod migration;
mod record;
mod schema;
mod session;
mod telemetry;

/// A JSON document as stored locally.
pub type Document = serde_json::Map<String, serde_json::Value>;

pub use boot::{AuthMode, BootController, BootError, BootReport, BootState, UserProfile};
pub use change_feed::{ChangeEvent, ChangeOrigin, ChangeType};
pub use collection::{Collection, RecordEntry, Selector};
pub use collections::app_collections;
pub use config::{DatabaseConfig, DatabaseLocation, DEFAULT_ACQUIRE_TIMEOUT};
pub use database::{Database, Transaction};
pub use error::{CoreError, CoreResult};
pub use guardian::DatabaseGuardian;
pub use lifecycle::{DatabaseContext, DatabaseFactory, StorageFactory};
pub use migration::{MigrationStrategy, MigrationVersion};
pub use record::{decode_frames, encode_frame, LogRecord, FRAME_HEADER_LEN, FRAME_MAGIC};
pub use schema::{CollectionSchema, FieldType};
pub use session::{LocalSession, SessionMode, SessionStore, SESSION_RECORD_ID};
pub use telemetry::{
    RecordingTelemetry, SharedTelemetry, TelemetryEvent, TelemetrySink, TracingTelemetry,
};
