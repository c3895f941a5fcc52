//! Inspect command implementation.

use super::CommandResult;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use tillsync_core::collections::{REPLICATION_CHECKPOINTS, SESSIONS};
use tillsync_core::{Database, DatabaseConfig, DatabaseContext, Selector, SessionStore};

/// Database inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Database path.
    pub path: String,
    /// Record log size in bytes.
    pub log_size: u64,
    /// Per-collection statistics.
    pub collections: Vec<CollectionStats>,
    /// Stored checkpoint per replication identifier.
    pub checkpoints: BTreeMap<String, String>,
    /// Uid of the local session, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
}

/// Statistics for a single collection.
#[derive(Debug, Serialize)]
pub struct CollectionStats {
    /// Collection name.
    pub name: String,
    /// Visible documents.
    pub documents: usize,
    /// Writes not yet pushed.
    pub pending: usize,
}

/// Runs the inspect command.
///
/// Opens the file without the guardian so a damaged log is reported
/// instead of rebuilt.
pub async fn run(path: &Path, format: &str) -> CommandResult {
    if !path.exists() {
        return Err(format!("No database found at {:?}", path).into());
    }
    let context = DatabaseContext::new(DatabaseConfig::file(path));
    let db = context.get_database().await?;
    let result = collect(&db, path)?;
    db.close()?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => print_text_output(&result),
    }
    Ok(())
}

/// Gathers statistics from an open database.
pub fn collect(db: &Database, path: &Path) -> CommandResult<InspectResult> {
    let mut collections = Vec::new();
    for name in db.collection_names() {
        if name == REPLICATION_CHECKPOINTS || name == SESSIONS {
            continue;
        }
        let collection = db.collection(&name)?;
        collections.push(CollectionStats {
            documents: collection.count()?,
            pending: collection.pending_count()?,
            name,
        });
    }

    let checkpoints = db
        .collection(REPLICATION_CHECKPOINTS)?
        .find(&Selector::all())?
        .into_iter()
        .filter_map(|doc| {
            let id = doc.get("id").and_then(Value::as_str)?.to_string();
            let at = doc.get("updatedAt").and_then(Value::as_str)?.to_string();
            Some((id, at))
        })
        .collect();

    Ok(InspectResult {
        path: path.display().to_string(),
        log_size: db.log_size()?,
        collections,
        checkpoints,
        session: SessionStore::new(db).get()?.map(|s| s.uid),
    })
}

fn print_text_output(result: &InspectResult) {
    println!("tillsync Database Inspection");
    println!("============================");
    println!();
    println!("Path:     {}", result.path);
    println!("Log size: {}", format_size(result.log_size));
    println!(
        "Session:  {}",
        result.session.as_deref().unwrap_or("none")
    );
    println!();
    println!("Collections:");
    for col in &result.collections {
        println!(
            "  {:<12} {} documents, {} pending",
            col.name, col.documents, col.pending
        );
    }

    println!();
    if result.checkpoints.is_empty() {
        println!("Checkpoints: none");
    } else {
        println!("Checkpoints:");
        for (id, at) in &result.checkpoints {
            println!("  {:<12} {}", id, at);
        }
    }
}

fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} bytes", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
