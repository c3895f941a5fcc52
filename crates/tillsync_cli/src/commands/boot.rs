//! Boot command implementation.

use super::{guardian, CommandResult};
use std::path::Path;
use tillsync_core::{BootController, BootReport, TracingTelemetry};

/// Runs the boot sequence and prints the result.
pub async fn run(path: &Path, format: &str) -> CommandResult {
    let controller = BootController::new(guardian(path), TracingTelemetry::shared());
    let report = controller.boot().await?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&report)?),
        _ => print_text_output(&report),
    }

    if let Some(db) = controller.guardian().context().cached() {
        db.close()?;
    }
    Ok(())
}

fn print_text_output(report: &BootReport) {
    println!("Boot");
    println!("====");
    println!();
    println!("State:     {:?}", report.state);
    println!("Auth mode: {}", report.auth_mode);
    let path: Vec<String> = report.transitions.iter().map(|s| format!("{s:?}")).collect();
    println!("Path:      {}", path.join(" -> "));

    match &report.profile {
        Some(profile) => {
            println!();
            println!("Profile:");
            println!("  Id:    {}", profile.id);
            println!("  Name:  {}", profile.name);
            if let Some(role) = &profile.role {
                println!("  Role:  {role}");
            }
            if let Some(email) = &profile.email {
                println!("  Email: {email}");
            }
        }
        None => println!("Profile:   none"),
    }
}
