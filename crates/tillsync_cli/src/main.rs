//! tillsync CLI
//!
//! Command-line tools for a device's local database.
//!
//! # Commands
//!
//! - `boot` - Run the boot sequence and print the resolved identity
//! - `inspect` - Collection counts, pending writes and checkpoints
//! - `sync` - Replay a sync pass against an in-memory remote

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// tillsync device database tools.
#[derive(Parser)]
#[command(name = "tillsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the database file
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the boot sequence and print state, mode and profile
    Boot {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Display collection counts, pending writes and checkpoints
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Run one sync pass over a copy of the database against an
    /// in-memory remote
    Sync {
        /// Documents per pull page
        #[arg(long, default_value = "100")]
        pull_batch: usize,

        /// Pending writes per push batch
        #[arg(long, default_value = "50")]
        push_batch: usize,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Boot { format } => {
            let path = cli.path.ok_or("Database path required for boot")?;
            commands::boot::run(&path, &format).await?;
        }
        Commands::Inspect { format } => {
            let path = cli.path.ok_or("Database path required for inspect")?;
            commands::inspect::run(&path, &format).await?;
        }
        Commands::Sync {
            pull_batch,
            push_batch,
        } => {
            let path = cli.path.ok_or("Database path required for sync")?;
            commands::sync::run(&path, pull_batch, push_batch).await?;
        }
        Commands::Version => {
            println!("tillsync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
