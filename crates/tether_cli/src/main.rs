//! Tether CLI
//!
//! Recovery tooling for tether sync sessions. Reads the on-disk client
//! reset convention only; never opens a session.
//!
//! # Commands
//!
//! - `status` - Report whether a database file went through a client reset
//! - `backups` - List the reset backups of a database file

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tether_session::DEFAULT_RECOVERY_DIR;
use tracing_subscriber::EnvFilter;

/// Tether command-line recovery tools.
#[derive(Parser)]
#[command(name = "tether")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the database file
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Name of the recovery directory next to the database file
    #[arg(global = true, short, long, default_value = DEFAULT_RECOVERY_DIR)]
    recovery_dir: String,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Report the client reset status of a database file
    Status {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List client reset backups of a database file
    Backups {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Status { format } => {
            let path = cli.path.ok_or("Database path required for status")?;
            commands::status::run(&path, &cli.recovery_dir, &format)?;
        }
        Commands::Backups { format } => {
            let path = cli.path.ok_or("Database path required for backups")?;
            commands::backups::run(&path, &cli.recovery_dir, &format)?;
        }
        Commands::Version => {
            println!("Tether CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
