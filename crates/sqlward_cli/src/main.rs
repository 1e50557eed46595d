//! SQLWard CLI
//!
//! Command-line tools for SQLWard database maintenance.
//!
//! # Commands
//!
//! - `inspect` - Display the file set, tables and materials
//! - `verify` - Check database integrity
//! - `backup` - Write a backup material
//! - `retrieve` - Rebuild the database from deposits and materials
//! - `recover` - Run a recovery mode
//! - `deposit` / `remove-deposit` - Quarantine or drop damaged file sets
//! - `migrate` - Move a table to a new name online

mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// SQLWard command-line database tools.
#[derive(Parser)]
#[command(name = "sqlward")]
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

/// Recovery modes selectable from the command line.
#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum ModeArg {
    /// Delete the file set and start empty
    Remove,
    /// Quarantine the file set, then rebuild from it
    Deposit,
}

#[derive(Subcommand)]
enum Commands {
    /// Display the file set, tables and materials
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Check database integrity
    Verify,

    /// Write a backup material
    Backup {
        /// Tables to leave out of the material
        #[arg(short, long)]
        exclude: Vec<String>,
    },

    /// Rebuild the database from deposits and materials
    Retrieve,

    /// Run a recovery mode
    Recover {
        /// What to do with the damaged file set
        #[arg(short, long, value_enum, default_value = "deposit")]
        mode: ModeArg,

        /// Recover even if the database looks healthy
        #[arg(long)]
        force: bool,
    },

    /// Move the file set into a new deposit
    Deposit,

    /// Delete every deposit
    RemoveDeposit,

    /// Migrate a table to a new name
    Migrate {
        /// Table to migrate from
        #[arg(long)]
        source: String,

        /// Table to migrate to
        #[arg(long)]
        target: String,

        /// Stop after this many steps
        #[arg(long)]
        steps: Option<usize>,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Inspect { format } => {
            let path = cli.path.ok_or("Database path required for inspect")?;
            commands::inspect::run(&path, &format)?;
        }
        Commands::Verify => {
            let path = cli.path.ok_or("Database path required for verify")?;
            commands::verify::run(&path)?;
        }
        Commands::Backup { exclude } => {
            let path = cli.path.ok_or("Database path required for backup")?;
            commands::backup::create(&path, exclude)?;
        }
        Commands::Retrieve => {
            let path = cli.path.ok_or("Database path required for retrieve")?;
            commands::backup::retrieve(&path)?;
        }
        Commands::Recover { mode, force } => {
            let path = cli.path.ok_or("Database path required for recover")?;
            commands::recover::run(&path, mode, force)?;
        }
        Commands::Deposit => {
            let path = cli.path.ok_or("Database path required for deposit")?;
            commands::backup::deposit(&path)?;
        }
        Commands::RemoveDeposit => {
            let path = cli.path.ok_or("Database path required for remove-deposit")?;
            commands::backup::remove_deposit(&path)?;
        }
        Commands::Migrate {
            source,
            target,
            steps,
        } => {
            let path = cli.path.ok_or("Database path required for migrate")?;
            commands::migrate::run(&path, &source, &target, steps)?;
        }
        Commands::Version => {
            println!("SQLWard CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
