//! Inhalesync CLI
//!
//! Command-line tools for exercising the inhalesync engine.
//!
//! # Commands
//!
//! - `simulate` - Run a phone against a simulated service on an accelerated clock
//! - `health` - Show the sync health kept in a simulator state file

mod commands;
mod state_file;

use clap::{Parser, Subcommand};
use commands::simulate::SimulateArgs;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Inhalesync command-line tools.
#[derive(Parser)]
#[command(name = "inhalesync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run sync cycles against a simulated service
    Simulate(SimulateArgs),

    /// Show the sync health kept in a state file
    Health {
        /// Path to the state file
        state: PathBuf,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
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
        Commands::Simulate(args) => {
            let report = commands::simulate::run(&args).await?;
            commands::simulate::print(&report, &args.format)?;
        }
        Commands::Health { state, format } => {
            commands::health::run(&state, &format)?;
        }
    }

    Ok(())
}
