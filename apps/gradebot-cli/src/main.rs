//! Gradebot CLI binary entry point.
//!
//! Loads `.env`, initializes the tracing subscriber, parses
//! command-line arguments with clap, and dispatches to the selected
//! subcommand via [`Cli::run`].

mod cli;
mod console;
mod logging;

use anyhow::Result;
use clap::Parser;

use crate::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    // Credentials usually live in .env during development; absence of
    // the file itself is fine.
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let (log_dir, log_to_file) = cli.log_options();

    // Clean old logs (best-effort, before tracing is initialized).
    logging::cleanup_old_logs(&log_dir);

    // Initialize tracing with optional file layer.
    let _guard = logging::init_tracing(&log_dir, log_to_file)?;

    cli.run().await
}
