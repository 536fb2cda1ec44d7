//! chunkvault - incremental directory snapshots
//!
//! Main binary entry point for the command-line interface.

use anyhow::Context;
use chunkvault::cli::{self, Cli, Commands};
use clap::Parser;
use std::process::ExitCode;
use tracing::info;

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    chunkvault::logging::init_logging(cli.global.verbose)?;
    info!("chunkvault {} starting", chunkvault::VERSION);

    let clean = match cli.command {
        Commands::Snapshot(args) => {
            let dir = args.dir.clone();
            cli::snapshot::run(args, &cli.global)
                .with_context(|| format!("Snapshot of {} failed", dir.display()))?;
            true
        }
        Commands::Restore(args) => {
            let manifest = args.manifest.clone();
            cli::restore::run(args, &cli.global)
                .with_context(|| format!("Restore of {} failed", manifest.display()))?
        }
        Commands::Verify(args) => {
            let manifest = args.manifest.clone();
            cli::restore::verify(args, &cli.global)
                .with_context(|| format!("Verification of {} failed", manifest.display()))?
        }
    };

    Ok(if clean { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
