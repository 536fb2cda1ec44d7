//! Command-line interface for chunkvault.
//!
//! Each subcommand lives in its own module with an `Args` struct and a
//! synchronous `run` function.

use crate::config::VaultConfig;
use crate::events::{Event, Severity};
use crate::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;

pub mod restore;
pub mod snapshot;

/// chunkvault - incremental, deduplicated directory snapshots
#[derive(Parser)]
#[command(name = "chunkvault")]
#[command(about = "Incremental, content-addressed directory snapshots with tamper-evident manifests")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by every subcommand
#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// Store directory (overrides the config file)
    #[arg(long, global = true)]
    pub store: Option<PathBuf>,

    /// TOML configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

impl GlobalArgs {
    /// Configuration from `--config` (or defaults) with `--store` applied
    pub fn load_config(&self) -> Result<VaultConfig> {
        let mut config = match &self.config {
            Some(path) => {
                debug!("Loading configuration from {}", path.display());
                VaultConfig::load(path)?
            }
            None => VaultConfig::default(),
        };

        if let Some(store) = &self.store {
            config.store_dir = store.clone();
        }

        Ok(config)
    }
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Snapshot a directory into the store
    Snapshot(snapshot::SnapshotArgs),
    /// Restore a snapshot into a directory
    Restore(restore::RestoreArgs),
    /// Check a snapshot without writing anything
    Verify(restore::VerifyArgs),
}

/// Event sink that prints log lines, problems to stderr
pub fn print_event(event: &Event) {
    match event.severity() {
        Severity::Info => println!("{}", event),
        Severity::Warning | Severity::Error => eprintln!("{}", event),
    }
}
