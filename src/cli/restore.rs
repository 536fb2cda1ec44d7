//! Restore and verify command implementations.

use super::{print_event, GlobalArgs};
use crate::chunk::ChunkStore;
use crate::restore::{RestoreEngine, RestoreReport};
use crate::Result;
use clap::Args;
use std::path::PathBuf;

/// Arguments for the restore command
#[derive(Args, Debug)]
pub struct RestoreArgs {
    /// Manifest to restore
    pub manifest: PathBuf,

    /// Output directory
    pub dir: PathBuf,

    /// Reconstruct and verify without writing files
    #[arg(long)]
    pub dry_run: bool,

    /// Refuse to restore from a manifest whose seal does not match
    #[arg(long)]
    pub fail_on_tamper: bool,
}

/// Arguments for the verify command
#[derive(Args, Debug)]
pub struct VerifyArgs {
    /// Manifest to verify
    pub manifest: PathBuf,
}

/// Run the restore command, returning whether the restore was clean
pub fn run(args: RestoreArgs, global: &GlobalArgs) -> Result<bool> {
    let config = global.load_config()?;
    let mut options = config.restore;
    options.dry_run |= args.dry_run;
    options.fail_on_tamper |= args.fail_on_tamper;

    let engine = RestoreEngine::new(ChunkStore::open(&config.store_dir)?).with_options(options);
    let mut sink = print_event;
    let report = engine.restore(&args.manifest, &args.dir, &mut sink)?;

    print_summary(&report);
    Ok(report.is_clean())
}

/// Run the verify command, returning whether the snapshot is intact
pub fn verify(args: VerifyArgs, global: &GlobalArgs) -> Result<bool> {
    let config = global.load_config()?;
    let engine = RestoreEngine::new(ChunkStore::open(&config.store_dir)?).with_options(config.restore);

    let mut sink = print_event;
    let report = engine.verify(&args.manifest, &mut sink)?;

    print_summary(&report);
    Ok(report.is_clean())
}

fn print_summary(report: &RestoreReport) {
    println!("Summary:");
    println!("  Manifest intact: {}", report.manifest_intact());
    println!("  Files restored: {}/{}", report.files_restored, report.files_total);
    println!("  Placeholders: {}", report.placeholders);
    println!("  Skipped: {}", report.files_skipped);
    println!("  Failed: {}", report.files_failed);
    println!("  Missing chunks: {}", report.missing_chunks);
    println!("  Hash mismatches: {}", report.hash_mismatches);
    println!("  Bytes: {}", report.bytes_written);
    println!("  Duration: {:.2?}", report.duration);
}
