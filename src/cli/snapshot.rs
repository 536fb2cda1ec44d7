//! Snapshot command implementation.

use super::{print_event, GlobalArgs};
use crate::cache::ChangeCache;
use crate::chunk::ChunkStore;
use crate::snapshot::SnapshotEngine;
use crate::Result;
use clap::Args;
use std::path::PathBuf;

/// Arguments for the snapshot command
#[derive(Args, Debug)]
pub struct SnapshotArgs {
    /// Directory to snapshot
    pub dir: PathBuf,

    /// Where to write the sealed manifest
    #[arg(short, long)]
    pub output: PathBuf,

    /// Chunk size in bytes
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Exclude paths matching this pattern (repeatable)
    #[arg(long, action = clap::ArgAction::Append)]
    pub exclude: Vec<String>,

    /// Follow symbolic links
    #[arg(long)]
    pub follow_symlinks: bool,

    /// Hash and chunk files in parallel
    #[arg(long)]
    pub parallel: bool,
}

/// Run the snapshot command
pub fn run(args: SnapshotArgs, global: &GlobalArgs) -> Result<()> {
    let mut config = global.load_config()?;
    if let Some(chunk_size) = args.chunk_size {
        config.snapshot.chunk_size = chunk_size;
    }
    config.snapshot.exclude_patterns.extend(args.exclude);
    config.snapshot.follow_symlinks |= args.follow_symlinks;
    config.snapshot.parallel |= args.parallel;
    config.validate()?;

    let store = ChunkStore::open(&config.store_dir)?;
    let mut cache = ChangeCache::load(config.cache_path())?;
    let engine = SnapshotEngine::new(store, config.snapshot.clone()).with_registry(config.registry());

    let mut sink = print_event;
    let outcome = engine.snapshot(&args.dir, &args.output, &mut cache, &mut sink)?;

    println!("Snapshot completed successfully!");
    println!("  Files scanned: {}", outcome.total_files);
    println!("  Files changed: {}", outcome.changed_files);
    println!("  Files skipped: {}", outcome.skipped_files);
    println!("  New chunks: {}", outcome.chunks_written);
    println!("  Bytes stored: {}", outcome.bytes_written);
    println!("  Seal: {}", outcome.manifest.top_level_hash);

    Ok(())
}
