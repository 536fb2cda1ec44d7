//! # chunkvault
//!
//! Incremental, content-addressed directory snapshots with tamper-evident
//! manifests.
//!
//! ## Features
//!
//! - **Chunk store**: fixed-size chunks stored once under their SHA-256
//! - **Change detection**: an mtime/hash cache skips files that have not changed
//! - **Sealed manifests**: canonical JSON sealed with a top-level hash
//! - **Known files**: whole-file references to external sources instead of chunks
//! - **Resilient restore**: missing chunks and mismatches are reported, never fatal
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use chunkvault::{ChangeCache, ChunkStore, RestoreEngine, SnapshotConfig, SnapshotEngine, TracingSink};
//!
//! # fn main() -> chunkvault::Result<()> {
//! let store = ChunkStore::open("./vault")?;
//! let mut cache = ChangeCache::load("./vault/cache.json")?;
//!
//! let engine = SnapshotEngine::new(store.clone(), SnapshotConfig::default());
//! let outcome = engine.snapshot("./my-data", "./snapshot.json", &mut cache, &mut TracingSink)?;
//! println!("{} files, {} changed", outcome.total_files, outcome.changed_files);
//!
//! let report = RestoreEngine::new(store).restore("./snapshot.json", "./restored", &mut TracingSink)?;
//! assert!(report.is_clean());
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod chunk;
pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod hash;
pub mod logging;
pub mod manifest;
pub mod registry;
pub mod restore;
pub mod snapshot;

// Re-export commonly used types
pub use cache::ChangeCache;
pub use chunk::ChunkStore;
pub use config::VaultConfig;
pub use error::{Error, Result};
pub use events::{Event, EventLog, EventSink, TracingSink};
pub use hash::Digest;
pub use manifest::{FileRecord, Manifest, Method};
pub use registry::{KnownFileRegistry, KnownFileResolver};
pub use restore::{RestoreEngine, RestoreOptions, RestoreReport};
pub use snapshot::{SnapshotConfig, SnapshotEngine, SnapshotOutcome};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
