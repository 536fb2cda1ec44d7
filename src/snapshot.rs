//! Snapshot creation: traversal, change detection, chunking and sealing

use crate::cache::{assess, modified_secs, Assessment, CacheEntry, ChangeCache};
use crate::chunk::{ChunkStore, FixedChunker, DEFAULT_CHUNK_SIZE};
use crate::events::{Event, EventSink};
use crate::hash::{hash_file, Digest, Hasher};
use crate::manifest::{FileRecord, Manifest, ManifestBuilder};
use crate::registry::KnownFileRegistry;
use crate::{Error, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, span, warn, Level};
use walkdir::{DirEntry, WalkDir};

/// Configuration for snapshot operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Chunk size for file splitting
    pub chunk_size: usize,
    /// Whether to follow symbolic links
    pub follow_symlinks: bool,
    /// Patterns to exclude, matched against relative paths
    pub exclude_patterns: Vec<String>,
    /// Hash and chunk files on the rayon thread pool
    pub parallel: bool,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            follow_symlinks: false,
            exclude_patterns: Vec::new(),
            parallel: false,
        }
    }
}

/// Summary of a completed snapshot run
#[derive(Debug, Clone)]
pub struct SnapshotOutcome {
    pub manifest: Manifest,
    pub manifest_path: PathBuf,
    /// Files discovered under the root
    pub total_files: usize,
    /// Files recorded afresh rather than carried over from the cache
    pub changed_files: usize,
    /// Files that could not be read and are missing from the manifest
    pub skipped_files: usize,
    /// Chunks newly added to the store by this run
    pub chunks_written: usize,
    pub bytes_written: u64,
}

/// A regular file found during traversal
#[derive(Debug)]
struct Candidate {
    path: PathBuf,
    relative: String,
    modified_time: f64,
}

/// What processing one file produced
#[derive(Debug)]
struct FileOutcome {
    record: FileRecord,
    changed: bool,
    chunks_written: usize,
    bytes_written: u64,
}

impl FileOutcome {
    fn unchanged(record: FileRecord) -> Self {
        Self {
            record,
            changed: false,
            chunks_written: 0,
            bytes_written: 0,
        }
    }
}

/// Paths that must never end up inside a snapshot
#[derive(Debug)]
struct Exclusions {
    files: Vec<PathBuf>,
    dirs: Vec<PathBuf>,
}

impl Exclusions {
    fn is_excluded(&self, entry: &DirEntry) -> bool {
        let path = entry.path();
        if entry.file_type().is_dir() {
            self.dirs.iter().any(|d| d == path)
        } else {
            self.files.iter().any(|f| f == path)
        }
    }
}

/// Snapshot engine for creating incremental, deduplicated snapshots
#[derive(Debug)]
pub struct SnapshotEngine {
    chunk_store: ChunkStore,
    registry: KnownFileRegistry,
    config: SnapshotConfig,
}

impl SnapshotEngine {
    /// Create a new snapshot engine writing chunks into `chunk_store`
    pub fn new(chunk_store: ChunkStore, config: SnapshotConfig) -> Self {
        Self {
            chunk_store,
            registry: KnownFileRegistry::default(),
            config,
        }
    }

    /// Use a known-file registry for files that need no chunk storage
    pub fn with_registry(mut self, registry: KnownFileRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn config(&self) -> &SnapshotConfig {
        &self.config
    }

    pub fn chunk_store(&self) -> &ChunkStore {
        &self.chunk_store
    }

    /// Snapshot `root_dir`, writing the sealed manifest to `manifest_path`.
    ///
    /// The cache is consulted for every file, updated for every file
    /// observed, and persisted once the manifest is on disk.
    pub fn snapshot<P: AsRef<Path>, Q: AsRef<Path>>(
        &self,
        root_dir: P,
        manifest_path: Q,
        cache: &mut ChangeCache,
        sink: &mut dyn EventSink,
    ) -> Result<SnapshotOutcome> {
        let root = fs::canonicalize(root_dir.as_ref())?;
        if !root.is_dir() {
            return Err(Error::NotADirectory { path: root });
        }
        let manifest_path = manifest_path.as_ref().to_path_buf();

        let span = span!(Level::INFO, "snapshot", root = %root.display());
        let _enter = span.enter();

        info!("Starting snapshot of {}", root.display());
        sink.emit(&Event::SnapshotStarted { root: root.clone() });
        cache.bind_root(&root.display().to_string());

        let exclusions = Exclusions {
            files: vec![absolutize(&manifest_path)?, absolutize(cache.path())?],
            dirs: vec![absolutize(self.chunk_store.chunks_path())?],
        };

        let mut skipped_files = 0;
        let candidates = self.discover(&root, &exclusions, &mut skipped_files, sink);

        let outcomes: Vec<Result<FileOutcome>> = {
            let cache: &ChangeCache = cache;
            if self.config.parallel {
                candidates
                    .par_iter()
                    .map(|c| self.process_file(c, cache.lookup(&c.relative)))
                    .collect()
            } else {
                candidates
                    .iter()
                    .map(|c| self.process_file(c, cache.lookup(&c.relative)))
                    .collect()
            }
        };

        let mut builder = ManifestBuilder::new(&root);
        let mut changed_files = 0;
        let mut chunks_written = 0;
        let mut bytes_written = 0;

        for (candidate, outcome) in candidates.iter().zip(outcomes) {
            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(Error::SourceRead { path, source }) => {
                    warn!("Failed to read {}: {}", path.display(), source);
                    sink.emit(&Event::FileSkipped {
                        path: candidate.relative.clone(),
                        reason: source.to_string(),
                    });
                    skipped_files += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            if outcome.changed {
                changed_files += 1;
                sink.emit(&Event::FileChanged {
                    path: candidate.relative.clone(),
                    method: outcome.record.method.clone(),
                });
            } else {
                sink.emit(&Event::FileUnchanged {
                    path: candidate.relative.clone(),
                });
            }

            chunks_written += outcome.chunks_written;
            bytes_written += outcome.bytes_written;
            cache.upsert(
                candidate.relative.clone(),
                CacheEntry::from_record(&outcome.record, candidate.modified_time),
            );
            builder.push(outcome.record);
        }

        let observed: HashSet<&str> = candidates.iter().map(|c| c.relative.as_str()).collect();
        let pruned = cache.retain(|path| observed.contains(path));
        if pruned > 0 {
            debug!("Dropped {} cache entries for paths no longer present", pruned);
        }

        let manifest = builder.finish()?;
        manifest.save(&manifest_path)?;
        cache.persist()?;

        info!(
            "Snapshot completed: {} files, {} changed, {} new chunks ({} bytes)",
            candidates.len(),
            changed_files,
            chunks_written,
            bytes_written
        );
        sink.emit(&Event::SnapshotCompleted {
            manifest: manifest_path.clone(),
            total_files: candidates.len(),
            changed_files,
            chunk_store: self.chunk_store.chunks_path().to_path_buf(),
        });

        Ok(SnapshotOutcome {
            manifest,
            manifest_path,
            total_files: candidates.len(),
            changed_files,
            skipped_files,
            chunks_written,
            bytes_written,
        })
    }

    /// Walk the tree in file-name order and collect the regular files to record
    fn discover(
        &self,
        root: &Path,
        exclusions: &Exclusions,
        skipped_files: &mut usize,
        sink: &mut dyn EventSink,
    ) -> Vec<Candidate> {
        let mut candidates = Vec::new();

        let walker = WalkDir::new(root)
            .follow_links(self.config.follow_symlinks)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                if entry.depth() == 0 {
                    return true;
                }
                if exclusions.is_excluded(entry) {
                    debug!("Excluding engine file: {}", entry.path().display());
                    return false;
                }
                let relative = relative_path(root, entry.path());
                !self.should_exclude(&relative)
            });

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping entry due to error: {}", e);
                    let path = e
                        .path()
                        .map(|p| relative_path(root, p))
                        .unwrap_or_default();
                    sink.emit(&Event::FileSkipped {
                        path,
                        reason: Error::from(e).to_string(),
                    });
                    *skipped_files += 1;
                    continue;
                }
            };

            if entry.path_is_symlink() && !self.config.follow_symlinks {
                debug!("Not following symbolic link {}", entry.path().display());
                sink.emit(&Event::FileSkipped {
                    path: relative_path(root, entry.path()),
                    reason: "symbolic link not followed".to_string(),
                });
                *skipped_files += 1;
                continue;
            }

            if !entry.file_type().is_file() {
                continue;
            }

            let relative = relative_path(root, entry.path());
            let modified_time = match entry.metadata().map_err(Error::from).and_then(|m| {
                modified_secs(&m).map_err(Error::from)
            }) {
                Ok(secs) => secs,
                Err(e) => {
                    warn!("Skipping {}: {}", entry.path().display(), e);
                    sink.emit(&Event::FileSkipped {
                        path: relative,
                        reason: e.to_string(),
                    });
                    *skipped_files += 1;
                    continue;
                }
            };

            candidates.push(Candidate {
                path: entry.into_path(),
                relative,
                modified_time,
            });
        }

        candidates
    }

    /// Record a single file, reusing the cache entry when it still applies
    fn process_file(&self, candidate: &Candidate, cached: Option<&CacheEntry>) -> Result<FileOutcome> {
        let path = candidate.path.as_path();
        let span = span!(Level::DEBUG, "process_file", path = %candidate.relative);
        let _enter = span.enter();

        let assessment = assess(cached, candidate.modified_time, || hash_file(path))
            .map_err(|e| Error::source_read(path, e))?;

        let file_hash = match assessment {
            Assessment::Unchanged(entry) => match entry.to_record(&candidate.relative) {
                Some(record) => return Ok(FileOutcome::unchanged(record)),
                None => hash_file(path).map_err(|e| Error::source_read(path, e))?,
            },
            Assessment::Changed(file_hash) => file_hash,
        };

        if let Some(known_ref) = self.registry.lookup(&file_hash) {
            debug!("{} matches known file {}", candidate.relative, known_ref);
            return Ok(FileOutcome {
                record: FileRecord::known_file_ref(candidate.relative.clone(), file_hash, known_ref),
                changed: true,
                chunks_written: 0,
                bytes_written: 0,
            });
        }

        let file = File::open(path).map_err(|e| Error::source_read(path, e))?;
        let mut whole = Hasher::new();
        let mut chunk_hashes = Vec::new();
        let mut chunks_written = 0;
        let mut bytes_written = 0;

        for chunk in FixedChunker::new(BufReader::new(file), self.config.chunk_size) {
            let chunk = chunk.map_err(|e| Error::source_read(path, e))?;
            whole.update(&chunk);

            let hash = Digest::of(&chunk);
            if self.chunk_store.put(&hash, &chunk)? {
                chunks_written += 1;
                bytes_written += chunk.len() as u64;
            }
            chunk_hashes.push(hash);
        }

        // The recorded hash must describe the bytes that were actually chunked.
        let chunked_hash = whole.finalize();
        if chunked_hash != file_hash {
            warn!("{} changed while being read; recording the chunked content", candidate.relative);
        }

        Ok(FileOutcome {
            record: FileRecord::chunked(candidate.relative.clone(), chunked_hash, chunk_hashes),
            changed: true,
            chunks_written,
            bytes_written,
        })
    }

    /// Check if a relative path should be excluded based on patterns
    fn should_exclude(&self, relative: &str) -> bool {
        self.config
            .exclude_patterns
            .iter()
            .any(|pattern| matches_pattern(relative, pattern))
    }
}

/// Simple pattern matching (supports a single `*` wildcard or a path segment)
fn matches_pattern(text: &str, pattern: &str) -> bool {
    if pattern == "*" {
        return true;
    }

    if let Some((prefix, suffix)) = pattern.split_once('*') {
        if !suffix.contains('*') {
            let file_name = text.rsplit('/').next().unwrap_or(text);
            return [text, file_name]
                .iter()
                .any(|t| t.len() >= prefix.len() + suffix.len() && t.starts_with(prefix) && t.ends_with(suffix));
        }
    }

    text == pattern || text.split('/').any(|part| part == pattern)
}

/// `/`-separated path of `path` relative to `root`
fn relative_path(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Absolute form of a path that may not exist yet, with symlinked parents resolved
fn absolutize(path: &Path) -> Result<PathBuf> {
    if let Ok(resolved) = fs::canonicalize(path) {
        return Ok(resolved);
    }

    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        env::current_dir()?.join(path)
    };

    let resolved = match (absolute.parent(), absolute.file_name()) {
        (Some(parent), Some(name)) => fs::canonicalize(parent).ok().map(|p| p.join(name)),
        _ => None,
    };
    Ok(resolved.unwrap_or(absolute))
}
