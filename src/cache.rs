//! Change detection cache carried between snapshot runs
//!
//! The cache remembers, per relative path, the modification time and hash
//! seen on the last run together with how the file was recorded. A run
//! consults it to avoid rereading files that have not changed.
//!
//! Relative paths only identify a file within one snapshot root, so the
//! cache records the root it describes and is emptied when bound to another.
//!
//! Files whose content changes while their modification time stays within
//! [`MTIME_TOLERANCE_SECS`] of the cached value (clock skew, mtime-preserving
//! copies) are treated as unchanged. That is a known limitation of
//! mtime-based detection.

use crate::hash::Digest;
use crate::manifest::{write_atomic, FileRecord, Method};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, Metadata};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::{debug, warn};

/// Cache file format version
pub const CACHE_VERSION: u32 = 1;

/// Default cache file name inside the store directory
pub const DEFAULT_CACHE_FILE: &str = "cache.json";

/// Modification times closer than this are considered equal
pub const MTIME_TOLERANCE_SECS: f64 = 1.0;

/// Last known state of one file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub file_hash: Digest,
    /// Seconds since the Unix epoch
    pub modified_time: f64,
    pub method: Method,
    #[serde(default)]
    pub chunk_hashes: Vec<Digest>,
    #[serde(default)]
    pub known_ref: Option<String>,
}

impl CacheEntry {
    /// Mirror a freshly produced file record
    pub fn from_record(record: &FileRecord, modified_time: f64) -> Self {
        Self {
            file_hash: record.file_hash.clone(),
            modified_time,
            method: record.method.clone(),
            chunk_hashes: record.chunks().to_vec(),
            known_ref: record.known_ref.clone(),
        }
    }

    /// Rebuild the file record this entry was taken from.
    ///
    /// Returns `None` for methods the engine cannot carry over.
    pub fn to_record(&self, path: &str) -> Option<FileRecord> {
        match &self.method {
            Method::Chunked => Some(FileRecord::chunked(
                path,
                self.file_hash.clone(),
                self.chunk_hashes.clone(),
            )),
            Method::KnownFileRef => self
                .known_ref
                .as_ref()
                .map(|known_ref| FileRecord::known_file_ref(path, self.file_hash.clone(), known_ref.clone())),
            Method::Unknown(_) => None,
        }
    }

    fn is_reusable(&self) -> bool {
        match self.method {
            Method::Chunked => true,
            Method::KnownFileRef => self.known_ref.is_some(),
            Method::Unknown(_) => false,
        }
    }
}

/// Result of comparing a file on disk with its cache entry
#[derive(Debug, Clone, PartialEq)]
pub enum Assessment<'a> {
    /// Content is taken to be identical to the cached entry
    Unchanged(&'a CacheEntry),
    /// New or modified file, with its freshly computed hash
    Changed(Digest),
}

/// On-disk layout of the cache file
#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheFile {
    version: u32,
    #[serde(default)]
    root_directory: Option<String>,
    files: BTreeMap<String, CacheEntry>,
}

/// Per-path change cache with an explicit load/persist lifecycle
#[derive(Debug)]
pub struct ChangeCache {
    path: PathBuf,
    root_directory: Option<String>,
    entries: BTreeMap<String, CacheEntry>,
}

impl ChangeCache {
    /// Empty cache that will persist to `path`
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            root_directory: None,
            entries: BTreeMap::new(),
        }
    }

    /// Load the cache from `path`.
    ///
    /// A missing file yields an empty cache. An unreadable format is logged
    /// and discarded since the cache only ever saves work.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut cache = Self::new(path);

        let raw = match fs::read(&cache.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No change cache at {}, starting fresh", cache.path.display());
                return Ok(cache);
            }
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice::<CacheFile>(&raw) {
            Ok(file) if file.version == CACHE_VERSION => {
                debug!("Loaded {} cache entries from {}", file.files.len(), cache.path.display());
                cache.root_directory = file.root_directory;
                cache.entries = file.files;
            }
            Ok(file) => {
                warn!(
                    "Ignoring change cache {} with unsupported version {}",
                    cache.path.display(),
                    file.version
                );
            }
            Err(e) => {
                warn!("Ignoring unreadable change cache {}: {}", cache.path.display(), e);
            }
        }

        Ok(cache)
    }

    /// Write the cache atomically to its path
    pub fn persist(&self) -> Result<()> {
        let file = CacheFile {
            version: CACHE_VERSION,
            root_directory: self.root_directory.clone(),
            files: self.entries.clone(),
        };
        write_atomic(&self.path, &serde_json::to_vec_pretty(&file)?)?;
        debug!("Persisted {} cache entries to {}", self.entries.len(), self.path.display());
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot root the entries belong to
    pub fn root_directory(&self) -> Option<&str> {
        self.root_directory.as_deref()
    }

    /// Scope the cache to `root_directory`, dropping entries recorded for any other root
    pub fn bind_root(&mut self, root_directory: &str) {
        if self.root_directory.as_deref() == Some(root_directory) {
            return;
        }

        if !self.entries.is_empty() {
            warn!(
                "Change cache {} describes {}, not {}; discarding {} entries",
                self.path.display(),
                self.root_directory.as_deref().unwrap_or("an unknown root"),
                root_directory,
                self.entries.len()
            );
            self.entries.clear();
        }
        self.root_directory = Some(root_directory.to_string());
    }

    /// Keep only the entries whose path satisfies `keep`, returning how many were dropped
    pub fn retain<F>(&mut self, mut keep: F) -> usize
    where
        F: FnMut(&str) -> bool,
    {
        let before = self.entries.len();
        self.entries.retain(|path, _| keep(path));
        before - self.entries.len()
    }

    pub fn lookup(&self, path: &str) -> Option<&CacheEntry> {
        self.entries.get(path)
    }

    pub fn upsert(&mut self, path: impl Into<String>, entry: CacheEntry) {
        self.entries.insert(path.into(), entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Decide whether a file changed since it was cached.
///
/// `rehash` is only invoked when the cached entry cannot settle the
/// question on modification time alone.
pub fn assess<'a, F>(cached: Option<&'a CacheEntry>, modified_time: f64, rehash: F) -> io::Result<Assessment<'a>>
where
    F: FnOnce() -> io::Result<Digest>,
{
    let Some(entry) = cached.filter(|e| e.is_reusable()) else {
        return Ok(Assessment::Changed(rehash()?));
    };

    if (modified_time - entry.modified_time).abs() < MTIME_TOLERANCE_SECS {
        return Ok(Assessment::Unchanged(entry));
    }

    let file_hash = rehash()?;
    if file_hash == entry.file_hash {
        Ok(Assessment::Unchanged(entry))
    } else {
        Ok(Assessment::Changed(file_hash))
    }
}

/// Modification time in fractional seconds since the Unix epoch
pub fn modified_secs(metadata: &Metadata) -> io::Result<f64> {
    let modified = metadata.modified()?;
    Ok(match modified.duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_secs_f64(),
        Err(before) => -before.duration().as_secs_f64(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::digest;
    use std::cell::Cell;
    use tempfile::TempDir;

    fn chunked_entry(content: &[u8], modified_time: f64) -> CacheEntry {
        CacheEntry {
            file_hash: digest(content),
            modified_time,
            method: Method::Chunked,
            chunk_hashes: vec![digest(content)],
            known_ref: None,
        }
    }

    #[test]
    fn test_no_entry_is_changed() {
        let calls = Cell::new(0);
        let result = assess(None, 10.0, || {
            calls.set(calls.get() + 1);
            Ok(digest(b"new"))
        })
        .unwrap();

        assert_eq!(result, Assessment::Changed(digest(b"new")));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_close_mtime_skips_rehash() {
        let entry = chunked_entry(b"old", 100.0);
        let result = assess(Some(&entry), 100.4, || panic!("must not rehash")).unwrap();
        assert_eq!(result, Assessment::Unchanged(&entry));
    }

    #[test]
    fn test_mtime_moved_same_content_is_unchanged() {
        let entry = chunked_entry(b"same", 100.0);
        let result = assess(Some(&entry), 101.0, || Ok(digest(b"same"))).unwrap();
        assert_eq!(result, Assessment::Unchanged(&entry));
    }

    #[test]
    fn test_mtime_moved_new_content_is_changed() {
        let entry = chunked_entry(b"old", 100.0);
        let result = assess(Some(&entry), 250.0, || Ok(digest(b"new"))).unwrap();
        assert_eq!(result, Assessment::Changed(digest(b"new")));
    }

    #[test]
    fn test_unknown_method_entry_is_ignored() {
        let mut entry = chunked_entry(b"x", 100.0);
        entry.method = Method::Unknown("legacy".to_string());

        let result = assess(Some(&entry), 100.0, || Ok(digest(b"x"))).unwrap();
        assert_eq!(result, Assessment::Changed(digest(b"x")));
    }

    #[test]
    fn test_entry_record_round_trip() {
        let record = FileRecord::known_file_ref("lib/sys.dll", digest(b"sys"), "base@1");
        let entry = CacheEntry::from_record(&record, 5.5);
        assert_eq!(entry.to_record("lib/sys.dll"), Some(record));

        let chunked = FileRecord::chunked("a.txt", digest(b"a"), vec![digest(b"a")]);
        let entry = CacheEntry::from_record(&chunked, 1.0);
        assert_eq!(entry.to_record("a.txt"), Some(chunked));
    }

    #[test]
    fn test_load_missing_is_empty() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let cache = ChangeCache::load(temp_dir.path().join("cache.json"))?;
        assert!(cache.is_empty());
        Ok(())
    }

    #[test]
    fn test_load_corrupt_is_empty() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("cache.json");
        fs::write(&path, b"{ definitely not a cache")?;

        let cache = ChangeCache::load(&path)?;
        assert!(cache.is_empty());
        Ok(())
    }

    #[test]
    fn test_persist_and_reload() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("nested").join("cache.json");

        let mut cache = ChangeCache::new(&path);
        cache.upsert("a.txt", chunked_entry(b"a", 1_700_000_000.123_456));
        cache.upsert("b.txt", chunked_entry(b"b", 3.0));
        cache.upsert("a.txt", chunked_entry(b"a2", 4.0));
        cache.persist()?;

        let reloaded = ChangeCache::load(&path)?;
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.lookup("a.txt"), Some(&chunked_entry(b"a2", 4.0)));
        assert_eq!(reloaded.lookup("b.txt"), Some(&chunked_entry(b"b", 3.0)));
        assert_eq!(reloaded.lookup("c.txt"), None);
        Ok(())
    }

    #[test]
    fn test_entries_are_scoped_to_their_root() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("cache.json");

        let mut cache = ChangeCache::new(&path);
        cache.bind_root("/data/a");
        cache.upsert("config.txt", chunked_entry(b"a", 10.0));
        cache.persist()?;

        let mut same_root = ChangeCache::load(&path)?;
        assert_eq!(same_root.root_directory(), Some("/data/a"));
        same_root.bind_root("/data/a");
        assert_eq!(same_root.lookup("config.txt"), Some(&chunked_entry(b"a", 10.0)));

        let mut other_root = ChangeCache::load(&path)?;
        other_root.bind_root("/data/b");
        assert!(other_root.lookup("config.txt").is_none());
        assert_eq!(other_root.root_directory(), Some("/data/b"));
        Ok(())
    }

    #[test]
    fn test_cache_without_root_is_discarded_on_bind() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("cache.json");
        fs::write(
            &path,
            serde_json::to_vec(&serde_json::json!({
                "version": CACHE_VERSION,
                "files": { "a.txt": chunked_entry(b"a", 1.0) }
            }))?,
        )?;

        let mut cache = ChangeCache::load(&path)?;
        assert_eq!(cache.len(), 1);
        cache.bind_root("/data/a");
        assert!(cache.is_empty());
        Ok(())
    }

    #[test]
    fn test_retain_drops_unobserved_paths() {
        let mut cache = ChangeCache::new("cache.json");
        cache.upsert("kept.txt", chunked_entry(b"k", 1.0));
        cache.upsert("deleted.txt", chunked_entry(b"d", 1.0));

        let dropped = cache.retain(|path| path == "kept.txt");

        assert_eq!(dropped, 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.lookup("deleted.txt").is_none());
    }

    #[test]
    fn test_modified_secs_tracks_file() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("f");
        fs::write(&path, b"x")?;

        let secs = modified_secs(&fs::metadata(&path)?)?;
        assert!(secs > 1_000_000_000.0);
        Ok(())
    }
}
