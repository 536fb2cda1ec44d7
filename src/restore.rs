//! Restore functionality for reconstructing files from snapshots
//!
//! Restores never stop at the first problem. Missing chunks, per-file hash
//! mismatches, unknown methods and unsafe paths are reported through the
//! event sink and collected in the [`RestoreReport`]; only an unreadable
//! or structurally invalid manifest aborts the whole operation.

use crate::chunk::ChunkStore;
use crate::events::{Event, EventSink};
use crate::hash::{hash_file, Digest, Hasher};
use crate::manifest::{FileRecord, Manifest, Method, SealCheck, MANIFEST_VERSION};
use crate::registry::KnownFileResolver;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, span, Level};

/// Configuration for restore operations
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreOptions {
    /// Reconstruct and verify every file without writing anything
    pub dry_run: bool,
    /// Abort before writing anything when the manifest seal does not match
    pub fail_on_tamper: bool,
}

/// Result of a restore operation
#[derive(Debug, Default)]
pub struct RestoreReport {
    /// Seal status of the manifest that was restored
    pub seal: Option<SealCheck>,
    /// Records in the manifest
    pub files_total: usize,
    /// Files written (or, in a dry run, reconstructed)
    pub files_restored: usize,
    /// Known-file references written as empty placeholders
    pub placeholders: usize,
    /// Records skipped for an unknown method or unsafe path
    pub files_skipped: usize,
    /// Files that could not be written at all
    pub files_failed: usize,
    pub missing_chunks: usize,
    pub hash_mismatches: usize,
    pub bytes_written: u64,
    /// Every problem encountered, keyed by manifest path
    pub errors: Vec<(String, Error)>,
    pub duration: Duration,
}

impl RestoreReport {
    pub fn manifest_intact(&self) -> bool {
        self.seal.as_ref().map_or(false, SealCheck::is_intact)
    }

    /// Intact manifest and every file reproduced exactly
    pub fn is_clean(&self) -> bool {
        self.manifest_intact() && self.errors.is_empty() && self.placeholders == 0
    }

    fn warning_count(&self) -> usize {
        self.errors.len() + usize::from(!self.manifest_intact())
    }
}

/// Destination for reconstructed bytes, hashing as it goes
struct Output {
    writer: Option<(PathBuf, BufWriter<File>)>,
    hasher: Hasher,
    bytes: u64,
}

impl Output {
    fn create(target: Option<&Path>) -> Result<Self> {
        let writer = match target {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                Some((path.to_path_buf(), BufWriter::new(File::create(path)?)))
            }
            None => None,
        };

        Ok(Self {
            writer,
            hasher: Hasher::new(),
            bytes: 0,
        })
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        if let Some((_, writer)) = self.writer.as_mut() {
            writer.write_all(data)?;
        }
        self.hasher.update(data);
        self.bytes += data.len() as u64;
        Ok(())
    }

    /// Flush and return the byte count and the digest of what ended up on disk
    fn finish(self) -> Result<(u64, Digest)> {
        match self.writer {
            Some((path, writer)) => {
                let file = writer.into_inner().map_err(|e| Error::Io(e.into_error()))?;
                file.sync_all()?;
                drop(file);
                Ok((self.bytes, hash_file(&path)?))
            }
            None => Ok((self.bytes, self.hasher.finalize())),
        }
    }
}

/// Restore engine for reconstructing files from snapshots
pub struct RestoreEngine {
    chunk_store: ChunkStore,
    resolver: Option<Box<dyn KnownFileResolver>>,
    options: RestoreOptions,
}

impl RestoreEngine {
    /// Create a new restore engine reading from `chunk_store`
    pub fn new(chunk_store: ChunkStore) -> Self {
        Self {
            chunk_store,
            resolver: None,
            options: RestoreOptions::default(),
        }
    }

    pub fn with_options(mut self, options: RestoreOptions) -> Self {
        self.options = options;
        self
    }

    /// Serve known-file references from `resolver` instead of placeholders
    pub fn with_resolver<R: KnownFileResolver + 'static>(mut self, resolver: R) -> Self {
        self.resolver = Some(Box::new(resolver));
        self
    }

    pub fn options(&self) -> &RestoreOptions {
        &self.options
    }

    /// Restore the snapshot described by `manifest_path` into `output_dir`
    pub fn restore<P: AsRef<Path>, Q: AsRef<Path>>(
        &self,
        manifest_path: P,
        output_dir: Q,
        sink: &mut dyn EventSink,
    ) -> Result<RestoreReport> {
        let target = (!self.options.dry_run).then(|| output_dir.as_ref());
        self.run(manifest_path.as_ref(), target, sink)
    }

    /// Check the seal and reconstruct every file in memory without writing
    pub fn verify<P: AsRef<Path>>(&self, manifest_path: P, sink: &mut dyn EventSink) -> Result<RestoreReport> {
        self.run(manifest_path.as_ref(), None, sink)
    }

    fn run(
        &self,
        manifest_path: &Path,
        output_dir: Option<&Path>,
        sink: &mut dyn EventSink,
    ) -> Result<RestoreReport> {
        let start_time = Instant::now();

        let span = span!(Level::INFO, "restore", manifest = %manifest_path.display());
        let _enter = span.enter();

        sink.emit(&Event::RestoreStarted {
            manifest: manifest_path.to_path_buf(),
            target: output_dir.map(Path::to_path_buf),
        });

        let (manifest, seal) = Manifest::load_verified(manifest_path)?;
        info!(
            "Restoring {} files snapshotted from {} at {}",
            manifest.files.len(),
            manifest.root_directory,
            manifest.timestamp
        );

        if manifest.version > MANIFEST_VERSION {
            sink.emit(&Event::UnsupportedVersion {
                version: manifest.version,
            });
        }

        if !seal.is_intact() {
            sink.emit(&Event::ManifestTampered {
                expected: seal.expected.clone(),
                computed: seal.computed.clone(),
                canonical: seal.canonical,
            });
            if self.options.fail_on_tamper {
                return Err(Error::IntegrityMismatch {
                    subject: manifest_path.display().to_string(),
                    expected: seal.expected.to_string(),
                    actual: seal.computed.to_string(),
                });
            }
        }

        if let Some(dir) = output_dir {
            fs::create_dir_all(dir)?;
        }

        let mut report = RestoreReport {
            seal: Some(seal),
            files_total: manifest.files.len(),
            ..RestoreReport::default()
        };

        for record in &manifest.files {
            self.restore_record(record, output_dir, &mut report, sink);
        }

        report.duration = start_time.elapsed();
        info!(
            "Restore completed: {} restored, {} placeholders, {} skipped, {} failed in {:?}",
            report.files_restored,
            report.placeholders,
            report.files_skipped,
            report.files_failed,
            report.duration
        );
        sink.emit(&Event::RestoreCompleted {
            target: output_dir.map(Path::to_path_buf),
            files_restored: report.files_restored,
            warnings: report.warning_count(),
        });

        Ok(report)
    }

    /// Restore one record, recording every problem instead of returning it
    fn restore_record(
        &self,
        record: &FileRecord,
        output_dir: Option<&Path>,
        report: &mut RestoreReport,
        sink: &mut dyn EventSink,
    ) {
        let path = record.path.clone();

        let Some(relative) = safe_relative_path(&record.path) else {
            sink.emit(&Event::UnsafePath { path: path.clone() });
            report.files_skipped += 1;
            report.errors.push((path.clone(), Error::UnsafePath { path }));
            return;
        };
        let target = output_dir.map(|dir| dir.join(relative));

        let result = match &record.method {
            Method::Chunked => self.restore_chunked(record, target.as_deref(), report, sink),
            Method::KnownFileRef => self.restore_known(record, target.as_deref(), report, sink),
            Method::Unknown(method) => {
                sink.emit(&Event::UnknownMethod {
                    path: path.clone(),
                    method: method.clone(),
                });
                report.files_skipped += 1;
                report.errors.push((
                    path.clone(),
                    Error::UnknownMethod {
                        path,
                        method: method.clone(),
                    },
                ));
                return;
            }
        };

        if let Err(e) = result {
            sink.emit(&Event::FileFailed {
                path: path.clone(),
                reason: e.to_string(),
            });
            report.files_failed += 1;
            report.errors.push((path, e));
        }
    }

    /// Concatenate the recorded chunks, skipping any that are missing
    fn restore_chunked(
        &self,
        record: &FileRecord,
        target: Option<&Path>,
        report: &mut RestoreReport,
        sink: &mut dyn EventSink,
    ) -> Result<()> {
        let mut output = Output::create(target)?;

        for hash in record.chunks() {
            match self.chunk_store.get(hash) {
                Ok(data) => output.write_all(&data)?,
                Err(Error::MissingChunk { hash: missing }) => {
                    sink.emit(&Event::MissingChunk {
                        path: record.path.clone(),
                        hash: hash.clone(),
                    });
                    report.missing_chunks += 1;
                    report
                        .errors
                        .push((record.path.clone(), Error::MissingChunk { hash: missing }));
                }
                Err(e) => return Err(e),
            }
        }

        let (bytes, actual) = output.finish()?;
        report.files_restored += 1;
        report.bytes_written += bytes;
        self.check_file_hash(record, actual, report, sink);
        Ok(())
    }

    /// Serve a known-file reference from the resolver, or write a placeholder
    fn restore_known(
        &self,
        record: &FileRecord,
        target: Option<&Path>,
        report: &mut RestoreReport,
        sink: &mut dyn EventSink,
    ) -> Result<()> {
        let known_ref = record.known_ref.clone().unwrap_or_default();
        let resolved = self
            .resolver
            .as_ref()
            .and_then(|resolver| resolver.resolve(&known_ref, &record.file_hash));

        let mut output = Output::create(target)?;
        match resolved {
            Some(content) => {
                output.write_all(&content)?;
                let (bytes, actual) = output.finish()?;
                sink.emit(&Event::KnownFileResolved {
                    path: record.path.clone(),
                    known_ref,
                });
                report.files_restored += 1;
                report.bytes_written += bytes;
                self.check_file_hash(record, actual, report, sink);
            }
            None => {
                output.finish()?;
                debug!("No resolver content for {}, writing placeholder", known_ref);
                sink.emit(&Event::PlaceholderWritten {
                    path: record.path.clone(),
                    known_ref,
                });
                report.placeholders += 1;
            }
        }

        Ok(())
    }

    fn check_file_hash(
        &self,
        record: &FileRecord,
        actual: Digest,
        report: &mut RestoreReport,
        sink: &mut dyn EventSink,
    ) {
        if actual == record.file_hash {
            sink.emit(&Event::FileRestored {
                path: record.path.clone(),
            });
            return;
        }

        sink.emit(&Event::FileHashMismatch {
            path: record.path.clone(),
            expected: record.file_hash.clone(),
            actual: actual.clone(),
        });
        report.hash_mismatches += 1;
        report.errors.push((
            record.path.clone(),
            Error::IntegrityMismatch {
                subject: record.path.clone(),
                expected: record.file_hash.to_string(),
                actual: actual.to_string(),
            },
        ));
    }
}

/// Relative path for a manifest entry, or `None` if it could escape the output directory
fn safe_relative_path(path: &str) -> Option<PathBuf> {
    let mut relative = PathBuf::new();

    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }

    (!relative.as_os_str().is_empty()).then_some(relative)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventLog;
    use crate::hash::digest;
    use crate::manifest::ManifestBuilder;
    use tempfile::TempDir;

    struct Fixture {
        temp: TempDir,
        store: ChunkStore,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = TempDir::new().unwrap();
            let store = ChunkStore::open(temp.path().join("store")).unwrap();
            Self { temp, store }
        }

        fn chunked(&self, path: &str, pieces: &[&[u8]]) -> FileRecord {
            let mut hashes = Vec::new();
            for piece in pieces {
                let hash = digest(piece);
                self.store.put(&hash, piece).unwrap();
                hashes.push(hash);
            }
            FileRecord::chunked(path, digest(&pieces.concat()), hashes)
        }

        fn write_manifest(&self, records: Vec<FileRecord>) -> PathBuf {
            let mut builder = ManifestBuilder::new("/original");
            for record in records {
                builder.push(record);
            }
            let path = self.temp.path().join("snapshot.json");
            builder.finish().unwrap().save(&path).unwrap();
            path
        }

        fn output(&self) -> PathBuf {
            self.temp.path().join("restored")
        }
    }

    #[test]
    fn test_safe_relative_path() {
        assert_eq!(safe_relative_path("a/b.txt"), Some(PathBuf::from("a/b.txt")));
        assert_eq!(safe_relative_path("./a.txt"), Some(PathBuf::from("a.txt")));
        assert_eq!(safe_relative_path("../escape"), None);
        assert_eq!(safe_relative_path("a/../../escape"), None);
        assert_eq!(safe_relative_path("/etc/passwd"), None);
        assert_eq!(safe_relative_path(""), None);
    }

    #[test]
    fn test_restore_chunked_files() -> Result<()> {
        let fx = Fixture::new();
        let records = vec![
            fx.chunked("a.txt", &[b"hello ", b"world"]),
            fx.chunked("nested/deep/b.bin", &[b"xyz", b"xyz"]),
            fx.chunked("empty", &[]),
        ];
        let manifest = fx.write_manifest(records);

        let mut log = EventLog::new();
        let report = RestoreEngine::new(fx.store.clone()).restore(&manifest, fx.output(), &mut log)?;

        assert!(report.is_clean(), "{:?}", log.lines());
        assert_eq!(report.files_restored, 3);
        assert_eq!(fs::read(fx.output().join("a.txt"))?, b"hello world");
        assert_eq!(fs::read(fx.output().join("nested/deep/b.bin"))?, b"xyzxyz");
        assert_eq!(fs::read(fx.output().join("empty"))?, b"");
        Ok(())
    }

    #[test]
    fn test_missing_chunk_continues() -> Result<()> {
        let fx = Fixture::new();
        let broken = fx.chunked("broken.txt", &[b"first", b"second", b"third"]);
        let intact = fx.chunked("intact.txt", &[b"fine"]);
        let manifest = fx.write_manifest(vec![broken, intact]);

        fs::remove_file(fx.store.chunks_path().join(format!("{}.bin", digest(b"second"))))?;

        let mut log = EventLog::new();
        let report = RestoreEngine::new(fx.store.clone()).restore(&manifest, fx.output(), &mut log)?;

        assert_eq!(fs::read(fx.output().join("broken.txt"))?, b"firstthird");
        assert_eq!(fs::read(fx.output().join("intact.txt"))?, b"fine");
        assert_eq!(report.missing_chunks, 1);
        assert_eq!(report.hash_mismatches, 1);
        assert_eq!(report.files_restored, 2);
        assert!(log.events().iter().any(|e| matches!(e, Event::MissingChunk { .. })));
        assert!(log.events().iter().any(|e| matches!(e, Event::FileHashMismatch { .. })));
        Ok(())
    }

    #[test]
    fn test_known_ref_placeholder() -> Result<()> {
        let fx = Fixture::new();
        let manifest = fx.write_manifest(vec![FileRecord::known_file_ref(
            "sys/msvcrt.dll",
            digest(b"system"),
            "msvcrt@v6.0",
        )]);

        let mut log = EventLog::new();
        let report = RestoreEngine::new(fx.store.clone()).restore(&manifest, fx.output(), &mut log)?;

        assert_eq!(report.placeholders, 1);
        assert!(report.errors.is_empty());
        assert!(!report.is_clean());
        assert_eq!(fs::read(fx.output().join("sys/msvcrt.dll"))?, b"");
        assert!(log.lines().iter().any(|l| l.contains("placeholder")));
        Ok(())
    }

    #[test]
    fn test_known_ref_resolver() -> Result<()> {
        let fx = Fixture::new();
        let manifest = fx.write_manifest(vec![FileRecord::known_file_ref(
            "sys/msvcrt.dll",
            digest(b"system"),
            "msvcrt@v6.0",
        )]);

        let engine = RestoreEngine::new(fx.store.clone())
            .with_resolver(|known_ref: &str, _: &Digest| (known_ref == "msvcrt@v6.0").then(|| b"system".to_vec()));
        let report = engine.restore(&manifest, fx.output(), &mut EventLog::new())?;

        assert!(report.is_clean());
        assert_eq!(fs::read(fx.output().join("sys/msvcrt.dll"))?, b"system");
        Ok(())
    }

    #[test]
    fn test_unknown_method_and_unsafe_path_are_skipped() -> Result<()> {
        let fx = Fixture::new();
        let mut future = fx.chunked("future.txt", &[b"data"]);
        future.method = Method::Unknown("delta".to_string());
        let escape = fx.chunked("../escape.txt", &[b"data"]);
        let fine = fx.chunked("fine.txt", &[b"data"]);
        let manifest = fx.write_manifest(vec![future, escape, fine]);

        let report = RestoreEngine::new(fx.store.clone()).restore(&manifest, fx.output(), &mut EventLog::new())?;

        assert_eq!(report.files_skipped, 2);
        assert_eq!(report.files_restored, 1);
        assert!(!fx.output().join("future.txt").exists());
        assert!(!fx.temp.path().join("escape.txt").exists());
        assert!(report
            .errors
            .iter()
            .any(|(_, e)| matches!(e, Error::UnknownMethod { .. })));
        Ok(())
    }

    #[test]
    fn test_tampered_manifest_warns_then_restores() -> Result<()> {
        let fx = Fixture::new();
        let manifest = fx.write_manifest(vec![fx.chunked("a.txt", &[b"abc"])]);
        let text = fs::read_to_string(&manifest)?.replace("/original", "/forged!!");
        fs::write(&manifest, text)?;

        let mut log = EventLog::new();
        let report = RestoreEngine::new(fx.store.clone()).restore(&manifest, fx.output(), &mut log)?;

        assert!(!report.manifest_intact());
        assert_eq!(fs::read(fx.output().join("a.txt"))?, b"abc");
        assert!(matches!(log.events()[1], Event::ManifestTampered { .. }));
        Ok(())
    }

    #[test]
    fn test_fail_on_tamper() -> Result<()> {
        let fx = Fixture::new();
        let manifest = fx.write_manifest(vec![fx.chunked("a.txt", &[b"abc"])]);
        let text = fs::read_to_string(&manifest)?.replace("a.txt", "b.txt");
        fs::write(&manifest, text)?;

        let engine = RestoreEngine::new(fx.store.clone()).with_options(RestoreOptions {
            fail_on_tamper: true,
            ..RestoreOptions::default()
        });
        let result = engine.restore(&manifest, fx.output(), &mut EventLog::new());

        assert!(matches!(result, Err(Error::IntegrityMismatch { .. })));
        assert!(!fx.output().exists());
        Ok(())
    }

    #[test]
    fn test_malformed_manifest_is_fatal() -> Result<()> {
        let fx = Fixture::new();
        let manifest = fx.temp.path().join("snapshot.json");
        fs::write(&manifest, br#"{"version": 1, "files": "nope"}"#)?;

        let result = RestoreEngine::new(fx.store.clone()).restore(&manifest, fx.output(), &mut EventLog::new());
        assert!(matches!(result, Err(Error::MalformedManifest { .. })));
        Ok(())
    }

    #[test]
    fn test_verify_writes_nothing() -> Result<()> {
        let fx = Fixture::new();
        let manifest = fx.write_manifest(vec![fx.chunked("a.txt", &[b"abc", b"def"])]);

        let report = RestoreEngine::new(fx.store.clone()).verify(&manifest, &mut EventLog::new())?;

        assert!(report.is_clean());
        assert_eq!(report.bytes_written, 6);
        assert!(!fx.output().exists());
        Ok(())
    }

    #[test]
    fn test_dry_run_detects_missing_chunk() -> Result<()> {
        let fx = Fixture::new();
        let manifest = fx.write_manifest(vec![fx.chunked("a.txt", &[b"abc", b"def"])]);
        fs::remove_file(fx.store.chunks_path().join(format!("{}.bin", digest(b"abc"))))?;

        let engine = RestoreEngine::new(fx.store.clone()).with_options(RestoreOptions {
            dry_run: true,
            ..RestoreOptions::default()
        });
        let report = engine.restore(&manifest, fx.output(), &mut EventLog::new())?;

        assert_eq!(report.missing_chunks, 1);
        assert_eq!(report.hash_mismatches, 1);
        assert!(!fx.output().exists());
        Ok(())
    }
}
