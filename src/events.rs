//! Progress and diagnostic events emitted by the engines.
//!
//! Front ends receive events through an [`EventSink`]. Any
//! `FnMut(&Event)` closure is a sink, [`TracingSink`] forwards events to
//! `tracing`, and [`EventLog`] records them for later inspection. Every
//! event renders as a single human-readable log line via `Display`.

use crate::hash::Digest;
use crate::manifest::Method;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use tracing::{error, info, warn};

/// How serious an event is
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Events emitted while taking or restoring a snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// Snapshot traversal started
    SnapshotStarted { root: PathBuf },
    /// File was new or modified and has been recorded afresh
    FileChanged { path: String, method: Method },
    /// File record carried over from the change cache
    FileUnchanged { path: String },
    /// File could not be read and is absent from the manifest
    FileSkipped { path: String, reason: String },
    /// Sealed manifest has been written
    SnapshotCompleted {
        manifest: PathBuf,
        total_files: usize,
        changed_files: usize,
        chunk_store: PathBuf,
    },
    /// Restore started; no target means a verify-only pass
    RestoreStarted {
        manifest: PathBuf,
        target: Option<PathBuf>,
    },
    /// Manifest version is newer than this build understands
    UnsupportedVersion { version: u32 },
    /// Stored seal does not match the manifest content, or the bytes on
    /// disk are not the canonical encoding of what they describe
    ManifestTampered {
        expected: Digest,
        computed: Digest,
        canonical: bool,
    },
    /// Chunk referenced by a file is not in the store
    MissingChunk { path: String, hash: Digest },
    /// Reconstructed content does not hash to the recorded value
    FileHashMismatch {
        path: String,
        expected: Digest,
        actual: Digest,
    },
    /// Known-file reference written as an empty placeholder
    PlaceholderWritten { path: String, known_ref: String },
    /// Known-file reference served by a resolver
    KnownFileResolved { path: String, known_ref: String },
    /// Record uses a method this build cannot restore
    UnknownMethod { path: String, method: String },
    /// Record path would escape the output directory
    UnsafePath { path: String },
    /// File could not be written
    FileFailed { path: String, reason: String },
    /// File reconstructed and verified
    FileRestored { path: String },
    /// Restore finished
    RestoreCompleted {
        target: Option<PathBuf>,
        files_restored: usize,
        warnings: usize,
    },
}

impl Event {
    pub fn severity(&self) -> Severity {
        match self {
            Event::ManifestTampered { .. }
            | Event::UnsupportedVersion { .. }
            | Event::FileHashMismatch { .. }
            | Event::UnknownMethod { .. }
            | Event::FileSkipped { .. } => Severity::Warning,
            Event::MissingChunk { .. } | Event::UnsafePath { .. } | Event::FileFailed { .. } => {
                Severity::Error
            }
            _ => Severity::Info,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::SnapshotStarted { root } => write!(f, "Snapshot of {} started", root.display()),
            Event::FileChanged { path, method } => write!(f, "Changed: {} ({})", path, method),
            Event::FileUnchanged { path } => write!(f, "Unchanged: {}", path),
            Event::FileSkipped { path, reason } => write!(f, "WARNING: Skipped {}: {}", path, reason),
            Event::SnapshotCompleted {
                manifest,
                total_files,
                changed_files,
                chunk_store,
            } => write!(
                f,
                "Snapshot created: {}. Total files scanned: {}, changed: {}. Chunk store: {}",
                manifest.display(),
                total_files,
                changed_files,
                chunk_store.display()
            ),
            Event::RestoreStarted { manifest, target } => match target {
                Some(target) => write!(
                    f,
                    "Restoring {} into {}",
                    manifest.display(),
                    target.display()
                ),
                None => write!(f, "Verifying {}", manifest.display()),
            },
            Event::UnsupportedVersion { version } => write!(
                f,
                "WARNING: Manifest version {} is newer than supported; restoring what is understood",
                version
            ),
            Event::ManifestTampered {
                expected,
                computed,
                canonical,
            } => {
                write!(
                    f,
                    "WARNING: Snapshot might be tampered. Hash mismatch. Expected: {}, got: {}",
                    expected, computed
                )?;
                if !canonical {
                    f.write_str(" (manifest bytes are not in canonical form)")?;
                }
                Ok(())
            }
            Event::MissingChunk { path, hash } => {
                write!(f, "ERROR: Missing chunk {} for {}", hash, path)
            }
            Event::FileHashMismatch {
                path,
                expected,
                actual,
            } => write!(
                f,
                "WARNING: Hash mismatch for {}. Expected {}, got {}",
                path, expected, actual
            ),
            Event::PlaceholderWritten { path, known_ref } => write!(
                f,
                "Restored known-file-ref {} ({}) as empty placeholder",
                path, known_ref
            ),
            Event::KnownFileResolved { path, known_ref } => {
                write!(f, "Restored known-file-ref {} from {}", path, known_ref)
            }
            Event::UnknownMethod { path, method } => {
                write!(f, "WARNING: Unknown method {} for file {}; skipping", method, path)
            }
            Event::UnsafePath { path } => {
                write!(f, "ERROR: Refusing to restore {} outside the output directory", path)
            }
            Event::FileFailed { path, reason } => {
                write!(f, "ERROR: Failed to restore {}: {}", path, reason)
            }
            Event::FileRestored { path } => write!(f, "Restored: {}", path),
            Event::RestoreCompleted {
                target,
                files_restored,
                warnings,
            } => match target {
                Some(target) => write!(
                    f,
                    "Restore complete. {} files, {} warnings. Output at: {}",
                    files_restored,
                    warnings,
                    target.display()
                ),
                None => write!(
                    f,
                    "Verification complete. {} files, {} warnings",
                    files_restored, warnings
                ),
            },
        }
    }
}

/// Receives engine events
pub trait EventSink {
    fn emit(&mut self, event: &Event);
}

impl<F> EventSink for F
where
    F: FnMut(&Event),
{
    fn emit(&mut self, event: &Event) {
        self(event)
    }
}

/// Forwards events to `tracing` at a level matching their severity
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&mut self, event: &Event) {
        match event.severity() {
            Severity::Info => info!("{}", event),
            Severity::Warning => warn!("{}", event),
            Severity::Error => error!("{}", event),
        }
    }
}

/// Records every event it receives
#[derive(Debug, Default, Clone)]
pub struct EventLog {
    events: Vec<Event>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Events at warning severity or above
    pub fn problems(&self) -> impl Iterator<Item = &Event> {
        self.events.iter().filter(|e| e.severity() >= Severity::Warning)
    }

    /// Rendered log lines
    pub fn lines(&self) -> Vec<String> {
        self.events.iter().map(ToString::to_string).collect()
    }
}

impl EventSink for EventLog {
    fn emit(&mut self, event: &Event) {
        self.events.push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::digest;

    #[test]
    fn test_closure_sink_receives_lines() {
        let mut lines = Vec::new();
        {
            let mut sink = |event: &Event| lines.push(event.to_string());
            sink.emit(&Event::FileUnchanged {
                path: "a.txt".to_string(),
            });
        }
        assert_eq!(lines, vec!["Unchanged: a.txt".to_string()]);
    }

    #[test]
    fn test_event_log_filters_problems() {
        let mut log = EventLog::new();
        log.emit(&Event::FileRestored {
            path: "ok.txt".to_string(),
        });
        log.emit(&Event::MissingChunk {
            path: "bad.txt".to_string(),
            hash: digest(b"gone"),
        });

        assert_eq!(log.events().len(), 2);
        assert_eq!(log.problems().count(), 1);
        assert!(log.lines()[1].starts_with("ERROR: Missing chunk"));
    }

    #[test]
    fn test_tamper_line_names_both_digests() {
        let event = Event::ManifestTampered {
            expected: digest(b"a"),
            computed: digest(b"b"),
            canonical: true,
        };
        let line = event.to_string();
        assert!(line.contains(digest(b"a").as_str()));
        assert!(line.contains(digest(b"b").as_str()));
        assert_eq!(event.severity(), Severity::Warning);
    }

    #[test]
    fn test_events_serialize_tagged() {
        let value = serde_json::to_value(Event::FileChanged {
            path: "a".to_string(),
            method: Method::Chunked,
        })
        .unwrap();
        assert_eq!(value["event"], "file_changed");
        assert_eq!(value["method"], "chunked");
    }
}
