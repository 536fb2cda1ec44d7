//! Error types for chunkvault

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for snapshot and restore operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to read source file {path}: {source}")]
    SourceRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Directory traversal error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("Chunk not found: {hash}")]
    MissingChunk { hash: String },

    #[error("Malformed chunk hash: '{hash}'")]
    MalformedHash { hash: String },

    #[error("Integrity mismatch for {subject}: expected {expected}, got {actual}")]
    IntegrityMismatch {
        subject: String,
        expected: String,
        actual: String,
    },

    #[error("Unknown method '{method}' for {path}")]
    UnknownMethod { path: String, method: String },

    #[error("Malformed manifest: {reason}")]
    MalformedManifest { reason: String },

    #[error("Refusing to restore outside the output directory: {path}")]
    UnsafePath { path: String },

    #[error("Not a directory: {path}")]
    NotADirectory { path: PathBuf },

    #[error("Invalid configuration: {reason}")]
    Config { reason: String },

    #[error("Logging initialisation failed: {reason}")]
    Logging { reason: String },
}

impl Error {
    pub(crate) fn source_read(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::SourceRead {
            path: path.into(),
            source,
        }
    }
}

/// Result type alias for chunkvault operations
pub type Result<T> = std::result::Result<T, Error>;
