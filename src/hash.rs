//! SHA-256 hashing shared by chunks, whole files and manifest seals

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;

/// Length of a hex-encoded SHA-256 digest
pub const DIGEST_HEX_LEN: usize = 64;

/// A SHA-256 digest rendered as lowercase hex.
///
/// Digests read back from manifests are kept verbatim, so a value is not
/// guaranteed to be well formed; see [`Digest::is_well_formed`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Digest(String);

impl Digest {
    /// Wrap an existing hex string
    pub fn new(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    /// Compute the digest of an in-memory byte slice
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = Hasher::new();
        hasher.update(data);
        hasher.finalize()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True for exactly 64 lowercase hex characters
    pub fn is_well_formed(&self) -> bool {
        self.0.len() == DIGEST_HEX_LEN
            && self.0.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Digest {
    fn from(hex: String) -> Self {
        Self(hex)
    }
}

impl From<&str> for Digest {
    fn from(hex: &str) -> Self {
        Self(hex.to_string())
    }
}

/// Incremental SHA-256 hasher.
///
/// Implements [`Write`] so it can sit at the end of `io::copy`.
#[derive(Debug, Clone, Default)]
pub struct Hasher {
    inner: Sha256,
}

impl Hasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    pub fn finalize(self) -> Digest {
        Digest(hex::encode(self.inner.finalize()))
    }
}

impl Write for Hasher {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// One-shot digest of a byte slice
pub fn digest(data: &[u8]) -> Digest {
    Digest::of(data)
}

/// Hash everything a reader yields without buffering it all in memory
pub fn hash_reader<R: Read>(mut reader: R) -> io::Result<Digest> {
    let mut hasher = Hasher::new();
    io::copy(&mut reader, &mut hasher)?;
    Ok(hasher.finalize())
}

/// Compute the SHA-256 of a file in streaming fashion
pub fn hash_file<P: AsRef<Path>>(path: P) -> io::Result<Digest> {
    let file = File::open(path)?;
    hash_reader(BufReader::new(file))
}
