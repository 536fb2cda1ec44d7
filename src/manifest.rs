//! Snapshot manifests and their self-referential integrity seal

use crate::chunk::stage_temp;
use crate::hash::Digest;
use crate::{Error, Result};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::Path;
use uuid::Uuid;

/// Manifest format version
pub const MANIFEST_VERSION: u32 = 1;

/// How a file's content is recorded in the manifest.
///
/// Method names the engine does not understand are kept verbatim so a
/// manifest written by a newer tool still round-trips byte for byte.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Method {
    /// Content is the ordered concatenation of stored chunks
    Chunked,
    /// Content is obtainable from an external, pre-identified source
    KnownFileRef,
    Unknown(String),
}

impl Method {
    pub fn as_str(&self) -> &str {
        match self {
            Method::Chunked => "chunked",
            Method::KnownFileRef => "known_file_ref",
            Method::Unknown(other) => other,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Method::Unknown(_))
    }
}

impl From<String> for Method {
    fn from(value: String) -> Self {
        match value.as_str() {
            "chunked" => Method::Chunked,
            "known_file_ref" => Method::KnownFileRef,
            _ => Method::Unknown(value),
        }
    }
}

impl From<Method> for String {
    fn from(method: Method) -> Self {
        match method {
            Method::Unknown(other) => other,
            known => known.as_str().to_string(),
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A file record in the manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Path relative to the snapshot root, `/` separated
    pub path: String,
    pub method: Method,
    /// SHA-256 of the complete original file
    pub file_hash: Digest,
    /// Ordered chunks that make up this file (`chunked` only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_hashes: Option<Vec<Digest>>,
    /// External reference (`known_file_ref` only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_ref: Option<String>,
}

impl FileRecord {
    pub fn chunked(path: impl Into<String>, file_hash: Digest, chunk_hashes: Vec<Digest>) -> Self {
        Self {
            path: path.into(),
            method: Method::Chunked,
            file_hash,
            chunk_hashes: Some(chunk_hashes),
            known_ref: None,
        }
    }

    pub fn known_file_ref(path: impl Into<String>, file_hash: Digest, known_ref: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            method: Method::KnownFileRef,
            file_hash,
            chunk_hashes: None,
            known_ref: Some(known_ref.into()),
        }
    }

    /// Chunk sequence, empty when none was recorded
    pub fn chunks(&self) -> &[Digest] {
        self.chunk_hashes.as_deref().unwrap_or_default()
    }
}

/// Snapshot manifest: everything a restore needs besides the chunk store.
///
/// Serialization always goes through one canonical encoding (fixed field
/// order, two-space pretty printing, no trailing newline). The seal is the
/// digest of that encoding with `top_level_hash` set to the empty string.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Manifest {
    pub version: u32,
    /// Absolute path of the directory that was snapshotted
    pub root_directory: String,
    /// RFC 3339 creation time
    pub timestamp: String,
    /// File records in traversal order
    pub files: Vec<FileRecord>,
    #[serde(default)]
    pub top_level_hash: Digest,
}

/// Borrowed view used for every serialization of a manifest
#[derive(Serialize)]
struct CanonicalManifest<'a> {
    version: u32,
    root_directory: &'a str,
    timestamp: &'a str,
    files: &'a [FileRecord],
    top_level_hash: &'a Digest,
}

impl Serialize for Manifest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.canonical_view(&self.top_level_hash).serialize(serializer)
    }
}

/// Outcome of checking a manifest's seal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealCheck {
    /// Seal stored in the manifest
    pub expected: Digest,
    /// Seal recomputed from the parsed content
    pub computed: Digest,
    /// Whether the raw bytes were exactly the canonical encoding
    pub canonical: bool,
}

impl SealCheck {
    pub fn is_intact(&self) -> bool {
        self.canonical && self.expected == self.computed
    }
}

impl Manifest {
    fn canonical_view<'a>(&'a self, seal: &'a Digest) -> CanonicalManifest<'a> {
        CanonicalManifest {
            version: self.version,
            root_directory: &self.root_directory,
            timestamp: &self.timestamp,
            files: &self.files,
            top_level_hash: seal,
        }
    }

    fn encode_with_seal(&self, seal: &Digest) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(&self.canonical_view(seal))?)
    }

    /// Canonical bytes of the manifest as it would be written to disk
    pub fn to_canonical_bytes(&self) -> Result<Vec<u8>> {
        self.encode_with_seal(&self.top_level_hash)
    }

    /// Digest of the canonical encoding with the seal held empty
    pub fn compute_seal(&self) -> Result<Digest> {
        Ok(Digest::of(&self.encode_with_seal(&Digest::default())?))
    }

    /// Compute and embed the top-level hash
    pub fn seal(&mut self) -> Result<()> {
        self.top_level_hash = self.compute_seal()?;
        Ok(())
    }

    /// Check the seal, and when `raw` is given, that it is the canonical encoding
    pub fn verify_seal(&self, raw: Option<&[u8]>) -> Result<SealCheck> {
        let canonical = match raw {
            Some(raw) => self.to_canonical_bytes()? == raw,
            None => true,
        };

        Ok(SealCheck {
            expected: self.top_level_hash.clone(),
            computed: self.compute_seal()?,
            canonical,
        })
    }

    /// Parse a manifest, reporting any structural problem as malformed
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::MalformedManifest {
            reason: e.to_string(),
        })
    }

    /// Load a manifest and check its seal against the bytes on disk
    pub fn load_verified<P: AsRef<Path>>(manifest_path: P) -> Result<(Self, SealCheck)> {
        let raw = fs::read(manifest_path)?;
        let manifest = Self::from_slice(&raw)?;
        let check = manifest.verify_seal(Some(&raw))?;
        Ok((manifest, check))
    }

    /// Load a manifest without reporting seal status
    pub fn load<P: AsRef<Path>>(manifest_path: P) -> Result<Self> {
        Ok(Self::load_verified(manifest_path)?.0)
    }

    /// Write the canonical encoding atomically
    pub fn save<P: AsRef<Path>>(&self, manifest_path: P) -> Result<()> {
        write_atomic(manifest_path.as_ref(), &self.to_canonical_bytes()?)
    }

    /// Find a file record by relative path
    pub fn find_file(&self, path: &str) -> Option<&FileRecord> {
        self.files.iter().find(|f| f.path == path)
    }

    /// All unique chunks referenced by this manifest, in first-use order
    pub fn referenced_chunks(&self) -> Vec<&Digest> {
        let mut seen = HashSet::new();
        self.files
            .iter()
            .flat_map(|f| f.chunks())
            .filter(|h| seen.insert(*h))
            .collect()
    }
}

/// Assembles file records in traversal order and seals the result
#[derive(Debug)]
pub struct ManifestBuilder {
    root_directory: String,
    timestamp: String,
    files: Vec<FileRecord>,
}

impl ManifestBuilder {
    pub fn new<P: AsRef<Path>>(root_directory: P) -> Self {
        Self {
            root_directory: root_directory.as_ref().display().to_string(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            files: Vec::new(),
        }
    }

    /// Override the creation time
    pub fn with_timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = timestamp.into();
        self
    }

    pub fn push(&mut self, record: FileRecord) {
        self.files.push(record);
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Produce the sealed manifest
    pub fn finish(self) -> Result<Manifest> {
        let mut manifest = Manifest {
            version: MANIFEST_VERSION,
            root_directory: self.root_directory,
            timestamp: self.timestamp,
            files: self.files,
            top_level_hash: Digest::default(),
        };
        manifest.seal()?;
        Ok(manifest)
    }
}

/// Write `data` next to `path` and rename it into place
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_path = path.with_file_name(format!(".{}.{}.tmp", file_name, Uuid::new_v4()));

    stage_temp(&temp_path, |file| file.write_all(data))?;
    if let Err(e) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(Error::Io(e));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::digest;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn sample_manifest() -> Manifest {
        let mut builder = ManifestBuilder::new("/data/source").with_timestamp("2024-05-01T12:00:00.000000Z");
        builder.push(FileRecord::chunked(
            "docs/a.txt",
            digest(b"hello world"),
            vec![digest(b"hello world")],
        ));
        builder.push(FileRecord::known_file_ref(
            "bin/tool.dll",
            digest(b"tool"),
            "msvcrt@v6.0",
        ));
        builder.finish().unwrap()
    }

    #[test]
    fn test_method_names() {
        assert_eq!(Method::from("chunked".to_string()), Method::Chunked);
        assert_eq!(Method::from("known_file_ref".to_string()), Method::KnownFileRef);
        assert_eq!(
            Method::from("delta".to_string()),
            Method::Unknown("delta".to_string())
        );
        assert_eq!(String::from(Method::KnownFileRef), "known_file_ref");
        assert!(!Method::Unknown("delta".to_string()).is_known());
    }

    #[test]
    fn test_seal_is_over_empty_hash_encoding() -> Result<()> {
        let manifest = sample_manifest();

        let mut unsealed = manifest.clone();
        unsealed.top_level_hash = Digest::default();
        let expected = digest(&unsealed.to_canonical_bytes()?);

        assert_eq!(manifest.top_level_hash, expected);
        assert!(manifest.verify_seal(None)?.is_intact());
        Ok(())
    }

    #[test]
    fn test_seal_ignores_previous_seal_value() -> Result<()> {
        let mut manifest = sample_manifest();
        let original = manifest.top_level_hash.clone();

        manifest.top_level_hash = Digest::new("stale");
        manifest.seal()?;
        assert_eq!(manifest.top_level_hash, original);
        Ok(())
    }

    #[test]
    fn test_optional_fields_follow_method() -> Result<()> {
        let text = String::from_utf8(sample_manifest().to_canonical_bytes()?).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text)?;

        let files = value["files"].as_array().unwrap();
        assert!(files[0].get("chunk_hashes").is_some());
        assert!(files[0].get("known_ref").is_none());
        assert!(files[1].get("chunk_hashes").is_none());
        assert_eq!(files[1]["known_ref"], "msvcrt@v6.0");
        assert!(!text.ends_with('\n'));
        Ok(())
    }

    #[test]
    fn test_save_load_round_trip() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("snapshot.json");
        let manifest = sample_manifest();

        manifest.save(&path)?;
        let (loaded, check) = Manifest::load_verified(&path)?;

        assert_eq!(loaded, manifest);
        assert!(check.is_intact());
        assert_eq!(fs::read(&path)?, manifest.to_canonical_bytes()?);
        Ok(())
    }

    #[test]
    fn test_content_edit_breaks_seal() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("snapshot.json");
        sample_manifest().save(&path)?;

        let text = fs::read_to_string(&path)?.replace("docs/a.txt", "docs/b.txt");
        fs::write(&path, text)?;

        let (_, check) = Manifest::load_verified(&path)?;
        assert!(!check.is_intact());
        assert_ne!(check.expected, check.computed);
        Ok(())
    }

    #[test]
    fn test_whitespace_edit_is_detected() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("snapshot.json");
        sample_manifest().save(&path)?;

        let mut raw = fs::read(&path)?;
        raw.push(b'\n');
        fs::write(&path, raw)?;

        let (_, check) = Manifest::load_verified(&path)?;
        assert!(!check.canonical);
        assert!(!check.is_intact());
        Ok(())
    }

    #[test]
    fn test_unknown_method_round_trips() -> Result<()> {
        let mut builder = ManifestBuilder::new("/src").with_timestamp("t");
        let mut record = FileRecord::chunked("x", digest(b"x"), vec![]);
        record.method = Method::Unknown("delta_v2".to_string());
        builder.push(record);
        let manifest = builder.finish()?;

        let bytes = manifest.to_canonical_bytes()?;
        let parsed = Manifest::from_slice(&bytes)?;
        assert_eq!(parsed.files[0].method, Method::Unknown("delta_v2".to_string()));
        assert!(parsed.verify_seal(Some(&bytes))?.is_intact());
        Ok(())
    }

    #[test]
    fn test_malformed_manifests() {
        assert!(matches!(
            Manifest::from_slice(b"not json"),
            Err(Error::MalformedManifest { .. })
        ));

        let missing_method = br#"{
            "version": 1,
            "root_directory": "/src",
            "timestamp": "t",
            "files": [{"path": "a", "file_hash": "00"}],
            "top_level_hash": ""
        }"#;
        assert!(matches!(
            Manifest::from_slice(missing_method),
            Err(Error::MalformedManifest { .. })
        ));
    }

    #[test]
    fn test_referenced_chunks_are_unique() {
        let a = digest(b"a");
        let b = digest(b"b");
        let mut builder = ManifestBuilder::new("/src");
        builder.push(FileRecord::chunked("one", digest(b"aba"), vec![a.clone(), b.clone(), a.clone()]));
        builder.push(FileRecord::chunked("two", digest(b"a"), vec![a.clone()]));
        let manifest = builder.finish().unwrap();

        assert_eq!(manifest.referenced_chunks(), vec![&a, &b]);
        assert!(manifest.find_file("two").is_some());
        assert!(manifest.find_file("three").is_none());
    }
}
