//! Known-file registry and resolver hooks
//!
//! A snapshot may record a file as a reference to an external source
//! instead of storing its chunks, when its whole-file hash appears in the
//! registry. Restoring such a file needs a [`KnownFileResolver`]; without
//! one the restore writes a flagged placeholder.

use crate::hash::Digest;
use std::collections::HashMap;

/// Static mapping of whole-file hash to opaque external reference
#[derive(Debug, Clone, Default)]
pub struct KnownFileRegistry {
    entries: HashMap<Digest, String>,
}

impl KnownFileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, file_hash: Digest, known_ref: impl Into<String>) {
        self.entries.insert(file_hash, known_ref.into());
    }

    /// Reference recorded for a file hash, if any
    pub fn lookup(&self, file_hash: &Digest) -> Option<&str> {
        self.entries.get(file_hash).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for KnownFileRegistry
where
    K: Into<Digest>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(hash, known_ref)| (hash.into(), known_ref.into()))
                .collect(),
        }
    }
}

/// Retrieves the content behind a known-file reference
pub trait KnownFileResolver: Send + Sync {
    /// Return the file content, or `None` when the reference cannot be served
    fn resolve(&self, known_ref: &str, file_hash: &Digest) -> Option<Vec<u8>>;
}

impl<F> KnownFileResolver for F
where
    F: Fn(&str, &Digest) -> Option<Vec<u8>> + Send + Sync,
{
    fn resolve(&self, known_ref: &str, file_hash: &Digest) -> Option<Vec<u8>> {
        self(known_ref, file_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::digest;

    #[test]
    fn test_registry_lookup() {
        let registry: KnownFileRegistry = [(digest(b"sys"), "msvcrt@v6.0")].into_iter().collect();

        assert_eq!(registry.lookup(&digest(b"sys")), Some("msvcrt@v6.0"));
        assert_eq!(registry.lookup(&digest(b"user")), None);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_closure_resolver() {
        let resolver = |known_ref: &str, _: &Digest| (known_ref == "base@1").then(|| b"base".to_vec());

        assert_eq!(resolver.resolve("base@1", &digest(b"base")), Some(b"base".to_vec()));
        assert_eq!(resolver.resolve("other", &digest(b"base")), None);
    }
}
