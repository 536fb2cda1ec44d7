//! Content-addressed chunk storage keyed by SHA-256

use crate::hash::Digest;
use crate::{Error, Result};
use std::fs::{self, File};
use std::io::{self, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

/// Default chunk size for file splitting (4 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Suffix appended to the hex digest to form a chunk file name
pub const CHUNK_SUFFIX: &str = ".bin";

const CHUNKS_DIR: &str = "chunks";
const TMP_SUFFIX: &str = ".tmp";

/// A chunk store manages the storage and retrieval of content-addressed chunks.
///
/// Each chunk lives in `<root>/chunks/<hex digest>.bin`; presence of that
/// file is the existence check. Chunks are immutable once written.
#[derive(Debug, Clone)]
pub struct ChunkStore {
    root_path: PathBuf,
    chunks_path: PathBuf,
}

impl ChunkStore {
    /// Open (creating if needed) a chunk store rooted at `root_path`
    pub fn open<P: AsRef<Path>>(root_path: P) -> Result<Self> {
        let root_path = root_path.as_ref().to_path_buf();
        let chunks_path = root_path.join(CHUNKS_DIR);

        fs::create_dir_all(&chunks_path)?;

        Ok(Self {
            root_path,
            chunks_path,
        })
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    /// Directory holding the chunk files
    pub fn chunks_path(&self) -> &Path {
        &self.chunks_path
    }

    /// Check if a chunk exists in the store
    pub fn exists(&self, hash: &Digest) -> bool {
        self.chunk_path(hash).map_or(false, |path| path.is_file())
    }

    /// Store `data` under `hash` unless a chunk with that hash is already present.
    ///
    /// The content is not re-hashed; callers pass the digest they computed.
    /// Returns `true` when this call wrote the chunk. The bytes land in a
    /// uniquely named temp file first and are promoted without ever
    /// replacing an existing chunk, so concurrent writers of the same hash
    /// produce exactly one winner and readers never see a partial file.
    pub fn put(&self, hash: &Digest, data: &[u8]) -> Result<bool> {
        let chunk_path = self.chunk_path(hash).ok_or_else(|| Error::MalformedHash {
            hash: hash.to_string(),
        })?;

        if chunk_path.is_file() {
            return Ok(false);
        }

        let temp_path = self
            .chunks_path
            .join(format!(".{}.{}{}", hash, Uuid::new_v4(), TMP_SUFFIX));
        stage_temp(&temp_path, |file| file.write_all(data))?;

        let promoted = promote(&temp_path, &chunk_path);
        let _ = fs::remove_file(&temp_path);

        match promoted {
            Ok(written) => {
                if written {
                    debug!("Stored chunk {} ({} bytes)", hash, data.len());
                }
                Ok(written)
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Retrieve a chunk by its hash
    pub fn get(&self, hash: &Digest) -> Result<Vec<u8>> {
        let missing = || Error::MissingChunk {
            hash: hash.to_string(),
        };
        let chunk_path = self.chunk_path(hash).ok_or_else(missing)?;

        match fs::read(&chunk_path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(missing()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// List all chunks in the store
    pub fn list(&self) -> Result<Vec<Digest>> {
        let mut chunks = Vec::new();

        for entry in fs::read_dir(&self.chunks_path)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(CHUNK_SUFFIX)) else {
                continue;
            };

            let hash = Digest::new(stem);
            if hash.is_well_formed() && entry.file_type()?.is_file() {
                chunks.push(hash);
            }
        }

        chunks.sort();
        Ok(chunks)
    }

    /// Number of chunks currently stored
    pub fn chunk_count(&self) -> Result<usize> {
        Ok(self.list()?.len())
    }

    /// Get the file path for a chunk hash, or `None` for a malformed hash
    fn chunk_path(&self, hash: &Digest) -> Option<PathBuf> {
        if !hash.is_well_formed() {
            return None;
        }
        Some(self.chunks_path.join(format!("{}{}", hash, CHUNK_SUFFIX)))
    }
}

/// Create `temp_path`, fill it with `write` and sync it to disk.
///
/// On any failure the partial file is removed before the error is returned.
pub(crate) fn stage_temp<F>(temp_path: &Path, write: F) -> io::Result<()>
where
    F: FnOnce(&mut File) -> io::Result<()>,
{
    let mut file = File::create(temp_path)?;
    let staged = write(&mut file).and_then(|()| file.sync_all());
    drop(file);

    if staged.is_err() {
        let _ = fs::remove_file(temp_path);
    }
    staged
}

/// Move `temp` to `dest` only if `dest` does not exist yet.
///
/// Hard links fail with `AlreadyExists` instead of clobbering; filesystems
/// without hard links fall back to a rename guarded by an existence check.
fn promote(temp: &Path, dest: &Path) -> io::Result<bool> {
    match fs::hard_link(temp, dest) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(_) if dest.is_file() => Ok(false),
        Err(_) => fs::rename(temp, dest).map(|()| true),
    }
}

/// Splits a reader into fixed-size chunks.
///
/// Every chunk except the last is exactly `chunk_size` bytes, regardless of
/// how many bytes individual `read` calls return.
pub struct FixedChunker<R> {
    reader: R,
    chunk_size: usize,
    done: bool,
}

impl<R: Read> FixedChunker<R> {
    pub fn new(reader: R, chunk_size: usize) -> Self {
        Self {
            reader,
            chunk_size: chunk_size.max(1),
            done: false,
        }
    }
}

impl<R: Read> Iterator for FixedChunker<R> {
    type Item = io::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let mut buffer = vec![0u8; self.chunk_size];
        let mut filled = 0;
        while filled < buffer.len() {
            match self.reader.read(&mut buffer[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }

        if filled < buffer.len() {
            self.done = true;
        }
        if filled == 0 {
            return None;
        }

        buffer.truncate(filled);
        Some(Ok(buffer))
    }
}
