//! Local content-addressed blob store
//!
//! Layout `root/blobs/sha256/<hex>`. Writes are atomic
//! (write-tempfile-then-rename), so readers never observe a partial
//! blob and concurrent writers of the same digest converge on identical
//! content. The store performs no eviction; its lifetime is owned by
//! the surrounding build system. Blobs of at most 1 MiB are mirrored in
//! memory after the first successful read.

use crate::digest::{Digest, DigestAlgorithm, HashingWriter};
use crate::error::{ImageError, Result};
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

/// Blobs up to this size are memory-mirrored after a successful read
pub const SMALL_BLOB_LIMIT: u64 = 1024 * 1024;

pub struct BlobStore {
    root: PathBuf,
    memory: RwLock<HashMap<String, Arc<Vec<u8>>>>,
}

impl BlobStore {
    pub fn new(root: &Path) -> Result<Self> {
        let blob_dir = root.join("blobs").join("sha256");
        std::fs::create_dir_all(&blob_dir).map_err(|e| {
            ImageError::Io(format!(
                "Failed to create blob store at {}: {}",
                blob_dir.display(),
                e
            ))
        })?;
        Ok(Self {
            root: root.to_path_buf(),
            memory: RwLock::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// On-disk location of a blob
    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root
            .join("blobs")
            .join(digest.algorithm.as_str())
            .join(&digest.hex)
    }

    pub fn exists(&self, digest: &Digest) -> bool {
        self.blob_path(digest).is_file()
    }

    pub fn size(&self, digest: &Digest) -> Result<u64> {
        let path = self.blob_path(digest);
        Ok(std::fs::metadata(&path)
            .map_err(|e| ImageError::Io(format!("Failed to stat {}: {}", path.display(), e)))?
            .len())
    }

    fn install(&self, digest: &Digest, temp: tempfile::NamedTempFile) -> Result<()> {
        let target = self.blob_path(digest);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Concurrent writers of the same digest race on the rename; the
        // content is byte-identical so the winner does not matter.
        temp.persist(&target).map_err(|e| {
            ImageError::Io(format!("Failed to install blob {}: {}", target.display(), e))
        })?;
        Ok(())
    }

    /// Hash bytes in memory and atomically install the blob
    pub fn write_small(&self, bytes: &[u8]) -> Result<Digest> {
        let digest = Digest::sha256(bytes);
        if self.exists(&digest) {
            return Ok(digest);
        }
        let mut temp = tempfile::NamedTempFile::new_in(&self.root)
            .map_err(|e| ImageError::Io(format!("Failed to create temp file: {}", e)))?;
        temp.write_all(bytes)?;
        self.install(&digest, temp)?;
        Ok(digest)
    }

    /// Install bytes under a caller-supplied digest, verifying the
    /// digest first. A no-op when the blob already exists.
    pub fn write_small_with_digest(&self, digest: &Digest, bytes: &[u8]) -> Result<()> {
        digest.verify(bytes)?;
        if self.exists(digest) {
            return Ok(());
        }
        let mut temp = tempfile::NamedTempFile::new_in(&self.root)
            .map_err(|e| ImageError::Io(format!("Failed to create temp file: {}", e)))?;
        temp.write_all(bytes)?;
        self.install(digest, temp)
    }

    /// Stream a reader to a temp file while hashing, verify on close,
    /// then rename into place. Returns the byte count.
    pub fn write_large<R: Read>(&self, digest: &Digest, reader: &mut R) -> Result<u64> {
        if digest.algorithm != DigestAlgorithm::Sha256 {
            return Err(ImageError::Validation(format!(
                "Blob store only stores sha256 blobs, got {}",
                digest.algorithm
            )));
        }
        if self.exists(digest) {
            return self.size(digest);
        }
        let temp = tempfile::NamedTempFile::new_in(&self.root)
            .map_err(|e| ImageError::Io(format!("Failed to create temp file: {}", e)))?;
        let mut writer = HashingWriter::new(temp);
        std::io::copy(reader, &mut writer)?;
        let (mut temp, actual, size) = writer.finish();
        if actual != *digest {
            // The partial temp file is dropped and deleted.
            return Err(ImageError::Validation(format!(
                "Blob digest mismatch on write: expected {}, computed {}",
                digest, actual
            )));
        }
        temp.flush()?;
        self.install(digest, temp)?;
        Ok(size)
    }

    /// Streaming reader over a blob
    pub fn open(&self, digest: &Digest) -> Result<File> {
        let path = self.blob_path(digest);
        File::open(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ImageError::NotFound(format!("Blob not in local store: {}", digest))
            } else {
                ImageError::Io(format!("Failed to open {}: {}", path.display(), e))
            }
        })
    }

    /// Read a blob into memory, verifying its digest. A corrupted blob
    /// is removed from disk before the error is returned. Successful
    /// small reads are mirror-cached.
    pub fn read_small(&self, digest: &Digest) -> Result<Arc<Vec<u8>>> {
        if let Some(cached) = self.memory.read().expect("blob cache lock").get(&digest.hex) {
            return Ok(cached.clone());
        }
        let path = self.blob_path(digest);
        let mut data = Vec::new();
        self.open(digest)?.read_to_end(&mut data)?;
        if digest.verify(&data).is_err() {
            let _ = std::fs::remove_file(&path);
            return Err(ImageError::Integrity {
                message: format!(
                    "Cached blob does not match its digest {} and was removed",
                    digest
                ),
                path,
            });
        }
        let data = Arc::new(data);
        if data.len() as u64 <= SMALL_BLOB_LIMIT {
            self.memory
                .write()
                .expect("blob cache lock")
                .insert(digest.hex.clone(), data.clone());
        }
        Ok(data)
    }
}
