//! The content-addressed store consumed by reference-call expansion and
//! remote device loading.
//!
//! Blobs are addressed by the BLAKE3 hash of their bytes. The disk backend
//! mirrors the conventional CAS layout, `objects/{4-hex-prefix}/{60-hex}`,
//! with bounded reads, `O_NOFOLLOW` opens on Unix, and integrity
//! verification before any byte is returned: a tampered or symlinked
//! object reads as absent-with-cause, never as data.

use std::collections::HashMap;
use std::io::Read as _;
#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path as FsPath, PathBuf};
use std::sync::{Mutex, PoisonError};

use thiserror::Error;
use tracing::debug;

use crate::hashpath::ContentId;

/// Maximum size of a single stored blob (16 MiB).
pub const MAX_BLOB_SIZE: usize = 16 * 1024 * 1024;

/// Objects subdirectory of a disk store root.
const OBJECTS_DIR: &str = "objects";

/// Errors from store backends.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// No blob under the given id.
    #[error("blob not found")]
    NotFound,

    /// The blob exceeds [`MAX_BLOB_SIZE`].
    #[error("blob size {size} exceeds maximum {max}")]
    TooLarge {
        /// Observed size.
        size: usize,
        /// The enforced maximum.
        max: usize,
    },

    /// The on-disk bytes do not hash to the requested id.
    #[error("blob integrity mismatch")]
    IntegrityMismatch,

    /// The object path is a symlink, which the store refuses to follow.
    #[error("symlink in object path")]
    SymlinkDetected,

    /// Filesystem failure.
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// A content-addressed blob store.
pub trait Store: Send + Sync {
    /// Fetches a blob by id, verifying integrity.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for absent ids and
    /// [`StoreError::IntegrityMismatch`] for tampered content.
    fn read(&self, id: &ContentId) -> Result<Vec<u8>, StoreError>;

    /// Stores a blob, returning its id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::TooLarge`] for oversized blobs or an I/O error.
    fn write(&self, bytes: &[u8]) -> Result<ContentId, StoreError>;

    /// True when a blob exists under the id.
    fn contains(&self, id: &ContentId) -> bool;
}

/// In-memory store backend.
#[derive(Default)]
pub struct MemoryStore {
    blobs: Mutex<HashMap<ContentId, Vec<u8>>>,
}

impl MemoryStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn read(&self, id: &ContentId) -> Result<Vec<u8>, StoreError> {
        self.blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    fn write(&self, bytes: &[u8]) -> Result<ContentId, StoreError> {
        if bytes.len() > MAX_BLOB_SIZE {
            return Err(StoreError::TooLarge {
                size: bytes.len(),
                max: MAX_BLOB_SIZE,
            });
        }
        let id = ContentId::of_blob(bytes);
        self.blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, bytes.to_vec());
        Ok(id)
    }

    fn contains(&self, id: &ContentId) -> bool {
        self.blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }
}

/// Disk store backend using the `objects/{prefix}/{suffix}` layout.
#[derive(Debug, Clone)]
pub struct DiskStore {
    objects: PathBuf,
}

impl DiskStore {
    /// Opens (or initializes) a disk store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the objects directory cannot be created.
    pub fn open(root: &FsPath) -> Result<Self, StoreError> {
        let objects = root.join(OBJECTS_DIR);
        std::fs::create_dir_all(&objects)?;
        Ok(Self { objects })
    }

    fn object_path(&self, id: &ContentId) -> PathBuf {
        let hex = hex::encode(id.as_bytes());
        let (prefix, suffix) = hex.split_at(4);
        self.objects.join(prefix).join(suffix)
    }
}

/// Opens an object without traversing a symlink at the final component.
/// The `lstat` pre-check in `read` is advisory only; this open is what
/// refuses a symlink swapped in after that check.
#[cfg(unix)]
fn open_object(path: &FsPath) -> Result<std::fs::File, StoreError> {
    let mut options = std::fs::OpenOptions::new();
    options.read(true);
    options.custom_flags(libc::O_NOFOLLOW);
    options.open(path).map_err(|e| {
        if e.raw_os_error() == Some(libc::ELOOP) {
            StoreError::SymlinkDetected
        } else if e.kind() == std::io::ErrorKind::NotFound {
            StoreError::NotFound
        } else {
            StoreError::Io(e)
        }
    })
}

#[cfg(not(unix))]
fn open_object(path: &FsPath) -> Result<std::fs::File, StoreError> {
    std::fs::File::open(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            StoreError::NotFound
        } else {
            StoreError::Io(e)
        }
    })
}

impl Store for DiskStore {
    fn read(&self, id: &ContentId) -> Result<Vec<u8>, StoreError> {
        let path = self.object_path(id);

        let metadata = match path.symlink_metadata() {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound)
            }
            Err(e) => return Err(StoreError::Io(e)),
        };
        if metadata.file_type().is_symlink() {
            return Err(StoreError::SymlinkDetected);
        }
        if !metadata.is_file() {
            return Err(StoreError::NotFound);
        }
        let size = usize::try_from(metadata.len()).unwrap_or(usize::MAX);
        if size > MAX_BLOB_SIZE {
            return Err(StoreError::TooLarge {
                size,
                max: MAX_BLOB_SIZE,
            });
        }

        let file = open_object(&path)?;

        // Size from the opened descriptor, not the pre-open stat.
        let fd_metadata = file.metadata()?;
        let fd_size = usize::try_from(fd_metadata.len()).unwrap_or(usize::MAX);
        if fd_size > MAX_BLOB_SIZE {
            return Err(StoreError::TooLarge {
                size: fd_size,
                max: MAX_BLOB_SIZE,
            });
        }

        let mut bytes = Vec::with_capacity(fd_size);
        file.take(MAX_BLOB_SIZE as u64 + 1).read_to_end(&mut bytes)?;
        if bytes.len() > MAX_BLOB_SIZE {
            return Err(StoreError::TooLarge {
                size: bytes.len(),
                max: MAX_BLOB_SIZE,
            });
        }

        if ContentId::of_blob(&bytes) != *id {
            return Err(StoreError::IntegrityMismatch);
        }
        Ok(bytes)
    }

    fn write(&self, bytes: &[u8]) -> Result<ContentId, StoreError> {
        if bytes.len() > MAX_BLOB_SIZE {
            return Err(StoreError::TooLarge {
                size: bytes.len(),
                max: MAX_BLOB_SIZE,
            });
        }
        let id = ContentId::of_blob(bytes);
        let path = self.object_path(&id);
        if path.exists() {
            // Content-addressed: an existing object is the same object.
            return Ok(id);
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Write-then-rename keeps partially written objects invisible.
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &path)?;
        debug!(id = %id, size = bytes.len(), "stored blob");
        Ok(id)
    }

    fn contains(&self, id: &ContentId) -> bool {
        self.object_path(id)
            .symlink_metadata()
            .is_ok_and(|m| m.is_file() && !m.file_type().is_symlink())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn memory_store_round_trips() {
        let store = MemoryStore::new();
        let id = store.write(b"payload").expect("write");
        assert_eq!(store.read(&id).expect("read"), b"payload");
        assert!(store.contains(&id));
        assert!(matches!(
            store.read(&ContentId::of_blob(b"absent")),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn disk_store_round_trips() {
        let tmp = tempdir().expect("tmpdir");
        let store = DiskStore::open(tmp.path()).expect("open");
        let id = store.write(b"disk payload").expect("write");
        assert_eq!(store.read(&id).expect("read"), b"disk payload");
        assert!(store.contains(&id));
    }

    #[test]
    fn disk_store_write_is_idempotent() {
        let tmp = tempdir().expect("tmpdir");
        let store = DiskStore::open(tmp.path()).expect("open");
        let first = store.write(b"same bytes").expect("write");
        let second = store.write(b"same bytes").expect("write");
        assert_eq!(first, second);
    }

    #[test]
    fn disk_store_detects_tampering() {
        let tmp = tempdir().expect("tmpdir");
        let store = DiskStore::open(tmp.path()).expect("open");
        let id = store.write(b"original").expect("write");

        let path = store.object_path(&id);
        std::fs::write(&path, b"tampered").expect("tamper");
        assert!(matches!(
            store.read(&id),
            Err(StoreError::IntegrityMismatch)
        ));
    }

    #[test]
    fn disk_store_missing_blob_is_not_found() {
        let tmp = tempdir().expect("tmpdir");
        let store = DiskStore::open(tmp.path()).expect("open");
        assert!(matches!(
            store.read(&ContentId::of_blob(b"nope")),
            Err(StoreError::NotFound)
        ));
    }

    #[cfg(unix)]
    #[test]
    fn disk_store_refuses_symlinked_objects() {
        let tmp = tempdir().expect("tmpdir");
        let store = DiskStore::open(tmp.path()).expect("open");

        let data = b"symlink target";
        let id = ContentId::of_blob(data);
        let target = tmp.path().join("outside");
        std::fs::write(&target, data).expect("write target");

        let path = store.object_path(&id);
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        std::os::unix::fs::symlink(&target, &path).expect("symlink");

        assert!(matches!(
            store.read(&id),
            Err(StoreError::SymlinkDetected)
        ));
    }

    #[cfg(unix)]
    #[test]
    fn open_refuses_symlinks_at_open_time() {
        // Drives open_object directly, bypassing the lstat pre-check, the
        // way a symlink swapped in between check and open would reach it.
        let tmp = tempdir().expect("tmpdir");
        let target = tmp.path().join("target");
        std::fs::write(&target, b"contents").expect("write target");
        let link = tmp.path().join("link");
        std::os::unix::fs::symlink(&target, &link).expect("symlink");

        assert!(matches!(
            open_object(&link),
            Err(StoreError::SymlinkDetected)
        ));
        assert!(open_object(&target).is_ok());
    }

    #[test]
    fn oversized_blob_is_rejected() {
        let store = MemoryStore::new();
        let huge = vec![0u8; MAX_BLOB_SIZE + 1];
        assert!(matches!(
            store.write(&huge),
            Err(StoreError::TooLarge { .. })
        ));
    }
}
