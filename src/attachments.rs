//! Content-addressed attachment storage
//!
//! Attachments are opaque blobs referenced from item graphs by their SHA-256
//! ([`AttachmentId`]). They live outside the revision payloads, sharded by the
//! first two hex characters of the hash:
//!
//! ```text
//! attachments/
//! └── <prefix>/     # first 2 chars of hash
//!     └── <suffix>  # remaining 62 chars
//! ```
//!
//! Importing the same bytes twice stores them once. Attachments are never
//! reference counted; garbage collection computes the live set from the
//! surviving revisions and erases everything else.

use crate::compression::CompressionEngine;
use crate::error::{Result, VersoError};
use crate::types::AttachmentId;
use crate::utils;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Sharded attachment directory
#[derive(Debug)]
pub struct AttachmentStore {
    root: PathBuf,
    compression: Arc<Mutex<CompressionEngine>>,
}

impl AttachmentStore {
    /// Open the attachment directory under `root`, creating it if needed
    pub fn open(root: PathBuf, compression: Arc<Mutex<CompressionEngine>>) -> Result<Self> {
        fs::create_dir_all(&root)?;
        Ok(Self { root, compression })
    }

    /// Path of the blob for `id`
    pub fn path_for(&self, id: &AttachmentId) -> PathBuf {
        let (prefix, suffix) = id.shard();
        self.root.join(prefix).join(suffix)
    }

    /// Store `data`, returning its id
    pub fn import(&self, data: &[u8]) -> Result<AttachmentId> {
        let id = AttachmentId::for_data(data);
        let path = self.path_for(&id);
        if path.exists() {
            trace!("Attachment {} already stored", id);
            return Ok(id);
        }

        let stored = self.compression.lock().compress(data)?;
        // Write under a unique name first so concurrent importers of the same
        // blob never observe a partial file.
        let temp = path.with_extension(format!("{}.partial", uuid::Uuid::new_v4().simple()));
        utils::write_durable(&temp, &stored)?;
        fs::rename(&temp, &path)?;
        debug!("Imported attachment {} ({} bytes)", id, data.len());
        Ok(id)
    }

    /// Store the contents of the file at `source`
    pub fn import_file(&self, source: &Path) -> Result<AttachmentId> {
        let data = fs::read(source)?;
        self.import(&data)
    }

    /// Load an attachment, or `None` if it is not stored
    pub fn load(&self, id: &AttachmentId) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(id);
        let stored = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let data = self.compression.lock().decompress(&stored)?;
        let actual = AttachmentId::for_data(&data);
        if &actual != id {
            return Err(VersoError::HashMismatch {
                expected: id.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(Some(data))
    }

    /// Whether an attachment is stored
    pub fn contains(&self, id: &AttachmentId) -> bool {
        self.path_for(id).exists()
    }

    /// Stored size of an attachment in bytes
    pub fn stored_size(&self, id: &AttachmentId) -> u64 {
        utils::file_size(&self.path_for(id))
    }

    /// Remove an attachment; returns the bytes freed
    pub fn delete(&self, id: &AttachmentId) -> Result<u64> {
        let path = self.path_for(id);
        let size = utils::file_size(&path);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        }
        if let Some(shard) = path.parent() {
            utils::remove_dir_if_empty(shard)?;
        }
        trace!("Deleted attachment {}", id);
        Ok(size)
    }

    /// Every stored attachment id
    pub fn list(&self) -> Result<BTreeSet<AttachmentId>> {
        let mut ids = BTreeSet::new();
        for shard in fs::read_dir(&self.root)? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            let prefix = shard.file_name().to_string_lossy().to_string();
            for entry in fs::read_dir(shard.path())? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().to_string();
                match format!("{}{}", prefix, name).parse::<AttachmentId>() {
                    Ok(id) => {
                        ids.insert(id);
                    }
                    Err(_) => warn!("Ignoring stray file in attachments: {:?}", entry.path()),
                }
            }
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::CompressionStrategy;
    use tempfile::TempDir;

    fn create_test_store() -> (AttachmentStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let engine = Arc::new(Mutex::new(CompressionEngine::new(CompressionStrategy::Fast)));
        let store = AttachmentStore::open(temp_dir.path().join("attachments"), engine).unwrap();
        (store, temp_dir)
    }

    #[test]
    fn test_import_and_load() {
        let (store, _temp) = create_test_store();
        let data = b"png bytes".repeat(500);

        let id = store.import(&data).unwrap();
        assert!(store.contains(&id));
        assert_eq!(store.load(&id).unwrap().unwrap(), data);

        // Dedup
        let again = store.import(&data).unwrap();
        assert_eq!(again, id);
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_missing_attachment_is_none() {
        let (store, _temp) = create_test_store();
        let id = AttachmentId::for_data(b"never stored");
        assert!(store.load(&id).unwrap().is_none());
        assert_eq!(store.delete(&id).unwrap(), 0);
    }

    #[test]
    fn test_delete_removes_shard() {
        let (store, _temp) = create_test_store();
        let id = store.import(b"short").unwrap();
        let shard = store.path_for(&id).parent().unwrap().to_path_buf();
        assert!(store.delete(&id).unwrap() > 0);
        assert!(!store.contains(&id));
        assert!(!shard.exists());
    }

    #[test]
    fn test_tampered_attachment_detected() {
        let (store, _temp) = create_test_store();
        let id = store.import(b"original").unwrap();
        let mut engine = CompressionEngine::new(CompressionStrategy::None);
        fs::write(store.path_for(&id), engine.compress(b"tampered").unwrap()).unwrap();
        assert!(matches!(store.load(&id), Err(VersoError::HashMismatch { .. })));
    }
}
