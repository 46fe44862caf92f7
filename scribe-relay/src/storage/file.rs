//! One LZ4-compressed snapshot file per document.
//!
//! Layout: `<root>/<document_id>.ydoc.lz4`. Writes go to a `.tmp` sibling
//! first and are renamed into place, so a crash mid-write leaves the
//! previous snapshot intact.

use std::path::{Path, PathBuf};

use uuid::Uuid;

use super::{DocumentStore, StoreError};

const SNAPSHOT_EXT: &str = "ydoc.lz4";

/// Filesystem-backed [`DocumentStore`].
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open (creating if needed) the snapshot directory.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        log::info!("File store opened at {}", root.display());
        Ok(Self { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    fn snapshot_path(&self, document_id: Uuid) -> PathBuf {
        self.root.join(format!("{document_id}.{SNAPSHOT_EXT}"))
    }
}

#[async_trait::async_trait]
impl DocumentStore for FileStore {
    async fn load(&self, document_id: Uuid) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.snapshot_path(document_id);
        let compressed = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let state = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;
        log::debug!(
            "Loaded {document_id}: {} bytes ({} compressed)",
            state.len(),
            compressed.len()
        );
        Ok(Some(state))
    }

    async fn save(&self, document_id: Uuid, state: &[u8]) -> Result<(), StoreError> {
        let path = self.snapshot_path(document_id);
        let tmp = path.with_extension("tmp");
        let compressed = lz4_flex::compress_prepend_size(state);

        tokio::fs::write(&tmp, &compressed).await?;
        tokio::fs::rename(&tmp, &path).await?;

        log::debug!(
            "Saved {document_id}: {} bytes ({} compressed)",
            state.len(),
            compressed.len()
        );
        Ok(())
    }
}
