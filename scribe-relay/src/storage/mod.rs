//! Persisted-document loader/saver used by the relay at load and evict time.
//!
//! ```text
//! ┌─────────────┐  load on first open   ┌───────────────┐
//! │  CrdtRelay  │ ◄──────────────────── │ DocumentStore │
//! │ (yrs Docs)  │ ────────────────────► │ Memory / File │
//! └─────────────┘  save on evict/flush  └───────────────┘
//! ```
//!
//! State is exchanged as one yrs v1 update encoding the whole document.

mod file;

pub use file::FileStore;

use std::collections::HashMap;
use std::sync::Mutex;

use uuid::Uuid;

/// Storage errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Compression or decompression failed
    #[error("Compression error: {0}")]
    CompressionError(String),
    /// I/O error
    #[error("I/O error: {0}")]
    IoError(String),
    /// Lock poisoned by a panicking writer
    #[error("Store lock poisoned")]
    Poisoned,
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::IoError(e.to_string())
    }
}

/// Durable home of document content.
#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync {
    /// Full state of the document, or `None` if it was never saved.
    async fn load(&self, document_id: Uuid) -> Result<Option<Vec<u8>>, StoreError>;

    /// Replace the stored state with `state`.
    async fn save(&self, document_id: Uuid, state: &[u8]) -> Result<(), StoreError>;
}

/// Process-local store. Content is lost on restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    docs: Mutex<HashMap<Uuid, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.docs.lock().map(|docs| docs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl DocumentStore for MemoryStore {
    async fn load(&self, document_id: Uuid) -> Result<Option<Vec<u8>>, StoreError> {
        let docs = self.docs.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(docs.get(&document_id).cloned())
    }

    async fn save(&self, document_id: Uuid, state: &[u8]) -> Result<(), StoreError> {
        let mut docs = self.docs.lock().map_err(|_| StoreError::Poisoned)?;
        docs.insert(document_id, state.to_vec());
        Ok(())
    }
}
