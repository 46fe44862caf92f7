//! CRDT relay: one authoritative yrs `Doc` per document id.
//!
//! ```text
//!              acquire()                 load() ok
//!  UNLOADED ─────────────► LOADING ───────────────► LOADED
//!      ▲                                   ▲          │ release() → 0 subscribers
//!      │  evict_expired() after grace      │ acquire()│
//!      └──────────────────────────────── EVICTABLE ◄──┘
//! ```
//!
//! The table only hands out shared [`DocumentHandle`]s, and a handle's doc is
//! initialised at most once, so two joins racing on a cold document share a
//! single load and a single in-memory instance.
//!
//! Sync handshake (y-sync):
//! ```text
//! server ──► client   SyncStep1(server sv)          on join
//! client ──► server   SyncStep2(diff) / SyncStep1(client sv)
//! server ──► client   SyncStep2(diff vs client sv)  reply, sender only
//! server ──► room     Update(newly integrated)      if state advanced
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::OnceCell;
use uuid::Uuid;
use yrs::sync::{Message, SyncMessage};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use crate::config::DEFAULT_MAX_MESSAGE_BYTES;
use crate::error::RelayError;
use crate::inspect::{self, SyncFrame};
use crate::storage::DocumentStore;

/// Lifecycle stage of one document id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentState {
    Unloaded,
    Loading,
    Loaded,
    /// Loaded with no subscribers, waiting out the grace period.
    Evictable,
}

/// Shared ownership handle for one document.
pub struct DocumentHandle {
    document_id: Uuid,
    doc: OnceCell<tokio::sync::Mutex<Doc>>,
    loading: AtomicBool,
}

impl DocumentHandle {
    fn new(document_id: Uuid) -> Self {
        Self {
            document_id,
            doc: OnceCell::new(),
            loading: AtomicBool::new(false),
        }
    }

    pub fn document_id(&self) -> Uuid {
        self.document_id
    }

    pub fn is_loaded(&self) -> bool {
        self.doc.initialized()
    }

    fn doc(&self) -> Result<&tokio::sync::Mutex<Doc>, RelayError> {
        self.doc.get().ok_or_else(|| {
            RelayError::Internal(format!("document {} is not loaded", self.document_id))
        })
    }

    /// Full document state as one v1 update.
    pub async fn encode_state(&self) -> Result<Vec<u8>, RelayError> {
        let doc = self.doc()?.lock().await;
        let txn = doc.transact();
        Ok(txn.encode_state_as_update_v1(&StateVector::default()))
    }

    pub async fn state_vector(&self) -> Result<StateVector, RelayError> {
        let doc = self.doc()?.lock().await;
        let txn = doc.transact();
        Ok(txn.state_vector())
    }
}

impl std::fmt::Debug for DocumentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentHandle")
            .field("document_id", &self.document_id)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

/// Clears the loading flag even if the load future is dropped.
struct LoadingGuard<'a>(&'a AtomicBool);

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct Slot {
    handle: Arc<DocumentHandle>,
    subscribers: usize,
    released_at: Option<Instant>,
}

impl Slot {
    fn state(&self) -> DocumentState {
        if !self.handle.is_loaded() {
            if self.handle.loading.load(Ordering::Acquire) {
                DocumentState::Loading
            } else {
                DocumentState::Unloaded
            }
        } else if self.subscribers == 0 {
            DocumentState::Evictable
        } else {
            DocumentState::Loaded
        }
    }
}

/// What to do after a `sync-message` was processed.
#[derive(Debug, Default, PartialEq)]
pub struct SyncOutcome {
    /// Encoded y-sync message for the sender only.
    pub reply: Option<Vec<u8>>,
    /// Encoded y-sync message for the rest of the room.
    pub relay: Option<Vec<u8>>,
}

/// Table of live documents plus the sync logic applied to them.
pub struct CrdtRelay {
    store: Arc<dyn DocumentStore>,
    table: Mutex<HashMap<Uuid, Slot>>,
    grace: Duration,
    max_update_bytes: usize,
}

impl CrdtRelay {
    pub fn new(store: Arc<dyn DocumentStore>, grace: Duration) -> Self {
        Self {
            store,
            table: Mutex::new(HashMap::new()),
            grace,
            max_update_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }

    /// Reject client payloads larger than `limit` bytes before decoding.
    pub fn with_max_update_bytes(mut self, limit: usize) -> Self {
        self.max_update_bytes = limit;
        self
    }

    fn check_size(&self, bytes: &[u8]) -> Result<(), RelayError> {
        if bytes.len() > self.max_update_bytes {
            return Err(RelayError::MalformedMessage(format!(
                "{} bytes exceeds the {} byte limit",
                bytes.len(),
                self.max_update_bytes
            )));
        }
        Ok(())
    }

    fn table(&self) -> Result<MutexGuard<'_, HashMap<Uuid, Slot>>, RelayError> {
        self.table
            .lock()
            .map_err(|_| RelayError::Internal("document table poisoned".into()))
    }

    fn handle(&self, document_id: Uuid) -> Result<Arc<DocumentHandle>, RelayError> {
        self.table()?
            .get(&document_id)
            .map(|slot| slot.handle.clone())
            .ok_or(RelayError::NotJoined(document_id))
    }

    // ── lifecycle ────────────────────────────────────────────────

    /// Register one subscriber, creating the handle if needed.
    ///
    /// Must be paired with [`release`](Self::release), including when the
    /// subsequent load fails.
    pub fn acquire(&self, document_id: Uuid) -> Result<Arc<DocumentHandle>, RelayError> {
        let mut table = self.table()?;
        let slot = table.entry(document_id).or_insert_with(|| Slot {
            handle: Arc::new(DocumentHandle::new(document_id)),
            subscribers: 0,
            released_at: None,
        });
        slot.subscribers += 1;
        slot.released_at = None;
        Ok(slot.handle.clone())
    }

    /// Drop one subscriber. At zero the document becomes evictable.
    pub fn release(&self, document_id: Uuid) -> Result<(), RelayError> {
        let mut table = self.table()?;
        if let Some(slot) = table.get_mut(&document_id) {
            slot.subscribers = slot.subscribers.saturating_sub(1);
            if slot.subscribers == 0 {
                slot.released_at = Some(Instant::now());
                log::debug!("Document {document_id} has no subscribers, evictable");
            }
        }
        Ok(())
    }

    /// Initialise the handle's doc from the store. No-op once loaded.
    pub async fn load(&self, handle: &DocumentHandle) -> Result<(), RelayError> {
        if handle.is_loaded() {
            return Ok(());
        }
        handle.loading.store(true, Ordering::Release);
        let _guard = LoadingGuard(&handle.loading);
        let document_id = handle.document_id;

        handle
            .doc
            .get_or_try_init(|| async {
                let doc = Doc::new();
                if let Some(state) = self.store.load(document_id).await? {
                    inspect::check_update(&state)
                        .and_then(|()| integrate(&doc, &state))
                        .map_err(|e| {
                            RelayError::Internal(format!("stored state of {document_id}: {e}"))
                        })?;
                    log::info!("Loaded document {document_id} ({} bytes)", state.len());
                } else {
                    log::info!("Created document {document_id}");
                }
                Ok::<_, RelayError>(tokio::sync::Mutex::new(doc))
            })
            .await?;
        Ok(())
    }

    /// Acquire and load in one step, releasing again if the load fails.
    pub async fn open(&self, document_id: Uuid) -> Result<Arc<DocumentHandle>, RelayError> {
        let handle = self.acquire(document_id)?;
        if let Err(e) = self.load(&handle).await {
            self.release(document_id)?;
            return Err(e);
        }
        Ok(handle)
    }

    pub fn state(&self, document_id: Uuid) -> DocumentState {
        self.table()
            .ok()
            .and_then(|table| table.get(&document_id).map(Slot::state))
            .unwrap_or(DocumentState::Unloaded)
    }

    pub fn subscribers(&self, document_id: Uuid) -> usize {
        self.table()
            .ok()
            .and_then(|table| table.get(&document_id).map(|slot| slot.subscribers))
            .unwrap_or(0)
    }

    /// Number of documents held in memory.
    pub fn len(&self) -> usize {
        self.table().map(|table| table.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flush and drop every document whose grace period ended before `now`.
    ///
    /// A document re-acquired while its flush is in flight stays loaded.
    pub async fn evict_expired(&self, now: Instant) -> Result<Vec<Uuid>, RelayError> {
        let candidates: Vec<(Arc<DocumentHandle>, Instant)> = self
            .table()?
            .values()
            .filter(|slot| slot.subscribers == 0)
            .filter_map(|slot| {
                let released = slot.released_at?;
                (now.saturating_duration_since(released) >= self.grace)
                    .then(|| (slot.handle.clone(), released))
            })
            .collect();

        let mut evicted = Vec::new();
        for (handle, released) in candidates {
            let document_id = handle.document_id;
            if handle.is_loaded() {
                if let Err(e) = self.flush(&handle).await {
                    // Keep it in memory and retry on the next sweep.
                    log::error!("Failed to flush {document_id} before eviction: {e}");
                    continue;
                }
            }

            let mut table = self.table()?;
            let unchanged = table.get(&document_id).is_some_and(|slot| {
                slot.subscribers == 0
                    && slot.released_at == Some(released)
                    && Arc::ptr_eq(&slot.handle, &handle)
            });
            if unchanged {
                table.remove(&document_id);
                log::info!("Evicted document {document_id}");
                evicted.push(document_id);
            }
        }
        Ok(evicted)
    }

    /// Save every loaded document. Returns how many were written.
    pub async fn flush_all(&self) -> Result<usize, RelayError> {
        let handles: Vec<Arc<DocumentHandle>> = self
            .table()?
            .values()
            .filter(|slot| slot.handle.is_loaded())
            .map(|slot| slot.handle.clone())
            .collect();

        let mut flushed = 0;
        for handle in handles {
            match self.flush(&handle).await {
                Ok(()) => flushed += 1,
                Err(e) => log::error!("Failed to flush {}: {e}", handle.document_id),
            }
        }
        log::info!("Flushed {flushed} document(s)");
        Ok(flushed)
    }

    async fn flush(&self, handle: &DocumentHandle) -> Result<(), RelayError> {
        let state = handle.encode_state().await?;
        self.store.save(handle.document_id, &state).await?;
        Ok(())
    }

    // ── sync protocol ────────────────────────────────────────────

    /// SyncStep1 carrying the server's state vector, for a newly joined connection.
    pub async fn on_join(&self, document_id: Uuid) -> Result<Vec<u8>, RelayError> {
        let handle = self.handle(document_id)?;
        let sv = handle.state_vector().await?;
        Ok(Message::Sync(SyncMessage::SyncStep1(sv)).encode_v1())
    }

    /// Process one y-sync frame from a room member.
    pub async fn on_sync_message(
        &self,
        document_id: Uuid,
        message: &[u8],
    ) -> Result<SyncOutcome, RelayError> {
        self.check_size(message)?;
        let frame = inspect::sync_frame(message)?;
        let handle = self.handle(document_id)?;

        match frame {
            SyncFrame::Step1(remote_sv) => {
                let doc = handle.doc()?.lock().await;
                let diff = diff_since(&doc, remote_sv)?;
                Ok(SyncOutcome {
                    reply: Some(Message::Sync(SyncMessage::SyncStep2(diff)).encode_v1()),
                    relay: None,
                })
            }
            SyncFrame::Step2(update) => {
                // Handshake content: relay only what was actually new.
                let advanced = apply_update(&handle, update).await?;
                Ok(SyncOutcome {
                    reply: None,
                    relay: advanced.map(|diff| Message::Sync(SyncMessage::Update(diff)).encode_v1()),
                })
            }
            SyncFrame::Update(update) => {
                apply_update(&handle, update).await?;
                Ok(SyncOutcome {
                    reply: None,
                    relay: Some(Message::Sync(SyncMessage::Update(update.to_vec())).encode_v1()),
                })
            }
            SyncFrame::Other(tag) => {
                log::debug!("Ignoring non-sync frame (tag {tag}) for {document_id}");
                Ok(SyncOutcome::default())
            }
        }
    }

    /// Apply a raw incremental update. The caller relays the original bytes.
    pub async fn on_update(&self, document_id: Uuid, update: &[u8]) -> Result<(), RelayError> {
        self.check_size(update)?;
        let handle = self.handle(document_id)?;
        apply_update(&handle, update).await?;
        Ok(())
    }
}

/// Check, then decode and apply `bytes` under the doc lock. Returns the newly
/// integrated diff if the state vector advanced.
async fn apply_update(
    handle: &DocumentHandle,
    bytes: &[u8],
) -> Result<Option<Vec<u8>>, RelayError> {
    inspect::check_update(bytes)?;
    let doc = handle.doc()?.lock().await;
    integrate(&doc, bytes).map_err(|e| match e {
        RelayError::Internal(reason) => {
            RelayError::Internal(format!("apply to {}: {reason}", handle.document_id))
        }
        other => other,
    })
}

/// Decode a checked update into `doc`. Never awaits, so the decoded update
/// stays on this thread.
fn integrate(doc: &Doc, bytes: &[u8]) -> Result<Option<Vec<u8>>, RelayError> {
    let update = Update::decode_v1(bytes)?;
    let mut txn = doc.transact_mut();
    let before = txn.state_vector();
    txn.apply_update(update)
        .map_err(|e| RelayError::Internal(e.to_string()))?;
    let after = txn.state_vector();
    Ok((after != before).then(|| txn.encode_diff_v1(&before)))
}

fn diff_since(doc: &Doc, remote_sv: &[u8]) -> Result<Vec<u8>, RelayError> {
    let remote_sv = StateVector::decode_v1(remote_sv)?;
    let txn = doc.transact();
    Ok(txn.encode_diff_v1(&remote_sv))
}
