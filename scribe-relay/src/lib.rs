//! # scribe-relay: Real-time collaboration relay
//!
//! Lets many clients co-edit one document over WebSockets. The relay keeps
//! one authoritative yrs document per document id and a live presence roster
//! per document room.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────┐
//! │ RelayClient │ ◄─────────────────► │ RelayServer  │
//! │ (per user)  │   bincode frames    │ (transport)  │
//! └─────────────┘                     └──────┬───────┘
//!                                            │
//!                                    ┌───────▼────────┐
//!                                    │ CollabService  │
//!                                    └───────┬────────┘
//!          ┌──────────────┬──────────────────┼───────────────┬──────────────┐
//!          ▼              ▼                  ▼               ▼              ▼
//!    SessionGate    RoomRegistry      PresenceStore     CrdtRelay     Dispatcher
//!    (JWT, once)    (doc → conns)     (doc → users)    (doc → Doc)   (outboxes)
//!                                                           │
//!                                                     DocumentStore
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Closed client/server message enums (bincode)
//! - [`auth`]: Session gate and identity collaborator
//! - [`registry`]: Room membership and access collaborator
//! - [`presence`]: Per-room presence records and liveness policy
//! - [`relay`]: yrs documents and the y-sync handshake
//! - [`inspect`]: Bounded checks on update and sync payloads before decoding
//! - [`broadcast`]: Room fan-out with backpressure
//! - [`storage`]: Persisted document loader/saver
//! - [`service`]: Coordinating service object
//! - [`server`] / [`client`]: WebSocket endpoints
//! - [`config`], [`directory`], [`error`]: Environment config, bundled user/workspace directory, errors

pub mod auth;
pub mod broadcast;
pub mod client;
pub mod config;
pub mod directory;
pub mod error;
pub mod inspect;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod server;
pub mod service;
pub mod storage;

// Re-exports for convenience
pub use auth::{issue_token, Claims, Identity, IdentityProvider, SessionGate, UserProfile};
pub use broadcast::{DispatchStats, Dispatcher};
pub use client::{ClientEvent, ConnectionState, RelayClient};
pub use config::RelayConfig;
pub use directory::Directory;
pub use error::RelayError;
pub use presence::{
    CursorPosition, PresencePatch, PresencePolicy, PresenceRecord, PresenceStatus, PresenceStore,
    SelectionRange,
};
pub use protocol::{ClientMessage, ConnectionId, ProtocolError, ServerMessage};
pub use registry::{AccessValidator, RoomRegistry};
pub use relay::{CrdtRelay, DocumentHandle, DocumentState, SyncOutcome};
pub use server::RelayServer;
pub use service::{CollabService, ServiceStats};
pub use storage::{DocumentStore, FileStore, MemoryStore, StoreError};
