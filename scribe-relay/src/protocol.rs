//! Binary wire protocol between relay and clients.
//!
//! Every WebSocket binary frame carries one bincode-encoded message:
//! ```text
//! client ──► server   ClientMessage   (join-room, leave-room, sync-message,
//!                                      update, presence-update, presence-heartbeat)
//! server ──► client   ServerMessage   (error, presence:list, presence:updated,
//!                                      presence:removed, sync-message, update)
//! ```
//!
//! `sync-message` payloads are y-sync frames (`yrs::sync::Message`, lib0 v1).
//! `update` payloads are raw yrs v1 updates and are relayed byte-for-byte.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::presence::{PresencePatch, PresenceRecord};

/// Opaque identifier of one live transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form keeps log lines readable.
        let s = self.0.simple().to_string();
        write!(f, "conn-{}", &s[..8])
    }
}

/// Messages a client sends to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Join the room of `document_id`, which must live in `workspace_id`.
    JoinRoom {
        document_id: Uuid,
        workspace_id: Uuid,
        display_name: Option<String>,
        avatar_url: Option<String>,
        color: Option<String>,
    },
    LeaveRoom {
        document_id: Uuid,
    },
    /// y-sync handshake or update frame.
    SyncMessage {
        document_id: Uuid,
        message: Vec<u8>,
    },
    /// Raw incremental yrs update.
    Update {
        document_id: Uuid,
        update: Vec<u8>,
    },
    PresenceUpdate {
        document_id: Uuid,
        presence: PresencePatch,
    },
    PresenceHeartbeat {
        document_id: Uuid,
    },
}

impl ClientMessage {
    /// Event name as documented in the external interface.
    pub fn event_name(&self) -> &'static str {
        match self {
            ClientMessage::JoinRoom { .. } => "join-room",
            ClientMessage::LeaveRoom { .. } => "leave-room",
            ClientMessage::SyncMessage { .. } => "sync-message",
            ClientMessage::Update { .. } => "update",
            ClientMessage::PresenceUpdate { .. } => "presence-update",
            ClientMessage::PresenceHeartbeat { .. } => "presence-heartbeat",
        }
    }

    /// Document this message addresses.
    pub fn document_id(&self) -> Uuid {
        match self {
            ClientMessage::JoinRoom { document_id, .. }
            | ClientMessage::LeaveRoom { document_id }
            | ClientMessage::SyncMessage { document_id, .. }
            | ClientMessage::Update { document_id, .. }
            | ClientMessage::PresenceUpdate { document_id, .. }
            | ClientMessage::PresenceHeartbeat { document_id } => *document_id,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

/// Messages the relay sends to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Auth, access or not-found failure. Sent to the offending connection only.
    Error { message: String },
    /// Full roster of the room.
    PresenceList {
        document_id: Uuid,
        presences: Vec<PresenceRecord>,
    },
    /// One user's merged presence record.
    PresenceUpdated {
        document_id: Uuid,
        presence: PresenceRecord,
    },
    PresenceRemoved { document_id: Uuid, user_id: Uuid },
    /// y-sync frame: handshake reply (unicast) or relayed update.
    SyncMessage { document_id: Uuid, message: Vec<u8> },
    /// Verbatim relay of another connection's `update`.
    Update { document_id: Uuid, update: Vec<u8> },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            ServerMessage::Error { .. } => "error",
            ServerMessage::PresenceList { .. } => "presence:list",
            ServerMessage::PresenceUpdated { .. } => "presence:updated",
            ServerMessage::PresenceRemoved { .. } => "presence:removed",
            ServerMessage::SyncMessage { .. } => "sync-message",
            ServerMessage::Update { .. } => "update",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Encode(e.to_string()))
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, read) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Decode(e.to_string()))?;
    if read != bytes.len() {
        return Err(ProtocolError::Decode(format!(
            "{} trailing bytes after message",
            bytes.len() - read
        )));
    }
    Ok(value)
}

/// Wire-level errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Encode(String),
    #[error("deserialization error: {0}")]
    Decode(String),
    #[error("connection closed")]
    ConnectionClosed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::{CursorPosition, PresenceStatus};

    fn sample_record(user_id: Uuid) -> PresenceRecord {
        PresenceRecord {
            user_id,
            display_name: "Alice".into(),
            avatar_url: None,
            color: "#ff0000".into(),
            status: PresenceStatus::Active,
            cursor: Some(CursorPosition { line: 3, index: 14 }),
            selection: None,
            updated_at: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_join_roundtrip() {
        let msg = ClientMessage::JoinRoom {
            document_id: Uuid::new_v4(),
            workspace_id: Uuid::new_v4(),
            display_name: Some("Alice".into()),
            avatar_url: None,
            color: Some("#00ff00".into()),
        };
        let decoded = ClientMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.event_name(), "join-room");
    }

    #[test]
    fn test_update_bytes_preserved() {
        let update: Vec<u8> = (0..=255).collect();
        let msg = ServerMessage::Update {
            document_id: Uuid::new_v4(),
            update: update.clone(),
        };
        match ServerMessage::decode(&msg.encode().unwrap()).unwrap() {
            ServerMessage::Update { update: got, .. } => assert_eq!(got, update),
            other => panic!("Expected Update, got {other:?}"),
        }
    }

    #[test]
    fn test_presence_list_roundtrip() {
        let doc = Uuid::new_v4();
        let msg = ServerMessage::PresenceList {
            document_id: doc,
            presences: vec![sample_record(Uuid::new_v4()), sample_record(Uuid::new_v4())],
        };
        let decoded = ServerMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.event_name(), "presence:list");
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(matches!(
            ClientMessage::decode(&garbage),
            Err(ProtocolError::Decode(_))
        ));
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let msg = ClientMessage::PresenceHeartbeat {
            document_id: Uuid::new_v4(),
        };
        let mut bytes = msg.encode().unwrap();
        bytes.push(0);
        assert!(ClientMessage::decode(&bytes).is_err());
    }

    #[test]
    fn test_document_id_accessor() {
        let doc = Uuid::new_v4();
        let msgs = [
            ClientMessage::LeaveRoom { document_id: doc },
            ClientMessage::Update { document_id: doc, update: vec![] },
            ClientMessage::PresenceHeartbeat { document_id: doc },
        ];
        for msg in msgs {
            assert_eq!(msg.document_id(), doc);
        }
    }

    #[test]
    fn test_connection_id_display() {
        let id = ConnectionId::new();
        let shown = id.to_string();
        assert!(shown.starts_with("conn-"));
        assert_eq!(shown.len(), "conn-".len() + 8);
    }
}
