//! WebSocket client for the relay.
//!
//! Provides:
//! - Connection lifecycle with a bearer token in the upgrade request
//! - Typed helpers for every client event
//! - Server events and connection state surfaced as [`ClientEvent`]s
//!
//! Used by the integration tests and benchmarks; also fine for native tools.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::presence::PresencePatch;
use crate::protocol::{ClientMessage, ProtocolError, ServerMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// WebSocket upgrade completed
    Connected,
    /// Socket closed by either side
    Disconnected,
    /// A frame from the relay
    Message(ServerMessage),
}

pub struct RelayClient {
    server_url: String,
    token: Option<String>,
    state: Arc<RwLock<ConnectionState>>,
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
    event_tx: mpsc::Sender<ClientEvent>,
}

impl RelayClient {
    /// `token` is sent as `Authorization: Bearer <token>`; `None` connects
    /// without credentials.
    pub fn new(server_url: impl Into<String>, token: Option<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            server_url: server_url.into(),
            token,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Connect to the relay.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let mut request = self
            .server_url
            .as_str()
            .into_client_request()
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| ProtocolError::Encode(e.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let ws_stream = match tokio_tungstenite::connect_async(request).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::debug!("Connect to {} failed: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket, close when the
        // channel is dropped.
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(ClientEvent::Connected).await;

        // Reader task: decode relay frames into events
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match ServerMessage::decode(&data) {
                        Ok(server_msg) => {
                            if event_tx.send(ClientEvent::Message(server_msg)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Undecodable frame from relay: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(ClientEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Close the connection. Pending outgoing frames are flushed first.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
    }

    /// Send any client message.
    pub async fn send(&self, msg: &ClientMessage) -> Result<(), ProtocolError> {
        let encoded = msg.encode()?;
        self.send_raw(encoded).await
    }

    /// Send a pre-encoded frame as-is.
    pub async fn send_raw(&self, frame: Vec<u8>) -> Result<(), ProtocolError> {
        let tx = self
            .outgoing_tx
            .as_ref()
            .ok_or(ProtocolError::ConnectionClosed)?;
        tx.send(frame)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    pub async fn join(
        &self,
        document_id: Uuid,
        workspace_id: Uuid,
        display_name: Option<&str>,
    ) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::JoinRoom {
            document_id,
            workspace_id,
            display_name: display_name.map(str::to_string),
            avatar_url: None,
            color: None,
        })
        .await
    }

    pub async fn leave(&self, document_id: Uuid) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::LeaveRoom { document_id }).await
    }

    /// Send a raw yrs v1 update.
    pub async fn send_update(&self, document_id: Uuid, update: Vec<u8>) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Update {
            document_id,
            update,
        })
        .await
    }

    /// Send an encoded y-sync message.
    pub async fn send_sync(&self, document_id: Uuid, message: Vec<u8>) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::SyncMessage {
            document_id,
            message,
        })
        .await
    }

    pub async fn update_presence(
        &self,
        document_id: Uuid,
        presence: PresencePatch,
    ) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::PresenceUpdate {
            document_id,
            presence,
        })
        .await
    }

    pub async fn heartbeat(&self, document_id: Uuid) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::PresenceHeartbeat { document_id })
            .await
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Get the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}
