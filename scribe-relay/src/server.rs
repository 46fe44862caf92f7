//! WebSocket transport for the relay.
//!
//! Architecture:
//! ```text
//! Client A ──┐  upgrade (+ bearer)  ┌──────────────┐
//!             ├───────────────────► │ RelayServer  │ ── frame ──► CollabService
//! Client B ──┘                      │ one task per │ ◄── outbox ──┘
//!                                   │ connection   │
//!                                   └──────────────┘
//! ```
//!
//! Each connection task:
//! 1. captures the bearer token during the HTTP upgrade,
//! 2. runs the session gate once (failure: one `error` frame, then close),
//! 3. forwards binary frames to the service in arrival order,
//! 4. drains its outbox to the socket until either side closes.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;

use crate::auth::bearer_token;
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::protocol::ServerMessage;
use crate::service::CollabService;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Headroom for the bincode envelope around a maximal CRDT payload.
const ENVELOPE_BYTES: usize = 1024;

/// Aborts the wrapped task when dropped.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub struct RelayServer {
    config: RelayConfig,
    service: Arc<CollabService>,
}

impl RelayServer {
    pub fn new(config: RelayConfig, service: Arc<CollabService>) -> Self {
        Self { config, service }
    }

    pub fn service(&self) -> &Arc<CollabService> {
        &self.service
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Bind the configured address and serve until the future is dropped.
    pub async fn run(&self) -> Result<(), RelayError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    fn ws_config(&self) -> WebSocketConfig {
        let limit = self.config.max_message_bytes.saturating_add(ENVELOPE_BYTES);
        WebSocketConfig::default()
            .max_message_size(Some(limit))
            .max_frame_size(Some(limit))
    }

    /// Serve on an already bound listener. Also drives the maintenance sweep.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RelayError> {
        let _sweeper = AbortOnDrop(self.service.spawn_sweeper(self.config.sweep_interval()));

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let service = self.service.clone();
            let ws_config = self.ws_config();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, service, ws_config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }
}

/// Handle a single WebSocket connection.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    service: Arc<CollabService>,
    ws_config: WebSocketConfig,
) -> Result<(), BoxError> {
    let mut token = None;
    let capture = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        token = bearer_token(req);
        Ok(resp)
    };
    let ws_stream =
        tokio_tungstenite::accept_hdr_async_with_config(stream, capture, Some(ws_config)).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let identity = match service.authenticate(token.as_deref()).await {
        Ok(identity) => identity,
        Err(e) => {
            log::info!("Rejected connection from {addr}: {e}");
            let frame = ServerMessage::error(e.client_message()).encode()?;
            ws_sender.send(Message::Binary(frame.into())).await?;
            ws_sender.send(Message::Close(None)).await?;
            return Ok(());
        }
    };

    let mut connection = service.connect(identity).await;
    let conn = connection.id;
    log::info!("WebSocket connection established from {addr} as {conn}");

    let result = async {
        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            service.handle_frame(conn, &data).await;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }
                        Some(Ok(Message::Text(_))) => {
                            log::debug!("{conn} sent a text frame, ignored");
                        }
                        Some(Err(e)) => {
                            log::warn!("WebSocket error from {addr}: {e}");
                            break;
                        }
                        _ => {}
                    }
                }

                // Outgoing frames queued by the dispatcher
                frame = connection.outbox.recv() => {
                    match frame {
                        Some(bytes) => {
                            ws_sender.send(Message::Binary(bytes.to_vec().into())).await?;
                        }
                        None => {
                            // Outbox dropped: lagging, hang up so the client re-syncs.
                            log::warn!("{conn} outbox closed, disconnecting");
                            let _ = ws_sender.send(Message::Close(None)).await;
                            break;
                        }
                    }
                }
            }
        }
        Ok::<(), BoxError>(())
    }
    .await;

    service.disconnect(conn).await;
    result
}
