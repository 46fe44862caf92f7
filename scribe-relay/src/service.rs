//! Coordinating service: owns every piece of relay state.
//!
//! ```text
//!                       ┌──────────────────── CollabService ─────────────────────┐
//! ws task ── frame ──►  │ SessionGate   (once, at upgrade)                        │
//!                       │ Mutex<State>  connections · RoomRegistry ·               │
//!                       │               PresenceStore · Dispatcher                 │
//!                       │ CrdtRelay     document table (own lock)                  │
//!                       └──────────────────────────────────────────────────────────┘
//! ```
//!
//! The state mutex is never held across a collaborator call. Join releases it
//! for the access check and the document load, then re-checks that the
//! connection is still live before touching shared state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::auth::{Identity, IdentityProvider, SessionGate};
use crate::broadcast::{DispatchStats, Dispatcher, Outbox};
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::presence::{
    color_for_user, now_millis, Heartbeat, PresencePatch, PresencePolicy, PresenceRecord,
    PresenceStore,
};
use crate::protocol::{ClientMessage, ConnectionId, ServerMessage};
use crate::registry::{check_access, AccessValidator, Admission, Departure, RoomRegistry};
use crate::relay::CrdtRelay;
use crate::storage::DocumentStore;

/// Per-connection context. Identity is fixed at authentication.
#[derive(Debug)]
struct ConnectionContext {
    identity: Identity,
    joined: Option<JoinedRoom>,
}

/// Profile the connection joined its room with.
#[derive(Debug, Clone)]
struct JoinedRoom {
    document_id: Uuid,
    display_name: String,
    avatar_url: Option<String>,
    color: String,
}

struct State {
    connections: HashMap<ConnectionId, ConnectionContext>,
    rooms: RoomRegistry,
    presence: PresenceStore,
    dispatcher: Dispatcher,
}

impl State {
    fn to_room(&mut self, document_id: Uuid, msg: &ServerMessage) -> usize {
        self.dispatcher.to_room(&self.rooms, document_id, msg)
    }

    fn to_room_except(&mut self, document_id: Uuid, msg: &ServerMessage, sender: ConnectionId) -> usize {
        self.dispatcher
            .to_room_except(&self.rooms, document_id, msg, sender)
    }

    fn user_of(&self, conn: ConnectionId) -> Option<Uuid> {
        self.connections.get(&conn).map(|ctx| ctx.identity.user_id)
    }

    /// Presence cleanup after a connection left its room.
    fn depart(&mut self, departure: Departure) {
        let Departure {
            document_id,
            user_id,
            user_still_present,
            ..
        } = departure;
        if user_still_present {
            return;
        }
        if self.presence.remove(document_id, user_id).is_some() {
            self.to_room(
                document_id,
                &ServerMessage::PresenceRemoved {
                    document_id,
                    user_id,
                },
            );
        }
    }
}

/// A freshly registered connection.
pub struct Connection {
    pub id: ConnectionId,
    pub identity: Identity,
    /// Frames for this connection; closes when it must hang up.
    pub outbox: Outbox,
}

/// Counters across the whole relay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceStats {
    pub connections: usize,
    pub rooms: usize,
    pub documents: usize,
    pub dispatch: DispatchStats,
}

/// Result of one maintenance pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub presence_changes: usize,
    pub evicted: Vec<Uuid>,
}

pub struct CollabService {
    gate: SessionGate,
    validator: Arc<dyn AccessValidator>,
    relay: CrdtRelay,
    state: Mutex<State>,
    join_timeout: Duration,
    policy: PresencePolicy,
}

impl CollabService {
    pub fn new(
        config: &RelayConfig,
        identities: Arc<dyn IdentityProvider>,
        validator: Arc<dyn AccessValidator>,
        store: Arc<dyn DocumentStore>,
    ) -> Self {
        Self {
            gate: SessionGate::new(&config.jwt_secret, identities),
            validator,
            relay: CrdtRelay::new(store, config.eviction_grace())
                .with_max_update_bytes(config.max_message_bytes),
            state: Mutex::new(State {
                connections: HashMap::new(),
                rooms: RoomRegistry::new(),
                presence: PresenceStore::new(),
                dispatcher: Dispatcher::new(config.outbox_capacity),
            }),
            join_timeout: config.join_timeout(),
            policy: config.presence_policy(),
        }
    }

    pub fn relay(&self) -> &CrdtRelay {
        &self.relay
    }

    // ── connection lifecycle ─────────────────────────────────────

    /// Run the session gate for a bearer token.
    pub async fn authenticate(&self, token: Option<&str>) -> Result<Identity, RelayError> {
        self.gate.authenticate(token).await
    }

    /// Register an authenticated connection and open its outbox.
    pub async fn connect(&self, identity: Identity) -> Connection {
        let id = ConnectionId::new();
        let mut state = self.state.lock().await;
        let outbox = state.dispatcher.register(id);
        state.connections.insert(
            id,
            ConnectionContext {
                identity: identity.clone(),
                joined: None,
            },
        );
        log::info!("{id} connected as user {}", identity.user_id);
        Connection {
            id,
            identity,
            outbox,
        }
    }

    /// Full cleanup for a closed connection. Safe to call twice.
    pub async fn disconnect(&self, conn: ConnectionId) {
        let mut state = self.state.lock().await;
        let known = state.connections.remove(&conn).is_some();
        state.dispatcher.unregister(conn);

        if let Some(departure) = state.rooms.disconnect(conn) {
            self.release(departure.document_id);
            state.depart(departure);
        }
        if known {
            log::info!("{conn} disconnected");
        }
    }

    pub async fn is_connected(&self, conn: ConnectionId) -> bool {
        self.state.lock().await.connections.contains_key(&conn)
    }

    // ── message handling ─────────────────────────────────────────

    /// Decode and handle one binary frame. Undecodable frames are dropped.
    pub async fn handle_frame(&self, conn: ConnectionId, frame: &[u8]) {
        match ClientMessage::decode(frame) {
            Ok(msg) => self.handle(conn, msg).await,
            Err(e) => log::warn!("{conn} sent a malformed frame: {e}"),
        }
    }

    /// Handle one client message. Client-visible failures are answered with
    /// an `error` event, everything else is logged and dropped.
    pub async fn handle(&self, conn: ConnectionId, msg: ClientMessage) {
        let event = msg.event_name();
        let document_id = msg.document_id();
        log::debug!("{conn} {event} {document_id}");

        let result = match msg {
            ClientMessage::JoinRoom {
                document_id,
                workspace_id,
                display_name,
                avatar_url,
                color,
            } => {
                let request = JoinRequest {
                    document_id,
                    workspace_id,
                    display_name,
                    avatar_url,
                    color,
                };
                self.join(conn, request).await
            }
            ClientMessage::LeaveRoom { document_id } => self.leave(conn, document_id).await,
            ClientMessage::SyncMessage {
                document_id,
                message,
            } => self.sync_message(conn, document_id, message).await,
            ClientMessage::Update {
                document_id,
                update,
            } => self.update(conn, document_id, update).await,
            ClientMessage::PresenceUpdate {
                document_id,
                presence,
            } => self.presence_update(conn, document_id, presence).await,
            ClientMessage::PresenceHeartbeat { document_id } => {
                self.heartbeat(conn, document_id).await
            }
        };

        if let Err(e) = result {
            self.report(conn, event, e).await;
        }
    }

    async fn report(&self, conn: ConnectionId, event: &str, error: RelayError) {
        if error.is_client_visible() {
            log::info!("{conn} {event} rejected: {error}");
            self.state
                .lock()
                .await
                .dispatcher
                .to_connection(conn, &ServerMessage::error(error.client_message()));
            return;
        }
        match error {
            RelayError::Internal(_) | RelayError::Io(_) => {
                log::error!("{conn} {event} failed: {error}")
            }
            _ => log::warn!("{conn} {event} dropped: {error}"),
        }
    }

    async fn join(&self, conn: ConnectionId, request: JoinRequest) -> Result<(), RelayError> {
        let document_id = request.document_id;
        let (identity, rejoin) = {
            let state = self.state.lock().await;
            let Some(ctx) = state.connections.get(&conn) else {
                return Ok(());
            };
            let rejoin = match state.rooms.joined_document(conn) {
                Some(current) if current != document_id => {
                    return Err(RelayError::AlreadyJoined(current))
                }
                Some(_) => true,
                None => false,
            };
            (ctx.identity.clone(), rejoin)
        };
        let user_id = identity.user_id;

        let deadline = tokio::time::Instant::now() + self.join_timeout;
        tokio::time::timeout_at(
            deadline,
            check_access(
                self.validator.as_ref(),
                user_id,
                request.workspace_id,
                document_id,
            ),
        )
        .await
        .map_err(|_| RelayError::Timeout)??;

        if !rejoin {
            if !self.is_connected(conn).await {
                log::debug!("{conn} gone before document load, join abandoned");
                return Ok(());
            }
            let handle = self.relay.acquire(document_id)?;
            let loaded = match tokio::time::timeout_at(deadline, self.relay.load(&handle)).await {
                Ok(result) => result,
                Err(_) => Err(RelayError::Timeout),
            };
            if let Err(e) = loaded {
                self.release(document_id);
                return Err(e);
            }
        }

        let step1 = match self.relay.on_join(document_id).await {
            Ok(bytes) => bytes,
            Err(e) => {
                if !rejoin {
                    self.release(document_id);
                }
                return Err(e);
            }
        };

        let mut state = self.state.lock().await;
        if !state.connections.contains_key(&conn) {
            if !rejoin {
                self.release(document_id);
            }
            log::debug!("{conn} gone during join of {document_id}, nothing emitted");
            return Ok(());
        }
        match state.rooms.admit(conn, user_id, document_id) {
            Ok(Admission::Joined) => {}
            // Subscription already counted by the first join.
            Ok(Admission::Rejoined) => {
                if !rejoin {
                    self.release(document_id);
                }
            }
            Err(e) => {
                if !rejoin {
                    self.release(document_id);
                }
                return Err(e);
            }
        }

        let joined = JoinedRoom {
            document_id,
            display_name: request
                .display_name
                .or_else(|| identity.profile.display_name.clone())
                .unwrap_or_else(|| format!("User-{user_id}")),
            avatar_url: request
                .avatar_url
                .or_else(|| identity.profile.avatar_url.clone()),
            color: request.color.unwrap_or_else(|| color_for_user(user_id)),
        };
        let record = PresenceRecord::new(
            user_id,
            joined.display_name.clone(),
            joined.avatar_url.clone(),
            joined.color.clone(),
        );
        if let Some(ctx) = state.connections.get_mut(&conn) {
            ctx.joined = Some(joined);
        }

        let presences = state.presence.upsert(document_id, record, now_millis());
        let own = presences.iter().find(|p| p.user_id == user_id).cloned();

        state.to_room(
            document_id,
            &ServerMessage::PresenceList {
                document_id,
                presences,
            },
        );
        if let Some(presence) = own {
            state.to_room_except(
                document_id,
                &ServerMessage::PresenceUpdated {
                    document_id,
                    presence,
                },
                conn,
            );
        }
        state.dispatcher.to_connection(
            conn,
            &ServerMessage::SyncMessage {
                document_id,
                message: step1,
            },
        );

        log::info!(
            "{conn} joined {document_id} ({} in room)",
            state.rooms.member_count(document_id)
        );
        Ok(())
    }

    async fn leave(&self, conn: ConnectionId, document_id: Uuid) -> Result<(), RelayError> {
        let mut state = self.state.lock().await;
        let Some(departure) = state.rooms.leave(conn, document_id) else {
            return Ok(());
        };
        if let Some(ctx) = state.connections.get_mut(&conn) {
            ctx.joined = None;
        }
        self.release(document_id);
        state.depart(departure);
        log::info!("{conn} left {document_id}");
        Ok(())
    }

    async fn sync_message(
        &self,
        conn: ConnectionId,
        document_id: Uuid,
        message: Vec<u8>,
    ) -> Result<(), RelayError> {
        self.ensure_member(conn, document_id).await?;
        let outcome = self.relay.on_sync_message(document_id, &message).await?;

        let mut state = self.state.lock().await;
        if let Some(reply) = outcome.reply {
            state.dispatcher.to_connection(
                conn,
                &ServerMessage::SyncMessage {
                    document_id,
                    message: reply,
                },
            );
        }
        if let Some(relayed) = outcome.relay {
            state.to_room_except(
                document_id,
                &ServerMessage::SyncMessage {
                    document_id,
                    message: relayed,
                },
                conn,
            );
        }
        Ok(())
    }

    async fn update(
        &self,
        conn: ConnectionId,
        document_id: Uuid,
        update: Vec<u8>,
    ) -> Result<(), RelayError> {
        self.ensure_member(conn, document_id).await?;
        self.relay.on_update(document_id, &update).await?;

        let mut state = self.state.lock().await;
        let peers = state.to_room_except(
            document_id,
            &ServerMessage::Update {
                document_id,
                update,
            },
            conn,
        );
        log::debug!("{conn} update on {document_id} relayed to {peers} peer(s)");
        Ok(())
    }

    async fn presence_update(
        &self,
        conn: ConnectionId,
        document_id: Uuid,
        patch: PresencePatch,
    ) -> Result<(), RelayError> {
        let mut state = self.state.lock().await;
        if !state.rooms.is_member(conn, document_id) {
            return Err(RelayError::NotJoined(document_id));
        }
        let Some(user_id) = state.user_of(conn) else {
            return Ok(());
        };

        let Some(presence) = state
            .presence
            .update(document_id, user_id, &patch, now_millis())
        else {
            log::debug!("{conn} presence update for {document_id} without a record, dropped");
            return Ok(());
        };
        log::trace!("{conn} presence {:?}", presence.cursor);
        state.to_room_except(
            document_id,
            &ServerMessage::PresenceUpdated {
                document_id,
                presence,
            },
            conn,
        );
        Ok(())
    }

    async fn heartbeat(&self, conn: ConnectionId, document_id: Uuid) -> Result<(), RelayError> {
        let mut state = self.state.lock().await;
        if !state.rooms.is_member(conn, document_id) {
            return Err(RelayError::NotJoined(document_id));
        }
        let Some(user_id) = state.user_of(conn) else {
            return Ok(());
        };

        if let Heartbeat::Reactivated(presence) =
            state.presence.heartbeat(document_id, user_id, now_millis())
        {
            state.to_room_except(
                document_id,
                &ServerMessage::PresenceUpdated {
                    document_id,
                    presence,
                },
                conn,
            );
        }
        Ok(())
    }

    async fn ensure_member(&self, conn: ConnectionId, document_id: Uuid) -> Result<(), RelayError> {
        let state = self.state.lock().await;
        if state.rooms.is_member(conn, document_id) {
            Ok(())
        } else {
            Err(RelayError::NotJoined(document_id))
        }
    }

    fn release(&self, document_id: Uuid) {
        if let Err(e) = self.relay.release(document_id) {
            log::error!("Failed to release {document_id}: {e}");
        }
    }

    // ── maintenance ──────────────────────────────────────────────

    /// Presence timeouts and document eviction, as of now.
    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(now_millis(), Instant::now()).await
    }

    /// Presence timeouts evaluated at `now_ms`, eviction at `now`.
    pub async fn sweep_at(&self, now_ms: u64, now: Instant) -> SweepReport {
        let presence_changes = {
            let mut state = self.state.lock().await;
            let changed = state.presence.sweep(now_ms, &self.policy);
            for (document_id, presence) in &changed {
                log::debug!(
                    "User {} in {document_id} is now {:?}",
                    presence.user_id,
                    presence.status
                );
                state.to_room(
                    *document_id,
                    &ServerMessage::PresenceUpdated {
                        document_id: *document_id,
                        presence: presence.clone(),
                    },
                );
            }
            changed.len()
        };

        let evicted = match self.relay.evict_expired(now).await {
            Ok(evicted) => evicted,
            Err(e) => {
                log::error!("Eviction pass failed: {e}");
                Vec::new()
            }
        };

        SweepReport {
            presence_changes,
            evicted,
        }
    }

    /// Run [`sweep`](Self::sweep) every `interval` until the task is aborted.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let report = service.sweep().await;
                if report.presence_changes > 0 || !report.evicted.is_empty() {
                    log::debug!(
                        "Sweep: {} presence change(s), {} eviction(s)",
                        report.presence_changes,
                        report.evicted.len()
                    );
                }
            }
        })
    }

    /// Flush every loaded document to the store.
    pub async fn shutdown(&self) -> Result<usize, RelayError> {
        self.relay.flush_all().await
    }

    pub async fn stats(&self) -> ServiceStats {
        let state = self.state.lock().await;
        ServiceStats {
            connections: state.connections.len(),
            rooms: state.rooms.room_count(),
            documents: self.relay.len(),
            dispatch: state.dispatcher.stats(),
        }
    }

    /// Current presence snapshot of a room.
    pub async fn presence(&self, document_id: Uuid) -> Vec<PresenceRecord> {
        self.state.lock().await.presence.snapshot(document_id)
    }

    /// Display profile the connection joined with, if in a room.
    pub async fn joined_as(&self, conn: ConnectionId) -> Option<(Uuid, String, String)> {
        let state = self.state.lock().await;
        let joined = state.connections.get(&conn)?.joined.as_ref()?;
        Some((
            joined.document_id,
            joined.display_name.clone(),
            joined.color.clone(),
        ))
    }
}

struct JoinRequest {
    document_id: Uuid,
    workspace_id: Uuid,
    display_name: Option<String>,
    avatar_url: Option<String>,
    color: Option<String>,
}
