//! Room-scoped fan-out to per-connection outboxes.
//!
//! Every connection owns a bounded mpsc outbox drained by its writer task.
//! A message is encoded once and the same `Arc<Vec<u8>>` is pushed to each
//! recipient with `try_send`, so delivery order within a room follows call
//! order and a fan-out never waits on a slow socket.
//!
//! A full outbox means the peer is lagging. Its outbox is dropped, the
//! writer sees the channel close and hangs up, and the client re-syncs on
//! reconnect instead of silently missing updates.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

use crate::protocol::{ConnectionId, ServerMessage};
use crate::registry::RoomRegistry;

/// Encoded frames waiting for one connection's writer.
pub type Outbox = mpsc::Receiver<Arc<Vec<u8>>>;

/// Counters for monitoring fan-out health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Frames queued to an outbox.
    pub messages_sent: u64,
    /// Frames not delivered because the outbox was full or closed.
    pub messages_dropped: u64,
    /// Connections with a live outbox.
    pub connections: usize,
}

pub struct Dispatcher {
    outboxes: HashMap<ConnectionId, mpsc::Sender<Arc<Vec<u8>>>>,
    capacity: usize,
    messages_sent: u64,
    messages_dropped: u64,
}

impl Dispatcher {
    /// `capacity` is the number of frames buffered per connection before it
    /// counts as lagging.
    pub fn new(capacity: usize) -> Self {
        Self {
            outboxes: HashMap::new(),
            capacity: capacity.max(1),
            messages_sent: 0,
            messages_dropped: 0,
        }
    }

    /// Open an outbox for `conn`. Replaces any previous one.
    pub fn register(&mut self, conn: ConnectionId) -> Outbox {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.outboxes.insert(conn, tx);
        rx
    }

    pub fn unregister(&mut self, conn: ConnectionId) -> bool {
        self.outboxes.remove(&conn).is_some()
    }

    pub fn is_connected(&self, conn: ConnectionId) -> bool {
        self.outboxes.contains_key(&conn)
    }

    /// Deliver to every subscriber of the room.
    pub fn to_room(
        &mut self,
        rooms: &RoomRegistry,
        document_id: Uuid,
        msg: &ServerMessage,
    ) -> usize {
        let targets: Vec<ConnectionId> = rooms.members(document_id).collect();
        self.deliver(&targets, msg)
    }

    /// Deliver to every subscriber of the room except `sender`.
    pub fn to_room_except(
        &mut self,
        rooms: &RoomRegistry,
        document_id: Uuid,
        msg: &ServerMessage,
        sender: ConnectionId,
    ) -> usize {
        let targets: Vec<ConnectionId> = rooms
            .members(document_id)
            .filter(|conn| *conn != sender)
            .collect();
        self.deliver(&targets, msg)
    }

    /// Unicast.
    pub fn to_connection(&mut self, conn: ConnectionId, msg: &ServerMessage) -> bool {
        self.deliver(&[conn], msg) == 1
    }

    /// Returns how many outboxes accepted the frame.
    fn deliver(&mut self, targets: &[ConnectionId], msg: &ServerMessage) -> usize {
        if targets.is_empty() {
            return 0;
        }
        let frame = match msg.encode() {
            Ok(bytes) => Arc::new(bytes),
            Err(e) => {
                log::error!("Failed to encode {}: {e}", msg.event_name());
                return 0;
            }
        };

        let mut delivered = 0;
        for conn in targets {
            let Some(tx) = self.outboxes.get(conn) else {
                continue;
            };
            match tx.try_send(frame.clone()) {
                Ok(()) => {
                    delivered += 1;
                    self.messages_sent += 1;
                }
                Err(TrySendError::Full(_)) => {
                    log::warn!("{conn} lagging on {}, disconnecting", msg.event_name());
                    self.outboxes.remove(conn);
                    self.messages_dropped += 1;
                }
                Err(TrySendError::Closed(_)) => {
                    self.outboxes.remove(conn);
                    self.messages_dropped += 1;
                }
            }
        }
        log::trace!(
            "{} delivered to {delivered}/{} connection(s)",
            msg.event_name(),
            targets.len()
        );
        delivered
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            messages_sent: self.messages_sent,
            messages_dropped: self.messages_dropped,
            connections: self.outboxes.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
