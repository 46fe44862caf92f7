//! Room registry: which connections are subscribed to which document.
//!
//! Joining is two-phase. [`check_access`] runs the collaborator lookups
//! (workspace membership, then document existence) without holding any
//! relay state; [`RoomRegistry::admit`] then records the subscription.
//! The registry never broadcasts.

use std::collections::{BTreeSet, HashMap};

use uuid::Uuid;

use crate::error::RelayError;
use crate::protocol::ConnectionId;

/// External membership and existence checks.
#[async_trait::async_trait]
pub trait AccessValidator: Send + Sync {
    async fn is_member(&self, user_id: Uuid, workspace_id: Uuid) -> Result<bool, RelayError>;

    async fn document_exists(
        &self,
        workspace_id: Uuid,
        document_id: Uuid,
    ) -> Result<bool, RelayError>;
}

/// Verify `user_id` may join `document_id` inside `workspace_id`.
pub async fn check_access(
    validator: &dyn AccessValidator,
    user_id: Uuid,
    workspace_id: Uuid,
    document_id: Uuid,
) -> Result<(), RelayError> {
    if !validator.is_member(user_id, workspace_id).await? {
        return Err(RelayError::AccessDenied);
    }
    if !validator.document_exists(workspace_id, document_id).await? {
        return Err(RelayError::NotFound(document_id));
    }
    Ok(())
}

/// Result of admitting a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// First subscription of this connection to the room.
    Joined,
    /// Connection was already in this room.
    Rejoined,
}

/// What a leave or disconnect removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Departure {
    pub document_id: Uuid,
    pub user_id: Uuid,
    /// The user still has another connection in the room.
    pub user_still_present: bool,
    /// The room has no subscribers left.
    pub room_empty: bool,
}

#[derive(Debug, Clone, Copy)]
struct Membership {
    user_id: Uuid,
    document_id: Uuid,
}

/// Document id → subscribed connections.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: HashMap<Uuid, BTreeSet<ConnectionId>>,
    members: HashMap<ConnectionId, Membership>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `conn` to the room. A connection holds one room at a time.
    pub fn admit(
        &mut self,
        conn: ConnectionId,
        user_id: Uuid,
        document_id: Uuid,
    ) -> Result<Admission, RelayError> {
        match self.members.get(&conn) {
            Some(m) if m.document_id == document_id => return Ok(Admission::Rejoined),
            Some(m) => return Err(RelayError::AlreadyJoined(m.document_id)),
            None => {}
        }

        self.members.insert(
            conn,
            Membership {
                user_id,
                document_id,
            },
        );
        self.rooms.entry(document_id).or_default().insert(conn);
        Ok(Admission::Joined)
    }

    /// Unsubscribe `conn` from `document_id`. Absent connections are a no-op.
    pub fn leave(&mut self, conn: ConnectionId, document_id: Uuid) -> Option<Departure> {
        if self.is_member(conn, document_id) {
            self.disconnect(conn)
        } else {
            None
        }
    }

    /// Remove `conn` from whatever room it is in.
    pub fn disconnect(&mut self, conn: ConnectionId) -> Option<Departure> {
        let membership = self.members.remove(&conn)?;
        let document_id = membership.document_id;

        let room_empty = match self.rooms.get_mut(&document_id) {
            Some(room) => {
                room.remove(&conn);
                room.is_empty()
            }
            None => true,
        };
        if room_empty {
            self.rooms.remove(&document_id);
        }

        Some(Departure {
            document_id,
            user_id: membership.user_id,
            user_still_present: self.user_present(document_id, membership.user_id),
            room_empty,
        })
    }

    /// Document `conn` is currently joined to.
    pub fn joined_document(&self, conn: ConnectionId) -> Option<Uuid> {
        self.members.get(&conn).map(|m| m.document_id)
    }

    pub fn is_member(&self, conn: ConnectionId, document_id: Uuid) -> bool {
        self.joined_document(conn) == Some(document_id)
    }

    /// Subscribers of a room, in stable order.
    pub fn members(&self, document_id: Uuid) -> impl Iterator<Item = ConnectionId> + '_ {
        self.rooms
            .get(&document_id)
            .into_iter()
            .flat_map(|room| room.iter().copied())
    }

    /// Whether any connection of `user_id` is subscribed to the room.
    pub fn user_present(&self, document_id: Uuid, user_id: Uuid) -> bool {
        self.members(document_id)
            .filter_map(|conn| self.members.get(&conn))
            .any(|m| m.user_id == user_id)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn member_count(&self, document_id: Uuid) -> usize {
        self.rooms.get(&document_id).map_or(0, BTreeSet::len)
    }
}
