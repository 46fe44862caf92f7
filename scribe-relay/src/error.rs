//! Error taxonomy for the relay.
//!
//! Errors fall in three scopes:
//!
//! | scope      | variants                                   | surfaced to client |
//! |------------|--------------------------------------------|--------------------|
//! | connection | `Authentication`                           | generic text, then close |
//! | room join  | `AccessDenied`, `NotFound`, `AlreadyJoined`, `Timeout` | `error` event |
//! | message    | `MalformedMessage`, `Internal`, `NotJoined` | never, logged only |
//!
//! No error in this crate tears down an unrelated connection or room.

use uuid::Uuid;

use crate::protocol::ProtocolError;
use crate::storage::StoreError;

/// Everything that can go wrong inside the relay.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Missing, malformed, expired or unresolvable credential.
    #[error("authentication error")]
    Authentication,

    /// Authenticated user is not a member of the document's workspace.
    #[error("access denied")]
    AccessDenied,

    /// Document does not exist in the stated workspace.
    #[error("document {0} not found")]
    NotFound(Uuid),

    /// Connection tried to join a second document without leaving the first.
    #[error("connection already joined document {0}")]
    AlreadyJoined(Uuid),

    /// Message addressed a document the connection has not joined.
    #[error("connection has not joined document {0}")]
    NotJoined(Uuid),

    /// Sync or update payload failed to decode.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// Unexpected failure applying an update or talking to a collaborator.
    #[error("internal error: {0}")]
    Internal(String),

    /// A collaborator call during join exceeded the join timeout.
    #[error("operation timed out")]
    Timeout,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl RelayError {
    /// Text sent in an `error` event. Never names the failing check.
    pub fn client_message(&self) -> &'static str {
        match self {
            RelayError::Authentication => "Authentication error",
            RelayError::AccessDenied => "Access denied",
            RelayError::NotFound(_) => "Document not found",
            RelayError::AlreadyJoined(_) => "Already joined another document",
            RelayError::Timeout => "Join failed",
            _ => "Internal error",
        }
    }

    /// Whether this error is reported back to the sender as an `error` event.
    ///
    /// Malformed and internal failures are only logged so protocol internals
    /// never leak to clients.
    pub fn is_client_visible(&self) -> bool {
        matches!(
            self,
            RelayError::Authentication
                | RelayError::AccessDenied
                | RelayError::NotFound(_)
                | RelayError::AlreadyJoined(_)
                | RelayError::Timeout
        )
    }
}

impl From<ProtocolError> for RelayError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::Decode(msg) => RelayError::MalformedMessage(msg),
            other => RelayError::Internal(other.to_string()),
        }
    }
}

impl From<StoreError> for RelayError {
    fn from(e: StoreError) -> Self {
        RelayError::Internal(e.to_string())
    }
}

impl From<yrs::encoding::read::Error> for RelayError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        RelayError::MalformedMessage(e.to_string())
    }
}
