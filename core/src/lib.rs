// Rendezvous Core — signaling spine for peer-to-peer encrypted handshakes
//
// "Does this help two peers exchange an encrypted WebRTC handshake
//  without the server reading a single byte of it?"
//
// If the answer is no, it doesn't belong here.

pub mod auth;
pub mod config;
pub mod gateway;
pub mod identity;
pub mod ledger;
pub mod mailbox;
pub mod store;

use std::fmt;
use thiserror::Error;

pub use auth::{Authenticator, StaticTokenAuthenticator};
pub use config::{RelayConfig, TurnServer};
pub use gateway::RelayGateway;
pub use identity::{normalize_username, Directory, DirectoryStore, IdentityRecord};
pub use ledger::{
    Connection, ConnectionLedger, ConnectionRequest, RequestStatus, ResolveAction,
};
pub use mailbox::{MailboxStats, SignalEntry, SignalKind, SignalMailbox};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Which active record a duplicate submission collided with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// A pending request already exists for the pair.
    AlreadyPending,
    /// The pair already has an accepted connection.
    AlreadyConnected,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictKind::AlreadyPending => write!(f, "request already pending"),
            ConflictKind::AlreadyConnected => write!(f, "already connected"),
        }
    }
}

/// Error taxonomy shared by every core operation.
///
/// `NotFound` deliberately covers "exists but you may not see it" so callers
/// cannot probe for other users' requests.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("not found")]
    NotFound,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("{0}")]
    Conflict(ConflictKind),
    #[error("policy denied")]
    PolicyDenied,
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl RelayError {
    /// Map a storage-layer failure. Transient backend errors surface as
    /// `Unavailable` so callers can apply their own backoff.
    pub(crate) fn storage(err: String) -> Self {
        RelayError::Unavailable(err)
    }
}

/// Wall-clock time in unix milliseconds.
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
