//! Connection Ledger — pairwise authorization state machine
//
// Owns every lifecycle transition of a connection request:
// pending -> accepted | declined, and hard deletion on sever.
//
// Linearization strategy: the active-pair index (`pair/<a>|<b>`, usernames
// sorted) is maintained with compare-and-swap, so two concurrent submissions
// for the same unordered pair cannot both succeed. Resolution CAS-swaps the
// request record itself, so a request transitions exactly once.

use crate::identity::{normalize_username, Directory};
use crate::store::StorageBackend;
use crate::{now_millis, ConflictKind, RelayError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

const REQUEST_PREFIX: &[u8] = b"request/";
const PAIR_PREFIX: &[u8] = b"pair/";
const SEQ_KEY: &[u8] = b"seq/requests";

/// Connection request lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Accepted,
    Declined,
}

/// A pairwise authorization request between two identities
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionRequest {
    pub id: String,
    /// Ledger-wide monotonic submission sequence. `created_at` only has
    /// millisecond precision, so this is the authoritative submission order.
    pub seq: u64,
    pub requester: String,
    pub recipient: String,
    pub status: RequestStatus,
    /// Unix millis
    pub created_at: u64,
    /// Unix millis, set exactly once on accept/decline
    pub resolved_at: Option<u64>,
}

impl ConnectionRequest {
    fn new(seq: u64, requester: String, recipient: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            seq,
            requester,
            recipient,
            status: RequestStatus::Pending,
            created_at: now_millis(),
            resolved_at: None,
        }
    }

    /// The counterpart of `username` in this request.
    pub fn peer_of(&self, username: &str) -> &str {
        if self.requester == username {
            &self.recipient
        } else {
            &self.requester
        }
    }

    fn involves(&self, username: &str) -> bool {
        self.requester == username || self.recipient == username
    }
}

/// How the recipient resolves a pending request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveAction {
    Accept,
    Decline,
}

impl std::str::FromStr for ResolveAction {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "accept" => Ok(ResolveAction::Accept),
            "decline" => Ok(ResolveAction::Decline),
            other => Err(RelayError::InvalidArgument(format!(
                "unknown action: {other}"
            ))),
        }
    }
}

/// An accepted connection enriched with directory metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub peer: String,
    pub public_key: String,
    pub is_online: bool,
    /// Unix millis of acceptance
    pub connected_at: u64,
}

fn request_key(id: &str) -> Vec<u8> {
    let mut key = REQUEST_PREFIX.to_vec();
    key.extend_from_slice(id.as_bytes());
    key
}

/// Index key for the unordered pair: both names normalized, sorted, joined.
fn pair_key(a: &str, b: &str) -> Vec<u8> {
    let (first, second) = if a <= b { (a, b) } else { (b, a) };
    let mut key = PAIR_PREFIX.to_vec();
    key.extend_from_slice(first.as_bytes());
    key.push(b'|');
    key.extend_from_slice(second.as_bytes());
    key
}

/// The connection ledger. Exclusive owner of request lifecycle transitions.
#[derive(Clone)]
pub struct ConnectionLedger {
    backend: Arc<dyn StorageBackend>,
    directory: Arc<dyn Directory>,
}

impl ConnectionLedger {
    pub fn new(backend: Arc<dyn StorageBackend>, directory: Arc<dyn Directory>) -> Self {
        Self { backend, directory }
    }

    /// Submit a connection request from `requester` to `recipient`.
    ///
    /// Fails with `NotFound` when either identity is unknown,
    /// `InvalidArgument` on self-connection, and `Conflict` when the pair
    /// already has a pending or accepted record.
    pub fn submit(
        &self,
        requester: &str,
        recipient: &str,
    ) -> Result<ConnectionRequest, RelayError> {
        let requester = normalize_username(requester);
        let recipient = normalize_username(recipient);

        if requester == recipient {
            return Err(RelayError::InvalidArgument(
                "cannot connect to yourself".to_string(),
            ));
        }
        if !self.directory.exists(&requester)? || !self.directory.exists(&recipient)? {
            return Err(RelayError::NotFound);
        }

        let request = ConnectionRequest::new(self.next_seq()?, requester.clone(), recipient.clone());
        let pair = pair_key(&requester, &recipient);

        // Single atomic conditional insert on the pair index. Whoever wins
        // this CAS owns the active record for the pair.
        let claimed = self
            .backend
            .compare_and_swap(&pair, None, Some(request.id.as_bytes()))
            .map_err(RelayError::storage)?;
        if !claimed {
            return Err(RelayError::Conflict(self.active_conflict(&pair)?));
        }

        let value = serde_json::to_vec(&request)
            .map_err(|e| RelayError::Unavailable(e.to_string()))?;
        if let Err(e) = self.backend.put(&request_key(&request.id), &value) {
            // Roll the claim back so the pair is not wedged by a failed write.
            let _ = self
                .backend
                .compare_and_swap(&pair, Some(request.id.as_bytes()), None);
            return Err(RelayError::storage(e));
        }

        info!("Connection request {} -> {}", requester, recipient);
        Ok(request)
    }

    /// All pending requests addressed to `recipient`, oldest first.
    pub fn list_pending(&self, recipient: &str) -> Result<Vec<ConnectionRequest>, RelayError> {
        let recipient = normalize_username(recipient);
        let mut pending: Vec<ConnectionRequest> = self
            .scan_requests()?
            .into_iter()
            .filter(|r| r.status == RequestStatus::Pending && r.recipient == recipient)
            .collect();
        pending.sort_by_key(|r| r.seq);
        Ok(pending)
    }

    /// Resolve a pending request addressed to `resolver`.
    ///
    /// A wrong resolver, an unknown id, or an already-resolved request are
    /// all indistinguishable `NotFound`, which makes accept/decline replay
    /// impossible to observe as success.
    pub fn resolve(
        &self,
        request_id: &str,
        resolver: &str,
        action: ResolveAction,
    ) -> Result<ConnectionRequest, RelayError> {
        let resolver = normalize_username(resolver);
        let key = request_key(request_id);

        let current_bytes = self
            .backend
            .get(&key)
            .map_err(RelayError::storage)?
            .ok_or(RelayError::NotFound)?;
        let current: ConnectionRequest = serde_json::from_slice(&current_bytes)
            .map_err(|e| RelayError::Unavailable(e.to_string()))?;

        if current.status != RequestStatus::Pending || current.recipient != resolver {
            return Err(RelayError::NotFound);
        }

        let mut updated = current.clone();
        updated.status = match action {
            ResolveAction::Accept => RequestStatus::Accepted,
            ResolveAction::Decline => RequestStatus::Declined,
        };
        updated.resolved_at = Some(now_millis());

        let new_bytes = serde_json::to_vec(&updated)
            .map_err(|e| RelayError::Unavailable(e.to_string()))?;
        let swapped = self
            .backend
            .compare_and_swap(&key, Some(current_bytes.as_slice()), Some(&new_bytes))
            .map_err(RelayError::storage)?;
        if !swapped {
            // Lost a race against a concurrent resolve. Never report success
            // twice for one transition.
            debug!("Request {} raced on resolve", request_id);
            return Err(RelayError::NotFound);
        }

        if updated.status == RequestStatus::Declined {
            // A declined pair is free to try again; the record itself stays.
            let pair = pair_key(&updated.requester, &updated.recipient);
            let _ = self
                .backend
                .compare_and_swap(&pair, Some(updated.id.as_bytes()), None);
        }

        info!(
            "Request {} resolved to {:?} by {}",
            request_id, updated.status, resolver
        );
        Ok(updated)
    }

    /// All accepted connections for `username`, enriched with the peer's
    /// directory record. Peers missing from the directory are skipped.
    pub fn list_accepted(&self, username: &str) -> Result<Vec<Connection>, RelayError> {
        let username = normalize_username(username);
        let mut connections = Vec::new();
        for request in self.scan_requests()? {
            if request.status != RequestStatus::Accepted || !request.involves(&username) {
                continue;
            }
            let peer = request.peer_of(&username);
            let record = match self.directory.lookup(peer) {
                Ok(record) => record,
                Err(RelayError::NotFound) => continue,
                Err(e) => return Err(e),
            };
            connections.push(Connection {
                peer: peer.to_string(),
                public_key: record.public_key,
                is_online: record.is_online,
                connected_at: request.resolved_at.unwrap_or(request.created_at),
            });
        }
        connections.sort_by(|a, b| a.peer.cmp(&b.peer));
        Ok(connections)
    }

    /// Whether `a` and `b` currently hold an accepted connection.
    pub fn is_connected(&self, a: &str, b: &str) -> Result<bool, RelayError> {
        let a = normalize_username(a);
        let b = normalize_username(b);
        match self.active_request(&pair_key(&a, &b))? {
            Some(request) => Ok(request.status == RequestStatus::Accepted),
            None => Ok(false),
        }
    }

    /// Delete the accepted record between the pair. Idempotent: returns
    /// whether a record was removed.
    pub fn sever(&self, username: &str, other: &str) -> Result<bool, RelayError> {
        let username = normalize_username(username);
        let other = normalize_username(other);
        let pair = pair_key(&username, &other);

        let request = match self.active_request(&pair)? {
            Some(request) if request.status == RequestStatus::Accepted => request,
            _ => return Ok(false),
        };

        // Release the pair index first; losing this CAS means someone else
        // already severed.
        let released = self
            .backend
            .compare_and_swap(&pair, Some(request.id.as_bytes()), None)
            .map_err(RelayError::storage)?;
        if !released {
            return Ok(false);
        }
        self.backend
            .remove(&request_key(&request.id))
            .map_err(RelayError::storage)?;

        info!("Connection severed between {} and {}", username, other);
        Ok(true)
    }

    /// Allocate the next submission sequence number. A CAS loop over the
    /// durable counter key keeps the sequence strictly increasing across
    /// concurrent submitters and across restarts.
    fn next_seq(&self) -> Result<u64, RelayError> {
        loop {
            let current = self.backend.get(SEQ_KEY).map_err(RelayError::storage)?;
            let next = match &current {
                Some(bytes) => {
                    let bytes: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                        RelayError::Unavailable("corrupt request sequence counter".to_string())
                    })?;
                    u64::from_be_bytes(bytes) + 1
                }
                None => 1,
            };
            let swapped = self
                .backend
                .compare_and_swap(SEQ_KEY, current.as_deref(), Some(&next.to_be_bytes()))
                .map_err(RelayError::storage)?;
            if swapped {
                return Ok(next);
            }
        }
    }

    fn scan_requests(&self) -> Result<Vec<ConnectionRequest>, RelayError> {
        let scanned = self
            .backend
            .scan_prefix(REQUEST_PREFIX)
            .map_err(RelayError::storage)?;
        let mut requests = Vec::with_capacity(scanned.len());
        for (_, value) in scanned {
            let request: ConnectionRequest = serde_json::from_slice(&value)
                .map_err(|e| RelayError::Unavailable(e.to_string()))?;
            requests.push(request);
        }
        Ok(requests)
    }

    /// The active record behind a pair index entry, if any.
    fn active_request(&self, pair: &[u8]) -> Result<Option<ConnectionRequest>, RelayError> {
        let Some(id) = self.backend.get(pair).map_err(RelayError::storage)? else {
            return Ok(None);
        };
        let id = String::from_utf8_lossy(&id).to_string();
        let Some(value) = self
            .backend
            .get(&request_key(&id))
            .map_err(RelayError::storage)?
        else {
            return Ok(None);
        };
        let request = serde_json::from_slice(&value)
            .map_err(|e| RelayError::Unavailable(e.to_string()))?;
        Ok(Some(request))
    }

    fn active_conflict(&self, pair: &[u8]) -> Result<ConflictKind, RelayError> {
        match self.active_request(pair)? {
            Some(request) if request.status == RequestStatus::Accepted => {
                Ok(ConflictKind::AlreadyConnected)
            }
            // A claimed pair whose record is mid-write still counts as
            // pending for the loser of the race.
            _ => Ok(ConflictKind::AlreadyPending),
        }
    }
}
