//! Relay Gateway — the external-facing operation surface
//
// Thin composition over Directory + Ledger + Mailbox. The one policy it owns
// is connection-gating on push: by default a sender needs an accepted
// connection to the recipient before the mailbox will take their signal.

use crate::config::{RelayConfig, TurnServer};
use crate::identity::{normalize_username, Directory, IdentityRecord};
use crate::ledger::{Connection, ConnectionLedger, ConnectionRequest, ResolveAction};
use crate::mailbox::{SignalEntry, SignalKind, SignalMailbox};
use crate::store::StorageBackend;
use crate::RelayError;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{info, warn};

/// STUN/TURN inventory handed to clients for WebRTC setup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServers {
    pub stun_servers: Vec<String>,
    pub turn_servers: Vec<TurnServer>,
}

/// The relay gateway. Every method takes the already-verified caller
/// identity (see `auth::Authenticator`); no credential checks happen here.
pub struct RelayGateway {
    directory: Arc<dyn Directory>,
    ledger: ConnectionLedger,
    mailbox: SignalMailbox,
    store: Arc<dyn StorageBackend>,
    config: RelayConfig,
    running: RwLock<bool>,
}

impl RelayGateway {
    /// Build a gateway over an explicit directory and ledger backend.
    /// Store objects are injected at construction; there is no ambient
    /// process-wide database handle.
    pub fn new(
        directory: Arc<dyn Directory>,
        ledger_backend: Arc<dyn StorageBackend>,
        config: RelayConfig,
    ) -> Self {
        // Idempotent tracing init so embedders get logs without ceremony.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .try_init();

        let ledger = ConnectionLedger::new(ledger_backend.clone(), directory.clone());
        let mailbox = SignalMailbox::new(config.clone());
        Self {
            directory,
            ledger,
            mailbox,
            store: ledger_backend,
            config,
            running: RwLock::new(false),
        }
    }

    // ------------------------------------------------------------------------
    // LIFECYCLE
    // ------------------------------------------------------------------------

    pub fn start(&self) -> Result<(), RelayError> {
        let mut running = self.running.write();
        if *running {
            return Err(RelayError::InvalidArgument(
                "gateway already running".to_string(),
            ));
        }
        *running = true;
        info!("Relay gateway started");
        Ok(())
    }

    pub fn stop(&self) {
        let mut running = self.running.write();
        if !*running {
            return;
        }
        *running = false;
        // Flush durable state on shutdown; the mailbox is ephemeral and has
        // nothing to persist.
        if let Err(e) = self.store.flush() {
            warn!("Storage flush on shutdown failed: {}", e);
        }
        info!("Relay gateway stopped");
    }

    pub fn is_running(&self) -> bool {
        *self.running.read()
    }

    // ------------------------------------------------------------------------
    // DIRECTORY
    // ------------------------------------------------------------------------

    /// Public info for one user, used by clients to encrypt toward them.
    pub fn lookup_user(&self, username: &str) -> Result<IdentityRecord, RelayError> {
        self.directory.lookup(username)
    }

    /// Prefix search over the directory, excluding the caller themselves.
    pub fn search_users(
        &self,
        caller: &str,
        prefix: &str,
        limit: usize,
    ) -> Result<Vec<IdentityRecord>, RelayError> {
        let caller = normalize_username(caller);
        let mut matches = self.directory.search_by_prefix(prefix, limit + 1)?;
        matches.retain(|r| r.username != caller);
        matches.truncate(limit);
        Ok(matches)
    }

    /// Configured STUN/TURN servers for WebRTC setup.
    pub fn ice_servers(&self) -> IceServers {
        IceServers {
            stun_servers: self.config.stun_servers.clone(),
            turn_servers: self.config.turn_servers.clone(),
        }
    }

    // ------------------------------------------------------------------------
    // CONNECTION LEDGER
    // ------------------------------------------------------------------------

    pub fn submit_request(
        &self,
        caller: &str,
        recipient: &str,
    ) -> Result<ConnectionRequest, RelayError> {
        self.ledger.submit(caller, recipient)
    }

    pub fn pending_requests(&self, caller: &str) -> Result<Vec<ConnectionRequest>, RelayError> {
        self.ledger.list_pending(caller)
    }

    pub fn resolve_request(
        &self,
        caller: &str,
        request_id: &str,
        action: ResolveAction,
    ) -> Result<ConnectionRequest, RelayError> {
        self.ledger.resolve(request_id, caller, action)
    }

    pub fn connections(&self, caller: &str) -> Result<Vec<Connection>, RelayError> {
        self.ledger.list_accepted(caller)
    }

    pub fn sever(&self, caller: &str, peer: &str) -> Result<bool, RelayError> {
        self.ledger.sever(caller, peer)
    }

    // ------------------------------------------------------------------------
    // SIGNALING MAILBOX
    // ------------------------------------------------------------------------

    /// Relay one opaque handshake fragment to `recipient`.
    ///
    /// With `require_connection` on (the default), pushing without an
    /// accepted connection fails with `PolicyDenied` and leaves the mailbox
    /// untouched.
    pub fn push_signal(
        &self,
        caller: &str,
        recipient: &str,
        kind: SignalKind,
        payload: Vec<u8>,
    ) -> Result<SignalEntry, RelayError> {
        if !self.directory.exists(recipient)? {
            return Err(RelayError::NotFound);
        }
        if self.config.require_connection && !self.ledger.is_connected(caller, recipient)? {
            return Err(RelayError::PolicyDenied);
        }
        self.mailbox.push(caller, recipient, kind, payload)
    }

    /// Drain the caller's mailbox: one atomic read-and-remove, never polled
    /// twice for a single logical client request.
    pub fn drain_mailbox(&self, caller: &str, limit: Option<usize>) -> Vec<SignalEntry> {
        let limit = limit
            .unwrap_or(self.config.drain_batch_limit)
            .min(self.config.drain_batch_limit);
        self.mailbox.drain(caller, limit)
    }

    /// Drop every in-flight signal the caller sent or was addressed.
    pub fn clear_mailbox(&self, caller: &str) -> usize {
        self.mailbox.clear(caller)
    }

    /// Space-reclamation pass over expired signal entries. Run this
    /// periodically; delivery correctness does not depend on it.
    pub fn sweep_expired(&self) -> usize {
        self.mailbox.sweep_expired()
    }

    pub fn mailbox_stats(&self) -> crate::mailbox::MailboxStats {
        self.mailbox.stats()
    }
}
