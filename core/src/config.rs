//! Relay service configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A TURN server entry handed to clients for WebRTC setup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TurnServer {
    pub urls: String,
    pub username: String,
    pub credential: String,
}

/// Relay service configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// How long an undelivered signal entry stays deliverable
    pub signal_ttl: Duration,
    /// Size ceiling for a single opaque payload
    pub max_payload_bytes: usize,
    /// Maximum entries queued per recipient mailbox
    pub max_entries_per_recipient: usize,
    /// Upper bound on entries returned by a single drain
    pub drain_batch_limit: usize,
    /// Require an accepted connection between sender and recipient to push.
    /// The reference deployment keeps this on; it is a policy decision of the
    /// gateway, not an invariant of the mailbox itself.
    pub require_connection: bool,
    /// STUN servers advertised to clients
    pub stun_servers: Vec<String>,
    /// TURN servers advertised to clients
    pub turn_servers: Vec<TurnServer>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            signal_ttl: Duration::from_secs(60),
            max_payload_bytes: 64 * 1024,
            max_entries_per_recipient: 1000,
            drain_batch_limit: 100,
            require_connection: true,
            stun_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            turn_servers: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();
        assert_eq!(config.signal_ttl, Duration::from_secs(60));
        assert!(config.require_connection);
        assert!(config.turn_servers.is_empty());
        assert_eq!(config.stun_servers.len(), 2);
    }
}
