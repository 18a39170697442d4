//! Signaling Mailbox — per-recipient ephemeral queue of encrypted relay entries
//
// Content-blind by contract: payloads are opaque bytes the server never
// interprets. Entries die on drain or TTL expiry, whichever comes first.
// Drain filters by expiry at selection time, so the background sweep is
// purely space reclamation and never a correctness dependency.

use crate::identity::normalize_username;
use crate::{now_millis, RelayConfig, RelayError};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// WebRTC handshake fragment kinds. The mailbox assigns no semantics to
/// these; they exist so clients can route fragments without decrypting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
    Ice,
}

impl std::str::FromStr for SignalKind {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "offer" => Ok(SignalKind::Offer),
            "answer" => Ok(SignalKind::Answer),
            "ice" => Ok(SignalKind::Ice),
            other => Err(RelayError::InvalidArgument(format!(
                "unknown signal kind: {other}"
            ))),
        }
    }
}

/// One opaque handshake fragment addressed to a recipient
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignalEntry {
    pub id: String,
    pub sender: String,
    pub recipient: String,
    pub kind: SignalKind,
    /// Encrypted by the sender's client; the server cannot read this.
    pub payload: Vec<u8>,
    /// Unix millis
    pub created_at: u64,
    /// created_at + configured TTL
    pub expires_at: u64,
}

impl SignalEntry {
    fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }
}

/// Counters over mailbox activity
#[derive(Debug, Clone, Default)]
pub struct MailboxStats {
    /// Entries currently queued across all recipients
    pub entries_stored: usize,
    /// Entries handed out by drains
    pub entries_delivered: u64,
    /// Entries dropped by expiry (at drain time or by sweep)
    pub entries_expired: u64,
}

type Queue = Arc<Mutex<VecDeque<SignalEntry>>>;

/// The signaling mailbox.
///
/// Locking is scoped per recipient: the outer map lock is held only to find
/// or create a queue handle, so drains for different recipients proceed in
/// parallel.
pub struct SignalMailbox {
    config: RelayConfig,
    queues: RwLock<HashMap<String, Queue>>,
    stats: Mutex<MailboxStats>,
}

impl SignalMailbox {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            queues: RwLock::new(HashMap::new()),
            stats: Mutex::new(MailboxStats::default()),
        }
    }

    /// Append an entry to the recipient's queue.
    ///
    /// Oversized payloads fail with `InvalidArgument`; a full mailbox is
    /// `Unavailable` (transient until the recipient drains). Whether sender
    /// and recipient are connected is not checked here; that policy belongs
    /// to the gateway.
    pub fn push(
        &self,
        sender: &str,
        recipient: &str,
        kind: SignalKind,
        payload: Vec<u8>,
    ) -> Result<SignalEntry, RelayError> {
        if payload.len() > self.config.max_payload_bytes {
            return Err(RelayError::InvalidArgument(format!(
                "payload exceeds {} bytes",
                self.config.max_payload_bytes
            )));
        }

        let sender = normalize_username(sender);
        let recipient = normalize_username(recipient);
        let created_at = now_millis();
        let entry = SignalEntry {
            id: Uuid::new_v4().to_string(),
            sender,
            recipient: recipient.clone(),
            kind,
            payload,
            created_at,
            expires_at: created_at + self.config.signal_ttl.as_millis() as u64,
        };

        // The map read lock is held for the whole append so a concurrent
        // `clear` (which takes the write lock) cannot orphan this queue.
        loop {
            {
                let queues = self.queues.read();
                if let Some(queue) = queues.get(&recipient) {
                    let mut queue = queue.lock();

                    if queue.len() >= self.config.max_entries_per_recipient {
                        // Reclaim expired entries in place before giving up.
                        let before = queue.len();
                        let now = now_millis();
                        queue.retain(|e| !e.is_expired(now));
                        let reclaimed = before - queue.len();
                        if reclaimed > 0 {
                            let mut stats = self.stats.lock();
                            stats.entries_expired += reclaimed as u64;
                            stats.entries_stored -= reclaimed;
                        }
                        if queue.len() >= self.config.max_entries_per_recipient {
                            return Err(RelayError::Unavailable(format!(
                                "mailbox full for {recipient}"
                            )));
                        }
                    }

                    queue.push_back(entry.clone());
                    self.stats.lock().entries_stored += 1;
                    debug!(
                        "Signal {:?} queued {} -> {}",
                        entry.kind, entry.sender, entry.recipient
                    );
                    return Ok(entry);
                }
            }
            // No queue for this recipient yet; create it and retry the append.
            self.queues
                .write()
                .entry(recipient.clone())
                .or_default();
        }
    }

    /// Atomically select, remove, and return up to `max_entries` non-expired
    /// entries for `recipient`, in creation order.
    ///
    /// The per-queue lock makes selection-and-removal a single step: no entry
    /// can be returned by two concurrent drains, and expired entries popped
    /// along the way are reclaimed, never delivered.
    pub fn drain(&self, recipient: &str, max_entries: usize) -> Vec<SignalEntry> {
        let recipient = normalize_username(recipient);
        let queues = self.queues.read();
        let Some(queue) = queues.get(&recipient) else {
            return Vec::new();
        };

        let mut queue = queue.lock();
        let now = now_millis();
        let mut delivered = Vec::new();
        let mut expired = 0usize;

        while delivered.len() < max_entries {
            let Some(entry) = queue.pop_front() else {
                break;
            };
            if entry.is_expired(now) {
                expired += 1;
            } else {
                delivered.push(entry);
            }
        }

        let mut stats = self.stats.lock();
        stats.entries_stored -= delivered.len() + expired;
        stats.entries_delivered += delivered.len() as u64;
        stats.entries_expired += expired as u64;

        delivered
    }

    /// Remove every entry where `username` is sender or recipient.
    /// Covers "cancel the in-flight handshakes I started or received".
    pub fn clear(&self, username: &str) -> usize {
        let username = normalize_username(username);
        let mut queues = self.queues.write();
        let mut removed = 0usize;

        if let Some(queue) = queues.remove(&username) {
            removed += queue.lock().len();
        }
        for queue in queues.values() {
            let mut queue = queue.lock();
            let before = queue.len();
            queue.retain(|e| e.sender != username);
            removed += before - queue.len();
        }
        queues.retain(|_, q| !q.lock().is_empty());

        if removed > 0 {
            self.stats.lock().entries_stored -= removed;
            debug!("Cleared {} signal(s) involving {}", removed, username);
        }
        removed
    }

    /// Passive space reclamation: drop every expired entry. Correctness never
    /// depends on when (or whether) this runs; drain filters on its own.
    pub fn sweep_expired(&self) -> usize {
        let now = now_millis();
        let mut swept = 0usize;
        {
            let queues = self.queues.read();
            for queue in queues.values() {
                let mut queue = queue.lock();
                let before = queue.len();
                queue.retain(|e| !e.is_expired(now));
                swept += before - queue.len();
            }
        }
        // Brief write lock purely to drop empty queues from the map.
        self.queues.write().retain(|_, q| !q.lock().is_empty());

        if swept > 0 {
            let mut stats = self.stats.lock();
            stats.entries_stored -= swept;
            stats.entries_expired += swept as u64;
            debug!("Swept {} expired signal(s)", swept);
        }
        swept
    }

    pub fn stats(&self) -> MailboxStats {
        self.stats.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_mailbox() -> SignalMailbox {
        SignalMailbox::new(RelayConfig::default())
    }

    fn mailbox_with(ttl: Duration, max_payload: usize, max_entries: usize) -> SignalMailbox {
        SignalMailbox::new(RelayConfig {
            signal_ttl: ttl,
            max_payload_bytes: max_payload,
            max_entries_per_recipient: max_entries,
            ..RelayConfig::default()
        })
    }

    #[test]
    fn test_push_stamps_ttl_and_normalizes() {
        let mailbox = test_mailbox();
        let entry = mailbox
            .push("Alice", "BOB", SignalKind::Offer, b"sdp".to_vec())
            .unwrap();

        assert_eq!(entry.sender, "@alice");
        assert_eq!(entry.recipient, "@bob");
        assert_eq!(entry.expires_at - entry.created_at, 60_000);
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let mailbox = mailbox_with(Duration::from_secs(60), 8, 100);
        let result = mailbox.push("@a", "@b", SignalKind::Ice, vec![0u8; 9]);
        assert!(matches!(result, Err(RelayError::InvalidArgument(_))));
        assert!(mailbox.drain("@b", 10).is_empty());
    }

    #[test]
    fn test_drain_fifo_and_exhaustive() {
        let mailbox = test_mailbox();
        mailbox
            .push("@a", "@b", SignalKind::Offer, b"1".to_vec())
            .unwrap();
        mailbox
            .push("@a", "@b", SignalKind::Answer, b"2".to_vec())
            .unwrap();
        mailbox
            .push("@c", "@b", SignalKind::Ice, b"3".to_vec())
            .unwrap();

        let drained = mailbox.drain("@b", 10);
        let payloads: Vec<_> = drained.iter().map(|e| e.payload.clone()).collect();
        assert_eq!(payloads, vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()]);

        // Drain is destructive; a second poll sees nothing.
        assert!(mailbox.drain("@b", 10).is_empty());
    }

    #[test]
    fn test_drain_respects_limit() {
        let mailbox = test_mailbox();
        for i in 0..5u8 {
            mailbox
                .push("@a", "@b", SignalKind::Ice, vec![i])
                .unwrap();
        }

        let first = mailbox.drain("@b", 2);
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].payload, vec![0]);
        assert_eq!(first[1].payload, vec![1]);

        let rest = mailbox.drain("@b", 10);
        assert_eq!(rest.len(), 3);
        assert_eq!(rest[0].payload, vec![2]);
    }

    #[test]
    fn test_expired_entry_never_drained() {
        let mailbox = mailbox_with(Duration::from_millis(20), 1024, 100);
        mailbox
            .push("@a", "@b", SignalKind::Offer, b"stale".to_vec())
            .unwrap();

        std::thread::sleep(Duration::from_millis(40));
        assert!(mailbox.drain("@b", 10).is_empty());
        assert_eq!(mailbox.stats().entries_expired, 1);
        assert_eq!(mailbox.stats().entries_delivered, 0);
    }

    #[test]
    fn test_drain_skips_expired_but_delivers_fresh() {
        let mailbox = mailbox_with(Duration::from_millis(30), 1024, 100);
        mailbox
            .push("@a", "@b", SignalKind::Offer, b"old".to_vec())
            .unwrap();
        std::thread::sleep(Duration::from_millis(50));
        mailbox
            .push("@a", "@b", SignalKind::Answer, b"new".to_vec())
            .unwrap();

        let drained = mailbox.drain("@b", 10);
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].payload, b"new".to_vec());
    }

    #[test]
    fn test_clear_removes_sent_and_received() {
        let mailbox = test_mailbox();
        mailbox
            .push("@a", "@b", SignalKind::Offer, b"x".to_vec())
            .unwrap();
        mailbox
            .push("@b", "@c", SignalKind::Offer, b"y".to_vec())
            .unwrap();
        mailbox
            .push("@c", "@a", SignalKind::Offer, b"z".to_vec())
            .unwrap();

        // @b is recipient of one entry and sender of another.
        assert_eq!(mailbox.clear("@b"), 2);
        assert!(mailbox.drain("@b", 10).is_empty());
        assert!(mailbox.drain("@c", 10).is_empty());
        assert_eq!(mailbox.drain("@a", 10).len(), 1);

        assert_eq!(mailbox.clear("@nobody"), 0);
    }

    #[test]
    fn test_sweep_reclaims_space_only() {
        let mailbox = mailbox_with(Duration::from_millis(10), 1024, 100);
        mailbox
            .push("@a", "@b", SignalKind::Ice, b"1".to_vec())
            .unwrap();
        mailbox
            .push("@a", "@c", SignalKind::Ice, b"2".to_vec())
            .unwrap();

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(mailbox.sweep_expired(), 2);
        assert_eq!(mailbox.stats().entries_stored, 0);
        assert_eq!(mailbox.sweep_expired(), 0);
    }

    #[test]
    fn test_mailbox_capacity() {
        let mailbox = mailbox_with(Duration::from_secs(60), 1024, 2);
        mailbox
            .push("@a", "@b", SignalKind::Ice, b"1".to_vec())
            .unwrap();
        mailbox
            .push("@a", "@b", SignalKind::Ice, b"2".to_vec())
            .unwrap();

        let result = mailbox.push("@a", "@b", SignalKind::Ice, b"3".to_vec());
        assert!(matches!(result, Err(RelayError::Unavailable(_))));

        // Draining frees capacity.
        mailbox.drain("@b", 1);
        assert!(mailbox.push("@a", "@b", SignalKind::Ice, b"3".to_vec()).is_ok());
    }

    #[test]
    fn test_capacity_reclaims_expired_before_rejecting() {
        let mailbox = mailbox_with(Duration::from_millis(10), 1024, 2);
        mailbox
            .push("@a", "@b", SignalKind::Ice, b"1".to_vec())
            .unwrap();
        mailbox
            .push("@a", "@b", SignalKind::Ice, b"2".to_vec())
            .unwrap();

        std::thread::sleep(Duration::from_millis(30));
        // The queue is nominally full, but every entry in it is expired.
        assert!(mailbox.push("@a", "@b", SignalKind::Ice, b"3".to_vec()).is_ok());
    }

    #[test]
    fn test_queues_are_per_recipient() {
        let mailbox = test_mailbox();
        mailbox
            .push("@a", "@b", SignalKind::Offer, b"for-b".to_vec())
            .unwrap();
        mailbox
            .push("@a", "@c", SignalKind::Offer, b"for-c".to_vec())
            .unwrap();

        assert_eq!(mailbox.drain("@b", 10).len(), 1);
        assert_eq!(mailbox.drain("@c", 10).len(), 1);
    }

    #[test]
    fn test_concurrent_drains_no_double_delivery() {
        use std::thread;

        let mailbox = Arc::new(test_mailbox());
        for i in 0..100u8 {
            mailbox
                .push("@a", "@b", SignalKind::Ice, vec![i])
                .unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let mailbox = mailbox.clone();
            handles.push(thread::spawn(move || mailbox.drain("@b", 40)));
        }

        let mut seen = std::collections::HashSet::new();
        let mut total = 0usize;
        for handle in handles {
            for entry in handle.join().unwrap() {
                assert!(seen.insert(entry.id.clone()), "entry delivered twice");
                total += 1;
            }
        }
        assert_eq!(total, 100);
        assert_eq!(mailbox.stats().entries_delivered, 100);
    }

    #[test]
    fn test_signal_kind_parsing() {
        assert_eq!("offer".parse::<SignalKind>(), Ok(SignalKind::Offer));
        assert_eq!("answer".parse::<SignalKind>(), Ok(SignalKind::Answer));
        assert_eq!("ice".parse::<SignalKind>(), Ok(SignalKind::Ice));
        assert!(matches!(
            "sdp".parse::<SignalKind>(),
            Err(RelayError::InvalidArgument(_))
        ));
    }
}
