//! Identity Directory — username to public-key material and presence
//
// The core consults this mapping but never mutates it as part of a ledger or
// mailbox operation. Registration and presence updates belong to the account
// layer and are exposed here only as the write side of `DirectoryStore`.

use crate::store::StorageBackend;
use crate::{now_millis, RelayError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Canonical username form: lowercase, `@`-prefixed.
///
/// Every operation boundary normalizes before touching storage, so
/// "Alice", "@alice" and "@ALICE" all address the same identity.
pub fn normalize_username(raw: &str) -> String {
    let trimmed = raw.trim().to_lowercase();
    if trimmed.starts_with('@') {
        trimmed
    } else {
        format!("@{trimmed}")
    }
}

/// Public identity record. `public_key` is armored key material the server
/// stores and hands out but never parses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentityRecord {
    pub username: String,
    pub public_key: String,
    pub is_online: bool,
    pub last_seen: u64,
}

/// Read contract the core consumes. Write access stays on the concrete
/// `DirectoryStore` so ledger and mailbox can only ever look identities up.
#[cfg_attr(test, mockall::automock)]
pub trait Directory: Send + Sync {
    fn exists(&self, username: &str) -> Result<bool, RelayError>;
    fn lookup(&self, username: &str) -> Result<IdentityRecord, RelayError>;
    fn search_by_prefix(
        &self,
        prefix: &str,
        limit: usize,
    ) -> Result<Vec<IdentityRecord>, RelayError>;
}

const IDENTITY_PREFIX: &[u8] = b"identity/";

fn identity_key(username: &str) -> Vec<u8> {
    let mut key = IDENTITY_PREFIX.to_vec();
    key.extend_from_slice(username.as_bytes());
    key
}

/// Backend-backed directory implementation.
#[derive(Clone)]
pub struct DirectoryStore {
    backend: Arc<dyn StorageBackend>,
}

impl DirectoryStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    /// Register or replace an identity. Account-layer API, not a core
    /// operation.
    pub fn register(&self, username: &str, public_key: &str) -> Result<IdentityRecord, RelayError> {
        let username = normalize_username(username);
        if username == "@" {
            return Err(RelayError::InvalidArgument("empty username".to_string()));
        }
        if public_key.trim().is_empty() {
            return Err(RelayError::InvalidArgument("empty public key".to_string()));
        }

        let record = IdentityRecord {
            username: username.clone(),
            public_key: public_key.to_string(),
            is_online: false,
            last_seen: now_millis(),
        };
        self.put_record(&record)?;
        tracing::info!("Registered identity {}", username);
        Ok(record)
    }

    /// Flip the presence flag. Account-layer API, not a core operation.
    pub fn set_presence(&self, username: &str, online: bool) -> Result<(), RelayError> {
        let username = normalize_username(username);
        let mut record = self.lookup(&username)?;
        record.is_online = online;
        record.last_seen = now_millis();
        self.put_record(&record)
    }

    fn put_record(&self, record: &IdentityRecord) -> Result<(), RelayError> {
        let value = serde_json::to_vec(record)
            .map_err(|e| RelayError::InvalidArgument(e.to_string()))?;
        self.backend
            .put(&identity_key(&record.username), &value)
            .map_err(RelayError::storage)
    }
}

impl Directory for DirectoryStore {
    fn exists(&self, username: &str) -> Result<bool, RelayError> {
        let key = identity_key(&normalize_username(username));
        Ok(self.backend.get(&key).map_err(RelayError::storage)?.is_some())
    }

    fn lookup(&self, username: &str) -> Result<IdentityRecord, RelayError> {
        let key = identity_key(&normalize_username(username));
        let data = self
            .backend
            .get(&key)
            .map_err(RelayError::storage)?
            .ok_or(RelayError::NotFound)?;
        serde_json::from_slice(&data).map_err(|e| RelayError::Unavailable(e.to_string()))
    }

    fn search_by_prefix(
        &self,
        prefix: &str,
        limit: usize,
    ) -> Result<Vec<IdentityRecord>, RelayError> {
        let prefix = normalize_username(prefix);
        let scanned = self
            .backend
            .scan_prefix(&identity_key(&prefix))
            .map_err(RelayError::storage)?;

        let mut matches = Vec::with_capacity(scanned.len());
        for (_, value) in scanned {
            let record: IdentityRecord = serde_json::from_slice(&value)
                .map_err(|e| RelayError::Unavailable(e.to_string()))?;
            matches.push(record);
        }
        matches.sort_by(|a, b| a.username.cmp(&b.username));
        matches.truncate(limit);
        Ok(matches)
    }
}
