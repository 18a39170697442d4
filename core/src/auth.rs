//! Caller authentication contract
//
// The core trusts whatever identity the authenticator returns; credential
// checks, token issuance and rotation all live outside this crate.

use crate::identity::normalize_username;
use crate::RelayError;
use std::collections::HashMap;

/// Maps an opaque bearer token to a verified caller identity.
pub trait Authenticator: Send + Sync {
    fn verify(&self, token: &str) -> Result<String, RelayError>;
}

/// Fixed token table, for tests and single-node deployments.
#[derive(Default)]
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, String>,
}

impl StaticTokenAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, token: &str, username: &str) {
        self.tokens
            .insert(token.to_string(), normalize_username(username));
    }
}

impl Authenticator for StaticTokenAuthenticator {
    fn verify(&self, token: &str) -> Result<String, RelayError> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or(RelayError::PolicyDenied)
    }
}
