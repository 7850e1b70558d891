//! Connector credentials
//!
//! Tokens are never kept in plaintext: connections carry the SHA-256 hex of
//! the token they presented and verifiers compare hashes. Revocation works
//! through a per-connector token version stored next to the ownership keys,
//! checked on every heartbeat.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

use crate::common::utils::hash_token;
use crate::common::Result;

/// Checks a connector's presented token hash
#[async_trait]
pub trait CredentialVerifier: Send + Sync + 'static {
    async fn verify(&self, connector_id: &str, token_hash: &str) -> Result<bool>;
}

/// Verifier backed by a table of `connector_id -> token hash`
#[derive(Debug, Default)]
pub struct TokenTableVerifier {
    hashes: RwLock<HashMap<String, String>>,
}

impl TokenTableVerifier {
    pub fn new(hashes: HashMap<String, String>) -> Self {
        let hashes = hashes
            .into_iter()
            .map(|(id, hash)| (id, hash.to_ascii_lowercase()))
            .collect();
        Self {
            hashes: RwLock::new(hashes),
        }
    }

    /// Register a plaintext token for a connector (stored hashed)
    pub fn insert_token(&self, connector_id: &str, token: &str) {
        self.hashes
            .write()
            .insert(connector_id.to_string(), hash_token(token));
    }

    pub fn revoke(&self, connector_id: &str) -> bool {
        self.hashes.write().remove(connector_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.hashes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.read().is_empty()
    }
}

#[async_trait]
impl CredentialVerifier for TokenTableVerifier {
    async fn verify(&self, connector_id: &str, token_hash: &str) -> Result<bool> {
        Ok(self
            .hashes
            .read()
            .get(connector_id)
            .is_some_and(|expected| expected == token_hash))
    }
}

/// Extract the token from an `Authorization` header value.
///
/// Only the `Bearer` scheme is accepted.
pub fn bearer_token(auth_header: &str) -> Option<&str> {
    let (scheme, token) = auth_header.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}
