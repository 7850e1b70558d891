//! Utility functions for the gateway

use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

/// Get current Unix timestamp (milliseconds)
pub fn timestamp_now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Generate a correlation ID for a dispatched command
pub fn generate_correlation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Hex SHA-256 of a connector token. Only digests are compared or stored.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Validate a connector ID (non-empty, bounded, no key separators)
pub fn validate_connector_id(id: &str) -> crate::Result<()> {
    if id.is_empty() {
        return Err(crate::Error::InvalidConfig(
            "connector id cannot be empty".into(),
        ));
    }

    if id.len() > 256 {
        return Err(crate::Error::InvalidConfig(
            "connector id too long (max 256 bytes)".into(),
        ));
    }

    if id.chars().any(|c| c.is_control() || c == ':' || c.is_whitespace()) {
        return Err(crate::Error::InvalidConfig(
            "connector id contains invalid characters".into(),
        ));
    }

    Ok(())
}
