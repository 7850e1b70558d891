//! Shared store used for connector ownership and cross-instance messaging
//!
//! The data model is Redis-shaped: string keys with per-key expiry, atomic
//! conditional writes, and append-only streams with consumer groups.
//! [`RedisStore`] talks to a real server; [`MemoryStore`] implements the same
//! semantics in-process so several gateway instances can share one store
//! inside a single test.

pub mod memory;
pub mod redis_store;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

use crate::common::Result;

/// Consumer group reading every connector command log
pub const COMMAND_GROUP: &str = "owner";

/// Key layout
pub mod keys {
    pub fn owner(connector_id: &str) -> String {
        format!("connector:{}:owner", connector_id)
    }

    pub fn status(connector_id: &str) -> String {
        format!("connector:{}:status", connector_id)
    }

    pub fn token_version(connector_id: &str) -> String {
        format!("connector:{}:tokenVersion", connector_id)
    }

    pub fn command_log(connector_id: &str) -> String {
        format!("cmd:{}", connector_id)
    }

    pub fn reply_log(instance_id: &str) -> String {
        format!("reply:{}", instance_id)
    }

    pub fn reply_group(instance_id: &str) -> String {
        format!("gateway-{}", instance_id)
    }
}

/// A second key written in the same atomic step as a conditional write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompanionWrite {
    pub key: String,
    pub value: String,
    pub ttl: Duration,
}

impl CompanionWrite {
    pub fn new(key: impl Into<String>, value: impl Into<String>, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            ttl,
        }
    }
}

/// One stream entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: String,
    pub fields: HashMap<String, String>,
}

impl StreamEntry {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Result of one auto-claim batch
#[derive(Debug, Clone, Default)]
pub struct AutoClaim {
    /// Cursor for the next batch; `"0-0"` once the pending list is exhausted
    pub next_start: String,
    pub entries: Vec<StreamEntry>,
}

impl AutoClaim {
    pub fn is_exhausted(&self) -> bool {
        self.next_start == "0-0"
    }
}

#[async_trait]
pub trait SharedStore: Send + Sync + 'static {
    // === Keys ===

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// `SET key value NX EX ttl`
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Replace the value (and TTL) only if it currently equals `expected`
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool>;

    /// Extend the TTL only if the value equals `expected`, applying `companion`
    /// in the same step
    async fn compare_and_refresh(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
        companion: Option<&CompanionWrite>,
    ) -> Result<bool>;

    /// Delete the key only if its value starts with `prefix`, applying
    /// `companion` in the same step
    async fn delete_if_prefix(
        &self,
        key: &str,
        prefix: &str,
        companion: Option<&CompanionWrite>,
    ) -> Result<bool>;

    async fn incr(&self, key: &str) -> Result<i64>;

    // === Streams ===

    /// Create `group` on `stream` from the beginning; an existing group is kept
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()>;

    /// Append an entry, trimming the stream to roughly `max_len` entries
    async fn append(&self, stream: &str, fields: &[(&str, &str)], max_len: usize)
        -> Result<String>;

    /// Read entries never delivered to the group, blocking up to `block`
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>>;

    /// Re-read entries delivered to `consumer` but not yet acknowledged
    async fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>>;

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<()>;

    /// Claim pending entries idle for at least `min_idle`, starting at `start`
    async fn auto_claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        start: &str,
        count: usize,
    ) -> Result<AutoClaim>;

    /// Drop whatever is dedicated to reading `stream`; called once its consumer stops
    async fn release_stream(&self, _stream: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(keys::owner("c1"), "connector:c1:owner");
        assert_eq!(keys::status("c1"), "connector:c1:status");
        assert_eq!(keys::token_version("c1"), "connector:c1:tokenVersion");
        assert_eq!(keys::command_log("c1"), "cmd:c1");
        assert_eq!(keys::reply_log("inst-A"), "reply:inst-A");
        assert_eq!(keys::reply_group("inst-A"), "gateway-inst-A");
    }
}
