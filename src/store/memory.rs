//! In-process shared store
//!
//! Mirrors the Redis semantics the gateway relies on: lazy key expiry,
//! consumer groups with a pending-entries list, blocking group reads and
//! idle-based claiming. Expiry uses `tokio::time::Instant`, so tests running
//! with a paused clock can advance past TTLs deterministically.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{AutoClaim, CompanionWrite, SharedStore, StreamEntry};
use crate::common::{Error, Result};

#[derive(Debug, Clone)]
struct ValueEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl ValueEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Clone)]
struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
    deliveries: u32,
}

#[derive(Debug, Default)]
struct Group {
    last_delivered: u64,
    pending: BTreeMap<u64, PendingEntry>,
}

#[derive(Debug, Default)]
struct Stream {
    entries: BTreeMap<u64, HashMap<String, String>>,
    groups: HashMap<String, Group>,
}

#[derive(Debug, Default)]
struct State {
    values: HashMap<String, ValueEntry>,
    streams: HashMap<String, Stream>,
    next_seq: u64,
}

impl State {
    fn live_value(&mut self, key: &str, now: Instant) -> Option<&mut ValueEntry> {
        if self.values.get(key).is_some_and(|v| v.is_expired(now)) {
            self.values.remove(key);
        }
        self.values.get_mut(key)
    }

    fn put(&mut self, key: &str, value: &str, ttl: Option<Duration>, now: Instant) {
        self.values.insert(
            key.to_string(),
            ValueEntry {
                value: value.to_string(),
                expires_at: ttl.map(|ttl| now + ttl),
            },
        );
    }

    fn apply(&mut self, companion: Option<&CompanionWrite>, now: Instant) {
        if let Some(write) = companion {
            self.put(&write.key, &write.value, Some(write.ttl), now);
        }
    }
}

fn format_id(seq: u64) -> String {
    format!("{}-0", seq)
}

fn parse_id(id: &str) -> Result<u64> {
    id.split('-')
        .next()
        .and_then(|ms| ms.parse().ok())
        .ok_or_else(|| Error::MalformedEntry(format!("invalid stream id {}", id)))
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    appended: Notify,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unconditional write, for seeding tests
    pub fn set(&self, key: &str, value: &str, ttl: Option<Duration>) {
        self.state.lock().put(key, value, ttl, Instant::now());
    }

    /// Drop a key as if its TTL had elapsed
    pub fn expire(&self, key: &str) {
        self.state.lock().values.remove(key);
    }

    /// Remaining TTL of a live key
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let mut state = self.state.lock();
        state
            .live_value(key, now)
            .and_then(|v| v.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    /// All entries of a stream (`XRANGE - +`)
    pub fn entries(&self, stream: &str) -> Vec<StreamEntry> {
        let state = self.state.lock();
        state
            .streams
            .get(stream)
            .map(|s| {
                s.entries
                    .iter()
                    .map(|(seq, fields)| StreamEntry {
                        id: format_id(*seq),
                        fields: fields.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Size of a group's pending-entries list
    pub fn pending_count(&self, stream: &str, group: &str) -> usize {
        let state = self.state.lock();
        state
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.len())
            .unwrap_or(0)
    }

    /// Consumer currently holding a pending entry
    pub fn pending_owner(&self, stream: &str, group: &str, id: &str) -> Option<String> {
        let seq = parse_id(id).ok()?;
        let state = self.state.lock();
        state
            .streams
            .get(stream)?
            .groups
            .get(group)?
            .pending
            .get(&seq)
            .map(|p| p.consumer.clone())
    }

    fn try_read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let stream_state = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| Error::Internal(format!("NOGROUP no such key {}", stream)))?;
        let Stream { entries, groups } = stream_state;
        let group_state = groups.get_mut(group).ok_or_else(|| {
            Error::Internal(format!("NOGROUP no group {} on {}", group, stream))
        })?;

        let mut out = Vec::new();
        for (seq, fields) in entries.range(group_state.last_delivered + 1..).take(count) {
            group_state.pending.insert(
                *seq,
                PendingEntry {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    deliveries: 1,
                },
            );
            out.push(StreamEntry {
                id: format_id(*seq),
                fields: fields.clone(),
            });
        }
        if let Some(last) = out.last() {
            group_state.last_delivered = parse_id(&last.id)?;
        }
        Ok(out)
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        Ok(self
            .state
            .lock()
            .live_value(key, now)
            .map(|v| v.value.clone()))
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut state = self.state.lock();
        if state.live_value(key, now).is_some() {
            return Ok(false);
        }
        state.put(key, value, Some(ttl), now);
        Ok(true)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let now = Instant::now();
        let mut state = self.state.lock();
        match state.live_value(key, now) {
            Some(current) if current.value == expected => {
                state.put(key, value, Some(ttl), now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn compare_and_refresh(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
        companion: Option<&CompanionWrite>,
    ) -> Result<bool> {
        let now = Instant::now();
        let mut state = self.state.lock();
        match state.live_value(key, now) {
            Some(current) if current.value == expected => {
                current.expires_at = Some(now + ttl);
                state.apply(companion, now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_if_prefix(
        &self,
        key: &str,
        prefix: &str,
        companion: Option<&CompanionWrite>,
    ) -> Result<bool> {
        let now = Instant::now();
        let mut state = self.state.lock();
        match state.live_value(key, now) {
            Some(current) if current.value.starts_with(prefix) => {
                state.values.remove(key);
                state.apply(companion, now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let current = match state.live_value(key, now) {
            Some(v) => v.value.parse::<i64>().map_err(|_| {
                Error::Internal(format!("value at {} is not an integer", key))
            })?,
            None => 0,
        };
        let next = current + 1;
        state.put(key, &next.to_string(), None, now);
        Ok(next)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut state = self.state.lock();
        state
            .streams
            .entry(stream.to_string())
            .or_default()
            .groups
            .entry(group.to_string())
            .or_default();
        Ok(())
    }

    async fn append(
        &self,
        stream: &str,
        fields: &[(&str, &str)],
        max_len: usize,
    ) -> Result<String> {
        let id = {
            let mut state = self.state.lock();
            state.next_seq += 1;
            let seq = state.next_seq;
            let stream_state = state.streams.entry(stream.to_string()).or_default();
            stream_state.entries.insert(
                seq,
                fields
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            );
            while max_len > 0 && stream_state.entries.len() > max_len {
                if let Some((trimmed, _)) = stream_state.entries.pop_first() {
                    for group in stream_state.groups.values_mut() {
                        group.pending.remove(&trimmed);
                    }
                }
            }
            format_id(seq)
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>> {
        let deadline = Instant::now() + block;
        loop {
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let entries = self.try_read(stream, group, consumer, count)?;
            if !entries.is_empty() || block.is_zero() {
                return Ok(entries);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(Vec::new()),
            }
        }
    }

    async fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let stream_state = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| Error::Internal(format!("NOGROUP no such key {}", stream)))?;
        let Stream { entries, groups } = stream_state;
        let group_state = groups.get_mut(group).ok_or_else(|| {
            Error::Internal(format!("NOGROUP no group {} on {}", group, stream))
        })?;

        let mut out = Vec::new();
        let mut trimmed = Vec::new();
        for (seq, pending) in group_state
            .pending
            .iter_mut()
            .filter(|(_, p)| p.consumer == consumer)
            .take(count)
        {
            match entries.get(seq) {
                Some(fields) => {
                    pending.delivered_at = now;
                    pending.deliveries += 1;
                    out.push(StreamEntry {
                        id: format_id(*seq),
                        fields: fields.clone(),
                    });
                }
                None => trimmed.push(*seq),
            }
        }
        for seq in trimmed {
            group_state.pending.remove(&seq);
        }
        Ok(out)
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<()> {
        let seq = parse_id(id)?;
        let mut state = self.state.lock();
        if let Some(group_state) = state
            .streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
        {
            group_state.pending.remove(&seq);
        }
        Ok(())
    }

    async fn auto_claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        start: &str,
        count: usize,
    ) -> Result<AutoClaim> {
        let start = parse_id(start)?;
        let now = Instant::now();
        let mut state = self.state.lock();
        let Some(stream_state) = state.streams.get_mut(stream) else {
            return Err(Error::Internal(format!("NOGROUP no such key {}", stream)));
        };
        let Stream { entries, groups } = stream_state;
        let group_state = groups.get_mut(group).ok_or_else(|| {
            Error::Internal(format!("NOGROUP no group {} on {}", group, stream))
        })?;

        let scan: Vec<u64> = group_state
            .pending
            .range(start..)
            .map(|(seq, _)| *seq)
            .take(count + 1)
            .collect();
        let next_start = if scan.len() > count {
            format_id(scan[count])
        } else {
            "0-0".to_string()
        };

        let mut claimed = Vec::new();
        for seq in scan.into_iter().take(count) {
            let Some(pending) = group_state.pending.get_mut(&seq) else {
                continue;
            };
            if now.saturating_duration_since(pending.delivered_at) < min_idle {
                continue;
            }
            match entries.get(&seq) {
                Some(fields) => {
                    pending.consumer = consumer.to_string();
                    pending.delivered_at = now;
                    pending.deliveries += 1;
                    claimed.push(StreamEntry {
                        id: format_id(seq),
                        fields: fields.clone(),
                    });
                }
                None => {
                    group_state.pending.remove(&seq);
                }
            }
        }

        Ok(AutoClaim {
            next_start,
            entries: claimed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_set_if_absent_and_expiry() {
        let store = MemoryStore::new();
        assert!(store
            .set_if_absent("k", "a", Duration::from_secs(30))
            .await
            .unwrap());
        assert!(!store
            .set_if_absent("k", "b", Duration::from_secs(30))
            .await
            .unwrap());
        assert_eq!(store.ttl("k"), Some(Duration::from_secs(30)));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store
            .set_if_absent("k", "b", Duration::from_secs(30))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_conditional_writes() {
        let store = MemoryStore::new();
        store.set("k", "inst-a:1", None);
        let companion = CompanionWrite::new("s", "online", Duration::from_secs(60));

        assert!(!store
            .compare_and_refresh("k", "inst-a:2", Duration::from_secs(30), Some(&companion))
            .await
            .unwrap());
        assert_eq!(store.get("s").await.unwrap(), None);

        assert!(store
            .compare_and_refresh("k", "inst-a:1", Duration::from_secs(30), Some(&companion))
            .await
            .unwrap());
        assert_eq!(store.get("s").await.unwrap().as_deref(), Some("online"));

        assert!(!store.delete_if_prefix("k", "inst-b:", None).await.unwrap());
        assert!(store.delete_if_prefix("k", "inst-a:", None).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_incr() {
        let store = MemoryStore::new();
        assert_eq!(store.incr("v").await.unwrap(), 1);
        assert_eq!(store.incr("v").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_group_read_and_ack() {
        let store = MemoryStore::new();
        store.ensure_group("cmd:c1", "owner").await.unwrap();
        store.append("cmd:c1", &[("data", "1")], 100).await.unwrap();
        store.append("cmd:c1", &[("data", "2")], 100).await.unwrap();

        let batch = store
            .read_group("cmd:c1", "owner", "inst-a", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].field("data"), Some("1"));
        assert_eq!(store.pending_count("cmd:c1", "owner"), 2);

        // Delivered entries are not handed out again
        let again = store
            .read_group("cmd:c1", "owner", "inst-a", 10, Duration::ZERO)
            .await
            .unwrap();
        assert!(again.is_empty());

        store.ack("cmd:c1", "owner", &batch[0].id).await.unwrap();
        assert_eq!(store.pending_count("cmd:c1", "owner"), 1);
    }

    #[tokio::test]
    async fn test_read_without_group_fails() {
        let store = MemoryStore::new();
        assert!(store
            .read_group("cmd:none", "owner", "inst-a", 10, Duration::ZERO)
            .await
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_read_wakes_on_append() {
        let store = std::sync::Arc::new(MemoryStore::new());
        store.ensure_group("reply:a", "gateway-a").await.unwrap();

        let reader = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .read_group("reply:a", "gateway-a", "a", 10, Duration::from_secs(5))
                    .await
            })
        };
        tokio::task::yield_now().await;
        store.append("reply:a", &[("status", "ok")], 100).await.unwrap();

        let entries = reader.await.unwrap().unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_trim_to_max_len() {
        let store = MemoryStore::new();
        for i in 0..5 {
            let n = i.to_string();
            store.append("s", &[("n", n.as_str())], 3).await.unwrap();
        }
        let entries = store.entries("s");
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].field("n"), Some("2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_claim_idle_entries() {
        let store = MemoryStore::new();
        store.ensure_group("cmd:c1", "owner").await.unwrap();
        let id = store.append("cmd:c1", &[("data", "x")], 100).await.unwrap();
        store
            .read_group("cmd:c1", "owner", "dead", 10, Duration::ZERO)
            .await
            .unwrap();

        let early = store
            .auto_claim("cmd:c1", "owner", "live", Duration::from_secs(60), "0-0", 10)
            .await
            .unwrap();
        assert!(early.entries.is_empty());
        assert!(early.is_exhausted());

        tokio::time::advance(Duration::from_secs(61)).await;
        let claimed = store
            .auto_claim("cmd:c1", "owner", "live", Duration::from_secs(60), "0-0", 10)
            .await
            .unwrap();
        assert_eq!(claimed.entries.len(), 1);
        assert_eq!(
            store.pending_owner("cmd:c1", "owner", &id).as_deref(),
            Some("live")
        );
    }

    #[tokio::test]
    async fn test_read_pending_returns_own_unacked_entries() {
        let store = MemoryStore::new();
        store.ensure_group("cmd:c1", "owner").await.unwrap();
        let first = store.append("cmd:c1", &[("n", "1")], 100).await.unwrap();
        store
            .read_group("cmd:c1", "owner", "a", 10, Duration::ZERO)
            .await
            .unwrap();
        store.append("cmd:c1", &[("n", "2")], 100).await.unwrap();
        store
            .read_group("cmd:c1", "owner", "b", 10, Duration::ZERO)
            .await
            .unwrap();

        let mine = store.read_pending("cmd:c1", "owner", "a", 10).await.unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].id, first);
        assert_eq!(mine[0].field("n"), Some("1"));

        store.ack("cmd:c1", "owner", &first).await.unwrap();
        assert!(store
            .read_pending("cmd:c1", "owner", "a", 10)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(store.pending_count("cmd:c1", "owner"), 1);
    }

    #[tokio::test]
    async fn test_auto_claim_cursor() {
        let store = MemoryStore::new();
        store.ensure_group("s", "g").await.unwrap();
        for _ in 0..3 {
            store.append("s", &[("f", "v")], 100).await.unwrap();
        }
        store.read_group("s", "g", "c", 10, Duration::ZERO).await.unwrap();

        let first = store
            .auto_claim("s", "g", "d", Duration::ZERO, "0-0", 2)
            .await
            .unwrap();
        assert_eq!(first.entries.len(), 2);
        assert!(!first.is_exhausted());

        let second = store
            .auto_claim("s", "g", "d", Duration::ZERO, &first.next_start, 2)
            .await
            .unwrap();
        assert_eq!(second.entries.len(), 1);
        assert!(second.is_exhausted());
    }
}
