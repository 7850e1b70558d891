//! Reference-counted LRU pool of long-lived resources
//!
//! Holds expensive resources (database connection pools, clients) keyed by
//! string. Capacity is enforced on insert by evicting the least recently used
//! entry that nobody holds; when every entry is held the pool grows past
//! capacity rather than blocking. A background sweep drops unheld entries
//! idle past the TTL.
//!
//! `refs` is separate from recency: a resource can look idle while a
//! checked-out client still uses it.

use futures_util::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::common::config::PoolConfig;
use crate::common::metrics::METRICS;
use crate::common::Result;

/// Closes a resource once it leaves the pool
pub type CloseFn<T> = Arc<dyn Fn(String, Arc<T>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Notified with the key of every removed entry
pub type RemoveFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Wrap an async closure as a [`CloseFn`]
pub fn close_fn<T, F, Fut>(f: F) -> CloseFn<T>
where
    F: Fn(String, Arc<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |key, resource| f(key, resource).boxed())
}

struct PoolEntry<T> {
    resource: Arc<T>,
    last_used: Instant,
    refs: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub size: usize,
    pub held: usize,
    pub max_size: usize,
}

struct PoolInner<T> {
    name: String,
    max_size: usize,
    idle_ttl: Duration,
    cleanup_interval: Duration,
    entries: Mutex<HashMap<String, PoolEntry<T>>>,
    close: CloseFn<T>,
    on_remove: Mutex<Option<RemoveFn>>,
    sweeper: Mutex<Option<CancellationToken>>,
}

pub struct PoolManager<T> {
    inner: Arc<PoolInner<T>>,
}

impl<T> Clone for PoolManager<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + Sync + 'static> PoolManager<T> {
    pub fn new(name: impl Into<String>, config: &PoolConfig, close: CloseFn<T>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                name: name.into(),
                max_size: config.max_pools,
                idle_ttl: config.idle_ttl(),
                cleanup_interval: config.cleanup_interval(),
                entries: Mutex::new(HashMap::new()),
                close,
                on_remove: Mutex::new(None),
                sweeper: Mutex::new(None),
            }),
        }
    }

    pub fn set_on_remove(&self, on_remove: RemoveFn) {
        *self.inner.on_remove.lock() = Some(on_remove);
    }

    /// Look up a resource, marking it used
    pub fn get(&self, key: &str) -> Option<Arc<T>> {
        let mut entries = self.inner.entries.lock();
        let entry = entries.get_mut(key)?;
        entry.last_used = Instant::now();
        Some(Arc::clone(&entry.resource))
    }

    /// Look up a resource and take a reference on it
    pub fn hold(&self, key: &str) -> Option<Arc<T>> {
        let mut entries = self.inner.entries.lock();
        let entry = entries.get_mut(key)?;
        entry.last_used = Instant::now();
        entry.refs += 1;
        Some(Arc::clone(&entry.resource))
    }

    /// Drop a reference taken by `hold` (never below zero)
    pub fn release(&self, key: &str) {
        if let Some(entry) = self.inner.entries.lock().get_mut(key) {
            entry.refs = entry.refs.saturating_sub(1);
        }
    }

    pub fn refs(&self, key: &str) -> Option<usize> {
        self.inner.entries.lock().get(key).map(|e| e.refs)
    }

    /// Insert a resource, evicting the least recently used unheld entry when
    /// full. A previous resource under the same key is closed.
    pub async fn set(&self, key: &str, resource: T, refs: usize) -> Arc<T> {
        let resource = Arc::new(resource);
        let mut closing = Vec::new();
        {
            let mut entries = self.inner.entries.lock();
            if let Some(previous) = entries.remove(key) {
                closing.push((key.to_string(), previous.resource));
            } else if entries.len() >= self.inner.max_size {
                let victim = entries
                    .iter()
                    .filter(|(_, e)| e.refs == 0)
                    .min_by_key(|(_, e)| e.last_used)
                    .map(|(k, _)| k.clone());
                match victim {
                    Some(victim) => {
                        if let Some(evicted) = entries.remove(&victim) {
                            closing.push((victim, evicted.resource));
                        }
                    }
                    None => {
                        tracing::warn!(
                            pool = %self.inner.name,
                            size = entries.len(),
                            max_size = self.inner.max_size,
                            "All pooled resources held, growing past capacity"
                        );
                    }
                }
            }
            entries.insert(
                key.to_string(),
                PoolEntry {
                    resource: Arc::clone(&resource),
                    last_used: Instant::now(),
                    refs,
                },
            );
        }
        METRICS.pooled_resources.inc();

        for (evicted, evicted_resource) in closing {
            tracing::debug!(pool = %self.inner.name, key = %evicted, "Evicting pooled resource");
            self.finish_removal(evicted, evicted_resource).await;
        }
        resource
    }

    /// Remove and close a resource
    pub async fn remove(&self, key: &str) -> bool {
        let entry = self.inner.entries.lock().remove(key);
        match entry {
            Some(entry) => {
                self.finish_removal(key.to_string(), entry.resource).await;
                true
            }
            None => false,
        }
    }

    async fn finish_removal(&self, key: String, resource: Arc<T>) {
        METRICS.pooled_resources.dec();
        if let Err(e) = (self.inner.close)(key.clone(), resource).await {
            tracing::warn!(pool = %self.inner.name, key = %key, error = %e, "Failed to close pooled resource");
        }
        let on_remove = self.inner.on_remove.lock().clone();
        if let Some(on_remove) = on_remove {
            on_remove(&key);
        }
    }

    /// Remove unheld entries idle longer than the TTL
    pub async fn sweep_idle(&self) -> usize {
        let now = Instant::now();
        let idle: Vec<String> = self
            .inner
            .entries
            .lock()
            .iter()
            .filter(|(_, e)| e.refs == 0 && now.duration_since(e.last_used) > self.inner.idle_ttl)
            .map(|(k, _)| k.clone())
            .collect();

        let mut removed = 0;
        for key in idle {
            // Re-check: the entry may have been touched since the scan
            let entry = {
                let mut entries = self.inner.entries.lock();
                let still_idle = entries.get(&key).is_some_and(|e| {
                    e.refs == 0 && Instant::now().duration_since(e.last_used) > self.inner.idle_ttl
                });
                if still_idle {
                    entries.remove(&key)
                } else {
                    None
                }
            };
            if let Some(entry) = entry {
                self.finish_removal(key, entry.resource).await;
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(pool = %self.inner.name, removed, "Swept idle pooled resources");
        }
        removed
    }

    /// Start the periodic idle sweep. No-op if already running.
    pub fn start_cleanup(&self) {
        let token = {
            let mut sweeper = self.inner.sweeper.lock();
            if sweeper.is_some() {
                return;
            }
            let token = CancellationToken::new();
            *sweeper = Some(token.clone());
            token
        };

        let pool = self.clone();
        let period = self.inner.cleanup_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        pool.sweep_idle().await;
                    }
                }
            }
        });
    }

    /// Stop the sweep and close every resource
    pub async fn shutdown(&self) {
        if let Some(token) = self.inner.sweeper.lock().take() {
            token.cancel();
        }
        let drained: Vec<(String, PoolEntry<T>)> = self.inner.entries.lock().drain().collect();
        let count = drained.len();
        for (key, entry) in drained {
            self.finish_removal(key, entry.resource).await;
        }
        tracing::info!(pool = %self.inner.name, closed = count, "Pool shut down");
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.entries.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.lock().is_empty()
    }

    pub fn stats(&self) -> PoolStats {
        let entries = self.inner.entries.lock();
        PoolStats {
            size: entries.len(),
            held: entries.values().filter(|e| e.refs > 0).count(),
            max_size: self.inner.max_size,
        }
    }
}
