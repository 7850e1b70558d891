//! Connector ownership with fencing tokens
//!
//! Each connector is owned by at most one gateway instance at a time. The
//! owner key holds `{instance_id}:{fence}` with a short TTL that a per-connector
//! refresh task keeps extending. If the refresh compare fails the instance has
//! been superseded: the local entry is dropped and the registered
//! ownership-lost handler runs once.
//!
//! Without a shared store the registry runs in single-instance mode:
//! acquisition always succeeds with a local fence and nothing leaves the
//! process.

use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::common::config::OwnershipConfig;
use crate::common::metrics::METRICS;
use crate::common::Result;
use crate::store::{keys, CompanionWrite, SharedStore};

pub const STATUS_ONLINE: &str = "online";
pub const STATUS_OFFLINE: &str = "offline";

/// Invoked once when ownership of a connector is lost on refresh
pub type OwnershipLostHandler = Box<dyn FnOnce(String) + Send + 'static>;

/// Outcome of an acquisition attempt. `fence` is 0 when refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acquisition {
    pub acquired: bool,
    pub fence: u64,
}

impl Acquisition {
    fn granted(fence: u64) -> Self {
        Self {
            acquired: true,
            fence,
        }
    }

    fn refused() -> Self {
        Self {
            acquired: false,
            fence: 0,
        }
    }
}

struct LocalOwnership {
    fence: u64,
    refresh: Option<JoinHandle<()>>,
}

impl Drop for LocalOwnership {
    fn drop(&mut self) {
        if let Some(handle) = self.refresh.take() {
            handle.abort();
        }
    }
}

pub struct OwnershipRegistry {
    instance_id: String,
    store: Option<Arc<dyn SharedStore>>,
    config: OwnershipConfig,
    next_fence: AtomicU64,
    owned: Mutex<HashMap<String, LocalOwnership>>,
    lost_handlers: Mutex<HashMap<String, OwnershipLostHandler>>,
}

impl OwnershipRegistry {
    pub fn new(
        instance_id: impl Into<String>,
        store: Option<Arc<dyn SharedStore>>,
        config: OwnershipConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            instance_id: instance_id.into(),
            store,
            config,
            next_fence: AtomicU64::new(0),
            owned: Mutex::new(HashMap::new()),
            lost_handlers: Mutex::new(HashMap::new()),
        })
    }

    /// Registry with no shared store
    pub fn single_instance(instance_id: impl Into<String>) -> Arc<Self> {
        Self::new(instance_id, None, OwnershipConfig::default())
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn is_distributed(&self) -> bool {
        self.store.is_some()
    }

    fn owner_prefix(&self) -> String {
        format!("{}:", self.instance_id)
    }

    fn owner_value(&self, fence: u64) -> String {
        format!("{}:{}", self.instance_id, fence)
    }

    fn online_write(&self, connector_id: &str) -> CompanionWrite {
        CompanionWrite::new(
            keys::status(connector_id),
            STATUS_ONLINE,
            self.config.status_ttl(),
        )
    }

    /// Try to become the owner of `connector_id`.
    ///
    /// Re-acquiring a connector this instance already owns swaps in a fresh
    /// fence, so a reconnect never has to wait for the old key to expire.
    pub async fn acquire(self: &Arc<Self>, connector_id: &str) -> Result<Acquisition> {
        let fence = self.next_fence.fetch_add(1, Ordering::SeqCst) + 1;

        let Some(store) = &self.store else {
            self.install(connector_id, fence, None);
            return Ok(Acquisition::granted(fence));
        };

        let key = keys::owner(connector_id);
        let value = self.owner_value(fence);
        let ttl = self.config.owner_ttl();

        let mut acquired = store.set_if_absent(&key, &value, ttl).await?;
        if !acquired {
            match store.get(&key).await? {
                Some(current) if current.starts_with(&self.owner_prefix()) => {
                    acquired = store.compare_and_swap(&key, &current, &value, ttl).await?;
                }
                Some(current) => {
                    tracing::debug!(
                        connector_id = %connector_id,
                        owner = %current,
                        "Connector owned by another instance"
                    );
                }
                // Expired between the two calls
                None => {
                    acquired = store.set_if_absent(&key, &value, ttl).await?;
                }
            }
        }

        if !acquired {
            METRICS.ownership_conflicts.inc();
            return Ok(Acquisition::refused());
        }

        // Status is only written while the owner value is still ours
        if !store
            .compare_and_refresh(&key, &value, ttl, Some(&self.online_write(connector_id)))
            .await?
        {
            METRICS.ownership_conflicts.inc();
            return Ok(Acquisition::refused());
        }

        let refresh = self.spawn_refresh(connector_id.to_string(), fence);
        self.install(connector_id, fence, Some(refresh));
        tracing::info!(
            connector_id = %connector_id,
            instance_id = %self.instance_id,
            fence,
            "Acquired connector ownership"
        );
        Ok(Acquisition::granted(fence))
    }

    fn install(&self, connector_id: &str, fence: u64, refresh: Option<JoinHandle<()>>) {
        let previous = self
            .owned
            .lock()
            .insert(connector_id.to_string(), LocalOwnership { fence, refresh });
        if previous.is_none() {
            METRICS.owned_connectors.inc();
        }
        METRICS.ownership_acquired.inc();
    }

    fn spawn_refresh(self: &Arc<Self>, connector_id: String, fence: u64) -> JoinHandle<()> {
        let registry: Weak<Self> = Arc::downgrade(self);
        let period = self.config.refresh_interval();
        // Spread refreshes of connectors acquired in the same burst
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period + jitter, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    return;
                };
                match registry.refresh_once(&connector_id, fence).await {
                    Ok(true) => {
                        tracing::trace!(connector_id = %connector_id, fence, "Ownership refreshed");
                    }
                    Ok(false) => {
                        registry.handle_lost(&connector_id, fence);
                        return;
                    }
                    Err(e) => {
                        // Retried on the next tick; a lasting outage ends in
                        // key expiry and a failed compare
                        tracing::warn!(
                            connector_id = %connector_id,
                            fence,
                            error = %e,
                            "Ownership refresh failed"
                        );
                    }
                }
            }
        })
    }

    async fn refresh_once(&self, connector_id: &str, fence: u64) -> Result<bool> {
        let Some(store) = &self.store else {
            return Ok(true);
        };
        store
            .compare_and_refresh(
                &keys::owner(connector_id),
                &self.owner_value(fence),
                self.config.owner_ttl(),
                Some(&self.online_write(connector_id)),
            )
            .await
    }

    fn handle_lost(&self, connector_id: &str, fence: u64) {
        let entry = {
            let mut owned = self.owned.lock();
            match owned.get(connector_id) {
                Some(entry) if entry.fence == fence => owned.remove(connector_id),
                _ => None,
            }
        };
        let Some(mut entry) = entry else {
            return;
        };
        // Called from the refresh task itself; detach instead of aborting
        entry.refresh.take();

        METRICS.ownership_lost.inc();
        METRICS.owned_connectors.dec();
        tracing::warn!(
            connector_id = %connector_id,
            instance_id = %self.instance_id,
            fence,
            "Lost connector ownership"
        );

        let handler = self.lost_handlers.lock().remove(connector_id);
        if let Some(handler) = handler {
            handler(connector_id.to_string());
        }
    }

    /// Give up ownership. A no-op on the shared store if another instance
    /// has already taken over.
    pub async fn release(&self, connector_id: &str) -> Result<()> {
        let entry = self.owned.lock().remove(connector_id);
        if entry.is_some() {
            METRICS.owned_connectors.dec();
            METRICS.ownership_released.inc();
        }
        drop(entry);

        let Some(store) = &self.store else {
            return Ok(());
        };
        let offline = CompanionWrite::new(
            keys::status(connector_id),
            STATUS_OFFLINE,
            self.config.status_ttl(),
        );
        let released = store
            .delete_if_prefix(&keys::owner(connector_id), &self.owner_prefix(), Some(&offline))
            .await?;
        if released {
            tracing::info!(connector_id = %connector_id, "Released connector ownership");
        } else {
            tracing::debug!(
                connector_id = %connector_id,
                "Release skipped, ownership already moved"
            );
        }
        Ok(())
    }

    /// Release every connector owned by this instance
    pub async fn release_all(&self) {
        for connector_id in self.owned_connectors() {
            if let Err(e) = self.release(&connector_id).await {
                tracing::warn!(connector_id = %connector_id, error = %e, "Release failed");
            }
        }
    }

    /// Guard used right before acting on behalf of a connector.
    ///
    /// Store errors count as invalid.
    pub async fn is_ownership_valid(&self, connector_id: &str, fence: u64) -> bool {
        if self.fence_of(connector_id) != Some(fence) {
            return false;
        }
        let Some(store) = &self.store else {
            return true;
        };
        match store.get(&keys::owner(connector_id)).await {
            Ok(Some(current)) => current == self.owner_value(fence),
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(connector_id = %connector_id, error = %e, "Ownership check failed");
                false
            }
        }
    }

    /// Whether any instance currently serves the connector
    pub async fn is_online_in_cluster(&self, connector_id: &str) -> Result<bool> {
        if self.is_locally_owned(connector_id) {
            return Ok(true);
        }
        let Some(store) = &self.store else {
            return Ok(false);
        };
        let status = store.get(&keys::status(connector_id)).await?;
        Ok(status.as_deref() == Some(STATUS_ONLINE))
    }

    /// Current owner value as stored, `None` in single-instance mode
    pub async fn current_owner(&self, connector_id: &str) -> Result<Option<String>> {
        match &self.store {
            Some(store) => store.get(&keys::owner(connector_id)).await,
            None => Ok(self
                .fence_of(connector_id)
                .map(|fence| self.owner_value(fence))),
        }
    }

    pub fn is_locally_owned(&self, connector_id: &str) -> bool {
        self.owned.lock().contains_key(connector_id)
    }

    pub fn fence_of(&self, connector_id: &str) -> Option<u64> {
        self.owned.lock().get(connector_id).map(|e| e.fence)
    }

    pub fn owned_connectors(&self) -> Vec<String> {
        self.owned.lock().keys().cloned().collect()
    }

    pub fn on_ownership_lost(&self, connector_id: &str, handler: OwnershipLostHandler) {
        self.lost_handlers
            .lock()
            .insert(connector_id.to_string(), handler);
    }

    pub fn clear_ownership_lost(&self, connector_id: &str) {
        self.lost_handlers.lock().remove(connector_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn registry(instance: &str, store: &Arc<MemoryStore>) -> Arc<OwnershipRegistry> {
        OwnershipRegistry::new(
            instance,
            Some(store.clone() as Arc<dyn SharedStore>),
            OwnershipConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_single_instance_always_acquires() {
        let registry = OwnershipRegistry::single_instance("solo");
        let first = registry.acquire("c1").await.unwrap();
        let second = registry.acquire("c2").await.unwrap();
        assert_eq!(first, Acquisition::granted(1));
        assert_eq!(second, Acquisition::granted(2));
        assert!(registry.is_ownership_valid("c1", 1).await);
        assert!(!registry.is_ownership_valid("c1", 2).await);
        assert!(registry.is_online_in_cluster("c2").await.unwrap());

        registry.release("c1").await.unwrap();
        assert!(!registry.is_locally_owned("c1"));
        assert!(!registry.is_online_in_cluster("c1").await.unwrap());
    }

    #[tokio::test]
    async fn test_reacquire_same_instance_swaps_fence() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry("inst-a", &store);

        let first = registry.acquire("c1").await.unwrap();
        let again = registry.acquire("c1").await.unwrap();
        assert!(again.acquired);
        assert!(again.fence > first.fence);
        assert_eq!(
            store.get(&keys::owner("c1")).await.unwrap(),
            Some(format!("inst-a:{}", again.fence))
        );
        assert!(!registry.is_ownership_valid("c1", first.fence).await);
        assert!(registry.is_ownership_valid("c1", again.fence).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_writes_status_online() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry("inst-a", &store);
        registry.acquire("c1").await.unwrap();

        assert_eq!(
            store.get(&keys::status("c1")).await.unwrap().as_deref(),
            Some(STATUS_ONLINE)
        );
        assert_eq!(store.ttl(&keys::status("c1")), Some(Duration::from_secs(60)));

        registry.release("c1").await.unwrap();
        assert_eq!(store.get(&keys::owner("c1")).await.unwrap(), None);
        assert_eq!(
            store.get(&keys::status("c1")).await.unwrap().as_deref(),
            Some(STATUS_OFFLINE)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_extends_ttl() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry("inst-a", &store);
        registry.acquire("c1").await.unwrap();

        // Well past the original 30s TTL
        for _ in 0..6 {
            tokio::time::sleep(Duration::from_secs(10)).await;
        }
        assert!(registry.is_locally_owned("c1"));
        assert!(store.get(&keys::owner("c1")).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_failure_fires_handler_once() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry("inst-a", &store);
        registry.acquire("c1").await.unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel();
        registry.on_ownership_lost(
            "c1",
            Box::new(move |connector_id| {
                let _ = tx.send(connector_id);
            }),
        );

        store.set(&keys::owner("c1"), "inst-b:9", Some(Duration::from_secs(30)));
        let lost = rx.await.unwrap();
        assert_eq!(lost, "c1");
        assert!(!registry.is_locally_owned("c1"));

        // Release after loss leaves the new owner alone
        registry.release("c1").await.unwrap();
        assert_eq!(
            store.get(&keys::owner("c1")).await.unwrap().as_deref(),
            Some("inst-b:9")
        );
    }

    #[tokio::test]
    async fn test_cleared_handler_not_invoked() {
        let registry = OwnershipRegistry::single_instance("solo");
        registry.acquire("c1").await.unwrap();
        registry.on_ownership_lost("c1", Box::new(|_| panic!("must not run")));
        registry.clear_ownership_lost("c1");
        registry.handle_lost("c1", 1);
        assert!(!registry.is_locally_owned("c1"));
    }
}
