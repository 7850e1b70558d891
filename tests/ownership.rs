//! Ownership registry behaviour across instances sharing one store

use connector_gateway::common::OwnershipConfig;
use connector_gateway::coordinator::OwnershipRegistry;
use connector_gateway::store::{keys, MemoryStore, SharedStore};
use std::sync::Arc;
use std::time::Duration;

fn registry(instance: &str, store: &Arc<MemoryStore>) -> Arc<OwnershipRegistry> {
    let shared: Arc<dyn SharedStore> = store.clone();
    OwnershipRegistry::new(instance, Some(shared), OwnershipConfig::default())
}

#[tokio::test(start_paused = true)]
async fn test_fences_and_conflict() {
    let store = Arc::new(MemoryStore::new());
    store.set(&keys::owner("c3"), "other-instance:1", Some(Duration::from_secs(30)));
    let registry = registry("inst-A", &store);

    let first = registry.acquire("c1").await.unwrap();
    assert!(first.acquired);
    assert_eq!(first.fence, 1);
    assert_eq!(
        store.get(&keys::owner("c1")).await.unwrap().as_deref(),
        Some("inst-A:1")
    );
    assert_eq!(store.ttl(&keys::owner("c1")), Some(Duration::from_secs(30)));

    let second = registry.acquire("c2").await.unwrap();
    assert!(second.acquired);
    assert_eq!(second.fence, 2);

    let third = registry.acquire("c3").await.unwrap();
    assert!(!third.acquired);
    assert_eq!(third.fence, 0);
    assert!(!registry.is_locally_owned("c3"));
}

#[tokio::test]
async fn test_mutual_exclusion() {
    let store = Arc::new(MemoryStore::new());
    let a = registry("inst-a", &store);
    let b = registry("inst-b", &store);

    let (from_a, from_b) = tokio::join!(a.acquire("c1"), b.acquire("c1"));
    let from_a = from_a.unwrap();
    let from_b = from_b.unwrap();
    assert!(from_a.acquired ^ from_b.acquired);

    let winner = if from_a.acquired { &a } else { &b };
    let loser = if from_a.acquired { &b } else { &a };
    assert!(winner.is_locally_owned("c1"));
    assert!(!loser.is_locally_owned("c1"));

    // The loser still sees the connector as reachable
    assert!(loser.is_online_in_cluster("c1").await.unwrap());
}

#[tokio::test]
async fn test_fence_monotonic_per_instance() {
    let store = Arc::new(MemoryStore::new());
    let registry = registry("inst-a", &store);

    let mut last = 0;
    for connector in ["c1", "c2", "c1", "c3", "c2"] {
        let acquisition = registry.acquire(connector).await.unwrap();
        assert!(acquisition.acquired);
        assert!(acquisition.fence > last);
        last = acquisition.fence;
    }
}

#[tokio::test]
async fn test_stale_fence_rejected_after_steal() {
    let store = Arc::new(MemoryStore::new());
    let a = registry("inst-a", &store);
    let b = registry("inst-b", &store);

    let held = a.acquire("c1").await.unwrap();
    assert!(a.is_ownership_valid("c1", held.fence).await);

    // Missed refreshes: the key expires and another instance takes over
    store.expire(&keys::owner("c1"));
    let stolen = b.acquire("c1").await.unwrap();
    assert!(stolen.acquired);

    assert!(!a.is_ownership_valid("c1", held.fence).await);
    assert!(b.is_ownership_valid("c1", stolen.fence).await);
}

#[tokio::test]
async fn test_release_after_steal_is_noop() {
    let store = Arc::new(MemoryStore::new());
    let a = registry("inst-a", &store);
    let b = registry("inst-b", &store);

    a.acquire("c1").await.unwrap();
    store.expire(&keys::owner("c1"));
    let stolen = b.acquire("c1").await.unwrap();

    a.release("c1").await.unwrap();
    assert_eq!(
        store.get(&keys::owner("c1")).await.unwrap(),
        Some(format!("inst-b:{}", stolen.fence))
    );
    assert_eq!(
        store.get(&keys::status("c1")).await.unwrap().as_deref(),
        Some("online")
    );
}

#[tokio::test(start_paused = true)]
async fn test_crashed_owner_expires() {
    let store = Arc::new(MemoryStore::new());
    let b = registry("inst-b", &store);

    // A crashed owner leaves its key behind without refreshing it
    store.set(&keys::owner("c1"), "inst-a:4", Some(Duration::from_secs(30)));
    assert!(!b.acquire("c1").await.unwrap().acquired);

    tokio::time::advance(Duration::from_secs(31)).await;
    assert!(b.acquire("c1").await.unwrap().acquired);
}

#[tokio::test]
async fn test_release_all() {
    let store = Arc::new(MemoryStore::new());
    let registry = registry("inst-a", &store);
    registry.acquire("c1").await.unwrap();
    registry.acquire("c2").await.unwrap();

    let mut owned = registry.owned_connectors();
    owned.sort();
    assert_eq!(owned, vec!["c1".to_string(), "c2".to_string()]);

    registry.release_all().await;
    assert!(registry.owned_connectors().is_empty());
    assert_eq!(store.get(&keys::owner("c1")).await.unwrap(), None);
    assert_eq!(store.get(&keys::owner("c2")).await.unwrap(), None);
}
