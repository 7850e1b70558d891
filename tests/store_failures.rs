//! Behavior while the shared store is failing

use async_trait::async_trait;
use connector_gateway::common::{
    hash_token, Error, GatewayConfig, OwnershipConfig, Result, TokenTableVerifier, TransportConfig,
};
use connector_gateway::coordinator::{
    Command, CommandHandler, CommandTransport, Connection, ConnectorInfo, Coordinator,
    OwnershipRegistry, RemoteCommand,
};
use connector_gateway::store::{
    keys, AutoClaim, CompanionWrite, MemoryStore, SharedStore, StreamEntry,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Wraps a [`MemoryStore`] and fails calls on demand
struct FlakyStore {
    inner: Arc<MemoryStore>,
    down: AtomicBool,
    failed_calls: AtomicUsize,
    // Acks on reply logs still to be refused
    reply_ack_failures: AtomicUsize,
    released: Mutex<Vec<String>>,
}

impl FlakyStore {
    fn new(inner: &Arc<MemoryStore>) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::clone(inner),
            down: AtomicBool::new(false),
            failed_calls: AtomicUsize::new(0),
            reply_ack_failures: AtomicUsize::new(0),
            released: Mutex::new(Vec::new()),
        })
    }

    fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.down.load(Ordering::SeqCst) {
            self.failed_calls.fetch_add(1, Ordering::SeqCst);
            return Err(Error::TransportUnavailable("connection refused".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl SharedStore for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        self.check()?;
        self.inner.set_if_absent(key, value, ttl).await
    }

    async fn compare_and_swap(&self, key: &str, expected: &str, value: &str, ttl: Duration) -> Result<bool> {
        self.check()?;
        self.inner.compare_and_swap(key, expected, value, ttl).await
    }

    async fn compare_and_refresh(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
        companion: Option<&CompanionWrite>,
    ) -> Result<bool> {
        self.check()?;
        self.inner.compare_and_refresh(key, expected, ttl, companion).await
    }

    async fn delete_if_prefix(&self, key: &str, prefix: &str, companion: Option<&CompanionWrite>) -> Result<bool> {
        self.check()?;
        self.inner.delete_if_prefix(key, prefix, companion).await
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        self.check()?;
        self.inner.incr(key).await
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()> {
        self.check()?;
        self.inner.ensure_group(stream, group).await
    }

    async fn append(&self, stream: &str, fields: &[(&str, &str)], max_len: usize) -> Result<String> {
        self.check()?;
        self.inner.append(stream, fields, max_len).await
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>> {
        self.check()?;
        self.inner.read_group(stream, group, consumer, count, block).await
    }

    async fn read_pending(&self, stream: &str, group: &str, consumer: &str, count: usize) -> Result<Vec<StreamEntry>> {
        self.check()?;
        self.inner.read_pending(stream, group, consumer, count).await
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<()> {
        self.check()?;
        if stream.starts_with("reply:")
            && self
                .reply_ack_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(Error::TransportUnavailable("ack timed out".into()));
        }
        self.inner.ack(stream, group, id).await
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
        self.check()?;
        self.inner
            .auto_claim(stream, group, consumer, min_idle, start, count)
            .await
    }

    async fn release_stream(&self, stream: &str) {
        self.released.lock().push(stream.to_string());
    }
}

struct ChannelHandler {
    tx: mpsc::UnboundedSender<RemoteCommand>,
}

#[async_trait]
impl CommandHandler for ChannelHandler {
    async fn handle(&self, _connector_id: &str, command: RemoteCommand) -> Result<()> {
        self.tx
            .send(command)
            .map_err(|_| Error::HandlerFailure("receiver gone".into()))
    }
}

fn node(instance: &str, store: Arc<dyn SharedStore>) -> (Arc<OwnershipRegistry>, Arc<CommandTransport>) {
    let ownership = OwnershipRegistry::new(instance, Some(store.clone()), OwnershipConfig::default());
    let transport = CommandTransport::new(store, ownership.clone(), TransportConfig::default());
    (ownership, transport)
}

fn coordinator(instance: &str, store: Arc<dyn SharedStore>) -> Coordinator {
    let verifier = TokenTableVerifier::default();
    verifier.insert_token("c1", "secret");
    let config = GatewayConfig {
        instance_id: instance.to_string(),
        ..GatewayConfig::default()
    };
    let coordinator = Coordinator::new(&config, Some(store), Arc::new(verifier));
    coordinator.start();
    coordinator
}

#[tokio::test]
async fn test_registration_fails_fast_while_store_down() {
    let memory = Arc::new(MemoryStore::new());
    let flaky = FlakyStore::new(&memory);
    let gateway = coordinator("inst-a", flaky.clone());

    flaky.set_down(true);
    let (conn, mut rx) = Connection::new(hash_token("secret"), 0);
    let err = gateway
        .register_connection(ConnectorInfo::new("c1"), conn)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TransportUnavailable(_)));
    assert!(!gateway.is_connected_locally("c1"));
    // Not a conflict: no close code is queued for the socket
    assert!(rx.try_recv().is_err());

    flaky.set_down(false);
    assert_eq!(memory.get(&keys::owner("c1")).await.unwrap(), None);
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_remote_dispatch_fails_fast_while_store_down() {
    let memory = Arc::new(MemoryStore::new());
    let flaky = FlakyStore::new(&memory);
    let caller = coordinator("inst-a", flaky.clone());
    let owner = coordinator("inst-b", memory.clone());

    let (conn, _rx) = Connection::new(hash_token("secret"), 0);
    assert!(owner
        .register_connection(ConnectorInfo::new("c1"), conn)
        .await
        .unwrap());

    flaky.set_down(true);
    let err = caller
        .dispatch_command("c1", Command::new("query", Value::Null))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TransportUnavailable(_)));
    assert_eq!(caller.transport().unwrap().pending_count(), 0);
    assert!(memory.entries(&keys::command_log("c1")).is_empty());

    flaky.set_down(false);
    caller.shutdown().await;
    owner.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_consumers_recover_after_outage() {
    let memory = Arc::new(MemoryStore::new());
    let flaky = FlakyStore::new(&memory);
    let (_, caller) = node("inst-a", flaky.clone());
    let (owner_registry, owner) = node("inst-b", flaky.clone());
    assert!(owner_registry.acquire("c1").await.unwrap().acquired);

    let (tx, mut commands) = mpsc::unbounded_channel();
    owner.start_command_consumer("c1", Arc::new(ChannelHandler { tx }));
    caller.start_reply_consumer();
    tokio::time::sleep(Duration::from_millis(10)).await;

    flaky.set_down(true);
    tokio::time::sleep(Duration::from_secs(12)).await;
    assert!(flaky.failed_calls.load(Ordering::SeqCst) > 0);
    flaky.set_down(false);

    let dispatch = {
        let caller = caller.clone();
        tokio::spawn(async move { caller.dispatch_remote("c1", Command::new("query", json!(null))).await })
    };
    let command = commands.recv().await.unwrap();
    owner
        .publish_reply(&command.correlation_id, "inst-a", &json!({"rows": 2}), false)
        .await
        .unwrap();
    assert_eq!(dispatch.await.unwrap().unwrap(), json!({"rows": 2}));

    caller.stop();
    owner.stop();
}

#[tokio::test(start_paused = true)]
async fn test_failed_reply_ack_keeps_rest_of_batch() {
    let memory = Arc::new(MemoryStore::new());
    let flaky = FlakyStore::new(&memory);
    flaky.reply_ack_failures.store(1, Ordering::SeqCst);
    let (_, caller) = node("inst-a", flaky.clone());
    let (owner_registry, owner) = node("inst-b", memory.clone());
    owner_registry.acquire("c1").await.unwrap();

    let (tx, mut commands) = mpsc::unbounded_channel();
    owner.start_command_consumer("c1", Arc::new(ChannelHandler { tx }));

    let dispatches: Vec<_> = (0..2)
        .map(|i| {
            let caller = caller.clone();
            tokio::spawn(async move { caller.dispatch_remote("c1", Command::new("query", json!(i))).await })
        })
        .collect();
    let first = commands.recv().await.unwrap();
    let second = commands.recv().await.unwrap();

    // Both replies land before the caller's reply consumer wakes up
    for command in [&first, &second] {
        owner
            .publish_reply(&command.correlation_id, "inst-a", &command.command.payload, false)
            .await
            .unwrap();
    }

    let mut replies = Vec::new();
    for dispatch in dispatches {
        replies.push(dispatch.await.unwrap().unwrap());
    }
    replies.sort_by_key(|v| v.as_i64());
    assert_eq!(replies, vec![json!(0), json!(1)]);
    assert_eq!(flaky.reply_ack_failures.load(Ordering::SeqCst), 0);
    assert_eq!(caller.pending_count(), 0);

    caller.stop();
    owner.stop();
}

#[tokio::test]
async fn test_stopped_consumer_releases_its_stream() {
    let memory = Arc::new(MemoryStore::new());
    let flaky = FlakyStore::new(&memory);
    let (_, owner) = node("inst-b", flaky.clone());
    let (tx, _commands) = mpsc::unbounded_channel();

    owner.start_command_consumer("c1", Arc::new(ChannelHandler { tx }));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(flaky.released.lock().is_empty());

    owner.stop_command_consumer("c1");
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(*flaky.released.lock(), vec![keys::command_log("c1")]);

    owner.stop();
}
