//! Cross-instance command/reply transport
//!
//! Commands for a connector owned elsewhere are appended to the connector's
//! command log (`cmd:{connectorId}`), read by the owner through the `owner`
//! consumer group, and answered on the caller's reply log
//! (`reply:{instanceId}`). Entries are acknowledged only after the handler
//! succeeds, so a crashed owner leaves them pending for the auto-claim sweep
//! of whichever instance owns the connector next. A live owner retries its
//! own failed entries on the same sweep until they succeed, expire or are
//! dead-lettered.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::common::config::TransportConfig;
use crate::common::metrics::METRICS;
use crate::common::pending::PendingTable;
use crate::common::utils::{generate_correlation_id, timestamp_now_millis};
use crate::common::{Error, Result};
use crate::coordinator::ownership::OwnershipRegistry;
use crate::store::{keys, SharedStore, StreamEntry, COMMAND_GROUP};

pub const STATUS_OK: &str = "ok";
pub const STATUS_ERROR: &str = "error";

/// A command addressed to a connector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

impl Command {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }
}

/// Command as carried on a command log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCommand {
    pub correlation_id: String,
    pub reply_to: String,
    /// Epoch milliseconds
    pub deadline: u64,
    #[serde(flatten)]
    pub command: Command,
}

impl RemoteCommand {
    pub fn is_expired(&self, now_millis: u64) -> bool {
        self.deadline <= now_millis
    }
}

/// Executes commands read from a connector's command log.
///
/// `Ok` means the command was handed off and the entry may be acknowledged.
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    async fn handle(&self, connector_id: &str, command: RemoteCommand) -> Result<()>;
}

fn parse_command(entry: &StreamEntry) -> Result<RemoteCommand> {
    let data = entry
        .field("data")
        .ok_or_else(|| Error::MalformedEntry(format!("{} has no data field", entry.id)))?;
    serde_json::from_str(data)
        .map_err(|e| Error::MalformedEntry(format!("{}: {}", entry.id, e)))
}

fn parse_reply(entry: &StreamEntry) -> Result<(String, Result<Value>)> {
    let correlation_id = entry
        .field("correlationId")
        .ok_or_else(|| Error::MalformedEntry(format!("{} has no correlationId", entry.id)))?;
    let raw = entry.field("data").unwrap_or("null");
    let data = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    let outcome = match entry.field("status") {
        Some(STATUS_ERROR) => Err(Error::CommandFailed(data)),
        _ => Ok(data),
    };
    Ok((correlation_id.to_string(), outcome))
}

pub struct CommandTransport {
    instance_id: String,
    store: Arc<dyn SharedStore>,
    ownership: Arc<OwnershipRegistry>,
    config: TransportConfig,
    pending: PendingTable<Value>,
    processed: Mutex<HashMap<String, Instant>>,
    // Handler failures per correlation ID, with the command deadline (epoch ms)
    failures: Mutex<HashMap<String, (u32, u64)>>,
    reply_consumer: Mutex<Option<CancellationToken>>,
    command_consumers: Mutex<HashMap<String, CancellationToken>>,
    shutdown: CancellationToken,
}

impl CommandTransport {
    pub fn new(
        store: Arc<dyn SharedStore>,
        ownership: Arc<OwnershipRegistry>,
        config: TransportConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            instance_id: ownership.instance_id().to_string(),
            store,
            ownership,
            config,
            pending: PendingTable::new(),
            processed: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            reply_consumer: Mutex::new(None),
            command_consumers: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Route a command to the instance that owns `connector_id` and wait for
    /// its reply.
    pub async fn dispatch_remote(self: &Arc<Self>, connector_id: &str, command: Command) -> Result<Value> {
        if !self.ownership.is_online_in_cluster(connector_id).await? {
            return Err(Error::NotConnected(connector_id.to_string()));
        }
        self.start_reply_consumer();

        let timeout = self.config.command_timeout();
        let envelope = RemoteCommand {
            correlation_id: generate_correlation_id(),
            reply_to: self.instance_id.clone(),
            deadline: timestamp_now_millis() + timeout.as_millis() as u64,
            command,
        };
        let data = serde_json::to_string(&envelope)?;
        let deadline = envelope.deadline.to_string();

        let pending = self.pending.register(&envelope.correlation_id);
        if let Err(e) = self
            .store
            .append(
                &keys::command_log(connector_id),
                &[("data", data.as_str()), ("deadline", deadline.as_str())],
                self.config.stream_max_len,
            )
            .await
        {
            self.pending.cancel(&envelope.correlation_id);
            return Err(e);
        }

        METRICS.dispatch_remote.inc();
        tracing::debug!(
            connector_id = %connector_id,
            correlation_id = %envelope.correlation_id,
            kind = %envelope.command.kind,
            "Command published to owner"
        );
        self.pending.wait(pending, timeout).await
    }

    /// Append a reply to `reply_to`'s reply log
    pub async fn publish_reply(
        &self,
        correlation_id: &str,
        reply_to: &str,
        payload: &Value,
        is_error: bool,
    ) -> Result<()> {
        let data = serde_json::to_string(payload)?;
        let status = if is_error { STATUS_ERROR } else { STATUS_OK };
        self.store
            .append(
                &keys::reply_log(reply_to),
                &[
                    ("correlationId", correlation_id),
                    ("data", data.as_str()),
                    ("status", status),
                ],
                self.config.stream_max_len,
            )
            .await?;
        METRICS.replies_published.inc();
        tracing::debug!(
            correlation_id = %correlation_id,
            reply_to = %reply_to,
            status,
            "Reply published"
        );
        Ok(())
    }

    // === Reply consumer ===

    /// Start this instance's reply consumer. Later calls are no-ops.
    pub fn start_reply_consumer(self: &Arc<Self>) {
        let token = {
            let mut slot = self.reply_consumer.lock();
            if slot.is_some() || self.shutdown.is_cancelled() {
                return;
            }
            let token = self.shutdown.child_token();
            *slot = Some(token.clone());
            token
        };
        let transport = Arc::clone(self);
        tokio::spawn(async move { transport.run_reply_consumer(token).await });
    }

    async fn run_reply_consumer(&self, token: CancellationToken) {
        let stream = keys::reply_log(&self.instance_id);
        let group = keys::reply_group(&self.instance_id);
        let mut ensure_group = true;
        tracing::info!(instance_id = %self.instance_id, stream = %stream, "Reply consumer started");

        loop {
            let polled = tokio::select! {
                _ = token.cancelled() => break,
                polled = self.poll_replies(&stream, &group, ensure_group) => polled,
            };
            match polled {
                Ok(()) => ensure_group = false,
                Err(e) => {
                    tracing::warn!(stream = %stream, error = %e, "Reply consumer error");
                    ensure_group = true;
                    if !self.backoff(&token).await {
                        break;
                    }
                }
            }
        }
        self.store.release_stream(&stream).await;
        tracing::info!(instance_id = %self.instance_id, "Reply consumer stopped");
    }

    async fn poll_replies(&self, stream: &str, group: &str, ensure_group: bool) -> Result<()> {
        if ensure_group {
            self.store.ensure_group(stream, group).await?;
        }
        let entries = self
            .store
            .read_group(
                stream,
                group,
                &self.instance_id,
                self.config.read_batch_size,
                self.config.block(),
            )
            .await?;
        for entry in entries {
            match parse_reply(&entry) {
                Ok((correlation_id, outcome)) => {
                    if !self.pending.complete(&correlation_id, outcome) {
                        tracing::debug!(correlation_id = %correlation_id, "Dropping late reply");
                    }
                }
                Err(e) => {
                    METRICS.commands_malformed.inc();
                    tracing::warn!(entry_id = %entry.id, error = %e, "Dropping malformed reply");
                }
            }
            // The reply is already delivered; an unacked entry must not cost the rest of the batch
            if let Err(e) = self.store.ack(stream, group, &entry.id).await {
                tracing::warn!(stream = %stream, entry_id = %entry.id, error = %e, "Reply ack failed");
            }
        }
        Ok(())
    }

    // === Command consumers ===

    /// Start consuming `connector_id`'s command log. No-op if already running.
    pub fn start_command_consumer(self: &Arc<Self>, connector_id: &str, handler: Arc<dyn CommandHandler>) {
        let token = {
            let mut consumers = self.command_consumers.lock();
            if consumers.contains_key(connector_id) || self.shutdown.is_cancelled() {
                return;
            }
            let token = self.shutdown.child_token();
            consumers.insert(connector_id.to_string(), token.clone());
            token
        };
        let transport = Arc::clone(self);
        let connector_id = connector_id.to_string();
        tokio::spawn(async move {
            transport
                .run_command_consumer(connector_id, handler, token)
                .await
        });
    }

    pub fn stop_command_consumer(&self, connector_id: &str) {
        if let Some(token) = self.command_consumers.lock().remove(connector_id) {
            token.cancel();
            tracing::debug!(connector_id = %connector_id, "Stopping command consumer");
        }
    }

    pub fn is_consuming(&self, connector_id: &str) -> bool {
        self.command_consumers.lock().contains_key(connector_id)
    }

    async fn run_command_consumer(
        &self,
        connector_id: String,
        handler: Arc<dyn CommandHandler>,
        token: CancellationToken,
    ) {
        let stream = keys::command_log(&connector_id);
        let mut ensure_group = true;
        let mut next_claim = Instant::now();
        tracing::info!(connector_id = %connector_id, "Command consumer started");

        loop {
            if token.is_cancelled() {
                break;
            }
            if ensure_group {
                if let Err(e) = self.store.ensure_group(&stream, COMMAND_GROUP).await {
                    tracing::warn!(connector_id = %connector_id, error = %e, "Failed to join command group");
                    if !self.backoff(&token).await {
                        break;
                    }
                    continue;
                }
                ensure_group = false;
            }

            if Instant::now() >= next_claim {
                if let Err(e) = self
                    .retry_own_pending(&connector_id, &stream, handler.as_ref())
                    .await
                {
                    tracing::warn!(connector_id = %connector_id, error = %e, "Retry of failed commands failed");
                }
                if let Err(e) = self
                    .claim_abandoned(&connector_id, &stream, handler.as_ref())
                    .await
                {
                    tracing::warn!(connector_id = %connector_id, error = %e, "Auto-claim sweep failed");
                }
                next_claim = Instant::now() + self.config.claim_interval();
            }

            // Only the read is raced against cancellation; entries already
            // delivered are always processed to completion
            let read = tokio::select! {
                _ = token.cancelled() => break,
                read = self.store.read_group(
                    &stream,
                    COMMAND_GROUP,
                    &self.instance_id,
                    self.config.read_batch_size,
                    self.config.block(),
                ) => read,
            };
            match read {
                Ok(entries) => {
                    for entry in entries {
                        self.process_command(&connector_id, &stream, entry, handler.as_ref())
                            .await;
                    }
                }
                Err(e) => {
                    tracing::warn!(connector_id = %connector_id, error = %e, "Command consumer error");
                    ensure_group = true;
                    if !self.backoff(&token).await {
                        break;
                    }
                }
            }
        }
        self.store.release_stream(&stream).await;
        tracing::info!(connector_id = %connector_id, "Command consumer stopped");
    }

    /// Run entries this instance read but never acknowledged (handler
    /// failures, or a previous run under the same instance ID) through the
    /// handler again. Repeated failures end in the dead-letter path.
    async fn retry_own_pending(
        &self,
        connector_id: &str,
        stream: &str,
        handler: &dyn CommandHandler,
    ) -> Result<usize> {
        let entries = self
            .store
            .read_pending(stream, COMMAND_GROUP, &self.instance_id, self.config.claim_batch_size)
            .await?;
        let retried = entries.len();
        for entry in entries {
            self.process_command(connector_id, stream, entry, handler).await;
        }
        if retried > 0 {
            tracing::debug!(connector_id = %connector_id, retried, "Retried unacknowledged commands");
        }
        Ok(retried)
    }

    /// Claim entries abandoned by dead consumers of the group and process them
    async fn claim_abandoned(
        &self,
        connector_id: &str,
        stream: &str,
        handler: &dyn CommandHandler,
    ) -> Result<usize> {
        let mut start = "0-0".to_string();
        let mut claimed = 0;
        for _ in 0..self.config.claim_max_iterations {
            let batch = self
                .store
                .auto_claim(
                    stream,
                    COMMAND_GROUP,
                    &self.instance_id,
                    self.config.claim_min_idle(),
                    &start,
                    self.config.claim_batch_size,
                )
                .await?;
            for entry in batch.entries.iter().cloned() {
                claimed += 1;
                METRICS.commands_claimed.inc();
                self.process_command(connector_id, stream, entry, handler).await;
            }
            if batch.is_exhausted() {
                break;
            }
            start = batch.next_start;
        }
        if claimed > 0 {
            tracing::info!(connector_id = %connector_id, claimed, "Recovered abandoned commands");
        }
        Ok(claimed)
    }

    async fn process_command(
        &self,
        connector_id: &str,
        stream: &str,
        entry: StreamEntry,
        handler: &dyn CommandHandler,
    ) {
        let command = match parse_command(&entry) {
            Ok(command) => command,
            Err(e) => {
                METRICS.commands_malformed.inc();
                tracing::warn!(connector_id = %connector_id, entry_id = %entry.id, error = %e, "Dropping malformed command");
                self.ack(stream, &entry.id).await;
                return;
            }
        };
        let correlation_id = command.correlation_id.clone();

        if command.is_expired(timestamp_now_millis()) {
            METRICS.commands_expired.inc();
            tracing::warn!(connector_id = %connector_id, correlation_id = %correlation_id, "Command past its deadline");
            self.failures.lock().remove(&correlation_id);
            self.reply_error(&command, "command deadline exceeded").await;
            self.ack(stream, &entry.id).await;
            return;
        }

        if self.is_processed(&correlation_id) {
            METRICS.commands_deduplicated.inc();
            tracing::debug!(connector_id = %connector_id, correlation_id = %correlation_id, "Skipping replayed command");
            self.failures.lock().remove(&correlation_id);
            self.ack(stream, &entry.id).await;
            return;
        }

        match handler.handle(connector_id, command.clone()).await {
            Ok(()) => {
                self.mark_processed(&correlation_id);
                self.failures.lock().remove(&correlation_id);
                METRICS.commands_processed.inc();
                self.ack(stream, &entry.id).await;
            }
            Err(e) => {
                let attempts = self.record_failure(&correlation_id, command.deadline);
                if attempts < self.config.max_handler_attempts {
                    tracing::warn!(
                        connector_id = %connector_id,
                        correlation_id = %correlation_id,
                        attempts,
                        error = %e,
                        "Command handler failed, leaving entry pending"
                    );
                    return;
                }

                METRICS.commands_dead_lettered.inc();
                tracing::error!(
                    connector_id = %connector_id,
                    correlation_id = %correlation_id,
                    attempts,
                    error = %e,
                    "Giving up on command"
                );
                self.failures.lock().remove(&correlation_id);
                self.mark_processed(&correlation_id);
                self.reply_error(
                    &command,
                    &format!("handler failed after {} attempts: {}", attempts, e),
                )
                .await;
                self.ack(stream, &entry.id).await;
            }
        }
    }

    async fn reply_error(&self, command: &RemoteCommand, message: &str) {
        let payload = serde_json::json!({ "error": message });
        if let Err(e) = self
            .publish_reply(&command.correlation_id, &command.reply_to, &payload, true)
            .await
        {
            tracing::warn!(correlation_id = %command.correlation_id, error = %e, "Failed to publish error reply");
        }
    }

    async fn ack(&self, stream: &str, id: &str) {
        if let Err(e) = self.store.ack(stream, COMMAND_GROUP, id).await {
            tracing::warn!(stream = %stream, entry_id = %id, error = %e, "Ack failed");
        }
    }

    /// Count a handler failure. Counters of commands past their deadline are
    /// pruned here, since an expired command is never handed to the handler again.
    fn record_failure(&self, correlation_id: &str, deadline: u64) -> u32 {
        let mut failures = self.failures.lock();
        Self::prune_failures(&mut failures, timestamp_now_millis());
        let (count, _) = failures
            .entry(correlation_id.to_string())
            .or_insert((0, deadline));
        *count += 1;
        *count
    }

    fn prune_failures(failures: &mut HashMap<String, (u32, u64)>, now_millis: u64) {
        failures.retain(|_, (_, deadline)| *deadline > now_millis);
    }

    fn is_processed(&self, correlation_id: &str) -> bool {
        let now = Instant::now();
        let mut processed = self.processed.lock();
        match processed.get(correlation_id) {
            Some(expires_at) if *expires_at > now => true,
            Some(_) => {
                processed.remove(correlation_id);
                false
            }
            None => false,
        }
    }

    fn mark_processed(&self, correlation_id: &str) {
        let now = Instant::now();
        let mut processed = self.processed.lock();
        processed.retain(|_, expires_at| *expires_at > now);
        processed.insert(
            correlation_id.to_string(),
            now + self.config.processed_ttl(),
        );
    }

    async fn backoff(&self, token: &CancellationToken) -> bool {
        tokio::select! {
            _ = token.cancelled() => false,
            _ = tokio::time::sleep(self.config.error_backoff()) => true,
        }
    }

    /// Number of remote dispatches waiting for a reply
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Stop every consumer loop and reject outstanding dispatches
    pub fn stop(&self) {
        self.shutdown.cancel();
        self.reply_consumer.lock().take();
        self.command_consumers.lock().clear();
        self.pending.reject_all("transport stopped");
        tracing::info!(instance_id = %self.instance_id, "Command transport stopped");
    }
}
