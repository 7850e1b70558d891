//! Connector connection registry and command dispatch
//!
//! A connector's sockets are grouped per connector ID. A group only exists
//! while this instance owns the connector: it is created together with a
//! successful ownership acquisition and torn down (releasing ownership) when
//! its last socket goes away or when ownership is lost.
//!
//! ```text
//! unowned -> acquiring -> owned(0 sockets) -> owned(>=1 socket, consumer running)
//!                              ^                          |
//!                              +------ owned(0 sockets) <-+ -> released
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crate::common::auth::CredentialVerifier;
use crate::common::config::{CoordinatorConfig, GatewayConfig};
use crate::common::metrics::METRICS;
use crate::common::pending::PendingTable;
use crate::common::utils::{generate_correlation_id, hash_token, timestamp_now_millis};
use crate::common::{Error, Result};
use crate::coordinator::connection::{
    CloseCode, Connection, ConnectorInfo, InboundFrame, OutboundFrame,
};
use crate::coordinator::ownership::OwnershipRegistry;
use crate::coordinator::transport::{Command, CommandHandler, CommandTransport, RemoteCommand};
use crate::store::{keys, SharedStore};

struct ConnectorGroup {
    info: ConnectorInfo,
    fence: u64,
    connections: Vec<Arc<Connection>>,
}

/// Where a connector is currently served from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Location {
    Local,
    Remote,
    Offline,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorStatus {
    pub connector_id: String,
    pub location: Location,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fence: Option<u64>,
    pub connections: usize,
    pub ready_connections: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<ConnectorInfo>,
}

struct Inner {
    instance_id: String,
    config: CoordinatorConfig,
    store: Option<Arc<dyn SharedStore>>,
    ownership: Arc<OwnershipRegistry>,
    transport: Option<Arc<CommandTransport>>,
    verifier: Arc<dyn CredentialVerifier>,
    groups: Mutex<HashMap<String, ConnectorGroup>>,
    // Serializes register/unregister so acquisition and release never interleave
    membership: tokio::sync::Mutex<()>,
    pending: PendingTable<Value>,
    reply_routes: Mutex<HashMap<String, String>>,
    // Token versions when running without a shared store
    token_versions: Mutex<HashMap<String, i64>>,
}

#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    /// Build a coordinator. Without a store it runs single-instance: only
    /// local dispatch, ownership always granted.
    pub fn new(
        config: &GatewayConfig,
        store: Option<Arc<dyn SharedStore>>,
        verifier: Arc<dyn CredentialVerifier>,
    ) -> Self {
        let ownership = OwnershipRegistry::new(
            config.instance_id.clone(),
            store.clone(),
            config.ownership.clone(),
        );
        let transport = store.as_ref().map(|store| {
            CommandTransport::new(
                Arc::clone(store),
                Arc::clone(&ownership),
                config.transport.clone(),
            )
        });

        Self {
            inner: Arc::new(Inner {
                instance_id: config.instance_id.clone(),
                config: config.coordinator.clone(),
                store,
                ownership,
                transport,
                verifier,
                groups: Mutex::new(HashMap::new()),
                membership: tokio::sync::Mutex::new(()),
                pending: PendingTable::new(),
                reply_routes: Mutex::new(HashMap::new()),
                token_versions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Start background consumers
    pub fn start(&self) {
        if let Some(transport) = &self.inner.transport {
            transport.start_reply_consumer();
        }
        tracing::info!(
            instance_id = %self.inner.instance_id,
            distributed = self.inner.transport.is_some(),
            "Coordinator started"
        );
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    pub fn ownership(&self) -> &Arc<OwnershipRegistry> {
        &self.inner.ownership
    }

    pub fn transport(&self) -> Option<&Arc<CommandTransport>> {
        self.inner.transport.as_ref()
    }

    // === Credentials ===

    /// Check a presented token hash against the verifier
    pub async fn verify_token(&self, connector_id: &str, token_hash: &str) -> Result<bool> {
        self.inner.verifier.verify(connector_id, token_hash).await
    }

    /// Current credential epoch of a connector
    pub async fn token_version(&self, connector_id: &str) -> Result<i64> {
        match &self.inner.store {
            Some(store) => {
                let raw = store.get(&keys::token_version(connector_id)).await?;
                Ok(raw.and_then(|v| v.parse().ok()).unwrap_or(0))
            }
            None => Ok(self
                .inner
                .token_versions
                .lock()
                .get(connector_id)
                .copied()
                .unwrap_or(0)),
        }
    }

    /// Bump the credential epoch. Live sockets are dropped at their next heartbeat.
    pub async fn invalidate_credentials(&self, connector_id: &str) -> Result<i64> {
        let version = match &self.inner.store {
            Some(store) => store.incr(&keys::token_version(connector_id)).await?,
            None => {
                let mut versions = self.inner.token_versions.lock();
                let version = versions.entry(connector_id.to_string()).or_insert(0);
                *version += 1;
                *version
            }
        };
        tracing::info!(connector_id = %connector_id, version, "Connector credentials invalidated");
        Ok(version)
    }

    /// Check a presented token and capture the credential epoch it is accepted under
    pub async fn authenticate(&self, connector_id: &str, token: Option<&str>) -> Result<(String, i64)> {
        let token = token.ok_or_else(|| {
            Error::InvalidCredentials(format!("{} presented no token", connector_id))
        })?;
        let token_hash = hash_token(token);
        if !self.verify_token(connector_id, &token_hash).await? {
            return Err(Error::InvalidCredentials(format!(
                "{} presented an unknown token",
                connector_id
            )));
        }
        let version = self.token_version(connector_id).await?;
        Ok((token_hash, version))
    }

    async fn credentials_valid(&self, connector_id: &str, conn: &Connection) -> Result<bool> {
        if !self.verify_token(connector_id, conn.token_hash()).await? {
            return Ok(false);
        }
        Ok(self.token_version(connector_id).await? == conn.token_version())
    }

    // === Membership ===

    /// Attach an authenticated socket. Returns false (after closing the
    /// socket) when another instance owns the connector.
    pub async fn register_connection(&self, info: ConnectorInfo, conn: Arc<Connection>) -> Result<bool> {
        match self.attach(info, &conn).await {
            Ok(()) => Ok(true),
            Err(Error::OwnershipConflict(connector_id)) => {
                tracing::info!(connector_id = %connector_id, "Rejecting connection, connector owned elsewhere");
                conn.close(CloseCode::OwnershipConflict);
                Ok(false)
            }
            Err(Error::OwnershipLost(connector_id)) => {
                tracing::info!(connector_id = %connector_id, "Ownership lost during registration");
                conn.close(CloseCode::OwnershipLost);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn attach(&self, info: ConnectorInfo, conn: &Arc<Connection>) -> Result<()> {
        let _membership = self.inner.membership.lock().await;
        let connector_id = info.connector_id.clone();
        let inner = &self.inner;

        let mut current = inner.groups.lock().get(&connector_id).map(|g| g.fence);
        if let Some(fence) = current {
            if !inner.ownership.is_ownership_valid(&connector_id, fence).await {
                tracing::warn!(connector_id = %connector_id, fence, "Dropping stale connector group");
                self.drop_group(&connector_id, fence, CloseCode::OwnershipLost);
                current = None;
            }
        }

        let fence = match current {
            Some(fence) => fence,
            None => {
                let acquisition = inner.ownership.acquire(&connector_id).await?;
                if !acquisition.acquired {
                    return Err(Error::OwnershipConflict(connector_id));
                }

                inner.groups.lock().insert(
                    connector_id.clone(),
                    ConnectorGroup {
                        info,
                        fence: acquisition.fence,
                        connections: Vec::new(),
                    },
                );
                self.watch_ownership(&connector_id, acquisition.fence);
                acquisition.fence
            }
        };

        let connections = {
            let mut groups = inner.groups.lock();
            match groups.get_mut(&connector_id) {
                Some(group) => {
                    group.connections.push(Arc::clone(conn));
                    group.connections.len()
                }
                // Lost between acquisition and here
                None => return Err(Error::OwnershipLost(connector_id)),
            }
        };
        METRICS.active_connections.inc();

        if let Some(transport) = &inner.transport {
            let handler = Arc::new(ForwardingHandler {
                inner: Arc::downgrade(inner),
            });
            transport.start_command_consumer(&connector_id, handler);
        }

        tracing::info!(
            connector_id = %connector_id,
            connection_id = conn.id(),
            fence,
            connections,
            "Connector connection registered"
        );
        Ok(())
    }

    /// Detach one socket, or every socket when `connection_id` is `None`.
    /// Ownership is released only once the group is empty.
    pub async fn unregister_connection(&self, connector_id: &str, connection_id: Option<u64>) -> Result<()> {
        let _membership = self.inner.membership.lock().await;

        let emptied = {
            let mut groups = self.inner.groups.lock();
            let Some(group) = groups.get_mut(connector_id) else {
                return Ok(());
            };
            let before = group.connections.len();
            match connection_id {
                Some(id) => group.connections.retain(|c| c.id() != id),
                None => group.connections.clear(),
            }
            for _ in group.connections.len()..before {
                METRICS.active_connections.dec();
            }
            if group.connections.is_empty() {
                groups.remove(connector_id);
                true
            } else {
                false
            }
        };

        if !emptied {
            return Ok(());
        }

        if let Some(transport) = &self.inner.transport {
            transport.stop_command_consumer(connector_id);
        }
        self.inner.ownership.clear_ownership_lost(connector_id);
        self.inner.ownership.release(connector_id).await?;
        tracing::info!(connector_id = %connector_id, "Connector offline");
        Ok(())
    }

    fn watch_ownership(&self, connector_id: &str, fence: u64) {
        let inner = Arc::downgrade(&self.inner);
        self.inner.ownership.on_ownership_lost(
            connector_id,
            Box::new(move |connector_id| {
                if let Some(inner) = inner.upgrade() {
                    Coordinator { inner }.drop_group(&connector_id, fence, CloseCode::OwnershipLost);
                }
            }),
        );
    }

    /// Remove the group if it still carries `fence`, closing its sockets
    fn drop_group(&self, connector_id: &str, fence: u64, code: CloseCode) {
        let group = {
            let mut groups = self.inner.groups.lock();
            match groups.get(connector_id) {
                Some(group) if group.fence == fence => groups.remove(connector_id),
                _ => None,
            }
        };
        let Some(group) = group else {
            return;
        };

        if let Some(transport) = &self.inner.transport {
            transport.stop_command_consumer(connector_id);
        }
        for conn in &group.connections {
            conn.close(code);
            METRICS.active_connections.dec();
        }
        tracing::warn!(
            connector_id = %connector_id,
            fence,
            closed = group.connections.len(),
            close_code = code.code(),
            "Connector group torn down"
        );
    }

    fn connection(&self, connector_id: &str, connection_id: u64) -> Option<Arc<Connection>> {
        self.inner
            .groups
            .lock()
            .get(connector_id)?
            .connections
            .iter()
            .find(|c| c.id() == connection_id)
            .cloned()
    }

    /// Most recently connected ready socket
    fn select_connection(&self, connector_id: &str) -> Option<Arc<Connection>> {
        self.inner
            .groups
            .lock()
            .get(connector_id)?
            .connections
            .iter()
            .filter(|c| c.is_ready() && c.is_open())
            .max_by_key(|c| (c.connected_at(), c.id()))
            .cloned()
    }

    fn local_fence(&self, connector_id: &str) -> Option<u64> {
        self.inner.groups.lock().get(connector_id).map(|g| g.fence)
    }

    pub fn is_connected_locally(&self, connector_id: &str) -> bool {
        self.inner.groups.lock().contains_key(connector_id)
    }

    pub fn connection_count(&self, connector_id: &str) -> usize {
        self.inner
            .groups
            .lock()
            .get(connector_id)
            .map_or(0, |g| g.connections.len())
    }

    pub fn local_connectors(&self) -> Vec<String> {
        self.inner.groups.lock().keys().cloned().collect()
    }

    // === Dispatch ===

    /// Send a command to a connector wherever it is attached and wait for the reply
    pub async fn dispatch_command(&self, connector_id: &str, command: Command) -> Result<Value> {
        let started = Instant::now();
        let outcome = if self.is_connected_locally(connector_id) {
            METRICS.dispatch_local.inc();
            self.dispatch_local(connector_id, command).await
        } else if let Some(transport) = &self.inner.transport {
            transport.dispatch_remote(connector_id, command).await
        } else {
            Err(Error::NotConnected(connector_id.to_string()))
        };
        METRICS.record_dispatch(started.elapsed(), &outcome);
        outcome
    }

    async fn dispatch_local(&self, connector_id: &str, command: Command) -> Result<Value> {
        let fence = self
            .local_fence(connector_id)
            .ok_or_else(|| Error::NotConnected(connector_id.to_string()))?;
        if !self.inner.ownership.is_ownership_valid(connector_id, fence).await {
            return Err(Error::OwnershipLost(connector_id.to_string()));
        }
        let conn = self
            .select_connection(connector_id)
            .ok_or_else(|| Error::NotConnected(connector_id.to_string()))?;

        let correlation_id = generate_correlation_id();
        let pending = self.inner.pending.register(&correlation_id);
        if let Err(e) = conn.send(&OutboundFrame::command(&correlation_id, None, &command)) {
            self.inner.pending.cancel(&correlation_id);
            return Err(e);
        }
        tracing::debug!(
            connector_id = %connector_id,
            correlation_id = %correlation_id,
            connection_id = conn.id(),
            kind = %command.kind,
            "Command sent to local connector"
        );
        self.inner
            .pending
            .wait(pending, self.inner.config.local_timeout())
            .await
    }

    /// Forward a command read from the connector's command log
    async fn forward_remote(&self, connector_id: &str, command: RemoteCommand) -> Result<()> {
        let fence = self
            .local_fence(connector_id)
            .ok_or_else(|| Error::HandlerFailure(format!("{} has no local group", connector_id)))?;
        if !self.inner.ownership.is_ownership_valid(connector_id, fence).await {
            return Err(Error::OwnershipLost(connector_id.to_string()));
        }
        let conn = self.select_connection(connector_id).ok_or_else(|| {
            Error::HandlerFailure(format!("{} has no ready connection", connector_id))
        })?;

        self.record_reply_route(&command.correlation_id, &command.reply_to, command.deadline);
        conn.send(&OutboundFrame::command(
            &command.correlation_id,
            Some(&command.reply_to),
            &command.command,
        ))
        .map_err(|e| Error::HandlerFailure(e.to_string()))?;

        tracing::debug!(
            connector_id = %connector_id,
            correlation_id = %command.correlation_id,
            reply_to = %command.reply_to,
            "Remote command forwarded"
        );
        Ok(())
    }

    /// Remember where to send the reply; forgotten a grace period past the deadline
    fn record_reply_route(&self, correlation_id: &str, reply_to: &str, deadline: u64) {
        self.inner
            .reply_routes
            .lock()
            .insert(correlation_id.to_string(), reply_to.to_string());

        let remaining = Duration::from_millis(deadline.saturating_sub(timestamp_now_millis()));
        let ttl = remaining + self.inner.config.reply_route_grace();
        let inner = Arc::downgrade(&self.inner);
        let correlation_id = correlation_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            if let Some(inner) = inner.upgrade() {
                inner.reply_routes.lock().remove(&correlation_id);
            }
        });
    }

    pub fn has_reply_route(&self, correlation_id: &str) -> bool {
        self.inner.reply_routes.lock().contains_key(correlation_id)
    }

    // === Inbound frames ===

    /// Handle a text frame received on `connection_id`
    pub async fn handle_message(&self, connector_id: &str, connection_id: u64, text: &str) -> Result<()> {
        let Some(conn) = self.connection(connector_id, connection_id) else {
            tracing::debug!(connector_id = %connector_id, connection_id, "Frame from unregistered connection");
            return Ok(());
        };
        conn.touch();

        match InboundFrame::parse(text)? {
            InboundFrame::Register { payload } => {
                conn.mark_ready();
                if let Some(group) = self.inner.groups.lock().get_mut(connector_id) {
                    group.info.update_from(&payload);
                }
                conn.send(&OutboundFrame::registered(connector_id, &self.inner.instance_id))?;
                tracing::info!(connector_id = %connector_id, connection_id, "Connector ready");
            }
            InboundFrame::Heartbeat {} => match self.credentials_valid(connector_id, &conn).await {
                Ok(true) => conn.send(&OutboundFrame::heartbeat_ack())?,
                Ok(false) => {
                    tracing::warn!(connector_id = %connector_id, connection_id, "Credentials invalidated, disconnecting");
                    conn.close(CloseCode::TokenInvalidated);
                    self.unregister_connection(connector_id, Some(connection_id)).await?;
                }
                Err(e) => {
                    // Keep the socket through a store outage
                    tracing::warn!(connector_id = %connector_id, error = %e, "Credential check failed");
                    conn.send(&OutboundFrame::heartbeat_ack())?;
                }
            },
            InboundFrame::Result {
                correlation_id,
                reply_to,
                payload,
            } => self.complete(&correlation_id, reply_to, payload, false).await?,
            InboundFrame::Error {
                correlation_id,
                reply_to,
                payload,
            } => self.complete(&correlation_id, reply_to, payload, true).await?,
        }
        Ok(())
    }

    async fn complete(
        &self,
        correlation_id: &str,
        reply_to: Option<String>,
        payload: Value,
        is_error: bool,
    ) -> Result<()> {
        let route = self.inner.reply_routes.lock().remove(correlation_id);
        match reply_to.or(route) {
            Some(reply_to) => {
                let Some(transport) = &self.inner.transport else {
                    tracing::warn!(correlation_id = %correlation_id, "Reply for remote caller without a transport");
                    return Ok(());
                };
                transport
                    .publish_reply(correlation_id, &reply_to, &payload, is_error)
                    .await
            }
            None => {
                let outcome = if is_error {
                    Err(Error::CommandFailed(payload))
                } else {
                    Ok(payload)
                };
                if !self.inner.pending.complete(correlation_id, outcome) {
                    tracing::debug!(correlation_id = %correlation_id, "Dropping late reply");
                }
                Ok(())
            }
        }
    }

    // === Status ===

    pub async fn connector_status(&self, connector_id: &str) -> Result<ConnectorStatus> {
        let local = self.inner.groups.lock().get(connector_id).map(|group| {
            (
                group.fence,
                group.connections.len(),
                group.connections.iter().filter(|c| c.is_ready()).count(),
                group.info.clone(),
            )
        });

        if let Some((fence, connections, ready_connections, info)) = local {
            return Ok(ConnectorStatus {
                connector_id: connector_id.to_string(),
                location: Location::Local,
                owner: Some(self.inner.instance_id.clone()),
                fence: Some(fence),
                connections,
                ready_connections,
                info: Some(info),
            });
        }

        let online = self.inner.ownership.is_online_in_cluster(connector_id).await?;
        let owner = if online {
            self.inner
                .ownership
                .current_owner(connector_id)
                .await?
                .and_then(|value| value.split_once(':').map(|(instance, _)| instance.to_string()))
        } else {
            None
        };
        Ok(ConnectorStatus {
            connector_id: connector_id.to_string(),
            location: if online { Location::Remote } else { Location::Offline },
            owner,
            fence: None,
            connections: 0,
            ready_connections: 0,
            info: None,
        })
    }

    /// Close every socket, stop consumers and release all ownership
    pub async fn shutdown(&self) {
        let _membership = self.inner.membership.lock().await;
        let groups: Vec<(String, ConnectorGroup)> = self.inner.groups.lock().drain().collect();
        for (connector_id, group) in &groups {
            self.inner.ownership.clear_ownership_lost(connector_id);
            if let Some(transport) = &self.inner.transport {
                transport.stop_command_consumer(connector_id);
            }
            for conn in &group.connections {
                conn.close(CloseCode::ServerShutdown);
                METRICS.active_connections.dec();
            }
        }

        self.inner.ownership.release_all().await;
        self.inner.pending.reject_all("server shutdown");
        if let Some(transport) = &self.inner.transport {
            transport.stop();
        }
        tracing::info!(
            instance_id = %self.inner.instance_id,
            connectors = groups.len(),
            "Coordinator shut down"
        );
    }
}

/// Command-log handler that forwards commands to the local socket
struct ForwardingHandler {
    inner: Weak<Inner>,
}

#[async_trait]
impl CommandHandler for ForwardingHandler {
    async fn handle(&self, connector_id: &str, command: RemoteCommand) -> Result<()> {
        let inner = self
            .inner
            .upgrade()
            .ok_or_else(|| Error::HandlerFailure("coordinator dropped".into()))?;
        Coordinator { inner }.forward_remote(connector_id, command).await
    }
}
