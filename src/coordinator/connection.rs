//! Connector sockets and the frames exchanged over them
//!
//! A [`Connection`] is the coordinator's handle on one open WebSocket. The
//! socket itself lives in the HTTP layer; the coordinator only pushes
//! [`Outbound`] messages into the connection's queue.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::common::{Error, Result};
use crate::coordinator::transport::Command;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Application close codes sent to connectors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    InvalidToken,
    TokenInvalidated,
    OwnershipConflict,
    OwnershipLost,
    ServerShutdown,
}

impl CloseCode {
    pub fn code(self) -> u16 {
        match self {
            CloseCode::InvalidToken => 4001,
            CloseCode::TokenInvalidated => 4003,
            CloseCode::OwnershipConflict => 4009,
            CloseCode::OwnershipLost => 4010,
            CloseCode::ServerShutdown => 4012,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            CloseCode::InvalidToken => "invalid or missing token",
            CloseCode::TokenInvalidated => "token invalidated",
            CloseCode::OwnershipConflict => "connector owned by another instance",
            CloseCode::OwnershipLost => "ownership lost",
            CloseCode::ServerShutdown => "server shutdown",
        }
    }
}

/// Messages queued for a socket writer
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Frame(String),
    Close(CloseCode),
}

/// Frames sent by connectors
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    Register {
        #[serde(default)]
        payload: Value,
    },
    Heartbeat {},
    #[serde(rename_all = "camelCase")]
    Result {
        correlation_id: String,
        #[serde(default)]
        reply_to: Option<String>,
        #[serde(default)]
        payload: Value,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        correlation_id: String,
        #[serde(default)]
        reply_to: Option<String>,
        #[serde(default)]
        payload: Value,
    },
}

impl InboundFrame {
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(Error::from)
    }
}

/// Frames sent to connectors
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundFrame {
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

impl OutboundFrame {
    pub fn registered(connector_id: &str, instance_id: &str) -> Self {
        Self {
            kind: "registered",
            correlation_id: None,
            reply_to: None,
            payload: serde_json::json!({
                "connectorId": connector_id,
                "instanceId": instance_id,
            }),
        }
    }

    pub fn heartbeat_ack() -> Self {
        Self {
            kind: "heartbeat_ack",
            correlation_id: None,
            reply_to: None,
            payload: Value::Null,
        }
    }

    /// A command; `reply_to` is set when the caller sits on another instance
    pub fn command(correlation_id: &str, reply_to: Option<&str>, command: &Command) -> Self {
        Self {
            kind: "command",
            correlation_id: Some(correlation_id.to_string()),
            reply_to: reply_to.map(str::to_string),
            payload: serde_json::json!({
                "type": command.kind,
                "payload": command.payload,
            }),
        }
    }
}

/// Descriptive information about a connector, refreshed by `register`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorInfo {
    pub connector_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub connected_at: DateTime<Utc>,
}

impl ConnectorInfo {
    pub fn new(connector_id: impl Into<String>) -> Self {
        Self {
            connector_id: connector_id.into(),
            name: None,
            version: None,
            connected_at: Utc::now(),
        }
    }

    /// Pick up `name` / `version` from a register payload
    pub fn update_from(&mut self, payload: &Value) {
        if let Some(name) = payload.get("name").and_then(Value::as_str) {
            self.name = Some(name.to_string());
        }
        if let Some(version) = payload.get("version").and_then(Value::as_str) {
            self.version = Some(version.to_string());
        }
    }
}

pub struct Connection {
    id: u64,
    token_hash: String,
    token_version: i64,
    connected_at: Instant,
    ready: AtomicBool,
    last_seen: Mutex<Instant>,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("token_version", &self.token_version)
            .field("ready", &self.is_ready())
            .field("open", &self.is_open())
            .finish()
    }
}

impl Connection {
    /// New connection plus the receiving end its socket writer drains
    pub fn new(
        token_hash: impl Into<String>,
        token_version: i64,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let now = Instant::now();
        let conn = Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            token_hash: token_hash.into(),
            token_version,
            connected_at: now,
            ready: AtomicBool::new(false),
            last_seen: Mutex::new(now),
            outbound: tx,
        });
        (conn, rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn token_hash(&self) -> &str {
        &self.token_hash
    }

    pub fn token_version(&self) -> i64 {
        self.token_version
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// False once the socket writer is gone
    pub fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }

    pub fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    pub fn last_seen(&self) -> Instant {
        *self.last_seen.lock()
    }

    pub fn send(&self, frame: &OutboundFrame) -> Result<()> {
        let text = serde_json::to_string(frame)?;
        self.outbound
            .send(Outbound::Frame(text))
            .map_err(|_| Error::ConnectionClosed(format!("connection {} closed", self.id)))
    }

    pub fn close(&self, code: CloseCode) {
        self.ready.store(false, Ordering::SeqCst);
        // Writer may already be gone
        let _ = self.outbound.send(Outbound::Close(code));
    }
}
