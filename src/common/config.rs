//! Configuration for the gateway process
//!
//! Loaded from an optional TOML file and `GATEWAY__*` environment variables,
//! then overridden by CLI flags in the binary.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::common::{Error, Result};

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Instance ID, unique across the cluster
    #[serde(default = "default_instance_id")]
    pub instance_id: String,

    /// Bind address for HTTP + WebSocket
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// Shared store URL. Absent means single-instance mode.
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub ownership: OwnershipConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    /// Connector ID -> hex SHA-256 of its token
    #[serde(default)]
    pub tokens: HashMap<String, String>,
}

fn default_instance_id() -> String {
    format!("gw-{}", uuid::Uuid::new_v4().simple())
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            instance_id: default_instance_id(),
            bind_addr: default_bind_addr(),
            redis_url: None,
            log_level: default_log_level(),
            ownership: OwnershipConfig::default(),
            transport: TransportConfig::default(),
            coordinator: CoordinatorConfig::default(),
            pool: PoolConfig::default(),
            tokens: HashMap::new(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from `path` (or `./gateway.toml` if present) and
    /// the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        builder = match path {
            Some(path) => builder.add_source(config::File::from(path).required(true)),
            None => builder.add_source(config::File::with_name("gateway").required(false)),
        };
        builder = builder.add_source(
            config::Environment::with_prefix("GATEWAY")
                .separator("__")
                .try_parsing(true),
        );

        let config: GatewayConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.instance_id.is_empty() || self.instance_id.contains(':') {
            return Err(Error::InvalidConfig(
                "instance_id must be non-empty and must not contain ':'".into(),
            ));
        }
        if self.ownership.refresh_interval_secs >= self.ownership.owner_ttl_secs {
            return Err(Error::InvalidConfig(
                "ownership.refresh_interval_secs must be below owner_ttl_secs".into(),
            ));
        }
        // Zero would turn every consumer read into a busy poll
        if self.transport.block_ms == 0 {
            return Err(Error::InvalidConfig("transport.block_ms must be > 0".into()));
        }
        if self.transport.claim_max_iterations == 0 {
            return Err(Error::InvalidConfig(
                "transport.claim_max_iterations must be > 0".into(),
            ));
        }
        if self.pool.max_pools == 0 {
            return Err(Error::InvalidConfig("pool.max_pools must be > 0".into()));
        }
        Ok(())
    }

    pub fn is_distributed(&self) -> bool {
        self.redis_url.is_some()
    }
}

/// Ownership registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OwnershipConfig {
    pub owner_ttl_secs: u64,
    pub status_ttl_secs: u64,
    pub refresh_interval_secs: u64,
}

impl Default for OwnershipConfig {
    fn default() -> Self {
        Self {
            owner_ttl_secs: 30,
            status_ttl_secs: 60,
            refresh_interval_secs: 10,
        }
    }
}

impl OwnershipConfig {
    pub fn owner_ttl(&self) -> Duration {
        Duration::from_secs(self.owner_ttl_secs)
    }

    pub fn status_ttl(&self) -> Duration {
        Duration::from_secs(self.status_ttl_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }
}

/// Command/reply transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Deadline attached to every remote command
    pub command_timeout_secs: u64,
    /// Maximum block duration of a consumer read
    pub block_ms: u64,
    /// Pause after a failed loop iteration
    pub error_backoff_ms: u64,
    pub claim_interval_secs: u64,
    /// Entries idle at least this long are claimed from dead consumers
    pub claim_min_idle_secs: u64,
    pub claim_max_iterations: usize,
    pub claim_batch_size: usize,
    pub read_batch_size: usize,
    /// Approximate MAXLEN of command and reply logs
    pub stream_max_len: usize,
    pub processed_ttl_secs: u64,
    /// Handler failures tolerated before an entry is dead-lettered
    pub max_handler_attempts: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: 630,
            block_ms: 5_000,
            error_backoff_ms: 1_000,
            claim_interval_secs: 5,
            claim_min_idle_secs: 630,
            claim_max_iterations: 10,
            claim_batch_size: 50,
            read_batch_size: 10,
            stream_max_len: 1_000,
            processed_ttl_secs: 300,
            max_handler_attempts: 3,
        }
    }
}

impl TransportConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn block(&self) -> Duration {
        Duration::from_millis(self.block_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    pub fn claim_interval(&self) -> Duration {
        Duration::from_secs(self.claim_interval_secs)
    }

    pub fn claim_min_idle(&self) -> Duration {
        Duration::from_secs(self.claim_min_idle_secs)
    }

    pub fn processed_ttl(&self) -> Duration {
        Duration::from_secs(self.processed_ttl_secs)
    }
}

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Timeout of a dispatch served over a local socket
    pub local_timeout_secs: u64,
    /// Reply routes outlive the command deadline by this much
    pub reply_route_grace_secs: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            local_timeout_secs: 30,
            reply_route_grace_secs: 30,
        }
    }
}

impl CoordinatorConfig {
    pub fn local_timeout(&self) -> Duration {
        Duration::from_secs(self.local_timeout_secs)
    }

    pub fn reply_route_grace(&self) -> Duration {
        Duration::from_secs(self.reply_route_grace_secs)
    }
}

/// Pool manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_pools: usize,
    pub idle_ttl_secs: u64,
    pub cleanup_interval_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_pools: 50,
            idle_ttl_secs: 600,
            cleanup_interval_secs: 60,
        }
    }
}

impl PoolConfig {
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}
