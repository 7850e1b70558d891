//! Common utilities and types shared across the gateway

pub mod auth;
pub mod config;
pub mod error;
pub mod metrics;
pub mod pending;
pub mod tracing_middleware;
pub mod utils;

pub use auth::{bearer_token, CredentialVerifier, TokenTableVerifier};
pub use config::{CoordinatorConfig, GatewayConfig, OwnershipConfig, PoolConfig, TransportConfig};
pub use error::{Error, Result};
pub use metrics::METRICS;
pub use pending::{PendingReply, PendingTable};
pub use utils::{
    generate_correlation_id, hash_token, timestamp_now_millis,
    validate_connector_id,
};
