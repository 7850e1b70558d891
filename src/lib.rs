//! # connector-gateway
//!
//! A horizontally-scaled WebSocket gateway for remote connector runtimes:
//! - Per-connector ownership with fencing tokens over a shared store
//! - Cross-instance command routing on append-only logs with consumer groups
//! - Crash recovery of in-flight commands via idle-entry claiming
//! - Reference-counted LRU pool for expensive long-lived resources
//!
//! ## Architecture
//!
//! ```text
//!   caller ──HTTP──► gateway A                 gateway B ◄──WS── connector X
//!                    │  owns? no                  │ owns X (fence 7)
//!                    │                            │
//!                    ├─XADD cmd:X ──────────────► │ command consumer (group "owner")
//!                    │                            │   └─► forward over WS
//!                    │                            │ ◄── result frame
//!                    │ ◄──────────── XADD reply:A ┤
//!                    │ reply consumer             │
//!                    ▼                            ▼
//!   connector:X:owner = "B:7" (TTL 30s)   connector:X:status = online (TTL 60s)
//! ```
//!
//! ## Usage
//!
//! ```bash
//! # Single instance, no shared store
//! connector-gateway serve --bind 0.0.0.0:8080
//!
//! # Clustered
//! connector-gateway serve --id gw-1 --redis redis://127.0.0.1:6379 --config gateway.toml
//!
//! # Digest for the token table
//! connector-gateway hash-token s3cret
//! ```

#![allow(clippy::result_large_err)]

pub mod common;
pub mod coordinator;
pub mod pool;
pub mod store;

// Re-export commonly used types
pub use common::{Error, GatewayConfig, Result};
pub use coordinator::{Command, Coordinator, Gateway};
pub use pool::PoolManager;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
