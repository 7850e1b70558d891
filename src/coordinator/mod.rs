//! Connector coordination
//!
//! The coordinator is responsible for:
//! - Connector ownership with fencing tokens
//! - Live WebSocket connections per connector
//! - Local vs cross-instance command dispatch
//! - Command/reply transport over the shared store's streams

pub mod connection;
pub mod http;
pub mod ownership;
pub mod registry;
pub mod server;
pub mod transport;

pub use connection::{CloseCode, Connection, ConnectorInfo, Outbound};
pub use ownership::{Acquisition, OwnershipRegistry};
pub use registry::{ConnectorStatus, Coordinator, Location};
pub use server::Gateway;
pub use transport::{Command, CommandHandler, CommandTransport, RemoteCommand};
