//! Error types for the connector gateway

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === Ownership Errors ===
    #[error("Connector {0} is owned by another gateway instance")]
    OwnershipConflict(String),

    #[error("Ownership of connector {0} was lost")]
    OwnershipLost(String),

    // === Dispatch Errors ===
    #[error("Connector {0} is not connected")]
    NotConnected(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("Connector returned an error: {0}")]
    CommandFailed(serde_json::Value),

    // === Transport Errors ===
    #[error("Shared store unavailable: {0}")]
    TransportUnavailable(String),

    #[error("Command handler failed: {0}")]
    HandlerFailure(String),

    #[error("Malformed log entry: {0}")]
    MalformedEntry(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    // === Connection Errors ===
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Invalid credentials for connector {0}")]
    InvalidCredentials(String),

    // === Encoding Errors ===
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a retryable error?
    ///
    /// A timed-out dispatch may be retried with a fresh correlation ID. An
    /// ownership conflict must not be retried against the same instance.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::TransportUnavailable(_) | Error::Redis(_)
        )
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::NotConnected(_) | Error::ConnectionClosed(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::OwnershipConflict(_) | Error::OwnershipLost(_) => StatusCode::CONFLICT,
            Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::CommandFailed(_) => StatusCode::BAD_GATEWAY,
            Error::TransportUnavailable(_) | Error::Redis(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::InvalidCredentials(_) => StatusCode::UNAUTHORIZED,
            Error::InvalidConfig(_) | Error::Serialization(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}
