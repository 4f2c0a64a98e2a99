//! Error types for swarm-dns.

use thiserror::Error;

/// Errors that can occur in the discovery server.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// IO error (network, file, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP transport error talking to the orchestrator
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// Orchestrator payload could not be decoded
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Orchestrator answered with a non-success status
    #[error("orchestrator returned {status}: {message}")]
    Orchestrator {
        /// HTTP status code.
        status: u16,
        /// Response body, if any.
        message: String,
    },

    /// Event subscription could not be established
    #[error("event subscription failed: {0}")]
    Subscription(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// DNS protocol error
    #[error("DNS protocol error: {0}")]
    Proto(#[from] hickory_proto::ProtoError),

    /// Query name was not fully qualified
    #[error("invalid query name: {0:?}")]
    InvalidQueryName(String),
}
