//! Dashboard client error types.

use thiserror::Error;

/// Dashboard error type.
#[derive(Debug, Error)]
pub enum DashboardError {
    /// WebSocket transport error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Gateway URL could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Gateway URL is not `ws://`.
    #[error("Unsupported URL scheme: {0}")]
    UnsupportedScheme(String),

    /// The handshake did not complete within the connect timeout.
    #[error("Connect timed out")]
    ConnectTimeout,

    /// Invalid client configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The client task is gone.
    #[error("Client closed")]
    ClientClosed,
}

/// Result type for dashboard operations.
pub type Result<T> = std::result::Result<T, DashboardError>;
