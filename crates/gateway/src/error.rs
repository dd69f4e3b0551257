//! Gateway error types.

use crate::connection::ConnectionId;
use thiserror::Error;

/// Gateway error type.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Wire-level error from the shared protocol crate.
    #[error(transparent)]
    Protocol(#[from] common::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Connection not registered (or already unregistered).
    #[error("Connection not found: {0}")]
    ConnectionNotFound(ConnectionId),

    /// Invalid call identifier.
    #[error("Invalid call id: {0}")]
    InvalidCallId(String),

    /// Outbound queue or ingest channel closed.
    #[error("Channel closed")]
    ChannelClosed,

    /// Call processor failure.
    #[error("Processor error: {0}")]
    Processor(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl GatewayError {
    /// Stable code sent to clients in `error` frames.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Protocol(common::Error::InvalidMessage(_))
            | GatewayError::Json(_)
            | GatewayError::InvalidCallId(_) => "INVALID_MESSAGE",
            GatewayError::Protocol(common::Error::InvalidUpdate(_)) => "INVALID_UPDATE",
            GatewayError::Processor(_) => "PROCESSING_ERROR",
            _ => "INTERNAL_ERROR",
        }
    }

    /// The client sent something unparseable or invalid.
    pub fn is_client_fault(&self) -> bool {
        self.code() == "INVALID_MESSAGE"
    }
}

impl From<tokio::sync::mpsc::error::SendError<common::CallUpdate>> for GatewayError {
    fn from(_: tokio::sync::mpsc::error::SendError<common::CallUpdate>) -> Self {
        GatewayError::ChannelClosed
    }
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_malformed_input_is_client_fault() {
        let malformed = GatewayError::from(common::Error::InvalidMessage("bad".to_string()));
        assert_eq!(malformed.code(), "INVALID_MESSAGE");
        assert!(malformed.is_client_fault());
        assert!(GatewayError::InvalidCallId(String::new()).is_client_fault());

        let processing = GatewayError::Processor("pipeline down".to_string());
        assert_eq!(processing.code(), "PROCESSING_ERROR");
        assert!(!processing.is_client_fault());
        assert!(!GatewayError::ChannelClosed.is_client_fault());
        assert!(!GatewayError::ConnectionNotFound(ConnectionId::nil()).is_client_fault());
    }
}
