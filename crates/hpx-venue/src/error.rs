//! Error taxonomy for the venue multiplexer.

use std::{string::FromUtf8Error, time::Duration};

use thiserror::Error;

use crate::id::CorrelationId;

/// The main result type used throughout the crate.
pub type VenueResult<T> = Result<T, VenueError>;

/// Every way an exchange, a subscription or the connection can end badly.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VenueError {
    /// A second wait was registered for an id that already has one.
    ///
    /// The id allocator never hands out the same id twice, so seeing this
    /// means a programming defect rather than a runtime condition.
    #[error("Duplicate correlation id: {id}")]
    DuplicateId { id: CorrelationId },

    /// Non-blocking read found nothing for the id.
    #[error("No message delivered yet for correlation id {id}")]
    NotYetDelivered { id: CorrelationId },

    /// The reply did not arrive within the configured bound.
    #[error("Request {id} timed out after {duration:?}")]
    Timeout {
        id: CorrelationId,
        duration: Duration,
    },

    /// The session carrying the exchange went away before an answer arrived.
    #[error("Connection lost: {reason}")]
    ConnectionLost { reason: String },

    /// The request never reached the wire.
    #[error("Send failed: {reason}")]
    SendFailed { reason: String },

    /// The wait was released by an explicit cancellation.
    #[error("Correlation id {id} was cancelled")]
    Cancelled { id: CorrelationId },

    /// The venue answered with its error flag set.
    #[error("Venue rejected request {id}: {message}")]
    Rejected {
        id: CorrelationId,
        code: Option<String>,
        message: String,
    },

    /// Authorization exchange failed or timed out.
    #[error("Authentication error: {message}")]
    Auth { message: String },

    /// WebSocket level failure.
    #[error("WebSocket error: {message}")]
    WebSocket { message: String },

    /// Serialization/deserialization errors.
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// Configuration errors.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl From<serde_json::Error> for VenueError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization {
            message: e.to_string(),
        }
    }
}

impl From<FromUtf8Error> for VenueError {
    fn from(e: FromUtf8Error) -> Self {
        Self::Serialization {
            message: e.to_string(),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for VenueError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket {
            message: e.to_string(),
        }
    }
}

impl VenueError {
    /// Create a timeout error for the given id.
    pub fn timeout(id: CorrelationId, duration: Duration) -> Self {
        Self::Timeout { id, duration }
    }

    /// Create a connection-lost error.
    pub fn connection_lost(reason: impl Into<String>) -> Self {
        Self::ConnectionLost {
            reason: reason.into(),
        }
    }

    /// Create a send-failed error.
    pub fn send_failed(reason: impl Into<String>) -> Self {
        Self::SendFailed {
            reason: reason.into(),
        }
    }

    /// Create an authentication error.
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth {
            message: message.into(),
        }
    }

    /// Create a WebSocket error.
    pub fn websocket(message: impl Into<String>) -> Self {
        Self::WebSocket {
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether a caller may reasonably retry with a fresh correlation id.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::ConnectionLost { .. } | Self::SendFailed { .. }
        )
    }

    /// Whether this error ends a subscription stream.
    pub fn is_terminal_for_stream(&self) -> bool {
        matches!(self, Self::Cancelled { .. } | Self::ConnectionLost { .. })
    }
}
