//! Error types for channel, pool and correlator operations

use std::time::Duration;
use thiserror::Error;

/// Result type for mesh operations
pub type MeshResult<T> = Result<T, MeshError>;

/// Errors that can occur while moving envelopes between agents
#[derive(Error, Debug)]
pub enum MeshError {
    /// The underlying stream could not be established
    #[error("Connection to '{address}' failed: {reason}")]
    ConnectionFailed { address: String, reason: String },

    /// A send was attempted before the stream existed
    #[error("Channel '{address}' is not connected")]
    NotConnected { address: String },

    /// `start` was called on a channel whose read loop is already running
    #[error("Channel '{address}' has already been started")]
    AlreadyStarted { address: String },

    /// The stream ended while a request was still waiting for its reply
    #[error("Channel '{address}' closed before a reply arrived")]
    ChannelClosed { address: String },

    /// A payload was valid JSON but not a decodable envelope
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// The caller cancelled the wait
    #[error("Operation cancelled")]
    Cancelled,

    /// The wait exceeded its deadline
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// A request with the same message id is already awaiting a reply
    #[error("Request {0} is already in flight")]
    DuplicateRequest(String),

    /// Too many outstanding requests on one correlator
    #[error("Queue full: capacity {capacity}, current size {current}")]
    QueueFull { capacity: usize, current: usize },

    /// Stream-level I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Envelope serialization failed
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MeshError {
    /// Create a connection failure for an address
    pub fn connection_failed(address: impl Into<String>, reason: impl ToString) -> Self {
        Self::ConnectionFailed {
            address: address.into(),
            reason: reason.to_string(),
        }
    }

    /// True for outcomes produced by cancellation or timeout rather than failure
    pub fn is_cancellation(&self) -> bool {
        matches!(self, MeshError::Cancelled | MeshError::Timeout(_))
    }

    /// Get the error code suitable for logging or reporting
    pub fn error_code(&self) -> &'static str {
        match self {
            MeshError::ConnectionFailed { .. } => "CONNECTION_FAILED",
            MeshError::NotConnected { .. } => "NOT_CONNECTED",
            MeshError::AlreadyStarted { .. } => "ALREADY_STARTED",
            MeshError::ChannelClosed { .. } => "CHANNEL_CLOSED",
            MeshError::MalformedPayload(_) => "MALFORMED_PAYLOAD",
            MeshError::Cancelled => "CANCELLED",
            MeshError::Timeout(_) => "TIMEOUT",
            MeshError::DuplicateRequest(_) => "DUPLICATE_REQUEST",
            MeshError::QueueFull { .. } => "QUEUE_FULL",
            MeshError::Io(_) => "IO_ERROR",
            MeshError::Serialization(_) => "SERIALIZATION_FAILED",
        }
    }
}
