//! Error types for channel layer operations
//!
//! Two of the variants are not faults: [`ChannelError::ListenerClosed`] and
//! [`ChannelError::Unsubscribed`] are the normal way a listener loop or a
//! subscriber stream comes to an end.

use thiserror::Error;

/// Channel layer error types.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Invalid or unknown channel layer configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Payload rejected by the transport before sending
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Failed to publish a message
    #[error("Failed to publish message: {0}")]
    Publish(String),

    /// Failed to subscribe or unsubscribe at the transport level
    #[error("Failed to subscribe: {0}")]
    Subscribe(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Operation requires a connected channel or backend
    #[error("Channel layer is not connected")]
    NotConnected,

    /// The backend will deliver no more events
    #[error("Channel listener closed")]
    ListenerClosed,

    /// The subscriber was released from its group
    #[error("Subscriber unsubscribed from group")]
    Unsubscribed,

    /// One or more best-effort teardown steps failed
    #[error("Cleanup failed: {}", .0.join("; "))]
    Cleanup(Vec<String>),
}

/// Result type for channel layer operations.
pub type ChannelResult<T> = Result<T, ChannelError>;

impl ChannelError {
    /// Check if this error is a termination signal rather than a fault.
    ///
    /// Listener loops and subscriber streams end quietly on these.
    pub fn is_termination(&self) -> bool {
        matches!(self, ChannelError::ListenerClosed | ChannelError::Unsubscribed)
    }

    /// Get a stable error code for logs and API responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            ChannelError::Config(_) => "CONFIG_ERROR",
            ChannelError::NotSupported(_) => "NOT_SUPPORTED",
            ChannelError::Connection(_) => "CONNECTION_ERROR",
            ChannelError::Publish(_) => "PUBLISH_ERROR",
            ChannelError::Subscribe(_) => "SUBSCRIBE_ERROR",
            ChannelError::Serialization(_) => "SERIALIZATION_ERROR",
            ChannelError::NotConnected => "NOT_CONNECTED",
            ChannelError::ListenerClosed => "LISTENER_CLOSED",
            ChannelError::Unsubscribed => "UNSUBSCRIBED",
            ChannelError::Cleanup(_) => "CLEANUP_ERROR",
        }
    }
}

impl From<serde_json::Error> for ChannelError {
    fn from(err: serde_json::Error) -> Self {
        ChannelError::Serialization(err.to_string())
    }
}
