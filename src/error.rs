//! Error types for the chat session layer.

use thiserror::Error;

/// Errors that can occur while talking to the broker or managing channels.
#[derive(Debug, Error)]
pub enum ChatError {
    /// The broker rejected or failed an operation.
    #[error("broker error: {0}")]
    Broker(String),

    /// The broker connection (or the channel it carried) is closed.
    #[error("broker connection closed")]
    ConnectionClosed,

    /// Failed to serialize or deserialize a message envelope.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Attempted an operation that requires an active connection, but the
    /// connection manager is not connected.
    #[error("not connected to broker")]
    NotConnected,

    /// The named channel has not been created in this session.
    #[error("channel {0} not found")]
    ChannelNotFound(String),

    /// A broker operation did not complete within the configured timeout.
    #[error("{operation} timed out")]
    Timeout {
        /// The operation that timed out (e.g. `"declare stream"`).
        operation: &'static str,
    },

    /// An inbound envelope carried a `type` tag this client does not know.
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),
}

/// A specialized [`Result`] type for chat session operations.
pub type Result<T> = std::result::Result<T, ChatError>;
