//! Error types for IEC 60870-5-101/104.

use thiserror::Error;

/// Result type alias for IEC 60870-5 operations.
pub type Result<T> = std::result::Result<T, Iec60870Error>;

/// IEC 60870-5-101/104 error types.
#[derive(Debug, Error)]
pub enum Iec60870Error {
    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Not connected to remote
    #[error("Not connected")]
    NotConnected,

    /// Connection timeout
    #[error("Connection timeout")]
    ConnectionTimeout,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid frame format
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Invalid ASDU
    #[error("Invalid ASDU: {0}")]
    InvalidAsdu(String),

    /// Unknown type identifier
    #[error("Unknown type ID: {0}")]
    UnknownTypeId(u8),

    /// Unknown cause of transmission
    #[error("Unknown COT: {0}")]
    UnknownCot(u8),

    /// Sequence number mismatch
    #[error("Sequence number mismatch: expected {expected}, got {actual}")]
    SequenceMismatch { expected: u16, actual: u16 },

    /// Peer acknowledged a sequence number outside the send window
    #[error("Invalid acknowledgment {ack}: window is {oldest}..={next}")]
    InvalidAck { ack: u16, oldest: u16, next: u16 },

    /// T1 timeout (send confirmation)
    #[error("T1 timeout: no confirmation received")]
    T1Timeout,

    /// T2 timeout (no data acknowledgment)
    #[error("T2 timeout: acknowledgment timeout")]
    T2Timeout,

    /// T3 timeout (test frame)
    #[error("T3 timeout: connection test failed")]
    T3Timeout,

    /// Too many unconfirmed frames
    #[error("Too many unconfirmed frames (K={0})")]
    TooManyUnconfirmed(u16),

    /// Encoded ASDU exceeds the configured maximum
    #[error("ASDU too large: {size} bytes (max {max})")]
    AsduTooLarge { size: usize, max: usize },

    /// Outgoing queue is full
    #[error("Queue full")]
    QueueFull,

    /// Channel closed
    #[error("Channel closed")]
    ChannelClosed,

    /// Codec error
    #[error("Codec error: {0}")]
    Codec(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Serial link layer error (CS101)
    #[error("Link layer error: {0}")]
    LinkLayer(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Iec60870Error {
    /// Create a protocol error with a message.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create an invalid frame error.
    pub fn invalid_frame(msg: impl Into<String>) -> Self {
        Self::InvalidFrame(msg.into())
    }

    /// Create an invalid ASDU error.
    pub fn invalid_asdu(msg: impl Into<String>) -> Self {
        Self::InvalidAsdu(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a link layer error.
    pub fn link_layer(msg: impl Into<String>) -> Self {
        Self::LinkLayer(msg.into())
    }

    /// Check if this error indicates a connection problem.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection(_)
                | Self::NotConnected
                | Self::ConnectionTimeout
                | Self::ChannelClosed
                | Self::T1Timeout
                | Self::T3Timeout
        )
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionTimeout
                | Self::T1Timeout
                | Self::T2Timeout
                | Self::T3Timeout
                | Self::TooManyUnconfirmed(_)
                | Self::QueueFull
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Iec60870Error::NotConnected;
        assert_eq!(err.to_string(), "Not connected");

        let err = Iec60870Error::UnknownTypeId(255);
        assert_eq!(err.to_string(), "Unknown type ID: 255");

        let err = Iec60870Error::SequenceMismatch {
            expected: 10,
            actual: 5,
        };
        assert_eq!(
            err.to_string(),
            "Sequence number mismatch: expected 10, got 5"
        );

        let err = Iec60870Error::AsduTooLarge { size: 300, max: 249 };
        assert_eq!(err.to_string(), "ASDU too large: 300 bytes (max 249)");
    }

    #[test]
    fn test_is_connection_error() {
        assert!(Iec60870Error::NotConnected.is_connection_error());
        assert!(Iec60870Error::ConnectionTimeout.is_connection_error());
        assert!(Iec60870Error::T1Timeout.is_connection_error());
        assert!(Iec60870Error::T3Timeout.is_connection_error());
        assert!(!Iec60870Error::QueueFull.is_connection_error());
    }

    #[test]
    fn test_is_retryable() {
        assert!(Iec60870Error::ConnectionTimeout.is_retryable());
        assert!(Iec60870Error::TooManyUnconfirmed(12).is_retryable());
        assert!(!Iec60870Error::NotConnected.is_retryable());
        assert!(!Iec60870Error::config("bad").is_retryable());
    }
}
