//! Error types for protocol operations

use crate::error_mapper::ServiceError;
use thiserror::Error;

/// Protocol-specific errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Envelope or error data could not be encoded
    #[error("Encode error: {0}")]
    Encode(String),

    /// Envelope or error data could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// Invalid frame format
    #[error("Invalid frame format")]
    InvalidFrame,

    /// Frame too large
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge {
        /// Actual frame size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// The `sid` header is not a valid 63-bit stream identifier
    #[error("Invalid stream ID: {0}")]
    InvalidStreamId(String),

    /// The `sig` header carries an unsupported value
    #[error("Unknown signal: {0}")]
    UnknownSignal(String),

    /// I/O error on the underlying connection
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Terminal failure of a single exchange.
///
/// Exactly one of these (or a normal completion) ends every exchange that was
/// registered in a [`StreamTable`](crate::StreamTable).
#[derive(Debug, Clone, Error)]
pub enum StreamError {
    /// The peer answered with an error signal
    #[error(transparent)]
    Service(#[from] ServiceError),

    /// The connection was disposed while the exchange was still open
    #[error("Connection closed")]
    ConnectionClosed,

    /// Writing the outbound envelope failed
    #[error("Transport write failed: {0}")]
    TransportWrite(String),

    /// An inbound envelope for this exchange could not be handled
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl From<ProtocolError> for StreamError {
    fn from(error: ProtocolError) -> Self {
        match error {
            ProtocolError::Io(e) => Self::TransportWrite(e.to_string()),
            other => Self::Protocol(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::FrameTooLarge { size: 200, max: 100 };
        assert_eq!(err.to_string(), "Frame too large: 200 bytes (max: 100)");
        assert_eq!(
            ProtocolError::InvalidStreamId("-1".into()).to_string(),
            "Invalid stream ID: -1"
        );
    }

    #[test]
    fn test_stream_error_from_protocol_error() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe gone");
        assert!(matches!(
            StreamError::from(ProtocolError::Io(io)),
            StreamError::TransportWrite(msg) if msg.contains("pipe gone")
        ));
        assert!(matches!(
            StreamError::from(ProtocolError::UnknownSignal("3".into())),
            StreamError::Protocol(msg) if msg == "Unknown signal: 3"
        ));
    }

    #[test]
    fn test_service_error_is_transparent() {
        let err = StreamError::from(ServiceError::internal(500, "boom"));
        assert_eq!(err.to_string(), "boom");
    }
}
