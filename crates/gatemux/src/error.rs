//! Error types for the client session

use gatemux_proto::{ProtocolError, ServiceError, StreamError, StreamId};
use thiserror::Error;

/// Main error type for session operations
#[derive(Debug, Error)]
pub enum SessionError {
    /// The operation is not valid in the current state of the exchange
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// The stream id does not fit in 63 bits
    #[error("Invalid stream ID: {0}")]
    InvalidStreamId(StreamId),

    /// The exchange ended with an error
    #[error(transparent)]
    Stream(#[from] StreamError),

    /// Protocol-related errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// The remote service failure, if the exchange ended with one
    pub fn service_error(&self) -> Option<&ServiceError> {
        match self {
            Self::Stream(StreamError::Service(e)) => Some(e),
            _ => None,
        }
    }

    /// Whether the exchange ended because the connection went away
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, Self::Stream(StreamError::ConnectionClosed))
    }
}
