//! Error types for the gateway acceptor

use gatemux_proto::ProtocolError;
use thiserror::Error;

/// Errors ending a gateway session
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The session-open hook refused the connection
    #[error("Session rejected: {0:#}")]
    Rejected(anyhow::Error),

    /// Reading from the connection failed
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}
