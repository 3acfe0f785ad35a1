//! # Gatemux
//!
//! Client side of the gatemux protocol: one [`Session`] multiplexes many
//! logical request streams over a single bidirectional byte connection.
//!
//! Every exchange is identified by a stream id carried in the `sid` header.
//! Responses are routed back to the consumer returned by
//! [`Session::receive`], ending with a completion or an error signal.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub use gatemux_proto as proto;

/// Error types for the client session
pub mod error;

/// Session management and inbound dispatch
pub mod session;

pub use error::SessionError;
pub use session::{ExchangeStream, Session, SessionBuilder, SessionConfig, SessionStatus};

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, SessionError>;
