//! # Gatemux Gateway
//!
//! Server side of the gatemux protocol. A [`GatewayAcceptor`] serves one
//! connection per [`accept`](GatewayAcceptor::accept) call, routing each
//! request by its qualifier to a [`ServiceHandler`] and writing the responses
//! back on the request's stream id, followed by exactly one completion or
//! error signal.

#![warn(missing_docs)]

/// Acceptor and per-connection dispatch
pub mod acceptor;

/// Service handlers and the qualifier registry
pub mod handler;

/// Gateway sessions and lifecycle hooks
pub mod session;

/// Error types for the gateway
pub mod error;

pub use gatemux_proto as proto;

pub use acceptor::{AcceptorBuilder, AcceptorConfig, GatewayAcceptor};
pub use error::GatewayError;
pub use handler::{service_fn, HandlerRegistry, ResponseStream, ServiceFn, ServiceHandler};
pub use session::{DefaultSessionHandler, GatewaySession, GatewaySessionHandler};

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;
