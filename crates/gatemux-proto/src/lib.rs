//! # Gatemux Protocol
//!
//! Envelope model, wire codecs, stream correlation table and error mapping for
//! the gatemux multiplexing protocol.

#![warn(missing_docs)]

#[cfg(not(any(feature = "rmp-serde", feature = "json")))]
compile_error!("gatemux-proto needs at least one codec feature: `rmp-serde` or `json`");

/// Envelope structure, headers and signals
pub mod envelope;

/// Envelope codecs and length-prefixed framing
pub mod codec;

/// Stream table and pending exchanges
pub mod stream;

/// Error data and the error mapper
pub mod error_mapper;

/// Serialized envelope writer
pub mod writer;

/// Error types for protocol operations
pub mod error;

pub use envelope::{Envelope, Signal, StreamId, MAX_STREAM_ID, SIGNAL, STREAM_ID};
pub use codec::{default_codec, EnvelopeCodec, FrameCodec, MAX_FRAME_SIZE};
#[cfg(feature = "json")]
pub use codec::JsonCodec;
#[cfg(feature = "rmp-serde")]
pub use codec::MsgPackCodec;
pub use stream::{ExchangeState, PendingExchange, StreamEvent, StreamTable};
pub use error_mapper::{DefaultErrorMapper, ErrorData, ErrorMapper, ServiceError};
pub use writer::EnvelopeWriter;
pub use error::{ProtocolError, StreamError};
