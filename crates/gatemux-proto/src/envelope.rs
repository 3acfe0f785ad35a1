//! Envelope structure, headers and signals

use crate::ProtocolError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::trace;

/// Header carrying the stream identifier
pub const STREAM_ID: &str = "sid";

/// Header carrying the completion signal
pub const SIGNAL: &str = "sig";

/// Stream identifier of one logical exchange
pub type StreamId = u64;

/// Largest valid stream identifier (63 bits)
pub const MAX_STREAM_ID: StreamId = i64::MAX as StreamId;

/// Terminal signal carried in the `sig` header.
///
/// An envelope without a signal header is a data envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    /// The exchange completed successfully
    Complete,
    /// The exchange failed; the payload holds the error data
    Error,
}

impl Signal {
    /// Numeric wire code of the signal
    pub fn code(self) -> u8 {
        match self {
            Self::Complete => 1,
            Self::Error => 2,
        }
    }

    /// Header value written on the wire
    pub fn as_header(self) -> &'static str {
        match self {
            Self::Complete => "1",
            Self::Error => "2",
        }
    }

    /// Parse a `sig` header value. Symbolic names are accepted as well.
    pub fn from_header(value: &str) -> Result<Self, ProtocolError> {
        match value.trim() {
            "1" | "COMPLETE" => Ok(Self::Complete),
            "2" | "ERROR" => Ok(Self::Error),
            other => Err(ProtocolError::UnknownSignal(other.to_string())),
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Complete => f.write_str("COMPLETE"),
            Self::Error => f.write_str("ERROR"),
        }
    }
}

/// One routed unit of communication
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Route qualifier, present on requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    qualifier: Option<String>,
    /// Headers, including `sid` and `sig`
    #[serde(default)]
    headers: HashMap<String, String>,
    /// Opaque payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<Bytes>,
}

impl Envelope {
    /// Create an empty envelope
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a request envelope
    pub fn request(qualifier: impl Into<String>, stream_id: StreamId, payload: impl Into<Bytes>) -> Self {
        Self::new()
            .with_qualifier(qualifier)
            .with_stream_id(stream_id)
            .with_payload(payload)
    }

    /// Create a data envelope
    pub fn data(stream_id: StreamId, payload: impl Into<Bytes>) -> Self {
        Self::new().with_stream_id(stream_id).with_payload(payload)
    }

    /// Create a completion envelope
    pub fn complete(stream_id: StreamId) -> Self {
        Self::new()
            .with_stream_id(stream_id)
            .with_signal(Signal::Complete)
    }

    /// Create an error envelope carrying encoded error data
    pub fn error(stream_id: StreamId, error_data: Bytes) -> Self {
        Self::new()
            .with_stream_id(stream_id)
            .with_signal(Signal::Error)
            .with_payload(error_data)
    }

    /// Set the qualifier
    pub fn with_qualifier(mut self, qualifier: impl Into<String>) -> Self {
        self.qualifier = Some(qualifier.into());
        self
    }

    /// Set a header, replacing any previous value for the key
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Set the `sid` header
    pub fn with_stream_id(self, stream_id: StreamId) -> Self {
        self.with_header(STREAM_ID, stream_id.to_string())
    }

    /// Set the `sig` header
    pub fn with_signal(self, signal: Signal) -> Self {
        self.with_header(SIGNAL, signal.as_header())
    }

    /// Set the payload
    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    /// Route qualifier
    pub fn qualifier(&self) -> Option<&str> {
        self.qualifier.as_deref()
    }

    /// Header value
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// All headers
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Payload, if any
    pub fn payload(&self) -> Option<&Bytes> {
        self.payload.as_ref()
    }

    /// Move the payload out of the envelope
    pub fn take_payload(&mut self) -> Option<Bytes> {
        self.payload.take()
    }

    /// Consume the envelope, keeping only the payload
    pub fn into_payload(self) -> Option<Bytes> {
        self.payload
    }

    /// Parsed `sid` header. `Ok(None)` when the header is absent.
    pub fn stream_id(&self) -> Result<Option<StreamId>, ProtocolError> {
        self.header(STREAM_ID).map(parse_stream_id).transpose()
    }

    /// Parsed `sig` header. `Ok(None)` marks a data envelope.
    pub fn signal(&self) -> Result<Option<Signal>, ProtocolError> {
        self.header(SIGNAL).map(Signal::from_header).transpose()
    }

    /// Release the envelope and its payload.
    ///
    /// Called by whichever component last observes an envelope without
    /// forwarding it.
    pub fn release(self) {
        if let Some(payload) = &self.payload {
            trace!("Releasing payload of {} bytes", payload.len());
        }
        drop(self);
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Envelope{{qualifier={:?}, headers={:?}", self.qualifier, self.headers)?;
        match &self.payload {
            Some(payload) => write!(f, ", payload={} bytes}}", payload.len()),
            None => write!(f, ", payload=none}}"),
        }
    }
}

/// Parse a 63-bit non-negative stream identifier
pub fn parse_stream_id(value: &str) -> Result<StreamId, ProtocolError> {
    match value.trim().parse::<i64>() {
        Ok(id) if id >= 0 => Ok(id as StreamId),
        _ => Err(ProtocolError::InvalidStreamId(value.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_request_envelope() {
        let envelope = Envelope::request("greeting/one", 1, "hello");

        assert_eq!(envelope.qualifier(), Some("greeting/one"));
        assert_eq!(envelope.stream_id().unwrap(), Some(1));
        assert_eq!(envelope.signal().unwrap(), None);
        assert_eq!(envelope.payload(), Some(&Bytes::from("hello")));
    }

    #[test]
    fn test_complete_envelope() {
        let envelope = Envelope::complete(7);
        assert_eq!(envelope.header(SIGNAL), Some("1"));
        assert_eq!(envelope.signal().unwrap(), Some(Signal::Complete));
        assert!(envelope.payload().is_none());
    }

    #[test]
    fn test_error_envelope() {
        let envelope = Envelope::error(7, Bytes::from("err"));
        assert_eq!(envelope.header(SIGNAL), Some("2"));
        assert_eq!(envelope.signal().unwrap(), Some(Signal::Error));
        assert_eq!(envelope.payload(), Some(&Bytes::from("err")));
    }

    #[test]
    fn test_missing_stream_id() {
        let envelope = Envelope::new().with_payload("orphan");
        assert_eq!(envelope.stream_id().unwrap(), None);
    }

    #[test]
    fn test_invalid_stream_ids() {
        for bad in ["-1", "abc", "", "9223372036854775808"] {
            let envelope = Envelope::new().with_header(STREAM_ID, bad);
            assert!(
                matches!(envelope.stream_id(), Err(ProtocolError::InvalidStreamId(_))),
                "accepted {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_max_stream_id_accepted() {
        let envelope = Envelope::data(MAX_STREAM_ID, "x");
        assert_eq!(envelope.stream_id().unwrap(), Some(MAX_STREAM_ID));
    }

    #[test]
    fn test_signal_parsing() {
        assert_eq!(Signal::from_header("1").unwrap(), Signal::Complete);
        assert_eq!(Signal::from_header("ERROR").unwrap(), Signal::Error);
        assert!(matches!(
            Signal::from_header("3"),
            Err(ProtocolError::UnknownSignal(v)) if v == "3"
        ));
    }

    #[test]
    fn test_header_replaced_not_duplicated() {
        let envelope = Envelope::data(1, "x").with_stream_id(2);
        assert_eq!(envelope.headers().len(), 1);
        assert_eq!(envelope.stream_id().unwrap(), Some(2));
    }

    #[test]
    fn test_take_payload() {
        let mut envelope = Envelope::data(1, "abc");
        assert_eq!(envelope.take_payload(), Some(Bytes::from("abc")));
        assert!(envelope.payload().is_none());
    }

    #[test]
    fn test_display_hides_payload_bytes() {
        let shown = Envelope::data(3, "secret").to_string();
        assert!(shown.contains("payload=6 bytes"));
        assert!(!shown.contains("secret"));
    }

    proptest! {
        #[test]
        fn test_stream_id_header_roundtrip(id in 0..=MAX_STREAM_ID) {
            let envelope = Envelope::data(id, "x");
            prop_assert_eq!(envelope.stream_id().unwrap(), Some(id));
        }
    }
}
