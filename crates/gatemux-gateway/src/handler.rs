//! Service handlers and the qualifier registry

use crate::session::GatewaySession;
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use gatemux_proto::Envelope;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

/// Response envelopes of one request.
///
/// The acceptor stamps the request's stream id on every item. An `Err` item
/// ends the exchange with an error signal.
pub type ResponseStream = BoxStream<'static, Result<Envelope>>;

/// Handler trait for processing requests routed by qualifier
#[async_trait]
pub trait ServiceHandler: Send + Sync {
    /// Handle a request and return the stream of its responses
    async fn handle(&self, session: &GatewaySession, request: Envelope) -> Result<ResponseStream>;
}

/// A single response envelope carrying `payload`
pub fn unary(payload: impl Into<Bytes>) -> ResponseStream {
    let envelope = Envelope::new().with_payload(payload);
    stream::once(async move { Ok(envelope) }).boxed()
}

/// No response data; the exchange completes immediately
pub fn empty() -> ResponseStream {
    stream::empty().boxed()
}

/// One response envelope per payload, in order
pub fn iter<I>(payloads: I) -> ResponseStream
where
    I: IntoIterator + Send + 'static,
    I::IntoIter: Send + 'static,
    I::Item: Into<Bytes>,
{
    stream::iter(payloads)
        .map(|payload| Ok(Envelope::new().with_payload(payload)))
        .boxed()
}

/// Handler built from an async closure
pub struct ServiceFn<F> {
    f: F,
}

/// Wrap an async closure taking the request envelope as a [`ServiceHandler`]
pub fn service_fn<F, Fut>(f: F) -> ServiceFn<F>
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ResponseStream>> + Send + 'static,
{
    ServiceFn { f }
}

#[async_trait]
impl<F, Fut> ServiceHandler for ServiceFn<F>
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ResponseStream>> + Send + 'static,
{
    async fn handle(&self, _session: &GatewaySession, request: Envelope) -> Result<ResponseStream> {
        (self.f)(request).await
    }
}

/// Registered handlers by qualifier
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn ServiceHandler>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}

impl HandlerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a qualifier, replacing any previous one
    pub fn register<H>(&mut self, qualifier: impl Into<String>, handler: H) -> &mut Self
    where
        H: ServiceHandler + 'static,
    {
        let qualifier = qualifier.into();
        debug!("Registered handler for qualifier: {}", qualifier);
        self.handlers.insert(qualifier, Arc::new(handler));
        self
    }

    /// Builder-style [`register`](Self::register)
    pub fn with_handler<H>(mut self, qualifier: impl Into<String>, handler: H) -> Self
    where
        H: ServiceHandler + 'static,
    {
        self.register(qualifier, handler);
        self
    }

    /// Handler for `qualifier`
    pub fn lookup(&self, qualifier: &str) -> Option<Arc<dyn ServiceHandler>> {
        self.handlers.get(qualifier).cloned()
    }

    /// Registered qualifiers
    pub fn qualifiers(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Number of registered handlers
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handler is registered
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::Span;

    fn echo() -> impl ServiceHandler {
        service_fn(|request: Envelope| async move {
            let payload = request.into_payload().unwrap_or_default();
            Ok(unary(payload))
        })
    }

    #[tokio::test]
    async fn test_registry_lookup() {
        let registry = HandlerRegistry::new().with_handler("echo", echo());

        assert_eq!(registry.len(), 1);
        assert!(registry.lookup("echo").is_some());
        assert!(registry.lookup("missing").is_none());
        assert_eq!(registry.qualifiers().collect::<Vec<_>>(), vec!["echo"]);
    }

    #[tokio::test]
    async fn test_service_fn_invocation() {
        let registry = HandlerRegistry::new().with_handler("echo", echo());
        let session = GatewaySession::new(1, Span::none());

        let handler = registry.lookup("echo").unwrap();
        let responses: Vec<_> = handler
            .handle(&session, Envelope::request("echo", 1, "ping"))
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(responses.len(), 1);
        let envelope = responses.into_iter().next().unwrap().unwrap();
        assert_eq!(envelope.payload(), Some(&Bytes::from("ping")));
    }

    #[tokio::test]
    async fn test_response_helpers() {
        assert_eq!(empty().count().await, 0);

        let payloads: Vec<Bytes> = iter(vec!["a", "b", "c"])
            .map(|item| item.unwrap().into_payload().unwrap())
            .collect()
            .await;
        assert_eq!(payloads, vec![Bytes::from("a"), Bytes::from("b"), Bytes::from("c")]);
    }
}
