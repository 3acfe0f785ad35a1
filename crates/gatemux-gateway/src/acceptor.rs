//! Gateway acceptor dispatching requests of one connection to service handlers

use crate::handler::{HandlerRegistry, ServiceHandler};
use crate::session::{DefaultSessionHandler, GatewaySession, GatewaySessionHandler};
use crate::{GatewayError, Result};
use futures::{FutureExt, StreamExt};
use gatemux_proto::{
    default_codec, DefaultErrorMapper, Envelope, EnvelopeCodec, EnvelopeWriter, ErrorMapper,
    FrameCodec, ProtocolError, ServiceError, StreamId, MAX_FRAME_SIZE,
};
use std::any::Any;
use std::collections::HashSet;
use std::error::Error as StdError;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

/// Acceptor configuration
#[derive(Clone)]
pub struct AcceptorConfig {
    /// Codec for envelopes and error data
    pub codec: Arc<dyn EnvelopeCodec>,
    /// Mapping from handler failures to wire error data
    pub error_mapper: Arc<dyn ErrorMapper>,
    /// Largest frame accepted or written
    pub max_frame_size: usize,
}

impl Default for AcceptorConfig {
    fn default() -> Self {
        Self {
            codec: default_codec(),
            error_mapper: Arc::new(DefaultErrorMapper),
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl fmt::Debug for AcceptorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcceptorConfig")
            .field("codec", &self.codec)
            .field("max_frame_size", &self.max_frame_size)
            .finish_non_exhaustive()
    }
}

/// Builder for a [`GatewayAcceptor`]
pub struct AcceptorBuilder {
    config: AcceptorConfig,
    registry: HandlerRegistry,
    session_handler: Arc<dyn GatewaySessionHandler>,
}

impl Default for AcceptorBuilder {
    fn default() -> Self {
        Self {
            config: AcceptorConfig::default(),
            registry: HandlerRegistry::new(),
            session_handler: Arc::new(DefaultSessionHandler),
        }
    }
}

impl AcceptorBuilder {
    /// Create a new acceptor builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the envelope codec
    pub fn with_codec(mut self, codec: Arc<dyn EnvelopeCodec>) -> Self {
        self.config.codec = codec;
        self
    }

    /// Set the error mapper
    pub fn with_error_mapper(mut self, error_mapper: Arc<dyn ErrorMapper>) -> Self {
        self.config.error_mapper = error_mapper;
        self
    }

    /// Set the maximum frame size
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.config.max_frame_size = max_frame_size;
        self
    }

    /// Register a handler for a qualifier
    pub fn with_handler<H>(mut self, qualifier: impl Into<String>, handler: H) -> Self
    where
        H: ServiceHandler + 'static,
    {
        self.registry.register(qualifier, handler);
        self
    }

    /// Replace the handler registry
    pub fn with_registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Set the session lifecycle hooks
    pub fn with_session_handler<H>(mut self, session_handler: H) -> Self
    where
        H: GatewaySessionHandler + 'static,
    {
        self.session_handler = Arc::new(session_handler);
        self
    }

    /// Build the acceptor configuration
    pub fn build_config(&self) -> AcceptorConfig {
        self.config.clone()
    }

    /// Build the acceptor
    pub fn build(self) -> GatewayAcceptor {
        GatewayAcceptor {
            inner: Arc::new(AcceptorInner {
                config: self.config,
                registry: self.registry,
                session_handler: self.session_handler,
                next_session_id: AtomicU64::new(1),
            }),
        }
    }
}

/// Server side of the protocol.
///
/// Each accepted connection gets its own session: requests are read in order
/// and every request runs its handler in a separate task, so a slow or failing
/// handler only affects its own stream id.
#[derive(Clone)]
pub struct GatewayAcceptor {
    inner: Arc<AcceptorInner>,
}

struct AcceptorInner {
    config: AcceptorConfig,
    registry: HandlerRegistry,
    session_handler: Arc<dyn GatewaySessionHandler>,
    next_session_id: AtomicU64,
}

impl fmt::Debug for GatewayAcceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayAcceptor")
            .field("config", &self.inner.config)
            .field("registry", &self.inner.registry)
            .finish_non_exhaustive()
    }
}

impl GatewayAcceptor {
    /// Create an acceptor with default configuration serving `registry`
    pub fn new(registry: HandlerRegistry) -> Self {
        AcceptorBuilder::new().with_registry(registry).build()
    }

    /// Create an acceptor builder
    pub fn builder() -> AcceptorBuilder {
        AcceptorBuilder::new()
    }

    /// Registered handlers
    pub fn registry(&self) -> &HandlerRegistry {
        &self.inner.registry
    }

    /// Serve one connection until it ends
    pub async fn accept<T>(&self, io: T) -> Result<()>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        self.accept_split(reader, writer).await
    }

    /// Serve one connection given as separate read and write halves.
    ///
    /// Returns `Ok(())` when the peer closes the connection. Either way the
    /// session-close hook has run by the time this returns.
    pub async fn accept_split<R, W>(&self, reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let session_id = self.inner.next_session_id.fetch_add(1, Ordering::Relaxed);
        let span = info_span!("gateway_session", session_id);
        let session = Arc::new(GatewaySession::new(session_id, span.clone()));

        let config = &self.inner.config;
        let mut connection = Connection {
            shared: Arc::new(Shared {
                session: Arc::clone(&session),
                writer: EnvelopeWriter::new(writer, Arc::clone(&config.codec), config.max_frame_size),
                error_mapper: Arc::clone(&config.error_mapper),
                in_flight: Mutex::new(HashSet::new()),
            }),
            acceptor: Arc::clone(&self.inner),
            tasks: JoinSet::new(),
        };
        let hooks = Arc::clone(&self.inner.session_handler);

        async move {
            info!("Session opened");
            let result = match hooks.on_session_open(&session).await {
                Ok(()) => connection.serve(reader).await,
                Err(e) => {
                    warn!("Session rejected: {:#}", e);
                    Err(GatewayError::Rejected(e))
                }
            };

            connection.shutdown().await;
            hooks.on_session_close(&session).await;
            info!("Session closed");
            result
        }
        .instrument(span)
        .await
    }
}

/// Per-connection read side; owns the handler tasks
struct Connection {
    shared: Arc<Shared>,
    acceptor: Arc<AcceptorInner>,
    tasks: JoinSet<()>,
}

impl Connection {
    async fn serve<R>(&mut self, mut reader: R) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut frames = FrameCodec::with_max_frame_size(self.acceptor.config.max_frame_size);

        loop {
            tokio::select! {
                frame = frames.read_frame(&mut reader) => {
                    match frame {
                        Ok(Some(frame)) => self.handle_frame(&frame).await,
                        Ok(None) => {
                            debug!("Connection closed by peer");
                            return Ok(());
                        }
                        Err(ProtocolError::FrameTooLarge { size, max }) => {
                            warn!("Skipping frame of {} bytes (max: {})", size, max);
                        }
                        Err(e) => {
                            error!("Failed to read frame: {}", e);
                            return Err(e.into());
                        }
                    }
                }

                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(e) = joined {
                        warn!("Handler task ended abnormally: {}", e);
                    }
                }
            }
        }
    }

    async fn handle_frame(&mut self, frame: &[u8]) {
        let envelope = match self.shared.writer.codec().decode(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping undecodable frame: {}", e);
                return;
            }
        };

        let stream_id = match envelope.stream_id() {
            Ok(Some(id)) => id,
            Ok(None) => {
                warn!("Dropping request without stream id: {}", envelope);
                envelope.release();
                return;
            }
            Err(e) => {
                warn!("Dropping request: {}", e);
                envelope.release();
                return;
            }
        };

        match envelope.signal() {
            Ok(None) => {}
            Ok(Some(signal)) => {
                debug!("Ignoring {} signal on stream id {}", signal, stream_id);
                envelope.release();
                return;
            }
            Err(e) => {
                warn!("Ignoring envelope on stream id {}: {}", stream_id, e);
                envelope.release();
                return;
            }
        }

        let Some(qualifier) = envelope.qualifier().map(str::to_owned) else {
            envelope.release();
            self.shared
                .reply_error(stream_id, &ServiceError::bad_request("qualifier is missing"))
                .await;
            return;
        };

        if self.shared.is_in_flight(stream_id) {
            envelope.release();
            let error = ServiceError::bad_request(format!("sid={} is already registered", stream_id));
            self.shared.reply_error(stream_id, &error).await;
            return;
        }

        let Some(handler) = self.acceptor.registry.lookup(&qualifier) else {
            envelope.release();
            let error = ServiceError::service_unavailable(format!("No handler found for qualifier: {}", qualifier));
            self.shared.reply_error(stream_id, &error).await;
            return;
        };

        let request = self
            .acceptor
            .session_handler
            .map_message(&self.shared.session, envelope);

        debug!("Dispatching stream id {} to {}", stream_id, qualifier);
        self.shared.begin(stream_id);
        let shared = Arc::clone(&self.shared);
        self.tasks
            .spawn(shared.respond(handler, request, stream_id).instrument(Span::current()));
    }

    /// Abort handlers still running and close the write half
    async fn shutdown(&mut self) {
        if !self.tasks.is_empty() {
            debug!("Aborting {} in-flight handlers", self.tasks.len());
        }
        self.tasks.shutdown().await;

        if let Err(e) = self.shared.writer.shutdown().await {
            debug!("Failed to shut down writer: {}", e);
        }
    }
}

/// How a handler's response stream ended
enum Outcome {
    Completed,
    Failed(anyhow::Error),
    Disconnected(ProtocolError),
}

/// State shared between the read side and the handler tasks
struct Shared {
    session: Arc<GatewaySession>,
    writer: EnvelopeWriter,
    error_mapper: Arc<dyn ErrorMapper>,
    /// Stream ids whose handler has not written its terminal envelope yet
    in_flight: Mutex<HashSet<StreamId>>,
}

impl Shared {
    fn in_flight(&self) -> MutexGuard<'_, HashSet<StreamId>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_in_flight(&self, stream_id: StreamId) -> bool {
        self.in_flight().contains(&stream_id)
    }

    fn begin(&self, stream_id: StreamId) {
        self.in_flight().insert(stream_id);
    }

    fn finish(&self, stream_id: StreamId) {
        self.in_flight().remove(&stream_id);
    }

    async fn respond(self: Arc<Self>, handler: Arc<dyn ServiceHandler>, request: Envelope, stream_id: StreamId) {
        let outcome = AssertUnwindSafe(self.stream_responses(handler.as_ref(), request, stream_id))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Outcome::Failed(anyhow::anyhow!("Handler panicked: {}", panic_message(panic.as_ref())))
            });

        // The sid may be reused as soon as the client sees the terminal
        self.finish(stream_id);

        match outcome {
            Outcome::Completed => {
                match self.writer.write_envelope(&Envelope::complete(stream_id)).await {
                    Ok(()) => debug!("Completed stream id {}", stream_id),
                    Err(e) => warn!("Failed to complete stream id {}: {}", stream_id, e),
                }
            }
            Outcome::Failed(e) => {
                warn!("Handler for stream id {} failed: {:#}", stream_id, e);
                self.reply_error(stream_id, &*e).await;
            }
            Outcome::Disconnected(e) => {
                warn!("Failed to write response on stream id {}: {}", stream_id, e);
            }
        }
    }

    async fn stream_responses(&self, handler: &dyn ServiceHandler, request: Envelope, stream_id: StreamId) -> Outcome {
        let mut responses = match handler.handle(&self.session, request).await {
            Ok(responses) => responses,
            Err(e) => return Outcome::Failed(e),
        };

        while let Some(item) = responses.next().await {
            let envelope = match item {
                Ok(envelope) => envelope.with_stream_id(stream_id),
                Err(e) => return Outcome::Failed(e),
            };

            match self.writer.write_envelope(&envelope).await {
                Ok(()) => {}
                Err(e @ ProtocolError::Io(_)) => return Outcome::Disconnected(e),
                Err(e) => return Outcome::Failed(e.into()),
            }
        }

        Outcome::Completed
    }

    async fn reply_error(&self, stream_id: StreamId, error: &(dyn StdError + Send + Sync + 'static)) {
        let data = self.error_mapper.to_error_data(error);
        let body = match self.writer.codec().encode_error_data(&data) {
            Ok(body) => body,
            Err(e) => {
                error!("Failed to encode error data for stream id {}: {}", stream_id, e);
                return;
            }
        };

        debug!("Replying error {} on stream id {}: {}", data.code, stream_id, data.message);
        if let Err(e) = self.writer.write_envelope(&Envelope::error(stream_id, body)).await {
            warn!("Failed to write error on stream id {}: {}", stream_id, e);
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message() {
        let from_str: Box<dyn Any + Send> = Box::new("static message");
        let from_string: Box<dyn Any + Send> = Box::new(String::from("owned message"));
        let other: Box<dyn Any + Send> = Box::new(42u32);

        assert_eq!(panic_message(from_str.as_ref()), "static message");
        assert_eq!(panic_message(from_string.as_ref()), "owned message");
        assert_eq!(panic_message(other.as_ref()), "unknown panic");
    }

    #[test]
    fn test_builder_configuration() {
        let builder = GatewayAcceptor::builder()
            .with_max_frame_size(2048)
            .with_handler("noop", crate::handler::service_fn(|_| async { Ok(crate::handler::empty()) }));

        assert_eq!(builder.build_config().max_frame_size, 2048);

        let acceptor = builder.build();
        assert!(acceptor.registry().lookup("noop").is_some());
    }
}
