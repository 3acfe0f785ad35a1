//! Session management and inbound dispatch

use crate::{Result, SessionError};
use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use gatemux_proto::{
    default_codec, DefaultErrorMapper, Envelope, EnvelopeCodec, EnvelopeWriter, ErrorMapper,
    FrameCodec, PendingExchange, ProtocolError, ServiceError, Signal, StreamError, StreamEvent,
    StreamId, StreamTable, MAX_FRAME_SIZE, MAX_STREAM_ID,
};
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, error, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

/// Session configuration
#[derive(Clone)]
pub struct SessionConfig {
    /// Codec for envelopes and error data
    pub codec: Arc<dyn EnvelopeCodec>,
    /// Mapping from wire error data to typed failures
    pub error_mapper: Arc<dyn ErrorMapper>,
    /// Largest frame accepted or written
    pub max_frame_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            codec: default_codec(),
            error_mapper: Arc::new(DefaultErrorMapper),
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("codec", &self.codec)
            .field("max_frame_size", &self.max_frame_size)
            .finish_non_exhaustive()
    }
}

/// Session status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Session is reading and writing
    Active,
    /// Close was requested, disposal pending
    Closing,
    /// Connection is gone and every pending exchange has been failed
    Closed,
}

/// Session builder for configuring connections
#[derive(Debug, Default)]
pub struct SessionBuilder {
    config: SessionConfig,
    span: Option<Span>,
}

impl SessionBuilder {
    /// Create a new session builder
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

    /// Run the session inside `span` instead of a fresh `session` span
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    /// Build the session configuration
    pub fn build_config(&self) -> SessionConfig {
        self.config.clone()
    }

    /// Start a session over a bidirectional connection.
    ///
    /// Must be called within a tokio runtime; the inbound dispatch loop is
    /// spawned immediately.
    pub fn connect<T>(self, io: T) -> Session
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        self.connect_split(reader, writer)
    }

    /// Start a session over separate read and write halves
    pub fn connect_split<R, W>(self, reader: R, writer: W) -> Session
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let id = Uuid::new_v4();
        let span = self.span.unwrap_or_else(|| info_span!("session", %id));
        let SessionConfig {
            codec,
            error_mapper,
            max_frame_size,
        } = self.config;

        let (status, _) = watch::channel(SessionStatus::Active);
        let inner = Arc::new(SessionInner {
            id,
            table: Arc::new(StreamTable::new()),
            writer: EnvelopeWriter::new(writer, codec, max_frame_size),
            error_mapper,
            status,
            shutdown: Notify::new(),
            next_stream_id: AtomicU64::new(1),
            span: span.clone(),
        });

        let frames = FrameCodec::with_max_frame_size(max_frame_size);
        tokio::spawn(Arc::clone(&inner).run(reader, frames).instrument(span.clone()));
        span.in_scope(|| info!("Session started"));

        Session { inner }
    }
}

/// Client session owning one connection, its stream table and its writer.
///
/// Cloning is cheap; all clones drive the same connection. The connection
/// stays open until [`Session::close`] is called or the peer goes away.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("status", &self.status())
            .field("pending", &self.inner.table.len())
            .finish()
    }
}

impl Session {
    /// Start a session with the default configuration
    pub fn new<T>(io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        SessionBuilder::new().connect(io)
    }

    /// Create a session builder
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    /// Session ID used in traces
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Current session status
    pub fn status(&self) -> SessionStatus {
        *self.inner.status.borrow()
    }

    /// Number of exchanges not yet consumed to their end
    pub fn pending_exchanges(&self) -> usize {
        self.inner.table.len()
    }

    /// Allocate the next unused stream id of this session
    pub fn next_stream_id(&self) -> StreamId {
        self.inner.next_stream_id.fetch_add(1, Ordering::Relaxed) & MAX_STREAM_ID
    }

    /// Send an envelope on `stream_id`, registering the exchange first.
    ///
    /// Returns once the frame has been handed to the transport. A write
    /// failure also terminates the exchange for its consumer.
    pub async fn send(&self, envelope: Envelope, stream_id: StreamId) -> Result<()> {
        let inner = &self.inner;
        async move {
            let body = inner.encode(envelope, stream_id)?;
            let exchange = inner.table.register(stream_id)?;
            inner.write(&exchange, &body).await
        }
        .instrument(inner.span.clone())
        .await
    }

    /// Send every envelope of `envelopes` on `stream_id`, in order
    pub async fn send_many<S>(&self, envelopes: S, stream_id: StreamId) -> Result<()>
    where
        S: Stream<Item = Envelope> + Send,
    {
        let inner = &self.inner;
        async move {
            check_stream_id(stream_id)?;
            let exchange = inner.table.register(stream_id)?;
            inner.write_all(&exchange, envelopes).await
        }
        .instrument(inner.span.clone())
        .await
    }

    /// Consume the responses of the exchange on `stream_id`.
    ///
    /// Responses that arrived before this call are buffered, including the
    /// terminal: an exchange that already ended, or was failed when the
    /// connection closed, still replays in full to its first consumer.
    /// Fails with [`SessionError::IllegalState`] if nothing is registered for
    /// the id, or if the exchange already has a consumer.
    pub fn receive(&self, stream_id: StreamId) -> Result<ExchangeStream> {
        let exchange = self.inner.table.lookup(stream_id).ok_or_else(|| {
            SessionError::IllegalState(format!("No exchange registered for stream id {}", stream_id))
        })?;
        self.inner.subscribe(exchange)
    }

    /// Send a request and wait for its first response envelope.
    ///
    /// `Ok(None)` means the peer completed without sending data.
    pub async fn request_one(&self, envelope: Envelope, stream_id: StreamId) -> Result<Option<Envelope>> {
        let mut responses = self.request_stream(envelope, stream_id).await?;
        responses.next().await.transpose()
    }

    /// Send a request and return the stream of its responses.
    ///
    /// The consumer is attached before the request is written, so no response
    /// can be missed.
    pub async fn request_stream(&self, envelope: Envelope, stream_id: StreamId) -> Result<ExchangeStream> {
        let inner = &self.inner;
        async move {
            let body = inner.encode(envelope, stream_id)?;
            let exchange = inner.table.register(stream_id)?;
            let responses = inner.subscribe(Arc::clone(&exchange))?;
            inner.write(&exchange, &body).await?;
            Ok(responses)
        }
        .instrument(inner.span.clone())
        .await
    }

    /// Stream requests and responses on `stream_id` concurrently.
    ///
    /// The outbound envelopes are written by a background task, which stops
    /// once the exchange terminates.
    pub fn request_channel<S>(&self, envelopes: S, stream_id: StreamId) -> Result<ExchangeStream>
    where
        S: Stream<Item = Envelope> + Send + 'static,
    {
        check_stream_id(stream_id)?;
        let exchange = self.inner.table.register(stream_id)?;
        let responses = self.inner.subscribe(Arc::clone(&exchange))?;

        let inner = Arc::clone(&self.inner);
        tokio::spawn(
            async move {
                if let Err(e) = inner.write_all(&exchange, envelopes).await {
                    debug!("Outbound stream for stream id {} ended: {}", stream_id, e);
                }
            }
            .instrument(self.inner.span.clone()),
        );

        Ok(responses)
    }

    /// Close the session.
    ///
    /// Stops the dispatch loop, fails every pending exchange with a
    /// connection-closed error and shuts down the write half.
    pub async fn close(&self) {
        let requested = self.inner.status.send_if_modified(|status| {
            if *status == SessionStatus::Active {
                *status = SessionStatus::Closing;
                true
            } else {
                false
            }
        });

        if requested {
            self.inner.span.in_scope(|| info!("Closing session"));
            self.inner.shutdown.notify_one();
        }

        self.on_close().await;

        if requested {
            if let Err(e) = self.inner.writer.shutdown().await {
                self.inner.span.in_scope(|| debug!("Failed to shut down writer: {}", e));
            }
        }
    }

    /// Wait until the session is closed
    pub async fn on_close(&self) {
        let mut status = self.inner.status.subscribe();
        // The sender lives as long as `self`
        let _ = status.wait_for(|s| *s == SessionStatus::Closed).await;
    }
}

struct SessionInner {
    id: Uuid,
    table: Arc<StreamTable>,
    writer: EnvelopeWriter,
    error_mapper: Arc<dyn ErrorMapper>,
    status: watch::Sender<SessionStatus>,
    shutdown: Notify,
    next_stream_id: AtomicU64,
    span: Span,
}

impl SessionInner {
    fn encode(&self, envelope: Envelope, stream_id: StreamId) -> Result<Bytes> {
        check_stream_id(stream_id)?;
        Ok(self.writer.encode(&envelope.with_stream_id(stream_id))?)
    }

    fn subscribe(&self, exchange: Arc<PendingExchange>) -> Result<ExchangeStream> {
        let receiver = exchange.take_receiver().ok_or_else(|| {
            SessionError::IllegalState(format!(
                "Stream id {} is already being consumed",
                exchange.stream_id()
            ))
        })?;
        Ok(ExchangeStream {
            exchange,
            receiver,
            table: Arc::clone(&self.table),
            finished: false,
        })
    }

    async fn write(&self, exchange: &Arc<PendingExchange>, body: &[u8]) -> Result<()> {
        if let Err(e) = self.writer.write_encoded(body).await {
            let error = StreamError::from(e);
            warn!("Failed to write to stream id {}: {}", exchange.stream_id(), error);
            self.terminate(exchange, error.clone());
            return Err(error.into());
        }
        Ok(())
    }

    async fn write_all<S>(&self, exchange: &Arc<PendingExchange>, envelopes: S) -> Result<()>
    where
        S: Stream<Item = Envelope> + Send,
    {
        let stream_id = exchange.stream_id();
        futures::pin_mut!(envelopes);

        while let Some(envelope) = envelopes.next().await {
            if exchange.is_terminated() {
                debug!("Stream id {} terminated, dropping remaining outbound envelopes", stream_id);
                envelope.release();
                break;
            }
            let body = match self.encode(envelope, stream_id) {
                Ok(body) => body,
                Err(e) => {
                    self.terminate(exchange, StreamError::Protocol(e.to_string()));
                    return Err(e);
                }
            };
            self.write(exchange, &body).await?;
        }
        Ok(())
    }

    fn terminate(&self, exchange: &Arc<PendingExchange>, error: StreamError) {
        exchange.fail(error);
        self.table.retire(exchange.stream_id(), exchange);
    }

    async fn run<R>(self: Arc<Self>, mut reader: R, mut frames: FrameCodec)
    where
        R: AsyncRead + Unpin,
    {
        debug!("Starting dispatch loop");

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    debug!("Dispatch loop stopped by close");
                    break;
                }

                frame = frames.read_frame(&mut reader) => {
                    match frame {
                        Ok(Some(frame)) => self.dispatch_frame(&frame),
                        Ok(None) => {
                            debug!("Connection closed by peer");
                            break;
                        }
                        Err(ProtocolError::FrameTooLarge { size, max }) => {
                            warn!("Skipping frame of {} bytes (max: {})", size, max);
                        }
                        Err(e) => {
                            error!("Failed to read frame: {}", e);
                            break;
                        }
                    }
                }
            }
        }

        self.dispose();
    }

    fn dispatch_frame(&self, frame: &[u8]) {
        match self.writer.codec().decode(frame) {
            Ok(envelope) => self.dispatch(envelope),
            Err(e) => warn!("Dropping undecodable frame: {}", e),
        }
    }

    /// Route one inbound envelope to its exchange
    pub(crate) fn dispatch(&self, envelope: Envelope) {
        let stream_id = match envelope.stream_id() {
            Ok(Some(id)) => id,
            Ok(None) => {
                warn!("Dropping envelope without stream id: {}", envelope);
                envelope.release();
                return;
            }
            Err(e) => {
                warn!("Dropping envelope: {}", e);
                envelope.release();
                return;
            }
        };

        let Some(exchange) = self.table.lookup(stream_id) else {
            debug!("Dropping envelope for unknown stream id {}", stream_id);
            envelope.release();
            return;
        };

        match envelope.signal() {
            Ok(None) => {
                if let Err(late) = exchange.deliver(envelope) {
                    debug!("Dropping envelope for terminated stream id {}", stream_id);
                    late.release();
                }
            }
            Ok(Some(Signal::Complete)) => {
                exchange.complete();
                self.table.retire(stream_id, &exchange);
                envelope.release();
            }
            Ok(Some(Signal::Error)) => {
                let error = self.decode_error(envelope);
                debug!("Stream id {} failed: {}", stream_id, error);
                self.terminate(&exchange, error);
            }
            Err(e) => {
                warn!("Failing stream id {}: {}", stream_id, e);
                self.terminate(&exchange, e.into());
                envelope.release();
            }
        }
    }

    fn decode_error(&self, envelope: Envelope) -> StreamError {
        let Some(payload) = envelope.into_payload() else {
            return ServiceError::internal(ServiceError::INTERNAL, "error signal without error data").into();
        };

        match self.writer.codec().decode_error_data(&payload) {
            Ok(data) => self.error_mapper.to_error(data).into(),
            Err(e) => StreamError::Protocol(format!("Undecodable error data: {}", e)),
        }
    }

    fn dispose(&self) {
        let pending = self.table.drain_all();
        let failed = pending
            .iter()
            .filter(|exchange| exchange.fail(StreamError::ConnectionClosed))
            .count();

        self.status.send_replace(SessionStatus::Closed);
        info!("Session closed, {} pending exchanges failed", failed);
    }
}

fn check_stream_id(stream_id: StreamId) -> Result<()> {
    if stream_id > MAX_STREAM_ID {
        return Err(SessionError::InvalidStreamId(stream_id));
    }
    Ok(())
}

/// Responses of one exchange, ending with its completion or failure.
///
/// Dropping the stream before it ends cancels the exchange locally: later
/// frames for its stream id are discarded. Nothing is sent to the peer.
#[derive(Debug)]
pub struct ExchangeStream {
    exchange: Arc<PendingExchange>,
    receiver: mpsc::UnboundedReceiver<StreamEvent>,
    table: Arc<StreamTable>,
    finished: bool,
}

impl ExchangeStream {
    /// Stream id of the exchange
    pub fn stream_id(&self) -> StreamId {
        self.exchange.stream_id()
    }

    fn finish(&mut self) {
        self.finished = true;
        self.table.remove_exchange(self.exchange.stream_id(), &self.exchange);
    }
}

impl Stream for ExchangeStream {
    type Item = Result<Envelope>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }

        match self.receiver.poll_recv(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(StreamEvent::Data(envelope))) => Poll::Ready(Some(Ok(envelope))),
            Poll::Ready(Some(StreamEvent::Errored(error))) => {
                self.finish();
                Poll::Ready(Some(Err(error.into())))
            }
            Poll::Ready(Some(StreamEvent::Completed)) | Poll::Ready(None) => {
                self.finish();
                Poll::Ready(None)
            }
        }
    }
}

impl Drop for ExchangeStream {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if self.exchange.cancel() {
            debug!("Cancelled exchange on stream id {}", self.exchange.stream_id());
        }
        self.table.remove_exchange(self.exchange.stream_id(), &self.exchange);
    }
}
