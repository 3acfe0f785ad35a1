//! Gateway sessions and their lifecycle hooks

use anyhow::Result;
use async_trait::async_trait;
use gatemux_proto::Envelope;
use tracing::Span;

/// One accepted connection, as seen by hooks and handlers
#[derive(Debug, Clone)]
pub struct GatewaySession {
    session_id: u64,
    span: Span,
}

impl GatewaySession {
    /// Create a session record
    pub fn new(session_id: u64, span: Span) -> Self {
        Self { session_id, span }
    }

    /// Identifier unique within the acceptor
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Span every log line of this session is recorded in
    pub fn span(&self) -> &Span {
        &self.span
    }
}

/// Hooks around the lifetime of a gateway session.
///
/// `on_session_open` runs once before the first request is read. If it fails
/// the connection is refused. `on_session_close` runs once after the
/// connection ended, however it ended.
#[async_trait]
pub trait GatewaySessionHandler: Send + Sync {
    /// Called when a connection is accepted
    async fn on_session_open(&self, _session: &GatewaySession) -> Result<()> {
        Ok(())
    }

    /// Called when the connection is gone
    async fn on_session_close(&self, _session: &GatewaySession) {}

    /// Enrich a request before it is handed to its handler
    fn map_message(&self, _session: &GatewaySession, request: Envelope) -> Envelope {
        request
    }
}

/// Session handler with no-op hooks
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultSessionHandler;

impl GatewaySessionHandler for DefaultSessionHandler {}
