//! Transport abstraction for Parley.
//!
//! Exactly one transport runs per server instance. Each one accepts raw
//! connections, feeds them through the shared [`parley_core::Gateway`], and
//! hands the gateway a [`parley_core::Socket`] for writing back.

use async_trait::async_trait;
use parley_protocol::ProtocolError;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The peer did not complete the handshake in time.
    #[error("Handshake timed out")]
    Timeout,

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A transport adapter.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport name (e.g. "websocket", "tcp").
    fn name(&self) -> &'static str;

    /// Serve peers until a fatal error.
    ///
    /// `http` and `api` are the HTTP listener and the discovery routes; every
    /// transport keeps them served, whether or not it rides on HTTP itself.
    async fn serve(
        self: Arc<Self>,
        http: TcpListener,
        api: axum::Router,
    ) -> Result<(), TransportError>;
}
