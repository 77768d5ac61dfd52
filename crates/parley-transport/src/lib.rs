//! # parley-transport
//!
//! Transport adapters for the Parley signaling server.
//!
//! - **WebSocket** - Handshake in the upgrade query string, JSON text frames
//! - **TCP** - Length-prefixed frames, handshake as the first frame
//!
//! Both adapters turn transport activity into [`parley_core::Gateway`] calls,
//! so everything past the handshake is transport-agnostic.
//!
//! ```rust,ignore
//! use parley_transport::{Transport, WebSocketTransport, WebSocketConfig};
//!
//! let transport = Arc::new(WebSocketTransport::new(gateway, WebSocketConfig::default()));
//! transport.serve(listener, api_routes).await?;
//! ```

pub mod traits;

#[cfg(feature = "tcp")]
pub mod tcp;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use traits::{Transport, TransportError};

#[cfg(feature = "tcp")]
pub use tcp::{TcpConfig, TcpTransport};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConfig, WebSocketTransport};
