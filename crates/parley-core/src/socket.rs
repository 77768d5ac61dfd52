//! Transport handle abstraction.
//!
//! A [`Socket`] is the server's write side of one live peer connection. Each
//! transport adapter provides its own implementation; the realm, router and
//! sweepers only ever see `Arc<dyn Socket>`.

use parley_protocol::{Message, ProtocolError};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Process-unique identifier of a transport handle.
///
/// Two handles are the same connection iff their ids are equal.
pub type SocketId = u64;

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a fresh socket id.
#[must_use]
pub fn next_socket_id() -> SocketId {
    NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed)
}

/// Errors raised by a transport handle.
#[derive(Debug, Error)]
pub enum SocketError {
    /// The connection behind the handle is gone.
    #[error("Socket closed")]
    Closed,

    /// The message could not be encoded for this transport.
    #[error("Encoding failed: {0}")]
    Encode(#[from] ProtocolError),
}

/// Write side of a live peer connection.
///
/// Both operations are non-blocking: implementations hand the work to the
/// connection's writer task and return immediately.
pub trait Socket: Send + Sync {
    /// Unique id of this handle.
    fn id(&self) -> SocketId;

    /// Queue a message for delivery as a single framed unit.
    fn send(&self, message: &Message) -> Result<(), SocketError>;

    /// Ask the transport to close the connection.
    fn close(&self) -> Result<(), SocketError>;

    /// Name of the transport behind this handle.
    fn transport(&self) -> &'static str;
}

impl fmt::Debug for dyn Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.id())
            .field("transport", &self.transport())
            .finish()
    }
}
