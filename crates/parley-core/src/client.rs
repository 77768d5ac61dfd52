//! Identity records.

use crate::socket::{Socket, SocketId};
use std::sync::Arc;
use tokio::time::{Duration, Instant};

/// A registered identity and its (optional) live transport.
#[derive(Debug, Clone)]
pub struct Client {
    id: String,
    token: String,
    socket: Option<Arc<dyn Socket>>,
    last_seen: Instant,
}

impl Client {
    /// Create a disconnected record.
    #[must_use]
    pub fn new(id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            token: token.into(),
            socket: None,
            last_seen: Instant::now(),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// The live transport handle, if connected.
    #[must_use]
    pub fn socket(&self) -> Option<&Arc<dyn Socket>> {
        self.socket.as_ref()
    }

    #[must_use]
    pub fn socket_id(&self) -> Option<SocketId> {
        self.socket.as_ref().map(|s| s.id())
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    #[must_use]
    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    /// Time since the last inbound activity.
    #[must_use]
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen)
    }

    /// Record inbound activity.
    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Install a handle, returning the one it replaced.
    pub(crate) fn set_socket(&mut self, socket: Arc<dyn Socket>) -> Option<Arc<dyn Socket>> {
        self.socket.replace(socket)
    }

    pub(crate) fn take_socket(&mut self) -> Option<Arc<dyn Socket>> {
        self.socket.take()
    }

    /// Lightweight description of this record for events and callbacks.
    #[must_use]
    pub fn identity(&self) -> Identity {
        Identity {
            id: self.id.clone(),
            socket: self.socket_id(),
        }
    }
}

/// An id together with the transport handle it referred to when the
/// event was raised.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    pub id: String,
    pub socket: Option<SocketId>,
}

impl Identity {
    #[must_use]
    pub fn new(id: impl Into<String>, socket: Option<SocketId>) -> Self {
        Self {
            id: id.into(),
            socket,
        }
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.id)
    }
}
