//! Message router.
//!
//! Delivers routed messages to the destination's live transport, or buffers
//! them on the destination's pending queue while it is offline. Lookup and
//! forward happen under one realm lock, which together with the FIFO
//! transport channels keeps delivery to a single destination in order.

use crate::client::Identity;
use crate::realm::{QueuedMessage, Realm};
use crate::socket::SocketError;
use parley_protocol::{Message, MessageType};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, trace};

/// What happened to a routed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Written to the destination's transport.
    Forwarded,
    /// Buffered until the destination reconnects.
    Queued,
    /// Not deliverable and not worth buffering.
    Dropped,
}

impl Delivery {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Delivery::Forwarded => "forwarded",
            Delivery::Queued => "queued",
            Delivery::Dropped => "dropped",
        }
    }
}

/// Routes messages between identities registered in a [`Realm`].
pub struct Router {
    realm: Arc<Realm>,
}

impl Router {
    #[must_use]
    pub fn new(realm: Arc<Realm>) -> Self {
        Self { realm }
    }

    /// Route one message from a peer.
    pub fn route(&self, message: Message) -> Delivery {
        match message.kind {
            MessageType::Heartbeat => return Delivery::Dropped,
            kind if kind.is_control() => {
                debug!(src = ?message.src, kind = %kind, "Dropping control message from peer");
                return Delivery::Dropped;
            }
            _ => {}
        }

        let Some(dst) = message.dst.clone() else {
            debug!(src = ?message.src, kind = %message.kind, "Dropping message without destination");
            return Delivery::Dropped;
        };

        let mut registry = self.realm.lock();

        let Some(client) = registry.lookup(&dst) else {
            trace!(dst = %dst, kind = %message.kind, "Destination unknown, dropping");
            return Delivery::Dropped;
        };

        // A non-empty queue means a flush is pending; appending keeps order.
        if let Some(socket) = client.socket().filter(|_| !registry.has_pending(&dst)) {
            match socket.send(&message) {
                Ok(()) => {
                    trace!(dst = %dst, kind = %message.kind, "Forwarded");
                    return Delivery::Forwarded;
                }
                Err(SocketError::Encode(e)) => {
                    debug!(dst = %dst, kind = %message.kind, error = %e, "Message not encodable, dropping");
                    return Delivery::Dropped;
                }
                Err(SocketError::Closed) => {
                    debug!(dst = %dst, "Forward failed, buffering");
                }
            }
        } else if !client.is_connected() && !is_bufferable(message.kind) {
            trace!(dst = %dst, kind = %message.kind, "Destination offline, dropping");
            return Delivery::Dropped;
        }

        match registry.enqueue(&dst, message) {
            Ok(()) => Delivery::Queued,
            Err(_) => Delivery::Dropped,
        }
    }

    /// Flush the pending queue of a freshly connected identity.
    ///
    /// Returns the number of messages delivered. Does nothing if `identity`'s
    /// handle is no longer the attached one.
    pub fn on_connection(&self, identity: &Identity) -> usize {
        let mut registry = self.realm.lock();

        let socket = match registry.lookup(&identity.id) {
            Some(client) if client.socket_id().is_some() && client.socket_id() == identity.socket => {
                client.socket().cloned()
            }
            _ => None,
        };
        let Some(socket) = socket else {
            return 0;
        };

        let mut pending: VecDeque<QueuedMessage> = registry.take_queue(&identity.id);
        let mut delivered = 0;

        while let Some(entry) = pending.front() {
            match socket.send(&entry.message) {
                Ok(()) => delivered += 1,
                Err(SocketError::Encode(e)) => {
                    debug!(client = %identity.id, error = %e, "Discarding unencodable queued message");
                }
                Err(SocketError::Closed) => {
                    debug!(client = %identity.id, "Flush interrupted");
                    break;
                }
            }
            pending.pop_front();
        }

        registry.restore_queue(&identity.id, pending);

        if delivered > 0 {
            debug!(client = %identity.id, delivered, "Flushed pending messages");
        }
        delivered
    }
}

/// `LEAVE` and `EXPIRE` are meaningless once stale, so they are not buffered.
fn is_bufferable(kind: MessageType) -> bool {
    !matches!(kind, MessageType::Leave | MessageType::Expire)
}
