//! The realm: registry of identities and their pending-message queues.
//!
//! All tables live behind a single mutex. Single operations are available
//! directly on [`Realm`]; callers that need several steps to be atomic
//! (admission check and registration, lookup and forward, staleness check
//! and eviction) take the lock once via [`Realm::lock`] and work on the
//! [`Registry`] guard.

use crate::client::Client;
use crate::socket::{Socket, SocketId};
use parking_lot::{Mutex, MutexGuard};
use parley_protocol::Message;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tokio::time::{Duration, Instant};
use tracing::{debug, trace};

/// Realm errors.
#[derive(Debug, Error)]
pub enum RealmError {
    /// The id is not registered.
    #[error("Unknown identity: {0}")]
    UnknownIdentity(String),
}

/// Outcome of [`Registry::register_or_get`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// A record was created for a previously unknown id.
    New,
    /// The id is known and the token matched.
    Reconnect,
    /// The id is known under a different token.
    IdTaken,
}

/// A buffered message and the instant it was queued.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub message: Message,
    pub enqueued_at: Instant,
}

/// The realm tables. Only reachable through a [`Realm`] lock.
#[derive(Debug, Default)]
pub struct Registry {
    clients: HashMap<String, Client>,
    queues: HashMap<String, VecDeque<QueuedMessage>>,
}

impl Registry {
    /// Register `id` under `token`, or check `token` against the existing record.
    pub fn register_or_get(&mut self, id: &str, token: &str) -> Registration {
        match self.clients.get(id) {
            Some(client) if client.token() == token => Registration::Reconnect,
            Some(_) => Registration::IdTaken,
            None => {
                self.clients
                    .insert(id.to_string(), Client::new(id, token));
                debug!(client = %id, "Registered new client");
                Registration::New
            }
        }
    }

    /// Bind a transport handle to `id`.
    ///
    /// Returns the handle that was superseded, if a different one was attached.
    ///
    /// # Errors
    ///
    /// Returns [`RealmError::UnknownIdentity`] if `id` is not registered.
    pub fn attach_transport(
        &mut self,
        id: &str,
        socket: Arc<dyn Socket>,
    ) -> Result<Option<Arc<dyn Socket>>, RealmError> {
        let client = self
            .clients
            .get_mut(id)
            .ok_or_else(|| RealmError::UnknownIdentity(id.to_string()))?;

        let new_id = socket.id();
        client.touch();
        let previous = client.set_socket(socket);
        trace!(client = %id, socket = new_id, "Attached transport");

        Ok(previous.filter(|old| old.id() != new_id))
    }

    /// Detach the handle from `id` if it is still `socket_id`.
    ///
    /// Returns `false` when the record is gone or a newer handle owns it.
    pub fn detach_transport(&mut self, id: &str, socket_id: SocketId) -> bool {
        match self.clients.get_mut(id) {
            Some(client) if client.socket_id() == Some(socket_id) => {
                client.take_socket();
                trace!(client = %id, socket = socket_id, "Detached transport");
                true
            }
            _ => false,
        }
    }

    #[must_use]
    pub fn lookup(&self, id: &str) -> Option<&Client> {
        self.clients.get(id)
    }

    /// Refresh `lastSeen` for `id`. Returns `false` if unknown.
    pub fn touch(&mut self, id: &str) -> bool {
        match self.clients.get_mut(id) {
            Some(client) => {
                client.touch();
                true
            }
            None => false,
        }
    }

    /// Snapshot of all registered ids.
    #[must_use]
    pub fn all_ids(&self) -> Vec<String> {
        self.clients.keys().cloned().collect()
    }

    /// Remove the record and its queue.
    ///
    /// The returned record still holds its transport handle; closing it is
    /// the caller's job.
    pub fn remove(&mut self, id: &str) -> Option<Client> {
        self.queues.remove(id);
        let removed = self.clients.remove(id);
        if removed.is_some() {
            debug!(client = %id, "Removed client");
        }
        removed
    }

    /// Append a message to the pending queue of `id`.
    ///
    /// # Errors
    ///
    /// Returns [`RealmError::UnknownIdentity`] if `id` is not registered.
    pub fn enqueue(&mut self, id: &str, message: Message) -> Result<(), RealmError> {
        if !self.clients.contains_key(id) {
            return Err(RealmError::UnknownIdentity(id.to_string()));
        }

        self.queues
            .entry(id.to_string())
            .or_default()
            .push_back(QueuedMessage {
                message,
                enqueued_at: Instant::now(),
            });
        Ok(())
    }

    /// Whether `id` has buffered messages.
    #[must_use]
    pub fn has_pending(&self, id: &str) -> bool {
        self.queues.get(id).is_some_and(|q| !q.is_empty())
    }

    /// Empty the queue of `id`, returning its messages in FIFO order.
    pub fn drain_queue(&mut self, id: &str) -> Vec<Message> {
        self.take_queue(id)
            .into_iter()
            .map(|entry| entry.message)
            .collect()
    }

    pub(crate) fn take_queue(&mut self, id: &str) -> VecDeque<QueuedMessage> {
        self.queues.remove(id).unwrap_or_default()
    }

    /// Put undelivered entries back at the head of the queue of `id`.
    pub(crate) fn restore_queue(&mut self, id: &str, entries: VecDeque<QueuedMessage>) {
        if entries.is_empty() || !self.clients.contains_key(id) {
            return;
        }
        let queue = self.queues.entry(id.to_string()).or_default();
        for entry in entries.into_iter().rev() {
            queue.push_front(entry);
        }
    }

    /// Each queued message of `id` with its age.
    #[must_use]
    pub fn queue_ages(&self, id: &str) -> Vec<(Message, Duration)> {
        let now = Instant::now();
        self.queues
            .get(id)
            .map(|q| {
                q.iter()
                    .map(|e| (e.message.clone(), now.saturating_duration_since(e.enqueued_at)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop every message of `id` that has been queued for at least `ttl`.
    ///
    /// Returns the dropped messages.
    pub fn expire_queue(&mut self, id: &str, ttl: Duration) -> Vec<Message> {
        let Some(queue) = self.queues.get_mut(id) else {
            return Vec::new();
        };

        let now = Instant::now();
        let mut expired = Vec::new();
        queue.retain(|entry| {
            if now.saturating_duration_since(entry.enqueued_at) >= ttl {
                expired.push(entry.message.clone());
                false
            } else {
                true
            }
        });

        if queue.is_empty() {
            self.queues.remove(id);
        }
        expired
    }

    /// Ids that currently have a queue.
    #[must_use]
    pub fn queued_ids(&self) -> Vec<String> {
        self.queues.keys().cloned().collect()
    }

    /// Number of registered identities.
    #[must_use]
    pub fn count(&self) -> usize {
        self.clients.len()
    }

    /// Number of identities with a live transport.
    #[must_use]
    pub fn connected_count(&self) -> usize {
        self.clients.values().filter(|c| c.is_connected()).count()
    }

    /// Total buffered messages across all queues.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }
}

/// Shared, lock-protected registry.
#[derive(Debug, Default)]
pub struct Realm {
    registry: Mutex<Registry>,
}

impl Realm {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the registry lock for a compound operation.
    pub fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock()
    }

    pub fn register_or_get(&self, id: &str, token: &str) -> Registration {
        self.lock().register_or_get(id, token)
    }

    /// # Errors
    ///
    /// Returns [`RealmError::UnknownIdentity`] if `id` is not registered.
    pub fn attach_transport(
        &self,
        id: &str,
        socket: Arc<dyn Socket>,
    ) -> Result<Option<Arc<dyn Socket>>, RealmError> {
        self.lock().attach_transport(id, socket)
    }

    pub fn detach_transport(&self, id: &str, socket_id: SocketId) -> bool {
        self.lock().detach_transport(id, socket_id)
    }

    /// Copy of the record for `id`.
    #[must_use]
    pub fn lookup(&self, id: &str) -> Option<Client> {
        self.lock().lookup(id).cloned()
    }

    pub fn touch(&self, id: &str) -> bool {
        self.lock().touch(id)
    }

    #[must_use]
    pub fn all_ids(&self) -> Vec<String> {
        self.lock().all_ids()
    }

    pub fn remove(&self, id: &str) -> Option<Client> {
        self.lock().remove(id)
    }

    /// # Errors
    ///
    /// Returns [`RealmError::UnknownIdentity`] if `id` is not registered.
    pub fn enqueue(&self, id: &str, message: Message) -> Result<(), RealmError> {
        self.lock().enqueue(id, message)
    }

    pub fn drain_queue(&self, id: &str) -> Vec<Message> {
        self.lock().drain_queue(id)
    }

    #[must_use]
    pub fn queue_ages(&self, id: &str) -> Vec<(Message, Duration)> {
        self.lock().queue_ages(id)
    }

    pub fn expire_queue(&self, id: &str, ttl: Duration) -> Vec<Message> {
        self.lock().expire_queue(id, ttl)
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.lock().count()
    }

    /// Realm statistics.
    #[must_use]
    pub fn stats(&self) -> RealmStats {
        let registry = self.lock();
        RealmStats {
            client_count: registry.count(),
            connected_count: registry.connected_count(),
            pending_messages: registry.pending_count(),
        }
    }
}

/// Realm statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RealmStats {
    /// Registered identities.
    pub client_count: usize,
    /// Identities with a live transport.
    pub connected_count: usize,
    /// Buffered messages across all queues.
    pub pending_messages: usize,
}
