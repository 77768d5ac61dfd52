//! Transport-agnostic connection gateway.
//!
//! Every transport adapter drives the same state machine through this type:
//!
//! ```text
//! AWAITING_HANDSHAKE ──handshake()──▶ AUTHENTICATED ──on_close()──▶ DISCONNECTED
//!         │
//!         └── rejected: one control message, then the transport is closed
//! ```
//!
//! Accepted connections, inbound messages, disconnects and errors are
//! re-exposed as [`GatewayEvent`]s on an unbounded channel.

use crate::client::Identity;
use crate::realm::{Realm, RealmError, Registration};
use crate::socket::Socket;
use parley_protocol::{codec, reasons, Message, ProtocolError};
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

/// Connection parameters presented at handshake time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct HandshakeParams {
    pub id: Option<String>,
    pub token: Option<String>,
    pub key: Option<String>,
}

impl HandshakeParams {
    #[must_use]
    pub fn new(id: impl Into<String>, token: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            token: Some(token.into()),
            key: Some(key.into()),
        }
    }

    /// All three fields, if present and non-empty.
    fn fields(&self) -> Option<(&str, &str, &str)> {
        fn present(v: &Option<String>) -> Option<&str> {
            v.as_deref().filter(|s| !s.is_empty())
        }
        Some((
            present(&self.id)?,
            present(&self.token)?,
            present(&self.key)?,
        ))
    }
}

/// Why a handshake was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("invalid parameters")]
    InvalidParameters,
    #[error("invalid key")]
    InvalidKey,
    #[error("connection limit exceeded")]
    ConnectionLimitExceeded,
    #[error("id taken")]
    IdTaken,
}

impl Rejection {
    /// The control message sent to the refused peer.
    #[must_use]
    pub fn message(&self) -> Message {
        match self {
            Rejection::InvalidParameters => Message::error(reasons::INVALID_PARAMETERS),
            Rejection::InvalidKey => Message::error(reasons::INVALID_KEY),
            Rejection::ConnectionLimitExceeded => {
                Message::error(reasons::CONNECTION_LIMIT_EXCEEDED)
            }
            Rejection::IdTaken => Message::id_taken(),
        }
    }

    /// Short label for logs and metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Rejection::InvalidParameters => "invalid_parameters",
            Rejection::InvalidKey => "invalid_key",
            Rejection::ConnectionLimitExceeded => "connection_limit_exceeded",
            Rejection::IdTaken => "id_taken",
        }
    }
}

/// Gateway errors.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The handshake was refused; the peer has been told why.
    #[error("Handshake rejected: {0}")]
    Rejected(Rejection),

    /// An inbound frame could not be parsed.
    #[error("Failed to parse message from {id}: {source}")]
    Parse {
        id: String,
        #[source]
        source: ProtocolError,
    },

    /// The underlying transport failed.
    #[error("Transport error on {}: {reason}", .id.as_deref().unwrap_or("unauthenticated connection"))]
    Transport { id: Option<String>, reason: String },

    /// The registry was not in the state the gateway expected.
    #[error("Registry error: {0}")]
    Realm(#[from] RealmError),
}

/// An inbound data frame as delivered by a transport.
#[derive(Debug, Clone, Copy)]
pub enum Inbound<'a> {
    /// Serialized JSON text.
    Text(&'a str),
    /// Bytes in either encoding.
    Binary(&'a [u8]),
}

/// Events emitted by the gateway.
#[derive(Debug)]
pub enum GatewayEvent {
    /// A peer completed the handshake (new or reconnected).
    Connection(Identity),
    /// A peer sent a message. `src` has been set to the peer's id.
    Message(Identity, Message),
    /// A peer's live transport went away.
    Close(Identity),
    /// A parse or transport error.
    Error(GatewayError),
}

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Shared key every handshake must present.
    pub key: String,
    /// Maximum number of registered identities.
    pub concurrent_limit: usize,
    /// Keep a disconnected identity registered until the liveness sweep
    /// reclaims it, so messages sent during a reconnect gap are buffered.
    pub retain_disconnected: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            key: "parley".to_string(),
            concurrent_limit: 5000,
            retain_disconnected: true,
        }
    }
}

/// The connection gateway shared by all connections of one adapter.
pub struct Gateway {
    realm: Arc<Realm>,
    config: GatewayConfig,
    events: mpsc::UnboundedSender<GatewayEvent>,
}

impl Gateway {
    /// Create a gateway and the receiving end of its event stream.
    #[must_use]
    pub fn new(
        realm: Arc<Realm>,
        config: GatewayConfig,
    ) -> (Self, mpsc::UnboundedReceiver<GatewayEvent>) {
        info!(
            concurrent_limit = config.concurrent_limit,
            retain_disconnected = config.retain_disconnected,
            "Creating gateway"
        );
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                realm,
                config,
                events,
            },
            rx,
        )
    }

    #[must_use]
    pub fn realm(&self) -> &Arc<Realm> {
        &self.realm
    }

    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Run the handshake for a freshly accepted connection.
    ///
    /// On rejection the peer receives exactly one control message and the
    /// socket is closed; nothing is registered.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Rejected`] if the peer was refused, or
    /// [`GatewayError::Realm`] if the registry changed underneath the handshake.
    pub fn handshake(
        &self,
        params: &HandshakeParams,
        socket: Arc<dyn Socket>,
    ) -> Result<Identity, GatewayError> {
        match self.admit(params, &socket) {
            Ok(identity) => {
                debug!(client = %identity.id, socket = socket.id(), transport = socket.transport(), "Client connected");
                self.emit(GatewayEvent::Connection(identity.clone()));
                Ok(identity)
            }
            Err(GatewayError::Rejected(rejection)) => {
                debug!(
                    id = params.id.as_deref().unwrap_or_default(),
                    reason = rejection.as_str(),
                    "Handshake rejected"
                );
                if let Err(e) = socket.send(&rejection.message()) {
                    trace!(error = %e, "Could not deliver rejection");
                }
                let _ = socket.close();
                Err(GatewayError::Rejected(rejection))
            }
            Err(e) => {
                error!(error = %e, "Handshake failed");
                let _ = socket.close();
                Err(e)
            }
        }
    }

    fn admit(
        &self,
        params: &HandshakeParams,
        socket: &Arc<dyn Socket>,
    ) -> Result<Identity, GatewayError> {
        let (id, token, key) = params
            .fields()
            .ok_or(GatewayError::Rejected(Rejection::InvalidParameters))?;

        if key != self.config.key {
            return Err(GatewayError::Rejected(Rejection::InvalidKey));
        }

        let superseded = {
            let mut registry = self.realm.lock();

            if registry.lookup(id).is_none() && registry.count() >= self.config.concurrent_limit {
                warn!(client = %id, limit = self.config.concurrent_limit, "Connection limit reached");
                return Err(GatewayError::Rejected(Rejection::ConnectionLimitExceeded));
            }

            match registry.register_or_get(id, token) {
                Registration::IdTaken => {
                    return Err(GatewayError::Rejected(Rejection::IdTaken));
                }
                Registration::New => {
                    if let Err(e) = socket.send(&Message::open()) {
                        debug!(client = %id, error = %e, "Failed to send OPEN");
                    }
                }
                Registration::Reconnect => {
                    debug!(client = %id, "Client reconnected");
                }
            }

            registry.attach_transport(id, Arc::clone(socket))?
        };

        if let Some(old) = superseded {
            debug!(client = %id, socket = old.id(), "Closing superseded socket");
            if let Err(e) = old.close() {
                trace!(error = %e, "Superseded socket already closed");
            }
        }

        Ok(Identity::new(id, Some(socket.id())))
    }

    /// Handle an inbound data frame from an authenticated connection.
    ///
    /// Frames from a handle that has been superseded are ignored. Parse
    /// failures are reported as [`GatewayEvent::Error`]; the connection stays up.
    pub fn on_data(&self, identity: &Identity, frame: Inbound<'_>) {
        if !self.refresh(identity) {
            trace!(client = %identity.id, "Ignoring frame from superseded socket");
            return;
        }

        let parsed = match frame {
            Inbound::Text(text) => codec::parse_text(text),
            Inbound::Binary(data) => codec::parse(data),
        };

        match parsed {
            Ok(mut message) => {
                message.src = Some(identity.id.clone());
                self.emit(GatewayEvent::Message(identity.clone(), message));
            }
            Err(source) => {
                debug!(client = %identity.id, error = %source, "Unparsable frame");
                self.emit(GatewayEvent::Error(GatewayError::Parse {
                    id: identity.id.clone(),
                    source,
                }));
            }
        }
    }

    /// Record non-data activity (transport-level pings).
    pub fn on_activity(&self, identity: &Identity) {
        self.refresh(identity);
    }

    /// Report an underlying transport failure.
    pub fn on_transport_error(&self, identity: Option<&Identity>, reason: impl Into<String>) {
        self.emit(GatewayEvent::Error(GatewayError::Transport {
            id: identity.map(|i| i.id.clone()),
            reason: reason.into(),
        }));
    }

    /// Handle a transport-level disconnect.
    ///
    /// Only acts if `identity`'s handle is still the one attached to the record.
    pub fn on_close(&self, identity: &Identity) {
        let Some(socket_id) = identity.socket else {
            return;
        };

        let detached = {
            let mut registry = self.realm.lock();
            let detached = registry.detach_transport(&identity.id, socket_id);
            if detached && !self.config.retain_disconnected {
                registry.remove(&identity.id);
            }
            detached
        };

        if detached {
            debug!(client = %identity.id, socket = socket_id, "Client disconnected");
            self.emit(GatewayEvent::Close(identity.clone()));
        } else {
            trace!(client = %identity.id, socket = socket_id, "Close of superseded socket ignored");
        }
    }

    /// Touch the record if `identity` still owns it.
    fn refresh(&self, identity: &Identity) -> bool {
        let mut registry = self.realm.lock();
        let current = registry
            .lookup(&identity.id)
            .is_some_and(|c| c.socket_id().is_some() && c.socket_id() == identity.socket);
        if current {
            registry.touch(&identity.id);
        }
        current
    }

    fn emit(&self, event: GatewayEvent) {
        if self.events.send(event).is_err() {
            trace!("Gateway event receiver dropped");
        }
    }
}
