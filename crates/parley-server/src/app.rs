//! Server wiring.
//!
//! Builds the realm, gateway, router and sweepers, runs the gateway event loop,
//! and serves the configured transport next to the discovery API.

use crate::api::{self, ApiState};
use crate::config::{Config, ServerType};
use crate::metrics;
use anyhow::{Context, Result};
use parley_core::{
    Gateway, GatewayError, GatewayEvent, Identity, LivenessSweeper, QueueExpirer, Realm, Router,
};
use parley_transport::{TcpTransport, Transport, WebSocketTransport};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

/// A fully wired server instance.
pub struct App {
    config: Config,
    realm: Arc<Realm>,
    gateway: Arc<Gateway>,
    router: Arc<Router>,
    liveness: Arc<LivenessSweeper>,
    expirer: Arc<QueueExpirer>,
}

impl App {
    /// Wire up the core. The returned receiver must be passed to [`App::event_loop`].
    #[must_use]
    pub fn new(config: Config) -> (Self, mpsc::UnboundedReceiver<GatewayEvent>) {
        let realm = Arc::new(Realm::new());
        let (gateway, events) = Gateway::new(Arc::clone(&realm), config.gateway());
        let router = Arc::new(Router::new(Arc::clone(&realm)));

        let liveness = LivenessSweeper::new(
            Arc::clone(&realm),
            config.liveness(),
            |identity: &Identity| {
                info!(client = %identity.id, "Client timed out");
                metrics::record_eviction();
            },
        );
        let expirer = QueueExpirer::new(Arc::clone(&realm), Arc::clone(&router), config.expirer());

        let app = Self {
            config,
            realm,
            gateway: Arc::new(gateway),
            router,
            liveness,
            expirer,
        };
        (app, events)
    }

    #[must_use]
    pub fn realm(&self) -> &Arc<Realm> {
        &self.realm
    }

    /// Dispatch gateway events until every sender is gone.
    pub async fn event_loop(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<GatewayEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event);
        }
        debug!("Gateway event stream closed");
    }

    /// Handle a single gateway event.
    pub fn handle_event(&self, event: GatewayEvent) {
        match event {
            GatewayEvent::Connection(identity) => {
                metrics::record_connection();
                let flushed = self.router.on_connection(&identity);
                if flushed > 0 {
                    debug!(client = %identity.id, count = flushed, "Delivered queued messages");
                }
            }
            GatewayEvent::Message(identity, message) => {
                let kind = message.kind;
                let delivery = self.router.route(message);
                metrics::record_delivery(delivery);
                trace!(
                    client = %identity.id,
                    kind = %kind,
                    delivery = delivery.as_str(),
                    "Routed message"
                );
            }
            GatewayEvent::Close(identity) => {
                metrics::record_disconnection();
                debug!(client = %identity.id, "Client left");
            }
            GatewayEvent::Error(e) => {
                warn!(error = %e, "Gateway error");
                metrics::record_error(error_kind(&e));
            }
        }

        metrics::set_realm_stats(&self.realm.stats());
    }

    fn start_sweepers(&self) {
        self.liveness.start();
        self.expirer.start();
    }

    fn stop_sweepers(&self) {
        self.liveness.stop();
        self.expirer.stop();
    }

    fn transport(&self) -> Result<Arc<dyn Transport>> {
        let gateway = Arc::clone(&self.gateway);
        Ok(match self.config.server_type {
            ServerType::Websocket => {
                Arc::new(WebSocketTransport::new(gateway, self.config.websocket()))
            }
            ServerType::Tcp => Arc::new(TcpTransport::new(gateway, self.config.tcp()?)),
        })
    }

    /// Serve until the transport fails or the process is interrupted.
    ///
    /// # Errors
    ///
    /// Returns an error if a listener cannot be bound or the transport fails.
    pub async fn serve(self: Arc<Self>, http: TcpListener) -> Result<()> {
        let transport = self.transport()?;
        let api = api::routes(Arc::new(ApiState::new(
            Arc::clone(&self.realm),
            self.config.key.clone(),
            self.config.allow_discovery,
        )));

        self.start_sweepers();

        info!(
            transport = transport.name(),
            "Parley server listening on {}",
            http.local_addr()?
        );

        let result = tokio::select! {
            result = transport.serve(http, api) => result.context("Transport failed"),
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                Ok(())
            }
        };

        self.stop_sweepers();
        result
    }
}

fn error_kind(e: &GatewayError) -> &'static str {
    match e {
        GatewayError::Rejected(_) => "rejected",
        GatewayError::Parse { .. } => "parse",
        GatewayError::Transport { .. } => "transport",
        GatewayError::Realm(_) => "realm",
    }
}

/// Run the server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run(config: Config) -> Result<()> {
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let http = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    let (app, events) = App::new(config);
    let app = Arc::new(app);
    tokio::spawn(Arc::clone(&app).event_loop(events));

    app.serve(http).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use parley_core::{next_socket_id, HandshakeParams, Inbound, Socket, SocketError, SocketId};
    use parley_protocol::{Message, MessageType};

    struct Recorder {
        id: SocketId,
        sent: Mutex<Vec<Message>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                id: next_socket_id(),
                sent: Mutex::default(),
            })
        }

        fn kinds(&self) -> Vec<MessageType> {
            self.sent.lock().iter().map(|m| m.kind).collect()
        }
    }

    impl Socket for Recorder {
        fn id(&self) -> SocketId {
            self.id
        }

        fn send(&self, message: &Message) -> Result<(), SocketError> {
            self.sent.lock().push(message.clone());
            Ok(())
        }

        fn close(&self) -> Result<(), SocketError> {
            Ok(())
        }

        fn transport(&self) -> &'static str {
            "test"
        }
    }

    fn params(id: &str) -> HandshakeParams {
        HandshakeParams::new(id, "t", "parley")
    }

    fn drain(app: &App, events: &mut mpsc::UnboundedReceiver<GatewayEvent>) {
        while let Ok(event) = events.try_recv() {
            app.handle_event(event);
        }
    }

    #[tokio::test]
    async fn test_events_drive_routing() {
        let (app, mut events) = App::new(Config::default());

        let alice = Recorder::new();
        let alice_id = app.gateway.handshake(&params("alice"), alice.clone()).unwrap();
        let bob = Recorder::new();
        app.gateway.handshake(&params("bob"), bob.clone()).unwrap();
        drain(&app, &mut events);

        app.gateway.on_data(
            &alice_id,
            Inbound::Text(r#"{"type":"OFFER","dst":"bob","payload":{"sdp":"x"}}"#),
        );
        app.gateway
            .on_data(&alice_id, Inbound::Text(r#"{"type":"HEARTBEAT"}"#));
        drain(&app, &mut events);

        assert_eq!(bob.kinds(), vec![MessageType::Open, MessageType::Offer]);
        assert_eq!(bob.sent.lock()[1].src.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_backlog_flushed_on_reconnect() {
        let (app, mut events) = App::new(Config::default());

        let alice = Recorder::new();
        let alice_id = app.gateway.handshake(&params("alice"), alice).unwrap();
        let bob = Recorder::new();
        let bob_id = app.gateway.handshake(&params("bob"), bob).unwrap();
        app.gateway.on_close(&bob_id);
        drain(&app, &mut events);

        for n in 0..3 {
            let frame = format!(r#"{{"type":"CANDIDATE","dst":"bob","payload":{n}}}"#);
            app.gateway.on_data(&alice_id, Inbound::Text(&frame));
        }
        drain(&app, &mut events);
        assert_eq!(app.realm().stats().pending_messages, 3);

        let bob = Recorder::new();
        app.gateway.handshake(&params("bob"), bob.clone()).unwrap();
        drain(&app, &mut events);

        let payloads: Vec<_> = bob.sent.lock().iter().filter_map(|m| m.payload.clone()).collect();
        assert_eq!(payloads, vec![serde_json::json!(0), serde_json::json!(1), serde_json::json!(2)]);
        assert_eq!(app.realm().stats().pending_messages, 0);
    }

    #[tokio::test]
    async fn test_parse_errors_keep_connection() {
        let (app, mut events) = App::new(Config::default());

        let alice = Recorder::new();
        let alice_id = app.gateway.handshake(&params("alice"), alice).unwrap();
        app.gateway.on_data(&alice_id, Inbound::Text("not json"));
        drain(&app, &mut events);

        assert!(app.realm().lookup("alice").unwrap().is_connected());
    }

    #[test]
    fn test_transport_follows_server_type() {
        let (app, _events) = App::new(Config::default());
        assert_eq!(app.transport().unwrap().name(), "websocket");

        let config = Config {
            server_type: ServerType::Tcp,
            ..Config::default()
        };
        let (app, _events) = App::new(config);
        assert_eq!(app.transport().unwrap().name(), "tcp");
    }
}
