//! WebSocket transport.
//!
//! Peers connect to `ws://host:port{path}?id=..&token=..&key=..`. The query
//! string carries the handshake; each WebSocket message afterwards is one
//! signaling message. Outbound messages are sent as JSON text.

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use parley_core::{next_socket_id, Gateway, HandshakeParams, Inbound, Socket, SocketError, SocketId};
use parley_protocol::{codec, Message};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, trace, warn};

use crate::traits::{Transport, TransportError};

/// WebSocket transport configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Path the upgrade endpoint is mounted at.
    pub path: String,
    /// Maximum message size in bytes.
    pub max_message_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            path: "/ws".to_string(),
            max_message_size: 64 * 1024, // 64 KB
        }
    }
}

/// Write side of one WebSocket connection.
pub struct WsSocket {
    id: SocketId,
    tx: mpsc::UnboundedSender<WsMessage>,
    closed: Arc<Notify>,
}

impl Socket for WsSocket {
    fn id(&self) -> SocketId {
        self.id
    }

    fn send(&self, message: &Message) -> Result<(), SocketError> {
        let text = codec::to_text(message)?;
        self.tx
            .send(WsMessage::Text(text))
            .map_err(|_| SocketError::Closed)
    }

    fn close(&self) -> Result<(), SocketError> {
        self.closed.notify_one();
        self.tx
            .send(WsMessage::Close(Some(CloseFrame {
                code: close_code::NORMAL,
                reason: "".into(),
            })))
            .map_err(|_| SocketError::Closed)
    }

    fn transport(&self) -> &'static str {
        "websocket"
    }
}

/// WebSocket transport.
pub struct WebSocketTransport {
    gateway: Arc<Gateway>,
    config: WebSocketConfig,
}

impl WebSocketTransport {
    #[must_use]
    pub fn new(gateway: Arc<Gateway>, config: WebSocketConfig) -> Self {
        Self { gateway, config }
    }

    /// Routes serving the upgrade endpoint.
    pub fn routes(self: &Arc<Self>) -> Router {
        Router::new()
            .route(&self.config.path, get(ws_handler))
            .with_state(Arc::clone(self))
    }

    async fn handle_socket(self: Arc<Self>, ws: WebSocket, params: HandshakeParams) {
        let (sink, mut stream) = ws.split();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(sink, rx));

        let closed = Arc::new(Notify::new());
        let socket = Arc::new(WsSocket {
            id: next_socket_id(),
            tx,
            closed: Arc::clone(&closed),
        });

        let Ok(identity) = self.gateway.handshake(&params, socket) else {
            return;
        };

        loop {
            tokio::select! {
                _ = closed.notified() => {
                    debug!(client = %identity, "Server closed connection");
                    break;
                }
                msg = stream.next() => match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        self.gateway.on_data(&identity, Inbound::Text(&text));
                    }
                    Some(Ok(WsMessage::Binary(data))) => {
                        self.gateway.on_data(&identity, Inbound::Binary(&data));
                    }
                    Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => {
                        self.gateway.on_activity(&identity);
                    }
                    Some(Ok(WsMessage::Close(_))) => {
                        debug!(client = %identity, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(client = %identity, error = %e, "WebSocket error");
                        self.gateway.on_transport_error(Some(&identity), e.to_string());
                        break;
                    }
                    None => {
                        debug!(client = %identity, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }

        self.gateway.on_close(&identity);
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn name(&self) -> &'static str {
        "websocket"
    }

    async fn serve(
        self: Arc<Self>,
        http: TcpListener,
        api: Router,
    ) -> Result<(), TransportError> {
        info!(
            "WebSocket endpoint: ws://{}{}",
            http.local_addr()?,
            self.config.path
        );

        axum::serve(http, api.merge(self.routes())).await?;

        Ok(())
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    params: Option<Query<HandshakeParams>>,
    State(transport): State<Arc<WebSocketTransport>>,
) -> impl IntoResponse {
    // A malformed query is rejected by the gateway, not by HTTP.
    let params = params.map(|Query(params)| params).unwrap_or_default();
    ws.max_message_size(transport.config.max_message_size)
        .on_upgrade(move |socket| transport.handle_socket(socket, params))
}

async fn write_loop(mut sink: SplitSink<WebSocket, WsMessage>, mut rx: mpsc::UnboundedReceiver<WsMessage>) {
    while let Some(msg) = rx.recv().await {
        let is_close = matches!(msg, WsMessage::Close(_));
        if let Err(e) = sink.send(msg).await {
            debug!(error = %e, "WebSocket write failed");
            break;
        }
        if is_close {
            break;
        }
    }

    if let Err(e) = sink.close().await {
        trace!(error = %e, "WebSocket sink close failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::{GatewayConfig, GatewayEvent, Realm, Router as MessageRouter};
    use parley_protocol::{reasons, MessageType};
    use serde_json::json;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::net::TcpStream;
    use tokio_tungstenite::{
        connect_async, tungstenite::Message as ClientMessage, MaybeTlsStream, WebSocketStream,
    };

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    const KEY: &str = "test-key";

    async fn start() -> (Arc<Realm>, SocketAddr) {
        let realm = Arc::new(Realm::new());
        let (gateway, mut events) = Gateway::new(
            Arc::clone(&realm),
            GatewayConfig {
                key: KEY.to_string(),
                concurrent_limit: 10,
                retain_disconnected: true,
            },
        );
        let transport = Arc::new(WebSocketTransport::new(
            Arc::new(gateway),
            WebSocketConfig::default(),
        ));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(transport.serve(listener, Router::new()));

        let router = MessageRouter::new(Arc::clone(&realm));
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    GatewayEvent::Connection(identity) => {
                        router.on_connection(&identity);
                    }
                    GatewayEvent::Message(_, message) => {
                        router.route(message);
                    }
                    _ => {}
                }
            }
        });

        (realm, addr)
    }

    async fn connect(addr: SocketAddr, query: &str) -> Client {
        let url = format!("ws://{addr}/ws?{query}");
        let (client, _) = connect_async(url).await.unwrap();
        client
    }

    async fn recv(client: &mut Client) -> Option<Message> {
        loop {
            let next = tokio::time::timeout(Duration::from_secs(5), client.next())
                .await
                .expect("timed out waiting for message");
            match next {
                Some(Ok(ClientMessage::Text(text))) => {
                    return Some(codec::parse_text(&text).unwrap());
                }
                Some(Ok(ClientMessage::Close(_))) | None | Some(Err(_)) => return None,
                Some(Ok(_)) => {}
            }
        }
    }

    #[test]
    fn test_websocket_config_default() {
        let config = WebSocketConfig::default();
        assert_eq!(config.path, "/ws");
        assert_eq!(config.max_message_size, 64 * 1024);
    }

    #[tokio::test]
    async fn test_open_and_relay() {
        let (_, addr) = start().await;

        let mut alice = connect(addr, "id=alice&token=t1&key=test-key").await;
        assert_eq!(recv(&mut alice).await.unwrap().kind, MessageType::Open);
        let mut bob = connect(addr, "id=bob&token=t2&key=test-key").await;
        assert_eq!(recv(&mut bob).await.unwrap().kind, MessageType::Open);

        let answer = json!({ "type": "ANSWER", "dst": "alice", "payload": { "sdp": "v=0" } });
        bob.send(ClientMessage::Text(answer.to_string())).await.unwrap();

        let received = recv(&mut alice).await.unwrap();
        assert_eq!(received.kind, MessageType::Answer);
        assert_eq!(received.src.as_deref(), Some("bob"));
        assert_eq!(received.dst.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_missing_token_is_rejected() {
        let (realm, addr) = start().await;

        let mut client = connect(addr, "id=alice&key=test-key").await;
        let reply = recv(&mut client).await.unwrap();
        assert_eq!(reply.kind, MessageType::Error);
        assert_eq!(reply.msg.as_deref(), Some(reasons::INVALID_PARAMETERS));
        assert!(recv(&mut client).await.is_none());
        assert_eq!(realm.count(), 0);
    }

    #[tokio::test]
    async fn test_malformed_query_is_invalid_parameters() {
        let (realm, addr) = start().await;

        let mut client = connect(addr, "id=alice&id=bob&token=t1&key=test-key").await;
        let reply = recv(&mut client).await.unwrap();
        assert_eq!(reply.kind, MessageType::Error);
        assert_eq!(reply.msg.as_deref(), Some(reasons::INVALID_PARAMETERS));
        assert!(recv(&mut client).await.is_none());
        assert_eq!(realm.count(), 0);
    }

    #[tokio::test]
    async fn test_wrong_token_gets_id_taken() {
        let (_, addr) = start().await;

        let mut alice = connect(addr, "id=alice&token=t1&key=test-key").await;
        recv(&mut alice).await.unwrap();

        let mut imposter = connect(addr, "id=alice&token=nope&key=test-key").await;
        let reply = recv(&mut imposter).await.unwrap();
        assert_eq!(reply.kind, MessageType::IdTaken);
        assert!(recv(&mut imposter).await.is_none());
    }

    #[tokio::test]
    async fn test_reconnect_closes_superseded_socket() {
        let (realm, addr) = start().await;

        let mut first = connect(addr, "id=alice&token=t1&key=test-key").await;
        recv(&mut first).await.unwrap();

        let mut second = connect(addr, "id=alice&token=t1&key=test-key").await;
        assert!(recv(&mut first).await.is_none());

        // No OPEN on reconnect; the connection stays usable.
        second.send(ClientMessage::Ping(Vec::new())).await.unwrap();
        assert!(realm.lookup("alice").unwrap().is_connected());
    }
}
