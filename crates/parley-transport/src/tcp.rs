//! Raw socket transport.
//!
//! Peers open a plain TCP connection and exchange length-prefixed frames
//! (4-byte big-endian length, then the payload). The first frame must be a
//! JSON object carrying the handshake parameters:
//!
//! ```text
//! {"id":"alice","token":"t1","key":"parley"}
//! ```
//!
//! Every later frame is one message, as JSON text or a MessagePack map.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parley_core::{next_socket_id, Gateway, HandshakeParams, Inbound, Socket, SocketError, SocketId};
use parley_protocol::{codec, Message};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, trace, warn};

use crate::traits::{Transport, TransportError};

/// Raw socket transport configuration.
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum frame payload size in bytes.
    pub max_message_size: usize,
    /// How long a new connection may take to present its handshake frame.
    pub handshake_timeout: Duration,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 9001)),
            max_message_size: 64 * 1024, // 64 KB
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// Commands for a connection's writer task.
#[derive(Debug)]
enum Outbound {
    Frame(Bytes),
    Shutdown,
}

/// Write side of one raw socket connection.
pub struct TcpSocket {
    id: SocketId,
    tx: mpsc::UnboundedSender<Outbound>,
    closed: Arc<Notify>,
}

impl Socket for TcpSocket {
    fn id(&self) -> SocketId {
        self.id
    }

    fn send(&self, message: &Message) -> Result<(), SocketError> {
        let frame = codec::encode(message)?;
        self.tx
            .send(Outbound::Frame(frame))
            .map_err(|_| SocketError::Closed)
    }

    fn close(&self) -> Result<(), SocketError> {
        self.closed.notify_one();
        self.tx
            .send(Outbound::Shutdown)
            .map_err(|_| SocketError::Closed)
    }

    fn transport(&self) -> &'static str {
        "tcp"
    }
}

/// Raw socket transport.
pub struct TcpTransport {
    gateway: Arc<Gateway>,
    config: TcpConfig,
}

impl TcpTransport {
    #[must_use]
    pub fn new(gateway: Arc<Gateway>, config: TcpConfig) -> Self {
        Self { gateway, config }
    }

    /// Accept connections from `listener` forever.
    ///
    /// # Errors
    ///
    /// Never returns under normal operation; accept errors are logged and retried.
    pub async fn accept_loop(self: Arc<Self>, listener: TcpListener) -> Result<(), TransportError> {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("Accepted TCP connection from {}", addr);
                    let transport = Arc::clone(&self);
                    tokio::spawn(async move {
                        transport.handle_connection(stream, addr).await;
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            trace!(error = %e, "Could not set TCP_NODELAY");
        }

        let (mut reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(writer, rx));

        let closed = Arc::new(Notify::new());
        let socket = Arc::new(TcpSocket {
            id: next_socket_id(),
            tx,
            closed: Arc::clone(&closed),
        });

        let max = self.config.max_message_size;
        let mut buf = BytesMut::with_capacity(4096);

        let handshake = tokio::time::timeout(
            self.config.handshake_timeout,
            read_frame(&mut reader, &mut buf, max),
        )
        .await;

        let params = match handshake {
            Ok(Ok(Some(frame))) => serde_json::from_slice(&frame).unwrap_or_else(|e| {
                debug!(peer = %addr, error = %e, "Malformed handshake frame");
                HandshakeParams::default()
            }),
            Ok(Ok(None)) => {
                debug!(peer = %addr, "Connection closed before handshake");
                return;
            }
            Ok(Err(e)) => {
                debug!(peer = %addr, error = %e, "Unreadable handshake frame");
                self.gateway.on_transport_error(None, e.to_string());
                HandshakeParams::default()
            }
            Err(_) => {
                debug!(peer = %addr, "Handshake timed out");
                self.gateway
                    .on_transport_error(None, TransportError::Timeout.to_string());
                HandshakeParams::default()
            }
        };

        let Ok(identity) = self.gateway.handshake(&params, socket.clone()) else {
            return;
        };

        loop {
            tokio::select! {
                _ = closed.notified() => {
                    debug!(client = %identity, "Server closed connection");
                    break;
                }
                frame = read_frame(&mut reader, &mut buf, max) => match frame {
                    Ok(Some(frame)) => self.gateway.on_data(&identity, Inbound::Binary(&frame)),
                    Ok(None) => {
                        debug!(client = %identity, "TCP stream ended");
                        break;
                    }
                    Err(e) => {
                        warn!(client = %identity, error = %e, "TCP read failed");
                        self.gateway.on_transport_error(Some(&identity), e.to_string());
                        break;
                    }
                }
            }
        }

        self.gateway.on_close(&identity);
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn serve(
        self: Arc<Self>,
        http: TcpListener,
        api: axum::Router,
    ) -> Result<(), TransportError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        info!("Raw socket transport listening on {}", listener.local_addr()?);

        let http_server = async { axum::serve(http, api).await.map_err(TransportError::Io) };
        tokio::try_join!(http_server, Arc::clone(&self).accept_loop(listener))?;

        Ok(())
    }
}

/// Read one frame payload, buffering partial reads in `buf`.
///
/// Returns `Ok(None)` on a clean end of stream between frames.
async fn read_frame<R>(
    reader: &mut R,
    buf: &mut BytesMut,
    max_size: usize,
) -> Result<Option<Bytes>, TransportError>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(frame) = codec::decode_from(buf, max_size)? {
            return Ok(Some(frame));
        }

        if reader.read_buf(buf).await? == 0 {
            return if buf.is_empty() {
                Ok(None)
            } else {
                Err(TransportError::ConnectionClosed)
            };
        }
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Outbound>) {
    while let Some(outbound) = rx.recv().await {
        match outbound {
            Outbound::Frame(frame) => {
                if let Err(e) = writer.write_all(&frame).await {
                    debug!(error = %e, "TCP write failed");
                    break;
                }
            }
            Outbound::Shutdown => break,
        }
    }

    if let Err(e) = writer.shutdown().await {
        trace!(error = %e, "TCP shutdown failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::{GatewayConfig, GatewayError, GatewayEvent, Realm, Router};
    use parley_protocol::MessageType;
    use serde_json::{json, Value};

    const KEY: &str = "test-key";

    async fn start(concurrent_limit: usize) -> (Arc<Realm>, SocketAddr) {
        let (realm, addr, _) = start_with(concurrent_limit, TcpConfig::default()).await;
        (realm, addr)
    }

    async fn start_with(
        concurrent_limit: usize,
        config: TcpConfig,
    ) -> (Arc<Realm>, SocketAddr, mpsc::UnboundedReceiver<GatewayError>) {
        let realm = Arc::new(Realm::new());
        let (gateway, mut events) = Gateway::new(
            Arc::clone(&realm),
            GatewayConfig {
                key: KEY.to_string(),
                concurrent_limit,
                retain_disconnected: true,
            },
        );
        let transport = Arc::new(TcpTransport::new(Arc::new(gateway), config));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(transport.accept_loop(listener));

        let router = Router::new(Arc::clone(&realm));
        let (errors_tx, errors) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    GatewayEvent::Connection(identity) => {
                        router.on_connection(&identity);
                    }
                    GatewayEvent::Message(_, message) => {
                        router.route(message);
                    }
                    GatewayEvent::Error(e) => {
                        let _ = errors_tx.send(e);
                    }
                    GatewayEvent::Close(_) => {}
                }
            }
        });

        (realm, addr, errors)
    }

    async fn send_raw(stream: &mut TcpStream, payload: &[u8]) {
        let frame = codec::encode_frame(payload).unwrap();
        stream.write_all(&frame).await.unwrap();
    }

    async fn send_json(stream: &mut TcpStream, value: Value) {
        send_raw(stream, &serde_json::to_vec(&value).unwrap()).await;
    }

    async fn recv(stream: &mut TcpStream) -> Message {
        let read = async {
            let len = stream.read_u32().await.unwrap() as usize;
            let mut body = vec![0u8; len];
            stream.read_exact(&mut body).await.unwrap();
            codec::parse(&body).unwrap()
        };
        tokio::time::timeout(Duration::from_secs(5), read)
            .await
            .expect("timed out waiting for message")
    }

    async fn connect(addr: SocketAddr, id: &str, token: &str) -> TcpStream {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        send_json(&mut stream, json!({ "id": id, "token": token, "key": KEY })).await;
        stream
    }

    async fn assert_eof(stream: &mut TcpStream) {
        let mut byte = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut byte))
            .await
            .expect("timed out waiting for close")
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_tcp_config_default() {
        let config = TcpConfig::default();
        assert_eq!(config.bind_addr.port(), 9001);
        assert_eq!(config.max_message_size, 64 * 1024);
    }

    #[tokio::test]
    async fn test_handshake_and_relay() {
        let (_, addr) = start(10).await;

        let mut alice = connect(addr, "alice", "t1").await;
        assert_eq!(recv(&mut alice).await.kind, MessageType::Open);
        let mut bob = connect(addr, "bob", "t2").await;
        assert_eq!(recv(&mut bob).await.kind, MessageType::Open);

        send_json(
            &mut alice,
            json!({ "type": "OFFER", "src": "mallory", "dst": "bob", "payload": { "sdp": "v=0" } }),
        )
        .await;

        let offer = recv(&mut bob).await;
        assert_eq!(offer.kind, MessageType::Offer);
        assert_eq!(offer.src.as_deref(), Some("alice"));
        assert_eq!(offer.payload, Some(json!({ "sdp": "v=0" })));
    }

    #[tokio::test]
    async fn test_structured_frames_are_accepted() {
        let (_, addr) = start(10).await;

        let mut alice = connect(addr, "alice", "t1").await;
        recv(&mut alice).await;
        let mut bob = connect(addr, "bob", "t2").await;
        recv(&mut bob).await;

        let candidate = Message::routed(MessageType::Candidate, "bob", json!({ "sdpMid": "0" }));
        send_raw(&mut alice, &rmp_serde::to_vec_named(&candidate).unwrap()).await;

        let received = recv(&mut bob).await;
        assert_eq!(received.kind, MessageType::Candidate);
        assert_eq!(received.src.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_bad_key_gets_error_then_close() {
        let (realm, addr) = start(10).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        send_json(&mut stream, json!({ "id": "alice", "token": "t1", "key": "wrong" })).await;

        let reply = recv(&mut stream).await;
        assert_eq!(reply.kind, MessageType::Error);
        assert_eq!(reply.msg.as_deref(), Some(parley_protocol::reasons::INVALID_KEY));
        assert_eof(&mut stream).await;
        assert_eq!(realm.count(), 0);
    }

    #[tokio::test]
    async fn test_garbage_handshake_is_invalid_parameters() {
        let (_, addr) = start(10).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        send_raw(&mut stream, b"hello").await;

        let reply = recv(&mut stream).await;
        assert_eq!(reply.kind, MessageType::Error);
        assert_eq!(
            reply.msg.as_deref(),
            Some(parley_protocol::reasons::INVALID_PARAMETERS)
        );
    }

    #[tokio::test]
    async fn test_silent_client_times_out_handshake() {
        let config = TcpConfig {
            handshake_timeout: Duration::from_millis(50),
            ..TcpConfig::default()
        };
        let (realm, addr, mut errors) = start_with(10, config).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();

        let reply = recv(&mut stream).await;
        assert_eq!(reply.kind, MessageType::Error);
        assert_eq!(
            reply.msg.as_deref(),
            Some(parley_protocol::reasons::INVALID_PARAMETERS)
        );
        assert_eof(&mut stream).await;
        assert_eq!(realm.count(), 0);

        let error = tokio::time::timeout(Duration::from_secs(5), errors.recv())
            .await
            .unwrap()
            .unwrap();
        match error {
            GatewayError::Transport { id, reason } => {
                assert!(id.is_none());
                assert_eq!(reason, TransportError::Timeout.to_string());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_queued_messages_delivered_after_reconnect() {
        let (realm, addr) = start(10).await;

        let mut alice = connect(addr, "alice", "t1").await;
        recv(&mut alice).await;
        let mut bob = connect(addr, "bob", "t2").await;
        recv(&mut bob).await;

        drop(bob);
        // Wait until the disconnect has been processed.
        tokio::time::timeout(Duration::from_secs(5), async {
            while realm.lookup("bob").is_some_and(|c| c.is_connected()) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        for n in 0..3 {
            send_json(&mut alice, json!({ "type": "CANDIDATE", "dst": "bob", "payload": n })).await;
        }
        tokio::time::timeout(Duration::from_secs(5), async {
            while realm.queue_ages("bob").len() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let mut bob = connect(addr, "bob", "t2").await;
        for n in 0..3 {
            let message = recv(&mut bob).await;
            assert_eq!(message.kind, MessageType::Candidate);
            assert_eq!(message.payload, Some(json!(n)));
        }
    }

    #[tokio::test]
    async fn test_server_close_ends_connection() {
        let (realm, addr) = start(10).await;

        let mut alice = connect(addr, "alice", "t1").await;
        recv(&mut alice).await;

        let socket = realm.lookup("alice").unwrap().socket().cloned().unwrap();
        socket.close().unwrap();

        assert_eof(&mut alice).await;
    }
}
