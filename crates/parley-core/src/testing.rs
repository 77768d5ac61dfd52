//! Test doubles shared by the unit tests in this crate.

use crate::socket::{next_socket_id, Socket, SocketError, SocketId};
use parking_lot::Mutex;
use parley_protocol::{Message, MessageType, ProtocolError};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// A socket that records everything written to it.
#[derive(Default)]
pub struct MockSocket {
    id: SocketId,
    sent: Mutex<Vec<Message>>,
    closed: AtomicBool,
    close_calls: AtomicUsize,
    fail_close: bool,
    fail_send: AtomicBool,
    rejected: Mutex<Vec<Value>>,
}

impl MockSocket {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: next_socket_id(),
            ..Default::default()
        })
    }

    /// A socket whose `close` always errors.
    pub fn failing_close() -> Arc<Self> {
        Arc::new(Self {
            id: next_socket_id(),
            fail_close: true,
            ..Default::default()
        })
    }

    /// Make subsequent sends fail as if the peer vanished.
    pub fn break_pipe(&self) {
        self.fail_send.store(true, Ordering::SeqCst);
    }

    /// Make sends of messages carrying `payload` fail to encode.
    pub fn reject_payload(&self, payload: Value) {
        self.rejected.lock().push(payload);
    }

    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().clone()
    }

    pub fn sent_kinds(&self) -> Vec<MessageType> {
        self.sent.lock().iter().map(|m| m.kind).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

impl Socket for MockSocket {
    fn id(&self) -> SocketId {
        self.id
    }

    fn send(&self, message: &Message) -> Result<(), SocketError> {
        if self.is_closed() || self.fail_send.load(Ordering::SeqCst) {
            return Err(SocketError::Closed);
        }
        if let Some(payload) = &message.payload {
            if self.rejected.lock().contains(payload) {
                return Err(SocketError::Encode(ProtocolError::FrameTooLarge(usize::MAX)));
            }
        }
        self.sent.lock().push(message.clone());
        Ok(())
    }

    fn close(&self) -> Result<(), SocketError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        if self.fail_close {
            return Err(SocketError::Closed);
        }
        Ok(())
    }

    fn transport(&self) -> &'static str {
        "mock"
    }
}
