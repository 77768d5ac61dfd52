//! Message envelope for the Parley protocol.
//!
//! Every message exchanged between peers and the server is a flat JSON
//! object of the form `{ type, src?, dst?, payload?, msg? }`. The server only
//! interprets the control types; `payload` is carried through untouched.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Message type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum MessageType {
    /// Handshake accepted.
    Open,
    /// Peer is leaving the session with `dst`.
    Leave,
    /// ICE candidate relay.
    Candidate,
    /// Session description offer.
    Offer,
    /// Session description answer.
    Answer,
    /// A buffered message for `src` expired before delivery.
    Expire,
    /// Keepalive from a client.
    Heartbeat,
    /// The requested id is held by another token.
    IdTaken,
    /// Handshake rejected.
    Error,
}

impl MessageType {
    /// The name used on the wire.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Open => "OPEN",
            MessageType::Leave => "LEAVE",
            MessageType::Candidate => "CANDIDATE",
            MessageType::Offer => "OFFER",
            MessageType::Answer => "ANSWER",
            MessageType::Expire => "EXPIRE",
            MessageType::Heartbeat => "HEARTBEAT",
            MessageType::IdTaken => "ID-TAKEN",
            MessageType::Error => "ERROR",
        }
    }

    /// Whether this is a server-emitted control type rather than a routed one.
    #[must_use]
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            MessageType::Open | MessageType::IdTaken | MessageType::Error
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<MessageType> for String {
    fn from(kind: MessageType) -> String {
        kind.as_str().to_string()
    }
}

impl TryFrom<String> for MessageType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, <Self as TryFrom<String>>::Error> {
        match value.as_str() {
            "OPEN" => Ok(MessageType::Open),
            "LEAVE" => Ok(MessageType::Leave),
            "CANDIDATE" => Ok(MessageType::Candidate),
            "OFFER" => Ok(MessageType::Offer),
            "ANSWER" => Ok(MessageType::Answer),
            "EXPIRE" => Ok(MessageType::Expire),
            "HEARTBEAT" => Ok(MessageType::Heartbeat),
            "ID-TAKEN" => Ok(MessageType::IdTaken),
            "ERROR" => Ok(MessageType::Error),
            other => Err(format!("unknown message type `{other}`")),
        }
    }
}

/// Reasons carried by `ERROR` messages.
pub mod reasons {
    pub const INVALID_PARAMETERS: &str = "No id, token, or key supplied to websocket server";
    pub const INVALID_KEY: &str = "Invalid key provided";
    pub const CONNECTION_LIMIT_EXCEEDED: &str = "Server has reached its concurrent user limit";
    pub const ID_TAKEN: &str = "ID is taken";
}

/// A protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Message type.
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Sender id. Always set by the server for routed messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
    /// Destination id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst: Option<String>,
    /// Opaque application data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Human-readable explanation for control messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
}

impl Message {
    /// Create a bare message of the given type.
    #[must_use]
    pub fn new(kind: MessageType) -> Self {
        Self {
            kind,
            src: None,
            dst: None,
            payload: None,
            msg: None,
        }
    }

    /// Create a routed message addressed to `dst`.
    #[must_use]
    pub fn routed(kind: MessageType, dst: impl Into<String>, payload: Value) -> Self {
        Self::new(kind).with_dst(dst).with_payload(payload)
    }

    /// Create an `OPEN` handshake confirmation.
    #[must_use]
    pub fn open() -> Self {
        Self::new(MessageType::Open)
    }

    /// Create an `ERROR` message with a reason.
    #[must_use]
    pub fn error(reason: impl Into<String>) -> Self {
        Self::new(MessageType::Error).with_msg(reason)
    }

    /// Create an `ID-TAKEN` message.
    #[must_use]
    pub fn id_taken() -> Self {
        Self::new(MessageType::IdTaken).with_msg(reasons::ID_TAKEN)
    }

    /// Create an `EXPIRE` notice telling `sender` that its message to
    /// `dropped_dst` was discarded.
    #[must_use]
    pub fn expire(dropped_dst: impl Into<String>, sender: impl Into<String>) -> Self {
        Self::new(MessageType::Expire)
            .with_src(dropped_dst)
            .with_dst(sender)
    }

    #[must_use]
    pub fn with_src(mut self, src: impl Into<String>) -> Self {
        self.src = Some(src.into());
        self
    }

    #[must_use]
    pub fn with_dst(mut self, dst: impl Into<String>) -> Self {
        self.dst = Some(dst.into());
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    #[must_use]
    pub fn with_msg(mut self, msg: impl Into<String>) -> Self {
        self.msg = Some(msg.into());
        self
    }
}
