//! # parley-protocol
//!
//! Wire protocol definitions for the Parley signaling server.
//!
//! Peers exchange small JSON envelopes with the server. Routed messages
//! (`OFFER`, `ANSWER`, `CANDIDATE`, `LEAVE`, ...) carry an opaque payload from
//! one peer to another; control messages (`OPEN`, `ERROR`, `ID-TAKEN`) are
//! emitted by the server during the handshake.
//!
//! ## Example
//!
//! ```rust
//! use parley_protocol::{codec, Message, MessageType};
//! use serde_json::json;
//!
//! let offer = Message::routed(MessageType::Offer, "bob", json!({ "sdp": "v=0" }));
//!
//! let text = codec::to_text(&offer).unwrap();
//! let parsed = codec::parse_text(&text).unwrap();
//! assert_eq!(parsed, offer);
//! ```

pub mod codec;
pub mod message;

pub use codec::{parse, parse_text, ProtocolError};
pub use message::{reasons, Message, MessageType};
