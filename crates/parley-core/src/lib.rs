//! # parley-core
//!
//! The signaling core of the Parley server.
//!
//! - **Realm** - Registry of identities and their pending-message queues
//! - **Gateway** - Transport-agnostic handshake and event normalization
//! - **Router** - Forward-or-buffer delivery between identities
//! - **LivenessSweeper** - Evicts identities that went silent
//! - **QueueExpirer** - Discards buffered messages past their TTL
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐  events  ┌─────────────┐     ┌─────────────┐
//! │  Gateway  │─────────▶│   Router    │────▶│   Socket    │
//! └───────────┘          └─────────────┘     └─────────────┘
//!       │                       │
//!       ▼                       ▼
//! ┌──────────────────────────────────┐
//! │              Realm               │◀── LivenessSweeper
//! │   clients  ·  pending queues     │◀── QueueExpirer
//! └──────────────────────────────────┘
//! ```

pub mod client;
pub mod expirer;
pub mod gateway;
pub mod liveness;
pub mod realm;
pub mod router;
pub mod schedule;
pub mod socket;

#[cfg(test)]
mod testing;

pub use client::{Client, Identity};
pub use expirer::{ExpirerConfig, QueueExpirer};
pub use gateway::{
    Gateway, GatewayConfig, GatewayError, GatewayEvent, HandshakeParams, Inbound, Rejection,
};
pub use liveness::{CloseCallback, LivenessConfig, LivenessSweeper};
pub use realm::{Realm, RealmError, RealmStats, Registration, Registry};
pub use router::{Delivery, Router};
pub use socket::{next_socket_id, Socket, SocketError, SocketId};
