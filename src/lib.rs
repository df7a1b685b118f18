//! # gangway
//!
//! The network-facing half of an IRC puppeting bridge: one engine instance
//! per logical user per network. The engine owns the connection lifecycle
//! (capability negotiation, SASL, linear-backoff reconnects), correlates
//! locally-issued commands with their confirmations on a wire that has no
//! native request/response framing, caches per-room topic and membership
//! with cascading updates, and derives the stable identifiers that tie
//! protocol names to the bridge host's world.
//!
//! Everything durable lives on the other side of the [`host::BridgeHost`]
//! trait; the engine holds no storage of its own and survives reconnects
//! in place.
//!
//! Wire-level parsing lives in the companion crate `gangway-proto`.

#![deny(clippy::all)]
#![warn(missing_docs)]

pub mod cache;
pub mod client;
pub mod config;
pub mod correlate;
pub mod error;
pub mod events;
mod handlers;
pub mod host;
pub mod ids;
pub mod registry;

pub use client::{IrcClient, SentMessage};
pub use config::{LoginConfig, NetworkConfig};
pub use error::{ClientError, ClientResult};
pub use events::{EventMeta, EventSender, MemberChange, MessageKind, RemoteEvent};
pub use host::{BridgeHost, BridgeStatus};
pub use ids::{LoginId, MessageId, RoomId, UserId};
pub use registry::ClientRegistry;
