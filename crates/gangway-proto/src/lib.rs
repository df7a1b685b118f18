//! # gangway-proto
//!
//! The wire-protocol half of gangway: parsing and serializing IRC messages
//! with IRCv3 message tags, plus the server-advertised naming rules a client
//! needs to normalize names (case mapping, channel prefixes, membership
//! prefixes).
//!
//! ## Quick Start
//!
//! ```rust
//! use gangway_proto::Message;
//!
//! let raw = "@time=2023-01-01T12:00:00Z :nick!user@host PRIVMSG #channel :Hello!";
//! let msg: Message = raw.parse().expect("valid IRC message");
//!
//! assert_eq!(msg.command, "PRIVMSG");
//! assert_eq!(msg.source_nickname(), Some("nick"));
//! assert_eq!(msg.tag_value("time"), Some("2023-01-01T12:00:00Z"));
//! ```

#![deny(clippy::all)]
#![warn(missing_docs)]

pub mod casemap;
pub mod error;
pub mod irc;
pub mod isupport;
pub mod line;
pub mod message;
pub mod prefix;
pub mod tags;

pub use casemap::CaseMapping;
pub use error::{MessageParseError, ProtocolError};
pub use irc::IrcCodec;
pub use isupport::Isupport;
pub use message::{Message, Tag};
pub use prefix::Prefix;
