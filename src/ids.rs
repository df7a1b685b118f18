//! Identifier codecs: the stable, externally-visible names for rooms,
//! participants, logins and messages.
//!
//! Room and participant identifiers are `network:name` with the name in
//! case-folded form, so they never change when the display case does. The
//! original-case spelling lives in a side lookup ([`NameBook`]) keyed by the
//! folded form; the first observed spelling wins.
//!
//! Message identifiers are tiered. A server-assigned `msgid` token produces a
//! *proper* identifier that round-trips back to the token; without one, a
//! `server-time` tag or, last, a coarse timestamp plus content hash produce
//! stable-ish identifiers that cannot be round-tripped.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use gangway_proto::Message;
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::{ClientError, ClientResult};

/// Externally-visible room identifier (`network:folded-name`).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RoomId(pub String);

/// Externally-visible participant identifier (`network:folded-nick`).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct UserId(pub String);

/// Identifier for one logical user's session on one network
/// (`network:account`).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LoginId(pub String);

/// Externally-visible message identifier (`network:tier:payload`).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MessageId(pub String);

macro_rules! display_as_inner {
    ($($ty:ty),*) => {$(
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
        impl $ty {
            /// The raw identifier string.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }
    )*};
}

display_as_inner!(RoomId, UserId, LoginId, MessageId);

/// Check that a protocol name can live inside an identifier: no embedded
/// spaces, no leading `:`.
pub fn valid_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(' ') && !name.starts_with(':')
}

/// Build a room identifier from a network name and an already-folded room
/// name.
pub fn make_room_id(network: &str, folded_name: &str) -> RoomId {
    RoomId(format!("{}:{}", network, folded_name))
}

/// Parse a room identifier into network and folded room name.
///
/// Rejects structurally malformed identifiers; whether the name is folded for
/// the *current* profile is the session's concern.
pub fn parse_room_id(id: &RoomId) -> ClientResult<(&str, &str)> {
    split_name_id(&id.0).ok_or_else(|| ClientError::InvalidIdentifier(id.0.clone()))
}

/// Build a participant identifier from a network name and an already-folded
/// nick.
pub fn make_user_id(network: &str, folded_nick: &str) -> UserId {
    UserId(format!("{}:{}", network, folded_nick))
}

/// Parse a participant identifier into network and folded nick.
pub fn parse_user_id(id: &UserId) -> ClientResult<(&str, &str)> {
    split_name_id(&id.0).ok_or_else(|| ClientError::InvalidIdentifier(id.0.clone()))
}

fn split_name_id(raw: &str) -> Option<(&str, &str)> {
    let (network, name) = raw.split_once(':')?;
    if network.is_empty() || !valid_name(name) {
        return None;
    }
    Some((network, name))
}

/// Build a login identifier from a network name and a host account name.
pub fn make_login_id(network: &str, account: &str) -> LoginId {
    LoginId(format!("{}:{}", network, account))
}

/// Parse a login identifier into network and account.
pub fn parse_login_id(id: &LoginId) -> ClientResult<(&str, &str)> {
    id.0.split_once(':')
        .filter(|(net, acct)| !net.is_empty() && !acct.is_empty())
        .ok_or_else(|| ClientError::InvalidIdentifier(id.0.clone()))
}

/// Build a proper (tier-a) message identifier from a server token.
pub fn make_proper_message_id(network: &str, token: &str) -> MessageId {
    MessageId(format!("{}:id:{}", network, token))
}

/// Derive a message identifier from an observed message, best tier first.
///
/// Tier `id` uses the server's `msgid` tag and round-trips. Tier `time` keys
/// on the `server-time` tag. Tier `hash` is the last resort: a
/// minute-granularity timestamp plus a truncated content hash — two messages
/// with identical bodies inside the same minute may collide, which is an
/// accepted limitation of serverless identity, not a defect.
pub fn make_message_id(network: &str, msg: &Message, now: DateTime<Utc>) -> MessageId {
    if let Some(token) = msg.msgid() {
        return make_proper_message_id(network, token);
    }
    let target = msg.param(0).unwrap_or_default();
    let source = msg
        .prefix
        .as_ref()
        .map(|p| p.to_string())
        .unwrap_or_default();
    if let Some(ts) = msg.server_time() {
        return MessageId(format!("{}:time:{}:{}:{}", network, target, source, ts));
    }
    let mut hasher = Sha256::new();
    hasher.update(msg.param(1).unwrap_or_default().as_bytes());
    let hash = hasher.finalize();
    let minute = now.timestamp() / 60;
    let mut hex = String::with_capacity(32);
    for b in &hash[..16] {
        hex.push_str(&format!("{:02x}", b));
    }
    MessageId(format!(
        "{}:hash:{}:{}:{}:{}",
        network, target, source, minute, hex
    ))
}

impl MessageId {
    /// The server-assigned token, if this is a proper (tier-a) identifier.
    ///
    /// Only proper identifiers can be round-tripped to the server for
    /// redaction or reaction targeting; the `time` and `hash` tiers return
    /// `None`.
    pub fn proper_token(&self) -> Option<&str> {
        let mut parts = self.0.splitn(3, ':');
        let _network = parts.next()?;
        match (parts.next(), parts.next()) {
            (Some("id"), Some(token)) if !token.is_empty() => Some(token),
            _ => None,
        }
    }

    /// Whether this identifier carries a server-assigned token.
    pub fn is_proper(&self) -> bool {
        self.proper_token().is_some()
    }
}

/// Concurrent side lookup from folded names to the display spelling first
/// observed on the wire.
#[derive(Debug, Default)]
pub struct NameBook {
    names: DashMap<String, String>,
}

impl NameBook {
    /// Create an empty book.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a display spelling for a folded name. The first observed
    /// spelling is kept; later variants are ignored.
    pub fn record(&self, folded: &str, display: &str) {
        self.names
            .entry(folded.to_string())
            .or_insert_with(|| display.to_string());
    }

    /// Look up the display spelling, falling back to the folded form.
    pub fn display_for(&self, folded: &str) -> String {
        self.names
            .get(folded)
            .map(|r| r.value().clone())
            .unwrap_or_else(|| folded.to_string())
    }
}
