//! Normalized events delivered to the bridge host.
//!
//! Everything the reader task learns from the wire that the host cares about
//! crosses this boundary as a [`RemoteEvent`]. Message bodies are carried in
//! wire format (mIRC control codes and all); transcoding to rich text is the
//! host's concern.

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::ids::{MessageId, RoomId, UserId};

/// The originator of an event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventSender {
    /// Participant identifier.
    pub id: UserId,
    /// Whether the originator is this session's own identity.
    pub is_from_me: bool,
}

/// Common event envelope: where, who, when.
#[derive(Clone, Debug)]
pub struct EventMeta {
    /// Room the event belongs to.
    pub room: RoomId,
    /// Originator, when the protocol names one.
    pub sender: Option<EventSender>,
    /// Logical timestamp from the `server-time` tag, when present.
    pub timestamp: Option<DateTime<Utc>>,
}

/// Classification of a chat message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    /// Ordinary message.
    Text,
    /// Notice (never auto-replied to).
    Notice,
    /// CTCP ACTION (`/me`).
    Emote,
}

/// One membership mutation inside a room.
#[derive(Clone, Debug)]
pub enum MemberChange {
    /// A participant joined.
    Join {
        /// Who joined.
        member: EventSender,
        /// Power level derived from the membership prefix.
        power_level: u32,
    },
    /// A participant left (part, kick-free quit, disconnect).
    Leave {
        /// Who left.
        member: EventSender,
        /// Free-form reason, when the protocol carried one.
        reason: Option<String>,
    },
    /// A participant was renamed; power level carries over.
    Rename {
        /// Identity before the rename.
        old: EventSender,
        /// Identity after the rename.
        new: EventSender,
        /// Carried-over power level.
        power_level: u32,
    },
}

/// A normalized event for the bridge host.
#[derive(Clone, Debug)]
pub enum RemoteEvent {
    /// A chat message arrived.
    Message {
        /// Envelope.
        meta: EventMeta,
        /// Stable message identifier (see [`crate::ids::make_message_id`]).
        id: MessageId,
        /// Message classification.
        kind: MessageKind,
        /// Wire-format body.
        body: String,
        /// Proper identifier of the replied-to message, when threaded.
        reply_to: Option<MessageId>,
    },
    /// A message was redacted.
    MessageRemove {
        /// Envelope.
        meta: EventMeta,
        /// Proper identifier of the removed message.
        target: MessageId,
    },
    /// A reaction arrived.
    Reaction {
        /// Envelope.
        meta: EventMeta,
        /// Proper identifier of the reacted-to message.
        target: MessageId,
        /// Reaction content as sent.
        emoji: String,
        /// Server token of the reaction message itself, for later removal.
        reaction_msgid: Option<String>,
    },
    /// Room membership changed.
    MembershipChange {
        /// Envelope.
        meta: EventMeta,
        /// What changed.
        change: MemberChange,
    },
    /// The room topic changed.
    TopicChange {
        /// Envelope.
        meta: EventMeta,
        /// New topic text (wire format).
        topic: String,
    },
    /// A typing indicator arrived.
    Typing {
        /// Envelope.
        meta: EventMeta,
        /// How long the indicator stays live; zero means stopped typing.
        timeout: Duration,
    },
    /// The room's cached state became authoritative; the host should
    /// resynchronize its view.
    Resync {
        /// Envelope.
        meta: EventMeta,
    },
}

impl RemoteEvent {
    /// Access the common envelope.
    pub fn meta(&self) -> &EventMeta {
        match self {
            RemoteEvent::Message { meta, .. }
            | RemoteEvent::MessageRemove { meta, .. }
            | RemoteEvent::Reaction { meta, .. }
            | RemoteEvent::MembershipChange { meta, .. }
            | RemoteEvent::TopicChange { meta, .. }
            | RemoteEvent::Typing { meta, .. }
            | RemoteEvent::Resync { meta } => meta,
        }
    }
}
