//! Inbound event dispatch and state handlers.
//!
//! The reader task feeds every unclaimed inbound message through
//! [`Inner::dispatch`], a matcher built once per session over the commands
//! this engine models. Handlers mutate the channel cache and emit normalized
//! events; anything unrecognized is traced and dropped — remote garbage never
//! tears down the connection.

use chrono::Utc;
use gangway_proto::{Message, Prefix};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, trace};

use crate::client::Inner;
use crate::events::{EventMeta, MemberChange, MessageKind, RemoteEvent};
use crate::ids::{make_message_id, make_proper_message_id, make_room_id};

/// How long an `active` typing indicator stays live downstream.
const TYPING_TIMEOUT: Duration = Duration::from_secs(6);

/// Rewrite a CTCP ACTION (`\x01ACTION …\x01` PRIVMSG) into the
/// `CTCP_ACTION` pseudo-command so correlation and conversion see one shape.
pub(crate) fn normalize_ctcp_action(msg: &mut Message) {
    if msg.command != "PRIVMSG" {
        return;
    }
    let Some(body) = msg.param(1) else { return };
    if let Some(inner) = body
        .strip_prefix("\x01ACTION ")
        .and_then(|rest| rest.strip_suffix('\x01'))
    {
        let inner = inner.to_string();
        msg.command = "CTCP_ACTION".to_string();
        msg.params[1] = inner;
    }
}

/// Extract a non-ACTION CTCP query from a PRIVMSG body.
fn ctcp_query(body: &str) -> Option<&str> {
    body.strip_prefix('\x01')?.strip_suffix('\x01')
}

impl Inner {
    /// Route one unclaimed inbound message to its state handler.
    pub(crate) fn dispatch(&self, msg: &Message, tx: &UnboundedSender<Message>) {
        match msg.command.as_str() {
            "PRIVMSG" | "NOTICE" | "CTCP_ACTION" | "TAGMSG" | "REDACT" => {
                self.on_message(msg, tx)
            }
            "NICK" => self.on_nick(msg),
            "QUIT" => self.on_quit(msg),
            "JOIN" | "PART" => self.on_join_part(msg),
            // Power-level mode changes resync with the next member listing.
            "MODE" => trace!(target = ?msg.param(0), "ignoring mode change"),
            "TOPIC" => self.on_topic(msg),
            "332" => self.on_topic_reply(msg),
            "333" => self.on_topic_time(msg),
            "353" => self.on_names(msg),
            "366" => self.on_names_end(msg),
            "PONG" | "CHGHOST" | "AWAY" | "ACK" => {}
            "CAP" => debug!(args = ?msg.params, "post-registration CAP message"),
            _ => trace!(command = %msg.command, "unhandled command"),
        }
    }

    fn meta(&self, room_name: &str, sender: Option<&str>, msg: &Message) -> EventMeta {
        EventMeta {
            room: self.room_id(room_name),
            sender: sender.map(|nick| self.event_sender(nick)),
            timestamp: msg.server_time_utc(),
        }
    }

    fn on_message(&self, msg: &Message, tx: &UnboundedSender<Message>) {
        let Some(sender) = msg.source_nickname() else {
            return;
        };
        let Some(target) = msg.param(0) else { return };
        // Server notices and wildcard targets carry no room-scoped payload.
        if sender.is_empty() || sender.contains('.') || target == "*" {
            return;
        }

        // An unclaimed echo of our own action still flows through here (sent
        // from another client of ours); it keeps its original target room.
        let mut room_name = target;
        if !self.is_self(sender) && self.is_dm(target) {
            // Direct messages live in the peer's room, not our own nick's.
            room_name = sender;
        }

        if msg.command == "PRIVMSG" {
            if let Some(query) = msg.param(1).and_then(ctcp_query) {
                self.on_ctcp_query(sender, query, tx);
                return;
            }
        }

        trace!(source = %sender, channel = %room_name, command = %msg.command, "received message");
        let meta = self.meta(room_name, Some(sender), msg);
        match msg.command.as_str() {
            "REDACT" => {
                let Some(token) = msg.param(1) else { return };
                self.queue(RemoteEvent::MessageRemove {
                    meta,
                    target: make_proper_message_id(&self.network.name, token),
                });
            }
            "TAGMSG" => {
                if let Some(state) = msg.tag_value("+typing") {
                    let timeout = if state == "active" {
                        TYPING_TIMEOUT
                    } else {
                        Duration::ZERO
                    };
                    self.queue(RemoteEvent::Typing { meta, timeout });
                } else if let (Some(reply), Some(react)) =
                    (msg.tag_value("+draft/reply"), msg.tag_value("+draft/react"))
                {
                    self.queue(RemoteEvent::Reaction {
                        meta,
                        target: make_proper_message_id(&self.network.name, reply),
                        emoji: react.to_string(),
                        reaction_msgid: msg.msgid().map(str::to_string),
                    });
                }
            }
            _ => {
                let Some(body) = msg.param(1) else { return };
                let kind = match msg.command.as_str() {
                    "NOTICE" => MessageKind::Notice,
                    "CTCP_ACTION" => MessageKind::Emote,
                    _ => MessageKind::Text,
                };
                let reply_to = msg
                    .tag_value("+draft/reply")
                    .map(|token| make_proper_message_id(&self.network.name, token));
                self.queue(RemoteEvent::Message {
                    id: make_message_id(&self.network.name, msg, Utc::now()),
                    meta,
                    kind,
                    body: body.to_string(),
                    reply_to,
                });
            }
        }
    }

    fn on_ctcp_query(&self, sender: &str, query: &str, tx: &UnboundedSender<Message>) {
        if !self.network.ctcp {
            return;
        }
        let reply = match query.split(' ').next().unwrap_or("") {
            "VERSION" => "VERSION gangway".to_string(),
            "PING" => query.to_string(),
            "TIME" => format!("TIME {}", Utc::now().to_rfc2822()),
            _ => return,
        };
        let payload = format!("\x01{}\x01", reply);
        let _ = tx.send(Message::from_args("NOTICE", &[sender, payload.as_str()]));
    }

    fn on_nick(&self, msg: &Message) {
        let Some(prev) = msg.source_nickname() else {
            return;
        };
        let Some(new) = msg.param(0) else { return };
        if prev.is_empty() || new.is_empty() {
            return;
        }

        let prev_key = self.fold(prev);
        let new_key = self.fold(new);
        self.names.record(&new_key, new);

        if self.is_self(prev) {
            *self.current_nick.write() = new.to_string();
            self.registry
                .rename(&self.network.name, &prev_key, &new_key, self.login_id.clone());
            debug!(from = %prev, to = %new, "own nick changed");
        }

        let old_sender = self.event_sender(prev);
        let new_sender = self.event_sender(new);
        let timestamp = msg.server_time_utc();
        self.cache.rename_member(&prev_key, &new_key, |room_key, pl| {
            self.queue(RemoteEvent::MembershipChange {
                meta: EventMeta {
                    room: make_room_id(&self.network.name, room_key),
                    sender: None,
                    timestamp,
                },
                change: MemberChange::Rename {
                    old: old_sender.clone(),
                    new: new_sender.clone(),
                    power_level: pl,
                },
            });
        });
    }

    fn on_quit(&self, msg: &Message) {
        let Some(nick) = msg.source_nickname() else {
            return;
        };
        let reason = match msg.param(0) {
            None | Some("") => None,
            Some(r) if r.to_lowercase().starts_with("quit") => Some(r.to_string()),
            Some(r) => Some(format!("Quit: {}", r)),
        };

        let key = self.fold(nick);
        let member = self.event_sender(nick);
        let timestamp = msg.server_time_utc();
        self.cache.remove_member(&key, |room_key, _pl| {
            self.queue(RemoteEvent::MembershipChange {
                meta: EventMeta {
                    room: make_room_id(&self.network.name, room_key),
                    sender: Some(member.clone()),
                    timestamp,
                },
                change: MemberChange::Leave {
                    member: member.clone(),
                    reason: reason.clone(),
                },
            });
        });
    }

    fn on_join_part(&self, msg: &Message) {
        let Some(nick) = msg.source_nickname() else {
            return;
        };
        let Some(channel) = msg.param(0) else { return };
        if msg.command == "JOIN" && self.is_self(nick) {
            // The member listing that follows covers our own joins.
            return;
        }

        let room_key = self.fold(channel);
        let nick_key = self.fold(nick);
        self.names.record(&nick_key, nick);
        if msg.command == "JOIN" {
            self.cache.member_join(&room_key, &nick_key);
        } else {
            self.cache.member_part(&room_key, &nick_key);
        }

        let member = self.event_sender(nick);
        let change = if msg.command == "JOIN" {
            MemberChange::Join {
                member,
                power_level: 0,
            }
        } else {
            MemberChange::Leave {
                member,
                reason: msg.param(1).filter(|r| !r.is_empty()).map(str::to_string),
            }
        };
        let meta = self.meta(channel, Some(nick), msg);
        self.queue(RemoteEvent::MembershipChange { meta, change });
    }

    fn on_names(&self, msg: &Message) {
        let (Some(symbol), Some(channel), Some(names)) =
            (msg.param(1), msg.param(2), msg.param(3))
        else {
            return;
        };
        if symbol != "@" && symbol != "=" && symbol != "*" {
            debug!(channel = %channel, "ignoring users list");
            return;
        }
        debug!(channel = %channel, "received users list");

        let isupport = self.isupport();
        let entries: Vec<(String, u32)> = names
            .split_whitespace()
            .map(|raw| {
                let (bare, pl) = isupport.strip_member_prefix(raw);
                let key = isupport.fold(bare);
                self.names.record(&key, bare);
                (key, pl)
            })
            .collect();
        let room_key = self.fold(channel);
        self.names.record(&room_key, channel);
        self.cache.apply_names_chunk(&room_key, entries);
    }

    fn on_names_end(&self, msg: &Message) {
        let Some(channel) = msg.param(1) else { return };
        if self.cache.mark_complete(&self.fold(channel)) {
            let meta = self.meta(channel, None, msg);
            self.queue(RemoteEvent::Resync { meta });
        }
    }

    fn on_topic(&self, msg: &Message) {
        let (Some(channel), Some(topic)) = (msg.param(0), msg.param(1)) else {
            return;
        };
        let room_key = self.fold(channel);
        self.cache.set_topic(&room_key, topic.to_string());
        self.cache.set_topic_meta(
            &room_key,
            msg.source_nickname().map(str::to_string),
            Some(msg.server_time_utc().unwrap_or_else(Utc::now)),
        );
        let meta = self.meta(channel, msg.source_nickname(), msg);
        self.queue(RemoteEvent::TopicChange {
            meta,
            topic: topic.to_string(),
        });
    }

    fn on_topic_reply(&self, msg: &Message) {
        let (Some(channel), Some(topic)) = (msg.param(1), msg.param(2)) else {
            return;
        };
        self.cache.set_topic(&self.fold(channel), topic.to_string());
    }

    fn on_topic_time(&self, msg: &Message) {
        let (Some(channel), Some(setter)) = (msg.param(1), msg.param(2)) else {
            return;
        };
        let set_at = msg
            .param(3)
            .and_then(|raw| raw.parse::<i64>().ok())
            .filter(|secs| *secs > 0)
            .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0));
        let set_by = Prefix::new_from_str(setter)
            .nick()
            .map(str::to_string)
            .or_else(|| Some(setter.to_string()));
        self.cache.set_topic_meta(&self.fold(channel), set_by, set_at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_ctcp_action() {
        let mut msg: Message = ":a!b@c PRIVMSG #chan :\x01ACTION waves\x01".parse().unwrap();
        normalize_ctcp_action(&mut msg);
        assert_eq!(msg.command, "CTCP_ACTION");
        assert_eq!(msg.param(1), Some("waves"));
    }

    #[test]
    fn test_normalize_leaves_plain_messages_alone() {
        let mut msg: Message = ":a!b@c PRIVMSG #chan :just text".parse().unwrap();
        normalize_ctcp_action(&mut msg);
        assert_eq!(msg.command, "PRIVMSG");

        let mut msg: Message = ":a!b@c PRIVMSG #chan :\x01VERSION\x01".parse().unwrap();
        normalize_ctcp_action(&mut msg);
        assert_eq!(msg.command, "PRIVMSG");
    }

    #[test]
    fn test_ctcp_query_extraction() {
        assert_eq!(ctcp_query("\x01VERSION\x01"), Some("VERSION"));
        assert_eq!(ctcp_query("\x01PING 12345\x01"), Some("PING 12345"));
        assert_eq!(ctcp_query("plain"), None);
    }
}
