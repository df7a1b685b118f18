//! Owned IRC message type, parsing and serialization.
//!
//! A client engine has to forward and correlate commands it does not model
//! (vendor extensions, arbitrary numerics), so the command is kept as a plain
//! string with a parameter vector rather than an exhaustive enum.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::error::{MessageParseError, ProtocolError};
use crate::prefix::Prefix;
use crate::tags::{escape_tag_value, unescape_tag_value};

/// A single IRCv3 message tag: key and optional value.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Tag(pub String, pub Option<String>);

/// An owned IRC message.
///
/// Contains the complete parsed representation of an IRC message including
/// optional IRCv3 tags, optional prefix/source, and the command with its
/// parameters.
///
/// # Example
///
/// ```
/// use gangway_proto::Message;
///
/// let msg: Message = ":nick!user@host PRIVMSG #channel :Hello!".parse().unwrap();
/// assert_eq!(msg.command, "PRIVMSG");
/// assert_eq!(msg.param(0), Some("#channel"));
/// assert_eq!(msg.param(1), Some("Hello!"));
/// ```
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Message {
    /// IRCv3 message tags (e.g., `time`, `msgid`).
    pub tags: Option<Vec<Tag>>,
    /// Message prefix/source (e.g., `nick!user@host`).
    pub prefix: Option<Prefix>,
    /// The command name, uppercased for word commands (e.g., `PRIVMSG`, `005`).
    pub command: String,
    /// Command parameters, trailing parameter last.
    pub params: Vec<String>,
}

impl Message {
    /// Create a new message from a command and parameters.
    pub fn new(command: impl Into<String>, params: Vec<String>) -> Self {
        Message {
            tags: None,
            prefix: None,
            command: command.into(),
            params,
        }
    }

    /// Create a new message from string slices.
    pub fn from_args(command: &str, params: &[&str]) -> Self {
        Message::new(command, params.iter().map(|s| s.to_string()).collect())
    }

    /// Attach a tag, replacing any existing tag with the same key.
    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: Option<String>) -> Self {
        let key = key.into();
        let tags = self.tags.get_or_insert_with(Vec::new);
        tags.retain(|Tag(k, _)| *k != key);
        tags.push(Tag(key, value));
        self
    }

    /// Attach a prefix.
    #[must_use]
    pub fn with_prefix(mut self, prefix: Prefix) -> Self {
        self.prefix = Some(prefix);
        self
    }

    /// Get a parameter by index.
    pub fn param(&self, idx: usize) -> Option<&str> {
        self.params.get(idx).map(String::as_str)
    }

    /// Get the nickname from the message prefix, if present.
    pub fn source_nickname(&self) -> Option<&str> {
        self.prefix.as_ref().and_then(Prefix::nick)
    }

    /// Get the value of an IRCv3 tag by key.
    pub fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags
            .as_ref()?
            .iter()
            .find(|Tag(k, _)| k == key)
            .and_then(|Tag(_, v)| v.as_deref())
    }

    /// Get the server-time tag value, unparsed.
    pub fn server_time(&self) -> Option<&str> {
        self.tag_value("time")
    }

    /// Get the server-time tag as a UTC timestamp.
    pub fn server_time_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(self.server_time()?)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }

    /// Get the labeled-response label tag.
    pub fn label(&self) -> Option<&str> {
        self.tag_value("label")
    }

    /// Get the message ID tag.
    pub fn msgid(&self) -> Option<&str> {
        self.tag_value("msgid")
    }

    /// Get the batch reference tag, marking membership in an open batch.
    pub fn batch_ref(&self) -> Option<&str> {
        self.tag_value("batch")
    }

    /// Whether the command is a three-digit numeric reply.
    pub fn is_numeric(&self) -> bool {
        self.command.len() == 3 && self.command.bytes().all(|b| b.is_ascii_digit())
    }
}

fn valid_command(cmd: &str) -> bool {
    !cmd.is_empty() && cmd.bytes().all(|b| b.is_ascii_alphanumeric())
}

impl FromStr for Message {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Message, Self::Err> {
        let invalid = |cause| ProtocolError::InvalidMessage {
            string: s.to_owned(),
            cause,
        };

        let mut rest = s.trim_end_matches(&['\r', '\n'][..]);
        if rest.is_empty() {
            return Err(invalid(MessageParseError::EmptyMessage));
        }

        // @tags
        let mut tags = None;
        if let Some(after) = rest.strip_prefix('@') {
            let (raw_tags, remainder) = after
                .split_once(' ')
                .ok_or_else(|| invalid(MessageParseError::InvalidCommand))?;
            tags = Some(
                raw_tags
                    .split(';')
                    .filter(|t| !t.is_empty())
                    .map(|t| match t.split_once('=') {
                        Some((k, v)) => Tag(k.to_string(), Some(unescape_tag_value(v))),
                        None => Tag(t.to_string(), None),
                    })
                    .collect::<Vec<_>>(),
            );
            rest = remainder.trim_start_matches(' ');
        }

        // :prefix
        let mut prefix = None;
        if let Some(after) = rest.strip_prefix(':') {
            let (raw_prefix, remainder) = after
                .split_once(' ')
                .ok_or_else(|| invalid(MessageParseError::InvalidCommand))?;
            if raw_prefix.is_empty() || raw_prefix.contains(['\0', ' ']) {
                return Err(invalid(MessageParseError::InvalidPrefix(
                    raw_prefix.to_owned(),
                )));
            }
            prefix = Some(Prefix::new_from_str(raw_prefix));
            rest = remainder.trim_start_matches(' ');
        }

        // COMMAND
        let (command, remainder) = match rest.split_once(' ') {
            Some((c, r)) => (c, r),
            None => (rest, ""),
        };
        if !valid_command(command) {
            return Err(invalid(MessageParseError::InvalidCommand));
        }

        // params, with an optional :trailing
        let mut params = Vec::new();
        let mut rest = remainder;
        loop {
            rest = rest.trim_start_matches(' ');
            if rest.is_empty() {
                break;
            }
            if let Some(trailing) = rest.strip_prefix(':') {
                params.push(trailing.to_string());
                break;
            }
            match rest.split_once(' ') {
                Some((p, r)) => {
                    params.push(p.to_string());
                    rest = r;
                }
                None => {
                    params.push(rest.to_string());
                    break;
                }
            }
        }

        Ok(Message {
            tags,
            prefix,
            command: command.to_ascii_uppercase(),
            params,
        })
    }
}

impl fmt::Display for Message {
    /// Serialize to wire format, without the trailing CRLF.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(tags) = &self.tags {
            if !tags.is_empty() {
                write!(f, "@")?;
                for (i, Tag(k, v)) in tags.iter().enumerate() {
                    if i > 0 {
                        write!(f, ";")?;
                    }
                    write!(f, "{}", k)?;
                    if let Some(v) = v {
                        write!(f, "={}", escape_tag_value(v))?;
                    }
                }
                write!(f, " ")?;
            }
        }
        if let Some(prefix) = &self.prefix {
            write!(f, ":{} ", prefix)?;
        }
        write!(f, "{}", self.command)?;
        if let Some((last, init)) = self.params.split_last() {
            for p in init {
                write!(f, " {}", p)?;
            }
            if last.is_empty() || last.starts_with(':') || last.contains(' ') {
                write!(f, " :{}", last)?;
            } else {
                write!(f, " {}", last)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_ping() {
        let msg: Message = "PING :server\r\n".parse().unwrap();
        assert_eq!(msg.command, "PING");
        assert_eq!(msg.params, vec!["server"]);
    }

    #[test]
    fn test_parse_privmsg() {
        let msg: Message = ":nick!user@host PRIVMSG #channel :Hello, world!\r\n"
            .parse()
            .unwrap();
        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.source_nickname(), Some("nick"));
        assert_eq!(msg.params, vec!["#channel", "Hello, world!"]);
    }

    #[test]
    fn test_parse_with_tags() {
        let msg: Message = "@time=2023-01-01T00:00:00Z;msgid=abc123 :nick PRIVMSG #ch :Hi\r\n"
            .parse()
            .unwrap();
        assert_eq!(msg.tag_value("time"), Some("2023-01-01T00:00:00Z"));
        assert_eq!(msg.msgid(), Some("abc123"));
    }

    #[test]
    fn test_parse_escaped_tag_value() {
        let msg: Message = "@key=value\\swith\\sspace PING :test\r\n".parse().unwrap();
        assert_eq!(msg.tag_value("key"), Some("value with space"));
    }

    #[test]
    fn test_parse_valueless_tag() {
        let msg: Message = "@+typing PING x".parse().unwrap();
        assert!(msg.tags.as_ref().unwrap().iter().any(|Tag(k, v)| k == "+typing" && v.is_none()));
        assert_eq!(msg.tag_value("+typing"), None);
    }

    #[test]
    fn test_parse_empty_message() {
        assert!("".parse::<Message>().is_err());
        assert!("\r\n".parse::<Message>().is_err());
    }

    #[test]
    fn test_parse_numeric() {
        let msg: Message = ":server 001 nick :Welcome to IRC\r\n".parse().unwrap();
        assert_eq!(msg.command, "001");
        assert!(msg.is_numeric());
    }

    #[test]
    fn test_parse_middle_params_and_trailing() {
        let msg: Message = ":server 353 me = #chan :@alice +bob carol".parse().unwrap();
        assert_eq!(
            msg.params,
            vec!["me", "=", "#chan", "@alice +bob carol"]
        );
    }

    #[test]
    fn test_command_uppercased() {
        let msg: Message = "privmsg #chan :hi".parse().unwrap();
        assert_eq!(msg.command, "PRIVMSG");
    }

    #[test]
    fn test_invalid_command_rejected() {
        assert!(":prefix".parse::<Message>().is_err());
        assert!("@tag=1".parse::<Message>().is_err());
        assert!("PRIV/MSG #chan hi".parse::<Message>().is_err());
    }

    #[test]
    fn test_display_roundtrip() {
        let lines = [
            "PING server",
            ":nick!user@host PRIVMSG #channel :Hello, world!",
            "@msgid=abc :nick TAGMSG #chan",
            ":server 353 me = #chan :@alice +bob",
            "JOIN #chan",
        ];
        for line in lines {
            let msg: Message = line.parse().unwrap();
            assert_eq!(msg.to_string(), line);
        }
    }

    #[test]
    fn test_display_escapes_tag_values() {
        let msg = Message::from_args("TAGMSG", &["#chan"])
            .with_tag("+draft/react", Some("a;b c".to_string()));
        assert_eq!(msg.to_string(), "@+draft/react=a\\:b\\sc TAGMSG #chan");
    }

    #[test]
    fn test_display_trailing_rules() {
        // Embedded space forces the trailing colon
        let msg = Message::from_args("PRIVMSG", &["#chan", "two words"]);
        assert_eq!(msg.to_string(), "PRIVMSG #chan :two words");
        // Empty trailing is kept explicit
        let msg = Message::from_args("TAGMSG", &["#chan", ""]);
        assert_eq!(msg.to_string(), "TAGMSG #chan :");
    }

    #[test]
    fn test_with_tag_replaces() {
        let msg = Message::from_args("PRIVMSG", &["#c", "x"])
            .with_tag("label", Some("1".into()))
            .with_tag("label", Some("2".into()));
        assert_eq!(msg.label(), Some("2"));
        assert_eq!(msg.tags.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn test_server_time_utc() {
        let msg: Message = "@time=2023-06-15T10:20:30.123Z :a!b@c PRIVMSG #x :hi"
            .parse()
            .unwrap();
        let ts = msg.server_time_utc().unwrap();
        assert_eq!(ts.timestamp(), 1_686_824_430);
    }
}
