//! IRC message prefix types.
//!
//! An IRC message prefix identifies the origin of a message. It can be either
//! a server name or a user's nick!user@host mask.

use std::fmt;
use std::str::FromStr;

/// IRC message prefix - identifies the origin of a message.
///
/// A prefix can be either a server name (containing a dot) or a user's
/// nick!user@host identifier.
#[derive(Clone, Eq, PartialEq, Debug, Hash)]
pub enum Prefix {
    /// Server name (e.g., "irc.example.com")
    ServerName(String),
    /// User prefix: (nickname, username, hostname)
    Nickname(String, String, String),
}

impl Prefix {
    /// Parse a prefix string into a Prefix.
    ///
    /// This is a lenient parser that does not validate the components.
    pub fn new_from_str(s: &str) -> Self {
        #[derive(Copy, Clone, Eq, PartialEq)]
        enum Part {
            Name,
            User,
            Host,
        }

        let mut name = String::new();
        let mut user = String::new();
        let mut host = String::new();
        let mut part = Part::Name;
        let mut is_server = false;

        for c in s.chars() {
            // A dot in the name part (before ! or @) suggests server name
            if c == '.' && part == Part::Name {
                is_server = true;
            }

            match c {
                '!' if part == Part::Name => {
                    is_server = false;
                    part = Part::User;
                }
                '@' if part != Part::Host => {
                    is_server = false;
                    part = Part::Host;
                }
                _ => {
                    match part {
                        Part::Name => &mut name,
                        Part::User => &mut user,
                        Part::Host => &mut host,
                    }
                    .push(c);
                }
            }
        }

        if is_server {
            Prefix::ServerName(name)
        } else {
            Prefix::Nickname(name, user, host)
        }
    }

    /// Create a new user prefix from nick, user, and host components.
    pub fn new(nick: impl Into<String>, user: impl Into<String>, host: impl Into<String>) -> Self {
        Prefix::Nickname(nick.into(), user.into(), host.into())
    }

    /// Get the nickname if this is a user prefix.
    pub fn nick(&self) -> Option<&str> {
        match self {
            Prefix::Nickname(nick, _, _) if !nick.is_empty() => Some(nick),
            _ => None,
        }
    }

    /// Get the username if this is a user prefix.
    pub fn user(&self) -> Option<&str> {
        match self {
            Prefix::Nickname(_, user, _) if !user.is_empty() => Some(user),
            _ => None,
        }
    }

    /// Get the hostname.
    pub fn host(&self) -> Option<&str> {
        match self {
            Prefix::ServerName(name) => Some(name),
            Prefix::Nickname(_, _, host) if !host.is_empty() => Some(host),
            _ => None,
        }
    }

    /// Whether this prefix names a server rather than a user.
    pub fn is_server(&self) -> bool {
        matches!(self, Prefix::ServerName(_))
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Prefix::ServerName(name) => write!(f, "{}", name),
            Prefix::Nickname(nick, user, host) => {
                write!(f, "{}", nick)?;
                if !user.is_empty() {
                    write!(f, "!{}", user)?;
                }
                if !host.is_empty() {
                    write!(f, "@{}", host)?;
                }
                Ok(())
            }
        }
    }
}

impl FromStr for Prefix {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Prefix::new_from_str(s))
    }
}

impl From<&str> for Prefix {
    fn from(s: &str) -> Self {
        Prefix::new_from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_server_name() {
        let p = Prefix::new_from_str("irc.example.com");
        assert_eq!(p, Prefix::ServerName("irc.example.com".into()));
        assert!(p.is_server());
        assert_eq!(p.nick(), None);
    }

    #[test]
    fn test_parse_full_user() {
        let p = Prefix::new_from_str("nick!user@host.example.com");
        assert_eq!(p.nick(), Some("nick"));
        assert_eq!(p.user(), Some("user"));
        assert_eq!(p.host(), Some("host.example.com"));
    }

    #[test]
    fn test_parse_bare_nick() {
        let p = Prefix::new_from_str("nick");
        assert_eq!(p, Prefix::Nickname("nick".into(), String::new(), String::new()));
        assert_eq!(p.nick(), Some("nick"));
        assert_eq!(p.user(), None);
    }

    #[test]
    fn test_dotted_nick_with_user_is_not_server() {
        // The ! makes it a user prefix even though the name contains a dot
        let p = Prefix::new_from_str("we.ird!user@host");
        assert_eq!(p.nick(), Some("we.ird"));
    }

    #[test]
    fn test_display_roundtrip() {
        for s in ["irc.example.com", "nick!user@host", "nick@host", "nick"] {
            assert_eq!(Prefix::new_from_str(s).to_string(), s);
        }
    }
}
