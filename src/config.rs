//! Per-network and per-session configuration types.
//!
//! Loading these from disk is the host application's job; the engine only
//! consumes them. `LoginConfig` round-trips through the host's durable store,
//! so it derives both serde directions.

use serde::{Deserialize, Serialize};

/// Static description of one IRC network.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    /// Stable network identifier used inside every identifier this engine
    /// produces (lowercase by convention).
    pub name: String,
    /// Human-readable name for status reporting.
    #[serde(default)]
    pub display_name: String,
    /// Server address as `host:port`.
    pub address: String,
    /// Connect with TLS.
    #[serde(default)]
    pub tls: bool,
    /// Answer CTCP VERSION/PING/TIME queries.
    #[serde(default)]
    pub ctcp: bool,
}

impl NetworkConfig {
    /// Display name, falling back to the network identifier.
    pub fn display_name(&self) -> &str {
        if self.display_name.is_empty() {
            &self.name
        } else {
            &self.display_name
        }
    }
}

/// Durable per-session settings, owned by the host store.
///
/// Read once at session start; the autojoin channel list is written back
/// whenever it changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginConfig {
    /// Desired nickname.
    pub nick: String,
    /// Realname sent during registration.
    #[serde(default)]
    pub real_name: String,
    /// SASL username; empty disables authentication.
    #[serde(default)]
    pub sasl_user: String,
    /// SASL password.
    #[serde(default)]
    pub password: String,
    /// Channels to rejoin after each successful registration.
    #[serde(default)]
    pub channels: Vec<String>,
}

impl LoginConfig {
    /// Whether SASL credentials are present.
    pub fn has_credentials(&self) -> bool {
        !self.sasl_user.is_empty() && !self.password.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_config_roundtrip() {
        let cfg = LoginConfig {
            nick: "alice".into(),
            real_name: "Alice".into(),
            sasl_user: "alice".into(),
            password: "hunter2".into(),
            channels: vec!["#rust".into()],
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let back: LoginConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.nick, "alice");
        assert_eq!(back.channels, vec!["#rust"]);
        assert!(back.has_credentials());
    }

    #[test]
    fn test_missing_fields_default() {
        let cfg: LoginConfig = serde_json::from_str(r#"{"nick":"bob"}"#).unwrap();
        assert!(!cfg.has_credentials());
        assert!(cfg.channels.is_empty());
    }

    #[test]
    fn test_network_display_name_fallback() {
        let net: NetworkConfig =
            serde_json::from_str(r#"{"name":"libera","address":"irc.libera.chat:6697"}"#).unwrap();
        assert_eq!(net.display_name(), "libera");
    }
}
