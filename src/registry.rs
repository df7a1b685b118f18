//! Process-wide registry of active sessions, keyed by network and folded
//! nick.
//!
//! Owned by the top-level bridge component and shared with every session; the
//! bridge uses it to answer "which login is this sender" across sessions. An
//! explicit object behind one lock — never ambient global state.

use parking_lot::RwLock;
use std::collections::HashMap;

use crate::ids::LoginId;

/// Registry of (network, folded nick) → login.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    logins: RwLock<HashMap<(String, String), LoginId>>,
}

impl ClientRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session under its current nick.
    pub fn add(&self, network: &str, folded_nick: &str, login: LoginId) {
        self.logins
            .write()
            .insert((network.to_string(), folded_nick.to_string()), login);
    }

    /// Remove a session's entry, but only if it still belongs to that login
    /// (a reconnect may already have re-registered the nick elsewhere).
    pub fn remove(&self, network: &str, folded_nick: &str, login: &LoginId) {
        let mut logins = self.logins.write();
        let key = (network.to_string(), folded_nick.to_string());
        if logins.get(&key) == Some(login) {
            logins.remove(&key);
        }
    }

    /// Move a session's entry from one nick to another (nick change).
    pub fn rename(&self, network: &str, old_nick: &str, new_nick: &str, login: LoginId) {
        let mut logins = self.logins.write();
        let old_key = (network.to_string(), old_nick.to_string());
        if logins.get(&old_key) == Some(&login) {
            logins.remove(&old_key);
        }
        logins.insert((network.to_string(), new_nick.to_string()), login);
    }

    /// Which login owns this nick on this network, if any.
    pub fn lookup(&self, network: &str, folded_nick: &str) -> Option<LoginId> {
        self.logins
            .read()
            .get(&(network.to_string(), folded_nick.to_string()))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::make_login_id;

    #[test]
    fn test_add_lookup_remove() {
        let registry = ClientRegistry::new();
        let login = make_login_id("libera", "acct");
        registry.add("libera", "alice", login.clone());

        assert_eq!(registry.lookup("libera", "alice"), Some(login.clone()));
        assert_eq!(registry.lookup("oftc", "alice"), None);

        registry.remove("libera", "alice", &login);
        assert_eq!(registry.lookup("libera", "alice"), None);
    }

    #[test]
    fn test_remove_respects_ownership() {
        let registry = ClientRegistry::new();
        let first = make_login_id("libera", "one");
        let second = make_login_id("libera", "two");
        registry.add("libera", "alice", first.clone());
        registry.add("libera", "alice", second.clone());

        // The first login no longer owns the nick; removal is a no-op.
        registry.remove("libera", "alice", &first);
        assert_eq!(registry.lookup("libera", "alice"), Some(second));
    }

    #[test]
    fn test_rename_moves_entry() {
        let registry = ClientRegistry::new();
        let login = make_login_id("libera", "acct");
        registry.add("libera", "alice", login.clone());
        registry.rename("libera", "alice", "bob", login.clone());

        assert_eq!(registry.lookup("libera", "alice"), None);
        assert_eq!(registry.lookup("libera", "bob"), Some(login));
    }
}
