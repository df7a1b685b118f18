//! The boundary to the bridge host.
//!
//! The engine owns the wire; the host owns everything durable. These traits
//! are the entire surface between them: identity lookup during registration,
//! the per-session config store, the normalized event sink, and the status
//! channel.

use async_trait::async_trait;

use crate::config::LoginConfig;
use crate::events::RemoteEvent;
use crate::ids::LoginId;

/// Connection status surfaced to the host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BridgeStatus {
    /// A connection attempt is in progress.
    Connecting,
    /// Registration completed; normal traffic is flowing.
    Connected,
    /// The connection was lost or could not be established; the engine will
    /// retry on its own.
    TransientDisconnect {
        /// What went wrong.
        reason: String,
    },
    /// The server rejected authentication; the engine will NOT retry.
    BadCredentials {
        /// What the server said.
        reason: String,
    },
}

/// Everything the engine needs from the bridge host.
#[async_trait]
pub trait BridgeHost: Send + Sync {
    /// Obtain the technical identity (username-equivalent) to present during
    /// registration for this login.
    async fn lookup_ident(&self, login: &LoginId) -> anyhow::Result<String>;

    /// Read the durable per-session configuration.
    async fn load_login(&self, login: &LoginId) -> anyhow::Result<Option<LoginConfig>>;

    /// Write the per-session configuration back (autojoin list changes).
    async fn save_login(&self, login: &LoginId, config: &LoginConfig) -> anyhow::Result<()>;

    /// Accept a normalized event. Called from the reader task, sometimes
    /// while engine locks are held: implementations must enqueue and return,
    /// never block.
    fn queue_remote_event(&self, login: &LoginId, event: RemoteEvent);

    /// Accept a connection status update. Must not block.
    fn send_status(&self, login: &LoginId, status: BridgeStatus);
}
