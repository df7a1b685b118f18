//! Unified error handling for gangway.
//!
//! One taxonomy for everything a caller of the engine can see: terminal
//! authentication failures, transient connectivity problems, protocol-level
//! rejections (carrying the offending reply), correlation timeouts, and
//! identifier/capability misuse caught before anything reaches the wire.

use gangway_proto::Message;
use thiserror::Error;

/// Errors surfaced by the client engine.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The server rejected authentication. Terminal for the session; the
    /// connect loop does not retry.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// I/O failure while connecting or on an established transport.
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire-level protocol failure.
    #[error("protocol error: {0}")]
    Proto(#[from] gangway_proto::ProtocolError),

    /// The server answered a request with a negative reply.
    #[error("server rejected request: {0}")]
    NegativeReply(Message),

    /// A labeled reply arrived whose command does not match what the request
    /// expected.
    #[error("unexpected reply to labeled request: {0}")]
    UnexpectedReply(Message),

    /// No confirmation arrived within the correlation deadline.
    #[error("timed out waiting for confirmation")]
    Timeout,

    /// A newer send for the same correlation key replaced this request.
    #[error("request superseded by a newer send to the same target")]
    Superseded,

    /// The session disconnected while the request was pending.
    #[error("disconnected while waiting for confirmation")]
    Disconnected,

    /// The session is not in the ready state.
    #[error("not connected")]
    NotConnected,

    /// An externally-supplied identifier failed validation.
    #[error("malformed identifier: {0}")]
    InvalidIdentifier(String),

    /// The referenced message has no server-assigned token, so the server
    /// cannot be asked about it (redaction, reactions, replies).
    #[error("message has no server-assigned ID: {0}")]
    ImproperMessageId(String),

    /// The operation needs a capability the server did not acknowledge.
    #[error("server did not negotiate required capability: {0}")]
    CapabilityNotNegotiated(&'static str),

    /// Failure reported by the bridge host.
    #[error("host error: {0}")]
    Host(#[from] anyhow::Error),
}

impl ClientError {
    /// Get a static error code string for log labeling.
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::AuthFailed(_) => "auth_failed",
            Self::Io(_) => "io",
            Self::Proto(_) => "protocol",
            Self::NegativeReply(_) => "negative_reply",
            Self::UnexpectedReply(_) => "unexpected_reply",
            Self::Timeout => "timeout",
            Self::Superseded => "superseded",
            Self::Disconnected => "disconnected",
            Self::NotConnected => "not_connected",
            Self::InvalidIdentifier(_) => "invalid_identifier",
            Self::ImproperMessageId(_) => "improper_message_id",
            Self::CapabilityNotNegotiated(_) => "capability_not_negotiated",
            Self::Host(_) => "host_error",
        }
    }
}

/// Result type for engine operations.
pub type ClientResult<T> = Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(ClientError::Timeout.error_code(), "timeout");
        assert_eq!(
            ClientError::CapabilityNotNegotiated("message-tags").error_code(),
            "capability_not_negotiated"
        );
        assert_eq!(
            ClientError::InvalidIdentifier("x y".into()).error_code(),
            "invalid_identifier"
        );
    }

    #[test]
    fn test_negative_reply_displays_offending_message() {
        let reply: Message = ":server 482 me #chan :You're not channel operator"
            .parse()
            .unwrap();
        let err = ClientError::NegativeReply(reply);
        assert!(err.to_string().contains("482"));
    }
}
