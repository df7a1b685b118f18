//! Session lifecycle and outbound operations.
//!
//! One [`IrcClient`] is one logical user's live connection to one network.
//! A background task owns the transport: it dials, registers (capability
//! negotiation and SASL), then drives all inbound parsing and dispatch until
//! the connection drops, reconnecting with a linear backoff until an explicit
//! stop or a terminal authentication failure. Callers on other tasks issue
//! sends concurrently; every send is routed through the response correlator.

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tokio_util::codec::Framed;
use tracing::{debug, trace, warn};

use base64::prelude::{Engine as _, BASE64_STANDARD};
use chrono::{DateTime, Utc};
use gangway_proto::{IrcCodec, Isupport, Message, Tag};

use crate::cache::{ChannelCache, ChannelState};
use crate::config::{LoginConfig, NetworkConfig};
use crate::correlate::{await_signal, Correlator, WaitOutcome};
use crate::error::{ClientError, ClientResult};
use crate::events::{EventSender, MessageKind, RemoteEvent};
use crate::handlers::normalize_ctcp_action;
use crate::host::{BridgeHost, BridgeStatus};
use crate::ids::{
    make_message_id, make_room_id, make_user_id, parse_room_id, parse_user_id, valid_name,
    LoginId, MessageId, NameBook, RoomId, UserId,
};
use crate::registry::ClientRegistry;

/// Capabilities requested from every server; the acknowledged subset decides
/// the correlation strategy and which operations are available.
const REQUEST_CAPS: &[&str] = &[
    "message-tags",
    "server-time",
    "echo-message",
    "batch",
    "draft/multiline",
    "labeled-response",
    "draft/message-redaction",
    "draft/relaymsg",
];

/// Services that answer PRIVMSG conversationally instead of echoing it;
/// sends to them skip the echo strategy.
const SERVICE_TARGETS: &[&str] = &[
    "nickserv", "chanserv", "memoserv", "operserv", "hostserv", "botserv",
];

/// Bound on every correlated wait.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// How long the no-echo fallback waits for an error before assuming success.
const FALLBACK_TIMEOUT: Duration = Duration::from_secs(1);
/// Grace period between sending QUIT and tearing the stream down.
const QUIT_GRACE: Duration = Duration::from_secs(2);
/// Bound on a graceful disconnect before the session task is aborted.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(4);
/// Linear backoff unit per consecutive connection failure.
const RECONNECT_STEP: Duration = Duration::from_secs(2);

const QUIT_MESSAGE: &str = "Bridge shutting down";

/// A confirmed outbound message, ready for the host's message store.
#[derive(Clone, Debug)]
pub struct SentMessage {
    /// Stable identifier derived from the confirmation.
    pub id: MessageId,
    /// Our own participant identifier.
    pub sender: UserId,
    /// Logical timestamp from the confirmation, when tagged.
    pub timestamp: Option<DateTime<Utc>>,
}

/// One logical user's connection to one network.
pub struct IrcClient {
    inner: Arc<Inner>,
}

pub(crate) struct Inner {
    pub(crate) network: NetworkConfig,
    pub(crate) login_id: LoginId,
    pub(crate) host: Arc<dyn BridgeHost>,
    pub(crate) registry: Arc<ClientRegistry>,
    pub(crate) login: RwLock<Option<LoginConfig>>,
    pub(crate) isupport: RwLock<Arc<Isupport>>,
    pub(crate) names: NameBook,
    pub(crate) cache: ChannelCache,
    pub(crate) correlator: Correlator,
    pub(crate) current_nick: RwLock<String>,
    /// Acknowledged capabilities with their advertised values.
    pub(crate) caps: RwLock<HashMap<String, String>>,
    writer: RwLock<Option<mpsc::UnboundedSender<Message>>>,
    connected: AtomicBool,
    stop_tx: watch::Sender<bool>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl IrcClient {
    /// Create a session for one login. Nothing touches the network until
    /// [`connect`](Self::connect).
    pub fn new(
        network: NetworkConfig,
        login_id: LoginId,
        registry: Arc<ClientRegistry>,
        host: Arc<dyn BridgeHost>,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        IrcClient {
            inner: Arc::new(Inner {
                network,
                login_id,
                host,
                registry,
                login: RwLock::new(None),
                isupport: RwLock::new(Arc::new(Isupport::default())),
                names: NameBook::new(),
                cache: ChannelCache::new(),
                correlator: Correlator::new(),
                current_nick: RwLock::new(String::new()),
                caps: RwLock::new(HashMap::new()),
                writer: RwLock::new(None),
                connected: AtomicBool::new(false),
                stop_tx,
                task: tokio::sync::Mutex::new(None),
            }),
        }
    }

    /// Read the session configuration from the host store and start the
    /// connect loop. Idempotent while a loop is already running.
    pub async fn connect(&self) -> ClientResult<()> {
        let inner = &self.inner;
        let mut task = inner.task.lock().await;
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            debug!(login = %inner.login_id, "connect requested while already running");
            return Ok(());
        }

        let login = inner
            .host
            .load_login(&inner.login_id)
            .await?
            .ok_or_else(|| {
                ClientError::InvalidIdentifier(format!("no stored login: {}", inner.login_id))
            })?;
        let ident = inner.host.lookup_ident(&inner.login_id).await?;
        *inner.current_nick.write() = login.nick.clone();
        *inner.login.write() = Some(login);
        inner.stop_tx.send_replace(false);

        let loop_inner = inner.clone();
        *task = Some(tokio::spawn(async move {
            connect_loop(loop_inner, ident).await;
        }));
        Ok(())
    }

    /// Gracefully disconnect: signal the loop, let it QUIT, and abort the
    /// task if it has not wound down within a few seconds.
    pub async fn disconnect(&self) {
        let _ = self.inner.stop_tx.send(true);
        let handle = self.inner.task.lock().await.take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut handle)
                .await
                .is_err()
            {
                warn!(login = %self.inner.login_id, "graceful shutdown timed out; aborting session task");
                handle.abort();
            }
        }
    }

    /// Whether the session is registered and passing traffic.
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// The nick this session currently holds.
    pub fn current_nick(&self) -> String {
        self.inner.current_nick.read().clone()
    }

    /// Whether a participant identifier names this session's own identity.
    pub fn is_this_user(&self, user: &UserId) -> bool {
        let Ok((net, nick)) = parse_user_id(user) else {
            return false;
        };
        let own = self.inner.fold(&self.inner.current_nick.read().clone());
        net == self.inner.network.name && nick == own
    }

    /// Build the room identifier for a protocol name, recording its display
    /// spelling.
    pub fn room_id_for(&self, name: &str) -> RoomId {
        self.inner.room_id(name)
    }

    /// Build the participant identifier for a nick, recording its display
    /// spelling.
    pub fn user_id_for(&self, nick: &str) -> UserId {
        self.inner.user_id(nick)
    }

    /// Clone the cached state for a room, if any has been observed.
    pub fn channel_state(&self, room: &RoomId) -> ClientResult<Option<ChannelState>> {
        let channel = self.inner.resolve_room(room)?;
        Ok(self.inner.cache.snapshot(&self.inner.fold(&channel)))
    }

    /// Send a chat message and wait for its confirmation.
    pub async fn send_message(
        &self,
        room: &RoomId,
        kind: MessageKind,
        body: &str,
        reply_to: Option<&MessageId>,
    ) -> ClientResult<SentMessage> {
        let channel = self.inner.resolve_room(room)?;
        let (command, expect, body) = match kind {
            MessageKind::Text => ("PRIVMSG", None, body.to_string()),
            MessageKind::Notice => ("NOTICE", None, body.to_string()),
            MessageKind::Emote => (
                "PRIVMSG",
                Some("CTCP_ACTION"),
                format!("\x01ACTION {}\x01", body),
            ),
        };
        let mut tags = Vec::new();
        if self.inner.has_cap("message-tags") {
            if let Some(token) = reply_to.and_then(MessageId::proper_token) {
                tags.push(Tag("+draft/reply".into(), Some(token.to_string())));
            }
        }
        let resp = self
            .inner
            .send_request(tags, expect, command, vec![channel, body])
            .await?;
        Ok(self.inner.sent_message(&resp))
    }

    /// Relay a message under a spoofed per-message sender name. Requires the
    /// `draft/relaymsg` capability.
    pub async fn send_relay_message(
        &self,
        room: &RoomId,
        display_name: &str,
        body: &str,
    ) -> ClientResult<SentMessage> {
        let Some(separator) = self.inner.cap_value("draft/relaymsg") else {
            return Err(ClientError::CapabilityNotNegotiated("draft/relaymsg"));
        };
        let channel = self.inner.resolve_room(room)?;
        let nick = filter_relay_nick(display_name);
        if nick.is_empty() {
            return Err(ClientError::InvalidIdentifier(format!(
                "relay name unusable as nick: {}",
                display_name
            )));
        }
        let relay_nick = if separator.is_empty() {
            nick
        } else {
            format!("m{}{}", separator, nick)
        };
        let resp = self
            .inner
            .send_request(
                Vec::new(),
                None,
                "RELAYMSG",
                vec![channel, relay_nick, body.to_string()],
            )
            .await?;
        Ok(self.inner.sent_message(&resp))
    }

    /// React to a message. Requires `message-tags` and a proper (tier-a)
    /// target identifier. Returns the server token of the reaction message,
    /// needed to remove the reaction later.
    pub async fn send_reaction(
        &self,
        room: &RoomId,
        target: &MessageId,
        emoji: &str,
    ) -> ClientResult<Option<String>> {
        if !self.inner.has_cap("message-tags") {
            return Err(ClientError::CapabilityNotNegotiated("message-tags"));
        }
        let channel = self.inner.resolve_room(room)?;
        let token = target
            .proper_token()
            .ok_or_else(|| ClientError::ImproperMessageId(target.to_string()))?;
        let tags = vec![
            Tag("+draft/reply".into(), Some(token.to_string())),
            Tag("+draft/react".into(), Some(emoji.to_string())),
        ];
        let resp = self
            .inner
            .send_request(tags, None, "TAGMSG", vec![channel])
            .await?;
        Ok(resp.msgid().map(str::to_string))
    }

    /// Remove a previously sent reaction by its server token. Requires
    /// `draft/message-redaction`.
    pub async fn remove_reaction(&self, room: &RoomId, reaction_msgid: &str) -> ClientResult<()> {
        if !self.inner.has_cap("draft/message-redaction") {
            return Err(ClientError::CapabilityNotNegotiated("draft/message-redaction"));
        }
        let channel = self.inner.resolve_room(room)?;
        self.inner
            .send_request(
                Vec::new(),
                None,
                "REDACT",
                vec![channel, reaction_msgid.to_string()],
            )
            .await?;
        Ok(())
    }

    /// Redact a message. Requires `draft/message-redaction` and a proper
    /// target identifier.
    pub async fn remove_message(
        &self,
        room: &RoomId,
        target: &MessageId,
        reason: Option<&str>,
    ) -> ClientResult<()> {
        if !self.inner.has_cap("draft/message-redaction") {
            return Err(ClientError::CapabilityNotNegotiated("draft/message-redaction"));
        }
        let channel = self.inner.resolve_room(room)?;
        let token = target
            .proper_token()
            .ok_or_else(|| ClientError::ImproperMessageId(target.to_string()))?;
        let mut args = vec![channel, token.to_string()];
        if let Some(reason) = reason.filter(|r| !r.is_empty()) {
            args.push(reason.to_string());
        }
        self.inner.send_request(Vec::new(), None, "REDACT", args).await?;
        Ok(())
    }

    /// Set the room topic; returns the topic text the server accepted.
    pub async fn set_topic(&self, room: &RoomId, topic: &str) -> ClientResult<String> {
        let channel = self.inner.resolve_room(room)?;
        let resp = self
            .inner
            .send_request(
                Vec::new(),
                None,
                "TOPIC",
                vec![channel, topic.to_string()],
            )
            .await?;
        Ok(resp.param(1).unwrap_or_default().to_string())
    }

    /// Send a typing indicator. Requires `message-tags`.
    pub async fn set_typing(&self, room: &RoomId, typing: bool) -> ClientResult<()> {
        if !self.inner.has_cap("message-tags") {
            return Err(ClientError::CapabilityNotNegotiated("message-tags"));
        }
        let channel = self.inner.resolve_room(room)?;
        let state = if typing { "active" } else { "done" };
        let tags = vec![Tag("+typing".into(), Some(state.to_string()))];
        self.inner
            .send_request(tags, None, "TAGMSG", vec![channel])
            .await?;
        Ok(())
    }

    /// Join a channel and add it to the persisted autojoin list.
    pub async fn join_channel(&self, channel: &str) -> ClientResult<RoomId> {
        if !valid_name(channel) {
            return Err(ClientError::InvalidIdentifier(channel.to_string()));
        }
        self.inner
            .send_request(Vec::new(), None, "JOIN", vec![channel.to_string()])
            .await?;

        let updated = {
            let mut login = self.inner.login.write();
            match login.as_mut() {
                Some(login) if !login.channels.iter().any(|c| c == channel) => {
                    login.channels.push(channel.to_string());
                    Some(login.clone())
                }
                _ => None,
            }
        };
        if let Some(login) = updated {
            self.inner.host.save_login(&self.inner.login_id, &login).await?;
        }
        Ok(self.inner.room_id(channel))
    }

    /// Leave a channel and drop it from the persisted autojoin list. Leaving
    /// a direct-message room is a no-op.
    pub async fn part_channel(&self, room: &RoomId) -> ClientResult<()> {
        let channel = self.inner.resolve_room(room)?;
        if self.inner.is_dm(&channel) {
            return Ok(());
        }

        let updated = {
            let mut login = self.inner.login.write();
            match login.as_mut() {
                Some(login) if login.channels.iter().any(|c| c == &channel) => {
                    login.channels.retain(|c| c != &channel);
                    Some(login.clone())
                }
                _ => None,
            }
        };
        if let Some(login) = updated {
            self.inner.host.save_login(&self.inner.login_id, &login).await?;
        }
        self.inner
            .send_request(Vec::new(), None, "PART", vec![channel])
            .await?;
        Ok(())
    }

    /// Send an arbitrary command through the correlator (admin escape
    /// hatch).
    pub async fn send_raw(
        &self,
        tags: Vec<Tag>,
        expect: Option<&str>,
        command: &str,
        args: Vec<String>,
    ) -> ClientResult<Message> {
        self.inner.send_request(tags, expect, command, args).await
    }
}

impl Inner {
    pub(crate) fn isupport(&self) -> Arc<Isupport> {
        self.isupport.read().clone()
    }

    pub(crate) fn fold(&self, name: &str) -> String {
        self.isupport.read().fold(name)
    }

    pub(crate) fn is_dm(&self, target: &str) -> bool {
        !self.isupport.read().is_channel(target)
    }

    pub(crate) fn is_self(&self, nick: &str) -> bool {
        let own = self.current_nick.read().clone();
        !own.is_empty() && self.fold(nick) == self.fold(&own)
    }

    pub(crate) fn room_id(&self, name: &str) -> RoomId {
        let folded = self.fold(name);
        self.names.record(&folded, name);
        make_room_id(&self.network.name, &folded)
    }

    pub(crate) fn user_id(&self, nick: &str) -> UserId {
        let folded = self.fold(nick);
        self.names.record(&folded, nick);
        make_user_id(&self.network.name, &folded)
    }

    pub(crate) fn event_sender(&self, nick: &str) -> EventSender {
        EventSender {
            id: self.user_id(nick),
            is_from_me: self.is_self(nick),
        }
    }

    pub(crate) fn queue(&self, event: RemoteEvent) {
        self.host.queue_remote_event(&self.login_id, event);
    }

    fn has_cap(&self, cap: &str) -> bool {
        self.caps.read().contains_key(cap)
    }

    fn cap_value(&self, cap: &str) -> Option<String> {
        self.caps.read().get(cap).cloned()
    }

    fn sent_message(&self, confirmation: &Message) -> SentMessage {
        let nick = self.current_nick.read().clone();
        SentMessage {
            id: make_message_id(&self.network.name, confirmation, Utc::now()),
            sender: self.user_id(&nick),
            timestamp: confirmation.server_time_utc(),
        }
    }

    fn write(&self, msg: Message) -> ClientResult<()> {
        let writer = self.writer.read();
        let tx = writer.as_ref().ok_or(ClientError::NotConnected)?;
        tx.send(msg).map_err(|_| ClientError::Disconnected)
    }

    /// Validate an externally-supplied room identifier against this session
    /// and resolve it to the protocol name in display case.
    pub(crate) fn resolve_room(&self, room: &RoomId) -> ClientResult<String> {
        let (net, name) = parse_room_id(room)?;
        if net != self.network.name {
            return Err(ClientError::InvalidIdentifier(format!(
                "identifier for network {} used on {}",
                net, self.network.name
            )));
        }
        if self.fold(name) != name {
            return Err(ClientError::InvalidIdentifier(format!(
                "name not case-folded: {}",
                name
            )));
        }
        Ok(self.names.display_for(name))
    }

    /// Send a command and wait for its correlated confirmation.
    ///
    /// Strategy order: explicit labels, echo matching keyed on the folded
    /// target, then the heuristic fallback. `expect` is the command the
    /// confirmation must carry when it differs from `command` (CTCP ACTION).
    pub(crate) async fn send_request(
        &self,
        tags: Vec<Tag>,
        expect: Option<&str>,
        command: &str,
        args: Vec<String>,
    ) -> ClientResult<Message> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ClientError::NotConnected);
        }
        let expected = expect.unwrap_or(command).to_string();
        let target_key = args.first().map(|t| self.fold(t));

        let mut msg = Message::new(command, args);
        for Tag(key, value) in tags {
            msg = msg.with_tag(key, value);
        }

        if self.has_cap("labeled-response") && self.has_cap("batch") {
            return self.send_labeled(msg, &expected).await;
        }

        let service_target = target_key
            .as_deref()
            .is_some_and(|key| SERVICE_TARGETS.contains(&key));
        if self.has_cap("echo-message") && !service_target {
            if let Some(key) = target_key {
                return self.send_echo(msg, &key, &expected).await;
            }
        }

        self.send_fallback(msg, &expected).await
    }

    async fn send_labeled(&self, msg: Message, expected: &str) -> ClientResult<Message> {
        let label = self.correlator.next_label();
        let rx = self.correlator.register_label(&label);
        let msg = msg.with_tag("label", Some(label.clone()));
        if let Err(err) = self.write(msg) {
            self.correlator.abort_label(&label);
            return Err(err);
        }
        match await_signal(rx, REQUEST_TIMEOUT, None).await? {
            WaitOutcome::ResolvedOk(reply) => {
                // A bare ACK is the server saying "done, nothing to echo".
                if reply.command == expected || reply.command == "ACK" {
                    Ok(reply)
                } else {
                    Err(ClientError::UnexpectedReply(reply))
                }
            }
            WaitOutcome::ResolvedErr(reply) => Err(ClientError::NegativeReply(reply)),
            WaitOutcome::TimedOutErr | WaitOutcome::TimedOutOk(_) => {
                self.correlator.abort_label(&label);
                Err(ClientError::Timeout)
            }
        }
    }

    async fn send_echo(&self, msg: Message, key: &str, expected: &str) -> ClientResult<Message> {
        // Register before sending: the echo may race our own wait.
        let rx = self.correlator.register_echo(key, expected);
        if let Err(err) = self.write(msg) {
            self.correlator.abort_echo(key);
            return Err(err);
        }
        match await_signal(rx, REQUEST_TIMEOUT, None).await? {
            WaitOutcome::ResolvedOk(reply) => Ok(reply),
            WaitOutcome::ResolvedErr(reply) => Err(ClientError::NegativeReply(reply)),
            WaitOutcome::TimedOutErr | WaitOutcome::TimedOutOk(_) => {
                self.correlator.abort_echo(key);
                Err(ClientError::Timeout)
            }
        }
    }

    async fn send_fallback(&self, msg: Message, expected: &str) -> ClientResult<Message> {
        // Single-slot waiter: serialize fallback sends so concurrent callers
        // cannot claim each other's replies.
        let _gate = self.correlator.fallback_gate.lock().await;
        let will_echo = self.has_cap("echo-message");
        let rx = self
            .correlator
            .register_fallback(will_echo.then(|| expected.to_string()));
        let synthetic = msg.clone();
        if let Err(err) = self.write(msg) {
            self.correlator.clear_fallback();
            return Err(err);
        }
        let (deadline, timeout_ok) = if will_echo {
            (REQUEST_TIMEOUT, None)
        } else {
            (FALLBACK_TIMEOUT, Some(synthetic))
        };
        let outcome = await_signal(rx, deadline, timeout_ok).await;
        self.correlator.clear_fallback();
        match outcome? {
            WaitOutcome::ResolvedOk(reply) => Ok(reply),
            WaitOutcome::ResolvedErr(reply) => Err(ClientError::NegativeReply(reply)),
            // No error arrived in time: the quiet wire is the confirmation.
            WaitOutcome::TimedOutOk(synthetic) => Ok(synthetic),
            WaitOutcome::TimedOutErr => Err(ClientError::Timeout),
        }
    }
}

/// SASL PLAIN exchange, base64-encoded and split into 400-byte chunks with a
/// `+` terminator when the payload divides evenly.
fn sasl_plain_chunks(user: &str, password: &str) -> Vec<Message> {
    let raw = format!("{}\0{}\0{}", user, user, password);
    let encoded = BASE64_STANDARD.encode(raw.as_bytes());
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < encoded.len() {
        let end = (start + 400).min(encoded.len());
        chunks.push(Message::from_args("AUTHENTICATE", &[&encoded[start..end]]));
        start = end;
    }
    if encoded.len() % 400 == 0 {
        chunks.push(Message::from_args("AUTHENTICATE", &["+"]));
    }
    chunks
}

/// Strip characters that cannot appear in a relayed nick: anything outside
/// Latin-1, protocol punctuation, and non-printing characters.
fn filter_relay_nick(name: &str) -> String {
    const SPECIAL: &str = "!+%@&#$:'\"?*,. ";
    name.chars()
        .filter(|c| (*c as u32) <= 0xFF && !SPECIAL.contains(*c) && !c.is_control())
        .collect()
}

// ============================================================================
// Connect loop and session driving
// ============================================================================

enum SessionEnd {
    AuthFailed(String),
    Stopped,
    Lost(String),
}

async fn connect_loop(inner: Arc<Inner>, ident: String) {
    let mut stop_rx = inner.stop_tx.subscribe();
    let mut failures: u64 = 0;
    loop {
        if *stop_rx.borrow() {
            break;
        }
        inner
            .host
            .send_status(&inner.login_id, BridgeStatus::Connecting);
        let (reached_ready, end) = run_session(&inner, &ident, &mut stop_rx).await;

        // Tear down shared session state and release every pending request
        // before anything else can observe the dead connection.
        inner.connected.store(false, Ordering::SeqCst);
        *inner.writer.write() = None;
        inner.correlator.fail_all();
        let nick = inner.current_nick.read().clone();
        let nick_key = inner.fold(&nick);
        inner
            .registry
            .remove(&inner.network.name, &nick_key, &inner.login_id);

        match end {
            SessionEnd::AuthFailed(reason) => {
                warn!(login = %inner.login_id, reason = %reason, "authentication failed; not retrying");
                inner
                    .host
                    .send_status(&inner.login_id, BridgeStatus::BadCredentials { reason });
                break;
            }
            SessionEnd::Stopped => break,
            SessionEnd::Lost(reason) => {
                if *stop_rx.borrow() {
                    break;
                }
                warn!(login = %inner.login_id, reason = %reason, "connection lost");
                inner.host.send_status(
                    &inner.login_id,
                    BridgeStatus::TransientDisconnect { reason },
                );
                failures = if reached_ready { 1 } else { failures + 1 };
            }
        }

        let delay = RECONNECT_STEP * failures as u32;
        debug!(login = %inner.login_id, failures, delay_secs = delay.as_secs(), "scheduling reconnect");
        tokio::select! {
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() {
                    break;
                }
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn run_session(
    inner: &Arc<Inner>,
    ident: &str,
    stop_rx: &mut watch::Receiver<bool>,
) -> (bool, SessionEnd) {
    let address = inner.network.address.clone();
    debug!(address = %address, "connecting");
    let stream = match TcpStream::connect(&address).await {
        Ok(stream) => stream,
        Err(err) => return (false, SessionEnd::Lost(err.to_string())),
    };

    if inner.network.tls {
        let connector = match tls_connector() {
            Ok(connector) => connector,
            Err(err) => return (false, SessionEnd::Lost(err.to_string())),
        };
        let host = address
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(address.as_str())
            .to_string();
        let server_name = match ServerName::try_from(host) {
            Ok(name) => name,
            Err(err) => return (false, SessionEnd::Lost(err.to_string())),
        };
        let tls_stream = match connector.connect(server_name, stream).await {
            Ok(stream) => stream,
            Err(err) => return (false, SessionEnd::Lost(err.to_string())),
        };
        drive_session(inner, Framed::new(tls_stream, IrcCodec::new()), ident, stop_rx).await
    } else {
        drive_session(inner, Framed::new(stream, IrcCodec::new()), ident, stop_rx).await
    }
}

fn tls_connector() -> ClientResult<TlsConnector> {
    let mut roots = RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().certs {
        if let Err(err) = roots.add(cert) {
            debug!(error = %err, "skipping unusable root certificate");
        }
    }
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

async fn drive_session<S>(
    inner: &Arc<Inner>,
    framed: Framed<S, IrcCodec>,
    ident: &str,
    stop_rx: &mut watch::Receiver<bool>,
) -> (bool, SessionEnd)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = framed.split();
    let (tx, mut outbox) = mpsc::unbounded_channel::<Message>();
    *inner.writer.write() = Some(tx.clone());
    inner.caps.write().clear();

    let Some(login) = inner.login.read().clone() else {
        return (false, SessionEnd::Lost("no login configuration".into()));
    };
    *inner.current_nick.write() = login.nick.clone();

    let mut session = SessionCtx::new(inner.clone(), tx, ident.to_string(), login);
    for msg in session.registration_burst() {
        if sink.send(msg).await.is_err() {
            return (false, SessionEnd::Lost("write failed during registration".into()));
        }
    }

    let mut quitting = false;
    let end = loop {
        tokio::select! {
            biased;
            _ = stop_rx.changed(), if !quitting => {
                if *stop_rx.borrow() {
                    quitting = true;
                    let _ = sink
                        .send(Message::from_args("QUIT", &[QUIT_MESSAGE]))
                        .await;
                }
            }
            _ = tokio::time::sleep(QUIT_GRACE), if quitting => {
                break SessionEnd::Stopped;
            }
            maybe = outbox.recv() => {
                match maybe {
                    Some(msg) => {
                        if sink.send(msg).await.is_err() {
                            break SessionEnd::Lost("write failed".into());
                        }
                    }
                    None => break SessionEnd::Lost("writer channel closed".into()),
                }
            }
            item = stream.next() => {
                match item {
                    Some(Ok(mut msg)) => {
                        normalize_ctcp_action(&mut msg);
                        if let Some(end) = session.handle(msg) {
                            // The server closing us out after our QUIT is a
                            // clean stop, not a connection loss.
                            break if quitting { SessionEnd::Stopped } else { end };
                        }
                    }
                    Some(Err(err)) => {
                        // One bad line is one dropped event, never a teardown.
                        warn!(error = %err, "dropping malformed line");
                    }
                    None => {
                        break if quitting {
                            SessionEnd::Stopped
                        } else {
                            SessionEnd::Lost("connection closed".into())
                        };
                    }
                }
            }
        }
    };
    (session.reached_ready, end)
}

struct OpenBatch {
    label: Option<String>,
    kind: String,
    open: Message,
    messages: Vec<Message>,
}

struct SessionCtx {
    inner: Arc<Inner>,
    tx: mpsc::UnboundedSender<Message>,
    ident: String,
    login: LoginConfig,
    offered: HashMap<String, String>,
    isupport_tokens: HashMap<String, String>,
    batches: HashMap<String, OpenBatch>,
    cap_done: bool,
    ready: bool,
    reached_ready: bool,
}

impl SessionCtx {
    fn new(
        inner: Arc<Inner>,
        tx: mpsc::UnboundedSender<Message>,
        ident: String,
        login: LoginConfig,
    ) -> Self {
        SessionCtx {
            inner,
            tx,
            ident,
            login,
            offered: HashMap::new(),
            isupport_tokens: HashMap::new(),
            batches: HashMap::new(),
            cap_done: false,
            ready: false,
            reached_ready: false,
        }
    }

    fn registration_burst(&self) -> Vec<Message> {
        vec![
            Message::from_args("CAP", &["LS", "302"]),
            Message::from_args("NICK", &[self.login.nick.as_str()]),
            Message::from_args(
                "USER",
                &[self.ident.as_str(), "0", "*", self.login.real_name.as_str()],
            ),
        ]
    }

    /// Handle one inbound message. Returns `Some` to end the session.
    fn handle(&mut self, msg: Message) -> Option<SessionEnd> {
        match msg.command.as_str() {
            "PING" => {
                let params: Vec<&str> = msg.params.iter().map(String::as_str).collect();
                let _ = self.tx.send(Message::from_args("PONG", &params));
                None
            }
            "ERROR" => Some(SessionEnd::Lost(format!(
                "server error: {}",
                msg.param(0).unwrap_or("")
            ))),
            "BATCH" => {
                self.on_batch(msg);
                None
            }
            _ => {
                // Messages inside an open batch are held until it closes.
                if let Some(reference) = msg.batch_ref().map(str::to_string) {
                    if let Some(batch) = self.batches.get_mut(&reference) {
                        batch.messages.push(msg);
                        return None;
                    }
                }
                if let Some(label) = msg.label().map(str::to_string) {
                    if self.inner.correlator.complete_label(&label, msg.clone()) {
                        return None;
                    }
                }
                if !self.ready {
                    return self.registration(msg);
                }
                // Correlator first: our own action reflected back may be the
                // confirmation a pending request is blocked on.
                if msg.source_nickname().is_some_and(|s| self.inner.is_self(s)) {
                    if let Some(target) = msg.param(0) {
                        let key = self.inner.fold(target);
                        if self.inner.correlator.claim_echo(&key, &msg) {
                            return None;
                        }
                    }
                }
                let nick = self.inner.current_nick.read().clone();
                if self.inner.correlator.claim_fallback(&msg, &nick) {
                    return None;
                }
                self.inner.dispatch(&msg, &self.tx);
                None
            }
        }
    }

    fn on_batch(&mut self, msg: Message) {
        let Some(reference) = msg.param(0) else { return };
        if let Some(name) = reference.strip_prefix('+') {
            self.batches.insert(
                name.to_string(),
                OpenBatch {
                    label: msg.label().map(str::to_string),
                    kind: msg.param(1).unwrap_or("").to_string(),
                    open: msg.clone(),
                    messages: Vec::new(),
                },
            );
        } else if let Some(name) = reference.strip_prefix('-') {
            if let Some(batch) = self.batches.remove(name) {
                self.close_batch(batch);
            }
        }
    }

    fn close_batch(&mut self, batch: OpenBatch) {
        let OpenBatch {
            label,
            kind,
            open,
            mut messages,
        } = batch;

        if messages.is_empty() {
            if let Some(label) = label {
                self.inner.correlator.complete_label(&label, open);
            }
            return;
        }

        if kind == "draft/multiline" {
            let merged = merge_multiline(&open, messages);
            match label {
                Some(label) => {
                    if !self.inner.correlator.complete_label(&label, merged.clone()) {
                        self.dispatch_inner(merged);
                    }
                }
                None => self.dispatch_inner(merged),
            }
            return;
        }

        match label {
            Some(label) => {
                // A labeled batch may carry our echo plus a conversational
                // peer's responses: the echo satisfies the correlation, the
                // remainder re-enters normal dispatch so it is not lost.
                let nick = self.inner.current_nick.read().clone();
                let echo_pos = messages
                    .iter()
                    .position(|m| m.source_nickname() == Some(nick.as_str()))
                    .unwrap_or(0);
                let confirmation = messages.remove(echo_pos);
                if !self.inner.correlator.complete_label(&label, confirmation.clone()) {
                    self.dispatch_inner(confirmation);
                }
                for extra in messages {
                    self.dispatch_inner(extra);
                }
            }
            None => {
                for inner_msg in messages {
                    self.dispatch_inner(inner_msg);
                }
            }
        }
    }

    fn dispatch_inner(&mut self, mut msg: Message) {
        normalize_ctcp_action(&mut msg);
        if msg.source_nickname().is_some_and(|s| self.inner.is_self(s)) {
            if let Some(target) = msg.param(0) {
                let key = self.inner.fold(target);
                if self.inner.correlator.claim_echo(&key, &msg) {
                    return;
                }
            }
        }
        self.inner.dispatch(&msg, &self.tx);
    }

    fn registration(&mut self, msg: Message) -> Option<SessionEnd> {
        match msg.command.as_str() {
            "CAP" => {
                self.on_cap(&msg);
                None
            }
            "AUTHENTICATE" => {
                if msg.param(0) == Some("+") {
                    for chunk in self.sasl_payload() {
                        let _ = self.tx.send(chunk);
                    }
                }
                None
            }
            "903" => {
                self.finish_cap();
                None
            }
            "904" | "905" | "906" | "907" => Some(SessionEnd::AuthFailed(
                msg.params.last().cloned().unwrap_or_default(),
            )),
            "001" => {
                if let Some(nick) = msg.param(0) {
                    *self.inner.current_nick.write() = nick.to_string();
                }
                None
            }
            "005" => {
                self.on_isupport(&msg);
                None
            }
            "433" => {
                let nick = format!("{}_", self.inner.current_nick.read().clone());
                *self.inner.current_nick.write() = nick.clone();
                let _ = self.tx.send(Message::from_args("NICK", &[nick.as_str()]));
                None
            }
            "376" | "422" => {
                self.enter_ready();
                None
            }
            _ => {
                trace!(command = %msg.command, "registration noise");
                None
            }
        }
    }

    fn on_cap(&mut self, msg: &Message) {
        let Some(list) = msg.params.last().cloned() else {
            return;
        };
        match msg.param(1) {
            Some("LS") => {
                for token in list.split_whitespace() {
                    let (name, value) = token.split_once('=').unwrap_or((token, ""));
                    self.offered.insert(name.to_string(), value.to_string());
                }
                if msg.param(2) == Some("*") {
                    return;
                }
                let mut request: Vec<&str> = REQUEST_CAPS
                    .iter()
                    .copied()
                    .filter(|cap| self.offered.contains_key(*cap))
                    .collect();
                if self.login.has_credentials() && self.offered.contains_key("sasl") {
                    request.push("sasl");
                }
                if request.is_empty() {
                    self.finish_cap();
                } else {
                    let wanted = request.join(" ");
                    let _ = self
                        .tx
                        .send(Message::from_args("CAP", &["REQ", wanted.as_str()]));
                }
            }
            Some("ACK") => {
                let mut saw_sasl = false;
                {
                    let mut caps = self.inner.caps.write();
                    for cap in list.split_whitespace() {
                        if let Some(disabled) = cap.strip_prefix('-') {
                            caps.remove(disabled);
                            continue;
                        }
                        if cap == "sasl" {
                            saw_sasl = true;
                        }
                        let value = self.offered.get(cap).cloned().unwrap_or_default();
                        caps.insert(cap.to_string(), value);
                    }
                }
                if saw_sasl && self.login.has_credentials() {
                    let _ = self
                        .tx
                        .send(Message::from_args("AUTHENTICATE", &["PLAIN"]));
                } else {
                    self.finish_cap();
                }
            }
            Some("NAK") => {
                debug!(caps = %list, "server refused capabilities");
                self.finish_cap();
            }
            _ => {}
        }
    }

    fn finish_cap(&mut self) {
        if !self.cap_done {
            self.cap_done = true;
            let _ = self.tx.send(Message::from_args("CAP", &["END"]));
        }
    }

    fn sasl_payload(&self) -> Vec<Message> {
        sasl_plain_chunks(&self.login.sasl_user, &self.login.password)
    }

    fn on_isupport(&mut self, msg: &Message) {
        if msg.params.len() < 2 {
            return;
        }
        // First param is our nick, last is the "are supported" trailer.
        let end = msg.params.len() - 1;
        for token in &msg.params[1..end] {
            if token.starts_with('-') {
                continue;
            }
            let (key, value) = token.split_once('=').unwrap_or((token.as_str(), ""));
            self.isupport_tokens
                .insert(key.to_string(), value.to_string());
        }
    }

    fn enter_ready(&mut self) {
        if self.ready {
            return;
        }
        self.ready = true;
        self.reached_ready = true;

        let profile = Arc::new(Isupport::parse(&self.isupport_tokens));
        *self.inner.isupport.write() = profile.clone();

        let nick = self.inner.current_nick.read().clone();
        let nick_key = profile.fold(&nick);
        self.inner.names.record(&nick_key, &nick);
        self.inner
            .registry
            .add(&self.inner.network.name, &nick_key, self.inner.login_id.clone());
        self.inner.connected.store(true, Ordering::SeqCst);
        self.inner
            .host
            .send_status(&self.inner.login_id, BridgeStatus::Connected);
        debug!(nick = %nick, network = %self.inner.network.name, "registered");

        // Best-effort: the first failure aborts the remaining joins.
        for channel in &self.login.channels {
            if self
                .tx
                .send(Message::from_args("JOIN", &[channel.as_str()]))
                .is_err()
            {
                warn!(channel = %channel, "failed to auto-join channel");
                break;
            }
        }
    }
}

/// Merge a `draft/multiline` batch into one logical message. The
/// `draft/multiline-concat` tag glues a chunk to the previous one without a
/// newline. Identity tags ride on the batch opener and carry over.
fn merge_multiline(open: &Message, messages: Vec<Message>) -> Message {
    let mut merged = messages
        .first()
        .cloned()
        .expect("multiline batch has at least one message");
    let mut body = String::new();
    for (i, part) in messages.iter().enumerate() {
        let chunk = part.param(1).unwrap_or("");
        let concat = part
            .tags
            .as_ref()
            .is_some_and(|tags| tags.iter().any(|Tag(key, _)| key == "draft/multiline-concat"));
        if i > 0 && !concat {
            body.push('\n');
        }
        body.push_str(chunk);
    }
    if merged.params.len() > 1 {
        merged.params[1] = body;
    } else {
        merged.params.push(body);
    }
    for key in ["msgid", "time", "account"] {
        if merged.tag_value(key).is_none() {
            if let Some(value) = open.tag_value(key) {
                merged = merged.with_tag(key, Some(value.to_string()));
            }
        }
    }
    merged
}
