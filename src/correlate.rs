//! Response correlation for a push-based wire.
//!
//! Most IRC commands have no native request/response framing: the "result" of
//! a send has to be recognized in the unsolicited inbound stream, interleaved
//! with traffic for other users and rooms. Three strategies exist, chosen per
//! send by what the server acknowledged:
//!
//! 1. labeled-response: an explicit label tag pairs the reply (slot keyed by
//!    label),
//! 2. echo matching: the server reflects our own action back (slot keyed by
//!    folded target name),
//! 3. heuristic fallback: a single short-lived waiter that claims error-ish
//!    numerics addressed to us, with a short timeout treated as success.
//!
//! Every pending request is a single-slot oneshot: exactly one of {matching
//! inbound event, disconnect, supersession} delivers, enforced by removing
//! the slot from its table at the moment of resolution. Timeouts are handled
//! on the waiting side and the abandoned slot is removed separately, so a
//! late match is silently ignored.

use gangway_proto::Message;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;

use crate::error::ClientError;

/// Error numerics outside the 4xx/5xx classes that still mean "request
/// rejected": invalid mode param, list mode already set / not set, no privs,
/// nick locked. This allow-list is approximate by nature — server-specific
/// numerics outside it will be read as success, and servers that reuse these
/// numbers differently will be read as failure.
pub const FALLBACK_ERROR_NUMERICS: &[&str] = &["696", "697", "698", "723", "902"];

/// How a pending request resolved.
#[derive(Debug)]
pub enum Signal {
    /// A matching inbound event claimed the request.
    Event(Message),
    /// The session disconnected; the request can never be confirmed.
    Disconnected,
    /// A newer send for the same correlation key replaced the request.
    Superseded,
}

/// Explicit tri-state wait result, so "nothing arrived in time" is never
/// conflated with "good answer" by code that does not know which strategy
/// was in play.
#[derive(Debug)]
pub enum WaitOutcome {
    /// A confirmation arrived.
    ResolvedOk(Message),
    /// A negative reply arrived.
    ResolvedErr(Message),
    /// Nothing arrived and the strategy treats that as success (fallback
    /// without echo); carries the synthetic confirmation.
    TimedOutOk(Message),
    /// Nothing arrived and the strategy treats that as failure.
    TimedOutErr,
}

/// Whether an inbound reply reads as a protocol-level rejection.
pub fn is_error_reply(msg: &Message) -> bool {
    if msg.command == "FAIL" {
        return true;
    }
    if FALLBACK_ERROR_NUMERICS.contains(&msg.command.as_str()) {
        return true;
    }
    msg.is_numeric() && matches!(msg.command.as_bytes()[0], b'4' | b'5')
}

struct EchoWaiter {
    expect: String,
    tx: oneshot::Sender<Signal>,
}

struct FallbackWaiter {
    expect: Option<String>,
    tx: oneshot::Sender<Signal>,
}

/// The pending-request table for one session.
#[derive(Default)]
pub struct Correlator {
    labels: Mutex<HashMap<String, oneshot::Sender<Signal>>>,
    echo: Mutex<HashMap<String, EchoWaiter>>,
    fallback: Mutex<Option<FallbackWaiter>>,
    /// Serializes fallback sends: the fallback waiter is a single slot, so
    /// only one such request may be in flight at a time.
    pub(crate) fallback_gate: tokio::sync::Mutex<()>,
    next_label: AtomicU64,
}

impl Correlator {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a fresh request label.
    pub fn next_label(&self) -> String {
        format!("gw{}", self.next_label.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a labeled-response slot.
    pub fn register_label(&self, label: &str) -> oneshot::Receiver<Signal> {
        let (tx, rx) = oneshot::channel();
        self.labels.lock().insert(label.to_string(), tx);
        rx
    }

    /// Deliver a labeled reply. Returns whether a request claimed it.
    pub fn complete_label(&self, label: &str, msg: Message) -> bool {
        match self.labels.lock().remove(label) {
            Some(tx) => {
                let _ = tx.send(Signal::Event(msg));
                true
            }
            None => false,
        }
    }

    /// Drop a labeled slot (send failed before the wait started, or the wait
    /// timed out).
    pub fn abort_label(&self, label: &str) {
        self.labels.lock().remove(label);
    }

    /// Register an echo waiter for a correlation key (folded target name).
    ///
    /// At most one request per key may be pending: a second registration
    /// supersedes the first, which resolves with [`Signal::Superseded`]
    /// rather than hanging.
    pub fn register_echo(&self, key: &str, expect: &str) -> oneshot::Receiver<Signal> {
        let (tx, rx) = oneshot::channel();
        let old = self.echo.lock().insert(
            key.to_string(),
            EchoWaiter {
                expect: expect.to_string(),
                tx,
            },
        );
        if let Some(old) = old {
            let _ = old.tx.send(Signal::Superseded);
        }
        rx
    }

    /// Try to claim an echo waiter with an inbound event for `key`. The
    /// caller has already verified the event originates from the local
    /// identity; the command must match what the request expected. Returns
    /// whether the event was consumed.
    pub fn claim_echo(&self, key: &str, msg: &Message) -> bool {
        let mut echo = self.echo.lock();
        let matches = echo
            .get(key)
            .is_some_and(|waiter| waiter.expect == msg.command);
        if !matches {
            return false;
        }
        let waiter = echo.remove(key).expect("checked above");
        drop(echo);
        let _ = waiter.tx.send(Signal::Event(msg.clone()));
        true
    }

    /// Remove an echo waiter whose wait expired.
    pub fn abort_echo(&self, key: &str) {
        self.echo.lock().remove(key);
    }

    /// Install the fallback waiter. `expect` is the command the server will
    /// echo back when echo-message is in play; `None` means only error-ish
    /// numerics can claim the slot.
    pub fn register_fallback(&self, expect: Option<String>) -> oneshot::Receiver<Signal> {
        let (tx, rx) = oneshot::channel();
        let old = self.fallback.lock().replace(FallbackWaiter { expect, tx });
        if let Some(old) = old {
            let _ = old.tx.send(Signal::Superseded);
        }
        rx
    }

    /// Try to claim the fallback waiter with an inbound event.
    ///
    /// Claims on: a numeric in class 4xx/5xx or in the fixed allow-list,
    /// addressed to the local identity; or the expected echo command
    /// originating from the local identity.
    pub fn claim_fallback(&self, msg: &Message, current_nick: &str) -> bool {
        let mut slot = self.fallback.lock();
        let Some(waiter) = slot.as_ref() else {
            return false;
        };

        let expected_echo = waiter
            .expect
            .as_deref()
            .is_some_and(|e| e == msg.command && msg.source_nickname() == Some(current_nick));
        let error_reply = is_error_reply(msg)
            && msg.command != "FAIL"
            && msg.param(0) == Some(current_nick);
        if !expected_echo && !error_reply {
            return false;
        }

        let waiter = slot.take().expect("checked above");
        drop(slot);
        let _ = waiter.tx.send(Signal::Event(msg.clone()));
        true
    }

    /// Drop the fallback waiter after its wait ended.
    pub fn clear_fallback(&self) {
        self.fallback.lock().take();
    }

    /// Resolve every pending request as disconnected. Nothing may stay
    /// blocked across a connection loss.
    pub fn fail_all(&self) {
        for (_, tx) in self.labels.lock().drain() {
            let _ = tx.send(Signal::Disconnected);
        }
        for (_, waiter) in self.echo.lock().drain() {
            let _ = waiter.tx.send(Signal::Disconnected);
        }
        if let Some(waiter) = self.fallback.lock().take() {
            let _ = waiter.tx.send(Signal::Disconnected);
        }
    }
}

/// Wait for a pending request to resolve, bounded by `deadline`.
///
/// `timeout_ok` selects the timeout arm of the tri-state: `Some(synthetic)`
/// treats expiry as implicit success carrying the synthetic confirmation,
/// `None` treats it as failure. Disconnect and supersession surface as
/// errors, not outcomes.
pub async fn await_signal(
    rx: oneshot::Receiver<Signal>,
    deadline: Duration,
    timeout_ok: Option<Message>,
) -> Result<WaitOutcome, ClientError> {
    match tokio::time::timeout(deadline, rx).await {
        Ok(Ok(Signal::Event(msg))) => {
            if is_error_reply(&msg) {
                Ok(WaitOutcome::ResolvedErr(msg))
            } else {
                Ok(WaitOutcome::ResolvedOk(msg))
            }
        }
        Ok(Ok(Signal::Disconnected)) => Err(ClientError::Disconnected),
        Ok(Ok(Signal::Superseded)) => Err(ClientError::Superseded),
        // Sender dropped without a signal: the session tore down.
        Ok(Err(_)) => Err(ClientError::Disconnected),
        Err(_) => Ok(match timeout_ok {
            Some(synthetic) => WaitOutcome::TimedOutOk(synthetic),
            None => WaitOutcome::TimedOutErr,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(raw: &str) -> Message {
        raw.parse().unwrap()
    }

    #[test]
    fn test_echo_claim_requires_exact_target_and_command() {
        let correlator = Correlator::new();
        let mut rx = correlator.register_echo("#chan", "PRIVMSG");

        // Wrong target: not claimed, wait still pending.
        assert!(!correlator.claim_echo("#other", &msg(":me!u@h PRIVMSG #other :hi")));
        assert!(rx.try_recv().is_err());

        // Wrong command on the right target: not claimed.
        assert!(!correlator.claim_echo("#chan", &msg(":me!u@h NOTICE #chan :hi")));
        assert!(rx.try_recv().is_err());

        // Exact match claims and resolves.
        let echo = msg(":me!u@h PRIVMSG #chan :hi");
        assert!(correlator.claim_echo("#chan", &echo));
        match rx.try_recv().unwrap() {
            Signal::Event(m) => assert_eq!(m, echo),
            other => panic!("expected event, got {:?}", other),
        }

        // The slot is gone; a duplicate echo is silently ignored.
        assert!(!correlator.claim_echo("#chan", &echo));
    }

    #[test]
    fn test_second_send_supersedes_first() {
        let correlator = Correlator::new();
        let mut first = correlator.register_echo("#chan", "PRIVMSG");
        let mut second = correlator.register_echo("#chan", "PRIVMSG");

        assert!(matches!(first.try_recv().unwrap(), Signal::Superseded));
        assert!(correlator.claim_echo("#chan", &msg(":me!u@h PRIVMSG #chan :hi")));
        assert!(matches!(second.try_recv().unwrap(), Signal::Event(_)));
    }

    #[test]
    fn test_fallback_claims_allow_list_numeric() {
        let correlator = Correlator::new();
        let mut rx = correlator.register_fallback(None);

        // 697 (list mode already set) is outside 4xx/5xx but on the
        // allow-list.
        let reply = msg(":server 697 me #chan b :Channel ban list already contains x");
        assert!(correlator.claim_fallback(&reply, "me"));
        assert!(matches!(rx.try_recv().unwrap(), Signal::Event(_)));
    }

    #[test]
    fn test_fallback_claims_4xx_class() {
        let correlator = Correlator::new();
        let mut rx = correlator.register_fallback(None);
        let reply = msg(":server 482 me #chan :You're not channel operator");
        assert!(correlator.claim_fallback(&reply, "me"));
        assert!(matches!(rx.try_recv().unwrap(), Signal::Event(_)));
    }

    #[test]
    fn test_fallback_ignores_numerics_for_other_identities() {
        let correlator = Correlator::new();
        let _rx = correlator.register_fallback(None);
        let reply = msg(":server 482 someoneelse #chan :You're not channel operator");
        assert!(!correlator.claim_fallback(&reply, "me"));
    }

    #[test]
    fn test_fallback_ignores_benign_numerics() {
        let correlator = Correlator::new();
        let _rx = correlator.register_fallback(None);
        assert!(!correlator.claim_fallback(&msg(":server 332 me #chan :topic"), "me"));
        assert!(!correlator.claim_fallback(&msg(":other!u@h PRIVMSG me :hi"), "me"));
    }

    #[test]
    fn test_fallback_expected_echo_requires_self_source() {
        let correlator = Correlator::new();
        let _rx = correlator.register_fallback(Some("PRIVMSG".into()));
        assert!(!correlator.claim_fallback(&msg(":other!u@h PRIVMSG nickserv :id"), "me"));
        let mut rx = correlator.register_fallback(Some("PRIVMSG".into()));
        assert!(correlator.claim_fallback(&msg(":me!u@h PRIVMSG nickserv :id"), "me"));
        assert!(matches!(rx.try_recv().unwrap(), Signal::Event(_)));
    }

    #[test]
    fn test_fail_all_releases_every_pending_request() {
        let correlator = Correlator::new();
        let mut echo_rx = correlator.register_echo("#a", "PRIVMSG");
        let mut label_rx = correlator.register_label("gw0");
        let mut fb_rx = correlator.register_fallback(None);

        correlator.fail_all();

        assert!(matches!(echo_rx.try_recv().unwrap(), Signal::Disconnected));
        assert!(matches!(label_rx.try_recv().unwrap(), Signal::Disconnected));
        assert!(matches!(fb_rx.try_recv().unwrap(), Signal::Disconnected));
    }

    #[test]
    fn test_is_error_reply() {
        assert!(is_error_reply(&msg(":s 401 me nick :No such nick")));
        assert!(is_error_reply(&msg(":s 502 me :oops")));
        assert!(is_error_reply(&msg(":s 697 me #c b :already set")));
        assert!(is_error_reply(&msg(":s FAIL REDACT INVALID_TARGET :nope")));
        assert!(!is_error_reply(&msg(":s 001 me :welcome")));
        assert!(!is_error_reply(&msg(":a!b@c PRIVMSG #c :hi")));
    }

    #[tokio::test]
    async fn test_await_signal_timeout_arms() {
        let correlator = Correlator::new();

        let rx = correlator.register_echo("#a", "PRIVMSG");
        let outcome = await_signal(rx, Duration::from_millis(10), None).await;
        assert!(matches!(outcome, Ok(WaitOutcome::TimedOutErr)));

        let rx = correlator.register_fallback(None);
        let synthetic = msg("PRIVMSG #a :hello");
        let outcome = await_signal(rx, Duration::from_millis(10), Some(synthetic)).await;
        match outcome {
            Ok(WaitOutcome::TimedOutOk(m)) => assert_eq!(m.command, "PRIVMSG"),
            other => panic!("expected implicit success, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_await_signal_classifies_negative_replies() {
        let correlator = Correlator::new();
        let rx = correlator.register_fallback(None);
        let reply = msg(":server 482 me #chan :You're not channel operator");
        assert!(correlator.claim_fallback(&reply, "me"));
        let outcome = await_signal(rx, Duration::from_secs(1), None).await;
        assert!(matches!(outcome, Ok(WaitOutcome::ResolvedErr(_))));
    }
}
