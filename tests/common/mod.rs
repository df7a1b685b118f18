//! Integration test common infrastructure.
//!
//! Provides a scripted server speaking raw IRC over a local socket and a
//! recording bridge-host implementation.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use gangway::events::RemoteEvent;
use gangway::host::{BridgeHost, BridgeStatus};
use gangway::ids::{make_login_id, LoginId};
use gangway::registry::ClientRegistry;
use gangway::{IrcClient, LoginConfig, NetworkConfig};

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Recording host: hands out a fixed ident, stores the login config in
/// memory, and funnels events and statuses into channels.
pub struct TestHost {
    login: Mutex<LoginConfig>,
    events_tx: mpsc::UnboundedSender<RemoteEvent>,
    status_tx: mpsc::UnboundedSender<BridgeStatus>,
}

impl TestHost {
    pub fn new(
        login: LoginConfig,
    ) -> (
        Arc<Self>,
        mpsc::UnboundedReceiver<RemoteEvent>,
        mpsc::UnboundedReceiver<BridgeStatus>,
    ) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        (
            Arc::new(TestHost {
                login: Mutex::new(login),
                events_tx,
                status_tx,
            }),
            events_rx,
            status_rx,
        )
    }

    pub fn stored_login(&self) -> LoginConfig {
        self.login.lock().clone()
    }
}

#[async_trait]
impl BridgeHost for TestHost {
    async fn lookup_ident(&self, _login: &LoginId) -> anyhow::Result<String> {
        Ok("ident".to_string())
    }

    async fn load_login(&self, _login: &LoginId) -> anyhow::Result<Option<LoginConfig>> {
        Ok(Some(self.login.lock().clone()))
    }

    async fn save_login(&self, _login: &LoginId, config: &LoginConfig) -> anyhow::Result<()> {
        *self.login.lock() = config.clone();
        Ok(())
    }

    fn queue_remote_event(&self, _login: &LoginId, event: RemoteEvent) {
        let _ = self.events_tx.send(event);
    }

    fn send_status(&self, _login: &LoginId, status: BridgeStatus) {
        let _ = self.status_tx.send(status);
    }
}

/// One accepted server-side connection with line-level scripting helpers.
pub struct ServerConn {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl ServerConn {
    pub fn new(stream: TcpStream) -> Self {
        let (reader, writer) = stream.into_split();
        ServerConn {
            lines: BufReader::new(reader).lines(),
            writer,
        }
    }

    pub async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{}\r\n", line).as_bytes())
            .await
            .expect("server write");
    }

    pub async fn recv(&mut self) -> String {
        let line = tokio::time::timeout(RECV_TIMEOUT, self.lines.next_line())
            .await
            .expect("timed out waiting for client line")
            .expect("server read")
            .expect("client closed connection");
        line.trim_end_matches('\r').to_string()
    }

    /// Read lines until one carries the given command; returns the raw line.
    pub async fn expect(&mut self, command: &str) -> String {
        loop {
            let line = self.recv().await;
            if command_of(&line) == command {
                return line;
            }
        }
    }

    /// Drive the registration exchange, offering `caps` (space-separated) in
    /// CAP LS. Returns the client's nick.
    pub async fn handshake(&mut self, caps: &str) -> String {
        self.expect("CAP").await; // CAP LS 302
        let nick_line = self.expect("NICK").await;
        let nick = nick_line
            .split_whitespace()
            .last()
            .expect("nick argument")
            .trim_start_matches(':')
            .to_string();
        self.expect("USER").await;

        self.send(&format!(":test.server CAP * LS :{}", caps)).await;
        if !caps.is_empty() {
            let req = self.expect("CAP").await; // CAP REQ :...
            let requested = req
                .split_once("REQ ")
                .map(|(_, rest)| rest.trim_start_matches(':'))
                .unwrap_or("")
                .to_string();
            self.send(&format!(":test.server CAP {} ACK :{}", nick, requested))
                .await;
        }
        self.expect("CAP").await; // CAP END
        self.finish_registration(&nick).await;
        nick
    }

    pub async fn finish_registration(&mut self, nick: &str) {
        self.send(&format!(":test.server 001 {} :Welcome to TestNet", nick))
            .await;
        self.send(&format!(
            ":test.server 005 {} CHANTYPES=# CASEMAPPING=rfc1459 PREFIX=(qaohv)~&@%+ :are supported by this server",
            nick
        ))
        .await;
        self.send(&format!(":test.server 376 {} :End of /MOTD command.", nick))
            .await;
    }
}

/// The command token of a raw client line (skips tags; clients send no
/// prefix).
pub fn command_of(line: &str) -> &str {
    let mut rest = line;
    if rest.starts_with('@') {
        rest = rest.split_once(' ').map(|(_, r)| r).unwrap_or("");
    }
    rest.split_whitespace().next().unwrap_or("")
}

/// Extract the label tag from a raw client line.
pub fn label_of(line: &str) -> Option<String> {
    let tags = line.strip_prefix('@')?.split_once(' ')?.0;
    tags.split(';').find_map(|tag| {
        tag.strip_prefix("label=").map(str::to_string)
    })
}

pub struct Fixture {
    pub client: IrcClient,
    pub host: Arc<TestHost>,
    pub events: mpsc::UnboundedReceiver<RemoteEvent>,
    pub status: mpsc::UnboundedReceiver<BridgeStatus>,
    pub listener: TcpListener,
}

impl Fixture {
    /// Bind a local listener and build a client pointed at it. The session
    /// is not started.
    pub async fn new(login: LoginConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("local addr").to_string();
        let (host, events, status) = TestHost::new(login);
        let network = NetworkConfig {
            name: "test".to_string(),
            display_name: String::new(),
            address,
            tls: false,
            ctcp: false,
        };
        let client = IrcClient::new(
            network,
            make_login_id("test", "account"),
            Arc::new(ClientRegistry::new()),
            host.clone(),
        );
        Fixture {
            client,
            host,
            events,
            status,
            listener,
        }
    }

    /// Start the session and accept the server side of it.
    pub async fn start(&mut self) -> ServerConn {
        self.client.connect().await.expect("connect");
        let (stream, _) = tokio::time::timeout(RECV_TIMEOUT, self.listener.accept())
            .await
            .expect("timed out waiting for connection")
            .expect("accept");
        ServerConn::new(stream)
    }

    pub async fn next_event(&mut self) -> RemoteEvent {
        tokio::time::timeout(RECV_TIMEOUT, self.events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    pub async fn next_status(&mut self) -> BridgeStatus {
        tokio::time::timeout(RECV_TIMEOUT, self.status.recv())
            .await
            .expect("timed out waiting for status")
            .expect("status channel closed")
    }
}

pub fn login(nick: &str, channels: &[&str]) -> LoginConfig {
    LoginConfig {
        nick: nick.to_string(),
        real_name: "Test User".to_string(),
        sasl_user: String::new(),
        password: String::new(),
        channels: channels.iter().map(|c| c.to_string()).collect(),
    }
}
