//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tessera_platform::SystemRandomSource;
use tessera_proto::ssh::auth::{InfoRequest, Prompt};
use tessera_proto::ssh::auth_handler::AuthDecision;
use tessera_proto::ssh::channel::Channel;
use tessera_proto::ssh::client::SshClient;
use tessera_proto::ssh::config::TransportConfig;
use tessera_proto::ssh::connection::ChannelRequestType;
use tessera_proto::ssh::hostkey::{Ed25519HostKey, HostKey};
use tessera_proto::ssh::server::{ServerHandler, SshServer};
use tessera_proto::ssh::transport::Transport;
use tokio::time::{timeout, Duration};
use tracing_subscriber::EnvFilter;

pub type TestResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

pub const USER: &str = "alice";
pub const PASSWORD: &str = "correct horse";
/// Needs the password, then a one-time code in a second prompt round.
pub const OTP_USER: &str = "dana";
pub const OTP_CODE: &str = "271828";
pub const STEP: Duration = Duration::from_secs(10);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Deterministic bytes for transfer checks.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// A server that accepts [`USER`]/[`PASSWORD`] and a handful of commands:
///
/// - `echo <text>` prints `<text>\n`
/// - `cat` echoes stdin back until EOF
/// - `stream <n>` prints [`pattern`]`(n)`
/// - `stderr` writes to both streams and exits 3
/// - `silent` closes without an exit status
/// - `hang` prints `started\n` and never finishes
#[derive(Default)]
pub struct TestServer {
    pub password_attempts: AtomicU32,
    pub authorized_key: Option<Vec<u8>>,
    pub partial_first: bool,
}

impl TestServer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl ServerHandler for TestServer {
    async fn auth_password(&self, user: &str, password: &str) -> AuthDecision {
        self.password_attempts.fetch_add(1, Ordering::SeqCst);
        match (user == USER && password == PASSWORD, self.partial_first) {
            (true, true) => AuthDecision::PartialSuccess(vec!["keyboard-interactive".to_string()]),
            (true, false) => AuthDecision::Success,
            (false, _) => AuthDecision::Failure,
        }
    }

    async fn auth_publickey_acceptable(&self, _user: &str, _algorithm: &str, key: &[u8]) -> bool {
        self.authorized_key.as_deref() == Some(key)
    }

    async fn auth_publickey(&self, user: &str, _algorithm: &str, key: &[u8]) -> AuthDecision {
        if user == USER && self.authorized_key.as_deref() == Some(key) {
            AuthDecision::Success
        } else {
            AuthDecision::Failure
        }
    }

    async fn auth_keyboard_interactive(&self, _user: &str, _submethods: &str) -> Option<InfoRequest> {
        Some(InfoRequest {
            name: "login".to_string(),
            instruction: String::new(),
            prompts: vec![Prompt::new("Password: ", false)],
        })
    }

    async fn auth_keyboard_interactive_response(&self, user: &str, responses: &[String]) -> AuthDecision {
        match (user, responses) {
            (USER, [password]) if password == PASSWORD => AuthDecision::Success,
            (OTP_USER, [password]) if password == PASSWORD => AuthDecision::Prompt(InfoRequest {
                name: "one-time code".to_string(),
                instruction: "Enter the code from your token".to_string(),
                prompts: vec![Prompt::new("Code: ", true)],
            }),
            (OTP_USER, [code]) if code == OTP_CODE => AuthDecision::Success,
            _ => AuthDecision::Failure,
        }
    }

    async fn pty_request(&self, _channel: &Channel, _term: &str, _width: u32, _height: u32) -> bool {
        true
    }

    async fn env_request(&self, _channel: &Channel, name: &str, _value: &str) -> bool {
        name.starts_with("LC_")
    }

    async fn exec_request(&self, _channel: &Channel, command: &str) -> bool {
        command.starts_with("echo ")
            || command.starts_with("stream ")
            || matches!(command, "cat" | "stderr" | "silent" | "hang")
    }

    async fn subsystem_request(&self, _channel: &Channel, name: &str) -> bool {
        name == "echo"
    }

    async fn session_started(&self, channel: Channel, request: ChannelRequestType) {
        let result = match request {
            ChannelRequestType::Exec { command } => run(&channel, &command).await,
            ChannelRequestType::Subsystem { .. } => run(&channel, "cat").await,
            _ => Ok(()),
        };
        if let Err(e) = result {
            tracing::debug!(error = %e, "Test command failed");
        }
    }

    async fn global_request(&self, name: &str, data: &[u8]) -> Option<Vec<u8>> {
        (name == "ping@tessera").then(|| data.to_vec())
    }
}

async fn run(channel: &Channel, command: &str) -> tessera_platform::TesseraResult<()> {
    let status = if let Some(text) = command.strip_prefix("echo ") {
        channel.sendall(format!("{}\n", text).as_bytes()).await?;
        Some(0)
    } else if let Some(len) = command.strip_prefix("stream ") {
        let len = len.parse().unwrap_or(0);
        channel.sendall(&pattern(len)).await?;
        Some(0)
    } else if command == "cat" {
        loop {
            let chunk = channel.recv(16 * 1024).await?;
            if chunk.is_empty() {
                break;
            }
            channel.sendall(&chunk).await?;
        }
        Some(0)
    } else if command == "hang" {
        channel.sendall(b"started\n").await?;
        while !channel.is_closed() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        return Ok(());
    } else if command == "stderr" {
        channel.sendall(b"out\n").await?;
        channel.sendall_stderr(b"oops\n").await?;
        Some(3)
    } else {
        None
    };
    if let Some(status) = status {
        channel.send_exit_status(status).await?;
    }
    channel.close().await
}

pub fn host_key() -> Arc<Ed25519HostKey> {
    Arc::new(Ed25519HostKey::generate(&SystemRandomSource::new()).expect("host key"))
}

/// Client and server transports joined by an in-memory pipe.
pub async fn duplex_pair(
    client_config: TransportConfig,
    server_config: TransportConfig,
    handler: Arc<dyn ServerHandler>,
) -> TestResult<(Transport, Transport)> {
    let (a, b) = tokio::io::duplex(256 * 1024);
    let key: Arc<dyn HostKey> = host_key();
    let (client, server) = timeout(
        STEP,
        async {
            tokio::try_join!(
                Transport::start_client(a, client_config),
                Transport::start_server(b, key, handler, server_config),
            )
        },
    )
    .await??;
    Ok((client, server))
}

/// A real TCP server on an ephemeral port that serves every connection
/// until it closes. Returns the address to dial.
pub async fn spawn_tcp_server(
    config: TransportConfig,
    handler: Arc<dyn ServerHandler>,
) -> TestResult<String> {
    let server = SshServer::bind("127.0.0.1:0", host_key(), handler, config).await?;
    let addr = server.local_addr()?.to_string();
    tokio::spawn(async move {
        loop {
            if let Ok(transport) = server.accept().await {
                tokio::spawn(async move {
                    // Sessions run from session_started; the handles are not needed.
                    while transport.accept(None).await.is_ok() {}
                });
            }
        }
    });
    Ok(addr)
}

pub async fn connect(addr: &str, config: TransportConfig) -> TestResult<SshClient> {
    Ok(timeout(STEP, SshClient::connect(addr, config)).await??)
}
