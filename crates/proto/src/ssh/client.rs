//! SSH client.
//!
//! [`SshClient`] dials TCP, runs the client handshake and hands out the
//! resulting [`Transport`] for authentication and channels.
//!
//! # Example
//!
//! ```rust,no_run
//! use tessera_proto::ssh::client::SshClient;
//! use tessera_proto::ssh::config::TransportConfig;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let client = SshClient::connect("127.0.0.1:22", TransportConfig::default()).await?;
//! client.authenticate_password("user", "password").await?;
//!
//! let output = client.execute("ls -la").await?;
//! println!("{}", output.stdout_lossy());
//! client.close().await;
//! # Ok(())
//! # }
//! ```

use crate::ssh::auth_handler::AuthResult;
use crate::ssh::config::TransportConfig;
use crate::ssh::hostkey::{fingerprint, HostKey};
use crate::ssh::session::CommandOutput;
use crate::ssh::transport::Transport;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tessera_platform::{AuthError, TesseraError, TesseraResult};
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Decides whether a server host key blob is trusted.
///
/// Called once per key exchange with the blob the server signed with.
/// Returning `false` ends the session with `HOST_KEY_NOT_VERIFIABLE`.
pub type HostKeyVerifier = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// A verifier that trusts exactly one key, matched by fingerprint.
///
/// `expected` takes the `SHA256:<base64>` form printed by
/// [`fingerprint`].
pub fn pinned_host_key(expected: impl Into<String>) -> HostKeyVerifier {
    let expected = expected.into();
    Arc::new(move |blob: &[u8]| fingerprint(blob) == expected)
}

/// Default TCP connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// A connected SSH client.
#[derive(Debug, Clone)]
pub struct SshClient {
    transport: Transport,
    peer: SocketAddr,
}

impl SshClient {
    /// Connects to `addr` and completes the key exchange.
    ///
    /// # Errors
    ///
    /// - [`TesseraError::Timeout`] if the TCP connect takes longer than
    ///   [`DEFAULT_CONNECT_TIMEOUT`]
    /// - [`TesseraError::Io`] if the connection is refused
    /// - any handshake error from [`Transport::start_client`]
    pub async fn connect(addr: &str, config: TransportConfig) -> TesseraResult<Self> {
        Self::connect_timeout(addr, config, DEFAULT_CONNECT_TIMEOUT).await
    }

    /// Like [`connect`](Self::connect) with an explicit connect timeout.
    pub async fn connect_timeout(
        addr: &str,
        config: TransportConfig,
        timeout: Duration,
    ) -> TesseraResult<Self> {
        config.validate()?;
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TesseraError::Timeout(format!("connecting to {}", addr)))?
            .map_err(TesseraError::Io)?;
        stream.set_nodelay(true).map_err(TesseraError::Io)?;
        let peer = stream.peer_addr().map_err(TesseraError::Io)?;
        debug!(peer = %peer, "TCP connected");

        let transport = Transport::start_client(stream, config).await?;
        info!(
            peer = %peer,
            server = %transport.remote_version(),
            "SSH session established"
        );
        Ok(Self { transport, peer })
    }

    /// The underlying session.
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Consumes the client, keeping the session open.
    pub fn into_transport(self) -> Transport {
        self.transport
    }

    /// Address of the server.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Fingerprint of the server's host key.
    pub fn server_fingerprint(&self) -> Option<String> {
        self.transport.remote_host_key().map(|blob| fingerprint(&blob))
    }

    /// Password authentication.
    pub async fn authenticate_password(&self, user: &str, password: &str) -> TesseraResult<AuthResult> {
        self.transport.auth_password(user, password).await
    }

    /// Public key authentication with `key`.
    pub async fn authenticate_publickey(
        &self,
        user: &str,
        key: &dyn HostKey,
    ) -> TesseraResult<AuthResult> {
        self.transport.auth_publickey(user, key).await
    }

    /// Runs `command` and collects its output.
    pub async fn execute(&self, command: &str) -> TesseraResult<CommandOutput> {
        if !self.transport.is_authenticated() {
            return Err(TesseraError::Auth(AuthError::new("not authenticated")));
        }
        self.transport.run_command(command).await
    }

    /// Disconnects.
    pub async fn close(&self) {
        self.transport.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::auth_handler::AuthDecision;
    use crate::ssh::hostkey::Ed25519HostKey;
    use crate::ssh::server::{ServerHandler, SshServer};
    use tessera_platform::SystemRandomSource;

    struct Accept;

    #[async_trait::async_trait]
    impl ServerHandler for Accept {
        async fn auth_password(&self, _user: &str, password: &str) -> AuthDecision {
            if password == "pw" {
                AuthDecision::Success
            } else {
                AuthDecision::Failure
            }
        }
    }

    async fn serve() -> (SocketAddr, String) {
        let host_key = Arc::new(Ed25519HostKey::generate(&SystemRandomSource::new()).unwrap());
        let print = fingerprint(&host_key.public_key_bytes());
        let server = SshServer::bind("127.0.0.1:0", host_key, Arc::new(Accept), TransportConfig::default())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                if let Ok(transport) = server.accept().await {
                    tokio::spawn(async move { transport.wait_closed().await });
                }
            }
        });
        (addr, print)
    }

    #[tokio::test]
    async fn test_connect_and_authenticate() {
        let (addr, print) = serve().await;
        let client = SshClient::connect(&addr.to_string(), TransportConfig::default())
            .await
            .unwrap();
        assert_eq!(client.peer_addr(), addr);
        assert_eq!(client.server_fingerprint().as_deref(), Some(print.as_str()));

        let err = client.execute("true").await.unwrap_err();
        assert!(matches!(err, TesseraError::Auth(_)));

        assert_eq!(
            client.authenticate_password("me", "pw").await.unwrap(),
            AuthResult::Success
        );
        assert!(client.transport().is_authenticated());
        client.close().await;
        assert!(!client.transport().is_active());
    }

    #[tokio::test]
    async fn test_pinned_host_key() {
        let (addr, print) = serve().await;
        let config = TransportConfig::default().with_host_key_verifier(pinned_host_key(print));
        assert!(SshClient::connect(&addr.to_string(), config).await.is_ok());

        let config = TransportConfig::default()
            .with_host_key_verifier(pinned_host_key("SHA256:not-this-one"));
        let err = SshClient::connect(&addr.to_string(), config).await.unwrap_err();
        assert!(matches!(err, TesseraError::SessionClosed(Some(_))));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = SshClient::connect(&addr.to_string(), TransportConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TesseraError::Io(_)));
    }
}
