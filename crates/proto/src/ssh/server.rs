//! SSH server side.
//!
//! A [`ServerHandler`] supplies every policy decision the transport needs
//! when serving a client: authentication, channel opens, channel requests
//! and global requests. [`SshServer`] accepts TCP connections and runs the
//! server handshake on each.
//!
//! Handler methods run on the transport's receive loop. They may inspect
//! the channel they are given but must not wait on the peer; work that
//! writes to a channel belongs in [`ServerHandler::session_started`], which
//! runs on its own task once the request has been answered.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tessera_platform::SystemRandomSource;
//! use tessera_proto::ssh::auth_handler::AuthDecision;
//! use tessera_proto::ssh::channel::Channel;
//! use tessera_proto::ssh::config::TransportConfig;
//! use tessera_proto::ssh::connection::ChannelRequestType;
//! use tessera_proto::ssh::hostkey::Ed25519HostKey;
//! use tessera_proto::ssh::server::{ServerHandler, SshServer};
//!
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl ServerHandler for Echo {
//!     async fn auth_password(&self, user: &str, password: &str) -> AuthDecision {
//!         if user == "admin" && password == "secret" {
//!             AuthDecision::Success
//!         } else {
//!             AuthDecision::Failure
//!         }
//!     }
//!
//!     async fn exec_request(&self, _channel: &Channel, _command: &str) -> bool {
//!         true
//!     }
//!
//!     async fn session_started(&self, channel: Channel, request: ChannelRequestType) {
//!         if let ChannelRequestType::Exec { command } = request {
//!             let _ = channel.sendall(command.as_bytes()).await;
//!             let _ = channel.send_exit_status(0).await;
//!             let _ = channel.close().await;
//!         }
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let host_key = Arc::new(Ed25519HostKey::generate(&SystemRandomSource::new())?);
//! let server = SshServer::bind("127.0.0.1:2222", host_key, Arc::new(Echo), TransportConfig::default()).await?;
//!
//! loop {
//!     let transport = server.accept().await?;
//!     tokio::spawn(async move {
//!         while let Ok(_channel) = transport.accept(None).await {}
//!     });
//! }
//! # }
//! ```

use crate::ssh::auth::InfoRequest;
use crate::ssh::auth_handler::AuthDecision;
use crate::ssh::channel::Channel;
use crate::ssh::config::TransportConfig;
use crate::ssh::connection::{ChannelOpenFailureReason, ChannelRequestType, ChannelType};
use crate::ssh::hostkey::HostKey;
use crate::ssh::transport::Transport;
use std::net::SocketAddr;
use std::sync::Arc;
use tessera_platform::{TesseraError, TesseraResult};
use tokio::net::TcpListener;
use tracing::{debug, info};

/// Server-side policy.
///
/// Every method has a conservative default: authentication fails, only
/// session channels open, and every request is refused.
#[async_trait::async_trait]
pub trait ServerHandler: Send + Sync + 'static {
    /// Methods listed in `USERAUTH_FAILURE`.
    fn allowed_auth_methods(&self, _user: &str) -> Vec<String> {
        vec![
            "publickey".to_string(),
            "password".to_string(),
            "keyboard-interactive".to_string(),
        ]
    }

    /// `none` authentication. Not counted as an attempt.
    async fn auth_none(&self, _user: &str) -> AuthDecision {
        AuthDecision::Failure
    }

    /// Password authentication.
    async fn auth_password(&self, _user: &str, _password: &str) -> AuthDecision {
        AuthDecision::Failure
    }

    /// Whether a signature from this key would be considered.
    ///
    /// Answers the unsigned query a client sends before signing.
    async fn auth_publickey_acceptable(&self, _user: &str, _algorithm: &str, _key: &[u8]) -> bool {
        false
    }

    /// Public key authentication. Called only after the signature over the
    /// session id verified.
    async fn auth_publickey(&self, _user: &str, _algorithm: &str, _key: &[u8]) -> AuthDecision {
        AuthDecision::Failure
    }

    /// Starts keyboard-interactive authentication. `None` rejects it.
    async fn auth_keyboard_interactive(
        &self,
        _user: &str,
        _submethods: &str,
    ) -> Option<InfoRequest> {
        None
    }

    /// Checks the answers to the prompts. [`AuthDecision::Prompt`] starts
    /// another round.
    async fn auth_keyboard_interactive_response(
        &self,
        _user: &str,
        _responses: &[String],
    ) -> AuthDecision {
        AuthDecision::Failure
    }

    /// Decides whether a client may open a channel of this kind.
    async fn channel_open(&self, kind: &ChannelType) -> Result<(), ChannelOpenFailureReason> {
        match kind {
            ChannelType::Session => Ok(()),
            ChannelType::Unknown(_) => Err(ChannelOpenFailureReason::UnknownChannelType),
            _ => Err(ChannelOpenFailureReason::AdministrativelyProhibited),
        }
    }

    /// `pty-req`.
    async fn pty_request(&self, _channel: &Channel, _term: &str, _width: u32, _height: u32) -> bool {
        false
    }

    /// `shell`.
    async fn shell_request(&self, _channel: &Channel) -> bool {
        false
    }

    /// `exec`.
    async fn exec_request(&self, _channel: &Channel, _command: &str) -> bool {
        false
    }

    /// `subsystem`.
    async fn subsystem_request(&self, _channel: &Channel, _name: &str) -> bool {
        false
    }

    /// `env`.
    async fn env_request(&self, _channel: &Channel, _name: &str, _value: &str) -> bool {
        false
    }

    /// `window-change`.
    async fn window_change_request(&self, _channel: &Channel, _width: u32, _height: u32) -> bool {
        false
    }

    /// Runs an accepted `shell`, `exec` or `subsystem` request.
    ///
    /// Called on a separate task after the success reply is on the wire, so
    /// it may write to and close the channel freely.
    async fn session_started(&self, _channel: Channel, _request: ChannelRequestType) {}

    /// Global request. `Some` carries the response data for success.
    async fn global_request(&self, _name: &str, _data: &[u8]) -> Option<Vec<u8>> {
        None
    }
}

/// Default handler that refuses everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct RejectAll;

impl ServerHandler for RejectAll {}

/// A TCP listener that serves SSH.
pub struct SshServer {
    listener: TcpListener,
    host_key: Arc<dyn HostKey>,
    handler: Arc<dyn ServerHandler>,
    config: TransportConfig,
}

impl std::fmt::Debug for SshServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshServer")
            .field("local_addr", &self.listener.local_addr().ok())
            .field("host_key", &self.host_key.algorithm_name())
            .finish_non_exhaustive()
    }
}

impl SshServer {
    /// Binds a listener.
    ///
    /// # Errors
    ///
    /// [`TesseraError::Config`] for an invalid configuration, or the bind
    /// I/O error.
    pub async fn bind(
        addr: &str,
        host_key: Arc<dyn HostKey>,
        handler: Arc<dyn ServerHandler>,
        config: TransportConfig,
    ) -> TesseraResult<Self> {
        config.validate()?;
        let listener = TcpListener::bind(addr).await.map_err(TesseraError::Io)?;
        info!(addr = ?listener.local_addr().ok(), "SSH server listening");
        Ok(Self {
            listener,
            host_key,
            handler,
            config,
        })
    }

    /// Accepts one client and completes the key exchange with it.
    ///
    /// Authentication and channels are then driven by the handler.
    pub async fn accept(&self) -> TesseraResult<Transport> {
        let (stream, peer) = self.listener.accept().await.map_err(TesseraError::Io)?;
        stream.set_nodelay(true).map_err(TesseraError::Io)?;
        debug!(peer = %peer, "Accepted connection");
        Transport::start_server(
            stream,
            Arc::clone(&self.host_key),
            Arc::clone(&self.handler),
            self.config.clone(),
        )
        .await
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_platform::SystemRandomSource;
    use crate::ssh::hostkey::Ed25519HostKey;

    #[tokio::test]
    async fn test_default_handler_policy() {
        let handler = RejectAll;
        assert_eq!(handler.auth_password("a", "b").await, AuthDecision::Failure);
        assert_eq!(handler.channel_open(&ChannelType::Session).await, Ok(()));
        assert_eq!(
            handler
                .channel_open(&ChannelType::Unknown("weird".into()))
                .await,
            Err(ChannelOpenFailureReason::UnknownChannelType)
        );
        assert!(handler.global_request("tcpip-forward", &[]).await.is_none());
        assert!(handler.allowed_auth_methods("a").contains(&"password".to_string()));
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let host_key = Arc::new(Ed25519HostKey::generate(&SystemRandomSource::new()).unwrap());
        let server = SshServer::bind(
            "127.0.0.1:0",
            host_key,
            Arc::new(RejectAll),
            TransportConfig::default(),
        )
        .await
        .unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);
    }
}
