//! SSH version 2 (RFC 4251-4254).
//!
//! # Architecture
//!
//! The implementation is layered:
//!
//! 1. **Wire** ([`wire`], [`message`], [`version`]) - primitive encodings,
//!    message numbers and identification strings
//! 2. **Packets** ([`packet`], [`crypto`]) - the binary packet protocol with
//!    encryption, MAC, sequence numbers and rekey accounting (RFC 4253 §6)
//! 3. **Key exchange** ([`kex`], [`kex_dh`], [`kex_gex`], [`hostkey`]) -
//!    algorithm negotiation, Diffie-Hellman group1/group14 and group
//!    exchange, key derivation (RFC 4253 §7-8, RFC 4419)
//! 4. **Transport** ([`transport`]) - the session state machine and its
//!    receive loop
//! 5. **Authentication** ([`auth`], [`auth_handler`]) - RFC 4252 and
//!    keyboard-interactive (RFC 4256)
//! 6. **Connection** ([`connection`], [`channel`]) - multiplexed channels
//!    with flow control (RFC 4254)
//! 7. **Endpoints** ([`client`], [`server`], [`session`])
//!
//! # Security Considerations
//!
//! - **Input Validation**: packet lengths, padding and every field are
//!   bounds-checked before use
//! - **Constant-Time Operations**: MAC and password comparisons use
//!   [`subtle`]
//! - **Memory Safety**: shared secrets and derived keys are zeroized on drop
//!   using [`zeroize`]
//! - **No Unsafe Code**
//!
//! # Example
//!
//! ```rust,no_run
//! use tessera_proto::ssh::{SshClient, TransportConfig};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let client = SshClient::connect("127.0.0.1:22", TransportConfig::default()).await?;
//! client.authenticate_password("user", "password").await?;
//! let output = client.execute("echo hi").await?;
//! assert_eq!(output.stdout, b"hi\n");
//! # Ok(())
//! # }
//! ```
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4252](https://datatracker.ietf.org/doc/html/rfc4252) - SSH Authentication Protocol
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol
//! - [RFC 4419](https://datatracker.ietf.org/doc/html/rfc4419) - Diffie-Hellman Group Exchange

pub mod auth;
pub mod auth_handler;
pub mod channel;
pub mod client;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod hostkey;
pub mod kex;
pub mod kex_dh;
pub mod kex_gex;
pub mod message;
pub mod packet;
pub mod server;
pub mod session;
pub mod transport;
pub mod version;
pub mod wire;

// Re-export main types
pub use auth::{AuthMethod, InfoRequest, Prompt};
pub use auth_handler::{AuthDecision, AuthResult};
pub use channel::{Channel, ExitSignal};
pub use client::{pinned_host_key, HostKeyVerifier, SshClient};
pub use config::{AlgorithmPreferences, TransportConfig};
pub use connection::{ChannelOpenFailureReason, ChannelRequestType, ChannelType};
pub use crypto::{CipherAlgorithm, CompressionAlgorithm, MacAlgorithm};
pub use hostkey::{fingerprint, Ed25519HostKey, HostKey, HostKeyAlgorithm};
pub use kex::Negotiated;
pub use kex_gex::{GexBounds, Modulus, ModuliPool};
pub use message::{DisconnectReason, MessageType};
pub use packet::{Packetizer, RekeyPolicy};
pub use server::{RejectAll, ServerHandler, SshServer};
pub use session::{CommandOutput, KeepaliveTask};
pub use transport::{SessionState, Transport};
pub use version::{BannerLimits, Version};
