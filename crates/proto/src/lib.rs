//! SSH protocol core for the Tessera stack.
//!
//! This crate implements the client and server sides of SSH version 2:
//!
//! - the binary packet protocol with encryption, MAC and rekey accounting
//! - Diffie-Hellman key exchange (group1, group14, group exchange)
//! - user authentication (none, password, publickey, keyboard-interactive)
//! - multiplexed channels with per-channel flow control
//!
//! # Features
//!
//! - `ssh` (default) - SSH protocol support (client + server)
//! - `serde` - `Serialize`/`Deserialize` for configuration types
//!
//! # Example
//!
//! ```rust
//! use tessera_proto::ssh::packet::compute_padding_len;
//!
//! // 1-byte payload in the unencrypted 8-byte block: 4 + 1 + 1 + padding
//! let padding = compute_padding_len(1, 8);
//! assert!(padding >= 4);
//! assert_eq!((4 + 1 + 1 + padding) % 8, 0);
//! ```
//!
//! # Security
//!
//! - All cryptographic primitives come from vetted libraries (`ring`,
//!   `ed25519-dalek`, RustCrypto)
//! - Constant-time comparison for MACs and passwords
//! - Secret material is zeroized with `zeroize`
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4252](https://datatracker.ietf.org/doc/html/rfc4252) - SSH Authentication Protocol
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

#[cfg(feature = "ssh")]
pub mod ssh;
