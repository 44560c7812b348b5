//! SSH key exchange (KEX) framework (RFC 4253 Sections 7 and 8).
//!
//! This module implements the method-independent half of key exchange:
//! - SSH_MSG_KEXINIT and SSH_MSG_NEWKEYS messages
//! - Algorithm negotiation
//! - The [`KexAlgorithm`] trait implemented by each method
//! - Key derivation of the six values A-F (RFC 4253 Section 7.2)
//!
//! # Key Exchange Flow
//!
//! 1. Both sides send SSH_MSG_KEXINIT
//! 2. Algorithm negotiation (client preference wins)
//! 3. The chosen [`KexAlgorithm`] exchanges method-specific messages
//! 4. Both sides send SSH_MSG_NEWKEYS
//! 5. Each direction switches to its new keys independently
//!
//! # Example
//!
//! ```rust
//! use tessera_platform::SystemRandomSource;
//! use tessera_proto::ssh::config::AlgorithmPreferences;
//! use tessera_proto::ssh::kex::{KexInit, NewKeys};
//!
//! let kexinit = KexInit::new(&AlgorithmPreferences::default(), &SystemRandomSource::new()).unwrap();
//! assert!(kexinit.kex_algorithms().contains(&"diffie-hellman-group14-sha256".to_string()));
//!
//! assert_eq!(NewKeys::new().to_bytes(), vec![21]);
//! ```

use crate::ssh::config::AlgorithmPreferences;
use crate::ssh::crypto::{
    CipherAlgorithm, CompressionAlgorithm, MacAlgorithm, MacKey, PacketCipher, PayloadCodec,
};
use crate::ssh::hostkey::HostKey;
use crate::ssh::kex_dh::{DhGroup, DhGroupKex};
use crate::ssh::kex_gex::{GexBounds, GexKex, ModuliPool};
use crate::ssh::message::MessageType;
use crate::ssh::packet::DirectionKeys;
use crate::ssh::wire::{put_bool, put_bytes, put_name_list, Reader};
use bytes::{BufMut, BytesMut};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tessera_platform::{RandomSource, TesseraError, TesseraResult};
use zeroize::Zeroizing;

/// SSH_MSG_KEXINIT message (RFC 4253 Section 7.1).
///
/// Each algorithm list is ordered by preference (most preferred first).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexInit {
    /// Random cookie (16 bytes)
    cookie: [u8; 16],
    /// Key exchange algorithms
    kex_algorithms: Vec<String>,
    /// Server host key algorithms
    server_host_key_algorithms: Vec<String>,
    /// Encryption algorithms client to server
    encryption_algorithms_client_to_server: Vec<String>,
    /// Encryption algorithms server to client
    encryption_algorithms_server_to_client: Vec<String>,
    /// MAC algorithms client to server
    mac_algorithms_client_to_server: Vec<String>,
    /// MAC algorithms server to client
    mac_algorithms_server_to_client: Vec<String>,
    /// Compression algorithms client to server
    compression_algorithms_client_to_server: Vec<String>,
    /// Compression algorithms server to client
    compression_algorithms_server_to_client: Vec<String>,
    /// Languages client to server (usually empty)
    languages_client_to_server: Vec<String>,
    /// Languages server to client (usually empty)
    languages_server_to_client: Vec<String>,
    /// First KEX packet follows
    first_kex_packet_follows: bool,
}

impl KexInit {
    /// Creates a KEXINIT from local preferences with a fresh cookie.
    ///
    /// The same lists are offered for both directions.
    pub fn new(prefs: &AlgorithmPreferences, rng: &dyn RandomSource) -> TesseraResult<Self> {
        let mut cookie = [0u8; 16];
        rng.fill(&mut cookie)?;

        Ok(Self {
            cookie,
            kex_algorithms: prefs.kex.clone(),
            server_host_key_algorithms: prefs.host_key.clone(),
            encryption_algorithms_client_to_server: prefs.ciphers.clone(),
            encryption_algorithms_server_to_client: prefs.ciphers.clone(),
            mac_algorithms_client_to_server: prefs.macs.clone(),
            mac_algorithms_server_to_client: prefs.macs.clone(),
            compression_algorithms_client_to_server: prefs.compression.clone(),
            compression_algorithms_server_to_client: prefs.compression.clone(),
            languages_client_to_server: vec![],
            languages_server_to_client: vec![],
            first_kex_packet_follows: false,
        })
    }

    /// Returns the cookie.
    pub fn cookie(&self) -> &[u8; 16] {
        &self.cookie
    }

    /// Returns the key exchange algorithms.
    pub fn kex_algorithms(&self) -> &[String] {
        &self.kex_algorithms
    }

    /// Returns the server host key algorithms.
    pub fn server_host_key_algorithms(&self) -> &[String] {
        &self.server_host_key_algorithms
    }

    /// Returns the encryption algorithms (client to server).
    pub fn encryption_algorithms_client_to_server(&self) -> &[String] {
        &self.encryption_algorithms_client_to_server
    }

    /// Returns the encryption algorithms (server to client).
    pub fn encryption_algorithms_server_to_client(&self) -> &[String] {
        &self.encryption_algorithms_server_to_client
    }

    /// Returns the MAC algorithms (client to server).
    pub fn mac_algorithms_client_to_server(&self) -> &[String] {
        &self.mac_algorithms_client_to_server
    }

    /// Returns the MAC algorithms (server to client).
    pub fn mac_algorithms_server_to_client(&self) -> &[String] {
        &self.mac_algorithms_server_to_client
    }

    /// Returns whether first KEX packet follows.
    pub fn first_kex_packet_follows(&self) -> bool {
        self.first_kex_packet_follows
    }

    /// Sets the first-kex-packet-follows flag.
    pub fn set_first_kex_packet_follows(&mut self, follows: bool) {
        self.first_kex_packet_follows = follows;
    }

    /// Returns true if this side's optimistic guess matches `negotiated`.
    ///
    /// A guess is right when the first listed kex and host-key algorithms
    /// are the ones that were agreed on (RFC 4253 Section 7).
    pub fn guess_matches(&self, negotiated: &Negotiated) -> bool {
        self.kex_algorithms.first() == Some(&negotiated.kex)
            && self.server_host_key_algorithms.first() == Some(&negotiated.host_key)
    }

    /// Serializes the KEXINIT message to bytes (without packet framing).
    ///
    /// Format (RFC 4253 Section 7.1):
    /// ```text
    /// byte         SSH_MSG_KEXINIT (20)
    /// byte[16]     cookie (random bytes)
    /// name-list    kex_algorithms
    /// name-list    server_host_key_algorithms
    /// name-list    encryption_algorithms_client_to_server
    /// name-list    encryption_algorithms_server_to_client
    /// name-list    mac_algorithms_client_to_server
    /// name-list    mac_algorithms_server_to_client
    /// name-list    compression_algorithms_client_to_server
    /// name-list    compression_algorithms_server_to_client
    /// name-list    languages_client_to_server
    /// name-list    languages_server_to_client
    /// boolean      first_kex_packet_follows
    /// uint32       0 (reserved for future extension)
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::KexInit as u8);
        buf.put_slice(&self.cookie);

        for list in [
            &self.kex_algorithms,
            &self.server_host_key_algorithms,
            &self.encryption_algorithms_client_to_server,
            &self.encryption_algorithms_server_to_client,
            &self.mac_algorithms_client_to_server,
            &self.mac_algorithms_server_to_client,
            &self.compression_algorithms_client_to_server,
            &self.compression_algorithms_server_to_client,
            &self.languages_client_to_server,
            &self.languages_server_to_client,
        ] {
            put_name_list(&mut buf, list);
        }

        put_bool(&mut buf, self.first_kex_packet_follows);
        buf.put_u32(0);
        buf.to_vec()
    }

    /// Parses a KEXINIT message from bytes.
    ///
    /// # Errors
    ///
    /// Returns [`TesseraError::Protocol`] if the message type is wrong or
    /// any field is truncated.
    pub fn from_bytes(data: &[u8]) -> TesseraResult<Self> {
        if data.first() != Some(&(MessageType::KexInit as u8)) {
            return Err(TesseraError::Protocol(format!(
                "Invalid message type: expected 20 (SSH_MSG_KEXINIT), got {:?}",
                data.first()
            )));
        }

        let mut r = Reader::after_type(data);
        let mut cookie = [0u8; 16];
        cookie.copy_from_slice(r.read_raw(16)?);

        let kex_algorithms = r.read_name_list()?;
        let server_host_key_algorithms = r.read_name_list()?;
        let encryption_algorithms_client_to_server = r.read_name_list()?;
        let encryption_algorithms_server_to_client = r.read_name_list()?;
        let mac_algorithms_client_to_server = r.read_name_list()?;
        let mac_algorithms_server_to_client = r.read_name_list()?;
        let compression_algorithms_client_to_server = r.read_name_list()?;
        let compression_algorithms_server_to_client = r.read_name_list()?;
        let languages_client_to_server = r.read_name_list()?;
        let languages_server_to_client = r.read_name_list()?;
        let first_kex_packet_follows = r.read_bool()?;
        let _reserved = r.read_u32()?;

        Ok(Self {
            cookie,
            kex_algorithms,
            server_host_key_algorithms,
            encryption_algorithms_client_to_server,
            encryption_algorithms_server_to_client,
            mac_algorithms_client_to_server,
            mac_algorithms_server_to_client,
            compression_algorithms_client_to_server,
            compression_algorithms_server_to_client,
            languages_client_to_server,
            languages_server_to_client,
            first_kex_packet_follows,
        })
    }
}

/// SSH_MSG_NEWKEYS message (RFC 4253 Section 7.3).
///
/// ```text
/// byte    SSH_MSG_NEWKEYS (21)
/// ```
///
/// The packet sequence number is not reset by NEWKEYS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NewKeys;

impl NewKeys {
    /// Creates a new SSH_MSG_NEWKEYS message.
    pub const fn new() -> Self {
        Self
    }

    /// Serializes the NEWKEYS message to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        vec![MessageType::NewKeys as u8]
    }

    /// Parses a NEWKEYS message from bytes.
    pub fn from_bytes(data: &[u8]) -> TesseraResult<Self> {
        match data.first() {
            Some(&21) => Ok(Self),
            other => Err(TesseraError::Protocol(format!(
                "Invalid message type: expected 21 (SSH_MSG_NEWKEYS), got {:?}",
                other
            ))),
        }
    }
}

/// Negotiates one algorithm category.
///
/// Returns the first entry of the client's list that the server also lists
/// (RFC 4253 Section 7.1). Both peers compute the same answer.
///
/// # Errors
///
/// Returns [`TesseraError::Protocol`] if no common algorithm found.
///
/// # Example
///
/// ```rust
/// use tessera_proto::ssh::kex::negotiate_algorithm;
///
/// let client = vec!["aes256-ctr".to_string(), "aes128-ctr".to_string()];
/// let server = vec!["aes128-ctr".to_string(), "aes256-ctr".to_string()];
///
/// let result = negotiate_algorithm("cipher", &client, &server).unwrap();
/// assert_eq!(result, "aes256-ctr");
/// ```
pub fn negotiate_algorithm(
    category: &str,
    client_list: &[String],
    server_list: &[String],
) -> TesseraResult<String> {
    client_list
        .iter()
        .find(|alg| server_list.contains(alg))
        .cloned()
        .ok_or_else(|| {
            TesseraError::Protocol(format!(
                "No common {} algorithm: client={:?}, server={:?}",
                category, client_list, server_list
            ))
        })
}

/// Outcome of negotiating every KEXINIT category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    /// Key exchange method
    pub kex: String,
    /// Server host key algorithm
    pub host_key: String,
    /// Cipher client to server
    pub cipher_client_to_server: CipherAlgorithm,
    /// Cipher server to client
    pub cipher_server_to_client: CipherAlgorithm,
    /// MAC client to server
    pub mac_client_to_server: MacAlgorithm,
    /// MAC server to client
    pub mac_server_to_client: MacAlgorithm,
    /// Compression client to server
    pub compression_client_to_server: CompressionAlgorithm,
    /// Compression server to client
    pub compression_server_to_client: CompressionAlgorithm,
}

fn parse_name<T>(category: &str, name: String, parse: fn(&str) -> Option<T>) -> TesseraResult<T> {
    parse(&name).ok_or_else(|| {
        TesseraError::Protocol(format!("Negotiated unsupported {} '{}'", category, name))
    })
}

impl Negotiated {
    /// Negotiates every category from the two KEXINIT messages.
    pub fn from_kexinits(client: &KexInit, server: &KexInit) -> TesseraResult<Self> {
        let kex = negotiate_algorithm("kex", &client.kex_algorithms, &server.kex_algorithms)?;
        let host_key = negotiate_algorithm(
            "host key",
            &client.server_host_key_algorithms,
            &server.server_host_key_algorithms,
        )?;

        let cipher = |c: &[String], s: &[String]| -> TesseraResult<CipherAlgorithm> {
            let name = negotiate_algorithm("cipher", c, s)?;
            match CipherAlgorithm::from_name(&name) {
                Some(CipherAlgorithm::None) | None => Err(TesseraError::Protocol(format!(
                    "Negotiated unusable cipher '{}'",
                    name
                ))),
                Some(alg) => Ok(alg),
            }
        };
        let mac = |c: &[String], s: &[String]| -> TesseraResult<MacAlgorithm> {
            parse_name("MAC", negotiate_algorithm("MAC", c, s)?, MacAlgorithm::from_name)
        };
        let compression = |c: &[String], s: &[String]| -> TesseraResult<CompressionAlgorithm> {
            parse_name(
                "compression",
                negotiate_algorithm("compression", c, s)?,
                CompressionAlgorithm::from_name,
            )
        };

        Ok(Self {
            kex,
            host_key,
            cipher_client_to_server: cipher(
                &client.encryption_algorithms_client_to_server,
                &server.encryption_algorithms_client_to_server,
            )?,
            cipher_server_to_client: cipher(
                &client.encryption_algorithms_server_to_client,
                &server.encryption_algorithms_server_to_client,
            )?,
            mac_client_to_server: mac(
                &client.mac_algorithms_client_to_server,
                &server.mac_algorithms_client_to_server,
            )?,
            mac_server_to_client: mac(
                &client.mac_algorithms_server_to_client,
                &server.mac_algorithms_server_to_client,
            )?,
            compression_client_to_server: compression(
                &client.compression_algorithms_client_to_server,
                &server.compression_algorithms_client_to_server,
            )?,
            compression_server_to_client: compression(
                &client.compression_algorithms_server_to_client,
                &server.compression_algorithms_server_to_client,
            )?,
        })
    }
}

/// Hash function a key exchange method is defined over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    /// SHA-1
    Sha1,
    /// SHA-256
    Sha256,
}

impl HashAlgorithm {
    /// Hashes the concatenation of `parts`.
    pub fn digest(&self, parts: &[&[u8]]) -> Vec<u8> {
        match self {
            HashAlgorithm::Sha1 => {
                let mut h = Sha1::new();
                for part in parts {
                    h.update(part);
                }
                h.finalize().to_vec()
            }
            HashAlgorithm::Sha256 => {
                let mut h = Sha256::new();
                for part in parts {
                    h.update(part);
                }
                h.finalize().to_vec()
            }
        }
    }

    /// Output size in bytes.
    pub fn output_len(&self) -> usize {
        match self {
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Sha256 => 32,
        }
    }
}

/// Inputs shared by every key exchange method.
#[derive(Clone)]
pub struct KexParams {
    /// True on the server side
    pub is_server: bool,
    /// Client identification string, without CR LF
    pub client_version: String,
    /// Server identification string, without CR LF
    pub server_version: String,
    /// Client KEXINIT payload
    pub client_kexinit: Vec<u8>,
    /// Server KEXINIT payload
    pub server_kexinit: Vec<u8>,
    /// Server host key (server side only)
    pub host_key: Option<Arc<dyn HostKey>>,
    /// Randomness for private exponents
    pub rng: Arc<dyn RandomSource>,
    /// Group-exchange size request (client side)
    pub gex_bounds: GexBounds,
    /// Groups the server can offer for group exchange
    pub moduli: Arc<ModuliPool>,
}

impl std::fmt::Debug for KexParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KexParams")
            .field("is_server", &self.is_server)
            .field("client_version", &self.client_version)
            .field("server_version", &self.server_version)
            .field("gex_bounds", &self.gex_bounds)
            .finish_non_exhaustive()
    }
}

impl KexParams {
    /// Writes the method-independent prefix of the exchange hash input.
    ///
    /// ```text
    /// string V_C, string V_S, string I_C, string I_S, string K_S
    /// ```
    pub fn hash_prefix(&self, buf: &mut BytesMut, host_key_blob: &[u8]) {
        put_bytes(buf, self.client_version.as_bytes());
        put_bytes(buf, self.server_version.as_bytes());
        put_bytes(buf, &self.client_kexinit);
        put_bytes(buf, &self.server_kexinit);
        put_bytes(buf, host_key_blob);
    }

    /// Returns the server host key or a protocol error.
    pub fn require_host_key(&self) -> TesseraResult<&Arc<dyn HostKey>> {
        self.host_key
            .as_ref()
            .ok_or_else(|| TesseraError::Config("Server has no host key".to_string()))
    }
}

/// Result of a finished key exchange.
pub struct KexOutput {
    /// Hash the method is defined over
    pub hash: HashAlgorithm,
    /// Shared secret K, already mpint-encoded
    pub shared_secret: Zeroizing<Vec<u8>>,
    /// Exchange hash H
    pub exchange_hash: Vec<u8>,
    /// Server host key blob K_S
    pub host_key_blob: Vec<u8>,
}

impl std::fmt::Debug for KexOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KexOutput")
            .field("hash", &self.hash)
            .field("shared_secret", &"<redacted>")
            .field("exchange_hash", &hex::encode(&self.exchange_hash))
            .finish()
    }
}

/// Progress of a key exchange after handling one message.
#[derive(Debug)]
pub enum KexStep {
    /// Send these messages and wait for more.
    Continue(Vec<Vec<u8>>),
    /// Send these messages; the exchange is complete.
    Done(Vec<Vec<u8>>, KexOutput),
}

/// A key exchange method.
///
/// Engines are pure state machines: they never touch the socket. The
/// transport sends what they return and feeds them messages numbered 30-49.
pub trait KexAlgorithm: Send + Sync {
    /// Method name as negotiated.
    fn name(&self) -> &'static str;

    /// Messages to send as soon as the method is chosen.
    fn start(&mut self) -> TesseraResult<Vec<Vec<u8>>>;

    /// Handles one method-specific message.
    fn handle(&mut self, payload: &[u8]) -> TesseraResult<KexStep>;
}

/// Names of every key exchange method this crate implements.
pub const SUPPORTED_KEX: &[&str] = &[
    "diffie-hellman-group-exchange-sha256",
    "diffie-hellman-group14-sha256",
    "diffie-hellman-group14-sha1",
    "diffie-hellman-group-exchange-sha1",
    "diffie-hellman-group1-sha1",
];

/// Creates the engine for a negotiated method name.
pub fn create_engine(name: &str, params: KexParams) -> TesseraResult<Box<dyn KexAlgorithm>> {
    let engine: Box<dyn KexAlgorithm> = match name {
        "diffie-hellman-group1-sha1" => Box::new(DhGroupKex::new(DhGroup::Group1Sha1, params)),
        "diffie-hellman-group14-sha1" => Box::new(DhGroupKex::new(DhGroup::Group14Sha1, params)),
        "diffie-hellman-group14-sha256" => {
            Box::new(DhGroupKex::new(DhGroup::Group14Sha256, params))
        }
        "diffie-hellman-group-exchange-sha1" => Box::new(GexKex::new(HashAlgorithm::Sha1, params)),
        "diffie-hellman-group-exchange-sha256" => {
            Box::new(GexKex::new(HashAlgorithm::Sha256, params))
        }
        other => {
            return Err(TesseraError::Protocol(format!(
                "Unsupported key exchange method: {}",
                other
            )))
        }
    };
    Ok(engine)
}

/// Derives one key (RFC 4253 Section 7.2).
///
/// ```text
/// K1 = HASH(K || H || X || session_id)
/// K2 = HASH(K || H || K1)
/// K3 = HASH(K || H || K1 || K2)
/// key = K1 || K2 || K3 || ...
/// ```
///
/// # Arguments
///
/// * `hash` - Hash of the key exchange method
/// * `shared_secret` - K, mpint-encoded
/// * `exchange_hash` - H
/// * `letter` - `b'A'` through `b'F'`
/// * `session_id` - H of the first key exchange
/// * `key_length` - Bytes required
pub fn derive_key(
    hash: HashAlgorithm,
    shared_secret: &[u8],
    exchange_hash: &[u8],
    letter: u8,
    session_id: &[u8],
    key_length: usize,
) -> Zeroizing<Vec<u8>> {
    let mut key = Zeroizing::new(hash.digest(&[shared_secret, exchange_hash, &[letter], session_id]));
    while key.len() < key_length {
        let block = hash.digest(&[shared_secret, exchange_hash, &key]);
        key.extend_from_slice(&block);
    }
    key.truncate(key_length);
    key
}

/// Derives both directions' keys and returns `(outbound, inbound)`.
pub fn derive_direction_keys(
    negotiated: &Negotiated,
    output: &KexOutput,
    session_id: &[u8],
    is_server: bool,
) -> TesseraResult<(DirectionKeys, DirectionKeys)> {
    let k = |letter: u8, len: usize| {
        derive_key(
            output.hash,
            &output.shared_secret,
            &output.exchange_hash,
            letter,
            session_id,
            len,
        )
    };

    let c2s_cipher = negotiated.cipher_client_to_server;
    let s2c_cipher = negotiated.cipher_server_to_client;
    let c2s_mac = negotiated.mac_client_to_server;
    let s2c_mac = negotiated.mac_server_to_client;

    let iv_c2s = k(b'A', c2s_cipher.iv_size());
    let iv_s2c = k(b'B', s2c_cipher.iv_size());
    let key_c2s = k(b'C', c2s_cipher.key_size());
    let key_s2c = k(b'D', s2c_cipher.key_size());
    let mac_c2s = k(b'E', c2s_mac.key_size());
    let mac_s2c = k(b'F', s2c_mac.key_size());

    let (c2s_state, s2c_state) = if is_server {
        (
            PacketCipher::decryptor(c2s_cipher, &key_c2s, &iv_c2s)?,
            PacketCipher::encryptor(s2c_cipher, &key_s2c, &iv_s2c)?,
        )
    } else {
        (
            PacketCipher::encryptor(c2s_cipher, &key_c2s, &iv_c2s)?,
            PacketCipher::decryptor(s2c_cipher, &key_s2c, &iv_s2c)?,
        )
    };

    let (c2s_codec, s2c_codec) = if is_server {
        (
            PayloadCodec::decompressor(negotiated.compression_client_to_server),
            PayloadCodec::compressor(negotiated.compression_server_to_client),
        )
    } else {
        (
            PayloadCodec::compressor(negotiated.compression_client_to_server),
            PayloadCodec::decompressor(negotiated.compression_server_to_client),
        )
    };

    let c2s = DirectionKeys::new(c2s_state, MacKey::new(c2s_mac, &mac_c2s)?, c2s_codec);
    let s2c = DirectionKeys::new(s2c_state, MacKey::new(s2c_mac, &mac_s2c)?, s2c_codec);

    Ok(if is_server { (s2c, c2s) } else { (c2s, s2c) })
}
