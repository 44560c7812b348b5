//! SSH cryptographic operations.
//!
//! This module implements the per-direction packet protection used by the
//! binary packet protocol (RFC 4253 Section 6):
//! - AES-128/192/256-CTR (RFC 4344) and AES-128/256-CBC stream protection
//! - HMAC-SHA1, HMAC-SHA1-96, HMAC-SHA2-256, HMAC-SHA2-512 integrity
//! - zlib payload compression, immediate or delayed until after
//!   authentication (`zlib@openssh.com`)
//!
//! Each direction owns its own [`PacketCipher`] and [`MacKey`]; the two
//! directions never share state, so they can be swapped independently
//! during a rekey.
//!
//! # Security
//!
//! - MAC verification uses constant-time comparison
//! - Key material is zeroized on drop
//! - `Debug` output never prints keys
//!
//! # Example
//!
//! ```rust
//! use tessera_proto::ssh::crypto::{CipherAlgorithm, PacketCipher};
//!
//! let key = [7u8; 16];
//! let iv = [9u8; 16];
//! let mut enc = PacketCipher::encryptor(CipherAlgorithm::Aes128Ctr, &key, &iv).unwrap();
//! let mut dec = PacketCipher::decryptor(CipherAlgorithm::Aes128Ctr, &key, &iv).unwrap();
//!
//! let mut data = *b"sixteen byte blk";
//! enc.apply(&mut data).unwrap();
//! dec.apply(&mut data).unwrap();
//! assert_eq!(&data, b"sixteen byte blk");
//! ```

use aes::{Aes128, Aes192, Aes256};
use cipher::generic_array::GenericArray;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, StreamCipher};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use subtle::ConstantTimeEq;
use tessera_platform::{TesseraError, TesseraResult};
use zeroize::Zeroizing;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type Aes192Ctr = ctr::Ctr128BE<Aes192>;
type Aes256Ctr = ctr::Ctr128BE<Aes256>;
type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;
type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Block size used for padding when no cipher is active.
pub const PLAINTEXT_BLOCK_SIZE: usize = 8;

/// Cipher algorithm for SSH encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherAlgorithm {
    /// No encryption (only valid before the first NEWKEYS)
    None,
    /// AES-128-CTR
    Aes128Ctr,
    /// AES-192-CTR
    Aes192Ctr,
    /// AES-256-CTR
    Aes256Ctr,
    /// AES-128-CBC
    Aes128Cbc,
    /// AES-256-CBC
    Aes256Cbc,
}

impl CipherAlgorithm {
    /// Every algorithm this crate can negotiate, strongest first.
    pub const SUPPORTED: &'static [CipherAlgorithm] = &[
        CipherAlgorithm::Aes256Ctr,
        CipherAlgorithm::Aes192Ctr,
        CipherAlgorithm::Aes128Ctr,
        CipherAlgorithm::Aes256Cbc,
        CipherAlgorithm::Aes128Cbc,
    ];

    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            CipherAlgorithm::None => "none",
            CipherAlgorithm::Aes128Ctr => "aes128-ctr",
            CipherAlgorithm::Aes192Ctr => "aes192-ctr",
            CipherAlgorithm::Aes256Ctr => "aes256-ctr",
            CipherAlgorithm::Aes128Cbc => "aes128-cbc",
            CipherAlgorithm::Aes256Cbc => "aes256-cbc",
        }
    }

    /// Returns the key size in bytes.
    pub fn key_size(&self) -> usize {
        match self {
            CipherAlgorithm::None => 0,
            CipherAlgorithm::Aes128Ctr | CipherAlgorithm::Aes128Cbc => 16,
            CipherAlgorithm::Aes192Ctr => 24,
            CipherAlgorithm::Aes256Ctr | CipherAlgorithm::Aes256Cbc => 32,
        }
    }

    /// Returns the IV size in bytes.
    pub fn iv_size(&self) -> usize {
        match self {
            CipherAlgorithm::None => 0,
            _ => 16,
        }
    }

    /// Returns the cipher block size used for packet alignment.
    pub fn block_size(&self) -> usize {
        match self {
            CipherAlgorithm::None => PLAINTEXT_BLOCK_SIZE,
            _ => 16,
        }
    }

    /// Parses cipher algorithm from name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "none" => Some(CipherAlgorithm::None),
            "aes128-ctr" => Some(CipherAlgorithm::Aes128Ctr),
            "aes192-ctr" => Some(CipherAlgorithm::Aes192Ctr),
            "aes256-ctr" => Some(CipherAlgorithm::Aes256Ctr),
            "aes128-cbc" => Some(CipherAlgorithm::Aes128Cbc),
            "aes256-cbc" => Some(CipherAlgorithm::Aes256Cbc),
            _ => None,
        }
    }
}

enum Engine {
    Plain,
    Aes128Ctr(Box<Aes128Ctr>),
    Aes192Ctr(Box<Aes192Ctr>),
    Aes256Ctr(Box<Aes256Ctr>),
    Aes128CbcEnc(Box<Aes128CbcEnc>),
    Aes128CbcDec(Box<Aes128CbcDec>),
    Aes256CbcEnc(Box<Aes256CbcEnc>),
    Aes256CbcDec(Box<Aes256CbcDec>),
}

/// One direction's keyed cipher state.
///
/// CTR keystreams and CBC chaining carry over from packet to packet, so a
/// single instance must see every packet of its direction in order.
pub struct PacketCipher {
    algorithm: CipherAlgorithm,
    engine: Engine,
}

impl std::fmt::Debug for PacketCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketCipher")
            .field("algorithm", &self.algorithm)
            .field("key", &"<redacted>")
            .finish()
    }
}

fn invalid_length(algorithm: CipherAlgorithm) -> TesseraError {
    TesseraError::Security(format!(
        "Invalid key or IV length for {}",
        algorithm.name()
    ))
}

impl PacketCipher {
    /// The pass-through cipher used before keys are established.
    pub fn none() -> Self {
        Self {
            algorithm: CipherAlgorithm::None,
            engine: Engine::Plain,
        }
    }

    /// Creates the sending half for `algorithm`.
    ///
    /// Key and IV slices may be longer than required; the prefix is used.
    pub fn encryptor(algorithm: CipherAlgorithm, key: &[u8], iv: &[u8]) -> TesseraResult<Self> {
        Self::build(algorithm, key, iv, true)
    }

    /// Creates the receiving half for `algorithm`.
    pub fn decryptor(algorithm: CipherAlgorithm, key: &[u8], iv: &[u8]) -> TesseraResult<Self> {
        Self::build(algorithm, key, iv, false)
    }

    fn build(
        algorithm: CipherAlgorithm,
        key: &[u8],
        iv: &[u8],
        encrypt: bool,
    ) -> TesseraResult<Self> {
        if key.len() < algorithm.key_size() || iv.len() < algorithm.iv_size() {
            return Err(TesseraError::Security(format!(
                "Insufficient key material for {}: expected {}+{}, got {}+{}",
                algorithm.name(),
                algorithm.key_size(),
                algorithm.iv_size(),
                key.len(),
                iv.len()
            )));
        }
        let key = &key[..algorithm.key_size()];
        let iv = &iv[..algorithm.iv_size()];
        let err = |_| invalid_length(algorithm);

        let engine = match (algorithm, encrypt) {
            (CipherAlgorithm::None, _) => Engine::Plain,
            (CipherAlgorithm::Aes128Ctr, _) => {
                Engine::Aes128Ctr(Box::new(Aes128Ctr::new_from_slices(key, iv).map_err(err)?))
            }
            (CipherAlgorithm::Aes192Ctr, _) => {
                Engine::Aes192Ctr(Box::new(Aes192Ctr::new_from_slices(key, iv).map_err(err)?))
            }
            (CipherAlgorithm::Aes256Ctr, _) => {
                Engine::Aes256Ctr(Box::new(Aes256Ctr::new_from_slices(key, iv).map_err(err)?))
            }
            (CipherAlgorithm::Aes128Cbc, true) => Engine::Aes128CbcEnc(Box::new(
                Aes128CbcEnc::new_from_slices(key, iv).map_err(err)?,
            )),
            (CipherAlgorithm::Aes128Cbc, false) => Engine::Aes128CbcDec(Box::new(
                Aes128CbcDec::new_from_slices(key, iv).map_err(err)?,
            )),
            (CipherAlgorithm::Aes256Cbc, true) => Engine::Aes256CbcEnc(Box::new(
                Aes256CbcEnc::new_from_slices(key, iv).map_err(err)?,
            )),
            (CipherAlgorithm::Aes256Cbc, false) => Engine::Aes256CbcDec(Box::new(
                Aes256CbcDec::new_from_slices(key, iv).map_err(err)?,
            )),
        };

        Ok(Self { algorithm, engine })
    }

    /// Returns the algorithm.
    pub fn algorithm(&self) -> CipherAlgorithm {
        self.algorithm
    }

    /// Returns the block size packets must be aligned to.
    pub fn block_size(&self) -> usize {
        self.algorithm.block_size()
    }

    /// Returns true once a real cipher is installed.
    pub fn is_active(&self) -> bool {
        !matches!(self.engine, Engine::Plain)
    }

    /// Encrypts or decrypts `data` in place, continuing the stream.
    ///
    /// # Errors
    ///
    /// Returns [`TesseraError::Protocol`] if a block cipher is given data
    /// that is not a whole number of blocks.
    pub fn apply(&mut self, data: &mut [u8]) -> TesseraResult<()> {
        if data.len() % self.block_size() != 0 && self.is_active() {
            return Err(TesseraError::Protocol(format!(
                "Cipher input of {} bytes is not a multiple of block size {}",
                data.len(),
                self.block_size()
            )));
        }

        match &mut self.engine {
            Engine::Plain => {}
            Engine::Aes128Ctr(c) => c.apply_keystream(data),
            Engine::Aes192Ctr(c) => c.apply_keystream(data),
            Engine::Aes256Ctr(c) => c.apply_keystream(data),
            Engine::Aes128CbcEnc(c) => {
                for block in data.chunks_exact_mut(16) {
                    c.encrypt_block_mut(GenericArray::from_mut_slice(block));
                }
            }
            Engine::Aes128CbcDec(c) => {
                for block in data.chunks_exact_mut(16) {
                    c.decrypt_block_mut(GenericArray::from_mut_slice(block));
                }
            }
            Engine::Aes256CbcEnc(c) => {
                for block in data.chunks_exact_mut(16) {
                    c.encrypt_block_mut(GenericArray::from_mut_slice(block));
                }
            }
            Engine::Aes256CbcDec(c) => {
                for block in data.chunks_exact_mut(16) {
                    c.decrypt_block_mut(GenericArray::from_mut_slice(block));
                }
            }
        }
        Ok(())
    }
}

/// MAC algorithm for SSH.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacAlgorithm {
    /// HMAC-SHA1
    HmacSha1,
    /// HMAC-SHA1 truncated to 96 bits
    HmacSha1_96,
    /// HMAC-SHA256
    HmacSha256,
    /// HMAC-SHA512
    HmacSha512,
}

impl MacAlgorithm {
    /// Every algorithm this crate can negotiate, strongest first.
    pub const SUPPORTED: &'static [MacAlgorithm] = &[
        MacAlgorithm::HmacSha256,
        MacAlgorithm::HmacSha512,
        MacAlgorithm::HmacSha1,
        MacAlgorithm::HmacSha1_96,
    ];

    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            MacAlgorithm::HmacSha1 => "hmac-sha1",
            MacAlgorithm::HmacSha1_96 => "hmac-sha1-96",
            MacAlgorithm::HmacSha256 => "hmac-sha2-256",
            MacAlgorithm::HmacSha512 => "hmac-sha2-512",
        }
    }

    /// Returns the key size in bytes.
    pub fn key_size(&self) -> usize {
        match self {
            MacAlgorithm::HmacSha1 | MacAlgorithm::HmacSha1_96 => 20,
            MacAlgorithm::HmacSha256 => 32,
            MacAlgorithm::HmacSha512 => 64,
        }
    }

    /// Returns the size of the tag appended to each packet.
    pub fn mac_size(&self) -> usize {
        match self {
            MacAlgorithm::HmacSha1 => 20,
            MacAlgorithm::HmacSha1_96 => 12,
            MacAlgorithm::HmacSha256 => 32,
            MacAlgorithm::HmacSha512 => 64,
        }
    }

    /// Parses MAC algorithm from name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "hmac-sha1" => Some(MacAlgorithm::HmacSha1),
            "hmac-sha1-96" => Some(MacAlgorithm::HmacSha1_96),
            "hmac-sha2-256" => Some(MacAlgorithm::HmacSha256),
            "hmac-sha2-512" => Some(MacAlgorithm::HmacSha512),
            _ => None,
        }
    }
}

/// MAC key for one direction.
///
/// The tag covers `uint32 sequence || unencrypted packet`; the caller supplies
/// the sequence number because it belongs to the packetizer, not the key.
pub struct MacKey {
    algorithm: MacAlgorithm,
    key: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for MacKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MacKey")
            .field("algorithm", &self.algorithm)
            .field("key", &"<redacted>")
            .finish()
    }
}

fn hmac_tag<M: Mac + hmac::digest::KeyInit>(
    key: &[u8],
    sequence: u32,
    packet: &[u8],
) -> TesseraResult<Vec<u8>> {
    let mut mac = <M as hmac::digest::KeyInit>::new_from_slice(key)
        .map_err(|_| TesseraError::Security("Invalid HMAC key".to_string()))?;
    mac.update(&sequence.to_be_bytes());
    mac.update(packet);
    Ok(mac.finalize().into_bytes().to_vec())
}

impl MacKey {
    /// Creates a new MAC key, taking the prefix of `key_material` it needs.
    pub fn new(algorithm: MacAlgorithm, key_material: &[u8]) -> TesseraResult<Self> {
        if key_material.len() < algorithm.key_size() {
            return Err(TesseraError::Security(format!(
                "Insufficient key material for MAC: expected {}, got {}",
                algorithm.key_size(),
                key_material.len()
            )));
        }

        Ok(Self {
            algorithm,
            key: Zeroizing::new(key_material[..algorithm.key_size()].to_vec()),
        })
    }

    /// Computes the (possibly truncated) tag for a packet.
    ///
    /// # Arguments
    ///
    /// * `sequence` - Packet sequence number for this direction
    /// * `packet` - Unencrypted packet, length field included
    pub fn compute(&self, sequence: u32, packet: &[u8]) -> TesseraResult<Vec<u8>> {
        let mut tag = match self.algorithm {
            MacAlgorithm::HmacSha1 | MacAlgorithm::HmacSha1_96 => {
                hmac_tag::<Hmac<Sha1>>(&self.key, sequence, packet)?
            }
            MacAlgorithm::HmacSha256 => hmac_tag::<Hmac<Sha256>>(&self.key, sequence, packet)?,
            MacAlgorithm::HmacSha512 => hmac_tag::<Hmac<Sha512>>(&self.key, sequence, packet)?,
        };
        tag.truncate(self.algorithm.mac_size());
        Ok(tag)
    }

    /// Verifies a received tag in constant time.
    ///
    /// # Errors
    ///
    /// Returns [`TesseraError::Security`] on any mismatch.
    pub fn verify(&self, sequence: u32, packet: &[u8], received: &[u8]) -> TesseraResult<()> {
        let computed = self.compute(sequence, packet)?;

        if computed.len() != received.len() {
            return Err(TesseraError::Security("MAC length mismatch".to_string()));
        }

        if computed.ct_eq(received).into() {
            Ok(())
        } else {
            Err(TesseraError::Security("MAC verification failed".to_string()))
        }
    }

    /// Returns the algorithm.
    pub fn algorithm(&self) -> MacAlgorithm {
        self.algorithm
    }

    /// Returns the size of the tag this key produces.
    pub fn mac_size(&self) -> usize {
        self.algorithm.mac_size()
    }
}

/// Largest payload a single inbound packet may inflate to.
pub const MAX_INFLATED_LEN: usize = 256 * 1024;

/// Payload compression algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionAlgorithm {
    /// No compression
    #[default]
    None,
    /// zlib from the first packet after NEWKEYS
    Zlib,
    /// zlib, started only once user authentication succeeded
    ZlibOpenssh,
}

impl CompressionAlgorithm {
    /// Every algorithm this crate can negotiate.
    pub const SUPPORTED: &'static [CompressionAlgorithm] = &[
        CompressionAlgorithm::None,
        CompressionAlgorithm::ZlibOpenssh,
        CompressionAlgorithm::Zlib,
    ];

    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Zlib => "zlib",
            CompressionAlgorithm::ZlibOpenssh => "zlib@openssh.com",
        }
    }

    /// Parses compression algorithm from name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "none" => Some(CompressionAlgorithm::None),
            "zlib" => Some(CompressionAlgorithm::Zlib),
            "zlib@openssh.com" => Some(CompressionAlgorithm::ZlibOpenssh),
            _ => None,
        }
    }

    /// True if compression waits for user authentication.
    pub fn is_delayed(&self) -> bool {
        matches!(self, CompressionAlgorithm::ZlibOpenssh)
    }
}

enum CodecState {
    Identity,
    Deflate(Option<Box<Compress>>),
    Inflate(Option<Box<Decompress>>),
}

/// Stateful compression for one direction.
///
/// zlib keeps one stream per direction for the life of the connection;
/// every packet ends with a sync flush so the peer can decode it on its
/// own. The stream is created on first use and carried across rekeys by
/// [`PayloadCodec::inherit`].
pub struct PayloadCodec {
    algorithm: CompressionAlgorithm,
    state: CodecState,
}

impl std::fmt::Debug for PayloadCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = match &self.state {
            CodecState::Identity => "identity",
            CodecState::Deflate(_) => "deflate",
            CodecState::Inflate(_) => "inflate",
        };
        f.debug_struct("PayloadCodec")
            .field("algorithm", &self.algorithm)
            .field("mode", &mode)
            .field("started", &self.is_started())
            .finish()
    }
}

impl PayloadCodec {
    /// Passes payloads through untouched.
    pub fn none() -> Self {
        Self {
            algorithm: CompressionAlgorithm::None,
            state: CodecState::Identity,
        }
    }

    /// Compresses outbound payloads with `algorithm`.
    pub fn compressor(algorithm: CompressionAlgorithm) -> Self {
        let state = match algorithm {
            CompressionAlgorithm::None => CodecState::Identity,
            _ => CodecState::Deflate(None),
        };
        Self { algorithm, state }
    }

    /// Decompresses inbound payloads with `algorithm`.
    pub fn decompressor(algorithm: CompressionAlgorithm) -> Self {
        let state = match algorithm {
            CompressionAlgorithm::None => CodecState::Identity,
            _ => CodecState::Inflate(None),
        };
        Self { algorithm, state }
    }

    /// Returns the algorithm.
    pub fn algorithm(&self) -> CompressionAlgorithm {
        self.algorithm
    }

    /// True once a zlib stream has processed data.
    pub fn is_started(&self) -> bool {
        matches!(
            self.state,
            CodecState::Deflate(Some(_)) | CodecState::Inflate(Some(_))
        )
    }

    /// True if this codec transforms payloads once `authenticated` holds.
    pub fn is_active(&self, authenticated: bool) -> bool {
        match self.algorithm {
            CompressionAlgorithm::None => false,
            CompressionAlgorithm::Zlib => true,
            CompressionAlgorithm::ZlibOpenssh => authenticated,
        }
    }

    /// Takes over `previous`'s zlib stream when both sides of a key change
    /// use zlib, so the compression history survives a rekey.
    pub fn inherit(&mut self, previous: PayloadCodec) {
        match (&mut self.state, previous.state) {
            (CodecState::Deflate(slot @ None), CodecState::Deflate(Some(stream))) => {
                *slot = Some(stream);
            }
            (CodecState::Inflate(slot @ None), CodecState::Inflate(Some(stream))) => {
                *slot = Some(stream);
            }
            _ => {}
        }
    }

    /// Compresses or decompresses one payload.
    ///
    /// # Errors
    ///
    /// [`TesseraError::Protocol`] on a corrupt stream or a payload that
    /// inflates past [`MAX_INFLATED_LEN`].
    pub fn apply(&mut self, payload: Vec<u8>) -> TesseraResult<Vec<u8>> {
        match &mut self.state {
            CodecState::Identity => Ok(payload),
            CodecState::Deflate(stream) => {
                let stream =
                    stream.get_or_insert_with(|| Box::new(Compress::new(Compression::default(), true)));
                deflate(stream, &payload)
            }
            CodecState::Inflate(stream) => {
                let stream = stream.get_or_insert_with(|| Box::new(Decompress::new(true)));
                inflate(stream, &payload)
            }
        }
    }
}

fn deflate(stream: &mut Compress, input: &[u8]) -> TesseraResult<Vec<u8>> {
    let mut out = Vec::with_capacity(input.len() / 2 + 64);
    let start = stream.total_in();
    loop {
        let consumed = (stream.total_in() - start) as usize;
        if out.capacity() - out.len() < 64 {
            out.reserve(out.capacity().max(256));
        }
        stream
            .compress_vec(&input[consumed..], &mut out, FlushCompress::Sync)
            .map_err(|e| TesseraError::Protocol(format!("zlib compression failed: {}", e)))?;
        let consumed = (stream.total_in() - start) as usize;
        if consumed == input.len() && out.len() < out.capacity() {
            return Ok(out);
        }
    }
}

fn inflate(stream: &mut Decompress, input: &[u8]) -> TesseraResult<Vec<u8>> {
    let mut out = Vec::with_capacity((input.len() * 4).min(MAX_INFLATED_LEN) + 64);
    let start = stream.total_in();
    loop {
        let consumed = (stream.total_in() - start) as usize;
        if out.capacity() - out.len() < 256 {
            out.reserve(out.capacity().max(1024));
        }
        let (before_in, before_out) = (stream.total_in(), stream.total_out());
        let status = stream
            .decompress_vec(&input[consumed..], &mut out, FlushDecompress::Sync)
            .map_err(|e| TesseraError::Protocol(format!("zlib decompression failed: {}", e)))?;
        if out.len() > MAX_INFLATED_LEN {
            return Err(TesseraError::Protocol(format!(
                "Compressed payload inflates past {} bytes",
                MAX_INFLATED_LEN
            )));
        }
        let consumed = (stream.total_in() - start) as usize;
        let stalled = stream.total_in() == before_in && stream.total_out() == before_out;
        if consumed == input.len() && (out.len() < out.capacity() || stalled) {
            return Ok(out);
        }
        if status == Status::StreamEnd || stalled {
            return Err(TesseraError::Protocol(
                "Truncated or corrupt compressed payload".to_string(),
            ));
        }
    }
}
