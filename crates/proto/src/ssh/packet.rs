//! SSH binary packet protocol (RFC 4253 Section 6).
//!
//! # Packet Format
//!
//! ```text
//! uint32    packet_length
//! byte      padding_length
//! byte[n1]  payload (n1 = packet_length - padding_length - 1)
//! byte[n2]  random padding (n2 = padding_length)
//! byte[m]   mac (MAC = Message Authentication Code)
//! ```
//!
//! # Constraints
//!
//! - `packet_length` does not include `mac` or the length field itself
//! - `padding_length` is at least 4 and at most 255
//! - `4 + packet_length` is a multiple of the cipher block size (8 when
//!   no cipher is active)
//! - Everything up to the MAC is encrypted; the MAC covers
//!   `uint32 sequence || unencrypted packet`
//!
//! # Concurrency
//!
//! The [`Packetizer`] splits the stream into halves with independent locks.
//! Senders serialize on the write lock, so bytes of two packets never
//! interleave and sequence numbers follow wire order. A single task (the
//! transport's receive loop) reads.
//!
//! # Clear to send
//!
//! Between sending KEXINIT and sending NEWKEYS only transport messages may
//! go out. [`Packetizer::pause_and_send`] closes the gate under the write
//! lock and [`Packetizer::send_then_switch`] reopens it, so
//! [`Packetizer::send_when_clear`] can never slip a message in between.
//!
//! # Rekeying
//!
//! Packet and byte counters per direction are checked against a
//! [`RekeyPolicy`]. The first crossing sets a "need rekey" flag and wakes
//! [`Packetizer::rekey_requested`]; the flag clears only once both
//! directions have installed new keys. The grace allowance starts once our
//! KEXINIT is on the wire, so packets the peer sent before it could see
//! that KEXINIT are not held against it. Channel data does not count
//! either: it is bounded by the windows, which are not refilled while the
//! exchange runs. Anything else beyond the allowance fails the read with
//! [`TesseraError::PeerIgnoringRekey`].
//!
//! # Compression
//!
//! Each direction's [`PayloadCodec`] runs before encryption on the way out
//! and after MAC verification on the way in. `zlib@openssh.com` stays idle
//! until a USERAUTH_SUCCESS has passed through the packetizer.

use crate::ssh::crypto::{MacKey, PacketCipher, PayloadCodec};
use crate::ssh::message::MessageType;
use crate::ssh::version::{read_banner, BannerLimits, Version};
use bytes::{BufMut, BytesMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tessera_platform::{RandomSource, TesseraError, TesseraResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, trace, warn};

/// Largest `packet_length` accepted from the wire.
pub const MAX_PACKET_LENGTH: usize = 256 * 1024;

/// Minimum padding length in bytes (RFC 4253 Section 6).
pub const MIN_PADDING_LEN: usize = 4;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Thresholds that trigger a key re-exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RekeyPolicy {
    /// Packets per direction before a rekey is requested.
    pub max_packets: u64,
    /// Bytes per direction before a rekey is requested.
    pub max_bytes: u64,
    /// Packets accepted from the peer after requesting a rekey before
    /// giving up on it.
    pub grace_packets: u32,
}

impl Default for RekeyPolicy {
    fn default() -> Self {
        Self {
            max_packets: 1 << 30,
            max_bytes: 1 << 30,
            grace_packets: 20,
        }
    }
}

/// Cipher, MAC and compression for one direction.
#[derive(Debug)]
pub struct DirectionKeys {
    /// Stream cipher state
    pub cipher: PacketCipher,
    /// Integrity key, if a MAC is in use
    pub mac: Option<MacKey>,
    /// Compression applied to payloads
    pub compression: PayloadCodec,
}

impl DirectionKeys {
    /// Groups already-keyed primitives for one direction.
    pub fn new(cipher: PacketCipher, mac: MacKey, compression: PayloadCodec) -> Self {
        Self {
            cipher,
            mac: Some(mac),
            compression,
        }
    }

    /// No encryption, no MAC, no compression.
    pub fn plain() -> Self {
        Self {
            cipher: PacketCipher::none(),
            mac: None,
            compression: PayloadCodec::none(),
        }
    }
}

/// A decrypted, verified message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    /// Inbound sequence number this packet consumed
    pub sequence: u32,
    /// Full payload, message-type byte included
    pub payload: Vec<u8>,
}

impl ReceivedMessage {
    /// The message-type byte.
    pub fn msg_type(&self) -> u8 {
        self.payload[0]
    }

    /// Payload after the message-type byte.
    pub fn body(&self) -> &[u8] {
        &self.payload[1..]
    }
}

struct Outbound {
    writer: BoxedWriter,
    keys: DirectionKeys,
    sequence: u32,
    packets: u64,
    bytes: u64,
    paused: bool,
}

struct Inbound {
    reader: BoxedReader,
    keys: DirectionKeys,
    sequence: u32,
    packets: u64,
    bytes: u64,
}

#[derive(Debug, Default)]
struct RekeyState {
    need_rekey: bool,
    outbound_switched: bool,
    inbound_switched: bool,
    kexinit_sent: bool,
    peer_responded: bool,
    packets_since_request: u32,
    requests: u64,
}

/// Returns the padding length for a payload under `block_size`.
///
/// The result is the smallest value that is at least
/// [`MIN_PADDING_LEN`] and makes `4 + 1 + payload_len + padding` a multiple
/// of `block_size`.
pub fn compute_padding_len(payload_len: usize, block_size: usize) -> usize {
    let block_size = block_size.max(8);
    let mut padding = block_size - (5 + payload_len) % block_size;
    if padding < MIN_PADDING_LEN {
        padding += block_size;
    }
    padding
}

/// Frames, protects and counts packets over one byte stream.
pub struct Packetizer {
    outbound: Mutex<Outbound>,
    inbound: Mutex<Inbound>,
    rekey: parking_lot::Mutex<RekeyState>,
    rekey_signal: Notify,
    resumed: Notify,
    policy: RekeyPolicy,
    rng: Arc<dyn RandomSource>,
    closed: AtomicBool,
    authenticated: AtomicBool,
}

impl std::fmt::Debug for Packetizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packetizer")
            .field("policy", &self.policy)
            .field("need_rekey", &self.need_rekey())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Packetizer {
    /// Creates a packetizer over separate read and write halves.
    pub fn new<R, W>(reader: R, writer: W, policy: RekeyPolicy, rng: Arc<dyn RandomSource>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            outbound: Mutex::new(Outbound {
                writer: Box::new(writer),
                keys: DirectionKeys::plain(),
                sequence: 0,
                packets: 0,
                bytes: 0,
                paused: false,
            }),
            inbound: Mutex::new(Inbound {
                reader: Box::new(reader),
                keys: DirectionKeys::plain(),
                sequence: 0,
                packets: 0,
                bytes: 0,
            }),
            rekey: parking_lot::Mutex::new(RekeyState::default()),
            rekey_signal: Notify::new(),
            resumed: Notify::new(),
            policy,
            rng,
            closed: AtomicBool::new(false),
            authenticated: AtomicBool::new(false),
        }
    }

    /// Creates a packetizer over a bidirectional stream.
    ///
    /// # Example
    ///
    /// ```rust
    /// use tessera_platform::SystemRandomSource;
    /// use tessera_proto::ssh::packet::{Packetizer, RekeyPolicy};
    ///
    /// # #[tokio::main] async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let (a, b) = tokio::io::duplex(4096);
    /// let left = Packetizer::from_stream(a, RekeyPolicy::default(), SystemRandomSource::shared());
    /// let right = Packetizer::from_stream(b, RekeyPolicy::default(), SystemRandomSource::shared());
    ///
    /// left.send_message(&[2, 0, 0, 0, 0]).await?;
    /// let msg = right.read_message().await?;
    /// assert_eq!(msg.msg_type(), 2);
    /// # Ok(()) }
    /// ```
    pub fn from_stream<S>(stream: S, policy: RekeyPolicy, rng: Arc<dyn RandomSource>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(reader, writer, policy, rng)
    }

    /// Returns the rekey policy in force.
    pub fn policy(&self) -> RekeyPolicy {
        self.policy
    }

    /// Writes the local identification line followed by CR LF.
    pub async fn write_banner(&self, version: &Version) -> TesseraResult<()> {
        let mut out = self.outbound.lock().await;
        out.writer.write_all(&version.to_wire_format()).await?;
        out.writer.flush().await?;
        Ok(())
    }

    /// Reads the peer's identification line.
    pub async fn read_banner(&self, limits: BannerLimits) -> TesseraResult<(Version, String)> {
        let mut inb = self.inbound.lock().await;
        read_banner(&mut inb.reader, limits).await
    }

    /// Frames and sends one message.
    ///
    /// # Returns
    ///
    /// The outbound sequence number the packet consumed.
    ///
    /// # Errors
    ///
    /// Any I/O failure, or [`TesseraError::SessionClosed`] after
    /// [`close`](Self::close).
    pub async fn send_message(&self, payload: &[u8]) -> TesseraResult<u32> {
        let mut out = self.outbound.lock().await;
        self.write_packet(&mut out, payload).await
    }

    /// Sends an application message, waiting while a key exchange holds
    /// the gate closed.
    pub async fn send_when_clear(&self, payload: &[u8]) -> TesseraResult<u32> {
        loop {
            let resumed = self.resumed.notified();
            {
                let mut out = self.outbound.lock().await;
                if self.is_closed() {
                    return Err(TesseraError::closed("packetizer closed"));
                }
                if !out.paused {
                    return self.write_packet(&mut out, payload).await;
                }
            }
            trace!("Waiting for key exchange to finish");
            resumed.await;
        }
    }

    /// Closes the gate for application messages and sends `payload`
    /// (a KEXINIT).
    ///
    /// Does nothing but return `None` if the gate is already closed.
    pub async fn pause_and_send(&self, payload: &[u8]) -> TesseraResult<Option<u32>> {
        let mut out = self.outbound.lock().await;
        if out.paused {
            return Ok(None);
        }
        out.paused = true;
        let sequence = self.write_packet(&mut out, payload).await?;
        {
            let mut state = self.rekey.lock();
            state.kexinit_sent = true;
            state.packets_since_request = 0;
        }
        Ok(Some(sequence))
    }

    /// Returns true while application messages are held back.
    pub async fn is_paused(&self) -> bool {
        self.outbound.lock().await.paused
    }

    /// Sends `payload` under the current keys, then installs `keys` and
    /// reopens the gate.
    ///
    /// Used for NEWKEYS, which must be the last packet under the old keys.
    pub async fn send_then_switch(
        &self,
        payload: &[u8],
        keys: DirectionKeys,
    ) -> TesseraResult<u32> {
        let mut out = self.outbound.lock().await;
        let sequence = self.write_packet(&mut out, payload).await?;
        self.install_outbound(&mut out, keys);
        out.paused = false;
        drop(out);
        self.resumed.notify_waiters();
        Ok(sequence)
    }

    async fn write_packet(&self, out: &mut Outbound, payload: &[u8]) -> TesseraResult<u32> {
        if self.is_closed() {
            return Err(TesseraError::closed("packetizer closed"));
        }
        if payload.is_empty() {
            return Err(TesseraError::Protocol("Refusing to send empty payload".to_string()));
        }

        let kind = payload[0];
        let payload = if out.keys.compression.is_active(self.is_authenticated()) {
            out.keys.compression.apply(payload.to_vec())?
        } else {
            payload.to_vec()
        };
        if kind == MessageType::UserauthSuccess as u8 {
            self.mark_authenticated();
        }
        let block_size = out.keys.cipher.block_size();
        let padding_len = compute_padding_len(payload.len(), block_size);
        let packet_length = 1 + payload.len() + padding_len;
        if packet_length > MAX_PACKET_LENGTH {
            return Err(TesseraError::Protocol(format!(
                "Packet too large: {} bytes (max {})",
                packet_length, MAX_PACKET_LENGTH
            )));
        }

        let mut padding = vec![0u8; padding_len];
        if out.keys.cipher.is_active() {
            self.rng.fill(&mut padding)?;
        }

        let mut packet = BytesMut::with_capacity(4 + packet_length + 64);
        packet.put_u32(packet_length as u32);
        packet.put_u8(padding_len as u8);
        packet.put_slice(&payload);
        packet.put_slice(&padding);

        let sequence = out.sequence;
        let tag = match &out.keys.mac {
            Some(mac) => Some(mac.compute(sequence, &packet)?),
            None => None,
        };
        out.keys.cipher.apply(&mut packet)?;
        if let Some(tag) = tag {
            packet.put_slice(&tag);
        }

        out.writer.write_all(&packet).await?;
        out.writer.flush().await?;

        out.sequence = sequence.wrapping_add(1);
        out.packets += 1;
        out.bytes += packet.len() as u64;
        trace!(
            seq = sequence,
            msg = kind,
            len = packet.len(),
            "Sent packet"
        );

        if out.packets >= self.policy.max_packets || out.bytes >= self.policy.max_bytes {
            self.trigger_rekey("sent");
        }
        Ok(sequence)
    }

    /// Reads, decrypts and verifies one message.
    ///
    /// # Errors
    ///
    /// - [`TesseraError::SessionClosed`] on end of stream
    /// - [`TesseraError::Security`] on MAC mismatch
    /// - [`TesseraError::Protocol`] on malformed length or padding
    /// - [`TesseraError::PeerIgnoringRekey`] once the grace allowance runs out
    pub async fn read_message(&self) -> TesseraResult<ReceivedMessage> {
        let mut inb = self.inbound.lock().await;
        let inb = &mut *inb;

        let block_size = inb.keys.cipher.block_size();
        let mut first = vec![0u8; block_size];
        read_exact(&mut inb.reader, &mut first).await?;
        inb.keys.cipher.apply(&mut first)?;

        let packet_length = u32::from_be_bytes([first[0], first[1], first[2], first[3]]) as usize;
        if packet_length > MAX_PACKET_LENGTH {
            return Err(TesseraError::Protocol(format!(
                "Invalid packet length: {} (max {})",
                packet_length, MAX_PACKET_LENGTH
            )));
        }
        let total = 4 + packet_length;
        if total < block_size || total % block_size != 0 {
            return Err(TesseraError::Protocol(format!(
                "Invalid packet length {} for block size {}",
                packet_length, block_size
            )));
        }

        let mut packet = first;
        packet.resize(total, 0);
        read_exact(&mut inb.reader, &mut packet[block_size..]).await?;
        inb.keys.cipher.apply(&mut packet[block_size..])?;

        let sequence = inb.sequence;
        if let Some(mac) = &inb.keys.mac {
            let mut tag = vec![0u8; mac.mac_size()];
            read_exact(&mut inb.reader, &mut tag).await?;
            mac.verify(sequence, &packet, &tag)?;
        }

        let padding_len = packet[4] as usize;
        if padding_len < MIN_PADDING_LEN || padding_len + 1 >= packet_length {
            return Err(TesseraError::Protocol(format!(
                "Invalid padding length {} for packet length {}",
                padding_len, packet_length
            )));
        }
        let payload = packet[5..total - padding_len].to_vec();
        let payload = if inb.keys.compression.is_active(self.is_authenticated()) {
            inb.keys.compression.apply(payload)?
        } else {
            payload
        };
        if payload.is_empty() {
            return Err(TesseraError::Protocol("Empty payload".to_string()));
        }
        if payload[0] == MessageType::UserauthSuccess as u8 {
            self.mark_authenticated();
        }

        inb.sequence = sequence.wrapping_add(1);
        inb.packets += 1;
        inb.bytes += (total + inb.keys.mac.as_ref().map_or(0, MacKey::mac_size)) as u64;
        trace!(seq = sequence, msg = payload[0], len = total, "Received packet");

        self.account_inbound(inb.packets, inb.bytes, payload[0])?;

        Ok(ReceivedMessage { sequence, payload })
    }

    fn account_inbound(&self, packets: u64, bytes: u64, msg_type: u8) -> TesseraResult<()> {
        let mut state = self.rekey.lock();
        if state.need_rekey {
            if msg_type == MessageType::KexInit as u8 {
                state.peer_responded = true;
            }
            // Only packets read after our KEXINIT went out count, and channel
            // data is already bounded by the windows we stop refilling.
            if state.kexinit_sent && !state.peer_responded && counts_toward_grace(msg_type) {
                state.packets_since_request += 1;
                if state.packets_since_request >= self.policy.grace_packets {
                    warn!(
                        packets = state.packets_since_request,
                        "Peer is ignoring rekey request"
                    );
                    return Err(TesseraError::PeerIgnoringRekey);
                }
            }
        } else if packets >= self.policy.max_packets || bytes >= self.policy.max_bytes {
            drop(state);
            self.trigger_rekey("received");
        }
        Ok(())
    }

    fn trigger_rekey(&self, direction: &str) {
        let mut state = self.rekey.lock();
        if state.need_rekey {
            return;
        }
        state.need_rekey = true;
        state.outbound_switched = false;
        state.inbound_switched = false;
        state.packets_since_request = 0;
        state.requests += 1;
        drop(state);

        debug!(direction, "Rekey threshold reached");
        self.rekey_signal.notify_one();
    }

    /// Returns true while a threshold-triggered rekey is outstanding.
    pub fn need_rekey(&self) -> bool {
        self.rekey.lock().need_rekey
    }

    /// Number of times the rekey flag has been raised.
    pub fn rekey_requests(&self) -> u64 {
        self.rekey.lock().requests
    }

    /// Records that the peer has started the key exchange we asked for.
    pub fn note_peer_kexinit(&self) {
        self.rekey.lock().peer_responded = true;
    }

    /// Resolves when a rekey threshold is crossed.
    pub async fn rekey_requested(&self) {
        self.rekey_signal.notified().await;
    }

    /// Installs new outbound keys and resets the outbound counters.
    pub async fn set_outbound(&self, keys: DirectionKeys) {
        let mut out = self.outbound.lock().await;
        self.install_outbound(&mut out, keys);
    }

    fn install_outbound(&self, out: &mut Outbound, mut keys: DirectionKeys) {
        debug!(
            cipher = keys.cipher.algorithm().name(),
            compression = keys.compression.algorithm().name(),
            "Switching outbound keys"
        );
        let previous = std::mem::replace(&mut out.keys, DirectionKeys::plain());
        keys.compression.inherit(previous.compression);
        out.keys = keys;
        out.packets = 0;
        out.bytes = 0;
        self.mark_switched(true);
    }

    /// Installs new inbound keys and resets the inbound counters.
    pub async fn set_inbound(&self, mut keys: DirectionKeys) {
        let mut inb = self.inbound.lock().await;
        debug!(
            cipher = keys.cipher.algorithm().name(),
            compression = keys.compression.algorithm().name(),
            "Switching inbound keys"
        );
        let previous = std::mem::replace(&mut inb.keys, DirectionKeys::plain());
        keys.compression.inherit(previous.compression);
        inb.keys = keys;
        inb.packets = 0;
        inb.bytes = 0;
        drop(inb);
        self.mark_switched(false);
    }

    fn mark_switched(&self, outbound: bool) {
        let mut state = self.rekey.lock();
        if outbound {
            state.outbound_switched = true;
        } else {
            state.inbound_switched = true;
        }
        if state.outbound_switched && state.inbound_switched {
            state.outbound_switched = false;
            state.inbound_switched = false;
            if state.need_rekey {
                debug!("Both directions rekeyed");
            }
            state.need_rekey = false;
            state.kexinit_sent = false;
            state.peer_responded = false;
            state.packets_since_request = 0;
        }
    }

    /// True once a USERAUTH_SUCCESS passed through in either direction.
    ///
    /// Delayed compression (`zlib@openssh.com`) starts with the next packet.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    fn mark_authenticated(&self) {
        if !self.authenticated.swap(true, Ordering::AcqRel) {
            trace!("Delayed compression may start");
        }
    }

    /// Returns the next outbound sequence number.
    pub async fn outbound_sequence(&self) -> u32 {
        self.outbound.lock().await.sequence
    }

    /// Returns true after [`close`](Self::close).
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Shuts the write half down; later sends fail.
    ///
    /// A pending [`read_message`](Self::read_message) is not interrupted
    /// here; the owner cancels it.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.resumed.notify_waiters();
        let mut out = self.outbound.lock().await;
        if let Err(e) = out.writer.shutdown().await {
            debug!(error = %e, "Error shutting down writer");
        }
    }
}

fn counts_toward_grace(msg_type: u8) -> bool {
    msg_type != MessageType::ChannelData as u8 && msg_type != MessageType::ChannelExtendedData as u8
}

async fn read_exact(reader: &mut BoxedReader, buf: &mut [u8]) -> TesseraResult<()> {
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(TesseraError::closed("EOF"))
        }
        Err(e) => Err(TesseraError::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::crypto::{CipherAlgorithm, CompressionAlgorithm, MacAlgorithm};
    use proptest::prelude::*;
    use tessera_platform::SystemRandomSource;

    fn pair(policy: RekeyPolicy) -> (Packetizer, Packetizer) {
        let (a, b) = tokio::io::duplex(1 << 20);
        (
            Packetizer::from_stream(a, policy, SystemRandomSource::shared()),
            Packetizer::from_stream(b, policy, SystemRandomSource::shared()),
        )
    }

    fn keys(encrypt: bool) -> DirectionKeys {
        keys_with(encrypt, CompressionAlgorithm::None)
    }

    fn keys_with(encrypt: bool, compression: CompressionAlgorithm) -> DirectionKeys {
        let key = [0x24u8; 32];
        let iv = [0x42u8; 16];
        let cipher = if encrypt {
            PacketCipher::encryptor(CipherAlgorithm::Aes128Ctr, &key, &iv).unwrap()
        } else {
            PacketCipher::decryptor(CipherAlgorithm::Aes128Ctr, &key, &iv).unwrap()
        };
        let codec = if encrypt {
            PayloadCodec::compressor(compression)
        } else {
            PayloadCodec::decompressor(compression)
        };
        DirectionKeys::new(
            cipher,
            MacKey::new(MacAlgorithm::HmacSha256, &key).unwrap(),
            codec,
        )
    }

    #[test]
    fn test_padding_examples() {
        assert_eq!(compute_padding_len(0, 8), 11);
        assert_eq!(compute_padding_len(3, 8), 8);
        assert_eq!(compute_padding_len(7, 16), 4);
        assert_eq!(compute_padding_len(8, 16), 19);
    }

    proptest! {
        #[test]
        fn prop_padding_aligns(len in 0usize..70_000, block in prop::sample::select(vec![8usize, 16, 32])) {
            let padding = compute_padding_len(len, block);
            prop_assert!(padding >= MIN_PADDING_LEN);
            prop_assert!(padding <= 255);
            prop_assert_eq!((4 + 1 + len + padding) % block, 0);
        }
    }

    #[tokio::test]
    async fn test_plain_round_trip() {
        let (a, b) = pair(RekeyPolicy::default());
        let seq = a.send_message(&[MessageType::Ignore as u8, 1, 2, 3]).await.unwrap();
        assert_eq!(seq, 0);
        let msg = b.read_message().await.unwrap();
        assert_eq!(msg.msg_type(), MessageType::Ignore as u8);
        assert_eq!(msg.body(), &[1, 2, 3]);
        assert_eq!(msg.sequence, 0);
    }

    #[tokio::test]
    async fn test_encrypted_round_trip() {
        let (a, b) = pair(RekeyPolicy::default());
        a.set_outbound(keys(true)).await;
        b.set_inbound(keys(false)).await;

        for len in [1usize, 15, 16, 17, 1000, 40_000] {
            let mut payload = vec![MessageType::ChannelData as u8];
            payload.extend((0..len).map(|i| (i % 251) as u8));
            a.send_message(&payload).await.unwrap();
            let msg = b.read_message().await.unwrap();
            assert_eq!(msg.payload, payload);
        }
    }

    #[tokio::test]
    async fn test_send_then_switch() {
        let (a, b) = pair(RekeyPolicy::default());
        a.send_then_switch(&[MessageType::NewKeys as u8], keys(true))
            .await
            .unwrap();
        a.send_message(&[MessageType::Ignore as u8]).await.unwrap();

        let first = b.read_message().await.unwrap();
        assert_eq!(first.msg_type(), MessageType::NewKeys as u8);
        b.set_inbound(keys(false)).await;
        let second = b.read_message().await.unwrap();
        assert_eq!(second.msg_type(), MessageType::Ignore as u8);
        assert_eq!(second.sequence, 1);
    }

    #[tokio::test]
    async fn test_tampered_packet_rejected() {
        let (raw_out, mut tap) = tokio::io::duplex(1 << 16);
        let (mut inject, raw_in) = tokio::io::duplex(1 << 16);
        let sender = Packetizer::new(tokio::io::empty(), raw_out, RekeyPolicy::default(), SystemRandomSource::shared());
        let receiver = Packetizer::new(raw_in, tokio::io::sink(), RekeyPolicy::default(), SystemRandomSource::shared());
        sender.set_outbound(keys(true)).await;
        receiver.set_inbound(keys(false)).await;

        sender.send_message(&[MessageType::Ignore as u8, 9, 9, 9]).await.unwrap();
        // 16-byte packet + 32-byte tag
        let mut wire = vec![0u8; 48];
        tap.read_exact(&mut wire).await.unwrap();
        wire[10] ^= 0x01;
        inject.write_all(&wire).await.unwrap();

        let err = receiver.read_message().await.unwrap_err();
        assert!(matches!(err, TesseraError::Security(_)));
    }

    #[tokio::test]
    async fn test_eof_is_session_closed() {
        let (a, b) = pair(RekeyPolicy::default());
        a.close().await;
        let err = b.read_message().await.unwrap_err();
        assert!(matches!(err, TesseraError::SessionClosed(_)));
        assert!(a.send_message(&[2]).await.is_err());
    }

    #[tokio::test]
    async fn test_rekey_flag_set_once_and_cleared_by_both_directions() {
        let policy = RekeyPolicy {
            max_packets: 5,
            ..RekeyPolicy::default()
        };
        let (a, b) = pair(policy);

        for _ in 0..4 {
            a.send_message(&[MessageType::Ignore as u8]).await.unwrap();
        }
        assert!(!a.need_rekey());
        for _ in 0..6 {
            a.send_message(&[MessageType::Ignore as u8]).await.unwrap();
        }
        assert!(a.need_rekey());
        assert_eq!(a.rekey_requests(), 1);

        a.set_outbound(DirectionKeys::plain()).await;
        assert!(a.need_rekey());
        a.set_inbound(DirectionKeys::plain()).await;
        assert!(!a.need_rekey());
        assert_eq!(a.rekey_requests(), 1);

        drop(b);
    }

    #[tokio::test]
    async fn test_peer_ignoring_rekey() {
        let policy = RekeyPolicy {
            max_packets: 2,
            max_bytes: u64::MAX,
            grace_packets: 3,
        };
        let (a, b) = pair(policy);
        for _ in 0..10 {
            a.send_message(&[MessageType::Ignore as u8]).await.unwrap();
        }

        // Packets 1-2 reach the threshold. Nothing counts until b's KEXINIT
        // is out, so the rest of the backlog reads cleanly.
        for _ in 0..10 {
            b.read_message().await.unwrap();
        }
        assert!(b.need_rekey());
        b.pause_and_send(&[MessageType::KexInit as u8]).await.unwrap();

        for _ in 0..10 {
            a.send_message(&[MessageType::Ignore as u8]).await.unwrap();
        }
        b.read_message().await.unwrap();
        b.read_message().await.unwrap();
        let err = b.read_message().await.unwrap_err();
        assert!(matches!(err, TesseraError::PeerIgnoringRekey));
    }

    #[tokio::test]
    async fn test_channel_data_in_flight_does_not_use_grace() {
        let policy = RekeyPolicy {
            max_packets: 4,
            max_bytes: u64::MAX,
            grace_packets: 3,
        };
        let (a, b) = pair(policy);
        for _ in 0..4 {
            a.send_message(&[MessageType::Ignore as u8]).await.unwrap();
        }
        for _ in 0..4 {
            b.read_message().await.unwrap();
        }
        b.pause_and_send(&[MessageType::KexInit as u8]).await.unwrap();

        // A bulk sender that has not yet seen our KEXINIT.
        let mut data = vec![MessageType::ChannelData as u8, 0, 0, 0, 0, 0, 0, 0, 4];
        data.extend_from_slice(b"bulk");
        for _ in 0..50 {
            a.send_message(&data).await.unwrap();
        }
        a.send_message(&[MessageType::ChannelWindowAdjust as u8]).await.unwrap();
        a.send_message(&[MessageType::KexInit as u8]).await.unwrap();
        for _ in 0..52 {
            b.read_message().await.unwrap();
        }
        assert!(b.need_rekey());

        a.send_then_switch(&[MessageType::NewKeys as u8], DirectionKeys::plain())
            .await
            .unwrap();
        b.read_message().await.unwrap();
        b.set_inbound(DirectionKeys::plain()).await;
        b.set_outbound(DirectionKeys::plain()).await;
        assert!(!b.need_rekey());
    }

    #[tokio::test]
    async fn test_zlib_after_authentication() {
        let (a, b) = pair(RekeyPolicy::default());
        a.set_outbound(keys_with(true, CompressionAlgorithm::ZlibOpenssh)).await;
        b.set_inbound(keys_with(false, CompressionAlgorithm::ZlibOpenssh)).await;
        assert!(!a.is_authenticated());

        let mut text = vec![MessageType::ChannelData as u8];
        text.extend(b"compress me ".repeat(200));
        a.send_message(&text).await.unwrap();
        assert_eq!(b.read_message().await.unwrap().payload, text);

        a.send_message(&[MessageType::UserauthSuccess as u8]).await.unwrap();
        assert!(a.is_authenticated());
        assert_eq!(b.read_message().await.unwrap().msg_type(), 52);
        assert!(b.is_authenticated());

        for _ in 0..3 {
            a.send_message(&text).await.unwrap();
            assert_eq!(b.read_message().await.unwrap().payload, text);
        }

        // A rekey keeps the zlib streams running.
        a.set_outbound(keys_with(true, CompressionAlgorithm::ZlibOpenssh)).await;
        b.set_inbound(keys_with(false, CompressionAlgorithm::ZlibOpenssh)).await;
        a.send_message(&text).await.unwrap();
        assert_eq!(b.read_message().await.unwrap().payload, text);
    }

    #[tokio::test]
    async fn test_zlib_shrinks_wire_bytes() {
        let (raw_out, mut tap) = tokio::io::duplex(1 << 16);
        let sender = Packetizer::new(
            tokio::io::empty(),
            raw_out,
            RekeyPolicy::default(),
            SystemRandomSource::shared(),
        );
        sender.set_outbound(keys_with(true, CompressionAlgorithm::Zlib)).await;

        let mut text = vec![MessageType::ChannelData as u8];
        text.extend(vec![b'z'; 4000]);
        sender.send_message(&text).await.unwrap();
        drop(sender);

        let mut wire = Vec::new();
        tap.read_to_end(&mut wire).await.unwrap();
        assert!(wire.len() < 200, "{} bytes on the wire", wire.len());
    }

    #[tokio::test]
    async fn test_kexinit_satisfies_grace() {
        let policy = RekeyPolicy {
            max_packets: 1,
            max_bytes: u64::MAX,
            grace_packets: 2,
        };
        let (a, b) = pair(policy);
        a.send_message(&[MessageType::Ignore as u8]).await.unwrap();
        a.send_message(&[MessageType::KexInit as u8]).await.unwrap();
        for _ in 0..5 {
            a.send_message(&[MessageType::Ignore as u8]).await.unwrap();
        }
        for _ in 0..7 {
            b.read_message().await.unwrap();
        }
        assert!(b.need_rekey());
    }

    #[tokio::test]
    async fn test_gate_holds_application_messages() {
        let (a, b) = pair(RekeyPolicy::default());
        let a = Arc::new(a);

        assert_eq!(a.pause_and_send(&[MessageType::KexInit as u8]).await.unwrap(), Some(0));
        assert_eq!(a.pause_and_send(&[MessageType::KexInit as u8]).await.unwrap(), None);
        assert!(a.is_paused().await);

        let sender = {
            let a = Arc::clone(&a);
            tokio::spawn(async move { a.send_when_clear(&[MessageType::Ignore as u8, 7]).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!sender.is_finished());

        a.send_message(&[MessageType::KexdhInit as u8]).await.unwrap();
        a.send_then_switch(&[MessageType::NewKeys as u8], DirectionKeys::plain())
            .await
            .unwrap();
        assert_eq!(sender.await.unwrap().unwrap(), 3);

        let order: Vec<u8> = {
            let mut v = Vec::new();
            for _ in 0..4 {
                v.push(b.read_message().await.unwrap().msg_type());
            }
            v
        };
        assert_eq!(order, vec![20, 30, 21, 2]);
    }

    #[tokio::test]
    async fn test_close_releases_gate_waiters() {
        let (a, _b) = pair(RekeyPolicy::default());
        let a = Arc::new(a);
        a.pause_and_send(&[MessageType::KexInit as u8]).await.unwrap();

        let sender = {
            let a = Arc::clone(&a);
            tokio::spawn(async move { a.send_when_clear(&[MessageType::Ignore as u8]).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        a.close().await;
        let result = sender.await.unwrap();
        assert!(matches!(result, Err(TesseraError::SessionClosed(_))));
    }
}
