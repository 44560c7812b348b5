//! SSH protocol message types (RFC 4250 Section 4.1).
//!
//! # Message Categories
//!
//! - **Transport Layer Generic** (1-19): Disconnect, ignore, debug
//! - **Algorithm Negotiation** (20-29): Key exchange initialization
//! - **Key Exchange Method** (30-49): Method-specific messages
//! - **User Authentication Generic** (50-79): Authentication protocol
//! - **Connection Protocol Generic** (80-127): Channel management
//!
//! Numbers in 30-49 and 60-79 are reused by different methods, so only one
//! canonical name per number lives in [`MessageType`]; the key exchange
//! engines and the auth handler interpret them by their own state.
//!
//! # Example
//!
//! ```rust
//! use tessera_proto::ssh::message::MessageType;
//!
//! let msg_type = MessageType::KexInit;
//! assert_eq!(msg_type as u8, 20);
//! ```

use crate::ssh::wire::{put_bytes, put_string, Reader};
use bytes::{BufMut, BytesMut};
use tessera_platform::{TesseraError, TesseraResult};

/// SSH message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    // Transport layer generic (1-19)
    /// Disconnect message - terminates the connection.
    Disconnect = 1,
    /// Ignore message - can be used for padding or keep-alive.
    Ignore = 2,
    /// Unimplemented message - response to unknown message type.
    Unimplemented = 3,
    /// Debug message - debugging information.
    Debug = 4,
    /// Service request - request a service (e.g., "ssh-userauth").
    ServiceRequest = 5,
    /// Service accept - service request accepted.
    ServiceAccept = 6,

    // Algorithm negotiation (20-29)
    /// Key exchange init - algorithm negotiation.
    KexInit = 20,
    /// New keys - signals transition to new keys.
    NewKeys = 21,

    // Key exchange method specific (30-49)
    /// DH init (fixed group) / GEX request-old (group exchange).
    KexdhInit = 30,
    /// DH reply (fixed group) / GEX group (group exchange).
    KexdhReply = 31,
    /// GEX init.
    KexDhGexInit = 32,
    /// GEX reply.
    KexDhGexReply = 33,
    /// GEX request.
    KexDhGexRequest = 34,

    // User authentication generic (50-79)
    /// User authentication request.
    UserauthRequest = 50,
    /// User authentication failure.
    UserauthFailure = 51,
    /// User authentication success.
    UserauthSuccess = 52,
    /// User authentication banner.
    UserauthBanner = 53,
    /// Public key OK / keyboard-interactive info request.
    UserauthPkOk = 60,
    /// Keyboard-interactive info response.
    UserauthInfoResponse = 61,

    // Connection protocol generic (80-127)
    /// Global request.
    GlobalRequest = 80,
    /// Request success.
    RequestSuccess = 81,
    /// Request failure.
    RequestFailure = 82,
    /// Channel open.
    ChannelOpen = 90,
    /// Channel open confirmation.
    ChannelOpenConfirmation = 91,
    /// Channel open failure.
    ChannelOpenFailure = 92,
    /// Channel window adjust.
    ChannelWindowAdjust = 93,
    /// Channel data.
    ChannelData = 94,
    /// Channel extended data (stderr).
    ChannelExtendedData = 95,
    /// Channel EOF.
    ChannelEof = 96,
    /// Channel close.
    ChannelClose = 97,
    /// Channel request.
    ChannelRequest = 98,
    /// Channel success.
    ChannelSuccess = 99,
    /// Channel failure.
    ChannelFailure = 100,
}

/// Alias used when 60 is read as a keyboard-interactive prompt.
pub const MSG_USERAUTH_INFO_REQUEST: u8 = 60;

impl MessageType {
    /// Converts a byte to a message type.
    ///
    /// ```rust
    /// use tessera_proto::ssh::message::MessageType;
    ///
    /// assert_eq!(MessageType::from_u8(20), Some(MessageType::KexInit));
    /// assert_eq!(MessageType::from_u8(255), None);
    /// ```
    pub fn from_u8(byte: u8) -> Option<Self> {
        use MessageType::*;
        let msg = match byte {
            1 => Disconnect,
            2 => Ignore,
            3 => Unimplemented,
            4 => Debug,
            5 => ServiceRequest,
            6 => ServiceAccept,
            20 => KexInit,
            21 => NewKeys,
            30 => KexdhInit,
            31 => KexdhReply,
            32 => KexDhGexInit,
            33 => KexDhGexReply,
            34 => KexDhGexRequest,
            50 => UserauthRequest,
            51 => UserauthFailure,
            52 => UserauthSuccess,
            53 => UserauthBanner,
            60 => UserauthPkOk,
            61 => UserauthInfoResponse,
            80 => GlobalRequest,
            81 => RequestSuccess,
            82 => RequestFailure,
            90 => ChannelOpen,
            91 => ChannelOpenConfirmation,
            92 => ChannelOpenFailure,
            93 => ChannelWindowAdjust,
            94 => ChannelData,
            95 => ChannelExtendedData,
            96 => ChannelEof,
            97 => ChannelClose,
            98 => ChannelRequest,
            99 => ChannelSuccess,
            100 => ChannelFailure,
            _ => return None,
        };
        Some(msg)
    }

    /// Returns the message type name.
    pub fn name(&self) -> &'static str {
        match self {
            MessageType::Disconnect => "SSH_MSG_DISCONNECT",
            MessageType::Ignore => "SSH_MSG_IGNORE",
            MessageType::Unimplemented => "SSH_MSG_UNIMPLEMENTED",
            MessageType::Debug => "SSH_MSG_DEBUG",
            MessageType::ServiceRequest => "SSH_MSG_SERVICE_REQUEST",
            MessageType::ServiceAccept => "SSH_MSG_SERVICE_ACCEPT",
            MessageType::KexInit => "SSH_MSG_KEXINIT",
            MessageType::NewKeys => "SSH_MSG_NEWKEYS",
            MessageType::KexdhInit => "SSH_MSG_KEXDH_INIT",
            MessageType::KexdhReply => "SSH_MSG_KEXDH_REPLY",
            MessageType::KexDhGexInit => "SSH_MSG_KEX_DH_GEX_INIT",
            MessageType::KexDhGexReply => "SSH_MSG_KEX_DH_GEX_REPLY",
            MessageType::KexDhGexRequest => "SSH_MSG_KEX_DH_GEX_REQUEST",
            MessageType::UserauthRequest => "SSH_MSG_USERAUTH_REQUEST",
            MessageType::UserauthFailure => "SSH_MSG_USERAUTH_FAILURE",
            MessageType::UserauthSuccess => "SSH_MSG_USERAUTH_SUCCESS",
            MessageType::UserauthBanner => "SSH_MSG_USERAUTH_BANNER",
            MessageType::UserauthPkOk => "SSH_MSG_USERAUTH_PK_OK",
            MessageType::UserauthInfoResponse => "SSH_MSG_USERAUTH_INFO_RESPONSE",
            MessageType::GlobalRequest => "SSH_MSG_GLOBAL_REQUEST",
            MessageType::RequestSuccess => "SSH_MSG_REQUEST_SUCCESS",
            MessageType::RequestFailure => "SSH_MSG_REQUEST_FAILURE",
            MessageType::ChannelOpen => "SSH_MSG_CHANNEL_OPEN",
            MessageType::ChannelOpenConfirmation => "SSH_MSG_CHANNEL_OPEN_CONFIRMATION",
            MessageType::ChannelOpenFailure => "SSH_MSG_CHANNEL_OPEN_FAILURE",
            MessageType::ChannelWindowAdjust => "SSH_MSG_CHANNEL_WINDOW_ADJUST",
            MessageType::ChannelData => "SSH_MSG_CHANNEL_DATA",
            MessageType::ChannelExtendedData => "SSH_MSG_CHANNEL_EXTENDED_DATA",
            MessageType::ChannelEof => "SSH_MSG_CHANNEL_EOF",
            MessageType::ChannelClose => "SSH_MSG_CHANNEL_CLOSE",
            MessageType::ChannelRequest => "SSH_MSG_CHANNEL_REQUEST",
            MessageType::ChannelSuccess => "SSH_MSG_CHANNEL_SUCCESS",
            MessageType::ChannelFailure => "SSH_MSG_CHANNEL_FAILURE",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), *self as u8)
    }
}

/// Returns true for key-exchange-method-specific numbers (30-49).
pub fn is_kex_method_specific(byte: u8) -> bool {
    (30..=49).contains(&byte)
}

/// Returns true for user-authentication numbers (50-79).
pub fn is_userauth(byte: u8) -> bool {
    (50..=79).contains(&byte)
}

/// Returns true for messages addressed to a single channel (91-100).
pub fn is_channel_specific(byte: u8) -> bool {
    (91..=100).contains(&byte)
}

/// Disconnect reason codes (RFC 4253 Section 11.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DisconnectReason {
    /// Host not allowed to connect.
    HostNotAllowedToConnect = 1,
    /// Protocol error.
    ProtocolError = 2,
    /// Key exchange failed.
    KeyExchangeFailed = 3,
    /// Reserved.
    Reserved = 4,
    /// MAC error.
    MacError = 5,
    /// Compression error.
    CompressionError = 6,
    /// Service not available.
    ServiceNotAvailable = 7,
    /// Protocol version not supported.
    ProtocolVersionNotSupported = 8,
    /// Host key not verifiable.
    HostKeyNotVerifiable = 9,
    /// Connection lost.
    ConnectionLost = 10,
    /// Disconnected by application.
    ByApplication = 11,
    /// Too many connections.
    TooManyConnections = 12,
    /// Auth cancelled by user.
    AuthCancelledByUser = 13,
    /// No more auth methods available.
    NoMoreAuthMethodsAvailable = 14,
    /// Illegal user name.
    IllegalUserName = 15,
}

impl DisconnectReason {
    /// Converts from the wire value.
    pub fn from_u32(value: u32) -> Option<Self> {
        use DisconnectReason::*;
        let reason = match value {
            1 => HostNotAllowedToConnect,
            2 => ProtocolError,
            3 => KeyExchangeFailed,
            4 => Reserved,
            5 => MacError,
            6 => CompressionError,
            7 => ServiceNotAvailable,
            8 => ProtocolVersionNotSupported,
            9 => HostKeyNotVerifiable,
            10 => ConnectionLost,
            11 => ByApplication,
            12 => TooManyConnections,
            13 => AuthCancelledByUser,
            14 => NoMoreAuthMethodsAvailable,
            15 => IllegalUserName,
            _ => return None,
        };
        Some(reason)
    }
}

impl MessageType {
    /// Opens a reader over `data` after checking its type byte.
    pub fn reader(self, data: &[u8]) -> TesseraResult<Reader<'_>> {
        match data.first() {
            Some(&byte) if byte == self as u8 => Ok(Reader::after_type(data)),
            Some(&byte) => Err(TesseraError::Protocol(format!(
                "Expected {}, got message {}",
                self, byte
            ))),
            None => Err(TesseraError::Protocol(format!("Empty {} message", self))),
        }
    }
}

/// SSH_MSG_DISCONNECT (RFC 4253 Section 11.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnect {
    /// Reason code; see [`DisconnectReason`]
    pub reason_code: u32,
    /// Human-readable description
    pub description: String,
}

impl Disconnect {
    /// Creates a disconnect message.
    pub fn new(reason: DisconnectReason, description: impl Into<String>) -> Self {
        Self {
            reason_code: reason as u32,
            description: description.into(),
        }
    }

    /// Known reason, if the code is standard.
    pub fn reason(&self) -> Option<DisconnectReason> {
        DisconnectReason::from_u32(self.reason_code)
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::Disconnect as u8);
        buf.put_u32(self.reason_code);
        put_string(&mut buf, &self.description);
        put_string(&mut buf, "");
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> TesseraResult<Self> {
        let mut r = MessageType::Disconnect.reader(data)?;
        let reason_code = r.read_u32()?;
        let description = String::from_utf8_lossy(r.read_bytes()?).into_owned();
        Ok(Self {
            reason_code,
            description,
        })
    }
}

/// Builds SSH_MSG_SERVICE_REQUEST or SSH_MSG_SERVICE_ACCEPT.
pub fn service_message(msg: MessageType, service: &str) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u8(msg as u8);
    put_string(&mut buf, service);
    buf.to_vec()
}

/// Reads the service name from SSH_MSG_SERVICE_REQUEST/ACCEPT.
pub fn parse_service_message(msg: MessageType, data: &[u8]) -> TesseraResult<String> {
    msg.reader(data)?.read_string()
}

/// Builds SSH_MSG_IGNORE carrying `data`.
pub fn ignore_message(data: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(5 + data.len());
    buf.put_u8(MessageType::Ignore as u8);
    put_bytes(&mut buf, data);
    buf.to_vec()
}

/// Builds SSH_MSG_UNIMPLEMENTED for the packet numbered `sequence`.
pub fn unimplemented_message(sequence: u32) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(5);
    buf.put_u8(MessageType::Unimplemented as u8);
    buf.put_u32(sequence);
    buf.to_vec()
}

/// Message text of SSH_MSG_DEBUG.
pub fn parse_debug_message(data: &[u8]) -> TesseraResult<(bool, String)> {
    let mut r = MessageType::Debug.reader(data)?;
    let always_display = r.read_bool()?;
    let message = String::from_utf8_lossy(r.read_bytes()?).into_owned();
    Ok((always_display, message))
}
