//! SSH connection protocol messages (RFC 4254).
//!
//! This module implements the wire format of the connection layer:
//! - Channel open / confirmation / failure
//! - Flow control (window adjust), data and extended data
//! - EOF and close
//! - Channel requests: pty-req, env, exec, shell, subsystem,
//!   window-change, exit-status, exit-signal
//! - Global requests
//!
//! Runtime channel state lives in [`channel`](crate::ssh::channel).
//!
//! # Example
//!
//! ```rust
//! use tessera_proto::ssh::connection::{ChannelOpen, ChannelType};
//!
//! let open = ChannelOpen::new(
//!     ChannelType::Session,
//!     0,           // sender channel
//!     2097152,     // initial window size (2MB)
//!     32768,       // maximum packet size (32KB)
//! );
//! assert_eq!(open.channel_type().name(), "session");
//! ```

use crate::ssh::message::MessageType;
use crate::ssh::wire::{put_bool, put_bytes, put_string, Reader};
use bytes::{BufMut, BytesMut};
use tessera_platform::{ChannelError, TesseraResult};

/// Bytes of framing around the data in SSH_MSG_CHANNEL_DATA
/// (type, recipient, length).
pub const CHANNEL_DATA_OVERHEAD: u32 = 9;

/// Extended data type code for stderr.
pub const EXTENDED_DATA_STDERR: u32 = 1;

/// Channel type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelType {
    /// Session channel (interactive shell, exec, subsystem).
    Session,
    /// Direct TCP/IP channel (local port forwarding).
    DirectTcpip {
        /// Host to connect to
        host: String,
        /// Port to connect to
        port: u32,
        /// Originator IP address
        originator_address: String,
        /// Originator port
        originator_port: u32,
    },
    /// Forwarded TCP/IP channel (remote port forwarding).
    ForwardedTcpip {
        /// Connected address
        connected_address: String,
        /// Connected port
        connected_port: u32,
        /// Originator IP address
        originator_address: String,
        /// Originator port
        originator_port: u32,
    },
    /// X11 channel.
    X11 {
        /// Originator IP address
        originator_address: String,
        /// Originator port
        originator_port: u32,
    },
    /// A kind this crate does not know; always refused.
    Unknown(String),
}

impl ChannelType {
    /// Returns the channel type name.
    pub fn name(&self) -> &str {
        match self {
            ChannelType::Session => "session",
            ChannelType::DirectTcpip { .. } => "direct-tcpip",
            ChannelType::ForwardedTcpip { .. } => "forwarded-tcpip",
            ChannelType::X11 { .. } => "x11",
            ChannelType::Unknown(name) => name,
        }
    }
}

/// SSH_MSG_CHANNEL_OPEN message (RFC 4254 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpen {
    channel_type: ChannelType,
    sender_channel: u32,
    initial_window_size: u32,
    maximum_packet_size: u32,
}

impl ChannelOpen {
    /// Creates a new channel open message.
    ///
    /// # Arguments
    ///
    /// * `channel_type` - Type of channel to open
    /// * `sender_channel` - Sender's channel number
    /// * `initial_window_size` - Initial window size
    /// * `maximum_packet_size` - Maximum packet size
    pub fn new(
        channel_type: ChannelType,
        sender_channel: u32,
        initial_window_size: u32,
        maximum_packet_size: u32,
    ) -> Self {
        Self {
            channel_type,
            sender_channel,
            initial_window_size,
            maximum_packet_size,
        }
    }

    /// Returns the channel type.
    pub fn channel_type(&self) -> &ChannelType {
        &self.channel_type
    }

    /// Returns the sender channel number.
    pub fn sender_channel(&self) -> u32 {
        self.sender_channel
    }

    /// Returns the initial window size.
    pub fn initial_window_size(&self) -> u32 {
        self.initial_window_size
    }

    /// Returns the maximum packet size.
    pub fn maximum_packet_size(&self) -> u32 {
        self.maximum_packet_size
    }

    /// Serializes to bytes.
    ///
    /// Format (RFC 4254 Section 5.1):
    /// ```text
    /// byte      SSH_MSG_CHANNEL_OPEN (90)
    /// string    channel type
    /// uint32    sender channel
    /// uint32    initial window size
    /// uint32    maximum packet size
    /// ....      channel type specific data
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelOpen as u8);
        put_string(&mut buf, self.channel_type.name());
        buf.put_u32(self.sender_channel);
        buf.put_u32(self.initial_window_size);
        buf.put_u32(self.maximum_packet_size);

        match &self.channel_type {
            ChannelType::Session | ChannelType::Unknown(_) => {}
            ChannelType::DirectTcpip {
                host,
                port,
                originator_address,
                originator_port,
            } => {
                put_string(&mut buf, host);
                buf.put_u32(*port);
                put_string(&mut buf, originator_address);
                buf.put_u32(*originator_port);
            }
            ChannelType::ForwardedTcpip {
                connected_address,
                connected_port,
                originator_address,
                originator_port,
            } => {
                put_string(&mut buf, connected_address);
                buf.put_u32(*connected_port);
                put_string(&mut buf, originator_address);
                buf.put_u32(*originator_port);
            }
            ChannelType::X11 {
                originator_address,
                originator_port,
            } => {
                put_string(&mut buf, originator_address);
                buf.put_u32(*originator_port);
            }
        }

        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> TesseraResult<Self> {
        let mut r = MessageType::ChannelOpen.reader(data)?;
        let type_name = r.read_string()?;
        let sender_channel = r.read_u32()?;
        let initial_window_size = r.read_u32()?;
        let maximum_packet_size = r.read_u32()?;

        let channel_type = match type_name.as_str() {
            "session" => ChannelType::Session,
            "direct-tcpip" => ChannelType::DirectTcpip {
                host: r.read_string()?,
                port: r.read_u32()?,
                originator_address: r.read_string()?,
                originator_port: r.read_u32()?,
            },
            "forwarded-tcpip" => ChannelType::ForwardedTcpip {
                connected_address: r.read_string()?,
                connected_port: r.read_u32()?,
                originator_address: r.read_string()?,
                originator_port: r.read_u32()?,
            },
            "x11" => ChannelType::X11 {
                originator_address: r.read_string()?,
                originator_port: r.read_u32()?,
            },
            _ => ChannelType::Unknown(type_name),
        };

        Ok(Self {
            channel_type,
            sender_channel,
            initial_window_size,
            maximum_packet_size,
        })
    }
}

/// SSH_MSG_CHANNEL_OPEN_CONFIRMATION message (RFC 4254 Section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelOpenConfirmation {
    /// Channel number of the side that sent the open
    pub recipient_channel: u32,
    /// Channel number chosen by the confirming side
    pub sender_channel: u32,
    /// Confirming side's receive window
    pub initial_window_size: u32,
    /// Confirming side's maximum packet size
    pub maximum_packet_size: u32,
}

impl ChannelOpenConfirmation {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(17);
        buf.put_u8(MessageType::ChannelOpenConfirmation as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.sender_channel);
        buf.put_u32(self.initial_window_size);
        buf.put_u32(self.maximum_packet_size);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> TesseraResult<Self> {
        let mut r = MessageType::ChannelOpenConfirmation.reader(data)?;
        Ok(Self {
            recipient_channel: r.read_u32()?,
            sender_channel: r.read_u32()?,
            initial_window_size: r.read_u32()?,
            maximum_packet_size: r.read_u32()?,
        })
    }
}

/// Channel open failure reason codes (RFC 4254 Section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ChannelOpenFailureReason {
    /// Administratively prohibited
    AdministrativelyProhibited = 1,
    /// Connect failed
    ConnectFailed = 2,
    /// Unknown channel type
    UnknownChannelType = 3,
    /// Resource shortage
    ResourceShortage = 4,
}

impl ChannelOpenFailureReason {
    /// Converts from u32.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::AdministrativelyProhibited),
            2 => Some(Self::ConnectFailed),
            3 => Some(Self::UnknownChannelType),
            4 => Some(Self::ResourceShortage),
            _ => None,
        }
    }

    /// Returns the reason as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AdministrativelyProhibited => "Administratively prohibited",
            Self::ConnectFailed => "Connect failed",
            Self::UnknownChannelType => "Unknown channel type",
            Self::ResourceShortage => "Resource shortage",
        }
    }
}

/// SSH_MSG_CHANNEL_OPEN_FAILURE message (RFC 4254 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpenFailure {
    /// Channel number of the side that sent the open
    pub recipient_channel: u32,
    /// Raw reason code
    pub reason_code: u32,
    /// Description
    pub description: String,
}

impl ChannelOpenFailure {
    /// Creates a failure with the standard description for `reason`.
    pub fn new(recipient_channel: u32, reason: ChannelOpenFailureReason) -> Self {
        Self {
            recipient_channel,
            reason_code: reason as u32,
            description: reason.as_str().to_string(),
        }
    }

    /// Known reason, if the code is standard.
    pub fn reason(&self) -> Option<ChannelOpenFailureReason> {
        ChannelOpenFailureReason::from_u32(self.reason_code)
    }

    /// Converts into the error handed to whoever opened the channel.
    pub fn into_error(self) -> ChannelError {
        ChannelError::OpenFailed {
            reason_code: self.reason_code,
            description: self.description,
        }
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelOpenFailure as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.reason_code);
        put_string(&mut buf, &self.description);
        put_string(&mut buf, "");
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> TesseraResult<Self> {
        let mut r = MessageType::ChannelOpenFailure.reader(data)?;
        let recipient_channel = r.read_u32()?;
        let reason_code = r.read_u32()?;
        let description = String::from_utf8_lossy(r.read_bytes()?).into_owned();
        Ok(Self {
            recipient_channel,
            reason_code,
            description,
        })
    }
}

/// Builds SSH_MSG_CHANNEL_WINDOW_ADJUST.
pub fn window_adjust_message(recipient_channel: u32, bytes_to_add: u32) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(9);
    buf.put_u8(MessageType::ChannelWindowAdjust as u8);
    buf.put_u32(recipient_channel);
    buf.put_u32(bytes_to_add);
    buf.to_vec()
}

/// Builds SSH_MSG_CHANNEL_DATA.
pub fn data_message(recipient_channel: u32, data: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(CHANNEL_DATA_OVERHEAD as usize + data.len());
    buf.put_u8(MessageType::ChannelData as u8);
    buf.put_u32(recipient_channel);
    put_bytes(&mut buf, data);
    buf.to_vec()
}

/// Builds SSH_MSG_CHANNEL_EXTENDED_DATA.
pub fn extended_data_message(recipient_channel: u32, data_type: u32, data: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(13 + data.len());
    buf.put_u8(MessageType::ChannelExtendedData as u8);
    buf.put_u32(recipient_channel);
    buf.put_u32(data_type);
    put_bytes(&mut buf, data);
    buf.to_vec()
}

/// Builds a message that carries only a recipient channel:
/// EOF, CLOSE, SUCCESS or FAILURE.
pub fn channel_only_message(msg: MessageType, recipient_channel: u32) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(5);
    buf.put_u8(msg as u8);
    buf.put_u32(recipient_channel);
    buf.to_vec()
}

/// Reads the recipient channel of any channel-specific message.
pub fn recipient_channel(data: &[u8]) -> TesseraResult<u32> {
    Reader::after_type(data).read_u32()
}

/// Channel request type (RFC 4254 Section 6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRequestType {
    /// PTY request (pseudoterminal allocation)
    PtyReq {
        /// Terminal type (e.g., "xterm")
        term: String,
        /// Terminal width in characters
        width_chars: u32,
        /// Terminal height in rows
        height_rows: u32,
        /// Terminal width in pixels
        width_pixels: u32,
        /// Terminal height in pixels
        height_pixels: u32,
        /// Encoded terminal modes
        modes: Vec<u8>,
    },
    /// Environment variable
    Env {
        /// Variable name
        name: String,
        /// Variable value
        value: String,
    },
    /// Execute command
    Exec {
        /// Command to execute
        command: String,
    },
    /// Start interactive shell
    Shell,
    /// Start subsystem (e.g., "sftp")
    Subsystem {
        /// Subsystem name
        name: String,
    },
    /// Terminal size change
    WindowChange {
        /// Terminal width in characters
        width_chars: u32,
        /// Terminal height in rows
        height_rows: u32,
        /// Terminal width in pixels
        width_pixels: u32,
        /// Terminal height in pixels
        height_pixels: u32,
    },
    /// Exit status
    ExitStatus {
        /// Exit status code
        exit_status: u32,
    },
    /// Exit signal
    ExitSignal {
        /// Signal name without the "SIG" prefix
        signal_name: String,
        /// Core dumped flag
        core_dumped: bool,
        /// Error message
        error_message: String,
    },
    /// A request this crate does not interpret
    Unknown {
        /// Request name
        name: String,
        /// Undecoded type-specific data
        data: Vec<u8>,
    },
}

impl ChannelRequestType {
    /// Returns the request type name.
    pub fn name(&self) -> &str {
        match self {
            ChannelRequestType::PtyReq { .. } => "pty-req",
            ChannelRequestType::Env { .. } => "env",
            ChannelRequestType::Exec { .. } => "exec",
            ChannelRequestType::Shell => "shell",
            ChannelRequestType::Subsystem { .. } => "subsystem",
            ChannelRequestType::WindowChange { .. } => "window-change",
            ChannelRequestType::ExitStatus { .. } => "exit-status",
            ChannelRequestType::ExitSignal { .. } => "exit-signal",
            ChannelRequestType::Unknown { name, .. } => name,
        }
    }
}

/// SSH_MSG_CHANNEL_REQUEST message (RFC 4254 Section 6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    recipient_channel: u32,
    request_type: ChannelRequestType,
    want_reply: bool,
}

impl ChannelRequest {
    /// Creates a new channel request.
    pub fn new(recipient_channel: u32, request_type: ChannelRequestType, want_reply: bool) -> Self {
        Self {
            recipient_channel,
            request_type,
            want_reply,
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the request type.
    pub fn request_type(&self) -> &ChannelRequestType {
        &self.request_type
    }

    /// Returns whether a reply is wanted.
    pub fn want_reply(&self) -> bool {
        self.want_reply
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelRequest as u8);
        buf.put_u32(self.recipient_channel);
        put_string(&mut buf, self.request_type.name());
        put_bool(&mut buf, self.want_reply);

        match &self.request_type {
            ChannelRequestType::PtyReq {
                term,
                width_chars,
                height_rows,
                width_pixels,
                height_pixels,
                modes,
            } => {
                put_string(&mut buf, term);
                buf.put_u32(*width_chars);
                buf.put_u32(*height_rows);
                buf.put_u32(*width_pixels);
                buf.put_u32(*height_pixels);
                put_bytes(&mut buf, modes);
            }
            ChannelRequestType::Env { name, value } => {
                put_string(&mut buf, name);
                put_string(&mut buf, value);
            }
            ChannelRequestType::Exec { command } => put_string(&mut buf, command),
            ChannelRequestType::Shell => {}
            ChannelRequestType::Subsystem { name } => put_string(&mut buf, name),
            ChannelRequestType::WindowChange {
                width_chars,
                height_rows,
                width_pixels,
                height_pixels,
            } => {
                buf.put_u32(*width_chars);
                buf.put_u32(*height_rows);
                buf.put_u32(*width_pixels);
                buf.put_u32(*height_pixels);
            }
            ChannelRequestType::ExitStatus { exit_status } => buf.put_u32(*exit_status),
            ChannelRequestType::ExitSignal {
                signal_name,
                core_dumped,
                error_message,
            } => {
                put_string(&mut buf, signal_name);
                put_bool(&mut buf, *core_dumped);
                put_string(&mut buf, error_message);
                put_string(&mut buf, "");
            }
            ChannelRequestType::Unknown { data, .. } => buf.put_slice(data),
        }

        buf.to_vec()
    }

    /// Parses from bytes.
    ///
    /// Unrecognized request names parse as [`ChannelRequestType::Unknown`].
    pub fn from_bytes(data: &[u8]) -> TesseraResult<Self> {
        let mut r = MessageType::ChannelRequest.reader(data)?;
        let recipient_channel = r.read_u32()?;
        let request_name = r.read_string()?;
        let want_reply = r.read_bool()?;

        let request_type = match request_name.as_str() {
            "pty-req" => ChannelRequestType::PtyReq {
                term: r.read_string()?,
                width_chars: r.read_u32()?,
                height_rows: r.read_u32()?,
                width_pixels: r.read_u32()?,
                height_pixels: r.read_u32()?,
                modes: r.read_bytes()?.to_vec(),
            },
            "env" => ChannelRequestType::Env {
                name: r.read_string()?,
                value: r.read_string()?,
            },
            "exec" => ChannelRequestType::Exec {
                command: String::from_utf8_lossy(r.read_bytes()?).into_owned(),
            },
            "shell" => ChannelRequestType::Shell,
            "subsystem" => ChannelRequestType::Subsystem {
                name: r.read_string()?,
            },
            "window-change" => ChannelRequestType::WindowChange {
                width_chars: r.read_u32()?,
                height_rows: r.read_u32()?,
                width_pixels: r.read_u32()?,
                height_pixels: r.read_u32()?,
            },
            "exit-status" => ChannelRequestType::ExitStatus {
                exit_status: r.read_u32()?,
            },
            "exit-signal" => ChannelRequestType::ExitSignal {
                signal_name: r.read_string()?,
                core_dumped: r.read_bool()?,
                error_message: String::from_utf8_lossy(r.read_bytes()?).into_owned(),
            },
            _ => ChannelRequestType::Unknown {
                name: request_name,
                data: r.remaining().to_vec(),
            },
        };

        Ok(Self {
            recipient_channel,
            request_type,
            want_reply,
        })
    }
}

/// SSH_MSG_GLOBAL_REQUEST message (RFC 4254 Section 4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalRequest {
    /// Request name
    pub name: String,
    /// Whether the sender waits for a reply
    pub want_reply: bool,
    /// Request-specific data
    pub data: Vec<u8>,
}

impl GlobalRequest {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::GlobalRequest as u8);
        put_string(&mut buf, &self.name);
        put_bool(&mut buf, self.want_reply);
        buf.put_slice(&self.data);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> TesseraResult<Self> {
        let mut r = MessageType::GlobalRequest.reader(data)?;
        let name = r.read_string()?;
        let want_reply = r.read_bool()?;
        Ok(Self {
            name,
            want_reply,
            data: r.remaining().to_vec(),
        })
    }
}

/// Builds SSH_MSG_REQUEST_SUCCESS carrying `data`.
pub fn request_success_message(data: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(1 + data.len());
    buf.put_u8(MessageType::RequestSuccess as u8);
    buf.put_slice(data);
    buf.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_open_session() {
        let open = ChannelOpen::new(ChannelType::Session, 3, 2 * 1024 * 1024, 32768);
        let parsed = ChannelOpen::from_bytes(&open.to_bytes()).unwrap();
        assert_eq!(parsed, open);
        assert_eq!(parsed.sender_channel(), 3);
        assert_eq!(parsed.initial_window_size(), 2 * 1024 * 1024);
        assert_eq!(parsed.maximum_packet_size(), 32768);
    }

    #[test]
    fn test_channel_open_direct_tcpip() {
        let open = ChannelOpen::new(
            ChannelType::DirectTcpip {
                host: "example.com".to_string(),
                port: 80,
                originator_address: "127.0.0.1".to_string(),
                originator_port: 50000,
            },
            1,
            65536,
            16384,
        );
        assert_eq!(ChannelOpen::from_bytes(&open.to_bytes()).unwrap(), open);
    }

    #[test]
    fn test_channel_open_unknown_kind() {
        let open = ChannelOpen::new(ChannelType::Unknown("auth-agent".into()), 0, 1, 1);
        let parsed = ChannelOpen::from_bytes(&open.to_bytes()).unwrap();
        assert_eq!(parsed.channel_type().name(), "auth-agent");
    }

    #[test]
    fn test_open_failure() {
        let failure = ChannelOpenFailure::new(4, ChannelOpenFailureReason::ResourceShortage);
        let parsed = ChannelOpenFailure::from_bytes(&failure.to_bytes()).unwrap();
        assert_eq!(parsed.reason(), Some(ChannelOpenFailureReason::ResourceShortage));
        assert_eq!(
            parsed.into_error(),
            ChannelError::OpenFailed {
                reason_code: 4,
                description: "Resource shortage".to_string()
            }
        );
    }

    #[test]
    fn test_data_messages() {
        let msg = data_message(7, b"hello");
        assert_eq!(msg[0], 94);
        assert_eq!(recipient_channel(&msg).unwrap(), 7);
        assert_eq!(msg.len(), CHANNEL_DATA_OVERHEAD as usize + 5);

        let ext = extended_data_message(7, EXTENDED_DATA_STDERR, b"oops");
        let mut r = Reader::after_type(&ext);
        assert_eq!(r.read_u32().unwrap(), 7);
        assert_eq!(r.read_u32().unwrap(), 1);
        assert_eq!(r.read_bytes().unwrap(), b"oops");

        assert_eq!(window_adjust_message(2, 100), vec![93, 0, 0, 0, 2, 0, 0, 0, 100]);
        assert_eq!(channel_only_message(MessageType::ChannelEof, 1), vec![96, 0, 0, 0, 1]);
    }

    #[test]
    fn test_channel_request_exec() {
        let req = ChannelRequest::new(
            5,
            ChannelRequestType::Exec {
                command: "echo hi".to_string(),
            },
            true,
        );
        let parsed = ChannelRequest::from_bytes(&req.to_bytes()).unwrap();
        assert_eq!(parsed, req);
        assert!(parsed.want_reply());
    }

    #[test]
    fn test_channel_request_exit_signal() {
        let req = ChannelRequest::new(
            0,
            ChannelRequestType::ExitSignal {
                signal_name: "TERM".to_string(),
                core_dumped: false,
                error_message: "terminated".to_string(),
            },
            false,
        );
        assert_eq!(ChannelRequest::from_bytes(&req.to_bytes()).unwrap(), req);
    }

    #[test]
    fn test_channel_request_unknown() {
        let req = ChannelRequest::new(
            0,
            ChannelRequestType::Unknown {
                name: "keepalive@openssh.com".to_string(),
                data: vec![],
            },
            true,
        );
        let parsed = ChannelRequest::from_bytes(&req.to_bytes()).unwrap();
        assert_eq!(parsed.request_type().name(), "keepalive@openssh.com");
    }

    #[test]
    fn test_global_request() {
        let req = GlobalRequest {
            name: "tcpip-forward".to_string(),
            want_reply: true,
            data: vec![0, 0, 0, 0],
        };
        assert_eq!(GlobalRequest::from_bytes(&req.to_bytes()).unwrap(), req);
        assert_eq!(request_success_message(&[1]), vec![81, 1]);
    }
}
