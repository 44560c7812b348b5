//! Error types for Tessera

use std::fmt;

/// Why an authentication attempt did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthError {
    /// Human-readable reason.
    pub reason: String,
    /// Methods the server still allows, if it told us.
    pub allowed_methods: Vec<String>,
}

impl AuthError {
    /// Creates an auth error with no method list.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            allowed_methods: Vec::new(),
        }
    }

    /// Creates an auth error carrying the methods that may continue.
    pub fn with_methods(reason: impl Into<String>, allowed_methods: Vec<String>) -> Self {
        Self {
            reason: reason.into(),
            allowed_methods,
        }
    }
}

/// Channel-scoped failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The peer refused to open the channel.
    OpenFailed {
        /// RFC 4254 reason code (1-4).
        reason_code: u32,
        /// Description sent by the peer.
        description: String,
    },
    /// The peer answered a channel request with failure.
    RequestDenied(String),
    /// The channel is closed (or EOF was sent) and cannot carry the operation.
    Closed,
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelError::OpenFailed {
                reason_code,
                description,
            } => write!(f, "open failed (code {}): {}", reason_code, description),
            ChannelError::RequestDenied(name) => write!(f, "request '{}' denied", name),
            ChannelError::Closed => write!(f, "channel closed"),
        }
    }
}

/// Unified error type for all Tessera operations
#[derive(Debug)]
pub enum TesseraError {
    /// I/O error
    Io(std::io::Error),

    /// Configuration error
    Config(String),

    /// Protocol error (malformed packet, bad banner, negotiation failure)
    Protocol(String),

    /// Security error (MAC mismatch, bad signature, weak key material)
    Security(String),

    /// Authentication did not succeed
    Auth(AuthError),

    /// Channel-scoped failure
    Channel(ChannelError),

    /// A per-operation timeout elapsed
    Timeout(String),

    /// The session is gone; carries the underlying cause when known
    SessionClosed(Option<String>),

    /// The peer kept sending traffic after a rekey was requested
    PeerIgnoringRekey,

    /// Not implemented
    NotImplemented(String),

    /// Other error
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl TesseraError {
    /// Returns true if the error must tear the whole session down.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TesseraError::Io(_)
                | TesseraError::Protocol(_)
                | TesseraError::Security(_)
                | TesseraError::SessionClosed(_)
                | TesseraError::PeerIgnoringRekey
        )
    }

    /// Shorthand for a session-closed error with a cause.
    pub fn closed(cause: impl Into<String>) -> Self {
        TesseraError::SessionClosed(Some(cause.into()))
    }
}

impl fmt::Display for TesseraError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TesseraError::Io(e) => write!(f, "IO error: {}", e),
            TesseraError::Config(msg) => write!(f, "Configuration error: {}", msg),
            TesseraError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            TesseraError::Security(msg) => write!(f, "Security error: {}", msg),
            TesseraError::Auth(e) => {
                write!(f, "Authentication failed: {}", e.reason)?;
                if !e.allowed_methods.is_empty() {
                    write!(f, " (allowed: {})", e.allowed_methods.join(","))?;
                }
                Ok(())
            }
            TesseraError::Channel(e) => write!(f, "Channel error: {}", e),
            TesseraError::Timeout(msg) => write!(f, "Timed out: {}", msg),
            TesseraError::SessionClosed(Some(cause)) => write!(f, "Session closed: {}", cause),
            TesseraError::SessionClosed(None) => write!(f, "Session closed"),
            TesseraError::PeerIgnoringRekey => write!(f, "Remote transport is ignoring rekey requests"),
            TesseraError::NotImplemented(msg) => write!(f, "Not implemented: {}", msg),
            TesseraError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for TesseraError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TesseraError::Io(e) => Some(e),
            TesseraError::Other(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TesseraError {
    fn from(err: std::io::Error) -> Self {
        TesseraError::Io(err)
    }
}

impl From<ChannelError> for TesseraError {
    fn from(err: ChannelError) -> Self {
        TesseraError::Channel(err)
    }
}

impl From<AuthError> for TesseraError {
    fn from(err: AuthError) -> Self {
        TesseraError::Auth(err)
    }
}

/// Result type for Tessera operations
pub type TesseraResult<T> = Result<T, TesseraError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TesseraError::Config("Invalid configuration".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: Invalid configuration"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: TesseraError = io_err.into();
        assert!(matches!(err, TesseraError::Io(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_auth_error_lists_methods() {
        let err: TesseraError =
            AuthError::with_methods("bad password", vec!["publickey".into(), "password".into()])
                .into();
        assert_eq!(
            err.to_string(),
            "Authentication failed: bad password (allowed: publickey,password)"
        );
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_channel_errors_are_scoped() {
        let err: TesseraError = ChannelError::OpenFailed {
            reason_code: 1,
            description: "nope".into(),
        }
        .into();
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("code 1"));
    }

    #[test]
    fn test_session_closed_display() {
        assert_eq!(TesseraError::SessionClosed(None).to_string(), "Session closed");
        assert_eq!(
            TesseraError::closed("EOF").to_string(),
            "Session closed: EOF"
        );
    }
}
