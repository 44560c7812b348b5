//! SSH protocol version exchange (RFC 4253 Section 4.2).
//!
//! The SSH protocol begins with a version exchange where both client and server
//! send an identification string:
//!
//! ```text
//! SSH-protoversion-softwareversion SP comments CR LF
//! ```
//!
//! Example: `SSH-2.0-Tessera_0.1.0 transport`
//!
//! Servers may send other lines before their identification string; these
//! are skipped by [`read_banner`] within a bounded number of lines.
//!
//! # Security
//!
//! - Maximum line length: 255 characters (DoS prevention)
//! - Must start with "SSH-2.0-" or "SSH-1.99-"
//! - No null bytes allowed in version string
//!
//! # Example
//!
//! ```rust
//! use tessera_proto::ssh::version::Version;
//!
//! // Create version string
//! let version = Version::new("Tessera_0.1.0", Some("transport"));
//! assert_eq!(version.to_string(), "SSH-2.0-Tessera_0.1.0 transport");
//!
//! // Parse version string
//! let parsed = Version::parse("SSH-2.0-OpenSSH_8.9").unwrap();
//! assert_eq!(parsed.software(), "OpenSSH_8.9");
//! ```

use std::time::Duration;
use tessera_platform::{TesseraError, TesseraResult};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

/// Maximum length of SSH version string (RFC 4253 Section 4.2).
pub const MAX_VERSION_LENGTH: usize = 255;

/// Longest pre-banner line tolerated before giving up.
const MAX_PREAMBLE_LINE: usize = 1024;

/// SSH protocol version string.
///
/// Represents the SSH identification string exchanged at connection start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    /// Protocol version (e.g., "2.0")
    proto_version: String,
    /// Software version (e.g., "Tessera_0.1.0")
    software_version: String,
    /// Optional comments
    comments: Option<String>,
}

impl Version {
    /// Creates a new SSH version string.
    ///
    /// # Arguments
    ///
    /// * `software` - Software version string (e.g., "Tessera_0.1.0")
    /// * `comments` - Optional comments
    ///
    /// # Returns
    ///
    /// A new `Version` with protocol version "2.0".
    ///
    /// # Example
    ///
    /// ```rust
    /// use tessera_proto::ssh::version::Version;
    ///
    /// let version = Version::new("Tessera_0.1.0", None);
    /// assert_eq!(version.to_string(), "SSH-2.0-Tessera_0.1.0");
    /// ```
    pub fn new(software: &str, comments: Option<&str>) -> Self {
        Self {
            proto_version: "2.0".to_string(),
            software_version: software.to_string(),
            comments: comments.map(String::from),
        }
    }

    /// Returns the identification string this crate sends by default.
    ///
    /// # Example
    ///
    /// ```rust
    /// use tessera_proto::ssh::version::Version;
    ///
    /// let version = Version::local_default();
    /// assert!(version.to_string().starts_with("SSH-2.0-Tessera_"));
    /// ```
    pub fn local_default() -> Self {
        Self::new(&format!("Tessera_{}", env!("CARGO_PKG_VERSION")), None)
    }

    /// Parses an identification line, with or without its trailing CR LF.
    ///
    /// Only protocol versions `2.0` and `1.99` are accepted; `1.99` is the
    /// compatibility form an SSH-2 peer may announce.
    ///
    /// ```rust
    /// use tessera_proto::ssh::version::Version;
    ///
    /// let version = Version::parse("SSH-2.0-OpenSSH_8.9\r\n").unwrap();
    /// assert_eq!(version.software(), "OpenSSH_8.9");
    /// ```
    pub fn parse(line: &str) -> TesseraResult<Self> {
        let line = line.strip_suffix('\n').unwrap_or(line);
        let line = line.strip_suffix('\r').unwrap_or(line);
        let bad = |why: &str| TesseraError::Protocol(format!("Bad identification {:?}: {}", line, why));

        if line.len() > MAX_VERSION_LENGTH {
            return Err(bad("longer than 255 bytes"));
        }
        if line.contains('\0') {
            return Err(bad("contains NUL"));
        }
        let body = line.strip_prefix("SSH-").ok_or_else(|| bad("missing SSH- prefix"))?;
        let (proto, rest) = body.split_once('-').ok_or_else(|| bad("missing software version"))?;
        if !matches!(proto, "2.0" | "1.99") {
            return Err(bad("unsupported protocol version"));
        }
        let (software, comments) = match rest.split_once(' ') {
            Some((software, comments)) => (software, Some(comments.trim().to_string())),
            None => (rest, None),
        };
        if software.is_empty() {
            return Err(bad("empty software version"));
        }

        Ok(Self {
            proto_version: proto.to_string(),
            software_version: software.to_string(),
            comments,
        })
    }

    /// Returns the protocol version (e.g., "2.0").
    pub fn proto_version(&self) -> &str {
        &self.proto_version
    }

    /// Returns the software version (e.g., "Tessera_0.1.0").
    pub fn software(&self) -> &str {
        &self.software_version
    }

    /// Returns the comments, if any.
    pub fn comments(&self) -> Option<&str> {
        self.comments.as_deref()
    }

    /// Converts to wire format (with CR LF).
    ///
    /// # Example
    ///
    /// ```rust
    /// use tessera_proto::ssh::version::Version;
    ///
    /// let version = Version::new("Tessera_0.1.0", None);
    /// assert_eq!(version.to_wire_format(), b"SSH-2.0-Tessera_0.1.0\r\n");
    /// ```
    pub fn to_wire_format(&self) -> Vec<u8> {
        format!("{}\r\n", self).into_bytes()
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SSH-{}-{}", self.proto_version, self.software_version)?;
        if let Some(comments) = &self.comments {
            write!(f, " {}", comments)?;
        }
        Ok(())
    }
}

/// Limits applied while waiting for the peer's identification string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BannerLimits {
    /// Timeout for the first line.
    pub first_line: Duration,
    /// Timeout for each later line.
    pub later_lines: Duration,
    /// Maximum number of lines read before the banner must appear.
    pub max_lines: usize,
}

impl Default for BannerLimits {
    fn default() -> Self {
        Self {
            first_line: Duration::from_secs(15),
            later_lines: Duration::from_secs(2),
            max_lines: 100,
        }
    }
}

/// Reads the peer's identification string, skipping non-`SSH-` lines.
///
/// Bytes are consumed one at a time so nothing past the banner's LF is taken
/// from `reader`; the binary packet protocol starts right after it.
///
/// # Returns
///
/// The parsed [`Version`] and the raw line without CR LF, which is what the
/// exchange hash covers.
///
/// # Errors
///
/// - [`TesseraError::Timeout`] if a line does not arrive in time
/// - [`TesseraError::SessionClosed`] on EOF
/// - [`TesseraError::Protocol`] if the banner is invalid or never appears
pub async fn read_banner<R>(reader: &mut R, limits: BannerLimits) -> TesseraResult<(Version, String)>
where
    R: AsyncRead + Unpin,
{
    for index in 0..limits.max_lines {
        let wait = if index == 0 {
            limits.first_line
        } else {
            limits.later_lines
        };

        let line = tokio::time::timeout(wait, read_line(reader))
            .await
            .map_err(|_| TesseraError::Timeout("waiting for SSH banner".to_string()))??;

        if line.starts_with("SSH-") {
            let version = Version::parse(&line)?;
            debug!(peer = %line, "Received SSH banner");
            return Ok((version, line));
        }
        debug!(line = %line, "Skipping pre-banner line");
    }

    Err(TesseraError::Protocol(format!(
        "No SSH banner within {} lines",
        limits.max_lines
    )))
}

async fn read_line<R>(reader: &mut R) -> TesseraResult<String>
where
    R: AsyncRead + Unpin,
{
    let mut line = Vec::with_capacity(64);
    loop {
        let mut byte = [0u8; 1];
        let n = reader.read(&mut byte).await?;
        if n == 0 {
            return Err(TesseraError::closed("EOF during banner exchange"));
        }
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
        if line.len() > MAX_PREAMBLE_LINE {
            return Err(TesseraError::Protocol(format!(
                "Banner line exceeds {} bytes",
                MAX_PREAMBLE_LINE
            )));
        }
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    async fn banner_from(data: &[u8]) -> TesseraResult<(Version, String)> {
        let mut reader = data;
        read_banner(&mut reader, BannerLimits::default()).await
    }

    #[test]
    fn test_local_banner_format() {
        let version = Version::new("Tessera_0.1.0", Some("transport"));
        assert_eq!(version.to_wire_format(), b"SSH-2.0-Tessera_0.1.0 transport\r\n");
        assert!(Version::local_default().software().starts_with("Tessera_"));
    }

    #[test]
    fn test_parse_splits_comments() {
        let version = Version::parse("SSH-2.0-OpenSSH_8.9 Ubuntu-3ubuntu0.1\r\n").unwrap();
        assert_eq!(version.proto_version(), "2.0");
        assert_eq!(version.software(), "OpenSSH_8.9");
        assert_eq!(version.comments(), Some("Ubuntu-3ubuntu0.1"));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for line in [
            "SSH-2.0-",
            "SSH-2.0",
            "SSH-1.0-OldClient",
            "SSH-2.0-Test\0Bad",
            "ssh-2.0-lower",
        ] {
            assert!(
                matches!(Version::parse(line), Err(TesseraError::Protocol(_))),
                "accepted {:?}",
                line
            );
        }
    }

    #[tokio::test]
    async fn test_read_banner_skips_preamble() {
        let data = b"hello there\r\nwelcome\r\nSSH-2.0-Peer_1.0 extra\r\n\x00\x00";
        let mut reader = &data[..];
        let (version, raw) = read_banner(&mut reader, BannerLimits::default())
            .await
            .unwrap();
        assert_eq!(version.software(), "Peer_1.0");
        assert_eq!(raw, "SSH-2.0-Peer_1.0 extra");
        // Packet bytes after the banner are left untouched.
        assert_eq!(reader, &[0u8, 0u8][..]);
    }

    #[tokio::test]
    async fn test_read_banner_accepts_compat_and_bare_lf() {
        let (version, raw) = banner_from(b"SSH-1.99-Compat\n").await.unwrap();
        assert_eq!(version.proto_version(), "1.99");
        assert_eq!(raw, "SSH-1.99-Compat");
    }

    #[tokio::test]
    async fn test_read_banner_assembles_split_writes() {
        let (mut near, mut far) = tokio::io::duplex(64);
        let writer = tokio::spawn(async move {
            for piece in [&b"SSH-2.0-"[..], b"Slow", b"Peer\r", b"\n\x05"] {
                far.write_all(piece).await.unwrap();
                tokio::task::yield_now().await;
            }
            far
        });
        let (version, _) = read_banner(&mut near, BannerLimits::default()).await.unwrap();
        assert_eq!(version.software(), "SlowPeer");
        let _far = writer.await.unwrap();
        let mut next = [0u8; 1];
        near.read_exact(&mut next).await.unwrap();
        assert_eq!(next, [5]);
    }

    #[tokio::test]
    async fn test_read_banner_line_limit() {
        let limits = BannerLimits {
            max_lines: 3,
            ..BannerLimits::default()
        };
        let mut reader = &b"a\nb\nc\nSSH-2.0-Late\r\n"[..];
        let result = read_banner(&mut reader, limits).await;
        assert!(matches!(result, Err(TesseraError::Protocol(_))));

        let mut reader = &b"a\nb\nSSH-2.0-InTime\r\n"[..];
        let (version, _) = read_banner(&mut reader, limits).await.unwrap();
        assert_eq!(version.software(), "InTime");
    }

    #[tokio::test]
    async fn test_read_banner_rejects_oversized_lines() {
        let junk = vec![b'x'; MAX_PREAMBLE_LINE + 10];
        let result = banner_from(&junk).await;
        assert!(matches!(result, Err(TesseraError::Protocol(_))));

        let long = format!("SSH-2.0-{}\r\n", "A".repeat(300));
        let result = banner_from(long.as_bytes()).await;
        assert!(matches!(result, Err(TesseraError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_read_banner_rejects_old_protocol() {
        let result = banner_from(b"SSH-1.5-Ancient\r\n").await;
        assert!(matches!(result, Err(TesseraError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_read_banner_eof() {
        let result = banner_from(b"SSH-2.0-Trunc").await;
        assert!(matches!(result, Err(TesseraError::SessionClosed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_banner_first_line_timeout() {
        let (mut near, _far) = tokio::io::duplex(64);
        let result = read_banner(&mut near, BannerLimits::default()).await;
        assert!(matches!(result, Err(TesseraError::Timeout(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_banner_later_line_timeout() {
        let (mut near, mut far) = tokio::io::duplex(64);
        far.write_all(b"please wait\r\n").await.unwrap();
        let limits = BannerLimits {
            first_line: Duration::from_secs(60),
            later_lines: Duration::from_millis(50),
            max_lines: 10,
        };
        let started = tokio::time::Instant::now();
        let result = read_banner(&mut near, limits).await;
        assert!(matches!(result, Err(TesseraError::Timeout(_))));
        assert!(started.elapsed() < Duration::from_secs(60));
    }
}
