//! Transport configuration.
//!
//! A [`TransportConfig`] is handed to [`Transport::start_client`] or
//! [`Transport::start_server`] and consumed as-is; nothing here reads files
//! or the command line.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use tessera_proto::ssh::config::TransportConfig;
//!
//! let config = TransportConfig::default()
//!     .with_window_size(1 << 20)
//!     .with_keepalive_interval(Duration::from_secs(30));
//! assert_eq!(config.max_auth_attempts, 10);
//! ```
//!
//! [`Transport::start_client`]: crate::ssh::transport::Transport::start_client
//! [`Transport::start_server`]: crate::ssh::transport::Transport::start_server

use crate::ssh::client::HostKeyVerifier;
use crate::ssh::crypto::{CipherAlgorithm, CompressionAlgorithm, MacAlgorithm};
use crate::ssh::hostkey::HostKeyAlgorithm;
use crate::ssh::kex::SUPPORTED_KEX;
use crate::ssh::kex_gex::{GexBounds, ModuliPool};
use crate::ssh::packet::RekeyPolicy;
use crate::ssh::version::{BannerLimits, Version};
use std::sync::Arc;
use std::time::Duration;
use tessera_platform::{RandomSource, SystemRandomSource, TesseraError, TesseraResult};

/// Default per-channel receive window (2 MiB).
pub const DEFAULT_WINDOW_SIZE: u32 = 2 * 1024 * 1024;

/// Default per-channel maximum packet size (32 KiB).
pub const DEFAULT_MAX_PACKET_SIZE: u32 = 32 * 1024;

/// Default number of failed authentication attempts before disconnecting.
pub const DEFAULT_MAX_AUTH_ATTEMPTS: u32 = 10;

/// Algorithm names offered in KEXINIT, most preferred first.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AlgorithmPreferences {
    /// Key exchange methods
    pub kex: Vec<String>,
    /// Host key algorithms
    pub host_key: Vec<String>,
    /// Ciphers (both directions)
    pub ciphers: Vec<String>,
    /// MACs (both directions)
    pub macs: Vec<String>,
    /// Compression (both directions)
    pub compression: Vec<String>,
}

impl Default for AlgorithmPreferences {
    fn default() -> Self {
        Self {
            kex: SUPPORTED_KEX.iter().map(|s| s.to_string()).collect(),
            host_key: vec![HostKeyAlgorithm::SshEd25519.name().to_string()],
            ciphers: CipherAlgorithm::SUPPORTED
                .iter()
                .map(|c| c.name().to_string())
                .collect(),
            macs: MacAlgorithm::SUPPORTED
                .iter()
                .map(|m| m.name().to_string())
                .collect(),
            compression: CompressionAlgorithm::SUPPORTED
                .iter()
                .map(|c| c.name().to_string())
                .collect(),
        }
    }
}

impl AlgorithmPreferences {
    /// Rejects empty lists and names this crate does not implement.
    pub fn validate(&self) -> TesseraResult<()> {
        check_list("kex", &self.kex, |n| SUPPORTED_KEX.contains(&n))?;
        check_list("host key", &self.host_key, |n| {
            HostKeyAlgorithm::from_name(n).is_some()
        })?;
        check_list("cipher", &self.ciphers, |n| {
            matches!(CipherAlgorithm::from_name(n), Some(c) if c != CipherAlgorithm::None)
        })?;
        check_list("MAC", &self.macs, |n| MacAlgorithm::from_name(n).is_some())?;
        check_list("compression", &self.compression, |n| {
            CompressionAlgorithm::from_name(n).is_some()
        })
    }
}

fn check_list(category: &str, names: &[String], known: impl Fn(&str) -> bool) -> TesseraResult<()> {
    if names.is_empty() {
        return Err(TesseraError::Config(format!(
            "No {} algorithms configured",
            category
        )));
    }
    match names.iter().find(|n| !known(n)) {
        Some(unknown) => Err(TesseraError::Config(format!(
            "Unsupported {} algorithm: {}",
            category, unknown
        ))),
        None => Ok(()),
    }
}

/// Settings for one transport, client or server.
#[derive(Clone)]
pub struct TransportConfig {
    /// Our identification string
    pub local_version: Version,
    /// KEXINIT preferences
    pub algorithms: AlgorithmPreferences,
    /// Rekey thresholds
    pub rekey: RekeyPolicy,
    /// Limits while reading the peer's banner
    pub banner: BannerLimits,
    /// Initial receive window for new channels
    pub window_size: u32,
    /// Largest data packet we accept on a channel
    pub max_packet_size: u32,
    /// Timeout for channel sends and receives (`None` blocks forever)
    pub channel_timeout: Option<Duration>,
    /// Failed attempts before the server disconnects
    pub max_auth_attempts: u32,
    /// Interval for SSH_MSG_IGNORE keepalives
    pub keepalive_interval: Option<Duration>,
    /// Group sizes the client requests for group exchange
    pub gex: GexBounds,
    /// Groups the server offers for group exchange
    pub moduli: Arc<ModuliPool>,
    /// Randomness for cookies, padding and exponents
    pub rng: Arc<dyn RandomSource>,
    /// Client-side host key check, run after the signature verifies
    pub host_key_verifier: Option<HostKeyVerifier>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            local_version: Version::local_default(),
            algorithms: AlgorithmPreferences::default(),
            rekey: RekeyPolicy::default(),
            banner: BannerLimits::default(),
            window_size: DEFAULT_WINDOW_SIZE,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            channel_timeout: None,
            max_auth_attempts: DEFAULT_MAX_AUTH_ATTEMPTS,
            keepalive_interval: None,
            gex: GexBounds::default(),
            moduli: Arc::new(ModuliPool::builtin()),
            rng: SystemRandomSource::shared(),
            host_key_verifier: None,
        }
    }
}

// Manual Debug implementation because the verifier is a closure
impl std::fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportConfig")
            .field("local_version", &self.local_version)
            .field("algorithms", &self.algorithms)
            .field("rekey", &self.rekey)
            .field("banner", &self.banner)
            .field("window_size", &self.window_size)
            .field("max_packet_size", &self.max_packet_size)
            .field("channel_timeout", &self.channel_timeout)
            .field("max_auth_attempts", &self.max_auth_attempts)
            .field("keepalive_interval", &self.keepalive_interval)
            .field("gex", &self.gex)
            .field("moduli", &self.moduli.len())
            .field(
                "host_key_verifier",
                &self.host_key_verifier.as_ref().map(|_| "<callback>"),
            )
            .finish()
    }
}

impl TransportConfig {
    /// Checks the settings before a transport starts.
    pub fn validate(&self) -> TesseraResult<()> {
        self.algorithms.validate()?;
        self.gex.validate()?;
        if self.window_size == 0 || self.max_packet_size == 0 {
            return Err(TesseraError::Config(
                "Channel window and packet size must be non-zero".to_string(),
            ));
        }
        if self.max_auth_attempts == 0 {
            return Err(TesseraError::Config(
                "max_auth_attempts must be at least 1".to_string(),
            ));
        }
        if self.rekey.max_packets == 0 || self.rekey.max_bytes == 0 {
            return Err(TesseraError::Config(
                "Rekey thresholds must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Sets the local identification string.
    pub fn with_local_version(mut self, version: Version) -> Self {
        self.local_version = version;
        self
    }

    /// Sets the algorithm preferences.
    pub fn with_algorithms(mut self, algorithms: AlgorithmPreferences) -> Self {
        self.algorithms = algorithms;
        self
    }

    /// Restricts key exchange to the given methods.
    pub fn with_kex(mut self, names: &[&str]) -> Self {
        self.algorithms.kex = names.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Restricts ciphers to the given names.
    pub fn with_ciphers(mut self, names: &[&str]) -> Self {
        self.algorithms.ciphers = names.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Restricts MACs to the given names.
    pub fn with_macs(mut self, names: &[&str]) -> Self {
        self.algorithms.macs = names.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Sets the compression preference list for both directions.
    pub fn with_compression(mut self, names: &[&str]) -> Self {
        self.algorithms.compression = names.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Sets the rekey thresholds.
    pub fn with_rekey(mut self, rekey: RekeyPolicy) -> Self {
        self.rekey = rekey;
        self
    }

    /// Sets banner limits.
    pub fn with_banner_limits(mut self, banner: BannerLimits) -> Self {
        self.banner = banner;
        self
    }

    /// Sets the initial receive window for new channels.
    pub fn with_window_size(mut self, window_size: u32) -> Self {
        self.window_size = window_size;
        self
    }

    /// Sets the largest data packet accepted on a channel.
    pub fn with_max_packet_size(mut self, max_packet_size: u32) -> Self {
        self.max_packet_size = max_packet_size;
        self
    }

    /// Sets the default channel timeout.
    pub fn with_channel_timeout(mut self, timeout: Duration) -> Self {
        self.channel_timeout = Some(timeout);
        self
    }

    /// Sets the number of failed attempts tolerated.
    pub fn with_max_auth_attempts(mut self, attempts: u32) -> Self {
        self.max_auth_attempts = attempts;
        self
    }

    /// Enables keepalives.
    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = Some(interval);
        self
    }

    /// Sets group-exchange bounds.
    pub fn with_gex_bounds(mut self, gex: GexBounds) -> Self {
        self.gex = gex;
        self
    }

    /// Sets the server's group-exchange moduli.
    pub fn with_moduli(mut self, moduli: ModuliPool) -> Self {
        self.moduli = Arc::new(moduli);
        self
    }

    /// Sets the random source.
    pub fn with_rng(mut self, rng: Arc<dyn RandomSource>) -> Self {
        self.rng = rng;
        self
    }

    /// Sets the client-side host key check.
    pub fn with_host_key_verifier(mut self, verifier: HostKeyVerifier) -> Self {
        self.host_key_verifier = Some(verifier);
        self
    }
}
