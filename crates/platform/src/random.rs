//! Injectable source of cryptographic randomness.
//!
//! Every transport is handed an `Arc<dyn RandomSource>` instead of reaching
//! for a process-wide generator. Tests can swap in a deterministic source.

use crate::error::{TesseraError, TesseraResult};
use ring::rand::{SecureRandom, SystemRandom};
use std::sync::Arc;

/// A source of cryptographically secure random bytes.
pub trait RandomSource: Send + Sync {
    /// Fills `dest` with random bytes.
    fn fill(&self, dest: &mut [u8]) -> TesseraResult<()>;
}

/// Operating-system randomness via `ring`.
#[derive(Debug)]
pub struct SystemRandomSource {
    inner: SystemRandom,
}

impl Default for SystemRandomSource {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemRandomSource {
    /// Creates a new system random source.
    pub fn new() -> Self {
        Self {
            inner: SystemRandom::new(),
        }
    }

    /// Convenience constructor returning a shareable handle.
    pub fn shared() -> Arc<dyn RandomSource> {
        Arc::new(Self::new())
    }
}

impl RandomSource for SystemRandomSource {
    fn fill(&self, dest: &mut [u8]) -> TesseraResult<()> {
        self.inner
            .fill(dest)
            .map_err(|_| TesseraError::Security("System RNG failure".to_string()))
    }
}

impl std::fmt::Debug for dyn RandomSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RandomSource")
    }
}
