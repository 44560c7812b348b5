//! SSH Host Key Algorithms
//!
//! Host keys authenticate the server during key exchange (RFC 4253 Section
//! 8) and double as user keys for public-key authentication (RFC 4252
//! Section 7).
//!
//! # Supported Algorithms
//!
//! - `ssh-ed25519` - EdDSA signature using Ed25519 (RFC 8709)
//!
//! # Example
//!
//! ```rust
//! use tessera_platform::SystemRandomSource;
//! use tessera_proto::ssh::hostkey::{verify_signature, Ed25519HostKey, HostKey};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let hostkey = Ed25519HostKey::generate(&SystemRandomSource::new())?;
//!
//! let blob = hostkey.public_key_bytes();
//! let signature = hostkey.sign(b"data to sign")?;
//!
//! verify_signature(&blob, b"data to sign", &signature)?;
//! # Ok(())
//! # }
//! ```

use crate::ssh::wire::{put_bytes, put_string, Reader};
use base64::Engine;
use bytes::BytesMut;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey, SECRET_KEY_LENGTH};
use sha2::{Digest, Sha256};
use tessera_platform::{RandomSource, TesseraError, TesseraResult};
use zeroize::Zeroizing;

/// Host key algorithm identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyAlgorithm {
    /// ssh-ed25519
    SshEd25519,
}

impl HostKeyAlgorithm {
    /// Get the algorithm name as sent in KEXINIT
    pub fn name(&self) -> &'static str {
        match self {
            HostKeyAlgorithm::SshEd25519 => "ssh-ed25519",
        }
    }

    /// Parse algorithm from name
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ssh-ed25519" => Some(HostKeyAlgorithm::SshEd25519),
            _ => None,
        }
    }
}

/// A private key that can prove its identity.
pub trait HostKey: Send + Sync {
    /// Get the algorithm identifier
    fn algorithm(&self) -> HostKeyAlgorithm;

    /// Get the public key in SSH wire format
    ///
    /// Format: string algorithm_name, followed by algorithm-specific data
    fn public_key_bytes(&self) -> Vec<u8>;

    /// Sign data and return the signature blob in SSH wire format
    fn sign(&self, data: &[u8]) -> TesseraResult<Vec<u8>>;

    /// Get the algorithm name
    fn algorithm_name(&self) -> &'static str {
        self.algorithm().name()
    }
}

/// Ed25519 host key (ssh-ed25519)
#[derive(Clone)]
pub struct Ed25519HostKey {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl Ed25519HostKey {
    /// Generate a new Ed25519 key pair
    pub fn generate(rng: &dyn RandomSource) -> TesseraResult<Self> {
        let mut secret = Zeroizing::new([0u8; SECRET_KEY_LENGTH]);
        rng.fill(&mut secret[..])?;
        Self::from_bytes(&secret[..])
    }

    /// Create from raw key bytes (32-byte secret key)
    pub fn from_bytes(secret_bytes: &[u8]) -> TesseraResult<Self> {
        let key_bytes: [u8; SECRET_KEY_LENGTH] = secret_bytes.try_into().map_err(|_| {
            TesseraError::Security("Ed25519 secret key must be 32 bytes".to_string())
        })?;
        let signing_key = SigningKey::from_bytes(&key_bytes);
        let verifying_key = signing_key.verifying_key();
        Ok(Self {
            signing_key,
            verifying_key,
        })
    }

    /// Get the secret key bytes (32 bytes)
    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing_key.to_bytes())
    }

    /// Get the verifying key
    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.verifying_key
    }
}

impl HostKey for Ed25519HostKey {
    fn algorithm(&self) -> HostKeyAlgorithm {
        HostKeyAlgorithm::SshEd25519
    }

    fn public_key_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        put_string(&mut buf, "ssh-ed25519");
        put_bytes(&mut buf, self.verifying_key.as_bytes());
        buf.to_vec()
    }

    fn sign(&self, data: &[u8]) -> TesseraResult<Vec<u8>> {
        let signature = self.signing_key.sign(data);

        let mut buf = BytesMut::new();
        put_string(&mut buf, "ssh-ed25519");
        put_bytes(&mut buf, &signature.to_bytes());
        Ok(buf.to_vec())
    }
}

impl std::fmt::Debug for Ed25519HostKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ed25519HostKey")
            .field("algorithm", &"ssh-ed25519")
            .field("public_key", &hex::encode(self.verifying_key.as_bytes()))
            .finish_non_exhaustive()
    }
}

/// Returns the algorithm name a public key blob declares.
pub fn key_blob_algorithm(key_blob: &[u8]) -> TesseraResult<String> {
    Reader::new(key_blob).read_string()
}

/// Verifies a signature blob against a public key blob.
///
/// # Errors
///
/// Returns [`TesseraError::Security`] for unsupported algorithms, malformed
/// blobs, or a signature that does not verify.
pub fn verify_signature(key_blob: &[u8], data: &[u8], signature_blob: &[u8]) -> TesseraResult<()> {
    let mut key = Reader::new(key_blob);
    let key_alg = key.read_string()?;
    let mut sig = Reader::new(signature_blob);
    let sig_alg = sig.read_string()?;

    if key_alg != sig_alg {
        return Err(TesseraError::Security(format!(
            "Signature algorithm {} does not match key type {}",
            sig_alg, key_alg
        )));
    }

    match HostKeyAlgorithm::from_name(&key_alg) {
        Some(HostKeyAlgorithm::SshEd25519) => {
            let public: [u8; 32] = key.read_bytes()?.try_into().map_err(|_| {
                TesseraError::Security("Ed25519 public key must be 32 bytes".to_string())
            })?;
            let signature: [u8; 64] = sig.read_bytes()?.try_into().map_err(|_| {
                TesseraError::Security("Ed25519 signature must be 64 bytes".to_string())
            })?;

            let verifying_key = VerifyingKey::from_bytes(&public).map_err(|e| {
                TesseraError::Security(format!("Invalid Ed25519 public key: {}", e))
            })?;
            verifying_key
                .verify(data, &Signature::from_bytes(&signature))
                .map_err(|_| TesseraError::Security("Signature verification failed".to_string()))
        }
        None => Err(TesseraError::Security(format!(
            "Unsupported host key algorithm: {}",
            key_alg
        ))),
    }
}

/// Renders an OpenSSH-style fingerprint, e.g. `SHA256:nThbg6kXUpJW...`.
pub fn fingerprint(key_blob: &[u8]) -> String {
    let digest = Sha256::digest(key_blob);
    format!(
        "SHA256:{}",
        base64::engine::general_purpose::STANDARD_NO_PAD.encode(digest)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_platform::SystemRandomSource;

    fn key() -> Ed25519HostKey {
        Ed25519HostKey::generate(&SystemRandomSource::new()).unwrap()
    }

    #[test]
    fn test_ed25519_generate() {
        let key = key();
        assert_eq!(key.algorithm(), HostKeyAlgorithm::SshEd25519);
        assert_eq!(key.algorithm_name(), "ssh-ed25519");
    }

    #[test]
    fn test_ed25519_from_bytes_round_trip() {
        let key1 = key();
        let secret = key1.secret_bytes();
        let key2 = Ed25519HostKey::from_bytes(&*secret).unwrap();
        assert_eq!(
            key1.verifying_key().as_bytes(),
            key2.verifying_key().as_bytes()
        );
        assert!(Ed25519HostKey::from_bytes(&[0u8; 31]).is_err());
    }

    #[test]
    fn test_ed25519_public_key_blob() {
        let blob = key().public_key_bytes();
        assert_eq!(blob.len(), 4 + 11 + 4 + 32);
        assert_eq!(key_blob_algorithm(&blob).unwrap(), "ssh-ed25519");
    }

    #[test]
    fn test_sign_and_verify() {
        let key = key();
        let blob = key.public_key_bytes();
        let sig = key.sign(b"exchange hash").unwrap();

        assert!(verify_signature(&blob, b"exchange hash", &sig).is_ok());
        assert!(matches!(
            verify_signature(&blob, b"other data", &sig),
            Err(TesseraError::Security(_))
        ));
    }

    #[test]
    fn test_verify_with_wrong_key() {
        let signer = key();
        let other = key();
        let sig = signer.sign(b"data").unwrap();
        assert!(verify_signature(&other.public_key_bytes(), b"data", &sig).is_err());
    }

    #[test]
    fn test_unsupported_algorithm() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, "ssh-dss");
        put_bytes(&mut buf, &[1, 2, 3]);
        let blob = buf.to_vec();
        assert!(verify_signature(&blob, b"x", &blob).is_err());
    }

    #[test]
    fn test_fingerprint_format() {
        let fp = fingerprint(&key().public_key_bytes());
        assert!(fp.starts_with("SHA256:"));
        // 32-byte digest, unpadded base64
        assert_eq!(fp.len(), 7 + 43);
    }

    #[test]
    fn test_ed25519_debug() {
        let debug_str = format!("{:?}", key());
        assert!(debug_str.contains("Ed25519HostKey"));
        assert!(debug_str.contains("ssh-ed25519"));
    }
}
