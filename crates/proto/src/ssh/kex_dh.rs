//! Fixed-group Diffie-Hellman key exchange (RFC 4253 Section 8, RFC 8268).
//!
//! This module implements:
//! - diffie-hellman-group1-sha1 (Oakley Group 2, 1024-bit)
//! - diffie-hellman-group14-sha1 (RFC 3526 Group 14, 2048-bit)
//! - diffie-hellman-group14-sha256
//!
//! # Message Flow
//!
//! ```text
//! client                                server
//!   KEXDH_INIT   (mpint e)        -->
//!                                 <--   KEXDH_REPLY (string K_S, mpint f, string sig(H))
//! ```
//!
//! # Security
//!
//! - Peer public values must satisfy `1 < v < p - 1`
//! - Private exponents are drawn from the injected random source and
//!   degenerate candidates are rejected
//! - The client verifies the host key signature over H before the result
//!   is used

use crate::ssh::hostkey::verify_signature;
use crate::ssh::kex::{HashAlgorithm, KexAlgorithm, KexOutput, KexParams, KexStep};
use crate::ssh::message::MessageType;
use crate::ssh::wire::{encode_mpint, put_bytes, put_mpint, Reader};
use bytes::{BufMut, BytesMut};
use num_bigint::BigUint;
use num_traits::One;
use once_cell::sync::Lazy;
use tessera_platform::{RandomSource, TesseraError, TesseraResult};
use tracing::debug;
use zeroize::Zeroizing;

/// Oakley Group 2 prime (RFC 2409, 1024-bit).
pub static GROUP1_PRIME: Lazy<BigUint> = Lazy::new(|| {
    parse_prime(
        "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
         29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
         EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
         E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
         EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE65381\
         FFFFFFFFFFFFFFFF",
    )
});

/// RFC 3526 Group 14 prime (2048-bit).
pub static GROUP14_PRIME: Lazy<BigUint> = Lazy::new(|| {
    parse_prime(
        "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
         29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
         EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
         E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
         EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D\
         C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F\
         83655D23DCA3AD961C62F356208552BB9ED529077096966D\
         670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
         E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9\
         DE2BCBF6955817183995497CEA956AE515D2261898FA0510\
         15728E5A8AACAA68FFFFFFFFFFFFFFFF",
    )
});

fn parse_prime(hex_digits: &str) -> BigUint {
    BigUint::from_bytes_be(&hex::decode(hex_digits).expect("Invalid hex"))
}

/// Fixed groups and the hash each method uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhGroup {
    /// diffie-hellman-group1-sha1
    Group1Sha1,
    /// diffie-hellman-group14-sha1
    Group14Sha1,
    /// diffie-hellman-group14-sha256
    Group14Sha256,
}

impl DhGroup {
    /// Method name.
    pub fn name(&self) -> &'static str {
        match self {
            DhGroup::Group1Sha1 => "diffie-hellman-group1-sha1",
            DhGroup::Group14Sha1 => "diffie-hellman-group14-sha1",
            DhGroup::Group14Sha256 => "diffie-hellman-group14-sha256",
        }
    }

    /// Group prime.
    pub fn prime(&self) -> &'static BigUint {
        match self {
            DhGroup::Group1Sha1 => &GROUP1_PRIME,
            DhGroup::Group14Sha1 | DhGroup::Group14Sha256 => &GROUP14_PRIME,
        }
    }

    /// Exchange hash function.
    pub fn hash(&self) -> HashAlgorithm {
        match self {
            DhGroup::Group1Sha1 | DhGroup::Group14Sha1 => HashAlgorithm::Sha1,
            DhGroup::Group14Sha256 => HashAlgorithm::Sha256,
        }
    }
}

/// Draws a private exponent for the group with prime `p`.
///
/// The exponent has roughly the bit length of `p` with the top bit cleared,
/// and lies in `[2, (p - 1) / 2)`. All-zero and all-one candidates are
/// redrawn.
pub fn generate_exponent(p: &BigUint, rng: &dyn RandomSource) -> TesseraResult<BigUint> {
    let q = (p - 1u32) >> 1;
    let len = ((p.bits() + 7) / 8) as usize;
    let mut bytes = Zeroizing::new(vec![0u8; len]);

    loop {
        rng.fill(&mut bytes)?;
        bytes[0] &= 0x7f;
        let degenerate = bytes.iter().all(|&b| b == 0)
            || (bytes[0] == 0x7f && bytes[1..].iter().all(|&b| b == 0xff));
        if degenerate {
            continue;
        }
        let x = BigUint::from_bytes_be(&bytes);
        if x > BigUint::one() && x < q {
            return Ok(x);
        }
    }
}

/// Checks that a peer's public value lies in `(1, p - 1)`.
pub fn validate_public(value: &BigUint, p: &BigUint) -> TesseraResult<()> {
    if value <= &BigUint::one() || value >= &(p - 1u32) {
        return Err(TesseraError::Security(
            "Diffie-Hellman public value out of range".to_string(),
        ));
    }
    Ok(())
}

/// Builds the exchange hash for a DH method.
///
/// `group_fields` holds the method-specific part between K_S and e
/// (empty for fixed groups).
pub(crate) fn exchange_hash(
    params: &KexParams,
    hash: HashAlgorithm,
    host_key_blob: &[u8],
    group_fields: &[u8],
    e: &BigUint,
    f: &BigUint,
    k_mpint: &[u8],
) -> Vec<u8> {
    let mut buf = BytesMut::new();
    params.hash_prefix(&mut buf, host_key_blob);
    buf.put_slice(group_fields);
    put_mpint(&mut buf, e);
    put_mpint(&mut buf, f);
    buf.put_slice(k_mpint);
    hash.digest(&[&buf])
}

/// Client side: verifies a DH reply and finishes the exchange.
pub(crate) fn client_finish(
    params: &KexParams,
    hash: HashAlgorithm,
    p: &BigUint,
    x: &BigUint,
    e: &BigUint,
    group_fields: &[u8],
    reply: &[u8],
) -> TesseraResult<KexOutput> {
    let mut r = Reader::after_type(reply);
    let host_key_blob = r.read_bytes()?.to_vec();
    let f = r.read_mpint()?;
    let signature = r.read_bytes()?;
    validate_public(&f, p)?;

    let k = Zeroizing::new(encode_mpint(&f.modpow(x, p).to_bytes_be()));
    let h = exchange_hash(params, hash, &host_key_blob, group_fields, e, &f, &k);
    verify_signature(&host_key_blob, &h, signature)?;

    Ok(KexOutput {
        hash,
        shared_secret: k,
        exchange_hash: h,
        host_key_blob,
    })
}

/// Server side: answers the client's public value.
///
/// Returns the reply payload (with `reply_type` as its first byte) and the
/// finished output.
pub(crate) fn server_reply(
    params: &KexParams,
    hash: HashAlgorithm,
    p: &BigUint,
    g: &BigUint,
    group_fields: &[u8],
    init: &[u8],
    reply_type: u8,
) -> TesseraResult<(Vec<u8>, KexOutput)> {
    let e = Reader::after_type(init).read_mpint()?;
    validate_public(&e, p)?;

    let host_key = params.require_host_key()?;
    let host_key_blob = host_key.public_key_bytes();

    let y = generate_exponent(p, params.rng.as_ref())?;
    let f = g.modpow(&y, p);
    let k = Zeroizing::new(encode_mpint(&e.modpow(&y, p).to_bytes_be()));
    let h = exchange_hash(params, hash, &host_key_blob, group_fields, &e, &f, &k);
    let signature = host_key.sign(&h)?;

    let mut reply = BytesMut::new();
    reply.put_u8(reply_type);
    put_bytes(&mut reply, &host_key_blob);
    put_mpint(&mut reply, &f);
    put_bytes(&mut reply, &signature);

    Ok((
        reply.to_vec(),
        KexOutput {
            hash,
            shared_secret: k,
            exchange_hash: h,
            host_key_blob,
        },
    ))
}

/// Fixed-group Diffie-Hellman engine.
pub struct DhGroupKex {
    group: DhGroup,
    params: KexParams,
    secret: Option<(BigUint, BigUint)>,
}

impl std::fmt::Debug for DhGroupKex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhGroupKex")
            .field("group", &self.group)
            .field("is_server", &self.params.is_server)
            .finish_non_exhaustive()
    }
}

impl DhGroupKex {
    /// Creates an engine for `group`.
    pub fn new(group: DhGroup, params: KexParams) -> Self {
        Self {
            group,
            params,
            secret: None,
        }
    }
}

impl KexAlgorithm for DhGroupKex {
    fn name(&self) -> &'static str {
        self.group.name()
    }

    fn start(&mut self) -> TesseraResult<Vec<Vec<u8>>> {
        if self.params.is_server {
            return Ok(Vec::new());
        }

        let p = self.group.prime();
        let x = generate_exponent(p, self.params.rng.as_ref())?;
        let e = BigUint::from(2u32).modpow(&x, p);

        let mut init = BytesMut::new();
        init.put_u8(MessageType::KexdhInit as u8);
        put_mpint(&mut init, &e);
        self.secret = Some((x, e));

        debug!(method = self.name(), "Sent KEXDH_INIT");
        Ok(vec![init.to_vec()])
    }

    fn handle(&mut self, payload: &[u8]) -> TesseraResult<KexStep> {
        let p = self.group.prime();
        let hash = self.group.hash();

        match (self.params.is_server, payload.first().copied()) {
            (true, Some(30)) => {
                let (reply, output) = server_reply(
                    &self.params,
                    hash,
                    p,
                    &BigUint::from(2u32),
                    &[],
                    payload,
                    MessageType::KexdhReply as u8,
                )?;
                Ok(KexStep::Done(vec![reply], output))
            }
            (false, Some(31)) => {
                let (x, e) = self.secret.take().ok_or_else(|| {
                    TesseraError::Protocol("KEXDH_REPLY before KEXDH_INIT".to_string())
                })?;
                let output = client_finish(&self.params, hash, p, &x, &e, &[], payload)?;
                Ok(KexStep::Done(Vec::new(), output))
            }
            (_, other) => Err(TesseraError::Protocol(format!(
                "Unexpected message {:?} during {}",
                other,
                self.name()
            ))),
        }
    }
}
