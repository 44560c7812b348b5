//! Diffie-Hellman group exchange (RFC 4419).
//!
//! The client names the group size it wants and the server picks a safe
//! prime from its [`ModuliPool`]. The rest of the exchange matches the
//! fixed-group methods, with the negotiated sizes and group folded into H:
//!
//! ```text
//! client                                       server
//!   KEX_DH_GEX_REQUEST (min, n, max)     -->
//!                                        <--   KEX_DH_GEX_GROUP (p, g)
//!   KEX_DH_GEX_INIT    (e)               -->
//!                                        <--   KEX_DH_GEX_REPLY (K_S, f, sig(H))
//! ```
//!
//! Servers also accept the obsolete KEX_DH_GEX_REQUEST_OLD (number 30,
//! carrying only n).

use crate::ssh::kex::{HashAlgorithm, KexAlgorithm, KexParams, KexStep};
use crate::ssh::kex_dh::{client_finish, generate_exponent, server_reply, GROUP14_PRIME, GROUP1_PRIME};
use crate::ssh::message::MessageType;
use crate::ssh::wire::{put_mpint, Reader};
use bytes::{BufMut, BytesMut};
use num_bigint::BigUint;
use num_traits::One;
use std::collections::BTreeMap;
use tessera_platform::{RandomSource, TesseraError, TesseraResult};
use tracing::{debug, warn};

/// Smallest group size either side accepts.
pub const MIN_GROUP_BITS: u32 = 1024;

/// Largest group size either side accepts.
pub const MAX_GROUP_BITS: u32 = 8192;

/// KEX_DH_GEX_REQUEST_OLD shares its number with KEXDH_INIT.
const MSG_KEX_DH_GEX_REQUEST_OLD: u8 = 30;

/// Group size bounds a client requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GexBounds {
    /// Minimum acceptable size in bits
    pub min: u32,
    /// Preferred size in bits
    pub preferred: u32,
    /// Maximum acceptable size in bits
    pub max: u32,
}

impl Default for GexBounds {
    fn default() -> Self {
        Self {
            min: 1024,
            preferred: 2048,
            max: 8192,
        }
    }
}

impl GexBounds {
    /// Checks that `min <= preferred <= max` and the range overlaps what
    /// this crate supports.
    pub fn validate(&self) -> TesseraResult<()> {
        if self.min > self.preferred || self.preferred > self.max {
            return Err(TesseraError::Config(format!(
                "Group exchange bounds out of order: {}/{}/{}",
                self.min, self.preferred, self.max
            )));
        }
        if self.max < MIN_GROUP_BITS || self.min > MAX_GROUP_BITS {
            return Err(TesseraError::Config(format!(
                "Group exchange bounds outside {}..={} bits",
                MIN_GROUP_BITS, MAX_GROUP_BITS
            )));
        }
        Ok(())
    }
}

/// One safe prime and its generator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Modulus {
    /// Generator
    pub generator: BigUint,
    /// Safe prime
    pub prime: BigUint,
}

/// Primes a server can hand out, grouped by bit length.
#[derive(Debug, Clone, Default)]
pub struct ModuliPool {
    by_bits: BTreeMap<u64, Vec<Modulus>>,
}

impl ModuliPool {
    /// An empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// The two well-known groups (1024 and 2048 bit, generator 2).
    pub fn builtin() -> Self {
        let mut pool = Self::new();
        pool.insert(Modulus {
            generator: BigUint::from(2u32),
            prime: GROUP1_PRIME.clone(),
        });
        pool.insert(Modulus {
            generator: BigUint::from(2u32),
            prime: GROUP14_PRIME.clone(),
        });
        pool
    }

    /// Parses an OpenSSH `moduli` file.
    ///
    /// Each line reads `timestamp type tests tries size generator modulus`.
    /// Only safe primes (type 2) that passed Miller-Rabin testing (bit 4 of
    /// `tests`) are kept. Comments and malformed lines are skipped.
    pub fn parse(text: &str) -> Self {
        let mut pool = Self::new();
        let mut discarded = 0usize;

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match parse_moduli_line(line) {
                Some(modulus) => pool.insert(modulus),
                None => discarded += 1,
            }
        }

        if discarded > 0 {
            debug!(discarded, "Skipped unusable moduli lines");
        }
        pool
    }

    /// Adds a modulus.
    pub fn insert(&mut self, modulus: Modulus) {
        self.by_bits
            .entry(modulus.prime.bits())
            .or_default()
            .push(modulus);
    }

    /// Number of moduli held.
    pub fn len(&self) -> usize {
        self.by_bits.values().map(Vec::len).sum()
    }

    /// True when the pool holds nothing.
    pub fn is_empty(&self) -> bool {
        self.by_bits.is_empty()
    }

    /// Picks a modulus for a client request.
    ///
    /// Among sizes within `[min, max]` the one closest to `preferred` wins.
    /// When nothing fits, the largest size not above `max` is used, else the
    /// smallest size at least `min`. Moduli of the chosen size are picked
    /// at random.
    pub fn select(
        &self,
        min: u32,
        preferred: u32,
        max: u32,
        rng: &dyn RandomSource,
    ) -> TesseraResult<&Modulus> {
        let (min, preferred, max) = (min as u64, preferred as u64, max as u64);
        if self.is_empty() {
            return Err(TesseraError::Protocol(
                "No moduli available for group exchange".to_string(),
            ));
        }
        let sizes = || self.by_bits.keys().copied();

        let chosen = sizes()
            .filter(|&b| b >= min && b <= max)
            .min_by_key(|&b| b.abs_diff(preferred))
            .or_else(|| sizes().filter(|&b| b <= max).max())
            .or_else(|| sizes().find(|&b| b >= min))
            .ok_or_else(|| {
                TesseraError::Protocol("No usable modulus for group exchange".to_string())
            })?;

        let candidates = &self.by_bits[&chosen];
        let mut raw = [0u8; 4];
        rng.fill(&mut raw)?;
        let index = u32::from_be_bytes(raw) as usize % candidates.len();
        Ok(&candidates[index])
    }
}

fn parse_moduli_line(line: &str) -> Option<Modulus> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() != 7 {
        return None;
    }
    let kind: u32 = fields[1].parse().ok()?;
    let tests: u32 = fields[2].parse().ok()?;
    if kind != 2 || tests & 0x04 == 0 {
        return None;
    }
    let generator = BigUint::parse_bytes(fields[5].as_bytes(), 16)?;
    let prime = BigUint::parse_bytes(fields[6].as_bytes(), 16)?;
    if generator <= BigUint::one() || prime.bits() < MIN_GROUP_BITS as u64 {
        return None;
    }
    Some(Modulus { generator, prime })
}

enum GexState {
    /// Client waiting for GROUP; server waiting for REQUEST
    AwaitGroup,
    /// Client sent INIT and waits for REPLY
    ClientAwaitReply {
        group: Modulus,
        x: BigUint,
        e: BigUint,
        fields: Vec<u8>,
    },
    /// Server sent GROUP and waits for INIT
    ServerAwaitInit { group: Modulus, fields: Vec<u8> },
    Finished,
}

/// Group exchange engine.
pub struct GexKex {
    hash: HashAlgorithm,
    params: KexParams,
    state: GexState,
}

impl std::fmt::Debug for GexKex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GexKex")
            .field("method", &self.name())
            .field("is_server", &self.params.is_server)
            .finish_non_exhaustive()
    }
}

impl GexKex {
    /// Creates an engine hashing with `hash`.
    pub fn new(hash: HashAlgorithm, params: KexParams) -> Self {
        Self {
            hash,
            params,
            state: GexState::AwaitGroup,
        }
    }

    fn unexpected(&self, msg: Option<u8>) -> TesseraError {
        TesseraError::Protocol(format!(
            "Unexpected message {:?} during {}",
            msg,
            self.name()
        ))
    }

    fn server_group(&mut self, payload: &[u8]) -> TesseraResult<KexStep> {
        let mut r = Reader::after_type(payload);
        let mut fields = BytesMut::new();

        let (min, preferred, max) = if payload[0] == MSG_KEX_DH_GEX_REQUEST_OLD {
            let n = r.read_u32()?;
            fields.put_u32(n);
            (MIN_GROUP_BITS, n, MAX_GROUP_BITS)
        } else {
            let min = r.read_u32()?;
            let n = r.read_u32()?;
            let max = r.read_u32()?;
            if min > max {
                return Err(TesseraError::Protocol(format!(
                    "Group exchange request with min {} above max {}",
                    min, max
                )));
            }
            fields.put_u32(min);
            fields.put_u32(n);
            fields.put_u32(max);
            let min = min.max(MIN_GROUP_BITS);
            let max = max.min(MAX_GROUP_BITS);
            (min, n.clamp(min.min(max), max), max)
        };

        let group = self
            .params
            .moduli
            .select(min, preferred, max, self.params.rng.as_ref())?
            .clone();
        debug!(
            min,
            preferred,
            max,
            bits = group.prime.bits(),
            "Selected group exchange modulus"
        );

        put_mpint(&mut fields, &group.prime);
        put_mpint(&mut fields, &group.generator);

        let mut msg = BytesMut::new();
        msg.put_u8(MessageType::KexdhReply as u8);
        put_mpint(&mut msg, &group.prime);
        put_mpint(&mut msg, &group.generator);

        self.state = GexState::ServerAwaitInit {
            group,
            fields: fields.to_vec(),
        };
        Ok(KexStep::Continue(vec![msg.to_vec()]))
    }

    fn client_init(&mut self, payload: &[u8]) -> TesseraResult<KexStep> {
        let mut r = Reader::after_type(payload);
        let prime = r.read_mpint()?;
        let generator = r.read_mpint()?;

        let bounds = self.params.gex_bounds;
        let bits = prime.bits();
        if bits < bounds.min.max(MIN_GROUP_BITS) as u64 || bits > bounds.max as u64 {
            return Err(TesseraError::Security(format!(
                "Server offered a {}-bit group outside {}..={}",
                bits, bounds.min, bounds.max
            )));
        }
        if generator <= BigUint::one() || generator >= prime {
            return Err(TesseraError::Security(
                "Server offered an invalid generator".to_string(),
            ));
        }
        if bits < bounds.preferred as u64 {
            warn!(bits, preferred = bounds.preferred, "Server offered a smaller group than requested");
        }

        let mut fields = BytesMut::new();
        fields.put_u32(bounds.min);
        fields.put_u32(bounds.preferred);
        fields.put_u32(bounds.max);
        put_mpint(&mut fields, &prime);
        put_mpint(&mut fields, &generator);

        let x = generate_exponent(&prime, self.params.rng.as_ref())?;
        let e = generator.modpow(&x, &prime);

        let mut msg = BytesMut::new();
        msg.put_u8(MessageType::KexDhGexInit as u8);
        put_mpint(&mut msg, &e);

        self.state = GexState::ClientAwaitReply {
            group: Modulus { generator, prime },
            x,
            e,
            fields: fields.to_vec(),
        };
        Ok(KexStep::Continue(vec![msg.to_vec()]))
    }
}

impl KexAlgorithm for GexKex {
    fn name(&self) -> &'static str {
        match self.hash {
            HashAlgorithm::Sha1 => "diffie-hellman-group-exchange-sha1",
            HashAlgorithm::Sha256 => "diffie-hellman-group-exchange-sha256",
        }
    }

    fn start(&mut self) -> TesseraResult<Vec<Vec<u8>>> {
        if self.params.is_server {
            return Ok(Vec::new());
        }
        let bounds = self.params.gex_bounds;
        let mut msg = BytesMut::new();
        msg.put_u8(MessageType::KexDhGexRequest as u8);
        msg.put_u32(bounds.min);
        msg.put_u32(bounds.preferred);
        msg.put_u32(bounds.max);
        debug!(?bounds, "Sent KEX_DH_GEX_REQUEST");
        Ok(vec![msg.to_vec()])
    }

    fn handle(&mut self, payload: &[u8]) -> TesseraResult<KexStep> {
        let msg = payload.first().copied();
        let is_server = self.params.is_server;

        match std::mem::replace(&mut self.state, GexState::Finished) {
            GexState::AwaitGroup if is_server && matches!(msg, Some(30) | Some(34)) => {
                self.server_group(payload)
            }
            GexState::AwaitGroup if !is_server && msg == Some(31) => self.client_init(payload),
            GexState::ServerAwaitInit { group, fields } if msg == Some(32) => {
                let (reply, output) = server_reply(
                    &self.params,
                    self.hash,
                    &group.prime,
                    &group.generator,
                    &fields,
                    payload,
                    MessageType::KexDhGexReply as u8,
                )?;
                Ok(KexStep::Done(vec![reply], output))
            }
            GexState::ClientAwaitReply {
                group,
                x,
                e,
                fields,
            } if msg == Some(33) => {
                let output =
                    client_finish(&self.params, self.hash, &group.prime, &x, &e, &fields, payload)?;
                Ok(KexStep::Done(Vec::new(), output))
            }
            _ => Err(self.unexpected(msg)),
        }
    }
}
