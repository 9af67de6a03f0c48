//! Diffie-Hellman key agreement for MAC-key transport.
//!
//! Two parties derive a shared secret over an observed channel; the secret is
//! hashed into a keystream that masks the MAC key in transit. Big integers
//! travel base64-encoded in `btwoc` form (minimal big-endian two's
//! complement, so a leading zero byte is added when the high bit is set).
//!
//! The default modulus is the well-known 1024-bit safe prime with generator
//! 2; [`DhParameters::generate`] exists for callers that want fresh
//! parameters, but the primality search is CPU-bound and belongs at startup,
//! not on the request path.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use num_bigint::{BigUint, RandBigInt};
use num_integer::Integer;
use num_traits::{One, Zero};
use once_cell::sync::Lazy;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::assoc_type::SessionType;
use crate::error::DhError;

/// Default 1024-bit modulus, base64 btwoc form
const DEFAULT_MODULUS_BASE64: &str = "ANz5OguIOXLsDhmYmsWizjEOHTdxfo2Vcbt2I3MYZuYe91ouJ4mLBX+YkcLiemOcP\
ym2CBRYHNOyyjmG0mg3BVd9RcLn5S3IHHoXGHblzqdLFEi/368Ygo79JRnxTkXjgmY0rxlJ5bU1zIKaSDuKdiI+XUkKJX8Fvf8W8vsixYOr";

/// Primality test rounds are derived from the caller's certainty: each
/// Miller-Rabin round bounds the error by 1/4.
fn rounds_for_certainty(certainty: u32) -> u32 {
    certainty.div_ceil(2).max(1)
}

/// Small primes for cheap candidate rejection before Miller-Rabin
const SMALL_PRIMES: [u32; 15] = [3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47, 53];

static DEFAULT_PARAMETERS: Lazy<DhParameters> = Lazy::new(|| {
    // The constant is compiled in; failing to parse it is a build defect.
    DhParameters::from_base64(DEFAULT_MODULUS_BASE64, &base64_btwoc(&BigUint::from(2u32)))
        .expect("default DH modulus constant is valid")
});

/// Encode a nonnegative big integer in minimal big-endian two's complement
pub fn btwoc(n: &BigUint) -> Vec<u8> {
    let bytes = n.to_bytes_be();
    if bytes[0] & 0x80 != 0 {
        let mut out = Vec::with_capacity(bytes.len() + 1);
        out.push(0);
        out.extend_from_slice(&bytes);
        out
    } else {
        bytes
    }
}

/// Decode a btwoc byte sequence (values on this wire are never negative)
pub fn from_btwoc(bytes: &[u8]) -> BigUint {
    BigUint::from_bytes_be(bytes)
}

/// btwoc + base64, the transport form of every DH value
pub fn base64_btwoc(n: &BigUint) -> String {
    BASE64.encode(btwoc(n))
}

/// Parse a base64 btwoc transport value
pub fn from_base64_btwoc(s: &str) -> Result<BigUint, DhError> {
    let bytes = BASE64.decode(s).map_err(|_| DhError::InvalidBase64)?;
    Ok(from_btwoc(&bytes))
}

/// A (modulus, generator) pair. Process-wide constants in ordinary
/// operation; freshly generated only when a deployment insists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhParameters {
    modulus: BigUint,
    generator: BigUint,
}

impl DhParameters {
    /// Validate and wrap a (modulus, generator) pair
    pub fn new(modulus: BigUint, generator: BigUint) -> Result<Self, DhError> {
        if modulus.is_even() || modulus.bits() < 64 {
            return Err(DhError::InvalidParameter(
                "modulus must be an odd integer of at least 64 bits".to_string(),
            ));
        }
        let two = BigUint::from(2u32);
        if generator < two || generator >= modulus {
            return Err(DhError::InvalidParameter(
                "generator must lie in [2, modulus)".to_string(),
            ));
        }
        Ok(Self { modulus, generator })
    }

    /// Parse transport-encoded parameters
    pub fn from_base64(modulus_b64: &str, generator_b64: &str) -> Result<Self, DhError> {
        Self::new(from_base64_btwoc(modulus_b64)?, from_base64_btwoc(generator_b64)?)
    }

    /// The well-known default: 1024-bit safe prime, generator 2
    pub fn default_parameters() -> Self {
        DEFAULT_PARAMETERS.clone()
    }

    /// Search for a fresh safe prime of `bits` bits with generator 2.
    ///
    /// Candidates `q` are drawn at random and accepted when both `q` and
    /// `p = 2q + 1` pass Miller-Rabin at the requested certainty. The search
    /// is bounded; exhaustion is [`DhError::PrimeSearchFailed`].
    pub fn generate(bits: u64, certainty: u32) -> Result<Self, DhError> {
        if bits < 64 {
            return Err(DhError::InvalidParameter(
                "modulus size below 64 bits".to_string(),
            ));
        }
        let rounds = rounds_for_certainty(certainty);
        let max_attempts = (bits as usize).saturating_mul(4096);
        let mut rng = rand::thread_rng();
        let one = BigUint::one();

        for _ in 0..max_attempts {
            let mut q = rng.gen_biguint(bits - 1);
            q.set_bit(bits - 2, true);
            q.set_bit(0, true);
            if !is_probable_prime(&q, rounds, &mut rng) {
                continue;
            }
            let p = (&q << 1) + &one;
            if is_probable_prime(&p, rounds, &mut rng) {
                return Self::new(p, BigUint::from(2u32));
            }
        }
        Err(DhError::PrimeSearchFailed {
            bits,
            attempts: max_attempts,
        })
    }

    /// Modulus in transport form
    pub fn modulus_base64(&self) -> String {
        base64_btwoc(&self.modulus)
    }

    /// Generator in transport form
    pub fn generator_base64(&self) -> String {
        base64_btwoc(&self.generator)
    }

    pub fn modulus(&self) -> &BigUint {
        &self.modulus
    }

    pub fn generator(&self) -> &BigUint {
        &self.generator
    }
}

/// Miller-Rabin with random bases, preceded by small-prime trial division
fn is_probable_prime(n: &BigUint, rounds: u32, rng: &mut impl RandBigInt) -> bool {
    let one = BigUint::one();
    let two = BigUint::from(2u32);
    if *n < two {
        return false;
    }
    if *n == two {
        return true;
    }
    if n.is_even() {
        return false;
    }
    for &p in SMALL_PRIMES.iter() {
        let p = BigUint::from(p);
        if *n == p {
            return true;
        }
        if (n % &p).is_zero() {
            return false;
        }
    }

    // n - 1 = d * 2^s with d odd
    let n_minus_one = n - &one;
    let s = n_minus_one.trailing_zeros().unwrap_or(0);
    let d = &n_minus_one >> s;

    'witness: for _ in 0..rounds {
        let a = rng.gen_biguint_range(&two, &n_minus_one);
        let mut x = a.modpow(&d, n);
        if x == one || x == n_minus_one {
            continue;
        }
        for _ in 1..s {
            x = x.modpow(&two, n);
            if x == n_minus_one {
                continue 'witness;
            }
        }
        return false;
    }
    true
}

/// Digest used to stretch the shared secret into a keystream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionDigest {
    Sha1,
    Sha256,
}

impl SessionDigest {
    fn output_len(&self) -> usize {
        match self {
            SessionDigest::Sha1 => 20,
            SessionDigest::Sha256 => 32,
        }
    }

    fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            SessionDigest::Sha1 => Sha1::digest(data).to_vec(),
            SessionDigest::Sha256 => Sha256::digest(data).to_vec(),
        }
    }
}

/// One side of a DH handshake. Exists only for the duration of a single
/// association establishment; never persisted.
pub struct DhSession {
    params: DhParameters,
    digest: SessionDigest,
    private_key: BigUint,
    public_key: BigUint,
}

impl DhSession {
    /// Create a session: draw `x` uniformly from `[1, p-1)` and compute
    /// `y = g^x mod p`. Fails for session types without a DH exchange.
    pub fn new(params: DhParameters, session_type: SessionType) -> Result<Self, DhError> {
        let digest = match session_type {
            SessionType::DhSha1 => SessionDigest::Sha1,
            SessionType::DhSha256 => SessionDigest::Sha256,
            SessionType::NoEncryption => {
                return Err(DhError::InvalidParameter(
                    "no-encryption sessions have no DH exchange".to_string(),
                ))
            }
        };
        let mut rng = rand::thread_rng();
        let one = BigUint::one();
        let upper = params.modulus() - &one;
        let private_key = rng.gen_biguint_range(&one, &upper);
        let public_key = params.generator().modpow(&private_key, params.modulus());
        Ok(Self {
            params,
            digest,
            private_key,
            public_key,
        })
    }

    /// This side's public value in transport form
    pub fn public_key_base64(&self) -> String {
        base64_btwoc(&self.public_key)
    }

    pub fn parameters(&self) -> &DhParameters {
        &self.params
    }

    /// Mask a MAC key with the keystream derived from the shared secret.
    ///
    /// Validates the peer value, computes `Z = peer^x mod p`, derives the
    /// keystream as `H(btwoc(Z))` and XORs. The MAC key length must equal the
    /// digest output length; a SHA-1 session operating on a 32-byte key (or
    /// vice versa) is [`DhError::KeySizeMismatch`].
    pub fn encrypt_mac_key(&self, mac_key: &[u8], peer_b64: &str) -> Result<Vec<u8>, DhError> {
        if mac_key.len() != self.digest.output_len() {
            return Err(DhError::KeySizeMismatch {
                key_len: mac_key.len(),
                digest_len: self.digest.output_len(),
            });
        }
        let peer = from_base64_btwoc(peer_b64)?;
        let two = BigUint::from(2u32);
        let upper = self.params.modulus() - &two;
        if peer < two || peer > upper {
            return Err(DhError::InvalidPublicKey);
        }

        let shared = peer.modpow(&self.private_key, self.params.modulus());
        let keystream = self.digest.digest(&btwoc(&shared));
        Ok(mac_key
            .iter()
            .zip(keystream.iter())
            .map(|(k, s)| k ^ s)
            .collect())
    }

    /// Unmask a transported MAC key. XOR is self-inverse, so this is the
    /// same operation as [`DhSession::encrypt_mac_key`].
    pub fn decrypt_mac_key(&self, enc_mac_key: &[u8], peer_b64: &str) -> Result<Vec<u8>, DhError> {
        self.encrypt_mac_key(enc_mac_key, peer_b64)
    }
}
