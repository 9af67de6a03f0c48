//! Associations: the shared symmetric secret between relying party and
//! provider, plus HMAC signing and verification over canonical text.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::assoc_type::AssociationType;
use crate::error::AssociationError;

/// An established shared secret. Immutable after creation; destroyed by
/// explicit invalidation or expiry sweep, never mutated in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Association {
    handle: String,
    assoc_type: AssociationType,
    mac_key: Vec<u8>,
    expires_at: DateTime<Utc>,
}

impl Association {
    /// Wrap an existing key (e.g. one recovered from a DH exchange).
    /// The key length must match the association type.
    pub fn new(
        assoc_type: AssociationType,
        handle: impl Into<String>,
        mac_key: Vec<u8>,
        expires_in_secs: i64,
    ) -> Result<Self, AssociationError> {
        if mac_key.len() != assoc_type.key_size() {
            return Err(AssociationError::KeyLength {
                expected: assoc_type.key_size(),
                actual: mac_key.len(),
            });
        }
        Ok(Self {
            handle: handle.into(),
            assoc_type,
            mac_key,
            expires_at: Utc::now() + Duration::seconds(expires_in_secs),
        })
    }

    /// Generate an association with a fresh random key of the type's size
    pub fn generate(
        assoc_type: AssociationType,
        handle: impl Into<String>,
        expires_in_secs: i64,
    ) -> Self {
        let mut mac_key = vec![0u8; assoc_type.key_size()];
        rand::thread_rng().fill_bytes(&mut mac_key);
        Self {
            handle: handle.into(),
            assoc_type,
            mac_key,
            expires_at: Utc::now() + Duration::seconds(expires_in_secs),
        }
    }

    /// Opaque handle, unique within its store's scope
    pub fn handle(&self) -> &str {
        &self.handle
    }

    pub fn assoc_type(&self) -> AssociationType {
        self.assoc_type
    }

    /// Raw MAC key (the DH engine masks this for transport)
    pub fn mac_key(&self) -> &[u8] {
        &self.mac_key
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Seconds until expiry, clamped at zero
    pub fn expires_in(&self) -> i64 {
        (self.expires_at - Utc::now()).num_seconds().max(0)
    }

    pub fn has_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }

    /// HMAC over canonical text with the stored key and algorithm
    pub fn sign(&self, text: &str) -> Vec<u8> {
        match self.assoc_type {
            AssociationType::HmacSha1 => {
                // HMAC accepts keys of any length
                let mut mac = Hmac::<Sha1>::new_from_slice(&self.mac_key)
                    .expect("hmac accepts any key length");
                mac.update(text.as_bytes());
                mac.finalize().into_bytes().to_vec()
            }
            AssociationType::HmacSha256 => {
                let mut mac = Hmac::<Sha256>::new_from_slice(&self.mac_key)
                    .expect("hmac accepts any key length");
                mac.update(text.as_bytes());
                mac.finalize().into_bytes().to_vec()
            }
        }
    }

    /// Signature in the wire form (base64)
    pub fn sign_base64(&self, text: &str) -> String {
        BASE64.encode(self.sign(text))
    }

    /// Recompute and compare in constant time. A mismatch is `false`, never
    /// an error; only malformed input encoding errors elsewhere.
    pub fn verify_signature(&self, text: &str, signature: &[u8]) -> bool {
        let expected = self.sign(text);
        if expected.len() != signature.len() {
            return false;
        }
        expected.ct_eq(signature).into()
    }

    /// Verify a base64 wire-form signature
    pub fn verify_signature_base64(&self, text: &str, signature_b64: &str) -> bool {
        match BASE64.decode(signature_b64) {
            Ok(sig) => self.verify_signature(text, &sig),
            Err(_) => false,
        }
    }
}
