//! Error types for association, key-agreement and verification operations

use thiserror::Error;

/// Errors raised while selecting an association session type.
///
/// These are configuration-class failures: they mean the caller asked for a
/// combination outside the closed catalog, and should be surfaced at setup
/// rather than swallowed per-request.
#[derive(Debug, Error)]
pub enum AssocTypeError {
    /// The (session type, association type) pair is not in the catalog
    #[error("Unsupported association type (session={session:?}, assoc={assoc:?})")]
    Unsupported {
        /// Requested session type name
        session: String,
        /// Requested association type name
        assoc: String,
    },
}

/// Errors from the Diffie-Hellman key-agreement engine
#[derive(Debug, Error)]
pub enum DhError {
    /// Peer public value outside [2, p-2]
    #[error("DH public value out of range")]
    InvalidPublicKey,

    /// MAC key length does not match the session digest output length
    #[error("Key size mismatch (key={key_len} bytes, digest={digest_len} bytes)")]
    KeySizeMismatch {
        /// Supplied MAC key length
        key_len: usize,
        /// Output length of the session's digest
        digest_len: usize,
    },

    /// Safe-prime search exhausted its attempt bound
    #[error("No safe prime of {bits} bits found within {attempts} attempts")]
    PrimeSearchFailed {
        /// Requested modulus size
        bits: u64,
        /// Attempts made before giving up
        attempts: usize,
    },

    /// Modulus or generator failed validation
    #[error("Invalid DH parameter: {0}")]
    InvalidParameter(String),

    /// Transported big-integer value was not valid base64
    #[error("Invalid base64 in DH value")]
    InvalidBase64,
}

/// Errors around association construction and negotiation
#[derive(Debug, Error)]
pub enum AssociationError {
    /// Key length does not match the association type's required size
    #[error("MAC key length {actual} does not match {expected} required by the association type")]
    KeyLength {
        /// Required key length
        expected: usize,
        /// Supplied key length
        actual: usize,
    },

    /// Provider rejected every session type the catalog allows
    #[error("Association negotiation failed: no session type accepted by the provider")]
    NegotiationFailed,

    /// Provider returned an association response with a missing or bad field
    #[error("Malformed association response: {0}")]
    MalformedResponse(String),

    /// Key agreement failed during establishment
    #[error("Key agreement error: {0}")]
    Dh(#[from] DhError),

    /// Message construction failed
    #[error("Message error: {0}")]
    Message(#[from] MessageError),

    /// Round trip to the provider failed
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Errors from message construction, canonicalization and parsing
#[derive(Debug, Error)]
pub enum MessageError {
    /// Parameter name or value contains the delimiter or a newline
    #[error("Invalid character in parameter {name:?}")]
    InvalidCharacter {
        /// Offending parameter name
        name: String,
    },

    /// A field named in the signed list is absent from the message
    #[error("Signed field {field:?} missing from message")]
    MissingSignedField {
        /// Name of the missing field
        field: String,
    },

    /// Key-value text could not be parsed
    #[error("Malformed key-value line: {0:?}")]
    Malformed(String),
}

/// Errors from the provider channel (association establishment and
/// check_authentication round trips). Never retried internally; a transport
/// failure fails the operation closed.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Request timed out
    #[error("Request to provider timed out")]
    Timeout,

    /// HTTP-level failure
    #[error("HTTP error: {0}")]
    Http(String),

    /// Response body was not a parseable key-value message
    #[error("Malformed provider response: {0}")]
    MalformedResponse(String),
}

/// Verification failures, one variant per distinguishable outcome.
///
/// `ReplayDetected` and `NonceTooOld` are first-class outcomes so callers can
/// alert differently from a plain signature failure.
#[derive(Debug, Error)]
pub enum VerificationError {
    /// Asserted endpoint differs from the one recorded at discovery
    #[error("Endpoint mismatch (discovered={discovered}, asserted={asserted})")]
    EndpointMismatch {
        /// Endpoint recorded at discovery time
        discovered: String,
        /// Endpoint claimed by the assertion
        asserted: String,
    },

    /// A required assertion parameter is absent
    #[error("Assertion missing required parameter {0:?}")]
    MissingParameter(String),

    /// A mandatory field, or an identity field present in the assertion,
    /// is not covered by the signature
    #[error("Field {field:?} is not covered by the assertion signature")]
    UnsignedField {
        /// Name of the uncovered field
        field: String,
    },

    /// Local HMAC verification failed
    #[error("Signature verification failed")]
    SignatureMismatch,

    /// Provider answered is_valid:false in stateless mode
    #[error("Provider rejected the assertion in stateless verification")]
    RejectedByProvider,

    /// Nonce was already accepted for this provider
    #[error("Replay detected: nonce {nonce:?} already seen")]
    ReplayDetected {
        /// The replayed nonce
        nonce: String,
    },

    /// Nonce timestamp is older than the verifier's max age
    #[error("Nonce is older than the allowed window")]
    NonceTooOld,

    /// Nonce does not start with a parseable UTC timestamp
    #[error("Nonce has no parseable timestamp")]
    InvalidNonce,

    /// Claimed identifier does not match the discovery record
    #[error("Identity mismatch (discovered={discovered}, asserted={asserted})")]
    IdentityMismatch {
        /// Identifier recorded at discovery time
        discovered: String,
        /// Identifier claimed by the assertion
        asserted: String,
    },

    /// No usable association and stateless fallback is disabled
    #[error("No live association and stateless verification is disabled")]
    StatelessDisabled,

    /// Message-level protocol violation
    #[error("Protocol violation: {0}")]
    Message(#[from] MessageError),

    /// Stateless round trip failed
    #[error("Transport error during stateless verification: {0}")]
    Transport(#[from] TransportError),
}
