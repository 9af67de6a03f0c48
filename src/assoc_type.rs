//! Closed catalog of association session types.
//!
//! An [`AssociationSessionType`] combines a MAC algorithm, a key-agreement
//! mode and a compatibility flag. The set is closed: only the combinations
//! the protocol defines can be constructed, and the catalog carries an
//! explicit rank used by negotiation ("is this offer better than that one").

use crate::error::AssocTypeError;

/// MAC algorithm for an association
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssociationType {
    /// HMAC-SHA1, 20-byte key
    HmacSha1,
    /// HMAC-SHA256, 32-byte key
    HmacSha256,
}

impl AssociationType {
    /// Required MAC key length in bytes
    pub fn key_size(&self) -> usize {
        match self {
            AssociationType::HmacSha1 => 20,
            AssociationType::HmacSha256 => 32,
        }
    }

    /// Wire name (`assoc_type` parameter value)
    pub fn wire_name(&self) -> &'static str {
        match self {
            AssociationType::HmacSha1 => "HMAC-SHA1",
            AssociationType::HmacSha256 => "HMAC-SHA256",
        }
    }

    /// Parse a wire name
    pub fn from_wire_name(name: &str) -> Option<Self> {
        match name {
            "HMAC-SHA1" => Some(AssociationType::HmacSha1),
            "HMAC-SHA256" => Some(AssociationType::HmacSha256),
            _ => None,
        }
    }
}

/// Key-agreement mode used to protect the MAC key in transit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionType {
    /// MAC key sent in the clear (requires an already-protected channel)
    NoEncryption,
    /// Diffie-Hellman with SHA-1 key derivation
    DhSha1,
    /// Diffie-Hellman with SHA-256 key derivation
    DhSha256,
}

impl SessionType {
    /// Wire name (`session_type` parameter value)
    pub fn wire_name(&self) -> &'static str {
        match self {
            SessionType::NoEncryption => "no-encryption",
            SessionType::DhSha1 => "DH-SHA1",
            SessionType::DhSha256 => "DH-SHA256",
        }
    }

    /// Whether this mode performs a DH exchange
    pub fn uses_dh(&self) -> bool {
        !matches!(self, SessionType::NoEncryption)
    }
}

/// One entry of the closed (MAC x key agreement x compatibility) catalog.
///
/// Immutable; constructed only through [`AssociationSessionType::create`] or
/// the named constants. The `rank` field defines the total "more secure
/// than" order used by negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AssociationSessionType {
    assoc_type: AssociationType,
    session_type: SessionType,
    /// Legacy (pre-2.0) protocol form
    compat: bool,
    rank: u8,
}

/// Legacy blank session with HMAC-SHA1 (compatibility mode only)
pub const COMPAT_BLANK_SHA1: AssociationSessionType = AssociationSessionType {
    assoc_type: AssociationType::HmacSha1,
    session_type: SessionType::NoEncryption,
    compat: true,
    rank: 0,
};

/// Legacy DH-SHA1 (compatibility mode only)
pub const COMPAT_DH_SHA1: AssociationSessionType = AssociationSessionType {
    assoc_type: AssociationType::HmacSha1,
    session_type: SessionType::DhSha1,
    compat: true,
    rank: 1,
};

/// no-encryption with HMAC-SHA1
pub const NO_ENCRYPTION_SHA1: AssociationSessionType = AssociationSessionType {
    assoc_type: AssociationType::HmacSha1,
    session_type: SessionType::NoEncryption,
    compat: false,
    rank: 2,
};

/// no-encryption with HMAC-SHA256
pub const NO_ENCRYPTION_SHA256: AssociationSessionType = AssociationSessionType {
    assoc_type: AssociationType::HmacSha256,
    session_type: SessionType::NoEncryption,
    compat: false,
    rank: 3,
};

/// DH-SHA1 with HMAC-SHA1
pub const DH_SHA1: AssociationSessionType = AssociationSessionType {
    assoc_type: AssociationType::HmacSha1,
    session_type: SessionType::DhSha1,
    compat: false,
    rank: 4,
};

/// DH-SHA256 with HMAC-SHA256 (most secure catalog entry)
pub const DH_SHA256: AssociationSessionType = AssociationSessionType {
    assoc_type: AssociationType::HmacSha256,
    session_type: SessionType::DhSha256,
    compat: false,
    rank: 5,
};

/// The full catalog, ascending rank order
pub const CATALOG: [AssociationSessionType; 6] = [
    COMPAT_BLANK_SHA1,
    COMPAT_DH_SHA1,
    NO_ENCRYPTION_SHA1,
    NO_ENCRYPTION_SHA256,
    DH_SHA1,
    DH_SHA256,
];

impl AssociationSessionType {
    /// Resolve a `(session_type, assoc_type)` pair from wire names.
    ///
    /// Only the defined combinations resolve; everything else is
    /// [`AssocTypeError::Unsupported`]. The legacy blank-session and
    /// legacy DH-SHA1 forms are accepted only when `compat` is set.
    pub fn create(
        session_name: &str,
        assoc_name: &str,
        compat: bool,
    ) -> Result<Self, AssocTypeError> {
        let entry = match (session_name, assoc_name, compat) {
            ("", "HMAC-SHA1", true) => Some(COMPAT_BLANK_SHA1),
            ("DH-SHA1", "HMAC-SHA1", true) => Some(COMPAT_DH_SHA1),
            ("no-encryption", "HMAC-SHA1", false) => Some(NO_ENCRYPTION_SHA1),
            ("no-encryption", "HMAC-SHA256", false) => Some(NO_ENCRYPTION_SHA256),
            ("DH-SHA1", "HMAC-SHA1", false) => Some(DH_SHA1),
            ("DH-SHA256", "HMAC-SHA256", false) => Some(DH_SHA256),
            _ => None,
        };
        entry.ok_or_else(|| AssocTypeError::Unsupported {
            session: session_name.to_string(),
            assoc: assoc_name.to_string(),
        })
    }

    /// MAC algorithm of this entry
    pub fn assoc_type(&self) -> AssociationType {
        self.assoc_type
    }

    /// Key-agreement mode of this entry
    pub fn session_type(&self) -> SessionType {
        self.session_type
    }

    /// Whether this is a legacy (pre-2.0) form
    pub fn is_compat(&self) -> bool {
        self.compat
    }

    /// Required MAC key length in bytes
    pub fn key_size(&self) -> usize {
        self.assoc_type.key_size()
    }

    /// `session_type` wire value. Legacy blank session serializes as ""
    pub fn session_wire_name(&self) -> &'static str {
        if self.compat && self.session_type == SessionType::NoEncryption {
            ""
        } else {
            self.session_type.wire_name()
        }
    }

    /// `assoc_type` wire value
    pub fn assoc_wire_name(&self) -> &'static str {
        self.assoc_type.wire_name()
    }

    /// Total-order comparison used by negotiation
    pub fn is_better(&self, other: &AssociationSessionType) -> bool {
        self.rank > other.rank
    }
}
