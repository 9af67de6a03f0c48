//! # openid-assoc
//!
//! The cryptographic and protocol-state core of OpenID-style federated
//! authentication: a relying party (RP) and an identity provider (OP)
//! establish a shared secret (the *association*), the OP signs
//! authentication assertions with it, and the RP verifies those assertions
//! while defending against replay and endpoint substitution.
//!
//! Identifier discovery, HTTP serving and UI glue are external
//! collaborators: discovery hands this crate a [`consumer::DiscoveredEndpoint`],
//! and the only network activity here is the bounded direct round trip used
//! for association establishment and stateless verification.
//!
//! ## Features
//!
//! - **`consumer`** (default): RP-side negotiation and verification
//! - **`server`** (default): OP-side association handling and signing
//!
//! ## Quick start
//!
//! ### RP side: establish an association, verify an assertion
//!
//! ```rust,ignore
//! use openid_assoc::consumer::{Consumer, ConsumerConfig, DiscoveredEndpoint};
//!
//! let consumer = Consumer::new(ConsumerConfig::default())?;
//!
//! // After discovery resolved the user's identifier to an endpoint:
//! let endpoint = DiscoveredEndpoint::new("https://op.example.com/auth")
//!     .with_claimed_id("https://example.com/alice");
//! consumer.associate(&endpoint.op_endpoint)?;
//!
//! // Later, for an inbound positive assertion:
//! let result = consumer.verify(&assertion, &endpoint)?;
//! println!("verified {:?} via {:?}", result.identifier, result.assurance);
//! ```
//!
//! ### OP side: answer association requests, sign assertions
//!
//! ```rust,ignore
//! use openid_assoc::server::{Server, ServerConfig};
//!
//! let server = Server::new(ServerConfig::new("https://op.example.com/auth"));
//! let response = server.process_association_request(&request)?;
//! let assertion = server.sign_assertion(assertion, rp_supplied_handle)?;
//! ```
//!
//! ## Security properties
//!
//! - **Replay protection**: response nonces embed a UTC timestamp and are
//!   tracked per provider within a bounded window; a second sighting is a
//!   first-class [`error::VerificationError::ReplayDetected`] outcome.
//! - **Constant-time comparison**: HMAC signatures are compared in constant
//!   time.
//! - **Fail-closed verification**: endpoint mismatch, missing signed fields
//!   and transport failures during the stateless fallback are all hard
//!   failures; there are no partial verdicts.
//! - **Explicit trust downgrade**: the stateless check_authentication
//!   fallback can be disabled, and results carry an assurance level so
//!   callers can distinguish locally-verified assertions from
//!   provider-vouched ones.

#![deny(unsafe_code)]

pub mod assoc_type;
pub mod association;
#[cfg(feature = "consumer")]
pub mod consumer;
pub mod dh;
pub mod error;
pub mod message;
pub mod nonce;
#[cfg(feature = "server")]
pub mod server;
pub mod store;
pub mod transport;

pub use assoc_type::{AssociationSessionType, AssociationType, SessionType};
pub use association::Association;
#[cfg(feature = "consumer")]
pub use consumer::{Assurance, Consumer, ConsumerConfig, DiscoveredEndpoint, VerificationResult};
pub use dh::{DhParameters, DhSession};
pub use error::{
    AssocTypeError, AssociationError, DhError, MessageError, TransportError, VerificationError,
};
pub use message::ParameterSet;
pub use nonce::{NonceGenerator, NonceStatus, NonceVerifier};
#[cfg(feature = "server")]
pub use server::{Server, ServerConfig};
pub use store::{ConsumerAssociationStore, ExpiringMap, ServerAssociationStore};
pub use transport::{HttpChannel, ProviderChannel};
