//! End-to-end protocol scenarios: a consumer and a server wired together
//! through an in-process channel that round-trips both wire encodings.

#![cfg(all(feature = "consumer", feature = "server"))]

use std::sync::Arc;

use openid_assoc::consumer::{Assurance, Consumer, ConsumerConfig, DiscoveredEndpoint};
use openid_assoc::message::{fields, ParameterSet, OPENID2_NS};
use openid_assoc::server::{Server, ServerConfig};
use openid_assoc::transport::ProviderChannel;
use openid_assoc::{AssociationType, TransportError, VerificationError};

const OP_ENDPOINT: &str = "https://op.example.com/auth";
const RP_RETURN_TO: &str = "https://rp.example.com/callback";
const CLAIMED_ID: &str = "https://example.com/alice";

/// Routes consumer requests to an in-process server, exercising the URL
/// form on the way in and the key-value form on the way out, exactly as the
/// HTTP channel would.
struct InProcessProvider {
    server: Arc<Server>,
}

impl ProviderChannel for InProcessProvider {
    fn post(
        &self,
        _endpoint: &str,
        params: &ParameterSet,
    ) -> Result<ParameterSet, TransportError> {
        let request = ParameterSet::from_url_encoded(&params.to_url_encoded())
            .map_err(|e| TransportError::MalformedResponse(e.to_string()))?;

        let response = match request.get(fields::MODE) {
            Some("associate") => self.server.process_association_request(&request),
            Some("check_authentication") => self.server.process_check_authentication(&request),
            other => return Err(TransportError::Http(format!("unexpected mode {other:?}"))),
        }
        .map_err(|e| TransportError::MalformedResponse(e.to_string()))?;

        ParameterSet::from_key_value(&response.to_key_value())
            .map_err(|e| TransportError::MalformedResponse(e.to_string()))
    }
}

fn wired_pair() -> (Consumer, Arc<Server>) {
    let server = Arc::new(Server::new(ServerConfig::new(OP_ENDPOINT)));
    let channel = InProcessProvider {
        server: server.clone(),
    };
    let consumer = Consumer::with_channel(ConsumerConfig::default(), Box::new(channel));
    (consumer, server)
}

fn assertion_body() -> ParameterSet {
    let mut body = ParameterSet::new();
    body.set(fields::RETURN_TO, RP_RETURN_TO).unwrap();
    body.set(fields::CLAIMED_ID, CLAIMED_ID).unwrap();
    body.set(fields::IDENTITY, CLAIMED_ID).unwrap();
    body
}

fn discovered() -> DiscoveredEndpoint {
    DiscoveredEndpoint::new(OP_ENDPOINT).with_claimed_id(CLAIMED_ID)
}

#[test]
fn dh_sha256_handshake_recovers_identical_key() {
    let (consumer, server) = wired_pair();

    let association = consumer.associate(OP_ENDPOINT).unwrap();
    assert_eq!(association.assoc_type(), AssociationType::HmacSha256);
    assert_eq!(association.mac_key().len(), 32);

    // Both sides hold the same 32-byte key the OP generated
    let server_side = server.shared_store().load(association.handle()).unwrap();
    assert_eq!(server_side.mac_key(), association.mac_key());
}

#[test]
fn full_round_trip_verifies_locally() {
    let (consumer, server) = wired_pair();
    let association = consumer.associate(OP_ENDPOINT).unwrap();

    let assertion = server
        .sign_assertion(assertion_body(), Some(association.handle()))
        .unwrap();

    let result = consumer.verify(&assertion, &discovered()).unwrap();
    assert_eq!(result.assurance, Assurance::SignedLocally);
    assert_eq!(result.identifier.as_deref(), Some(CLAIMED_ID));
}

#[test]
fn assertion_survives_browser_redirect_encoding() {
    let (consumer, server) = wired_pair();
    let association = consumer.associate(OP_ENDPOINT).unwrap();

    let assertion = server
        .sign_assertion(assertion_body(), Some(association.handle()))
        .unwrap();

    // The assertion reaches the RP as a URL query string
    let redirected = ParameterSet::from_url_encoded(&assertion.to_url_encoded()).unwrap();
    let result = consumer.verify(&redirected, &discovered()).unwrap();
    assert_eq!(result.assurance, Assurance::SignedLocally);
}

#[test]
fn replaying_an_accepted_assertion_is_detected() {
    let (consumer, server) = wired_pair();
    let association = consumer.associate(OP_ENDPOINT).unwrap();

    let assertion = server
        .sign_assertion(assertion_body(), Some(association.handle()))
        .unwrap();

    assert!(consumer.verify(&assertion, &discovered()).is_ok());

    // Identical, correctly signed, previously accepted: still rejected
    let replayed = consumer.verify(&assertion, &discovered());
    assert!(matches!(
        replayed,
        Err(VerificationError::ReplayDetected { .. })
    ));
}

#[test]
fn unknown_handle_falls_back_to_stateless_verification() {
    let (consumer, server) = wired_pair();

    // The RP never associated; the OP signs statelessly for a stale handle
    let assertion = server
        .sign_assertion(assertion_body(), Some("long-gone-handle"))
        .unwrap();
    assert_eq!(
        assertion.get(fields::INVALIDATE_HANDLE),
        Some("long-gone-handle")
    );

    let result = consumer.verify(&assertion, &discovered()).unwrap();
    assert_eq!(result.assurance, Assurance::Provider);
}

#[test]
fn stateless_verification_rejects_tampering() {
    let (consumer, server) = wired_pair();

    let assertion = server.sign_assertion(assertion_body(), None).unwrap();
    let mut tampered = assertion.clone();
    tampered.set(fields::CLAIMED_ID, "https://example.com/mallory").unwrap();
    tampered.set(fields::IDENTITY, "https://example.com/mallory").unwrap();

    let result = consumer.verify(&tampered, &discovered());
    assert!(matches!(
        result,
        Err(VerificationError::RejectedByProvider)
    ));
}

#[test]
fn identity_fields_added_after_signing_are_rejected() {
    let (consumer, server) = wired_pair();
    let association = consumer.associate(OP_ENDPOINT).unwrap();

    // The OP signs an assertion that carries no identity fields
    let mut body = ParameterSet::new();
    body.set(fields::RETURN_TO, RP_RETURN_TO).unwrap();
    let mut assertion = server
        .sign_assertion(body, Some(association.handle()))
        .unwrap();

    // The signature over the remaining fields is still valid, but the
    // grafted identity must not be accepted
    assertion
        .set(fields::CLAIMED_ID, "https://example.com/victim")
        .unwrap();
    assertion
        .set(fields::IDENTITY, "https://example.com/victim")
        .unwrap();
    let discovered = DiscoveredEndpoint::new(OP_ENDPOINT)
        .with_claimed_id("https://example.com/victim");

    let result = consumer.verify(&assertion, &discovered);
    assert!(matches!(
        result,
        Err(VerificationError::UnsignedField { .. })
    ));
}

#[test]
fn endpoint_substitution_is_rejected_before_anything_else() {
    let (consumer, server) = wired_pair();
    let association = consumer.associate(OP_ENDPOINT).unwrap();
    let assertion = server
        .sign_assertion(assertion_body(), Some(association.handle()))
        .unwrap();

    let elsewhere = DiscoveredEndpoint::new("https://impostor.example.com/auth")
        .with_claimed_id(CLAIMED_ID);
    let result = consumer.verify(&assertion, &elsewhere);
    assert!(matches!(
        result,
        Err(VerificationError::EndpointMismatch { .. })
    ));
}

/// Provider that declines DH-SHA256, steering the consumer down the catalog
struct Sha1OnlyProvider {
    inner: InProcessProvider,
}

impl ProviderChannel for Sha1OnlyProvider {
    fn post(
        &self,
        endpoint: &str,
        params: &ParameterSet,
    ) -> Result<ParameterSet, TransportError> {
        if params.get(fields::MODE) == Some("associate")
            && params.get(fields::SESSION_TYPE) == Some("DH-SHA256")
        {
            let mut response = ParameterSet::new();
            response.set(fields::NS, OPENID2_NS).unwrap();
            response.set(fields::ERROR, "only SHA-1 here").unwrap();
            response.set(fields::ERROR_CODE, "unsupported-type").unwrap();
            response.set(fields::SESSION_TYPE, "DH-SHA1").unwrap();
            response.set(fields::ASSOC_TYPE, "HMAC-SHA1").unwrap();
            return Ok(response);
        }
        self.inner.post(endpoint, params)
    }
}

#[test]
fn negotiation_downgrades_to_what_the_provider_accepts() {
    let server = Arc::new(Server::new(ServerConfig::new(OP_ENDPOINT)));
    let channel = Sha1OnlyProvider {
        inner: InProcessProvider {
            server: server.clone(),
        },
    };
    let consumer = Consumer::with_channel(ConsumerConfig::default(), Box::new(channel));

    let association = consumer.associate(OP_ENDPOINT).unwrap();
    assert_eq!(association.assoc_type(), AssociationType::HmacSha1);
    assert_eq!(association.mac_key().len(), 20);

    // The downgraded association still verifies a full round trip
    let assertion = server
        .sign_assertion(assertion_body(), Some(association.handle()))
        .unwrap();
    let result = consumer.verify(&assertion, &discovered()).unwrap();
    assert_eq!(result.assurance, Assurance::SignedLocally);
}
