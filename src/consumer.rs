//! Relying-party (RP) side: association establishment with type
//! negotiation, and the verification orchestrator for inbound positive
//! assertions.
//!
//! Verification runs the checks in a fixed order, each failing closed:
//! endpoint equality, signed-list coverage, association resolution (local
//! signature check or the stateless check_authentication fallback), replay
//! defense, identity cross-check. The stateless fallback trusts the provider's boolean
//! verdict and is therefore an explicit, disable-able trust-boundary choice;
//! results carry an assurance level so callers can tell the paths apart.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::assoc_type::{AssociationSessionType, CATALOG, DH_SHA256};
use crate::association::Association;
use crate::dh::{DhParameters, DhSession};
use crate::error::{AssociationError, TransportError, VerificationError};
use crate::message::{self, fields, ParameterSet, OPENID2_NS};
use crate::nonce::{NonceStatus, NonceVerifier};
use crate::store::ConsumerAssociationStore;
use crate::transport::{HttpChannel, ProviderChannel};

/// Fields every positive assertion must cover with its signature. An
/// assertion whose `signed` list omits one of these could have had that
/// field replaced after signing.
const MANDATORY_SIGNED_FIELDS: [&str; 4] = [
    fields::OP_ENDPOINT,
    fields::RETURN_TO,
    fields::RESPONSE_NONCE,
    fields::ASSOC_HANDLE,
];

/// One discovery result for an authentication attempt, produced by the
/// external discovery collaborator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredEndpoint {
    pub op_endpoint: String,
    /// Identifier the user claims; `None` for provider-chosen identifiers
    pub claimed_id: Option<String>,
    /// Provider-local identifier, when discovery recorded one
    pub local_id: Option<String>,
}

impl DiscoveredEndpoint {
    pub fn new(op_endpoint: impl Into<String>) -> Self {
        Self {
            op_endpoint: op_endpoint.into(),
            claimed_id: None,
            local_id: None,
        }
    }

    pub fn with_claimed_id(mut self, claimed_id: impl Into<String>) -> Self {
        self.claimed_id = Some(claimed_id.into());
        self
    }

    pub fn with_local_id(mut self, local_id: impl Into<String>) -> Self {
        self.local_id = Some(local_id.into());
        self
    }
}

/// How the assertion's signature was established
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assurance {
    /// Verified locally against a stored association
    SignedLocally,
    /// The provider vouched for it over a direct round trip
    Provider,
}

/// Outcome of a successful verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationResult {
    /// The verified identifier, when the assertion carried one
    pub identifier: Option<String>,
    pub assurance: Assurance,
}

/// Relying-party configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Permit the stateless check_authentication fallback. Disabling it
    /// turns a missing or expired association into a hard failure instead
    /// of a silent trust downgrade.
    pub allow_stateless: bool,

    /// Replay window for response nonces, in seconds
    pub nonce_max_age_secs: i64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            allow_stateless: true,
            nonce_max_age_secs: 60,
        }
    }
}

/// The protocol core of a relying party
pub struct Consumer {
    config: ConsumerConfig,
    /// First session type offered during negotiation
    preferred: AssociationSessionType,
    dh_params: DhParameters,
    channel: Box<dyn ProviderChannel>,
    store: ConsumerAssociationStore,
    nonce_verifier: NonceVerifier,
}

impl Consumer {
    /// Consumer with the default HTTP channel
    pub fn new(config: ConsumerConfig) -> Result<Self, TransportError> {
        Ok(Self::with_channel(config, Box::new(HttpChannel::new()?)))
    }

    /// Consumer over a caller-supplied channel (tests, custom transports)
    pub fn with_channel(config: ConsumerConfig, channel: Box<dyn ProviderChannel>) -> Self {
        let nonce_verifier = NonceVerifier::with_max_age(config.nonce_max_age_secs);
        Self {
            config,
            preferred: DH_SHA256,
            dh_params: DhParameters::default_parameters(),
            channel,
            store: ConsumerAssociationStore::new(),
            nonce_verifier,
        }
    }

    /// Override the first session type offered during negotiation
    pub fn with_preferred(mut self, preferred: AssociationSessionType) -> Self {
        self.preferred = preferred;
        self
    }

    /// Override the DH parameters offered to providers
    pub fn with_dh_parameters(mut self, params: DhParameters) -> Self {
        self.dh_params = params;
        self
    }

    pub fn store(&self) -> &ConsumerAssociationStore {
        &self.store
    }

    /// Establish an association with a provider, negotiating the session
    /// type.
    ///
    /// The preferred type is offered first. When the provider answers
    /// `unsupported-type` its advertised alternative is tried next, provided
    /// it is on the catalog, untried, and not an upgrade over what was just
    /// offered; after that the remaining catalog is walked best-first. Every
    /// candidate is offered at most once; exhaustion is
    /// [`AssociationError::NegotiationFailed`].
    pub fn associate(&self, op_endpoint: &str) -> Result<Association, AssociationError> {
        let mut queue: Vec<AssociationSessionType> = vec![self.preferred];
        // Fallback candidates: downgrades only, best first
        let mut remaining: Vec<AssociationSessionType> = CATALOG
            .iter()
            .rev()
            .filter(|t| {
                t.is_compat() == self.preferred.is_compat()
                    && **t != self.preferred
                    && !t.is_better(&self.preferred)
            })
            .copied()
            .collect();
        let mut tried: Vec<AssociationSessionType> = Vec::new();

        loop {
            let candidate = match queue.pop() {
                Some(c) => c,
                None => match remaining.first().copied() {
                    Some(c) => {
                        remaining.remove(0);
                        c
                    }
                    None => break,
                },
            };
            if tried.contains(&candidate) {
                continue;
            }
            tried.push(candidate);
            remaining.retain(|t| *t != candidate);

            match self.try_associate(op_endpoint, candidate)? {
                AssociateOutcome::Established(association) => {
                    tracing::debug!(
                        endpoint = %op_endpoint,
                        handle = %association.handle(),
                        "association established"
                    );
                    self.store.save(op_endpoint, association.clone());
                    return Ok(association);
                }
                AssociateOutcome::Unsupported { suggested } => {
                    if let Some(alt) = suggested {
                        if !tried.contains(&alt) && !alt.is_better(&candidate) {
                            queue.push(alt);
                        }
                    }
                }
            }
        }
        Err(AssociationError::NegotiationFailed)
    }

    /// Offer one session type to the provider
    fn try_associate(
        &self,
        op_endpoint: &str,
        candidate: AssociationSessionType,
    ) -> Result<AssociateOutcome, AssociationError> {
        let mut request = ParameterSet::new();
        if !candidate.is_compat() {
            request.set(fields::NS, OPENID2_NS)?;
        }
        request.set(fields::MODE, "associate")?;
        request.set(fields::ASSOC_TYPE, candidate.assoc_wire_name())?;
        request.set(fields::SESSION_TYPE, candidate.session_wire_name())?;

        let session = if candidate.session_type().uses_dh() {
            let session = DhSession::new(self.dh_params.clone(), candidate.session_type())?;
            request.set(fields::DH_MODULUS, self.dh_params.modulus_base64())?;
            request.set(fields::DH_GEN, self.dh_params.generator_base64())?;
            request.set(fields::DH_CONSUMER_PUBLIC, session.public_key_base64())?;
            Some(session)
        } else {
            None
        };

        let response = self.channel.post(op_endpoint, &request)?;

        if response.has(fields::ERROR) {
            if response.get(fields::ERROR_CODE) == Some("unsupported-type") {
                let suggested = match (
                    response.get(fields::SESSION_TYPE),
                    response.get(fields::ASSOC_TYPE),
                ) {
                    (Some(session_name), Some(assoc_name)) => AssociationSessionType::create(
                        session_name,
                        assoc_name,
                        candidate.is_compat(),
                    )
                    .ok(),
                    _ => None,
                };
                return Ok(AssociateOutcome::Unsupported { suggested });
            }
            tracing::warn!(
                endpoint = %op_endpoint,
                error = response.get(fields::ERROR).unwrap_or_default(),
                "provider rejected association request"
            );
            return Ok(AssociateOutcome::Unsupported { suggested: None });
        }

        let handle = response
            .get(fields::ASSOC_HANDLE)
            .ok_or_else(|| AssociationError::MalformedResponse("missing assoc_handle".into()))?;
        let expires_in: i64 = response
            .get(fields::EXPIRES_IN)
            .ok_or_else(|| AssociationError::MalformedResponse("missing expires_in".into()))?
            .parse()
            .map_err(|_| AssociationError::MalformedResponse("unparseable expires_in".into()))?;

        let mac_key = match session {
            Some(session) => {
                let server_public = response.get(fields::DH_SERVER_PUBLIC).ok_or_else(|| {
                    AssociationError::MalformedResponse("missing dh_server_public".into())
                })?;
                let enc_mac_key = BASE64
                    .decode(response.get(fields::ENC_MAC_KEY).ok_or_else(|| {
                        AssociationError::MalformedResponse("missing enc_mac_key".into())
                    })?)
                    .map_err(|_| {
                        AssociationError::MalformedResponse("enc_mac_key is not base64".into())
                    })?;
                session.decrypt_mac_key(&enc_mac_key, server_public)?
            }
            None => BASE64
                .decode(response.get(fields::MAC_KEY).ok_or_else(|| {
                    AssociationError::MalformedResponse("missing mac_key".into())
                })?)
                .map_err(|_| AssociationError::MalformedResponse("mac_key is not base64".into()))?,
        };

        let association =
            Association::new(candidate.assoc_type(), handle, mac_key, expires_in)?;
        Ok(AssociateOutcome::Established(association))
    }

    /// Verify an inbound positive assertion against its discovery record.
    ///
    /// Checks run in order and fail closed: endpoint, signed-list coverage,
    /// signature (local or stateless), nonce, identity. Exactly one of
    /// `Ok(result)` or a typed error comes back; there are no partial
    /// verdicts.
    pub fn verify(
        &self,
        assertion: &ParameterSet,
        discovered: &DiscoveredEndpoint,
    ) -> Result<VerificationResult, VerificationError> {
        // 1. Endpoint: the asserted provider must be the discovered one
        let op_endpoint = match assertion.get(fields::OP_ENDPOINT) {
            Some(asserted) => {
                if asserted != discovered.op_endpoint {
                    return Err(VerificationError::EndpointMismatch {
                        discovered: discovered.op_endpoint.clone(),
                        asserted: asserted.to_string(),
                    });
                }
                asserted.to_string()
            }
            None => {
                return Err(VerificationError::MissingParameter(
                    fields::OP_ENDPOINT.to_string(),
                ))
            }
        };

        let handle = required(assertion, fields::ASSOC_HANDLE)?;
        let sig = required(assertion, fields::SIG)?;
        let signed = required(assertion, fields::SIGNED)?;
        let nonce = required(assertion, fields::RESPONSE_NONCE)?;
        let invalidate = assertion.get(fields::INVALIDATE_HANDLE);

        // 2. Signed-list coverage: a valid signature over an incomplete list
        // proves nothing about the uncovered fields, so this fails closed
        // before either signature path runs
        let signed_fields = message::split_signed_list(signed);
        check_signed_coverage(assertion, &signed_fields)?;

        // 3. Signature: local high-assurance path, or the stateless fallback
        let assurance = match self.store.load(&op_endpoint, handle) {
            Some(association) if invalidate != Some(handle) => {
                if !message::verify_fields(assertion, &signed_fields, sig, &association)? {
                    return Err(VerificationError::SignatureMismatch);
                }
                Assurance::SignedLocally
            }
            _ => self.verify_stateless(assertion, &op_endpoint)?,
        };

        // The provider told us this handle is dead; drop it whichever path
        // verified the signature
        if let Some(stale) = invalidate {
            tracing::debug!(handle = %stale, "removing invalidated association");
            self.store.remove(&op_endpoint, stale);
        }

        // 4. Nonce: consulted only after the signature held
        match self.nonce_verifier.seen(&op_endpoint, nonce) {
            NonceStatus::Ok => {}
            NonceStatus::Seen => {
                return Err(VerificationError::ReplayDetected {
                    nonce: nonce.to_string(),
                })
            }
            NonceStatus::TooOld => return Err(VerificationError::NonceTooOld),
            NonceStatus::InvalidTimestamp => return Err(VerificationError::InvalidNonce),
        }

        // 5. Identity cross-check against the discovery record
        let identifier = self.check_identity(assertion, discovered)?;

        Ok(VerificationResult {
            identifier,
            assurance,
        })
    }

    /// Replay the assertion to the provider as a check_authentication
    /// request and trust its boolean verdict
    fn verify_stateless(
        &self,
        assertion: &ParameterSet,
        op_endpoint: &str,
    ) -> Result<Assurance, VerificationError> {
        if !self.config.allow_stateless {
            return Err(VerificationError::StatelessDisabled);
        }
        tracing::warn!(
            endpoint = %op_endpoint,
            "no usable association, falling back to stateless verification"
        );

        let mut request = assertion.clone();
        request.set(fields::MODE, "check_authentication")?;
        let response = self.channel.post(op_endpoint, &request)?;

        if response.get(fields::IS_VALID) != Some("true") {
            return Err(VerificationError::RejectedByProvider);
        }
        Ok(Assurance::Provider)
    }

    fn check_identity(
        &self,
        assertion: &ParameterSet,
        discovered: &DiscoveredEndpoint,
    ) -> Result<Option<String>, VerificationError> {
        let asserted_claimed = assertion.get(fields::CLAIMED_ID);
        let asserted_identity = assertion.get(fields::IDENTITY);

        if let Some(expected) = &discovered.claimed_id {
            let asserted = asserted_claimed.ok_or_else(|| {
                VerificationError::MissingParameter(fields::CLAIMED_ID.to_string())
            })?;
            if asserted != expected {
                return Err(VerificationError::IdentityMismatch {
                    discovered: expected.clone(),
                    asserted: asserted.to_string(),
                });
            }
        }
        // Provider-chosen identifiers: the asserted local identifier must
        // still agree with what discovery recorded
        if let Some(local) = &discovered.local_id {
            if let Some(identity) = asserted_identity {
                if identity != local {
                    return Err(VerificationError::IdentityMismatch {
                        discovered: local.clone(),
                        asserted: identity.to_string(),
                    });
                }
            }
        }

        Ok(asserted_claimed
            .or(asserted_identity)
            .map(|s| s.to_string()))
    }
}

enum AssociateOutcome {
    Established(Association),
    Unsupported {
        suggested: Option<AssociationSessionType>,
    },
}

fn required<'a>(
    params: &'a ParameterSet,
    name: &str,
) -> Result<&'a str, VerificationError> {
    params
        .get(name)
        .ok_or_else(|| VerificationError::MissingParameter(name.to_string()))
}

/// Require the mandatory fields, plus any identity fields present in the
/// assertion, to appear in its `signed` list
fn check_signed_coverage(
    assertion: &ParameterSet,
    signed_fields: &[&str],
) -> Result<(), VerificationError> {
    for field in MANDATORY_SIGNED_FIELDS {
        if !signed_fields.contains(&field) {
            return Err(VerificationError::UnsignedField {
                field: field.to_string(),
            });
        }
    }
    for field in [fields::CLAIMED_ID, fields::IDENTITY] {
        if assertion.has(field) && !signed_fields.contains(&field) {
            return Err(VerificationError::UnsignedField {
                field: field.to_string(),
            });
        }
    }
    Ok(())
}
