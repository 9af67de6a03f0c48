//! Provider (OP) side: association establishment responses, assertion
//! signing and the check_authentication responder.
//!
//! Two association stores are kept: a shared store for handles handed out
//! to relying parties, and a private store for stateless-mode signatures.
//! check_authentication only ever consults the private store, so a shared
//! handle can never be validated through the stateless path.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::assoc_type::{AssociationSessionType, SessionType, DH_SHA256};
use crate::association::Association;
use crate::dh::{DhParameters, DhSession};
use crate::error::{DhError, MessageError};
use crate::message::{self, fields, ParameterSet, OPENID2_NS};
use crate::nonce::NonceGenerator;
use crate::store::ServerAssociationStore;

/// Fields always present in the signed list of a positive assertion
const BASE_SIGNED_FIELDS: [&str; 4] = [
    fields::OP_ENDPOINT,
    fields::RETURN_TO,
    fields::RESPONSE_NONCE,
    fields::ASSOC_HANDLE,
];

/// Identity fields signed when present
const OPTIONAL_SIGNED_FIELDS: [&str; 2] = [fields::CLAIMED_ID, fields::IDENTITY];

/// Provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// This provider's endpoint URL, asserted in every positive response
    pub op_endpoint: String,

    /// Lifetime granted to new associations, in seconds
    pub expires_in_secs: i64,

    /// Accept legacy (pre-2.0) association requests
    pub accept_compat: bool,
}

impl ServerConfig {
    pub fn new(op_endpoint: impl Into<String>) -> Self {
        Self {
            op_endpoint: op_endpoint.into(),
            expires_in_secs: 1800,
            accept_compat: true,
        }
    }
}

/// The protocol core of an identity provider
pub struct Server {
    config: ServerConfig,
    /// Session type advertised when rejecting an unsupported request
    preferred: AssociationSessionType,
    /// Associations handed out to relying parties
    shared: ServerAssociationStore,
    /// Associations used only for stateless-mode signatures
    private: ServerAssociationStore,
    nonce_generator: NonceGenerator,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            preferred: DH_SHA256,
            shared: ServerAssociationStore::new(),
            private: ServerAssociationStore::new(),
            nonce_generator: NonceGenerator::new(),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Shared association store (handles visible to relying parties)
    pub fn shared_store(&self) -> &ServerAssociationStore {
        &self.shared
    }

    /// Handle an association request, producing a direct response.
    ///
    /// Protocol-level problems (off-catalog type, bad DH values) become
    /// error responses, not Rust errors; the `Err` arm only covers message
    /// construction failures.
    pub fn process_association_request(
        &self,
        request: &ParameterSet,
    ) -> Result<ParameterSet, MessageError> {
        let compat = !request.has(fields::NS);
        if compat && !self.config.accept_compat {
            return self.error_response(compat, "legacy association requests not accepted");
        }

        let session_name = request.get(fields::SESSION_TYPE).unwrap_or("");
        let assoc_name = request.get(fields::ASSOC_TYPE).unwrap_or("HMAC-SHA1");

        let session_type = match AssociationSessionType::create(session_name, assoc_name, compat)
        {
            Ok(t) => t,
            Err(_) => return self.unsupported_response(compat),
        };

        let association = self
            .shared
            .create(session_type.assoc_type(), self.config.expires_in_secs);

        let mut response = ParameterSet::new();
        if !compat {
            response.set(fields::NS, OPENID2_NS)?;
        }
        response.set(fields::ASSOC_HANDLE, association.handle())?;
        // Legacy blank sessions have no session_type field at all
        if !session_type.session_wire_name().is_empty() {
            response.set(fields::SESSION_TYPE, session_type.session_wire_name())?;
        }
        response.set(fields::ASSOC_TYPE, session_type.assoc_wire_name())?;
        response.set(fields::EXPIRES_IN, association.expires_in().to_string())?;

        if session_type.session_type().uses_dh() {
            match self.dh_response_fields(request, session_type.session_type(), &association) {
                Ok((server_public, enc_mac_key)) => {
                    response.set(fields::DH_SERVER_PUBLIC, server_public)?;
                    response.set(fields::ENC_MAC_KEY, enc_mac_key)?;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "rejecting association request with bad DH values");
                    self.shared.remove(association.handle());
                    return self.error_response(compat, &e.to_string());
                }
            }
        } else {
            response.set(fields::MAC_KEY, BASE64.encode(association.mac_key()))?;
        }

        Ok(response)
    }

    /// Run the provider's half of the DH exchange for one request
    fn dh_response_fields(
        &self,
        request: &ParameterSet,
        session_type: SessionType,
        association: &Association,
    ) -> Result<(String, String), DhError> {
        let params = match (request.get(fields::DH_MODULUS), request.get(fields::DH_GEN)) {
            (Some(modulus), Some(generator)) => DhParameters::from_base64(modulus, generator)?,
            _ => DhParameters::default_parameters(),
        };
        let consumer_public = request
            .get(fields::DH_CONSUMER_PUBLIC)
            .ok_or(DhError::InvalidPublicKey)?;

        let session = DhSession::new(params, session_type)?;
        let enc_mac_key = session.encrypt_mac_key(association.mac_key(), consumer_public)?;
        Ok((session.public_key_base64(), BASE64.encode(enc_mac_key)))
    }

    fn unsupported_response(&self, compat: bool) -> Result<ParameterSet, MessageError> {
        let mut response = self.error_response(compat, "association type not supported")?;
        response.set(fields::ERROR_CODE, "unsupported-type")?;
        response.set(fields::SESSION_TYPE, self.preferred.session_wire_name())?;
        response.set(fields::ASSOC_TYPE, self.preferred.assoc_wire_name())?;
        Ok(response)
    }

    fn error_response(
        &self,
        compat: bool,
        message: &str,
    ) -> Result<ParameterSet, MessageError> {
        let mut response = ParameterSet::new();
        if !compat {
            response.set(fields::NS, OPENID2_NS)?;
        }
        response.set(fields::ERROR, message)?;
        Ok(response)
    }

    /// Sign a positive assertion.
    ///
    /// `assoc_handle` is the handle the relying party supplied in its
    /// request, if any. A live shared association with that handle signs the
    /// assertion; otherwise a private (stateless) association is created and
    /// the stale handle is flagged through `invalidate_handle`.
    pub fn sign_assertion(
        &self,
        mut assertion: ParameterSet,
        assoc_handle: Option<&str>,
    ) -> Result<ParameterSet, MessageError> {
        let (association, invalidate) = match assoc_handle {
            Some(handle) => match self.shared.load(handle) {
                Some(assoc) => (assoc, None),
                None => {
                    tracing::debug!(%handle, "unknown or expired handle, signing statelessly");
                    (self.create_private_association(), Some(handle))
                }
            },
            None => (self.create_private_association(), None),
        };

        assertion.set(fields::NS, OPENID2_NS)?;
        assertion.set(fields::MODE, "id_res")?;
        assertion.set(fields::OP_ENDPOINT, &self.config.op_endpoint)?;
        assertion.set(fields::RESPONSE_NONCE, self.nonce_generator.next())?;
        assertion.set(fields::ASSOC_HANDLE, association.handle())?;
        if let Some(stale) = invalidate {
            assertion.set(fields::INVALIDATE_HANDLE, stale)?;
        }

        let mut signed: Vec<&str> = BASE_SIGNED_FIELDS.to_vec();
        for field in OPTIONAL_SIGNED_FIELDS {
            if assertion.has(field) {
                signed.push(field);
            }
        }
        assertion.set(fields::SIGNED, signed.join(","))?;

        let signature = message::sign_fields(&assertion, &signed, &association)?;
        assertion.set(fields::SIG, signature)?;
        Ok(assertion)
    }

    fn create_private_association(&self) -> Association {
        self.private
            .create(self.preferred.assoc_type(), self.config.expires_in_secs)
    }

    /// Answer a check_authentication request.
    ///
    /// The signature is verified against the private store only. When the
    /// request carries an `invalidate_handle` that is indeed unknown in the
    /// shared store, the handle is echoed back so the relying party drops it.
    pub fn process_check_authentication(
        &self,
        request: &ParameterSet,
    ) -> Result<ParameterSet, MessageError> {
        let mut response = ParameterSet::new();
        response.set(fields::NS, OPENID2_NS)?;

        let is_valid = self.check_signature(request);
        response.set(fields::IS_VALID, if is_valid { "true" } else { "false" })?;

        if let Some(stale) = request.get(fields::INVALIDATE_HANDLE) {
            if !self.shared.contains(stale) {
                response.set(fields::INVALIDATE_HANDLE, stale.to_string())?;
            }
        }
        Ok(response)
    }

    fn check_signature(&self, request: &ParameterSet) -> bool {
        let (handle, signed, sig) = match (
            request.get(fields::ASSOC_HANDLE),
            request.get(fields::SIGNED),
            request.get(fields::SIG),
        ) {
            (Some(h), Some(f), Some(s)) => (h, f, s),
            _ => return false,
        };
        let association = match self.private.load(handle) {
            Some(a) => a,
            None => {
                tracing::debug!(%handle, "check_authentication for unknown private handle");
                return false;
            }
        };
        let signed_fields = message::split_signed_list(signed);
        message::verify_fields(request, &signed_fields, sig, &association).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assoc_type::AssociationType;
    use crate::dh::DhSession;

    fn server() -> Server {
        Server::new(ServerConfig::new("https://op.example.com/auth"))
    }

    fn dh_request(session_name: &str, assoc_name: &str) -> (ParameterSet, DhSession) {
        let session_type = match session_name {
            "DH-SHA1" => SessionType::DhSha1,
            _ => SessionType::DhSha256,
        };
        let session =
            DhSession::new(DhParameters::default_parameters(), session_type).unwrap();
        let mut request = ParameterSet::new();
        request.set(fields::NS, OPENID2_NS).unwrap();
        request.set(fields::MODE, "associate").unwrap();
        request.set(fields::SESSION_TYPE, session_name).unwrap();
        request.set(fields::ASSOC_TYPE, assoc_name).unwrap();
        request
            .set(fields::DH_CONSUMER_PUBLIC, session.public_key_base64())
            .unwrap();
        (request, session)
    }

    #[test]
    fn test_dh_association_response_recovers_key() {
        let server = server();
        let (request, session) = dh_request("DH-SHA256", "HMAC-SHA256");
        let response = server.process_association_request(&request).unwrap();

        assert!(!response.has(fields::ERROR));
        assert!(!response.has(fields::MAC_KEY));

        let enc = BASE64.decode(response.get(fields::ENC_MAC_KEY).unwrap()).unwrap();
        let mac_key = session
            .decrypt_mac_key(&enc, response.get(fields::DH_SERVER_PUBLIC).unwrap())
            .unwrap();

        let handle = response.get(fields::ASSOC_HANDLE).unwrap();
        let stored = server.shared.load(handle).unwrap();
        assert_eq!(stored.mac_key(), &mac_key[..]);
        assert_eq!(stored.assoc_type(), AssociationType::HmacSha256);
    }

    #[test]
    fn test_no_encryption_association_sends_plain_key() {
        let server = server();
        let mut request = ParameterSet::new();
        request.set(fields::NS, OPENID2_NS).unwrap();
        request.set(fields::MODE, "associate").unwrap();
        request.set(fields::SESSION_TYPE, "no-encryption").unwrap();
        request.set(fields::ASSOC_TYPE, "HMAC-SHA256").unwrap();

        let response = server.process_association_request(&request).unwrap();
        let mac_key = BASE64.decode(response.get(fields::MAC_KEY).unwrap()).unwrap();
        assert_eq!(mac_key.len(), 32);
    }

    #[test]
    fn test_unsupported_type_advertises_preferred() {
        let server = server();
        let mut request = ParameterSet::new();
        request.set(fields::NS, OPENID2_NS).unwrap();
        request.set(fields::MODE, "associate").unwrap();
        request.set(fields::SESSION_TYPE, "DH-SHA256").unwrap();
        request.set(fields::ASSOC_TYPE, "HMAC-SHA1").unwrap();

        let response = server.process_association_request(&request).unwrap();
        assert_eq!(response.get(fields::ERROR_CODE), Some("unsupported-type"));
        assert_eq!(response.get(fields::SESSION_TYPE), Some("DH-SHA256"));
        assert_eq!(response.get(fields::ASSOC_TYPE), Some("HMAC-SHA256"));
    }

    #[test]
    fn test_dh_request_without_public_value_is_error() {
        let server = server();
        let mut request = ParameterSet::new();
        request.set(fields::NS, OPENID2_NS).unwrap();
        request.set(fields::MODE, "associate").unwrap();
        request.set(fields::SESSION_TYPE, "DH-SHA256").unwrap();
        request.set(fields::ASSOC_TYPE, "HMAC-SHA256").unwrap();

        let response = server.process_association_request(&request).unwrap();
        assert!(response.has(fields::ERROR));
    }

    #[test]
    fn test_assertion_signed_with_shared_association() {
        let server = server();
        let (request, _) = dh_request("DH-SHA256", "HMAC-SHA256");
        let response = server.process_association_request(&request).unwrap();
        let handle = response.get(fields::ASSOC_HANDLE).unwrap().to_string();

        let mut assertion = ParameterSet::new();
        assertion.set(fields::RETURN_TO, "https://rp.example.com/cb").unwrap();
        assertion
            .set(fields::CLAIMED_ID, "https://example.com/alice")
            .unwrap();
        assertion
            .set(fields::IDENTITY, "https://example.com/alice")
            .unwrap();

        let signed = server.sign_assertion(assertion, Some(&handle)).unwrap();
        assert_eq!(signed.get(fields::ASSOC_HANDLE), Some(handle.as_str()));
        assert!(!signed.has(fields::INVALIDATE_HANDLE));

        let association = server.shared.load(&handle).unwrap();
        let fields_list = message::split_signed_list(signed.get(fields::SIGNED).unwrap());
        assert!(message::verify_fields(
            &signed,
            &fields_list,
            signed.get(fields::SIG).unwrap(),
            &association
        )
        .unwrap());
    }

    #[test]
    fn test_stale_handle_triggers_stateless_signature_and_invalidate() {
        let server = server();
        let mut assertion = ParameterSet::new();
        assertion.set(fields::RETURN_TO, "https://rp.example.com/cb").unwrap();

        let signed = server.sign_assertion(assertion, Some("stale-handle")).unwrap();
        assert_eq!(signed.get(fields::INVALIDATE_HANDLE), Some("stale-handle"));

        // The signing handle lives in the private store, not the shared one
        let handle = signed.get(fields::ASSOC_HANDLE).unwrap();
        assert!(server.shared.load(handle).is_none());
        assert!(server.private.load(handle).is_some());
    }

    #[test]
    fn test_check_authentication_accepts_stateless_signature() {
        let server = server();
        let mut assertion = ParameterSet::new();
        assertion.set(fields::RETURN_TO, "https://rp.example.com/cb").unwrap();
        let signed = server.sign_assertion(assertion, None).unwrap();

        let mut check = signed.clone();
        check.set(fields::MODE, "check_authentication").unwrap();
        let response = server.process_check_authentication(&check).unwrap();
        assert_eq!(response.get(fields::IS_VALID), Some("true"));
    }

    #[test]
    fn test_check_authentication_rejects_tampered_assertion() {
        let server = server();
        let mut assertion = ParameterSet::new();
        assertion.set(fields::RETURN_TO, "https://rp.example.com/cb").unwrap();
        let signed = server.sign_assertion(assertion, None).unwrap();

        let mut check = signed.clone();
        check.set(fields::MODE, "check_authentication").unwrap();
        check.set(fields::RETURN_TO, "https://evil.example.com/cb").unwrap();
        let response = server.process_check_authentication(&check).unwrap();
        assert_eq!(response.get(fields::IS_VALID), Some("false"));
    }

    #[test]
    fn test_check_authentication_never_validates_shared_handles() {
        let server = server();
        let (request, _) = dh_request("DH-SHA256", "HMAC-SHA256");
        let response = server.process_association_request(&request).unwrap();
        let handle = response.get(fields::ASSOC_HANDLE).unwrap().to_string();
        let association = server.shared.load(&handle).unwrap();

        // Correctly signed with a shared association, but the stateless
        // responder must not vouch for shared handles
        let mut assertion = ParameterSet::new();
        assertion.set(fields::OP_ENDPOINT, "https://op.example.com/auth").unwrap();
        assertion.set(fields::RETURN_TO, "https://rp.example.com/cb").unwrap();
        assertion.set(fields::RESPONSE_NONCE, "2024-01-01T00:00:00Z0").unwrap();
        assertion.set(fields::ASSOC_HANDLE, &handle).unwrap();
        let signed_list = ["op_endpoint", "return_to", "response_nonce", "assoc_handle"];
        let sig = message::sign_fields(&assertion, &signed_list, &association).unwrap();
        assertion.set(fields::SIGNED, signed_list.join(",")).unwrap();
        assertion.set(fields::SIG, sig).unwrap();
        assertion.set(fields::MODE, "check_authentication").unwrap();

        let response = server.process_check_authentication(&assertion).unwrap();
        assert_eq!(response.get(fields::IS_VALID), Some("false"));
    }

    #[test]
    fn test_invalidate_handle_echoed_only_when_unknown() {
        let server = server();
        let (request, _) = dh_request("DH-SHA256", "HMAC-SHA256");
        let response = server.process_association_request(&request).unwrap();
        let known = response.get(fields::ASSOC_HANDLE).unwrap().to_string();

        let mut check = ParameterSet::new();
        check.set(fields::MODE, "check_authentication").unwrap();
        check.set(fields::INVALIDATE_HANDLE, "unknown-handle").unwrap();
        let response = server.process_check_authentication(&check).unwrap();
        assert_eq!(response.get(fields::INVALIDATE_HANDLE), Some("unknown-handle"));

        let mut check = ParameterSet::new();
        check.set(fields::MODE, "check_authentication").unwrap();
        check.set(fields::INVALIDATE_HANDLE, known).unwrap();
        let response = server.process_check_authentication(&check).unwrap();
        assert!(!response.has(fields::INVALIDATE_HANDLE));
    }

    #[test]
    fn test_compat_request_without_ns() {
        let server = server();
        let mut request = ParameterSet::new();
        request.set(fields::MODE, "associate").unwrap();
        request.set(fields::ASSOC_TYPE, "HMAC-SHA1").unwrap();

        // Blank session type is only legal in compat mode
        let response = server.process_association_request(&request).unwrap();
        assert!(!response.has(fields::NS));
        assert!(response.has(fields::MAC_KEY));
        assert_eq!(response.get(fields::ASSOC_TYPE), Some("HMAC-SHA1"));
        // A blank session has no session_type field in the response
        assert!(!response.has(fields::SESSION_TYPE));
    }

    #[test]
    fn test_association_response_names_session_type_from_catalog() {
        let server = server();
        let (request, _) = dh_request("DH-SHA256", "HMAC-SHA256");
        let response = server.process_association_request(&request).unwrap();
        assert_eq!(response.get(fields::SESSION_TYPE), Some("DH-SHA256"));

        let mut request = ParameterSet::new();
        request.set(fields::NS, OPENID2_NS).unwrap();
        request.set(fields::MODE, "associate").unwrap();
        request.set(fields::SESSION_TYPE, "no-encryption").unwrap();
        request.set(fields::ASSOC_TYPE, "HMAC-SHA256").unwrap();
        let response = server.process_association_request(&request).unwrap();
        assert_eq!(response.get(fields::SESSION_TYPE), Some("no-encryption"));
    }
}
