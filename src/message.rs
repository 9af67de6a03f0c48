//! Protocol messages: ordered parameter sets, the key-value and URL wire
//! forms, and the canonical signing text.
//!
//! A message is an insertion-ordered map from name to value. Two wire
//! encodings exist: newline-delimited `key:value` pairs (direct responses
//! and the signing input) and URL-encoded form with the `openid.` prefix
//! (browser redirects). Both round-trip to and from [`ParameterSet`].
//!
//! The canonical signing text is built from a caller-specified,
//! order-significant field list; the list itself travels in the `signed`
//! parameter and is protected by the signature.

use std::fmt;

use crate::association::Association;
use crate::error::MessageError;

/// OpenID 2.0 namespace value of the `ns` parameter
pub const OPENID2_NS: &str = "http://specs.openid.net/auth/2.0";

/// Prefix applied to every parameter in the URL wire form
const OPENID_PREFIX: &str = "openid.";

/// Internal (unprefixed) wire parameter names
pub mod fields {
    pub const NS: &str = "ns";
    pub const MODE: &str = "mode";
    pub const ASSOC_TYPE: &str = "assoc_type";
    pub const SESSION_TYPE: &str = "session_type";
    pub const DH_MODULUS: &str = "dh_modulus";
    pub const DH_GEN: &str = "dh_gen";
    pub const DH_CONSUMER_PUBLIC: &str = "dh_consumer_public";
    pub const DH_SERVER_PUBLIC: &str = "dh_server_public";
    pub const ASSOC_HANDLE: &str = "assoc_handle";
    pub const EXPIRES_IN: &str = "expires_in";
    pub const MAC_KEY: &str = "mac_key";
    pub const ENC_MAC_KEY: &str = "enc_mac_key";
    pub const ERROR: &str = "error";
    pub const ERROR_CODE: &str = "error_code";
    pub const SIGNED: &str = "signed";
    pub const SIG: &str = "sig";
    pub const RESPONSE_NONCE: &str = "response_nonce";
    pub const INVALIDATE_HANDLE: &str = "invalidate_handle";
    pub const CLAIMED_ID: &str = "claimed_id";
    pub const IDENTITY: &str = "identity";
    pub const OP_ENDPOINT: &str = "op_endpoint";
    pub const RETURN_TO: &str = "return_to";
    pub const IS_VALID: &str = "is_valid";
}

/// An insertion-ordered name/value mapping with unique names.
///
/// Names may not contain the `:` delimiter or a newline; values may not
/// contain a newline. Setting an existing name replaces its value in place,
/// preserving the original position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterSet {
    params: Vec<(String, String)>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a parameter, validating both name and value
    pub fn set(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), MessageError> {
        let name = name.into();
        let value = value.into();
        if name.contains(':') || name.contains('\n') || value.contains('\n') {
            return Err(MessageError::InvalidCharacter { name });
        }
        if let Some(existing) = self.params.iter_mut().find(|(n, _)| *n == name) {
            existing.1 = value;
        } else {
            self.params.push((name, value));
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Required-field accessor with the field name in the error
    pub fn require(&self, name: &str) -> Result<&str, MessageError> {
        self.get(name).ok_or_else(|| MessageError::MissingSignedField {
            field: name.to_string(),
        })
    }

    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        let idx = self.params.iter().position(|(n, _)| n == name)?;
        Some(self.params.remove(idx).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Encode as newline-delimited `key:value` text (direct responses)
    pub fn to_key_value(&self) -> String {
        let mut out = String::new();
        for (name, value) in &self.params {
            out.push_str(name);
            out.push(':');
            out.push_str(value);
            out.push('\n');
        }
        out
    }

    /// Parse key-value text. Empty lines are skipped; a non-empty line
    /// without a delimiter is malformed.
    pub fn from_key_value(text: &str) -> Result<Self, MessageError> {
        let mut params = ParameterSet::new();
        for line in text.split('\n') {
            if line.is_empty() {
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| MessageError::Malformed(line.to_string()))?;
            params.set(name, value)?;
        }
        Ok(params)
    }

    /// Encode as an `openid.`-prefixed URL query string (browser redirects)
    pub fn to_url_encoded(&self) -> String {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (name, value) in &self.params {
            serializer.append_pair(&format!("{OPENID_PREFIX}{name}"), value);
        }
        serializer.finish()
    }

    /// Parse a URL query string, keeping only `openid.`-prefixed pairs and
    /// stripping the prefix
    pub fn from_url_encoded(query: &str) -> Result<Self, MessageError> {
        let mut params = ParameterSet::new();
        for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
            if let Some(stripped) = name.strip_prefix(OPENID_PREFIX) {
                params.set(stripped, value.as_ref())?;
            }
        }
        Ok(params)
    }
}

impl fmt::Display for ParameterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_key_value())
    }
}

/// Build the canonical signing text: `name:value\n` for exactly the named
/// fields, in the given order. A named field absent from the message fails
/// closed rather than being skipped.
pub fn canonical_text(
    params: &ParameterSet,
    signed_fields: &[&str],
) -> Result<String, MessageError> {
    let mut out = String::new();
    for field in signed_fields {
        let value = params
            .get(field)
            .ok_or_else(|| MessageError::MissingSignedField {
                field: field.to_string(),
            })?;
        out.push_str(field);
        out.push(':');
        out.push_str(value);
        out.push('\n');
    }
    Ok(out)
}

/// Sign the named fields of a message; returns the base64 signature
pub fn sign_fields(
    params: &ParameterSet,
    signed_fields: &[&str],
    association: &Association,
) -> Result<String, MessageError> {
    Ok(association.sign_base64(&canonical_text(params, signed_fields)?))
}

/// Rebuild canonical text from the fields actually present and verify the
/// base64 signature against it
pub fn verify_fields(
    params: &ParameterSet,
    signed_fields: &[&str],
    signature_b64: &str,
    association: &Association,
) -> Result<bool, MessageError> {
    let text = canonical_text(params, signed_fields)?;
    Ok(association.verify_signature_base64(&text, signature_b64))
}

/// Split a comma-joined `signed` parameter into the field list
pub fn split_signed_list(signed: &str) -> Vec<&str> {
    signed.split(',').filter(|f| !f.is_empty()).collect()
}
