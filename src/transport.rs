//! Direct round trips to the provider endpoint.
//!
//! Association establishment and stateless (check_authentication) requests
//! POST URL-encoded parameters and read a key-value response body. The
//! channel is a trait so hosts and tests can substitute their own transport;
//! the default implementation uses a blocking HTTP client with a bounded
//! timeout. Failures are hard failures, never retried here.

use std::time::Duration;

use crate::error::TransportError;
use crate::message::ParameterSet;

/// HTTP request timeout
const HTTP_TIMEOUT_SECS: u64 = 10;

/// A synchronous channel to a provider endpoint
pub trait ProviderChannel: Send + Sync {
    /// POST the parameters in URL form; parse the body as key-value form
    fn post(&self, endpoint: &str, params: &ParameterSet)
        -> Result<ParameterSet, TransportError>;
}

/// Blocking HTTP channel with a bounded timeout
pub struct HttpChannel {
    client: reqwest::blocking::Client,
}

impl HttpChannel {
    pub fn new() -> Result<Self, TransportError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .map_err(|e| TransportError::Http(e.to_string()))?;
        Ok(Self { client })
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Http(e.to_string()))?;
        Ok(Self { client })
    }
}

impl ProviderChannel for HttpChannel {
    fn post(
        &self,
        endpoint: &str,
        params: &ParameterSet,
    ) -> Result<ParameterSet, TransportError> {
        let response = self
            .client
            .post(endpoint)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(params.to_url_encoded())
            .send()
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout
                } else {
                    TransportError::Http(e.to_string())
                }
            })?;

        // Direct error responses arrive with a 400 status but still carry a
        // key-value body, so the status is not checked here.
        let status = response.status();
        let body = response.text().map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::Http(e.to_string())
            }
        })?;
        tracing::debug!(%endpoint, %status, "direct request completed");

        ParameterSet::from_key_value(&body)
            .map_err(|e| TransportError::MalformedResponse(e.to_string()))
    }
}
