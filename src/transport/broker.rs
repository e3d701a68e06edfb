use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use url::Url;

use crate::config::SessionOptions;
use crate::error::{CredentialError, Result};
use crate::transport::CredentialSource;

const DETAIL_MAX_BYTES: usize = 256;

/// A single-use secret minted by the credential broker.
///
/// The credential authorizes exactly one negotiation and is dropped once the
/// offer has been signed; it is never retained by the session.
#[derive(Clone)]
pub struct EphemeralCredential {
    secret: String,
    expires_at: Option<u64>,
}

impl EphemeralCredential {
    #[must_use]
    pub fn new(secret: String, expires_at: Option<u64>) -> Self {
        Self { secret, expires_at }
    }

    #[must_use]
    pub fn secret(&self) -> &str {
        &self.secret
    }

    #[must_use]
    pub const fn expires_at(&self) -> Option<u64> {
        self.expires_at
    }
}

// Keeps the secret out of logs.
impl std::fmt::Debug for EphemeralCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralCredential")
            .field("secret", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct BrokerResponse {
    client_secret: Option<BrokerClientSecret>,
}

#[derive(Debug, Deserialize)]
struct BrokerClientSecret {
    value: Option<String>,
    expires_at: Option<u64>,
}

/// HTTP client for the session credential broker.
///
/// Endpoints are tried in order; the first broker that responds decides the
/// outcome. Only network-level failures fall through to the next candidate.
#[derive(Debug, Clone)]
pub struct CredentialBroker {
    client: Client,
    endpoints: Vec<Url>,
}

impl CredentialBroker {
    /// Create a broker client from session options.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn from_options(options: &SessionOptions) -> Result<Self> {
        let client = Client::builder().timeout(options.http_timeout).build()?;
        Ok(Self {
            client,
            endpoints: options.broker_endpoints.clone(),
        })
    }

    #[must_use]
    pub fn new(client: Client, endpoints: Vec<Url>) -> Self {
        Self { client, endpoints }
    }

    async fn request(&self, endpoint: &Url) -> std::result::Result<EphemeralCredential, CredentialError> {
        let response = self
            .client
            .post(endpoint.clone())
            .send()
            .await
            .map_err(|err| CredentialError::Unreachable(err.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| CredentialError::Unreachable(err.to_string()))?;

        if !status.is_success() {
            return Err(CredentialError::BrokerRejected {
                status: status.as_u16(),
                detail: truncate_detail(&body),
            });
        }

        parse_credential(&body)
    }
}

#[async_trait]
impl CredentialSource for CredentialBroker {
    async fn acquire(&self) -> std::result::Result<EphemeralCredential, CredentialError> {
        let mut last_unreachable: Option<String> = None;

        for endpoint in &self.endpoints {
            match self.request(endpoint).await {
                Ok(credential) => {
                    tracing::debug!(endpoint = %endpoint, "Acquired ephemeral credential");
                    return Ok(credential);
                }
                Err(CredentialError::Unreachable(detail)) => {
                    tracing::warn!(endpoint = %endpoint, detail = %detail, "Broker endpoint unreachable, trying next");
                    last_unreachable = Some(detail);
                }
                Err(err) => return Err(err),
            }
        }

        Err(CredentialError::Unreachable(
            last_unreachable.unwrap_or_else(|| "no broker endpoints configured".to_string()),
        ))
    }
}

fn parse_credential(body: &str) -> std::result::Result<EphemeralCredential, CredentialError> {
    let parsed: BrokerResponse = serde_json::from_str(body)
        .map_err(|err| CredentialError::MalformedResponse(err.to_string()))?;

    let Some(secret) = parsed.client_secret else {
        return Err(CredentialError::MalformedResponse(
            "missing client_secret in broker response".to_string(),
        ));
    };
    let Some(value) = secret.value else {
        return Err(CredentialError::MalformedResponse(
            "missing client_secret.value in broker response".to_string(),
        ));
    };

    Ok(EphemeralCredential::new(value, secret.expires_at))
}

fn truncate_detail(body: &str) -> String {
    let mut end = body.len().min(DETAIL_MAX_BYTES);
    while end > 0 && !body.is_char_boundary(end) {
        end -= 1;
    }
    body[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_credential_happy_path() {
        let body = r#"{"client_secret":{"value":"ek_abc","expires_at":1735689600}}"#;
        let credential = parse_credential(body).unwrap();
        assert_eq!(credential.secret(), "ek_abc");
        assert_eq!(credential.expires_at(), Some(1_735_689_600));
    }

    #[test]
    fn parse_credential_missing_value() {
        let body = r#"{"client_secret":{"expires_at":1}}"#;
        let err = parse_credential(body).unwrap_err();
        assert!(matches!(err, CredentialError::MalformedResponse(_)));
    }

    #[test]
    fn parse_credential_missing_secret() {
        let err = parse_credential(r#"{"id":"sess_1"}"#).unwrap_err();
        assert!(matches!(err, CredentialError::MalformedResponse(_)));
    }

    #[test]
    fn parse_credential_invalid_json() {
        let err = parse_credential("<html>oops</html>").unwrap_err();
        assert!(matches!(err, CredentialError::MalformedResponse(_)));
    }

    #[test]
    fn debug_redacts_secret() {
        let credential = EphemeralCredential::new("ek_secret".to_string(), None);
        let debug = format!("{credential:?}");
        assert!(!debug.contains("ek_secret"));
        assert!(debug.contains("<redacted>"));
    }
}
