use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use url::Url;

use crate::config::SessionOptions;
use crate::error::{NegotiationError, Result};
use crate::transport::broker::EphemeralCredential;

/// HTTP signaling for the SDP offer/answer exchange.
///
/// The offer SDP is posted as a raw `application/sdp` body authorized by the
/// ephemeral credential; the response body is the answer SDP text.
#[derive(Debug, Clone)]
pub struct SignalingClient {
    client: Client,
    base_url: Url,
}

impl SignalingClient {
    /// Create a signaling client from session options.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn from_options(options: &SessionOptions) -> Result<Self> {
        let client = Client::builder().timeout(options.http_timeout).build()?;
        Ok(Self {
            client,
            base_url: options.signaling_url.clone(),
        })
    }

    #[must_use]
    pub const fn new(client: Client, base_url: Url) -> Self {
        Self { client, base_url }
    }

    /// Exchange a local SDP offer for the remote answer.
    pub async fn exchange_offer(
        &self,
        offer_sdp: &str,
        credential: &EphemeralCredential,
        model: &str,
    ) -> std::result::Result<String, NegotiationError> {
        let mut url = self.base_url.clone();
        url.query_pairs_mut().append_pair("model", model);

        let response = self
            .client
            .post(url)
            .bearer_auth(credential.secret())
            .header(CONTENT_TYPE, "application/sdp")
            .body(offer_sdp.to_string())
            .send()
            .await
            .map_err(|err| NegotiationError::TransportFailed(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(NegotiationError::SignalingRejected {
                status: status.as_u16(),
            });
        }

        response
            .text()
            .await
            .map_err(|err| NegotiationError::TransportFailed(err.to_string()))
    }
}
