//! HTTP client for external verify/settle facilitators.
//!
//! Networks whose descriptor carries a [`FacilitatorDescriptor`] delegate
//! both verification and settlement to a remote service over JSON HTTP with
//! bearer-token authorization:
//!
//! - `POST {url}/verify` with a [`FacilitatorRequest`]
//! - `POST {url}/settle` with the same envelope
//!
//! Non-2xx responses are surfaced with the facilitator's machine-readable
//! reason when its body parses; non-JSON bodies become opaque rejections.
//!
//! [`FacilitatorDescriptor`]: crate::networks::FacilitatorDescriptor

use std::time::Duration;

use reqwest::Client;
use serde::de::DeserializeOwned;
use url::Url;

use crate::proto::{FacilitatorRequest, FacilitatorSettleResponse, FacilitatorVerifyResponse};

/// Errors talking to a remote facilitator.
#[derive(Debug, thiserror::Error)]
pub enum FacilitatorClientError {
    /// The facilitator base URL or a derived endpoint URL is invalid.
    #[error("invalid facilitator URL: {0}")]
    UrlParse(#[from] url::ParseError),
    /// The HTTP client could not be constructed or the request failed in
    /// transport.
    #[error("facilitator transport error: {0}")]
    Http(#[from] reqwest::Error),
    /// The facilitator answered outside 2xx.
    #[error("facilitator returned {status}: {reason}")]
    UnexpectedStatus {
        /// HTTP status of the response.
        status: u16,
        /// The facilitator's reason when one parsed, or a generic note.
        reason: String,
    },
    /// The facilitator answered 2xx with a body that is not the expected
    /// JSON shape.
    #[error("facilitator returned malformed JSON: {0}")]
    MalformedResponse(#[from] serde_json::Error),
}

/// A client bound to one facilitator endpoint.
#[derive(Debug, Clone)]
pub struct FacilitatorClient {
    verify_url: Url,
    settle_url: Url,
    bearer: String,
    client: Client,
}

impl FacilitatorClient {
    /// Creates a client for the facilitator at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL cannot be extended with the endpoint
    /// paths or the HTTP client cannot be built.
    pub fn new(
        base_url: &str,
        bearer: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, FacilitatorClientError> {
        let base: Url = base_url.parse()?;
        let verify_url = join_endpoint(&base, "verify")?;
        let settle_url = join_endpoint(&base, "settle")?;
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            verify_url,
            settle_url,
            bearer: bearer.into(),
            client,
        })
    }

    /// Asks the facilitator to verify a payment.
    ///
    /// # Errors
    ///
    /// Returns [`FacilitatorClientError`] on transport failure, non-2xx
    /// status, or a malformed response body.
    pub async fn verify(
        &self,
        request: &FacilitatorRequest,
    ) -> Result<FacilitatorVerifyResponse, FacilitatorClientError> {
        self.post(&self.verify_url, request).await
    }

    /// Asks the facilitator to settle a verified payment.
    ///
    /// # Errors
    ///
    /// Returns [`FacilitatorClientError`] on transport failure, non-2xx
    /// status, or a malformed response body.
    pub async fn settle(
        &self,
        request: &FacilitatorRequest,
    ) -> Result<FacilitatorSettleResponse, FacilitatorClientError> {
        self.post(&self.settle_url, request).await
    }

    async fn post<T: DeserializeOwned>(
        &self,
        url: &Url,
        request: &FacilitatorRequest,
    ) -> Result<T, FacilitatorClientError> {
        let response = self
            .client
            .post(url.clone())
            .bearer_auth(&self.bearer)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        let body = response.bytes().await?;
        if !status.is_success() {
            return Err(FacilitatorClientError::UnexpectedStatus {
                status: status.as_u16(),
                reason: extract_reason(&body),
            });
        }
        Ok(serde_json::from_slice(&body)?)
    }
}

/// Appends an endpoint segment to the facilitator base URL, tolerating a
/// base with or without a trailing slash.
fn join_endpoint(base: &Url, endpoint: &str) -> Result<Url, url::ParseError> {
    if base.path().ends_with('/') {
        base.join(endpoint)
    } else {
        base.join(&format!("{}/{endpoint}", base.path()))
    }
}

/// Pulls a machine-readable reason out of an error body, falling back to a
/// generic note when the body is not JSON or carries no reason field.
fn extract_reason(body: &[u8]) -> String {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            ["invalidReason", "errorReason", "error"]
                .iter()
                .find_map(|key| v.get(*key).and_then(|r| r.as_str()).map(str::to_owned))
        })
        .unwrap_or_else(|| "facilitator rejected the request".to_owned())
}
