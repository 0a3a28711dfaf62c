//! Client for the external verify/settle service.

use super::proof::PaymentPayload;
use super::requirement::{PaymentRequirement, X402_VERSION};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

/// Result of a verify call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    /// Whether the proof satisfies the requirement.
    pub is_valid: bool,
    /// Why it does not.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalid_reason: Option<String>,
    /// Address that signed the payment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payer: Option<String>,
}

/// Result of a settle call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettleResponse {
    /// Whether the transfer executed.
    pub success: bool,
    /// Why it did not.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
    /// Address that paid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payer: Option<String>,
    /// Transaction reference on the ledger.
    #[serde(default)]
    pub transaction: String,
    /// Network the transfer executed on.
    #[serde(default)]
    pub network: String,
}

/// Verifies and settles payment proofs.
///
/// Implementations report transport problems as `Err`; a definite answer
/// (valid or not, settled or not) is always `Ok`.
#[async_trait]
pub trait Facilitator: Send + Sync {
    /// Check a payload against a requirement. No side effects.
    async fn verify(
        &self,
        payload: &PaymentPayload,
        requirement: &PaymentRequirement,
    ) -> Result<VerifyResponse>;

    /// Execute the transfer for a verified payload. Not idempotent.
    async fn settle(
        &self,
        payload: &PaymentPayload,
        requirement: &PaymentRequirement,
    ) -> Result<SettleResponse>;
}

/// Facilitator reached over HTTP.
pub struct HttpFacilitator {
    http: reqwest::Client,
    url: String,
}

impl HttpFacilitator {
    /// Create a client for the facilitator at `url`.
    #[must_use]
    pub fn new(http: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn post<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        payload: &PaymentPayload,
        requirement: &PaymentRequirement,
    ) -> Result<T> {
        let url = format!("{}/{endpoint}", self.url);
        debug!("Facilitator {endpoint} -> {url}");

        let body = json!({
            "x402Version": X402_VERSION,
            "paymentPayload": payload,
            "paymentRequirements": requirement,
        });
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Network(format!("{endpoint} request failed: {e}")))?;

        // Rejections come back with a body even on 4xx, so the status is
        // only consulted when the body is unreadable.
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::Network(format!("{endpoint} response body: {e}")))?;
        serde_json::from_slice(&bytes).map_err(|e| {
            Error::Serialization(format!(
                "{endpoint} returned HTTP {status} with unreadable body: {e}"
            ))
        })
    }
}

#[async_trait]
impl Facilitator for HttpFacilitator {
    async fn verify(
        &self,
        payload: &PaymentPayload,
        requirement: &PaymentRequirement,
    ) -> Result<VerifyResponse> {
        self.post("verify", payload, requirement).await
    }

    async fn settle(
        &self,
        payload: &PaymentPayload,
        requirement: &PaymentRequirement,
    ) -> Result<SettleResponse> {
        self.post("settle", payload, requirement).await
    }
}
