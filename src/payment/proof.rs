//! Decoding of the `X-PAYMENT` header.

use super::requirement::X402_VERSION;
use crate::error::{Error, Result};
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// SHA-256 of the canonical payload encoding, the identity of a proof.
pub type ProofDigest = [u8; 32];

/// Payment payload signed by the payer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentPayload {
    /// Protocol version.
    #[serde(default = "default_version")]
    pub x402_version: u8,
    /// Payment scheme.
    pub scheme: String,
    /// Network the payment is made on.
    pub network: String,
    /// Scheme-specific signed authorization, passed to the facilitator as is.
    pub payload: Value,
}

const fn default_version() -> u8 {
    X402_VERSION
}

/// Hash the payload re-serialized with sorted object keys, so any
/// re-encoding of the same authorization maps to the same digest.
fn canonical_digest(payload: &PaymentPayload) -> Result<ProofDigest> {
    let canonical = serde_json::to_vec(payload)
        .map_err(|e| Error::MalformedProof(format!("payload not serializable: {e}")))?;
    Ok(Sha256::digest(canonical).into())
}

/// A decoded payment proof.
#[derive(Debug, Clone)]
pub struct PaymentProof {
    payload: PaymentPayload,
    digest: ProofDigest,
}

impl PaymentProof {
    /// Decode a base64 JSON header value.
    ///
    /// # Errors
    ///
    /// Returns `Error::MalformedProof` if the value is not base64 or does
    /// not contain a payment payload.
    pub fn decode(header: &str) -> Result<Self> {
        let raw = header.trim();
        if raw.is_empty() {
            return Err(Error::MalformedProof("empty payment header".to_string()));
        }

        let bytes = STANDARD
            .decode(raw)
            .or_else(|_| URL_SAFE.decode(raw))
            .map_err(|e| Error::MalformedProof(format!("not base64: {e}")))?;
        let mut payload: PaymentPayload = serde_json::from_slice(&bytes)
            .map_err(|e| Error::MalformedProof(format!("not a payment payload: {e}")))?;
        payload.x402_version = X402_VERSION;
        let digest = canonical_digest(&payload)?;

        Ok(Self { payload, digest })
    }

    /// Encode a payload as a header value.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    pub fn encode(payload: &PaymentPayload) -> Result<String> {
        let json = serde_json::to_vec(payload)
            .map_err(|e| Error::Serialization(format!("payment payload: {e}")))?;
        Ok(STANDARD.encode(json))
    }

    /// The decoded payload.
    #[must_use]
    pub fn payload(&self) -> &PaymentPayload {
        &self.payload
    }

    /// Identity of this proof.
    #[must_use]
    pub fn digest(&self) -> ProofDigest {
        self.digest
    }

    /// Hex form of the digest, safe to log.
    #[must_use]
    pub fn digest_hex(&self) -> String {
        hex::encode(self.digest)
    }
}
