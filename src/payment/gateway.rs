//! Verify-then-settle orchestration around the facilitator.

use super::facilitator::{Facilitator, SettleResponse};
use super::ledger::{PaymentPhase, ProofLedger};
use super::proof::{PaymentPayload, PaymentProof, ProofDigest};
use super::requirement::{AssetDomain, PaymentRequirement, Price, SCHEME_EXACT};
use crate::config::FacilitatorConfig;
use crate::error::{Error, Result};
use crate::network::NetworkConfig;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// A proof the facilitator accepted, bound to the requirement it was
/// checked against. Only [`PaymentGateway::settle`] consumes it.
#[derive(Debug)]
pub struct VerifiedPayment {
    digest: ProofDigest,
    payload: PaymentPayload,
    requirement: PaymentRequirement,
    payer: Option<String>,
}

impl VerifiedPayment {
    /// Requirement the proof was verified against.
    #[must_use]
    pub fn requirement(&self) -> &PaymentRequirement {
        &self.requirement
    }

    /// Payer reported by the facilitator.
    #[must_use]
    pub fn payer(&self) -> Option<&str> {
        self.payer.as_deref()
    }
}

/// A completed settlement.
#[derive(Debug, Clone)]
pub struct Settlement {
    /// Requirement that was paid.
    pub requirement: PaymentRequirement,
    /// Facilitator answer.
    pub response: SettleResponse,
}

impl Settlement {
    /// Payer reported by the facilitator.
    #[must_use]
    pub fn payer(&self) -> Option<&str> {
        self.response.payer.as_deref()
    }

    /// Value of the `X-PAYMENT-RESPONSE` header.
    ///
    /// # Errors
    ///
    /// Returns an error if the response cannot be serialized.
    pub fn response_header(&self) -> Result<String> {
        let json = serde_json::to_vec(&self.response)
            .map_err(|e| Error::Serialization(format!("settlement response: {e}")))?;
        Ok(STANDARD.encode(json))
    }
}

/// Builds requirements and drives proofs through verify and settle.
///
/// ```text
/// UNVERIFIED ──verify ok──► VERIFIED ──settle ok──► SETTLED
///     │                        │
///     └──verify refused──► REJECTED   └──settle failed──► SETTLE_FAILED
/// ```
#[derive(Clone)]
pub struct PaymentGateway {
    facilitator: Arc<dyn Facilitator>,
    ledger: ProofLedger,
    verify_timeout: Duration,
    settle_timeout: Duration,
    max_timeout_seconds: u64,
}

impl PaymentGateway {
    /// Create a gateway over a facilitator.
    #[must_use]
    pub fn new(facilitator: Arc<dyn Facilitator>, config: &FacilitatorConfig) -> Self {
        Self {
            facilitator,
            ledger: ProofLedger::with_capacity(config.proof_ledger_capacity),
            verify_timeout: Duration::from_secs(config.verify_timeout_secs),
            settle_timeout: Duration::from_secs(config.settle_timeout_secs),
            max_timeout_seconds: config.max_timeout_seconds,
        }
    }

    /// The proof ledger.
    #[must_use]
    pub fn ledger(&self) -> &ProofLedger {
        &self.ledger
    }

    /// Build the requirement to pay `price` to `pay_to` on `network`.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidPrice` if the price cannot be expressed in the
    /// network asset's units.
    pub fn build_requirement(
        &self,
        price: &Price,
        network: &NetworkConfig,
        resource: &str,
        pay_to: &str,
        description: &str,
    ) -> Result<PaymentRequirement> {
        let amount = price.to_atomic(network.asset_decimals)?;
        Ok(PaymentRequirement {
            scheme: SCHEME_EXACT.to_string(),
            network: network.id.clone(),
            max_amount_required: amount.to_string(),
            resource: resource.to_string(),
            description: description.to_string(),
            mime_type: String::new(),
            pay_to: pay_to.to_string(),
            max_timeout_seconds: self.max_timeout_seconds,
            asset: network.asset.clone(),
            output_schema: Some(json!({
                "input": { "type": "http", "method": "POST" },
                "output": {
                    "success": {
                        "type": "boolean",
                        "description": "Whether the role was successfully assigned",
                    },
                },
            })),
            extra: Some(AssetDomain {
                name: network.asset_name.clone(),
                version: network.asset_version.clone(),
            }),
        })
    }

    /// Verify `proof` against the best matching requirement in `accepts`.
    ///
    /// # Errors
    ///
    /// - `Error::BadRequest` if `accepts` is empty
    /// - `Error::VerificationRejected` if the proof was seen before or the
    ///   facilitator refuses it
    /// - `Error::FacilitatorUnavailable` if the facilitator cannot be
    ///   reached in time; the proof may then be presented again
    pub async fn verify(
        &self,
        proof: &PaymentProof,
        accepts: &[PaymentRequirement],
    ) -> Result<VerifiedPayment> {
        let requirement = select_requirement(accepts, proof.payload())
            .ok_or_else(|| Error::BadRequest("no acceptable payment requirements".to_string()))?
            .clone();
        let digest = proof.digest();
        self.ledger.admit(digest)?;

        debug!(
            "Verifying proof {} against {} on {}",
            proof.digest_hex(),
            requirement.max_amount_required,
            requirement.network
        );

        let outcome = tokio::time::timeout(
            self.verify_timeout,
            self.facilitator.verify(proof.payload(), &requirement),
        )
        .await;

        let response = match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                self.ledger.release(&digest);
                warn!("Verify failed for proof {}: {e}", proof.digest_hex());
                return Err(Error::FacilitatorUnavailable(e.to_string()));
            }
            Err(_) => {
                self.ledger.release(&digest);
                warn!(
                    "Verify timed out for proof {} after {:?}",
                    proof.digest_hex(),
                    self.verify_timeout
                );
                return Err(Error::FacilitatorUnavailable(format!(
                    "verify timed out after {:?}",
                    self.verify_timeout
                )));
            }
        };

        if !response.is_valid {
            let reason = response
                .invalid_reason
                .unwrap_or_else(|| "payment verification failed".to_string());
            info!("Proof {} rejected: {reason}", proof.digest_hex());
            self.ledger.advance(
                digest,
                PaymentPhase::Rejected {
                    reason: reason.clone(),
                    payer: response.payer.clone(),
                },
            );
            return Err(Error::VerificationRejected {
                reason,
                payer: response.payer,
            });
        }

        self.ledger.advance(digest, PaymentPhase::Verified);
        Ok(VerifiedPayment {
            digest,
            payload: proof.payload().clone(),
            requirement,
            payer: response.payer,
        })
    }

    /// Settle a verified payment. Never retried.
    ///
    /// # Errors
    ///
    /// - `Error::SettlementFailed` if the facilitator reports failure
    /// - `Error::SettlementAmbiguous` on timeout, transport error or an
    ///   unreadable answer; the outcome must be reconciled by an operator
    pub async fn settle(&self, payment: VerifiedPayment) -> Result<Settlement> {
        let VerifiedPayment {
            digest,
            payload,
            requirement,
            payer,
        } = payment;
        let digest_hex = hex::encode(digest);

        let outcome = tokio::time::timeout(
            self.settle_timeout,
            self.facilitator.settle(&payload, &requirement),
        )
        .await;

        let response = match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                self.ledger
                    .advance(digest, PaymentPhase::SettleFailed { ambiguous: true });
                error!("Settlement of proof {digest_hex} ambiguous: {e}");
                return Err(Error::SettlementAmbiguous {
                    reason: e.to_string(),
                    payer,
                });
            }
            Err(_) => {
                self.ledger
                    .advance(digest, PaymentPhase::SettleFailed { ambiguous: true });
                error!(
                    "Settlement of proof {digest_hex} timed out after {:?}",
                    self.settle_timeout
                );
                return Err(Error::SettlementAmbiguous {
                    reason: format!("settle timed out after {:?}", self.settle_timeout),
                    payer,
                });
            }
        };

        if !response.success {
            self.ledger
                .advance(digest, PaymentPhase::SettleFailed { ambiguous: false });
            let reason = response
                .error_reason
                .unwrap_or_else(|| "payment settlement failed".to_string());
            warn!("Settlement of proof {digest_hex} failed: {reason}");
            return Err(Error::SettlementFailed {
                reason,
                payer: response.payer.or(payer),
            });
        }

        self.ledger.advance(digest, PaymentPhase::Settled);
        info!(
            "Settled proof {digest_hex}: {} on {} (tx {})",
            requirement.max_amount_required, requirement.network, response.transaction
        );

        let response = SettleResponse {
            payer: response.payer.or(payer),
            ..response
        };
        Ok(Settlement {
            requirement,
            response,
        })
    }
}

/// Pick the requirement matching the proof's scheme and network, falling
/// back to the first one offered.
#[must_use]
pub fn select_requirement<'a>(
    accepts: &'a [PaymentRequirement],
    payload: &PaymentPayload,
) -> Option<&'a PaymentRequirement> {
    accepts
        .iter()
        .find(|r| r.scheme == payload.scheme && r.network == payload.network)
        .or_else(|| accepts.first())
}
