//! Error types for rolegate.

use thiserror::Error;

/// Result type alias using the crate's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in rolegate.
///
/// Every failure is scoped to a single request or a single sweep item;
/// nothing here is fatal to the process.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Missing or invalid request input.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Resource, group, account, network or invoice absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// Write refused because it would violate a stored invariant.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Balance is below the computed price, or could not be established.
    #[error("insufficient balance: required {required}{}", fmt_available(.available))]
    InsufficientBalance {
        /// Price in atomic units.
        required: u128,
        /// Balance reported by the ledger, `None` when it was unavailable.
        available: Option<u128>,
    },

    /// A payment proof must be presented to continue.
    #[error("payment required")]
    PaymentRequired,

    /// The payment proof could not be decoded.
    #[error("malformed payment proof: {0}")]
    MalformedProof(String),

    /// The price cannot be expressed in the asset's units.
    #[error("invalid price: {0}")]
    InvalidPrice(String),

    /// The facilitator (or the proof ledger) rejected the proof.
    #[error("payment verification rejected: {reason}")]
    VerificationRejected {
        /// Reason reported for the rejection.
        reason: String,
        /// Payer address, when known.
        payer: Option<String>,
    },

    /// The facilitator reported a definite settlement failure.
    #[error("payment settlement failed: {reason}")]
    SettlementFailed {
        /// Reason reported by the facilitator.
        reason: String,
        /// Payer address, when known.
        payer: Option<String>,
    },

    /// Settlement outcome unknown (timeout, transport error, unreadable
    /// response). Must be reconciled by an operator, never retried.
    #[error("payment settlement ambiguous: {reason}")]
    SettlementAmbiguous {
        /// What went wrong while waiting for the facilitator.
        reason: String,
        /// Payer address, when known.
        payer: Option<String>,
    },

    /// The facilitator could not be reached for verification.
    #[error("facilitator unavailable: {0}")]
    FacilitatorUnavailable(String),

    /// Key generation or account persistence failed.
    #[error("account provisioning failed: {0}")]
    ProvisioningFailed(String),

    /// The ledger could not report a balance.
    #[error("balance unavailable: {0}")]
    BalanceUnavailable(String),

    /// The capability authority failed or timed out.
    #[error("capability authority unavailable: {0}")]
    AuthorityUnavailable(String),

    /// Network/transport error.
    #[error("network error: {0}")]
    Network(String),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A detached task panicked or was aborted.
    #[error("task error: {0}")]
    Task(String),
}

#[allow(clippy::ref_option)]
fn fmt_available(available: &Option<u128>) -> String {
    available.map_or_else(
        || ", balance unavailable".to_string(),
        |a| format!(", available {a}"),
    )
}

impl Error {
    /// Returns true if this error belongs to the payment stage, where the
    /// caller is expected to come back with a fresh proof.
    #[must_use]
    pub fn is_payment_failure(&self) -> bool {
        matches!(
            self,
            Self::PaymentRequired
                | Self::MalformedProof(_)
                | Self::VerificationRejected { .. }
                | Self::SettlementFailed { .. }
                | Self::SettlementAmbiguous { .. }
                | Self::FacilitatorUnavailable(_)
        )
    }

    /// Payer reported by the facilitator, if the error carries one.
    #[must_use]
    pub fn payer(&self) -> Option<&str> {
        match self {
            Self::VerificationRejected { payer, .. }
            | Self::SettlementFailed { payer, .. }
            | Self::SettlementAmbiguous { payer, .. } => payer.as_deref(),
            _ => None,
        }
    }

    /// Short stable name of the error kind, used in logs and API bodies.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::BadRequest(_) => "bad_request",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::InsufficientBalance { .. } => "insufficient_balance",
            Self::PaymentRequired => "payment_required",
            Self::MalformedProof(_) => "malformed_proof",
            Self::InvalidPrice(_) => "invalid_price",
            Self::VerificationRejected { .. } => "verification_rejected",
            Self::SettlementFailed { .. } => "settlement_failed",
            Self::SettlementAmbiguous { .. } => "settlement_ambiguous",
            Self::FacilitatorUnavailable(_) => "facilitator_unavailable",
            Self::ProvisioningFailed(_) => "provisioning_failed",
            Self::BalanceUnavailable(_) => "balance_unavailable",
            Self::AuthorityUnavailable(_) => "authority_unavailable",
            Self::Network(_) => "network",
            Self::Storage(_) => "storage",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
            Self::Task(_) => "task",
        }
    }
}
