//! Payment gateway for rolegate.
//!
//! Paid access is bought with an x402 payment proof carried in the
//! `X-PAYMENT` header. The gateway never checks signatures itself; it binds
//! the proof to one acceptable requirement and hands both to an external
//! facilitator:
//!
//! # Architecture
//!
//! ```text
//! X-PAYMENT header
//!        │
//!        ▼
//! ┌─────────────────────┐
//! │ Decode proof        │──── bad base64/JSON ──► MalformedProof
//! └─────────┬───────────┘
//!           ▼
//! ┌─────────────────────┐
//! │ Proof ledger (LRU)  │──── seen before ──────► VerificationRejected
//! └─────────┬───────────┘
//!           ▼
//! ┌─────────────────────┐
//! │ Facilitator /verify │──── invalid ──────────► VerificationRejected
//! └─────────┬───────────┘
//!           ▼
//! ┌─────────────────────┐
//! │ Facilitator /settle │──── failed ───────────► SettlementFailed
//! └─────────┬───────────┘     timeout ──────────► SettlementAmbiguous
//!           ▼
//!   Settlement + X-PAYMENT-RESPONSE
//! ```

mod facilitator;
mod gateway;
mod ledger;
mod proof;
mod requirement;

pub use facilitator::{Facilitator, HttpFacilitator, SettleResponse, VerifyResponse};
pub use gateway::{select_requirement, PaymentGateway, Settlement, VerifiedPayment};
pub use ledger::{LedgerStats, PaymentPhase, ProofLedger};
pub use proof::{PaymentPayload, PaymentProof, ProofDigest};
pub use requirement::{parse_money, AssetDomain, PaymentRequirement, Price, SCHEME_EXACT, X402_VERSION};
