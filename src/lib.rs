//! # rolegate
//!
//! Payment-gated, time-limited role grants.
//!
//! A subject pays (x402 proof settled through a facilitator, or a custodial
//! balance check on balance-only networks) for a capability in a resource
//! group. The gateway records a grant with an expiry, attaches the
//! capability through an external authority, and a background sweeper
//! detaches it once the grant expires.
//!
//! ## Architecture
//!
//! ```text
//!   HTTP (api) ──► EntitlementEngine ──► PaymentGateway ──► Facilitator
//!        │               │    │                   └─► ProofLedger (replay)
//!        │               │    └─► BalanceOracle ──► NetworkFamily (evm, account-model)
//!        │               └─► Store ◄── ExpirySweeper ──► CapabilityAuthority
//!        └─► InvoiceService ─┘
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use rolegate::{GateBuilder, GateConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = GateConfig::from_file(std::path::Path::new("rolegate.toml"))?;
//!     let mut gate = GateBuilder::new(config).build().await?;
//!     gate.run().await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod accounts;
pub mod api;
pub mod authority;
pub mod balance;
pub mod config;
pub mod entitlement;
pub mod error;
pub mod event;
pub mod gate;
pub mod invoice;
pub mod model;
pub mod network;
pub mod payment;
pub mod pricing;
pub mod store;
pub mod sweeper;

pub use accounts::AccountProvisioner;
pub use authority::{CapabilityAuthority, DiscordAuthority, DiscordClient};
pub use balance::BalanceOracle;
pub use config::{GateConfig, GroupConfig, NetworkConfig, NetworkKind, ResourceConfig};
pub use entitlement::{AccessOutcome, AccessRequest, EntitlementEngine, PaymentTerms, Quote};
pub use error::{Error, Result};
pub use event::{GateEvent, GateEventsChannel};
pub use gate::{GateBuilder, RunningGate, ShutdownHandle};
pub use invoice::{InvoiceDetails, InvoiceRequest, InvoiceService};
pub use model::{Account, Grant, GrantKey, Invoice, Resource, ResourceGroup};
pub use payment::{PaymentGateway, PaymentProof, PaymentRequirement, ProofLedger};
pub use pricing::total_price;
pub use store::{LocalStore, Store};
pub use sweeper::{ExpirySweeper, SweepReport};
