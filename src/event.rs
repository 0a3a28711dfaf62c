//! Gateway event system.

use crate::model::GrantKey;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

/// Events emitted by the gateway.
#[derive(Debug, Clone)]
pub enum GateEvent {
    /// Gateway has started successfully.
    Started,

    /// Gateway is shutting down.
    ShuttingDown,

    /// A grant was written and its capability attached.
    AccessGranted {
        /// Subject, group and capability.
        key: GrantKey,
        /// New expiry.
        expires_at: DateTime<Utc>,
        /// Transaction of the settled payment, if one was required.
        transaction: Option<String>,
    },

    /// A grant was written but its capability could not be attached yet.
    AttachDeferred {
        /// Subject, group and capability.
        key: GrantKey,
        /// Why the attach failed.
        reason: String,
    },

    /// An invoice was issued or re-issued.
    InvoiceIssued {
        /// Subject, group and capability.
        key: GrantKey,
        /// Requested duration in seconds.
        duration: u64,
    },

    /// Settlement outcome unknown; needs manual reconciliation.
    SettlementAmbiguous {
        /// Subject, group and capability being bought.
        key: GrantKey,
        /// Payer, when known.
        payer: Option<String>,
        /// What went wrong.
        reason: String,
    },

    /// An expired grant was revoked.
    GrantRevoked {
        /// Subject, group and capability.
        key: GrantKey,
    },

    /// A sweep pass finished.
    SweepCompleted {
        /// Grants revoked.
        revoked: usize,
        /// Grants left in place because resolution failed.
        skipped: usize,
        /// Grants whose detach failed.
        failed: usize,
        /// Deferred attaches completed.
        reattached: usize,
    },

    /// Error occurred.
    Error {
        /// Error message.
        message: String,
    },
}

/// Channel for receiving gateway events.
pub type GateEventsChannel = broadcast::Receiver<GateEvent>;

/// Sender for gateway events.
pub type GateEventsSender = broadcast::Sender<GateEvent>;

/// Create a new event channel pair.
#[must_use]
pub fn create_event_channel() -> (GateEventsSender, GateEventsChannel) {
    broadcast::channel(256)
}
