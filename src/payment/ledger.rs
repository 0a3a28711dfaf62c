//! LRU ledger of payment proofs seen by this process.
//!
//! Every proof presented for verification is recorded under its digest
//! together with the furthest phase it reached. A proof can only start the
//! verify/settle sequence once; after that it is refused, and a proof the
//! facilitator rejected is refused again with the same reason.

use super::proof::ProofDigest;
use crate::error::{Error, Result};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// Default ledger capacity (100,000 entries).
const DEFAULT_LEDGER_CAPACITY: usize = 100_000;

/// How far a proof got.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentPhase {
    /// Admitted, verification in flight.
    Unverified,
    /// The facilitator accepted the proof; settlement pending.
    Verified,
    /// Funds moved.
    Settled,
    /// The facilitator refused the proof.
    Rejected {
        /// Reason reported by the facilitator.
        reason: String,
        /// Payer reported by the facilitator.
        payer: Option<String>,
    },
    /// Settlement did not complete.
    SettleFailed {
        /// True when the outcome is unknown (timeout, transport error).
        ambiguous: bool,
    },
}

/// Ledger statistics for monitoring.
#[derive(Debug, Default, Clone)]
pub struct LedgerStats {
    /// Proofs admitted for verification.
    pub admitted: u64,
    /// Proofs refused because they were seen before.
    pub replays: u64,
    /// Proofs that settled.
    pub settled: u64,
}

/// Bounded record of proof phases.
///
/// Eviction only forgets the oldest proofs; the facilitator still refuses
/// a replayed authorization on its own.
#[derive(Clone)]
pub struct ProofLedger {
    inner: Arc<Mutex<LruCache<ProofDigest, PaymentPhase>>>,
    stats: Arc<Mutex<LedgerStats>>,
}

impl ProofLedger {
    /// Create a ledger with default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_LEDGER_CAPACITY)
    }

    /// Create a ledger holding at most `capacity` proofs.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(Mutex::new(LruCache::new(cap))),
            stats: Arc::new(Mutex::new(LedgerStats::default())),
        }
    }

    /// Admit a proof for verification.
    ///
    /// # Errors
    ///
    /// Returns `Error::VerificationRejected` if the proof was seen before:
    /// with the original reason if it was rejected, otherwise because it
    /// is in flight or already used.
    pub fn admit(&self, digest: ProofDigest) -> Result<()> {
        let mut ledger = self.inner.lock();
        let refusal = match ledger.get(&digest) {
            None => {
                ledger.put(digest, PaymentPhase::Unverified);
                self.stats.lock().admitted += 1;
                return Ok(());
            }
            Some(PaymentPhase::Rejected { reason, payer }) => Error::VerificationRejected {
                reason: reason.clone(),
                payer: payer.clone(),
            },
            Some(PaymentPhase::Unverified | PaymentPhase::Verified) => {
                Error::VerificationRejected {
                    reason: "payment proof is already being processed".to_string(),
                    payer: None,
                }
            }
            Some(PaymentPhase::Settled | PaymentPhase::SettleFailed { .. }) => {
                Error::VerificationRejected {
                    reason: "payment proof was already used".to_string(),
                    payer: None,
                }
            }
        };
        self.stats.lock().replays += 1;
        Err(refusal)
    }

    /// Record the phase a proof has reached.
    pub fn advance(&self, digest: ProofDigest, phase: PaymentPhase) {
        if phase == PaymentPhase::Settled {
            self.stats.lock().settled += 1;
        }
        self.inner.lock().put(digest, phase);
    }

    /// Forget a proof so it can be presented again. Only valid while no
    /// side effect has happened for it.
    pub fn release(&self, digest: &ProofDigest) {
        self.inner.lock().pop(digest);
    }

    /// Current phase of a proof, without touching recency.
    #[must_use]
    pub fn phase(&self, digest: &ProofDigest) -> Option<PaymentPhase> {
        self.inner.lock().peek(digest).cloned()
    }

    /// Get current ledger statistics.
    #[must_use]
    pub fn stats(&self) -> LedgerStats {
        self.stats.lock().clone()
    }

    /// Get the current number of proofs remembered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Check if the ledger is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl Default for ProofLedger {
    fn default() -> Self {
        Self::new()
    }
}
