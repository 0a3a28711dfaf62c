//! Periodic revocation of expired grants.
//!
//! Each sweep revokes every grant whose expiry has passed, then retries the
//! attach of grants that were paid for while the authority was down. A
//! grant record is only deleted after its capability was detached, so a
//! failure anywhere leaves the record for the next pass.

use crate::authority::CapabilityAuthority;
use crate::error::Error;
use crate::event::{GateEvent, GateEventsSender};
use crate::model::Grant;
use crate::store::Store;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Counts from one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Expired grants detached and deleted.
    pub revoked: usize,
    /// Expired grants left alone because the subject or capability could
    /// not be resolved, or the grant was renewed meanwhile.
    pub skipped: usize,
    /// Expired grants whose detach or delete failed.
    pub failed: usize,
    /// Deferred attaches that succeeded.
    pub reattached: usize,
}

enum Revocation {
    Revoked,
    Skipped,
    Failed,
}

/// Revokes expired grants.
pub struct ExpirySweeper {
    store: Arc<dyn Store>,
    authority: Arc<dyn CapabilityAuthority>,
    events: GateEventsSender,
    interval: Duration,
}

impl ExpirySweeper {
    /// Create a sweeper running every `interval`.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        authority: Arc<dyn CapabilityAuthority>,
        events: GateEventsSender,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            authority,
            events,
            interval,
        }
    }

    /// Time between sweeps.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run one pass now.
    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(Utc::now()).await
    }

    /// Run one pass as if the time were `now`.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        match self.store.expired_grants(now).await {
            Ok(expired) => {
                if !expired.is_empty() {
                    debug!("Sweeping {} expired grants", expired.len());
                }
                for grant in &expired {
                    match self.revoke(grant).await {
                        Revocation::Revoked => report.revoked += 1,
                        Revocation::Skipped => report.skipped += 1,
                        Revocation::Failed => report.failed += 1,
                    }
                }
            }
            Err(e) => {
                error!("Failed to list expired grants: {e}");
                let _ = self.events.send(GateEvent::Error {
                    message: format!("sweep: {e}"),
                });
            }
        }

        match self.store.unattached_grants(now).await {
            Ok(pending) => {
                for grant in &pending {
                    if self.reattach(grant).await {
                        report.reattached += 1;
                    }
                }
            }
            Err(e) => error!("Failed to list unattached grants: {e}"),
        }

        if report != SweepReport::default() {
            info!(
                "Sweep: {} revoked, {} skipped, {} failed, {} reattached",
                report.revoked, report.skipped, report.failed, report.reattached
            );
        }
        let _ = self.events.send(GateEvent::SweepCompleted {
            revoked: report.revoked,
            skipped: report.skipped,
            failed: report.failed,
            reattached: report.reattached,
        });
        report
    }

    async fn revoke(&self, grant: &Grant) -> Revocation {
        let key = &grant.key;
        let subject = self.authority.resolve_subject(&key.group, &key.subject).await;
        let capability = self
            .authority
            .resolve_capability(&key.group, &key.capability)
            .await;

        match (subject, capability) {
            (Ok(true), Ok(true)) => {}
            (Err(e), _) | (_, Err(e)) => {
                warn!("Skipping {key}: authority unavailable: {e}");
                return Revocation::Skipped;
            }
            _ => {
                debug!("Skipping {key}: subject or capability no longer resolves");
                return Revocation::Skipped;
            }
        }

        if let Err(e) = self
            .authority
            .detach(&key.subject, &key.group, &key.capability)
            .await
        {
            warn!("Detach failed for {key}, keeping grant: {e}");
            return Revocation::Failed;
        }

        match self.store.delete_grant(key, grant.expires_at).await {
            Ok(true) => {
                info!("Revoked {key} (expired {})", grant.expires_at);
                let _ = self
                    .events
                    .send(GateEvent::GrantRevoked { key: key.clone() });
                Revocation::Revoked
            }
            Ok(false) => {
                // Renewed between the listing and the detach.
                warn!("{key} was renewed during the sweep, restoring capability");
                if let Err(e) = self
                    .authority
                    .attach(&key.subject, &key.group, &key.capability)
                    .await
                {
                    error!("Failed to restore capability for renewed {key}: {e}");
                }
                Revocation::Skipped
            }
            Err(e) => {
                error!("Detached {key} but failed to delete its grant: {e}");
                Revocation::Failed
            }
        }
    }

    async fn reattach(&self, grant: &Grant) -> bool {
        let key = &grant.key;
        match self
            .authority
            .attach(&key.subject, &key.group, &key.capability)
            .await
        {
            Ok(()) => match self.store.mark_grant_attached(key, grant.expires_at).await {
                Ok(marked) => {
                    if marked {
                        info!("Completed deferred attach for {key}");
                    }
                    marked
                }
                Err(e) => {
                    warn!("Attached {key} but could not record it: {e}");
                    false
                }
            },
            Err(Error::NotFound(_)) => {
                debug!("Deferred attach for {key}: subject or capability gone");
                false
            }
            Err(e) => {
                debug!("Deferred attach for {key} still failing: {e}");
                false
            }
        }
    }

    /// Sweep every interval until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("Expiry sweeper running every {:?}", self.interval);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.sweep().await;
                }
            }
        }
        info!("Expiry sweeper stopped");
    }
}
