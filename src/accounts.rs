//! Per-subject, per-network account provisioning.

use crate::error::{Error, Result};
use crate::model::Account;
use crate::network::NetworkRegistry;
use crate::store::Store;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Creates and looks up subject accounts.
#[derive(Clone)]
pub struct AccountProvisioner {
    store: Arc<dyn Store>,
    registry: NetworkRegistry,
}

impl AccountProvisioner {
    /// Create a provisioner over a store and network registry.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, registry: NetworkRegistry) -> Self {
        Self { store, registry }
    }

    /// Return the account of `subject` on `network`, generating and
    /// persisting key material on first use.
    ///
    /// Concurrent first-time calls for the same pair converge on a single
    /// account: the store's get-or-create keeps the first write.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` for an unknown network and
    /// `Error::ProvisioningFailed` if key generation or the write fails.
    pub async fn ensure_account(&self, subject: &str, network: &str) -> Result<Account> {
        if let Some(account) = self.account(subject, network).await? {
            return Ok(account);
        }

        let config = self.registry.network(network)?;
        let family = self
            .registry
            .family(config.kind)
            .map_err(|e| Error::ProvisioningFailed(e.to_string()))?;
        let keys = family
            .generate_keys()
            .map_err(|e| Error::ProvisioningFailed(format!("key generation: {e}")))?;

        let candidate = Account {
            subject: subject.to_string(),
            network: network.to_string(),
            keys,
            created_at: Utc::now(),
        };
        let account = self
            .store
            .get_or_create_account(candidate)
            .await
            .map_err(|e| {
                warn!("Failed to persist account for {subject} on {network}: {e}");
                Error::ProvisioningFailed(format!("persist: {e}"))
            })?;

        info!(
            "Provisioned {network} account {} for subject {subject}",
            account.address()
        );
        Ok(account)
    }

    /// Look up an existing account without provisioning.
    ///
    /// # Errors
    ///
    /// Returns an error if the store read fails.
    pub async fn account(&self, subject: &str, network: &str) -> Result<Option<Account>> {
        let account = self.store.account(subject, network).await?;
        debug!(
            "Account lookup {subject}@{network}: {}",
            if account.is_some() { "found" } else { "absent" }
        );
        Ok(account)
    }
}
