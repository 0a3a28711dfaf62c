//! Live balance lookups against each network's ledger.

use crate::error::{Error, Result};
use crate::network::NetworkRegistry;
use std::time::Duration;
use tracing::{debug, warn};

/// Default time allowed for a single balance query.
const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Reads reference-asset balances.
///
/// Every failure, including a timeout, is reported as
/// `Error::BalanceUnavailable`. Callers treat that as insufficient.
#[derive(Clone)]
pub struct BalanceOracle {
    registry: NetworkRegistry,
    query_timeout: Duration,
}

impl BalanceOracle {
    /// Create an oracle with the default query timeout.
    #[must_use]
    pub fn new(registry: NetworkRegistry) -> Self {
        Self::with_timeout(registry, DEFAULT_QUERY_TIMEOUT)
    }

    /// Create an oracle with an explicit query timeout.
    #[must_use]
    pub fn with_timeout(registry: NetworkRegistry, query_timeout: Duration) -> Self {
        Self {
            registry,
            query_timeout,
        }
    }

    /// Balance of `address` on `network`, in atomic units.
    ///
    /// # Errors
    ///
    /// Returns `Error::BalanceUnavailable` if the network is unknown, the
    /// query fails, or it does not answer within the timeout.
    pub async fn get_balance(&self, network: &str, address: &str) -> Result<u128> {
        let config = self
            .registry
            .network(network)
            .map_err(|e| Error::BalanceUnavailable(e.to_string()))?;
        let family = self
            .registry
            .family(config.kind)
            .map_err(|e| Error::BalanceUnavailable(e.to_string()))?;

        match tokio::time::timeout(self.query_timeout, family.query_balance(config, address)).await
        {
            Ok(Ok(balance)) => {
                debug!("Balance of {address} on {network}: {balance}");
                Ok(balance)
            }
            Ok(Err(e)) => {
                warn!("Balance query for {address} on {network} failed: {e}");
                Err(Error::BalanceUnavailable(e.to_string()))
            }
            Err(_) => {
                warn!(
                    "Balance query for {address} on {network} timed out after {:?}",
                    self.query_timeout
                );
                Err(Error::BalanceUnavailable(format!(
                    "timed out after {:?}",
                    self.query_timeout
                )))
            }
        }
    }
}
