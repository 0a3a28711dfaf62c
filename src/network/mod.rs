//! Settlement network families.
//!
//! Each [`NetworkKind`] has one [`NetworkFamily`] implementation that knows
//! how to generate account keys and read the reference-asset balance of an
//! address. Business logic only ever talks to the trait:
//!
//! ```text
//!            NetworkRegistry
//!   network id ──► NetworkConfig ──► kind ──► Arc<dyn NetworkFamily>
//!                                              ├─ EvmFamily           (secp256k1, ERC-20 balanceOf)
//!                                              └─ AccountModelFamily  (Ed25519, SPL token accounts)
//! ```

mod account_model;
mod evm;

pub use account_model::{parse_pubkey, AccountModelFamily};
pub use evm::{address_from_key, parse_address, to_checksum_address, EvmFamily};

pub use crate::config::{NetworkConfig, NetworkKind};

use crate::error::{Error, Result};
use crate::model::{KeyMaterial, NetworkId};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Key generation and balance lookup for one network family.
#[async_trait]
pub trait NetworkFamily: Send + Sync {
    /// The family this implementation serves.
    fn kind(&self) -> NetworkKind;

    /// Generate fresh key material in the family's native encoding.
    ///
    /// # Errors
    ///
    /// Returns an error if key generation fails.
    fn generate_keys(&self) -> Result<KeyMaterial>;

    /// Read the reference-asset balance of `address`, in atomic units.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger cannot be queried or the response is
    /// malformed.
    async fn query_balance(&self, network: &NetworkConfig, address: &str) -> Result<u128>;
}

/// Check that `address` is well formed for the given family.
#[must_use]
pub fn is_valid_address(kind: NetworkKind, address: &str) -> bool {
    match kind {
        NetworkKind::Evm => parse_address(address).is_ok(),
        NetworkKind::AccountModel => parse_pubkey(address).is_ok(),
    }
}

/// Configured networks and the family implementation for each kind.
#[derive(Clone)]
pub struct NetworkRegistry {
    networks: BTreeMap<NetworkId, NetworkConfig>,
    families: HashMap<NetworkKind, Arc<dyn NetworkFamily>>,
}

impl NetworkRegistry {
    /// Create a registry with no family implementations registered.
    #[must_use]
    pub fn new(networks: impl IntoIterator<Item = NetworkConfig>) -> Self {
        Self {
            networks: networks.into_iter().map(|n| (n.id.clone(), n)).collect(),
            families: HashMap::new(),
        }
    }

    /// Create a registry backed by the JSON-RPC families.
    #[must_use]
    pub fn with_rpc(
        networks: impl IntoIterator<Item = NetworkConfig>,
        http: reqwest::Client,
    ) -> Self {
        Self::new(networks)
            .with_family(Arc::new(EvmFamily::new(http.clone())))
            .with_family(Arc::new(AccountModelFamily::new(http)))
    }

    /// Register (or replace) the implementation for a family.
    #[must_use]
    pub fn with_family(mut self, family: Arc<dyn NetworkFamily>) -> Self {
        self.families.insert(family.kind(), family);
        self
    }

    /// Look up a network by id.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if the network is not configured.
    pub fn network(&self, id: &str) -> Result<&NetworkConfig> {
        self.networks
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("network '{id}'")))
    }

    /// Implementation for a family.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if no implementation is registered.
    pub fn family(&self, kind: NetworkKind) -> Result<Arc<dyn NetworkFamily>> {
        self.families
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::Config(format!("no implementation registered for {kind:?}")))
    }

    /// All configured networks, ordered by id.
    pub fn networks(&self) -> impl Iterator<Item = &NetworkConfig> {
        self.networks.values()
    }
}

/// Issue a JSON-RPC 2.0 call and return its `result` member.
pub(crate) async fn rpc_call(
    http: &reqwest::Client,
    url: &str,
    method: &str,
    params: Value,
) -> Result<Value> {
    debug!("RPC {method} -> {url}");
    let body = json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": method,
        "params": params,
    });

    let response = http
        .post(url)
        .json(&body)
        .send()
        .await
        .map_err(|e| Error::Network(format!("{method} request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(Error::Network(format!("{method} returned HTTP {status}")));
    }

    let mut payload: Value = response
        .json()
        .await
        .map_err(|e| Error::Serialization(format!("{method} response is not JSON: {e}")))?;

    if let Some(err) = payload.get("error") {
        return Err(Error::Network(format!("{method} failed: {err}")));
    }

    payload
        .get_mut("result")
        .map(Value::take)
        .ok_or_else(|| Error::Serialization(format!("{method} response has no result")))
}
