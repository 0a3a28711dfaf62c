//! Configuration for rolegate.

use crate::model::{NetworkId, Resource, ResourceGroup, SECONDS_PER_DAY};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Network family, which decides key scheme and balance lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkKind {
    /// secp256k1 accounts, ERC-20 balances (Base, Arbitrum...).
    Evm,
    /// Ed25519 accounts, SPL token balances (Solana).
    AccountModel,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Root directory for gateway data.
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,

    /// HTTP listen address.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Externally visible base URL, used as the payment resource reference.
    #[serde(default = "default_public_url")]
    pub public_url: String,

    /// Bearer key required by the administrative endpoints.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Network used for invoices.
    #[serde(default = "default_network")]
    pub default_network: NetworkId,

    /// Log level.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format.
    #[serde(default)]
    pub log_format: LogFormat,

    /// Storage configuration.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Payment facilitator configuration.
    #[serde(default)]
    pub facilitator: FacilitatorConfig,

    /// Capability authority configuration.
    #[serde(default)]
    pub authority: AuthorityConfig,

    /// Balance oracle configuration.
    #[serde(default)]
    pub balance: BalanceConfig,

    /// Expiry sweeper configuration.
    #[serde(default)]
    pub sweeper: SweeperConfig,

    /// Supported settlement networks.
    #[serde(default = "default_networks")]
    pub networks: Vec<NetworkConfig>,

    /// Resource catalog seeded into the store at start-up.
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Persist the store to disk (false keeps everything in memory).
    #[serde(default = "default_true")]
    pub persist: bool,

    /// Snapshot file; defaults to `{root_dir}/rolegate.db`.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Payment facilitator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FacilitatorConfig {
    /// Facilitator base URL (`/verify` and `/settle` are appended).
    #[serde(default = "default_facilitator_url")]
    pub url: String,

    /// Timeout for a verify call, in seconds.
    #[serde(default = "default_verify_timeout")]
    pub verify_timeout_secs: u64,

    /// Timeout for a settle call, in seconds.
    #[serde(default = "default_settle_timeout")]
    pub settle_timeout_secs: u64,

    /// Validity window advertised for payment proofs, in seconds.
    #[serde(default = "default_max_timeout")]
    pub max_timeout_seconds: u64,

    /// Number of proof digests remembered by the proof ledger.
    #[serde(default = "default_ledger_capacity")]
    pub proof_ledger_capacity: usize,
}

/// Capability authority (Discord) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorityConfig {
    /// REST API base URL.
    #[serde(default = "default_discord_api")]
    pub api_base: String,

    /// Bot token. Usually supplied through the environment.
    #[serde(default, skip_serializing)]
    pub bot_token: Option<String>,

    /// Per-request timeout, in seconds.
    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u64,
}

/// Balance oracle configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceConfig {
    /// Per-query timeout, in seconds.
    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u64,
}

/// Expiry sweeper configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweeperConfig {
    /// Run the sweeper in this process.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds between sweeps.
    #[serde(default = "default_sweep_interval")]
    pub interval_secs: u64,
}

/// A settlement network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Network identifier as it appears in payment requirements.
    pub id: NetworkId,

    /// Network family.
    pub kind: NetworkKind,

    /// JSON-RPC endpoint.
    pub rpc_url: String,

    /// Reference asset (ERC-20 contract or SPL mint).
    pub asset: String,

    /// Decimal places of the asset.
    #[serde(default = "default_decimals")]
    pub asset_decimals: u8,

    /// EIP-712 domain name of the asset.
    #[serde(default = "default_asset_name")]
    pub asset_name: String,

    /// EIP-712 domain version of the asset.
    #[serde(default = "default_asset_version")]
    pub asset_version: String,

    /// Whether access on this network must be paid through the facilitator.
    /// Defaults to true for EVM networks and false for account-model ones.
    #[serde(default)]
    pub settlement_required: Option<bool>,
}

impl NetworkConfig {
    /// Whether a payment proof has to be verified and settled.
    #[must_use]
    pub fn requires_settlement(&self) -> bool {
        self.settlement_required
            .unwrap_or(self.kind == NetworkKind::Evm)
    }
}

/// A resource group in the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    /// Group identifier.
    pub id: String,

    /// Receiver address per network id.
    #[serde(default)]
    pub receivers: std::collections::BTreeMap<NetworkId, String>,

    /// Channel where the purchase panel lives.
    #[serde(default)]
    pub default_resource: Option<String>,

    /// Resources sold in this group.
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
}

/// A resource in the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Resource identifier.
    pub id: String,

    /// Capability granted to buyers.
    pub capability: String,

    /// Price per pricing unit, in atomic asset units.
    pub price_per_unit: u64,

    /// Pricing unit in seconds.
    #[serde(default = "default_price_unit")]
    pub price_unit_seconds: u64,

    /// Allowed durations in seconds. Empty allows any duration.
    #[serde(default)]
    pub allowed_durations: Vec<u64>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            listen: default_listen(),
            public_url: default_public_url(),
            api_key: None,
            default_network: default_network(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            storage: StorageConfig::default(),
            facilitator: FacilitatorConfig::default(),
            authority: AuthorityConfig::default(),
            balance: BalanceConfig::default(),
            sweeper: SweeperConfig::default(),
            networks: default_networks(),
            groups: Vec::new(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            persist: true,
            path: None,
        }
    }
}

impl Default for FacilitatorConfig {
    fn default() -> Self {
        Self {
            url: default_facilitator_url(),
            verify_timeout_secs: default_verify_timeout(),
            settle_timeout_secs: default_settle_timeout(),
            max_timeout_seconds: default_max_timeout(),
            proof_ledger_capacity: default_ledger_capacity(),
        }
    }
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            api_base: default_discord_api(),
            bot_token: None,
            timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for BalanceConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_sweep_interval(),
        }
    }
}

fn default_root_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "rolegate")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".rolegate"))
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 3000))
}

fn default_public_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_network() -> NetworkId {
    "base-sepolia".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_facilitator_url() -> String {
    "https://x402.org/facilitator".to_string()
}

fn default_discord_api() -> String {
    "https://discord.com/api/v10".to_string()
}

fn default_asset_name() -> String {
    "USDC".to_string()
}

fn default_asset_version() -> String {
    "2".to_string()
}

const fn default_true() -> bool {
    true
}

const fn default_verify_timeout() -> u64 {
    15
}

const fn default_settle_timeout() -> u64 {
    30
}

const fn default_max_timeout() -> u64 {
    60
}

const fn default_ledger_capacity() -> usize {
    100_000
}

const fn default_request_timeout() -> u64 {
    10
}

const fn default_sweep_interval() -> u64 {
    60
}

const fn default_decimals() -> u8 {
    6
}

const fn default_price_unit() -> u64 {
    SECONDS_PER_DAY
}

fn default_networks() -> Vec<NetworkConfig> {
    vec![
        NetworkConfig {
            id: "base-sepolia".to_string(),
            kind: NetworkKind::Evm,
            rpc_url: "https://sepolia.base.org".to_string(),
            asset: "0x036CbD53842c5426634e7929541eC2318f3dCF7e".to_string(),
            asset_decimals: default_decimals(),
            asset_name: default_asset_name(),
            asset_version: default_asset_version(),
            settlement_required: None,
        },
        NetworkConfig {
            id: "solana-devnet".to_string(),
            kind: NetworkKind::AccountModel,
            rpc_url: "https://api.devnet.solana.com".to_string(),
            asset: "4zMMC9srt5Ri5X14GAgXhaHii3GnPAEERYPJgZJDncDU".to_string(),
            asset_decimals: default_decimals(),
            asset_name: default_asset_name(),
            asset_version: default_asset_version(),
            settlement_required: None,
        },
    ]
}

impl GroupConfig {
    /// Split into the persisted group and its resources.
    #[must_use]
    pub fn to_records(&self) -> (ResourceGroup, Vec<Resource>) {
        let group = ResourceGroup {
            id: self.id.clone(),
            receivers: self.receivers.clone(),
            default_resource: self.default_resource.clone(),
        };
        let resources = self
            .resources
            .iter()
            .map(|r| Resource {
                id: r.id.clone(),
                group: self.id.clone(),
                price_per_unit: r.price_per_unit,
                price_unit_seconds: r.price_unit_seconds,
                capability: r.capability.clone(),
                allowed_durations: r.allowed_durations.iter().copied().collect(),
            })
            .collect();
        (group, resources)
    }
}

impl GateConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::Error::Config(e.to_string()))
    }

    /// Save configuration to a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn to_file(&self, path: &std::path::Path) -> crate::Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| crate::Error::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Resolved snapshot path, or `None` for a memory-only store.
    #[must_use]
    pub fn storage_path(&self) -> Option<PathBuf> {
        if !self.storage.persist {
            return None;
        }
        Some(
            self.storage
                .path
                .clone()
                .unwrap_or_else(|| self.root_dir.join("rolegate.db")),
        )
    }

    /// Look up a configured network.
    #[must_use]
    pub fn network(&self, id: &str) -> Option<&NetworkConfig> {
        self.networks.iter().find(|n| n.id == id)
    }

    /// Check cross-field invariants.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the first violation found.
    pub fn validate(&self) -> crate::Result<()> {
        let config_err = |msg: String| Err(crate::Error::Config(msg));

        let mut network_ids = BTreeSet::new();
        for network in &self.networks {
            if !network_ids.insert(network.id.as_str()) {
                return config_err(format!("duplicate network id '{}'", network.id));
            }
            if network.asset_decimals > 30 {
                return config_err(format!(
                    "network '{}': asset_decimals {} is out of range",
                    network.id, network.asset_decimals
                ));
            }
        }

        if self.network(&self.default_network).is_none() {
            return config_err(format!(
                "default network '{}' is not configured",
                self.default_network
            ));
        }

        let mut group_ids = BTreeSet::new();
        let mut resource_ids = BTreeSet::new();
        for group in &self.groups {
            if !group_ids.insert(group.id.as_str()) {
                return config_err(format!("duplicate group id '{}'", group.id));
            }
            for id in &network_ids {
                match group.receivers.get(*id) {
                    Some(addr) if !addr.trim().is_empty() => {}
                    _ => {
                        return config_err(format!(
                            "group '{}' has no receiver for network '{id}'",
                            group.id
                        ))
                    }
                }
            }
            if let Some(unknown) = group.receivers.keys().find(|k| !network_ids.contains(k.as_str())) {
                return config_err(format!(
                    "group '{}' names unknown network '{unknown}'",
                    group.id
                ));
            }
            for resource in &group.resources {
                if !resource_ids.insert(resource.id.as_str()) {
                    return config_err(format!("duplicate resource id '{}'", resource.id));
                }
                if resource.price_per_unit == 0 {
                    return config_err(format!("resource '{}' has a zero price", resource.id));
                }
                if resource.price_unit_seconds == 0 {
                    return config_err(format!(
                        "resource '{}' has a zero pricing unit",
                        resource.id
                    ));
                }
                let unique: BTreeSet<_> = resource.allowed_durations.iter().collect();
                if unique.len() != resource.allowed_durations.len()
                    || resource.allowed_durations.contains(&0)
                {
                    return config_err(format!(
                        "resource '{}' has zero or duplicate allowed durations",
                        resource.id
                    ));
                }
            }
        }

        Ok(())
    }

    /// Facilitator verify timeout.
    #[must_use]
    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.facilitator.verify_timeout_secs)
    }

    /// Facilitator settle timeout.
    #[must_use]
    pub fn settle_timeout(&self) -> Duration {
        Duration::from_secs(self.facilitator.settle_timeout_secs)
    }

    /// Interval between sweeps.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweeper.interval_secs.max(1))
    }
}
