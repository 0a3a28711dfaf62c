//! Test harness that assembles a gateway around in-process collaborators.
//!
//! The `TestHarness` builds a real [`RunningGate`] through [`GateBuilder`],
//! with the external world replaced by controllable doubles:
//! - a recording capability authority
//! - a scripted facilitator
//! - fixed-balance network families

use async_trait::async_trait;
use parking_lot::Mutex;
use rolegate::config::{GroupConfig, ResourceConfig, StorageConfig};
use rolegate::model::KeyMaterial;
use rolegate::network::{AccountModelFamily, EvmFamily, NetworkConfig, NetworkFamily, NetworkKind};
use rolegate::payment::{
    Facilitator, PaymentPayload, PaymentRequirement, SettleResponse, VerifyResponse,
};
use rolegate::{
    AccessRequest, CapabilityAuthority, EntitlementEngine, Error, GateBuilder, GateConfig,
    PaymentProof, Result, RunningGate,
};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Group every test resource lives in.
pub const GROUP: &str = "guild-1";
/// Priced at 1,000,000 atomic units per day, 12h or 24h.
pub const RESOURCE: &str = "vip-channel";
/// Capability granted by [`RESOURCE`].
pub const CAPABILITY: &str = "role-vip";
/// Priced at 1 atomic unit per day, any duration.
pub const CHEAP_RESOURCE: &str = "lobby";
/// Network that settles through the facilitator.
pub const EVM_NETWORK: &str = "base-sepolia";
/// Network gated by balance only.
pub const BALANCE_NETWORK: &str = "solana-devnet";
/// Bearer key of the administrative routes.
pub const API_KEY: &str = "test-key";

/// Capability authority that records attachments in memory.
#[derive(Default)]
pub struct RecordingAuthority {
    members: Mutex<BTreeSet<String>>,
    roles: Mutex<BTreeSet<String>>,
    held: Mutex<BTreeSet<(String, String)>>,
    fail_attach: AtomicBool,
    fail_detach: AtomicBool,
    attaches: AtomicUsize,
    detaches: AtomicUsize,
}

impl RecordingAuthority {
    /// Authority where `members` exist and `roles` exist.
    pub fn with(members: &[&str], roles: &[&str]) -> Self {
        let authority = Self::default();
        authority
            .members
            .lock()
            .extend(members.iter().map(ToString::to_string));
        authority
            .roles
            .lock()
            .extend(roles.iter().map(ToString::to_string));
        authority
    }

    /// Whether `subject` currently holds `capability`.
    pub fn holds(&self, subject: &str, capability: &str) -> bool {
        self.held
            .lock()
            .contains(&(subject.to_string(), capability.to_string()))
    }

    /// Make subsequent attaches fail.
    pub fn set_fail_attach(&self, fail: bool) {
        self.fail_attach.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent detaches fail.
    pub fn set_fail_detach(&self, fail: bool) {
        self.fail_detach.store(fail, Ordering::SeqCst);
    }

    /// Remove a member from the group.
    pub fn remove_member(&self, subject: &str) {
        self.members.lock().remove(subject);
    }

    /// Number of successful attaches.
    pub fn attach_count(&self) -> usize {
        self.attaches.load(Ordering::SeqCst)
    }

    /// Number of successful detaches.
    pub fn detach_count(&self) -> usize {
        self.detaches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CapabilityAuthority for RecordingAuthority {
    async fn resolve_subject(&self, _group: &str, subject: &str) -> Result<bool> {
        Ok(self.members.lock().contains(subject))
    }

    async fn resolve_capability(&self, _group: &str, capability: &str) -> Result<bool> {
        Ok(self.roles.lock().contains(capability))
    }

    async fn attach(&self, subject: &str, _group: &str, capability: &str) -> Result<()> {
        if self.fail_attach.load(Ordering::SeqCst) {
            return Err(Error::AuthorityUnavailable("attach disabled".into()));
        }
        self.held
            .lock()
            .insert((subject.to_string(), capability.to_string()));
        self.attaches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn detach(&self, subject: &str, _group: &str, capability: &str) -> Result<()> {
        if self.fail_detach.load(Ordering::SeqCst) {
            return Err(Error::AuthorityUnavailable("detach disabled".into()));
        }
        self.held
            .lock()
            .remove(&(subject.to_string(), capability.to_string()));
        self.detaches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// How the scripted facilitator answers settle calls.
#[derive(Debug, Clone)]
pub enum SettleScript {
    /// Settle succeeds with this transaction reference.
    Success(String),
    /// Settle reports a definite failure.
    Failure(String),
    /// Settle succeeds after a delay.
    Slow(Duration),
    /// Settle never answers.
    Hang,
}

/// Facilitator with scripted answers.
pub struct ScriptedFacilitator {
    reject_reason: Mutex<Option<String>>,
    settle: Mutex<SettleScript>,
    verifies: AtomicUsize,
    settles: AtomicUsize,
}

impl Default for ScriptedFacilitator {
    fn default() -> Self {
        Self {
            reject_reason: Mutex::new(None),
            settle: Mutex::new(SettleScript::Success("0xsettled".into())),
            verifies: AtomicUsize::new(0),
            settles: AtomicUsize::new(0),
        }
    }
}

impl ScriptedFacilitator {
    /// Reject every verify with `reason`, or accept when `None`.
    pub fn reject_with(&self, reason: Option<&str>) {
        *self.reject_reason.lock() = reason.map(ToString::to_string);
    }

    /// Script the settle answer.
    pub fn settle_with(&self, script: SettleScript) {
        *self.settle.lock() = script;
    }

    /// Number of verify calls.
    pub fn verify_count(&self) -> usize {
        self.verifies.load(Ordering::SeqCst)
    }

    /// Number of settle calls.
    pub fn settle_count(&self) -> usize {
        self.settles.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Facilitator for ScriptedFacilitator {
    async fn verify(
        &self,
        _payload: &PaymentPayload,
        _requirement: &PaymentRequirement,
    ) -> Result<VerifyResponse> {
        self.verifies.fetch_add(1, Ordering::SeqCst);
        let reason = self.reject_reason.lock().clone();
        Ok(VerifyResponse {
            is_valid: reason.is_none(),
            invalid_reason: reason,
            payer: Some("0xpayer".into()),
        })
    }

    async fn settle(
        &self,
        _payload: &PaymentPayload,
        requirement: &PaymentRequirement,
    ) -> Result<SettleResponse> {
        self.settles.fetch_add(1, Ordering::SeqCst);
        let script = self.settle.lock().clone();
        match script {
            SettleScript::Success(transaction) => Ok(SettleResponse {
                success: true,
                payer: Some("0xpayer".into()),
                transaction,
                network: requirement.network.clone(),
                ..SettleResponse::default()
            }),
            SettleScript::Failure(reason) => Ok(SettleResponse {
                success: false,
                error_reason: Some(reason),
                payer: Some("0xpayer".into()),
                ..SettleResponse::default()
            }),
            SettleScript::Slow(delay) => {
                tokio::time::sleep(delay).await;
                Ok(SettleResponse {
                    success: true,
                    payer: Some("0xpayer".into()),
                    transaction: "0xslow".into(),
                    network: requirement.network.clone(),
                    ..SettleResponse::default()
                })
            }
            SettleScript::Hang => {
                std::future::pending::<()>().await;
                Ok(SettleResponse::default())
            }
        }
    }
}

/// Network family reporting a settable balance for every address.
pub struct FixedBalanceFamily {
    kind: NetworkKind,
    balance: Mutex<Option<u128>>,
}

impl FixedBalanceFamily {
    /// Family of `kind` reporting `balance`.
    pub fn new(kind: NetworkKind, balance: u128) -> Self {
        Self {
            kind,
            balance: Mutex::new(Some(balance)),
        }
    }

    /// Set the balance, or make the ledger unavailable with `None`.
    pub fn set_balance(&self, balance: Option<u128>) {
        *self.balance.lock() = balance;
    }
}

#[async_trait]
impl NetworkFamily for FixedBalanceFamily {
    fn kind(&self) -> NetworkKind {
        self.kind
    }

    fn generate_keys(&self) -> Result<KeyMaterial> {
        match self.kind {
            NetworkKind::Evm => EvmFamily::new(reqwest::Client::new()).generate_keys(),
            NetworkKind::AccountModel => {
                AccountModelFamily::new(reqwest::Client::new()).generate_keys()
            }
        }
    }

    async fn query_balance(&self, _network: &NetworkConfig, _address: &str) -> Result<u128> {
        self.balance
            .lock()
            .ok_or_else(|| Error::Network("ledger unreachable".into()))
    }
}

/// Gateway plus handles on its doubles.
pub struct TestHarness {
    /// The gateway under test.
    pub gate: RunningGate,
    /// Recording authority.
    pub authority: Arc<RecordingAuthority>,
    /// Scripted facilitator.
    pub facilitator: Arc<ScriptedFacilitator>,
    /// EVM balances.
    pub evm: Arc<FixedBalanceFamily>,
    /// Account-model balances.
    pub account_model: Arc<FixedBalanceFamily>,
    nonce: AtomicUsize,
}

impl TestHarness {
    /// Gateway with members `alice` and `bob`, both funded with 2,000,000.
    ///
    /// # Errors
    ///
    /// Returns an error if the gateway fails to build.
    pub async fn setup() -> Result<Self> {
        Self::setup_with_config(Self::config()).await
    }

    /// Gateway built from a custom configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the gateway fails to build.
    pub async fn setup_with_config(config: GateConfig) -> Result<Self> {
        info!("Setting up test harness");
        let authority = Arc::new(RecordingAuthority::with(
            &["alice", "bob"],
            &[CAPABILITY, "role-lobby"],
        ));
        let facilitator = Arc::new(ScriptedFacilitator::default());
        let evm = Arc::new(FixedBalanceFamily::new(NetworkKind::Evm, 2_000_000));
        let account_model = Arc::new(FixedBalanceFamily::new(NetworkKind::AccountModel, 2_000_000));

        let gate = GateBuilder::new(config)
            .with_authority(authority.clone())
            .with_facilitator(facilitator.clone())
            .with_family(evm.clone())
            .with_family(account_model.clone())
            .build()
            .await?;

        Ok(Self {
            gate,
            authority,
            facilitator,
            evm,
            account_model,
            nonce: AtomicUsize::new(0),
        })
    }

    /// Default configuration: in-memory store, one group, two resources.
    pub fn config() -> GateConfig {
        let mut config = GateConfig {
            storage: StorageConfig {
                persist: false,
                path: None,
            },
            api_key: Some(API_KEY.into()),
            groups: vec![GroupConfig {
                id: GROUP.into(),
                receivers: [
                    (
                        EVM_NETWORK.to_string(),
                        "0x209693Bc6afc0C5328bA36FaF03C514EF312287C".to_string(),
                    ),
                    (
                        BALANCE_NETWORK.to_string(),
                        "4zMMC9srt5Ri5X14GAgXhaHii3GnPAEERYPJgZJDncDU".to_string(),
                    ),
                ]
                .into(),
                default_resource: Some(RESOURCE.into()),
                resources: vec![
                    ResourceConfig {
                        id: RESOURCE.into(),
                        capability: CAPABILITY.into(),
                        price_per_unit: 1_000_000,
                        price_unit_seconds: 86_400,
                        allowed_durations: vec![43_200, 86_400],
                    },
                    ResourceConfig {
                        id: CHEAP_RESOURCE.into(),
                        capability: "role-lobby".into(),
                        price_per_unit: 1,
                        price_unit_seconds: 86_400,
                        allowed_durations: Vec::new(),
                    },
                ],
            }],
            ..GateConfig::default()
        };
        config.facilitator.settle_timeout_secs = 1;
        config.sweeper.enabled = false;
        config
    }

    /// The entitlement engine.
    pub fn engine(&self) -> &EntitlementEngine {
        self.gate.engine()
    }

    /// Provision `subject` on `network`.
    ///
    /// # Errors
    ///
    /// Returns an error if provisioning fails.
    pub async fn provision(&self, subject: &str, network: &str) -> Result<()> {
        self.engine()
            .accounts()
            .ensure_account(subject, network)
            .await
            .map(|_| ())
    }

    /// Access request for [`RESOURCE`].
    pub fn request(subject: &str, network: &str, duration: u64) -> AccessRequest {
        AccessRequest {
            subject: subject.into(),
            network: network.into(),
            group: GROUP.into(),
            resource: RESOURCE.into(),
            duration,
        }
    }

    /// A fresh, distinct payment header for `network`.
    pub fn proof(&self, network: &str) -> String {
        let nonce = self.nonce.fetch_add(1, Ordering::SeqCst);
        PaymentProof::encode(&PaymentPayload {
            x402_version: 1,
            scheme: "exact".into(),
            network: network.into(),
            payload: json!({
                "signature": format!("0xsig{nonce}"),
                "authorization": { "nonce": format!("0x{nonce:064x}") },
            }),
        })
        .unwrap_or_default()
    }
}

/// Upper bound for operations that talk to a hanging double.
pub const SLOW_CALL: Duration = Duration::from_secs(10);
