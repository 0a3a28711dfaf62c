//! Entitlement engine: from an access request to a recorded grant.
//!
//! A request is handled in two steps. [`EntitlementEngine::quote`] runs
//! every precondition and prices the request without side effects:
//!
//! ```text
//! validate ─► catalog + duration ─► network ─► account ─► price
//!          ─► balance ─► resolve subject/capability ─► payment terms
//! ```
//!
//! [`EntitlementEngine::fulfil`] then collects payment (nothing for
//! balance-only networks, verify + settle otherwise) and commits the grant.
//! The grant record is written before the capability is attached, so a
//! capability is never held without a record the sweeper can revoke.

use crate::accounts::AccountProvisioner;
use crate::authority::CapabilityAuthority;
use crate::balance::BalanceOracle;
use crate::config::GateConfig;
use crate::error::{Error, Result};
use crate::event::{GateEvent, GateEventsSender};
use crate::model::{Grant, GrantKey, Invoice, NetworkId, Resource, ResourceGroup};
use crate::network::NetworkRegistry;
use crate::payment::{PaymentGateway, PaymentProof, PaymentRequirement, Price, Settlement};
use crate::pricing::total_price;
use crate::store::Store;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// A request for timed access to a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRequest {
    /// Subject asking for access.
    pub subject: String,
    /// Network the subject pays on.
    pub network: String,
    /// Resource group.
    pub group: String,
    /// Resource inside the group.
    pub resource: String,
    /// Requested duration in seconds.
    pub duration: u64,
}

impl AccessRequest {
    /// Check that every field is present.
    ///
    /// # Errors
    ///
    /// Returns `Error::BadRequest` naming the first missing field.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("subject", &self.subject),
            ("network", &self.network),
            ("group", &self.group),
            ("resource", &self.resource),
        ] {
            if value.trim().is_empty() {
                return Err(Error::BadRequest(format!("{name} is required")));
            }
        }
        if self.duration == 0 {
            return Err(Error::BadRequest("duration is required".to_string()));
        }
        Ok(())
    }
}

/// How a quote must be paid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentTerms {
    /// The balance check already passed; no proof is needed.
    BalanceOnly,
    /// A proof satisfying one of these requirements must be settled.
    Settlement(Vec<PaymentRequirement>),
}

/// A fully checked and priced request.
#[derive(Debug, Clone)]
pub struct Quote {
    /// Grant being bought.
    pub key: GrantKey,
    /// Resource being bought.
    pub resource: Resource,
    /// Network paid on.
    pub network: NetworkId,
    /// Duration in seconds.
    pub duration: u64,
    /// Price in atomic units.
    pub price: u128,
    /// Payment terms.
    pub terms: PaymentTerms,
}

impl Quote {
    /// Acceptable payment requirements, empty for balance-only terms.
    #[must_use]
    pub fn accepts(&self) -> &[PaymentRequirement] {
        match &self.terms {
            PaymentTerms::BalanceOnly => &[],
            PaymentTerms::Settlement(accepts) => accepts,
        }
    }
}

/// Result of a fulfilled quote.
#[derive(Debug, Clone)]
pub struct AccessOutcome {
    /// The grant as committed.
    pub grant: Grant,
    /// Settlement, if payment was collected through the facilitator.
    pub settlement: Option<Settlement>,
    /// Invoice fulfilled by this grant, if one was outstanding.
    pub fulfilled_invoice: Option<Invoice>,
}

/// Engine settings taken from the gateway configuration.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Base URL used to build payment resource references.
    pub public_url: String,
    /// Network invoices are paid on.
    pub default_network: NetworkId,
    /// Time allowed for a balance query.
    pub balance_timeout: Duration,
}

impl EngineSettings {
    /// Extract the engine settings from a configuration.
    #[must_use]
    pub fn from_config(config: &GateConfig) -> Self {
        Self {
            public_url: config.public_url.trim_end_matches('/').to_string(),
            default_network: config.default_network.clone(),
            balance_timeout: Duration::from_secs(config.balance.timeout_secs),
        }
    }
}

/// Look up `resource` in `group` and check the requested duration.
///
/// # Errors
///
/// Returns `Error::NotFound` if the group or resource is missing (or the
/// resource belongs to another group) and `Error::BadRequest` if the
/// duration is not allowed.
pub async fn lookup_catalog(
    store: &dyn Store,
    group: &str,
    resource: &str,
    duration: u64,
) -> Result<(ResourceGroup, Resource)> {
    let group_record = store
        .group(group)
        .await?
        .ok_or_else(|| Error::NotFound(format!("group '{group}'")))?;
    let resource_record = store
        .resource(resource)
        .await?
        .filter(|r| r.group == group_record.id)
        .ok_or_else(|| Error::NotFound(format!("resource '{resource}' in group '{group}'")))?;

    if !resource_record.allows_duration(duration) {
        return Err(Error::BadRequest(format!(
            "duration {duration}s is not offered for resource '{resource}'"
        )));
    }
    Ok((group_record, resource_record))
}

/// Expiry of a grant written at `now` for `duration` seconds.
///
/// # Errors
///
/// Returns `Error::BadRequest` if the expiry is not representable.
pub fn expiry_after(now: DateTime<Utc>, duration: u64) -> Result<DateTime<Utc>> {
    i64::try_from(duration)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .and_then(|delta| now.checked_add_signed(delta))
        .ok_or_else(|| Error::BadRequest(format!("duration {duration}s is too long")))
}

/// Grants access in exchange for payment.
#[derive(Clone)]
pub struct EntitlementEngine {
    store: Arc<dyn Store>,
    registry: NetworkRegistry,
    accounts: AccountProvisioner,
    balances: BalanceOracle,
    gateway: PaymentGateway,
    authority: Arc<dyn CapabilityAuthority>,
    events: GateEventsSender,
    settings: EngineSettings,
}

impl EntitlementEngine {
    /// Wire an engine from its collaborators.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        registry: NetworkRegistry,
        gateway: PaymentGateway,
        authority: Arc<dyn CapabilityAuthority>,
        events: GateEventsSender,
        settings: EngineSettings,
    ) -> Self {
        Self {
            accounts: AccountProvisioner::new(Arc::clone(&store), registry.clone()),
            balances: BalanceOracle::with_timeout(registry.clone(), settings.balance_timeout),
            store,
            registry,
            gateway,
            authority,
            events,
            settings,
        }
    }

    /// Configured networks.
    #[must_use]
    pub fn registry(&self) -> &NetworkRegistry {
        &self.registry
    }

    /// The account provisioner.
    #[must_use]
    pub fn accounts(&self) -> &AccountProvisioner {
        &self.accounts
    }

    /// The balance oracle.
    #[must_use]
    pub fn balances(&self) -> &BalanceOracle {
        &self.balances
    }

    /// The payment gateway.
    #[must_use]
    pub fn gateway(&self) -> &PaymentGateway {
        &self.gateway
    }

    /// The settings.
    #[must_use]
    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Check and price a synchronous access request.
    ///
    /// # Errors
    ///
    /// - `Error::BadRequest` for missing fields, a disallowed duration or a
    ///   price that rounds to zero
    /// - `Error::NotFound` for an unknown group, resource, network, subject
    ///   or capability, or a subject without an account on the network
    /// - `Error::InsufficientBalance` if the balance is below the price or
    ///   cannot be established
    /// - `Error::AuthorityUnavailable` if the authority cannot answer
    pub async fn quote(&self, request: &AccessRequest) -> Result<Quote> {
        request.validate()?;
        let (group, resource) = lookup_catalog(
            self.store.as_ref(),
            &request.group,
            &request.resource,
            request.duration,
        )
        .await?;
        let network = self.registry.network(&request.network)?.clone();

        let account = self
            .accounts
            .account(&request.subject, &network.id)
            .await?
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "no {} account for subject {}",
                    network.id, request.subject
                ))
            })?;

        let price = total_price(
            resource.price_per_unit,
            request.duration,
            resource.price_unit_seconds,
        )?;
        expiry_after(Utc::now(), request.duration)?;

        match self.balances.get_balance(&network.id, account.address()).await {
            Ok(balance) if balance >= price => {
                debug!("Balance {balance} covers price {price}");
            }
            Ok(balance) => {
                info!(
                    "Subject {} has {balance} on {}, needs {price}",
                    request.subject, network.id
                );
                return Err(Error::InsufficientBalance {
                    required: price,
                    available: Some(balance),
                });
            }
            Err(e) => {
                warn!("Treating unavailable balance as insufficient: {e}");
                return Err(Error::InsufficientBalance {
                    required: price,
                    available: None,
                });
            }
        }

        self.resolve(&group.id, &request.subject, &resource.capability)
            .await?;

        let key = GrantKey {
            subject: request.subject.clone(),
            group: group.id.clone(),
            capability: resource.capability.clone(),
        };
        let terms = if network.requires_settlement() {
            let resource_ref = format!("{}/api/user/access", self.settings.public_url);
            PaymentTerms::Settlement(vec![self.requirement(
                &group,
                &network.id,
                price,
                &resource_ref,
            )?])
        } else {
            PaymentTerms::BalanceOnly
        };

        Ok(Quote {
            key,
            resource,
            network: network.id,
            duration: request.duration,
            price,
            terms,
        })
    }

    /// Check and price the payment of an invoice.
    ///
    /// The invoice's bound parameters are quoted on the default network.
    /// Whoever presents the proof pays, so the subject's custodial balance
    /// is not consulted and settlement is always required.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if the invoice is unknown or already paid,
    /// plus the catalog, pricing and authority errors of [`Self::quote`].
    pub async fn quote_invoice(&self, token: &str) -> Result<Quote> {
        let invoice = self
            .store
            .invoice_by_token(token)
            .await?
            .ok_or_else(|| Error::NotFound("invoice".to_string()))?;
        let (group, resource) = lookup_catalog(
            self.store.as_ref(),
            &invoice.key.group,
            &invoice.resource,
            invoice.duration,
        )
        .await?;
        let network = self.registry.network(&self.settings.default_network)?.clone();

        let price = total_price(
            resource.price_per_unit,
            invoice.duration,
            resource.price_unit_seconds,
        )?;
        expiry_after(Utc::now(), invoice.duration)?;

        self.resolve(&group.id, &invoice.key.subject, &resource.capability)
            .await?;

        let resource_ref = format!(
            "{}/api/user/invoice/{token}/pay",
            self.settings.public_url
        );
        let requirement = self.requirement(&group, &network.id, price, &resource_ref)?;

        Ok(Quote {
            key: GrantKey {
                subject: invoice.key.subject,
                group: group.id,
                capability: resource.capability.clone(),
            },
            resource,
            network: network.id,
            duration: invoice.duration,
            price,
            terms: PaymentTerms::Settlement(vec![requirement]),
        })
    }

    /// Collect payment for `quote` and commit the grant.
    ///
    /// `proof` is the raw `X-PAYMENT` header value. It is ignored for
    /// balance-only terms.
    ///
    /// Payment and commit run on a detached task: once started they finish
    /// even if the caller's future is dropped, so a settled payment always
    /// ends in a grant and an unknown settle outcome is always reported.
    ///
    /// # Errors
    ///
    /// - `Error::PaymentRequired` if settlement is required and no proof
    ///   was presented
    /// - the payment errors of [`PaymentGateway::verify`] and
    ///   [`PaymentGateway::settle`]; no grant is written
    /// - `Error::Storage` if the grant cannot be recorded
    /// - `Error::Task` if the fulfilment task panicked
    pub async fn fulfil(&self, quote: Quote, proof: Option<&str>) -> Result<AccessOutcome> {
        let engine = self.clone();
        let proof = proof.map(ToString::to_string);
        tokio::spawn(async move { engine.pay_and_commit(quote, proof.as_deref()).await })
            .await
            .map_err(|e| {
                error!("Fulfilment task failed: {e}");
                Error::Task(e.to_string())
            })?
    }

    async fn pay_and_commit(&self, quote: Quote, proof: Option<&str>) -> Result<AccessOutcome> {
        let settlement = match &quote.terms {
            PaymentTerms::BalanceOnly => None,
            PaymentTerms::Settlement(accepts) => {
                let header = proof.ok_or(Error::PaymentRequired)?;
                let proof = PaymentProof::decode(header)?;
                let verified = self.gateway.verify(&proof, accepts).await?;
                match self.gateway.settle(verified).await {
                    Ok(settlement) => Some(settlement),
                    Err(e) => {
                        if let Error::SettlementAmbiguous { reason, payer } = &e {
                            let _ = self.events.send(GateEvent::SettlementAmbiguous {
                                key: quote.key.clone(),
                                payer: payer.clone(),
                                reason: reason.clone(),
                            });
                        }
                        return Err(e);
                    }
                }
            }
        };

        self.commit(quote, settlement).await
    }

    /// Quote and fulfil in one call.
    ///
    /// # Errors
    ///
    /// See [`Self::quote`] and [`Self::fulfil`].
    pub async fn request_access(
        &self,
        request: &AccessRequest,
        proof: Option<&str>,
    ) -> Result<AccessOutcome> {
        let quote = self.quote(request).await?;
        self.fulfil(quote, proof).await
    }

    async fn commit(&self, quote: Quote, settlement: Option<Settlement>) -> Result<AccessOutcome> {
        let now = Utc::now();
        let expires_at = expiry_after(now, quote.duration)?;
        let mut grant = Grant {
            key: quote.key,
            resource: quote.resource.id,
            granted_at: now,
            expires_at,
            attached: false,
        };

        let fulfilled_invoice = self.store.commit_grant(grant.clone()).await.map_err(|e| {
            error!(
                "Payment collected but grant {} could not be recorded: {e}",
                grant.key
            );
            let _ = self.events.send(GateEvent::Error {
                message: format!("grant {} not recorded after payment: {e}", grant.key),
            });
            e
        })?;

        let key = &grant.key;
        match self
            .authority
            .attach(&key.subject, &key.group, &key.capability)
            .await
        {
            Ok(()) => {
                grant.attached = self.store.mark_grant_attached(key, expires_at).await?;
            }
            Err(e) => {
                warn!("Attach deferred for {key}: {e}");
                let _ = self.events.send(GateEvent::AttachDeferred {
                    key: key.clone(),
                    reason: e.to_string(),
                });
            }
        }

        info!(
            "Granted {} until {} (attached: {})",
            grant.key, grant.expires_at, grant.attached
        );
        let _ = self.events.send(GateEvent::AccessGranted {
            key: grant.key.clone(),
            expires_at: grant.expires_at,
            transaction: settlement
                .as_ref()
                .map(|s| s.response.transaction.clone()),
        });

        Ok(AccessOutcome {
            grant,
            settlement,
            fulfilled_invoice,
        })
    }

    async fn resolve(&self, group: &str, subject: &str, capability: &str) -> Result<()> {
        if !self.authority.resolve_subject(group, subject).await? {
            return Err(Error::NotFound(format!(
                "subject {subject} in group {group}"
            )));
        }
        if !self.authority.resolve_capability(group, capability).await? {
            return Err(Error::NotFound(format!(
                "capability {capability} in group {group}"
            )));
        }
        Ok(())
    }

    fn requirement(
        &self,
        group: &ResourceGroup,
        network: &str,
        price: u128,
        resource_ref: &str,
    ) -> Result<PaymentRequirement> {
        let config = self.registry.network(network)?;
        let pay_to = group.receiver(network).ok_or_else(|| {
            Error::Config(format!("group '{}' has no receiver on {network}", group.id))
        })?;
        self.gateway.build_requirement(
            &Price::Atomic(price),
            config,
            resource_ref,
            pay_to,
            "Get access to role",
        )
    }
}
