//! Deferred-payment invoices.
//!
//! An invoice binds a future payment to one (subject, group, capability)
//! and a duration. Its token is handed out of band (a payment link); anyone
//! holding it can pay through [`crate::EntitlementEngine::quote_invoice`].

use crate::accounts::AccountProvisioner;
use crate::authority::CapabilityAuthority;
use crate::entitlement::lookup_catalog;
use crate::error::{Error, Result};
use crate::event::{GateEvent, GateEventsSender};
use crate::model::{GrantKey, GroupId, Invoice, NetworkId, ResourceId, SubjectId};
use crate::pricing::total_price;
use crate::store::Store;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// A request to issue an invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceRequest {
    /// Subject who will receive the capability.
    pub subject: SubjectId,
    /// Resource group.
    pub group: GroupId,
    /// Resource inside the group.
    pub resource: ResourceId,
    /// Requested duration in seconds.
    pub duration: u64,
}

/// Parameters bound to an invoice token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceDetails {
    /// Subject who will receive the capability.
    pub subject: SubjectId,
    /// Resource group.
    pub group: GroupId,
    /// Resource inside the group.
    pub resource: ResourceId,
    /// Duration in seconds.
    pub duration: u64,
}

/// Issues and resolves invoices.
#[derive(Clone)]
pub struct InvoiceService {
    store: Arc<dyn Store>,
    accounts: AccountProvisioner,
    authority: Arc<dyn CapabilityAuthority>,
    events: GateEventsSender,
    default_network: NetworkId,
}

impl InvoiceService {
    /// Create the service.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        accounts: AccountProvisioner,
        authority: Arc<dyn CapabilityAuthority>,
        events: GateEventsSender,
        default_network: NetworkId,
    ) -> Self {
        Self {
            store,
            accounts,
            authority,
            events,
            default_network,
        }
    }

    /// Issue (or re-issue) the invoice for a request and return it.
    ///
    /// Provisions the subject's account on the default network if needed.
    /// Re-issuing for the same subject, group and capability replaces the
    /// token and duration of the existing invoice.
    ///
    /// # Errors
    ///
    /// - `Error::BadRequest` for missing fields, a disallowed duration or a
    ///   zero price
    /// - `Error::NotFound` for an unknown group, resource, subject or
    ///   capability
    /// - `Error::ProvisioningFailed` if the account cannot be created
    pub async fn create_invoice(&self, request: &InvoiceRequest) -> Result<Invoice> {
        for (name, value) in [
            ("subject", &request.subject),
            ("group", &request.group),
            ("resource", &request.resource),
        ] {
            if value.trim().is_empty() {
                return Err(Error::BadRequest(format!("{name} is required")));
            }
        }
        if request.duration == 0 {
            return Err(Error::BadRequest("duration is required".to_string()));
        }

        let (group, resource) = lookup_catalog(
            self.store.as_ref(),
            &request.group,
            &request.resource,
            request.duration,
        )
        .await?;
        total_price(
            resource.price_per_unit,
            request.duration,
            resource.price_unit_seconds,
        )?;

        if !self
            .authority
            .resolve_subject(&group.id, &request.subject)
            .await?
        {
            return Err(Error::NotFound(format!(
                "subject {} in group {}",
                request.subject, group.id
            )));
        }
        if !self
            .authority
            .resolve_capability(&group.id, &resource.capability)
            .await?
        {
            return Err(Error::NotFound(format!(
                "capability {} in group {}",
                resource.capability, group.id
            )));
        }

        self.accounts
            .ensure_account(&request.subject, &self.default_network)
            .await?;

        let key = GrantKey {
            subject: request.subject.clone(),
            group: group.id,
            capability: resource.capability,
        };
        let invoice = self
            .store
            .upsert_invoice(
                key.clone(),
                resource.id,
                request.duration,
                Uuid::new_v4().to_string(),
            )
            .await?;

        info!("Issued invoice for {key} ({}s)", invoice.duration);
        let _ = self.events.send(GateEvent::InvoiceIssued {
            key,
            duration: invoice.duration,
        });
        Ok(invoice)
    }

    /// Parameters bound to `token`.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if the token is unknown or already paid.
    pub async fn resolve_invoice(&self, token: &str) -> Result<InvoiceDetails> {
        let invoice = self
            .store
            .invoice_by_token(token)
            .await?
            .ok_or_else(|| Error::NotFound("invoice".to_string()))?;
        Ok(InvoiceDetails {
            subject: invoice.key.subject,
            group: invoice.key.group,
            resource: invoice.resource,
            duration: invoice.duration,
        })
    }
}
