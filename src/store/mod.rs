//! Persistence for the catalog, accounts, grants and invoices.
//!
//! The store is the only shared mutable state in the gateway. Every write
//! goes through one of the operations below; grants and invoices are keyed
//! by [`GrantKey`] so concurrent writers converge on one row (last write
//! wins) instead of duplicating it.

mod local;

pub use local::{LocalStore, StoreStats};

use crate::error::Result;
use crate::model::{
    Account, Grant, GrantKey, GroupId, Invoice, Resource, ResourceGroup, ResourceId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Transactional store operations.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert or replace a resource group.
    async fn upsert_group(&self, group: ResourceGroup) -> Result<()>;

    /// Fetch a resource group.
    async fn group(&self, id: &str) -> Result<Option<ResourceGroup>>;

    /// All resource groups, ordered by id.
    async fn groups(&self) -> Result<Vec<ResourceGroup>>;

    /// Insert or replace a resource.
    ///
    /// Refuses with `Error::Conflict` to change the price, pricing unit or
    /// capability of a resource while a grant references its capability.
    async fn upsert_resource(&self, resource: Resource) -> Result<()>;

    /// Fetch a resource by id.
    async fn resource(&self, id: &str) -> Result<Option<Resource>>;

    /// Resources of a group, ordered by id.
    async fn resources_in(&self, group: &GroupId) -> Result<Vec<Resource>>;

    /// Fetch the account of `subject` on `network`.
    async fn account(&self, subject: &str, network: &str) -> Result<Option<Account>>;

    /// Return the stored account for `(account.subject, account.network)`,
    /// inserting `account` first if there is none. Atomic.
    async fn get_or_create_account(&self, account: Account) -> Result<Account>;

    /// Fetch a grant.
    async fn grant(&self, key: &GrantKey) -> Result<Option<Grant>>;

    /// Upsert `grant` and, in the same transaction, delete the invoice with
    /// the same key. Returns the deleted invoice, if any.
    async fn commit_grant(&self, grant: Grant) -> Result<Option<Invoice>>;

    /// Grants whose expiry is before `now`.
    async fn expired_grants(&self, now: DateTime<Utc>) -> Result<Vec<Grant>>;

    /// Unexpired grants still waiting for their capability to be attached.
    async fn unattached_grants(&self, now: DateTime<Utc>) -> Result<Vec<Grant>>;

    /// Flag a grant's capability as attached. Returns false if the grant is
    /// gone or was rewritten since `expires_at` was read.
    async fn mark_grant_attached(&self, key: &GrantKey, expires_at: DateTime<Utc>)
        -> Result<bool>;

    /// Delete a grant if its expiry still equals `expires_at`, so a renewal
    /// racing with the sweeper is never dropped. Returns true if deleted.
    async fn delete_grant(&self, key: &GrantKey, expires_at: DateTime<Utc>) -> Result<bool>;

    /// Create or re-issue the invoice for `key`: an existing row keeps its
    /// creation time and gets the new token, resource and duration.
    async fn upsert_invoice(
        &self,
        key: GrantKey,
        resource: ResourceId,
        duration: u64,
        token: String,
    ) -> Result<Invoice>;

    /// Look up an invoice by token.
    async fn invoice_by_token(&self, token: &str) -> Result<Option<Invoice>>;

    /// Fetch the invoice for a key.
    async fn invoice(&self, key: &GrantKey) -> Result<Option<Invoice>>;
}
