//! In-process store with optional snapshot persistence.
//!
//! Tables live in memory behind a read/write lock. Writes are serialized
//! through an async write gate; when a snapshot path is configured every
//! committed write is flushed to disk before the call returns:
//!
//! ```text
//! {path}.tmp  --rename-->  {path}      (MessagePack, named fields)
//! ```
//!
//! A failed flush rolls the in-memory tables back, so callers never observe
//! a write that is not durable.

use super::Store;
use crate::error::{Error, Result};
use crate::model::{
    Account, Grant, GrantKey, GroupId, Invoice, NetworkId, Resource, ResourceGroup, ResourceId,
    SubjectId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Tables {
    groups: BTreeMap<GroupId, ResourceGroup>,
    resources: BTreeMap<ResourceId, Resource>,
    accounts: BTreeMap<(SubjectId, NetworkId), Account>,
    grants: BTreeMap<GrantKey, Grant>,
    invoices: BTreeMap<GrantKey, Invoice>,
    #[serde(skip)]
    invoice_tokens: HashMap<String, GrantKey>,
}

impl Tables {
    fn rebuild_token_index(&mut self) {
        self.invoice_tokens = self
            .invoices
            .iter()
            .map(|(key, invoice)| (invoice.token.clone(), key.clone()))
            .collect();
    }

    fn capability_in_use(&self, group: &str, capability: &str) -> bool {
        self.grants
            .keys()
            .any(|k| k.group == group && k.capability == capability)
    }
}

/// Statistics about snapshot writes.
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    /// Number of snapshots flushed to disk.
    pub snapshots_written: u64,
    /// Size of the last snapshot in bytes.
    pub last_snapshot_bytes: u64,
    /// Number of writes rolled back because the flush failed.
    pub rollbacks: u64,
}

/// The shipped [`Store`] implementation.
pub struct LocalStore {
    tables: RwLock<Tables>,
    write_gate: Mutex<()>,
    path: Option<PathBuf>,
    stats: parking_lot::Mutex<StoreStats>,
}

impl LocalStore {
    /// Create a store that keeps everything in memory.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            write_gate: Mutex::new(()),
            path: None,
            stats: parking_lot::Mutex::new(StoreStats::default()),
        }
    }

    /// Open (or create) a store persisted at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory cannot be created or an
    /// existing snapshot cannot be read or decoded.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                Error::Storage(format!("Failed to create store directory: {e}"))
            })?;
        }

        let mut tables = match fs::read(&path).await {
            Ok(bytes) => rmp_serde::from_slice::<Tables>(&bytes).map_err(|e| {
                Error::Serialization(format!("Failed to decode {}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No snapshot at {}, starting empty", path.display());
                Tables::default()
            }
            Err(e) => {
                return Err(Error::Storage(format!(
                    "Failed to read {}: {e}",
                    path.display()
                )))
            }
        };
        tables.rebuild_token_index();

        info!(
            "Opened store at {} ({} groups, {} resources, {} accounts, {} grants, {} invoices)",
            path.display(),
            tables.groups.len(),
            tables.resources.len(),
            tables.accounts.len(),
            tables.grants.len(),
            tables.invoices.len()
        );

        Ok(Self {
            tables: RwLock::new(tables),
            write_gate: Mutex::new(()),
            path: Some(path),
            stats: parking_lot::Mutex::new(StoreStats::default()),
        })
    }

    /// Snapshot path, if persistent.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Current snapshot statistics.
    #[must_use]
    pub fn stats(&self) -> StoreStats {
        self.stats.lock().clone()
    }

    fn read<T>(&self, op: impl FnOnce(&Tables) -> T) -> T {
        op(&self.tables.read())
    }

    /// Apply `op` as one transaction. `op` must leave the tables untouched
    /// when it returns an error.
    async fn write<T>(&self, op: impl FnOnce(&mut Tables) -> Result<T>) -> Result<T> {
        let _gate = self.write_gate.lock().await;

        let (out, pending) = {
            let mut tables = self.tables.write();
            let before = self.path.as_ref().map(|_| tables.clone());
            let out = op(&mut tables)?;
            let pending = match before {
                Some(before) => {
                    let bytes = rmp_serde::to_vec_named(&*tables).map_err(|e| {
                        Error::Serialization(format!("Failed to encode store: {e}"))
                    });
                    match bytes {
                        Ok(bytes) => Some((before, bytes)),
                        Err(e) => {
                            *tables = before;
                            return Err(e);
                        }
                    }
                }
                None => None,
            };
            (out, pending)
        };

        if let (Some(path), Some((before, bytes))) = (self.path.as_deref(), pending) {
            if let Err(e) = flush(path, &bytes).await {
                warn!("Store flush failed, rolling back: {e}");
                *self.tables.write() = before;
                self.stats.lock().rollbacks += 1;
                return Err(e);
            }
            let mut stats = self.stats.lock();
            stats.snapshots_written += 1;
            stats.last_snapshot_bytes = bytes.len() as u64;
        }

        Ok(out)
    }
}

/// Atomic write: temp file + rename.
async fn flush(path: &Path, bytes: &[u8]) -> Result<()> {
    let temp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&temp_path)
        .await
        .map_err(|e| Error::Storage(format!("Failed to create temp snapshot: {e}")))?;
    file.write_all(bytes)
        .await
        .map_err(|e| Error::Storage(format!("Failed to write snapshot: {e}")))?;
    file.sync_all()
        .await
        .map_err(|e| Error::Storage(format!("Failed to sync snapshot: {e}")))?;
    drop(file);
    fs::rename(&temp_path, path)
        .await
        .map_err(|e| Error::Storage(format!("Failed to rename snapshot: {e}")))
}

#[async_trait]
impl Store for LocalStore {
    async fn upsert_group(&self, group: ResourceGroup) -> Result<()> {
        self.write(|t| {
            t.groups.insert(group.id.clone(), group);
            Ok(())
        })
        .await
    }

    async fn group(&self, id: &str) -> Result<Option<ResourceGroup>> {
        Ok(self.read(|t| t.groups.get(id).cloned()))
    }

    async fn groups(&self) -> Result<Vec<ResourceGroup>> {
        Ok(self.read(|t| t.groups.values().cloned().collect()))
    }

    async fn upsert_resource(&self, resource: Resource) -> Result<()> {
        self.write(|t| {
            if !t.groups.contains_key(&resource.group) {
                return Err(Error::NotFound(format!("group '{}'", resource.group)));
            }
            if let Some(existing) = t.resources.get(&resource.id) {
                let terms_changed = existing.price_per_unit != resource.price_per_unit
                    || existing.price_unit_seconds != resource.price_unit_seconds
                    || existing.capability != resource.capability
                    || existing.group != resource.group;
                if terms_changed && t.capability_in_use(&existing.group, &existing.capability) {
                    return Err(Error::Conflict(format!(
                        "resource '{}' is referenced by a grant; price and capability are frozen",
                        resource.id
                    )));
                }
            }
            t.resources.insert(resource.id.clone(), resource);
            Ok(())
        })
        .await
    }

    async fn resource(&self, id: &str) -> Result<Option<Resource>> {
        Ok(self.read(|t| t.resources.get(id).cloned()))
    }

    async fn resources_in(&self, group: &GroupId) -> Result<Vec<Resource>> {
        Ok(self.read(|t| {
            t.resources
                .values()
                .filter(|r| &r.group == group)
                .cloned()
                .collect()
        }))
    }

    async fn account(&self, subject: &str, network: &str) -> Result<Option<Account>> {
        let key = (subject.to_string(), network.to_string());
        Ok(self.read(|t| t.accounts.get(&key).cloned()))
    }

    async fn get_or_create_account(&self, account: Account) -> Result<Account> {
        let key = (account.subject.clone(), account.network.clone());
        if let Some(existing) = self.read(|t| t.accounts.get(&key).cloned()) {
            return Ok(existing);
        }
        self.write(|t| Ok(t.accounts.entry(key).or_insert(account).clone()))
            .await
    }

    async fn grant(&self, key: &GrantKey) -> Result<Option<Grant>> {
        Ok(self.read(|t| t.grants.get(key).cloned()))
    }

    async fn commit_grant(&self, grant: Grant) -> Result<Option<Invoice>> {
        self.write(|t| {
            let key = grant.key.clone();
            t.grants.insert(key.clone(), grant);
            let fulfilled = t.invoices.remove(&key);
            if let Some(invoice) = &fulfilled {
                t.invoice_tokens.remove(&invoice.token);
            }
            Ok(fulfilled)
        })
        .await
    }

    async fn expired_grants(&self, now: DateTime<Utc>) -> Result<Vec<Grant>> {
        let mut expired: Vec<Grant> = self.read(|t| {
            t.grants
                .values()
                .filter(|g| g.is_expired(now))
                .cloned()
                .collect()
        });
        expired.sort_by_key(|g| g.expires_at);
        Ok(expired)
    }

    async fn unattached_grants(&self, now: DateTime<Utc>) -> Result<Vec<Grant>> {
        Ok(self.read(|t| {
            t.grants
                .values()
                .filter(|g| !g.attached && !g.is_expired(now))
                .cloned()
                .collect()
        }))
    }

    async fn mark_grant_attached(
        &self,
        key: &GrantKey,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        self.write(|t| match t.grants.get_mut(key) {
            Some(grant) if grant.expires_at == expires_at => {
                grant.attached = true;
                Ok(true)
            }
            _ => Ok(false),
        })
        .await
    }

    async fn delete_grant(&self, key: &GrantKey, expires_at: DateTime<Utc>) -> Result<bool> {
        self.write(|t| match t.grants.get(key) {
            Some(grant) if grant.expires_at == expires_at => {
                t.grants.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        })
        .await
    }

    async fn upsert_invoice(
        &self,
        key: GrantKey,
        resource: ResourceId,
        duration: u64,
        token: String,
    ) -> Result<Invoice> {
        self.write(|t| {
            if let Some(owner) = t.invoice_tokens.get(&token) {
                if owner != &key {
                    return Err(Error::Conflict("invoice token collision".to_string()));
                }
            }

            let now = Utc::now();
            let invoice = match t.invoices.get_mut(&key) {
                Some(existing) => {
                    t.invoice_tokens.remove(&existing.token);
                    existing.token = token;
                    existing.resource = resource;
                    existing.duration = duration;
                    existing.updated_at = now;
                    existing.clone()
                }
                None => {
                    let invoice = Invoice {
                        token,
                        key: key.clone(),
                        resource,
                        duration,
                        created_at: now,
                        updated_at: now,
                    };
                    t.invoices.insert(key.clone(), invoice.clone());
                    invoice
                }
            };
            t.invoice_tokens.insert(invoice.token.clone(), key);
            Ok(invoice)
        })
        .await
    }

    async fn invoice_by_token(&self, token: &str) -> Result<Option<Invoice>> {
        Ok(self.read(|t| {
            t.invoice_tokens
                .get(token)
                .and_then(|key| t.invoices.get(key))
                .cloned()
        }))
    }

    async fn invoice(&self, key: &GrantKey) -> Result<Option<Invoice>> {
        Ok(self.read(|t| t.invoices.get(key).cloned()))
    }
}
