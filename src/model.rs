//! Persisted records: catalog, accounts, grants and invoices.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Identifier of the party requesting access (e.g. a Discord user id).
pub type SubjectId = String;

/// Identifier of a resource group (e.g. a Discord guild id).
pub type GroupId = String;

/// Identifier of a resource (e.g. a channel id).
pub type ResourceId = String;

/// Identifier of a capability (e.g. a role id).
pub type CapabilityId = String;

/// Identifier of a configured settlement network (e.g. `base-sepolia`).
pub type NetworkId = String;

/// Seconds in a day, the default pricing unit.
pub const SECONDS_PER_DAY: u64 = 86_400;

/// A group of resources paid into one receiver address per network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceGroup {
    /// Group identifier.
    pub id: GroupId,
    /// Receiver address, keyed by network id. One entry per network.
    pub receivers: BTreeMap<NetworkId, String>,
    /// Channel where the purchase panel is shown, if any.
    #[serde(default)]
    pub default_resource: Option<ResourceId>,
}

impl ResourceGroup {
    /// Receiver address for a network.
    #[must_use]
    pub fn receiver(&self, network: &str) -> Option<&str> {
        self.receivers.get(network).map(String::as_str)
    }
}

/// Something access is sold for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    /// Resource identifier.
    pub id: ResourceId,
    /// Owning group.
    pub group: GroupId,
    /// Price per `price_unit_seconds`, in atomic asset units.
    pub price_per_unit: u64,
    /// Length of the pricing unit in seconds.
    #[serde(default = "default_price_unit")]
    pub price_unit_seconds: u64,
    /// Capability attached to buyers.
    pub capability: CapabilityId,
    /// Allowed durations in seconds. Empty means any positive duration.
    #[serde(default)]
    pub allowed_durations: BTreeSet<u64>,
}

const fn default_price_unit() -> u64 {
    SECONDS_PER_DAY
}

impl Resource {
    /// Whether `duration` may be purchased for this resource.
    #[must_use]
    pub fn allows_duration(&self, duration: u64) -> bool {
        duration > 0
            && (self.allowed_durations.is_empty() || self.allowed_durations.contains(&duration))
    }
}

/// Key material generated for an account.
///
/// The private half is sensitive: it is written once at provisioning and
/// never logged.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMaterial {
    /// Public address in the network's native encoding.
    pub public_address: String,
    /// Private key in the network's native encoding.
    pub private_key: String,
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("public_address", &self.public_address)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// A subject's account on one network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Owner.
    pub subject: SubjectId,
    /// Network the keys belong to.
    pub network: NetworkId,
    /// Generated keys.
    pub keys: KeyMaterial,
    /// When the account was provisioned.
    pub created_at: DateTime<Utc>,
}

impl Account {
    /// Public address of the account.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.keys.public_address
    }
}

/// Uniqueness key shared by grants and invoices.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GrantKey {
    /// Subject holding (or buying) the capability.
    pub subject: SubjectId,
    /// Group the capability lives in.
    pub group: GroupId,
    /// Capability.
    pub capability: CapabilityId,
}

impl fmt::Display for GrantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.group, self.capability, self.subject)
    }
}

/// Subject S holds capability C in group G until `expires_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    /// Subject, group and capability.
    pub key: GrantKey,
    /// Resource the grant was bought for.
    pub resource: ResourceId,
    /// When the grant was (last) written.
    pub granted_at: DateTime<Utc>,
    /// When the capability must be revoked.
    pub expires_at: DateTime<Utc>,
    /// False while the capability attach is still owed to the subject.
    pub attached: bool,
}

impl Grant {
    /// Whether the grant has expired at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

/// Single-use deferred-payment ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    /// Opaque unguessable token.
    pub token: String,
    /// Subject, group and capability being bought.
    pub key: GrantKey,
    /// Resource being bought.
    pub resource: ResourceId,
    /// Requested duration in seconds.
    pub duration: u64,
    /// First issued.
    pub created_at: DateTime<Utc>,
    /// Last re-issued.
    pub updated_at: DateTime<Utc>,
}
