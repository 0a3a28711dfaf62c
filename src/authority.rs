//! External capability authority.
//!
//! Capabilities are enforced outside rolegate. Business logic talks to the
//! [`CapabilityAuthority`] trait only; [`DiscordAuthority`] maps it onto
//! Discord guild roles through an explicitly constructed [`DiscordClient`].

use crate::config::AuthorityConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Attaches and detaches capabilities on subjects.
///
/// `Error::NotFound` means the subject or capability no longer exists in
/// the group. Any other failure is `Error::AuthorityUnavailable`.
#[async_trait]
pub trait CapabilityAuthority: Send + Sync {
    /// Whether `subject` is a member of `group`.
    async fn resolve_subject(&self, group: &str, subject: &str) -> Result<bool>;

    /// Whether `capability` exists in `group`.
    async fn resolve_capability(&self, group: &str, capability: &str) -> Result<bool>;

    /// Attach `capability` to `subject`. Attaching a held capability
    /// succeeds.
    async fn attach(&self, subject: &str, group: &str, capability: &str) -> Result<()>;

    /// Detach `capability` from `subject`. Detaching a capability that is
    /// not held succeeds.
    async fn detach(&self, subject: &str, group: &str, capability: &str) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct Role {
    id: String,
}

/// Handle on the Discord REST API, authenticated as a bot.
pub struct DiscordClient {
    http: reqwest::Client,
    api_base: String,
    token: String,
    timeout: Duration,
}

impl DiscordClient {
    /// Create a client.
    #[must_use]
    pub fn new(
        http: reqwest::Client,
        api_base: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            token: token.into(),
            timeout,
        }
    }

    /// Create a client from configuration.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if no bot token is configured.
    pub fn from_config(config: &AuthorityConfig, http: reqwest::Client) -> Result<Self> {
        let token = config
            .bot_token
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| Error::Config("authority.bot_token is not set".to_string()))?;
        Ok(Self::new(
            http,
            config.api_base.clone(),
            token,
            Duration::from_secs(config.timeout_secs),
        ))
    }

    /// Send a request; `Ok(None)` on 404.
    async fn send(&self, method: Method, path: &str) -> Result<Option<reqwest::Response>> {
        let url = format!("{}{path}", self.api_base);
        debug!("Discord {method} {path}");

        let response = self
            .http
            .request(method.clone(), &url)
            .header("Authorization", format!("Bot {}", self.token))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| Error::AuthorityUnavailable(format!("{method} {path}: {e}")))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response)),
            status => Err(Error::AuthorityUnavailable(format!(
                "{method} {path} returned HTTP {status}"
            ))),
        }
    }

    /// Whether `user` is a member of `guild`.
    ///
    /// # Errors
    ///
    /// Returns `Error::AuthorityUnavailable` if Discord cannot answer.
    pub async fn member_exists(&self, guild: &str, user: &str) -> Result<bool> {
        let path = format!("/guilds/{guild}/members/{user}");
        Ok(self.send(Method::GET, &path).await?.is_some())
    }

    /// Whether `role` exists in `guild`.
    ///
    /// # Errors
    ///
    /// Returns `Error::AuthorityUnavailable` if Discord cannot answer.
    pub async fn role_exists(&self, guild: &str, role: &str) -> Result<bool> {
        let path = format!("/guilds/{guild}/roles");
        let Some(response) = self.send(Method::GET, &path).await? else {
            return Ok(false);
        };
        let roles: Vec<Role> = response
            .json()
            .await
            .map_err(|e| Error::AuthorityUnavailable(format!("GET {path}: {e}")))?;
        Ok(roles.iter().any(|r| r.id == role))
    }

    /// Add `role` to `user`.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if the guild, member or role is gone.
    pub async fn add_member_role(&self, guild: &str, user: &str, role: &str) -> Result<()> {
        let path = format!("/guilds/{guild}/members/{user}/roles/{role}");
        self.send(Method::PUT, &path)
            .await?
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("member {user} or role {role} in {guild}")))
    }

    /// Remove `role` from `user`.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if the guild, member or role is gone.
    pub async fn remove_member_role(&self, guild: &str, user: &str, role: &str) -> Result<()> {
        let path = format!("/guilds/{guild}/members/{user}/roles/{role}");
        self.send(Method::DELETE, &path)
            .await?
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("member {user} or role {role} in {guild}")))
    }
}

/// Discord guild roles as capabilities.
pub struct DiscordAuthority {
    client: Arc<DiscordClient>,
}

impl DiscordAuthority {
    /// Wrap a client handle.
    #[must_use]
    pub fn new(client: Arc<DiscordClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CapabilityAuthority for DiscordAuthority {
    async fn resolve_subject(&self, group: &str, subject: &str) -> Result<bool> {
        self.client.member_exists(group, subject).await
    }

    async fn resolve_capability(&self, group: &str, capability: &str) -> Result<bool> {
        self.client.role_exists(group, capability).await
    }

    async fn attach(&self, subject: &str, group: &str, capability: &str) -> Result<()> {
        self.client
            .add_member_role(group, subject, capability)
            .await
            .map_err(|e| {
                warn!("Failed to add role {capability} to {subject} in {group}: {e}");
                e
            })?;
        info!("Added role {capability} to {subject} in {group}");
        Ok(())
    }

    async fn detach(&self, subject: &str, group: &str, capability: &str) -> Result<()> {
        self.client
            .remove_member_role(group, subject, capability)
            .await
            .map_err(|e| {
                warn!("Failed to remove role {capability} from {subject} in {group}: {e}");
                e
            })?;
        info!("Removed role {capability} from {subject} in {group}");
        Ok(())
    }
}
