//! Identity resolution and the external identity provider.
//!
//! Authentication happens upstream. Requests carry an already-verified
//! [`Principal`], and the hub only pushes role metadata and invitations back
//! to the provider through [`IdentityProvider`].

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::db::NewUser;
use super::models::Role;
use crate::config::IdentitySection;

/// The authenticated caller as reported by the identity provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub image_url: String,
}

impl Principal {
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }

    /// User row for this principal with the given role and no agency.
    pub fn new_user(&self, role: Role) -> NewUser {
        NewUser {
            id: self.id.clone(),
            name: self.display_name(),
            avatar_url: self.image_url.clone(),
            email: self.email.clone(),
            role,
            agency_id: None,
        }
    }
}

/// Outbound calls to the identity provider.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Set (or with `None`, clear) the role stored in the user's private metadata.
    async fn update_role_metadata(&self, user_id: &str, role: Option<Role>) -> Result<()>;

    /// Send an invitation email that redirects to `redirect_url` after sign-up.
    async fn create_invitation(&self, email: &str, role: Role, redirect_url: &str) -> Result<()>;
}

/// REST client for the hosted identity provider.
pub struct HttpIdentityProvider {
    client: reqwest::Client,
    api_url: String,
    secret_key: String,
}

impl HttpIdentityProvider {
    pub fn new(api_url: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            secret_key: secret_key.into(),
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder, what: &str) -> Result<()> {
        let resp = request
            .bearer_auth(&self.secret_key)
            .header("User-Agent", "agencyhub")
            .send()
            .await
            .with_context(|| format!("Failed to send {} request to identity provider", what))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Identity provider rejected {} ({}): {}", what, status, body);
        }
        Ok(())
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn update_role_metadata(&self, user_id: &str, role: Option<Role>) -> Result<()> {
        let url = format!("{}/v1/users/{}/metadata", self.api_url, user_id);
        let body = json!({ "private_metadata": { "role": role.map(|r| r.as_str()) } });
        tracing::debug!(user_id, role = ?role, "Updating identity role metadata");
        self.send(self.client.patch(url).json(&body), "metadata update")
            .await
    }

    async fn create_invitation(&self, email: &str, role: Role, redirect_url: &str) -> Result<()> {
        let url = format!("{}/v1/invitations", self.api_url);
        let body = json!({
            "email_address": email,
            "redirect_url": redirect_url,
            "public_metadata": {
                "throughInvitation": true,
                "role": role.as_str(),
            },
        });
        tracing::debug!(email, role = %role, "Creating identity invitation");
        self.send(self.client.post(url).json(&body), "invitation").await
    }
}

/// Call recorded by [`LocalIdentityProvider`].
#[derive(Debug, Clone, PartialEq)]
pub enum IdentityCall {
    RoleMetadata {
        user_id: String,
        role: Option<Role>,
    },
    Invitation {
        email: String,
        role: Role,
        redirect_url: String,
    },
}

/// In-process provider: logs every call.
///
/// Used when no provider URL is configured, and as the test double.
/// Only a provider built with [`LocalIdentityProvider::recording`] keeps
/// the calls in memory. `set_failing(true)` makes every subsequent call
/// return an error.
#[derive(Default)]
pub struct LocalIdentityProvider {
    calls: Option<Mutex<Vec<IdentityCall>>>,
    failing: AtomicBool,
}

impl LocalIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider that also keeps every call for later inspection.
    pub fn recording() -> Self {
        Self {
            calls: Some(Mutex::new(Vec::new())),
            ..Self::default()
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<IdentityCall> {
        self.calls
            .as_ref()
            .and_then(|calls| calls.lock().ok().map(|calls| calls.clone()))
            .unwrap_or_default()
    }

    fn record(&self, call: IdentityCall) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("Identity provider unavailable");
        }
        tracing::info!(call = ?call, "Identity provider call (local)");
        if let Some(calls) = &self.calls {
            calls
                .lock()
                .map_err(|_| anyhow::anyhow!("Identity call log poisoned"))?
                .push(call);
        }
        Ok(())
    }
}

#[async_trait]
impl IdentityProvider for LocalIdentityProvider {
    async fn update_role_metadata(&self, user_id: &str, role: Option<Role>) -> Result<()> {
        self.record(IdentityCall::RoleMetadata {
            user_id: user_id.to_string(),
            role,
        })
    }

    async fn create_invitation(&self, email: &str, role: Role, redirect_url: &str) -> Result<()> {
        self.record(IdentityCall::Invitation {
            email: email.to_string(),
            role,
            redirect_url: redirect_url.to_string(),
        })
    }
}

/// Build the provider named by the `[identity]` config section.
pub fn provider_from_config(
    section: &IdentitySection,
) -> Result<std::sync::Arc<dyn IdentityProvider>> {
    match &section.api_url {
        Some(url) => {
            let key = section.secret_key().with_context(|| {
                format!(
                    "identity.api_url is set but {} is not in the environment",
                    section.secret_key_env
                )
            })?;
            tracing::info!(api_url = %url, "Using HTTP identity provider");
            Ok(std::sync::Arc::new(HttpIdentityProvider::new(url.clone(), key)))
        }
        None => {
            tracing::info!("No identity.api_url configured; using local identity provider");
            Ok(std::sync::Arc::new(LocalIdentityProvider::new()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn principal() -> Principal {
        Principal {
            id: "user_123".into(),
            email: "ana@acme.test".into(),
            first_name: "Ana".into(),
            last_name: "Lopes".into(),
            image_url: "https://img.test/ana.png".into(),
        }
    }

    #[test]
    fn test_display_name() {
        assert_eq!(principal().display_name(), "Ana Lopes");
        let mut p = principal();
        p.last_name.clear();
        assert_eq!(p.display_name(), "Ana");
    }

    #[test]
    fn test_new_user_uses_principal_fields() {
        let user = principal().new_user(Role::SubaccountUser);
        assert_eq!(user.id, "user_123");
        assert_eq!(user.name, "Ana Lopes");
        assert_eq!(user.avatar_url, "https://img.test/ana.png");
        assert!(user.agency_id.is_none());
    }

    #[tokio::test]
    async fn test_local_provider_records_calls() {
        let provider = LocalIdentityProvider::recording();
        provider
            .update_role_metadata("user_1", Some(Role::AgencyAdmin))
            .await
            .unwrap();
        provider
            .create_invitation("bo@acme.test", Role::SubaccountGuest, "http://app/sign-up")
            .await
            .unwrap();

        let calls = provider.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(
            calls[0],
            IdentityCall::RoleMetadata {
                user_id: "user_1".into(),
                role: Some(Role::AgencyAdmin)
            }
        );
        assert!(matches!(
            &calls[1],
            IdentityCall::Invitation { email, .. } if email == "bo@acme.test"
        ));
    }

    #[tokio::test]
    async fn test_default_local_provider_keeps_nothing() {
        let provider = LocalIdentityProvider::new();
        for n in 0..50 {
            provider
                .create_invitation(&format!("u{n}@acme.test"), Role::SubaccountUser, "http://app")
                .await
                .unwrap();
        }
        assert!(provider.calls().is_empty());
        assert!(provider.calls.is_none());
    }

    #[tokio::test]
    async fn test_local_provider_can_fail() {
        let provider = LocalIdentityProvider::recording();
        provider.set_failing(true);
        assert!(provider.update_role_metadata("user_1", None).await.is_err());
        assert!(provider.calls().is_empty());
    }

    #[test]
    fn test_provider_from_config_requires_secret() {
        let section = IdentitySection {
            api_url: Some("https://id.example.test".into()),
            secret_key_env: "AGENCYHUB_TEST_UNSET_SECRET".into(),
            ..Default::default()
        };
        assert!(provider_from_config(&section).is_err());
        assert!(provider_from_config(&IdentitySection::default()).is_ok());
    }
}
