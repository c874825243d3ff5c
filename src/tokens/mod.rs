//! Personal access tokens.
//!
//! A token moves `created -> active -> revoked` and never back. Expiry is
//! evaluated at introspection time and never written to the record.

pub mod delegated;
pub mod local;

use std::collections::BTreeSet;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::errors::AppError;
use crate::store::PersonalAccessToken;

pub use delegated::DelegatedTokens;
pub use local::LocalTokens;

pub const MAX_LABEL_LEN: usize = 128;
pub const MAX_SCOPE_LEN: usize = 64;
/// Presented secrets longer than this are rejected before any lookup.
pub const MAX_SECRET_LEN: usize = 512;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTokenRequest {
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default, alias = "expires_at")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub replace: bool,
}

/// Returned exactly once, at creation. The plaintext is wiped on drop.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedToken {
    #[serde(alias = "tokenId", alias = "_id")]
    pub id: String,
    #[serde(alias = "plaintext")]
    pub token: String,
    #[serde(default, alias = "accessTokenPartial")]
    pub hash_prefix: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for CreatedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CreatedToken")
            .field("id", &self.id)
            .field("token", &"[REDACTED]")
            .field("hash_prefix", &self.hash_prefix)
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl Drop for CreatedToken {
    fn drop(&mut self) {
        self.token.zeroize();
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Introspection {
    pub active: bool,
    #[serde(default, alias = "ownerId", skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Introspection {
    pub fn inactive() -> Self {
        Self {
            active: false,
            user_id: None,
            scopes: None,
            expires_at: None,
        }
    }

    pub fn active_for(token: &PersonalAccessToken) -> Self {
        Self {
            active: true,
            user_id: Some(token.owner_id.clone()),
            scopes: Some(token.scopes.clone()),
            expires_at: token.expires_at,
        }
    }
}

/// Token metadata safe to return to its owner. Never carries the hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenSummary {
    #[serde(alias = "tokenId", alias = "_id")]
    pub id: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default, alias = "accessTokenPartial")]
    pub hash_prefix: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
}

fn default_active() -> bool {
    true
}

impl From<&PersonalAccessToken> for TokenSummary {
    fn from(t: &PersonalAccessToken) -> Self {
        Self {
            id: t.id.to_string(),
            label: t.label.clone(),
            scopes: t.scopes.clone(),
            active: t.active,
            hash_prefix: t.hash_prefix.clone(),
            created_at: t.created_at,
            expires_at: t.expires_at,
            last_used_at: t.last_used_at,
        }
    }
}

#[async_trait]
pub trait TokenBackend: Send + Sync {
    async fn create(&self, owner_id: &str, req: CreateTokenRequest)
        -> Result<CreatedToken, AppError>;

    /// Never fails: anything short of a verified match is `active: false`.
    async fn introspect(&self, secret: &str) -> Introspection;

    async fn list(&self, owner_id: &str) -> Result<Vec<TokenSummary>, AppError>;

    async fn revoke(&self, owner_id: &str, token_id: &str) -> Result<(), AppError>;
}

/// Normalizes and checks a create request. Scopes come back de-duplicated
/// and sorted.
pub fn validate_create(
    owner_id: &str,
    mut req: CreateTokenRequest,
    now: DateTime<Utc>,
) -> Result<CreateTokenRequest, AppError> {
    validate_owner(owner_id)?;

    req.label = req.label.trim().to_string();
    if req.label.chars().count() > MAX_LABEL_LEN {
        return Err(AppError::Validation(format!(
            "label must be at most {MAX_LABEL_LEN} characters"
        )));
    }

    let mut scopes = BTreeSet::new();
    for scope in req.scopes.drain(..) {
        let scope = scope.trim().to_string();
        if scope.is_empty()
            || scope.chars().count() > MAX_SCOPE_LEN
            || scope.chars().any(char::is_whitespace)
        {
            return Err(AppError::Validation(format!(
                "invalid scope '{scope}': scopes are non-empty, at most {MAX_SCOPE_LEN} characters, without whitespace"
            )));
        }
        scopes.insert(scope);
    }
    req.scopes = scopes.into_iter().collect();

    if let Some(expires_at) = req.expires_at {
        if expires_at <= now {
            return Err(AppError::Validation("expiresAt must be in the future".into()));
        }
    }
    Ok(req)
}

pub fn validate_owner(owner_id: &str) -> Result<(), AppError> {
    if owner_id.trim().is_empty() {
        return Err(AppError::Validation("user id is required".into()));
    }
    Ok(())
}

/// Shape check for a presented secret. Failing it is `active: false`,
/// never an error.
pub fn is_plausible_secret(secret: &str) -> bool {
    !secret.is_empty() && secret.len() <= MAX_SECRET_LEN
}
