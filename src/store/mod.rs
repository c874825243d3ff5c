//! Credential persistence.
//!
//! The store is the only source of truth for both credential kinds. Every
//! implementation must enforce a unique fingerprint across all owners and
//! must never change a token's `hash` after insert.

pub mod memory;
pub mod postgres;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::hashing::HashAlgorithm;

#[derive(Debug, Error)]
pub enum StoreError {
    /// A unique index rejected the write.
    #[error("duplicate value for {0}")]
    Duplicate(&'static str),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

#[derive(Clone, PartialEq, Eq)]
pub struct PersonalAccessToken {
    pub id: Uuid,
    pub owner_id: String,
    pub label: String,
    pub scopes: Vec<String>,
    pub algorithm: HashAlgorithm,
    pub hash: String,
    pub hash_prefix: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl PersonalAccessToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

impl fmt::Debug for PersonalAccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersonalAccessToken")
            .field("id", &self.id)
            .field("owner_id", &self.owner_id)
            .field("label", &self.label)
            .field("scopes", &self.scopes)
            .field("algorithm", &self.algorithm)
            .field("hash", &"[REDACTED]")
            .field("hash_prefix", &self.hash_prefix)
            .field("active", &self.active)
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct UserSshKey {
    pub id: Uuid,
    pub owner_id: String,
    pub key_name: String,
    pub public_key: String,
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Cheap liveness check for `/readyz`.
    async fn ping(&self) -> Result<(), StoreError>;

    // -- Personal access tokens --

    async fn insert_token(&self, token: &PersonalAccessToken) -> Result<(), StoreError>;

    /// Active tokens sharing `prefix` that have not expired at `now`.
    async fn find_active_tokens_by_prefix(
        &self,
        prefix: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<PersonalAccessToken>, StoreError>;

    /// All of an owner's tokens, newest first.
    async fn list_tokens(&self, owner_id: &str) -> Result<Vec<PersonalAccessToken>, StoreError>;

    /// Sets `active = false` on the owner's token and returns it, or `None`
    /// when the owner has no such token. Already-revoked tokens are
    /// returned unchanged.
    async fn revoke_token(
        &self,
        owner_id: &str,
        token_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<PersonalAccessToken>, StoreError>;

    /// Revokes every active token of the owner carrying `label`.
    async fn revoke_active_tokens_by_label(
        &self,
        owner_id: &str,
        label: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<PersonalAccessToken>, StoreError>;

    async fn touch_token_last_used(
        &self,
        token_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    // -- SSH keys --

    async fn find_ssh_key_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<UserSshKey>, StoreError>;

    /// Fails with `StoreError::Duplicate` when the fingerprint is taken.
    async fn insert_ssh_key(&self, key: &UserSshKey) -> Result<(), StoreError>;

    /// All of an owner's keys, oldest first.
    async fn list_ssh_keys(&self, owner_id: &str) -> Result<Vec<UserSshKey>, StoreError>;

    async fn find_ssh_key(&self, key_id: Uuid) -> Result<Option<UserSshKey>, StoreError>;

    /// Deletes the owner's key. Returns whether a row was removed.
    async fn delete_ssh_key(&self, owner_id: &str, key_id: Uuid) -> Result<bool, StoreError>;
}
