//! In-memory store with the same unique-index semantics as PostgreSQL.
//! Used by tests and by ephemeral runs without `DATABASE_URL`.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{CredentialStore, PersonalAccessToken, StoreError, UserSshKey};

#[derive(Default)]
pub struct MemoryStore {
    tokens: RwLock<HashMap<Uuid, PersonalAccessToken>>,
    ssh_keys: RwLock<HashMap<Uuid, UserSshKey>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn insert_token(&self, token: &PersonalAccessToken) -> Result<(), StoreError> {
        let mut tokens = self.tokens.write().await;
        if tokens.contains_key(&token.id) {
            return Err(StoreError::Duplicate("personal_access_tokens.id"));
        }
        tokens.insert(token.id, token.clone());
        Ok(())
    }

    async fn find_active_tokens_by_prefix(
        &self,
        prefix: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<PersonalAccessToken>, StoreError> {
        let tokens = self.tokens.read().await;
        Ok(tokens
            .values()
            .filter(|t| t.active && t.hash_prefix == prefix && !t.is_expired(now))
            .cloned()
            .collect())
    }

    async fn list_tokens(&self, owner_id: &str) -> Result<Vec<PersonalAccessToken>, StoreError> {
        let tokens = self.tokens.read().await;
        let mut out: Vec<_> = tokens
            .values()
            .filter(|t| t.owner_id == owner_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(out)
    }

    async fn revoke_token(
        &self,
        owner_id: &str,
        token_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<PersonalAccessToken>, StoreError> {
        let mut tokens = self.tokens.write().await;
        match tokens.get_mut(&token_id) {
            Some(t) if t.owner_id == owner_id => {
                if t.active {
                    t.active = false;
                    t.updated_at = now;
                }
                Ok(Some(t.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn revoke_active_tokens_by_label(
        &self,
        owner_id: &str,
        label: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<PersonalAccessToken>, StoreError> {
        let mut tokens = self.tokens.write().await;
        let mut revoked = Vec::new();
        for t in tokens.values_mut() {
            if t.active && t.owner_id == owner_id && t.label == label {
                t.active = false;
                t.updated_at = now;
                revoked.push(t.clone());
            }
        }
        Ok(revoked)
    }

    async fn touch_token_last_used(
        &self,
        token_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if let Some(t) = self.tokens.write().await.get_mut(&token_id) {
            t.last_used_at = Some(now);
        }
        Ok(())
    }

    async fn find_ssh_key_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<UserSshKey>, StoreError> {
        let keys = self.ssh_keys.read().await;
        Ok(keys.values().find(|k| k.fingerprint == fingerprint).cloned())
    }

    async fn insert_ssh_key(&self, key: &UserSshKey) -> Result<(), StoreError> {
        let mut keys = self.ssh_keys.write().await;
        if keys.values().any(|k| k.fingerprint == key.fingerprint) {
            return Err(StoreError::Duplicate("user_ssh_keys.fingerprint"));
        }
        if keys.contains_key(&key.id) {
            return Err(StoreError::Duplicate("user_ssh_keys.id"));
        }
        keys.insert(key.id, key.clone());
        Ok(())
    }

    async fn list_ssh_keys(&self, owner_id: &str) -> Result<Vec<UserSshKey>, StoreError> {
        let keys = self.ssh_keys.read().await;
        let mut out: Vec<_> = keys
            .values()
            .filter(|k| k.owner_id == owner_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn find_ssh_key(&self, key_id: Uuid) -> Result<Option<UserSshKey>, StoreError> {
        Ok(self.ssh_keys.read().await.get(&key_id).cloned())
    }

    async fn delete_ssh_key(&self, owner_id: &str, key_id: Uuid) -> Result<bool, StoreError> {
        let mut keys = self.ssh_keys.write().await;
        match keys.get(&key_id) {
            Some(k) if k.owner_id == owner_id => {
                keys.remove(&key_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
