use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use uuid::Uuid;
use zeroize::Zeroizing;

use super::{
    is_plausible_secret, validate_create, CreateTokenRequest, CreatedToken, Introspection,
    TokenBackend, TokenSummary,
};
use crate::cache::{introspect_key, CacheInvalidator, InvalidationMessage};
use crate::config::CacheSettings;
use crate::errors::AppError;
use crate::hashing::prefix::{prefix_for_secret, secret_digest};
use crate::hashing::{generate_secret, HashAlgorithm, TokenHasher};
use crate::metrics;
use crate::store::{CredentialStore, PersonalAccessToken};

/// Cached introspection result. `digest` is the SHA-256 of the secret that
/// produced it; a hit only counts for the same secret.
#[derive(Serialize, Deserialize)]
struct CachedIntrospection {
    digest: String,
    result: Introspection,
}

/// Tokens verified against the local credential store.
#[derive(Clone)]
pub struct LocalTokens {
    store: Arc<dyn CredentialStore>,
    hasher: TokenHasher,
    invalidator: CacheInvalidator,
    ttl: CacheSettings,
}

impl LocalTokens {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        hasher: TokenHasher,
        invalidator: CacheInvalidator,
        ttl: CacheSettings,
    ) -> Self {
        Self {
            store,
            hasher,
            invalidator,
            ttl,
        }
    }

    async fn revoke_record(&self, token: &PersonalAccessToken) {
        metrics::record_mutation("token", "revoke");
        tracing::info!(
            event = "token.revoked",
            owner_id = %token.owner_id,
            token_id = %token.id,
            hash_prefix = %token.hash_prefix,
            "token revoked"
        );
        self.invalidator
            .invalidate(InvalidationMessage::token_revoked(
                &token.owner_id,
                &token.id.to_string(),
                &token.hash_prefix,
            ))
            .await;
    }

    async fn hash_secret(&self, secret: &Zeroizing<String>) -> Result<String, AppError> {
        let hasher = self.hasher.clone();
        let secret = secret.clone();
        let hash = tokio::task::spawn_blocking(move || hasher.hash(&secret))
            .await
            .map_err(|e| AppError::Internal(e.into()))??;
        Ok(hash)
    }

    /// Index of the first candidate whose stored hash verifies. Every
    /// candidate is tried until one matches.
    async fn find_match(
        &self,
        secret: &str,
        candidates: &[PersonalAccessToken],
    ) -> Option<usize> {
        let hasher = self.hasher.clone();
        let secret = Zeroizing::new(secret.to_string());
        let hashes: Vec<(HashAlgorithm, String)> = candidates
            .iter()
            .map(|c| (c.algorithm, c.hash.clone()))
            .collect();
        let verified = tokio::task::spawn_blocking(move || {
            hashes
                .iter()
                .position(|(algo, hash)| hasher.verify(&secret, *algo, hash))
        })
        .await;
        match verified {
            Ok(found) => found,
            Err(e) => {
                tracing::error!(error = %e, "token verification task failed");
                None
            }
        }
    }

    fn cached(&self, key: &str, digest: &str) -> Option<Introspection> {
        let entry: CachedIntrospection = self.invalidator.cache().get(key)?;
        let same_secret: bool = entry.digest.as_bytes().ct_eq(digest.as_bytes()).into();
        if !same_secret {
            return None;
        }
        // A positive entry never outlives the token's own expiry.
        if let Some(expires_at) = entry.result.expires_at {
            if expires_at <= Utc::now() {
                return None;
            }
        }
        Some(entry.result)
    }

    /// Caches `result` unless `key` was invalidated after `seen` was read.
    fn remember(
        &self,
        key: &str,
        seen: u64,
        digest: String,
        result: &Introspection,
        now: DateTime<Utc>,
    ) {
        let ttl = if result.active {
            let mut ttl = self.ttl.lookup_ttl_secs;
            if let Some(expires_at) = result.expires_at {
                let left = (expires_at - now).num_seconds().max(0) as u64;
                ttl = ttl.min(left);
            }
            ttl
        } else {
            self.ttl.negative_ttl_secs
        };
        // Zero would mean "never expire" to the cache.
        if ttl == 0 {
            return;
        }
        let entry = CachedIntrospection {
            digest,
            result: result.clone(),
        };
        match self.invalidator.cache().set_if_unchanged(key, &entry, ttl, seen) {
            Ok(true) => {}
            Ok(false) => tracing::debug!(key = %key, "introspection raced an invalidation, not cached"),
            Err(e) => tracing::warn!(error = %e, "failed to cache introspection result"),
        }
    }
}

#[async_trait]
impl TokenBackend for LocalTokens {
    async fn create(
        &self,
        owner_id: &str,
        req: CreateTokenRequest,
    ) -> Result<CreatedToken, AppError> {
        let now = Utc::now();
        let req = validate_create(owner_id, req, now)?;

        if req.replace && !req.label.is_empty() {
            let replaced = self
                .store
                .revoke_active_tokens_by_label(owner_id, &req.label, now)
                .await?;
            for token in &replaced {
                self.revoke_record(token).await;
            }
        }

        let secret = generate_secret();
        let hash = self.hash_secret(&secret).await?;
        let hash_prefix = prefix_for_secret(&secret);

        let record = PersonalAccessToken {
            id: Uuid::new_v4(),
            owner_id: owner_id.to_string(),
            label: req.label,
            scopes: req.scopes,
            algorithm: self.hasher.algorithm(),
            hash,
            hash_prefix: hash_prefix.clone(),
            active: true,
            created_at: now,
            updated_at: now,
            expires_at: req.expires_at,
            last_used_at: None,
        };
        self.store.insert_token(&record).await?;

        // Drop any negative entry a premature lookup may have left.
        self.invalidator
            .invalidate(InvalidationMessage::for_key(introspect_key(&hash_prefix)))
            .await;

        metrics::record_mutation("token", "create");
        tracing::info!(
            event = "token.created",
            owner_id = %record.owner_id,
            token_id = %record.id,
            hash_prefix = %record.hash_prefix,
            algorithm = %record.algorithm,
            "token created"
        );

        Ok(CreatedToken {
            id: record.id.to_string(),
            token: secret.as_str().to_owned(),
            hash_prefix,
            created_at: record.created_at,
            expires_at: record.expires_at,
        })
    }

    async fn introspect(&self, secret: &str) -> Introspection {
        if !is_plausible_secret(secret) {
            metrics::record_introspection(false);
            return Introspection::inactive();
        }

        let prefix = prefix_for_secret(secret);
        let key = introspect_key(&prefix);
        let digest = hex::encode(secret_digest(secret));

        if let Some(result) = self.cached(&key, &digest) {
            metrics::record_introspection(result.active);
            return result;
        }

        let seen = self.invalidator.cache().generation(&key);
        let now = Utc::now();
        let candidates = match self.store.find_active_tokens_by_prefix(&prefix, now).await {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(error = %e, hash_prefix = %prefix, "token lookup failed");
                metrics::record_introspection(false);
                return Introspection::inactive();
            }
        };

        let result = match self.find_match(secret, &candidates).await {
            Some(i) => {
                let token = &candidates[i];
                tracing::info!(
                    event = "token.used",
                    owner_id = %token.owner_id,
                    token_id = %token.id,
                    hash_prefix = %token.hash_prefix,
                    "token used"
                );
                if let Err(e) = self.store.touch_token_last_used(token.id, now).await {
                    tracing::warn!(error = %e, token_id = %token.id, "failed to record token use");
                }
                Introspection::active_for(token)
            }
            None => {
                if !candidates.is_empty() {
                    tracing::debug!(
                        hash_prefix = %prefix,
                        candidates = candidates.len(),
                        "no candidate matched the presented secret"
                    );
                }
                Introspection::inactive()
            }
        };

        self.remember(&key, seen, digest, &result, now);
        metrics::record_introspection(result.active);
        result
    }

    async fn list(&self, owner_id: &str) -> Result<Vec<TokenSummary>, AppError> {
        super::validate_owner(owner_id)?;
        let tokens = self.store.list_tokens(owner_id).await?;
        Ok(tokens.iter().map(TokenSummary::from).collect())
    }

    async fn revoke(&self, owner_id: &str, token_id: &str) -> Result<(), AppError> {
        let Ok(id) = Uuid::parse_str(token_id) else {
            return Err(AppError::NotFound);
        };
        let token = self
            .store
            .revoke_token(owner_id, id, Utc::now())
            .await?
            .ok_or(AppError::NotFound)?;
        self.revoke_record(&token).await;
        Ok(())
    }
}
