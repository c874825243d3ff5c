use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{
    normalize_fingerprint, parse_public_key, resolve_key_name, CreateSshKeyRequest,
    SshKeyBackend, SshKeyCreated, SshKeyView,
};
use crate::cache::{ssh_key, CacheInvalidator, InvalidationMessage};
use crate::config::CacheSettings;
use crate::errors::AppError;
use crate::metrics;
use crate::store::{CredentialStore, StoreError, UserSshKey};
use crate::tokens::validate_owner;

/// Cached fingerprint lookup. `owner_id: None` is a negative entry.
#[derive(Serialize, Deserialize)]
struct CachedOwner {
    owner_id: Option<String>,
}

#[derive(Clone)]
pub struct LocalSshKeys {
    store: Arc<dyn CredentialStore>,
    invalidator: CacheInvalidator,
    ttl: CacheSettings,
}

impl LocalSshKeys {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        invalidator: CacheInvalidator,
        ttl: CacheSettings,
    ) -> Self {
        Self {
            store,
            invalidator,
            ttl,
        }
    }

    /// `Some(owner)` on a cache hit, where `owner` may itself be a cached
    /// miss.
    pub(crate) fn cached_owner(&self, fingerprint: &str) -> Option<Option<String>> {
        self.invalidator
            .cache()
            .get::<CachedOwner>(&ssh_key(fingerprint))
            .map(|c| c.owner_id)
    }

    fn owner_ttl(&self, owner_id: &Option<String>) -> u64 {
        if owner_id.is_some() {
            self.ttl.lookup_ttl_secs
        } else {
            self.ttl.negative_ttl_secs
        }
    }

    /// Primes the cache after a local write.
    pub(crate) fn remember_owner(&self, fingerprint: &str, owner_id: Option<String>) {
        let ttl = self.owner_ttl(&owner_id);
        if ttl == 0 {
            return;
        }
        if let Err(e) = self
            .invalidator
            .cache()
            .set(&ssh_key(fingerprint), &CachedOwner { owner_id }, ttl)
        {
            tracing::warn!(error = %e, "failed to cache ssh key lookup");
        }
    }

    /// Generation to hand back to `remember_lookup`.
    pub(crate) fn lookup_generation(&self, fingerprint: &str) -> u64 {
        self.invalidator.cache().generation(&ssh_key(fingerprint))
    }

    /// Caches a lookup result unless the fingerprint was invalidated after
    /// `seen` was read.
    pub(crate) fn remember_lookup(
        &self,
        fingerprint: &str,
        owner_id: Option<String>,
        seen: u64,
    ) {
        let ttl = self.owner_ttl(&owner_id);
        if ttl == 0 {
            return;
        }
        let key = ssh_key(fingerprint);
        match self
            .invalidator
            .cache()
            .set_if_unchanged(&key, &CachedOwner { owner_id }, ttl, seen)
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(key = %key, "ssh lookup raced an invalidation, not cached")
            }
            Err(e) => tracing::warn!(error = %e, "failed to cache ssh key lookup"),
        }
    }

    pub(crate) async fn store_owner(&self, fingerprint: &str) -> Result<Option<String>, AppError> {
        Ok(self
            .store
            .find_ssh_key_by_fingerprint(fingerprint)
            .await?
            .map(|k| k.owner_id))
    }

    /// Applies the ownership rules to an existing record.
    fn resolve_existing(
        &self,
        owner_id: &str,
        existing: UserSshKey,
    ) -> Result<SshKeyCreated, AppError> {
        if existing.owner_id != owner_id {
            tracing::info!(
                owner_id = %owner_id,
                fingerprint = %existing.fingerprint,
                "ssh key already registered to another user"
            );
            return Err(AppError::Conflict(
                "this SSH key is already registered to another account".into(),
            ));
        }
        tracing::info!(
            event = "sshkey.added.idempotent",
            owner_id = %owner_id,
            key_id = %existing.id,
            fingerprint = %existing.fingerprint,
            "ssh key already registered"
        );
        Ok(SshKeyCreated {
            created: false,
            key: SshKeyView::from(&existing),
        })
    }

    /// Fingerprint of a locally stored key, if there is one.
    pub(crate) async fn local_fingerprint(
        &self,
        key_id: &str,
    ) -> Result<Option<String>, AppError> {
        let Ok(id) = Uuid::parse_str(key_id) else {
            return Ok(None);
        };
        Ok(self.store.find_ssh_key(id).await?.map(|k| k.fingerprint))
    }

    /// Drops the cached owner of `fingerprint` on every instance.
    pub(crate) async fn forget(&self, owner_id: &str, fingerprint: &str) {
        self.invalidator
            .invalidate(InvalidationMessage::ssh_key_changed(owner_id, fingerprint))
            .await;
    }

    /// Clears stale negative entries everywhere and primes this instance.
    pub(crate) async fn announce(&self, owner_id: &str, fingerprint: &str) {
        self.forget(owner_id, fingerprint).await;
        self.remember_owner(fingerprint, Some(owner_id.to_string()));
    }
}

#[async_trait]
impl SshKeyBackend for LocalSshKeys {
    async fn create(
        &self,
        owner_id: &str,
        req: CreateSshKeyRequest,
    ) -> Result<SshKeyCreated, AppError> {
        validate_owner(owner_id)?;
        let parsed = parse_public_key(&req.public_key)?;
        let key_name = resolve_key_name(&req.key_name, &parsed)?;
        let fingerprint = parsed.fingerprint();

        if let Some(existing) = self.store.find_ssh_key_by_fingerprint(&fingerprint).await? {
            let outcome = self.resolve_existing(owner_id, existing)?;
            self.remember_owner(&fingerprint, Some(owner_id.to_string()));
            return Ok(outcome);
        }

        let now = Utc::now();
        let record = UserSshKey {
            id: Uuid::new_v4(),
            owner_id: owner_id.to_string(),
            key_name,
            public_key: parsed.canonical(),
            fingerprint: fingerprint.clone(),
            created_at: now,
            updated_at: now,
        };

        match self.store.insert_ssh_key(&record).await {
            Ok(()) => {}
            Err(StoreError::Duplicate(_)) => {
                // Lost a concurrent registration; the winner decides.
                let winner = self
                    .store
                    .find_ssh_key_by_fingerprint(&fingerprint)
                    .await?
                    .ok_or_else(|| {
                        AppError::Internal(anyhow::anyhow!(
                            "fingerprint reported duplicate but no row found"
                        ))
                    })?;
                let outcome = self.resolve_existing(owner_id, winner)?;
                self.remember_owner(&fingerprint, Some(owner_id.to_string()));
                return Ok(outcome);
            }
            Err(e) => return Err(e.into()),
        }

        metrics::record_mutation("ssh_key", "create");
        tracing::info!(
            event = "sshkey.added",
            owner_id = %owner_id,
            key_id = %record.id,
            fingerprint = %fingerprint,
            "ssh key added"
        );
        self.announce(owner_id, &fingerprint).await;

        Ok(SshKeyCreated {
            created: true,
            key: SshKeyView::from(&record),
        })
    }

    async fn list(&self, owner_id: &str) -> Result<Vec<SshKeyView>, AppError> {
        validate_owner(owner_id)?;
        let keys = self.store.list_ssh_keys(owner_id).await?;
        Ok(keys.iter().map(SshKeyView::from).collect())
    }

    async fn remove(&self, owner_id: &str, key_id: &str) -> Result<(), AppError> {
        let Ok(id) = Uuid::parse_str(key_id) else {
            return Ok(());
        };
        let Some(existing) = self.store.find_ssh_key(id).await? else {
            return Ok(());
        };
        if existing.owner_id != owner_id {
            return Err(AppError::Forbidden);
        }

        if self.store.delete_ssh_key(owner_id, id).await? {
            metrics::record_mutation("ssh_key", "remove");
            tracing::info!(
                event = "sshkey.removed",
                owner_id = %owner_id,
                key_id = %id,
                fingerprint = %existing.fingerprint,
                "ssh key removed"
            );
        }
        self.forget(owner_id, &existing.fingerprint).await;
        Ok(())
    }

    async fn lookup(&self, fingerprint: &str) -> Result<Option<String>, AppError> {
        let fingerprint = normalize_fingerprint(fingerprint)?;
        if let Some(owner) = self.cached_owner(&fingerprint) {
            return Ok(owner);
        }
        let seen = self.lookup_generation(&fingerprint);
        let owner = self.store_owner(&fingerprint).await?;
        self.remember_lookup(&fingerprint, owner.clone(), seen);
        Ok(owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::LookupCache;
    use crate::pubsub::LocalBus;
    use crate::ssh_keys::parse_public_key;
    use crate::ssh_keys::test_keys::ed25519_line;
    use crate::store::memory::MemoryStore;

    fn backend() -> (LocalSshKeys, Arc<MemoryStore>, LookupCache) {
        let store = Arc::new(MemoryStore::new());
        let cache = LookupCache::new();
        let invalidator = CacheInvalidator::new(cache.clone(), Arc::new(LocalBus::new()), "c");
        (
            LocalSshKeys::new(store.clone(), invalidator, CacheSettings::default()),
            store,
            cache,
        )
    }

    fn req(name: &str, line: &str) -> CreateSshKeyRequest {
        CreateSshKeyRequest {
            key_name: name.into(),
            public_key: line.into(),
        }
    }

    #[tokio::test]
    async fn test_reregistration_is_idempotent() {
        let (keys, _, _) = backend();
        let line = ed25519_line(1, "laptop");
        let first = keys.create("u1", req("laptop", &line)).await.unwrap();
        let second = keys.create("u1", req("laptop", &line)).await.unwrap();
        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.key.fingerprint, second.key.fingerprint);
        assert_eq!(first.key.id, second.key.id);
        assert_eq!(keys.list("u1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cross_owner_conflict_leaves_record() {
        let (keys, _, _) = backend();
        let line = ed25519_line(2, "");
        let original = keys.create("u1", req("mine", &line)).await.unwrap();

        let err = keys.create("u2", req("theirs", &line)).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        let listed = keys.list("u1").await.unwrap();
        assert_eq!(listed, vec![original.key]);
        assert!(keys.list("u2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_registration_race_resolves_to_winner() {
        let (keys, store, _) = backend();
        let line = ed25519_line(3, "");
        let fingerprint = parse_public_key(&line).unwrap().fingerprint();

        // Concurrent registrations of one key: exactly one inserts.
        let mut handles = Vec::new();
        for _ in 0..8 {
            let keys = keys.clone();
            let line = line.clone();
            handles.push(tokio::spawn(async move {
                keys.create("u1", req("race", &line)).await
            }));
        }
        let mut created = 0;
        for h in handles {
            if h.await.unwrap().unwrap().created {
                created += 1;
            }
        }
        assert_eq!(created, 1);
        assert!(store.find_ssh_key_by_fingerprint(&fingerprint).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_remove_by_non_owner_is_forbidden() {
        let (keys, _, _) = backend();
        let added = keys
            .create("u1", req("k", &ed25519_line(4, "")))
            .await
            .unwrap();
        assert!(matches!(
            keys.remove("u2", &added.key.id).await,
            Err(AppError::Forbidden)
        ));
        assert_eq!(keys.list("u1").await.unwrap().len(), 1);

        keys.remove("u1", &added.key.id).await.unwrap();
        keys.remove("u1", &added.key.id).await.unwrap();
        keys.remove("u1", "not-a-uuid").await.unwrap();
        assert!(keys.list("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lookup_caches_hits_and_misses() {
        let (keys, store, cache) = backend();
        let line = ed25519_line(5, "");
        let fingerprint = parse_public_key(&line).unwrap().fingerprint();

        assert_eq!(keys.lookup(&fingerprint).await.unwrap(), None);
        assert_eq!(cache.len(), 1);

        // Registering clears the negative entry.
        keys.create("u1", req("k", &line)).await.unwrap();
        assert_eq!(
            keys.lookup(&format!("{fingerprint}=")).await.unwrap().as_deref(),
            Some("u1")
        );

        // Served from cache even if the store row disappears behind our back.
        let id = Uuid::parse_str(&keys.list("u1").await.unwrap()[0].id).unwrap();
        store.delete_ssh_key("u1", id).await.unwrap();
        assert_eq!(keys.lookup(&fingerprint).await.unwrap().as_deref(), Some("u1"));
    }

    #[tokio::test]
    async fn test_remove_invalidates_lookup() {
        let (keys, _, _) = backend();
        let line = ed25519_line(6, "");
        let added = keys.create("u1", req("k", &line)).await.unwrap();
        assert!(keys.lookup(&added.key.fingerprint).await.unwrap().is_some());

        keys.remove("u1", &added.key.id).await.unwrap();
        assert!(keys.lookup(&added.key.fingerprint).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lookup_rejects_malformed_fingerprint() {
        let (keys, _, _) = backend();
        assert!(matches!(
            keys.lookup("SHA256:nope").await,
            Err(AppError::Validation(_))
        ));
    }
}
