//! Credential manager: the single entry point for token and SSH key
//! operations. The local/delegated strategy for each credential kind is
//! picked once here and never revisited.

use std::fmt;
use std::sync::Arc;

use crate::cache::{CacheInvalidator, InvalidationMessage, LookupCache};
use crate::config::Config;
use crate::delegate::DelegateClient;
use crate::errors::AppError;
use crate::hashing::{HashAlgorithm, TokenHasher};
use crate::pubsub::InvalidationBus;
use crate::ssh_keys::{
    CreateSshKeyRequest, DelegatedSshKeys, LocalSshKeys, SshKeyBackend, SshKeyCreated, SshKeyView,
};
use crate::store::CredentialStore;
use crate::tokens::{
    CreateTokenRequest, CreatedToken, DelegatedTokens, Introspection, LocalTokens, TokenBackend,
    TokenSummary,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelegationDecision {
    Local,
    Delegated,
}

impl DelegationDecision {
    pub fn from_flag(delegated: bool) -> Self {
        if delegated {
            DelegationDecision::Delegated
        } else {
            DelegationDecision::Local
        }
    }
}

impl fmt::Display for DelegationDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DelegationDecision::Local => f.write_str("local"),
            DelegationDecision::Delegated => f.write_str("delegated"),
        }
    }
}

pub struct CredentialManager {
    tokens: Arc<dyn TokenBackend>,
    ssh_keys: Arc<dyn SshKeyBackend>,
    invalidator: CacheInvalidator,
    store: Arc<dyn CredentialStore>,
    token_mode: DelegationDecision,
    ssh_mode: DelegationDecision,
}

impl CredentialManager {
    /// `algorithm` must already have passed `startup::assert_hash_availability`.
    pub fn new(
        cfg: &Config,
        algorithm: HashAlgorithm,
        store: Arc<dyn CredentialStore>,
        bus: Arc<dyn InvalidationBus>,
        cache: LookupCache,
    ) -> Result<Self, AppError> {
        let hasher = TokenHasher::new(algorithm, &cfg.hash)?;
        let invalidator =
            CacheInvalidator::new(cache, bus, cfg.cache.invalidation_channel.clone());
        let token_mode = DelegationDecision::from_flag(cfg.delegation.tokens);
        let ssh_mode = DelegationDecision::from_flag(cfg.delegation.ssh_keys);

        let local_tokens = LocalTokens::new(
            store.clone(),
            hasher,
            invalidator.clone(),
            cfg.cache.clone(),
        );
        let local_ssh = LocalSshKeys::new(store.clone(), invalidator.clone(), cfg.cache.clone());

        let client = if token_mode == DelegationDecision::Delegated
            || ssh_mode == DelegationDecision::Delegated
        {
            Some(DelegateClient::new(&cfg.delegation)?)
        } else {
            None
        };

        let tokens: Arc<dyn TokenBackend> = match (&client, token_mode) {
            (Some(client), DelegationDecision::Delegated) => {
                Arc::new(DelegatedTokens::new(client.clone(), local_tokens))
            }
            _ => Arc::new(local_tokens),
        };
        let ssh_keys: Arc<dyn SshKeyBackend> = match (&client, ssh_mode) {
            (Some(client), DelegationDecision::Delegated) => {
                Arc::new(DelegatedSshKeys::new(client.clone(), local_ssh))
            }
            _ => Arc::new(local_ssh),
        };

        tracing::info!(
            tokens = %token_mode,
            ssh_keys = %ssh_mode,
            algorithm = %algorithm,
            "credential manager ready"
        );

        Ok(Self {
            tokens,
            ssh_keys,
            invalidator,
            store,
            token_mode,
            ssh_mode,
        })
    }

    pub fn token_mode(&self) -> DelegationDecision {
        self.token_mode
    }

    pub fn ssh_mode(&self) -> DelegationDecision {
        self.ssh_mode
    }

    pub fn cache(&self) -> &LookupCache {
        self.invalidator.cache()
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    // -- Tokens --

    pub async fn create_token(
        &self,
        owner_id: &str,
        req: CreateTokenRequest,
    ) -> Result<CreatedToken, AppError> {
        self.tokens.create(owner_id, req).await
    }

    pub async fn introspect(&self, secret: &str) -> Introspection {
        self.tokens.introspect(secret).await
    }

    pub async fn list_tokens(&self, owner_id: &str) -> Result<Vec<TokenSummary>, AppError> {
        self.tokens.list(owner_id).await
    }

    pub async fn revoke_token(&self, owner_id: &str, token_id: &str) -> Result<(), AppError> {
        self.tokens.revoke(owner_id, token_id).await
    }

    // -- SSH keys --

    pub async fn add_ssh_key(
        &self,
        owner_id: &str,
        req: CreateSshKeyRequest,
    ) -> Result<SshKeyCreated, AppError> {
        self.ssh_keys.create(owner_id, req).await
    }

    pub async fn list_ssh_keys(&self, owner_id: &str) -> Result<Vec<SshKeyView>, AppError> {
        self.ssh_keys.list(owner_id).await
    }

    pub async fn remove_ssh_key(&self, owner_id: &str, key_id: &str) -> Result<(), AppError> {
        self.ssh_keys.remove(owner_id, key_id).await
    }

    pub async fn lookup_ssh_key(&self, fingerprint: &str) -> Result<Option<String>, AppError> {
        self.ssh_keys.lookup(fingerprint).await
    }

    // -- Cache --

    /// Publishes an explicit invalidation for `key` on `channel`. Unlike
    /// mutation-driven invalidations, failure is reported to the caller.
    pub async fn publish_invalidation(&self, channel: &str, key: &str) -> Result<(), AppError> {
        if channel == self.invalidator.channel() {
            self.invalidator.cache().invalidate(key);
        }
        self.invalidator
            .publish(channel, &InvalidationMessage::for_key(key))
            .await
            .map_err(AppError::Internal)
    }
}
