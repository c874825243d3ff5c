use async_trait::async_trait;

use super::{
    normalize_fingerprint, padded_fingerprint, parse_public_key, resolve_key_name,
    CreateSshKeyRequest, LocalSshKeys, SshKeyBackend, SshKeyCreated, SshKeyView,
};
use crate::delegate::{rejection_message, DelegateClient, DelegateOutcome};
use crate::errors::AppError;
use crate::metrics;
use crate::tokens::delegated::rejection_to_error;
use crate::tokens::validate_owner;

/// SSH keys owned by the delegate backend, with the local store as the
/// fallback whenever the delegate cannot be reached. Registration is an
/// idempotent upsert on either side, so falling back cannot double-create.
#[derive(Clone)]
pub struct DelegatedSshKeys {
    client: DelegateClient,
    local: LocalSshKeys,
}

impl DelegatedSshKeys {
    pub fn new(client: DelegateClient, local: LocalSshKeys) -> Self {
        Self { client, local }
    }

    /// Fingerprint of `key_id`, from the local row if there is one, else
    /// from the delegate's listing. Must run before the delete.
    async fn fingerprint_of(
        &self,
        owner_id: &str,
        key_id: &str,
    ) -> Result<Option<String>, AppError> {
        if let Some(fingerprint) = self.local.local_fingerprint(key_id).await? {
            return Ok(Some(fingerprint));
        }
        match self.client.list_ssh_keys(owner_id).await {
            DelegateOutcome::Ok(keys) => Ok(keys
                .into_iter()
                .find(|k| k.id == key_id)
                .and_then(|k| normalize_fingerprint(&k.fingerprint).ok())),
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl SshKeyBackend for DelegatedSshKeys {
    async fn create(
        &self,
        owner_id: &str,
        req: CreateSshKeyRequest,
    ) -> Result<SshKeyCreated, AppError> {
        validate_owner(owner_id)?;
        // Reject garbage before it leaves the process.
        let parsed = parse_public_key(&req.public_key)?;
        let key_name = resolve_key_name(&req.key_name, &parsed)?;
        let public_key = parsed.canonical();

        match self
            .client
            .create_ssh_key(owner_id, &key_name, &public_key)
            .await
        {
            DelegateOutcome::Ok((created, mut key)) => {
                if key.fingerprint.is_empty() {
                    key.fingerprint = parsed.fingerprint();
                }
                if key.user_id.is_empty() {
                    key.user_id = owner_id.to_string();
                }
                let event = if created {
                    metrics::record_mutation("ssh_key", "create");
                    "sshkey.added"
                } else {
                    "sshkey.added.idempotent"
                };
                tracing::info!(
                    event,
                    owner_id = %owner_id,
                    fingerprint = %key.fingerprint,
                    delegated = true,
                    "ssh key registered"
                );
                self.local.announce(owner_id, &key.fingerprint).await;
                Ok(SshKeyCreated { created, key })
            }
            DelegateOutcome::Rejected { status: 409, body } => {
                Err(AppError::Conflict(rejection_message(&body)))
            }
            DelegateOutcome::Rejected { body, .. } => {
                Err(AppError::Validation(rejection_message(&body)))
            }
            DelegateOutcome::Unavailable => {
                tracing::warn!(owner_id = %owner_id, "delegate unavailable, registering ssh key locally");
                self.local
                    .create(
                        owner_id,
                        CreateSshKeyRequest {
                            key_name,
                            public_key,
                        },
                    )
                    .await
            }
        }
    }

    async fn list(&self, owner_id: &str) -> Result<Vec<SshKeyView>, AppError> {
        validate_owner(owner_id)?;
        match self.client.list_ssh_keys(owner_id).await {
            DelegateOutcome::Ok(keys) => Ok(keys),
            DelegateOutcome::Rejected { status, body } => Err(rejection_to_error(status, &body)),
            DelegateOutcome::Unavailable => {
                tracing::warn!(owner_id = %owner_id, "delegate unavailable, listing local ssh keys");
                self.local.list(owner_id).await
            }
        }
    }

    async fn remove(&self, owner_id: &str, key_id: &str) -> Result<(), AppError> {
        let fingerprint = self.fingerprint_of(owner_id, key_id).await?;
        match self.client.remove_ssh_key(owner_id, key_id).await {
            DelegateOutcome::Ok(()) | DelegateOutcome::Rejected { status: 404, .. } => {
                metrics::record_mutation("ssh_key", "remove");
                tracing::info!(
                    event = "sshkey.removed",
                    owner_id = %owner_id,
                    key_id = %key_id,
                    fingerprint = fingerprint.as_deref().unwrap_or(""),
                    delegated = true,
                    "ssh key removed"
                );
                match &fingerprint {
                    Some(fp) => self.local.forget(owner_id, fp).await,
                    None => tracing::warn!(
                        owner_id = %owner_id,
                        key_id = %key_id,
                        "fingerprint of removed key unknown, cached lookups expire by ttl"
                    ),
                }
                // The row may also exist locally from an earlier fallback.
                self.local.remove(owner_id, key_id).await
            }
            DelegateOutcome::Rejected { status: 403, .. } => Err(AppError::Forbidden),
            _ => {
                tracing::warn!(
                    owner_id = %owner_id,
                    key_id = %key_id,
                    "delegate remove did not succeed, removing locally"
                );
                self.local.remove(owner_id, key_id).await
            }
        }
    }

    async fn lookup(&self, fingerprint: &str) -> Result<Option<String>, AppError> {
        let fingerprint = normalize_fingerprint(fingerprint)?;
        if let Some(owner) = self.local.cached_owner(&fingerprint) {
            return Ok(owner);
        }
        let seen = self.local.lookup_generation(&fingerprint);
        if let Some(owner) = self.local.store_owner(&fingerprint).await? {
            self.local.remember_lookup(&fingerprint, Some(owner.clone()), seen);
            return Ok(Some(owner));
        }
        match self
            .client
            .lookup_ssh_key(&padded_fingerprint(&fingerprint))
            .await
        {
            DelegateOutcome::Ok(owner) => {
                self.local.remember_lookup(&fingerprint, Some(owner.clone()), seen);
                Ok(Some(owner))
            }
            DelegateOutcome::Rejected { .. } => {
                self.local.remember_lookup(&fingerprint, None, seen);
                Ok(None)
            }
            // Not cached: the delegate may know the key once it recovers.
            DelegateOutcome::Unavailable => Ok(None),
        }
    }
}
