use async_trait::async_trait;
use chrono::Utc;

use super::{
    is_plausible_secret, validate_create, validate_owner, CreateTokenRequest, CreatedToken,
    Introspection, LocalTokens, TokenBackend, TokenSummary,
};
use crate::delegate::{rejection_message, DelegateClient, DelegateOutcome};
use crate::errors::AppError;
use crate::hashing::prefix::prefix_for_secret;
use crate::metrics;

/// Tokens owned by the delegate backend.
///
/// Creation never falls back (a second, local token would be minted) and
/// introspection fails closed. Listing and revocation fall back to the
/// local store.
#[derive(Clone)]
pub struct DelegatedTokens {
    client: DelegateClient,
    local: LocalTokens,
}

impl DelegatedTokens {
    pub fn new(client: DelegateClient, local: LocalTokens) -> Self {
        Self { client, local }
    }
}

/// Maps a delegate 4xx onto the service taxonomy.
pub(crate) fn rejection_to_error(status: u16, body: &str) -> AppError {
    match status {
        404 => AppError::NotFound,
        403 => AppError::Forbidden,
        409 => AppError::Conflict(rejection_message(body)),
        _ => AppError::Validation(rejection_message(body)),
    }
}

#[async_trait]
impl TokenBackend for DelegatedTokens {
    async fn create(
        &self,
        owner_id: &str,
        req: CreateTokenRequest,
    ) -> Result<CreatedToken, AppError> {
        let req = validate_create(owner_id, req, Utc::now())?;
        match self.client.create_token(owner_id, &req).await {
            DelegateOutcome::Ok(mut created) => {
                if created.hash_prefix.is_empty() {
                    created.hash_prefix = prefix_for_secret(&created.token);
                }
                metrics::record_mutation("token", "create");
                tracing::info!(
                    event = "token.created",
                    owner_id = %owner_id,
                    token_id = %created.id,
                    hash_prefix = %created.hash_prefix,
                    delegated = true,
                    "token created"
                );
                Ok(created)
            }
            DelegateOutcome::Rejected { status, body } => {
                tracing::info!(owner_id = %owner_id, status, "delegate rejected token creation");
                Err(AppError::Validation(rejection_message(&body)))
            }
            DelegateOutcome::Unavailable => Err(AppError::DelegationUnavailable),
        }
    }

    async fn introspect(&self, secret: &str) -> Introspection {
        if !is_plausible_secret(secret) {
            metrics::record_introspection(false);
            return Introspection::inactive();
        }
        let result = match self.client.introspect(secret).await {
            DelegateOutcome::Ok(result) if result.active => result,
            DelegateOutcome::Ok(_) => Introspection::inactive(),
            DelegateOutcome::Rejected { .. } => Introspection::inactive(),
            DelegateOutcome::Unavailable => {
                tracing::warn!("delegate unavailable, introspection fails closed");
                Introspection::inactive()
            }
        };
        metrics::record_introspection(result.active);
        result
    }

    async fn list(&self, owner_id: &str) -> Result<Vec<TokenSummary>, AppError> {
        validate_owner(owner_id)?;
        match self.client.list_tokens(owner_id).await {
            DelegateOutcome::Ok(tokens) => Ok(tokens),
            DelegateOutcome::Rejected { status, body } => Err(rejection_to_error(status, &body)),
            DelegateOutcome::Unavailable => {
                tracing::warn!(owner_id = %owner_id, "delegate unavailable, listing local tokens");
                self.local.list(owner_id).await
            }
        }
    }

    async fn revoke(&self, owner_id: &str, token_id: &str) -> Result<(), AppError> {
        match self.client.revoke_token(owner_id, token_id).await {
            DelegateOutcome::Ok(()) => {
                metrics::record_mutation("token", "revoke");
                tracing::info!(
                    event = "token.revoked",
                    owner_id = %owner_id,
                    token_id = %token_id,
                    delegated = true,
                    "token revoked"
                );
                Ok(())
            }
            _ => {
                tracing::warn!(
                    owner_id = %owner_id,
                    token_id = %token_id,
                    "delegate revoke did not succeed, revoking locally"
                );
                self.local.revoke(owner_id, token_id).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::cache::{CacheInvalidator, LookupCache};
    use crate::config::{CacheSettings, DelegationSettings};
    use crate::hashing::{test_settings, HashAlgorithm, TokenHasher};
    use crate::pubsub::LocalBus;
    use crate::store::memory::MemoryStore;

    fn delegated(server_uri: &str, timeout_ms: u64) -> DelegatedTokens {
        let client = DelegateClient::new(&DelegationSettings {
            tokens: true,
            ssh_keys: false,
            base_url: server_uri.to_string(),
            admin_user: None,
            admin_pass: None,
            timeout_ms,
        })
        .unwrap();
        let algorithm = if cfg!(feature = "bcrypt") {
            HashAlgorithm::Bcrypt
        } else {
            HashAlgorithm::Argon2id
        };
        let local = LocalTokens::new(
            Arc::new(MemoryStore::new()),
            TokenHasher::new(algorithm, &test_settings()).unwrap(),
            CacheInvalidator::new(LookupCache::new(), Arc::new(LocalBus::new()), "c"),
            CacheSettings::default(),
        );
        DelegatedTokens::new(client, local)
    }

    #[tokio::test]
    async fn test_introspect_fails_closed_on_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/internal/api/tokens/introspect"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "active": true, "userId": "u1" }))
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let tokens = delegated(&server.uri(), 150);
        let started = Instant::now();
        let intro = tokens.introspect("abc123").await;
        assert!(!intro.active);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_introspect_bad_request_is_inactive() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/internal/api/tokens/introspect"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;
        assert!(!delegated(&server.uri(), 1000).introspect("abc").await.active);
    }

    #[tokio::test]
    async fn test_create_maps_delegate_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/internal/api/users/u1/git-tokens"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "tokenId": "t1",
                "plaintext": "abc123",
                "createdAt": "2026-01-01T00:00:00Z",
            })))
            .mount(&server)
            .await;

        let created = delegated(&server.uri(), 1000)
            .create("u1", CreateTokenRequest::default())
            .await
            .unwrap();
        assert_eq!(created.id, "t1");
        assert_eq!(created.token, "abc123");
        assert_eq!(created.hash_prefix, prefix_for_secret("abc123"));
    }

    #[tokio::test]
    async fn test_create_does_not_fall_back() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/internal/api/users/u1/git-tokens"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let tokens = delegated(&server.uri(), 1000);
        assert!(matches!(
            tokens.create("u1", CreateTokenRequest::default()).await,
            Err(AppError::DelegationUnavailable)
        ));
        // Nothing was minted locally.
        assert!(tokens.local.list("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_rejection_is_validation_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/internal/api/users/u1/git-tokens"))
            .respond_with(
                ResponseTemplate::new(422).set_body_json(json!({ "message": "label taken" })),
            )
            .mount(&server)
            .await;

        match delegated(&server.uri(), 1000)
            .create("u1", CreateTokenRequest::default())
            .await
        {
            Err(AppError::Validation(msg)) => assert_eq!(msg, "label taken"),
            other => panic!("expected validation error, got {:?}", other.map(|c| c.id.clone())),
        }
    }

    #[tokio::test]
    async fn test_list_falls_back_to_local() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/internal/api/users/u1/git-tokens"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let tokens = delegated(&server.uri(), 1000);
        tokens
            .local
            .create("u1", CreateTokenRequest::default())
            .await
            .unwrap();
        assert_eq!(tokens.list("u1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_revoke_falls_back_to_local() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let tokens = delegated(&server.uri(), 1000);
        let created = tokens
            .local
            .create("u1", CreateTokenRequest::default())
            .await
            .unwrap();
        tokens.revoke("u1", &created.id).await.unwrap();
        assert!(!tokens.local.introspect(&created.token).await.active);
    }
}
