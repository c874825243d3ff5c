use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::errors::AppError;
use crate::ssh_keys::{CreateSshKeyRequest, SshKeyView};
use crate::tokens::{CreateTokenRequest, CreatedToken, Introspection, TokenSummary};
use crate::AppState;

// -- Request / Response DTOs --

#[derive(Deserialize)]
pub struct IntrospectRequest {
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Deserialize)]
pub struct InvalidateRequest {
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerResponse {
    pub owner_id: String,
}

// -- Git tokens --

/// POST /internal/api/users/:user_id/git-tokens
pub async fn create_token(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Json(payload): Json<CreateTokenRequest>,
) -> Result<(StatusCode, Json<CreatedToken>), AppError> {
    let created = state.manager.create_token(&user_id, payload).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// GET /internal/api/users/:user_id/git-tokens
pub async fn list_tokens(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<TokenSummary>>, AppError> {
    Ok(Json(state.manager.list_tokens(&user_id).await?))
}

/// DELETE /internal/api/users/:user_id/git-tokens/:token_id
pub async fn revoke_token(
    State(state): State<Arc<AppState>>,
    Path((user_id, token_id)): Path<(String, String)>,
) -> Result<StatusCode, AppError> {
    state.manager.revoke_token(&user_id, &token_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /internal/api/tokens/introspect
///
/// Always 200 once a token is supplied; every failure is `active: false`.
pub async fn introspect(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<IntrospectRequest>,
) -> Result<Json<Introspection>, AppError> {
    let token = payload
        .token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AppError::Validation("token is required".into()))?;
    Ok(Json(state.manager.introspect(&token).await))
}

// -- SSH keys --

/// POST /internal/api/users/:user_id/ssh-keys
///
/// 201 on first registration, 200 when the same owner re-registers.
pub async fn add_ssh_key(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Json(payload): Json<CreateSshKeyRequest>,
) -> Result<(StatusCode, Json<SshKeyView>), AppError> {
    let outcome = state.manager.add_ssh_key(&user_id, payload).await?;
    let status = if outcome.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(outcome.key)))
}

/// GET /internal/api/users/:user_id/ssh-keys
pub async fn list_ssh_keys(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<SshKeyView>>, AppError> {
    Ok(Json(state.manager.list_ssh_keys(&user_id).await?))
}

/// DELETE /internal/api/users/:user_id/ssh-keys/:key_id
pub async fn remove_ssh_key(
    State(state): State<Arc<AppState>>,
    Path((user_id, key_id)): Path<(String, String)>,
) -> Result<StatusCode, AppError> {
    state.manager.remove_ssh_key(&user_id, &key_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /internal/api/ssh-keys/:fingerprint
pub async fn lookup_ssh_key(
    State(state): State<Arc<AppState>>,
    Path(fingerprint): Path<String>,
) -> Result<Json<OwnerResponse>, AppError> {
    match state.manager.lookup_ssh_key(&fingerprint).await? {
        Some(owner_id) => Ok(Json(OwnerResponse { owner_id })),
        None => Err(AppError::NotFound),
    }
}

// -- Cache --

/// POST /internal/api/cache/invalidate
pub async fn invalidate_cache(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<InvalidateRequest>,
) -> Result<StatusCode, AppError> {
    let (Some(channel), Some(key)) = (
        payload.channel.filter(|c| !c.is_empty()),
        payload.key.filter(|k| !k.is_empty()),
    ) else {
        return Err(AppError::Validation("channel and key are required".into()));
    };
    state.manager.publish_invalidation(&channel, &key).await?;
    Ok(StatusCode::NO_CONTENT)
}
