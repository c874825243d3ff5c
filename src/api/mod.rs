use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Router,
};
use subtle::ConstantTimeEq;
use tower_http::trace::TraceLayer;

use crate::metrics;
use crate::AppState;

pub mod handlers;

/// Build the internal API router.
/// All routes are relative; the caller mounts this under `/internal/api`.
pub fn api_router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/users/:user_id/git-tokens",
            get(handlers::list_tokens).post(handlers::create_token),
        )
        .route(
            "/users/:user_id/git-tokens/:token_id",
            delete(handlers::revoke_token),
        )
        .route("/tokens/introspect", post(handlers::introspect))
        .route(
            "/users/:user_id/ssh-keys",
            get(handlers::list_ssh_keys).post(handlers::add_ssh_key),
        )
        .route(
            "/users/:user_id/ssh-keys/:key_id",
            delete(handlers::remove_ssh_key),
        )
        .route("/ssh-keys/:fingerprint", get(handlers::lookup_ssh_key))
        .route("/cache/invalidate", post(handlers::invalidate_cache))
        .layer(middleware::from_fn_with_state(state, service_auth))
        .fallback(fallback_404)
}

/// The full application: health and metrics at the root, the internal API
/// under `/internal/api`.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(readiness_check))
        .route("/metrics", get(metrics_handler))
        .nest("/internal/api", api_router(state.clone()))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(request_id_middleware))
        .layer(middleware::from_fn(security_headers_middleware))
}

async fn fallback_404() -> StatusCode {
    StatusCode::NOT_FOUND
}

async fn readiness_check(State(state): State<Arc<AppState>>) -> StatusCode {
    match state.manager.store().ping().await {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            tracing::warn!(error = %e, "readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4",
        )],
        metrics::encode_metrics(),
    )
}

/// Middleware: validates `X-Admin-Key` (or a Bearer token) against the
/// configured service key. Without a configured key the API is open, which
/// is only sensible behind a private network boundary.
async fn service_auth(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(expected) = state.config.api_key.as_deref() else {
        return Ok(next.run(req).await);
    };

    let provided_key = req
        .headers()
        .get("x-admin-key")
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            req.headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(|t| t.trim())
        });

    match provided_key {
        Some(k) if bool::from(k.as_bytes().ct_eq(expected.as_bytes())) => Ok(next.run(req).await),
        Some(_) => {
            // Never log the provided key, not even partially.
            tracing::warn!("internal API: invalid service key");
            Err(StatusCode::UNAUTHORIZED)
        }
        None => {
            tracing::warn!("internal API: missing X-Admin-Key header");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

/// Middleware: echoes the caller's X-Request-Id, or mints one, on every
/// response.
async fn request_id_middleware(req: Request, next: Next) -> Response {
    let req_id = req
        .headers()
        .get("x-request-id")
        .cloned()
        .or_else(|| HeaderValue::from_str(&uuid::Uuid::new_v4().to_string()).ok());
    let mut resp = next.run(req).await;
    if let Some(val) = req_id {
        resp.headers_mut().insert("x-request-id", val);
    }
    resp
}

/// Middleware: credential responses must never be cached or sniffed.
async fn security_headers_middleware(req: Request, next: Next) -> Response {
    let mut resp = next.run(req).await;
    let headers = resp.headers_mut();

    headers.insert("X-Content-Type-Options", HeaderValue::from_static("nosniff"));
    headers.insert("X-Frame-Options", HeaderValue::from_static("DENY"));
    // Plaintext tokens appear in create responses exactly once.
    headers.insert("Cache-Control", HeaderValue::from_static("no-store"));
    headers.insert("Referrer-Policy", HeaderValue::from_static("no-referrer"));
    headers.remove("Server");

    resp
}
