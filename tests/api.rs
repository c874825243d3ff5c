//! HTTP surface tests: the full router driven with `oneshot`.

mod common;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use gitauth::api::build_router;
use gitauth::config::Config;

fn app(cfg: Config) -> Router {
    build_router(common::state(cfg))
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let req = match body {
        Some(b) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(b.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

#[tokio::test]
async fn test_token_round_trip_over_http() {
    let app = app(common::fast_config());

    let (status, created) = send(
        &app,
        "POST",
        "/internal/api/users/u1/git-tokens",
        Some(json!({ "label": "ci", "scopes": ["repo:read"] })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let token = created["token"].as_str().unwrap().to_string();
    let id = created["id"].as_str().unwrap().to_string();
    assert_eq!(created["hashPrefix"].as_str().unwrap().len(), 8);
    assert!(created["expiresAt"].is_null());

    let (status, intro) = send(
        &app,
        "POST",
        "/internal/api/tokens/introspect",
        Some(json!({ "token": token })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(intro["active"], true);
    assert_eq!(intro["userId"], "u1");
    assert_eq!(intro["scopes"], json!(["repo:read"]));

    let (status, listed) = send(&app, "GET", "/internal/api/users/u1/git-tokens", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed.as_array().unwrap().len(), 1);
    assert!(listed[0].get("hash").is_none());
    assert!(listed[0].get("token").is_none());

    let uri = format!("/internal/api/users/u1/git-tokens/{id}");
    let (status, _) = send(&app, "DELETE", &uri, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, intro) = send(
        &app,
        "POST",
        "/internal/api/tokens/introspect",
        Some(json!({ "token": token })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(intro, json!({ "active": false }));
}

#[tokio::test]
async fn test_revoke_for_wrong_owner_is_404() {
    let app = app(common::fast_config());
    let (_, created) = send(
        &app,
        "POST",
        "/internal/api/users/u1/git-tokens",
        Some(json!({ "label": "ci" })),
    )
    .await;
    let uri = format!("/internal/api/users/u2/git-tokens/{}", created["id"].as_str().unwrap());
    let (status, body) = send(&app, "DELETE", &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn test_introspect_requires_token() {
    let app = app(common::fast_config());
    let (status, body) = send(&app, "POST", "/internal/api/tokens/introspect", Some(json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["type"], "invalid_request_error");

    let (status, body) = send(
        &app,
        "POST",
        "/internal/api/tokens/introspect",
        Some(json!({ "token": "nope" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "active": false }));
}

#[tokio::test]
async fn test_ssh_key_lifecycle_over_http() {
    let app = app(common::fast_config());
    let line = common::ed25519_line(10, "alice@laptop");
    let body = json!({ "key_name": "laptop", "public_key": line });

    let (status, first) = send(&app, "POST", "/internal/api/users/alice/ssh-keys", Some(body.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(first["userId"], "alice");
    assert_eq!(first["key_name"], "laptop");

    let (status, second) = send(&app, "POST", "/internal/api/users/alice/ssh-keys", Some(body.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["fingerprint"], second["fingerprint"]);

    let (status, _) = send(&app, "POST", "/internal/api/users/bob/ssh-keys", Some(body)).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let fingerprint = first["fingerprint"].as_str().unwrap();
    let encoded = urlencoding::encode(fingerprint);
    let (status, owner) = send(&app, "GET", &format!("/internal/api/ssh-keys/{encoded}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(owner, json!({ "ownerId": "alice" }));

    let key_uri = format!("/internal/api/users/bob/ssh-keys/{}", first["id"].as_str().unwrap());
    let (status, _) = send(&app, "DELETE", &key_uri, None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let key_uri = format!("/internal/api/users/alice/ssh-keys/{}", first["id"].as_str().unwrap());
    let (status, _) = send(&app, "DELETE", &key_uri, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(&app, "GET", &format!("/internal/api/ssh-keys/{encoded}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_malformed_ssh_key_is_400() {
    let app = app(common::fast_config());
    let (status, body) = send(
        &app,
        "POST",
        "/internal/api/users/alice/ssh-keys",
        Some(json!({ "key_name": "x", "public_key": "ssh-ed25519 not base64" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "validation_failed");
}

#[tokio::test]
async fn test_cache_invalidate_validates_fields() {
    let app = app(common::fast_config());
    let (status, _) = send(
        &app,
        "POST",
        "/internal/api/cache/invalidate",
        Some(json!({ "channel": "auth.cache.invalidate" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        "POST",
        "/internal/api/cache/invalidate",
        Some(json!({ "channel": "auth.cache.invalidate", "key": "ssh:abc" })),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_service_key_guards_internal_api() {
    let mut cfg = common::fast_config();
    cfg.api_key = Some("s3cret-service-key".into());
    let app = app(cfg);

    let (status, _) = send(&app, "GET", "/internal/api/users/u1/git-tokens", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let req = Request::builder()
        .uri("/internal/api/users/u1/git-tokens")
        .header("x-admin-key", "wrong")
        .body(Body::empty())
        .unwrap();
    assert_eq!(app.clone().oneshot(req).await.unwrap().status(), StatusCode::UNAUTHORIZED);

    let req = Request::builder()
        .uri("/internal/api/users/u1/git-tokens")
        .header(header::AUTHORIZATION, "Bearer s3cret-service-key")
        .body(Body::empty())
        .unwrap();
    assert_eq!(app.clone().oneshot(req).await.unwrap().status(), StatusCode::OK);

    // Health endpoints stay open.
    let (status, _) = send(&app, "GET", "/healthz", None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_health_metrics_and_headers() {
    let app = app(common::fast_config());

    let (status, _) = send(&app, "GET", "/readyz", None).await;
    assert_eq!(status, StatusCode::OK);

    let req = Request::builder()
        .uri("/metrics")
        .header("x-request-id", "req-123")
        .body(Body::empty())
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["x-request-id"], "req-123");
    assert_eq!(resp.headers()["cache-control"], "no-store");
    assert_eq!(resp.headers()["x-content-type-options"], "nosniff");
}
