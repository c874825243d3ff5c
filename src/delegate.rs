//! HTTP client for the delegate credential backend.
//!
//! Every call is bounded by the configured timeout. Transport failures
//! never surface as errors: the caller gets `DelegateOutcome::Unavailable`
//! and decides whether to fail closed or fall back to the local store.
//! Secrets are sent but never logged; only the operation, status and
//! elapsed time are.

use std::time::{Duration, Instant};

use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::DelegationSettings;
use crate::metrics;
use crate::ssh_keys::SshKeyView;
use crate::tokens::{CreateTokenRequest, CreatedToken, Introspection, TokenSummary};

const API_PREFIX: &str = "/internal/api";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DelegateOutcome<T> {
    Ok(T),
    /// The delegate answered with a 4xx.
    Rejected { status: u16, body: String },
    /// Timeout, network error, 5xx or an unparsable success body.
    Unavailable,
}

impl<T> DelegateOutcome<T> {
    fn map<U>(self, f: impl FnOnce(T) -> U) -> DelegateOutcome<U> {
        match self {
            DelegateOutcome::Ok(v) => DelegateOutcome::Ok(f(v)),
            DelegateOutcome::Rejected { status, body } => DelegateOutcome::Rejected { status, body },
            DelegateOutcome::Unavailable => DelegateOutcome::Unavailable,
        }
    }
}

#[derive(Debug, Deserialize)]
struct OwnerResponse {
    #[serde(rename = "userId", alias = "ownerId", alias = "user_id")]
    user_id: String,
}

#[derive(Clone)]
pub struct DelegateClient {
    client: reqwest::Client,
    base_url: String,
    credentials: Option<(String, String)>,
    timeout: Duration,
}

impl DelegateClient {
    pub fn new(settings: &DelegationSettings) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("gitauth/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let credentials = match (&settings.admin_user, &settings.admin_pass) {
            (Some(user), Some(pass)) => Some((user.clone(), pass.clone())),
            _ => None,
        };
        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            credentials,
            timeout: settings.timeout(),
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    // -- Tokens --

    pub async fn create_token(
        &self,
        owner_id: &str,
        req: &CreateTokenRequest,
    ) -> DelegateOutcome<CreatedToken> {
        let body = json!({
            "label": req.label,
            "scopes": req.scopes,
            "expiresAt": req.expires_at,
            "replace": req.replace,
        });
        let path = format!("/users/{}/git-tokens", enc(owner_id));
        parse(
            "token.create",
            self.execute("token.create", Method::POST, &path, Some(body)).await,
        )
    }

    pub async fn introspect(&self, secret: &str) -> DelegateOutcome<Introspection> {
        parse(
            "token.introspect",
            self.execute(
                "token.introspect",
                Method::POST,
                "/tokens/introspect",
                Some(json!({ "token": secret })),
            )
            .await,
        )
    }

    pub async fn list_tokens(&self, owner_id: &str) -> DelegateOutcome<Vec<TokenSummary>> {
        let path = format!("/users/{}/git-tokens", enc(owner_id));
        parse(
            "token.list",
            self.execute("token.list", Method::GET, &path, None).await,
        )
    }

    pub async fn revoke_token(&self, owner_id: &str, token_id: &str) -> DelegateOutcome<()> {
        let path = format!("/users/{}/git-tokens/{}", enc(owner_id), enc(token_id));
        self.execute("token.revoke", Method::DELETE, &path, None)
            .await
            .map(|_| ())
    }

    // -- SSH keys --

    /// `Ok((created, key))`: `created` is false when the delegate answered
    /// 200 for an already-registered key.
    pub async fn create_ssh_key(
        &self,
        owner_id: &str,
        key_name: &str,
        public_key: &str,
    ) -> DelegateOutcome<(bool, SshKeyView)> {
        let path = format!("/users/{}/ssh-keys", enc(owner_id));
        let body = json!({ "key_name": key_name, "public_key": public_key });
        let outcome = self
            .execute("ssh.create", Method::POST, &path, Some(body))
            .await;
        let created =
            matches!(&outcome, DelegateOutcome::Ok((status, _)) if *status == StatusCode::CREATED);
        parse("ssh.create", outcome).map(|view: SshKeyView| (created, view.normalized()))
    }

    pub async fn list_ssh_keys(&self, owner_id: &str) -> DelegateOutcome<Vec<SshKeyView>> {
        let path = format!("/users/{}/ssh-keys", enc(owner_id));
        parse(
            "ssh.list",
            self.execute("ssh.list", Method::GET, &path, None).await,
        )
        .map(|keys: Vec<SshKeyView>| keys.into_iter().map(SshKeyView::normalized).collect())
    }

    pub async fn remove_ssh_key(&self, owner_id: &str, key_id: &str) -> DelegateOutcome<()> {
        let path = format!("/users/{}/ssh-keys/{}", enc(owner_id), enc(key_id));
        self.execute("ssh.remove", Method::DELETE, &path, None)
            .await
            .map(|_| ())
    }

    /// `Rejected { status: 404, .. }` means the delegate has no such key.
    pub async fn lookup_ssh_key(&self, fingerprint: &str) -> DelegateOutcome<String> {
        let path = format!("/ssh-keys/{}", enc(fingerprint));
        parse(
            "ssh.lookup",
            self.execute("ssh.lookup", Method::GET, &path, None).await,
        )
        .map(|owner: OwnerResponse| owner.user_id)
    }

    /// One bounded round trip. The request future is dropped (and the
    /// connection aborted) when the timeout fires.
    async fn execute(
        &self,
        op: &'static str,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> DelegateOutcome<(StatusCode, String)> {
        let url = format!("{}{}{}", self.base_url, API_PREFIX, path);
        let mut req = self.client.request(method, &url);
        if let Some((user, pass)) = &self.credentials {
            req = req.basic_auth(user, Some(pass));
        }
        if let Some(body) = body {
            req = req.json(&body);
        }

        let started = Instant::now();
        let result = tokio::time::timeout(self.timeout, async {
            let resp = req.send().await?;
            let status = resp.status();
            let text = resp.text().await?;
            Ok::<_, reqwest::Error>((status, text))
        })
        .await;
        let elapsed = started.elapsed();
        let elapsed_ms = elapsed.as_millis() as u64;

        let (outcome, label) = match result {
            Err(_) => {
                tracing::warn!(op, elapsed_ms, "delegate call timed out");
                (DelegateOutcome::Unavailable, "timeout")
            }
            Ok(Err(e)) => {
                tracing::warn!(op, elapsed_ms, error = %e.without_url(), "delegate call failed");
                (DelegateOutcome::Unavailable, "error")
            }
            Ok(Ok((status, text))) if status.is_success() => {
                tracing::debug!(op, status = status.as_u16(), elapsed_ms, "delegate call ok");
                (DelegateOutcome::Ok((status, text)), "ok")
            }
            Ok(Ok((status, text))) if status.is_client_error() => {
                tracing::info!(op, status = status.as_u16(), elapsed_ms, "delegate rejected call");
                (
                    DelegateOutcome::Rejected {
                        status: status.as_u16(),
                        body: text,
                    },
                    "rejected",
                )
            }
            Ok(Ok((status, _))) => {
                tracing::warn!(op, status = status.as_u16(), elapsed_ms, "delegate call failed");
                (DelegateOutcome::Unavailable, "error")
            }
        };
        metrics::record_delegation(op, label, elapsed.as_secs_f64());
        outcome
    }
}

fn parse<T: DeserializeOwned>(
    op: &'static str,
    outcome: DelegateOutcome<(StatusCode, String)>,
) -> DelegateOutcome<T> {
    match outcome {
        DelegateOutcome::Ok((_, text)) => match serde_json::from_str(&text) {
            Ok(v) => DelegateOutcome::Ok(v),
            Err(e) => {
                tracing::warn!(op, error = %e, "delegate returned an unparsable body");
                metrics::record_delegation(op, "unparsable", 0.0);
                DelegateOutcome::Unavailable
            }
        },
        DelegateOutcome::Rejected { status, body } => DelegateOutcome::Rejected { status, body },
        DelegateOutcome::Unavailable => DelegateOutcome::Unavailable,
    }
}

fn enc(segment: &str) -> String {
    urlencoding::encode(segment).into_owned()
}

/// Human-readable message out of a delegate rejection body. Falls back to
/// the raw body, truncated.
pub fn rejection_message(body: &str) -> String {
    if let Ok(v) = serde_json::from_str::<Value>(body) {
        let msg = v
            .pointer("/error/message")
            .or_else(|| v.get("message"))
            .or_else(|| v.get("error"))
            .and_then(Value::as_str);
        if let Some(msg) = msg {
            return msg.to_string();
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        "rejected by credential backend".to_string()
    } else {
        trimmed.chars().take(200).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer, timeout_ms: u64) -> DelegateClient {
        DelegateClient::new(&DelegationSettings {
            tokens: true,
            ssh_keys: true,
            base_url: format!("{}/", server.uri()),
            admin_user: Some("admin".into()),
            admin_pass: Some("pw".into()),
            timeout_ms,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_introspect_sends_basic_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/internal/api/tokens/introspect"))
            // admin:pw
            .and(header("authorization", "Basic YWRtaW46cHc="))
            .and(body_json(json!({ "token": "s3cret" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "active": true,
                "userId": "u1",
                "scopes": ["read"],
            })))
            .expect(1)
            .mount(&server)
            .await;

        let outcome = client_for(&server, 1000).introspect("s3cret").await;
        let DelegateOutcome::Ok(intro) = outcome else {
            panic!("expected Ok, got {:?}", outcome);
        };
        assert!(intro.active);
        assert_eq!(intro.user_id.as_deref(), Some("u1"));
    }

    #[tokio::test]
    async fn test_timeout_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/internal/api/tokens/introspect"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "active": true }))
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let started = Instant::now();
        let outcome = client_for(&server, 100).introspect("s3cret").await;
        assert_eq!(outcome, DelegateOutcome::Unavailable);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_client_errors_are_rejections() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/internal/api/users/u1/ssh-keys"))
            .respond_with(
                ResponseTemplate::new(409).set_body_json(json!({ "message": "key already in use" })),
            )
            .mount(&server)
            .await;

        let outcome = client_for(&server, 1000)
            .create_ssh_key("u1", "laptop", "ssh-ed25519 AAAA")
            .await;
        match outcome {
            DelegateOutcome::Rejected { status, body } => {
                assert_eq!(status, 409);
                assert_eq!(rejection_message(&body), "key already in use");
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_server_errors_and_garbage_are_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/internal/api/users/u1/git-tokens"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/internal/api/users/u2/git-tokens"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let client = client_for(&server, 1000);
        assert_eq!(client.list_tokens("u1").await, DelegateOutcome::Unavailable);
        assert_eq!(client.list_tokens("u2").await, DelegateOutcome::Unavailable);
    }

    #[tokio::test]
    async fn test_path_segments_are_encoded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/internal/api/ssh-keys/SHA256%3Aab%2Fcd"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ownerId": "u5" })))
            .mount(&server)
            .await;

        let outcome = client_for(&server, 1000).lookup_ssh_key("SHA256:ab/cd").await;
        assert_eq!(outcome, DelegateOutcome::Ok("u5".to_string()));
    }

    #[tokio::test]
    async fn test_ssh_create_reports_created_vs_existing() {
        let server = MockServer::start().await;
        let key = json!({
            "id": "k1",
            "key_name": "laptop",
            "public_key": "ssh-ed25519 AAAA",
            "fingerprint": "SHA256:x",
            "userId": "u1",
        });
        Mock::given(method("POST"))
            .and(path("/internal/api/users/u1/ssh-keys"))
            .respond_with(ResponseTemplate::new(201).set_body_json(key.clone()))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/internal/api/users/u2/ssh-keys"))
            .respond_with(ResponseTemplate::new(200).set_body_json(key))
            .mount(&server)
            .await;

        let client = client_for(&server, 1000);
        let DelegateOutcome::Ok((created, view)) =
            client.create_ssh_key("u1", "laptop", "ssh-ed25519 AAAA").await
        else {
            panic!("expected Ok");
        };
        assert!(created);
        assert_eq!(view.label, "laptop");

        let DelegateOutcome::Ok((created, _)) =
            client.create_ssh_key("u2", "laptop", "ssh-ed25519 AAAA").await
        else {
            panic!("expected Ok");
        };
        assert!(!created);
    }

    #[tokio::test]
    async fn test_unreachable_delegate_is_unavailable() {
        let client = DelegateClient::new(&DelegationSettings {
            tokens: true,
            ssh_keys: false,
            base_url: "http://127.0.0.1:9".into(),
            admin_user: None,
            admin_pass: None,
            timeout_ms: 500,
        })
        .unwrap();
        assert_eq!(client.revoke_token("u1", "t1").await, DelegateOutcome::Unavailable);
    }

    #[test]
    fn test_rejection_message_shapes() {
        assert_eq!(
            rejection_message(r#"{"error":{"message":"bad label"}}"#),
            "bad label"
        );
        assert_eq!(rejection_message(r#"{"error":"nope"}"#), "nope");
        assert_eq!(rejection_message("plain text"), "plain text");
        assert_eq!(rejection_message(""), "rejected by credential backend");
    }
}
