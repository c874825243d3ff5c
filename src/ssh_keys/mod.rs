//! SSH public keys.
//!
//! A fingerprint belongs to exactly one owner across the whole store.
//! Re-registering your own key is a no-op; claiming someone else's is a
//! conflict.

pub mod delegated;
pub mod local;

use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine as _;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::AppError;
use crate::store::UserSshKey;

pub use delegated::DelegatedSshKeys;
pub use local::LocalSshKeys;

pub const MAX_KEY_NAME_LEN: usize = 128;
const MAX_PUBLIC_KEY_LEN: usize = 16 * 1024;

pub const SUPPORTED_KEY_TYPES: &[&str] = &[
    "ssh-rsa",
    "ssh-dss",
    "ssh-ed25519",
    "ecdsa-sha2-nistp256",
    "ecdsa-sha2-nistp384",
    "ecdsa-sha2-nistp521",
    "sk-ssh-ed25519@openssh.com",
    "sk-ecdsa-sha2-nistp256@openssh.com",
];

static FINGERPRINT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^SHA256:[A-Za-z0-9+/]{43}$").expect("valid fingerprint regex"));

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateSshKeyRequest {
    #[serde(default, alias = "keyName", alias = "label")]
    pub key_name: String,
    #[serde(default, alias = "publicKey", alias = "key")]
    pub public_key: String,
}

/// Wire shape of a registered key, shared by the HTTP API and the delegate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshKeyView {
    #[serde(alias = "_id", alias = "keyId")]
    pub id: String,
    #[serde(default, alias = "keyName")]
    pub key_name: String,
    #[serde(default)]
    pub label: String,
    #[serde(default, alias = "publicKey")]
    pub public_key: String,
    #[serde(default)]
    pub fingerprint: String,
    #[serde(default = "Utc::now", alias = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now", alias = "updatedAt")]
    pub updated_at: DateTime<Utc>,
    #[serde(default, rename = "userId", alias = "ownerId", alias = "user_id")]
    pub user_id: String,
}

impl SshKeyView {
    /// Fills whichever of `key_name`/`label` the delegate left out.
    pub fn normalized(mut self) -> Self {
        if self.key_name.is_empty() {
            self.key_name = self.label.clone();
        } else if self.label.is_empty() {
            self.label = self.key_name.clone();
        }
        self
    }
}

impl From<&UserSshKey> for SshKeyView {
    fn from(k: &UserSshKey) -> Self {
        Self {
            id: k.id.to_string(),
            key_name: k.key_name.clone(),
            label: k.key_name.clone(),
            public_key: k.public_key.clone(),
            fingerprint: k.fingerprint.clone(),
            created_at: k.created_at,
            updated_at: k.updated_at,
            user_id: k.owner_id.clone(),
        }
    }
}

/// Result of a registration: `created == false` for an idempotent repeat.
#[derive(Debug, Clone)]
pub struct SshKeyCreated {
    pub created: bool,
    pub key: SshKeyView,
}

#[async_trait]
pub trait SshKeyBackend: Send + Sync {
    async fn create(&self, owner_id: &str, req: CreateSshKeyRequest)
        -> Result<SshKeyCreated, AppError>;

    async fn list(&self, owner_id: &str) -> Result<Vec<SshKeyView>, AppError>;

    async fn remove(&self, owner_id: &str, key_id: &str) -> Result<(), AppError>;

    /// Owner of the key with this fingerprint, if any.
    async fn lookup(&self, fingerprint: &str) -> Result<Option<String>, AppError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPublicKey {
    pub key_type: String,
    pub blob: Vec<u8>,
    pub comment: Option<String>,
}

impl ParsedPublicKey {
    /// `SHA256:` + unpadded base64 of the blob digest, as `ssh-keygen -l`
    /// prints it.
    pub fn fingerprint(&self) -> String {
        format!("SHA256:{}", STANDARD_NO_PAD.encode(Sha256::digest(&self.blob)))
    }

    /// `<type> <base64>[ <comment>]` with whitespace collapsed.
    pub fn canonical(&self) -> String {
        let mut out = format!("{} {}", self.key_type, STANDARD.encode(&self.blob));
        if let Some(comment) = &self.comment {
            out.push(' ');
            out.push_str(comment);
        }
        out
    }
}

/// Parses an OpenSSH `authorized_keys`-style public key line.
pub fn parse_public_key(line: &str) -> Result<ParsedPublicKey, AppError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(AppError::Validation("public_key is required".into()));
    }
    if line.len() > MAX_PUBLIC_KEY_LEN {
        return Err(AppError::Validation("public_key is too long".into()));
    }

    let mut parts = line.split_whitespace();
    let key_type = parts.next().unwrap_or_default();
    if !SUPPORTED_KEY_TYPES.contains(&key_type) {
        return Err(AppError::Validation(format!(
            "unsupported key type '{key_type}'"
        )));
    }
    let encoded = parts
        .next()
        .ok_or_else(|| AppError::Validation("public_key is missing key material".into()))?;
    let blob = STANDARD
        .decode(encoded)
        .map_err(|_| AppError::Validation("public_key material is not valid base64".into()))?;

    let embedded = read_ssh_string(&blob)
        .ok_or_else(|| AppError::Validation("public_key material is truncated".into()))?;
    if embedded != key_type.as_bytes() {
        return Err(AppError::Validation(
            "public_key material does not match its declared type".into(),
        ));
    }

    let comment: Vec<&str> = parts.collect();
    Ok(ParsedPublicKey {
        key_type: key_type.to_string(),
        blob,
        comment: (!comment.is_empty()).then(|| comment.join(" ")),
    })
}

/// First length-prefixed string of an SSH wire blob.
fn read_ssh_string(blob: &[u8]) -> Option<&[u8]> {
    let len_bytes: [u8; 4] = blob.get(..4)?.try_into().ok()?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    blob.get(4..4usize.checked_add(len)?)
}

/// Accepts `SHA256:` + 43 base64 characters, with or without `=` padding,
/// and returns the unpadded form.
pub fn normalize_fingerprint(input: &str) -> Result<String, AppError> {
    let trimmed = input.trim().trim_end_matches('=');
    if !FINGERPRINT_RE.is_match(trimmed) {
        return Err(AppError::Validation(
            "fingerprint must be SHA256: followed by 43 base64 characters".into(),
        ));
    }
    // Rejects non-canonical trailing bits.
    let digest = STANDARD_NO_PAD
        .decode(&trimmed["SHA256:".len()..])
        .map_err(|_| AppError::Validation("fingerprint is not valid base64".into()))?;
    if digest.len() != 32 {
        return Err(AppError::Validation("fingerprint must encode 32 bytes".into()));
    }
    Ok(trimmed.to_string())
}

/// Padded form of a normalized fingerprint, the form delegates index by.
pub fn padded_fingerprint(normalized: &str) -> String {
    format!("{normalized}=")
}

/// Key name from the request, else the key comment.
pub fn resolve_key_name(requested: &str, parsed: &ParsedPublicKey) -> Result<String, AppError> {
    let name = match requested.trim() {
        "" => parsed.comment.clone().unwrap_or_default(),
        name => name.to_string(),
    };
    if name.is_empty() {
        return Err(AppError::Validation("key_name is required".into()));
    }
    if name.chars().count() > MAX_KEY_NAME_LEN {
        return Err(AppError::Validation(format!(
            "key_name must be at most {MAX_KEY_NAME_LEN} characters"
        )));
    }
    Ok(name)
}


#[cfg(test)]
mod tests {
    use super::test_keys::ed25519_line;
    use super::*;

    #[test]
    fn test_parse_valid_key() {
        let line = ed25519_line(7, "alice@laptop");
        let parsed = parse_public_key(&format!("  {line}\n")).unwrap();
        assert_eq!(parsed.key_type, "ssh-ed25519");
        assert_eq!(parsed.comment.as_deref(), Some("alice@laptop"));
        assert_eq!(parsed.canonical(), line);

        let fp = parsed.fingerprint();
        assert!(fp.starts_with("SHA256:"));
        assert_eq!(fp.len(), "SHA256:".len() + 43);
        assert_eq!(normalize_fingerprint(&fp).unwrap(), fp);
    }

    #[test]
    fn test_fingerprint_ignores_comment() {
        let a = parse_public_key(&ed25519_line(1, "one")).unwrap();
        let b = parse_public_key(&ed25519_line(1, "two")).unwrap();
        let c = parse_public_key(&ed25519_line(2, "one")).unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn test_rejects_malformed_keys() {
        assert!(parse_public_key("").is_err());
        assert!(parse_public_key("ssh-foo AAAA").is_err());
        assert!(parse_public_key("ssh-ed25519").is_err());
        assert!(parse_public_key("ssh-ed25519 !!!notbase64").is_err());
        // Declared type disagrees with the blob.
        let line = ed25519_line(3, "");
        let mismatched = line.replacen("ssh-ed25519", "ssh-rsa", 1);
        assert!(parse_public_key(&mismatched).is_err());
        // Truncated blob.
        assert!(parse_public_key(&format!("ssh-ed25519 {}", STANDARD.encode([0, 0, 0, 99, b's']))).is_err());
    }

    #[test]
    fn test_fingerprint_padding_is_normalized() {
        let fp = parse_public_key(&ed25519_line(9, "")).unwrap().fingerprint();
        assert_eq!(normalize_fingerprint(&format!("{fp}=")).unwrap(), fp);
        let padded = padded_fingerprint(&fp);
        assert_eq!(padded.len(), "SHA256:".len() + 44);
        assert_eq!(normalize_fingerprint(&padded).unwrap(), fp);
        assert!(normalize_fingerprint("SHA256:short").is_err());
        assert!(normalize_fingerprint("MD5:aa:bb").is_err());
    }

    #[test]
    fn test_key_name_falls_back_to_comment() {
        let parsed = parse_public_key(&ed25519_line(4, "work")).unwrap();
        assert_eq!(resolve_key_name("", &parsed).unwrap(), "work");
        assert_eq!(resolve_key_name(" laptop ", &parsed).unwrap(), "laptop");

        let bare = parse_public_key(&ed25519_line(4, "")).unwrap();
        assert!(resolve_key_name("", &bare).is_err());
    }

    #[test]
    fn test_view_normalizes_label() {
        let view: SshKeyView = serde_json::from_value(serde_json::json!({
            "_id": "k1",
            "label": "laptop",
            "publicKey": "ssh-ed25519 AAAA",
            "fingerprint": "SHA256:x",
            "ownerId": "u1",
        }))
        .unwrap();
        let view = view.normalized();
        assert_eq!(view.key_name, "laptop");
        assert_eq!(view.user_id, "u1");
    }
}
