//! Token hashing and verification.
//!
//! New secrets are hashed with the algorithm resolved at startup (argon2id
//! or bcrypt). Verification follows whatever algorithm the stored record
//! declares, so `pbkdf2-legacy` records keep working without a migration.

pub mod prefix;

use std::fmt;
use std::str::FromStr;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::config::HashSettings;
use crate::errors::ConfigurationError;

const PBKDF2_ROUNDS: u32 = 100_000;
const PBKDF2_OUTPUT_LEN: usize = 64;

const SECRET_BYTES: usize = 32;

pub const BCRYPT_MIN_COST: u32 = 4;
pub const BCRYPT_MAX_COST: u32 = 31;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HashAlgorithm {
    #[serde(rename = "argon2id")]
    Argon2id,
    #[serde(rename = "bcrypt")]
    Bcrypt,
    #[serde(rename = "pbkdf2-legacy", alias = "pbkdf2")]
    Pbkdf2Legacy,
}

impl HashAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Argon2id => "argon2id",
            HashAlgorithm::Bcrypt => "bcrypt",
            HashAlgorithm::Pbkdf2Legacy => "pbkdf2-legacy",
        }
    }

    /// Whether this build can hash and verify with the algorithm.
    pub fn is_available(&self) -> bool {
        match self {
            HashAlgorithm::Argon2id => cfg!(feature = "argon2"),
            HashAlgorithm::Bcrypt => cfg!(feature = "bcrypt"),
            HashAlgorithm::Pbkdf2Legacy => true,
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "argon2id" => Ok(HashAlgorithm::Argon2id),
            "bcrypt" | "bcrypt-2b" => Ok(HashAlgorithm::Bcrypt),
            "pbkdf2-legacy" | "pbkdf2" => Ok(HashAlgorithm::Pbkdf2Legacy),
            other => Err(format!("unknown hash algorithm '{other}'")),
        }
    }
}

/// A fresh token secret: 32 bytes from the OS RNG, hex-encoded.
pub fn generate_secret() -> Zeroizing<String> {
    let mut bytes = Zeroizing::new([0u8; SECRET_BYTES]);
    rand::rngs::OsRng.fill_bytes(&mut bytes[..]);
    Zeroizing::new(hex::encode(&bytes[..]))
}

/// Hashes freshly generated secrets and verifies presented ones.
///
/// Both operations are CPU-bound; async callers run them on the blocking
/// pool.
#[derive(Clone)]
pub struct TokenHasher {
    algorithm: HashAlgorithm,
    #[cfg(feature = "argon2")]
    argon2_params: argon2::Params,
    #[cfg_attr(not(feature = "bcrypt"), allow(dead_code))]
    bcrypt_cost: u32,
}

impl fmt::Debug for TokenHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenHasher")
            .field("algorithm", &self.algorithm)
            .field("bcrypt_cost", &self.bcrypt_cost)
            .finish_non_exhaustive()
    }
}

impl TokenHasher {
    /// Builds a hasher for an already-resolved algorithm.
    pub fn new(algorithm: HashAlgorithm, settings: &HashSettings) -> Result<Self, ConfigurationError> {
        if algorithm == HashAlgorithm::Pbkdf2Legacy {
            return Err(ConfigurationError::invalid(
                "AUTH_TOKEN_HASH_ALGO",
                "pbkdf2-legacy is verify-only",
            ));
        }
        if !algorithm.is_available() {
            return Err(ConfigurationError::HashUnavailable(format!(
                "{algorithm} support is not compiled into this build"
            )));
        }
        if !(BCRYPT_MIN_COST..=BCRYPT_MAX_COST).contains(&settings.bcrypt_cost) {
            return Err(ConfigurationError::invalid(
                "AUTH_TOKEN_BCRYPT_COST",
                format!("must be between {BCRYPT_MIN_COST} and {BCRYPT_MAX_COST}"),
            ));
        }

        Ok(Self {
            algorithm,
            #[cfg(feature = "argon2")]
            argon2_params: argon2::Params::new(
                settings.argon2_memory_kb,
                settings.argon2_time,
                settings.argon2_parallelism,
                None,
            )
            .map_err(|e| ConfigurationError::invalid("AUTH_TOKEN_ARGON2_*", e.to_string()))?,
            bcrypt_cost: settings.bcrypt_cost,
        })
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Hashes `secret` with the configured algorithm.
    pub fn hash(&self, secret: &str) -> anyhow::Result<String> {
        match self.algorithm {
            #[cfg(feature = "argon2")]
            HashAlgorithm::Argon2id => {
                use argon2::password_hash::{PasswordHasher, SaltString};

                let salt = SaltString::generate(&mut rand::rngs::OsRng);
                let argon2 = argon2::Argon2::new(
                    argon2::Algorithm::Argon2id,
                    argon2::Version::V0x13,
                    self.argon2_params.clone(),
                );
                let hash = argon2
                    .hash_password(secret.as_bytes(), &salt)
                    .map_err(|e| anyhow::anyhow!("argon2 hashing failed: {e}"))?;
                Ok(hash.to_string())
            }
            #[cfg(feature = "bcrypt")]
            HashAlgorithm::Bcrypt => Ok(bcrypt::hash(secret, self.bcrypt_cost)?),
            other => anyhow::bail!("{other} cannot hash new secrets in this build"),
        }
    }

    /// Verifies `secret` against a stored hash of the declared algorithm.
    /// Any parse failure or unsupported algorithm is a mismatch.
    pub fn verify(&self, secret: &str, algorithm: HashAlgorithm, stored: &str) -> bool {
        match algorithm {
            HashAlgorithm::Argon2id => verify_argon2(secret, stored),
            HashAlgorithm::Bcrypt => verify_bcrypt(secret, stored),
            HashAlgorithm::Pbkdf2Legacy => verify_pbkdf2_legacy(secret, stored),
        }
    }
}

#[cfg(feature = "argon2")]
fn verify_argon2(secret: &str, stored: &str) -> bool {
    use argon2::password_hash::{PasswordHash, PasswordVerifier};

    if !stored.starts_with("$argon2") {
        return false;
    }
    let Ok(parsed) = PasswordHash::new(stored) else {
        return false;
    };
    argon2::Argon2::default()
        .verify_password(secret.as_bytes(), &parsed)
        .is_ok()
}

#[cfg(not(feature = "argon2"))]
fn verify_argon2(_secret: &str, _stored: &str) -> bool {
    false
}

#[cfg(feature = "bcrypt")]
fn verify_bcrypt(secret: &str, stored: &str) -> bool {
    stored.starts_with("$2") && bcrypt::verify(secret, stored).unwrap_or(false)
}

#[cfg(not(feature = "bcrypt"))]
fn verify_bcrypt(_secret: &str, _stored: &str) -> bool {
    false
}

/// `pbkdf2$<salt hex>$<derived hex>`, PBKDF2-HMAC-SHA256.
fn verify_pbkdf2_legacy(secret: &str, stored: &str) -> bool {
    let mut parts = stored.split('$');
    let (Some("pbkdf2"), Some(salt_hex), Some(expected_hex), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    let (Ok(salt), Ok(expected)) = (hex::decode(salt_hex), hex::decode(expected_hex)) else {
        return false;
    };
    if expected.len() != PBKDF2_OUTPUT_LEN {
        return false;
    }
    let mut derived = [0u8; PBKDF2_OUTPUT_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(secret.as_bytes(), &salt, PBKDF2_ROUNDS, &mut derived);
    derived.ct_eq(expected.as_slice()).into()
}

#[cfg(test)]
pub(crate) fn hash_pbkdf2_legacy(secret: &str, salt: &[u8]) -> String {
    let mut derived = [0u8; PBKDF2_OUTPUT_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(secret.as_bytes(), salt, PBKDF2_ROUNDS, &mut derived);
    format!("pbkdf2${}${}", hex::encode(salt), hex::encode(derived))
}

#[cfg(test)]
pub(crate) fn test_settings() -> HashSettings {
    HashSettings {
        algorithm: "argon2id".into(),
        allow_bcrypt_fallback: false,
        argon2_time: 1,
        argon2_memory_kb: 1024,
        argon2_parallelism: 1,
        bcrypt_cost: 4,
    }
}
