//! Hash prefix codec.
//!
//! Derives the 8-hex-character lookup key stored next to every token hash.
//! The prefix only narrows a store query to a handful of candidates; it is
//! not secret and it is not unique (4 bytes), so callers must always run a
//! full verification against every candidate that shares it.

use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use sha2::{Digest, Sha256};

use super::HashAlgorithm;
use crate::errors::ConfigurationError;

/// Number of digest bytes rendered into a prefix.
pub const PREFIX_BYTES: usize = 4;

/// Length of a rendered prefix (lowercase hex).
pub const PREFIX_LEN: usize = PREFIX_BYTES * 2;

/// bcrypt's own base64 alphabet (not RFC 4648).
const BCRYPT_ALPHABET: &[u8; 64] =
    b"./ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Width of the hash segment at the end of a bcrypt modular string.
const BCRYPT_HASH_CHARS: usize = 31;

/// The shapes a prefix can be derived from. Set whichever one is at hand;
/// when several are set, raw bytes win, then hex, then the modular string
/// (interpreted per `algorithm`), then base64.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrefixInput<'a> {
    pub algorithm: Option<HashAlgorithm>,
    pub modular: Option<&'a str>,
    pub digest_base64: Option<&'a str>,
    pub raw_bytes: Option<&'a [u8]>,
    pub digest_hex: Option<&'a str>,
}

pub fn compute_hash_prefix(input: &PrefixInput<'_>) -> Result<String, ConfigurationError> {
    if let Some(bytes) = input.raw_bytes {
        return prefix_from_raw_bytes(bytes);
    }
    if let Some(hex_digest) = input.digest_hex {
        return prefix_from_hex(hex_digest);
    }
    if let Some(modular) = input.modular {
        match input.algorithm {
            Some(HashAlgorithm::Argon2id) => return prefix_from_argon2(modular),
            Some(HashAlgorithm::Bcrypt) => return prefix_from_bcrypt(modular),
            _ => {}
        }
    }
    if let Some(b64) = input.digest_base64 {
        return prefix_from_base64(b64);
    }
    Err(ConfigurationError::UnsupportedPrefixInput(
        "expected raw bytes, a hex or base64 digest, or an argon2id/bcrypt modular hash".into(),
    ))
}

/// Prefix used for personal access tokens: the first 4 bytes of the
/// SHA-256 of the plaintext. Salted hashes cannot be recomputed from a
/// presented secret, so creation and introspection both key on this.
pub fn prefix_for_secret(secret: &str) -> String {
    hex::encode(&secret_digest(secret)[..PREFIX_BYTES])
}

/// SHA-256 of the plaintext secret.
pub fn secret_digest(secret: &str) -> [u8; 32] {
    Sha256::digest(secret.as_bytes()).into()
}

pub fn prefix_from_raw_bytes(bytes: &[u8]) -> Result<String, ConfigurationError> {
    if bytes.len() < PREFIX_BYTES {
        return Err(ConfigurationError::UnsupportedPrefixInput(format!(
            "digest too short: {} bytes",
            bytes.len()
        )));
    }
    Ok(hex::encode(&bytes[..PREFIX_BYTES]))
}

pub fn prefix_from_hex(digest_hex: &str) -> Result<String, ConfigurationError> {
    let digest_hex = digest_hex.trim();
    if digest_hex.len() < PREFIX_LEN || !digest_hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ConfigurationError::UnsupportedPrefixInput(
            "hex digest must be at least 8 hex characters".into(),
        ));
    }
    Ok(digest_hex[..PREFIX_LEN].to_ascii_lowercase())
}

pub fn prefix_from_base64(digest_b64: &str) -> Result<String, ConfigurationError> {
    let trimmed = digest_b64.trim().trim_end_matches('=');
    let bytes = STANDARD_NO_PAD
        .decode(trimmed)
        .or_else(|_| URL_SAFE_NO_PAD.decode(trimmed))
        .map_err(|e| ConfigurationError::UnsupportedPrefixInput(format!("invalid base64 digest: {e}")))?;
    prefix_from_raw_bytes(&bytes)
}

/// `$argon2id$v=19$m=...,t=...,p=...$<salt>$<digest>`: the digest is the
/// final `$` segment, unpadded base64.
pub fn prefix_from_argon2(modular: &str) -> Result<String, ConfigurationError> {
    if !modular.starts_with("$argon2") {
        return Err(ConfigurationError::UnsupportedPrefixInput(
            "not an argon2 modular hash".into(),
        ));
    }
    let digest = modular.rsplit('$').next().unwrap_or_default();
    prefix_from_base64(digest)
}

/// `$2b$<cost>$<22 salt chars><31 hash chars>`: the hash is the last 31
/// characters, in bcrypt's base64 alphabet.
pub fn prefix_from_bcrypt(modular: &str) -> Result<String, ConfigurationError> {
    let last = modular.rsplit('$').next().unwrap_or_default();
    if !modular.starts_with("$2") || last.len() < BCRYPT_HASH_CHARS || !last.is_ascii() {
        return Err(ConfigurationError::UnsupportedPrefixInput(
            "not a bcrypt modular hash".into(),
        ));
    }
    let hash = &last[last.len() - BCRYPT_HASH_CHARS..];
    let bytes = decode_bcrypt_base64(hash)?;
    prefix_from_raw_bytes(&bytes)
}

/// Decodes bcrypt-flavoured base64. 31 characters yield the 23 hash bytes.
fn decode_bcrypt_base64(encoded: &str) -> Result<Vec<u8>, ConfigurationError> {
    let mut out = Vec::with_capacity(encoded.len() * 3 / 4);
    let mut acc: u32 = 0;
    let mut bits = 0u32;
    for c in encoded.bytes() {
        let value = BCRYPT_ALPHABET
            .iter()
            .position(|&a| a == c)
            .ok_or_else(|| {
                ConfigurationError::UnsupportedPrefixInput(format!(
                    "invalid bcrypt base64 character {:?}",
                    c as char
                ))
            })? as u32;
        acc = (acc << 6) | value;
        bits += 6;
        if bits >= 8 {
            bits -= 8;
            out.push((acc >> bits) as u8);
            acc &= (1 << bits) - 1;
        }
    }
    Ok(out)
}
