//! Startup checks. Anything wrong here aborts the process before a single
//! credential is hashed.

use url::Url;

use crate::config::Config;
use crate::errors::ConfigurationError;
use crate::hashing::{HashAlgorithm, BCRYPT_MAX_COST, BCRYPT_MIN_COST};

/// Rejects structurally invalid configuration.
pub fn validate_config(cfg: &Config) -> Result<(), ConfigurationError> {
    if cfg.cache.lookup_ttl_secs == 0 {
        return Err(ConfigurationError::invalid(
            "CACHE_LOOKUP_TTL_SECONDS",
            "must be greater than zero",
        ));
    }
    if cfg.cache.invalidation_channel.trim().is_empty() {
        return Err(ConfigurationError::invalid(
            "CACHE_INVALIDATION_CHANNEL",
            "must not be empty",
        ));
    }
    if cfg.delegation.timeout_ms == 0 {
        return Err(ConfigurationError::invalid(
            "WEBPROFILE_FETCH_TIMEOUT_MS",
            "must be greater than zero",
        ));
    }
    if !(BCRYPT_MIN_COST..=BCRYPT_MAX_COST).contains(&cfg.hash.bcrypt_cost) {
        return Err(ConfigurationError::invalid(
            "AUTH_TOKEN_BCRYPT_COST",
            format!("must be between {BCRYPT_MIN_COST} and {BCRYPT_MAX_COST}"),
        ));
    }
    if cfg.hash.argon2_time == 0 || cfg.hash.argon2_parallelism == 0 {
        return Err(ConfigurationError::invalid(
            "AUTH_TOKEN_ARGON2_*",
            "time and parallelism must be greater than zero",
        ));
    }

    if cfg.delegation.tokens || cfg.delegation.ssh_keys {
        let url = Url::parse(&cfg.delegation.base_url).map_err(|e| {
            ConfigurationError::invalid("AUTH_LOCAL_INTROSPECT_URL", e.to_string())
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigurationError::invalid(
                "AUTH_LOCAL_INTROSPECT_URL",
                "must be an http(s) URL",
            ));
        }
        if cfg.delegation.admin_user.is_some() != cfg.delegation.admin_pass.is_some() {
            return Err(ConfigurationError::invalid(
                "WEBPROFILE_ADMIN_USER",
                "WEBPROFILE_ADMIN_USER and WEBPROFILE_ADMIN_PASS must be set together",
            ));
        }
    }
    Ok(())
}

/// Resolves the configured hash algorithm to one this build can run.
///
/// argon2id without argon2 support falls back to bcrypt only when
/// `AUTH_TOKEN_ALLOW_BCRYPT_FALLBACK` is set. Anything else unavailable is
/// fatal.
pub fn assert_hash_availability(cfg: &Config) -> Result<HashAlgorithm, ConfigurationError> {
    assert_hash_availability_with(cfg, |algo| algo.is_available())
}

pub fn assert_hash_availability_with<F>(
    cfg: &Config,
    available: F,
) -> Result<HashAlgorithm, ConfigurationError>
where
    F: Fn(HashAlgorithm) -> bool,
{
    let requested: HashAlgorithm = cfg
        .hash
        .algorithm
        .parse()
        .map_err(|e: String| ConfigurationError::invalid("AUTH_TOKEN_HASH_ALGO", e))?;

    match requested {
        HashAlgorithm::Pbkdf2Legacy => Err(ConfigurationError::invalid(
            "AUTH_TOKEN_HASH_ALGO",
            "pbkdf2-legacy is verify-only; choose argon2id or bcrypt",
        )),
        algo if available(algo) => Ok(algo),
        HashAlgorithm::Argon2id => {
            if cfg.hash.allow_bcrypt_fallback && available(HashAlgorithm::Bcrypt) {
                tracing::warn!(
                    "argon2id is unavailable in this build, falling back to bcrypt \
                     (AUTH_TOKEN_ALLOW_BCRYPT_FALLBACK=true)"
                );
                Ok(HashAlgorithm::Bcrypt)
            } else {
                Err(ConfigurationError::HashUnavailable(
                    "argon2id requested but argon2 support is unavailable; set \
                     AUTH_TOKEN_ALLOW_BCRYPT_FALLBACK=true or choose bcrypt"
                        .into(),
                ))
            }
        }
        other => Err(ConfigurationError::HashUnavailable(format!(
            "{other} requested but its implementation is unavailable"
        ))),
    }
}
