use std::str::FromStr;
use std::time::Duration;

use crate::errors::ConfigurationError;

pub const DEFAULT_PORT: u16 = 3900;
pub const DEFAULT_INVALIDATION_CHANNEL: &str = "auth.cache.invalidate";
pub const DEFAULT_DELEGATE_URL: &str = "http://localhost:3900";

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Unset runs against the in-memory store.
    pub database_url: Option<String>,
    /// Unset uses the in-process invalidation bus.
    pub redis_url: Option<String>,
    /// Shared key guarding `/internal/api`. Unset leaves the API open.
    pub api_key: Option<String>,
    pub hash: HashSettings,
    pub cache: CacheSettings,
    pub delegation: DelegationSettings,
}

#[derive(Debug, Clone)]
pub struct HashSettings {
    /// Raw `AUTH_TOKEN_HASH_ALGO`; resolved by `startup::assert_hash_availability`.
    pub algorithm: String,
    pub allow_bcrypt_fallback: bool,
    pub argon2_time: u32,
    pub argon2_memory_kb: u32,
    pub argon2_parallelism: u32,
    pub bcrypt_cost: u32,
}

impl Default for HashSettings {
    fn default() -> Self {
        Self {
            algorithm: "argon2id".into(),
            allow_bcrypt_fallback: false,
            argon2_time: 2,
            argon2_memory_kb: 65536,
            argon2_parallelism: 4,
            bcrypt_cost: 12,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub lookup_ttl_secs: u64,
    pub negative_ttl_secs: u64,
    pub invalidation_channel: String,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            lookup_ttl_secs: 60,
            negative_ttl_secs: 5,
            invalidation_channel: DEFAULT_INVALIDATION_CHANNEL.into(),
        }
    }
}

#[derive(Clone)]
pub struct DelegationSettings {
    pub tokens: bool,
    pub ssh_keys: bool,
    pub base_url: String,
    pub admin_user: Option<String>,
    pub admin_pass: Option<String>,
    pub timeout_ms: u64,
}

impl DelegationSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl std::fmt::Debug for DelegationSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelegationSettings")
            .field("tokens", &self.tokens)
            .field("ssh_keys", &self.ssh_keys)
            .field("base_url", &self.base_url)
            .field("admin_user", &self.admin_user)
            .field("admin_pass", &self.admin_pass.as_ref().map(|_| "[REDACTED]"))
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}

impl Default for DelegationSettings {
    fn default() -> Self {
        Self {
            tokens: false,
            ssh_keys: false,
            base_url: DEFAULT_DELEGATE_URL.into(),
            admin_user: None,
            admin_pass: None,
            timeout_ms: 3000,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            database_url: None,
            redis_url: None,
            api_key: None,
            hash: HashSettings::default(),
            cache: CacheSettings::default(),
            delegation: DelegationSettings::default(),
        }
    }
}

pub fn load() -> Result<Config, ConfigurationError> {
    dotenvy::dotenv().ok();
    load_from(|key| std::env::var(key).ok())
}

/// Builds the config from an arbitrary variable source. Empty values count
/// as unset.
pub fn load_from<F>(lookup: F) -> Result<Config, ConfigurationError>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
    let defaults = Config::default();

    Ok(Config {
        port: parse_or(&get, "GITAUTH_PORT", defaults.port)?,
        database_url: get("DATABASE_URL"),
        redis_url: get("REDIS_URL"),
        api_key: get("GITAUTH_API_KEY"),
        hash: HashSettings {
            algorithm: get("AUTH_TOKEN_HASH_ALGO")
                .map(|v| v.to_ascii_lowercase())
                .unwrap_or(defaults.hash.algorithm),
            allow_bcrypt_fallback: flag_or(
                &get,
                "AUTH_TOKEN_ALLOW_BCRYPT_FALLBACK",
                defaults.hash.allow_bcrypt_fallback,
            )?,
            argon2_time: parse_or(&get, "AUTH_TOKEN_ARGON2_TIME", defaults.hash.argon2_time)?,
            argon2_memory_kb: parse_or(
                &get,
                "AUTH_TOKEN_ARGON2_MEMORY_KB",
                defaults.hash.argon2_memory_kb,
            )?,
            argon2_parallelism: parse_or(
                &get,
                "AUTH_TOKEN_ARGON2_PARALLELISM",
                defaults.hash.argon2_parallelism,
            )?,
            bcrypt_cost: parse_or(&get, "AUTH_TOKEN_BCRYPT_COST", defaults.hash.bcrypt_cost)?,
        },
        cache: CacheSettings {
            lookup_ttl_secs: parse_or(
                &get,
                "CACHE_LOOKUP_TTL_SECONDS",
                defaults.cache.lookup_ttl_secs,
            )?,
            negative_ttl_secs: parse_or(
                &get,
                "CACHE_NEGATIVE_TTL_SECONDS",
                defaults.cache.negative_ttl_secs,
            )?,
            invalidation_channel: get("CACHE_INVALIDATION_CHANNEL")
                .unwrap_or(defaults.cache.invalidation_channel),
        },
        delegation: DelegationSettings {
            tokens: flag_or(&get, "AUTH_TOKEN_USE_WEBPROFILE_API", defaults.delegation.tokens)?,
            ssh_keys: flag_or(&get, "AUTH_SSH_USE_WEBPROFILE_API", defaults.delegation.ssh_keys)?,
            base_url: get("AUTH_LOCAL_INTROSPECT_URL").unwrap_or(defaults.delegation.base_url),
            admin_user: get("WEBPROFILE_ADMIN_USER"),
            admin_pass: get("WEBPROFILE_ADMIN_PASS"),
            timeout_ms: parse_or(
                &get,
                "WEBPROFILE_FETCH_TIMEOUT_MS",
                defaults.delegation.timeout_ms,
            )?,
        },
    })
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigurationError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .parse()
            .map_err(|e: T::Err| ConfigurationError::invalid(key, format!("'{raw}': {e}"))),
        None => Ok(default),
    }
}

fn flag_or<G>(get: &G, key: &'static str, default: bool) -> Result<bool, ConfigurationError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key).map(|v| v.to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigurationError::invalid(key, format!("'{v}' is not a boolean"))),
        },
    }
}
