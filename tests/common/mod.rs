//! Shared fixtures: a manager over the in-memory store and in-process bus,
//! with hash costs turned down so tests stay fast.

#![allow(dead_code)]

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use gitauth::cache::LookupCache;
use gitauth::config::{Config, HashSettings};
use gitauth::hashing::HashAlgorithm;
use gitauth::manager::CredentialManager;
use gitauth::pubsub::LocalBus;
use gitauth::store::memory::MemoryStore;
use gitauth::AppState;

pub fn fast_config() -> Config {
    let mut cfg = Config::default();
    cfg.hash = HashSettings {
        algorithm: "argon2id".into(),
        allow_bcrypt_fallback: true,
        argon2_time: 1,
        argon2_memory_kb: 1024,
        argon2_parallelism: 1,
        bcrypt_cost: 4,
    };
    cfg
}

pub fn algorithm() -> HashAlgorithm {
    if HashAlgorithm::Bcrypt.is_available() {
        HashAlgorithm::Bcrypt
    } else {
        HashAlgorithm::Argon2id
    }
}

pub fn manager_with(cfg: &Config, store: Arc<MemoryStore>, bus: Arc<LocalBus>) -> CredentialManager {
    CredentialManager::new(cfg, algorithm(), store, bus, LookupCache::new()).unwrap()
}

pub fn manager(cfg: &Config) -> CredentialManager {
    manager_with(cfg, Arc::new(MemoryStore::new()), Arc::new(LocalBus::new()))
}

pub fn state(cfg: Config) -> Arc<AppState> {
    Arc::new(AppState {
        manager: Arc::new(manager(&cfg)),
        config: cfg,
    })
}

/// A structurally valid `ssh-ed25519` line whose key bytes are `seed`
/// repeated.
pub fn ed25519_line(seed: u8, comment: &str) -> String {
    let key_type = b"ssh-ed25519";
    let mut blob = Vec::new();
    blob.extend_from_slice(&(key_type.len() as u32).to_be_bytes());
    blob.extend_from_slice(key_type);
    blob.extend_from_slice(&32u32.to_be_bytes());
    blob.extend_from_slice(&[seed; 32]);
    format!("ssh-ed25519 {} {}", STANDARD.encode(blob), comment)
        .trim_end()
        .to_string()
}
