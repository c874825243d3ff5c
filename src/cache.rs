use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::StreamExt;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::metrics;
use crate::pubsub::InvalidationBus;

const PUBLISH_TIMEOUT: Duration = Duration::from_secs(2);
const RESUBSCRIBE_MIN_BACKOFF: Duration = Duration::from_millis(500);
const RESUBSCRIBE_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Cache key for a token introspection result.
pub fn introspect_key(hash_prefix: &str) -> String {
    format!("introspect:{hash_prefix}")
}

/// Cache key for an SSH fingerprint lookup.
pub fn ssh_key(fingerprint: &str) -> String {
    format!("ssh:{fingerprint}")
}

/// Entry stored in the DashMap. `None` expiry lives until invalidated.
#[derive(Clone)]
struct CacheEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn new<T: Serialize>(value: &T, ttl_secs: u64) -> anyhow::Result<Self> {
        Ok(Self {
            value: serde_json::to_string(value)?,
            expires_at: (ttl_secs > 0).then(|| Instant::now() + Duration::from_secs(ttl_secs)),
        })
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Process-local lookup cache.
///
/// Advisory only: the store is the source of truth and the whole cache may
/// be cleared at any time without affecting correctness. Entries are
/// checked on read and evicted lazily; `evict_expired()` sweeps the rest.
///
/// Every `invalidate` bumps a per-key generation. A reader that snapshots
/// `generation(key)` before going to the store and writes back through
/// `set_if_unchanged` can never re-insert a value that an invalidation
/// already superseded.
#[derive(Clone, Default)]
pub struct LookupCache {
    local: Arc<DashMap<String, CacheEntry>>,
    // Only keys that were ever invalidated; never pruned, since a reset
    // would let a stale snapshot match again.
    generations: Arc<DashMap<String, u64>>,
}

impl LookupCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get_raw(key);
        metrics::record_cache_lookup(key_kind(key), value.is_some());
        value.and_then(|v| serde_json::from_str(&v).ok())
    }

    fn get_raw(&self, key: &str) -> Option<String> {
        let entry = self.local.get(key)?;
        if !entry.is_expired(Instant::now()) {
            return Some(entry.value.clone());
        }
        // expired, drop the ref before removing
        drop(entry);
        self.local
            .remove_if(key, |_, e| e.is_expired(Instant::now()));
        None
    }

    /// Overwrites unconditionally. `ttl_secs == 0` never expires.
    pub fn set<T: Serialize>(&self, key: &str, value: &T, ttl_secs: u64) -> anyhow::Result<()> {
        let entry = CacheEntry::new(value, ttl_secs)?;
        self.local.insert(key.to_string(), entry);
        Ok(())
    }

    /// Current invalidation generation of `key`.
    pub fn generation(&self, key: &str) -> u64 {
        self.generations.get(key).map(|g| *g).unwrap_or(0)
    }

    /// Like `set`, but a no-op returning `false` when `key` was invalidated
    /// since `seen` was read.
    pub fn set_if_unchanged<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl_secs: u64,
        seen: u64,
    ) -> anyhow::Result<bool> {
        let entry = CacheEntry::new(value, ttl_secs)?;
        // Holding the generation shard lock across the insert orders this
        // write against a concurrent `invalidate`.
        let guard = self.generations.entry(key.to_string());
        let current = match &guard {
            Entry::Occupied(g) => *g.get(),
            Entry::Vacant(_) => 0,
        };
        if current != seen {
            return Ok(false);
        }
        self.local.insert(key.to_string(), entry);
        drop(guard);
        Ok(true)
    }

    pub fn invalidate(&self, key: &str) {
        *self.generations.entry(key.to_string()).or_insert(0) += 1;
        self.local.remove(key);
    }

    /// Remove all expired entries. Run periodically to bound memory.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.local.len();
        self.local.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.local.len())
    }

    pub fn len(&self) -> usize {
        self.local.len()
    }

    pub fn is_empty(&self) -> bool {
        self.local.is_empty()
    }

    pub fn clear(&self) {
        self.local.clear();
    }
}

fn key_kind(key: &str) -> &'static str {
    match key.split_once(':').map(|(kind, _)| kind) {
        Some("introspect") => "introspect",
        Some("ssh") => "ssh",
        _ => "other",
    }
}

/// Message broadcast on the invalidation channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

impl InvalidationMessage {
    pub fn for_key(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..Default::default()
        }
    }

    pub fn token_revoked(user_id: &str, token_id: &str, hash_prefix: &str) -> Self {
        Self {
            key: Some(introspect_key(hash_prefix)),
            kind: Some("token".into()),
            user_id: Some(user_id.into()),
            token_id: Some(token_id.into()),
            hash_prefix: Some(hash_prefix.into()),
            fingerprint: None,
        }
    }

    pub fn ssh_key_changed(user_id: &str, fingerprint: &str) -> Self {
        Self {
            key: Some(ssh_key(fingerprint)),
            kind: Some("ssh".into()),
            user_id: Some(user_id.into()),
            fingerprint: Some(fingerprint.into()),
            ..Default::default()
        }
    }

    /// The local cache key this message targets: `key`, else the prefix,
    /// else the fingerprint, else the token id.
    pub fn cache_key(&self) -> Option<String> {
        if let Some(key) = self.key.as_deref().filter(|k| !k.is_empty()) {
            return Some(key.to_string());
        }
        if let Some(prefix) = self.hash_prefix.as_deref().filter(|p| !p.is_empty()) {
            return Some(introspect_key(prefix));
        }
        if let Some(fp) = self.fingerprint.as_deref().filter(|f| !f.is_empty()) {
            return Some(ssh_key(fp));
        }
        self.token_id.clone().filter(|t| !t.is_empty())
    }
}

/// Drops entries locally and tells every other instance to do the same.
#[derive(Clone)]
pub struct CacheInvalidator {
    cache: LookupCache,
    bus: Arc<dyn InvalidationBus>,
    channel: String,
}

impl CacheInvalidator {
    pub fn new(cache: LookupCache, bus: Arc<dyn InvalidationBus>, channel: impl Into<String>) -> Self {
        Self {
            cache,
            bus,
            channel: channel.into(),
        }
    }

    pub fn cache(&self) -> &LookupCache {
        &self.cache
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Synchronous local drop, then a best-effort publish. Publish failures
    /// are logged and swallowed; TTLs bound staleness on other instances.
    pub async fn invalidate(&self, msg: InvalidationMessage) {
        if let Some(key) = msg.cache_key() {
            self.cache.invalidate(&key);
        }
        if let Err(e) = self.publish(&self.channel, &msg).await {
            tracing::warn!(error = %e, channel = %self.channel, "cache invalidation publish failed");
        }
    }

    /// Publishes without touching the local cache. Errors are returned.
    pub async fn publish(&self, channel: &str, msg: &InvalidationMessage) -> anyhow::Result<()> {
        let payload = serde_json::to_string(msg)?;
        tokio::time::timeout(PUBLISH_TIMEOUT, self.bus.publish(channel, &payload))
            .await
            .map_err(|_| anyhow::anyhow!("publish timed out after {:?}", PUBLISH_TIMEOUT))??;
        Ok(())
    }
}

/// Subscribes to `channel` and drops every referenced key from `cache`.
/// Resubscribes with capped exponential backoff when the subscription
/// fails or ends.
pub fn spawn_invalidation_listener(
    cache: LookupCache,
    bus: Arc<dyn InvalidationBus>,
    channel: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut backoff = RESUBSCRIBE_MIN_BACKOFF;
        loop {
            match bus.subscribe(&channel).await {
                Ok(mut stream) => {
                    tracing::info!(channel = %channel, "subscribed to cache invalidation channel");
                    backoff = RESUBSCRIBE_MIN_BACKOFF;
                    while let Some(payload) = stream.next().await {
                        apply_invalidation(&cache, &payload);
                    }
                    tracing::warn!(channel = %channel, "cache invalidation subscription ended");
                }
                Err(e) => {
                    tracing::warn!(error = %e, channel = %channel, "cache invalidation subscribe failed");
                }
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(RESUBSCRIBE_MAX_BACKOFF);
        }
    })
}

/// Applies one raw channel payload. A payload that is not a JSON message is
/// treated as a bare cache key.
pub fn apply_invalidation(cache: &LookupCache, payload: &str) {
    let key = match serde_json::from_str::<InvalidationMessage>(payload) {
        Ok(msg) => msg.cache_key(),
        Err(_) => Some(payload.trim().to_string()).filter(|k| !k.is_empty()),
    };
    match key {
        Some(key) => {
            tracing::debug!(key = %key, "cache invalidation received");
            cache.invalidate(&key);
        }
        None => tracing::debug!("cache invalidation without a resolvable key ignored"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::LocalBus;

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_lazily() {
        let cache = LookupCache::new();
        cache.set("ssh:a", &"owner-1", 5).unwrap();
        assert_eq!(cache.get::<String>("ssh:a").as_deref(), Some("owner-1"));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(cache.get::<String>("ssh:a").is_none());
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_ttl_never_expires() {
        let cache = LookupCache::new();
        cache.set("k", &1u32, 0).unwrap();
        tokio::time::advance(Duration::from_secs(86_400)).await;
        assert_eq!(cache.get::<u32>("k"), Some(1));
        cache.invalidate("k");
        assert!(cache.get::<u32>("k").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_expired_sweeps() {
        let cache = LookupCache::new();
        cache.set("a", &1, 1).unwrap();
        cache.set("b", &2, 10).unwrap();
        cache.set("c", &3, 0).unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.evict_expired(), 1);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_set_overwrites() {
        let cache = LookupCache::new();
        cache.set("k", &"first", 60).unwrap();
        cache.set("k", &"second", 60).unwrap();
        assert_eq!(cache.get::<String>("k").as_deref(), Some("second"));
    }

    #[test]
    fn test_write_after_invalidation_is_dropped() {
        let cache = LookupCache::new();
        let seen = cache.generation("introspect:abcd0123");
        assert_eq!(seen, 0);

        // An invalidation lands between the store read and the write-back.
        cache.invalidate("introspect:abcd0123");
        assert!(!cache
            .set_if_unchanged("introspect:abcd0123", &"stale", 60, seen)
            .unwrap());
        assert!(cache.is_empty());

        let seen = cache.generation("introspect:abcd0123");
        assert!(cache
            .set_if_unchanged("introspect:abcd0123", &"fresh", 60, seen)
            .unwrap());
        assert_eq!(
            cache.get::<String>("introspect:abcd0123").as_deref(),
            Some("fresh")
        );
    }

    #[test]
    fn test_message_key_resolution_order() {
        let msg = InvalidationMessage {
            hash_prefix: Some("9f3a2c11".into()),
            fingerprint: Some("SHA256:abc".into()),
            token_id: Some("t1".into()),
            ..Default::default()
        };
        assert_eq!(msg.cache_key().as_deref(), Some("introspect:9f3a2c11"));

        let msg = InvalidationMessage {
            fingerprint: Some("SHA256:abc".into()),
            token_id: Some("t1".into()),
            ..Default::default()
        };
        assert_eq!(msg.cache_key().as_deref(), Some("ssh:SHA256:abc"));

        let msg = InvalidationMessage {
            token_id: Some("t1".into()),
            ..Default::default()
        };
        assert_eq!(msg.cache_key().as_deref(), Some("t1"));
        assert!(InvalidationMessage::default().cache_key().is_none());
    }

    #[test]
    fn test_message_wire_format() {
        let msg = InvalidationMessage::token_revoked("u1", "t1", "deadbeef");
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["key"], "introspect:deadbeef");
        assert_eq!(json["type"], "token");
        assert_eq!(json["userId"], "u1");
        assert_eq!(json["hashPrefix"], "deadbeef");
        assert!(json.get("fingerprint").is_none());
    }

    #[test]
    fn test_bare_key_payload() {
        let cache = LookupCache::new();
        cache.set("ssh:x", &"u", 60).unwrap();
        apply_invalidation(&cache, "ssh:x");
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_listener_drops_keys_published_elsewhere() {
        let bus: Arc<dyn InvalidationBus> = Arc::new(LocalBus::new());
        let remote_cache = LookupCache::new();
        remote_cache.set("ssh:SHA256:abc", &"u1", 60).unwrap();
        let handle = spawn_invalidation_listener(remote_cache.clone(), bus.clone(), "chan".into());

        // Give the listener a chance to subscribe.
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }

        let local = CacheInvalidator::new(LookupCache::new(), bus, "chan");
        local
            .invalidate(InvalidationMessage::ssh_key_changed("u1", "SHA256:abc"))
            .await;

        for _ in 0..50 {
            if remote_cache.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(remote_cache.is_empty());
        handle.abort();
    }
}
