//! Cache boundary for verified tokens, profiles and rate-limit counters.
//!
//! The auth subsystem only relies on atomic get/set/delete with a per-entry
//! TTL plus prefix eviction. Values are opaque JSON strings so any key-value
//! store can sit behind [`CacheBackend`]; [`MemoryCache`] is the in-process
//! implementation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::future::Cache;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::auth::{AuthError, AuthResult};

/// Default number of entries held by [`MemoryCache`].
pub const DEFAULT_MAX_CAPACITY: u64 = 100_000;

/// Contract of the shared cache.
///
/// Every operation may fail with [`AuthError::BackendUnavailable`]; callers
/// treat a failure as a miss and never as an authentication outcome.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> AuthResult<Option<String>>;

    /// Store `value` for `ttl`. A zero TTL stores nothing.
    async fn set(&self, key: &str, value: String, ttl: Duration) -> AuthResult<()>;

    async fn delete(&self, key: &str) -> AuthResult<()>;

    /// Evict every key starting with `prefix`.
    async fn delete_prefix(&self, prefix: &str) -> AuthResult<()>;
}

/// Read and deserialize a typed entry. Corrupt entries read as a miss.
pub async fn get_json<T: DeserializeOwned>(
    cache: &dyn CacheBackend,
    key: &str,
) -> AuthResult<Option<T>> {
    let Some(raw) = cache.get(key).await? else {
        return Ok(None);
    };
    match serde_json::from_str(&raw) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            warn!("Discarding unreadable cache entry {}: {}", key, e);
            Ok(None)
        }
    }
}

/// Serialize and store a typed entry.
pub async fn set_json<T: Serialize + Sync>(
    cache: &dyn CacheBackend,
    key: &str,
    value: &T,
    ttl: Duration,
) -> AuthResult<()> {
    let raw = serde_json::to_string(value)
        .map_err(|e| AuthError::BackendUnavailable(format!("cache encode failed: {}", e)))?;
    cache.set(key, raw, ttl).await
}

#[derive(Clone)]
struct Entry {
    value: Arc<str>,
    expires_at: Instant,
}

/// Per-entry expiry: every entry carries its own absolute deadline.
struct EntryExpiry;

impl moka::Expiry<String, Entry> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Entry,
        created_at: Instant,
    ) -> Option<Duration> {
        Some(value.expires_at.saturating_duration_since(created_at))
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Entry,
        updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.expires_at.saturating_duration_since(updated_at))
    }
}

/// In-process cache backed by [`moka::future::Cache`].
///
/// Safe to share across tasks; moka provides the atomicity of individual
/// operations and the subsystem adds no locking of its own.
#[derive(Clone)]
pub struct MemoryCache {
    entries: Cache<String, Entry>,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CAPACITY)
    }
}

impl MemoryCache {
    pub fn new(max_capacity: u64) -> Self {
        let entries = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(EntryExpiry)
            .support_invalidation_closures()
            .build();
        Self { entries }
    }

    /// Number of live entries after pending maintenance has run.
    pub async fn entry_count(&self) -> u64 {
        self.entries.run_pending_tasks().await;
        self.entries.entry_count()
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &str) -> AuthResult<Option<String>> {
        let now = Instant::now();
        Ok(self
            .entries
            .get(key)
            .await
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.value.to_string()))
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> AuthResult<()> {
        if ttl.is_zero() {
            self.entries.invalidate(key).await;
            return Ok(());
        }
        let expires_at = Instant::now()
            .checked_add(ttl)
            .ok_or_else(|| AuthError::BackendUnavailable(format!("TTL out of range: {:?}", ttl)))?;
        let entry = Entry {
            value: Arc::from(value),
            expires_at,
        };
        self.entries.insert(key.to_string(), entry).await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> AuthResult<()> {
        self.entries.invalidate(key).await;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> AuthResult<()> {
        let prefix = prefix.to_string();
        self.entries
            .invalidate_entries_if(move |key, _| key.starts_with(&prefix))
            .map(|_| ())
            .map_err(|e| AuthError::BackendUnavailable(e.to_string()))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde::Deserialize;

    /// Backend that fails every call, for degradation tests.
    pub(crate) struct UnreachableCache;

    #[async_trait]
    impl CacheBackend for UnreachableCache {
        async fn get(&self, _key: &str) -> AuthResult<Option<String>> {
            Err(AuthError::BackendUnavailable("connection refused".to_string()))
        }

        async fn set(&self, _key: &str, _value: String, _ttl: Duration) -> AuthResult<()> {
            Err(AuthError::BackendUnavailable("connection refused".to_string()))
        }

        async fn delete(&self, _key: &str) -> AuthResult<()> {
            Err(AuthError::BackendUnavailable("connection refused".to_string()))
        }

        async fn delete_prefix(&self, _prefix: &str) -> AuthResult<()> {
            Err(AuthError::BackendUnavailable("connection refused".to_string()))
        }
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        count: u32,
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let cache = MemoryCache::default();
        cache
            .set("k", "v".to_string(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some("v".to_string()));

        cache.delete("k").await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_entry_expires_after_ttl() {
        let cache = MemoryCache::default();
        cache
            .set("short", "v".to_string(), Duration::from_millis(50))
            .await
            .unwrap();
        assert!(cache.get("short").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cache.get("short").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_overwrite_takes_new_ttl() {
        let cache = MemoryCache::default();
        cache
            .set("k", "old".to_string(), Duration::from_secs(60))
            .await
            .unwrap();
        cache
            .set("k", "new".to_string(), Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some("new".to_string()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cache.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_zero_ttl_stores_nothing() {
        let cache = MemoryCache::default();
        cache.set("k", "v".to_string(), Duration::ZERO).await.unwrap();
        assert!(cache.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unrepresentable_ttl_is_an_error() {
        let cache = MemoryCache::default();
        let result = cache.set("k", "v".to_string(), Duration::MAX).await;
        assert!(matches!(result, Err(AuthError::BackendUnavailable(_))));
        assert!(cache.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_prefix() {
        let cache = MemoryCache::default();
        let ttl = Duration::from_secs(60);
        cache.set("auth:token:1:aaa", "a".into(), ttl).await.unwrap();
        cache.set("auth:token:1:bbb", "b".into(), ttl).await.unwrap();
        cache.set("auth:token:12:ccc", "c".into(), ttl).await.unwrap();

        cache.delete_prefix("auth:token:1:").await.unwrap();

        assert!(cache.get("auth:token:1:aaa").await.unwrap().is_none());
        assert!(cache.get("auth:token:1:bbb").await.unwrap().is_none());
        assert!(cache.get("auth:token:12:ccc").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_json_helpers() {
        let cache = MemoryCache::default();
        set_json(&cache, "s", &Sample { count: 3 }, Duration::from_secs(60))
            .await
            .unwrap();
        let read: Option<Sample> = get_json(&cache, "s").await.unwrap();
        assert_eq!(read, Some(Sample { count: 3 }));

        cache
            .set("bad", "not json".to_string(), Duration::from_secs(60))
            .await
            .unwrap();
        let corrupt: Option<Sample> = get_json(&cache, "bad").await.unwrap();
        assert!(corrupt.is_none());
    }

    #[tokio::test]
    async fn test_entry_count() {
        let cache = MemoryCache::new(10);
        cache.set("a", "1".into(), Duration::from_secs(60)).await.unwrap();
        cache.set("b", "2".into(), Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.entry_count().await, 2);
    }
}
