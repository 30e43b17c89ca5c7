//! Two-tier lookup cache for catalog reads.
//!
//! The first tier is an in-process map with short expiry; the second lives
//! in the document store so separate invocations can share results for
//! longer. Only read paths go through it; the write path always asks the
//! catalog directly.

use crate::catalog::{normalize_key, AttributionProvider, ExerciseProfile};
use crate::config::CacheConfig;
use crate::store::{DocRef, DocumentStore, WriteOp};
use crate::Result;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use lru::LruCache;
use serde_json::{json, Value};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub const CACHE_COLLECTION: &str = "lookup_cache";

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// In-process TTL map; least recently used entries go first when full
#[derive(Debug)]
pub struct LocalCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
}

impl LocalCache {
    pub fn new(max_entries: usize) -> Self {
        let capacity = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let mut entries = self.entries.lock().ok()?;
        // get() also marks the entry as recently used
        match entries.get(key) {
            Some(entry) if !entry.is_expired() => return Some(entry.value.clone()),
            Some(_) => {}
            None => return None,
        }
        entries.pop(key);
        None
    }

    pub fn set(&self, key: &str, value: Value, ttl: Duration) {
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };
        entries.put(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map_or(0, |e| e.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Local tier in front of a store-backed shared tier
pub struct TwoTierCache {
    local: LocalCache,
    shared: Arc<dyn DocumentStore>,
    local_ttl: Duration,
}

impl TwoTierCache {
    pub fn new(shared: Arc<dyn DocumentStore>, config: &CacheConfig) -> Self {
        Self {
            local: LocalCache::new(config.local_max_entries),
            shared,
            local_ttl: Duration::from_secs(config.local_ttl_secs),
        }
    }

    fn doc(key: &str) -> DocRef {
        DocRef::new(CACHE_COLLECTION, key)
    }

    /// Look a key up in the local tier, then the shared one
    ///
    /// Shared-tier failures are logged and treated as a miss.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        if let Some(value) = self.local.get(key) {
            return serde_json::from_value(value).ok();
        }

        let stored = match self.shared.get(&Self::doc(key)) {
            Ok(stored) => stored?,
            Err(e) => {
                tracing::warn!("Shared cache read for '{}' failed: {}", key, e);
                return None;
            }
        };
        let expires_at_ms = stored.get("expires_at_ms").and_then(Value::as_i64)?;
        if expires_at_ms <= Utc::now().timestamp_millis() {
            return None;
        }
        let value = stored.get("value")?.clone();
        self.local.set(key, value.clone(), self.local_ttl);
        serde_json::from_value(value).ok()
    }

    /// Store in both tiers; the local tier never outlives `ttl`
    pub fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.local.set(key, value.clone(), self.local_ttl.min(ttl));

        let expires_at_ms =
            Utc::now().timestamp_millis() + i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX / 2);
        self.shared.commit(&[WriteOp::Put {
            doc: Self::doc(key),
            value: json!({ "value": value, "expires_at_ms": expires_at_ms }),
        }])?;
        Ok(())
    }
}

/// Attribution lookups memoized through a [`TwoTierCache`]
pub struct CachedCatalog {
    inner: Arc<dyn AttributionProvider>,
    cache: TwoTierCache,
    ttl: Duration,
}

impl CachedCatalog {
    pub fn new(
        inner: Arc<dyn AttributionProvider>,
        shared: Arc<dyn DocumentStore>,
        config: &CacheConfig,
    ) -> Self {
        Self {
            inner,
            cache: TwoTierCache::new(shared, config),
            ttl: Duration::from_secs(config.shared_ttl_secs),
        }
    }
}

impl AttributionProvider for CachedCatalog {
    fn lookup(&self, exercise: &str) -> Option<ExerciseProfile> {
        let key = format!("exercise__{}", normalize_key(exercise));
        if let Some(profile) = self.cache.get::<ExerciseProfile>(&key) {
            return Some(profile);
        }
        let profile = self.inner.lookup(exercise)?;
        if let Err(e) = self.cache.set(&key, &profile, self.ttl) {
            tracing::warn!("Failed to cache exercise '{}': {}", exercise, e);
        }
        Some(profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::build_default_catalog;
    use crate::store::MemoryStore;

    fn config() -> CacheConfig {
        CacheConfig {
            local_ttl_secs: 60,
            shared_ttl_secs: 3600,
            local_max_entries: 2,
        }
    }

    #[test]
    fn test_local_cache_expiry_and_bound() {
        let cache = LocalCache::new(2);
        cache.set("a", json!(1), Duration::from_secs(60));
        cache.set("b", json!(2), Duration::from_secs(120));
        cache.set("c", json!(3), Duration::from_secs(180));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("c"), Some(json!(3)));

        cache.set("gone", json!(0), Duration::ZERO);
        assert_eq!(cache.get("gone"), None);
    }

    #[test]
    fn test_local_cache_evicts_least_recently_used() {
        let cache = LocalCache::new(2);
        cache.set("a", json!(1), Duration::from_secs(60));
        cache.set("b", json!(2), Duration::from_secs(600));
        assert_eq!(cache.get("a"), Some(json!(1)));

        cache.set("c", json!(3), Duration::from_secs(600));
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("a"), Some(json!(1)));
        assert_eq!(cache.get("c"), Some(json!(3)));
    }

    #[test]
    fn test_local_cache_zero_capacity_holds_one() {
        let cache = LocalCache::new(0);
        cache.set("a", json!(1), Duration::from_secs(60));
        cache.set("b", json!(2), Duration::from_secs(60));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("b"), Some(json!(2)));
    }

    #[test]
    fn test_shared_tier_survives_new_process() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::default());
        let first = TwoTierCache::new(store.clone(), &config());
        first
            .set("k", &vec!["chest".to_string()], Duration::from_secs(600))
            .unwrap();

        let second = TwoTierCache::new(store.clone(), &config());
        let value: Option<Vec<String>> = second.get("k");
        assert_eq!(value, Some(vec!["chest".to_string()]));
    }

    #[test]
    fn test_expired_shared_entry_is_a_miss() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::default());
        store
            .commit(&[WriteOp::Put {
                doc: DocRef::new(CACHE_COLLECTION, "k"),
                value: json!({"value": 1, "expires_at_ms": 0}),
            }])
            .unwrap();
        let cache = TwoTierCache::new(store, &config());
        assert_eq!(cache.get::<i64>("k"), None);
    }

    #[test]
    fn test_cached_catalog_serves_lookups() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::default());
        let catalog = CachedCatalog::new(Arc::new(build_default_catalog()), store.clone(), &config());

        let profile = catalog.lookup("Bench Press").unwrap();
        assert_eq!(profile.exercise_id, "bench_press");
        assert!(store
            .get(&DocRef::new(CACHE_COLLECTION, "exercise__bench_press"))
            .unwrap()
            .is_some());
        assert_eq!(catalog.lookup("bench press").unwrap(), profile);
        assert!(catalog.lookup("underwater_basket").is_none());
    }
}
