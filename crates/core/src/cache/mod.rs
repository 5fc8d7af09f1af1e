//! Namespaced in-memory cache with TTL expiry checked on read and a periodic sweep.

use log::{debug, info, warn};
use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use crate::config::CacheConfig;

pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(600);

static GLOBAL_CACHE: Lazy<Arc<CacheManager>> = Lazy::new(|| Arc::new(CacheManager::default()));

/// Process-wide cache instance.
pub fn global() -> Arc<CacheManager> {
    Arc::clone(&GLOBAL_CACHE)
}

#[derive(Clone, Debug)]
struct CacheEntry {
    value: Value,
    stored_at: Instant,
}

impl CacheEntry {
    fn is_fresh(&self, ttl: Duration, now: Instant) -> bool {
        now.duration_since(self.stored_at) < ttl
    }
}

type Namespace = Arc<Mutex<HashMap<String, CacheEntry>>>;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub namespaces: usize,
    pub total_items: usize,
    pub namespace_details: BTreeMap<String, usize>,
}

pub struct CacheManager {
    namespaces: RwLock<HashMap<String, Namespace>>,
    default_ttl: Duration,
    cleanup_interval: Duration,
    last_cleanup: Mutex<Instant>,
}

impl Default for CacheManager {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_CLEANUP_INTERVAL)
    }
}

impl CacheManager {
    pub fn new(default_ttl: Duration, cleanup_interval: Duration) -> Self {
        Self {
            namespaces: RwLock::new(HashMap::new()),
            default_ttl,
            cleanup_interval,
            last_cleanup: Mutex::new(Instant::now()),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(
            Duration::from_secs(config.default_ttl_secs),
            Duration::from_secs(config.cleanup_interval_secs),
        )
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn cleanup_interval(&self) -> Duration {
        self.cleanup_interval
    }

    /// MD5 hex digest of the value's JSON form. `serde_json` keeps object keys
    /// sorted, so equal maps always produce the same key.
    pub fn generate_key<T>(parts: &T) -> String
    where
        T: Serialize + ?Sized,
    {
        let canonical = serde_json::to_string(parts).unwrap_or_default();
        format!("{:x}", md5::compute(canonical.as_bytes()))
    }

    /// Returns a live entry. An entry older than `ttl` (default TTL when `None`)
    /// is removed and reported as a miss.
    pub fn get(&self, namespace: &str, key: &str, ttl: Option<Duration>) -> Option<Value> {
        let ns = self.existing(namespace)?;
        let ttl = ttl.unwrap_or(self.default_ttl);
        let mut entries = lock(&ns);
        let entry = entries.get(key)?;
        if entry.is_fresh(ttl, Instant::now()) {
            Some(entry.value.clone())
        } else {
            entries.remove(key);
            debug!("缓存过期已删除: {namespace}/{key}");
            None
        }
    }

    pub fn get_as<T>(&self, namespace: &str, key: &str, ttl: Option<Duration>) -> Option<T>
    where
        T: DeserializeOwned,
    {
        let value = self.get(namespace, key, ttl)?;
        match serde_json::from_value(value) {
            Ok(typed) => Some(typed),
            Err(err) => {
                warn!("缓存值反序列化失败 {namespace}/{key}: {err}");
                None
            }
        }
    }

    pub fn set(&self, namespace: &str, key: &str, value: Value) {
        let ns = self.namespace(namespace);
        lock(&ns).insert(
            key.to_string(),
            CacheEntry {
                value,
                stored_at: Instant::now(),
            },
        );
    }

    pub fn set_as<T>(&self, namespace: &str, key: &str, value: &T) -> Result<(), serde_json::Error>
    where
        T: Serialize + ?Sized,
    {
        self.set(namespace, key, serde_json::to_value(value)?);
        Ok(())
    }

    pub fn remove(&self, namespace: &str, key: &str) -> bool {
        let Some(ns) = self.existing(namespace) else {
            return false;
        };
        let removed = lock(&ns).remove(key).is_some();
        removed
    }

    /// Drops a whole namespace and returns the number of entries it held.
    pub fn clear_namespace(&self, namespace: &str) -> usize {
        let removed = self
            .namespaces
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(namespace);
        let count = match removed {
            Some(ns) => {
                let len = lock(&ns).len();
                len
            }
            None => 0,
        };
        if count > 0 {
            info!("已清空缓存命名空间 {namespace} ({count} 项)");
        }
        count
    }

    pub fn clear_all(&self) {
        self.namespaces
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        info!("已清空全部缓存");
    }

    /// Removes entries older than `ttl` from one namespace, or from all of them.
    pub fn clear_expired(&self, namespace: Option<&str>, ttl: Option<Duration>) -> usize {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let targets: Vec<(String, Namespace)> = {
            let map = self
                .namespaces
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            match namespace {
                Some(name) => map
                    .get(name)
                    .map(|ns| vec![(name.to_string(), Arc::clone(ns))])
                    .unwrap_or_default(),
                None => map
                    .iter()
                    .map(|(name, ns)| (name.clone(), Arc::clone(ns)))
                    .collect(),
            }
        };

        let now = Instant::now();
        let mut removed = 0;
        for (name, ns) in targets {
            let mut entries = lock(&ns);
            let before = entries.len();
            entries.retain(|_, entry| entry.is_fresh(ttl, now));
            let dropped = before - entries.len();
            if dropped > 0 {
                debug!("命名空间 {name} 清理过期缓存 {dropped} 项");
            }
            removed += dropped;
        }
        removed
    }

    /// Sweeps expired entries when the cleanup interval has elapsed since the
    /// last sweep. Returns the number removed, or `None` when it was not due.
    /// Only this full sweep moves the cleanup timer; namespace-scoped
    /// `clear_expired` calls leave it alone.
    pub fn auto_cleanup(&self) -> Option<usize> {
        {
            let mut last = self
                .last_cleanup
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if last.elapsed() < self.cleanup_interval {
                return None;
            }
            *last = Instant::now();
        }
        Some(self.clear_expired(None, None))
    }

    /// Starts a background task that sweeps expired entries every `interval`.
    /// Must be called inside a tokio runtime.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        let period = interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = cache.clear_expired(None, None);
                if removed > 0 {
                    info!("定时清理过期缓存 {removed} 项");
                }
            }
        })
    }

    /// Returns the cached value or computes, stores and returns a fresh one.
    /// Errors from `compute` are passed through and nothing is stored.
    pub async fn get_or_try_insert_with<F, Fut, E>(
        &self,
        namespace: &str,
        key: &str,
        ttl: Option<Duration>,
        compute: F,
    ) -> Result<Value, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, E>>,
    {
        if let Some(hit) = self.get(namespace, key, ttl) {
            debug!("缓存命中: {namespace} / {key}");
            return Ok(hit);
        }
        let value = compute().await?;
        self.set(namespace, key, value.clone());
        Ok(value)
    }

    pub fn stats(&self) -> CacheStats {
        let map = self
            .namespaces
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let namespace_details: BTreeMap<String, usize> = map
            .iter()
            .map(|(name, ns)| (name.clone(), lock(ns).len()))
            .collect();
        CacheStats {
            namespaces: namespace_details.len(),
            total_items: namespace_details.values().sum(),
            namespace_details,
        }
    }

    fn existing(&self, namespace: &str) -> Option<Namespace> {
        self.namespaces
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(namespace)
            .cloned()
    }

    fn namespace(&self, namespace: &str) -> Namespace {
        if let Some(ns) = self.existing(namespace) {
            return ns;
        }
        let mut map = self
            .namespaces
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(map.entry(namespace.to_string()).or_default())
    }
}

fn lock(ns: &Namespace) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
    ns.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_are_stable_across_field_order() {
        let a = CacheManager::generate_key(&json!({"genre": "玄幻", "count": 3}));
        let b = CacheManager::generate_key(&json!({"count": 3, "genre": "玄幻"}));
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert_ne!(a, CacheManager::generate_key(&json!({"count": 4, "genre": "玄幻"})));
    }

    #[test]
    fn expired_entries_are_removed_on_read() {
        let cache = CacheManager::default();
        cache.set("world", "k", json!("v"));
        assert_eq!(cache.get("world", "k", None), Some(json!("v")));
        assert_eq!(cache.get("world", "k", Some(Duration::ZERO)), None);
        assert_eq!(cache.stats().total_items, 0);
    }

    #[test]
    fn namespaces_are_cleared_independently() {
        let cache = CacheManager::default();
        cache.set("a", "1", json!(1));
        cache.set("a", "2", json!(2));
        cache.set("b", "1", json!(3));

        assert_eq!(cache.clear_namespace("a"), 2);
        assert_eq!(cache.get("a", "1", None), None);
        assert_eq!(cache.get("b", "1", None), Some(json!(3)));

        let stats = cache.stats();
        assert_eq!(stats.namespaces, 1);
        assert_eq!(stats.namespace_details.get("b"), Some(&1));
        assert!(cache.remove("b", "1"));
        assert!(!cache.remove("b", "1"));
    }

    #[test]
    fn clear_expired_respects_namespace_filter() {
        let cache = CacheManager::default();
        cache.set("a", "1", json!(1));
        cache.set("b", "1", json!(1));
        assert_eq!(cache.clear_expired(Some("a"), Some(Duration::ZERO)), 1);
        assert_eq!(cache.stats().total_items, 1);
        assert_eq!(cache.clear_expired(None, Some(Duration::ZERO)), 1);
        assert_eq!(cache.clear_expired(None, None), 0);
    }

    #[test]
    fn auto_cleanup_runs_only_when_due() {
        let idle = CacheManager::new(Duration::ZERO, Duration::from_secs(3600));
        idle.set("a", "1", json!(1));
        assert_eq!(idle.auto_cleanup(), None);

        let eager = CacheManager::new(Duration::ZERO, Duration::ZERO);
        eager.set("a", "1", json!(1));
        assert_eq!(eager.auto_cleanup(), Some(1));
    }

    #[test]
    fn scoped_sweep_does_not_postpone_auto_cleanup() {
        let cache = CacheManager::new(Duration::ZERO, Duration::from_millis(30));
        cache.set("a", "1", json!(1));
        std::thread::sleep(Duration::from_millis(40));

        assert_eq!(cache.clear_expired(Some("b"), None), 0);
        assert_eq!(cache.auto_cleanup(), Some(1));
        assert_eq!(cache.stats().total_items, 0);
        assert_eq!(cache.auto_cleanup(), None, "timer restarts after a full sweep");
    }

    #[test]
    fn typed_round_trip() {
        let cache = CacheManager::default();
        cache.set_as("names", "k", &vec!["林枫", "苏雪"]).unwrap();
        let names: Vec<String> = cache.get_as("names", "k", None).unwrap();
        assert_eq!(names, vec!["林枫", "苏雪"]);
        assert_eq!(cache.get_as::<u32>("names", "k", None), None);
    }

    #[tokio::test]
    async fn get_or_try_insert_with_computes_once() {
        let cache = CacheManager::default();
        let first: Result<Value, String> = cache
            .get_or_try_insert_with("calc", "k", None, || async { Ok(json!(42)) })
            .await;
        assert_eq!(first.unwrap(), json!(42));

        let second: Result<Value, String> = cache
            .get_or_try_insert_with("calc", "k", None, || async { Err("not called".to_string()) })
            .await;
        assert_eq!(second.unwrap(), json!(42));

        let failed: Result<Value, String> = cache
            .get_or_try_insert_with("calc", "other", None, || async { Err("boom".to_string()) })
            .await;
        assert!(failed.is_err());
        assert_eq!(cache.get("calc", "other", None), None);
    }

    #[tokio::test]
    async fn sweeper_evicts_in_background() {
        let cache = Arc::new(CacheManager::new(Duration::from_millis(5), DEFAULT_CLEANUP_INTERVAL));
        cache.set("a", "1", json!(1));
        let handle = cache.spawn_sweeper(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(60)).await;
        handle.abort();
        assert_eq!(cache.stats().total_items, 0);
    }
}
