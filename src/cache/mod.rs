use chrono::{DateTime, Utc};
use moka::future::Cache;
use moka::policy::EvictionPolicy;
use moka::Expiry;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::classify::Category;
use crate::config::{CacheConfig, CacheTtls};

/// Cache key: BLAKE3 digest of a sanitized message and optional user id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(message: &str, user_id: Option<&str>) -> Self {
        let mut hasher = blake3::Hasher::new();
        match user_id {
            // Tagged so that "no user" never collides with an empty user id.
            Some(user) => {
                hasher.update(&[1]);
                hasher.update(&(user.len() as u64).to_le_bytes());
                hasher.update(user.as_bytes());
            }
            None => {
                hasher.update(&[0]);
            }
        }
        hasher.update(message.as_bytes());
        Self(hasher.finalize().to_hex().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub payload: String,
    pub model: String,
    pub category: Category,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    ttl: Duration,
}

impl CacheEntry {
    fn new(payload: String, model: String, category: Category, ttl: Duration) -> Self {
        let created_at = Utc::now();
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| created_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            payload,
            model,
            category,
            created_at,
            expires_at,
            ttl,
        }
    }
}

/// Lifetime is fixed when an entry is written; reads never extend it.
struct CategoryExpiry;

impl Expiry<Fingerprint, CacheEntry> for CategoryExpiry {
    fn expire_after_create(
        &self,
        _key: &Fingerprint,
        value: &CacheEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &Fingerprint,
        value: &CacheEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub total_hits: u64,
    pub total_misses: u64,
    pub hit_rate: String,
    pub cache_size: u64,
}

/// Result of [`ResponseCache::get_or_generate`].
#[derive(Debug, Clone)]
pub struct Lookup {
    pub entry: CacheEntry,
    /// True when this caller's own generation produced the entry.
    pub fresh: bool,
}

#[derive(Clone)]
pub struct ResponseCache {
    inner: Cache<Fingerprint, CacheEntry>,
    ttls: CacheTtls,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
}

impl ResponseCache {
    pub fn new(config: &CacheConfig) -> Self {
        let inner = Cache::builder()
            .max_capacity(config.max_capacity)
            // Writes are always admitted; the least recently used entry goes.
            .eviction_policy(EvictionPolicy::lru())
            .expire_after(CategoryExpiry)
            .build();
        Self {
            inner,
            ttls: config.ttl,
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn ttl(&self, category: Category) -> Duration {
        self.ttls.for_category(category)
    }

    pub async fn get(&self, message: &str, user_id: Option<&str>) -> Option<CacheEntry> {
        let key = Fingerprint::new(message, user_id);
        match self.inner.get(&key).await {
            Some(entry) => {
                let hits = self.hits.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(key = key.as_str(), hits, "cache hit");
                Some(entry)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub async fn put(
        &self,
        message: &str,
        user_id: Option<&str>,
        payload: String,
        model: String,
        category: Category,
    ) {
        let key = Fingerprint::new(message, user_id);
        let entry = CacheEntry::new(payload, model, category, self.ttl(category));
        self.inner.insert(key, entry).await;
        self.sweep().await;
    }

    /// Return the live entry, or run `generate` to fill it. Concurrent
    /// callers missing on the same fingerprint wait for a single generation.
    pub async fn get_or_generate<F, E>(
        &self,
        message: &str,
        user_id: Option<&str>,
        category: Category,
        generate: F,
    ) -> Result<Lookup, Arc<E>>
    where
        F: Future<Output = Result<(String, String), E>>,
        E: Send + Sync + 'static,
    {
        let key = Fingerprint::new(message, user_id);
        let ttl = self.ttl(category);
        let ran = AtomicBool::new(false);

        let entry = self
            .inner
            .try_get_with(key, async {
                ran.store(true, Ordering::Relaxed);
                let (payload, model) = generate.await?;
                Ok::<_, E>(CacheEntry::new(payload, model, category, ttl))
            })
            .await?;

        let fresh = ran.load(Ordering::Relaxed);
        if fresh {
            self.sweep().await;
        }
        Ok(Lookup { entry, fresh })
    }

    /// Evict everything already expired.
    pub async fn sweep(&self) {
        self.inner.run_pending_tasks().await;
    }

    pub fn stats(&self) -> CacheStats {
        let total_hits = self.hits.load(Ordering::Relaxed);
        let total_misses = self.misses.load(Ordering::Relaxed);
        let total = total_hits + total_misses;
        let rate = if total == 0 {
            0.0
        } else {
            total_hits as f64 / total as f64 * 100.0
        };
        CacheStats {
            total_hits,
            total_misses,
            hit_rate: format!("{rate:.2}%"),
            cache_size: self.inner.entry_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn short_lived(secs: u64) -> ResponseCache {
        ResponseCache::new(&CacheConfig {
            max_capacity: 100,
            ttl: CacheTtls {
                invoice_analysis: secs,
                margin_optimization: secs,
                excel_formulas: 3600,
                fifa_projections: secs,
                general_consultation: secs,
            },
        })
    }

    #[test]
    fn fingerprint_separates_users() {
        let anon = Fingerprint::new("hello", None);
        let empty = Fingerprint::new("hello", Some(""));
        let alice = Fingerprint::new("hello", Some("alice"));
        assert_eq!(anon, Fingerprint::new("hello", None));
        assert_ne!(anon, empty);
        assert_ne!(anon, alice);
        assert_ne!(alice, Fingerprint::new("hello!", Some("alice")));
        assert_eq!(anon.as_str().len(), 64);
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let cache = short_lived(60);
        cache
            .put(
                "hello",
                Some("u1"),
                "hi there".into(),
                "m1".into(),
                Category::GeneralConsultation,
            )
            .await;

        let entry = cache.get("hello", Some("u1")).await.unwrap();
        assert_eq!(entry.payload, "hi there");
        assert_eq!(entry.model, "m1");
        assert_eq!(entry.category, Category::GeneralConsultation);
        assert!(entry.expires_at > entry.created_at);

        assert!(cache.get("hello", None).await.is_none());
        assert!(cache.get("hello", Some("u2")).await.is_none());

        let stats = cache.stats();
        assert_eq!(stats.total_hits, 1);
        assert_eq!(stats.total_misses, 2);
        assert_eq!(stats.hit_rate, "33.33%");
    }

    #[tokio::test]
    async fn new_entry_is_admitted_at_capacity() {
        let cache = ResponseCache::new(&CacheConfig {
            max_capacity: 2,
            ttl: CacheTtls::default(),
        });
        for key in ["a", "b"] {
            cache
                .put(key, None, key.into(), "m".into(), Category::GeneralConsultation)
                .await;
        }
        for _ in 0..20 {
            assert!(cache.get("a", None).await.is_some());
            assert!(cache.get("b", None).await.is_some());
        }

        cache
            .put("c", None, "c".into(), "m".into(), Category::GeneralConsultation)
            .await;

        assert_eq!(cache.get("c", None).await.unwrap().payload, "c");
        assert!(cache.stats().cache_size <= 2);
    }

    #[tokio::test]
    async fn entries_expire_by_category() {
        let cache = short_lived(1);
        cache
            .put("q", None, "short".into(), "m".into(), Category::InvoiceAnalysis)
            .await;
        cache
            .put("f", None, "long".into(), "m".into(), Category::ExcelFormulas)
            .await;

        tokio::time::sleep(Duration::from_millis(1200)).await;

        assert!(cache.get("q", None).await.is_none());
        assert_eq!(cache.get("f", None).await.unwrap().payload, "long");
    }

    #[tokio::test]
    async fn overwrite_replaces_payload() {
        let cache = short_lived(60);
        cache
            .put("q", None, "first".into(), "m".into(), Category::GeneralConsultation)
            .await;
        cache
            .put("q", None, "second".into(), "m".into(), Category::GeneralConsultation)
            .await;
        assert_eq!(cache.get("q", None).await.unwrap().payload, "second");
    }

    #[tokio::test]
    async fn concurrent_misses_share_one_generation() {
        let cache = short_lived(60);
        let calls = Arc::new(AtomicUsize::new(0));

        let lookups = futures::future::join_all((0..8).map(|_| {
            let cache = cache.clone();
            let calls = calls.clone();
            async move {
                cache
                    .get_or_generate("same", None, Category::GeneralConsultation, async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok::<_, std::io::Error>(("answer".to_string(), "m".to_string()))
                    })
                    .await
                    .unwrap()
            }
        }))
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(lookups.iter().filter(|l| l.fresh).count(), 1);
        assert!(lookups.iter().all(|l| l.entry.payload == "answer"));
    }

    #[tokio::test]
    async fn failed_generation_is_not_cached() {
        let cache = short_lived(60);
        let result = cache
            .get_or_generate("q", None, Category::GeneralConsultation, async {
                Err::<(String, String), _>(std::io::Error::other("boom"))
            })
            .await;
        assert!(result.is_err());
        assert!(cache.get("q", None).await.is_none());
    }
}
