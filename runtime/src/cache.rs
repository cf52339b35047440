//! Render cache: conditional, single-flight cache in front of a slow hall
//! renderer.
//!
//! Lookups resolve in three tiers, cheapest first:
//!
//! 1. the conditional tag — the ETag is derived from the key alone, so a
//!    matching `If-None-Match` candidate answers `NotModified` without
//!    touching the store or the renderer;
//! 2. the LRU store — an unexpired entry answers `Fresh` and refreshes its
//!    recency;
//! 3. the renderer — concurrent misses for one key coalesce onto a single
//!    in-flight render; everyone shares the one payload (or the one error).
//!
//! The store mutex is held only for map operations, never across an await;
//! renders run on a spawned task so a caller that stops waiting does not
//! abort the render for the others.

use chrono::{DateTime, TimeDelta, Utc};
use lru::LruCache;
use metrics::{counter, histogram};
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, watch};
use velvet_core::clock::{Clock, SystemClock};
use velvet_core::error::CoreError;
use velvet_core::render::{HallRenderer, RenderKey, etag_matches};

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct RenderCacheConfig {
    /// How long a rendered payload stays servable.
    pub ttl: Duration,
    /// LRU capacity; least-recently-used entries are evicted beyond it.
    pub max_entries: usize,
    /// Shards for the in-flight render map.
    pub inflight_shards: usize,
}

impl Default for RenderCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            max_entries: 256,
            inflight_shards: 16,
        }
    }
}

impl RenderCacheConfig {
    /// Create a new configuration builder.
    #[must_use]
    pub const fn builder() -> RenderCacheConfigBuilder {
        RenderCacheConfigBuilder {
            ttl: None,
            max_entries: None,
            inflight_shards: None,
        }
    }
}

/// Builder for [`RenderCacheConfig`].
#[derive(Debug, Clone)]
pub struct RenderCacheConfigBuilder {
    ttl: Option<Duration>,
    max_entries: Option<usize>,
    inflight_shards: Option<usize>,
}

impl RenderCacheConfigBuilder {
    /// Set the payload time-to-live.
    #[must_use]
    pub const fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Set the LRU capacity. Clamped to at least one entry.
    #[must_use]
    pub const fn max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = Some(max_entries);
        self
    }

    /// Set the in-flight shard count. Clamped to at least one.
    #[must_use]
    pub const fn inflight_shards(mut self, shards: usize) -> Self {
        self.inflight_shards = Some(shards);
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> RenderCacheConfig {
        let defaults = RenderCacheConfig::default();
        RenderCacheConfig {
            ttl: self.ttl.unwrap_or(defaults.ttl),
            max_entries: self.max_entries.unwrap_or(defaults.max_entries).max(1),
            inflight_shards: self
                .inflight_shards
                .unwrap_or(defaults.inflight_shards)
                .max(1),
        }
    }
}

/// What a lookup produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderOutcome {
    /// The caller's conditional tag matched; no payload is shipped.
    NotModified {
        /// ETag the client should keep.
        etag: String,
    },
    /// A payload, freshly rendered or served from the store.
    Fresh {
        /// Rendered bytes, shared between all callers of this key.
        payload: Arc<[u8]>,
        /// Strong ETag derived from the key.
        etag: String,
    },
}

struct CachedRender {
    payload: Arc<[u8]>,
    rendered_at: DateTime<Utc>,
}

type RenderResult = Result<Arc<[u8]>, CoreError>;

struct Inner {
    store: Mutex<LruCache<String, CachedRender>>,
    inflight: Vec<Mutex<HashMap<String, watch::Receiver<Option<RenderResult>>>>>,
    renderer: Arc<dyn HallRenderer>,
    config: RenderCacheConfig,
    clock: Arc<dyn Clock>,
}

impl Inner {
    fn shard_index(&self, canonical: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        canonical.hash(&mut hasher);
        (hasher.finish() as usize) % self.inflight.len()
    }

    fn ttl_delta(&self) -> TimeDelta {
        TimeDelta::from_std(self.config.ttl).unwrap_or(TimeDelta::MAX)
    }
}

/// Single-flight render cache. Cloning shares the underlying state.
pub struct RenderCache {
    inner: Arc<Inner>,
}

impl Clone for RenderCache {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl RenderCache {
    /// Create a cache over `renderer` with the system clock.
    #[must_use]
    pub fn new(config: RenderCacheConfig, renderer: Arc<dyn HallRenderer>) -> Self {
        Self::with_clock(config, renderer, Arc::new(SystemClock))
    }

    /// Create a cache with an injected clock (tests).
    #[must_use]
    pub fn with_clock(
        config: RenderCacheConfig,
        renderer: Arc<dyn HallRenderer>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let capacity = NonZeroUsize::new(config.max_entries.max(1)).unwrap_or(NonZeroUsize::MIN);
        let shard_count = config.inflight_shards.max(1);
        let inflight = (0..shard_count).map(|_| Mutex::new(HashMap::new())).collect();
        Self {
            inner: Arc::new(Inner {
                store: Mutex::new(LruCache::new(capacity)),
                inflight,
                renderer,
                config,
                clock,
            }),
        }
    }

    /// Resolve `key`, honoring the caller's conditional tag.
    ///
    /// Returns [`RenderOutcome::NotModified`] when `client_tag` matches the
    /// key's ETag, otherwise a [`RenderOutcome::Fresh`] payload from the
    /// store or from a (possibly shared) renderer invocation.
    ///
    /// # Errors
    ///
    /// Renderer failures propagate as-is to every caller waiting on the
    /// same key; nothing is cached for a failed render.
    pub async fn get_or_render(
        &self,
        key: &RenderKey,
        client_tag: Option<&str>,
    ) -> Result<RenderOutcome, CoreError> {
        let etag = key.etag();
        if let Some(tag) = client_tag {
            if etag_matches(tag, &etag) {
                counter!("render_cache_hits_total").increment(1);
                tracing::debug!(etag = %etag, "conditional tag matched, skipping render");
                return Ok(RenderOutcome::NotModified { etag });
            }
        }

        let canonical = key.canonical();
        let now = self.inner.clock.now();
        let ttl = self.inner.ttl_delta();

        {
            let mut store = self.inner.store.lock().await;
            match store.get(&canonical) {
                Some(entry) if now - entry.rendered_at < ttl => {
                    counter!("render_cache_hits_total").increment(1);
                    return Ok(RenderOutcome::Fresh {
                        payload: Arc::clone(&entry.payload),
                        etag,
                    });
                }
                Some(_) => {
                    // Expired in place; reclaim before re-rendering.
                    store.pop(&canonical);
                }
                None => {}
            }
        }

        counter!("render_cache_misses_total").increment(1);
        let payload = self.render_single_flight(key, canonical).await?;
        Ok(RenderOutcome::Fresh { payload, etag })
    }

    /// Drop every cached payload. Defined teardown for tests and shutdown.
    pub async fn clear(&self) {
        self.inner.store.lock().await.clear();
    }

    /// Number of payloads currently cached (expired entries linger until
    /// their next touch).
    pub async fn len(&self) -> usize {
        self.inner.store.lock().await.len()
    }

    /// True when the store holds no payloads.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn render_single_flight(&self, key: &RenderKey, canonical: String) -> RenderResult {
        let idx = self.inner.shard_index(&canonical);
        let rx = {
            let mut shard = self.inner.inflight[idx].lock().await;
            if let Some(rx) = shard.get(&canonical) {
                counter!("render_cache_coalesced_waits_total").increment(1);
                tracing::debug!(key = %canonical, "coalescing onto in-flight render");
                rx.clone()
            } else {
                let (tx, rx) = watch::channel(None);
                shard.insert(canonical.clone(), rx.clone());
                self.spawn_render(key.clone(), canonical, idx, tx);
                rx
            }
        };
        await_render(rx).await
    }

    fn spawn_render(
        &self,
        key: RenderKey,
        canonical: String,
        idx: usize,
        tx: watch::Sender<Option<RenderResult>>,
    ) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let started = Instant::now();
            let rendered = inner.renderer.render(&key).await;
            histogram!("render_cache_render_duration_seconds")
                .record(started.elapsed().as_secs_f64());

            let outcome: RenderResult = match rendered {
                Ok(bytes) => {
                    let payload: Arc<[u8]> = Arc::from(bytes);
                    let entry = CachedRender {
                        payload: Arc::clone(&payload),
                        rendered_at: inner.clock.now(),
                    };
                    let mut store = inner.store.lock().await;
                    if let Some((evicted, _)) = store.push(canonical.clone(), entry) {
                        // push returns the displaced pair; same-key
                        // replacement is not an eviction.
                        if evicted != canonical {
                            counter!("render_cache_evictions_total").increment(1);
                            tracing::debug!(key = %evicted, "evicted least-recently-used payload");
                        }
                    }
                    Ok(payload)
                }
                Err(err) => {
                    counter!("render_cache_render_errors_total").increment(1);
                    tracing::warn!(key = %canonical, error = %err, "render failed");
                    Err(err)
                }
            };

            // Store first, then retire the in-flight slot: a caller arriving
            // in between sees either the watch channel or the fresh entry.
            inner.inflight[idx].lock().await.remove(&canonical);
            tx.send_replace(Some(outcome));
        });
    }
}

async fn await_render(mut rx: watch::Receiver<Option<RenderResult>>) -> RenderResult {
    loop {
        if let Some(outcome) = rx.borrow_and_update().clone() {
            return outcome;
        }
        if rx.changed().await.is_err() {
            return Err(CoreError::Internal("in-flight render abandoned".into()));
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use velvet_testing::{CountingRenderer, StepClock};

    fn key(club: i64) -> RenderKey {
        RenderKey {
            club_id: velvet_core::ClubId(club),
            night_start: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            scale: 1.5,
            base_version: "v3".into(),
            state_fingerprint: "abc123".into(),
        }
    }

    #[tokio::test]
    async fn second_lookup_serves_from_store() {
        let renderer = Arc::new(CountingRenderer::returning(b"png".to_vec()));
        let cache = RenderCache::new(RenderCacheConfig::default(), renderer.clone());

        let first = cache.get_or_render(&key(1), None).await.unwrap();
        let second = cache.get_or_render(&key(1), None).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(renderer.calls(), 1);
    }

    #[tokio::test]
    async fn matching_conditional_tag_skips_everything() {
        let renderer = Arc::new(CountingRenderer::returning(b"png".to_vec()));
        let cache = RenderCache::new(RenderCacheConfig::default(), renderer.clone());

        let etag = key(1).etag();
        let out = cache.get_or_render(&key(1), Some(&etag)).await.unwrap();
        assert_eq!(out, RenderOutcome::NotModified { etag });
        assert_eq!(renderer.calls(), 0);
    }

    #[tokio::test]
    async fn weak_and_listed_tags_match() {
        let renderer = Arc::new(CountingRenderer::returning(b"png".to_vec()));
        let cache = RenderCache::new(RenderCacheConfig::default(), renderer.clone());

        let etag = key(1).etag();
        let weak = format!("W/{etag}");
        assert!(matches!(
            cache.get_or_render(&key(1), Some(&weak)).await.unwrap(),
            RenderOutcome::NotModified { .. }
        ));
        let listed = format!("\"nope\", {etag}");
        assert!(matches!(
            cache.get_or_render(&key(1), Some(&listed)).await.unwrap(),
            RenderOutcome::NotModified { .. }
        ));
        assert_eq!(renderer.calls(), 0);
    }

    #[tokio::test]
    async fn expired_entry_is_rerendered() {
        let clock = Arc::new(StepClock::at_epoch(1_700_000_000));
        let renderer = Arc::new(CountingRenderer::returning(b"png".to_vec()));
        let config = RenderCacheConfig::builder()
            .ttl(Duration::from_secs(60))
            .build();
        let cache = RenderCache::with_clock(config, renderer.clone(), clock.clone());

        cache.get_or_render(&key(1), None).await.unwrap();
        clock.advance(Duration::from_secs(61));
        cache.get_or_render(&key(1), None).await.unwrap();
        assert_eq!(renderer.calls(), 2);
    }

    #[tokio::test]
    async fn failed_render_caches_nothing() {
        let renderer = Arc::new(CountingRenderer::returning(b"png".to_vec()));
        renderer.fail_next();
        let cache = RenderCache::new(RenderCacheConfig::default(), renderer.clone());

        let err = cache.get_or_render(&key(1), None).await.unwrap_err();
        assert_eq!(err.kind(), "internal");
        assert!(cache.is_empty().await);

        // Recovers on the next call.
        let out = cache.get_or_render(&key(1), None).await.unwrap();
        assert!(matches!(out, RenderOutcome::Fresh { .. }));
        assert_eq!(renderer.calls(), 2);
    }

    #[tokio::test]
    async fn capacity_evicts_least_recently_used() {
        let renderer = Arc::new(CountingRenderer::returning(b"png".to_vec()));
        let config = RenderCacheConfig::builder().max_entries(2).build();
        let cache = RenderCache::new(config, renderer.clone());

        cache.get_or_render(&key(1), None).await.unwrap();
        cache.get_or_render(&key(2), None).await.unwrap();
        // Touch key 1 so key 2 is the eviction candidate.
        cache.get_or_render(&key(1), None).await.unwrap();
        cache.get_or_render(&key(3), None).await.unwrap();

        assert_eq!(renderer.calls(), 3);
        cache.get_or_render(&key(1), None).await.unwrap();
        assert_eq!(renderer.calls(), 3, "recently-touched entry survived");
        cache.get_or_render(&key(2), None).await.unwrap();
        assert_eq!(renderer.calls(), 4, "evicted entry re-rendered");
    }
}
