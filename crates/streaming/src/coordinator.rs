//! Cache-aware, deduplicating load coordinator.
//!
//! Lookup order for a key is always: memory layer, persistent store, in-flight
//! registry, network. At most one network fetch per key runs at a time; every
//! concurrent caller attaches to the same shared result.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use foundation::time::Clock;
use futures_util::FutureExt;
use futures_util::future::Shared;
use parking_lot::Mutex;
use runtime::metrics::{Metrics, MetricsSnapshot};
use serde_json::Value;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::{MemoryBudget, TtlCache};
use crate::error::LoadError;
use crate::fetch::Fetcher;
use crate::queue::FetchQueue;
use crate::request::{CacheKey, DataKind, LoadRequest};
use crate::store::{BoxFuture, CacheStore};

type SharedLoad = Shared<BoxFuture<'static, Result<Arc<Value>, LoadError>>>;

#[derive(Debug, Clone, PartialEq)]
pub struct Loaded {
    pub data: Arc<Value>,
    pub from_cache: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorSettings {
    pub max_concurrent_fetches: usize,
    pub memory_budget_bytes: usize,
    /// Delay before the first retry; doubles on every further attempt.
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            max_concurrent_fetches: 6,
            memory_budget_bytes: 256 * 1024 * 1024,
            retry_base_delay: Duration::from_millis(250),
            retry_max_delay: Duration::from_secs(8),
        }
    }
}

impl CoordinatorSettings {
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.retry_base_delay
            .saturating_mul(factor)
            .min(self.retry_max_delay)
    }
}

struct InFlight {
    id: u64,
    shared: SharedLoad,
    abort: AbortHandle,
}

struct Inner {
    fetcher: Arc<dyn Fetcher>,
    cache: TtlCache,
    queue: FetchQueue,
    inflight: Mutex<HashMap<CacheKey, InFlight>>,
    metrics: Mutex<Metrics>,
    next_id: AtomicU64,
    shut_down: AtomicBool,
    settings: CoordinatorSettings,
}

/// Cheap-to-clone handle; all clones share one cache and one registry.
#[derive(Clone)]
pub struct CacheCoordinator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CacheCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheCoordinator")
            .field("cache", &self.inner.cache)
            .field("in_flight", &self.inner.inflight.lock().len())
            .field("shut_down", &self.inner.is_shut_down())
            .finish()
    }
}

impl CacheCoordinator {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        store: Arc<dyn CacheStore>,
        clock: Arc<dyn Clock>,
        settings: CoordinatorSettings,
    ) -> Self {
        let cache = TtlCache::new(
            MemoryBudget::new(settings.memory_budget_bytes),
            store,
            clock,
        );
        Self {
            inner: Arc::new(Inner {
                fetcher,
                cache,
                queue: FetchQueue::new(settings.max_concurrent_fetches),
                inflight: Mutex::new(HashMap::new()),
                metrics: Mutex::new(Metrics::new()),
                next_id: AtomicU64::new(1),
                shut_down: AtomicBool::new(false),
                settings,
            }),
        }
    }

    pub fn cache(&self) -> &TtlCache {
        &self.inner.cache
    }

    pub async fn load(&self, request: LoadRequest) -> Result<Loaded, LoadError> {
        let inner = &self.inner;
        if inner.is_shut_down() {
            return Err(LoadError::Shutdown);
        }
        let key = request.key.clone();
        let use_cache = request.options.cache_enabled;

        if use_cache && let Some(data) = inner.cache.get(&key).await {
            inner.metrics.lock().inc("cache.hit");
            debug!(%key, "cache hit");
            return Ok(Loaded {
                data,
                from_cache: true,
            });
        }

        let shared = {
            let mut inflight = inner.inflight.lock();
            if inner.is_shut_down() {
                return Err(LoadError::Shutdown);
            }
            // A fetch may have completed between the lookup above and taking
            // the registry lock; its result is already in memory.
            if use_cache && let Some(data) = inner.cache.get_hot(&key) {
                inner.metrics.lock().inc("cache.hit");
                return Ok(Loaded {
                    data,
                    from_cache: true,
                });
            }
            match inflight.get(&key) {
                Some(existing) => {
                    inner.metrics.lock().inc("fetch.dedup");
                    debug!(%key, "attached to in-flight fetch");
                    existing.shared.clone()
                }
                None => {
                    inner.metrics.lock().inc("cache.miss");
                    Inner::start_fetch(inner, &mut inflight, request)
                }
            }
        };

        let data = shared.await?;
        Ok(Loaded {
            data,
            from_cache: false,
        })
    }

    /// Warms the cache in the background. Failures are logged at debug level.
    pub fn prefetch(&self, request: LoadRequest) {
        if self.inner.is_shut_down() {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            let key = request.key.clone();
            if let Err(e) = this.load(request).await
                && !e.is_cancelled()
            {
                debug!(%key, error = %e, "prefetch failed");
            }
        });
    }

    /// Aborts the in-flight fetch for `key`. Attached callers get
    /// `LoadError::Cancelled`. Returns whether a fetch was running.
    pub fn cancel(&self, key: &CacheKey) -> bool {
        let entry = self.inner.inflight.lock().remove(key);
        match entry {
            Some(entry) => {
                entry.abort.abort();
                self.inner.metrics.lock().inc("fetch.cancelled");
                debug!(%key, "in-flight fetch cancelled");
                true
            }
            None => false,
        }
    }

    pub fn is_in_flight(&self, key: &CacheKey) -> bool {
        self.inner.inflight.lock().contains_key(key)
    }

    pub fn in_flight_count(&self) -> usize {
        self.inner.inflight.lock().len()
    }

    pub async fn invalidate(&self, key: &CacheKey) {
        self.inner.cache.invalidate(key).await;
    }

    pub async fn clear(&self) {
        self.inner.cache.clear().await;
    }

    pub fn stats(&self) -> MetricsSnapshot {
        let mut metrics = self.inner.metrics.lock();
        metrics.set_gauge("cache.memory_bytes", self.inner.cache.used_bytes() as i64);
        metrics.set_gauge("fetch.queued", self.inner.queue.queued() as i64);
        metrics.snapshot()
    }

    /// Aborts every in-flight fetch and refuses further loads.
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let drained: Vec<InFlight> = self.inner.inflight.lock().drain().map(|(_, v)| v).collect();
        for entry in &drained {
            entry.abort.abort();
        }
        info!(aborted = drained.len(), "cache coordinator shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.is_shut_down()
    }
}

impl Inner {
    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Spawns the fetch task and registers it. Caller holds the registry lock.
    fn start_fetch(
        this: &Arc<Inner>,
        inflight: &mut HashMap<CacheKey, InFlight>,
        request: LoadRequest,
    ) -> SharedLoad {
        let id = this.next_id.fetch_add(1, Ordering::Relaxed);
        let key = request.key.clone();
        let url = request.url.clone();

        let task_inner = this.clone();
        let handle = tokio::spawn(async move { task_inner.run_fetch(id, request).await });
        let abort = handle.abort_handle();

        let fut: BoxFuture<'static, Result<Arc<Value>, LoadError>> = Box::pin(async move {
            match handle.await {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => Err(LoadError::Cancelled),
                Err(e) => Err(LoadError::Network {
                    url,
                    message: format!("fetch task failed: {e}"),
                    attempts: 0,
                }),
            }
        });
        let shared = fut.shared();
        inflight.insert(
            key,
            InFlight {
                id,
                shared: shared.clone(),
                abort,
            },
        );
        shared
    }

    async fn run_fetch(self: Arc<Self>, id: u64, request: LoadRequest) -> Result<Arc<Value>, LoadError> {
        let LoadRequest {
            key,
            url,
            kind,
            options,
        } = request;

        let fetched = async {
            let _slot = self.queue.acquire(options.priority).await;
            let started = Instant::now();
            let bytes = self.fetch_with_retry(&url, kind, options.max_retries).await;
            self.metrics
                .lock()
                .record("fetch.latency_ms", started.elapsed().as_millis() as i64);
            let bytes = bytes?;
            let value: Value = serde_json::from_slice(&bytes).map_err(|e| LoadError::Decode {
                url: url.clone(),
                message: e.to_string(),
            })?;
            Ok::<_, LoadError>((Arc::new(value), bytes.len()))
        }
        .await;

        // Memory first, then release the registry entry.
        let stored_at = self.cache.now();
        if options.cache_enabled
            && let Ok((data, len)) = &fetched
        {
            self.cache
                .insert_hot(&key, data.clone(), stored_at, options.ttl, *len);
        }
        self.finish(&key, id);

        match fetched {
            Ok((data, len)) => {
                debug!(%key, bytes = len, "fetch complete");
                if options.cache_enabled {
                    self.cache
                        .persist(&key, &data, stored_at, options.ttl, len)
                        .await;
                }
                Ok(data)
            }
            Err(e) => {
                warn!(%key, error = %e, "fetch failed");
                Err(e)
            }
        }
    }

    async fn fetch_with_retry(&self, url: &str, kind: DataKind, max_retries: u32) -> Result<Bytes, LoadError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            self.metrics.lock().inc("fetch.issued");
            match self.fetcher.fetch(url, kind).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) if e.is_transient() && attempt <= max_retries => {
                    let delay = self.settings.backoff(attempt);
                    self.metrics.lock().inc("fetch.retry");
                    debug!(url, attempt, error = %e, delay_ms = delay.as_millis() as u64, "retrying fetch");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(LoadError::from_fetch(url, e, attempt)),
            }
        }
    }

    fn finish(&self, key: &CacheKey, id: u64) {
        let mut inflight = self.inflight.lock();
        if inflight.get(key).is_some_and(|e| e.id == id) {
            inflight.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::Bytes;
    use foundation::time::{ManualClock, Timestamp};
    use futures_util::future::join_all;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::{CacheCoordinator, CoordinatorSettings};
    use crate::error::{FetchError, LoadError};
    use crate::fetch::MemoryFetcher;
    use crate::request::{CacheKey, DataKind, LoadOptions, LoadRequest, Priority, SpatialKey};
    use crate::store::MemoryStore;

    const URL: &str = "http://data.test/buildings?postinumero=00100";

    fn request(code: &str, url: &str) -> LoadRequest {
        LoadRequest::new(
            CacheKey::new("buildings", SpatialKey::postal_code(code)),
            url,
            DataKind::GeoJson,
        )
    }

    fn setup(settings: CoordinatorSettings) -> (CacheCoordinator, Arc<MemoryFetcher>, Arc<ManualClock>) {
        let fetcher = Arc::new(MemoryFetcher::new());
        let clock = Arc::new(ManualClock::new(Timestamp(1_700_000_000_000)));
        let coord = CacheCoordinator::new(
            fetcher.clone(),
            Arc::new(MemoryStore::new()),
            clock.clone(),
            settings,
        );
        (coord, fetcher, clock)
    }

    fn default_setup() -> (CacheCoordinator, Arc<MemoryFetcher>, Arc<ManualClock>) {
        setup(CoordinatorSettings {
            retry_base_delay: Duration::from_millis(10),
            ..CoordinatorSettings::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_loads_share_one_fetch() {
        let (coord, fetcher, _) = default_setup();
        fetcher.insert_json(URL, &json!({"features": [1, 2, 3]}));
        fetcher.set_delay(URL, Duration::from_millis(200));

        let results = join_all((0..5).map(|_| coord.load(request("00100", URL)))).await;

        assert_eq!(fetcher.calls(URL), 1);
        let first = results[0].as_ref().unwrap();
        for r in &results {
            let r = r.as_ref().unwrap();
            assert!(!r.from_cache);
            assert_eq!(r.data, first.data);
        }
        assert_eq!(coord.stats().counter("fetch.dedup"), 4);
        assert!(!coord.is_in_flight(&request("00100", URL).key));
    }

    #[tokio::test(start_paused = true)]
    async fn second_load_is_served_from_cache() {
        let (coord, fetcher, _) = default_setup();
        fetcher.insert_json(URL, &json!({"features": []}));

        let first = coord.load(request("00100", URL)).await.unwrap();
        let second = coord.load(request("00100", URL)).await.unwrap();

        assert!(!first.from_cache);
        assert!(second.from_cache);
        assert_eq!(fetcher.calls(URL), 1);
        assert_eq!(coord.stats().counter("cache.hit"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_refetched() {
        let (coord, fetcher, clock) = default_setup();
        fetcher.insert_json(URL, &json!({"v": 1}));
        let req = request("00100", URL).with_options(LoadOptions {
            ttl: Duration::from_secs(60),
            ..LoadOptions::default()
        });

        coord.load(req.clone()).await.unwrap();
        clock.advance(Duration::from_secs(61));
        fetcher.insert_json(URL, &json!({"v": 2}));

        let again = coord.load(req.clone()).await.unwrap();
        assert!(!again.from_cache);
        assert_eq!(*again.data, json!({"v": 2}));
        assert_eq!(fetcher.calls(URL), 2);

        let cached = coord.load(req).await.unwrap();
        assert_eq!(*cached.data, json!({"v": 2}));
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_cache_always_fetches() {
        let (coord, fetcher, _) = default_setup();
        fetcher.insert_json(URL, &json!({}));
        let req = request("00100", URL).with_options(LoadOptions {
            cache_enabled: false,
            ..LoadOptions::default()
        });
        coord.load(req.clone()).await.unwrap();
        coord.load(req).await.unwrap();
        assert_eq!(fetcher.calls(URL), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn client_errors_are_not_retried() {
        let (coord, fetcher, _) = default_setup();
        fetcher.insert_error(URL, FetchError::Status(404));

        let err = coord.load(request("00100", URL)).await.unwrap_err();
        assert_eq!(
            err,
            LoadError::Http {
                url: URL.into(),
                status: 404
            }
        );
        assert_eq!(fetcher.calls(URL), 1);
        assert_eq!(coord.stats().counter("fetch.retry"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried_then_succeed() {
        let (coord, fetcher, _) = default_setup();
        fetcher.insert_json(URL, &json!({"ok": true}));
        fetcher.push_response(URL, Err(FetchError::Status(503)));
        fetcher.push_response(URL, Err(FetchError::Timeout));

        let loaded = coord.load(request("00100", URL)).await.unwrap();
        assert_eq!(*loaded.data, json!({"ok": true}));
        assert_eq!(fetcher.calls(URL), 3);
        assert_eq!(coord.stats().counter("fetch.retry"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_stop_at_the_limit() {
        let (coord, fetcher, _) = default_setup();
        fetcher.insert_error(URL, FetchError::Status(502));
        let req = request("00100", URL).with_options(LoadOptions {
            max_retries: 1,
            ..LoadOptions::default()
        });

        let err = coord.load(req).await.unwrap_err();
        assert!(err.is_transient());
        assert!(matches!(err, LoadError::Network { attempts: 2, .. }));
        assert_eq!(fetcher.calls(URL), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_not_cached() {
        let (coord, fetcher, _) = default_setup();
        fetcher.push_response(URL, Err(FetchError::Status(400)));
        fetcher.insert_json(URL, &json!({"ok": true}));

        assert!(coord.load(request("00100", URL)).await.is_err());
        assert!(coord.load(request("00100", URL)).await.is_ok());
        assert_eq!(fetcher.calls(URL), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_json_is_a_decode_error() {
        let (coord, fetcher, _) = default_setup();
        fetcher.push_response(URL, Ok(Bytes::from_static(b"<html>")));
        let err = coord.load(request("00100", URL)).await.unwrap_err();
        assert!(matches!(err, LoadError::Decode { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn queued_high_priority_runs_before_low() {
        let (coord, fetcher, _) = setup(CoordinatorSettings {
            max_concurrent_fetches: 1,
            ..CoordinatorSettings::default()
        });
        let (busy, low, high) = ("http://t/busy", "http://t/low", "http://t/high");
        for url in [busy, low, high] {
            fetcher.insert_json(url, &json!({}));
        }
        fetcher.set_delay(busy, Duration::from_millis(500));

        let mut tasks = Vec::new();
        for (code, url, p) in [
            ("1", busy, Priority::Normal),
            ("2", low, Priority::Low),
            ("3", high, Priority::High),
        ] {
            let coord = coord.clone();
            tasks.push(tokio::spawn(async move {
                coord.load(request(code, url).with_priority(p)).await
            }));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        for t in tasks {
            t.await.unwrap().unwrap();
        }
        assert_eq!(fetcher.call_log(), vec![busy, high, low]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_aborts_attached_callers() {
        let (coord, fetcher, _) = default_setup();
        fetcher.insert_json(URL, &json!({}));
        fetcher.set_delay(URL, Duration::from_secs(5));
        let req = request("00100", URL);

        let pending = {
            let coord = coord.clone();
            let req = req.clone();
            tokio::spawn(async move { coord.load(req).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(coord.is_in_flight(&req.key));

        assert!(coord.cancel(&req.key));
        assert_eq!(pending.await.unwrap(), Err(LoadError::Cancelled));
        assert!(!coord.is_in_flight(&req.key));
        assert!(coord.cache().get_hot(&req.key).is_none());
        assert!(!coord.cancel(&req.key));
    }

    #[tokio::test(start_paused = true)]
    async fn prefetch_warms_the_cache() {
        let (coord, fetcher, _) = default_setup();
        fetcher.insert_json(URL, &json!({"warm": true}));
        coord.prefetch(request("00100", URL).with_priority(Priority::Low));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let loaded = coord.load(request("00100", URL)).await.unwrap();
        assert!(loaded.from_cache);
        assert_eq!(fetcher.calls(URL), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_forces_a_refetch() {
        let (coord, fetcher, _) = default_setup();
        fetcher.insert_json(URL, &json!({}));
        coord.load(request("00100", URL)).await.unwrap();
        coord.invalidate(&request("00100", URL).key).await;
        let again = coord.load(request("00100", URL)).await.unwrap();
        assert!(!again.from_cache);
        assert_eq!(fetcher.calls(URL), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_aborts_and_refuses_new_loads() {
        let (coord, fetcher, _) = default_setup();
        fetcher.insert_json(URL, &json!({}));
        fetcher.set_delay(URL, Duration::from_secs(5));

        let pending = {
            let coord = coord.clone();
            tokio::spawn(async move { coord.load(request("00100", URL)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        coord.shutdown();
        assert_eq!(pending.await.unwrap(), Err(LoadError::Cancelled));
        assert_eq!(coord.in_flight_count(), 0);
        assert_eq!(
            coord.load(request("00100", URL)).await,
            Err(LoadError::Shutdown)
        );
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let s = CoordinatorSettings {
            retry_base_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_millis(350),
            ..CoordinatorSettings::default()
        };
        assert_eq!(s.backoff(1), Duration::from_millis(100));
        assert_eq!(s.backoff(2), Duration::from_millis(200));
        assert_eq!(s.backoff(3), Duration::from_millis(350));
    }
}
