//! Cache facade
//!
//! [`CacheStorageCache`] is the public surface of one named cache of one
//! origin. Every operation is queued on the cache's [`Scheduler`] when it is
//! called and runs against [`CacheCore`], the state owned by the scheduler's
//! worker. The backend is created lazily by the first operation.
//!
//! Backend lifecycle:
//! ```text
//! Uninitialized ──create ok──▶ Open ──close──▶ Closed
//!       │                                        ▲
//!       └────────create failed / close───────────┘
//! ```
//! Closed is terminal; operations that reach it fail with `Closed`.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::backend::{Backend, BackendFactory, DiskBackendFactory, MemoryBackendFactory};
use crate::batch::{validate_batch, BatchContext};
use crate::blob::DEFAULT_CHUNK_SIZE;
use crate::config::CacheStorageConfig;
use crate::constants::DEFAULT_MAX_QUERY_SIZE_BYTES;
use crate::error::CacheStorageError;
use crate::query::{MatchedResponse, QueryEngine, Requests, RequestsAndResponses};
use crate::quota::QuotaManager;
use crate::scheduler::{Scheduled, Scheduler};
use crate::types::{BatchOperation, FetchRequest, QueryParams};

/// Receives size changes of a cache
///
/// The cache keeps only a weak reference; an observer that has been dropped
/// is skipped.
pub trait CacheObserver: Send + Sync {
    fn cache_size_updated(&self, cache_name: &str, size: u64);
}

/// Shared collaborators and limits for caches of one storage context
#[derive(Clone)]
pub struct CacheDependencies {
    pub quota_manager: Arc<dyn QuotaManager>,
    pub max_query_size_bytes: u64,
    pub body_chunk_size: usize,
}

impl CacheDependencies {
    pub fn new(quota_manager: Arc<dyn QuotaManager>) -> Self {
        Self {
            quota_manager,
            max_query_size_bytes: DEFAULT_MAX_QUERY_SIZE_BYTES,
            body_chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn from_config(config: &CacheStorageConfig, quota_manager: Arc<dyn QuotaManager>) -> Self {
        Self {
            quota_manager,
            max_query_size_bytes: config.max_query_size_bytes,
            body_chunk_size: config.body_chunk_size,
        }
    }
}

enum BackendState {
    Uninitialized,
    Open(Box<dyn Backend>),
    Closed,
}

/// State owned by the scheduler worker
struct CacheCore {
    origin: String,
    cache_name: String,
    backend_state: BackendState,
    factory: Arc<dyn BackendFactory>,
    deps: CacheDependencies,
    observer: Option<Weak<dyn CacheObserver>>,
    cache_size: u64,
    published_size: Arc<AtomicU64>,
}

impl CacheCore {
    /// Create the backend if this is the first operation
    async fn ensure_backend(&mut self) {
        if !matches!(self.backend_state, BackendState::Uninitialized) {
            return;
        }

        match self.factory.create_backend().await {
            Ok(backend) => {
                tracing::info!(
                    origin = %self.origin,
                    cache_name = %self.cache_name,
                    "Cache backend created"
                );
                match backend.calculate_size().await {
                    Ok(size) => self.record_size(size),
                    Err(e) => tracing::warn!(
                        cache_name = %self.cache_name,
                        error = %e,
                        "Could not compute initial cache size"
                    ),
                }
                self.backend_state = BackendState::Open(backend);
            }
            Err(e) => {
                tracing::warn!(
                    origin = %self.origin,
                    cache_name = %self.cache_name,
                    error = %e,
                    "Cache backend creation failed; cache closed"
                );
                self.backend_state = BackendState::Closed;
            }
        }
    }

    fn backend(&self) -> Result<&dyn Backend, CacheStorageError> {
        match &self.backend_state {
            BackendState::Open(backend) => Ok(backend.as_ref()),
            _ => Err(CacheStorageError::Closed),
        }
    }

    async fn open_backend(&mut self) -> Result<&dyn Backend, CacheStorageError> {
        self.ensure_backend().await;
        self.backend()
    }

    fn batch_context(&self) -> Result<BatchContext<'_>, CacheStorageError> {
        Ok(BatchContext {
            backend: self.backend()?,
            quota: self.deps.quota_manager.as_ref(),
            origin: &self.origin,
            max_query_size_bytes: self.deps.max_query_size_bytes,
            body_chunk_size: self.deps.body_chunk_size,
        })
    }

    /// Adopt a freshly computed size, reporting the change to the quota
    /// manager and the observer
    fn record_size(&mut self, size: u64) {
        let delta = size as i64 - self.cache_size as i64;
        if delta != 0 {
            self.deps.quota_manager.notify_storage_modified(&self.origin, delta);
        }
        self.cache_size = size;
        self.published_size.store(size, Ordering::SeqCst);
        if let Some(observer) = self.observer.as_ref().and_then(Weak::upgrade) {
            observer.cache_size_updated(&self.cache_name, size);
        }
    }

    async fn update_size(&mut self) {
        let size = match self.backend() {
            Ok(backend) => backend.calculate_size().await,
            Err(_) => return,
        };
        match size {
            Ok(size) => self.record_size(size),
            Err(e) => tracing::warn!(cache_name = %self.cache_name, error = %e, "Could not update cache size"),
        }
    }

    async fn match_all(
        &mut self,
        request: Option<&FetchRequest>,
        params: &QueryParams,
    ) -> Result<Vec<MatchedResponse>, CacheStorageError> {
        let max = self.deps.max_query_size_bytes;
        let backend = self.open_backend().await?;
        QueryEngine::new(backend, max)
            .query(request, params, &RequestsAndResponses)
            .await
    }

    async fn match_one(
        &mut self,
        request: &FetchRequest,
        params: &QueryParams,
    ) -> Result<MatchedResponse, CacheStorageError> {
        self.match_all(Some(request), params)
            .await?
            .into_iter()
            .next()
            .ok_or(CacheStorageError::NotFound)
    }

    async fn keys(
        &mut self,
        request: Option<&FetchRequest>,
        params: &QueryParams,
    ) -> Result<Vec<FetchRequest>, CacheStorageError> {
        let max = self.deps.max_query_size_bytes;
        let backend = self.open_backend().await?;
        QueryEngine::new(backend, max).query(request, params, &Requests).await
    }

    async fn batch(&mut self, operations: Vec<BatchOperation>) -> Result<(), CacheStorageError> {
        self.ensure_backend().await;
        let context = self.batch_context()?;
        let result = context.execute(validate_batch(operations)?).await;
        if may_have_mutated(&result) {
            self.update_size().await;
        }
        result
    }

    async fn write_side_data(
        &mut self,
        url: &str,
        expected_response_time: DateTime<Utc>,
        data: Bytes,
    ) -> Result<(), CacheStorageError> {
        self.ensure_backend().await;
        let result = self
            .batch_context()?
            .write_side_data(url, expected_response_time, data)
            .await;
        if may_have_mutated(&result) {
            self.update_size().await;
        }
        result
    }

    async fn size(&mut self) -> Result<u64, CacheStorageError> {
        Ok(self.open_backend().await?.calculate_size().await?)
    }

    fn close(&mut self) {
        if !matches!(self.backend_state, BackendState::Closed) {
            tracing::info!(origin = %self.origin, cache_name = %self.cache_name, "Cache closed");
        }
        self.backend_state = BackendState::Closed;
    }
}

/// Results after which the stored size may differ from the tracked one
fn may_have_mutated(result: &Result<(), CacheStorageError>) -> bool {
    matches!(result, Ok(()) | Err(CacheStorageError::Storage(_)))
}

/// One named cache of an origin
pub struct CacheStorageCache {
    origin: String,
    cache_name: String,
    path: Option<PathBuf>,
    size: Arc<AtomicU64>,
    scheduler: Scheduler<CacheCore>,
}

impl CacheStorageCache {
    /// A cache whose entries live in memory
    pub fn create_memory_cache(
        origin: impl Into<String>,
        cache_name: impl Into<String>,
        deps: CacheDependencies,
    ) -> Self {
        Self::with_backend_factory(origin, cache_name, None, Arc::new(MemoryBackendFactory), deps, 0)
    }

    /// A cache stored under `path`. `cache_size` is the size last recorded
    /// for it; the difference to the real size is reported to the quota
    /// manager once the backend opens.
    pub fn create_persistent_cache(
        origin: impl Into<String>,
        cache_name: impl Into<String>,
        path: impl Into<PathBuf>,
        deps: CacheDependencies,
        cache_size: u64,
    ) -> Self {
        let path = path.into();
        let factory = Arc::new(DiskBackendFactory::new(path.clone()));
        Self::with_backend_factory(origin, cache_name, Some(path), factory, deps, cache_size)
    }

    /// A cache over a custom backend
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn with_backend_factory(
        origin: impl Into<String>,
        cache_name: impl Into<String>,
        path: Option<PathBuf>,
        factory: Arc<dyn BackendFactory>,
        deps: CacheDependencies,
        cache_size: u64,
    ) -> Self {
        let origin = origin.into();
        let cache_name = cache_name.into();
        let size = Arc::new(AtomicU64::new(cache_size));
        let core = CacheCore {
            origin: origin.clone(),
            cache_name: cache_name.clone(),
            backend_state: BackendState::Uninitialized,
            factory,
            deps,
            observer: None,
            cache_size,
            published_size: size.clone(),
        };
        Self {
            origin,
            cache_name,
            path,
            size,
            scheduler: Scheduler::new(core),
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    /// Directory of a persistent cache
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Size as of the last completed size-affecting operation
    pub fn cache_size(&self) -> u64 {
        self.size.load(Ordering::SeqCst)
    }

    /// Operations queued or running
    pub fn pending_operations(&self) -> usize {
        self.scheduler.pending_operations()
    }

    /// First response matching `request`; `NotFound` if none does
    pub fn match_request(&self, request: FetchRequest, params: QueryParams) -> Scheduled<MatchedResponse> {
        self.scheduler.schedule(move |core: &mut CacheCore| {
            async move { core.match_one(&request, &params).await }.boxed()
        })
    }

    /// All responses matching `request`, or every response when `None`
    pub fn match_all(
        &self,
        request: Option<FetchRequest>,
        params: QueryParams,
    ) -> Scheduled<Vec<MatchedResponse>> {
        self.scheduler.schedule(move |core: &mut CacheCore| {
            async move { core.match_all(request.as_ref(), &params).await }.boxed()
        })
    }

    /// Stored requests matching `request`, or all of them when `None`
    pub fn keys(&self, request: Option<FetchRequest>, params: QueryParams) -> Scheduled<Vec<FetchRequest>> {
        self.scheduler.schedule(move |core: &mut CacheCore| {
            async move { core.keys(request.as_ref(), &params).await }.boxed()
        })
    }

    /// Run a batch of puts, or a single delete
    pub fn batch_operation(&self, operations: Vec<BatchOperation>) -> Scheduled<()> {
        self.scheduler.schedule(move |core: &mut CacheCore| {
            async move { core.batch(operations).await }.boxed()
        })
    }

    /// Replace the side data stored for `url` if the entry still holds the
    /// response received at `expected_response_time`
    pub fn write_side_data(
        &self,
        url: impl Into<String>,
        expected_response_time: DateTime<Utc>,
        data: Bytes,
    ) -> Scheduled<()> {
        let url = url.into();
        self.scheduler.schedule(move |core: &mut CacheCore| {
            async move { core.write_side_data(&url, expected_response_time, data).await }.boxed()
        })
    }

    /// Bytes currently held by the backend
    pub fn size(&self) -> Scheduled<u64> {
        self.scheduler
            .schedule(|core: &mut CacheCore| async move { core.size().await }.boxed())
    }

    /// Size snapshot followed by close, with nothing in between
    pub fn get_size_then_close(&self) -> Scheduled<u64> {
        self.scheduler.schedule(|core: &mut CacheCore| {
            async move {
                let size = core.size().await;
                core.close();
                size
            }
            .boxed()
        })
    }

    /// Close the cache. Operations queued earlier still run; later ones fail
    /// with `Closed`.
    pub fn close(&self) -> Scheduled<()> {
        self.scheduler.schedule(|core: &mut CacheCore| {
            async move {
                core.close();
                Ok(())
            }
            .boxed()
        })
    }

    /// Replace the size observer; `None` clears it
    pub fn set_observer(&self, observer: Option<Weak<dyn CacheObserver>>) -> Scheduled<()> {
        self.scheduler.schedule(move |core: &mut CacheCore| {
            async move {
                core.observer = observer;
                Ok(())
            }
            .boxed()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock_backend::FailingBackendFactory;
    use crate::backend::StreamIndex;
    use crate::blob::BlobHandle;
    use crate::quota::{MockQuotaManager, StaticQuotaManager, UsageAndQuota};
    use crate::types::Response;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    const ORIGIN: &str = "https://x";

    fn deps() -> CacheDependencies {
        CacheDependencies::new(Arc::new(StaticQuotaManager::new(1024 * 1024)))
    }

    fn put(url: &str, body: &'static str) -> Vec<BatchOperation> {
        vec![BatchOperation::Put {
            request: FetchRequest::get(url),
            response: Response::ok(Some(BlobHandle::from_bytes(Bytes::from(body)))),
        }]
    }

    fn delete(url: &str) -> Vec<BatchOperation> {
        vec![BatchOperation::Delete {
            request: FetchRequest::get(url),
            params: QueryParams::default(),
        }]
    }

    fn failing_cache(factory: &FailingBackendFactory) -> CacheStorageCache {
        CacheStorageCache::with_backend_factory(ORIGIN, "test", None, Arc::new(factory.clone()), deps(), 0)
    }

    #[derive(Default)]
    struct RecordingObserver {
        sizes: Mutex<Vec<(String, u64)>>,
    }

    impl CacheObserver for RecordingObserver {
        fn cache_size_updated(&self, cache_name: &str, size: u64) {
            self.sizes.lock().push((cache_name.to_string(), size));
        }
    }

    #[tokio::test]
    async fn test_backend_created_once_for_concurrent_operations() {
        let factory = FailingBackendFactory::new();
        let cache = failing_cache(&factory);

        let a = cache.keys(None, QueryParams::default());
        let b = cache.size();
        let c = cache.match_all(None, QueryParams::default());

        assert!(a.await.unwrap().is_empty());
        assert_eq!(b.await.unwrap(), 0);
        assert!(c.await.unwrap().is_empty());
        assert_eq!(factory.creations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_backend_creation_failure_closes_cache() {
        let factory = FailingBackendFactory::new();
        factory.set_fail_open(true);
        let cache = failing_cache(&factory);

        let first = cache.size();
        let second = cache.batch_operation(put("https://x/a", "a"));

        assert_eq!(first.await, Err(CacheStorageError::Closed));
        assert_eq!(second.await, Err(CacheStorageError::Closed));

        // No second attempt once closed
        factory.set_fail_open(false);
        assert_eq!(cache.size().await, Err(CacheStorageError::Closed));
        assert_eq!(factory.creations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_operations_run_in_submission_order() {
        let cache = CacheStorageCache::create_memory_cache(ORIGIN, "ordered", deps());

        // Submitted without awaiting; effects must apply in this order
        let put_a = cache.batch_operation(put("https://x/a", "one"));
        let delete_a = cache.batch_operation(delete("https://x/a"));
        let match_a = cache.match_request(FetchRequest::get("https://x/a"), QueryParams::default());
        let put_again = cache.batch_operation(put("https://x/a", "two"));
        let match_again = cache.match_request(FetchRequest::get("https://x/a"), QueryParams::default());
        // Nothing has run yet on the single-threaded test runtime
        assert_eq!(cache.pending_operations(), 5);

        put_a.await.unwrap();
        delete_a.await.unwrap();
        assert_eq!(match_a.await.unwrap_err(), CacheStorageError::NotFound);
        put_again.await.unwrap();
        let body = match_again.await.unwrap().response.body.unwrap();
        assert_eq!(body.read_all().await.unwrap(), Bytes::from("two"));
    }

    #[tokio::test]
    async fn test_get_size_then_close_excludes_later_mutations() {
        let cache = CacheStorageCache::create_memory_cache(ORIGIN, "sized", deps());
        cache.batch_operation(put("https://x/a", "hello")).await.unwrap();
        let before = cache.size().await.unwrap();

        let size = cache.get_size_then_close();
        let late_put = cache.batch_operation(put("https://x/b", "late"));

        assert_eq!(size.await.unwrap(), before);
        assert_eq!(late_put.await, Err(CacheStorageError::Closed));
        assert_eq!(
            cache.match_all(None, QueryParams::default()).await.unwrap_err(),
            CacheStorageError::Closed
        );
    }

    #[tokio::test]
    async fn test_close_lets_queued_operations_finish() {
        let cache = CacheStorageCache::create_memory_cache(ORIGIN, "closing", deps());
        let queued = cache.batch_operation(put("https://x/a", "a"));
        let close = cache.close();
        let after = cache.keys(None, QueryParams::default());

        queued.await.unwrap();
        close.await.unwrap();
        assert_eq!(after.await.unwrap_err(), CacheStorageError::Closed);
        // Closing again is harmless
        cache.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_before_first_operation_skips_backend_creation() {
        let factory = FailingBackendFactory::new();
        let cache = failing_cache(&factory);

        cache.close().await.unwrap();
        assert_eq!(cache.size().await, Err(CacheStorageError::Closed));
        assert_eq!(factory.creations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_observer_receives_size_updates() {
        let cache = CacheStorageCache::create_memory_cache(ORIGIN, "observed", deps());
        let observer = Arc::new(RecordingObserver::default());
        let weak: Weak<dyn CacheObserver> = Arc::downgrade(&observer) as Weak<dyn CacheObserver>;
        cache.set_observer(Some(weak)).await.unwrap();

        cache.batch_operation(put("https://x/a", "hello")).await.unwrap();
        cache.batch_operation(delete("https://x/a")).await.unwrap();

        let sizes = observer.sizes.lock().clone();
        assert!(sizes.len() >= 2);
        assert!(sizes.iter().all(|(name, _)| name == "observed"));
        assert!(sizes[sizes.len() - 2].1 > 0);
        assert_eq!(sizes[sizes.len() - 1].1, 0);
        assert_eq!(cache.cache_size(), 0);
    }

    #[tokio::test]
    async fn test_dropped_observer_is_skipped() {
        let cache = CacheStorageCache::create_memory_cache(ORIGIN, "dropped", deps());
        let observer = Arc::new(RecordingObserver::default());
        let weak: Weak<dyn CacheObserver> = Arc::downgrade(&observer) as Weak<dyn CacheObserver>;
        cache.set_observer(Some(weak)).await.unwrap();
        drop(observer);

        cache.batch_operation(put("https://x/a", "hello")).await.unwrap();
        assert!(cache.cache_size() > 0);
    }

    #[tokio::test]
    async fn test_quota_is_notified_of_size_deltas() {
        let deltas = Arc::new(Mutex::new(Vec::new()));
        let recorded = deltas.clone();
        let mut quota = MockQuotaManager::new();
        quota
            .expect_get_usage_and_quota()
            .returning(|_| Ok(UsageAndQuota { usage: 0, quota: 1 << 20 }));
        quota
            .expect_notify_storage_modified()
            .returning(move |origin, delta| recorded.lock().push((origin.to_string(), delta)));

        let cache = CacheStorageCache::create_memory_cache(ORIGIN, "quota", CacheDependencies::new(Arc::new(quota)));
        cache.batch_operation(put("https://x/a", "hello")).await.unwrap();
        let size = cache.cache_size() as i64;
        cache.batch_operation(delete("https://x/a")).await.unwrap();

        let deltas = deltas.lock().clone();
        assert_eq!(deltas, vec![(ORIGIN.to_string(), size), (ORIGIN.to_string(), -size)]);
    }

    #[tokio::test]
    async fn test_initial_size_reconciliation() {
        let factory = FailingBackendFactory::new();
        {
            let seeded = failing_cache(&factory);
            seeded.batch_operation(put("https://x/a", "hello")).await.unwrap();
        }
        let actual = factory.backend.calculate_size().await.unwrap();

        let notified = Arc::new(AtomicUsize::new(0));
        let counter = notified.clone();
        let mut quota = MockQuotaManager::new();
        quota
            .expect_notify_storage_modified()
            .withf(move |_, delta| *delta == actual as i64 - 3)
            .returning(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            });

        // Recorded size of 3 is stale
        let cache = CacheStorageCache::with_backend_factory(
            ORIGIN,
            "test",
            None,
            Arc::new(factory.clone()),
            CacheDependencies::new(Arc::new(quota)),
            3,
        );
        assert_eq!(cache.cache_size(), 3);
        assert_eq!(cache.size().await.unwrap(), actual);
        assert_eq!(cache.cache_size(), actual);
        assert_eq!(notified.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_write_side_data_surfaces_in_match() {
        let cache = CacheStorageCache::create_memory_cache(ORIGIN, "side", deps());
        let response_time = Utc::now();
        let op = BatchOperation::Put {
            request: FetchRequest::get("https://x/script.js"),
            response: Response::ok(Some(BlobHandle::from_bytes(Bytes::from("code"))))
                .with_response_time(response_time),
        };
        cache.batch_operation(vec![op]).await.unwrap();
        cache
            .write_side_data("https://x/script.js", response_time, Bytes::from("compiled"))
            .await
            .unwrap();

        let matched = cache
            .match_request(FetchRequest::get("https://x/script.js"), QueryParams::default())
            .await
            .unwrap();
        let side_data = matched.response.side_data.unwrap();
        assert_eq!(side_data.read_all().await.unwrap(), Bytes::from("compiled"));
    }

    #[tokio::test]
    async fn test_failed_put_does_not_block_later_operations() {
        let factory = FailingBackendFactory::new();
        let cache = failing_cache(&factory);
        cache.size().await.unwrap();
        factory.backend.set_fail_writes(StreamIndex::Body, true);

        let failed = cache.batch_operation(put("https://x/a", "a"));
        let keys = cache.keys(None, QueryParams::default());

        assert!(matches!(failed.await, Err(CacheStorageError::Storage(_))));
        assert!(keys.await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_size_failure_keeps_last_known_size() {
        let factory = FailingBackendFactory::new();
        let cache = failing_cache(&factory);
        cache.batch_operation(put("https://x/a", "hello")).await.unwrap();
        let known = cache.cache_size();
        assert!(known > 0);

        factory.backend.set_fail_size(true);
        cache.batch_operation(put("https://x/b", "more")).await.unwrap();

        assert_eq!(cache.cache_size(), known);
        assert!(matches!(cache.size().await, Err(CacheStorageError::Storage(_))));
    }

    #[tokio::test]
    async fn test_invalid_batch_reports_invalid() {
        let cache = CacheStorageCache::create_memory_cache(ORIGIN, "invalid", deps());
        let result = cache.batch_operation(Vec::new()).await;
        assert!(matches!(result, Err(CacheStorageError::Invalid(_))));
    }

    #[test]
    fn test_accessors() {
        tokio_test::block_on(async {
            let cache = CacheStorageCache::create_persistent_cache(
                ORIGIN,
                "disk",
                "/tmp/cache-storage-accessors",
                deps(),
                42,
            );
            assert_eq!(cache.origin(), ORIGIN);
            assert_eq!(cache.cache_name(), "disk");
            assert_eq!(cache.path(), Some(Path::new("/tmp/cache-storage-accessors")));
            // Nothing has run yet, so the recorded size is reported as is
            assert_eq!(cache.cache_size(), 42);
        });
    }
}
