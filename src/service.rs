//! The thumbnail service: source + spec in, cache reference out.
//!
//! ```text
//! fingerprint ──▶ fresh? ──yes──▶ reference (no decode)
//!                   │
//!                   no
//!                   ▼
//!        single-flight on the cache key
//!                   │
//!     leader: locate ▶ decode ▶ pipeline ▶ atomic write ▶ @2x (optional)
//!     waiters: block until the leader is done, then share its reference
//! ```
//!
//! A cache hit costs one `stat`: no decode, no pipeline, no retina work.
//!
//! Concurrent misses on the same key coalesce into a single computation. The
//! leader re-checks freshness after taking leadership, so a request that lost
//! the race to a just-finished leader is served from the cache. If the
//! leader fails, its waiters retry on their own; every request still gets its
//! own error rather than someone else's.
//!
//! The source is decoded once per miss. The base pipeline runs on a clone of
//! the decoded handle and the `@2x` pass on another, so the retina pass never
//! resamples an already-resampled image.

use crate::cache::{CacheKey, CacheStats, CacheStore, DiskStore, is_fresh};
use crate::config::ServiceConfig;
use crate::fingerprint::{Fingerprint, fingerprint};
use crate::imaging::{BackendError, ImageBackend, OutputFormat, Quality};
use crate::locator::{BaseDirLocator, SourceLocator};
use crate::pipeline::{CancelToken, PipelineContext, PipelineError, execute};
use crate::retina::{self, RetinaOutcome};
use crate::transform::{TransformSpec, ValidationError};
use serde_json::Value;
use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::{debug, info};

/// How often a waiter re-checks its cancel token.
const WAIT_POLL: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("source image not found: {0}")]
    NotFound(String),
    #[error("invalid transform spec: {0}")]
    Validation(#[from] ValidationError),
    #[error("image processing failed: {0}")]
    Capability(#[from] BackendError),
    #[error("cache I/O error: {0}")]
    Cache(#[source] io::Error),
    #[error("unsupported output format \"{0}\"")]
    UnknownFormat(String),
    #[error("request cancelled")]
    Cancelled,
}

impl From<PipelineError> for ServiceError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::Backend(e) => ServiceError::Capability(e),
            PipelineError::NotFound(path) => ServiceError::NotFound(path),
            PipelineError::Cancelled => ServiceError::Cancelled,
            PipelineError::Store(e) => ServiceError::Cache(e),
        }
    }
}

/// One thumbnail request.
#[derive(Debug, Clone, Copy)]
pub struct ThumbnailRequest<'a> {
    /// Source path as the caller names it; part of the fingerprint.
    pub source: &'a str,
    pub spec: &'a TransformSpec,
    /// Cache-busting token; part of the fingerprint.
    pub token: Option<&'a str>,
}

/// How a request was served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// A fresh entry already existed.
    Hit,
    /// This request rendered the entry.
    Generated,
    /// Another in-flight request rendered it.
    Coalesced,
}

/// A served request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thumbnail {
    /// Web reference to the cached image.
    pub reference: String,
    pub fingerprint: Fingerprint,
    pub status: CacheStatus,
    pub retina: RetinaOutcome,
}

impl Thumbnail {
    /// Tally this request into `stats`.
    pub fn record(&self, stats: &mut CacheStats) {
        match self.status {
            CacheStatus::Hit => stats.hit(),
            CacheStatus::Generated => stats.generate(),
            CacheStatus::Coalesced => stats.coalesce(),
        }
        if matches!(self.retina, RetinaOutcome::Written(_)) {
            stats.retina();
        }
    }
}

/// Shared state of one in-flight computation.
#[derive(Default)]
struct Flight {
    state: Mutex<FlightState>,
    done: Condvar,
}

#[derive(Default)]
enum FlightState {
    #[default]
    Running,
    Done(String),
    Failed,
}

impl Flight {
    fn finish(&self, reference: Option<String>) {
        *lock(&self.state) = match reference {
            Some(r) => FlightState::Done(r),
            None => FlightState::Failed,
        };
        self.done.notify_all();
    }

    /// Block until the leader finishes. `None` means it failed.
    fn wait(&self, cancel: &CancelToken) -> Result<Option<String>, ServiceError> {
        let mut state = lock(&self.state);
        loop {
            match &*state {
                FlightState::Done(reference) => return Ok(Some(reference.clone())),
                FlightState::Failed => return Ok(None),
                FlightState::Running => {}
            }
            if cancel.is_cancelled() {
                return Err(ServiceError::Cancelled);
            }
            state = self
                .done
                .wait_timeout(state, WAIT_POLL)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }
}

/// Removes the flight and wakes its waiters, also when the leader panics.
struct Leadership<'a> {
    in_flight: &'a Mutex<HashMap<CacheKey, Arc<Flight>>>,
    key: &'a CacheKey,
    flight: Arc<Flight>,
    reference: Option<String>,
}

impl Drop for Leadership<'_> {
    fn drop(&mut self) {
        lock(self.in_flight).remove(self.key);
        self.flight.finish(self.reference.take());
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Serves cached derivatives of source images.
///
/// `Send + Sync`: share one instance by reference across threads.
pub struct ThumbnailService<
    B: ImageBackend,
    S: CacheStore = DiskStore,
    L: SourceLocator = BaseDirLocator,
> {
    backend: B,
    store: S,
    locator: L,
    ttl: Duration,
    default_quality: Quality,
    retina: bool,
    in_flight: Mutex<HashMap<CacheKey, Arc<Flight>>>,
}

impl<B: ImageBackend> ThumbnailService<B> {
    /// A service with a disk cache and base-directory lookup, as configured.
    pub fn from_config(backend: B, config: &ServiceConfig) -> Self {
        let store = DiskStore::new(config.cache_root(), config.web_prefix())
            .with_modes(config.dir_mode, config.file_mode);
        let locator = BaseDirLocator::new(&config.base_path);
        Self::new(backend, store, locator)
            .with_ttl(config.ttl())
            .with_quality(config.default_quality())
            .with_retina(config.retina)
    }
}

impl<B: ImageBackend, S: CacheStore, L: SourceLocator> ThumbnailService<B, S, L> {
    /// A service with the stock policy: 30-day TTL, quality 100, no `@2x`.
    pub fn new(backend: B, store: S, locator: L) -> Self {
        let defaults = ServiceConfig::default();
        Self {
            backend,
            store,
            locator,
            ttl: defaults.ttl(),
            default_quality: defaults.default_quality(),
            retina: defaults.retina,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_quality(mut self, quality: Quality) -> Self {
        self.default_quality = quality;
        self
    }

    pub fn with_retina(mut self, retina: bool) -> Self {
        self.retina = retina;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Cache key and output format for a request. Pure; no I/O.
    pub fn key_for(
        &self,
        source: &str,
        spec: &TransformSpec,
        token: Option<&str>,
    ) -> Result<(CacheKey, OutputFormat), ServiceError> {
        let extension = match spec.output_extension() {
            Some(ext) => ext.to_string(),
            None => Path::new(source)
                .extension()
                .map(|e| e.to_string_lossy().into_owned())
                .ok_or_else(|| ServiceError::UnknownFormat(String::new()))?,
        };
        let format = OutputFormat::from_extension(&extension)
            .ok_or_else(|| ServiceError::UnknownFormat(extension.clone()))?;
        let key = CacheKey::new(fingerprint(source, spec, token), extension);
        Ok((key, format))
    }

    /// Web reference to an up-to-date derivative of `source`.
    pub fn thumbnail_reference_for(
        &self,
        source: &str,
        spec: &TransformSpec,
        token: Option<&str>,
    ) -> Result<String, ServiceError> {
        Ok(self.thumbnail_for(source, spec, token)?.reference)
    }

    /// Like [`thumbnail_reference_for`](Self::thumbnail_reference_for), with details.
    pub fn thumbnail_for(
        &self,
        source: &str,
        spec: &TransformSpec,
        token: Option<&str>,
    ) -> Result<Thumbnail, ServiceError> {
        let request = ThumbnailRequest {
            source,
            spec,
            token,
        };
        self.thumbnail_for_with(request, &CancelToken::new())
    }

    /// Parse a JSON spec, then serve it.
    pub fn thumbnail_from_json(
        &self,
        source: &str,
        spec: &Value,
        token: Option<&str>,
    ) -> Result<Thumbnail, ServiceError> {
        let spec = TransformSpec::from_json(spec)?;
        self.thumbnail_for(source, &spec, token)
    }

    /// Serve a request, giving up when `cancel` fires.
    ///
    /// A cancelled request never leaves a partial file behind; it may leave
    /// a complete one if cancellation came after the final write.
    pub fn thumbnail_for_with(
        &self,
        request: ThumbnailRequest<'_>,
        cancel: &CancelToken,
    ) -> Result<Thumbnail, ServiceError> {
        let (key, format) = self.key_for(request.source, request.spec, request.token)?;

        if let Some(hit) = self.cached(&key, CacheStatus::Hit) {
            debug!(source = request.source, key = %key, "Cache hit");
            return Ok(hit);
        }

        loop {
            let (flight, leader) = {
                let mut in_flight = lock(&self.in_flight);
                match in_flight.get(&key) {
                    Some(flight) => (flight.clone(), false),
                    None => {
                        let flight = Arc::new(Flight::default());
                        in_flight.insert(key.clone(), flight.clone());
                        (flight, true)
                    }
                }
            };
            if leader {
                return self.lead(request, &key, format, flight, cancel);
            }

            debug!(key = %key, "Waiting for in-flight render");
            if let Some(reference) = flight.wait(cancel)? {
                return Ok(Thumbnail {
                    reference,
                    fingerprint: key.fingerprint,
                    status: CacheStatus::Coalesced,
                    retina: RetinaOutcome::Skipped,
                });
            }
            // Leader failed: try again, possibly as the new leader
        }
    }

    fn cached(&self, key: &CacheKey, status: CacheStatus) -> Option<Thumbnail> {
        is_fresh(&self.store, key, self.ttl, SystemTime::now()).then(|| Thumbnail {
            reference: self.store.resolve(key).web_reference,
            fingerprint: key.fingerprint,
            status,
            retina: RetinaOutcome::Skipped,
        })
    }

    fn lead(
        &self,
        request: ThumbnailRequest<'_>,
        key: &CacheKey,
        format: OutputFormat,
        flight: Arc<Flight>,
        cancel: &CancelToken,
    ) -> Result<Thumbnail, ServiceError> {
        let mut leadership = Leadership {
            in_flight: &self.in_flight,
            key,
            flight,
            reference: None,
        };

        // Someone may have finished between our first check and taking the lead
        let result = match self.cached(key, CacheStatus::Hit) {
            Some(hit) => Ok(hit),
            None => self.generate(request, key, format, cancel),
        };

        if let Ok(thumbnail) = &result {
            leadership.reference = Some(thumbnail.reference.clone());
        }
        result
    }

    fn generate(
        &self,
        request: ThumbnailRequest<'_>,
        key: &CacheKey,
        format: OutputFormat,
        cancel: &CancelToken,
    ) -> Result<Thumbnail, ServiceError> {
        cancel.check()?;

        let path = self
            .locator
            .resolve(request.source)
            .ok_or_else(|| ServiceError::NotFound(request.source.to_string()))?;
        self.store.ensure_shard(key).map_err(ServiceError::Cache)?;

        let original = self.backend.decode(&path)?;
        let ctx = PipelineContext {
            backend: &self.backend,
            locator: &self.locator,
            default_quality: self.default_quality,
            cancel,
        };

        let base = execute::<B, S>(
            original.clone(),
            request.spec,
            &ctx,
            &self.store,
            key,
            format,
        )?;
        let reference = self.store.resolve(key).web_reference;
        info!(
            source = request.source,
            key = %key,
            width = base.width,
            height = base.height,
            "Generated"
        );

        let retina = if self.retina {
            retina::derive::<B, S>(
                &original,
                base,
                request.spec,
                &ctx,
                &self.store,
                key,
                format,
            )
        } else {
            RetinaOutcome::Skipped
        };

        Ok(Thumbnail {
            reference,
            fingerprint: key.fingerprint,
            status: CacheStatus::Generated,
            retina,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;
    use crate::imaging::backend::tests::MockBackend;
    use crate::locator::tests::KnownSources;
    use serde_json::json;

    type TestService = ThumbnailService<MockBackend, MemoryStore, KnownSources>;

    fn service(backend: MockBackend) -> TestService {
        ThumbnailService::new(
            backend,
            MemoryStore::new("/easyimage"),
            KnownSources(vec!["photos/a.jpg", "photos/small.jpg", "mark.png"]),
        )
    }

    fn default_backend() -> MockBackend {
        MockBackend::new()
            .with_source("photos/a.jpg", 400, 300)
            .with_source("photos/small.jpg", 150, 150)
            .with_source("mark.png", 10, 10)
    }

    fn spec(value: serde_json::Value) -> TransformSpec {
        TransformSpec::from_json(&value).unwrap()
    }

    #[test]
    fn miss_generates_then_hit_skips_decode() {
        let svc = service(default_backend());
        let s = spec(json!({"resize": {"width": 200}}));

        let first = svc.thumbnail_for("photos/a.jpg", &s, None).unwrap();
        assert_eq!(first.status, CacheStatus::Generated);
        assert_eq!(svc.backend().decode_count(), 1);

        let second = svc.thumbnail_for("photos/a.jpg", &s, None).unwrap();
        assert_eq!(second.status, CacheStatus::Hit);
        assert_eq!(second.reference, first.reference);
        assert_eq!(svc.backend().decode_count(), 1);
    }

    #[test]
    fn reference_has_shard_and_extension() {
        let svc = service(default_backend());
        let s = spec(json!({"resize": {"width": 200}}));
        let t = svc.thumbnail_for("photos/a.jpg", &s, None).unwrap();

        let hex = t.fingerprint.hex();
        assert_eq!(t.reference, format!("/easyimage/{}/{}.jpg", &hex[..1], hex));
        assert_eq!(
            svc.thumbnail_reference_for("photos/a.jpg", &s, None).unwrap(),
            t.reference
        );
    }

    #[test]
    fn type_operation_sets_extension_and_format() {
        let svc = service(default_backend());
        let s = spec(json!({"resize": {"width": 50}, "type": "png"}));
        let t = svc.thumbnail_for("photos/a.jpg", &s, None).unwrap();
        assert!(t.reference.ends_with(".png"));

        let (key, _) = svc.key_for("photos/a.jpg", &s, None).unwrap();
        let bytes = svc.store().get(&key).unwrap().unwrap();
        assert!(String::from_utf8(bytes).unwrap().starts_with("Png q100 50x38"));
    }

    #[test]
    fn stale_entry_is_regenerated() {
        let svc = service(default_backend()).with_ttl(Duration::from_secs(60));
        let s = spec(json!({"rotate": 90}));
        let t = svc.thumbnail_for("photos/a.jpg", &s, None).unwrap();

        let (key, _) = svc.key_for("photos/a.jpg", &s, None).unwrap();
        svc.store()
            .set_modified(&key, SystemTime::now() - Duration::from_secs(61));

        let again = svc.thumbnail_for("photos/a.jpg", &s, None).unwrap();
        assert_eq!(again.status, CacheStatus::Generated);
        assert_eq!(again.reference, t.reference);
        assert_eq!(svc.backend().decode_count(), 2);
    }

    #[test]
    fn token_changes_the_entry() {
        let svc = service(default_backend());
        let s = spec(json!({"rotate": 90}));
        let a = svc.thumbnail_for("photos/a.jpg", &s, None).unwrap();
        let b = svc.thumbnail_for("photos/a.jpg", &s, Some("v2")).unwrap();
        assert_ne!(a.reference, b.reference);
        assert_eq!(b.status, CacheStatus::Generated);
    }

    #[test]
    fn missing_source_is_not_found_and_writes_nothing() {
        let svc = service(default_backend());
        let err = svc
            .thumbnail_for("photos/missing.jpg", &TransformSpec::new(), None)
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(p) if p == "photos/missing.jpg"));
        assert!(svc.store().is_empty());
        assert_eq!(svc.backend().decode_count(), 0);
    }

    #[test]
    fn unknown_format_is_rejected_before_decoding() {
        let svc = service(default_backend());
        assert!(matches!(
            svc.thumbnail_for("photos/a.bmp", &TransformSpec::new(), None),
            Err(ServiceError::UnknownFormat(ext)) if ext == "bmp"
        ));
        assert!(matches!(
            svc.thumbnail_for("photos/noext", &TransformSpec::new(), None),
            Err(ServiceError::UnknownFormat(_))
        ));
        assert_eq!(svc.backend().decode_count(), 0);
    }

    #[test]
    fn invalid_json_spec_is_a_validation_error() {
        let svc = service(default_backend());
        let err = svc
            .thumbnail_from_json("photos/a.jpg", &json!([{"crop": {"height": 10}}]), None)
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Validation(ValidationError::MissingParam { .. })
        ));
        assert!(svc.store().is_empty());
    }

    #[test]
    fn pipeline_failure_writes_nothing() {
        let svc = service(default_backend());
        let err = svc
            .thumbnail_from_json("photos/a.jpg", &json!({"watermark": "gone.png"}), None)
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(p) if p == "gone.png"));
        assert!(svc.store().is_empty());

        let err = svc
            .thumbnail_from_json("photos/a.jpg", &json!({"watermark": null}), None)
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Capability(BackendError::MissingWatermark)
        ));
        assert!(svc.store().is_empty());
    }

    #[test]
    fn encode_failure_is_a_capability_error() {
        let backend = MockBackend {
            fail_encode: true,
            ..default_backend()
        };
        let svc = service(backend);
        assert!(matches!(
            svc.thumbnail_for("photos/a.jpg", &TransformSpec::new(), None),
            Err(ServiceError::Capability(_))
        ));
        assert!(svc.store().is_empty());
    }

    #[test]
    fn cancelled_request_writes_nothing() {
        let svc = service(default_backend());
        let cancel = CancelToken::new();
        cancel.cancel();
        let s = TransformSpec::new();
        let request = ThumbnailRequest {
            source: "photos/a.jpg",
            spec: &s,
            token: None,
        };
        assert!(matches!(
            svc.thumbnail_for_with(request, &cancel),
            Err(ServiceError::Cancelled)
        ));
        assert!(svc.store().is_empty());
    }

    // =========================================================================
    // Retina
    // =========================================================================

    #[test]
    fn retina_written_only_when_source_is_large_enough() {
        let svc = service(default_backend()).with_retina(true);
        let s = spec(json!({"scaleAndCrop": {"width": 100, "height": 100}}));

        let big = svc.thumbnail_for("photos/a.jpg", &s, None).unwrap();
        let RetinaOutcome::Written(reference) = &big.retina else {
            panic!("expected @2x, got {:?}", big.retina);
        };
        assert!(reference.ends_with("@2x.jpg"));
        assert_eq!(svc.store().len(), 2);

        let small = svc.thumbnail_for("photos/small.jpg", &s, None).unwrap();
        assert_eq!(small.retina, RetinaOutcome::Skipped);
        assert_eq!(svc.store().len(), 3);

        // One decode per miss; the @2x pass reuses the decoded source
        assert_eq!(svc.backend().decode_count(), 2);
    }

    #[test]
    fn retina_not_attempted_on_hit_or_when_disabled() {
        let s = spec(json!({"scaleAndCrop": {"width": 100, "height": 100}}));

        let svc = service(default_backend()).with_retina(true);
        svc.thumbnail_for("photos/a.jpg", &s, None).unwrap();
        let hit = svc.thumbnail_for("photos/a.jpg", &s, None).unwrap();
        assert_eq!(hit.retina, RetinaOutcome::Skipped);

        let svc = service(default_backend());
        let t = svc.thumbnail_for("photos/a.jpg", &s, None).unwrap();
        assert_eq!(t.retina, RetinaOutcome::Skipped);
        assert_eq!(svc.store().len(), 1);
    }

    // =========================================================================
    // Concurrency
    // =========================================================================

    #[test]
    fn concurrent_identical_requests_decode_once() {
        let svc = service(default_backend());
        let s = spec(json!({"scaleAndCrop": {"width": 64, "height": 64}}));

        let results: Vec<Thumbnail> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| svc.thumbnail_for("photos/a.jpg", &s, None).unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(svc.backend().decode_count(), 1);
        assert_eq!(
            results
                .iter()
                .filter(|t| t.status == CacheStatus::Generated)
                .count(),
            1
        );
        assert!(results.iter().all(|t| t.reference == results[0].reference));
    }

    #[test]
    fn waiters_retry_when_leader_fails() {
        let svc = service(default_backend());
        let s = TransformSpec::new();
        let (key, _) = svc.key_for("photos/a.jpg", &s, None).unwrap();

        // Stand in for a leader that is still running
        let flight = Arc::new(Flight::default());
        lock(&svc.in_flight).insert(key.clone(), flight.clone());

        std::thread::scope(|scope| {
            let waiter = scope.spawn(|| svc.thumbnail_for("photos/a.jpg", &s, None));
            std::thread::sleep(Duration::from_millis(100));
            lock(&svc.in_flight).remove(&key);
            flight.finish(None);

            let t = waiter.join().unwrap().unwrap();
            assert_eq!(t.status, CacheStatus::Generated);
        });
    }

    #[test]
    fn waiter_honors_cancellation() {
        let svc = service(default_backend());
        let s = TransformSpec::new();
        let (key, _) = svc.key_for("photos/a.jpg", &s, None).unwrap();
        lock(&svc.in_flight).insert(key, Arc::new(Flight::default()));

        let cancel = CancelToken::with_timeout(Duration::from_millis(100));
        let request = ThumbnailRequest {
            source: "photos/a.jpg",
            spec: &s,
            token: None,
        };
        assert!(matches!(
            svc.thumbnail_for_with(request, &cancel),
            Err(ServiceError::Cancelled)
        ));
    }

    #[test]
    fn record_tallies_status_and_retina() {
        let svc = service(default_backend());
        let s = TransformSpec::new();
        let mut stats = CacheStats::default();
        svc.thumbnail_for("photos/a.jpg", &s, None)
            .unwrap()
            .record(&mut stats);
        svc.thumbnail_for("photos/a.jpg", &s, None)
            .unwrap()
            .record(&mut stats);
        assert_eq!(stats.generated, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.retina, 0);
    }
}
