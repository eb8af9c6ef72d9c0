//! Page rasterization with per-page cancellation.
//!
//! At most one task per page index is in flight: starting a new request for a
//! page cancels the previous one before it is registered. A cancelled task
//! never reports a bitmap, even if the backend finished the work.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, instrument};

use crate::surface::Snapshot;
use crate::{DocumentBackend, RenderImage, RenderRequest};

#[derive(Debug, Error)]
pub enum RasterError {
    #[error("page {page} could not be rendered: {source}")]
    Backend {
        page: usize,
        #[source]
        source: anyhow::Error,
    },
    #[error("render worker for page {page} stopped unexpectedly: {source}")]
    Worker {
        page: usize,
        #[source]
        source: tokio::task::JoinError,
    },
    #[error("page {page} produced a malformed bitmap")]
    InvalidBitmap { page: usize },
}

/// Cooperative cancellation flag shared between the scheduler and a task.
#[derive(Clone, Debug)]
pub struct CancelToken {
    state: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (state, _) = watch::channel(false);
        Self {
            state: Arc::new(state),
        }
    }

    /// Idempotent; every clone observes the cancellation.
    pub fn cancel(&self) {
        self.state.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.state.borrow()
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        let mut receiver = self.state.subscribe();
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub enum RasterOutcome {
    Rendered(RenderImage),
    Cancelled,
    Failed(RasterError),
}

struct InFlight {
    ticket: u64,
    token: CancelToken,
}

pub struct Rasterizer {
    backend: Arc<dyn DocumentBackend>,
    in_flight: Mutex<HashMap<usize, InFlight>>,
    next_ticket: AtomicU64,
}

impl Rasterizer {
    pub fn new(backend: Arc<dyn DocumentBackend>) -> Arc<Self> {
        Arc::new(Self {
            backend,
            in_flight: Mutex::new(HashMap::new()),
            next_ticket: AtomicU64::new(1),
        })
    }

    pub fn backend(&self) -> &Arc<dyn DocumentBackend> {
        &self.backend
    }

    /// Spawns a render of `page_index` at `scale` on the tokio runtime,
    /// cancelling whatever was in flight for the same page.
    #[instrument(skip(self))]
    pub fn start(self: &Arc<Self>, page_index: usize, scale: f32) -> RenderTask {
        let token = CancelToken::new();
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);

        let previous = self.in_flight.lock().insert(
            page_index,
            InFlight {
                ticket,
                token: token.clone(),
            },
        );
        if let Some(previous) = previous {
            debug!(
                page = page_index + 1,
                superseded = previous.ticket,
                "cancelling in-flight render"
            );
            previous.token.cancel();
        }

        let backend = Arc::clone(&self.backend);
        let worker_token = token.clone();
        let handle = tokio::spawn(async move {
            let blocking_token = worker_token.clone();
            let job = tokio::task::spawn_blocking(move || {
                if blocking_token.is_cancelled() {
                    return None;
                }
                Some(backend.render_page(RenderRequest { page_index, scale }))
            });

            tokio::select! {
                biased;
                _ = worker_token.cancelled() => RasterOutcome::Cancelled,
                joined = job => match joined {
                    _ if worker_token.is_cancelled() => RasterOutcome::Cancelled,
                    Ok(None) => RasterOutcome::Cancelled,
                    Ok(Some(Ok(image))) => RasterOutcome::Rendered(image),
                    Ok(Some(Err(source))) => RasterOutcome::Failed(RasterError::Backend {
                        page: page_index + 1,
                        source,
                    }),
                    Err(source) => RasterOutcome::Failed(RasterError::Worker {
                        page: page_index + 1,
                        source,
                    }),
                },
            }
        });

        RenderTask {
            rasterizer: Arc::clone(self),
            page_index,
            scale,
            ticket,
            token,
            handle,
        }
    }

    /// Cancels every in-flight render. Used when a scale change makes all of
    /// them stale.
    pub fn cancel_all(&self) {
        let mut in_flight = self.in_flight.lock();
        if !in_flight.is_empty() {
            debug!(count = in_flight.len(), "cancelling all in-flight renders");
        }
        for (_, entry) in in_flight.drain() {
            entry.token.cancel();
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    fn release(&self, page_index: usize, ticket: u64) {
        let mut in_flight = self.in_flight.lock();
        if in_flight
            .get(&page_index)
            .is_some_and(|entry| entry.ticket == ticket)
        {
            in_flight.remove(&page_index);
        }
    }
}

/// Handle to one render request.
pub struct RenderTask {
    rasterizer: Arc<Rasterizer>,
    page_index: usize,
    scale: f32,
    ticket: u64,
    token: CancelToken,
    handle: JoinHandle<RasterOutcome>,
}

impl RenderTask {
    pub fn page_index(&self) -> usize {
        self.page_index
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn finish(self) -> RasterOutcome {
        let outcome = match self.handle.await {
            Ok(outcome) => outcome,
            Err(source) => RasterOutcome::Failed(RasterError::Worker {
                page: self.page_index + 1,
                source,
            }),
        };
        self.rasterizer.release(self.page_index, self.ticket);

        match outcome {
            // cancellation always wins a race with completion
            RasterOutcome::Rendered(_) if self.token.is_cancelled() => RasterOutcome::Cancelled,
            RasterOutcome::Cancelled => {
                debug!(page = self.page_index + 1, scale = self.scale, "render cancelled");
                RasterOutcome::Cancelled
            }
            other => other,
        }
    }
}

const DEFAULT_CACHE_CAPACITY: usize = 10;

/// Bounded cache of clean page rasters. When full, the pages farthest from
/// the reference page are evicted first.
pub struct RasterCache {
    entries: HashMap<CacheKey, Snapshot>,
    capacity: usize,
}

impl RasterCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn get(&self, page_index: usize, scale: f32) -> Option<&Snapshot> {
        self.entries.get(&CacheKey::new(page_index, scale))
    }

    pub fn insert(&mut self, page_index: usize, scale: f32, raster: Snapshot, reference_page: usize) {
        self.entries.insert(CacheKey::new(page_index, scale), raster);

        if self.entries.len() > self.capacity {
            let mut keys: Vec<_> = self.entries.keys().copied().collect();
            keys.sort_by_key(|k| k.distance(reference_page));
            for stale in keys.into_iter().skip(self.capacity) {
                self.entries.remove(&stale);
            }
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for RasterCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
struct CacheKey {
    page_index: usize,
    scale_milli: u32,
}

impl CacheKey {
    fn new(page_index: usize, scale: f32) -> Self {
        Self {
            page_index,
            scale_milli: quantize_scale(scale),
        }
    }

    fn distance(&self, reference_page: usize) -> usize {
        self.page_index.abs_diff(reference_page)
    }
}

pub(crate) fn quantize_scale(scale: f32) -> u32 {
    let scaled = (scale * 1000.0).round();
    if !scaled.is_finite() || scaled <= 0.0 {
        1
    } else if scaled > u32::MAX as f32 {
        u32::MAX
    } else {
        scaled as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use anyhow::{anyhow, Result};
    use image::{Rgba, RgbaImage};

    use crate::{DocumentInfo, DocumentMetadata, PageSize};

    struct SlowBackend {
        info: DocumentInfo,
        delay: Duration,
    }

    impl SlowBackend {
        fn new(delay_ms: u64) -> Arc<Self> {
            Arc::new(Self {
                info: DocumentInfo {
                    id: uuid::Uuid::nil(),
                    label: "slow".into(),
                    page_count: 3,
                    metadata: DocumentMetadata::default(),
                },
                delay: Duration::from_millis(delay_ms),
            })
        }
    }

    impl DocumentBackend for SlowBackend {
        fn info(&self) -> &DocumentInfo {
            &self.info
        }

        fn page_size(&self, _page_index: usize) -> Result<PageSize> {
            Ok(PageSize {
                width: 10.0,
                height: 20.0,
            })
        }

        fn render_page(&self, request: RenderRequest) -> Result<RenderImage> {
            std::thread::sleep(self.delay);
            if request.page_index == 2 {
                return Err(anyhow!("corrupt page"));
            }
            let (width, height) = self.page_size(request.page_index)?.scaled(request.scale);
            Ok(RenderImage {
                width,
                height,
                pixels: vec![255; (width * height * 4) as usize],
            })
        }
    }

    #[tokio::test]
    async fn newer_request_cancels_older_for_same_page() {
        let rasterizer = Rasterizer::new(SlowBackend::new(20));
        let first = rasterizer.start(0, 1.0);
        let second = rasterizer.start(0, 1.2);
        let third = rasterizer.start(0, 1.5);

        assert!(matches!(first.finish().await, RasterOutcome::Cancelled));
        assert!(matches!(second.finish().await, RasterOutcome::Cancelled));
        match third.finish().await {
            RasterOutcome::Rendered(image) => assert_eq!((image.width, image.height), (15, 30)),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(rasterizer.in_flight(), 0);
    }

    #[tokio::test]
    async fn different_pages_render_independently() {
        let rasterizer = Rasterizer::new(SlowBackend::new(1));
        let a = rasterizer.start(0, 1.0);
        let b = rasterizer.start(1, 1.0);
        assert!(matches!(a.finish().await, RasterOutcome::Rendered(_)));
        assert!(matches!(b.finish().await, RasterOutcome::Rendered(_)));
    }

    #[tokio::test]
    async fn cancel_all_stops_every_page() {
        let rasterizer = Rasterizer::new(SlowBackend::new(20));
        let a = rasterizer.start(0, 1.0);
        let b = rasterizer.start(1, 1.0);
        rasterizer.cancel_all();
        assert!(matches!(a.finish().await, RasterOutcome::Cancelled));
        assert!(matches!(b.finish().await, RasterOutcome::Cancelled));
    }

    #[tokio::test]
    async fn backend_failures_are_reported_with_page_number() {
        let rasterizer = Rasterizer::new(SlowBackend::new(0));
        match rasterizer.start(2, 1.0).finish().await {
            RasterOutcome::Failed(RasterError::Backend { page, .. }) => assert_eq!(page, 3),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn cancel_token_resolves_after_cancel() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let wait = tokio::spawn(async move { waiter.cancelled().await });
        token.cancel();
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), wait)
            .await
            .unwrap()
            .unwrap();
        assert!(token.is_cancelled());
    }

    fn raster(value: u8) -> Snapshot {
        Snapshot::new(RgbaImage::from_pixel(1, 1, Rgba([value, 0, 0, 255])))
    }

    #[test]
    fn cache_evicts_pages_far_from_reference() {
        let mut cache = RasterCache::new(2);
        cache.insert(0, 1.0, raster(0), 5);
        cache.insert(9, 1.0, raster(9), 5);
        cache.insert(5, 1.0, raster(5), 5);

        assert_eq!(cache.len(), 2);
        assert!(cache.get(5, 1.0).is_some());
        assert!(cache.get(9, 1.0).is_some());
        assert!(cache.get(0, 1.0).is_none());
    }

    #[test]
    fn cache_keys_include_scale() {
        let mut cache = RasterCache::default();
        cache.insert(0, 1.0, raster(1), 0);
        assert!(cache.get(0, 1.0004).is_some());
        assert!(cache.get(0, 1.5).is_none());
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn quantize_scale_handles_degenerate_values() {
        assert_eq!(quantize_scale(1.25), 1250);
        assert_eq!(quantize_scale(0.0), 1);
        assert_eq!(quantize_scale(f32::NAN), 1);
    }
}
