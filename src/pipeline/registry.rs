//! Pipeline construction and codec registry.
//!
//! [`ImagePipeline`] owns everything the codecs share: the provider, the
//! uploader, the admission controller, and the stage contexts. Codecs are
//! handed an [`Arc`] of that shared core at creation, so nothing in the
//! pipeline lives in global state and independent pipelines can coexist in
//! one process.
//!
//! The pipeline also calibrates the decode budget from the provider. The
//! probe is lazy: it runs on the first request entry point, and again only
//! for providers that report their capacity may change at runtime.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::{BudgetSettings, PipelineConfig};
use crate::pipeline::codec::ImageCodec;
use crate::pipeline::dispatch::StageDispatcher;
use crate::pipeline::limiter::DecodeLimiter;
use crate::provider::ImageProvider;
use crate::request::{RequestDescriptor, RequestId};
use crate::uploader::TextureUploader;

/// Machinery shared by every codec of one pipeline.
pub(crate) struct PipelineShared<P, U> {
    pub(crate) provider: Arc<P>,
    pub(crate) uploader: Arc<U>,
    pub(crate) limiter: Arc<DecodeLimiter>,
    pub(crate) dispatcher: StageDispatcher,
    next_request_id: AtomicU64,
    calibrated: AtomicBool,
}

impl<P, U> PipelineShared<P, U> {
    /// Mints the next request identifier. Ids are unique for the lifetime
    /// of the pipeline and increase monotonically from zero.
    pub(crate) fn mint_request_id(&self) -> RequestId {
        RequestId::from_raw(self.next_request_id.fetch_add(1, Ordering::Relaxed))
    }
}

/// Entry point for image decoding.
///
/// Construct one per provider/uploader pair, then create a codec per image
/// request. The pipeline is cheap to clone; clones share the same budget,
/// contexts, and request-id sequence.
///
/// ```ignore
/// use texelpipe::{ImagePipeline, PipelineConfig, RequestDescriptor};
///
/// let pipeline = ImagePipeline::new(provider, uploader, PipelineConfig::default());
/// let codec = pipeline.create_codec(RequestDescriptor::new("https://cdn.example.com/a.png"));
/// let frame = codec.request_next_frame().await;
/// ```
pub struct ImagePipeline<P: ImageProvider, U: TextureUploader> {
    shared: Arc<PipelineShared<P, U>>,
}

impl<P: ImageProvider, U: TextureUploader> ImagePipeline<P, U> {
    /// Creates a pipeline with its stage contexts running on the current
    /// tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn new(provider: P, uploader: U, config: PipelineConfig) -> Self {
        let dispatcher = StageDispatcher::start();
        let limiter = DecodeLimiter::new(config.budget, dispatcher.worker_spawner());

        info!(
            provider = provider.name(),
            max_concurrency = limiter.max_concurrency(),
            max_memory_bytes = limiter.max_memory_bytes(),
            "image pipeline started"
        );

        Self {
            shared: Arc::new(PipelineShared {
                provider: Arc::new(provider),
                uploader: Arc::new(uploader),
                limiter,
                dispatcher,
                next_request_id: AtomicU64::new(0),
                calibrated: AtomicBool::new(false),
            }),
        }
    }

    /// Creates a codec for one image request.
    ///
    /// The decode budget is (re)calibrated from the provider on the way in
    /// when the provider supports probing.
    pub fn create_codec(&self, descriptor: RequestDescriptor) -> Arc<ImageCodec<P, U>> {
        self.calibrate_if_needed();
        debug!(url = %descriptor.url, "codec created");
        ImageCodec::new(Arc::clone(&self.shared), descriptor)
    }

    /// Mints a request identifier outside of codec creation.
    ///
    /// Codecs mint their own ids per fetch; this is for embedders that need
    /// an id up front, for example to correlate provider-side logs.
    pub fn next_request_id(&self) -> RequestId {
        self.shared.mint_request_id()
    }

    /// Replaces the decode budget. Values below the floors are ignored
    /// per field.
    pub fn set_budget(&self, max_concurrency: u32, max_memory_bytes: u64) {
        self.shared.limiter.set_budget(max_concurrency, max_memory_bytes);
    }

    /// Currently effective decode budget.
    pub fn budget(&self) -> BudgetSettings {
        BudgetSettings {
            max_concurrency: self.shared.limiter.max_concurrency(),
            max_memory_bytes: self.shared.limiter.max_memory_bytes(),
        }
    }

    /// Number of decodes currently charged against the budget.
    pub fn decodes_running(&self) -> u32 {
        self.shared.limiter.running()
    }

    /// Estimated bytes of decode work currently in flight.
    pub fn decode_memory_in_use(&self) -> u64 {
        self.shared.limiter.used_memory()
    }

    /// Decode requests parked behind the budget.
    pub fn decodes_pending(&self) -> usize {
        self.shared.limiter.pending_len()
    }

    /// Stops the stage contexts. Stage tasks not yet drained are dropped,
    /// as is anything posted afterwards.
    pub fn shutdown(&self) {
        self.shared.dispatcher.shutdown();
    }

    fn calibrate_if_needed(&self) {
        let shared = &self.shared;
        if shared.calibrated.load(Ordering::Acquire) && !shared.provider.capacity_may_change() {
            return;
        }
        if let Some(capacity) = shared.provider.probe_capacity() {
            debug!(
                core_count = capacity.core_count,
                memory_budget_bytes = capacity.memory_budget_bytes,
                "provider capacity probed"
            );
            shared
                .limiter
                .set_budget(capacity.core_count, capacity.memory_budget_bytes);
        }
        shared.calibrated.store(true, Ordering::Release);
    }
}

impl<P: ImageProvider, U: TextureUploader> Clone for ImagePipeline<P, U> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<P: ImageProvider, U: TextureUploader> std::fmt::Debug for ImagePipeline<P, U> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImagePipeline")
            .field("provider", &self.shared.provider.name())
            .field("budget", &self.budget())
            .finish_non_exhaustive()
    }
}
