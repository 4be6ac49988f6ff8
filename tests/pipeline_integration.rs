//! Integration tests for the image decode pipeline.
//!
//! These tests verify the complete request workflow including:
//! - Budget enforcement across concurrent decodes
//! - Forward progress for images larger than the whole budget
//! - Queueing and resumption when the memory budget is exhausted
//! - Waiter coalescing onto a single fetch
//! - Animation frame cycling and per-frame delivery
//! - Cancellation at every stage, with exactly-once resource release
//! - Failure sentinels for fetch, decode, and upload errors
//! - Budget reconfiguration floors

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;

use texelpipe::{
    AlphaMode, Bitmap, ColorLayout, FetchError, FrameResult, ImageMetadata, ImagePipeline,
    ImageProvider, PipelineConfig, PlatformImage, RequestDescriptor, RequestId, TextureUploader,
    UploadError,
};

const MIB: u64 = 1024 * 1024;

// =============================================================================
// Test Helpers
// =============================================================================

/// Counters shared between a [`MockProvider`] and the test body.
#[derive(Default)]
struct ProviderStats {
    fetches: AtomicUsize,
    cancels: AtomicUsize,
    releases: AtomicUsize,
    decodes: AtomicUsize,
    decoding_now: AtomicUsize,
    decoding_peak: AtomicUsize,
    decoded_frames: Mutex<Vec<u32>>,
}

/// Configurable provider: controllable fetch and decode gates, optional
/// failures, and full accounting of calls and handle releases.
struct MockProvider {
    metadata: ImageMetadata,
    fail_fetch: bool,
    fail_decode: bool,
    decode_delay: Duration,
    /// When set, fetch parks until the test adds a permit.
    fetch_gate: Option<Arc<Semaphore>>,
    /// When set, decode spins until the test flips it to true.
    decode_gate: Option<Arc<AtomicBool>>,
    stats: Arc<ProviderStats>,
}

impl MockProvider {
    fn still(width: u32, height: u32) -> Self {
        Self {
            metadata: ImageMetadata::still(width, height),
            fail_fetch: false,
            fail_decode: false,
            decode_delay: Duration::ZERO,
            fetch_gate: None,
            decode_gate: None,
            stats: Arc::new(ProviderStats::default()),
        }
    }

    fn animated(width: u32, height: u32, frame_count: u32, duration_ms: u32) -> Self {
        let mut provider = Self::still(width, height);
        provider.metadata = ImageMetadata::animated(width, height, frame_count, 3, duration_ms);
        provider
    }

    fn stats(&self) -> Arc<ProviderStats> {
        Arc::clone(&self.stats)
    }
}

impl ImageProvider for MockProvider {
    fn fetch(
        &self,
        _request_id: RequestId,
        _descriptor: &RequestDescriptor,
    ) -> impl Future<Output = Result<PlatformImage, FetchError>> + Send {
        self.stats.fetches.fetch_add(1, Ordering::SeqCst);
        let gate = self.fetch_gate.clone();
        let fail = self.fail_fetch;
        let metadata = self.metadata;
        let stats = Arc::clone(&self.stats);
        async move {
            if let Some(gate) = gate {
                let permit = gate.acquire().await.expect("fetch gate closed");
                permit.forget();
            }
            if fail {
                return Err(FetchError::InvalidHandle);
            }
            Ok(PlatformImage::new((), metadata, move || {
                stats.releases.fetch_add(1, Ordering::SeqCst);
            }))
        }
    }

    fn cancel_fetch(&self, _request_id: RequestId) {
        self.stats.cancels.fetch_add(1, Ordering::SeqCst);
    }

    fn decode(&self, image: &PlatformImage, frame_index: u32) -> Option<Bitmap> {
        self.stats.decodes.fetch_add(1, Ordering::SeqCst);
        self.stats
            .decoded_frames
            .lock()
            .unwrap()
            .push(frame_index);

        let now = self.stats.decoding_now.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.decoding_peak.fetch_max(now, Ordering::SeqCst);

        if let Some(gate) = &self.decode_gate {
            let deadline = Instant::now() + Duration::from_secs(5);
            while !gate.load(Ordering::SeqCst) && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(2));
            }
        }
        if !self.decode_delay.is_zero() {
            std::thread::sleep(self.decode_delay);
        }

        self.stats.decoding_now.fetch_sub(1, Ordering::SeqCst);

        if self.fail_decode {
            return None;
        }
        let meta = image.metadata();
        Some(Bitmap::new(
            vec![0u8; (meta.width * meta.height * 4) as usize],
            meta.width,
            meta.height,
            meta.width * 4,
            ColorLayout::Rgba8888,
            AlphaMode::Premultiplied,
            || {},
        ))
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// Uploader that numbers textures in upload order.
struct MockUploader {
    fail: bool,
    uploads: Arc<AtomicUsize>,
}

impl MockUploader {
    fn new() -> Self {
        Self {
            fail: false,
            uploads: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl TextureUploader for MockUploader {
    type Texture = u64;

    fn upload(&self, _bitmap: &Bitmap) -> Result<u64, UploadError> {
        let ordinal = self.uploads.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(UploadError::NoContext);
        }
        Ok(ordinal as u64)
    }
}

fn descriptor(url: &str) -> RequestDescriptor {
    RequestDescriptor::new(url)
}

/// Awaits one frame delivery with a hang guard.
async fn await_frame(
    receiver: tokio::sync::oneshot::Receiver<FrameResult<u64>>,
) -> FrameResult<u64> {
    tokio::time::timeout(Duration::from_secs(5), receiver)
        .await
        .expect("frame delivery timed out")
        .expect("codec dropped the waiter")
}

/// Polls until the condition holds or panics after the deadline.
async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        if Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

// =============================================================================
// Budget Enforcement
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_budget_bounds_concurrent_decodes_under_load() {
    // 1000x500 RGBA is 2 MB per decode: well inside the default budget, so
    // the only limits in play are the configured ceilings.
    let mut provider = MockProvider::still(1000, 500);
    provider.decode_delay = Duration::from_millis(15);
    let stats = provider.stats();
    let pipeline = ImagePipeline::new(provider, MockUploader::new(), PipelineConfig::default());

    let max_memory = pipeline.budget().max_memory_bytes;
    let max_concurrency = pipeline.budget().max_concurrency;

    let violations = Arc::new(AtomicUsize::new(0));
    let stop = Arc::new(AtomicBool::new(false));
    let sampler = {
        let pipeline = pipeline.clone();
        let violations = Arc::clone(&violations);
        let stop = Arc::clone(&stop);
        tokio::spawn(async move {
            while !stop.load(Ordering::SeqCst) {
                if pipeline.decode_memory_in_use() > max_memory
                    || pipeline.decodes_running() > max_concurrency
                {
                    violations.fetch_add(1, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
    };

    let receivers: Vec<_> = (0..12)
        .map(|i| {
            let codec = pipeline.create_codec(descriptor(&format!("https://cdn.example.com/{i}.png")));
            codec.request_next_frame()
        })
        .collect();

    for result in futures::future::join_all(receivers).await {
        let frame = result.expect("codec dropped a waiter");
        assert!(frame.is_some(), "every request should produce a frame");
    }

    stop.store(true, Ordering::SeqCst);
    let _ = sampler.await;

    assert_eq!(violations.load(Ordering::SeqCst), 0, "budget was exceeded");
    assert!(stats.decoding_peak.load(Ordering::SeqCst) <= max_concurrency as usize);
    assert_eq!(stats.decodes.load(Ordering::SeqCst), 12);

    wait_for("budget accounting to drain", || {
        pipeline.decodes_running() == 0 && pipeline.decode_memory_in_use() == 0
    })
    .await;

    pipeline.shutdown();
}

#[tokio::test]
async fn test_oversized_image_still_makes_progress() {
    // 3000x3000 RGBA is 36 MB, nearly twice the 20 MiB budget. An idle
    // controller admits it anyway rather than stranding the request.
    let provider = MockProvider::still(3000, 3000);
    let stats = provider.stats();
    let pipeline = ImagePipeline::new(provider, MockUploader::new(), PipelineConfig::default());

    let codec = pipeline.create_codec(descriptor("https://cdn.example.com/huge.png"));
    let frame = await_frame(codec.request_next_frame()).await;

    assert!(frame.is_some());
    assert_eq!(stats.releases.load(Ordering::SeqCst), 1);

    wait_for("budget accounting to drain", || {
        pipeline.decodes_running() == 0 && pipeline.decode_memory_in_use() == 0
    })
    .await;

    pipeline.shutdown();
}

#[tokio::test]
async fn test_oversized_images_run_one_at_a_time() {
    let mut provider = MockProvider::still(3000, 3000);
    provider.decode_delay = Duration::from_millis(20);
    let stats = provider.stats();
    let pipeline = ImagePipeline::new(provider, MockUploader::new(), PipelineConfig::default());

    let first = pipeline.create_codec(descriptor("https://cdn.example.com/huge-1.png"));
    let second = pipeline.create_codec(descriptor("https://cdn.example.com/huge-2.png"));

    let first_rx = first.request_next_frame();
    let second_rx = second.request_next_frame();

    assert!(await_frame(first_rx).await.is_some());
    assert!(await_frame(second_rx).await.is_some());

    // Each one alone blows the memory budget, so they must never overlap.
    assert_eq!(stats.decoding_peak.load(Ordering::SeqCst), 1);
    assert_eq!(stats.decodes.load(Ordering::SeqCst), 2);

    pipeline.shutdown();
}

#[tokio::test]
async fn test_memory_budget_queues_third_decode() {
    // Three 2048x1024 images are 8 MiB each against the 20 MiB default:
    // two fit, the third waits for a completion.
    let gate = Arc::new(AtomicBool::new(false));
    let mut provider = MockProvider::still(2048, 1024);
    provider.decode_gate = Some(Arc::clone(&gate));
    let stats = provider.stats();
    let pipeline = ImagePipeline::new(provider, MockUploader::new(), PipelineConfig::default());

    let receivers: Vec<_> = (0..3)
        .map(|i| {
            let codec = pipeline.create_codec(descriptor(&format!("https://cdn.example.com/{i}.png")));
            codec.request_next_frame()
        })
        .collect();

    {
        let stats = Arc::clone(&stats);
        wait_for("two decodes running and one parked", || {
            stats.decoding_now.load(Ordering::SeqCst) == 2 && pipeline.decodes_pending() == 1
        })
        .await;
    }
    assert_eq!(pipeline.decode_memory_in_use(), 16 * MIB);

    gate.store(true, Ordering::SeqCst);

    for result in futures::future::join_all(receivers).await {
        assert!(result.expect("waiter dropped").is_some());
    }

    assert_eq!(stats.decodes.load(Ordering::SeqCst), 3);
    assert_eq!(stats.decoding_peak.load(Ordering::SeqCst), 2);

    pipeline.shutdown();
}

// =============================================================================
// Waiter Coalescing and Delivery
// =============================================================================

#[tokio::test]
async fn test_waiters_coalesce_onto_one_fetch() {
    let fetch_gate = Arc::new(Semaphore::new(0));
    let mut provider = MockProvider::still(64, 64);
    provider.fetch_gate = Some(Arc::clone(&fetch_gate));
    let stats = provider.stats();
    let uploader = MockUploader::new();
    let uploads = Arc::clone(&uploader.uploads);
    let pipeline = ImagePipeline::new(provider, uploader, PipelineConfig::default());

    let codec = pipeline.create_codec(descriptor("https://cdn.example.com/shared.png"));

    let first = codec.request_next_frame();
    let second = codec.request_next_frame();
    let third = codec.request_next_frame();

    fetch_gate.add_permits(1);

    let first = await_frame(first).await.expect("first waiter got sentinel");
    let second = await_frame(second).await.expect("second waiter got sentinel");
    let third = await_frame(third).await.expect("third waiter got sentinel");

    // One fetch, one decode, one upload; every waiter sees the same frame.
    assert_eq!(stats.fetches.load(Ordering::SeqCst), 1);
    assert_eq!(stats.decodes.load(Ordering::SeqCst), 1);
    assert_eq!(uploads.load(Ordering::SeqCst), 1);
    assert_eq!(first.texture, second.texture);
    assert_eq!(second.texture, third.texture);

    pipeline.shutdown();
}

#[tokio::test]
async fn test_still_image_served_from_cache_after_first_decode() {
    let provider = MockProvider::still(64, 64);
    let stats = provider.stats();
    let pipeline = ImagePipeline::new(provider, MockUploader::new(), PipelineConfig::default());

    let codec = pipeline.create_codec(descriptor("https://cdn.example.com/a.png"));

    let first = await_frame(codec.request_next_frame()).await.expect("no frame");
    let second = await_frame(codec.request_next_frame()).await.expect("no frame");

    assert_eq!(first.texture, second.texture);
    assert_eq!(first.duration_ms, 0);
    assert_eq!(stats.fetches.load(Ordering::SeqCst), 1);
    assert_eq!(stats.decodes.load(Ordering::SeqCst), 1);

    pipeline.shutdown();
}

// =============================================================================
// Animation Cycling
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_animation_cycles_frames_in_order() {
    let provider = MockProvider::animated(100, 100, 4, 400);
    let stats = provider.stats();
    let pipeline = ImagePipeline::new(provider, MockUploader::new(), PipelineConfig::default());

    let codec = pipeline.create_codec(descriptor("https://cdn.example.com/a.gif"));

    let mut textures = Vec::new();
    for _ in 0..6 {
        let frame = await_frame(codec.request_next_frame())
            .await
            .expect("animation frame missing");
        // 400 ms spread over 4 frames.
        assert_eq!(frame.duration_ms, 100);
        textures.push(frame.texture);
    }

    assert_eq!(codec.frame_count(), 4);
    assert_eq!(codec.repetition_count(), 3);

    // The cursor wraps at the frame count.
    let decoded = stats.decoded_frames.lock().unwrap().clone();
    assert_eq!(decoded, vec![0, 1, 2, 3, 0, 1]);

    // Animations never serve from cache: six requests, six uploads.
    assert_eq!(stats.decodes.load(Ordering::SeqCst), 6);
    let unique: std::collections::BTreeSet<_> = textures.iter().collect();
    assert_eq!(unique.len(), 6);

    pipeline.shutdown();
}

// =============================================================================
// Cancellation
// =============================================================================

#[tokio::test]
async fn test_cancel_during_fetch_aborts_without_delivery() {
    let fetch_gate = Arc::new(Semaphore::new(0));
    let mut provider = MockProvider::still(64, 64);
    provider.fetch_gate = Some(Arc::clone(&fetch_gate));
    let stats = provider.stats();
    let pipeline = ImagePipeline::new(provider, MockUploader::new(), PipelineConfig::default());

    let codec = pipeline.create_codec(descriptor("https://cdn.example.com/slow.png"));
    let receiver = codec.request_next_frame();

    codec.cancel();
    codec.cancel();

    assert_eq!(stats.cancels.load(Ordering::SeqCst), 1);
    assert!(receiver.await.is_err(), "cancelled waiter must see a closed channel");

    // Let the fetch resolve late; the handle must still be released.
    fetch_gate.add_permits(1);
    {
        let stats = Arc::clone(&stats);
        wait_for("late fetch result to be released", || {
            stats.releases.load(Ordering::SeqCst) == 1
        })
        .await;
    }
    assert_eq!(stats.decodes.load(Ordering::SeqCst), 0);

    pipeline.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_during_decode_releases_handle_once() {
    let gate = Arc::new(AtomicBool::new(false));
    let mut provider = MockProvider::still(64, 64);
    provider.decode_gate = Some(Arc::clone(&gate));
    let stats = provider.stats();
    let uploader = MockUploader::new();
    let uploads = Arc::clone(&uploader.uploads);
    let pipeline = ImagePipeline::new(provider, uploader, PipelineConfig::default());

    let codec = pipeline.create_codec(descriptor("https://cdn.example.com/a.png"));
    let receiver = codec.request_next_frame();

    {
        let stats = Arc::clone(&stats);
        wait_for("decode to start", || stats.decodes.load(Ordering::SeqCst) == 1).await;
    }

    // cancel() waits for the resource lock the running decode holds, so the
    // gate opens from a helper task while this thread blocks in cancel.
    let release = {
        let gate = Arc::clone(&gate);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            gate.store(true, Ordering::SeqCst);
        })
    };
    codec.cancel();
    let _ = release.await;

    assert!(receiver.await.is_err(), "cancelled waiter must see a closed channel");
    assert_eq!(stats.releases.load(Ordering::SeqCst), 1);

    // The decoded bitmap is discarded at the upload checkpoint.
    wait_for("upload stage to observe the cancel", || {
        pipeline.decodes_running() == 0 && pipeline.decode_memory_in_use() == 0
    })
    .await;
    assert_eq!(uploads.load(Ordering::SeqCst), 0);

    codec.cancel();
    assert_eq!(stats.releases.load(Ordering::SeqCst), 1, "handle released twice");

    pipeline.shutdown();
}

// =============================================================================
// Failure Sentinels
// =============================================================================

#[tokio::test]
async fn test_fetch_failure_delivers_sentinel_then_retries() {
    let mut provider = MockProvider::still(64, 64);
    provider.fail_fetch = true;
    let stats = provider.stats();
    let pipeline = ImagePipeline::new(provider, MockUploader::new(), PipelineConfig::default());

    let codec = pipeline.create_codec(descriptor("https://cdn.example.com/missing.png"));

    let first = await_frame(codec.request_next_frame()).await;
    assert!(first.is_none(), "fetch failure must deliver the sentinel");

    // A still image with nothing cached retries with a fresh fetch.
    let second = await_frame(codec.request_next_frame()).await;
    assert!(second.is_none());
    assert_eq!(stats.fetches.load(Ordering::SeqCst), 2);

    pipeline.shutdown();
}

#[tokio::test]
async fn test_decode_failure_poisons_animation() {
    let mut provider = MockProvider::animated(100, 100, 4, 400);
    provider.fail_decode = true;
    let stats = provider.stats();
    let pipeline = ImagePipeline::new(provider, MockUploader::new(), PipelineConfig::default());

    let codec = pipeline.create_codec(descriptor("https://cdn.example.com/broken.gif"));

    let first = await_frame(codec.request_next_frame()).await;
    assert!(first.is_none());
    assert_eq!(stats.releases.load(Ordering::SeqCst), 1);

    // The handle is gone for good: later cycles answer immediately with the
    // sentinel and never reach the decoder again.
    let second = await_frame(codec.request_next_frame()).await;
    assert!(second.is_none());
    assert_eq!(stats.decodes.load(Ordering::SeqCst), 1);
    assert_eq!(stats.releases.load(Ordering::SeqCst), 1);

    pipeline.shutdown();
}

#[tokio::test]
async fn test_upload_failure_delivers_sentinel_and_returns_budget() {
    let provider = MockProvider::still(64, 64);
    let stats = provider.stats();
    let uploader = MockUploader {
        fail: true,
        uploads: Arc::new(AtomicUsize::new(0)),
    };
    let pipeline = ImagePipeline::new(provider, uploader, PipelineConfig::default());

    let codec = pipeline.create_codec(descriptor("https://cdn.example.com/a.png"));
    let frame = await_frame(codec.request_next_frame()).await;

    assert!(frame.is_none(), "upload failure must deliver the sentinel");
    assert_eq!(stats.releases.load(Ordering::SeqCst), 1);

    wait_for("budget accounting to drain", || {
        pipeline.decodes_running() == 0 && pipeline.decode_memory_in_use() == 0
    })
    .await;

    pipeline.shutdown();
}

// =============================================================================
// Budget Reconfiguration
// =============================================================================

#[tokio::test]
async fn test_set_budget_enforces_floors_per_field() {
    let provider = MockProvider::still(64, 64);
    let pipeline = ImagePipeline::new(provider, MockUploader::new(), PipelineConfig::default());

    let defaults = pipeline.budget();

    // Both fields below their floors: nothing changes.
    pipeline.set_budget(1, 5 * MIB);
    assert_eq!(pipeline.budget().max_concurrency, defaults.max_concurrency);
    assert_eq!(pipeline.budget().max_memory_bytes, defaults.max_memory_bytes);

    // Valid concurrency with an invalid memory value applies only the former.
    pipeline.set_budget(16, 5 * MIB);
    assert_eq!(pipeline.budget().max_concurrency, 16);
    assert_eq!(pipeline.budget().max_memory_bytes, defaults.max_memory_bytes);

    // And the reverse.
    pipeline.set_budget(1, 40 * MIB);
    assert_eq!(pipeline.budget().max_concurrency, 16);
    assert_eq!(pipeline.budget().max_memory_bytes, 40 * MIB);

    pipeline.shutdown();
}
