//! Per-request decode state machine.
//!
//! An [`ImageCodec`] drives one logical image request through its stages:
//!
//! ```text
//! request_next_frame()
//!        │
//!        ▼
//!     origin ──► provider fetch ──► origin ──► admission ──► worker decode
//!                 (async)                                        │
//!        ┌────────────────────────────────────────────────────────┘
//!        ▼
//!     upload ──► origin (deliver to waiters)
//! ```
//!
//! Still images decode once, cache the uploaded frame, and release the
//! platform handle after upload. Animated images keep the handle and decode
//! one frame per request, round-robin over the frame count, never caching;
//! each cycle delivers to the single continuation that triggered it.
//!
//! Cancellation is cooperative. The flag is permanent, checked at every
//! stage boundary, and clearing the waiter list on cancel drops the senders
//! without sending, so waiters observe a closed channel rather than a
//! result. Every stage closure holds an `Arc` of the codec, which keeps the
//! instance alive while work is in flight even if the caller drops its
//! reference.
//!
//! Two locks, never nested: the codec state (phase, waiters, metadata,
//! cycle cursor) and the platform image slot. The image lock is held across
//! the provider's synchronous decode; release always happens by taking the
//! handle out of the slot and dropping it after the guard is gone.

use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::config::estimate_decode_cost;
use crate::error::StageError;
use crate::image::{Bitmap, Frame, ImageMetadata, PlatformImage, INFINITE_LOOP};
use crate::pipeline::limiter::DecodeSlot;
use crate::pipeline::registry::PipelineShared;
use crate::provider::{FetchResult, ImageProvider};
use crate::request::{RequestDescriptor, RequestId};
use crate::uploader::TextureUploader;

/// Result delivered to a waiter: a frame, or the failure sentinel.
pub type FrameResult<T> = Option<Arc<Frame<T>>>;

type FrameSender<T> = oneshot::Sender<FrameResult<T>>;

/// Lifecycle phase of a codec.
///
/// `Complete` covers both success (a cached frame exists or multi-frame
/// cycling is active) and terminal failure (nothing cached, single frame).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecPhase {
    /// No fetch issued yet
    New,
    /// Provider fetch in flight
    Downloading,
    /// Fetch cycle finished, successfully or not
    Complete,
}

/// Who receives the result of one decode cycle.
enum DeliveryTarget<T> {
    /// Everyone on the shared waiter list (first fetch, still images).
    AllWaiters,
    /// The single continuation that triggered an animation cycle.
    Cycle(FrameSender<T>),
}

/// Where a decode cycle runs.
enum DecodeDispatch {
    /// Synchronously on the origin context (first animation frame).
    Origin,
    /// Through the admission controller onto the worker pool.
    Admission,
}

/// Mutable codec state, guarded by one non-reentrant lock.
struct CodecState<T> {
    phase: CodecPhase,
    waiters: Vec<FrameSender<T>>,
    cached: Option<Arc<Frame<T>>>,
    metadata: Option<ImageMetadata>,
    next_frame_index: u32,
    active_request: Option<RequestId>,
}

impl<T> CodecState<T> {
    fn new() -> Self {
        Self {
            phase: CodecPhase::New,
            waiters: Vec::new(),
            cached: None,
            metadata: None,
            next_frame_index: 0,
            active_request: None,
        }
    }
}

/// Per-request decode state machine.
///
/// Created by [`crate::pipeline::ImagePipeline::create_codec`]; shared
/// machinery (provider, uploader, admission, contexts) is injected, so a
/// codec holds no global state.
pub struct ImageCodec<P: ImageProvider, U: TextureUploader> {
    shared: Arc<PipelineShared<P, U>>,
    descriptor: RequestDescriptor,
    state: Mutex<CodecState<U::Texture>>,
    /// Platform image slot. Held across the provider's synchronous decode;
    /// the handle is only ever released after leaving this lock.
    image: Mutex<Option<PlatformImage>>,
    cancelled: CancellationToken,
}

impl<P: ImageProvider, U: TextureUploader> ImageCodec<P, U> {
    pub(crate) fn new(
        shared: Arc<PipelineShared<P, U>>,
        descriptor: RequestDescriptor,
    ) -> Arc<Self> {
        Arc::new(Self {
            shared,
            descriptor,
            state: Mutex::new(CodecState::new()),
            image: Mutex::new(None),
            cancelled: CancellationToken::new(),
        })
    }

    /// The request this codec was created for.
    #[inline]
    pub fn descriptor(&self) -> &RequestDescriptor {
        &self.descriptor
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> CodecPhase {
        self.state.lock().expect("codec state lock poisoned").phase
    }

    /// Frame count of the fetched asset; 1 until metadata is known.
    pub fn frame_count(&self) -> u32 {
        self.state
            .lock()
            .expect("codec state lock poisoned")
            .metadata
            .map_or(1, |meta| meta.frame_count)
    }

    /// Animation repetition count; −1 (infinite) until metadata is known.
    pub fn repetition_count(&self) -> i32 {
        self.state
            .lock()
            .expect("codec state lock poisoned")
            .metadata
            .map_or(INFINITE_LOOP, |meta| meta.repetition_count)
    }

    /// True once [`cancel`](Self::cancel) has run.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.is_cancelled()
    }

    /// Requests the next frame.
    ///
    /// The returned receiver resolves once with the frame, or with `None`
    /// when the request fails at any stage. After [`cancel`](Self::cancel)
    /// the channel is simply closed, and nothing is delivered.
    ///
    /// A still image is fetched and decoded once, then served from cache.
    /// An animated image decodes the next frame per call, wrapping at the
    /// frame count. A still request whose previous fetch failed terminally
    /// is retried with a fresh fetch.
    pub fn request_next_frame(self: &Arc<Self>) -> oneshot::Receiver<FrameResult<U::Texture>> {
        let (sender, receiver) = oneshot::channel();
        if self.cancelled.is_cancelled() {
            return receiver;
        }
        let mut sender = Some(sender);

        enum Action {
            Settled,
            StartFetch(RequestId),
            StartCycle,
        }

        let action = {
            let mut state = self.state.lock().expect("codec state lock poisoned");
            match state.phase {
                CodecPhase::Complete => {
                    let multi = state
                        .metadata
                        .map_or(false, |meta| meta.is_multi_frame());
                    if multi {
                        Action::StartCycle
                    } else if let Some(frame) = &state.cached {
                        if let Some(sender) = sender.take() {
                            let _ = sender.send(Some(Arc::clone(frame)));
                        }
                        Action::Settled
                    } else {
                        // Terminal failure with nothing cached: retry with a
                        // fresh fetch instead of pinning the failure forever.
                        if let Some(sender) = sender.take() {
                            state.waiters.push(sender);
                        }
                        state.phase = CodecPhase::Downloading;
                        let request_id = self.shared.mint_request_id();
                        state.active_request = Some(request_id);
                        Action::StartFetch(request_id)
                    }
                }
                CodecPhase::Downloading => {
                    if let Some(sender) = sender.take() {
                        state.waiters.push(sender);
                    }
                    Action::Settled
                }
                CodecPhase::New => {
                    if let Some(sender) = sender.take() {
                        state.waiters.push(sender);
                    }
                    state.phase = CodecPhase::Downloading;
                    let request_id = self.shared.mint_request_id();
                    state.active_request = Some(request_id);
                    Action::StartFetch(request_id)
                }
            }
        };

        match action {
            Action::Settled => {}
            Action::StartFetch(request_id) => self.begin_fetch(request_id),
            Action::StartCycle => {
                if let Some(sender) = sender.take() {
                    self.start_cycle(DecodeDispatch::Admission, DeliveryTarget::Cycle(sender));
                }
            }
        }

        receiver
    }

    /// Cancels this request permanently.
    ///
    /// Idempotent. Aborts an in-flight fetch, releases the platform handle
    /// and any cached frame, and drops all registered waiters without
    /// delivering to them. In-flight stages observe the flag at their next
    /// checkpoint and stop.
    pub fn cancel(&self) {
        self.cancelled.cancel();

        let pending_fetch = {
            let mut state = self.state.lock().expect("codec state lock poisoned");
            state.waiters.clear();
            state.cached = None;
            state.phase = CodecPhase::Complete;
            state.active_request.take()
        };

        if let Some(request_id) = pending_fetch {
            debug!(request_id = %request_id, url = %self.descriptor.url, "cancelling in-flight fetch");
            self.shared.provider.cancel_fetch(request_id);
        }

        self.release_image();
    }

    // =========================================================================
    // Stage 1: fetch (provider context)
    // =========================================================================

    fn begin_fetch(self: &Arc<Self>, request_id: RequestId) {
        debug!(request_id = %request_id, url = %self.descriptor.url, "fetch started");
        let codec = Arc::clone(self);
        self.shared.dispatcher.spawn_provider(async move {
            let result = codec.shared.provider.fetch(request_id, &codec.descriptor).await;
            if codec.cancelled.is_cancelled() {
                // Late arrival; dropping the result releases any handle.
                return;
            }
            let on_origin = Arc::clone(&codec);
            codec.shared.dispatcher.origin().post(move || {
                on_origin.handle_fetch_result(result);
            });
        });
    }

    /// Runs on origin once the provider resolves.
    fn handle_fetch_result(self: Arc<Self>, result: FetchResult) {
        if self.cancelled.is_cancelled() {
            return;
        }

        let image = match result {
            Ok(image) => image,
            Err(error) => {
                warn!(
                    url = %self.descriptor.url,
                    error = %StageError::Fetch(error),
                    "request failed"
                );
                {
                    let mut state = self.state.lock().expect("codec state lock poisoned");
                    state.active_request = None;
                }
                self.deliver(None, DeliveryTarget::AllWaiters);
                return;
            }
        };

        let metadata = *image.metadata();
        debug!(
            url = %self.descriptor.url,
            width = metadata.width,
            height = metadata.height,
            frames = metadata.frame_count,
            "fetch completed"
        );

        {
            let mut state = self.state.lock().expect("codec state lock poisoned");
            state.active_request = None;
            state.metadata = Some(metadata);
        }

        {
            let mut slot = self.image.lock().expect("image slot lock poisoned");
            if self.cancelled.is_cancelled() {
                // A cancel raced the store; the handle must not outlive it.
                drop(slot);
                drop(image);
                return;
            }
            *slot = Some(image);
        }

        if metadata.is_multi_frame() {
            // First animation frame decodes on the origin context itself, so
            // playback starts even when the decode budget is saturated.
            // Later cycles go through admission like everything else.
            self.start_cycle(DecodeDispatch::Origin, DeliveryTarget::AllWaiters);
        } else {
            self.start_cycle(DecodeDispatch::Admission, DeliveryTarget::AllWaiters);
        }
    }

    // =========================================================================
    // Stage 2: decode admission + cycle setup
    // =========================================================================

    /// Starts one decode cycle for the frame under the cursor.
    fn start_cycle(self: &Arc<Self>, dispatch: DecodeDispatch, target: DeliveryTarget<U::Texture>) {
        if self.cancelled.is_cancelled() {
            return;
        }

        // An animation whose handle was retired by an earlier decode failure
        // answers immediately with the sentinel.
        let handle_gone = self
            .image
            .lock()
            .expect("image slot lock poisoned")
            .is_none();
        if handle_gone {
            self.deliver(None, target);
            return;
        }

        let (frame_index, duration_ms, cost, retire_handle) = {
            let mut state = self.state.lock().expect("codec state lock poisoned");
            let meta = match state.metadata {
                Some(meta) => meta,
                None => return,
            };
            let frame_index = state.next_frame_index;
            state.next_frame_index = (frame_index + 1) % meta.frame_count.max(1);
            (
                frame_index,
                meta.frame_duration_ms(),
                estimate_decode_cost(meta.width, meta.height),
                !meta.is_multi_frame(),
            )
        };

        match dispatch {
            DecodeDispatch::Origin => {
                self.decode_stage(frame_index, duration_ms, retire_handle, None, target);
            }
            DecodeDispatch::Admission => {
                let codec = Arc::clone(self);
                self.shared.limiter.submit(cost, move |slot| {
                    codec.decode_stage(frame_index, duration_ms, retire_handle, Some(slot), target);
                });
            }
        }
    }

    // =========================================================================
    // Stage 3: decode (worker context)
    // =========================================================================

    #[instrument(skip_all, fields(url = %self.descriptor.url, frame = frame_index))]
    fn decode_stage(
        self: &Arc<Self>,
        frame_index: u32,
        duration_ms: u32,
        retire_handle: bool,
        slot: Option<DecodeSlot>,
        target: DeliveryTarget<U::Texture>,
    ) {
        enum Attempt {
            Cancelled,
            HandleGone,
            Failed,
            Decoded(Bitmap),
        }

        let attempt = {
            let image_slot = self.image.lock().expect("image slot lock poisoned");
            match image_slot.as_ref() {
                _ if self.cancelled.is_cancelled() => Attempt::Cancelled,
                None => Attempt::HandleGone,
                Some(image) => match self.shared.provider.decode(image, frame_index) {
                    Some(bitmap) => Attempt::Decoded(bitmap),
                    None => Attempt::Failed,
                },
            }
        };

        match attempt {
            Attempt::Cancelled => {
                // Slot returns on drop; the handle stays with cancel().
                drop(slot);
            }
            Attempt::HandleGone => {
                drop(slot);
                self.post_delivery(None, target);
            }
            Attempt::Failed => {
                warn!(error = %StageError::Decode { frame_index }, "request failed");
                drop(slot);
                // A failed decode retires the handle for good; for an
                // animation, later cycles answer with the sentinel.
                self.release_image();
                self.post_delivery(None, target);
            }
            Attempt::Decoded(bitmap) => {
                let codec = Arc::clone(self);
                self.shared.dispatcher.upload().post(move || {
                    codec.upload_stage(bitmap, duration_ms, retire_handle, slot, target);
                });
            }
        }
    }

    // =========================================================================
    // Stage 4: upload (upload context)
    // =========================================================================

    fn upload_stage(
        self: &Arc<Self>,
        bitmap: Bitmap,
        duration_ms: u32,
        retire_handle: bool,
        slot: Option<DecodeSlot>,
        target: DeliveryTarget<U::Texture>,
    ) {
        if self.cancelled.is_cancelled() {
            // Pixels and budget are both returned; nothing is delivered.
            drop(bitmap);
            drop(slot);
            return;
        }

        let uploaded = self.shared.uploader.upload(&bitmap);
        drop(bitmap);
        drop(slot);

        if retire_handle {
            // A still image's handle has served its purpose once the sole
            // frame is on the GPU.
            self.release_image();
        }

        let frame = match uploaded {
            Ok(texture) => Some(Arc::new(Frame {
                texture,
                duration_ms,
            })),
            Err(error) => {
                // Degrades to an empty visual result.
                warn!(
                    url = %self.descriptor.url,
                    error = %StageError::Upload(error),
                    "request failed"
                );
                None
            }
        };

        self.post_delivery(frame, target);
    }

    // =========================================================================
    // Stage 5: deliver (origin context)
    // =========================================================================

    fn post_delivery(self: &Arc<Self>, frame: FrameResult<U::Texture>, target: DeliveryTarget<U::Texture>) {
        let codec = Arc::clone(self);
        self.shared.dispatcher.origin().post(move || {
            codec.deliver(frame, target);
        });
    }

    /// Marks the cycle complete and fans the result out.
    ///
    /// Holding the state lock across the sends pins the ordering against
    /// `cancel`: once cancel has returned, no waiter can receive anything.
    fn deliver(&self, frame: FrameResult<U::Texture>, target: DeliveryTarget<U::Texture>) {
        let mut state = self.state.lock().expect("codec state lock poisoned");
        if self.cancelled.is_cancelled() {
            return;
        }
        state.phase = CodecPhase::Complete;

        match target {
            DeliveryTarget::AllWaiters => {
                let multi = state
                    .metadata
                    .map_or(false, |meta| meta.is_multi_frame());
                if !multi {
                    // Still images serve later requests from cache; animation
                    // frames are always decoded fresh.
                    state.cached = frame.clone();
                }
                let waiters = std::mem::take(&mut state.waiters);
                debug!(
                    url = %self.descriptor.url,
                    waiters = waiters.len(),
                    delivered = frame.is_some(),
                    "delivering to waiters"
                );
                for waiter in waiters {
                    let _ = waiter.send(frame.clone());
                }
            }
            DeliveryTarget::Cycle(sender) => {
                let _ = sender.send(frame);
            }
        }
    }

    // =========================================================================
    // Resource cleanup
    // =========================================================================

    /// Takes the platform image out of its slot and releases it.
    ///
    /// The release hook runs after the lock is dropped, never under it.
    fn release_image(&self) {
        let image = {
            let mut slot = self.image.lock().expect("image slot lock poisoned");
            slot.take()
        };
        if image.is_some() {
            debug!(url = %self.descriptor.url, "platform image released");
        }
        drop(image);
    }
}

impl<P: ImageProvider, U: TextureUploader> std::fmt::Debug for ImageCodec<P, U> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageCodec")
            .field("url", &self.descriptor.url)
            .field("phase", &self.phase())
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}
