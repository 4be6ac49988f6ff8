//! Image provider contract.
//!
//! The provider owns everything the core treats as external: the transport
//! that fetches image bytes, the format decoder that turns them into pixels,
//! and (optionally) a view of device capacity. Implementations run their
//! fetches on their own executor; the core only awaits the returned future.

use std::future::Future;

use crate::error::FetchError;
use crate::image::{Bitmap, PlatformImage};
use crate::request::{RequestDescriptor, RequestId};

/// Device decode capacity reported by a probing provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacity {
    /// Usable CPU core count
    pub core_count: u32,
    /// Decode memory budget in bytes
    pub memory_budget_bytes: u64,
}

/// Result of one fetch attempt.
pub type FetchResult = Result<PlatformImage, FetchError>;

/// Source of platform images.
///
/// `fetch`/`cancel_fetch` pair up through the [`RequestId`]; `decode` is the
/// synchronous pixel decoder run on the worker context. The two capacity
/// methods form an optional capability: providers that cannot measure the
/// device keep the defaults and the pipeline runs on its configured budget.
pub trait ImageProvider: Send + Sync + 'static {
    /// Fetches and prepares the image named by `descriptor`.
    ///
    /// Resolves to a platform image carrying its release hook, or a fetch
    /// error. The id identifies this fetch for a later [`cancel_fetch`].
    ///
    /// [`cancel_fetch`]: ImageProvider::cancel_fetch
    fn fetch(
        &self,
        request_id: RequestId,
        descriptor: &RequestDescriptor,
    ) -> impl Future<Output = FetchResult> + Send;

    /// Asks the provider to abandon an in-flight fetch.
    ///
    /// Advisory: the fetch future may still resolve normally, in which case
    /// the caller discards the result.
    fn cancel_fetch(&self, request_id: RequestId);

    /// Decodes one frame of a fetched image into raw pixels.
    ///
    /// Synchronous from the caller's point of view; the pipeline runs it on
    /// the worker context. `None` means the decode produced no pixels.
    fn decode(&self, image: &PlatformImage, frame_index: u32) -> Option<Bitmap>;

    /// Provider name for logging.
    fn name(&self) -> &str;

    /// Reports device decode capacity, when the provider can measure it.
    fn probe_capacity(&self) -> Option<Capacity> {
        None
    }

    /// True when a previous capacity answer may be stale and the pipeline
    /// should probe again.
    fn capacity_may_change(&self) -> bool {
        false
    }
}
