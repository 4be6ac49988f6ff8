//! Error types for the decode pipeline.
//!
//! Errors are categorized by pipeline stage. None of them escalate past the
//! codec boundary: every failure except cancellation is folded into a single
//! failure sentinel (an empty frame) delivered to waiters, so the rendering
//! runtime never sees a hard error from a decode request.

use thiserror::Error;

/// Failure of one pipeline stage for a single fetch cycle.
///
/// Carried internally between stages and logged; the waiter-visible result
/// is always either a frame or the sentinel, never one of these.
#[derive(Debug, Error)]
pub enum StageError {
    /// Provider returned an invalid or empty image handle
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),

    /// Provider decode produced no pixels
    #[error("decode produced no pixels for frame {frame_index}")]
    Decode { frame_index: u32 },

    /// GPU resource creation failed (degrades to an empty result)
    #[error("upload failed: {0}")]
    Upload(#[from] UploadError),

    /// Request was cancelled; waiters are dropped silently
    #[error("request cancelled")]
    Cancelled,
}

/// Errors a provider implementation may report from `fetch`.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Provider handed back a handle it marked invalid
    #[error("provider returned an invalid image handle")]
    InvalidHandle,

    /// Transport-level failure, provider-specific detail
    #[error("transport error: {0}")]
    Transport(String),

    /// Provider refused or could not serve the request
    #[error("request rejected: {0}")]
    Rejected(String),
}

/// Errors an uploader implementation may report from `upload`.
#[derive(Debug, Error)]
pub enum UploadError {
    /// No GPU context was available on the upload thread
    #[error("no GPU context available")]
    NoContext,

    /// Resource creation failed inside the GPU driver
    #[error("resource creation failed: {0}")]
    ResourceCreation(String),

    /// Bitmap dimensions or layout not supported by the surface
    #[error("unsupported bitmap layout: {0}")]
    UnsupportedLayout(String),
}
