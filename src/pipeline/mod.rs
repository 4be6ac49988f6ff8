//! Async image decode pipeline.
//!
//! This module implements the budgeted, multi-stage pipeline that turns an
//! image request into a GPU texture. Decoding is the expensive stage, so it
//! runs under an admission controller that bounds both decode concurrency
//! and the estimated memory of in-flight decodes.
//!
//! # Architecture
//!
//! ```text
//! Request → Fetch (async) → Admission → Decode (worker) → Upload → Deliver
//! ```
//!
//! # Key Components
//!
//! - [`ImagePipeline`] - Owns the shared machinery; creates codecs
//! - [`ImageCodec`] - Per-request state machine with cancellation
//! - [`DecodeLimiter`] - Memory and concurrency admission controller
//! - [`DecodeSlot`] - Charged admission, returned on drop
//! - [`StageDispatcher`] - Serial origin/upload contexts plus the worker pool
//!
//! # Example
//!
//! ```ignore
//! use texelpipe::{ImagePipeline, PipelineConfig, RequestDescriptor};
//!
//! let pipeline = ImagePipeline::new(provider, uploader, PipelineConfig::default());
//! let codec = pipeline.create_codec(RequestDescriptor::new("https://cdn.example.com/a.gif"));
//!
//! // One frame per call; animations cycle through their frames.
//! let frame = codec.request_next_frame().await?;
//! ```

mod codec;
mod dispatch;
mod limiter;
mod registry;

pub use codec::{CodecPhase, FrameResult, ImageCodec};
pub use dispatch::{StageDispatcher, StageQueue, StageTask, TokioWorkerSpawner, WorkerSpawner};
pub use limiter::{DecodeLimiter, DecodeSlot};
pub use registry::ImagePipeline;
