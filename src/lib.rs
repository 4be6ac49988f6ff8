//! TexelPipe - Budgeted image decoding for a rendering runtime
//!
//! This library turns image requests into GPU-ready frames through a
//! fetch → decode → upload pipeline. Decodes run under an admission
//! controller that bounds concurrency and the estimated memory of work in
//! flight, so a burst of large images cannot starve the process.
//!
//! # High-Level API
//!
//! The [`pipeline`] module provides the entry point:
//!
//! ```ignore
//! use texelpipe::{ImagePipeline, PipelineConfig, RequestDescriptor};
//!
//! let pipeline = ImagePipeline::new(provider, uploader, PipelineConfig::default());
//! let codec = pipeline.create_codec(RequestDescriptor::new("https://cdn.example.com/a.png"));
//!
//! match codec.request_next_frame().await {
//!     Ok(Some(frame)) => render(frame),
//!     Ok(None) => show_placeholder(),   // request failed at some stage
//!     Err(_) => {}                      // codec was cancelled
//! }
//! ```
//!
//! Embedders plug in their platform by implementing [`ImageProvider`]
//! (fetch and decode) and [`TextureUploader`] (pixels onto the GPU).

pub mod config;
pub mod error;
pub mod image;
pub mod logging;
pub mod pipeline;
pub mod provider;
pub mod request;
pub mod uploader;

pub use config::{BudgetSettings, PipelineConfig};
pub use error::{FetchError, StageError, UploadError};
pub use image::{AlphaMode, Bitmap, ColorLayout, Frame, ImageMetadata, PlatformImage};
pub use pipeline::{CodecPhase, FrameResult, ImageCodec, ImagePipeline};
pub use provider::{Capacity, FetchResult, ImageProvider};
pub use request::{ImageQuality, RequestDescriptor, RequestId, RequestPolicy};
pub use uploader::TextureUploader;

/// Version of the TexelPipe library.
///
/// The version is defined in `Cargo.toml` and injected at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
