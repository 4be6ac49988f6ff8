//! Image payload types exchanged with the provider and uploader.
//!
//! [`PlatformImage`] and [`Bitmap`] both carry a provider-supplied release
//! hook that must run exactly once. Ownership enforces that: the hook is an
//! `Option<FnOnce>` taken on drop, so moving the value between pipeline
//! stages transfers the release obligation with it, and no stage can release
//! twice. Numeric metadata is kept separately in [`ImageMetadata`] so frame
//! accessors keep answering after the handle itself is gone.

use std::any::Any;
use std::fmt;

/// Repetition count meaning "loop forever".
pub const INFINITE_LOOP: i32 = -1;

/// Numeric metadata describing a fetched platform image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageMetadata {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Number of frames; 1 for still images
    pub frame_count: u32,
    /// Animation repetitions; [`INFINITE_LOOP`] means infinite
    pub repetition_count: i32,
    /// Total animation duration in milliseconds; 0 for still images
    pub duration_ms: u32,
}

impl ImageMetadata {
    /// Metadata for a still image of the given size.
    pub fn still(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            frame_count: 1,
            repetition_count: INFINITE_LOOP,
            duration_ms: 0,
        }
    }

    /// Metadata for an animated image.
    pub fn animated(
        width: u32,
        height: u32,
        frame_count: u32,
        repetition_count: i32,
        duration_ms: u32,
    ) -> Self {
        Self {
            width,
            height,
            frame_count,
            repetition_count,
            duration_ms,
        }
    }

    /// True when the asset cycles through more than one frame.
    #[inline]
    pub fn is_multi_frame(&self) -> bool {
        self.frame_count > 1
    }

    /// Display duration of one animation frame, in milliseconds.
    ///
    /// The total duration is split evenly across frames; still images
    /// report 0.
    pub fn frame_duration_ms(&self) -> u32 {
        if self.frame_count > 1 {
            self.duration_ms / self.frame_count
        } else {
            0
        }
    }
}

/// Opaque provider-owned image resource plus its release obligation.
///
/// The payload is whatever the provider needs to decode frames later (a
/// decoder handle, a mapped buffer); the core never inspects it. The release
/// hook runs exactly once, when the image is dropped.
pub struct PlatformImage {
    payload: Box<dyn Any + Send + Sync>,
    metadata: ImageMetadata,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl PlatformImage {
    /// Wraps a provider payload with its metadata and release hook.
    pub fn new(
        payload: impl Any + Send + Sync,
        metadata: ImageMetadata,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            payload: Box::new(payload),
            metadata,
            release: Some(Box::new(release)),
        }
    }

    /// The image metadata.
    #[inline]
    pub fn metadata(&self) -> &ImageMetadata {
        &self.metadata
    }

    /// Borrows the opaque provider payload.
    #[inline]
    pub fn payload(&self) -> &(dyn Any + Send + Sync) {
        self.payload.as_ref()
    }

    /// Downcasts the payload to the provider's concrete type.
    pub fn payload_as<T: 'static>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }
}

impl Drop for PlatformImage {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for PlatformImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlatformImage")
            .field("metadata", &self.metadata)
            .field("payload", &"<opaque>")
            .finish()
    }
}

/// Pixel channel layout of a decoded bitmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColorLayout {
    /// 8-bit RGBA, 4 bytes per pixel
    Rgba8888,
    /// 8-bit BGRA, 4 bytes per pixel
    Bgra8888,
    /// 5-6-5 RGB, 2 bytes per pixel
    Rgb565,
    /// Alpha only, 1 byte per pixel
    Alpha8,
}

impl ColorLayout {
    /// Bytes occupied by one pixel in this layout.
    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            ColorLayout::Rgba8888 | ColorLayout::Bgra8888 => 4,
            ColorLayout::Rgb565 => 2,
            ColorLayout::Alpha8 => 1,
        }
    }
}

/// Alpha interpretation of a decoded bitmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlphaMode {
    /// No transparency
    Opaque,
    /// Color channels premultiplied by alpha
    Premultiplied,
    /// Straight alpha
    Unpremultiplied,
}

/// Raw decoded pixels handed from the decode stage to the upload stage.
///
/// Transient: consumed by upload, then dropped, which runs the provider's
/// release hook exactly once.
pub struct Bitmap {
    data: Vec<u8>,
    width: u32,
    height: u32,
    bytes_per_row: u32,
    color: ColorLayout,
    alpha: AlphaMode,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Bitmap {
    /// Wraps a decoded pixel buffer.
    ///
    /// `bytes_per_row` is the stride, at least `width * bytes_per_pixel`.
    pub fn new(
        data: Vec<u8>,
        width: u32,
        height: u32,
        bytes_per_row: u32,
        color: ColorLayout,
        alpha: AlphaMode,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            data,
            width,
            height,
            bytes_per_row,
            color,
            alpha,
            release: Some(Box::new(release)),
        }
    }

    /// The pixel bytes, row-major with `bytes_per_row` stride.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Width in pixels.
    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels.
    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Row stride in bytes.
    #[inline]
    pub fn bytes_per_row(&self) -> u32 {
        self.bytes_per_row
    }

    /// Pixel channel layout.
    #[inline]
    pub fn color(&self) -> ColorLayout {
        self.color
    }

    /// Alpha interpretation.
    #[inline]
    pub fn alpha(&self) -> AlphaMode {
        self.alpha
    }
}

impl Drop for Bitmap {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bitmap")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes_per_row", &self.bytes_per_row)
            .field("color", &self.color)
            .field("alpha", &self.alpha)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// One delivered animation or still frame.
///
/// `T` is the uploader's texture type.
#[derive(Debug)]
pub struct Frame<T> {
    /// The uploaded GPU resource
    pub texture: T,
    /// Display duration in milliseconds; 0 for still images
    pub duration_ms: u32,
}
