//! Texture uploader contract.
//!
//! The uploader owns GPU resource creation. It is invoked only on the
//! pipeline's upload context, so implementations may assume single-threaded
//! access to their GPU state.

use crate::error::UploadError;
use crate::image::Bitmap;

/// Creates GPU resources from decoded pixels.
pub trait TextureUploader: Send + Sync + 'static {
    /// The GPU resource type delivered to waiters inside a frame.
    type Texture: Send + Sync + 'static;

    /// Creates a texture from `bitmap`.
    ///
    /// A failure degrades the request to an empty visual result; it is never
    /// escalated to the caller as a hard error.
    fn upload(&self, bitmap: &Bitmap) -> Result<Self::Texture, UploadError>;
}
