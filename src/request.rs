//! Request model for the decode pipeline.
//!
//! A [`RequestDescriptor`] is the immutable input for one logical image
//! request. It is owned by the codec driving that request and never mutated
//! after construction. Policies are advisory inputs for the provider (which
//! may transcode or recompress server-side); the core passes them through
//! untouched.

use std::collections::BTreeMap;

/// Identifier for one provider fetch, unique within a pipeline.
///
/// Minted by [`crate::pipeline::ImagePipeline`], monotonically increasing,
/// and quoted back to the provider for `cancel_fetch`. A codec that re-fetches
/// (retry after failure, multi-frame restart) gets a fresh id each cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    /// Wraps a raw id value. Only the pipeline mints new ids.
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw numeric value, for logging and provider bookkeeping.
    #[inline]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "request-{}", self.0)
    }
}

/// Compression quality tier requested from the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ImageQuality {
    /// Provider decides
    #[default]
    Default,
    /// No recompression, original bytes
    Original,
    /// Aggressive compression (quality 50)
    Low,
    /// Balanced compression (quality 75)
    Normal,
    /// Light compression (quality 90)
    High,
}

impl ImageQuality {
    /// Numeric compression quality for tiers that fix one.
    ///
    /// `Default` and `Original` leave the choice to the provider.
    pub fn compression_value(&self) -> Option<u32> {
        match self {
            ImageQuality::Default | ImageQuality::Original => None,
            ImageQuality::Low => Some(50),
            ImageQuality::Normal => Some(75),
            ImageQuality::High => Some(90),
        }
    }
}

/// Preference for provider-side transcoding to a given container format.
///
/// Used for both WebP and HEIC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TranscodePreference {
    /// Provider decides
    #[default]
    Default,
    /// Never transcode to this format
    Never,
    /// Always request this format
    Always,
}

/// Preference for how the provider serves animated assets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MultiFramePreference {
    /// Provider decides
    #[default]
    Default,
    /// Ask the provider for a recompressed (smaller) animation
    Compress,
}

/// Advisory fetch policy, forwarded to the provider verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RequestPolicy {
    /// Request provider-side sharpening
    pub sharpen: bool,
    /// Compression quality tier
    pub quality: ImageQuality,
    /// WebP transcode preference
    pub webp: TranscodePreference,
    /// HEIC transcode preference
    pub heic: TranscodePreference,
    /// Animated asset handling
    pub multi_frame: MultiFramePreference,
}

/// Immutable input for one logical image request.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    /// Source locator understood by the provider
    pub url: String,

    /// Opaque caller tag, echoed in logs
    pub tag: String,

    /// Decode target width in pixels (0 = provider's native size)
    pub target_width: u32,

    /// Decode target height in pixels (0 = provider's native size)
    pub target_height: u32,

    /// Advisory fetch policy
    pub policy: RequestPolicy,

    /// Open side channel passed through to the provider untouched
    pub extra: BTreeMap<String, String>,
}

impl RequestDescriptor {
    /// Creates a descriptor for `url` with native size and default policy.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            tag: String::new(),
            target_width: 0,
            target_height: 0,
            policy: RequestPolicy::default(),
            extra: BTreeMap::new(),
        }
    }

    /// Sets the decode target dimensions.
    pub fn with_target(mut self, width: u32, height: u32) -> Self {
        self.target_width = width;
        self.target_height = height;
        self
    }

    /// Sets the opaque caller tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    /// Sets the fetch policy.
    pub fn with_policy(mut self, policy: RequestPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Adds one side-channel entry.
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}
