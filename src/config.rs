//! Configuration settings and default values for the decode pipeline.
//!
//! Contains all `DEFAULT_*` and `MIN_*` constants plus the settings structs
//! handed to [`crate::pipeline::ImagePipeline`] at construction. Budgets below
//! their floors are rejected at runtime by the admission controller, so the
//! constants here are the single source of truth for those floors.

// =============================================================================
// Admission budget limits
// =============================================================================

/// Minimum concurrent decode count.
/// Below this the pipeline serializes decodes behind a single slot and
/// animated assets visibly stall.
pub const MIN_DECODE_CONCURRENCY: u32 = 2;

/// Default concurrent decode count.
pub const DEFAULT_DECODE_CONCURRENCY: u32 = 4;

/// Minimum decode memory budget (10 MiB).
/// A single 1024x1024 RGBA frame costs 4 MiB; anything lower than two of
/// those plus headroom starves ordinary assets.
pub const MIN_DECODE_MEMORY_BYTES: u64 = 10 * 1024 * 1024;

/// Default decode memory budget (20 MiB).
pub const DEFAULT_DECODE_MEMORY_BYTES: u64 = 20 * 1024 * 1024;

// =============================================================================
// Decode cost model
// =============================================================================

/// Estimated bytes per decoded pixel (RGBA8888).
pub const BYTES_PER_PIXEL: u64 = 4;

/// Estimated decoded footprint for an image of the given dimensions.
///
/// This is the cost charged against the memory budget while a decode holds
/// an admission slot.
pub fn estimate_decode_cost(width: u32, height: u32) -> u64 {
    width as u64 * height as u64 * BYTES_PER_PIXEL
}

// =============================================================================
// Settings
// =============================================================================

/// Admission budget for concurrent decode work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetSettings {
    /// Maximum decodes running at once.
    pub max_concurrency: u32,
    /// Maximum estimated decode memory in flight, in bytes.
    pub max_memory_bytes: u64,
}

impl Default for BudgetSettings {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_DECODE_CONCURRENCY,
            max_memory_bytes: DEFAULT_DECODE_MEMORY_BYTES,
        }
    }
}

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    /// Initial admission budget. Recalibrated from the provider's capacity
    /// probe when one is available.
    pub budget: BudgetSettings,
}
