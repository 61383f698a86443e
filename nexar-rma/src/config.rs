//! Runtime-configurable tuning parameters for the RMA core.
//!
//! All values have sensible defaults. Override via environment variables
//! (prefixed `NEXAR_RMA_`) or by constructing a custom `RmaConfig`.

use crate::error::{Result, RmaError};
use std::time::Duration;

/// Fixed bookkeeping cost of one registration-cache lookup.
pub const RCACHE_OVERHEAD_DEFAULT: Duration = Duration::from_nanos(50);

bitflags::bitflags! {
    /// Features a context is created with.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Features: u32 {
        const TAG = 1 << 0;
        const RMA = 1 << 1;
        const AMO32 = 1 << 2;
        const AMO64 = 1 << 3;
        const STREAM = 1 << 4;
        const AM = 1 << 5;
    }
}

/// Parameters identifying a context and the features it enables.
#[derive(Debug, Clone)]
pub struct ContextParams {
    pub name: String,
    pub features: Features,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            name: "nexar-rma".into(),
            features: Features::RMA,
        }
    }
}

/// Tuning parameters for registration caching and the request engine.
#[derive(Debug, Clone)]
pub struct RmaConfig {
    /// Reuse registrations across requests through the registration cache.
    pub rcache_enabled: bool,

    /// Fixed cost charged per cache lookup when choosing zero-copy thresholds.
    pub rcache_overhead: Duration,

    /// Cached regions are widened to this alignment (power of two).
    pub rcache_alignment: usize,

    /// Unreferenced cache entries kept registered before the least recently
    /// released ones are evicted.
    pub rcache_max_unused: usize,

    /// Size of each bounce buffer used by buffered-copy fragments.
    pub bcopy_chunk_bytes: usize,

    /// Number of bounce buffers preallocated per worker.
    pub bcopy_pool_size: usize,

    /// Maximum number of in-flight requests per worker.
    pub request_pool_size: usize,
}

impl Default for RmaConfig {
    fn default() -> Self {
        Self {
            rcache_enabled: true,
            rcache_overhead: RCACHE_OVERHEAD_DEFAULT,
            rcache_alignment: 4096,
            rcache_max_unused: 1024,
            bcopy_chunk_bytes: 8 * 1024, // 8 KiB
            bcopy_pool_size: 128,
            request_pool_size: 1024,
        }
    }
}

impl RmaConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `NEXAR_RMA_RCACHE` (`0`/`1`, `false`/`true`, `n`/`y`)
    /// - `NEXAR_RMA_RCACHE_OVERHEAD_NS`
    /// - `NEXAR_RMA_RCACHE_ALIGNMENT`
    /// - `NEXAR_RMA_RCACHE_MAX_UNUSED`
    /// - `NEXAR_RMA_BCOPY_CHUNK_BYTES`
    /// - `NEXAR_RMA_BCOPY_POOL_SIZE`
    /// - `NEXAR_RMA_REQUEST_POOL_SIZE`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !self.rcache_alignment.is_power_of_two() {
            return Err(RmaError::invalid_param(format!(
                "rcache_alignment {} is not a power of two",
                self.rcache_alignment
            )));
        }
        if self.bcopy_chunk_bytes == 0 {
            return Err(RmaError::invalid_param("bcopy_chunk_bytes must be non-zero"));
        }
        Ok(())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        if let Some(v) = lookup("NEXAR_RMA_RCACHE")
            && let Some(b) = parse_bool(&v)
        {
            cfg.rcache_enabled = b;
        }
        if let Some(v) = lookup("NEXAR_RMA_RCACHE_OVERHEAD_NS")
            && let Ok(ns) = v.parse::<u64>()
        {
            cfg.rcache_overhead = Duration::from_nanos(ns);
        }
        if let Some(v) = lookup("NEXAR_RMA_RCACHE_ALIGNMENT")
            && let Ok(n) = v.parse::<usize>()
            && n.is_power_of_two()
        {
            cfg.rcache_alignment = n;
        }
        if let Some(v) = lookup("NEXAR_RMA_RCACHE_MAX_UNUSED")
            && let Ok(n) = v.parse::<usize>()
        {
            cfg.rcache_max_unused = n;
        }
        if let Some(v) = lookup("NEXAR_RMA_BCOPY_CHUNK_BYTES")
            && let Ok(n) = v.parse::<usize>()
            && n > 0
        {
            cfg.bcopy_chunk_bytes = n;
        }
        if let Some(v) = lookup("NEXAR_RMA_BCOPY_POOL_SIZE")
            && let Ok(n) = v.parse::<usize>()
        {
            cfg.bcopy_pool_size = n;
        }
        if let Some(v) = lookup("NEXAR_RMA_REQUEST_POOL_SIZE")
            && let Ok(n) = v.parse::<usize>()
        {
            cfg.request_pool_size = n;
        }

        cfg
    }
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "y" | "yes" | "true" | "on" => Some(true),
        "0" | "n" | "no" | "false" | "off" => Some(false),
        _ => None,
    }
}
