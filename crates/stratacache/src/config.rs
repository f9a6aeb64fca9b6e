//! Facade configuration
//!
//! One struct bundling both tiers' options; every field has a sensible
//! default, so `CacheConfig::default()` yields an unbounded cache with the
//! standard trim intervals (5 s memory, 60 s disk) and the 20 KiB inline
//! threshold.

pub use stratamem::MemoryCacheConfig;
pub use stratastore::DiskCacheConfig;

/// Combined configuration for the memory and disk tiers.
#[derive(Debug, Clone, Default)]
pub struct CacheConfig {
    /// Memory tier options.
    pub memory: MemoryCacheConfig,
    /// Disk tier options.
    pub disk: DiskCacheConfig,
}
