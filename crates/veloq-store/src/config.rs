use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How aggressively warm-up and the flush service push pages to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushMode {
    /// Force to disk at page-count checkpoints; used for durability-first
    /// deployments.
    Sync,
    /// Leave forcing to the periodic flush service.
    #[default]
    Async,
}

/// Configuration for the segment store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Byte size of every segment file. Segments are pre-sized at creation.
    pub segment_bytes: usize,

    /// Route appends through a borrowed staging buffer before committing to
    /// the file channel.
    pub staging_enabled: bool,

    /// Number of staging buffers the pool pre-allocates.
    pub staging_pool_depth: usize,

    /// Minimum dirty pages before `commit` copies staging data to the channel.
    pub commit_least_pages: usize,

    /// Minimum unflushed pages before `flush` forces to disk.
    pub flush_least_pages: usize,

    /// Flush discipline applied while warming a freshly mapped segment.
    pub warm_mode: FlushMode,

    /// Pages touched between forces during a `Sync` warm-up.
    pub warm_pages_per_force: usize,

    /// Grace period before `destroy` forcibly zeroes the refcount of a
    /// segment that still has readers.
    pub destroy_grace_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            segment_bytes: 1024 * 1024 * 1024, // 1GB
            staging_enabled: false,
            staging_pool_depth: 5,
            commit_least_pages: 4,
            flush_least_pages: 4,
            warm_mode: FlushMode::Async,
            warm_pages_per_force: 4096,
            destroy_grace_ms: 120_000,
        }
    }
}

impl StoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the segment file size
    pub fn with_segment_bytes(mut self, bytes: usize) -> Self {
        self.segment_bytes = bytes;
        self
    }

    /// Enable or disable staged writes
    pub fn with_staging(mut self, enabled: bool) -> Self {
        self.staging_enabled = enabled;
        self
    }

    /// Set the staging pool depth
    pub fn with_staging_pool_depth(mut self, depth: usize) -> Self {
        self.staging_pool_depth = depth;
        self
    }

    /// Set the warm-up flush discipline
    pub fn with_warm_mode(mut self, mode: FlushMode) -> Self {
        self.warm_mode = mode;
        self
    }

    /// Grace period before forcible teardown
    pub fn destroy_grace(&self) -> Duration {
        Duration::from_millis(self.destroy_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_page_aligned() {
        let cfg = StoreConfig::default();
        assert_eq!(cfg.segment_bytes % crate::segment::OS_PAGE_SIZE, 0);
        assert_eq!(cfg.warm_mode, FlushMode::Async);
        assert!(cfg.staging_pool_depth > 0);
    }

    #[test]
    fn builder_setters() {
        let cfg = StoreConfig::new()
            .with_segment_bytes(4096)
            .with_staging(true)
            .with_staging_pool_depth(2);
        assert_eq!(cfg.segment_bytes, 4096);
        assert!(cfg.staging_enabled);
        assert_eq!(cfg.staging_pool_depth, 2);
        assert_eq!(cfg.destroy_grace(), Duration::from_millis(120_000));
    }
}
