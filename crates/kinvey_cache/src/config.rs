//! Cache configuration.

/// Configuration for opening a cache store.
#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    /// Whether to create the cache directory if it doesn't exist.
    pub create_if_missing: bool,

    /// Whether to `sync` the journal on every commit (safer but slower).
    ///
    /// When false, commits are only flushed to the OS.
    pub sync_on_commit: bool,

    /// Journal size in bytes past which a commit triggers compaction
    /// (0 = never compact automatically).
    pub compact_threshold: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            sync_on_commit: true,
            compact_threshold: 16 * 1024 * 1024, // 16 MB
        }
    }
}

impl CacheConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the cache if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets whether to sync the journal on every commit.
    #[must_use]
    pub const fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }

    /// Sets the automatic compaction threshold.
    #[must_use]
    pub const fn compact_threshold(mut self, bytes: u64) -> Self {
        self.compact_threshold = bytes;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = CacheConfig::default();
        assert!(config.create_if_missing);
        assert!(config.sync_on_commit);
        assert_eq!(config.compact_threshold, 16 * 1024 * 1024);
    }

    #[test]
    fn builder_pattern() {
        let config = CacheConfig::new()
            .create_if_missing(false)
            .sync_on_commit(false)
            .compact_threshold(0);

        assert!(!config.create_if_missing);
        assert!(!config.sync_on_commit);
        assert_eq!(config.compact_threshold, 0);
    }
}
