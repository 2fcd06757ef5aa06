//! Client-wide sync configuration.

use std::time::Duration;

/// Default page size and `maxSizePerResultSet`.
pub const DEFAULT_PAGE_SIZE: usize = 10_000;

/// Default number of ids per `_id $in` query when fetching by id.
pub const DEFAULT_MAX_IDS_PER_QUERY: usize = 200;

/// Configuration shared by every data store of a [`Client`](crate::Client).
///
/// Store and per-call [`Options`](crate::Options) override these defaults.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Timeout for each network call.
    pub timeout: Duration,
    /// Page size for auto-paginated full fetches.
    pub page_size: usize,
    /// Ids per request when fetching records by id.
    pub max_ids_per_query: usize,
    /// Whether pulls use delta sets by default.
    pub delta_set: bool,
    /// Whether full fetches paginate by default.
    pub auto_pagination: bool,
}

impl SyncConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the network timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the page size.
    #[must_use]
    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = size;
        self
    }

    /// Sets the number of ids per by-id request.
    #[must_use]
    pub fn with_max_ids_per_query(mut self, count: usize) -> Self {
        self.max_ids_per_query = count;
        self
    }

    /// Enables delta-set pulls by default.
    #[must_use]
    pub fn with_delta_set(mut self, enabled: bool) -> Self {
        self.delta_set = enabled;
        self
    }

    /// Enables auto-pagination by default.
    #[must_use]
    pub fn with_auto_pagination(mut self, enabled: bool) -> Self {
        self.auto_pagination = enabled;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            page_size: DEFAULT_PAGE_SIZE,
            max_ids_per_query: DEFAULT_MAX_IDS_PER_QUERY,
            delta_set: false,
            auto_pagination: false,
        }
    }
}
