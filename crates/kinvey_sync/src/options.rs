//! Read/write policies, store types and per-call options.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use std::time::Duration;

const ZERO_PAGE_SIZE: &str = "maxSizePerResultSet must be greater than 0 (zero)";
const ZERO_IDS_PER_QUERY: &str = "maxIdsPerQuery must be greater than 0 (zero)";

/// Where reads are served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPolicy {
    /// Local cache only.
    CacheOnly,
    /// Network only; results are cached by caching store types.
    NetworkOnly,
    /// Cache first, then network: two deliveries.
    Both,
}

/// Where writes go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePolicy {
    /// Local cache only; the change is queued for push.
    CacheOnly,
    /// Network only; caching store types mirror the confirmed result.
    NetworkOnly,
    /// Local cache immediately, then the network; the change stays queued
    /// if the network call fails.
    LocalThenNetwork,
}

/// The kind of data store, which fixes its default policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreType {
    /// Offline-first: reads and writes hit the cache; `push`/`pull` sync it.
    Sync,
    /// Cache plus network on every call.
    Cache,
    /// Network only; the cache is never touched.
    Network,
}

impl StoreType {
    /// Default read policy.
    pub fn read_policy(self) -> ReadPolicy {
        match self {
            StoreType::Sync => ReadPolicy::CacheOnly,
            StoreType::Cache => ReadPolicy::Both,
            StoreType::Network => ReadPolicy::NetworkOnly,
        }
    }

    /// Default write policy.
    pub fn write_policy(self) -> WritePolicy {
        match self {
            StoreType::Sync => WritePolicy::CacheOnly,
            StoreType::Cache => WritePolicy::LocalThenNetwork,
            StoreType::Network => WritePolicy::NetworkOnly,
        }
    }

    /// Whether network results are persisted to the cache.
    pub fn uses_cache(self) -> bool {
        !matches!(self, StoreType::Network)
    }

    /// Lowercase name, for error messages.
    pub fn name(self) -> &'static str {
        match self {
            StoreType::Sync => "sync",
            StoreType::Cache => "cache",
            StoreType::Network => "network",
        }
    }
}

/// Optional overrides for a store or a single call.
///
/// Unset fields fall through to the store's options, then to the
/// [`SyncConfig`] and [`StoreType`] defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Options {
    /// Read policy override.
    pub read_policy: Option<ReadPolicy>,
    /// Write policy override.
    pub write_policy: Option<WritePolicy>,
    /// Use delta-set pulls.
    pub delta_set: Option<bool>,
    /// Let the server compute delta sets (`_deltaset`); when false the
    /// client compares `_kmd.lmt` values itself.
    pub server_side_delta: Option<bool>,
    /// Paginate full fetches.
    pub auto_pagination: Option<bool>,
    /// Page size; always greater than zero.
    pub max_size_per_result_set: Option<usize>,
    /// Network timeout.
    pub timeout: Option<Duration>,
}

impl Options {
    /// Starts building options.
    #[must_use]
    pub fn builder() -> OptionsBuilder {
        OptionsBuilder::default()
    }

    /// Fields set on `overrides` win over fields set on `self`.
    #[must_use]
    pub fn merge(&self, overrides: &Options) -> Options {
        Options {
            read_policy: overrides.read_policy.or(self.read_policy),
            write_policy: overrides.write_policy.or(self.write_policy),
            delta_set: overrides.delta_set.or(self.delta_set),
            server_side_delta: overrides.server_side_delta.or(self.server_side_delta),
            auto_pagination: overrides.auto_pagination.or(self.auto_pagination),
            max_size_per_result_set: overrides
                .max_size_per_result_set
                .or(self.max_size_per_result_set),
            timeout: overrides.timeout.or(self.timeout),
        }
    }

    /// Applies defaults without validating; see `ResolvedOptions::validate`.
    pub(crate) fn resolve(&self, store_type: StoreType, config: &SyncConfig) -> ResolvedOptions {
        ResolvedOptions {
            read_policy: self.read_policy.unwrap_or(store_type.read_policy()),
            write_policy: self.write_policy.unwrap_or(store_type.write_policy()),
            delta_set: self.delta_set.unwrap_or(config.delta_set),
            server_side_delta: self.server_side_delta.unwrap_or(true),
            auto_pagination: self.auto_pagination.unwrap_or(config.auto_pagination),
            page_size: self.max_size_per_result_set.unwrap_or(config.page_size),
            timeout: self.timeout.unwrap_or(config.timeout),
            max_ids_per_query: config.max_ids_per_query,
        }
    }
}

/// Validating builder for [`Options`].
#[derive(Debug, Clone, Default)]
pub struct OptionsBuilder {
    options: Options,
}

impl OptionsBuilder {
    /// Sets the read policy.
    #[must_use]
    pub fn read_policy(mut self, policy: ReadPolicy) -> Self {
        self.options.read_policy = Some(policy);
        self
    }

    /// Sets the write policy.
    #[must_use]
    pub fn write_policy(mut self, policy: WritePolicy) -> Self {
        self.options.write_policy = Some(policy);
        self
    }

    /// Enables or disables delta-set pulls.
    #[must_use]
    pub fn delta_set(mut self, enabled: bool) -> Self {
        self.options.delta_set = Some(enabled);
        self
    }

    /// Chooses server-computed (`true`) or client-computed delta sets.
    #[must_use]
    pub fn server_side_delta(mut self, enabled: bool) -> Self {
        self.options.server_side_delta = Some(enabled);
        self
    }

    /// Enables or disables auto-pagination.
    #[must_use]
    pub fn auto_pagination(mut self, enabled: bool) -> Self {
        self.options.auto_pagination = Some(enabled);
        self
    }

    /// Sets the page size.
    #[must_use]
    pub fn max_size_per_result_set(mut self, size: usize) -> Self {
        self.options.max_size_per_result_set = Some(size);
        self
    }

    /// Sets the network timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = Some(timeout);
        self
    }

    /// Validates and returns the options.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Validation`] if `max_size_per_result_set` is zero.
    pub fn build(self) -> SyncResult<Options> {
        if self.options.max_size_per_result_set == Some(0) {
            return Err(SyncError::Validation(ZERO_PAGE_SIZE.into()));
        }
        Ok(self.options)
    }
}

/// Options with every default applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ResolvedOptions {
    pub read_policy: ReadPolicy,
    pub write_policy: WritePolicy,
    pub delta_set: bool,
    pub server_side_delta: bool,
    pub auto_pagination: bool,
    pub page_size: usize,
    pub timeout: Duration,
    pub max_ids_per_query: usize,
}

impl ResolvedOptions {
    /// Rejects sizes that cannot drive a fetch. Runs for every call before
    /// any I/O, whether the options came from the builder or not.
    pub(crate) fn validate(&self) -> SyncResult<()> {
        if self.page_size == 0 {
            return Err(SyncError::Validation(ZERO_PAGE_SIZE.into()));
        }
        if self.max_ids_per_query == 0 {
            return Err(SyncError::Validation(ZERO_IDS_PER_QUERY.into()));
        }
        Ok(())
    }
}
