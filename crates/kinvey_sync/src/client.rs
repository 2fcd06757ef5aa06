//! The entry point tying a cache to a backend.

use crate::config::SyncConfig;
use crate::network::NetworkService;
use crate::options::{Options, StoreType};
use crate::pull::InFlightRegistry;
use crate::store::DataStore;
use kinvey_cache::{CacheStore, CheckpointKey};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Shared state behind every [`DataStore`] handle.
///
/// Cloning is cheap; clones share the cache, the backend and the
/// registries of pulls and pushes in flight.
pub struct Client<N: NetworkService + ?Sized> {
    cache: Arc<CacheStore>,
    network: Arc<N>,
    config: SyncConfig,
    in_flight: InFlightRegistry<CheckpointKey>,
    pushing: InFlightRegistry<String>,
}

impl<N: NetworkService> Client<N> {
    /// Creates a client owning `cache` and `network`.
    pub fn new(cache: CacheStore, network: N, config: SyncConfig) -> Self {
        Self::from_shared(Arc::new(cache), Arc::new(network), config)
    }
}

impl<N: NetworkService + ?Sized> Client<N> {
    /// Creates a client over an already shared cache and backend.
    pub fn from_shared(cache: Arc<CacheStore>, network: Arc<N>, config: SyncConfig) -> Self {
        Self {
            cache,
            network,
            config,
            in_flight: InFlightRegistry::default(),
            pushing: InFlightRegistry::default(),
        }
    }

    /// The local cache.
    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    /// The backend.
    pub fn network(&self) -> &Arc<N> {
        &self.network
    }

    /// Client-wide defaults.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// A handle to `collection` with default options.
    pub fn data_store(&self, collection: impl Into<String>, store_type: StoreType) -> DataStore<N> {
        self.data_store_with_options(collection, store_type, Options::default())
    }

    /// A handle to `collection` whose calls start from `options`.
    pub fn data_store_with_options(
        &self,
        collection: impl Into<String>,
        store_type: StoreType,
        options: Options,
    ) -> DataStore<N> {
        DataStore {
            collection: collection.into(),
            store_type,
            options,
            cache: Arc::clone(&self.cache),
            network: Arc::clone(&self.network),
            config: self.config.clone(),
            in_flight: Arc::clone(&self.in_flight),
            pushing: Arc::clone(&self.pushing),
            delta_disabled: AtomicBool::new(false),
        }
    }
}

impl<N: NetworkService + ?Sized> Clone for Client<N> {
    fn clone(&self) -> Self {
        Self {
            cache: Arc::clone(&self.cache),
            network: Arc::clone(&self.network),
            config: self.config.clone(),
            in_flight: Arc::clone(&self.in_flight),
            pushing: Arc::clone(&self.pushing),
        }
    }
}

impl<N: NetworkService + ?Sized> std::fmt::Debug for Client<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("cache", &self.cache)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
