//! tusstore library: resumable-upload (tus 1.0.0) server backed by a
//! durable object store.
//!
//! This crate provides the per-upload coordinator, the retry-hardened
//! storage layer with its pluggable backends, the range-aware read path
//! with an edge cache, and the axum router that exposes them over HTTP.

use std::sync::Arc;
use std::time::Duration;

pub mod cache;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod metrics;
pub mod range;
pub mod read;
pub mod server;
pub mod storage;
pub mod tus;

use crate::cache::{EdgeCache, MemoryEdgeCache};
use crate::config::Config;
use crate::read::ObjectReader;
use crate::storage::backend::StorageBackend;
use crate::tus::coordinator::UploadCoordinator;

/// Shared application state passed to all handlers via `axum::extract::State`.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// Serializes upload mutations and finalizes completed uploads.
    pub uploads: Arc<UploadCoordinator>,
    /// Serves completed uploads through the edge cache.
    pub reader: Arc<ObjectReader>,
}

impl AppState {
    /// Wire the coordinator and read path over `store`.
    pub fn new(config: Config, store: Arc<dyn StorageBackend>) -> Self {
        let uploads = Arc::new(UploadCoordinator::new(
            store.clone(),
            config.uploads.coordinator_config(),
        ));
        let cache: Option<Arc<dyn EdgeCache>> = if config.cache.enabled {
            Some(Arc::new(MemoryEdgeCache::new(
                Duration::from_secs(config.cache.ttl_seconds),
                config.cache.max_entries,
                config.cache.max_bytes,
            )))
        } else {
            None
        };
        let reader = Arc::new(ObjectReader::new(store, cache));
        Self {
            config,
            uploads,
            reader,
        }
    }
}
