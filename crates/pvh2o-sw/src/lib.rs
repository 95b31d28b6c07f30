//! # pvh2o Service Worker
//!
//! The pvh2o service worker and the runtime that hosts it.
//!
//! ## Features
//!
//! - **Install**: pre-caches a fixed asset list into the `pvh2o-v1` cache
//! - **Fetch**: network first, falling back to any cache on network failure
//! - **Lifecycle**: installing, waiting and active workers per scope
//! - **Cache API**: `caches.open()`, `cache.addAll()`, `caches.match()`
//! - **Persistence**: cache storage saved to and restored from disk
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerHost (config, persistence)
//!     │
//!     └── ServiceWorkerContainer
//!             ├── ServiceWorkerRegistration (per scope)
//!             │       ├── installing / waiting / active (ServiceWorker)
//!             │       └── script: Arc<dyn ServiceWorkerScript> (Pvh2oWorker)
//!             └── WorkerGlobalScope
//!                     ├── caches: Caches ── CacheStorage ── Cache ── CacheKey → CacheEntry
//!                     └── fetcher: Arc<dyn Fetcher>
//! ```

use thiserror::Error;

pub mod cache;
pub mod container;
pub mod events;
pub mod host;
pub mod persist;
pub mod script;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::{Cache, CacheEntry, CacheHandle, CacheKey, CacheStorage, Caches, StoredHeader};
pub use container::{RegistrationInfo, ServiceWorkerContainer, ServiceWorkerEvent};
pub use events::{FetchEvent, FetchResolution, InstallEvent};
pub use host::ServiceWorkerHost;
pub use script::{network_first, precache, Pvh2oWorker, ServiceWorkerScript, WorkerGlobalScope};
pub use worker::{
    RegistrationOptions, ServiceWorker, ServiceWorkerId, ServiceWorkerRegistration,
    ServiceWorkerState,
};

/// Errors that can occur in service worker operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceWorkerError {
    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Install failed: {0}")]
    InstallFailed(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("State error: {0}")]
    State(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl From<pvh2o_net::NetError> for ServiceWorkerError {
    fn from(err: pvh2o_net::NetError) -> Self {
        Self::Network(err.to_string())
    }
}

impl From<pvh2o_common::ConfigError> for ServiceWorkerError {
    fn from(err: pvh2o_common::ConfigError) -> Self {
        Self::RegistrationFailed(err.to_string())
    }
}
