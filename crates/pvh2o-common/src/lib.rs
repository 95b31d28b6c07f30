//! # pvh2o Common
//!
//! Shared plumbing for the pvh2o service worker crates.
//!
//! ## Features
//!
//! - Logging configuration and setup on top of `tracing-subscriber`
//! - Worker configuration (cache name, pre-cache list, network settings)

pub mod config;
pub mod logging;

pub use config::{ConfigError, WorkerConfig, DEFAULT_CACHE_NAME, DEFAULT_PRECACHE_URLS};
pub use logging::{init_logging, try_init_logging, LogConfig, LogFormat};
