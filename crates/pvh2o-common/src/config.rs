//! Worker configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

/// Name of the cache container the worker populates on install.
pub const DEFAULT_CACHE_NAME: &str = "pvh2o-v1";

/// Static assets fetched and stored on install, in order.
pub const DEFAULT_PRECACHE_URLS: &[&str] = &[
    "/static/css/themes.css",
    "/static/icon.png",
    "/static/manifest.json",
];

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid origin: {0}")]
    InvalidOrigin(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Configuration handed to the worker and its host at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Cache container name; bumping it is the only way to invalidate entries.
    pub cache_name: String,

    /// Paths pre-cached on install, resolved against `origin`.
    pub precache_urls: Vec<String>,

    /// Origin the worker is served from
    pub origin: String,

    /// User agent sent on network fetches
    pub user_agent: String,

    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,

    /// Maximum redirects followed per request
    pub max_redirects: usize,

    /// Directory cache storage is persisted to, if any
    pub cache_dir: Option<PathBuf>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            cache_name: DEFAULT_CACHE_NAME.to_string(),
            precache_urls: DEFAULT_PRECACHE_URLS.iter().map(|s| s.to_string()).collect(),
            origin: "http://localhost:5000".to_string(),
            user_agent: format!("pvh2o-sw/{}", env!("CARGO_PKG_VERSION")),
            request_timeout_secs: 30,
            max_redirects: 10,
            cache_dir: None,
        }
    }
}

impl WorkerConfig {
    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    /// Check the config is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_name.trim().is_empty() {
            return Err(ConfigError::Invalid("cache_name must not be empty".to_string()));
        }
        self.origin_url()?;
        Ok(())
    }

    /// The parsed origin URL.
    pub fn origin_url(&self) -> Result<Url, ConfigError> {
        let url = Url::parse(&self.origin)
            .map_err(|e| ConfigError::InvalidOrigin(format!("{}: {}", self.origin, e)))?;
        if url.cannot_be_a_base() {
            return Err(ConfigError::InvalidOrigin(self.origin.clone()));
        }
        Ok(url)
    }

    /// Resolve the pre-cache list against the origin.
    pub fn precache_request_urls(&self) -> Result<Vec<Url>, ConfigError> {
        let origin = self.origin_url()?;
        self.precache_urls
            .iter()
            .map(|path| {
                origin
                    .join(path)
                    .map_err(|e| ConfigError::Invalid(format!("{path}: {e}")))
            })
            .collect()
    }
}
