//! Host runtime wiring: config in, a running container out.

use std::sync::Arc;
use std::time::Duration;

use pvh2o_common::WorkerConfig;
use pvh2o_net::{Fetcher, HttpFetcher, LoaderConfig, Request, Response};
use tokio::sync::mpsc;
use tracing::{info, warn};
use url::Url;

use crate::cache::{CacheStorage, Caches};
use crate::container::{ServiceWorkerContainer, ServiceWorkerEvent};
use crate::persist::{load_registrations, save_registrations, RegistrationRecord};
use crate::script::Pvh2oWorker;
use crate::worker::RegistrationOptions;
use crate::ServiceWorkerError;

/// Script path the pvh2o worker is registered under, relative to the origin.
pub const SCRIPT_PATH: &str = "/sw.js";

/// Owns the container for one origin and persists its caches and its active
/// registration.
pub struct ServiceWorkerHost {
    config: WorkerConfig,
    container: ServiceWorkerContainer,
}

impl ServiceWorkerHost {
    /// Start a host that fetches over HTTP.
    pub async fn start(
        config: WorkerConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>), ServiceWorkerError> {
        config.validate()?;
        let fetcher = HttpFetcher::new(LoaderConfig {
            user_agent: config.user_agent.clone(),
            default_timeout: Duration::from_secs(config.request_timeout_secs),
            max_redirects: config.max_redirects,
        })?;
        Self::with_fetcher(config, Arc::new(fetcher)).await
    }

    /// Start a host on top of an existing fetcher. Caches and the active
    /// registration are restored from `cache_dir` when one is configured; a
    /// restored worker controls its scope without installing again.
    pub async fn with_fetcher(
        config: WorkerConfig,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>), ServiceWorkerError> {
        config.validate()?;
        let (storage, records) = match config.cache_dir {
            Some(ref dir) => (CacheStorage::load(dir).await?, load_registrations(dir).await?),
            None => (CacheStorage::new(), Vec::new()),
        };
        let caches = Caches::with_storage(storage, Arc::clone(&fetcher));
        let (container, events) = ServiceWorkerContainer::new(caches, fetcher);
        let host = Self { config, container };

        let script_url = host.script_url()?;
        for record in records {
            if record.script_url != script_url.as_str() {
                warn!(script = %record.script_url, "Skipping registration for another script");
                continue;
            }
            let script = Arc::new(Pvh2oWorker::new(&host.config)?);
            host.container
                .restore(&record.scope, &record.script_url, script)
                .await?;
        }

        info!(origin = %host.config.origin, cache = %host.config.cache_name, "Service worker host started");
        Ok((host, events))
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn container(&self) -> &ServiceWorkerContainer {
        &self.container
    }

    pub fn caches(&self) -> &Caches {
        self.container.caches()
    }

    pub fn script_url(&self) -> Result<Url, ServiceWorkerError> {
        let origin = self.config.origin_url()?;
        origin
            .join(SCRIPT_PATH)
            .map_err(|e| ServiceWorkerError::RegistrationFailed(e.to_string()))
    }

    /// Register the pvh2o worker (installing it) and persist the result.
    pub async fn install(&self) -> Result<String, ServiceWorkerError> {
        let script = Arc::new(Pvh2oWorker::new(&self.config)?);
        let script_url = self.script_url()?;
        let scope = self
            .container
            .register(script_url.as_str(), script, RegistrationOptions::default())
            .await?;
        self.persist().await?;
        Ok(scope)
    }

    /// Issue a request as a controlled page would.
    pub async fn fetch(&self, request: Request) -> Result<Response, ServiceWorkerError> {
        self.container.fetch(request).await
    }

    /// Write caches and active registrations to `cache_dir`, if configured.
    pub async fn persist(&self) -> Result<(), ServiceWorkerError> {
        let Some(ref dir) = self.config.cache_dir else {
            return Ok(());
        };
        self.caches().save(dir).await?;

        let records: Vec<RegistrationRecord> = self
            .container
            .active_registrations()
            .await
            .into_iter()
            .map(|(scope, script_url)| RegistrationRecord {
                scope,
                script_url: script_url.to_string(),
            })
            .collect();
        save_registrations(dir, &records).await
    }
}
