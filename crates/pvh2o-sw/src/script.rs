//! Worker scripts: the handler interface and the pvh2o worker itself.

use std::sync::Arc;

use pvh2o_common::{ConfigError, WorkerConfig};
use pvh2o_net::{Fetcher, NetError, Request, Response};
use tracing::{debug, debug_span, info_span, Instrument};
use url::Url;

use crate::cache::Caches;
use crate::events::{FetchEvent, FetchResolution, InstallEvent};
use crate::ServiceWorkerError;

/// What a worker script can reach: the `caches` global and `fetch()`.
#[derive(Clone)]
pub struct WorkerGlobalScope {
    caches: Caches,
    fetcher: Arc<dyn Fetcher>,
}

impl WorkerGlobalScope {
    pub fn new(caches: Caches, fetcher: Arc<dyn Fetcher>) -> Self {
        Self { caches, fetcher }
    }

    pub fn caches(&self) -> &Caches {
        &self.caches
    }

    pub fn fetcher(&self) -> Arc<dyn Fetcher> {
        Arc::clone(&self.fetcher)
    }

    /// `fetch()` from inside the worker.
    pub async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        self.fetcher.fetch(request).await
    }
}

impl std::fmt::Debug for WorkerGlobalScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerGlobalScope")
            .field("caches", &self.caches)
            .finish_non_exhaustive()
    }
}

/// Event handlers a worker registers, one per lifecycle event.
///
/// Handlers run synchronously; asynchronous work is handed to the host through
/// `wait_until` / `respond_with`. Returning an error from a handler is the
/// equivalent of a listener throwing.
pub trait ServiceWorkerScript: Send + Sync {
    fn on_install(
        &self,
        scope: &WorkerGlobalScope,
        event: &mut InstallEvent,
    ) -> Result<(), ServiceWorkerError>;

    fn on_fetch(
        &self,
        scope: &WorkerGlobalScope,
        event: &mut FetchEvent,
    ) -> Result<(), ServiceWorkerError>;

    /// Messages posted by a controlled page. Ignored unless overridden.
    fn on_message(&self, _scope: &WorkerGlobalScope, _data: &str) {}
}

/// Open `cache_name` and store every URL in it, all or nothing.
pub async fn precache(
    caches: &Caches,
    cache_name: &str,
    urls: &[Url],
) -> Result<(), ServiceWorkerError> {
    let cache = caches.open(cache_name).await?;
    cache.add_all(urls).await
}

/// Try the network; if it rejects, answer from any cache.
///
/// A resolved network response is returned whatever its status.
pub async fn network_first(
    fetcher: &dyn Fetcher,
    caches: &Caches,
    request: Request,
) -> FetchResolution {
    match fetcher.fetch(request.clone()).await {
        Ok(response) => FetchResolution::Network(response),
        Err(e) => {
            debug!(url = %request.url, error = %e, "Network failed, falling back to cache");
            match caches.match_request(&request).await {
                Some(response) => FetchResolution::Cache(response),
                None => {
                    debug!(url = %request.url, "No cached response");
                    FetchResolution::None
                }
            }
        }
    }
}

/// The pvh2o worker: pre-cache on install, network first on fetch.
#[derive(Debug, Clone)]
pub struct Pvh2oWorker {
    cache_name: String,
    precache_urls: Vec<Url>,
}

impl Pvh2oWorker {
    pub fn new(config: &WorkerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            cache_name: config.cache_name.clone(),
            precache_urls: config.precache_request_urls()?,
        })
    }

    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    pub fn precache_urls(&self) -> &[Url] {
        &self.precache_urls
    }
}

impl ServiceWorkerScript for Pvh2oWorker {
    fn on_install(
        &self,
        scope: &WorkerGlobalScope,
        event: &mut InstallEvent,
    ) -> Result<(), ServiceWorkerError> {
        let caches = scope.caches().clone();
        let cache_name = self.cache_name.clone();
        let urls = self.precache_urls.clone();
        let span = info_span!("install", cache = %cache_name, urls = urls.len());

        event.wait_until(
            async move { precache(&caches, &cache_name, &urls).await }.instrument(span),
        );
        Ok(())
    }

    fn on_fetch(
        &self,
        scope: &WorkerGlobalScope,
        event: &mut FetchEvent,
    ) -> Result<(), ServiceWorkerError> {
        let caches = scope.caches().clone();
        let fetcher = scope.fetcher();
        let request = event.request().clone();
        let span = debug_span!("fetch", url = %request.url, method = %request.method);

        event.respond_with(
            async move { network_first(fetcher.as_ref(), &caches, request).await }.instrument(span),
        )
    }
}
