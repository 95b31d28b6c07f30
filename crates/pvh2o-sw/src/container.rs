//! Service worker container: registers workers and dispatches their events.

use std::sync::Arc;

use hashbrown::HashMap;
use pvh2o_net::{Fetcher, Request, Response};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::Caches;
use crate::events::{FetchEvent, FetchResolution, InstallEvent};
use crate::script::{ServiceWorkerScript, WorkerGlobalScope};
use crate::worker::{
    RegistrationOptions, ServiceWorker, ServiceWorkerId, ServiceWorkerRegistration,
    ServiceWorkerState,
};
use crate::ServiceWorkerError;

/// Lifecycle notifications published by the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceWorkerEvent {
    /// A worker changed state.
    StateChange {
        registration_scope: String,
        worker_id: ServiceWorkerId,
        new_state: ServiceWorkerState,
    },
    /// A new worker started installing.
    UpdateFound { registration_scope: String },
    /// A new worker now answers fetches for the scope.
    ControllerChange {
        registration_scope: String,
        worker_id: ServiceWorkerId,
    },
}

/// Worker ids currently held by a registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationInfo {
    pub scope: String,
    pub installing: Option<ServiceWorkerId>,
    pub waiting: Option<ServiceWorkerId>,
    pub active: Option<ServiceWorkerId>,
}

/// Service worker container (`navigator.serviceWorker` plus the host side of
/// event dispatch).
pub struct ServiceWorkerContainer {
    registrations: Arc<RwLock<HashMap<String, ServiceWorkerRegistration>>>,
    global: WorkerGlobalScope,
    event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl ServiceWorkerContainer {
    pub fn new(
        caches: Caches,
        fetcher: Arc<dyn Fetcher>,
    ) -> (Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        (
            Self {
                registrations: Arc::new(RwLock::new(HashMap::new())),
                global: WorkerGlobalScope::new(caches, fetcher),
                event_tx,
            },
            event_rx,
        )
    }

    pub fn caches(&self) -> &Caches {
        self.global.caches()
    }

    pub fn global_scope(&self) -> &WorkerGlobalScope {
        &self.global
    }

    fn emit(&self, event: ServiceWorkerEvent) {
        let _ = self.event_tx.send(event);
    }

    fn emit_state(&self, scope: &str, worker_id: ServiceWorkerId, new_state: ServiceWorkerState) {
        self.emit(ServiceWorkerEvent::StateChange {
            registration_scope: scope.to_string(),
            worker_id,
            new_state,
        });
    }

    /// Scope for a registration: explicit, or the script's directory. Must be
    /// same-origin with the script and inside the script's directory.
    fn resolve_scope(
        script_url: &Url,
        options: &RegistrationOptions,
    ) -> Result<Url, ServiceWorkerError> {
        let script_dir = script_url
            .join("./")
            .map_err(|e| ServiceWorkerError::RegistrationFailed(e.to_string()))?;

        let scope = match options.scope {
            Some(ref s) => script_url
                .join(s)
                .map_err(|e| ServiceWorkerError::RegistrationFailed(format!("{s}: {e}")))?,
            None => script_dir.clone(),
        };

        if scope.origin() != script_url.origin() {
            return Err(ServiceWorkerError::RegistrationFailed(format!(
                "scope {scope} is not same-origin with {script_url}"
            )));
        }
        if !scope.path().starts_with(script_dir.path()) {
            return Err(ServiceWorkerError::RegistrationFailed(format!(
                "scope {scope} is outside script directory {script_dir}"
            )));
        }
        Ok(scope)
    }

    /// Register a worker and run its install handler to completion.
    ///
    /// On success the worker is waiting, or active if the scope had no active
    /// worker. On failure the worker is redundant, any previously active worker
    /// keeps serving, and the install error is returned.
    pub async fn register(
        &self,
        script_url: &str,
        script: Arc<dyn ServiceWorkerScript>,
        options: RegistrationOptions,
    ) -> Result<String, ServiceWorkerError> {
        let script_url = Url::parse(script_url)
            .map_err(|e| ServiceWorkerError::RegistrationFailed(format!("{script_url}: {e}")))?;
        let scope = Self::resolve_scope(&script_url, &options)?;
        let scope_key = scope.to_string();

        let worker = ServiceWorker::new(script_url, Arc::clone(&script));
        let worker_id = worker.id;

        {
            let mut registrations = self.registrations.write().await;
            let registration = registrations
                .entry(scope_key.clone())
                .or_insert_with(|| ServiceWorkerRegistration::new(scope));
            if let Some(superseded) = registration.start_install(worker) {
                self.emit_state(&scope_key, superseded.id, ServiceWorkerState::Redundant);
            }
        }
        self.emit(ServiceWorkerEvent::UpdateFound {
            registration_scope: scope_key.clone(),
        });
        self.emit_state(&scope_key, worker_id, ServiceWorkerState::Installing);
        info!(scope = %scope_key, worker = worker_id.raw(), "Installing service worker");

        // The registrations lock is not held while the install runs.
        let mut event = InstallEvent::new();
        let outcome = match script.on_install(&self.global, &mut event) {
            Ok(()) => event.settle().await,
            Err(e) => Err(e),
        };

        let mut registrations = self.registrations.write().await;
        let registration = registrations.get_mut(&scope_key).ok_or_else(|| {
            ServiceWorkerError::InstallFailed(format!("{scope_key} was unregistered during install"))
        })?;

        // A later register() on the same scope replaced this worker while it
        // was installing; it is already redundant.
        if registration.installing().map(|w| w.id) != Some(worker_id) {
            info!(scope = %scope_key, worker = worker_id.raw(), "Install superseded");
            return Err(ServiceWorkerError::InstallFailed(format!(
                "worker {} was superseded by a newer registration",
                worker_id.raw()
            )));
        }

        match outcome {
            Ok(()) => {
                registration.install_complete(worker_id)?;
                self.emit_state(&scope_key, worker_id, ServiceWorkerState::Installed);
                info!(scope = %scope_key, worker = worker_id.raw(), "Service worker installed");

                if registration.active().is_none() {
                    self.promote(&scope_key, registration);
                }
                Ok(scope_key)
            }
            Err(e) => {
                warn!(scope = %scope_key, worker = worker_id.raw(), error = %e, "Service worker install failed");
                registration.install_failed(worker_id, e.to_string())?;
                self.emit_state(&scope_key, worker_id, ServiceWorkerState::Redundant);

                let empty = registration.active().is_none()
                    && registration.waiting().is_none()
                    && registration.installing().is_none();
                if empty {
                    registrations.remove(&scope_key);
                }
                Err(ServiceWorkerError::InstallFailed(e.to_string()))
            }
        }
    }

    fn promote(&self, scope: &str, registration: &mut ServiceWorkerRegistration) -> bool {
        let old = registration.active().map(|w| w.id);
        let Some(worker_id) = registration.activate() else {
            return false;
        };
        if let Some(old) = old {
            self.emit_state(scope, old, ServiceWorkerState::Redundant);
        }
        self.emit_state(scope, worker_id, ServiceWorkerState::Activated);
        self.emit(ServiceWorkerEvent::ControllerChange {
            registration_scope: scope.to_string(),
            worker_id,
        });
        info!(scope, worker = worker_id.raw(), "Service worker activated");
        true
    }

    /// Activate the waiting worker for a scope. Returns whether one was waiting.
    pub async fn activate(&self, scope: &str) -> Result<bool, ServiceWorkerError> {
        let mut registrations = self.registrations.write().await;
        let registration = registrations
            .get_mut(scope)
            .ok_or_else(|| ServiceWorkerError::NotFound(scope.to_string()))?;
        Ok(self.promote(scope, registration))
    }

    /// Reinstate an active worker for `scope` without running its install
    /// handler. Used to bring back registrations recorded before a restart.
    pub async fn restore(
        &self,
        scope: &str,
        script_url: &str,
        script: Arc<dyn ServiceWorkerScript>,
    ) -> Result<ServiceWorkerId, ServiceWorkerError> {
        let script_url = Url::parse(script_url)
            .map_err(|e| ServiceWorkerError::RegistrationFailed(format!("{script_url}: {e}")))?;
        let options = RegistrationOptions {
            scope: Some(scope.to_string()),
        };
        let scope = Self::resolve_scope(&script_url, &options)?;
        let scope_key = scope.to_string();

        let worker_id = {
            let mut registrations = self.registrations.write().await;
            let registration = registrations
                .entry(scope_key.clone())
                .or_insert_with(|| ServiceWorkerRegistration::new(scope));
            registration.restore_active(ServiceWorker::new(script_url, script))
        };

        self.emit_state(&scope_key, worker_id, ServiceWorkerState::Activated);
        self.emit(ServiceWorkerEvent::ControllerChange {
            registration_scope: scope_key.clone(),
            worker_id,
        });
        info!(scope = %scope_key, worker = worker_id.raw(), "Service worker restored");
        Ok(worker_id)
    }

    /// Scope and script URL of every registration with an active worker.
    pub async fn active_registrations(&self) -> Vec<(String, Url)> {
        let registrations = self.registrations.read().await;
        let mut active: Vec<(String, Url)> = registrations
            .iter()
            .filter_map(|(scope, r)| r.active().map(|w| (scope.clone(), w.script_url.clone())))
            .collect();
        active.sort_by(|a, b| a.0.cmp(&b.0));
        active
    }

    /// Scope of the registration controlling `url`, longest scope first.
    pub async fn get_registration(&self, url: &str) -> Option<String> {
        let url = Url::parse(url).ok()?;
        let registrations = self.registrations.read().await;
        registrations
            .values()
            .filter(|r| r.controls(&url))
            .max_by_key(|r| r.scope.as_str().len())
            .map(|r| r.scope.to_string())
    }

    /// Get all registration scopes.
    pub async fn get_registrations(&self) -> Vec<String> {
        self.registrations.read().await.keys().cloned().collect()
    }

    pub async fn registration_info(&self, scope: &str) -> Option<RegistrationInfo> {
        let registrations = self.registrations.read().await;
        let registration = registrations.get(scope)?;
        Some(RegistrationInfo {
            scope: scope.to_string(),
            installing: registration.installing().map(|w| w.id),
            waiting: registration.waiting().map(|w| w.id),
            active: registration.active().map(|w| w.id),
        })
    }

    /// Route a request through the controlling worker.
    ///
    /// Without an active worker, or when the worker does not call
    /// `respond_with`, the request goes straight to the network.
    pub async fn handle_fetch(&self, request: Request) -> Result<FetchResolution, ServiceWorkerError> {
        let controller = {
            let registrations = self.registrations.read().await;
            registrations
                .values()
                .filter(|r| r.controls(&request.url))
                .max_by_key(|r| r.scope.as_str().len())
                .and_then(|r| r.active())
                .map(|w| (Arc::clone(&w.script), w.id))
        };

        let Some((script, worker_id)) = controller else {
            debug!(url = %request.url, "No controlling worker, passthrough");
            return self.passthrough(request).await;
        };

        let mut event = FetchEvent::new(request, None);
        if let Err(e) = script.on_fetch(&self.global, &mut event) {
            warn!(worker = worker_id.raw(), error = %e, "Fetch handler failed");
        }

        let (request, response) = event.into_parts();
        match response {
            Some(response) => Ok(response.await),
            None => self.passthrough(request).await,
        }
    }

    async fn passthrough(&self, request: Request) -> Result<FetchResolution, ServiceWorkerError> {
        let response = self.global.fetch(request).await?;
        Ok(FetchResolution::Network(response))
    }

    /// Like [`handle_fetch`](Self::handle_fetch), but an absent response is a
    /// failed fetch, as the page would see it.
    pub async fn fetch(&self, request: Request) -> Result<Response, ServiceWorkerError> {
        let url = request.url.clone();
        self.handle_fetch(request)
            .await?
            .into_response()
            .ok_or_else(|| ServiceWorkerError::Network(format!("failed to fetch {url}")))
    }

    /// Deliver a message from a page to the scope's active worker.
    pub async fn post_message(&self, scope: &str, data: &str) -> Result<(), ServiceWorkerError> {
        let script = {
            let registrations = self.registrations.read().await;
            let registration = registrations
                .get(scope)
                .ok_or_else(|| ServiceWorkerError::NotFound(scope.to_string()))?;
            let worker = registration.active().ok_or_else(|| {
                ServiceWorkerError::State(format!("no active worker for {scope}"))
            })?;
            Arc::clone(&worker.script)
        };
        script.on_message(&self.global, data);
        Ok(())
    }

    /// Unregister a scope. Caches are left untouched.
    pub async fn unregister(&self, scope: &str) -> Result<bool, ServiceWorkerError> {
        let mut registrations = self.registrations.write().await;
        match registrations.remove(scope) {
            Some(mut registration) => {
                registration.unregister();
                info!(scope, "Service worker unregistered");
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
