//! Service worker instances and per-scope registrations.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::script::ServiceWorkerScript;
use crate::ServiceWorkerError;

// ==================== Types ====================

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceWorkerState {
    /// Script loaded, nothing dispatched yet.
    #[default]
    Parsed,
    /// Install event dispatched and not yet settled.
    Installing,
    /// Installed, waiting for activation.
    Installed,
    Activating,
    /// Active and receiving fetch events.
    Activated,
    /// Install failed, replaced or unregistered.
    Redundant,
}

impl std::fmt::Display for ServiceWorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Parsed => "parsed",
            Self::Installing => "installing",
            Self::Installed => "installed",
            Self::Activating => "activating",
            Self::Activated => "activated",
            Self::Redundant => "redundant",
        };
        f.write_str(name)
    }
}

// ==================== Service Worker ====================

/// A service worker instance.
#[derive(Clone)]
pub struct ServiceWorker {
    pub id: ServiceWorkerId,
    pub script_url: Url,
    pub state: ServiceWorkerState,
    /// The handlers this worker runs.
    pub script: Arc<dyn ServiceWorkerScript>,
    /// Why the worker became redundant, if it failed.
    pub error: Option<String>,
    pub state_changed_at: Instant,
}

impl ServiceWorker {
    pub fn new(script_url: Url, script: Arc<dyn ServiceWorkerScript>) -> Self {
        Self {
            id: ServiceWorkerId::new(),
            script_url,
            state: ServiceWorkerState::Parsed,
            script,
            error: None,
            state_changed_at: Instant::now(),
        }
    }

    pub fn set_state(&mut self, state: ServiceWorkerState) {
        debug!(worker = self.id.raw(), from = %self.state, to = %state, "Worker state change");
        self.state = state;
        self.state_changed_at = Instant::now();
    }

    pub fn is_active(&self) -> bool {
        self.state == ServiceWorkerState::Activated
    }

    pub fn is_redundant(&self) -> bool {
        self.state == ServiceWorkerState::Redundant
    }
}

impl std::fmt::Debug for ServiceWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceWorker")
            .field("id", &self.id)
            .field("script_url", &self.script_url.as_str())
            .field("state", &self.state)
            .field("error", &self.error)
            .finish()
    }
}

// ==================== Registration ====================

/// Options for service worker registration.
#[derive(Debug, Clone, Default)]
pub struct RegistrationOptions {
    /// Scope URL; defaults to the script's directory.
    pub scope: Option<String>,
}

/// A service worker registration.
#[derive(Debug)]
pub struct ServiceWorkerRegistration {
    pub scope: Url,
    installing: Option<ServiceWorker>,
    waiting: Option<ServiceWorker>,
    active: Option<ServiceWorker>,
}

impl ServiceWorkerRegistration {
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            installing: None,
            waiting: None,
            active: None,
        }
    }

    pub fn installing(&self) -> Option<&ServiceWorker> {
        self.installing.as_ref()
    }

    pub fn waiting(&self) -> Option<&ServiceWorker> {
        self.waiting.as_ref()
    }

    pub fn active(&self) -> Option<&ServiceWorker> {
        self.active.as_ref()
    }

    /// Whether `url` falls under this registration's scope.
    pub fn controls(&self, url: &Url) -> bool {
        url.as_str().starts_with(self.scope.as_str())
    }

    /// Begin installing `worker`. An older installing worker is superseded and
    /// returned as redundant.
    pub fn start_install(&mut self, mut worker: ServiceWorker) -> Option<ServiceWorker> {
        worker.set_state(ServiceWorkerState::Installing);
        let superseded = self.installing.replace(worker);
        superseded.map(|mut old| {
            old.set_state(ServiceWorkerState::Redundant);
            old
        })
    }

    /// Move the installing worker with `id` to waiting. A previously waiting
    /// worker becomes redundant.
    pub fn install_complete(&mut self, id: ServiceWorkerId) -> Result<(), ServiceWorkerError> {
        let mut worker = self.take_installing(id)?;
        worker.set_state(ServiceWorkerState::Installed);
        if let Some(mut old) = self.waiting.replace(worker) {
            old.set_state(ServiceWorkerState::Redundant);
        }
        Ok(())
    }

    /// Mark the installing worker with `id` redundant. The active worker is
    /// left in place.
    pub fn install_failed(
        &mut self,
        id: ServiceWorkerId,
        error: impl Into<String>,
    ) -> Result<ServiceWorker, ServiceWorkerError> {
        let mut worker = self.take_installing(id)?;
        worker.error = Some(error.into());
        worker.set_state(ServiceWorkerState::Redundant);
        Ok(worker)
    }

    fn take_installing(&mut self, id: ServiceWorkerId) -> Result<ServiceWorker, ServiceWorkerError> {
        match self.installing.take() {
            Some(worker) if worker.id == id => Ok(worker),
            other => {
                self.installing = other;
                Err(ServiceWorkerError::State(format!(
                    "worker {} is not installing",
                    id.raw()
                )))
            }
        }
    }

    /// Promote the waiting worker. Returns the id of the new active worker.
    pub fn activate(&mut self) -> Option<ServiceWorkerId> {
        let mut worker = self.waiting.take()?;
        worker.set_state(ServiceWorkerState::Activating);

        if let Some(mut old) = self.active.take() {
            old.set_state(ServiceWorkerState::Redundant);
        }

        worker.set_state(ServiceWorkerState::Activated);
        let id = worker.id;
        self.active = Some(worker);
        Some(id)
    }

    /// Make `worker` the active worker without installing it, as when a host
    /// restarts with a registration it recorded earlier.
    pub fn restore_active(&mut self, mut worker: ServiceWorker) -> ServiceWorkerId {
        worker.set_state(ServiceWorkerState::Activated);
        let id = worker.id;
        if let Some(mut old) = self.active.replace(worker) {
            old.set_state(ServiceWorkerState::Redundant);
        }
        id
    }

    /// Retire every worker.
    pub fn unregister(&mut self) {
        for slot in [&mut self.installing, &mut self.waiting, &mut self.active] {
            if let Some(mut worker) = slot.take() {
                worker.set_state(ServiceWorkerState::Redundant);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::Pvh2oWorker;
    use pvh2o_common::WorkerConfig;

    fn worker() -> ServiceWorker {
        let script = Arc::new(Pvh2oWorker::new(&WorkerConfig::default()).unwrap());
        ServiceWorker::new(Url::parse("https://pvh2o.example/static/sw.js").unwrap(), script)
    }

    fn registration() -> ServiceWorkerRegistration {
        ServiceWorkerRegistration::new(Url::parse("https://pvh2o.example/").unwrap())
    }

    #[test]
    fn test_service_worker_creation() {
        let worker = worker();
        assert_eq!(worker.state, ServiceWorkerState::Parsed);
        assert!(!worker.is_active());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ServiceWorkerState::Activated.to_string(), "activated");
        assert_eq!(ServiceWorkerState::Redundant.to_string(), "redundant");
    }

    #[test]
    fn test_registration_lifecycle() {
        let mut registration = registration();
        let worker = worker();
        let id = worker.id;

        registration.start_install(worker);
        assert_eq!(
            registration.installing().unwrap().state,
            ServiceWorkerState::Installing
        );

        registration.install_complete(id).unwrap();
        assert!(registration.installing().is_none());
        assert_eq!(registration.waiting().unwrap().state, ServiceWorkerState::Installed);

        assert_eq!(registration.activate(), Some(id));
        assert!(registration.waiting().is_none());
        assert!(registration.active().unwrap().is_active());
    }

    #[test]
    fn test_failed_install_keeps_active() {
        let mut registration = registration();
        let first = worker();
        let first_id = first.id;
        registration.start_install(first);
        registration.install_complete(first_id).unwrap();
        registration.activate();

        let second = worker();
        let second_id = second.id;
        registration.start_install(second);
        let failed = registration.install_failed(second_id, "offline").unwrap();

        assert!(failed.is_redundant());
        assert_eq!(failed.error.as_deref(), Some("offline"));
        assert_eq!(registration.active().unwrap().id, first_id);
    }

    #[test]
    fn test_superseded_install() {
        let mut registration = registration();
        let first = worker();
        let first_id = first.id;
        registration.start_install(first);

        let superseded = registration.start_install(worker()).unwrap();
        assert!(superseded.is_redundant());
        assert!(matches!(
            registration.install_complete(first_id),
            Err(ServiceWorkerError::State(_))
        ));
        assert!(registration.installing().is_some());
    }

    #[test]
    fn test_restore_active_skips_install() {
        let mut registration = registration();
        let id = registration.restore_active(worker());

        let active = registration.active().unwrap();
        assert_eq!(active.id, id);
        assert!(active.is_active());
        assert!(registration.installing().is_none());
        assert!(registration.waiting().is_none());
    }

    #[test]
    fn test_controls() {
        let registration = ServiceWorkerRegistration::new(
            Url::parse("https://pvh2o.example/static/").unwrap(),
        );
        assert!(registration.controls(&Url::parse("https://pvh2o.example/static/icon.png").unwrap()));
        assert!(!registration.controls(&Url::parse("https://pvh2o.example/dashboard").unwrap()));
    }

    #[test]
    fn test_unregister() {
        let mut registration = registration();
        let worker = worker();
        let id = worker.id;
        registration.start_install(worker);
        registration.install_complete(id).unwrap();
        registration.activate();

        registration.unregister();
        assert!(registration.active().is_none());
        assert!(registration.waiting().is_none());
    }
}
