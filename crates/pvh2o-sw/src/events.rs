//! Lifecycle events dispatched to worker scripts.
//!
//! Handlers run synchronously and hand the host a future through
//! [`InstallEvent::wait_until`] or [`FetchEvent::respond_with`]. The host
//! awaits that future before it treats the event as finished.

use std::future::Future;

use futures::future::{try_join_all, BoxFuture};
use pvh2o_net::{Request, Response};

use crate::ServiceWorkerError;

// ==================== Install ====================

/// The install lifecycle event.
#[derive(Default)]
pub struct InstallEvent {
    pending: Vec<BoxFuture<'static, Result<(), ServiceWorkerError>>>,
}

impl InstallEvent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold installation open until `future` settles. A rejection fails the
    /// install.
    pub fn wait_until<F>(&mut self, future: F)
    where
        F: Future<Output = Result<(), ServiceWorkerError>> + Send + 'static,
    {
        self.pending.push(Box::pin(future));
    }

    /// Number of futures extending the event's lifetime.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Await every extension; fails with the first rejection.
    pub async fn settle(self) -> Result<(), ServiceWorkerError> {
        try_join_all(self.pending).await.map(|_| ())
    }
}

impl std::fmt::Debug for InstallEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstallEvent")
            .field("pending", &self.pending.len())
            .finish()
    }
}

// ==================== Fetch ====================

/// How a fetch event was answered.
#[derive(Debug, Clone)]
pub enum FetchResolution {
    /// The live network response, whatever its status.
    Network(Response),
    /// A stored response, used after the network rejected.
    Cache(Response),
    /// Network rejected and nothing was cached.
    None,
}

impl FetchResolution {
    pub fn response(&self) -> Option<&Response> {
        match self {
            Self::Network(response) | Self::Cache(response) => Some(response),
            Self::None => None,
        }
    }

    pub fn into_response(self) -> Option<Response> {
        match self {
            Self::Network(response) | Self::Cache(response) => Some(response),
            Self::None => None,
        }
    }

    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    pub fn is_cache(&self) -> bool {
        matches!(self, Self::Cache(_))
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

/// The fetch lifecycle event.
pub struct FetchEvent {
    request: Request,
    client_id: Option<String>,
    response: Option<BoxFuture<'static, FetchResolution>>,
}

impl FetchEvent {
    pub fn new(request: Request, client_id: Option<String>) -> Self {
        Self {
            request,
            client_id,
            response: None,
        }
    }

    /// The intercepted request.
    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    /// Take over response production. Calling this twice is a state error.
    pub fn respond_with<F>(&mut self, future: F) -> Result<(), ServiceWorkerError>
    where
        F: Future<Output = FetchResolution> + Send + 'static,
    {
        if self.response.is_some() {
            return Err(ServiceWorkerError::State(
                "respond_with already called for this event".to_string(),
            ));
        }
        self.response = Some(Box::pin(future));
        Ok(())
    }

    /// Whether a handler called `respond_with`.
    pub fn is_handled(&self) -> bool {
        self.response.is_some()
    }

    /// Split into the request and the handler's response future, if any.
    pub fn into_parts(self) -> (Request, Option<BoxFuture<'static, FetchResolution>>) {
        (self.request, self.response)
    }
}

impl std::fmt::Debug for FetchEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchEvent")
            .field("url", &self.request.url.as_str())
            .field("client_id", &self.client_id)
            .field("handled", &self.is_handled())
            .finish()
    }
}
