//! In-memory fetcher for unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use http::{HeaderMap, StatusCode};
use pvh2o_net::{Fetcher, NetError, Request, Response};

/// Answers requests by URL path from a fixed table.
///
/// Unknown paths get a 404. Paths marked with [`ScriptedFetcher::reject`],
/// or every path while offline, reject like a dropped connection.
#[derive(Default)]
pub struct ScriptedFetcher {
    routes: Mutex<HashMap<String, (u16, Vec<u8>)>>,
    rejected: Mutex<HashSet<String>>,
    offline: AtomicBool,
    calls: AtomicUsize,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, path: &str, status: u16, body: &str) -> Self {
        self.routes
            .lock()
            .unwrap()
            .insert(path.to_string(), (status, body.as_bytes().to_vec()));
        self
    }

    pub fn set_body(&self, path: &str, body: &str) {
        let mut routes = self.routes.lock().unwrap();
        let route = routes.entry(path.to_string()).or_insert((200, Vec::new()));
        route.1 = body.as_bytes().to_vec();
    }

    pub fn reject(&self, path: &str) {
        self.rejected.lock().unwrap().insert(path.to_string());
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let path = request.url.path().to_string();

        if self.offline.load(Ordering::SeqCst) {
            return Err(NetError::Offline);
        }
        if self.rejected.lock().unwrap().contains(&path) {
            return Err(NetError::RequestFailed(format!("connection reset: {path}")));
        }

        let (status, body) = self
            .routes
            .lock()
            .unwrap()
            .get(&path)
            .cloned()
            .unwrap_or((404, Vec::new()));

        Ok(Response::new(
            request.url,
            StatusCode::from_u16(status).unwrap(),
            HeaderMap::new(),
            body,
        ))
    }
}
