//! Cache API: `caches.open()`, `cache.addAll()`, `caches.match()`.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use futures::future::try_join_all;
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use pvh2o_net::{Fetcher, Request, Response};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, trace};
use url::Url;

use crate::ServiceWorkerError;

// ==================== Keys & Entries ====================

/// Cache key: request method plus URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub method: String,
    pub url: String,
}

impl CacheKey {
    pub fn new(method: &Method, url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            method: method.as_str().to_string(),
            url: url.into(),
        }
    }

    pub fn for_request(request: &Request) -> Self {
        Self::new(&request.method, &request.url)
    }
}

/// A stored response header. The value is kept as raw bytes, since header
/// values need not be UTF-8.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredHeader {
    pub name: String,
    #[serde(with = "bytes_base64")]
    pub value: Vec<u8>,
}

/// A stored response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Response URL (after redirects).
    pub url: String,

    /// Response status.
    pub status: u16,

    /// Response headers, in received order.
    pub headers: Vec<StoredHeader>,

    /// Response body.
    #[serde(with = "bytes_base64")]
    pub body: Vec<u8>,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Capture a network response for storage.
    pub fn from_response(response: &Response) -> Self {
        let headers = response
            .headers
            .iter()
            .map(|(name, value)| StoredHeader {
                name: name.as_str().to_string(),
                value: value.as_bytes().to_vec(),
            })
            .collect();

        Self {
            url: response.url.to_string(),
            status: response.status.as_u16(),
            headers,
            body: response.body().to_vec(),
            cached_at: now_millis(),
        }
    }

    /// Rebuild a response from the stored entry.
    pub fn to_response(&self) -> Result<Response, ServiceWorkerError> {
        let url = Url::parse(&self.url)
            .map_err(|e| ServiceWorkerError::Cache(format!("stored URL {}: {}", self.url, e)))?;
        let status = StatusCode::from_u16(self.status)
            .map_err(|e| ServiceWorkerError::Cache(format!("stored status {}: {}", self.status, e)))?;

        let mut headers = HeaderMap::new();
        for header in &self.headers {
            let name = HeaderName::try_from(header.name.as_str())
                .map_err(|e| ServiceWorkerError::Cache(format!("stored header {}: {}", header.name, e)))?;
            let value = HeaderValue::from_bytes(&header.value)
                .map_err(|e| ServiceWorkerError::Cache(format!("stored header {}: {}", header.name, e)))?;
            headers.append(name, value);
        }

        Ok(Response::new(url, status, headers, self.body.clone()))
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

mod bytes_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

// ==================== Cache ====================

/// A named cache container.
#[derive(Debug, Default, Clone)]
pub struct Cache {
    name: String,
    entries: HashMap<CacheKey, CacheEntry>,
}

impl Cache {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up the entry for a key.
    pub fn get(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Store an entry, replacing any previous one for the same key.
    pub fn insert(&mut self, key: CacheKey, entry: CacheEntry) -> Option<CacheEntry> {
        self.entries.insert(key, entry)
    }

    /// Delete entry.
    pub fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        self.entries.remove(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &CacheKey> {
        self.entries.keys()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&CacheKey, &CacheEntry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ==================== Cache Storage ====================

/// The set of named caches, kept in creation order.
#[derive(Debug, Default, Clone)]
pub struct CacheStorage {
    caches: Vec<Cache>,
}

impl CacheStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a cache, creating it if it doesn't exist.
    pub fn open(&mut self, name: &str) -> &mut Cache {
        let index = match self.caches.iter().position(|c| c.name == name) {
            Some(index) => index,
            None => {
                debug!(cache = name, "Creating cache");
                self.caches.push(Cache::new(name));
                self.caches.len() - 1
            }
        };
        &mut self.caches[index]
    }

    pub fn get(&self, name: &str) -> Option<&Cache> {
        self.caches.iter().find(|c| c.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Cache> {
        self.caches.iter_mut().find(|c| c.name == name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Delete a cache.
    pub fn delete(&mut self, name: &str) -> bool {
        let before = self.caches.len();
        self.caches.retain(|c| c.name != name);
        self.caches.len() != before
    }

    /// Cache names in creation order.
    pub fn keys(&self) -> Vec<&str> {
        self.caches.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn caches(&self) -> &[Cache] {
        &self.caches
    }

    /// Match across all caches, oldest first.
    pub fn match_key(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.caches.iter().find_map(|cache| cache.get(key))
    }

    pub(crate) fn push(&mut self, cache: Cache) {
        self.caches.retain(|c| c.name != cache.name);
        self.caches.push(cache);
    }
}

// ==================== Shared handles ====================

/// The `caches` global: cache storage shared between the host and every
/// worker invocation, plus the fetcher used by `add`/`addAll`.
#[derive(Clone)]
pub struct Caches {
    storage: Arc<RwLock<CacheStorage>>,
    fetcher: Arc<dyn Fetcher>,
}

impl Caches {
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
        Self::with_storage(CacheStorage::new(), fetcher)
    }

    pub fn with_storage(storage: CacheStorage, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            storage: Arc::new(RwLock::new(storage)),
            fetcher,
        }
    }

    /// Open (or create) a cache by name.
    pub async fn open(&self, name: &str) -> Result<CacheHandle, ServiceWorkerError> {
        if name.is_empty() {
            return Err(ServiceWorkerError::Cache("cache name must not be empty".to_string()));
        }
        self.storage.write().await.open(name);
        Ok(CacheHandle {
            name: name.to_string(),
            caches: self.clone(),
        })
    }

    pub async fn has(&self, name: &str) -> bool {
        self.storage.read().await.has(name)
    }

    pub async fn delete(&self, name: &str) -> bool {
        self.storage.write().await.delete(name)
    }

    pub async fn keys(&self) -> Vec<String> {
        self.storage
            .read()
            .await
            .keys()
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    /// Find a stored response for `request` in any cache.
    pub async fn match_request(&self, request: &Request) -> Option<Response> {
        let key = CacheKey::for_request(request);
        let storage = self.storage.read().await;
        let entry = storage.match_key(&key)?;
        trace!(url = %key.url, "Cache hit");
        // An entry that can no longer be turned into a response counts as a miss.
        entry.to_response().ok()
    }

    /// Copy of the current storage, for persistence and inspection.
    pub async fn snapshot(&self) -> CacheStorage {
        self.storage.read().await.clone()
    }
}

impl std::fmt::Debug for Caches {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Caches").finish_non_exhaustive()
    }
}

/// An opened cache.
#[derive(Debug, Clone)]
pub struct CacheHandle {
    name: String,
    caches: Caches,
}

impl CacheHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fetch every URL and store the responses.
    ///
    /// All-or-nothing: if any fetch rejects or returns a non-2xx status,
    /// nothing is stored and the whole call fails.
    pub async fn add_all(&self, urls: &[Url]) -> Result<(), ServiceWorkerError> {
        let requests: Vec<Request> = urls.iter().cloned().map(Request::get).collect();
        let fetches = requests.iter().map(|request| {
            let fetcher = Arc::clone(&self.caches.fetcher);
            let request = request.clone();
            async move {
                let url = request.url.clone();
                let response = fetcher
                    .fetch(request)
                    .await
                    .map_err(|e| ServiceWorkerError::Network(format!("{url}: {e}")))?;
                if !response.ok() {
                    return Err(ServiceWorkerError::Network(format!(
                        "{url}: bad status {}",
                        response.status
                    )));
                }
                Ok::<_, ServiceWorkerError>(response)
            }
        });

        let responses = try_join_all(fetches).await?;

        let mut storage = self.caches.storage.write().await;
        let cache = storage.get_mut(&self.name).ok_or_else(|| self.deleted())?;
        for (request, response) in requests.iter().zip(&responses) {
            cache.insert(CacheKey::for_request(request), CacheEntry::from_response(response));
        }

        info!(cache = %self.name, count = responses.len(), "Stored responses");
        Ok(())
    }

    /// Fetch a single URL and store it.
    pub async fn add(&self, url: Url) -> Result<(), ServiceWorkerError> {
        self.add_all(std::slice::from_ref(&url)).await
    }

    /// Store a response for a request. Fails if the cache has been deleted.
    pub async fn put(&self, request: &Request, response: &Response) -> Result<(), ServiceWorkerError> {
        if request.method != Method::GET {
            return Err(ServiceWorkerError::Cache(format!(
                "cannot cache {} request",
                request.method
            )));
        }
        let mut storage = self.caches.storage.write().await;
        let cache = storage.get_mut(&self.name).ok_or_else(|| self.deleted())?;
        cache.insert(CacheKey::for_request(request), CacheEntry::from_response(response));
        Ok(())
    }

    /// Remove the entry for a request. Returns whether one existed.
    pub async fn delete(&self, request: &Request) -> bool {
        let key = CacheKey::for_request(request);
        let mut storage = self.caches.storage.write().await;
        storage
            .get_mut(&self.name)
            .is_some_and(|cache| cache.remove(&key).is_some())
    }

    /// Match within this cache only.
    pub async fn match_request(&self, request: &Request) -> Option<Response> {
        let key = CacheKey::for_request(request);
        let storage = self.caches.storage.read().await;
        let entry = storage.get(&self.name)?.get(&key)?;
        entry.to_response().ok()
    }

    pub async fn keys(&self) -> Vec<CacheKey> {
        let storage = self.caches.storage.read().await;
        storage
            .get(&self.name)
            .map(|cache| cache.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn len(&self) -> usize {
        let storage = self.caches.storage.read().await;
        storage.get(&self.name).map_or(0, Cache::len)
    }

    fn deleted(&self) -> ServiceWorkerError {
        ServiceWorkerError::Cache(format!("cache {} has been deleted", self.name))
    }
}
