//! reqwest-backed implementation of the network fetch API.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info, trace};

use crate::{Fetcher, NetError, Request, Response};

/// Loader configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// User agent string.
    pub user_agent: String,
    /// Default timeout.
    pub default_timeout: Duration,
    /// Maximum redirects.
    pub max_redirects: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("pvh2o-sw/{}", env!("CARGO_PKG_VERSION")),
            default_timeout: Duration::from_secs(30),
            max_redirects: 10,
        }
    }
}

/// Fetches requests over HTTP.
///
/// The loader can be switched offline, after which every fetch rejects with
/// [`NetError::Offline`] without touching the network.
pub struct HttpFetcher {
    client: Client,
    config: LoaderConfig,
    offline: AtomicBool,
}

impl HttpFetcher {
    /// Create a new fetcher.
    pub fn new(config: LoaderConfig) -> Result<Self, NetError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.default_timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        info!(user_agent = %config.user_agent, "HttpFetcher initialized");

        Ok(Self {
            client,
            config,
            offline: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Simulate losing (or regaining) connectivity.
    pub fn set_offline(&self, offline: bool) {
        info!(offline, "Network connectivity changed");
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        if self.is_offline() {
            debug!(url = %request.url, "Fetch rejected, offline");
            return Err(NetError::Offline);
        }

        debug!(url = %request.url, method = %request.method, "Fetching resource");

        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone());

        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let timeout = request.timeout.unwrap_or(self.config.default_timeout);
        builder = builder.timeout(timeout);

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                NetError::Timeout(timeout)
            } else {
                NetError::HttpError(e)
            }
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let body = response.bytes().await?;

        trace!(
            url = %url,
            status = %status,
            body_len = body.len(),
            "Response received"
        );

        Ok(Response::new(url, status, headers, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetcher() -> HttpFetcher {
        HttpFetcher::new(LoaderConfig::default()).unwrap()
    }

    #[test]
    fn test_loader_config_default() {
        let config = LoaderConfig::default();
        assert!(config.user_agent.starts_with("pvh2o-sw/"));
        assert_eq!(config.max_redirects, 10);
    }

    #[tokio::test]
    async fn test_fetch_resolves_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/static/css/themes.css"))
            .respond_with(ResponseTemplate::new(200).set_body_string(":root { --bg: #000; }"))
            .mount(&server)
            .await;

        let request = Request::parse(&format!("{}/static/css/themes.css", server.uri())).unwrap();
        let response = fetcher().fetch(request).await.unwrap();

        assert!(response.ok());
        assert_eq!(response.text().unwrap(), ":root { --bg: #000; }");
    }

    #[tokio::test]
    async fn test_fetch_resolves_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/status"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let request = Request::parse(&format!("{}/api/status", server.uri())).unwrap();
        let response = fetcher().fetch(request).await.unwrap();

        assert_eq!(response.status.as_u16(), 503);
    }

    #[tokio::test]
    async fn test_fetch_rejects_when_offline() {
        let server = MockServer::start().await;
        let fetcher = fetcher();
        fetcher.set_offline(true);

        let request = Request::parse(&server.uri()).unwrap();
        assert!(matches!(fetcher.fetch(request).await, Err(NetError::Offline)));
        assert_eq!(server.received_requests().await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_fetch_rejects_on_refused_connection() {
        // Grab a free port and release it so nothing is listening there.
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();

        let request = Request::parse(&format!("http://127.0.0.1:{port}/static/icon.png")).unwrap();
        assert!(fetcher().fetch(request).await.is_err());
    }

    #[tokio::test]
    async fn test_fetch_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let request = Request::parse(&server.uri())
            .unwrap()
            .timeout(Duration::from_millis(50));
        assert!(matches!(
            fetcher().fetch(request).await,
            Err(NetError::Timeout(_))
        ));
    }
}
