//! End-to-end behaviour of the pvh2o worker against a local HTTP server.

use std::sync::Arc;

use futures::future::join_all;
use pvh2o_common::{try_init_logging, LogConfig, WorkerConfig, DEFAULT_CACHE_NAME};
use pvh2o_net::{HttpFetcher, LoaderConfig, Request};
use pvh2o_sw::{CacheKey, ServiceWorkerError, ServiceWorkerHost};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const ASSETS: &[(&str, &str)] = &[
    ("/static/css/themes.css", ":root { --accent: #0a7; }"),
    ("/static/icon.png", "\u{89}PNG-icon"),
    ("/static/manifest.json", r#"{"name": "pvh2o"}"#),
];

async fn mount(server: &MockServer, route: &str, status: u16, body: &str) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(status).set_body_string(body))
        .mount(server)
        .await;
}

async fn asset_server() -> MockServer {
    let server = MockServer::start().await;
    for (route, body) in ASSETS {
        mount(&server, route, 200, body).await;
    }
    server
}

async fn host(server: &MockServer) -> (ServiceWorkerHost, Arc<HttpFetcher>) {
    let _ = try_init_logging(LogConfig::debug().with_filter("pvh2o_sw=debug,pvh2o_net=debug"));

    let config = WorkerConfig {
        origin: server.uri(),
        ..Default::default()
    };
    let fetcher = Arc::new(HttpFetcher::new(LoaderConfig::default()).unwrap());
    let (host, _events) = ServiceWorkerHost::with_fetcher(config, fetcher.clone())
        .await
        .unwrap();
    (host, fetcher)
}

fn request(server: &MockServer, route: &str) -> Request {
    Request::parse(&format!("{}{}", server.uri(), route)).unwrap()
}

async fn cached_len(host: &ServiceWorkerHost) -> usize {
    host.caches()
        .snapshot()
        .await
        .get(DEFAULT_CACHE_NAME)
        .map_or(0, |cache| cache.len())
}

#[tokio::test]
async fn install_precaches_every_listed_asset() {
    let server = asset_server().await;
    let (host, _) = host(&server).await;

    host.install().await.unwrap();

    let cache = host.caches().open(DEFAULT_CACHE_NAME).await.unwrap();
    let mut keys: Vec<CacheKey> = cache.keys().await;
    keys.sort_by(|a, b| a.url.cmp(&b.url));
    let mut expected: Vec<String> = ASSETS
        .iter()
        .map(|(route, _)| format!("{}{}", server.uri(), route))
        .collect();
    expected.sort();

    assert_eq!(
        keys.iter().map(|k| k.url.clone()).collect::<Vec<_>>(),
        expected
    );
    for (route, body) in ASSETS {
        let stored = cache.match_request(&request(&server, route)).await.unwrap();
        assert_eq!(stored.text().unwrap(), *body);
    }
}

#[tokio::test]
async fn install_fails_if_any_single_asset_fails() {
    for (failing, _) in ASSETS {
        let server = MockServer::start().await;
        for (route, body) in ASSETS {
            let status = if route == failing { 500 } else { 200 };
            mount(&server, route, status, body).await;
        }
        let (host, _) = host(&server).await;

        let result = host.install().await;

        assert!(
            matches!(result, Err(ServiceWorkerError::InstallFailed(_))),
            "install should fail when {failing} fails"
        );
        assert_eq!(cached_len(&host).await, 0, "nothing stored when {failing} fails");
        assert!(host.container().get_registrations().await.is_empty());
    }
}

#[tokio::test]
async fn install_fails_when_offline() {
    let server = asset_server().await;
    let (host, fetcher) = host(&server).await;
    fetcher.set_offline(true);

    assert!(matches!(
        host.install().await,
        Err(ServiceWorkerError::InstallFailed(_))
    ));
    assert_eq!(cached_len(&host).await, 0);
}

#[tokio::test]
async fn network_response_wins_over_cache() {
    let server = asset_server().await;
    let (host, _) = host(&server).await;
    host.install().await.unwrap();

    server.reset().await;
    mount(&server, "/static/css/themes.css", 200, ":root { --accent: #f00; }").await;

    let response = host.fetch(request(&server, "/static/css/themes.css")).await.unwrap();
    assert_eq!(response.text().unwrap(), ":root { --accent: #f00; }");
}

#[tokio::test]
async fn error_statuses_are_returned_untouched() {
    let server = asset_server().await;
    let (host, _) = host(&server).await;
    host.install().await.unwrap();

    server.reset().await;
    mount(&server, "/static/icon.png", 503, "maintenance").await;

    let response = host.fetch(request(&server, "/static/icon.png")).await.unwrap();
    assert_eq!(response.status.as_u16(), 503);
    assert_eq!(response.text().unwrap(), "maintenance");
}

#[tokio::test]
async fn offline_requests_fall_back_to_cache() {
    let server = asset_server().await;
    let (host, fetcher) = host(&server).await;
    host.install().await.unwrap();
    fetcher.set_offline(true);

    for (route, body) in ASSETS {
        let resolution = host
            .container()
            .handle_fetch(request(&server, route))
            .await
            .unwrap();
        assert!(resolution.is_cache(), "{route} should come from cache");
        assert_eq!(resolution.response().unwrap().text().unwrap(), *body);
    }
}

#[tokio::test]
async fn offline_miss_fails_the_fetch() {
    let server = asset_server().await;
    let (host, fetcher) = host(&server).await;
    host.install().await.unwrap();
    fetcher.set_offline(true);

    let resolution = host
        .container()
        .handle_fetch(request(&server, "/dashboard"))
        .await
        .unwrap();
    assert!(resolution.is_none());

    assert!(matches!(
        host.fetch(request(&server, "/dashboard")).await,
        Err(ServiceWorkerError::Network(_))
    ));
}

#[tokio::test]
async fn reinstall_overwrites_without_duplicates() {
    let server = asset_server().await;
    let (host, _) = host(&server).await;
    let scope = host.install().await.unwrap();

    server.reset().await;
    for (route, body) in ASSETS {
        mount(&server, route, 200, &format!("{body} v2")).await;
    }
    host.install().await.unwrap();

    assert_eq!(cached_len(&host).await, ASSETS.len());
    assert_eq!(host.caches().keys().await, vec![DEFAULT_CACHE_NAME.to_string()]);

    let cache = host.caches().open(DEFAULT_CACHE_NAME).await.unwrap();
    let icon = cache
        .match_request(&request(&server, "/static/icon.png"))
        .await
        .unwrap();
    assert_eq!(icon.text().unwrap(), "\u{89}PNG-icon v2");

    let info = host.container().registration_info(&scope).await.unwrap();
    assert!(info.waiting.is_some());
}

#[tokio::test]
async fn failed_update_keeps_previous_worker_serving() {
    let server = asset_server().await;
    let (host, fetcher) = host(&server).await;
    let scope = host.install().await.unwrap();
    let active = host.container().registration_info(&scope).await.unwrap().active;

    server.reset().await;
    mount(&server, "/static/css/themes.css", 200, "new css").await;
    mount(&server, "/static/manifest.json", 200, "{}").await;
    // icon.png is now missing (404)

    assert!(host.install().await.is_err());

    let info = host.container().registration_info(&scope).await.unwrap();
    assert_eq!(info.active, active);
    assert!(info.waiting.is_none());

    fetcher.set_offline(true);
    let css = host
        .fetch(request(&server, "/static/css/themes.css"))
        .await
        .unwrap();
    assert_eq!(css.text().unwrap(), ":root { --accent: #0a7; }");
}

#[tokio::test]
async fn concurrent_fetches_are_independent() {
    let server = asset_server().await;
    let (host, fetcher) = host(&server).await;
    host.install().await.unwrap();
    fetcher.set_offline(true);

    let routes = ["/static/icon.png", "/dashboard", "/static/manifest.json", "/api/status"];
    let results = join_all(routes.iter().map(|route| host.fetch(request(&server, route)))).await;

    assert!(results[0].is_ok());
    assert!(results[1].is_err());
    assert!(results[2].is_ok());
    assert!(results[3].is_err());
}

#[tokio::test]
async fn restarted_host_serves_precached_assets_offline() {
    let server = asset_server().await;
    let dir = tempfile::tempdir().unwrap();
    let config = WorkerConfig {
        origin: server.uri(),
        cache_dir: Some(dir.path().to_path_buf()),
        ..Default::default()
    };

    let fetcher = Arc::new(HttpFetcher::new(LoaderConfig::default()).unwrap());
    let (host, _events) = ServiceWorkerHost::with_fetcher(config.clone(), fetcher)
        .await
        .unwrap();
    host.install().await.unwrap();
    drop(host);

    let offline = Arc::new(HttpFetcher::new(LoaderConfig::default()).unwrap());
    offline.set_offline(true);
    let (restarted, _events) = ServiceWorkerHost::with_fetcher(config, offline)
        .await
        .unwrap();

    for (route, body) in ASSETS {
        let response = restarted.fetch(request(&server, route)).await.unwrap();
        assert_eq!(response.text().unwrap(), *body, "{route} after restart");
    }
    assert!(restarted.fetch(request(&server, "/dashboard")).await.is_err());
}
