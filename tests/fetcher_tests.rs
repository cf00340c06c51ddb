// Fetcher behavior against an in-process HTTP server: caching,
// conditional revalidation, retry classification, and cancellation.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use maplive_core::cache::CacheConfig;
use maplive_core::cancel::CancelToken;
use maplive_core::error::LiveError;
use maplive_core::fetcher::{FetchOptions, FetcherConfig, GeoJsonFetcher};
use maplive_core::retry::RetryPolicy;

fn sample_collection() -> serde_json::Value {
    json!({
        "type": "FeatureCollection",
        "features": [{
            "type": "Feature",
            "geometry": { "type": "Point", "coordinates": [13.4, 52.5] },
            "properties": { "id": 1, "name": "Berlin" }
        }]
    })
}

#[derive(Clone, Default)]
struct ServerState {
    hits: Arc<AtomicU32>,
}

async fn data_handler(State(state): State<ServerState>, headers: HeaderMap) -> impl IntoResponse {
    state.hits.fetch_add(1, Ordering::SeqCst);
    let revalidated = headers
        .get("if-none-match")
        .map(|v| v == "\"v1\"")
        .unwrap_or(false);
    if revalidated {
        return (StatusCode::NOT_MODIFIED, [("etag", "\"v1\"")]).into_response();
    }
    (
        StatusCode::OK,
        [("etag", "\"v1\"")],
        Json(sample_collection()),
    )
        .into_response()
}

async fn flaky_handler(State(state): State<ServerState>) -> impl IntoResponse {
    let attempt = state.hits.fetch_add(1, Ordering::SeqCst);
    if attempt < 2 {
        return (StatusCode::INTERNAL_SERVER_ERROR, "still warming up").into_response();
    }
    Json(sample_collection()).into_response()
}

async fn not_json_handler(State(state): State<ServerState>) -> impl IntoResponse {
    state.hits.fetch_add(1, Ordering::SeqCst);
    "this is not json"
}

async fn wrong_shape_handler() -> impl IntoResponse {
    Json(json!({ "type": "Point", "coordinates": [0.0, 0.0] }))
}

async fn slow_handler() -> impl IntoResponse {
    tokio::time::sleep(Duration::from_secs(10)).await;
    Json(sample_collection())
}

async fn serve(state: ServerState) -> SocketAddr {
    let app = Router::new()
        .route("/data.geojson", get(data_handler))
        .route("/flaky.geojson", get(flaky_handler))
        .route("/notjson", get(not_json_handler))
        .route("/wrongshape", get(wrong_shape_handler))
        .route("/slow.geojson", get(slow_handler))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

fn fast_config() -> FetcherConfig {
    FetcherConfig {
        timeout: Duration::from_secs(5),
        cache_enabled: true,
        cache: CacheConfig::default(),
        retry: RetryPolicy {
            max_retries: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            backoff_factor: 2.0,
            jitter_enabled: false,
            jitter_factor: 0.0,
        },
    }
}

#[tokio::test]
async fn test_second_fetch_is_served_from_cache() {
    let state = ServerState::default();
    let addr = serve(state.clone()).await;
    let fetcher = GeoJsonFetcher::new(fast_config());
    let url = format!("http://{}/data.geojson", addr);

    let first = fetcher.fetch(&url, FetchOptions::default()).await.unwrap();
    assert!(!first.from_cache);
    assert_eq!(first.feature_count, 1);

    let second = fetcher.fetch(&url, FetchOptions::default()).await.unwrap();
    assert!(second.from_cache);
    assert_eq!(second.payload, first.payload);

    // Exactly one request reached the network.
    assert_eq!(state.hits.load(Ordering::SeqCst), 1);
    let stats = fetcher.stats();
    assert_eq!(stats.network_requests, 1);
    assert_eq!(stats.cache.hits, 1);
}

#[tokio::test]
async fn test_conditional_revalidation_revives_payload_on_304() {
    let state = ServerState::default();
    let addr = serve(state.clone()).await;
    let fetcher = GeoJsonFetcher::new(fast_config());
    let url = format!("http://{}/data.geojson", addr);

    let first = fetcher.fetch(&url, FetchOptions::default()).await.unwrap();

    // Bypass the cache read so the request goes out with the stored
    // validator and comes back 304.
    let second = fetcher
        .fetch(
            &url,
            FetchOptions {
                skip_cache: true,
                ..FetchOptions::default()
            },
        )
        .await
        .unwrap();

    assert!(second.from_cache);
    assert_eq!(second.payload, first.payload);
    assert_eq!(state.hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_server_errors_are_retried_until_success() {
    let state = ServerState::default();
    let addr = serve(state.clone()).await;
    let fetcher = GeoJsonFetcher::new(fast_config());
    let url = format!("http://{}/flaky.geojson", addr);

    let retries = Arc::new(AtomicU32::new(0));
    let retries_seen = Arc::clone(&retries);
    let outcome = fetcher
        .fetch(
            &url,
            FetchOptions {
                on_retry: Some(Arc::new(move |_n, _delay, _err| {
                    retries_seen.fetch_add(1, Ordering::SeqCst);
                })),
                ..FetchOptions::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(outcome.feature_count, 1);
    assert_eq!(state.hits.load(Ordering::SeqCst), 3);
    assert_eq!(retries.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_client_errors_are_not_retried() {
    let state = ServerState::default();
    let addr = serve(state.clone()).await;
    let fetcher = GeoJsonFetcher::new(fast_config());
    let url = format!("http://{}/nope.geojson", addr);

    let err = fetcher.fetch(&url, FetchOptions::default()).await.unwrap_err();
    match err {
        LiveError::HttpStatus { status, .. } => assert_eq!(status, 404),
        other => panic!("expected http status error, got {}", other),
    }
}

#[tokio::test]
async fn test_invalid_json_fails_without_retry() {
    let state = ServerState::default();
    let addr = serve(state.clone()).await;
    let fetcher = GeoJsonFetcher::new(fast_config());
    let url = format!("http://{}/notjson", addr);

    let err = fetcher.fetch(&url, FetchOptions::default()).await.unwrap_err();
    assert!(matches!(err, LiveError::InvalidJson(_)));
    assert_eq!(state.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_non_collection_body_is_rejected() {
    let state = ServerState::default();
    let addr = serve(state.clone()).await;
    let fetcher = GeoJsonFetcher::new(fast_config());
    let url = format!("http://{}/wrongshape", addr);

    let err = fetcher.fetch(&url, FetchOptions::default()).await.unwrap_err();
    assert!(matches!(err, LiveError::NotGeoJson(_)));
}

#[tokio::test]
async fn test_lifecycle_callbacks_fire_in_order() {
    let state = ServerState::default();
    let addr = serve(state.clone()).await;
    let fetcher = GeoJsonFetcher::new(fast_config());
    let url = format!("http://{}/data.geojson", addr);

    let log: Arc<std::sync::Mutex<Vec<String>>> = Arc::default();
    let start_log = Arc::clone(&log);
    let complete_log = Arc::clone(&log);
    fetcher
        .fetch(
            &url,
            FetchOptions {
                on_start: Some(Arc::new(move || {
                    start_log.lock().unwrap().push("start".to_string());
                })),
                on_complete: Some(Arc::new(move |payload, from_cache| {
                    complete_log
                        .lock()
                        .unwrap()
                        .push(format!("complete:{}:{}", payload.len(), from_cache));
                })),
                ..FetchOptions::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(
        *log.lock().unwrap(),
        vec!["start".to_string(), "complete:1:false".to_string()]
    );
}

#[tokio::test]
async fn test_cancellation_interrupts_a_slow_request() {
    let state = ServerState::default();
    let addr = serve(state.clone()).await;
    let fetcher = Arc::new(GeoJsonFetcher::new(fast_config()));
    let url = format!("http://{}/slow.geojson", addr);

    let token = CancelToken::new();
    let fetch = {
        let fetcher = Arc::clone(&fetcher);
        let url = url.clone();
        let token = token.clone();
        tokio::spawn(async move {
            fetcher
                .fetch(
                    &url,
                    FetchOptions {
                        cancel: Some(token),
                        ..FetchOptions::default()
                    },
                )
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    token.cancel();

    let result = tokio::time::timeout(Duration::from_secs(2), fetch)
        .await
        .expect("cancel should interrupt promptly")
        .unwrap();
    assert!(matches!(result, Err(LiveError::Cancelled)));
    // The live-request registry was cleaned up on the way out.
    assert_eq!(fetcher.stats().active_requests, 0);
}

#[tokio::test]
async fn test_timeout_is_classified_as_timeout() {
    let state = ServerState::default();
    let addr = serve(state.clone()).await;
    let fetcher = GeoJsonFetcher::new(FetcherConfig {
        timeout: Duration::from_millis(200),
        retry: RetryPolicy {
            max_retries: 0,
            ..fast_config().retry
        },
        ..fast_config()
    });
    let url = format!("http://{}/slow.geojson", addr);

    let err = fetcher.fetch(&url, FetchOptions::default()).await.unwrap_err();
    assert!(matches!(err, LiveError::Timeout(_)), "got {}", err);
}

#[tokio::test]
async fn test_prefetch_then_invalidate() {
    let state = ServerState::default();
    let addr = serve(state.clone()).await;
    let fetcher = GeoJsonFetcher::new(fast_config());
    let url = format!("http://{}/data.geojson", addr);

    fetcher.prefetch(&url, None).await.unwrap();
    let cached = fetcher.fetch(&url, FetchOptions::default()).await.unwrap();
    assert!(cached.from_cache);

    assert!(fetcher.invalidate(&url));
    let refetched = fetcher.fetch(&url, FetchOptions::default()).await.unwrap();
    assert!(!refetched.from_cache);
}

#[tokio::test]
async fn test_disabled_cache_always_goes_to_network() {
    let state = ServerState::default();
    let addr = serve(state.clone()).await;
    let fetcher = GeoJsonFetcher::new(FetcherConfig {
        cache_enabled: false,
        ..fast_config()
    });
    let url = format!("http://{}/data.geojson", addr);

    let first = fetcher.fetch(&url, FetchOptions::default()).await.unwrap();
    let second = fetcher.fetch(&url, FetchOptions::default()).await.unwrap();
    assert!(!first.from_cache);
    assert!(!second.from_cache);
    assert_eq!(state.hits.load(Ordering::SeqCst), 2);
}
