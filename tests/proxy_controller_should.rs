mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::{Body, Bytes},
    http::{HeaderMap, Method, Request, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use tower::ServiceExt;

use common::{Hits, dead_origin, fast_upstream, memory_services, proxy_uri, services_with, spawn_origin};
use xtream_edge::{
    EdgeApplicationServer,
    services::{
        DynProxyCacheService,
        proxy_cache_services::{MockProxyCacheServiceTrait, ProxyCacheServiceTrait},
    },
};

const M3U8: &str = "application/vnd.apple.mpegurl";

async fn send(app: &Router, method: Method, uri: &str, headers: &[(&str, &str)]) -> Response {
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    app.clone()
        .oneshot(builder.body(Body::empty()).unwrap())
        .await
        .unwrap()
}

async fn body_of(response: Response) -> Bytes {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
}

fn counted<F, R>(hits: Hits, respond: F) -> axum::routing::MethodRouter
where
    F: Fn(HeaderMap) -> R + Clone + Send + Sync + 'static,
    R: IntoResponse,
{
    get(move |headers: HeaderMap| {
        let hits = hits.clone();
        let respond = respond.clone();
        async move {
            hits.bump();
            respond(headers).into_response()
        }
    })
}

fn assert_cors(response: &Response) {
    assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    assert_eq!(
        response.headers()[header::ACCESS_CONTROL_ALLOW_METHODS],
        "GET, HEAD, OPTIONS"
    );
    assert_eq!(
        response.headers()[header::ACCESS_CONTROL_EXPOSE_HEADERS],
        "Content-Length, Content-Range, Accept-Ranges"
    );
}

#[tokio::test]
async fn reject_missing_url_with_400() {
    let (services, _) = memory_services();
    let app = EdgeApplicationServer::proxy_router(services.clone());

    let response = send(&app, Method::GET, "/proxy", &[]).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_cors(&response);
    assert!(
        response.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/plain")
    );
    assert_eq!(&body_of(response).await[..], b"Missing url parameter");
    // client mistakes aren't operational errors
    assert_eq!(services.stats.snapshot().errors, 0);
}

#[tokio::test]
async fn reject_malformed_url_with_400() {
    let (services, _) = memory_services();
    let app = EdgeApplicationServer::proxy_router(services);

    let response = send(&app, Method::GET, "/proxy?url=ftp%3A%2F%2Fhost%2Fa.ts", &[]).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn answer_preflight_with_204() {
    let (services, _) = memory_services();
    let app = EdgeApplicationServer::proxy_router(services.clone());

    let response = send(&app, Method::OPTIONS, "/proxy", &[]).await;

    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_cors(&response);
    assert_eq!(services.stats.snapshot().requests, 0);
}

#[tokio::test]
async fn rewrite_and_cache_a_manifest() {
    let hits = Hits::default();
    let origin = Router::new().route(
        "/live/u/p/42.m3u8",
        counted(hits.clone(), |_| {
            ([(header::CONTENT_TYPE, M3U8)], "#EXTINF:10,\n42_1.ts")
        }),
    );
    let addr = spawn_origin(origin).await;
    let (services, cache) = memory_services();
    let app = EdgeApplicationServer::proxy_router(services.clone());

    let target = format!("http://{}/live/u/p/42.m3u8", addr);
    let response = send(&app, Method::GET, &proxy_uri(&target), &[]).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_cors(&response);
    assert_eq!(response.headers()[header::CONTENT_TYPE], M3U8);
    assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");

    let expected = format!(
        "#EXTINF:10,\n/proxy?url={}",
        urlencoding::encode(&format!("http://{}/live/u/p/42_1.ts", addr))
    );
    assert_eq!(body_of(response).await, Bytes::from(expected.clone()));

    let cached = cache.get(&target).await.unwrap().unwrap();
    assert_eq!(cached.payload, Bytes::from(expected.clone()));

    // second request never reaches the origin
    let response = send(&app, Method::GET, &proxy_uri(&target), &[]).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_of(response).await, Bytes::from(expected));
    assert_eq!(hits.count(), 1);

    let stats = services.stats.snapshot();
    assert_eq!(stats.requests, 2);
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.cache_misses, 1);
    assert!((stats.cache_hit_rate - 0.5).abs() < f64::EPSILON);
}

#[tokio::test]
async fn detect_manifests_by_content_type() {
    let origin = Router::new().route(
        "/get.php",
        get(|| async { ([(header::CONTENT_TYPE, "application/x-mpegURL")], "#EXTM3U\nchunk.ts") }),
    );
    let addr = spawn_origin(origin).await;
    let (services, cache) = memory_services();
    let app = EdgeApplicationServer::proxy_router(services);

    let target = format!("http://{}/get.php", addr);
    let response = send(&app, Method::GET, &proxy_uri(&target), &[]).await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = String::from_utf8(body_of(response).await.to_vec()).unwrap();
    assert!(body.starts_with("#EXTM3U\n/proxy?url=http%3A%2F%2F"));
    // not a .m3u8/.ts url, nothing cached
    assert!(cache.is_empty());
}

#[tokio::test]
async fn answer_503_json_for_offline_streams() {
    let origin = Router::new().route(
        "/live/u/p/9.m3u8",
        get(|| async { ([(header::CONTENT_TYPE, M3U8)], "#EXTM3U\n#EXTINF:10,\noffline_1.ts") }),
    );
    let addr = spawn_origin(origin).await;
    let (services, cache) = memory_services();
    let app = EdgeApplicationServer::proxy_router(services.clone());

    let target = format!("http://{}/live/u/p/9.m3u8", addr);
    let response = send(&app, Method::GET, &proxy_uri(&target), &[]).await;

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_cors(&response);
    let json: serde_json::Value = serde_json::from_slice(&body_of(response).await).unwrap();
    assert_eq!(json["error"], "Stream offline");
    assert!(cache.get(&target).await.unwrap().is_none());
    assert_eq!(services.stats.snapshot().errors, 1);
}

#[tokio::test]
async fn pass_range_requests_through() {
    let hits = Hits::default();
    let origin = Router::new().route(
        "/live/u/p/42_1.ts",
        counted(hits.clone(), |headers: HeaderMap| {
            assert_eq!(headers[header::RANGE], "bytes=1000-");
            (
                StatusCode::PARTIAL_CONTENT,
                [
                    (header::CONTENT_TYPE, "video/mp2t"),
                    (header::CONTENT_RANGE, "bytes 1000-5000/5001"),
                    (header::ACCEPT_RANGES, "bytes"),
                ],
                vec![7u8; 4001],
            )
        }),
    );
    let addr = spawn_origin(origin).await;
    let (services, cache) = memory_services();
    let app = EdgeApplicationServer::proxy_router(services);

    let target = format!("http://{}/live/u/p/42_1.ts", addr);
    let response = send(
        &app,
        Method::GET,
        &proxy_uri(&target),
        &[("range", "bytes=1000-")],
    )
    .await;

    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        response.headers()[header::CONTENT_RANGE],
        "bytes 1000-5000/5001"
    );
    assert_eq!(response.headers()[header::ACCEPT_RANGES], "bytes");
    assert_eq!(body_of(response).await.len(), 4001);

    // partial bodies are never cached
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(cache.get(&target).await.unwrap().is_none());
}

#[tokio::test]
async fn stream_and_cache_full_segments() {
    let hits = Hits::default();
    let payload: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
    let origin_payload = payload.clone();
    let origin = Router::new().route(
        "/live/u/p/42_2.ts",
        counted(hits.clone(), move |_| {
            ([(header::CONTENT_TYPE, "video/mp2t")], origin_payload.clone())
        }),
    );
    let addr = spawn_origin(origin).await;
    let (services, cache) = memory_services();
    let app = EdgeApplicationServer::proxy_router(services);

    let target = format!("http://{}/live/u/p/42_2.ts", addr);
    let response = send(&app, Method::GET, &proxy_uri(&target), &[]).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_LENGTH], "4096");
    assert_eq!(body_of(response).await, Bytes::from(payload.clone()));

    // the cache write happens once the body finished streaming
    let mut cached = None;
    for _ in 0..100 {
        cached = cache.get(&target).await.unwrap();
        if cached.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let cached = cached.expect("segment should have been cached");
    assert_eq!(cached.payload, Bytes::from(payload.clone()));

    // ranges on a cached segment are cut from the cached bytes
    let response = send(
        &app,
        Method::GET,
        &proxy_uri(&target),
        &[("range", "bytes=0-9")],
    )
    .await;
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 0-9/4096");
    assert_eq!(&body_of(response).await[..], &payload[..10]);
    assert_eq!(hits.count(), 1);
}

#[tokio::test]
async fn keep_redirects_inside_the_proxy() {
    let origin = Router::new().route(
        "/old.ts",
        get(|| async {
            (
                StatusCode::MOVED_PERMANENTLY,
                [(header::LOCATION, "http://x/y.ts")],
            )
        }),
    );
    let addr = spawn_origin(origin).await;
    let (services, _) = memory_services();
    let app = EdgeApplicationServer::proxy_router(services);

    let target = format!("http://{}/old.ts", addr);
    let response = send(&app, Method::GET, &proxy_uri(&target), &[]).await;

    assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
    assert_eq!(
        response.headers()[header::LOCATION],
        "/proxy?url=http%3A%2F%2Fx%2Fy.ts"
    );
    assert_cors(&response);
}

#[tokio::test]
async fn resolve_relative_redirects_against_the_target() {
    let origin = Router::new().route(
        "/live/u/p/5.m3u8",
        get(|| async { (StatusCode::FOUND, [(header::LOCATION, "/hls/5/index.m3u8")]) }),
    );
    let addr = spawn_origin(origin).await;
    let (services, _) = memory_services();
    let app = EdgeApplicationServer::proxy_router(services);

    let target = format!("http://{}/live/u/p/5.m3u8", addr);
    let response = send(&app, Method::GET, &proxy_uri(&target), &[]).await;

    assert_eq!(response.status(), StatusCode::FOUND);
    let expected = format!(
        "/proxy?url={}",
        urlencoding::encode(&format!("http://{}/hls/5/index.m3u8", addr))
    );
    assert_eq!(response.headers()[header::LOCATION], expected.as_str());
}

#[tokio::test]
async fn map_458_to_bad_gateway() {
    let origin = Router::new().fallback(|| async { StatusCode::from_u16(458).unwrap() });
    let addr = spawn_origin(origin).await;
    let (services, _) = memory_services();
    let app = EdgeApplicationServer::proxy_router(services.clone());

    let response = send(&app, Method::GET, &proxy_uri(&format!("http://{}/a.ts", addr)), &[]).await;

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_cors(&response);
    assert_eq!(services.stats.snapshot().retries, 0);
}

#[tokio::test]
async fn map_exhausted_509_to_503() {
    let hits = Hits::default();
    let origin = Router::new().route(
        "/live/u/p/1_1.ts",
        counted(hits.clone(), |_| StatusCode::from_u16(509).unwrap()),
    );
    let addr = spawn_origin(origin).await;
    let (services, _) = memory_services();
    let app = EdgeApplicationServer::proxy_router(services.clone());

    let response = send(
        &app,
        Method::GET,
        &proxy_uri(&format!("http://{}/live/u/p/1_1.ts", addr)),
        &[],
    )
    .await;

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(hits.count(), 4);

    let stats = services.stats.snapshot();
    assert_eq!(stats.retries, 3);
    assert_eq!(stats.errors, 1);
}

#[tokio::test]
async fn forward_permanent_errors_verbatim() {
    let hits = Hits::default();
    let origin = Router::new().route(
        "/gone.ts",
        counted(hits.clone(), |_| StatusCode::NOT_FOUND),
    );
    let addr = spawn_origin(origin).await;
    let (services, _) = memory_services();
    let app = EdgeApplicationServer::proxy_router(services);

    let response = send(&app, Method::GET, &proxy_uri(&format!("http://{}/gone.ts", addr)), &[]).await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(hits.count(), 1);
}

#[tokio::test]
async fn answer_500_when_the_origin_is_unreachable() {
    let addr = dead_origin().await;
    let (services, _) = memory_services();
    let app = EdgeApplicationServer::proxy_router(services.clone());

    let response = send(&app, Method::GET, &proxy_uri(&format!("http://{}/a.ts", addr)), &[]).await;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_cors(&response);
    assert_eq!(services.stats.snapshot().retries, 3);
}

#[tokio::test]
async fn carry_on_when_the_cache_backend_fails() {
    let origin = Router::new().route(
        "/live/u/p/3.m3u8",
        get(|| async { ([(header::CONTENT_TYPE, M3U8)], "#EXTM3U\n3_1.ts") }),
    );
    let addr = spawn_origin(origin).await;

    let mut cache = MockProxyCacheServiceTrait::new();
    cache.expect_backend_name().return_const("mock");
    cache
        .expect_get()
        .returning(|_| Err(anyhow::anyhow!("connection reset")));
    cache
        .expect_set()
        .times(1)
        .returning(|_, _, _| Err(anyhow::anyhow!("connection reset")));

    let services = services_with(Arc::new(cache) as DynProxyCacheService, fast_upstream());
    let app = EdgeApplicationServer::proxy_router(services.clone());

    let target = format!("http://{}/live/u/p/3.m3u8", addr);
    let response = send(&app, Method::GET, &proxy_uri(&target), &[]).await;

    assert_eq!(response.status(), StatusCode::OK);
    let stats = services.stats.snapshot();
    assert_eq!(stats.cache_misses, 1);
    assert_eq!(stats.errors, 0);
}

#[tokio::test]
async fn skip_the_cache_for_other_assets() {
    let hits = Hits::default();
    let origin = Router::new().route(
        "/logo.png",
        counted(hits.clone(), |_| ([(header::CONTENT_TYPE, "image/png")], vec![1u8, 2, 3])),
    );
    let addr = spawn_origin(origin).await;
    let (services, cache) = memory_services();
    let app = EdgeApplicationServer::proxy_router(services.clone());

    let target = format!("http://{}/logo.png", addr);
    for _ in 0..2 {
        let response = send(&app, Method::GET, &proxy_uri(&target), &[]).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");
        assert_eq!(&body_of(response).await[..], &[1u8, 2, 3]);
    }

    assert_eq!(hits.count(), 2);
    assert!(cache.is_empty());
    let stats = services.stats.snapshot();
    assert_eq!(stats.cache_hits + stats.cache_misses, 0);
}

#[tokio::test]
async fn fetch_whole_playlists_even_for_range_requests() {
    let origin = Router::new().route(
        "/live/u/p/42.m3u8",
        get(|headers: HeaderMap| async move {
            if headers.contains_key(header::RANGE) {
                (
                    StatusCode::PARTIAL_CONTENT,
                    [(header::CONTENT_TYPE, M3U8)],
                    "#EXTM3U\n42_1",
                )
                    .into_response()
            } else {
                ([(header::CONTENT_TYPE, M3U8)], "#EXTM3U\n42_1.ts").into_response()
            }
        }),
    );
    let addr = spawn_origin(origin).await;
    let (services, cache) = memory_services();
    let app = EdgeApplicationServer::proxy_router(services);

    let target = format!("http://{}/live/u/p/42.m3u8", addr);
    let response = send(
        &app,
        Method::GET,
        &proxy_uri(&target),
        &[("range", "bytes=0-11")],
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    let expected = format!(
        "#EXTM3U\n/proxy?url={}",
        urlencoding::encode(&format!("http://{}/live/u/p/42_1.ts", addr))
    );
    assert_eq!(body_of(response).await, Bytes::from(expected.clone()));

    let cached = cache.get(&target).await.unwrap().unwrap();
    assert_eq!(cached.payload, Bytes::from(expected));
}

#[tokio::test]
async fn never_cache_partial_playlists() {
    let origin = Router::new().route(
        "/live/u/p/7.m3u8",
        get(|| async {
            (
                StatusCode::PARTIAL_CONTENT,
                [
                    (header::CONTENT_TYPE, M3U8),
                    (header::CONTENT_RANGE, "bytes 0-11/40"),
                ],
                "#EXTM3U\n7_1",
            )
        }),
    );
    let addr = spawn_origin(origin).await;
    let (services, cache) = memory_services();
    let app = EdgeApplicationServer::proxy_router(services);

    let target = format!("http://{}/live/u/p/7.m3u8", addr);
    let response = send(&app, Method::GET, &proxy_uri(&target), &[]).await;

    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 0-11/40");
    assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");
    assert_eq!(&body_of(response).await[..], b"#EXTM3U\n7_1");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(cache.get(&target).await.unwrap().is_none());
}

#[tokio::test]
async fn answer_head_on_playlists_with_upstream_headers() {
    let hits = Hits::default();
    let origin = Router::new().route(
        "/live/u/p/8.m3u8",
        counted(hits.clone(), |_| {
            ([(header::CONTENT_TYPE, M3U8)], "#EXTM3U\n8_1.ts")
        }),
    );
    let addr = spawn_origin(origin).await;
    let (services, cache) = memory_services();
    let app = EdgeApplicationServer::proxy_router(services);

    let target = format!("http://{}/live/u/p/8.m3u8", addr);
    let response = send(&app, Method::HEAD, &proxy_uri(&target), &[]).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], M3U8);
    assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");
    assert!(body_of(response).await.is_empty());
    assert_eq!(hits.count(), 1);
    assert!(cache.is_empty());
}
