use std::time::Duration;

use axum::{
    Router,
    body::{Body, Bytes},
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};
use tracing::{debug, error, warn};

use crate::server::{
    error::{AppResult, Error},
    extractors::{ProxyRequest, StreamRequest},
    services::{
        edge_services::EdgeServices,
        proxy_cache_services::{CacheEntry, CacheKind, DynProxyCacheService},
        upstream_services::UpstreamRequest,
    },
    utils::{
        caching_stream::CachingStream,
        m3u8_utils::{M3U8_CONTENT_TYPE, RewriteError, is_manifest, proxied_url, rewrite_manifest},
        range_utils::parse_range,
    },
};

const SEGMENT_CONTENT_TYPE: &str = "video/mp2t";

// headers worth keeping from a segment response so seeking keeps working
const FORWARDED_SEGMENT_HEADERS: [HeaderName; 3] = [
    header::CONTENT_LENGTH,
    header::CONTENT_RANGE,
    header::ACCEPT_RANGES,
];

pub struct ProxyController;

impl ProxyController {
    pub fn app(proxy_path: &str) -> Router {
        Router::new()
            .route(proxy_path, get(Self::proxy_get).options(Self::proxy_options))
            .layer(middleware::map_response(Self::cors_headers))
    }

    /// every proxy response, errors included, is readable from any origin
    async fn cors_headers(mut response: Response) -> Response {
        let headers = response.headers_mut();
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("GET, HEAD, OPTIONS"),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static("Range, Content-Type"),
        );
        headers.insert(
            header::ACCESS_CONTROL_EXPOSE_HEADERS,
            HeaderValue::from_static("Content-Length, Content-Range, Accept-Ranges"),
        );
        response
    }

    async fn proxy_options() -> impl IntoResponse {
        StatusCode::NO_CONTENT
    }

    async fn proxy_get(ProxyRequest(request, services): ProxyRequest) -> AppResult<Response> {
        let result = Self::handle(&request, &services).await;

        if let Err(e) = &result {
            if e.is_operational() {
                services.stats.record_error();
            }
        }

        result
    }

    async fn handle(request: &StreamRequest, services: &EdgeServices) -> AppResult<Response> {
        debug!("Proxying {} {}", request.method, request.target_url);

        if request.is_cacheable() {
            match services.proxy_cache.get(request.cache_key()).await {
                Ok(Some(entry)) => {
                    debug!("Proxy cache HIT for {}", request.target_url);
                    services.stats.record_cache_hit();
                    return Ok(Self::cached_response(
                        &entry,
                        request.range_header.as_deref(),
                    ));
                }
                Ok(None) => {
                    debug!("Proxy cache MISS for {}", request.target_url);
                    services.stats.record_cache_miss();
                }
                Err(e) => {
                    // caching is an optimisation, carry on as a miss
                    warn!("Proxy cache GET failed, treating as miss: {:#}", e);
                    services.stats.record_cache_miss();
                }
            }
        }

        // playlists are rewritten whole, a byte range of the origin's copy means nothing to the
        // player
        let range = if request.target_url.path().ends_with(".m3u8") {
            None
        } else {
            request.range_header.clone()
        };

        let upstream_request = UpstreamRequest {
            url: request.target_url.clone(),
            method: request.method.clone(),
            range,
        };

        let fetch = match services.upstream.fetch(&upstream_request).await {
            Ok(fetch) => fetch,
            Err(e) => {
                services
                    .stats
                    .record_retries(e.attempts().saturating_sub(1) as u64);
                error!("Upstream fetch failed for {}: {}", request.target_url, e);
                return Err(e.into());
            }
        };

        services
            .stats
            .record_retries(fetch.attempts.saturating_sub(1) as u64);

        let response = fetch.response;
        let status = response.status();
        debug!("Upstream responded {} for {}", status, request.target_url);

        if status.is_redirection() {
            return Self::redirect_response(status, response.headers(), request, services);
        }

        if !status.is_success() {
            error!(
                "Response from upstream not successful: {} for {}",
                status, request.target_url
            );
            return Err(Error::Upstream {
                status: status.as_u16(),
            });
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let manifest = is_manifest(&request.target_url, &content_type);

        // only a full GET body can be rewritten. HEAD and partial playlists pass through with
        // the upstream headers
        if manifest && status == StatusCode::OK && request.method != Method::HEAD {
            Self::manifest_response(response, request, services).await
        } else {
            Ok(Self::passthrough_response(
                response,
                content_type,
                manifest,
                request,
                services,
            ))
        }
    }

    /// never hand the player a naked upstream location
    fn redirect_response(
        status: StatusCode,
        upstream_headers: &HeaderMap,
        request: &StreamRequest,
        services: &EdgeServices,
    ) -> AppResult<Response> {
        let location = upstream_headers
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                Error::BadGateway(format!("{} redirect without a usable Location", status))
            })?;

        let resolved = request.target_url.join(location).map_err(|e| {
            Error::BadGateway(format!("unresolvable redirect {}: {}", location, e))
        })?;

        let proxied = proxied_url(&services.proxy_base, resolved.as_str());
        debug!("Redirect {} -> {}", resolved, proxied);

        let location = HeaderValue::from_str(&proxied).map_err(|e| {
            Error::InternalServerErrorWithContext(format!("bad proxied location: {}", e))
        })?;

        Ok((status, [(header::LOCATION, location)]).into_response())
    }

    async fn manifest_response(
        response: reqwest::Response,
        request: &StreamRequest,
        services: &EdgeServices,
    ) -> AppResult<Response> {
        let bytes = response.bytes().await.map_err(|e| {
            Error::UpstreamUnavailable(format!("Failed to read manifest: {}", e))
        })?;

        let text = String::from_utf8(bytes.to_vec()).map_err(|e| {
            error!("Failed to parse m3u8 as UTF-8: {}", e);
            Error::InternalServerErrorWithContext("Invalid m3u8 encoding".to_string())
        })?;

        let rewritten = rewrite_manifest(&text, &request.target_url, &services.proxy_base)
            .map_err(|e| match e {
                RewriteError::Offline => {
                    warn!("Stream offline: {}", request.target_url);
                    Error::StreamOffline
                }
            })?;

        debug!(
            "Rewrote manifest ({} -> {} bytes)",
            text.len(),
            rewritten.len()
        );

        let entry = CacheEntry {
            key: request.cache_key().to_string(),
            kind: CacheKind::Manifest,
            payload: Bytes::from(rewritten),
            content_type: M3U8_CONTENT_TYPE.to_string(),
            // only this proxy may cache a live playlist, never the browser
            extra_headers: vec![(
                header::CACHE_CONTROL.as_str().to_string(),
                "no-cache".to_string(),
            )],
        };

        let response = Self::cached_response(&entry, None);

        if request.is_cacheable() && request.method == Method::GET {
            Self::store(
                &services.proxy_cache,
                entry,
                services.config.manifest_ttl(),
            )
            .await;
        }

        Ok(response)
    }

    /// segment bodies stream straight through, untouched. full segment bodies of a known, sane
    /// length are copied into the cache once the last byte went out
    fn passthrough_response(
        response: reqwest::Response,
        content_type: String,
        manifest: bool,
        request: &StreamRequest,
        services: &EdgeServices,
    ) -> Response {
        let status = response.status();

        let content_type = if content_type.is_empty() {
            if manifest {
                M3U8_CONTENT_TYPE.to_string()
            } else if request.target_url.path().ends_with(".ts") {
                SEGMENT_CONTENT_TYPE.to_string()
            } else {
                "application/octet-stream".to_string()
            }
        } else {
            content_type
        };

        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(&content_type) {
            headers.insert(header::CONTENT_TYPE, value);
        }
        for name in FORWARDED_SEGMENT_HEADERS {
            if let Some(value) = response.headers().get(&name) {
                headers.insert(name, value.clone());
            }
        }
        let cache_control = if manifest {
            "no-cache".to_string()
        } else {
            format!("public, max-age={}", services.config.segment_ttl_secs)
        };
        if let Ok(value) = HeaderValue::from_str(&cache_control) {
            headers.insert(header::CACHE_CONTROL, value);
        }

        let cacheable_len = response
            .content_length()
            .filter(|len| *len <= services.config.max_cached_segment_bytes)
            .and_then(|len| usize::try_from(len).ok());

        let should_cache = !manifest
            && request.is_cacheable()
            && request.method == Method::GET
            && status == StatusCode::OK
            && cacheable_len.is_some();

        let stream = Box::pin(response.bytes_stream());

        let body = match cacheable_len {
            Some(expected_len) if should_cache => {
                let extra_headers: Vec<(String, String)> =
                    [header::CONTENT_LENGTH, header::ACCEPT_RANGES]
                        .iter()
                        .filter_map(|name| {
                            headers
                                .get(name)
                                .and_then(|v| v.to_str().ok())
                                .map(|v| (name.as_str().to_string(), v.to_string()))
                        })
                        .collect();

                let cache = services.proxy_cache.clone();
                let ttl = services.config.segment_ttl();
                let key = request.cache_key().to_string();
                let content_type = content_type.clone();

                let on_complete = Box::new(move |payload: Bytes| {
                    let entry = CacheEntry {
                        key,
                        kind: CacheKind::Segment,
                        payload,
                        content_type,
                        extra_headers,
                    };
                    // don't hold up the last chunk on a cache write
                    tokio::spawn(async move {
                        Self::store(&cache, entry, ttl).await;
                    });
                });

                Body::from_stream(CachingStream::new(stream, expected_len, on_complete))
            }
            _ => Body::from_stream(stream),
        };

        (status, headers, body).into_response()
    }

    async fn store(cache: &DynProxyCacheService, entry: CacheEntry, ttl: Duration) {
        let key = entry.key.clone();
        if let Err(e) = cache.set(&key, entry, ttl).await {
            warn!("Proxy cache SET failed for {}: {:#}", key, e);
        }
    }

    /// response straight from a cache entry. a segment hit with a satisfiable Range is served as
    /// a 206 slice of the cached payload
    fn cached_response(entry: &CacheEntry, range: Option<&str>) -> Response {
        let mut headers = HeaderMap::new();

        if let Ok(value) = HeaderValue::from_str(&entry.content_type) {
            headers.insert(header::CONTENT_TYPE, value);
        }

        for (name, value) in &entry.extra_headers {
            let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) else {
                continue;
            };
            // recomputed below
            if name == header::CONTENT_LENGTH {
                continue;
            }
            headers.insert(name, value);
        }

        let total_len = entry.payload.len();
        let range = match entry.kind {
            CacheKind::Segment => range.and_then(|r| parse_range(r, total_len)),
            CacheKind::Manifest => None,
        };

        let (status, body) = match range {
            Some(range) => {
                if let Ok(value) = HeaderValue::from_str(&range.content_range(total_len)) {
                    headers.insert(header::CONTENT_RANGE, value);
                }
                debug!(
                    "Serving cached range {}-{} of {} bytes",
                    range.start, range.end, total_len
                );
                (
                    StatusCode::PARTIAL_CONTENT,
                    entry.payload.slice(range.start..=range.end),
                )
            }
            None => (StatusCode::OK, entry.payload.clone()),
        };

        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));

        (status, headers, body).into_response()
    }
}
