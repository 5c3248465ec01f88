use axum::Extension;
use axum::extract::{FromRequestParts, Query};
use axum::http::request::Parts;
use axum::http::{Method, header};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::server::error::Error;
use crate::server::services::edge_services::EdgeServices;

#[derive(Deserialize)]
struct ProxyQuery {
    url: Option<String>,
}

/// one inbound proxy request, lives until the response is written or the viewer goes away
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub target_url: Url,
    pub range_header: Option<String>,
    pub method: Method,
}

impl StreamRequest {
    /// only playlists and segments are worth a cache key, everything else is a one off
    pub fn is_cacheable(&self) -> bool {
        let path = self.target_url.path();
        path.ends_with(".m3u8") || path.ends_with(".ts")
    }

    pub fn cache_key(&self) -> &str {
        self.target_url.as_str()
    }
}

pub struct ProxyRequest(pub StreamRequest, pub EdgeServices);

/// `?url=` comes in percent encoded (already decoded by Query) or as unpadded url safe base64
/// from older links
pub fn decode_target_url(url_param: &str) -> Result<Url, Error> {
    let url_param = url_param.trim();

    let decoded = if url_param.starts_with("http://") || url_param.starts_with("https://") {
        url_param.to_string()
    } else {
        URL_SAFE_NO_PAD
            .decode(url_param.trim_end_matches('='))
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .ok_or_else(|| Error::BadRequest("Invalid url parameter".to_string()))?
    };

    let url = Url::parse(&decoded).map_err(|e| {
        debug!("Rejecting url parameter: {}", e);
        Error::BadRequest("Invalid url parameter".to_string())
    })?;

    match url.scheme() {
        "http" | "https" if url.host_str().is_some() => Ok(url),
        _ => Err(Error::BadRequest("Invalid url parameter".to_string())),
    }
}

impl<S> FromRequestParts<S> for ProxyRequest
where
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Extension(services): Extension<EdgeServices> =
            Extension::from_request_parts(parts, state)
                .await
                .map_err(|err| Error::InternalServerErrorWithContext(err.to_string()))?;

        services.stats.record_request();

        let Query(query): Query<ProxyQuery> = Query::from_request_parts(parts, state)
            .await
            .unwrap_or(Query(ProxyQuery { url: None }));

        let url_param = query
            .url
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| Error::BadRequest("Missing url parameter".to_string()))?;

        let target_url = decode_target_url(&url_param)?;

        let range_header = parts
            .headers
            .get(header::RANGE)
            .and_then(|h| h.to_str().ok())
            .map(|s| s.to_string());

        Ok(ProxyRequest(
            StreamRequest {
                target_url,
                range_header,
                method: parts.method.clone(),
            },
            services,
        ))
    }
}
