use axum::Extension;
use axum::Json;
use axum::http::StatusCode;
use chrono::Utc;
use tracing::error;

use crate::logger::Logger;
use crate::server::dtos::health_dto::{CacheHealth, HealthResponse, HealthStatus};
use crate::server::services::edge_services::EdgeServices;
use crate::server::{get_app_version, get_uptime_seconds};

/// health endpoint, the cache backend is the only dependency worth checking
pub async fn health_endpoint(
    Extension(services): Extension<EdgeServices>,
) -> (StatusCode, Json<HealthResponse>) {
    let cache = check_cache_health(&services).await;

    let http_status = match cache.status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    let response = HealthResponse {
        status: cache.status,
        timestamp: Utc::now(),
        uptime_seconds: get_uptime_seconds(),
        version: get_app_version().to_string(),
        environment: Logger::environment_name(services.config.cargo_env).to_string(),
        cache,
    };

    (http_status, Json(response))
}

async fn check_cache_health(services: &EdgeServices) -> CacheHealth {
    let backend = services.proxy_cache.backend_name().to_string();

    match services.proxy_cache.health_check().await {
        Ok(response_time_ms) => CacheHealth {
            backend,
            status: HealthStatus::Healthy,
            response_time_ms,
        },
        Err(e) => {
            error!("Cache health check failed: {:#}", e);
            CacheHealth {
                backend,
                status: HealthStatus::Unhealthy,
                response_time_ms: 0.0,
            }
        }
    }
}
