use axum::{
    Extension, Json, Router,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use metrics_exporter_prometheus::PrometheusHandle;

use crate::server::dtos::stats_dto::StatsSnapshot;
use crate::server::services::edge_services::EdgeServices;

pub struct StatsController;

impl StatsController {
    pub fn app() -> Router {
        Router::new()
            .route("/stats", get(Self::stats))
            .route("/metrics", get(Self::metrics))
    }

    async fn stats(Extension(services): Extension<EdgeServices>) -> Json<StatsSnapshot> {
        Json(services.stats.snapshot())
    }

    // prometheus text format, only there when the recorder could be installed
    async fn metrics(Extension(handle): Extension<Option<PrometheusHandle>>) -> Response {
        match handle {
            Some(handle) => (
                [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
                handle.render(),
            )
                .into_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        }
    }
}
