pub mod api;
pub mod dtos;
pub mod error;
pub mod extractors;
pub mod services;
pub mod utils;

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use axum::{Extension, Router, http::Method, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::Lazy;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

use crate::config::AppConfig;
use api::{ProxyController, StatsController, health_endpoint};
use services::{DynProxyCacheService, edge_services::EdgeServices};

static START_TIME: Lazy<Instant> = Lazy::new(Instant::now);

pub fn get_uptime_seconds() -> u64 {
    START_TIME.elapsed().as_secs()
}

pub fn get_app_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub struct EdgeApplicationServer;

impl EdgeApplicationServer {
    /// the viewer facing side, just the proxy route
    pub fn proxy_router(services: EdgeServices) -> Router {
        ProxyController::app(&services.config.proxy_path)
            .layer(Extension(services))
            .layer(TraceLayer::new_for_http())
    }

    /// operational side, stats, health and prometheus metrics
    pub fn stats_router(services: EdgeServices, metrics: Option<PrometheusHandle>) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::OPTIONS]);

        StatsController::app()
            .route("/health", get(health_endpoint))
            .layer(Extension(services))
            .layer(Extension(metrics))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
    }

    pub async fn serve(config: Arc<AppConfig>, proxy_cache: DynProxyCacheService) -> anyhow::Result<()> {
        Lazy::force(&START_TIME);

        // a recorder can only be installed once per process, stats still work without it
        let metrics = match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("prometheus recorder not installed: {}", e);
                None
            }
        };

        let services = EdgeServices::new(config.clone(), proxy_cache.clone())?;

        let proxy_listener = TcpListener::bind(("0.0.0.0", config.port))
            .await
            .with_context(|| format!("failed to bind proxy port {}", config.port))?;
        let stats_listener = TcpListener::bind(("0.0.0.0", config.stats_port))
            .await
            .with_context(|| format!("failed to bind stats port {}", config.stats_port))?;

        info!(
            "proxy listening on {} (path {}), stats on {}",
            config.port, config.proxy_path, config.stats_port
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("shutdown signal received, draining connections...");
            let _ = shutdown_tx.send(true);
        });

        let proxy_server = axum::serve(proxy_listener, Self::proxy_router(services.clone()))
            .with_graceful_shutdown(wait_for(shutdown_rx.clone()));
        let stats_server = axum::serve(stats_listener, Self::stats_router(services, metrics))
            .with_graceful_shutdown(wait_for(shutdown_rx));

        let served = tokio::try_join!(
            async { proxy_server.await.context("proxy server failed") },
            async { stats_server.await.context("stats server failed") },
        );

        proxy_cache.shutdown().await;
        info!("edge server stopped");

        served.map(|_| ())
    }
}

async fn wait_for(mut shutdown: watch::Receiver<bool>) {
    // a dropped sender also counts as shutdown
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
