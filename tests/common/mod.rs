#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;

use xtream_edge::{
    AppConfig, UpstreamConfig,
    services::{
        DynProxyCacheService,
        edge_services::EdgeServices,
        proxy_cache_services::MemoryProxyCache,
        upstream_services::{DynUpstreamService, UpstreamService},
    },
};

/// serve `router` on a random local port, stays up for the rest of the test
pub async fn spawn_origin(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

/// a port nothing listens on
pub async fn dead_origin() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

#[derive(Clone, Default)]
pub struct Hits(Arc<AtomicUsize>);

impl Hits {
    pub fn bump(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// same retry policy as production, just in milliseconds
pub fn fast_upstream() -> UpstreamConfig {
    UpstreamConfig {
        timeout: Duration::from_secs(2),
        backoff: vec![
            Duration::from_millis(20),
            Duration::from_millis(40),
            Duration::from_millis(80),
        ],
        ..UpstreamConfig::default()
    }
}

pub fn services_with(proxy_cache: DynProxyCacheService, upstream: UpstreamConfig) -> EdgeServices {
    let upstream =
        Arc::new(UpstreamService::new(upstream).unwrap()) as DynUpstreamService;
    EdgeServices::with_upstream(Arc::new(AppConfig::default()), proxy_cache, upstream)
}

pub fn memory_services() -> (EdgeServices, Arc<MemoryProxyCache>) {
    let cache = Arc::new(MemoryProxyCache::new());
    let services = services_with(cache.clone() as DynProxyCacheService, fast_upstream());
    (services, cache)
}

pub fn proxy_uri(target: &str) -> String {
    format!("/proxy?url={}", urlencoding::encode(target))
}
