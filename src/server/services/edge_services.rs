use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::info;

use crate::{
    config::{AppConfig, CacheBackend, UpstreamConfig},
    database::RedisDatabase,
};

use super::{
    proxy_cache_services::{DynProxyCacheService, MemoryProxyCache, RedisProxyCache},
    stats_services::{DynStatsService, StatsService},
    upstream_services::{DynUpstreamService, UpstreamService},
};

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// everything a request handler needs, built once at startup and handed to the routers
#[derive(Clone)]
pub struct EdgeServices {
    pub upstream: DynUpstreamService,
    pub proxy_cache: DynProxyCacheService,
    pub stats: DynStatsService,
    pub config: Arc<AppConfig>,
    pub proxy_base: Arc<str>,
}

impl EdgeServices {
    pub fn new(config: Arc<AppConfig>, proxy_cache: DynProxyCacheService) -> anyhow::Result<Self> {
        info!("starting edge services...");

        let upstream = Arc::new(UpstreamService::new(UpstreamConfig::from(config.as_ref()))?)
            as DynUpstreamService;

        Ok(Self::with_upstream(config, proxy_cache, upstream))
    }

    /// same as `new` but with a caller supplied upstream, tests swap in their own
    pub fn with_upstream(
        config: Arc<AppConfig>,
        proxy_cache: DynProxyCacheService,
        upstream: DynUpstreamService,
    ) -> Self {
        let proxy_base: Arc<str> = Arc::from(config.proxy_base());

        info!(
            "edge services ok (cache backend: {}, proxy base: {})",
            proxy_cache.backend_name(),
            proxy_base
        );

        Self {
            upstream,
            proxy_cache,
            stats: Arc::new(StatsService::new()),
            config,
            proxy_base,
        }
    }

    /// open whichever cache backend the config asks for
    pub async fn open_cache(config: &AppConfig) -> anyhow::Result<DynProxyCacheService> {
        match config.cache_backend {
            CacheBackend::Memory => {
                let cache = Arc::new(MemoryProxyCache::new());
                cache.start_sweeper(SWEEP_INTERVAL);
                info!("using in-memory proxy cache");
                Ok(cache as DynProxyCacheService)
            }
            CacheBackend::Redis => {
                let redis_url = config
                    .redis_url
                    .as_deref()
                    .context("REDIS_URL is required for the redis cache backend")?;

                info!("connecting to redis...");
                let redis = RedisDatabase::connect(redis_url).await?;
                Ok(Arc::new(RedisProxyCache::new(Arc::new(redis))) as DynProxyCacheService)
            }
        }
    }
}
