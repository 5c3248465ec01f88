pub mod edge_services;
pub mod proxy_cache_services;
pub mod stats_services;
pub mod upstream_services;

pub use proxy_cache_services::DynProxyCacheService;
pub use stats_services::DynStatsService;
pub use upstream_services::DynUpstreamService;
