use serde::Serialize;

/// point in time copy of the proxy counters
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub requests: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub retries: u64,
    pub errors: u64,
    pub cache_hit_rate: f64,
    // seconds
    pub uptime: u64,
}
