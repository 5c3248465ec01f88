use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::server::dtos::stats_dto::StatsSnapshot;

pub type DynStatsService = Arc<StatsService>;

/// proxy counters, every method is a single relaxed atomic add so any request task can call
/// them without coordination. each bump is mirrored to the metrics facade for /metrics
pub struct StatsService {
    requests_total: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    retries: AtomicU64,
    errors: AtomicU64,
    started_at: Instant,
}

impl StatsService {
    pub fn new() -> Self {
        Self {
            requests_total: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn record_request(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("proxy_requests_total").increment(1);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("proxy_cache_hits_total").increment(1);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("proxy_cache_misses_total").increment(1);
    }

    pub fn record_retries(&self, count: u64) {
        if count == 0 {
            return;
        }
        self.retries.fetch_add(count, Ordering::Relaxed);
        metrics::counter!("proxy_upstream_retries_total").increment(count);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("proxy_errors_total").increment(1);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let cache_hits = self.cache_hits.load(Ordering::Relaxed);
        let cache_misses = self.cache_misses.load(Ordering::Relaxed);

        StatsSnapshot {
            requests: self.requests_total.load(Ordering::Relaxed),
            cache_hits,
            cache_misses,
            retries: self.retries.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            cache_hit_rate: hit_rate(cache_hits, cache_misses),
            uptime: self.started_at.elapsed().as_secs(),
        }
    }
}

impl Default for StatsService {
    fn default() -> Self {
        Self::new()
    }
}

fn hit_rate(hits: u64, misses: u64) -> f64 {
    let lookups = hits + misses;
    if lookups == 0 {
        0.0
    } else {
        hits as f64 / lookups as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_rate_is_zero_without_lookups() {
        let stats = StatsService::new();
        assert_eq!(stats.snapshot().cache_hit_rate, 0.0);
    }

    #[test]
    fn snapshot_reflects_counters() {
        let stats = StatsService::new();
        stats.record_request();
        stats.record_request();
        stats.record_cache_hit();
        stats.record_cache_hit();
        stats.record_cache_hit();
        stats.record_cache_miss();
        stats.record_retries(3);
        stats.record_retries(0);
        stats.record_error();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.requests, 2);
        assert_eq!(snapshot.cache_hits, 3);
        assert_eq!(snapshot.cache_misses, 1);
        assert_eq!(snapshot.retries, 3);
        assert_eq!(snapshot.errors, 1);
        assert!((snapshot.cache_hit_rate - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        let stats = Arc::new(StatsService::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stats = stats.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        stats.record_request();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(stats.snapshot().requests, 8000);
    }

    #[test]
    fn snapshot_serializes_camel_case() {
        let json = serde_json::to_value(StatsService::new().snapshot()).unwrap();
        assert!(json.get("cacheHits").is_some());
        assert!(json.get("cacheHitRate").is_some());
        assert!(json.get("uptime").is_some());
    }
}
