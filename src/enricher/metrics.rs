// Read-only metrics surface for the observability collaborator

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use super::models::{BackendKind, EnrichmentResult};
use super::quota::QuotaUsage;

#[derive(Debug, Clone, Copy, Default)]
struct BackendCounters {
    requests: u64,
    successes: u64,
    failures: u64,
    latency_micros: u64,
}

#[derive(Default)]
pub struct PipelineMetrics {
    requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    latency_micros: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cost_micros: AtomicU64,
    per_backend: Mutex<HashMap<BackendKind, BackendCounters>>,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one backend attempt (cache hits are recorded separately)
    pub fn record_result(&self, result: &EnrichmentResult) {
        if result.from_cache {
            return;
        }
        let latency = result.elapsed.as_micros() as u64;
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.latency_micros.fetch_add(latency, Ordering::Relaxed);
        if result.success {
            self.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        self.cost_micros
            .fetch_add((result.cost * 1_000_000.0).round() as u64, Ordering::Relaxed);

        let mut per_backend = self.per_backend.lock().unwrap_or_else(PoisonError::into_inner);
        let counters = per_backend.entry(result.backend).or_default();
        counters.requests += 1;
        counters.latency_micros += latency;
        if result.success {
            counters.successes += 1;
        } else {
            counters.failures += 1;
        }
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, quota: Option<QuotaUsage>) -> MetricsSnapshot {
        let requests = self.requests.load(Ordering::Relaxed);
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let lookups = hits + self.cache_misses.load(Ordering::Relaxed);

        let per_backend = self
            .per_backend
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(kind, c)| {
                (
                    *kind,
                    BackendSnapshot {
                        requests: c.requests,
                        successes: c.successes,
                        failures: c.failures,
                        avg_latency_ms: average_ms(c.latency_micros, c.requests),
                    },
                )
            })
            .collect();

        MetricsSnapshot {
            requests,
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            avg_latency_ms: average_ms(self.latency_micros.load(Ordering::Relaxed), requests),
            cache_hits: hits,
            cache_hit_rate: if lookups == 0 { 0.0 } else { hits as f64 / lookups as f64 },
            cumulative_cost: self.cost_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0,
            quota_remaining: quota.as_ref().map(|q| q.remaining),
            quota,
            per_backend,
        }
    }
}

fn average_ms(total_micros: u64, count: u64) -> f64 {
    if count == 0 {
        return 0.0;
    }
    Duration::from_micros(total_micros / count).as_secs_f64() * 1_000.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendSnapshot {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub avg_latency_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub avg_latency_ms: f64,
    pub cache_hits: u64,
    pub cache_hit_rate: f64,
    /// USD across all runs
    pub cumulative_cost: f64,
    pub quota_remaining: Option<u64>,
    pub quota: Option<QuotaUsage>,
    pub per_backend: HashMap<BackendKind, BackendSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enricher::errors::EnrichError;
    use crate::enricher::models::{ResourceUsage, ScrapedVideoData};

    #[test]
    fn test_snapshot_counts() {
        let metrics = PipelineMetrics::new();
        let data = ScrapedVideoData {
            title: Some("t".to_string()),
            ..Default::default()
        };

        metrics.record_result(
            &EnrichmentResult::success("a", BackendKind::Llm, data.clone(), Duration::from_millis(30))
                .with_cost(0.25, ResourceUsage::tokens(10, 5)),
        );
        metrics.record_result(&EnrichmentResult::failure(
            "b",
            BackendKind::Api,
            &EnrichError::NotFound("gone".into()),
            Duration::from_millis(10),
        ));
        metrics.record_result(&EnrichmentResult::cached("c", BackendKind::Api, data));
        metrics.record_cache_hit();
        metrics.record_cache_miss();
        metrics.record_cache_miss();
        metrics.record_cache_miss();

        let snapshot = metrics.snapshot(None);
        assert_eq!(snapshot.requests, 2);
        assert_eq!(snapshot.successes, 1);
        assert_eq!(snapshot.failures, 1);
        assert!((snapshot.avg_latency_ms - 20.0).abs() < 1e-6);
        assert!((snapshot.cache_hit_rate - 0.25).abs() < 1e-9);
        assert!((snapshot.cumulative_cost - 0.25).abs() < 1e-9);
        assert_eq!(snapshot.per_backend[&BackendKind::Llm].successes, 1);
        assert_eq!(snapshot.per_backend[&BackendKind::Api].failures, 1);
        assert_eq!(snapshot.quota_remaining, None);
    }
}
