// Shared and per-run state handed to every backend

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::cache::VideoCache;
use super::config::EnrichmentConfig;
use super::metrics::PipelineMetrics;
use super::pool::{ConnectionPools, PoolSettings};
use super::quota::{CostTracker, QuotaTracker};
use super::worker_pool::ParserPool;

/// Process-wide state: lives as long as the pipeline and survives runs
pub struct PipelineContext {
    pub cache: VideoCache,
    pub quota: QuotaTracker,
    pub pools: ConnectionPools,
    pub parser: ParserPool,
    pub metrics: PipelineMetrics,
}

impl PipelineContext {
    pub fn new(config: &EnrichmentConfig) -> Self {
        Self {
            cache: VideoCache::new(config.cache_ttl()),
            quota: QuotaTracker::new(config.quota_limit),
            pools: ConnectionPools::new(PoolSettings::from_config(&config.network)),
            parser: ParserPool::new(config.network.parser_workers),
            metrics: PipelineMetrics::new(),
        }
    }

    pub fn shutdown(&self) {
        self.pools.shutdown();
        self.parser.shutdown();
        info!("[PipelineContext] Pools closed");
    }
}

/// State scoped to a single `enrich` call
pub struct RunContext {
    shared: Arc<PipelineContext>,
    pub cost: CostTracker,
    max_concurrent: usize,
    retry_attempts: u32,
    retry_base_delay: Duration,
}

impl RunContext {
    pub fn new(shared: Arc<PipelineContext>, config: &EnrichmentConfig) -> Self {
        Self {
            shared,
            cost: CostTracker::new(config.cost_limit),
            max_concurrent: config.max_concurrent_requests.max(1),
            retry_attempts: config.network.max_retries + 1,
            retry_base_delay: Duration::from_millis(config.network.retry_base_delay_ms),
        }
    }

    pub fn shared(&self) -> &PipelineContext {
        &self.shared
    }

    /// Maximum identifiers a backend may have in flight at once
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Attempts per identifier for transient network failures
    pub fn retry_attempts(&self) -> u32 {
        self.retry_attempts
    }

    pub fn retry_base_delay(&self) -> Duration {
        self.retry_base_delay
    }
}
