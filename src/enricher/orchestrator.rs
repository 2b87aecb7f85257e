// Orchestrator with fallback logic
//
// Per identifier: Selecting -> Attempting(backend) -> Succeeded | Failed(backend)
// -> Attempting(next) -> ... -> Exhausted. Each backend gets one full-batch
// pass over the identifiers still failing before the next one is tried.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::backends::{ApiBackend, LlmBackend, ScrapingBackend};
use super::cache::InFlightGuard;
use super::config::EnrichmentConfig;
use super::context::{PipelineContext, RunContext};
use super::errors::EnrichError;
use super::metrics::MetricsSnapshot;
use super::models::{BackendKind, EnrichmentResult, VideoRecord};
use super::scheduler::BatchScheduler;
use super::traits::{EnrichmentBackend, HaltReason};
use super::utils::extract_video_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FallbackState {
    Selecting,
    Attempting(BackendKind),
    Failed(BackendKind),
    Succeeded(BackendKind),
    Exhausted,
}

/// Attempt history of one identifier
#[derive(Debug, Clone)]
struct FallbackTrace {
    state: FallbackState,
    attempted: Vec<BackendKind>,
    last: Option<EnrichmentResult>,
}

impl FallbackTrace {
    fn new() -> Self {
        Self {
            state: FallbackState::Selecting,
            attempted: Vec::new(),
            last: None,
        }
    }

    fn wants(&self, kind: BackendKind) -> bool {
        matches!(self.state, FallbackState::Selecting | FallbackState::Failed(_))
            && !self.attempted.contains(&kind)
    }

    fn attempting(&mut self, kind: BackendKind) {
        self.state = FallbackState::Attempting(kind);
        self.attempted.push(kind);
    }

    fn finish(&mut self, result: EnrichmentResult) {
        self.state = if result.success {
            FallbackState::Succeeded(result.backend)
        } else {
            FallbackState::Failed(result.backend)
        };
        self.last = Some(result);
    }

    /// A halted backend never started this identifier: take the attempt back.
    /// The halt result is kept only when nothing ran before.
    fn skipped(&mut self, result: EnrichmentResult) {
        if self.attempted.last() == Some(&result.backend) {
            self.attempted.pop();
        }
        self.state = match &self.last {
            Some(previous) => FallbackState::Failed(previous.backend),
            None => FallbackState::Selecting,
        };
        if self.last.is_none() {
            self.last = Some(result);
        }
    }

    fn into_outcome(self, video_id: &str) -> IdentifierOutcome {
        let result = match self.last {
            Some(result) => result,
            None => EnrichmentResult::failure(
                video_id,
                BackendKind::CASCADE[0],
                &EnrichError::NoBackendAvailable,
                Duration::ZERO,
            ),
        };
        let state = match self.state {
            FallbackState::Succeeded(kind) => FallbackState::Succeeded(kind),
            _ => FallbackState::Exhausted,
        };
        IdentifierOutcome {
            video_id: video_id.to_string(),
            state,
            attempted: self.attempted,
            result,
        }
    }
}

/// Final outcome of one unique identifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifierOutcome {
    pub video_id: String,
    /// `Succeeded` or `Exhausted`
    pub state: FallbackState,
    /// Backends tried, in order (empty when served from cache)
    pub attempted: Vec<BackendKind>,
    pub result: EnrichmentResult,
}

impl IdentifierOutcome {
    fn cached(result: EnrichmentResult) -> Self {
        Self {
            video_id: result.video_id.clone(),
            state: FallbackState::Succeeded(result.backend),
            attempted: Vec::new(),
            result,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.result.success
    }

    /// Message appended to records whose enrichment was exhausted
    fn failure_message(&self) -> String {
        let tried: Vec<String> = self.attempted.iter().map(BackendKind::to_string).collect();
        format!(
            "enrichment failed after trying [{}]: {}",
            tried.join(", "),
            self.result.error.as_deref().unwrap_or("unknown error")
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendHalt {
    pub backend: BackendKind,
    pub reason: HaltReason,
}

/// Everything a run produced
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichmentReport {
    /// Input records, same order, enriched or carrying an error
    pub records: Vec<VideoRecord>,
    /// One per unique identifier, in first-seen order
    pub outcomes: Vec<IdentifierOutcome>,
    pub halts: Vec<BackendHalt>,
    pub metrics: MetricsSnapshot,
}

impl EnrichmentReport {
    pub fn outcome(&self, video_id: &str) -> Option<&IdentifierOutcome> {
        self.outcomes.iter().find(|o| o.video_id == video_id)
    }

    pub fn halted(&self, reason: HaltReason) -> bool {
        self.halts.iter().any(|h| h.reason == reason)
    }
}

pub struct EnrichmentPipeline {
    config: EnrichmentConfig,
    ctx: Arc<PipelineContext>,
    backends: Vec<Arc<dyn EnrichmentBackend>>,
    scheduler: BatchScheduler,
}

impl EnrichmentPipeline {
    /// Pipeline with the three standard backends. Backends missing
    /// credentials stay registered but unavailable.
    pub fn new(config: EnrichmentConfig) -> Result<Self, EnrichError> {
        config.validate()?;
        let ctx = Arc::new(PipelineContext::new(&config));
        let mut pipeline = Self::with_context(config, ctx);

        let llm = LlmBackend::new(&pipeline.config.llm, &pipeline.config.scraping);
        let api = ApiBackend::new(&pipeline.config.api);
        let scraping = ScrapingBackend::new(&pipeline.config.scraping);
        pipeline.add_backend(Arc::new(llm));
        pipeline.add_backend(Arc::new(api));
        pipeline.add_backend(Arc::new(scraping));
        Ok(pipeline)
    }

    /// Pipeline without backends over an existing (possibly shared) context
    pub fn with_context(config: EnrichmentConfig, ctx: Arc<PipelineContext>) -> Self {
        Self {
            scheduler: BatchScheduler::from_config(&config),
            config,
            ctx,
            backends: Vec::new(),
        }
    }

    /// Register a backend, replacing any backend of the same kind
    pub fn add_backend(&mut self, backend: Arc<dyn EnrichmentBackend>) {
        let kind = backend.kind();
        self.backends.retain(|b| b.kind() != kind);
        self.backends.push(backend);
    }

    pub fn config(&self) -> &EnrichmentConfig {
        &self.config
    }

    pub fn context(&self) -> &Arc<PipelineContext> {
        &self.ctx
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.ctx.metrics.snapshot(Some(self.ctx.quota.usage()))
    }

    /// Close connection pools and parser workers
    pub fn shutdown(&self) {
        self.ctx.shutdown();
    }

    /// Available backends in cascade order: the preferred one first, the rest
    /// in the default order. Without fallback only the preferred one runs.
    pub fn cascade_order(&self) -> Result<Vec<Arc<dyn EnrichmentBackend>>, EnrichError> {
        let preferred = self.config.preferred_backend;
        let mut kinds = vec![preferred];
        if self.config.enable_fallback {
            kinds.extend(BackendKind::CASCADE.iter().copied().filter(|k| *k != preferred));
        }

        let order: Vec<Arc<dyn EnrichmentBackend>> = kinds
            .into_iter()
            .filter_map(|kind| self.backends.iter().find(|b| b.kind() == kind))
            .filter(|b| b.is_available())
            .cloned()
            .collect();

        if order.is_empty() {
            return Err(EnrichError::NoBackendAvailable);
        }
        Ok(order)
    }

    /// Enrich `records`. Only configuration problems fail the call; every
    /// identifier's outcome is reported in the returned report.
    pub async fn enrich(&self, mut records: Vec<VideoRecord>) -> Result<EnrichmentReport, EnrichError> {
        self.config.validate()?;
        let order = self.cascade_order()?;
        let names: Vec<&str> = order.iter().map(|b| b.name()).collect();
        info!(records = records.len(), cascade = ?names, "[Orchestrator] Starting run");

        let run = RunContext::new(Arc::clone(&self.ctx), &self.config);
        let unique = assign_identifiers(&mut records);

        let mut outcomes: HashMap<String, IdentifierOutcome> = HashMap::with_capacity(unique.len());
        let mut misses = Vec::new();
        for id in &unique {
            match self.ctx.cache.lookup(id) {
                Some(entry) => {
                    self.ctx.metrics.record_cache_hit();
                    let result = EnrichmentResult::cached(id, entry.source, entry.data);
                    outcomes.insert(id.clone(), IdentifierOutcome::cached(result));
                }
                None => {
                    self.ctx.metrics.record_cache_miss();
                    misses.push(id.clone());
                }
            }
        }

        let mut halts = Vec::new();
        let elsewhere: Vec<String> = {
            let guard = InFlightGuard::claim(&self.ctx.cache, &misses);
            let claimed: HashSet<&String> = guard.ids().iter().collect();
            let elsewhere: Vec<String> = misses.iter().filter(|id| !claimed.contains(id)).cloned().collect();

            debug!(
                unique = unique.len(),
                cached = outcomes.len(),
                claimed = guard.ids().len(),
                "[Orchestrator] Dispatch set ready"
            );
            let traces = self.run_cascade(&order, guard.ids(), &run, &mut halts).await;
            for (id, trace) in traces {
                let outcome = trace.into_outcome(&id);
                outcomes.insert(id, outcome);
            }
            elsewhere
        };

        if !elsewhere.is_empty() {
            self.collect_concurrent(&elsewhere, &mut outcomes).await;
        }

        for record in records.iter_mut() {
            let Some(outcome) = record.video_id.as_ref().and_then(|id| outcomes.get(id)) else {
                continue;
            };
            match (&outcome.result.data, outcome.result.success) {
                (Some(data), true) => record.merge(data, outcome.result.backend),
                _ => record.record_error(outcome.failure_message()),
            }
        }

        let outcomes: Vec<IdentifierOutcome> = unique
            .iter()
            .filter_map(|id| outcomes.remove(id))
            .collect();
        let succeeded = outcomes.iter().filter(|o| o.succeeded()).count();
        info!(
            unique = outcomes.len(),
            succeeded,
            failed = outcomes.len() - succeeded,
            cost = run.cost.spent(),
            "[Orchestrator] Run finished"
        );

        Ok(EnrichmentReport {
            records,
            outcomes,
            halts,
            metrics: self.metrics(),
        })
    }

    async fn run_cascade(
        &self,
        order: &[Arc<dyn EnrichmentBackend>],
        ids: &[String],
        run: &RunContext,
        halts: &mut Vec<BackendHalt>,
    ) -> HashMap<String, FallbackTrace> {
        let mut traces: HashMap<String, FallbackTrace> =
            ids.iter().map(|id| (id.clone(), FallbackTrace::new())).collect();

        for backend in order {
            let kind = backend.kind();
            let pending: Vec<String> = ids
                .iter()
                .filter(|id| traces.get(*id).map_or(false, |t| t.wants(kind)))
                .cloned()
                .collect();
            if pending.is_empty() {
                break;
            }

            info!(backend = backend.name(), count = pending.len(), "[Orchestrator] Trying backend");
            for id in &pending {
                if let Some(trace) = traces.get_mut(id) {
                    trace.attempting(kind);
                }
            }

            let scheduled = self.scheduler.run(backend.as_ref(), &pending, run).await;
            if let Some(reason) = scheduled.halt {
                warn!(backend = backend.name(), reason = %reason, "[Orchestrator] Backend halted for this run");
                halts.push(BackendHalt { backend: kind, reason });
            }
            let unattempted: HashSet<&String> = scheduled.unattempted.iter().collect();

            let mut succeeded = 0;
            for result in scheduled.results {
                if unattempted.contains(&result.video_id) {
                    if let Some(trace) = traces.get_mut(&result.video_id) {
                        trace.skipped(result);
                    }
                    continue;
                }
                self.ctx.metrics.record_result(&result);
                if result.success {
                    succeeded += 1;
                    if let Some(data) = &result.data {
                        self.ctx.cache.store(&result.video_id, data.clone(), kind, None);
                    }
                } else {
                    debug!(
                        video_id = %result.video_id,
                        backend = backend.name(),
                        error = result.error.as_deref().unwrap_or(""),
                        "[Orchestrator] Attempt failed"
                    );
                }
                if let Some(trace) = traces.get_mut(&result.video_id) {
                    trace.finish(result);
                }
            }
            info!(
                backend = backend.name(),
                succeeded,
                failed = pending.len() - succeeded - unattempted.len(),
                unattempted = unattempted.len(),
                "[Orchestrator] Backend pass finished"
            );
        }

        traces
    }

    /// Identifiers another run was processing: wait for it, then read the cache
    async fn collect_concurrent(&self, ids: &[String], outcomes: &mut HashMap<String, IdentifierOutcome>) {
        let timeout = self.config.request_timeout();
        if !self.ctx.cache.wait_until_settled(ids, timeout).await {
            warn!(count = ids.len(), "[Orchestrator] Timed out waiting for a concurrent run");
        }

        for id in ids {
            let outcome = match self.ctx.cache.lookup(id) {
                Some(entry) => {
                    self.ctx.metrics.record_cache_hit();
                    IdentifierOutcome::cached(EnrichmentResult::cached(id, entry.source, entry.data))
                }
                None => IdentifierOutcome {
                    video_id: id.clone(),
                    state: FallbackState::Exhausted,
                    attempted: Vec::new(),
                    result: EnrichmentResult::failure(
                        id,
                        self.config.preferred_backend,
                        &EnrichError::NotFound("a concurrent run for this id produced no data".to_string()),
                        Duration::ZERO,
                    ),
                },
            };
            outcomes.insert(id.clone(), outcome);
        }
    }
}

/// Fill in each record's identifier and return the unique identifiers in
/// first-seen order. Records without one get an error.
fn assign_identifiers(records: &mut [VideoRecord]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut unique = Vec::new();

    for record in records.iter_mut() {
        let id = record
            .video_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .or_else(|| extract_video_id(&record.url));

        match id {
            Some(id) => {
                if seen.insert(id.clone()) {
                    unique.push(id.clone());
                }
                record.video_id = Some(id);
            }
            None => {
                let error = EnrichError::InvalidUrl(format!("no video id in '{}'", record.url));
                record.record_error(error.to_string());
            }
        }
    }

    unique
}
