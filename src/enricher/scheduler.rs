// Batch scheduler
//
// Splits identifiers into fixed-size chunks, hands them to one backend with
// a pause between chunks, and returns exactly one result per input id in
// input order.

use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::config::EnrichmentConfig;
use super::context::RunContext;
use super::errors::EnrichError;
use super::models::EnrichmentResult;
use super::traits::{EnrichmentBackend, HaltReason};

/// Results of one backend over a full identifier list
#[derive(Debug, Clone, Default)]
pub struct ScheduledRun {
    /// One per input identifier, in input order
    pub results: Vec<EnrichmentResult>,
    pub halt: Option<HaltReason>,
    /// Identifiers the backend never started because it halted
    pub unattempted: Vec<String>,
}

pub struct BatchScheduler {
    batch_size: usize,
    inter_batch_delay: Duration,
}

impl BatchScheduler {
    pub fn new(batch_size: usize, inter_batch_delay: Duration) -> Self {
        Self {
            batch_size: batch_size.max(1),
            inter_batch_delay,
        }
    }

    pub fn from_config(config: &EnrichmentConfig) -> Self {
        Self::new(config.batch_size, config.inter_batch_delay())
    }

    pub async fn run(
        &self,
        backend: &dyn EnrichmentBackend,
        ids: &[String],
        run: &RunContext,
    ) -> ScheduledRun {
        let mut by_id: HashMap<String, EnrichmentResult> = HashMap::with_capacity(ids.len());
        let mut halt = None;
        let chunk_count = (ids.len() + self.batch_size - 1) / self.batch_size;

        for (index, chunk) in ids.chunks(self.batch_size).enumerate() {
            if index > 0 && !self.inter_batch_delay.is_zero() {
                debug!(
                    delay_ms = self.inter_batch_delay.as_millis() as u64,
                    "[Scheduler] Pausing between chunks"
                );
                tokio::time::sleep(self.inter_batch_delay).await;
            }

            debug!(
                backend = backend.name(),
                chunk = index + 1,
                of = chunk_count,
                size = chunk.len(),
                "[Scheduler] Dispatching chunk"
            );
            let outcome = backend.enrich(chunk, run).await;

            for result in outcome.results {
                if !chunk.contains(&result.video_id) {
                    warn!(video_id = %result.video_id, backend = backend.name(), "[Scheduler] Dropping result for unrequested id");
                    continue;
                }
                if by_id.contains_key(&result.video_id) {
                    warn!(video_id = %result.video_id, backend = backend.name(), "[Scheduler] Dropping duplicate result");
                    continue;
                }
                by_id.insert(result.video_id.clone(), result);
            }

            if let Some(reason) = outcome.halt {
                info!(
                    backend = backend.name(),
                    reason = %reason,
                    remaining_chunks = chunk_count - index - 1,
                    "[Scheduler] Backend halted"
                );
                halt = Some(reason);
                break;
            }
        }

        let mut unattempted = Vec::new();
        let results = ids
            .iter()
            .map(|id| match by_id.get(id) {
                Some(result) => result.clone(),
                None => {
                    let error = match halt {
                        Some(reason) => {
                            unattempted.push(id.clone());
                            halt_error(reason, run)
                        }
                        None => EnrichError::MalformedResponse(format!(
                            "{} backend returned no result",
                            backend.name()
                        )),
                    };
                    EnrichmentResult::failure(id, backend.kind(), &error, Duration::ZERO)
                }
            })
            .collect();

        ScheduledRun {
            results,
            halt,
            unattempted,
        }
    }
}

/// Error recorded for identifiers a halted backend never started
fn halt_error(reason: HaltReason, run: &RunContext) -> EnrichError {
    match reason {
        HaltReason::QuotaExhausted => {
            let usage = run.shared().quota.usage();
            EnrichError::QuotaExhausted {
                used: usage.used,
                limit: usage.limit,
            }
        }
        HaltReason::CostLimitReached => EnrichError::CostLimitReached {
            spent: run.cost.spent(),
            limit: run.cost.limit(),
        },
        HaltReason::RateLimited => {
            EnrichError::RateLimited("backend stopped earlier in this run".to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enricher::context::PipelineContext;
    use crate::enricher::models::{BackendKind, ScrapedVideoData};
    use crate::enricher::traits::BatchOutcome;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    /// Answers in reverse order; optionally halts once `halt_after` chunks ran
    struct ReversingBackend {
        chunks_seen: Mutex<Vec<Vec<String>>>,
        halt_after: Option<usize>,
        drop_id: Option<&'static str>,
        calls: AtomicUsize,
    }

    impl ReversingBackend {
        fn new() -> Self {
            Self {
                chunks_seen: Mutex::new(Vec::new()),
                halt_after: None,
                drop_id: None,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl EnrichmentBackend for ReversingBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Scraping
        }

        fn name(&self) -> &'static str {
            "reversing"
        }

        async fn enrich(&self, batch: &[String], _run: &RunContext) -> BatchOutcome {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.chunks_seen.lock().unwrap().push(batch.to_vec());
            let results = batch
                .iter()
                .rev()
                .filter(|id| Some(id.as_str()) != self.drop_id)
                .map(|id| {
                    let data = ScrapedVideoData {
                        title: Some(format!("title-{}", id)),
                        ..Default::default()
                    };
                    EnrichmentResult::success(id, BackendKind::Scraping, data, Duration::ZERO)
                })
                .collect();
            match self.halt_after {
                Some(n) if call >= n => BatchOutcome::halted(results, HaltReason::QuotaExhausted),
                _ => BatchOutcome::new(results),
            }
        }
    }

    fn run_context() -> RunContext {
        let config = EnrichmentConfig::default();
        RunContext::new(Arc::new(PipelineContext::new(&config)), &config)
    }

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("id{:02}", i)).collect()
    }

    #[tokio::test]
    async fn test_chunks_and_order() {
        let backend = ReversingBackend::new();
        let scheduler = BatchScheduler::new(4, Duration::ZERO);
        let input = ids(10);

        let scheduled = scheduler.run(&backend, &input, &run_context()).await;

        let chunk_sizes: Vec<usize> = backend.chunks_seen.lock().unwrap().iter().map(Vec::len).collect();
        assert_eq!(chunk_sizes, vec![4, 4, 2]);
        let order: Vec<&str> = scheduled.results.iter().map(|r| r.video_id.as_str()).collect();
        let expected: Vec<&str> = input.iter().map(String::as_str).collect();
        assert_eq!(order, expected);
        assert!(scheduled.results.iter().all(|r| r.success));
        assert_eq!(scheduled.halt, None);
    }

    #[tokio::test]
    async fn test_missing_result_is_filled() {
        let mut backend = ReversingBackend::new();
        backend.drop_id = Some("id01");
        let scheduler = BatchScheduler::new(10, Duration::ZERO);

        let scheduled = scheduler.run(&backend, &ids(3), &run_context()).await;
        assert_eq!(scheduled.results.len(), 3);
        assert!(!scheduled.results[1].success);
        assert!(scheduled.results[1].error.as_deref().unwrap().contains("no result"));
    }

    #[tokio::test]
    async fn test_halt_skips_remaining_chunks() {
        let mut backend = ReversingBackend::new();
        backend.halt_after = Some(1);
        let scheduler = BatchScheduler::new(3, Duration::ZERO);

        let scheduled = scheduler.run(&backend, &ids(9), &run_context()).await;
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert_eq!(scheduled.halt, Some(HaltReason::QuotaExhausted));
        assert_eq!(scheduled.results.len(), 9);
        assert_eq!(scheduled.unattempted, ids(9)[3..].to_vec());
        assert!(scheduled.results[..3].iter().all(|r| r.success));
        assert!(scheduled.results[3..]
            .iter()
            .all(|r| r.error.as_deref().unwrap().starts_with("Quota exhausted")));
    }

    #[tokio::test]
    async fn test_delay_only_between_chunks() {
        let backend = ReversingBackend::new();
        let scheduler = BatchScheduler::new(5, Duration::from_millis(300));

        let start = Instant::now();
        scheduler.run(&backend, &ids(5), &run_context()).await;
        assert!(start.elapsed() < Duration::from_millis(250));

        let start = Instant::now();
        scheduler.run(&backend, &ids(10), &run_context()).await;
        assert!(start.elapsed() >= Duration::from_millis(300));
    }
}
