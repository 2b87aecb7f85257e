// Enrichment backends

pub mod api;
pub mod llm;
pub mod page;
pub mod scraping;

pub use api::ApiBackend;
pub use llm::LlmBackend;
pub use page::PageFetcher;
pub use scraping::ScrapingBackend;

use futures::stream::{FuturesUnordered, StreamExt};
use std::future::Future;

use super::context::RunContext;
use super::errors::EnrichError;
use super::models::EnrichmentResult;
use super::traits::{BatchOutcome, HaltReason};

/// Outcome of one identifier inside a per-item backend
pub(crate) struct ItemOutcome {
    result: Option<EnrichmentResult>,
    halt: Option<HaltReason>,
}

impl ItemOutcome {
    pub(crate) fn done(result: EnrichmentResult) -> Self {
        Self { result: Some(result), halt: None }
    }

    /// A finished attempt; halting errors stop the rest of the batch
    pub(crate) fn failed(result: EnrichmentResult, error: &EnrichError) -> Self {
        Self {
            result: Some(result),
            halt: HaltReason::from_error(error),
        }
    }

    /// The item was never started
    pub(crate) fn not_started(halt: Option<HaltReason>) -> Self {
        Self { result: None, halt }
    }
}

/// Run `enrich_one` over `batch` with at most `run.max_concurrent()` items
/// in flight. After the first halting outcome no further item is started;
/// in-flight items finish normally.
pub(crate) async fn for_each_item<'a, F, Fut>(
    batch: &'a [String],
    run: &RunContext,
    enrich_one: F,
) -> BatchOutcome
where
    F: Fn(&'a str) -> Fut,
    Fut: Future<Output = ItemOutcome> + 'a,
{
    let limit = run.max_concurrent();
    let mut queued = batch.iter();
    let mut in_flight = FuturesUnordered::new();
    let mut results = Vec::with_capacity(batch.len());
    let mut halt: Option<HaltReason> = None;

    loop {
        while halt.is_none() && in_flight.len() < limit {
            match queued.next() {
                Some(id) => in_flight.push(enrich_one(id.as_str())),
                None => break,
            }
        }

        let Some(outcome) = in_flight.next().await else {
            break;
        };
        if let Some(result) = outcome.result {
            results.push(result);
        }
        if halt.is_none() {
            halt = outcome.halt;
        }
    }

    BatchOutcome { results, halt }
}
