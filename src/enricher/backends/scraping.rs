// HTML-scraping backend

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use super::page::PageFetcher;
use super::{for_each_item, ItemOutcome};
use crate::enricher::config::ScrapingConfig;
use crate::enricher::context::RunContext;
use crate::enricher::errors::EnrichError;
use crate::enricher::models::{BackendKind, EnrichmentResult};
use crate::enricher::parsers::parse_watch_page;
use crate::enricher::traits::{BatchOutcome, EnrichmentBackend};
use crate::enricher::utils::retry_with_backoff;

pub struct ScrapingBackend {
    fetcher: PageFetcher,
    enabled: bool,
}

impl ScrapingBackend {
    pub fn new(config: &ScrapingConfig) -> Self {
        Self {
            fetcher: PageFetcher::new(config),
            enabled: config.enabled,
        }
    }

    async fn enrich_one(&self, video_id: &str, run: &RunContext) -> ItemOutcome {
        let start = Instant::now();
        let fetched = retry_with_backoff(
            run.retry_attempts(),
            run.retry_base_delay(),
            EnrichError::is_transient,
            |_| self.fetcher.fetch(video_id, run),
        )
        .await;

        let html = match fetched {
            Ok(html) => html,
            Err(e) => {
                debug!(video_id, error = %e, "[ScrapingBackend] Fetch failed");
                let result = EnrichmentResult::failure(video_id, BackendKind::Scraping, &e, start.elapsed());
                return ItemOutcome::failed(result, &e);
            }
        };

        let parsed = run
            .shared()
            .parser
            .parse_with(video_id, Arc::from(html), parse_watch_page)
            .await;

        match parsed {
            Some(data) => ItemOutcome::done(EnrichmentResult::success(
                video_id,
                BackendKind::Scraping,
                data,
                start.elapsed(),
            )),
            None => {
                let e = EnrichError::MalformedResponse("no metadata found on watch page".to_string());
                ItemOutcome::failed(
                    EnrichmentResult::failure(video_id, BackendKind::Scraping, &e, start.elapsed()),
                    &e,
                )
            }
        }
    }
}

#[async_trait]
impl EnrichmentBackend for ScrapingBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Scraping
    }

    fn name(&self) -> &'static str {
        "scraping"
    }

    fn is_available(&self) -> bool {
        self.enabled
    }

    async fn enrich(&self, batch: &[String], run: &RunContext) -> BatchOutcome {
        info!(count = batch.len(), "[ScrapingBackend] Scraping watch pages");
        for_each_item(batch, run, |id| self.enrich_one(id, run)).await
    }
}
