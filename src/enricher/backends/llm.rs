// Language-model extraction backend
//
// Fetches the watch page, cuts a bounded excerpt and asks an
// OpenAI-compatible chat endpoint for a JSON object. Spend is checked
// before every item and every attempt; once the run's ceiling is reached
// the remaining items are not started.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::page::PageFetcher;
use super::{for_each_item, ItemOutcome};
use crate::enricher::config::{LlmConfig, ScrapingConfig};
use crate::enricher::context::RunContext;
use crate::enricher::errors::EnrichError;
use crate::enricher::models::{BackendKind, EnrichmentResult, ResourceUsage};
use crate::enricher::parsers::{extract_excerpt, parse_llm_response, truncate_chars};
use crate::enricher::quota::{ModelPricing, PricingTable};
use crate::enricher::traits::{BatchOutcome, EnrichmentBackend, HaltReason};
use crate::enricher::utils::{backoff_delay, retry_with_backoff};

const SYSTEM_PROMPT: &str = "You extract video metadata from fragments of a video watch page. \
Reply with ONLY a JSON object, no prose and no code fences, using these keys \
(omit any you cannot find): title, description, channelName, channelId, \
durationSeconds (integer), viewCount (integer), likeCount (integer), \
commentCount (integer), publishedAt (ISO 8601), tags (array of strings), \
thumbnailUrl, category, isLivestream (boolean), isShort (boolean).";

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

struct Completion {
    text: String,
    usage: ResourceUsage,
}

pub struct LlmBackend {
    config: LlmConfig,
    endpoint: String,
    fetcher: PageFetcher,
    pricing: ModelPricing,
    /// Cost of the most recent completion, used to estimate the next one
    last_call_micros: AtomicU64,
}

impl LlmBackend {
    pub fn new(config: &LlmConfig, scraping: &ScrapingConfig) -> Self {
        Self {
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            pricing: PricingTable::default().lookup(&config.model),
            fetcher: PageFetcher::new(scraping),
            last_call_micros: AtomicU64::new(0),
            config: config.clone(),
        }
    }

    pub fn with_pricing(mut self, table: PricingTable) -> Self {
        self.pricing = table.lookup(&self.config.model);
        self
    }

    /// Expected cost of one completion: the last observed cost, or before
    /// any call a rough token count of the prompt plus the full output budget
    fn estimate_micros(&self, excerpt: &str) -> u64 {
        let last = self.last_call_micros.load(Ordering::Relaxed);
        if last > 0 {
            return last;
        }
        let prompt_tokens = ((SYSTEM_PROMPT.len() + excerpt.len()) / 4) as u64;
        self.pricing
            .cost_micros(&ResourceUsage::tokens(prompt_tokens, u64::from(self.config.max_tokens)))
    }

    async fn complete(&self, excerpt: &str, run: &RunContext) -> Result<Completion, EnrichError> {
        let api_key = self.config.api_key.as_deref().unwrap_or_default();
        let body = serde_json::json!({
            "model": self.config.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": excerpt},
            ],
            "temperature": 0,
            "max_tokens": self.config.max_tokens,
        });

        let pool = run.shared().pools.for_url(&self.endpoint)?;
        let connection = pool.acquire().await?;
        let response = connection
            .client()
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(EnrichError::from_status(status.as_u16(), &text));
        }

        let parsed: ChatResponse = serde_json::from_str(&text)?;
        let usage = parsed
            .usage
            .map(|u| ResourceUsage::tokens(u.prompt_tokens, u.completion_tokens))
            .unwrap_or_default();
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| EnrichError::MalformedResponse("no choices in completion".to_string()))?;

        Ok(Completion { text: content, usage })
    }

    async fn excerpt_for(&self, video_id: &str, run: &RunContext) -> Result<String, EnrichError> {
        let html = retry_with_backoff(
            run.retry_attempts(),
            run.retry_base_delay(),
            EnrichError::is_transient,
            |_| self.fetcher.fetch(video_id, run),
        )
        .await?;

        let excerpt = run
            .shared()
            .parser
            .parse_with(video_id, Arc::from(html), extract_excerpt)
            .await
            .ok_or_else(|| EnrichError::MalformedResponse("watch page has no metadata to extract".to_string()))?;

        Ok(truncate_chars(&excerpt, self.config.max_excerpt_chars))
    }

    async fn enrich_one(&self, video_id: &str, run: &RunContext) -> ItemOutcome {
        if run.cost.check().is_err() {
            return ItemOutcome::not_started(Some(HaltReason::CostLimitReached));
        }
        let start = Instant::now();

        let excerpt = match self.excerpt_for(video_id, run).await {
            Ok(excerpt) => excerpt,
            Err(e) => {
                debug!(video_id, error = %e, "[LlmBackend] No excerpt");
                let result = EnrichmentResult::failure(video_id, BackendKind::Llm, &e, start.elapsed());
                return ItemOutcome::failed(result, &e);
            }
        };

        let max_attempts = self.config.max_attempts.max(1);
        let base_delay = Duration::from_millis(self.config.retry_base_delay_ms);
        let mut spent = 0.0;
        let mut usage = ResourceUsage::default();
        let mut attempt = 0;

        loop {
            let reservation = match run.cost.reserve(self.estimate_micros(&excerpt)).await {
                Ok(reservation) => reservation,
                Err(e) => {
                    let result = EnrichmentResult::failure(video_id, BackendKind::Llm, &e, start.elapsed())
                        .with_cost(spent, usage);
                    return ItemOutcome::failed(result, &e);
                }
            };

            let error = match self.complete(&excerpt, run).await {
                Ok(completion) => {
                    let call_usage = completion.usage;
                    let call_micros = self.pricing.cost_micros(&call_usage);
                    self.last_call_micros.store(call_micros, Ordering::Relaxed);
                    spent += reservation.settle(call_micros, &call_usage);
                    usage.prompt_tokens += call_usage.prompt_tokens;
                    usage.completion_tokens += call_usage.completion_tokens;

                    match parse_llm_response(&completion.text) {
                        Ok(data) => {
                            let result = EnrichmentResult::success(video_id, BackendKind::Llm, data, start.elapsed())
                                .with_cost(spent, usage);
                            return ItemOutcome::done(result);
                        }
                        Err(e) => e,
                    }
                }
                Err(e) => {
                    drop(reservation);
                    e
                }
            };

            attempt += 1;
            let retryable = error.is_transient()
                || matches!(error, EnrichError::MalformedResponse(_) | EnrichError::RateLimited(_));
            if attempt >= max_attempts || !retryable {
                warn!(video_id, attempt, error = %error, "[LlmBackend] Giving up");
                let result = EnrichmentResult::failure(video_id, BackendKind::Llm, &error, start.elapsed())
                    .with_cost(spent, usage);
                return ItemOutcome::failed(result, &error);
            }

            let delay = backoff_delay(base_delay, attempt - 1);
            debug!(video_id, attempt, delay_ms = delay.as_millis() as u64, error = %error, "[LlmBackend] Retrying");
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl EnrichmentBackend for LlmBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Llm
    }

    fn name(&self) -> &'static str {
        "llm"
    }

    fn is_available(&self) -> bool {
        self.config.api_key.as_deref().map_or(false, |k| !k.is_empty())
    }

    async fn enrich(&self, batch: &[String], run: &RunContext) -> BatchOutcome {
        info!(
            count = batch.len(),
            model = %self.config.model,
            spent = run.cost.spent(),
            limit = run.cost.limit(),
            "[LlmBackend] Extracting with language model"
        );
        let outcome = for_each_item(batch, run, |id| self.enrich_one(id, run)).await;
        if outcome.halt == Some(HaltReason::CostLimitReached) {
            warn!(spent = run.cost.spent(), limit = run.cost.limit(), "[LlmBackend] Cost limit reached");
        }
        outcome
    }
}
