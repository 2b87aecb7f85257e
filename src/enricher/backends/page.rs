// Watch-page fetcher shared by the scraping and LLM backends

use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, USER_AGENT};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::enricher::config::ScrapingConfig;
use crate::enricher::context::RunContext;
use crate::enricher::diagnostics::diagnose_page;
use crate::enricher::errors::EnrichError;
use crate::enricher::utils::IdentityRotation;

pub struct PageFetcher {
    watch_base_url: String,
    courtesy_delay: Duration,
    last_request: Mutex<Option<Instant>>,
    identities: IdentityRotation,
}

impl PageFetcher {
    pub fn new(config: &ScrapingConfig) -> Self {
        Self {
            watch_base_url: config.watch_base_url.trim_end_matches('/').to_string(),
            courtesy_delay: Duration::from_millis(config.courtesy_delay_ms),
            last_request: Mutex::new(None),
            identities: IdentityRotation::new(),
        }
    }

    pub fn watch_url(&self, video_id: &str) -> String {
        format!("{}/watch?v={}", self.watch_base_url, video_id)
    }

    /// Keep dispatched page requests at least `courtesy_delay` apart
    async fn enforce_courtesy_delay(&self) {
        if self.courtesy_delay.is_zero() {
            return;
        }
        let mut last_request = self.last_request.lock().await;

        if let Some(last_time) = *last_request {
            let elapsed = last_time.elapsed();
            if elapsed < self.courtesy_delay {
                let pause = self.courtesy_delay - elapsed;
                debug!(sleep_ms = pause.as_millis() as u64, "[PageFetcher] Courtesy delay");
                sleep(pause).await;
            }
        }

        *last_request = Some(Instant::now());
    }

    /// Fetch the watch page for `video_id`. Blocked pages (consent wall,
    /// captcha) come back as `RateLimited`; unavailable videos as `NotFound`.
    pub async fn fetch(&self, video_id: &str, run: &RunContext) -> Result<String, EnrichError> {
        let url = self.watch_url(video_id);
        let pool = run.shared().pools.for_url(&url)?;

        self.enforce_courtesy_delay().await;
        let connection = pool.acquire().await?;
        let identity = self.identities.next_identity();

        debug!(video_id, url = %url, "[PageFetcher] GET watch page");
        let response = connection
            .client()
            .get(&url)
            .header(USER_AGENT, identity.user_agent)
            .header(ACCEPT_LANGUAGE, identity.accept_language)
            .header(ACCEPT, "text/html,application/xhtml+xml")
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(EnrichError::from_status(status.as_u16(), &body));
        }

        if let Some(reason) = diagnose_page(&body) {
            debug!(video_id, reason = reason.description(), "[PageFetcher] Page refused");
            return Err(reason.into_error(video_id));
        }

        Ok(body)
    }
}
