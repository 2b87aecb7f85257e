// Structured metadata API backend
//
// One `videos` call per chunk of up to `maxIdsPerRequest` ids. Every HTTP
// call reserves quota first; when the reservation fails the call is never
// sent and the backend halts for the run.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::enricher::config::ApiConfig;
use crate::enricher::context::RunContext;
use crate::enricher::errors::EnrichError;
use crate::enricher::models::{classify_content, BackendKind, EnrichmentResult, ResourceUsage, ScrapedVideoData, StreamState};
use crate::enricher::traits::{BatchOutcome, EnrichmentBackend, HaltReason};
use crate::enricher::utils::{normalize_date, parse_count, parse_iso8601_duration, retry_with_backoff};

const VIDEO_PARTS: &str = "snippet,contentDetails,statistics";

/// Standard video categories
const CATEGORIES: &[(&str, &str)] = &[
    ("1", "Film & Animation"),
    ("2", "Autos & Vehicles"),
    ("10", "Music"),
    ("15", "Pets & Animals"),
    ("17", "Sports"),
    ("18", "Short Movies"),
    ("19", "Travel & Events"),
    ("20", "Gaming"),
    ("21", "Videoblogging"),
    ("22", "People & Blogs"),
    ("23", "Comedy"),
    ("24", "Entertainment"),
    ("25", "News & Politics"),
    ("26", "Howto & Style"),
    ("27", "Education"),
    ("28", "Science & Technology"),
    ("29", "Nonprofits & Activism"),
    ("30", "Movies"),
    ("31", "Anime/Animation"),
    ("32", "Action/Adventure"),
    ("33", "Classics"),
    ("34", "Comedy"),
    ("35", "Documentary"),
    ("36", "Drama"),
    ("37", "Family"),
    ("38", "Foreign"),
    ("39", "Horror"),
    ("40", "Sci-Fi/Fantasy"),
    ("41", "Thriller"),
    ("42", "Shorts"),
    ("43", "Shows"),
    ("44", "Trailers"),
];

fn builtin_category(id: &str) -> Option<&'static str> {
    CATEGORIES
        .iter()
        .find(|(known, _)| *known == id)
        .map(|(_, name)| *name)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VideoListResponse {
    pub items: Vec<VideoItem>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VideoItem {
    pub id: String,
    pub snippet: Snippet,
    pub content_details: ContentDetails,
    pub statistics: Statistics,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Snippet {
    pub published_at: Option<String>,
    pub channel_id: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub channel_title: Option<String>,
    pub tags: Vec<String>,
    pub category_id: Option<String>,
    /// "none", "live" or "upcoming"
    pub live_broadcast_content: Option<String>,
    pub thumbnails: HashMap<String, Thumbnail>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Thumbnail {
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ContentDetails {
    pub duration: Option<String>,
}

// Counts arrive as strings
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Statistics {
    pub view_count: Option<String>,
    pub like_count: Option<String>,
    pub comment_count: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CategoryListResponse {
    items: Vec<CategoryItem>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CategoryItem {
    id: String,
    snippet: CategorySnippet,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CategorySnippet {
    title: String,
}

/// Parser-pool entry point for a `videos` response body
pub fn parse_video_list(body: &str) -> Option<VideoListResponse> {
    serde_json::from_str(body).ok()
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

/// Map one API item. Upcoming broadcasts with no recorded duration are
/// live streams; upcoming uploads with a duration are premieres.
pub fn video_data(item: &VideoItem, category: Option<String>) -> ScrapedVideoData {
    let snippet = &item.snippet;
    let duration = item
        .content_details
        .duration
        .as_deref()
        .and_then(parse_iso8601_duration);

    let broadcast = snippet.live_broadcast_content.as_deref().unwrap_or("none");
    let upcoming = broadcast == "upcoming";
    let has_duration = duration.map_or(false, |d| d > 0);
    let stream = StreamState {
        live_or_upcoming: broadcast == "live" || (upcoming && !has_duration),
        premiere: upcoming && has_duration,
    };

    let thumbnail_url = ["maxres", "standard", "high", "medium", "default"]
        .iter()
        .filter_map(|size| snippet.thumbnails.get(*size))
        .map(|t| t.url.clone())
        .find(|url| !url.is_empty());

    ScrapedVideoData {
        title: non_empty(&snippet.title),
        description: non_empty(&snippet.description),
        channel_name: non_empty(&snippet.channel_title),
        channel_id: non_empty(&snippet.channel_id),
        duration_seconds: duration,
        view_count: item.statistics.view_count.as_deref().and_then(parse_count),
        like_count: item.statistics.like_count.as_deref().and_then(parse_count),
        comment_count: item.statistics.comment_count.as_deref().and_then(parse_count),
        published_at: snippet.published_at.as_deref().and_then(normalize_date),
        tags: (!snippet.tags.is_empty()).then(|| snippet.tags.clone()),
        thumbnail_url,
        category,
        is_livestream: Some(stream.live_or_upcoming),
        is_short: None,
        content_type: Some(classify_content(false, stream, duration)),
    }
}

pub struct ApiBackend {
    config: ApiConfig,
    base_url: String,
    /// Category names resolved through the API, kept for the process lifetime
    resolved_categories: Mutex<HashMap<String, String>>,
}

impl ApiBackend {
    pub fn new(config: &ApiConfig) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            config: config.clone(),
            resolved_categories: Mutex::new(HashMap::new()),
        }
    }

    fn category_name(&self, id: &str) -> Option<String> {
        if let Some(name) = builtin_category(id) {
            return Some(name.to_string());
        }
        self.resolved_categories
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// One quota-checked GET. A remote quota error marks the tracker exhausted.
    async fn get(
        &self,
        run: &RunContext,
        path: &str,
        query: &[(&str, &str)],
        charged: &AtomicU64,
    ) -> Result<String, EnrichError> {
        let quota = &run.shared().quota;
        let usage = quota.try_consume(self.config.units_per_request)?;
        charged.fetch_add(self.config.units_per_request, Ordering::Relaxed);
        debug!(path, used = usage.used, remaining = usage.remaining, "[ApiBackend] Quota reserved");

        let url = format!("{}/{}", self.base_url, path);
        let pool = run.shared().pools.for_url(&url)?;
        let connection = pool.acquire().await?;

        let mut request = connection.client().get(&url).query(query);
        if let Some(key) = self.config.api_key.as_deref() {
            request = request.query(&[("key", key)]);
        }
        let response = request.send().await?;

        let status = response.status();
        let body = response.text().await?;
        if status.is_success() {
            return Ok(body);
        }

        match EnrichError::from_status(status.as_u16(), &body) {
            EnrichError::QuotaExhausted { .. } => {
                quota.exhaust();
                let usage = quota.usage();
                Err(EnrichError::QuotaExhausted {
                    used: usage.used,
                    limit: usage.limit,
                })
            }
            other => Err(other),
        }
    }

    /// Resolve category ids missing from the built-in table with one
    /// `videoCategories` call. Failures leave the categories unresolved.
    async fn resolve_categories(&self, ids: HashSet<String>, run: &RunContext, charged: &AtomicU64) {
        if !self.config.resolve_categories {
            return;
        }
        let unknown: Vec<String> = ids
            .into_iter()
            .filter(|id| self.category_name(id).is_none())
            .collect();
        if unknown.is_empty() {
            return;
        }
        if !run.shared().quota.can_afford(self.config.units_per_request) {
            debug!(count = unknown.len(), "[ApiBackend] Skipping category lookup, quota too low");
            return;
        }

        let joined = unknown.join(",");
        let body = match self
            .get(run, "videoCategories", &[("part", "snippet"), ("id", joined.as_str())], charged)
            .await
        {
            Ok(body) => body,
            Err(e) => {
                debug!(error = %e, "[ApiBackend] Category lookup failed");
                return;
            }
        };

        match serde_json::from_str::<CategoryListResponse>(&body) {
            Ok(list) => {
                let mut resolved = self
                    .resolved_categories
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                for item in list.items {
                    if !item.snippet.title.is_empty() {
                        resolved.insert(item.id, item.snippet.title);
                    }
                }
            }
            Err(e) => debug!(error = %e, "[ApiBackend] Unreadable category response"),
        }
    }

    /// Fetch one chunk; quota units spent on it are added to `charged`
    async fn fetch_chunk(
        &self,
        chunk: &[String],
        run: &RunContext,
        charged: &AtomicU64,
    ) -> Result<HashMap<String, ScrapedVideoData>, EnrichError> {
        let ids = chunk.join(",");
        let query = [("part", VIDEO_PARTS), ("id", ids.as_str())];
        let body = retry_with_backoff(
            run.retry_attempts(),
            run.retry_base_delay(),
            EnrichError::is_transient,
            |_| self.get(run, "videos", &query, charged),
        )
        .await?;

        let list = run
            .shared()
            .parser
            .parse_with("videos", Arc::from(body), parse_video_list)
            .await
            .ok_or_else(|| EnrichError::MalformedResponse("unreadable videos response".to_string()))?;

        let category_ids: HashSet<String> = list
            .items
            .iter()
            .filter_map(|item| item.snippet.category_id.clone())
            .collect();
        self.resolve_categories(category_ids, run, charged).await;

        Ok(list
            .items
            .iter()
            .map(|item| {
                let category = item
                    .snippet
                    .category_id
                    .as_deref()
                    .and_then(|id| self.category_name(id));
                (item.id.clone(), video_data(item, category))
            })
            .collect())
    }
}

#[async_trait]
impl EnrichmentBackend for ApiBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Api
    }

    fn name(&self) -> &'static str {
        "api"
    }

    fn is_available(&self) -> bool {
        self.config.api_key.as_deref().map_or(false, |k| !k.is_empty())
    }

    async fn enrich(&self, batch: &[String], run: &RunContext) -> BatchOutcome {
        let mut results = Vec::with_capacity(batch.len());

        for chunk in batch.chunks(self.config.max_ids_per_request.max(1)) {
            let start = Instant::now();
            let charged = AtomicU64::new(0);
            let fetched = self.fetch_chunk(chunk, run, &charged).await;
            let shares = quota_shares(charged.load(Ordering::Relaxed), chunk.len());

            match fetched {
                Ok(mut found) => {
                    info!(requested = chunk.len(), found = found.len(), "[ApiBackend] Chunk fetched");
                    for (id, units) in chunk.iter().zip(shares) {
                        let result = match found.remove(id) {
                            Some(data) => EnrichmentResult::success(id, BackendKind::Api, data, start.elapsed()),
                            None => EnrichmentResult::failure(
                                id,
                                BackendKind::Api,
                                &EnrichError::NotFound("not returned by the API (deleted or private)".to_string()),
                                start.elapsed(),
                            ),
                        };
                        results.push(result.with_cost(0.0, ResourceUsage::quota(units)));
                    }
                }
                Err(e) => {
                    if let Some(reason) = HaltReason::from_error(&e) {
                        warn!(error = %e, "[ApiBackend] Halting for the rest of the run");
                        return BatchOutcome::halted(results, reason);
                    }
                    warn!(count = chunk.len(), error = %e, "[ApiBackend] Chunk failed");
                    results.extend(chunk.iter().zip(shares).map(|(id, units)| {
                        EnrichmentResult::failure(id, BackendKind::Api, &e, start.elapsed())
                            .with_cost(0.0, ResourceUsage::quota(units))
                    }));
                }
            }
        }

        BatchOutcome::new(results)
    }
}

/// Split `units` over `items` results so that the shares sum to `units`
fn quota_shares(units: u64, items: usize) -> impl Iterator<Item = u64> {
    let items = items.max(1) as u64;
    let (base, extra) = (units / items, units % items);
    (0..items).map(move |i| base + u64::from(i < extra))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enricher::models::ContentType;

    const RESPONSE: &str = r#"{
        "kind": "youtube#videoListResponse",
        "items": [
            {
                "id": "dQw4w9WgXcQ",
                "snippet": {
                    "publishedAt": "2009-10-25T06:57:33Z",
                    "channelId": "UCuAXFkgsw1L7xaCfnd5JJOw",
                    "title": "Never Gonna Give You Up",
                    "description": "The official video",
                    "thumbnails": {
                        "default": {"url": "https://i.ytimg.com/vi/dQw4w9WgXcQ/default.jpg"},
                        "high": {"url": "https://i.ytimg.com/vi/dQw4w9WgXcQ/hqdefault.jpg"}
                    },
                    "channelTitle": "Rick Astley",
                    "tags": ["rick astley", "80s"],
                    "categoryId": "10",
                    "liveBroadcastContent": "none"
                },
                "contentDetails": {"duration": "PT3M33S"},
                "statistics": {"viewCount": "1500000000", "likeCount": "17000000", "commentCount": "2300000"}
            },
            {
                "id": "upcoming1",
                "snippet": {"title": "Launch stream", "channelTitle": "Space", "liveBroadcastContent": "upcoming"},
                "contentDetails": {"duration": "P0D"}
            }
        ]
    }"#;

    #[test]
    fn test_parse_video_item() {
        let list = parse_video_list(RESPONSE).unwrap();
        assert_eq!(list.items.len(), 2);

        let item = &list.items[0];
        let data = video_data(item, builtin_category("10").map(String::from));
        assert_eq!(data.title.as_deref(), Some("Never Gonna Give You Up"));
        assert_eq!(data.channel_name.as_deref(), Some("Rick Astley"));
        assert_eq!(data.duration_seconds, Some(213));
        assert_eq!(data.view_count, Some(1_500_000_000));
        assert_eq!(data.like_count, Some(17_000_000));
        assert_eq!(data.comment_count, Some(2_300_000));
        assert_eq!(data.category.as_deref(), Some("Music"));
        assert_eq!(
            data.thumbnail_url.as_deref(),
            Some("https://i.ytimg.com/vi/dQw4w9WgXcQ/hqdefault.jpg")
        );
        assert_eq!(data.published_at.as_deref(), Some("2009-10-25T06:57:33Z"));
        assert_eq!(data.content_type, Some(ContentType::Video));
    }

    #[test]
    fn test_upcoming_stream_and_premiere() {
        let list = parse_video_list(RESPONSE).unwrap();
        let data = video_data(&list.items[1], None);
        assert_eq!(data.content_type, Some(ContentType::Livestream));
        assert_eq!(data.is_livestream, Some(true));

        let premiere = VideoItem {
            snippet: Snippet {
                title: Some("Premiere".to_string()),
                live_broadcast_content: Some("upcoming".to_string()),
                ..Default::default()
            },
            content_details: ContentDetails {
                duration: Some("PT10M".to_string()),
            },
            ..Default::default()
        };
        assert_eq!(video_data(&premiere, None).content_type, Some(ContentType::Premiere));
    }

    #[test]
    fn test_short_by_duration() {
        let item = VideoItem {
            snippet: Snippet {
                title: Some("Quick tip".to_string()),
                ..Default::default()
            },
            content_details: ContentDetails {
                duration: Some("PT45S".to_string()),
            },
            ..Default::default()
        };
        assert_eq!(video_data(&item, None).content_type, Some(ContentType::Short));
    }

    #[test]
    fn test_builtin_categories() {
        assert_eq!(builtin_category("28"), Some("Science & Technology"));
        assert_eq!(builtin_category("999"), None);
    }

    #[test]
    fn test_quota_shares_sum_to_units() {
        assert_eq!(quota_shares(1, 1).collect::<Vec<_>>(), vec![1]);
        assert_eq!(quota_shares(7, 3).collect::<Vec<_>>(), vec![3, 2, 2]);
        assert_eq!(quota_shares(0, 2).collect::<Vec<_>>(), vec![0, 0]);
        assert_eq!(quota_shares(100, 50).sum::<u64>(), 100);
    }

    #[test]
    fn test_availability_needs_key() {
        assert!(!ApiBackend::new(&ApiConfig::default()).is_available());
        let config = ApiConfig {
            api_key: Some("key".to_string()),
            ..Default::default()
        };
        assert!(ApiBackend::new(&config).is_available());
    }
}
