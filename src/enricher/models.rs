// Common data models for the enrichment pipeline

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use super::errors::EnrichError;

/// The three interchangeable enrichment strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Language-model-assisted extraction from a page excerpt
    Llm,
    /// Quota-limited structured metadata API
    Api,
    /// Direct watch-page scraping
    Scraping,
}

impl BackendKind {
    /// Default cascade order
    pub const CASCADE: [BackendKind; 3] = [Self::Llm, Self::Api, Self::Scraping];
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Llm => write!(f, "llm"),
            Self::Api => write!(f, "api"),
            Self::Scraping => write!(f, "scraping"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = EnrichError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "llm" => Ok(Self::Llm),
            "api" => Ok(Self::Api),
            "scraping" | "scrape" | "html" => Ok(Self::Scraping),
            other => Err(EnrichError::Config(format!("Unknown backend: {}", other))),
        }
    }
}

/// Content-type classification of a video
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Video,
    Short,
    Livestream,
    Premiere,
}

/// Videos at or under this length are treated as short-form
pub const SHORT_MAX_SECONDS: u64 = 60;

/// Stream-state signals reported by a source
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamState {
    /// Live right now, or an upcoming live stream
    pub live_or_upcoming: bool,
    /// Scheduled premiere of pre-recorded content
    pub premiere: bool,
}

/// Classify content using, in order of precedence: short-form URL marker,
/// live/upcoming flag, premiere flag, duration threshold, then standard video.
pub fn classify_content(
    short_url: bool,
    stream: StreamState,
    duration_seconds: Option<u64>,
) -> ContentType {
    if short_url {
        return ContentType::Short;
    }
    if stream.live_or_upcoming {
        return ContentType::Livestream;
    }
    if stream.premiere {
        return ContentType::Premiere;
    }
    match duration_seconds {
        Some(d) if d > 0 && d <= SHORT_MAX_SECONDS => ContentType::Short,
        _ => ContentType::Video,
    }
}

/// Enrichment payload shared by all backends. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapedVideoData {
    pub title: Option<String>,
    pub description: Option<String>,
    pub channel_name: Option<String>,
    pub channel_id: Option<String>,
    pub duration_seconds: Option<u64>,
    pub view_count: Option<u64>,
    pub like_count: Option<u64>,
    pub comment_count: Option<u64>,
    /// RFC 3339 timestamp
    pub published_at: Option<String>,
    pub tags: Option<Vec<String>>,
    pub thumbnail_url: Option<String>,
    pub category: Option<String>,
    pub is_livestream: Option<bool>,
    pub is_short: Option<bool>,
    pub content_type: Option<ContentType>,
}

impl ScrapedVideoData {
    /// True when no metadata field is populated
    pub fn is_empty(&self) -> bool {
        self.populated_fields() == 0
    }

    /// Number of populated metadata fields (flags excluded)
    pub fn populated_fields(&self) -> usize {
        [
            self.title.is_some(),
            self.description.is_some(),
            self.channel_name.is_some(),
            self.channel_id.is_some(),
            self.duration_seconds.is_some(),
            self.view_count.is_some(),
            self.like_count.is_some(),
            self.comment_count.is_some(),
            self.published_at.is_some(),
            self.tags.as_ref().map_or(false, |t| !t.is_empty()),
            self.thumbnail_url.is_some(),
            self.category.is_some(),
        ]
        .iter()
        .filter(|p| **p)
        .count()
    }

    /// Has both a title and a channel name
    pub fn has_identity(&self) -> bool {
        self.title.is_some() && self.channel_name.is_some()
    }

    /// Fill fields that are still empty from `other`
    pub fn fill_missing_from(&mut self, other: &ScrapedVideoData) {
        macro_rules! fill {
            ($($field:ident),*) => {
                $(if self.$field.is_none() {
                    self.$field = other.$field.clone();
                })*
            };
        }
        fill!(
            title,
            description,
            channel_name,
            channel_id,
            duration_seconds,
            view_count,
            like_count,
            comment_count,
            published_at,
            tags,
            thumbnail_url,
            category,
            is_livestream,
            is_short,
            content_type
        );
    }

    /// Derive `content_type` from the flags and duration when not set
    pub fn classify(&mut self) {
        if self.content_type.is_some() {
            return;
        }
        let stream = StreamState {
            live_or_upcoming: self.is_livestream.unwrap_or(false),
            premiere: false,
        };
        let kind = classify_content(self.is_short.unwrap_or(false), stream, self.duration_seconds);
        self.content_type = Some(kind);
    }
}

/// A watch-history entry, owned by the caller
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VideoRecord {
    pub video_id: Option<String>,
    pub url: String,
    pub watched_at: Option<String>,

    pub title: Option<String>,
    pub description: Option<String>,
    pub channel_name: Option<String>,
    pub channel_id: Option<String>,
    pub duration_seconds: Option<u64>,
    pub view_count: Option<u64>,
    pub like_count: Option<u64>,
    pub comment_count: Option<u64>,
    pub published_at: Option<String>,
    pub tags: Vec<String>,
    pub thumbnail_url: Option<String>,
    pub category: Option<String>,
    pub content_type: Option<ContentType>,

    pub enriched: bool,
    pub enrichment_source: Option<BackendKind>,
    pub errors: Vec<String>,
}

impl VideoRecord {
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Merge an enrichment payload; fields absent from the payload keep their value
    pub fn merge(&mut self, data: &ScrapedVideoData, source: BackendKind) {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if let Some(value) = &data.$field {
                    self.$field = Some(value.clone());
                })*
            };
        }
        take!(
            title,
            description,
            channel_name,
            channel_id,
            duration_seconds,
            view_count,
            like_count,
            comment_count,
            published_at,
            thumbnail_url,
            category,
            content_type
        );
        if let Some(tags) = &data.tags {
            self.tags = tags.clone();
        }

        if super::utils::is_shorts_url(&self.url) {
            self.content_type = Some(ContentType::Short);
        } else if self.content_type.is_none() {
            let mut classified = data.clone();
            classified.classify();
            self.content_type = classified.content_type;
        }

        self.enriched = true;
        self.enrichment_source = Some(source);
    }

    pub fn record_error(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
    }
}

/// Token / quota consumption of one attempt
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub quota_units: u64,
}

impl ResourceUsage {
    pub fn tokens(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            quota_units: 0,
        }
    }

    pub fn quota(units: u64) -> Self {
        Self {
            quota_units: units,
            ..Self::default()
        }
    }
}

/// Outcome of one identifier on one backend attempt. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichmentResult {
    pub video_id: String,
    pub success: bool,
    pub data: Option<ScrapedVideoData>,
    pub error: Option<String>,
    pub backend: BackendKind,
    /// USD
    pub cost: f64,
    pub usage: ResourceUsage,
    #[serde(with = "duration_millis")]
    pub elapsed: Duration,
    pub from_cache: bool,
}

impl EnrichmentResult {
    /// Successful result; an empty payload is downgraded to a failure
    pub fn success(
        video_id: impl Into<String>,
        backend: BackendKind,
        data: ScrapedVideoData,
        elapsed: Duration,
    ) -> Self {
        let video_id = video_id.into();
        if data.is_empty() {
            return Self::failure(
                video_id,
                backend,
                &EnrichError::MalformedResponse("no metadata fields extracted".to_string()),
                elapsed,
            );
        }
        Self {
            video_id,
            success: true,
            data: Some(data),
            error: None,
            backend,
            cost: 0.0,
            usage: ResourceUsage::default(),
            elapsed,
            from_cache: false,
        }
    }

    pub fn failure(
        video_id: impl Into<String>,
        backend: BackendKind,
        error: &EnrichError,
        elapsed: Duration,
    ) -> Self {
        Self {
            video_id: video_id.into(),
            success: false,
            data: None,
            error: Some(error.to_string()),
            backend,
            cost: 0.0,
            usage: ResourceUsage::default(),
            elapsed,
            from_cache: false,
        }
    }

    /// Result served from the cache
    pub fn cached(video_id: impl Into<String>, backend: BackendKind, data: ScrapedVideoData) -> Self {
        Self {
            from_cache: true,
            ..Self::success(video_id, backend, data, Duration::ZERO)
        }
    }

    pub fn with_cost(mut self, cost: f64, usage: ResourceUsage) -> Self {
        self.cost = cost;
        self.usage = usage;
        self
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_precedence() {
        let live = StreamState { live_or_upcoming: true, premiere: true };
        assert_eq!(classify_content(true, live, Some(600)), ContentType::Short);
        assert_eq!(classify_content(false, live, Some(30)), ContentType::Livestream);

        let premiere = StreamState { live_or_upcoming: false, premiere: true };
        assert_eq!(classify_content(false, premiere, Some(30)), ContentType::Premiere);

        let none = StreamState::default();
        assert_eq!(classify_content(false, none, Some(45)), ContentType::Short);
        assert_eq!(classify_content(false, none, Some(61)), ContentType::Video);
        assert_eq!(classify_content(false, none, None), ContentType::Video);
        assert_eq!(classify_content(false, none, Some(0)), ContentType::Video);
    }

    #[test]
    fn test_empty_payload_is_failure() {
        let result = EnrichmentResult::success(
            "abc",
            BackendKind::Scraping,
            ScrapedVideoData::default(),
            Duration::ZERO,
        );
        assert!(!result.success);
        assert!(result.error.is_some());
    }

    #[test]
    fn test_partial_payload_is_success() {
        let data = ScrapedVideoData {
            title: Some("Only a title".to_string()),
            ..Default::default()
        };
        let result = EnrichmentResult::success("abc", BackendKind::Scraping, data, Duration::ZERO);
        assert!(result.success);
    }

    #[test]
    fn test_merge_keeps_existing_fields() {
        let mut record = VideoRecord::from_url("https://www.youtube.com/watch?v=abc");
        record.channel_name = Some("From history".to_string());

        let data = ScrapedVideoData {
            title: Some("Title".to_string()),
            duration_seconds: Some(300),
            tags: Some(vec!["rust".to_string()]),
            ..Default::default()
        };
        record.merge(&data, BackendKind::Api);

        assert!(record.enriched);
        assert_eq!(record.title.as_deref(), Some("Title"));
        assert_eq!(record.channel_name.as_deref(), Some("From history"));
        assert_eq!(record.tags, vec!["rust".to_string()]);
        assert_eq!(record.content_type, Some(ContentType::Video));
        assert_eq!(record.enrichment_source, Some(BackendKind::Api));
    }

    #[test]
    fn test_merge_shorts_url_overrides() {
        let mut record = VideoRecord::from_url("https://www.youtube.com/shorts/abc");
        let data = ScrapedVideoData {
            title: Some("Clip".to_string()),
            content_type: Some(ContentType::Video),
            ..Default::default()
        };
        record.merge(&data, BackendKind::Llm);
        assert_eq!(record.content_type, Some(ContentType::Short));
    }

    #[test]
    fn test_fill_missing() {
        let mut base = ScrapedVideoData {
            title: Some("A".to_string()),
            ..Default::default()
        };
        let other = ScrapedVideoData {
            title: Some("B".to_string()),
            view_count: Some(10),
            ..Default::default()
        };
        base.fill_missing_from(&other);
        assert_eq!(base.title.as_deref(), Some("A"));
        assert_eq!(base.view_count, Some(10));
    }

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!("LLM".parse::<BackendKind>().ok(), Some(BackendKind::Llm));
        assert_eq!("scraping".parse::<BackendKind>().ok(), Some(BackendKind::Scraping));
        assert!("ftp".parse::<BackendKind>().is_err());
    }
}
