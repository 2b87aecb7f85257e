// Blocking diagnostics - identifies why a source refused to answer
//
// Analyzes error bodies and fetched pages to determine:
// - Whether the source is throttling us (stop calling it for this run)
// - Whether the video itself is unavailable (no point retrying anywhere)
// - Whether a retry with the same backend might help

use serde::{Deserialize, Serialize};

use super::errors::EnrichError;

/// Reasons why a source might refuse a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockingReason {
    /// HTTP 429 or an explicit rate-limit message
    RateLimited,

    /// Structured-API daily quota used up
    QuotaExceeded,

    /// Captcha / "unusual traffic" interstitial
    BotDetection,

    /// Cookie consent wall served instead of the watch page
    ConsentWall,

    /// Deleted, terminated or otherwise gone
    VideoUnavailable,

    /// Visible to its owner only
    PrivateVideo,

    /// Page asks for a signed-in adult
    AgeRestricted,

    /// Requests time out; often a soft block
    NetworkTimeout,

    /// Anything else
    Unknown,
}

impl BlockingReason {
    /// Check if this is a permanent property of the video (no backend will help)
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::VideoUnavailable | Self::PrivateVideo)
    }

    /// Check if the whole backend should stop for this run
    pub fn halts_backend(&self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::QuotaExceeded | Self::BotDetection | Self::ConsentWall
        )
    }

    /// Short label used in per-record error messages
    pub fn description(&self) -> &'static str {
        match self {
            Self::RateLimited => "Rate limited by source",
            Self::QuotaExceeded => "API quota exceeded",
            Self::BotDetection => "Captcha page served",
            Self::ConsentWall => "Consent page served instead of content",
            Self::VideoUnavailable => "Video no longer available",
            Self::PrivateVideo => "Video is private",
            Self::AgeRestricted => "Video requires age confirmation",
            Self::NetworkTimeout => "Source timed out",
            Self::Unknown => "Source refused the request",
        }
    }

    /// Convert to the error reported for an identifier
    pub fn into_error(self, context: &str) -> EnrichError {
        let message = format!("{}: {}", self.description(), context);
        match self {
            Self::RateLimited | Self::BotDetection | Self::ConsentWall => {
                EnrichError::RateLimited(message)
            }
            Self::QuotaExceeded => EnrichError::QuotaExhausted { used: 0, limit: 0 },
            Self::VideoUnavailable | Self::PrivateVideo => EnrichError::NotFound(message),
            Self::NetworkTimeout => EnrichError::Timeout(message),
            Self::AgeRestricted | Self::Unknown => EnrichError::MalformedResponse(message),
        }
    }
}

/// Markers checked in order; the first reason with a matching marker wins
const ERROR_MARKERS: &[(BlockingReason, &[&str])] = &[
    (
        BlockingReason::QuotaExceeded,
        &["quotaexceeded", "dailylimitexceeded", "quota exceeded"],
    ),
    (
        BlockingReason::RateLimited,
        &["429", "ratelimitexceeded", "rate limit", "too many requests"],
    ),
    (
        BlockingReason::BotDetection,
        &["unusual traffic", "captcha", "/sorry/", "not a robot"],
    ),
    (
        BlockingReason::ConsentWall,
        &["consent.youtube.com", "before you continue to youtube"],
    ),
    (BlockingReason::PrivateVideo, &["private video", "video is private"]),
    (
        BlockingReason::VideoUnavailable,
        &[
            "video unavailable",
            "video has been removed",
            "no longer available",
            "video is unavailable",
        ],
    ),
    (
        BlockingReason::AgeRestricted,
        &["sign in to confirm your age", "age-restricted"],
    ),
    (BlockingReason::NetworkTimeout, &["timeout", "timed out"]),
];

/// Classify an error body or message. Any non-empty text that matches no
/// marker is `Unknown`.
pub fn diagnose_error(error: &str) -> Option<BlockingReason> {
    let text = error.to_lowercase();
    ERROR_MARKERS
        .iter()
        .find(|(_, markers)| markers.iter().any(|m| text.contains(m)))
        .map(|(reason, _)| *reason)
        .or_else(|| (!error.is_empty()).then_some(BlockingReason::Unknown))
}

/// Inspect a fetched watch page for an interstitial instead of real content.
///
/// Only markers that never appear on a normal watch page are considered, so a
/// video titled "unusual traffic" does not trip the check.
pub fn diagnose_page(html: &str) -> Option<BlockingReason> {
    if html.contains("consent.youtube.com") && !html.contains("ytInitialPlayerResponse") {
        return Some(BlockingReason::ConsentWall);
    }

    if html.contains("https://www.google.com/sorry/") || html.contains("id=\"captcha-form\"") {
        return Some(BlockingReason::BotDetection);
    }

    if html.contains("\"status\":\"ERROR\"") || html.contains("\"status\":\"UNPLAYABLE\"") {
        return Some(BlockingReason::VideoUnavailable);
    }

    if html.contains("\"status\":\"LOGIN_REQUIRED\"") {
        if html.contains("Private video") {
            return Some(BlockingReason::PrivateVideo);
        }
        return Some(BlockingReason::AgeRestricted);
    }

    None
}
