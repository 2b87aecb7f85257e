// Helper functions shared by backends and parsers

use lazy_static::lazy_static;
use regex::Regex;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, OffsetDateTime};
use tracing::debug;

use super::errors::EnrichError;

lazy_static! {
    static ref VIDEO_ID_PATTERNS: Vec<Regex> = vec![
        Regex::new(r"watch\?(?:[^#]*&)?v=([A-Za-z0-9_-]+)").unwrap(),
        Regex::new(r"youtu\.be/([A-Za-z0-9_-]+)").unwrap(),
        Regex::new(r"/embed/([A-Za-z0-9_-]+)").unwrap(),
        Regex::new(r"/shorts/([A-Za-z0-9_-]+)").unwrap(),
        Regex::new(r"youtube\.com/live/([A-Za-z0-9_-]+)").unwrap(),
    ];
    static ref SHORTS_RE: Regex = Regex::new(r"/shorts/[A-Za-z0-9_-]+").unwrap();
    static ref ISO_DURATION_RE: Regex = Regex::new(
        r"^P(?:(\d+)W)?(?:(\d+)D)?(?:T(?:(\d+)H)?(?:(\d+)M)?(?:(\d+(?:\.\d+)?)S)?)?$"
    )
    .unwrap();
    static ref CLOCK_DURATION_RE: Regex = Regex::new(r"^(?:(\d+):)?(\d{1,2}):(\d{2})$").unwrap();
    static ref COUNT_RE: Regex = Regex::new(r"(?i)^([\d.,\s]+)\s*([kmb])?\b").unwrap();
}

/// Derive the canonical video identifier from a watch, short-link, embed,
/// shorts or live URL. Query and fragment noise after the id is ignored.
pub fn extract_video_id(url: &str) -> Option<String> {
    let url = url.trim();
    VIDEO_ID_PATTERNS
        .iter()
        .find_map(|re| re.captures(url))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .filter(|id| !id.is_empty())
}

/// Whether a URL carries the short-form marker
pub fn is_shorts_url(url: &str) -> bool {
    SHORTS_RE.is_match(url)
}

/// Parse an ISO-8601 duration such as `PT1H2M3S` into seconds
pub fn parse_iso8601_duration(value: &str) -> Option<u64> {
    let caps = ISO_DURATION_RE.captures(value.trim())?;
    if caps.iter().skip(1).all(|c| c.is_none()) {
        return None;
    }
    let part = |i: usize| -> u64 {
        caps.get(i)
            .and_then(|m| m.as_str().parse::<f64>().ok())
            .map(|v| v as u64)
            .unwrap_or(0)
    };
    [(1, 7 * 86_400), (2, 86_400), (3, 3_600), (4, 60), (5, 1)]
        .into_iter()
        .try_fold(0u64, |total, (i, unit)| part(i).checked_mul(unit)?.checked_add(total))
}

/// Parse a duration in any of the shapes sources return: seconds,
/// ISO-8601 (`PT4M13S`) or clock notation (`4:13`, `1:02:03`)
pub fn parse_duration(value: &str) -> Option<u64> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<f64>() {
        return (seconds >= 0.0).then(|| seconds as u64);
    }
    if value.starts_with('P') {
        return parse_iso8601_duration(value);
    }
    let caps = CLOCK_DURATION_RE.captures(value)?;
    let hours: u64 = caps.get(1).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
    let minutes: u64 = caps.get(2)?.as_str().parse().ok()?;
    let seconds: u64 = caps.get(3)?.as_str().parse().ok()?;
    hours.checked_mul(3_600)?.checked_add(minutes * 60 + seconds)
}

/// Parse counts like `1234`, `1,234,567 views`, `1.2M`, `3K`
pub fn parse_count(value: &str) -> Option<u64> {
    let caps = COUNT_RE.captures(value.trim())?;
    let digits = caps.get(1)?.as_str();
    let suffix = caps.get(2).map(|m| m.as_str().to_ascii_lowercase());

    match suffix.as_deref() {
        Some(s) => {
            let number: f64 = digits.replace([',', ' '], "").parse().ok()?;
            let multiplier = match s {
                "k" => 1e3,
                "m" => 1e6,
                _ => 1e9,
            };
            Some((number * multiplier).round() as u64)
        }
        // A lone decimal point is a fraction, not a separator
        None if digits.matches('.').count() == 1 => {
            let number: f64 = digits.replace([',', ' '], "").parse().ok()?;
            Some(number.round() as u64)
        }
        None => {
            let cleaned: String = digits.chars().filter(|c| c.is_ascii_digit()).collect();
            cleaned.parse().ok()
        }
    }
}

/// Normalize a publish date to RFC 3339. Date-only values become midnight UTC.
pub fn normalize_date(value: &str) -> Option<String> {
    let value = value.trim();
    if let Ok(dt) = OffsetDateTime::parse(value, &Rfc3339) {
        return dt.format(&Rfc3339).ok();
    }
    let date_part = value.get(..10)?;
    let date = Date::parse(date_part, format_description!("[year]-[month]-[day]")).ok()?;
    date.midnight().assume_utc().format(&Rfc3339).ok()
}

/// Client identity presented to public pages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientIdentity {
    pub user_agent: &'static str,
    pub accept_language: &'static str,
}

const IDENTITIES: [ClientIdentity; 5] = [
    ClientIdentity {
        user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36",
        accept_language: "en-US,en;q=0.9",
    },
    ClientIdentity {
        user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
        accept_language: "en-GB,en;q=0.8",
    },
    ClientIdentity {
        user_agent: "Mozilla/5.0 (X11; Linux x86_64; rv:122.0) Gecko/20100101 Firefox/122.0",
        accept_language: "en-US,en;q=0.7",
    },
    ClientIdentity {
        user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_2) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15",
        accept_language: "en-US,en;q=0.9",
    },
    ClientIdentity {
        user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36 Edg/121.0.0.0",
        accept_language: "en,en-US;q=0.8",
    },
];

/// Round-robin rotation over client identities
#[derive(Debug, Default)]
pub struct IdentityRotation {
    next: AtomicUsize,
}

impl IdentityRotation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_identity(&self) -> ClientIdentity {
        let i = self.next.fetch_add(1, Ordering::Relaxed);
        IDENTITIES[i % IDENTITIES.len()]
    }
}

/// Exponential backoff delay for a zero-based attempt number
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt.min(16)))
}

/// Run `op` up to `max_attempts` times, sleeping with exponential backoff
/// between attempts while `should_retry` accepts the error.
pub async fn retry_with_backoff<T, F, Fut>(
    max_attempts: u32,
    base_delay: Duration,
    should_retry: impl Fn(&EnrichError) -> bool,
    mut op: F,
) -> Result<T, EnrichError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, EnrichError>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt + 1 < max_attempts && should_retry(&e) => {
                let delay = backoff_delay(base_delay, attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "Retrying after backoff");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_extract_supported_shapes() {
        let cases = [
            ("https://www.youtube.com/watch?v=dQw4w9WgXcQ", "dQw4w9WgXcQ"),
            ("https://www.youtube.com/watch?v=dQw4w9WgXcQ&t=42s", "dQw4w9WgXcQ"),
            ("https://www.youtube.com/watch?feature=share&v=abc123#comments", "abc123"),
            ("watch?v=abc123", "abc123"),
            ("https://youtu.be/xyz999?si=tracking", "xyz999"),
            ("youtu.be/abc123", "abc123"),
            ("https://www.youtube.com/embed/E-mb_3d?autoplay=1", "E-mb_3d"),
            ("https://www.youtube.com/shorts/sh0rtID", "sh0rtID"),
            ("https://m.youtube.com/shorts/sh0rtID?feature=share", "sh0rtID"),
            ("https://www.youtube.com/live/L1veID", "L1veID"),
        ];
        for (url, expected) in cases {
            assert_eq!(extract_video_id(url).as_deref(), Some(expected), "url: {}", url);
        }
    }

    #[test]
    fn test_extract_unsupported_shapes() {
        for url in [
            "",
            "https://www.youtube.com/",
            "https://www.youtube.com/channel/UC123",
            "https://www.youtube.com/playlist?list=PL123",
            "https://example.com/video/123",
            "https://www.youtube.com/watch?list=PL123",
        ] {
            assert_eq!(extract_video_id(url), None, "url: {}", url);
            assert_eq!(extract_video_id(url), None, "deterministic for {}", url);
        }
    }

    #[test]
    fn test_shorts_marker() {
        assert!(is_shorts_url("https://www.youtube.com/shorts/abc"));
        assert!(!is_shorts_url("https://www.youtube.com/watch?v=abc"));
    }

    #[test]
    fn test_iso_duration() {
        assert_eq!(parse_iso8601_duration("PT4M13S"), Some(253));
        assert_eq!(parse_iso8601_duration("PT1H"), Some(3600));
        assert_eq!(parse_iso8601_duration("P1DT2H"), Some(93_600));
        assert_eq!(parse_iso8601_duration("P0D"), Some(0));
        assert_eq!(parse_iso8601_duration("P"), None);
        assert_eq!(parse_iso8601_duration("4:13"), None);
    }

    #[test]
    fn test_iso_duration_overflow() {
        assert_eq!(parse_iso8601_duration("P99999999999999W"), None);
        assert_eq!(parse_iso8601_duration("P1W"), Some(604_800));
    }

    #[test]
    fn test_duration_shapes() {
        assert_eq!(parse_duration("253"), Some(253));
        assert_eq!(parse_duration("4:13"), Some(253));
        assert_eq!(parse_duration("1:02:03"), Some(3723));
        assert_eq!(parse_duration("PT30S"), Some(30));
        assert_eq!(parse_duration("soon"), None);
    }

    #[test]
    fn test_counts() {
        assert_eq!(parse_count("1234"), Some(1234));
        assert_eq!(parse_count("1,234,567 views"), Some(1_234_567));
        assert_eq!(parse_count("1.2M"), Some(1_200_000));
        assert_eq!(parse_count("3K likes"), Some(3_000));
        assert_eq!(parse_count("no views"), None);
    }

    #[test]
    fn test_count_with_fraction_and_no_suffix() {
        assert_eq!(parse_count("1.5"), Some(2));
        assert_eq!(parse_count("12.4 views"), Some(12));
        assert_eq!(parse_count("1.234.567"), Some(1_234_567));
        assert_eq!(parse_count("1,234.0"), Some(1_234));
    }

    #[test]
    fn test_normalize_date() {
        assert_eq!(normalize_date("2024-01-15").as_deref(), Some("2024-01-15T00:00:00Z"));
        assert_eq!(
            normalize_date("2024-01-15T10:30:00Z").as_deref(),
            Some("2024-01-15T10:30:00Z")
        );
        assert_eq!(
            normalize_date("2024-01-15T10:30:00-07:00").as_deref(),
            Some("2024-01-15T10:30:00-07:00")
        );
        assert_eq!(normalize_date("yesterday"), None);
    }

    #[test]
    fn test_identity_rotation_cycles() {
        let rotation = IdentityRotation::new();
        let first = rotation.next_identity();
        let second = rotation.next_identity();
        assert_ne!(first, second);
        for _ in 0..3 {
            rotation.next_identity();
        }
        assert_eq!(rotation.next_identity(), first);
    }

    #[test]
    fn test_backoff_doubles() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff_delay(base, 0), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, 3), Duration::from_millis(800));
    }

    #[tokio::test]
    async fn test_retry_stops_on_permanent_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_backoff(
            5,
            Duration::from_millis(1),
            |e| e.is_transient(),
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(EnrichError::NotFound("gone".into())) }
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_error() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(
            3,
            Duration::from_millis(1),
            |e| e.is_transient(),
            |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err(EnrichError::Timeout("slow".into()))
                    } else {
                        Ok(attempt)
                    }
                }
            },
        )
        .await;
        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
