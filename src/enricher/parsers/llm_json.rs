// Language-model response parser
//
// Best-effort: models wrap JSON in code fences, add prose around it, leave
// trailing commas or drop closing braces. The single entry point strips
// fences, isolates the outermost object and tries one repair pass before
// giving up. Field mapping is lenient about key casing and value types.

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{Map, Value};

use crate::enricher::errors::EnrichError;
use crate::enricher::models::{ContentType, ScrapedVideoData};
use crate::enricher::utils::{normalize_date, parse_count, parse_duration};

lazy_static! {
    static ref TRAILING_COMMA_RE: Regex = Regex::new(r",(\s*[}\]])").unwrap();
}

/// Parse a completion into metadata
pub fn parse_llm_response(text: &str) -> Result<ScrapedVideoData, EnrichError> {
    let body = strip_fences(text);
    let candidate = outermost_object(body)
        .ok_or_else(|| EnrichError::MalformedResponse("no JSON object in completion".to_string()))?;

    let value: Value = match serde_json::from_str(candidate) {
        Ok(value) => value,
        Err(first) => serde_json::from_str(&repair(candidate)).map_err(|_| {
            EnrichError::MalformedResponse(format!("unrepairable JSON: {}", first))
        })?,
    };

    let object = value
        .as_object()
        .ok_or_else(|| EnrichError::MalformedResponse("completion is not a JSON object".to_string()))?;

    let data = map_fields(object);
    if data.is_empty() {
        return Err(EnrichError::MalformedResponse(
            "no metadata fields in completion".to_string(),
        ));
    }
    Ok(data)
}

fn strip_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the language tag line (```json)
    let rest = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest,
    };
    rest.trim_end().trim_end_matches("```").trim()
}

/// From the first `{` to the last `}`; an object missing its closing
/// braces runs to the end of the text
fn outermost_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    match text.rfind('}') {
        Some(end) if end > start => Some(&text[start..=end]),
        _ => Some(&text[start..]),
    }
}

/// Strip trailing commas, drop unmatched closers and append missing ones
fn repair(candidate: &str) -> String {
    let cleaned = TRAILING_COMMA_RE.replace_all(candidate, "$1");

    let mut out = String::with_capacity(cleaned.len() + 8);
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in cleaned.chars() {
        if in_string {
            out.push(c);
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '{' => {
                stack.push('}');
                out.push(c);
            }
            '[' => {
                stack.push(']');
                out.push(c);
            }
            '}' | ']' => {
                if stack.last() == Some(&c) {
                    stack.pop();
                    out.push(c);
                }
            }
            _ => out.push(c),
        }
    }

    if in_string {
        out.push('"');
    }
    let trimmed_len = out.trim_end().trim_end_matches(',').len();
    out.truncate(trimmed_len);
    while let Some(closer) = stack.pop() {
        out.push(closer);
    }
    out
}

/// First present key among `keys`, accepting camelCase and snake_case
fn field<'a>(object: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| object.get(*k))
        .find(|v| !v.is_null())
}

fn string_field(object: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    match field(object, keys)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn count_field(object: &Map<String, Value>, keys: &[&str]) -> Option<u64> {
    match field(object, keys)? {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f.round() as u64)),
        Value::String(s) => parse_count(s),
        _ => None,
    }
}

fn bool_field(object: &Map<String, Value>, keys: &[&str]) -> Option<bool> {
    match field(object, keys)? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" => Some(true),
            "false" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn map_fields(object: &Map<String, Value>) -> ScrapedVideoData {
    let duration_seconds = match field(object, &["durationSeconds", "duration_seconds", "duration"]) {
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => parse_duration(s),
        _ => None,
    };

    let tags = match field(object, &["tags", "keywords"]) {
        Some(Value::Array(items)) => Some(
            items
                .iter()
                .filter_map(|t| t.as_str())
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect::<Vec<_>>(),
        ),
        Some(Value::String(s)) => Some(
            s.split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect(),
        ),
        _ => None,
    }
    .filter(|t| !t.is_empty());

    let content_type = string_field(object, &["contentType", "content_type"]).and_then(|s| {
        match s.to_lowercase().as_str() {
            "video" => Some(ContentType::Video),
            "short" | "shorts" => Some(ContentType::Short),
            "livestream" | "live" | "live_stream" => Some(ContentType::Livestream),
            "premiere" => Some(ContentType::Premiere),
            _ => None,
        }
    });

    ScrapedVideoData {
        title: string_field(object, &["title", "name"]),
        description: string_field(object, &["description"]),
        channel_name: string_field(object, &["channelName", "channel_name", "channel", "author"]),
        channel_id: string_field(object, &["channelId", "channel_id"]),
        duration_seconds,
        view_count: count_field(object, &["viewCount", "view_count", "views"]),
        like_count: count_field(object, &["likeCount", "like_count", "likes"]),
        comment_count: count_field(object, &["commentCount", "comment_count", "comments"]),
        published_at: string_field(object, &["publishedAt", "published_at", "publishDate", "uploadDate"])
            .and_then(|d| normalize_date(&d)),
        tags,
        thumbnail_url: string_field(object, &["thumbnailUrl", "thumbnail_url", "thumbnail"]),
        category: string_field(object, &["category", "genre"]),
        is_livestream: bool_field(object, &["isLivestream", "is_livestream", "isLive"]),
        is_short: bool_field(object, &["isShort", "is_short"]),
        content_type,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_json() {
        let data = parse_llm_response(
            r#"{"title":"Intro to Tokio","channelName":"Rust Org","durationSeconds":612,"viewCount":"1.2M views","tags":["rust","async"]}"#,
        )
        .unwrap();
        assert_eq!(data.title.as_deref(), Some("Intro to Tokio"));
        assert_eq!(data.channel_name.as_deref(), Some("Rust Org"));
        assert_eq!(data.duration_seconds, Some(612));
        assert_eq!(data.view_count, Some(1_200_000));
        assert_eq!(data.tags, Some(vec!["rust".to_string(), "async".to_string()]));
    }

    #[test]
    fn test_code_fence_and_prose() {
        let text = "```json\nHere you go:\n{\"title\": \"Fenced\", \"channel_name\": \"C\"}\n```";
        let data = parse_llm_response(text).unwrap();
        assert_eq!(data.title.as_deref(), Some("Fenced"));
        assert_eq!(data.channel_name.as_deref(), Some("C"));
    }

    #[test]
    fn test_trailing_commas_repaired() {
        let data = parse_llm_response(r#"{"title": "T", "tags": ["a", "b",],}"#).unwrap();
        assert_eq!(data.tags, Some(vec!["a".to_string(), "b".to_string()]));
    }

    #[test]
    fn test_missing_closing_brace_repaired() {
        let data = parse_llm_response(r#"Sure! {"title": "Cut off", "category": "Music", "tags": ["x""#).unwrap();
        assert_eq!(data.title.as_deref(), Some("Cut off"));
        assert_eq!(data.category.as_deref(), Some("Music"));
    }

    #[test]
    fn test_extra_closing_brace_repaired() {
        let data = parse_llm_response(r#"{"title": "Extra"}}"#).unwrap();
        assert_eq!(data.title.as_deref(), Some("Extra"));
    }

    #[test]
    fn test_lenient_values() {
        let data = parse_llm_response(
            r#"{"title":"T","duration":"PT3M","published_at":"2023-07-04","is_short":"no","contentType":"Premiere","likes":"3.4K"}"#,
        )
        .unwrap();
        assert_eq!(data.duration_seconds, Some(180));
        assert_eq!(data.published_at.as_deref(), Some("2023-07-04T00:00:00Z"));
        assert_eq!(data.is_short, Some(false));
        assert_eq!(data.content_type, Some(ContentType::Premiere));
        assert_eq!(data.like_count, Some(3_400));
    }

    #[test]
    fn test_failures() {
        assert!(matches!(
            parse_llm_response("I could not find any metadata."),
            Err(EnrichError::MalformedResponse(_))
        ));
        assert!(matches!(
            parse_llm_response(r#"{"unrelated": 1}"#),
            Err(EnrichError::MalformedResponse(_))
        ));
        assert!(parse_llm_response(r#"{"title": }"#).is_err());
    }
}
