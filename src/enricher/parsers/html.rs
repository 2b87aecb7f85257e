// Watch-page parser
//
// Three extraction strategies, in priority order:
// 1. embedded player-response JSON (videoDetails + microformat)
// 2. meta / link tags (OpenGraph, schema.org itemprops)
// 3. ld+json VideoObject block
// The first strategy that yields a title/channel pair wins; the others only
// fill its gaps. Without any such pair, partial results are combined.

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

use super::{assigned_json, unescape_html};
use crate::enricher::models::{classify_content, ScrapedVideoData, StreamState};
use crate::enricher::utils::{normalize_date, parse_count, parse_iso8601_duration};

lazy_static! {
    static ref TAG_RE: Regex = Regex::new(r"(?is)<(meta|link)\b([^>]*)>").unwrap();
    static ref ATTR_RE: Regex =
        Regex::new(r#"(?is)([a-z][a-z0-9:_-]*)\s*=\s*(?:"([^"]*)"|'([^']*)')"#).unwrap();
    static ref LD_JSON_RE: Regex =
        Regex::new(r#"(?is)<script[^>]*application/ld\+json[^>]*>(.*?)</script>"#).unwrap();
}

/// Parse a watch page into metadata; `None` when nothing usable was found
pub fn parse_watch_page(html: &str) -> Option<ScrapedVideoData> {
    let candidates = [
        from_player_response(html),
        from_meta_tags(html),
        from_linked_data(html),
    ];

    let primary = candidates
        .iter()
        .position(|c| c.as_ref().map_or(false, ScrapedVideoData::has_identity));

    let mut order: Vec<usize> = (0..candidates.len()).collect();
    if let Some(i) = primary {
        order.retain(|&j| j != i);
        order.insert(0, i);
    }

    let mut data = ScrapedVideoData::default();
    for i in order {
        if let Some(candidate) = &candidates[i] {
            data.fill_missing_from(candidate);
        }
    }

    (!data.is_empty()).then_some(data)
}

fn text(value: &Value) -> Option<String> {
    value
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

/// `{"simpleText": ".."}` or `{"runs": [{"text": ".."}, ..]}`
fn renderer_text(value: &Value) -> Option<String> {
    if let Some(simple) = text(&value["simpleText"]) {
        return Some(simple);
    }
    let runs = value["runs"].as_array()?;
    let joined: String = runs.iter().filter_map(|r| r["text"].as_str()).collect();
    (!joined.trim().is_empty()).then(|| joined.trim().to_string())
}

fn number(value: &Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(parse_count))
}

fn last_thumbnail(value: &Value) -> Option<String> {
    value["thumbnails"]
        .as_array()?
        .iter()
        .rev()
        .find_map(|t| text(&t["url"]))
}

fn string_list(value: &Value) -> Option<Vec<String>> {
    let list: Vec<String> = match value {
        Value::Array(items) => items.iter().filter_map(text).collect(),
        Value::String(s) => s
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(String::from)
            .collect(),
        _ => return None,
    };
    (!list.is_empty()).then_some(list)
}

fn from_player_response(html: &str) -> Option<ScrapedVideoData> {
    let raw = assigned_json(html, "ytInitialPlayerResponse")?;
    let root: Value = serde_json::from_str(raw).ok()?;
    let details = &root["videoDetails"];
    let micro = &root["microformat"]["playerMicroformatRenderer"];
    if details.is_null() && micro.is_null() {
        return None;
    }

    let duration = number(&details["lengthSeconds"]).or_else(|| number(&micro["lengthSeconds"]));
    let live_now = details["isLive"].as_bool().unwrap_or(false)
        || micro["liveBroadcastDetails"]["isLiveNow"].as_bool().unwrap_or(false);
    let upcoming = details["isUpcoming"].as_bool().unwrap_or(false);
    let live_content = details["isLiveContent"].as_bool().unwrap_or(false);
    let stream = StreamState {
        live_or_upcoming: live_now || (upcoming && live_content),
        premiere: upcoming && !live_content,
    };

    let data = ScrapedVideoData {
        title: text(&details["title"]).or_else(|| renderer_text(&micro["title"])),
        description: text(&details["shortDescription"])
            .or_else(|| renderer_text(&micro["description"])),
        channel_name: text(&details["author"]).or_else(|| text(&micro["ownerChannelName"])),
        channel_id: text(&details["channelId"]).or_else(|| text(&micro["externalChannelId"])),
        duration_seconds: duration,
        view_count: number(&details["viewCount"]).or_else(|| number(&micro["viewCount"])),
        published_at: text(&micro["publishDate"])
            .or_else(|| text(&micro["uploadDate"]))
            .and_then(|d| normalize_date(&d)),
        tags: string_list(&details["keywords"]),
        thumbnail_url: last_thumbnail(&details["thumbnail"])
            .or_else(|| last_thumbnail(&micro["thumbnail"])),
        category: text(&micro["category"]),
        is_livestream: Some(stream.live_or_upcoming),
        content_type: Some(classify_content(false, stream, duration)),
        ..Default::default()
    };

    (!data.is_empty()).then_some(data)
}

struct Tag {
    element: String,
    key: String,
    value: String,
}

fn tags(html: &str) -> Vec<Tag> {
    TAG_RE
        .captures_iter(html)
        .filter_map(|cap| {
            let element = cap[1].to_lowercase();
            let mut key = None;
            let mut value = None;
            for attr in ATTR_RE.captures_iter(&cap[2]) {
                let name = attr[1].to_lowercase();
                let raw = attr.get(2).or_else(|| attr.get(3)).map_or("", |m| m.as_str());
                match name.as_str() {
                    "property" | "name" | "itemprop" if key.is_none() => {
                        key = Some(raw.to_lowercase())
                    }
                    "content" | "href" if value.is_none() => value = Some(unescape_html(raw)),
                    _ => {}
                }
            }
            Some(Tag {
                element,
                key: key?,
                value: value?.trim().to_string(),
            })
        })
        .filter(|tag| !tag.value.is_empty())
        .collect()
}

fn set_once<T>(slot: &mut Option<T>, value: Option<T>) {
    if slot.is_none() {
        *slot = value;
    }
}

fn from_meta_tags(html: &str) -> Option<ScrapedVideoData> {
    let mut data = ScrapedVideoData::default();
    let mut keywords = Vec::new();

    for tag in tags(html) {
        let value = Some(tag.value.clone());
        match (tag.element.as_str(), tag.key.as_str()) {
            ("link", "name") => set_once(&mut data.channel_name, value),
            (_, "og:title") | (_, "twitter:title") | ("meta", "title") | ("meta", "name") => {
                set_once(&mut data.title, value)
            }
            (_, "og:description") | (_, "twitter:description") | (_, "description") => {
                set_once(&mut data.description, value)
            }
            (_, "og:image") | (_, "twitter:image") | (_, "thumbnailurl") => {
                set_once(&mut data.thumbnail_url, value)
            }
            (_, "duration") => set_once(&mut data.duration_seconds, parse_iso8601_duration(&tag.value)),
            (_, "interactioncount") => set_once(&mut data.view_count, parse_count(&tag.value)),
            (_, "datepublished") | (_, "uploaddate") => {
                set_once(&mut data.published_at, normalize_date(&tag.value))
            }
            (_, "genre") => set_once(&mut data.category, value),
            (_, "channelid") => set_once(&mut data.channel_id, value),
            (_, "og:video:tag") => keywords.push(tag.value),
            (_, "keywords") if keywords.is_empty() => {
                keywords.extend(
                    tag.value
                        .split(',')
                        .map(str::trim)
                        .filter(|t| !t.is_empty())
                        .map(String::from),
                );
            }
            _ => {}
        }
    }

    if !keywords.is_empty() {
        data.tags = Some(keywords);
    }
    (!data.is_empty()).then_some(data)
}

fn is_video_object(value: &Value) -> bool {
    match &value["@type"] {
        Value::String(t) => t == "VideoObject",
        Value::Array(types) => types.iter().any(|t| t.as_str() == Some("VideoObject")),
        _ => false,
    }
}

fn find_video_object(value: &Value) -> Option<&Value> {
    if is_video_object(value) {
        return Some(value);
    }
    if let Some(items) = value.as_array() {
        return items.iter().find_map(find_video_object);
    }
    value["@graph"].as_array()?.iter().find_map(find_video_object)
}

fn from_linked_data(html: &str) -> Option<ScrapedVideoData> {
    LD_JSON_RE.captures_iter(html).find_map(|cap| {
        let value: Value = serde_json::from_str(cap[1].trim()).ok()?;
        let video = find_video_object(&value)?;
        let data = video_object_data(video);
        (!data.is_empty()).then_some(data)
    })
}

fn video_object_data(video: &Value) -> ScrapedVideoData {
    let mut data = ScrapedVideoData {
        title: text(&video["name"]),
        description: text(&video["description"]),
        channel_name: text(&video["author"]).or_else(|| text(&video["author"]["name"])),
        duration_seconds: video["duration"].as_str().and_then(parse_iso8601_duration),
        published_at: text(&video["uploadDate"])
            .or_else(|| text(&video["datePublished"]))
            .and_then(|d| normalize_date(&d)),
        tags: string_list(&video["keywords"]),
        thumbnail_url: text(&video["thumbnailUrl"])
            .or_else(|| video["thumbnailUrl"].as_array().and_then(|a| a.iter().find_map(text))),
        category: text(&video["genre"]),
        ..Default::default()
    };

    let stats: Vec<&Value> = match &video["interactionStatistic"] {
        Value::Array(items) => items.iter().collect(),
        Value::Null => Vec::new(),
        single => vec![single],
    };
    for stat in stats {
        let count = number(&stat["userInteractionCount"]);
        let kind = stat["interactionType"]
            .as_str()
            .or_else(|| stat["interactionType"]["@type"].as_str())
            .unwrap_or("");
        if kind.contains("WatchAction") {
            set_once(&mut data.view_count, count);
        } else if kind.contains("LikeAction") {
            set_once(&mut data.like_count, count);
        } else if kind.contains("CommentAction") {
            set_once(&mut data.comment_count, count);
        }
    }
    set_once(&mut data.view_count, number(&video["interactionCount"]));

    if let Some(live) = video["publication"]
        .as_array()
        .and_then(|p| p.iter().find_map(|e| e["isLiveBroadcast"].as_bool()))
    {
        data.is_livestream = Some(live);
    }

    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enricher::models::ContentType;

    const PLAYER_PAGE: &str = r#"<html><head><title>Rust in 100 Seconds - YouTube</title>
<meta property="og:title" content="Rust in 100 Seconds">
</head><body><script>var ytInitialPlayerResponse = {"videoDetails":{"videoId":"5C_HPTJg5ek","title":"Rust in 100 Seconds","lengthSeconds":"149","keywords":["rust","programming"],"channelId":"UCsBjURrPoezykLs9EqgamOA","shortDescription":"Rust is a memory-safe {systems} language","thumbnail":{"thumbnails":[{"url":"https://i.ytimg.com/small.jpg"},{"url":"https://i.ytimg.com/large.jpg"}]},"viewCount":"2154321","author":"Fireship","isLiveContent":false},"microformat":{"playerMicroformatRenderer":{"category":"Science & Technology","publishDate":"2021-09-20T08:00:00-07:00"}}};</script></body></html>"#;

    #[test]
    fn test_player_response_strategy() {
        let data = parse_watch_page(PLAYER_PAGE).unwrap();
        assert_eq!(data.title.as_deref(), Some("Rust in 100 Seconds"));
        assert_eq!(data.channel_name.as_deref(), Some("Fireship"));
        assert_eq!(data.channel_id.as_deref(), Some("UCsBjURrPoezykLs9EqgamOA"));
        assert_eq!(data.duration_seconds, Some(149));
        assert_eq!(data.view_count, Some(2_154_321));
        assert_eq!(data.description.as_deref(), Some("Rust is a memory-safe {systems} language"));
        assert_eq!(data.tags, Some(vec!["rust".to_string(), "programming".to_string()]));
        assert_eq!(data.thumbnail_url.as_deref(), Some("https://i.ytimg.com/large.jpg"));
        assert_eq!(data.category.as_deref(), Some("Science & Technology"));
        assert_eq!(data.published_at.as_deref(), Some("2021-09-20T08:00:00-07:00"));
        assert_eq!(data.content_type, Some(ContentType::Video));
    }

    #[test]
    fn test_meta_tag_strategy() {
        let html = r#"<head>
<meta property="og:title" content="Tom &amp; Jerry Classic">
<meta name="description" content="A cartoon">
<meta itemprop="duration" content="PT4M13S">
<meta itemprop="interactionCount" content="98765">
<meta itemprop="datePublished" content="2020-05-01">
<meta itemprop="genre" content="Comedy">
<meta property="og:video:tag" content="cartoon">
<meta property="og:video:tag" content="classic">
<span itemprop="author"><link itemprop="url" href="https://www.youtube.com/@wb"><link itemprop="name" content="WB Kids"></span>
</head>"#;
        let data = parse_watch_page(html).unwrap();
        assert_eq!(data.title.as_deref(), Some("Tom & Jerry Classic"));
        assert_eq!(data.channel_name.as_deref(), Some("WB Kids"));
        assert_eq!(data.duration_seconds, Some(253));
        assert_eq!(data.view_count, Some(98_765));
        assert_eq!(data.published_at.as_deref(), Some("2020-05-01T00:00:00Z"));
        assert_eq!(data.category.as_deref(), Some("Comedy"));
        assert_eq!(data.tags, Some(vec!["cartoon".to_string(), "classic".to_string()]));
    }

    #[test]
    fn test_linked_data_strategy() {
        let html = r#"<script type="application/ld+json">{"@context":"https://schema.org","@type":"VideoObject","name":"Lecture 1","author":{"@type":"Person","name":"MIT OCW"},"duration":"PT1H2M3S","uploadDate":"2019-01-02T03:04:05Z","thumbnailUrl":["https://i.ytimg.com/lecture.jpg"],"interactionStatistic":[{"@type":"InteractionCounter","interactionType":"https://schema.org/WatchAction","userInteractionCount":4200},{"@type":"InteractionCounter","interactionType":"https://schema.org/LikeAction","userInteractionCount":"310"}]}</script>"#;
        let data = parse_watch_page(html).unwrap();
        assert_eq!(data.title.as_deref(), Some("Lecture 1"));
        assert_eq!(data.channel_name.as_deref(), Some("MIT OCW"));
        assert_eq!(data.duration_seconds, Some(3_723));
        assert_eq!(data.view_count, Some(4_200));
        assert_eq!(data.like_count, Some(310));
        assert_eq!(data.thumbnail_url.as_deref(), Some("https://i.ytimg.com/lecture.jpg"));
    }

    #[test]
    fn test_identity_strategy_wins_and_others_fill_gaps() {
        // Meta tags carry a different title but no channel; the ld+json
        // block carries the full identity and should win.
        let html = r#"<meta property="og:title" content="Clickbait Title">
<meta itemprop="genre" content="Music">
<script type="application/ld+json">{"@type":"VideoObject","name":"Real Title","author":"Real Channel"}</script>"#;
        let data = parse_watch_page(html).unwrap();
        assert_eq!(data.title.as_deref(), Some("Real Title"));
        assert_eq!(data.channel_name.as_deref(), Some("Real Channel"));
        assert_eq!(data.category.as_deref(), Some("Music"));
    }

    #[test]
    fn test_partial_extraction_is_kept() {
        let data = parse_watch_page(r#"<meta property="og:title" content="Only Title">"#).unwrap();
        assert_eq!(data.title.as_deref(), Some("Only Title"));
        assert_eq!(data.view_count, None);
    }

    #[test]
    fn test_upcoming_live_stream() {
        let html = r#"<script>var ytInitialPlayerResponse = {"videoDetails":{"title":"Launch","author":"NASA","lengthSeconds":"0","isUpcoming":true,"isLiveContent":true}};</script>"#;
        let data = parse_watch_page(html).unwrap();
        assert_eq!(data.content_type, Some(ContentType::Livestream));
        assert_eq!(data.is_livestream, Some(true));
    }

    #[test]
    fn test_nothing_usable() {
        assert_eq!(parse_watch_page("<html><body>nothing here</body></html>"), None);
        assert_eq!(parse_watch_page(""), None);
    }
}
