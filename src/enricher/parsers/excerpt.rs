// Bounded page excerpt for language-model extraction
//
// Only the parts of a watch page that carry metadata go to the model:
// the title tag, meta/link tags, ld+json blocks and a capped slice of the
// embedded player state.

use lazy_static::lazy_static;
use regex::Regex;

use super::{assigned_json, balanced_json_at};

/// Cap on the embedded player-state slice
const PLAYER_STATE_CHARS: usize = 4_000;

lazy_static! {
    static ref TITLE_RE: Regex = Regex::new(r"(?is)<title[^>]*>(.*?)</title>").unwrap();
    static ref META_RE: Regex = Regex::new(r"(?is)<(?:meta|link)\b[^>]*(?:property|name|itemprop)\s*=[^>]*>").unwrap();
    static ref LD_JSON_RE: Regex =
        Regex::new(r#"(?is)<script[^>]*application/ld\+json[^>]*>(.*?)</script>"#).unwrap();
}

/// Relevant parts of `html`, or `None` when the page has none
pub fn extract_excerpt(html: &str) -> Option<String> {
    let mut sections: Vec<String> = Vec::new();

    if let Some(cap) = TITLE_RE.captures(html) {
        let title = cap[1].trim();
        if !title.is_empty() {
            sections.push(format!("TITLE: {}", title));
        }
    }

    let meta: Vec<&str> = META_RE.find_iter(html).map(|m| m.as_str()).collect();
    if !meta.is_empty() {
        sections.push(format!("META:\n{}", meta.join("\n")));
    }

    for cap in LD_JSON_RE.captures_iter(html) {
        let block = cap[1].trim();
        if !block.is_empty() {
            sections.push(format!("LD+JSON:\n{}", block));
        }
    }

    if let Some(state) = player_state(html) {
        sections.push(format!("PLAYER STATE:\n{}", truncate_chars(&state, PLAYER_STATE_CHARS)));
    }

    (!sections.is_empty()).then(|| sections.join("\n\n"))
}

/// videoDetails + microformat from the player response; the whole response
/// is far larger than both together
fn player_state(html: &str) -> Option<String> {
    let player = assigned_json(html, "ytInitialPlayerResponse")?;
    let parts: Vec<&str> = ["\"videoDetails\"", "\"microformat\""]
        .iter()
        .filter_map(|key| {
            let at = player.find(key)? + key.len();
            let open = player[at..].find('{')? + at;
            balanced_json_at(player, open)
        })
        .collect();

    if parts.is_empty() {
        return Some(player.to_string());
    }
    Some(parts.join("\n"))
}

/// First `max_chars` characters of `text`, cut on a char boundary
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => text[..cut].to_string(),
        None => text.to_string(),
    }
}
