// Pure parsing functions
//
// Everything here is synchronous and side-effect free so the same function
// can run on a parser worker or inline on the calling task.

pub mod excerpt;
pub mod html;
pub mod llm_json;

pub use excerpt::{extract_excerpt, truncate_chars};
pub use html::parse_watch_page;
pub use llm_json::parse_llm_response;

/// Slice of `text` holding the JSON object or array that opens at byte
/// `start`, honoring string literals and escapes. Returns `None` when the
/// value is not closed before the end of `text`.
pub fn balanced_json_at(text: &str, start: usize) -> Option<&str> {
    let bytes = text.as_bytes();
    let open = *bytes.get(start)?;
    if open != b'{' && open != b'[' {
        return None;
    }

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' | b'[' => depth += 1,
            b'}' | b']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return text.get(start..start + offset + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// Object literal assigned to `name` in an inline script
/// (`var ytInitialPlayerResponse = {...};`)
pub fn assigned_json<'a>(text: &'a str, name: &str) -> Option<&'a str> {
    text.match_indices(name).find_map(|(at, _)| {
        let after = at + name.len();
        let rest = text[after..].trim_start();
        let rest = rest.strip_prefix('=')?.trim_start();
        if !rest.starts_with('{') {
            return None;
        }
        let open = text.len() - rest.len();
        balanced_json_at(text, open)
    })
}

/// Decode the handful of HTML entities that show up in meta attributes
pub fn unescape_html(value: &str) -> String {
    if !value.contains('&') {
        return value.to_string();
    }
    value
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}
