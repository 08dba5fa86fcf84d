use std::sync::LazyLock;

use regex::Regex;

static SCRIPT_STYLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(script|style)\b[^>]*>.*?</(script|style)>").unwrap()
});
static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").unwrap());
static LINK_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?is)<a\s[^>]*\bhref\s*="#).unwrap());
static IMG_TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)<img\b").unwrap());
static BARE_URL_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"https?://").unwrap());

/// Collapse whitespace and trim the result to at most `width` characters.
pub fn shorten(text: &str, width: usize) -> String {
    let collapsed: Vec<&str> = text.split_whitespace().collect();
    let collapsed = collapsed.join(" ");
    if collapsed.chars().count() <= width {
        return collapsed;
    }
    collapsed.chars().take(width).collect()
}

/// Strip tags and decode the common entities, collapsing whitespace.
/// Good enough for summaries and length heuristics; not a sanitizer.
pub fn html_to_text(html: &str) -> String {
    let without_blocks = SCRIPT_STYLE_RE.replace_all(html, " ");
    let without_tags = TAG_RE.replace_all(&without_blocks, " ");
    let decoded = decode_entities(&without_tags);
    let words: Vec<&str> = decoded.split_whitespace().collect();
    words.join(" ")
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Number of anchor links in story HTML.
pub fn story_link_count(content: &str) -> usize {
    LINK_TAG_RE.find_iter(content).count()
}

/// Number of bare URLs in the text rendering of story HTML.
pub fn story_url_count(content: &str) -> usize {
    BARE_URL_RE.find_iter(&html_to_text(content)).count()
}

/// Number of image tags in story HTML.
pub fn story_image_count(content: &str) -> usize {
    IMG_TAG_RE.find_iter(content).count()
}
