use std::collections::{BTreeSet, HashMap};
use std::sync::LazyLock;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Synthetic probe status codes, kept outside the valid HTTP range.
pub const STATUS_REFERER_DENY: i32 = -200;
pub const STATUS_REFERER_NOT_ALLOWED: i32 = -201;
pub const STATUS_CONNECTION_ERROR: i32 = -202;
pub const STATUS_TIMEOUT: i32 = -203;

/// Statuses that mean "this host rejects hotlinking"; images with these
/// statuses are rewritten to the in-system proxy. 5xx is intentionally
/// absent: a server error is not evidence of referer blocking.
pub const IMAGE_REFERER_DENY_STATUS: &[i32] = &[
    400,
    401,
    403,
    404,
    STATUS_REFERER_DENY,
    STATUS_REFERER_NOT_ALLOWED,
];

static IMG_SRC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<img\s[^>]*?src\s*=\s*(?:"(?P<dq>[^"]*)"|'(?P<sq>[^']*)'|(?P<uq>[^\s>]+))"#)
        .unwrap()
});

/// Distinct image URLs referenced by `<img src=...>` tags in story HTML.
pub fn story_image_urls(content: &str) -> BTreeSet<String> {
    IMG_SRC_RE
        .captures_iter(content)
        .filter_map(|caps| capture_src(&caps))
        .filter(|src| src.starts_with("http://") || src.starts_with("https://"))
        .map(str::to_owned)
        .collect()
}

/// Substitute image URLs in story HTML according to `replaces`, leaving all
/// other markup untouched.
pub fn rewrite_story_images(content: &str, replaces: &HashMap<String, String>) -> String {
    IMG_SRC_RE
        .replace_all(content, |caps: &Captures| {
            let whole = caps.get(0).unwrap().as_str();
            match capture_src(caps).and_then(|src| replaces.get(src).map(|new| (src, new))) {
                Some((src, new)) => whole.replacen(src, new, 1),
                None => whole.to_owned(),
            }
        })
        .into_owned()
}

fn capture_src<'t>(caps: &Captures<'t>) -> Option<&'t str> {
    caps.name("dq")
        .or_else(|| caps.name("sq"))
        .or_else(|| caps.name("uq"))
        .map(|m| m.as_str())
}

#[derive(Debug, Serialize, Deserialize)]
struct ImageUrlData<'a> {
    url: &'a str,
    base: &'a str,
}

/// Compact URL-safe encoding of `(image_url, base_story_url)`, sufficient
/// for the image proxy to recover both.
pub fn encode_image_url(image_url: &str, base_url: &str) -> String {
    let data = ImageUrlData {
        url: image_url,
        base: base_url,
    };
    let json = serde_json::to_vec(&data).expect("image url data is serializable");
    URL_SAFE_NO_PAD.encode(json)
}

#[derive(Debug, Error)]
pub enum ImageUrlDecodeError {
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Inverse of [`encode_image_url`]; returns `(image_url, base_story_url)`.
pub fn decode_image_url(encoded: &str) -> Result<(String, String), ImageUrlDecodeError> {
    let bytes = URL_SAFE_NO_PAD.decode(encoded)?;
    let data: ImageUrlData = serde_json::from_slice(&bytes)?;
    Ok((data.url.to_owned(), data.base.to_owned()))
}

/// Proxy path for a denied image, as served by the public API.
pub fn proxy_image_url(image_url: &str, base_url: &str) -> String {
    format!("/api/v1/image/{}", encode_image_url(image_url, base_url))
}
