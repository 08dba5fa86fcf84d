use std::sync::LazyLock;

use regex::Regex;
use url::Url;

use crate::infrastructure::feed_reader::{FeedReader, FeedResponse, ReadOutcome};

/// Paths tried when a url is neither a feed nor a page advertising one.
const COMMON_FEED_PATHS: &[&str] = &["feed", "rss", "atom.xml", "feed.xml", "rss.xml", "index.xml"];

static LINK_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<link\b[^>]*>").unwrap());
static HREF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?is)\bhref\s*=\s*["']([^"']+)["']"#).unwrap());

/// A feed located by discovery: the parsed document plus the HTTP response
/// it came from, ready for the normalizer.
pub struct FoundFeed {
    pub response: FeedResponse,
    pub feed: feed_rs::model::Feed,
}

/// Locate the feed behind a user-submitted url: try the url itself, then
/// any `<link rel="alternate">` advertised by an HTML page there, then a
/// handful of well-known feed paths. Every step appends a human-readable
/// message; the collected messages become the creation record's report.
pub struct FeedFinder<'a> {
    reader: &'a FeedReader,
    messages: Vec<String>,
}

impl<'a> FeedFinder<'a> {
    pub fn new(reader: &'a FeedReader) -> Self {
        Self {
            reader,
            messages: Vec::new(),
        }
    }

    pub async fn find(mut self, url: &str) -> (Option<FoundFeed>, Vec<String>) {
        match self.try_url(url).await {
            Attempt::Feed(found) => return (Some(found), self.messages),
            Attempt::Html(body) => {
                if let Some(href) = find_feed_link_in_html(&String::from_utf8_lossy(&body), url) {
                    self.log(format!("discovered feed link {href}"));
                    if let Attempt::Feed(found) = self.try_url(&href).await {
                        return (Some(found), self.messages);
                    }
                }
            }
            Attempt::Failed => {}
        }

        for candidate in candidate_urls(url) {
            if let Attempt::Feed(found) = self.try_url(&candidate).await {
                return (Some(found), self.messages);
            }
        }

        self.log(format!("no feed found at {url}"));
        (None, self.messages)
    }

    async fn try_url(&mut self, url: &str) -> Attempt {
        self.log(format!("try {url}"));
        let outcome = match self.reader.read(url, None, None).await {
            Ok(outcome) => outcome,
            Err(err) => {
                self.log(format!("fetch {url} failed: {err}"));
                return Attempt::Failed;
            }
        };
        let response = match outcome {
            ReadOutcome::Fetched(response) => response,
            // No conditional headers were sent, a 304 here is a server bug
            ReadOutcome::NotModified => {
                self.log(format!("fetch {url} returned not-modified"));
                return Attempt::Failed;
            }
        };
        match feed_rs::parser::parse(response.body.as_slice()) {
            Ok(feed) => {
                self.log(format!("found feed at {}", response.final_url));
                Attempt::Feed(FoundFeed { response, feed })
            }
            Err(err) => {
                self.log(format!("content at {url} is not a feed: {err}"));
                Attempt::Html(response.body)
            }
        }
    }

    fn log(&mut self, message: String) {
        tracing::info!("{}", message);
        self.messages.push(message);
    }
}

enum Attempt {
    Feed(FoundFeed),
    Html(Vec<u8>),
    Failed,
}

fn candidate_urls(url: &str) -> Vec<String> {
    let Ok(base) = Url::parse(url) else {
        return Vec::new();
    };
    COMMON_FEED_PATHS
        .iter()
        .filter_map(|path| base.join(path).ok())
        .map(|u| u.to_string())
        .filter(|candidate| candidate.as_str() != url)
        .collect()
}

/// First `<link rel="alternate">` with an RSS/Atom type, resolved against
/// the page url.
fn find_feed_link_in_html(html: &str, base_url: &str) -> Option<String> {
    for tag in LINK_TAG_RE.find_iter(html) {
        let tag = tag.as_str();
        let lower = tag.to_ascii_lowercase();
        let is_alternate =
            lower.contains(r#"rel="alternate""#) || lower.contains("rel='alternate'");
        let is_feed_type =
            lower.contains("application/rss+xml") || lower.contains("application/atom+xml");
        if !is_alternate || !is_feed_type {
            continue;
        }
        if let Some(caps) = HREF_RE.captures(tag) {
            let href = caps.get(1).unwrap().as_str();
            return Some(resolve_url(href, base_url));
        }
    }
    None
}

fn resolve_url(href: &str, base_url: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        return href.to_owned();
    }
    if let Ok(base) = Url::parse(base_url) {
        if let Ok(resolved) = base.join(href) {
            return resolved.to_string();
        }
    }
    href.to_owned()
}
