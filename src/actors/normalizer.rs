use chrono::{DateTime, Utc};
use feed_rs::model::{Entry, Feed as ParsedFeed, FeedType};

use crate::domain::hash::compute_hash_base64;
use crate::domain::payload::{FeedPayload, StoryPayload, MAX_SUMMARY_LEN, MAX_TITLE_LEN};
use crate::domain::text::{html_to_text, shorten};
use crate::infrastructure::feed_reader::FeedResponse;

/// Fold parser output and the raw HTTP response into the canonical feed
/// payload. Timestamps from the future are untrusted and dropped, so the
/// state side fills them with its own clock.
pub fn build_feed_payload(
    parsed: ParsedFeed,
    response: &FeedResponse,
    now: DateTime<Utc>,
) -> FeedPayload {
    let title = parsed
        .title
        .as_ref()
        .map(|t| shorten(&t.content, MAX_TITLE_LEN))
        .filter(|t| !t.is_empty())
        // Title is required downstream; a nameless feed keeps its url
        .unwrap_or_else(|| response.final_url.clone());

    let link = feed_link(&parsed);
    let author = parsed
        .authors
        .first()
        .map(|a| shorten(&a.name, MAX_TITLE_LEN));
    let icon = parsed
        .icon
        .as_ref()
        .map(|i| i.uri.clone())
        .or_else(|| parsed.logo.as_ref().map(|l| l.uri.clone()));
    let description = parsed.description.as_ref().map(|d| d.content.clone());
    let dt_updated = clamp_future(parsed.updated.or(parsed.published), now);

    let storys = parsed
        .entries
        .into_iter()
        .filter_map(|entry| story_payload(entry, now))
        .collect();

    FeedPayload {
        url: response.final_url.clone(),
        title,
        content_hash_base64: compute_hash_base64(&[response.body.as_slice()]),
        link,
        author,
        icon,
        description,
        version: Some(version_of(parsed.feed_type).to_owned()),
        encoding: response.encoding.clone(),
        etag: response.etag.clone(),
        last_modified: response.last_modified.clone(),
        dt_updated,
        storys,
    }
}

/// The feed's website link. Some feeds put a non-url value there; fall
/// back to the author's href when that happens.
fn feed_link(parsed: &ParsedFeed) -> Option<String> {
    let link = parsed.links.first().map(|l| l.href.clone());
    match link {
        Some(link) if link.starts_with("http") => Some(link),
        other => parsed
            .authors
            .first()
            .and_then(|a| a.uri.clone())
            .or(other),
    }
}

fn story_payload(entry: Entry, now: DateTime<Utc>) -> Option<StoryPayload> {
    let link = entry.links.first().map(|l| l.href.clone());
    let unique_id = if entry.id.is_empty() {
        // Without an id or a link there is nothing to key the story on
        link.clone()?
    } else {
        entry.id.clone()
    };

    let content = entry
        .content
        .as_ref()
        .and_then(|c| c.body.clone())
        .or_else(|| entry.summary.as_ref().map(|s| s.content.clone()))
        .filter(|c| !c.is_empty());
    let summary_source = entry
        .summary
        .as_ref()
        .map(|s| s.content.clone())
        .or_else(|| content.clone())
        .unwrap_or_default();
    let summary = shorten(&html_to_text(&summary_source), MAX_SUMMARY_LEN);
    let title = entry
        .title
        .as_ref()
        .map(|t| shorten(&t.content, MAX_TITLE_LEN))
        .unwrap_or_default();

    let content_hash_base64 =
        compute_hash_base64(&[content.as_deref().unwrap_or(""), &summary, &title]);

    Some(StoryPayload {
        unique_id: shorten(&unique_id, MAX_TITLE_LEN),
        title,
        content_hash_base64,
        author: entry.authors.first().map(|a| shorten(&a.name, MAX_TITLE_LEN)),
        link,
        summary: Some(summary),
        content,
        dt_published: clamp_future(entry.published.or(entry.updated), now),
        dt_updated: clamp_future(entry.updated.or(entry.published), now),
    })
}

fn clamp_future(t: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    t.filter(|t| *t <= now)
}

fn version_of(feed_type: FeedType) -> &'static str {
    match feed_type {
        FeedType::Atom => "atom",
        FeedType::JSON => "json",
        FeedType::RSS0 => "rss09",
        FeedType::RSS1 => "rss10",
        FeedType::RSS2 => "rss20",
    }
}
