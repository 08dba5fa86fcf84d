use std::collections::BTreeSet;
use std::sync::LazyLock;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use dom_smoothie::Readability;
use futures::future::join_all;

use crate::actors::{normalizer, FetchMessage, ImageStatus, StateMessage};
use crate::domain::hash::compute_hash_base64;
use crate::domain::heuristics::UrlBlacklist;
use crate::domain::image::{story_image_urls, STATUS_REFERER_DENY, STATUS_TIMEOUT};
use crate::domain::models::FeedStatus;
use crate::domain::payload::MAX_SUMMARY_LEN;
use crate::domain::text::{html_to_text, shorten};
use crate::infrastructure::bus::Bus;
use crate::infrastructure::feed_reader::{FeedReader, ReadOutcome};
use crate::infrastructure::finder::FeedFinder;

/// Referer sent with image probes, matching what the reader frontend sends.
pub const IMAGE_PROBE_REFERER: &str = "https://rss.anyant.com/story/";

/// Hosts that reject hotlinked images outright; probing them is pointless.
const REFERER_DENY_LIST: &str = "
qpic.cn
qlogo.cn
qq.com
";

static REFERER_DENY: LazyLock<UrlBlacklist> =
    LazyLock::new(|| UrlBlacklist::compile(REFERER_DENY_LIST));

/// Probe budget when the message carried no deadline of its own.
const DEFAULT_PROBE_SECONDS: i64 = 30;

pub async fn handle_message(
    reader: &FeedReader,
    bus: &Bus,
    message: FetchMessage,
    expire_at: Option<DateTime<Utc>>,
) {
    match message {
        FetchMessage::FindFeed {
            feed_creation_id,
            url,
        } => find_feed(reader, bus, feed_creation_id, &url).await,
        FetchMessage::SyncFeed {
            feed_id,
            url,
            content_hash_base64,
            etag,
            last_modified,
        } => {
            sync_feed(
                reader,
                bus,
                feed_id,
                &url,
                content_hash_base64.as_deref(),
                etag.as_deref(),
                last_modified.as_deref(),
            )
            .await
        }
        FetchMessage::FetchStory { story_id, url } => fetch_story(reader, bus, story_id, &url).await,
        FetchMessage::ProcessStoryWebpage {
            story_id,
            url,
            text,
        } => process_story_webpage(bus, story_id, &url, text).await,
        FetchMessage::DetectStoryImages {
            story_id,
            story_url,
            image_urls,
        } => detect_story_images(reader, bus, story_id, story_url, image_urls, expire_at).await,
    }
}

/// Run discovery for a creation request and report the outcome. The
/// creation row is flipped to UPDATING first so the janitor can spot
/// requests that died mid-flight.
pub async fn find_feed(reader: &FeedReader, bus: &Bus, feed_creation_id: i64, url: &str) {
    bus.tell_state(StateMessage::UpdateFeedCreationStatus {
        feed_creation_id,
        status: FeedStatus::Updating,
    })
    .await;

    let finder = FeedFinder::new(reader);
    let (found, messages) = finder.find(url).await;
    let feed = found.map(|f| normalizer::build_feed_payload(f.feed, &f.response, Utc::now()));

    bus.tell_state(StateMessage::SaveFeedCreationResult {
        feed_creation_id,
        messages,
        feed,
    })
    .await;
}

/// Poll one feed. Two levels of "not modified" short-circuit the pipeline:
/// a conditional-request 304, and an unchanged body hash for servers that
/// ignore conditional headers.
pub async fn sync_feed(
    reader: &FeedReader,
    bus: &Bus,
    feed_id: i64,
    url: &str,
    content_hash_base64: Option<&str>,
    etag: Option<&str>,
    last_modified: Option<&str>,
) {
    let outcome = match reader.read(url, etag, last_modified).await {
        Ok(outcome) => outcome,
        Err(err) => {
            tracing::warn!("read feed#{} url={} failed: {}", feed_id, url, err);
            return;
        }
    };
    let response = match outcome {
        ReadOutcome::Fetched(response) => response,
        ReadOutcome::NotModified => {
            tracing::info!("feed#{} url={} not modified", feed_id, url);
            return;
        }
    };
    if response.body.is_empty() {
        tracing::info!("feed#{} url={} returned empty body", feed_id, url);
        return;
    }

    let new_hash = compute_hash_base64(&[response.body.as_slice()]);
    if Some(new_hash.as_str()) == content_hash_base64 {
        tracing::info!(
            "feed#{} url={} not modified by compare content hash",
            feed_id,
            url
        );
        return;
    }

    let parsed = match feed_rs::parser::parse(response.body.as_slice()) {
        Ok(parsed) => parsed,
        Err(err) => {
            tracing::warn!("failed to parse feed#{} url={}: {}", feed_id, url, err);
            return;
        }
    };
    let feed = normalizer::build_feed_payload(parsed, &response, Utc::now());
    bus.tell_state(StateMessage::UpdateFeed {
        feed_id,
        feed,
        is_refresh: false,
    })
    .await;
}

/// Fetch a story webpage, following redirects to its final url.
pub async fn fetch_story(reader: &FeedReader, bus: &Bus, story_id: i64, url: &str) {
    tracing::info!("fetch story#{} url={} begin", story_id, url);
    match reader.read_webpage(url).await {
        Ok((final_url, text)) => {
            tracing::info!("fetch story#{} url={} finished", story_id, final_url);
            bus.tell_fetch(FetchMessage::ProcessStoryWebpage {
                story_id,
                url: final_url,
                text,
            })
            .await;
        }
        Err(err) => {
            tracing::warn!("fetch story#{} url={} failed: {}", story_id, url, err);
        }
    }
}

/// Extract the main content of a fetched webpage and hand it to the state
/// side, then queue an image probe for whatever the extract references.
pub async fn process_story_webpage(bus: &Bus, story_id: i64, url: &str, text: String) {
    let content = {
        let article = Readability::new(text, Some(url), None)
            .and_then(|mut readability| readability.parse());
        let article = match article {
            Ok(article) => article,
            Err(err) => {
                tracing::warn!("readability failed for story#{} url={}: {}", story_id, url, err);
                return;
            }
        };
        article.content.to_string()
    };
    let summary = shorten(&html_to_text(&content), MAX_SUMMARY_LEN);
    bus.tell_state(StateMessage::UpdateStory {
        story_id,
        content: content.clone(),
        summary,
        url: url.to_owned(),
    })
    .await;

    let image_urls = story_image_urls(&content);
    tracing::info!("story#{} {} has {} images", story_id, url, image_urls.len());
    if !image_urls.is_empty() {
        bus.tell_fetch(FetchMessage::DetectStoryImages {
            story_id,
            story_url: url.to_owned(),
            image_urls,
        })
        .await;
    }
}

/// Probe every image url concurrently under one batch deadline inherited
/// from the message expiry. Urls on the referer-deny list are reported
/// without a request; probes that outlive the deadline are reported with a
/// synthetic timeout status. One result per url, always.
pub async fn detect_story_images(
    reader: &FeedReader,
    bus: &Bus,
    story_id: i64,
    story_url: String,
    image_urls: BTreeSet<String>,
    expire_at: Option<DateTime<Utc>>,
) {
    let now = Utc::now();
    let deadline = expire_at.unwrap_or(now + Duration::seconds(DEFAULT_PROBE_SECONDS));
    let budget = (deadline - now).to_std().unwrap_or_default();

    tracing::info!(
        "detect story images story_id={} num_images={} begin",
        story_id,
        image_urls.len()
    );
    let t_begin = Instant::now();
    let images = join_all(
        image_urls
            .iter()
            .map(|url| probe_one(reader, url, budget)),
    )
    .await;
    let cost_ms = t_begin.elapsed().as_millis();

    let num_ok = images.iter().filter(|i| i.status == 200).count();
    tracing::info!(
        "detect story images story_id={} num_images={} finished, ok={} error={} cost={}ms",
        story_id,
        images.len(),
        num_ok,
        images.len() - num_ok,
        cost_ms
    );

    bus.tell_state(StateMessage::UpdateStoryImages {
        story_id,
        story_url,
        images,
    })
    .await;
}

async fn probe_one(reader: &FeedReader, url: &str, budget: std::time::Duration) -> ImageStatus {
    if REFERER_DENY.is_match(url) {
        return ImageStatus {
            url: url.to_owned(),
            status: STATUS_REFERER_DENY,
        };
    }
    let status = match tokio::time::timeout(budget, reader.probe_image(url, IMAGE_PROBE_REFERER))
        .await
    {
        Ok(status) => status,
        Err(_) => STATUS_TIMEOUT,
    };
    ImageStatus {
        url: url.to_owned(),
        status,
    }
}
