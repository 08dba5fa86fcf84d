use std::collections::HashMap;

use chrono::{Duration, Utc};
use rand::Rng;
use sqlx::SqlitePool;

use crate::actors::{FetchMessage, ImageStatus, StateMessage};
use crate::domain::heuristics::{is_feed_need_fetch_storys, is_fulltext_story};
use crate::domain::image::{proxy_image_url, rewrite_story_images, story_image_urls, IMAGE_REFERER_DENY_STATUS};
use crate::domain::models::{Feed, FeedCreation, FeedStatus, Story, FEED_URL_NOT_FOUND};
use crate::domain::payload::FeedPayload;
use crate::domain::text::html_to_text;
use crate::infrastructure::bus::Bus;
use crate::infrastructure::repository;

/// Story html shorter than this (as text) gets an image probe even on a
/// regular sync; longer storys only on an explicit refresh.
const IMAGE_PROBE_TEXT_LEN: usize = 1000;

pub async fn handle_message(
    pool: &SqlitePool,
    bus: &Bus,
    message: StateMessage,
) -> anyhow::Result<()> {
    match message {
        StateMessage::UpdateFeedCreationStatus {
            feed_creation_id,
            status,
        } => update_feed_creation_status(pool, feed_creation_id, status).await,
        StateMessage::SaveFeedCreationResult {
            feed_creation_id,
            messages,
            feed,
        } => save_feed_creation_result(pool, bus, feed_creation_id, messages, feed).await,
        StateMessage::UpdateFeed {
            feed_id,
            feed,
            is_refresh,
        } => update_feed(pool, bus, feed_id, feed, is_refresh).await,
        StateMessage::UpdateStory {
            story_id,
            content,
            summary,
            url,
        } => update_story(pool, story_id, &content, &summary, &url).await,
        StateMessage::UpdateStoryImages {
            story_id,
            story_url,
            images,
        } => update_story_images(pool, story_id, &story_url, &images).await,
    }
}

/// Record a new creation request and kick off discovery for it. This is
/// the entry point a subscription API calls when a user adds a url.
pub async fn submit_feed_creation(
    pool: &SqlitePool,
    bus: &Bus,
    user_id: i64,
    url: &str,
    is_from_bookmark: bool,
) -> anyhow::Result<FeedCreation> {
    let mut conn = pool.acquire().await?;
    let creation =
        repository::create_feed_creation(&mut conn, user_id, url, is_from_bookmark, Utc::now())
            .await?;
    drop(conn);
    bus.tell_fetch(FetchMessage::FindFeed {
        feed_creation_id: creation.id,
        url: url.to_owned(),
    })
    .await;
    Ok(creation)
}

pub async fn update_feed_creation_status(
    pool: &SqlitePool,
    feed_creation_id: i64,
    status: FeedStatus,
) -> anyhow::Result<()> {
    let mut conn = pool.acquire().await?;
    repository::update_feed_creation_status(&mut conn, feed_creation_id, status, Utc::now())
        .await?;
    Ok(())
}

/// Close out a discovery run: link or create the feed on success, record
/// the failure otherwise. Already-READY creations are a no-op so redelivery
/// is harmless.
pub async fn save_feed_creation_result(
    pool: &SqlitePool,
    bus: &Bus,
    feed_creation_id: i64,
    messages: Vec<String>,
    feed_payload: Option<FeedPayload>,
) -> anyhow::Result<()> {
    let payload = match feed_payload.map(FeedPayload::validate).transpose() {
        Ok(payload) => payload,
        Err(err) => {
            tracing::warn!(
                "reject invalid feed payload for feed creation {}: {}",
                feed_creation_id,
                err
            );
            return Ok(());
        }
    };

    let now = Utc::now();
    let mut tx = pool.begin().await?;
    let Some(mut creation) = repository::get_feed_creation_by_id(&mut tx, feed_creation_id).await?
    else {
        tracing::warn!("feed creation {} not exists", feed_creation_id);
        return Ok(());
    };
    if creation.status == FeedStatus::Ready {
        tracing::info!("feed creation {} is ready", feed_creation_id);
        return Ok(());
    }
    creation.message = Some(messages.join("\n\n"));
    creation.dt_updated = now;

    let Some(payload) = payload else {
        creation.status = FeedStatus::Error;
        repository::save_feed_creation(&mut tx, &creation).await?;
        repository::insert_feed_url_map(&mut tx, &creation.url, FEED_URL_NOT_FOUND, now).await?;
        tx.commit().await?;
        return Ok(());
    };

    let feed = match repository::get_feed_by_url(&mut tx, &payload.url).await? {
        Some(feed) => feed,
        None => {
            repository::create_feed(&mut tx, &payload.url, FeedStatus::Ready, Some(now), now)
                .await?
        }
    };
    creation.status = FeedStatus::Ready;
    creation.feed_id = Some(feed.id);
    repository::save_feed_creation(&mut tx, &creation).await?;

    match repository::get_user_feed(&mut tx, creation.user_id, feed.id).await? {
        Some(user_feed) => {
            tracing::info!(
                "user feed#{} user_id={} feed_id={} already exists",
                user_feed.id,
                creation.user_id,
                feed.id
            );
        }
        None => {
            repository::create_user_feed(
                &mut tx,
                creation.user_id,
                feed.id,
                creation.is_from_bookmark,
                now,
            )
            .await?;
        }
    }

    repository::insert_feed_url_map(&mut tx, &creation.url, &feed.url, now).await?;
    if feed.url != creation.url {
        // Self-mapping marks the canonical url
        repository::insert_feed_url_map(&mut tx, &feed.url, &feed.url, now).await?;
    }
    tx.commit().await?;

    bus.hope_state(
        StateMessage::UpdateFeed {
            feed_id: feed.id,
            feed: payload,
            is_refresh: false,
        },
        None,
    );
    Ok(())
}

/// Apply a fetched feed to the stored record and bulk-save its storys,
/// then decide per modified story whether to fetch its webpage or probe
/// its images.
///
/// When the canonical url moved onto another existing feed, this feed is
/// merged into it instead and nothing else happens.
pub async fn update_feed(
    pool: &SqlitePool,
    bus: &Bus,
    feed_id: i64,
    feed_payload: FeedPayload,
    is_refresh: bool,
) -> anyhow::Result<()> {
    let payload = match feed_payload.validate() {
        Ok(payload) => payload,
        Err(err) => {
            tracing::warn!("reject invalid feed payload for feed#{}: {}", feed_id, err);
            return Ok(());
        }
    };

    let now = Utc::now();
    let mut tx = pool.begin().await?;
    let Some(mut feed) = repository::get_feed_by_id(&mut tx, feed_id).await? else {
        tracing::warn!("feed#{} not exists", feed_id);
        return Ok(());
    };

    if feed.url != payload.url {
        if let Some(target) = repository::get_feed_by_url(&mut tx, &payload.url).await? {
            tracing::info!(
                "merge feed#{} url={} into feed#{} url={}",
                feed.id,
                feed.url,
                target.id,
                target.url
            );
            repository::merge_feeds(&mut tx, target.id, feed.id).await?;
            tx.commit().await?;
            return Ok(());
        }
    }

    apply_payload(&mut feed, &payload);
    if feed.dt_updated.is_none() {
        feed.dt_updated = Some(now);
    }
    feed.dt_checked = Some(now);
    feed.dt_synced = Some(now);
    feed.status = FeedStatus::Ready;
    repository::save_feed(&mut tx, &feed).await?;

    let mut storys = payload.storys;
    for story in &mut storys {
        story.dt_published.get_or_insert(now);
        story.dt_updated.get_or_insert(now);
    }
    let (modified_storys, num_reallocate) =
        repository::bulk_save_storys_by_feed(&mut tx, &mut feed, &storys).await?;
    tx.commit().await?;

    tracing::info!(
        "feed#{} save storys total={} num_modified={} num_reallocate={}",
        feed.id,
        storys.len(),
        modified_storys.len(),
        num_reallocate
    );

    let need_fetch_story = is_feed_need_fetch_storys(&feed.url);
    for story in &modified_storys {
        let Some(link) = &story.link else {
            continue;
        };
        let fulltext = is_fulltext_story(
            &feed.monthly_story_count.0,
            story.content.as_deref(),
            Some(story.dt_published),
        );
        if need_fetch_story && !fulltext {
            bus.tell_fetch(FetchMessage::FetchStory {
                story_id: story.id,
                url: link.clone(),
            })
            .await;
        } else {
            queue_story_image_probe(bus, story, link, is_refresh);
        }
    }
    Ok(())
}

/// Queue an image probe for a story whose html is short (or on refresh,
/// unconditionally) and actually references images.
fn queue_story_image_probe(bus: &Bus, story: &Story, link: &str, is_refresh: bool) {
    let content = story.content.as_deref().unwrap_or("");
    if !is_refresh && html_to_text(content).chars().count() >= IMAGE_PROBE_TEXT_LEN {
        return;
    }
    let image_urls = story_image_urls(content);
    tracing::info!(
        "story#{} {} has {} images",
        story.id,
        link,
        image_urls.len()
    );
    if !image_urls.is_empty() {
        bus.hope_fetch(
            FetchMessage::DetectStoryImages {
                story_id: story.id,
                story_url: link.to_owned(),
                image_urls,
            },
            None,
        );
    }
}

/// Persist readability-extracted content for one story.
pub async fn update_story(
    pool: &SqlitePool,
    story_id: i64,
    content: &str,
    summary: &str,
    url: &str,
) -> anyhow::Result<()> {
    let mut conn = pool.acquire().await?;
    let updated =
        repository::update_story_content(&mut conn, story_id, content, summary, url, Utc::now())
            .await?;
    if !updated {
        tracing::warn!("story#{} not exists", story_id);
    }
    Ok(())
}

/// Rewrite referer-denied image urls in a story's html to their proxied
/// form and persist the result.
pub async fn update_story_images(
    pool: &SqlitePool,
    story_id: i64,
    story_url: &str,
    images: &[ImageStatus],
) -> anyhow::Result<()> {
    let mut replaces = HashMap::new();
    for image in images {
        if IMAGE_REFERER_DENY_STATUS.contains(&image.status) {
            replaces.insert(image.url.clone(), proxy_image_url(&image.url, story_url));
        }
    }
    tracing::info!(
        "story#{} {} has {} referer deny images",
        story_id,
        story_url,
        replaces.len()
    );
    if replaces.is_empty() {
        return Ok(());
    }

    let mut tx = pool.begin().await?;
    let Some(story) = repository::get_story_by_id(&mut tx, story_id).await? else {
        tracing::warn!("story#{} not exists", story_id);
        return Ok(());
    };
    let content = story.content.unwrap_or_default();
    let rewritten = rewrite_story_images(&content, &replaces);
    repository::update_story_html(&mut tx, story_id, &rewritten, Utc::now()).await?;
    tx.commit().await?;
    Ok(())
}

/// Periodic sweep: queue a sync for every feed not checked within the
/// jittered window, each with a deadline so unprocessed work drops before
/// the next tick instead of piling up.
pub async fn check_feed(
    pool: &SqlitePool,
    bus: &Bus,
    check_feed_seconds: u64,
) -> anyhow::Result<()> {
    let now = Utc::now();
    let rand_sec = rand::thread_rng().gen::<f64>() * check_feed_seconds as f64 / 10.0;
    let outdate_seconds = check_feed_seconds as f64 + rand_sec;
    let feeds = repository::take_outdated_feeds(pool, outdate_seconds, now).await?;
    let expire_at = now + Duration::milliseconds((outdate_seconds * 1000.0) as i64);
    tracing::info!("found {} feeds need sync", feeds.len());
    for feed in feeds {
        bus.hope_fetch(
            FetchMessage::SyncFeed {
                feed_id: feed.feed_id,
                url: feed.url,
                content_hash_base64: feed.content_hash_base64,
                etag: feed.etag,
                last_modified: feed.last_modified,
            },
            Some(expire_at),
        );
    }
    Ok(())
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct CleanFeedCreationStats {
    pub num_deleted: u64,
    pub num_retry_updating: usize,
    pub num_retry_pending: usize,
}

/// Janitor for creation requests: drop finished rows after a day, and
/// re-run discovery for rows stuck mid-flight.
pub async fn clean_feed_creation(
    pool: &SqlitePool,
    bus: &Bus,
) -> anyhow::Result<CleanFeedCreationStats> {
    let now = Utc::now();

    let num_deleted =
        repository::delete_terminal_feed_creations(pool, now - Duration::hours(24)).await?;
    tracing::info!("delete {} old feed creations", num_deleted);

    let updating = repository::query_stuck_feed_creations(
        pool,
        FeedStatus::Updating,
        now - Duration::minutes(30),
    )
    .await?;
    tracing::info!("retry {} updating feed creations", updating.len());
    retry_feed_creations(pool, bus, &updating).await?;

    let pending = repository::query_stuck_feed_creations(
        pool,
        FeedStatus::Pending,
        now - Duration::minutes(60),
    )
    .await?;
    tracing::info!("retry {} pending feed creations", pending.len());
    retry_feed_creations(pool, bus, &pending).await?;

    Ok(CleanFeedCreationStats {
        num_deleted,
        num_retry_updating: updating.len(),
        num_retry_pending: pending.len(),
    })
}

async fn retry_feed_creations(
    pool: &SqlitePool,
    bus: &Bus,
    id_urls: &[(i64, String)],
) -> anyhow::Result<()> {
    let now = Utc::now();
    let ids: Vec<i64> = id_urls.iter().map(|(id, _)| *id).collect();
    repository::bulk_set_feed_creations_pending(pool, &ids, now).await?;
    let expire_at = now + Duration::hours(1);
    for (feed_creation_id, url) in id_urls {
        bus.hope_fetch(
            FetchMessage::FindFeed {
                feed_creation_id: *feed_creation_id,
                url: url.clone(),
            },
            Some(expire_at),
        );
    }
    Ok(())
}

/// Copy the non-empty payload fields onto the stored feed. Absent optional
/// fields keep their stored value; validation already turned empty strings
/// into `None`.
fn apply_payload(feed: &mut Feed, payload: &FeedPayload) {
    feed.url = payload.url.clone();
    feed.title = Some(payload.title.clone());
    feed.content_hash_base64 = Some(payload.content_hash_base64.clone());
    if let Some(link) = &payload.link {
        feed.link = Some(link.clone());
    }
    if let Some(author) = &payload.author {
        feed.author = Some(author.clone());
    }
    if let Some(icon) = &payload.icon {
        feed.icon = Some(icon.clone());
    }
    if let Some(description) = &payload.description {
        feed.description = Some(description.clone());
    }
    if let Some(version) = &payload.version {
        feed.version = Some(version.clone());
    }
    if let Some(encoding) = &payload.encoding {
        feed.encoding = Some(encoding.clone());
    }
    if let Some(etag) = &payload.etag {
        feed.etag = Some(etag.clone());
    }
    if let Some(last_modified) = &payload.last_modified {
        feed.last_modified = Some(last_modified.clone());
    }
    if let Some(dt_updated) = payload.dt_updated {
        feed.dt_updated = Some(dt_updated);
    }
}
