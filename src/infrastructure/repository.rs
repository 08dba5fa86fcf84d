use chrono::{DateTime, Utc};
use sqlx::{Error as SqlxError, SqliteConnection, SqlitePool};

use crate::domain::models::{
    story_id, Feed, FeedCreation, FeedStatus, FeedUrlMap, Story, UserFeed,
};
use crate::domain::monthly::month_id_of_datetime;
use crate::domain::payload::StoryPayload;

// Feed operations

pub async fn create_feed(
    conn: &mut SqliteConnection,
    url: &str,
    status: FeedStatus,
    dt_updated: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<Feed, SqlxError> {
    let feed = sqlx::query_as::<_, Feed>(
        r#"
        INSERT INTO feeds (url, status, dt_updated, dt_created)
        VALUES (?, ?, ?, ?)
        RETURNING *
        "#,
    )
    .bind(url)
    .bind(status)
    .bind(dt_updated)
    .bind(now)
    .fetch_one(conn)
    .await?;

    Ok(feed)
}

pub async fn get_feed_by_id(
    conn: &mut SqliteConnection,
    feed_id: i64,
) -> Result<Option<Feed>, SqlxError> {
    sqlx::query_as::<_, Feed>("SELECT * FROM feeds WHERE id = ?")
        .bind(feed_id)
        .fetch_optional(conn)
        .await
}

pub async fn get_feed_by_url(
    conn: &mut SqliteConnection,
    url: &str,
) -> Result<Option<Feed>, SqlxError> {
    sqlx::query_as::<_, Feed>("SELECT * FROM feeds WHERE url = ?")
        .bind(url)
        .fetch_optional(conn)
        .await
}

/// Persist every mutable column of a feed row.
pub async fn save_feed(conn: &mut SqliteConnection, feed: &Feed) -> Result<(), SqlxError> {
    sqlx::query(
        r#"
        UPDATE feeds
        SET url = ?,
            title = ?,
            link = ?,
            author = ?,
            icon = ?,
            description = ?,
            version = ?,
            encoding = ?,
            etag = ?,
            last_modified = ?,
            content_hash_base64 = ?,
            status = ?,
            monthly_story_count = ?,
            dt_updated = ?,
            dt_checked = ?,
            dt_synced = ?
        WHERE id = ?
        "#,
    )
    .bind(&feed.url)
    .bind(&feed.title)
    .bind(&feed.link)
    .bind(&feed.author)
    .bind(&feed.icon)
    .bind(&feed.description)
    .bind(&feed.version)
    .bind(&feed.encoding)
    .bind(&feed.etag)
    .bind(&feed.last_modified)
    .bind(&feed.content_hash_base64)
    .bind(feed.status)
    .bind(&feed.monthly_story_count)
    .bind(feed.dt_updated)
    .bind(feed.dt_checked)
    .bind(feed.dt_synced)
    .bind(feed.id)
    .execute(conn)
    .await?;

    Ok(())
}

/// A feed due for a sync sweep, with the conditional-request state the
/// fetch side needs.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OutdatedFeed {
    pub feed_id: i64,
    pub url: String,
    pub content_hash_base64: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

pub async fn take_outdated_feeds(
    pool: &SqlitePool,
    outdate_seconds: f64,
    now: DateTime<Utc>,
) -> Result<Vec<OutdatedFeed>, SqlxError> {
    let cutoff = now - chrono::Duration::milliseconds((outdate_seconds * 1000.0) as i64);
    sqlx::query_as::<_, OutdatedFeed>(
        r#"
        SELECT id AS feed_id, url, content_hash_base64, etag, last_modified
        FROM feeds
        WHERE dt_checked IS NULL OR dt_checked < ?
        ORDER BY dt_checked ASC NULLS FIRST
        "#,
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await
}

// Story operations

pub async fn get_story_by_id(
    conn: &mut SqliteConnection,
    story_id: i64,
) -> Result<Option<Story>, SqlxError> {
    sqlx::query_as::<_, Story>("SELECT * FROM storys WHERE id = ?")
        .bind(story_id)
        .fetch_optional(conn)
        .await
}

pub async fn list_storys_by_feed(
    conn: &mut SqliteConnection,
    feed_id: i64,
) -> Result<Vec<Story>, SqlxError> {
    sqlx::query_as::<_, Story>(
        r#"SELECT * FROM storys WHERE feed_id = ? ORDER BY "offset" ASC"#,
    )
    .bind(feed_id)
    .fetch_all(conn)
    .await
}

async fn get_story_by_unique_id(
    conn: &mut SqliteConnection,
    feed_id: i64,
    unique_id: &str,
) -> Result<Option<Story>, SqlxError> {
    sqlx::query_as::<_, Story>("SELECT * FROM storys WHERE feed_id = ? AND unique_id = ?")
        .bind(feed_id)
        .bind(unique_id)
        .fetch_optional(conn)
        .await
}

async fn next_story_offset(
    conn: &mut SqliteConnection,
    feed_id: i64,
) -> Result<i64, SqlxError> {
    let next: (i64,) =
        sqlx::query_as(r#"SELECT COALESCE(MAX("offset") + 1, 0) FROM storys WHERE feed_id = ?"#)
            .bind(feed_id)
            .fetch_one(conn)
            .await?;
    Ok(next.0)
}

async fn insert_story(
    conn: &mut SqliteConnection,
    feed_id: i64,
    offset: i64,
    story: &StoryPayload,
) -> Result<Story, SqlxError> {
    sqlx::query_as::<_, Story>(
        r#"
        INSERT INTO storys
            (id, feed_id, "offset", unique_id, title, link, author, content,
             summary, content_hash_base64, dt_published, dt_updated)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        RETURNING *
        "#,
    )
    .bind(story_id(feed_id, offset))
    .bind(feed_id)
    .bind(offset)
    .bind(&story.unique_id)
    .bind(&story.title)
    .bind(&story.link)
    .bind(&story.author)
    .bind(&story.content)
    .bind(&story.summary)
    .bind(&story.content_hash_base64)
    .bind(story.dt_published)
    .bind(story.dt_updated)
    .fetch_one(conn)
    .await
}

/// Upsert a feed's storys in one transaction-scoped call.
///
/// Keyed by `(feed_id, unique_id)`: new storys are inserted with the next
/// per-feed offset, storys whose content hash changed are updated, and
/// unchanged storys are skipped and not returned. The feed's
/// `monthly_story_count` buckets are maintained as a side effect; the
/// second return value counts storys whose monthly bucket moved.
pub async fn bulk_save_storys_by_feed(
    conn: &mut SqliteConnection,
    feed: &mut Feed,
    storys: &[StoryPayload],
) -> Result<(Vec<Story>, usize), SqlxError> {
    let mut modified = Vec::new();
    let mut num_reallocate = 0usize;
    let feed_id = feed.id;
    let mut next_offset = next_story_offset(conn, feed_id).await?;

    for story in storys {
        debug_assert!(story.dt_published.is_some() && story.dt_updated.is_some());
        let existing = get_story_by_unique_id(conn, feed_id, &story.unique_id).await?;
        match existing {
            None => {
                let saved = insert_story(conn, feed_id, next_offset, story).await?;
                next_offset += 1;
                feed.monthly_story_count
                    .0
                    .incr(month_id_of_datetime(saved.dt_published));
                modified.push(saved);
            }
            Some(old) if old.content_hash_base64 != story.content_hash_base64 => {
                let saved = sqlx::query_as::<_, Story>(
                    r#"
                    UPDATE storys
                    SET title = ?, link = ?, author = ?, content = ?, summary = ?,
                        content_hash_base64 = ?, dt_published = ?, dt_updated = ?
                    WHERE id = ?
                    RETURNING *
                    "#,
                )
                .bind(&story.title)
                .bind(&story.link)
                .bind(&story.author)
                .bind(&story.content)
                .bind(&story.summary)
                .bind(&story.content_hash_base64)
                .bind(story.dt_published)
                .bind(story.dt_updated)
                .bind(old.id)
                .fetch_one(&mut *conn)
                .await?;

                let old_month = month_id_of_datetime(old.dt_published);
                let new_month = month_id_of_datetime(saved.dt_published);
                if old_month != new_month {
                    feed.monthly_story_count.0.decr(old_month);
                    feed.monthly_story_count.0.incr(new_month);
                    num_reallocate += 1;
                }
                modified.push(saved);
            }
            Some(_) => {}
        }
    }

    sqlx::query("UPDATE feeds SET monthly_story_count = ? WHERE id = ?")
        .bind(&feed.monthly_story_count)
        .bind(feed.id)
        .execute(conn)
        .await?;

    Ok((modified, num_reallocate))
}

/// Persist readability-extracted content for one story.
pub async fn update_story_content(
    conn: &mut SqliteConnection,
    story_id: i64,
    content: &str,
    summary: &str,
    link: &str,
    now: DateTime<Utc>,
) -> Result<bool, SqlxError> {
    let result = sqlx::query(
        r#"
        UPDATE storys
        SET content = ?, summary = ?, link = ?, dt_updated = ?
        WHERE id = ?
        "#,
    )
    .bind(content)
    .bind(summary)
    .bind(link)
    .bind(now)
    .bind(story_id)
    .execute(conn)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Overwrite a story's html after image rewriting. The stored content hash
/// is left alone so the next feed sync still sees the story as unchanged.
pub async fn update_story_html(
    conn: &mut SqliteConnection,
    story_id: i64,
    content: &str,
    now: DateTime<Utc>,
) -> Result<bool, SqlxError> {
    let result = sqlx::query("UPDATE storys SET content = ?, dt_updated = ? WHERE id = ?")
        .bind(content)
        .bind(now)
        .bind(story_id)
        .execute(conn)
        .await?;

    Ok(result.rows_affected() > 0)
}

/// Fold `source` into `target` after a canonical-url collision: target
/// gains source's storys (minus unique-id duplicates) and user feeds, and
/// the source feed row is destroyed.
pub async fn merge_feeds(
    conn: &mut SqliteConnection,
    target_id: i64,
    source_id: i64,
) -> Result<(), SqlxError> {
    let mut target = get_feed_by_id(conn, target_id)
        .await?
        .ok_or(SqlxError::RowNotFound)?;

    let mut next_offset = next_story_offset(conn, target.id).await?;
    let source_storys = list_storys_by_feed(conn, source_id).await?;
    for story in source_storys {
        let existing = get_story_by_unique_id(conn, target.id, &story.unique_id).await?;
        if existing.is_some() {
            continue;
        }
        sqlx::query(
            r#"
            INSERT INTO storys
                (id, feed_id, "offset", unique_id, title, link, author, content,
                 summary, content_hash_base64, dt_published, dt_updated)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(story_id(target.id, next_offset))
        .bind(target.id)
        .bind(next_offset)
        .bind(&story.unique_id)
        .bind(&story.title)
        .bind(&story.link)
        .bind(&story.author)
        .bind(&story.content)
        .bind(&story.summary)
        .bind(&story.content_hash_base64)
        .bind(story.dt_published)
        .bind(story.dt_updated)
        .execute(&mut *conn)
        .await?;
        next_offset += 1;
        target
            .monthly_story_count
            .0
            .incr(month_id_of_datetime(story.dt_published));
    }

    sqlx::query("UPDATE feeds SET monthly_story_count = ? WHERE id = ?")
        .bind(&target.monthly_story_count)
        .bind(target.id)
        .execute(&mut *conn)
        .await?;

    // Re-point subscriptions; a user subscribed to both keeps the target row
    sqlx::query("UPDATE OR IGNORE user_feeds SET feed_id = ? WHERE feed_id = ?")
        .bind(target.id)
        .bind(source_id)
        .execute(&mut *conn)
        .await?;

    // Source row cascades its remaining storys and user feeds
    sqlx::query("DELETE FROM feeds WHERE id = ?")
        .bind(source_id)
        .execute(conn)
        .await?;

    Ok(())
}

// FeedCreation operations

pub async fn create_feed_creation(
    conn: &mut SqliteConnection,
    user_id: i64,
    url: &str,
    is_from_bookmark: bool,
    now: DateTime<Utc>,
) -> Result<FeedCreation, SqlxError> {
    sqlx::query_as::<_, FeedCreation>(
        r#"
        INSERT INTO feed_creations (user_id, url, is_from_bookmark, status, dt_created, dt_updated)
        VALUES (?, ?, ?, ?, ?, ?)
        RETURNING *
        "#,
    )
    .bind(user_id)
    .bind(url)
    .bind(is_from_bookmark)
    .bind(FeedStatus::Pending)
    .bind(now)
    .bind(now)
    .fetch_one(conn)
    .await
}

pub async fn get_feed_creation_by_id(
    conn: &mut SqliteConnection,
    feed_creation_id: i64,
) -> Result<Option<FeedCreation>, SqlxError> {
    sqlx::query_as::<_, FeedCreation>("SELECT * FROM feed_creations WHERE id = ?")
        .bind(feed_creation_id)
        .fetch_optional(conn)
        .await
}

pub async fn update_feed_creation_status(
    conn: &mut SqliteConnection,
    feed_creation_id: i64,
    status: FeedStatus,
    now: DateTime<Utc>,
) -> Result<(), SqlxError> {
    sqlx::query("UPDATE feed_creations SET status = ?, dt_updated = ? WHERE id = ?")
        .bind(status)
        .bind(now)
        .bind(feed_creation_id)
        .execute(conn)
        .await?;

    Ok(())
}

pub async fn save_feed_creation(
    conn: &mut SqliteConnection,
    creation: &FeedCreation,
) -> Result<(), SqlxError> {
    sqlx::query(
        r#"
        UPDATE feed_creations
        SET status = ?, message = ?, feed_id = ?, dt_updated = ?
        WHERE id = ?
        "#,
    )
    .bind(creation.status)
    .bind(&creation.message)
    .bind(creation.feed_id)
    .bind(creation.dt_updated)
    .bind(creation.id)
    .execute(conn)
    .await?;

    Ok(())
}

/// Garbage-collect terminal creation rows created before `cutoff`.
pub async fn delete_terminal_feed_creations(
    pool: &SqlitePool,
    cutoff: DateTime<Utc>,
) -> Result<u64, SqlxError> {
    let result = sqlx::query(
        "DELETE FROM feed_creations WHERE status IN (?, ?) AND dt_created < ?",
    )
    .bind(FeedStatus::Ready)
    .bind(FeedStatus::Error)
    .bind(cutoff)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Creation rows stuck in `status` since before `cutoff`, as `(id, url)`.
pub async fn query_stuck_feed_creations(
    pool: &SqlitePool,
    status: FeedStatus,
    cutoff: DateTime<Utc>,
) -> Result<Vec<(i64, String)>, SqlxError> {
    sqlx::query_as::<_, (i64, String)>(
        "SELECT id, url FROM feed_creations WHERE status = ? AND dt_updated < ?",
    )
    .bind(status)
    .bind(cutoff)
    .fetch_all(pool)
    .await
}

pub async fn bulk_set_feed_creations_pending(
    pool: &SqlitePool,
    ids: &[i64],
    now: DateTime<Utc>,
) -> Result<(), SqlxError> {
    for id in ids {
        sqlx::query("UPDATE feed_creations SET status = ?, dt_updated = ? WHERE id = ?")
            .bind(FeedStatus::Pending)
            .bind(now)
            .bind(id)
            .execute(pool)
            .await?;
    }
    Ok(())
}

// UserFeed operations

pub async fn get_user_feed(
    conn: &mut SqliteConnection,
    user_id: i64,
    feed_id: i64,
) -> Result<Option<UserFeed>, SqlxError> {
    sqlx::query_as::<_, UserFeed>("SELECT * FROM user_feeds WHERE user_id = ? AND feed_id = ?")
        .bind(user_id)
        .bind(feed_id)
        .fetch_optional(conn)
        .await
}

pub async fn create_user_feed(
    conn: &mut SqliteConnection,
    user_id: i64,
    feed_id: i64,
    is_from_bookmark: bool,
    now: DateTime<Utc>,
) -> Result<UserFeed, SqlxError> {
    sqlx::query_as::<_, UserFeed>(
        r#"
        INSERT INTO user_feeds (user_id, feed_id, is_from_bookmark, dt_created)
        VALUES (?, ?, ?, ?)
        RETURNING *
        "#,
    )
    .bind(user_id)
    .bind(feed_id)
    .bind(is_from_bookmark)
    .bind(now)
    .fetch_one(conn)
    .await
}

// FeedUrlMap operations

pub async fn insert_feed_url_map(
    conn: &mut SqliteConnection,
    source: &str,
    target: &str,
    now: DateTime<Utc>,
) -> Result<(), SqlxError> {
    sqlx::query("INSERT INTO feed_url_maps (source, target, dt_created) VALUES (?, ?, ?)")
        .bind(source)
        .bind(target)
        .bind(now)
        .execute(conn)
        .await?;

    Ok(())
}

/// Latest recorded resolution for `source`, if any.
pub async fn get_feed_url_map_target(
    conn: &mut SqliteConnection,
    source: &str,
) -> Result<Option<String>, SqlxError> {
    let row: Option<FeedUrlMap> = sqlx::query_as(
        "SELECT * FROM feed_url_maps WHERE source = ? ORDER BY id DESC LIMIT 1",
    )
    .bind(source)
    .fetch_optional(conn)
    .await?;

    Ok(row.map(|m| m.target))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::unpack_story_id;
    use chrono::TimeZone;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_test_db() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory database");

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .expect("Failed to run migrations");

        pool
    }

    fn story_payload(unique_id: &str, content: &str, dt: DateTime<Utc>) -> StoryPayload {
        StoryPayload {
            unique_id: unique_id.to_owned(),
            title: format!("Title {unique_id}"),
            content_hash_base64: crate::domain::hash::compute_hash_base64(&[content]),
            author: None,
            link: Some(format!("https://example.com/{unique_id}")),
            summary: None,
            content: Some(content.to_owned()),
            dt_published: Some(dt),
            dt_updated: Some(dt),
        }
    }

    fn dt(year: i32, month: u32, day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, month, day, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_create_and_get_feed() {
        let pool = setup_test_db().await;
        let mut conn = pool.acquire().await.unwrap();
        let now = Utc::now();

        let feed = create_feed(
            &mut conn,
            "https://example.com/feed",
            FeedStatus::Ready,
            Some(now),
            now,
        )
        .await
        .unwrap();

        assert_eq!(feed.url, "https://example.com/feed");
        assert_eq!(feed.status, FeedStatus::Ready);
        assert!(feed.monthly_story_count.0.is_empty());

        let by_url = get_feed_by_url(&mut conn, "https://example.com/feed")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_url.id, feed.id);

        let missing = get_feed_by_url(&mut conn, "https://example.com/other")
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_feed_url_is_unique() {
        let pool = setup_test_db().await;
        let mut conn = pool.acquire().await.unwrap();
        let now = Utc::now();

        create_feed(&mut conn, "https://a/rss", FeedStatus::Ready, None, now)
            .await
            .unwrap();
        let dup = create_feed(&mut conn, "https://a/rss", FeedStatus::Ready, None, now).await;
        assert!(dup.is_err());
    }

    #[tokio::test]
    async fn test_bulk_save_inserts_with_monotone_offsets() {
        let pool = setup_test_db().await;
        let mut conn = pool.acquire().await.unwrap();
        let now = Utc::now();
        let mut feed = create_feed(&mut conn, "https://a/rss", FeedStatus::Ready, None, now)
            .await
            .unwrap();

        let storys = vec![
            story_payload("s1", "content one", dt(2024, 1, 1)),
            story_payload("s2", "content two", dt(2024, 1, 2)),
            story_payload("s3", "content three", dt(2024, 2, 1)),
        ];
        let (modified, num_reallocate) = bulk_save_storys_by_feed(&mut conn, &mut feed, &storys)
            .await
            .unwrap();

        assert_eq!(modified.len(), 3);
        assert_eq!(num_reallocate, 0);
        for (i, story) in modified.iter().enumerate() {
            assert_eq!(story.offset, i as i64);
            assert_eq!(unpack_story_id(story.id), (feed.id, i as i64));
        }
        assert_eq!(feed.monthly_story_count.0.get(2024, 1), 2);
        assert_eq!(feed.monthly_story_count.0.get(2024, 2), 1);

        // The count map is persisted on the feed row
        let reloaded = get_feed_by_id(&mut conn, feed.id).await.unwrap().unwrap();
        assert_eq!(reloaded.monthly_story_count.0.get(2024, 1), 2);
    }

    #[tokio::test]
    async fn test_bulk_save_skips_unchanged_and_updates_changed() {
        let pool = setup_test_db().await;
        let mut conn = pool.acquire().await.unwrap();
        let now = Utc::now();
        let mut feed = create_feed(&mut conn, "https://a/rss", FeedStatus::Ready, None, now)
            .await
            .unwrap();

        let first = vec![story_payload("s1", "original", dt(2024, 1, 1))];
        let (modified, _) = bulk_save_storys_by_feed(&mut conn, &mut feed, &first)
            .await
            .unwrap();
        assert_eq!(modified.len(), 1);
        let original_id = modified[0].id;

        // Same hash: skipped
        let (modified, _) = bulk_save_storys_by_feed(&mut conn, &mut feed, &first)
            .await
            .unwrap();
        assert!(modified.is_empty());

        // Changed content: updated in place, same id and offset
        let second = vec![story_payload("s1", "rewritten", dt(2024, 1, 1))];
        let (modified, num_reallocate) = bulk_save_storys_by_feed(&mut conn, &mut feed, &second)
            .await
            .unwrap();
        assert_eq!(modified.len(), 1);
        assert_eq!(modified[0].id, original_id);
        assert_eq!(modified[0].content.as_deref(), Some("rewritten"));
        assert_eq!(num_reallocate, 0);
        assert_eq!(feed.monthly_story_count.0.get(2024, 1), 1);
    }

    #[tokio::test]
    async fn test_bulk_save_reallocates_monthly_bucket() {
        let pool = setup_test_db().await;
        let mut conn = pool.acquire().await.unwrap();
        let now = Utc::now();
        let mut feed = create_feed(&mut conn, "https://a/rss", FeedStatus::Ready, None, now)
            .await
            .unwrap();

        let first = vec![story_payload("s1", "original", dt(2024, 1, 15))];
        bulk_save_storys_by_feed(&mut conn, &mut feed, &first)
            .await
            .unwrap();

        // Publisher corrected the date into another month
        let second = vec![story_payload("s1", "corrected", dt(2024, 2, 15))];
        let (modified, num_reallocate) = bulk_save_storys_by_feed(&mut conn, &mut feed, &second)
            .await
            .unwrap();

        assert_eq!(modified.len(), 1);
        assert_eq!(num_reallocate, 1);
        assert_eq!(feed.monthly_story_count.0.get(2024, 1), 0);
        assert_eq!(feed.monthly_story_count.0.get(2024, 2), 1);
    }

    #[tokio::test]
    async fn test_merge_feeds_moves_storys_and_user_feeds() {
        let pool = setup_test_db().await;
        let mut conn = pool.acquire().await.unwrap();
        let now = Utc::now();

        let mut source = create_feed(&mut conn, "https://a/rss", FeedStatus::Ready, None, now)
            .await
            .unwrap();
        let mut target = create_feed(&mut conn, "https://b/rss", FeedStatus::Ready, None, now)
            .await
            .unwrap();

        let source_storys = vec![
            story_payload("shared", "content", dt(2024, 1, 1)),
            story_payload("only-in-a", "content", dt(2024, 1, 2)),
        ];
        bulk_save_storys_by_feed(&mut conn, &mut source, &source_storys)
            .await
            .unwrap();
        let target_storys = vec![story_payload("shared", "content", dt(2024, 1, 1))];
        bulk_save_storys_by_feed(&mut conn, &mut target, &target_storys)
            .await
            .unwrap();

        create_user_feed(&mut conn, 1, source.id, false, now).await.unwrap();
        create_user_feed(&mut conn, 2, source.id, false, now).await.unwrap();
        create_user_feed(&mut conn, 2, target.id, false, now).await.unwrap();

        merge_feeds(&mut conn, target.id, source.id).await.unwrap();

        assert!(get_feed_by_id(&mut conn, source.id).await.unwrap().is_none());
        let storys = list_storys_by_feed(&mut conn, target.id).await.unwrap();
        assert_eq!(storys.len(), 2);
        for story in &storys {
            assert_eq!(unpack_story_id(story.id).0, target.id);
        }

        // user 1 moved over; user 2 kept the existing target subscription
        assert!(get_user_feed(&mut conn, 1, target.id).await.unwrap().is_some());
        assert!(get_user_feed(&mut conn, 2, target.id).await.unwrap().is_some());

        let reloaded = get_feed_by_id(&mut conn, target.id).await.unwrap().unwrap();
        assert_eq!(reloaded.monthly_story_count.0.get(2024, 1), 2);
    }

    #[tokio::test]
    async fn test_take_outdated_feeds() {
        let pool = setup_test_db().await;
        let mut conn = pool.acquire().await.unwrap();
        let now = Utc::now();

        let mut stale = create_feed(&mut conn, "https://stale/rss", FeedStatus::Ready, None, now)
            .await
            .unwrap();
        stale.dt_checked = Some(now - chrono::Duration::seconds(3600));
        stale.etag = Some("etag-stale".to_owned());
        save_feed(&mut conn, &stale).await.unwrap();

        let mut fresh = create_feed(&mut conn, "https://fresh/rss", FeedStatus::Ready, None, now)
            .await
            .unwrap();
        fresh.dt_checked = Some(now);
        save_feed(&mut conn, &fresh).await.unwrap();

        // Never-checked feeds are always due
        create_feed(&mut conn, "https://new/rss", FeedStatus::Pending, None, now)
            .await
            .unwrap();
        drop(conn);

        let outdated = take_outdated_feeds(&pool, 1800.0, now).await.unwrap();
        let urls: Vec<&str> = outdated.iter().map(|f| f.url.as_str()).collect();
        assert!(urls.contains(&"https://stale/rss"));
        assert!(urls.contains(&"https://new/rss"));
        assert!(!urls.contains(&"https://fresh/rss"));

        let stale_row = outdated.iter().find(|f| f.url == "https://stale/rss").unwrap();
        assert_eq!(stale_row.etag.as_deref(), Some("etag-stale"));
    }

    #[tokio::test]
    async fn test_feed_creation_lifecycle_queries() {
        let pool = setup_test_db().await;
        let mut conn = pool.acquire().await.unwrap();
        let now = Utc::now();

        let creation = create_feed_creation(&mut conn, 1, "https://a/rss", false, now)
            .await
            .unwrap();
        assert_eq!(creation.status, FeedStatus::Pending);

        update_feed_creation_status(&mut conn, creation.id, FeedStatus::Updating, now)
            .await
            .unwrap();
        let reloaded = get_feed_creation_by_id(&mut conn, creation.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reloaded.status, FeedStatus::Updating);
        drop(conn);

        // Stuck UPDATING rows show up once past the cutoff
        let stuck = query_stuck_feed_creations(&pool, FeedStatus::Updating, now + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(stuck, vec![(creation.id, "https://a/rss".to_owned())]);

        let not_stuck =
            query_stuck_feed_creations(&pool, FeedStatus::Updating, now - chrono::Duration::minutes(5))
                .await
                .unwrap();
        assert!(not_stuck.is_empty());

        bulk_set_feed_creations_pending(&pool, &[creation.id], now).await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let reloaded = get_feed_creation_by_id(&mut conn, creation.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reloaded.status, FeedStatus::Pending);
    }

    #[tokio::test]
    async fn test_delete_terminal_feed_creations() {
        let pool = setup_test_db().await;
        let mut conn = pool.acquire().await.unwrap();
        let now = Utc::now();
        let old = now - chrono::Duration::hours(25);

        let mut done = create_feed_creation(&mut conn, 1, "https://done/rss", false, old)
            .await
            .unwrap();
        done.status = FeedStatus::Ready;
        save_feed_creation(&mut conn, &done).await.unwrap();

        let mut failed = create_feed_creation(&mut conn, 1, "https://failed/rss", false, old)
            .await
            .unwrap();
        failed.status = FeedStatus::Error;
        save_feed_creation(&mut conn, &failed).await.unwrap();

        // Old but still pending: kept for retry
        create_feed_creation(&mut conn, 1, "https://pending/rss", false, old)
            .await
            .unwrap();
        drop(conn);

        let cutoff = now - chrono::Duration::hours(24);
        let deleted = delete_terminal_feed_creations(&pool, cutoff).await.unwrap();
        assert_eq!(deleted, 2);

        let pending = query_stuck_feed_creations(&pool, FeedStatus::Pending, now)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn test_feed_url_map_latest_target_wins() {
        let pool = setup_test_db().await;
        let mut conn = pool.acquire().await.unwrap();
        let now = Utc::now();

        insert_feed_url_map(&mut conn, "https://a", "NOT_FOUND", now)
            .await
            .unwrap();
        insert_feed_url_map(&mut conn, "https://a", "https://a/rss", now)
            .await
            .unwrap();

        let target = get_feed_url_map_target(&mut conn, "https://a").await.unwrap();
        assert_eq!(target.as_deref(), Some("https://a/rss"));
    }
}
