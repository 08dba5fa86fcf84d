use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;

use crate::domain::monthly::MonthlyStoryCount;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum FeedStatus {
    Pending,
    Updating,
    Ready,
    Error,
}

impl FeedStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, FeedStatus::Ready | FeedStatus::Error)
    }
}

/// Number of low bits of a story id holding the per-feed offset; the high
/// bits hold the feed id.
const STORY_OFFSET_BITS: u32 = 32;

/// Pack `(feed_id, offset)` into the story primary key.
pub fn story_id(feed_id: i64, offset: i64) -> i64 {
    (feed_id << STORY_OFFSET_BITS) | offset
}

/// Inverse of [`story_id`].
pub fn unpack_story_id(id: i64) -> (i64, i64) {
    (id >> STORY_OFFSET_BITS, id & ((1 << STORY_OFFSET_BITS) - 1))
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Feed {
    pub id: i64,
    pub url: String,
    pub title: Option<String>,
    pub link: Option<String>,
    pub author: Option<String>,
    pub icon: Option<String>,
    pub description: Option<String>,
    pub version: Option<String>,
    pub encoding: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub content_hash_base64: Option<String>,
    pub status: FeedStatus,
    pub monthly_story_count: Json<MonthlyStoryCount>,
    pub dt_created: DateTime<Utc>,
    pub dt_updated: Option<DateTime<Utc>>,
    pub dt_checked: Option<DateTime<Utc>>,
    pub dt_synced: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Story {
    pub id: i64,
    pub feed_id: i64,
    pub offset: i64,
    pub unique_id: String,
    pub title: Option<String>,
    pub link: Option<String>,
    pub author: Option<String>,
    pub content: Option<String>,
    pub summary: Option<String>,
    pub content_hash_base64: String,
    pub dt_published: DateTime<Utc>,
    pub dt_updated: DateTime<Utc>,
}

/// A user's request to subscribe to a url, tracked through discovery.
/// PENDING -> UPDATING -> (READY with feed_id | ERROR); terminal rows are
/// garbage-collected and stuck rows retried by the janitor.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct FeedCreation {
    pub id: i64,
    pub user_id: i64,
    pub url: String,
    pub is_from_bookmark: bool,
    pub status: FeedStatus,
    pub message: Option<String>,
    pub feed_id: Option<i64>,
    pub dt_created: DateTime<Utc>,
    pub dt_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UserFeed {
    pub id: i64,
    pub user_id: i64,
    pub feed_id: i64,
    pub is_from_bookmark: bool,
    pub dt_created: DateTime<Utc>,
}

/// Sentinel target recorded when discovery found nothing at a url.
pub const FEED_URL_NOT_FOUND: &str = "NOT_FOUND";

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct FeedUrlMap {
    pub id: i64,
    pub source: String,
    pub target: String,
    pub dt_created: DateTime<Utc>,
}
