pub mod fetch;
pub mod normalizer;
pub mod state;

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::domain::models::FeedStatus;
use crate::domain::payload::FeedPayload;
use crate::infrastructure::bus::{Bus, Envelope};
use crate::infrastructure::feed_reader::FeedReader;

/// Result of probing one embedded image: an HTTP status, or one of the
/// synthetic codes in [`crate::domain::image`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageStatus {
    pub url: String,
    pub status: i32,
}

/// Messages handled by the state loop: transactional writes over the data
/// model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StateMessage {
    UpdateFeedCreationStatus {
        feed_creation_id: i64,
        status: FeedStatus,
    },
    SaveFeedCreationResult {
        feed_creation_id: i64,
        messages: Vec<String>,
        feed: Option<FeedPayload>,
    },
    UpdateFeed {
        feed_id: i64,
        feed: FeedPayload,
        is_refresh: bool,
    },
    UpdateStory {
        story_id: i64,
        content: String,
        summary: String,
        url: String,
    },
    UpdateStoryImages {
        story_id: i64,
        story_url: String,
        images: Vec<ImageStatus>,
    },
}

/// Messages handled by the fetch loop: outbound HTTP work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FetchMessage {
    FindFeed {
        feed_creation_id: i64,
        url: String,
    },
    SyncFeed {
        feed_id: i64,
        url: String,
        content_hash_base64: Option<String>,
        etag: Option<String>,
        last_modified: Option<String>,
    },
    FetchStory {
        story_id: i64,
        url: String,
    },
    ProcessStoryWebpage {
        story_id: i64,
        url: String,
        text: String,
    },
    DetectStoryImages {
        story_id: i64,
        story_url: String,
        image_urls: BTreeSet<String>,
    },
}

/// Run the state side: messages are handled strictly one at a time, each
/// inside its own transaction. Expired envelopes are dropped unhandled.
pub fn spawn_state_loop(
    pool: SqlitePool,
    bus: Bus,
    mut rx: mpsc::Receiver<Envelope<StateMessage>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            if envelope.is_expired(Utc::now()) {
                tracing::debug!("drop expired state message");
                continue;
            }
            if let Err(err) = state::handle_message(&pool, &bus, envelope.message).await {
                tracing::error!("state handler failed: {}", err);
            }
        }
    })
}

/// Run the fetch side. Handlers are awaited one at a time here as well;
/// concurrency lives inside the handlers (the image probe fans out its
/// urls) and in running several fetch processes.
pub fn spawn_fetch_loop(
    reader: Arc<FeedReader>,
    bus: Bus,
    mut rx: mpsc::Receiver<Envelope<FetchMessage>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            if envelope.is_expired(Utc::now()) {
                tracing::debug!("drop expired fetch message");
                continue;
            }
            let expire_at = envelope.expire_at;
            fetch::handle_message(&reader, &bus, envelope.message, expire_at).await;
        }
    })
}
