use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::domain::text::shorten;

pub const MAX_TITLE_LEN: usize = 200;
pub const MAX_SUMMARY_LEN: usize = 300;

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("invalid feed url `{0}`")]
    InvalidUrl(String),
    #[error("feed has no title")]
    MissingTitle,
    #[error("feed has no content hash")]
    MissingContentHash,
    #[error("story has neither id nor link")]
    MissingStoryUniqueId,
}

/// Wire form of a story, produced by the normalizer and consumed by the
/// state handlers after [`FeedPayload::validate`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryPayload {
    pub unique_id: String,
    pub title: String,
    pub content_hash_base64: String,
    pub author: Option<String>,
    pub link: Option<String>,
    pub summary: Option<String>,
    pub content: Option<String>,
    pub dt_published: Option<DateTime<Utc>>,
    pub dt_updated: Option<DateTime<Utc>>,
}

/// Wire form of a fetched feed plus its storys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedPayload {
    pub url: String,
    pub title: String,
    pub content_hash_base64: String,
    pub link: Option<String>,
    pub author: Option<String>,
    pub icon: Option<String>,
    pub description: Option<String>,
    pub version: Option<String>,
    pub encoding: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub dt_updated: Option<DateTime<Utc>>,
    pub storys: Vec<StoryPayload>,
}

impl FeedPayload {
    /// Normalize and check the payload at the message boundary. Empty
    /// strings and null are equivalent on the wire; after validation every
    /// optional field is either `None` or non-empty, and length caps hold.
    pub fn validate(mut self) -> Result<Self, PayloadError> {
        if Url::parse(&self.url).is_err() {
            return Err(PayloadError::InvalidUrl(self.url));
        }
        self.title = shorten(&self.title, MAX_TITLE_LEN);
        if self.title.is_empty() {
            return Err(PayloadError::MissingTitle);
        }
        if self.content_hash_base64.is_empty() {
            return Err(PayloadError::MissingContentHash);
        }
        self.link = normalize_opt(self.link);
        self.author = normalize_opt(self.author).map(|a| shorten(&a, MAX_TITLE_LEN));
        self.icon = normalize_opt(self.icon);
        self.description = normalize_opt(self.description);
        self.version = normalize_opt(self.version).map(|v| shorten(&v, MAX_TITLE_LEN));
        self.encoding = normalize_opt(self.encoding);
        self.etag = normalize_opt(self.etag);
        self.last_modified = normalize_opt(self.last_modified);

        let mut storys = Vec::with_capacity(self.storys.len());
        for story in self.storys {
            storys.push(story.validate()?);
        }
        self.storys = storys;
        Ok(self)
    }
}

impl StoryPayload {
    fn validate(mut self) -> Result<Self, PayloadError> {
        self.link = normalize_opt(self.link);
        if self.unique_id.is_empty() {
            // unique_id defaults to the story link
            match &self.link {
                Some(link) => self.unique_id = link.clone(),
                None => return Err(PayloadError::MissingStoryUniqueId),
            }
        }
        self.unique_id = shorten(&self.unique_id, MAX_TITLE_LEN);
        self.title = shorten(&self.title, MAX_TITLE_LEN);
        self.author = normalize_opt(self.author).map(|a| shorten(&a, MAX_TITLE_LEN));
        self.summary = normalize_opt(self.summary).map(|s| shorten(&s, MAX_SUMMARY_LEN));
        self.content = normalize_opt(self.content);
        Ok(self)
    }
}

fn normalize_opt(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}
