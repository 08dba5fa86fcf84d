use reqwest::{header, Client, StatusCode};
use std::time::Duration;
use thiserror::Error;

use crate::domain::image::{STATUS_CONNECTION_ERROR, STATUS_TIMEOUT};

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("HTTP request failed with status {status}: {message}")]
    RequestFailed { status: StatusCode, message: String },

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),
}

/// A fetched feed document plus the response metadata the normalizer folds
/// into the feed record.
#[derive(Debug, Clone)]
pub struct FeedResponse {
    pub final_url: String,
    pub body: Vec<u8>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub encoding: Option<String>,
}

pub enum ReadOutcome {
    Fetched(FeedResponse),
    NotModified,
}

pub struct FeedReader {
    client: Client,
}

impl FeedReader {
    pub fn new() -> Result<Self, FetchError> {
        let client = Client::builder()
            .user_agent(crate::user_agent())
            .gzip(true)
            .brotli(true)
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self { client })
    }

    /// Conditional GET of a feed document. `etag` and `last_modified` are
    /// sent as If-None-Match / If-Modified-Since when present.
    pub async fn read(
        &self,
        url: &str,
        etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> Result<ReadOutcome, FetchError> {
        let mut request = self.client.get(url);
        if let Some(etag) = etag {
            request = request.header(header::IF_NONE_MATCH, etag);
        }
        if let Some(modified) = last_modified {
            request = request.header(header::IF_MODIFIED_SINCE, modified);
        }

        tracing::debug!("read feed url={}", url);
        let response = request.send().await?;

        if response.status() == StatusCode::NOT_MODIFIED {
            return Ok(ReadOutcome::NotModified);
        }
        if !response.status().is_success() {
            let status = response.status();
            let message = format!(
                "{} - {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("Unknown")
            );
            return Err(FetchError::RequestFailed { status, message });
        }

        let final_url = response.url().to_string();
        let etag = header_string(&response, header::ETAG);
        let last_modified = header_string(&response, header::LAST_MODIFIED);
        let encoding = charset_of(&response);
        let body = response.bytes().await?.to_vec();

        Ok(ReadOutcome::Fetched(FeedResponse {
            final_url,
            body,
            etag,
            last_modified,
            encoding,
        }))
    }

    /// GET a story webpage, following redirects. Returns the final url and
    /// the decoded body text.
    pub async fn read_webpage(&self, url: &str) -> Result<(String, String), FetchError> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let message = format!(
                "{} - {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("Unknown")
            );
            return Err(FetchError::RequestFailed { status, message });
        }
        let final_url = response.url().to_string();
        let text = response.text().await?;
        Ok((final_url, text))
    }

    /// Probe an image url for hotlink friendliness: issue a GET with the
    /// given referer and report the status without reading the body.
    /// Transport failures map to synthetic non-200 codes.
    pub async fn probe_image(&self, url: &str, referer: &str) -> i32 {
        let result = self
            .client
            .get(url)
            .header(header::REFERER, referer)
            .send()
            .await;
        match result {
            Ok(response) => i32::from(response.status().as_u16()),
            Err(err) if err.is_timeout() => STATUS_TIMEOUT,
            Err(_) => STATUS_CONNECTION_ERROR,
        }
    }
}

fn header_string(response: &reqwest::Response, name: header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

fn charset_of(response: &reqwest::Response) -> Option<String> {
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)?
        .to_str()
        .ok()?;
    content_type
        .split(';')
        .map(str::trim)
        .find_map(|part| part.strip_prefix("charset="))
        .map(|charset| charset.trim_matches('"').to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_read_returns_body_and_metadata() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("<rss/>")
                    .insert_header("ETag", "\"v1\"")
                    .insert_header("Last-Modified", "Mon, 01 Jan 2024 00:00:00 GMT")
                    .insert_header("Content-Type", "application/rss+xml; charset=UTF-8"),
            )
            .mount(&server)
            .await;

        let reader = FeedReader::new().unwrap();
        let url = format!("{}/feed.xml", server.uri());
        let outcome = reader.read(&url, None, None).await.unwrap();
        let ReadOutcome::Fetched(response) = outcome else {
            panic!("expected a fetched response");
        };
        assert_eq!(response.body, b"<rss/>");
        assert_eq!(response.etag.as_deref(), Some("\"v1\""));
        assert_eq!(response.encoding.as_deref(), Some("utf-8"));
        assert_eq!(response.final_url, url);
    }

    #[tokio::test]
    async fn test_read_sends_conditional_headers_and_handles_304() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("If-None-Match", "\"v1\""))
            .respond_with(ResponseTemplate::new(304))
            .mount(&server)
            .await;

        let reader = FeedReader::new().unwrap();
        let outcome = reader
            .read(&format!("{}/feed.xml", server.uri()), Some("\"v1\""), None)
            .await
            .unwrap();
        assert!(matches!(outcome, ReadOutcome::NotModified));
    }

    #[tokio::test]
    async fn test_read_maps_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let reader = FeedReader::new().unwrap();
        let result = reader
            .read(&format!("{}/feed.xml", server.uri()), None, None)
            .await;
        assert!(matches!(
            result,
            Err(FetchError::RequestFailed { status, .. }) if status.as_u16() == 502
        ));
    }

    #[tokio::test]
    async fn test_probe_image_reports_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("Referer", "https://rss.anyant.com/story/"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let reader = FeedReader::new().unwrap();
        let status = reader
            .probe_image(
                &format!("{}/a.jpg", server.uri()),
                "https://rss.anyant.com/story/",
            )
            .await;
        assert_eq!(status, 403);
    }

    #[tokio::test]
    async fn test_probe_image_maps_connection_error() {
        let reader = FeedReader::new().unwrap();
        // Nothing listens on this port
        let status = reader
            .probe_image("http://127.0.0.1:9/a.jpg", "https://rss.anyant.com/story/")
            .await;
        assert_eq!(status, STATUS_CONNECTION_ERROR);
    }
}
