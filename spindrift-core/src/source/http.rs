//! HTTP/HTTPS origin client.

use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::StatusCode;
use reqwest::header::{ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED, RANGE};
use tokio_util::io::StreamReader;
use tracing::debug;

use super::{ExpireInfo, OriginClient, SourceError, SourceRequest, SourceResponse};

/// Origin client for `http` and `https` URLs.
pub struct HttpOriginClient {
    client: reqwest::Client,
}

impl HttpOriginClient {
    /// Creates a client with the given request timeout.
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .expect("origin client construction"),
        }
    }

    fn request(&self, req: &SourceRequest) -> reqwest::RequestBuilder {
        let mut builder = self.client.get(req.url.clone());
        for (name, value) in &req.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder
    }

    fn expire_info(response: &reqwest::Response) -> ExpireInfo {
        let header = |name| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        ExpireInfo {
            last_modified: header(LAST_MODIFIED),
            etag: header(ETAG),
        }
    }
}

impl Default for HttpOriginClient {
    fn default() -> Self {
        // downloads stream for a long time; bound only connection setup
        Self {
            client: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .build()
                .expect("origin client construction"),
        }
    }
}

#[async_trait]
impl OriginClient for HttpOriginClient {
    async fn content_length(&self, req: &SourceRequest) -> Result<Option<u64>, SourceError> {
        let response = self.request(req).send().await?;
        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
            return Err(SourceError::UnexpectedStatus {
                got: status.as_u16(),
                allowed: vec![200, 206],
            });
        }
        Ok(response.content_length())
    }

    async fn is_support_range(&self, req: &SourceRequest) -> Result<bool, SourceError> {
        let mut probe = req.clone();
        probe
            .headers
            .insert(RANGE.as_str().to_string(), "bytes=0-0".to_string());
        let response = self.request(&probe).send().await?;
        Ok(response.status() == StatusCode::PARTIAL_CONTENT)
    }

    async fn is_expired(
        &self,
        req: &SourceRequest,
        info: &ExpireInfo,
    ) -> Result<bool, SourceError> {
        if info.last_modified.is_none() && info.etag.is_none() {
            return Ok(true);
        }
        let mut conditional = req.clone();
        if let Some(last_modified) = &info.last_modified {
            conditional
                .headers
                .insert(IF_MODIFIED_SINCE.as_str().to_string(), last_modified.clone());
        }
        if let Some(etag) = &info.etag {
            conditional
                .headers
                .insert(IF_NONE_MATCH.as_str().to_string(), etag.clone());
        }
        let response = self.request(&conditional).send().await?;
        Ok(response.status() != StatusCode::NOT_MODIFIED)
    }

    async fn download(&self, req: &SourceRequest) -> Result<SourceResponse, SourceError> {
        debug!("origin download: {}", req.url);
        let response = self.request(req).send().await?;
        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
            return Err(SourceError::UnexpectedStatus {
                got: status.as_u16(),
                allowed: vec![200, 206],
            });
        }
        let expire = Self::expire_info(&response);
        let body = StreamReader::new(
            response
                .bytes_stream()
                .map_err(std::io::Error::other),
        );
        Ok(SourceResponse {
            body: Box::new(body),
            expire,
        })
    }

    async fn last_modified(&self, req: &SourceRequest) -> Result<Option<i64>, SourceError> {
        let response = self.request(req).send().await?;
        let parsed = response
            .headers()
            .get(LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| chrono::DateTime::parse_from_rfc2822(v).ok())
            .map(|dt| dt.timestamp_millis());
        Ok(parsed)
    }
}
