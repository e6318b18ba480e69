//! HTTP intercepting transport.
//!
//! Implements the round-tripper contract: requests that look like
//! piece-distributable content downloads are served from the P2P engine as
//! streamed bodies; everything else passes through to a plain HTTP client
//! with identical headers.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use futures::TryStreamExt;
use http::header::{ACCEPT_ENCODING, HOST, RANGE};
use http::{HeaderMap, Request, Response, StatusCode};
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;
use tracing::{debug, info};

use crate::config::ProxyConfig;
use crate::engine::{EngineError, StreamTaskRequest, TaskManager};
use crate::task::UrlMeta;

/// Header naming the query parameters to strip from the task fingerprint.
pub const HEADER_FILTER: &str = "X-Dragonfly-Filter";
/// Header carrying the application tag for the task fingerprint.
pub const HEADER_TAG: &str = "X-Dragonfly-Biz";

/// Hop-by-hop headers removed before a request is handed to the engine,
/// plus headers that would needlessly split task fingerprints.
const HOP_HEADERS: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "accept",
    "user-agent",
    "x-forwarded-for",
];

/// Trace-context headers stripped so tracing never correlates distinct
/// downloads into one task.
const TRACE_HEADERS: &[&str] = &["traceparent", "tracestate", "baggage"];

/// Streamed response body.
pub type ProxyBody = Box<dyn AsyncRead + Send + Unpin>;

/// Errors from the proxy transport.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// The engine could not serve the intercepted request.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// The passthrough upstream failed.
    #[error("upstream request failed")]
    Upstream(#[from] reqwest::Error),

    /// The response could not be assembled.
    #[error("response assembly failed")]
    Http(#[from] http::Error),
}

/// Predicate deciding whether a request is served via the engine.
pub type InterceptPredicate = dyn Fn(&Request<Bytes>) -> bool + Send + Sync;

/// Round-tripper splicing P2P-backed streams into HTTP responses.
pub struct ProxyTransport {
    manager: Arc<TaskManager>,
    base: reqwest::Client,
    should_intercept: Box<InterceptPredicate>,
    config: ProxyConfig,
}

impl ProxyTransport {
    /// Creates a transport with the default container-layer predicate.
    pub fn new(manager: Arc<TaskManager>, config: ProxyConfig) -> Self {
        Self {
            manager,
            base: reqwest::Client::builder()
                .build()
                .expect("passthrough client construction"),
            should_intercept: Box::new(default_should_intercept),
            config,
        }
    }

    /// Overrides the intercept predicate.
    pub fn with_condition(
        mut self,
        predicate: impl Fn(&Request<Bytes>) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.should_intercept = Box::new(predicate);
        self
    }

    /// Serves one request, via the engine or the passthrough client.
    ///
    /// # Errors
    /// - `ProxyError::Engine` - The engine failed the intercepted request.
    /// - `ProxyError::Upstream` - The passthrough upstream failed.
    pub async fn round_trip(
        &self,
        request: Request<Bytes>,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        if self.config.dump_http_content {
            debug!(
                "proxy request: {} {} headers {:?}",
                request.method(),
                request.uri(),
                request.headers()
            );
        }
        let response = if (self.should_intercept)(&request) {
            debug!("round trip via engine: {}", request.uri());
            self.download(request).await?
        } else {
            debug!("round trip directly: {} {}", request.method(), request.uri());
            self.passthrough(request).await?
        };
        if self.config.dump_http_content {
            debug!(
                "proxy response: {} headers {:?}",
                response.status(),
                response.headers()
            );
        }
        Ok(response)
    }

    async fn download(&self, request: Request<Bytes>) -> Result<Response<ProxyBody>, ProxyError> {
        let url = request.uri().to_string();
        let (parts, _body) = request.into_parts();
        let mut headers = parts.headers;

        // a cached identity body must be reusable for every client
        headers.remove(ACCEPT_ENCODING);

        let filter = pick_header(&mut headers, HEADER_FILTER, &self.config.default_filter);
        let tag = pick_header(&mut headers, HEADER_TAG, &self.config.default_tag);
        let range = headers
            .get(RANGE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        strip_hop_headers(&mut headers);

        let meta = UrlMeta {
            tag,
            filter,
            digest: None,
            range,
            headers: header_map(&headers),
        };
        info!("start stream download: {url}");
        let (reader, attrs) = self
            .manager
            .start_stream_task(&StreamTaskRequest {
                url,
                url_meta: meta,
                peer_id: None,
            })
            .await?;

        let mut builder = Response::builder().status(StatusCode::OK);
        for (name, value) in &attrs {
            builder = builder.header(name.as_str(), value.as_str());
        }
        Ok(builder.body(Box::new(reader) as ProxyBody)?)
    }

    async fn passthrough(
        &self,
        request: Request<Bytes>,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let (parts, body) = request.into_parts();
        let mut headers = parts.headers;
        if let Some(host) = parts.uri.host() {
            if let Ok(value) = host.parse() {
                headers.insert(HOST, value);
            }
        }

        let upstream = self
            .base
            .request(parts.method, parts.uri.to_string())
            .headers(headers)
            .body(body)
            .send()
            .await?;

        let mut builder = Response::builder().status(upstream.status());
        for (name, value) in upstream.headers() {
            builder = builder.header(name, value);
        }
        let body = StreamReader::new(upstream.bytes_stream().map_err(std::io::Error::other));
        Ok(builder.body(Box::new(body) as ProxyBody)?)
    }
}

/// Default predicate: container image layer downloads.
pub fn default_should_intercept(request: &Request<Bytes>) -> bool {
    request.method() == http::Method::GET && path_matches_layer(request.uri().path())
}

/// Matches paths of the shape `<something>/blobs/sha256...`.
fn path_matches_layer(path: &str) -> bool {
    path.find("/blobs/sha256").is_some_and(|index| index > 0)
}

/// Takes a header value out of the map, falling back to a default.
fn pick_header(headers: &mut HeaderMap, name: &str, default: &str) -> String {
    match headers.remove(name) {
        Some(value) => value.to_str().unwrap_or(default).to_string(),
        None => default.to_string(),
    }
}

fn strip_hop_headers(headers: &mut HeaderMap) {
    for name in HOP_HEADERS.iter().chain(TRACE_HEADERS) {
        headers.remove(*name);
    }
}

fn header_map(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}
