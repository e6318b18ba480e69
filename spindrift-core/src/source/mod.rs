//! Origin clients: authoritative-source access for back-sourcing.
//!
//! Each URL scheme maps to one [`OriginClient`]. The registry is owned by
//! the daemon and injected where needed; there is no process-wide default.

mod http;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::io::AsyncRead;
use url::Url;

pub use http::HttpOriginClient;

/// Errors from origin access.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// No client is registered for the URL scheme.
    #[error("no origin client registered for scheme {scheme}")]
    NoClientFound {
        /// The unhandled scheme.
        scheme: String,
    },

    /// A different client is already registered for the scheme.
    #[error("origin client for scheme {scheme} already registered")]
    ConflictingClient {
        /// The contested scheme.
        scheme: String,
    },

    /// The origin answered with an unexpected status.
    #[error("origin status {got}, expected one of {allowed:?}")]
    UnexpectedStatus {
        /// Status the origin answered with.
        got: u16,
        /// Statuses the operation accepts.
        allowed: Vec<u16>,
    },

    /// The request URL does not parse.
    #[error("invalid origin url")]
    InvalidUrl(#[from] url::ParseError),

    /// Transport-level failure talking to the origin.
    #[error("origin request failed")]
    Http(#[from] reqwest::Error),
}

/// Request against an origin.
#[derive(Debug, Clone)]
pub struct SourceRequest {
    /// Resource URL.
    pub url: Url,
    /// Extra request headers (including `Range` when the task covers a
    /// sub-range of the resource).
    pub headers: HashMap<String, String>,
}

impl SourceRequest {
    /// Builds a request for the URL with no extra headers.
    ///
    /// # Errors
    /// - `SourceError::InvalidUrl` - The URL does not parse.
    pub fn new(url: &str) -> Result<Self, SourceError> {
        Ok(Self {
            url: Url::parse(url)?,
            headers: HashMap::new(),
        })
    }

    /// Returns the lowercase URL scheme.
    pub fn scheme(&self) -> String {
        self.url.scheme().to_ascii_lowercase()
    }
}

/// Freshness attributes of an origin resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpireInfo {
    /// `Last-Modified` header value, when the origin sent one.
    pub last_modified: Option<String>,
    /// `ETag` header value, when the origin sent one.
    pub etag: Option<String>,
}

/// A started origin download.
pub struct SourceResponse {
    /// Content body.
    pub body: Box<dyn AsyncRead + Send + Unpin>,
    /// Freshness attributes for later expiry checks.
    pub expire: ExpireInfo,
}

/// Capability interface over one origin protocol.
#[async_trait]
pub trait OriginClient: Send + Sync {
    /// Length of the resource, when the origin reports one.
    ///
    /// # Errors
    /// - `SourceError::Http` / `SourceError::UnexpectedStatus` - The origin
    ///   could not be queried.
    async fn content_length(&self, req: &SourceRequest) -> Result<Option<u64>, SourceError>;

    /// Whether the origin honours byte-range requests for the resource.
    ///
    /// # Errors
    /// - `SourceError::Http` - The probe could not be sent.
    async fn is_support_range(&self, req: &SourceRequest) -> Result<bool, SourceError>;

    /// Whether stored content with the given freshness attributes is stale.
    ///
    /// # Errors
    /// - `SourceError::Http` - The conditional request could not be sent.
    async fn is_expired(
        &self,
        req: &SourceRequest,
        info: &ExpireInfo,
    ) -> Result<bool, SourceError>;

    /// Starts downloading the resource.
    ///
    /// # Errors
    /// - `SourceError::Http` / `SourceError::UnexpectedStatus` - The origin
    ///   refused or could not be reached.
    async fn download(&self, req: &SourceRequest) -> Result<SourceResponse, SourceError>;

    /// Last modification time in milliseconds since the Unix epoch, when
    /// the origin reports one.
    ///
    /// # Errors
    /// - `SourceError::Http` - The origin could not be queried.
    async fn last_modified(&self, req: &SourceRequest) -> Result<Option<i64>, SourceError>;
}

/// Scheme-to-client map owned by the daemon.
#[derive(Default)]
pub struct SourceRegistry {
    clients: RwLock<HashMap<String, Arc<dyn OriginClient>>>,
}

impl SourceRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a client for a scheme. Registering the same client twice
    /// is a no-op; a different client for a taken scheme is an error.
    ///
    /// # Errors
    /// - `SourceError::ConflictingClient` - The scheme is taken by another
    ///   client.
    pub fn register(
        &self,
        scheme: &str,
        client: Arc<dyn OriginClient>,
    ) -> Result<(), SourceError> {
        let scheme = scheme.to_ascii_lowercase();
        let mut clients = self.clients.write().expect("registry poisoned");
        if let Some(existing) = clients.get(&scheme) {
            if Arc::ptr_eq(existing, &client) {
                tracing::warn!("origin client for scheme {scheme} already registered");
                return Ok(());
            }
            return Err(SourceError::ConflictingClient { scheme });
        }
        clients.insert(scheme, client);
        Ok(())
    }

    /// Removes the client for a scheme.
    pub fn unregister(&self, scheme: &str) {
        let mut clients = self.clients.write().expect("registry poisoned");
        clients.remove(&scheme.to_ascii_lowercase());
    }

    /// Looks up the client for a scheme.
    pub fn client_for(&self, scheme: &str) -> Option<Arc<dyn OriginClient>> {
        let clients = self.clients.read().expect("registry poisoned");
        clients.get(&scheme.to_ascii_lowercase()).cloned()
    }

    /// Looks up the client for a request's scheme, erroring when none is
    /// registered.
    ///
    /// # Errors
    /// - `SourceError::NoClientFound` - Nothing handles the scheme.
    pub fn client(&self, req: &SourceRequest) -> Result<Arc<dyn OriginClient>, SourceError> {
        self.client_for(&req.scheme())
            .ok_or_else(|| SourceError::NoClientFound {
                scheme: req.scheme(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullClient;

    #[async_trait]
    impl OriginClient for NullClient {
        async fn content_length(&self, _req: &SourceRequest) -> Result<Option<u64>, SourceError> {
            Ok(None)
        }
        async fn is_support_range(&self, _req: &SourceRequest) -> Result<bool, SourceError> {
            Ok(false)
        }
        async fn is_expired(
            &self,
            _req: &SourceRequest,
            _info: &ExpireInfo,
        ) -> Result<bool, SourceError> {
            Ok(false)
        }
        async fn download(&self, _req: &SourceRequest) -> Result<SourceResponse, SourceError> {
            Ok(SourceResponse {
                body: Box::new(tokio::io::empty()),
                expire: ExpireInfo::default(),
            })
        }
        async fn last_modified(&self, _req: &SourceRequest) -> Result<Option<i64>, SourceError> {
            Ok(None)
        }
    }

    #[test]
    fn register_is_idempotent_for_the_same_client() {
        let registry = SourceRegistry::new();
        let client: Arc<dyn OriginClient> = Arc::new(NullClient);
        registry.register("http", client.clone()).unwrap();
        registry.register("HTTP", client).unwrap();
        assert!(registry.client_for("http").is_some());
    }

    #[test]
    fn conflicting_registration_is_rejected() {
        let registry = SourceRegistry::new();
        registry.register("http", Arc::new(NullClient)).unwrap();
        let err = registry.register("http", Arc::new(NullClient)).unwrap_err();
        assert!(matches!(err, SourceError::ConflictingClient { .. }));
    }

    #[test]
    fn schemes_are_case_insensitive() {
        let registry = SourceRegistry::new();
        registry.register("HtTp", Arc::new(NullClient)).unwrap();
        let req = SourceRequest::new("http://example.com/file").unwrap();
        assert!(registry.client(&req).is_ok());

        registry.unregister("HTTP");
        assert!(matches!(
            registry.client(&req),
            Err(SourceError::NoClientFound { .. })
        ));
    }
}
