//! Core data model for peer tasks: identifiers, peers, URL metadata and
//! result codes shared by every other subsystem.

pub mod digest;
pub mod fingerprint;
mod piece;

use std::collections::HashMap;
use std::fmt;

pub use piece::{
    END_PIECE_NUM, PieceInfo, PiecePacket, PieceStyle, PieceTaskRequest, UNKNOWN_CONTENT_LENGTH,
    UNKNOWN_TOTAL_PIECES, compute_piece_size, total_piece_count,
};

/// SHA-256 fingerprint identifying equivalent download tasks.
///
/// Two requests with the same canonical URL, filtered query, tag, range and
/// digest map to the same task and share one download.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskId(String);

impl TaskId {
    /// Wraps an already-computed fingerprint string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the fingerprint as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the short prefix used to shard peer upload paths.
    pub fn prefix(&self) -> &str {
        &self.0[..self.0.len().min(3)]
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a daemon participating in the overlay.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerId(String);

impl PeerId {
    /// Wraps an existing peer identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh peer id for the given host IP.
    ///
    /// The id embeds the IP so operators can attribute traffic, plus a
    /// random suffix so restarts produce distinct peers.
    pub fn generate(ip: &str) -> Self {
        use rand::Rng;
        let suffix: u64 = rand::thread_rng().r#gen();
        Self(format!("{ip}-{suffix:016x}"))
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Network endpoints of a daemon host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerHost {
    /// Advertised IP address.
    pub ip: String,
    /// Port of the control-plane RPC endpoint.
    pub rpc_port: u16,
    /// Port of the piece upload endpoint.
    pub download_port: u16,
}

/// A remote peer the scheduler nominated as a piece source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePeer {
    /// Identifier of the remote daemon.
    pub peer_id: PeerId,
    /// Endpoints of the remote daemon.
    pub host: PeerHost,
    /// Whether the peer is a content-caching front-end. Treated identically
    /// to ordinary peers at this layer.
    pub is_cdn: bool,
}

impl RemotePeer {
    /// Address of the peer's piece upload endpoint.
    pub fn download_addr(&self) -> String {
        format!("{}:{}", self.host.ip, self.host.download_port)
    }
}

/// Caller-supplied metadata qualifying a download URL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UrlMeta {
    /// Application tag; distinguishes otherwise identical URLs.
    pub tag: String,
    /// Query parameter names (joined with `&`) stripped before
    /// fingerprinting so volatile parameters do not split tasks.
    pub filter: String,
    /// Expected content digest, when the caller knows it.
    pub digest: Option<String>,
    /// Byte range of the origin content this task covers, as an HTTP
    /// `Range` header value.
    pub range: Option<String>,
    /// Extra request headers forwarded to peers and the origin.
    pub headers: HashMap<String, String>,
}

/// How much protocol a freshly registered task needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeScope {
    /// Content small enough to be embedded in the registration reply.
    Tiny,
    /// Exactly one piece, fetchable directly from a named peer.
    Small,
    /// Full piece protocol.
    Normal,
}

/// Result codes propagated across component boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Operation succeeded.
    Success,
    /// Waited too long for a peer to produce new pieces.
    ClientWaitPieceReady,
    /// Piece transfer started but failed (bad status, digest mismatch,
    /// truncated body).
    ClientPieceDownloadFail,
    /// Piece request could not reach the peer at all.
    ClientPieceRequestFail,
    /// No such task is known to this daemon.
    PeerTaskNotFound,
    /// Scheduler directive: abandon the overlay and fetch from the origin.
    /// A directive, not a failure.
    SchedNeedBackSource,
    /// Scheduler observed the nominated peer disappear.
    SchedPeerGone,
    /// The origin fallback itself failed.
    BackSourceFail,
}

impl ErrorCode {
    /// Whether this code reports success.
    pub fn is_success(self) -> bool {
        matches!(self, ErrorCode::Success)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::Success => "Success",
            ErrorCode::ClientWaitPieceReady => "ClientWaitPieceReady",
            ErrorCode::ClientPieceDownloadFail => "ClientPieceDownloadFail",
            ErrorCode::ClientPieceRequestFail => "ClientPieceRequestFail",
            ErrorCode::PeerTaskNotFound => "PeerTaskNotFound",
            ErrorCode::SchedNeedBackSource => "SchedNeedBackSource",
            ErrorCode::SchedPeerGone => "SchedPeerGone",
            ErrorCode::BackSourceFail => "BackSourceFail",
        };
        f.write_str(name)
    }
}

/// Errors raised by the task data model itself.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// The request URL could not be parsed.
    #[error("invalid task url")]
    InvalidUrl(#[from] url::ParseError),

    /// A digest check failed.
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// Digest the metadata promised.
        expected: String,
        /// Digest computed from the received bytes.
        actual: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_id_prefix_shards_short_ids() {
        assert_eq!(TaskId::new("abcdef").prefix(), "abc");
        assert_eq!(TaskId::new("ab").prefix(), "ab");
    }

    #[test]
    fn peer_id_embeds_host_ip() {
        let id = PeerId::generate("192.0.2.7");
        assert!(id.as_str().starts_with("192.0.2.7-"));
        assert_ne!(PeerId::generate("192.0.2.7"), id);
    }

    #[test]
    fn download_addr_uses_download_port() {
        let peer = RemotePeer {
            peer_id: PeerId::new("peer-a"),
            host: PeerHost {
                ip: "10.0.0.1".to_string(),
                rpc_port: 65000,
                download_port: 65002,
            },
            is_cdn: false,
        };
        assert_eq!(peer.download_addr(), "10.0.0.1:65002");
    }

    #[test]
    fn error_code_display_names() {
        assert_eq!(ErrorCode::SchedNeedBackSource.to_string(), "SchedNeedBackSource");
        assert!(ErrorCode::Success.is_success());
        assert!(!ErrorCode::BackSourceFail.is_success());
    }
}
