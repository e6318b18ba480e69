//! Peer-facing transfer clients: piece bodies over HTTP and piece metadata
//! enumeration.

mod fetcher;

use async_trait::async_trait;
use bytes::Bytes;

pub use fetcher::HttpPieceFetcher;

use crate::task::{PeerId, PieceInfo, PiecePacket, PieceTaskRequest, RemotePeer, TaskId};

/// Errors from peer transfers.
///
/// The taxonomy matters to the caller: connection-class failures are
/// retryable against another peer, a 404 means the peer no longer holds the
/// piece, and any other status is non-retryable from that peer.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The peer could not be reached at all.
    #[error("connect to {addr} failed")]
    Connect {
        /// Peer address the connection was attempted against.
        addr: String,
        /// Transport-level cause.
        #[source]
        source: reqwest::Error,
    },

    /// The transfer started but the body stream broke.
    #[error("piece body transfer failed")]
    Transfer(#[source] reqwest::Error),

    /// The peer answered with a non-success status.
    #[error("peer returned status {status}")]
    Status {
        /// HTTP status the peer answered with.
        status: reqwest::StatusCode,
    },

    /// The body ended before the advertised piece length.
    #[error("short piece body: expected {expected} bytes, got {actual}")]
    ShortBody {
        /// Bytes the piece descriptor promised.
        expected: u32,
        /// Bytes actually received.
        actual: usize,
    },

    /// The body hashed to something other than the advertised digest.
    #[error("piece digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// Advertised digest.
        expected: String,
        /// Computed digest.
        actual: String,
    },
}

impl FetchError {
    /// Whether retrying against a different peer makes sense.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::Connect { .. } | FetchError::Transfer(_) | FetchError::ShortBody { .. }
        )
    }

    /// Whether the peer reported it no longer holds the piece.
    pub fn is_piece_not_found(&self) -> bool {
        matches!(
            self,
            FetchError::Status { status } if *status == reqwest::StatusCode::NOT_FOUND
        )
    }
}

/// Request to fetch one piece from a remote peer.
#[derive(Debug, Clone)]
pub struct DownloadPieceRequest {
    /// Task the piece belongs to.
    pub task_id: TaskId,
    /// Our own peer id, reported to the remote end.
    pub src_peer_id: PeerId,
    /// Peer id of the remote daemon holding the piece.
    pub dst_peer_id: PeerId,
    /// `host:port` of the remote daemon's upload endpoint.
    pub dst_addr: String,
    /// Piece to fetch; `range_size` must be non-zero.
    pub piece: PieceInfo,
    /// Verify the body against `piece.md5` while it streams.
    pub calc_digest: bool,
}

/// Capability interface for fetching piece bodies from peers.
#[async_trait]
pub trait PieceFetcher: Send + Sync {
    /// Downloads one piece and returns its verified bytes.
    ///
    /// # Errors
    /// - `FetchError::Connect` - Peer unreachable; retryable elsewhere.
    /// - `FetchError::Status` - Peer refused; 404 means piece not held.
    /// - `FetchError::Transfer` / `FetchError::ShortBody` - Body broke off.
    /// - `FetchError::DigestMismatch` - Body failed verification.
    async fn download_piece(&self, req: &DownloadPieceRequest) -> Result<Bytes, FetchError>;
}

/// Capability interface for enumerating a peer's pieces of a task.
///
/// The wire encoding is a deployment concern; the engine only depends on
/// the packet semantics.
#[async_trait]
pub trait PieceTaskClient: Send + Sync {
    /// Asks `peer` which pieces of the task it can serve, starting at
    /// `req.start_num`.
    ///
    /// An empty `piece_infos` in the reply means the peer has nothing new
    /// yet; the caller is expected to poll again.
    ///
    /// # Errors
    /// - `FetchError::Connect` - Peer unreachable.
    /// - `FetchError::Status` - Peer refused the request.
    async fn piece_packet(
        &self,
        peer: &RemotePeer,
        req: &PieceTaskRequest,
    ) -> Result<PiecePacket, FetchError>;
}
