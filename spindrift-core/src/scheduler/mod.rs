//! Scheduler control channel: registration, the bidirectional piece-result
//! stream, and the terminal peer report.
//!
//! The wire encoding is a deployment concern; the engine depends only on
//! the message semantics expressed here, so a gRPC binding and the in-memory
//! test doubles implement the same traits.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::task::{
    ErrorCode, PeerHost, PeerId, PieceInfo, RemotePeer, SizeScope, TaskId, UrlMeta,
};

/// Errors on the scheduler channel.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// Directive, not a failure: abandon the overlay and fetch from the
    /// origin.
    #[error("scheduler directed task {task_id} to back-source")]
    NeedBackSource {
        /// Task being redirected.
        task_id: TaskId,
    },

    /// The scheduler rejected an operation with a result code.
    #[error("scheduler rejected request with {code}: {message}")]
    Rejected {
        /// Result code the scheduler answered with.
        code: ErrorCode,
        /// Accompanying message.
        message: String,
    },

    /// The channel transport failed.
    #[error("scheduler transport error: {reason}")]
    Transport {
        /// What broke.
        reason: String,
    },

    /// The stream was closed by the remote end.
    #[error("scheduler stream closed")]
    Closed,
}

impl SchedulerError {
    /// Whether this error is the back-source directive sentinel.
    pub fn is_back_source(&self) -> bool {
        matches!(self, SchedulerError::NeedBackSource { .. })
    }
}

/// Registration request for a new peer task.
#[derive(Debug, Clone)]
pub struct RegisterRequest {
    /// Origin URL of the content.
    pub url: String,
    /// Caller-supplied URL metadata.
    pub url_meta: UrlMeta,
    /// Our peer id for this task.
    pub peer_id: PeerId,
    /// Task fingerprint.
    pub task_id: TaskId,
    /// Our advertised endpoints.
    pub peer_host: PeerHost,
}

/// Content delivered straight in the registration reply.
#[derive(Debug, Clone)]
pub enum DirectPiece {
    /// The whole content, inlined. Tiny scope.
    Content(Bytes),
    /// One piece, fetchable from the named peer. Small scope.
    SinglePiece {
        /// Peer holding the piece.
        peer: RemotePeer,
        /// The task's only piece.
        piece: PieceInfo,
    },
}

/// Reply to [`SchedulerClient::register_peer_task`].
#[derive(Debug, Clone)]
pub struct RegisterResult {
    /// Task fingerprint as the scheduler sees it.
    pub task_id: TaskId,
    /// How much protocol the task needs.
    pub size_scope: SizeScope,
    /// Shortcut content for tiny/small scopes.
    pub direct_piece: Option<DirectPiece>,
}

/// Directive naming candidate piece sources for a task.
#[derive(Debug, Clone)]
pub struct PeerPacket {
    /// Result code; non-success packets carry no usable peers.
    pub code: ErrorCode,
    /// Task this directive applies to.
    pub task_id: TaskId,
    /// Peer the directive is addressed to.
    pub src_pid: PeerId,
    /// Suggested piece download parallelism.
    pub parallel_count: u32,
    /// Primary candidate source.
    pub main_peer: Option<RemotePeer>,
    /// Secondary candidate sources.
    pub steal_peers: Vec<RemotePeer>,
}

/// Per-piece progress report sent up the stream.
#[derive(Debug, Clone)]
pub struct PieceResult {
    /// Task the piece belongs to.
    pub task_id: TaskId,
    /// Reporting peer.
    pub src_pid: PeerId,
    /// Peer the piece was fetched from, when any.
    pub dst_pid: Option<PeerId>,
    /// Piece number, or [`crate::task::END_PIECE_NUM`] on the final report.
    pub piece_num: i32,
    /// Descriptor of the piece the report is about, when known.
    pub piece: Option<PieceInfo>,
    /// Whether the attempt succeeded.
    pub success: bool,
    /// Result code of the attempt.
    pub code: ErrorCode,
    /// Attempt start, nanoseconds since the Unix epoch.
    pub begin_ns: u64,
    /// Attempt end, nanoseconds since the Unix epoch.
    pub finish_ns: u64,
    /// Successful pieces observed so far for this task.
    pub finished_count: u32,
}

impl PieceResult {
    /// Builds the final success report closing out a task.
    pub fn end_of_task(task_id: TaskId, src_pid: PeerId, finished_count: u32) -> Self {
        let now = unix_nanos();
        Self {
            task_id,
            src_pid,
            dst_pid: None,
            piece_num: crate::task::END_PIECE_NUM,
            piece: None,
            success: true,
            code: ErrorCode::Success,
            begin_ns: now,
            finish_ns: now,
            finished_count,
        }
    }
}

/// Terminal report for a task lifetime.
#[derive(Debug, Clone)]
pub struct PeerResult {
    /// Task being closed out.
    pub task_id: TaskId,
    /// Reporting peer.
    pub peer_id: PeerId,
    /// Whether the task succeeded.
    pub success: bool,
    /// Terminal result code.
    pub code: ErrorCode,
    /// Content length once known, or -1.
    pub content_length: i64,
    /// Total pieces once known, or -1.
    pub total_pieces: i32,
    /// Wall-clock task duration.
    pub cost: Duration,
}

/// Outbound half of the piece-result stream. Not safe for concurrent
/// sends; the engine serialises all sends through one owner.
#[async_trait]
pub trait PieceResultSink: Send {
    /// Sends one progress report.
    ///
    /// # Errors
    /// - `SchedulerError::Transport` / `SchedulerError::Closed` - The
    ///   stream is gone.
    async fn send(&mut self, result: PieceResult) -> Result<(), SchedulerError>;

    /// Half-closes the stream after the final report.
    ///
    /// # Errors
    /// - `SchedulerError::Transport` - The close could not be delivered.
    async fn close(&mut self) -> Result<(), SchedulerError>;
}

/// Inbound half of the piece-result stream.
#[async_trait]
pub trait PeerPacketSource: Send {
    /// Receives the next directive.
    ///
    /// # Errors
    /// - `SchedulerError::NeedBackSource` - Back-source directive sentinel.
    /// - `SchedulerError::Closed` - Remote end finished the stream.
    /// - `SchedulerError::Transport` - Transport failure.
    async fn recv(&mut self) -> Result<PeerPacket, SchedulerError>;
}

/// An open bidirectional stream for one task.
pub struct SchedulerChannel {
    /// Outbound reports.
    pub sink: Box<dyn PieceResultSink>,
    /// Inbound directives.
    pub source: Box<dyn PeerPacketSource>,
}

/// Capability interface over the scheduler RPC surface.
#[async_trait]
pub trait SchedulerClient: Send + Sync {
    /// Registers a peer task and learns its size scope.
    ///
    /// # Errors
    /// - `SchedulerError::Rejected` / `SchedulerError::Transport` - The
    ///   scheduler refused or could not be reached.
    async fn register_peer_task(
        &self,
        req: &RegisterRequest,
    ) -> Result<RegisterResult, SchedulerError>;

    /// Opens the bidirectional piece-result stream for a registered task.
    ///
    /// # Errors
    /// - `SchedulerError::Transport` - The stream could not be opened.
    async fn open_stream(&self, req: &RegisterRequest)
    -> Result<SchedulerChannel, SchedulerError>;

    /// Sends the terminal peer report.
    ///
    /// # Errors
    /// - `SchedulerError::Transport` - The report could not be delivered.
    async fn report_peer_result(&self, result: PeerResult) -> Result<(), SchedulerError>;
}

/// Nanoseconds since the Unix epoch, for report timestamps.
pub fn unix_nanos() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn back_source_sentinel_is_not_a_failure_code() {
        let err = SchedulerError::NeedBackSource {
            task_id: TaskId::new("t"),
        };
        assert!(err.is_back_source());
        let err = SchedulerError::Closed;
        assert!(!err.is_back_source());
    }

    #[test]
    fn end_of_task_report_carries_the_sentinel() {
        let result = PieceResult::end_of_task(TaskId::new("t"), PeerId::new("p"), 10);
        assert_eq!(result.piece_num, crate::task::END_PIECE_NUM);
        assert!(result.success);
        assert_eq!(result.finished_count, 10);
    }
}
