//! Piece persistence: content-addressed storage of task pieces with
//! per-task metadata and digest validation.
//!
//! The store is shared by all tasks and partitioned by task id. Writers are
//! piece fetch workers and the origin fallback; readers are the stream
//! surface handed to callers plus completed-task reuse.

mod file_store;

use std::ops::Range;

use async_trait::async_trait;
use bytes::Bytes;

pub use file_store::FileStore;

use crate::task::{PieceInfo, TaskId};

/// Task-level metadata persisted alongside pieces.
///
/// Every field is write-once: it may go from unknown to known exactly once,
/// and conflicting updates are rejected.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskMetadata {
    /// Total content length in bytes.
    pub content_length: Option<u64>,
    /// Number of pieces covering the content.
    pub total_pieces: Option<u32>,
    /// Size of every piece but the last.
    pub piece_size: Option<u32>,
    /// Aggregate digest over the per-piece MD5s.
    pub piece_md5_sign: Option<String>,
}

/// Errors from the piece store.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The task was never registered with this store.
    #[error("task {task_id} not found in store")]
    TaskNotFound {
        /// Missing task.
        task_id: TaskId,
    },

    /// The requested piece has not been stored.
    #[error("piece {num} of task {task_id} not found")]
    PieceNotFound {
        /// Task the piece belongs to.
        task_id: TaskId,
        /// Missing piece number.
        num: u32,
    },

    /// The task's stored content failed validation and was marked unusable.
    #[error("task {task_id} is invalidated")]
    Invalidated {
        /// Invalidated task.
        task_id: TaskId,
    },

    /// A metadata update contradicted an already-recorded value.
    #[error("task metadata conflict: {reason}")]
    MetadataConflict {
        /// What contradicted what.
        reason: String,
    },

    /// A piece argument was malformed.
    #[error("invalid piece: {reason}")]
    InvalidPiece {
        /// Why the piece was rejected.
        reason: String,
    },

    /// The recomputed aggregate digest does not match the recorded one.
    #[error("task {task_id} digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// Task that failed validation.
        task_id: TaskId,
        /// Recorded aggregate digest.
        expected: String,
        /// Recomputed aggregate digest.
        actual: String,
    },

    /// Underlying filesystem failure.
    #[error("storage i/o error")]
    Io(#[from] std::io::Error),
}

/// Capability interface over piece persistence.
///
/// Concurrent `store_piece` calls for disjoint piece numbers succeed
/// independently; a duplicate store for an already-present piece is a no-op
/// returning the stored size.
#[async_trait]
pub trait PieceStore: Send + Sync {
    /// Makes the task known to the store, creating its backing storage.
    /// Registering an already-known task is a no-op.
    ///
    /// # Errors
    /// - `StorageError::Io` - Backing storage could not be created.
    async fn register_task(&self, task_id: &TaskId) -> Result<(), StorageError>;

    /// Merges write-once metadata into the task record.
    ///
    /// # Errors
    /// - `StorageError::TaskNotFound` - Task was never registered.
    /// - `StorageError::MetadataConflict` - A field was already recorded
    ///   with a different value.
    async fn update_task(&self, task_id: &TaskId, meta: TaskMetadata) -> Result<(), StorageError>;

    /// Returns the task's current metadata.
    ///
    /// # Errors
    /// - `StorageError::TaskNotFound` - Task was never registered.
    async fn task_metadata(&self, task_id: &TaskId) -> Result<TaskMetadata, StorageError>;

    /// Persists one piece and returns its size in bytes.
    ///
    /// # Errors
    /// - `StorageError::TaskNotFound` - Task was never registered.
    /// - `StorageError::Invalidated` - Task content was invalidated.
    /// - `StorageError::InvalidPiece` - Body length disagrees with the
    ///   piece descriptor.
    /// - `StorageError::Io` - Write failure.
    async fn store_piece(
        &self,
        task_id: &TaskId,
        piece: &PieceInfo,
        data: Bytes,
    ) -> Result<u64, StorageError>;

    /// Whether the piece is already stored.
    async fn has_piece(&self, task_id: &TaskId, num: u32) -> bool;

    /// Reads back a stored piece, optionally restricted to a byte range
    /// within the piece.
    ///
    /// # Errors
    /// - `StorageError::TaskNotFound` - Task was never registered.
    /// - `StorageError::PieceNotFound` - Piece not stored yet.
    /// - `StorageError::Invalidated` - Task content was invalidated.
    /// - `StorageError::InvalidPiece` - Range exceeds the piece.
    /// - `StorageError::Io` - Read failure.
    async fn read_piece(
        &self,
        task_id: &TaskId,
        num: u32,
        range: Option<Range<u64>>,
    ) -> Result<Bytes, StorageError>;

    /// Blocks until the piece is stored. Returns immediately when it
    /// already is.
    ///
    /// # Errors
    /// - `StorageError::TaskNotFound` - Task was never registered.
    async fn wait_piece(&self, task_id: &TaskId, num: u32) -> Result<(), StorageError>;

    /// Number of pieces stored so far.
    async fn finished_count(&self, task_id: &TaskId) -> u32;

    /// Whether every piece of the task is stored and the content is usable.
    async fn is_complete(&self, task_id: &TaskId) -> bool;

    /// Recomputes the aggregate digest from the stored bytes and checks it
    /// against the recorded signature. When no signature was recorded yet
    /// (origin-only downloads), the computed one is recorded instead.
    ///
    /// # Errors
    /// - `StorageError::TaskNotFound` - Task was never registered.
    /// - `StorageError::InvalidPiece` - Task is not complete yet.
    /// - `StorageError::DigestMismatch` - Stored content does not hash to
    ///   the recorded signature.
    /// - `StorageError::Io` - Read failure.
    async fn validate_digest(&self, task_id: &TaskId) -> Result<(), StorageError>;

    /// Marks the task's stored content as unusable.
    async fn invalidate(&self, task_id: &TaskId);

    /// Whether the task was invalidated.
    async fn is_invalid(&self, task_id: &TaskId) -> bool;
}
