//! Spindrift Core - P2P file distribution engine
//!
//! This crate provides the engine of a peer-to-peer file distribution
//! daemon: the piece download pipeline, the scheduler control channel, the
//! origin fallback, piece persistence, and the HTTP intercepting transport
//! that turns ordinary GETs into P2P-backed streams.

#![deny(missing_docs)]
#![deny(clippy::missing_errors_doc)]
#![warn(clippy::too_many_lines)]

pub mod config;
pub mod engine;
pub mod proxy;
pub mod scheduler;
pub mod source;
pub mod storage;
pub mod task;
pub mod transfer;

// Re-export main types for convenient access
pub use config::SpindriftConfig;
pub use engine::{EngineError, StreamTaskRequest, TaskManager, TaskReader};
pub use proxy::{ProxyError, ProxyTransport};
pub use scheduler::{SchedulerClient, SchedulerError};
pub use source::{OriginClient, SourceError, SourceRegistry};
pub use storage::{FileStore, PieceStore, StorageError};
pub use task::{ErrorCode, PeerId, TaskError, TaskId};
pub use transfer::{FetchError, HttpPieceFetcher, PieceFetcher};

/// Errors that can bubble up from any Spindrift subsystem.
#[derive(Debug, thiserror::Error)]
pub enum SpindriftError {
    /// Task data-model errors (fingerprinting, digest bookkeeping)
    #[error("task error: {0}")]
    Task(#[from] TaskError),

    /// Download engine errors (conductor lifecycle, reuse, cancellation)
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// Piece persistence errors (storage I/O, validation, invalidation)
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Peer transfer errors (piece bodies, piece metadata)
    #[error("transfer error: {0}")]
    Fetch(#[from] FetchError),

    /// Scheduler channel errors
    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// Origin access errors
    #[error("origin error: {0}")]
    Source(#[from] SourceError),

    /// Proxy transport errors
    #[error("proxy error: {0}")]
    Proxy(#[from] ProxyError),

    /// Standard I/O errors from filesystem operations
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience Result type using SpindriftError as the error type
pub type Result<T> = std::result::Result<T, SpindriftError>;
