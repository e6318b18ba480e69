//! Per-task download engine.
//!
//! A task conductor owns everything one task needs: the scheduler stream, a
//! directive receiver, a bounded pool of piece fetch workers, the completion
//! bitmap (delegated to the store) and the origin fallback. The
//! [`TaskManager`] deduplicates conductors by task fingerprint and hands out
//! [`TaskReader`]s streaming the task's bytes in piece order.
//!
//! Concurrency follows an actor-ish shape: one task drains the scheduler
//! directive stream and serialises outbound reports, workers consume an
//! in-memory piece queue, and every task observes the conductor phase
//! channel for shutdown.

mod conductor;
mod manager;
mod reader;

#[cfg(test)]
pub(crate) mod test_support;


pub use manager::{StreamTaskRequest, TaskManager};
pub use reader::TaskReader;

pub(crate) use conductor::TaskConductor;

use crate::scheduler::SchedulerError;
use crate::source::SourceError;
use crate::storage::StorageError;
use crate::task::{ErrorCode, PeerId, TaskError, TaskId};
use crate::transfer::FetchError;

/// Errors surfaced by the download engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Data-model failure (fingerprinting, digests).
    #[error(transparent)]
    Task(#[from] TaskError),

    /// Scheduler channel failure.
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    /// Piece store failure.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Origin access failure.
    #[error(transparent)]
    Source(#[from] SourceError),

    /// Peer transfer failure.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// No completed content is stored for the task.
    #[error("no completed task {task_id} on this daemon")]
    TaskNotFound {
        /// The missing task.
        task_id: TaskId,
    },

    /// The task reached a terminal failure.
    #[error("task {task_id} (peer {peer_id}) failed with {code}: {message}")]
    TaskFailed {
        /// Task that failed.
        task_id: TaskId,
        /// Peer id the task ran under.
        peer_id: PeerId,
        /// Terminal result code.
        code: ErrorCode,
        /// Human-readable cause.
        message: String,
    },
}

/// Lifecycle of a conductor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TaskPhase {
    /// Created, not yet registered.
    Init,
    /// Fetching pieces from the overlay.
    Running,
    /// The overlay gave up; the origin supplies the remainder.
    BackSourcing,
    /// All pieces stored and validated.
    Succeeded,
    /// Terminal failure.
    Failed {
        /// Terminal result code.
        code: ErrorCode,
        /// Human-readable cause.
        message: String,
    },
}

impl TaskPhase {
    pub(crate) fn is_terminal(&self) -> bool {
        matches!(self, TaskPhase::Succeeded | TaskPhase::Failed { .. })
    }

    pub(crate) fn is_failed(&self) -> bool {
        matches!(self, TaskPhase::Failed { .. })
    }
}
