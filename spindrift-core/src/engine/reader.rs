//! The stream surface handed to callers: an `AsyncRead` over a task's
//! pieces in strict piece order.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::watch;

use super::{TaskConductor, TaskPhase};
use crate::storage::PieceStore;
use crate::task::{PeerId, TaskId};

/// Readable byte stream over a task's content.
///
/// Pieces are delivered in piece order as they become stored; reads block
/// on pieces not yet present, not on overall task completion. Every reader
/// has its own cursor, so concurrent readers on one task see identical,
/// complete output.
pub struct TaskReader {
    store: Arc<dyn PieceStore>,
    task_id: TaskId,
    guard: Option<ConductorGuard>,
    next_piece: u32,
    buf: Bytes,
    eof: bool,
    pending: Option<BoxFuture<'static, io::Result<Option<Bytes>>>>,
}

/// Keeps the reader attached to its conductor; the last guard dropping
/// cancels a still-running task.
struct ConductorGuard {
    conductor: Arc<TaskConductor>,
}

impl ConductorGuard {
    fn watch(&self) -> TaskWatch {
        TaskWatch {
            phase: self.conductor.phase_receiver(),
            peer_id: self.conductor.peer_id().clone(),
        }
    }
}

/// Phase subscription plus the identifiers reader errors are wrapped with.
struct TaskWatch {
    phase: watch::Receiver<TaskPhase>,
    peer_id: PeerId,
}

impl Drop for ConductorGuard {
    fn drop(&mut self) {
        self.conductor.clone().detach();
    }
}

impl TaskReader {
    /// Reader over a running task. The conductor must already have been
    /// attached once for this reader.
    pub(crate) fn attached(store: Arc<dyn PieceStore>, conductor: Arc<TaskConductor>) -> Self {
        Self {
            store,
            task_id: conductor.task_id().clone(),
            guard: Some(ConductorGuard { conductor }),
            next_piece: 0,
            buf: Bytes::new(),
            eof: false,
            pending: None,
        }
    }

    /// Reader over an already-completed task served straight from the
    /// store.
    pub(crate) fn completed(store: Arc<dyn PieceStore>, task_id: TaskId) -> Self {
        Self {
            store,
            task_id,
            guard: None,
            next_piece: 0,
            buf: Bytes::new(),
            eof: false,
            pending: None,
        }
    }
}

/// Resolves the next piece's bytes: waits for the piece to be stored, ends
/// the stream when the piece cursor passes the known total, and fails when
/// the task dies first.
async fn next_piece_bytes(
    store: Arc<dyn PieceStore>,
    task_id: TaskId,
    mut watch: Option<TaskWatch>,
    num: u32,
) -> io::Result<Option<Bytes>> {
    loop {
        if let Ok(metadata) = store.task_metadata(&task_id).await {
            if let Some(total) = metadata.total_pieces {
                if num >= total {
                    return Ok(None);
                }
            }
        }

        if store.has_piece(&task_id, num).await {
            let bytes = store
                .read_piece(&task_id, num, None)
                .await
                .map_err(io::Error::other)?;
            return Ok(Some(bytes));
        }

        match watch.as_mut() {
            None => {
                store
                    .wait_piece(&task_id, num)
                    .await
                    .map_err(io::Error::other)?;
            }
            Some(watch) => {
                {
                    let current = watch.phase.borrow_and_update();
                    if let TaskPhase::Failed { code, message } = &*current {
                        return Err(io::Error::other(format!(
                            "task {task_id} (peer {}) failed with {code}: {message}",
                            watch.peer_id
                        )));
                    }
                }
                tokio::select! {
                    waited = store.wait_piece(&task_id, num) => {
                        waited.map_err(io::Error::other)?;
                    }
                    _ = watch.phase.changed() => {}
                }
            }
        }
    }
}

impl AsyncRead for TaskReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.buf.is_empty() {
                let n = self.buf.len().min(out.remaining());
                let chunk = self.buf.split_to(n);
                out.put_slice(&chunk);
                return Poll::Ready(Ok(()));
            }
            if self.eof {
                return Poll::Ready(Ok(()));
            }

            if self.pending.is_none() {
                let future = next_piece_bytes(
                    self.store.clone(),
                    self.task_id.clone(),
                    self.guard.as_ref().map(ConductorGuard::watch),
                    self.next_piece,
                );
                self.pending = Some(future.boxed());
            }

            let result = match self.pending.as_mut().expect("pending future").poll_unpin(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(result) => result,
            };
            self.pending = None;
            match result {
                Ok(Some(bytes)) => {
                    self.buf = bytes;
                    self.next_piece += 1;
                }
                Ok(None) => self.eof = true,
                Err(err) => return Poll::Ready(Err(err)),
            }
        }
    }
}
