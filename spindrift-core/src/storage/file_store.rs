//! Disk-backed piece store.
//!
//! Each task gets a subdirectory under the base directory; piece bodies are
//! written at their content offsets into a single data file, so a completed
//! task's data file is the origin content byte-for-byte. Piece bookkeeping
//! (which pieces exist, their digests, task metadata) lives in memory and is
//! rebuilt by re-downloading after a restart.

use std::collections::{BTreeMap, HashMap};
use std::io::SeekFrom;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as SyncMutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

use super::{PieceStore, StorageError, TaskMetadata};
use crate::task::digest::{md5_hex, piece_md5_sign};
use crate::task::{PieceInfo, TaskId};

const DATA_FILE: &str = "data";

#[derive(Debug, Clone)]
struct StoredPiece {
    offset: u64,
    size: u32,
    md5: String,
}

#[derive(Default)]
struct TaskState {
    metadata: TaskMetadata,
    pieces: BTreeMap<u32, StoredPiece>,
    invalid: bool,
}

struct TaskEntry {
    data_path: PathBuf,
    state: Mutex<TaskState>,
    notify: Notify,
}

/// Piece store persisting task content under a base directory.
pub struct FileStore {
    base_dir: PathBuf,
    tasks: SyncMutex<HashMap<TaskId, Arc<TaskEntry>>>,
}

impl FileStore {
    /// Creates a store rooted at `base_dir`, creating the directory when
    /// missing.
    ///
    /// # Errors
    /// - `StorageError::Io` - The base directory could not be created.
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self {
            base_dir,
            tasks: SyncMutex::new(HashMap::new()),
        })
    }

    fn entry(&self, task_id: &TaskId) -> Result<Arc<TaskEntry>, StorageError> {
        self.tasks
            .lock()
            .expect("store registry poisoned")
            .get(task_id)
            .cloned()
            .ok_or_else(|| StorageError::TaskNotFound {
                task_id: task_id.clone(),
            })
    }

    fn merge_field<T: PartialEq + Clone + std::fmt::Debug>(
        slot: &mut Option<T>,
        incoming: &Option<T>,
        name: &str,
    ) -> Result<(), StorageError> {
        if let Some(value) = incoming {
            match slot {
                Some(existing) if existing != value => {
                    return Err(StorageError::MetadataConflict {
                        reason: format!("{name}: recorded {existing:?}, update says {value:?}"),
                    });
                }
                Some(_) => {}
                None => *slot = Some(value.clone()),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PieceStore for FileStore {
    async fn register_task(&self, task_id: &TaskId) -> Result<(), StorageError> {
        {
            let tasks = self.tasks.lock().expect("store registry poisoned");
            if tasks.contains_key(task_id) {
                return Ok(());
            }
        }

        let dir = self.base_dir.join(task_id.as_str());
        tokio::fs::create_dir_all(&dir).await?;
        let entry = Arc::new(TaskEntry {
            data_path: dir.join(DATA_FILE),
            state: Mutex::new(TaskState::default()),
            notify: Notify::new(),
        });

        let mut tasks = self.tasks.lock().expect("store registry poisoned");
        tasks.entry(task_id.clone()).or_insert(entry);
        debug!("registered task {task_id} in store");
        Ok(())
    }

    async fn update_task(&self, task_id: &TaskId, meta: TaskMetadata) -> Result<(), StorageError> {
        let entry = self.entry(task_id)?;
        {
            let mut state = entry.state.lock().await;
            Self::merge_field(
                &mut state.metadata.content_length,
                &meta.content_length,
                "content_length",
            )?;
            Self::merge_field(
                &mut state.metadata.total_pieces,
                &meta.total_pieces,
                "total_pieces",
            )?;
            Self::merge_field(&mut state.metadata.piece_size, &meta.piece_size, "piece_size")?;
            Self::merge_field(
                &mut state.metadata.piece_md5_sign,
                &meta.piece_md5_sign,
                "piece_md5_sign",
            )?;
        }
        // metadata changes unblock readers waiting to learn the piece count
        entry.notify.notify_waiters();
        Ok(())
    }

    async fn task_metadata(&self, task_id: &TaskId) -> Result<TaskMetadata, StorageError> {
        let entry = self.entry(task_id)?;
        let state = entry.state.lock().await;
        Ok(state.metadata.clone())
    }

    async fn store_piece(
        &self,
        task_id: &TaskId,
        piece: &PieceInfo,
        data: Bytes,
    ) -> Result<u64, StorageError> {
        if data.len() != piece.range_size as usize {
            return Err(StorageError::InvalidPiece {
                reason: format!(
                    "piece {} body is {} bytes, descriptor says {}",
                    piece.num,
                    data.len(),
                    piece.range_size
                ),
            });
        }

        let entry = self.entry(task_id)?;
        {
            let state = entry.state.lock().await;
            if state.invalid {
                return Err(StorageError::Invalidated {
                    task_id: task_id.clone(),
                });
            }
            if let Some(existing) = state.pieces.get(&piece.num) {
                debug!("piece {} of task {task_id} already stored", piece.num);
                return Ok(existing.size as u64);
            }
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(&entry.data_path)
            .await?;
        file.seek(SeekFrom::Start(piece.range_start)).await?;
        file.write_all(&data).await?;
        file.flush().await?;

        let md5 = if piece.md5.is_empty() {
            md5_hex(&data)
        } else {
            piece.md5.clone()
        };

        let size = {
            let mut state = entry.state.lock().await;
            let stored = state.pieces.entry(piece.num).or_insert(StoredPiece {
                offset: piece.range_start,
                size: piece.range_size,
                md5,
            });
            stored.size as u64
        };
        entry.notify.notify_waiters();
        Ok(size)
    }

    async fn has_piece(&self, task_id: &TaskId, num: u32) -> bool {
        let Ok(entry) = self.entry(task_id) else {
            return false;
        };
        let state = entry.state.lock().await;
        state.pieces.contains_key(&num)
    }

    async fn read_piece(
        &self,
        task_id: &TaskId,
        num: u32,
        range: Option<Range<u64>>,
    ) -> Result<Bytes, StorageError> {
        let entry = self.entry(task_id)?;
        let (offset, len) = {
            let state = entry.state.lock().await;
            if state.invalid {
                return Err(StorageError::Invalidated {
                    task_id: task_id.clone(),
                });
            }
            let stored = state
                .pieces
                .get(&num)
                .ok_or_else(|| StorageError::PieceNotFound {
                    task_id: task_id.clone(),
                    num,
                })?;
            match &range {
                Some(range) => {
                    if range.start > range.end || range.end > stored.size as u64 {
                        return Err(StorageError::InvalidPiece {
                            reason: format!(
                                "range {}..{} exceeds piece {num} of {} bytes",
                                range.start, range.end, stored.size
                            ),
                        });
                    }
                    (stored.offset + range.start, (range.end - range.start) as usize)
                }
                None => (stored.offset, stored.size as usize),
            }
        };

        let mut file = OpenOptions::new().read(true).open(&entry.data_path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    async fn wait_piece(&self, task_id: &TaskId, num: u32) -> Result<(), StorageError> {
        let entry = self.entry(task_id)?;
        loop {
            let notified = entry.notify.notified();
            {
                let state = entry.state.lock().await;
                if state.pieces.contains_key(&num) {
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    async fn finished_count(&self, task_id: &TaskId) -> u32 {
        let Ok(entry) = self.entry(task_id) else {
            return 0;
        };
        let state = entry.state.lock().await;
        state.pieces.len() as u32
    }

    async fn is_complete(&self, task_id: &TaskId) -> bool {
        let Ok(entry) = self.entry(task_id) else {
            return false;
        };
        let state = entry.state.lock().await;
        match state.metadata.total_pieces {
            Some(total) => !state.invalid && state.pieces.len() as u32 == total,
            None => false,
        }
    }

    async fn validate_digest(&self, task_id: &TaskId) -> Result<(), StorageError> {
        let entry = self.entry(task_id)?;
        let (piece_nums, recorded) = {
            let state = entry.state.lock().await;
            let total = state.metadata.total_pieces.ok_or_else(|| {
                StorageError::InvalidPiece {
                    reason: "cannot validate digest before total piece count is known".to_string(),
                }
            })?;
            if state.pieces.len() as u32 != total {
                return Err(StorageError::InvalidPiece {
                    reason: format!(
                        "cannot validate digest with {}/{total} pieces stored",
                        state.pieces.len()
                    ),
                });
            }
            (
                state.pieces.keys().copied().collect::<Vec<_>>(),
                state.metadata.piece_md5_sign.clone(),
            )
        };

        // Recompute each piece digest from disk so corrupted writes are
        // caught, not just corrupted transfers.
        let mut md5s = Vec::with_capacity(piece_nums.len());
        for num in piece_nums {
            let data = self.read_piece(task_id, num, None).await?;
            md5s.push(md5_hex(&data));
        }
        let computed = piece_md5_sign(&md5s);

        match recorded {
            Some(expected) if expected == computed => Ok(()),
            Some(expected) => {
                warn!("task {task_id} aggregate digest mismatch");
                Err(StorageError::DigestMismatch {
                    task_id: task_id.clone(),
                    expected,
                    actual: computed,
                })
            }
            None => {
                // first completer: record the signature we just computed
                let mut state = entry.state.lock().await;
                state.metadata.piece_md5_sign = Some(computed);
                Ok(())
            }
        }
    }

    async fn invalidate(&self, task_id: &TaskId) {
        if let Ok(entry) = self.entry(task_id) {
            let mut state = entry.state.lock().await;
            state.invalid = true;
            warn!("task {task_id} invalidated");
        }
    }

    async fn is_invalid(&self, task_id: &TaskId) -> bool {
        let Ok(entry) = self.entry(task_id) else {
            return false;
        };
        let state = entry.state.lock().await;
        state.invalid
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tempfile::tempdir;

    use super::*;
    use crate::task::PieceStyle;

    fn piece(num: u32, start: u64, data: &[u8]) -> (PieceInfo, Bytes) {
        (
            PieceInfo {
                num,
                range_start: start,
                range_size: data.len() as u32,
                md5: md5_hex(data),
                style: PieceStyle::Plain,
            },
            Bytes::copy_from_slice(data),
        )
    }

    async fn store_with_task() -> (FileStore, TaskId, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        let task_id = TaskId::new("aabbccddee");
        store.register_task(&task_id).await.unwrap();
        (store, task_id, dir)
    }

    #[tokio::test]
    async fn round_trips_pieces_in_order() {
        let (store, task_id, _dir) = store_with_task().await;
        let (p0, d0) = piece(0, 0, b"0123456789");
        let (p1, d1) = piece(1, 10, b"abcde");

        // store out of order; offsets keep the file coherent
        store.store_piece(&task_id, &p1, d1).await.unwrap();
        store.store_piece(&task_id, &p0, d0).await.unwrap();

        assert_eq!(
            store.read_piece(&task_id, 0, None).await.unwrap().as_ref(),
            b"0123456789"
        );
        assert_eq!(
            store.read_piece(&task_id, 1, None).await.unwrap().as_ref(),
            b"abcde"
        );
        assert_eq!(store.finished_count(&task_id).await, 2);
    }

    #[tokio::test]
    async fn duplicate_store_is_a_noop() {
        let (store, task_id, _dir) = store_with_task().await;
        let (p0, d0) = piece(0, 0, b"same-bytes");
        assert_eq!(
            store.store_piece(&task_id, &p0, d0.clone()).await.unwrap(),
            10
        );
        assert_eq!(store.store_piece(&task_id, &p0, d0).await.unwrap(), 10);
        assert_eq!(store.finished_count(&task_id).await, 1);
    }

    #[tokio::test]
    async fn ranged_read_within_piece() {
        let (store, task_id, _dir) = store_with_task().await;
        let (p0, d0) = piece(0, 0, b"hello world");
        store.store_piece(&task_id, &p0, d0).await.unwrap();

        let slice = store.read_piece(&task_id, 0, Some(6..11)).await.unwrap();
        assert_eq!(slice.as_ref(), b"world");

        let err = store.read_piece(&task_id, 0, Some(6..100)).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidPiece { .. }));
    }

    #[tokio::test]
    async fn body_length_must_match_descriptor() {
        let (store, task_id, _dir) = store_with_task().await;
        let (mut p0, d0) = piece(0, 0, b"0123456789");
        p0.range_size = 4;
        let err = store.store_piece(&task_id, &p0, d0).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidPiece { .. }));
    }

    #[tokio::test]
    async fn wait_piece_wakes_on_store() {
        let (store, task_id, _dir) = store_with_task().await;
        let store = Arc::new(store);

        let waiter = {
            let store = store.clone();
            let task_id = task_id.clone();
            tokio::spawn(async move { store.wait_piece(&task_id, 0).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        let (p0, d0) = piece(0, 0, b"late piece");
        store.store_piece(&task_id, &p0, d0).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn metadata_is_write_once() {
        let (store, task_id, _dir) = store_with_task().await;
        store
            .update_task(
                &task_id,
                TaskMetadata {
                    content_length: Some(15),
                    total_pieces: Some(2),
                    piece_size: Some(10),
                    piece_md5_sign: None,
                },
            )
            .await
            .unwrap();

        // same values merge fine
        store
            .update_task(
                &task_id,
                TaskMetadata {
                    content_length: Some(15),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let err = store
            .update_task(
                &task_id,
                TaskMetadata {
                    content_length: Some(99),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::MetadataConflict { .. }));
    }

    #[tokio::test]
    async fn validate_digest_checks_recorded_sign() {
        let (store, task_id, _dir) = store_with_task().await;
        let (p0, d0) = piece(0, 0, b"0123456789");
        let (p1, d1) = piece(1, 10, b"abcde");
        let sign = piece_md5_sign([&p0.md5, &p1.md5]);

        store.store_piece(&task_id, &p0, d0).await.unwrap();
        store.store_piece(&task_id, &p1, d1).await.unwrap();
        store
            .update_task(
                &task_id,
                TaskMetadata {
                    content_length: Some(15),
                    total_pieces: Some(2),
                    piece_size: Some(10),
                    piece_md5_sign: Some(sign),
                },
            )
            .await
            .unwrap();

        store.validate_digest(&task_id).await.unwrap();
    }

    #[tokio::test]
    async fn validate_digest_rejects_wrong_sign() {
        let (store, task_id, _dir) = store_with_task().await;
        let (p0, d0) = piece(0, 0, b"0123456789");
        store.store_piece(&task_id, &p0, d0).await.unwrap();
        store
            .update_task(
                &task_id,
                TaskMetadata {
                    total_pieces: Some(1),
                    piece_md5_sign: Some("not-the-right-sign".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let err = store.validate_digest(&task_id).await.unwrap_err();
        assert!(matches!(err, StorageError::DigestMismatch { .. }));
    }

    #[tokio::test]
    async fn validate_digest_records_sign_for_first_completer() {
        let (store, task_id, _dir) = store_with_task().await;
        let (p0, d0) = piece(0, 0, b"origin-only");
        store.store_piece(&task_id, &p0, d0).await.unwrap();
        store
            .update_task(
                &task_id,
                TaskMetadata {
                    total_pieces: Some(1),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        store.validate_digest(&task_id).await.unwrap();
        let meta = store.task_metadata(&task_id).await.unwrap();
        assert_eq!(
            meta.piece_md5_sign,
            Some(piece_md5_sign([md5_hex(b"origin-only")]))
        );
    }

    #[tokio::test]
    async fn invalidation_blocks_reads_and_completion() {
        let (store, task_id, _dir) = store_with_task().await;
        let (p0, d0) = piece(0, 0, b"bad content");
        store.store_piece(&task_id, &p0, d0).await.unwrap();
        store
            .update_task(
                &task_id,
                TaskMetadata {
                    total_pieces: Some(1),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(store.is_complete(&task_id).await);

        store.invalidate(&task_id).await;
        assert!(store.is_invalid(&task_id).await);
        assert!(!store.is_complete(&task_id).await);
        let err = store.read_piece(&task_id, 0, None).await.unwrap_err();
        assert!(matches!(err, StorageError::Invalidated { .. }));
    }

    #[tokio::test]
    async fn unknown_task_is_reported() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        let task_id = TaskId::new("missing");
        let err = store.task_metadata(&task_id).await.unwrap_err();
        assert!(matches!(err, StorageError::TaskNotFound { .. }));
        assert!(!store.has_piece(&task_id, 0).await);
    }
}
