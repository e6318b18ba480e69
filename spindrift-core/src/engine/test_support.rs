//! Hand-written mocks over the engine's capability traits.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as SyncMutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::SpindriftConfig;
use crate::scheduler::{
    PeerPacket, PeerResult, PieceResult, PieceResultSink, PeerPacketSource, RegisterRequest,
    RegisterResult, SchedulerChannel, SchedulerClient, SchedulerError,
};
use crate::source::{
    ExpireInfo, OriginClient, SourceError, SourceRegistry, SourceRequest, SourceResponse,
};
use crate::storage::{FileStore, PieceStore};
use crate::task::digest::{md5_hex, piece_md5_sign};
use crate::task::{
    ErrorCode, PeerHost, PeerId, PieceInfo, PiecePacket, PieceStyle, PieceTaskRequest, RemotePeer,
    SizeScope, TaskId,
};
use crate::transfer::{DownloadPieceRequest, FetchError, PieceFetcher, PieceTaskClient};

use super::TaskManager;

pub(crate) fn test_peer(name: &str) -> RemotePeer {
    RemotePeer {
        peer_id: PeerId::new(name),
        host: PeerHost {
            ip: "127.0.0.1".to_string(),
            rpc_port: 65000,
            download_port: 65002,
        },
        is_cdn: false,
    }
}

/// Deterministic test content.
pub(crate) fn test_content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

/// Slices content into piece descriptors.
pub(crate) fn pieces_of(content: &[u8], piece_size: u32) -> Vec<PieceInfo> {
    let mut pieces = Vec::new();
    let mut start = 0usize;
    let mut num = 0u32;
    while start < content.len() {
        let end = (start + piece_size as usize).min(content.len());
        pieces.push(PieceInfo {
            num,
            range_start: start as u64,
            range_size: (end - start) as u32,
            md5: md5_hex(&content[start..end]),
            style: PieceStyle::Plain,
        });
        start = end;
        num += 1;
    }
    pieces
}

pub(crate) fn sign_of(pieces: &[PieceInfo]) -> String {
    piece_md5_sign(pieces.iter().map(|p| p.md5.as_str()))
}

// ---- scheduler mock -------------------------------------------------------

struct ChannelSink {
    tx: tokio::sync::mpsc::UnboundedSender<PieceResult>,
}

#[async_trait]
impl PieceResultSink for ChannelSink {
    async fn send(&mut self, result: PieceResult) -> Result<(), SchedulerError> {
        let _ = self.tx.send(result);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SchedulerError> {
        Ok(())
    }
}

struct ChannelSource {
    rx: tokio::sync::mpsc::UnboundedReceiver<Result<PeerPacket, SchedulerError>>,
}

#[async_trait]
impl PeerPacketSource for ChannelSource {
    async fn recv(&mut self) -> Result<PeerPacket, SchedulerError> {
        match self.rx.recv().await {
            Some(result) => result,
            None => Err(SchedulerError::Closed),
        }
    }
}

/// Handles the test holds onto one scripted stream.
pub(crate) struct StreamScript {
    /// Feed directives (or errors) to the conductor.
    pub packets: tokio::sync::mpsc::UnboundedSender<Result<PeerPacket, SchedulerError>>,
    /// Observe every piece result the conductor reports.
    pub results: tokio::sync::mpsc::UnboundedReceiver<PieceResult>,
}

pub(crate) struct MockScheduler {
    register_result: SyncMutex<Option<RegisterResult>>,
    streams: SyncMutex<VecDeque<SchedulerChannel>>,
    pub register_calls: AtomicUsize,
    pub open_calls: AtomicUsize,
    peer_results: SyncMutex<Vec<PeerResult>>,
}

impl MockScheduler {
    pub(crate) fn new() -> Self {
        Self {
            register_result: SyncMutex::new(None),
            streams: SyncMutex::new(VecDeque::new()),
            register_calls: AtomicUsize::new(0),
            open_calls: AtomicUsize::new(0),
            peer_results: SyncMutex::new(Vec::new()),
        }
    }

    pub(crate) fn with_register_result(self, result: RegisterResult) -> Self {
        *self.register_result.lock().unwrap() = Some(result);
        self
    }

    /// Queues one scripted stream and returns the test-side handles.
    pub(crate) fn script_stream(&self) -> StreamScript {
        let (packet_tx, packet_rx) = tokio::sync::mpsc::unbounded_channel();
        let (result_tx, result_rx) = tokio::sync::mpsc::unbounded_channel();
        self.streams.lock().unwrap().push_back(SchedulerChannel {
            sink: Box::new(ChannelSink { tx: result_tx }),
            source: Box::new(ChannelSource { rx: packet_rx }),
        });
        StreamScript {
            packets: packet_tx,
            results: result_rx,
        }
    }

    pub(crate) fn peer_results(&self) -> Vec<PeerResult> {
        self.peer_results.lock().unwrap().clone()
    }
}

#[async_trait]
impl SchedulerClient for MockScheduler {
    async fn register_peer_task(
        &self,
        req: &RegisterRequest,
    ) -> Result<RegisterResult, SchedulerError> {
        self.register_calls.fetch_add(1, Ordering::SeqCst);
        let template = self.register_result.lock().unwrap().clone();
        let mut result = template.unwrap_or(RegisterResult {
            task_id: req.task_id.clone(),
            size_scope: SizeScope::Normal,
            direct_piece: None,
        });
        result.task_id = req.task_id.clone();
        Ok(result)
    }

    async fn open_stream(
        &self,
        _req: &RegisterRequest,
    ) -> Result<SchedulerChannel, SchedulerError> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        self.streams
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(SchedulerError::Transport {
                reason: "no scripted stream".to_string(),
            })
    }

    async fn report_peer_result(&self, result: PeerResult) -> Result<(), SchedulerError> {
        self.peer_results.lock().unwrap().push(result);
        Ok(())
    }
}

/// Builds a success directive naming `main` (and optional steals).
pub(crate) fn directive(task_id: &TaskId, main: RemotePeer, steals: Vec<RemotePeer>) -> PeerPacket {
    PeerPacket {
        code: ErrorCode::Success,
        task_id: task_id.clone(),
        src_pid: PeerId::new("scheduler"),
        parallel_count: 4,
        main_peer: Some(main),
        steal_peers: steals,
    }
}

// ---- piece metadata mock --------------------------------------------------

pub(crate) enum AdvertiseMode {
    /// Advertise every piece as soon as it is asked for.
    All,
    /// Only ever advertise piece 0, like a peer still streaming from its
    /// own source.
    FirstOnly,
}

pub(crate) struct MockPieceTasks {
    pieces: Vec<PieceInfo>,
    content_length: i64,
    sign: String,
    mode: AdvertiseMode,
}

impl MockPieceTasks {
    pub(crate) fn new(content: &[u8], piece_size: u32, mode: AdvertiseMode) -> Self {
        let pieces = pieces_of(content, piece_size);
        Self {
            content_length: content.len() as i64,
            sign: sign_of(&pieces),
            pieces,
            mode,
        }
    }
}

#[async_trait]
impl PieceTaskClient for MockPieceTasks {
    async fn piece_packet(
        &self,
        peer: &RemotePeer,
        req: &PieceTaskRequest,
    ) -> Result<PiecePacket, FetchError> {
        let infos: Vec<PieceInfo> = match self.mode {
            AdvertiseMode::All => self
                .pieces
                .iter()
                .skip(req.start_num as usize)
                .take(req.limit as usize)
                .cloned()
                .collect(),
            AdvertiseMode::FirstOnly => {
                if req.start_num == 0 {
                    self.pieces.iter().take(1).cloned().collect()
                } else {
                    Vec::new()
                }
            }
        };
        Ok(PiecePacket {
            dst_peer: Some(peer.peer_id.clone()),
            piece_infos: infos,
            total_pieces: self.pieces.len() as i32,
            content_length: self.content_length,
            piece_md5_sign: Some(self.sign.clone()),
        })
    }
}

// ---- piece fetcher mock ---------------------------------------------------

pub(crate) enum FetchBehavior {
    /// Fail digest verification on every attempt.
    AlwaysCorrupt,
    /// Stall for the duration, then fail as unreachable.
    Hang(Duration),
}

pub(crate) struct MockFetcher {
    content: Vec<u8>,
    behaviors: SyncMutex<HashMap<u32, FetchBehavior>>,
}

impl MockFetcher {
    pub(crate) fn new(content: Vec<u8>) -> Self {
        Self {
            content,
            behaviors: SyncMutex::new(HashMap::new()),
        }
    }

    pub(crate) fn with_behavior(self, num: u32, behavior: FetchBehavior) -> Self {
        self.behaviors.lock().unwrap().insert(num, behavior);
        self
    }
}

#[async_trait]
impl PieceFetcher for MockFetcher {
    async fn download_piece(&self, req: &DownloadPieceRequest) -> Result<Bytes, FetchError> {
        let stall = {
            let behaviors = self.behaviors.lock().unwrap();
            match behaviors.get(&req.piece.num) {
                Some(FetchBehavior::AlwaysCorrupt) => {
                    return Err(FetchError::DigestMismatch {
                        expected: req.piece.md5.clone(),
                        actual: "corrupted".to_string(),
                    });
                }
                Some(FetchBehavior::Hang(duration)) => Some(*duration),
                None => None,
            }
        };
        if let Some(duration) = stall {
            tokio::time::sleep(duration).await;
            return Err(FetchError::ShortBody {
                expected: req.piece.range_size,
                actual: 0,
            });
        }
        let start = req.piece.range_start as usize;
        let end = start + req.piece.range_size as usize;
        Ok(Bytes::copy_from_slice(&self.content[start..end]))
    }
}

// ---- origin mock ----------------------------------------------------------

pub(crate) struct MockOrigin {
    content: Vec<u8>,
    pub downloads: AtomicUsize,
}

impl MockOrigin {
    pub(crate) fn new(content: Vec<u8>) -> Self {
        Self {
            content,
            downloads: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl OriginClient for MockOrigin {
    async fn content_length(&self, _req: &SourceRequest) -> Result<Option<u64>, SourceError> {
        Ok(Some(self.content.len() as u64))
    }

    async fn is_support_range(&self, _req: &SourceRequest) -> Result<bool, SourceError> {
        Ok(true)
    }

    async fn is_expired(
        &self,
        _req: &SourceRequest,
        _info: &ExpireInfo,
    ) -> Result<bool, SourceError> {
        Ok(false)
    }

    async fn download(&self, _req: &SourceRequest) -> Result<SourceResponse, SourceError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        Ok(SourceResponse {
            body: Box::new(std::io::Cursor::new(self.content.clone())),
            expire: ExpireInfo::default(),
        })
    }

    async fn last_modified(&self, _req: &SourceRequest) -> Result<Option<i64>, SourceError> {
        Ok(None)
    }
}

// ---- wiring ---------------------------------------------------------------

/// Test config with tight timings.
pub(crate) fn test_config() -> SpindriftConfig {
    let mut config = SpindriftConfig::default();
    config.scheduler.poll_interval = Duration::from_millis(10);
    config.scheduler.poll_interval_max = Duration::from_millis(50);
    config.scheduler.piece_ready_timeout = Duration::from_secs(5);
    config.download.piece_retry_limit = 2;
    config
}

pub(crate) struct TestHarness {
    pub manager: Arc<TaskManager>,
    pub store: Arc<dyn PieceStore>,
    pub sources: Arc<SourceRegistry>,
    _data_dir: tempfile::TempDir,
}

/// Wires a manager from the given mocks over a temp-dir file store.
pub(crate) fn harness(
    scheduler: Arc<MockScheduler>,
    fetcher: Arc<MockFetcher>,
    piece_tasks: Arc<MockPieceTasks>,
) -> TestHarness {
    let data_dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn PieceStore> = Arc::new(FileStore::new(data_dir.path()).unwrap());
    let sources = Arc::new(SourceRegistry::new());
    let manager = Arc::new(TaskManager::new(
        test_config(),
        PeerHost {
            ip: "127.0.0.1".to_string(),
            rpc_port: 0,
            download_port: 0,
        },
        store.clone(),
        fetcher,
        piece_tasks,
        scheduler,
        sources.clone(),
    ));
    TestHarness {
        manager,
        store,
        sources,
        _data_dir: data_dir,
    }
}
