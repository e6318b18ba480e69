//! The per-task state machine driving piece discovery, fetching, reporting
//! and the origin fallback.

use std::collections::HashSet;
use std::sync::Mutex as SyncMutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use rand::Rng;
use tokio::io::AsyncReadExt;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, info, warn};

use super::TaskPhase;
use crate::config::{DownloadConfig, SchedulerConfig, SpindriftConfig};
use crate::scheduler::{
    DirectPiece, PeerPacket, PeerResult, PieceResult, RegisterRequest, SchedulerChannel,
    SchedulerClient, unix_nanos,
};
use crate::source::{SourceRegistry, SourceRequest};
use crate::storage::{PieceStore, StorageError, TaskMetadata};
use crate::task::digest::md5_hex;
use crate::task::{
    ErrorCode, PeerId, PieceInfo, PiecePacket, PieceStyle, PieceTaskRequest, RemotePeer, SizeScope,
    TaskId, compute_piece_size, total_piece_count,
};
use crate::transfer::{DownloadPieceRequest, PieceFetcher, PieceTaskClient};

const PIECE_TASK_LIMIT: u32 = 16;

/// Piece sources named by the most recent usable directive.
#[derive(Debug, Clone)]
pub(crate) struct PeerSelection {
    pub(crate) parallel_count: u32,
    pub(crate) main: RemotePeer,
    pub(crate) steals: Vec<RemotePeer>,
}

/// Piece geometry once discovery (or back-source) fixed it.
#[derive(Debug, Clone)]
pub(crate) struct TaskLayout {
    pub(crate) piece_size: u32,
    pub(crate) content_length: Option<u64>,
    pub(crate) total_pieces: Option<u32>,
}

#[derive(Debug)]
struct PieceJob {
    piece: PieceInfo,
    attempts: u32,
}

enum Outbound {
    Result(PieceResult),
    Close,
}

/// One running download task.
pub(crate) struct TaskConductor {
    task_id: TaskId,
    peer_id: PeerId,
    register: RegisterRequest,
    download_cfg: DownloadConfig,
    scheduler_cfg: SchedulerConfig,

    store: Arc<dyn PieceStore>,
    fetcher: Arc<dyn PieceFetcher>,
    piece_tasks: Arc<dyn PieceTaskClient>,
    scheduler: Arc<dyn SchedulerClient>,
    sources: Arc<SourceRegistry>,

    phase: watch::Sender<TaskPhase>,
    peers: watch::Sender<Option<PeerSelection>>,
    layout: watch::Sender<Option<TaskLayout>>,

    outbound: mpsc::UnboundedSender<Outbound>,
    outbound_rx: SyncMutex<Option<mpsc::UnboundedReceiver<Outbound>>>,
    queue_tx: mpsc::UnboundedSender<PieceJob>,
    queue_rx: Mutex<mpsc::UnboundedReceiver<PieceJob>>,

    claimed: SyncMutex<HashSet<u32>>,
    next_discover: AtomicU32,
    steal_cursor: AtomicUsize,
    attached: AtomicUsize,
    back_source_started: AtomicBool,
    completion_started: AtomicBool,
    started_at: Instant,
}

impl TaskConductor {
    pub(crate) fn new(
        register: RegisterRequest,
        config: &SpindriftConfig,
        store: Arc<dyn PieceStore>,
        fetcher: Arc<dyn PieceFetcher>,
        piece_tasks: Arc<dyn PieceTaskClient>,
        scheduler: Arc<dyn SchedulerClient>,
        sources: Arc<SourceRegistry>,
    ) -> Self {
        let (phase, _) = watch::channel(TaskPhase::Init);
        let (peers, _) = watch::channel(None);
        let (layout, _) = watch::channel(None);
        let (outbound, outbound_recv) = mpsc::unbounded_channel();
        let (queue_tx, queue_recv) = mpsc::unbounded_channel();

        Self {
            task_id: register.task_id.clone(),
            peer_id: register.peer_id.clone(),
            register,
            download_cfg: config.download.clone(),
            scheduler_cfg: config.scheduler.clone(),
            store,
            fetcher,
            piece_tasks,
            scheduler,
            sources,
            phase,
            peers,
            layout,
            outbound,
            outbound_rx: SyncMutex::new(Some(outbound_recv)),
            queue_tx,
            queue_rx: Mutex::new(queue_recv),
            claimed: SyncMutex::new(HashSet::new()),
            next_discover: AtomicU32::new(0),
            steal_cursor: AtomicUsize::new(0),
            attached: AtomicUsize::new(0),
            back_source_started: AtomicBool::new(false),
            completion_started: AtomicBool::new(false),
            started_at: Instant::now(),
        }
    }

    pub(crate) fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub(crate) fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub(crate) fn phase_receiver(&self) -> watch::Receiver<TaskPhase> {
        self.phase.subscribe()
    }

    /// Registers a reader against this conductor.
    pub(crate) fn attach(&self) {
        self.attached.fetch_add(1, Ordering::SeqCst);
    }

    /// Deregisters a reader; the last reader detaching from a live task
    /// cancels it and tears resources down.
    pub(crate) fn detach(self: Arc<Self>) {
        if self.attached.fetch_sub(1, Ordering::SeqCst) == 1
            && !self.phase.borrow().is_terminal()
        {
            let conductor = self.clone();
            tokio::spawn(async move {
                conductor
                    .fail_task(
                        ErrorCode::ClientPieceRequestFail,
                        "all readers detached".to_string(),
                    )
                    .await;
            });
        }
    }

    /// Drives the task to a terminal phase.
    pub(crate) async fn run(self: Arc<Self>) {
        if let Err(err) = self.store.register_task(&self.task_id).await {
            self.fail_task(
                ErrorCode::ClientPieceRequestFail,
                format!("store registration failed: {err}"),
            )
            .await;
            return;
        }

        let registration = match self.scheduler.register_peer_task(&self.register).await {
            Ok(result) => result,
            Err(err) if err.is_back_source() => {
                info!("task {} directed to back-source at registration", self.task_id);
                self.phase.send_replace(TaskPhase::Running);
                self.clone().trigger_back_source();
                self.wait_terminal().await;
                return;
            }
            Err(err) => {
                self.fail_task(
                    ErrorCode::ClientPieceRequestFail,
                    format!("registration failed: {err}"),
                )
                .await;
                return;
            }
        };
        debug!(
            "task {} registered with scope {:?}",
            self.task_id, registration.size_scope
        );

        match registration.size_scope {
            SizeScope::Tiny => match registration.direct_piece {
                Some(DirectPiece::Content(content)) => self.clone().run_tiny(content).await,
                _ => {
                    self.fail_task(
                        ErrorCode::ClientPieceRequestFail,
                        "tiny scope reply carried no content".to_string(),
                    )
                    .await;
                }
            },
            SizeScope::Small => match registration.direct_piece {
                Some(DirectPiece::SinglePiece { peer, piece }) => {
                    if self.clone().run_small(peer, piece).await {
                        return;
                    }
                    // direct fetch failed; fall back to the full protocol
                    self.run_normal().await;
                }
                _ => self.run_normal().await,
            },
            SizeScope::Normal => self.run_normal().await,
        }
    }

    async fn run_tiny(self: Arc<Self>, content: Bytes) {
        self.phase.send_replace(TaskPhase::Running);
        let piece = PieceInfo {
            num: 0,
            range_start: 0,
            range_size: content.len() as u32,
            md5: md5_hex(&content),
            style: PieceStyle::Plain,
        };
        let piece_size = compute_piece_size(content.len() as i64);
        if let Err(err) = self.store_direct(piece, content, piece_size).await {
            self.fail_task(
                ErrorCode::ClientPieceDownloadFail,
                format!("storing embedded content failed: {err}"),
            )
            .await;
            return;
        }
        self.complete_task().await;
    }

    /// Fetches the single piece of a small-scope task from the named peer.
    /// Returns false when the fetch failed and the caller should fall back
    /// to the full protocol.
    async fn run_small(self: Arc<Self>, peer: RemotePeer, piece: PieceInfo) -> bool {
        self.phase.send_replace(TaskPhase::Running);
        let request = DownloadPieceRequest {
            task_id: self.task_id.clone(),
            src_peer_id: self.peer_id.clone(),
            dst_peer_id: peer.peer_id.clone(),
            dst_addr: peer.download_addr(),
            piece: piece.clone(),
            calc_digest: self.download_cfg.calculate_digest,
        };
        let body = match self.fetcher.download_piece(&request).await {
            Ok(body) => body,
            Err(err) => {
                warn!(
                    "task {} direct piece fetch from {} failed: {err}",
                    self.task_id, peer.peer_id
                );
                return false;
            }
        };
        let piece_size = piece.range_size.max(1);
        if let Err(err) = self.store_direct(piece, body, piece_size).await {
            self.fail_task(
                ErrorCode::ClientPieceDownloadFail,
                format!("storing direct piece failed: {err}"),
            )
            .await;
            return true;
        }
        self.complete_task().await;
        true
    }

    async fn store_direct(
        &self,
        piece: PieceInfo,
        body: Bytes,
        piece_size: u32,
    ) -> Result<(), StorageError> {
        let content_length = piece.range_size as u64;
        self.store.store_piece(&self.task_id, &piece, body).await?;
        self.store
            .update_task(
                &self.task_id,
                TaskMetadata {
                    content_length: Some(content_length),
                    total_pieces: Some(1),
                    piece_size: Some(piece_size),
                    piece_md5_sign: None,
                },
            )
            .await?;
        self.layout.send_replace(Some(TaskLayout {
            piece_size,
            content_length: Some(content_length),
            total_pieces: Some(1),
        }));
        Ok(())
    }

    async fn run_normal(self: Arc<Self>) {
        let channel = match self.scheduler.open_stream(&self.register).await {
            Ok(channel) => channel,
            Err(err) if err.is_back_source() => {
                self.phase.send_replace(TaskPhase::Running);
                self.clone().trigger_back_source();
                self.wait_terminal().await;
                return;
            }
            Err(err) => {
                self.fail_task(
                    ErrorCode::SchedPeerGone,
                    format!("opening scheduler stream failed: {err}"),
                )
                .await;
                return;
            }
        };

        self.phase.send_replace(TaskPhase::Running);
        tokio::spawn(self.clone().stream_actor(channel));
        tokio::spawn(self.clone().discovery());

        // the worker pool is sized by the first directive
        let parallel = match self.first_parallel_count().await {
            Some(parallel) => parallel,
            None => {
                self.wait_terminal().await;
                return;
            }
        };
        for _ in 0..parallel {
            tokio::spawn(self.clone().worker());
        }

        self.wait_terminal().await;
    }

    async fn wait_terminal(&self) {
        let mut phase_rx = self.phase.subscribe();
        let _ = phase_rx.wait_for(TaskPhase::is_terminal).await;
    }

    /// Waits for the first directive and returns the worker pool size, or
    /// None when the task left the running phase first.
    async fn first_parallel_count(&self) -> Option<u32> {
        let mut peers_rx = self.peers.subscribe();
        let mut phase_rx = self.phase.subscribe();
        loop {
            {
                let selection = peers_rx.borrow_and_update();
                if let Some(selection) = selection.as_ref() {
                    let suggested = selection.parallel_count;
                    return Some(if suggested == 0 {
                        self.download_cfg.default_parallel_count
                    } else {
                        suggested
                    });
                }
            }
            tokio::select! {
                changed = peers_rx.changed() => changed.ok()?,
                _ = phase_rx.wait_for(|p| !matches!(p, TaskPhase::Running)) => return None,
            }
        }
    }

    // ---- scheduler stream actor ------------------------------------------

    /// Owns both stream halves: serialises outbound reports and drains
    /// inbound directives, re-opening the stream on transport errors up to
    /// the configured budget.
    async fn stream_actor(self: Arc<Self>, mut channel: SchedulerChannel) {
        enum Event {
            Out(Option<Outbound>),
            In(Result<PeerPacket, crate::scheduler::SchedulerError>),
            PhaseChanged,
        }

        let mut outbound_rx = self
            .outbound_rx
            .lock()
            .expect("outbound receiver poisoned")
            .take()
            .expect("stream actor started twice");
        let mut phase_rx = self.phase.subscribe();
        let mut reopen_budget = self.scheduler_cfg.stream_reopen_limit;
        let mut receiving = true;

        loop {
            let event = tokio::select! {
                biased;
                maybe = outbound_rx.recv() => Event::Out(maybe),
                result = channel.source.recv(), if receiving => Event::In(result),
                _ = phase_rx.changed() => Event::PhaseChanged,
            };

            match event {
                Event::Out(Some(Outbound::Result(result))) => {
                    if let Err(err) = channel.sink.send(result).await {
                        warn!("task {} piece result send failed: {err}", self.task_id);
                    }
                }
                Event::Out(Some(Outbound::Close)) | Event::Out(None) => {
                    let _ = channel.sink.close().await;
                    break;
                }
                Event::In(Ok(packet)) => {
                    if packet.code == ErrorCode::SchedNeedBackSource {
                        self.clone().trigger_back_source();
                        receiving = false;
                    } else {
                        self.handle_packet(packet);
                    }
                }
                Event::In(Err(err)) if err.is_back_source() => {
                    info!("task {} directed to back-source", self.task_id);
                    self.clone().trigger_back_source();
                    // the directive ends the inbound side; keep forwarding
                    // back-source piece results on the outbound side
                    receiving = false;
                }
                Event::In(Err(err)) => {
                    if reopen_budget == 0 {
                        self.fail_task(
                            ErrorCode::SchedPeerGone,
                            format!("scheduler stream failed: {err}"),
                        )
                        .await;
                        break;
                    }
                    reopen_budget -= 1;
                    debug!(
                        "task {} re-opening scheduler stream after: {err}",
                        self.task_id
                    );
                    match self.scheduler.open_stream(&self.register).await {
                        Ok(fresh) => channel = fresh,
                        Err(reopen_err) if reopen_err.is_back_source() => {
                            self.clone().trigger_back_source();
                            receiving = false;
                        }
                        Err(reopen_err) => {
                            self.fail_task(
                                ErrorCode::SchedPeerGone,
                                format!("scheduler stream re-open failed: {reopen_err}"),
                            )
                            .await;
                            break;
                        }
                    }
                }
                Event::PhaseChanged => {
                    if self.phase.borrow().is_terminal() {
                        let _ = channel.sink.close().await;
                        break;
                    }
                }
            }
        }
    }

    fn handle_packet(&self, packet: PeerPacket) {
        if !packet.code.is_success() {
            debug!(
                "task {} unusable directive with code {}",
                self.task_id, packet.code
            );
            return;
        }
        let Some(main) = packet.main_peer else {
            debug!("task {} directive without a main peer", self.task_id);
            return;
        };
        debug!(
            "task {} new directive: main {} with {} steal peers",
            self.task_id,
            main.peer_id,
            packet.steal_peers.len()
        );
        self.peers.send_replace(Some(PeerSelection {
            parallel_count: packet.parallel_count,
            main,
            steals: packet.steal_peers,
        }));
    }

    // ---- piece discovery --------------------------------------------------

    /// Polls the current main peer for piece metadata until every piece is
    /// claimed, backing off while the peer has nothing new.
    async fn discovery(self: Arc<Self>) {
        let mut peers_rx = self.peers.subscribe();
        let mut phase_rx = self.phase.subscribe();

        'directive: loop {
            // latch the current main peer, or wait for a directive
            let main = loop {
                if !matches!(&*self.phase.borrow(), TaskPhase::Init | TaskPhase::Running) {
                    return;
                }
                let current = peers_rx.borrow_and_update().as_ref().map(|s| s.main.clone());
                if let Some(main) = current {
                    break main;
                }
                tokio::select! {
                    changed = peers_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    _ = phase_rx.wait_for(|p| !matches!(p, TaskPhase::Init | TaskPhase::Running)) => return,
                }
            };

            let mut backoff = self.scheduler_cfg.poll_interval;
            let deadline = Instant::now() + self.scheduler_cfg.piece_ready_timeout;

            loop {
                if !matches!(&*self.phase.borrow(), TaskPhase::Running) {
                    return;
                }
                let request = PieceTaskRequest {
                    task_id: self.task_id.clone(),
                    start_num: self.next_discover.load(Ordering::SeqCst),
                    limit: PIECE_TASK_LIMIT,
                };
                let progressed = match self.piece_tasks.piece_packet(&main, &request).await {
                    Ok(packet) => {
                        let got_pieces = !packet.piece_infos.is_empty();
                        if let Err(err) = self.absorb_packet(packet).await {
                            self.fail_task(
                                ErrorCode::ClientPieceDownloadFail,
                                format!("recording piece metadata failed: {err}"),
                            )
                            .await;
                            return;
                        }
                        if self.discovery_done() {
                            debug!("task {} discovery complete", self.task_id);
                            return;
                        }
                        got_pieces
                    }
                    Err(err) => {
                        warn!(
                            "task {} piece metadata poll against {} failed: {err}",
                            self.task_id, main.peer_id
                        );
                        self.send_piece_result(self.bare_result(
                            ErrorCode::ClientPieceRequestFail,
                            Some(&main.peer_id),
                        ));
                        false
                    }
                };

                if progressed {
                    backoff = self.scheduler_cfg.poll_interval;
                    continue;
                }

                if Instant::now() >= deadline {
                    // the peer stayed quiet for the whole budget; tell the
                    // scheduler and wait for a different directive
                    info!(
                        "task {} gave up waiting for pieces from {}",
                        self.task_id, main.peer_id
                    );
                    self.send_piece_result(
                        self.bare_result(ErrorCode::ClientWaitPieceReady, Some(&main.peer_id)),
                    );
                    tokio::select! {
                        changed = peers_rx.changed() => {
                            if changed.is_err() {
                                return;
                            }
                            continue 'directive;
                        }
                        _ = phase_rx.wait_for(|p| !matches!(p, TaskPhase::Running)) => return,
                    }
                }

                let jitter = rand::thread_rng().gen_range(0.75..1.25);
                tokio::time::sleep(backoff.mul_f64(jitter)).await;
                backoff = (backoff * 2).min(self.scheduler_cfg.poll_interval_max);
            }
        }
    }

    /// Folds a piece packet into layout, store metadata and the work queue.
    async fn absorb_packet(&self, packet: PiecePacket) -> Result<(), StorageError> {
        let current = self.layout.borrow().clone();
        let layout = match current {
            Some(mut layout) => {
                let mut changed = false;
                if layout.content_length.is_none() && packet.content_length >= 0 {
                    layout.content_length = Some(packet.content_length as u64);
                    changed = true;
                }
                if layout.total_pieces.is_none() && packet.total_pieces >= 0 {
                    layout.total_pieces = Some(packet.total_pieces as u32);
                    changed = true;
                }
                if changed {
                    self.layout.send_replace(Some(layout.clone()));
                }
                Some(layout)
            }
            None if !packet.piece_infos.is_empty() || packet.content_length >= 0 => {
                // first observation fixes the piece size
                let piece_size = packet
                    .piece_infos
                    .first()
                    .map(|p| p.range_size)
                    .unwrap_or_else(|| compute_piece_size(packet.content_length));
                let layout = TaskLayout {
                    piece_size,
                    content_length: (packet.content_length >= 0)
                        .then_some(packet.content_length as u64),
                    total_pieces: (packet.total_pieces >= 0)
                        .then_some(packet.total_pieces as u32),
                };
                self.layout.send_replace(Some(layout.clone()));
                Some(layout)
            }
            None => None,
        };

        if let Some(layout) = &layout {
            self.store
                .update_task(
                    &self.task_id,
                    TaskMetadata {
                        content_length: layout.content_length,
                        total_pieces: layout.total_pieces,
                        piece_size: Some(layout.piece_size),
                        piece_md5_sign: packet.piece_md5_sign.clone(),
                    },
                )
                .await?;
        }

        for piece in packet.piece_infos {
            let fresh = {
                let mut claimed = self.claimed.lock().expect("claimed set poisoned");
                claimed.insert(piece.num)
            };
            if fresh {
                let next = piece.num + 1;
                self.next_discover.fetch_max(next, Ordering::SeqCst);
                let _ = self.queue_tx.send(PieceJob { piece, attempts: 0 });
            }
        }

        // a late total can arrive after the final piece was stored
        if let Some(total) = layout.as_ref().and_then(|l| l.total_pieces) {
            if self.store.finished_count(&self.task_id).await == total {
                self.complete_task().await;
            }
        }
        Ok(())
    }

    fn discovery_done(&self) -> bool {
        let total = match self.layout.borrow().as_ref().and_then(|l| l.total_pieces) {
            Some(total) => total,
            None => return false,
        };
        let claimed = self.claimed.lock().expect("claimed set poisoned");
        claimed.len() as u32 >= total
    }

    // ---- piece fetch workers ---------------------------------------------

    async fn worker(self: Arc<Self>) {
        let mut phase_rx = self.phase.subscribe();
        loop {
            let job = {
                let mut queue = self.queue_rx.lock().await;
                tokio::select! {
                    job = queue.recv() => match job {
                        Some(job) => job,
                        None => return,
                    },
                    _ = phase_rx.wait_for(|p| !matches!(p, TaskPhase::Running)) => return,
                }
            };
            self.clone().process_job(job).await;
        }
    }

    async fn process_job(self: Arc<Self>, job: PieceJob) {
        // resolve a destination, waiting for a directive when none is live
        let selection = loop {
            if !matches!(&*self.phase.borrow(), TaskPhase::Running) {
                return;
            }
            let current = self.peers.borrow().clone();
            if let Some(selection) = current {
                break selection;
            }
            let mut peers_rx = self.peers.subscribe();
            let mut phase_rx = self.phase.subscribe();
            tokio::select! {
                _ = peers_rx.changed() => {}
                _ = phase_rx.wait_for(|p| !matches!(p, TaskPhase::Running)) => return,
            }
        };

        // first attempt goes to the main peer, retries rotate the steals
        let dest = if job.attempts == 0 || selection.steals.is_empty() {
            selection.main.clone()
        } else {
            let cursor = self.steal_cursor.fetch_add(1, Ordering::Relaxed);
            selection.steals[cursor % selection.steals.len()].clone()
        };

        let request = DownloadPieceRequest {
            task_id: self.task_id.clone(),
            src_peer_id: self.peer_id.clone(),
            dst_peer_id: dest.peer_id.clone(),
            dst_addr: dest.download_addr(),
            piece: job.piece.clone(),
            calc_digest: self.download_cfg.calculate_digest,
        };
        let begin = unix_nanos();

        match self.fetcher.download_piece(&request).await {
            Ok(body) => {
                if let Err(err) = self.store.store_piece(&self.task_id, &job.piece, body).await {
                    if matches!(err, StorageError::Invalidated { .. }) {
                        return;
                    }
                    self.fail_task(
                        ErrorCode::ClientPieceDownloadFail,
                        format!("storing piece {} failed: {err}", job.piece.num),
                    )
                    .await;
                    return;
                }
                let finished = self.store.finished_count(&self.task_id).await;
                self.send_piece_result(PieceResult {
                    task_id: self.task_id.clone(),
                    src_pid: self.peer_id.clone(),
                    dst_pid: Some(dest.peer_id.clone()),
                    piece_num: job.piece.num as i32,
                    piece: Some(job.piece.clone()),
                    success: true,
                    code: ErrorCode::Success,
                    begin_ns: begin,
                    finish_ns: unix_nanos(),
                    finished_count: finished,
                });
                debug!(
                    "task {} stored piece {} from {} ({finished} finished)",
                    self.task_id, job.piece.num, dest.peer_id
                );
                let total = self.layout.borrow().as_ref().and_then(|l| l.total_pieces);
                if total == Some(finished) {
                    self.complete_task().await;
                }
            }
            Err(err) => {
                let code = if err.is_retryable() {
                    ErrorCode::ClientPieceRequestFail
                } else {
                    ErrorCode::ClientPieceDownloadFail
                };
                warn!(
                    "task {} piece {} attempt {} against {} failed: {err}",
                    self.task_id,
                    job.piece.num,
                    job.attempts + 1,
                    dest.peer_id
                );
                let finished = self.store.finished_count(&self.task_id).await;
                self.send_piece_result(PieceResult {
                    task_id: self.task_id.clone(),
                    src_pid: self.peer_id.clone(),
                    dst_pid: Some(dest.peer_id.clone()),
                    piece_num: job.piece.num as i32,
                    piece: Some(job.piece.clone()),
                    success: false,
                    code,
                    begin_ns: begin,
                    finish_ns: unix_nanos(),
                    finished_count: finished,
                });

                if job.attempts < self.download_cfg.piece_retry_limit {
                    let _ = self.queue_tx.send(PieceJob {
                        piece: job.piece,
                        attempts: job.attempts + 1,
                    });
                } else if self.origin_reachable() {
                    warn!(
                        "task {} piece {} exhausted its retry budget, back-sourcing",
                        self.task_id, job.piece.num
                    );
                    self.clone().trigger_back_source();
                } else {
                    self.fail_task(
                        code,
                        format!(
                            "piece {} failed after {} attempts",
                            job.piece.num,
                            job.attempts + 1
                        ),
                    )
                    .await;
                }
            }
        }
    }

    fn origin_reachable(&self) -> bool {
        url::Url::parse(&self.register.url)
            .ok()
            .and_then(|url| self.sources.client_for(url.scheme()))
            .is_some()
    }

    // ---- back-source ------------------------------------------------------

    fn trigger_back_source(self: Arc<Self>) {
        if self.back_source_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let moved = self.phase.send_if_modified(|phase| {
            if phase.is_terminal() {
                false
            } else {
                *phase = TaskPhase::BackSourcing;
                true
            }
        });
        if !moved {
            return;
        }
        tokio::spawn(async move {
            if let Err((code, message)) = self.clone().back_source().await {
                self.fail_task(code, message).await;
            }
        });
    }

    /// Fetches every outstanding piece from the origin, consuming the
    /// origin stream in order and skipping ranges already stored.
    async fn back_source(self: Arc<Self>) -> Result<(), (ErrorCode, String)> {
        let mut source_req = SourceRequest::new(&self.register.url)
            .map_err(|err| (ErrorCode::BackSourceFail, format!("bad origin url: {err}")))?;
        source_req.headers.extend(self.register.url_meta.headers.clone());
        if let Some(range) = &self.register.url_meta.range {
            source_req
                .headers
                .insert("Range".to_string(), range.clone());
        }

        let client = self.sources.client(&source_req).map_err(|err| {
            (ErrorCode::BackSourceFail, format!("no origin client: {err}"))
        })?;

        // fix the layout from the origin when the overlay never did
        let current_layout = self.layout.borrow().clone();
        let layout = match current_layout {
            Some(layout) if layout.content_length.is_some() && layout.total_pieces.is_some() => {
                layout
            }
            partial => {
                let content_length = match partial.as_ref().and_then(|l| l.content_length) {
                    Some(len) => len,
                    None => client
                        .content_length(&source_req)
                        .await
                        .map_err(|err| {
                            (
                                ErrorCode::BackSourceFail,
                                format!("origin content length failed: {err}"),
                            )
                        })?
                        .ok_or_else(|| {
                            (
                                ErrorCode::BackSourceFail,
                                "origin did not report a content length".to_string(),
                            )
                        })?,
                };
                let piece_size = partial
                    .as_ref()
                    .map(|l| l.piece_size)
                    .unwrap_or_else(|| compute_piece_size(content_length as i64));
                let total = partial
                    .as_ref()
                    .and_then(|l| l.total_pieces)
                    .unwrap_or_else(|| total_piece_count(content_length, piece_size));
                let layout = TaskLayout {
                    piece_size,
                    content_length: Some(content_length),
                    total_pieces: Some(total),
                };
                self.layout.send_replace(Some(layout.clone()));
                layout
            }
        };
        let content_length = layout.content_length.unwrap_or(0);
        let piece_size = layout.piece_size;
        let total = layout
            .total_pieces
            .expect("back-source layout always fixes the piece count");

        self.store
            .update_task(
                &self.task_id,
                TaskMetadata {
                    content_length: Some(content_length),
                    total_pieces: Some(total),
                    piece_size: Some(piece_size),
                    piece_md5_sign: None,
                },
            )
            .await
            .map_err(|err| {
                (
                    ErrorCode::BackSourceFail,
                    format!("recording origin metadata failed: {err}"),
                )
            })?;

        info!(
            "task {} back-sourcing {total} pieces ({content_length} bytes)",
            self.task_id
        );
        let mut response = client.download(&source_req).await.map_err(|err| {
            (
                ErrorCode::BackSourceFail,
                format!("origin download failed: {err}"),
            )
        })?;

        for num in 0..total {
            let range_start = num as u64 * piece_size as u64;
            let range_size = (content_length - range_start).min(piece_size as u64) as u32;
            let mut buf = vec![0u8; range_size as usize];
            response
                .body
                .read_exact(&mut buf)
                .await
                .map_err(|err| {
                    (
                        ErrorCode::BackSourceFail,
                        format!("origin stream ended at piece {num}: {err}"),
                    )
                })?;

            if self.store.has_piece(&self.task_id, num).await {
                // already fetched from a peer; origin bytes were consumed
                // to keep the stream aligned, but are not re-stored
                debug!("task {} skipping stored piece {num}", self.task_id);
                continue;
            }

            let piece = PieceInfo {
                num,
                range_start,
                range_size,
                md5: md5_hex(&buf),
                style: PieceStyle::Plain,
            };
            let begin = unix_nanos();
            self.store
                .store_piece(&self.task_id, &piece, Bytes::from(buf))
                .await
                .map_err(|err| {
                    (
                        ErrorCode::BackSourceFail,
                        format!("storing origin piece {num} failed: {err}"),
                    )
                })?;
            let finished = self.store.finished_count(&self.task_id).await;
            self.send_piece_result(PieceResult {
                task_id: self.task_id.clone(),
                src_pid: self.peer_id.clone(),
                dst_pid: None,
                piece_num: num as i32,
                piece: Some(piece),
                success: true,
                code: ErrorCode::Success,
                begin_ns: begin,
                finish_ns: unix_nanos(),
                finished_count: finished,
            });
        }

        self.complete_task().await;
        Ok(())
    }

    // ---- completion and failure ------------------------------------------

    async fn complete_task(&self) {
        if self.completion_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let finished = self.store.finished_count(&self.task_id).await;
        let _ = self.outbound.send(Outbound::Result(PieceResult::end_of_task(
            self.task_id.clone(),
            self.peer_id.clone(),
            finished,
        )));
        let _ = self.outbound.send(Outbound::Close);

        match self.store.validate_digest(&self.task_id).await {
            Ok(()) => {
                let metadata = self.store.task_metadata(&self.task_id).await.ok();
                let _ = self
                    .scheduler
                    .report_peer_result(PeerResult {
                        task_id: self.task_id.clone(),
                        peer_id: self.peer_id.clone(),
                        success: true,
                        code: ErrorCode::Success,
                        content_length: metadata
                            .as_ref()
                            .and_then(|m| m.content_length)
                            .map(|l| l as i64)
                            .unwrap_or(-1),
                        total_pieces: metadata
                            .and_then(|m| m.total_pieces)
                            .map(|t| t as i32)
                            .unwrap_or(-1),
                        cost: self.started_at.elapsed(),
                    })
                    .await;
                info!("task {} succeeded with {finished} pieces", self.task_id);
                self.phase.send_if_modified(|phase| {
                    if phase.is_terminal() {
                        false
                    } else {
                        *phase = TaskPhase::Succeeded;
                        true
                    }
                });
            }
            Err(err) => {
                self.store.invalidate(&self.task_id).await;
                self.fail_task(
                    ErrorCode::ClientPieceDownloadFail,
                    format!("content validation failed: {err}"),
                )
                .await;
            }
        }
    }

    async fn fail_task(&self, code: ErrorCode, message: String) {
        let moved = self.phase.send_if_modified(|phase| {
            if phase.is_terminal() {
                false
            } else {
                *phase = TaskPhase::Failed {
                    code,
                    message: message.clone(),
                };
                true
            }
        });
        if !moved {
            return;
        }
        warn!("task {} failed with {code}: {message}", self.task_id);
        let _ = self.outbound.send(Outbound::Close);

        let metadata = self.store.task_metadata(&self.task_id).await.ok();
        let _ = self
            .scheduler
            .report_peer_result(PeerResult {
                task_id: self.task_id.clone(),
                peer_id: self.peer_id.clone(),
                success: false,
                code,
                content_length: metadata
                    .as_ref()
                    .and_then(|m| m.content_length)
                    .map(|l| l as i64)
                    .unwrap_or(-1),
                total_pieces: metadata
                    .and_then(|m| m.total_pieces)
                    .map(|t| t as i32)
                    .unwrap_or(-1),
                cost: self.started_at.elapsed(),
            })
            .await;
    }

    fn bare_result(&self, code: ErrorCode, dst: Option<&PeerId>) -> PieceResult {
        let now = unix_nanos();
        PieceResult {
            task_id: self.task_id.clone(),
            src_pid: self.peer_id.clone(),
            dst_pid: dst.cloned(),
            piece_num: crate::task::END_PIECE_NUM,
            piece: None,
            success: false,
            code,
            begin_ns: now,
            finish_ns: now,
            finished_count: 0,
        }
    }

    fn send_piece_result(&self, result: PieceResult) {
        if self.phase.borrow().is_terminal() {
            return;
        }
        let _ = self.outbound.send(Outbound::Result(result));
    }
}
