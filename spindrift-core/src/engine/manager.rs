//! Per-daemon registry of running conductors.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use super::conductor::TaskConductor;
use super::reader::TaskReader;
use super::{EngineError, TaskPhase};
use crate::config::SpindriftConfig;
use crate::scheduler::{RegisterRequest, SchedulerClient};
use crate::source::SourceRegistry;
use crate::storage::PieceStore;
use crate::task::{PeerHost, PeerId, TaskId, UrlMeta, fingerprint};
use crate::transfer::{PieceFetcher, PieceTaskClient};

/// Attribute key carrying the task id on stream responses.
pub const ATTR_TASK_ID: &str = "X-Dragonfly-Task";
/// Attribute key carrying the peer id on stream responses.
pub const ATTR_PEER_ID: &str = "X-Dragonfly-Peer";
/// Attribute key carrying the content length when known.
pub const ATTR_CONTENT_LENGTH: &str = "Content-Length";

/// A caller's request for a byte stream over some URL.
#[derive(Debug, Clone)]
pub struct StreamTaskRequest {
    /// Origin URL of the content.
    pub url: String,
    /// URL metadata qualifying the request.
    pub url_meta: UrlMeta,
    /// Peer id to run the task under; generated from the daemon host when
    /// absent.
    pub peer_id: Option<PeerId>,
}

/// Registry of live conductors, deduplicated by task fingerprint.
///
/// At most one running conductor exists per task id; later requests with
/// the same fingerprint attach to it and read the same bytes.
pub struct TaskManager {
    config: SpindriftConfig,
    host: PeerHost,
    store: Arc<dyn PieceStore>,
    fetcher: Arc<dyn PieceFetcher>,
    piece_tasks: Arc<dyn PieceTaskClient>,
    scheduler: Arc<dyn SchedulerClient>,
    sources: Arc<SourceRegistry>,
    running: Mutex<HashMap<TaskId, Arc<TaskConductor>>>,
}

impl TaskManager {
    /// Creates a manager wiring the engine's capabilities together.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SpindriftConfig,
        host: PeerHost,
        store: Arc<dyn PieceStore>,
        fetcher: Arc<dyn PieceFetcher>,
        piece_tasks: Arc<dyn PieceTaskClient>,
        scheduler: Arc<dyn SchedulerClient>,
        sources: Arc<SourceRegistry>,
    ) -> Self {
        Self {
            config,
            host,
            store,
            fetcher,
            piece_tasks,
            scheduler,
            sources,
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Starts (or joins) the task for a request and returns a byte stream
    /// over its content plus diagnostic attributes.
    ///
    /// # Errors
    /// - `EngineError::Task` - The request URL cannot be fingerprinted.
    pub async fn start_stream_task(
        &self,
        request: &StreamTaskRequest,
    ) -> Result<(TaskReader, HashMap<String, String>), EngineError> {
        let task_id = fingerprint::task_id(&request.url, &request.url_meta)?;
        let mut running = self.running.lock().await;

        // join a live conductor when one exists
        if let Some(conductor) = running.get(&task_id) {
            let phase = conductor.phase_receiver().borrow().clone();
            if !phase.is_failed() {
                debug!("task {task_id} reused by a new reader");
                conductor.attach();
                let attrs = self.attributes(&task_id, conductor.peer_id()).await;
                return Ok((
                    TaskReader::attached(self.store.clone(), conductor.clone()),
                    attrs,
                ));
            }
            running.remove(&task_id);
        }

        // completed content still on disk needs no conductor at all
        if self.store.is_complete(&task_id).await && !self.store.is_invalid(&task_id).await {
            info!("task {task_id} served from completed storage");
            let peer_id = self.peer_id(request);
            let attrs = self.attributes(&task_id, &peer_id).await;
            return Ok((TaskReader::completed(self.store.clone(), task_id), attrs));
        }

        let peer_id = self.peer_id(request);
        let register = RegisterRequest {
            url: request.url.clone(),
            url_meta: request.url_meta.clone(),
            peer_id: peer_id.clone(),
            task_id: task_id.clone(),
            peer_host: self.host.clone(),
        };
        let conductor = Arc::new(TaskConductor::new(
            register,
            &self.config,
            self.store.clone(),
            self.fetcher.clone(),
            self.piece_tasks.clone(),
            self.scheduler.clone(),
            self.sources.clone(),
        ));
        running.insert(task_id.clone(), conductor.clone());
        drop(running);

        info!("task {task_id} started for peer {peer_id}");
        conductor.attach();
        tokio::spawn(conductor.clone().run());

        let attrs = self.attributes(&task_id, &peer_id).await;
        Ok((
            TaskReader::attached(self.store.clone(), conductor),
            attrs,
        ))
    }

    /// Serves a prior task's content straight from the store, when it is
    /// complete and valid.
    ///
    /// # Errors
    /// - `EngineError::TaskNotFound` - No valid completed content for the
    ///   task id.
    pub async fn find_completed_task(
        &self,
        task_id: &TaskId,
    ) -> Result<(TaskReader, HashMap<String, String>), EngineError> {
        if !self.store.is_complete(task_id).await || self.store.is_invalid(task_id).await {
            return Err(EngineError::TaskNotFound {
                task_id: task_id.clone(),
            });
        }
        let peer_id = PeerId::generate(&self.host.ip);
        let attrs = self.attributes(task_id, &peer_id).await;
        Ok((
            TaskReader::completed(self.store.clone(), task_id.clone()),
            attrs,
        ))
    }

    /// Whether a conductor for the task id is currently registered and not
    /// failed.
    pub async fn is_task_running(&self, task_id: &TaskId) -> bool {
        let running = self.running.lock().await;
        running
            .get(task_id)
            .map(|c| !matches!(&*c.phase_receiver().borrow(), TaskPhase::Failed { .. }))
            .unwrap_or(false)
    }

    fn peer_id(&self, request: &StreamTaskRequest) -> PeerId {
        request
            .peer_id
            .clone()
            .unwrap_or_else(|| PeerId::generate(&self.host.ip))
    }

    async fn attributes(&self, task_id: &TaskId, peer_id: &PeerId) -> HashMap<String, String> {
        let mut attrs = HashMap::new();
        attrs.insert(ATTR_TASK_ID.to_string(), task_id.to_string());
        attrs.insert(ATTR_PEER_ID.to_string(), peer_id.to_string());
        if let Ok(metadata) = self.store.task_metadata(task_id).await {
            if let Some(length) = metadata.content_length {
                attrs.insert(ATTR_CONTENT_LENGTH.to_string(), length.to_string());
            }
        }
        attrs
    }
}
