//! Task queue facade — wires the ports and engine parts together, performs
//! index recovery at startup, owns the maintenance task, and exposes the
//! command surface to the transport layer.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::handlers::{
    CommandDispatcher, CompleteTaskHandler, CreateTaskHandler, LockTaskBatchHandler,
};
use crate::index::IndexManager;
use crate::log::Log;
use crate::response::{ResponsePool, ResponseReceiver};
use crate::scanner::LeaseScanner;
use crate::scheduler::IndexMaintenance;
use crate::snapshot::SnapshotStore;
use crate::types::{
    CompleteTaskRequest, CompleteTaskResponse, CreateTaskRequest, CreateTaskResponse,
    LockTaskBatchRequest, LockTaskBatchResponse, LockedTask, TemplateId, COMPLETE_TASK_TEMPLATE,
    CREATE_TASK_TEMPLATE, LOCK_TASK_BATCH_TEMPLATE,
};
use crate::writer::ClaimedFragmentWriter;

/// One durable task queue over one log.
pub struct TaskQueue {
    dispatcher: CommandDispatcher,
    pool: ResponsePool,
    indexes: Arc<IndexManager>,
    maintenance: Arc<IndexMaintenance>,
    shutdown: watch::Sender<bool>,
    maintenance_task: JoinHandle<()>,
}

impl TaskQueue {
    /// Recover the indices from their checkpoints, build the handler table,
    /// and spawn the index-maintenance task.
    pub async fn start(
        config: QueueConfig,
        log: Arc<dyn Log>,
        snapshots: Arc<dyn SnapshotStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, QueueError> {
        config.validate()?;

        let indexes = Arc::new(IndexManager::new(snapshots));
        indexes.recover(log.as_ref()).await?;

        let writer = Arc::new(ClaimedFragmentWriter::new(
            log.clone(),
            config.backpressure_retry_budget,
            Duration::from_millis(config.backpressure_retry_delay_ms),
        ));
        let scanner = Arc::new(LeaseScanner::new(log.clone(), indexes.clone()));

        let mut dispatcher = CommandDispatcher::new();
        dispatcher.register(Box::new(CreateTaskHandler::new(writer.clone())))?;
        dispatcher.register(Box::new(LockTaskBatchHandler::new(
            scanner,
            writer.clone(),
            indexes.clone(),
            clock,
        )))?;
        dispatcher.register(Box::new(CompleteTaskHandler::new(
            log.clone(),
            writer,
            indexes.clone(),
        )))?;

        let maintenance = Arc::new(IndexMaintenance::new(
            log,
            indexes.clone(),
            config.drain_batch_size,
            Duration::from_millis(config.maintenance_interval_ms),
        ));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let maintenance_task = tokio::spawn(maintenance.clone().run(shutdown_rx));

        Ok(Self {
            dispatcher,
            pool: ResponsePool::new(config.response_pool_capacity),
            indexes,
            maintenance,
            shutdown,
            maintenance_task,
        })
    }

    /// Route raw request bytes by template id. The returned receiver
    /// resolves once the triggering append commits; a discarded request
    /// closes it without bytes.
    pub async fn dispatch(
        &self,
        template: TemplateId,
        request: &[u8],
    ) -> Result<ResponseReceiver, QueueError> {
        let (response, receiver) = self
            .pool
            .try_reserve()
            .ok_or(QueueError::ResponsePoolExhausted)?;
        self.dispatcher.dispatch(template, request, response).await?;
        Ok(receiver)
    }

    async fn round_trip<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        template: TemplateId,
        request: &Req,
    ) -> Result<Resp, QueueError> {
        let bytes =
            serde_json::to_vec(request).map_err(|e| QueueError::InvalidRequest(e.to_string()))?;
        let receiver = self.dispatch(template, &bytes).await?;
        let bytes = receiver.recv().await.ok_or(QueueError::Discarded)?;
        serde_json::from_slice(&bytes).map_err(|e| QueueError::InvalidRequest(e.to_string()))
    }

    // ── typed convenience surface ──

    pub async fn create_task(&self, task_type: &[u8], payload: &[u8]) -> Result<u64, QueueError> {
        let resp: CreateTaskResponse = self
            .round_trip(
                CREATE_TASK_TEMPLATE,
                &CreateTaskRequest {
                    task_type: task_type.to_vec(),
                    payload: payload.to_vec(),
                },
            )
            .await?;
        Ok(resp.id)
    }

    /// Poll for one lockable task. `None` is the normal empty outcome.
    pub async fn lock_task_batch(
        &self,
        task_type: &[u8],
        lease_ms: i64,
        requester: u64,
    ) -> Result<Option<LockedTask>, QueueError> {
        let resp: LockTaskBatchResponse = self
            .round_trip(
                LOCK_TASK_BATCH_TEMPLATE,
                &LockTaskBatchRequest {
                    task_type: task_type.to_vec(),
                    lease_ms,
                    requester,
                },
            )
            .await?;
        Ok(resp.tasks.into_iter().next())
    }

    pub async fn complete_task(
        &self,
        id: u64,
        requester: u64,
    ) -> Result<CompleteTaskResponse, QueueError> {
        self.round_trip(COMPLETE_TASK_TEMPLATE, &CompleteTaskRequest { id, requester })
            .await
    }

    /// Single-step the index-maintenance drain. The background loop does
    /// the same thing on its own schedule; stepping it explicitly makes
    /// staleness windows deterministic in tests and embeddings.
    pub async fn step_maintenance(&self) -> Result<usize, QueueError> {
        self.maintenance.tick().await
    }

    pub fn indexes(&self) -> &Arc<IndexManager> {
        &self.indexes
    }

    /// Stop the maintenance task and wait for it to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.maintenance_task.await;
    }
}
