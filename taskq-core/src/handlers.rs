//! Command handlers — the three protocol steps (Create, Lock-Batch,
//! Complete), each reading, transitioning, appending, and responding — and
//! the template-id dispatch table that routes raw requests to them.
//!
//! Per-request failures (unknown task, ownership violation) are typed
//! rejections in the response body. Backpressure surfaces as a
//! [`QueueError`] to the transport, which should have the client retry the
//! whole request. Nothing per-request ever panics or crosses the log-append
//! boundary as an exception.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, error};

use crate::clock::Clock;
use crate::codec;
use crate::error::QueueError;
use crate::index::IndexManager;
use crate::log::Log;
use crate::response::DeferredResponse;
use crate::scanner::LeaseScanner;
use crate::types::{
    CompleteTaskRequest, CompleteTaskResponse, CreateTaskRequest, CreateTaskResponse,
    LockTaskBatchRequest, LockTaskBatchResponse, LockedTask, Position, RejectionReason, TaskState,
    TemplateId, COMPLETE_TASK_TEMPLATE, CREATE_TASK_TEMPLATE, LOCK_TASK_BATCH_TEMPLATE,
    MAX_TASK_TYPE_LEN,
};
use crate::writer::ClaimedFragmentWriter;

/// One protocol step: request bytes in, deferred response out.
///
/// The handler must only release the response after the append that
/// justifies it has committed; returning `Err` drops the response, which the
/// transport observes as a discarded request.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    fn template(&self) -> TemplateId;
    async fn handle(&self, request: &[u8], response: DeferredResponse) -> Result<(), QueueError>;
}

fn decode_request<'a, T: serde::Deserialize<'a>>(request: &'a [u8]) -> Result<T, QueueError> {
    serde_json::from_slice(request).map_err(|e| QueueError::InvalidRequest(e.to_string()))
}

fn encode_response<T: Serialize>(value: &T) -> Result<Vec<u8>, QueueError> {
    serde_json::to_vec(value).map_err(|e| QueueError::InvalidRequest(e.to_string()))
}

// ─── Dispatch ─────────────────────────────────────────────────

/// Template-id keyed lookup table over the registered handlers.
#[derive(Default)]
pub struct CommandDispatcher {
    handlers: HashMap<TemplateId, Box<dyn CommandHandler>>,
}

impl CommandDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Box<dyn CommandHandler>) -> Result<(), QueueError> {
        let template = handler.template();
        if self.handlers.contains_key(&template) {
            return Err(QueueError::DuplicateHandler(template));
        }
        self.handlers.insert(template, handler);
        Ok(())
    }

    pub async fn dispatch(
        &self,
        template: TemplateId,
        request: &[u8],
        response: DeferredResponse,
    ) -> Result<(), QueueError> {
        let handler = self
            .handlers
            .get(&template)
            .ok_or(QueueError::UnknownTemplate(template))?;
        handler.handle(request, response).await
    }
}

// ─── Create ───────────────────────────────────────────────────

pub struct CreateTaskHandler {
    writer: Arc<ClaimedFragmentWriter>,
}

impl CreateTaskHandler {
    pub fn new(writer: Arc<ClaimedFragmentWriter>) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl CommandHandler for CreateTaskHandler {
    fn template(&self) -> TemplateId {
        CREATE_TASK_TEMPLATE
    }

    async fn handle(&self, request: &[u8], response: DeferredResponse) -> Result<(), QueueError> {
        let req: CreateTaskRequest = decode_request(request)?;
        let (task, position) = self
            .writer
            .append_created(&req.task_type, &req.payload)
            .await?;
        debug!(id = task.id, position, "task created");
        response.send(encode_response(&CreateTaskResponse { id: task.id })?);
        Ok(())
    }
}

// ─── Lock batch ───────────────────────────────────────────────

pub struct LockTaskBatchHandler {
    scanner: Arc<LeaseScanner>,
    writer: Arc<ClaimedFragmentWriter>,
    indexes: Arc<IndexManager>,
    clock: Arc<dyn Clock>,
}

impl LockTaskBatchHandler {
    pub fn new(
        scanner: Arc<LeaseScanner>,
        writer: Arc<ClaimedFragmentWriter>,
        indexes: Arc<IndexManager>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            scanner,
            writer,
            indexes,
            clock,
        }
    }
}

#[async_trait]
impl CommandHandler for LockTaskBatchHandler {
    fn template(&self) -> TemplateId {
        LOCK_TASK_BATCH_TEMPLATE
    }

    async fn handle(&self, request: &[u8], response: DeferredResponse) -> Result<(), QueueError> {
        let req: LockTaskBatchRequest = decode_request(request)?;
        if req.task_type.is_empty() || req.task_type.len() > MAX_TASK_TYPE_LEN {
            return Err(QueueError::InvalidRequest("bad task type length".into()));
        }
        if req.lease_ms <= 0 {
            return Err(QueueError::InvalidRequest(
                "lease duration must be positive".into(),
            ));
        }

        let now = self.clock.now_ms();
        let candidate = self.scanner.find_candidate(&req.task_type, now).await?;

        let Some(candidate) = candidate else {
            // Polling with no available work is a steady state, not an
            // error — and with no append, nothing defers the response.
            response.send(encode_response(&LockTaskBatchResponse { tasks: vec![] })?);
            return Ok(());
        };

        let deadline = now + req.lease_ms;
        let locked = candidate.task.locked(req.requester, deadline);
        let position = self.writer.append(&locked).await?;
        self.indexes.put_position(locked.id, position).await;
        debug!(
            id = locked.id,
            position,
            requester = req.requester,
            deadline,
            "task locked"
        );

        response.send(encode_response(&LockTaskBatchResponse {
            tasks: vec![LockedTask {
                id: locked.id,
                payload: locked.payload,
                lock_deadline: deadline,
            }],
        })?);
        Ok(())
    }
}

// ─── Complete ─────────────────────────────────────────────────

pub struct CompleteTaskHandler {
    log: Arc<dyn Log>,
    writer: Arc<ClaimedFragmentWriter>,
    indexes: Arc<IndexManager>,
}

impl CompleteTaskHandler {
    pub fn new(
        log: Arc<dyn Log>,
        writer: Arc<ClaimedFragmentWriter>,
        indexes: Arc<IndexManager>,
    ) -> Self {
        Self {
            log,
            writer,
            indexes,
        }
    }

    /// The id index pointed somewhere that does not hold the id it claims.
    /// This must never be limped along — rebuild from position 0, then
    /// report the fatal error (the response is discarded; the client can
    /// retry once the rebuild lands).
    async fn fail_inconsistent(
        &self,
        id: u64,
        position: Position,
        found: u64,
    ) -> Result<(), QueueError> {
        error!(id, position, found, "id index inconsistency; rebuilding from position 0");
        self.indexes.rebuild(self.log.as_ref()).await?;
        Err(QueueError::IndexInconsistency {
            id,
            position,
            found,
        })
    }
}

#[async_trait]
impl CommandHandler for CompleteTaskHandler {
    fn template(&self) -> TemplateId {
        COMPLETE_TASK_TEMPLATE
    }

    async fn handle(&self, request: &[u8], response: DeferredResponse) -> Result<(), QueueError> {
        let req: CompleteTaskRequest = decode_request(request)?;

        let Some(position) = self.indexes.get_position(req.id).await else {
            response.send(encode_response(&CompleteTaskResponse::Rejected {
                id: req.id,
                reason: RejectionReason::TaskNotFound,
            })?);
            return Ok(());
        };

        let Some(bytes) = self.log.read(position).await? else {
            return self.fail_inconsistent(req.id, position, 0).await;
        };
        let task = match codec::decode(&bytes) {
            Ok(task) => task,
            Err(_) => return self.fail_inconsistent(req.id, position, 0).await,
        };
        if task.id != req.id {
            return self.fail_inconsistent(req.id, position, task.id).await;
        }

        if task.state != TaskState::Locked || task.lock_owner != req.requester {
            // "Lease already expired/lost" from the caller's point of view.
            response.send(encode_response(&CompleteTaskResponse::Rejected {
                id: req.id,
                reason: RejectionReason::LockOwnershipViolation,
            })?);
            return Ok(());
        }

        let completed = task.completed();
        let new_position = self.writer.append(&completed).await?;
        self.indexes.remove(req.id, new_position).await;
        debug!(id = req.id, position = new_position, "task completed");

        response.send(encode_response(&CompleteTaskResponse::Acked { id: req.id })?);
        Ok(())
    }
}
