use serde::{Deserialize, Serialize};

// ─── Scalar aliases ───────────────────────────────────────────

/// Byte offset into the append-only log. Positions strictly increase and are
/// never reused, which is what makes them usable as task identities.
pub type Position = u64;

/// Epoch milliseconds (UTC).
pub type Timestamp = i64;

/// Schema identifier carried in every record header and every command.
pub type TemplateId = u16;

// ─── Template identifiers ─────────────────────────────────────

/// Task-instance log record schema.
pub const TASK_INSTANCE_TEMPLATE: TemplateId = 0x0101;

/// Create-task command.
pub const CREATE_TASK_TEMPLATE: TemplateId = 0x0201;
/// Lock-task-batch command.
pub const LOCK_TASK_BATCH_TEMPLATE: TemplateId = 0x0202;
/// Complete-task command.
pub const COMPLETE_TASK_TEMPLATE: TemplateId = 0x0203;

/// Upper bound on the task type byte length (wire field is length-prefixed).
pub const MAX_TASK_TYPE_LEN: usize = 256;

// ─── Task type hash ───────────────────────────────────────────

/// Cheap 31-multiplier hash over the task type bytes.
///
/// Used as a scan pre-filter only — the full bytes are the authority on a
/// match, so collisions cost a comparison, never a wrong lock.
pub fn type_hash(task_type: &[u8]) -> i32 {
    let mut h: i32 = 0;
    for &b in task_type {
        h = h.wrapping_mul(31).wrapping_add(b as i32);
    }
    h
}

// ─── Task instance ────────────────────────────────────────────

/// Lifecycle stage of a task version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    New,
    Locked,
    Completed,
}

/// One version of a task, as written at one log position.
///
/// The log is append-only: every state transition appends a new version
/// (`version + 1`) rather than updating in place. Replaying all versions of
/// an id in position order yields `NEW → (LOCKED → NEW-equivalent)* →
/// COMPLETED?`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskInstance {
    /// Stable identity — by convention the log position of the first (NEW)
    /// version, which is collision-free for free.
    pub id: u64,
    /// Monotonically increasing per id, +1 per transition.
    pub version: u32,
    pub state: TaskState,
    /// Classifies which workers may claim the task. At most
    /// [`MAX_TASK_TYPE_LEN`] bytes.
    pub task_type: Vec<u8>,
    /// `type_hash(task_type)` — denormalized into the record so scans can
    /// pre-filter without comparing bytes.
    pub type_hash: i32,
    /// Lease holder. Meaningful only when `state == Locked`, zero otherwise.
    pub lock_owner: u64,
    /// Lease expiry. Meaningful only when `state == Locked`, zero otherwise.
    pub lock_deadline: Timestamp,
    /// Opaque task data, copied verbatim between versions.
    pub payload: Vec<u8>,
}

impl TaskInstance {
    /// Build the first (NEW) version of a task. The id is assigned later,
    /// from the log position the record is claimed at.
    pub fn new_task(task_type: Vec<u8>, payload: Vec<u8>) -> Self {
        let hash = type_hash(&task_type);
        Self {
            id: 0,
            version: 1,
            state: TaskState::New,
            task_type,
            type_hash: hash,
            lock_owner: 0,
            lock_deadline: 0,
            payload,
        }
    }

    /// Next version of this task with a lease held by `owner` until
    /// `deadline`.
    pub fn locked(&self, owner: u64, deadline: Timestamp) -> Self {
        Self {
            id: self.id,
            version: self.version + 1,
            state: TaskState::Locked,
            task_type: self.task_type.clone(),
            type_hash: self.type_hash,
            lock_owner: owner,
            lock_deadline: deadline,
            payload: self.payload.clone(),
        }
    }

    /// Terminal version of this task. Lock fields are cleared — they are
    /// only meaningful while a lease is held.
    pub fn completed(&self) -> Self {
        Self {
            id: self.id,
            version: self.version + 1,
            state: TaskState::Completed,
            task_type: self.task_type.clone(),
            type_hash: self.type_hash,
            lock_owner: 0,
            lock_deadline: 0,
            payload: self.payload.clone(),
        }
    }
}

// ─── Command requests/responses (the wire types) ──────────────

/// Producer request: append a NEW task.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateTaskRequest {
    pub task_type: Vec<u8>,
    pub payload: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateTaskResponse {
    /// Assigned task id (= log position of the NEW record).
    pub id: u64,
}

/// Consumer poll: lease the next lockable task of `task_type`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LockTaskBatchRequest {
    pub task_type: Vec<u8>,
    /// Lease duration in milliseconds.
    pub lease_ms: i64,
    /// Identifies the lease holder for the later completion check.
    pub requester: u64,
}

/// An empty `tasks` vec is the normal "no work available" outcome of a
/// poll, not an error.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LockTaskBatchResponse {
    pub tasks: Vec<LockedTask>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LockedTask {
    pub id: u64,
    pub payload: Vec<u8>,
    pub lock_deadline: Timestamp,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompleteTaskRequest {
    pub id: u64,
    pub requester: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompleteTaskResponse {
    Acked { id: u64 },
    Rejected { id: u64, reason: RejectionReason },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectionReason {
    /// No current version of the id is known to the lock index (never
    /// created, or already completed).
    TaskNotFound,
    /// The requester does not hold the current lease.
    LockOwnershipViolation,
}
