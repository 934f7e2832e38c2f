//! Task record codec — fixed-layout binary encoding of [`TaskInstance`].
//!
//! Wire layout (little-endian), one record per log fragment:
//!
//! ```text
//! offset  size  field
//!      0     2  template id        (TASK_INSTANCE_TEMPLATE)
//!      2     2  schema version     (TASK_INSTANCE_SCHEMA_VERSION)
//!      4     8  id
//!     12     4  version
//!     16     1  state
//!     17     4  type hash
//!     21     8  lock owner
//!     29     8  lock deadline
//!     37     2  task type length = T
//!     39     T  task type bytes
//!   39+T     4  payload length = P
//!   43+T     P  payload bytes
//! ```
//!
//! Decoding validates the template id and schema version before interpreting
//! anything else; a mismatch is a [`CodecError`], which scan and recovery
//! consumers log and skip rather than treat as fatal.

use crate::types::{TaskInstance, TaskState, MAX_TASK_TYPE_LEN, TASK_INSTANCE_TEMPLATE};
use thiserror::Error;

/// Bumped on any layout change. Decoders reject versions they don't know.
pub const TASK_INSTANCE_SCHEMA_VERSION: u16 = 1;

/// Bytes before the variable tail (through the task-type length prefix).
const FIXED_HEADER_LEN: usize = 39;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("unexpected template id {found:#06x}")]
    UnexpectedTemplate { found: u16 },

    #[error("unsupported schema version {found}")]
    UnsupportedSchemaVersion { found: u16 },

    #[error("record truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("unknown state byte {0}")]
    UnknownState(u8),

    #[error("task type length {0} exceeds maximum {MAX_TASK_TYPE_LEN}")]
    TypeTooLong(usize),

    #[error("encode buffer too small: need {need} bytes, have {have}")]
    BufferTooSmall { need: usize, have: usize },
}

fn state_to_byte(state: TaskState) -> u8 {
    match state {
        TaskState::New => 0,
        TaskState::Locked => 1,
        TaskState::Completed => 2,
    }
}

fn state_from_byte(b: u8) -> Result<TaskState, CodecError> {
    match b {
        0 => Ok(TaskState::New),
        1 => Ok(TaskState::Locked),
        2 => Ok(TaskState::Completed),
        other => Err(CodecError::UnknownState(other)),
    }
}

/// Exact wire size of `task`. Does not depend on `id`, so the length can be
/// computed before the log position (and therefore the id) is known.
pub fn encoded_len(task: &TaskInstance) -> usize {
    FIXED_HEADER_LEN + task.task_type.len() + 4 + task.payload.len()
}

/// Encode `task` into `buf`, which must be exactly [`encoded_len`] bytes.
pub fn encode(task: &TaskInstance, buf: &mut [u8]) -> Result<(), CodecError> {
    if task.task_type.len() > MAX_TASK_TYPE_LEN {
        return Err(CodecError::TypeTooLong(task.task_type.len()));
    }
    let need = encoded_len(task);
    if buf.len() < need {
        return Err(CodecError::BufferTooSmall {
            need,
            have: buf.len(),
        });
    }

    buf[0..2].copy_from_slice(&TASK_INSTANCE_TEMPLATE.to_le_bytes());
    buf[2..4].copy_from_slice(&TASK_INSTANCE_SCHEMA_VERSION.to_le_bytes());
    buf[4..12].copy_from_slice(&task.id.to_le_bytes());
    buf[12..16].copy_from_slice(&task.version.to_le_bytes());
    buf[16] = state_to_byte(task.state);
    buf[17..21].copy_from_slice(&task.type_hash.to_le_bytes());
    buf[21..29].copy_from_slice(&task.lock_owner.to_le_bytes());
    buf[29..37].copy_from_slice(&task.lock_deadline.to_le_bytes());

    let tl = task.task_type.len();
    buf[37..39].copy_from_slice(&(tl as u16).to_le_bytes());
    buf[39..39 + tl].copy_from_slice(&task.task_type);

    let p0 = 39 + tl;
    buf[p0..p0 + 4].copy_from_slice(&(task.payload.len() as u32).to_le_bytes());
    buf[p0 + 4..p0 + 4 + task.payload.len()].copy_from_slice(&task.payload);

    Ok(())
}

/// Decode a task record. Trailing bytes past the declared payload length are
/// rejected as truncation-in-reverse — a record fills its fragment exactly.
pub fn decode(bytes: &[u8]) -> Result<TaskInstance, CodecError> {
    if bytes.len() < FIXED_HEADER_LEN {
        return Err(CodecError::Truncated {
            need: FIXED_HEADER_LEN,
            have: bytes.len(),
        });
    }

    let template = u16::from_le_bytes([bytes[0], bytes[1]]);
    if template != TASK_INSTANCE_TEMPLATE {
        return Err(CodecError::UnexpectedTemplate { found: template });
    }
    let schema = u16::from_le_bytes([bytes[2], bytes[3]]);
    if schema != TASK_INSTANCE_SCHEMA_VERSION {
        return Err(CodecError::UnsupportedSchemaVersion { found: schema });
    }

    let id = u64::from_le_bytes(bytes[4..12].try_into().unwrap());
    let version = u32::from_le_bytes(bytes[12..16].try_into().unwrap());
    let state = state_from_byte(bytes[16])?;
    let type_hash = i32::from_le_bytes(bytes[17..21].try_into().unwrap());
    let lock_owner = u64::from_le_bytes(bytes[21..29].try_into().unwrap());
    let lock_deadline = i64::from_le_bytes(bytes[29..37].try_into().unwrap());

    let tl = u16::from_le_bytes([bytes[37], bytes[38]]) as usize;
    if tl > MAX_TASK_TYPE_LEN {
        return Err(CodecError::TypeTooLong(tl));
    }
    let type_end = FIXED_HEADER_LEN + tl;
    if bytes.len() < type_end + 4 {
        return Err(CodecError::Truncated {
            need: type_end + 4,
            have: bytes.len(),
        });
    }
    let task_type = bytes[FIXED_HEADER_LEN..type_end].to_vec();

    let pl = u32::from_le_bytes(bytes[type_end..type_end + 4].try_into().unwrap()) as usize;
    let total = type_end + 4 + pl;
    if bytes.len() != total {
        return Err(CodecError::Truncated {
            need: total,
            have: bytes.len(),
        });
    }
    let payload = bytes[type_end + 4..total].to_vec();

    Ok(TaskInstance {
        id,
        version,
        state,
        task_type,
        type_hash,
        lock_owner,
        lock_deadline,
        payload,
    })
}
