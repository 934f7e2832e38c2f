use crate::types::{Position, TemplateId};
use thiserror::Error;

/// Engine error taxonomy.
///
/// Per-request conditions (`WriteBackpressure`, `ResponsePoolExhausted`)
/// are recoverable typed outcomes for the caller. Per-task outcomes a
/// well-formed request can produce — unknown id, lease held by someone
/// else — are not errors at all: they travel in the response body as
/// `types::RejectionReason`. `IndexInconsistency` is fatal to the index
/// state and forces a full rebuild — continuing with a possibly-wrong
/// index can double-lock tasks.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The log could not grant claim space within the retry budget. The
    /// whole request should be retried later.
    #[error("write backpressure: claim retry budget exhausted")]
    WriteBackpressure,

    /// All deferred-response slots are in flight. The request is rejected,
    /// never queued unboundedly.
    #[error("response pool exhausted")]
    ResponsePoolExhausted,

    /// A fragment's header does not match the expected schema. Skipped by
    /// scan/recovery consumers, fatal only to that fragment.
    #[error("corrupt record at position {position}: {reason}")]
    CorruptRecord { position: Position, reason: String },

    /// An id-index entry points at a fragment that decodes to a different
    /// id. Index state can no longer be trusted; rebuild from position 0.
    #[error("index inconsistency: id {id} maps to position {position} holding id {found}")]
    IndexInconsistency {
        id: u64,
        position: Position,
        found: u64,
    },

    /// The deferred response was dropped before its append committed.
    #[error("request discarded before commit")]
    Discarded,

    #[error("unknown template id {0:#06x}")]
    UnknownTemplate(TemplateId),

    #[error("duplicate handler for template id {0:#06x}")]
    DuplicateHandler(TemplateId),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("log: {0}")]
    Log(String),

    #[error("snapshot store: {0}")]
    Snapshot(String),
}
