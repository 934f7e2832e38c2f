//! Log port — the append-only, position-addressed byte stream the engine
//! treats as its single source of truth.
//!
//! The engine never writes to the log except through the three-phase
//! claim/commit/abort protocol: `claim` reserves a region, the caller fills
//! the returned buffer, and `commit` makes it visible atomically. An aborted
//! claim never becomes visible to any reader. The log serializes physical
//! claims, which is what turns many logical writers (the command handlers)
//! into one physical append path.
//!
//! The real deployment backs this with a replicated, fsynced stream; the
//! [`InMemoryLog`] here carries the same visibility contract and is what the
//! engine's tests run against.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::types::Position;

/// A committed fragment handed to readers.
#[derive(Clone, Debug)]
pub struct Fragment {
    /// Start position of the fragment.
    pub position: Position,
    /// Position immediately after the fragment — the next scan cursor.
    pub next: Position,
    pub bytes: Vec<u8>,
}

/// A claimed-but-uncommitted region. The caller writes the record into
/// `buf` and passes the fragment back to `commit` (or `abort`).
#[derive(Debug)]
pub struct ClaimedFragment {
    pub position: Position,
    pub buf: Vec<u8>,
}

/// Outcome of a claim attempt.
#[derive(Debug)]
pub enum ClaimOutcome {
    Claimed(ClaimedFragment),
    /// The log's write buffer is full. Recoverable — retry the claim.
    Backpressure,
}

#[async_trait]
pub trait Log: Send + Sync {
    /// Reserve `len` bytes of log space, or report backpressure.
    async fn claim(&self, len: usize) -> Result<ClaimOutcome, QueueError>;

    /// Make a claimed fragment visible. Returns its start position.
    async fn commit(&self, fragment: ClaimedFragment) -> Result<Position, QueueError>;

    /// Discard a claimed fragment. It never becomes visible to readers.
    async fn abort(&self, fragment: ClaimedFragment) -> Result<(), QueueError>;

    /// Read the committed fragment starting exactly at `position`.
    async fn read(&self, position: Position) -> Result<Option<Vec<u8>>, QueueError>;

    /// Read the first committed fragment at or after `position`.
    ///
    /// Readers never observe past an uncommitted claim: if the next slot in
    /// position order is still pending, this returns `None` until it
    /// commits or aborts. Scanning is repeated `read_from` with the
    /// returned `next` cursor.
    async fn read_from(&self, position: Position) -> Result<Option<Fragment>, QueueError>;

    /// Position one past the last claimed byte.
    async fn tail(&self) -> Result<Position, QueueError>;
}

// ─── In-memory implementation ─────────────────────────────────

enum Slot {
    Pending { len: usize },
    Committed(Vec<u8>),
    Aborted { len: usize },
}

struct LogState {
    slots: BTreeMap<Position, Slot>,
    next_position: Position,
    /// Claimed-but-unresolved bytes, bounded by `capacity`.
    pending_bytes: usize,
    /// Test hook: answer the next N claims with backpressure.
    forced_backpressure: usize,
}

/// In-memory log with the full claim/commit/abort visibility contract.
pub struct InMemoryLog {
    state: Arc<Mutex<LogState>>,
    capacity: usize,
}

impl InMemoryLog {
    /// Default claim-buffer capacity, matching `QueueConfig`'s default.
    pub const DEFAULT_CAPACITY: usize = 1 << 20;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    /// Log sized from the queue configuration's claim-buffer bound.
    pub fn from_config(config: &QueueConfig) -> Self {
        Self::with_capacity(config.claim_buffer_capacity)
    }

    /// `capacity` bounds in-flight (claimed, unresolved) bytes; claims past
    /// it see [`ClaimOutcome::Backpressure`].
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(LogState {
                slots: BTreeMap::new(),
                next_position: 0,
                pending_bytes: 0,
                forced_backpressure: 0,
            })),
            capacity,
        }
    }

    /// Force the next `n` claims to report backpressure, regardless of
    /// buffer occupancy. Exercises the writer's bounded retry path.
    pub async fn force_backpressure(&self, n: usize) {
        self.state.lock().await.forced_backpressure = n;
    }
}

impl Default for InMemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Log for InMemoryLog {
    async fn claim(&self, len: usize) -> Result<ClaimOutcome, QueueError> {
        if len == 0 {
            return Err(QueueError::Log("zero-length claim".into()));
        }
        let mut state = self.state.lock().await;
        if state.forced_backpressure > 0 {
            state.forced_backpressure -= 1;
            return Ok(ClaimOutcome::Backpressure);
        }
        if state.pending_bytes + len > self.capacity {
            return Ok(ClaimOutcome::Backpressure);
        }
        let position = state.next_position;
        state.next_position += len as Position;
        state.pending_bytes += len;
        state.slots.insert(position, Slot::Pending { len });
        Ok(ClaimOutcome::Claimed(ClaimedFragment {
            position,
            buf: vec![0u8; len],
        }))
    }

    async fn commit(&self, fragment: ClaimedFragment) -> Result<Position, QueueError> {
        let mut state = self.state.lock().await;
        match state.slots.get(&fragment.position) {
            Some(Slot::Pending { len }) if *len == fragment.buf.len() => {
                state.pending_bytes -= fragment.buf.len();
                state
                    .slots
                    .insert(fragment.position, Slot::Committed(fragment.buf));
                Ok(fragment.position)
            }
            Some(Slot::Pending { len }) => Err(QueueError::Log(format!(
                "commit length {} does not match claim length {len}",
                fragment.buf.len()
            ))),
            _ => Err(QueueError::Log(format!(
                "commit of unknown or resolved claim at {}",
                fragment.position
            ))),
        }
    }

    async fn abort(&self, fragment: ClaimedFragment) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        match state.slots.get(&fragment.position) {
            Some(Slot::Pending { len }) => {
                let len = *len;
                state.pending_bytes -= len;
                state.slots.insert(fragment.position, Slot::Aborted { len });
                Ok(())
            }
            _ => Err(QueueError::Log(format!(
                "abort of unknown or resolved claim at {}",
                fragment.position
            ))),
        }
    }

    async fn read(&self, position: Position) -> Result<Option<Vec<u8>>, QueueError> {
        let state = self.state.lock().await;
        match state.slots.get(&position) {
            Some(Slot::Committed(bytes)) => Ok(Some(bytes.clone())),
            _ => Ok(None),
        }
    }

    async fn read_from(&self, position: Position) -> Result<Option<Fragment>, QueueError> {
        let state = self.state.lock().await;
        for (&pos, slot) in state.slots.range(position..) {
            match slot {
                // Readers stop at an unresolved claim — committed fragments
                // only ever become visible in position order.
                Slot::Pending { .. } => return Ok(None),
                Slot::Aborted { .. } => continue,
                Slot::Committed(bytes) => {
                    return Ok(Some(Fragment {
                        position: pos,
                        next: pos + bytes.len() as Position,
                        bytes: bytes.clone(),
                    }));
                }
            }
        }
        Ok(None)
    }

    async fn tail(&self) -> Result<Position, QueueError> {
        Ok(self.state.lock().await.next_position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn claim_ok(log: &InMemoryLog, len: usize) -> ClaimedFragment {
        match log.claim(len).await.unwrap() {
            ClaimOutcome::Claimed(f) => f,
            ClaimOutcome::Backpressure => panic!("unexpected backpressure"),
        }
    }

    #[tokio::test]
    async fn committed_fragments_are_readable_in_order() {
        let log = InMemoryLog::new();

        let mut a = claim_ok(&log, 3).await;
        a.buf.copy_from_slice(b"aaa");
        let pa = log.commit(a).await.unwrap();

        let mut b = claim_ok(&log, 2).await;
        b.buf.copy_from_slice(b"bb");
        let pb = log.commit(b).await.unwrap();

        assert_eq!((pa, pb), (0, 3));
        let f = log.read_from(0).await.unwrap().unwrap();
        assert_eq!((f.position, f.next, f.bytes.as_slice()), (0, 3, b"aaa".as_slice()));
        let f = log.read_from(f.next).await.unwrap().unwrap();
        assert_eq!((f.position, f.next, f.bytes.as_slice()), (3, 5, b"bb".as_slice()));
        assert!(log.read_from(f.next).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn aborted_claims_are_never_visible() {
        let log = InMemoryLog::new();
        let a = claim_ok(&log, 4).await;
        log.abort(a).await.unwrap();

        let mut b = claim_ok(&log, 1).await;
        b.buf.copy_from_slice(b"x");
        log.commit(b).await.unwrap();

        // The aborted region is skipped; its position is consumed but holds
        // nothing.
        let f = log.read_from(0).await.unwrap().unwrap();
        assert_eq!(f.position, 4);
        assert_eq!(f.bytes, b"x");
        assert!(log.read(0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn readers_stop_at_pending_claims() {
        let log = InMemoryLog::new();
        let pending = claim_ok(&log, 2).await;

        let mut later = claim_ok(&log, 1).await;
        later.buf.copy_from_slice(b"y");
        log.commit(later).await.unwrap();

        // The later commit exists but is not yet observable past the hole.
        assert!(log.read_from(0).await.unwrap().is_none());

        log.abort(pending).await.unwrap();
        let f = log.read_from(0).await.unwrap().unwrap();
        assert_eq!(f.bytes, b"y");
    }

    #[tokio::test]
    async fn claim_reports_backpressure_at_capacity_and_recovers() {
        let log = InMemoryLog::with_capacity(4);
        let a = claim_ok(&log, 3).await;

        assert!(matches!(
            log.claim(2).await.unwrap(),
            ClaimOutcome::Backpressure
        ));

        log.abort(a).await.unwrap();
        assert!(matches!(
            log.claim(2).await.unwrap(),
            ClaimOutcome::Claimed(_)
        ));
    }

    #[tokio::test]
    async fn forced_backpressure_hook_counts_down() {
        let log = InMemoryLog::new();
        log.force_backpressure(2).await;
        assert!(matches!(log.claim(1).await.unwrap(), ClaimOutcome::Backpressure));
        assert!(matches!(log.claim(1).await.unwrap(), ClaimOutcome::Backpressure));
        assert!(matches!(log.claim(1).await.unwrap(), ClaimOutcome::Claimed(_)));
    }

    #[tokio::test]
    async fn commit_rejects_length_mismatch() {
        let log = InMemoryLog::new();
        let mut a = claim_ok(&log, 3).await;
        a.buf.push(0);
        assert!(log.commit(a).await.is_err());
    }
}
