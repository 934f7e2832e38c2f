//! Lease scanner — finds the next lockable task of a type by scanning the
//! log forward from the type's high-water mark.
//!
//! A fragment is a candidate when its type matches (hash pre-filter, bytes
//! authoritative) and it is NEW, or LOCKED with an expired lease. Candidacy
//! is then verified against the id index: if the index points elsewhere the
//! version is superseded and silently skipped — expected filtering, not an
//! error.
//!
//! High-water advancement: the mark moves past everything scanned, except it
//! never passes the earliest still-live (unexpired LOCKED, current) fragment
//! of the requested type. Transitions append new versions at the tail, so
//! consumed candidates never need rescanning — but an active lease expires
//! in place, and keeping it at-or-above the mark is what lets the next poll
//! cycle reclaim it.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::codec;
use crate::error::QueueError;
use crate::index::IndexManager;
use crate::log::Log;
use crate::types::{type_hash, Position, TaskInstance, TaskState, Timestamp};

/// A lockable task version, verified current at scan time.
#[derive(Clone, Debug)]
pub struct Candidate {
    pub position: Position,
    pub task: TaskInstance,
}

pub struct LeaseScanner {
    log: Arc<dyn Log>,
    indexes: Arc<IndexManager>,
}

impl LeaseScanner {
    pub fn new(log: Arc<dyn Log>, indexes: Arc<IndexManager>) -> Self {
        Self { log, indexes }
    }

    /// Scan for the first lockable task of `task_type` as of `now`.
    ///
    /// Advances the type high-water mark as a side effect even when nothing
    /// is ultimately locked — exhausted head-of-type ranges are not
    /// rescanned on the next poll.
    pub async fn find_candidate(
        &self,
        task_type: &[u8],
        now: Timestamp,
    ) -> Result<Option<Candidate>, QueueError> {
        let hash = type_hash(task_type);
        let start = self.indexes.type_high_water(task_type).await;
        let drained = self.indexes.drained_position().await;

        let mut cursor = start;
        let mut advance = start;
        // Set once the scan passes a still-live lease of this type; the
        // high-water mark must not move beyond that fragment.
        let mut blocked = false;
        let mut found = None;

        while let Some(fragment) = self.log.read_from(cursor).await? {
            cursor = fragment.next;

            let task = match codec::decode(&fragment.bytes) {
                Ok(task) => task,
                Err(e) => {
                    warn!(position = fragment.position, error = %e,
                        "skipping corrupt record during lock scan");
                    if !blocked {
                        advance = fragment.next;
                    }
                    continue;
                }
            };

            if task.type_hash != hash || task.task_type.as_slice() != task_type {
                if !blocked {
                    advance = fragment.next;
                }
                continue;
            }

            // Is this fragment the current version of its id? The index is
            // authoritative once it has drained past the fragment; in the
            // not-yet-indexed tail the fragment speaks for itself. A
            // tombstoned id is superseded wherever the fragment sits:
            // completion is terminal, and the tombstone outlives the drain
            // lag that would otherwise let old versions look current.
            let current = match self.indexes.last_entry(task.id).await {
                Some((_, true)) => false,
                Some((p, false)) => p == fragment.position,
                None => fragment.position >= drained,
            };
            if !current {
                if !blocked {
                    advance = fragment.next;
                }
                continue;
            }

            match task.state {
                TaskState::New => {}
                TaskState::Locked if task.lock_deadline < now => {}
                TaskState::Locked => {
                    // Live lease: skip, but pin the mark so the fragment is
                    // rescanned when the lease may have expired.
                    blocked = true;
                    continue;
                }
                TaskState::Completed => {
                    // Terminal version still in the unindexed tail.
                    if !blocked {
                        advance = fragment.next;
                    }
                    continue;
                }
            }

            // First valid candidate: consumed — its LOCKED successor will be
            // appended at the tail, so the mark may pass it.
            if !blocked {
                advance = fragment.next;
            }
            found = Some(Candidate {
                position: fragment.position,
                task,
            });
            break;
        }

        self.indexes.advance_type(task_type, advance).await;
        debug!(
            task_type = %String::from_utf8_lossy(task_type),
            start,
            advance,
            found = found.is_some(),
            "lock scan finished"
        );
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{ClaimOutcome, InMemoryLog};
    use crate::snapshot::InMemorySnapshotStore;

    async fn append(log: &InMemoryLog, task: &TaskInstance) -> Position {
        let len = codec::encoded_len(task);
        let mut frag = match log.claim(len).await.unwrap() {
            ClaimOutcome::Claimed(f) => f,
            ClaimOutcome::Backpressure => panic!("backpressure in test"),
        };
        codec::encode(task, &mut frag.buf).unwrap();
        log.commit(frag).await.unwrap()
    }

    async fn setup() -> (Arc<InMemoryLog>, Arc<IndexManager>, LeaseScanner) {
        let log = Arc::new(InMemoryLog::new());
        let indexes = Arc::new(IndexManager::new(Arc::new(InMemorySnapshotStore::new())));
        let scanner = LeaseScanner::new(log.clone(), indexes.clone());
        (log, indexes, scanner)
    }

    #[tokio::test]
    async fn finds_new_task_and_advances_high_water() {
        let (log, indexes, scanner) = setup().await;
        let task = TaskInstance::new_task(b"email".to_vec(), b"P".to_vec());
        let p = append(&log, &task).await;
        indexes.recover(log.as_ref()).await.unwrap();

        let c = scanner.find_candidate(b"email", 100).await.unwrap().unwrap();
        assert_eq!(c.position, p);
        assert_eq!(c.task.id, p);
        assert!(indexes.type_high_water(b"email").await > p);
    }

    #[tokio::test]
    async fn unindexed_tail_is_lockable_immediately() {
        let (log, _indexes, scanner) = setup().await;
        let task = TaskInstance::new_task(b"email".to_vec(), b"P".to_vec());
        let p = append(&log, &task).await;

        // No drain has run; the fragment is in the unindexed tail and
        // speaks for itself.
        let c = scanner.find_candidate(b"email", 100).await.unwrap().unwrap();
        assert_eq!(c.position, p);
    }

    #[tokio::test]
    async fn skips_stale_version_and_pins_mark_on_live_lease() {
        let (log, indexes, scanner) = setup().await;
        let task = TaskInstance::new_task(b"email".to_vec(), b"P".to_vec());
        append(&log, &task).await;
        let locked_pos = append(&log, &task.locked(7, 1_000)).await;
        indexes.recover(log.as_ref()).await.unwrap();

        // Lease still live at now=500: the stale NEW is skipped, the LOCKED
        // fragment blocks, nothing is lockable.
        assert!(scanner.find_candidate(b"email", 500).await.unwrap().is_none());
        // Mark is pinned at the live lease, not past it.
        assert_eq!(indexes.type_high_water(b"email").await, locked_pos);
    }

    #[tokio::test]
    async fn reclaims_expired_lease() {
        let (log, indexes, scanner) = setup().await;
        let task = TaskInstance::new_task(b"sms".to_vec(), b"P".to_vec());
        append(&log, &task).await;
        let locked_pos = append(&log, &task.locked(7, 1_000)).await;
        indexes.recover(log.as_ref()).await.unwrap();

        // now=2_000 > deadline: the LOCKED fragment is a candidate again.
        let c = scanner.find_candidate(b"sms", 2_000).await.unwrap().unwrap();
        assert_eq!(c.position, locked_pos);
        assert_eq!(c.task.state, TaskState::Locked);
        assert_eq!(c.task.version, 2);
    }

    #[tokio::test]
    async fn hash_collisions_fall_back_to_byte_comparison() {
        let (log, indexes, scanner) = setup().await;
        // "Aa" and "BB" share a type hash.
        assert_eq!(type_hash(b"Aa"), type_hash(b"BB"));
        let task = TaskInstance::new_task(b"Aa".to_vec(), b"P".to_vec());
        let p = append(&log, &task).await;
        indexes.recover(log.as_ref()).await.unwrap();

        assert!(scanner.find_candidate(b"BB", 100).await.unwrap().is_none());
        let c = scanner.find_candidate(b"Aa", 100).await.unwrap().unwrap();
        assert_eq!(c.position, p);
    }

    #[tokio::test]
    async fn completed_task_is_not_relockable_before_drain() {
        let (log, indexes, scanner) = setup().await;
        let task = TaskInstance::new_task(b"email".to_vec(), b"P".to_vec());
        append(&log, &task).await;
        let locked = task.locked(1, 1_000);
        let pl = append(&log, &locked).await;
        indexes.put_position(task.id, pl).await;
        let pc = append(&log, &locked.completed()).await;
        indexes.remove(task.id, pc).await;

        // The old lease is long expired but maintenance has drained
        // nothing, so every fragment is in the self-authoritative tail.
        // The tombstone must still keep the superseded LOCKED fragment
        // from being handed out again.
        assert!(scanner.find_candidate(b"email", 5_000).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fully_drained_completed_task_is_invisible() {
        let (log, indexes, scanner) = setup().await;
        let task = TaskInstance::new_task(b"email".to_vec(), b"P".to_vec());
        append(&log, &task).await;
        let locked = task.locked(7, 1_000);
        append(&log, &locked).await;
        append(&log, &locked.completed()).await;
        indexes.recover(log.as_ref()).await.unwrap();

        assert!(scanner.find_candidate(b"email", 9_999).await.unwrap().is_none());
        // The whole range is exhausted; the mark reaches the tail.
        assert_eq!(
            indexes.type_high_water(b"email").await,
            log.tail().await.unwrap()
        );
    }

    #[tokio::test]
    async fn corrupt_fragments_are_skipped_not_fatal() {
        let (log, indexes, scanner) = setup().await;
        // A committed fragment of garbage, then a good task.
        let mut garbage = match log.claim(16).await.unwrap() {
            ClaimOutcome::Claimed(f) => f,
            ClaimOutcome::Backpressure => panic!(),
        };
        garbage.buf.copy_from_slice(b"not a record!!!!");
        log.commit(garbage).await.unwrap();

        let task = TaskInstance::new_task(b"email".to_vec(), b"P".to_vec());
        let mut task = task;
        task.id = 16; // first position after the garbage fragment
        let p = append(&log, &task).await;
        indexes.recover(log.as_ref()).await.unwrap();

        let c = scanner.find_candidate(b"email", 100).await.unwrap().unwrap();
        assert_eq!(c.position, p);
    }
}
