//! Hash index manager — the two lookup structures that make the append-only
//! log answer O(1) questions, plus their checkpoint/recovery procedure.
//!
//! - **id index**: `id → last known position` of that id's most recent
//!   durably written version. A scanner that finds a LOCKED fragment whose
//!   position disagrees with this index is looking at a superseded version.
//! - **type index**: `task type bytes → high-water position`, the lower
//!   bound for the next lock-scan of that type. Advanced monotonically,
//!   never decreased.
//!
//! Both indices are fed by one transition function, [`IndexManager::apply_fragment`],
//! used identically by the live maintenance drain and by startup recovery —
//! replay and live operation share a single code path, so there is no second
//! copy of the transition logic to keep in sync.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::codec;
use crate::error::QueueError;
use crate::log::Log;
use crate::snapshot::{IndexSnapshot, SnapshotStore};
use crate::types::{Position, TaskState};

pub const ID_INDEX_NAME: &str = "task-id-index";
pub const TYPE_INDEX_NAME: &str = "task-type-index";

#[derive(Clone, Copy, Debug)]
struct IdEntry {
    position: Position,
    /// Logical tombstone: the task completed at `position`. Kept until the
    /// drain passes that position, so late drains of older fragments cannot
    /// resurrect the id.
    completed: bool,
}

#[derive(Default)]
struct Maps {
    ids: HashMap<u64, IdEntry>,
    types: HashMap<Vec<u8>, Position>,
    /// Fragments before this position have been applied (live drain or
    /// replay). Scanners use this to tell "not yet indexed" apart from
    /// "indexed and gone".
    drained_to: Position,
    id_checkpoint: Position,
    type_checkpoint: Position,
}

pub struct IndexManager {
    store: Arc<dyn SnapshotStore>,
    maps: RwLock<Maps>,
}

impl IndexManager {
    pub fn new(store: Arc<dyn SnapshotStore>) -> Self {
        Self {
            store,
            maps: RwLock::new(Maps::default()),
        }
    }

    // ── id index ──

    /// Position of the current (non-completed) version of `id`, if known.
    pub async fn get_position(&self, id: u64) -> Option<Position> {
        let maps = self.maps.read().await;
        maps.ids
            .get(&id)
            .filter(|e| !e.completed)
            .map(|e| e.position)
    }

    /// Last indexed entry for `id`: its position and whether that version
    /// completed the task. Scanners need the tombstone itself — a completed
    /// id must read as superseded even while its COMPLETED fragment still
    /// sits in the undrained tail of the log.
    pub async fn last_entry(&self, id: u64) -> Option<(Position, bool)> {
        let maps = self.maps.read().await;
        maps.ids.get(&id).map(|e| (e.position, e.completed))
    }

    /// Upsert `id → position`. Monotonic: versions of an id only ever move
    /// forward in the log, so a put with an older position (a lagging drain
    /// re-applying history) is a no-op.
    pub async fn put_position(&self, id: u64, position: Position) {
        let mut maps = self.maps.write().await;
        match maps.ids.get(&id) {
            Some(e) if e.position >= position => {}
            _ => {
                maps.ids.insert(
                    id,
                    IdEntry {
                        position,
                        completed: false,
                    },
                );
            }
        }
    }

    /// Logically remove `id`, completed by the fragment at `position`.
    /// The entry survives as a tombstone until the drain passes it.
    pub async fn remove(&self, id: u64, position: Position) {
        let mut maps = self.maps.write().await;
        match maps.ids.get(&id) {
            Some(e) if e.position > position => {}
            _ => {
                maps.ids.insert(
                    id,
                    IdEntry {
                        position,
                        completed: true,
                    },
                );
            }
        }
    }

    // ── type index ──

    /// High-water mark for `task_type`; 0 when unseen.
    pub async fn type_high_water(&self, task_type: &[u8]) -> Position {
        self.maps
            .read()
            .await
            .types
            .get(task_type)
            .copied()
            .unwrap_or(0)
    }

    /// Advance the high-water mark. A put with a smaller value is a no-op.
    pub async fn advance_type(&self, task_type: &[u8], position: Position) {
        let mut maps = self.maps.write().await;
        match maps.types.get(task_type) {
            Some(&current) if current >= position => {}
            _ => {
                maps.types.insert(task_type.to_vec(), position);
            }
        }
    }

    // ── drain state ──

    /// Everything before this position has been applied to the indices.
    pub async fn drained_position(&self) -> Position {
        self.maps.read().await.drained_to
    }

    pub async fn note_drained(&self, position: Position) {
        let mut maps = self.maps.write().await;
        if position > maps.drained_to {
            maps.drained_to = position;
        }
    }

    /// The single transition function: apply one committed fragment to both
    /// indices. Used by the live maintenance drain and by recovery replay.
    /// Undecodable fragments are logged and skipped — fatal only to the
    /// fragment, not to the consumer.
    pub async fn apply_fragment(&self, position: Position, bytes: &[u8]) {
        let task = match codec::decode(bytes) {
            Ok(task) => task,
            Err(e) => {
                warn!(position, error = %e, "skipping corrupt record during index drain");
                return;
            }
        };

        match task.state {
            TaskState::New | TaskState::Locked => {
                self.put_position(task.id, position).await;
            }
            TaskState::Completed => {
                self.remove(task.id, position).await;
                // Drains run in position order and COMPLETED is terminal, so
                // once the completing fragment itself is drained the
                // tombstone can go.
                let mut maps = self.maps.write().await;
                if let Some(e) = maps.ids.get(&task.id) {
                    if e.completed && e.position <= position {
                        maps.ids.remove(&task.id);
                    }
                }
            }
        }

        if task.state == TaskState::Locked {
            // Everything before a LOCKED fragment for this type was already
            // scanned when the lock was taken; the fragment itself stays at
            // or above the mark so an expiring lease is rescanned.
            self.advance_type(&task.task_type, position).await;
        }
    }

    // ── checkpointing ──

    /// Persist both indices at the current drained position. Written only
    /// after all fragments up to that position were applied, so a stored
    /// checkpoint is never ahead of the true index state.
    pub async fn checkpoint(&self) -> Result<(), QueueError> {
        let (id_snapshot, type_snapshot, position) = {
            let maps = self.maps.read().await;
            let id_entries = maps
                .ids
                .iter()
                .map(|(&id, e)| (id, e.position, e.completed))
                .collect();
            let type_entries = maps
                .types
                .iter()
                .map(|(k, &v)| (k.clone(), v))
                .collect();
            (
                IndexSnapshot::Ids {
                    position: maps.drained_to,
                    entries: id_entries,
                },
                IndexSnapshot::Types {
                    position: maps.drained_to,
                    entries: type_entries,
                },
                maps.drained_to,
            )
        };

        self.store
            .save(ID_INDEX_NAME, &id_snapshot)
            .await
            .map_err(|e| QueueError::Snapshot(e.to_string()))?;
        self.store
            .save(TYPE_INDEX_NAME, &type_snapshot)
            .await
            .map_err(|e| QueueError::Snapshot(e.to_string()))?;

        let mut maps = self.maps.write().await;
        maps.id_checkpoint = maps.id_checkpoint.max(position);
        maps.type_checkpoint = maps.type_checkpoint.max(position);
        Ok(())
    }

    /// Replay must restart from the minimum of the two checkpoints — the
    /// indices may lag independently and neither may skip un-indexed data.
    pub async fn recovery_position(&self) -> Position {
        let maps = self.maps.read().await;
        maps.id_checkpoint.min(maps.type_checkpoint)
    }

    async fn load_snapshots(&self) -> Result<(), QueueError> {
        let id_snapshot = self
            .store
            .load(ID_INDEX_NAME)
            .await
            .map_err(|e| QueueError::Snapshot(e.to_string()))?;
        let type_snapshot = self
            .store
            .load(TYPE_INDEX_NAME)
            .await
            .map_err(|e| QueueError::Snapshot(e.to_string()))?;

        let mut maps = self.maps.write().await;
        *maps = Maps::default();

        if let Some(IndexSnapshot::Ids { position, entries }) = id_snapshot {
            maps.id_checkpoint = position;
            for (id, position, completed) in entries {
                maps.ids.insert(
                    id,
                    IdEntry {
                        position,
                        completed,
                    },
                );
            }
        }
        if let Some(IndexSnapshot::Types { position, entries }) = type_snapshot {
            maps.type_checkpoint = position;
            for (task_type, position) in entries {
                maps.types.insert(task_type, position);
            }
        }
        maps.drained_to = maps.id_checkpoint.min(maps.type_checkpoint);
        Ok(())
    }

    async fn replay(&self, log: &dyn Log, mut cursor: Position) -> Result<Position, QueueError> {
        while let Some(fragment) = log.read_from(cursor).await? {
            self.apply_fragment(fragment.position, &fragment.bytes).await;
            cursor = fragment.next;
        }
        self.note_drained(cursor).await;
        Ok(cursor)
    }

    /// Startup recovery: load the last snapshots, replay the log from the
    /// older of the two checkpoints through the same transition logic as
    /// live operation, then checkpoint. Replay is resumable — until the
    /// final checkpoint lands, another startup replays from the same
    /// unmoved position — and idempotent, since every applied transition is
    /// monotonic.
    pub async fn recover(&self, log: &dyn Log) -> Result<(), QueueError> {
        self.load_snapshots().await?;
        let from = self.recovery_position().await;
        let drained = self.replay(log, from).await?;
        self.checkpoint().await?;
        info!(from, drained, "index recovery complete");
        Ok(())
    }

    /// Full rebuild from position 0 with cleared state. The response to
    /// [`QueueError::IndexInconsistency`] — a corrupt index must never be
    /// limped along, it can double-lock tasks.
    pub async fn rebuild(&self, log: &dyn Log) -> Result<(), QueueError> {
        {
            let mut maps = self.maps.write().await;
            *maps = Maps::default();
        }
        let drained = self.replay(log, 0).await?;
        self.checkpoint().await?;
        info!(drained, "index rebuild from position 0 complete");
        Ok(())
    }
}
