//! Snapshot store port — durable home for index checkpoints.
//!
//! Each index persists `(name, checkpointed position, entries)` as one
//! snapshot document. A snapshot is written only after every fragment up to
//! its position has been applied, so a loaded snapshot is always at-or-behind
//! the true log state and recovery replays the gap.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::Position;

/// Serialized contents of one index at a checkpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexSnapshot {
    /// id → last known position (plus completed tombstones not yet drained
    /// past).
    Ids {
        position: Position,
        entries: Vec<(u64, Position, bool)>,
    },
    /// task type bytes → high-water position.
    Types {
        position: Position,
        entries: Vec<(Vec<u8>, Position)>,
    },
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save(&self, name: &str, snapshot: &IndexSnapshot) -> anyhow::Result<()>;
    async fn load(&self, name: &str) -> anyhow::Result<Option<IndexSnapshot>>;
}

// ─── In-memory implementation ─────────────────────────────────

/// Snapshot store for tests and ephemeral queues.
#[derive(Default)]
pub struct InMemorySnapshotStore {
    snapshots: tokio::sync::Mutex<std::collections::HashMap<String, IndexSnapshot>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn save(&self, name: &str, snapshot: &IndexSnapshot) -> anyhow::Result<()> {
        self.snapshots
            .lock()
            .await
            .insert(name.to_string(), snapshot.clone());
        Ok(())
    }

    async fn load(&self, name: &str) -> anyhow::Result<Option<IndexSnapshot>> {
        Ok(self.snapshots.lock().await.get(name).cloned())
    }
}

// ─── File-backed implementation ───────────────────────────────

/// JSON-file snapshot store. Writes go to a temp file first and are renamed
/// into place, so a crash mid-write leaves the previous snapshot intact.
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.snapshot.json"))
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn save(&self, name: &str, snapshot: &IndexSnapshot) -> anyhow::Result<()> {
        use anyhow::Context;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating snapshot dir {}", self.dir.display()))?;
        let bytes = serde_json::to_vec(snapshot)?;
        let path = self.path(name);
        let tmp = self.dir.join(format!("{name}.snapshot.json.tmp"));
        tokio::fs::write(&tmp, &bytes)
            .await
            .with_context(|| format!("writing snapshot {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("installing snapshot {}", path.display()))?;
        Ok(())
    }

    async fn load(&self, name: &str) -> anyhow::Result<Option<IndexSnapshot>> {
        use anyhow::Context;

        let path = self.path(name);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(anyhow::Error::from(e))
                    .with_context(|| format!("reading snapshot {}", path.display()))
            }
        };
        let snapshot = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing snapshot {}", path.display()))?;
        Ok(Some(snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_store_round_trips_and_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path());

        assert!(store.load("task-id-index").await.unwrap().is_none());

        let snap = IndexSnapshot::Ids {
            position: 128,
            entries: vec![(7, 64, false), (9, 90, true)],
        };
        store.save("task-id-index", &snap).await.unwrap();
        assert_eq!(store.load("task-id-index").await.unwrap(), Some(snap));

        let newer = IndexSnapshot::Ids {
            position: 256,
            entries: vec![(7, 200, false)],
        };
        store.save("task-id-index", &newer).await.unwrap();
        assert_eq!(store.load("task-id-index").await.unwrap(), Some(newer));
    }

    #[tokio::test]
    async fn type_snapshot_round_trips_byte_keys() {
        let store = InMemorySnapshotStore::new();
        let snap = IndexSnapshot::Types {
            position: 10,
            entries: vec![(b"email".to_vec(), 10), (b"sms".to_vec(), 0)],
        };
        store.save("task-type-index", &snap).await.unwrap();
        assert_eq!(store.load("task-type-index").await.unwrap(), Some(snap));
    }
}
