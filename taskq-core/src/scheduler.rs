//! Index maintenance — the background task that drains newly committed
//! fragments into the hash indices.
//!
//! Indexing is asynchronous by design: the append path never waits on it,
//! and a lock-scan may briefly see an unindexed tail (which it reads
//! directly from the log). The maintenance task is cooperatively scheduled:
//! one bounded unit of work per tick — drain at most N fragments — then
//! yield. `tick` is public so tests can single-step it instead of racing a
//! background loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::warn;

use crate::error::QueueError;
use crate::index::IndexManager;
use crate::log::Log;

pub struct IndexMaintenance {
    log: Arc<dyn Log>,
    indexes: Arc<IndexManager>,
    /// Maximum fragments applied per tick.
    batch: usize,
    /// Idle sleep between ticks when the drain caught up with the tail.
    interval: Duration,
}

impl IndexMaintenance {
    pub fn new(
        log: Arc<dyn Log>,
        indexes: Arc<IndexManager>,
        batch: usize,
        interval: Duration,
    ) -> Self {
        Self {
            log,
            indexes,
            batch,
            interval,
        }
    }

    /// Drain one bounded batch and checkpoint. Returns how many fragments
    /// were applied (0 = caught up with the tail).
    pub async fn tick(&self) -> Result<usize, QueueError> {
        let mut cursor = self.indexes.drained_position().await;
        let mut applied = 0;
        while applied < self.batch {
            let Some(fragment) = self.log.read_from(cursor).await? else {
                break;
            };
            self.indexes
                .apply_fragment(fragment.position, &fragment.bytes)
                .await;
            cursor = fragment.next;
            applied += 1;
        }
        if applied > 0 {
            self.indexes.note_drained(cursor).await;
            self.indexes.checkpoint().await?;
        }
        Ok(applied)
    }

    /// Returns true when the shutdown signal fired during the idle wait.
    async fn idle(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
            _ = tokio::time::sleep(self.interval) => false,
        }
    }

    /// Run until the shutdown channel flips. One bounded batch per loop
    /// iteration; yields between busy ticks so the append path is never
    /// starved.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.tick().await {
                Ok(0) => {
                    if self.idle(&mut shutdown).await {
                        break;
                    }
                }
                Ok(_) => tokio::task::yield_now().await,
                Err(e) => {
                    // Checkpoints stay behind on failure, which is the safe
                    // direction; retry after the idle interval.
                    warn!(error = %e, "index maintenance tick failed");
                    if self.idle(&mut shutdown).await {
                        break;
                    }
                }
            }
        }
    }
}
