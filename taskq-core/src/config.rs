//! Queue configuration. All knobs have working defaults; deployments load
//! overrides from a JSON document.

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::QueueError;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Active writer threads per queue. This core assumes exactly one — the
    /// log serializes physical claims, and one append path keeps it that
    /// way.
    pub worker_threads: usize,
    /// Bound on concurrently in-flight deferred responses; exhaustion
    /// rejects new requests with backpressure.
    pub response_pool_capacity: usize,
    /// How many backpressured claims the writer retries before reporting
    /// `WriteBackpressure`.
    pub backpressure_retry_budget: u32,
    /// Delay between claim retries, milliseconds.
    pub backpressure_retry_delay_ms: u64,
    /// Maximum fragments the index-maintenance task drains per tick.
    pub drain_batch_size: usize,
    /// Idle sleep between maintenance ticks, milliseconds.
    pub maintenance_interval_ms: u64,
    /// Capacity of the log's claim buffer (in-flight claimed bytes); claims
    /// past it see backpressure. Consumed by the log implementation.
    pub claim_buffer_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            worker_threads: 1,
            response_pool_capacity: 64,
            backpressure_retry_budget: 16,
            backpressure_retry_delay_ms: 1,
            drain_batch_size: 32,
            maintenance_interval_ms: 10,
            claim_buffer_capacity: 1 << 20,
        }
    }
}

impl QueueConfig {
    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        serde_json::from_str(text).context("parsing queue config")
    }

    pub fn from_file(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading queue config {}", path.display()))?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        if self.worker_threads != 1 {
            return Err(QueueError::InvalidRequest(format!(
                "worker_threads must be 1 (got {})",
                self.worker_threads
            )));
        }
        if self.response_pool_capacity == 0 {
            return Err(QueueError::InvalidRequest(
                "response_pool_capacity must be positive".into(),
            ));
        }
        if self.drain_batch_size == 0 {
            return Err(QueueError::InvalidRequest(
                "drain_batch_size must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        QueueConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_json_overrides_defaults() {
        let config = QueueConfig::from_json(r#"{"response_pool_capacity": 4}"#).unwrap();
        assert_eq!(config.response_pool_capacity, 4);
        assert_eq!(config.drain_batch_size, QueueConfig::default().drain_batch_size);
    }

    #[test]
    fn multiple_worker_threads_rejected() {
        let config = QueueConfig {
            worker_threads: 4,
            ..QueueConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
