//! Deferred responses — the mechanism that holds a reply open until the
//! log append that justifies it has committed.
//!
//! The pool bounds how many responses may be in flight at once; a response
//! stays in flight until the transport consumes (or drops) its receiver.
//! Exhaustion rejects the new request with backpressure instead of queueing
//! it unboundedly. Dropping a [`DeferredResponse`] without sending (the
//! abort path) closes the channel; the transport observes that as a
//! discarded request, and client-side timeouts are its concern, not this
//! core's.

use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounded pool of in-flight deferred responses.
pub struct ResponsePool {
    semaphore: Arc<Semaphore>,
}

impl ResponsePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
        }
    }

    /// Reserve a response slot, or `None` when the pool is exhausted.
    pub fn try_reserve(&self) -> Option<(DeferredResponse, ResponseReceiver)> {
        let permit = self.semaphore.clone().try_acquire_owned().ok()?;
        let (tx, rx) = oneshot::channel();
        Some((
            DeferredResponse { tx },
            ResponseReceiver {
                rx,
                _permit: permit,
            },
        ))
    }
}

/// Write side of one in-flight response.
pub struct DeferredResponse {
    tx: oneshot::Sender<Vec<u8>>,
}

impl DeferredResponse {
    /// Release the response bytes to the transport. Called only after the
    /// triggering append committed (or when no append was needed).
    pub fn send(self, bytes: Vec<u8>) {
        // A receiver that went away is the transport's problem.
        let _ = self.tx.send(bytes);
    }
}

/// Read side handed back to the transport layer. Holds the pool slot until
/// consumed or dropped.
#[derive(Debug)]
pub struct ResponseReceiver {
    rx: oneshot::Receiver<Vec<u8>>,
    _permit: OwnedSemaphorePermit,
}

impl ResponseReceiver {
    /// Wait for the response. `None` means the request was discarded
    /// (aborted append or handler failure).
    pub async fn recv(self) -> Option<Vec<u8>> {
        self.rx.await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pool_bounds_in_flight_responses() {
        let pool = ResponsePool::new(2);
        let (a_tx, a_rx) = pool.try_reserve().unwrap();
        let _b = pool.try_reserve().unwrap();
        assert!(pool.try_reserve().is_none());

        // The slot frees once the transport consumes the response.
        a_tx.send(b"done".to_vec());
        assert_eq!(a_rx.recv().await.as_deref(), Some(b"done".as_slice()));
        assert!(pool.try_reserve().is_some());
    }

    #[tokio::test]
    async fn unsent_response_stays_in_flight_until_receiver_drops() {
        let pool = ResponsePool::new(1);
        let (resp, rx) = pool.try_reserve().unwrap();
        drop(resp);
        // Sender is gone but the receiver still occupies the slot.
        assert!(pool.try_reserve().is_none());
        assert!(rx.recv().await.is_none());
        assert!(pool.try_reserve().is_some());
    }
}
