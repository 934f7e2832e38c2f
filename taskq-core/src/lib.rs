//! taskq-core — a log-structured, durable task-queue engine.
//!
//! Producers append tasks, consumers poll for a time-bounded lease, execute,
//! and complete; an expired lease makes the task lockable again (at-least-
//! once delivery, idempotent consumers expected). The single source of truth
//! is an append-only, position-addressed log ([`log::Log`]); every state
//! transition appends a new record version, and two hash indices
//! ([`index::IndexManager`]) give O(1) lookup over the log: id → latest
//! position, and task type → scan high-water mark. Crash recovery rebuilds
//! the indices by replaying the log from the last checkpoint through the
//! same transition logic live indexing uses.
//!
//! The replicated log itself, network transport, and the process engine
//! producing tasks are external collaborators behind the ports in [`log`]
//! and [`snapshot`].

pub mod clock;
pub mod codec;
pub mod config;
pub mod error;
pub mod handlers;
pub mod index;
pub mod log;
pub mod queue;
pub mod response;
pub mod scanner;
pub mod scheduler;
pub mod snapshot;
pub mod telemetry;
pub mod types;
pub mod writer;

pub use config::QueueConfig;
pub use error::QueueError;
pub use queue::TaskQueue;
