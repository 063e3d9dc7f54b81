//! Background jobs: deferred work with retries, backoff, and a dead-letter
//! queue.
//!
//! The API enqueues work (rollup recomputation, projection rebuilds) instead
//! of doing it on the request path; the `JobRunner` claims and executes jobs
//! on a background thread.

pub mod runner;
pub mod store;
pub mod types;

pub use runner::{JobRunner, JobRunnerConfig, JobRunnerHandle, RunnerStats};
pub use store::{InMemoryJobStore, JobStats, JobStore, JobStoreError};
pub use types::{
    BackoffStrategy, DeadLetterEntry, Job, JobAttemptRecord, JobId, JobKind, JobResult, JobStatus,
    RetryPolicy,
};
