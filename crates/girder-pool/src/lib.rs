//! girder-pool: queue-fed worker pool with an atomic job lifecycle
//!
//! This crate contains the job framework of the girder support library:
//! - [`Job`] wrapping a [`Runnable`] with the CAS lifecycle state machine
//!   (submit, reschedule, revoke and self-resubmission race-free)
//! - [`JobQueue`]: bounded FIFO with blocking insert, non-blocking post,
//!   blocking extract and identity revocation
//! - [`Scheduler`]: deadline thread re-enqueueing jobs at an absolute time
//! - [`WorkerPool`]: worker threads, optional external minion driven via
//!   `join`, revoke-with-completion-wait, idle callback and a
//!   serializable snapshot

pub mod job;
pub mod pool;
pub mod queue;
pub mod scheduler;

// Re-export commonly used types
pub use job::{Disposition, Job, PoolJob, Runnable};
pub use pool::{PoolSnapshot, RevokeError, SubmitError, WorkerPool, WorkerPoolBuilder};
pub use queue::{InsertTimeout, JobQueue};
pub use scheduler::Scheduler;
