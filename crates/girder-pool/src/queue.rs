//! Bounded job queue
//!
//! FIFO feeding the workers. `extract` blocks on empty, `insert` blocks
//! on full (with a timeout) for back-pressure, `post` never blocks and is
//! the submission path for threads that must not stall (the resource
//! monitor's, notably); a posted job may transiently exceed the
//! configured capacity. `revoke` removes a queued job by identity.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::job::PoolJob;

pub(crate) fn same_job(a: &Arc<dyn PoolJob>, b: &Arc<dyn PoolJob>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

struct Inner {
    jobs: VecDeque<Arc<dyn PoolJob>>,
    enabled: bool,
}

pub struct JobQueue {
    inner: Mutex<Inner>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl JobQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                jobs: VecDeque::with_capacity(capacity),
                enabled: true,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    /// Append without blocking, regardless of occupancy.
    pub fn post(&self, job: Arc<dyn PoolJob>) {
        let mut inner = self.inner.lock();
        inner.jobs.push_back(job);
        drop(inner);
        self.not_empty.notify_one();
    }

    /// Append with back-pressure: waits up to `timeout` for room.
    pub fn insert(&self, job: Arc<dyn PoolJob>, timeout: Duration) -> Result<(), InsertTimeout> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        while inner.enabled && inner.jobs.len() >= self.capacity {
            if self.not_full.wait_until(&mut inner, deadline).timed_out() {
                return Err(InsertTimeout);
            }
        }
        if !inner.enabled {
            return Err(InsertTimeout);
        }
        inner.jobs.push_back(job);
        drop(inner);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Take the oldest job, blocking while the queue is empty. `None`
    /// when the queue has been disabled: the worker should exit.
    pub fn extract(&self) -> Option<Arc<dyn PoolJob>> {
        let mut inner = self.inner.lock();
        while inner.enabled && inner.jobs.is_empty() {
            self.not_empty.wait(&mut inner);
        }
        if !inner.enabled {
            return None;
        }
        let job = inner.jobs.pop_front();
        drop(inner);
        self.not_full.notify_one();
        job
    }

    /// Remove a queued job by identity. False when it is not queued.
    pub fn revoke(&self, job: &Arc<dyn PoolJob>) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.jobs.len();
        inner.jobs.retain(|queued| !same_job(queued, job));
        let removed = inner.jobs.len() != before;
        drop(inner);
        if removed {
            self.not_full.notify_one();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().jobs.is_empty()
    }

    /// Stop feeding workers; blocked extractors and inserters wake up
    /// and fail.
    pub fn disable(&self) {
        self.inner.lock().enabled = false;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Run `f` with the queue frozen; used for consistent snapshots.
    pub(crate) fn locked<T>(&self, f: impl FnOnce(usize) -> T) -> T {
        let inner = self.inner.lock();
        f(inner.jobs.len())
    }
}

/// The queue stayed full (or was disabled) for the whole wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("queue insert timed out")]
pub struct InsertTimeout;
