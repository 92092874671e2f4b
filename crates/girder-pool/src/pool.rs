//! Worker pool
//!
//! A bounded set of worker threads draining the shared [`JobQueue`].
//! Each worker body is a [`Minion`]; one extra minion can be driven from
//! the owner's own thread through [`WorkerPool::join`]. Revocation first
//! tries queue removal, then waits on the executing worker's completion
//! signal; a worker revoking its own running job never deadlocks. An
//! optional idle callback fires when the queue is empty and no minion is
//! active.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use crate::job::{Disposition, Job, PoolJob, RescheduleDecision, Runnable, State};
use crate::queue::{same_job, JobQueue};
use crate::scheduler::Scheduler;

/// Revocation failures; success means the job neither is queued nor will
/// run again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RevokeError {
    #[error("job is not queued and not executing")]
    UnknownKey,
    #[error("timed out waiting for the executing worker")]
    TimedOut,
}

/// Submission failure: the queue stayed full for the whole wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("timed out waiting for queue room")]
    TimedOut,
}

/// Consistent view of the pool, taken under the queue lock.
#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    /// Jobs waiting in the queue.
    pub pending: usize,
    /// Minions currently executing a job.
    pub occupation: u32,
    /// Per-minion run counters, workers first, external minion last.
    pub runs: Vec<u32>,
}

type IdleCallback = Box<dyn Fn() + Send + Sync>;

struct Shared {
    queue: Arc<JobQueue>,
    scheduler: Option<Scheduler>,
    idle: Option<IdleCallback>,
    minions: Mutex<Vec<Arc<Minion>>>,
}

impl Shared {
    /// Route a post-execution disposition.
    fn settle(&self, job: Arc<dyn PoolJob>, disposition: Disposition) {
        match disposition {
            Disposition::Completed => {}
            Disposition::Resubmit => self.queue.post(job),
            Disposition::Schedule(at) => {
                let due = match at {
                    Some(at) => at <= Instant::now(),
                    None => true,
                };
                if !due {
                    if let Some(scheduler) = &self.scheduler {
                        scheduler.schedule(at.unwrap(), job);
                        return;
                    }
                }
                // Without a scheduler every re-enqueue is immediate.
                if job.claim_scheduled_fire() {
                    self.queue.post(job);
                }
            }
        }
    }

    fn maybe_idle(&self) {
        if let Some(callback) = &self.idle {
            let idle = self.queue.locked(|pending| {
                pending == 0
                    && self
                        .minions
                        .lock()
                        .iter()
                        .all(|minion| !minion.is_active())
            });
            if idle {
                callback();
            }
        }
    }
}

enum CompletionWait {
    NotRunning,
    Completed,
    TimedOut,
}

/// A worker body. Pool workers run one each on their own thread; the
/// external minion is run by whoever calls [`WorkerPool::join`].
pub struct Minion {
    current: Mutex<Option<Arc<dyn PoolJob>>>,
    completed: Condvar,
    runs: AtomicU32,
    thread_id: Mutex<Option<thread::ThreadId>>,
}

impl Minion {
    fn new() -> Self {
        Self {
            current: Mutex::new(None),
            completed: Condvar::new(),
            runs: AtomicU32::new(0),
            thread_id: Mutex::new(None),
        }
    }

    fn is_active(&self) -> bool {
        self.current.lock().is_some()
    }

    fn runs(&self) -> u32 {
        self.runs.load(Ordering::Relaxed)
    }

    fn thread_id(&self) -> Option<thread::ThreadId> {
        *self.thread_id.lock()
    }

    /// Drain the queue until it is disabled.
    fn process(&self, shared: &Shared) {
        *self.thread_id.lock() = Some(thread::current().id());
        while let Some(job) = shared.queue.extract() {
            self.runs.fetch_add(1, Ordering::Relaxed);
            *self.current.lock() = Some(Arc::clone(&job));

            job.dispatch();
            let disposition = job.closure();
            shared.settle(Arc::clone(&job), disposition);

            // Completion must be observable before the idle check so a
            // revoker blocked on this run wakes first.
            *self.current.lock() = None;
            self.completed.notify_all();

            shared.maybe_idle();
        }
        *self.thread_id.lock() = None;
    }

    /// Wait until the given job is no longer this minion's current one.
    fn completed(&self, job: &Arc<dyn PoolJob>, timeout: Duration) -> CompletionWait {
        let deadline = Instant::now() + timeout;
        let mut current = self.current.lock();
        let runs_it = |current: &Option<Arc<dyn PoolJob>>| {
            current.as_ref().map_or(false, |active| same_job(active, job))
        };
        if !runs_it(&current) {
            return CompletionWait::NotRunning;
        }
        while runs_it(&current) {
            if self.completed.wait_until(&mut current, deadline).timed_out() {
                return if runs_it(&current) {
                    CompletionWait::TimedOut
                } else {
                    CompletionWait::Completed
                };
            }
        }
        CompletionWait::Completed
    }
}

/// Pool configuration.
pub struct WorkerPoolBuilder {
    workers: usize,
    queue_capacity: usize,
    scheduler: bool,
    external: bool,
    idle: Option<IdleCallback>,
}

impl WorkerPoolBuilder {
    pub fn workers(mut self, count: usize) -> Self {
        self.workers = count;
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Attach a deadline scheduler thread for timed submissions.
    pub fn with_scheduler(mut self) -> Self {
        self.scheduler = true;
        self
    }

    /// Add an external minion the owner drives through `join`.
    pub fn with_external_minion(mut self) -> Self {
        self.external = true;
        self
    }

    /// Invoked whenever the queue drains and the last active minion
    /// finishes.
    pub fn with_idle_callback(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.idle = Some(Box::new(callback));
        self
    }

    pub fn build(self) -> WorkerPool {
        let queue = Arc::new(JobQueue::new(self.queue_capacity));
        let scheduler = self.scheduler.then(|| Scheduler::new(Arc::clone(&queue)));
        let shared = Arc::new(Shared {
            queue,
            scheduler,
            idle: self.idle,
            minions: Mutex::new(Vec::new()),
        });

        let mut threads = Vec::with_capacity(self.workers);
        for index in 0..self.workers {
            let minion = Arc::new(Minion::new());
            shared.minions.lock().push(Arc::clone(&minion));
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("pool-worker-{index}"))
                .spawn(move || minion.process(&shared))
                .expect("spawn pool worker");
            threads.push(handle);
        }

        let external = self.external.then(|| {
            let minion = Arc::new(Minion::new());
            shared.minions.lock().push(Arc::clone(&minion));
            minion
        });

        tracing::debug!(
            workers = self.workers,
            external = external.is_some(),
            "worker pool started"
        );
        WorkerPool {
            shared,
            threads,
            external,
        }
    }
}

pub struct WorkerPool {
    shared: Arc<Shared>,
    threads: Vec<thread::JoinHandle<()>>,
    external: Option<Arc<Minion>>,
}

impl WorkerPool {
    pub fn builder() -> WorkerPoolBuilder {
        WorkerPoolBuilder {
            workers: 1,
            queue_capacity: 16,
            scheduler: false,
            external: false,
            idle: None,
        }
    }

    /// Enqueue a job, blocking up to `timeout` on a full queue.
    /// Submitting a job that is already on its way is a no-op.
    pub fn submit<R: Runnable>(
        &self,
        job: &Arc<Job<R>>,
        timeout: Duration,
    ) -> Result<(), SubmitError> {
        if job.claim_submit() {
            let handle: Arc<dyn PoolJob> = Arc::clone(job) as Arc<dyn PoolJob>;
            if self.shared.queue.insert(handle, timeout).is_err() {
                job.abandon_submit();
                return Err(SubmitError::TimedOut);
            }
        }
        Ok(())
    }

    /// Enqueue without ever blocking. The submission path for threads
    /// that must not stall, the resource-monitor thread in particular.
    pub fn post<R: Runnable>(&self, job: &Arc<Job<R>>) {
        if job.claim_submit() {
            let handle: Arc<dyn PoolJob> = Arc::clone(job) as Arc<dyn PoolJob>;
            self.shared.queue.post(handle);
        }
    }

    /// Submit at (or after) an absolute time. Without a scheduler the
    /// submission is immediate. Rescheduling a job that is already
    /// submitted or executing records the new time; the overlay routes
    /// it after the current run.
    pub fn schedule<R: Runnable>(&self, at: Instant, job: &Arc<Job<R>>) {
        match job.claim_reschedule(at) {
            RescheduleDecision::Recorded | RescheduleDecision::Ignored => {}
            RescheduleDecision::Handed => {
                let handle: Arc<dyn PoolJob> = Arc::clone(job) as Arc<dyn PoolJob>;
                match (&self.shared.scheduler, at <= Instant::now()) {
                    (Some(scheduler), false) => scheduler.schedule(at, handle),
                    _ => {
                        if handle.claim_scheduled_fire() {
                            self.shared.queue.post(handle);
                        }
                    }
                }
            }
        }
    }

    /// Cancel a job and wait for any in-flight execution to finish.
    ///
    /// Success means the job will not run again until resubmitted. A
    /// worker revoking the job it is itself executing gets immediate
    /// success (waiting would deadlock); the current run still finishes.
    pub fn revoke<R: Runnable>(
        &self,
        job: &Arc<Job<R>>,
        timeout: Duration,
    ) -> Result<(), RevokeError> {
        let Some(claimed_from) = job.claim_revoke() else {
            return Err(RevokeError::UnknownKey);
        };
        let handle: Arc<dyn PoolJob> = Arc::clone(job) as Arc<dyn PoolJob>;

        if let Some(scheduler) = &self.shared.scheduler {
            scheduler.revoke(&handle);
        }
        if self.shared.queue.revoke(&handle) {
            job.revoked();
            return Ok(());
        }

        let caller = thread::current().id();
        let minions = self.shared.minions.lock().clone();
        for minion in minions {
            if minion.thread_id() == Some(caller) {
                // Self-revocation from inside the running job.
                job.revoked();
                return Ok(());
            }
            match minion.completed(&handle, timeout) {
                CompletionWait::NotRunning => {}
                CompletionWait::Completed => {
                    job.revoked();
                    return Ok(());
                }
                CompletionWait::TimedOut => return Err(RevokeError::TimedOut),
            }
        }

        job.revoked();
        if claimed_from == State::Schedule {
            // Held by the scheduler; the revocation above dropped it.
            Ok(())
        } else {
            Err(RevokeError::UnknownKey)
        }
    }

    /// Run the external minion on the caller's thread until the pool
    /// stops.
    pub fn join(&self) {
        if let Some(external) = &self.external {
            external.process(&self.shared);
        }
    }

    pub fn worker_count(&self) -> usize {
        self.threads.len()
    }

    pub fn pending(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        self.shared.queue.locked(|pending| {
            let minions = self.shared.minions.lock();
            PoolSnapshot {
                pending,
                occupation: minions.iter().filter(|m| m.is_active()).count() as u32,
                runs: minions.iter().map(|m| m.runs()).collect(),
            }
        })
    }

    /// Stop feeding jobs; workers exit after their current run. The
    /// threads are joined on drop.
    pub fn stop(&self) {
        self.shared.queue.disable();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shared.queue.disable();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        tracing::debug!("worker pool stopped");
    }
}
