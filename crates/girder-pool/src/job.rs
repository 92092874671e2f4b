//! Job lifecycle
//!
//! A job moves through `IDLE -> SUBMITTED -> EXECUTING -> IDLE` with
//! three overlays resolving races: `RESUBMIT` (submit while executing),
//! `SCHEDULE` (reschedule pending), `REVOKING` (cancellation in
//! progress). Every transition is a compare-and-swap on one atomic; no
//! lock guards the state, so submit/reschedule/revoke may race freely
//! without losing or duplicating a dispatch.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

/// The work body a job wraps.
pub trait Runnable: Send + Sync + 'static {
    fn run(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum State {
    Idle = 0,
    Submitted,
    Executing,
    Resubmit,
    Schedule,
    Revoking,
}

impl State {
    fn from_u8(raw: u8) -> State {
        match raw {
            0 => State::Idle,
            1 => State::Submitted,
            2 => State::Executing,
            3 => State::Resubmit,
            4 => State::Schedule,
            _ => State::Revoking,
        }
    }
}

/// What the worker does with a job after its execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Nothing pending; the job went back to idle (or is being revoked).
    Completed,
    /// A submit arrived during execution; re-enqueue immediately.
    Resubmit,
    /// A reschedule arrived; hand to the scheduler for the given time.
    Schedule(Option<Instant>),
}

/// Pool-facing surface of a job, object-safe so queues and workers can
/// hold jobs of different runnable types together.
pub trait PoolJob: Send + Sync {
    /// Execution start: runs the body iff the job is still submitted.
    fn dispatch(&self);

    /// Execution end: resolves the overlay accumulated while running.
    fn closure(&self) -> Disposition;

    /// Scheduler fire: move `SCHEDULE -> SUBMITTED`; false when the job
    /// was revoked in the meantime and must not be enqueued.
    fn claim_scheduled_fire(&self) -> bool;
}

/// A [`Runnable`] with the lifecycle state machine attached. Shared as
/// `Arc<Job<R>>` between the owner and the pool.
pub struct Job<R: Runnable> {
    runnable: R,
    state: AtomicU8,
    deadline: Mutex<Option<Instant>>,
}

impl<R: Runnable> Job<R> {
    pub fn new(runnable: R) -> Self {
        Self {
            runnable,
            state: AtomicU8::new(State::Idle as u8),
            deadline: Mutex::new(None),
        }
    }

    pub fn inner(&self) -> &R {
        &self.runnable
    }

    pub fn is_idle(&self) -> bool {
        self.load() == State::Idle
    }

    fn load(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    fn swap(&self, from: State, to: State) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Submit intent. True means the caller owns enqueueing the job.
    ///
    /// Submitting an executing job coalesces into one pending resubmit;
    /// submitting an already submitted, rescheduled or revoked job is a
    /// no-op.
    pub(crate) fn claim_submit(&self) -> bool {
        if self.swap(State::Executing, State::Resubmit) {
            return false;
        }
        self.swap(State::Idle, State::Submitted)
    }

    /// Roll a submit claim back when the queue refused the job.
    pub(crate) fn abandon_submit(&self) {
        let _ = self.swap(State::Submitted, State::Idle);
    }

    /// Reschedule intent. `Handed` means nothing else is holding the job
    /// and the caller must give it to the scheduler; `Recorded` means an
    /// active state picked the new time up; `Ignored` means a revoke is
    /// in progress.
    pub(crate) fn claim_reschedule(&self, at: Instant) -> RescheduleDecision {
        loop {
            let current = self.load();
            match current {
                State::Revoking => return RescheduleDecision::Ignored,
                State::Idle => {
                    *self.deadline.lock() = Some(at);
                    if self.swap(State::Idle, State::Schedule) {
                        return RescheduleDecision::Handed;
                    }
                }
                State::Schedule => {
                    // Overwrite the recorded time.
                    *self.deadline.lock() = Some(at);
                    return RescheduleDecision::Recorded;
                }
                State::Submitted | State::Executing | State::Resubmit => {
                    *self.deadline.lock() = Some(at);
                    if self.swap(current, State::Schedule) {
                        return RescheduleDecision::Recorded;
                    }
                }
            }
        }
    }

    /// Revoke intent. Returns the state the job was claimed from; the
    /// caller must then confirm completion through [`Job::revoked`].
    /// `None` means the job was idle and there is nothing to revoke.
    pub(crate) fn claim_revoke(&self) -> Option<State> {
        loop {
            let current = self.load();
            match current {
                State::Idle => return None,
                State::Revoking => return Some(State::Revoking),
                _ => {
                    if self.swap(current, State::Revoking) {
                        return Some(current);
                    }
                }
            }
        }
    }

    /// Completion of a revoke, after the caller confirmed the job is no
    /// longer queued or running.
    pub fn revoked(&self) {
        let flipped = self.swap(State::Revoking, State::Idle);
        debug_assert!(flipped, "revoked() without a preceding revoke");
    }
}

/// Outcome of a reschedule request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RescheduleDecision {
    Handed,
    Recorded,
    Ignored,
}

impl<R: Runnable> PoolJob for Job<R> {
    fn dispatch(&self) {
        if self.swap(State::Submitted, State::Executing) {
            self.runnable.run();
        }
    }

    fn closure(&self) -> Disposition {
        if self.swap(State::Executing, State::Idle) {
            return Disposition::Completed;
        }
        if self.swap(State::Resubmit, State::Submitted) {
            return Disposition::Resubmit;
        }
        if self.load() == State::Schedule {
            // The state stays SCHEDULE while the scheduler holds the
            // job; the fire claims it (and a revoke in between makes
            // the claim fail).
            return Disposition::Schedule(*self.deadline.lock());
        }
        // Revoking: held until the revoker confirms.
        Disposition::Completed
    }

    fn claim_scheduled_fire(&self) -> bool {
        self.swap(State::Schedule, State::Submitted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    struct Probe {
        runs: AtomicU32,
    }

    impl Runnable for Probe {
        fn run(&self) {
            self.runs.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn probe() -> Job<Probe> {
        Job::new(Probe {
            runs: AtomicU32::new(0),
        })
    }

    #[test]
    fn test_submit_is_idempotent() {
        let job = probe();
        assert!(job.claim_submit());
        assert!(!job.claim_submit());
        assert!(!job.claim_submit());
    }

    #[test]
    fn test_dispatch_runs_once_per_submission() {
        let job = probe();
        assert!(job.claim_submit());
        job.dispatch();
        assert_eq!(job.inner().runs.load(Ordering::SeqCst), 1);
        assert_eq!(job.closure(), Disposition::Completed);
        assert!(job.is_idle());

        // A dispatch without a submission is a no-op.
        job.dispatch();
        assert_eq!(job.inner().runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_submit_during_execution_coalesces() {
        let job = probe();
        assert!(job.claim_submit());
        // Simulate execution start without running the body.
        assert!(job.swap(State::Submitted, State::Executing));
        assert!(!job.claim_submit());
        assert!(!job.claim_submit());
        assert_eq!(job.closure(), Disposition::Resubmit);
    }

    #[test]
    fn test_reschedule_records_time() {
        let job = probe();
        let at = Instant::now() + Duration::from_millis(50);
        assert_eq!(job.claim_reschedule(at), RescheduleDecision::Handed);
        let later = at + Duration::from_millis(50);
        assert_eq!(job.claim_reschedule(later), RescheduleDecision::Recorded);
        assert_eq!(*job.deadline.lock(), Some(later));
    }

    #[test]
    fn test_reschedule_during_execution_routes_to_scheduler() {
        let job = probe();
        assert!(job.claim_submit());
        assert!(job.swap(State::Submitted, State::Executing));
        let at = Instant::now() + Duration::from_millis(10);
        assert_eq!(job.claim_reschedule(at), RescheduleDecision::Recorded);
        assert_eq!(job.closure(), Disposition::Schedule(Some(at)));
    }

    #[test]
    fn test_revoke_holds_until_confirmed() {
        let job = probe();
        assert!(job.claim_submit());
        assert!(job.claim_revoke().is_some());
        // The dispatch is suppressed and the closure keeps the state.
        job.dispatch();
        assert_eq!(job.inner().runs.load(Ordering::SeqCst), 0);
        assert_eq!(job.closure(), Disposition::Completed);
        assert!(!job.is_idle());
        job.revoked();
        assert!(job.is_idle());
    }

    #[test]
    fn test_revoke_on_idle_is_a_noop() {
        let job = probe();
        assert!(job.claim_revoke().is_none());
        assert!(job.is_idle());
    }

    #[test]
    fn test_revoked_job_ignores_submit_and_reschedule() {
        let job = probe();
        assert!(job.claim_submit());
        assert!(job.claim_revoke().is_some());
        assert!(!job.claim_submit());
        assert_eq!(
            job.claim_reschedule(Instant::now()),
            RescheduleDecision::Ignored
        );
        assert!(!job.claim_scheduled_fire());
        job.revoked();
    }
}
