//! Deadline scheduler
//!
//! A timer thread holding jobs with an absolute submission time. When a
//! deadline passes, the job moves back to the submitted state and is
//! posted to the pool queue (posting, not inserting: the timer thread
//! must not block on back-pressure). Revocation removes a held job by
//! identity before it fires.

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use crate::job::PoolJob;
use crate::queue::{same_job, JobQueue};

enum Command {
    Schedule { at: Instant, job: Arc<dyn PoolJob> },
    Revoke { job: Arc<dyn PoolJob> },
    Stop,
}

pub struct Scheduler {
    commands: Sender<Command>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(queue: Arc<JobQueue>) -> Self {
        let (commands, feed) = bounded(64);
        let thread = thread::Builder::new()
            .name("pool-scheduler".into())
            .spawn(move || run(feed, queue))
            .expect("spawn scheduler thread");
        Self {
            commands,
            thread: Some(thread),
        }
    }

    /// Hold `job` until `at`, then re-enqueue it.
    pub fn schedule(&self, at: Instant, job: Arc<dyn PoolJob>) {
        let _ = self.commands.send(Command::Schedule { at, job });
    }

    /// Drop a held job before it fires. The job's own state decides
    /// whether a concurrent fire still enqueues it.
    pub fn revoke(&self, job: &Arc<dyn PoolJob>) {
        let _ = self.commands.send(Command::Revoke {
            job: Arc::clone(job),
        });
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Stop);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

struct Held {
    at: Instant,
    job: Arc<dyn PoolJob>,
}

fn run(feed: Receiver<Command>, queue: Arc<JobQueue>) {
    let mut held: Vec<Held> = Vec::new();
    loop {
        // Fire everything due; the job may have been revoked while held,
        // in which case its state refuses the fire and it is dropped.
        let now = Instant::now();
        let mut index = 0;
        while index < held.len() {
            if held[index].at <= now {
                let entry = held.swap_remove(index);
                if entry.job.claim_scheduled_fire() {
                    queue.post(entry.job);
                }
            } else {
                index += 1;
            }
        }

        let next = held.iter().map(|entry| entry.at).min();
        let command = match next {
            Some(deadline) => {
                let now = Instant::now();
                if deadline <= now {
                    continue;
                }
                match feed.recv_timeout(deadline - now) {
                    Ok(command) => command,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            None => match feed.recv() {
                Ok(command) => command,
                Err(_) => break,
            },
        };
        match command {
            Command::Schedule { at, job } => held.push(Held { at, job }),
            Command::Revoke { job } => held.retain(|entry| !same_job(&entry.job, &job)),
            Command::Stop => break,
        }
    }
}
