//! Handler watchdog
//!
//! A watchdog brackets every handler invocation on the monitor thread:
//! `arm` before the call, `reset` after. The deadline implementation
//! raises a warning when a handler overruns its window, which is the
//! usual way a stuck readiness handler gets noticed.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

pub trait Watchdog: Send + Sync + 'static {
    fn arm(&self);
    fn reset(&self);
}

/// Default: no timing envelope at all.
#[derive(Debug, Default)]
pub struct NoWatchdog;

impl Watchdog for NoWatchdog {
    fn arm(&self) {}
    fn reset(&self) {}
}

#[derive(Debug)]
struct DeadlineState {
    deadline: Option<Instant>,
    shutdown: bool,
}

/// Watchdog with a fixed window, checked by a dedicated timer thread. A
/// handler that does not `reset` before the window elapses is reported
/// through a `tracing` warning; the handler itself is not interrupted.
pub struct DeadlineWatchdog {
    state: Arc<(Mutex<DeadlineState>, Condvar)>,
    window: Duration,
    timer: Option<thread::JoinHandle<()>>,
}

impl DeadlineWatchdog {
    pub fn new(window: Duration) -> Self {
        let state = Arc::new((
            Mutex::new(DeadlineState {
                deadline: None,
                shutdown: false,
            }),
            Condvar::new(),
        ));
        let timer = {
            let state = Arc::clone(&state);
            thread::Builder::new()
                .name("monitor-watchdog".into())
                .spawn(move || {
                    let (lock, signal) = &*state;
                    let mut guard = lock.lock();
                    loop {
                        if guard.shutdown {
                            break;
                        }
                        match guard.deadline {
                            None => {
                                signal.wait(&mut guard);
                            }
                            Some(deadline) => {
                                if Instant::now() >= deadline {
                                    tracing::warn!(
                                        window_ms = window.as_millis() as u64,
                                        "resource handler exceeded its watchdog window"
                                    );
                                    // Report once per armed invocation.
                                    guard.deadline = None;
                                } else {
                                    signal.wait_until(&mut guard, deadline);
                                }
                            }
                        }
                    }
                })
                .expect("spawn watchdog thread")
        };
        Self {
            state,
            window,
            timer: Some(timer),
        }
    }
}

impl Watchdog for DeadlineWatchdog {
    fn arm(&self) {
        let (lock, signal) = &*self.state;
        lock.lock().deadline = Some(Instant::now() + self.window);
        signal.notify_one();
    }

    fn reset(&self) {
        let (lock, signal) = &*self.state;
        lock.lock().deadline = None;
        signal.notify_one();
    }
}

impl Drop for DeadlineWatchdog {
    fn drop(&mut self) {
        {
            let (lock, signal) = &*self.state;
            lock.lock().shutdown = true;
            signal.notify_one();
        }
        if let Some(timer) = self.timer.take() {
            let _ = timer.join();
        }
    }
}
