//! Monitor loop
//!
//! One background thread owns the poller. Every cycle it re-syncs the
//! registered set (querying each resource's interest mask, evicting the
//! ones that report none), blocks for readiness, and delivers events to
//! the affected handlers one at a time. Registration changes from other
//! threads signal the waker so the next cycle observes them.

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use parking_lot::{Condvar, Mutex};

use crate::resource::{Resource, CLOSED, ERROR, READABLE, WRITABLE};
use crate::watchdog::{NoWatchdog, Watchdog};

const WAKE: Token = Token(usize::MAX);

/// Construction failures. A monitor that failed to build has no thread
/// and can never accept registrations.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("Monitor setup failed: {0}")]
    Setup(#[from] io::Error),
}

struct Entry {
    key: usize,
    resource: Arc<dyn Resource>,
    /// Mask currently registered with the poller, if any.
    interest: Option<u16>,
}

struct Shared {
    entries: Vec<Entry>,
    next_key: usize,
    /// Key whose handler is currently running on the monitor thread.
    active: Option<usize>,
    stopping: bool,
}

struct Inner<W> {
    shared: Mutex<Shared>,
    /// Signaled after every handler completion; `unregister` waits here.
    settled: Condvar,
    registry: Registry,
    waker: Waker,
    runs: AtomicU32,
    watchdog: W,
}

/// Owner of the monitor thread and the registered resource set.
///
/// `unregister` is synchronous: once it returns the resource's handler
/// will never run again, so the caller may free the resource. Handlers
/// run without the registration lock, which makes re-entrant
/// `register`/`unregister` from inside a handler legal.
pub struct ResourceMonitor<W: Watchdog = NoWatchdog> {
    inner: Arc<Inner<W>>,
    thread: Option<thread::JoinHandle<()>>,
    thread_id: thread::ThreadId,
}

impl ResourceMonitor<NoWatchdog> {
    pub fn new() -> Result<Self, MonitorError> {
        Self::with_watchdog(NoWatchdog)
    }
}

impl<W: Watchdog> ResourceMonitor<W> {
    /// Build a monitor whose handler invocations are bracketed by the
    /// given watchdog.
    pub fn with_watchdog(watchdog: W) -> Result<Self, MonitorError> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKE)?;
        let inner = Arc::new(Inner {
            shared: Mutex::new(Shared {
                entries: Vec::new(),
                next_key: 0,
                active: None,
                stopping: false,
            }),
            settled: Condvar::new(),
            registry,
            waker,
            runs: AtomicU32::new(0),
            watchdog,
        });
        let thread = {
            let inner = Arc::clone(&inner);
            thread::Builder::new()
                .name("resource-monitor".into())
                .spawn(move || run(inner, poll))?
        };
        let thread_id = thread.thread().id();
        Ok(Self {
            inner,
            thread: Some(thread),
            thread_id,
        })
    }

    /// Append a resource to the monitored set. The next wait cycle picks
    /// it up.
    pub fn register(&self, resource: Arc<dyn Resource>) {
        {
            let mut shared = self.inner.shared.lock();
            debug_assert!(
                !shared
                    .entries
                    .iter()
                    .any(|e| Arc::as_ptr(&e.resource) as *const () == Arc::as_ptr(&resource) as *const ()),
                "resource registered twice"
            );
            let key = shared.next_key;
            shared.next_key = shared.next_key.wrapping_add(1);
            shared.entries.push(Entry {
                key,
                resource,
                interest: None,
            });
        }
        let _ = self.inner.waker.wake();
    }

    /// Remove a resource. Blocks until an in-flight handler invocation
    /// for it has completed (unless called from that very handler), so
    /// after return the monitor never touches the resource again.
    pub fn unregister(&self, resource: &dyn Resource) {
        let removed_key = {
            let mut shared = self.inner.shared.lock();
            let target = resource as *const dyn Resource as *const ();
            match shared
                .entries
                .iter()
                .position(|e| Arc::as_ptr(&e.resource) as *const () == target)
            {
                Some(index) => {
                    let entry = shared.entries.remove(index);
                    if entry.interest.is_some() {
                        let fd = entry.resource.descriptor();
                        let _ = self.inner.registry.deregister(&mut SourceFd(&fd));
                    }
                    Some(entry.key)
                }
                None => None,
            }
        };
        let _ = self.inner.waker.wake();
        if let Some(key) = removed_key {
            if thread::current().id() != self.thread_id {
                let mut shared = self.inner.shared.lock();
                while shared.active == Some(key) {
                    self.inner.settled.wait(&mut shared);
                }
            }
        }
    }

    /// Number of completed wait cycles.
    pub fn runs(&self) -> u32 {
        self.inner.runs.load(Ordering::Relaxed)
    }

    /// Number of currently registered resources.
    pub fn count(&self) -> usize {
        self.inner.shared.lock().entries.len()
    }

    pub fn thread_id(&self) -> thread::ThreadId {
        self.thread_id
    }

    /// True when invoked on the monitor thread itself; enqueue paths use
    /// this to pick a non-blocking submission.
    pub fn is_monitor_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }
}

impl<W: Watchdog> Drop for ResourceMonitor<W> {
    fn drop(&mut self) {
        self.inner.shared.lock().stopping = true;
        let _ = self.inner.waker.wake();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn interest_of(mask: u16) -> Interest {
    let mut interest = if mask & READABLE != 0 {
        Some(Interest::READABLE)
    } else {
        None
    };
    if mask & WRITABLE != 0 {
        interest = Some(match interest {
            Some(existing) => existing.add(Interest::WRITABLE),
            None => Interest::WRITABLE,
        });
    }
    interest.unwrap_or(Interest::READABLE)
}

fn mask_of(event: &mio::event::Event) -> u16 {
    let mut mask = 0;
    if event.is_readable() {
        mask |= READABLE;
    }
    if event.is_writable() {
        mask |= WRITABLE;
    }
    if event.is_error() {
        mask |= ERROR;
    }
    if event.is_read_closed() || event.is_write_closed() {
        mask |= CLOSED;
    }
    mask
}

fn run<W: Watchdog>(inner: Arc<Inner<W>>, mut poll: Poll) {
    let mut events = Events::with_capacity(64);
    loop {
        // Sync the poller with the current registration set.
        let stopping = {
            let mut shared = inner.shared.lock();
            if shared.stopping {
                for entry in &shared.entries {
                    if entry.interest.is_some() {
                        let fd = entry.resource.descriptor();
                        let _ = inner.registry.deregister(&mut SourceFd(&fd));
                    }
                }
                shared.entries.clear();
                true
            } else {
                let registry = &inner.registry;
                shared.entries.retain_mut(|entry| {
                    let mask = entry.resource.events();
                    if mask == 0 {
                        if entry.interest.is_some() {
                            let fd = entry.resource.descriptor();
                            let _ = registry.deregister(&mut SourceFd(&fd));
                        }
                        return false;
                    }
                    if entry.interest != Some(mask) {
                        let fd = entry.resource.descriptor();
                        let interest = interest_of(mask);
                        let outcome = if entry.interest.is_some() {
                            registry.reregister(&mut SourceFd(&fd), Token(entry.key), interest)
                        } else {
                            registry.register(&mut SourceFd(&fd), Token(entry.key), interest)
                        };
                        match outcome {
                            Ok(()) => entry.interest = Some(mask),
                            Err(error) => {
                                tracing::warn!(fd, %error, "dropping unpollable resource");
                                return false;
                            }
                        }
                    }
                    true
                });
                false
            }
        };
        if stopping {
            break;
        }

        inner.runs.fetch_add(1, Ordering::Relaxed);
        if let Err(error) = poll.poll(&mut events, None) {
            if error.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            tracing::warn!(%error, "readiness wait failed");
            continue;
        }

        for event in events.iter() {
            if event.token() == WAKE {
                continue;
            }
            let key = event.token().0;
            // Look the resource up under the lock, run the handler
            // outside of it.
            let resource = {
                let mut shared = inner.shared.lock();
                match shared.entries.iter().find(|e| e.key == key) {
                    Some(entry) => {
                        let resource = Arc::clone(&entry.resource);
                        shared.active = Some(key);
                        Some(resource)
                    }
                    None => None,
                }
            };
            if let Some(resource) = resource {
                inner.watchdog.arm();
                resource.handle(mask_of(event));
                inner.watchdog.reset();
                inner.shared.lock().active = None;
                inner.settled.notify_all();
            }
        }
    }
}
