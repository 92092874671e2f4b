//! girder-monitor: single-threaded readiness dispatch
//!
//! This crate contains the resource monitor of the girder support
//! library:
//! - A dedicated loop thread owning a dynamic set of pollable resources
//! - Safe concurrent registration/unregistration with a synchronous
//!   never-called-again guarantee on unregister
//! - Any-thread wakeup of the blocking wait
//! - An optional watchdog bracketing each handler invocation
//! - A lazily constructed process-wide instance for singleton-style use
//!
//! Handlers run one at a time on the monitor thread; anything
//! long-running belongs on a worker pool.

pub mod monitor;
pub mod resource;
pub mod watchdog;

use once_cell::sync::Lazy;

pub use monitor::{MonitorError, ResourceMonitor};
pub use resource::{Resource, CLOSED, ERROR, READABLE, WRITABLE};
pub use watchdog::{DeadlineWatchdog, NoWatchdog, Watchdog};

static GLOBAL: Lazy<ResourceMonitor> =
    Lazy::new(|| ResourceMonitor::new().expect("process-wide resource monitor"));

/// The process-wide monitor instance, created on first use and torn down
/// at process exit. Code that needs a controlled lifetime should own a
/// [`ResourceMonitor`] directly instead.
pub fn global() -> &'static ResourceMonitor {
    &GLOBAL
}
