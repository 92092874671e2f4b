//! Monitored resource contract
//!
//! A resource is an OS handle plus two callbacks: `events` tells the
//! monitor which readiness kinds are currently interesting, `handle`
//! receives the kinds that fired. Both run on the monitor thread.

use std::os::unix::io::RawFd;

/// Readiness kinds, combinable into a mask.
pub const READABLE: u16 = 0x0001;
pub const WRITABLE: u16 = 0x0002;
pub const ERROR: u16 = 0x0004;
pub const CLOSED: u16 = 0x0008;

/// A pollable participant of the monitor loop.
///
/// `events` is re-queried at the start of every wait cycle; returning an
/// empty mask removes the resource from the monitored set (a subsequent
/// `register` brings it back). `handle` runs on the monitor thread with
/// no lock held, so re-entrant registration calls are legal; long work
/// belongs on a worker pool, not here.
pub trait Resource: Send + Sync {
    /// The OS handle to wait on. Must stay valid while registered.
    fn descriptor(&self) -> RawFd;

    /// Mask of readiness kinds currently of interest.
    fn events(&self) -> u16;

    /// Readiness delivery with the mask of kinds that fired.
    fn handle(&self, events: u16);
}
