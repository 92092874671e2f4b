//! girder: systems support core
//!
//! Umbrella over the three collaborating subsystems:
//! - [`json`] — incremental JSON / MessagePack codec over a typed tree
//! - [`monitor`] — single-threaded readiness dispatch over OS handles
//! - [`pool`] — queue-fed worker pool with an atomic job lifecycle
//!
//! JSON is the wire format for configuration and RPC; the monitor turns
//! handle readiness into work; the pool executes that work, often
//! producing JSON responses in turn.

pub use girder_json as json;
pub use girder_monitor as monitor;
pub use girder_pool as pool;
