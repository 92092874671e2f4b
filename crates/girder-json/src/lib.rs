//! girder-json: incremental JSON / MessagePack codec over a typed tree
//!
//! This crate contains the wire codec of the girder support library:
//! - Typed element tree (numbers in three bases, boolean, string with
//!   opaque-object passthrough, base-64 buffer, registry-mapped enum,
//!   double, homogeneous array, registered-field object, dynamic variant)
//! - Resumable text cursors able to pause at any byte boundary
//! - MessagePack-subset binary framing with the same pause/resume contract
//! - Streamer helpers: string/stream pumps, announcer, exchange
//!
//! The codec never blocks and never recurses: cursors keep an explicit
//! frame stack and re-locate the active path from the root on every step.

pub mod binary;
pub mod enumeration;
pub mod error;
pub mod node;
mod scan;
pub mod streamer;
pub mod text;

// Re-export commonly used types
pub use binary::{Packer, Unpacker};
pub use enumeration::{EnumEntry, EnumRegistry};
pub use error::Error;
pub use node::{
    Array, Base, Boolean, Buffer, Content, Double, Enumerated, Field, Node, Object, Str, Variant,
};
pub use streamer::{from_reader, from_slice, from_str, to_string, to_writer, Announcer, Exchange};
pub use text::{Deserializer, Serializer};
