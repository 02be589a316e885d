//! Byte-stream tunneling for proxied source and sink parameters.
//!
//! A [`ByteSource`] or [`ByteSink`] passed as a call argument never crosses
//! the channel itself. The receiver gets a remote adapter that pulls from or
//! pushes to the caller's stream through secondary invocations, so bulk data
//! moves on demand instead of being buffered into the request frame.

pub(crate) mod remote;
mod sink;
mod source;

pub use sink::{ByteSink, SharedBuffer, SinkStream};
pub use source::{ByteSource, Chunk, MemorySource, SourceStream};
