//! Transport module - the channel seam and shipped implementations.
//!
//! The protocol only requires an ordered, reliable, message-oriented channel:
//! whole messages in, whole messages out, exactly once per direction. Retries,
//! authentication and encryption belong below this seam.
//!
//! Shipped implementations:
//! - [`memory_channel`] - connected in-process pair over bounded queues
//! - [`FramedReader`] / [`FramedWriter`] - u32-length-prefixed framing over
//!   any byte stream

mod framed;
mod memory;

pub use framed::{framed, FramedReader, FramedWriter, DEFAULT_MAX_FRAME};
pub use memory::{memory_channel, MemoryReceiver, MemorySender};

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// Send half of an ordered, message-oriented channel.
#[async_trait]
pub trait ChannelTx: Send + 'static {
    /// Deliver one whole message, in order.
    async fn send(&mut self, message: Bytes) -> Result<()>;
}

/// Receive half of an ordered, message-oriented channel.
#[async_trait]
pub trait ChannelRx: Send + 'static {
    /// Next whole message; `None` on orderly close.
    async fn recv(&mut self) -> Result<Option<Bytes>>;
}
