//! In-process channel pair over bounded queues.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use super::{ChannelRx, ChannelTx};
use crate::error::{Result, RpcError};

/// Create a connected pair of in-memory endpoints.
///
/// Each side gets a send and a receive half; messages arrive whole and in
/// order. Dropping a side's halves closes the channel for its peer.
pub fn memory_channel(
    capacity: usize,
) -> (
    (MemorySender, MemoryReceiver),
    (MemorySender, MemoryReceiver),
) {
    let (a_tx, b_rx) = mpsc::channel(capacity);
    let (b_tx, a_rx) = mpsc::channel(capacity);
    (
        (MemorySender { tx: a_tx }, MemoryReceiver { rx: a_rx }),
        (MemorySender { tx: b_tx }, MemoryReceiver { rx: b_rx }),
    )
}

/// Send half of an in-memory channel.
#[derive(Debug)]
pub struct MemorySender {
    tx: mpsc::Sender<Bytes>,
}

#[async_trait]
impl ChannelTx for MemorySender {
    async fn send(&mut self, message: Bytes) -> Result<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| RpcError::TransportClosed)
    }
}

/// Receive half of an in-memory channel.
#[derive(Debug)]
pub struct MemoryReceiver {
    rx: mpsc::Receiver<Bytes>,
}

#[async_trait]
impl ChannelRx for MemoryReceiver {
    async fn recv(&mut self) -> Result<Option<Bytes>> {
        Ok(self.rx.recv().await)
    }
}
