//! Byte-sink tunnel: contract and local backings.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use crate::error::Result;

/// Remote-callable contract behind a proxied byte-sink argument.
#[async_trait]
pub trait SinkStream: Send {
    /// Append bytes to the sink.
    async fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Push buffered bytes through.
    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Release the underlying resource.
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Canonical proxyable byte sink.
///
/// Proxied sink parameters must be exactly this type; wrap any [`SinkStream`]
/// implementation with [`ByteSink::new`]. Ownership moves into the call for
/// its duration, so sinks whose content the caller wants afterwards should be
/// backed by a [`SharedBuffer`] (or a similar shared handle).
pub struct ByteSink {
    inner: Box<dyn SinkStream>,
}

impl ByteSink {
    pub fn new(stream: impl SinkStream + 'static) -> Self {
        Self {
            inner: Box::new(stream),
        }
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.inner.write(data).await
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.inner.flush().await
    }

    pub async fn close(&mut self) -> Result<()> {
        self.inner.close().await
    }
}

#[async_trait]
impl SinkStream for ByteSink {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.inner.write(data).await
    }

    async fn flush(&mut self) -> Result<()> {
        self.inner.flush().await
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.close().await
    }
}

impl std::fmt::Debug for ByteSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ByteSink")
    }
}

/// Growable byte buffer shared between the caller and a [`ByteSink`].
///
/// Keep the handle, pass `sink()` into the call; once the call returns,
/// `snapshot()` holds everything the remote side wrote.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink writing into this buffer.
    pub fn sink(&self) -> ByteSink {
        ByteSink::new(BufferSink {
            buf: Arc::clone(&self.inner),
        })
    }

    /// Copy of the bytes written so far.
    pub fn snapshot(&self) -> Vec<u8> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<u8>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct BufferSink {
    buf: Arc<Mutex<Vec<u8>>>,
}

#[async_trait]
impl SinkStream for BufferSink {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.buf
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shared_buffer_collects_writes() {
        let buffer = SharedBuffer::new();
        let mut sink = buffer.sink();

        sink.write(&[1, 2]).await.unwrap();
        sink.write(&[3]).await.unwrap();
        sink.flush().await.unwrap();
        sink.close().await.unwrap();

        assert_eq!(buffer.snapshot(), vec![1, 2, 3]);
        assert_eq!(buffer.len(), 3);
    }

    #[tokio::test]
    async fn test_buffer_outlives_sink() {
        let buffer = SharedBuffer::new();
        {
            let mut sink = buffer.sink();
            sink.write(b"kept").await.unwrap();
        }
        assert_eq!(buffer.snapshot(), b"kept");
    }

    #[tokio::test]
    async fn test_empty_buffer() {
        let buffer = SharedBuffer::new();
        assert!(buffer.is_empty());
        assert!(buffer.snapshot().is_empty());
    }
}
