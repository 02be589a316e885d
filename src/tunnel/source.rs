//! Byte-source tunnel: contract and local backings.
//!
//! A proxied byte-source argument never crosses the wire as data. The side
//! that owns the real bytes keeps them behind a [`ByteSource`]; the other side
//! pulls them over through secondary invocations, one per contract method.

use std::io;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// One read step of a source tunnel.
///
/// `eof` is the only end-of-stream signal: a source at its end returns
/// `eof == true` with zero bytes, and an empty chunk with `eof == false`
/// means "no data right now". Lengths are never negative sentinels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub data: Bytes,
    pub eof: bool,
}

impl Chunk {
    /// Chunk carrying data; not end-of-stream.
    pub fn data(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            eof: false,
        }
    }

    /// End-of-stream marker, always empty.
    pub fn eof() -> Self {
        Self {
            data: Bytes::new(),
            eof: true,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Remote-callable contract behind a proxied byte-source argument.
///
/// When the source is remote, every method here costs exactly one awaited
/// secondary invocation; implementations should prefer `read_chunk` over
/// byte-at-a-time reads.
#[async_trait]
pub trait SourceStream: Send {
    /// Read one byte; `None` at end-of-stream.
    async fn read(&mut self) -> Result<Option<u8>> {
        loop {
            let chunk = self.read_chunk(1).await?;
            if chunk.eof {
                return Ok(None);
            }
            if let Some(byte) = chunk.data.first() {
                return Ok(Some(*byte));
            }
        }
    }

    /// Read up to `max` bytes.
    async fn read_chunk(&mut self, max: usize) -> Result<Chunk>;

    /// Skip up to `n` bytes; returns the number actually skipped.
    async fn skip(&mut self, n: i64) -> Result<i64> {
        let mut remaining = n.max(0);
        let mut skipped = 0i64;
        while remaining > 0 {
            let step = remaining.min(8192) as usize;
            let chunk = self.read_chunk(step).await?;
            if chunk.is_empty() {
                break;
            }
            skipped += chunk.len() as i64;
            remaining -= chunk.len() as i64;
        }
        Ok(skipped)
    }

    /// Bytes readable without waiting; 0 when unknown.
    async fn available(&mut self) -> Result<i32> {
        Ok(0)
    }

    /// Remember the current position. `limit` bounds how much may be read
    /// before the mark becomes invalid; buffer-backed sources may ignore it.
    async fn mark(&mut self, limit: i32) -> Result<()> {
        let _ = limit;
        Ok(())
    }

    /// Rewind to the last mark.
    async fn reset(&mut self) -> Result<()> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "reset not supported by this source").into())
    }

    /// Release the underlying resource.
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Canonical proxyable byte source.
///
/// Proxied source parameters must be exactly this type; wrap any
/// [`SourceStream`] implementation with [`ByteSource::new`]. Ownership moves
/// into the call for its duration; the protocol drops the source when the
/// owning call completes.
pub struct ByteSource {
    inner: Box<dyn SourceStream>,
}

impl ByteSource {
    pub fn new(stream: impl SourceStream + 'static) -> Self {
        Self {
            inner: Box::new(stream),
        }
    }

    /// Source over an in-memory buffer.
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        Self::new(MemorySource::new(data))
    }

    pub async fn read(&mut self) -> Result<Option<u8>> {
        self.inner.read().await
    }

    pub async fn read_chunk(&mut self, max: usize) -> Result<Chunk> {
        self.inner.read_chunk(max).await
    }

    pub async fn skip(&mut self, n: i64) -> Result<i64> {
        self.inner.skip(n).await
    }

    pub async fn available(&mut self) -> Result<i32> {
        self.inner.available().await
    }

    pub async fn mark(&mut self, limit: i32) -> Result<()> {
        self.inner.mark(limit).await
    }

    pub async fn reset(&mut self) -> Result<()> {
        self.inner.reset().await
    }

    pub async fn close(&mut self) -> Result<()> {
        self.inner.close().await
    }
}

/// The canonical wrapper is itself a contract implementor, so it can wrap
/// another wrapper and satisfies bounds written against [`SourceStream`].
#[async_trait]
impl SourceStream for ByteSource {
    async fn read(&mut self) -> Result<Option<u8>> {
        self.inner.read().await
    }

    async fn read_chunk(&mut self, max: usize) -> Result<Chunk> {
        self.inner.read_chunk(max).await
    }

    async fn skip(&mut self, n: i64) -> Result<i64> {
        self.inner.skip(n).await
    }

    async fn available(&mut self) -> Result<i32> {
        self.inner.available().await
    }

    async fn mark(&mut self, limit: i32) -> Result<()> {
        self.inner.mark(limit).await
    }

    async fn reset(&mut self) -> Result<()> {
        self.inner.reset().await
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.close().await
    }
}

impl std::fmt::Debug for ByteSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ByteSource")
    }
}

/// In-memory source over a byte buffer; mark/reset capable.
#[derive(Debug)]
pub struct MemorySource {
    data: Bytes,
    pos: usize,
    mark: Option<usize>,
}

impl MemorySource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            pos: 0,
            mark: None,
        }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
}

#[async_trait]
impl SourceStream for MemorySource {
    async fn read_chunk(&mut self, max: usize) -> Result<Chunk> {
        if self.pos >= self.data.len() {
            return Ok(Chunk::eof());
        }
        let take = max.min(self.remaining());
        let chunk = self.data.slice(self.pos..self.pos + take);
        self.pos += take;
        Ok(Chunk::data(chunk))
    }

    async fn skip(&mut self, n: i64) -> Result<i64> {
        let take = (n.max(0) as usize).min(self.remaining());
        self.pos += take;
        Ok(take as i64)
    }

    async fn available(&mut self) -> Result<i32> {
        Ok(i32::try_from(self.remaining()).unwrap_or(i32::MAX))
    }

    async fn mark(&mut self, _limit: i32) -> Result<()> {
        self.mark = Some(self.pos);
        Ok(())
    }

    async fn reset(&mut self) -> Result<()> {
        match self.mark {
            Some(pos) => {
                self.pos = pos;
                Ok(())
            }
            None => Err(io::Error::new(io::ErrorKind::Unsupported, "no mark set").into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_chunked_read_to_eof() {
        let mut source = MemorySource::new(vec![1u8, 2, 3, 4, 5]);

        let first = source.read_chunk(2).await.unwrap();
        assert_eq!((&first.data[..], first.eof), (&[1u8, 2][..], false));
        let second = source.read_chunk(2).await.unwrap();
        assert_eq!((&second.data[..], second.eof), (&[3u8, 4][..], false));
        let third = source.read_chunk(2).await.unwrap();
        assert_eq!((&third.data[..], third.eof), (&[5u8][..], false));

        let end = source.read_chunk(2).await.unwrap();
        assert!(end.eof);
        assert!(end.is_empty());
    }

    #[tokio::test]
    async fn test_single_byte_reads() {
        let mut source = ByteSource::from_bytes(vec![7u8, 9]);
        assert_eq!(source.read().await.unwrap(), Some(7));
        assert_eq!(source.read().await.unwrap(), Some(9));
        assert_eq!(source.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_mark_reset_rewinds() {
        let mut source = MemorySource::new(vec![1u8, 2, 3, 4]);
        source.read_chunk(1).await.unwrap();
        source.mark(16).await.unwrap();
        source.read_chunk(2).await.unwrap();
        source.reset().await.unwrap();

        let chunk = source.read_chunk(4).await.unwrap();
        assert_eq!(&chunk.data[..], &[2, 3, 4]);
    }

    #[tokio::test]
    async fn test_reset_without_mark_fails() {
        let mut source = MemorySource::new(vec![1u8]);
        assert!(source.reset().await.is_err());
    }

    #[tokio::test]
    async fn test_skip_and_available() {
        let mut source = MemorySource::new(vec![0u8; 10]);
        assert_eq!(source.available().await.unwrap(), 10);
        assert_eq!(source.skip(4).await.unwrap(), 4);
        assert_eq!(source.available().await.unwrap(), 6);
        assert_eq!(source.skip(100).await.unwrap(), 6);
        assert_eq!(source.skip(1).await.unwrap(), 0);
    }

    /// Source with only `read_chunk`, exercising the provided defaults.
    struct MinimalSource {
        left: u8,
    }

    #[async_trait]
    impl SourceStream for MinimalSource {
        async fn read_chunk(&mut self, max: usize) -> Result<Chunk> {
            if self.left == 0 || max == 0 {
                return Ok(if self.left == 0 {
                    Chunk::eof()
                } else {
                    Chunk::data(Bytes::new())
                });
            }
            self.left -= 1;
            Ok(Chunk::data(vec![self.left + 1]))
        }
    }

    #[tokio::test]
    async fn test_default_skip_consumes_chunks() {
        let mut source = MinimalSource { left: 5 };
        assert_eq!(source.skip(3).await.unwrap(), 3);
        assert_eq!(source.read().await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_default_reset_unsupported() {
        let mut source = MinimalSource { left: 1 };
        assert!(source.reset().await.is_err());
        assert_eq!(source.available().await.unwrap(), 0);
    }
}
