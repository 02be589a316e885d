//! Length-prefixed framing over any byte stream.
//!
//! Layout per message: u32 Big Endian length, then the body. The reader
//! accumulates partial reads in a single `BytesMut` and extracts whole
//! messages; the writer flushes after every message so a frame is never
//! stranded in an intermediate buffer.

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use super::{ChannelRx, ChannelTx};
use crate::error::{Result, RpcError};

/// Default maximum message size (16 MiB).
pub const DEFAULT_MAX_FRAME: usize = 16 * 1024 * 1024;

const LEN_PREFIX: usize = 4;

/// Split a duplex byte stream into a framed channel pair.
pub fn framed<S>(stream: S) -> (FramedWriter<WriteHalf<S>>, FramedReader<ReadHalf<S>>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read, write) = tokio::io::split(stream);
    (FramedWriter::new(write), FramedReader::new(read))
}

/// Reads length-prefixed messages off a byte stream.
pub struct FramedReader<R> {
    io: R,
    buf: BytesMut,
    max_frame: usize,
}

impl<R> FramedReader<R> {
    pub fn new(io: R) -> Self {
        Self::with_max_frame(io, DEFAULT_MAX_FRAME)
    }

    pub fn with_max_frame(io: R, max_frame: usize) -> Self {
        Self {
            io,
            buf: BytesMut::with_capacity(64 * 1024),
            max_frame,
        }
    }

    /// Extract one whole message if the buffer holds it.
    fn try_extract(&mut self) -> Result<Option<Bytes>> {
        if self.buf.len() < LEN_PREFIX {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > self.max_frame {
            return Err(RpcError::protocol(format!(
                "frame length {len} exceeds maximum {}",
                self.max_frame
            )));
        }
        if self.buf.len() < LEN_PREFIX + len {
            return Ok(None);
        }
        self.buf.advance(LEN_PREFIX);
        Ok(Some(self.buf.split_to(len).freeze()))
    }
}

#[async_trait]
impl<R> ChannelRx for FramedReader<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    async fn recv(&mut self) -> Result<Option<Bytes>> {
        loop {
            if let Some(message) = self.try_extract()? {
                return Ok(Some(message));
            }
            let read = self.io.read_buf(&mut self.buf).await?;
            if read == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(RpcError::protocol(format!(
                    "stream ended mid-frame with {} buffered bytes",
                    self.buf.len()
                )));
            }
        }
    }
}

/// Writes length-prefixed messages onto a byte stream.
pub struct FramedWriter<W> {
    io: W,
    max_frame: usize,
}

impl<W> FramedWriter<W> {
    pub fn new(io: W) -> Self {
        Self::with_max_frame(io, DEFAULT_MAX_FRAME)
    }

    pub fn with_max_frame(io: W, max_frame: usize) -> Self {
        Self { io, max_frame }
    }
}

#[async_trait]
impl<W> ChannelTx for FramedWriter<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, message: Bytes) -> Result<()> {
        if message.len() > self.max_frame {
            return Err(RpcError::protocol(format!(
                "frame length {} exceeds maximum {}",
                message.len(),
                self.max_frame
            )));
        }
        self.io
            .write_all(&(message.len() as u32).to_be_bytes())
            .await?;
        self.io.write_all(&message).await?;
        self.io.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_framed_roundtrip_over_duplex() {
        let (near, far) = tokio::io::duplex(64 * 1024);
        let (mut tx, _) = framed(near);
        let (_, mut rx) = framed(far);

        tx.send(Bytes::from_static(b"hello")).await.unwrap();
        tx.send(Bytes::new()).await.unwrap();
        tx.send(Bytes::from_static(b"world")).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().unwrap(), &b"hello"[..]);
        assert_eq!(rx.recv().await.unwrap().unwrap(), &b""[..]);
        assert_eq!(rx.recv().await.unwrap().unwrap(), &b"world"[..]);
    }

    #[tokio::test]
    async fn test_reassembly_across_tiny_reads() {
        // An 8-byte duplex buffer forces the message to arrive in pieces.
        let (near, far) = tokio::io::duplex(8);
        let (mut tx, _) = framed(near);
        let (_, mut rx) = framed(far);

        let payload = Bytes::from(vec![0xABu8; 300]);
        let expected = payload.clone();
        let writer = tokio::spawn(async move { tx.send(payload).await });

        let received = rx.recv().await.unwrap().unwrap();
        assert_eq!(received, expected);
        writer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_orderly_close_yields_none() {
        let (near, far) = tokio::io::duplex(1024);
        let (tx, _) = framed(near);
        let (_, mut rx) = framed(far);

        drop(tx);
        assert!(rx.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_eof_mid_frame_is_error() {
        let (near, far) = tokio::io::duplex(1024);
        let (_, mut rx) = framed(far);

        let (_read, mut write) = tokio::io::split(near);
        // Announce 100 bytes, deliver 3, then hang up.
        write.write_all(&100u32.to_be_bytes()).await.unwrap();
        write.write_all(&[1, 2, 3]).await.unwrap();
        write.shutdown().await.unwrap();
        drop(write);
        drop(_read);

        assert!(rx.recv().await.is_err());
    }

    #[tokio::test]
    async fn test_oversize_frame_rejected_both_sides() {
        let (near, far) = tokio::io::duplex(1024);
        let (near_read, near_write) = tokio::io::split(near);
        let (_far_read, mut far_write) = tokio::io::split(far);

        // The writer refuses before a single byte reaches the stream.
        let mut tx = FramedWriter::with_max_frame(near_write, 16);
        let err = tx.send(Bytes::from(vec![0u8; 17])).await.unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));

        // The reader refuses on the announced length alone.
        let mut rx = FramedReader::with_max_frame(near_read, 16);
        far_write.write_all(&1024u32.to_be_bytes()).await.unwrap();
        assert!(rx.recv().await.is_err());
    }
}
