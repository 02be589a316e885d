//! Remote adapters: the receiving side of proxied parameters.
//!
//! Materializing a proxied argument produces one of these adapters, wrapped
//! in its canonical type and handed to the method handler. Every contract
//! method costs one awaited secondary invocation against the owning call's
//! slot. Once the owning call has responded, the adapters are stale and fail
//! fast instead of addressing a correlation the caller already released.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::codec::{RemoteHandle, Value, ValueKind};
use crate::error::{Result, RpcError};
use crate::progress::{ProgressFeed, ProgressListener};
use crate::service::Arg;
use crate::session::calls::CallScope;
use crate::session::SessionCore;
use crate::tunnel::{ByteSink, ByteSource, Chunk, SinkStream, SourceStream};

/// Wrap a decoded handle in the matching remote adapter.
pub(crate) fn materialize_handle(
    session: &Arc<SessionCore>,
    scope: &Arc<CallScope>,
    kind: ValueKind,
    handle: RemoteHandle,
) -> Result<Arg> {
    let slot = SlotClient::new(session, scope, handle);
    Ok(match kind {
        ValueKind::Progress => Arg::Progress(ProgressFeed::new(RemoteProgress { slot })),
        ValueKind::Source => Arg::Source(ByteSource::new(RemoteSource { slot })),
        ValueKind::Sink => Arg::Sink(ByteSink::new(RemoteSink { slot })),
        other => {
            return Err(RpcError::protocol(format!(
                "value kind {other:?} is not proxied"
            )));
        }
    })
}

/// Shared plumbing: one slot address plus the session to send through.
struct SlotClient {
    session: Arc<SessionCore>,
    scope: Arc<CallScope>,
    handle: RemoteHandle,
}

impl SlotClient {
    fn new(session: &Arc<SessionCore>, scope: &Arc<CallScope>, handle: RemoteHandle) -> Self {
        Self {
            session: Arc::clone(session),
            scope: Arc::clone(scope),
            handle,
        }
    }

    async fn invoke(&self, signature: &str, args: Vec<Option<Value>>) -> Result<Option<Value>> {
        self.scope.ensure_open(self.handle.param)?;
        self.session
            .secondary_call(self.handle, signature, args)
            .await
    }
}

fn expect_void(signature: &str, result: Option<Value>) -> Result<()> {
    match result {
        None => Ok(()),
        Some(other) => Err(confirmed_wrong_kind(signature, &other, "null")),
    }
}

fn expect_bool(signature: &str, result: Option<Value>) -> Result<bool> {
    match result {
        Some(Value::Bool(value)) => Ok(value),
        other => Err(wrong_shape(signature, other.as_ref(), "a boolean")),
    }
}

fn expect_int(signature: &str, result: Option<Value>) -> Result<i32> {
    match result {
        Some(Value::Int(value)) => Ok(value),
        other => Err(wrong_shape(signature, other.as_ref(), "an int")),
    }
}

fn expect_long(signature: &str, result: Option<Value>) -> Result<i64> {
    match result {
        Some(Value::Long(value)) => Ok(value),
        other => Err(wrong_shape(signature, other.as_ref(), "a long")),
    }
}

fn confirmed_wrong_kind(signature: &str, got: &Value, expected: &str) -> RpcError {
    RpcError::protocol(format!(
        "{signature} confirmed {:?}, expected {expected}",
        got.kind()
    ))
}

fn wrong_shape(signature: &str, got: Option<&Value>, expected: &str) -> RpcError {
    match got {
        Some(value) => confirmed_wrong_kind(signature, value, expected),
        None => RpcError::protocol(format!("{signature} confirmed null, expected {expected}")),
    }
}

/// Byte source whose real bytes live on the other side of the channel.
pub(crate) struct RemoteSource {
    slot: SlotClient,
}

#[async_trait]
impl SourceStream for RemoteSource {
    async fn read(&mut self) -> Result<Option<u8>> {
        // End-of-stream is the -1 sentinel on this signature only; chunked
        // reads use the null confirmation instead.
        match expect_int("read()", self.slot.invoke("read()", Vec::new()).await?)? {
            -1 => Ok(None),
            byte @ 0..=255 => Ok(Some(byte as u8)),
            other => Err(RpcError::protocol(format!(
                "read() confirmed out-of-range byte {other}"
            ))),
        }
    }

    async fn read_chunk(&mut self, max: usize) -> Result<Chunk> {
        let max = i32::try_from(max).unwrap_or(i32::MAX);
        match self
            .slot
            .invoke("readChunk(I)", vec![Some(Value::Int(max))])
            .await?
        {
            None => Ok(Chunk::eof()),
            Some(Value::Blob(data)) => Ok(Chunk::data(data)),
            Some(other) => Err(confirmed_wrong_kind("readChunk(I)", &other, "a blob")),
        }
    }

    async fn skip(&mut self, n: i64) -> Result<i64> {
        expect_long(
            "skip(J)",
            self.slot
                .invoke("skip(J)", vec![Some(Value::Long(n))])
                .await?,
        )
    }

    async fn available(&mut self) -> Result<i32> {
        expect_int(
            "available()",
            self.slot.invoke("available()", Vec::new()).await?,
        )
    }

    async fn mark(&mut self, limit: i32) -> Result<()> {
        expect_void(
            "mark(I)",
            self.slot
                .invoke("mark(I)", vec![Some(Value::Int(limit))])
                .await?,
        )
    }

    async fn reset(&mut self) -> Result<()> {
        expect_void("reset()", self.slot.invoke("reset()", Vec::new()).await?)
    }

    async fn close(&mut self) -> Result<()> {
        expect_void("close()", self.slot.invoke("close()", Vec::new()).await?)
    }
}

/// Byte sink whose real buffer lives on the other side of the channel.
pub(crate) struct RemoteSink {
    slot: SlotClient,
}

#[async_trait]
impl SinkStream for RemoteSink {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        let blob = Value::Blob(Bytes::copy_from_slice(data));
        expect_void(
            "write(A)",
            self.slot.invoke("write(A)", vec![Some(blob)]).await?,
        )
    }

    async fn flush(&mut self) -> Result<()> {
        expect_void("flush()", self.slot.invoke("flush()", Vec::new()).await?)
    }

    async fn close(&mut self) -> Result<()> {
        expect_void("close()", self.slot.invoke("close()", Vec::new()).await?)
    }
}

/// Progress feed reporting back to the caller's listener.
pub(crate) struct RemoteProgress {
    slot: SlotClient,
}

#[async_trait]
impl ProgressListener for RemoteProgress {
    async fn begin_task(&mut self, name: &str, total: i32) -> Result<()> {
        let args = vec![
            Some(Value::Str(name.to_string())),
            Some(Value::Int(total)),
        ];
        expect_void(
            "beginTask(TI)",
            self.slot.invoke("beginTask(TI)", args).await?,
        )
    }

    async fn worked(&mut self, amount: i32) -> Result<()> {
        expect_void(
            "worked(I)",
            self.slot
                .invoke("worked(I)", vec![Some(Value::Int(amount))])
                .await?,
        )
    }

    async fn sub_task(&mut self, name: &str) -> Result<()> {
        expect_void(
            "subTask(T)",
            self.slot
                .invoke("subTask(T)", vec![Some(Value::Str(name.to_string()))])
                .await?,
        )
    }

    async fn done(&mut self) -> Result<()> {
        expect_void("done()", self.slot.invoke("done()", Vec::new()).await?)
    }

    async fn set_canceled(&mut self, canceled: bool) -> Result<()> {
        expect_void(
            "setCanceled(Z)",
            self.slot
                .invoke("setCanceled(Z)", vec![Some(Value::Bool(canceled))])
                .await?,
        )
    }

    async fn is_canceled(&mut self) -> Result<bool> {
        expect_bool(
            "isCanceled()",
            self.slot.invoke("isCanceled()", Vec::new()).await?,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_shape_checks() {
        expect_void("close()", None).unwrap();
        assert!(expect_void("close()", Some(Value::Int(1))).is_err());

        assert_eq!(expect_int("read()", Some(Value::Int(-1))).unwrap(), -1);
        assert!(expect_int("read()", None).is_err());
        assert!(expect_int("read()", Some(Value::Long(1))).is_err());

        assert_eq!(expect_long("skip(J)", Some(Value::Long(9))).unwrap(), 9);
        assert!(expect_bool("isCanceled()", Some(Value::Bool(true))).unwrap());
        assert!(expect_bool("isCanceled()", Some(Value::Str("yes".to_string()))).is_err());
    }
}
