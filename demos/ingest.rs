//! Ingest - streaming bytes into a service with progress reported back.
//!
//! This example demonstrates:
//! - Passing a `ByteSource` argument that is proxied, not copied
//! - Pulling the bytes on the serving side in chunks
//! - Reporting progress back to the caller through a proxied feed
//! - Watching the transfer through a `TrackedProgress` handle
//! - Cooperative cancellation, polled between chunks
//!
//! Run with `RUST_LOG=debug cargo run --example ingest` to watch the
//! secondary invocations flow the other way.

use std::sync::Arc;

use termwire::codec::ValueKind;
use termwire::progress::TrackedProgress;
use termwire::service::{ParamSpec, ReturnSpec};
use termwire::transport::memory_channel;
use termwire::tunnel::ByteSource;
use termwire::{Arg, Args, CallContext, RpcSession, ServiceDescriptor, ServiceVtable};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let descriptor = ServiceDescriptor::builder("Importer")
        .two_way(
            "ingest",
            [
                ParamSpec::string(),
                ParamSpec::source(),
                ParamSpec::progress(),
            ],
            ReturnSpec::Value(ValueKind::Long),
        )
        .build()?;

    let vtable = ServiceVtable::builder(Arc::clone(&descriptor))
        .handler("ingest", |mut args: Args, _ctx: CallContext| async move {
            let name = args.str_at(0)?.to_string();
            let mut source = args.take_source(1)?;
            let mut progress = args.take_progress(2)?;

            // Each of these round-trips is a secondary invocation against
            // the caller's stream
            let total = source.available().await?;
            progress.begin_task(&format!("ingest {name}"), total).await?;

            let mut received = 0i64;
            while !progress.is_canceled().await? {
                let chunk = source.read_chunk(8).await?;
                if chunk.eof {
                    progress.done().await?;
                    break;
                }
                received += chunk.len() as i64;
                progress.worked(chunk.len() as i32).await?;
            }
            Ok(Arg::Long(received))
        })
        .build()?;

    let ((server_tx, server_rx), (client_tx, client_rx)) = memory_channel(64);
    let server = RpcSession::builder()
        .label("importer")
        .expose(vtable)?
        .connect(server_tx, server_rx);
    let client = RpcSession::builder()
        .label("client")
        .connect(client_tx, client_rx);

    let importer = client.stub(descriptor);

    // The payload stays on this side; the importer pulls it chunk by chunk
    let payload: Vec<u8> = (0..40u8).collect();
    let tracked = TrackedProgress::new();

    let received = importer
        .call(
            "ingest",
            vec![
                Arg::from("concepts.ttl"),
                Arg::Source(ByteSource::from_bytes(payload)),
                Arg::Progress(tracked.feed()),
            ],
        )
        .await?;

    println!(
        "{}: {} of {} bytes, {}",
        tracked.task(),
        tracked.worked(),
        tracked.total(),
        if tracked.is_done() { "done" } else { "interrupted" }
    );
    println!(
        "importer confirmed {} bytes",
        received.as_long().unwrap_or_default()
    );

    // A handle canceled up front stops the importer before the first chunk
    let canceled = TrackedProgress::new();
    canceled.cancel();
    let aborted = importer
        .call(
            "ingest",
            vec![
                Arg::from("retry.ttl"),
                Arg::Source(ByteSource::from_bytes((0..40u8).collect::<Vec<u8>>())),
                Arg::Progress(canceled.feed()),
            ],
        )
        .await?;
    println!(
        "canceled upload stopped after {} bytes",
        aborted.as_long().unwrap_or_default()
    );

    client.close();
    server.closed().await;

    Ok(())
}
