//! Calculator - two linked sessions making plain two-way calls.
//!
//! This example demonstrates:
//! - Declaring a service interface with `ServiceDescriptor`
//! - Exposing handlers through a `ServiceVtable`
//! - Calling the remote service through a stub
//! - Catching a remote application fault at the call site
//!
//! Run with `RUST_LOG=debug cargo run --example calculator` to watch the
//! frames flow.

use std::sync::Arc;

use termwire::codec::ValueKind;
use termwire::service::{ParamSpec, ReturnSpec};
use termwire::transport::memory_channel;
use termwire::{
    Arg, Args, CallContext, Fault, RpcError, RpcSession, ServiceDescriptor, ServiceVtable,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // The interface contract, shared by both endpoints
    let descriptor = ServiceDescriptor::builder("Calculator")
        .two_way(
            "add",
            [ParamSpec::int(), ParamSpec::int()],
            ReturnSpec::Value(ValueKind::Int),
        )
        .two_way(
            "divide",
            [ParamSpec::int(), ParamSpec::int()],
            ReturnSpec::Value(ValueKind::Int),
        )
        .build()?;

    let vtable = ServiceVtable::builder(Arc::clone(&descriptor))
        .handler("add", |args: Args, _ctx: CallContext| async move {
            Ok(Arg::Int(args.int_at(0)? + args.int_at(1)?))
        })
        .handler("divide", |args: Args, _ctx: CallContext| async move {
            let (a, b) = (args.int_at(0)?, args.int_at(1)?);
            if b == 0 {
                return Err(Fault::new("ArithmeticError", "division by zero"));
            }
            Ok(Arg::Int(a / b))
        })
        .build()?;

    // Wire the two endpoints together in process
    let ((server_tx, server_rx), (client_tx, client_rx)) = memory_channel(64);
    let server = RpcSession::builder()
        .label("server")
        .expose(vtable)?
        .connect(server_tx, server_rx);
    let client = RpcSession::builder()
        .label("client")
        .connect(client_tx, client_rx);

    let calculator = client.stub(descriptor);

    let sum = calculator
        .call("add", vec![Arg::Int(2), Arg::Int(40)])
        .await?;
    println!("2 + 40 = {}", sum.as_int().unwrap_or_default());

    // A remote fault comes back as an error naming the call site
    match calculator
        .call("divide", vec![Arg::Int(1), Arg::Int(0)])
        .await
    {
        Err(RpcError::Remote(fault)) => println!(
            "{}.{} raised {}: {}",
            fault.service(),
            fault.method(),
            fault.type_name(),
            fault.message()
        ),
        other => println!("unexpected outcome: {other:?}"),
    }

    // The session survives the fault
    let quotient = calculator
        .call("divide", vec![Arg::Int(84), Arg::Int(2)])
        .await?;
    println!("84 / 2 = {}", quotient.as_int().unwrap_or_default());

    client.close();
    server.closed().await;

    Ok(())
}
