//! # termwire
//!
//! Bidirectional remote invocation over a single ordered channel.
//!
//! Two peers share one reliable, ordered message channel. Either side can
//! expose services and invoke the other's; a call's stream and progress
//! parameters are not serialized but proxied, so the callee reads, writes
//! and reports through them while the call is still running.
//!
//! ## Architecture
//!
//! - **Frames** ([`protocol`]): signal-tagged, big-endian request and
//!   confirmation frames sharing one correlation sequence in both directions.
//! - **Sessions** ([`session`]): symmetric endpoints with a writer task, a
//!   reader task and a pending-call table that force-completes on disconnect.
//! - **Services** ([`service`]): descriptors declare methods and parameter
//!   kinds, vtables bind async handlers, stubs invoke by method name.
//! - **Tunneling** ([`tunnel`], [`progress`]): proxied parameters travel as
//!   correlation-addressed secondary invocations back to their owner.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use termwire::codec::ValueKind;
//! use termwire::service::{Arg, ParamSpec, ReturnSpec, ServiceDescriptor, ServiceVtable};
//! use termwire::session::RpcSession;
//! use termwire::transport::memory_channel;
//!
//! #[tokio::main]
//! async fn main() -> termwire::Result<()> {
//!     let descriptor = ServiceDescriptor::builder("Calculator")
//!         .two_way(
//!             "divide",
//!             [ParamSpec::int(), ParamSpec::int()],
//!             ReturnSpec::Value(ValueKind::Int),
//!         )
//!         .build()?;
//!
//!     let vtable = ServiceVtable::builder(Arc::clone(&descriptor))
//!         .handler("divide", |args, _ctx| async move {
//!             let (a, b) = (args.int_at(0)?, args.int_at(1)?);
//!             if b == 0 {
//!                 return Err(termwire::Fault::new("ArithmeticError", "division by zero"));
//!             }
//!             Ok(Arg::Int(a / b))
//!         })
//!         .build()?;
//!
//!     let ((client_tx, client_rx), (server_tx, server_rx)) = memory_channel(64);
//!     let _server = RpcSession::builder()
//!         .label("server")
//!         .expose(vtable)?
//!         .connect(server_tx, server_rx);
//!     let client = RpcSession::builder()
//!         .label("client")
//!         .connect(client_tx, client_rx);
//!
//!     let calculator = client.stub(descriptor);
//!     let quotient = calculator
//!         .call("divide", vec![Arg::Int(10), Arg::Int(2)])
//!         .await?;
//!     assert_eq!(quotient.as_int(), Some(5));
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod error;
pub mod observe;
pub mod progress;
pub mod protocol;
pub mod resolve;
pub mod service;
pub mod session;
pub mod transport;
pub mod tunnel;

mod stub;

pub use error::{Fault, RemoteFault, Result, RpcError};
pub use service::{Arg, Args, CallContext, ServiceDescriptor, ServiceVtable};
pub use session::{RpcSession, SessionBuilder, SessionConfig};
pub use stub::RemoteService;
