//! Service contracts: explicit method tables in place of reflection.
//!
//! A service is described once ([`ServiceDescriptor`]), implemented by
//! attaching handlers ([`ServiceVtable`]), exposed on a session
//! ([`ServiceRegistry`]) and called through a stub. Methods are addressed by
//! plain name locally and by signature string on the wire.

mod context;
mod descriptor;
mod registry;

pub use context::{Arg, Args, CallContext};
pub use descriptor::{
    MethodDescriptor, ParamSpec, ReturnSpec, ServiceDescriptor, ServiceDescriptorBuilder,
};
pub use registry::{
    FnHandler, HandlerFuture, HandlerOutcome, MethodHandler, ServiceRegistry, ServiceVtable,
    ServiceVtableBuilder,
};
