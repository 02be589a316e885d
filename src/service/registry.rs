//! Handler registration and lookup.
//!
//! Each exposed service pairs its descriptor with a vtable mapping signature
//! strings to boxed async handlers, built once at registration time. Inbound
//! dispatch resolves interface name, then signature; either miss is a
//! method-resolution fault back to the caller.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::{Fault, Result, RpcError};
use crate::service::context::{Arg, Args, CallContext};
use crate::service::descriptor::{MethodDescriptor, ServiceDescriptor};

/// What a method implementation resolves to: a result argument, or an
/// application fault reported back to the caller.
pub type HandlerOutcome = std::result::Result<Arg, Fault>;

/// Boxed future returned by method handlers.
pub type HandlerFuture = BoxFuture<'static, HandlerOutcome>;

/// A registered implementation of one service method.
///
/// Usually built from an async closure through [`FnHandler`]; implement
/// directly when methods share state behind one object.
pub trait MethodHandler: Send + Sync + 'static {
    fn invoke(&self, args: Args, ctx: CallContext) -> HandlerFuture;
}

/// Adapter turning an async closure into a [`MethodHandler`].
pub struct FnHandler<F> {
    handler: F,
}

impl<F> FnHandler<F> {
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

impl<F, Fut> MethodHandler for FnHandler<F>
where
    F: Fn(Args, CallContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerOutcome> + Send + 'static,
{
    fn invoke(&self, args: Args, ctx: CallContext) -> HandlerFuture {
        Box::pin((self.handler)(args, ctx))
    }
}

/// An exposed service: its descriptor plus one handler per declared method.
pub struct ServiceVtable {
    descriptor: Arc<ServiceDescriptor>,
    handlers: HashMap<String, Box<dyn MethodHandler>>,
}

impl ServiceVtable {
    pub fn builder(descriptor: Arc<ServiceDescriptor>) -> ServiceVtableBuilder {
        ServiceVtableBuilder {
            descriptor,
            handlers: HashMap::new(),
            problems: Vec::new(),
        }
    }

    #[inline]
    pub fn descriptor(&self) -> &Arc<ServiceDescriptor> {
        &self.descriptor
    }

    pub(crate) fn handler(&self, signature: &str) -> Option<&dyn MethodHandler> {
        self.handlers.get(signature).map(|handler| handler.as_ref())
    }
}

impl fmt::Debug for ServiceVtable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceVtable")
            .field("service", &self.descriptor.name())
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

/// Attaches implementations to a descriptor's methods.
///
/// [`build`](Self::build) fails with [`RpcError::Contract`] unless every
/// declared method got exactly one handler and no handler named an
/// undeclared method.
pub struct ServiceVtableBuilder {
    descriptor: Arc<ServiceDescriptor>,
    handlers: HashMap<String, Box<dyn MethodHandler>>,
    problems: Vec<String>,
}

impl ServiceVtableBuilder {
    /// Attach an async closure as the implementation of `method` (the plain
    /// method name, not the signature).
    pub fn handler<F, Fut>(self, method: &str, handler: F) -> Self
    where
        F: Fn(Args, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerOutcome> + Send + 'static,
    {
        self.boxed(method, Box::new(FnHandler::new(handler)))
    }

    /// Attach a prebuilt handler object.
    pub fn boxed(mut self, method: &str, handler: Box<dyn MethodHandler>) -> Self {
        match self.descriptor.method(method) {
            Some(descriptor) => {
                let signature = descriptor.signature().to_string();
                if self.handlers.insert(signature, handler).is_some() {
                    self.problems.push(format!("method {method} has two handlers"));
                }
            }
            None => self
                .problems
                .push(format!("method {method} is not declared")),
        }
        self
    }

    pub fn build(self) -> Result<ServiceVtable> {
        let ServiceVtableBuilder {
            descriptor,
            handlers,
            mut problems,
        } = self;
        for method in descriptor.methods() {
            if !handlers.contains_key(method.signature()) {
                problems.push(format!("method {} has no handler", method.name()));
            }
        }
        if let Some(problem) = problems.into_iter().next() {
            return Err(RpcError::contract(format!(
                "service {}: {problem}",
                descriptor.name()
            )));
        }
        Ok(ServiceVtable {
            descriptor,
            handlers,
        })
    }
}

/// Services exposed on one session, keyed by interface name.
#[derive(Default)]
pub struct ServiceRegistry {
    services: HashMap<String, Arc<ServiceVtable>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expose a service. Fails on a duplicate interface name.
    pub fn expose(&mut self, vtable: ServiceVtable) -> Result<()> {
        let name = vtable.descriptor().name().to_string();
        match self.services.entry(name) {
            Entry::Occupied(entry) => Err(RpcError::contract(format!(
                "service {} exposed twice",
                entry.key()
            ))),
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(vtable));
                Ok(())
            }
        }
    }

    pub fn service(&self, name: &str) -> Option<&Arc<ServiceVtable>> {
        self.services.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Resolve an inbound request's target method.
    pub(crate) fn resolve(
        &self,
        service: &str,
        signature: &str,
    ) -> Result<(Arc<ServiceVtable>, Arc<MethodDescriptor>)> {
        let unresolved = || RpcError::MethodResolution {
            service: service.to_string(),
            signature: signature.to_string(),
        };
        let vtable = self.service(service).ok_or_else(unresolved)?;
        let method = vtable
            .descriptor()
            .method_by_signature(signature)
            .ok_or_else(unresolved)?;
        Ok((Arc::clone(vtable), Arc::clone(method)))
    }
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &self.services.len())
            .finish()
    }
}
