//! Typed invocation handles for services exposed by the peer.
//!
//! A [`RemoteService`] pairs a session with a service descriptor and turns
//! method names into wire requests. It is the caller-side mirror of a
//! [`ServiceVtable`](crate::service::ServiceVtable): the descriptor decides
//! which methods exist, their signatures and their invocation convention,
//! so misuse is rejected locally before anything reaches the peer.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::error::{Result, RpcError};
use crate::service::{Arg, MethodDescriptor, ServiceDescriptor};
use crate::session::RpcSession;

/// Invocation handle for one service on the peer endpoint.
///
/// Obtained from [`RpcSession::stub`]. Cheap to clone; clones share the
/// session and descriptor.
#[derive(Clone)]
pub struct RemoteService {
    session: RpcSession,
    descriptor: Arc<ServiceDescriptor>,
}

impl RemoteService {
    pub(crate) fn new(session: RpcSession, descriptor: Arc<ServiceDescriptor>) -> Self {
        Self {
            session,
            descriptor,
        }
    }

    pub fn descriptor(&self) -> &Arc<ServiceDescriptor> {
        &self.descriptor
    }

    pub fn session(&self) -> &RpcSession {
        &self.session
    }

    /// Invokes a two-way method and awaits its confirmed result.
    ///
    /// `method` is the bare method name; the signature and parameter specs
    /// come from the descriptor. Void methods confirm [`Arg::Null`].
    pub async fn call(&self, method: &str, args: Vec<Arg>) -> Result<Arg> {
        let method = self.resolve(method, false)?;
        self.session
            .call_service(&self.descriptor, &method, args)
            .await
    }

    /// Queues a one-way invocation. Resolves once the request has been
    /// accepted for transmission; the peer never confirms it.
    pub async fn notify(&self, method: &str, args: Vec<Arg>) -> Result<()> {
        let method = self.resolve(method, true)?;
        self.session
            .notify_service(&self.descriptor, &method, args)
            .await
    }

    /// Looks a method up by name and checks its invocation convention.
    /// A two-way method cannot be notified and a one-way method cannot be
    /// called, so a convention mismatch resolves nothing.
    fn resolve(&self, name: &str, one_way: bool) -> Result<Arc<MethodDescriptor>> {
        let method = match self.descriptor.method(name) {
            Some(method) => method,
            None => {
                return Err(RpcError::MethodResolution {
                    service: self.descriptor.name().to_string(),
                    signature: name.to_string(),
                });
            }
        };
        if method.is_one_way() != one_way {
            return Err(RpcError::MethodResolution {
                service: self.descriptor.name().to_string(),
                signature: method.signature().to_string(),
            });
        }
        Ok(Arc::clone(method))
    }
}

impl PartialEq for RemoteService {
    fn eq(&self, other: &Self) -> bool {
        self.session.same_endpoint(&other.session)
            && self.descriptor.name() == other.descriptor.name()
    }
}

impl Eq for RemoteService {}

impl Hash for RemoteService {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.session.endpoint_id().hash(state);
        self.descriptor.name().hash(state);
    }
}

impl fmt::Debug for RemoteService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteService")
            .field("service", &self.descriptor.name())
            .field("session", &self.session.label())
            .finish()
    }
}

impl fmt::Display for RemoteService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.descriptor.name(), self.session.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ValueKind;
    use crate::service::{ParamSpec, ReturnSpec};
    use crate::transport::memory_channel;

    fn descriptor() -> Arc<ServiceDescriptor> {
        ServiceDescriptor::builder("Catalog")
            .two_way("lookup", [ParamSpec::string()], ReturnSpec::Value(ValueKind::Str))
            .one_way("touch", [ParamSpec::string()])
            .build()
            .unwrap()
    }

    fn session() -> RpcSession {
        let ((tx, rx), _peer) = memory_channel(4);
        RpcSession::builder().connect(tx, rx)
    }

    #[tokio::test]
    async fn test_call_on_one_way_method_is_rejected() {
        let catalog = session().stub(descriptor());
        let err = catalog
            .call("touch", vec![Arg::from("a")])
            .await
            .unwrap_err();
        match err {
            RpcError::MethodResolution { service, signature } => {
                assert_eq!(service, "Catalog");
                assert_eq!(signature, "touch(T)");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_notify_on_two_way_method_is_rejected() {
        let catalog = session().stub(descriptor());
        let err = catalog
            .notify("lookup", vec![Arg::from("a")])
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::MethodResolution { .. }));
    }

    #[tokio::test]
    async fn test_unknown_method_is_rejected() {
        let catalog = session().stub(descriptor());
        let err = catalog.call("missing", vec![]).await.unwrap_err();
        assert!(matches!(err, RpcError::MethodResolution { .. }));
    }

    #[tokio::test]
    async fn test_stub_identity_follows_session_and_name() {
        let session = session();
        let a = session.stub(descriptor());
        let b = session.stub(descriptor());
        assert_eq!(a, b);

        let other = ServiceDescriptor::builder("Other").build().unwrap();
        assert_ne!(a, session.stub(other));
        assert_eq!(a.to_string(), "Catalog@peer");
    }
}
