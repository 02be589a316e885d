//! Service and method descriptors.
//!
//! A service is exposed or called through an explicit table of methods, built
//! once with [`ServiceDescriptor::builder`] and shared immutably afterwards.
//! Each method's wire key is its **signature string**, the method name plus
//! one kind letter per parameter (`divide(II)`, `ingest(TR)`); the receiving
//! side resolves inbound requests by that string alone.
//!
//! # Example
//!
//! ```
//! use termwire::codec::ValueKind;
//! use termwire::service::{ParamSpec, ReturnSpec, ServiceDescriptor};
//!
//! let calculator = ServiceDescriptor::builder("Calculator")
//!     .two_way(
//!         "add",
//!         [ParamSpec::int(), ParamSpec::int()],
//!         ReturnSpec::Value(ValueKind::Int),
//!     )
//!     .one_way("reset", [])
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(calculator.method("add").unwrap().signature(), "add(II)");
//! ```

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use crate::codec::ValueKind;
use crate::error::{Result, RpcError};
use crate::progress::{ProgressFeed, ProgressListener};
use crate::tunnel::{ByteSink, ByteSource, SinkStream, SourceStream};

#[derive(Debug, Clone, Copy)]
struct DeclaredType {
    id: TypeId,
    name: &'static str,
}

impl DeclaredType {
    fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }
}

/// Declared shape of one method parameter.
///
/// Proxied parameters must be declared as the canonical wrapper type; a
/// declaration naming any other stream or listener type is kept verbatim and
/// rejected when the method is first called, before a frame is written. The
/// protocol matches proxy types exactly instead of treating a variant as its
/// base and silently dropping whatever the variant added.
#[derive(Debug, Clone, Copy)]
pub struct ParamSpec {
    kind: ValueKind,
    declared: Option<DeclaredType>,
}

impl ParamSpec {
    fn plain(kind: ValueKind) -> Self {
        Self {
            kind,
            declared: None,
        }
    }

    pub fn boolean() -> Self {
        Self::plain(ValueKind::Bool)
    }

    pub fn byte() -> Self {
        Self::plain(ValueKind::Byte)
    }

    pub fn short() -> Self {
        Self::plain(ValueKind::Short)
    }

    pub fn int() -> Self {
        Self::plain(ValueKind::Int)
    }

    pub fn long() -> Self {
        Self::plain(ValueKind::Long)
    }

    pub fn float() -> Self {
        Self::plain(ValueKind::Float)
    }

    pub fn double() -> Self {
        Self::plain(ValueKind::Double)
    }

    pub fn string() -> Self {
        Self::plain(ValueKind::Str)
    }

    pub fn bytes() -> Self {
        Self::plain(ValueKind::Bytes)
    }

    /// A registered enum constant.
    pub fn enumeration() -> Self {
        Self::plain(ValueKind::Enum)
    }

    /// An opaque object serialized through the type registry.
    pub fn object() -> Self {
        Self::plain(ValueKind::Object)
    }

    /// A proxied progress feed (canonical [`ProgressFeed`]).
    pub fn progress() -> Self {
        Self::plain(ValueKind::Progress)
    }

    /// A proxied byte source (canonical [`ByteSource`]).
    pub fn source() -> Self {
        Self::plain(ValueKind::Source)
    }

    /// A proxied byte sink (canonical [`ByteSink`]).
    pub fn sink() -> Self {
        Self::plain(ValueKind::Sink)
    }

    /// A proxied progress feed declared as the concrete listener type `T`.
    ///
    /// Unless `T` is [`ProgressFeed`] itself, calling the method fails with
    /// [`RpcError::UnsupportedProxySubtype`].
    pub fn progress_of<T: ProgressListener + 'static>() -> Self {
        Self {
            kind: ValueKind::Progress,
            declared: Some(DeclaredType::of::<T>()),
        }
    }

    /// A proxied byte source declared as the concrete stream type `T`.
    ///
    /// Unless `T` is [`ByteSource`] itself, calling the method fails with
    /// [`RpcError::UnsupportedProxySubtype`].
    pub fn source_of<T: SourceStream + 'static>() -> Self {
        Self {
            kind: ValueKind::Source,
            declared: Some(DeclaredType::of::<T>()),
        }
    }

    /// A proxied byte sink declared as the concrete stream type `T`.
    ///
    /// Unless `T` is [`ByteSink`] itself, calling the method fails with
    /// [`RpcError::UnsupportedProxySubtype`].
    pub fn sink_of<T: SinkStream + 'static>() -> Self {
        Self {
            kind: ValueKind::Sink,
            declared: Some(DeclaredType::of::<T>()),
        }
    }

    /// Wire kind of this parameter.
    #[inline]
    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    /// Fail unless a proxied declaration names the canonical wrapper type.
    pub(crate) fn ensure_canonical(&self, param: usize) -> Result<()> {
        let declared = match self.declared {
            Some(declared) => declared,
            None => return Ok(()),
        };
        let (canonical, required) = match self.kind {
            ValueKind::Progress => (TypeId::of::<ProgressFeed>(), "ProgressFeed"),
            ValueKind::Source => (TypeId::of::<ByteSource>(), "ByteSource"),
            ValueKind::Sink => (TypeId::of::<ByteSink>(), "ByteSink"),
            _ => return Ok(()),
        };
        if declared.id != canonical {
            return Err(RpcError::UnsupportedProxySubtype {
                param,
                declared: declared.name.to_string(),
                required,
            });
        }
        Ok(())
    }
}

/// Declared shape of a method's result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnSpec {
    /// No result value. Two-way void methods still confirm with null.
    Void,
    /// A result of the given kind; proxied kinds are not returnable.
    Value(ValueKind),
}

/// One callable method of a service.
#[derive(Debug)]
pub struct MethodDescriptor {
    name: String,
    params: Vec<ParamSpec>,
    returns: ReturnSpec,
    one_way: bool,
    signature: String,
}

impl MethodDescriptor {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wire key of this method.
    #[inline]
    pub fn signature(&self) -> &str {
        &self.signature
    }

    #[inline]
    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    #[inline]
    pub fn returns(&self) -> ReturnSpec {
        self.returns
    }

    /// True for fire-and-forget methods: no confirmation, no observable
    /// result or error.
    #[inline]
    pub fn is_one_way(&self) -> bool {
        self.one_way
    }
}

fn derive_signature(name: &str, params: &[ParamSpec]) -> String {
    let mut signature = String::with_capacity(name.len() + params.len() + 2);
    signature.push_str(name);
    signature.push('(');
    for param in params {
        signature.push(param.kind().signature_letter());
    }
    signature.push(')');
    signature
}

/// An interface name plus its callable methods. Immutable once built.
#[derive(Debug)]
pub struct ServiceDescriptor {
    name: String,
    by_name: HashMap<String, Arc<MethodDescriptor>>,
    by_signature: HashMap<String, Arc<MethodDescriptor>>,
}

impl ServiceDescriptor {
    pub fn builder(name: impl Into<String>) -> ServiceDescriptorBuilder {
        ServiceDescriptorBuilder {
            name: name.into(),
            pending: Vec::new(),
        }
    }

    /// Interface name carried on the wire.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look a method up by its plain name (the caller-side key).
    pub fn method(&self, name: &str) -> Option<&Arc<MethodDescriptor>> {
        self.by_name.get(name)
    }

    /// Look a method up by its signature string (the wire-side key).
    pub fn method_by_signature(&self, signature: &str) -> Option<&Arc<MethodDescriptor>> {
        self.by_signature.get(signature)
    }

    pub fn methods(&self) -> impl Iterator<Item = &Arc<MethodDescriptor>> {
        self.by_name.values()
    }
}

struct PendingMethod {
    name: String,
    params: Vec<ParamSpec>,
    returns: ReturnSpec,
    one_way: bool,
}

/// Collects method declarations; all validation happens in [`build`].
///
/// [`build`]: ServiceDescriptorBuilder::build
pub struct ServiceDescriptorBuilder {
    name: String,
    pending: Vec<PendingMethod>,
}

impl ServiceDescriptorBuilder {
    /// Declare a two-way method: request, then confirmation with result or
    /// fault.
    pub fn two_way(
        mut self,
        name: impl Into<String>,
        params: impl IntoIterator<Item = ParamSpec>,
        returns: ReturnSpec,
    ) -> Self {
        self.pending.push(PendingMethod {
            name: name.into(),
            params: params.into_iter().collect(),
            returns,
            one_way: false,
        });
        self
    }

    /// Declare a fire-and-forget method: request only, never confirmed,
    /// necessarily void.
    pub fn one_way(
        mut self,
        name: impl Into<String>,
        params: impl IntoIterator<Item = ParamSpec>,
    ) -> Self {
        self.pending.push(PendingMethod {
            name: name.into(),
            params: params.into_iter().collect(),
            returns: ReturnSpec::Void,
            one_way: true,
        });
        self
    }

    /// Validate the collected declarations and freeze the descriptor.
    ///
    /// Rejected with [`RpcError::Contract`]: duplicate method names, proxied
    /// return kinds, and proxied parameters on one-way methods (no
    /// confirmation ever releases their slots).
    pub fn build(self) -> Result<Arc<ServiceDescriptor>> {
        let mut by_name = HashMap::with_capacity(self.pending.len());
        let mut by_signature = HashMap::with_capacity(self.pending.len());

        for pending in self.pending {
            if let ReturnSpec::Value(kind) = pending.returns {
                if kind.is_proxied() {
                    return Err(RpcError::contract(format!(
                        "method {}.{} declares a proxied return kind {kind:?}",
                        self.name, pending.name
                    )));
                }
            }
            if pending.one_way {
                if let Some(spec) = pending.params.iter().find(|spec| spec.kind().is_proxied()) {
                    return Err(RpcError::contract(format!(
                        "one-way method {}.{} declares a proxied {:?} parameter",
                        self.name,
                        pending.name,
                        spec.kind()
                    )));
                }
            }

            let signature = derive_signature(&pending.name, &pending.params);
            let method = Arc::new(MethodDescriptor {
                name: pending.name,
                params: pending.params,
                returns: pending.returns,
                one_way: pending.one_way,
                signature: signature.clone(),
            });
            if by_name
                .insert(method.name().to_string(), Arc::clone(&method))
                .is_some()
            {
                return Err(RpcError::contract(format!(
                    "method {}.{} declared twice",
                    self.name,
                    method.name()
                )));
            }
            by_signature.insert(signature, method);
        }

        Ok(Arc::new(ServiceDescriptor {
            name: self.name,
            by_name,
            by_signature,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::MemorySource;

    fn calculator() -> Arc<ServiceDescriptor> {
        ServiceDescriptor::builder("Calculator")
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
            .one_way("reset", [])
            .build()
            .unwrap()
    }

    #[test]
    fn test_signature_derivation() {
        let descriptor = ServiceDescriptor::builder("Importer")
            .two_way(
                "ingest",
                [ParamSpec::string(), ParamSpec::source(), ParamSpec::progress()],
                ReturnSpec::Value(ValueKind::Long),
            )
            .two_way("flush", [], ReturnSpec::Void)
            .build()
            .unwrap();

        assert_eq!(descriptor.method("ingest").unwrap().signature(), "ingest(TRP)");
        assert_eq!(descriptor.method("flush").unwrap().signature(), "flush()");
    }

    #[test]
    fn test_lookup_by_name_and_signature() {
        let descriptor = calculator();
        let add = descriptor.method("add").unwrap();
        assert_eq!(add.signature(), "add(II)");
        assert!(!add.is_one_way());

        let same = descriptor.method_by_signature("add(II)").unwrap();
        assert!(Arc::ptr_eq(add, same));

        assert!(descriptor.method("subtract").is_none());
        assert!(descriptor.method_by_signature("add(IJ)").is_none());

        let reset = descriptor.method("reset").unwrap();
        assert!(reset.is_one_way());
        assert_eq!(reset.returns(), ReturnSpec::Void);
    }

    #[test]
    fn test_duplicate_method_rejected() {
        let result = ServiceDescriptor::builder("Calculator")
            .two_way("add", [ParamSpec::int()], ReturnSpec::Void)
            .two_way("add", [ParamSpec::long()], ReturnSpec::Void)
            .build();
        assert!(matches!(result, Err(RpcError::Contract(_))));
    }

    #[test]
    fn test_proxied_return_rejected() {
        let result = ServiceDescriptor::builder("Export")
            .two_way("open", [], ReturnSpec::Value(ValueKind::Source))
            .build();
        assert!(matches!(result, Err(RpcError::Contract(_))));
    }

    #[test]
    fn test_one_way_with_proxy_rejected() {
        let result = ServiceDescriptor::builder("Audit")
            .one_way("record", [ParamSpec::string(), ParamSpec::sink()])
            .build();
        assert!(matches!(result, Err(RpcError::Contract(_))));
    }

    #[test]
    fn test_canonical_proxy_declarations_accepted() {
        ParamSpec::source().ensure_canonical(0).unwrap();
        ParamSpec::source_of::<ByteSource>().ensure_canonical(0).unwrap();
        ParamSpec::sink_of::<ByteSink>().ensure_canonical(1).unwrap();
        ParamSpec::progress_of::<ProgressFeed>().ensure_canonical(2).unwrap();
        ParamSpec::int().ensure_canonical(3).unwrap();
    }

    #[test]
    fn test_variant_proxy_declaration_rejected() {
        let err = ParamSpec::source_of::<MemorySource>()
            .ensure_canonical(1)
            .unwrap_err();
        match err {
            RpcError::UnsupportedProxySubtype {
                param,
                declared,
                required,
            } => {
                assert_eq!(param, 1);
                assert!(declared.contains("MemorySource"));
                assert_eq!(required, "ByteSource");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
