//! Arguments, results and the per-invocation handler context.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::codec::{Value, ValueKind};
use crate::error::{Result, RpcError};
use crate::progress::ProgressFeed;
use crate::resolve::{EnumToken, ObjectValue, TypeRegistry, WireEnum};
use crate::service::descriptor::{MethodDescriptor, ServiceDescriptor};
use crate::session::RpcSession;
use crate::tunnel::{ByteSink, ByteSource};

/// One argument or result as seen by user code.
///
/// Callers build these (usually through the `From` conversions) and hand them
/// to a stub; handlers receive them materialized inside [`Args`] and return
/// one as the result. The proxied variants carry the real local object on the
/// sending side and a remote adapter on the receiving side.
#[derive(Debug)]
pub enum Arg {
    Null,
    Bool(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Str(String),
    Blob(Bytes),
    Enum(EnumToken),
    Object(ObjectValue),
    Progress(ProgressFeed),
    Source(ByteSource),
    Sink(ByteSink),
}

impl Arg {
    /// A registered enum constant.
    pub fn enumeration<T: WireEnum>(value: T) -> Self {
        Arg::Enum(EnumToken::of(value))
    }

    /// An object under its registered wire type name.
    pub fn object<T: std::any::Any + Send + Sync>(
        type_name: impl Into<String>,
        value: T,
    ) -> Self {
        Arg::Object(ObjectValue::new(type_name, value))
    }

    /// Wire kind of this argument; `None` for null.
    pub fn kind(&self) -> Option<ValueKind> {
        Some(match self {
            Arg::Null => return None,
            Arg::Bool(_) => ValueKind::Bool,
            Arg::Byte(_) => ValueKind::Byte,
            Arg::Short(_) => ValueKind::Short,
            Arg::Int(_) => ValueKind::Int,
            Arg::Long(_) => ValueKind::Long,
            Arg::Float(_) => ValueKind::Float,
            Arg::Double(_) => ValueKind::Double,
            Arg::Str(_) => ValueKind::Str,
            Arg::Blob(_) => ValueKind::Bytes,
            Arg::Enum(_) => ValueKind::Enum,
            Arg::Object(_) => ValueKind::Object,
            Arg::Progress(_) => ValueKind::Progress,
            Arg::Source(_) => ValueKind::Source,
            Arg::Sink(_) => ValueKind::Sink,
        })
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Arg::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Arg::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_byte(&self) -> Option<i8> {
        match self {
            Arg::Byte(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_short(&self) -> Option<i16> {
        match self {
            Arg::Short(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Arg::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_long(&self) -> Option<i64> {
        match self {
            Arg::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f32> {
        match self {
            Arg::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            Arg::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Arg::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&Bytes> {
        match self {
            Arg::Blob(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_enum(&self) -> Option<&EnumToken> {
        match self {
            Arg::Enum(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectValue> {
        match self {
            Arg::Object(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_string(self) -> Option<String> {
        match self {
            Arg::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_blob(self) -> Option<Bytes> {
        match self {
            Arg::Blob(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_enum(self) -> Option<EnumToken> {
        match self {
            Arg::Enum(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_object(self) -> Option<ObjectValue> {
        match self {
            Arg::Object(v) => Some(v),
            _ => None,
        }
    }

    /// Lower to a wire value. Objects are marshaled here; proxied variants
    /// cannot be lowered without a slot and fail with a contract error.
    pub(crate) fn to_wire(self, registry: &TypeRegistry) -> Result<Option<Value>> {
        Ok(match self {
            Arg::Null => None,
            Arg::Bool(v) => Some(Value::Bool(v)),
            Arg::Byte(v) => Some(Value::Byte(v)),
            Arg::Short(v) => Some(Value::Short(v)),
            Arg::Int(v) => Some(Value::Int(v)),
            Arg::Long(v) => Some(Value::Long(v)),
            Arg::Float(v) => Some(Value::Float(v)),
            Arg::Double(v) => Some(Value::Double(v)),
            Arg::Str(v) => Some(Value::Str(v)),
            Arg::Blob(v) => Some(Value::Blob(v)),
            Arg::Enum(token) => {
                let (type_name, constant) = token.into_parts();
                Some(Value::Enum {
                    type_name,
                    constant,
                })
            }
            Arg::Object(object) => {
                let blob = registry.marshal(&object)?;
                Some(Value::Object {
                    type_name: object.type_name().to_string(),
                    blob,
                })
            }
            Arg::Progress(_) | Arg::Source(_) | Arg::Sink(_) => {
                return Err(RpcError::contract(
                    "proxied value outside a proxyable parameter position",
                ));
            }
        })
    }

    /// Materialize a wire value. Enum constants are validated and objects
    /// unmarshaled eagerly, so resolution failures surface before any handler
    /// runs. Proxied handles are materialized by the session, never here.
    pub(crate) fn from_wire(value: Value, registry: &TypeRegistry) -> Result<Arg> {
        Ok(match value {
            Value::Bool(v) => Arg::Bool(v),
            Value::Byte(v) => Arg::Byte(v),
            Value::Short(v) => Arg::Short(v),
            Value::Int(v) => Arg::Int(v),
            Value::Long(v) => Arg::Long(v),
            Value::Float(v) => Arg::Float(v),
            Value::Double(v) => Arg::Double(v),
            Value::Str(v) => Arg::Str(v),
            Value::Blob(v) => Arg::Blob(v),
            Value::Enum {
                type_name,
                constant,
            } => {
                registry.resolve_constant(&type_name, &constant)?;
                Arg::Enum(EnumToken::new(type_name, constant))
            }
            Value::Object { type_name, blob } => {
                Arg::Object(registry.unmarshal(&type_name, &blob)?)
            }
            Value::Handle { .. } => {
                return Err(RpcError::protocol(
                    "proxied handle outside a request argument",
                ));
            }
        })
    }
}

impl From<bool> for Arg {
    fn from(v: bool) -> Self {
        Arg::Bool(v)
    }
}

impl From<i8> for Arg {
    fn from(v: i8) -> Self {
        Arg::Byte(v)
    }
}

impl From<i16> for Arg {
    fn from(v: i16) -> Self {
        Arg::Short(v)
    }
}

impl From<i32> for Arg {
    fn from(v: i32) -> Self {
        Arg::Int(v)
    }
}

impl From<i64> for Arg {
    fn from(v: i64) -> Self {
        Arg::Long(v)
    }
}

impl From<f32> for Arg {
    fn from(v: f32) -> Self {
        Arg::Float(v)
    }
}

impl From<f64> for Arg {
    fn from(v: f64) -> Self {
        Arg::Double(v)
    }
}

impl From<String> for Arg {
    fn from(v: String) -> Self {
        Arg::Str(v)
    }
}

impl From<&str> for Arg {
    fn from(v: &str) -> Self {
        Arg::Str(v.to_string())
    }
}

impl From<Bytes> for Arg {
    fn from(v: Bytes) -> Self {
        Arg::Blob(v)
    }
}

impl From<Vec<u8>> for Arg {
    fn from(v: Vec<u8>) -> Self {
        Arg::Blob(Bytes::from(v))
    }
}

impl From<EnumToken> for Arg {
    fn from(v: EnumToken) -> Self {
        Arg::Enum(v)
    }
}

impl From<ObjectValue> for Arg {
    fn from(v: ObjectValue) -> Self {
        Arg::Object(v)
    }
}

impl From<ProgressFeed> for Arg {
    fn from(v: ProgressFeed) -> Self {
        Arg::Progress(v)
    }
}

impl From<ByteSource> for Arg {
    fn from(v: ByteSource) -> Self {
        Arg::Source(v)
    }
}

impl From<ByteSink> for Arg {
    fn from(v: ByteSink) -> Self {
        Arg::Sink(v)
    }
}

fn typed_err(index: usize, wanted: &str, arg: &Arg) -> RpcError {
    let actual = match arg.kind() {
        Some(kind) => format!("{kind:?}"),
        None => "null".to_string(),
    };
    RpcError::contract(format!("parameter {index} holds {actual}, read as {wanted}"))
}

/// Materialized arguments handed to a method handler.
///
/// Arguments were validated against the method descriptor before dispatch, so
/// the typed getters only fail when a handler disagrees with its own declared
/// parameter kinds (or reads a null). Proxied and object arguments are moved
/// out with the `take_*` getters; a taken slot reads as null afterwards.
#[derive(Debug)]
pub struct Args {
    values: Vec<Arg>,
}

impl Args {
    pub(crate) fn new(values: Vec<Arg>) -> Self {
        Self { values }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Arg> {
        self.values.get(index)
    }

    /// True when the caller passed null at `index`.
    pub fn is_null(&self, index: usize) -> bool {
        matches!(self.values.get(index), Some(Arg::Null))
    }

    fn arg(&self, index: usize) -> Result<&Arg> {
        self.values
            .get(index)
            .ok_or_else(|| RpcError::contract(format!("no parameter at index {index}")))
    }

    fn arg_mut(&mut self, index: usize) -> Result<&mut Arg> {
        self.values
            .get_mut(index)
            .ok_or_else(|| RpcError::contract(format!("no parameter at index {index}")))
    }

    pub fn bool_at(&self, index: usize) -> Result<bool> {
        let arg = self.arg(index)?;
        arg.as_bool().ok_or_else(|| typed_err(index, "Bool", arg))
    }

    pub fn byte_at(&self, index: usize) -> Result<i8> {
        let arg = self.arg(index)?;
        arg.as_byte().ok_or_else(|| typed_err(index, "Byte", arg))
    }

    pub fn short_at(&self, index: usize) -> Result<i16> {
        let arg = self.arg(index)?;
        arg.as_short().ok_or_else(|| typed_err(index, "Short", arg))
    }

    pub fn int_at(&self, index: usize) -> Result<i32> {
        let arg = self.arg(index)?;
        arg.as_int().ok_or_else(|| typed_err(index, "Int", arg))
    }

    pub fn long_at(&self, index: usize) -> Result<i64> {
        let arg = self.arg(index)?;
        arg.as_long().ok_or_else(|| typed_err(index, "Long", arg))
    }

    pub fn float_at(&self, index: usize) -> Result<f32> {
        let arg = self.arg(index)?;
        arg.as_float().ok_or_else(|| typed_err(index, "Float", arg))
    }

    pub fn double_at(&self, index: usize) -> Result<f64> {
        let arg = self.arg(index)?;
        arg.as_double()
            .ok_or_else(|| typed_err(index, "Double", arg))
    }

    pub fn str_at(&self, index: usize) -> Result<&str> {
        let arg = self.arg(index)?;
        arg.as_str().ok_or_else(|| typed_err(index, "Str", arg))
    }

    pub fn blob_at(&self, index: usize) -> Result<&Bytes> {
        let arg = self.arg(index)?;
        arg.as_blob().ok_or_else(|| typed_err(index, "Bytes", arg))
    }

    /// Decode an enum argument as the concrete type `T`.
    pub fn enum_at<T: WireEnum>(&self, index: usize) -> Result<T> {
        let arg = self.arg(index)?;
        arg.as_enum()
            .ok_or_else(|| typed_err(index, "Enum", arg))?
            .decode::<T>()
    }

    pub fn object_at(&self, index: usize) -> Result<&ObjectValue> {
        let arg = self.arg(index)?;
        arg.as_object()
            .ok_or_else(|| typed_err(index, "Object", arg))
    }

    /// Move an object argument out.
    pub fn take_object(&mut self, index: usize) -> Result<ObjectValue> {
        let arg = self.arg_mut(index)?;
        match std::mem::replace(arg, Arg::Null) {
            Arg::Object(object) => Ok(object),
            other => {
                let err = typed_err(index, "Object", &other);
                *arg = other;
                Err(err)
            }
        }
    }

    /// Move a proxied progress feed out.
    pub fn take_progress(&mut self, index: usize) -> Result<ProgressFeed> {
        let arg = self.arg_mut(index)?;
        match std::mem::replace(arg, Arg::Null) {
            Arg::Progress(feed) => Ok(feed),
            other => {
                let err = typed_err(index, "Progress", &other);
                *arg = other;
                Err(err)
            }
        }
    }

    /// Move a proxied byte source out.
    pub fn take_source(&mut self, index: usize) -> Result<ByteSource> {
        let arg = self.arg_mut(index)?;
        match std::mem::replace(arg, Arg::Null) {
            Arg::Source(source) => Ok(source),
            other => {
                let err = typed_err(index, "Source", &other);
                *arg = other;
                Err(err)
            }
        }
    }

    /// Move a proxied byte sink out.
    pub fn take_sink(&mut self, index: usize) -> Result<ByteSink> {
        let arg = self.arg_mut(index)?;
        match std::mem::replace(arg, Arg::Null) {
            Arg::Sink(sink) => Ok(sink),
            other => {
                let err = typed_err(index, "Sink", &other);
                *arg = other;
                Err(err)
            }
        }
    }
}

/// Per-invocation context handed to every handler.
///
/// Carries the session (for nested calls or calls back the other way), the
/// correlation id of the invocation being served (0 for one-way), and the
/// resolved method identity.
pub struct CallContext {
    session: RpcSession,
    correlation: i64,
    service: Arc<ServiceDescriptor>,
    method: Arc<MethodDescriptor>,
}

impl CallContext {
    pub(crate) fn new(
        session: RpcSession,
        correlation: i64,
        service: Arc<ServiceDescriptor>,
        method: Arc<MethodDescriptor>,
    ) -> Self {
        Self {
            session,
            correlation,
            service,
            method,
        }
    }

    /// The session this invocation arrived on.
    #[inline]
    pub fn session(&self) -> &RpcSession {
        &self.session
    }

    #[inline]
    pub fn correlation(&self) -> i64 {
        self.correlation
    }

    #[inline]
    pub fn service(&self) -> &ServiceDescriptor {
        &self.service
    }

    #[inline]
    pub fn method(&self) -> &MethodDescriptor {
        &self.method
    }
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("correlation", &self.correlation)
            .field("service", &self.service.name())
            .field("method", &self.method.signature())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Mode {
        Fast,
        Safe,
    }

    impl WireEnum for Mode {
        const TYPE_NAME: &'static str = "Mode";

        fn constant_name(&self) -> &'static str {
            match self {
                Mode::Fast => "FAST",
                Mode::Safe => "SAFE",
            }
        }

        fn from_constant(name: &str) -> Option<Self> {
            match name {
                "FAST" => Some(Mode::Fast),
                "SAFE" => Some(Mode::Safe),
                _ => None,
            }
        }
    }

    fn registry() -> TypeRegistry {
        let mut registry = TypeRegistry::new();
        registry.register_enum::<Mode>();
        registry
    }

    #[test]
    fn test_scalars_to_and_from_wire() {
        let registry = registry();
        let pairs = [
            (Arg::from(true), Value::Bool(true)),
            (Arg::from(-3i8), Value::Byte(-3)),
            (Arg::from(400i16), Value::Short(400)),
            (Arg::from(5i32), Value::Int(5)),
            (Arg::from(i64::MIN), Value::Long(i64::MIN)),
            (Arg::from(1.5f32), Value::Float(1.5)),
            (Arg::from(2.25f64), Value::Double(2.25)),
            (Arg::from("hi"), Value::Str("hi".to_string())),
        ];
        for (arg, value) in pairs {
            assert_eq!(arg.to_wire(&registry).unwrap(), Some(value.clone()));
            let back = Arg::from_wire(value.clone(), &registry).unwrap();
            assert_eq!(back.to_wire(&registry).unwrap(), Some(value));
        }

        assert_eq!(Arg::Null.to_wire(&registry).unwrap(), None);
    }

    #[test]
    fn test_enum_validated_on_materialize() {
        let registry = registry();

        let arg = Arg::enumeration(Mode::Fast);
        let value = arg.to_wire(&registry).unwrap().unwrap();
        let back = Arg::from_wire(value, &registry).unwrap();
        assert_eq!(back.as_enum().unwrap().decode::<Mode>().unwrap(), Mode::Fast);

        let unknown = Value::Enum {
            type_name: "Season".to_string(),
            constant: "SPRING".to_string(),
        };
        assert!(matches!(
            Arg::from_wire(unknown, &registry),
            Err(RpcError::TypeResolution { .. })
        ));
    }

    #[test]
    fn test_proxied_arg_cannot_lower_without_slot() {
        let registry = registry();
        let arg = Arg::Source(ByteSource::from_bytes(vec![1u8]));
        assert!(matches!(
            arg.to_wire(&registry),
            Err(RpcError::Contract(_))
        ));
    }

    #[test]
    fn test_handle_never_materializes_here() {
        let registry = registry();
        let value = Value::Handle {
            kind: ValueKind::Sink,
            handle: crate::codec::RemoteHandle::new(4, 1),
        };
        assert!(matches!(
            Arg::from_wire(value, &registry),
            Err(RpcError::Protocol(_))
        ));
    }

    #[test]
    fn test_typed_getters() {
        let args = Args::new(vec![Arg::Int(7), Arg::Str("name".to_string()), Arg::Null]);

        assert_eq!(args.len(), 3);
        assert_eq!(args.int_at(0).unwrap(), 7);
        assert_eq!(args.str_at(1).unwrap(), "name");
        assert!(args.is_null(2));

        assert!(matches!(args.int_at(1), Err(RpcError::Contract(_))));
        assert!(matches!(args.long_at(2), Err(RpcError::Contract(_))));
        assert!(matches!(args.int_at(9), Err(RpcError::Contract(_))));
    }

    #[test]
    fn test_take_moves_value_out() {
        let mut args = Args::new(vec![
            Arg::Source(ByteSource::from_bytes(vec![1u8, 2])),
            Arg::Int(1),
        ]);

        let source = args.take_source(0);
        assert!(source.is_ok());
        assert!(args.is_null(0));
        assert!(matches!(args.take_source(0), Err(RpcError::Contract(_))));

        // A failed take leaves the argument in place.
        assert!(args.take_sink(1).is_err());
        assert_eq!(args.int_at(1).unwrap(), 1);
    }
}
