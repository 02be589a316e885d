//! Type resolution for enum and object payloads.
//!
//! The wire carries enums as `(type name, constant name)` and objects as
//! `(type name, serialized blob)`. Neither side interprets those payloads
//! without a registration: the [`TypeRegistry`] maps type names to decoders,
//! built explicitly at session construction instead of discovered by
//! reflection. Unresolvable names fail with a type-resolution error.
//!
//! Object blobs are MessagePack with named fields (`rmp_serde::to_vec_named`),
//! so field order never matters and blobs stay self-describing.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, RpcError};

/// Wire identity of an enum type.
///
/// Implemented by any enum that crosses the wire; the registry uses
/// `from_constant` to validate and materialize constants.
///
/// # Example
///
/// ```
/// use termwire::resolve::WireEnum;
///
/// #[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// enum Color {
///     Red,
///     Green,
/// }
///
/// impl WireEnum for Color {
///     const TYPE_NAME: &'static str = "Color";
///
///     fn constant_name(&self) -> &'static str {
///         match self {
///             Color::Red => "RED",
///             Color::Green => "GREEN",
///         }
///     }
///
///     fn from_constant(name: &str) -> Option<Self> {
///         match name {
///             "RED" => Some(Color::Red),
///             "GREEN" => Some(Color::Green),
///             _ => None,
///         }
///     }
/// }
/// ```
pub trait WireEnum: Any + Send + Sync + Sized {
    /// Type name sent on the wire.
    const TYPE_NAME: &'static str;

    /// Wire name of this constant.
    fn constant_name(&self) -> &'static str;

    /// Resolve a wire name back to the constant.
    fn from_constant(name: &str) -> Option<Self>;
}

/// A named enum constant as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumToken {
    type_name: String,
    constant: String,
}

impl EnumToken {
    /// Token for a concrete enum value.
    pub fn of<T: WireEnum>(value: T) -> Self {
        Self {
            type_name: T::TYPE_NAME.to_string(),
            constant: value.constant_name().to_string(),
        }
    }

    /// Token from raw wire names.
    pub fn new(type_name: impl Into<String>, constant: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            constant: constant.into(),
        }
    }

    #[inline]
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    #[inline]
    pub fn constant(&self) -> &str {
        &self.constant
    }

    pub(crate) fn into_parts(self) -> (String, String) {
        (self.type_name, self.constant)
    }

    /// Materialize the constant as a concrete enum type.
    pub fn decode<T: WireEnum>(&self) -> Result<T> {
        if self.type_name != T::TYPE_NAME {
            return Err(RpcError::TypeResolution {
                type_name: self.type_name.clone(),
            });
        }
        T::from_constant(&self.constant).ok_or_else(|| RpcError::TypeResolution {
            type_name: format!("{}.{}", self.type_name, self.constant),
        })
    }
}

/// An opaque object payload: a registered type name plus the boxed value.
///
/// Produced when decoding `Object`-kind values and when handlers or callers
/// supply object arguments, results or fault payloads.
pub struct ObjectValue {
    type_name: String,
    value: Box<dyn Any + Send + Sync>,
}

impl ObjectValue {
    /// Wrap a concrete value under its registered type name.
    pub fn new<T: Any + Send + Sync>(type_name: impl Into<String>, value: T) -> Self {
        Self {
            type_name: type_name.into(),
            value: Box::new(value),
        }
    }

    #[inline]
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// True when the boxed value is a `T`.
    #[inline]
    pub fn is<T: Any>(&self) -> bool {
        self.value.is::<T>()
    }

    /// Borrow the boxed value as a `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    /// Take the boxed value as a `T`, or get `self` back on mismatch.
    pub fn downcast<T: Any>(self) -> std::result::Result<T, ObjectValue> {
        match self.value.downcast::<T>() {
            Ok(boxed) => Ok(*boxed),
            Err(value) => Err(ObjectValue {
                type_name: self.type_name,
                value,
            }),
        }
    }

    pub(crate) fn raw(&self) -> &(dyn Any + Send + Sync) {
        self.value.as_ref()
    }
}

impl fmt::Debug for ObjectValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ObjectValue").field(&self.type_name).finish()
    }
}

type MarshalFn = Box<dyn Fn(&(dyn Any + Send + Sync)) -> Result<Vec<u8>> + Send + Sync>;
type UnmarshalFn = Box<dyn Fn(&[u8]) -> Result<Box<dyn Any + Send + Sync>> + Send + Sync>;

struct EnumEntry {
    resolves: Box<dyn Fn(&str) -> bool + Send + Sync>,
}

struct ObjectEntry {
    marshal: MarshalFn,
    unmarshal: UnmarshalFn,
}

/// Registry resolving enum and object type names to codecs.
///
/// Built once per session; immutable and shared afterwards.
#[derive(Default)]
pub struct TypeRegistry {
    enums: HashMap<String, EnumEntry>,
    objects: HashMap<String, ObjectEntry>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an enum type under its wire name.
    pub fn register_enum<T: WireEnum>(&mut self) {
        self.enums.insert(
            T::TYPE_NAME.to_string(),
            EnumEntry {
                resolves: Box::new(|name| T::from_constant(name).is_some()),
            },
        );
    }

    /// Register an object type under the given wire name.
    pub fn register_object<T>(&mut self, type_name: &str)
    where
        T: Serialize + DeserializeOwned + Any + Send + Sync,
    {
        let name = type_name.to_string();
        self.objects.insert(
            name.clone(),
            ObjectEntry {
                marshal: Box::new(move |any| {
                    let concrete = any.downcast_ref::<T>().ok_or_else(|| {
                        RpcError::protocol(format!("object {name} has an unexpected concrete type"))
                    })?;
                    Ok(rmp_serde::to_vec_named(concrete)?)
                }),
                unmarshal: Box::new(|blob| {
                    let concrete: T = rmp_serde::from_slice(blob)?;
                    Ok(Box::new(concrete))
                }),
            },
        );
    }

    #[inline]
    pub fn knows_enum(&self, type_name: &str) -> bool {
        self.enums.contains_key(type_name)
    }

    #[inline]
    pub fn knows_object(&self, type_name: &str) -> bool {
        self.objects.contains_key(type_name)
    }

    /// Validate that `type_name` is a registered enum with `constant`.
    pub fn resolve_constant(&self, type_name: &str, constant: &str) -> Result<()> {
        let entry = self
            .enums
            .get(type_name)
            .ok_or_else(|| RpcError::TypeResolution {
                type_name: type_name.to_string(),
            })?;
        if !(entry.resolves)(constant) {
            return Err(RpcError::TypeResolution {
                type_name: format!("{type_name}.{constant}"),
            });
        }
        Ok(())
    }

    /// Serialize an object value through its registered codec.
    pub fn marshal(&self, object: &ObjectValue) -> Result<Bytes> {
        let entry =
            self.objects
                .get(object.type_name())
                .ok_or_else(|| RpcError::TypeResolution {
                    type_name: object.type_name().to_string(),
                })?;
        Ok(Bytes::from((entry.marshal)(object.raw())?))
    }

    /// Deserialize an object blob through its registered codec.
    pub fn unmarshal(&self, type_name: &str, blob: &[u8]) -> Result<ObjectValue> {
        let entry = self
            .objects
            .get(type_name)
            .ok_or_else(|| RpcError::TypeResolution {
                type_name: type_name.to_string(),
            })?;
        Ok(ObjectValue {
            type_name: type_name.to_string(),
            value: (entry.unmarshal)(blob)?,
        })
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("enums", &self.enums.len())
            .field("objects", &self.objects.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Color {
        Red,
        Green,
        Blue,
    }

    impl WireEnum for Color {
        const TYPE_NAME: &'static str = "Color";

        fn constant_name(&self) -> &'static str {
            match self {
                Color::Red => "RED",
                Color::Green => "GREEN",
                Color::Blue => "BLUE",
            }
        }

        fn from_constant(name: &str) -> Option<Self> {
            match name {
                "RED" => Some(Color::Red),
                "GREEN" => Some(Color::Green),
                "BLUE" => Some(Color::Blue),
                _ => None,
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct UserPrefs {
        language: String,
        page_size: u32,
    }

    #[test]
    fn test_enum_token_roundtrip() {
        let token = EnumToken::of(Color::Red);
        assert_eq!(token.type_name(), "Color");
        assert_eq!(token.constant(), "RED");
        assert_eq!(token.decode::<Color>().unwrap(), Color::Red);
    }

    #[test]
    fn test_enum_token_unknown_constant() {
        let token = EnumToken::new("Color", "TEAL");
        let err = token.decode::<Color>().unwrap_err();
        assert!(matches!(err, RpcError::TypeResolution { .. }));
    }

    #[test]
    fn test_registry_resolves_known_constants() {
        let mut registry = TypeRegistry::new();
        registry.register_enum::<Color>();

        assert!(registry.knows_enum("Color"));
        registry.resolve_constant("Color", "GREEN").unwrap();
        assert!(registry.resolve_constant("Color", "TEAL").is_err());
        assert!(registry.resolve_constant("Shape", "SQUARE").is_err());
    }

    #[test]
    fn test_object_marshal_unmarshal() {
        let mut registry = TypeRegistry::new();
        registry.register_object::<UserPrefs>("UserPrefs");

        let prefs = UserPrefs {
            language: "en".to_string(),
            page_size: 50,
        };
        let object = ObjectValue::new("UserPrefs", prefs.clone());
        let blob = registry.marshal(&object).unwrap();

        let back = registry.unmarshal("UserPrefs", &blob).unwrap();
        assert_eq!(back.type_name(), "UserPrefs");
        assert_eq!(back.downcast::<UserPrefs>().unwrap(), prefs);
    }

    #[test]
    fn test_unregistered_object_fails_resolution() {
        let registry = TypeRegistry::new();
        let object = ObjectValue::new("Mystery", 42u32);
        assert!(matches!(
            registry.marshal(&object),
            Err(RpcError::TypeResolution { .. })
        ));
        assert!(matches!(
            registry.unmarshal("Mystery", &[0xc0]),
            Err(RpcError::TypeResolution { .. })
        ));
    }

    #[test]
    fn test_marshal_rejects_mismatched_concrete_type() {
        let mut registry = TypeRegistry::new();
        registry.register_object::<UserPrefs>("UserPrefs");

        let object = ObjectValue::new("UserPrefs", 42u32);
        assert!(matches!(
            registry.marshal(&object),
            Err(RpcError::Protocol(_))
        ));
    }

    #[test]
    fn test_unmarshal_bad_blob_is_decode_error() {
        let mut registry = TypeRegistry::new();
        registry.register_object::<UserPrefs>("UserPrefs");
        assert!(matches!(
            registry.unmarshal("UserPrefs", &[0xFF, 0x00]),
            Err(RpcError::ObjectDecode(_))
        ));
    }

    #[test]
    fn test_object_value_downcast_mismatch_returns_self() {
        let object = ObjectValue::new("UserPrefs", 42u32);
        let back = object.downcast::<String>().unwrap_err();
        assert_eq!(back.type_name(), "UserPrefs");
        assert_eq!(back.downcast::<u32>().unwrap(), 42);
    }
}
