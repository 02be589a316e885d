//! Tagged value encoding and decoding.
//!
//! Every argument and result crosses the wire as a tagged value:
//! ```text
//! ┌─────────┬──────────────────────────────┐
//! │ kind    │ payload                      │
//! │ 1 byte  │ kind-specific, Big Endian    │
//! └─────────┴──────────────────────────────┘
//! ```
//! Nullability is a leading presence flag written *outside* the kind byte
//! (see [`put_opt_value`] / [`take_opt_value`]), so every kind can be null
//! without a dedicated tag.
//!
//! The proxied kinds ([`ValueKind::Progress`], [`ValueKind::Source`],
//! [`ValueKind::Sink`]) never carry the value itself: their payload is a
//! [`RemoteHandle`] naming the owning call and parameter slot, and all use of
//! the value happens through secondary invocations against that handle.
//!
//! All multi-byte integers are Big Endian. Strings are u16 length + UTF-8,
//! blobs are u32 length + bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, RpcError};

/// Maximum encoded blob length (16 MiB). Guards decode against hostile or
/// corrupt length prefixes.
pub const MAX_BLOB_LEN: usize = 16 * 1024 * 1024;

/// Closed set of wire value kinds.
///
/// The tag byte on the wire is the discriminant. A value that does not
/// classify into one of these kinds is rejected before anything is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ValueKind {
    Bool = 1,
    Byte = 2,
    Short = 3,
    Int = 4,
    Long = 5,
    Float = 6,
    Double = 7,
    Str = 8,
    Bytes = 9,
    /// Named constant of a registered enum type.
    Enum = 10,
    /// Opaque serialized object, interpreted only by the type registry.
    Object = 11,
    /// Proxied progress feed; payload is a [`RemoteHandle`].
    Progress = 12,
    /// Proxied byte source; payload is a [`RemoteHandle`].
    Source = 13,
    /// Proxied byte sink; payload is a [`RemoteHandle`].
    Sink = 14,
}

impl ValueKind {
    /// Decode a kind from its wire tag.
    pub fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            1 => ValueKind::Bool,
            2 => ValueKind::Byte,
            3 => ValueKind::Short,
            4 => ValueKind::Int,
            5 => ValueKind::Long,
            6 => ValueKind::Float,
            7 => ValueKind::Double,
            8 => ValueKind::Str,
            9 => ValueKind::Bytes,
            10 => ValueKind::Enum,
            11 => ValueKind::Object,
            12 => ValueKind::Progress,
            13 => ValueKind::Source,
            14 => ValueKind::Sink,
            other => {
                return Err(RpcError::protocol(format!("unknown value kind tag {other}")));
            }
        })
    }

    /// Wire tag for this kind.
    #[inline]
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Single-letter code used in method signature strings.
    pub fn signature_letter(self) -> char {
        match self {
            ValueKind::Bool => 'Z',
            ValueKind::Byte => 'B',
            ValueKind::Short => 'S',
            ValueKind::Int => 'I',
            ValueKind::Long => 'J',
            ValueKind::Float => 'F',
            ValueKind::Double => 'D',
            ValueKind::Str => 'T',
            ValueKind::Bytes => 'A',
            ValueKind::Enum => 'E',
            ValueKind::Object => 'O',
            ValueKind::Progress => 'P',
            ValueKind::Source => 'R',
            ValueKind::Sink => 'W',
        }
    }

    /// True for kinds whose payload is a [`RemoteHandle`] instead of the
    /// value itself.
    #[inline]
    pub fn is_proxied(self) -> bool {
        matches!(self, ValueKind::Progress | ValueKind::Source | ValueKind::Sink)
    }
}

/// Identifies a proxied parameter within exactly one primary invocation.
///
/// Created when a proxied-kind argument is sent; dead once the owning call
/// completes. Secondary invocations address the concrete local object through
/// this pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemoteHandle {
    /// Correlation id of the owning primary invocation.
    pub correlation: i64,
    /// Zero-based index of the proxied parameter.
    pub param: u32,
}

impl RemoteHandle {
    pub fn new(correlation: i64, param: u32) -> Self {
        Self { correlation, param }
    }
}

/// A decoded wire value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Str(String),
    Blob(Bytes),
    Enum { type_name: String, constant: String },
    Object { type_name: String, blob: Bytes },
    Handle { kind: ValueKind, handle: RemoteHandle },
}

impl Value {
    /// The wire kind of this value.
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Bool(_) => ValueKind::Bool,
            Value::Byte(_) => ValueKind::Byte,
            Value::Short(_) => ValueKind::Short,
            Value::Int(_) => ValueKind::Int,
            Value::Long(_) => ValueKind::Long,
            Value::Float(_) => ValueKind::Float,
            Value::Double(_) => ValueKind::Double,
            Value::Str(_) => ValueKind::Str,
            Value::Blob(_) => ValueKind::Bytes,
            Value::Enum { .. } => ValueKind::Enum,
            Value::Object { .. } => ValueKind::Object,
            Value::Handle { kind, .. } => *kind,
        }
    }

    /// Build a proxied-kind value.
    ///
    /// `kind` must be one of the proxied kinds.
    pub(crate) fn handle(kind: ValueKind, handle: RemoteHandle) -> Self {
        debug_assert!(kind.is_proxied());
        Value::Handle { kind, handle }
    }

    /// Encode this value, kind tag included.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_u8(self.kind().code());
        match self {
            Value::Bool(v) => buf.put_u8(u8::from(*v)),
            Value::Byte(v) => buf.put_i8(*v),
            Value::Short(v) => buf.put_i16(*v),
            Value::Int(v) => buf.put_i32(*v),
            Value::Long(v) => buf.put_i64(*v),
            Value::Float(v) => buf.put_f32(*v),
            Value::Double(v) => buf.put_f64(*v),
            Value::Str(v) => put_str(buf, v)?,
            Value::Blob(v) => put_blob(buf, v)?,
            Value::Enum {
                type_name,
                constant,
            } => {
                put_str(buf, type_name)?;
                put_str(buf, constant)?;
            }
            Value::Object { type_name, blob } => {
                put_str(buf, type_name)?;
                put_blob(buf, blob)?;
            }
            Value::Handle { handle, .. } => {
                buf.put_i64(handle.correlation);
                buf.put_u32(handle.param);
            }
        }
        Ok(())
    }

    /// Decode a value of the given kind from `buf`, advancing it.
    pub fn decode(kind: ValueKind, buf: &mut Bytes) -> Result<Self> {
        Ok(match kind {
            ValueKind::Bool => Value::Bool(take_u8(buf)? != 0),
            ValueKind::Byte => Value::Byte(take_i8(buf)?),
            ValueKind::Short => Value::Short(take_i16(buf)?),
            ValueKind::Int => Value::Int(take_i32(buf)?),
            ValueKind::Long => Value::Long(take_i64(buf)?),
            ValueKind::Float => Value::Float(take_f32(buf)?),
            ValueKind::Double => Value::Double(take_f64(buf)?),
            ValueKind::Str => Value::Str(take_str(buf)?),
            ValueKind::Bytes => Value::Blob(take_blob(buf)?),
            ValueKind::Enum => Value::Enum {
                type_name: take_str(buf)?,
                constant: take_str(buf)?,
            },
            ValueKind::Object => Value::Object {
                type_name: take_str(buf)?,
                blob: take_blob(buf)?,
            },
            ValueKind::Progress | ValueKind::Source | ValueKind::Sink => Value::Handle {
                kind,
                handle: RemoteHandle::new(take_i64(buf)?, take_u32(buf)?),
            },
        })
    }

    /// Decode a tagged value (kind byte first) from `buf`, advancing it.
    pub fn decode_tagged(buf: &mut Bytes) -> Result<Self> {
        let kind = ValueKind::from_code(take_u8(buf)?)?;
        Value::decode(kind, buf)
    }
}

/// Write an optional value: presence flag, then the tagged value if present.
pub fn put_opt_value(buf: &mut BytesMut, value: Option<&Value>) -> Result<()> {
    match value {
        Some(v) => {
            buf.put_u8(1);
            v.encode(buf)
        }
        None => {
            buf.put_u8(0);
            Ok(())
        }
    }
}

/// Read an optional value written by [`put_opt_value`].
pub fn take_opt_value(buf: &mut Bytes) -> Result<Option<Value>> {
    match take_u8(buf)? {
        0 => Ok(None),
        1 => Value::decode_tagged(buf).map(Some),
        other => Err(RpcError::protocol(format!(
            "invalid presence flag {other}"
        ))),
    }
}

fn need(buf: &Bytes, n: usize) -> Result<()> {
    if buf.remaining() < n {
        return Err(RpcError::protocol(format!(
            "truncated value: need {n} bytes, have {}",
            buf.remaining()
        )));
    }
    Ok(())
}

pub(crate) fn take_u8(buf: &mut Bytes) -> Result<u8> {
    need(buf, 1)?;
    Ok(buf.get_u8())
}

pub(crate) fn take_i8(buf: &mut Bytes) -> Result<i8> {
    need(buf, 1)?;
    Ok(buf.get_i8())
}

pub(crate) fn take_i16(buf: &mut Bytes) -> Result<i16> {
    need(buf, 2)?;
    Ok(buf.get_i16())
}

pub(crate) fn take_i32(buf: &mut Bytes) -> Result<i32> {
    need(buf, 4)?;
    Ok(buf.get_i32())
}

pub(crate) fn take_i64(buf: &mut Bytes) -> Result<i64> {
    need(buf, 8)?;
    Ok(buf.get_i64())
}

pub(crate) fn take_u32(buf: &mut Bytes) -> Result<u32> {
    need(buf, 4)?;
    Ok(buf.get_u32())
}

pub(crate) fn take_f32(buf: &mut Bytes) -> Result<f32> {
    need(buf, 4)?;
    Ok(buf.get_f32())
}

pub(crate) fn take_f64(buf: &mut Bytes) -> Result<f64> {
    need(buf, 8)?;
    Ok(buf.get_f64())
}

/// Read a u16-length-prefixed UTF-8 string.
pub(crate) fn take_str(buf: &mut Bytes) -> Result<String> {
    need(buf, 2)?;
    let len = buf.get_u16() as usize;
    need(buf, len)?;
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|e| RpcError::protocol(format!("invalid UTF-8 in string: {e}")))
}

/// Read a u32-length-prefixed blob as a zero-copy slice of `buf`.
pub(crate) fn take_blob(buf: &mut Bytes) -> Result<Bytes> {
    need(buf, 4)?;
    let len = buf.get_u32() as usize;
    if len > MAX_BLOB_LEN {
        return Err(RpcError::protocol(format!(
            "blob length {len} exceeds maximum {MAX_BLOB_LEN}"
        )));
    }
    need(buf, len)?;
    Ok(buf.split_to(len))
}

/// Write a u16-length-prefixed UTF-8 string.
pub(crate) fn put_str(buf: &mut BytesMut, s: &str) -> Result<()> {
    let len = u16::try_from(s.len())
        .map_err(|_| RpcError::protocol(format!("string length {} exceeds u16", s.len())))?;
    buf.put_u16(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

/// Write a u32-length-prefixed blob.
pub(crate) fn put_blob(buf: &mut BytesMut, b: &[u8]) -> Result<()> {
    if b.len() > MAX_BLOB_LEN {
        return Err(RpcError::protocol(format!(
            "blob length {} exceeds maximum {MAX_BLOB_LEN}",
            b.len()
        )));
    }
    buf.put_u32(b.len() as u32);
    buf.put_slice(b);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: Value) -> Value {
        let mut buf = BytesMut::new();
        value.encode(&mut buf).unwrap();
        let mut bytes = buf.freeze();
        let decoded = Value::decode_tagged(&mut bytes).unwrap();
        assert_eq!(bytes.remaining(), 0, "decode must consume the payload");
        decoded
    }

    #[test]
    fn test_scalar_roundtrip_representative_values() {
        let values = vec![
            Value::Bool(true),
            Value::Bool(false),
            Value::Byte(0),
            Value::Byte(-1),
            Value::Byte(i8::MIN),
            Value::Byte(i8::MAX),
            Value::Short(0),
            Value::Short(-300),
            Value::Short(i16::MIN),
            Value::Short(i16::MAX),
            Value::Int(0),
            Value::Int(-1),
            Value::Int(i32::MIN),
            Value::Int(i32::MAX),
            Value::Long(0),
            Value::Long(-1),
            Value::Long(i64::MIN),
            Value::Long(i64::MAX),
            Value::Float(0.0),
            Value::Float(-1.5),
            Value::Float(f32::MAX),
            Value::Float(f32::MIN),
            Value::Double(0.0),
            Value::Double(-2.25),
            Value::Double(f64::MAX),
            Value::Double(f64::MIN),
            Value::Str(String::new()),
            Value::Str("snomed".to_string()),
            Value::Blob(Bytes::new()),
            Value::Blob(Bytes::from_static(&[1, 2, 3])),
        ];
        for value in values {
            assert_eq!(roundtrip(value.clone()), value);
        }
    }

    #[test]
    fn test_enum_and_object_roundtrip() {
        let e = Value::Enum {
            type_name: "Color".to_string(),
            constant: "RED".to_string(),
        };
        assert_eq!(roundtrip(e.clone()), e);

        let o = Value::Object {
            type_name: "UserPrefs".to_string(),
            blob: Bytes::from_static(&[0x81, 0xa1, 0x61, 0x01]),
        };
        assert_eq!(roundtrip(o.clone()), o);
    }

    #[test]
    fn test_handle_roundtrip_for_each_proxied_kind() {
        for kind in [ValueKind::Progress, ValueKind::Source, ValueKind::Sink] {
            let v = Value::handle(kind, RemoteHandle::new(42, 3));
            let back = roundtrip(v.clone());
            assert_eq!(back, v);
            assert_eq!(back.kind(), kind);
        }
    }

    #[test]
    fn test_null_presence_flag() {
        let mut buf = BytesMut::new();
        put_opt_value(&mut buf, None).unwrap();
        put_opt_value(&mut buf, Some(&Value::Int(7))).unwrap();

        let mut bytes = buf.freeze();
        assert_eq!(take_opt_value(&mut bytes).unwrap(), None);
        assert_eq!(take_opt_value(&mut bytes).unwrap(), Some(Value::Int(7)));
        assert_eq!(bytes.remaining(), 0);
    }

    #[test]
    fn test_unknown_kind_tag_rejected() {
        assert!(ValueKind::from_code(0).is_err());
        assert!(ValueKind::from_code(15).is_err());
        assert!(ValueKind::from_code(255).is_err());
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let mut buf = BytesMut::new();
        Value::Long(123456789).encode(&mut buf).unwrap();
        let full = buf.freeze();

        // Every strict prefix must fail, never panic.
        for cut in 0..full.len() {
            let mut partial = full.slice(0..cut);
            assert!(Value::decode_tagged(&mut partial).is_err());
        }
    }

    #[test]
    fn test_blob_length_guard() {
        let mut bytes = BytesMut::new();
        bytes.put_u8(ValueKind::Bytes.code());
        bytes.put_u32((MAX_BLOB_LEN + 1) as u32);
        let mut buf = bytes.freeze();
        let err = Value::decode_tagged(&mut buf).unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_signature_letters_are_distinct() {
        let kinds = [
            ValueKind::Bool,
            ValueKind::Byte,
            ValueKind::Short,
            ValueKind::Int,
            ValueKind::Long,
            ValueKind::Float,
            ValueKind::Double,
            ValueKind::Str,
            ValueKind::Bytes,
            ValueKind::Enum,
            ValueKind::Object,
            ValueKind::Progress,
            ValueKind::Source,
            ValueKind::Sink,
        ];
        let mut seen = std::collections::HashSet::new();
        for kind in kinds {
            assert!(seen.insert(kind.signature_letter()));
            assert_eq!(ValueKind::from_code(kind.code()).unwrap(), kind);
        }
    }

    #[test]
    fn test_proxied_kind_classification() {
        assert!(ValueKind::Progress.is_proxied());
        assert!(ValueKind::Source.is_proxied());
        assert!(ValueKind::Sink.is_proxied());
        assert!(!ValueKind::Int.is_proxied());
        assert!(!ValueKind::Object.is_proxied());
    }
}
