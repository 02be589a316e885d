//! Codec module - the closed, tagged value-type system.
//!
//! Every argument and result crosses the wire as a tagged [`Value`]. The tag
//! set is closed: anything that does not classify into one of the
//! [`ValueKind`]s is rejected on the sending side before a frame exists.
//! Proxied kinds carry a [`RemoteHandle`] instead of the value itself.
//!
//! # Example
//!
//! ```
//! use termwire::codec::{Value, ValueKind};
//! use bytes::BytesMut;
//!
//! let mut buf = BytesMut::new();
//! Value::Int(42).encode(&mut buf).unwrap();
//!
//! let mut bytes = buf.freeze();
//! let decoded = Value::decode_tagged(&mut bytes).unwrap();
//! assert_eq!(decoded, Value::Int(42));
//! assert_eq!(decoded.kind(), ValueKind::Int);
//! ```

pub mod value;

pub use value::{RemoteHandle, Value, ValueKind, MAX_BLOB_LEN};
