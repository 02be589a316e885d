//! Error types for termwire.
//!
//! The taxonomy keeps three families apart on purpose: caller-side validation
//! failures (never reach the wire), protocol failures raised while decoding or
//! routing frames, and application faults raised by the remote method itself.
//! A remote fault is re-raised locally as [`RpcError::Remote`] carrying a
//! call-site marker (service and method names) instead of a rewritten stack.

use std::fmt;

use thiserror::Error;

use crate::resolve::ObjectValue;

/// Main error type for all termwire operations.
#[derive(Debug, Error)]
pub enum RpcError {
    /// I/O error from the underlying channel.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Object serialization error (MessagePack encode).
    #[error("object encode error: {0}")]
    ObjectEncode(#[from] rmp_serde::encode::Error),

    /// Object deserialization error (MessagePack decode).
    #[error("object decode error: {0}")]
    ObjectDecode(#[from] rmp_serde::decode::Error),

    /// Protocol error (malformed frame, kind mismatch, bad tag).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An argument could not be classified into any wire value kind.
    ///
    /// Raised before any frame is written.
    #[error("unsupported value for parameter {param}: {detail}")]
    UnsupportedValue { param: usize, detail: String },

    /// A proxied parameter was declared with a stream type other than the
    /// canonical one. Proxy kinds are matched by exact type, not polymorphism.
    ///
    /// Raised before any frame is written.
    #[error("cannot proxy {declared} for parameter {param}: exact {required} required")]
    UnsupportedProxySubtype {
        param: usize,
        declared: String,
        required: &'static str,
    },

    /// A service was declared or used inconsistently with its descriptor:
    /// duplicate methods, a proxied return kind, a handler reading a
    /// parameter as the wrong type. Local, never on the wire.
    #[error("service contract violation: {0}")]
    Contract(String),

    /// A type name on the wire has no registration on the receiving side.
    #[error("unresolvable type: {type_name}")]
    TypeResolution { type_name: String },

    /// A service or method signature could not be resolved by the receiver.
    #[error("unresolvable method {signature} on service {service}")]
    MethodResolution { service: String, signature: String },

    /// A secondary invocation referenced a call that no longer exists.
    #[error("no call in flight for correlation {correlation} (parameter {param})")]
    DanglingCorrelation { correlation: i64, param: u32 },

    /// A remote proxy was used after its owning call completed.
    #[error("proxy for call {correlation} parameter {param} used after completion")]
    StaleProxy { correlation: i64, param: u32 },

    /// The channel died with calls still in flight, or a send was attempted on
    /// a closed session. Pending calls are force-completed with this error.
    #[error("transport closed")]
    TransportClosed,

    /// The remote method raised an application fault.
    #[error("{0}")]
    Remote(RemoteFault),
}

/// Result type alias using RpcError.
pub type Result<T> = std::result::Result<T, RpcError>;

impl RpcError {
    /// True for errors raised by the remote method itself, as opposed to the
    /// invocation machinery.
    #[inline]
    pub fn is_application(&self) -> bool {
        matches!(self, RpcError::Remote(_))
    }

    pub(crate) fn protocol(detail: impl Into<String>) -> Self {
        RpcError::Protocol(detail.into())
    }

    pub(crate) fn contract(detail: impl Into<String>) -> Self {
        RpcError::Contract(detail.into())
    }
}

/// An application fault raised by a method handler.
///
/// Handlers return `Err(Fault)` to signal a domain error to the remote caller.
/// The responder tries to serialize `payload` through the session's type
/// registry so the caller can recover the typed value; when the payload is
/// absent or its type is not registered, the fault degrades to the type name
/// and message alone.
#[derive(Debug)]
pub struct Fault {
    type_name: String,
    message: String,
    payload: Option<ObjectValue>,
}

impl Fault {
    /// Create a fault carrying only a type name and message.
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
            payload: None,
        }
    }

    /// Create a fault carrying a typed payload.
    ///
    /// The payload's registered type name becomes the fault's type name.
    pub fn carrying(payload: ObjectValue, message: impl Into<String>) -> Self {
        Self {
            type_name: payload.type_name().to_string(),
            message: message.into(),
            payload: Some(payload),
        }
    }

    #[inline]
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    #[inline]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[inline]
    pub(crate) fn payload(&self) -> Option<&ObjectValue> {
        self.payload.as_ref()
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.type_name, self.message)
    }
}

/// Lets handlers propagate infrastructure errors with `?`. A remote fault
/// keeps its original type name and payload, so faults chain through
/// intermediate sessions intact; anything else degrades to a string fault.
impl From<RpcError> for Fault {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Remote(fault) => Self {
                type_name: fault.type_name,
                message: fault.message,
                payload: fault.payload,
            },
            other => Fault::new("RpcError", other.to_string()),
        }
    }
}

/// A remote application fault as observed by the caller.
///
/// `service` and `method` mark the local call site that re-raised the fault;
/// `payload` holds the decoded fault value when the caller's registry knows
/// the type.
#[derive(Debug)]
pub struct RemoteFault {
    pub(crate) service: String,
    pub(crate) method: String,
    pub(crate) type_name: String,
    pub(crate) message: String,
    pub(crate) payload: Option<ObjectValue>,
}

impl RemoteFault {
    /// Interface name of the call that raised the fault.
    #[inline]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Method signature of the call that raised the fault.
    #[inline]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Remote error type name.
    #[inline]
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Remote error message.
    #[inline]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Decoded fault payload, when the local registry knows the type.
    #[inline]
    pub fn payload(&self) -> Option<&ObjectValue> {
        self.payload.as_ref()
    }

    /// Take the decoded payload out of the fault.
    #[inline]
    pub fn into_payload(self) -> Option<ObjectValue> {
        self.payload
    }
}

impl fmt::Display for RemoteFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} (raised by {}.{})",
            self.type_name, self.message, self.service, self.method
        )
    }
}

impl std::error::Error for RemoteFault {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_display() {
        let fault = Fault::new("ArithmeticError", "div by zero");
        assert_eq!(fault.to_string(), "ArithmeticError: div by zero");
    }

    #[test]
    fn test_remote_fault_carries_call_site() {
        let fault = RemoteFault {
            service: "Calculator".to_string(),
            method: "divide(II)".to_string(),
            type_name: "ArithmeticError".to_string(),
            message: "div by zero".to_string(),
            payload: None,
        };
        let err = RpcError::Remote(fault);
        let text = err.to_string();
        assert!(text.contains("div by zero"));
        assert!(text.contains("Calculator.divide(II)"));
        assert!(err.is_application());
    }

    #[test]
    fn test_machinery_errors_are_not_application() {
        let err = RpcError::TransportClosed;
        assert!(!err.is_application());

        let err = RpcError::DanglingCorrelation {
            correlation: 7,
            param: 1,
        };
        assert!(!err.is_application());
    }
}
