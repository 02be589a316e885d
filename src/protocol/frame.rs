//! Request and confirmation frames.
//!
//! The transport owns physical framing; this layer owns the logical layout of
//! one message:
//! ```text
//! request:      signal, correlation,
//!               [slot target: owner, param] | [service target: name],
//!               signature, argc, argc x (present, [kind, payload])
//! confirmation: signal, correlation, ok,
//!               ok=1: (present, [kind, payload])
//!               ok=0: (fault kind, type name, message, blob present, [blob])
//! ```
//! Primary and secondary invocations share this framing and are told apart by
//! the signal tag, so a receiver can route each independently: requests go to
//! the service registry or the proxy-slot table, confirmations to the pending
//! call they answer.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::value::{
    put_blob, put_opt_value, put_str, take_blob, take_i64, take_opt_value, take_str, take_u32,
    take_u8,
};
use crate::codec::Value;
use crate::error::{Result, RpcError};

/// Signal tags, first byte of every frame.
pub mod signal {
    /// Two-way caller-to-service request.
    pub const PRIMARY_REQUEST: u8 = 1;
    /// Fire-and-forget caller-to-service request; carries correlation 0 and
    /// is never confirmed.
    pub const PRIMARY_ONE_WAY: u8 = 2;
    /// Callee-to-caller request against a proxied parameter slot.
    pub const SECONDARY_REQUEST: u8 = 3;
    /// Confirmation of a two-way primary request.
    pub const PRIMARY_CONFIRM: u8 = 4;
    /// Confirmation of a secondary request.
    pub const SECONDARY_CONFIRM: u8 = 5;
}

/// Correlation id carried by one-way requests, which never get an entry in
/// the pending table.
pub const ONE_WAY_CORRELATION: i64 = 0;

/// Maximum argument count per request (argc is one byte on the wire).
pub const MAX_ARGS: usize = u8::MAX as usize;

/// Which of the two invocation families a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationKind {
    /// Caller-initiated call into a registered service.
    Primary,
    /// Callee-initiated call back into a proxied argument.
    Secondary,
}

impl InvocationKind {
    /// The confirmation signal tag for this family.
    #[inline]
    pub fn confirm_signal(self) -> u8 {
        match self {
            InvocationKind::Primary => signal::PRIMARY_CONFIRM,
            InvocationKind::Secondary => signal::SECONDARY_CONFIRM,
        }
    }
}

/// Where a request is addressed.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    /// Primary invocation against a registered service interface.
    Service { name: String, one_way: bool },
    /// Secondary invocation against the proxied parameter `param` of the
    /// still-pending call `owner`.
    Slot { owner: i64, param: u32 },
}

/// A decoded request frame.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestFrame {
    /// Correlation id of this request ([`ONE_WAY_CORRELATION`] for one-way).
    pub correlation: i64,
    pub target: Target,
    /// Method signature string, e.g. `divide(II)`.
    pub signature: String,
    /// Encoded arguments; `None` is a null argument.
    pub args: Vec<Option<Value>>,
}

impl RequestFrame {
    /// Signal tag this request encodes to.
    pub fn signal(&self) -> u8 {
        match &self.target {
            Target::Service { one_way: false, .. } => signal::PRIMARY_REQUEST,
            Target::Service { one_way: true, .. } => signal::PRIMARY_ONE_WAY,
            Target::Slot { .. } => signal::SECONDARY_REQUEST,
        }
    }

    /// The invocation family of this request.
    pub fn kind(&self) -> InvocationKind {
        match self.target {
            Target::Service { .. } => InvocationKind::Primary,
            Target::Slot { .. } => InvocationKind::Secondary,
        }
    }

    /// True when no confirmation may ever be written for this request.
    #[inline]
    pub fn is_one_way(&self) -> bool {
        matches!(self.target, Target::Service { one_way: true, .. })
    }
}

/// Fault discriminants on the wire. Keeps protocol failures and application
/// faults from ever being mistaken for one another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FaultKind {
    /// The remote method's own error.
    Application = 0,
    /// A type name could not be resolved while decoding.
    TypeResolution = 1,
    /// A service or method signature could not be resolved.
    MethodResolution = 2,
    /// The addressed call no longer exists.
    DanglingCorrelation = 3,
    /// Responder-side machinery failure (encode error and the like).
    Internal = 4,
}

impl FaultKind {
    pub fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            0 => FaultKind::Application,
            1 => FaultKind::TypeResolution,
            2 => FaultKind::MethodResolution,
            3 => FaultKind::DanglingCorrelation,
            4 => FaultKind::Internal,
            other => {
                return Err(RpcError::protocol(format!("unknown fault kind tag {other}")));
            }
        })
    }

    #[inline]
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// A fault as carried by a negative confirmation.
#[derive(Debug, Clone, PartialEq)]
pub struct WireFault {
    pub kind: FaultKind,
    pub type_name: String,
    pub message: String,
    /// Serialized fault payload, present only when the responder could encode
    /// the original error object.
    pub blob: Option<Bytes>,
}

impl WireFault {
    /// Application fault without a payload (the string-only degradation).
    pub fn application(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: FaultKind::Application,
            type_name: type_name.into(),
            message: message.into(),
            blob: None,
        }
    }

    /// Protocol fault of the given kind.
    pub fn protocol(kind: FaultKind, message: impl Into<String>) -> Self {
        debug_assert!(kind != FaultKind::Application);
        Self {
            kind,
            type_name: String::new(),
            message: message.into(),
            blob: None,
        }
    }
}

/// Outcome carried by a confirmation.
#[derive(Debug, Clone, PartialEq)]
pub enum WireOutcome {
    /// Success; `None` is a void or null result.
    Ok(Option<Value>),
    Fault(WireFault),
}

/// A decoded confirmation frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmFrame {
    /// Which pending-call family this confirmation answers.
    pub kind: InvocationKind,
    /// Correlation id of the request being answered.
    pub correlation: i64,
    pub outcome: WireOutcome,
}

impl ConfirmFrame {
    pub fn ok(kind: InvocationKind, correlation: i64, result: Option<Value>) -> Self {
        Self {
            kind,
            correlation,
            outcome: WireOutcome::Ok(result),
        }
    }

    pub fn fault(kind: InvocationKind, correlation: i64, fault: WireFault) -> Self {
        Self {
            kind,
            correlation,
            outcome: WireOutcome::Fault(fault),
        }
    }
}

/// One logical wire message.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Request(RequestFrame),
    Confirm(ConfirmFrame),
}

impl Frame {
    /// Encode this frame into a single transport message.
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        match self {
            Frame::Request(req) => {
                if req.args.len() > MAX_ARGS {
                    return Err(RpcError::protocol(format!(
                        "argument count {} exceeds maximum {MAX_ARGS}",
                        req.args.len()
                    )));
                }
                buf.put_u8(req.signal());
                buf.put_i64(req.correlation);
                match &req.target {
                    Target::Service { name, .. } => put_str(&mut buf, name)?,
                    Target::Slot { owner, param } => {
                        buf.put_i64(*owner);
                        buf.put_u32(*param);
                    }
                }
                put_str(&mut buf, &req.signature)?;
                buf.put_u8(req.args.len() as u8);
                for arg in &req.args {
                    put_opt_value(&mut buf, arg.as_ref())?;
                }
            }
            Frame::Confirm(confirm) => {
                buf.put_u8(confirm.kind.confirm_signal());
                buf.put_i64(confirm.correlation);
                match &confirm.outcome {
                    WireOutcome::Ok(result) => {
                        buf.put_u8(1);
                        put_opt_value(&mut buf, result.as_ref())?;
                    }
                    WireOutcome::Fault(fault) => {
                        buf.put_u8(0);
                        buf.put_u8(fault.kind.code());
                        put_str(&mut buf, &fault.type_name)?;
                        put_str(&mut buf, &fault.message)?;
                        match &fault.blob {
                            Some(blob) => {
                                buf.put_u8(1);
                                put_blob(&mut buf, blob)?;
                            }
                            None => buf.put_u8(0),
                        }
                    }
                }
            }
        }
        Ok(buf.freeze())
    }

    /// Decode one transport message. The whole message must be consumed;
    /// trailing bytes are a protocol error.
    pub fn decode(mut buf: Bytes) -> Result<Frame> {
        let tag = take_u8(&mut buf)?;
        let frame = match tag {
            signal::PRIMARY_REQUEST | signal::PRIMARY_ONE_WAY => {
                let correlation = take_i64(&mut buf)?;
                let name = take_str(&mut buf)?;
                let target = Target::Service {
                    name,
                    one_way: tag == signal::PRIMARY_ONE_WAY,
                };
                Frame::Request(decode_request_tail(&mut buf, correlation, target)?)
            }
            signal::SECONDARY_REQUEST => {
                let correlation = take_i64(&mut buf)?;
                let owner = take_i64(&mut buf)?;
                let param = take_u32(&mut buf)?;
                let target = Target::Slot { owner, param };
                Frame::Request(decode_request_tail(&mut buf, correlation, target)?)
            }
            signal::PRIMARY_CONFIRM | signal::SECONDARY_CONFIRM => {
                let kind = if tag == signal::PRIMARY_CONFIRM {
                    InvocationKind::Primary
                } else {
                    InvocationKind::Secondary
                };
                let correlation = take_i64(&mut buf)?;
                let outcome = match take_u8(&mut buf)? {
                    1 => WireOutcome::Ok(take_opt_value(&mut buf)?),
                    0 => {
                        let fault_kind = FaultKind::from_code(take_u8(&mut buf)?)?;
                        let type_name = take_str(&mut buf)?;
                        let message = take_str(&mut buf)?;
                        let blob = match take_u8(&mut buf)? {
                            1 => Some(take_blob(&mut buf)?),
                            0 => None,
                            other => {
                                return Err(RpcError::protocol(format!(
                                    "invalid blob presence flag {other}"
                                )));
                            }
                        };
                        WireOutcome::Fault(WireFault {
                            kind: fault_kind,
                            type_name,
                            message,
                            blob,
                        })
                    }
                    other => {
                        return Err(RpcError::protocol(format!("invalid ok flag {other}")));
                    }
                };
                Frame::Confirm(ConfirmFrame {
                    kind,
                    correlation,
                    outcome,
                })
            }
            other => {
                return Err(RpcError::protocol(format!("unknown signal tag {other}")));
            }
        };
        if buf.remaining() != 0 {
            return Err(RpcError::protocol(format!(
                "{} trailing bytes after frame",
                buf.remaining()
            )));
        }
        Ok(frame)
    }
}

fn decode_request_tail(buf: &mut Bytes, correlation: i64, target: Target) -> Result<RequestFrame> {
    let signature = take_str(buf)?;
    let argc = take_u8(buf)? as usize;
    let mut args = Vec::with_capacity(argc);
    for _ in 0..argc {
        args.push(take_opt_value(buf)?);
    }
    Ok(RequestFrame {
        correlation,
        target,
        signature,
        args,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{RemoteHandle, ValueKind};

    fn roundtrip(frame: Frame) -> Frame {
        let encoded = frame.encode().unwrap();
        Frame::decode(encoded).unwrap()
    }

    #[test]
    fn test_primary_request_roundtrip() {
        let frame = Frame::Request(RequestFrame {
            correlation: 7,
            target: Target::Service {
                name: "Calculator".to_string(),
                one_way: false,
            },
            signature: "add(II)".to_string(),
            args: vec![Some(Value::Int(2)), Some(Value::Int(3))],
        });
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn test_one_way_request_signal_and_correlation() {
        let frame = Frame::Request(RequestFrame {
            correlation: ONE_WAY_CORRELATION,
            target: Target::Service {
                name: "Audit".to_string(),
                one_way: true,
            },
            signature: "record(T)".to_string(),
            args: vec![Some(Value::Str("saved".to_string()))],
        });
        let encoded = frame.encode().unwrap();
        assert_eq!(encoded[0], signal::PRIMARY_ONE_WAY);

        match roundtrip(frame) {
            Frame::Request(req) => {
                assert!(req.is_one_way());
                assert_eq!(req.correlation, ONE_WAY_CORRELATION);
            }
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn test_secondary_request_roundtrip() {
        let frame = Frame::Request(RequestFrame {
            correlation: 12,
            target: Target::Slot { owner: 7, param: 2 },
            signature: "readChunk(I)".to_string(),
            args: vec![Some(Value::Int(2))],
        });
        let back = roundtrip(frame.clone());
        assert_eq!(back, frame);
        match back {
            Frame::Request(req) => assert_eq!(req.kind(), InvocationKind::Secondary),
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn test_confirm_roundtrips() {
        let ok = Frame::Confirm(ConfirmFrame::ok(
            InvocationKind::Primary,
            7,
            Some(Value::Int(5)),
        ));
        assert_eq!(roundtrip(ok.clone()), ok);

        let void = Frame::Confirm(ConfirmFrame::ok(InvocationKind::Secondary, 12, None));
        assert_eq!(roundtrip(void.clone()), void);

        let fault = Frame::Confirm(ConfirmFrame::fault(
            InvocationKind::Primary,
            7,
            WireFault {
                kind: FaultKind::Application,
                type_name: "ArithmeticError".to_string(),
                message: "div by zero".to_string(),
                blob: Some(Bytes::from_static(&[0x81])),
            },
        ));
        assert_eq!(roundtrip(fault.clone()), fault);
    }

    #[test]
    fn test_confirm_signal_tags_distinguish_families() {
        let primary = Frame::Confirm(ConfirmFrame::ok(InvocationKind::Primary, 1, None));
        let secondary = Frame::Confirm(ConfirmFrame::ok(InvocationKind::Secondary, 1, None));
        assert_eq!(primary.encode().unwrap()[0], signal::PRIMARY_CONFIRM);
        assert_eq!(secondary.encode().unwrap()[0], signal::SECONDARY_CONFIRM);
    }

    #[test]
    fn test_protocol_fault_roundtrip() {
        let frame = Frame::Confirm(ConfirmFrame::fault(
            InvocationKind::Secondary,
            9,
            WireFault::protocol(FaultKind::DanglingCorrelation, "call 7 already completed"),
        ));
        match roundtrip(frame) {
            Frame::Confirm(confirm) => match confirm.outcome {
                WireOutcome::Fault(fault) => {
                    assert_eq!(fault.kind, FaultKind::DanglingCorrelation);
                    assert!(fault.blob.is_none());
                }
                other => panic!("expected fault, got {other:?}"),
            },
            other => panic!("expected confirm, got {other:?}"),
        }
    }

    #[test]
    fn test_null_args_preserved() {
        let frame = Frame::Request(RequestFrame {
            correlation: 3,
            target: Target::Service {
                name: "Store".to_string(),
                one_way: false,
            },
            signature: "put(TO)".to_string(),
            args: vec![Some(Value::Str("key".to_string())), None],
        });
        match roundtrip(frame) {
            Frame::Request(req) => {
                assert_eq!(req.args.len(), 2);
                assert!(req.args[1].is_none());
            }
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn test_proxied_arg_carries_handle_not_value() {
        let frame = Frame::Request(RequestFrame {
            correlation: 5,
            target: Target::Service {
                name: "Importer".to_string(),
                one_way: false,
            },
            signature: "ingest(R)".to_string(),
            args: vec![Some(Value::Handle {
                kind: ValueKind::Source,
                handle: RemoteHandle::new(5, 0),
            })],
        });
        match roundtrip(frame) {
            Frame::Request(req) => match &req.args[0] {
                Some(Value::Handle { kind, handle }) => {
                    assert_eq!(*kind, ValueKind::Source);
                    assert_eq!(*handle, RemoteHandle::new(5, 0));
                }
                other => panic!("expected handle, got {other:?}"),
            },
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_signal_rejected() {
        let err = Frame::decode(Bytes::from_static(&[99, 0, 0, 0, 0, 0, 0, 0, 1])).unwrap_err();
        assert!(err.to_string().contains("unknown signal tag"));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let frame = Frame::Confirm(ConfirmFrame::ok(InvocationKind::Primary, 1, None));
        let mut encoded = BytesMut::from(&frame.encode().unwrap()[..]);
        encoded.put_u8(0xFF);
        assert!(Frame::decode(encoded.freeze()).is_err());
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let frame = Frame::Request(RequestFrame {
            correlation: 7,
            target: Target::Service {
                name: "Calculator".to_string(),
                one_way: false,
            },
            signature: "add(II)".to_string(),
            args: vec![Some(Value::Int(2)), Some(Value::Int(3))],
        });
        let full = frame.encode().unwrap();
        for cut in 0..full.len() {
            assert!(Frame::decode(full.slice(0..cut)).is_err());
        }
    }
}
