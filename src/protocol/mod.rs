//! Protocol module - the logical layout of one wire message.
//!
//! This module implements the invocation framing:
//! - signal tags telling primary, one-way, secondary and confirmation frames
//!   apart
//! - request frames addressed at a service or a proxied parameter slot
//! - confirmation frames carrying a result or a fault

mod frame;

pub use frame::{
    signal, ConfirmFrame, FaultKind, Frame, InvocationKind, RequestFrame, Target, WireFault,
    WireOutcome, MAX_ARGS, ONE_WAY_CORRELATION,
};
