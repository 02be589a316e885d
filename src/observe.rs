//! Call observation hooks.
//!
//! A session accepts one [`CallObserver`] and reports every invocation it
//! sends or dispatches. Observers are for logging and metrics only: they run
//! on the calling task, their panics are caught and logged, and nothing they
//! do can change a call's outcome.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use tracing::warn;

use crate::protocol::{InvocationKind, Target};

/// Which way a call is traveling relative to the observing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Sent by this session.
    Outbound,
    /// Received and dispatched by this session.
    Inbound,
}

/// Identity of one invocation as reported to a [`CallObserver`].
#[derive(Debug, Clone)]
pub struct CallInfo {
    direction: Direction,
    kind: InvocationKind,
    correlation: i64,
    target: Target,
    signature: String,
}

impl CallInfo {
    pub(crate) fn new(
        direction: Direction,
        correlation: i64,
        target: Target,
        signature: impl Into<String>,
    ) -> Self {
        let kind = match target {
            Target::Service { .. } => InvocationKind::Primary,
            Target::Slot { .. } => InvocationKind::Secondary,
        };
        Self {
            direction,
            kind,
            correlation,
            target,
            signature: signature.into(),
        }
    }

    #[inline]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    #[inline]
    pub fn kind(&self) -> InvocationKind {
        self.kind
    }

    /// True for fire-and-forget requests, which never report a finish event
    /// with a meaningful round-trip time.
    #[inline]
    pub fn is_one_way(&self) -> bool {
        matches!(self.target, Target::Service { one_way: true, .. })
    }

    #[inline]
    pub fn correlation(&self) -> i64 {
        self.correlation
    }

    /// Service or proxy-slot address of the call.
    #[inline]
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Service name for primary invocations, `None` for secondary ones.
    pub fn service(&self) -> Option<&str> {
        match &self.target {
            Target::Service { name, .. } => Some(name),
            Target::Slot { .. } => None,
        }
    }

    #[inline]
    pub fn signature(&self) -> &str {
        &self.signature
    }
}

/// Receives call lifecycle events from a session.
///
/// Both methods default to doing nothing, so implementations can pick the
/// events they care about.
pub trait CallObserver: Send + Sync {
    /// A request is about to be written (outbound) or a dispatch is about to
    /// run (inbound).
    fn call_started(&self, info: &CallInfo) {
        let _ = info;
    }

    /// The call completed. `ok` is false for faults and transport failures;
    /// `elapsed` measures from the matching start event.
    fn call_finished(&self, info: &CallInfo, ok: bool, elapsed: Duration) {
        let _ = (info, ok, elapsed);
    }
}

/// Observer that ignores every event; the default.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl CallObserver for NoopObserver {}

pub(crate) fn notify_started(observer: &dyn CallObserver, info: &CallInfo) {
    if catch_unwind(AssertUnwindSafe(|| observer.call_started(info))).is_err() {
        warn!(
            signature = %info.signature(),
            "call observer panicked in call_started"
        );
    }
}

pub(crate) fn notify_finished(
    observer: &dyn CallObserver,
    info: &CallInfo,
    ok: bool,
    elapsed: Duration,
) {
    if catch_unwind(AssertUnwindSafe(|| observer.call_finished(info, ok, elapsed))).is_err() {
        warn!(
            signature = %info.signature(),
            "call observer panicked in call_finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn info() -> CallInfo {
        CallInfo::new(
            Direction::Outbound,
            7,
            Target::Service {
                name: "Calculator".to_string(),
                one_way: false,
            },
            "add(II)",
        )
    }

    #[derive(Default)]
    struct Counting {
        started: AtomicUsize,
        finished: AtomicUsize,
    }

    impl CallObserver for Counting {
        fn call_started(&self, _info: &CallInfo) {
            self.started.fetch_add(1, Ordering::Relaxed);
        }

        fn call_finished(&self, _info: &CallInfo, _ok: bool, _elapsed: Duration) {
            self.finished.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_events_reach_observer() {
        let observer = Counting::default();
        let info = info();
        notify_started(&observer, &info);
        notify_finished(&observer, &info, true, Duration::from_millis(3));
        assert_eq!(observer.started.load(Ordering::Relaxed), 1);
        assert_eq!(observer.finished.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_observer_panic_is_contained() {
        struct Exploding;
        impl CallObserver for Exploding {
            fn call_started(&self, _info: &CallInfo) {
                panic!("observer bug");
            }
        }

        notify_started(&Exploding, &info());
    }

    #[test]
    fn test_info_accessors() {
        let info = info();
        assert_eq!(info.direction(), Direction::Outbound);
        assert_eq!(info.kind(), InvocationKind::Primary);
        assert_eq!(info.correlation(), 7);
        assert_eq!(info.service(), Some("Calculator"));
        assert_eq!(info.signature(), "add(II)");
        assert!(!info.is_one_way());

        let slot = CallInfo::new(
            Direction::Inbound,
            12,
            Target::Slot { owner: 7, param: 0 },
            "readChunk(I)",
        );
        assert_eq!(slot.kind(), InvocationKind::Secondary);
        assert_eq!(slot.service(), None);
    }
}
