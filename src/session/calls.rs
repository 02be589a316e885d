//! Pending-call arena.
//!
//! Every two-way request a session sends gets one entry here, keyed by its
//! correlation id. The entry owns both halves of the call's remote surface:
//! the completer the demultiplexer fires when the confirmation arrives, and
//! the proxy slots that incoming secondary invocations address. Completion
//! removes the whole entry, so a call's result and its proxies are released
//! together and later frames for that correlation answer to nobody.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{oneshot, Mutex as AsyncMutex};

use crate::error::{Result, RpcError};
use crate::progress::ProgressFeed;
use crate::protocol::{InvocationKind, WireOutcome};
use crate::tunnel::{ByteSink, ByteSource};

/// What a pending call resolves to: the peer's wire outcome, or a local
/// error injected when the channel dies first.
pub(crate) type CallOutcome = std::result::Result<WireOutcome, RpcError>;

/// Local object a proxied parameter slot resolves to.
///
/// Slots are handed to spawned dispatch tasks, so each target sits behind an
/// async mutex. Contract calls on one slot arrive serialized anyway, because
/// the remote proxy awaits each confirmation before sending the next request.
#[derive(Clone)]
pub(crate) enum SlotTarget {
    Progress(Arc<AsyncMutex<ProgressFeed>>),
    Source(Arc<AsyncMutex<ByteSource>>),
    Sink(Arc<AsyncMutex<ByteSink>>),
}

impl SlotTarget {
    pub(crate) fn progress(feed: ProgressFeed) -> Self {
        SlotTarget::Progress(Arc::new(AsyncMutex::new(feed)))
    }

    pub(crate) fn source(source: ByteSource) -> Self {
        SlotTarget::Source(Arc::new(AsyncMutex::new(source)))
    }

    pub(crate) fn sink(sink: ByteSink) -> Self {
        SlotTarget::Sink(Arc::new(AsyncMutex::new(sink)))
    }
}

impl fmt::Debug for SlotTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SlotTarget::Progress(_) => "SlotTarget::Progress",
            SlotTarget::Source(_) => "SlotTarget::Source",
            SlotTarget::Sink(_) => "SlotTarget::Sink",
        })
    }
}

struct CallEntry {
    kind: InvocationKind,
    completer: oneshot::Sender<CallOutcome>,
    slots: HashMap<u32, SlotTarget>,
}

struct TableState {
    entries: HashMap<i64, CallEntry>,
    closed: bool,
}

/// Correlation allocator plus the table of calls awaiting confirmation.
///
/// Primary and secondary calls draw ids from the same counter and park in the
/// same table; the stored [`InvocationKind`] keeps a confirmation of one
/// family from completing a call of the other.
pub(crate) struct CallTable {
    next: AtomicI64,
    state: Mutex<TableState>,
}

impl CallTable {
    pub(crate) fn new() -> Self {
        Self {
            next: AtomicI64::new(1),
            state: Mutex::new(TableState {
                entries: HashMap::new(),
                closed: false,
            }),
        }
    }

    /// Next unused correlation id. Ids start at 1 (0 marks one-way requests)
    /// and are never reused within a session.
    pub(crate) fn allocate(&self) -> i64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Park a call until its confirmation arrives.
    ///
    /// Fails with [`RpcError::TransportClosed`] once the table has been
    /// force-completed, so no call can slip in after the channel died.
    pub(crate) fn register(
        &self,
        correlation: i64,
        kind: InvocationKind,
        completer: oneshot::Sender<CallOutcome>,
        slots: HashMap<u32, SlotTarget>,
    ) -> Result<()> {
        let mut state = self.lock();
        if state.closed {
            return Err(RpcError::TransportClosed);
        }
        let prev = state.entries.insert(
            correlation,
            CallEntry {
                kind,
                completer,
                slots,
            },
        );
        debug_assert!(prev.is_none(), "correlation {correlation} registered twice");
        Ok(())
    }

    /// Drop a parked call whose request never made it onto the wire.
    pub(crate) fn abandon(&self, correlation: i64) {
        self.lock().entries.remove(&correlation);
    }

    /// Fire a call's completer with the outcome carried by a confirmation,
    /// releasing the entry and its proxy slots together.
    ///
    /// Returns `false` when the correlation is unknown (already completed, or
    /// never registered) or the confirmation's family does not match the
    /// request's; nothing is released in that case.
    pub(crate) fn complete(
        &self,
        correlation: i64,
        kind: InvocationKind,
        outcome: CallOutcome,
    ) -> bool {
        let entry = {
            let mut state = self.lock();
            match state.entries.get(&correlation) {
                Some(entry) if entry.kind == kind => state.entries.remove(&correlation),
                _ => None,
            }
        };
        match entry {
            Some(entry) => {
                // The receiver may already be gone; the call is released
                // either way.
                let _ = entry.completer.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Resolve the proxy slot a secondary invocation addresses.
    pub(crate) fn lookup_slot(&self, owner: i64, param: u32) -> Result<SlotTarget> {
        self.lock()
            .entries
            .get(&owner)
            .and_then(|entry| entry.slots.get(&param))
            .cloned()
            .ok_or(RpcError::DanglingCorrelation {
                correlation: owner,
                param,
            })
    }

    /// Force-complete every pending call with [`RpcError::TransportClosed`]
    /// and refuse registrations from now on.
    pub(crate) fn fail_all(&self) {
        let drained: Vec<CallEntry> = {
            let mut state = self.lock();
            state.closed = true;
            state.entries.drain().map(|(_, entry)| entry).collect()
        };
        for entry in drained {
            let _ = entry.completer.send(Err(RpcError::TransportClosed));
        }
    }

    /// Number of calls still awaiting confirmation.
    pub(crate) fn pending(&self) -> usize {
        self.lock().entries.len()
    }

    /// True once the table has been force-completed.
    pub(crate) fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> MutexGuard<'_, TableState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Callee-side view of one in-flight call, shared with the remote proxies
/// materialized from its arguments.
///
/// The dispatcher closes the scope right before the confirmation is queued;
/// a proxy used after that point fails with [`RpcError::StaleProxy`] instead
/// of addressing a correlation the caller has already released.
#[derive(Debug)]
pub(crate) struct CallScope {
    correlation: i64,
    closed: AtomicBool,
}

impl CallScope {
    pub(crate) fn new(correlation: i64) -> Arc<Self> {
        Arc::new(Self {
            correlation,
            closed: AtomicBool::new(false),
        })
    }

    #[inline]
    pub(crate) fn correlation(&self) -> i64 {
        self.correlation
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Checked by every remote proxy before it sends.
    pub(crate) fn ensure_open(&self, param: u32) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RpcError::StaleProxy {
                correlation: self.correlation,
                param,
            });
        }
        Ok(())
    }
}
