//! Session endpoints over one bidirectional channel.
//!
//! A session owns both directions of a single ordered, reliable message
//! channel:
//!
//! 1. Outbound frames funnel through a bounded queue into a dedicated writer
//!    task, so concurrent calls never interleave bytes on the wire.
//! 2. A reader task decodes each inbound message and routes it. Confirmations
//!    complete the pending call they answer; requests are dispatched against
//!    the service registry or, for secondary invocations, against the slot
//!    table of a call this side still has in flight.
//! 3. When the channel dies, every pending call is force-completed with
//!    [`RpcError::TransportClosed`] instead of hanging.
//!
//! Sessions are symmetric. Both peers can expose services, invoke the other
//! side, and answer secondary invocations for proxied parameters of their own
//! outbound calls.
//!
//! # Example
//!
//! ```
//! use termwire::codec::ValueKind;
//! use termwire::service::{Arg, ParamSpec, ReturnSpec, ServiceDescriptor, ServiceVtable};
//! use termwire::session::RpcSession;
//! use termwire::transport::memory_channel;
//!
//! # async fn demo() -> termwire::error::Result<()> {
//! let descriptor = ServiceDescriptor::builder("Calculator")
//!     .two_way(
//!         "add",
//!         [ParamSpec::int(), ParamSpec::int()],
//!         ReturnSpec::Value(ValueKind::Int),
//!     )
//!     .build()?;
//! let vtable = ServiceVtable::builder(descriptor.clone())
//!     .handler("add", |args, _ctx| async move {
//!         Ok(Arg::Int(args.int_at(0)? + args.int_at(1)?))
//!     })
//!     .build()?;
//!
//! let ((client_tx, client_rx), (server_tx, server_rx)) = memory_channel(16);
//! let _server = RpcSession::builder()
//!     .label("server")
//!     .expose(vtable)?
//!     .connect(server_tx, server_rx);
//! let client = RpcSession::builder().label("client").connect(client_tx, client_rx);
//!
//! let calculator = client.stub(descriptor);
//! let sum = calculator.call("add", vec![Arg::Int(2), Arg::Int(3)]).await?;
//! assert_eq!(sum.as_int(), Some(5));
//! # Ok(())
//! # }
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tracing::{debug, error, trace, warn};

use crate::codec::{RemoteHandle, Value};
use crate::error::{Fault, RemoteFault, Result, RpcError};
use crate::observe::{
    notify_finished, notify_started, CallInfo, CallObserver, Direction, NoopObserver,
};
use crate::progress::ProgressFeed;
use crate::protocol::{
    ConfirmFrame, FaultKind, Frame, InvocationKind, RequestFrame, Target, WireFault, WireOutcome,
    ONE_WAY_CORRELATION,
};
use crate::resolve::{ObjectValue, TypeRegistry, WireEnum};
use crate::service::{
    Arg, Args, CallContext, MethodDescriptor, ParamSpec, ReturnSpec, ServiceDescriptor,
    ServiceRegistry, ServiceVtable,
};
use crate::stub::RemoteService;
use crate::transport::{ChannelRx, ChannelTx, DEFAULT_MAX_FRAME};
use crate::tunnel::remote::materialize_handle;
use crate::tunnel::{ByteSink, ByteSource};

pub(crate) mod calls;

use calls::{CallScope, CallTable, SlotTarget};

/// Default outbound frame queue capacity.
pub const DEFAULT_OUTBOUND_QUEUE: usize = 64;

/// Default limit on concurrently running primary dispatches.
pub const DEFAULT_DISPATCH_LIMIT: usize = 32;

/// Tunables for one session endpoint.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Label used in log events, usually naming the peer.
    pub label: String,
    /// Capacity of the outbound frame queue feeding the writer task.
    pub outbound_queue: usize,
    /// Maximum number of primary invocations running at once. Secondary
    /// invocations bypass the limit: they are already bounded by the calls
    /// that own their slots, and throttling them could deadlock a handler
    /// waiting on its own proxied stream.
    pub dispatch_limit: usize,
    /// Maximum encoded size of a single inbound or outbound message.
    pub max_frame: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            label: "peer".to_string(),
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
            dispatch_limit: DEFAULT_DISPATCH_LIMIT,
            max_frame: DEFAULT_MAX_FRAME,
        }
    }
}

/// Fluent builder assembling one session endpoint.
pub struct SessionBuilder {
    config: SessionConfig,
    services: ServiceRegistry,
    types: TypeRegistry,
    observer: Arc<dyn CallObserver>,
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self {
            config: SessionConfig::default(),
            services: ServiceRegistry::new(),
            types: TypeRegistry::new(),
            observer: Arc::new(NoopObserver),
        }
    }

    /// Replaces the whole configuration at once.
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the label used in log events.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.config.label = label.into();
        self
    }

    /// Sets the outbound frame queue capacity.
    pub fn outbound_queue(mut self, capacity: usize) -> Self {
        self.config.outbound_queue = capacity;
        self
    }

    /// Sets the concurrent primary dispatch limit.
    pub fn dispatch_limit(mut self, limit: usize) -> Self {
        self.config.dispatch_limit = limit;
        self
    }

    /// Sets the maximum encoded message size.
    pub fn max_frame(mut self, bytes: usize) -> Self {
        self.config.max_frame = bytes;
        self
    }

    /// Exposes a service to the peer.
    ///
    /// Fails when a service with the same name is already exposed.
    pub fn expose(mut self, vtable: ServiceVtable) -> Result<Self> {
        self.services.expose(vtable)?;
        Ok(self)
    }

    /// Registers an enum type for marshaling in both directions.
    pub fn register_enum<T: WireEnum>(mut self) -> Self {
        self.types.register_enum::<T>();
        self
    }

    /// Registers a structured object type under its wire type name.
    pub fn register_object<T>(mut self, type_name: &str) -> Self
    where
        T: Serialize + DeserializeOwned + Any + Send + Sync,
    {
        self.types.register_object::<T>(type_name);
        self
    }

    /// Installs a call observer. Defaults to a no-op.
    pub fn observer(mut self, observer: Arc<dyn CallObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Binds the endpoint to a transport and starts its writer and reader
    /// tasks. Must be called from within a Tokio runtime.
    pub fn connect<T, R>(self, transport_tx: T, transport_rx: R) -> RpcSession
    where
        T: ChannelTx,
        R: ChannelRx,
    {
        let SessionBuilder {
            config,
            services,
            types,
            observer,
        } = self;
        let (outbound, outbound_rx) = mpsc::channel(config.outbound_queue.max(1));
        let (closing, _) = watch::channel(false);
        let core = Arc::new(SessionCore {
            label: config.label,
            max_frame: config.max_frame,
            services,
            types,
            observer,
            calls: CallTable::new(),
            dispatch: Arc::new(Semaphore::new(config.dispatch_limit.max(1))),
            outbound,
            closing,
        });
        tokio::spawn(write_loop(transport_tx, outbound_rx, Arc::clone(&core)));
        tokio::spawn(read_loop(transport_rx, Arc::clone(&core)));
        RpcSession { core }
    }
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// One endpoint of a bidirectional invocation channel.
///
/// Cheap to clone; all clones share the same underlying connection. Dropping
/// the last clone does not tear the connection down, the session keeps
/// serving until the channel closes or [`RpcSession::close`] is called.
#[derive(Clone)]
pub struct RpcSession {
    core: Arc<SessionCore>,
}

impl RpcSession {
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    /// Creates a typed handle for invoking a service on the peer.
    pub fn stub(&self, descriptor: Arc<ServiceDescriptor>) -> RemoteService {
        RemoteService::new(self.clone(), descriptor)
    }

    pub fn label(&self) -> &str {
        &self.core.label
    }

    /// Number of outbound calls still awaiting confirmation.
    pub fn pending_calls(&self) -> usize {
        self.core.calls.pending()
    }

    pub fn is_closed(&self) -> bool {
        self.core.calls.is_closed()
    }

    /// Closes the session: fails every pending call with
    /// [`RpcError::TransportClosed`] and stops both channel tasks.
    pub fn close(&self) {
        self.core.shutdown();
    }

    /// Resolves once the session has closed, whether locally or because the
    /// channel died.
    pub async fn closed(&self) {
        let mut closing = self.core.closing.subscribe();
        let _ = closing.wait_for(|closed| *closed).await;
    }

    pub(crate) async fn call_service(
        &self,
        service: &Arc<ServiceDescriptor>,
        method: &Arc<MethodDescriptor>,
        args: Vec<Arg>,
    ) -> Result<Arg> {
        self.core.call_service(service, method, args).await
    }

    pub(crate) async fn notify_service(
        &self,
        service: &Arc<ServiceDescriptor>,
        method: &Arc<MethodDescriptor>,
        args: Vec<Arg>,
    ) -> Result<()> {
        self.core.notify_service(service, method, args).await
    }

    pub(crate) fn same_endpoint(&self, other: &RpcSession) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }

    pub(crate) fn endpoint_id(&self) -> usize {
        Arc::as_ptr(&self.core) as usize
    }
}

impl fmt::Debug for RpcSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcSession")
            .field("label", &self.core.label)
            .field("pending", &self.core.calls.pending())
            .field("closed", &self.core.calls.is_closed())
            .finish()
    }
}

/// Shared state behind every [`RpcSession`] clone and both channel tasks.
pub(crate) struct SessionCore {
    label: String,
    max_frame: usize,
    services: ServiceRegistry,
    types: TypeRegistry,
    observer: Arc<dyn CallObserver>,
    calls: CallTable,
    dispatch: Arc<Semaphore>,
    outbound: mpsc::Sender<Bytes>,
    closing: watch::Sender<bool>,
}

/// Where a wire fault is being raised, for call-site context in errors.
enum CallSite<'a> {
    Service { service: &'a str, method: &'a str },
    Slot { handle: RemoteHandle, signature: &'a str },
}

impl SessionCore {
    /// Stops both channel tasks and force-completes every pending call.
    /// Idempotent.
    fn shutdown(&self) {
        self.calls.fail_all();
        self.dispatch.close();
        let _ = self.closing.send(true);
    }

    // ---- outbound path -------------------------------------------------

    async fn call_service(
        self: &Arc<Self>,
        service: &Arc<ServiceDescriptor>,
        method: &Arc<MethodDescriptor>,
        args: Vec<Arg>,
    ) -> Result<Arg> {
        let correlation = self.calls.allocate();
        let (wire_args, slots) = self.lower_args(correlation, method, args)?;
        let target = Target::Service {
            name: service.name().to_string(),
            one_way: false,
        };
        let info = CallInfo::new(
            Direction::Outbound,
            correlation,
            target.clone(),
            method.signature(),
        );
        let frame = Frame::Request(RequestFrame {
            correlation,
            target,
            signature: method.signature().to_string(),
            args: wire_args,
        });
        let encoded = self.encode_frame(&frame)?;

        notify_started(self.observer.as_ref(), &info);
        let started = Instant::now();
        let outcome = self
            .round_trip(correlation, InvocationKind::Primary, encoded, slots)
            .await;
        let result = match outcome {
            Ok(WireOutcome::Ok(value)) => self.lift_result(method, value),
            Ok(WireOutcome::Fault(fault)) => Err(self.raise(
                CallSite::Service {
                    service: service.name(),
                    method: method.signature(),
                },
                fault,
            )),
            Err(err) => Err(err),
        };
        notify_finished(self.observer.as_ref(), &info, result.is_ok(), started.elapsed());
        result
    }

    async fn notify_service(
        &self,
        service: &Arc<ServiceDescriptor>,
        method: &Arc<MethodDescriptor>,
        args: Vec<Arg>,
    ) -> Result<()> {
        let (wire_args, slots) = self.lower_args(ONE_WAY_CORRELATION, method, args)?;
        debug_assert!(slots.is_empty(), "one-way methods cannot declare proxied params");
        let target = Target::Service {
            name: service.name().to_string(),
            one_way: true,
        };
        let info = CallInfo::new(
            Direction::Outbound,
            ONE_WAY_CORRELATION,
            target.clone(),
            method.signature(),
        );
        let frame = Frame::Request(RequestFrame {
            correlation: ONE_WAY_CORRELATION,
            target,
            signature: method.signature().to_string(),
            args: wire_args,
        });
        let encoded = self.encode_frame(&frame)?;

        notify_started(self.observer.as_ref(), &info);
        let started = Instant::now();
        let sent = self
            .outbound
            .send(encoded)
            .await
            .map_err(|_| RpcError::TransportClosed);
        notify_finished(self.observer.as_ref(), &info, sent.is_ok(), started.elapsed());
        sent
    }

    /// Invokes one method of a proxied parameter slot on the peer that sent
    /// it. Used by the remote stream and progress adapters.
    pub(crate) async fn secondary_call(
        &self,
        handle: RemoteHandle,
        signature: &str,
        args: Vec<Option<Value>>,
    ) -> Result<Option<Value>> {
        let correlation = self.calls.allocate();
        let target = Target::Slot {
            owner: handle.correlation,
            param: handle.param,
        };
        let info = CallInfo::new(Direction::Outbound, correlation, target.clone(), signature);
        let frame = Frame::Request(RequestFrame {
            correlation,
            target,
            signature: signature.to_string(),
            args,
        });
        let encoded = self.encode_frame(&frame)?;

        notify_started(self.observer.as_ref(), &info);
        let started = Instant::now();
        let outcome = self
            .round_trip(correlation, InvocationKind::Secondary, encoded, HashMap::new())
            .await;
        let result = match outcome {
            Ok(WireOutcome::Ok(value)) => Ok(value),
            Ok(WireOutcome::Fault(fault)) => {
                Err(self.raise(CallSite::Slot { handle, signature }, fault))
            }
            Err(err) => Err(err),
        };
        notify_finished(self.observer.as_ref(), &info, result.is_ok(), started.elapsed());
        result
    }

    /// Registers the call, queues the encoded request and awaits its
    /// confirmation.
    async fn round_trip(
        &self,
        correlation: i64,
        kind: InvocationKind,
        encoded: Bytes,
        slots: HashMap<u32, SlotTarget>,
    ) -> Result<WireOutcome> {
        let (completer, confirmation) = oneshot::channel();
        self.calls.register(correlation, kind, completer, slots)?;
        if self.outbound.send(encoded).await.is_err() {
            self.calls.abandon(correlation);
            return Err(RpcError::TransportClosed);
        }
        match confirmation.await {
            Ok(outcome) => outcome,
            Err(_) => Err(RpcError::TransportClosed),
        }
    }

    /// Lowers call arguments to wire values, collecting proxied parameters
    /// into slot targets keyed by parameter index.
    fn lower_args(
        &self,
        correlation: i64,
        method: &MethodDescriptor,
        args: Vec<Arg>,
    ) -> Result<(Vec<Option<Value>>, HashMap<u32, SlotTarget>)> {
        if args.len() != method.params().len() {
            return Err(RpcError::contract(format!(
                "method {} takes {} arguments, got {}",
                method.signature(),
                method.params().len(),
                args.len()
            )));
        }
        let mut wire = Vec::with_capacity(args.len());
        let mut slots = HashMap::new();
        for (index, (arg, spec)) in args.into_iter().zip(method.params()).enumerate() {
            let kind = match arg.kind() {
                Some(kind) => kind,
                None => {
                    wire.push(None);
                    continue;
                }
            };
            if kind != spec.kind() {
                return Err(RpcError::UnsupportedValue {
                    param: index,
                    detail: format!("{kind:?} where the method declares {:?}", spec.kind()),
                });
            }
            if kind.is_proxied() {
                spec.ensure_canonical(index)?;
            }
            let slot = match arg {
                Arg::Progress(feed) => Some(SlotTarget::progress(feed)),
                Arg::Source(source) => Some(SlotTarget::source(source)),
                Arg::Sink(sink) => Some(SlotTarget::sink(sink)),
                other => {
                    wire.push(other.to_wire(&self.types)?);
                    None
                }
            };
            if let Some(slot) = slot {
                let handle = RemoteHandle::new(correlation, index as u32);
                slots.insert(handle.param, slot);
                wire.push(Some(Value::handle(kind, handle)));
            }
        }
        Ok((wire, slots))
    }

    /// Checks a confirmed result against the declared return and lifts it.
    fn lift_result(&self, method: &MethodDescriptor, value: Option<Value>) -> Result<Arg> {
        match (method.returns(), value) {
            (_, None) => Ok(Arg::Null),
            (ReturnSpec::Void, Some(value)) => Err(RpcError::protocol(format!(
                "void method {} confirmed a {:?} result",
                method.signature(),
                value.kind()
            ))),
            (ReturnSpec::Value(declared), Some(value)) => {
                if value.kind() != declared {
                    return Err(RpcError::protocol(format!(
                        "method {} confirmed {:?}, declared {declared:?}",
                        method.signature(),
                        value.kind()
                    )));
                }
                Arg::from_wire(value, &self.types)
            }
        }
    }

    /// Turns a wire fault back into the error the caller observes.
    fn raise(&self, site: CallSite<'_>, fault: WireFault) -> RpcError {
        match fault.kind {
            FaultKind::Application => {
                let payload = self.decode_fault_payload(&fault);
                let (service, method) = match site {
                    CallSite::Service { service, method } => {
                        (service.to_string(), method.to_string())
                    }
                    CallSite::Slot { handle, signature } => (
                        slot_label(handle.correlation, handle.param),
                        signature.to_string(),
                    ),
                };
                RpcError::Remote(RemoteFault {
                    service,
                    method,
                    type_name: fault.type_name,
                    message: fault.message,
                    payload,
                })
            }
            FaultKind::TypeResolution => RpcError::TypeResolution {
                type_name: fault.type_name,
            },
            FaultKind::MethodResolution => match site {
                CallSite::Service { service, method } => RpcError::MethodResolution {
                    service: service.to_string(),
                    signature: method.to_string(),
                },
                CallSite::Slot { handle, signature } => RpcError::MethodResolution {
                    service: slot_label(handle.correlation, handle.param),
                    signature: signature.to_string(),
                },
            },
            FaultKind::DanglingCorrelation => match site {
                CallSite::Slot { handle, .. } => RpcError::DanglingCorrelation {
                    correlation: handle.correlation,
                    param: handle.param,
                },
                CallSite::Service { .. } => RpcError::protocol(fault.message),
            },
            FaultKind::Internal => {
                RpcError::protocol(format!("remote internal fault: {}", fault.message))
            }
        }
    }

    /// Decodes an application fault payload when its type is registered
    /// locally. Degrades to a message-only fault otherwise.
    fn decode_fault_payload(&self, fault: &WireFault) -> Option<ObjectValue> {
        let blob = fault.blob.as_ref()?;
        if !self.types.knows_object(&fault.type_name) {
            return None;
        }
        match self.types.unmarshal(&fault.type_name, blob) {
            Ok(payload) => Some(payload),
            Err(err) => {
                debug!(
                    peer = %self.label,
                    type_name = %fault.type_name,
                    error = %err,
                    "fault payload not decodable, degrading to message"
                );
                None
            }
        }
    }

    // ---- inbound path --------------------------------------------------

    /// Routes one decoded inbound frame. Runs on the reader task and must
    /// never block: requests are handed to their own task immediately.
    fn accept(self: &Arc<Self>, frame: Frame) {
        match frame {
            Frame::Confirm(confirm) => {
                let done = self
                    .calls
                    .complete(confirm.correlation, confirm.kind, Ok(confirm.outcome));
                if !done {
                    warn!(
                        peer = %self.label,
                        correlation = confirm.correlation,
                        "confirmation for unknown or completed call dropped"
                    );
                }
            }
            Frame::Request(request) => {
                let core = Arc::clone(self);
                tokio::spawn(async move {
                    core.dispatch(request).await;
                });
            }
        }
    }

    async fn dispatch(self: Arc<Self>, request: RequestFrame) {
        let info = CallInfo::new(
            Direction::Inbound,
            request.correlation,
            request.target.clone(),
            request.signature.clone(),
        );
        notify_started(self.observer.as_ref(), &info);
        let started = Instant::now();
        let ok = match request.target.clone() {
            Target::Service { name, one_way } => {
                self.dispatch_primary(request, &name, one_way).await
            }
            Target::Slot { owner, param } => self.dispatch_secondary(request, owner, param).await,
        };
        notify_finished(self.observer.as_ref(), &info, ok, started.elapsed());
    }

    async fn dispatch_primary(
        self: &Arc<Self>,
        request: RequestFrame,
        service: &str,
        one_way: bool,
    ) -> bool {
        let _permit = match Arc::clone(&self.dispatch).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return false,
        };
        let correlation = request.correlation;
        let signature = request.signature.clone();
        let scope = CallScope::new(correlation);
        let served = self.serve_primary(request, service, &scope).await;
        scope.close();

        if one_way {
            return match served {
                Ok(WireOutcome::Ok(_)) => true,
                Ok(WireOutcome::Fault(fault)) => {
                    warn!(
                        peer = %self.label,
                        service,
                        signature = %signature,
                        fault_type = %fault.type_name,
                        fault = %fault.message,
                        "one-way invocation raised a fault"
                    );
                    false
                }
                Err(err) => {
                    warn!(
                        peer = %self.label,
                        service,
                        signature = %signature,
                        error = %err,
                        "one-way invocation failed"
                    );
                    false
                }
            };
        }

        let outcome = match served {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(
                    peer = %self.label,
                    service,
                    signature = %signature,
                    error = %err,
                    "invocation failed before the handler completed"
                );
                WireOutcome::Fault(self.error_to_fault(err))
            }
        };
        let ok = matches!(outcome, WireOutcome::Ok(_));
        let confirm = Frame::Confirm(ConfirmFrame {
            kind: InvocationKind::Primary,
            correlation,
            outcome,
        });
        if let Err(err) = self.send_frame(&confirm).await {
            debug!(
                peer = %self.label,
                correlation,
                error = %err,
                "confirmation not sent, session closing"
            );
            return false;
        }
        ok
    }

    /// Resolves and runs a handler. `Ok` covers both handler success and a
    /// handler-raised fault; `Err` means the request never reached a handler.
    async fn serve_primary(
        self: &Arc<Self>,
        request: RequestFrame,
        service: &str,
        scope: &Arc<CallScope>,
    ) -> Result<WireOutcome> {
        let (vtable, method) = self.services.resolve(service, &request.signature)?;
        if method.is_one_way() != request.is_one_way() {
            return Err(RpcError::MethodResolution {
                service: service.to_string(),
                signature: request.signature.clone(),
            });
        }
        let correlation = request.correlation;
        let args = self.materialize(request.args, method.params(), scope)?;
        let handler = match vtable.handler(method.signature()) {
            Some(handler) => handler,
            None => {
                return Err(RpcError::contract(format!(
                    "no handler bound for {service}.{}",
                    method.signature()
                )));
            }
        };
        let ctx = CallContext::new(
            RpcSession {
                core: Arc::clone(self),
            },
            correlation,
            Arc::clone(vtable.descriptor()),
            Arc::clone(&method),
        );
        match handler.invoke(args, ctx).await {
            Ok(result) => Ok(WireOutcome::Ok(self.lower_result(&method, result)?)),
            Err(fault) => Ok(WireOutcome::Fault(self.lower_fault(fault))),
        }
    }

    /// Lifts wire arguments into handler arguments, materializing proxied
    /// slots against the serving scope.
    fn materialize(
        self: &Arc<Self>,
        args: Vec<Option<Value>>,
        params: &[ParamSpec],
        scope: &Arc<CallScope>,
    ) -> Result<Args> {
        if args.len() != params.len() {
            return Err(RpcError::protocol(format!(
                "request carries {} arguments, the signature declares {}",
                args.len(),
                params.len()
            )));
        }
        let owner = scope.correlation();
        let mut lifted = Vec::with_capacity(args.len());
        for (index, (wire, spec)) in args.into_iter().zip(params).enumerate() {
            let value = match wire {
                Some(value) => value,
                None => {
                    lifted.push(Arg::Null);
                    continue;
                }
            };
            if value.kind() != spec.kind() {
                return Err(RpcError::protocol(format!(
                    "argument {index} carries {:?}, the signature declares {:?}",
                    value.kind(),
                    spec.kind()
                )));
            }
            let arg = match value {
                Value::Handle { kind, handle } => {
                    if handle.correlation != owner {
                        return Err(RpcError::protocol(format!(
                            "argument {index} proxies call {}, expected {owner}",
                            handle.correlation
                        )));
                    }
                    materialize_handle(self, scope, kind, handle)?
                }
                other => Arg::from_wire(other, &self.types)?,
            };
            lifted.push(arg);
        }
        Ok(Args::new(lifted))
    }

    /// Checks a handler result against the declared return and lowers it.
    fn lower_result(&self, method: &MethodDescriptor, result: Arg) -> Result<Option<Value>> {
        match method.returns() {
            ReturnSpec::Void => {
                if result.is_null() {
                    Ok(None)
                } else {
                    Err(RpcError::contract(format!(
                        "handler for {} returned a value, the method is void",
                        method.signature()
                    )))
                }
            }
            ReturnSpec::Value(declared) => match result.kind() {
                None => Ok(None),
                Some(actual) if actual == declared => result.to_wire(&self.types),
                Some(actual) => Err(RpcError::contract(format!(
                    "handler for {} returned {actual:?}, declared {declared:?}",
                    method.signature()
                ))),
            },
        }
    }

    fn lower_fault(&self, fault: Fault) -> WireFault {
        let mut wire = WireFault::application(fault.type_name(), fault.message());
        if let Some(payload) = fault.payload() {
            match self.types.marshal(payload) {
                Ok(blob) => wire.blob = Some(blob),
                Err(err) => {
                    warn!(
                        peer = %self.label,
                        type_name = %fault.type_name(),
                        error = %err,
                        "fault payload not serializable, sending message only"
                    );
                }
            }
        }
        wire
    }

    /// Maps a serving-side error onto the fault the peer will observe.
    fn error_to_fault(&self, err: RpcError) -> WireFault {
        let message = err.to_string();
        match err {
            RpcError::TypeResolution { type_name } => WireFault {
                kind: FaultKind::TypeResolution,
                type_name,
                message,
                blob: None,
            },
            RpcError::MethodResolution { .. } => {
                WireFault::protocol(FaultKind::MethodResolution, message)
            }
            RpcError::DanglingCorrelation { .. } => {
                WireFault::protocol(FaultKind::DanglingCorrelation, message)
            }
            RpcError::Io(_) => WireFault::application("IoError", message),
            RpcError::Remote(remote) => {
                let blob = remote
                    .payload
                    .as_ref()
                    .and_then(|payload| self.types.marshal(payload).ok());
                WireFault {
                    kind: FaultKind::Application,
                    type_name: remote.type_name,
                    message: remote.message,
                    blob,
                }
            }
            _ => WireFault::protocol(FaultKind::Internal, message),
        }
    }

    async fn dispatch_secondary(&self, request: RequestFrame, owner: i64, param: u32) -> bool {
        let correlation = request.correlation;
        let served = self.serve_secondary(&request, owner, param).await;
        let outcome = match served {
            Ok(result) => WireOutcome::Ok(result),
            Err(err) => {
                if matches!(err, RpcError::DanglingCorrelation { .. }) {
                    debug!(
                        peer = %self.label,
                        owner,
                        param,
                        signature = %request.signature,
                        "secondary invocation addressed a released call"
                    );
                } else {
                    warn!(
                        peer = %self.label,
                        owner,
                        param,
                        signature = %request.signature,
                        error = %err,
                        "secondary invocation failed"
                    );
                }
                WireOutcome::Fault(self.error_to_fault(err))
            }
        };
        let ok = matches!(outcome, WireOutcome::Ok(_));
        let confirm = Frame::Confirm(ConfirmFrame {
            kind: InvocationKind::Secondary,
            correlation,
            outcome,
        });
        if let Err(err) = self.send_frame(&confirm).await {
            debug!(
                peer = %self.label,
                correlation,
                error = %err,
                "confirmation not sent, session closing"
            );
            return false;
        }
        ok
    }

    async fn serve_secondary(
        &self,
        request: &RequestFrame,
        owner: i64,
        param: u32,
    ) -> Result<Option<Value>> {
        let target = self.calls.lookup_slot(owner, param)?;
        let call = SlotCall {
            owner,
            param,
            signature: &request.signature,
            args: &request.args,
        };
        match target {
            SlotTarget::Source(source) => run_source(&mut *source.lock().await, &call).await,
            SlotTarget::Sink(sink) => run_sink(&mut *sink.lock().await, &call).await,
            SlotTarget::Progress(feed) => run_progress(&mut *feed.lock().await, &call).await,
        }
    }

    // ---- framing -------------------------------------------------------

    fn encode_frame(&self, frame: &Frame) -> Result<Bytes> {
        let encoded = frame.encode()?;
        if encoded.len() > self.max_frame {
            return Err(RpcError::protocol(format!(
                "encoded frame of {} bytes exceeds the {} byte limit",
                encoded.len(),
                self.max_frame
            )));
        }
        Ok(encoded)
    }

    async fn send_frame(&self, frame: &Frame) -> Result<()> {
        let encoded = self.encode_frame(frame)?;
        self.outbound
            .send(encoded)
            .await
            .map_err(|_| RpcError::TransportClosed)
    }
}

fn slot_label(owner: i64, param: u32) -> String {
    format!("slot {owner}/{param}")
}

/// One secondary invocation against a proxied parameter slot.
struct SlotCall<'a> {
    owner: i64,
    param: u32,
    signature: &'a str,
    args: &'a [Option<Value>],
}

impl SlotCall<'_> {
    fn unknown(&self) -> RpcError {
        RpcError::MethodResolution {
            service: slot_label(self.owner, self.param),
            signature: self.signature.to_string(),
        }
    }

    fn exactly(&self, count: usize) -> Result<()> {
        if self.args.len() != count {
            return Err(RpcError::protocol(format!(
                "{} takes {count} arguments, request carries {}",
                self.signature,
                self.args.len()
            )));
        }
        Ok(())
    }

    fn value(&self, index: usize) -> Result<&Value> {
        match self.args.get(index) {
            Some(Some(value)) => Ok(value),
            _ => Err(RpcError::protocol(format!(
                "{} argument {index} is missing or null",
                self.signature
            ))),
        }
    }

    fn wrong_kind(&self, index: usize, wanted: &str, got: &Value) -> RpcError {
        RpcError::protocol(format!(
            "{} argument {index} carries {:?}, expected {wanted}",
            self.signature,
            got.kind()
        ))
    }

    fn bool(&self, index: usize) -> Result<bool> {
        match self.value(index)? {
            Value::Bool(v) => Ok(*v),
            other => Err(self.wrong_kind(index, "bool", other)),
        }
    }

    fn int(&self, index: usize) -> Result<i32> {
        match self.value(index)? {
            Value::Int(v) => Ok(*v),
            other => Err(self.wrong_kind(index, "int", other)),
        }
    }

    fn long(&self, index: usize) -> Result<i64> {
        match self.value(index)? {
            Value::Long(v) => Ok(*v),
            other => Err(self.wrong_kind(index, "long", other)),
        }
    }

    fn str(&self, index: usize) -> Result<&str> {
        match self.value(index)? {
            Value::Str(v) => Ok(v.as_str()),
            other => Err(self.wrong_kind(index, "string", other)),
        }
    }

    fn blob(&self, index: usize) -> Result<&Bytes> {
        match self.value(index)? {
            Value::Blob(v) => Ok(v),
            other => Err(self.wrong_kind(index, "blob", other)),
        }
    }
}

async fn run_source(source: &mut ByteSource, call: &SlotCall<'_>) -> Result<Option<Value>> {
    match call.signature {
        "read()" => {
            call.exactly(0)?;
            let byte = source.read().await?;
            Ok(Some(Value::Int(byte.map_or(-1, i32::from))))
        }
        "readChunk(I)" => {
            call.exactly(1)?;
            let max = call.int(0)?.max(0) as usize;
            let chunk = source.read_chunk(max).await?;
            if chunk.eof {
                Ok(None)
            } else {
                Ok(Some(Value::Blob(chunk.data)))
            }
        }
        "skip(J)" => {
            call.exactly(1)?;
            Ok(Some(Value::Long(source.skip(call.long(0)?).await?)))
        }
        "available()" => {
            call.exactly(0)?;
            Ok(Some(Value::Int(source.available().await?)))
        }
        "mark(I)" => {
            call.exactly(1)?;
            source.mark(call.int(0)?).await?;
            Ok(None)
        }
        "reset()" => {
            call.exactly(0)?;
            source.reset().await?;
            Ok(None)
        }
        "close()" => {
            call.exactly(0)?;
            source.close().await?;
            Ok(None)
        }
        _ => Err(call.unknown()),
    }
}

async fn run_sink(sink: &mut ByteSink, call: &SlotCall<'_>) -> Result<Option<Value>> {
    match call.signature {
        "write(A)" => {
            call.exactly(1)?;
            sink.write(call.blob(0)?).await?;
            Ok(None)
        }
        "flush()" => {
            call.exactly(0)?;
            sink.flush().await?;
            Ok(None)
        }
        "close()" => {
            call.exactly(0)?;
            sink.close().await?;
            Ok(None)
        }
        _ => Err(call.unknown()),
    }
}

async fn run_progress(feed: &mut ProgressFeed, call: &SlotCall<'_>) -> Result<Option<Value>> {
    match call.signature {
        "beginTask(TI)" => {
            call.exactly(2)?;
            feed.begin_task(call.str(0)?, call.int(1)?).await?;
            Ok(None)
        }
        "worked(I)" => {
            call.exactly(1)?;
            feed.worked(call.int(0)?).await?;
            Ok(None)
        }
        "subTask(T)" => {
            call.exactly(1)?;
            feed.sub_task(call.str(0)?).await?;
            Ok(None)
        }
        "done()" => {
            call.exactly(0)?;
            feed.done().await?;
            Ok(None)
        }
        "setCanceled(Z)" => {
            call.exactly(1)?;
            feed.set_canceled(call.bool(0)?).await?;
            Ok(None)
        }
        "isCanceled()" => {
            call.exactly(0)?;
            Ok(Some(Value::Bool(feed.is_canceled().await?)))
        }
        _ => Err(call.unknown()),
    }
}

async fn write_loop<T: ChannelTx>(
    mut transport: T,
    mut queue: mpsc::Receiver<Bytes>,
    core: Arc<SessionCore>,
) {
    let mut closing = core.closing.subscribe();
    loop {
        let next = tokio::select! {
            biased;
            _ = closing.wait_for(|closed| *closed) => break,
            next = queue.recv() => next,
        };
        let message = match next {
            Some(message) => message,
            None => break,
        };
        trace!(peer = %core.label, len = message.len(), "frame out");
        if let Err(err) = transport.send(message).await {
            warn!(peer = %core.label, error = %err, "channel write failed");
            break;
        }
    }
    core.shutdown();
}

async fn read_loop<R: ChannelRx>(mut transport: R, core: Arc<SessionCore>) {
    let mut closing = core.closing.subscribe();
    loop {
        let next = tokio::select! {
            biased;
            _ = closing.wait_for(|closed| *closed) => break,
            next = transport.recv() => next,
        };
        match next {
            Ok(Some(message)) => {
                trace!(peer = %core.label, len = message.len(), "frame in");
                if message.len() > core.max_frame {
                    error!(
                        peer = %core.label,
                        len = message.len(),
                        limit = core.max_frame,
                        "inbound message exceeds the frame limit, closing session"
                    );
                    break;
                }
                match Frame::decode(message) {
                    Ok(frame) => core.accept(frame),
                    Err(err) => {
                        error!(
                            peer = %core.label,
                            error = %err,
                            "undecodable inbound frame, closing session"
                        );
                        break;
                    }
                }
            }
            Ok(None) => {
                debug!(peer = %core.label, "peer closed the channel");
                break;
            }
            Err(err) => {
                warn!(peer = %core.label, error = %err, "channel read failed");
                break;
            }
        }
    }
    core.shutdown();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::codec::ValueKind;
    use crate::transport::memory_channel;

    fn connected(a: SessionBuilder, b: SessionBuilder) -> (RpcSession, RpcSession) {
        let ((a_tx, a_rx), (b_tx, b_rx)) = memory_channel(16);
        (a.connect(a_tx, a_rx), b.connect(b_tx, b_rx))
    }

    fn calculator_descriptor() -> Arc<ServiceDescriptor> {
        ServiceDescriptor::builder("Calculator")
            .two_way(
                "add",
                [ParamSpec::int(), ParamSpec::int()],
                ReturnSpec::Value(ValueKind::Int),
            )
            .build()
            .unwrap()
    }

    fn calculator_vtable() -> ServiceVtable {
        ServiceVtable::builder(calculator_descriptor())
            .handler("add", |args: Args, _ctx: CallContext| async move {
                Ok(Arg::Int(args.int_at(0)? + args.int_at(1)?))
            })
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_two_way_round_trip() {
        let (client, _server) = connected(
            RpcSession::builder().label("client"),
            RpcSession::builder()
                .label("server")
                .expose(calculator_vtable())
                .unwrap(),
        );
        let calculator = client.stub(calculator_descriptor());
        let sum = calculator
            .call("add", vec![Arg::Int(2), Arg::Int(3)])
            .await
            .unwrap();
        assert_eq!(sum.as_int(), Some(5));
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_unknown_service_reports_method_resolution() {
        let (client, _server) = connected(RpcSession::builder(), RpcSession::builder());
        let calculator = client.stub(calculator_descriptor());
        let err = calculator
            .call("add", vec![Arg::Int(1), Arg::Int(1)])
            .await
            .unwrap_err();
        match err {
            RpcError::MethodResolution { service, signature } => {
                assert_eq!(service, "Calculator");
                assert_eq!(signature, "add(II)");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_one_way_reaches_the_service() {
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(tokio::sync::Notify::new());
        let descriptor = ServiceDescriptor::builder("Audit")
            .one_way("record", [ParamSpec::string()])
            .build()
            .unwrap();
        let vtable = {
            let hits = Arc::clone(&hits);
            let seen = Arc::clone(&seen);
            ServiceVtable::builder(Arc::clone(&descriptor))
                .handler("record", move |args: Args, _ctx: CallContext| {
                    let hits = Arc::clone(&hits);
                    let seen = Arc::clone(&seen);
                    async move {
                        let _ = args.str_at(0)?;
                        hits.fetch_add(1, Ordering::SeqCst);
                        seen.notify_one();
                        Ok(Arg::Null)
                    }
                })
                .build()
                .unwrap()
        };
        let (client, _server) = connected(
            RpcSession::builder(),
            RpcSession::builder().expose(vtable).unwrap(),
        );
        let audit = client.stub(descriptor);
        audit
            .notify("record", vec![Arg::from("saved")])
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), seen.notified())
            .await
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_close_force_completes_pending_calls() {
        let descriptor = ServiceDescriptor::builder("Sleeper")
            .two_way("sleep", [], ReturnSpec::Void)
            .build()
            .unwrap();
        let vtable = ServiceVtable::builder(Arc::clone(&descriptor))
            .handler("sleep", |_args: Args, _ctx: CallContext| async move {
                std::future::pending::<()>().await;
                Ok(Arg::Null)
            })
            .build()
            .unwrap();
        let (client, _server) = connected(
            RpcSession::builder(),
            RpcSession::builder().expose(vtable).unwrap(),
        );
        let sleeper = client.stub(descriptor);
        let call = tokio::spawn(async move { sleeper.call("sleep", vec![]).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(client.pending_calls(), 1);

        client.close();
        let result = call.await.unwrap();
        assert!(matches!(result, Err(RpcError::TransportClosed)));
        assert!(client.is_closed());
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_peer_drop_closes_the_session() {
        let ((a_tx, a_rx), peer_side) = memory_channel(4);
        let client = RpcSession::builder().connect(a_tx, a_rx);
        drop(peer_side);

        client.closed().await;
        assert!(client.is_closed());
        let calculator = client.stub(calculator_descriptor());
        let err = calculator
            .call("add", vec![Arg::Int(1), Arg::Int(2)])
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::TransportClosed));
    }
}
