// src/channel.rs

//! Multiplexed logical channels.
//!
//! A channel is an id-bearing conversation carried on a connection. Any
//! number of application threads may be inside the channel at once (all of
//! them hold the gate open); one thread at a time performs the open/close
//! transition. Requests are registered in the channel's ordered registry
//! before they are handed to the peer, under the registry lock that also
//! guards the monotonic request-id counter.
//!
//! Lock order: connection gate, then channel gate, then registry lock.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::connection::ConnectionCore;
use crate::error::{Error, Result};
use crate::gate::Gate;
use crate::message::{Message, MessageFactory, MessageKind};
use crate::peer::Task;
use crate::pof::{PofContext, Value};
use crate::status::RequestStatus;

/// A security identity attached to a channel.
///
/// During dispatch the channel's principal is installed as the calling
/// thread's current principal; [`Principal::current`] observes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    name: String,
}

impl Principal {
    pub fn new(name: impl Into<String>) -> Self {
        Principal { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The principal installed for the current dispatch, if any.
    pub fn current() -> Option<Principal> {
        CURRENT_PRINCIPAL.with(|p| p.borrow().clone())
    }
}

thread_local! {
    static CURRENT_PRINCIPAL: RefCell<Option<Principal>> = const { RefCell::new(None) };
    static DISPATCH_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Scope guard that swaps the thread's principal for a dispatch.
struct PrincipalScope {
    previous: Option<Principal>,
}

impl PrincipalScope {
    fn enter(principal: &Principal) -> Self {
        let previous =
            CURRENT_PRINCIPAL.with(|p| p.borrow_mut().replace(principal.clone()));
        PrincipalScope { previous }
    }
}

impl Drop for PrincipalScope {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT_PRINCIPAL.with(|p| *p.borrow_mut() = previous);
    }
}

/// Scope guard marking the thread as inside a receive dispatch; responses
/// may only be posted from inside one.
struct DispatchScope;

impl DispatchScope {
    fn enter() -> Self {
        DISPATCH_DEPTH.with(|d| d.set(d.get() + 1));
        DispatchScope
    }
}

impl Drop for DispatchScope {
    fn drop(&mut self) {
        DISPATCH_DEPTH.with(|d| d.set(d.get() - 1));
    }
}

fn in_dispatch() -> bool {
    DISPATCH_DEPTH.with(|d| d.get()) > 0
}

/// Application callback for inbound traffic on one channel.
pub trait Receiver: Send + Sync {
    /// An unsolicited message arrived.
    fn on_message(&self, channel: &Channel, message: Box<dyn Message>);

    /// The channel was registered with this receiver.
    fn register_channel(&self, _channel: &Channel) {}

    /// The channel is unregistering ahead of its close.
    fn unregister_channel(&self, _channel: &Channel) {}

    /// The channel finished closing.
    fn on_channel_closed(&self, _channel: &Channel) {}
}

/// Execution context handed to [`Message::run`].
pub struct RunContext<'a> {
    channel: &'a Channel,
    response: Option<&'a mut dyn Message>,
}

impl<'a> RunContext<'a> {
    pub(crate) fn new(channel: &'a Channel, response: Option<&'a mut dyn Message>) -> Self {
        RunContext { channel, response }
    }

    pub fn channel(&self) -> &Channel {
        self.channel
    }

    /// The response being built, present when a request is executing.
    pub fn response(&mut self) -> Option<&mut dyn Message> {
        self.response.as_deref_mut()
    }

    /// Store the result on the pending response.
    pub fn set_result(&mut self, value: Value) -> Result<()> {
        let response = self
            .response
            .as_deref_mut()
            .ok_or(Error::IllegalState("no response in this context"))?;
        let state = response
            .response_mut()
            .ok_or(Error::IllegalState("response lacks response state"))?;
        state.result = value;
        Ok(())
    }
}

#[derive(Default)]
struct RequestRegistry {
    next_id: i64,
    by_id: BTreeMap<i64, Arc<RequestStatus>>,
}

pub(crate) struct ChannelCore {
    id: u32,
    conn: Weak<ConnectionCore>,
    open: AtomicBool,
    closed: AtomicBool,
    close_on_exit: AtomicBool,
    close_notify: AtomicBool,
    close_cause: Mutex<Option<Error>>,
    gate: Gate,
    serializer: Arc<PofContext>,
    factory: Arc<MessageFactory>,
    receiver: Mutex<Option<Arc<dyn Receiver>>>,
    principal: Option<Principal>,
    attributes: Mutex<HashMap<String, Value>>,
    registry: Mutex<RequestRegistry>,
}

impl ChannelCore {
    pub(crate) fn new(
        id: u32,
        conn: Weak<ConnectionCore>,
        factory: Arc<MessageFactory>,
        serializer: Arc<PofContext>,
        receiver: Option<Arc<dyn Receiver>>,
        principal: Option<Principal>,
    ) -> Arc<Self> {
        Arc::new(ChannelCore {
            id,
            conn,
            open: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            close_on_exit: AtomicBool::new(false),
            close_notify: AtomicBool::new(true),
            close_cause: Mutex::new(None),
            gate: Gate::new(),
            serializer,
            factory,
            receiver: Mutex::new(receiver),
            principal,
            attributes: Mutex::new(HashMap::new()),
            registry: Mutex::new(RequestRegistry {
                next_id: 1,
                by_id: BTreeMap::new(),
            }),
        })
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn serializer(&self) -> &Arc<PofContext> {
        &self.serializer
    }

    pub(crate) fn factory(&self) -> &Arc<MessageFactory> {
        &self.factory
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub(crate) fn unregister_status(&self, request_id: i64) {
        self.registry.lock().by_id.remove(&request_id);
    }

    fn connection(&self) -> Result<Arc<ConnectionCore>> {
        self.conn.upgrade().ok_or(Error::ChannelClosed)
    }

    /// Run `f` while holding the connection gate, then the channel gate.
    fn with_gates<R>(
        self: &Arc<Self>,
        conn: &Arc<ConnectionCore>,
        f: impl FnOnce() -> Result<R>,
    ) -> Result<R> {
        if !conn.gate().enter() {
            return Err(conn.closed_error());
        }
        if !self.gate.enter() {
            conn.exit_gate();
            return Err(Error::ChannelClosed);
        }
        let result = f();
        self.exit_gate();
        conn.exit_gate();
        result
    }

    /// Exit the channel gate, completing a deferred close if this was the
    /// last thread inside.
    pub(crate) fn exit_gate(self: &Arc<Self>) {
        if self.gate.exit()
            && self.close_on_exit.load(Ordering::Acquire)
            && self.gate.finish_close()
        {
            self.finish_close();
        }
    }

    /// Effective deadline: the more restrictive of the base timeout (the
    /// explicit argument, or the connection default) and the message's
    /// priority hint. Zero means infinite.
    fn compute_deadline(
        &self,
        conn: &ConnectionCore,
        hint: Option<Duration>,
        explicit: Option<Duration>,
    ) -> Option<Instant> {
        let base = match explicit {
            Some(t) => none_if_zero(t),
            None => none_if_zero(conn.peer().config().request_timeout),
        };
        let effective = match (base, hint.and_then(none_if_zero)) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        effective.map(|t| Instant::now() + t)
    }

    /// Enqueue a non-request (or a response from within a dispatch).
    fn post_message(self: &Arc<Self>, mut msg: Box<dyn Message>) -> Result<()> {
        if msg.kind() == MessageKind::Response && !in_dispatch() {
            return Err(Error::IllegalState(
                "response sent outside receive dispatch",
            ));
        }
        let conn = self.connection()?;
        msg.state_mut().bind(self.id)?;
        self.with_gates(&conn, || {
            conn.peer().post(Task::Send {
                channel: self.id,
                message: msg,
            })
        })
    }

    /// Register and enqueue a request; the status is in the registry
    /// before the peer ever sees the message.
    fn post_request(
        self: &Arc<Self>,
        mut msg: Box<dyn Message>,
        explicit: Option<Duration>,
    ) -> Result<Arc<RequestStatus>> {
        if msg.request().is_none() {
            return Err(Error::IllegalState("message is not a request"));
        }
        let conn = self.connection()?;
        msg.state_mut().bind(self.id)?;
        let hint = msg.timeout_hint();
        self.with_gates(&conn, || {
            let status = {
                let mut registry = self.registry.lock();
                let id = registry.next_id;
                registry.next_id = registry
                    .next_id
                    .checked_add(1)
                    .ok_or(Error::IdSpaceExhausted)?;
                msg.request_mut()
                    .expect("request view checked above")
                    .id = id;
                let deadline = self.compute_deadline(&conn, hint, explicit);
                let status =
                    RequestStatus::new(id, Arc::downgrade(self), msg, deadline);
                registry.by_id.insert(id, status.clone());
                status
            };
            match conn.peer().post(Task::SendRequest {
                channel: self.id,
                status: status.clone(),
            }) {
                Ok(()) => Ok(status),
                Err(e) => {
                    // Send failures cancel the registered status before
                    // the error is re-raised.
                    status.cancel(e.clone());
                    Err(e)
                }
            }
        })
    }

    fn call(
        self: &Arc<Self>,
        msg: Box<dyn Message>,
        explicit: Option<Duration>,
    ) -> Result<Value> {
        let conn = self.connection()?;
        if conn.peer().is_service_thread() {
            return Err(Error::IllegalState(
                "request invoked on the peer service thread",
            ));
        }
        let status = self.post_request(msg, explicit)?;
        let response = status.wait_for_response()?;
        let state = response
            .response()
            .ok_or(Error::IllegalState("response lacks response state"))?;
        if state.failure {
            return Err(Error::Remote(state.result.to_string()));
        }
        Ok(state.result.clone())
    }

    /// Dispatch one inbound message on the service thread. A closed gate
    /// drops the message silently.
    pub(crate) fn receive(self: &Arc<Self>, msg: Box<dyn Message>) {
        if !self.gate.enter() {
            trace!(channel = self.id, "message for closed channel dropped");
            return;
        }
        let _principal = self.principal.as_ref().map(PrincipalScope::enter);
        if let Err(e) = self.dispatch(msg) {
            warn!(channel = self.id, error = %e, "inbound dispatch failed; closing channel");
            // Close from inside the gate: bar it now, finish on exit.
            self.close_inline(Some(e), Duration::ZERO);
        }
        self.exit_gate();
    }

    fn dispatch(self: &Arc<Self>, mut msg: Box<dyn Message>) -> Result<()> {
        msg.state_mut().bind(self.id)?;
        match msg.kind() {
            MessageKind::Request => {
                let request_id = msg
                    .request()
                    .expect("request kind implies request view")
                    .id;
                let mut response = msg.create_response(&self.factory)?;
                let channel = Channel::from_core(self.clone());
                let _scope = DispatchScope::enter();
                let run_result = {
                    let mut cx = RunContext::new(&channel, Some(response.as_mut()));
                    msg.run(&mut cx)
                };
                let state = response
                    .response_mut()
                    .ok_or(Error::IllegalState("response lacks response state"))?;
                if let Err(e) = run_result {
                    state.set_failure(&e);
                }
                state.request_id = request_id;
                self.post_message(response)
            }
            MessageKind::Response => {
                let state = msg.response().expect("response kind implies view");
                let request_id = state.request_id;
                let failure = state.failure;
                let reason = failure.then(|| state.result.to_string());
                let status = self.registry.lock().by_id.get(&request_id).cloned();
                match status {
                    None => {
                        trace!(
                            channel = self.id,
                            request_id,
                            "response for unknown request discarded"
                        );
                    }
                    Some(status) => {
                        if let Some(reason) = reason {
                            status.cancel(Error::Remote(reason));
                        } else {
                            status.set_response(msg);
                        }
                    }
                }
                Ok(())
            }
            MessageKind::Unsolicited => {
                let receiver = self.receiver.lock().clone();
                let channel = Channel::from_core(self.clone());
                match receiver {
                    Some(receiver) => {
                        receiver.on_message(&channel, msg);
                        Ok(())
                    }
                    None => {
                        let _scope = DispatchScope::enter();
                        let mut cx = RunContext::new(&channel, None);
                        msg.run(&mut cx)
                    }
                }
            }
        }
    }

    /// Suppress the close notification to the remote peer (used when the
    /// remote initiated the close).
    pub(crate) fn suppress_close_notify(&self) {
        self.close_notify.store(false, Ordering::Release);
    }

    /// Close entry point honoring the channel-0 restriction and the
    /// service-thread routing rule.
    pub(crate) fn close_request(
        self: &Arc<Self>,
        cause: Option<Error>,
        force: bool,
    ) -> Result<()> {
        if self.id == 0 && !force {
            if let Some(conn) = self.conn.upgrade() {
                if conn.is_open() {
                    return Err(Error::IllegalState(
                        "channel 0 cannot be closed while the connection is open",
                    ));
                }
            }
        }
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        let conn = match self.conn.upgrade() {
            Some(conn) => conn,
            None => {
                self.close_inline(cause, Duration::ZERO);
                return Ok(());
            }
        };
        let drain = conn.peer().config().gate_close_timeout;
        if conn.peer().is_service_thread() {
            self.close_inline(cause, drain);
            return Ok(());
        }
        // Route through the service thread so close and send never race.
        let latch = crate::peer::Latch::new();
        match conn.peer().post(Task::CloseChannel {
            channel: self.id,
            cause: cause.clone(),
            done: Some(latch.clone()),
        }) {
            Ok(()) => {
                latch.wait();
                Ok(())
            }
            Err(_) => {
                // Service thread is gone; close on the caller.
                self.close_inline(cause, drain);
                Ok(())
            }
        }
    }

    /// Ordered close: cancel statuses, bar and drain the gate, then finish
    /// (receiver notification, unregistration, remote notify). When the
    /// gate cannot drain in time, the last exiting thread finishes.
    pub(crate) fn close_inline(self: &Arc<Self>, cause: Option<Error>, drain: Duration) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        self.open.store(false, Ordering::Release);

        let statuses: Vec<Arc<RequestStatus>> = {
            let mut registry = self.registry.lock();
            std::mem::take(&mut registry.by_id).into_values().collect()
        };
        let cancel_cause = cause.clone().unwrap_or(Error::ChannelClosed);
        for status in statuses {
            status.cancel(cancel_cause.clone());
        }

        {
            let mut slot = self.close_cause.lock();
            if slot.is_none() {
                *slot = cause;
            }
        }

        if self.gate.close(drain) {
            self.finish_close();
        } else {
            self.close_on_exit.store(true, Ordering::Release);
            // The gate may have drained between the timeout and the flag.
            if self.gate.finish_close() {
                self.finish_close();
            }
        }
    }

    fn finish_close(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(channel = self.id, "channel closed");
        let cause = self.close_cause.lock().clone();
        let receiver = self.receiver.lock().take();
        if let Some(receiver) = receiver {
            let channel = Channel::from_core(self.clone());
            receiver.unregister_channel(&channel);
            receiver.on_channel_closed(&channel);
        }
        if let Some(conn) = self.conn.upgrade() {
            conn.remove_channel(self.id);
            if self.id != 0 && self.close_notify.load(Ordering::Acquire) && conn.is_open() {
                conn.send_notify_channel_closed(self.id, cause);
            }
        }
    }
}

impl std::fmt::Debug for ChannelCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Handle to a multiplexed logical channel.
#[derive(Clone, Debug)]
pub struct Channel {
    core: Arc<ChannelCore>,
}

impl Channel {
    pub(crate) fn from_core(core: Arc<ChannelCore>) -> Self {
        Channel { core }
    }

    pub(crate) fn core(&self) -> &Arc<ChannelCore> {
        &self.core
    }

    pub(crate) fn connection_core(&self) -> Result<Arc<ConnectionCore>> {
        self.core.connection()
    }

    /// 32-bit id, unique within the connection. Id 0 is the control
    /// channel.
    pub fn id(&self) -> u32 {
        self.core.id
    }

    pub fn is_open(&self) -> bool {
        self.core.is_open()
    }

    /// No-op when already open; a closed channel cannot be reopened.
    pub fn open(&self) -> Result<()> {
        if self.core.is_open() {
            return Ok(());
        }
        Err(Error::ChannelClosed)
    }

    /// The POF context messages on this channel encode with.
    pub fn serializer(&self) -> &Arc<PofContext> {
        &self.core.serializer
    }

    pub fn message_factory(&self) -> &Arc<MessageFactory> {
        &self.core.factory
    }

    pub fn principal(&self) -> Option<&Principal> {
        self.core.principal.as_ref()
    }

    /// Instantiate a message registered on this channel's factory.
    pub fn create_message(&self, type_id: i32) -> Result<Box<dyn Message>> {
        self.core.factory.create(type_id)
    }

    /// Fire-and-forget send: at-most-once delivery, FIFO per channel.
    pub fn send(&self, message: Box<dyn Message>) -> Result<()> {
        if message.request().is_some() {
            // Requests need a status; route them through send_request.
            self.core.post_request(message, None).map(drop)
        } else {
            self.core.post_message(message)
        }
    }

    /// Register and send a request, returning its status handle.
    pub fn send_request(&self, request: Box<dyn Message>) -> Result<Arc<RequestStatus>> {
        self.core.post_request(request, None)
    }

    /// Send a request and block until its response, the default timeout,
    /// or cancellation. Returns the response result or raises its failure.
    pub fn request(&self, request: Box<dyn Message>) -> Result<Value> {
        self.core.call(request, None)
    }

    /// As [`Channel::request`] with an explicit timeout; `Duration::ZERO`
    /// means wait forever.
    pub fn request_with_timeout(
        &self,
        request: Box<dyn Message>,
        timeout: Duration,
    ) -> Result<Value> {
        self.core.call(request, Some(timeout))
    }

    /// Re-send the request held by a completed status to continue a
    /// partial-response stream under the same request id.
    pub fn continue_request(&self, status: &Arc<RequestStatus>) -> Result<()> {
        let conn = self.core.connection()?;
        let hint = status
            .with_request(|m| m.timeout_hint())
            .ok_or(Error::IllegalState("status no longer holds its request"))?;
        self.core.with_gates(&conn, || {
            let deadline = self.core.compute_deadline(&conn, hint, None);
            status.rearm(deadline)?;
            self.core
                .registry
                .lock()
                .by_id
                .insert(status.request_id(), status.clone());
            conn.peer()
                .post(Task::SendRequest {
                    channel: self.core.id,
                    status: status.clone(),
                })
                .map_err(|e| {
                    status.cancel(e.clone());
                    e
                })
        })
    }

    /// The status of a pending request, if it is still in flight.
    pub fn get_request(&self, request_id: i64) -> Option<Arc<RequestStatus>> {
        self.core.registry.lock().by_id.get(&request_id).cloned()
    }

    pub fn get_attribute(&self, name: &str) -> Option<Value> {
        self.core.attributes.lock().get(name).cloned()
    }

    /// Thread-safe attribute write; returns the previous value.
    pub fn set_attribute(&self, name: &str, value: Value) -> Option<Value> {
        self.core.attributes.lock().insert(name.to_string(), value)
    }

    pub fn remove_attribute(&self, name: &str) -> Option<Value> {
        self.core.attributes.lock().remove(name)
    }

    /// Idempotent ordered close. Channel 0 refuses while its connection is
    /// open.
    pub fn close(&self) -> Result<()> {
        self.core.close_request(None, false)
    }
}

fn none_if_zero(t: Duration) -> Option<Duration> {
    if t.is_zero() {
        None
    } else {
        Some(t)
    }
}
