// src/connection.rs

//! The connection: transport session owner and channel multiplexer.
//!
//! A connection eagerly owns channel 0 (control traffic) and the mapping
//! from channel id to channel. Opening performs the OpenConnection
//! handshake; `open_channel` drives the OpenChannel round-trip on channel
//! 0 and installs the negotiated protocol version's factory on the new
//! channel. Closing cancels every channel in id order.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::unbounded;
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::channel::{Channel, ChannelCore, Principal, Receiver};
use crate::control::{
    self, OpenChannelRequest, OpenConnectionRequest, ProtocolRange,
};
use crate::error::{Error, Result};
use crate::gate::Gate;
use crate::peer::{self, Latch, PeerConfig, PeerHandle, Task};
use crate::pof::{PofContext, Value};
use crate::protocol::Protocol;
use crate::transport::Transport;

pub(crate) struct ConnectionCore {
    id: Uuid,
    peer_id: Mutex<Option<Uuid>>,
    open: AtomicBool,
    gate: Gate,
    serializer: Arc<PofContext>,
    channels: Mutex<BTreeMap<u32, Arc<ChannelCore>>>,
    close_reason: Mutex<Option<Error>>,
    peer: PeerHandle,
}

impl ConnectionCore {
    pub(crate) fn gate(&self) -> &Gate {
        &self.gate
    }

    pub(crate) fn exit_gate(&self) {
        self.gate.exit();
    }

    pub(crate) fn peer(&self) -> &PeerHandle {
        &self.peer
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub(crate) fn closed_error(&self) -> Error {
        let reason = self
            .close_reason
            .lock()
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_default();
        Error::ConnectionClosed(reason)
    }

    pub(crate) fn channel_core(&self, id: u32) -> Option<Arc<ChannelCore>> {
        self.channels.lock().get(&id).cloned()
    }

    pub(crate) fn remove_channel(&self, id: u32) {
        self.channels.lock().remove(&id);
    }

    /// Best-effort NotifyChannelClosed on channel 0, bypassing gates (the
    /// closing channel's gate is already barred).
    pub(crate) fn send_notify_channel_closed(&self, channel_id: u32, cause: Option<Error>) {
        let Some(ch0) = self.channel_core(0) else {
            return;
        };
        let Ok(mut msg) = ch0.factory().create(control::type_id::NOTIFY_CHANNEL_CLOSED) else {
            return;
        };
        if let Some(notify) = msg
            .as_any_mut()
            .downcast_mut::<control::NotifyChannelClosed>()
        {
            notify.channel_id = channel_id;
            notify.reason = cause.map(|e| e.to_string());
        }
        let _ = msg.state_mut().bind(0);
        let _ = self.peer.post(Task::Send {
            channel: 0,
            message: msg,
        });
    }

    /// Route a connection close to the service thread; fall back to an
    /// inline close when the service loop is already gone.
    pub(crate) fn request_close(&self, cause: Option<Error>, wait: bool) {
        if !self.is_open() {
            return;
        }
        if self.peer.is_service_thread() {
            // Never wait on our own loop; it tears down after the current
            // dispatch completes.
            let _ = self.peer.post(Task::CloseConnection { cause, done: None });
            return;
        }
        let done = wait.then(Latch::new);
        match self.peer.post(Task::CloseConnection {
            cause: cause.clone(),
            done: done.clone(),
        }) {
            Ok(()) => {
                if let Some(latch) = done {
                    latch.wait();
                }
            }
            Err(_) => self.close_now(cause),
        }
    }

    /// Tear the connection down: bar the gate, cancel every channel in id
    /// order. Idempotent; runs on the service thread (or as a fallback on
    /// the closing thread).
    pub(crate) fn close_now(&self, cause: Option<Error>) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }
        debug!(connection = %self.id, "connection closing");
        {
            let mut reason = self.close_reason.lock();
            if reason.is_none() {
                reason.clone_from(&cause);
            }
        }
        // Bar new entries; nothing waits on the drain.
        self.gate.close(Duration::ZERO);
        let channels: Vec<Arc<ChannelCore>> =
            self.channels.lock().values().cloned().collect();
        let cancel = cause.unwrap_or_else(|| Error::ConnectionClosed(String::new()));
        for channel in channels {
            channel.close_inline(Some(cancel.clone()), Duration::ZERO);
        }
    }
}

impl std::fmt::Debug for ConnectionCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("open", &self.is_open())
            .finish()
    }
}

/// A client connection to one remote peer.
///
/// Dropping the connection closes it.
#[derive(Debug)]
pub struct Connection {
    core: Arc<ConnectionCore>,
}

impl Connection {
    /// Open a connection over the transport: spawn the service loop, create
    /// channel 0, and perform the OpenConnection handshake.
    pub fn open(transport: Arc<dyn Transport>, config: PeerConfig) -> Result<Connection> {
        let (tx, rx) = unbounded();
        let core = Arc::new(ConnectionCore {
            id: Uuid::new_v4(),
            peer_id: Mutex::new(None),
            open: AtomicBool::new(true),
            gate: Gate::new(),
            serializer: Arc::new(PofContext::new()),
            channels: Mutex::new(BTreeMap::new()),
            close_reason: Mutex::new(None),
            peer: PeerHandle::new(tx, config),
        });

        let factory = control::protocol().factory(control::PROTOCOL_VERSION)?;
        let channel0 = ChannelCore::new(
            0,
            Arc::downgrade(&core),
            factory,
            core.serializer.clone(),
            None,
            None,
        );
        core.channels.lock().insert(0, channel0);

        peer::start(core.clone(), rx, transport)?;

        let connection = Connection { core };
        if let Err(e) = connection.handshake() {
            connection.core.request_close(Some(e.clone()), true);
            return Err(e);
        }
        Ok(connection)
    }

    fn handshake(&self) -> Result<()> {
        let channel0 = self.control_channel()?;
        let mut msg = channel0.create_message(control::type_id::OPEN_CONNECTION_REQUEST)?;
        if let Some(request) = msg.as_any_mut().downcast_mut::<OpenConnectionRequest>() {
            request.client_id = Some(self.core.id);
            request.protocols = vec![ProtocolRange {
                name: control::PROTOCOL_NAME.to_string(),
                supported_version: control::PROTOCOL_VERSION,
                current_version: control::PROTOCOL_VERSION,
            }];
        }
        let result = channel0.request(msg)?;
        let items = result
            .as_array()
            .ok_or_else(|| Error::encoding("open connection result must be an array"))?;
        let version = items
            .first()
            .and_then(Value::as_i32)
            .ok_or_else(|| Error::encoding("open connection result lacks a version"))?;
        if version != control::PROTOCOL_VERSION {
            return Err(Error::ProtocolVersionMismatch {
                protocol: control::PROTOCOL_NAME.to_string(),
                local: (control::PROTOCOL_VERSION, control::PROTOCOL_VERSION),
                remote: (version, version),
            });
        }
        if let Some(Value::Uuid(peer_id)) = items.get(1).map(Value::unshared) {
            *self.core.peer_id.lock() = Some(*peer_id);
        }
        debug!(connection = %self.core.id, "connection open");
        Ok(())
    }

    /// Local connection identity sent in the handshake.
    pub fn id(&self) -> Uuid {
        self.core.id
    }

    /// Remote identity from the handshake response, if it carried one.
    pub fn peer_id(&self) -> Option<Uuid> {
        *self.core.peer_id.lock()
    }

    pub fn is_open(&self) -> bool {
        self.core.is_open()
    }

    /// The channel with the given id, if present. Id 0 is the control
    /// channel.
    pub fn channel(&self, id: u32) -> Option<Channel> {
        self.core.channel_core(id).map(Channel::from_core)
    }

    fn control_channel(&self) -> Result<Channel> {
        self.channel(0).ok_or_else(|| self.core.closed_error())
    }

    /// Ask the remote peer for a new logical channel speaking `protocol`.
    /// The response carries the allocated channel id and the negotiated
    /// version, which selects the channel's message factory.
    pub fn open_channel(
        &self,
        protocol: &Arc<Protocol>,
        receiver: Option<Arc<dyn Receiver>>,
        principal: Option<Principal>,
    ) -> Result<Channel> {
        if !self.core.is_open() {
            return Err(self.core.closed_error());
        }
        let channel0 = self.control_channel()?;
        let mut msg = channel0.create_message(control::type_id::OPEN_CHANNEL_REQUEST)?;
        if let Some(request) = msg.as_any_mut().downcast_mut::<OpenChannelRequest>() {
            request.protocol = Some(ProtocolRange {
                name: protocol.name().to_string(),
                supported_version: protocol.supported_version(),
                current_version: protocol.current_version(),
            });
        }
        let result = channel0.request(msg)?;
        let items = result
            .as_array()
            .ok_or_else(|| Error::encoding("open channel result must be an array"))?;
        let channel_id = items
            .first()
            .and_then(Value::as_i32)
            .filter(|id| *id > 0)
            .ok_or_else(|| Error::encoding("open channel result lacks a channel id"))?
            as u32;
        let version = items
            .get(1)
            .and_then(Value::as_i32)
            .ok_or_else(|| Error::encoding("open channel result lacks a version"))?;
        let factory = protocol.factory(version)?;

        let core = ChannelCore::new(
            channel_id,
            Arc::downgrade(&self.core),
            factory,
            self.core.serializer.clone(),
            receiver.clone(),
            principal,
        );
        {
            let mut channels = self.core.channels.lock();
            if channels.contains_key(&channel_id) {
                return Err(Error::IllegalState("channel id already in use"));
            }
            channels.insert(channel_id, core.clone());
        }
        let channel = Channel::from_core(core);
        if let Some(receiver) = receiver {
            receiver.register_channel(&channel);
        }
        debug!(channel = channel_id, protocol = protocol.name(), version, "channel open");
        Ok(channel)
    }

    /// Name-service lookup on channel 0; `None` when the name is unknown.
    pub fn lookup(&self, name: &str, timeout: Option<Duration>) -> Result<Option<Value>> {
        let channel0 = self.control_channel()?;
        let mut msg = channel0.create_message(control::type_id::LOOKUP_REQUEST)?;
        if let Some(request) = msg.as_any_mut().downcast_mut::<control::LookupRequest>() {
            request.name = Some(name.to_string());
        }
        let result = match timeout {
            Some(timeout) => channel0.request_with_timeout(msg, timeout),
            None => channel0.request(msg),
        }?;
        Ok(if result.is_null() { None } else { Some(result) })
    }

    /// Synchronous liveness probe on channel 0.
    pub fn ping(&self) -> Result<()> {
        let channel0 = self.control_channel()?;
        let msg = channel0.create_message(control::type_id::PING_REQUEST)?;
        channel0.request(msg).map(drop)
    }

    /// Close the connection, cancelling every channel and its pending
    /// requests. Idempotent.
    pub fn close(&self) -> Result<()> {
        self.core.request_close(None, true);
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.core.is_open() {
            self.core.request_close(None, false);
        }
    }
}
