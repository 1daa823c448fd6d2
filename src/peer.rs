// src/peer.rs

//! The connection manager: one service thread per connection.
//!
//! The service thread is the sole writer to the transport and the sole
//! dispatcher of inbound messages; it never blocks on an application lock.
//! Application threads hand it work through an unbounded mailbox. A small
//! internal reader thread blocks on the transport and forwards complete
//! raw frames into the same mailbox, so the service thread can interleave
//! sends, receives, deadline scans, and heartbeats.
//!
//! Per iteration the loop: drains one mailbox task (encode/write outbound,
//! decode/dispatch inbound, administrative closes), cancels request
//! statuses whose deadline passed, and drives the heartbeat state machine.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::buffer::{ReadBuffer, WriteBuffer};
use crate::channel::Channel;
use crate::connection::ConnectionCore;
use crate::control;
use crate::error::{Error, Result};
use crate::message::{decode_body, encode_body, Message};
use crate::status::RequestStatus;
use crate::transport::{FrameReader, FrameWriter, InboundFrame, Transport};

/// Peer tuning knobs.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Default synchronous-request timeout. Zero means infinite.
    pub request_timeout: Duration,
    /// Heartbeat interval on channel 0. Zero disables heartbeats.
    pub ping_interval: Duration,
    /// How long an unanswered heartbeat may stay outstanding before the
    /// connection is closed.
    pub ping_timeout: Duration,
    /// Upper bound on a single frame, enforced on both paths.
    pub max_frame_size: usize,
    /// How long a close waits for in-gate threads to drain.
    pub gate_close_timeout: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        PeerConfig {
            request_timeout: Duration::from_secs(30),
            ping_interval: Duration::ZERO,
            ping_timeout: Duration::from_secs(5),
            max_frame_size: 16 * 1024 * 1024,
            gate_close_timeout: Duration::from_secs(10),
        }
    }
}

/// Work items handed to the service thread.
pub(crate) enum Task {
    /// Encode and write a non-request message.
    Send {
        channel: u32,
        message: Box<dyn Message>,
    },
    /// Encode and write the request held by a registered status.
    SendRequest {
        channel: u32,
        status: Arc<RequestStatus>,
    },
    /// A complete raw frame from the reader thread.
    Inbound(InboundFrame),
    /// The remote peer closed the stream cleanly.
    InboundEof,
    /// The transport failed while reading.
    InboundError(Error),
    /// Close one channel on the service thread.
    CloseChannel {
        channel: u32,
        cause: Option<Error>,
        done: Option<Arc<Latch>>,
    },
    /// Close the connection and stop the loop.
    CloseConnection {
        cause: Option<Error>,
        done: Option<Arc<Latch>>,
    },
}

/// One-shot completion latch for administrative tasks.
pub(crate) struct Latch {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    pub(crate) fn new() -> Arc<Latch> {
        Arc::new(Latch {
            done: Mutex::new(false),
            cond: Condvar::new(),
        })
    }

    pub(crate) fn open(&self) {
        let mut done = self.done.lock();
        *done = true;
        self.cond.notify_all();
    }

    pub(crate) fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.cond.wait(&mut done);
        }
    }
}

/// Handle through which channels and connections reach the service thread.
pub(crate) struct PeerHandle {
    tx: Sender<Task>,
    config: PeerConfig,
    service_thread: OnceLock<ThreadId>,
}

impl PeerHandle {
    pub(crate) fn new(tx: Sender<Task>, config: PeerConfig) -> Self {
        PeerHandle {
            tx,
            config,
            service_thread: OnceLock::new(),
        }
    }

    pub(crate) fn config(&self) -> &PeerConfig {
        &self.config
    }

    pub(crate) fn post(&self, task: Task) -> Result<()> {
        self.tx
            .send(task)
            .map_err(|_| Error::ConnectionClosed("service loop stopped".to_string()))
    }

    pub(crate) fn is_service_thread(&self) -> bool {
        self.service_thread.get() == Some(&thread::current().id())
    }

    fn mark_service_thread(&self) {
        let _ = self.service_thread.set(thread::current().id());
    }
}

/// Spawn the reader and service threads for a freshly created connection.
pub(crate) fn start(
    conn: Arc<ConnectionCore>,
    rx: Receiver<Task>,
    transport: Arc<dyn Transport>,
) -> Result<()> {
    let reader_tx = {
        // Clone out of the handle so the reader does not keep the
        // connection alive.
        conn.peer().tx.clone()
    };
    let max_frame_size = conn.peer().config().max_frame_size;
    let reader_transport = transport.clone();
    thread::Builder::new()
        .name("gridlink-reader".to_string())
        .spawn(move || read_loop(reader_transport, reader_tx, max_frame_size))?;

    thread::Builder::new()
        .name("gridlink-peer".to_string())
        .spawn(move || service_loop(conn, rx, transport))?;
    Ok(())
}

/// Blocks on the transport and forwards raw frames to the service thread.
fn read_loop(transport: Arc<dyn Transport>, tx: Sender<Task>, max_frame_size: usize) {
    let reader = FrameReader::new(transport, max_frame_size);
    loop {
        match reader.read_frame() {
            Ok(Some(frame)) => {
                if tx.send(Task::Inbound(frame)).is_err() {
                    break;
                }
            }
            Ok(None) => {
                let _ = tx.send(Task::InboundEof);
                break;
            }
            Err(e) => {
                let _ = tx.send(Task::InboundError(e));
                break;
            }
        }
    }
    trace!("reader thread exiting");
}

struct ServiceLoop {
    conn: Arc<ConnectionCore>,
    transport: Arc<dyn Transport>,
    writer: FrameWriter,
    config: PeerConfig,
    /// Deadline-ordered request-status index; the sequence number keeps
    /// same-instant deadlines distinct.
    deadlines: BTreeMap<(Instant, u64), Arc<RequestStatus>>,
    deadline_seq: u64,
    next_ping: Option<Instant>,
    outstanding_ping: Option<(Arc<RequestStatus>, Instant)>,
    stopping: bool,
}

fn service_loop(conn: Arc<ConnectionCore>, rx: Receiver<Task>, transport: Arc<dyn Transport>) {
    conn.peer().mark_service_thread();
    let config = conn.peer().config().clone();
    let writer = FrameWriter::new(transport.clone(), config.max_frame_size);
    let next_ping = (!config.ping_interval.is_zero())
        .then(|| Instant::now() + config.ping_interval);
    let mut service = ServiceLoop {
        conn,
        transport,
        writer,
        config,
        deadlines: BTreeMap::new(),
        deadline_seq: 0,
        next_ping,
        outstanding_ping: None,
        stopping: false,
    };

    while !service.stopping {
        let task = match service.next_wake() {
            Some(wake) => {
                let timeout = wake.saturating_duration_since(Instant::now());
                match rx.recv_timeout(timeout) {
                    Ok(task) => Some(task),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            None => match rx.recv() {
                Ok(task) => Some(task),
                Err(_) => break,
            },
        };
        if let Some(task) = task {
            service.handle(task);
        }
        service.scan_deadlines();
        service.heartbeat();
    }

    service.shutdown();
    // Unblock anyone still waiting on an administrative task.
    for task in rx.try_iter() {
        match task {
            Task::CloseChannel { done, .. } | Task::CloseConnection { done, .. } => {
                if let Some(latch) = done {
                    latch.open();
                }
            }
            Task::SendRequest { status, .. } => {
                status.cancel(Error::ConnectionClosed(String::new()));
            }
            _ => {}
        }
    }
    debug!("service thread exiting");
}

impl ServiceLoop {
    fn next_wake(&self) -> Option<Instant> {
        let mut wake = self.deadlines.keys().next().map(|(deadline, _)| *deadline);
        for candidate in [
            self.next_ping,
            self.outstanding_ping.as_ref().map(|(_, d)| *d),
        ]
        .into_iter()
        .flatten()
        {
            wake = Some(wake.map_or(candidate, |w| w.min(candidate)));
        }
        wake
    }

    fn handle(&mut self, task: Task) {
        match task {
            Task::Send { channel, message } => self.handle_send(channel, message),
            Task::SendRequest { channel, status } => self.handle_send_request(channel, status),
            Task::Inbound(frame) => self.handle_inbound(frame),
            Task::InboundEof => {
                self.close_connection(
                    Some(Error::ConnectionClosed("closed by peer".to_string())),
                    false,
                );
            }
            Task::InboundError(e) => {
                self.close_connection(Some(e), false);
            }
            Task::CloseChannel {
                channel,
                cause,
                done,
            } => {
                if let Some(target) = self.conn.channel_core(channel) {
                    target.close_inline(cause, self.config.gate_close_timeout);
                }
                if let Some(latch) = done {
                    latch.open();
                }
            }
            Task::CloseConnection { cause, done } => {
                self.close_connection(cause, true);
                if let Some(latch) = done {
                    latch.open();
                }
            }
        }
    }

    fn encode_for(&self, channel: u32, message: &dyn Message) -> Result<WriteBuffer> {
        let target = self
            .conn
            .channel_core(channel)
            .ok_or(Error::ChannelClosed)?;
        let mut buf = WriteBuffer::new();
        encode_body(message, target.serializer(), &mut buf)?;
        Ok(buf)
    }

    fn handle_send(&mut self, channel: u32, message: Box<dyn Message>) {
        match self
            .encode_for(channel, message.as_ref())
            .and_then(|buf| self.writer.write_frame(channel, buf.as_slice()))
        {
            Ok(()) => {}
            Err(e @ Error::Transport(_)) => {
                warn!(channel, error = %e, "transport write failed");
                self.close_connection(Some(e), false);
            }
            Err(e) => {
                warn!(channel, error = %e, "outbound message dropped");
            }
        }
    }

    fn handle_send_request(&mut self, channel: u32, status: Arc<RequestStatus>) {
        if status.is_complete() {
            // Cancelled or timed out before it ever hit the wire.
            return;
        }
        let encoded = status
            .with_request(|message| {
                self.encode_for(channel, message)
                    .and_then(|buf| self.writer.write_frame(channel, buf.as_slice()))
            })
            .unwrap_or(Err(Error::IllegalState(
                "status no longer holds its request",
            )));
        match encoded {
            Ok(()) => {
                if let Some(deadline) = status.deadline() {
                    self.deadlines
                        .insert((deadline, self.deadline_seq), status);
                    self.deadline_seq += 1;
                }
            }
            Err(e) => {
                let fatal = matches!(e, Error::Transport(_));
                status.cancel(e.clone());
                if fatal {
                    warn!(channel, error = %e, "transport write failed");
                    self.close_connection(Some(e), false);
                }
            }
        }
    }

    fn handle_inbound(&mut self, frame: InboundFrame) {
        let Some(target) = self.conn.channel_core(frame.channel) else {
            debug!(channel = frame.channel, "frame for unknown channel discarded");
            return;
        };
        let mut read = ReadBuffer::new(frame.body);
        match decode_body(target.factory(), target.serializer(), &mut read) {
            Ok(message) => target.receive(message),
            Err(e) => {
                // Undecodable control traffic poisons the connection;
                // anywhere else only the channel dies.
                if frame.channel == 0 {
                    warn!(error = %e, "undecodable frame on channel 0; closing connection");
                    self.close_connection(Some(e), false);
                } else {
                    warn!(channel = frame.channel, error = %e, "undecodable frame; closing channel");
                    target.close_inline(Some(e), Duration::ZERO);
                }
            }
        }
    }

    /// Cancel every status whose deadline has passed.
    fn scan_deadlines(&mut self) {
        let now = Instant::now();
        while let Some((&(deadline, seq), _)) = self.deadlines.iter().next() {
            if deadline > now {
                break;
            }
            let status = self
                .deadlines
                .remove(&(deadline, seq))
                .expect("key observed under the same borrow");
            if !status.is_complete() && status.cancel(Error::Timeout) {
                debug!(request_id = status.request_id(), "request timed out");
            }
        }
    }

    fn heartbeat(&mut self) {
        if self.stopping {
            return;
        }
        let now = Instant::now();

        if let Some((status, deadline)) = self.outstanding_ping.take() {
            if status.succeeded() {
                // Answered; nothing outstanding.
            } else if now >= deadline {
                warn!("heartbeat timed out; closing connection");
                self.close_connection(
                    Some(Error::ConnectionClosed("heartbeat timeout".to_string())),
                    true,
                );
                return;
            } else {
                self.outstanding_ping = Some((status, deadline));
            }
        }

        if let Some(at) = self.next_ping {
            if now >= at {
                self.next_ping = Some(now + self.config.ping_interval);
                if self.outstanding_ping.is_none() {
                    self.send_ping(now);
                }
            }
        }
    }

    fn send_ping(&mut self, now: Instant) {
        let Some(channel0) = self.conn.channel_core(0) else {
            return;
        };
        let channel = Channel::from_core(channel0);
        let mut msg = match channel.create_message(control::type_id::PING_REQUEST) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "heartbeat setup failed");
                return;
            }
        };
        if let Some(ping) = msg.as_any_mut().downcast_mut::<control::PingRequest>() {
            ping.deadline_hint = Some(self.config.ping_timeout);
        }
        match channel.send_request(msg) {
            Ok(status) => {
                trace!(request_id = status.request_id(), "heartbeat sent");
                self.outstanding_ping = Some((status, now + self.config.ping_timeout));
            }
            Err(e) => {
                warn!(error = %e, "heartbeat send failed");
            }
        }
    }

    /// Tear down: optionally notify the remote peer, close every channel,
    /// shut the transport, and stop the loop.
    fn close_connection(&mut self, cause: Option<Error>, notify_remote: bool) {
        if self.stopping {
            return;
        }
        self.stopping = true;
        if notify_remote && self.conn.is_open() {
            self.send_connection_closed_notify(cause.as_ref());
        }
        self.conn.close_now(cause);
        self.transport.shutdown();
    }

    fn send_connection_closed_notify(&self, cause: Option<&Error>) {
        let Some(channel0) = self.conn.channel_core(0) else {
            return;
        };
        let Ok(mut msg) = channel0
            .factory()
            .create(control::type_id::NOTIFY_CONNECTION_CLOSED)
        else {
            return;
        };
        if let Some(notify) = msg
            .as_any_mut()
            .downcast_mut::<control::NotifyConnectionClosed>()
        {
            notify.reason = cause.map(|e| e.to_string());
        }
        let _ = msg.state_mut().bind(0);
        if let Ok(buf) = self.encode_for(0, msg.as_ref()) {
            let _ = self.writer.write_frame(0, buf.as_slice());
        }
    }

    fn shutdown(&mut self) {
        if !self.stopping {
            self.close_connection(None, false);
        }
        // Stale deadline entries die with the loop.
        for (_, status) in std::mem::take(&mut self.deadlines) {
            if !status.is_complete() {
                status.cancel(Error::ConnectionClosed(String::new()));
            }
        }
    }
}
