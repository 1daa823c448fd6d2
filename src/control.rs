// src/control.rs

//! The control protocol living on channel 0.
//!
//! Channel 0 carries connection-level traffic: the open handshake, channel
//! establishment, close notifications, heartbeats, and name-service
//! lookups. The client initiates connections and channels; inbound
//! OpenConnection/OpenChannel requests are answered with a failure
//! response.

use std::any::Any;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use uuid::Uuid;

use crate::channel::RunContext;
use crate::error::{Error, Result};
use crate::message::{Message, MessageFactory, MessageState, RequestState, ResponseState};
use crate::pof::{PofReader, PofWriter, Value};
use crate::protocol::Protocol;

pub const PROTOCOL_NAME: &str = "messaging";
pub const PROTOCOL_VERSION: i32 = 1;

/// Message type ids of the control protocol.
pub mod type_id {
    pub const OPEN_CONNECTION_REQUEST: i32 = 1;
    pub const OPEN_CONNECTION_RESPONSE: i32 = 2;
    pub const OPEN_CHANNEL_REQUEST: i32 = 3;
    pub const OPEN_CHANNEL_RESPONSE: i32 = 4;
    pub const NOTIFY_CHANNEL_CLOSED: i32 = 5;
    pub const NOTIFY_CONNECTION_CLOSED: i32 = 6;
    pub const PING_REQUEST: i32 = 7;
    pub const PING_RESPONSE: i32 = 8;
    pub const LOOKUP_REQUEST: i32 = 9;
    pub const LOOKUP_RESPONSE: i32 = 10;
}

/// The control protocol singleton.
pub fn protocol() -> &'static Arc<Protocol> {
    static PROTOCOL: OnceLock<Arc<Protocol>> = OnceLock::new();
    PROTOCOL.get_or_init(|| {
        Arc::new(
            Protocol::new(PROTOCOL_NAME, PROTOCOL_VERSION, PROTOCOL_VERSION, populate)
                .expect("control protocol version range is static"),
        )
    })
}

fn populate(factory: &mut MessageFactory) {
    let registrations: &[(i32, crate::message::MessageCtor)] = &[
        (type_id::OPEN_CONNECTION_REQUEST, || {
            Box::new(OpenConnectionRequest::default())
        }),
        (type_id::OPEN_CONNECTION_RESPONSE, || {
            Box::new(OpenConnectionResponse::default())
        }),
        (type_id::OPEN_CHANNEL_REQUEST, || {
            Box::new(OpenChannelRequest::default())
        }),
        (type_id::OPEN_CHANNEL_RESPONSE, || {
            Box::new(OpenChannelResponse::default())
        }),
        (type_id::NOTIFY_CHANNEL_CLOSED, || {
            Box::new(NotifyChannelClosed::default())
        }),
        (type_id::NOTIFY_CONNECTION_CLOSED, || {
            Box::new(NotifyConnectionClosed::default())
        }),
        (type_id::PING_REQUEST, || Box::new(PingRequest::default())),
        (type_id::PING_RESPONSE, || Box::new(PingResponse::default())),
        (type_id::LOOKUP_REQUEST, || Box::new(LookupRequest::default())),
        (type_id::LOOKUP_RESPONSE, || {
            Box::new(LookupResponse::default())
        }),
    ];
    for (id, ctor) in registrations {
        factory
            .register(*id, *ctor)
            .expect("control type ids are distinct");
    }
}

/// One protocol's negotiable range, as carried in the open handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolRange {
    pub name: String,
    pub supported_version: i32,
    pub current_version: i32,
}

impl ProtocolRange {
    fn to_value(&self) -> Value {
        Value::Array(vec![
            Value::String(self.name.clone()),
            Value::I32(self.supported_version),
            Value::I32(self.current_version),
        ])
    }

    fn from_value(value: &Value) -> Result<Self> {
        let items = value
            .as_array()
            .ok_or_else(|| Error::encoding("protocol range must be an array"))?;
        match items {
            [name, supported, current] => Ok(ProtocolRange {
                name: name
                    .as_str()
                    .ok_or_else(|| Error::encoding("protocol name must be a string"))?
                    .to_string(),
                supported_version: supported
                    .as_i32()
                    .ok_or_else(|| Error::encoding("supported version must be an int32"))?,
                current_version: current
                    .as_i32()
                    .ok_or_else(|| Error::encoding("current version must be an int32"))?,
            }),
            _ => Err(Error::encoding("protocol range must have three elements")),
        }
    }
}

/// Opens the connection: client identity plus the protocol ranges the
/// client wants to speak.
#[derive(Debug, Default)]
pub struct OpenConnectionRequest {
    state: MessageState,
    request: RequestState,
    pub client_id: Option<Uuid>,
    pub protocols: Vec<ProtocolRange>,
}

impl Message for OpenConnectionRequest {
    fn type_id(&self) -> i32 {
        type_id::OPEN_CONNECTION_REQUEST
    }

    fn state(&self) -> &MessageState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut MessageState {
        &mut self.state
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn write_body(&self, writer: &mut PofWriter<'_>) -> Result<()> {
        self.request.write_to(writer)?;
        match self.client_id {
            Some(id) => writer.write_uuid(1, id)?,
            None => writer.write_value(1, &Value::Null)?,
        }
        let ranges = self.protocols.iter().map(ProtocolRange::to_value).collect();
        writer.write_value(2, &Value::Array(ranges))
    }

    fn read_body(&mut self, reader: &mut PofReader<'_>) -> Result<()> {
        self.request.read_from(reader)?;
        self.client_id = reader.read_uuid(1)?;
        self.protocols = match reader.read_value(2)? {
            Value::Null => Vec::new(),
            value => value
                .as_array()
                .ok_or_else(|| Error::encoding("protocol list must be an array"))?
                .iter()
                .map(ProtocolRange::from_value)
                .collect::<Result<_>>()?,
        };
        Ok(())
    }

    fn request(&self) -> Option<&RequestState> {
        Some(&self.request)
    }

    fn request_mut(&mut self) -> Option<&mut RequestState> {
        Some(&mut self.request)
    }

    fn create_response(&self, factory: &MessageFactory) -> Result<Box<dyn Message>> {
        factory.create(type_id::OPEN_CONNECTION_RESPONSE)
    }

    fn run(&mut self, _cx: &mut RunContext<'_>) -> Result<()> {
        // This driver initiates connections; it does not accept them.
        Err(Error::IllegalState("connection open not accepted here"))
    }
}

#[derive(Debug, Default)]
pub struct OpenConnectionResponse {
    state: MessageState,
    response: ResponseState,
}

impl OpenConnectionResponse {
    /// Negotiated control version and the responder's identity, packed
    /// into the result value.
    pub fn result_value(version: i32, peer_id: Uuid) -> Value {
        Value::Array(vec![Value::I32(version), Value::Uuid(peer_id)])
    }
}

impl Message for OpenConnectionResponse {
    fn type_id(&self) -> i32 {
        type_id::OPEN_CONNECTION_RESPONSE
    }

    fn state(&self) -> &MessageState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut MessageState {
        &mut self.state
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn write_body(&self, writer: &mut PofWriter<'_>) -> Result<()> {
        self.response.write_to(writer)
    }

    fn read_body(&mut self, reader: &mut PofReader<'_>) -> Result<()> {
        self.response.read_from(reader)
    }

    fn response(&self) -> Option<&ResponseState> {
        Some(&self.response)
    }

    fn response_mut(&mut self) -> Option<&mut ResponseState> {
        Some(&mut self.response)
    }
}

/// Asks the remote peer to allocate a channel for a named protocol.
#[derive(Debug, Default)]
pub struct OpenChannelRequest {
    state: MessageState,
    request: RequestState,
    pub protocol: Option<ProtocolRange>,
}

impl Message for OpenChannelRequest {
    fn type_id(&self) -> i32 {
        type_id::OPEN_CHANNEL_REQUEST
    }

    fn state(&self) -> &MessageState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut MessageState {
        &mut self.state
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn write_body(&self, writer: &mut PofWriter<'_>) -> Result<()> {
        self.request.write_to(writer)?;
        match &self.protocol {
            Some(range) => writer.write_value(1, &range.to_value()),
            None => writer.write_value(1, &Value::Null),
        }
    }

    fn read_body(&mut self, reader: &mut PofReader<'_>) -> Result<()> {
        self.request.read_from(reader)?;
        self.protocol = match reader.read_value(1)? {
            Value::Null => None,
            value => Some(ProtocolRange::from_value(&value)?),
        };
        Ok(())
    }

    fn request(&self) -> Option<&RequestState> {
        Some(&self.request)
    }

    fn request_mut(&mut self) -> Option<&mut RequestState> {
        Some(&mut self.request)
    }

    fn create_response(&self, factory: &MessageFactory) -> Result<Box<dyn Message>> {
        factory.create(type_id::OPEN_CHANNEL_RESPONSE)
    }

    fn run(&mut self, _cx: &mut RunContext<'_>) -> Result<()> {
        // Channels are initiated by this side only.
        Err(Error::IllegalState("inbound channel open not accepted here"))
    }
}

#[derive(Debug, Default)]
pub struct OpenChannelResponse {
    state: MessageState,
    response: ResponseState,
}

impl OpenChannelResponse {
    /// Allocated channel id and negotiated protocol version, packed into
    /// the result value.
    pub fn result_value(channel_id: u32, version: i32) -> Value {
        Value::Array(vec![Value::I32(channel_id as i32), Value::I32(version)])
    }
}

impl Message for OpenChannelResponse {
    fn type_id(&self) -> i32 {
        type_id::OPEN_CHANNEL_RESPONSE
    }

    fn state(&self) -> &MessageState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut MessageState {
        &mut self.state
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn write_body(&self, writer: &mut PofWriter<'_>) -> Result<()> {
        self.response.write_to(writer)
    }

    fn read_body(&mut self, reader: &mut PofReader<'_>) -> Result<()> {
        self.response.read_from(reader)
    }

    fn response(&self) -> Option<&ResponseState> {
        Some(&self.response)
    }

    fn response_mut(&mut self) -> Option<&mut ResponseState> {
        Some(&mut self.response)
    }
}

/// The remote peer closed one of our channels.
#[derive(Debug, Default)]
pub struct NotifyChannelClosed {
    state: MessageState,
    pub channel_id: u32,
    pub reason: Option<String>,
}

impl Message for NotifyChannelClosed {
    fn type_id(&self) -> i32 {
        type_id::NOTIFY_CHANNEL_CLOSED
    }

    fn state(&self) -> &MessageState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut MessageState {
        &mut self.state
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn write_body(&self, writer: &mut PofWriter<'_>) -> Result<()> {
        writer.write_i32(0, self.channel_id as i32)?;
        writer.write_string(1, self.reason.as_deref())
    }

    fn read_body(&mut self, reader: &mut PofReader<'_>) -> Result<()> {
        self.channel_id = reader.read_i32(0)? as u32;
        self.reason = reader.read_string(1)?;
        Ok(())
    }

    fn run(&mut self, cx: &mut RunContext<'_>) -> Result<()> {
        let conn = cx.channel().connection_core()?;
        if let Some(target) = conn.channel_core(self.channel_id) {
            let cause = self.reason.take().map(Error::Remote);
            // The remote already knows; do not notify back.
            target.suppress_close_notify();
            target.close_inline(cause, Duration::ZERO);
        }
        Ok(())
    }
}

/// The remote peer is closing the whole connection.
#[derive(Debug, Default)]
pub struct NotifyConnectionClosed {
    state: MessageState,
    pub reason: Option<String>,
}

impl Message for NotifyConnectionClosed {
    fn type_id(&self) -> i32 {
        type_id::NOTIFY_CONNECTION_CLOSED
    }

    fn state(&self) -> &MessageState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut MessageState {
        &mut self.state
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn write_body(&self, writer: &mut PofWriter<'_>) -> Result<()> {
        writer.write_string(0, self.reason.as_deref())
    }

    fn read_body(&mut self, reader: &mut PofReader<'_>) -> Result<()> {
        self.reason = reader.read_string(0)?;
        Ok(())
    }

    fn run(&mut self, cx: &mut RunContext<'_>) -> Result<()> {
        let conn = cx.channel().connection_core()?;
        let reason = self.reason.take().unwrap_or_else(|| "closed by peer".to_string());
        conn.request_close(Some(Error::ConnectionClosed(reason)), false);
        Ok(())
    }
}

/// Heartbeat probe. Either side may send it; the receiver answers with an
/// empty-result response.
#[derive(Debug, Default)]
pub struct PingRequest {
    state: MessageState,
    request: RequestState,
    /// Deadline hint installed by the heartbeat machinery; not on the wire.
    pub deadline_hint: Option<Duration>,
}

impl Message for PingRequest {
    fn type_id(&self) -> i32 {
        type_id::PING_REQUEST
    }

    fn state(&self) -> &MessageState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut MessageState {
        &mut self.state
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn write_body(&self, writer: &mut PofWriter<'_>) -> Result<()> {
        self.request.write_to(writer)
    }

    fn read_body(&mut self, reader: &mut PofReader<'_>) -> Result<()> {
        self.request.read_from(reader)
    }

    fn request(&self) -> Option<&RequestState> {
        Some(&self.request)
    }

    fn request_mut(&mut self) -> Option<&mut RequestState> {
        Some(&mut self.request)
    }

    fn timeout_hint(&self) -> Option<Duration> {
        self.deadline_hint
    }

    fn create_response(&self, factory: &MessageFactory) -> Result<Box<dyn Message>> {
        factory.create(type_id::PING_RESPONSE)
    }
}

#[derive(Debug, Default)]
pub struct PingResponse {
    state: MessageState,
    response: ResponseState,
}

impl Message for PingResponse {
    fn type_id(&self) -> i32 {
        type_id::PING_RESPONSE
    }

    fn state(&self) -> &MessageState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut MessageState {
        &mut self.state
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn write_body(&self, writer: &mut PofWriter<'_>) -> Result<()> {
        self.response.write_to(writer)
    }

    fn read_body(&mut self, reader: &mut PofReader<'_>) -> Result<()> {
        self.response.read_from(reader)
    }

    fn response(&self) -> Option<&ResponseState> {
        Some(&self.response)
    }

    fn response_mut(&mut self) -> Option<&mut ResponseState> {
        Some(&mut self.response)
    }
}

/// Name-service lookup by string name.
#[derive(Debug, Default)]
pub struct LookupRequest {
    state: MessageState,
    request: RequestState,
    pub name: Option<String>,
}

impl Message for LookupRequest {
    fn type_id(&self) -> i32 {
        type_id::LOOKUP_REQUEST
    }

    fn state(&self) -> &MessageState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut MessageState {
        &mut self.state
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn write_body(&self, writer: &mut PofWriter<'_>) -> Result<()> {
        self.request.write_to(writer)?;
        writer.write_string(1, self.name.as_deref())
    }

    fn read_body(&mut self, reader: &mut PofReader<'_>) -> Result<()> {
        self.request.read_from(reader)?;
        self.name = reader.read_string(1)?;
        Ok(())
    }

    fn request(&self) -> Option<&RequestState> {
        Some(&self.request)
    }

    fn request_mut(&mut self) -> Option<&mut RequestState> {
        Some(&mut self.request)
    }

    fn create_response(&self, factory: &MessageFactory) -> Result<Box<dyn Message>> {
        factory.create(type_id::LOOKUP_RESPONSE)
    }

    // The client has no name service; an inbound lookup answers null.
}

#[derive(Debug, Default)]
pub struct LookupResponse {
    state: MessageState,
    response: ResponseState,
}

impl Message for LookupResponse {
    fn type_id(&self) -> i32 {
        type_id::LOOKUP_RESPONSE
    }

    fn state(&self) -> &MessageState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut MessageState {
        &mut self.state
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn write_body(&self, writer: &mut PofWriter<'_>) -> Result<()> {
        self.response.write_to(writer)
    }

    fn read_body(&mut self, reader: &mut PofReader<'_>) -> Result<()> {
        self.response.read_from(reader)
    }

    fn response(&self) -> Option<&ResponseState> {
        Some(&self.response)
    }

    fn response_mut(&mut self) -> Option<&mut ResponseState> {
        Some(&mut self.response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{ReadBuffer, WriteBuffer};
    use crate::message::{decode_body, encode_body, MessageKind};
    use crate::pof::PofContext;

    fn factory() -> Arc<MessageFactory> {
        protocol().factory(PROTOCOL_VERSION).unwrap()
    }

    fn roundtrip(msg: &dyn Message) -> Box<dyn Message> {
        let ctx = PofContext::new();
        let mut buf = WriteBuffer::new();
        encode_body(msg, &ctx, &mut buf).unwrap();
        let mut read = ReadBuffer::new(buf.into_bytes());
        decode_body(&factory(), &ctx, &mut read).unwrap()
    }

    #[test]
    fn every_control_type_is_registered() {
        let f = factory();
        for id in 1..=10 {
            assert!(f.is_registered(id), "type {} missing", id);
        }
        assert!(!f.is_registered(0));
        assert!(!f.is_registered(11));
    }

    #[test]
    fn open_connection_request_roundtrip() {
        let mut msg = factory()
            .create(type_id::OPEN_CONNECTION_REQUEST)
            .unwrap();
        {
            let req = msg
                .as_any_mut()
                .downcast_mut::<OpenConnectionRequest>()
                .unwrap();
            req.client_id = Some(Uuid::from_bytes([9; 16]));
            req.protocols = vec![ProtocolRange {
                name: "cache".into(),
                supported_version: 2,
                current_version: 5,
            }];
            req.request.id = 1;
        }
        let decoded = roundtrip(msg.as_ref());
        assert_eq!(decoded.kind(), MessageKind::Request);
        let decoded = decoded
            .as_any()
            .downcast_ref::<OpenConnectionRequest>()
            .unwrap();
        assert_eq!(decoded.client_id, Some(Uuid::from_bytes([9; 16])));
        assert_eq!(decoded.protocols.len(), 1);
        assert_eq!(decoded.protocols[0].name, "cache");
        assert_eq!(decoded.request.id, 1);
    }

    #[test]
    fn open_channel_response_result_layout() {
        let value = OpenChannelResponse::result_value(7, 3);
        let items = value.as_array().unwrap();
        assert_eq!(items[0].as_i32(), Some(7));
        assert_eq!(items[1].as_i32(), Some(3));
    }

    #[test]
    fn notify_channel_closed_roundtrip() {
        let mut msg = factory().create(type_id::NOTIFY_CHANNEL_CLOSED).unwrap();
        {
            let notify = msg
                .as_any_mut()
                .downcast_mut::<NotifyChannelClosed>()
                .unwrap();
            notify.channel_id = 42;
            notify.reason = Some("drained".into());
        }
        let decoded = roundtrip(msg.as_ref());
        assert_eq!(decoded.kind(), MessageKind::Unsolicited);
        let decoded = decoded
            .as_any()
            .downcast_ref::<NotifyChannelClosed>()
            .unwrap();
        assert_eq!(decoded.channel_id, 42);
        assert_eq!(decoded.reason.as_deref(), Some("drained"));
    }

    #[test]
    fn ping_pair_classification() {
        let f = factory();
        let ping = f.create(type_id::PING_REQUEST).unwrap();
        assert_eq!(ping.kind(), MessageKind::Request);
        let pong = ping.create_response(&f).unwrap();
        assert_eq!(pong.kind(), MessageKind::Response);
        assert_eq!(Message::type_id(pong.as_ref()), type_id::PING_RESPONSE);
    }

    #[test]
    fn ping_deadline_hint_stays_off_the_wire() {
        let mut ping = PingRequest::default();
        ping.deadline_hint = Some(Duration::from_secs(5));
        ping.request.id = 3;
        let decoded = roundtrip(&ping);
        let decoded = decoded.as_any().downcast_ref::<PingRequest>().unwrap();
        assert_eq!(decoded.deadline_hint, None);
        assert_eq!(decoded.request.id, 3);
    }

    #[test]
    fn lookup_roundtrip() {
        let mut req = LookupRequest::default();
        req.name = Some("cache:orders".into());
        req.request.id = 2;
        let decoded = roundtrip(&req);
        let decoded = decoded.as_any().downcast_ref::<LookupRequest>().unwrap();
        assert_eq!(decoded.name.as_deref(), Some("cache:orders"));
    }
}
