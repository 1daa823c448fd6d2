// src/message.rs

//! Messages, message factories, and the message body codec.
//!
//! A message is an evolvable record: a non-negative type id, a data version,
//! an impl version, an opaque future-data tail, and user-defined body
//! properties. Classification (request / response / unsolicited) is a
//! property of the type, expressed through the [`Message::request`] and
//! [`Message::response`] capability views rather than an inheritance tree.
//!
//! A [`MessageFactory`] is the dense typeId → constructor table for one
//! protocol version; every message it creates reports that version as its
//! impl version.

use std::any::Any;
use std::time::Duration;

use bytes::Bytes;

use crate::buffer::{ReadBuffer, WriteBuffer};
use crate::channel::RunContext;
use crate::error::{Error, Result};
use crate::pof::{PofContext, PofReader, PofWriter, Value};

/// How a message participates in correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Expects a response carrying its request id.
    Request,
    /// Carries a request id, a failure flag, and a result.
    Response,
    /// Dispatched to the channel receiver (or runs itself).
    Unsolicited,
}

/// Evolvable state carried by every message.
#[derive(Debug, Clone, Default)]
pub struct MessageState {
    impl_version: i32,
    data_version: i32,
    future_data: Bytes,
    channel: Option<u32>,
}

impl MessageState {
    /// Version of the factory that created this message.
    pub fn impl_version(&self) -> i32 {
        self.impl_version
    }

    pub(crate) fn set_impl_version(&mut self, v: i32) {
        self.impl_version = v;
    }

    /// Version carried by the frame this message was decoded from.
    pub fn data_version(&self) -> i32 {
        self.data_version
    }

    pub(crate) fn set_data_version(&mut self, v: i32) {
        self.data_version = v;
    }

    /// Unrecognized tail preserved from decode, re-emitted on encode.
    pub fn future_data(&self) -> &Bytes {
        &self.future_data
    }

    pub(crate) fn set_future_data(&mut self, tail: Bytes) {
        self.future_data = tail;
    }

    /// Channel this message is bound to, once sent or received.
    pub fn channel(&self) -> Option<u32> {
        self.channel
    }

    /// Binding is immutable after first set; re-binding to the same channel
    /// (a partial-response continuation re-sends the request) is a no-op.
    pub(crate) fn bind(&mut self, channel_id: u32) -> Result<()> {
        match self.channel {
            None => {
                self.channel = Some(channel_id);
                Ok(())
            }
            Some(bound) if bound == channel_id => Ok(()),
            Some(_) => Err(Error::IllegalState("message already bound to a channel")),
        }
    }
}

/// Correlation state of a request message.
#[derive(Debug, Clone, Default)]
pub struct RequestState {
    /// Channel-scoped request id, assigned under the registry lock.
    pub id: i64,
}

impl RequestState {
    /// Emit the correlation header (property 0). Request bodies start
    /// their own properties at index 1.
    pub fn write_to(&self, writer: &mut PofWriter<'_>) -> Result<()> {
        writer.write_i64(0, self.id)
    }

    pub fn read_from(&mut self, reader: &mut PofReader<'_>) -> Result<()> {
        self.id = reader.read_i64(0)?;
        Ok(())
    }
}

/// Correlation and result state of a response message.
///
/// A partial response carries a non-absent cookie: more results remain and
/// the same request may be re-sent to continue the stream. The cookie is
/// opaque to the core; it is only round-tripped.
#[derive(Debug, Clone, Default)]
pub struct ResponseState {
    pub request_id: i64,
    pub failure: bool,
    pub result: Value,
    pub cookie: Option<Bytes>,
}

impl ResponseState {
    /// Emit the correlation, failure, result, and cookie properties
    /// (indexes 0-3). Response bodies start their own properties at 4.
    pub fn write_to(&self, writer: &mut PofWriter<'_>) -> Result<()> {
        writer.write_i64(0, self.request_id)?;
        writer.write_bool(1, self.failure)?;
        writer.write_value(2, &self.result)?;
        writer.write_binary(3, self.cookie.as_ref())?;
        Ok(())
    }

    pub fn read_from(&mut self, reader: &mut PofReader<'_>) -> Result<()> {
        self.request_id = reader.read_i64(0)?;
        self.failure = reader.read_bool(1)?;
        self.result = reader.read_value(2)?;
        self.cookie = reader.read_binary(3)?;
        Ok(())
    }

    pub(crate) fn set_failure(&mut self, err: &Error) {
        self.failure = true;
        self.result = Value::String(err.to_string());
    }
}

/// The message capability record: serialize, classify, run.
///
/// `write_body`/`read_body` handle the indexed properties only; the frame
/// header, the future-data tail, and the terminator are owned by
/// [`encode_body`]/[`decode_body`].
pub trait Message: Send + std::fmt::Debug + 'static {
    /// Non-negative type id within the owning factory.
    fn type_id(&self) -> i32;

    /// Downcast support; implementations return `self`.
    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    fn state(&self) -> &MessageState;

    fn state_mut(&mut self) -> &mut MessageState;

    /// Emit body properties in strictly ascending index order.
    fn write_body(&self, writer: &mut PofWriter<'_>) -> Result<()>;

    /// Decode body properties; absent ones keep their defaults.
    fn read_body(&mut self, reader: &mut PofReader<'_>) -> Result<()>;

    /// Request view, present iff this type is a request.
    fn request(&self) -> Option<&RequestState> {
        None
    }

    fn request_mut(&mut self) -> Option<&mut RequestState> {
        None
    }

    /// Response view, present iff this type is a response.
    fn response(&self) -> Option<&ResponseState> {
        None
    }

    fn response_mut(&mut self) -> Option<&mut ResponseState> {
        None
    }

    /// Priority-task hint: a request may ask for a tighter deadline than
    /// the connection default. The more restrictive of the two wins.
    fn timeout_hint(&self) -> Option<Duration> {
        None
    }

    /// Instantiate the response type paired with this request.
    fn create_response(&self, _factory: &MessageFactory) -> Result<Box<dyn Message>> {
        Err(Error::IllegalState("message is not a request"))
    }

    /// Execute on receipt. Requests populate their response through the
    /// context; unsolicited messages without a channel receiver run here.
    fn run(&mut self, _cx: &mut RunContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Classification derived from the capability views.
    fn kind(&self) -> MessageKind {
        if self.response().is_some() {
            MessageKind::Response
        } else if self.request().is_some() {
            MessageKind::Request
        } else {
            MessageKind::Unsolicited
        }
    }
}

/// Constructor for one registered message type.
pub type MessageCtor = fn() -> Box<dyn Message>;

/// Dense typeId → constructor table for one protocol version.
pub struct MessageFactory {
    protocol: String,
    version: i32,
    ctors: Vec<Option<MessageCtor>>,
}

impl MessageFactory {
    pub fn new(protocol: impl Into<String>, version: i32) -> Self {
        MessageFactory {
            protocol: protocol.into(),
            version,
            ctors: Vec::new(),
        }
    }

    /// Name of the protocol this factory belongs to.
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Negotiated protocol version all created messages report.
    pub fn version(&self) -> i32 {
        self.version
    }

    /// Register a constructor. At most one type per type id.
    pub fn register(&mut self, type_id: i32, ctor: MessageCtor) -> Result<()> {
        if type_id < 0 {
            return Err(Error::IllegalState("type id must be non-negative"));
        }
        let slot = type_id as usize;
        if slot >= self.ctors.len() {
            self.ctors.resize(slot + 1, None);
        }
        if self.ctors[slot].is_some() {
            return Err(Error::DuplicateType(type_id));
        }
        self.ctors[slot] = Some(ctor);
        Ok(())
    }

    /// True if a constructor is registered for the type id.
    pub fn is_registered(&self, type_id: i32) -> bool {
        type_id >= 0
            && self
                .ctors
                .get(type_id as usize)
                .map(|c| c.is_some())
                .unwrap_or(false)
    }

    /// Instantiate a message; its impl version is this factory's version.
    pub fn create(&self, type_id: i32) -> Result<Box<dyn Message>> {
        let ctor = usize::try_from(type_id)
            .ok()
            .and_then(|slot| self.ctors.get(slot))
            .and_then(|c| c.as_ref())
            .ok_or(Error::TypeUnknown(type_id))?;
        let mut msg = ctor();
        msg.state_mut().set_impl_version(self.version);
        Ok(msg)
    }
}

impl std::fmt::Debug for MessageFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageFactory")
            .field("protocol", &self.protocol)
            .field("version", &self.version)
            .field("types", &self.ctors.iter().filter(|c| c.is_some()).count())
            .finish()
    }
}

/// Encode a message body: `[typeId][versionId][props][remainder][term]`.
///
/// The frame version is `max(dataVersion, implVersion)` so a message that
/// carried newer properties through an older factory re-encodes at the
/// newer version, with its future data appended before the terminator.
pub fn encode_body(msg: &dyn Message, ctx: &PofContext, buf: &mut WriteBuffer) -> Result<()> {
    let state = msg.state();
    let version = state.data_version().max(state.impl_version());
    let mut writer = PofWriter::new(buf, ctx);
    writer.begin_user_type(msg.type_id(), version)?;
    msg.write_body(&mut writer)?;
    writer.write_remainder(state.future_data());
    writer.finish()
}

/// Decode a message body via the factory: instantiate by type id, adopt the
/// frame's data version, read known properties, capture the tail.
pub fn decode_body(
    factory: &MessageFactory,
    ctx: &PofContext,
    buf: &mut ReadBuffer,
) -> Result<Box<dyn Message>> {
    let mut reader = PofReader::new(buf, ctx);
    let (type_id, version) = reader.begin_user_type()?;
    let mut msg = factory.create(type_id)?;
    msg.state_mut().set_data_version(version);
    msg.read_body(&mut reader)?;
    let tail = reader.read_remainder()?;
    msg.state_mut().set_future_data(tail);
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Two schema generations of the same wire type: v2 adds a property.
    #[derive(Debug, Default)]
    struct GreetV1 {
        state: MessageState,
        name: Option<String>,
        count: i32,
    }

    impl Message for GreetV1 {
        fn type_id(&self) -> i32 {
            4
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
            writer.write_string(0, self.name.as_deref())?;
            writer.write_i32(1, self.count)
        }

        fn read_body(&mut self, reader: &mut PofReader<'_>) -> Result<()> {
            self.name = reader.read_string(0)?;
            self.count = reader.read_i32(1)?;
            Ok(())
        }
    }

    #[derive(Debug, Default)]
    struct GreetV2 {
        state: MessageState,
        name: Option<String>,
        count: i32,
        emphatic: bool,
    }

    impl Message for GreetV2 {
        fn type_id(&self) -> i32 {
            4
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
            writer.write_string(0, self.name.as_deref())?;
            writer.write_i32(1, self.count)?;
            writer.write_bool(2, self.emphatic)
        }

        fn read_body(&mut self, reader: &mut PofReader<'_>) -> Result<()> {
            self.name = reader.read_string(0)?;
            self.count = reader.read_i32(1)?;
            self.emphatic = reader.read_bool(2)?;
            Ok(())
        }
    }

    fn v1_factory() -> MessageFactory {
        let mut f = MessageFactory::new("test", 1);
        f.register(4, || Box::new(GreetV1::default())).unwrap();
        f
    }

    fn v2_factory() -> MessageFactory {
        let mut f = MessageFactory::new("test", 2);
        f.register(4, || Box::new(GreetV2::default())).unwrap();
        f
    }

    #[test]
    fn duplicate_registration_refused() {
        let mut f = v1_factory();
        let err = f.register(4, || Box::new(GreetV1::default())).unwrap_err();
        assert!(matches!(err, Error::DuplicateType(4)));
    }

    #[test]
    fn unknown_type_refused() {
        let f = v1_factory();
        assert!(matches!(f.create(9), Err(Error::TypeUnknown(9))));
        assert!(matches!(f.create(-2), Err(Error::TypeUnknown(-2))));
        assert!(f.is_registered(4));
        assert!(!f.is_registered(9));
    }

    #[test]
    fn created_messages_adopt_factory_version() {
        let f = v2_factory();
        let msg = f.create(4).unwrap();
        assert_eq!(msg.state().impl_version(), 2);
        assert_eq!(msg.kind(), MessageKind::Unsolicited);
    }

    #[test]
    fn same_schema_roundtrip() {
        let ctx = PofContext::new();
        let f = v1_factory();
        let mut msg = GreetV1::default();
        msg.state.set_impl_version(1);
        msg.name = Some("world".into());
        msg.count = 3;

        let mut buf = WriteBuffer::new();
        encode_body(&msg, &ctx, &mut buf).unwrap();
        let mut read = ReadBuffer::new(buf.into_bytes());
        let decoded = decode_body(&f, &ctx, &mut read).unwrap();
        let decoded = decoded.as_any().downcast_ref::<GreetV1>().unwrap();
        assert_eq!(decoded.name.as_deref(), Some("world"));
        assert_eq!(decoded.count, 3);
        assert_eq!(decoded.state.data_version(), 1);
        assert!(decoded.state.future_data().is_empty());
    }

    #[test]
    fn older_reader_preserves_newer_properties() {
        let ctx = PofContext::new();

        // A v2 peer encodes all three properties.
        let mut v2 = GreetV2::default();
        v2.state.set_impl_version(2);
        v2.name = Some("world".into());
        v2.count = 3;
        v2.emphatic = true;
        let mut buf = WriteBuffer::new();
        encode_body(&v2, &ctx, &mut buf).unwrap();
        let v2_bytes = buf.into_bytes();

        // A v1 peer decodes it, understanding only two of them.
        let f1 = v1_factory();
        let mut read = ReadBuffer::new(v2_bytes.clone());
        let decoded = decode_body(&f1, &ctx, &mut read).unwrap();
        assert_eq!(decoded.state().data_version(), 2);
        assert!(!decoded.state().future_data().is_empty());

        // Re-encoding through v1 reproduces the v2 bytes exactly: the
        // unknown property rides along as future data and the frame keeps
        // the newer version id.
        let mut rebuf = WriteBuffer::new();
        encode_body(decoded.as_ref(), &ctx, &mut rebuf).unwrap();
        assert_eq!(rebuf.as_slice(), &v2_bytes[..]);
    }

    #[test]
    fn binding_is_immutable_after_first_set() {
        let mut state = MessageState::default();
        state.bind(7).unwrap();
        // Re-binding the same channel is the partial-response re-send path.
        state.bind(7).unwrap();
        assert!(matches!(state.bind(8), Err(Error::IllegalState(_))));
        assert_eq!(state.channel(), Some(7));
    }

    #[test]
    fn response_state_roundtrip_with_cookie() {
        let ctx = PofContext::new();
        let mut buf = WriteBuffer::new();
        {
            let mut w = PofWriter::new(&mut buf, &ctx);
            let state = ResponseState {
                request_id: 11,
                failure: false,
                result: Value::I32(42),
                cookie: Some(Bytes::from_static(b"more")),
            };
            state.write_to(&mut w).unwrap();
            w.finish().unwrap();
        }
        let mut read = ReadBuffer::new(buf.into_bytes());
        let mut r = PofReader::new(&mut read, &ctx);
        let mut state = ResponseState::default();
        state.read_from(&mut r).unwrap();
        assert_eq!(state.request_id, 11);
        assert!(!state.failure);
        assert_eq!(state.result, Value::I32(42));
        assert_eq!(state.cookie.as_deref(), Some(&b"more"[..]));
    }
}
