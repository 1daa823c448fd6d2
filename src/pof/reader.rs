// src/pof/reader.rs

//! POF decoder: tagged values, property navigation, future-data capture.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

use crate::buffer::ReadBuffer;
use crate::error::{Error, Result};

use super::{tag, DateTime, Decimal, PofContext, TimeSpan, UserValue, Value, TERMINATOR_INDEX};

/// Streaming decoder for one user-type frame (or one standalone value).
///
/// Property reads navigate forward only: a requested index either matches
/// the next property in the stream, lies beyond it (intervening properties
/// are skipped), or is absent (the stream is already past it and the typed
/// readers yield their default). [`PofReader::read_remainder`] captures
/// everything between the last recognized property and the terminator,
/// verbatim, as the value's future data.
pub struct PofReader<'a> {
    buf: &'a mut ReadBuffer,
    ctx: &'a PofContext,
    /// Decoded shared nodes by identity id.
    refs: HashMap<i32, Arc<Value>>,
    /// A property index consumed from the stream but not yet claimed,
    /// with the buffer position where its encoding starts.
    pending: Option<(i32, usize)>,
    /// Terminator reached.
    done: bool,
}

impl<'a> PofReader<'a> {
    pub fn new(buf: &'a mut ReadBuffer, ctx: &'a PofContext) -> Self {
        PofReader {
            buf,
            ctx,
            refs: HashMap::new(),
            pending: None,
            done: false,
        }
    }

    /// Read the `[typeId][versionId]` header of a user-type frame.
    pub fn begin_user_type(&mut self) -> Result<(i32, i32)> {
        let type_id = self.buf.read_packed_i32()?;
        if type_id < 0 {
            return Err(Error::encoding(format!(
                "negative user type id {}",
                type_id
            )));
        }
        let version = self.buf.read_packed_i32()?;
        if version < 0 {
            return Err(Error::VersionNegative(version));
        }
        Ok((type_id, version))
    }

    /// Next property index in the stream, or `None` at the terminator.
    fn next_index(&mut self) -> Result<Option<(i32, usize)>> {
        if self.done {
            return Ok(None);
        }
        if let Some(pending) = self.pending.take() {
            return Ok(Some(pending));
        }
        if self.buf.is_exhausted() {
            return Err(Error::TruncatedFrame);
        }
        let start = self.buf.position();
        let index = self.buf.read_packed_i32()?;
        if index == TERMINATOR_INDEX {
            self.done = true;
            return Ok(None);
        }
        if index < 0 {
            return Err(Error::encoding(format!("invalid property index {}", index)));
        }
        Ok(Some((index, start)))
    }

    /// Position the stream at the requested property. Returns false when the
    /// property is absent (stream already past it, or frame terminated).
    fn advance_to(&mut self, index: i32) -> Result<bool> {
        loop {
            match self.next_index()? {
                None => return Ok(false),
                Some((i, _)) if i == index => return Ok(true),
                Some((i, start)) if i > index => {
                    self.pending = Some((i, start));
                    return Ok(false);
                }
                Some(_) => self.skip_tagged()?,
            }
        }
    }

    /// Typed property readers. Absent properties yield the type's default.
    pub fn read_bool(&mut self, index: i32) -> Result<bool> {
        if !self.advance_to(index)? {
            return Ok(false);
        }
        self.read_tagged()?
            .as_bool()
            .ok_or_else(|| Error::encoding("expected boolean property"))
    }

    pub fn read_octet(&mut self, index: i32) -> Result<u8> {
        if !self.advance_to(index)? {
            return Ok(0);
        }
        match self.read_tagged()?.unshared() {
            Value::Octet(v) => Ok(*v),
            _ => Err(Error::encoding("expected octet property")),
        }
    }

    pub fn read_i32(&mut self, index: i32) -> Result<i32> {
        if !self.advance_to(index)? {
            return Ok(0);
        }
        self.read_tagged()?
            .as_i32()
            .ok_or_else(|| Error::encoding("expected int32 property"))
    }

    pub fn read_i64(&mut self, index: i32) -> Result<i64> {
        if !self.advance_to(index)? {
            return Ok(0);
        }
        self.read_tagged()?
            .as_i64()
            .ok_or_else(|| Error::encoding("expected int64 property"))
    }

    pub fn read_string(&mut self, index: i32) -> Result<Option<String>> {
        if !self.advance_to(index)? {
            return Ok(None);
        }
        match self.read_tagged()? {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(s)),
            _ => Err(Error::encoding("expected string property")),
        }
    }

    pub fn read_binary(&mut self, index: i32) -> Result<Option<Bytes>> {
        if !self.advance_to(index)? {
            return Ok(None);
        }
        match self.read_tagged()? {
            Value::Null => Ok(None),
            Value::Binary(b) => Ok(Some(b)),
            _ => Err(Error::encoding("expected binary property")),
        }
    }

    pub fn read_uuid(&mut self, index: i32) -> Result<Option<uuid::Uuid>> {
        if !self.advance_to(index)? {
            return Ok(None);
        }
        match self.read_tagged()? {
            Value::Null => Ok(None),
            Value::Uuid(u) => Ok(Some(u)),
            _ => Err(Error::encoding("expected uuid property")),
        }
    }

    pub fn read_value(&mut self, index: i32) -> Result<Value> {
        if !self.advance_to(index)? {
            return Ok(Value::Null);
        }
        self.read_tagged()
    }

    /// Capture every remaining property byte, verbatim, up to (excluding)
    /// the terminator, consuming the frame.
    pub fn read_remainder(&mut self) -> Result<Bytes> {
        if self.done {
            return Ok(Bytes::new());
        }
        let start = match self.pending {
            Some((_, pos)) => pos,
            None => self.buf.position(),
        };
        loop {
            match self.next_index()? {
                None => {
                    // Terminator is a single byte; the span ends before it.
                    let end = self.buf.position() - 1;
                    return Ok(self.buf.slice_between(start, end));
                }
                Some(_) => self.skip_tagged()?,
            }
        }
    }

    /// Decode one tagged value at the current position.
    pub fn read_tagged(&mut self) -> Result<Value> {
        let t = self.buf.read_packed_i32()?;
        if t >= 0 {
            return self.read_user_value(t);
        }
        match t {
            tag::NULL => Ok(Value::Null),
            tag::BOOL_FALSE => Ok(Value::Bool(false)),
            tag::BOOL_TRUE => Ok(Value::Bool(true)),
            tag::OCTET => Ok(Value::Octet(self.buf.read_u8()?)),
            tag::CHAR => {
                let code = self.buf.read_packed_i32()?;
                let c = u32::try_from(code)
                    .ok()
                    .and_then(char::from_u32)
                    .ok_or_else(|| Error::encoding(format!("invalid char code {}", code)))?;
                Ok(Value::Char(c))
            }
            tag::INT16 => {
                let v = self.buf.read_packed_i32()?;
                let v = i16::try_from(v)
                    .map_err(|_| Error::encoding(format!("int16 out of range: {}", v)))?;
                Ok(Value::I16(v))
            }
            tag::INT32 => Ok(Value::I32(self.buf.read_packed_i32()?)),
            tag::INT64 => Ok(Value::I64(self.buf.read_packed_i64()?)),
            tag::INT128 => Ok(Value::I128(self.buf.read_packed_i128()?)),
            tag::FLOAT32 => Ok(Value::F32(self.buf.read_f32()?)),
            tag::FLOAT64 => Ok(Value::F64(self.buf.read_f64()?)),
            tag::DECIMAL => {
                let unscaled = self.buf.read_packed_i128()?;
                let scale = self.buf.read_packed_i32()?;
                Ok(Value::Decimal(Decimal { unscaled, scale }))
            }
            tag::STRING => {
                let s = self
                    .buf
                    .read_string()?
                    .ok_or_else(|| Error::encoding("null length under string tag"))?;
                Ok(Value::String(s))
            }
            tag::BINARY => {
                let len = self.buf.read_packed_i32()?;
                if len < 0 {
                    return Err(Error::encoding(format!("invalid binary length {}", len)));
                }
                Ok(Value::Binary(self.buf.read_slice(len as usize)?))
            }
            tag::DATETIME => {
                let year = self.buf.read_packed_i32()?;
                let year = i16::try_from(year)
                    .map_err(|_| Error::encoding(format!("year out of range: {}", year)))?;
                let month = self.buf.read_u8()?;
                let day = self.buf.read_u8()?;
                let hour = self.buf.read_u8()?;
                let minute = self.buf.read_u8()?;
                let second = self.buf.read_u8()?;
                let nano = self.buf.read_packed_i32()?;
                let nano = u32::try_from(nano)
                    .map_err(|_| Error::encoding(format!("nanos out of range: {}", nano)))?;
                Ok(Value::DateTime(DateTime {
                    year,
                    month,
                    day,
                    hour,
                    minute,
                    second,
                    nano,
                }))
            }
            tag::TIMESPAN => Ok(Value::TimeSpan(TimeSpan {
                nanos: self.buf.read_packed_i64()?,
            })),
            tag::UUID => {
                let raw = self.buf.read_slice(16)?;
                let mut bytes = [0u8; 16];
                bytes.copy_from_slice(&raw);
                Ok(Value::Uuid(uuid::Uuid::from_bytes(bytes)))
            }
            tag::ARRAY => {
                let count = self.buf.read_packed_i32()?;
                if count < 0 {
                    return Err(Error::encoding(format!("invalid array length {}", count)));
                }
                let mut out = Vec::with_capacity(count.min(1024) as usize);
                for _ in 0..count {
                    out.push(self.read_tagged()?);
                }
                Ok(Value::Array(out))
            }
            tag::IDENTITY => {
                if !self.ctx.references_enabled() {
                    return Err(Error::encoding(
                        "identity tag on a stream with references disabled",
                    ));
                }
                let id = self.buf.read_packed_i32()?;
                let inner = Arc::new(self.read_tagged()?);
                self.refs.insert(id, inner.clone());
                Ok(Value::Shared(inner))
            }
            tag::REFERENCE => {
                if !self.ctx.references_enabled() {
                    return Err(Error::encoding(
                        "reference tag on a stream with references disabled",
                    ));
                }
                let id = self.buf.read_packed_i32()?;
                let inner = self
                    .refs
                    .get(&id)
                    .ok_or_else(|| Error::encoding(format!("unknown reference id {}", id)))?;
                Ok(Value::Shared(inner.clone()))
            }
            other => Err(Error::encoding(format!("unknown type tag {}", other))),
        }
    }

    /// Decode a user-type frame whose type has no registered shape: every
    /// property is captured generically and the tail is empty by
    /// construction (all properties are consumed).
    fn read_user_value(&mut self, type_id: i32) -> Result<Value> {
        let version = self.buf.read_packed_i32()?;
        if version < 0 {
            return Err(Error::VersionNegative(version));
        }
        let mut props = Vec::new();
        let mut prev = -1i32;
        loop {
            if self.buf.is_exhausted() {
                return Err(Error::TruncatedFrame);
            }
            let index = self.buf.read_packed_i32()?;
            if index == TERMINATOR_INDEX {
                break;
            }
            if index < 0 || index <= prev {
                return Err(Error::encoding(format!(
                    "invalid property index {}",
                    index
                )));
            }
            prev = index;
            let value = self.read_tagged()?;
            props.push((index, value));
        }
        Ok(Value::UserType(UserValue {
            type_id,
            version,
            props,
            remainder: Bytes::new(),
        }))
    }

    /// Skip one tagged value without materializing it.
    fn skip_tagged(&mut self) -> Result<()> {
        let t = self.buf.read_packed_i32()?;
        if t >= 0 {
            // Nested user-type frame: version, properties, terminator.
            let version = self.buf.read_packed_i32()?;
            if version < 0 {
                return Err(Error::VersionNegative(version));
            }
            loop {
                if self.buf.is_exhausted() {
                    return Err(Error::TruncatedFrame);
                }
                let index = self.buf.read_packed_i32()?;
                if index == TERMINATOR_INDEX {
                    return Ok(());
                }
                self.skip_tagged()?;
            }
        }
        match t {
            tag::NULL | tag::BOOL_FALSE | tag::BOOL_TRUE => Ok(()),
            tag::OCTET => self.buf.read_u8().map(drop),
            tag::CHAR | tag::INT16 | tag::INT32 => self.buf.read_packed_i32().map(drop),
            tag::INT64 | tag::TIMESPAN => self.buf.read_packed_i64().map(drop),
            tag::INT128 => self.buf.read_packed_i128().map(drop),
            tag::FLOAT32 => self.buf.read_f32().map(drop),
            tag::FLOAT64 => self.buf.read_f64().map(drop),
            tag::DECIMAL => {
                self.buf.read_packed_i128()?;
                self.buf.read_packed_i32().map(drop)
            }
            tag::STRING => self.buf.read_string().map(drop),
            tag::BINARY => {
                let len = self.buf.read_packed_i32()?;
                if len < 0 {
                    return Err(Error::encoding(format!("invalid binary length {}", len)));
                }
                self.buf.read_slice(len as usize).map(drop)
            }
            tag::DATETIME => {
                self.buf.read_packed_i32()?;
                self.buf.read_slice(5)?;
                self.buf.read_packed_i32().map(drop)
            }
            tag::UUID => self.buf.read_slice(16).map(drop),
            tag::ARRAY => {
                let count = self.buf.read_packed_i32()?;
                if count < 0 {
                    return Err(Error::encoding(format!("invalid array length {}", count)));
                }
                for _ in 0..count {
                    self.skip_tagged()?;
                }
                Ok(())
            }
            tag::IDENTITY => {
                // Skipped identities stay resolvable for later references.
                if !self.ctx.references_enabled() {
                    return Err(Error::encoding(
                        "identity tag on a stream with references disabled",
                    ));
                }
                let id = self.buf.read_packed_i32()?;
                let inner = Arc::new(self.read_tagged()?);
                self.refs.insert(id, inner);
                Ok(())
            }
            tag::REFERENCE => self.buf.read_packed_i32().map(drop),
            other => Err(Error::encoding(format!("unknown type tag {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::WriteBuffer;
    use crate::pof::{PofWriter, Serializer};

    fn roundtrip(ctx: &PofContext, v: &Value) -> Value {
        let mut buf = WriteBuffer::new();
        ctx.serialize(&mut buf, v).unwrap();
        let mut read = ReadBuffer::new(buf.into_bytes());
        let out = ctx.deserialize(&mut read).unwrap();
        assert!(read.is_exhausted(), "value not fully consumed");
        out
    }

    #[test]
    fn scalar_roundtrips() {
        let ctx = PofContext::new();
        let values = [
            Value::Null,
            Value::Bool(true),
            Value::Bool(false),
            Value::Octet(0xAB),
            Value::Char('é'),
            Value::I16(-300),
            Value::I32(1 << 20),
            Value::I64(-(1i64 << 40)),
            Value::I128(i128::MAX),
            Value::F32(3.5),
            Value::F64(-0.125),
            Value::Decimal(Decimal {
                unscaled: 123_450,
                scale: 3,
            }),
            Value::String("héllo".into()),
            Value::Binary(Bytes::from_static(b"\x00\x01\x02")),
            Value::DateTime(DateTime {
                year: 2024,
                month: 6,
                day: 30,
                hour: 23,
                minute: 59,
                second: 58,
                nano: 999_999_999,
            }),
            Value::TimeSpan(TimeSpan { nanos: -42 }),
            Value::Uuid(uuid::Uuid::from_bytes([7; 16])),
            Value::Array(vec![Value::I32(1), Value::String("two".into())]),
        ];
        for v in values {
            assert_eq!(roundtrip(&ctx, &v), v);
        }
    }

    #[test]
    fn user_value_roundtrip() {
        let ctx = PofContext::new();
        let v = Value::UserType(UserValue {
            type_id: 1000,
            version: 2,
            props: vec![(0, Value::I32(7)), (2, Value::String("x".into()))],
            remainder: Bytes::new(),
        });
        assert_eq!(roundtrip(&ctx, &v), v);
    }

    #[test]
    fn shared_identity_preserved() {
        let ctx = PofContext::with_references();
        let shared = Arc::new(Value::String("big".into()));
        let graph = Value::Array(vec![
            Value::Shared(shared.clone()),
            Value::Shared(shared),
        ]);
        let out = roundtrip(&ctx, &graph);
        match out {
            Value::Array(items) => match (&items[0], &items[1]) {
                (Value::Shared(a), Value::Shared(b)) => {
                    assert!(Arc::ptr_eq(a, b), "identity must survive the roundtrip");
                    assert_eq!(**a, Value::String("big".into()));
                }
                other => panic!("expected shared nodes, got {:?}", other),
            },
            other => panic!("expected array, got {:?}", other),
        }
    }

    #[test]
    fn reference_tags_rejected_when_disabled() {
        let with_refs = PofContext::with_references();
        let shared = Arc::new(Value::I32(1));
        let graph = Value::Array(vec![
            Value::Shared(shared.clone()),
            Value::Shared(shared),
        ]);
        let mut buf = WriteBuffer::new();
        with_refs.serialize(&mut buf, &graph).unwrap();

        let plain = PofContext::new();
        let mut read = ReadBuffer::new(buf.into_bytes());
        assert!(matches!(
            plain.deserialize(&mut read),
            Err(Error::InvalidEncoding(_))
        ));
    }

    #[test]
    fn absent_properties_yield_defaults() {
        let ctx = PofContext::new();
        let mut buf = WriteBuffer::new();
        let mut w = PofWriter::new(&mut buf, &ctx);
        w.write_i32(1, 42).unwrap();
        w.finish().unwrap();

        let mut read = ReadBuffer::new(buf.into_bytes());
        let mut r = PofReader::new(&mut read, &ctx);
        assert_eq!(r.read_i32(0).unwrap(), 0);
        assert_eq!(r.read_i32(1).unwrap(), 42);
        assert_eq!(r.read_string(2).unwrap(), None);
        assert_eq!(r.read_remainder().unwrap(), Bytes::new());
    }

    #[test]
    fn unknown_tail_captured_verbatim() {
        let ctx = PofContext::new();

        // A newer writer emits properties 0, 1 and 5.
        let mut buf = WriteBuffer::new();
        let mut w = PofWriter::new(&mut buf, &ctx);
        w.write_i32(0, 10).unwrap();
        w.write_string(1, Some("keep")).unwrap();
        w.write_value(5, &Value::Array(vec![Value::I64(9)])).unwrap();
        w.finish().unwrap();
        let encoded = buf.into_bytes();

        // An older reader only understands properties 0 and 1.
        let mut read = ReadBuffer::new(encoded.clone());
        let mut r = PofReader::new(&mut read, &ctx);
        assert_eq!(r.read_i32(0).unwrap(), 10);
        assert_eq!(r.read_string(1).unwrap().as_deref(), Some("keep"));
        let tail = r.read_remainder().unwrap();
        assert!(!tail.is_empty());

        // Re-encoding the known properties plus the tail reproduces the
        // newer writer's bytes exactly.
        let mut rebuf = WriteBuffer::new();
        let mut rw = PofWriter::new(&mut rebuf, &ctx);
        rw.write_i32(0, 10).unwrap();
        rw.write_string(1, Some("keep")).unwrap();
        rw.write_remainder(&tail);
        rw.finish().unwrap();
        assert_eq!(rebuf.as_slice(), &encoded[..]);
    }

    #[test]
    fn remainder_capture_with_pending_lookahead() {
        let ctx = PofContext::new();
        let mut buf = WriteBuffer::new();
        let mut w = PofWriter::new(&mut buf, &ctx);
        w.write_i32(0, 1).unwrap();
        w.write_i32(7, 2).unwrap();
        w.finish().unwrap();

        let mut read = ReadBuffer::new(buf.into_bytes());
        let mut r = PofReader::new(&mut read, &ctx);
        assert_eq!(r.read_i32(0).unwrap(), 1);
        // Requesting property 3 walks past it to 7, which becomes pending
        // lookahead; the remainder must still include property 7.
        assert_eq!(r.read_i32(3).unwrap(), 0);
        let tail = r.read_remainder().unwrap();

        let mut reread = ReadBuffer::new(tail);
        assert_eq!(reread.read_packed_i32().unwrap(), 7);
        assert_eq!(reread.read_packed_i32().unwrap(), tag::INT32);
        assert_eq!(reread.read_packed_i32().unwrap(), 2);
        assert!(reread.is_exhausted());
    }

    #[test]
    fn missing_terminator_is_truncated_frame() {
        let ctx = PofContext::new();
        let mut buf = WriteBuffer::new();
        let mut w = PofWriter::new(&mut buf, &ctx);
        w.write_i32(0, 5).unwrap();
        // No finish(): terminator absent.
        let mut read = ReadBuffer::new(buf.into_bytes());
        let mut r = PofReader::new(&mut read, &ctx);
        assert_eq!(r.read_i32(0).unwrap(), 5);
        assert!(matches!(r.read_remainder(), Err(Error::TruncatedFrame)));
    }

    #[test]
    fn begin_user_type_validates_versions() {
        let ctx = PofContext::new();
        let mut buf = WriteBuffer::new();
        buf.write_packed_i32(12);
        buf.write_packed_i32(-3);
        let mut read = ReadBuffer::new(buf.into_bytes());
        let mut r = PofReader::new(&mut read, &ctx);
        assert!(matches!(
            r.begin_user_type(),
            Err(Error::VersionNegative(-3))
        ));
    }
}
