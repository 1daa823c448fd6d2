// src/pof/writer.rs

//! POF encoder: tagged values and user-type property frames.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

use crate::buffer::WriteBuffer;
use crate::error::{Error, Result};

use super::{tag, PofContext, UserValue, Value, TERMINATOR_INDEX};

/// Streaming encoder for one user-type frame (or one standalone value).
///
/// Property writes must use strictly ascending non-negative indexes; the
/// frame is completed by [`PofWriter::finish`], which emits the terminator.
/// Identity ids for shared nodes are scoped to the writer, i.e. to a single
/// encoded graph.
pub struct PofWriter<'a> {
    buf: &'a mut WriteBuffer,
    ctx: &'a PofContext,
    /// Identity id per shared node, keyed by allocation address.
    refs: HashMap<usize, i32>,
    next_ref: i32,
    prev_index: i32,
}

impl<'a> PofWriter<'a> {
    pub fn new(buf: &'a mut WriteBuffer, ctx: &'a PofContext) -> Self {
        PofWriter {
            buf,
            ctx,
            refs: HashMap::new(),
            next_ref: 0,
            prev_index: -1,
        }
    }

    /// Write the `[typeId][versionId]` header of a user-type frame.
    pub fn begin_user_type(&mut self, type_id: i32, version: i32) -> Result<()> {
        if type_id < 0 {
            return Err(Error::IllegalState("user type id must be non-negative"));
        }
        if version < 0 {
            return Err(Error::VersionNegative(version));
        }
        self.buf.write_packed_i32(type_id);
        self.buf.write_packed_i32(version);
        Ok(())
    }

    /// Append preserved future-data bytes verbatim. Must come after every
    /// recognized property and before [`PofWriter::finish`].
    pub fn write_remainder(&mut self, tail: &Bytes) {
        self.buf.write_bytes(tail);
    }

    /// Terminate the frame.
    pub fn finish(self) -> Result<()> {
        self.buf.write_packed_i32(TERMINATOR_INDEX);
        Ok(())
    }

    fn property_index(&mut self, index: i32) -> Result<()> {
        if index < 0 {
            return Err(Error::IllegalState("property index must be non-negative"));
        }
        if index <= self.prev_index {
            return Err(Error::IllegalState("property index out of order"));
        }
        self.prev_index = index;
        self.buf.write_packed_i32(index);
        Ok(())
    }

    pub fn write_bool(&mut self, index: i32, v: bool) -> Result<()> {
        self.property_index(index)?;
        self.tag_bool(v);
        Ok(())
    }

    pub fn write_octet(&mut self, index: i32, v: u8) -> Result<()> {
        self.property_index(index)?;
        self.buf.write_packed_i32(tag::OCTET);
        self.buf.write_u8(v);
        Ok(())
    }

    pub fn write_i32(&mut self, index: i32, v: i32) -> Result<()> {
        self.property_index(index)?;
        self.buf.write_packed_i32(tag::INT32);
        self.buf.write_packed_i32(v);
        Ok(())
    }

    pub fn write_i64(&mut self, index: i32, v: i64) -> Result<()> {
        self.property_index(index)?;
        self.buf.write_packed_i32(tag::INT64);
        self.buf.write_packed_i64(v);
        Ok(())
    }

    /// `None` writes the null tag, preserving the null/empty distinction.
    pub fn write_string(&mut self, index: i32, v: Option<&str>) -> Result<()> {
        self.property_index(index)?;
        match v {
            None => self.buf.write_packed_i32(tag::NULL),
            Some(s) => {
                self.buf.write_packed_i32(tag::STRING);
                self.buf.write_string(Some(s));
            }
        }
        Ok(())
    }

    pub fn write_binary(&mut self, index: i32, v: Option<&Bytes>) -> Result<()> {
        self.property_index(index)?;
        match v {
            None => self.buf.write_packed_i32(tag::NULL),
            Some(b) => {
                self.buf.write_packed_i32(tag::BINARY);
                self.buf.write_packed_i32(b.len() as i32);
                self.buf.write_bytes(b);
            }
        }
        Ok(())
    }

    pub fn write_uuid(&mut self, index: i32, v: uuid::Uuid) -> Result<()> {
        self.property_index(index)?;
        self.buf.write_packed_i32(tag::UUID);
        self.buf.write_bytes(v.as_bytes());
        Ok(())
    }

    /// Tagged property of any value shape.
    pub fn write_value(&mut self, index: i32, v: &Value) -> Result<()> {
        self.property_index(index)?;
        self.write_tagged(v)
    }

    fn tag_bool(&mut self, v: bool) {
        self.buf
            .write_packed_i32(if v { tag::BOOL_TRUE } else { tag::BOOL_FALSE });
    }

    /// Encode one tagged value at the current position.
    pub fn write_tagged(&mut self, v: &Value) -> Result<()> {
        match v {
            Value::Null => self.buf.write_packed_i32(tag::NULL),
            Value::Bool(b) => self.tag_bool(*b),
            Value::Octet(b) => {
                self.buf.write_packed_i32(tag::OCTET);
                self.buf.write_u8(*b);
            }
            Value::Char(c) => {
                self.buf.write_packed_i32(tag::CHAR);
                self.buf.write_packed_i32(*c as i32);
            }
            Value::I16(n) => {
                self.buf.write_packed_i32(tag::INT16);
                self.buf.write_packed_i32(*n as i32);
            }
            Value::I32(n) => {
                self.buf.write_packed_i32(tag::INT32);
                self.buf.write_packed_i32(*n);
            }
            Value::I64(n) => {
                self.buf.write_packed_i32(tag::INT64);
                self.buf.write_packed_i64(*n);
            }
            Value::I128(n) => {
                self.buf.write_packed_i32(tag::INT128);
                self.buf.write_packed_i128(*n);
            }
            Value::F32(n) => {
                self.buf.write_packed_i32(tag::FLOAT32);
                self.buf.write_f32(*n);
            }
            Value::F64(n) => {
                self.buf.write_packed_i32(tag::FLOAT64);
                self.buf.write_f64(*n);
            }
            Value::Decimal(d) => {
                self.buf.write_packed_i32(tag::DECIMAL);
                self.buf.write_packed_i128(d.unscaled);
                self.buf.write_packed_i32(d.scale);
            }
            Value::String(s) => {
                self.buf.write_packed_i32(tag::STRING);
                self.buf.write_string(Some(s));
            }
            Value::Binary(b) => {
                self.buf.write_packed_i32(tag::BINARY);
                self.buf.write_packed_i32(b.len() as i32);
                self.buf.write_bytes(b);
            }
            Value::DateTime(d) => {
                self.buf.write_packed_i32(tag::DATETIME);
                self.buf.write_packed_i32(d.year as i32);
                self.buf.write_u8(d.month);
                self.buf.write_u8(d.day);
                self.buf.write_u8(d.hour);
                self.buf.write_u8(d.minute);
                self.buf.write_u8(d.second);
                self.buf.write_packed_i32(d.nano as i32);
            }
            Value::TimeSpan(t) => {
                self.buf.write_packed_i32(tag::TIMESPAN);
                self.buf.write_packed_i64(t.nanos);
            }
            Value::Uuid(u) => {
                self.buf.write_packed_i32(tag::UUID);
                self.buf.write_bytes(u.as_bytes());
            }
            Value::Array(vs) => {
                self.buf.write_packed_i32(tag::ARRAY);
                self.buf.write_packed_i32(vs.len() as i32);
                for v in vs {
                    self.write_tagged(v)?;
                }
            }
            Value::UserType(u) => self.write_user_value(u)?,
            Value::Shared(inner) => self.write_shared(inner)?,
        }
        Ok(())
    }

    fn write_shared(&mut self, inner: &Arc<Value>) -> Result<()> {
        if !self.ctx.references_enabled() {
            // Tree-shape rewrite: sharing is flattened away.
            return self.write_tagged(inner);
        }
        let key = Arc::as_ptr(inner) as usize;
        if let Some(id) = self.refs.get(&key) {
            self.buf.write_packed_i32(tag::REFERENCE);
            self.buf.write_packed_i32(*id);
            return Ok(());
        }
        let id = self.next_ref;
        self.next_ref += 1;
        self.refs.insert(key, id);
        self.buf.write_packed_i32(tag::IDENTITY);
        self.buf.write_packed_i32(id);
        self.write_tagged(inner)
    }

    fn write_user_value(&mut self, u: &UserValue) -> Result<()> {
        if u.type_id < 0 {
            return Err(Error::IllegalState("user type id must be non-negative"));
        }
        if u.version < 0 {
            return Err(Error::VersionNegative(u.version));
        }
        self.buf.write_packed_i32(u.type_id);
        self.buf.write_packed_i32(u.version);
        let mut prev = -1i32;
        for (index, value) in &u.props {
            if *index < 0 || *index <= prev {
                return Err(Error::IllegalState("property index out of order"));
            }
            prev = *index;
            self.buf.write_packed_i32(*index);
            self.write_tagged(value)?;
        }
        self.buf.write_bytes(&u.remainder);
        self.buf.write_packed_i32(TERMINATOR_INDEX);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascending_index_enforced() {
        let ctx = PofContext::new();
        let mut buf = WriteBuffer::new();
        let mut w = PofWriter::new(&mut buf, &ctx);
        w.write_i32(0, 1).unwrap();
        w.write_i32(3, 2).unwrap();
        assert!(matches!(w.write_i32(3, 3), Err(Error::IllegalState(_))));
        assert!(matches!(w.write_i32(1, 4), Err(Error::IllegalState(_))));
        assert!(matches!(w.write_i32(-1, 5), Err(Error::IllegalState(_))));
    }

    #[test]
    fn negative_version_rejected() {
        let ctx = PofContext::new();
        let mut buf = WriteBuffer::new();
        let mut w = PofWriter::new(&mut buf, &ctx);
        assert!(matches!(
            w.begin_user_type(5, -2),
            Err(Error::VersionNegative(-2))
        ));
    }

    #[test]
    fn bool_is_tag_only() {
        let ctx = PofContext::new();
        let mut buf = WriteBuffer::new();
        let mut w = PofWriter::new(&mut buf, &ctx);
        w.write_tagged(&Value::Bool(true)).unwrap();
        w.write_tagged(&Value::Bool(false)).unwrap();
        // Two packed tags, no payload bytes.
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn disabled_references_flatten() {
        let ctx = PofContext::new();
        let shared = Arc::new(Value::I32(5));
        let graph = Value::Array(vec![
            Value::Shared(shared.clone()),
            Value::Shared(shared),
        ]);

        let mut flat = WriteBuffer::new();
        PofWriter::new(&mut flat, &ctx).write_tagged(&graph).unwrap();

        let mut tree = WriteBuffer::new();
        PofWriter::new(&mut tree, &ctx)
            .write_tagged(&Value::Array(vec![Value::I32(5), Value::I32(5)]))
            .unwrap();

        assert_eq!(flat.as_slice(), tree.as_slice());
    }

    #[test]
    fn enabled_references_backreference() {
        let ctx = PofContext::with_references();
        let shared = Arc::new(Value::String("payload".into()));
        let graph = Value::Array(vec![
            Value::Shared(shared.clone()),
            Value::Shared(shared),
        ]);

        let mut with_refs = WriteBuffer::new();
        PofWriter::new(&mut with_refs, &ctx)
            .write_tagged(&graph)
            .unwrap();

        let mut without = WriteBuffer::new();
        PofWriter::new(&mut without, &PofContext::new())
            .write_tagged(&graph)
            .unwrap();

        // The back-reference is smaller than a second copy of the string.
        assert!(with_refs.len() < without.len());
    }
}
