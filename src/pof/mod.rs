// src/pof/mod.rs

//! Portable Object Format: the self-describing, versioned binary value
//! encoding used for every message body.
//!
//! Values are type-tagged. A small set of intrinsic scalar types gets
//! dedicated tags so decoders allocate nothing beyond the scalar; everything
//! else travels as a user-type frame
//! `[typeId][versionId][indexed properties][terminator][remainder]` whose
//! property indexes are strictly ascending and whose unread tail is
//! preserved verbatim as future data (the evolvable contract).
//!
//! Identity-preserving references across one encoded graph are a per-stream
//! toggle on [`PofContext`]; with the toggle off the graph is rewritten
//! tree-shape and reference tags are rejected on decode.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use uuid::Uuid;

use crate::buffer::{ReadBuffer, WriteBuffer};
use crate::error::Result;

mod reader;
mod writer;

pub use reader::PofReader;
pub use writer::PofWriter;

/// Value type tags. Intrinsics are negative; non-negative tags are user
/// type ids.
pub mod tag {
    pub const NULL: i32 = -1;
    pub const BOOL_FALSE: i32 = -2;
    pub const BOOL_TRUE: i32 = -3;
    pub const OCTET: i32 = -4;
    pub const CHAR: i32 = -5;
    pub const INT16: i32 = -6;
    pub const INT32: i32 = -7;
    pub const INT64: i32 = -8;
    pub const INT128: i32 = -9;
    pub const FLOAT32: i32 = -10;
    pub const FLOAT64: i32 = -11;
    pub const DECIMAL: i32 = -12;
    pub const STRING: i32 = -13;
    pub const BINARY: i32 = -14;
    pub const DATETIME: i32 = -15;
    pub const TIMESPAN: i32 = -16;
    pub const UUID: i32 = -17;
    pub const ARRAY: i32 = -18;
    /// First occurrence of a shared node: tag, identity id, then the value.
    pub const IDENTITY: i32 = -19;
    /// Back-reference to a previously decoded identity id.
    pub const REFERENCE: i32 = -20;
}

/// Property index that terminates a user-type frame. Always packs into a
/// single byte.
pub const TERMINATOR_INDEX: i32 = -1;

/// Arbitrary-precision-ish decimal: an unscaled 128-bit integer and a
/// base-10 scale. `unscaled = 12345, scale = 2` is 123.45.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decimal {
    pub unscaled: i128,
    pub scale: i32,
}

/// Calendar date-time down to nanoseconds, no zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateTime {
    pub year: i16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub nano: u32,
}

/// Signed elapsed time in nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSpan {
    pub nanos: i64,
}

/// A decoded user-type frame that no concrete type claimed: its identity,
/// every property in index order, and the preserved future-data tail.
#[derive(Debug, Clone, PartialEq)]
pub struct UserValue {
    pub type_id: i32,
    pub version: i32,
    pub props: Vec<(i32, Value)>,
    pub remainder: Bytes,
}

/// The self-describing value model mirroring the intrinsic tag set.
///
/// [`Value::Shared`] nodes are the unit of identity preservation: with
/// references enabled on the stream, a shared node is encoded once and
/// back-referenced afterwards, and decoding yields `Shared` values that
/// point at one allocation.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Octet(u8),
    Char(char),
    I16(i16),
    I32(i32),
    I64(i64),
    I128(i128),
    F32(f32),
    F64(f64),
    Decimal(Decimal),
    String(String),
    Binary(Bytes),
    DateTime(DateTime),
    TimeSpan(TimeSpan),
    Uuid(Uuid),
    Array(Vec<Value>),
    UserType(UserValue),
    Shared(Arc<Value>),
}

impl Value {
    /// True for `Null` (after unwrapping sharing).
    pub fn is_null(&self) -> bool {
        matches!(self.unshared(), Value::Null)
    }

    /// Strip `Shared` wrappers.
    pub fn unshared(&self) -> &Value {
        let mut v = self;
        while let Value::Shared(inner) = v {
            v = inner;
        }
        v
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self.unshared() {
            Value::Octet(v) => Some(*v as i32),
            Value::I16(v) => Some(*v as i32),
            Value::I32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self.unshared() {
            Value::I64(v) => Some(*v),
            other => other.as_i32().map(|v| v as i64),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.unshared() {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self.unshared() {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self.unshared() {
            Value::Array(vs) => Some(vs),
            _ => None,
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Octet(v) => write!(f, "{}", v),
            Value::Char(v) => write!(f, "{:?}", v),
            Value::I16(v) => write!(f, "{}", v),
            Value::I32(v) => write!(f, "{}", v),
            Value::I64(v) => write!(f, "{}", v),
            Value::I128(v) => write!(f, "{}", v),
            Value::F32(v) => write!(f, "{}", v),
            Value::F64(v) => write!(f, "{}", v),
            Value::Decimal(d) => write!(f, "{}e-{}", d.unscaled, d.scale),
            Value::String(s) => write!(f, "{:?}", s),
            Value::Binary(b) => write!(f, "binary[{}]", b.len()),
            Value::DateTime(d) => write!(
                f,
                "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:09}",
                d.year, d.month, d.day, d.hour, d.minute, d.second, d.nano
            ),
            Value::TimeSpan(t) => write!(f, "{}ns", t.nanos),
            Value::Uuid(u) => write!(f, "{}", u),
            Value::Array(vs) => {
                write!(f, "[")?;
                for (i, v) in vs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
            Value::UserType(u) => write!(f, "user-type({})", u.type_id),
            Value::Shared(inner) => write!(f, "{}", inner),
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::I32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::I64(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

/// Per-stream codec configuration.
///
/// One context is shared by every frame on a channel; the reference toggle
/// is the per-stream bit both sides must agree on.
#[derive(Debug, Clone, Default)]
pub struct PofContext {
    enable_references: bool,
}

impl PofContext {
    /// Context with identity references disabled (graphs encode tree-shape).
    pub fn new() -> Self {
        PofContext {
            enable_references: false,
        }
    }

    /// Context with identity references enabled.
    pub fn with_references() -> Self {
        PofContext {
            enable_references: true,
        }
    }

    /// Whether shared nodes are identity-encoded on this stream.
    pub fn references_enabled(&self) -> bool {
        self.enable_references
    }
}

/// The codec seam the channel exposes: encode a value to bytes and back.
///
/// The default (and only shipped) implementation is the POF codec itself.
pub trait Serializer: Send + Sync {
    fn serialize(&self, buf: &mut WriteBuffer, value: &Value) -> Result<()>;
    fn deserialize(&self, buf: &mut ReadBuffer) -> Result<Value>;
}

impl Serializer for PofContext {
    fn serialize(&self, buf: &mut WriteBuffer, value: &Value) -> Result<()> {
        let mut writer = PofWriter::new(buf, self);
        writer.write_tagged(value)
    }

    fn deserialize(&self, buf: &mut ReadBuffer) -> Result<Value> {
        let mut reader = PofReader::new(buf, self);
        reader.read_tagged()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_coercions() {
        assert_eq!(Value::I16(7).as_i32(), Some(7));
        assert_eq!(Value::I32(7).as_i64(), Some(7));
        assert_eq!(Value::I64(7).as_i32(), None);
        assert_eq!(Value::String("x".into()).as_str(), Some("x"));
        assert_eq!(Value::Null.as_i32(), None);
        assert!(Value::Null.is_null());
    }

    #[test]
    fn shared_unwraps_for_coercion() {
        let v = Value::Shared(Arc::new(Value::I32(9)));
        assert_eq!(v.as_i32(), Some(9));
        assert!(!v.is_null());
        assert!(Value::Shared(Arc::new(Value::Null)).is_null());
    }

    #[test]
    fn terminator_packs_to_one_byte() {
        let mut w = WriteBuffer::new();
        w.write_packed_i32(TERMINATOR_INDEX);
        assert_eq!(w.as_slice(), &[0x40]);
    }

    #[test]
    fn display_is_loggable() {
        let v = Value::Array(vec![
            Value::I32(1),
            Value::String("two".into()),
            Value::Null,
        ]);
        assert_eq!(format!("{}", v), "[1, \"two\", null]");
    }
}
