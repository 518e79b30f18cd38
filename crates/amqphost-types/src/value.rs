//! AMQP 1.0 primitive and compound values and their wire encoding.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

use crate::error::{CodecError, Result};

/// An ASCII symbolic constant such as an error condition or a mechanism name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Symbol(String);

impl Symbol {
    /// Creates a symbol from any string-like value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the symbol text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Symbol {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Symbol {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl PartialEq<&str> for Symbol {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An AMQP map. Entry order is kept as received.
pub type Map = Vec<(Value, Value)>;

/// Descriptor of a described type: a numeric code or a symbolic name.
#[derive(Debug, Clone, PartialEq)]
pub enum Descriptor {
    /// Numeric descriptor (domain id in the high 32 bits, descriptor id in the low).
    Code(u64),
    /// Symbolic descriptor such as `amqp:open:list`.
    Name(Symbol),
}

/// Any AMQP 1.0 value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// The null value.
    Null,
    /// Boolean.
    Bool(bool),
    /// Unsigned 8-bit integer.
    Ubyte(u8),
    /// Unsigned 16-bit integer.
    Ushort(u16),
    /// Unsigned 32-bit integer.
    Uint(u32),
    /// Unsigned 64-bit integer.
    Ulong(u64),
    /// Signed 8-bit integer.
    Byte(i8),
    /// Signed 16-bit integer.
    Short(i16),
    /// Signed 32-bit integer.
    Int(i32),
    /// Signed 64-bit integer.
    Long(i64),
    /// IEEE 754 single precision float.
    Float(f32),
    /// IEEE 754 double precision float.
    Double(f64),
    /// UTF-32 character.
    Char(char),
    /// Milliseconds since the unix epoch.
    Timestamp(i64),
    /// RFC 4122 UUID bytes.
    Uuid([u8; 16]),
    /// Opaque binary data.
    Binary(Bytes),
    /// UTF-8 string.
    String(String),
    /// Symbolic value.
    Symbol(Symbol),
    /// Heterogeneous sequence.
    List(Vec<Value>),
    /// Key/value pairs.
    Map(Map),
    /// Homogeneous sequence.
    Array(Vec<Value>),
    /// A value annotated with a descriptor.
    Described(Box<Descriptor>, Box<Value>),
}

impl Value {
    /// Wraps `value` with a numeric descriptor.
    pub fn described(code: u64, value: Value) -> Self {
        Value::Described(Box::new(Descriptor::Code(code)), Box::new(value))
    }

    /// Short name of the variant, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Ubyte(_) => "ubyte",
            Value::Ushort(_) => "ushort",
            Value::Uint(_) => "uint",
            Value::Ulong(_) => "ulong",
            Value::Byte(_) => "byte",
            Value::Short(_) => "short",
            Value::Int(_) => "int",
            Value::Long(_) => "long",
            Value::Float(_) => "float",
            Value::Double(_) => "double",
            Value::Char(_) => "char",
            Value::Timestamp(_) => "timestamp",
            Value::Uuid(_) => "uuid",
            Value::Binary(_) => "binary",
            Value::String(_) => "string",
            Value::Symbol(_) => "symbol",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Array(_) => "array",
            Value::Described(_, _) => "described",
        }
    }

    /// Returns the text of a string or symbol value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            Value::Symbol(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Appends the encoding of this value to `buf` using the most compact constructor.
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Value::Null => buf.put_u8(0x40),
            Value::Bool(true) => buf.put_u8(0x41),
            Value::Bool(false) => buf.put_u8(0x42),
            Value::Ubyte(v) => {
                buf.put_u8(0x50);
                buf.put_u8(*v);
            }
            Value::Ushort(v) => {
                buf.put_u8(0x60);
                buf.put_u16(*v);
            }
            Value::Uint(0) => buf.put_u8(0x43),
            Value::Uint(v) if *v <= u8::MAX as u32 => {
                buf.put_u8(0x52);
                buf.put_u8(*v as u8);
            }
            Value::Uint(v) => {
                buf.put_u8(0x70);
                buf.put_u32(*v);
            }
            Value::Ulong(0) => buf.put_u8(0x44),
            Value::Ulong(v) if *v <= u8::MAX as u64 => {
                buf.put_u8(0x53);
                buf.put_u8(*v as u8);
            }
            Value::Ulong(v) => {
                buf.put_u8(0x80);
                buf.put_u64(*v);
            }
            Value::Byte(v) => {
                buf.put_u8(0x51);
                buf.put_i8(*v);
            }
            Value::Short(v) => {
                buf.put_u8(0x61);
                buf.put_i16(*v);
            }
            Value::Int(v) if (i8::MIN as i32..=i8::MAX as i32).contains(v) => {
                buf.put_u8(0x54);
                buf.put_i8(*v as i8);
            }
            Value::Int(v) => {
                buf.put_u8(0x71);
                buf.put_i32(*v);
            }
            Value::Long(v) if (i8::MIN as i64..=i8::MAX as i64).contains(v) => {
                buf.put_u8(0x55);
                buf.put_i8(*v as i8);
            }
            Value::Long(v) => {
                buf.put_u8(0x81);
                buf.put_i64(*v);
            }
            Value::Float(v) => {
                buf.put_u8(0x72);
                buf.put_f32(*v);
            }
            Value::Double(v) => {
                buf.put_u8(0x82);
                buf.put_f64(*v);
            }
            Value::Char(c) => {
                buf.put_u8(0x73);
                buf.put_u32(*c as u32);
            }
            Value::Timestamp(v) => {
                buf.put_u8(0x83);
                buf.put_i64(*v);
            }
            Value::Uuid(v) => {
                buf.put_u8(0x98);
                buf.put_slice(v);
            }
            Value::Binary(b) => encode_variable(buf, 0xa0, 0xb0, b),
            Value::String(s) => encode_variable(buf, 0xa1, 0xb1, s.as_bytes()),
            Value::Symbol(s) => encode_variable(buf, 0xa3, 0xb3, s.as_str().as_bytes()),
            Value::List(items) if items.is_empty() => buf.put_u8(0x45),
            Value::List(items) => encode_compound(buf, 0xc0, 0xd0, items.len(), |body| {
                for item in items {
                    item.encode(body);
                }
            }),
            Value::Map(entries) => encode_compound(buf, 0xc1, 0xd1, entries.len() * 2, |body| {
                for (key, value) in entries {
                    key.encode(body);
                    value.encode(body);
                }
            }),
            Value::Array(items) => encode_array(buf, items, true),
            Value::Described(descriptor, value) => {
                buf.put_u8(0x00);
                encode_descriptor(buf, descriptor);
                value.encode(buf);
            }
        }
    }

    /// Encodes this value into a fresh buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decodes one value from the front of `buf`, advancing it.
    pub fn decode(buf: &mut Bytes) -> Result<Value> {
        let code = read_u8(buf)?;
        if code == 0x00 {
            let descriptor = decode_descriptor(buf)?;
            let value = Value::decode(buf)?;
            return Ok(Value::Described(Box::new(descriptor), Box::new(value)));
        }
        decode_body(code, buf)
    }

    fn array_constructor(&self) -> u8 {
        match self {
            Value::Null => 0x40,
            Value::Bool(_) => 0x56,
            Value::Ubyte(_) => 0x50,
            Value::Ushort(_) => 0x60,
            Value::Uint(_) => 0x70,
            Value::Ulong(_) => 0x80,
            Value::Byte(_) => 0x51,
            Value::Short(_) => 0x61,
            Value::Int(_) => 0x71,
            Value::Long(_) => 0x81,
            Value::Float(_) => 0x72,
            Value::Double(_) => 0x82,
            Value::Char(_) => 0x73,
            Value::Timestamp(_) => 0x83,
            Value::Uuid(_) => 0x98,
            Value::Binary(_) => 0xb0,
            Value::String(_) => 0xb1,
            Value::Symbol(_) => 0xb3,
            Value::List(_) => 0xd0,
            Value::Map(_) => 0xd1,
            Value::Array(_) => 0xf0,
            Value::Described(_, inner) => inner.array_constructor(),
        }
    }

    /// Writes the value body for its wide array constructor, without the constructor byte.
    fn encode_element(&self, buf: &mut BytesMut) {
        match self {
            Value::Null => {}
            Value::Bool(v) => buf.put_u8(u8::from(*v)),
            Value::Ubyte(v) => buf.put_u8(*v),
            Value::Ushort(v) => buf.put_u16(*v),
            Value::Uint(v) => buf.put_u32(*v),
            Value::Ulong(v) => buf.put_u64(*v),
            Value::Byte(v) => buf.put_i8(*v),
            Value::Short(v) => buf.put_i16(*v),
            Value::Int(v) => buf.put_i32(*v),
            Value::Long(v) => buf.put_i64(*v),
            Value::Float(v) => buf.put_f32(*v),
            Value::Double(v) => buf.put_f64(*v),
            Value::Char(c) => buf.put_u32(*c as u32),
            Value::Timestamp(v) => buf.put_i64(*v),
            Value::Uuid(v) => buf.put_slice(v),
            Value::Binary(b) => put_wide(buf, b),
            Value::String(s) => put_wide(buf, s.as_bytes()),
            Value::Symbol(s) => put_wide(buf, s.as_str().as_bytes()),
            Value::List(items) => {
                let mut body = BytesMut::new();
                for item in items {
                    item.encode(&mut body);
                }
                buf.put_u32(body.len() as u32 + 4);
                buf.put_u32(items.len() as u32);
                buf.put_slice(&body);
            }
            Value::Map(entries) => {
                let mut body = BytesMut::new();
                for (key, value) in entries {
                    key.encode(&mut body);
                    value.encode(&mut body);
                }
                buf.put_u32(body.len() as u32 + 4);
                buf.put_u32(entries.len() as u32 * 2);
                buf.put_slice(&body);
            }
            Value::Array(items) => encode_array(buf, items, false),
            Value::Described(_, inner) => inner.encode_element(buf),
        }
    }
}

fn put_wide(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

fn encode_variable(buf: &mut BytesMut, small: u8, large: u8, data: &[u8]) {
    if data.len() <= u8::MAX as usize {
        buf.put_u8(small);
        buf.put_u8(data.len() as u8);
    } else {
        buf.put_u8(large);
        buf.put_u32(data.len() as u32);
    }
    buf.put_slice(data);
}

fn encode_compound(
    buf: &mut BytesMut,
    small: u8,
    large: u8,
    count: usize,
    write_items: impl FnOnce(&mut BytesMut),
) {
    let mut body = BytesMut::new();
    write_items(&mut body);
    if body.len() < u8::MAX as usize && count <= u8::MAX as usize {
        buf.put_u8(small);
        buf.put_u8(body.len() as u8 + 1);
        buf.put_u8(count as u8);
    } else {
        buf.put_u8(large);
        buf.put_u32(body.len() as u32 + 4);
        buf.put_u32(count as u32);
    }
    buf.put_slice(&body);
}

fn encode_descriptor(buf: &mut BytesMut, descriptor: &Descriptor) {
    match descriptor {
        Descriptor::Code(code) => Value::Ulong(*code).encode(buf),
        Descriptor::Name(name) => encode_variable(buf, 0xa3, 0xb3, name.as_str().as_bytes()),
    }
}

/// Arrays always use the wide element constructors; the outer constructor is
/// omitted for arrays nested inside other arrays.
fn encode_array(buf: &mut BytesMut, items: &[Value], with_constructor: bool) {
    let mut body = BytesMut::new();
    match items.first() {
        Some(Value::Described(descriptor, inner)) => {
            body.put_u8(0x00);
            encode_descriptor(&mut body, descriptor);
            body.put_u8(inner.array_constructor());
        }
        Some(first) => body.put_u8(first.array_constructor()),
        None => body.put_u8(0xb3),
    }
    for item in items {
        item.encode_element(&mut body);
    }
    if with_constructor && body.len() < u8::MAX as usize && items.len() <= u8::MAX as usize {
        buf.put_u8(0xe0);
        buf.put_u8(body.len() as u8 + 1);
        buf.put_u8(items.len() as u8);
    } else {
        if with_constructor {
            buf.put_u8(0xf0);
        }
        buf.put_u32(body.len() as u32 + 4);
        buf.put_u32(items.len() as u32);
    }
    buf.put_slice(&body);
}

fn need(buf: &Bytes, n: usize) -> Result<()> {
    if buf.remaining() < n {
        return Err(CodecError::UnexpectedEof {
            needed: n - buf.remaining(),
        });
    }
    Ok(())
}

fn read_u8(buf: &mut Bytes) -> Result<u8> {
    need(buf, 1)?;
    Ok(buf.get_u8())
}

fn read_u32(buf: &mut Bytes) -> Result<u32> {
    need(buf, 4)?;
    Ok(buf.get_u32())
}

fn take(buf: &mut Bytes, n: usize) -> Result<Bytes> {
    need(buf, n)?;
    Ok(buf.split_to(n))
}

fn take_str(buf: &mut Bytes, n: usize, context: &'static str) -> Result<String> {
    let raw = take(buf, n)?;
    String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidUtf8 { context })
}

fn decode_descriptor(buf: &mut Bytes) -> Result<Descriptor> {
    match Value::decode(buf)? {
        Value::Ulong(code) => Ok(Descriptor::Code(code)),
        Value::Symbol(name) => Ok(Descriptor::Name(name)),
        other => Err(CodecError::TypeMismatch {
            expected: "descriptor",
            found: other.type_name(),
        }),
    }
}

fn decode_body(code: u8, buf: &mut Bytes) -> Result<Value> {
    let value = match code {
        0x40 => Value::Null,
        0x41 => Value::Bool(true),
        0x42 => Value::Bool(false),
        0x56 => Value::Bool(read_u8(buf)? != 0),
        0x50 => Value::Ubyte(read_u8(buf)?),
        0x60 => {
            need(buf, 2)?;
            Value::Ushort(buf.get_u16())
        }
        0x43 => Value::Uint(0),
        0x52 => Value::Uint(read_u8(buf)? as u32),
        0x70 => Value::Uint(read_u32(buf)?),
        0x44 => Value::Ulong(0),
        0x53 => Value::Ulong(read_u8(buf)? as u64),
        0x80 => {
            need(buf, 8)?;
            Value::Ulong(buf.get_u64())
        }
        0x51 => Value::Byte(read_u8(buf)? as i8),
        0x61 => {
            need(buf, 2)?;
            Value::Short(buf.get_i16())
        }
        0x54 => Value::Int(read_u8(buf)? as i8 as i32),
        0x71 => {
            need(buf, 4)?;
            Value::Int(buf.get_i32())
        }
        0x55 => Value::Long(read_u8(buf)? as i8 as i64),
        0x81 => {
            need(buf, 8)?;
            Value::Long(buf.get_i64())
        }
        0x72 => {
            need(buf, 4)?;
            Value::Float(buf.get_f32())
        }
        0x82 => {
            need(buf, 8)?;
            Value::Double(buf.get_f64())
        }
        0x73 => {
            let raw = read_u32(buf)?;
            Value::Char(char::from_u32(raw).ok_or(CodecError::InvalidFormatCode(code))?)
        }
        0x83 => {
            need(buf, 8)?;
            Value::Timestamp(buf.get_i64())
        }
        0x98 => {
            let mut uuid = [0u8; 16];
            need(buf, 16)?;
            buf.copy_to_slice(&mut uuid);
            Value::Uuid(uuid)
        }
        0xa0 => {
            let len = read_u8(buf)? as usize;
            Value::Binary(take(buf, len)?)
        }
        0xb0 => {
            let len = read_u32(buf)? as usize;
            Value::Binary(take(buf, len)?)
        }
        0xa1 => {
            let len = read_u8(buf)? as usize;
            Value::String(take_str(buf, len, "string")?)
        }
        0xb1 => {
            let len = read_u32(buf)? as usize;
            Value::String(take_str(buf, len, "string")?)
        }
        0xa3 => {
            let len = read_u8(buf)? as usize;
            Value::Symbol(Symbol(take_str(buf, len, "symbol")?))
        }
        0xb3 => {
            let len = read_u32(buf)? as usize;
            Value::Symbol(Symbol(take_str(buf, len, "symbol")?))
        }
        0x45 => Value::List(Vec::new()),
        0xc0 | 0xd0 | 0xc1 | 0xd1 => {
            let wide = code & 0x10 != 0;
            let mut body = compound_body(buf, wide)?;
            let count = if wide {
                read_u32(&mut body)? as usize
            } else {
                read_u8(&mut body)? as usize
            };
            let mut items = Vec::with_capacity(count.min(body.remaining()));
            for _ in 0..count {
                items.push(Value::decode(&mut body)?);
            }
            if code & 0x01 == 0 {
                Value::List(items)
            } else {
                if items.len() % 2 != 0 {
                    return Err(CodecError::InvalidFrame {
                        reason: "map with odd element count".to_string(),
                    });
                }
                let mut entries = Vec::with_capacity(items.len() / 2);
                let mut iter = items.into_iter();
                while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
                    entries.push((key, value));
                }
                Value::Map(entries)
            }
        }
        0xe0 | 0xf0 => {
            let wide = code == 0xf0;
            let mut body = compound_body(buf, wide)?;
            Value::Array(decode_array_items(&mut body, wide)?)
        }
        other => return Err(CodecError::InvalidFormatCode(other)),
    };
    Ok(value)
}

fn compound_body(buf: &mut Bytes, wide: bool) -> Result<Bytes> {
    let size = if wide {
        read_u32(buf)? as usize
    } else {
        read_u8(buf)? as usize
    };
    take(buf, size)
}

fn decode_array_items(body: &mut Bytes, wide: bool) -> Result<Vec<Value>> {
    let count = if wide {
        read_u32(body)? as usize
    } else {
        read_u8(body)? as usize
    };
    let mut constructor = read_u8(body)?;
    let mut descriptor = None;
    if constructor == 0x00 {
        descriptor = Some(decode_descriptor(body)?);
        constructor = read_u8(body)?;
    }
    let mut items = Vec::with_capacity(count.min(body.remaining()));
    for _ in 0..count {
        let item = if constructor == 0xe0 || constructor == 0xf0 {
            let mut nested = compound_body(body, constructor == 0xf0)?;
            Value::Array(decode_array_items(&mut nested, constructor == 0xf0)?)
        } else {
            decode_body(constructor, body)?
        };
        items.push(match &descriptor {
            Some(d) => Value::Described(Box::new(d.clone()), Box::new(item)),
            None => item,
        });
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn roundtrip(value: &Value) -> Value {
        let mut bytes = value.to_bytes();
        let decoded = Value::decode(&mut bytes).unwrap();
        assert!(bytes.is_empty(), "trailing bytes after {:?}", value);
        decoded
    }

    #[test]
    fn test_compact_constructors() {
        assert_eq!(Value::Uint(0).to_bytes().as_ref(), &[0x43]);
        assert_eq!(Value::Uint(7).to_bytes().as_ref(), &[0x52, 7]);
        assert_eq!(Value::Ulong(0x10).to_bytes().as_ref(), &[0x53, 0x10]);
        assert_eq!(Value::List(vec![]).to_bytes().as_ref(), &[0x45]);
        assert_eq!(Value::Bool(true).to_bytes().as_ref(), &[0x41]);
    }

    #[test]
    fn test_large_string_uses_wide_constructor() {
        let text = "x".repeat(300);
        let bytes = Value::String(text.clone()).to_bytes();
        assert_eq!(bytes[0], 0xb1);
        assert_eq!(roundtrip(&Value::String(text.clone())), Value::String(text));
    }

    #[test]
    fn test_symbol_array() {
        let value = Value::Array(vec![
            Value::Symbol(Symbol::from("PLAIN")),
            Value::Symbol(Symbol::from("EXTERNAL")),
        ]);
        let bytes = value.to_bytes();
        assert_eq!(bytes[0], 0xe0);
        assert_eq!(bytes[3], 0xb3);
        assert_eq!(roundtrip(&value), value);
    }

    #[test]
    fn test_decode_wide_list_of_small_values() {
        // list32 holding uint 5 and null
        let mut bytes = Bytes::from_static(&[0xd0, 0, 0, 0, 7, 0, 0, 0, 2, 0x52, 5, 0x40]);
        let value = Value::decode(&mut bytes).unwrap();
        assert_eq!(value, Value::List(vec![Value::Uint(5), Value::Null]));
    }

    #[test]
    fn test_decode_truncated() {
        let mut bytes = Bytes::from_static(&[0xa1, 10, b'a']);
        assert!(matches!(
            Value::decode(&mut bytes),
            Err(CodecError::UnexpectedEof { .. })
        ));
    }

    #[test]
    fn test_decode_unknown_format_code() {
        let mut bytes = Bytes::from_static(&[0x94]);
        assert_eq!(
            Value::decode(&mut bytes),
            Err(CodecError::InvalidFormatCode(0x94))
        );
    }

    #[test]
    fn test_described_symbolic_descriptor() {
        let value = Value::Described(
            Box::new(Descriptor::Name(Symbol::from("amqp:accepted:list"))),
            Box::new(Value::List(vec![])),
        );
        assert_eq!(roundtrip(&value), value);
    }

    #[test]
    fn test_map_roundtrip() {
        let value = Value::Map(vec![
            (Value::Symbol(Symbol::from("k")), Value::Long(-3)),
            (Value::String("big".into()), Value::Binary(Bytes::from(vec![9u8; 400]))),
        ]);
        assert_eq!(roundtrip(&value), value);
    }

    fn leaf() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<u32>().prop_map(Value::Uint),
            any::<u64>().prop_map(Value::Ulong),
            any::<i32>().prop_map(Value::Int),
            any::<i64>().prop_map(Value::Long),
            any::<i64>().prop_map(Value::Timestamp),
            ".{0,40}".prop_map(Value::String),
            "[a-z:-]{0,20}".prop_map(|s| Value::Symbol(Symbol::new(s))),
            proptest::collection::vec(any::<u8>(), 0..300).prop_map(|v| Value::Binary(Bytes::from(v))),
        ]
    }

    fn tree() -> impl Strategy<Value = Value> {
        leaf().prop_recursive(3, 32, 6, |inner| {
            prop_oneof![
                proptest::collection::vec(inner.clone(), 0..6).prop_map(Value::List),
                proptest::collection::vec((inner.clone(), inner), 0..4).prop_map(Value::Map),
            ]
        })
    }

    proptest! {
        #[test]
        fn prop_encoded_values_decode_identically(value in tree()) {
            prop_assert_eq!(roundtrip(&value), value);
        }

        #[test]
        fn prop_uint_arrays_decode_identically(items in proptest::collection::vec(any::<u32>(), 1..20)) {
            let value = Value::Array(items.into_iter().map(Value::Uint).collect());
            prop_assert_eq!(roundtrip(&value), value);
        }
    }
}
