//! Conversions between Rust types and [`Value`], and the described-list
//! machinery shared by every composite type.

use bytes::{Bytes, BytesMut};

use crate::error::{CodecError, Result};
use crate::value::{Descriptor, Map, Symbol, Value};

/// Conversion out of a decoded [`Value`].
pub trait FromValue: Sized {
    /// Converts `value`, failing with [`CodecError::TypeMismatch`] on the wrong variant.
    fn from_value(value: Value) -> Result<Self>;
}

fn mismatch<T>(expected: &'static str, found: &Value) -> Result<T> {
    Err(CodecError::TypeMismatch {
        expected,
        found: found.type_name(),
    })
}

macro_rules! scalar_conversions {
    ($($ty:ty => $variant:ident, $name:literal;)*) => {
        $(
            impl From<$ty> for Value {
                fn from(value: $ty) -> Self {
                    Value::$variant(value)
                }
            }

            impl FromValue for $ty {
                fn from_value(value: Value) -> Result<Self> {
                    match value {
                        Value::$variant(v) => Ok(v),
                        other => mismatch($name, &other),
                    }
                }
            }
        )*
    };
}

scalar_conversions! {
    bool => Bool, "boolean";
    u8 => Ubyte, "ubyte";
    u16 => Ushort, "ushort";
    u64 => Ulong, "ulong";
    i32 => Int, "int";
    i64 => Long, "long";
    String => String, "string";
    Symbol => Symbol, "symbol";
    Bytes => Binary, "binary";
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::Uint(value)
    }
}

// Some peers encode small uint fields with narrower types.
impl FromValue for u32 {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Uint(v) => Ok(v),
            Value::Ubyte(v) => Ok(v as u32),
            Value::Ushort(v) => Ok(v as u32),
            other => mismatch("uint", &other),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl FromValue for Value {
    fn from_value(value: Value) -> Result<Self> {
        Ok(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

/// Multiple-valued symbol fields may be sent as a single symbol or an array.
impl From<Vec<Symbol>> for Value {
    fn from(value: Vec<Symbol>) -> Self {
        Value::Array(value.into_iter().map(Value::Symbol).collect())
    }
}

impl FromValue for Vec<Symbol> {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Symbol(s) => Ok(vec![s]),
            Value::Array(items) => items.into_iter().map(Symbol::from_value).collect(),
            other => mismatch("symbol array", &other),
        }
    }
}

impl From<Map> for Value {
    fn from(value: Map) -> Self {
        Value::Map(value)
    }
}

impl FromValue for Map {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Map(entries) => Ok(entries),
            other => mismatch("map", &other),
        }
    }
}

/// Sequential reader over the fields of a described list.
///
/// Missing trailing fields and explicit nulls both read as `None`.
#[derive(Debug)]
pub struct FieldReader {
    iter: std::vec::IntoIter<Value>,
}

impl FieldReader {
    /// Wraps the list items of a composite.
    pub fn new(items: Vec<Value>) -> Self {
        Self {
            iter: items.into_iter(),
        }
    }

    /// Reads the next field, mapping null or absence to `None`.
    pub fn optional<T: FromValue>(&mut self) -> Result<Option<T>> {
        match self.iter.next() {
            None | Some(Value::Null) => Ok(None),
            Some(value) => T::from_value(value).map(Some),
        }
    }

    /// Reads a mandatory field.
    pub fn required<T: FromValue>(&mut self, name: &'static str) -> Result<T> {
        self.optional()?.ok_or(CodecError::MissingField(name))
    }

    /// Reads a field that has a protocol default.
    pub fn or<T: FromValue>(&mut self, default: T) -> Result<T> {
        Ok(self.optional()?.unwrap_or(default))
    }
}

/// A described list type: performatives, delivery states, terminus and
/// message sections that are encoded as lists.
pub trait Composite: Sized {
    /// Numeric descriptor code.
    const CODE: u64;
    /// Symbolic descriptor name.
    const NAME: &'static str;

    /// Field values in declaration order.
    fn fields(&self) -> Vec<Value>;

    /// Rebuilds the type from its fields.
    fn from_fields(fields: &mut FieldReader) -> Result<Self>;

    /// Builds the described value, dropping trailing null fields.
    fn to_value(&self) -> Value {
        let mut fields = self.fields();
        while matches!(fields.last(), Some(Value::Null)) {
            fields.pop();
        }
        Value::described(Self::CODE, Value::List(fields))
    }

    /// Appends the encoding to `buf`.
    fn encode(&self, buf: &mut BytesMut) {
        self.to_value().encode(buf);
    }

    /// Whether `descriptor` identifies this type.
    fn matches(descriptor: &Descriptor) -> bool {
        match descriptor {
            Descriptor::Code(code) => *code == Self::CODE,
            Descriptor::Name(name) => name.as_str() == Self::NAME,
        }
    }

    /// Converts a described list value.
    fn from_described(value: Value) -> Result<Self> {
        match value {
            Value::Described(descriptor, inner) if Self::matches(&descriptor) => match *inner {
                Value::List(items) => Self::from_fields(&mut FieldReader::new(items)),
                other => mismatch("list", &other),
            },
            Value::Described(descriptor, _) => Err(CodecError::UnknownDescriptor(format!(
                "{:?} (expected {})",
                descriptor,
                Self::NAME
            ))),
            other => mismatch(Self::NAME, &other),
        }
    }
}

/// Returns the numeric code of a descriptor, resolving well-known names.
pub fn descriptor_code(descriptor: &Descriptor) -> Option<u64> {
    match descriptor {
        Descriptor::Code(code) => Some(*code),
        Descriptor::Name(name) => crate::codes::by_name(name.as_str()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fields_defaults_and_nulls() {
        let mut fields = FieldReader::new(vec![Value::Uint(3), Value::Null]);
        assert_eq!(fields.required::<u32>("first").unwrap(), 3);
        assert_eq!(fields.optional::<u32>().unwrap(), None);
        assert!(fields.or(true).unwrap());
        assert_eq!(
            fields.required::<String>("missing"),
            Err(CodecError::MissingField("missing"))
        );
    }

    #[test]
    fn test_symbol_vec_accepts_single_symbol() {
        let parsed = Vec::<Symbol>::from_value(Value::Symbol(Symbol::from("PLAIN"))).unwrap();
        assert_eq!(parsed, vec![Symbol::from("PLAIN")]);
    }

    #[test]
    fn test_uint_accepts_narrow_encodings() {
        assert_eq!(u32::from_value(Value::Ubyte(4)).unwrap(), 4);
        assert!(u32::from_value(Value::String("4".into())).is_err());
    }
}
