use ztile_error::{ztile_bail, ZTileResult};

use crate::{PType, Record};

/// A single primitive value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Bool(bool),
    Char(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
}

macro_rules! impl_value_from {
    ($($variant:ident($native:ty) => $getter:ident),* $(,)?) => {
        $(
            impl From<$native> for Value {
                fn from(v: $native) -> Self {
                    Value::$variant(v)
                }
            }

            impl Value {
                pub fn $getter(&self) -> Option<$native> {
                    match self {
                        Value::$variant(v) => Some(*v),
                        _ => None,
                    }
                }
            }
        )*
    };
}

impl_value_from!(
    Bool(bool) => as_bool,
    Char(u8) => as_char,
    I16(i16) => as_i16,
    U16(u16) => as_u16,
    I32(i32) => as_i32,
    U32(u32) => as_u32,
    I64(i64) => as_i64,
    U64(u64) => as_u64,
    F32(f32) => as_f32,
    F64(f64) => as_f64,
);

impl Value {
    pub fn ptype(&self) -> PType {
        match self {
            Value::Bool(_) => PType::Bool,
            Value::Char(_) => PType::Char,
            Value::I16(_) => PType::I16,
            Value::U16(_) => PType::U16,
            Value::I32(_) => PType::I32,
            Value::U32(_) => PType::U32,
            Value::I64(_) => PType::I64,
            Value::U64(_) => PType::U64,
            Value::F32(_) => PType::F32,
            Value::F64(_) => PType::F64,
        }
    }

    pub fn default_of(ptype: PType) -> Value {
        match ptype {
            PType::Bool => Value::Bool(false),
            PType::Char => Value::Char(0),
            PType::I16 => Value::I16(0),
            PType::U16 => Value::U16(0),
            PType::I32 => Value::I32(0),
            PType::U32 => Value::U32(0),
            PType::I64 => Value::I64(0),
            PType::U64 => Value::U64(0),
            PType::F32 => Value::F32(0.0),
            PType::F64 => Value::F64(0.0),
        }
    }

    /// Append the little-endian fixed-width encoding of this value.
    pub fn write_le(&self, out: &mut Vec<u8>) {
        match self {
            Value::Bool(v) => out.push(u8::from(*v)),
            Value::Char(v) => out.push(*v),
            Value::I16(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::U16(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::I32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::U32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::I64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::U64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::F32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::F64(v) => out.extend_from_slice(&v.to_le_bytes()),
        }
    }

    /// Decode one value of `ptype` from the front of `src`.
    pub fn read_le(ptype: PType, src: &[u8]) -> ZTileResult<Value> {
        let width = ptype.byte_width();
        if src.len() < width {
            ztile_bail!(
                InvalidSerde: "need {} bytes to decode {}, have {}", width, ptype, src.len()
            );
        }
        macro_rules! le {
            ($native:ident, $width:literal) => {{
                let mut b = [0u8; $width];
                b.copy_from_slice(&src[..$width]);
                $native::from_le_bytes(b)
            }};
        }
        Ok(match ptype {
            PType::Bool => Value::Bool(src[0] != 0),
            PType::Char => Value::Char(src[0]),
            PType::I16 => Value::I16(le!(i16, 2)),
            PType::U16 => Value::U16(le!(u16, 2)),
            PType::I32 => Value::I32(le!(i32, 4)),
            PType::U32 => Value::U32(le!(u32, 4)),
            PType::I64 => Value::I64(le!(i64, 8)),
            PType::U64 => Value::U64(le!(u64, 8)),
            PType::F32 => Value::F32(le!(f32, 4)),
            PType::F64 => Value::F64(le!(f64, 8)),
        })
    }
}

/// The tagged-union array payload: an element type tag plus raw bytes.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AnyArrayValue {
    pub elem: Option<PType>,
    pub data: Vec<u8>,
}

impl AnyArrayValue {
    pub fn new(elem: PType, data: Vec<u8>) -> Self {
        Self {
            elem: Some(elem),
            data,
        }
    }

    /// Element count derived from the payload size and the tag.
    pub fn arity(&self) -> usize {
        match self.elem {
            Some(elem) => self.data.len() / elem.byte_width(),
            None => self.data.len(),
        }
    }
}

/// The value slot of one field within a [`Record`].
#[derive(Debug, Clone, PartialEq, Default)]
pub enum FieldValue {
    #[default]
    Unset,
    Scalar(Value),
    ScalarArray(Vec<Value>),
    Bytes(Vec<u8>),
    Enum(i32),
    EnumArray(Vec<i32>),
    Message(Record),
    MessageArray(Vec<Record>),
    AnyArray(AnyArrayValue),
}

impl FieldValue {
    pub fn is_unset(&self) -> bool {
        matches!(self, FieldValue::Unset)
    }

    /// Number of repetitions this slot holds, if it is a repeated shape.
    pub fn repeated_len(&self) -> usize {
        match self {
            FieldValue::ScalarArray(v) => v.len(),
            FieldValue::EnumArray(v) => v.len(),
            FieldValue::MessageArray(v) => v.len(),
            _ => 0,
        }
    }
}

#[cfg(test)]
mod test {
    use crate::{PType, Value};

    #[test]
    fn le_round_trip() {
        let mut buf = Vec::new();
        Value::I16(-12345).write_le(&mut buf);
        Value::F64(2.5).write_le(&mut buf);
        assert_eq!(buf.len(), 10);
        assert_eq!(
            Value::read_le(PType::I16, &buf).unwrap(),
            Value::I16(-12345)
        );
        assert_eq!(Value::read_le(PType::F64, &buf[2..]).unwrap(), Value::F64(2.5));
    }

    #[test]
    fn short_buffer_is_an_error() {
        assert!(Value::read_le(PType::U64, &[1, 2, 3]).is_err());
    }
}
