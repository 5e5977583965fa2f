//! Metadata values stored in the GGUF key-value section.

use crate::error::{GgufError, Result};

/// Wire identifiers for metadata value types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum GgufValueType {
    UInt8 = 0,
    Int8 = 1,
    UInt16 = 2,
    Int16 = 3,
    UInt32 = 4,
    Int32 = 5,
    Float32 = 6,
    Bool = 7,
    String = 8,
    Array = 9,
    UInt64 = 10,
    Int64 = 11,
    Float64 = 12,
}

impl GgufValueType {
    pub fn from_u32(raw: u32) -> Result<Self> {
        Ok(match raw {
            0 => Self::UInt8,
            1 => Self::Int8,
            2 => Self::UInt16,
            3 => Self::Int16,
            4 => Self::UInt32,
            5 => Self::Int32,
            6 => Self::Float32,
            7 => Self::Bool,
            8 => Self::String,
            9 => Self::Array,
            10 => Self::UInt64,
            11 => Self::Int64,
            12 => Self::Float64,
            other => return Err(GgufError::UnknownValueType(other)),
        })
    }
}

/// A single metadata value.
///
/// Arrays carry their element type explicitly so that the element type is
/// known even when reading back an array written by another tool.
#[derive(Debug, Clone, PartialEq)]
pub enum GgufValue {
    UInt8(u8),
    Int8(i8),
    UInt16(u16),
    Int16(i16),
    UInt32(u32),
    Int32(i32),
    Float32(f32),
    Bool(bool),
    String(String),
    Array(GgufValueType, Vec<GgufValue>),
    UInt64(u64),
    Int64(i64),
    Float64(f64),
}

impl GgufValue {
    pub fn value_type(&self) -> GgufValueType {
        match self {
            Self::UInt8(_) => GgufValueType::UInt8,
            Self::Int8(_) => GgufValueType::Int8,
            Self::UInt16(_) => GgufValueType::UInt16,
            Self::Int16(_) => GgufValueType::Int16,
            Self::UInt32(_) => GgufValueType::UInt32,
            Self::Int32(_) => GgufValueType::Int32,
            Self::Float32(_) => GgufValueType::Float32,
            Self::Bool(_) => GgufValueType::Bool,
            Self::String(_) => GgufValueType::String,
            Self::Array(..) => GgufValueType::Array,
            Self::UInt64(_) => GgufValueType::UInt64,
            Self::Int64(_) => GgufValueType::Int64,
            Self::Float64(_) => GgufValueType::Float64,
        }
    }

    /// Append the value payload (without its type tag) to `out`.
    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Self::UInt8(v) => out.push(*v),
            Self::Int8(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::UInt16(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::Int16(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::UInt32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::Int32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::Float32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::Bool(v) => out.push(u8::from(*v)),
            Self::String(s) => encode_string(s, out),
            Self::Array(elem_type, values) => {
                out.extend_from_slice(&(*elem_type as u32).to_le_bytes());
                out.extend_from_slice(&(values.len() as u64).to_le_bytes());
                for v in values {
                    v.encode(out);
                }
            }
            Self::UInt64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::Int64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::Float64(v) => out.extend_from_slice(&v.to_le_bytes()),
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Self::UInt32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match self {
            Self::Float32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[GgufValue]> {
        match self {
            Self::Array(_, values) => Some(values.as_slice()),
            _ => None,
        }
    }
}

/// GGUF strings are a u64 byte length followed by UTF-8 bytes, no terminator.
pub(crate) fn encode_string(s: &str, out: &mut Vec<u8>) {
    out.extend_from_slice(&(s.len() as u64).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

/// Rust types that map onto a single GGUF metadata type.
///
/// Used by [`crate::GgufWriter::add_array`] to keep arrays homogeneous.
pub trait GgufScalar {
    const VALUE_TYPE: GgufValueType;

    fn into_value(self) -> GgufValue;
}

macro_rules! scalar {
    ($ty:ty, $variant:ident) => {
        impl GgufScalar for $ty {
            const VALUE_TYPE: GgufValueType = GgufValueType::$variant;

            fn into_value(self) -> GgufValue {
                GgufValue::$variant(self)
            }
        }
    };
}

scalar!(u8, UInt8);
scalar!(i8, Int8);
scalar!(u16, UInt16);
scalar!(i16, Int16);
scalar!(u32, UInt32);
scalar!(i32, Int32);
scalar!(f32, Float32);
scalar!(bool, Bool);
scalar!(String, String);
scalar!(u64, UInt64);
scalar!(i64, Int64);
scalar!(f64, Float64);

impl GgufScalar for &str {
    const VALUE_TYPE: GgufValueType = GgufValueType::String;

    fn into_value(self) -> GgufValue {
        GgufValue::String(self.to_owned())
    }
}
