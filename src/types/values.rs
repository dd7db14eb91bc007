use std::fmt;

use num_bigint::BigInt;

use crate::errors::{ChainError, ChainResult};
use crate::marshalling::{Marshallable, MarshallingContext, UnmarshallingContext};
use crate::types::references::StorageReference;

const SELECTOR_TRUE: u8 = 0;
const SELECTOR_FALSE: u8 = 1;
const SELECTOR_BYTE: u8 = 2;
const SELECTOR_CHAR: u8 = 3;
const SELECTOR_DOUBLE: u8 = 4;
const SELECTOR_ENUM: u8 = 5;
const SELECTOR_BIG_INTEGER: u8 = 6;
const SELECTOR_FLOAT: u8 = 7;
const SELECTOR_NULL: u8 = 8;
const SELECTOR_LONG: u8 = 9;
const SELECTOR_STRING: u8 = 10;
pub(crate) const SELECTOR_STORAGE_REFERENCE: u8 = 11;
const SELECTOR_SHORT: u8 = 12;
const SELECTOR_INT: u8 = 14;

/// Small non-negative ints are marshalled as a single selector byte in the
/// window above [`SELECTOR_INT`].
const SMALL_INT_BASE: u8 = SELECTOR_INT + 1;
const SMALL_INT_MAX: i32 = (u8::MAX - SMALL_INT_BASE) as i32;

/// A value that can be stored in a field of a storage object, passed as an
/// actual argument or returned from a method.
#[derive(Clone, Debug, PartialEq)]
pub enum StorageValue {
    Boolean(bool),
    Byte(i8),
    Char(char),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    BigInteger(BigInt),
    String(String),
    Enum { class: String, name: String },
    Null,
    Reference(StorageReference),
}

impl StorageValue {
    pub fn big_integer(value: impl Into<BigInt>) -> Self {
        StorageValue::BigInteger(value.into())
    }

    pub fn as_reference(&self) -> Option<StorageReference> {
        match self {
            StorageValue::Reference(reference) => Some(*reference),
            _ => None,
        }
    }

    pub fn as_big_integer(&self) -> Option<&BigInt> {
        match self {
            StorageValue::BigInteger(value) => Some(value),
            _ => None,
        }
    }
}

impl fmt::Display for StorageValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageValue::Boolean(v) => write!(f, "{v}"),
            StorageValue::Byte(v) => write!(f, "{v}"),
            StorageValue::Char(v) => write!(f, "{v}"),
            StorageValue::Short(v) => write!(f, "{v}"),
            StorageValue::Int(v) => write!(f, "{v}"),
            StorageValue::Long(v) => write!(f, "{v}"),
            StorageValue::Float(v) => write!(f, "{v}"),
            StorageValue::Double(v) => write!(f, "{v}"),
            StorageValue::BigInteger(v) => write!(f, "{v}"),
            StorageValue::String(v) => write!(f, "{v}"),
            StorageValue::Enum { class, name } => write!(f, "{class}.{name}"),
            StorageValue::Null => write!(f, "null"),
            StorageValue::Reference(r) => write!(f, "{r}"),
        }
    }
}

impl Marshallable for StorageValue {
    fn marshal(&self, ctx: &mut MarshallingContext) {
        match self {
            StorageValue::Boolean(true) => ctx.write_u8(SELECTOR_TRUE),
            StorageValue::Boolean(false) => ctx.write_u8(SELECTOR_FALSE),
            StorageValue::Byte(v) => {
                ctx.write_u8(SELECTOR_BYTE);
                ctx.write_i8(*v);
            }
            StorageValue::Char(v) => {
                ctx.write_u8(SELECTOR_CHAR);
                ctx.write_char(*v);
            }
            StorageValue::Short(v) => {
                ctx.write_u8(SELECTOR_SHORT);
                ctx.write_i16(*v);
            }
            StorageValue::Int(v) => {
                if (0..=SMALL_INT_MAX).contains(v) {
                    ctx.write_u8(SMALL_INT_BASE + *v as u8);
                } else {
                    ctx.write_u8(SELECTOR_INT);
                    ctx.write_i32(*v);
                }
            }
            StorageValue::Long(v) => {
                ctx.write_u8(SELECTOR_LONG);
                ctx.write_i64(*v);
            }
            StorageValue::Float(v) => {
                ctx.write_u8(SELECTOR_FLOAT);
                ctx.write_f32(*v);
            }
            StorageValue::Double(v) => {
                ctx.write_u8(SELECTOR_DOUBLE);
                ctx.write_f64(*v);
            }
            StorageValue::BigInteger(v) => {
                ctx.write_u8(SELECTOR_BIG_INTEGER);
                ctx.write_big_integer(v);
            }
            StorageValue::String(v) => {
                ctx.write_u8(SELECTOR_STRING);
                ctx.write_utf(v);
            }
            StorageValue::Enum { class, name } => {
                ctx.write_u8(SELECTOR_ENUM);
                ctx.write_utf(class);
                ctx.write_utf(name);
            }
            StorageValue::Null => ctx.write_u8(SELECTOR_NULL),
            StorageValue::Reference(reference) => {
                ctx.write_u8(SELECTOR_STORAGE_REFERENCE);
                reference.marshal_without_selector(ctx);
            }
        }
    }

    fn unmarshal(ctx: &mut UnmarshallingContext<'_>) -> ChainResult<Self> {
        let selector = ctx.read_u8()?;
        match selector {
            SELECTOR_TRUE => Ok(StorageValue::Boolean(true)),
            SELECTOR_FALSE => Ok(StorageValue::Boolean(false)),
            SELECTOR_BYTE => Ok(StorageValue::Byte(ctx.read_i8()?)),
            SELECTOR_CHAR => Ok(StorageValue::Char(ctx.read_char()?)),
            SELECTOR_SHORT => Ok(StorageValue::Short(ctx.read_i16()?)),
            SELECTOR_INT => Ok(StorageValue::Int(ctx.read_i32()?)),
            SELECTOR_LONG => Ok(StorageValue::Long(ctx.read_i64()?)),
            SELECTOR_FLOAT => Ok(StorageValue::Float(ctx.read_f32()?)),
            SELECTOR_DOUBLE => Ok(StorageValue::Double(ctx.read_f64()?)),
            SELECTOR_BIG_INTEGER => Ok(StorageValue::BigInteger(ctx.read_big_integer()?)),
            SELECTOR_STRING => Ok(StorageValue::String(ctx.read_utf()?)),
            SELECTOR_ENUM => Ok(StorageValue::Enum {
                class: ctx.read_utf()?,
                name: ctx.read_utf()?,
            }),
            SELECTOR_NULL => Ok(StorageValue::Null),
            SELECTOR_STORAGE_REFERENCE => Ok(StorageValue::Reference(
                StorageReference::unmarshal_without_selector(ctx)?,
            )),
            selector if selector >= SMALL_INT_BASE => {
                Ok(StorageValue::Int(i32::from(selector - SMALL_INT_BASE)))
            }
            other => Err(ChainError::marshalling(format!("unknown value selector {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::references::TransactionReference;

    #[test]
    fn small_ints_take_one_byte() {
        assert_eq!(StorageValue::Int(0).to_bytes().len(), 1);
        assert_eq!(StorageValue::Int(SMALL_INT_MAX).to_bytes().len(), 1);
        assert_eq!(StorageValue::Int(SMALL_INT_MAX + 1).to_bytes().len(), 5);
        assert_eq!(StorageValue::Int(-1).to_bytes().len(), 5);
        for v in [0, 1, SMALL_INT_MAX, SMALL_INT_MAX + 1, -42, i32::MAX, i32::MIN] {
            let value = StorageValue::Int(v);
            assert_eq!(StorageValue::from_bytes(&value.to_bytes()).unwrap(), value);
        }
    }

    #[test]
    fn storage_reference_uses_selector_eleven() {
        let reference = StorageReference::new(TransactionReference::new([3u8; 32]), 7);
        let bytes = StorageValue::Reference(reference).to_bytes();
        assert_eq!(bytes[0], 11);
        assert_eq!(
            StorageValue::from_bytes(&bytes).unwrap(),
            StorageValue::Reference(reference)
        );
    }

    #[test]
    fn values_round_trip() {
        let values = vec![
            StorageValue::Boolean(true),
            StorageValue::Boolean(false),
            StorageValue::Byte(-7),
            StorageValue::Char('λ'),
            StorageValue::Short(-300),
            StorageValue::Long(1 << 60),
            StorageValue::Float(1.5),
            StorageValue::Double(-2.25),
            StorageValue::big_integer(1_000_000_000_000_000i64),
            StorageValue::String("hello".to_string()),
            StorageValue::Enum {
                class: "demo.Color".to_string(),
                name: "RED".to_string(),
            },
            StorageValue::Null,
        ];
        for value in values {
            assert_eq!(StorageValue::from_bytes(&value.to_bytes()).unwrap(), value);
        }
    }
}
