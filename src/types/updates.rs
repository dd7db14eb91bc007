use std::fmt;

use num_bigint::BigInt;

use crate::base_library::{balance_field, red_balance_field};
use crate::errors::{ChainError, ChainResult};
use crate::marshalling::{Marshallable, MarshallingContext, UnmarshallingContext};
use crate::types::references::{StorageReference, TransactionReference};
use crate::types::signatures::FieldSignature;
use crate::types::values::StorageValue;

const SELECTOR_CLASS_TAG: u8 = 0;
const SELECTOR_BALANCE: u8 = 1;
const SELECTOR_BIG_INTEGER: u8 = 2;
const SELECTOR_BOOLEAN: u8 = 3;
const SELECTOR_BYTE: u8 = 4;
const SELECTOR_CHAR: u8 = 5;
const SELECTOR_DOUBLE: u8 = 6;
const SELECTOR_ENUM_EAGER: u8 = 7;
const SELECTOR_ENUM_LAZY: u8 = 8;
const SELECTOR_FLOAT: u8 = 9;
const SELECTOR_INT: u8 = 10;
const SELECTOR_LONG: u8 = 11;
const SELECTOR_SHORT: u8 = 12;
const SELECTOR_STRING: u8 = 13;
const SELECTOR_STORAGE: u8 = 14;
const SELECTOR_RED_BALANCE: u8 = 15;
const SELECTOR_TO_NULL_LAZY: u8 = 17;
const SELECTOR_TO_NULL_EAGER: u8 = 18;

/// An atomic change to the persistent state of one storage object: either
/// the class tag assigned at creation, or the new value of one field.
/// Responses commit sets of updates; histories say which transactions
/// contributed updates to an object.
#[derive(Clone, Debug, PartialEq)]
pub enum Update {
    /// Records the runtime class of a newly created object and the module
    /// installation that defines that class.
    ClassTag {
        object: StorageReference,
        class: String,
        jar: TransactionReference,
    },
    /// Compact shape for the balance field of contracts.
    Balance {
        object: StorageReference,
        balance: BigInt,
    },
    /// Compact shape for the red balance field of contracts.
    RedBalance {
        object: StorageReference,
        balance: BigInt,
    },
    /// A field set to a non-null value.
    Field {
        object: StorageReference,
        field: FieldSignature,
        value: StorageValue,
    },
    /// A field set to null; `eager` reflects the declared type of the field.
    ToNull {
        object: StorageReference,
        field: FieldSignature,
        eager: bool,
    },
}

impl Update {
    pub fn object(&self) -> StorageReference {
        match self {
            Update::ClassTag { object, .. }
            | Update::Balance { object, .. }
            | Update::RedBalance { object, .. }
            | Update::Field { object, .. }
            | Update::ToNull { object, .. } => *object,
        }
    }

    /// The field signature this update assigns, if it is a field update.
    pub fn field(&self) -> Option<FieldSignature> {
        match self {
            Update::ClassTag { .. } => None,
            Update::Balance { .. } => Some(balance_field()),
            Update::RedBalance { .. } => Some(red_balance_field()),
            Update::Field { field, .. } => Some(field.clone()),
            Update::ToNull { field, .. } => Some(field.clone()),
        }
    }

    /// The assigned value, if it is a field update.
    pub fn value(&self) -> Option<StorageValue> {
        match self {
            Update::ClassTag { .. } => None,
            Update::Balance { balance, .. } | Update::RedBalance { balance, .. } => {
                Some(StorageValue::BigInteger(balance.clone()))
            }
            Update::Field { value, .. } => Some(value.clone()),
            Update::ToNull { .. } => Some(StorageValue::Null),
        }
    }

    /// Eager updates carry values stored with the object itself and are
    /// collected during deserialization; lazy updates are fetched on first
    /// access of the field.
    pub fn is_eager(&self) -> bool {
        match self {
            Update::ClassTag { .. } => true,
            Update::Balance { .. } | Update::RedBalance { .. } => true,
            Update::ToNull { eager, .. } => *eager,
            Update::Field { field, value, .. } => match value {
                StorageValue::Reference(_) => false,
                StorageValue::Enum { class, .. } => field.field_type.class_name() == Some(class),
                _ => true,
            },
        }
    }

    pub fn is_class_tag(&self) -> bool {
        matches!(self, Update::ClassTag { .. })
    }
}

impl fmt::Display for Update {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Update::ClassTag { object, class, .. } => write!(f, "<{object} has class {class}>"),
            Update::Balance { object, balance } => write!(f, "<{object}.balance = {balance}>"),
            Update::RedBalance { object, balance } => write!(f, "<{object}.balanceRed = {balance}>"),
            Update::Field { object, field, value } => write!(f, "<{object}.{} = {value}>", field.name),
            Update::ToNull { object, field, .. } => write!(f, "<{object}.{} = null>", field.name),
        }
    }
}

impl Marshallable for Update {
    fn marshal(&self, ctx: &mut MarshallingContext) {
        match self {
            Update::ClassTag { object, class, jar } => {
                ctx.write_u8(SELECTOR_CLASS_TAG);
                object.marshal_without_selector(ctx);
                ctx.write_utf(class);
                jar.marshal(ctx);
            }
            Update::Balance { object, balance } => {
                ctx.write_u8(SELECTOR_BALANCE);
                object.marshal_without_selector(ctx);
                ctx.write_big_integer(balance);
            }
            Update::RedBalance { object, balance } => {
                ctx.write_u8(SELECTOR_RED_BALANCE);
                object.marshal_without_selector(ctx);
                ctx.write_big_integer(balance);
            }
            Update::ToNull { object, field, eager } => {
                ctx.write_u8(if *eager {
                    SELECTOR_TO_NULL_EAGER
                } else {
                    SELECTOR_TO_NULL_LAZY
                });
                object.marshal_without_selector(ctx);
                field.marshal(ctx);
            }
            Update::Field { object, field, value } => {
                let selector = match value {
                    StorageValue::BigInteger(_) => SELECTOR_BIG_INTEGER,
                    StorageValue::Boolean(_) => SELECTOR_BOOLEAN,
                    StorageValue::Byte(_) => SELECTOR_BYTE,
                    StorageValue::Char(_) => SELECTOR_CHAR,
                    StorageValue::Double(_) => SELECTOR_DOUBLE,
                    StorageValue::Enum { class, .. } => {
                        if field.field_type.class_name() == Some(class) {
                            SELECTOR_ENUM_EAGER
                        } else {
                            SELECTOR_ENUM_LAZY
                        }
                    }
                    StorageValue::Float(_) => SELECTOR_FLOAT,
                    StorageValue::Int(_) => SELECTOR_INT,
                    StorageValue::Long(_) => SELECTOR_LONG,
                    StorageValue::Short(_) => SELECTOR_SHORT,
                    StorageValue::String(_) => SELECTOR_STRING,
                    StorageValue::Reference(_) => SELECTOR_STORAGE,
                    StorageValue::Null => SELECTOR_TO_NULL_EAGER,
                };
                ctx.write_u8(selector);
                object.marshal_without_selector(ctx);
                field.marshal(ctx);
                match value {
                    StorageValue::BigInteger(v) => ctx.write_big_integer(v),
                    StorageValue::Boolean(v) => ctx.write_bool(*v),
                    StorageValue::Byte(v) => ctx.write_i8(*v),
                    StorageValue::Char(v) => ctx.write_char(*v),
                    StorageValue::Double(v) => ctx.write_f64(*v),
                    StorageValue::Enum { class, name } => {
                        ctx.write_utf(class);
                        ctx.write_utf(name);
                    }
                    StorageValue::Float(v) => ctx.write_f32(*v),
                    StorageValue::Int(v) => ctx.write_i32(*v),
                    StorageValue::Long(v) => ctx.write_i64(*v),
                    StorageValue::Short(v) => ctx.write_i16(*v),
                    StorageValue::String(v) => ctx.write_utf(v),
                    StorageValue::Reference(v) => v.marshal_without_selector(ctx),
                    StorageValue::Null => {}
                }
            }
        }
    }

    fn unmarshal(ctx: &mut UnmarshallingContext<'_>) -> ChainResult<Self> {
        let selector = ctx.read_u8()?;
        match selector {
            SELECTOR_CLASS_TAG => Ok(Update::ClassTag {
                object: StorageReference::unmarshal_without_selector(ctx)?,
                class: ctx.read_utf()?,
                jar: TransactionReference::unmarshal(ctx)?,
            }),
            SELECTOR_BALANCE => Ok(Update::Balance {
                object: StorageReference::unmarshal_without_selector(ctx)?,
                balance: ctx.read_big_integer()?,
            }),
            SELECTOR_RED_BALANCE => Ok(Update::RedBalance {
                object: StorageReference::unmarshal_without_selector(ctx)?,
                balance: ctx.read_big_integer()?,
            }),
            SELECTOR_TO_NULL_EAGER | SELECTOR_TO_NULL_LAZY => Ok(Update::ToNull {
                object: StorageReference::unmarshal_without_selector(ctx)?,
                field: FieldSignature::unmarshal(ctx)?,
                eager: selector == SELECTOR_TO_NULL_EAGER,
            }),
            SELECTOR_BIG_INTEGER
            | SELECTOR_BOOLEAN
            | SELECTOR_BYTE
            | SELECTOR_CHAR
            | SELECTOR_DOUBLE
            | SELECTOR_ENUM_EAGER
            | SELECTOR_ENUM_LAZY
            | SELECTOR_FLOAT
            | SELECTOR_INT
            | SELECTOR_LONG
            | SELECTOR_SHORT
            | SELECTOR_STRING
            | SELECTOR_STORAGE => {
                let object = StorageReference::unmarshal_without_selector(ctx)?;
                let field = FieldSignature::unmarshal(ctx)?;
                let value = match selector {
                    SELECTOR_BIG_INTEGER => StorageValue::BigInteger(ctx.read_big_integer()?),
                    SELECTOR_BOOLEAN => StorageValue::Boolean(ctx.read_bool()?),
                    SELECTOR_BYTE => StorageValue::Byte(ctx.read_i8()?),
                    SELECTOR_CHAR => StorageValue::Char(ctx.read_char()?),
                    SELECTOR_DOUBLE => StorageValue::Double(ctx.read_f64()?),
                    SELECTOR_ENUM_EAGER | SELECTOR_ENUM_LAZY => StorageValue::Enum {
                        class: ctx.read_utf()?,
                        name: ctx.read_utf()?,
                    },
                    SELECTOR_FLOAT => StorageValue::Float(ctx.read_f32()?),
                    SELECTOR_INT => StorageValue::Int(ctx.read_i32()?),
                    SELECTOR_LONG => StorageValue::Long(ctx.read_i64()?),
                    SELECTOR_SHORT => StorageValue::Short(ctx.read_i16()?),
                    SELECTOR_STRING => StorageValue::String(ctx.read_utf()?),
                    _ => StorageValue::Reference(StorageReference::unmarshal_without_selector(ctx)?),
                };
                Ok(Update::Field { object, field, value })
            }
            other => Err(ChainError::marshalling(format!("unknown update selector {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::storage_types::StorageType;

    fn object() -> StorageReference {
        StorageReference::new(TransactionReference::new([5u8; 32]), 2)
    }

    #[test]
    fn eager_null_update_uses_selector_eighteen() {
        let update = Update::ToNull {
            object: object(),
            field: FieldSignature::new("a.A", "s", StorageType::string()),
            eager: true,
        };
        assert_eq!(update.to_bytes()[0], 18);
        assert_eq!(Update::from_bytes(&update.to_bytes()).unwrap(), update);
    }

    #[test]
    fn updates_round_trip() {
        let updates = vec![
            Update::ClassTag {
                object: object(),
                class: "demo.Account".to_string(),
                jar: TransactionReference::new([1u8; 32]),
            },
            Update::Balance {
                object: object(),
                balance: BigInt::from(1_000_000u64),
            },
            Update::RedBalance {
                object: object(),
                balance: BigInt::from(42u8),
            },
            Update::Field {
                object: object(),
                field: FieldSignature::new("a.A", "count", StorageType::Int),
                value: StorageValue::Int(17),
            },
            Update::Field {
                object: object(),
                field: FieldSignature::new("a.A", "next", StorageType::Class("a.A".to_string())),
                value: StorageValue::Reference(object()),
            },
            Update::ToNull {
                object: object(),
                field: FieldSignature::new("a.A", "next", StorageType::Class("a.A".to_string())),
                eager: false,
            },
        ];
        for update in updates {
            assert_eq!(Update::from_bytes(&update.to_bytes()).unwrap(), update);
        }
    }

    #[test]
    fn eagerness_of_field_updates() {
        let eager = Update::Field {
            object: object(),
            field: FieldSignature::new("a.A", "count", StorageType::Int),
            value: StorageValue::Int(17),
        };
        assert!(eager.is_eager());

        let lazy = Update::Field {
            object: object(),
            field: FieldSignature::new("a.A", "next", StorageType::Class("a.A".to_string())),
            value: StorageValue::Reference(object()),
        };
        assert!(!lazy.is_eager());
    }
}
