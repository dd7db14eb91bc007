use std::fmt;

use crate::errors::ChainResult;
use crate::marshalling::{unmarshal_array, Marshallable, MarshallingContext, UnmarshallingContext};
use crate::types::storage_types::StorageType;

/// The signature of a field of a storage class.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FieldSignature {
    pub defining_class: String,
    pub name: String,
    pub field_type: StorageType,
}

impl FieldSignature {
    pub fn new(defining_class: impl Into<String>, name: impl Into<String>, field_type: StorageType) -> Self {
        Self {
            defining_class: defining_class.into(),
            name: name.into(),
            field_type,
        }
    }
}

impl fmt::Display for FieldSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.defining_class, self.name)
    }
}

impl Marshallable for FieldSignature {
    fn marshal(&self, ctx: &mut MarshallingContext) {
        ctx.write_utf(&self.defining_class);
        ctx.write_utf(&self.name);
        self.field_type.marshal(ctx);
    }

    fn unmarshal(ctx: &mut UnmarshallingContext<'_>) -> ChainResult<Self> {
        Ok(Self {
            defining_class: ctx.read_utf()?,
            name: ctx.read_utf()?,
            field_type: StorageType::unmarshal(ctx)?,
        })
    }
}

/// The signature of a method: defining class, name, formal types and
/// return type (`None` for void).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MethodSignature {
    pub defining_class: String,
    pub name: String,
    pub formals: Vec<StorageType>,
    pub return_type: Option<StorageType>,
}

impl MethodSignature {
    pub fn new(
        defining_class: impl Into<String>,
        name: impl Into<String>,
        formals: Vec<StorageType>,
        return_type: Option<StorageType>,
    ) -> Self {
        Self {
            defining_class: defining_class.into(),
            name: name.into(),
            formals,
            return_type,
        }
    }

    pub fn is_void(&self) -> bool {
        self.return_type.is_none()
    }
}

impl fmt::Display for MethodSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}/{}", self.defining_class, self.name, self.formals.len())
    }
}

impl Marshallable for MethodSignature {
    fn marshal(&self, ctx: &mut MarshallingContext) {
        ctx.write_utf(&self.defining_class);
        ctx.write_utf(&self.name);
        ctx.write_compact_u32(self.formals.len() as u32);
        for formal in &self.formals {
            formal.marshal(ctx);
        }
        match &self.return_type {
            None => ctx.write_bool(false),
            Some(return_type) => {
                ctx.write_bool(true);
                return_type.marshal(ctx);
            }
        }
    }

    fn unmarshal(ctx: &mut UnmarshallingContext<'_>) -> ChainResult<Self> {
        let defining_class = ctx.read_utf()?;
        let name = ctx.read_utf()?;
        let formals = unmarshal_array::<StorageType>(ctx)?;
        let return_type = if ctx.read_bool()? {
            Some(StorageType::unmarshal(ctx)?)
        } else {
            None
        };
        Ok(Self {
            defining_class,
            name,
            formals,
            return_type,
        })
    }
}

/// The signature of a constructor of a storage class.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConstructorSignature {
    pub defining_class: String,
    pub formals: Vec<StorageType>,
}

impl ConstructorSignature {
    pub fn new(defining_class: impl Into<String>, formals: Vec<StorageType>) -> Self {
        Self {
            defining_class: defining_class.into(),
            formals,
        }
    }
}

impl fmt::Display for ConstructorSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.<init>/{}", self.defining_class, self.formals.len())
    }
}

impl Marshallable for ConstructorSignature {
    fn marshal(&self, ctx: &mut MarshallingContext) {
        ctx.write_utf(&self.defining_class);
        ctx.write_compact_u32(self.formals.len() as u32);
        for formal in &self.formals {
            formal.marshal(ctx);
        }
    }

    fn unmarshal(ctx: &mut UnmarshallingContext<'_>) -> ChainResult<Self> {
        Ok(Self {
            defining_class: ctx.read_utf()?,
            formals: unmarshal_array::<StorageType>(ctx)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_signatures_sort_by_class_then_name_then_type() {
        let a = FieldSignature::new("a.A", "x", StorageType::Int);
        let b = FieldSignature::new("a.A", "y", StorageType::Int);
        let c = FieldSignature::new("b.B", "a", StorageType::Int);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn method_signature_round_trip() {
        let sig = MethodSignature::new(
            "demo.Counter",
            "increment",
            vec![StorageType::Int, StorageType::big_integer()],
            Some(StorageType::Long),
        );
        assert_eq!(MethodSignature::from_bytes(&sig.to_bytes()).unwrap(), sig);

        let void = MethodSignature::new("demo.Counter", "reset", vec![], None);
        assert_eq!(MethodSignature::from_bytes(&void.to_bytes()).unwrap(), void);
    }
}
