//! The module format executed by the engine: a marshallable bundle of
//! classes with stack-machine method bodies. Uploaded modules arrive in this
//! form, are verified, instrumented and then interpreted.

use crate::errors::{ChainError, ChainResult};
use crate::marshalling::{unmarshal_array, Marshallable, MarshallingContext, UnmarshallingContext};
use crate::types::signatures::{ConstructorSignature, FieldSignature, MethodSignature};
use crate::types::storage_types::StorageType;
use crate::types::values::StorageValue;

pub const CONSTRUCTOR_NAME: &str = "<init>";

/// A single instruction of a method body. Targets of jumps are instruction
/// indices within the body.
#[derive(Clone, Debug, PartialEq)]
pub enum Instruction {
    Const(StorageValue),
    Load(u16),
    Store(u16),
    /// Pushes the caller bound to the current from-contract activation;
    /// rewritten by instrumentation to a plain local load.
    LoadCaller,
    GetField(FieldSignature),
    PutField(FieldSignature),
    /// Instrumented form of `GetField` for lazily loaded fields.
    GetFieldLazy(FieldSignature),
    GetStatic(FieldSignature),
    PutStatic(FieldSignature),
    New(String),
    Call(MethodSignature),
    CallConstructor(ConstructorSignature),
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Neg,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    IsNull,
    Not,
    IfTrue(u32),
    IfFalse(u32),
    Goto(u32),
    Dup,
    Pop,
    Swap,
    Return,
    ReturnValue,
    /// Throws an exception of the given class; the message is popped from
    /// the operand stack.
    Throw(String),
    /// Pops an event object and records it with the execution context.
    Event,
    // Rejected by verification.
    Jsr(u32),
    Ret(u16),
    MonitorEnter,
    MonitorExit,
    // Inserted by instrumentation.
    ChargeCpu(u64),
    ChargeRam(u64),
    FromContract,
    PayableFromContract,
    // Supply intrinsics of the gamete.
    Mint,
    Burn,
}

impl Instruction {
    pub fn is_branch(&self) -> bool {
        matches!(
            self,
            Instruction::IfTrue(_) | Instruction::IfFalse(_) | Instruction::Goto(_) | Instruction::Jsr(_)
        )
    }

    pub fn branch_target(&self) -> Option<u32> {
        match self {
            Instruction::IfTrue(target)
            | Instruction::IfFalse(target)
            | Instruction::Goto(target)
            | Instruction::Jsr(target) => Some(*target),
            _ => None,
        }
    }

    pub fn ends_block(&self) -> bool {
        matches!(
            self,
            Instruction::IfTrue(_)
                | Instruction::IfFalse(_)
                | Instruction::Goto(_)
                | Instruction::Jsr(_)
                | Instruction::Return
                | Instruction::ReturnValue
                | Instruction::Throw(_)
                | Instruction::Ret(_)
        )
    }
}

impl Marshallable for Instruction {
    fn marshal(&self, ctx: &mut MarshallingContext) {
        match self {
            Instruction::Const(value) => {
                ctx.write_u8(0);
                value.marshal(ctx);
            }
            Instruction::Load(slot) => {
                ctx.write_u8(1);
                ctx.write_u16(*slot);
            }
            Instruction::Store(slot) => {
                ctx.write_u8(2);
                ctx.write_u16(*slot);
            }
            Instruction::GetField(field) => {
                ctx.write_u8(3);
                field.marshal(ctx);
            }
            Instruction::PutField(field) => {
                ctx.write_u8(4);
                field.marshal(ctx);
            }
            Instruction::GetFieldLazy(field) => {
                ctx.write_u8(5);
                field.marshal(ctx);
            }
            Instruction::GetStatic(field) => {
                ctx.write_u8(6);
                field.marshal(ctx);
            }
            Instruction::PutStatic(field) => {
                ctx.write_u8(7);
                field.marshal(ctx);
            }
            Instruction::New(class) => {
                ctx.write_u8(8);
                ctx.write_utf(class);
            }
            Instruction::Call(method) => {
                ctx.write_u8(9);
                method.marshal(ctx);
            }
            Instruction::CallConstructor(constructor) => {
                ctx.write_u8(10);
                constructor.marshal(ctx);
            }
            Instruction::Add => ctx.write_u8(11),
            Instruction::Sub => ctx.write_u8(12),
            Instruction::Mul => ctx.write_u8(13),
            Instruction::Div => ctx.write_u8(14),
            Instruction::Rem => ctx.write_u8(15),
            Instruction::Neg => ctx.write_u8(16),
            Instruction::Eq => ctx.write_u8(17),
            Instruction::Ne => ctx.write_u8(18),
            Instruction::Lt => ctx.write_u8(19),
            Instruction::Le => ctx.write_u8(20),
            Instruction::Gt => ctx.write_u8(21),
            Instruction::Ge => ctx.write_u8(22),
            Instruction::IsNull => ctx.write_u8(23),
            Instruction::Not => ctx.write_u8(24),
            Instruction::IfTrue(target) => {
                ctx.write_u8(25);
                ctx.write_u32(*target);
            }
            Instruction::IfFalse(target) => {
                ctx.write_u8(26);
                ctx.write_u32(*target);
            }
            Instruction::Goto(target) => {
                ctx.write_u8(27);
                ctx.write_u32(*target);
            }
            Instruction::Dup => ctx.write_u8(28),
            Instruction::Pop => ctx.write_u8(29),
            Instruction::Swap => ctx.write_u8(30),
            Instruction::Return => ctx.write_u8(31),
            Instruction::ReturnValue => ctx.write_u8(32),
            Instruction::Throw(class) => {
                ctx.write_u8(33);
                ctx.write_utf(class);
            }
            Instruction::Event => ctx.write_u8(34),
            Instruction::LoadCaller => ctx.write_u8(35),
            Instruction::Jsr(target) => {
                ctx.write_u8(36);
                ctx.write_u32(*target);
            }
            Instruction::Ret(slot) => {
                ctx.write_u8(37);
                ctx.write_u16(*slot);
            }
            Instruction::MonitorEnter => ctx.write_u8(38),
            Instruction::MonitorExit => ctx.write_u8(39),
            Instruction::ChargeCpu(amount) => {
                ctx.write_u8(40);
                ctx.write_u64(*amount);
            }
            Instruction::ChargeRam(amount) => {
                ctx.write_u8(41);
                ctx.write_u64(*amount);
            }
            Instruction::FromContract => ctx.write_u8(42),
            Instruction::PayableFromContract => ctx.write_u8(43),
            Instruction::Mint => ctx.write_u8(44),
            Instruction::Burn => ctx.write_u8(45),
        }
    }

    fn unmarshal(ctx: &mut UnmarshallingContext<'_>) -> ChainResult<Self> {
        match ctx.read_u8()? {
            0 => Ok(Instruction::Const(StorageValue::unmarshal(ctx)?)),
            1 => Ok(Instruction::Load(ctx.read_u16()?)),
            2 => Ok(Instruction::Store(ctx.read_u16()?)),
            3 => Ok(Instruction::GetField(FieldSignature::unmarshal(ctx)?)),
            4 => Ok(Instruction::PutField(FieldSignature::unmarshal(ctx)?)),
            5 => Ok(Instruction::GetFieldLazy(FieldSignature::unmarshal(ctx)?)),
            6 => Ok(Instruction::GetStatic(FieldSignature::unmarshal(ctx)?)),
            7 => Ok(Instruction::PutStatic(FieldSignature::unmarshal(ctx)?)),
            8 => Ok(Instruction::New(ctx.read_utf()?)),
            9 => Ok(Instruction::Call(MethodSignature::unmarshal(ctx)?)),
            10 => Ok(Instruction::CallConstructor(ConstructorSignature::unmarshal(ctx)?)),
            11 => Ok(Instruction::Add),
            12 => Ok(Instruction::Sub),
            13 => Ok(Instruction::Mul),
            14 => Ok(Instruction::Div),
            15 => Ok(Instruction::Rem),
            16 => Ok(Instruction::Neg),
            17 => Ok(Instruction::Eq),
            18 => Ok(Instruction::Ne),
            19 => Ok(Instruction::Lt),
            20 => Ok(Instruction::Le),
            21 => Ok(Instruction::Gt),
            22 => Ok(Instruction::Ge),
            23 => Ok(Instruction::IsNull),
            24 => Ok(Instruction::Not),
            25 => Ok(Instruction::IfTrue(ctx.read_u32()?)),
            26 => Ok(Instruction::IfFalse(ctx.read_u32()?)),
            27 => Ok(Instruction::Goto(ctx.read_u32()?)),
            28 => Ok(Instruction::Dup),
            29 => Ok(Instruction::Pop),
            30 => Ok(Instruction::Swap),
            31 => Ok(Instruction::Return),
            32 => Ok(Instruction::ReturnValue),
            33 => Ok(Instruction::Throw(ctx.read_utf()?)),
            34 => Ok(Instruction::Event),
            35 => Ok(Instruction::LoadCaller),
            36 => Ok(Instruction::Jsr(ctx.read_u32()?)),
            37 => Ok(Instruction::Ret(ctx.read_u16()?)),
            38 => Ok(Instruction::MonitorEnter),
            39 => Ok(Instruction::MonitorExit),
            40 => Ok(Instruction::ChargeCpu(ctx.read_u64()?)),
            41 => Ok(Instruction::ChargeRam(ctx.read_u64()?)),
            42 => Ok(Instruction::FromContract),
            43 => Ok(Instruction::PayableFromContract),
            44 => Ok(Instruction::Mint),
            45 => Ok(Instruction::Burn),
            other => Err(ChainError::marshalling(format!("unknown opcode {other}"))),
        }
    }
}

/// A field declaration of a class.
#[derive(Clone, Debug, PartialEq)]
pub struct Field {
    pub name: String,
    pub field_type: StorageType,
    /// Transient fields are not persisted and produce no updates.
    pub transient: bool,
}

impl Field {
    pub fn new(name: impl Into<String>, field_type: StorageType) -> Self {
        Self {
            name: name.into(),
            field_type,
            transient: false,
        }
    }

    pub fn transient(mut self) -> Self {
        self.transient = true;
        self
    }
}

impl Marshallable for Field {
    fn marshal(&self, ctx: &mut MarshallingContext) {
        ctx.write_utf(&self.name);
        self.field_type.marshal(ctx);
        ctx.write_bool(self.transient);
    }

    fn unmarshal(ctx: &mut UnmarshallingContext<'_>) -> ChainResult<Self> {
        Ok(Self {
            name: ctx.read_utf()?,
            field_type: StorageType::unmarshal(ctx)?,
            transient: ctx.read_bool()?,
        })
    }
}

const FLAG_STATIC: u16 = 1 << 0;
const FLAG_PUBLIC: u16 = 1 << 1;
const FLAG_FROM_CONTRACT: u16 = 1 << 2;
const FLAG_PAYABLE: u16 = 1 << 3;
const FLAG_VIEW: u16 = 1 << 4;
const FLAG_THROWS_EXCEPTIONS: u16 = 1 << 5;
const FLAG_SELF_CHARGED: u16 = 1 << 6;
const FLAG_SYNTHETIC: u16 = 1 << 7;
const FLAG_CLASS_INITIALIZER: u16 = 1 << 8;

/// A method or constructor (name [`CONSTRUCTOR_NAME`]) of a class.
#[derive(Clone, Debug, PartialEq)]
pub struct Method {
    pub name: String,
    pub formals: Vec<StorageType>,
    pub return_type: Option<StorageType>,
    pub is_static: bool,
    pub is_public: bool,
    pub from_contract: bool,
    pub payable: bool,
    pub view: bool,
    pub throws_exceptions: bool,
    pub self_charged: bool,
    pub synthetic: bool,
    pub class_initializer: bool,
    /// Classes of the checked exceptions this executable may propagate.
    pub throws: Vec<String>,
    /// Number of local slots, including `self` and the formals.
    pub locals: u16,
    pub code: Vec<Instruction>,
}

impl Method {
    pub fn new(
        name: impl Into<String>,
        formals: Vec<StorageType>,
        return_type: Option<StorageType>,
    ) -> Self {
        Self {
            name: name.into(),
            formals,
            return_type,
            is_static: false,
            is_public: true,
            from_contract: false,
            payable: false,
            view: false,
            throws_exceptions: false,
            self_charged: false,
            synthetic: false,
            class_initializer: false,
            throws: Vec::new(),
            locals: 0,
            code: Vec::new(),
        }
    }

    pub fn constructor(formals: Vec<StorageType>) -> Self {
        Self::new(CONSTRUCTOR_NAME, formals, None)
    }

    pub fn is_constructor(&self) -> bool {
        self.name == CONSTRUCTOR_NAME
    }

    pub fn static_method(mut self) -> Self {
        self.is_static = true;
        self
    }

    pub fn private(mut self) -> Self {
        self.is_public = false;
        self
    }

    pub fn from_contract(mut self) -> Self {
        self.from_contract = true;
        self
    }

    pub fn payable(mut self) -> Self {
        self.payable = true;
        self
    }

    pub fn view(mut self) -> Self {
        self.view = true;
        self
    }

    pub fn self_charged(mut self) -> Self {
        self.self_charged = true;
        self
    }

    pub fn throws_exceptions(mut self, classes: Vec<String>) -> Self {
        self.throws_exceptions = true;
        self.throws = classes;
        self
    }

    pub fn with_code(mut self, locals: u16, code: Vec<Instruction>) -> Self {
        self.locals = locals;
        self.code = code;
        self
    }

    pub fn signature(&self, defining_class: &str) -> MethodSignature {
        MethodSignature::new(
            defining_class,
            self.name.clone(),
            self.formals.clone(),
            self.return_type.clone(),
        )
    }

    fn flags(&self) -> u16 {
        let mut flags = 0;
        if self.is_static {
            flags |= FLAG_STATIC;
        }
        if self.is_public {
            flags |= FLAG_PUBLIC;
        }
        if self.from_contract {
            flags |= FLAG_FROM_CONTRACT;
        }
        if self.payable {
            flags |= FLAG_PAYABLE;
        }
        if self.view {
            flags |= FLAG_VIEW;
        }
        if self.throws_exceptions {
            flags |= FLAG_THROWS_EXCEPTIONS;
        }
        if self.self_charged {
            flags |= FLAG_SELF_CHARGED;
        }
        if self.synthetic {
            flags |= FLAG_SYNTHETIC;
        }
        if self.class_initializer {
            flags |= FLAG_CLASS_INITIALIZER;
        }
        flags
    }
}

impl Marshallable for Method {
    fn marshal(&self, ctx: &mut MarshallingContext) {
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
        ctx.write_u16(self.flags());
        ctx.write_compact_u32(self.throws.len() as u32);
        for class in &self.throws {
            ctx.write_utf(class);
        }
        ctx.write_u16(self.locals);
        ctx.write_compact_u32(self.code.len() as u32);
        for instruction in &self.code {
            instruction.marshal(ctx);
        }
    }

    fn unmarshal(ctx: &mut UnmarshallingContext<'_>) -> ChainResult<Self> {
        let name = ctx.read_utf()?;
        let formals = unmarshal_array::<StorageType>(ctx)?;
        let return_type = if ctx.read_bool()? {
            Some(StorageType::unmarshal(ctx)?)
        } else {
            None
        };
        let flags = ctx.read_u16()?;
        let throw_count = ctx.read_compact_u32()? as usize;
        let mut throws = Vec::with_capacity(throw_count.min(16));
        for _ in 0..throw_count {
            throws.push(ctx.read_utf()?);
        }
        let locals = ctx.read_u16()?;
        let code = unmarshal_array::<Instruction>(ctx)?;
        Ok(Self {
            name,
            formals,
            return_type,
            is_static: flags & FLAG_STATIC != 0,
            is_public: flags & FLAG_PUBLIC != 0,
            from_contract: flags & FLAG_FROM_CONTRACT != 0,
            payable: flags & FLAG_PAYABLE != 0,
            view: flags & FLAG_VIEW != 0,
            throws_exceptions: flags & FLAG_THROWS_EXCEPTIONS != 0,
            self_charged: flags & FLAG_SELF_CHARGED != 0,
            synthetic: flags & FLAG_SYNTHETIC != 0,
            class_initializer: flags & FLAG_CLASS_INITIALIZER != 0,
            throws,
            locals,
            code,
        })
    }
}

/// A class of a module.
#[derive(Clone, Debug, PartialEq)]
pub struct Class {
    pub name: String,
    pub superclass: Option<String>,
    /// Exported classes may be receivers and actuals of external requests.
    pub exported: bool,
    pub fields: Vec<Field>,
    pub methods: Vec<Method>,
}

impl Class {
    pub fn new(name: impl Into<String>, superclass: Option<&str>) -> Self {
        Self {
            name: name.into(),
            superclass: superclass.map(str::to_string),
            exported: false,
            fields: Vec::new(),
            methods: Vec::new(),
        }
    }

    pub fn exported(mut self) -> Self {
        self.exported = true;
        self
    }

    pub fn with_field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.methods.push(method);
        self
    }

    pub fn method(&self, name: &str, arity: usize) -> Option<&Method> {
        self.methods
            .iter()
            .find(|method| method.name == name && method.formals.len() == arity)
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|field| field.name == name)
    }
}

impl Marshallable for Class {
    fn marshal(&self, ctx: &mut MarshallingContext) {
        ctx.write_utf(&self.name);
        match &self.superclass {
            None => ctx.write_bool(false),
            Some(superclass) => {
                ctx.write_bool(true);
                ctx.write_utf(superclass);
            }
        }
        ctx.write_bool(self.exported);
        ctx.write_compact_u32(self.fields.len() as u32);
        for field in &self.fields {
            field.marshal(ctx);
        }
        ctx.write_compact_u32(self.methods.len() as u32);
        for method in &self.methods {
            method.marshal(ctx);
        }
    }

    fn unmarshal(ctx: &mut UnmarshallingContext<'_>) -> ChainResult<Self> {
        let name = ctx.read_utf()?;
        let superclass = if ctx.read_bool()? {
            Some(ctx.read_utf()?)
        } else {
            None
        };
        let exported = ctx.read_bool()?;
        let fields = unmarshal_array::<Field>(ctx)?;
        let methods = unmarshal_array::<Method>(ctx)?;
        Ok(Self {
            name,
            superclass,
            exported,
            fields,
            methods,
        })
    }
}

/// An uploaded module: the unit of the jar-store transactions.
#[derive(Clone, Debug, PartialEq)]
pub struct Module {
    pub classes: Vec<Class>,
}

impl Module {
    pub fn new(classes: Vec<Class>) -> Self {
        Self { classes }
    }

    pub fn class(&self, name: &str) -> Option<&Class> {
        self.classes.iter().find(|class| class.name == name)
    }
}

impl Marshallable for Module {
    fn marshal(&self, ctx: &mut MarshallingContext) {
        ctx.write_compact_u32(self.classes.len() as u32);
        for class in &self.classes {
            class.marshal(ctx);
        }
    }

    fn unmarshal(ctx: &mut UnmarshallingContext<'_>) -> ChainResult<Self> {
        Ok(Self {
            classes: unmarshal_array::<Class>(ctx)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_round_trip() {
        let module = Module::new(vec![Class::new("demo.Counter", Some("banyan.lang.Storage"))
            .exported()
            .with_field(Field::new("count", StorageType::Int))
            .with_method(
                Method::new("increment", vec![StorageType::Int], Some(StorageType::Int)).with_code(
                    2,
                    vec![
                        Instruction::Load(0),
                        Instruction::GetField(FieldSignature::new("demo.Counter", "count", StorageType::Int)),
                        Instruction::Load(1),
                        Instruction::Add,
                        Instruction::ReturnValue,
                    ],
                ),
            )]);
        let bytes = module.to_bytes();
        assert_eq!(Module::from_bytes(&bytes).unwrap(), module);
        // the encoding is canonical: marshalling twice yields the same bytes
        assert_eq!(bytes, Module::from_bytes(&bytes).unwrap().to_bytes());
    }

    #[test]
    fn method_flags_round_trip() {
        let method = Method::new("pay", vec![StorageType::big_integer()], None)
            .from_contract()
            .payable()
            .throws_exceptions(vec!["demo.Refused".to_string()]);
        let bytes = method.to_bytes();
        let back = Method::from_bytes(&bytes).unwrap();
        assert!(back.from_contract && back.payable && back.throws_exceptions);
        assert_eq!(back.throws, vec!["demo.Refused".to_string()]);
    }
}
