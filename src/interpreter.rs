//! The deterministic stack interpreter of instrumented code. One frame
//! per activation, an operand stack of runtime values, explicit gas
//! charges inserted by instrumentation. Out of gas is a distinguished
//! error, never a code-level exception.

use num_bigint::BigInt;
use num_traits::{Signed, ToPrimitive, Zero};

use crate::bytecode::{Instruction, Method};
use crate::deserialization::{deserialize_last_lazy_update_for, value_to_runtime};
use crate::runtime::{ExecutionContext, RtValue, VmError, VmResult, ARITHMETIC_ERROR, STACK_OVERFLOW_ERROR};

/// Runs a resolved method or constructor. `this` must be present for
/// instance code and absent for static code; `args` are the actuals for
/// the (instrumented) formals, in order. Returns the value left for the
/// caller, if any.
pub fn invoke(
    ctx: &mut ExecutionContext<'_>,
    defining_class: &str,
    method: &Method,
    this: Option<usize>,
    args: Vec<RtValue>,
    depth: usize,
) -> VmResult<Option<RtValue>> {
    let location = format!("{}.{}", defining_class, method.name);
    if depth > ctx.gas_model.max_call_depth {
        return Err(VmError::thrown(STACK_OVERFLOW_ERROR, "call depth exceeded", &location));
    }

    let slots = (method.locals as usize).max(args.len() + if method.is_static { 0 } else { 1 });
    let mut locals: Vec<RtValue> = vec![RtValue::Null; slots];
    let mut cursor = 0;
    if !method.is_static {
        let receiver = this.ok_or_else(|| VmError::IllegalState(format!("{location} needs a receiver")))?;
        locals[0] = RtValue::Object(receiver);
        cursor = 1;
    }
    for argument in args {
        locals[cursor] = argument;
        cursor += 1;
    }

    let mut stack: Vec<RtValue> = Vec::new();
    let mut pc: usize = 0;

    macro_rules! pop {
        () => {
            stack
                .pop()
                .ok_or_else(|| VmError::IllegalState(format!("operand stack underflow in {location}")))?
        };
    }

    while pc < method.code.len() {
        let instruction = &method.code[pc];
        pc += 1;
        match instruction {
            Instruction::Const(value) => {
                let value = value.clone();
                stack.push(value_to_runtime(ctx, &value)?);
            }
            Instruction::Load(slot) => {
                let value = locals
                    .get(*slot as usize)
                    .cloned()
                    .ok_or_else(|| VmError::IllegalState(format!("bad local {slot} in {location}")))?;
                stack.push(value);
            }
            Instruction::Store(slot) => {
                let value = pop!();
                let slot = *slot as usize;
                if slot >= locals.len() {
                    locals.resize(slot + 1, RtValue::Null);
                }
                locals[slot] = value;
            }
            Instruction::GetField(field) => {
                let object = expect_object(pop!(), &location)?;
                let value = ctx
                    .object(object)
                    .fields
                    .get(field)
                    .cloned()
                    .unwrap_or_else(|| RtValue::default_of(&field.field_type));
                stack.push(value);
            }
            Instruction::GetFieldLazy(field) => {
                let object = expect_object(pop!(), &location)?;
                let cached = ctx.object(object).fields.get(field).cloned();
                let value = match cached {
                    Some(value) => value,
                    None => deserialize_last_lazy_update_for(ctx, object, field)?,
                };
                stack.push(value);
            }
            Instruction::PutField(field) => {
                let value = pop!();
                let object = expect_object(pop!(), &location)?;
                // writing a lazy field that was never read: its old image
                // must be fetched first, or the change cannot be detected
                if !field.field_type.is_eager() && !ctx.object(object).old_fields.contains_key(field) {
                    deserialize_last_lazy_update_for(ctx, object, field)?;
                }
                ctx.object_mut(object).fields.insert(field.clone(), value);
            }
            Instruction::GetStatic(_) | Instruction::PutStatic(_) => {
                return Err(VmError::IllegalState(format!("static state is not supported, in {location}")));
            }
            Instruction::New(class_name) => {
                let index = ctx.allocate(class_name)?;
                stack.push(RtValue::Object(index));
            }
            Instruction::Call(signature) => {
                let (_, _, target) = ctx
                    .classloader
                    .resolve_method(&signature.defining_class, &signature.name, &signature.formals)
                    .ok_or_else(|| {
                        VmError::IllegalState(format!("cannot resolve {signature} from {location}"))
                    })?;
                let mut arguments = vec![RtValue::Null; target.formals.len()];
                for slot in (0..target.formals.len()).rev() {
                    arguments[slot] = pop!();
                }
                let result = if target.is_static {
                    invoke(ctx, &signature.defining_class, &target, None, arguments, depth + 1)?
                } else {
                    let receiver = expect_object(pop!(), &location)?;
                    // virtual dispatch from the runtime class
                    let runtime_class = ctx.object(receiver).class.clone();
                    let (defining, _, resolved) = ctx
                        .classloader
                        .resolve_method(&runtime_class, &signature.name, &signature.formals)
                        .ok_or_else(|| {
                            VmError::IllegalState(format!("cannot resolve {signature} on {runtime_class}"))
                        })?;
                    invoke(ctx, &defining, &resolved, Some(receiver), arguments, depth + 1)?
                };
                if let Some(value) = result {
                    stack.push(value);
                }
            }
            Instruction::CallConstructor(signature) => {
                let target = ctx
                    .classloader
                    .resolve_constructor(&signature.defining_class, &signature.formals)
                    .ok_or_else(|| {
                        VmError::IllegalState(format!("cannot resolve {signature} from {location}"))
                    })?;
                let mut arguments = vec![RtValue::Null; target.formals.len()];
                for slot in (0..target.formals.len()).rev() {
                    arguments[slot] = pop!();
                }
                let receiver = expect_object(pop!(), &location)?;
                invoke(ctx, &signature.defining_class, &target, Some(receiver), arguments, depth + 1)?;
            }
            Instruction::Add => binary_numeric(&mut stack, &location, NumericOp::Add)?,
            Instruction::Sub => binary_numeric(&mut stack, &location, NumericOp::Sub)?,
            Instruction::Mul => binary_numeric(&mut stack, &location, NumericOp::Mul)?,
            Instruction::Div => binary_numeric(&mut stack, &location, NumericOp::Div)?,
            Instruction::Rem => binary_numeric(&mut stack, &location, NumericOp::Rem)?,
            Instruction::Neg => {
                let value = pop!();
                let negated = match value {
                    RtValue::Int(v) => RtValue::Int(-v),
                    RtValue::Long(v) => RtValue::Long(-v),
                    RtValue::BigInteger(v) => RtValue::BigInteger(-v),
                    RtValue::Float(v) => RtValue::Float(-v),
                    RtValue::Double(v) => RtValue::Double(-v),
                    other => {
                        return Err(VmError::IllegalState(format!("cannot negate {other:?} in {location}")))
                    }
                };
                stack.push(negated);
            }
            Instruction::Eq => {
                let b = pop!();
                let a = pop!();
                stack.push(RtValue::Boolean(a == b));
            }
            Instruction::Ne => {
                let b = pop!();
                let a = pop!();
                stack.push(RtValue::Boolean(a != b));
            }
            Instruction::Lt => comparison(&mut stack, &location, |ordering| ordering.is_lt())?,
            Instruction::Le => comparison(&mut stack, &location, |ordering| ordering.is_le())?,
            Instruction::Gt => comparison(&mut stack, &location, |ordering| ordering.is_gt())?,
            Instruction::Ge => comparison(&mut stack, &location, |ordering| ordering.is_ge())?,
            Instruction::IsNull => {
                let value = pop!();
                stack.push(RtValue::Boolean(value == RtValue::Null));
            }
            Instruction::Not => {
                let value = expect_boolean(pop!(), &location)?;
                stack.push(RtValue::Boolean(!value));
            }
            Instruction::IfTrue(target) => {
                if expect_boolean(pop!(), &location)? {
                    pc = *target as usize;
                }
            }
            Instruction::IfFalse(target) => {
                if !expect_boolean(pop!(), &location)? {
                    pc = *target as usize;
                }
            }
            Instruction::Goto(target) => pc = *target as usize,
            Instruction::Dup => {
                let value = pop!();
                stack.push(value.clone());
                stack.push(value);
            }
            Instruction::Pop => {
                pop!();
            }
            Instruction::Swap => {
                let b = pop!();
                let a = pop!();
                stack.push(b);
                stack.push(a);
            }
            Instruction::Return => return Ok(None),
            Instruction::ReturnValue => return Ok(Some(pop!())),
            Instruction::Throw(class) => {
                let message = match pop!() {
                    RtValue::String(message) => message,
                    RtValue::Null => String::new(),
                    other => format!("{other:?}"),
                };
                return Err(VmError::Thrown {
                    class: class.clone(),
                    message,
                    location,
                });
            }
            Instruction::Event => {
                let object = expect_object(pop!(), &location)?;
                ctx.record_event(object)?;
            }
            Instruction::LoadCaller => {
                return Err(VmError::IllegalState(format!("caller access survived instrumentation in {location}")));
            }
            Instruction::Jsr(_) | Instruction::Ret(_) | Instruction::MonitorEnter | Instruction::MonitorExit => {
                return Err(VmError::IllegalState(format!("forbidden instruction survived verification in {location}")));
            }
            Instruction::ChargeCpu(amount) => ctx.gas.charge_cpu(*amount)?,
            Instruction::ChargeRam(amount) => ctx.gas.charge_ram(*amount)?,
            Instruction::FromContract => {
                let caller = expect_object(pop!(), &location)?;
                let callee = expect_object(pop!(), &location)?;
                ctx.from_contract(callee, caller)?;
            }
            Instruction::PayableFromContract => {
                let amount = pop!();
                let caller = expect_object(pop!(), &location)?;
                let callee = expect_object(pop!(), &location)?;
                ctx.payable_from_contract(callee, caller, &amount)?;
            }
            Instruction::Mint => {
                let amount = pop!();
                let object = expect_object(pop!(), &location)?;
                ctx.mint(object, &amount)?;
            }
            Instruction::Burn => {
                let amount = pop!();
                let object = expect_object(pop!(), &location)?;
                ctx.burn(object, &amount)?;
            }
        }
    }

    Ok(None)
}

fn expect_object(value: RtValue, location: &str) -> VmResult<usize> {
    match value {
        RtValue::Object(index) => Ok(index),
        RtValue::Null => Err(VmError::thrown(
            "banyan.lang.NullPointerError",
            "null dereference",
            location,
        )),
        other => Err(VmError::IllegalState(format!("expected an object, found {other:?} in {location}"))),
    }
}

fn expect_boolean(value: RtValue, location: &str) -> VmResult<bool> {
    match value {
        RtValue::Boolean(value) => Ok(value),
        other => Err(VmError::IllegalState(format!("expected a boolean, found {other:?} in {location}"))),
    }
}

#[derive(Clone, Copy)]
enum NumericOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl NumericOp {
    fn on_big_integers(self, a: BigInt, b: BigInt, location: &str) -> VmResult<BigInt> {
        match self {
            NumericOp::Add => Ok(a + b),
            NumericOp::Sub => Ok(a - b),
            NumericOp::Mul => Ok(a * b),
            NumericOp::Div | NumericOp::Rem if b.is_zero() => {
                Err(VmError::thrown(ARITHMETIC_ERROR, "division by zero", location))
            }
            NumericOp::Div => Ok(a / b),
            NumericOp::Rem => Ok(a % b),
        }
    }

    fn on_doubles(self, a: f64, b: f64) -> f64 {
        match self {
            NumericOp::Add => a + b,
            NumericOp::Sub => a - b,
            NumericOp::Mul => a * b,
            NumericOp::Div => a / b,
            NumericOp::Rem => a % b,
        }
    }
}

/// Numeric binary operation with promotion: ints and longs widen to big
/// integers when mixed with one; floats stay in floating point. The
/// result keeps the widest integer type among the operands.
fn binary_numeric(stack: &mut Vec<RtValue>, location: &str, op: NumericOp) -> VmResult<()> {
    let b = stack
        .pop()
        .ok_or_else(|| VmError::IllegalState(format!("operand stack underflow in {location}")))?;
    let a = stack
        .pop()
        .ok_or_else(|| VmError::IllegalState(format!("operand stack underflow in {location}")))?;

    if matches!(a, RtValue::Float(_) | RtValue::Double(_)) || matches!(b, RtValue::Float(_) | RtValue::Double(_)) {
        let (x, y) = match (as_double(&a), as_double(&b)) {
            (Some(x), Some(y)) => (x, y),
            _ => return Err(VmError::IllegalState(format!("non-numeric operand in {location}"))),
        };
        let result = op.on_doubles(x, y);
        let value = if matches!((&a, &b), (RtValue::Float(_), RtValue::Float(_))) {
            RtValue::Float(result as f32)
        } else {
            RtValue::Double(result)
        };
        stack.push(value);
        return Ok(());
    }

    let x = a
        .as_big_integer()
        .ok_or_else(|| VmError::IllegalState(format!("non-numeric operand in {location}")))?;
    let y = b
        .as_big_integer()
        .ok_or_else(|| VmError::IllegalState(format!("non-numeric operand in {location}")))?;
    let result = op.on_big_integers(x, y, location)?;
    let value = match (&a, &b) {
        (RtValue::Int(_), RtValue::Int(_)) => RtValue::Int(wrap_i32(&result)),
        (RtValue::BigInteger(_), _) | (_, RtValue::BigInteger(_)) => RtValue::BigInteger(result),
        _ => RtValue::Long(wrap_i64(&result)),
    };
    stack.push(value);
    Ok(())
}

fn wrap_i32(value: &BigInt) -> i32 {
    value.to_i32().unwrap_or_else(|| {
        let modulus = BigInt::from(1u64 << 32);
        let mut reduced = value % &modulus;
        if reduced.is_negative() {
            reduced += &modulus;
        }
        reduced.to_u32().map(|v| v as i32).unwrap_or(0)
    })
}

fn wrap_i64(value: &BigInt) -> i64 {
    value.to_i64().unwrap_or_else(|| {
        let modulus = BigInt::from(1u128 << 64);
        let mut reduced = value % &modulus;
        if reduced.is_negative() {
            reduced += &modulus;
        }
        reduced.to_u64().map(|v| v as i64).unwrap_or(0)
    })
}

fn as_double(value: &RtValue) -> Option<f64> {
    match value {
        RtValue::Int(v) => Some(*v as f64),
        RtValue::Long(v) => Some(*v as f64),
        RtValue::Float(v) => Some(*v as f64),
        RtValue::Double(v) => Some(*v),
        _ => None,
    }
}

fn comparison(stack: &mut Vec<RtValue>, location: &str, accept: impl Fn(std::cmp::Ordering) -> bool) -> VmResult<()> {
    let b = stack
        .pop()
        .ok_or_else(|| VmError::IllegalState(format!("operand stack underflow in {location}")))?;
    let a = stack
        .pop()
        .ok_or_else(|| VmError::IllegalState(format!("operand stack underflow in {location}")))?;
    let ordering = match (&a, &b) {
        (RtValue::Float(_), _) | (_, RtValue::Float(_)) | (RtValue::Double(_), _) | (_, RtValue::Double(_)) => {
            let (x, y) = (as_double(&a), as_double(&b));
            match (x, y) {
                (Some(x), Some(y)) => x
                    .partial_cmp(&y)
                    .ok_or_else(|| VmError::IllegalState(format!("unordered comparison in {location}")))?,
                _ => return Err(VmError::IllegalState(format!("non-numeric comparison in {location}"))),
            }
        }
        _ => {
            let x = a
                .as_big_integer()
                .ok_or_else(|| VmError::IllegalState(format!("non-numeric comparison in {location}")))?;
            let y = b
                .as_big_integer()
                .ok_or_else(|| VmError::IllegalState(format!("non-numeric comparison in {location}")))?;
            x.cmp(&y)
        }
    };
    stack.push(RtValue::Boolean(accept(ordering)));
    Ok(())
}
