//! The per-transaction execution context: the arena of live storage
//! objects, the gas meter and the runtime entry points reached by
//! instrumented code. The context is created fresh for each transaction
//! and destroyed at its end; instrumented code receives it explicitly.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use num_bigint::BigInt;
use num_traits::Signed;

use crate::base_library::{balance_field, red_balance_field, CONTRACT_CLASS};
use crate::classloader::EngineClassLoader;
use crate::errors::ChainError;
use crate::gas::GasCostModel;
use crate::store::StoreView;
use crate::types::references::{StorageReference, TransactionReference};
use crate::types::signatures::FieldSignature;
use crate::types::storage_types::StorageType;

pub const OUT_OF_GAS_ERROR: &str = "banyan.lang.OutOfGasError";
pub const DESERIALIZATION_ERROR: &str = "banyan.lang.DeserializationError";
pub const ILLEGAL_CALL_ERROR: &str = "banyan.lang.IllegalCallError";
pub const INSUFFICIENT_FUNDS_ERROR: &str = "banyan.lang.InsufficientFundsError";
pub const REQUIREMENT_VIOLATION_ERROR: &str = "banyan.lang.RequirementViolationError";
pub const ARITHMETIC_ERROR: &str = "banyan.lang.ArithmeticError";
pub const STACK_OVERFLOW_ERROR: &str = "banyan.lang.StackOverflowError";

/// Failures raised while running the body of a transaction. They never
/// escape the response builders, which map them onto response kinds.
#[derive(Debug)]
pub enum VmError {
    OutOfGas,
    /// An exception thrown by executed code.
    Thrown {
        class: String,
        message: String,
        location: String,
    },
    /// A malformed execution state: unresolvable code, stack underflow,
    /// type confusion. Always a transaction failure.
    IllegalState(String),
    Chain(ChainError),
}

impl From<ChainError> for VmError {
    fn from(error: ChainError) -> Self {
        VmError::Chain(error)
    }
}

impl VmError {
    pub fn thrown(class: &str, message: impl Into<String>, location: impl Into<String>) -> Self {
        VmError::Thrown {
            class: class.to_string(),
            message: message.into(),
            location: location.into(),
        }
    }
}

pub type VmResult<T> = Result<T, VmError>;

/// A runtime value: a storage value or a handle into the object arena.
#[derive(Clone, Debug, PartialEq)]
pub enum RtValue {
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
    Object(usize),
}

impl RtValue {
    pub fn as_big_integer(&self) -> Option<BigInt> {
        match self {
            RtValue::Int(v) => Some(BigInt::from(*v)),
            RtValue::Long(v) => Some(BigInt::from(*v)),
            RtValue::BigInteger(v) => Some(v.clone()),
            _ => None,
        }
    }

    pub fn default_of(storage_type: &StorageType) -> RtValue {
        match storage_type {
            StorageType::Boolean => RtValue::Boolean(false),
            StorageType::Byte => RtValue::Byte(0),
            StorageType::Char => RtValue::Char('\0'),
            StorageType::Short => RtValue::Short(0),
            StorageType::Int => RtValue::Int(0),
            StorageType::Long => RtValue::Long(0),
            StorageType::Float => RtValue::Float(0.0),
            StorageType::Double => RtValue::Double(0.0),
            StorageType::Class(_) => RtValue::Null,
        }
    }
}

/// A live storage object: its identity, its current fields and the images
/// they had when the object was loaded from store. The update extractor
/// emits exactly the fields whose current value differs from the old one.
pub struct ObjectState {
    pub reference: StorageReference,
    pub class: String,
    /// The module installation defining the runtime class.
    pub jar: TransactionReference,
    pub fields: BTreeMap<FieldSignature, RtValue>,
    pub old_fields: BTreeMap<FieldSignature, RtValue>,
    /// False for objects created by the current transaction.
    pub in_storage: bool,
}

pub struct GasMeter {
    remaining: BigInt,
    cpu: BigInt,
    ram: BigInt,
    storage: BigInt,
}

impl GasMeter {
    pub fn new(limit: BigInt) -> Self {
        Self {
            remaining: limit,
            cpu: BigInt::from(0),
            ram: BigInt::from(0),
            storage: BigInt::from(0),
        }
    }

    fn charge(&mut self, amount: &BigInt) -> VmResult<()> {
        if &self.remaining < amount {
            return Err(VmError::OutOfGas);
        }
        self.remaining -= amount;
        Ok(())
    }

    pub fn charge_cpu(&mut self, amount: u64) -> VmResult<()> {
        let amount = BigInt::from(amount);
        self.charge(&amount)?;
        self.cpu += amount;
        Ok(())
    }

    pub fn charge_ram(&mut self, amount: u64) -> VmResult<()> {
        let amount = BigInt::from(amount);
        self.charge(&amount)?;
        self.ram += amount;
        Ok(())
    }

    pub fn charge_storage(&mut self, amount: u64) -> VmResult<()> {
        let amount = BigInt::from(amount);
        self.charge(&amount)?;
        self.storage += amount;
        Ok(())
    }

    pub fn remaining(&self) -> &BigInt {
        &self.remaining
    }

    pub fn consumed_cpu(&self) -> &BigInt {
        &self.cpu
    }

    pub fn consumed_ram(&self) -> &BigInt {
        &self.ram
    }

    pub fn consumed_storage(&self) -> &BigInt {
        &self.storage
    }
}

pub struct ExecutionContext<'a> {
    pub classloader: Arc<EngineClassLoader>,
    pub store: &'a dyn StoreView,
    pub gas: GasMeter,
    pub gas_model: &'a GasCostModel,
    /// The transaction being executed; new objects take their references
    /// from it.
    pub transaction: TransactionReference,
    pub arena: Vec<ObjectState>,
    by_reference: HashMap<StorageReference, usize>,
    pub events: Vec<usize>,
    allows_mint_burn: bool,
    next_progressive: u32,
}

impl<'a> ExecutionContext<'a> {
    pub fn new(
        classloader: Arc<EngineClassLoader>,
        store: &'a dyn StoreView,
        gas_model: &'a GasCostModel,
        transaction: TransactionReference,
        gas_limit: BigInt,
        allows_mint_burn: bool,
    ) -> Self {
        Self {
            classloader,
            store,
            gas: GasMeter::new(gas_limit),
            gas_model,
            transaction,
            arena: Vec::new(),
            by_reference: HashMap::new(),
            events: Vec::new(),
            allows_mint_burn,
            next_progressive: 0,
        }
    }

    pub fn object(&self, index: usize) -> &ObjectState {
        &self.arena[index]
    }

    pub fn object_mut(&mut self, index: usize) -> &mut ObjectState {
        &mut self.arena[index]
    }

    pub fn index_of(&self, reference: &StorageReference) -> Option<usize> {
        self.by_reference.get(reference).copied()
    }

    /// Registers an object rehydrated from store; equal references yield
    /// the same arena index for the whole transaction.
    pub fn adopt(&mut self, object: ObjectState) -> usize {
        let reference = object.reference;
        let index = self.arena.len();
        self.arena.push(object);
        self.by_reference.insert(reference, index);
        index
    }

    /// Allocates a fresh object of the given class, assigning the next
    /// progressive reference within the current transaction.
    pub fn allocate(&mut self, class_name: &str) -> VmResult<usize> {
        let jar = self
            .classloader
            .jar_of(class_name)
            .ok_or_else(|| VmError::IllegalState(format!("cannot allocate unknown class {class_name}")))?;
        let reference = StorageReference::new(self.transaction, self.next_progressive);
        self.next_progressive += 1;
        let mut fields = BTreeMap::new();
        for signature in self.classloader.storage_fields_of(class_name) {
            fields.insert(signature.clone(), RtValue::default_of(&signature.field_type));
        }
        let index = self.arena.len();
        self.arena.push(ObjectState {
            reference,
            class: class_name.to_string(),
            jar,
            fields,
            old_fields: BTreeMap::new(),
            in_storage: false,
        });
        self.by_reference.insert(reference, index);
        Ok(index)
    }

    pub fn record_event(&mut self, index: usize) -> VmResult<()> {
        let class = self.arena[index].class.clone();
        if !self.classloader.is_event_class(&class) {
            return Err(VmError::IllegalState(format!("{class} is not an event class")));
        }
        self.events.push(index);
        Ok(())
    }

    pub fn event_references(&self) -> Vec<StorageReference> {
        self.events.iter().map(|index| self.arena[*index].reference).collect()
    }

    pub fn balance_of(&self, index: usize) -> BigInt {
        match self.arena[index].fields.get(&balance_field()) {
            Some(RtValue::BigInteger(balance)) => balance.clone(),
            _ => BigInt::from(0),
        }
    }

    pub fn set_balance(&mut self, index: usize, balance: BigInt) {
        self.arena[index]
            .fields
            .insert(balance_field(), RtValue::BigInteger(balance));
    }

    pub fn red_balance_of(&self, index: usize) -> BigInt {
        match self.arena[index].fields.get(&red_balance_field()) {
            Some(RtValue::BigInteger(balance)) => balance.clone(),
            _ => BigInt::from(0),
        }
    }

    pub fn set_red_balance(&mut self, index: usize, balance: BigInt) {
        self.arena[index]
            .fields
            .insert(red_balance_field(), RtValue::BigInteger(balance));
    }

    fn require_contract(&self, index: usize, location: &str) -> VmResult<()> {
        let class = &self.arena[index].class;
        if self.classloader.is_contract_class(class) {
            Ok(())
        } else {
            Err(VmError::thrown(
                ILLEGAL_CALL_ERROR,
                format!("{class} is not a contract"),
                location,
            ))
        }
    }

    /// Entry prologue of from-contract code: validates the caller.
    pub fn from_contract(&mut self, callee: usize, caller: usize) -> VmResult<()> {
        self.require_contract(caller, "from_contract")?;
        self.require_contract(callee, "from_contract")
    }

    /// Entry prologue of payable from-contract code: moves the paid amount
    /// from the caller to the callee before the body runs.
    pub fn payable_from_contract(&mut self, callee: usize, caller: usize, amount: &RtValue) -> VmResult<()> {
        self.from_contract(callee, caller)?;
        let amount = amount
            .as_big_integer()
            .ok_or_else(|| VmError::IllegalState("payable amount is not numeric".to_string()))?;
        if amount.is_negative() {
            return Err(VmError::thrown(
                REQUIREMENT_VIOLATION_ERROR,
                "payable amount cannot be negative",
                "payable_from_contract",
            ));
        }
        let caller_balance = self.balance_of(caller);
        if caller_balance < amount {
            return Err(VmError::thrown(
                INSUFFICIENT_FUNDS_ERROR,
                "insufficient balance for payment",
                "payable_from_contract",
            ));
        }
        self.set_balance(caller, caller_balance - &amount);
        let callee_balance = self.balance_of(callee);
        self.set_balance(callee, callee_balance + amount);
        Ok(())
    }

    /// Creates coins in the balance of the given contract. Only reachable
    /// through the gamete, when the consensus allows it.
    pub fn mint(&mut self, index: usize, amount: &RtValue) -> VmResult<()> {
        let amount = self.supply_amount(amount)?;
        let balance = self.balance_of(index);
        self.set_balance(index, balance + amount);
        Ok(())
    }

    /// Destroys coins from the balance of the given contract.
    pub fn burn(&mut self, index: usize, amount: &RtValue) -> VmResult<()> {
        let amount = self.supply_amount(amount)?;
        let balance = self.balance_of(index);
        if balance < amount {
            return Err(VmError::thrown(
                INSUFFICIENT_FUNDS_ERROR,
                "cannot burn more than the balance",
                "burn",
            ));
        }
        self.set_balance(index, balance - amount);
        Ok(())
    }

    fn supply_amount(&self, amount: &RtValue) -> VmResult<BigInt> {
        if !self.allows_mint_burn {
            return Err(VmError::thrown(
                ILLEGAL_CALL_ERROR,
                "the consensus forbids minting and burning",
                "supply",
            ));
        }
        let amount = amount
            .as_big_integer()
            .ok_or_else(|| VmError::IllegalState("supply amount is not numeric".to_string()))?;
        if amount.is_negative() {
            return Err(VmError::thrown(
                REQUIREMENT_VIOLATION_ERROR,
                "supply changes cannot be negative",
                "supply",
            ));
        }
        Ok(amount)
    }

    /// True when the runtime class of the object is a contract.
    pub fn is_contract(&self, index: usize) -> bool {
        self.classloader.is_contract_class(&self.arena[index].class)
    }
}

/// The contract type used for the trailing caller formal of instrumented
/// from-contract code.
pub fn contract_type() -> StorageType {
    StorageType::Class(CONTRACT_CLASS.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gas_meter_tracks_consumption_by_concern() {
        let mut meter = GasMeter::new(BigInt::from(100));
        meter.charge_cpu(40).unwrap();
        meter.charge_ram(30).unwrap();
        meter.charge_storage(20).unwrap();
        assert_eq!(meter.remaining(), &BigInt::from(10));
        assert_eq!(meter.consumed_cpu(), &BigInt::from(40));
        assert_eq!(meter.consumed_ram(), &BigInt::from(30));
        assert_eq!(meter.consumed_storage(), &BigInt::from(20));
        assert!(matches!(meter.charge_cpu(11), Err(VmError::OutOfGas)));
        // a failed charge does not consume anything
        assert_eq!(meter.remaining(), &BigInt::from(10));
    }

    #[test]
    fn defaults_follow_the_declared_type() {
        assert_eq!(RtValue::default_of(&StorageType::Int), RtValue::Int(0));
        assert_eq!(RtValue::default_of(&StorageType::big_integer()), RtValue::Null);
    }
}
