use num_bigint::BigInt;

use crate::bytecode::Instruction;

/// Static cost table for gas accounting. Costs are in gas units; coins are
/// charged as units times the gas price of the request.
#[derive(Clone, Debug)]
pub struct GasCostModel {
    /// Base cpu cost charged to any transaction at admission.
    pub cpu_base_transaction_cost: u64,
    /// Cpu cost of installing one byte of a module.
    pub cpu_cost_per_jar_byte: u64,
    /// Ram cost of allocating one object.
    pub ram_cost_of_object: u64,
    /// Ram cost of one field slot of an allocated object.
    pub ram_cost_of_field: u64,
    /// Storage cost of one byte of a marshalled request or response.
    pub storage_cost_per_byte: u64,
    /// Maximum interpreter call depth.
    pub max_call_depth: usize,
}

impl Default for GasCostModel {
    fn default() -> Self {
        Self {
            cpu_base_transaction_cost: 10,
            cpu_cost_per_jar_byte: 1,
            ram_cost_of_object: 8,
            ram_cost_of_field: 2,
            storage_cost_per_byte: 1,
            max_call_depth: 128,
        }
    }
}

impl GasCostModel {
    /// Cpu cost of a single instruction, used by the instrumenter to price
    /// basic blocks. Control transfer and calls weigh more than plain
    /// stack traffic.
    pub fn cpu_cost_of(&self, instruction: &Instruction) -> u64 {
        match instruction {
            Instruction::Call(_) | Instruction::CallConstructor(_) => 5,
            Instruction::New(_) => 3,
            Instruction::GetField(_)
            | Instruction::GetFieldLazy(_)
            | Instruction::PutField(_)
            | Instruction::GetStatic(_)
            | Instruction::PutStatic(_) => 2,
            Instruction::IfTrue(_) | Instruction::IfFalse(_) | Instruction::Goto(_) => 2,
            Instruction::Throw(_) => 3,
            Instruction::ChargeCpu(_)
            | Instruction::ChargeRam(_)
            | Instruction::FromContract
            | Instruction::PayableFromContract => 0,
            _ => 1,
        }
    }

    pub fn ram_cost_of_allocation(&self, fields: usize) -> u64 {
        self.ram_cost_of_object + self.ram_cost_of_field * fields as u64
    }

    pub fn cpu_cost_of_jar(&self, jar_size: usize) -> u64 {
        self.cpu_base_transaction_cost + self.cpu_cost_per_jar_byte * jar_size as u64
    }

    pub fn storage_cost_of_bytes(&self, size: usize) -> u64 {
        self.storage_cost_per_byte * size as u64
    }

    /// Minimal admissible gas limit for a request of the given marshalled
    /// size: the cpu baseline plus the storage of the request itself.
    pub fn minimum_gas_for_request(&self, request_size: usize) -> BigInt {
        BigInt::from(self.cpu_base_transaction_cost + self.storage_cost_of_bytes(request_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instrumentation_pseudo_instructions_are_free() {
        let model = GasCostModel::default();
        assert_eq!(model.cpu_cost_of(&Instruction::ChargeCpu(7)), 0);
        assert_eq!(model.cpu_cost_of(&Instruction::FromContract), 0);
        assert!(model.cpu_cost_of(&Instruction::Pop) > 0);
    }

    #[test]
    fn minimum_gas_grows_with_request_size() {
        let model = GasCostModel::default();
        assert!(model.minimum_gas_for_request(100) > model.minimum_gas_for_request(10));
    }
}
