//! Deterministic rewriting of verified modules: gas charges at basic-block
//! boundaries, from-contract prologues and call-site expansion, lazy field
//! loads. All nodes derive byte-identical instrumented modules from the
//! same input, so instrumented bytes can live in responses.

use std::collections::BTreeSet;

use crate::base_library::CONTRACT_CLASS;
use crate::bytecode::{Class, Instruction, Method, Module};
use crate::classloader::EngineClassLoader;
use crate::gas::GasCostModel;
use crate::types::signatures::{ConstructorSignature, MethodSignature};
use crate::types::storage_types::StorageType;
use crate::verification::VerifiedModule;

/// The formals of the instrumented variant of a from-contract executable:
/// the declared ones plus the trailing caller and dummy marker.
pub fn from_contract_formals(formals: &[StorageType]) -> Vec<StorageType> {
    let mut extended = formals.to_vec();
    extended.push(StorageType::Class(CONTRACT_CLASS.to_string()));
    extended.push(StorageType::Int);
    extended
}

pub fn instrument(verified: &VerifiedModule, loader: Option<&EngineClassLoader>, gas: &GasCostModel) -> Module {
    let instrumenter = Instrumenter {
        module: &verified.module,
        loader,
        gas,
    };
    Module::new(
        verified
            .module
            .classes
            .iter()
            .map(|class| instrumenter.instrument_class(class))
            .collect(),
    )
}

struct Instrumenter<'a> {
    module: &'a Module,
    loader: Option<&'a EngineClassLoader>,
    gas: &'a GasCostModel,
}

impl Instrumenter<'_> {
    fn find_class(&self, name: &str) -> Option<&Class> {
        self.module
            .class(name)
            .or_else(|| self.loader.and_then(|loader| loader.class(name)).map(|loaded| loaded.class.as_ref()))
    }

    fn resolve_method(&self, class_name: &str, method_name: &str, formals: &[StorageType]) -> Option<&Method> {
        let mut cursor = Some(class_name.to_string());
        while let Some(name) = cursor {
            let class = self.find_class(&name)?;
            if let Some(method) = class
                .methods
                .iter()
                .find(|method| method.name == method_name && method.formals == formals)
            {
                return Some(method);
            }
            cursor = class.superclass.clone();
        }
        None
    }

    fn resolve_constructor(&self, class_name: &str, formals: &[StorageType]) -> Option<&Method> {
        self.find_class(class_name)?
            .methods
            .iter()
            .find(|method| method.is_constructor() && method.formals == formals)
    }

    fn fields_in_hierarchy(&self, class_name: &str) -> usize {
        let mut count = 0;
        let mut cursor = Some(class_name.to_string());
        while let Some(name) = cursor {
            match self.find_class(&name) {
                None => break,
                Some(class) => {
                    count += class.fields.len();
                    cursor = class.superclass.clone();
                }
            }
        }
        count
    }

    fn instrument_class(&self, class: &Class) -> Class {
        let mut instrumented = class.clone();
        instrumented.methods = class
            .methods
            .iter()
            .map(|method| self.instrument_method(method))
            .collect();
        instrumented
    }

    fn instrument_method(&self, method: &Method) -> Method {
        let mut instrumented = method.clone();
        let declared_arity = method.formals.len() as u16;
        // locals: 0 holds the receiver, then the declared formals, then
        // (for from-contract code) the caller and the dummy marker
        let caller_slot = declared_arity + 1;

        // semantic pass: caller access, lazy loads, from-contract call sites
        let mut code = rewrite(&method.code, |instruction| match instruction {
            Instruction::LoadCaller => vec![Instruction::Load(caller_slot)],
            Instruction::GetField(field) if !field.field_type.is_eager() => {
                vec![Instruction::GetFieldLazy(field.clone())]
            }
            Instruction::Call(signature) => {
                // a from-contract target is either declared in this module
                // (exact formals) or an already instrumented dependency
                // (extended formals)
                let extended = from_contract_formals(&signature.formals);
                let target_is_from_contract = match self.resolve_method(
                    &signature.defining_class,
                    &signature.name,
                    &signature.formals,
                ) {
                    Some(target) => target.from_contract,
                    None => self
                        .resolve_method(&signature.defining_class, &signature.name, &extended)
                        .map(|target| target.from_contract)
                        .unwrap_or(false),
                };
                if target_is_from_contract {
                    vec![
                        Instruction::Load(0),
                        Instruction::Const(crate::types::values::StorageValue::Int(0)),
                        Instruction::Call(MethodSignature::new(
                            signature.defining_class.clone(),
                            signature.name.clone(),
                            extended,
                            signature.return_type.clone(),
                        )),
                    ]
                } else {
                    vec![instruction.clone()]
                }
            }
            Instruction::CallConstructor(signature) => {
                let extended = from_contract_formals(&signature.formals);
                let target_is_from_contract = match self.resolve_constructor(&signature.defining_class, &signature.formals) {
                    Some(target) => target.from_contract,
                    None => self
                        .resolve_constructor(&signature.defining_class, &extended)
                        .map(|target| target.from_contract)
                        .unwrap_or(false),
                };
                if target_is_from_contract {
                    vec![
                        Instruction::Load(0),
                        Instruction::Const(crate::types::values::StorageValue::Int(0)),
                        Instruction::CallConstructor(ConstructorSignature::new(
                            signature.defining_class.clone(),
                            extended,
                        )),
                    ]
                } else {
                    vec![instruction.clone()]
                }
            }
            other => vec![other.clone()],
        });

        // from-contract prologue: bind the caller and, for payable code,
        // transfer the amount before the body runs
        if method.from_contract {
            instrumented.formals = from_contract_formals(&method.formals);
            let mut prologue = vec![
                Instruction::Load(0),
                Instruction::Load(caller_slot),
                Instruction::FromContract,
            ];
            if method.payable {
                prologue.extend([
                    Instruction::Load(0),
                    Instruction::Load(caller_slot),
                    Instruction::Load(1),
                    Instruction::PayableFromContract,
                ]);
            }
            let offset = prologue.len() as u32;
            for instruction in &mut code {
                if let Some(target) = instruction.branch_target() {
                    set_branch_target(instruction, target + offset);
                }
            }
            prologue.extend(code);
            code = prologue;
            instrumented.locals = instrumented.locals.max(declared_arity + 3);
        }

        // gas pass: charge each basic block for its cpu cost and each
        // allocation for its ram footprint
        let leaders = block_leaders(&code);
        let costs = block_costs(&code, &leaders, self.gas);
        let mut charged = Vec::with_capacity(code.len() + leaders.len());
        let mut map = vec![0u32; code.len() + 1];
        for (index, instruction) in code.iter().enumerate() {
            map[index] = charged.len() as u32;
            if leaders.contains(&(index as u32)) {
                let cost = costs[&(index as u32)];
                if cost > 0 {
                    charged.push(Instruction::ChargeCpu(cost));
                }
            }
            if let Instruction::New(class_name) = instruction {
                charged.push(Instruction::ChargeRam(
                    self.gas.ram_cost_of_allocation(self.fields_in_hierarchy(class_name)),
                ));
            }
            charged.push(instruction.clone());
        }
        map[code.len()] = charged.len() as u32;
        for instruction in &mut charged {
            if let Some(target) = instruction.branch_target() {
                set_branch_target(instruction, map[target as usize]);
            }
        }

        instrumented.code = charged;
        instrumented
    }
}

/// Rewrites a body instruction by instruction, remapping branch targets to
/// the first replacement of their original target.
fn rewrite(code: &[Instruction], mut replace: impl FnMut(&Instruction) -> Vec<Instruction>) -> Vec<Instruction> {
    let mut new_code: Vec<Instruction> = Vec::with_capacity(code.len());
    let mut map = vec![0u32; code.len() + 1];
    for (index, instruction) in code.iter().enumerate() {
        map[index] = new_code.len() as u32;
        new_code.extend(replace(instruction));
    }
    map[code.len()] = new_code.len() as u32;
    for instruction in &mut new_code {
        if let Some(target) = instruction.branch_target() {
            set_branch_target(instruction, map[target as usize]);
        }
    }
    new_code
}

fn set_branch_target(instruction: &mut Instruction, new_target: u32) {
    match instruction {
        Instruction::IfTrue(target)
        | Instruction::IfFalse(target)
        | Instruction::Goto(target)
        | Instruction::Jsr(target) => *target = new_target,
        _ => {}
    }
}

fn block_leaders(code: &[Instruction]) -> BTreeSet<u32> {
    let mut leaders = BTreeSet::new();
    if !code.is_empty() {
        leaders.insert(0);
    }
    for (index, instruction) in code.iter().enumerate() {
        if let Some(target) = instruction.branch_target() {
            leaders.insert(target);
        }
        if instruction.ends_block() && index + 1 < code.len() {
            leaders.insert(index as u32 + 1);
        }
    }
    leaders
}

fn block_costs(
    code: &[Instruction],
    leaders: &BTreeSet<u32>,
    gas: &GasCostModel,
) -> std::collections::HashMap<u32, u64> {
    let mut costs = std::collections::HashMap::new();
    let bounds: Vec<u32> = leaders.iter().copied().collect();
    for (position, leader) in bounds.iter().enumerate() {
        let end = bounds
            .get(position + 1)
            .copied()
            .unwrap_or(code.len() as u32);
        let cost = code[*leader as usize..end as usize]
            .iter()
            .map(|instruction| gas.cpu_cost_of(instruction))
            .sum();
        costs.insert(*leader, cost);
    }
    costs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base_library::{base_module, receive_signature, GAMETE_CLASS, PAYABLE_CONTRACT_CLASS};
    use crate::bytecode::Field;
    use crate::marshalling::Marshallable;
    use crate::types::signatures::FieldSignature;
    use crate::verification::Verifier;
    use crate::whitelisting::WhiteListingWizard;

    fn instrumented_base() -> Module {
        let module = base_module();
        let wizard = WhiteListingWizard::new();
        let verified = Verifier::new(&module, None, &wizard, false, true).verify().unwrap();
        instrument(&verified, None, &GasCostModel::default())
    }

    #[test]
    fn instrumentation_is_deterministic() {
        assert_eq!(instrumented_base().to_bytes(), instrumented_base().to_bytes());
    }

    #[test]
    fn payable_receive_gains_the_transfer_prologue() {
        let module = instrumented_base();
        let payable = module.class(PAYABLE_CONTRACT_CLASS).unwrap();
        let receive = payable
            .methods
            .iter()
            .find(|method| method.name == "receive" && method.formals.len() == 3)
            .expect("instrumented receive has caller and dummy formals");
        assert!(receive.code.contains(&Instruction::FromContract));
        assert!(receive.code.contains(&Instruction::PayableFromContract));
    }

    #[test]
    fn from_contract_call_sites_pass_the_caller() {
        let module = instrumented_base();
        let gamete = module.class(GAMETE_CLASS).unwrap();
        let faucet = gamete.methods.iter().find(|method| method.name == "faucet").unwrap();
        let expected = MethodSignature::new(
            PAYABLE_CONTRACT_CLASS,
            "receive",
            from_contract_formals(&receive_signature(StorageType::big_integer()).formals),
            None,
        );
        assert!(faucet.code.iter().any(|instruction| matches!(
            instruction,
            Instruction::Call(signature) if *signature == expected
        )));
    }

    #[test]
    fn bodies_begin_with_a_cpu_charge() {
        let module = instrumented_base();
        let storage = module.class(crate::base_library::STORAGE_CLASS).unwrap();
        let constructor = storage.methods.iter().find(|method| method.is_constructor()).unwrap();
        assert!(matches!(constructor.code.first(), Some(Instruction::ChargeCpu(_))));
    }

    #[test]
    fn lazy_field_reads_are_redirected() {
        let field = FieldSignature::new("demo.Holder", "next", StorageType::Class("demo.Holder".to_string()));
        let module = Module::new(vec![Class::new("demo.Holder", Some(crate::base_library::STORAGE_CLASS))
            .with_field(Field::new("next", StorageType::Class("demo.Holder".to_string())))
            .with_method(
                Method::new("follow", vec![], Some(StorageType::Class("demo.Holder".to_string()))).with_code(
                    1,
                    vec![
                        Instruction::Load(0),
                        Instruction::GetField(field.clone()),
                        Instruction::ReturnValue,
                    ],
                ),
            )]);
        let wizard = WhiteListingWizard::new();
        let verified = Verifier::new(&module, None, &wizard, false, true).verify().unwrap();
        let instrumented = instrument(&verified, None, &GasCostModel::default());
        let follow = instrumented.class("demo.Holder").unwrap().method("follow", 0).unwrap();
        assert!(follow.code.contains(&Instruction::GetFieldLazy(field)));
        assert!(!follow.code.iter().any(|i| matches!(i, Instruction::GetField(_))));
    }

    #[test]
    fn branch_targets_survive_charging() {
        // a loop: the back-edge must land on the block's cpu charge
        let module = Module::new(vec![Class::new("demo.Loop", None).with_method(
            Method::new("spin", vec![StorageType::Int], None).with_code(
                2,
                vec![
                    Instruction::Load(1),                        // 0
                    Instruction::Const(crate::types::values::StorageValue::Int(0)), // 1
                    Instruction::Gt,                             // 2
                    Instruction::IfFalse(8),                     // 3
                    Instruction::Load(1),                        // 4
                    Instruction::Const(crate::types::values::StorageValue::Int(1)), // 5
                    Instruction::Sub,                            // 6: fall through to loop head?
                    Instruction::Goto(0),                        // 7
                    Instruction::Return,                         // 8
                ],
            ),
        )]);
        let wizard = WhiteListingWizard::new();
        let verified = Verifier::new(&module, None, &wizard, false, true).verify().unwrap();
        let instrumented = instrument(&verified, None, &GasCostModel::default());
        let spin = instrumented.class("demo.Loop").unwrap().method("spin", 1).unwrap();
        for instruction in &spin.code {
            if let Some(target) = instruction.branch_target() {
                assert!(matches!(
                    spin.code[target as usize],
                    Instruction::ChargeCpu(_)
                ));
            }
        }
    }
}
