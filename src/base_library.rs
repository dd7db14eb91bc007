//! The platform's base module, installed by the initial jar-store
//! transaction. It defines the root storage classes, the contract and
//! account hierarchy and the manifest, and is the source of the
//! white-listing table.

use num_bigint::BigInt;

use crate::bytecode::{Class, Field, Instruction, Method, Module};
use crate::types::signatures::{ConstructorSignature, FieldSignature, MethodSignature};
use crate::types::storage_types::StorageType;
use crate::types::values::StorageValue;

pub const STORAGE_CLASS: &str = "banyan.lang.Storage";
pub const CONTRACT_CLASS: &str = "banyan.lang.Contract";
pub const PAYABLE_CONTRACT_CLASS: &str = "banyan.lang.PayableContract";
pub const EOA_CLASS: &str = "banyan.lang.ExternallyOwnedAccount";
pub const GAMETE_CLASS: &str = "banyan.lang.Gamete";
pub const EVENT_CLASS: &str = "banyan.lang.Event";
pub const MANIFEST_CLASS: &str = "banyan.lang.Manifest";

pub const BALANCE_FIELD: &str = "balance";
pub const RED_BALANCE_FIELD: &str = "balanceRed";
pub const NONCE_FIELD: &str = "nonce";
pub const PUBLIC_KEY_FIELD: &str = "publicKey";
pub const CHAIN_ID_FIELD: &str = "chainId";

pub const RECEIVE_METHOD: &str = "receive";
pub const FAUCET_METHOD: &str = "faucet";
pub const MINT_METHOD: &str = "mint";
pub const BURN_METHOD: &str = "burn";

pub fn balance_field() -> FieldSignature {
    FieldSignature::new(CONTRACT_CLASS, BALANCE_FIELD, StorageType::big_integer())
}

pub fn red_balance_field() -> FieldSignature {
    FieldSignature::new(CONTRACT_CLASS, RED_BALANCE_FIELD, StorageType::big_integer())
}

pub fn nonce_field() -> FieldSignature {
    FieldSignature::new(EOA_CLASS, NONCE_FIELD, StorageType::big_integer())
}

pub fn public_key_field() -> FieldSignature {
    FieldSignature::new(EOA_CLASS, PUBLIC_KEY_FIELD, StorageType::string())
}

pub fn chain_id_field() -> FieldSignature {
    FieldSignature::new(MANIFEST_CLASS, CHAIN_ID_FIELD, StorageType::string())
}

/// The `receive` overload of payable contracts for the given amount type.
pub fn receive_signature(amount_type: StorageType) -> MethodSignature {
    MethodSignature::new(PAYABLE_CONTRACT_CLASS, RECEIVE_METHOD, vec![amount_type], None)
}

fn zero() -> StorageValue {
    StorageValue::BigInteger(BigInt::from(0))
}

/// Builds the base module. The construction is deterministic: all nodes
/// derive byte-identical instrumented code from it.
pub fn base_module() -> Module {
    let storage = Class::new(STORAGE_CLASS, None)
        .exported()
        .with_method(Method::constructor(vec![]).with_code(1, vec![Instruction::Return]));

    let contract = Class::new(CONTRACT_CLASS, Some(STORAGE_CLASS))
        .exported()
        .with_field(Field::new(BALANCE_FIELD, StorageType::big_integer()))
        .with_field(Field::new(RED_BALANCE_FIELD, StorageType::big_integer()))
        .with_method(Method::constructor(vec![]).with_code(
            1,
            vec![
                Instruction::Load(0),
                Instruction::Const(zero()),
                Instruction::PutField(balance_field()),
                Instruction::Load(0),
                Instruction::Const(zero()),
                Instruction::PutField(red_balance_field()),
                Instruction::Return,
            ],
        ));

    let mut payable_contract = Class::new(PAYABLE_CONTRACT_CLASS, Some(CONTRACT_CLASS))
        .exported()
        .with_method(Method::constructor(vec![]).with_code(
            1,
            vec![
                Instruction::Load(0),
                Instruction::CallConstructor(ConstructorSignature::new(
                    CONTRACT_CLASS,
                    vec![],
                )),
                Instruction::Return,
            ],
        ));
    for amount_type in [StorageType::Int, StorageType::Long, StorageType::big_integer()] {
        payable_contract = payable_contract.with_method(
            Method::new(RECEIVE_METHOD, vec![amount_type], None)
                .from_contract()
                .payable()
                .with_code(2, vec![Instruction::Return]),
        );
    }

    let eoa = Class::new(EOA_CLASS, Some(PAYABLE_CONTRACT_CLASS))
        .exported()
        .with_field(Field::new(NONCE_FIELD, StorageType::big_integer()))
        .with_field(Field::new(PUBLIC_KEY_FIELD, StorageType::string()))
        .with_method(Method::constructor(vec![StorageType::string()]).with_code(
            2,
            vec![
                Instruction::Load(0),
                Instruction::CallConstructor(ConstructorSignature::new(
                    PAYABLE_CONTRACT_CLASS,
                    vec![],
                )),
                Instruction::Load(0),
                Instruction::Const(zero()),
                Instruction::PutField(nonce_field()),
                Instruction::Load(0),
                Instruction::Load(1),
                Instruction::PutField(public_key_field()),
                Instruction::Return,
            ],
        ));

    let gamete = Class::new(GAMETE_CLASS, Some(EOA_CLASS))
        .exported()
        .with_method(Method::constructor(vec![StorageType::string()]).with_code(
            2,
            vec![
                Instruction::Load(0),
                Instruction::Load(1),
                Instruction::CallConstructor(ConstructorSignature::new(
                    EOA_CLASS,
                    vec![StorageType::string()],
                )),
                Instruction::Return,
            ],
        ))
        .with_method(
            Method::new(
                FAUCET_METHOD,
                vec![
                    StorageType::Class(PAYABLE_CONTRACT_CLASS.to_string()),
                    StorageType::big_integer(),
                ],
                None,
            )
            .from_contract()
            .with_code(
                3,
                vec![
                    Instruction::Load(1),
                    Instruction::Load(2),
                    Instruction::Call(receive_signature(StorageType::big_integer())),
                    Instruction::Return,
                ],
            ),
        )
        .with_method(
            Method::new(MINT_METHOD, vec![StorageType::big_integer()], None)
                .from_contract()
                .with_code(
                    2,
                    vec![
                        Instruction::Load(0),
                        Instruction::Load(1),
                        Instruction::Mint,
                        Instruction::Return,
                    ],
                ),
        )
        .with_method(
            Method::new(BURN_METHOD, vec![StorageType::big_integer()], None)
                .from_contract()
                .with_code(
                    2,
                    vec![
                        Instruction::Load(0),
                        Instruction::Load(1),
                        Instruction::Burn,
                        Instruction::Return,
                    ],
                ),
        );

    let event = Class::new(EVENT_CLASS, Some(STORAGE_CLASS))
        .exported()
        .with_method(Method::constructor(vec![]).with_code(
            1,
            vec![
                Instruction::Load(0),
                Instruction::CallConstructor(ConstructorSignature::new(
                    STORAGE_CLASS,
                    vec![],
                )),
                Instruction::Return,
            ],
        ));

    let manifest = Class::new(MANIFEST_CLASS, Some(STORAGE_CLASS))
        .exported()
        .with_field(Field::new(CHAIN_ID_FIELD, StorageType::string()))
        .with_method(Method::constructor(vec![StorageType::string()]).with_code(
            2,
            vec![
                Instruction::Load(0),
                Instruction::Load(1),
                Instruction::PutField(chain_id_field()),
                Instruction::Return,
            ],
        ));

    Module::new(vec![storage, contract, payable_contract, eoa, gamete, event, manifest])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marshalling::Marshallable;

    #[test]
    fn base_module_is_deterministic() {
        assert_eq!(base_module().to_bytes(), base_module().to_bytes());
    }

    #[test]
    fn receive_overloads_are_payable_from_contract() {
        let module = base_module();
        let payable = module.class(PAYABLE_CONTRACT_CLASS).unwrap();
        for arity_type in [StorageType::Int, StorageType::Long, StorageType::big_integer()] {
            let receive = payable
                .methods
                .iter()
                .find(|m| m.name == RECEIVE_METHOD && m.formals == vec![arity_type.clone()])
                .unwrap();
            assert!(receive.payable && receive.from_contract);
        }
    }

    #[test]
    fn accounts_carry_nonce_and_public_key() {
        let module = base_module();
        let eoa = module.class(EOA_CLASS).unwrap();
        assert!(eoa.field(NONCE_FIELD).is_some());
        assert!(eoa.field(PUBLIC_KEY_FIELD).is_some());
    }
}
