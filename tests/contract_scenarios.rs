//! Contract execution scenarios: uploaded modules running under the
//! instrumented interpreter, view isolation, verification failures and
//! the determinism of the merged root.

mod support;

use num_bigint::BigInt;
use tempfile::TempDir;

use banyan_chain::base_library::{
    balance_field, base_module, receive_signature, CONTRACT_CLASS, PAYABLE_CONTRACT_CLASS,
};
use banyan_chain::bytecode::{Class, Field, Instruction, Method, Module};
use banyan_chain::log_backed::LogBackedNode;
use banyan_chain::marshalling::Marshallable;
use banyan_chain::node_api::Node;
use banyan_chain::types::references::TransactionReference;
use banyan_chain::types::requests::{
    ConstructorCallTransactionRequest, InitialJarStoreTransactionRequest, TransactionRequest,
};
use banyan_chain::types::responses::TransactionResponse;
use banyan_chain::types::signatures::{ConstructorSignature, FieldSignature, MethodSignature};
use banyan_chain::types::storage_types::StorageType;
use banyan_chain::types::updates::Update;
use banyan_chain::types::values::StorageValue;

use support::*;

const PYRAMID_CLASS: &str = "demo.SimplePyramid";
const MINIMUM_INVESTMENT: u64 = 10_000;

fn payable_contract_type() -> StorageType {
    StorageType::Class(PAYABLE_CONTRACT_CLASS.to_string())
}

fn owner_field() -> FieldSignature {
    FieldSignature::new(PYRAMID_CLASS, "owner", payable_contract_type())
}

fn pot_field() -> FieldSignature {
    FieldSignature::new(PYRAMID_CLASS, "pot", StorageType::big_integer())
}

/// A pyramid scheme: investments accumulate in a pot that the first
/// investor may withdraw once the others contributed more than the
/// minimum investment.
fn pyramid_module() -> Module {
    let constructor = Method::constructor(vec![]).with_code(
        1,
        vec![
            Instruction::Load(0),
            Instruction::CallConstructor(ConstructorSignature::new(CONTRACT_CLASS, vec![])),
            Instruction::Load(0),
            Instruction::Const(StorageValue::big_integer(0)),
            Instruction::PutField(pot_field()),
            Instruction::Return,
        ],
    );

    let invest = Method::new("invest", vec![StorageType::big_integer()], None)
        .from_contract()
        .payable()
        .with_code(
            4,
            vec![
                /* 0 */ Instruction::Load(0),
                /* 1 */ Instruction::GetField(owner_field()),
                /* 2 */ Instruction::IsNull,
                /* 3 */ Instruction::IfFalse(8),
                /* 4 */ Instruction::Load(0),
                /* 5 */ Instruction::LoadCaller,
                /* 6 */ Instruction::PutField(owner_field()),
                /* 7 */ Instruction::Goto(14),
                /* 8 */ Instruction::Load(0),
                /* 9 */ Instruction::Load(0),
                /* 10 */ Instruction::GetField(pot_field()),
                /* 11 */ Instruction::Load(1),
                /* 12 */ Instruction::Add,
                /* 13 */ Instruction::PutField(pot_field()),
                /* 14 */ Instruction::Return,
            ],
        );

    let withdraw = Method::new("withdraw", vec![], None).from_contract().with_code(
        3,
        vec![
            /* 0 */ Instruction::Load(0),
            /* 1 */ Instruction::GetField(pot_field()),
            /* 2 */ Instruction::Const(StorageValue::big_integer(MINIMUM_INVESTMENT)),
            /* 3 */ Instruction::Gt,
            /* 4 */ Instruction::IfFalse(13),
            /* 5 */ Instruction::Load(0),
            /* 6 */ Instruction::GetField(owner_field()),
            /* 7 */ Instruction::Load(0),
            /* 8 */ Instruction::GetField(pot_field()),
            /* 9 */ Instruction::Call(receive_signature(StorageType::big_integer())),
            /* 10 */ Instruction::Load(0),
            /* 11 */ Instruction::Const(StorageValue::big_integer(0)),
            /* 12 */ Instruction::PutField(pot_field()),
            /* 13 */ Instruction::Return,
        ],
    );

    Module::new(vec![Class::new(PYRAMID_CLASS, Some(CONTRACT_CLASS))
        .exported()
        .with_field(Field::new("owner", payable_contract_type()))
        .with_field(Field::new("pot", StorageType::big_integer()))
        .with_method(constructor)
        .with_method(invest)
        .with_method(withdraw)])
}

fn install_pyramid(harness: &TestNode) -> (TransactionReference, banyan_chain::types::references::StorageReference) {
    let request = install_jar(harness, pyramid_module().to_bytes(), vec![harness.genesis.base_code]);
    let jar = request.reference();
    match harness.node.add_transaction(request).unwrap() {
        TransactionResponse::JarStoreSuccessful(_) => {}
        other => panic!("pyramid installation failed: {other:?}"),
    }

    let pyramid = harness
        .node
        .add_constructor_call_transaction(ConstructorCallTransactionRequest {
            header: header(harness, harness.genesis.gamete, jar, 0),
            constructor: ConstructorSignature::new(PYRAMID_CLASS, vec![]),
            actuals: vec![],
            signature: vec![],
        })
        .unwrap();
    (jar, pyramid)
}

fn invest(harness: &TestNode, jar: TransactionReference, pyramid: banyan_chain::types::references::StorageReference, investor: banyan_chain::types::references::StorageReference, amount: u64) {
    let request = instance_call(
        harness,
        investor,
        jar,
        pyramid,
        MethodSignature::new(PYRAMID_CLASS, "invest", vec![StorageType::big_integer()], None),
        vec![StorageValue::big_integer(amount)],
    );
    harness
        .node
        .add_instance_method_call_transaction(request)
        .unwrap();
}

fn withdraw(harness: &TestNode, jar: TransactionReference, pyramid: banyan_chain::types::references::StorageReference, investor: banyan_chain::types::references::StorageReference) {
    let request = instance_call(
        harness,
        investor,
        jar,
        pyramid,
        MethodSignature::new(PYRAMID_CLASS, "withdraw", vec![], None),
        vec![],
    );
    harness
        .node
        .add_instance_method_call_transaction(request)
        .unwrap();
}

#[test]
fn pyramid_pays_the_first_investor_once_the_pot_exceeds_the_minimum() {
    let harness = initialized_node();
    let (jar, pyramid) = install_pyramid(&harness);

    let starting_funds = 2 * MINIMUM_INVESTMENT;
    let first = create_account(&harness, starting_funds);
    let second = create_account(&harness, starting_funds);
    let third = create_account(&harness, starting_funds);

    // two investors: the pot holds only the second investment, no payout
    invest(&harness, jar, pyramid, first, MINIMUM_INVESTMENT);
    invest(&harness, jar, pyramid, second, MINIMUM_INVESTMENT);
    withdraw(&harness, jar, pyramid, first);
    assert!(balance_of(&harness, first) <= BigInt::from(starting_funds));
    assert_eq!(balance_of(&harness, first), BigInt::from(MINIMUM_INVESTMENT));

    // a third investor pushes the pot over the minimum: the withdraw pays
    invest(&harness, jar, pyramid, third, MINIMUM_INVESTMENT);
    withdraw(&harness, jar, pyramid, first);
    assert!(balance_of(&harness, first) > BigInt::from(2 * MINIMUM_INVESTMENT));
    assert_eq!(
        balance_of(&harness, first),
        BigInt::from(3 * MINIMUM_INVESTMENT)
    );
}

#[test]
fn reading_a_foreign_field_fails_verification() {
    let harness = initialized_node();
    let module = Module::new(vec![Class::new("demo.Snooper", Some(CONTRACT_CLASS))
        .exported()
        .with_method(Method::new("peek", vec![], None).with_code(
            1,
            vec![
                Instruction::Load(0),
                Instruction::GetField(balance_field()),
                Instruction::Pop,
                Instruction::Return,
            ],
        ))]);

    let request = install_jar(&harness, module.to_bytes(), vec![harness.genesis.base_code]);
    let response = harness.node.add_transaction(request).unwrap();
    match response {
        TransactionResponse::JarStoreFailed(failed) => {
            assert!(failed
                .cause
                .class_of_cause
                .starts_with("IllegalAccessToNonWhiteListedField"));
        }
        other => panic!("expected a failed installation, got {other:?}"),
    }
}

#[test]
fn view_methods_with_side_effects_are_detected() {
    let harness = initialized_node();
    let count_field = FieldSignature::new("demo.Counter", "count", StorageType::big_integer());
    let module = Module::new(vec![Class::new("demo.Counter", Some(CONTRACT_CLASS))
        .exported()
        .with_method(Method::constructor(vec![]).with_code(
            1,
            vec![
                Instruction::Load(0),
                Instruction::CallConstructor(ConstructorSignature::new(CONTRACT_CLASS, vec![])),
                Instruction::Load(0),
                Instruction::Const(StorageValue::big_integer(0)),
                Instruction::PutField(count_field.clone()),
                Instruction::Return,
            ],
        ))
        .with_method(
            Method::new("peek", vec![], Some(StorageType::big_integer()))
                .view()
                .with_code(
                    1,
                    vec![
                        Instruction::Load(0),
                        Instruction::GetField(count_field.clone()),
                        Instruction::ReturnValue,
                    ],
                ),
        )
        .with_method(
            Method::new("peekAndBump", vec![], Some(StorageType::big_integer()))
                .view()
                .with_code(
                    1,
                    vec![
                        Instruction::Load(0),
                        Instruction::Load(0),
                        Instruction::GetField(count_field.clone()),
                        Instruction::Const(StorageValue::big_integer(1)),
                        Instruction::Add,
                        Instruction::PutField(count_field.clone()),
                        Instruction::Load(0),
                        Instruction::GetField(count_field.clone()),
                        Instruction::ReturnValue,
                    ],
                ),
        )]);

    let request = install_jar(&harness, module.to_bytes(), vec![harness.genesis.base_code]);
    let jar = request.reference();
    harness.node.add_transaction(request).unwrap();

    let counter = harness
        .node
        .add_constructor_call_transaction(ConstructorCallTransactionRequest {
            header: header(&harness, harness.genesis.gamete, jar, 0),
            constructor: ConstructorSignature::new("demo.Counter", vec![]),
            actuals: vec![],
            signature: vec![],
        })
        .unwrap();

    let call = instance_call(
        &harness,
        harness.genesis.gamete,
        jar,
        counter,
        MethodSignature::new("demo.Counter", "peekAndBump", vec![], Some(StorageType::big_integer())),
        vec![],
    );
    let response = harness
        .node
        .add_transaction(TransactionRequest::InstanceMethodCall(call))
        .unwrap();
    match response {
        TransactionResponse::MethodFailed(failed) => {
            assert_eq!(
                failed.cause.class_of_cause,
                "banyan.lang.SideEffectsInViewMethodException"
            );
        }
        other => panic!("expected a failed call, got {other:?}"),
    }

    // the write never reached the store
    let state = harness.node.state(counter).unwrap();
    let count = state.iter().find_map(|update| match update {
        Update::Field { field, value, .. } if *field == count_field => Some(value.clone()),
        _ => None,
    });
    assert_eq!(count, Some(StorageValue::big_integer(0)));

    // a clean view method runs without committing anything
    let root_before = harness.node.merged_root();
    let peek = instance_call(
        &harness,
        harness.genesis.gamete,
        jar,
        counter,
        MethodSignature::new("demo.Counter", "peek", vec![], Some(StorageType::big_integer())),
        vec![],
    );
    let result = harness.node.run_instance_method_call(&peek).unwrap();
    assert_eq!(result, Some(StorageValue::big_integer(0)));
    assert_eq!(harness.node.merged_root(), root_before);

    // the view gas cap is a hard admission bound
    let mut capped = instance_call(
        &harness,
        harness.genesis.gamete,
        jar,
        counter,
        MethodSignature::new("demo.Counter", "peek", vec![], Some(StorageType::big_integer())),
        vec![],
    );
    capped.header.gas_limit = BigInt::from(CALL_GAS_LIMIT) * 2;
    match harness.node.run_instance_method_call(&capped) {
        Err(banyan_chain::errors::ChainError::TransactionRejected(message)) => {
            assert_eq!(message, "too much gas for view");
        }
        other => panic!("expected a rejection, got {other:?}"),
    }
}

#[test]
fn declared_exceptions_are_successful_outcomes() {
    let harness = initialized_node();
    let module = Module::new(vec![Class::new("demo.Refuser", Some(CONTRACT_CLASS))
        .exported()
        .with_method(Method::constructor(vec![]).with_code(
            1,
            vec![
                Instruction::Load(0),
                Instruction::CallConstructor(ConstructorSignature::new(CONTRACT_CLASS, vec![])),
                Instruction::Return,
            ],
        ))
        .with_method(
            Method::new("refuse", vec![], None)
                .throws_exceptions(vec!["demo.RefusedError".to_string()])
                .with_code(
                    1,
                    vec![
                        Instruction::Const(StorageValue::String("not today".to_string())),
                        Instruction::Throw("demo.RefusedError".to_string()),
                    ],
                ),
        )]);

    let request = install_jar(&harness, module.to_bytes(), vec![harness.genesis.base_code]);
    let jar = request.reference();
    harness.node.add_transaction(request).unwrap();

    let refuser = harness
        .node
        .add_constructor_call_transaction(ConstructorCallTransactionRequest {
            header: header(&harness, harness.genesis.gamete, jar, 0),
            constructor: ConstructorSignature::new("demo.Refuser", vec![]),
            actuals: vec![],
            signature: vec![],
        })
        .unwrap();

    let call = instance_call(
        &harness,
        harness.genesis.gamete,
        jar,
        refuser,
        MethodSignature::new("demo.Refuser", "refuse", vec![], None),
        vec![],
    );
    let response = harness
        .node
        .add_transaction(TransactionRequest::InstanceMethodCall(call))
        .unwrap();
    match response {
        TransactionResponse::MethodException(exception) => {
            assert_eq!(exception.cause.class_of_cause, "demo.RefusedError");
            assert_eq!(exception.cause.message, "not today");
        }
        other => panic!("expected a declared exception, got {other:?}"),
    }
}

#[test]
fn running_out_of_gas_fails_with_a_penalty() {
    let harness = initialized_node();
    let module = Module::new(vec![Class::new("demo.Spinner", Some(CONTRACT_CLASS))
        .exported()
        .with_method(Method::constructor(vec![]).with_code(
            1,
            vec![
                Instruction::Load(0),
                Instruction::CallConstructor(ConstructorSignature::new(CONTRACT_CLASS, vec![])),
                Instruction::Return,
            ],
        ))
        .with_method(Method::new("spin", vec![], None).with_code(1, vec![Instruction::Goto(0)]))]);

    let request = install_jar(&harness, module.to_bytes(), vec![harness.genesis.base_code]);
    let jar = request.reference();
    harness.node.add_transaction(request).unwrap();

    let spinner = harness
        .node
        .add_constructor_call_transaction(ConstructorCallTransactionRequest {
            header: header(&harness, harness.genesis.gamete, jar, 0),
            constructor: ConstructorSignature::new("demo.Spinner", vec![]),
            actuals: vec![],
            signature: vec![],
        })
        .unwrap();

    let mut call = instance_call(
        &harness,
        harness.genesis.gamete,
        jar,
        spinner,
        MethodSignature::new("demo.Spinner", "spin", vec![], None),
        vec![],
    );
    call.header.gas_limit = BigInt::from(5_000);
    let response = harness
        .node
        .add_transaction(TransactionRequest::InstanceMethodCall(call))
        .unwrap();
    match response {
        TransactionResponse::MethodFailed(failed) => {
            assert_eq!(failed.cause.class_of_cause, "banyan.lang.OutOfGasError");
            // gas conservation: what was not consumed is the penalty
            assert_eq!(failed.penalty, BigInt::from(5_000) - failed.gas.total());
        }
        other => panic!("expected an out-of-gas failure, got {other:?}"),
    }
}

#[test]
fn emitted_events_are_listed_and_persisted() {
    use banyan_chain::base_library::EVENT_CLASS;

    let harness = initialized_node();
    let module = Module::new(vec![Class::new("demo.Logger", Some(CONTRACT_CLASS))
        .exported()
        .with_method(Method::constructor(vec![]).with_code(
            1,
            vec![
                Instruction::Load(0),
                Instruction::CallConstructor(ConstructorSignature::new(CONTRACT_CLASS, vec![])),
                Instruction::Return,
            ],
        ))
        .with_method(Method::new("log", vec![], None).with_code(
            1,
            vec![
                Instruction::New(EVENT_CLASS.to_string()),
                Instruction::Dup,
                Instruction::CallConstructor(ConstructorSignature::new(EVENT_CLASS, vec![])),
                Instruction::Event,
                Instruction::Return,
            ],
        ))]);

    let request = install_jar(&harness, module.to_bytes(), vec![harness.genesis.base_code]);
    let jar = request.reference();
    harness.node.add_transaction(request).unwrap();

    let logger = harness
        .node
        .add_constructor_call_transaction(ConstructorCallTransactionRequest {
            header: header(&harness, harness.genesis.gamete, jar, 0),
            constructor: ConstructorSignature::new("demo.Logger", vec![]),
            actuals: vec![],
            signature: vec![],
        })
        .unwrap();

    let call = instance_call(
        &harness,
        harness.genesis.gamete,
        jar,
        logger,
        MethodSignature::new("demo.Logger", "log", vec![], None),
        vec![],
    );
    let response = harness
        .node
        .add_transaction(TransactionRequest::InstanceMethodCall(call))
        .unwrap();
    let events = response.events();
    assert_eq!(events.len(), 1);

    // the event is a storage object with a class tag of its own
    let (class, _) = harness.node.class_tag(events[0]).unwrap();
    assert_eq!(class, EVENT_CLASS);
}

#[test]
fn cyclic_object_graphs_deserialize_by_identity() {
    use banyan_chain::base_library::STORAGE_CLASS;

    let cell_type = StorageType::Class("demo.Cell".to_string());
    let next_field = FieldSignature::new("demo.Cell", "next", cell_type.clone());
    let harness = initialized_node();
    let module = Module::new(vec![Class::new("demo.Cell", Some(STORAGE_CLASS))
        .exported()
        .with_field(Field::new("next", cell_type.clone()))
        .with_method(Method::constructor(vec![]).with_code(
            1,
            vec![
                Instruction::Load(0),
                Instruction::CallConstructor(ConstructorSignature::new(STORAGE_CLASS, vec![])),
                Instruction::Return,
            ],
        ))
        .with_method(Method::new("setNext", vec![cell_type.clone()], None).with_code(
            2,
            vec![
                Instruction::Load(0),
                Instruction::Load(1),
                Instruction::PutField(next_field.clone()),
                Instruction::Return,
            ],
        ))
        .with_method(
            Method::new("grandNext", vec![], Some(cell_type.clone())).with_code(
                1,
                vec![
                    Instruction::Load(0),
                    Instruction::GetField(next_field.clone()),
                    Instruction::GetField(next_field.clone()),
                    Instruction::ReturnValue,
                ],
            ),
        )]);

    let request = install_jar(&harness, module.to_bytes(), vec![harness.genesis.base_code]);
    let jar = request.reference();
    harness.node.add_transaction(request).unwrap();

    let new_cell = |harness: &TestNode| {
        harness
            .node
            .add_constructor_call_transaction(ConstructorCallTransactionRequest {
                header: header(harness, harness.genesis.gamete, jar, 0),
                constructor: ConstructorSignature::new("demo.Cell", vec![]),
                actuals: vec![],
                signature: vec![],
            })
            .unwrap()
    };
    let a = new_cell(&harness);
    let b = new_cell(&harness);

    let set_next = |from, to| {
        let call = instance_call(
            &harness,
            harness.genesis.gamete,
            jar,
            from,
            MethodSignature::new("demo.Cell", "setNext", vec![cell_type.clone()], None),
            vec![StorageValue::Reference(to)],
        );
        harness
            .node
            .add_instance_method_call_transaction(call)
            .unwrap();
    };
    set_next(a, b);
    set_next(b, a);

    // following the cycle twice comes back to the starting object
    let call = instance_call(
        &harness,
        harness.genesis.gamete,
        jar,
        a,
        MethodSignature::new("demo.Cell", "grandNext", vec![], Some(cell_type.clone())),
        vec![],
    );
    let result = harness
        .node
        .add_instance_method_call_transaction(call)
        .unwrap();
    assert_eq!(result, Some(StorageValue::Reference(a)));
}

#[test]
fn replaying_the_same_log_produces_identical_roots() {
    use banyan_chain::types::references::StorageReference;
    use banyan_chain::types::requests::{
        GameteCreationTransactionRequest, JarStoreTransactionRequest, RequestHeader,
        TransferTransactionRequest,
    };

    // an ordered log built without consulting any node state
    let base_request = TransactionRequest::InitialJarStore(InitialJarStoreTransactionRequest {
        jar: base_module().to_bytes(),
        dependencies: vec![],
    });
    let base_code = base_request.reference();
    let gamete_request = TransactionRequest::GameteCreation(GameteCreationTransactionRequest {
        classpath: base_code,
        initial_amount: "1000000000000000".parse().unwrap(),
        red_initial_amount: "1000000000000000".parse().unwrap(),
        public_key: "MAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA".to_string(),
    });
    let gamete = StorageReference::new(gamete_request.reference(), 0);
    let jar_request = TransactionRequest::JarStore(JarStoreTransactionRequest {
        header: RequestHeader {
            caller: gamete,
            nonce: BigInt::from(0),
            chain_id: "test".to_string(),
            gas_limit: BigInt::from(CALL_GAS_LIMIT),
            gas_price: BigInt::from(0),
            classpath: base_code,
        },
        jar: pyramid_module().to_bytes(),
        dependencies: vec![base_code],
        signature: vec![],
    });
    let self_transfer = |nonce: u64, amount: i32| {
        TransactionRequest::Transfer(
            TransferTransactionRequest::new(
                gamete,
                BigInt::from(nonce),
                "test".to_string(),
                BigInt::from(0),
                base_code,
                gamete,
                StorageValue::Int(amount),
            )
            .unwrap(),
        )
    };
    let log = vec![
        base_request,
        gamete_request,
        jar_request,
        self_transfer(1, 100),
        self_transfer(2, 50),
    ];

    let run = |log: &[TransactionRequest]| {
        let dir = TempDir::new().unwrap();
        let node = LogBackedNode::open(&dir.path().join("db"), -1, test_consensus()).unwrap();
        let mut roots = Vec::new();
        for request in log {
            node.deliver(request).unwrap();
            roots.push(node.merged_root());
        }
        roots
    };

    let first = run(&log);
    let second = run(&log);
    assert_eq!(first, second);
    assert_eq!(first.len(), 5);
    // every delivery moves the commitment
    for window in first.windows(2) {
        assert_ne!(window[0], window[1]);
    }
    assert_eq!(first.last().unwrap().len(), 96);
}
