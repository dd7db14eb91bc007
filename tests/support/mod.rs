//! Shared harness for the engine integration tests: an initialized
//! log-backed node with the empty signature scheme, plus request helpers.

use num_bigint::BigInt;
use tempfile::TempDir;

use banyan_chain::base_library::EOA_CLASS;
use banyan_chain::config::{ConsensusConfig, ConsensusParams};
use banyan_chain::log_backed::LogBackedNode;
use banyan_chain::node_api::{initialize_node, Genesis, Node};
use banyan_chain::types::references::{StorageReference, TransactionReference};
use banyan_chain::types::requests::{
    ConstructorCallTransactionRequest, InstanceMethodCallTransactionRequest, JarStoreTransactionRequest,
    RequestHeader, TransactionRequest, TransferTransactionRequest,
};
use banyan_chain::types::signatures::{ConstructorSignature, MethodSignature};
use banyan_chain::types::storage_types::StorageType;
use banyan_chain::types::values::StorageValue;

pub const CALL_GAS_LIMIT: u64 = 1_000_000;

pub struct TestNode {
    pub node: LogBackedNode,
    pub genesis: Genesis,
    _dir: TempDir,
}

pub fn test_consensus_config() -> ConsensusConfig {
    ConsensusConfig {
        chain_id: "test".to_string(),
        signature: "empty".to_string(),
        allow_unsigned_faucet: true,
        allow_mint_burn_from_gamete: true,
        allows_self_charged: false,
        ignore_gas_price: true,
        gas_price: "1".to_string(),
        initial_supply: "1000000000000000".to_string(),
        initial_red_supply: "1000000000000000".to_string(),
        public_key_of_gamete: "MAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA".to_string(),
        max_gas_per_view_transaction: CALL_GAS_LIMIT,
    }
}

pub fn test_consensus() -> ConsensusParams {
    test_consensus_config().parse().expect("consensus parses")
}

pub fn initialized_node() -> TestNode {
    let dir = TempDir::new().expect("temp dir");
    let node = LogBackedNode::open(&dir.path().join("db"), -1, test_consensus()).expect("open node");
    let genesis = initialize_node(&node, &test_consensus(), None).expect("genesis");
    TestNode {
        node,
        genesis,
        _dir: dir,
    }
}

pub fn header(
    node: &TestNode,
    caller: StorageReference,
    classpath: TransactionReference,
    gas_price: u64,
) -> RequestHeader {
    RequestHeader {
        caller,
        nonce: node.node.engine().nonce_of(caller).expect("nonce"),
        chain_id: "test".to_string(),
        gas_limit: BigInt::from(CALL_GAS_LIMIT),
        gas_price: BigInt::from(gas_price),
        classpath,
    }
}

pub fn instance_call(
    node: &TestNode,
    caller: StorageReference,
    classpath: TransactionReference,
    receiver: StorageReference,
    method: MethodSignature,
    actuals: Vec<StorageValue>,
) -> InstanceMethodCallTransactionRequest {
    InstanceMethodCallTransactionRequest {
        header: header(node, caller, classpath, 0),
        method,
        receiver,
        actuals,
        signature: vec![],
    }
}

pub fn transfer(
    node: &TestNode,
    caller: StorageReference,
    receiver: StorageReference,
    amount: StorageValue,
    gas_price: u64,
) -> TransferTransactionRequest {
    let header = header(node, caller, node.genesis.base_code, gas_price);
    TransferTransactionRequest::new(
        header.caller,
        header.nonce,
        header.chain_id,
        header.gas_price,
        header.classpath,
        receiver,
        amount,
    )
    .expect("transfer request")
}

pub fn install_jar(
    node: &TestNode,
    jar: Vec<u8>,
    dependencies: Vec<TransactionReference>,
) -> TransactionRequest {
    TransactionRequest::JarStore(JarStoreTransactionRequest {
        header: header(node, node.genesis.gamete, node.genesis.base_code, 0),
        jar,
        dependencies,
        signature: vec![],
    })
}

/// Creates a fresh externally owned account and funds it from the gamete.
pub fn create_account(node: &TestNode, funds: u64) -> StorageReference {
    let request = ConstructorCallTransactionRequest {
        header: header(node, node.genesis.gamete, node.genesis.base_code, 0),
        constructor: ConstructorSignature::new(EOA_CLASS, vec![StorageType::string()]),
        actuals: vec![StorageValue::String(String::new())],
        signature: vec![],
    };
    let account = node
        .node
        .add_constructor_call_transaction(request)
        .expect("account creation");

    let funding = transfer(node, node.genesis.gamete, account, StorageValue::big_integer(funds), 0);
    node.node
        .add_transaction(TransactionRequest::Transfer(funding))
        .expect("account funding");
    account
}

pub fn balance_of(node: &TestNode, object: StorageReference) -> BigInt {
    node.node.engine().balance_of(object).expect("balance")
}

pub fn nonce_of(node: &TestNode, object: StorageReference) -> BigInt {
    node.node.engine().nonce_of(object).expect("nonce")
}
