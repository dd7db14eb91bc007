//! Lifecycle of the single-process backend: mempool, worker, polling.

mod support;

use std::time::Duration;

use banyan_chain::config::NodeConfig;
use banyan_chain::node::LocalNode;
use banyan_chain::node_api::{initialize_node, Node};
use banyan_chain::types::requests::TransactionRequest;
use banyan_chain::types::responses::TransactionResponse;
use banyan_chain::types::values::StorageValue;
use tempfile::TempDir;

use support::{test_consensus, test_consensus_config};

fn local_node(dir: &TempDir) -> LocalNode {
    let config = NodeConfig {
        data_dir: dir.path().join("data"),
        key_path: dir.path().join("keys/node.toml"),
        mempool_limit: 64,
        transactions_per_block: 16,
        checkable_depth: -1,
        consensus: test_consensus_config(),
    };
    LocalNode::new(config).expect("node starts")
}

#[test]
fn local_node_processes_queued_transactions_in_order() {
    let dir = TempDir::new().unwrap();
    let node = local_node(&dir);
    let genesis = initialize_node(&node, &test_consensus(), None).unwrap();

    assert_eq!(node.base_code().unwrap(), genesis.base_code);
    assert_eq!(node.manifest().unwrap(), genesis.manifest);

    // a batch of self transfers posted asynchronously commits in order
    let mut references = Vec::new();
    for nonce in 1u64..=5 {
        let request = TransactionRequest::Transfer(
            banyan_chain::types::requests::TransferTransactionRequest::new(
                genesis.gamete,
                nonce.into(),
                "test".to_string(),
                0.into(),
                genesis.base_code,
                genesis.gamete,
                StorageValue::Int(nonce as i32),
            )
            .unwrap(),
        );
        references.push(node.post_transaction(request).unwrap());
    }
    for reference in references {
        let response = node.polled_response(reference, Duration::from_secs(5)).unwrap();
        assert!(matches!(response, TransactionResponse::VoidMethodSuccessful(_)));
    }
    assert_eq!(node.engine().nonce_of(genesis.gamete).unwrap(), 6.into());
}

#[test]
fn rejections_of_posted_requests_surface_through_polling() {
    let dir = TempDir::new().unwrap();
    let node = local_node(&dir);
    let genesis = initialize_node(&node, &test_consensus(), None).unwrap();

    let request = TransactionRequest::Transfer(
        banyan_chain::types::requests::TransferTransactionRequest::new(
            genesis.gamete,
            999.into(), // wrong nonce
            "test".to_string(),
            0.into(),
            genesis.base_code,
            genesis.gamete,
            StorageValue::Int(1),
        )
        .unwrap(),
    );
    let reference = node.post_transaction(request).unwrap();
    let outcome = node.polled_response(reference, Duration::from_secs(5));
    assert!(matches!(
        outcome,
        Err(banyan_chain::errors::ChainError::TransactionRejected(_))
    ));
}

#[test]
fn state_survives_a_restart() {
    let dir = TempDir::new().unwrap();
    let root = {
        let node = local_node(&dir);
        initialize_node(&node, &test_consensus(), None).unwrap();
        node.merged_root()
    };
    let reopened = local_node(&dir);
    assert_eq!(reopened.merged_root(), root);
    assert!(reopened.manifest().is_ok());
}
