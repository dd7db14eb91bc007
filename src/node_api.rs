//! The uniform node interface exposed by both store backends, and the
//! genesis helper that takes an empty node to an initialized one.

use std::time::Duration;

use ed25519_dalek::Keypair;
use num_bigint::BigInt;

use crate::base_library::MANIFEST_CLASS;
use crate::config::ConsensusParams;
use crate::errors::{ChainError, ChainResult};
use crate::marshalling::Marshallable;
use crate::types::references::{StorageReference, TransactionReference};
use crate::types::requests::{
    ConstructorCallTransactionRequest, GameteCreationTransactionRequest, InitialJarStoreTransactionRequest,
    InitializationTransactionRequest, InstanceMethodCallTransactionRequest, JarStoreTransactionRequest,
    RequestHeader, StaticMethodCallTransactionRequest, TransactionRequest,
};
use crate::types::responses::TransactionResponse;
use crate::types::signatures::ConstructorSignature;
use crate::types::storage_types::StorageType;
use crate::types::updates::Update;
use crate::types::values::StorageValue;

/// The system boundary of a node. Once a request is accepted into the
/// log, outcomes surface as distinguished responses or rejections, never
/// as transport failures.
pub trait Node: Send + Sync {
    /// The installation of the base module.
    fn base_code(&self) -> ChainResult<TransactionReference>;

    /// The manifest object, once the node is initialized.
    fn manifest(&self) -> ChainResult<StorageReference>;

    /// The runtime class and defining installation of an object in store.
    fn class_tag(&self, object: StorageReference) -> ChainResult<(String, TransactionReference)>;

    /// The reconstructed state of an object: its class tag and the latest
    /// update of each of its fields.
    fn state(&self, object: StorageReference) -> ChainResult<Vec<Update>>;

    fn request(&self, reference: TransactionReference) -> ChainResult<Option<TransactionRequest>>;

    /// The committed response, absent until the transaction commits.
    fn response(&self, reference: TransactionReference) -> ChainResult<Option<TransactionResponse>>;

    /// Blocks until the response is committed, up to the given timeout.
    fn polled_response(
        &self,
        reference: TransactionReference,
        timeout: Duration,
    ) -> ChainResult<TransactionResponse>;

    /// Runs a request synchronously and returns its response.
    fn add_transaction(&self, request: TransactionRequest) -> ChainResult<TransactionResponse>;

    /// Queues a request and returns its future reference; the outcome is
    /// retrieved later through [`Node::polled_response`].
    fn post_transaction(&self, request: TransactionRequest) -> ChainResult<TransactionReference>;

    /// Runs a view instance call against the current state; nothing is
    /// committed.
    fn run_instance_method_call(
        &self,
        request: &InstanceMethodCallTransactionRequest,
    ) -> ChainResult<Option<StorageValue>>;

    /// Runs a view static call against the current state; nothing is
    /// committed.
    fn run_static_method_call(
        &self,
        request: &StaticMethodCallTransactionRequest,
    ) -> ChainResult<Option<StorageValue>>;

    fn add_jar_store_transaction(&self, request: JarStoreTransactionRequest) -> ChainResult<TransactionReference> {
        let wrapped = TransactionRequest::JarStore(request);
        let reference = wrapped.reference();
        match self.add_transaction(wrapped)? {
            TransactionResponse::JarStoreSuccessful(_) => Ok(reference),
            TransactionResponse::JarStoreFailed(failed) => Err(ChainError::Node(format!(
                "{}: {}",
                failed.cause.class_of_cause, failed.cause.message
            ))),
            _ => Err(ChainError::Node("unexpected response for a module installation".to_string())),
        }
    }

    fn add_constructor_call_transaction(
        &self,
        request: ConstructorCallTransactionRequest,
    ) -> ChainResult<StorageReference> {
        match self.add_transaction(TransactionRequest::ConstructorCall(request))? {
            TransactionResponse::ConstructorSuccessful(success) => Ok(success.new_object),
            TransactionResponse::ConstructorException(exception) => Err(ChainError::Node(format!(
                "{}: {}",
                exception.cause.class_of_cause, exception.cause.message
            ))),
            TransactionResponse::ConstructorFailed(failed) => Err(ChainError::Node(format!(
                "{}: {}",
                failed.cause.class_of_cause, failed.cause.message
            ))),
            _ => Err(ChainError::Node("unexpected response for a constructor call".to_string())),
        }
    }

    fn add_instance_method_call_transaction(
        &self,
        request: InstanceMethodCallTransactionRequest,
    ) -> ChainResult<Option<StorageValue>> {
        method_outcome(self.add_transaction(TransactionRequest::InstanceMethodCall(request))?)
    }

    fn add_static_method_call_transaction(
        &self,
        request: StaticMethodCallTransactionRequest,
    ) -> ChainResult<Option<StorageValue>> {
        method_outcome(self.add_transaction(TransactionRequest::StaticMethodCall(request))?)
    }
}

pub fn method_outcome(response: TransactionResponse) -> ChainResult<Option<StorageValue>> {
    match response {
        TransactionResponse::MethodSuccessful(success) => Ok(Some(success.result)),
        TransactionResponse::VoidMethodSuccessful(_) => Ok(None),
        TransactionResponse::MethodException(exception) => Err(ChainError::Node(format!(
            "{}: {}",
            exception.cause.class_of_cause, exception.cause.message
        ))),
        TransactionResponse::MethodFailed(failed) => Err(ChainError::Node(format!(
            "{}: {}",
            failed.cause.class_of_cause, failed.cause.message
        ))),
        _ => Err(ChainError::Node("unexpected response for a method call".to_string())),
    }
}

/// What genesis produced: the references every client needs.
#[derive(Clone, Debug)]
pub struct Genesis {
    pub base_code: TransactionReference,
    pub gamete: StorageReference,
    pub manifest: StorageReference,
}

const GENESIS_GAS_LIMIT: u64 = 1_000_000;

/// Takes an empty node to an initialized one: installs the base module,
/// creates the gamete with the configured supplies, creates the manifest
/// and records the initialization marker. The keypair signs the manifest
/// creation on behalf of the gamete; it may be absent when the signature
/// scheme is `empty`.
pub fn initialize_node(
    node: &dyn Node,
    consensus: &ConsensusParams,
    gamete_keypair: Option<&Keypair>,
) -> ChainResult<Genesis> {
    let base_request = TransactionRequest::InitialJarStore(InitialJarStoreTransactionRequest {
        jar: crate::base_library::base_module().to_bytes(),
        dependencies: vec![],
    });
    let base_code = base_request.reference();
    node.add_transaction(base_request)?;

    let gamete_request = TransactionRequest::GameteCreation(GameteCreationTransactionRequest {
        classpath: base_code,
        initial_amount: consensus.initial_supply.clone(),
        red_initial_amount: consensus.initial_red_supply.clone(),
        public_key: consensus.public_key_of_gamete.clone(),
    });
    let gamete = match node.add_transaction(gamete_request)? {
        TransactionResponse::GameteCreation(response) => response.gamete,
        _ => return Err(ChainError::Node("unexpected response for the gamete creation".to_string())),
    };

    let mut manifest_request = TransactionRequest::ConstructorCall(ConstructorCallTransactionRequest {
        header: RequestHeader {
            caller: gamete,
            nonce: BigInt::from(0),
            chain_id: consensus.chain_id.clone(),
            gas_limit: BigInt::from(GENESIS_GAS_LIMIT),
            gas_price: consensus.gas_price.clone(),
            classpath: base_code,
        },
        constructor: ConstructorSignature::new(MANIFEST_CLASS, vec![StorageType::string()]),
        actuals: vec![StorageValue::String(consensus.chain_id.clone())],
        signature: vec![],
    });
    match gamete_keypair {
        Some(keypair) => manifest_request.sign_with(consensus.signature, keypair),
        None => {
            if consensus.signature != crate::crypto::SignatureScheme::Empty {
                return Err(ChainError::Config(
                    "the configured signature scheme needs the keypair of the gamete".to_string(),
                ));
            }
        }
    }
    let manifest = match node.add_transaction(manifest_request)? {
        TransactionResponse::ConstructorSuccessful(response) => response.new_object,
        other => {
            return Err(ChainError::Node(format!(
                "the manifest could not be created: {:?}",
                other.failure_cause()
            )))
        }
    };

    node.add_transaction(TransactionRequest::Initialization(InitializationTransactionRequest {
        classpath: base_code,
        manifest,
    }))?;

    Ok(Genesis {
        base_code,
        gamete,
        manifest,
    })
}
