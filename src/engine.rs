//! The transaction pipeline shared by the store backends: admission and
//! response building, the atomic commit of the (request, response,
//! histories) triple and the control-info bookkeeping. The merged root
//! after each delivery is a pure function of the ordered requests
//! delivered since genesis.

use num_bigint::BigInt;
use tracing::info;

use crate::base_library::chain_id_field;
use crate::builders::{build_response, run_instance_method_call, run_static_method_call};
use crate::caches::NodeCaches;
use crate::config::ConsensusParams;
use crate::deserialization::{class_tag_of, eager_state_of, state_of};
use crate::errors::{ChainError, ChainResult};
use crate::gas::GasCostModel;
use crate::store::{NodeStore, StoreView, INFO_ACCOUNTS, INFO_BASE_CODE, INFO_GAMETE, INFO_JAR, INFO_MANIFEST};
use crate::types::references::{StorageReference, TransactionReference};
use crate::types::requests::{
    InstanceMethodCallTransactionRequest, StaticMethodCallTransactionRequest, TransactionRequest,
};
use crate::types::responses::TransactionResponse;
use crate::types::updates::Update;
use crate::types::values::StorageValue;

pub struct Engine {
    store: NodeStore,
    caches: NodeCaches,
    consensus: ConsensusParams,
    gas_model: GasCostModel,
}

impl Engine {
    pub fn new(store: NodeStore, consensus: ConsensusParams) -> Self {
        Self {
            store,
            caches: NodeCaches::new(),
            consensus,
            gas_model: GasCostModel::default(),
        }
    }

    pub fn store(&self) -> &NodeStore {
        &self.store
    }

    pub fn consensus(&self) -> ConsensusParams {
        self.caches.consensus(&self.consensus)
    }

    pub fn merged_root(&self) -> [u8; 96] {
        self.store.merged_root()
    }

    pub fn checkout(&self, merged_root: &[u8; 96]) {
        self.store.checkout(merged_root);
        self.caches.invalidate_classloaders();
    }

    /// Runs one request through the pipeline and commits its effects.
    /// A rejection leaves the store untouched, commit count included.
    pub fn deliver(&self, request: &TransactionRequest) -> ChainResult<TransactionResponse> {
        let reference = request.reference();
        if self.store.response_of(&reference)?.is_some() {
            return Err(ChainError::rejected(format!("repeated request {reference}")));
        }

        let consensus = self.consensus();
        let mut txn = self.store.begin_transaction();
        let response = build_response(reference, request, &txn, &self.caches, &consensus, &self.gas_model)?;
        txn.push(reference, request, &response)?;

        match (request, &response) {
            (TransactionRequest::InitialJarStore(_), TransactionResponse::JarStoreInitial(_)) => {
                if txn.info(INFO_BASE_CODE)?.is_none() {
                    txn.set_info_reference(INFO_BASE_CODE, reference)?;
                }
                txn.set_info_reference(INFO_JAR, reference)?;
            }
            (TransactionRequest::GameteCreation(_), TransactionResponse::GameteCreation(created)) => {
                txn.set_info_storage_reference(INFO_GAMETE, created.gamete)?;
                txn.set_info_storage_reference(INFO_ACCOUNTS, created.gamete)?;
            }
            (TransactionRequest::Initialization(init), TransactionResponse::Initialization(_)) => {
                txn.set_info_storage_reference(INFO_MANIFEST, init.manifest)?;
            }
            _ => {}
        }

        txn.commit()?;

        if matches!(
            response,
            TransactionResponse::JarStoreInitial(_) | TransactionResponse::JarStoreSuccessful(_)
        ) {
            // a module installation may extend existing classpath chains
            self.caches.invalidate_classloaders();
        }

        info!(reference = %reference, commit = self.store.commit_count(), "delivered transaction");
        Ok(response)
    }

    pub fn run_instance(&self, request: &InstanceMethodCallTransactionRequest) -> ChainResult<Option<StorageValue>> {
        let consensus = self.consensus();
        let response = run_instance_method_call(request, &self.store, &self.caches, &consensus, &self.gas_model)?;
        view_outcome(response)
    }

    pub fn run_static(&self, request: &StaticMethodCallTransactionRequest) -> ChainResult<Option<StorageValue>> {
        let consensus = self.consensus();
        let response = run_static_method_call(request, &self.store, &self.caches, &consensus, &self.gas_model)?;
        view_outcome(response)
    }

    pub fn base_code(&self) -> ChainResult<TransactionReference> {
        self.store
            .info_reference(INFO_BASE_CODE)?
            .ok_or_else(|| ChainError::UnknownReference("no base module is installed yet".to_string()))
    }

    pub fn manifest(&self) -> ChainResult<StorageReference> {
        self.store
            .info_storage_reference(INFO_MANIFEST)?
            .ok_or_else(|| ChainError::UnknownReference("the node is not initialized yet".to_string()))
    }

    pub fn gamete(&self) -> ChainResult<StorageReference> {
        self.store
            .info_storage_reference(INFO_GAMETE)?
            .ok_or_else(|| ChainError::UnknownReference("no gamete exists yet".to_string()))
    }

    pub fn class_tag(&self, object: StorageReference) -> ChainResult<(String, TransactionReference)> {
        class_tag_of(&self.store, &object)?
            .ok_or_else(|| ChainError::UnknownReference(format!("{object} has no class tag in store")))
    }

    pub fn state(&self, object: StorageReference) -> ChainResult<Vec<Update>> {
        state_of(&self.store, &object)
    }

    pub fn request_at(&self, reference: TransactionReference) -> ChainResult<Option<TransactionRequest>> {
        self.store.get_request(&reference)
    }

    pub fn response_at(&self, reference: TransactionReference) -> ChainResult<Option<TransactionResponse>> {
        self.store.response_of(&reference)
    }

    /// Recomputes the consensus parameters from the manifest in store.
    /// Called explicitly after transactions that change the manifest.
    pub fn recompute_consensus(&self) -> ChainResult<()> {
        let manifest = self.manifest()?;
        let state = eager_state_of(&self.store, &manifest)?;
        let mut params = self.consensus.clone();
        if let Some(StorageValue::String(chain_id)) = state.get(&chain_id_field()) {
            params.chain_id = chain_id.clone();
        }
        self.caches.recompute_consensus(params);
        Ok(())
    }

    /// The balance of a contract in store, for clients and tests.
    pub fn balance_of(&self, object: StorageReference) -> ChainResult<BigInt> {
        let state = eager_state_of(&self.store, &object)?;
        Ok(state
            .get(&crate::base_library::balance_field())
            .and_then(StorageValue::as_big_integer)
            .cloned()
            .unwrap_or_else(|| BigInt::from(0)))
    }

    pub fn nonce_of(&self, object: StorageReference) -> ChainResult<BigInt> {
        let state = eager_state_of(&self.store, &object)?;
        Ok(state
            .get(&crate::base_library::nonce_field())
            .and_then(StorageValue::as_big_integer)
            .cloned()
            .unwrap_or_else(|| BigInt::from(0)))
    }
}

fn view_outcome(response: TransactionResponse) -> ChainResult<Option<StorageValue>> {
    match response {
        TransactionResponse::MethodSuccessful(r) => Ok(Some(r.result)),
        TransactionResponse::VoidMethodSuccessful(_) => Ok(None),
        TransactionResponse::MethodException(r) => Err(ChainError::Node(format!(
            "exception in view method: {}: {}",
            r.cause.class_of_cause, r.cause.message
        ))),
        TransactionResponse::MethodFailed(r) => Err(ChainError::Node(format!(
            "view method failed: {}: {}",
            r.cause.class_of_cause, r.cause.message
        ))),
        _ => Err(ChainError::Node("unexpected response for a view method".to_string())),
    }
}
