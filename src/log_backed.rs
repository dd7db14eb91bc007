//! The replicated backend: the node is driven by an externally ordered
//! request log (the consensus collaborator is opaque here). Requests are
//! delivered in log order through the same pipeline as the local backend,
//! so two replicas fed the same log reach byte-identical merged roots.

use std::path::Path;
use std::time::{Duration, Instant};

use crate::config::ConsensusParams;
use crate::engine::Engine;
use crate::errors::{ChainError, ChainResult};
use crate::node_api::Node;
use crate::store::NodeStore;
use crate::types::references::{StorageReference, TransactionReference};
use crate::types::requests::{
    InstanceMethodCallTransactionRequest, StaticMethodCallTransactionRequest, TransactionRequest,
};
use crate::types::responses::TransactionResponse;
use crate::types::updates::Update;
use crate::types::values::StorageValue;

pub struct LogBackedNode {
    engine: Engine,
}

impl LogBackedNode {
    pub fn open(path: &Path, checkable_depth: i64, consensus: ConsensusParams) -> ChainResult<Self> {
        let store = NodeStore::open(path, checkable_depth)?;
        Ok(Self {
            engine: Engine::new(store, consensus),
        })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Delivers the next request of the log. The caller is the log
    /// consumer and guarantees the order; the merged root after each
    /// delivery is the state commitment for that log position.
    pub fn deliver(&self, request: &TransactionRequest) -> ChainResult<TransactionResponse> {
        self.engine.deliver(request)
    }

    /// The authenticated state commitment at the current log position.
    pub fn merged_root(&self) -> [u8; 96] {
        self.engine.merged_root()
    }

    /// Repositions the node at a past commitment, within the checkable
    /// depth of the store.
    pub fn checkout(&self, merged_root: &[u8; 96]) {
        self.engine.checkout(merged_root)
    }
}

impl Node for LogBackedNode {
    fn base_code(&self) -> ChainResult<TransactionReference> {
        self.engine.base_code()
    }

    fn manifest(&self) -> ChainResult<StorageReference> {
        self.engine.manifest()
    }

    fn class_tag(&self, object: StorageReference) -> ChainResult<(String, TransactionReference)> {
        self.engine.class_tag(object)
    }

    fn state(&self, object: StorageReference) -> ChainResult<Vec<Update>> {
        self.engine.state(object)
    }

    fn request(&self, reference: TransactionReference) -> ChainResult<Option<TransactionRequest>> {
        self.engine.request_at(reference)
    }

    fn response(&self, reference: TransactionReference) -> ChainResult<Option<TransactionResponse>> {
        self.engine.response_at(reference)
    }

    fn polled_response(
        &self,
        reference: TransactionReference,
        timeout: Duration,
    ) -> ChainResult<TransactionResponse> {
        // deliveries are synchronous on this backend: either the response
        // is already committed or it will be once the log reaches it
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(response) = self.engine.response_at(reference)? {
                return Ok(response);
            }
            if Instant::now() >= deadline {
                return Err(ChainError::PollTimeout(reference.to_string()));
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn add_transaction(&self, request: TransactionRequest) -> ChainResult<TransactionResponse> {
        self.deliver(&request)
    }

    fn post_transaction(&self, request: TransactionRequest) -> ChainResult<TransactionReference> {
        let reference = request.reference();
        self.deliver(&request)?;
        Ok(reference)
    }

    fn run_instance_method_call(
        &self,
        request: &InstanceMethodCallTransactionRequest,
    ) -> ChainResult<Option<StorageValue>> {
        self.engine.run_instance(request)
    }

    fn run_static_method_call(
        &self,
        request: &StaticMethodCallTransactionRequest,
    ) -> ChainResult<Option<StorageValue>> {
        self.engine.run_static(request)
    }
}
