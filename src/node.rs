//! The local, single-process backend: a bounded mempool drained in FIFO
//! order by a worker that runs the shared pipeline. Producers block when
//! the mempool is full; every accepted request commits before the next
//! one is consumed.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::NodeConfig;
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

const POLL_INTERVAL: Duration = Duration::from_millis(10);

struct Job {
    request: TransactionRequest,
    reply: Option<Sender<ChainResult<TransactionResponse>>>,
}

struct LocalNodeInner {
    engine: Engine,
    /// Rejections of posted requests, so that polling clients learn the
    /// outcome; rejected requests leave no trace in the store.
    rejections: Mutex<HashMap<TransactionReference, String>>,
}

pub struct LocalNode {
    inner: Arc<LocalNodeInner>,
    sender: Option<Sender<Job>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl LocalNode {
    pub fn new(config: NodeConfig) -> ChainResult<Self> {
        config.ensure_directories()?;
        let store = NodeStore::open(&config.data_dir.join("db"), config.checkable_depth)?;
        let consensus = config.consensus.parse()?;
        let engine = Engine::new(store, consensus);
        let inner = Arc::new(LocalNodeInner {
            engine,
            rejections: Mutex::new(HashMap::new()),
        });

        let (sender, receiver) = bounded(config.mempool_limit);
        let worker_inner = inner.clone();
        let worker = thread::spawn(move || drain_mempool(worker_inner, receiver));

        info!(data_dir = ?config.data_dir, "node started");
        Ok(Self {
            inner,
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    pub fn engine(&self) -> &Engine {
        &self.inner.engine
    }

    pub fn merged_root(&self) -> [u8; 96] {
        self.inner.engine.merged_root()
    }

    fn sender(&self) -> ChainResult<&Sender<Job>> {
        self.sender
            .as_ref()
            .ok_or_else(|| ChainError::Node("the node is shutting down".to_string()))
    }
}

impl Drop for LocalNode {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn drain_mempool(inner: Arc<LocalNodeInner>, receiver: Receiver<Job>) {
    for job in receiver {
        let reference = job.request.reference();
        let result = inner.engine.deliver(&job.request);
        if let Err(ChainError::TransactionRejected(message)) = &result {
            warn!(reference = %reference, message, "request rejected");
            inner.rejections.lock().insert(reference, message.clone());
        }
        if let Some(reply) = job.reply {
            let _ = reply.send(result);
        }
    }
}

impl Node for LocalNode {
    fn base_code(&self) -> ChainResult<TransactionReference> {
        self.inner.engine.base_code()
    }

    fn manifest(&self) -> ChainResult<StorageReference> {
        self.inner.engine.manifest()
    }

    fn class_tag(&self, object: StorageReference) -> ChainResult<(String, TransactionReference)> {
        self.inner.engine.class_tag(object)
    }

    fn state(&self, object: StorageReference) -> ChainResult<Vec<Update>> {
        self.inner.engine.state(object)
    }

    fn request(&self, reference: TransactionReference) -> ChainResult<Option<TransactionRequest>> {
        self.inner.engine.request_at(reference)
    }

    fn response(&self, reference: TransactionReference) -> ChainResult<Option<TransactionResponse>> {
        self.inner.engine.response_at(reference)
    }

    fn polled_response(
        &self,
        reference: TransactionReference,
        timeout: Duration,
    ) -> ChainResult<TransactionResponse> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(response) = self.inner.engine.response_at(reference)? {
                return Ok(response);
            }
            if let Some(message) = self.inner.rejections.lock().get(&reference) {
                return Err(ChainError::TransactionRejected(message.clone()));
            }
            if Instant::now() >= deadline {
                return Err(ChainError::PollTimeout(reference.to_string()));
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn add_transaction(&self, request: TransactionRequest) -> ChainResult<TransactionResponse> {
        let (reply, outcome) = bounded(1);
        self.sender()?
            .send(Job {
                request,
                reply: Some(reply),
            })
            .map_err(|_| ChainError::Node("the mempool is closed".to_string()))?;
        outcome
            .recv()
            .map_err(|_| ChainError::Node("the node worker stopped".to_string()))?
    }

    fn post_transaction(&self, request: TransactionRequest) -> ChainResult<TransactionReference> {
        let reference = request.reference();
        self.sender()?
            .send(Job {
                request,
                reply: None,
            })
            .map_err(|_| ChainError::Node("the mempool is closed".to_string()))?;
        Ok(reference)
    }

    fn run_instance_method_call(
        &self,
        request: &InstanceMethodCallTransactionRequest,
    ) -> ChainResult<Option<StorageValue>> {
        self.inner.engine.run_instance(request)
    }

    fn run_static_method_call(
        &self,
        request: &StaticMethodCallTransactionRequest,
    ) -> ChainResult<Option<StorageValue>> {
        self.inner.engine.run_static(request)
    }
}
