//! The persistent store of a node: three Merkle-Patricia tries (responses,
//! histories, control info) plus a plain column of requests, over one
//! RocksDB directory. Writers go through [`StoreTransaction`], whose
//! changes land atomically in a single batch; readers see the last
//! committed roots. The concatenation of the three roots is the
//! authenticated state commitment.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use rocksdb::{BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, IteratorMode, MultiThreaded, Options, WriteBatch};

use crate::errors::{ChainError, ChainResult};
use crate::marshalling::{Marshallable, MarshallingContext, UnmarshallingContext};
use crate::trie::{KeyValueStore, PatriciaTrie};
use crate::types::references::{StorageReference, TransactionReference};
use crate::types::requests::TransactionRequest;
use crate::types::responses::TransactionResponse;

pub(crate) const CF_RESPONSES: &str = "responses";
pub(crate) const CF_HISTORIES: &str = "histories";
pub(crate) const CF_INFO: &str = "info";
pub(crate) const CF_REQUESTS: &str = "requests";
pub(crate) const CF_GC: &str = "gc";
pub(crate) const CF_METADATA: &str = "metadata";

const ROOT_RESPONSES_KEY: &[u8] = b"root_responses";
const ROOT_HISTORIES_KEY: &[u8] = b"root_histories";
const ROOT_INFO_KEY: &[u8] = b"root_info";
const COMMIT_COUNT_KEY: &[u8] = b"commit_count";
const TRANSACTION_COUNT_KEY: &[u8] = b"transaction_count";

/// Tags of the control values kept in the info trie.
pub const INFO_BASE_CODE: u8 = 0x00;
pub const INFO_JAR: u8 = 0x01;
pub const INFO_ACCOUNTS: u8 = 0x02;
pub const INFO_COMMIT_COUNT: u8 = 0x03;
pub const INFO_NEXT: u8 = 0x04;
pub const INFO_MANIFEST: u8 = 0x05;
pub const INFO_GAMETE: u8 = 0x06;

const TRIES: [&str; 3] = [CF_RESPONSES, CF_HISTORIES, CF_INFO];

/// Read access to the store, committed or within a transaction.
pub trait StoreView {
    fn response_of(&self, reference: &TransactionReference) -> ChainResult<Option<TransactionResponse>>;

    /// The history of an object: the references of the transactions that
    /// contributed updates to it, most recent first, ending with the
    /// transaction that created it. Empty if the object is unknown.
    fn history_of(&self, object: &StorageReference) -> ChainResult<Vec<TransactionReference>>;

    fn info(&self, tag: u8) -> ChainResult<Option<Vec<u8>>>;

    fn info_reference(&self, tag: u8) -> ChainResult<Option<TransactionReference>> {
        match self.info(tag)? {
            None => Ok(None),
            Some(bytes) => Ok(Some(TransactionReference::from_bytes(&bytes)?)),
        }
    }

    fn info_storage_reference(&self, tag: u8) -> ChainResult<Option<StorageReference>> {
        match self.info(tag)? {
            None => Ok(None),
            Some(bytes) => {
                let mut ctx = UnmarshallingContext::new(&bytes);
                Ok(Some(StorageReference::unmarshal_without_selector(&mut ctx)?))
            }
        }
    }
}

#[derive(Clone, Copy, Default)]
struct StoreRoots {
    responses: Option<[u8; 32]>,
    histories: Option<[u8; 32]>,
    info: Option<[u8; 32]>,
    commit_count: u64,
    transaction_count: u64,
}

/// A key-value window over one column family, with an overlay of the
/// uncommitted writes of the current store transaction. Node records are
/// stored behind an 8-byte commit tag used by generation-based garbage
/// collection.
struct CfKv {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
    cf: &'static str,
    commit: u64,
    overlay: HashMap<Vec<u8>, Option<Vec<u8>>>,
}

impl CfKv {
    fn new(db: Arc<DBWithThreadMode<MultiThreaded>>, cf: &'static str, commit: u64) -> Self {
        Self {
            db,
            cf,
            commit,
            overlay: HashMap::new(),
        }
    }

    fn handle(&self) -> ChainResult<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(self.cf)
            .ok_or_else(|| ChainError::Config(format!("missing column family {}", self.cf)))
    }
}

impl KeyValueStore for CfKv {
    fn get(&self, key: &[u8]) -> ChainResult<Option<Vec<u8>>> {
        if let Some(entry) = self.overlay.get(key) {
            return Ok(entry.as_ref().map(|record| record[8..].to_vec()));
        }
        let cf = self.handle()?;
        match self.db.get_cf(&cf, key)? {
            Some(record) if record.len() >= 8 => Ok(Some(record[8..].to_vec())),
            Some(_) => Err(ChainError::Config("truncated trie node record".to_string())),
            None => Ok(None),
        }
    }

    fn put(&mut self, key: Vec<u8>, value: Vec<u8>) -> ChainResult<()> {
        let mut record = Vec::with_capacity(8 + value.len());
        record.extend_from_slice(&self.commit.to_be_bytes());
        record.extend_from_slice(&value);
        self.overlay.insert(key, Some(record));
        Ok(())
    }

    fn remove(&mut self, key: &[u8]) -> ChainResult<()> {
        self.overlay.insert(key.to_vec(), None);
        Ok(())
    }
}

pub struct NodeStore {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
    /// How many past commits can still be checked out. Zero garbage
    /// collects each commit as soon as the next one lands; negative
    /// disables collection entirely.
    checkable_depth: i64,
    current: RwLock<StoreRoots>,
}

impl NodeStore {
    pub fn open(path: &Path, checkable_depth: i64) -> ChainResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_RESPONSES, Options::default()),
            ColumnFamilyDescriptor::new(CF_HISTORIES, Options::default()),
            ColumnFamilyDescriptor::new(CF_INFO, Options::default()),
            ColumnFamilyDescriptor::new(CF_REQUESTS, Options::default()),
            ColumnFamilyDescriptor::new(CF_GC, Options::default()),
            ColumnFamilyDescriptor::new(CF_METADATA, Options::default()),
        ];
        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)?;
        let db = Arc::new(db);
        let current = Self::read_roots(&db)?;
        Ok(Self {
            db,
            checkable_depth,
            current: RwLock::new(current),
        })
    }

    fn metadata_cf(db: &DBWithThreadMode<MultiThreaded>) -> ChainResult<Arc<BoundColumnFamily<'_>>> {
        db.cf_handle(CF_METADATA)
            .ok_or_else(|| ChainError::Config("missing metadata column family".to_string()))
    }

    fn cf(&self, name: &'static str) -> ChainResult<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| ChainError::Config(format!("missing column family {name}")))
    }

    fn read_roots(db: &DBWithThreadMode<MultiThreaded>) -> ChainResult<StoreRoots> {
        let cf = Self::metadata_cf(db)?;
        let read_root = |key: &[u8]| -> ChainResult<Option<[u8; 32]>> {
            match db.get_cf(&cf, key)? {
                None => Ok(None),
                Some(bytes) => {
                    let root: [u8; 32] = bytes
                        .as_slice()
                        .try_into()
                        .map_err(|_| ChainError::Config("invalid root encoding".to_string()))?;
                    Ok(Some(root))
                }
            }
        };
        let read_u64 = |key: &[u8]| -> ChainResult<u64> {
            match db.get_cf(&cf, key)? {
                None => Ok(0),
                Some(bytes) => {
                    let bytes: [u8; 8] = bytes
                        .as_slice()
                        .try_into()
                        .map_err(|_| ChainError::Config("invalid counter encoding".to_string()))?;
                    Ok(u64::from_be_bytes(bytes))
                }
            }
        };
        Ok(StoreRoots {
            responses: read_root(ROOT_RESPONSES_KEY)?,
            histories: read_root(ROOT_HISTORIES_KEY)?,
            info: read_root(ROOT_INFO_KEY)?,
            commit_count: read_u64(COMMIT_COUNT_KEY)?,
            transaction_count: read_u64(TRANSACTION_COUNT_KEY)?,
        })
    }

    pub fn commit_count(&self) -> u64 {
        self.current.read().commit_count
    }

    /// The 96-byte authenticated state commitment: the concatenation of
    /// the roots of the responses, histories and info tries (zero-filled
    /// for empty tries).
    pub fn merged_root(&self) -> [u8; 96] {
        let current = self.current.read();
        let mut merged = [0u8; 96];
        if let Some(root) = current.responses {
            merged[..32].copy_from_slice(&root);
        }
        if let Some(root) = current.histories {
            merged[32..64].copy_from_slice(&root);
        }
        if let Some(root) = current.info {
            merged[64..].copy_from_slice(&root);
        }
        merged
    }

    /// Repositions the store at a past state commitment. Only roots within
    /// the checkable depth are guaranteed to still be fully resident.
    pub fn checkout(&self, merged_root: &[u8; 96]) {
        fn split(bytes: &[u8]) -> Option<[u8; 32]> {
            let root: [u8; 32] = bytes.try_into().expect("sized slice");
            (root != [0u8; 32]).then_some(root)
        }
        let mut current = self.current.write();
        current.responses = split(&merged_root[..32]);
        current.histories = split(&merged_root[32..64]);
        current.info = split(&merged_root[64..]);
    }

    fn read_trie(&self, cf: &'static str, root: Option<[u8; 32]>) -> PatriciaTrie<CfKv> {
        PatriciaTrie::new(CfKv::new(self.db.clone(), cf, u64::MAX), root)
    }

    pub fn get_request(&self, reference: &TransactionReference) -> ChainResult<Option<TransactionRequest>> {
        let cf = self.cf(CF_REQUESTS)?;
        match self.db.get_cf(&cf, reference.hash)? {
            None => Ok(None),
            Some(bytes) => Ok(Some(TransactionRequest::from_bytes(&bytes)?)),
        }
    }

    /// Opens a store transaction at the current roots. The caller is the
    /// only writer; everything becomes visible atomically at commit.
    pub fn begin_transaction(&self) -> StoreTransaction<'_> {
        let current = *self.current.read();
        let commit = current.commit_count;
        StoreTransaction {
            store: self,
            responses: PatriciaTrie::new(CfKv::new(self.db.clone(), CF_RESPONSES, commit), current.responses),
            histories: PatriciaTrie::new(CfKv::new(self.db.clone(), CF_HISTORIES, commit), current.histories),
            info: PatriciaTrie::new(CfKv::new(self.db.clone(), CF_INFO, commit), current.info),
            requests: Vec::new(),
            commit_number: commit,
            transactions_pushed: 0,
        }
    }

    /// Deletes the trie nodes superseded during the given commit, unless
    /// they have been re-created by a later one.
    fn garbage_collect(&self, commit_number: u64) -> ChainResult<()> {
        let gc_cf = self.cf(CF_GC)?;
        let prefix = commit_number.to_be_bytes();
        let mut batch = WriteBatch::default();
        let iterator = self.db.iterator_cf(
            &gc_cf,
            IteratorMode::From(&prefix, rocksdb::Direction::Forward),
        );
        for entry in iterator {
            let (key, value) = entry?;
            if !key.starts_with(&prefix) {
                break;
            }
            let cf_index = key
                .get(8)
                .copied()
                .ok_or_else(|| ChainError::Config("truncated garbage record".to_string()))?;
            let cf_name = TRIES
                .get(cf_index as usize)
                .ok_or_else(|| ChainError::Config("invalid garbage record".to_string()))?;
            let node_cf = self.cf(cf_name)?;
            if let Some(record) = self.db.get_cf(&node_cf, &value)? {
                let tag: [u8; 8] = record
                    .get(..8)
                    .and_then(|bytes| bytes.try_into().ok())
                    .ok_or_else(|| ChainError::Config("truncated trie node record".to_string()))?;
                if u64::from_be_bytes(tag) <= commit_number {
                    batch.delete_cf(&node_cf, &value);
                }
            }
            batch.delete_cf(&gc_cf, &key);
        }
        self.db.write(batch)?;
        Ok(())
    }
}

impl StoreView for NodeStore {
    fn response_of(&self, reference: &TransactionReference) -> ChainResult<Option<TransactionResponse>> {
        let trie = self.read_trie(CF_RESPONSES, self.current.read().responses);
        match trie.get(&reference.hash)? {
            None => Ok(None),
            Some(bytes) => Ok(Some(TransactionResponse::from_bytes(&bytes)?)),
        }
    }

    fn history_of(&self, object: &StorageReference) -> ChainResult<Vec<TransactionReference>> {
        let trie = self.read_trie(CF_HISTORIES, self.current.read().histories);
        read_history(&trie, object)
    }

    fn info(&self, tag: u8) -> ChainResult<Option<Vec<u8>>> {
        let trie = self.read_trie(CF_INFO, self.current.read().info);
        trie.get(&[tag])
    }
}

fn read_history(trie: &PatriciaTrie<CfKv>, object: &StorageReference) -> ChainResult<Vec<TransactionReference>> {
    match trie.get(&object.to_bytes_without_selector())? {
        None => Ok(Vec::new()),
        Some(bytes) => {
            let mut ctx = UnmarshallingContext::new(&bytes);
            let count = ctx.read_compact_u32()? as usize;
            let mut history = Vec::with_capacity(count + 1);
            for _ in 0..count {
                history.push(TransactionReference::unmarshal(&mut ctx)?);
            }
            // histories always end with the transaction that created the
            // object, elided in store
            history.push(object.transaction);
            Ok(history)
        }
    }
}

pub struct StoreTransaction<'a> {
    store: &'a NodeStore,
    responses: PatriciaTrie<CfKv>,
    histories: PatriciaTrie<CfKv>,
    info: PatriciaTrie<CfKv>,
    requests: Vec<(TransactionReference, Vec<u8>)>,
    commit_number: u64,
    transactions_pushed: u64,
}

impl<'a> StoreTransaction<'a> {
    /// Writes the triple of an accepted transaction: its request, its
    /// response and the expansion of the histories of all objects its
    /// updates touch.
    pub fn push(
        &mut self,
        reference: TransactionReference,
        request: &TransactionRequest,
        response: &TransactionResponse,
    ) -> ChainResult<()> {
        self.requests.push((reference, request.to_bytes()));
        self.responses.put(&reference.hash, response.to_bytes())?;

        let mut touched: Vec<StorageReference> = Vec::new();
        for update in response.updates() {
            let object = update.object();
            if !touched.contains(&object) {
                touched.push(object);
            }
        }
        for object in touched {
            let mut history = read_history(&self.histories, &object)?;
            if history.first() != Some(&reference) {
                history.insert(0, reference);
            }
            self.put_history(&object, &history)?;
        }

        self.transactions_pushed += 1;
        Ok(())
    }

    fn put_history(&mut self, object: &StorageReference, history: &[TransactionReference]) -> ChainResult<()> {
        // the last entry is always the creating transaction, equal to the
        // transaction of the storage reference itself: store it elided
        let elided = &history[..history.len() - 1];
        let mut ctx = MarshallingContext::new();
        ctx.write_compact_u32(elided.len() as u32);
        for reference in elided {
            reference.marshal(&mut ctx);
        }
        self.histories.put(&object.to_bytes_without_selector(), ctx.into_bytes())
    }

    pub fn set_info(&mut self, tag: u8, bytes: Vec<u8>) -> ChainResult<()> {
        self.info.put(&[tag], bytes)
    }

    pub fn set_info_reference(&mut self, tag: u8, reference: TransactionReference) -> ChainResult<()> {
        self.set_info(tag, reference.to_bytes())
    }

    pub fn set_info_storage_reference(&mut self, tag: u8, reference: StorageReference) -> ChainResult<()> {
        self.set_info(tag, reference.to_bytes_without_selector())
    }

    /// Commits everything written through this transaction in one atomic
    /// batch, advances the commit count and schedules garbage collection
    /// according to the retention policy. Returns the new merged root.
    pub fn commit(mut self) -> ChainResult<[u8; 96]> {
        let commit_number = self.commit_number;
        let transaction_count = {
            let current = self.store.current.read();
            current.transaction_count + self.transactions_pushed
        };

        // the commit count and progressive transaction count are part of
        // the authenticated info trie
        let mut counter = MarshallingContext::new();
        counter.write_u64(commit_number + 1);
        self.info.put(&[INFO_COMMIT_COUNT], counter.into_bytes())?;
        let mut next = MarshallingContext::new();
        next.write_u64(transaction_count);
        self.info.put(&[INFO_NEXT], next.into_bytes())?;

        let mut batch = WriteBatch::default();

        let mut garbage_sequence: u64 = 0;
        let gc_cf = self.store.cf(CF_GC)?;
        let tries = [
            (&mut self.responses, 0u8),
            (&mut self.histories, 1u8),
            (&mut self.info, 2u8),
        ];
        let mut roots: [Option<[u8; 32]>; 3] = [None; 3];
        for (trie, cf_index) in tries {
            roots[cf_index as usize] = trie.root();
            for hash in trie.take_garbage() {
                let mut key = Vec::with_capacity(17);
                key.extend_from_slice(&commit_number.to_be_bytes());
                key.push(cf_index);
                key.extend_from_slice(&garbage_sequence.to_be_bytes());
                batch.put_cf(&gc_cf, key, hash);
                garbage_sequence += 1;
            }
            let node_cf = self.store.cf(TRIES[cf_index as usize])?;
            for (key, record) in trie.store().overlay.iter() {
                match record {
                    Some(record) => batch.put_cf(&node_cf, key, record),
                    None => batch.delete_cf(&node_cf, key),
                }
            }
        }

        let requests_cf = self.store.cf(CF_REQUESTS)?;
        for (reference, bytes) in &self.requests {
            batch.put_cf(&requests_cf, reference.hash, bytes);
        }

        let metadata_cf = NodeStore::metadata_cf(&self.store.db)?;
        for (key, root) in [
            (ROOT_RESPONSES_KEY, roots[0]),
            (ROOT_HISTORIES_KEY, roots[1]),
            (ROOT_INFO_KEY, roots[2]),
        ] {
            match root {
                Some(root) => batch.put_cf(&metadata_cf, key, root),
                None => batch.delete_cf(&metadata_cf, key),
            }
        }
        batch.put_cf(&metadata_cf, COMMIT_COUNT_KEY, (commit_number + 1).to_be_bytes());
        batch.put_cf(&metadata_cf, TRANSACTION_COUNT_KEY, transaction_count.to_be_bytes());

        self.store.db.write(batch)?;

        {
            let mut current = self.store.current.write();
            current.responses = roots[0];
            current.histories = roots[1];
            current.info = roots[2];
            current.commit_count = commit_number + 1;
            current.transaction_count = transaction_count;
        }

        if self.store.checkable_depth >= 0 {
            let eligible = commit_number as i64 - self.store.checkable_depth;
            if eligible >= 0 {
                self.store.garbage_collect(eligible as u64)?;
            }
        }

        Ok(self.store.merged_root())
    }
}

impl StoreView for StoreTransaction<'_> {
    fn response_of(&self, reference: &TransactionReference) -> ChainResult<Option<TransactionResponse>> {
        match self.responses.get(&reference.hash)? {
            None => Ok(None),
            Some(bytes) => Ok(Some(TransactionResponse::from_bytes(&bytes)?)),
        }
    }

    fn history_of(&self, object: &StorageReference) -> ChainResult<Vec<TransactionReference>> {
        read_history(&self.histories, object)
    }

    fn info(&self, tag: u8) -> ChainResult<Option<Vec<u8>>> {
        self.info.get(&[tag])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::requests::InitialJarStoreTransactionRequest;
    use crate::types::responses::JarStoreInitialTransactionResponse;
    use crate::types::updates::Update;
    use tempfile::TempDir;

    fn sample_request() -> TransactionRequest {
        TransactionRequest::InitialJarStore(InitialJarStoreTransactionRequest {
            jar: vec![1, 2, 3],
            dependencies: vec![],
        })
    }

    fn sample_response() -> TransactionResponse {
        TransactionResponse::JarStoreInitial(JarStoreInitialTransactionResponse {
            instrumented_jar: vec![1, 2, 3, 4],
            dependencies: vec![],
        })
    }

    #[test]
    fn pushed_transactions_are_readable_after_commit() {
        let dir = TempDir::new().unwrap();
        let store = NodeStore::open(dir.path(), -1).unwrap();
        let request = sample_request();
        let reference = request.reference();

        let mut txn = store.begin_transaction();
        txn.push(reference, &request, &sample_response()).unwrap();
        txn.commit().unwrap();

        assert_eq!(store.get_request(&reference).unwrap(), Some(request));
        assert_eq!(store.response_of(&reference).unwrap(), Some(sample_response()));
        assert_eq!(store.commit_count(), 1);
    }

    #[test]
    fn history_elides_the_creating_transaction() {
        let dir = TempDir::new().unwrap();
        let store = NodeStore::open(dir.path(), -1).unwrap();
        let creating = TransactionReference::new([1u8; 32]);
        let object = StorageReference::new(creating, 0);

        let mut txn = store.begin_transaction();
        let response = TransactionResponse::GameteCreation(
            crate::types::responses::GameteCreationTransactionResponse {
                updates: vec![Update::ClassTag {
                    object,
                    class: "banyan.lang.Gamete".to_string(),
                    jar: creating,
                }],
                gamete: object,
            },
        );
        let request = sample_request();
        txn.push(creating, &request, &response).unwrap();
        assert_eq!(txn.history_of(&object).unwrap(), vec![creating]);
        txn.commit().unwrap();

        assert_eq!(store.history_of(&object).unwrap(), vec![creating]);
    }

    #[test]
    fn checkout_restores_an_older_world_view() {
        let dir = TempDir::new().unwrap();
        let store = NodeStore::open(dir.path(), -1).unwrap();

        let mut txn = store.begin_transaction();
        txn.set_info(INFO_BASE_CODE, vec![1]).unwrap();
        txn.commit().unwrap();
        let first_root = store.merged_root();

        let mut txn = store.begin_transaction();
        txn.set_info(INFO_BASE_CODE, vec![2]).unwrap();
        txn.commit().unwrap();
        assert_eq!(store.info(INFO_BASE_CODE).unwrap(), Some(vec![2]));

        store.checkout(&first_root);
        assert_eq!(store.info(INFO_BASE_CODE).unwrap(), Some(vec![1]));
    }

    #[test]
    fn merged_root_concatenates_the_three_tries() {
        let dir = TempDir::new().unwrap();
        let store = NodeStore::open(dir.path(), -1).unwrap();
        assert_eq!(store.merged_root(), [0u8; 96]);

        let mut txn = store.begin_transaction();
        txn.set_info(INFO_BASE_CODE, vec![7]).unwrap();
        txn.commit().unwrap();
        let merged = store.merged_root();
        assert_eq!(&merged[..64], &[0u8; 64][..]);
        assert_ne!(&merged[64..], &[0u8; 32][..]);
    }

    #[test]
    fn store_reopens_at_the_last_committed_roots() {
        let dir = TempDir::new().unwrap();
        let merged = {
            let store = NodeStore::open(dir.path(), -1).unwrap();
            let mut txn = store.begin_transaction();
            txn.set_info(INFO_BASE_CODE, vec![9]).unwrap();
            txn.commit().unwrap();
            store.merged_root()
        };
        let reopened = NodeStore::open(dir.path(), -1).unwrap();
        assert_eq!(reopened.merged_root(), merged);
        assert_eq!(reopened.info(INFO_BASE_CODE).unwrap(), Some(vec![9]));
        assert_eq!(reopened.commit_count(), 1);
    }

    #[test]
    fn zero_depth_collects_previous_commits() {
        let dir = TempDir::new().unwrap();
        let store = NodeStore::open(dir.path(), 0).unwrap();
        for value in 0u8..5 {
            let mut txn = store.begin_transaction();
            txn.set_info(INFO_BASE_CODE, vec![value]).unwrap();
            txn.commit().unwrap();
        }
        // the current state stays fully readable after collection
        assert_eq!(store.info(INFO_BASE_CODE).unwrap(), Some(vec![4]));
    }
}
