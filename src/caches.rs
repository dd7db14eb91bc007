//! Node-wide caches. Classloaders are reused across transactions with the
//! same classpath and dropped when a module installation lands in their
//! chain; signature verifications are memoized in a bounded LRU.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::{Mutex, RwLock};

use crate::classloader::EngineClassLoader;
use crate::config::ConsensusParams;
use crate::crypto::SignatureScheme;
use crate::errors::ChainResult;
use crate::store::StoreView;
use crate::types::references::{StorageReference, TransactionReference};

const SIGNATURE_CACHE_SIZE: usize = 1024;

pub struct NodeCaches {
    classloaders: Mutex<HashMap<TransactionReference, Arc<EngineClassLoader>>>,
    signatures: Mutex<LruCache<(TransactionReference, String), bool>>,
    class_tags: Mutex<HashMap<StorageReference, (String, TransactionReference)>>,
    consensus: RwLock<Option<ConsensusParams>>,
}

impl NodeCaches {
    pub fn new() -> Self {
        Self {
            classloaders: Mutex::new(HashMap::new()),
            signatures: Mutex::new(LruCache::new(
                NonZeroUsize::new(SIGNATURE_CACHE_SIZE).expect("non-zero cache size"),
            )),
            class_tags: Mutex::new(HashMap::new()),
            consensus: RwLock::new(None),
        }
    }

    /// The classloader for the given classpath, built at most once until
    /// the next invalidation.
    pub fn classloader_at(
        &self,
        classpath: TransactionReference,
        view: &dyn StoreView,
    ) -> ChainResult<Arc<EngineClassLoader>> {
        if let Some(cached) = self.classloaders.lock().get(&classpath) {
            return Ok(cached.clone());
        }
        let loader = Arc::new(EngineClassLoader::new(classpath, view)?);
        self.classloaders.lock().insert(classpath, loader.clone());
        Ok(loader)
    }

    /// Drops all cached classloaders. Called when a module installation
    /// commits, since it may extend an existing classpath chain.
    pub fn invalidate_classloaders(&self) {
        self.classloaders.lock().clear();
    }

    /// Memoized signature verification, keyed by request reference and
    /// public key.
    pub fn signature_is_valid(
        &self,
        reference: TransactionReference,
        public_key: &str,
        scheme: SignatureScheme,
        message: &[u8],
        signature: &[u8],
    ) -> ChainResult<bool> {
        let key = (reference, public_key.to_string());
        if let Some(valid) = self.signatures.lock().get(&key) {
            return Ok(*valid);
        }
        let valid = scheme.verify(public_key, message, signature)?;
        self.signatures.lock().put(key, valid);
        Ok(valid)
    }

    pub fn class_tag_at(
        &self,
        object: StorageReference,
        view: &dyn StoreView,
    ) -> ChainResult<Option<(String, TransactionReference)>> {
        if let Some(cached) = self.class_tags.lock().get(&object) {
            return Ok(Some(cached.clone()));
        }
        let tag = crate::deserialization::class_tag_of(view, &object)?;
        if let Some(tag) = &tag {
            self.class_tags.lock().insert(object, tag.clone());
        }
        Ok(tag)
    }

    /// The cached consensus parameters, or the given fallback. Recomputed
    /// only on explicit request, after manifest changes.
    pub fn consensus(&self, fallback: &ConsensusParams) -> ConsensusParams {
        self.consensus.read().clone().unwrap_or_else(|| fallback.clone())
    }

    pub fn recompute_consensus(&self, params: ConsensusParams) {
        *self.consensus.write() = Some(params);
    }
}

impl Default for NodeCaches {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_cache_memoizes_verdicts() {
        let caches = NodeCaches::new();
        let reference = TransactionReference::new([1u8; 32]);
        // the empty scheme always accepts; the cached verdict must match
        let first = caches
            .signature_is_valid(reference, "key", SignatureScheme::Empty, b"m", &[])
            .unwrap();
        let second = caches
            .signature_is_valid(reference, "key", SignatureScheme::Empty, b"m", &[])
            .unwrap();
        assert!(first && second);
    }
}
