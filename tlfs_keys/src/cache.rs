use lru::LruCache;
use std::{
    num::NonZeroUsize,
    sync::{Mutex, PoisonError},
};
use tlfs_core::{KeyGen, TlfId, keys::TlfCryptKey};

/// LRU cache of unmasked crypt keys, keyed by (folder, generation).
#[derive(Debug)]
pub struct KeyCache {
    keys: Mutex<LruCache<(TlfId, KeyGen), TlfCryptKey>>,
}

impl KeyCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            keys: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, tlf: TlfId, key_gen: KeyGen) -> Option<TlfCryptKey> {
        self.keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(tlf, key_gen))
            .cloned()
    }

    pub fn put(&self, tlf: TlfId, key_gen: KeyGen, key: TlfCryptKey) {
        self.keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .put((tlf, key_gen), key);
    }

    pub fn len(&self) -> usize {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
