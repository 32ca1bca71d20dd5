use lru::LruCache;
use std::{
    collections::HashMap,
    num::NonZeroUsize,
    sync::{Mutex, MutexGuard, PoisonError},
};
use tlfs_core::{Block, BlockId, BlockPointer, FileBlock, Hash, TlfId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockCacheLifetime {
    /// Evictable; the block is already durable on the server.
    Transient,
    /// Kept until explicitly deleted, e.g. while the block is being put.
    Permanent,
}

struct Inner {
    transient: LruCache<BlockId, Block>,
    permanent: HashMap<BlockId, Block>,
    known_ptrs: LruCache<(TlfId, Hash), BlockPointer>,
}

/// Cache of decrypted blocks, keyed by block id.
///
/// Both lifetimes may hold the same block at once; a permanent entry
/// survives eviction of its transient twin.
pub struct BlockCache {
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for BlockCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("BlockCache")
            .field("transient", &inner.transient.len())
            .field("permanent", &inner.permanent.len())
            .finish()
    }
}

fn capacity(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n).unwrap_or(NonZeroUsize::MIN)
}

/// Content hash of a direct file block, used to spot identical blocks.
fn known_ptr_key(tlf: TlfId, block: &FileBlock) -> Option<(TlfId, Hash)> {
    (!block.is_ind).then(|| (tlf, Hash::new(&block.contents)))
}

impl BlockCache {
    pub fn new(transient_entries: usize, known_ptr_entries: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                transient: LruCache::new(capacity(transient_entries)),
                permanent: HashMap::new(),
                known_ptrs: LruCache::new(capacity(known_ptr_entries)),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, ptr: &BlockPointer) -> Option<Block> {
        let mut inner = self.lock();
        if let Some(block) = inner.permanent.get(&ptr.id) {
            return Some(block.clone());
        }
        inner.transient.get(&ptr.id).cloned()
    }

    /// Caches `block`. Transient direct file blocks also become known
    /// pointers for dedup.
    pub fn put(&self, ptr: BlockPointer, tlf: TlfId, block: Block, lifetime: BlockCacheLifetime) {
        let mut inner = self.lock();
        match lifetime {
            BlockCacheLifetime::Transient => {
                if let Block::File(file) = &block
                    && let Some(key) = known_ptr_key(tlf, file)
                {
                    inner.known_ptrs.put(key, ptr);
                }
                inner.transient.put(ptr.id, block);
            }
            BlockCacheLifetime::Permanent => {
                inner.permanent.insert(ptr.id, block);
            }
        }
    }

    pub fn delete_transient(&self, ptr: &BlockPointer, tlf: TlfId) {
        let mut inner = self.lock();
        if let Some(Block::File(file)) = inner.transient.pop(&ptr.id)
            && let Some(key) = known_ptr_key(tlf, &file)
            && inner.known_ptrs.peek(&key).is_some_and(|p| p.id == ptr.id)
        {
            inner.known_ptrs.pop(&key);
        }
    }

    pub fn delete_permanent(&self, id: &BlockId) {
        self.lock().permanent.remove(id);
    }

    /// A pointer to an already-stored block with the same contents, if
    /// one is known.
    pub fn check_for_known_ptr(&self, tlf: TlfId, block: &FileBlock) -> Option<BlockPointer> {
        let key = known_ptr_key(tlf, block)?;
        let known = self.lock().known_ptrs.get(&key).copied();
        if let Some(ptr) = &known {
            log::debug!("{tlf}: contents already stored as {}", ptr.id);
        }
        known
    }

    pub fn delete_known_ptr(&self, tlf: TlfId, block: &FileBlock) {
        if let Some(key) = known_ptr_key(tlf, block) {
            self.lock().known_ptrs.pop(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tlfs_core::{BlockContext, KeyGen, UserId};

    fn ptr(byte: u8) -> BlockPointer {
        BlockPointer::new(
            BlockId(Hash::from_bytes([byte; 32])),
            KeyGen::FIRST_VALID,
            BlockContext::first_ref(UserId::from_bytes([1; 16])),
        )
    }

    fn file(contents: &[u8]) -> Block {
        Block::File(FileBlock {
            contents: contents.to_vec(),
            ..Default::default()
        })
    }

    #[test]
    fn test_permanent_survives_eviction() {
        let cache = BlockCache::new(1, 10);
        let tlf = TlfId::from_bytes([1; 16], false);
        cache.put(ptr(1), tlf, file(b"one"), BlockCacheLifetime::Permanent);
        cache.put(ptr(1), tlf, file(b"one"), BlockCacheLifetime::Transient);
        cache.put(ptr(2), tlf, file(b"two"), BlockCacheLifetime::Transient);
        assert_eq!(cache.get(&ptr(1)), Some(file(b"one")));

        cache.delete_permanent(&ptr(1).id);
        assert_eq!(cache.get(&ptr(1)), None);
        assert_eq!(cache.get(&ptr(2)), Some(file(b"two")));
    }

    #[test]
    fn test_known_ptr_dedup() {
        let cache = BlockCache::new(10, 10);
        let tlf = TlfId::from_bytes([1; 16], false);
        let other_tlf = TlfId::from_bytes([2; 16], false);
        cache.put(ptr(3), tlf, file(b"same bytes"), BlockCacheLifetime::Transient);

        let Block::File(probe) = file(b"same bytes") else {
            unreachable!()
        };
        assert_eq!(cache.check_for_known_ptr(tlf, &probe), Some(ptr(3)));
        assert_eq!(cache.check_for_known_ptr(other_tlf, &probe), None);

        cache.delete_transient(&ptr(3), tlf);
        assert_eq!(cache.check_for_known_ptr(tlf, &probe), None);
    }
}
