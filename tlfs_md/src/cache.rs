use lru::LruCache;
use std::{
    num::NonZeroUsize,
    sync::{Mutex, MutexGuard, PoisonError},
};
use tlfs_core::{BranchId, MetadataRevision, TlfId};

use crate::ImmutableRootMetadata;

type MdCacheKey = (TlfId, MetadataRevision, BranchId);

/// Recently used revisions keyed by (folder, revision, branch).
pub struct MdCache {
    lru: Mutex<LruCache<MdCacheKey, ImmutableRootMetadata>>,
}

impl std::fmt::Debug for MdCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MdCache")
            .field("entries", &self.lock().len())
            .finish()
    }
}

fn key(md: &ImmutableRootMetadata) -> MdCacheKey {
    (md.tlf_id(), md.revision(), md.branch_id())
}

impl MdCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            lru: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN),
            )),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<MdCacheKey, ImmutableRootMetadata>> {
        self.lru.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(
        &self,
        tlf: TlfId,
        rev: MetadataRevision,
        bid: BranchId,
    ) -> Option<ImmutableRootMetadata> {
        self.lock().get(&(tlf, rev, bid)).cloned()
    }

    pub fn put(&self, md: ImmutableRootMetadata) {
        self.lock().put(key(&md), md);
    }

    pub fn delete(&self, tlf: TlfId, rev: MetadataRevision, bid: BranchId) {
        self.lock().pop(&(tlf, rev, bid));
    }

    /// Files `new` under its own branch in place of the entry cached for
    /// the same revision under `old_bid`.
    pub fn replace(&self, new: ImmutableRootMetadata, old_bid: BranchId) {
        let mut lru = self.lock();
        lru.pop(&(new.tlf_id(), new.revision(), old_bid));
        lru.put(key(&new), new);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RootMetadata;
    use tlfs_core::{
        Hash, MdId, MetadataVer, UserId,
        md::{BareRootMetadata, BareTlfHandle, flags},
    };

    fn md(rev: i64, bid: BranchId) -> ImmutableRootMetadata {
        let mut bare = BareRootMetadata::new(
            TlfId::from_bytes([1; 16], false),
            BareTlfHandle::new(vec![UserId::from_bytes([2; 16])], vec![]),
            MetadataVer::V2,
        );
        bare.revision = MetadataRevision(rev);
        bare.branch_id = bid;
        bare.set_flag(flags::UNMERGED, !bid.is_null());
        ImmutableRootMetadata::new(RootMetadata::unreadable(bare), MdId(Hash::new(rev.to_le_bytes())))
    }

    #[test]
    fn test_replace_moves_entry_between_branches() {
        let cache = MdCache::new(8);
        let tlf = TlfId::from_bytes([1; 16], false);
        let bid = BranchId::from_bytes([7; 16]);
        cache.put(md(3, bid));
        assert!(cache.get(tlf, MetadataRevision(3), bid).is_some());

        cache.replace(md(3, BranchId::NULL), bid);
        assert!(cache.get(tlf, MetadataRevision(3), bid).is_none());
        assert!(cache.get(tlf, MetadataRevision(3), BranchId::NULL).is_some());

        cache.delete(tlf, MetadataRevision(3), BranchId::NULL);
        assert!(cache.get(tlf, MetadataRevision(3), BranchId::NULL).is_none());
    }

    #[test]
    fn test_evicts_least_recent() {
        let cache = MdCache::new(2);
        let tlf = TlfId::from_bytes([1; 16], false);
        for rev in 1..=3 {
            cache.put(md(rev, BranchId::NULL));
        }
        assert!(cache.get(tlf, MetadataRevision(1), BranchId::NULL).is_none());
        assert!(cache.get(tlf, MetadataRevision(3), BranchId::NULL).is_some());
    }
}
