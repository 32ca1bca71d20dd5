//! The dirty write buffer.
//!
//! Writers ask for permission before dirtying an estimated number of bytes
//! and wait while the buffer is full. Granted bytes count as unsynced right
//! away; the writer later reconciles the estimate with the exact size.
//! Syncing bytes are the part of the unsynced bytes currently in flight.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Mutex, MutexGuard, PoisonError},
};
use tlfs_core::{
    Block, BlockPointer, CancellationToken, Error, Result, TlfId, config::DirtyBufferConfig,
};
use tokio::sync::oneshot;

type DirtyKey = (TlfId, BlockPointer, String);

struct Waiter {
    tlf: TlfId,
    estimate: i64,
    tx: oneshot::Sender<()>,
}

#[derive(Default)]
struct Accounting {
    unsynced: i64,
    syncing: i64,
    waiters: VecDeque<Waiter>,
    shut_down: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DirtyBufferStats {
    pub unsynced_bytes: i64,
    pub syncing_bytes: i64,
    pub waiters: usize,
    pub dirty_blocks: usize,
}

pub struct DirtyBlockCache {
    blocks: Mutex<HashMap<DirtyKey, Block>>,
    accounting: Mutex<Accounting>,
    max_buffer_bytes: i64,
    force_sync_bytes: i64,
}

impl std::fmt::Debug for DirtyBlockCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirtyBlockCache")
            .field("stats", &self.stats())
            .finish()
    }
}

impl DirtyBlockCache {
    pub fn new(config: &DirtyBufferConfig) -> Self {
        Self {
            blocks: Mutex::new(HashMap::new()),
            accounting: Mutex::new(Accounting::default()),
            max_buffer_bytes: config.max_buffer_bytes as i64,
            force_sync_bytes: config.force_sync_bytes as i64,
        }
    }

    fn blocks(&self) -> MutexGuard<'_, HashMap<DirtyKey, Block>> {
        self.blocks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn accounting(&self) -> MutexGuard<'_, Accounting> {
        self.accounting.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn key(tlf: TlfId, ptr: &BlockPointer, branch: &str) -> DirtyKey {
        (tlf, *ptr, branch.to_string())
    }

    pub fn get(&self, tlf: TlfId, ptr: &BlockPointer, branch: &str) -> Option<Block> {
        self.blocks().get(&Self::key(tlf, ptr, branch)).cloned()
    }

    pub fn put(&self, tlf: TlfId, ptr: &BlockPointer, branch: &str, block: Block) {
        self.blocks().insert(Self::key(tlf, ptr, branch), block);
    }

    pub fn delete(&self, tlf: TlfId, ptr: &BlockPointer, branch: &str) -> Option<Block> {
        self.blocks().remove(&Self::key(tlf, ptr, branch))
    }

    pub fn is_dirty(&self, tlf: TlfId, ptr: &BlockPointer, branch: &str) -> bool {
        self.blocks().contains_key(&Self::key(tlf, ptr, branch))
    }

    pub fn is_any_dirty(&self, tlf: TlfId) -> bool {
        self.blocks().keys().any(|(t, _, _)| *t == tlf)
    }

    /// Waits until the buffer has room for `estimate` more bytes of `tlf`.
    ///
    /// Requests are admitted in arrival order, and an empty buffer admits
    /// any request. The granted estimate counts as unsynced until the
    /// caller reconciles it with [`Self::update_unsynced_bytes`].
    pub async fn request_permission_to_dirty(
        &self,
        cancel: &CancellationToken,
        tlf: TlfId,
        estimate: u64,
    ) -> Result<()> {
        let estimate = estimate as i64;
        let mut rx = {
            let mut acct = self.accounting();
            if acct.shut_down {
                return Err(Error::Shutdown);
            }
            if acct.waiters.is_empty() && self.admits(&acct, estimate) {
                acct.unsynced += estimate;
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            acct.waiters.push_back(Waiter { tlf, estimate, tx });
            tracing::debug!(%tlf, estimate, unsynced = acct.unsynced, "waiting for dirty buffer room");
            rx
        };

        let granted = tokio::select! {
            res = &mut rx => Some(res),
            _ = cancel.cancelled() => None,
        };
        match granted {
            Some(res) => res.map_err(|_| Error::Shutdown),
            None => {
                rx.close();
                // The grant may have raced the cancellation.
                if rx.try_recv().is_ok() {
                    self.update_unsynced_bytes(-estimate, false);
                }
                drop(rx);
                self.process_waiters();
                Err(Error::Cancelled)
            }
        }
    }

    fn admits(&self, acct: &Accounting, estimate: i64) -> bool {
        acct.unsynced <= 0 || acct.unsynced + estimate <= self.max_buffer_bytes
    }

    fn process_waiters(&self) {
        let mut acct = self.accounting();
        while let Some(waiter) = acct.waiters.front() {
            if waiter.tx.is_closed() {
                acct.waiters.pop_front();
                continue;
            }
            if !self.admits(&acct, waiter.estimate) {
                break;
            }
            let Some(waiter) = acct.waiters.pop_front() else {
                break;
            };
            if waiter.tx.send(()).is_ok() {
                acct.unsynced += waiter.estimate;
                tracing::trace!(tlf = %waiter.tlf, estimate = waiter.estimate, "dirty permission granted");
            }
        }
    }

    /// Adds `delta` (possibly negative) unsynced bytes. Bytes of a block
    /// that is being synced also count as syncing.
    pub fn update_unsynced_bytes(&self, delta: i64, was_syncing: bool) {
        {
            let mut acct = self.accounting();
            acct.unsynced += delta;
            if was_syncing {
                acct.syncing += delta;
            }
        }
        if delta < 0 {
            self.process_waiters();
        }
    }

    pub fn update_syncing_bytes(&self, size: i64) {
        self.accounting().syncing += size;
    }

    /// One block of a sync reached the server.
    pub fn block_sync_finished(&self, size: i64) {
        self.accounting().syncing -= size;
    }

    /// A whole sync of `size` bytes finished; those bytes leave the buffer.
    pub fn sync_finished(&self, size: i64) {
        {
            let mut acct = self.accounting();
            acct.unsynced -= size;
            debug_assert!(
                acct.unsynced >= 0,
                "synced more bytes than were unsynced: {}",
                acct.unsynced
            );
        }
        self.process_waiters();
    }

    pub fn should_force_sync(&self) -> bool {
        self.accounting().unsynced >= self.force_sync_bytes
    }

    pub fn stats(&self) -> DirtyBufferStats {
        let acct = self.accounting();
        DirtyBufferStats {
            unsynced_bytes: acct.unsynced,
            syncing_bytes: acct.syncing,
            waiters: acct.waiters.len(),
            dirty_blocks: self.blocks().len(),
        }
    }

    /// Rejects waiting writers and reports unsynced data left behind.
    pub fn shutdown(&self) -> Result<()> {
        let unsynced = {
            let mut acct = self.accounting();
            acct.shut_down = true;
            acct.waiters.clear();
            acct.unsynced
        };
        let dirty = self.blocks().len();
        if dirty > 0 || unsynced > 0 {
            tracing::error!(dirty, unsynced, "shutting down with unsynced data");
            return Err(Error::UnsyncedOnShutdown(dirty));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tlfs_core::{BlockContext, BlockId, FileBlock, Hash, KeyGen, UserId};

    fn cache(max: u64) -> DirtyBlockCache {
        DirtyBlockCache::new(&DirtyBufferConfig {
            max_buffer_bytes: max,
            force_sync_bytes: max / 2,
        })
    }

    #[test]
    fn test_dirty_blocks_keyed_by_branch() {
        let cache = cache(100);
        let tlf = TlfId::from_bytes([1; 16], false);
        let ptr = BlockPointer::new(
            BlockId(Hash::from_bytes([2; 32])),
            KeyGen::FIRST_VALID,
            BlockContext::first_ref(UserId::from_bytes([3; 16])),
        );
        cache.put(tlf, &ptr, "master", Block::File(FileBlock::default()));
        assert!(cache.is_dirty(tlf, &ptr, "master"));
        assert!(!cache.is_dirty(tlf, &ptr, "other"));
        assert!(cache.is_any_dirty(tlf));
        assert!(matches!(cache.shutdown(), Err(Error::UnsyncedOnShutdown(1))));
        cache.delete(tlf, &ptr, "master");
        assert!(!cache.is_any_dirty(tlf));
    }

    #[tokio::test]
    async fn test_empty_buffer_admits_oversized_request() {
        let cache = cache(100);
        let tlf = TlfId::from_bytes([1; 16], false);
        let cancel = CancellationToken::new();
        cache.request_permission_to_dirty(&cancel, tlf, 500).await.unwrap();
        assert_eq!(cache.stats().unsynced_bytes, 500);
        assert!(cache.should_force_sync());
        cache.sync_finished(500);
        assert!(!cache.should_force_sync());
        cache.shutdown().unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_wait_leaves_no_reservation() {
        let cache = cache(100);
        let tlf = TlfId::from_bytes([1; 16], false);
        let cancel = CancellationToken::new();
        cache.request_permission_to_dirty(&cancel, tlf, 90).await.unwrap();

        let waiting = CancellationToken::new();
        waiting.cancel();
        let err = cache
            .request_permission_to_dirty(&waiting, tlf, 50)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(cache.stats().unsynced_bytes, 90);
        assert_eq!(cache.stats().waiters, 0);
    }
}
