//! Status snapshots with a single-fire change signal.

use std::sync::{Mutex, PoisonError};
use tlfs_blocks::DirtyBufferStats;
use tlfs_core::{BranchId, MetadataRevision, TlfId, UserId, server::UserQuotaInfo};
use tokio::sync::oneshot;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FolderBranchStatus {
    pub tlf: TlfId,
    /// True while local changes sit on an unmerged branch.
    pub staged: bool,
    pub branch: BranchId,
    pub head_revision: MetadataRevision,
    pub head_writer: UserId,
    pub latest_merged_revision: MetadataRevision,
    /// False until this device holds a key for the head.
    pub readable: bool,
    /// Paths of files with unsynced writes.
    pub dirty_paths: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineStatus {
    pub user: String,
    pub device: String,
    pub dirty: DirtyBufferStats,
    /// `None` when the block server could not be asked.
    pub quota: Option<UserQuotaInfo>,
    pub folders: Vec<TlfId>,
    pub staged_folders: Vec<TlfId>,
}

/// Hands out receivers that fire once on the next change.
#[derive(Debug, Default)]
pub(crate) struct StatusTracker {
    waiters: Mutex<Vec<oneshot::Sender<()>>>,
}

impl StatusTracker {
    pub fn subscribe(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    pub fn changed(&self) {
        let waiters =
            std::mem::take(&mut *self.waiters.lock().unwrap_or_else(PoisonError::into_inner));
        for tx in waiters {
            let _ = tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_each_receiver_fires_once() {
        let tracker = StatusTracker::default();
        let first = tracker.subscribe();
        tracker.changed();
        first.await.unwrap();

        let mut second = tracker.subscribe();
        assert!(second.try_recv().is_err());
        tracker.changed();
        assert!(second.try_recv().is_ok());
    }
}
