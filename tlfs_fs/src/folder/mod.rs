//! Operations on one folder's current branch.
//!
//! A [`FolderBranchOps`] owns the folder's head revision, its node cache
//! and the dirty state of its open files. Every mutation runs under the
//! folder's write lock, stages the affected directories, writes them out
//! bottom-up and puts a successor revision. Losing the race for the merged
//! branch forks the folder onto a fresh unmerged branch and wakes conflict
//! resolution.

mod background;
mod file;
mod read;
mod rekey;
mod tree;
mod updates;
mod write;

pub(crate) use file::DirtyFile;
pub use read::NodeMetadata;
pub(crate) use tree::{DirWriter, PutBlock, touch};

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};
use tlfs_core::{
    BlockPointer, BranchId, CancellationToken, Error, MASTER_BRANCH, Result, TlfId,
    crypto::make_random_branch_id, md::BareTlfHandle,
};
use tlfs_md::{ImmutableRootMetadata, RootMetadata};
use tokio::sync::Notify;

use crate::{
    EngineContext, Node, NodeCache, NodeId, PathNode,
    observer::Observers,
    status::{FolderBranchStatus, StatusTracker},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BranchState {
    Merged,
    Unmerged(BranchId),
}

impl BranchState {
    /// Key of this branch in the dirty block cache.
    pub fn name(&self) -> String {
        match self {
            BranchState::Merged => MASTER_BRANCH.to_string(),
            BranchState::Unmerged(bid) => bid.to_string(),
        }
    }

    pub fn is_unmerged(&self) -> bool {
        matches!(self, BranchState::Unmerged(_))
    }
}

#[derive(Debug)]
pub(crate) struct FolderState {
    pub head: ImmutableRootMetadata,
    pub latest_merged: ImmutableRootMetadata,
    pub branch: BranchState,
    pub root: Option<NodeId>,
    pub dirty: HashMap<NodeId, DirtyFile>,
}

#[derive(Debug)]
pub(crate) struct FolderBranchOps {
    pub(crate) ctx: Arc<EngineContext>,
    pub(crate) tlf: TlfId,
    pub(crate) handle: BareTlfHandle,
    pub(crate) write_lock: tokio::sync::Mutex<()>,
    state: RwLock<FolderState>,
    nodes: Mutex<NodeCache>,
    pub(crate) observers: Observers,
    status: StatusTracker,
    pub(crate) cancel: CancellationToken,
    pub(crate) flush_wake: Notify,
    pub(crate) cr_wake: Notify,
}

impl FolderBranchOps {
    /// Opens the folder at `head`. When `head` is on an unmerged branch,
    /// `latest_merged` is the merged revision it must eventually fold into.
    pub fn new(
        ctx: Arc<EngineContext>,
        handle: BareTlfHandle,
        head: ImmutableRootMetadata,
        latest_merged: ImmutableRootMetadata,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let branch = if head.bare.is_unmerged() {
            BranchState::Unmerged(head.branch_id())
        } else {
            BranchState::Merged
        };
        Arc::new(Self {
            tlf: head.tlf_id(),
            ctx,
            handle,
            write_lock: tokio::sync::Mutex::new(()),
            state: RwLock::new(FolderState {
                head,
                latest_merged,
                branch,
                root: None,
                dirty: HashMap::new(),
            }),
            nodes: Mutex::new(NodeCache::new()),
            observers: Observers::default(),
            status: StatusTracker::default(),
            cancel,
            flush_wake: Notify::new(),
            cr_wake: Notify::new(),
        })
    }

    pub(crate) fn state(&self) -> RwLockReadGuard<'_, FolderState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn state_mut(&self) -> RwLockWriteGuard<'_, FolderState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn nodes(&self) -> MutexGuard<'_, NodeCache> {
        self.nodes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn head(&self) -> ImmutableRootMetadata {
        self.state().head.clone()
    }

    pub fn branch(&self) -> BranchState {
        self.state().branch
    }

    pub fn branch_name(&self) -> String {
        self.branch().name()
    }

    pub(crate) fn node(&self, id: NodeId) -> Node {
        Node { tlf: self.tlf, id }
    }

    /// The head, failing with [`Error::NoKey`] while this device cannot
    /// read it.
    pub fn readable_head(&self) -> Result<ImmutableRootMetadata> {
        let head = self.head();
        head.data()?;
        Ok(head)
    }

    pub fn root_node(&self) -> Result<Node> {
        let head = self.readable_head()?;
        let ptr = head.root_entry()?.ptr();
        let mut state = self.state_mut();
        let id = self.nodes().get_or_create(ptr, "", None);
        state.root = Some(id);
        Ok(self.node(id))
    }

    pub(crate) fn signal_status(&self) {
        self.status.changed();
        self.ctx.status.changed();
    }

    pub fn subscribe_status(&self) -> tokio::sync::oneshot::Receiver<()> {
        self.status.subscribe()
    }

    pub fn status(&self) -> FolderBranchStatus {
        let state = self.state();
        let nodes = self.nodes();
        let mut dirty_paths: Vec<String> = state
            .dirty
            .keys()
            .filter_map(|id| nodes.path_from_node(*id).ok())
            .map(|path| {
                path.iter()
                    .skip(1)
                    .map(|p| format!("/{}", p.name))
                    .collect::<String>()
            })
            .collect();
        dirty_paths.sort();
        FolderBranchStatus {
            tlf: self.tlf,
            staged: state.branch.is_unmerged(),
            branch: state.head.branch_id(),
            head_revision: state.head.revision(),
            head_writer: state.head.bare.last_modifying_user,
            latest_merged_revision: state.latest_merged.revision(),
            readable: state.head.is_readable(),
            dirty_paths,
        }
    }

    /// Puts the blocks of a mutation, then its revision, and moves the
    /// folder's nodes onto the new pointers.
    pub(crate) async fn finalize(
        &self,
        md: RootMetadata,
        puts: Vec<PutBlock>,
    ) -> Result<ImmutableRootMetadata> {
        let tlf = self.tlf;
        self.ctx
            .blocks
            .put_all_cached(tlf, puts.into_iter().map(|p| (p.ptr, p.ready, p.block)).collect())
            .await?;

        let imd = match self.branch() {
            BranchState::Merged => match self.ctx.md.put(md.clone()).await {
                Ok(imd) => {
                    let unrefs: Vec<BlockPointer> = imd
                        .ops()
                        .iter()
                        .flat_map(|op| op.common().unref_blocks.iter().copied())
                        .collect();
                    if let Err(e) = self.ctx.blocks.archive(tlf, &unrefs).await {
                        tracing::warn!(%tlf, "archiving unreferenced blocks failed: {e}");
                    }
                    self.state_mut().latest_merged = imd.clone();
                    imd
                }
                Err(e) if e.is_conflict() => self.fork(md).await?,
                Err(e) => return Err(e),
            },
            BranchState::Unmerged(bid) => self.ctx.md.put_unmerged(md, bid).await?,
        };

        let updates: Vec<(BlockPointer, BlockPointer)> = imd
            .ops()
            .iter()
            .flat_map(|op| op.common().updates.iter().map(|u| (u.unref, u.ref_ptr)))
            .collect();
        self.nodes().repoint(&updates);
        self.state_mut().head = imd.clone();
        self.signal_status();
        Ok(imd)
    }

    /// Moves the folder onto a new unmerged branch holding `md`.
    async fn fork(&self, md: RootMetadata) -> Result<ImmutableRootMetadata> {
        let bid = make_random_branch_id();
        tracing::info!(tlf = %self.tlf, branch = %bid, rev = %md.revision(), "lost the merged race; forking");
        let imd = self.ctx.md.put_unmerged(md, bid).await?;
        let new_name = bid.to_string();
        {
            let mut state = self.state_mut();
            state.branch = BranchState::Unmerged(bid);
            for df in state.dirty.values() {
                for ptr in df.blocks.keys() {
                    if let Some(block) = self.ctx.dirty.delete(self.tlf, ptr, MASTER_BRANCH) {
                        self.ctx.dirty.put(self.tlf, ptr, &new_name, block);
                    }
                }
            }
        }
        self.cr_wake.notify_one();
        Ok(imd)
    }

    pub(crate) fn path(&self, id: NodeId) -> Result<Vec<PathNode>> {
        self.nodes().path_from_node(id)
    }

    /// Rejects names no directory entry may carry.
    pub(crate) fn check_name(&self, name: &str) -> Result<()> {
        if name.is_empty()
            || name == "."
            || name == ".."
            || name.contains('/')
            || name.contains('\0')
            || name.len() > self.ctx.config.max_name_bytes
        {
            return Err(Error::InvalidName(name.to_string()));
        }
        Ok(())
    }
}
