//! Folding other devices' merged revisions into this folder.

use tlfs_core::{BlockPointer, EntryType, Error, MetadataRevision, Result, ops::Op};
use tlfs_md::ImmutableRootMetadata;

use super::{BranchState, FolderBranchOps};
use crate::{NodeChange, NodeId};

impl FolderBranchOps {
    pub async fn get_and_apply_updates(&self) -> Result<()> {
        let _lock = self.write_lock.lock().await;
        self.get_and_apply_updates_locked().await
    }

    /// Fetches merged revisions past the head and applies them. A folder on
    /// an unmerged branch leaves that to conflict resolution.
    pub(crate) async fn get_and_apply_updates_locked(&self) -> Result<()> {
        if self.branch().is_unmerged() {
            self.cr_wake.notify_one();
            return Ok(());
        }
        let head = self.head();
        let mds = self
            .ctx
            .md
            .get_range(self.tlf, head.revision().next(), MetadataRevision::MAX)
            .await?;
        let Some(first) = mds.first() else {
            return Ok(());
        };
        if first.bare.prev_root != head.md_id() {
            return Err(Error::Integrity(format!(
                "revision {} of {} does not follow local head {}",
                first.revision(),
                self.tlf,
                head.revision()
            )));
        }

        if self.dirty_files_touched(&mds) {
            // Our writes race theirs: sync first, which forks.
            self.sync_all_locked().await?;
            if self.branch().is_unmerged() {
                self.cr_wake.notify_one();
                return Ok(());
            }
        }

        let mut changes = Vec::new();
        for md in &mds {
            changes.extend(self.apply_remote_ops(md));
        }
        let Some(last) = mds.last().cloned() else {
            return Ok(());
        };
        tracing::debug!(tlf = %self.tlf, from = %head.revision(), to = %last.revision(), "applied remote updates");
        {
            let mut state = self.state_mut();
            state.head = last.clone();
            state.latest_merged = last;
        }
        self.observers.batch_changes(&changes);
        self.signal_status();
        Ok(())
    }

    fn dirty_files_touched(&self, mds: &[ImmutableRootMetadata]) -> bool {
        let state = self.state();
        let dirty: Vec<BlockPointer> = state.dirty.values().map(|df| df.ptr).collect();
        if dirty.is_empty() {
            return false;
        }
        mds.iter().flat_map(|md| md.ops()).any(|op| {
            op.common().updates.iter().any(|u| dirty.contains(&u.unref))
                || matches!(op, Op::Rm(rm) if rm.removed.is_some_and(|p| dirty.contains(&p)))
        })
    }

    /// Moves nodes the way `md`'s ops moved their entries.
    fn apply_remote_ops(&self, md: &ImmutableRootMetadata) -> Vec<NodeChange> {
        let mut changes = Vec::new();
        let mut nodes = self.nodes();
        for op in md.ops() {
            match op {
                Op::Rm(rm) => {
                    if let Some(id) = rm.removed.and_then(|p| nodes.get(&p)) {
                        nodes.unlink(id);
                        changes.push(NodeChange::Unlinked(self.node(id)));
                    }
                }
                Op::Rename(rn) => {
                    if let Some(id) = rn.renamed.and_then(|p| nodes.get(&p)) {
                        match nodes.get(&rn.new_dir.unwrap_or(rn.old_dir)) {
                            Some(parent) => nodes.move_node(id, parent, &rn.new_name),
                            None => {
                                nodes.unlink(id);
                                changes.push(NodeChange::Unlinked(self.node(id)));
                            }
                        }
                    }
                }
                _ => {}
            }
            let updates: Vec<(BlockPointer, BlockPointer)> = op
                .common()
                .updates
                .iter()
                .map(|u| (u.unref, u.ref_ptr))
                .collect();
            changes.extend(
                nodes
                    .repoint(&updates)
                    .into_iter()
                    .map(|id| NodeChange::Updated(self.node(id))),
            );
        }
        changes
    }

    /// Throws away this device's unmerged branch and every unsynced write,
    /// returning the folder to the merged head.
    pub async fn unstage(&self) -> Result<()> {
        let _lock = self.write_lock.lock().await;
        let dirty: Vec<NodeId> = self.state().dirty.keys().copied().collect();
        for id in dirty {
            self.drop_dirty(id);
        }
        let BranchState::Unmerged(bid) = self.branch() else {
            return Ok(());
        };

        let branch = self
            .ctx
            .md
            .get_unmerged_range(self.tlf, bid, MetadataRevision::INITIAL, MetadataRevision::MAX)
            .await?;
        let refs: Vec<BlockPointer> = branch
            .iter()
            .flat_map(|md| md.ops().iter().flat_map(|op| op.common().ref_blocks.clone()))
            .collect();
        self.ctx.md.prune_branch(self.tlf, bid).await?;
        if let Err(e) = self.ctx.blocks.delete(self.tlf, &refs).await {
            tracing::warn!(tlf = %self.tlf, "dropping unstaged blocks failed: {e}");
        }

        let merged = self
            .ctx
            .md
            .get_for_tlf(self.tlf)
            .await?
            .ok_or_else(|| Error::NotFound(format!("merged head of {}", self.tlf)))?;
        tracing::info!(tlf = %self.tlf, branch = %bid, rev = %merged.revision(), "unstaged local changes");
        {
            let mut state = self.state_mut();
            state.head = merged.clone();
            state.latest_merged = merged.clone();
            state.branch = BranchState::Merged;
        }
        let changes = self.refresh_nodes(&merged).await?;
        self.observers.batch_changes(&changes);
        self.signal_status();
        Ok(())
    }

    /// Re-points every known node at the entry of the same path in `md`,
    /// unlinking nodes whose path is gone.
    pub(crate) async fn refresh_nodes(&self, md: &ImmutableRootMetadata) -> Result<Vec<NodeChange>> {
        let Some(root) = self.state().root else {
            return Ok(Vec::new());
        };
        let root_ptr = md.root_entry()?.ptr();
        let mut moves = vec![(root, root_ptr)];
        let mut unlinks = Vec::new();
        let mut queue = vec![(root, root_ptr)];
        while let Some((id, ptr)) = queue.pop() {
            let children = self.nodes().children(id);
            if children.is_empty() {
                continue;
            }
            let dir = self.get_dir(md, &ptr).await?;
            for child in children {
                let name = self.nodes().name(child).unwrap_or_default().to_string();
                match dir.children.get(&name) {
                    Some(entry) if entry.entry.typ != EntryType::Sym => {
                        moves.push((child, entry.ptr()));
                        if entry.entry.typ == EntryType::Dir {
                            queue.push((child, entry.ptr()));
                        }
                    }
                    _ => unlinks.push(child),
                }
            }
        }

        let mut nodes = self.nodes();
        nodes.reassign(&moves);
        let mut changes: Vec<NodeChange> = moves
            .iter()
            .map(|(id, _)| NodeChange::Updated(self.node(*id)))
            .collect();
        for id in unlinks {
            nodes.unlink(id);
            changes.push(NodeChange::Unlinked(self.node(id)));
        }
        Ok(changes)
    }

    /// Syncs, then brings the folder fully up to date with the server:
    /// resolving conflicts if it is staged, applying updates otherwise.
    pub async fn sync_from_server(&self) -> Result<()> {
        let _lock = self.write_lock.lock().await;
        self.sync_all_locked().await?;
        if self.branch().is_unmerged() {
            self.resolve_conflicts_locked().await
        } else {
            self.get_and_apply_updates_locked().await
        }
    }
}
