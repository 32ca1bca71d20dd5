//! Conflict resolution: folding this device's unmerged branch back into
//! the merged branch.
//!
//! Both branches are summarized as [`Chains`] keyed by the pointers they
//! started from. The merged tree is loaded into a [`CrTree`], the unmerged
//! tree is walked against it, and every difference becomes a [`CrAction`]
//! applied to the merged tree. The edited tree is then written out as a
//! single revision on top of the merged head.

mod actions;
mod chains;
mod renamer;
mod tree;

pub(crate) use actions::CrAction;
pub(crate) use chains::Chains;
pub use renamer::{ConflictRenamer, WriterDateRenamer};

use std::{
    cmp::Reverse,
    collections::{HashMap, HashSet},
    mem,
};
use tlfs_core::{
    Block, BlockContext, BlockInfo, BlockPointer, BranchId, DirBlock, DirEntry, EntryType, Error,
    MetadataRevision, Result, UserId,
    crypto::make_block_ref_nonce,
    ops::{AttrChange, BlockUpdate, Op, OpCommon, ResolutionOp},
};
use tlfs_md::ImmutableRootMetadata;

use self::tree::{CrNode, CrTree};
use crate::{
    NodeCache, NodeChange, NodeId,
    folder::{BranchState, FolderBranchOps, PutBlock, touch},
};

/// How many conflict names are tried before giving up on an entry.
const MAX_CONFLICT_NAMES: u32 = 100;
/// Resolutions lost to newer merged revisions before giving up.
const MAX_ATTEMPTS: usize = 10;

impl FolderBranchOps {
    /// Syncs every dirty file, then merges the unmerged branch.
    pub async fn resolve_conflicts(&self) -> Result<()> {
        let _lock = self.write_lock.lock().await;
        self.sync_all_locked().await?;
        self.resolve_conflicts_locked().await
    }

    pub(crate) async fn resolve_conflicts_locked(&self) -> Result<()> {
        let mut attempts = 0;
        while let BranchState::Unmerged(bid) = self.branch() {
            let unmerged = self
                .ctx
                .md
                .get_unmerged_range(self.tlf, bid, MetadataRevision::INITIAL, MetadataRevision::MAX)
                .await?;
            let (Some(first), Some(u_head)) = (unmerged.first(), unmerged.last().cloned()) else {
                tracing::info!(tlf = %self.tlf, branch = %bid, "unmerged branch is gone");
                let merged = self
                    .ctx
                    .md
                    .get_for_tlf(self.tlf)
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("merged head of {}", self.tlf)))?;
                {
                    let mut state = self.state_mut();
                    state.head = merged.clone();
                    state.latest_merged = merged.clone();
                    state.branch = BranchState::Merged;
                }
                let changes = self.refresh_nodes(&merged).await?;
                self.observers.batch_changes(&changes);
                self.signal_status();
                return Ok(());
            };

            let merged = self
                .ctx
                .md
                .get_range(self.tlf, first.revision().prev(), MetadataRevision::MAX)
                .await?;
            let (Some(fork), Some(base)) = (merged.first(), merged.last().cloned()) else {
                return Err(Error::Integrity(format!(
                    "no merged revision {} to resolve {} against",
                    first.revision().prev(),
                    self.tlf
                )));
            };
            if fork.md_id() != first.bare.prev_root {
                return Err(Error::Integrity(format!(
                    "unmerged branch {bid} of {} does not start at merged revision {}",
                    self.tlf,
                    fork.revision()
                )));
            }

            let u_chains = Chains::build(&unmerged);
            let m_chains = Chains::build(&merged[1..]);
            tracing::debug!(
                tlf = %self.tlf,
                branch = %bid,
                unmerged = unmerged.len(),
                merged = merged.len() - 1,
                "resolving conflicts"
            );
            let mut resolver = Resolver::new(self, u_head, base, u_chains, m_chains).await?;
            resolver.plan().await?;
            match resolver.commit().await {
                Ok(imd) => return resolver.finish(bid, imd).await,
                Err(e) if e.is_conflict() && attempts + 1 < MAX_ATTEMPTS => {
                    attempts += 1;
                    tracing::debug!(tlf = %self.tlf, attempts, "merged branch moved during resolution; retrying");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

struct Resolver<'a> {
    folder: &'a FolderBranchOps,
    u_md: ImmutableRootMetadata,
    base: ImmutableRootMetadata,
    u_chains: Chains,
    m_chains: Chains,
    /// The unmerged head's tree.
    u: CrTree,
    /// The merged head's tree; edited into the resolved tree.
    r: CrTree,
    u_to_r: HashMap<usize, usize>,
    actions: Vec<(CrAction, usize)>,
    refs: Vec<BlockInfo>,
    unrefs: Vec<BlockInfo>,
    /// Extra references to blocks that already exist.
    extra_refs: Vec<BlockPointer>,
    puts: Vec<PutBlock>,
    writer: String,
    uid: UserId,
    at_ms: i64,
}

impl<'a> Resolver<'a> {
    async fn new(
        folder: &'a FolderBranchOps,
        u_md: ImmutableRootMetadata,
        base: ImmutableRootMetadata,
        u_chains: Chains,
        m_chains: Chains,
    ) -> Result<Self> {
        let session = folder.ctx.session().await?;
        let u = CrTree::load(folder, &u_md, &u_chains).await?;
        let r = CrTree::load(folder, &base, &m_chains).await?;
        Ok(Self {
            folder,
            at_ms: u_md.bare.timestamp,
            u_md,
            base,
            u_chains,
            m_chains,
            u,
            r,
            u_to_r: HashMap::new(),
            actions: Vec::new(),
            refs: Vec::new(),
            unrefs: Vec::new(),
            extra_refs: Vec::new(),
            puts: Vec::new(),
            writer: session.name,
            uid: session.uid,
        })
    }

    fn apply(&mut self, action: CrAction) -> usize {
        let node = action.apply(&mut self.r);
        tracing::trace!(%action, node, "planned");
        self.actions.push((action, node));
        node
    }

    fn free_name(&self, parent: usize, name: &str) -> Result<String> {
        (0..MAX_CONFLICT_NAMES)
            .map(|attempt| {
                self.folder
                    .ctx
                    .renamer
                    .conflict_name(name, &self.writer, self.at_ms, attempt)
            })
            .find(|candidate| self.r.child(parent, candidate).is_none())
            .ok_or_else(|| Error::NameExists(name.to_string()))
    }

    async fn plan(&mut self) -> Result<()> {
        let removals = self.u_chains.removals().to_vec();
        self.plan_removals(&removals, false).await?;
        self.plan_removed_syms();
        self.plan_placements().await?;
        // Directories go last: by now their children have moved out.
        self.plan_removals(&removals, true).await
    }

    async fn plan_removals(&mut self, removals: &[BlockPointer], dirs: bool) -> Result<()> {
        for origin in removals {
            if self.u_chains.is_created(origin) {
                continue;
            }
            let Some(target) = self.r.find(origin) else {
                continue;
            };
            if self.r.nodes[target].is_dir() != dirs {
                continue;
            }
            let changed = if dirs {
                !self.r.nodes[target].children.is_empty()
            } else {
                self.m_chains.is_modified(origin) || !self.m_chains.attrs(origin).is_empty()
            };
            if changed {
                self.apply(CrAction::KeepModified { target });
            } else {
                self.remove(target).await?;
            }
        }
        Ok(())
    }

    fn plan_removed_syms(&mut self) {
        for (dir, name) in self.u_chains.removed_syms().to_vec() {
            let Some(parent) = self.r.find(&dir) else {
                continue;
            };
            if let Some(target) = self.r.child(parent, &name)
                && self.r.nodes[target].entry.entry.typ == EntryType::Sym
            {
                self.apply(CrAction::RemoveEntry {
                    target,
                    parent,
                    name,
                });
            }
        }
    }

    async fn remove(&mut self, target: usize) -> Result<()> {
        let node = &self.r.nodes[target];
        let Some(parent) = node.parent else {
            return Ok(());
        };
        let name = node.name.clone();
        let entry = node.entry.clone();
        let blocks = self.folder.entry_blocks(&self.base, &entry).await?;
        self.unrefs.extend(blocks);
        self.apply(CrAction::RemoveEntry {
            target,
            parent,
            name,
        });
        Ok(())
    }

    /// Unmerged nodes whose subtree this branch changed.
    fn touched_subtrees(&self) -> HashSet<usize> {
        let mut touched = HashSet::new();
        for idx in self.u.bfs().into_iter().rev() {
            let node = &self.u.nodes[idx];
            let own = match node.origin {
                Some(origin) => self.u_chains.touched(&origin),
                None => node
                    .parent
                    .and_then(|p| self.u.nodes[p].origin)
                    .is_some_and(|dir| self.u_chains.is_created_sym(&dir, &node.name)),
            };
            if own || node.children.values().any(|c| touched.contains(c)) {
                touched.insert(idx);
            }
        }
        touched
    }

    /// Walks the unmerged tree top-down, placing each node in the merged
    /// tree under the node its parent maps to.
    async fn plan_placements(&mut self) -> Result<()> {
        let touched = self.touched_subtrees();
        let mut restored: HashSet<usize> = HashSet::new();
        self.u_to_r.insert(CrTree::ROOT, CrTree::ROOT);
        for u in self.u.bfs().into_iter().skip(1) {
            let node = self.u.nodes[u].clone();
            let Some(u_parent) = node.parent else {
                continue;
            };
            let Some(&parent) = self.u_to_r.get(&u_parent) else {
                continue;
            };

            let Some(origin) = node.origin else {
                let created = self.u.nodes[u_parent]
                    .origin
                    .is_some_and(|dir| self.u_chains.is_created_sym(&dir, &node.name));
                if created || restored.contains(&u_parent) {
                    self.copy(parent, &node, restored.contains(&u_parent))?;
                }
                continue;
            };

            if self.u_chains.is_created(&origin) {
                if let Some(existing) = self.r.child(parent, &node.name)
                    && node.is_dir()
                    && self.r.nodes[existing].is_dir()
                    && self.r.nodes[existing]
                        .origin
                        .is_some_and(|o| self.m_chains.is_created(&o))
                {
                    self.apply(CrAction::MergeDirs { target: existing });
                    self.u_to_r.insert(u, existing);
                } else {
                    let r = self.copy(parent, &node, false)?;
                    self.u_to_r.insert(u, r);
                }
                continue;
            }

            match self.r.find(&origin) {
                Some(r) => {
                    self.u_to_r.insert(u, r);
                    self.place_existing(u, r, parent, &node, origin).await?;
                }
                None if restored.contains(&u_parent) || touched.contains(&u) => {
                    // Removed on the merged branch but changed here.
                    let r = self.copy(parent, &node, true)?;
                    self.u_to_r.insert(u, r);
                    restored.insert(u);
                }
                None => {}
            }
        }
        Ok(())
    }

    fn copy(&mut self, parent: usize, node: &CrNode, restored: bool) -> Result<usize> {
        let action = if self.r.child(parent, &node.name).is_none() {
            CrAction::CopyUnmergedEntry {
                parent,
                name: node.name.clone(),
                entry: node.entry.clone(),
                origin: node.origin,
                restored,
            }
        } else {
            CrAction::RenameUnmergedEntry {
                parent,
                name: node.name.clone(),
                conflict_name: self.free_name(parent, &node.name)?,
                entry: node.entry.clone(),
                origin: node.origin,
            }
        };
        Ok(self.apply(action))
    }

    async fn place_existing(
        &mut self,
        u: usize,
        r: usize,
        parent: usize,
        node: &CrNode,
        origin: BlockPointer,
    ) -> Result<()> {
        if self.u_chains.is_renamed(&origin) {
            let from_name = self.r.nodes[r].name.clone();
            let from_parent = self.r.nodes[r].parent;
            let moved = from_parent != Some(parent) || from_name != node.name;
            if let Some(from_parent) = from_parent
                && moved
                && !self.r.is_ancestor(r, parent)
            {
                let name = match self.r.child(parent, &node.name) {
                    None => node.name.clone(),
                    Some(_) => self.free_name(parent, &node.name)?,
                };
                self.apply(CrAction::MoveEntry {
                    target: r,
                    from_parent,
                    from_name,
                    parent,
                    name,
                });
            }
        }

        if self.u_chains.is_modified(&origin) && node.entry.ptr() != self.r.nodes[r].entry.ptr() {
            if self.m_chains.is_modified(&origin) {
                let Some(parent) = self.r.nodes[r].parent else {
                    return Ok(());
                };
                let name = self.r.nodes[r].name.clone();
                let entry = self.deep_copy(&node.entry).await?;
                let conflict_name = self.free_name(parent, &name)?;
                let copy = self.apply(CrAction::RenameUnmergedFile {
                    parent,
                    name,
                    conflict_name,
                    entry,
                });
                self.u_to_r.insert(u, copy);
                return Ok(());
            }
            let base = self.folder.entry_blocks(&self.base, &self.r.nodes[r].entry).await?;
            let kept: HashSet<BlockPointer> = self
                .folder
                .entry_blocks(&self.u_md, &node.entry)
                .await?
                .iter()
                .map(|b| b.ptr)
                .collect();
            self.unrefs
                .extend(base.into_iter().filter(|b| !kept.contains(&b.ptr)));
            self.apply(CrAction::ReplaceEntry {
                target: r,
                entry: node.entry.clone(),
            });
        }

        let mut attrs: Vec<AttrChange> = self.u_chains.attrs(&origin).to_vec();
        attrs.sort_by_key(|a| *a as u8);
        attrs.dedup();
        for attr in attrs {
            // On a clash the merged side's attribute stands.
            if self.m_chains.attrs(&origin).contains(&attr) {
                continue;
            }
            self.apply(CrAction::SetAttr {
                target: r,
                attr,
                info: node.entry.entry.clone(),
            });
        }
        Ok(())
    }

    /// The unmerged version of a file under new references, so it no
    /// longer shares pointers with the merged version.
    async fn deep_copy(&mut self, entry: &DirEntry) -> Result<DirEntry> {
        let folder = self.folder;
        let ctx = &folder.ctx;
        let mut entry = entry.clone();
        let mut top = match ctx.blocks.get(&self.u_md.bare, &entry.ptr()).await? {
            Block::File(top) => top,
            Block::Dir(_) => return Err(Error::NotFile(entry.ptr().id.to_string())),
        };
        if !top.is_ind {
            entry.info.ptr = entry.ptr().with_ref_nonce(make_block_ref_nonce(), self.uid);
            self.extra_refs.push(entry.info.ptr);
            self.refs.push(entry.info);
            return Ok(entry);
        }
        for iptr in &mut top.iptrs {
            iptr.info.ptr = iptr.info.ptr.with_ref_nonce(make_block_ref_nonce(), self.uid);
            self.extra_refs.push(iptr.info.ptr);
            self.refs.push(iptr.info);
        }
        let block = Block::File(top);
        let ready = ctx.blocks.ready(&self.base.bare, &block).await?;
        let ptr = BlockPointer::new(
            ready.id,
            self.base.bare.latest_key_gen(),
            BlockContext::first_ref(self.uid),
        );
        entry.info = BlockInfo {
            ptr,
            encoded_size: ready.encoded_size(),
        };
        self.refs.push(entry.info);
        self.puts.push(PutBlock { ptr, ready, block });
        Ok(entry)
    }

    /// Rewrites every changed directory, records the actions as ops and
    /// puts the result on the merged branch.
    async fn commit(&mut self) -> Result<ImmutableRootMetadata> {
        let folder = self.folder;
        let ctx = &folder.ctx;
        let tlf = folder.tlf;
        let now = ctx.now_ms();
        let mut md = self.base.successor();
        let key_gen = md.bare.latest_key_gen();

        self.r.propagate_dirty();
        let mut dirs: Vec<usize> = (0..self.r.nodes.len())
            .filter(|i| {
                let n = &self.r.nodes[*i];
                n.dirty && n.is_dir() && self.r.is_attached(*i)
            })
            .collect();
        dirs.sort_by_key(|i| Reverse(self.r.depth(*i)));

        let mut refs = mem::take(&mut self.refs);
        for idx in dirs {
            let children = self.r.nodes[idx]
                .children
                .iter()
                .map(|(name, child)| (name.clone(), self.r.nodes[*child].entry.clone()))
                .collect();
            let block = Block::Dir(DirBlock { children });
            let ready = ctx.blocks.ready(&md.bare, &block).await?;
            let ptr = BlockPointer::new(ready.id, key_gen, BlockContext::first_ref(self.uid));
            let info = BlockInfo {
                ptr,
                encoded_size: ready.encoded_size(),
            };
            let node = &mut self.r.nodes[idx];
            touch(&mut node.entry, info, now);
            if node.from_merged {
                self.unrefs.push(BlockInfo {
                    ptr: node.base_ptr,
                    encoded_size: node.base_encoded,
                });
            }
            refs.push(info);
            self.puts.push(PutBlock { ptr, ready, block });
        }
        md.data_mut()?.dir = self.r.nodes[CrTree::ROOT].entry.clone();

        for (action, node) in &self.actions {
            if let Some(op) = action.to_op(&self.r, *node) {
                md.add_op(op)?;
            }
        }

        let mut updates: Vec<(usize, BlockUpdate)> = (0..self.r.nodes.len())
            .filter_map(|i| {
                let n = &self.r.nodes[i];
                let moved = n.from_merged
                    && n.entry.entry.typ != EntryType::Sym
                    && n.entry.ptr() != n.base_ptr
                    && self.r.is_attached(i);
                moved.then(|| {
                    (
                        self.r.depth(i),
                        BlockUpdate {
                            unref: n.base_ptr,
                            ref_ptr: n.entry.ptr(),
                        },
                    )
                })
            })
            .collect();
        updates.sort_by_key(|(depth, _)| *depth);

        let mut common = OpCommon {
            updates: updates.into_iter().map(|(_, u)| u).collect(),
            ..Default::default()
        };
        for r in &refs {
            common.ref_blocks.push(r.ptr);
            md.add_ref_bytes(u64::from(r.encoded_size));
        }
        for u in &self.unrefs {
            common.unref_blocks.push(u.ptr);
            md.add_unref_bytes(u64::from(u.encoded_size));
        }
        let summary = self
            .actions
            .iter()
            .map(|(action, node)| format!("{}: {action}", self.r.nodes[*node].name))
            .collect();
        md.add_op(Op::Resolution(ResolutionOp { common, summary }))?;

        let puts = mem::take(&mut self.puts)
            .into_iter()
            .map(|p| (p.ptr, p.ready, p.block))
            .collect();
        ctx.blocks.put_all_cached(tlf, puts).await?;
        for ptr in &self.extra_refs {
            ctx.blocks.add_reference(tlf, ptr).await?;
        }
        ctx.md.put(md).await
    }

    /// Retires the unmerged branch and moves the folder onto the resolved
    /// revision.
    async fn finish(self, bid: BranchId, imd: ImmutableRootMetadata) -> Result<()> {
        let folder = self.folder;
        let ctx = &folder.ctx;
        let tlf = folder.tlf;
        ctx.md.prune_branch(tlf, bid).await?;
        ctx.md.cache().replace(imd.clone(), bid);
        let unrefs: Vec<BlockPointer> = self.unrefs.iter().map(|b| b.ptr).collect();
        if let Err(e) = ctx.blocks.archive(tlf, &unrefs).await {
            tracing::warn!(%tlf, "archiving resolved blocks failed: {e}");
        }

        let mut changes = Vec::new();
        {
            let mut nodes = folder.nodes();
            let mut moves: Vec<(NodeId, BlockPointer)> = Vec::new();
            let mut placed: Vec<(NodeId, usize)> = Vec::new();
            let mut unlinks: Vec<NodeId> = Vec::new();
            for (idx, node) in self.u.nodes.iter().enumerate() {
                if node.entry.entry.typ == EntryType::Sym || !self.u.is_attached(idx) {
                    continue;
                }
                let Some(id) = nodes.get(&node.entry.ptr()) else {
                    continue;
                };
                match self.u_to_r.get(&idx) {
                    Some(&r) => {
                        moves.push((id, self.r.nodes[r].entry.ptr()));
                        placed.push((id, r));
                    }
                    None => unlinks.push(id),
                }
            }
            nodes.reassign(&moves);
            for (id, r) in placed {
                if let Some(parent) = self.r.nodes[r].parent {
                    let parent_id = self.ensure_node(&mut nodes, parent);
                    nodes.move_node(id, parent_id, &self.r.nodes[r].name);
                }
                changes.push(NodeChange::Updated(folder.node(id)));
            }
            for id in unlinks {
                nodes.unlink(id);
                changes.push(NodeChange::Unlinked(folder.node(id)));
            }
        }

        {
            let mut state = folder.state_mut();
            state.head = imd.clone();
            state.latest_merged = imd.clone();
            state.branch = BranchState::Merged;
        }
        tracing::info!(
            %tlf,
            branch = %bid,
            rev = %imd.revision(),
            actions = self.actions.len(),
            "resolved conflicts"
        );
        folder.observers.batch_changes(&changes);
        folder.signal_status();
        Ok(())
    }

    /// The node for resolved-tree node `idx`, registering it and its
    /// ancestors when the cache has never seen them.
    fn ensure_node(&self, nodes: &mut NodeCache, idx: usize) -> NodeId {
        let node = &self.r.nodes[idx];
        if let Some(id) = nodes.get(&node.entry.ptr()) {
            return id;
        }
        let parent = node.parent.map(|p| self.ensure_node(nodes, p));
        nodes.get_or_create(node.entry.ptr(), &node.name, parent)
    }
}
