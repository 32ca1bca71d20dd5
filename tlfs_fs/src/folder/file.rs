//! Buffered file writes and their sync.
//!
//! Writes land in the dirty block cache under the folder's current branch
//! and are charged against the engine's dirty buffer. A file stays direct
//! while it fits in one block; past that its bytes move into fixed-size
//! children, every child but the last exactly one block long.

use std::collections::{HashMap, HashSet};
use tlfs_core::{
    Block, BlockContext, BlockInfo, BlockPointer, CancellationToken, Error, FileBlock,
    IndirectFilePtr, Result, UserId,
    crypto::{make_block_ref_nonce, make_temporary_block_id},
    ops::{Op, SyncOp, WriteRange},
};
use tlfs_md::RootMetadata;

use super::{DirWriter, FolderBranchOps, PutBlock};
use crate::{NodeChange, NodeId};

/// Unsynced state of one open file.
#[derive(Clone, Debug)]
pub(crate) struct DirtyFile {
    /// Top block pointer as of the last sync.
    pub ptr: BlockPointer,
    pub size: u64,
    pub mtime: i64,
    pub writes: Vec<WriteRange>,
    /// Blocks held in the dirty cache and the bytes charged for each.
    pub blocks: HashMap<BlockPointer, u64>,
    /// Children created since the last sync; the server has never seen them.
    pub temp: HashSet<BlockPointer>,
    /// Synced children dropped by truncation.
    pub unrefs: Vec<BlockInfo>,
}

impl DirtyFile {
    fn clean(ptr: BlockPointer, size: u64, mtime: i64) -> Self {
        Self {
            ptr,
            size,
            mtime,
            writes: Vec::new(),
            blocks: HashMap::new(),
            temp: HashSet::new(),
            unrefs: Vec::new(),
        }
    }

    pub fn unsynced(&self) -> i64 {
        self.blocks.values().sum::<u64>() as i64
    }
}

/// What a write works against: the head it read, its branch and writer.
struct WriteCtx<'a> {
    md: &'a RootMetadata,
    branch: String,
    uid: UserId,
}

impl FolderBranchOps {
    /// Buffers `data` at `off`. Blocks for dirty-buffer room first.
    pub async fn write(
        &self,
        cancel: &CancellationToken,
        id: NodeId,
        data: &[u8],
        off: u64,
    ) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let estimate = data.len() as i64;
        self.ctx
            .dirty
            .request_permission_to_dirty(cancel, self.tlf, data.len() as u64)
            .await?;
        {
            // The estimate is reconciled before a sync can see this write.
            let _lock = self.write_lock.lock().await;
            match self.write_locked(id, data, off).await {
                Ok(delta) => self.ctx.dirty.update_unsynced_bytes(delta - estimate, false),
                Err(e) => {
                    self.ctx.dirty.update_unsynced_bytes(-estimate, false);
                    return Err(e);
                }
            }
        }
        self.observers.local_change(
            self.node(id),
            WriteRange {
                off,
                len: data.len() as u64,
            },
        );
        self.maybe_force_sync().await
    }

    pub async fn truncate(&self, cancel: &CancellationToken, id: NodeId, size: u64) -> Result<()> {
        let current = self.stat(id).await?.size;
        if size > current {
            let zeros = vec![0u8; (size - current) as usize];
            return self.write(cancel, id, &zeros, current).await;
        }
        if size == current {
            return Ok(());
        }
        {
            let _lock = self.write_lock.lock().await;
            let delta = self.truncate_locked(id, size).await?;
            self.ctx.dirty.update_unsynced_bytes(delta, false);
        }
        self.observers
            .local_change(self.node(id), WriteRange { off: size, len: 0 });
        Ok(())
    }

    async fn maybe_force_sync(&self) -> Result<()> {
        if !self.ctx.dirty.should_force_sync() {
            return Ok(());
        }
        if self.ctx.config.background_flushes {
            self.flush_wake.notify_one();
            return Ok(());
        }
        let _lock = self.write_lock.lock().await;
        self.sync_all_locked().await
    }

    /// The dirty state of `id`, starting a clean one for a file with no
    /// unsynced writes.
    async fn dirty_file(&self, id: NodeId) -> Result<DirtyFile> {
        if let Some(df) = self.state().dirty.get(&id).cloned() {
            return Ok(df);
        }
        let (_, entry) = self.entry_of(id).await?;
        if !entry.entry.typ.is_file() {
            return Err(Error::NotFile(
                self.nodes().name(id).unwrap_or_default().to_string(),
            ));
        }
        Ok(DirtyFile::clean(entry.ptr(), entry.entry.size, entry.entry.mtime))
    }

    fn store_block(&self, w: &WriteCtx<'_>, df: &mut DirtyFile, ptr: BlockPointer, block: Block) {
        let size = block.dirty_size();
        self.ctx.dirty.put(self.tlf, &ptr, &w.branch, block);
        df.blocks.insert(ptr, size);
    }

    fn temp_ptr(&self, w: &WriteCtx<'_>, df: &mut DirtyFile) -> BlockPointer {
        let ptr = BlockPointer::new(
            make_temporary_block_id(),
            w.md.bare.latest_key_gen(),
            BlockContext::first_ref(w.uid),
        );
        df.temp.insert(ptr);
        ptr
    }

    /// Applies one write; returns the change in bytes charged.
    async fn write_locked(&self, id: NodeId, data: &[u8], off: u64) -> Result<i64> {
        let head = self.readable_head()?;
        let w = WriteCtx {
            md: &head,
            branch: self.branch_name(),
            uid: self.ctx.current_uid().await?,
        };
        let mut df = self.dirty_file(id).await?;
        let before = df.unsynced();
        let mut top = self.get_file(&head, &df.ptr, &w.branch).await?;

        self.write_into(&w, &mut df, &mut top, data, off).await?;
        let top_ptr = df.ptr;
        self.store_block(&w, &mut df, top_ptr, Block::File(top));
        df.writes.push(WriteRange {
            off,
            len: data.len() as u64,
        });
        df.mtime = self.ctx.now_ms();

        let delta = df.unsynced() - before;
        self.state_mut().dirty.insert(id, df);
        Ok(delta)
    }

    async fn write_into(
        &self,
        w: &WriteCtx<'_>,
        df: &mut DirtyFile,
        top: &mut FileBlock,
        data: &[u8],
        off: u64,
    ) -> Result<()> {
        let bs = self.ctx.config.max_block_size.max(1) as u64;
        let end = off + data.len() as u64;
        let old_size = df.size;
        let new_size = old_size.max(end);

        if !top.is_ind && new_size <= bs {
            if (top.contents.len() as u64) < new_size {
                top.contents.resize(new_size as usize, 0);
            }
            top.contents[off as usize..end as usize].copy_from_slice(data);
            df.size = new_size;
            return Ok(());
        }
        if !top.is_ind {
            self.make_indirect(w, df, top, bs);
        }

        let last = ((new_size - 1) / bs) as usize;
        for i in 0..=last {
            let start = i as u64 * bs;
            let child_end = (start + bs).min(new_size);
            let overlaps = off < child_end && end > start;
            let exists = i < top.iptrs.len();
            // The old last child may be short and must grow.
            let grows = exists && i + 1 == top.iptrs.len() && new_size > old_size;
            if exists && !overlaps && !grows {
                continue;
            }

            let (ptr, mut child) = if exists {
                let ptr = top.iptrs[i].info.ptr;
                (ptr, self.get_file(w.md, &ptr, &w.branch).await?)
            } else {
                let ptr = self.temp_ptr(w, df);
                top.iptrs.push(IndirectFilePtr {
                    info: BlockInfo {
                        ptr,
                        encoded_size: 0,
                    },
                    off: start,
                });
                (ptr, FileBlock::default())
            };

            let len = (child_end - start) as usize;
            if child.contents.len() < len {
                child.contents.resize(len, 0);
            }
            if overlaps {
                let from = off.max(start);
                let to = end.min(child_end);
                child.contents[(from - start) as usize..(to - start) as usize]
                    .copy_from_slice(&data[(from - off) as usize..(to - off) as usize]);
            }
            self.store_block(w, df, ptr, Block::File(child));
        }
        df.size = new_size;
        Ok(())
    }

    /// Moves a direct file's bytes into block-sized children.
    fn make_indirect(&self, w: &WriteCtx<'_>, df: &mut DirtyFile, top: &mut FileBlock, bs: u64) {
        let contents = std::mem::take(&mut top.contents);
        top.is_ind = true;
        for (i, chunk) in contents.chunks(bs as usize).enumerate() {
            let ptr = self.temp_ptr(w, df);
            top.iptrs.push(IndirectFilePtr {
                info: BlockInfo {
                    ptr,
                    encoded_size: 0,
                },
                off: i as u64 * bs,
            });
            self.store_block(
                w,
                df,
                ptr,
                Block::File(FileBlock {
                    contents: chunk.to_vec(),
                    ..FileBlock::default()
                }),
            );
        }
    }

    fn drop_child(&self, w: &WriteCtx<'_>, df: &mut DirtyFile, info: BlockInfo) {
        if df.blocks.remove(&info.ptr).is_some() {
            self.ctx.dirty.delete(self.tlf, &info.ptr, &w.branch);
        }
        if !df.temp.remove(&info.ptr) {
            df.unrefs.push(info);
        }
    }

    async fn truncate_locked(&self, id: NodeId, size: u64) -> Result<i64> {
        let head = self.readable_head()?;
        let w = WriteCtx {
            md: &head,
            branch: self.branch_name(),
            uid: self.ctx.current_uid().await?,
        };
        let mut df = self.dirty_file(id).await?;
        let before = df.unsynced();
        let mut top = self.get_file(&head, &df.ptr, &w.branch).await?;

        if !top.is_ind {
            top.contents.truncate(size as usize);
        } else if size == 0 {
            for iptr in std::mem::take(&mut top.iptrs) {
                self.drop_child(&w, &mut df, iptr.info);
            }
            top = FileBlock::default();
        } else {
            let bs = self.ctx.config.max_block_size.max(1) as u64;
            let keep = ((size - 1) / bs) as usize + 1;
            if top.iptrs.len() > keep {
                for iptr in top.iptrs.split_off(keep) {
                    self.drop_child(&w, &mut df, iptr.info);
                }
            }
            if let Some(last) = top.iptrs.last().copied() {
                let mut child = self.get_file(&head, &last.info.ptr, &w.branch).await?;
                child.contents.truncate((size - last.off) as usize);
                self.store_block(&w, &mut df, last.info.ptr, Block::File(child));
            }
        }

        let top_ptr = df.ptr;
        self.store_block(&w, &mut df, top_ptr, Block::File(top));
        df.size = size;
        df.writes.push(WriteRange { off: size, len: 0 });
        df.mtime = self.ctx.now_ms();

        let delta = df.unsynced() - before;
        self.state_mut().dirty.insert(id, df);
        Ok(delta)
    }

    /// Forgets the unsynced state of `id`, releasing its buffer charge.
    pub(crate) fn drop_dirty(&self, id: NodeId) {
        let Some(df) = self.state_mut().dirty.remove(&id) else {
            return;
        };
        let branch = self.branch_name();
        for ptr in df.blocks.keys() {
            self.ctx.dirty.delete(self.tlf, ptr, &branch);
        }
        self.ctx.dirty.update_unsynced_bytes(-df.unsynced(), false);
    }

    pub async fn sync(&self, id: NodeId) -> Result<()> {
        let _lock = self.write_lock.lock().await;
        self.sync_locked(id).await
    }

    pub async fn sync_all(&self) -> Result<()> {
        let _lock = self.write_lock.lock().await;
        self.sync_all_locked().await
    }

    pub(crate) async fn sync_all_locked(&self) -> Result<()> {
        let mut ids: Vec<NodeId> = self.state().dirty.keys().copied().collect();
        ids.sort();
        for id in ids {
            self.sync_locked(id).await?;
        }
        Ok(())
    }

    /// Puts the dirty blocks of `id` and a revision pointing at them.
    pub(crate) async fn sync_locked(&self, id: NodeId) -> Result<()> {
        let Some(df) = self.state_mut().dirty.remove(&id) else {
            return Ok(());
        };
        let branch = self.branch_name();
        let unsynced = df.unsynced();
        self.ctx.dirty.update_syncing_bytes(unsynced);
        let res = self.sync_dirty_file(id, &df, &branch).await;
        self.ctx.dirty.block_sync_finished(unsynced);
        match res {
            Ok(()) => {
                self.ctx.dirty.sync_finished(unsynced);
                for ptr in df.blocks.keys() {
                    self.ctx.dirty.delete(self.tlf, ptr, &branch);
                }
                self.observers
                    .batch_changes(&[NodeChange::Updated(self.node(id))]);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(tlf = %self.tlf, node = ?id, "sync failed: {e}");
                self.state_mut().dirty.insert(id, df);
                Err(e)
            }
        }
    }

    async fn sync_dirty_file(&self, id: NodeId, df: &DirtyFile, branch: &str) -> Result<()> {
        let head = self.readable_head()?;
        let uid = self.ctx.current_uid().await?;
        let now = self.ctx.now_ms();
        let path = self.path(id)?;
        let Some((file, dirs_path)) = path.split_last() else {
            return Err(Error::NotFound(format!("node {id:?}")));
        };
        let Some(parent) = dirs_path.last() else {
            return Err(Error::NotFile("/".to_string()));
        };
        let parent_ptr = parent.ptr;
        let mut dirs = DirWriter::stage(self, &head, &[dirs_path]).await?;
        let old_top = {
            let entry = dirs.entry(&parent_ptr, &file.name)?;
            if entry.ptr() != df.ptr {
                return Err(Error::NotFound(format!("{} (stale node)", file.name)));
            }
            entry.info
        };

        let mut md = head.successor();
        let key_gen = md.bare.latest_key_gen();
        let mut puts = Vec::new();
        let mut refs: Vec<BlockInfo> = Vec::new();
        let mut unrefs: Vec<BlockInfo> = df.unrefs.clone();

        let mut top = self.get_file(&head, &df.ptr, branch).await?;
        if top.is_ind {
            for iptr in top.iptrs.iter_mut() {
                let old = iptr.info;
                if !df.blocks.contains_key(&old.ptr) {
                    continue;
                }
                let block = Block::File(self.get_file(&head, &old.ptr, branch).await?);
                let ready = self.ctx.blocks.ready(&md.bare, &block).await?;
                let ptr = BlockPointer::new(ready.id, key_gen, BlockContext::first_ref(uid));
                iptr.info = BlockInfo {
                    ptr,
                    encoded_size: ready.encoded_size(),
                };
                if !df.temp.contains(&old.ptr) {
                    unrefs.push(old);
                }
                refs.push(iptr.info);
                puts.push(PutBlock { ptr, ready, block });
            }
        }

        // A direct block someone already stored is referenced, not re-put.
        let known = if top.is_ind {
            None
        } else {
            self.ctx.blocks.cache().check_for_known_ptr(self.tlf, &top)
        };
        let block = Block::File(top);
        let ready = self.ctx.blocks.ready(&md.bare, &block).await?;
        let ptr = match known {
            Some(known) => known.with_ref_nonce(make_block_ref_nonce(), uid),
            None => BlockPointer::new(ready.id, key_gen, BlockContext::first_ref(uid)),
        };
        let info = BlockInfo {
            ptr,
            encoded_size: ready.encoded_size(),
        };
        refs.push(info);
        unrefs.push(old_top);
        puts.push(PutBlock { ptr, ready, block });

        {
            let entry = dirs.entry_mut(&parent_ptr, &file.name)?;
            entry.info = info;
            entry.entry.size = df.size;
            entry.entry.mtime = df.mtime;
            entry.entry.ctime = now;
        }

        let mut op = Op::Sync(SyncOp {
            common: Default::default(),
            file: df.ptr,
            writes: df.writes.clone(),
        });
        puts.extend(dirs.write_out(self, &mut md, &mut op).await?);
        op.add_update(df.ptr, ptr);
        for r in &refs {
            op.common_mut().ref_blocks.push(r.ptr);
            md.add_ref_bytes(u64::from(r.encoded_size));
        }
        for u in &unrefs {
            op.common_mut().unref_blocks.push(u.ptr);
            md.add_unref_bytes(u64::from(u.encoded_size));
        }
        md.add_op(op)?;

        let imd = self.finalize(md, puts).await?;
        tracing::debug!(tlf = %self.tlf, rev = %imd.revision(), bytes = df.size, "synced file");
        Ok(())
    }
}
