//! Directory mutations: create, remove, rename and attribute changes.

use tlfs_core::{
    Block, BlockContext, BlockId, BlockInfo, BlockPointer, DirBlock, DirEntry, EntryInfo,
    EntryType, Error, FileBlock, Hash, KeyGen, Result,
    ops::{AttrChange, CreateOp, Op, OpCommon, RenameOp, RmOp, SetAttrOp},
};
use tlfs_md::RootMetadata;

use super::{DirWriter, FolderBranchOps, PutBlock};
use crate::{Node, NodeChange, NodeId};

impl FolderBranchOps {
    /// Adds a new entry called `name` to directory `parent`. Symlinks get
    /// no block and no node.
    pub async fn create_entry(
        &self,
        parent: NodeId,
        name: &str,
        typ: EntryType,
        sym_path: Option<&str>,
    ) -> Result<(Option<Node>, EntryInfo)> {
        self.check_name(name)?;
        let _lock = self.write_lock.lock().await;
        let head = self.readable_head()?;
        let path = self.path(parent)?;
        let parent_ptr = path
            .last()
            .map(|p| p.ptr)
            .ok_or_else(|| Error::NotFound(format!("node {parent:?}")))?;
        let mut dirs = DirWriter::stage(self, &head, &[&path]).await?;
        if dirs.dir(&parent_ptr)?.children.contains_key(name) {
            return Err(Error::NameExists(name.to_string()));
        }

        let mut md = head.successor();
        let uid = self.ctx.current_uid().await?;
        let now = self.ctx.now_ms();
        let mut puts = Vec::new();
        let (info, created) = if typ == EntryType::Sym {
            let ptr = BlockPointer::new(
                BlockId(Hash::ZERO),
                KeyGen::UNSPECIFIED,
                BlockContext::first_ref(uid),
            );
            (
                BlockInfo {
                    ptr,
                    encoded_size: 0,
                },
                None,
            )
        } else {
            let block = if typ == EntryType::Dir {
                Block::Dir(DirBlock::default())
            } else {
                Block::File(FileBlock::default())
            };
            let ready = self.ctx.blocks.ready(&md.bare, &block).await?;
            let ptr = BlockPointer::new(
                ready.id,
                md.bare.latest_key_gen(),
                BlockContext::first_ref(uid),
            );
            let info = BlockInfo {
                ptr,
                encoded_size: ready.encoded_size(),
            };
            md.add_ref_bytes(u64::from(info.encoded_size));
            puts.push(PutBlock { ptr, ready, block });
            (info, Some(ptr))
        };

        let entry = DirEntry {
            info,
            entry: EntryInfo {
                typ,
                size: match typ {
                    EntryType::Sym => sym_path.map_or(0, |s| s.len() as u64),
                    EntryType::Dir => u64::from(info.encoded_size),
                    _ => 0,
                },
                sym_path: sym_path.map(str::to_string),
                mtime: now,
                ctime: now,
            },
        };
        dirs.dir_mut(&parent_ptr)?
            .children
            .insert(name.to_string(), entry.clone());

        let mut op = Op::Create(CreateOp {
            common: OpCommon {
                ref_blocks: created.into_iter().collect(),
                ..OpCommon::default()
            },
            dir: parent_ptr,
            new_name: name.to_string(),
            entry_type: typ,
            created,
        });
        puts.extend(dirs.write_out(self, &mut md, &mut op).await?);
        md.add_op(op)?;
        self.finalize(md, puts).await?;

        let node = created.map(|ptr| self.node(self.nodes().get_or_create(ptr, name, Some(parent))));
        self.observers
            .batch_changes(&[NodeChange::Updated(self.node(parent))]);
        Ok((node, entry.entry))
    }

    /// Blocks dropped when `entry` leaves the tree: its top block and, for
    /// an indirect file, every child.
    pub(crate) async fn entry_blocks(&self, md: &RootMetadata, entry: &DirEntry) -> Result<Vec<BlockInfo>> {
        match entry.entry.typ {
            EntryType::Sym => Ok(Vec::new()),
            EntryType::Dir => Ok(vec![entry.info]),
            EntryType::File | EntryType::Exec => {
                let mut out = vec![entry.info];
                if let Block::File(top) = self.ctx.blocks.get(&md.bare, &entry.ptr()).await?
                    && top.is_ind
                {
                    out.extend(top.iptrs.iter().map(|iptr| iptr.info));
                }
                Ok(out)
            }
        }
    }

    /// Checks that `entry` may be dropped: a directory must be empty.
    async fn check_removable(&self, md: &RootMetadata, name: &str, entry: &DirEntry) -> Result<()> {
        if entry.entry.typ == EntryType::Dir
            && !self.get_dir(md, &entry.ptr()).await?.children.is_empty()
        {
            return Err(Error::DirNotEmpty(name.to_string()));
        }
        Ok(())
    }

    /// Removes `name` from `parent`. `want_dir` picks rmdir semantics.
    pub async fn remove(&self, parent: NodeId, name: &str, want_dir: bool) -> Result<()> {
        let _lock = self.write_lock.lock().await;
        let head = self.readable_head()?;
        let path = self.path(parent)?;
        let parent_ptr = path
            .last()
            .map(|p| p.ptr)
            .ok_or_else(|| Error::NotFound(format!("node {parent:?}")))?;
        let mut dirs = DirWriter::stage(self, &head, &[&path]).await?;
        let entry = dirs.entry(&parent_ptr, name)?.clone();
        match (entry.entry.typ == EntryType::Dir, want_dir) {
            (true, false) => return Err(Error::NotFile(name.to_string())),
            (false, true) => return Err(Error::NotDir(name.to_string())),
            _ => {}
        }
        self.check_removable(&head, name, &entry).await?;
        let unrefs = self.entry_blocks(&head, &entry).await?;
        dirs.dir_mut(&parent_ptr)?.children.remove(name);

        let mut md = head.successor();
        let removed = (entry.entry.typ != EntryType::Sym).then(|| entry.ptr());
        let mut op = Op::Rm(RmOp {
            common: OpCommon {
                unref_blocks: unrefs.iter().map(|i| i.ptr).collect(),
                ..OpCommon::default()
            },
            dir: parent_ptr,
            old_name: name.to_string(),
            removed,
        });
        for info in &unrefs {
            md.add_unref_bytes(u64::from(info.encoded_size));
        }
        let puts = dirs.write_out(self, &mut md, &mut op).await?;
        md.add_op(op)?;
        self.finalize(md, puts).await?;

        let mut changes = vec![NodeChange::Updated(self.node(parent))];
        if let Some(id) = removed.and_then(|ptr| self.nodes().get(&ptr)) {
            self.drop_dirty(id);
            self.nodes().unlink(id);
            changes.push(NodeChange::Unlinked(self.node(id)));
        }
        self.observers.batch_changes(&changes);
        Ok(())
    }

    /// Moves `old_name` in `old_parent` to `new_name` in `new_parent`,
    /// replacing a file or empty directory already there.
    pub async fn rename(
        &self,
        old_parent: NodeId,
        old_name: &str,
        new_parent: NodeId,
        new_name: &str,
    ) -> Result<()> {
        self.check_name(new_name)?;
        if old_parent == new_parent && old_name == new_name {
            return Ok(());
        }
        let _lock = self.write_lock.lock().await;
        let head = self.readable_head()?;
        let old_path = self.path(old_parent)?;
        let new_path = self.path(new_parent)?;
        let (Some(old_dir), Some(new_dir)) = (old_path.last(), new_path.last()) else {
            return Err(Error::NotFound(old_name.to_string()));
        };
        let (old_ptr, new_ptr) = (old_dir.ptr, new_dir.ptr);
        let mut dirs = DirWriter::stage(self, &head, &[&old_path, &new_path]).await?;
        let entry = dirs.entry(&old_ptr, old_name)?.clone();
        if entry.entry.typ == EntryType::Dir && new_path.iter().any(|p| p.ptr == entry.ptr()) {
            return Err(Error::InvalidName(format!(
                "{new_name} would move {old_name} into itself"
            )));
        }

        let mut md = head.successor();
        let now = self.ctx.now_ms();
        let mut replaced_op = None;
        let mut replaced = None;
        if let Some(target) = dirs.dir(&new_ptr)?.children.get(new_name).cloned() {
            match (
                entry.entry.typ == EntryType::Dir,
                target.entry.typ == EntryType::Dir,
            ) {
                (true, false) => return Err(Error::NotDir(new_name.to_string())),
                (false, true) => return Err(Error::NameExists(new_name.to_string())),
                _ => {}
            }
            self.check_removable(&head, new_name, &target).await?;
            let unrefs = self.entry_blocks(&head, &target).await?;
            for info in &unrefs {
                md.add_unref_bytes(u64::from(info.encoded_size));
            }
            replaced = (target.entry.typ != EntryType::Sym).then(|| target.ptr());
            replaced_op = Some(Op::Rm(RmOp {
                common: OpCommon {
                    unref_blocks: unrefs.iter().map(|i| i.ptr).collect(),
                    ..OpCommon::default()
                },
                dir: new_ptr,
                old_name: new_name.to_string(),
                removed: replaced,
            }));
        }

        dirs.dir_mut(&old_ptr)?.children.remove(old_name);
        let mut moved = entry.clone();
        moved.entry.ctime = now;
        dirs.dir_mut(&new_ptr)?
            .children
            .insert(new_name.to_string(), moved);

        let mut op = Op::Rename(RenameOp {
            common: OpCommon::default(),
            old_dir: old_ptr,
            old_name: old_name.to_string(),
            new_dir: (old_ptr != new_ptr).then_some(new_ptr),
            new_name: new_name.to_string(),
            renamed: (entry.entry.typ != EntryType::Sym).then(|| entry.ptr()),
            entry_type: entry.entry.typ,
        });
        let puts = dirs.write_out(self, &mut md, &mut op).await?;
        if let Some(rm) = replaced_op {
            md.add_op(rm)?;
        }
        md.add_op(op)?;
        self.finalize(md, puts).await?;

        let mut changes = vec![NodeChange::Updated(self.node(old_parent))];
        if new_parent != old_parent {
            changes.push(NodeChange::Updated(self.node(new_parent)));
        }
        if let Some(id) = replaced.and_then(|ptr| self.nodes().get(&ptr)) {
            self.drop_dirty(id);
            self.nodes().unlink(id);
            changes.push(NodeChange::Unlinked(self.node(id)));
        }
        let renamed = self.nodes().get(&entry.ptr());
        if let Some(id) = renamed {
            self.nodes().move_node(id, new_parent, new_name);
        }
        self.observers.batch_changes(&changes);
        Ok(())
    }

    /// Changes one attribute of the entry naming `id`. `apply` edits the
    /// entry and reports whether anything changed.
    async fn set_attr(
        &self,
        id: NodeId,
        attr: AttrChange,
        apply: impl FnOnce(&mut EntryInfo) -> Result<bool>,
    ) -> Result<()> {
        let _lock = self.write_lock.lock().await;
        let head = self.readable_head()?;
        let path = self.path(id)?;
        let Some((node, dirs_path)) = path.split_last() else {
            return Err(Error::NotFound(format!("node {id:?}")));
        };
        // The root has no entry to change.
        let Some(parent_ptr) = dirs_path.last().map(|p| p.ptr) else {
            return Err(Error::NotFile("/".to_string()));
        };
        let mut dirs = DirWriter::stage(self, &head, &[dirs_path]).await?;
        {
            let entry = dirs.entry_mut(&parent_ptr, &node.name)?;
            if entry.ptr() != node.ptr {
                return Err(Error::NotFound(format!("{} (stale node)", node.name)));
            }
            if !apply(&mut entry.entry)? {
                return Ok(());
            }
            entry.entry.ctime = self.ctx.now_ms();
        }

        let mut md = head.successor();
        let mut op = Op::SetAttr(SetAttrOp {
            common: OpCommon::default(),
            dir: parent_ptr,
            name: node.name.clone(),
            attr,
            file: node.ptr,
        });
        let puts = dirs.write_out(self, &mut md, &mut op).await?;
        md.add_op(op)?;
        self.finalize(md, puts).await?;
        self.observers.batch_changes(&[NodeChange::Updated(self.node(id))]);
        Ok(())
    }

    pub async fn set_ex(&self, id: NodeId, ex: bool) -> Result<()> {
        let name = self.nodes().name(id).unwrap_or_default().to_string();
        self.set_attr(id, AttrChange::Ex, |info| {
            if !info.typ.is_file() {
                return Err(Error::NotFile(name));
            }
            let typ = if ex { EntryType::Exec } else { EntryType::File };
            let changed = info.typ != typ;
            info.typ = typ;
            Ok(changed)
        })
        .await
    }

    pub async fn set_mtime(&self, id: NodeId, mtime: i64) -> Result<()> {
        self.set_attr(id, AttrChange::Mtime, |info| {
            info.mtime = mtime;
            Ok(true)
        })
        .await?;
        if let Some(df) = self.state_mut().dirty.get_mut(&id) {
            df.mtime = mtime;
        }
        Ok(())
    }
}
