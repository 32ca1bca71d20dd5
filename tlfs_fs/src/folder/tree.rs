use tlfs_core::{
    Block, BlockContext, BlockInfo, BlockPointer, DirBlock, DirEntry, EntryType, Error,
    ReadyBlock, Result,
    ops::{BlockUpdate, Op},
};
use tlfs_md::{ImmutableRootMetadata, RootMetadata};

use super::FolderBranchOps;
use crate::PathNode;

/// A readied block waiting to be put, with its plaintext for the cache.
#[derive(Clone, Debug)]
pub(crate) struct PutBlock {
    pub ptr: BlockPointer,
    pub ready: ReadyBlock,
    pub block: Block,
}

#[derive(Debug)]
struct StagedDir {
    ptr: BlockPointer,
    parent: Option<usize>,
    name: String,
    depth: usize,
    block: DirBlock,
    encoded_size: u32,
}

/// The directories one mutation touches, from the root down, staged so
/// they can be edited and then written out deepest first.
#[derive(Debug, Default)]
pub(crate) struct DirWriter {
    dirs: Vec<StagedDir>,
}

fn stale(name: &str) -> Error {
    Error::NotFound(format!("{name} (stale node)"))
}

impl DirWriter {
    /// Loads every directory on `paths`. Each step must still match the
    /// head: a node whose pointer moved on is reported as not found.
    pub async fn stage(
        folder: &FolderBranchOps,
        md: &ImmutableRootMetadata,
        paths: &[&[PathNode]],
    ) -> Result<Self> {
        let root = md.root_entry()?.clone();
        let mut writer = DirWriter::default();
        for path in paths {
            let mut parent: Option<usize> = None;
            for (depth, node) in path.iter().enumerate() {
                if let Some(i) = writer.index_of(&node.ptr) {
                    parent = Some(i);
                    continue;
                }
                let encoded_size = match parent {
                    None if node.ptr == root.ptr() => root.info.encoded_size,
                    None => return Err(stale(&node.name)),
                    Some(p) => {
                        let entry = writer.dirs[p]
                            .block
                            .children
                            .get(&node.name)
                            .filter(|e| e.ptr() == node.ptr)
                            .ok_or_else(|| stale(&node.name))?;
                        if entry.entry.typ != EntryType::Dir {
                            return Err(Error::NotDir(node.name.clone()));
                        }
                        entry.info.encoded_size
                    }
                };
                let block = folder.get_dir(md, &node.ptr).await?;
                writer.dirs.push(StagedDir {
                    ptr: node.ptr,
                    parent,
                    name: node.name.clone(),
                    depth,
                    block,
                    encoded_size,
                });
                parent = Some(writer.dirs.len() - 1);
            }
        }
        Ok(writer)
    }

    fn index_of(&self, ptr: &BlockPointer) -> Option<usize> {
        self.dirs.iter().position(|d| d.ptr == *ptr)
    }

    pub fn dir(&self, ptr: &BlockPointer) -> Result<&DirBlock> {
        self.index_of(ptr)
            .map(|i| &self.dirs[i].block)
            .ok_or_else(|| Error::Integrity(format!("directory {} was not staged", ptr.id)))
    }

    pub fn dir_mut(&mut self, ptr: &BlockPointer) -> Result<&mut DirBlock> {
        let i = self
            .index_of(ptr)
            .ok_or_else(|| Error::Integrity(format!("directory {} was not staged", ptr.id)))?;
        Ok(&mut self.dirs[i].block)
    }

    /// The entry called `name` in staged directory `dir`.
    pub fn entry(&self, dir: &BlockPointer, name: &str) -> Result<&DirEntry> {
        self.dir(dir)?
            .children
            .get(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    pub fn entry_mut(&mut self, dir: &BlockPointer, name: &str) -> Result<&mut DirEntry> {
        self.dir_mut(dir)?
            .children
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    /// Readies every staged directory deepest first, links each into its
    /// parent (the root into `md`) and records the pointer updates on `op`,
    /// root first.
    pub async fn write_out(
        mut self,
        folder: &FolderBranchOps,
        md: &mut RootMetadata,
        op: &mut Op,
    ) -> Result<Vec<PutBlock>> {
        let uid = folder.ctx.current_uid().await?;
        let now = folder.ctx.now_ms();
        let key_gen = md.bare.latest_key_gen();

        let mut order: Vec<usize> = (0..self.dirs.len()).collect();
        order.sort_by_key(|i| std::cmp::Reverse(self.dirs[*i].depth));

        let mut updates: Vec<(usize, BlockUpdate)> = Vec::with_capacity(order.len());
        let mut puts = Vec::with_capacity(order.len());
        for i in order {
            let block = Block::Dir(self.dirs[i].block.clone());
            let ready = folder.ctx.blocks.ready(&md.bare, &block).await?;
            let ptr = BlockPointer::new(ready.id, key_gen, BlockContext::first_ref(uid));
            let info = BlockInfo {
                ptr,
                encoded_size: ready.encoded_size(),
            };

            let (old, old_size, depth, parent) = {
                let d = &self.dirs[i];
                (d.ptr, d.encoded_size, d.depth, d.parent)
            };
            let entry = match parent {
                Some(p) => {
                    let name = self.dirs[i].name.clone();
                    self.dirs[p]
                        .block
                        .children
                        .get_mut(&name)
                        .ok_or_else(|| stale(&name))?
                }
                None => &mut md.data_mut()?.dir,
            };
            touch(entry, info, now);

            md.add_ref_bytes(u64::from(info.encoded_size));
            md.add_unref_bytes(u64::from(old_size));
            let common = op.common_mut();
            common.ref_blocks.push(ptr);
            common.unref_blocks.push(old);
            updates.push((
                depth,
                BlockUpdate {
                    unref: old,
                    ref_ptr: ptr,
                },
            ));
            puts.push(PutBlock { ptr, ready, block });
        }

        updates.sort_by_key(|(depth, _)| *depth);
        op.common_mut()
            .updates
            .extend(updates.into_iter().map(|(_, u)| u));
        Ok(puts)
    }
}

/// Points a directory entry at a rewritten block.
pub(crate) fn touch(entry: &mut DirEntry, info: BlockInfo, now: i64) {
    entry.info = info;
    entry.entry.size = u64::from(info.encoded_size);
    entry.entry.mtime = now;
    entry.entry.ctime = now;
}
