use futures::future::try_join_all;
use std::collections::BTreeMap;
use tlfs_core::{
    Block, BlockPointer, DirBlock, DirEntry, EntryInfo, EntryType, Error, FileBlock, Result,
    UserId,
};
use tlfs_md::{ImmutableRootMetadata, RootMetadata};

use super::FolderBranchOps;
use crate::{Node, NodeId};

/// Where a node's data lives and who last changed its folder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeMetadata {
    pub ptr: BlockPointer,
    pub last_writer: UserId,
    pub entry: EntryInfo,
}

impl FolderBranchOps {
    /// The block at `ptr`, preferring this branch's unsynced version.
    pub(crate) async fn get_block(
        &self,
        md: &RootMetadata,
        ptr: &BlockPointer,
        branch: &str,
    ) -> Result<Block> {
        if let Some(block) = self.ctx.dirty.get(self.tlf, ptr, branch) {
            return Ok(block);
        }
        self.ctx.blocks.get(&md.bare, ptr).await
    }

    pub(crate) async fn get_dir(&self, md: &RootMetadata, ptr: &BlockPointer) -> Result<DirBlock> {
        match self.ctx.blocks.get(&md.bare, ptr).await? {
            Block::Dir(dir) => Ok(dir),
            Block::File(_) => Err(Error::NotDir(ptr.id.to_string())),
        }
    }

    pub(crate) async fn get_file(
        &self,
        md: &RootMetadata,
        ptr: &BlockPointer,
        branch: &str,
    ) -> Result<FileBlock> {
        match self.get_block(md, ptr, branch).await? {
            Block::File(file) => Ok(file),
            Block::Dir(_) => Err(Error::NotFile(ptr.id.to_string())),
        }
    }

    /// The directory entry naming `id`; the root's entry lives in the
    /// revision itself.
    pub(crate) async fn entry_of(&self, id: NodeId) -> Result<(ImmutableRootMetadata, DirEntry)> {
        let head = self.readable_head()?;
        let path = self.path(id)?;
        let entry = match path.as_slice() {
            [] => return Err(Error::NotFound(format!("node {id:?}"))),
            [root] => {
                let entry = head.root_entry()?;
                if entry.ptr() != root.ptr {
                    return Err(Error::NotFound(format!("node {id:?} (stale)")));
                }
                entry.clone()
            }
            [.., parent, node] => self
                .get_dir(&head, &parent.ptr)
                .await?
                .children
                .remove(&node.name)
                .filter(|e| e.ptr() == node.ptr)
                .ok_or_else(|| Error::NotFound(node.name.clone()))?,
        };
        Ok((head, entry))
    }

    /// Overlays unsynced size and mtime onto a synced entry.
    fn with_dirty(&self, id: Option<NodeId>, mut info: EntryInfo) -> EntryInfo {
        if let Some(df) = id.and_then(|id| self.state().dirty.get(&id).cloned()) {
            info.size = df.size;
            info.mtime = df.mtime;
        }
        info
    }

    pub async fn get_dir_children(&self, id: NodeId) -> Result<BTreeMap<String, EntryInfo>> {
        let head = self.readable_head()?;
        let ptr = self.dir_ptr(id)?;
        let dir = self.get_dir(&head, &ptr).await?;
        Ok(dir
            .children
            .into_iter()
            .map(|(name, entry)| {
                let node = self.nodes().get(&entry.ptr());
                (name, self.with_dirty(node, entry.entry))
            })
            .collect())
    }

    fn dir_ptr(&self, id: NodeId) -> Result<BlockPointer> {
        let nodes = self.nodes();
        if nodes.is_unlinked(id) {
            return Err(Error::NotFound(format!("node {id:?}")));
        }
        nodes
            .pointer(id)
            .ok_or_else(|| Error::NotFound(format!("node {id:?}")))
    }

    /// Looks up `name` in directory `parent`. Symlinks have no node.
    pub async fn lookup(&self, parent: NodeId, name: &str) -> Result<(Option<Node>, EntryInfo)> {
        let head = self.readable_head()?;
        let ptr = self.dir_ptr(parent)?;
        let entry = self
            .get_dir(&head, &ptr)
            .await?
            .children
            .remove(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        if entry.entry.typ == EntryType::Sym {
            return Ok((None, entry.entry));
        }
        let id = self.nodes().get_or_create(entry.ptr(), name, Some(parent));
        Ok((Some(self.node(id)), self.with_dirty(Some(id), entry.entry)))
    }

    pub async fn stat(&self, id: NodeId) -> Result<EntryInfo> {
        let (_, entry) = self.entry_of(id).await?;
        Ok(self.with_dirty(Some(id), entry.entry))
    }

    pub async fn get_node_metadata(&self, id: NodeId) -> Result<NodeMetadata> {
        let (head, entry) = self.entry_of(id).await?;
        Ok(NodeMetadata {
            ptr: entry.ptr(),
            last_writer: head.bare.last_modifying_user,
            entry: self.with_dirty(Some(id), entry.entry),
        })
    }

    /// Up to `len` bytes from `off`. Reads past the end come back short.
    pub async fn read(&self, id: NodeId, off: u64, len: u64) -> Result<Vec<u8>> {
        let (head, entry) = self.entry_of(id).await?;
        if !entry.entry.typ.is_file() {
            return Err(Error::NotFile(
                self.nodes().name(id).unwrap_or_default().to_string(),
            ));
        }
        let branch = self.branch_name();
        let (ptr, size) = match self.state().dirty.get(&id) {
            Some(df) => (df.ptr, df.size),
            None => (entry.ptr(), entry.entry.size),
        };
        if off >= size || len == 0 {
            return Ok(Vec::new());
        }
        let end = size.min(off.saturating_add(len));
        let mut out = vec![0u8; (end - off) as usize];

        let top = self.get_file(&head, &ptr, &branch).await?;
        if !top.is_ind {
            copy_overlap(&mut out, off, end, 0, &top.contents);
            return Ok(out);
        }
        // A child runs up to the next child's offset, the last one to `size`.
        let wanted = top.iptrs.iter().enumerate().filter(|(i, iptr)| {
            let child_end = top.iptrs.get(i + 1).map_or(size, |next| next.off);
            iptr.off < end && child_end > off
        });
        let children = try_join_all(wanted.map(|(_, iptr)| {
            let (head, branch) = (&head, &branch);
            async move {
                let child = self.get_file(head, &iptr.info.ptr, branch).await?;
                Ok::<_, Error>((iptr.off, child))
            }
        }))
        .await?;
        for (start, child) in &children {
            copy_overlap(&mut out, off, end, *start, &child.contents);
        }
        Ok(out)
    }
}

/// Copies the part of `data` (which starts at file offset `start`) that
/// falls inside `off..end` into `out`.
fn copy_overlap(out: &mut [u8], off: u64, end: u64, start: u64, data: &[u8]) {
    let from = off.max(start);
    let to = end.min(start + data.len() as u64);
    if from >= to {
        return;
    }
    out[(from - off) as usize..(to - off) as usize]
        .copy_from_slice(&data[(from - start) as usize..(to - start) as usize]);
}
