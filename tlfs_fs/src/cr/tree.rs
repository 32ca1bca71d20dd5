//! An editable, in-memory copy of a folder tree used while resolving.

use std::collections::{BTreeMap, HashMap, VecDeque};
use tlfs_core::{BlockPointer, DirEntry, EntryType, Result};
use tlfs_md::RootMetadata;

use super::Chains;
use crate::folder::FolderBranchOps;

#[derive(Clone, Debug)]
pub(crate) struct CrNode {
    pub name: String,
    pub parent: Option<usize>,
    pub entry: DirEntry,
    pub children: BTreeMap<String, usize>,
    /// Pointer before the branch point. Symlinks have none.
    pub origin: Option<BlockPointer>,
    /// Pointer and size as loaded, before any edit.
    pub base_ptr: BlockPointer,
    pub base_encoded: u32,
    /// Loaded from the tree rather than inserted while resolving.
    pub from_merged: bool,
    /// Needs its directory block rewritten.
    pub dirty: bool,
    pub detached: bool,
}

impl CrNode {
    pub fn is_dir(&self) -> bool {
        self.entry.entry.typ == EntryType::Dir
    }

    /// The pointer ops recorded during resolution refer to: the loaded one
    /// for nodes that existed, the final one for inserted nodes.
    pub fn pre_ptr(&self) -> BlockPointer {
        if self.from_merged {
            self.base_ptr
        } else {
            self.entry.ptr()
        }
    }
}

#[derive(Debug)]
pub(crate) struct CrTree {
    pub nodes: Vec<CrNode>,
    by_origin: HashMap<BlockPointer, usize>,
}

impl CrTree {
    pub const ROOT: usize = 0;

    /// Loads the whole tree of `md`, tagging each node with its origin
    /// under `chains`.
    pub async fn load(folder: &FolderBranchOps, md: &RootMetadata, chains: &Chains) -> Result<Self> {
        let root = md.root_entry()?.clone();
        let mut tree = CrTree {
            nodes: Vec::new(),
            by_origin: HashMap::new(),
        };
        let origin = Some(chains.original_of(&root.ptr()));
        tree.push(String::new(), None, root, origin, true);
        let mut queue = VecDeque::from([Self::ROOT]);
        while let Some(idx) = queue.pop_front() {
            if !tree.nodes[idx].is_dir() {
                continue;
            }
            let ptr = tree.nodes[idx].entry.ptr();
            let dir = folder.get_dir(md, &ptr).await?;
            for (name, entry) in dir.children {
                let origin =
                    (entry.entry.typ != EntryType::Sym).then(|| chains.original_of(&entry.ptr()));
                let child = tree.push(name.clone(), Some(idx), entry, origin, true);
                tree.nodes[idx].children.insert(name, child);
                queue.push_back(child);
            }
        }
        Ok(tree)
    }

    #[cfg(test)]
    pub fn new_for_test(root: DirEntry) -> Self {
        let mut tree = CrTree {
            nodes: Vec::new(),
            by_origin: HashMap::new(),
        };
        tree.push(String::new(), None, root, None, true);
        tree
    }

    fn push(
        &mut self,
        name: String,
        parent: Option<usize>,
        entry: DirEntry,
        origin: Option<BlockPointer>,
        from_merged: bool,
    ) -> usize {
        let idx = self.nodes.len();
        if let Some(origin) = origin {
            self.by_origin.insert(origin, idx);
        }
        self.nodes.push(CrNode {
            name,
            parent,
            base_ptr: entry.ptr(),
            base_encoded: entry.info.encoded_size,
            dirty: !from_merged && entry.entry.typ == EntryType::Dir,
            entry,
            children: BTreeMap::new(),
            origin,
            from_merged,
            detached: false,
        });
        idx
    }

    pub fn is_attached(&self, mut idx: usize) -> bool {
        loop {
            let node = &self.nodes[idx];
            if node.detached {
                return false;
            }
            match node.parent {
                Some(p) => idx = p,
                None => return idx == Self::ROOT,
            }
        }
    }

    /// The attached node descending from `origin`.
    pub fn find(&self, origin: &BlockPointer) -> Option<usize> {
        self.by_origin
            .get(origin)
            .copied()
            .filter(|idx| self.is_attached(*idx))
    }

    pub fn child(&self, parent: usize, name: &str) -> Option<usize> {
        self.nodes[parent].children.get(name).copied()
    }

    /// Adds a new node under `parent`. New directories are always
    /// rewritten.
    pub fn insert(
        &mut self,
        parent: usize,
        name: &str,
        entry: DirEntry,
        origin: Option<BlockPointer>,
    ) -> usize {
        let idx = self.push(name.to_string(), Some(parent), entry, origin, false);
        self.nodes[parent].children.insert(name.to_string(), idx);
        self.nodes[parent].dirty = true;
        idx
    }

    pub fn detach(&mut self, idx: usize) {
        if let Some(parent) = self.nodes[idx].parent.take() {
            let name = self.nodes[idx].name.clone();
            if self.nodes[parent].children.get(&name) == Some(&idx) {
                self.nodes[parent].children.remove(&name);
            }
            self.nodes[parent].dirty = true;
        }
        self.nodes[idx].detached = true;
    }

    pub fn attach(&mut self, idx: usize, parent: usize, name: &str) {
        let node = &mut self.nodes[idx];
        node.parent = Some(parent);
        node.name = name.to_string();
        node.detached = false;
        self.nodes[parent].children.insert(name.to_string(), idx);
        self.nodes[parent].dirty = true;
    }

    /// Whether `a` is `b` or one of its ancestors.
    pub fn is_ancestor(&self, a: usize, b: usize) -> bool {
        let mut cur = Some(b);
        while let Some(idx) = cur {
            if idx == a {
                return true;
            }
            cur = self.nodes[idx].parent;
        }
        false
    }

    pub fn depth(&self, mut idx: usize) -> usize {
        let mut depth = 0;
        while let Some(p) = self.nodes[idx].parent {
            depth += 1;
            idx = p;
        }
        depth
    }

    /// Attached nodes in breadth-first order from the root.
    pub fn bfs(&self) -> Vec<usize> {
        let mut out = vec![Self::ROOT];
        let mut i = 0;
        while i < out.len() {
            out.extend(self.nodes[out[i]].children.values().copied());
            i += 1;
        }
        out
    }

    /// Marks every ancestor of a dirty node dirty too.
    pub fn propagate_dirty(&mut self) {
        for idx in 0..self.nodes.len() {
            if !self.nodes[idx].dirty || !self.is_attached(idx) {
                continue;
            }
            let mut cur = self.nodes[idx].parent;
            while let Some(p) = cur {
                self.nodes[p].dirty = true;
                cur = self.nodes[p].parent;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tlfs_core::{BlockContext, BlockId, BlockInfo, EntryInfo, Hash, KeyGen, UserId};

    fn entry(byte: u8, typ: EntryType) -> DirEntry {
        DirEntry {
            info: BlockInfo {
                ptr: BlockPointer::new(
                    BlockId(Hash::from_bytes([byte; 32])),
                    KeyGen::FIRST_VALID,
                    BlockContext::first_ref(UserId::from_bytes([1; 16])),
                ),
                encoded_size: 100,
            },
            entry: EntryInfo {
                typ,
                size: 0,
                sym_path: None,
                mtime: 0,
                ctime: 0,
            },
        }
    }

    fn tree() -> CrTree {
        CrTree::new_for_test(entry(1, EntryType::Dir))
    }

    #[test]
    fn test_moves_and_dirty_propagation() {
        let mut t = tree();
        let docs = t.insert(CrTree::ROOT, "docs", entry(2, EntryType::Dir), Some(entry(2, EntryType::Dir).ptr()));
        let sub = t.insert(docs, "sub", entry(3, EntryType::Dir), None);
        let file = t.insert(sub, "a.txt", entry(4, EntryType::File), Some(entry(4, EntryType::File).ptr()));
        for node in &mut t.nodes {
            node.dirty = false;
        }

        assert_eq!(t.find(&entry(4, EntryType::File).ptr()), Some(file));
        assert!(t.is_ancestor(docs, file));
        assert_eq!(t.depth(file), 3);

        t.detach(file);
        assert_eq!(t.find(&entry(4, EntryType::File).ptr()), None);
        assert!(t.nodes[sub].dirty);
        t.attach(file, CrTree::ROOT, "b.txt");
        assert_eq!(t.child(CrTree::ROOT, "b.txt"), Some(file));
        assert_eq!(t.bfs(), vec![CrTree::ROOT, file, docs, sub]);

        t.propagate_dirty();
        assert!(t.nodes[docs].dirty);
        assert!(!t.nodes[file].dirty);
    }
}
