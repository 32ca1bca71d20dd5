//! Registry of the nodes handed out to callers.
//!
//! A node is a stable integer id for a file or directory whose block
//! pointer changes with every write. Parents are ids too, so moving or
//! unlinking a node only edits the registry.

use std::collections::HashMap;
use tlfs_core::{BlockPointer, BlockRef, Error, Result, TlfId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

/// Caller-facing handle to a file or directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Node {
    pub tlf: TlfId,
    pub id: NodeId,
}

/// One step of a path: the node's current pointer and its name in its
/// parent. The root has an empty name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathNode {
    pub ptr: BlockPointer,
    pub name: String,
}

#[derive(Debug)]
struct NodeEntry {
    ptr: BlockPointer,
    name: String,
    parent: Option<NodeId>,
    unlinked: bool,
}

#[derive(Debug, Default)]
pub struct NodeCache {
    next: u64,
    nodes: HashMap<NodeId, NodeEntry>,
    by_ref: HashMap<BlockRef, NodeId>,
}

impl NodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The node for `ptr`, registering it under `parent` if it is new.
    pub fn get_or_create(&mut self, ptr: BlockPointer, name: &str, parent: Option<NodeId>) -> NodeId {
        if let Some(id) = self.by_ref.get(&ptr.block_ref()) {
            return *id;
        }
        self.next += 1;
        let id = NodeId(self.next);
        self.nodes.insert(
            id,
            NodeEntry {
                ptr,
                name: name.to_string(),
                parent,
                unlinked: false,
            },
        );
        self.by_ref.insert(ptr.block_ref(), id);
        id
    }

    pub fn get(&self, ptr: &BlockPointer) -> Option<NodeId> {
        self.by_ref.get(&ptr.block_ref()).copied()
    }

    pub fn pointer(&self, id: NodeId) -> Option<BlockPointer> {
        self.nodes.get(&id).map(|e| e.ptr)
    }

    pub fn name(&self, id: NodeId) -> Option<&str> {
        self.nodes.get(&id).map(|e| e.name.as_str())
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.get(&id).and_then(|e| e.parent)
    }

    pub fn is_unlinked(&self, id: NodeId) -> bool {
        self.nodes.get(&id).is_none_or(|e| e.unlinked)
    }

    /// Live children of `id`.
    pub fn children(&self, id: NodeId) -> Vec<NodeId> {
        let mut out: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|(_, e)| !e.unlinked && e.parent == Some(id))
            .map(|(child, _)| *child)
            .collect();
        out.sort();
        out
    }

    /// Re-points the node holding `old` at `new`.
    pub fn update_pointer(&mut self, old: &BlockPointer, new: BlockPointer) -> Option<NodeId> {
        let id = self.by_ref.remove(&old.block_ref())?;
        if let Some(entry) = self.nodes.get_mut(&id) {
            entry.ptr = new;
        }
        self.by_ref.insert(new.block_ref(), id);
        Some(id)
    }

    /// Sets the pointers of several nodes at once, so a pointer handed from
    /// one node to another in the same batch lands on the right node.
    pub fn reassign(&mut self, moves: &[(NodeId, BlockPointer)]) {
        for (id, _) in moves {
            if let Some(entry) = self.nodes.get(id)
                && self.by_ref.get(&entry.ptr.block_ref()) == Some(id)
            {
                self.by_ref.remove(&entry.ptr.block_ref());
            }
        }
        for (id, ptr) in moves {
            if let Some(entry) = self.nodes.get_mut(id) {
                entry.ptr = *ptr;
                if !entry.unlinked {
                    self.by_ref.insert(ptr.block_ref(), *id);
                }
            }
        }
    }

    /// Applies old -> new pointer updates and returns the nodes touched.
    pub fn repoint(&mut self, updates: &[(BlockPointer, BlockPointer)]) -> Vec<NodeId> {
        let moves: Vec<(NodeId, BlockPointer)> = updates
            .iter()
            .filter_map(|(old, new)| self.get(old).map(|id| (id, *new)))
            .collect();
        self.reassign(&moves);
        moves.into_iter().map(|(id, _)| id).collect()
    }

    pub fn move_node(&mut self, id: NodeId, new_parent: NodeId, name: &str) {
        if let Some(entry) = self.nodes.get_mut(&id) {
            entry.parent = Some(new_parent);
            entry.name = name.to_string();
        }
    }

    /// Detaches `id` from the tree. The id stays valid, but has no path.
    pub fn unlink(&mut self, id: NodeId) {
        if let Some(entry) = self.nodes.get_mut(&id) {
            entry.unlinked = true;
            entry.parent = None;
            self.by_ref.remove(&entry.ptr.block_ref());
        }
    }

    /// Drops `id` from the registry altogether.
    pub fn forget(&mut self, id: NodeId) {
        if let Some(entry) = self.nodes.remove(&id)
            && self.by_ref.get(&entry.ptr.block_ref()) == Some(&id)
        {
            self.by_ref.remove(&entry.ptr.block_ref());
        }
    }

    /// The path from the root to `id`, root first.
    pub fn path_from_node(&self, id: NodeId) -> Result<Vec<PathNode>> {
        let mut path = Vec::new();
        let mut cur = Some(id);
        while let Some(node) = cur {
            let entry = self
                .nodes
                .get(&node)
                .filter(|e| !e.unlinked)
                .ok_or_else(|| Error::NotFound(format!("node {node:?}")))?;
            path.push(PathNode {
                ptr: entry.ptr,
                name: entry.name.clone(),
            });
            cur = entry.parent;
            if path.len() > self.nodes.len() {
                return Err(Error::Integrity(format!("node {id:?} is in a parent cycle")));
            }
        }
        path.reverse();
        Ok(path)
    }
}
