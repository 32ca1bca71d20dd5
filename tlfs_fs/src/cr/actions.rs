use std::fmt;
use tlfs_core::{
    BlockPointer, DirEntry, EntryInfo, EntryType,
    ops::{AttrChange, CreateOp, Op, OpCommon, RenameOp, RmOp, SetAttrOp, SyncOp, WriteRange},
};

use super::tree::CrTree;

/// One step of a resolution, planned against the merged tree. Indices
/// refer to nodes of that tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum CrAction {
    /// Adds an entry the unmerged branch created, or brings back one the
    /// merged branch removed while it was changed here (`restored`).
    CopyUnmergedEntry {
        parent: usize,
        name: String,
        entry: DirEntry,
        origin: Option<BlockPointer>,
        restored: bool,
    },
    /// Adds an unmerged entry under a conflict name since `name` is taken.
    RenameUnmergedEntry {
        parent: usize,
        name: String,
        conflict_name: String,
        entry: DirEntry,
        origin: Option<BlockPointer>,
    },
    /// Both branches created a directory called the same; their contents
    /// merge into the merged one.
    MergeDirs { target: usize },
    /// Both branches wrote the file. The unmerged version becomes a copy
    /// under a conflict name next to it.
    RenameUnmergedFile {
        parent: usize,
        name: String,
        conflict_name: String,
        entry: DirEntry,
    },
    /// The unmerged branch removed what the merged branch changed.
    KeepModified { target: usize },
    /// New contents written only on the unmerged branch.
    ReplaceEntry { target: usize, entry: DirEntry },
    /// A rename done only on the unmerged branch.
    MoveEntry {
        target: usize,
        from_parent: usize,
        from_name: String,
        parent: usize,
        name: String,
    },
    RemoveEntry {
        target: usize,
        parent: usize,
        name: String,
    },
    SetAttr {
        target: usize,
        attr: AttrChange,
        info: EntryInfo,
    },
}

impl CrAction {
    /// Applies the action to `tree`; returns the node it produced or
    /// changed.
    pub fn apply(&self, tree: &mut CrTree) -> usize {
        match self {
            CrAction::CopyUnmergedEntry {
                parent,
                name,
                entry,
                origin,
                ..
            } => tree.insert(*parent, name, entry.clone(), *origin),
            CrAction::RenameUnmergedEntry {
                parent,
                conflict_name,
                entry,
                origin,
                ..
            } => tree.insert(*parent, conflict_name, entry.clone(), *origin),
            CrAction::RenameUnmergedFile {
                parent,
                conflict_name,
                entry,
                ..
            } => tree.insert(*parent, conflict_name, entry.clone(), Some(entry.ptr())),
            CrAction::MergeDirs { target } | CrAction::KeepModified { target } => *target,
            CrAction::ReplaceEntry { target, entry } => {
                let node = &mut tree.nodes[*target];
                node.entry.info = entry.info;
                node.entry.entry.size = entry.entry.size;
                node.entry.entry.mtime = entry.entry.mtime;
                node.entry.entry.ctime = entry.entry.ctime;
                if let Some(parent) = node.parent {
                    tree.nodes[parent].dirty = true;
                }
                *target
            }
            CrAction::MoveEntry {
                target,
                parent,
                name,
                ..
            } => {
                tree.detach(*target);
                tree.attach(*target, *parent, name);
                *target
            }
            CrAction::RemoveEntry { target, .. } => {
                tree.detach(*target);
                *target
            }
            CrAction::SetAttr { target, attr, info } => {
                let node = &mut tree.nodes[*target];
                match attr {
                    AttrChange::Ex => node.entry.entry.typ = info.typ,
                    AttrChange::Mtime => node.entry.entry.mtime = info.mtime,
                }
                node.entry.entry.ctime = node.entry.entry.ctime.max(info.ctime);
                if let Some(parent) = node.parent {
                    tree.nodes[parent].dirty = true;
                }
                *target
            }
        }
    }

    /// The op recording this action for other devices, built once the
    /// tree is written out. `node` is what [`Self::apply`] returned.
    pub fn to_op(&self, tree: &CrTree, node: usize) -> Option<Op> {
        let n = &tree.nodes[node];
        let pre = |idx: usize| tree.nodes[idx].pre_ptr();
        let has_ptr = n.entry.entry.typ != EntryType::Sym;
        let op = match self {
            CrAction::CopyUnmergedEntry { parent, .. }
            | CrAction::RenameUnmergedEntry { parent, .. }
            | CrAction::RenameUnmergedFile { parent, .. } => Op::Create(CreateOp {
                common: OpCommon::default(),
                dir: pre(*parent),
                new_name: n.name.clone(),
                entry_type: n.entry.entry.typ,
                created: has_ptr.then(|| n.entry.ptr()),
            }),
            CrAction::MergeDirs { .. } | CrAction::KeepModified { .. } => return None,
            CrAction::ReplaceEntry { entry, .. } => Op::Sync(SyncOp {
                common: OpCommon::default(),
                file: n.base_ptr,
                writes: vec![WriteRange {
                    off: 0,
                    len: entry.entry.size,
                }],
            }),
            CrAction::MoveEntry {
                from_parent,
                from_name,
                parent,
                name,
                ..
            } => Op::Rename(RenameOp {
                common: OpCommon::default(),
                old_dir: pre(*from_parent),
                old_name: from_name.clone(),
                new_dir: (from_parent != parent).then(|| pre(*parent)),
                new_name: name.clone(),
                renamed: has_ptr.then_some(n.base_ptr),
                entry_type: n.entry.entry.typ,
            }),
            CrAction::RemoveEntry { parent, name, .. } => Op::Rm(RmOp {
                common: OpCommon::default(),
                dir: pre(*parent),
                old_name: name.clone(),
                removed: has_ptr.then_some(n.base_ptr),
            }),
            CrAction::SetAttr { attr, .. } => Op::SetAttr(SetAttrOp {
                common: OpCommon::default(),
                dir: pre(n.parent?),
                name: n.name.clone(),
                attr: *attr,
                file: n.base_ptr,
            }),
        };
        Some(op)
    }
}

/// Summary text; the resolution op prefixes it with the entry's name.
impl fmt::Display for CrAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CrAction::CopyUnmergedEntry {
                restored: false, ..
            } => f.write_str("copied from unmerged branch"),
            CrAction::CopyUnmergedEntry { .. } => f.write_str("restored"),
            CrAction::RenameUnmergedEntry { name, .. } => write!(f, "renamed from {name}"),
            CrAction::MergeDirs { .. } => f.write_str("merged directories"),
            CrAction::RenameUnmergedFile { name, .. } => write!(f, "unmerged copy of {name}"),
            CrAction::KeepModified { .. } => f.write_str("kept; changed on merged branch"),
            CrAction::ReplaceEntry { .. } => f.write_str("replaced contents"),
            CrAction::MoveEntry { from_name, .. } => write!(f, "moved from {from_name}"),
            CrAction::RemoveEntry { .. } => f.write_str("removed"),
            CrAction::SetAttr { attr, .. } => write!(f, "set {attr:?}"),
        }
    }
}
