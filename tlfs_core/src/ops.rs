//! The operations recorded in each metadata revision.
//!
//! Every op lists the pointer updates it caused, from the folder root down
//! to its target. Conflict resolution builds its chains from these updates,
//! so they must be complete.

use minicbor::{Decode, Encode};
use std::fmt;

use crate::{BlockPointer, EntryType};

/// A node's pointer before and after an op.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Encode, Decode)]
#[cbor(map)]
pub struct BlockUpdate {
    #[n(0)]
    pub unref: BlockPointer,
    #[n(1)]
    pub ref_ptr: BlockPointer,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Encode, Decode)]
#[cbor(map)]
pub struct OpCommon {
    #[n(0)]
    pub updates: Vec<BlockUpdate>,
    /// Newly referenced blocks.
    #[n(1)]
    pub ref_blocks: Vec<BlockPointer>,
    /// Blocks this op stopped referencing.
    #[n(2)]
    pub unref_blocks: Vec<BlockPointer>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Encode, Decode)]
#[cbor(map)]
pub struct WriteRange {
    #[n(0)]
    pub off: u64,
    /// Zero means the file was truncated to `off`.
    #[n(1)]
    pub len: u64,
}

impl WriteRange {
    pub fn is_truncate(&self) -> bool {
        self.len == 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Encode, Decode)]
#[cbor(index_only)]
pub enum AttrChange {
    #[n(0)]
    Ex,
    #[n(1)]
    Mtime,
}

#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
#[cbor(map)]
pub struct CreateOp {
    #[n(0)]
    pub common: OpCommon,
    /// Parent directory pointer before the op.
    #[n(1)]
    pub dir: BlockPointer,
    #[n(2)]
    pub new_name: String,
    #[n(3)]
    pub entry_type: EntryType,
    /// Pointer of the created entry. Symlinks have none.
    #[n(4)]
    pub created: Option<BlockPointer>,
}

#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
#[cbor(map)]
pub struct RmOp {
    #[n(0)]
    pub common: OpCommon,
    #[n(1)]
    pub dir: BlockPointer,
    #[n(2)]
    pub old_name: String,
    #[n(3)]
    pub removed: Option<BlockPointer>,
}

#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
#[cbor(map)]
pub struct RenameOp {
    #[n(0)]
    pub common: OpCommon,
    #[n(1)]
    pub old_dir: BlockPointer,
    #[n(2)]
    pub old_name: String,
    /// `None` when the entry stays in the same directory.
    #[n(3)]
    pub new_dir: Option<BlockPointer>,
    #[n(4)]
    pub new_name: String,
    #[n(5)]
    pub renamed: Option<BlockPointer>,
    #[n(6)]
    pub entry_type: EntryType,
}

#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
#[cbor(map)]
pub struct SyncOp {
    #[n(0)]
    pub common: OpCommon,
    /// File pointer before the op.
    #[n(1)]
    pub file: BlockPointer,
    #[n(2)]
    pub writes: Vec<WriteRange>,
}

#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
#[cbor(map)]
pub struct SetAttrOp {
    #[n(0)]
    pub common: OpCommon,
    #[n(1)]
    pub dir: BlockPointer,
    #[n(2)]
    pub name: String,
    #[n(3)]
    pub attr: AttrChange,
    #[n(4)]
    pub file: BlockPointer,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Encode, Decode)]
#[cbor(map)]
pub struct RekeyOp {
    #[n(0)]
    pub common: OpCommon,
}

/// Written by conflict resolution. `summary` lists the actions taken.
#[derive(Clone, Debug, Default, PartialEq, Eq, Encode, Decode)]
#[cbor(map)]
pub struct ResolutionOp {
    #[n(0)]
    pub common: OpCommon,
    #[n(1)]
    pub summary: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub enum Op {
    #[n(0)]
    Create(#[n(0)] CreateOp),
    #[n(1)]
    Rm(#[n(0)] RmOp),
    #[n(2)]
    Rename(#[n(0)] RenameOp),
    #[n(3)]
    Sync(#[n(0)] SyncOp),
    #[n(4)]
    SetAttr(#[n(0)] SetAttrOp),
    #[n(5)]
    Rekey(#[n(0)] RekeyOp),
    #[n(6)]
    Resolution(#[n(0)] ResolutionOp),
}

impl Op {
    pub fn common(&self) -> &OpCommon {
        match self {
            Op::Create(op) => &op.common,
            Op::Rm(op) => &op.common,
            Op::Rename(op) => &op.common,
            Op::Sync(op) => &op.common,
            Op::SetAttr(op) => &op.common,
            Op::Rekey(op) => &op.common,
            Op::Resolution(op) => &op.common,
        }
    }

    pub fn common_mut(&mut self) -> &mut OpCommon {
        match self {
            Op::Create(op) => &mut op.common,
            Op::Rm(op) => &mut op.common,
            Op::Rename(op) => &mut op.common,
            Op::Sync(op) => &mut op.common,
            Op::SetAttr(op) => &mut op.common,
            Op::Rekey(op) => &mut op.common,
            Op::Resolution(op) => &mut op.common,
        }
    }

    pub fn add_update(&mut self, unref: BlockPointer, ref_ptr: BlockPointer) {
        self.common_mut().updates.push(BlockUpdate { unref, ref_ptr });
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Create(op) => write!(f, "create {} ({:?})", op.new_name, op.entry_type),
            Op::Rm(op) => write!(f, "rm {}", op.old_name),
            Op::Rename(op) => write!(f, "rename {} -> {}", op.old_name, op.new_name),
            Op::Sync(op) => write!(f, "sync ({} writes)", op.writes.len()),
            Op::SetAttr(op) => write!(f, "setattr {} {:?}", op.name, op.attr),
            Op::Rekey(_) => f.write_str("rekey"),
            Op::Resolution(op) => write!(f, "resolution ({} actions)", op.summary.len()),
        }
    }
}
