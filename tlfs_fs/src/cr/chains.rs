//! What a run of revisions did, keyed by each node's pointer from before
//! the run (its origin).

use std::collections::{HashMap, HashSet};
use tlfs_core::{
    BlockPointer,
    ops::{AttrChange, Op},
};
use tlfs_md::ImmutableRootMetadata;

#[derive(Debug, Default)]
pub(crate) struct Chains {
    /// Any pointer seen in the run -> the origin it descends from.
    originals: HashMap<BlockPointer, BlockPointer>,
    created: HashSet<BlockPointer>,
    removed: HashSet<BlockPointer>,
    /// Removed origins, in op order.
    removals: Vec<BlockPointer>,
    renamed: HashSet<BlockPointer>,
    modified: HashSet<BlockPointer>,
    attrs: HashMap<BlockPointer, Vec<AttrChange>>,
    /// Symlinks have no pointer; they are tracked by (dir origin, name).
    created_syms: HashSet<(BlockPointer, String)>,
    removed_syms: Vec<(BlockPointer, String)>,
}

impl Chains {
    pub fn build(mds: &[ImmutableRootMetadata]) -> Self {
        Self::from_ops(mds.iter().flat_map(|md| md.ops()))
    }

    pub fn from_ops<'a>(ops: impl IntoIterator<Item = &'a Op>) -> Self {
        let mut chains = Chains::default();
        for op in ops {
            chains.add_op(op);
        }
        chains
    }

    fn add_op(&mut self, op: &Op) {
        // Pointers in an op predate its own updates.
        match op {
            Op::Create(cr) => match cr.created {
                Some(ptr) => {
                    self.created.insert(ptr);
                }
                None => {
                    let dir = self.original_of(&cr.dir);
                    self.created_syms.insert((dir, cr.new_name.clone()));
                }
            },
            Op::Rm(rm) => match rm.removed {
                Some(ptr) => {
                    let origin = self.original_of(&ptr);
                    if self.removed.insert(origin) {
                        self.removals.push(origin);
                    }
                }
                None => {
                    let key = (self.original_of(&rm.dir), rm.old_name.clone());
                    self.remove_sym(key);
                }
            },
            Op::Rename(rn) => match rn.renamed {
                Some(ptr) => {
                    let origin = self.original_of(&ptr);
                    self.renamed.insert(origin);
                }
                None => {
                    let old = (self.original_of(&rn.old_dir), rn.old_name.clone());
                    let new_dir = self.original_of(&rn.new_dir.unwrap_or(rn.old_dir));
                    self.remove_sym(old);
                    self.created_syms.insert((new_dir, rn.new_name.clone()));
                }
            },
            Op::Sync(sync) => {
                let origin = self.original_of(&sync.file);
                self.modified.insert(origin);
            }
            Op::SetAttr(sa) => {
                let origin = self.original_of(&sa.file);
                self.attrs.entry(origin).or_default().push(sa.attr);
            }
            Op::Rekey(_) | Op::Resolution(_) => {}
        }
        for update in &op.common().updates {
            let origin = self.original_of(&update.unref);
            self.originals.insert(update.ref_ptr, origin);
        }
    }

    fn remove_sym(&mut self, key: (BlockPointer, String)) {
        if !self.created_syms.remove(&key) {
            self.removed_syms.push(key);
        }
    }

    pub fn original_of(&self, ptr: &BlockPointer) -> BlockPointer {
        self.originals.get(ptr).copied().unwrap_or(*ptr)
    }

    pub fn is_created(&self, origin: &BlockPointer) -> bool {
        self.created.contains(origin)
    }

    pub fn is_removed(&self, origin: &BlockPointer) -> bool {
        self.removed.contains(origin)
    }

    pub fn is_renamed(&self, origin: &BlockPointer) -> bool {
        self.renamed.contains(origin)
    }

    pub fn is_modified(&self, origin: &BlockPointer) -> bool {
        self.modified.contains(origin)
    }

    pub fn attrs(&self, origin: &BlockPointer) -> &[AttrChange] {
        self.attrs.get(origin).map(Vec::as_slice).unwrap_or_default()
    }

    /// Whether the run did anything to the node itself.
    pub fn touched(&self, origin: &BlockPointer) -> bool {
        self.is_created(origin)
            || self.is_modified(origin)
            || self.is_renamed(origin)
            || !self.attrs(origin).is_empty()
    }

    pub fn removals(&self) -> &[BlockPointer] {
        &self.removals
    }

    pub fn is_created_sym(&self, dir: &BlockPointer, name: &str) -> bool {
        self.created_syms.contains(&(*dir, name.to_string()))
    }

    pub fn removed_syms(&self) -> &[(BlockPointer, String)] {
        &self.removed_syms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tlfs_core::{
        BlockContext, BlockId, EntryType, Hash, KeyGen, UserId,
        ops::{CreateOp, OpCommon, RmOp, SetAttrOp, SyncOp},
    };

    fn ptr(byte: u8) -> BlockPointer {
        BlockPointer::new(
            BlockId(Hash::from_bytes([byte; 32])),
            KeyGen::FIRST_VALID,
            BlockContext::first_ref(UserId::from_bytes([1; 16])),
        )
    }

    fn with_updates(mut op: Op, updates: &[(u8, u8)]) -> Op {
        for (old, new) in updates {
            op.add_update(ptr(*old), ptr(*new));
        }
        op
    }

    #[test]
    fn test_chains_follow_pointers_back_to_origins() {
        let ops = vec![
            with_updates(
                Op::Create(CreateOp {
                    common: OpCommon::default(),
                    dir: ptr(1),
                    new_name: "a.txt".into(),
                    entry_type: EntryType::File,
                    created: Some(ptr(5)),
                }),
                &[(1, 11)],
            ),
            with_updates(
                Op::Sync(SyncOp {
                    common: OpCommon::default(),
                    file: ptr(5),
                    writes: vec![],
                }),
                &[(11, 12), (5, 6)],
            ),
            with_updates(
                Op::SetAttr(SetAttrOp {
                    common: OpCommon::default(),
                    dir: ptr(12),
                    name: "b.txt".into(),
                    attr: AttrChange::Ex,
                    file: ptr(3),
                }),
                &[(12, 13)],
            ),
            with_updates(
                Op::Rm(RmOp {
                    common: OpCommon::default(),
                    dir: ptr(13),
                    old_name: "link".into(),
                    removed: None,
                }),
                &[(13, 14)],
            ),
        ];
        let chains = Chains::from_ops(&ops);

        assert_eq!(chains.original_of(&ptr(14)), ptr(1));
        assert_eq!(chains.original_of(&ptr(6)), ptr(5));
        assert_eq!(chains.original_of(&ptr(3)), ptr(3));
        assert!(chains.is_created(&ptr(5)));
        assert!(chains.is_modified(&ptr(5)));
        assert_eq!(chains.attrs(&ptr(3)), [AttrChange::Ex]);
        assert!(chains.touched(&ptr(3)));
        assert!(!chains.touched(&ptr(1)));
        assert_eq!(chains.removed_syms(), [(ptr(1), "link".to_string())]);
    }
}
