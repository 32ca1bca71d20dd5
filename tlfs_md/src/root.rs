use std::{ops::Deref, sync::Arc};
use tlfs_core::{
    BranchId, DirEntry, Error, MdId, MetadataRevision, Result, TlfId,
    md::{BareRootMetadata, BlockChanges, PrivateMetadata, flags},
    ops::Op,
};

/// A revision with its private data decrypted.
///
/// The private data is missing when this device holds no key for the
/// revision yet, e.g. a new device waiting for a rekey.
#[derive(Clone, Debug, PartialEq)]
pub struct RootMetadata {
    pub bare: BareRootMetadata,
    data: Option<PrivateMetadata>,
}

impl RootMetadata {
    pub fn new(bare: BareRootMetadata, data: PrivateMetadata) -> Self {
        Self {
            bare,
            data: Some(data),
        }
    }

    pub(crate) fn unreadable(bare: BareRootMetadata) -> Self {
        Self { bare, data: None }
    }

    pub fn tlf_id(&self) -> TlfId {
        self.bare.tlf_id
    }

    pub fn revision(&self) -> MetadataRevision {
        self.bare.revision
    }

    pub fn branch_id(&self) -> BranchId {
        self.bare.branch_id
    }

    pub fn is_readable(&self) -> bool {
        self.data.is_some()
    }

    fn no_key(&self) -> Error {
        Error::NoKey {
            tlf: self.bare.tlf_id,
            key_gen: self.bare.latest_key_gen(),
        }
    }

    pub fn data(&self) -> Result<&PrivateMetadata> {
        self.data.as_ref().ok_or_else(|| self.no_key())
    }

    pub fn data_mut(&mut self) -> Result<&mut PrivateMetadata> {
        match self.data {
            Some(ref mut data) => Ok(data),
            None => Err(self.no_key()),
        }
    }

    pub fn set_data(&mut self, data: PrivateMetadata) {
        self.data = Some(data);
    }

    pub fn root_entry(&self) -> Result<&DirEntry> {
        Ok(&self.data()?.dir)
    }

    /// Ops of this revision; empty when unreadable.
    pub fn ops(&self) -> &[Op] {
        self.data
            .as_ref()
            .map(|d| d.changes.ops.as_slice())
            .unwrap_or_default()
    }

    pub fn add_op(&mut self, op: Op) -> Result<()> {
        self.data_mut()?.changes.ops.push(op);
        Ok(())
    }

    pub fn add_ref_bytes(&mut self, bytes: u64) {
        self.bare.ref_bytes += bytes;
        self.bare.disk_usage += bytes;
    }

    pub fn add_unref_bytes(&mut self, bytes: u64) {
        self.bare.unref_bytes += bytes;
        self.bare.disk_usage = self.bare.disk_usage.saturating_sub(bytes);
    }

    /// The next revision on the same branch, with an empty op list.
    pub fn make_successor(&self, prev_root: MdId) -> RootMetadata {
        let mut bare = self.bare.clone();
        bare.revision = bare.revision.next();
        bare.prev_root = prev_root;
        bare.ref_bytes = 0;
        bare.unref_bytes = 0;
        bare.timestamp = 0;
        bare.set_flag(flags::FINALIZED, false);
        let data = self.data.as_ref().map(|d| PrivateMetadata {
            dir: d.dir.clone(),
            changes: BlockChanges::default(),
        });
        RootMetadata { bare, data }
    }
}

/// A signed, stored revision. Cheap to clone.
#[derive(Clone, Debug)]
pub struct ImmutableRootMetadata {
    md: Arc<RootMetadata>,
    md_id: MdId,
}

impl ImmutableRootMetadata {
    pub fn new(md: RootMetadata, md_id: MdId) -> Self {
        Self {
            md: Arc::new(md),
            md_id,
        }
    }

    pub fn md_id(&self) -> MdId {
        self.md_id
    }

    pub fn successor(&self) -> RootMetadata {
        self.md.make_successor(self.md_id)
    }
}

impl Deref for ImmutableRootMetadata {
    type Target = RootMetadata;

    fn deref(&self) -> &RootMetadata {
        &self.md
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tlfs_core::{
        BlockContext, BlockId, BlockInfo, BlockPointer, EntryInfo, EntryType, Hash, KeyGen,
        MetadataVer, UserId,
        md::BareTlfHandle,
        ops::RekeyOp,
    };

    fn root() -> RootMetadata {
        let uid = UserId::from_bytes([1; 16]);
        let bare = BareRootMetadata::new(
            TlfId::from_bytes([2; 16], false),
            BareTlfHandle::new(vec![uid], vec![]),
            MetadataVer::V2,
        );
        let dir = DirEntry {
            info: BlockInfo {
                ptr: BlockPointer::new(
                    BlockId(Hash::from_bytes([3; 32])),
                    KeyGen::FIRST_VALID,
                    BlockContext::first_ref(uid),
                ),
                encoded_size: 300,
            },
            entry: EntryInfo {
                typ: EntryType::Dir,
                size: 300,
                sym_path: None,
                mtime: 0,
                ctime: 0,
            },
        };
        RootMetadata::new(
            bare,
            PrivateMetadata {
                dir,
                changes: BlockChanges::default(),
            },
        )
    }

    #[test]
    fn test_successor_clears_per_revision_state() {
        let mut md = root();
        md.add_op(Op::Rekey(RekeyOp::default())).unwrap();
        md.add_ref_bytes(500);
        md.add_unref_bytes(200);
        assert_eq!(md.bare.disk_usage, 300);

        let prev = MdId(Hash::from_bytes([9; 32]));
        let next = md.make_successor(prev);
        assert_eq!(next.revision(), MetadataRevision(2));
        assert_eq!(next.bare.prev_root, prev);
        assert!(next.ops().is_empty());
        assert_eq!(next.bare.ref_bytes, 0);
        assert_eq!(next.bare.disk_usage, 300);
        assert_eq!(next.root_entry().unwrap(), md.root_entry().unwrap());
    }

    #[test]
    fn test_unreadable_reports_missing_key() {
        let md = RootMetadata::unreadable(root().bare);
        assert!(!md.is_readable());
        assert!(md.ops().is_empty());
        assert!(matches!(md.data(), Err(Error::NoKey { .. })));
    }
}
