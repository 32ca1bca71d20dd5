//! Wire-level metadata revisions.
//!
//! A [`RootMetadataSigned`] is what the metadata server stores: a
//! [`BareRootMetadata`] plus the signature of the device that wrote it. The
//! private part (root directory entry and op list) is encrypted with the
//! latest key generation and only visible as bytes here.

use minicbor::{Decode, Encode};
use std::collections::BTreeMap;

use crate::{
    BranchId, DirEntry, Hash, KeyGen, Kid, MdId, MetadataRevision, MetadataVer, TlfId, UserId,
    error::{Error, Result},
    keys::{EncryptedData, ServerHalfId, TlfEphemeralPublicKey, TlfPublicKey},
    ops::Op,
};

/// Status bits of a revision.
pub mod flags {
    /// Some device still needs keys; a device with access should rekey.
    pub const REKEY: u8 = 1;
    pub const FINALIZED: u8 = 1 << 1;
    pub const WRITER_METADATA_COPIED: u8 = 1 << 2;
    pub const UNMERGED: u8 = 1 << 3;
}

/// Writers and readers of a folder, sorted and de-duplicated.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Encode, Decode)]
#[cbor(map)]
pub struct BareTlfHandle {
    #[n(0)]
    pub writers: Vec<UserId>,
    #[n(1)]
    pub readers: Vec<UserId>,
}

impl BareTlfHandle {
    pub fn new(mut writers: Vec<UserId>, mut readers: Vec<UserId>) -> Self {
        writers.sort();
        writers.dedup();
        readers.retain(|r| !writers.contains(r));
        readers.sort();
        readers.dedup();
        Self { writers, readers }
    }

    pub fn new_public(writers: Vec<UserId>) -> Self {
        Self::new(writers, vec![UserId::PUBLIC])
    }

    pub fn is_public(&self) -> bool {
        self.readers.contains(&UserId::PUBLIC)
    }

    pub fn is_writer(&self, uid: UserId) -> bool {
        self.writers.contains(&uid)
    }

    pub fn is_reader(&self, uid: UserId) -> bool {
        self.is_public() || self.is_writer(uid) || self.readers.contains(&uid)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
#[cbor(map)]
pub struct SignatureInfo {
    #[n(0)]
    #[cbor(with = "minicbor::bytes")]
    pub signature: [u8; 64],
    #[n(1)]
    #[cbor(with = "minicbor::bytes")]
    pub verifying_key: [u8; 32],
}

/// One device's share of a key generation.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
#[cbor(map)]
pub struct TlfCryptKeyInfo {
    #[n(0)]
    pub client_half: EncryptedData,
    #[n(1)]
    pub server_half_id: ServerHalfId,
    #[n(2)]
    pub eph_index: u32,
}

pub type UserDeviceKeyInfoMap = BTreeMap<UserId, BTreeMap<Kid, TlfCryptKeyInfo>>;

/// Everything needed by a device to reconstruct one generation's key.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
#[cbor(map)]
pub struct KeyGenBundle {
    #[n(0)]
    pub tlf_public_key: TlfPublicKey,
    #[n(1)]
    pub ephemeral_public_keys: Vec<TlfEphemeralPublicKey>,
    #[n(2)]
    pub writer_keys: UserDeviceKeyInfoMap,
    #[n(3)]
    pub reader_keys: UserDeviceKeyInfoMap,
}

impl KeyGenBundle {
    pub fn info_for(&self, uid: UserId, kid: Kid) -> Option<&TlfCryptKeyInfo> {
        self.writer_keys
            .get(&uid)
            .and_then(|devices| devices.get(&kid))
            .or_else(|| self.reader_keys.get(&uid).and_then(|d| d.get(&kid)))
    }

    /// (user, device) pairs holding a share, writers and readers alike.
    pub fn devices(&self) -> BTreeMap<UserId, Vec<Kid>> {
        let mut out: BTreeMap<UserId, Vec<Kid>> = BTreeMap::new();
        for map in [&self.writer_keys, &self.reader_keys] {
            for (uid, devices) in map {
                out.entry(*uid).or_default().extend(devices.keys().copied());
            }
        }
        out
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
#[cbor(map)]
pub struct BareRootMetadata {
    #[n(0)]
    pub tlf_id: TlfId,
    #[n(1)]
    pub branch_id: BranchId,
    #[n(2)]
    pub revision: MetadataRevision,
    #[n(3)]
    pub prev_root: MdId,
    #[n(4)]
    pub flags: u8,
    #[n(5)]
    pub handle: BareTlfHandle,
    #[n(6)]
    pub last_modifying_user: UserId,
    #[n(7)]
    pub last_modifying_device: Kid,
    #[n(8)]
    pub disk_usage: u64,
    #[n(9)]
    pub ref_bytes: u64,
    #[n(10)]
    pub unref_bytes: u64,
    #[n(11)]
    pub version: MetadataVer,
    #[n(12)]
    pub key_gens: Vec<KeyGenBundle>,
    /// All generations before the latest, encrypted with the latest key.
    #[n(13)]
    pub historic_keys: Option<EncryptedData>,
    /// Encoded [`PrivateMetadata`]; encrypted unless the folder is public.
    #[n(14)]
    #[cbor(with = "minicbor::bytes")]
    pub private_data: Vec<u8>,
    /// Milliseconds since the epoch, in server time.
    #[n(15)]
    pub timestamp: i64,
}

impl BareRootMetadata {
    pub fn new(tlf_id: TlfId, handle: BareTlfHandle, version: MetadataVer) -> Self {
        Self {
            tlf_id,
            branch_id: BranchId::NULL,
            revision: MetadataRevision::INITIAL,
            prev_root: MdId::NONE,
            flags: 0,
            handle,
            last_modifying_user: UserId::from_bytes([0; 16]),
            last_modifying_device: Kid::from_bytes([0; 32]),
            disk_usage: 0,
            ref_bytes: 0,
            unref_bytes: 0,
            version,
            key_gens: Vec::new(),
            historic_keys: None,
            private_data: Vec::new(),
            timestamp: 0,
        }
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    pub fn set_flag(&mut self, flag: u8, on: bool) {
        if on {
            self.flags |= flag;
        } else {
            self.flags &= !flag;
        }
    }

    pub fn is_unmerged(&self) -> bool {
        self.has_flag(flags::UNMERGED)
    }

    pub fn merge_status(&self) -> MergeStatus {
        if self.is_unmerged() {
            MergeStatus::Unmerged
        } else {
            MergeStatus::Merged
        }
    }

    pub fn is_public(&self) -> bool {
        self.tlf_id.is_public()
    }

    pub fn latest_key_gen(&self) -> KeyGen {
        if self.is_public() {
            KeyGen::PUBLIC
        } else if self.key_gens.is_empty() {
            KeyGen::UNSPECIFIED
        } else {
            KeyGen::from_index(self.key_gens.len() - 1)
        }
    }

    pub fn key_gen_bundle(&self, key_gen: KeyGen) -> Option<&KeyGenBundle> {
        key_gen.index().and_then(|i| self.key_gens.get(i))
    }

    pub fn stores_historic_tlf_crypt_keys(&self) -> bool {
        self.version == MetadataVer::V3
    }

    /// True if `kid` of `uid` holds a share of the latest generation.
    pub fn has_key_for_device(&self, uid: UserId, kid: Kid) -> bool {
        self.key_gen_bundle(self.latest_key_gen())
            .and_then(|b| b.info_for(uid, kid))
            .is_some()
    }

    /// The bytes covered by the revision signature.
    pub fn signing_bytes(&self) -> Result<Vec<u8>> {
        Ok(minicbor::to_vec(self)?)
    }

    /// Sanity checks that do not need keys.
    pub fn validate(&self) -> Result<()> {
        if self.revision < MetadataRevision::INITIAL {
            return Err(Error::InvalidMetadata(format!(
                "revision {} below initial",
                self.revision
            )));
        }
        if self.is_unmerged() == self.branch_id.is_null() {
            return Err(Error::InvalidMetadata(format!(
                "unmerged bit does not match branch {}",
                self.branch_id
            )));
        }
        if self.revision == MetadataRevision::INITIAL && self.prev_root != MdId::NONE {
            return Err(Error::InvalidMetadata("initial revision has a prev root".into()));
        }
        if self.is_public() != self.handle.is_public() {
            return Err(Error::InvalidMetadata("handle visibility mismatch".into()));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MergeStatus {
    Merged,
    Unmerged,
}

#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
#[cbor(map)]
pub struct RootMetadataSigned {
    #[n(0)]
    pub md: BareRootMetadata,
    #[n(1)]
    pub sig: SignatureInfo,
}

impl RootMetadataSigned {
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        Ok(minicbor::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(minicbor::decode(bytes)?)
    }

    pub fn md_id(&self) -> Result<MdId> {
        Ok(MdId(Hash::new(self.to_vec()?)))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Encode, Decode)]
#[cbor(map)]
pub struct BlockChanges {
    #[n(0)]
    pub ops: Vec<Op>,
}

#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
#[cbor(map)]
pub struct PrivateMetadata {
    /// Entry of the root directory.
    #[n(0)]
    pub dir: DirEntry,
    #[n(1)]
    pub changes: BlockChanges,
}

impl PrivateMetadata {
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        Ok(minicbor::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(minicbor::decode(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uid(b: u8) -> UserId {
        UserId::from_bytes([b; 16])
    }

    #[test]
    fn test_handle_normalizes() {
        let h = BareTlfHandle::new(vec![uid(2), uid(1), uid(2)], vec![uid(1), uid(3)]);
        assert_eq!(h.writers, vec![uid(1), uid(2)]);
        assert_eq!(h.readers, vec![uid(3)]);
        assert!(h.is_reader(uid(3)));
        assert!(!h.is_writer(uid(3)));
        assert!(!h.is_reader(uid(4)));
        assert!(BareTlfHandle::new_public(vec![uid(1)]).is_reader(uid(9)));
    }

    #[test]
    fn test_validate_branch_bits() {
        let tlf = TlfId::from_bytes([1; 16], false);
        let mut md = BareRootMetadata::new(tlf, BareTlfHandle::new(vec![uid(1)], vec![]), MetadataVer::V2);
        assert!(md.validate().is_ok());
        md.set_flag(flags::UNMERGED, true);
        assert!(md.validate().is_err());
        md.branch_id = BranchId::from_bytes([5; 16]);
        assert!(md.validate().is_ok());
        assert_eq!(md.merge_status(), MergeStatus::Unmerged);
        assert_eq!(md.latest_key_gen(), KeyGen::UNSPECIFIED);
    }
}
