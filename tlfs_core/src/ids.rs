//! Identifiers for folders, branches, revisions, key generations, users and
//! devices.

use minicbor::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::Hash;

/// Globally unique id of a top-level folder.
///
/// The last byte encodes whether the folder is public or private.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Encode, Decode)]
pub struct TlfId(#[n(0)] #[cbor(with = "minicbor::bytes")] [u8; 16]);

impl TlfId {
    pub const PRIVATE_SUFFIX: u8 = 0x16;
    pub const PUBLIC_SUFFIX: u8 = 0x17;

    pub fn from_bytes(mut bytes: [u8; 16], public: bool) -> Self {
        bytes[15] = if public {
            Self::PUBLIC_SUFFIX
        } else {
            Self::PRIVATE_SUFFIX
        };
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn is_public(&self) -> bool {
        self.0[15] == Self::PUBLIC_SUFFIX
    }
}

impl fmt::Display for TlfId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for TlfId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TlfId({self})")
    }
}

/// Identifies a device-local unmerged lineage. [`BranchId::NULL`] is the
/// merged branch.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Encode, Decode)]
pub struct BranchId(#[n(0)] #[cbor(with = "minicbor::bytes")] [u8; 16]);

impl BranchId {
    pub const NULL: BranchId = BranchId([0u8; 16]);

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("merged")
        } else {
            f.write_str(&hex::encode(self.0))
        }
    }
}

impl fmt::Debug for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BranchId({self})")
    }
}

/// Revision number within one (folder, branch) pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Encode, Decode)]
pub struct MetadataRevision(#[n(0)] pub i64);

impl MetadataRevision {
    pub const UNINITIALIZED: MetadataRevision = MetadataRevision(0);
    pub const INITIAL: MetadataRevision = MetadataRevision(1);
    pub const MAX: MetadataRevision = MetadataRevision(i64::MAX);

    pub fn next(self) -> Self {
        MetadataRevision(self.0 + 1)
    }

    pub fn prev(self) -> Self {
        MetadataRevision(self.0 - 1)
    }
}

impl fmt::Display for MetadataRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One epoch of a folder's symmetric key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Encode, Decode)]
pub struct KeyGen(#[n(0)] pub i32);

impl KeyGen {
    pub const PUBLIC: KeyGen = KeyGen(-1);
    pub const UNSPECIFIED: KeyGen = KeyGen(0);
    pub const FIRST_VALID: KeyGen = KeyGen(1);

    /// Zero-based position of this generation in a metadata's bundle list.
    pub fn index(self) -> Option<usize> {
        (self.0 >= Self::FIRST_VALID.0).then(|| (self.0 - Self::FIRST_VALID.0) as usize)
    }

    pub fn from_index(index: usize) -> Self {
        KeyGen(index as i32 + Self::FIRST_VALID.0)
    }
}

impl fmt::Display for KeyGen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Encode, Decode)]
pub struct UserId(#[n(0)] #[cbor(with = "minicbor::bytes")] [u8; 16]);

impl UserId {
    /// Reader entry that marks a folder as world readable.
    pub const PUBLIC: UserId = UserId([0xff; 16]);

    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserId({})", hex::encode(&self.0[..4]))
    }
}

/// A device's identity: its X25519 crypt public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Encode, Decode)]
pub struct Kid(#[n(0)] #[cbor(with = "minicbor::bytes")] [u8; 32]);

impl Kid {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Kid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Kid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Kid({})", hex::encode(&self.0[..4]))
    }
}

/// Hash of an encoded, signed metadata revision.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Encode, Decode)]
pub struct MdId(#[n(0)] pub Hash);

impl MdId {
    /// prev-root of the first revision.
    pub const NONE: MdId = MdId(Hash::ZERO);
}

impl fmt::Display for MdId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.fmt_short())
    }
}

/// Layout version of a metadata revision's key bundles.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Encode, Decode, Serialize, Deserialize,
)]
#[cbor(index_only)]
#[serde(rename_all = "snake_case")]
pub enum MetadataVer {
    /// Every key generation keeps client halves for every device.
    #[n(2)]
    V2,
    /// New devices only get the latest generation; older generations are
    /// kept symmetrically encrypted under the latest key.
    #[n(3)]
    V3,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tlf_id_visibility() {
        let private = TlfId::from_bytes([7u8; 16], false);
        let public = TlfId::from_bytes([7u8; 16], true);
        assert!(!private.is_public());
        assert!(public.is_public());
        assert_ne!(private, public);
    }

    #[test]
    fn test_key_gen_index() {
        assert_eq!(KeyGen::FIRST_VALID.index(), Some(0));
        assert_eq!(KeyGen(3).index(), Some(2));
        assert_eq!(KeyGen::PUBLIC.index(), None);
        assert_eq!(KeyGen::from_index(1), KeyGen(2));
    }

    #[test]
    fn test_branch_display() {
        assert_eq!(BranchId::NULL.to_string(), "merged");
        assert_eq!(BranchId::from_bytes([1u8; 16]).to_string().len(), 32);
    }
}
