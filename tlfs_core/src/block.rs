//! Block pointers and the plaintext block formats.
//!
//! A [`BlockPointer`] names one logical reference to a physical block. Many
//! pointers may share a [`BlockId`]; they are told apart by the reference
//! nonce in their [`BlockContext`].

use bytes::Bytes;
use minicbor::{Decode, Encode};
use std::{collections::BTreeMap, fmt};

use crate::{Hash, KeyGen, UserId, error::Result};

/// Content address of a block: the hash of its encrypted, encoded bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Encode, Decode)]
pub struct BlockId(#[n(0)] pub Hash);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.fmt_short())
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({})", self.0.fmt_short())
    }
}

/// Distinguishes multiple references to the same [`BlockId`]. The first
/// reference always uses [`BlockRefNonce::ZERO`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Encode, Decode)]
pub struct BlockRefNonce(#[n(0)] #[cbor(with = "minicbor::bytes")] pub [u8; 8]);

impl BlockRefNonce {
    pub const ZERO: BlockRefNonce = BlockRefNonce([0u8; 8]);

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Encode, Decode)]
#[cbor(map)]
pub struct BlockContext {
    #[n(0)]
    pub creator: UserId,
    #[n(1)]
    pub writer: UserId,
    #[n(2)]
    pub ref_nonce: BlockRefNonce,
}

impl BlockContext {
    pub fn first_ref(creator: UserId) -> Self {
        Self {
            creator,
            writer: creator,
            ref_nonce: BlockRefNonce::ZERO,
        }
    }
}

/// Identity of a single logical reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockRef {
    pub id: BlockId,
    pub ref_nonce: BlockRefNonce,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Encode, Decode)]
#[cbor(map)]
pub struct BlockPointer {
    #[n(0)]
    pub id: BlockId,
    #[n(1)]
    pub key_gen: KeyGen,
    #[n(2)]
    pub data_ver: u8,
    #[n(3)]
    pub context: BlockContext,
}

impl BlockPointer {
    pub const FIRST_DATA_VER: u8 = 1;

    pub fn new(id: BlockId, key_gen: KeyGen, context: BlockContext) -> Self {
        Self {
            id,
            key_gen,
            data_ver: Self::FIRST_DATA_VER,
            context,
        }
    }

    pub fn block_ref(&self) -> BlockRef {
        BlockRef {
            id: self.id,
            ref_nonce: self.context.ref_nonce,
        }
    }

    /// A new logical reference to the same physical block.
    pub fn with_ref_nonce(&self, ref_nonce: BlockRefNonce, writer: UserId) -> Self {
        let mut ptr = *self;
        ptr.context.ref_nonce = ref_nonce;
        ptr.context.writer = writer;
        ptr
    }
}

impl fmt::Debug for BlockPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BlockPointer({}, gen {}, nonce {})",
            self.id,
            self.key_gen,
            hex::encode(self.context.ref_nonce.0)
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Encode, Decode)]
#[cbor(map)]
pub struct BlockInfo {
    #[n(0)]
    pub ptr: BlockPointer,
    #[n(1)]
    pub encoded_size: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Encode, Decode)]
#[cbor(index_only)]
pub enum EntryType {
    #[n(0)]
    File,
    #[n(1)]
    Exec,
    #[n(2)]
    Dir,
    #[n(3)]
    Sym,
}

impl EntryType {
    pub fn is_file(self) -> bool {
        matches!(self, EntryType::File | EntryType::Exec)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
#[cbor(map)]
pub struct EntryInfo {
    #[n(0)]
    pub typ: EntryType,
    #[n(1)]
    pub size: u64,
    #[n(2)]
    pub sym_path: Option<String>,
    /// Milliseconds since the unix epoch.
    #[n(3)]
    pub mtime: i64,
    #[n(4)]
    pub ctime: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
#[cbor(map)]
pub struct DirEntry {
    #[n(0)]
    pub info: BlockInfo,
    #[n(1)]
    pub entry: EntryInfo,
}

impl DirEntry {
    pub fn ptr(&self) -> BlockPointer {
        self.info.ptr
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Encode, Decode)]
#[cbor(map)]
pub struct DirBlock {
    #[n(0)]
    pub children: BTreeMap<String, DirEntry>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Encode, Decode)]
#[cbor(map)]
pub struct IndirectFilePtr {
    #[n(0)]
    pub info: BlockInfo,
    #[n(1)]
    pub off: u64,
}

/// A file block is either direct (holds its bytes) or indirect (points at
/// fixed-size children that hold the bytes).
#[derive(Clone, Debug, Default, PartialEq, Eq, Encode, Decode)]
#[cbor(map)]
pub struct FileBlock {
    #[n(0)]
    pub is_ind: bool,
    #[n(1)]
    #[cbor(with = "minicbor::bytes")]
    pub contents: Vec<u8>,
    #[n(2)]
    pub iptrs: Vec<IndirectFilePtr>,
}

#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub enum Block {
    #[n(0)]
    File(#[n(0)] FileBlock),
    #[n(1)]
    Dir(#[n(0)] DirBlock),
}

impl Block {
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        Ok(minicbor::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(minicbor::decode(bytes)?)
    }

    pub fn as_file(&self) -> Option<&FileBlock> {
        match self {
            Block::File(f) => Some(f),
            Block::Dir(_) => None,
        }
    }

    pub fn as_dir(&self) -> Option<&DirBlock> {
        match self {
            Block::Dir(d) => Some(d),
            Block::File(_) => None,
        }
    }

    /// Bytes a dirty copy of this block is charged for in the write buffer.
    pub fn dirty_size(&self) -> u64 {
        match self {
            Block::File(f) => f.contents.len() as u64,
            Block::Dir(d) => d.children.len() as u64 * 128,
        }
    }
}

/// A block that has been encrypted and addressed, ready to be sent to the
/// block server.
#[derive(Clone, Debug)]
pub struct ReadyBlock {
    pub id: BlockId,
    pub plain_size: usize,
    pub buf: Bytes,
    pub server_half: crate::keys::BlockCryptKeyServerHalf,
}

impl ReadyBlock {
    pub fn encoded_size(&self) -> u32 {
        self.buf.len() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ptr(byte: u8) -> BlockPointer {
        BlockPointer::new(
            BlockId(Hash::from_bytes([byte; 32])),
            KeyGen::FIRST_VALID,
            BlockContext::first_ref(UserId::from_bytes([1; 16])),
        )
    }

    #[test]
    fn test_block_ref_distinguishes_nonce() {
        let a = ptr(3);
        let b = a.with_ref_nonce(BlockRefNonce([9; 8]), UserId::from_bytes([2; 16]));
        assert_eq!(a.id, b.id);
        assert_ne!(a.block_ref(), b.block_ref());
        assert_eq!(b.context.creator, a.context.creator);
    }

    #[test]
    fn test_dir_block_cbor() {
        let mut dir = DirBlock::default();
        dir.children.insert(
            "a.txt".into(),
            DirEntry {
                info: BlockInfo {
                    ptr: ptr(4),
                    encoded_size: 10,
                },
                entry: EntryInfo {
                    typ: EntryType::File,
                    size: 3,
                    sym_path: None,
                    mtime: 5,
                    ctime: 5,
                },
            },
        );
        let block = Block::Dir(dir);
        let decoded = Block::from_bytes(&block.to_vec().unwrap()).unwrap();
        assert_eq!(block, decoded);
        assert!(decoded.as_file().is_none());
    }
}
