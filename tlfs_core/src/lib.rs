//! # tlfs_core
//!
//! Types and contracts shared by every TLFS crate.
//!
//! A top-level folder (TLF) is a chain of signed metadata revisions over a
//! tree of immutable, encrypted, content-addressed blocks. This crate holds
//! the pieces every layer agrees on:
//!
//! - identifiers ([`TlfId`], [`BranchId`], [`MetadataRevision`], [`KeyGen`]),
//! - block pointers and plaintext block formats ([`block`]),
//! - metadata revisions and their op lists ([`md`], [`ops`]),
//! - key material and the stateless [`crypto`] primitives,
//! - the [`Error`] taxonomy,
//! - the server and identity contracts ([`server`]),
//! - [`EngineConfig`] and cancellation helpers.

pub mod block;
pub mod cancel;
pub mod clock;
pub mod config;
pub mod crypto;
mod error;
mod hash;
mod ids;
pub mod keys;
pub mod md;
pub mod ops;
pub mod server;

pub use block::{
    Block, BlockContext, BlockId, BlockInfo, BlockPointer, BlockRef, BlockRefNonce, DirBlock,
    DirEntry, EntryInfo, EntryType, FileBlock, IndirectFilePtr, ReadyBlock,
};
pub use config::EngineConfig;
pub use error::{Error, Result};
pub use hash::Hash;
pub use ids::{BranchId, KeyGen, Kid, MdId, MetadataRevision, MetadataVer, TlfId, UserId};
pub use tokio_util::sync::CancellationToken;

/// Name of the merged branch in dirty-block keys.
pub const MASTER_BRANCH: &str = "master";
