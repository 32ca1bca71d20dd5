//! # tlfs_blocks
//!
//! Everything between a plaintext [`Block`](tlfs_core::Block) and the block
//! server:
//!
//! - [`BlockCache`]: decrypted blocks, either transient (evictable) or
//!   permanent (pinned while in flight), plus a known-pointer index used to
//!   dedup identical file blocks.
//! - [`DirtyBlockCache`]: locally modified blocks that are not yet durable,
//!   and the byte accounting that throttles writers.
//! - [`BlockOps`]: get (verify, then decrypt), ready (encrypt and address),
//!   put, and reference management.

mod cache;
mod dirty;
mod ops;

pub use cache::{BlockCache, BlockCacheLifetime};
pub use dirty::{DirtyBlockCache, DirtyBufferStats};
pub use ops::{BlockOps, ready_block};
