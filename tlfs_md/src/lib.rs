//! # tlfs_md
//!
//! Metadata revisions as the engine sees them: decrypted, verified and
//! cached.
//!
//! - [`RootMetadata`] is a revision being built or read, with its private
//!   data in the clear.
//! - [`ImmutableRootMetadata`] is a revision that has been signed and
//!   stored, identified by its [`tlfs_core::MdId`].
//! - [`MdCache`] holds recent revisions keyed by (folder, revision, branch).
//! - [`MdOps`] fetches, verifies, decrypts, signs and puts revisions.

mod cache;
mod ops;
mod root;

pub use cache::MdCache;
pub use ops::MdOps;
pub use root::{ImmutableRootMetadata, RootMetadata};
