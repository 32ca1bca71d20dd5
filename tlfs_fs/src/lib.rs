//! # tlfs_fs
//!
//! The file-system engine: folders as trees of nodes over signed metadata
//! revisions.
//!
//! ## Layers
//! 1. `node_cache` – stable node ids over ever-changing block pointers.
//! 2. `folder`     – one folder's branch: reads, buffered writes, syncs,
//!    directory mutations, updates from other devices and fork-on-race.
//! 3. `cr`         – folding an unmerged branch back into the merged one.
//! 4. `engine`     – the caller-facing surface over every open folder, with
//!    cancellation and the rekey queue.
//! 5. `context`    – wiring (servers, caches, key manager, clock).

mod context;
mod cr;
mod engine;
mod folder;
mod node_cache;
mod observer;
mod rekey_queue;
mod status;

pub use context::{EngineContext, EngineServices};
pub use cr::{ConflictRenamer, WriterDateRenamer};
pub use engine::Engine;
pub use folder::NodeMetadata;
pub use node_cache::{Node, NodeCache, NodeId, PathNode};
pub use observer::{NodeChange, Observer};
pub use rekey_queue::RekeyStatus;
pub use status::{EngineStatus, FolderBranchStatus};
