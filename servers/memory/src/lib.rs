//! In-memory implementations of the TLFS server contracts.
//!
//! Each server keeps its state behind an `Arc`, and per-session views
//! ([`MemoryBlockServer::for_user`], [`MemoryMdServer::for_device`]) share
//! that state the way independent clients share a real server.

mod block;
mod identity;
mod key;
mod md;

pub use block::{MemoryBlockServer, RefStatus};
pub use identity::{MemoryKbpki, UserDirectory};
pub use key::MemoryKeyServer;
pub use md::MemoryMdServer;
