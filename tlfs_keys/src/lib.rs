//! # tlfs_keys
//!
//! Per-folder symmetric keys. A key generation's [`TlfCryptKey`] is never
//! stored whole: each device gets an encrypted client half in the metadata
//! and fetches the matching server half from the key server.
//!
//! - [`KeyCache`] remembers unmasked keys per (folder, generation).
//! - [`KeyManager`] reconstructs keys for encryption and decryption, and
//!   runs the rekey protocol when a folder's device set changes.
//!
//! [`TlfCryptKey`]: tlfs_core::keys::TlfCryptKey

mod cache;
mod manager;
mod rekey;

pub use cache::KeyCache;
pub use manager::KeyManager;
pub use rekey::RekeyOutcome;
