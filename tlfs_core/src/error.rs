use thiserror::Error;

use crate::{BlockId, KeyGen, TlfId, UserId};

/// Errors shared by every TLFS crate.
///
/// Callers branch on the variant: conflicts fork to an unmerged branch,
/// informational quota errors are logged, cancellation is reported as such,
/// and a rekey needing interaction is retried through the rekey queue.
#[derive(Debug, Error)]
pub enum Error {
    #[error("integrity check failed: {0}")]
    Integrity(String),
    #[error("bad signature: {0}")]
    BadSignature(String),
    #[error("metadata conflict in {tlf}: {reason}")]
    MdConflict { tlf: TlfId, reason: String },
    #[error("block {0} does not exist")]
    BlockNonExistent(BlockId),
    #[error("block {id} already stored with a different {field}")]
    BlockMismatch { id: BlockId, field: &'static str },
    #[error("over quota: {usage} of {limit} bytes used (throttled: {throttled})")]
    OverQuota {
        usage: i64,
        limit: i64,
        throttled: bool,
    },
    #[error("{user} cannot read {tlf}")]
    ReadAccess { user: UserId, tlf: TlfId },
    #[error("{user} cannot write {tlf}")]
    WriteAccess { user: UserId, tlf: TlfId },
    #[error("no key for generation {key_gen} of {tlf}")]
    NoKey { tlf: TlfId, key_gen: KeyGen },
    #[error("operation cancelled")]
    Cancelled,
    #[error("rekey of {0} needs user interaction")]
    RekeyNeedsInteraction(TlfId),
    #[error("{0} dirty blocks were never synced")]
    UnsyncedOnShutdown(usize),
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    NameExists(String),
    #[error("{0} is not a directory")]
    NotDir(String),
    #[error("{0} is not a file")]
    NotFile(String),
    #[error("directory {0} is not empty")]
    DirNotEmpty(String),
    #[error("invalid name {0:?}")]
    InvalidName(String),
    #[error("{0} is on an unmerged branch")]
    Unmerged(TlfId),
    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("crypto error: {0}")]
    Crypto(String),
    #[error("server error: {0}")]
    Server(String),
    #[error("engine is shut down")]
    Shutdown,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// A lost metadata race; handled by forking, never surfaced.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::MdConflict { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Over quota, but the server accepted the write anyway.
    pub fn is_informational_quota(&self) -> bool {
        matches!(
            self,
            Error::OverQuota {
                throttled: false,
                ..
            }
        )
    }

    pub fn is_permission(&self) -> bool {
        matches!(self, Error::ReadAccess { .. } | Error::WriteAccess { .. })
    }
}

impl From<minicbor::decode::Error> for Error {
    fn from(e: minicbor::decode::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

impl<E: std::fmt::Display> From<minicbor::encode::Error<E>> for Error {
    fn from(e: minicbor::encode::Error<E>) -> Self {
        Error::Codec(e.to_string())
    }
}

impl From<chacha20poly1305::Error> for Error {
    fn from(_: chacha20poly1305::Error) -> Self {
        Error::Crypto("authenticated decryption failed".into())
    }
}

impl From<ed25519_dalek::SignatureError> for Error {
    fn from(e: ed25519_dalek::SignatureError) -> Self {
        Error::BadSignature(e.to_string())
    }
}
