//! Contracts the engine needs from the outside world: a block server, a
//! metadata server, a key server, and an identity provider.
//!
//! Each trait has `Arc` and `Box` blanket impls so handles can be shared
//! freely through the engine context.

use async_trait::async_trait;
use bytes::Bytes;
use std::{collections::BTreeMap, fmt::Debug, sync::Arc};
use tokio::sync::oneshot;

use crate::{
    BlockContext, BlockId, BranchId, Kid, MetadataRevision, TlfId, UserId,
    crypto::DeviceCrypto,
    error::Result,
    keys::{BlockCryptKeyServerHalf, ServerHalfId, TlfCryptKeyServerHalf},
    md::{BareTlfHandle, MergeStatus, RootMetadataSigned},
};

/// References grouped by block, as passed to batch reference calls.
pub type BlockContextMap = BTreeMap<BlockId, Vec<BlockContext>>;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserQuotaInfo {
    pub usage_bytes: i64,
    pub archive_bytes: i64,
    pub limit_bytes: i64,
}

#[async_trait]
pub trait BlockServer: Debug + Send + Sync {
    /// Returns the encrypted bytes and the block's key half.
    async fn get(
        &self,
        tlf: TlfId,
        id: BlockId,
        context: &BlockContext,
    ) -> Result<(Bytes, BlockCryptKeyServerHalf)>;

    /// Stores a block under its first reference. Idempotent for identical
    /// arguments; any differing field for a known id is an error.
    async fn put(
        &self,
        tlf: TlfId,
        id: BlockId,
        context: &BlockContext,
        buf: Bytes,
        server_half: BlockCryptKeyServerHalf,
    ) -> Result<()>;

    /// Adds a reference with a nonzero nonce to an existing block.
    async fn add_block_reference(
        &self,
        tlf: TlfId,
        id: BlockId,
        context: &BlockContext,
    ) -> Result<()>;

    /// Removes references and returns the remaining count per block.
    async fn remove_block_references(
        &self,
        tlf: TlfId,
        contexts: &BlockContextMap,
    ) -> Result<BTreeMap<BlockId, usize>>;

    /// Marks references archived: still readable, no longer live. Returns
    /// the live references left per block.
    async fn archive_block_references(
        &self,
        tlf: TlfId,
        contexts: &BlockContextMap,
    ) -> Result<BTreeMap<BlockId, usize>>;

    async fn get_user_quota_info(&self) -> Result<UserQuotaInfo>;
}

/// Single-fire notification of a merged update.
pub type UpdateNotification = oneshot::Receiver<Result<()>>;

#[async_trait]
pub trait MdServer: Debug + Send + Sync {
    /// Resolves (creating if needed) the folder for `handle`, and returns
    /// its head on the requested branch if any revision exists.
    async fn get_for_handle(
        &self,
        handle: &BareTlfHandle,
        status: MergeStatus,
    ) -> Result<(TlfId, Option<RootMetadataSigned>)>;

    /// Head of the merged branch, or of `bid`. An unmerged request with
    /// the null branch returns the calling device's current branch.
    async fn get_for_tlf(
        &self,
        tlf: TlfId,
        bid: BranchId,
        status: MergeStatus,
    ) -> Result<Option<RootMetadataSigned>>;

    /// Revisions `start..=stop` in ascending order.
    async fn get_range(
        &self,
        tlf: TlfId,
        bid: BranchId,
        status: MergeStatus,
        start: MetadataRevision,
        stop: MetadataRevision,
    ) -> Result<Vec<RootMetadataSigned>>;

    /// Appends a revision. Fails with [`crate::Error::MdConflict`] when the
    /// revision does not extend the branch head.
    async fn put(&self, rmds: &RootMetadataSigned) -> Result<()>;

    async fn prune_branch(&self, tlf: TlfId, bid: BranchId) -> Result<()>;

    /// Fires once the merged head moves past `current`.
    async fn register_for_update(
        &self,
        tlf: TlfId,
        current: MetadataRevision,
    ) -> Result<UpdateNotification>;

    async fn truncate_lock(&self, tlf: TlfId) -> Result<bool>;

    async fn truncate_unlock(&self, tlf: TlfId) -> Result<bool>;

    async fn get_latest_handle_for_tlf(&self, tlf: TlfId) -> Result<BareTlfHandle>;

    /// Server time minus local time in milliseconds, once known.
    fn offset_from_server_time(&self) -> Option<i64>;
}

/// A server half to upload for one (user, device).
#[derive(Clone, Debug)]
pub struct ServerHalfUpload {
    pub user: UserId,
    pub device: Kid,
    pub server_half: TlfCryptKeyServerHalf,
}

#[async_trait]
pub trait KeyServer: Debug + Send + Sync {
    async fn get_tlf_crypt_key_server_half(
        &self,
        id: &ServerHalfId,
        device: &Kid,
    ) -> Result<TlfCryptKeyServerHalf>;

    async fn put_tlf_crypt_key_server_halves(&self, halves: &[ServerHalfUpload]) -> Result<()>;

    async fn delete_tlf_crypt_key_server_half(
        &self,
        user: &UserId,
        device: &Kid,
        id: &ServerHalfId,
    ) -> Result<()>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionInfo {
    pub uid: UserId,
    pub name: String,
    pub kid: Kid,
    pub device_name: String,
    pub verifying_key: [u8; 32],
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DevicePublicKeys {
    pub kid: Kid,
    pub verifying_key: [u8; 32],
    pub name: String,
}

/// Identity provider: who we are, and which devices other users have.
#[async_trait]
pub trait Kbpki: Debug + Send + Sync {
    async fn current_session(&self) -> Result<SessionInfo>;

    /// Current (non-revoked) devices of `uid`.
    async fn get_devices(&self, uid: UserId) -> Result<Vec<DevicePublicKeys>>;

    async fn get_normalized_username(&self, uid: UserId) -> Result<String>;

    /// True if `key` ever belonged to one of `uid`'s devices.
    async fn has_verifying_key(&self, uid: UserId, key: &[u8; 32]) -> Result<bool>;

    /// Asks the user for a paper key able to unlock `tlf`.
    async fn prompt_paper_key(&self, tlf: TlfId) -> Result<Option<Arc<DeviceCrypto>>>;
}

macro_rules! forward_impls {
    ($trait:ident { $($body:tt)* }) => {
        #[async_trait]
        impl<T: $trait + ?Sized> $trait for Arc<T> { $($body)* }

        #[async_trait]
        impl<T: $trait + ?Sized> $trait for Box<T> { $($body)* }
    };
}

forward_impls!(BlockServer {
    async fn get(&self, tlf: TlfId, id: BlockId, context: &BlockContext) -> Result<(Bytes, BlockCryptKeyServerHalf)> {
        (**self).get(tlf, id, context).await
    }
    async fn put(&self, tlf: TlfId, id: BlockId, context: &BlockContext, buf: Bytes, server_half: BlockCryptKeyServerHalf) -> Result<()> {
        (**self).put(tlf, id, context, buf, server_half).await
    }
    async fn add_block_reference(&self, tlf: TlfId, id: BlockId, context: &BlockContext) -> Result<()> {
        (**self).add_block_reference(tlf, id, context).await
    }
    async fn remove_block_references(&self, tlf: TlfId, contexts: &BlockContextMap) -> Result<BTreeMap<BlockId, usize>> {
        (**self).remove_block_references(tlf, contexts).await
    }
    async fn archive_block_references(&self, tlf: TlfId, contexts: &BlockContextMap) -> Result<BTreeMap<BlockId, usize>> {
        (**self).archive_block_references(tlf, contexts).await
    }
    async fn get_user_quota_info(&self) -> Result<UserQuotaInfo> {
        (**self).get_user_quota_info().await
    }
});

forward_impls!(MdServer {
    async fn get_for_handle(&self, handle: &BareTlfHandle, status: MergeStatus) -> Result<(TlfId, Option<RootMetadataSigned>)> {
        (**self).get_for_handle(handle, status).await
    }
    async fn get_for_tlf(&self, tlf: TlfId, bid: BranchId, status: MergeStatus) -> Result<Option<RootMetadataSigned>> {
        (**self).get_for_tlf(tlf, bid, status).await
    }
    async fn get_range(&self, tlf: TlfId, bid: BranchId, status: MergeStatus, start: MetadataRevision, stop: MetadataRevision) -> Result<Vec<RootMetadataSigned>> {
        (**self).get_range(tlf, bid, status, start, stop).await
    }
    async fn put(&self, rmds: &RootMetadataSigned) -> Result<()> {
        (**self).put(rmds).await
    }
    async fn prune_branch(&self, tlf: TlfId, bid: BranchId) -> Result<()> {
        (**self).prune_branch(tlf, bid).await
    }
    async fn register_for_update(&self, tlf: TlfId, current: MetadataRevision) -> Result<UpdateNotification> {
        (**self).register_for_update(tlf, current).await
    }
    async fn truncate_lock(&self, tlf: TlfId) -> Result<bool> {
        (**self).truncate_lock(tlf).await
    }
    async fn truncate_unlock(&self, tlf: TlfId) -> Result<bool> {
        (**self).truncate_unlock(tlf).await
    }
    async fn get_latest_handle_for_tlf(&self, tlf: TlfId) -> Result<BareTlfHandle> {
        (**self).get_latest_handle_for_tlf(tlf).await
    }
    fn offset_from_server_time(&self) -> Option<i64> {
        (**self).offset_from_server_time()
    }
});

forward_impls!(KeyServer {
    async fn get_tlf_crypt_key_server_half(&self, id: &ServerHalfId, device: &Kid) -> Result<TlfCryptKeyServerHalf> {
        (**self).get_tlf_crypt_key_server_half(id, device).await
    }
    async fn put_tlf_crypt_key_server_halves(&self, halves: &[ServerHalfUpload]) -> Result<()> {
        (**self).put_tlf_crypt_key_server_halves(halves).await
    }
    async fn delete_tlf_crypt_key_server_half(&self, user: &UserId, device: &Kid, id: &ServerHalfId) -> Result<()> {
        (**self).delete_tlf_crypt_key_server_half(user, device, id).await
    }
});

forward_impls!(Kbpki {
    async fn current_session(&self) -> Result<SessionInfo> {
        (**self).current_session().await
    }
    async fn get_devices(&self, uid: UserId) -> Result<Vec<DevicePublicKeys>> {
        (**self).get_devices(uid).await
    }
    async fn get_normalized_username(&self, uid: UserId) -> Result<String> {
        (**self).get_normalized_username(uid).await
    }
    async fn has_verifying_key(&self, uid: UserId, key: &[u8; 32]) -> Result<bool> {
        (**self).has_verifying_key(uid, key).await
    }
    async fn prompt_paper_key(&self, tlf: TlfId) -> Result<Option<Arc<DeviceCrypto>>> {
        (**self).prompt_paper_key(tlf).await
    }
});
