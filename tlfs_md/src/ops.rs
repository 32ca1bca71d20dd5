use std::sync::Arc;
use tlfs_core::{
    BranchId, Error, KeyGen, MetadataRevision, Result, TlfId,
    clock::Clock,
    crypto::{DeviceCrypto, decrypt_private_metadata, encrypt_private_metadata, verify},
    md::{BareRootMetadata, BareTlfHandle, MergeStatus, PrivateMetadata, RootMetadataSigned, flags},
    server::{Kbpki, MdServer},
};
use tlfs_keys::KeyManager;

use crate::{ImmutableRootMetadata, MdCache, RootMetadata};

/// Verified access to the metadata server.
///
/// Every fetched revision is checked before it is used: the signature must
/// verify and belong to a device of the writer who claims it, the branch
/// must be the one asked for, and ranges must link by prev-root.
#[derive(Debug, Clone)]
pub struct MdOps {
    server: Arc<dyn MdServer>,
    kbpki: Arc<dyn Kbpki>,
    keys: Arc<KeyManager>,
    device: Arc<DeviceCrypto>,
    cache: Arc<MdCache>,
    clock: Arc<dyn Clock>,
}

impl MdOps {
    pub fn new(
        server: Arc<dyn MdServer>,
        kbpki: Arc<dyn Kbpki>,
        keys: Arc<KeyManager>,
        device: Arc<DeviceCrypto>,
        cache: Arc<MdCache>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            server,
            kbpki,
            keys,
            device,
            cache,
            clock,
        }
    }

    pub fn cache(&self) -> &Arc<MdCache> {
        &self.cache
    }

    async fn process(&self, rmds: RootMetadataSigned) -> Result<ImmutableRootMetadata> {
        let md_id = rmds.md_id()?;
        let bare = &rmds.md;
        if let Some(cached) = self.cache.get(bare.tlf_id, bare.revision, bare.branch_id)
            && cached.md_id() == md_id
        {
            return Ok(cached);
        }

        bare.validate()?;
        verify(&bare.signing_bytes()?, &rmds.sig)?;
        let writer = bare.last_modifying_user;
        if !self
            .kbpki
            .has_verifying_key(writer, &rmds.sig.verifying_key)
            .await?
        {
            return Err(Error::BadSignature(format!(
                "revision {} of {} signed by a key {writer} never owned",
                bare.revision, bare.tlf_id
            )));
        }
        if !bare.handle.is_writer(writer) {
            return Err(Error::InvalidMetadata(format!(
                "revision {} of {} written by non-writer {writer}",
                bare.revision, bare.tlf_id
            )));
        }

        let md = self.decrypt(rmds.md).await?;
        let imd = ImmutableRootMetadata::new(md, md_id);
        self.cache.put(imd.clone());
        Ok(imd)
    }

    async fn decrypt(&self, bare: BareRootMetadata) -> Result<RootMetadata> {
        if bare.is_public() {
            let data = PrivateMetadata::from_bytes(&bare.private_data)?;
            return Ok(RootMetadata::new(bare, data));
        }
        match self.keys.get_tlf_crypt_key_for_md_decryption(&bare, &bare).await {
            Ok(key) => {
                let data = decrypt_private_metadata(&bare.private_data, &key)?;
                Ok(RootMetadata::new(bare, data))
            }
            Err(Error::NoKey { key_gen, .. }) => {
                tracing::debug!(tlf = %bare.tlf_id, rev = %bare.revision, %key_gen, "revision not readable by this device");
                Ok(RootMetadata::unreadable(bare))
            }
            Err(e) => Err(e),
        }
    }

    /// Decrypts the private data of `md` once its bundles hold a key for
    /// this device, e.g. right after a rekey. The data is still encrypted
    /// with `key_gen`, the latest generation before the rekey.
    pub async fn unlock(&self, md: &mut RootMetadata, key_gen: KeyGen) -> Result<()> {
        if md.is_readable() || md.bare.is_public() {
            return Ok(());
        }
        let key = self.keys.get_tlf_crypt_key(&md.bare, key_gen).await?;
        let mut data = decrypt_private_metadata(&md.bare.private_data, &key)?;
        data.changes.ops.clear();
        md.set_data(data);
        Ok(())
    }

    fn check_branch(md: &ImmutableRootMetadata, bid: BranchId) -> Result<()> {
        let ok = if bid.is_null() {
            !md.bare.is_unmerged() && md.branch_id().is_null()
        } else {
            md.bare.is_unmerged() && md.branch_id() == bid
        };
        if !ok {
            return Err(Error::InvalidMetadata(format!(
                "revision {} of {} is on branch {}, wanted {bid}",
                md.revision(),
                md.tlf_id(),
                md.branch_id()
            )));
        }
        Ok(())
    }

    /// Resolves `handle` to its folder and merged head. A folder that was
    /// never written has no head.
    pub async fn get_for_handle(
        &self,
        handle: &BareTlfHandle,
    ) -> Result<(TlfId, Option<ImmutableRootMetadata>)> {
        let (tlf, rmds) = self
            .server
            .get_for_handle(handle, MergeStatus::Merged)
            .await?;
        let Some(rmds) = rmds else {
            return Ok((tlf, None));
        };
        if rmds.md.tlf_id != tlf {
            return Err(Error::InvalidMetadata(format!(
                "handle resolved to {tlf} but head belongs to {}",
                rmds.md.tlf_id
            )));
        }
        let md = self.process(rmds).await?;
        Self::check_branch(&md, BranchId::NULL)?;
        Ok((tlf, Some(md)))
    }

    /// The merged head.
    pub async fn get_for_tlf(&self, tlf: TlfId) -> Result<Option<ImmutableRootMetadata>> {
        self.head(tlf, BranchId::NULL, MergeStatus::Merged).await
    }

    /// Head of unmerged branch `bid`; the null branch means this device's
    /// current branch, if it has one.
    pub async fn get_unmerged_for_tlf(
        &self,
        tlf: TlfId,
        bid: BranchId,
    ) -> Result<Option<ImmutableRootMetadata>> {
        let md = self.head(tlf, bid, MergeStatus::Unmerged).await?;
        if let Some(md) = &md
            && !md.bare.is_unmerged()
        {
            return Err(Error::InvalidMetadata(format!(
                "unmerged head of {tlf} is a merged revision"
            )));
        }
        Ok(md)
    }

    async fn head(
        &self,
        tlf: TlfId,
        bid: BranchId,
        status: MergeStatus,
    ) -> Result<Option<ImmutableRootMetadata>> {
        let Some(rmds) = self.server.get_for_tlf(tlf, bid, status).await? else {
            return Ok(None);
        };
        let md = self.process(rmds).await?;
        if status == MergeStatus::Merged || !bid.is_null() {
            Self::check_branch(&md, bid)?;
        }
        Ok(Some(md))
    }

    /// Merged revisions `start..=stop`, in order.
    pub async fn get_range(
        &self,
        tlf: TlfId,
        start: MetadataRevision,
        stop: MetadataRevision,
    ) -> Result<Vec<ImmutableRootMetadata>> {
        self.range(tlf, BranchId::NULL, MergeStatus::Merged, start, stop)
            .await
    }

    pub async fn get_unmerged_range(
        &self,
        tlf: TlfId,
        bid: BranchId,
        start: MetadataRevision,
        stop: MetadataRevision,
    ) -> Result<Vec<ImmutableRootMetadata>> {
        self.range(tlf, bid, MergeStatus::Unmerged, start, stop)
            .await
    }

    async fn range(
        &self,
        tlf: TlfId,
        bid: BranchId,
        status: MergeStatus,
        start: MetadataRevision,
        stop: MetadataRevision,
    ) -> Result<Vec<ImmutableRootMetadata>> {
        let signed = self.server.get_range(tlf, bid, status, start, stop).await?;
        let mut out: Vec<ImmutableRootMetadata> = Vec::with_capacity(signed.len());
        for rmds in signed {
            let md = self.process(rmds).await?;
            if status == MergeStatus::Merged || !bid.is_null() {
                Self::check_branch(&md, bid)?;
            }
            if let Some(prev) = out.last()
                && (md.revision() != prev.revision().next() || md.bare.prev_root != prev.md_id())
            {
                return Err(Error::Integrity(format!(
                    "revision {} of {tlf} does not follow revision {}",
                    md.revision(),
                    prev.revision()
                )));
            }
            out.push(md);
        }
        Ok(out)
    }

    /// Signs and appends `md` to the merged branch. A lost race comes back
    /// as [`Error::MdConflict`].
    pub async fn put(&self, mut md: RootMetadata) -> Result<ImmutableRootMetadata> {
        md.bare.branch_id = BranchId::NULL;
        md.bare.set_flag(flags::UNMERGED, false);
        self.sign_and_put(md).await
    }

    /// Signs and appends `md` to this device's unmerged branch `bid`.
    pub async fn put_unmerged(
        &self,
        mut md: RootMetadata,
        bid: BranchId,
    ) -> Result<ImmutableRootMetadata> {
        md.bare.branch_id = bid;
        md.bare.set_flag(flags::UNMERGED, true);
        self.sign_and_put(md).await
    }

    async fn sign_and_put(&self, mut md: RootMetadata) -> Result<ImmutableRootMetadata> {
        let session = self.kbpki.current_session().await?;
        md.bare.last_modifying_user = session.uid;
        md.bare.last_modifying_device = session.kid;
        md.bare.timestamp =
            self.clock.now_ms() + self.server.offset_from_server_time().unwrap_or_default();

        let private_data = if md.bare.is_public() {
            md.data()?.to_vec()?
        } else {
            let key = self.keys.get_tlf_crypt_key_for_encryption(&md.bare).await?;
            encrypt_private_metadata(md.data()?, &key)?
        };
        md.bare.private_data = private_data;
        md.bare.validate()?;

        let rmds = RootMetadataSigned {
            sig: self.device.sign(&md.bare.signing_bytes()?),
            md: md.bare.clone(),
        };
        self.server.put(&rmds).await?;
        let imd = ImmutableRootMetadata::new(md, rmds.md_id()?);
        tracing::debug!(
            tlf = %imd.tlf_id(),
            rev = %imd.revision(),
            branch = %imd.branch_id(),
            ops = imd.ops().len(),
            "put revision"
        );
        self.cache.put(imd.clone());
        Ok(imd)
    }

    pub async fn prune_branch(&self, tlf: TlfId, bid: BranchId) -> Result<()> {
        self.server.prune_branch(tlf, bid).await?;
        tracing::debug!(%tlf, branch = %bid, "pruned branch");
        Ok(())
    }

    pub async fn get_latest_handle_for_tlf(&self, tlf: TlfId) -> Result<BareTlfHandle> {
        self.server.get_latest_handle_for_tlf(tlf).await
    }
}
