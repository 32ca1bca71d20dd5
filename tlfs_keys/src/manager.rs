use std::sync::Arc;
use tlfs_core::{
    BlockPointer, Error, KeyGen, Result, UserId,
    crypto::{DeviceCrypto, decrypt_tlf_crypt_keys, unmask_tlf_crypt_key, verify_server_half_id},
    keys::TlfCryptKey,
    md::BareRootMetadata,
    server::{Kbpki, KeyServer},
};

use crate::KeyCache;

/// Reconstructs folder keys for this device.
///
/// Unmasked keys are cached per (folder, generation); a cache miss costs a
/// client-half decryption plus one key server round trip.
#[derive(Debug)]
pub struct KeyManager {
    pub(crate) kbpki: Arc<dyn Kbpki>,
    pub(crate) key_server: Arc<dyn KeyServer>,
    pub(crate) device: Arc<DeviceCrypto>,
    cache: KeyCache,
}

impl KeyManager {
    pub fn new(
        kbpki: Arc<dyn Kbpki>,
        key_server: Arc<dyn KeyServer>,
        device: Arc<DeviceCrypto>,
        cache_entries: usize,
    ) -> Self {
        Self {
            kbpki,
            key_server,
            device,
            cache: KeyCache::new(cache_entries),
        }
    }

    pub fn cache(&self) -> &KeyCache {
        &self.cache
    }

    /// Key of the latest generation, used for everything newly written.
    pub async fn get_tlf_crypt_key_for_encryption(
        &self,
        md: &BareRootMetadata,
    ) -> Result<TlfCryptKey> {
        self.get_tlf_crypt_key(md, md.latest_key_gen()).await
    }

    /// Key for the private data of `md_to_decrypt`, looked up in the key
    /// bundles of `md_with_keys` (usually the same revision, or a newer one
    /// when the older revision's bundles lack this device).
    pub async fn get_tlf_crypt_key_for_md_decryption(
        &self,
        md_to_decrypt: &BareRootMetadata,
        md_with_keys: &BareRootMetadata,
    ) -> Result<TlfCryptKey> {
        self.get_tlf_crypt_key(md_with_keys, md_to_decrypt.latest_key_gen())
            .await
    }

    pub async fn get_tlf_crypt_key_for_block_decryption(
        &self,
        md: &BareRootMetadata,
        ptr: &BlockPointer,
    ) -> Result<TlfCryptKey> {
        self.get_tlf_crypt_key(md, ptr.key_gen).await
    }

    /// Keys of generations `FIRST_VALID..=latest`, in order.
    pub async fn get_tlf_crypt_keys_of_all_generations(
        &self,
        md: &BareRootMetadata,
    ) -> Result<Vec<TlfCryptKey>> {
        let mut keys = Vec::with_capacity(md.key_gens.len());
        for i in 0..md.key_gens.len() {
            keys.push(self.get_tlf_crypt_key(md, KeyGen::from_index(i)).await?);
        }
        Ok(keys)
    }

    pub async fn get_tlf_crypt_key(
        &self,
        md: &BareRootMetadata,
        key_gen: KeyGen,
    ) -> Result<TlfCryptKey> {
        if md.is_public() || key_gen == KeyGen::PUBLIC {
            return Ok(TlfCryptKey::public());
        }
        let tlf = md.tlf_id;
        if let Some(key) = self.cache.get(tlf, key_gen) {
            return Ok(key);
        }

        let session = self.kbpki.current_session().await?;
        if !md.handle.is_reader(session.uid) {
            return Err(Error::ReadAccess {
                user: session.uid,
                tlf,
            });
        }

        self.key_with_device(md, key_gen, session.uid, &self.device)
            .await
    }

    /// Key of `key_gen` as unlocked by `device` of `uid`. Older generations
    /// of folders storing historic keys come from the historic blob.
    pub(crate) async fn key_with_device(
        &self,
        md: &BareRootMetadata,
        key_gen: KeyGen,
        uid: UserId,
        device: &DeviceCrypto,
    ) -> Result<TlfCryptKey> {
        let tlf = md.tlf_id;
        if let Some(key) = self.cache.get(tlf, key_gen) {
            return Ok(key);
        }
        let latest = md.latest_key_gen();
        if key_gen < latest
            && md.stores_historic_tlf_crypt_keys()
            && let Some(historic) = &md.historic_keys
        {
            match Box::pin(self.key_with_device(md, latest, uid, device)).await {
                Ok(latest_key) => {
                    let keys = decrypt_tlf_crypt_keys(historic, &latest_key)?;
                    for (i, key) in keys.iter().enumerate() {
                        self.cache.put(tlf, KeyGen::from_index(i), key.clone());
                    }
                    return key_gen
                        .index()
                        .and_then(|i| keys.get(i).cloned())
                        .ok_or(Error::NoKey { tlf, key_gen });
                }
                // Devices removed since keep their share of older generations.
                Err(Error::NoKey { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        let key = self.unlock_key(md, key_gen, uid, device).await?;
        self.cache.put(tlf, key_gen, key.clone());
        Ok(key)
    }

    /// Rebuilds the key of `key_gen` from `device`'s client half and the
    /// matching server half.
    pub(crate) async fn unlock_key(
        &self,
        md: &BareRootMetadata,
        key_gen: KeyGen,
        uid: UserId,
        device: &DeviceCrypto,
    ) -> Result<TlfCryptKey> {
        let tlf = md.tlf_id;
        let bundle = md
            .key_gen_bundle(key_gen)
            .ok_or(Error::NoKey { tlf, key_gen })?;
        let kid = device.kid();
        let info = bundle
            .info_for(uid, kid)
            .ok_or(Error::NoKey { tlf, key_gen })?;
        let ephemeral = bundle
            .ephemeral_public_keys
            .get(info.eph_index as usize)
            .ok_or_else(|| {
                Error::InvalidMetadata(format!("ephemeral key {} missing", info.eph_index))
            })?;
        let client_half = device.decrypt_tlf_crypt_key_client_half(ephemeral, &info.client_half)?;
        let server_half = self
            .key_server
            .get_tlf_crypt_key_server_half(&info.server_half_id, &kid)
            .await?;
        verify_server_half_id(&info.server_half_id, &uid, &kid, &server_half)?;
        tracing::trace!(%tlf, %key_gen, "unlocked key");
        Ok(unmask_tlf_crypt_key(&server_half, &client_half))
    }
}
