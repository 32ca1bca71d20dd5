//! The rekey protocol.
//!
//! Rekeying compares the devices holding shares of the latest generation
//! with the devices the identity provider currently lists for the folder's
//! writers and readers:
//!
//! - nothing changed: no new key material;
//! - devices added: existing generations are extended with shares for the
//!   new devices (every generation for V2 metadata, only the latest for V3,
//!   whose older keys travel in the historic blob);
//! - devices removed: a new generation is minted for the current device set.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};
use tlfs_core::{
    Error, KeyGen, Kid, Result, UserId,
    crypto::{
        DeviceCrypto, encrypt_tlf_crypt_key_client_half, encrypt_tlf_crypt_keys,
        make_random_tlf_crypt_key_server_half, make_random_tlf_keys, mask_tlf_crypt_key,
        server_half_id,
    },
    keys::TlfCryptKey,
    md::{BareRootMetadata, KeyGenBundle, TlfCryptKeyInfo, UserDeviceKeyInfoMap, flags},
    server::ServerHalfUpload,
};

use crate::KeyManager;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RekeyOutcome {
    /// The device set matches the latest generation.
    Unchanged,
    /// New devices got shares of existing generations; keys are the same.
    DevicesAdded,
    /// A new key generation was minted.
    NewKeyGen,
}

impl RekeyOutcome {
    pub fn is_changed(self) -> bool {
        self != RekeyOutcome::Unchanged
    }
}

type DeviceSet = BTreeMap<UserId, BTreeSet<Kid>>;

fn devices_of(map: &UserDeviceKeyInfoMap) -> DeviceSet {
    map.iter()
        .map(|(uid, devices)| (*uid, devices.keys().copied().collect()))
        .collect()
}

/// Devices in `a` missing from `b`.
fn missing(a: &DeviceSet, b: &DeviceSet) -> DeviceSet {
    a.iter()
        .filter_map(|(uid, kids)| {
            let left: BTreeSet<Kid> = match b.get(uid) {
                Some(other) => kids.difference(other).copied().collect(),
                None => kids.clone(),
            };
            (!left.is_empty()).then_some((*uid, left))
        })
        .collect()
}

/// Adds a share of `key` for each listed device, under one fresh
/// ephemeral key, and queues the matching server halves.
fn extend_bundle(
    bundle: &mut KeyGenBundle,
    key: &TlfCryptKey,
    writers: &DeviceSet,
    readers: &DeviceSet,
    uploads: &mut Vec<ServerHalfUpload>,
) -> Result<()> {
    if writers.is_empty() && readers.is_empty() {
        return Ok(());
    }
    let ephemeral = make_random_tlf_keys();
    let eph_index = bundle.ephemeral_public_keys.len() as u32;
    bundle.ephemeral_public_keys.push(ephemeral.ephemeral_public);

    for (map, devices) in [
        (&mut bundle.writer_keys, writers),
        (&mut bundle.reader_keys, readers),
    ] {
        for (uid, kids) in devices {
            for kid in kids {
                let server_half = make_random_tlf_crypt_key_server_half();
                let client_half = mask_tlf_crypt_key(&server_half, key);
                let info = TlfCryptKeyInfo {
                    client_half: encrypt_tlf_crypt_key_client_half(
                        &ephemeral.ephemeral_private,
                        kid,
                        &client_half,
                    )?,
                    server_half_id: server_half_id(uid, kid, &server_half),
                    eph_index,
                };
                map.entry(*uid).or_default().insert(*kid, info);
                uploads.push(ServerHalfUpload {
                    user: *uid,
                    device: *kid,
                    server_half,
                });
            }
        }
    }
    Ok(())
}

impl KeyManager {
    /// Brings the key bundles of `md` in line with the folder's current
    /// devices. Server halves for any new shares are uploaded before this
    /// returns.
    ///
    /// A device that cannot read the current keys asks for a paper key when
    /// `prompt_paper` is set, and otherwise fails with
    /// [`Error::RekeyNeedsInteraction`].
    pub async fn rekey(
        &self,
        md: &mut BareRootMetadata,
        prompt_paper: bool,
    ) -> Result<RekeyOutcome> {
        if md.is_public() {
            return Ok(RekeyOutcome::Unchanged);
        }
        let tlf = md.tlf_id;
        let session = self.kbpki.current_session().await?;
        let is_writer = md.handle.is_writer(session.uid);
        if !md.handle.is_reader(session.uid) {
            return Err(Error::WriteAccess {
                user: session.uid,
                tlf,
            });
        }

        let (mut wanted_writers, mut wanted_readers) = self.wanted_devices(md).await?;
        if !is_writer {
            // Readers may only hand keys to their own devices.
            wanted_writers.clear();
            wanted_readers.retain(|uid, _| *uid == session.uid);
        }

        let (current_writers, current_readers) = md
            .key_gen_bundle(md.latest_key_gen())
            .map(|b| (devices_of(&b.writer_keys), devices_of(&b.reader_keys)))
            .unwrap_or_default();
        let added_writers = missing(&wanted_writers, &current_writers);
        let added_readers = missing(&wanted_readers, &current_readers);
        let removed = is_writer
            && (!missing(&current_writers, &wanted_writers).is_empty()
                || !missing(&current_readers, &wanted_readers).is_empty());

        let first_keys = md.key_gens.is_empty();
        let new_gen = first_keys || removed;
        if !new_gen && added_writers.is_empty() && added_readers.is_empty() {
            tracing::debug!(%tlf, "rekey: device set unchanged");
            return Ok(RekeyOutcome::Unchanged);
        }
        if new_gen && !is_writer {
            return Err(Error::WriteAccess {
                user: session.uid,
                tlf,
            });
        }

        let unlocker = if first_keys {
            None
        } else {
            Some(self.unlocking_device(md, session.uid, prompt_paper).await?)
        };

        let mut uploads = Vec::new();
        let extend = !first_keys && !(new_gen && md.stores_historic_tlf_crypt_keys());
        if extend && let Some(device) = &unlocker {
            let gens: Vec<KeyGen> = if md.stores_historic_tlf_crypt_keys() {
                vec![md.latest_key_gen()]
            } else {
                (0..md.key_gens.len()).map(KeyGen::from_index).collect()
            };
            for key_gen in gens {
                let key = self
                    .key_with_device(md, key_gen, session.uid, device)
                    .await?;
                if let Some(bundle) = key_gen.index().and_then(|i| md.key_gens.get_mut(i)) {
                    extend_bundle(bundle, &key, &added_writers, &added_readers, &mut uploads)?;
                }
            }
        }

        if new_gen {
            let old_keys = match &unlocker {
                Some(device) if md.stores_historic_tlf_crypt_keys() => {
                    let mut keys = Vec::with_capacity(md.key_gens.len());
                    for i in 0..md.key_gens.len() {
                        keys.push(
                            self.key_with_device(md, KeyGen::from_index(i), session.uid, device)
                                .await?,
                        );
                    }
                    keys
                }
                _ => Vec::new(),
            };

            let keys = make_random_tlf_keys();
            let mut bundle = KeyGenBundle {
                tlf_public_key: keys.public,
                ephemeral_public_keys: Vec::new(),
                writer_keys: BTreeMap::new(),
                reader_keys: BTreeMap::new(),
            };
            extend_bundle(
                &mut bundle,
                &keys.crypt_key,
                &wanted_writers,
                &wanted_readers,
                &mut uploads,
            )?;
            md.key_gens.push(bundle);
            if !old_keys.is_empty() {
                md.historic_keys = Some(encrypt_tlf_crypt_keys(&old_keys, &keys.crypt_key)?);
            }
            self.cache()
                .put(tlf, md.latest_key_gen(), keys.crypt_key.clone());
        }

        self.key_server
            .put_tlf_crypt_key_server_halves(&uploads)
            .await?;
        md.set_flag(flags::REKEY, false);

        let outcome = if new_gen {
            RekeyOutcome::NewKeyGen
        } else {
            RekeyOutcome::DevicesAdded
        };
        tracing::info!(%tlf, key_gen = %md.latest_key_gen(), ?outcome, shares = uploads.len(), "rekeyed");
        Ok(outcome)
    }

    async fn wanted_devices(&self, md: &BareRootMetadata) -> Result<(DeviceSet, DeviceSet)> {
        let mut writers = DeviceSet::new();
        for uid in &md.handle.writers {
            let devices = self.kbpki.get_devices(*uid).await?;
            writers.insert(*uid, devices.into_iter().map(|d| d.kid).collect());
        }
        let mut readers = DeviceSet::new();
        for uid in md.handle.readers.iter().filter(|u| **u != UserId::PUBLIC) {
            let devices = self.kbpki.get_devices(*uid).await?;
            readers.insert(*uid, devices.into_iter().map(|d| d.kid).collect());
        }
        Ok((writers, readers))
    }

    /// A device of ours holding a share of the latest generation: this
    /// device, or a paper key if the user supplies one.
    async fn unlocking_device(
        &self,
        md: &BareRootMetadata,
        uid: UserId,
        prompt_paper: bool,
    ) -> Result<Arc<DeviceCrypto>> {
        if md.has_key_for_device(uid, self.device.kid()) {
            return Ok(self.device.clone());
        }
        if prompt_paper
            && let Some(paper) = self.kbpki.prompt_paper_key(md.tlf_id).await?
            && md.has_key_for_device(uid, paper.kid())
        {
            tracing::info!(tlf = %md.tlf_id, "unlocked keys with a paper key");
            return Ok(paper);
        }
        Err(Error::RekeyNeedsInteraction(md.tlf_id))
    }
}
