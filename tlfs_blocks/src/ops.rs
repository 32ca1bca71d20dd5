use bytes::Bytes;
use futures::future::try_join_all;
use std::{collections::BTreeMap, sync::Arc};
use tlfs_core::{
    Block, BlockId, BlockPointer, ReadyBlock, Result, TlfId,
    crypto::{
        decrypt_block, encrypt_block, make_permanent_block_id,
        make_random_block_crypt_key_server_half, unmask_block_crypt_key, verify_block_id,
    },
    keys::TlfCryptKey,
    md::BareRootMetadata,
    server::{BlockContextMap, BlockServer},
};
use tlfs_keys::KeyManager;

use crate::{BlockCache, BlockCacheLifetime};

/// Encrypts `block` under a fresh block key half and computes its id.
///
/// Pure; independent blocks may be readied in parallel.
pub fn ready_block(block: &Block, key: &TlfCryptKey) -> Result<ReadyBlock> {
    let server_half = make_random_block_crypt_key_server_half();
    let block_key = unmask_block_crypt_key(&server_half, key);
    let (plain_size, encoded) = encrypt_block(block, &block_key)?;
    Ok(ReadyBlock {
        id: make_permanent_block_id(&encoded),
        plain_size,
        buf: Bytes::from(encoded),
        server_half,
    })
}

fn group_by_id(ptrs: &[BlockPointer]) -> BlockContextMap {
    let mut map = BlockContextMap::new();
    for ptr in ptrs {
        map.entry(ptr.id).or_default().push(ptr.context);
    }
    map
}

/// Permanent cache entries of blocks being put; dropped with the put.
struct InFlight<'a> {
    cache: &'a BlockCache,
    ids: Vec<BlockId>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        for id in &self.ids {
            self.cache.delete_permanent(id);
        }
    }
}

#[derive(Debug, Clone)]
pub struct BlockOps {
    server: Arc<dyn BlockServer>,
    keys: Arc<KeyManager>,
    cache: Arc<BlockCache>,
}

impl BlockOps {
    pub fn new(server: Arc<dyn BlockServer>, keys: Arc<KeyManager>, cache: Arc<BlockCache>) -> Self {
        Self {
            server,
            keys,
            cache,
        }
    }

    pub fn cache(&self) -> &Arc<BlockCache> {
        &self.cache
    }

    /// Fetches, verifies and decrypts the block at `ptr`. The id is checked
    /// against the ciphertext before any decryption is attempted.
    pub async fn get(&self, md: &BareRootMetadata, ptr: &BlockPointer) -> Result<Block> {
        if let Some(block) = self.cache.get(ptr) {
            return Ok(block);
        }
        let tlf = md.tlf_id;
        let (buf, server_half) = self.server.get(tlf, ptr.id, &ptr.context).await?;
        verify_block_id(&buf, &ptr.id)?;
        let key = self
            .keys
            .get_tlf_crypt_key_for_block_decryption(md, ptr)
            .await?;
        let block = decrypt_block(&buf, &unmask_block_crypt_key(&server_half, &key))?;
        self.cache
            .put(*ptr, tlf, block.clone(), BlockCacheLifetime::Transient);
        Ok(block)
    }

    /// Readies `block` with the latest key generation of `md`.
    pub async fn ready(&self, md: &BareRootMetadata, block: &Block) -> Result<ReadyBlock> {
        let key = self.keys.get_tlf_crypt_key_for_encryption(md).await?;
        ready_block(block, &key)
    }

    /// Sends a readied block. Over-quota errors that did not throttle the
    /// write are logged and swallowed.
    pub async fn put(&self, tlf: TlfId, ptr: &BlockPointer, ready: ReadyBlock) -> Result<()> {
        let res = if ptr.context.ref_nonce.is_zero() {
            self.server
                .put(tlf, ptr.id, &ptr.context, ready.buf, ready.server_half)
                .await
        } else {
            self.server.add_block_reference(tlf, ptr.id, &ptr.context).await
        };
        match res {
            Err(e) if e.is_informational_quota() => {
                tracing::warn!(%tlf, block = %ptr.id, "{e}");
                Ok(())
            }
            other => other,
        }
    }

    /// Puts several blocks concurrently.
    pub async fn put_all(&self, tlf: TlfId, blocks: Vec<(BlockPointer, ReadyBlock)>) -> Result<()> {
        try_join_all(
            blocks
                .into_iter()
                .map(|(ptr, ready)| async move { self.put(tlf, &ptr, ready).await }),
        )
        .await?;
        Ok(())
    }

    /// Puts several blocks, holding their plaintext in the cache for as
    /// long as the puts are in flight. Blocks that reached the server stay
    /// cached as transient; after a failure none of them do.
    pub async fn put_all_cached(
        &self,
        tlf: TlfId,
        blocks: Vec<(BlockPointer, ReadyBlock, Block)>,
    ) -> Result<()> {
        let mut in_flight = InFlight {
            cache: &self.cache,
            ids: Vec::with_capacity(blocks.len()),
        };
        let mut puts = Vec::with_capacity(blocks.len());
        let mut plain = Vec::with_capacity(blocks.len());
        for (ptr, ready, block) in blocks {
            self.cache
                .put(ptr, tlf, block.clone(), BlockCacheLifetime::Permanent);
            in_flight.ids.push(ptr.id);
            puts.push((ptr, ready));
            plain.push((ptr, block));
        }
        self.put_all(tlf, puts).await?;
        drop(in_flight);
        for (ptr, block) in plain {
            self.cache.put(ptr, tlf, block, BlockCacheLifetime::Transient);
        }
        Ok(())
    }

    /// Adds another logical reference (nonzero nonce) to a stored block.
    pub async fn add_reference(&self, tlf: TlfId, ptr: &BlockPointer) -> Result<()> {
        self.server.add_block_reference(tlf, ptr.id, &ptr.context).await
    }

    /// Drops references and returns the remaining live count per block.
    /// Blocks left without references also leave the cache.
    pub async fn delete(
        &self,
        tlf: TlfId,
        ptrs: &[BlockPointer],
    ) -> Result<BTreeMap<BlockId, usize>> {
        if ptrs.is_empty() {
            return Ok(BTreeMap::new());
        }
        let live = self
            .server
            .remove_block_references(tlf, &group_by_id(ptrs))
            .await?;
        for ptr in ptrs {
            if live.get(&ptr.id) == Some(&0) {
                self.cache.delete_transient(ptr, tlf);
            }
        }
        tracing::debug!(%tlf, refs = ptrs.len(), "removed block references");
        Ok(live)
    }

    /// Archives references and returns the live count left per block.
    pub async fn archive(
        &self,
        tlf: TlfId,
        ptrs: &[BlockPointer],
    ) -> Result<BTreeMap<BlockId, usize>> {
        if ptrs.is_empty() {
            return Ok(BTreeMap::new());
        }
        let live = self
            .server
            .archive_block_references(tlf, &group_by_id(ptrs))
            .await?;
        tracing::debug!(%tlf, refs = ptrs.len(), "archived block references");
        Ok(live)
    }
}
