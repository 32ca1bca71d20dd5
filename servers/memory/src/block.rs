use bytes::Bytes;
use dashmap::{DashMap, mapref::entry::Entry};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc,
        atomic::{AtomicI64, AtomicUsize, Ordering},
    },
};
use tlfs_core::{
    BlockContext, BlockId, BlockRefNonce, Error, Result, TlfId, UserId,
    crypto::verify_block_id,
    keys::BlockCryptKeyServerHalf,
    server::{BlockContextMap, BlockServer, UserQuotaInfo},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefStatus {
    Live,
    Archived,
}

#[derive(Debug)]
struct BlockEntry {
    buf: Bytes,
    server_half: BlockCryptKeyServerHalf,
    creator: UserId,
    refs: HashMap<BlockRefNonce, (BlockContext, RefStatus)>,
}

#[derive(Debug)]
struct Shared {
    blocks: DashMap<(TlfId, BlockId), BlockEntry>,
    usage: DashMap<UserId, i64>,
    limit_bytes: AtomicI64,
    gets: AtomicUsize,
}

/// Block server keeping every block in memory, with per-user quota and
/// reference counting.
///
/// Writes beyond the limit are accepted (and reported) until usage passes
/// the limit by a tenth; after that they are throttled.
#[derive(Debug, Clone)]
pub struct MemoryBlockServer {
    shared: Arc<Shared>,
    user: UserId,
}

impl MemoryBlockServer {
    pub fn new(limit_bytes: i64) -> Self {
        Self {
            shared: Arc::new(Shared {
                blocks: DashMap::new(),
                usage: DashMap::new(),
                limit_bytes: AtomicI64::new(limit_bytes),
                gets: AtomicUsize::new(0),
            }),
            user: UserId::from_bytes([0; 16]),
        }
    }

    /// A session for `user` on the same storage.
    pub fn for_user(&self, user: UserId) -> Self {
        Self {
            shared: self.shared.clone(),
            user,
        }
    }

    pub fn set_limit_bytes(&self, limit_bytes: i64) {
        self.shared.limit_bytes.store(limit_bytes, Ordering::SeqCst);
    }

    /// Block fetches served so far, across all sessions.
    pub fn get_count(&self) -> usize {
        self.shared.gets.load(Ordering::SeqCst)
    }

    pub fn contains(&self, tlf: TlfId, id: BlockId) -> bool {
        self.shared.blocks.contains_key(&(tlf, id))
    }

    /// (live, archived) reference counts of a block.
    pub fn ref_counts(&self, tlf: TlfId, id: BlockId) -> (usize, usize) {
        self.shared
            .blocks
            .get(&(tlf, id))
            .map(|entry| {
                let live = entry
                    .refs
                    .values()
                    .filter(|(_, s)| *s == RefStatus::Live)
                    .count();
                (live, entry.refs.len() - live)
            })
            .unwrap_or((0, 0))
    }

    pub fn block_count(&self) -> usize {
        self.shared.blocks.len()
    }

    fn usage_of(&self, user: UserId) -> i64 {
        self.shared.usage.get(&user).map(|u| *u).unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl BlockServer for MemoryBlockServer {
    async fn get(
        &self,
        tlf: TlfId,
        id: BlockId,
        context: &BlockContext,
    ) -> Result<(Bytes, BlockCryptKeyServerHalf)> {
        self.shared.gets.fetch_add(1, Ordering::SeqCst);
        let entry = self
            .shared
            .blocks
            .get(&(tlf, id))
            .ok_or(Error::BlockNonExistent(id))?;
        if !entry.refs.contains_key(&context.ref_nonce) {
            return Err(Error::BlockNonExistent(id));
        }
        Ok((entry.buf.clone(), entry.server_half.clone()))
    }

    async fn put(
        &self,
        tlf: TlfId,
        id: BlockId,
        context: &BlockContext,
        buf: Bytes,
        server_half: BlockCryptKeyServerHalf,
    ) -> Result<()> {
        if !context.ref_nonce.is_zero() {
            return Err(Error::Server("put needs the zero reference nonce".into()));
        }
        verify_block_id(&buf, &id)?;

        match self.shared.blocks.entry((tlf, id)) {
            Entry::Occupied(mut e) => {
                let entry = e.get_mut();
                if entry.buf != buf {
                    return Err(Error::BlockMismatch { id, field: "data" });
                }
                if entry.server_half != server_half {
                    return Err(Error::BlockMismatch {
                        id,
                        field: "server half",
                    });
                }
                match entry.refs.get(&context.ref_nonce) {
                    Some((existing, _)) if existing != context => Err(Error::BlockMismatch {
                        id,
                        field: "context",
                    }),
                    Some(_) => Ok(()),
                    None => {
                        entry
                            .refs
                            .insert(context.ref_nonce, (*context, RefStatus::Live));
                        Ok(())
                    }
                }
            }
            Entry::Vacant(e) => {
                let limit = self.shared.limit_bytes.load(Ordering::SeqCst);
                let usage = self
                    .usage_of(context.creator)
                    .saturating_add(buf.len() as i64);
                if usage > limit.saturating_add(limit / 10) {
                    return Err(Error::OverQuota {
                        usage,
                        limit,
                        throttled: true,
                    });
                }
                {
                    let mut used = self.shared.usage.entry(context.creator).or_insert(0);
                    *used = used.saturating_add(buf.len() as i64);
                }
                let mut refs = HashMap::new();
                refs.insert(context.ref_nonce, (*context, RefStatus::Live));
                e.insert(BlockEntry {
                    buf,
                    server_half,
                    creator: context.creator,
                    refs,
                });
                if usage > limit {
                    return Err(Error::OverQuota {
                        usage,
                        limit,
                        throttled: false,
                    });
                }
                Ok(())
            }
        }
    }

    async fn add_block_reference(
        &self,
        tlf: TlfId,
        id: BlockId,
        context: &BlockContext,
    ) -> Result<()> {
        if context.ref_nonce.is_zero() {
            return Err(Error::Server("new references need a nonzero nonce".into()));
        }
        let mut entry = self
            .shared
            .blocks
            .get_mut(&(tlf, id))
            .ok_or(Error::BlockNonExistent(id))?;
        match entry.refs.get(&context.ref_nonce) {
            Some((existing, _)) if existing != context => Err(Error::BlockMismatch {
                id,
                field: "context",
            }),
            Some(_) => Ok(()),
            None => {
                entry
                    .refs
                    .insert(context.ref_nonce, (*context, RefStatus::Live));
                Ok(())
            }
        }
    }

    async fn remove_block_references(
        &self,
        tlf: TlfId,
        contexts: &BlockContextMap,
    ) -> Result<BTreeMap<BlockId, usize>> {
        let mut live_counts = BTreeMap::new();
        for (id, ctxs) in contexts {
            let key = (tlf, *id);
            let remaining = match self.shared.blocks.get_mut(&key) {
                Some(mut entry) => {
                    for ctx in ctxs {
                        entry.refs.remove(&ctx.ref_nonce);
                    }
                    entry.refs.len()
                }
                None => 0,
            };
            if remaining == 0
                && let Some((_, entry)) = self.shared.blocks.remove(&key)
            {
                *self.shared.usage.entry(entry.creator).or_insert(0) -= entry.buf.len() as i64;
                tracing::debug!(%id, "block has no references left; deleted");
            }
            live_counts.insert(*id, remaining);
        }
        Ok(live_counts)
    }

    async fn archive_block_references(
        &self,
        tlf: TlfId,
        contexts: &BlockContextMap,
    ) -> Result<BTreeMap<BlockId, usize>> {
        let mut live_counts = BTreeMap::new();
        for (id, ctxs) in contexts {
            let mut entry = self
                .shared
                .blocks
                .get_mut(&(tlf, *id))
                .ok_or(Error::BlockNonExistent(*id))?;
            for ctx in ctxs {
                match entry.refs.get_mut(&ctx.ref_nonce) {
                    Some((existing, status)) if existing == ctx => *status = RefStatus::Archived,
                    Some(_) => {
                        return Err(Error::BlockMismatch {
                            id: *id,
                            field: "context",
                        });
                    }
                    None => return Err(Error::BlockNonExistent(*id)),
                }
            }
            let live = entry
                .refs
                .values()
                .filter(|(_, s)| *s == RefStatus::Live)
                .count();
            live_counts.insert(*id, live);
        }
        Ok(live_counts)
    }

    async fn get_user_quota_info(&self) -> Result<UserQuotaInfo> {
        let archive_bytes = self
            .shared
            .blocks
            .iter()
            .filter(|e| {
                e.creator == self.user
                    && e.refs.values().all(|(_, s)| *s == RefStatus::Archived)
            })
            .map(|e| e.buf.len() as i64)
            .sum();
        Ok(UserQuotaInfo {
            usage_bytes: self.usage_of(self.user),
            archive_bytes,
            limit_bytes: self.shared.limit_bytes.load(Ordering::SeqCst),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tlfs_core::crypto::{
        make_block_ref_nonce, make_permanent_block_id, make_random_block_crypt_key_server_half,
    };

    fn setup() -> (MemoryBlockServer, TlfId, UserId) {
        let user = UserId::from_bytes([1; 16]);
        let server = MemoryBlockServer::new(1 << 20).for_user(user);
        (server, TlfId::from_bytes([2; 16], false), user)
    }

    #[tokio::test]
    async fn test_put_is_idempotent_and_rejects_changes() {
        let (server, tlf, user) = setup();
        let buf = Bytes::from_static(b"encrypted bytes");
        let id = make_permanent_block_id(&buf);
        let ctx = BlockContext::first_ref(user);
        let half = make_random_block_crypt_key_server_half();

        server.put(tlf, id, &ctx, buf.clone(), half.clone()).await.unwrap();
        server.put(tlf, id, &ctx, buf.clone(), half.clone()).await.unwrap();
        assert_eq!(server.ref_counts(tlf, id), (1, 0));
        assert_eq!(server.get_user_quota_info().await.unwrap().usage_bytes, buf.len() as i64);

        let other_half = make_random_block_crypt_key_server_half();
        let err = server.put(tlf, id, &ctx, buf.clone(), other_half).await.unwrap_err();
        assert!(matches!(err, Error::BlockMismatch { field: "server half", .. }));

        let other_ctx = BlockContext::first_ref(UserId::from_bytes([9; 16]));
        let err = server.put(tlf, id, &other_ctx, buf.clone(), half.clone()).await.unwrap_err();
        assert!(matches!(err, Error::BlockMismatch { field: "context", .. }));

        let err = server
            .put(tlf, id, &ctx, Bytes::from_static(b"other"), half)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Integrity(_)));
    }

    #[tokio::test]
    async fn test_add_reference_needs_existing_block() {
        let (server, tlf, user) = setup();
        let id = make_permanent_block_id(b"nothing here");
        let ctx = BlockContext::first_ref(user);
        let err = server.add_block_reference(tlf, id, &ctx).await.unwrap_err();
        assert!(matches!(err, Error::Server(_)));

        let mut ctx = ctx;
        ctx.ref_nonce = make_block_ref_nonce();
        let err = server.add_block_reference(tlf, id, &ctx).await.unwrap_err();
        assert!(matches!(err, Error::BlockNonExistent(_)));
    }

    #[tokio::test]
    async fn test_over_quota_is_informational_then_throttled() {
        let (server, tlf, user) = setup();
        server.set_limit_bytes(100);
        let ctx = BlockContext::first_ref(user);

        let first = Bytes::from(vec![1u8; 105]);
        let err = server
            .put(
                tlf,
                make_permanent_block_id(&first),
                &ctx,
                first.clone(),
                make_random_block_crypt_key_server_half(),
            )
            .await
            .unwrap_err();
        assert!(err.is_informational_quota());
        assert!(server.contains(tlf, make_permanent_block_id(&first)));

        let second = Bytes::from(vec![2u8; 50]);
        let err = server
            .put(
                tlf,
                make_permanent_block_id(&second),
                &ctx,
                second.clone(),
                make_random_block_crypt_key_server_half(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::OverQuota { throttled: true, .. }));
        assert!(!server.contains(tlf, make_permanent_block_id(&second)));
    }

    #[tokio::test]
    async fn test_unbounded_limit_accepts_puts() {
        let user = UserId::from_bytes([1; 16]);
        let server = MemoryBlockServer::new(i64::MAX).for_user(user);
        let tlf = TlfId::from_bytes([2; 16], false);
        let ctx = BlockContext::first_ref(user);

        let buf = Bytes::from_static(b"any block at all");
        let id = make_permanent_block_id(&buf);
        server
            .put(tlf, id, &ctx, buf.clone(), make_random_block_crypt_key_server_half())
            .await
            .unwrap();
        assert!(server.contains(tlf, id));
        assert_eq!(server.get_user_quota_info().await.unwrap().usage_bytes, buf.len() as i64);
    }
}
