//! The engine context: every service handle the engine uses, built once and
//! passed down explicitly.

use std::sync::Arc;
use tlfs_blocks::{BlockCache, BlockOps, DirtyBlockCache};
use tlfs_core::{
    EngineConfig, Result, UserId,
    clock::{Clock, SystemClock},
    crypto::DeviceCrypto,
    server::{BlockServer, Kbpki, KeyServer, MdServer, SessionInfo},
};
use tlfs_keys::KeyManager;
use tlfs_md::{MdCache, MdOps};

use crate::{
    cr::{ConflictRenamer, WriterDateRenamer},
    status::StatusTracker,
};

/// Outside services the engine is built from.
#[derive(Debug, Clone)]
pub struct EngineServices {
    pub kbpki: Arc<dyn Kbpki>,
    pub md_server: Arc<dyn MdServer>,
    pub block_server: Arc<dyn BlockServer>,
    pub key_server: Arc<dyn KeyServer>,
    pub device: Arc<DeviceCrypto>,
    pub clock: Arc<dyn Clock>,
    pub renamer: Arc<dyn ConflictRenamer>,
}

impl EngineServices {
    /// Services with the system clock and the default conflict renamer.
    pub fn new(
        kbpki: Arc<dyn Kbpki>,
        md_server: Arc<dyn MdServer>,
        block_server: Arc<dyn BlockServer>,
        key_server: Arc<dyn KeyServer>,
        device: Arc<DeviceCrypto>,
    ) -> Self {
        Self {
            kbpki,
            md_server,
            block_server,
            key_server,
            device,
            clock: Arc::new(SystemClock),
            renamer: Arc::new(WriterDateRenamer),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_renamer(mut self, renamer: Arc<dyn ConflictRenamer>) -> Self {
        self.renamer = renamer;
        self
    }
}

/// Shared state of one engine instance. There are no globals: every folder
/// and background task reaches its collaborators through this.
#[derive(Debug)]
pub struct EngineContext {
    pub config: EngineConfig,
    pub kbpki: Arc<dyn Kbpki>,
    pub md_server: Arc<dyn MdServer>,
    pub block_server: Arc<dyn BlockServer>,
    pub clock: Arc<dyn Clock>,
    pub keys: Arc<KeyManager>,
    pub blocks: BlockOps,
    pub dirty: Arc<DirtyBlockCache>,
    pub md: MdOps,
    pub renamer: Arc<dyn ConflictRenamer>,
    /// Fires on any folder's status change.
    pub(crate) status: StatusTracker,
}

impl EngineContext {
    pub fn new(config: EngineConfig, services: EngineServices) -> Arc<Self> {
        let keys = Arc::new(KeyManager::new(
            services.kbpki.clone(),
            services.key_server,
            services.device.clone(),
            config.cache.key_cache_entries,
        ));
        let blocks = BlockOps::new(
            services.block_server.clone(),
            keys.clone(),
            Arc::new(BlockCache::new(
                config.cache.block_cache_entries,
                config.cache.known_ptr_entries,
            )),
        );
        let md = MdOps::new(
            services.md_server.clone(),
            services.kbpki.clone(),
            keys.clone(),
            services.device,
            Arc::new(MdCache::new(config.cache.md_cache_entries)),
            services.clock.clone(),
        );
        Arc::new(Self {
            dirty: Arc::new(DirtyBlockCache::new(&config.dirty_buffer)),
            config,
            kbpki: services.kbpki,
            md_server: services.md_server,
            block_server: services.block_server,
            clock: services.clock,
            keys,
            blocks,
            md,
            renamer: services.renamer,
            status: StatusTracker::default(),
        })
    }

    pub async fn session(&self) -> Result<SessionInfo> {
        self.kbpki.current_session().await
    }

    pub async fn current_uid(&self) -> Result<UserId> {
        Ok(self.session().await?.uid)
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }
}
