#![allow(dead_code)]

use std::sync::Arc;
use tlfs_core::{
    CancellationToken, EngineConfig, UserId,
    clock::TestClock,
    crypto::DeviceCrypto,
    md::BareTlfHandle,
};
use tlfs_fs::{Engine, EngineServices, Node};
use tlfs_server_memory::{MemoryBlockServer, MemoryKeyServer, MemoryMdServer, UserDirectory};

pub const START_MS: i64 = 1_700_000_000_000;

/// One user, any number of devices, and the servers they share.
pub struct World {
    pub dir: UserDirectory,
    pub md: MemoryMdServer,
    pub blocks: MemoryBlockServer,
    pub keys: MemoryKeyServer,
    pub clock: Arc<TestClock>,
    pub alice: UserId,
    pub handle: BareTlfHandle,
}

/// Foreground-only engines with small blocks, so tests drive every sync
/// and update themselves.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        background_flushes: false,
        background_updates: false,
        max_block_size: 64,
        ..EngineConfig::default()
    }
}

impl World {
    pub fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = UserDirectory::new();
        let alice = dir.add_user("alice");
        Self {
            md: MemoryMdServer::new(dir.clone()),
            blocks: MemoryBlockServer::new(i64::MAX),
            keys: MemoryKeyServer::new(),
            clock: Arc::new(TestClock::new(START_MS)),
            handle: BareTlfHandle::new(vec![alice], vec![]),
            dir,
            alice,
        }
    }

    /// Registers a new device for alice without starting an engine on it.
    pub fn add_device(&self, name: &str) -> Arc<DeviceCrypto> {
        let crypto = Arc::new(DeviceCrypto::generate());
        self.dir.add_device(self.alice, &crypto, name).unwrap();
        crypto
    }

    pub fn engine(&self, device: &Arc<DeviceCrypto>) -> Engine {
        self.engine_with(device, test_config())
    }

    pub fn engine_with(&self, device: &Arc<DeviceCrypto>, config: EngineConfig) -> Engine {
        let kbpki = Arc::new(self.dir.session(self.alice, device.kid()).unwrap());
        let services = EngineServices::new(
            kbpki,
            Arc::new(self.md.for_device(device.kid())),
            Arc::new(self.blocks.for_user(self.alice)),
            Arc::new(self.keys.clone()),
            device.clone(),
        )
        .with_clock(self.clock.clone());
        Engine::new(config, services)
    }

    /// A new device and an engine running on it.
    pub fn device(&self, name: &str) -> Engine {
        let crypto = self.add_device(name);
        self.engine(&crypto)
    }
}

pub async fn root(engine: &Engine, world: &World) -> Node {
    engine
        .get_or_create_root_node(&CancellationToken::new(), &world.handle)
        .await
        .unwrap()
}

pub async fn write_file(engine: &Engine, dir: Node, name: &str, data: &[u8]) -> Node {
    let cancel = CancellationToken::new();
    let (file, _) = engine.create_file(&cancel, dir, name, false).await.unwrap();
    engine.write(&cancel, file, data, 0).await.unwrap();
    engine.sync(&cancel, file).await.unwrap();
    file
}

pub async fn read_all(engine: &Engine, file: Node) -> Vec<u8> {
    let cancel = CancellationToken::new();
    let size = engine.stat(&cancel, file).await.unwrap().size;
    engine.read(&cancel, file, 0, size).await.unwrap()
}

pub async fn names(engine: &Engine, dir: Node) -> Vec<String> {
    engine
        .get_dir_children(&CancellationToken::new(), dir)
        .await
        .unwrap()
        .into_keys()
        .collect()
}
