//! The engine: one per logged-in device, holding every open folder.
//!
//! Remote-sync calls (mutations, attributes, sync, rekey) run under
//! [`run_with_grace`] so an effect that reached the server is not reported
//! as cancelled. Remote-access calls (reads, lookups, listings) stop as soon
//! as the caller's token fires.

use std::{
    collections::{BTreeMap, HashMap},
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tlfs_core::{
    Block, BlockContext, BlockInfo, BlockPointer, BranchId, CancellationToken, DirBlock, DirEntry,
    EngineConfig, EntryInfo, EntryType, Error, Result, TlfId,
    cancel::{run_cancellable, run_with_grace},
    md::{BareRootMetadata, BareTlfHandle, BlockChanges, PrivateMetadata},
};
use tlfs_keys::RekeyOutcome;
use tlfs_md::{ImmutableRootMetadata, RootMetadata};
use tokio::sync::{oneshot, watch};

use crate::{
    EngineContext, EngineServices, Node, NodeMetadata, Observer,
    folder::FolderBranchOps,
    rekey_queue::{RekeyQueue, RekeyStatus},
    status::{EngineStatus, FolderBranchStatus},
};

#[derive(Debug)]
pub struct Engine {
    ctx: Arc<EngineContext>,
    folders: Mutex<HashMap<TlfId, Arc<FolderBranchOps>>>,
    rekeys: RekeyQueue,
    cancel: CancellationToken,
}

impl Engine {
    /// Builds the engine. Must run inside a tokio runtime: the rekey queue
    /// starts its worker here.
    pub fn new(config: EngineConfig, services: EngineServices) -> Self {
        let cancel = CancellationToken::new();
        let rekeys = RekeyQueue::new(cancel.child_token(), config.rekey_with_prompt_wait());
        Self {
            ctx: EngineContext::new(config, services),
            folders: Mutex::new(HashMap::new()),
            rekeys,
            cancel,
        }
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    fn folders(&self) -> MutexGuard<'_, HashMap<TlfId, Arc<FolderBranchOps>>> {
        self.folders.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn folder(&self, tlf: TlfId) -> Result<Arc<FolderBranchOps>> {
        self.folders()
            .get(&tlf)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("folder {tlf} is not open")))
    }

    async fn sync_call<T>(
        &self,
        cancel: &CancellationToken,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        run_with_grace(cancel, self.ctx.config.delayed_cancellation_grace(), fut).await
    }

    /// Opens the folder named by `handle`, writing its first revision when
    /// `create` is set and it has none.
    async fn open(&self, handle: &BareTlfHandle, create: bool) -> Result<Arc<FolderBranchOps>> {
        let (tlf, merged) = self.ctx.md.get_for_handle(handle).await?;
        if let Some(folder) = self.folders().get(&tlf) {
            return Ok(folder.clone());
        }
        let merged = match merged {
            Some(md) => md,
            None if create => self.create_first_revision(tlf, handle).await?,
            None => return Err(Error::NotFound(format!("folder {tlf} has no revisions"))),
        };
        let head = match self
            .ctx
            .md
            .get_unmerged_for_tlf(tlf, BranchId::NULL)
            .await?
        {
            Some(unmerged) => {
                tracing::info!(%tlf, branch = %unmerged.branch_id(), "resuming unmerged branch");
                unmerged
            }
            None => merged.clone(),
        };

        let folder = {
            let mut folders = self.folders();
            if let Some(folder) = folders.get(&tlf) {
                return Ok(folder.clone());
            }
            let folder = FolderBranchOps::new(
                self.ctx.clone(),
                handle.clone(),
                head,
                merged,
                self.cancel.child_token(),
            );
            folders.insert(tlf, folder.clone());
            folder
        };
        folder.start_background();
        if folder.branch().is_unmerged() {
            folder.cr_wake.notify_one();
        }
        tracing::debug!(%tlf, rev = %folder.head().revision(), "opened folder");
        Ok(folder)
    }

    async fn create_first_revision(
        &self,
        tlf: TlfId,
        handle: &BareTlfHandle,
    ) -> Result<ImmutableRootMetadata> {
        let uid = self.ctx.current_uid().await?;
        let now = self.ctx.now_ms();
        let mut bare = BareRootMetadata::new(tlf, handle.clone(), self.ctx.config.metadata_version);
        self.ctx.keys.rekey(&mut bare, false).await?;

        let block = Block::Dir(DirBlock::default());
        let ready = self.ctx.blocks.ready(&bare, &block).await?;
        let ptr = BlockPointer::new(ready.id, bare.latest_key_gen(), BlockContext::first_ref(uid));
        let info = BlockInfo {
            ptr,
            encoded_size: ready.encoded_size(),
        };
        self.ctx.blocks.put(tlf, &ptr, ready).await?;

        let dir = DirEntry {
            info,
            entry: EntryInfo {
                typ: EntryType::Dir,
                size: u64::from(info.encoded_size),
                sym_path: None,
                mtime: now,
                ctime: now,
            },
        };
        let mut md = RootMetadata::new(
            bare,
            PrivateMetadata {
                dir,
                changes: BlockChanges::default(),
            },
        );
        md.add_ref_bytes(u64::from(info.encoded_size));
        match self.ctx.md.put(md).await {
            Ok(imd) => {
                tracing::info!(%tlf, "created folder");
                Ok(imd)
            }
            Err(e) if e.is_conflict() => {
                tracing::debug!(%tlf, "folder was created concurrently");
                self.ctx
                    .md
                    .get_for_tlf(tlf)
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("merged head of {tlf}")))
            }
            Err(e) => Err(e),
        }
    }

    /// The root of the folder named by `handle`, creating the folder on
    /// first use. A device without keys for it gets
    /// [`Error::RekeyNeedsInteraction`] and a queued rekey.
    pub async fn get_or_create_root_node(
        &self,
        cancel: &CancellationToken,
        handle: &BareTlfHandle,
    ) -> Result<Node> {
        let folder = self.sync_call(cancel, self.open(handle, true)).await?;
        self.root_of(folder)
    }

    /// Like [`Self::get_or_create_root_node`] but fails with
    /// [`Error::NotFound`] for a folder that was never written.
    pub async fn get_root_node(
        &self,
        cancel: &CancellationToken,
        handle: &BareTlfHandle,
    ) -> Result<Node> {
        let folder = run_cancellable(cancel, self.open(handle, false)).await?;
        self.root_of(folder)
    }

    fn root_of(&self, folder: Arc<FolderBranchOps>) -> Result<Node> {
        match folder.root_node() {
            Err(Error::NoKey { tlf, .. }) => {
                tracing::info!(%tlf, "no key for folder; queueing a rekey");
                self.rekeys.enqueue(folder);
                Err(Error::RekeyNeedsInteraction(tlf))
            }
            res => res,
        }
    }

    pub async fn get_dir_children(
        &self,
        cancel: &CancellationToken,
        dir: Node,
    ) -> Result<BTreeMap<String, EntryInfo>> {
        let folder = self.folder(dir.tlf)?;
        run_cancellable(cancel, folder.get_dir_children(dir.id)).await
    }

    /// The entry `name` in `dir`, with its node unless it is a symlink.
    pub async fn lookup(
        &self,
        cancel: &CancellationToken,
        dir: Node,
        name: &str,
    ) -> Result<(Option<Node>, EntryInfo)> {
        let folder = self.folder(dir.tlf)?;
        run_cancellable(cancel, folder.lookup(dir.id, name)).await
    }

    pub async fn stat(&self, cancel: &CancellationToken, node: Node) -> Result<EntryInfo> {
        let folder = self.folder(node.tlf)?;
        run_cancellable(cancel, folder.stat(node.id)).await
    }

    async fn create(
        &self,
        cancel: &CancellationToken,
        dir: Node,
        name: &str,
        typ: EntryType,
    ) -> Result<(Node, EntryInfo)> {
        let folder = self.folder(dir.tlf)?;
        let (node, info) = self
            .sync_call(cancel, folder.create_entry(dir.id, name, typ, None))
            .await?;
        let node = node.ok_or_else(|| Error::Integrity(format!("{name} was created without a node")))?;
        Ok((node, info))
    }

    pub async fn create_dir(
        &self,
        cancel: &CancellationToken,
        dir: Node,
        name: &str,
    ) -> Result<(Node, EntryInfo)> {
        self.create(cancel, dir, name, EntryType::Dir).await
    }

    pub async fn create_file(
        &self,
        cancel: &CancellationToken,
        dir: Node,
        name: &str,
        exec: bool,
    ) -> Result<(Node, EntryInfo)> {
        let typ = if exec { EntryType::Exec } else { EntryType::File };
        self.create(cancel, dir, name, typ).await
    }

    pub async fn create_link(
        &self,
        cancel: &CancellationToken,
        dir: Node,
        name: &str,
        target: &str,
    ) -> Result<EntryInfo> {
        let folder = self.folder(dir.tlf)?;
        let (_, info) = self
            .sync_call(
                cancel,
                folder.create_entry(dir.id, name, EntryType::Sym, Some(target)),
            )
            .await?;
        Ok(info)
    }

    pub async fn remove_dir(&self, cancel: &CancellationToken, dir: Node, name: &str) -> Result<()> {
        let folder = self.folder(dir.tlf)?;
        self.sync_call(cancel, folder.remove(dir.id, name, true)).await
    }

    pub async fn remove_entry(
        &self,
        cancel: &CancellationToken,
        dir: Node,
        name: &str,
    ) -> Result<()> {
        let folder = self.folder(dir.tlf)?;
        self.sync_call(cancel, folder.remove(dir.id, name, false)).await
    }

    /// Renames within one folder.
    pub async fn rename(
        &self,
        cancel: &CancellationToken,
        old_dir: Node,
        old_name: &str,
        new_dir: Node,
        new_name: &str,
    ) -> Result<()> {
        if old_dir.tlf != new_dir.tlf {
            return Err(Error::InvalidName(format!(
                "{new_name}: cannot rename across folders"
            )));
        }
        let folder = self.folder(old_dir.tlf)?;
        self.sync_call(
            cancel,
            folder.rename(old_dir.id, old_name, new_dir.id, new_name),
        )
        .await
    }

    pub async fn read(
        &self,
        cancel: &CancellationToken,
        file: Node,
        off: u64,
        len: u64,
    ) -> Result<Vec<u8>> {
        let folder = self.folder(file.tlf)?;
        run_cancellable(cancel, folder.read(file.id, off, len)).await
    }

    /// Buffers a write; it reaches the server on the next sync or flush.
    pub async fn write(
        &self,
        cancel: &CancellationToken,
        file: Node,
        data: &[u8],
        off: u64,
    ) -> Result<()> {
        let folder = self.folder(file.tlf)?;
        folder.write(cancel, file.id, data, off).await
    }

    pub async fn truncate(&self, cancel: &CancellationToken, file: Node, size: u64) -> Result<()> {
        let folder = self.folder(file.tlf)?;
        folder.truncate(cancel, file.id, size).await
    }

    pub async fn set_ex(&self, cancel: &CancellationToken, file: Node, ex: bool) -> Result<()> {
        let folder = self.folder(file.tlf)?;
        self.sync_call(cancel, folder.set_ex(file.id, ex)).await
    }

    pub async fn set_mtime(&self, cancel: &CancellationToken, node: Node, mtime: i64) -> Result<()> {
        let folder = self.folder(node.tlf)?;
        self.sync_call(cancel, folder.set_mtime(node.id, mtime)).await
    }

    pub async fn sync(&self, cancel: &CancellationToken, file: Node) -> Result<()> {
        let folder = self.folder(file.tlf)?;
        self.sync_call(cancel, folder.sync(file.id)).await
    }

    /// The folder's status and a receiver that fires on its next change.
    pub fn folder_status(&self, tlf: TlfId) -> Result<(FolderBranchStatus, oneshot::Receiver<()>)> {
        let folder = self.folder(tlf)?;
        let changed = folder.subscribe_status();
        Ok((folder.status(), changed))
    }

    /// Engine-wide status and a receiver that fires on the next change in
    /// any folder.
    pub async fn status(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(EngineStatus, oneshot::Receiver<()>)> {
        let changed = self.ctx.status.subscribe();
        let session = run_cancellable(cancel, self.ctx.session()).await?;
        let quota = match self.ctx.block_server.get_user_quota_info().await {
            Ok(quota) => Some(quota),
            Err(e) => {
                tracing::warn!("quota info unavailable: {e}");
                None
            }
        };
        let folders: Vec<Arc<FolderBranchOps>> = self.folders().values().cloned().collect();
        let mut tlfs: Vec<TlfId> = folders.iter().map(|f| f.tlf).collect();
        let mut staged: Vec<TlfId> = folders
            .iter()
            .filter(|f| f.branch().is_unmerged())
            .map(|f| f.tlf)
            .collect();
        tlfs.sort();
        staged.sort();
        let status = EngineStatus {
            user: session.name,
            device: session.device_name,
            dirty: self.ctx.dirty.stats(),
            quota,
            folders: tlfs,
            staged_folders: staged,
        };
        Ok((status, changed))
    }

    /// Drops this device's unmerged branch and unsynced writes.
    pub async fn unstage_for_testing(&self, cancel: &CancellationToken, tlf: TlfId) -> Result<()> {
        let folder = self.folder(tlf)?;
        self.sync_call(cancel, folder.unstage()).await
    }

    pub async fn rekey(&self, cancel: &CancellationToken, tlf: TlfId) -> Result<RekeyOutcome> {
        let folder = self.folder(tlf)?;
        self.sync_call(cancel, folder.rekey(false)).await
    }

    /// Queues a background rekey; the receiver tracks its progress.
    pub fn request_rekey(&self, tlf: TlfId) -> Result<watch::Receiver<RekeyStatus>> {
        Ok(self.rekeys.enqueue(self.folder(tlf)?))
    }

    pub fn rekey_status(&self, tlf: TlfId) -> watch::Receiver<RekeyStatus> {
        self.rekeys.status(tlf)
    }

    /// Syncs, then fetches and applies (or resolves) everything the server
    /// has for the folder.
    pub async fn sync_from_server_for_testing(
        &self,
        cancel: &CancellationToken,
        tlf: TlfId,
    ) -> Result<()> {
        let folder = self.folder(tlf)?;
        self.sync_call(cancel, folder.sync_from_server()).await
    }

    pub async fn get_node_metadata(
        &self,
        cancel: &CancellationToken,
        node: Node,
    ) -> Result<NodeMetadata> {
        let folder = self.folder(node.tlf)?;
        run_cancellable(cancel, folder.get_node_metadata(node.id)).await
    }

    pub fn register_for_changes(&self, tlf: TlfId, observer: Arc<dyn Observer>) -> Result<()> {
        self.folder(tlf)?.observers.register(observer);
        Ok(())
    }

    pub fn unregister_for_changes(&self, tlf: TlfId, observer: &Arc<dyn Observer>) -> Result<()> {
        self.folder(tlf)?.observers.unregister(observer);
        Ok(())
    }

    /// Stops every background task. Unsynced writes are reported, not
    /// flushed.
    pub fn shutdown(&self) -> Result<()> {
        self.cancel.cancel();
        let folders = self.folders().len();
        tracing::debug!(folders, "engine shutting down");
        self.ctx.dirty.shutdown()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
