//! Per-folder background tasks: the periodic flusher, the update listener
//! and the conflict resolver. Each runs until the folder's token fires.

use std::sync::Arc;
use tlfs_core::{MetadataRevision, Result};

use super::FolderBranchOps;

/// Failed resolutions back off from one flush period up to this many.
const MAX_CR_BACKOFF_FACTOR: u32 = 32;

impl FolderBranchOps {
    pub(crate) fn start_background(self: &Arc<Self>) {
        let config = &self.ctx.config;
        if config.background_flushes {
            tokio::spawn(self.clone().run_flusher());
        }
        if config.background_updates {
            tokio::spawn(self.clone().run_update_listener());
            tokio::spawn(self.clone().run_conflict_resolver());
        }
        tracing::debug!(
            tlf = %self.tlf,
            flushes = config.background_flushes,
            updates = config.background_updates,
            "started folder background tasks"
        );
    }

    async fn run_flusher(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.ctx.config.flush_period());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.flush_wake.notified() => {}
            }
            if self.state().dirty.is_empty() {
                continue;
            }
            if let Err(e) = self.sync_all().await {
                tracing::warn!(tlf = %self.tlf, "background flush failed: {e}");
            }
        }
        tracing::debug!(tlf = %self.tlf, "flusher stopped");
    }

    async fn run_update_listener(self: Arc<Self>) {
        let mut seen = self.state().latest_merged.revision();
        loop {
            let res = tokio::select! {
                _ = self.cancel.cancelled() => break,
                res = self.wait_for_update(&mut seen) => res,
            };
            if let Err(e) = res {
                if e.is_cancelled() {
                    break;
                }
                tracing::warn!(tlf = %self.tlf, "update listener: {e}");
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.ctx.config.flush_period()) => {}
                }
            }
        }
        tracing::debug!(tlf = %self.tlf, "update listener stopped");
    }

    /// Waits for the server to report a merged revision past `seen`, then
    /// applies it. On an unmerged branch the folder's own merged head does
    /// not move until resolution lands, so `seen` tracks the server's.
    async fn wait_for_update(&self, seen: &mut MetadataRevision) -> Result<()> {
        let current = (*seen).max(self.state().latest_merged.revision());
        let rx = self
            .ctx
            .md_server
            .register_for_update(self.tlf, current)
            .await?;
        rx.await.map_err(|_| tlfs_core::Error::Shutdown)??;
        if self.branch().is_unmerged() {
            if let Some(head) = self.ctx.md.get_for_tlf(self.tlf).await? {
                *seen = head.revision();
            }
            self.cr_wake.notify_one();
            return Ok(());
        }
        self.get_and_apply_updates().await?;
        *seen = self.state().latest_merged.revision();
        Ok(())
    }

    async fn run_conflict_resolver(self: Arc<Self>) {
        let base = self.ctx.config.flush_period();
        let mut backoff = base;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.cr_wake.notified() => {}
            }
            match self.resolve_conflicts().await {
                Ok(()) => backoff = base,
                Err(e) => {
                    tracing::warn!(tlf = %self.tlf, ?backoff, "conflict resolution failed: {e}");
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(base * MAX_CR_BACKOFF_FACTOR);
                    if self.branch().is_unmerged() {
                        self.cr_wake.notify_one();
                    }
                }
            }
        }
        tracing::debug!(tlf = %self.tlf, "conflict resolver stopped");
    }
}
