use tlfs_core::{Error, Result, ops::{Op, RekeyOp}};
use tlfs_keys::RekeyOutcome;

use super::FolderBranchOps;

impl FolderBranchOps {
    /// Brings the head's key bundles up to date with the writers' and
    /// readers' devices. `prompt_paper` lets the key manager unlock with a
    /// paper key when no device of this user can.
    pub async fn rekey(&self, prompt_paper: bool) -> Result<RekeyOutcome> {
        let _lock = self.write_lock.lock().await;
        loop {
            if self.branch().is_unmerged() {
                return Err(Error::Unmerged(self.tlf));
            }
            let head = self.head();
            let mut md = head.successor();
            let outcome = self.ctx.keys.rekey(&mut md.bare, prompt_paper).await?;
            if !outcome.is_changed() {
                return Ok(outcome);
            }
            if !md.is_readable() {
                self.ctx
                    .md
                    .unlock(&mut md, head.bare.latest_key_gen())
                    .await?;
            }
            md.add_op(Op::Rekey(RekeyOp::default()))?;
            match self.ctx.md.put(md).await {
                Ok(imd) => {
                    tracing::info!(tlf = %self.tlf, rev = %imd.revision(), ?outcome, "rekeyed folder");
                    {
                        let mut state = self.state_mut();
                        state.head = imd.clone();
                        state.latest_merged = imd;
                    }
                    self.signal_status();
                    return Ok(outcome);
                }
                Err(e) if e.is_conflict() => {
                    tracing::debug!(tlf = %self.tlf, "rekey lost the race; refreshing");
                    self.get_and_apply_updates_locked().await?;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
