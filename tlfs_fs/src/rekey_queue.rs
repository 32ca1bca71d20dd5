//! Engine-wide queue of pending folder rekeys.
//!
//! Each folder has one status channel. Enqueueing a folder that is already
//! pending only hands out another receiver. A rekey blocked on user
//! interaction is retried with a paper-key prompt after
//! `rekey_with_prompt_wait`.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tlfs_core::{CancellationToken, Error, Result, TlfId};
use tlfs_keys::RekeyOutcome;
use tokio::sync::{mpsc, watch};

use crate::folder::FolderBranchOps;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RekeyStatus {
    Idle,
    Pending,
    /// No device of this user can unlock the folder; waiting to prompt
    /// for a paper key.
    AwaitingInteraction,
    Done(RekeyOutcome),
    Failed(String),
}

impl RekeyStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, RekeyStatus::Done(_) | RekeyStatus::Failed(_))
    }
}

type Statuses = Arc<Mutex<HashMap<TlfId, watch::Sender<RekeyStatus>>>>;

#[derive(Debug)]
pub(crate) struct RekeyQueue {
    tx: mpsc::UnboundedSender<Arc<FolderBranchOps>>,
    statuses: Statuses,
}

impl RekeyQueue {
    /// Starts the worker; it stops with `cancel`.
    pub fn new(cancel: CancellationToken, prompt_wait: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let statuses: Statuses = Arc::default();
        tokio::spawn(run(rx, statuses.clone(), cancel, prompt_wait));
        Self { tx, statuses }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<TlfId, watch::Sender<RekeyStatus>>> {
        self.statuses.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues a rekey of `folder` unless one is already waiting.
    pub fn enqueue(&self, folder: Arc<FolderBranchOps>) -> watch::Receiver<RekeyStatus> {
        let mut statuses = self.lock();
        let status = statuses
            .entry(folder.tlf)
            .or_insert_with(|| watch::channel(RekeyStatus::Idle).0);
        let rx = status.subscribe();
        if matches!(
            *status.borrow(),
            RekeyStatus::Pending | RekeyStatus::AwaitingInteraction
        ) {
            return rx;
        }
        status.send_replace(RekeyStatus::Pending);
        let tlf = folder.tlf;
        if self.tx.send(folder).is_err() {
            tracing::warn!(%tlf, "rekey queue is stopped");
            status.send_replace(RekeyStatus::Failed(Error::Shutdown.to_string()));
        }
        rx
    }

    pub fn status(&self, tlf: TlfId) -> watch::Receiver<RekeyStatus> {
        self.lock()
            .entry(tlf)
            .or_insert_with(|| watch::channel(RekeyStatus::Idle).0)
            .subscribe()
    }
}

fn set_status(statuses: &Statuses, tlf: TlfId, status: RekeyStatus) {
    let statuses = statuses.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(tx) = statuses.get(&tlf) {
        tx.send_replace(status);
    }
}

fn finished(statuses: &Statuses, tlf: TlfId, res: Result<RekeyOutcome>) {
    let status = match res {
        Ok(outcome) => RekeyStatus::Done(outcome),
        Err(e) => {
            tracing::error!(%tlf, "rekey failed: {e}");
            RekeyStatus::Failed(e.to_string())
        }
    };
    set_status(statuses, tlf, status);
}

async fn run(
    mut rx: mpsc::UnboundedReceiver<Arc<FolderBranchOps>>,
    statuses: Statuses,
    cancel: CancellationToken,
    prompt_wait: Duration,
) {
    loop {
        let folder = tokio::select! {
            _ = cancel.cancelled() => return,
            folder = rx.recv() => match folder {
                Some(folder) => folder,
                None => return,
            },
        };
        let tlf = folder.tlf;
        match folder.rekey(false).await {
            Err(Error::RekeyNeedsInteraction(_)) => {
                tracing::debug!(%tlf, ?prompt_wait, "rekey needs a paper key; prompting later");
                set_status(&statuses, tlf, RekeyStatus::AwaitingInteraction);
                let statuses = statuses.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            let status = RekeyStatus::Failed(Error::Shutdown.to_string());
                            set_status(&statuses, tlf, status);
                            return;
                        }
                        _ = tokio::time::sleep(prompt_wait) => {}
                    }
                    let res = folder.rekey(true).await;
                    finished(&statuses, tlf, res);
                });
            }
            res => finished(&statuses, tlf, res),
        }
    }
}
