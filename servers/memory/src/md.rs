use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio::sync::oneshot;
use tlfs_core::{
    BranchId, Error, Kid, MdId, MetadataRevision, Result, TlfId,
    crypto::{make_random_tlf_id, verify},
    md::{BareTlfHandle, MergeStatus, RootMetadataSigned},
    server::{MdServer, UpdateNotification},
};

use crate::UserDirectory;

struct Observer {
    device: Kid,
    current: MetadataRevision,
    tx: oneshot::Sender<Result<()>>,
}

#[derive(Default)]
struct TlfState {
    handle: BareTlfHandle,
    merged: Vec<RootMetadataSigned>,
    branches: HashMap<BranchId, Vec<RootMetadataSigned>>,
    device_branches: HashMap<Kid, BranchId>,
    observers: Vec<Observer>,
    truncate_holder: Option<Kid>,
}

impl TlfState {
    fn head(&self, bid: BranchId) -> Option<&RootMetadataSigned> {
        if bid.is_null() {
            self.merged.last()
        } else {
            self.branches.get(&bid).and_then(|b| b.last())
        }
    }

    fn history(&self, bid: BranchId) -> &[RootMetadataSigned] {
        if bid.is_null() {
            &self.merged
        } else {
            self.branches.get(&bid).map(Vec::as_slice).unwrap_or(&[])
        }
    }

    fn notify(&mut self, revision: MetadataRevision, from: Kid) {
        let (fire, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut self.observers)
            .into_iter()
            .partition(|o| o.device != from && o.current < revision);
        self.observers = keep;
        for observer in fire {
            let _ = observer.tx.send(Ok(()));
        }
    }
}

#[derive(Default)]
struct State {
    tlfs: HashMap<TlfId, TlfState>,
    handles: HashMap<BareTlfHandle, TlfId>,
}

struct Shared {
    state: Mutex<State>,
    directory: UserDirectory,
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared").finish_non_exhaustive()
    }
}

/// Metadata server keeping every folder's history in memory.
///
/// The merged branch is a single chain: each put must carry the next
/// revision number and the id of the current head. Each device may hold
/// one unmerged branch, forked from some merged revision.
///
/// Handles created with [`MemoryMdServer::for_device`] share state and act
/// as separate device sessions.
#[derive(Debug, Clone)]
pub struct MemoryMdServer {
    shared: Arc<Shared>,
    device: Kid,
}

fn conflict(tlf: TlfId, reason: impl Into<String>) -> Error {
    Error::MdConflict {
        tlf,
        reason: reason.into(),
    }
}

impl MemoryMdServer {
    pub fn new(directory: UserDirectory) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                directory,
            }),
            device: Kid::from_bytes([0; 32]),
        }
    }

    pub fn for_device(&self, device: Kid) -> Self {
        Self {
            shared: self.shared.clone(),
            device,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Revision of the merged head, if the folder has any.
    pub fn merged_head_revision(&self, tlf: TlfId) -> Option<MetadataRevision> {
        self.lock()
            .tlfs
            .get(&tlf)
            .and_then(|s| s.merged.last())
            .map(|rmds| rmds.md.revision)
    }

    /// Number of unmerged branches currently held for `tlf`.
    pub fn branch_count(&self, tlf: TlfId) -> usize {
        self.lock().tlfs.get(&tlf).map_or(0, |s| s.branches.len())
    }

    /// Update registrations on `tlf` still waiting for a new revision.
    pub fn pending_update_registrations(&self, tlf: TlfId) -> usize {
        self.lock().tlfs.get(&tlf).map_or(0, |s| s.observers.len())
    }

    fn check_writer(&self, rmds: &RootMetadataSigned) -> Result<()> {
        let md = &rmds.md;
        verify(&md.signing_bytes()?, &rmds.sig)?;
        if !self
            .shared
            .directory
            .owns_verifying_key(md.last_modifying_user, &rmds.sig.verifying_key)
        {
            return Err(Error::BadSignature(format!(
                "key does not belong to {}",
                md.last_modifying_user
            )));
        }
        if !md.handle.is_writer(md.last_modifying_user) {
            return Err(Error::WriteAccess {
                user: md.last_modifying_user,
                tlf: md.tlf_id,
            });
        }
        Ok(())
    }

    fn device_branch(&self, state: &TlfState) -> BranchId {
        state
            .device_branches
            .get(&self.device)
            .copied()
            .unwrap_or(BranchId::NULL)
    }
}

#[async_trait::async_trait]
impl MdServer for MemoryMdServer {
    async fn get_for_handle(
        &self,
        handle: &BareTlfHandle,
        status: MergeStatus,
    ) -> Result<(TlfId, Option<RootMetadataSigned>)> {
        let mut state = self.lock();
        let tlf = match state.handles.get(handle) {
            Some(tlf) => *tlf,
            None => {
                let tlf = make_random_tlf_id(handle.is_public());
                state.handles.insert(handle.clone(), tlf);
                state.tlfs.insert(
                    tlf,
                    TlfState {
                        handle: handle.clone(),
                        ..Default::default()
                    },
                );
                tracing::debug!(%tlf, "created folder for new handle");
                tlf
            }
        };
        let head = state.tlfs.get(&tlf).and_then(|s| match status {
            MergeStatus::Merged => s.head(BranchId::NULL).cloned(),
            MergeStatus::Unmerged => {
                let bid = self.device_branch(s);
                if bid.is_null() {
                    None
                } else {
                    s.head(bid).cloned()
                }
            }
        });
        Ok((tlf, head))
    }

    async fn get_for_tlf(
        &self,
        tlf: TlfId,
        bid: BranchId,
        status: MergeStatus,
    ) -> Result<Option<RootMetadataSigned>> {
        let state = self.lock();
        let Some(s) = state.tlfs.get(&tlf) else {
            return Ok(None);
        };
        Ok(match status {
            MergeStatus::Merged => s.head(BranchId::NULL).cloned(),
            MergeStatus::Unmerged => {
                let bid = if bid.is_null() { self.device_branch(s) } else { bid };
                if bid.is_null() {
                    None
                } else {
                    s.head(bid).cloned()
                }
            }
        })
    }

    async fn get_range(
        &self,
        tlf: TlfId,
        bid: BranchId,
        status: MergeStatus,
        start: MetadataRevision,
        stop: MetadataRevision,
    ) -> Result<Vec<RootMetadataSigned>> {
        let state = self.lock();
        let Some(s) = state.tlfs.get(&tlf) else {
            return Ok(Vec::new());
        };
        let bid = match status {
            MergeStatus::Merged => BranchId::NULL,
            MergeStatus::Unmerged if bid.is_null() => self.device_branch(s),
            MergeStatus::Unmerged => bid,
        };
        if status == MergeStatus::Unmerged && bid.is_null() {
            return Ok(Vec::new());
        }
        Ok(s.history(bid)
            .iter()
            .filter(|rmds| rmds.md.revision >= start && rmds.md.revision <= stop)
            .cloned()
            .collect())
    }

    async fn put(&self, rmds: &RootMetadataSigned) -> Result<()> {
        let md = &rmds.md;
        md.validate()?;
        self.check_writer(rmds)?;
        let tlf = md.tlf_id;

        let mut state = self.lock();
        let s = state.tlfs.entry(tlf).or_insert_with(|| TlfState {
            handle: md.handle.clone(),
            ..Default::default()
        });

        if md.branch_id.is_null() {
            let expected = MetadataRevision(s.merged.len() as i64 + 1);
            if md.revision != expected {
                return Err(conflict(
                    tlf,
                    format!("revision {} but merged head expects {expected}", md.revision),
                ));
            }
            let head_id = match s.merged.last() {
                Some(head) => head.md_id()?,
                None => MdId::NONE,
            };
            if md.prev_root != head_id {
                return Err(conflict(tlf, "prev root does not match merged head"));
            }
            s.merged.push(rmds.clone());
            s.handle = md.handle.clone();
            s.notify(md.revision, self.device);
            let handle = s.handle.clone();
            state.handles.entry(handle).or_insert(tlf);
            tracing::debug!(%tlf, revision = %md.revision, "merged put");
            return Ok(());
        }

        let bid = md.branch_id;
        match s.device_branches.get(&self.device) {
            Some(current) if *current != bid => {
                return Err(conflict(
                    tlf,
                    format!("device already on branch {current}"),
                ));
            }
            Some(_) => {
                let branch = s.branches.entry(bid).or_default();
                let (head_rev, head_id) = match branch.last() {
                    Some(head) => (head.md.revision, head.md_id()?),
                    None => return Err(conflict(tlf, "branch lost its history")),
                };
                if md.revision != head_rev.next() || md.prev_root != head_id {
                    return Err(conflict(tlf, "put does not extend branch head"));
                }
                branch.push(rmds.clone());
            }
            None => {
                // A new branch forks from the merged revision just before it.
                let fork = md.revision.prev();
                let fork_id = match fork.0 {
                    0 => MdId::NONE,
                    n => match s.merged.get(n as usize - 1) {
                        Some(base) => base.md_id()?,
                        None => return Err(conflict(tlf, format!("no merged revision {fork}"))),
                    },
                };
                if md.prev_root != fork_id {
                    return Err(conflict(tlf, "branch does not fork from merged history"));
                }
                s.device_branches.insert(self.device, bid);
                s.branches.insert(bid, vec![rmds.clone()]);
            }
        }
        tracing::debug!(%tlf, %bid, revision = %md.revision, "unmerged put");
        Ok(())
    }

    async fn prune_branch(&self, tlf: TlfId, bid: BranchId) -> Result<()> {
        if bid.is_null() {
            return Err(Error::Server("cannot prune the merged branch".into()));
        }
        let mut state = self.lock();
        if let Some(s) = state.tlfs.get_mut(&tlf) {
            s.branches.remove(&bid);
            s.device_branches.retain(|_, b| *b != bid);
        }
        Ok(())
    }

    async fn register_for_update(
        &self,
        tlf: TlfId,
        current: MetadataRevision,
    ) -> Result<UpdateNotification> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.lock();
        let s = state.tlfs.entry(tlf).or_default();
        let head = s.merged.last().map(|h| h.md.revision);
        match head {
            Some(head) if head > current => {
                let _ = tx.send(Ok(()));
            }
            _ => s.observers.push(Observer {
                device: self.device,
                current,
                tx,
            }),
        }
        Ok(rx)
    }

    async fn truncate_lock(&self, tlf: TlfId) -> Result<bool> {
        let mut state = self.lock();
        let s = state.tlfs.entry(tlf).or_default();
        match s.truncate_holder {
            Some(holder) => Ok(holder == self.device),
            None => {
                s.truncate_holder = Some(self.device);
                Ok(true)
            }
        }
    }

    async fn truncate_unlock(&self, tlf: TlfId) -> Result<bool> {
        let mut state = self.lock();
        let Some(s) = state.tlfs.get_mut(&tlf) else {
            return Ok(false);
        };
        if s.truncate_holder == Some(self.device) {
            s.truncate_holder = None;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn get_latest_handle_for_tlf(&self, tlf: TlfId) -> Result<BareTlfHandle> {
        self.lock()
            .tlfs
            .get(&tlf)
            .map(|s| s.handle.clone())
            .ok_or_else(|| Error::NotFound(format!("folder {tlf}")))
    }

    fn offset_from_server_time(&self) -> Option<i64> {
        Some(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tlfs_core::{
        MetadataVer, UserId,
        crypto::{DeviceCrypto, make_random_branch_id},
        md::{BareRootMetadata, flags},
    };

    struct Fixture {
        server: MemoryMdServer,
        device: DeviceCrypto,
        uid: UserId,
        handle: BareTlfHandle,
    }

    fn fixture() -> Fixture {
        let directory = UserDirectory::new();
        let uid = directory.add_user("alice");
        let device = DeviceCrypto::generate();
        directory.add_device(uid, &device, "laptop").unwrap();
        let server = MemoryMdServer::new(directory).for_device(device.kid());
        Fixture {
            server,
            device,
            uid,
            handle: BareTlfHandle::new(vec![uid], vec![]),
        }
    }

    fn signed(f: &Fixture, md: BareRootMetadata) -> RootMetadataSigned {
        let sig = f.device.sign(&md.signing_bytes().unwrap());
        RootMetadataSigned { md, sig }
    }

    fn next(f: &Fixture, prev: &RootMetadataSigned) -> RootMetadataSigned {
        let mut md = prev.md.clone();
        md.revision = md.revision.next();
        md.prev_root = prev.md_id().unwrap();
        signed(f, md)
    }

    async fn initial(f: &Fixture) -> RootMetadataSigned {
        let (tlf, head) = f
            .server
            .get_for_handle(&f.handle, MergeStatus::Merged)
            .await
            .unwrap();
        assert!(head.is_none());
        let mut md = BareRootMetadata::new(tlf, f.handle.clone(), MetadataVer::V2);
        md.last_modifying_user = f.uid;
        md.last_modifying_device = f.device.kid();
        let rmds = signed(f, md);
        f.server.put(&rmds).await.unwrap();
        rmds
    }

    #[tokio::test]
    async fn test_racing_puts_conflict() {
        let f = fixture();
        let first = initial(&f).await;
        let second = next(&f, &first);
        f.server.put(&second).await.unwrap();

        // Another put built on `first` loses the race.
        let mut stale = next(&f, &first).md;
        stale.disk_usage = 7;
        let stale = signed(&f, stale);
        let err = f.server.put(&stale).await.unwrap_err();
        assert!(err.is_conflict());

        assert_eq!(
            f.server.merged_head_revision(first.md.tlf_id),
            Some(MetadataRevision(2))
        );
    }

    #[tokio::test]
    async fn test_unmerged_branch_and_prune() {
        let f = fixture();
        let tlf = initial(&f).await.md.tlf_id;
        let head = f
            .server
            .get_for_tlf(tlf, BranchId::NULL, MergeStatus::Merged)
            .await
            .unwrap()
            .unwrap();

        let bid = make_random_branch_id();
        let mut md = next(&f, &head).md;
        md.branch_id = bid;
        md.set_flag(flags::UNMERGED, true);
        let forked = signed(&f, md);
        f.server.put(&forked).await.unwrap();
        f.server.put(&next(&f, &forked)).await.unwrap();

        let got = f
            .server
            .get_for_tlf(tlf, BranchId::NULL, MergeStatus::Unmerged)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.md.revision, MetadataRevision(3));
        let range = f
            .server
            .get_range(tlf, bid, MergeStatus::Unmerged, MetadataRevision(1), MetadataRevision::MAX)
            .await
            .unwrap();
        assert_eq!(range.len(), 2);

        // A resolution lands on the merged branch first, then the branch
        // is pruned.
        f.server.put(&next(&f, &head)).await.unwrap();
        assert_eq!(f.server.branch_count(tlf), 1);
        f.server.prune_branch(tlf, bid).await.unwrap();
        assert_eq!(f.server.branch_count(tlf), 0);
        assert!(f
            .server
            .get_for_tlf(tlf, BranchId::NULL, MergeStatus::Unmerged)
            .await
            .unwrap()
            .is_none());
        assert_eq!(f.server.merged_head_revision(tlf), Some(MetadataRevision(2)));
    }

    #[tokio::test]
    async fn test_update_notification_skips_own_session() {
        let f = fixture();
        let first = initial(&f).await;
        let tlf = first.md.tlf_id;

        let other = f.server.for_device(Kid::from_bytes([7; 32]));
        let mut theirs = other.register_for_update(tlf, first.md.revision).await.unwrap();
        let mut ours = f.server.register_for_update(tlf, first.md.revision).await.unwrap();

        f.server.put(&next(&f, &first)).await.unwrap();
        theirs.try_recv().unwrap().unwrap();
        assert!(ours.try_recv().is_err());

        // Registering behind the head fires right away.
        let mut late = other
            .register_for_update(tlf, MetadataRevision::INITIAL)
            .await
            .unwrap();
        late.try_recv().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_non_writer_put_rejected() {
        let f = fixture();
        let first = initial(&f).await;
        let mut md = next(&f, &first).md;
        md.last_modifying_user = UserId::from_bytes([3; 16]);
        let rmds = signed(&f, md);
        assert!(matches!(
            f.server.put(&rmds).await.unwrap_err(),
            Error::BadSignature(_)
        ));

        let mut tampered = next(&f, &first);
        tampered.md.disk_usage += 1;
        assert!(matches!(
            f.server.put(&tampered).await.unwrap_err(),
            Error::BadSignature(_)
        ));
    }

    #[tokio::test]
    async fn test_truncate_lock_is_per_device() {
        let f = fixture();
        let tlf = initial(&f).await.md.tlf_id;
        let other = f.server.for_device(Kid::from_bytes([7; 32]));
        assert!(f.server.truncate_lock(tlf).await.unwrap());
        assert!(f.server.truncate_lock(tlf).await.unwrap());
        assert!(!other.truncate_lock(tlf).await.unwrap());
        assert!(!other.truncate_unlock(tlf).await.unwrap());
        assert!(f.server.truncate_unlock(tlf).await.unwrap());
        assert!(other.truncate_lock(tlf).await.unwrap());
    }
}
