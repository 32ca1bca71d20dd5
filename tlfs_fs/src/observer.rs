//! Change notifications for whoever presents the folder to a user.

use std::{fmt::Debug, sync::Arc};
use tlfs_core::ops::WriteRange;

use crate::Node;

/// What happened to one node in a batch of changes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeChange {
    /// Contents, entries or attributes changed.
    Updated(Node),
    /// The node is no longer reachable.
    Unlinked(Node),
}

pub trait Observer: Debug + Send + Sync {
    /// A write or truncate on this device that is not synced yet.
    fn local_change(&self, node: Node, write: WriteRange);

    /// Changes that landed in the folder's head, from this device or
    /// merged in from others.
    fn batch_changes(&self, changes: &[NodeChange]);
}

#[derive(Debug, Default)]
pub(crate) struct Observers {
    list: std::sync::Mutex<Vec<Arc<dyn Observer>>>,
}

impl Observers {
    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Arc<dyn Observer>>> {
        self.list
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn register(&self, observer: Arc<dyn Observer>) {
        self.lock().push(observer);
    }

    pub fn unregister(&self, observer: &Arc<dyn Observer>) {
        self.lock().retain(|o| !Arc::ptr_eq(o, observer));
    }

    pub fn local_change(&self, node: Node, write: WriteRange) {
        for observer in self.lock().iter() {
            observer.local_change(node, write);
        }
    }

    pub fn batch_changes(&self, changes: &[NodeChange]) {
        if changes.is_empty() {
            return;
        }
        for observer in self.lock().iter() {
            observer.batch_changes(changes);
        }
    }
}
