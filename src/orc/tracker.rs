//! Resource trackers: handles for revoking groups of definitions.
//!
//! Every definition is made under a tracker. Removing the tracker unpublishes
//! the symbols it owns, drops any unit that never materialized, and asks each
//! registered [`ResourceManager`] to free what it holds for that key (mapped
//! code, stub blocks). Removal is strict: it fails with `ResourceBusy` while
//! any owned symbol is still materializing or a manager reports one of its
//! resources in use.
//!
//! Trackers are not released on drop; a tracker lives until it is removed
//! explicitly, its namespace is removed, or the session shuts down.

use super::namespace::NamespaceId;
use super::session::ExecutionSession;
use crate::core::error::JitResult;
use std::fmt;

/// Identity of a resource tracker inside its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackerKey(pub u64);

impl fmt::Display for TrackerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rt#{}", self.0)
    }
}

/// Owner of per-tracker resources outside the symbol table.
pub trait ResourceManager: Send + Sync {
    /// Free everything recorded for `key`.
    fn release(&self, key: TrackerKey);

    /// Free everything, on session shutdown.
    fn release_all(&self);

    /// Number of resources held for `key` that are in use and must not be
    /// released yet.
    fn busy(&self, _key: TrackerKey) -> usize {
        0
    }
}

/// Handle to a resource tracker.
#[derive(Clone)]
pub struct ResourceTracker {
    key: TrackerKey,
    namespace: NamespaceId,
    session: ExecutionSession,
}

impl ResourceTracker {
    pub(crate) fn new(key: TrackerKey, namespace: NamespaceId, session: ExecutionSession) -> Self {
        Self {
            key,
            namespace,
            session,
        }
    }

    pub fn key(&self) -> TrackerKey {
        self.key
    }

    pub fn namespace_id(&self) -> NamespaceId {
        self.namespace
    }

    /// Revoke everything defined under this tracker.
    pub fn remove(&self) -> JitResult<()> {
        self.session.remove_tracker(self.key)
    }

    pub fn is_removed(&self) -> bool {
        !self.session.tracker_exists(self.key)
    }
}

impl fmt::Debug for ResourceTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceTracker")
            .field("key", &self.key)
            .field("namespace", &self.namespace)
            .finish()
    }
}

impl PartialEq for ResourceTracker {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.session.ptr_eq(&other.session)
    }
}

impl Eq for ResourceTracker {}
