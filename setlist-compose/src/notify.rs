//! Observer notifications
//!
//! Every turn that changes what the UI shows produces one [`StateChange`].
//! Callbacks run after the session lock is released, in subscription order,
//! and must not call back into the composer. Changes arrive in revision order.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use setlist_common::models::ServiceStatus;
use setlist_common::{EntryId, MutationId};

use crate::order::{EntryView, SnapshotDiff};

/// User-facing notice kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    /// The store refused the change; retrying will not help
    Blocked,
    /// Someone else changed the entry first; it now shows their version
    Conflict,
    /// Network trouble; the change was reverted and can be retried
    RetryAvailable,
    /// The entry no longer exists
    Stale,
    /// Change was too old to resend after reconnecting
    ManualRetry,
    /// Reconnecting keeps failing; persists until a resync succeeds
    ResyncFailing,
}

impl NoticeKind {
    pub fn is_persistent(self) -> bool {
        self == NoticeKind::ResyncFailing
    }
}

impl fmt::Display for NoticeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NoticeKind::Blocked => "blocked",
            NoticeKind::Conflict => "conflict",
            NoticeKind::RetryAvailable => "retry_available",
            NoticeKind::Stale => "stale",
            NoticeKind::ManualRetry => "manual_retry",
            NoticeKind::ResyncFailing => "resync_failing",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub kind: NoticeKind,
    pub mutation: Option<MutationId>,
    pub entry: Option<EntryId>,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

/// What caused a state change
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum ChangeCause {
    Proposed { mutation: MutationId },
    Confirmed { mutation: MutationId },
    RolledBack { mutation: MutationId },
    Cancelled { mutation: MutationId },
    /// Merge of another client's change
    Remote,
    Resynced { diff: SnapshotDiff },
    ServiceStatus { status: ServiceStatus },
    /// Connection health changed without touching entries
    Connection,
}

/// One notification to observers
#[derive(Debug, Clone)]
pub struct StateChange {
    /// Increments with every change of the session
    pub revision: u64,
    pub cause: ChangeCause,
    /// Visible entries after the change, in order
    pub entries: Arc<Vec<EntryView>>,
    /// Notices raised during this turn
    pub notices: Vec<Notice>,
}

type Callback = Arc<dyn Fn(&StateChange) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    callbacks: BTreeMap<u64, Callback>,
}

/// Publish/subscribe hub for [`StateChange`]s
#[derive(Clone, Default)]
pub struct Notifier {
    registry: Arc<Mutex<Registry>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        let mut registry = self.lock();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.callbacks.insert(id, Arc::new(callback));
        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Invoke every callback with `change`
    pub fn notify(&self, change: &StateChange) {
        let callbacks: Vec<Callback> = self.lock().callbacks.values().cloned().collect();
        for callback in callbacks {
            callback(change);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().callbacks.len()
    }
}

/// Live registration; dropping it unsubscribes
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .callbacks
                .remove(&self.id);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
