//! FIFO cache for results that arrived outside the owner's safe window.
//!
//! Results wait here keyed by logical [`OwnerId`], so a result cached
//! while one incarnation was dying is still found when the next
//! incarnation of the same id becomes safe.
//!
//! The store hands results out with a drain-once contract:
//! [`drain_all`](PendingResultStore::drain_all) removes the whole queue,
//! and the drainer either delivers each item or puts the remainder back
//! with [`requeue_front`](PendingResultStore::requeue_front). A result is
//! therefore never observable in the store and in a delivery at the same
//! time.

use std::any::{Any, TypeId};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::owner::OwnerId;
use crate::task::TaskKey;

/// A finished task's result waiting for its owner's safe window.
pub struct PendingResult {
    task_key: TaskKey,
    type_id: TypeId,
    type_name: &'static str,
    value: Arc<dyn Any + Send + Sync>,
    pushed_at: DateTime<Utc>,
}

impl PendingResult {
    /// Wraps a type-erased result value for caching.
    ///
    /// The stored [`TypeId`] is taken from the erased value itself, so
    /// handler resolution later matches on the concrete result type.
    #[must_use]
    pub fn new(task_key: TaskKey, value: Arc<dyn Any + Send + Sync>, type_name: &'static str) -> Self {
        let type_id = Any::type_id(&*value);
        Self {
            task_key,
            type_id,
            type_name,
            value,
            pushed_at: Utc::now(),
        }
    }

    /// Key of the task that produced this result.
    #[must_use]
    pub fn task_key(&self) -> TaskKey {
        self.task_key
    }

    /// Concrete type of the wrapped value.
    #[must_use]
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Type name of the wrapped value, for logs.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Borrows the type-erased value.
    #[must_use]
    pub fn value(&self) -> &Arc<dyn Any + Send + Sync> {
        &self.value
    }

    /// Consumes the entry, returning the type-erased value.
    #[must_use]
    pub fn into_value(self) -> Arc<dyn Any + Send + Sync> {
        self.value
    }

    /// When the result entered the store.
    #[must_use]
    pub fn pushed_at(&self) -> DateTime<Utc> {
        self.pushed_at
    }
}

impl fmt::Debug for PendingResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingResult")
            .field("task_key", &self.task_key)
            .field("type_name", &self.type_name)
            .field("pushed_at", &self.pushed_at)
            .finish_non_exhaustive()
    }
}

/// Per-owner FIFO queues of undelivered results.
#[derive(Default)]
pub struct PendingResultStore {
    inner: Mutex<HashMap<OwnerId, VecDeque<PendingResult>>>,
}

impl PendingResultStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `result` to the back of `owner`'s queue.
    pub fn push(&self, owner: &OwnerId, result: PendingResult) {
        self.inner
            .lock()
            .entry(owner.clone())
            .or_default()
            .push_back(result);
    }

    /// Removes and returns `owner`'s entire queue in submission order.
    ///
    /// The drained batch is now the caller's responsibility: deliver each
    /// item, or return the undelivered tail through
    /// [`requeue_front`](PendingResultStore::requeue_front).
    #[must_use]
    pub fn drain_all(&self, owner: &OwnerId) -> Vec<PendingResult> {
        self.inner
            .lock()
            .remove(owner)
            .map(Vec::from)
            .unwrap_or_default()
    }

    /// Puts an undelivered batch back at the front of `owner`'s queue,
    /// preserving its internal order ahead of anything pushed since the
    /// drain.
    pub fn requeue_front(&self, owner: &OwnerId, items: Vec<PendingResult>) {
        if items.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        let queue = inner.entry(owner.clone()).or_default();
        for item in items.into_iter().rev() {
            queue.push_front(item);
        }
    }

    /// Moves entries for one task key between owner queues, preserving
    /// their relative order. Used when a single task is re-bound.
    pub(crate) fn move_task(&self, from: &OwnerId, to: &OwnerId, key: TaskKey) -> usize {
        if from == to {
            return 0;
        }
        let mut inner = self.inner.lock();
        let Some(queue) = inner.get_mut(from) else {
            return 0;
        };
        let drained = std::mem::take(queue);
        let (moved, kept): (VecDeque<_>, VecDeque<_>) =
            drained.into_iter().partition(|item| item.task_key == key);
        *queue = kept;
        if queue.is_empty() {
            inner.remove(from);
        }
        let count = moved.len();
        if count > 0 {
            inner.entry(to.clone()).or_default().extend(moved);
        }
        count
    }

    /// Moves `from`'s whole queue to the back of `to`'s queue. Used when
    /// a restored binding snapshot targets a different owner id.
    pub(crate) fn transfer(&self, from: &OwnerId, to: &OwnerId) -> usize {
        if from == to {
            return 0;
        }
        let mut inner = self.inner.lock();
        let Some(queue) = inner.remove(from) else {
            return 0;
        };
        let count = queue.len();
        if count > 0 {
            inner.entry(to.clone()).or_default().extend(queue);
        }
        count
    }

    /// Number of results waiting for `owner`.
    #[must_use]
    pub fn len(&self, owner: &OwnerId) -> usize {
        self.inner.lock().get(owner).map_or(0, VecDeque::len)
    }

    /// Number of results waiting across all owners.
    #[must_use]
    pub fn total_len(&self) -> usize {
        self.inner.lock().values().map(VecDeque::len).sum()
    }

    /// Whether no results are waiting at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total_len() == 0
    }

    /// Drops every cached result.
    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

impl fmt::Debug for PendingResultStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("PendingResultStore")
            .field("owners", &inner.len())
            .field("results", &inner.values().map(VecDeque::len).sum::<usize>())
            .finish_non_exhaustive()
    }
}
