//! Task trait, keys, handles, and status snapshots.
//!
//! A [`Task`] is the unit of work the engine runs on a background worker.
//! Submitting one yields a typed [`TaskHandle`] the caller keeps for
//! cancellation and result queries; the engine itself tracks the task
//! through an internal entry keyed by [`TaskKey`].

use std::any::{Any, TypeId};
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::EngineError;
use crate::owner::OwnerId;

/// Process-unique identifier for a submitted task.
///
/// Keys are assigned monotonically starting at 1. The value 0 is reserved
/// as the invalid sentinel returned by submissions to a shut-down engine.
///
/// # Examples
///
/// ```
/// use taskgate::TaskKey;
///
/// assert!(!TaskKey::INVALID.is_valid());
/// assert!(TaskKey::from_raw(1).is_valid());
/// assert_eq!(TaskKey::from_raw(42).raw(), 42);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskKey(u64);

impl TaskKey {
    /// The invalid sentinel key. Never assigned to a registered task.
    pub const INVALID: TaskKey = TaskKey(0);

    /// Reconstructs a key from a persisted raw value.
    #[must_use]
    pub fn from_raw(raw: u64) -> Self {
        TaskKey(raw)
    }

    /// Returns the raw numeric value, e.g. for persistence.
    #[must_use]
    pub fn raw(self) -> u64 {
        self.0
    }

    /// Returns `true` unless this is the invalid sentinel.
    #[must_use]
    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A unit of background work with a typed result.
///
/// `run` executes on a spawned worker. The engine catches panics from the
/// body, converting a crash into "no result" -- the completion latch still
/// opens so callers awaiting [`TaskHandle::result`] are never deadlocked.
///
/// Cancellation is cooperative: the engine never aborts a running task
/// except on full shutdown. Long-running bodies should poll
/// [`TaskContext::is_cancelled`] and may return a sentinel value early;
/// that value still flows through normal result delivery.
///
/// # Examples
///
/// ```
/// use async_trait::async_trait;
/// use taskgate::{Task, TaskContext};
///
/// struct Checksum {
///     payload: Vec<u8>,
/// }
///
/// #[async_trait]
/// impl Task for Checksum {
///     type Output = u32;
///
///     async fn run(&self, ctx: &TaskContext) -> u32 {
///         let mut sum = 0u32;
///         for chunk in self.payload.chunks(4096) {
///             if ctx.is_cancelled() {
///                 return 0;
///             }
///             sum = chunk.iter().fold(sum, |acc, b| acc.wrapping_add(u32::from(*b)));
///         }
///         sum
///     }
/// }
/// ```
#[async_trait]
pub trait Task: Send + Sync + 'static {
    /// The result type delivered to the owner's handler.
    type Output: Send + Sync + 'static;

    /// Executes the work. Runs on a background worker.
    async fn run(&self, ctx: &TaskContext) -> Self::Output;

    /// Human-readable task name used in logs and snapshots.
    fn name(&self) -> &str
    where
        Self: Sized,
    {
        std::any::type_name::<Self>()
    }
}

/// Engine-provided view handed to a running task body.
///
/// Carries the assigned key and the cooperative cancellation flag.
#[derive(Clone)]
pub struct TaskContext {
    key: TaskKey,
    shared: Arc<TaskShared>,
}

impl TaskContext {
    pub(crate) fn new(key: TaskKey, shared: Arc<TaskShared>) -> Self {
        Self { key, shared }
    }

    /// The key assigned to this task at submission.
    #[must_use]
    pub fn key(&self) -> TaskKey {
        self.key
    }

    /// Returns `true` once cancellation has been requested.
    ///
    /// Cooperative: the body decides whether and how to exit early.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.shared.is_cancelled()
    }
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("key", &self.key)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// State shared between the engine's registry entry, the worker, and the
/// caller-held handle. The watch channel is the completion latch; the
/// result slot is written exactly once, before the latch opens.
pub(crate) struct TaskShared {
    result_type: TypeId,
    result_type_name: &'static str,
    cancelled: AtomicBool,
    executing: AtomicBool,
    finished: AtomicBool,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
    result: OnceLock<Option<Arc<dyn Any + Send + Sync>>>,
    submitted_at: DateTime<Utc>,
    finished_at: Mutex<Option<DateTime<Utc>>>,
}

impl TaskShared {
    pub(crate) fn new(result_type: TypeId, result_type_name: &'static str) -> Self {
        let (done_tx, done_rx) = watch::channel(false);
        Self {
            result_type,
            result_type_name,
            cancelled: AtomicBool::new(false),
            executing: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            done_tx,
            done_rx,
            result: OnceLock::new(),
            submitted_at: Utc::now(),
            finished_at: Mutex::new(None),
        }
    }

    /// Shared state for the invalid sentinel handle: latch already open,
    /// no result, finished.
    pub(crate) fn sentinel(result_type: TypeId, result_type_name: &'static str) -> Self {
        let (done_tx, done_rx) = watch::channel(true);
        let shared = Self {
            result_type,
            result_type_name,
            cancelled: AtomicBool::new(false),
            executing: AtomicBool::new(false),
            finished: AtomicBool::new(true),
            done_tx,
            done_rx,
            result: OnceLock::new(),
            submitted_at: Utc::now(),
            finished_at: Mutex::new(Some(Utc::now())),
        };
        let _ = shared.result.set(None);
        shared
    }

    pub(crate) fn result_type(&self) -> TypeId {
        self.result_type
    }

    pub(crate) fn result_type_name(&self) -> &'static str {
        self.result_type_name
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn set_cancelled(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_executing(&self) -> bool {
        self.executing.load(Ordering::SeqCst)
    }

    pub(crate) fn set_executing(&self, executing: bool) {
        self.executing.store(executing, Ordering::SeqCst);
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Marks the task finished. Returns `true` only for the first caller;
    /// the single-shot guard for racing cleanup sites.
    pub(crate) fn mark_finished(&self) -> bool {
        let first = !self.finished.swap(true, Ordering::SeqCst);
        if first {
            *self.finished_at.lock() = Some(Utc::now());
        }
        first
    }

    /// Stores the result (or `None` for a crashed/aborted body) and opens
    /// the completion latch. Idempotent: later calls keep the first value.
    pub(crate) fn complete(&self, value: Option<Arc<dyn Any + Send + Sync>>) {
        let _ = self.result.set(value);
        let _ = self.done_tx.send(true);
    }

    pub(crate) async fn wait_done(&self) {
        let mut rx = self.done_rx.clone();
        let _ = rx.wait_for(|done| *done).await;
    }

    pub(crate) fn result_value(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.result.get().and_then(Clone::clone)
    }

    pub(crate) fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }

    pub(crate) fn finished_at(&self) -> Option<DateTime<Utc>> {
        *self.finished_at.lock()
    }
}

/// Caller-held handle to a submitted task.
///
/// Cloneable; all clones observe the same task. A submission made after
/// shutdown returns a handle whose key is [`TaskKey::INVALID`], whose
/// latch is already open, and whose result is `None`.
///
/// The result value is shared: the owner's handler borrows the same
/// allocation this handle returns as `Arc<T>`.
pub struct TaskHandle<T> {
    key: TaskKey,
    shared: Arc<TaskShared>,
    _output: PhantomData<fn() -> T>,
}

impl<T: Send + Sync + 'static> TaskHandle<T> {
    pub(crate) fn new(key: TaskKey, shared: Arc<TaskShared>) -> Self {
        Self {
            key,
            shared,
            _output: PhantomData,
        }
    }

    pub(crate) fn sentinel() -> Self {
        Self {
            key: TaskKey::INVALID,
            shared: Arc::new(TaskShared::sentinel(
                TypeId::of::<T>(),
                std::any::type_name::<T>(),
            )),
            _output: PhantomData,
        }
    }

    /// The key assigned at submission; [`TaskKey::INVALID`] if the engine
    /// was already shut down.
    #[must_use]
    pub fn key(&self) -> TaskKey {
        self.key
    }

    /// Shorthand for `self.key().is_valid()`.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.key.is_valid()
    }

    /// Requests cooperative cancellation.
    pub fn cancel(&self) {
        self.shared.set_cancelled();
    }

    /// Returns `true` once cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.shared.is_cancelled()
    }

    /// Returns `true` while the body is running on a worker.
    #[must_use]
    pub fn is_executing(&self) -> bool {
        self.shared.is_executing()
    }

    /// Returns `true` once the task has been finished (delivered,
    /// discarded, or suppressed) and removed from the registry.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.shared.is_finished()
    }

    /// Awaits the completion latch, then returns the result.
    ///
    /// `None` means the body panicked, the engine shut down before
    /// completion, or this is the invalid sentinel handle.
    pub async fn result(&self) -> Option<Arc<T>> {
        self.shared.wait_done().await;
        let value = self.shared.result_value()?;
        value.downcast::<T>().ok()
    }

    /// Bounded variant of [`result`](TaskHandle::result).
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ResultTimeout`] if the latch does not open
    /// within `timeout`.
    pub async fn result_timeout(&self, timeout: Duration) -> Result<Option<Arc<T>>, EngineError> {
        match tokio::time::timeout(timeout, self.result()).await {
            Ok(value) => Ok(value),
            Err(_) => Err(EngineError::ResultTimeout {
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }
}

impl<T> Clone for TaskHandle<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key,
            shared: Arc::clone(&self.shared),
            _output: PhantomData,
        }
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("key", &self.key)
            .field("finished", &self.shared.is_finished())
            .finish_non_exhaustive()
    }
}

/// Point-in-time status view of a registered task.
///
/// Returned by the engine's snapshot queries. The handler registered with
/// `on_with_task` variants receives the snapshot taken at delivery time,
/// e.g. to check cancellation after the fact.
#[derive(Debug, Clone)]
pub struct TaskSnapshot {
    /// The task's key.
    pub key: TaskKey,
    /// Task name as reported by [`Task::name`].
    pub name: String,
    /// Type name of the result the task produces.
    pub result_type: &'static str,
    /// Logical owner the result is bound to.
    pub owner: OwnerId,
    /// Routing id declared at submission, if any.
    pub routing_id: Option<String>,
    /// Node path hint declared at submission, if any.
    pub node_path: Option<String>,
    /// Whether cancellation has been requested.
    pub cancelled: bool,
    /// Whether the body is currently running.
    pub executing: bool,
    /// Whether the task has finished.
    pub finished: bool,
    /// When the task was submitted.
    pub submitted_at: DateTime<Utc>,
    /// When the task finished, if it has.
    pub finished_at: Option<DateTime<Utc>>,
}
