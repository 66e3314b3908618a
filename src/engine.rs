//! The task engine: submission, scheduling, and lifecycle-gated delivery.
//!
//! [`TaskEngine`] ties the other modules together. It assigns keys, spawns
//! a worker per task, and routes each finished result through the
//! configured [`DeliveryMode`]: straight to the handler, or gated on the
//! owner's safe window with the pending store as the holding area.
//!
//! Engines are built explicitly via [`EngineBuilder`]; a process-wide
//! default is available through [`TaskEngine::global`] for hosts that want
//! one shared instance.
//!
//! # Examples
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use async_trait::async_trait;
//! use taskgate::{EngineBuilder, EngineError, HandlerSet, Task, TaskContext};
//!
//! struct FetchGreeting;
//!
//! #[async_trait]
//! impl Task for FetchGreeting {
//!     type Output = String;
//!
//!     async fn run(&self, _ctx: &TaskContext) -> String {
//!         tokio::time::sleep(Duration::from_millis(50)).await;
//!         "hello".to_owned()
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), EngineError> {
//!     let engine = EngineBuilder::new().build();
//!     let owner = engine.lifecycle().attach("home-screen");
//!     engine.mount(
//!         &owner,
//!         HandlerSet::new().on(|greeting: &String| {
//!             println!("greeting arrived: {greeting}");
//!         }),
//!     )?;
//!     engine.lifecycle().mark_safe(&owner);
//!
//!     let handle = engine.submit(FetchGreeting, &owner);
//!     assert_eq!(handle.result().await.as_deref(), Some(&"hello".to_owned()));
//!     engine.shutdown();
//!     Ok(())
//! }
//! ```

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::error::EngineError;
use crate::owner::{OwnerEvent, OwnerEventKind, OwnerHandle, OwnerId, SafetyTracker, SubscriptionId};
use crate::pending::{PendingResult, PendingResultStore};
use crate::resolver::{HandlerRegistry, HandlerSet};
use crate::task::{Task, TaskContext, TaskHandle, TaskKey, TaskShared, TaskSnapshot};

/// Default bound on the worker-to-dispatcher hand-off acknowledgement.
pub const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Where and when a finished result is handed to its handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    /// Invoke on the worker as soon as the task finishes, bypassing the
    /// owner safety gate. Intended for tests and headless hosts whose
    /// owners have no lifecycle.
    Immediate,
    /// Invoke on whatever thread observes a deliverable state: the worker
    /// if the owner is safe at completion, otherwise the thread that
    /// drives the owner safe again.
    AnyThread,
    /// Hand every invocation to the engine's dispatcher task, so all
    /// handlers run on one context. The worker awaits the hand-off
    /// acknowledgement, bounded by the configured dispatch timeout.
    #[default]
    Dispatcher,
}

/// Per-submission options for [`TaskEngine::submit_with`].
///
/// ```
/// use taskgate::SubmitOptions;
///
/// let options = SubmitOptions::new()
///     .routing_id("avatar")
///     .node_path("tabs/profile");
/// ```
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    routing_id: Option<String>,
    node_path: Option<String>,
    silent: bool,
}

impl SubmitOptions {
    /// No routing id, no node path, delivery enabled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts delivery to handlers declared with the same routing id.
    #[must_use]
    pub fn routing_id(mut self, routing_id: impl Into<String>) -> Self {
        self.routing_id = Some(routing_id.into());
        self
    }

    /// Targets the handler node at `path` in the owner's tree; the root
    /// stays eligible as a fallback.
    #[must_use]
    pub fn node_path(mut self, path: impl Into<String>) -> Self {
        self.node_path = Some(path.into());
        self
    }

    /// Fire-and-forget: skip handler resolution entirely and clean the
    /// task up as soon as it completes.
    #[must_use]
    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }
}

/// Configures and constructs a [`TaskEngine`].
#[derive(Debug, Default)]
pub struct EngineBuilder {
    mode: DeliveryMode,
    max_concurrency: Option<usize>,
    dispatch_timeout: Option<Duration>,
    tracker: Option<Arc<SafetyTracker>>,
}

impl EngineBuilder {
    /// Starts from the defaults: [`DeliveryMode::Dispatcher`], unbounded
    /// concurrency, a five second dispatch timeout, and a fresh tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the delivery mode.
    #[must_use]
    pub fn delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.mode = mode;
        self
    }

    /// Bounds how many task bodies run at once. Admission is FIFO. A
    /// limit of zero lets no task run at all.
    #[must_use]
    pub fn max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit);
        self
    }

    /// Bounds the worker's wait for the dispatcher hand-off
    /// acknowledgement in [`DeliveryMode::Dispatcher`].
    #[must_use]
    pub fn dispatch_timeout(mut self, timeout: Duration) -> Self {
        self.dispatch_timeout = Some(timeout);
        self
    }

    /// Shares an existing tracker instead of creating one, so several
    /// engines (or the host itself) can observe the same owners.
    #[must_use]
    pub fn tracker(mut self, tracker: Arc<SafetyTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Builds the engine and spawns its dispatcher task.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    #[must_use]
    pub fn build(self) -> TaskEngine {
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(EngineInner {
            registry: RwLock::new(HashMap::new()),
            next_key: AtomicU64::new(1),
            pending: PendingResultStore::new(),
            tracker: self.tracker.unwrap_or_else(|| Arc::new(SafetyTracker::new())),
            handlers: HandlerRegistry::new(),
            mode: self.mode,
            dispatch_timeout: self.dispatch_timeout.unwrap_or(DEFAULT_DISPATCH_TIMEOUT),
            limiter: self.max_concurrency.map(|limit| Arc::new(Semaphore::new(limit))),
            dispatch_tx,
            dispatcher: Mutex::new(None),
            shutdown: AtomicBool::new(false),
            subscription: OnceLock::new(),
        });

        let dispatcher = tokio::spawn(run_dispatcher(Arc::downgrade(&inner), dispatch_rx));
        *inner.dispatcher.lock() = Some(dispatcher);

        // Weak backref: the tracker outliving the engine must not keep it
        // alive through its own subscriber list.
        let subscriber = Arc::downgrade(&inner);
        let subscription = inner.tracker.subscribe(move |event| {
            if let Some(inner) = subscriber.upgrade() {
                inner.on_owner_event(event);
            }
        });
        let _ = inner.subscription.set(subscription);

        debug!(mode = ?inner.mode, "task engine started");
        TaskEngine { inner }
    }

    /// Builds the engine and installs it as the process-wide default,
    /// replacing (without shutting down) any previous default.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn install_global(self) -> TaskEngine {
        let engine = self.build();
        let _previous = TaskEngine::install_global(engine.clone());
        engine
    }
}

struct OwnerBinding {
    owner: OwnerId,
    routing_id: Option<String>,
    node_path: Option<String>,
}

struct TaskEntry {
    key: TaskKey,
    name: String,
    shared: Arc<TaskShared>,
    binding: Mutex<OwnerBinding>,
    silent: bool,
    posting: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TaskEntry {
    /// Claims delivery exclusivity. `false` means another call site is
    /// already posting this result.
    fn begin_posting(&self) -> bool {
        !self.posting.swap(true, Ordering::SeqCst)
    }

    fn end_posting(&self) {
        self.posting.store(false, Ordering::SeqCst);
    }

    fn snapshot(&self) -> TaskSnapshot {
        let binding = self.binding.lock();
        TaskSnapshot {
            key: self.key,
            name: self.name.clone(),
            result_type: self.shared.result_type_name(),
            owner: binding.owner.clone(),
            routing_id: binding.routing_id.clone(),
            node_path: binding.node_path.clone(),
            cancelled: self.shared.is_cancelled(),
            executing: self.shared.is_executing(),
            finished: self.shared.is_finished(),
            submitted_at: self.shared.submitted_at(),
            finished_at: self.shared.finished_at(),
        }
    }
}

enum DispatchMsg {
    Deliver {
        entry: Arc<TaskEntry>,
        value: Arc<dyn Any + Send + Sync>,
        ack: oneshot::Sender<()>,
    },
    Drain {
        owner: OwnerId,
    },
}

struct EngineInner {
    registry: RwLock<HashMap<TaskKey, Arc<TaskEntry>>>,
    next_key: AtomicU64,
    pending: PendingResultStore,
    tracker: Arc<SafetyTracker>,
    handlers: HandlerRegistry,
    mode: DeliveryMode,
    dispatch_timeout: Duration,
    limiter: Option<Arc<Semaphore>>,
    dispatch_tx: UnboundedSender<DispatchMsg>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    shutdown: AtomicBool,
    subscription: OnceLock<SubscriptionId>,
}

/// Task submission, tracking, and lifecycle-gated result delivery.
///
/// Cheap to clone; clones share one engine. See the [module
/// docs](self) for a usage walkthrough.
#[derive(Clone)]
pub struct TaskEngine {
    inner: Arc<EngineInner>,
}

impl TaskEngine {
    /// Submits `task` bound to `owner` with default options.
    ///
    /// Returns immediately with a typed handle; the body runs on a spawned
    /// worker. After [`shutdown`](TaskEngine::shutdown) this returns the
    /// invalid-sentinel handle instead of scheduling anything.
    pub fn submit<T: Task>(&self, task: T, owner: &OwnerHandle) -> TaskHandle<T::Output> {
        self.submit_with(task, owner, SubmitOptions::new())
    }

    /// Submits `task` with explicit [`SubmitOptions`].
    pub fn submit_with<T: Task>(
        &self,
        task: T,
        owner: &OwnerHandle,
        options: SubmitOptions,
    ) -> TaskHandle<T::Output> {
        if self.inner.shutdown.load(Ordering::SeqCst) {
            warn!(owner = %owner.id(), "submission after shutdown; returning the invalid handle");
            return TaskHandle::sentinel();
        }
        let key = TaskKey::from_raw(self.inner.next_key.fetch_add(1, Ordering::SeqCst));
        let shared = Arc::new(TaskShared::new(
            TypeId::of::<T::Output>(),
            std::any::type_name::<T::Output>(),
        ));
        let entry = Arc::new(TaskEntry {
            key,
            name: task.name().to_owned(),
            shared: Arc::clone(&shared),
            binding: Mutex::new(OwnerBinding {
                owner: owner.id().clone(),
                routing_id: options.routing_id,
                node_path: options.node_path,
            }),
            silent: options.silent,
            posting: AtomicBool::new(false),
            worker: Mutex::new(None),
        });
        self.inner.registry.write().insert(key, Arc::clone(&entry));
        debug!(key = %key, owner = %owner.id(), task = %entry.name, "task submitted");

        let inner = Arc::clone(&self.inner);
        let worker_entry = Arc::clone(&entry);
        let worker = tokio::spawn(run_worker(inner, worker_entry, task));
        *entry.worker.lock() = Some(worker);

        TaskHandle::new(key, shared)
    }

    /// Requests cooperative cancellation of a live task.
    ///
    /// The body keeps running until it checks
    /// [`TaskContext::is_cancelled`]; whatever it returns still flows
    /// through normal delivery. Returns `false` for unknown or finished
    /// keys.
    pub fn cancel(&self, key: TaskKey) -> bool {
        let entry = self.inner.registry.read().get(&key).cloned();
        match entry {
            Some(entry) if !entry.shared.is_finished() => {
                entry.shared.set_cancelled();
                debug!(key = %key, "cancellation requested");
                true
            }
            _ => false,
        }
    }

    /// Snapshot of one live task, or `None` once it has finished and left
    /// the registry.
    #[must_use]
    pub fn task(&self, key: TaskKey) -> Option<TaskSnapshot> {
        self.inner
            .registry
            .read()
            .get(&key)
            .map(|entry| entry.snapshot())
    }

    /// Snapshots of every live task, ordered by key.
    #[must_use]
    pub fn tasks(&self) -> Vec<TaskSnapshot> {
        let registry = self.inner.registry.read();
        let mut all: Vec<TaskSnapshot> = registry.values().map(|entry| entry.snapshot()).collect();
        drop(registry);
        all.sort_by_key(|snapshot| snapshot.key);
        all
    }

    /// Snapshots of live tasks matching `predicate`, ordered by key.
    ///
    /// ```no_run
    /// # use taskgate::TaskEngine;
    /// # let engine = taskgate::EngineBuilder::new().build();
    /// let mine = engine.tasks_matching(|task| task.owner.as_str() == "settings-screen");
    /// ```
    #[must_use]
    pub fn tasks_matching<F>(&self, predicate: F) -> Vec<TaskSnapshot>
    where
        F: Fn(&TaskSnapshot) -> bool,
    {
        self.tasks()
            .into_iter()
            .filter(|snapshot| predicate(snapshot))
            .collect()
    }

    /// Re-binds a live task to another owner incarnation, clearing its
    /// node-path hint and replacing its routing id.
    ///
    /// Returns `false` without touching anything if the task is unknown,
    /// already finished, or has begun posting its result -- losing that
    /// race is a no-op, not an error.
    pub fn replace_owner(
        &self,
        key: TaskKey,
        owner: &OwnerHandle,
        routing_id: Option<&str>,
    ) -> bool {
        let entry = self.inner.registry.read().get(&key).cloned();
        let Some(entry) = entry else {
            return false;
        };
        if entry.shared.is_finished() || entry.posting.load(Ordering::SeqCst) {
            return false;
        }
        let previous = {
            let mut binding = entry.binding.lock();
            let previous = binding.owner.clone();
            binding.owner = owner.id().clone();
            binding.routing_id = routing_id.map(ToOwned::to_owned);
            binding.node_path = None;
            previous
        };
        let moved = self.inner.pending.move_task(&previous, owner.id(), key);
        debug!(key = %key, from = %previous, to = %owner.id(), moved, "task re-bound");
        if moved > 0 && self.inner.tracker.is_safe(owner.id()) {
            self.inner.request_drain(owner.id());
        }
        true
    }

    /// The safety tracker this engine observes. Hosts drive owner
    /// lifecycles through it: `attach`, `mark_safe`, `mark_unsafe`,
    /// `destroy`.
    #[must_use]
    pub fn lifecycle(&self) -> &SafetyTracker {
        &self.inner.tracker
    }

    /// Mounts `set` as the root handlers of the owner behind `handle`.
    ///
    /// # Errors
    ///
    /// [`EngineError::ShutDown`] after shutdown,
    /// [`EngineError::UnknownOwner`] if the id was never attached, and
    /// [`EngineError::StaleOwner`] if a newer incarnation exists.
    pub fn mount(&self, handle: &OwnerHandle, set: HandlerSet) -> Result<(), EngineError> {
        self.validate_handle(handle)?;
        self.inner.handlers.mount(handle.id(), set);
        Ok(())
    }

    /// Mounts `set` at `path` in the owner's tree. Same errors as
    /// [`mount`](TaskEngine::mount).
    ///
    /// # Errors
    ///
    /// See [`mount`](TaskEngine::mount).
    pub fn mount_at(
        &self,
        handle: &OwnerHandle,
        path: &str,
        set: HandlerSet,
    ) -> Result<(), EngineError> {
        self.validate_handle(handle)?;
        self.inner.handlers.mount_at(handle.id(), path, set);
        Ok(())
    }

    /// Removes the handlers at `path`; `Ok(false)` if no such node.
    ///
    /// # Errors
    ///
    /// See [`mount`](TaskEngine::mount).
    pub fn unmount(&self, handle: &OwnerHandle, path: &str) -> Result<bool, EngineError> {
        self.validate_handle(handle)?;
        Ok(self.inner.handlers.unmount(handle.id(), path))
    }

    /// Number of results cached for `owner` awaiting its safe window.
    #[must_use]
    pub fn pending_count(&self, owner: &OwnerId) -> usize {
        self.inner.pending.len(owner)
    }

    /// Whether [`shutdown`](TaskEngine::shutdown) has run.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    /// Captures the in-flight task bindings of `owner` for persistence.
    ///
    /// The snapshot is serde-serializable and keyed by raw task keys;
    /// pair it with [`restore_owner`](TaskEngine::restore_owner) after the
    /// owner is recreated (possibly under a new id).
    #[must_use]
    pub fn owner_snapshot(&self, owner: &OwnerId) -> OwnerBindingSnapshot {
        let registry = self.inner.registry.read();
        let mut tasks: Vec<SavedTaskBinding> = registry
            .values()
            .filter_map(|entry| {
                if entry.shared.is_finished() {
                    return None;
                }
                let binding = entry.binding.lock();
                (binding.owner == *owner).then(|| SavedTaskBinding {
                    key: entry.key.raw(),
                    routing_id: binding.routing_id.clone(),
                    node_path: binding.node_path.clone(),
                })
            })
            .collect();
        drop(registry);
        tasks.sort_by_key(|task| task.key);
        OwnerBindingSnapshot {
            owner: owner.clone(),
            tasks,
        }
    }

    /// Re-binds the still-live tasks from `snapshot` to `owner`, moving
    /// any cached results along if the id changed. Finished, posting, and
    /// unknown keys are skipped. Returns how many tasks were re-bound.
    pub fn restore_owner(&self, snapshot: &OwnerBindingSnapshot, owner: &OwnerHandle) -> usize {
        let mut rebound = 0usize;
        for saved in &snapshot.tasks {
            let key = TaskKey::from_raw(saved.key);
            let entry = self.inner.registry.read().get(&key).cloned();
            let Some(entry) = entry else {
                continue;
            };
            if entry.shared.is_finished() || entry.posting.load(Ordering::SeqCst) {
                continue;
            }
            let mut binding = entry.binding.lock();
            binding.owner = owner.id().clone();
            binding.routing_id = saved.routing_id.clone();
            binding.node_path = saved.node_path.clone();
            drop(binding);
            rebound += 1;
        }
        if snapshot.owner != *owner.id() {
            let moved = self.inner.pending.transfer(&snapshot.owner, owner.id());
            if moved > 0 {
                debug!(
                    from = %snapshot.owner,
                    to = %owner.id(),
                    moved,
                    "cached results followed the restored binding"
                );
            }
        }
        debug!(owner = %owner.id(), rebound, "owner bindings restored");
        if self.inner.pending.len(owner.id()) > 0 && self.inner.tracker.is_safe(owner.id()) {
            self.inner.request_drain(owner.id());
        }
        rebound
    }

    /// Shuts the engine down. Idempotent.
    ///
    /// Aborts the dispatcher and every worker, releases every unreleased
    /// completion latch with "no result", drops cached results, and
    /// detaches from the tracker. If this engine is the process-wide
    /// default it stops being it.
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("engine shutting down");
        if let Some(dispatcher) = self.inner.dispatcher.lock().take() {
            dispatcher.abort();
        }
        let entries: Vec<Arc<TaskEntry>> = {
            let mut registry = self.inner.registry.write();
            registry.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            if let Some(worker) = entry.worker.lock().take() {
                worker.abort();
            }
            entry.shared.set_cancelled();
            entry.shared.complete(None);
            entry.shared.mark_finished();
        }
        let dropped = self.inner.pending.total_len();
        if dropped > 0 {
            warn!(count = dropped, "undelivered results dropped at shutdown");
        }
        self.inner.pending.clear();
        if let Some(subscription) = self.inner.subscription.get() {
            self.inner.tracker.unsubscribe(*subscription);
        }
        release_global_if(self);
        debug!("engine shut down");
    }

    /// The process-wide default engine, built lazily on first use (or
    /// after the previous default was shut down).
    ///
    /// # Panics
    ///
    /// Panics if the first call happens outside a Tokio runtime.
    #[must_use]
    pub fn global() -> TaskEngine {
        let mut global = GLOBAL_ENGINE.lock();
        if let Some(engine) = global.as_ref() {
            if !engine.is_shut_down() {
                return engine.clone();
            }
        }
        let engine = EngineBuilder::new().build();
        *global = Some(engine.clone());
        engine
    }

    /// Makes `engine` the process-wide default, returning the previous
    /// default (still running) if there was one.
    pub fn install_global(engine: TaskEngine) -> Option<TaskEngine> {
        GLOBAL_ENGINE.lock().replace(engine)
    }

    /// Clears the process-wide default without shutting it down, handing
    /// it back to the caller. Mainly for tests that need isolation.
    pub fn reset_global() -> Option<TaskEngine> {
        GLOBAL_ENGINE.lock().take()
    }

    fn validate_handle(&self, handle: &OwnerHandle) -> Result<(), EngineError> {
        if self.inner.shutdown.load(Ordering::SeqCst) {
            return Err(EngineError::ShutDown);
        }
        match self.inner.tracker.generation(handle.id()) {
            None => Err(EngineError::UnknownOwner {
                owner: handle.id().clone(),
            }),
            Some(current) if current != handle.generation() => Err(EngineError::StaleOwner {
                owner: handle.id().clone(),
                given: handle.generation(),
                current,
            }),
            Some(_) => Ok(()),
        }
    }
}

impl fmt::Debug for TaskEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskEngine")
            .field("mode", &self.inner.mode)
            .field("live_tasks", &self.inner.registry.read().len())
            .field("pending", &self.inner.pending.total_len())
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}

static GLOBAL_ENGINE: Mutex<Option<TaskEngine>> = Mutex::new(None);

fn release_global_if(engine: &TaskEngine) {
    let mut global = GLOBAL_ENGINE.lock();
    if let Some(current) = global.as_ref() {
        if Arc::ptr_eq(&current.inner, &engine.inner) {
            *global = None;
        }
    }
}

/// One live task's binding, as captured by [`TaskEngine::owner_snapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedTaskBinding {
    /// Raw task key ([`TaskKey::raw`]).
    pub key: u64,
    /// Routing id the task was submitted (or last re-bound) with.
    pub routing_id: Option<String>,
    /// Node-path hint the task was submitted with.
    pub node_path: Option<String>,
}

/// Serializable capture of every in-flight task bound to one owner id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerBindingSnapshot {
    /// The owner id the snapshot was taken for.
    pub owner: OwnerId,
    /// In-flight bindings, ordered by key.
    pub tasks: Vec<SavedTaskBinding>,
}

async fn run_worker<T: Task>(inner: Arc<EngineInner>, entry: Arc<TaskEntry>, task: T) {
    if inner.shutdown.load(Ordering::SeqCst) {
        entry.shared.complete(None);
        inner.cleanup(&entry);
        return;
    }
    let _permit = match &inner.limiter {
        Some(limiter) => match Arc::clone(limiter).acquire_owned().await {
            Ok(permit) => Some(permit),
            Err(_closed) => {
                entry.shared.complete(None);
                inner.cleanup(&entry);
                return;
            }
        },
        None => None,
    };

    let ctx = TaskContext::new(entry.key, Arc::clone(&entry.shared));
    trace!(key = %entry.key, task = %entry.name, "task body starting");
    entry.shared.set_executing(true);
    let outcome = AssertUnwindSafe(task.run(&ctx)).catch_unwind().await;
    entry.shared.set_executing(false);

    let value: Option<Arc<dyn Any + Send + Sync>> = match outcome {
        Ok(output) => Some(Arc::new(output) as Arc<dyn Any + Send + Sync>),
        Err(_panic) => {
            error!(
                key = %entry.key,
                task = %entry.name,
                "task body panicked; treated as no result"
            );
            None
        }
    };
    entry.shared.complete(value.clone());
    inner.post_result(&entry, value).await;
}

async fn run_dispatcher(inner: Weak<EngineInner>, mut rx: UnboundedReceiver<DispatchMsg>) {
    while let Some(msg) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match msg {
            DispatchMsg::Deliver { entry, value, ack } => {
                inner.deliver_on_dispatcher(&entry, value);
                let _ = ack.send(());
            }
            DispatchMsg::Drain { owner } => inner.drain_owner(&owner),
        }
    }
    trace!("dispatcher task exited");
}

impl EngineInner {
    /// Delivery decision point once a worker has a completed value.
    async fn post_result(&self, entry: &Arc<TaskEntry>, value: Option<Arc<dyn Any + Send + Sync>>) {
        let Some(value) = value else {
            self.cleanup(entry);
            return;
        };
        if entry.silent {
            trace!(key = %entry.key, "silent task completed; no delivery");
            self.cleanup(entry);
            return;
        }
        if !entry.begin_posting() || entry.shared.is_finished() {
            return;
        }
        if self.shutdown.load(Ordering::SeqCst) {
            self.cleanup(entry);
            return;
        }
        match self.mode {
            DeliveryMode::Immediate => {
                self.resolve_and_invoke(entry, &value);
                self.cleanup(entry);
            }
            DeliveryMode::AnyThread => {
                if self.owner_is_safe(entry) {
                    self.resolve_and_invoke(entry, &value);
                    self.cleanup(entry);
                } else {
                    self.stash_pending(entry, value);
                }
            }
            DeliveryMode::Dispatcher => {
                if !self.owner_is_safe(entry) {
                    self.stash_pending(entry, value);
                    return;
                }
                let (ack_tx, ack_rx) = oneshot::channel();
                let msg = DispatchMsg::Deliver {
                    entry: Arc::clone(entry),
                    value,
                    ack: ack_tx,
                };
                if self.dispatch_tx.send(msg).is_err() {
                    warn!(key = %entry.key, "dispatcher gone; delivery suppressed");
                    self.cleanup(entry);
                    return;
                }
                match tokio::time::timeout(self.dispatch_timeout, ack_rx).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_closed)) => {
                        warn!(key = %entry.key, "dispatcher dropped the hand-off");
                    }
                    Err(_elapsed) => warn!(
                        key = %entry.key,
                        timeout_ms = u64::try_from(self.dispatch_timeout.as_millis())
                            .unwrap_or(u64::MAX),
                        "dispatcher hand-off acknowledgement timed out"
                    ),
                }
            }
        }
    }

    /// Runs on the dispatcher task with the posting flag already held on
    /// behalf of this delivery.
    fn deliver_on_dispatcher(&self, entry: &Arc<TaskEntry>, value: Arc<dyn Any + Send + Sync>) {
        if entry.shared.is_finished() {
            return;
        }
        if self.shutdown.load(Ordering::SeqCst) {
            self.cleanup(entry);
            return;
        }
        if self.owner_is_safe(entry) {
            self.resolve_and_invoke(entry, &value);
            self.cleanup(entry);
        } else {
            // owner slipped out of the safe window since the hand-off
            self.stash_pending(entry, value);
        }
    }

    /// Releases the posting flag, caches the value, and re-checks safety
    /// to close the race with a concurrent safe-transition.
    fn stash_pending(&self, entry: &Arc<TaskEntry>, value: Arc<dyn Any + Send + Sync>) {
        entry.end_posting();
        let owner = entry.binding.lock().owner.clone();
        debug!(key = %entry.key, owner = %owner, "owner unsafe; result cached");
        self.pending.push(
            &owner,
            PendingResult::new(entry.key, value, entry.shared.result_type_name()),
        );
        if self.tracker.is_safe(&owner) {
            self.request_drain(&owner);
        }
    }

    fn request_drain(&self, owner: &OwnerId) {
        match self.mode {
            DeliveryMode::Dispatcher => {
                let _ = self.dispatch_tx.send(DispatchMsg::Drain {
                    owner: owner.clone(),
                });
            }
            DeliveryMode::Immediate | DeliveryMode::AnyThread => self.drain_owner(owner),
        }
    }

    /// Delivers `owner`'s cached results in FIFO order. If the safe
    /// window closes mid-batch the undelivered remainder goes back to the
    /// front of the queue.
    fn drain_owner(&self, owner: &OwnerId) {
        if !self.tracker.is_safe(owner) {
            return;
        }
        let batch = self.pending.drain_all(owner);
        if batch.is_empty() {
            return;
        }
        debug!(owner = %owner, count = batch.len(), "draining cached results");
        let mut items = batch.into_iter();
        while let Some(item) = items.next() {
            if let Some(undelivered) = self.deliver_pending_item(owner, item) {
                let mut remainder = vec![undelivered];
                remainder.extend(items);
                self.pending.requeue_front(owner, remainder);
                return;
            }
        }
    }

    /// Delivers one drained item. Returns the item back if the owner's
    /// safe window closed and the caller should requeue the batch tail.
    fn deliver_pending_item(
        &self,
        drained_owner: &OwnerId,
        item: PendingResult,
    ) -> Option<PendingResult> {
        let entry = self.registry.read().get(&item.task_key()).cloned();
        let Some(entry) = entry else {
            trace!(key = %item.task_key(), "cached result without a live task; dropped");
            return None;
        };
        if entry.shared.is_finished() || !entry.begin_posting() {
            // lost to a concurrent delivery or cleanup
            return None;
        }
        if self.shutdown.load(Ordering::SeqCst) {
            self.cleanup(&entry);
            return None;
        }
        let bound_owner = entry.binding.lock().owner.clone();
        if bound_owner != *drained_owner {
            entry.end_posting();
            debug!(
                key = %entry.key,
                from = %drained_owner,
                to = %bound_owner,
                "task re-bound while cached; forwarding"
            );
            self.pending.push(&bound_owner, item);
            if self.tracker.is_safe(&bound_owner) {
                self.request_drain(&bound_owner);
            }
            return None;
        }
        if !self.tracker.is_safe(drained_owner) {
            entry.end_posting();
            return Some(item);
        }
        self.resolve_and_invoke(&entry, item.value());
        self.cleanup(&entry);
        None
    }

    /// Resolves the handler on the current tree and invokes it, catching
    /// handler panics. No engine lock is held across the invocation.
    fn resolve_and_invoke(&self, entry: &Arc<TaskEntry>, value: &Arc<dyn Any + Send + Sync>) {
        let snapshot = entry.snapshot();
        let target = self.handlers.resolve(
            &snapshot.owner,
            entry.shared.result_type(),
            entry.shared.result_type_name(),
            snapshot.routing_id.as_deref(),
            snapshot.node_path.as_deref(),
        );
        let Some(target) = target else {
            warn!(
                key = %entry.key,
                owner = %snapshot.owner,
                result_type = entry.shared.result_type_name(),
                routing_id = snapshot.routing_id.as_deref().unwrap_or("-"),
                "no handler found; result discarded"
            );
            return;
        };
        trace!(key = %entry.key, node = target.node_path(), "invoking handler");
        let invocation = panic::catch_unwind(AssertUnwindSafe(|| {
            target.invoke(&**value, &snapshot);
        }));
        if invocation.is_err() {
            error!(
                key = %entry.key,
                owner = %snapshot.owner,
                node = target.node_path(),
                "result handler panicked; task still finished"
            );
        }
    }

    /// Single-shot cleanup, safe from racing call sites.
    fn cleanup(&self, entry: &Arc<TaskEntry>) {
        if !entry.shared.mark_finished() {
            return;
        }
        self.registry.write().remove(&entry.key);
        debug!(key = %entry.key, task = %entry.name, "task finished");
    }

    fn owner_is_safe(&self, entry: &Arc<TaskEntry>) -> bool {
        let owner = entry.binding.lock().owner.clone();
        self.tracker.is_safe(&owner)
    }

    /// Tracker subscriber: reacts to owner transitions. Runs on whatever
    /// thread drove the transition.
    fn on_owner_event(&self, event: &OwnerEvent) {
        match event.kind {
            OwnerEventKind::Attached | OwnerEventKind::Destroyed => {
                // handler closures of a dead incarnation must never fire
                if self.handlers.clear_owner(&event.owner) {
                    trace!(owner = %event.owner, kind = ?event.kind, "handler tree cleared");
                }
            }
            OwnerEventKind::BecameSafe => {
                if self.pending.len(&event.owner) > 0 {
                    self.request_drain(&event.owner);
                }
            }
            OwnerEventKind::BecameUnsafe => {}
        }
    }
}
