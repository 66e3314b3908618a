//! Owner identity and lifecycle safety tracking.
//!
//! An owner is the transient object results are delivered to -- a screen,
//! a session, a view. Owners are identified by a logical [`OwnerId`] that
//! survives re-creation; each concrete incarnation gets a fresh generation
//! counter so callbacks from a torn-down instance cannot disturb its
//! successor.
//!
//! The [`SafetyTracker`] holds the authoritative safety state per owner.
//! Hosts drive it from their lifecycle edges:
//!
//! ```
//! use taskgate::SafetyTracker;
//!
//! let tracker = SafetyTracker::new();
//! let handle = tracker.attach("settings-screen");
//! tracker.mark_safe(&handle);
//! assert!(tracker.is_safe(handle.id()));
//! tracker.mark_unsafe(&handle);
//! tracker.destroy(&handle);
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Logical owner identity, stable across re-creations of the concrete
/// owner object.
///
/// Hosts choose the string; anything unique within the process works
/// (a screen name, a session id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    /// The id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for OwnerId {
    fn from(id: &str) -> Self {
        OwnerId(id.to_owned())
    }
}

impl From<String> for OwnerId {
    fn from(id: String) -> Self {
        OwnerId(id)
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Non-owning handle to one incarnation of an owner.
///
/// Returned by [`SafetyTracker::attach`]. The generation stamp makes the
/// handle self-invalidating: once the same id is attached again, calls
/// through the older handle become no-ops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerHandle {
    id: OwnerId,
    generation: u64,
}

impl OwnerHandle {
    /// The logical owner id.
    #[must_use]
    pub fn id(&self) -> &OwnerId {
        &self.id
    }

    /// The incarnation this handle refers to. Starts at 1 for the first
    /// attach of an id.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Safety state of an owner incarnation.
///
/// Results are handed to owner code only in [`Safe`](SafetyState::Safe);
/// in every other state they wait in the pending store (or, for a
/// destroyed owner, wait for the id to be attached again).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafetyState {
    /// Attached but not yet ready to receive results.
    Initializing,
    /// Ready: results may be handed to owner code.
    Safe,
    /// Temporarily unable to receive results (e.g. backgrounded).
    Stopping,
    /// Torn down. Terminal for this incarnation.
    Destroyed,
}

impl SafetyState {
    /// Whether results may be delivered in this state.
    #[must_use]
    pub fn is_safe(self) -> bool {
        matches!(self, SafetyState::Safe)
    }

    /// Whether this state is terminal for the incarnation.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, SafetyState::Destroyed)
    }

    /// Whether a transition from `self` to `target` is allowed.
    ///
    /// | From         | Allowed targets            |
    /// |--------------|----------------------------|
    /// | Initializing | Safe, Stopping, Destroyed  |
    /// | Safe         | Stopping, Destroyed        |
    /// | Stopping     | Safe, Destroyed            |
    /// | Destroyed    | none                       |
    ///
    /// Self-transitions are not listed; the tracker treats them as
    /// idempotent no-ops before consulting this table.
    #[must_use]
    pub fn can_transition_to(self, target: SafetyState) -> bool {
        use SafetyState::{Destroyed, Initializing, Safe, Stopping};
        matches!(
            (self, target),
            (Initializing, Safe | Stopping | Destroyed)
                | (Safe, Stopping | Destroyed)
                | (Stopping, Safe | Destroyed)
        )
    }
}

impl fmt::Display for SafetyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SafetyState::Initializing => "initializing",
            SafetyState::Safe => "safe",
            SafetyState::Stopping => "stopping",
            SafetyState::Destroyed => "destroyed",
        };
        f.write_str(label)
    }
}

/// What happened to an owner, as seen by tracker subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerEventKind {
    /// A new incarnation was attached.
    Attached,
    /// The incarnation entered [`SafetyState::Safe`].
    BecameSafe,
    /// The incarnation left the safe window.
    BecameUnsafe,
    /// The incarnation was destroyed.
    Destroyed,
}

/// Lifecycle event emitted to tracker subscribers.
///
/// Emitted synchronously on the thread that drove the transition, after
/// the tracker's internal lock is released.
#[derive(Debug, Clone)]
pub struct OwnerEvent {
    /// The logical owner the event concerns.
    pub owner: OwnerId,
    /// The incarnation the event concerns.
    pub generation: u64,
    /// What happened.
    pub kind: OwnerEventKind,
}

/// Identifies a tracker subscription for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type SubscriberFn = Arc<dyn Fn(&OwnerEvent) + Send + Sync>;

struct OwnerRecord {
    generation: u64,
    state: SafetyState,
}

/// Tracks safety state per logical owner and notifies subscribers of
/// transitions.
///
/// All mutating calls take an [`OwnerHandle`]; a handle whose generation
/// has been superseded by a newer [`attach`](SafetyTracker::attach) is
/// silently ignored. This is how the tracker resolves the race between a
/// dying incarnation and its replacement: whichever attaches last wins,
/// and the loser's trailing lifecycle calls cannot corrupt the state.
pub struct SafetyTracker {
    owners: DashMap<OwnerId, OwnerRecord>,
    subscribers: RwLock<Vec<(SubscriptionId, SubscriberFn)>>,
    next_subscription: AtomicU64,
}

impl SafetyTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self {
            owners: DashMap::new(),
            subscribers: RwLock::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
        }
    }

    /// Registers a new incarnation of `id` and returns its handle.
    ///
    /// The new incarnation starts in [`SafetyState::Initializing`] and
    /// supersedes any previous handle for the same id, whatever state the
    /// previous incarnation was left in.
    pub fn attach(&self, id: impl Into<OwnerId>) -> OwnerHandle {
        let id = id.into();
        let generation = {
            let mut record = self.owners.entry(id.clone()).or_insert(OwnerRecord {
                generation: 0,
                state: SafetyState::Destroyed,
            });
            record.generation += 1;
            record.state = SafetyState::Initializing;
            record.generation
        };
        debug!(owner = %id, generation, "owner attached");
        self.emit(&OwnerEvent {
            owner: id.clone(),
            generation,
            kind: OwnerEventKind::Attached,
        });
        OwnerHandle { id, generation }
    }

    /// Marks the incarnation safe for delivery.
    ///
    /// Returns `true` if the owner is now safe (including the idempotent
    /// re-mark), `false` for an unknown owner, a stale handle, or a
    /// destroyed incarnation.
    pub fn mark_safe(&self, handle: &OwnerHandle) -> bool {
        self.transition(handle, SafetyState::Safe, OwnerEventKind::BecameSafe)
    }

    /// Marks the incarnation unsafe; results queue until it is safe again.
    pub fn mark_unsafe(&self, handle: &OwnerHandle) -> bool {
        self.transition(handle, SafetyState::Stopping, OwnerEventKind::BecameUnsafe)
    }

    /// Destroys the incarnation. Terminal; a later [`attach`] of the same
    /// id starts a fresh incarnation.
    ///
    /// [`attach`]: SafetyTracker::attach
    pub fn destroy(&self, handle: &OwnerHandle) -> bool {
        self.transition(handle, SafetyState::Destroyed, OwnerEventKind::Destroyed)
    }

    fn transition(&self, handle: &OwnerHandle, target: SafetyState, kind: OwnerEventKind) -> bool {
        let emitted = {
            let Some(mut record) = self.owners.get_mut(&handle.id) else {
                debug!(owner = %handle.id, "transition for unknown owner ignored");
                return false;
            };
            if record.generation != handle.generation {
                debug!(
                    owner = %handle.id,
                    given = handle.generation,
                    current = record.generation,
                    "transition through stale handle ignored"
                );
                return false;
            }
            if record.state == target {
                return true;
            }
            if !record.state.can_transition_to(target) {
                warn!(
                    owner = %handle.id,
                    from = %record.state,
                    to = %target,
                    "invalid owner state transition rejected"
                );
                return false;
            }
            record.state = target;
            OwnerEvent {
                owner: handle.id.clone(),
                generation: handle.generation,
                kind,
            }
        };
        self.emit(&emitted);
        true
    }

    /// Current state of `id`, if it has ever been attached.
    #[must_use]
    pub fn state(&self, id: &OwnerId) -> Option<SafetyState> {
        self.owners.get(id).map(|record| record.state)
    }

    /// Whether `id` is currently in the safe window.
    #[must_use]
    pub fn is_safe(&self, id: &OwnerId) -> bool {
        self.state(id).is_some_and(SafetyState::is_safe)
    }

    /// Current generation of `id`, if it has ever been attached.
    #[must_use]
    pub fn generation(&self, id: &OwnerId) -> Option<u64> {
        self.owners.get(id).map(|record| record.generation)
    }

    /// Registers `callback` for every subsequent lifecycle event.
    ///
    /// Callbacks run synchronously on the transitioning thread and must
    /// not call back into the tracker for the same owner.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&OwnerEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::SeqCst));
        self.subscribers.write().push((id, Arc::new(callback)));
        id
    }

    /// Removes a subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|(existing, _)| *existing != id);
        subscribers.len() != before
    }

    fn emit(&self, event: &OwnerEvent) {
        let callbacks: Vec<SubscriberFn> = self
            .subscribers
            .read()
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in callbacks {
            callback(event);
        }
    }
}

impl Default for SafetyTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SafetyTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SafetyTracker")
            .field("owners", &self.owners.len())
            .field("subscribers", &self.subscribers.read().len())
            .finish_non_exhaustive()
    }
}
