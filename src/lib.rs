//! Lifecycle-gated background task execution with exactly-once result
//! delivery to transient owners.
//!
//! # Overview
//!
//! `taskgate` runs background tasks whose results must reach a *transient
//! owner* -- a screen, a session, a connection view -- that may be hidden,
//! torn down, or recreated while the work is still running. The engine
//! guarantees that each result is handed to at most one handler, at most
//! once, and only inside the owner's declared safe window. Results that
//! complete outside that window wait in a per-owner FIFO cache and are
//! delivered when the owner (or its reborn successor under the same
//! logical id) becomes safe again.
//!
//! # Concepts
//!
//! - [`Task`]: a unit of work with a typed output, executed on a spawned
//!   worker; cancellation is cooperative via [`TaskContext`].
//! - [`OwnerId`] vs [`OwnerHandle`]: the logical identity that survives
//!   recreation, and a generation-stamped handle to one incarnation.
//!   Stale handles become no-ops instead of corrupting their successor.
//! - [`SafetyTracker`]: the authoritative safety state per owner, driven
//!   by the host's lifecycle edges (`attach`, `mark_safe`, `mark_unsafe`,
//!   `destroy`).
//! - [`HandlerSet`] / [`TaskEngine::mount`]: explicit registration of the
//!   result handlers an incarnation exposes, arranged in a per-owner node
//!   tree with routing ids for disambiguation.
//! - [`DeliveryMode`]: whether handlers run immediately on the worker, on
//!   whatever thread observes a deliverable state, or on the engine's
//!   dispatcher task (the default).
//!
//! # Quick start
//!
//! ```no_run
//! use async_trait::async_trait;
//! use taskgate::{EngineBuilder, EngineError, HandlerSet, Task, TaskContext};
//!
//! struct LoadProfile {
//!     user: String,
//! }
//!
//! #[async_trait]
//! impl Task for LoadProfile {
//!     type Output = String;
//!
//!     async fn run(&self, _ctx: &TaskContext) -> String {
//!         format!("profile of {}", self.user)
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), EngineError> {
//!     let engine = EngineBuilder::new().build();
//!
//!     // The host drives the owner's lifecycle through the tracker.
//!     let owner = engine.lifecycle().attach("profile-screen");
//!     engine.mount(
//!         &owner,
//!         HandlerSet::new().on(|profile: &String| {
//!             println!("showing {profile}");
//!         }),
//!     )?;
//!     engine.lifecycle().mark_safe(&owner);
//!
//!     let handle = engine.submit(
//!         LoadProfile {
//!             user: "ada".to_owned(),
//!         },
//!         &owner,
//!     );
//!     let result = handle.result().await;
//!     assert!(result.is_some());
//!
//!     engine.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! If the owner is destroyed before the task finishes, the result is
//! cached under its [`OwnerId`]; attaching a new incarnation with the
//! same id, mounting fresh handlers, and marking it safe delivers the
//! cached result to the new instance exactly once.
//!
//! # Module Organization
//!
//! - [`task`]: the [`Task`] trait, [`TaskKey`]s, typed [`TaskHandle`]s,
//!   and [`TaskSnapshot`] status views.
//! - [`owner`]: owner identity, the safety state machine, and the
//!   [`SafetyTracker`].
//! - [`pending`]: the per-owner FIFO cache for results awaiting a safe
//!   window.
//! - [`resolver`]: explicit handler registration and deterministic
//!   target resolution.
//! - [`engine`]: the [`TaskEngine`] itself, its builder, delivery modes,
//!   and binding persistence.
//! - [`error`]: the [`EngineError`] taxonomy for the fallible API
//!   surface.

pub mod engine;
pub mod error;
pub mod owner;
pub mod pending;
pub mod resolver;
pub mod task;

pub use engine::{
    DeliveryMode, EngineBuilder, OwnerBindingSnapshot, SavedTaskBinding, SubmitOptions, TaskEngine,
    DEFAULT_DISPATCH_TIMEOUT,
};
pub use error::EngineError;
pub use owner::{
    OwnerEvent, OwnerEventKind, OwnerHandle, OwnerId, SafetyState, SafetyTracker, SubscriptionId,
};
pub use pending::{PendingResult, PendingResultStore};
pub use resolver::{HandlerRegistry, HandlerSet, ResolvedTarget};
pub use task::{Task, TaskContext, TaskHandle, TaskKey, TaskSnapshot};
