//! Error types for engine operations.
//!
//! Most failure handling in this crate is internal: task panics, missing
//! handlers, handler panics, and delivery races are caught, logged, and
//! absorbed so that nothing escapes the scheduling or delivery path.
//! [`EngineError`] covers the small API surface that is genuinely fallible
//! from the caller's side.

use thiserror::Error;

use crate::owner::OwnerId;

/// Errors returned by the fallible parts of the public API.
///
/// Submission and delivery never surface errors -- a submission after
/// shutdown returns an invalid-key handle, and delivery failures are logged
/// and absorbed. What remains fallible is handler mounting (which validates
/// the owner handle against the lifecycle tracker) and bounded result waits.
///
/// # Examples
///
/// ```
/// use taskgate::{EngineError, OwnerId};
///
/// let err = EngineError::StaleOwner {
///     owner: OwnerId::from("settings-screen"),
///     given: 1,
///     current: 2,
/// };
/// assert!(err.to_string().contains("settings-screen"));
/// ```
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine has been shut down and no longer accepts mutations.
    #[error("engine is shut down")]
    ShutDown,

    /// The owner id has never been attached to this engine's lifecycle
    /// tracker, so there is no instance to mount handlers on.
    #[error("owner '{owner}' is not attached to the lifecycle tracker")]
    UnknownOwner {
        /// The unattached owner id.
        owner: OwnerId,
    },

    /// The owner handle belongs to a superseded instance generation.
    ///
    /// Returned when a destroyed-and-recreated owner's old instance tries
    /// to mount handlers; only the current generation may mutate
    /// registrations.
    #[error("stale handle for owner '{owner}': generation {given} superseded by {current}")]
    StaleOwner {
        /// The owner id the handle refers to.
        owner: OwnerId,
        /// The generation carried by the stale handle.
        given: u64,
        /// The generation currently live for this owner id.
        current: u64,
    },

    /// A bounded wait for a task result elapsed before the completion
    /// latch opened.
    #[error("task result not available within {timeout_ms} ms")]
    ResultTimeout {
        /// The timeout that elapsed, in milliseconds.
        timeout_ms: u64,
    },
}
