//! Error types for the responder crates.
//!
//! Three families live here:
//! - [`ProcessError`] for low-level spawn / signal / wait failures,
//! - [`StoreError`] for failures reported by external collaborators,
//! - [`ActionError`] for everything the dispatcher reports to its callers.
//!
//! Failures local to one actor are recorded in that actor's log entry; the
//! errors below are what escapes to the caller of an operation.

use crate::types::{ActionId, ActionKind, UserId};
use thiserror::Error;

/// Result type alias for dispatcher operations.
pub type Result<T> = std::result::Result<T, ActionError>;

/// Why a spawn attempt failed.
///
/// The distinction matters for later classification: a missing executable is
/// logged with its own failure code.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SpawnFailure {
    #[error("executable not found")]
    NotFound,
    #[error("exec failure")]
    Exec,
}

// ==============================================================================
// Process Errors
// ==============================================================================

/// Process-specific error types for the supervisor layer.
#[derive(Error, Debug, Clone)]
pub enum ProcessError {
    #[error("Process spawn failed: {id} - {kind}: {reason}")]
    SpawnFailed {
        id: String,
        kind: SpawnFailure,
        reason: String,
    },

    #[error("Process stop failed: {id} - {reason}")]
    StopFailed { id: String, reason: String },

    #[error("Process wait failed: {id} - {reason}")]
    WaitFailed { id: String, reason: String },
}

impl ProcessError {
    pub fn spawn_failed(id: impl Into<String>, kind: SpawnFailure, reason: impl Into<String>) -> Self {
        Self::SpawnFailed {
            id: id.into(),
            kind,
            reason: reason.into(),
        }
    }

    pub fn stop_failed(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StopFailed {
            id: id.into(),
            reason: reason.into(),
        }
    }

    pub fn wait_failed(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::WaitFailed {
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// The spawn failure reason, if this error came from a spawn attempt.
    pub fn spawn_failure(&self) -> Option<SpawnFailure> {
        match self {
            Self::SpawnFailed { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

/// Result type for process operations.
pub type ProcessResult<T> = std::result::Result<T, ProcessError>;

// ==============================================================================
// Collaborator Errors
// ==============================================================================

/// Errors reported by external collaborators (log store, sessions, query layer,
/// incident sender).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Record not found: {what}")]
    NotFound { what: String },

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Collaborator unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

// ==============================================================================
// Dispatcher Errors
// ==============================================================================

/// Errors surfaced by the action dispatcher.
#[derive(Error, Debug, Clone)]
pub enum ActionError {
    /// The action could not be started. The failure is already logged.
    #[error("Action {action_id} spawn failed ({kind}): {reason}")]
    SpawnFailed {
        action_id: ActionId,
        kind: SpawnFailure,
        reason: String,
    },

    /// The owner of the action is not allowed for its kind.
    #[error("Invalid owner {owner} for {kind} action {action_id}")]
    InvalidOwner {
        action_id: ActionId,
        kind: ActionKind,
        owner: UserId,
    },

    /// The acting user could not be resolved (no session can be issued).
    #[error("Invalid acting user {user} for action {action_id}: {reason}")]
    InvalidUser {
        action_id: ActionId,
        user: UserId,
        reason: String,
    },

    #[error("Malformed command for action {action_id}: {reason}")]
    MalformedCommand { action_id: ActionId, reason: String },

    #[error("Resident protocol error for action {action_id}: {reason}")]
    Protocol { action_id: ActionId, reason: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The dispatcher's event loop is gone.
    #[error("Action manager unavailable: {0}")]
    ActorUnavailable(String),
}

impl ActionError {
    pub fn malformed_command(action_id: ActionId, reason: impl Into<String>) -> Self {
        Self::MalformedCommand {
            action_id,
            reason: reason.into(),
        }
    }

    pub fn protocol(action_id: ActionId, reason: impl Into<String>) -> Self {
        Self::Protocol {
            action_id,
            reason: reason.into(),
        }
    }

    pub fn actor_unavailable(context: impl Into<String>) -> Self {
        Self::ActorUnavailable(context.into())
    }
}
