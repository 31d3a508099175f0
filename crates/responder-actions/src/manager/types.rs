//! Shared data types for the action manager module.
//!
//! This module contains:
//! - Public result types returned to callers (Dispatched, DispatchReport)
//! - Crate-internal messages posted to the actor by reader / writer / timer
//!   tasks and by the reaping thread

use responder_common::{ActionId, LogId, LogStatus, Result};
use responder_resident::{Packet, WireError};
use responder_supervisor::ActorOutcome;

/// Environment variable carrying the session id of a spawned action.
pub const SESSION_ID_ENV: &str = "RESPONDER_SESSION_ID";

/// The result of dispatching one action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatched {
    pub action_id: ActionId,
    pub log_id: LogId,
    /// Status of the log record when dispatch returned.
    pub status: LogStatus,
    /// Set when a command actor was spawned by this call.
    pub pid: Option<u32>,
}

/// Per-action result of [`ActionManager::handle_event`](super::ActionManager::handle_event).
#[derive(Debug)]
pub struct DispatchReport {
    pub action_id: ActionId,
    pub result: Result<Dispatched>,
}

// ============================================================================
// Internal Types - Actor messages
// ============================================================================

/// Messages posted to the actor from outside its task.
pub(super) enum InternalEvent {
    /// A command actor was finalized.
    CommandFinished { pid: u32, log_id: Option<LogId> },
    /// The reader task of a resident connection produced a packet, EOF or error.
    ResidentPacket {
        conn_id: u64,
        result: std::result::Result<Option<Packet>, WireError>,
    },
    ResidentWriteFailed { conn_id: u64, error: WireError },
    ResidentTimeout { conn_id: u64, seq: u64 },
    /// The resident host process was collected.
    ResidentCollected {
        conn_id: u64,
        pid: u32,
        outcome: ActorOutcome,
    },
}
