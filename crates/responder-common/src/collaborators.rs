//! Interfaces of the external collaborators the responder depends on.
//!
//! The responder never owns persistence, sessions, event matching or the
//! incident-tracker transport; it talks to them through these traits. All of
//! them are synchronous because they are called from the reaping thread as well
//! as from the dispatcher's event loop.

use crate::errors::StoreResult;
use crate::types::{
    ActionDefinition, ActionLog, EventRecord, FailureCode, LogId, LogStatus, NewActionLog,
    SessionId, UserId,
};
use std::time::Duration;

/// Terminal outcome written by `update_log_end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogEnd {
    pub status: LogStatus,
    pub exit_code: i32,
    pub failure_code: FailureCode,
}

impl LogEnd {
    pub fn succeeded(exit_code: i32) -> Self {
        Self {
            status: LogStatus::Succeeded,
            exit_code,
            failure_code: FailureCode::None,
        }
    }

    pub fn failed(failure_code: FailureCode) -> Self {
        Self {
            status: LogStatus::Failed,
            exit_code: 0,
            failure_code,
        }
    }
}

/// Persistent store of action log records.
pub trait ActionLogStore: Send + Sync {
    fn create_log(&self, log: NewActionLog) -> StoreResult<LogId>;

    /// Move a queued / launching record to `Started`.
    fn update_log_start(&self, id: LogId) -> StoreResult<()>;

    /// Finalize a record.
    fn update_log_end(&self, id: LogId, end: LogEnd) -> StoreResult<()>;

    fn update_log_aborted(&self, id: LogId) -> StoreResult<()>;

    fn get_log(&self, id: LogId) -> StoreResult<Option<ActionLog>>;

    fn get_logs_by_status(&self, status: LogStatus) -> StoreResult<Vec<ActionLog>>;
}

/// Session issuance for spawned actions.
pub trait SessionStore: Send + Sync {
    /// Issue a session scoped to `owner`. A zero timeout means no expiry.
    fn create(&self, owner: UserId, timeout: Duration) -> StoreResult<SessionId>;

    /// Tear a session down. Returns `false` if it was unknown.
    fn remove(&self, id: &SessionId) -> bool;
}

/// The event-matching query layer.
pub trait ActionQuery: Send + Sync {
    fn match_actions_for_event(&self, event: &EventRecord) -> StoreResult<Vec<ActionDefinition>>;

    /// Fill in derived fields of `event` (current trigger state, host groups).
    fn fill_event_details(&self, event: &mut EventRecord) -> StoreResult<()>;
}

/// A job for the incident-tracker sender.
#[derive(Debug, Clone, PartialEq)]
pub struct IncidentJob {
    pub tracker_id: u32,
    pub option_id: Option<String>,
    pub event: EventRecord,
}

/// Status reports from the incident sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncidentJobStatus {
    Started,
    Succeeded,
    Failed(String),
}

/// Invoked by the sender, from any thread, as the job progresses.
pub type IncidentStatusCallback = Box<dyn Fn(IncidentJobStatus) + Send + Sync>;

/// The incident-tracker sender subsystem.
pub trait IncidentSender: Send + Sync {
    fn queue(&self, job: IncidentJob, on_status: IncidentStatusCallback) -> StoreResult<()>;
}
