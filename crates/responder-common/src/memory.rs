//! In-memory collaborators, used by the daemon and by tests.

use crate::collaborators::{
    ActionLogStore, ActionQuery, IncidentJob, IncidentJobStatus, IncidentSender,
    IncidentStatusCallback, LogEnd, SessionStore,
};
use crate::errors::{StoreError, StoreResult};
use crate::types::{
    ActionDefinition, ActionLog, EventRecord, LogId, LogStatus, NewActionLog, SessionId, UserId,
};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::debug;

/// Action log store backed by a map.
#[derive(Default)]
pub struct MemoryLogStore {
    inner: Mutex<LogTable>,
}

#[derive(Default)]
struct LogTable {
    next_id: u64,
    logs: BTreeMap<LogId, ActionLog>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every record, ordered by id.
    pub fn all(&self) -> Vec<ActionLog> {
        self.inner.lock().logs.values().cloned().collect()
    }

    /// Insert a record as-is (used to simulate leftovers of a previous run).
    pub fn insert(&self, log: ActionLog) {
        let mut table = self.inner.lock();
        table.next_id = table.next_id.max(log.id.0);
        table.logs.insert(log.id, log);
    }

    fn with_log<F>(&self, id: LogId, f: F) -> StoreResult<()>
    where
        F: FnOnce(&mut ActionLog),
    {
        let mut table = self.inner.lock();
        let log = table
            .logs
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found(format!("action log {}", id)))?;
        f(log);
        Ok(())
    }
}

impl ActionLogStore for MemoryLogStore {
    fn create_log(&self, new: NewActionLog) -> StoreResult<LogId> {
        let mut table = self.inner.lock();
        table.next_id += 1;
        let id = LogId(table.next_id);
        let now = Utc::now();
        let log = ActionLog {
            id,
            action_id: new.action_id,
            status: new.status,
            starter: new.starter,
            queuing_time: matches!(new.status, LogStatus::Queuing | LogStatus::ResidentQueuing)
                .then_some(now),
            start_time: matches!(new.status, LogStatus::Started | LogStatus::LaunchingResident)
                .then_some(now),
            end_time: new.status.is_terminal().then_some(now),
            exit_code: new.exit_code,
            failure_code: new.failure_code,
            server_id: new.server_id,
            event_id: new.event_id,
        };
        debug!("Created action log {} ({})", id, log.status);
        table.logs.insert(id, log);
        Ok(id)
    }

    fn update_log_start(&self, id: LogId) -> StoreResult<()> {
        self.with_log(id, |log| {
            log.status = LogStatus::Started;
            log.start_time = Some(Utc::now());
        })
    }

    fn update_log_end(&self, id: LogId, end: LogEnd) -> StoreResult<()> {
        self.with_log(id, |log| {
            log.status = end.status;
            log.exit_code = end.exit_code;
            log.failure_code = end.failure_code;
            log.end_time = Some(Utc::now());
        })
    }

    fn update_log_aborted(&self, id: LogId) -> StoreResult<()> {
        self.with_log(id, |log| {
            log.status = LogStatus::Aborted;
            log.end_time = Some(Utc::now());
        })
    }

    fn get_log(&self, id: LogId) -> StoreResult<Option<ActionLog>> {
        Ok(self.inner.lock().logs.get(&id).cloned())
    }

    fn get_logs_by_status(&self, status: LogStatus) -> StoreResult<Vec<ActionLog>> {
        Ok(self
            .inner
            .lock()
            .logs
            .values()
            .filter(|log| log.status == status)
            .cloned()
            .collect())
    }
}

/// Session store that issues random ids and remembers their owners.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<SessionId, UserId>>,
    rejected_users: Vec<UserId>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that refuses to issue sessions for the given users.
    pub fn rejecting(users: Vec<UserId>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            rejected_users: users,
        }
    }

    pub fn live_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn owner_of(&self, id: &SessionId) -> Option<UserId> {
        self.sessions.lock().get(id).copied()
    }
}

impl SessionStore for MemorySessionStore {
    fn create(&self, owner: UserId, _timeout: Duration) -> StoreResult<SessionId> {
        if self.rejected_users.contains(&owner) {
            return Err(StoreError::Rejected(format!("unknown user {}", owner)));
        }
        let id = SessionId::generate();
        self.sessions.lock().insert(id.clone(), owner);
        Ok(id)
    }

    fn remove(&self, id: &SessionId) -> bool {
        self.sessions.lock().remove(id).is_some()
    }
}

/// Query layer over a fixed list of definitions.
#[derive(Default)]
pub struct StaticActionQuery {
    actions: Vec<ActionDefinition>,
}

impl StaticActionQuery {
    pub fn new(actions: Vec<ActionDefinition>) -> Self {
        Self { actions }
    }
}

impl ActionQuery for StaticActionQuery {
    fn match_actions_for_event(&self, event: &EventRecord) -> StoreResult<Vec<ActionDefinition>> {
        Ok(self
            .actions
            .iter()
            .filter(|action| action.condition.matches(event))
            .cloned()
            .collect())
    }

    fn fill_event_details(&self, _event: &mut EventRecord) -> StoreResult<()> {
        Ok(())
    }
}

/// Incident sender that records jobs and reports a configurable outcome
/// synchronously.
#[derive(Default)]
pub struct RecordingIncidentSender {
    jobs: Mutex<Vec<IncidentJob>>,
    fail_with: Option<String>,
}

impl RecordingIncidentSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(reason: impl Into<String>) -> Self {
        Self {
            jobs: Mutex::new(Vec::new()),
            fail_with: Some(reason.into()),
        }
    }

    pub fn jobs(&self) -> Vec<IncidentJob> {
        self.jobs.lock().clone()
    }
}

impl IncidentSender for RecordingIncidentSender {
    fn queue(&self, job: IncidentJob, on_status: IncidentStatusCallback) -> StoreResult<()> {
        self.jobs.lock().push(job);
        on_status(IncidentJobStatus::Started);
        match &self.fail_with {
            Some(reason) => on_status(IncidentJobStatus::Failed(reason.clone())),
            None => on_status(IncidentJobStatus::Succeeded),
        }
        Ok(())
    }
}
