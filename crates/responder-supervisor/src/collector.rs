//! ActorCollector - registry of live action processes.
//!
//! Every spawned action process ("actor") is tracked here from debut to
//! finalization together with its log id, session, timeout timer and callbacks.
//! The collector is the only place that turns an [`ExitInfo`] into a log
//! outcome.

use crate::child_manager::{ChildEvents, ChildProcessManager};
use parking_lot::Mutex;
use responder_common::{
    ActionLogStore, FailureCode, LogEnd, LogId, LogStatus, NewActionLog, ProcessError,
    ProcessResult, SessionId, SessionStore, SpawnFailure,
};
use responder_process::{ExitInfo, SpawnSpec};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

/// Snapshot of a registered actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorInfo {
    pub pid: u32,
    pub log_id: Option<LogId>,
    pub dont_log: bool,
}

/// How an actor terminated, in log terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActorOutcome {
    pub status: LogStatus,
    pub exit_code: i32,
    pub failure_code: FailureCode,
}

impl ActorOutcome {
    /// Classify a terminal exit. Returns `None` for stop / continue reports.
    pub fn classify(info: ExitInfo, timed_out: bool) -> Option<Self> {
        let outcome = match info {
            ExitInfo::Exited(code) => Self {
                status: LogStatus::Succeeded,
                exit_code: code,
                failure_code: FailureCode::None,
            },
            ExitInfo::Killed(_) if timed_out => Self::failed(FailureCode::KilledTimeout),
            ExitInfo::Killed(_) => Self::failed(FailureCode::KilledSignal),
            ExitInfo::Dumped(_) => Self::failed(FailureCode::DumpedSignal),
            ExitInfo::Stopped(_) | ExitInfo::Continued => return None,
        };
        Some(outcome)
    }

    pub fn failed(failure_code: FailureCode) -> Self {
        Self {
            status: LogStatus::Failed,
            exit_code: 0,
            failure_code,
        }
    }

    pub fn log_end(&self) -> LogEnd {
        LogEnd {
            status: self.status,
            exit_code: self.exit_code,
            failure_code: self.failure_code,
        }
    }
}

/// Where the actor's log record comes from.
#[derive(Debug, Clone)]
pub enum LogBinding {
    /// No log record at all.
    None,
    /// Create a fresh record; its status is forced to `Started` on success.
    Create(NewActionLog),
    /// Promote an existing (queued) record to `Started`.
    Existing(LogId),
}

/// Runs under the collector's lock as soon as the exit is classified.
pub type CollectedFn = Box<dyn FnOnce(&ActorInfo, &ActorOutcome) + Send>;

/// Runs after finalization, with no lock held.
pub type FinishedFn = Box<dyn FnOnce(ActorInfo, ActorOutcome) + Send>;

/// Everything needed to start and track one actor.
pub struct DebutRequest {
    pub spawn: SpawnSpec,
    pub log: LogBinding,
    /// Released when the actor is finalized, or right away if the spawn fails.
    pub session: Option<SessionId>,
    pub timeout: Option<Duration>,
    pub on_collected: Option<CollectedFn>,
    pub on_finished: Option<FinishedFn>,
}

impl DebutRequest {
    pub fn new(spawn: SpawnSpec) -> Self {
        Self {
            spawn,
            log: LogBinding::None,
            session: None,
            timeout: None,
            on_collected: None,
            on_finished: None,
        }
    }

    pub fn log(mut self, log: LogBinding) -> Self {
        self.log = log;
        self
    }

    pub fn session(mut self, session: SessionId) -> Self {
        self.session = Some(session);
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn on_collected(mut self, f: impl FnOnce(&ActorInfo, &ActorOutcome) + Send + 'static) -> Self {
        self.on_collected = Some(Box::new(f));
        self
    }

    pub fn on_finished(mut self, f: impl FnOnce(ActorInfo, ActorOutcome) + Send + 'static) -> Self {
        self.on_finished = Some(Box::new(f));
        self
    }
}

struct ActorRecord {
    info: ActorInfo,
    session: Option<SessionId>,
    timer: Option<AbortHandle>,
    timed_out: bool,
    outcome: Option<ActorOutcome>,
    on_collected: Option<CollectedFn>,
    on_finished: Option<FinishedFn>,
}

struct CollectorInner {
    manager: ChildProcessManager,
    actors: Mutex<HashMap<u32, ActorRecord>>,
    logs: Arc<dyn ActionLogStore>,
    sessions: Arc<dyn SessionStore>,
}

/// Registry of live actors. Cheap to clone.
#[derive(Clone)]
pub struct ActorCollector {
    inner: Arc<CollectorInner>,
}

impl ActorCollector {
    pub fn new(
        manager: ChildProcessManager,
        logs: Arc<dyn ActionLogStore>,
        sessions: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            inner: Arc::new(CollectorInner {
                manager,
                actors: Mutex::new(HashMap::new()),
                logs,
                sessions,
            }),
        }
    }

    /// Spawn an actor and register it.
    ///
    /// The registry lock is held across the spawn so that a fast-exiting child
    /// cannot be collected before it is registered. On failure the log binding
    /// is finalized as `Failed` (`EntryNotFound` or `ExecFailure`) and the
    /// session is released before the error is returned.
    pub fn debut(&self, request: DebutRequest) -> ProcessResult<ActorInfo> {
        let DebutRequest {
            spawn,
            log,
            session,
            timeout,
            on_collected,
            on_finished,
        } = request;

        let mut actors = self.inner.actors.lock();
        let events: Arc<dyn ChildEvents> = Arc::new(ActorEvents {
            collector: Arc::downgrade(&self.inner),
        });

        let pid = match self.inner.manager.create(&spawn, events) {
            Ok(pid) => pid,
            Err(e) => {
                drop(actors);
                self.record_spawn_failure(&log, &e);
                if let Some(session) = &session {
                    self.inner.sessions.remove(session);
                }
                return Err(e);
            }
        };

        let log_id = match log {
            LogBinding::None => None,
            LogBinding::Create(mut new) => {
                new.status = LogStatus::Started;
                match self.inner.logs.create_log(new) {
                    Ok(id) => Some(id),
                    Err(e) => {
                        error!("Failed to create action log for PID {}: {}", pid, e);
                        None
                    }
                }
            }
            LogBinding::Existing(id) => {
                if let Err(e) = self.inner.logs.update_log_start(id) {
                    error!("Failed to mark action log {} started: {}", id, e);
                }
                Some(id)
            }
        };

        let info = ActorInfo {
            pid,
            log_id,
            dont_log: log_id.is_none(),
        };
        let timer = timeout.and_then(|t| self.arm_timer(pid, t));

        debug!("Actor debut: PID {} (log {:?})", pid, log_id);
        actors.insert(
            pid,
            ActorRecord {
                info: info.clone(),
                session,
                timer,
                timed_out: false,
                outcome: None,
                on_collected,
                on_finished,
            },
        );
        Ok(info)
    }

    fn record_spawn_failure(&self, log: &LogBinding, error: &ProcessError) {
        let code = match error.spawn_failure() {
            Some(SpawnFailure::NotFound) => FailureCode::EntryNotFound,
            _ => FailureCode::ExecFailure,
        };
        let result = match log {
            LogBinding::None => return,
            LogBinding::Create(new) => self.inner.logs.create_log(new.clone().failed(code)).map(|_| ()),
            LogBinding::Existing(id) => self.inner.logs.update_log_end(*id, LogEnd::failed(code)),
        };
        if let Err(e) = result {
            error!("Failed to record spawn failure: {}", e);
        }
    }

    fn arm_timer(&self, pid: u32, timeout: Duration) -> Option<AbortHandle> {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("No runtime available; PID {} runs without its {:?} timeout", pid, timeout);
                return None;
            }
        };
        let collector = Arc::downgrade(&self.inner);
        let task = handle.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = collector.upgrade() {
                ActorCollector { inner }.expire(pid);
            }
        });
        Some(task.abort_handle())
    }

    fn expire(&self, pid: u32) {
        let mut actors = self.inner.actors.lock();
        let Some(record) = actors.get_mut(&pid) else {
            return;
        };
        if record.outcome.is_some() {
            return;
        }
        info!("Actor PID {} timed out; killing it", pid);
        record.timed_out = true;
        record.timer = None;
        self.inner.manager.kill(pid);
    }

    /// Whether `pid` is a live actor.
    pub fn is_watching(&self, pid: u32) -> bool {
        self.inner.actors.lock().contains_key(&pid)
    }

    pub fn len(&self) -> usize {
        self.inner.actors.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keep the actor's log record untouched when it finishes. The caller
    /// takes over finalizing the record.
    pub fn suppress_logging(&self, pid: u32) -> bool {
        match self.inner.actors.lock().get_mut(&pid) {
            Some(record) => {
                record.info.dont_log = true;
                true
            }
            None => false,
        }
    }

    /// Force-kill a live actor.
    pub fn kill(&self, pid: u32) -> bool {
        let actors = self.inner.actors.lock();
        actors.contains_key(&pid) && self.inner.manager.kill(pid)
    }

    /// Kill and drop every actor without finalizing their logs.
    pub fn reset(&self) {
        self.inner.manager.reset();
        let leftovers: Vec<ActorRecord> = self.inner.actors.lock().drain().map(|(_, r)| r).collect();
        for record in leftovers {
            self.inner.release(record);
        }
    }
}

impl CollectorInner {
    fn release(&self, record: ActorRecord) {
        if let Some(timer) = record.timer {
            timer.abort();
        }
        if let Some(session) = &record.session {
            self.sessions.remove(session);
        }
    }
}

struct ActorEvents {
    collector: Weak<CollectorInner>,
}

impl ChildEvents for ActorEvents {
    fn on_collected(&self, pid: u32, info: ExitInfo) {
        let Some(inner) = self.collector.upgrade() else {
            return;
        };
        let mut actors = inner.actors.lock();
        let Some(record) = actors.get_mut(&pid) else {
            warn!("Collected PID {} which is not a registered actor", pid);
            return;
        };
        let Some(outcome) = ActorOutcome::classify(info, record.timed_out) else {
            return;
        };
        debug!("Actor PID {} {} -> {:?}", pid, info, outcome.failure_code);
        if let Some(callback) = record.on_collected.take() {
            callback(&record.info, &outcome);
        }
        record.outcome = Some(outcome);
    }

    fn on_finalized(&self, pid: u32) {
        let Some(inner) = self.collector.upgrade() else {
            return;
        };
        let Some(mut record) = inner.actors.lock().remove(&pid) else {
            return;
        };

        let outcome = record.outcome.unwrap_or_else(|| {
            warn!("Actor PID {} finalized without an exit status", pid);
            ActorOutcome::failed(FailureCode::UnexpectedExit)
        });
        if let (Some(log_id), false) = (record.info.log_id, record.info.dont_log) {
            if let Err(e) = inner.logs.update_log_end(log_id, outcome.log_end()) {
                error!("Failed to finalize action log {}: {}", log_id, e);
            }
        }

        let on_finished = record.on_finished.take();
        let info = record.info.clone();
        inner.release(record);
        if let Some(callback) = on_finished {
            callback(info, outcome);
        }
    }

    fn on_reset(&self, pid: u32) {
        let Some(inner) = self.collector.upgrade() else {
            return;
        };
        let record = inner.actors.lock().remove(&pid);
        if let Some(record) = record {
            debug!("Actor PID {} discarded by reset", pid);
            inner.release(record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use responder_common::{ActionId, MemoryLogStore, MemorySessionStore, UserId};
    use std::sync::mpsc;
    use std::time::Instant;

    struct Fixture {
        collector: ActorCollector,
        logs: Arc<MemoryLogStore>,
        sessions: Arc<MemorySessionStore>,
    }

    fn fixture() -> Fixture {
        let logs = Arc::new(MemoryLogStore::new());
        let sessions = Arc::new(MemorySessionStore::new());
        let collector = ActorCollector::new(
            ChildProcessManager::new().unwrap(),
            logs.clone(),
            sessions.clone(),
        );
        Fixture {
            collector,
            logs,
            sessions,
        }
    }

    fn sh(script: &str) -> SpawnSpec {
        SpawnSpec::new(vec!["sh".into(), "-c".into(), script.into()])
    }

    fn new_log() -> NewActionLog {
        NewActionLog {
            action_id: ActionId(7),
            status: LogStatus::Queuing,
            starter: UserId(3),
            failure_code: FailureCode::None,
            exit_code: 0,
            server_id: None,
            event_id: None,
        }
    }

    fn finished_channel() -> (
        mpsc::Sender<(ActorInfo, ActorOutcome)>,
        mpsc::Receiver<(ActorInfo, ActorOutcome)>,
    ) {
        mpsc::channel()
    }

    #[test]
    fn test_classify() {
        let ok = ActorOutcome::classify(ExitInfo::Exited(3), false).unwrap();
        assert_eq!(ok.status, LogStatus::Succeeded);
        assert_eq!(ok.exit_code, 3);

        let killed = ActorOutcome::classify(ExitInfo::Killed(9), false).unwrap();
        assert_eq!(killed.failure_code, FailureCode::KilledSignal);

        let timed_out = ActorOutcome::classify(ExitInfo::Killed(9), true).unwrap();
        assert_eq!(timed_out.failure_code, FailureCode::KilledTimeout);

        let dumped = ActorOutcome::classify(ExitInfo::Dumped(11), false).unwrap();
        assert_eq!(dumped.failure_code, FailureCode::DumpedSignal);

        // A timer that fires after a clean exit does not turn it into a failure.
        let late = ActorOutcome::classify(ExitInfo::Exited(0), true).unwrap();
        assert_eq!(late.status, LogStatus::Succeeded);

        assert!(ActorOutcome::classify(ExitInfo::Stopped(19), false).is_none());
        assert!(ActorOutcome::classify(ExitInfo::Continued, false).is_none());
    }

    #[test]
    fn test_exit_code_is_logged() {
        let f = fixture();
        let (tx, rx) = finished_channel();
        let session = f.sessions.create(UserId(3), Duration::ZERO).unwrap();

        let info = f
            .collector
            .debut(
                DebutRequest::new(sh("exit 3"))
                    .log(LogBinding::Create(new_log()))
                    .session(session.clone())
                    .on_finished(move |info, outcome| {
                        let _ = tx.send((info, outcome));
                    }),
            )
            .unwrap();
        let log_id = info.log_id.unwrap();

        let (done, outcome) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(done.pid, info.pid);
        assert_eq!(outcome.exit_code, 3);

        let log = f.logs.get_log(log_id).unwrap().unwrap();
        assert_eq!(log.status, LogStatus::Succeeded);
        assert_eq!(log.exit_code, 3);
        assert!(log.start_time.is_some());
        assert_eq!(f.sessions.live_count(), 0);
        assert!(!f.collector.is_watching(info.pid));
    }

    #[test]
    fn test_collected_callback_runs_before_finished() {
        let f = fixture();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = finished_channel();
        let (o1, o2) = (order.clone(), order.clone());

        f.collector
            .debut(
                DebutRequest::new(sh("exit 0"))
                    .on_collected(move |_, _| o1.lock().push("collected"))
                    .on_finished(move |info, outcome| {
                        o2.lock().push("finished");
                        let _ = tx.send((info, outcome));
                    }),
            )
            .unwrap();

        rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(*order.lock(), vec!["collected", "finished"]);
    }

    #[test]
    fn test_existing_log_is_promoted_and_killed_signal_logged() {
        let f = fixture();
        let log_id = f.logs.create_log(new_log()).unwrap();
        let (tx, rx) = finished_channel();

        let info = f
            .collector
            .debut(
                DebutRequest::new(sh("exec sleep 30"))
                    .log(LogBinding::Existing(log_id))
                    .on_finished(move |info, outcome| {
                        let _ = tx.send((info, outcome));
                    }),
            )
            .unwrap();
        assert_eq!(f.logs.get_log(log_id).unwrap().unwrap().status, LogStatus::Started);

        assert!(f.collector.kill(info.pid));
        let (_, outcome) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(outcome.failure_code, FailureCode::KilledSignal);
        let log = f.logs.get_log(log_id).unwrap().unwrap();
        assert_eq!(log.status, LogStatus::Failed);
        assert_eq!(log.failure_code, FailureCode::KilledSignal);
    }

    #[test]
    fn test_spawn_failure_logs_entry_not_found() {
        let f = fixture();
        let session = f.sessions.create(UserId(3), Duration::ZERO).unwrap();

        let err = f
            .collector
            .debut(
                DebutRequest::new(SpawnSpec::new(vec!["/nonexistent/responder-action".into()]))
                    .log(LogBinding::Create(new_log()))
                    .session(session),
            )
            .unwrap_err();
        assert_eq!(err.spawn_failure(), Some(SpawnFailure::NotFound));

        let logs = f.logs.all();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, LogStatus::Failed);
        assert_eq!(logs[0].failure_code, FailureCode::EntryNotFound);
        assert_eq!(f.sessions.live_count(), 0);
        assert!(f.collector.is_empty());
    }

    #[test]
    fn test_suppressed_logging_leaves_record_alone() {
        let f = fixture();
        let (tx, rx) = finished_channel();
        let info = f
            .collector
            .debut(
                DebutRequest::new(sh("exec sleep 30"))
                    .log(LogBinding::Create(new_log()))
                    .on_finished(move |info, outcome| {
                        let _ = tx.send((info, outcome));
                    }),
            )
            .unwrap();

        assert!(f.collector.suppress_logging(info.pid));
        f.collector.kill(info.pid);
        let (done, _) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert!(done.dont_log);
        let log = f.logs.get_log(info.log_id.unwrap()).unwrap().unwrap();
        assert_eq!(log.status, LogStatus::Started);
    }

    #[tokio::test]
    async fn test_timeout_kills_actor() {
        let f = fixture();
        let (tx, rx) = finished_channel();
        let started = Instant::now();

        let info = f
            .collector
            .debut(
                DebutRequest::new(sh("exec sleep 30"))
                    .log(LogBinding::Create(new_log()))
                    .timeout(Some(Duration::from_millis(200)))
                    .on_finished(move |info, outcome| {
                        let _ = tx.send((info, outcome));
                    }),
            )
            .unwrap();

        let (_, outcome) = tokio::task::spawn_blocking(move || rx.recv_timeout(Duration::from_secs(10)))
            .await
            .unwrap()
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(outcome.failure_code, FailureCode::KilledTimeout);
        let log = f.logs.get_log(info.log_id.unwrap()).unwrap().unwrap();
        assert_eq!(log.failure_code, FailureCode::KilledTimeout);
    }

    #[test]
    fn test_reset_discards_actors_without_logging() {
        let f = fixture();
        let session = f.sessions.create(UserId(3), Duration::ZERO).unwrap();
        let info = f
            .collector
            .debut(
                DebutRequest::new(sh("exec sleep 30"))
                    .log(LogBinding::Create(new_log()))
                    .session(session)
                    .on_finished(|_, _| panic!("reset actors are never finished")),
            )
            .unwrap();

        f.collector.reset();

        assert!(f.collector.is_empty());
        assert_eq!(f.sessions.live_count(), 0);
        let log = f.logs.get_log(info.log_id.unwrap()).unwrap().unwrap();
        assert_eq!(log.status, LogStatus::Started);
    }
}
