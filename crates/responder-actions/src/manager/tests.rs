//! Unit tests for the action manager module.

use super::*;
use crate::config::ResidentHostConfig;
use responder_common::{
    ActionDefinition, ActionError, ActionId, ActionKind, ActionLog, EventRecord, EventTime,
    EventType, FailureCode, LogId, LogStatus, MatchCondition, MemoryLogStore,
    MemorySessionStore, RecordingIncidentSender, ServerId, SpawnFailure, StaticActionQuery,
    TriggerSeverity, TriggerStatus, UserId,
};
use responder_resident::builtin::{builtin_registry, EVENT_LOG_MODULE};
use responder_resident::{
    open_slave, ModuleLoadCode, Packet, PacketReader, PacketWriter, ResidentHost, ResidentState,
};
use std::path::{Path, PathBuf};
use tokio::time::Duration;

const WAIT: Duration = Duration::from_secs(10);

/// Poll the log store until `predicate` holds for `log_id` or `timeout` expires.
async fn wait_for_log(
    logs: &MemoryLogStore,
    log_id: LogId,
    predicate: impl Fn(&ActionLog) -> bool,
    timeout: Duration,
) -> ActionLog {
    let poll_interval = Duration::from_millis(5);
    let result = tokio::time::timeout(timeout, async {
        loop {
            if let Ok(Some(log)) = logs.get_log(log_id) {
                if predicate(&log) {
                    return log;
                }
            }
            tokio::time::sleep(poll_interval).await;
        }
    })
    .await;

    match result {
        Ok(log) => log,
        Err(_) => panic!(
            "wait_for_log timed out after {:?}. Final record: {:?}",
            timeout,
            logs.get_log(log_id)
        ),
    }
}

/// Poll `predicate` until it holds or `WAIT` expires.
async fn wait_until(predicate: impl Fn() -> bool, what: &str) {
    let result = tokio::time::timeout(WAIT, async {
        while !predicate() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {}", what);
}

fn finished(log: &ActionLog) -> bool {
    log.status.is_terminal()
}

fn action(id: u32, kind: ActionKind, command: &str) -> ActionDefinition {
    ActionDefinition {
        id: ActionId(id),
        condition: MatchCondition::default(),
        kind,
        working_dir: None,
        command: command.to_string(),
        timeout: Duration::ZERO,
        owner: if kind == ActionKind::IncidentSender {
            UserId::SYSTEM
        } else {
            UserId(1)
        },
    }
}

fn event(id: &str) -> EventRecord {
    EventRecord {
        server_id: ServerId(1),
        event_id: id.to_string(),
        time: EventTime::new(1_700_000_000, 42),
        event_type: EventType::Bad,
        trigger_id: "100".to_string(),
        trigger_status: TriggerStatus::Problem,
        severity: TriggerSeverity::Warning,
        host_id: "host-7".to_string(),
        host_name: "web-7".to_string(),
        host_group_ids: vec!["2".to_string()],
        brief: "disk full".to_string(),
    }
}

struct Setup {
    config: ActionManagerConfig,
    logs: Arc<MemoryLogStore>,
    sessions: MemorySessionStore,
    incidents: RecordingIncidentSender,
    actions: Vec<ActionDefinition>,
}

struct Fixture {
    manager: ActionManager,
    logs: Arc<MemoryLogStore>,
    sessions: Arc<MemorySessionStore>,
    incidents: Arc<RecordingIncidentSender>,
    dir: tempfile::TempDir,
}

impl Setup {
    fn new() -> Self {
        let config = ActionManagerConfig {
            // The host only has to stay alive; tests attach their own peer.
            resident_host: ResidentHostConfig {
                executable_path: "sh".to_string(),
                args: vec![
                    "-c".to_string(),
                    "exec sleep 30".to_string(),
                    "resident-host".to_string(),
                ],
            },
            ..ActionManagerConfig::default()
        };
        Self {
            config,
            logs: Arc::new(MemoryLogStore::new()),
            sessions: MemorySessionStore::new(),
            incidents: RecordingIncidentSender::new(),
            actions: Vec::new(),
        }
    }

    async fn start(self) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config = self.config;
        config.pipe_directory = Some(dir.path().to_path_buf());

        let sessions = Arc::new(self.sessions);
        let incidents = Arc::new(self.incidents);
        let collaborators = Collaborators {
            logs: self.logs.clone(),
            sessions: sessions.clone(),
            query: Arc::new(StaticActionQuery::new(self.actions)),
            incidents: incidents.clone(),
        };
        let manager = ActionManager::new(config, collaborators).await.unwrap();
        Fixture {
            manager,
            logs: self.logs,
            sessions,
            incidents,
            dir,
        }
    }
}

/// Wait until the dispatcher has created a pipe pair in `dir`.
async fn find_pipe_base(dir: &Path) -> PathBuf {
    let scan = |dir: &Path| -> Option<PathBuf> {
        std::fs::read_dir(dir).ok()?.flatten().find_map(|entry| {
            let name = entry.file_name().into_string().ok()?;
            name.strip_suffix("-m2s").map(|base| dir.join(base))
        })
    };
    tokio::time::timeout(WAIT, async {
        loop {
            if let Some(base) = scan(dir) {
                return base;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("no pipe pair appeared")
}

/// Serve the next pipe pair in `dir` with the built-in modules.
fn spawn_resident_host(dir: &Path) -> tokio::task::JoinHandle<()> {
    let dir = dir.to_path_buf();
    tokio::spawn(async move {
        let base = find_pipe_base(&dir).await;
        if let Err(e) = ResidentHost::new(builtin_registry()).run(&base).await {
            tracing::debug!("test resident host stopped: {}", e);
        }
    })
}

// ============================================================================
// Command actions
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_command_exit_code_is_logged() {
    let fx = Setup::new().start().await;
    let dispatched = fx
        .manager
        .dispatch(action(1, ActionKind::Command, "sh -c 'exit 3' sh"), event("1"))
        .await
        .unwrap();
    assert_eq!(dispatched.status, LogStatus::Started);
    assert!(dispatched.pid.is_some());

    let log = wait_for_log(&fx.logs, dispatched.log_id, finished, WAIT).await;
    assert_eq!(log.status, LogStatus::Succeeded);
    assert_eq!(log.exit_code, 3);
    assert_eq!(log.failure_code, FailureCode::None);
    assert_eq!(log.event_id.as_deref(), Some("1"));
    wait_until(|| fx.sessions.live_count() == 0, "sessions to be released").await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_ceiling_queues_and_admits_in_order() {
    let mut setup = Setup::new();
    setup.config.max_running_command_actions = 1;
    let fx = setup.start().await;

    let first = fx
        .manager
        .dispatch(action(1, ActionKind::Command, "sh -c 'sleep 0.3' sh"), event("1"))
        .await
        .unwrap();
    let second = fx
        .manager
        .dispatch(action(2, ActionKind::Command, "true"), event("2"))
        .await
        .unwrap();
    assert_eq!(first.status, LogStatus::Started);
    assert_eq!(second.status, LogStatus::Queuing);
    assert_eq!(second.pid, None);

    let onstage = fx.manager.onstage().await.unwrap();
    assert_eq!(
        onstage,
        Onstage {
            running: 1,
            reserved: 0,
            queued: 1
        }
    );

    let first_log = wait_for_log(&fx.logs, first.log_id, finished, WAIT).await;
    let second_log = wait_for_log(&fx.logs, second.log_id, finished, WAIT).await;
    assert_eq!(first_log.status, LogStatus::Succeeded);
    assert_eq!(second_log.status, LogStatus::Succeeded);
    assert!(second_log.queuing_time.is_some());
    assert!(second_log.start_time.unwrap() >= first_log.end_time.unwrap());

    let onstage = fx.manager.onstage().await.unwrap();
    assert_eq!(onstage.queued, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_command_timeout() {
    let fx = Setup::new().start().await;
    let mut slow = action(1, ActionKind::Command, "sh -c 'sleep 30' sh");
    slow.timeout = Duration::from_millis(200);

    let dispatched = fx.manager.dispatch(slow, event("1")).await.unwrap();
    let log = wait_for_log(&fx.logs, dispatched.log_id, finished, WAIT).await;
    assert_eq!(log.status, LogStatus::Failed);
    assert_eq!(log.failure_code, FailureCode::KilledTimeout);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_command_arguments_and_environment() {
    let fx = Setup::new().start().await;
    let mut echo = action(
        7,
        ActionKind::Command,
        r#"sh -c 'echo "$RESPONDER_SESSION_ID $*" > args.txt' sh"#,
    );
    echo.working_dir = Some(fx.dir.path().display().to_string());

    let dispatched = fx.manager.dispatch(echo, event("55")).await.unwrap();
    let log = wait_for_log(&fx.logs, dispatched.log_id, finished, WAIT).await;
    assert_eq!(log.status, LogStatus::Succeeded);

    let written = std::fs::read_to_string(fx.dir.path().join("args.txt")).unwrap();
    let words: Vec<&str> = written.split_whitespace().collect();
    assert_eq!(words[0].len(), responder_common::types::SESSION_ID_LEN);
    assert_eq!(
        &words[1..],
        &[
            ACTION_ARGS_MARKER,
            "7",
            "1",
            "host-7",
            "1700000000.000000042",
            "55",
            "1",
            "100",
            "1",
            "2",
        ]
    );
    wait_until(|| fx.sessions.live_count() == 0, "sessions to be released").await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_missing_executable_is_entry_not_found() {
    let fx = Setup::new().start().await;
    let result = fx
        .manager
        .dispatch(
            action(1, ActionKind::Command, "/nonexistent/responder-test-binary"),
            event("1"),
        )
        .await;
    assert!(matches!(
        result,
        Err(ActionError::SpawnFailed {
            kind: SpawnFailure::NotFound,
            ..
        })
    ));

    let logs = fx.logs.all();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, LogStatus::Failed);
    assert_eq!(logs[0].failure_code, FailureCode::EntryNotFound);
    assert_eq!(fx.manager.onstage().await.unwrap(), Onstage::default());
    wait_until(|| fx.sessions.live_count() == 0, "sessions to be released").await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_malformed_command_is_logged() {
    let fx = Setup::new().start().await;
    let result = fx
        .manager
        .dispatch(action(1, ActionKind::Command, "echo 'oops"), event("1"))
        .await;
    assert!(matches!(result, Err(ActionError::MalformedCommand { .. })));

    let logs = fx.logs.all();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].failure_code, FailureCode::ExecFailure);
    assert_eq!(fx.manager.onstage().await.unwrap(), Onstage::default());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_owner_and_user_are_checked_before_logging() {
    let mut setup = Setup::new();
    setup.sessions = MemorySessionStore::rejecting(vec![UserId(9)]);
    let fx = setup.start().await;

    let mut system_command = action(1, ActionKind::Command, "true");
    system_command.owner = UserId::SYSTEM;
    assert!(matches!(
        fx.manager.dispatch(system_command, event("1")).await,
        Err(ActionError::InvalidOwner { .. })
    ));

    let mut user_incident = action(2, ActionKind::IncidentSender, "1");
    user_incident.owner = UserId(1);
    assert!(matches!(
        fx.manager.dispatch(user_incident, event("1")).await,
        Err(ActionError::InvalidOwner { .. })
    ));

    let mut unknown_user = action(3, ActionKind::Command, "true");
    unknown_user.owner = UserId(9);
    assert!(matches!(
        fx.manager.dispatch(unknown_user, event("1")).await,
        Err(ActionError::InvalidUser { .. })
    ));

    assert!(fx.logs.all().is_empty());
    assert_eq!(fx.manager.onstage().await.unwrap(), Onstage::default());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_user_command_leaves_no_record() {
    let mut setup = Setup::new();
    setup.sessions = MemorySessionStore::rejecting(vec![UserId(9)]);
    let fx = setup.start().await;

    let mut rejected = action(4, ActionKind::Command, "true");
    rejected.owner = UserId(9);
    let err = fx.manager.dispatch(rejected, event("1")).await.unwrap_err();
    assert!(matches!(
        err,
        ActionError::InvalidUser {
            action_id: ActionId(4),
            user: UserId(9),
            ..
        }
    ));
    assert!(fx.logs.all().is_empty());
    assert_eq!(fx.manager.onstage().await.unwrap(), Onstage::default());

    // The ticket went back: the next valid request runs normally.
    let dispatched = fx
        .manager
        .dispatch(action(5, ActionKind::Command, "true"), event("2"))
        .await
        .unwrap();
    assert_eq!(dispatched.status, LogStatus::Started);
    let log = wait_for_log(&fx.logs, dispatched.log_id, finished, WAIT).await;
    assert_eq!(log.status, LogStatus::Succeeded);
    assert_eq!(fx.logs.all().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reset_kills_without_finalizing() {
    let fx = Setup::new().start().await;
    let dispatched = fx
        .manager
        .dispatch(action(1, ActionKind::Command, "sh -c 'sleep 30' sh"), event("1"))
        .await
        .unwrap();
    let pid = dispatched.pid.unwrap();

    fx.manager.reset().await.unwrap();

    assert_eq!(fx.manager.onstage().await.unwrap(), Onstage::default());
    assert_eq!(
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None),
        Err(nix::errno::Errno::ESRCH)
    );
    let log = fx.logs.get_log(dispatched.log_id).unwrap().unwrap();
    assert_eq!(log.status, LogStatus::Started);
    wait_until(|| fx.sessions.live_count() == 0, "sessions to be released").await;
}

// ============================================================================
// Incident-sender actions
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_incident_job_is_queued_and_logged() {
    let fx = Setup::new().start().await;
    let dispatched = fx
        .manager
        .dispatch(action(4, ActionKind::IncidentSender, "3:urgent"), event("9"))
        .await
        .unwrap();
    assert_eq!(dispatched.status, LogStatus::Succeeded);

    let jobs = fx.incidents.jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].tracker_id, 3);
    assert_eq!(jobs[0].option_id.as_deref(), Some("urgent"));
    assert_eq!(jobs[0].event.event_id, "9");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_incident_failure_is_logged() {
    let mut setup = Setup::new();
    setup.incidents = RecordingIncidentSender::failing("tracker offline");
    let fx = setup.start().await;

    let dispatched = fx
        .manager
        .dispatch(action(4, ActionKind::IncidentSender, "3"), event("9"))
        .await
        .unwrap();
    let log = fx.logs.get_log(dispatched.log_id).unwrap().unwrap();
    assert_eq!(log.status, LogStatus::Failed);
    assert_eq!(log.failure_code, FailureCode::IncidentSenderFailure);

    assert!(matches!(
        fx.manager
            .dispatch(action(5, ActionKind::IncidentSender, "tracker"), event("9"))
            .await,
        Err(ActionError::MalformedCommand { .. })
    ));
}

// ============================================================================
// Startup and event fan-out
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_unfinished_logs_are_aborted_on_startup() {
    let setup = Setup::new();
    let leftover = |id: u64, status: LogStatus| ActionLog {
        id: LogId(id),
        action_id: ActionId(1),
        status,
        starter: UserId(1),
        queuing_time: None,
        start_time: None,
        end_time: None,
        exit_code: 0,
        failure_code: FailureCode::None,
        server_id: None,
        event_id: None,
    };
    setup.logs.insert(leftover(1, LogStatus::Started));
    setup.logs.insert(leftover(2, LogStatus::ResidentQueuing));
    setup.logs.insert(leftover(3, LogStatus::Succeeded));
    let fx = setup.start().await;

    let statuses: Vec<LogStatus> = fx.logs.all().iter().map(|l| l.status).collect();
    assert_eq!(
        statuses,
        vec![LogStatus::Aborted, LogStatus::Aborted, LogStatus::Succeeded]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_handle_event_dispatches_every_match() {
    let mut setup = Setup::new();
    let mut elsewhere = action(3, ActionKind::Command, "true");
    elsewhere.condition = MatchCondition::default().with_host("other-host");
    let mut system_owned = action(2, ActionKind::Command, "true");
    system_owned.owner = UserId::SYSTEM;
    setup.actions = vec![action(1, ActionKind::Command, "true"), system_owned, elsewhere];
    let fx = setup.start().await;

    let reports = fx.manager.handle_event(event("1")).await.unwrap();
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].action_id, ActionId(1));
    assert!(reports[0].result.is_ok());
    assert_eq!(reports[1].action_id, ActionId(2));
    assert!(matches!(
        reports[1].result,
        Err(ActionError::InvalidOwner { .. })
    ));
}

// ============================================================================
// Resident actions
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_resident_notifications_are_serialized() {
    let fx = Setup::new().start().await;
    let out = fx.dir.path().join("events.jsonl");
    let host = spawn_resident_host(fx.dir.path());
    let resident = action(
        6,
        ActionKind::Resident,
        &format!("{} {}", EVENT_LOG_MODULE, out.display()),
    );

    let first = fx.manager.dispatch(resident.clone(), event("e1")).await.unwrap();
    let second = fx.manager.dispatch(resident, event("e2")).await.unwrap();
    assert_eq!(first.status, LogStatus::LaunchingResident);
    // Depending on how far the handshake got, the second one waits for the
    // launch, waits for the first acknowledgement, or goes straight out.
    assert!(matches!(
        second.status,
        LogStatus::LaunchingResident | LogStatus::ResidentQueuing | LogStatus::Started
    ));

    for log_id in [first.log_id, second.log_id] {
        let log = wait_for_log(&fx.logs, log_id, finished, WAIT).await;
        assert_eq!(log.status, LogStatus::Succeeded);
        assert_eq!(log.exit_code, 0);
    }

    let lines: Vec<serde_json::Value> = std::fs::read_to_string(&out)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["event_id"], "e1");
    assert_eq!(lines[1]["event_id"], "e2");
    wait_until(|| fx.sessions.live_count() == 0, "sessions to be released").await;

    use ResidentState::*;
    assert_eq!(
        fx.manager.resident_history(ActionId(6)).await.unwrap(),
        Some(vec![
            Init,
            WaitLaunched,
            WaitParamAck,
            Idle,
            WaitNotifyAck,
            Idle,
            WaitNotifyAck,
            Idle
        ])
    );

    // The connection stays up: the next notification goes straight out.
    let third = fx
        .manager
        .dispatch(
            action(6, ActionKind::Resident, &format!("{} {}", EVENT_LOG_MODULE, out.display())),
            event("e3"),
        )
        .await
        .unwrap();
    assert_eq!(third.status, LogStatus::Started);
    wait_for_log(&fx.logs, third.log_id, |l| l.status == LogStatus::Succeeded, WAIT).await;

    fx.manager.reset().await.unwrap();
    host.abort();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_resident_holds_next_notification_until_ack() {
    let fx = Setup::new().start().await;
    let dir = fx.dir.path().to_path_buf();
    let peer = tokio::spawn(async move {
        let base = find_pipe_base(&dir).await;
        let (receiver, sender) = open_slave(&base).await.unwrap();
        let mut reader = PacketReader::new(receiver);
        let mut writer = PacketWriter::new(sender);
        writer.send(&Packet::Launched).await.unwrap();
        assert!(matches!(
            reader.next().await.unwrap(),
            Some(Packet::Parameters { .. })
        ));
        writer
            .send(&Packet::ModuleLoaded(ModuleLoadCode::Success))
            .await
            .unwrap();

        let mut seen = Vec::new();
        for ack in [5, 6] {
            let notify = match reader.next().await.unwrap() {
                Some(Packet::NotifyEvent(notify)) => notify,
                other => panic!("expected NotifyEvent, got {:?}", other),
            };
            let early = tokio::time::timeout(Duration::from_millis(200), reader.next()).await;
            assert!(early.is_err(), "sent before the ack: {:?}", early);
            seen.push(notify.event_id);
            writer.send(&Packet::NotifyEventAck(ack)).await.unwrap();
        }
        seen
    });

    let resident = action(6, ActionKind::Resident, "builtin:null");
    let first = fx.manager.dispatch(resident.clone(), event("e1")).await.unwrap();
    let second = fx.manager.dispatch(resident, event("e2")).await.unwrap();

    assert_eq!(peer.await.unwrap(), vec!["e1".to_string(), "e2".to_string()]);
    for (log_id, code) in [(first.log_id, 5), (second.log_id, 6)] {
        let log = wait_for_log(&fx.logs, log_id, finished, WAIT).await;
        assert_eq!(log.status, LogStatus::Succeeded);
        assert_eq!(log.exit_code, code);
    }
    fx.manager.reset().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_resident_notify_ack_timeout() {
    let fx = Setup::new().start().await;
    let dir = fx.dir.path().to_path_buf();
    let peer = tokio::spawn(async move {
        let base = find_pipe_base(&dir).await;
        let (receiver, sender) = open_slave(&base).await.unwrap();
        let mut reader = PacketReader::new(receiver);
        let mut writer = PacketWriter::new(sender);
        writer.send(&Packet::Launched).await.unwrap();
        reader.next().await.unwrap();
        writer
            .send(&Packet::ModuleLoaded(ModuleLoadCode::Success))
            .await
            .unwrap();
        // Take the notification and never acknowledge it.
        reader.next().await.unwrap()
    });

    let mut resident = action(7, ActionKind::Resident, "builtin:null");
    resident.timeout = Duration::from_millis(500);
    let started = tokio::time::Instant::now();
    let first = fx.manager.dispatch(resident.clone(), event("e1")).await.unwrap();

    assert!(matches!(peer.await.unwrap(), Some(Packet::NotifyEvent(_))));
    let log = wait_for_log(&fx.logs, first.log_id, finished, WAIT).await;
    assert_eq!(log.status, LogStatus::Failed);
    assert_eq!(log.failure_code, FailureCode::KilledTimeout);
    assert!(started.elapsed() >= resident.timeout);

    // Once the host is collected the pipes go away and the action gets a
    // fresh connection for its next notification.
    wait_until(
        || std::fs::read_dir(fx.dir.path()).unwrap().next().is_none(),
        "pipe pair to be removed",
    )
    .await;
    let host = spawn_resident_host(fx.dir.path());
    let next = fx.manager.dispatch(resident, event("e2")).await.unwrap();
    assert_eq!(next.status, LogStatus::LaunchingResident);
    let log = wait_for_log(&fx.logs, next.log_id, finished, WAIT).await;
    assert_eq!(log.status, LogStatus::Succeeded);
    wait_until(|| fx.sessions.live_count() == 0, "sessions to be released").await;

    fx.manager.reset().await.unwrap();
    host.abort();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_resident_module_load_failure() {
    let fx = Setup::new().start().await;
    let dir = fx.dir.path().to_path_buf();
    let peer = tokio::spawn(async move {
        let base = find_pipe_base(&dir).await;
        let (receiver, sender) = open_slave(&base).await.unwrap();
        let mut reader = PacketReader::new(receiver);
        let mut writer = PacketWriter::new(sender);
        writer.send(&Packet::Launched).await.unwrap();
        let parameters = reader.next().await.unwrap();
        writer
            .send(&Packet::ModuleLoaded(ModuleLoadCode::VersionInvalid))
            .await
            .unwrap();
        parameters
    });

    let dispatched = fx
        .manager
        .dispatch(
            action(8, ActionKind::Resident, "/opt/modules/notify.so --verbose"),
            event("1"),
        )
        .await
        .unwrap();

    let log = wait_for_log(&fx.logs, dispatched.log_id, finished, WAIT).await;
    assert_eq!(log.status, LogStatus::Failed);
    assert_eq!(log.failure_code, FailureCode::ModuleVersionInvalid);

    assert_eq!(
        peer.await.unwrap(),
        Some(Packet::Parameters {
            module_path: "/opt/modules/notify.so".to_string(),
            options: "--verbose".to_string(),
        })
    );
    assert_eq!(
        fx.manager.resident_history(ActionId(8)).await.unwrap(),
        Some(vec![
            ResidentState::Init,
            ResidentState::WaitLaunched,
            ResidentState::WaitParamAck
        ])
    );
    wait_until(|| fx.sessions.live_count() == 0, "sessions to be released").await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_resident_unexpected_packet_closes_connection() {
    let fx = Setup::new().start().await;
    let dir = fx.dir.path().to_path_buf();
    let peer = tokio::spawn(async move {
        let base = find_pipe_base(&dir).await;
        let (_receiver, sender) = open_slave(&base).await.unwrap();
        let mut writer = PacketWriter::new(sender);
        writer.send(&Packet::NotifyEventAck(0)).await.unwrap();
    });

    let dispatched = fx
        .manager
        .dispatch(action(8, ActionKind::Resident, "builtin:null"), event("1"))
        .await
        .unwrap();
    let log = wait_for_log(&fx.logs, dispatched.log_id, finished, WAIT).await;
    assert_eq!(log.failure_code, FailureCode::UnexpectedPacket);
    peer.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_resident_timeout_without_peer() {
    let fx = Setup::new().start().await;
    let mut resident = action(8, ActionKind::Resident, "builtin:null");
    resident.timeout = Duration::from_millis(300);

    let dispatched = fx.manager.dispatch(resident, event("1")).await.unwrap();
    let log = wait_for_log(&fx.logs, dispatched.log_id, finished, WAIT).await;
    assert_eq!(log.status, LogStatus::Failed);
    assert_eq!(log.failure_code, FailureCode::KilledTimeout);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_resident_host_exit_fails_pending_notifications() {
    let mut setup = Setup::new();
    setup.config.resident_host.args = vec![
        "-c".to_string(),
        "exit 0".to_string(),
        "resident-host".to_string(),
    ];
    let fx = setup.start().await;

    let dispatched = fx
        .manager
        .dispatch(action(8, ActionKind::Resident, "builtin:null"), event("1"))
        .await
        .unwrap();
    let log = wait_for_log(&fx.logs, dispatched.log_id, finished, WAIT).await;
    assert_eq!(log.status, LogStatus::Failed);
    assert_eq!(log.failure_code, FailureCode::UnexpectedExit);

    // Pipes are removed once the host has been collected.
    tokio::time::timeout(WAIT, async {
        while std::fs::read_dir(fx.dir.path()).unwrap().next().is_some() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("pipe pair was not removed");
}
