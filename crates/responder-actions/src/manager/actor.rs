//! Internal actor implementation for the action manager.
//!
//! This module is NOT public and contains the actor that owns all dispatcher
//! state and processes commands sequentially.

use super::admission::{CommandAdmission, QueuedCommand, Reservation, Ticket};
use super::command_line::{build_command_argv, parse_incident_command};
use super::commands::ManagerCommand;
use super::resident::ResidentConnection;
use super::types::{DispatchReport, Dispatched, InternalEvent, SESSION_ID_ENV};
use super::Collaborators;
use crate::config::ActionManagerConfig;
use responder_common::{
    ActionDefinition, ActionError, ActionId, ActionKind, EventRecord, FailureCode,
    IncidentJob, IncidentJobStatus, IncidentStatusCallback, LogEnd, LogId, LogStatus,
    NewActionLog, Result, SessionId, SpawnFailure,
};
use responder_process::SpawnSpec;
use responder_resident::ResidentState;
use responder_supervisor::{ActorCollector, DebutRequest, LogBinding};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub(super) struct ActionManagerActor {
    pub(super) config: ActionManagerConfig,
    pub(super) collaborators: Collaborators,
    pub(super) collector: ActorCollector,
    pub(super) admission: CommandAdmission,
    /// Live resident connections, one per action.
    pub(super) residents: HashMap<ActionId, ResidentConnection>,
    /// Closed connections whose host has not been collected yet, by connection id.
    pub(super) closing: HashMap<u64, ResidentConnection>,
    /// State sequence of each action's most recently torn down connection.
    pub(super) resident_history: HashMap<ActionId, Vec<ResidentState>>,
    pub(super) events_tx: mpsc::UnboundedSender<InternalEvent>,
    next_conn_id: u64,
}

impl ActionManagerActor {
    pub(super) fn new(
        config: ActionManagerConfig,
        collaborators: Collaborators,
        collector: ActorCollector,
        events_tx: mpsc::UnboundedSender<InternalEvent>,
    ) -> Self {
        let admission = CommandAdmission::new(config.max_running_command_actions);
        Self {
            config,
            collaborators,
            collector,
            admission,
            residents: HashMap::new(),
            closing: HashMap::new(),
            resident_history: HashMap::new(),
            events_tx,
            next_conn_id: 0,
        }
    }

    /// Main event loop.
    pub(super) async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<ManagerCommand>,
        mut events_rx: mpsc::UnboundedReceiver<InternalEvent>,
    ) {
        info!("ActionManager actor started");

        loop {
            tokio::select! {
                biased;

                Some(event) = events_rx.recv() => {
                    self.handle_internal(event);
                }

                maybe_cmd = cmd_rx.recv() => {
                    match maybe_cmd {
                        Some(cmd) => self.handle_command(cmd).await,
                        None => {
                            info!("ActionManager command channel closed, shutting down");
                            break;
                        }
                    }
                }
            }
        }

        self.reset().await;
        info!("ActionManager actor terminated");
    }

    async fn handle_command(&mut self, cmd: ManagerCommand) {
        match cmd {
            ManagerCommand::Dispatch {
                action,
                event,
                resp,
            } => {
                let result = self.dispatch(action, event);
                let _ = resp.send(result);
            }
            ManagerCommand::HandleEvent { event, resp } => {
                let result = self.handle_event(event);
                let _ = resp.send(result);
            }
            ManagerCommand::GetOnstage { resp } => {
                let _ = resp.send(self.admission.onstage());
            }
            ManagerCommand::GetResidentHistory { action_id, resp } => {
                let _ = resp.send(self.resident_states(action_id));
            }
            ManagerCommand::Reset { resp } => {
                self.reset().await;
                let _ = resp.send(());
            }
        }
    }

    fn handle_internal(&mut self, event: InternalEvent) {
        match event {
            InternalEvent::CommandFinished { pid, log_id } => {
                debug!("Command actor PID {} finished (log {:?})", pid, log_id);
                if let Some(log_id) = log_id {
                    let next = self.admission.release(log_id);
                    self.start_queued(next);
                }
            }
            InternalEvent::ResidentPacket { conn_id, result } => {
                self.handle_resident_packet(conn_id, result);
            }
            InternalEvent::ResidentWriteFailed { conn_id, error } => {
                self.handle_resident_write_failed(conn_id, error);
            }
            InternalEvent::ResidentTimeout { conn_id, seq } => {
                self.handle_resident_timeout(conn_id, seq);
            }
            InternalEvent::ResidentCollected {
                conn_id,
                pid,
                outcome,
            } => {
                self.handle_resident_collected(conn_id, pid, outcome);
            }
        }
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    fn handle_event(&mut self, event: EventRecord) -> Result<Vec<DispatchReport>> {
        let actions = self.collaborators.query.match_actions_for_event(&event)?;
        debug!("Event {} matches {} actions", event.event_id, actions.len());

        let reports = actions
            .into_iter()
            .map(|action| {
                let action_id = action.id;
                let result = self.dispatch(action, event.clone());
                if let Err(e) = &result {
                    warn!("Action {} for event {} failed: {}", action_id, event.event_id, e);
                }
                DispatchReport { action_id, result }
            })
            .collect();
        Ok(reports)
    }

    fn dispatch(&mut self, action: ActionDefinition, mut event: EventRecord) -> Result<Dispatched> {
        if let Err(e) = self.collaborators.query.fill_event_details(&mut event) {
            warn!("Could not fill details of event {}: {}", event.event_id, e);
        }
        check_owner(&action)?;

        debug!("Dispatching {} action {} for event {}", action.kind, action.id, event.event_id);
        match action.kind {
            ActionKind::Command => self.dispatch_command(action, event),
            ActionKind::Resident => self.dispatch_resident(action, event),
            ActionKind::IncidentSender => self.dispatch_incident(action, event),
        }
    }

    pub(super) fn create_session(&self, action: &ActionDefinition) -> Result<SessionId> {
        self.collaborators
            .sessions
            .create(action.owner, self.config.session_timeout)
            .map_err(|e| ActionError::InvalidUser {
                action_id: action.id,
                user: action.owner,
                reason: e.to_string(),
            })
    }

    /// Create a log record that is already `Failed` with `code`.
    pub(super) fn record_failure(&self, action: &ActionDefinition, event: &EventRecord, code: FailureCode) {
        let new = NewActionLog::for_event(action, event, LogStatus::Started).failed(code);
        if let Err(e) = self.collaborators.logs.create_log(new) {
            error!("Failed to record failure of action {}: {}", action.id, e);
        }
    }

    pub(super) fn finalize_log(&self, log_id: LogId, end: LogEnd) {
        if let Err(e) = self.collaborators.logs.update_log_end(log_id, end) {
            error!("Failed to finalize action log {}: {}", log_id, e);
        }
    }

    /// Current status of a log record, falling back to `assumed` if the
    /// store cannot tell.
    pub(super) fn log_status(&self, log_id: LogId, assumed: LogStatus) -> LogStatus {
        match self.collaborators.logs.get_log(log_id) {
            Ok(Some(log)) => log.status,
            _ => assumed,
        }
    }

    /// Spawn parameters shared by command actors and resident hosts.
    pub(super) fn spawn_spec(
        &self,
        argv: Vec<String>,
        working_dir: Option<&str>,
        session: Option<&SessionId>,
    ) -> SpawnSpec {
        let mut spec = SpawnSpec::new(argv);
        if let Some(path) = &self.config.path_override {
            spec = spec.env("PATH", path);
        }
        if let Some(path) = &self.config.ld_library_path_override {
            spec = spec.env("LD_LIBRARY_PATH", path);
        }
        if let Some(session) = session {
            spec = spec.env(SESSION_ID_ENV, session.as_str());
        }
        if let Some(dir) = working_dir {
            spec = spec.working_dir(dir);
        }
        spec
    }

    pub(super) fn next_conn_id(&mut self) -> u64 {
        self.next_conn_id += 1;
        self.next_conn_id
    }

    // ------------------------------------------------------------------------
    // Command actions
    // ------------------------------------------------------------------------

    fn dispatch_command(&mut self, action: ActionDefinition, event: EventRecord) -> Result<Dispatched> {
        let reservation = self
            .admission
            .reserve(&action, &event, self.collaborators.logs.as_ref())?;

        match reservation {
            Reservation::Queued(log_id) => Ok(Dispatched {
                action_id: action.id,
                log_id,
                status: LogStatus::Queuing,
                pid: None,
            }),
            Reservation::Granted(ticket) => {
                let result = self.launch_command(ticket, &action, &event, None);
                if result.is_err() {
                    let next = self.admission.cancel(ticket);
                    self.start_queued(next);
                }
                result
            }
        }
    }

    /// Launch queued requests for as long as capacity is handed back.
    fn start_queued(&mut self, mut next: Option<(Ticket, QueuedCommand)>) {
        while let Some((ticket, queued)) = next.take() {
            match self.launch_command(ticket, &queued.action, &queued.event, Some(queued.log_id)) {
                Ok(dispatched) => {
                    debug!(
                        "Queued action {} started as PID {:?}",
                        queued.action.id, dispatched.pid
                    );
                }
                Err(e) => {
                    warn!(
                        "Queued action {} (log {}) could not start: {}",
                        queued.action.id, queued.log_id, e
                    );
                    next = self.admission.cancel(ticket);
                }
            }
        }
    }

    /// Spawn a command actor under an already granted ticket.
    ///
    /// `queued_log` is the `Queuing` record of a request popped from the
    /// queue; otherwise a `Started` record is created here, once the owner
    /// has a session. On error every log record involved is already
    /// finalized and the caller only has to give the ticket back.
    fn launch_command(
        &mut self,
        ticket: Ticket,
        action: &ActionDefinition,
        event: &EventRecord,
        queued_log: Option<LogId>,
    ) -> Result<Dispatched> {
        let fail = |this: &Self, code: FailureCode| match queued_log {
            Some(log_id) => this.finalize_log(log_id, LogEnd::failed(code)),
            None => this.record_failure(action, event, code),
        };

        // A fresh request with an unusable owner leaves no record behind.
        let session = match self.create_session(action) {
            Ok(session) => session,
            Err(e) => {
                if let Some(log_id) = queued_log {
                    self.finalize_log(log_id, LogEnd::failed(FailureCode::ExecFailure));
                }
                return Err(e);
            }
        };

        let argv = match build_command_argv(action, event) {
            Ok(argv) => argv,
            Err(reason) => {
                self.collaborators.sessions.remove(&session);
                fail(self, FailureCode::ExecFailure);
                return Err(ActionError::malformed_command(action.id, reason));
            }
        };

        let log_id = match queued_log {
            Some(log_id) => log_id,
            None => {
                let new = NewActionLog::for_event(action, event, LogStatus::Started);
                match self.collaborators.logs.create_log(new) {
                    Ok(log_id) => log_id,
                    Err(e) => {
                        self.collaborators.sessions.remove(&session);
                        return Err(e.into());
                    }
                }
            }
        };

        let spec = self.spawn_spec(argv, action.working_dir.as_deref(), Some(&session));
        let events_tx = self.events_tx.clone();
        let request = DebutRequest::new(spec)
            .log(LogBinding::Existing(log_id))
            .session(session)
            .timeout(action.timeout())
            .on_finished(move |info, _outcome| {
                let _ = events_tx.send(InternalEvent::CommandFinished {
                    pid: info.pid,
                    log_id: info.log_id,
                });
            });

        match self.collector.debut(request) {
            Ok(info) => {
                self.admission.commit(ticket, log_id);
                info!(
                    "Started command action {} as PID {} (log {})",
                    action.id, info.pid, log_id
                );
                Ok(Dispatched {
                    action_id: action.id,
                    log_id,
                    status: LogStatus::Started,
                    pid: Some(info.pid),
                })
            }
            Err(e) => {
                warn!("Command action {} failed to start: {}", action.id, e);
                Err(ActionError::SpawnFailed {
                    action_id: action.id,
                    kind: e.spawn_failure().unwrap_or(SpawnFailure::Exec),
                    reason: e.to_string(),
                })
            }
        }
    }

    // ------------------------------------------------------------------------
    // Incident-sender actions
    // ------------------------------------------------------------------------

    fn dispatch_incident(&mut self, action: ActionDefinition, event: EventRecord) -> Result<Dispatched> {
        let (tracker_id, option_id) = match parse_incident_command(&action.command) {
            Ok(parsed) => parsed,
            Err(reason) => {
                self.record_failure(&action, &event, FailureCode::ExecFailure);
                return Err(ActionError::malformed_command(action.id, reason));
            }
        };

        let logs = Arc::clone(&self.collaborators.logs);
        let log_id = logs.create_log(NewActionLog::for_event(&action, &event, LogStatus::Queuing))?;

        let status_logs = Arc::clone(&logs);
        let on_status: IncidentStatusCallback = Box::new(move |status| {
            let result = match status {
                IncidentJobStatus::Started => status_logs.update_log_start(log_id),
                IncidentJobStatus::Succeeded => {
                    status_logs.update_log_end(log_id, LogEnd::succeeded(0))
                }
                IncidentJobStatus::Failed(reason) => {
                    warn!("Incident job for log {} failed: {}", log_id, reason);
                    status_logs.update_log_end(log_id, LogEnd::failed(FailureCode::IncidentSenderFailure))
                }
            };
            if let Err(e) = result {
                error!("Failed to update action log {}: {}", log_id, e);
            }
        });

        let job = IncidentJob {
            tracker_id,
            option_id,
            event,
        };
        if let Err(e) = self.collaborators.incidents.queue(job, on_status) {
            self.finalize_log(log_id, LogEnd::failed(FailureCode::IncidentSenderFailure));
            return Err(e.into());
        }

        info!("Queued incident job for action {} (log {})", action.id, log_id);
        Ok(Dispatched {
            action_id: action.id,
            log_id,
            status: self.log_status(log_id, LogStatus::Queuing),
            pid: None,
        })
    }

    // ========================================================================
    // Queries and reset
    // ========================================================================

    fn resident_states(&self, action_id: ActionId) -> Option<Vec<ResidentState>> {
        if let Some(conn) = self.residents.get(&action_id) {
            return Some(conn.state.states());
        }
        if let Some(conn) = self.closing.values().find(|c| c.action.id == action_id) {
            return Some(conn.state.states());
        }
        self.resident_history.get(&action_id).cloned()
    }

    /// Kill every child and drop all queued work. Log records are left as
    /// they are; the next start marks them aborted.
    async fn reset(&mut self) {
        info!(
            "Resetting action manager ({} actors, {} resident connections)",
            self.collector.len(),
            self.residents.len() + self.closing.len()
        );

        let connections: Vec<ResidentConnection> = self
            .residents
            .drain()
            .map(|(_, c)| c)
            .chain(self.closing.drain().map(|(_, c)| c))
            .collect();
        for mut conn in connections {
            conn.stop_io();
            for pending in conn.queue.drain(..) {
                self.collaborators.sessions.remove(&pending.session);
            }
        }

        let collector = self.collector.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || collector.reset()).await {
            error!("Reset of the actor collector failed: {}", e);
        }

        let discarded = self.admission.reset();
        if discarded > 0 {
            info!("Discarded {} queued command actions", discarded);
        }
    }
}

/// Incident-sender actions must be owned by the system user, all other kinds
/// by a real user.
fn check_owner(action: &ActionDefinition) -> Result<()> {
    let system_owned = action.owner.is_system();
    let allowed = match action.kind {
        ActionKind::IncidentSender => system_owned,
        ActionKind::Command | ActionKind::Resident => !system_owned,
    };
    if allowed {
        Ok(())
    } else {
        Err(ActionError::InvalidOwner {
            action_id: action.id,
            kind: action.kind,
            owner: action.owner,
        })
    }
}
