//! Master side of resident connections.
//!
//! One connection per resident action: a host process plus a pipe pair, a
//! reader task and a writer task. Notifications for the action queue up on
//! the connection and are sent one at a time, each waiting for its
//! `NotifyEventAck`. Any protocol violation, I/O error, timeout or host exit
//! closes the connection; the in-flight notification is failed with the
//! matching code and the host is killed.
//!
//! A closed connection moves to `closing` until its host has been collected.
//! Only then are the pipes removed and leftover notifications failed.

use super::actor::ActionManagerActor;
use super::command_line::split_resident_command;
use super::types::{Dispatched, InternalEvent};
use responder_common::{
    ActionDefinition, ActionError, ActionId, EventRecord, FailureCode, LogEnd, LogId, LogStatus,
    NewActionLog, Result, SessionId, SpawnFailure,
};
use responder_resident::{
    NotifyEvent, Packet, PacketReader, PacketWriter, PipePair, ResidentState,
    ResidentStateMachine, WireError,
};
use responder_supervisor::{ActorOutcome, DebutRequest};
use std::collections::VecDeque;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A notification waiting for (or awaiting) its acknowledgement.
pub(super) struct PendingNotification {
    pub event: EventRecord,
    pub log_id: LogId,
    pub session: SessionId,
}

pub(super) struct ResidentConnection {
    pub conn_id: u64,
    pub action: ActionDefinition,
    module_path: String,
    options: String,
    pub state: ResidentStateMachine,
    /// Front entry is in flight while the state is `WaitNotifyAck`.
    pub queue: VecDeque<PendingNotification>,
    pub pid: Option<u32>,
    pipes: Option<PipePair>,
    writer: Option<mpsc::UnboundedSender<Packet>>,
    tasks: Vec<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
    timer_seq: u64,
}

impl ResidentConnection {
    fn new(conn_id: u64, action: ActionDefinition, module_path: String, options: String) -> Self {
        let state = ResidentStateMachine::new(format!("resident-{}", action.id));
        Self {
            conn_id,
            action,
            module_path,
            options,
            state,
            queue: VecDeque::new(),
            pid: None,
            pipes: None,
            writer: None,
            tasks: Vec::new(),
            timer: None,
            timer_seq: 0,
        }
    }

    /// Hand a packet to the writer task.
    fn send(&self, packet: Packet) -> bool {
        self.writer
            .as_ref()
            .map(|writer| writer.send(packet).is_ok())
            .unwrap_or(false)
    }

    fn advance(&mut self, to: ResidentState) -> bool {
        match self.state.transition_to(to) {
            Ok(()) => true,
            Err(e) => {
                error!("Resident connection for action {}: {}", self.action.id, e);
                false
            }
        }
    }

    /// Arm the per-step timer, replacing any running one.
    fn arm_timer(&mut self, events_tx: &mpsc::UnboundedSender<InternalEvent>) {
        self.disarm_timer();
        let Some(timeout) = self.action.timeout() else {
            return;
        };
        self.timer_seq += 1;
        let seq = self.timer_seq;
        let conn_id = self.conn_id;
        let tx = events_tx.clone();
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(InternalEvent::ResidentTimeout { conn_id, seq });
        }));
    }

    fn disarm_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    /// Stop all I/O. Dropping the writer closes our end of `-m2s`.
    pub(super) fn stop_io(&mut self) {
        self.writer = None;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.disarm_timer();
    }
}

impl Drop for ResidentConnection {
    fn drop(&mut self) {
        self.stop_io();
    }
}

impl ActionManagerActor {
    pub(super) fn dispatch_resident(
        &mut self,
        action: ActionDefinition,
        event: EventRecord,
    ) -> Result<Dispatched> {
        let session = self.create_session(&action)?;

        if let Some(conn) = self.residents.get_mut(&action.id) {
            let status = if conn.state.current_state().is_ready() {
                LogStatus::ResidentQueuing
            } else {
                LogStatus::LaunchingResident
            };
            let new = NewActionLog::for_event(&action, &event, status);
            let log_id = match self.collaborators.logs.create_log(new) {
                Ok(log_id) => log_id,
                Err(e) => {
                    self.collaborators.sessions.remove(&session);
                    return Err(e.into());
                }
            };
            conn.queue.push_back(PendingNotification {
                event,
                log_id,
                session,
            });
            let pid = conn.pid;
            debug!(
                "Queued notification for action {} (log {}, {} pending)",
                action.id,
                log_id,
                conn.queue.len()
            );

            self.drain_resident(action.id);
            return Ok(Dispatched {
                action_id: action.id,
                log_id,
                status: self.log_status(log_id, status),
                pid,
            });
        }

        self.launch_resident(action, event, session)
    }

    fn launch_resident(
        &mut self,
        action: ActionDefinition,
        event: EventRecord,
        session: SessionId,
    ) -> Result<Dispatched> {
        let (module_path, options) = match split_resident_command(&action.command) {
            Ok(parts) => parts,
            Err(reason) => {
                self.collaborators.sessions.remove(&session);
                self.record_failure(&action, &event, FailureCode::ExecFailure);
                return Err(ActionError::malformed_command(action.id, reason));
            }
        };

        let new = NewActionLog::for_event(&action, &event, LogStatus::LaunchingResident);
        let log_id = match self.collaborators.logs.create_log(new) {
            Ok(log_id) => log_id,
            Err(e) => {
                self.collaborators.sessions.remove(&session);
                return Err(e.into());
            }
        };

        let conn_id = self.next_conn_id();
        let action_id = action.id;
        let mut conn = ResidentConnection::new(conn_id, action, module_path, options);
        conn.queue.push_back(PendingNotification {
            event,
            log_id,
            session,
        });

        if let Err(e) = self.start_resident(&mut conn) {
            let code = match &e {
                ActionError::SpawnFailed {
                    kind: SpawnFailure::NotFound,
                    ..
                } => FailureCode::EntryNotFound,
                _ => FailureCode::ExecFailure,
            };
            warn!("Resident host for action {} failed to start: {}", action_id, e);
            for pending in conn.queue.drain(..) {
                self.finalize_log(pending.log_id, LogEnd::failed(code));
                self.collaborators.sessions.remove(&pending.session);
            }
            self.resident_history.insert(action_id, conn.state.states());
            return Err(e);
        }

        let pid = conn.pid;
        self.residents.insert(action_id, conn);
        Ok(Dispatched {
            action_id,
            log_id,
            status: LogStatus::LaunchingResident,
            pid,
        })
    }

    /// Create the pipes, spawn the host and start the I/O tasks.
    fn start_resident(&mut self, conn: &mut ResidentConnection) -> Result<()> {
        let action_id = conn.action.id;
        let dir = self.config.pipe_directory();
        let name = format!("responder-{}-{}", action_id, Uuid::new_v4().simple());
        let pipes = PipePair::create(&dir, &name).map_err(|e| {
            ActionError::protocol(action_id, format!("cannot create pipes in {}: {}", dir.display(), e))
        })?;
        let (receiver, sender) = pipes
            .open_master()
            .map_err(|e| ActionError::protocol(action_id, format!("cannot open pipes: {}", e)))?;

        let host = &self.config.resident_host;
        let mut argv = Vec::with_capacity(host.args.len() + 3);
        argv.push(host.executable_path.clone());
        argv.extend(host.args.iter().cloned());
        argv.push("--pipe".to_string());
        argv.push(pipes.base().to_string_lossy().into_owned());

        let conn_id = conn.conn_id;
        let events_tx = self.events_tx.clone();
        let spec = self.spawn_spec(argv, conn.action.working_dir.as_deref(), None);
        let request = DebutRequest::new(spec).on_finished(move |info, outcome| {
            let _ = events_tx.send(InternalEvent::ResidentCollected {
                conn_id,
                pid: info.pid,
                outcome,
            });
        });
        let info = self
            .collector
            .debut(request)
            .map_err(|e| ActionError::SpawnFailed {
                action_id,
                kind: e.spawn_failure().unwrap_or(SpawnFailure::Exec),
                reason: e.to_string(),
            })?;

        let tx = self.events_tx.clone();
        let reader_task = tokio::spawn(async move {
            let mut reader = PacketReader::new(receiver);
            loop {
                let result = reader.next().await;
                let done = !matches!(result, Ok(Some(_)));
                if tx.send(InternalEvent::ResidentPacket { conn_id, result }).is_err() || done {
                    break;
                }
            }
        });

        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Packet>();
        let tx = self.events_tx.clone();
        let writer_task = tokio::spawn(async move {
            let mut writer = PacketWriter::new(sender);
            while let Some(packet) = writer_rx.recv().await {
                if let Err(error) = writer.send(&packet).await {
                    let _ = tx.send(InternalEvent::ResidentWriteFailed { conn_id, error });
                    break;
                }
            }
        });

        conn.pid = Some(info.pid);
        conn.pipes = Some(pipes);
        conn.writer = Some(writer_tx);
        conn.tasks = vec![reader_task, writer_task];
        if !conn.advance(ResidentState::WaitLaunched) {
            return Err(ActionError::protocol(action_id, "connection is not fresh"));
        }
        conn.arm_timer(&self.events_tx);

        info!(
            "Launched resident host PID {} for action {} (module {})",
            info.pid, action_id, conn.module_path
        );
        Ok(())
    }

    fn active_action(&self, conn_id: u64) -> Option<ActionId> {
        self.residents
            .values()
            .find(|conn| conn.conn_id == conn_id)
            .map(|conn| conn.action.id)
    }

    /// Send the next queued notification if the connection is idle.
    fn drain_resident(&mut self, action_id: ActionId) {
        let Some(conn) = self.residents.get_mut(&action_id) else {
            return;
        };
        if conn.state.current_state() != ResidentState::Idle {
            return;
        }
        let Some(front) = conn.queue.front() else {
            return;
        };

        let log_id = front.log_id;
        let packet = Packet::NotifyEvent(NotifyEvent::new(action_id, &front.event, front.session.clone()));
        if !conn.send(packet) {
            self.close_resident(action_id, FailureCode::PipeWriteError);
            return;
        }
        if let Err(e) = self.collaborators.logs.update_log_start(log_id) {
            error!("Failed to mark action log {} started: {}", log_id, e);
        }
        if !conn.advance(ResidentState::WaitNotifyAck) {
            self.close_resident(action_id, FailureCode::UnexpectedPacket);
            return;
        }
        conn.arm_timer(&self.events_tx);
        debug!("Sent notification for action {} (log {})", action_id, log_id);
    }

    pub(super) fn handle_resident_packet(
        &mut self,
        conn_id: u64,
        result: std::result::Result<Option<Packet>, WireError>,
    ) {
        let Some(action_id) = self.active_action(conn_id) else {
            debug!("Dropping input of closed resident connection {}", conn_id);
            return;
        };

        let packet = match result {
            Ok(Some(packet)) => packet,
            Ok(None) => {
                warn!("Resident host of action {} closed its pipe", action_id);
                self.close_resident(action_id, FailureCode::PipeReadError);
                return;
            }
            Err(WireError::UnknownPacketType(packet_type)) => {
                warn!("Resident host of action {} sent unknown packet type {}", action_id, packet_type);
                self.close_resident(action_id, FailureCode::UnexpectedPacket);
                return;
            }
            Err(e) => {
                warn!("Failed to read from resident host of action {}: {}", action_id, e);
                self.close_resident(action_id, FailureCode::PipeReadError);
                return;
            }
        };

        let Some(conn) = self.residents.get_mut(&action_id) else {
            return;
        };
        let state = conn.state.current_state();
        if state.expected_packet() != Some(packet.packet_type()) {
            warn!(
                "Resident host of action {} sent {} in state {}",
                action_id,
                packet.packet_type(),
                state
            );
            self.close_resident(action_id, FailureCode::UnexpectedPacket);
            return;
        }

        match packet {
            Packet::Launched => {
                let parameters = Packet::Parameters {
                    module_path: conn.module_path.clone(),
                    options: conn.options.clone(),
                };
                if !conn.send(parameters) {
                    self.close_resident(action_id, FailureCode::PipeWriteError);
                    return;
                }
                if !conn.advance(ResidentState::WaitParamAck) {
                    self.close_resident(action_id, FailureCode::UnexpectedPacket);
                    return;
                }
                conn.arm_timer(&self.events_tx);
            }
            Packet::ModuleLoaded(code) => {
                if let Some(failure) = code.failure_code() {
                    warn!(
                        "Resident module {} of action {} failed to load: {:?}",
                        conn.module_path, action_id, code
                    );
                    self.close_resident(action_id, failure);
                    return;
                }
                if !conn.advance(ResidentState::Idle) {
                    self.close_resident(action_id, FailureCode::UnexpectedPacket);
                    return;
                }
                conn.disarm_timer();
                info!("Resident module {} of action {} loaded", conn.module_path, action_id);
                self.drain_resident(action_id);
            }
            Packet::NotifyEventAck(result) => {
                let Some(done) = conn.queue.pop_front() else {
                    error!("Acknowledgement for action {} with nothing in flight", action_id);
                    self.close_resident(action_id, FailureCode::UnexpectedPacket);
                    return;
                };
                if !conn.advance(ResidentState::Idle) {
                    conn.queue.push_front(done);
                    self.close_resident(action_id, FailureCode::UnexpectedPacket);
                    return;
                }
                conn.disarm_timer();
                self.finalize_log(done.log_id, LogEnd::succeeded(result as i32));
                self.collaborators.sessions.remove(&done.session);
                debug!(
                    "Notification for action {} acknowledged (log {}, result {})",
                    action_id, done.log_id, result
                );
                self.drain_resident(action_id);
            }
            Packet::Parameters { .. } | Packet::NotifyEvent(_) => {
                self.close_resident(action_id, FailureCode::UnexpectedPacket);
            }
        }
    }

    pub(super) fn handle_resident_write_failed(&mut self, conn_id: u64, error: WireError) {
        if let Some(action_id) = self.active_action(conn_id) {
            warn!("Failed to write to resident host of action {}: {}", action_id, error);
            self.close_resident(action_id, FailureCode::PipeWriteError);
        }
    }

    pub(super) fn handle_resident_timeout(&mut self, conn_id: u64, seq: u64) {
        let Some(action_id) = self.active_action(conn_id) else {
            return;
        };
        let current = self
            .residents
            .get(&action_id)
            .map(|conn| (conn.timer_seq, conn.state.current_state()));
        if let Some((timer_seq, state)) = current {
            if timer_seq == seq && state != ResidentState::Idle {
                warn!("Resident connection of action {} timed out in state {}", action_id, state);
                self.close_resident(action_id, FailureCode::KilledTimeout);
            }
        }
    }

    pub(super) fn handle_resident_collected(&mut self, conn_id: u64, pid: u32, outcome: ActorOutcome) {
        if let Some(conn) = self.closing.remove(&conn_id) {
            debug!("Resident host PID {} of closed connection {} collected", pid, conn_id);
            self.teardown_resident(conn);
            return;
        }
        if let Some(action_id) = self.active_action(conn_id) {
            warn!(
                "Resident host PID {} of action {} exited unexpectedly ({:?}, exit code {})",
                pid, action_id, outcome.failure_code, outcome.exit_code
            );
            self.close_resident(action_id, FailureCode::UnexpectedExit);
        }
    }

    /// Close the connection of `action_id`, failing its in-flight
    /// notification with `code`.
    fn close_resident(&mut self, action_id: ActionId, code: FailureCode) {
        let Some(mut conn) = self.residents.remove(&action_id) else {
            return;
        };
        info!(
            "Closing resident connection for action {} in state {} ({:?})",
            action_id,
            conn.state.current_state(),
            code
        );
        conn.stop_io();

        if let Some(front) = conn.queue.pop_front() {
            self.finalize_log(front.log_id, LogEnd::failed(code));
            self.collaborators.sessions.remove(&front.session);
        }

        let pid = conn.pid;
        match pid {
            Some(pid) if self.collector.is_watching(pid) => {
                self.collector.kill(pid);
                self.closing.insert(conn.conn_id, conn);
            }
            _ => self.teardown_resident(conn),
        }
    }

    /// Final cleanup once the host is gone.
    fn teardown_resident(&mut self, mut conn: ResidentConnection) {
        let action_id = conn.action.id;
        if !conn.queue.is_empty() {
            warn!(
                "Resident connection for action {} torn down with {} queued notifications",
                action_id,
                conn.queue.len()
            );
        }
        for pending in conn.queue.drain(..) {
            self.finalize_log(pending.log_id, LogEnd::failed(FailureCode::UnexpectedExit));
            self.collaborators.sessions.remove(&pending.session);
        }
        self.resident_history.insert(action_id, conn.state.states());
        if let Some(pipes) = conn.pipes.take() {
            debug!("Removing pipe pair {}", pipes.base().display());
        }
    }
}
