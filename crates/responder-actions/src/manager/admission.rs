//! Admission control for command actions.
//!
//! Bounds the number of command actors onstage (running plus reserved) and
//! queues the excess in FIFO order. A reservation ticket is taken before the
//! spawn so the capacity check and the spawn cannot race.

use parking_lot::Mutex;
use responder_common::{
    ActionDefinition, ActionLogStore, EventRecord, LogId, LogStatus, NewActionLog, StoreResult,
};
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::fmt;
use tracing::{debug, info};

/// A capacity unit granted before a command actor is spawned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ticket(pub u32);

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A command request waiting for capacity. Its log record is already `Queuing`.
#[derive(Debug, Clone)]
pub struct QueuedCommand {
    pub action: ActionDefinition,
    pub event: EventRecord,
    pub log_id: LogId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reservation {
    Granted(Ticket),
    Queued(LogId),
}

/// Onstage counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Onstage {
    pub running: usize,
    pub reserved: usize,
    pub queued: usize,
}

impl Onstage {
    pub fn onstage(&self) -> usize {
        self.running + self.reserved
    }
}

#[derive(Default)]
struct AdmissionState {
    running: HashSet<LogId>,
    reserved: BTreeSet<Ticket>,
    queue: VecDeque<QueuedCommand>,
}

impl AdmissionState {
    fn is_full(&self, ceiling: usize) -> bool {
        self.running.len() + self.reserved.len() >= ceiling
    }

    /// Lowest ticket number not currently reserved.
    fn allocate_ticket(&mut self) -> Ticket {
        let mut next = 0;
        for ticket in &self.reserved {
            if ticket.0 != next {
                break;
            }
            next += 1;
        }
        let ticket = Ticket(next);
        self.reserved.insert(ticket);
        ticket
    }

    fn pop_next(&mut self, ceiling: usize) -> Option<(Ticket, QueuedCommand)> {
        if self.is_full(ceiling) {
            return None;
        }
        let request = self.queue.pop_front()?;
        let ticket = self.allocate_ticket();
        debug!(
            "Admitting queued action {} (log {}) with ticket {}",
            request.action.id, request.log_id, ticket
        );
        Some((ticket, request))
    }
}

/// Admission control state, serialized by one lock.
pub struct CommandAdmission {
    ceiling: usize,
    state: Mutex<AdmissionState>,
}

impl CommandAdmission {
    pub fn new(ceiling: usize) -> Self {
        Self {
            ceiling,
            state: Mutex::new(AdmissionState::default()),
        }
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Reserve capacity, or queue the request behind a fresh `Queuing` log
    /// record when the ceiling is reached.
    pub fn reserve(
        &self,
        action: &ActionDefinition,
        event: &EventRecord,
        logs: &dyn ActionLogStore,
    ) -> StoreResult<Reservation> {
        let mut state = self.state.lock();
        if !state.is_full(self.ceiling) {
            return Ok(Reservation::Granted(state.allocate_ticket()));
        }

        let log_id = logs.create_log(NewActionLog::for_event(action, event, LogStatus::Queuing))?;
        info!(
            "Action {} queued (log {}): {} actions onstage",
            action.id,
            log_id,
            state.running.len() + state.reserved.len()
        );
        state.queue.push_back(QueuedCommand {
            action: action.clone(),
            event: event.clone(),
            log_id,
        });
        Ok(Reservation::Queued(log_id))
    }

    /// Move a reservation into the running set.
    pub fn commit(&self, ticket: Ticket, log_id: LogId) {
        let mut state = self.state.lock();
        state.reserved.remove(&ticket);
        state.running.insert(log_id);
    }

    /// An actor finished. Returns the next queued request, already holding a
    /// reservation, if capacity allows.
    pub fn release(&self, log_id: LogId) -> Option<(Ticket, QueuedCommand)> {
        let mut state = self.state.lock();
        if !state.running.remove(&log_id) {
            debug!("Release of log {} which is not running", log_id);
        }
        state.pop_next(self.ceiling)
    }

    /// Drop a reservation that never ran. Like [`release`](Self::release) it
    /// hands back the next queued request if one can now go.
    pub fn cancel(&self, ticket: Ticket) -> Option<(Ticket, QueuedCommand)> {
        let mut state = self.state.lock();
        state.reserved.remove(&ticket);
        state.pop_next(self.ceiling)
    }

    /// Discard everything, including queued requests, without touching logs.
    pub fn reset(&self) -> usize {
        let mut state = self.state.lock();
        let discarded = state.queue.len();
        *state = AdmissionState::default();
        discarded
    }

    pub fn onstage(&self) -> Onstage {
        let state = self.state.lock();
        Onstage {
            running: state.running.len(),
            reserved: state.reserved.len(),
            queued: state.queue.len(),
        }
    }
}
