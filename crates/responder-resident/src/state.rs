//! Master-side connection state machine.
//!
//! ```text
//! Init -> WaitLaunched -> WaitParamAck -> Idle <-> WaitNotifyAck
//! ```
//!
//! Closing is not a state: the connection is killed from wherever it is and
//! the history stops growing.

use crate::errors::{WireError, WireResult};
use crate::protocol::PacketType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Transitions kept for introspection.
const HISTORY_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResidentState {
    /// Nothing spawned yet.
    Init,
    /// Host spawned; waiting for `Launched`.
    WaitLaunched,
    /// `Parameters` sent; waiting for `ModuleLoaded`.
    WaitParamAck,
    /// A `NotifyEvent` is in flight.
    WaitNotifyAck,
    /// Ready to send the next notification.
    Idle,
}

impl fmt::Display for ResidentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResidentState::Init => write!(f, "init"),
            ResidentState::WaitLaunched => write!(f, "wait_launched"),
            ResidentState::WaitParamAck => write!(f, "wait_param_ack"),
            ResidentState::WaitNotifyAck => write!(f, "wait_notify_ack"),
            ResidentState::Idle => write!(f, "idle"),
        }
    }
}

impl ResidentState {
    /// The only packet the slave may send in this state.
    pub fn expected_packet(&self) -> Option<PacketType> {
        match self {
            ResidentState::WaitLaunched => Some(PacketType::Launched),
            ResidentState::WaitParamAck => Some(PacketType::ModuleLoaded),
            ResidentState::WaitNotifyAck => Some(PacketType::NotifyEventAck),
            ResidentState::Init | ResidentState::Idle => None,
        }
    }

    /// Whether the module is loaded and notifications can flow.
    pub fn is_ready(&self) -> bool {
        matches!(self, ResidentState::Idle | ResidentState::WaitNotifyAck)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from_state: ResidentState,
    pub to_state: ResidentState,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ResidentStateMachine {
    label: String,
    current_state: ResidentState,
    history: Vec<StateTransition>,
}

impl ResidentStateMachine {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            current_state: ResidentState::Init,
            history: Vec::new(),
        }
    }

    pub fn current_state(&self) -> ResidentState {
        self.current_state
    }

    pub fn history(&self) -> &[StateTransition] {
        &self.history
    }

    /// Visited states in order, starting with the oldest one still recorded.
    pub fn states(&self) -> Vec<ResidentState> {
        let first = self
            .history
            .first()
            .map(|t| t.from_state)
            .unwrap_or(self.current_state);
        std::iter::once(first)
            .chain(self.history.iter().map(|t| t.to_state))
            .collect()
    }

    pub fn is_valid_transition(&self, target: ResidentState) -> bool {
        use ResidentState::*;
        matches!(
            (self.current_state, target),
            (Init, WaitLaunched)
                | (WaitLaunched, WaitParamAck)
                | (WaitParamAck, Idle)
                | (Idle, WaitNotifyAck)
                | (WaitNotifyAck, Idle)
        )
    }

    pub fn transition_to(&mut self, target: ResidentState) -> WireResult<()> {
        if !self.is_valid_transition(target) {
            return Err(WireError::InvalidTransition {
                from: self.current_state,
                to: target,
            });
        }

        self.history.push(StateTransition {
            from_state: self.current_state,
            to_state: target,
            timestamp: Utc::now(),
        });
        if self.history.len() > HISTORY_LIMIT {
            self.history.remove(0);
        }

        tracing::debug!(
            "Resident {} transitioned from {} to {}",
            self.label,
            self.current_state,
            target
        );
        self.current_state = target;
        Ok(())
    }
}
