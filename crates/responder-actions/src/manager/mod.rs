//! Action dispatcher - actor-based orchestration.
//!
//! - A single event loop owns all dispatcher state: admission control, the
//!   resident connections and their notification queues.
//! - [`ActionManager`] is a cloneable handle that sends commands over a channel.
//! - Pipe reader / writer tasks, timers and the reaping thread never touch that
//!   state; they post [`InternalEvent`](types::InternalEvent)s to the loop,
//!   which owns every mutation and every deletion.
//!
//! The loop's `select!` is biased towards internal events so completions free
//! capacity before new work is admitted.
//!
//! ## Log lifecycle
//!
//! | Kind | Created as | Finalized by |
//! |------|------------|--------------|
//! | command | `Started`, or `Queuing` when over the ceiling | actor collection |
//! | resident | `LaunchingResident` / `ResidentQueuing` | `NotifyEventAck`, or the close path |
//! | incident sender | `Queuing` | the sender's status callback |

mod actor;
mod admission;
mod command_line;
mod commands;
mod handle;
mod resident;
mod types;

#[cfg(test)]
mod tests;

pub use admission::{CommandAdmission, Onstage, QueuedCommand, Reservation, Ticket};
pub use command_line::{
    build_command_argv, parse_command_line, parse_incident_command, split_resident_command,
    ACTION_ARGS_MARKER,
};
pub use handle::ActionManager;
pub use types::{DispatchReport, Dispatched, SESSION_ID_ENV};

use crate::config::ActionManagerConfig;
use actor::ActionManagerActor;
use anyhow::Context;
use commands::ManagerCommand;
use responder_common::{
    ActionLogStore, ActionQuery, IncidentSender, LogStatus, SessionStore, StoreResult,
};
use responder_supervisor::{ActorCollector, ChildProcessManager};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// The external collaborators the dispatcher talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub logs: Arc<dyn ActionLogStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub query: Arc<dyn ActionQuery>,
    pub incidents: Arc<dyn IncidentSender>,
}

impl ActionManager {
    /// Create the dispatcher and spawn its event loop.
    ///
    /// Log records left unfinished by a previous run are marked `Aborted`
    /// first. Must be called from within a tokio runtime.
    pub async fn new(config: ActionManagerConfig, collaborators: Collaborators) -> anyhow::Result<Self> {
        config.validate()?;

        let aborted = abort_unfinished_logs(collaborators.logs.as_ref())
            .context("Failed to abort unfinished action logs")?;
        if aborted > 0 {
            info!("Marked {} unfinished action logs as aborted", aborted);
        }

        let manager = ChildProcessManager::with_reap_interval(config.reap_interval)
            .context("Failed to start the reaping thread")?;
        let collector = ActorCollector::new(
            manager,
            Arc::clone(&collaborators.logs),
            Arc::clone(&collaborators.sessions),
        );

        info!(
            "Creating action manager (ceiling {}, resident host {})",
            config.max_running_command_actions, config.resident_host.executable_path
        );

        let (cmd_tx, cmd_rx) = mpsc::channel::<ManagerCommand>(32);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let actor = ActionManagerActor::new(config, collaborators, collector, events_tx);
        tokio::spawn(actor.run(cmd_rx, events_rx));

        Ok(ActionManager { cmd_tx })
    }
}

/// Mark every non-terminal log record `Aborted`. Returns how many were marked.
pub fn abort_unfinished_logs(logs: &dyn ActionLogStore) -> StoreResult<usize> {
    let mut aborted = 0;
    for status in LogStatus::NON_TERMINAL {
        for log in logs.get_logs_by_status(status)? {
            match logs.update_log_aborted(log.id) {
                Ok(()) => aborted += 1,
                Err(e) => warn!("Failed to abort action log {}: {}", log.id, e),
            }
        }
    }
    Ok(aborted)
}
