//! ActionManager handle - Public API for interacting with the dispatcher.
//!
//! A lightweight handle that can be cloned and shared across tasks. All
//! methods send commands to the internal actor and await responses.

use super::admission::Onstage;
use super::commands::ManagerCommand;
use super::types::{DispatchReport, Dispatched};
use responder_common::{ActionDefinition, ActionError, ActionId, EventRecord, Result};
use responder_resident::ResidentState;
use tokio::sync::{mpsc, oneshot};

#[derive(Clone)]
pub struct ActionManager {
    pub(super) cmd_tx: mpsc::Sender<ManagerCommand>,
}

impl ActionManager {
    fn map_send_err(context: &str) -> ActionError {
        ActionError::actor_unavailable(format!("{}: actor unavailable (channel closed)", context))
    }

    fn map_recv_err(context: &str) -> ActionError {
        ActionError::actor_unavailable(format!("{}: actor dropped response", context))
    }

    /// Dispatch one action for one event.
    ///
    /// Returns once the action is started, queued or handed off. Its outcome
    /// is recorded later in the log record named by [`Dispatched::log_id`].
    ///
    /// # Errors
    /// - `InvalidOwner` / `InvalidUser` before anything is spawned or logged
    /// - `MalformedCommand` / `SpawnFailed` with a `Failed` log already written
    /// - `Store` if a collaborator refused the request
    pub async fn dispatch(&self, action: ActionDefinition, event: EventRecord) -> Result<Dispatched> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(ManagerCommand::Dispatch {
                action,
                event,
                resp: tx,
            })
            .await
            .map_err(|_| Self::map_send_err("dispatch"))?;
        rx.await.map_err(|_| Self::map_recv_err("dispatch"))?
    }

    /// Dispatch every action matching `event`. A failure of one action does
    /// not stop the others; only a failing query is an error.
    pub async fn handle_event(&self, event: EventRecord) -> Result<Vec<DispatchReport>> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(ManagerCommand::HandleEvent { event, resp: tx })
            .await
            .map_err(|_| Self::map_send_err("handle_event"))?;
        rx.await.map_err(|_| Self::map_recv_err("handle_event"))?
    }

    pub async fn onstage(&self) -> Result<Onstage> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(ManagerCommand::GetOnstage { resp: tx })
            .await
            .map_err(|_| Self::map_send_err("onstage"))?;
        rx.await.map_err(|_| Self::map_recv_err("onstage"))
    }

    pub async fn resident_history(&self, action_id: ActionId) -> Result<Option<Vec<ResidentState>>> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(ManagerCommand::GetResidentHistory {
                action_id,
                resp: tx,
            })
            .await
            .map_err(|_| Self::map_send_err("resident_history"))?;
        rx.await.map_err(|_| Self::map_recv_err("resident_history"))
    }

    /// Force-kill every child and discard queued work without finalizing logs.
    pub async fn reset(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(ManagerCommand::Reset { resp: tx })
            .await
            .map_err(|_| Self::map_send_err("reset"))?;
        rx.await.map_err(|_| Self::map_recv_err("reset"))
    }
}
