//! Internal command protocol for the action manager actor.
//!
//! These types are NOT exposed outside the manager module.

use super::admission::Onstage;
use super::types::{DispatchReport, Dispatched};
use responder_common::{ActionDefinition, ActionId, EventRecord, Result};
use responder_resident::ResidentState;
use tokio::sync::oneshot;

pub(super) enum ManagerCommand {
    /// Run one action for one event
    Dispatch {
        action: ActionDefinition,
        event: EventRecord,
        resp: oneshot::Sender<Result<Dispatched>>,
    },
    /// Run every action the query layer matches for the event
    HandleEvent {
        event: EventRecord,
        resp: oneshot::Sender<Result<Vec<DispatchReport>>>,
    },
    GetOnstage { resp: oneshot::Sender<Onstage> },
    /// State sequence of the action's current (or last) resident connection
    GetResidentHistory {
        action_id: ActionId,
        resp: oneshot::Sender<Option<Vec<ResidentState>>>,
    },
    /// Kill everything and discard all queued work
    Reset { resp: oneshot::Sender<()> },
}
