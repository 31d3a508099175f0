//! # Responder Supervisor
//!
//! Owns the one spawn + reap authority for action processes.
//!
//! - [`ChildProcessManager`] spawns children, reaps them on a dedicated thread
//!   and supports a blocking global reset that force-kills everything tracked.
//! - [`ActorCollector`] layers application bookkeeping (log id, session,
//!   callbacks, timeout timer) on top and turns exit information into an
//!   [`ActorOutcome`].
//!
//! ## Lock ordering
//!
//! The collector's lock may be held while taking the manager's lock, never the
//! reverse. Manager callbacks for collection run outside the manager's lock;
//! the collector's completion callback runs under the collector's lock and must
//! not call back into the collector.

pub mod child_manager;
pub mod collector;

pub use child_manager::{ChildEvents, ChildProcessManager, DEFAULT_REAP_INTERVAL};
pub use collector::{
    ActorCollector, ActorInfo, ActorOutcome, CollectedFn, DebutRequest, FinishedFn, LogBinding,
};
