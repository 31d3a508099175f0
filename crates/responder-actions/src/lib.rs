//! # Responder Actions
//!
//! The action dispatcher. Given an event and the action definitions it
//! matches, it runs each action as one of:
//!
//! - a **command**: a one-shot child process, bounded by admission control,
//! - a **resident** notification: delivered over a persistent pipe connection
//!   to a long-lived host process,
//! - an **incident-sender** job: handed to the external incident sender.
//!
//! Every execution attempt ends in exactly one finalized action log record.

pub mod config;
pub mod manager;

pub use config::{ActionManagerConfig, ResidentHostConfig};
pub use manager::{
    ActionManager, Collaborators, DispatchReport, Dispatched, Onstage, ACTION_ARGS_MARKER,
    SESSION_ID_ENV,
};
