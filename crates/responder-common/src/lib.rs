//! # Responder Common
//!
//! Common types, traits, and utilities shared across the responder crates.
//!
//! This crate provides the foundational abstractions the supervisor, the
//! resident protocol and the dispatcher build upon: identifiers, the action
//! and event data model, log status / failure codes, the error taxonomy and
//! the interfaces of the external collaborators (log store, sessions, query
//! layer, incident sender) together with in-memory implementations of them.

pub mod collaborators;
pub mod duration_serde;
pub mod errors;
pub mod memory;
pub mod types;

// Re-export commonly used items
pub use collaborators::{
    ActionLogStore, ActionQuery, IncidentJob, IncidentJobStatus, IncidentSender,
    IncidentStatusCallback, LogEnd, SessionStore,
};
pub use errors::{
    ActionError, ProcessError, ProcessResult, Result, SpawnFailure, StoreError, StoreResult,
};
pub use memory::{MemoryLogStore, MemorySessionStore, RecordingIncidentSender, StaticActionQuery};
pub use types::{
    ActionDefinition, ActionId, ActionKind, ActionLog, EventRecord, EventTime, EventType,
    FailureCode, LogId, LogStatus, MatchCondition, NewActionLog, ServerId, SessionId,
    SeverityComparator, TriggerSeverity, TriggerStatus, UserId,
};
