//! Core domain types: identifiers, the action / event data model and the
//! status and failure codes recorded in action logs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident($inner:ty)) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub $inner);

        impl $name {
            pub fn get(self) -> $inner {
                self.0
            }
        }

        impl From<$inner> for $name {
            fn from(v: $inner) -> Self {
                Self(v)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

numeric_id!(
    /// Identifies an action definition.
    ActionId(u32)
);
numeric_id!(
    /// Identifies a monitoring server.
    ServerId(u32)
);
numeric_id!(
    /// Identifies one action log record.
    LogId(u64)
);
numeric_id!(
    /// Identifies a user of the responder.
    UserId(u32)
);

impl UserId {
    /// The system principal. Incident-sender actions are owned by it and no
    /// user-defined action ever is.
    pub const SYSTEM: UserId = UserId(0);

    pub fn is_system(self) -> bool {
        self == Self::SYSTEM
    }
}

/// Length of a session identifier on the wire.
pub const SESSION_ID_LEN: usize = 36;

/// Opaque session identifier issued by the session collaborator.
///
/// Always [`SESSION_ID_LEN`] bytes long (a hyphenated UUID).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Wrap an issued id. Returns `None` if the id does not have the wire length.
    pub fn new(id: impl Into<String>) -> Option<Self> {
        let id = id.into();
        (id.len() == SESSION_ID_LEN).then_some(Self(id))
    }

    /// Issue a fresh random id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().hyphenated().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Events
// ============================================================================

/// Event timestamp with nanosecond precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct EventTime {
    pub sec: u64,
    pub nsec: u32,
}

impl EventTime {
    pub fn new(sec: u64, nsec: u32) -> Self {
        Self { sec, nsec }
    }

    pub fn now() -> Self {
        let now = Utc::now();
        Self {
            sec: now.timestamp().max(0) as u64,
            nsec: now.timestamp_subsec_nanos(),
        }
    }
}

/// Formats as `sec.nsec` with a zero padded nanosecond part.
impl fmt::Display for EventTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.sec, self.nsec)
    }
}

macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $value:literal),+ $(,)? } fallback $fallback:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_u16(self) -> u16 {
                match self {
                    $(Self::$variant => $value),+
                }
            }

            pub fn from_u16(value: u16) -> Self {
                match value {
                    $($value => Self::$variant,)+
                    _ => Self::$fallback,
                }
            }
        }
    };
}

wire_enum!(
    /// Kind of monitoring event.
    EventType { Good = 0, Bad = 1, Unknown = 2, Notification = 3 } fallback Unknown
);

wire_enum!(
    TriggerStatus { Ok = 0, Problem = 1, Unknown = 2 } fallback Unknown
);

wire_enum!(
    /// Ordered by urgency; comparisons use the numeric value.
    TriggerSeverity {
        Unknown = 0,
        Info = 1,
        Warning = 2,
        Error = 3,
        Critical = 4,
        Emergency = 5,
    } fallback Unknown
);

/// The event that triggers actions.
///
/// Copied into every dispatch path: later stages run asynchronously after the
/// caller's value may be gone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub server_id: ServerId,
    pub event_id: String,
    pub time: EventTime,
    pub event_type: EventType,
    pub trigger_id: String,
    pub trigger_status: TriggerStatus,
    pub severity: TriggerSeverity,
    pub host_id: String,
    #[serde(default)]
    pub host_name: String,
    #[serde(default)]
    pub host_group_ids: Vec<String>,
    #[serde(default)]
    pub brief: String,
}

// ============================================================================
// Action definitions
// ============================================================================

/// How the severity of an event is compared against a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeverityComparator {
    #[default]
    Equal,
    AtLeast,
}

/// Which fields of an event an action applies to.
///
/// Only fields whose bit is set in `enabled` take part in matching; a condition
/// with no bit set matches every event.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MatchCondition {
    #[serde(default)]
    pub enabled: u32,
    #[serde(default)]
    pub server_id: Option<ServerId>,
    #[serde(default)]
    pub host_id: Option<String>,
    #[serde(default)]
    pub host_group_id: Option<String>,
    #[serde(default)]
    pub trigger_id: Option<String>,
    #[serde(default)]
    pub trigger_status: Option<TriggerStatus>,
    #[serde(default)]
    pub severity: Option<TriggerSeverity>,
    #[serde(default)]
    pub severity_comparator: SeverityComparator,
}

impl MatchCondition {
    pub const SERVER: u32 = 1 << 0;
    pub const HOST: u32 = 1 << 1;
    pub const HOST_GROUP: u32 = 1 << 2;
    pub const TRIGGER: u32 = 1 << 3;
    pub const TRIGGER_STATUS: u32 = 1 << 4;
    pub const TRIGGER_SEVERITY: u32 = 1 << 5;

    pub fn is_enabled(&self, field: u32) -> bool {
        self.enabled & field != 0
    }

    pub fn with_server(mut self, server_id: ServerId) -> Self {
        self.enabled |= Self::SERVER;
        self.server_id = Some(server_id);
        self
    }

    pub fn with_host(mut self, host_id: impl Into<String>) -> Self {
        self.enabled |= Self::HOST;
        self.host_id = Some(host_id.into());
        self
    }

    pub fn with_host_group(mut self, host_group_id: impl Into<String>) -> Self {
        self.enabled |= Self::HOST_GROUP;
        self.host_group_id = Some(host_group_id.into());
        self
    }

    pub fn with_trigger(mut self, trigger_id: impl Into<String>) -> Self {
        self.enabled |= Self::TRIGGER;
        self.trigger_id = Some(trigger_id.into());
        self
    }

    pub fn with_trigger_status(mut self, status: TriggerStatus) -> Self {
        self.enabled |= Self::TRIGGER_STATUS;
        self.trigger_status = Some(status);
        self
    }

    pub fn with_severity(mut self, severity: TriggerSeverity, comparator: SeverityComparator) -> Self {
        self.enabled |= Self::TRIGGER_SEVERITY;
        self.severity = Some(severity);
        self.severity_comparator = comparator;
        self
    }

    /// Evaluate the condition against an event.
    ///
    /// An enabled field without a value never matches.
    pub fn matches(&self, event: &EventRecord) -> bool {
        if self.is_enabled(Self::SERVER) && self.server_id != Some(event.server_id) {
            return false;
        }
        if self.is_enabled(Self::HOST) && self.host_id.as_deref() != Some(event.host_id.as_str()) {
            return false;
        }
        if self.is_enabled(Self::HOST_GROUP) {
            match &self.host_group_id {
                Some(group) if event.host_group_ids.iter().any(|g| g == group) => {}
                _ => return false,
            }
        }
        if self.is_enabled(Self::TRIGGER)
            && self.trigger_id.as_deref() != Some(event.trigger_id.as_str())
        {
            return false;
        }
        if self.is_enabled(Self::TRIGGER_STATUS) && self.trigger_status != Some(event.trigger_status) {
            return false;
        }
        if self.is_enabled(Self::TRIGGER_SEVERITY) {
            let Some(severity) = self.severity else {
                return false;
            };
            let ok = match self.severity_comparator {
                SeverityComparator::Equal => event.severity == severity,
                SeverityComparator::AtLeast => event.severity.as_u16() >= severity.as_u16(),
            };
            if !ok {
                return false;
            }
        }
        true
    }
}

/// What an action does when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    /// One-shot external command.
    Command,
    /// Long-lived counterpart process notified over the resident protocol.
    Resident,
    /// Job handed to the incident-tracker sender.
    IncidentSender,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ActionKind::Command => "command",
            ActionKind::Resident => "resident",
            ActionKind::IncidentSender => "incident-sender",
        })
    }
}

/// A configured action, as read from the external store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDefinition {
    pub id: ActionId,
    #[serde(default)]
    pub condition: MatchCondition,
    pub kind: ActionKind,
    #[serde(default)]
    pub working_dir: Option<String>,
    /// Command line, `module [options]`, or `tracker[:option]` depending on `kind`.
    pub command: String,
    /// Zero means no timeout.
    #[serde(default, with = "crate::duration_serde")]
    pub timeout: Duration,
    pub owner: UserId,
}

impl ActionDefinition {
    pub fn timeout(&self) -> Option<Duration> {
        (!self.timeout.is_zero()).then_some(self.timeout)
    }
}

// ============================================================================
// Action logs
// ============================================================================

/// Lifecycle status of one action log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Started,
    Queuing,
    LaunchingResident,
    ResidentQueuing,
    Succeeded,
    Failed,
    Aborted,
}

impl LogStatus {
    pub const NON_TERMINAL: [LogStatus; 4] = [
        LogStatus::Started,
        LogStatus::Queuing,
        LogStatus::LaunchingResident,
        LogStatus::ResidentQueuing,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, LogStatus::Succeeded | LogStatus::Failed | LogStatus::Aborted)
    }
}

impl fmt::Display for LogStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogStatus::Started => "started",
            LogStatus::Queuing => "queuing",
            LogStatus::LaunchingResident => "launching_resident",
            LogStatus::ResidentQueuing => "resident_queuing",
            LogStatus::Succeeded => "succeeded",
            LogStatus::Failed => "failed",
            LogStatus::Aborted => "aborted",
        })
    }
}

/// Why an execution failed. The numeric value is what the log store keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum FailureCode {
    None = 0,
    ExecFailure = 1,
    EntryNotFound = 2,
    KilledSignal = 3,
    DumpedSignal = 4,
    KilledTimeout = 5,
    UnexpectedExit = 6,
    PipeReadError = 7,
    PipeWriteError = 8,
    UnexpectedPacket = 9,
    ModuleNotFound = 10,
    ModuleMissingSymbol = 11,
    ModuleVersionInvalid = 12,
    ModuleInitFailure = 13,
    ModuleMissingNotifyHandler = 14,
    ModuleUnknownFailure = 15,
    IncidentSenderFailure = 16,
}

/// A persisted action log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionLog {
    pub id: LogId,
    pub action_id: ActionId,
    pub status: LogStatus,
    pub starter: UserId,
    pub queuing_time: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub exit_code: i32,
    pub failure_code: FailureCode,
    pub server_id: Option<ServerId>,
    pub event_id: Option<String>,
}

/// Input for creating a log record.
#[derive(Debug, Clone, PartialEq)]
pub struct NewActionLog {
    pub action_id: ActionId,
    pub status: LogStatus,
    pub starter: UserId,
    pub failure_code: FailureCode,
    pub exit_code: i32,
    pub server_id: Option<ServerId>,
    pub event_id: Option<String>,
}

impl NewActionLog {
    /// A record for an action fired by `event`, starting in `status`.
    pub fn for_event(action: &ActionDefinition, event: &EventRecord, status: LogStatus) -> Self {
        Self {
            action_id: action.id,
            status,
            starter: action.owner,
            failure_code: FailureCode::None,
            exit_code: 0,
            server_id: Some(event.server_id),
            event_id: Some(event.event_id.clone()),
        }
    }

    /// Mark the record as failed from the start.
    pub fn failed(mut self, code: FailureCode) -> Self {
        self.status = LogStatus::Failed;
        self.failure_code = code;
        self
    }
}
