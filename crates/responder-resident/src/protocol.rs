//! Resident packet format.
//!
//! Every packet is a 6-byte header (u32 body length, u16 packet type, both
//! little-endian) followed by the body. The master is the dispatcher, the slave
//! is the resident host process.
//!
//! | Type | Name           | Direction      | Body |
//! |------|----------------|----------------|------|
//! | 0    | Launched       | slave → master | empty |
//! | 1    | ModuleLoaded   | slave → master | u32 result code |
//! | 2    | Parameters     | master → slave | string module path, string options |
//! | 3    | NotifyEvent    | master → slave | see [`NotifyEvent`] |
//! | 4    | NotifyEventAck | slave → master | u32 result code |

use crate::codec::{WireReader, WireWriter};
use crate::errors::{WireError, WireResult};
use bytes::{BufMut, Bytes, BytesMut};
use responder_common::types::SESSION_ID_LEN;
use responder_common::{
    ActionId, EventRecord, EventTime, EventType, FailureCode, ServerId, SessionId, TriggerSeverity,
    TriggerStatus,
};
use std::fmt;

pub const HEADER_LEN: usize = 6;

/// Upper bound on a body; anything larger is treated as a corrupted stream.
pub const MAX_BODY_LEN: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum PacketType {
    Launched = 0,
    ModuleLoaded = 1,
    Parameters = 2,
    NotifyEvent = 3,
    NotifyEventAck = 4,
}

impl PacketType {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::Launched),
            1 => Some(Self::ModuleLoaded),
            2 => Some(Self::Parameters),
            3 => Some(Self::NotifyEvent),
            4 => Some(Self::NotifyEventAck),
            _ => None,
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PacketType::Launched => "Launched",
            PacketType::ModuleLoaded => "ModuleLoaded",
            PacketType::Parameters => "Parameters",
            PacketType::NotifyEvent => "NotifyEvent",
            PacketType::NotifyEventAck => "NotifyEventAck",
        })
    }
}

/// Result code of a `ModuleLoaded` packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleLoadCode {
    Success,
    DlopenFailure,
    MissingSymbol,
    VersionInvalid,
    InitFailure,
    MissingNotifyHandler,
    Unknown(u32),
}

impl ModuleLoadCode {
    pub fn from_u32(code: u32) -> Self {
        match code {
            0 => Self::Success,
            1 => Self::DlopenFailure,
            2 => Self::MissingSymbol,
            3 => Self::VersionInvalid,
            4 => Self::InitFailure,
            5 => Self::MissingNotifyHandler,
            other => Self::Unknown(other),
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            Self::Success => 0,
            Self::DlopenFailure => 1,
            Self::MissingSymbol => 2,
            Self::VersionInvalid => 3,
            Self::InitFailure => 4,
            Self::MissingNotifyHandler => 5,
            Self::Unknown(code) => code,
        }
    }

    /// Log failure code for a non-success result.
    pub fn failure_code(self) -> Option<FailureCode> {
        match self {
            Self::Success => None,
            Self::DlopenFailure => Some(FailureCode::ModuleNotFound),
            Self::MissingSymbol => Some(FailureCode::ModuleMissingSymbol),
            Self::VersionInvalid => Some(FailureCode::ModuleVersionInvalid),
            Self::InitFailure => Some(FailureCode::ModuleInitFailure),
            Self::MissingNotifyHandler => Some(FailureCode::ModuleMissingNotifyHandler),
            Self::Unknown(_) => Some(FailureCode::ModuleUnknownFailure),
        }
    }
}

/// Body of a `NotifyEvent` packet, in wire order.
#[derive(Debug, Clone, PartialEq)]
pub struct NotifyEvent {
    pub action_id: ActionId,
    pub server_id: ServerId,
    pub host_id: String,
    pub time: EventTime,
    pub event_id: String,
    pub event_type: EventType,
    pub trigger_id: String,
    pub trigger_status: TriggerStatus,
    pub severity: TriggerSeverity,
    pub session_id: SessionId,
}

impl NotifyEvent {
    pub fn new(action_id: ActionId, event: &EventRecord, session_id: SessionId) -> Self {
        Self {
            action_id,
            server_id: event.server_id,
            host_id: event.host_id.clone(),
            time: event.time,
            event_id: event.event_id.clone(),
            event_type: event.event_type,
            trigger_id: event.trigger_id.clone(),
            trigger_status: event.trigger_status,
            severity: event.severity,
            session_id,
        }
    }

    fn encode(&self, w: &mut WireWriter) -> WireResult<()> {
        w.put_u32(self.action_id.get());
        w.put_u32(self.server_id.get());
        w.put_string(&self.host_id, "host id")?;
        w.put_u64(self.time.sec);
        w.put_u32(self.time.nsec);
        w.put_string(&self.event_id, "event id")?;
        w.put_u16(self.event_type.as_u16());
        w.put_string(&self.trigger_id, "trigger id")?;
        w.put_u16(self.trigger_status.as_u16());
        w.put_u16(self.severity.as_u16());
        w.put_fixed_string(self.session_id.as_str(), SESSION_ID_LEN, "session id")
    }

    fn decode(r: &mut WireReader<'_>) -> WireResult<Self> {
        let action_id = ActionId(r.read_u32("action id")?);
        let server_id = ServerId(r.read_u32("server id")?);
        let host_id = r.read_string("host id")?;
        let sec = r.read_u64("event time")?;
        let nsec = r.read_u32("event time")?;
        let event_id = r.read_string("event id")?;
        let event_type = EventType::from_u16(r.read_u16("event type")?);
        let trigger_id = r.read_string("trigger id")?;
        let trigger_status = TriggerStatus::from_u16(r.read_u16("trigger status")?);
        let severity = TriggerSeverity::from_u16(r.read_u16("severity")?);
        let raw_session = r.read_fixed_string(SESSION_ID_LEN, "session id")?;
        let session_id = SessionId::new(raw_session)
            .ok_or_else(|| WireError::invalid("session id", "wrong length"))?;
        Ok(Self {
            action_id,
            server_id,
            host_id,
            time: EventTime::new(sec, nsec),
            event_id,
            event_type,
            trigger_id,
            trigger_status,
            severity,
            session_id,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Launched,
    ModuleLoaded(ModuleLoadCode),
    Parameters { module_path: String, options: String },
    NotifyEvent(NotifyEvent),
    NotifyEventAck(u32),
}

/// A parsed packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub body_len: usize,
    pub packet_type: u16,
}

impl Header {
    pub fn parse(bytes: &[u8; HEADER_LEN]) -> WireResult<Self> {
        let mut reader = WireReader::new(bytes);
        let body_len = reader.read_u32("header")? as usize;
        let packet_type = reader.read_u16("header")?;
        if body_len > MAX_BODY_LEN {
            return Err(WireError::TooLong {
                what: "packet body",
                len: body_len,
                max: MAX_BODY_LEN,
            });
        }
        Ok(Self {
            body_len,
            packet_type,
        })
    }
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Launched => PacketType::Launched,
            Packet::ModuleLoaded(_) => PacketType::ModuleLoaded,
            Packet::Parameters { .. } => PacketType::Parameters,
            Packet::NotifyEvent(_) => PacketType::NotifyEvent,
            Packet::NotifyEventAck(_) => PacketType::NotifyEventAck,
        }
    }

    /// Header plus body, ready to write.
    pub fn encode(&self) -> WireResult<Bytes> {
        let mut body = WireWriter::new();
        match self {
            Packet::Launched => {}
            Packet::ModuleLoaded(code) => body.put_u32(code.as_u32()),
            Packet::Parameters {
                module_path,
                options,
            } => {
                body.put_string(module_path, "module path")?;
                body.put_string(options, "options")?;
            }
            Packet::NotifyEvent(event) => event.encode(&mut body)?,
            Packet::NotifyEventAck(result) => body.put_u32(*result),
        }
        if body.len() > MAX_BODY_LEN {
            return Err(WireError::TooLong {
                what: "packet body",
                len: body.len(),
                max: MAX_BODY_LEN,
            });
        }

        let body = body.into_inner();
        let mut out = BytesMut::with_capacity(HEADER_LEN + body.len());
        out.put_u32_le(body.len() as u32);
        out.put_u16_le(self.packet_type() as u16);
        out.extend_from_slice(&body);
        Ok(out.freeze())
    }

    /// Decode a body of the given type. The whole body must be consumed.
    pub fn decode(packet_type: u16, body: &[u8]) -> WireResult<Self> {
        let kind =
            PacketType::from_u16(packet_type).ok_or(WireError::UnknownPacketType(packet_type))?;
        let mut r = WireReader::new(body);
        let packet = match kind {
            PacketType::Launched => Packet::Launched,
            PacketType::ModuleLoaded => {
                Packet::ModuleLoaded(ModuleLoadCode::from_u32(r.read_u32("module load code")?))
            }
            PacketType::Parameters => Packet::Parameters {
                module_path: r.read_string("module path")?,
                options: r.read_string("options")?,
            },
            PacketType::NotifyEvent => Packet::NotifyEvent(NotifyEvent::decode(&mut r)?),
            PacketType::NotifyEventAck => Packet::NotifyEventAck(r.read_u32("ack result")?),
        };
        if r.remaining() > 0 {
            return Err(WireError::TrailingBytes {
                packet: kind,
                extra: r.remaining(),
            });
        }
        Ok(packet)
    }
}
