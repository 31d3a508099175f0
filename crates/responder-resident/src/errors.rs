use crate::protocol::PacketType;
use crate::state::ResidentState;
use thiserror::Error;

/// Errors of the resident protocol layer.
#[derive(Error, Debug)]
pub enum WireError {
    /// A read would run past the available bytes.
    #[error("Truncated {what}: need {needed} bytes at offset {offset}, {available} available")]
    Truncated {
        what: &'static str,
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("{what} too long: {len} bytes (max {max})")]
    TooLong {
        what: &'static str,
        len: usize,
        max: usize,
    },

    #[error("Invalid {what}: {reason}")]
    Invalid { what: &'static str, reason: String },

    #[error("Unknown packet type {0}")]
    UnknownPacketType(u16),

    #[error("{extra} trailing bytes after {packet} body")]
    TrailingBytes { packet: PacketType, extra: usize },

    #[error("Unexpected {packet} packet in state {state}")]
    UnexpectedPacket {
        state: ResidentState,
        packet: PacketType,
    },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition {
        from: ResidentState,
        to: ResidentState,
    },

    #[error("Pipe closed by peer")]
    Closed,

    #[error("Pipe I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WireError {
    pub fn invalid(what: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            what,
            reason: reason.into(),
        }
    }
}

pub type WireResult<T> = std::result::Result<T, WireError>;
