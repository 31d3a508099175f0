//! # Responder Resident
//!
//! Everything both ends of a resident action connection share:
//!
//! - the little-endian packet format ([`protocol`]) and its byte-slice codec
//!   ([`codec`]),
//! - async packet framing over any `AsyncRead` / `AsyncWrite` ([`framing`]),
//! - the named pipe pair the two processes talk over ([`pipe`]),
//! - the master-side connection state table ([`state`]),
//! - the module contract and the slave-side host runtime ([`module`],
//!   [`builtin`], [`host`]).

pub mod builtin;
pub mod codec;
pub mod errors;
pub mod framing;
pub mod host;
pub mod module;
pub mod pipe;
pub mod protocol;
pub mod state;

pub use errors::{WireError, WireResult};
pub use framing::{PacketReader, PacketWriter};
pub use host::ResidentHost;
pub use module::{EventArg, LoadedModule, ModuleDescriptor, ModuleRegistry, RESIDENT_MODULE_VERSION};
pub use pipe::{open_slave, PipePair};
pub use protocol::{ModuleLoadCode, NotifyEvent, Packet, PacketType, HEADER_LEN, MAX_BODY_LEN};
pub use state::{ResidentState, ResidentStateMachine, StateTransition};
