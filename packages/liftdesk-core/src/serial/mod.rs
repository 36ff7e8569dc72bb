//! Actuator serial protocol
//!
//! Line-delimited, tag-prefixed text protocol spoken by the actuator firmware
//! over a half-duplex serial link.
//!
//! ## Key components:
//! - `transport` - Connector/link traits and transport errors
//! - `port` - `serialport`-backed implementation of the transport traits
//! - `session` - One open connection: handles, liveness, teardown
//! - `reassembler` - Turn raw chunks into trimmed records
//! - `profile` - Tag tables for the firmware revisions
//! - `codec` - Encode commands, decode records into events
//! - `handshake` - Gate traffic until the device acknowledges
//! - `homing` - Min/max positioning sequence
//! - `driver` - The per-session read loop (adapter pattern for output)
//! - `panel` - Owns at most one running driver per device

mod codec;
mod driver;
mod handshake;
mod homing;
mod panel;
mod port;
mod profile;
mod reassembler;
mod session;
mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use codec::{CodecError, Command, Decoder, ProtocolEvent, RegulatorKind};
pub use driver::{
    CommandOutcome, DriverCommand, DriverConfig, PanelDriver, PanelEmitter, PanelError,
    PanelHandle, SessionEnd,
};
pub use handshake::{Gate, Handshake, HandshakeState, DEFAULT_HANDSHAKE_TIMEOUT};
pub use homing::{HomingMachine, HomingState, SetPositionAction};
pub use panel::Panel;
pub use port::{list_ports, PortInfo, SerialConnector};
pub use profile::{HandshakeTags, InboundPattern, ProtocolProfile, PROFILE_NAMES};
pub use reassembler::LineReassembler;
pub use session::{Chunk, Session, DEFAULT_STALE_AFTER};
pub use transport::{Connector, LinkReader, LinkWriter, ReadErrorKind, SerialLink, TransportError};
