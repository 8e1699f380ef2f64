// Selective Connection core
//
// One logical send/receive channel for an application, carried over
// whichever radio link currently fits: a control adapter for session
// management opcodes, one or more data adapters for payload, and a
// controller that discovers, connects, segments and switches between them.

pub mod adapter;
pub mod config;
pub mod control;
pub mod loopback;
pub mod protocol;
pub mod segment;
pub mod session;
pub mod transaction;

pub use adapter::{
    AdapterError, AdapterIdentity, AdapterRole, AdapterState, LinkEvent, NegotiationMethod,
    PeerDescriptor, PeerInfo, TransportAdapter, TransportKind,
};
pub use config::{ConfigError, SessionConfig};
pub use control::{ControlError, ControlMessage, ControlOpcode, PrivType, CONTROL_PAYLOAD_LIMIT};
pub use loopback::LoopbackAdapter;
pub use protocol::{Packet, PacketHeader, ProtocolCodec, ProtocolError, PROTOCOL_HEADER_SIZE};
pub use segment::{
    segment_count, split, ReassembledPacket, Reassembler, Segment, SegmentError,
};
pub use session::{HandoffNotice, SessionController, SessionError, SessionState};
pub use transaction::{
    ConnectionMachine, DiscoverOutcome, DiscoverPhase, LinkMonitor, TransactionError,
    TransactionTimings,
};
