//! Packet and address model
//!
//! Packets are semantic: headers are plain fields, never byte buffers.

pub mod packet;
pub mod types;

pub use packet::{
    ArpMessage, ArpOp, Datagram, IcmpKind, IpProtocol, Packet, Payload, TcpFlags, Transport,
    DEFAULT_TTL,
};
pub use types::*;
