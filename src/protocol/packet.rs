//! Semantic packet model
//!
//! Packets carry only the fields forwarding decisions look at: the L2
//! addresses, the IPv4 header fields, the L4 ports and a payload size.
//! Byte layout is never materialized.

use super::MacAddr;
use std::net::Ipv4Addr;

/// Default TTL for locally originated packets
pub const DEFAULT_TTL: u8 = 64;

/// IP protocol numbers understood by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum IpProtocol {
    Icmp = 1,
    Tcp = 6,
    Udp = 17,
}

impl IpProtocol {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(IpProtocol::Icmp),
            6 => Some(IpProtocol::Tcp),
            17 => Some(IpProtocol::Udp),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IpProtocol::Icmp => "icmp",
            IpProtocol::Tcp => "tcp",
            IpProtocol::Udp => "udp",
        }
    }
}

/// TCP control flags relevant to connection tracking
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub ack: bool,
}

impl TcpFlags {
    pub const SYN: TcpFlags = TcpFlags {
        fin: false,
        syn: true,
        rst: false,
        ack: false,
    };
    pub const SYN_ACK: TcpFlags = TcpFlags {
        fin: false,
        syn: true,
        rst: false,
        ack: true,
    };
    pub const ACK: TcpFlags = TcpFlags {
        fin: false,
        syn: false,
        rst: false,
        ack: true,
    };
    pub const FIN_ACK: TcpFlags = TcpFlags {
        fin: true,
        syn: false,
        rst: false,
        ack: true,
    };
    pub const RST: TcpFlags = TcpFlags {
        fin: false,
        syn: false,
        rst: true,
        ack: false,
    };

    pub fn is_syn_ack(&self) -> bool {
        self.syn && self.ack
    }

    pub fn is_fin(&self) -> bool {
        self.fin
    }

    pub fn is_rst(&self) -> bool {
        self.rst
    }
}

/// ICMP message kinds the engine distinguishes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpKind {
    EchoRequest,
    EchoReply,
}

/// L4 header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp {
        src_port: u16,
        dst_port: u16,
        flags: TcpFlags,
    },
    Udp {
        src_port: u16,
        dst_port: u16,
    },
    /// Echo messages; the identifier plays the role of both ports.
    Icmp { kind: IcmpKind, ident: u16, seq: u16 },
}

impl Transport {
    pub fn protocol(&self) -> IpProtocol {
        match self {
            Transport::Tcp { .. } => IpProtocol::Tcp,
            Transport::Udp { .. } => IpProtocol::Udp,
            Transport::Icmp { .. } => IpProtocol::Icmp,
        }
    }

    pub fn src_port(&self) -> u16 {
        match *self {
            Transport::Tcp { src_port, .. } | Transport::Udp { src_port, .. } => src_port,
            Transport::Icmp { ident, .. } => ident,
        }
    }

    pub fn dst_port(&self) -> u16 {
        match *self {
            Transport::Tcp { dst_port, .. } | Transport::Udp { dst_port, .. } => dst_port,
            Transport::Icmp { ident, .. } => ident,
        }
    }

    pub fn set_src_port(&mut self, port: u16) {
        match self {
            Transport::Tcp { src_port, .. } | Transport::Udp { src_port, .. } => *src_port = port,
            Transport::Icmp { ident, .. } => *ident = port,
        }
    }

    pub fn set_dst_port(&mut self, port: u16) {
        match self {
            Transport::Tcp { dst_port, .. } | Transport::Udp { dst_port, .. } => *dst_port = port,
            Transport::Icmp { ident, .. } => *ident = port,
        }
    }

    pub fn tcp_flags(&self) -> Option<TcpFlags> {
        match self {
            Transport::Tcp { flags, .. } => Some(*flags),
            _ => None,
        }
    }
}

/// IPv4 datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub ttl: u8,
    pub transport: Transport,
    pub payload_len: usize,
}

impl Datagram {
    pub fn protocol(&self) -> IpProtocol {
        self.transport.protocol()
    }

    /// Decrement TTL, returns false if the packet must not be transmitted
    pub fn decrement_ttl(&mut self) -> bool {
        if self.ttl <= 1 {
            return false;
        }
        self.ttl -= 1;
        true
    }
}

/// Address resolution operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpOp {
    Request,
    Reply,
}

/// Address resolution message (ARP equivalent)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpMessage {
    pub op: ArpOp,
    pub sender_mac: MacAddr,
    pub sender_ip: Ipv4Addr,
    pub target_mac: MacAddr,
    pub target_ip: Ipv4Addr,
}

impl ArpMessage {
    pub fn request(sender_mac: MacAddr, sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Self {
        Self {
            op: ArpOp::Request,
            sender_mac,
            sender_ip,
            target_mac: MacAddr::ZERO,
            target_ip,
        }
    }

    pub fn reply(
        sender_mac: MacAddr,
        sender_ip: Ipv4Addr,
        target_mac: MacAddr,
        target_ip: Ipv4Addr,
    ) -> Self {
        Self {
            op: ArpOp::Reply,
            sender_mac,
            sender_ip,
            target_mac,
            target_ip,
        }
    }
}

/// Frame payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Ipv4(Datagram),
    Arp(ArpMessage),
}

/// A frame as it travels between interfaces
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub src_mac: MacAddr,
    pub dst_mac: MacAddr,
    pub payload: Payload,
}

impl Packet {
    fn ipv4(src: Ipv4Addr, dst: Ipv4Addr, transport: Transport) -> Self {
        Self {
            src_mac: MacAddr::ZERO,
            dst_mac: MacAddr::ZERO,
            payload: Payload::Ipv4(Datagram {
                src,
                dst,
                ttl: DEFAULT_TTL,
                transport,
                payload_len: 0,
            }),
        }
    }

    pub fn udp(src: Ipv4Addr, src_port: u16, dst: Ipv4Addr, dst_port: u16) -> Self {
        Self::ipv4(src, dst, Transport::Udp { src_port, dst_port })
    }

    pub fn tcp(
        src: Ipv4Addr,
        src_port: u16,
        dst: Ipv4Addr,
        dst_port: u16,
        flags: TcpFlags,
    ) -> Self {
        Self::ipv4(
            src,
            dst,
            Transport::Tcp {
                src_port,
                dst_port,
                flags,
            },
        )
    }

    pub fn echo_request(src: Ipv4Addr, dst: Ipv4Addr, ident: u16, seq: u16) -> Self {
        Self::ipv4(
            src,
            dst,
            Transport::Icmp {
                kind: IcmpKind::EchoRequest,
                ident,
                seq,
            },
        )
    }

    pub fn echo_reply(src: Ipv4Addr, dst: Ipv4Addr, ident: u16, seq: u16) -> Self {
        Self::ipv4(
            src,
            dst,
            Transport::Icmp {
                kind: IcmpKind::EchoReply,
                ident,
                seq,
            },
        )
    }

    pub fn arp(src_mac: MacAddr, dst_mac: MacAddr, message: ArpMessage) -> Self {
        Self {
            src_mac,
            dst_mac,
            payload: Payload::Arp(message),
        }
    }

    pub fn with_macs(mut self, src_mac: MacAddr, dst_mac: MacAddr) -> Self {
        self.src_mac = src_mac;
        self.dst_mac = dst_mac;
        self
    }

    pub fn with_ttl(mut self, ttl: u8) -> Self {
        if let Payload::Ipv4(ref mut dgram) = self.payload {
            dgram.ttl = ttl;
        }
        self
    }

    pub fn with_payload_len(mut self, len: usize) -> Self {
        if let Payload::Ipv4(ref mut dgram) = self.payload {
            dgram.payload_len = len;
        }
        self
    }

    pub fn datagram(&self) -> Option<&Datagram> {
        match &self.payload {
            Payload::Ipv4(dgram) => Some(dgram),
            Payload::Arp(_) => None,
        }
    }

    pub fn datagram_mut(&mut self) -> Option<&mut Datagram> {
        match &mut self.payload {
            Payload::Ipv4(dgram) => Some(dgram),
            Payload::Arp(_) => None,
        }
    }

    /// Approximate on-wire size, used for byte counters
    pub fn wire_len(&self) -> usize {
        const ETH: usize = 14;
        match &self.payload {
            Payload::Arp(_) => ETH + 28,
            Payload::Ipv4(dgram) => {
                let l4 = match dgram.transport {
                    Transport::Tcp { .. } => 20,
                    Transport::Udp { .. } | Transport::Icmp { .. } => 8,
                };
                ETH + 20 + l4 + dgram.payload_len
            }
        }
    }
}
