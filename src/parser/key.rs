//! Flow identity.

use std::fmt;
use std::net::Ipv4Addr;

use crate::packet::{IpHeader, Transport};

/// Immutable 4-tuple identifying a flow. The fields are kept in network
/// byte order so equality and hashing are over the canonical wire
/// representation; the accessors convert to host order for display. The
/// protocol is not part of the key, it is implicit from the per-protocol
/// sub-table that owns the flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    src: u32,
    dst: u32,
    sport: u16,
    dport: u16,
}

impl FlowKey {
    /// Builds the key for a packet. Protocols without ports (ICMP and
    /// unknown transports) key on addresses alone, with both ports zero.
    pub fn from_packet(ip: &IpHeader, transport: &Transport) -> FlowKey {
        let (sport, dport) = match transport {
            Transport::Tcp(tcp) => (tcp.sport, tcp.dport),
            Transport::Udp(udp) => (udp.sport, udp.dport),
            Transport::Icmp(_) | Transport::Other => (0, 0),
        };
        FlowKey {
            src: ip.src,
            dst: ip.dst,
            sport,
            dport,
        }
    }

    /// An all-zero key, for flows constructed outside packet dispatch.
    pub fn zeroed() -> FlowKey {
        FlowKey {
            src: 0,
            dst: 0,
            sport: 0,
            dport: 0,
        }
    }

    pub fn src_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from_be(self.src))
    }

    pub fn dst_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from_be(self.dst))
    }

    pub fn src_port(&self) -> u16 {
        u16::from_be(self.sport)
    }

    pub fn dst_port(&self) -> u16 {
        u16::from_be(self.dport)
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.src_addr(),
            self.src_port(),
            self.dst_addr(),
            self.dst_port()
        )
    }
}
