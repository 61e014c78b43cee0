//! Raw header records handed to the flow parser.
//!
//! Fields are stored exactly as they appear on the wire (network byte
//! order); the accessor methods perform the conversion to host order. The
//! capture engine fills these in from decoded packets, and tests build them
//! directly.

use std::fmt;
use std::net::Ipv4Addr;

pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

/// Transport protocol tag carried by every flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    Other,
}

impl Protocol {
    pub fn from_ip_proto(proto: u8) -> Protocol {
        match proto {
            IPPROTO_TCP => Protocol::Tcp,
            IPPROTO_UDP => Protocol::Udp,
            IPPROTO_ICMP => Protocol::Icmp,
            _ => Protocol::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
            Protocol::Other => "other",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// IPv4 header record. Multi-byte fields are big-endian.
#[derive(Debug, Clone, Copy)]
pub struct IpHeader {
    /// Header length in 4-byte words.
    pub ihl: u8,
    pub ttl: u8,
    pub protocol: u8,
    pub len: u16,
    pub id: u16,
    pub src: u32,
    pub dst: u32,
}

impl IpHeader {
    /// Builds a record from host-order values, storing them big-endian.
    pub fn from_host(
        ihl: u8,
        ttl: u8,
        protocol: u8,
        len: u16,
        id: u16,
        src: Ipv4Addr,
        dst: Ipv4Addr,
    ) -> IpHeader {
        IpHeader {
            ihl,
            ttl,
            protocol,
            len: len.to_be(),
            id: id.to_be(),
            src: u32::from(src).to_be(),
            dst: u32::from(dst).to_be(),
        }
    }

    /// Total datagram length in host order.
    pub fn total_length(&self) -> u16 {
        u16::from_be(self.len)
    }

    pub fn identification(&self) -> u16 {
        u16::from_be(self.id)
    }

    /// Header length in bytes.
    pub fn header_bytes(&self) -> u16 {
        u16::from(self.ihl) * 4
    }

    pub fn src_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from_be(self.src))
    }

    pub fn dst_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from_be(self.dst))
    }
}

/// TCP header record. Multi-byte fields are big-endian.
#[derive(Debug, Clone, Copy)]
pub struct TcpHeader {
    pub sport: u16,
    pub dport: u16,
    pub seq: u32,
    pub ack: u32,
    pub win: u16,
    pub flags: u8,
    /// Data offset in 4-byte words.
    pub data_offset: u8,
}

impl TcpHeader {
    #[allow(clippy::too_many_arguments)]
    pub fn from_host(
        sport: u16,
        dport: u16,
        seq: u32,
        ack: u32,
        win: u16,
        flags: u8,
        data_offset: u8,
    ) -> TcpHeader {
        TcpHeader {
            sport: sport.to_be(),
            dport: dport.to_be(),
            seq: seq.to_be(),
            ack: ack.to_be(),
            win: win.to_be(),
            flags,
            data_offset,
        }
    }

    pub fn sequence(&self) -> u32 {
        u32::from_be(self.seq)
    }

    pub fn ack_number(&self) -> u32 {
        u32::from_be(self.ack)
    }

    pub fn window(&self) -> u16 {
        u16::from_be(self.win)
    }

    pub fn src_port(&self) -> u16 {
        u16::from_be(self.sport)
    }

    pub fn dst_port(&self) -> u16 {
        u16::from_be(self.dport)
    }

    /// Header length in bytes.
    pub fn header_bytes(&self) -> u16 {
        u16::from(self.data_offset) * 4
    }
}

/// UDP header record. Only the ports are used (flow keying).
#[derive(Debug, Clone, Copy)]
pub struct UdpHeader {
    pub sport: u16,
    pub dport: u16,
}

/// Fixed UDP header size in bytes.
pub const UDP_HEADER_BYTES: u16 = 8;

impl UdpHeader {
    pub fn from_host(sport: u16, dport: u16) -> UdpHeader {
        UdpHeader {
            sport: sport.to_be(),
            dport: dport.to_be(),
        }
    }

    pub fn src_port(&self) -> u16 {
        u16::from_be(self.sport)
    }

    pub fn dst_port(&self) -> u16 {
        u16::from_be(self.dport)
    }
}

/// ICMP header record.
#[derive(Debug, Clone, Copy)]
pub struct IcmpHeader {
    pub icmp_type: u8,
    pub icmp_code: u8,
}

/// Fixed part of the ICMP header in bytes.
pub const ICMP_HEADER_BYTES: u16 = 8;

/// Protocol-specific header selected for dispatch.
#[derive(Debug, Clone, Copy)]
pub enum Transport {
    Tcp(TcpHeader),
    Udp(UdpHeader),
    Icmp(IcmpHeader),
    Other,
}

impl Transport {
    pub fn protocol(&self) -> Protocol {
        match self {
            Transport::Tcp(_) => Protocol::Tcp,
            Transport::Udp(_) => Protocol::Udp,
            Transport::Icmp(_) => Protocol::Icmp,
            Transport::Other => Protocol::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ip_header_byte_order() {
        let hdr = IpHeader::from_host(
            5,
            64,
            IPPROTO_TCP,
            1500,
            0x1234,
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(192, 168, 1, 2),
        );

        assert_eq!(hdr.total_length(), 1500);
        assert_eq!(hdr.identification(), 0x1234);
        assert_eq!(hdr.header_bytes(), 20);
        assert_eq!(hdr.src_addr(), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(hdr.dst_addr(), Ipv4Addr::new(192, 168, 1, 2));
    }

    #[test]
    fn test_tcp_header_byte_order() {
        let hdr = TcpHeader::from_host(443, 51000, 0xdeadbeef, 0x1000, 4096, 0x18, 5);

        assert_eq!(hdr.src_port(), 443);
        assert_eq!(hdr.dst_port(), 51000);
        assert_eq!(hdr.sequence(), 0xdeadbeef);
        assert_eq!(hdr.ack_number(), 0x1000);
        assert_eq!(hdr.window(), 4096);
        assert_eq!(hdr.header_bytes(), 20);
    }

    #[test]
    fn test_protocol_mapping() {
        assert_eq!(Protocol::from_ip_proto(IPPROTO_TCP), Protocol::Tcp);
        assert_eq!(Protocol::from_ip_proto(IPPROTO_UDP), Protocol::Udp);
        assert_eq!(Protocol::from_ip_proto(IPPROTO_ICMP), Protocol::Icmp);
        assert_eq!(Protocol::from_ip_proto(47), Protocol::Other);
    }
}
