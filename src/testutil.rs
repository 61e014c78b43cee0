//! Deterministic packet generation for tests.

use crate::packet::{IpHeader, TcpHeader};

/// Seeded pseudo-random header generator (xorshift64), so tests are
/// reproducible without extra dependencies.
pub struct PktGen {
    state: u64,
}

impl PktGen {
    pub fn new(seed: u64) -> PktGen {
        PktGen {
            state: seed.max(1),
        }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    fn next_u32(&mut self) -> u32 {
        (self.next_u64() >> 32) as u32
    }

    fn next_u16(&mut self) -> u16 {
        (self.next_u64() >> 48) as u16
    }

    /// Random IPv4 header with a 20-byte header and a total length that
    /// always covers a 20-byte transport header.
    pub fn ip_header(&mut self, protocol: u8) -> IpHeader {
        let len = 40 + self.next_u16() % 1400;
        IpHeader::from_host(
            5,
            (self.next_u64() % 255) as u8 + 1,
            protocol,
            len,
            self.next_u16(),
            self.next_u32().into(),
            self.next_u32().into(),
        )
    }

    /// Random TCP header with a 20-byte header length.
    pub fn tcp_header(&mut self) -> TcpHeader {
        TcpHeader::from_host(
            self.next_u16(),
            self.next_u16(),
            self.next_u32(),
            self.next_u32(),
            self.next_u16(),
            (self.next_u64() % 256) as u8,
            5,
        )
    }
}
