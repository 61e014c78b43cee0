use pcap::{Active, Capture, Device, Offline};
use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::icmp::IcmpPacket;
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::tcp::TcpPacket;
use pnet::packet::udp::UdpPacket;
use pnet::packet::Packet;

use log::warn;
use thiserror::Error;

use crate::packet::{IcmpHeader, IpHeader, TcpHeader, Transport, UdpHeader};

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Insufficient privileges. Try: sudo setcap cap_net_raw,cap_net_admin=eip ./flowmeter")]
    InsufficientPrivileges,

    #[error("Network interface '{0}' not found. Available interfaces: {1:?}")]
    InterfaceNotFound(String, Vec<String>),

    #[error("Packet capture failed: {0}")]
    Capture(String),

    #[error("Device error: {0}")]
    Device(String),

    #[error("Failed to open pcap file '{0}': {1}")]
    File(String, String),
}

/// One decoded IPv4 packet with its capture timestamp in microseconds.
pub struct CapturedPacket {
    pub ip: IpHeader,
    pub transport: Transport,
    pub timestamp: u64,
}

#[derive(Debug, Default, Clone)]
pub struct CaptureStats {
    pub packets: u64,
    pub bytes: u64,
    /// Frames that were not IPv4 or could not be decoded.
    pub ignored: u64,
}

enum CaptureSource {
    Live(Capture<Active>),
    File(Capture<Offline>),
}

/// Reads frames from a live device or a pcap file and decodes them into the
/// header records the parser consumes.
pub struct CaptureEngine {
    source: CaptureSource,
    interface: String,
    stats: CaptureStats,
}

impl CaptureEngine {
    pub fn open_device(
        interface: Option<String>,
        promiscuous: bool,
        timeout_ms: i32,
    ) -> Result<CaptureEngine, CaptureError> {
        let available = Self::list_devices()?;

        let interface = interface.unwrap_or_else(|| {
            available
                .first()
                .map(|d| d.name.clone())
                .unwrap_or_else(|| "any".to_string())
        });

        if interface != "any" && !available.iter().any(|d| d.name == interface) {
            let names: Vec<String> = available.iter().map(|d| d.name.clone()).collect();
            return Err(CaptureError::InterfaceNotFound(interface, names));
        }

        let device = Device::from(interface.as_str());
        let capture = Capture::from_device(device)
            .map_err(|e| CaptureError::Device(e.to_string()))?
            .promisc(promiscuous)
            .timeout(timeout_ms)
            .open()
            .map_err(|e| {
                warn!("failed to open capture on {interface}: {e}");
                CaptureError::InsufficientPrivileges
            })?;

        Ok(CaptureEngine {
            source: CaptureSource::Live(capture),
            interface,
            stats: CaptureStats::default(),
        })
    }

    pub fn open_file(path: &str) -> Result<CaptureEngine, CaptureError> {
        let capture = Capture::from_file(path)
            .map_err(|e| CaptureError::File(path.to_string(), e.to_string()))?;
        Ok(CaptureEngine {
            source: CaptureSource::File(capture),
            interface: path.to_string(),
            stats: CaptureStats::default(),
        })
    }

    pub fn list_devices() -> Result<Vec<Device>, CaptureError> {
        Device::list().map_err(|e| CaptureError::Device(format!("Failed to list devices: {e}")))
    }

    pub fn is_live(&self) -> bool {
        matches!(self.source, CaptureSource::Live(_))
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn stats(&self) -> &CaptureStats {
        &self.stats
    }

    /// Returns the next decodable IPv4 packet. `Ok(None)` means the read
    /// timed out on a live capture, or end of input on a file.
    pub fn next(&mut self) -> Result<Option<CapturedPacket>, CaptureError> {
        loop {
            let (timestamp, decoded, frame_len) = {
                let packet = match &mut self.source {
                    CaptureSource::Live(capture) => capture.next_packet(),
                    CaptureSource::File(capture) => capture.next_packet(),
                };
                let packet = match packet {
                    Ok(packet) => packet,
                    Err(pcap::Error::TimeoutExpired) | Err(pcap::Error::NoMorePackets) => {
                        return Ok(None)
                    }
                    Err(e) => return Err(CaptureError::Capture(e.to_string())),
                };
                let ts = packet.header.ts;
                let timestamp = ts.tv_sec as u64 * 1_000_000 + ts.tv_usec as u64;
                (timestamp, decode_frame(packet.data), packet.data.len())
            };

            self.stats.packets += 1;
            self.stats.bytes += frame_len as u64;

            match decoded {
                Some((ip, transport)) => {
                    return Ok(Some(CapturedPacket {
                        ip,
                        transport,
                        timestamp,
                    }))
                }
                None => self.stats.ignored += 1,
            }
        }
    }
}

/// Decodes an Ethernet frame down to the IPv4 and transport header records.
/// Non-IPv4 frames and truncated headers yield `None`.
fn decode_frame(data: &[u8]) -> Option<(IpHeader, Transport)> {
    let ethernet = EthernetPacket::new(data)?;
    if ethernet.get_ethertype() != EtherTypes::Ipv4 {
        return None;
    }

    let ipv4 = Ipv4Packet::new(ethernet.payload())?;
    let ip = IpHeader::from_host(
        ipv4.get_header_length(),
        ipv4.get_ttl(),
        ipv4.get_next_level_protocol().0,
        ipv4.get_total_length(),
        ipv4.get_identification(),
        ipv4.get_source(),
        ipv4.get_destination(),
    );

    let transport = match ipv4.get_next_level_protocol() {
        IpNextHeaderProtocols::Tcp => {
            let tcp = TcpPacket::new(ipv4.payload())?;
            Transport::Tcp(TcpHeader::from_host(
                tcp.get_source(),
                tcp.get_destination(),
                tcp.get_sequence(),
                tcp.get_acknowledgement(),
                tcp.get_window(),
                tcp.get_flags() as u8,
                tcp.get_data_offset(),
            ))
        }
        IpNextHeaderProtocols::Udp => {
            let udp = UdpPacket::new(ipv4.payload())?;
            Transport::Udp(UdpHeader::from_host(udp.get_source(), udp.get_destination()))
        }
        IpNextHeaderProtocols::Icmp => {
            let icmp = IcmpPacket::new(ipv4.payload())?;
            Transport::Icmp(IcmpHeader {
                icmp_type: icmp.get_icmp_type().0,
                icmp_code: icmp.get_icmp_code().0,
            })
        }
        _ => Transport::Other,
    };

    Some((ip, transport))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{IPPROTO_TCP, IPPROTO_UDP};
    use std::net::Ipv4Addr;

    // Hand-assembled Ethernet + IPv4 frames.
    fn ipv4_frame(proto: u8, transport_bytes: &[u8]) -> Vec<u8> {
        let total_len = 20 + transport_bytes.len() as u16;
        let mut frame = vec![0u8; 14];
        frame[12] = 0x08; // EtherType IPv4
        frame[13] = 0x00;

        let mut ip = vec![0u8; 20];
        ip[0] = 0x45; // version 4, ihl 5
        ip[2..4].copy_from_slice(&total_len.to_be_bytes());
        ip[4..6].copy_from_slice(&0xbeefu16.to_be_bytes());
        ip[8] = 61; // ttl
        ip[9] = proto;
        ip[12..16].copy_from_slice(&[10, 0, 0, 1]);
        ip[16..20].copy_from_slice(&[10, 0, 0, 2]);

        frame.extend_from_slice(&ip);
        frame.extend_from_slice(transport_bytes);
        frame
    }

    #[test]
    fn test_decode_tcp_frame() {
        let mut tcp = vec![0u8; 20];
        tcp[0..2].copy_from_slice(&443u16.to_be_bytes());
        tcp[2..4].copy_from_slice(&51000u16.to_be_bytes());
        tcp[4..8].copy_from_slice(&0x01020304u32.to_be_bytes());
        tcp[8..12].copy_from_slice(&0x0a0b0c0du32.to_be_bytes());
        tcp[12] = 5 << 4; // data offset
        tcp[13] = 0x18; // PSH|ACK
        tcp[14..16].copy_from_slice(&2048u16.to_be_bytes());

        let frame = ipv4_frame(IPPROTO_TCP, &tcp);
        let (ip, transport) = decode_frame(&frame).unwrap();

        assert_eq!(ip.protocol, IPPROTO_TCP);
        assert_eq!(ip.total_length(), 40);
        assert_eq!(ip.identification(), 0xbeef);
        assert_eq!(ip.ttl, 61);
        assert_eq!(ip.src_addr(), Ipv4Addr::new(10, 0, 0, 1));

        let Transport::Tcp(tcp) = transport else {
            panic!("expected tcp transport");
        };
        assert_eq!(tcp.src_port(), 443);
        assert_eq!(tcp.dst_port(), 51000);
        assert_eq!(tcp.sequence(), 0x01020304);
        assert_eq!(tcp.ack_number(), 0x0a0b0c0d);
        assert_eq!(tcp.window(), 2048);
        assert_eq!(tcp.flags, 0x18);
        assert_eq!(tcp.header_bytes(), 20);
    }

    #[test]
    fn test_decode_udp_frame() {
        let mut udp = vec![0u8; 8];
        udp[0..2].copy_from_slice(&53u16.to_be_bytes());
        udp[2..4].copy_from_slice(&3000u16.to_be_bytes());

        let frame = ipv4_frame(IPPROTO_UDP, &udp);
        let (_, transport) = decode_frame(&frame).unwrap();

        let Transport::Udp(udp) = transport else {
            panic!("expected udp transport");
        };
        assert_eq!(udp.src_port(), 53);
        assert_eq!(udp.dst_port(), 3000);
    }

    #[test]
    fn test_unknown_protocol_is_other() {
        let frame = ipv4_frame(47, &[0u8; 4]);
        let (_, transport) = decode_frame(&frame).unwrap();
        assert!(matches!(transport, Transport::Other));
    }

    #[test]
    fn test_non_ipv4_frame_ignored() {
        let mut frame = vec![0u8; 64];
        frame[12] = 0x86; // EtherType IPv6
        frame[13] = 0xdd;
        assert!(decode_frame(&frame).is_none());
    }
}
