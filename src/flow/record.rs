//! The per-flow accumulator.

use std::sync::Arc;

use super::rate::TcpRateEstimator;
use super::series::FieldSeries;
use super::{FieldSet, FlowConfig, FlowError, HeaderField};
use crate::packet::{
    IcmpHeader, IpHeader, Protocol, TcpHeader, UdpHeader, ICMP_HEADER_BYTES, UDP_HEADER_BYTES,
};
use crate::parser::FlowKey;

/// Sentinel `last_rx` value for a flow that has not received any packet.
pub const NO_LAST_RX: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Active,
    Closed,
}

/// Point-in-time snapshot of a flow's counters and averages.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowInfo {
    pub first_rx: u64,
    /// `NO_LAST_RX` until the first packet arrives.
    pub last_rx: u64,
    pub pkts_seen: u64,
    /// Sum of the IP total-length field over all received packets.
    pub bytes_seen: u64,
    pub avg_pkts_per_period: f64,
    pub avg_bytes_per_period: f64,
}

/// Aggregated state of all packets sharing one 4-tuple and protocol within
/// a timeout window. Owned exclusively by the parser while active; ownership
/// transfers to the eviction sink when the flow is closed, after which any
/// further receive fails.
#[derive(Debug)]
pub struct Flow {
    key: FlowKey,
    protocol: Protocol,
    /// Raw IP protocol number; `protocol` collapses unknown numbers to
    /// `Other`, the mismatch check compares this exact value.
    ip_proto: u8,
    config: Arc<FlowConfig>,
    state: FlowState,
    timeout: u64,
    first_rx: u64,
    last_rx: u64,
    pkts_seen: u64,
    total_ip_bytes: u64,
    total_payload_bytes: u64,
    mem_bytes: usize,
    pkts_this_period: u64,
    bytes_this_period: u64,
    avg_pkts_per_period: f64,
    avg_bytes_per_period: f64,

    timestamps: FieldSeries<u64>,
    ip_len: Option<FieldSeries<u16>>,
    ip_id: Option<FieldSeries<u16>>,
    ip_ttl: Option<FieldSeries<u8>>,
    tcp_seq: Option<FieldSeries<u32>>,
    tcp_ack: Option<FieldSeries<u32>>,
    tcp_win: Option<FieldSeries<u16>>,
    tcp_flags: Option<FieldSeries<u8>>,
    payload_size: Option<FieldSeries<u16>>,
    icmp_type: Option<FieldSeries<u8>>,
    icmp_code: Option<FieldSeries<u8>>,

    rate: Option<TcpRateEstimator>,
}

fn series_if<T: Copy>(fields: FieldSet, field: HeaderField) -> Option<FieldSeries<T>> {
    fields.contains(field).then(FieldSeries::new)
}

impl Flow {
    pub fn new(
        key: FlowKey,
        ip_proto: u8,
        first_rx: u64,
        timeout: u64,
        config: Arc<FlowConfig>,
    ) -> Flow {
        let protocol = Protocol::from_ip_proto(ip_proto);
        let fields = config.fields.for_protocol(protocol);
        let rate = (protocol == Protocol::Tcp)
            .then(|| TcpRateEstimator::new(first_rx, config.rate_ewma_alpha));

        Flow {
            key,
            protocol,
            ip_proto,
            state: FlowState::Active,
            timeout,
            first_rx,
            last_rx: NO_LAST_RX,
            pkts_seen: 0,
            total_ip_bytes: 0,
            total_payload_bytes: 0,
            mem_bytes: 0,
            pkts_this_period: 0,
            bytes_this_period: 0,
            avg_pkts_per_period: 0.0,
            avg_bytes_per_period: 0.0,
            timestamps: FieldSeries::new(),
            ip_len: series_if(fields, HeaderField::IpLen),
            ip_id: series_if(fields, HeaderField::IpId),
            ip_ttl: series_if(fields, HeaderField::IpTtl),
            tcp_seq: series_if(fields, HeaderField::TcpSeq),
            tcp_ack: series_if(fields, HeaderField::TcpAck),
            tcp_win: series_if(fields, HeaderField::TcpWin),
            tcp_flags: series_if(fields, HeaderField::TcpFlags),
            payload_size: series_if(fields, HeaderField::PayloadSize),
            icmp_type: series_if(fields, HeaderField::IcmpType),
            icmp_code: series_if(fields, HeaderField::IcmpCode),
            rate,
            config,
        }
    }

    pub fn key(&self) -> &FlowKey {
        &self.key
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn state(&self) -> FlowState {
        self.state
    }

    pub fn first_rx(&self) -> u64 {
        self.first_rx
    }

    pub fn last_rx(&self) -> u64 {
        self.last_rx
    }

    pub fn pkts_seen(&self) -> u64 {
        self.pkts_seen
    }

    pub fn total_ip_bytes(&self) -> u64 {
        self.total_ip_bytes
    }

    pub fn total_payload_bytes(&self) -> u64 {
        self.total_payload_bytes
    }

    /// Current in-memory footprint of the tracked series, in bytes.
    pub fn mem_bytes(&self) -> usize {
        self.mem_bytes
    }

    pub fn estimator(&self) -> Option<&TcpRateEstimator> {
        self.rate.as_ref()
    }

    /// Bytes-per-second estimate at `now` for a TCP flow; `None` for other
    /// protocols.
    pub fn tcp_rate_bps(&self, now: u64) -> Option<Result<f64, FlowError>> {
        self.rate
            .as_ref()
            .map(|est| est.estimate_bps(now, self.last_rx))
    }

    /// Common preconditions for every receive path. Checked before any
    /// state is touched so a failed receive leaves no partial mutation.
    fn check_rx(&self, ip: &IpHeader) -> Result<(), FlowError> {
        if self.state != FlowState::Active {
            return Err(FlowError::Closed);
        }
        if ip.protocol != self.ip_proto {
            return Err(FlowError::ProtocolMismatch {
                flow: self.ip_proto,
                packet: ip.protocol,
            });
        }
        Ok(())
    }

    /// Records the IP-layer fields shared by every protocol path.
    fn ip_rx(&mut self, ip: &IpHeader, timestamp: u64) {
        self.timestamps.append(timestamp, &mut self.mem_bytes);

        let ip_len = ip.total_length();
        self.total_ip_bytes += u64::from(ip_len);
        self.pkts_seen += 1;
        self.pkts_this_period += 1;
        self.bytes_this_period += u64::from(ip_len);

        if let Some(series) = self.ip_len.as_mut() {
            series.append(ip_len, &mut self.mem_bytes);
        }
        if let Some(series) = self.ip_id.as_mut() {
            series.append(ip.identification(), &mut self.mem_bytes);
        }
        if let Some(series) = self.ip_ttl.as_mut() {
            series.append(ip.ttl, &mut self.mem_bytes);
        }
    }

    fn record_payload(&mut self, payload_size: u16) {
        self.total_payload_bytes += u64::from(payload_size);
        if let Some(series) = self.payload_size.as_mut() {
            series.append(payload_size, &mut self.mem_bytes);
        }
    }

    /// Receives one TCP packet, returning the marginal storage bytes this
    /// call consumed.
    pub fn receive_tcp(
        &mut self,
        ip: &IpHeader,
        tcp: &TcpHeader,
        timestamp: u64,
    ) -> Result<usize, FlowError> {
        self.check_rx(ip)?;

        let bytes_before = self.mem_bytes;
        self.ip_rx(ip, timestamp);

        let header_bytes = ip.header_bytes() + tcp.header_bytes();
        let payload_size = ip.total_length().saturating_sub(header_bytes);
        self.record_payload(payload_size);

        let seq = tcp.sequence();
        if let Some(series) = self.tcp_seq.as_mut() {
            series.append(seq, &mut self.mem_bytes);
        }
        if let Some(series) = self.tcp_ack.as_mut() {
            series.append(tcp.ack_number(), &mut self.mem_bytes);
        }
        if let Some(series) = self.tcp_win.as_mut() {
            series.append(tcp.window(), &mut self.mem_bytes);
        }
        if let Some(series) = self.tcp_flags.as_mut() {
            series.append(tcp.flags, &mut self.mem_bytes);
        }

        if let Some(rate) = self.rate.as_mut() {
            // The estimator needs the previous receive time; advance
            // last_rx only afterwards.
            rate.update(seq, payload_size, timestamp, self.last_rx);
        }

        self.last_rx = timestamp;
        Ok(self.mem_bytes - bytes_before)
    }

    pub fn receive_udp(
        &mut self,
        ip: &IpHeader,
        _udp: &UdpHeader,
        timestamp: u64,
    ) -> Result<usize, FlowError> {
        self.check_rx(ip)?;

        let bytes_before = self.mem_bytes;
        self.ip_rx(ip, timestamp);

        let header_bytes = ip.header_bytes() + UDP_HEADER_BYTES;
        self.record_payload(ip.total_length().saturating_sub(header_bytes));

        self.last_rx = timestamp;
        Ok(self.mem_bytes - bytes_before)
    }

    pub fn receive_icmp(
        &mut self,
        ip: &IpHeader,
        icmp: &IcmpHeader,
        timestamp: u64,
    ) -> Result<usize, FlowError> {
        self.check_rx(ip)?;

        let bytes_before = self.mem_bytes;
        self.ip_rx(ip, timestamp);

        let header_bytes = ip.header_bytes() + ICMP_HEADER_BYTES;
        self.record_payload(ip.total_length().saturating_sub(header_bytes));

        if let Some(series) = self.icmp_type.as_mut() {
            series.append(icmp.icmp_type, &mut self.mem_bytes);
        }
        if let Some(series) = self.icmp_code.as_mut() {
            series.append(icmp.icmp_code, &mut self.mem_bytes);
        }

        self.last_rx = timestamp;
        Ok(self.mem_bytes - bytes_before)
    }

    /// Receive path for protocols without a known transport header. The
    /// payload size can only subtract the IP header, so it over-counts by
    /// the unknown transport header length.
    pub fn receive_other(&mut self, ip: &IpHeader, timestamp: u64) -> Result<usize, FlowError> {
        self.check_rx(ip)?;

        let bytes_before = self.mem_bytes;
        self.ip_rx(ip, timestamp);

        self.record_payload(ip.total_length().saturating_sub(ip.header_bytes()));

        self.last_rx = timestamp;
        Ok(self.mem_bytes - bytes_before)
    }

    /// Folds the packets and bytes seen since the previous call into the
    /// decayed averages and resets the period counters. Driven by an
    /// external fixed-cadence scheduler, not by packet timestamps.
    pub fn update_averages(&mut self) {
        let alpha = self.config.avg_ewma_alpha;
        self.avg_pkts_per_period =
            (1.0 - alpha) * self.avg_pkts_per_period + alpha * self.pkts_this_period as f64;
        self.avg_bytes_per_period =
            (1.0 - alpha) * self.avg_bytes_per_period + alpha * self.bytes_this_period as f64;
        self.pkts_this_period = 0;
        self.bytes_this_period = 0;
    }

    pub fn info(&self) -> FlowInfo {
        FlowInfo {
            first_rx: self.first_rx,
            last_rx: self.last_rx,
            pkts_seen: self.pkts_seen,
            bytes_seen: self.total_ip_bytes,
            avg_pkts_per_period: self.avg_pkts_per_period,
            avg_bytes_per_period: self.avg_bytes_per_period,
        }
    }

    /// Time remaining until the inactivity deadline, negative once the flow
    /// is eligible for eviction. The deadline trails the last receive, or
    /// the creation time while no packet has arrived.
    pub fn time_left(&self, now: u64) -> i64 {
        let base = if self.last_rx == NO_LAST_RX {
            self.first_rx
        } else {
            self.last_rx
        };
        (base + self.timeout) as i64 - now as i64
    }

    /// Transitions the flow to `Closed`. Called by the parser at eviction,
    /// immediately before ownership is handed to the sink.
    pub(crate) fn close(&mut self) {
        self.state = FlowState::Closed;
    }

    /// Restartable forward iterator over the tracked fields of every
    /// received packet, in arrival order.
    pub fn packets(&self) -> TrackedPackets<'_> {
        TrackedPackets {
            flow: self,
            index: 0,
        }
    }
}

/// Read-only view of the i-th received packet's tracked fields. Accessing a
/// field the flow does not track is a contract violation.
#[derive(Debug, Clone, Copy)]
pub struct TrackedFields {
    timestamp: u64,
    ip_len: Option<u16>,
    ip_id: Option<u16>,
    ip_ttl: Option<u8>,
    tcp_seq: Option<u32>,
    tcp_ack: Option<u32>,
    tcp_win: Option<u16>,
    tcp_flags: Option<u8>,
    payload_size: Option<u16>,
    icmp_type: Option<u8>,
    icmp_code: Option<u8>,
}

fn tracked<T>(value: Option<T>, field: HeaderField) -> Result<T, FlowError> {
    value.ok_or(FlowError::FieldNotTracked(field))
}

impl TrackedFields {
    /// Timestamps are recorded for every packet unconditionally.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn ip_len(&self) -> Result<u16, FlowError> {
        tracked(self.ip_len, HeaderField::IpLen)
    }

    pub fn ip_id(&self) -> Result<u16, FlowError> {
        tracked(self.ip_id, HeaderField::IpId)
    }

    pub fn ip_ttl(&self) -> Result<u8, FlowError> {
        tracked(self.ip_ttl, HeaderField::IpTtl)
    }

    pub fn tcp_seq(&self) -> Result<u32, FlowError> {
        tracked(self.tcp_seq, HeaderField::TcpSeq)
    }

    pub fn tcp_ack(&self) -> Result<u32, FlowError> {
        tracked(self.tcp_ack, HeaderField::TcpAck)
    }

    pub fn tcp_win(&self) -> Result<u16, FlowError> {
        tracked(self.tcp_win, HeaderField::TcpWin)
    }

    pub fn tcp_flags(&self) -> Result<u8, FlowError> {
        tracked(self.tcp_flags, HeaderField::TcpFlags)
    }

    pub fn payload_size(&self) -> Result<u16, FlowError> {
        tracked(self.payload_size, HeaderField::PayloadSize)
    }

    pub fn icmp_type(&self) -> Result<u8, FlowError> {
        tracked(self.icmp_type, HeaderField::IcmpType)
    }

    pub fn icmp_code(&self) -> Result<u8, FlowError> {
        tracked(self.icmp_code, HeaderField::IcmpCode)
    }
}

/// Iterator behind [`Flow::packets`].
#[derive(Debug)]
pub struct TrackedPackets<'a> {
    flow: &'a Flow,
    index: usize,
}

impl Iterator for TrackedPackets<'_> {
    type Item = TrackedFields;

    fn next(&mut self) -> Option<TrackedFields> {
        let flow = self.flow;
        let i = self.index;
        let timestamp = flow.timestamps.get(i)?;
        self.index += 1;

        Some(TrackedFields {
            timestamp,
            ip_len: flow.ip_len.as_ref().and_then(|s| s.get(i)),
            ip_id: flow.ip_id.as_ref().and_then(|s| s.get(i)),
            ip_ttl: flow.ip_ttl.as_ref().and_then(|s| s.get(i)),
            tcp_seq: flow.tcp_seq.as_ref().and_then(|s| s.get(i)),
            tcp_ack: flow.tcp_ack.as_ref().and_then(|s| s.get(i)),
            tcp_win: flow.tcp_win.as_ref().and_then(|s| s.get(i)),
            tcp_flags: flow.tcp_flags.as_ref().and_then(|s| s.get(i)),
            payload_size: flow.payload_size.as_ref().and_then(|s| s.get(i)),
            icmp_type: flow.icmp_type.as_ref().and_then(|s| s.get(i)),
            icmp_code: flow.icmp_code.as_ref().and_then(|s| s.get(i)),
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.flow.timestamps.len().saturating_sub(self.index);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for TrackedPackets<'_> {}
