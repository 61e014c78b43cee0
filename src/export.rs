//! JSON-lines flow record export.
//!
//! The reference completion sink: each evicted flow is serialized to one
//! JSON object per line. The on-disk format is this module's concern alone;
//! the parser only hands over owned flows.

use std::io::Write;

use log::warn;
use serde::Serialize;

use crate::flow::{Flow, TrackedFields, NO_LAST_RX};
use crate::parser::FlowSink;

/// Serialized form of one completed flow. Per-field series are present only
/// when the corresponding field was tracked.
#[derive(Debug, Serialize)]
pub struct FlowRecord {
    pub src: String,
    pub dst: String,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: &'static str,
    pub first_rx: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_rx: Option<u64>,
    pub pkts_seen: u64,
    pub bytes_seen: u64,
    pub payload_bytes: u64,
    pub avg_pkts_per_period: f64,
    pub avg_bytes_per_period: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_bps: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_reordered: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamps: Option<Vec<u64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_len: Option<Vec<u16>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_id: Option<Vec<u16>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_ttl: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_seq: Option<Vec<u32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_ack: Option<Vec<u32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_win: Option<Vec<u16>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_flags: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_size: Option<Vec<u16>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icmp_type: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icmp_code: Option<Vec<u8>>,
}

fn series_of<T>(
    flow: &Flow,
    get: impl Fn(&TrackedFields) -> Result<T, crate::flow::FlowError>,
) -> Option<Vec<T>> {
    if flow.pkts_seen() == 0 {
        return None;
    }
    let mut out = Vec::with_capacity(flow.pkts_seen() as usize);
    for pkt in flow.packets() {
        out.push(get(&pkt).ok()?);
    }
    Some(out)
}

impl FlowRecord {
    pub fn from_flow(flow: &Flow) -> FlowRecord {
        let key = flow.key();
        let info = flow.info();
        let last_rx = (info.last_rx != NO_LAST_RX).then_some(info.last_rx);
        let tcp_bps = last_rx.and_then(|ts| flow.tcp_rate_bps(ts)).and_then(Result::ok);

        FlowRecord {
            src: key.src_addr().to_string(),
            dst: key.dst_addr().to_string(),
            src_port: key.src_port(),
            dst_port: key.dst_port(),
            protocol: flow.protocol().as_str(),
            first_rx: info.first_rx,
            last_rx,
            pkts_seen: info.pkts_seen,
            bytes_seen: info.bytes_seen,
            payload_bytes: flow.total_payload_bytes(),
            avg_pkts_per_period: info.avg_pkts_per_period,
            avg_bytes_per_period: info.avg_bytes_per_period,
            tcp_bps,
            tcp_reordered: flow.estimator().map(|e| e.saw_reordering()),
            timestamps: (flow.pkts_seen() > 0).then(|| flow.packets().map(|p| p.timestamp()).collect()),
            ip_len: series_of(flow, |p| p.ip_len()),
            ip_id: series_of(flow, |p| p.ip_id()),
            ip_ttl: series_of(flow, |p| p.ip_ttl()),
            tcp_seq: series_of(flow, |p| p.tcp_seq()),
            tcp_ack: series_of(flow, |p| p.tcp_ack()),
            tcp_win: series_of(flow, |p| p.tcp_win()),
            tcp_flags: series_of(flow, |p| p.tcp_flags()),
            payload_size: series_of(flow, |p| p.payload_size()),
            icmp_type: series_of(flow, |p| p.icmp_type()),
            icmp_code: series_of(flow, |p| p.icmp_code()),
        }
    }
}

/// Writes one JSON object per evicted flow to the wrapped writer.
pub struct JsonLinesSink<W: Write> {
    writer: W,
    written: u64,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(writer: W) -> JsonLinesSink<W> {
        JsonLinesSink { writer, written: 0 }
    }

    pub fn write(&mut self, flow: &Flow) -> std::io::Result<()> {
        let record = FlowRecord::from_flow(flow);
        serde_json::to_writer(&mut self.writer, &record)?;
        self.writer.write_all(b"\n")?;
        self.written += 1;
        Ok(())
    }

    pub fn written(&self) -> u64 {
        self.written
    }
}

impl<W: Write + Send + 'static> JsonLinesSink<W> {
    /// Wraps the sink as a parser completion callback. Write failures are
    /// logged, not propagated; the flow is dropped either way.
    pub fn into_sink(mut self) -> FlowSink {
        Box::new(move |flow| {
            if let Err(e) = self.write(&flow) {
                warn!("failed to write flow record for {}: {e}", flow.key());
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{FieldSet, FlowConfig};
    use crate::packet::{IpHeader, TcpHeader, IPPROTO_TCP};
    use crate::parser::FlowKey;
    use std::sync::Arc;

    fn sample_flow(fields: FieldSet) -> Flow {
        let config = Arc::new(FlowConfig {
            fields,
            ..FlowConfig::default()
        });
        let mut flow = Flow::new(FlowKey::zeroed(), IPPROTO_TCP, 1_000, 60_000_000, config);
        let ip = IpHeader::from_host(
            5,
            64,
            IPPROTO_TCP,
            540,
            7,
            [10, 0, 0, 1].into(),
            [10, 0, 0, 2].into(),
        );
        let tcp = TcpHeader::from_host(80, 9999, 100, 200, 1024, 0x18, 5);
        flow.receive_tcp(&ip, &tcp, 2_000).unwrap();
        flow
    }

    #[test]
    fn test_record_with_full_tracking() {
        let flow = sample_flow(FieldSet::all());
        let record = FlowRecord::from_flow(&flow);

        assert_eq!(record.protocol, "tcp");
        assert_eq!(record.pkts_seen, 1);
        assert_eq!(record.bytes_seen, 540);
        assert_eq!(record.payload_bytes, 500);
        assert_eq!(record.last_rx, Some(2_000));
        assert_eq!(record.timestamps, Some(vec![2_000]));
        assert_eq!(record.ip_len, Some(vec![540]));
        assert_eq!(record.tcp_seq, Some(vec![100]));
        assert_eq!(record.icmp_type, None);
        assert_eq!(record.tcp_reordered, Some(false));
    }

    #[test]
    fn test_record_without_tracking_omits_series() {
        let flow = sample_flow(FieldSet::NONE);
        let record = FlowRecord::from_flow(&flow);

        assert_eq!(record.ip_len, None);
        assert_eq!(record.tcp_seq, None);
        // Timestamps are always recorded.
        assert_eq!(record.timestamps, Some(vec![2_000]));
    }

    #[test]
    fn test_json_lines_output() {
        let flow = sample_flow(FieldSet::NONE);
        let mut sink = JsonLinesSink::new(Vec::new());
        sink.write(&flow).unwrap();

        assert_eq!(sink.written(), 1);
        let line = String::from_utf8(sink.writer.clone()).unwrap();
        assert!(line.ends_with('\n'));
        let value: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(value["src"], "10.0.0.1");
        assert_eq!(value["dst_port"], 9999);
        assert_eq!(value["pkts_seen"], 1);
        assert!(value.get("ip_len").is_none());
    }
}
