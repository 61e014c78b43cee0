//! Per-flow state: tracked header series, totals, decayed averages and the
//! TCP throughput estimator.

pub mod rate;
pub mod series;

mod record;

pub use rate::TcpRateEstimator;
pub use record::{Flow, FlowInfo, FlowState, TrackedFields, TrackedPackets, NO_LAST_RX};
pub use series::FieldSeries;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::packet::Protocol;

/// Header attributes a flow can record per packet. Timestamps are always
/// recorded and are not part of the configurable set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeaderField {
    IpLen,
    IpId,
    IpTtl,
    TcpSeq,
    TcpAck,
    TcpWin,
    TcpFlags,
    PayloadSize,
    IcmpType,
    IcmpCode,
}

impl HeaderField {
    const ALL: [HeaderField; 10] = [
        HeaderField::IpLen,
        HeaderField::IpId,
        HeaderField::IpTtl,
        HeaderField::TcpSeq,
        HeaderField::TcpAck,
        HeaderField::TcpWin,
        HeaderField::TcpFlags,
        HeaderField::PayloadSize,
        HeaderField::IcmpType,
        HeaderField::IcmpCode,
    ];

    fn bit(self) -> u16 {
        1 << (self as u16)
    }

    /// Whether this field can ever be recorded for a flow of `protocol`.
    pub fn applies_to(self, protocol: Protocol) -> bool {
        match self {
            HeaderField::IpLen | HeaderField::IpId | HeaderField::IpTtl => true,
            HeaderField::PayloadSize => true,
            HeaderField::TcpSeq
            | HeaderField::TcpAck
            | HeaderField::TcpWin
            | HeaderField::TcpFlags => protocol == Protocol::Tcp,
            HeaderField::IcmpType | HeaderField::IcmpCode => protocol == Protocol::Icmp,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            HeaderField::IpLen => "ip_len",
            HeaderField::IpId => "ip_id",
            HeaderField::IpTtl => "ip_ttl",
            HeaderField::TcpSeq => "tcp_seq",
            HeaderField::TcpAck => "tcp_ack",
            HeaderField::TcpWin => "tcp_win",
            HeaderField::TcpFlags => "tcp_flags",
            HeaderField::PayloadSize => "payload_size",
            HeaderField::IcmpType => "icmp_type",
            HeaderField::IcmpCode => "icmp_code",
        }
    }
}

impl fmt::Display for HeaderField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Set of header fields to record, decided once at parser construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FieldSet(u16);

impl FieldSet {
    pub const NONE: FieldSet = FieldSet(0);

    pub fn all() -> FieldSet {
        HeaderField::ALL.iter().copied().collect()
    }

    pub fn with(self, field: HeaderField) -> FieldSet {
        FieldSet(self.0 | field.bit())
    }

    pub fn contains(self, field: HeaderField) -> bool {
        self.0 & field.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Restricts the set to fields recordable for `protocol`.
    pub fn for_protocol(self, protocol: Protocol) -> FieldSet {
        HeaderField::ALL
            .iter()
            .copied()
            .filter(|f| self.contains(*f) && f.applies_to(protocol))
            .collect()
    }
}

impl FromIterator<HeaderField> for FieldSet {
    fn from_iter<I: IntoIterator<Item = HeaderField>>(iter: I) -> FieldSet {
        iter.into_iter()
            .fold(FieldSet::NONE, |set, field| set.with(field))
    }
}

/// Immutable configuration shared by every flow a parser creates.
#[derive(Debug, Clone)]
pub struct FlowConfig {
    /// Which optional header fields to record per packet.
    pub fields: FieldSet,
    /// Smoothing factor for the periodic packet/byte averages, in (0, 1].
    pub avg_ewma_alpha: f64,
    /// Smoothing factor for the TCP rate estimator, in (0, 1].
    pub rate_ewma_alpha: f64,
}

impl Default for FlowConfig {
    fn default() -> Self {
        FlowConfig {
            fields: FieldSet::NONE,
            avg_ewma_alpha: 0.4,
            rate_ewma_alpha: 0.4,
        }
    }
}

/// Contract violations surfaced by flow operations. These indicate caller
/// bugs, not runtime conditions; no state is mutated when one is returned.
#[derive(Debug, Error, PartialEq)]
pub enum FlowError {
    #[error("flow is closed and can no longer be modified")]
    Closed,

    #[error("packet protocol {packet} does not match flow protocol {flow}")]
    ProtocolMismatch { flow: u8, packet: u8 },

    #[error("field {0} is not tracked by this flow")]
    FieldNotTracked(HeaderField),

    #[error("rate estimate requested at {queried} which precedes the last receive at {last_rx}")]
    RetroactiveQuery { queried: u64, last_rx: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_set_membership() {
        let set = FieldSet::NONE.with(HeaderField::IpLen).with(HeaderField::TcpSeq);

        assert!(set.contains(HeaderField::IpLen));
        assert!(set.contains(HeaderField::TcpSeq));
        assert!(!set.contains(HeaderField::TcpAck));
        assert!(!set.contains(HeaderField::IcmpCode));
    }

    #[test]
    fn test_field_set_protocol_restriction() {
        let set = FieldSet::all().for_protocol(Protocol::Udp);

        assert!(set.contains(HeaderField::IpLen));
        assert!(set.contains(HeaderField::PayloadSize));
        assert!(!set.contains(HeaderField::TcpSeq));
        assert!(!set.contains(HeaderField::IcmpType));

        let set = FieldSet::all().for_protocol(Protocol::Icmp);
        assert!(set.contains(HeaderField::IcmpType));
        assert!(!set.contains(HeaderField::TcpWin));
    }

    #[test]
    fn test_field_set_from_iter() {
        let set: FieldSet = [HeaderField::IpTtl, HeaderField::PayloadSize]
            .into_iter()
            .collect();

        assert!(set.contains(HeaderField::IpTtl));
        assert!(set.contains(HeaderField::PayloadSize));
        assert!(!set.contains(HeaderField::IpId));
    }
}
