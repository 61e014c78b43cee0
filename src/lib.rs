// Library exports for flowmeter
pub mod capture;
pub mod config;
pub mod export;
pub mod flow;
pub mod packet;
pub mod parser;

#[cfg(test)]
pub(crate) mod testutil;

pub use capture::{CaptureEngine, CaptureError, CapturedPacket};
pub use config::settings;
pub use config::settings::Settings;
pub use export::{FlowRecord, JsonLinesSink};
pub use flow::{
    FieldSet, Flow, FlowConfig, FlowError, FlowInfo, FlowState, HeaderField, TcpRateEstimator,
};
pub use packet::{IcmpHeader, IpHeader, Protocol, TcpHeader, Transport, UdpHeader};
pub use parser::{FlowKey, FlowParser, FlowSink, ParserConfig};

// Error types
pub use anyhow::{Error, Result};
