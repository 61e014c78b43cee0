//! Flow keying and the concurrent flow table.

pub mod key;
pub mod table;

pub use key::FlowKey;
pub use table::{FlowParser, FlowSink, ParserConfig};
