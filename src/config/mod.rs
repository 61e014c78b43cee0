pub mod settings;

pub use settings::{CaptureSettings, OutputSettings, ParserSettings, Settings};
