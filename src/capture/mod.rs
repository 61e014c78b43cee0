pub mod engine;

pub use engine::{CaptureEngine, CaptureError, CaptureStats, CapturedPacket};
