use std::fs;

use serde::{Deserialize, Serialize};

use crate::flow::{FieldSet, FlowConfig, HeaderField};
use crate::parser::ParserConfig;

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    pub capture: CaptureSettings,
    pub parser: ParserSettings,
    pub output: OutputSettings,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct CaptureSettings {
    pub interface: Option<String>,
    pub promiscuous: bool,
    pub timeout_ms: i32,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ParserSettings {
    /// Flow inactivity timeout, in seconds of capture time.
    pub flow_timeout_secs: u64,
    /// Header fields to record per packet; empty disables series tracking.
    pub fields: Vec<HeaderField>,
    pub avg_ewma_alpha: f64,
    pub rate_ewma_alpha: f64,
    /// Cadence of the periodic average update, in seconds of capture time.
    pub avg_period_secs: u64,
    /// Cadence of the expiry scan, in seconds of capture time.
    pub collect_period_secs: u64,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct OutputSettings {
    /// Path for the JSON-lines flow records; stdout when unset.
    pub path: Option<String>,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            interface: None,
            promiscuous: false,
            timeout_ms: 1000,
        }
    }
}

impl Default for ParserSettings {
    fn default() -> Self {
        Self {
            flow_timeout_secs: 60,
            fields: Vec::new(),
            avg_ewma_alpha: 0.4,
            rate_ewma_alpha: 0.4,
            avg_period_secs: 1,
            collect_period_secs: 10,
        }
    }
}

impl ParserSettings {
    pub fn to_parser_config(&self) -> ParserConfig {
        ParserConfig {
            flow_timeout: self.flow_timeout_secs * 1_000_000,
            flow: FlowConfig {
                fields: self.fields.iter().copied().collect::<FieldSet>(),
                avg_ewma_alpha: self.avg_ewma_alpha,
                rate_ewma_alpha: self.rate_ewma_alpha,
            },
        }
    }
}

impl Settings {
    pub fn load_from_file(path: &str) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&content)?;
        Ok(settings)
    }

    pub fn save_to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}
