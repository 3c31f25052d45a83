use crate::{DaqError, DaqResult, SHORT_EVENT_WORDS};
use confique::Config;
use serde::Deserialize;
use std::{path::Path, time::Duration};

#[derive(Config, Debug, Clone)]
pub struct Conf {
    #[config(nested)]
    pub device: DeviceSettings,
    #[config(nested)]
    pub output: OutputSettings,
    #[config(nested)]
    pub events: EventSettings,
    #[config(nested)]
    pub queues: QueueSettings,
    #[config(nested)]
    pub debug: DebugSettings,
}

#[derive(Config, Debug, Clone)]
pub struct DeviceSettings {
    #[config(env = "SGDAQ_DEVICE_ADDRESS", default = "127.0.0.1:8888")]
    pub address: String,
    /// Polling rate in Hz; the back-off when data is insufficient is `1 / max_rate`.
    #[config(default = 100.0)]
    pub max_rate: f64,
    /// Words per packet.
    #[config(default = 100000)]
    pub packet_size: usize,
    #[config(default = 5000)]
    pub connect_timeout_ms: u64,
    /// Upper bound on one blocking read; must be > 0.
    #[config(default = 5000)]
    pub read_timeout_ms: u64,
    /// Extra connection attempts at session start; 0 gives up after the first failure.
    #[config(default = 0)]
    pub connect_retries: u32,
    #[config(default = 1000)]
    pub connect_retry_ms: u64,
    #[config(default = 1000)]
    pub reset_settle_ms: u64,
    /// How long `stop` waits for an in-flight read before closing the socket under it.
    #[config(default = 500)]
    pub stop_grace_ms: u64,
}

#[derive(Config, Debug, Clone)]
pub struct OutputSettings {
    #[config(env = "SGDAQ_OUTPUT_DIR", default = "data")]
    pub directory: String,
    #[config(default = "softglue")]
    pub file_name: String,
    #[config(default = "/entry/data")]
    pub dataset_path: String,
    /// Column growth block, in events.
    #[config(default = 100000)]
    pub resize_by: usize,
    /// Hard cap on events per file; 0 = unlimited.
    #[config(default = 0)]
    pub max_events: usize,
    #[config(default = false)]
    pub auto_increment: bool,
    #[config(default = 0)]
    pub file_number: u32,
    /// blosc-zstd level for dataset chunks; 0 disables compression.
    #[config(default = 0)]
    pub compression_level: u8,
    #[config(default = 2)]
    pub blosc_threads: u8,
}

#[derive(Config, Debug, Clone)]
pub struct EventSettings {
    /// Label of each of the 8 positions of a short event, in position order.
    #[config(default = ["s0", "s1", "s2", "s3", "s4", "s5", "s6", "s7"])]
    pub labels: Vec<String>,
    pub derived: Option<Vec<DerivedOutput>>,
}

/// A named linear combination of the 8 stream values of each event.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct DerivedOutput {
    pub name: String,
    pub weights: Vec<f64>,
}

#[derive(Config, Debug, Clone)]
pub struct QueueSettings {
    #[config(default = 64)]
    pub storage_depth: usize,
    #[config(default = 4)]
    pub telemetry_depth: usize,
}

#[derive(Config, Debug, Clone)]
pub struct DebugSettings {
    #[config(default = "info")]
    pub log_level: String,
    #[config(default = "softglue_daq.log")]
    pub log_file: String,
}

impl Conf {
    /// Load from a TOML file (if present) layered over environment and defaults, then
    /// validate.
    pub fn load(path: Option<&Path>) -> DaqResult<Self> {
        let mut builder = Conf::builder().env();
        if let Some(path) = path {
            builder = builder.file(path);
        }
        let conf = builder
            .load()
            .map_err(|e| DaqError::Config(e.to_string()))?;
        conf.validate()?;
        Ok(conf)
    }

    pub fn validate(&self) -> DaqResult<()> {
        if self.device.packet_size == 0 {
            return Err(DaqError::Config("device.packet_size must be > 0".into()));
        }
        if !(self.device.max_rate.is_finite() && self.device.max_rate > 0.0) {
            return Err(DaqError::Config("device.max_rate must be > 0".into()));
        }
        if self.device.connect_timeout_ms == 0 || self.device.read_timeout_ms == 0 {
            return Err(DaqError::Config(
                "device connect/read timeouts must be > 0".into(),
            ));
        }
        if self.output.resize_by == 0 {
            return Err(DaqError::Config("output.resize_by must be > 0".into()));
        }
        if self.queues.storage_depth == 0 || self.queues.telemetry_depth == 0 {
            return Err(DaqError::Config("queue depths must be > 0".into()));
        }
        self.labels()?;
        self.derived_outputs()?;
        Ok(())
    }

    pub fn labels(&self) -> DaqResult<StreamLabels> {
        StreamLabels::try_from(self.events.labels.clone())
    }

    pub fn derived_outputs(&self) -> DaqResult<Vec<DerivedOutput>> {
        let derived = self.events.derived.clone().unwrap_or_default();
        for output in &derived {
            if output.weights.len() != SHORT_EVENT_WORDS {
                return Err(DaqError::Config(format!(
                    "derived output '{}' needs {} weights, got {}",
                    output.name,
                    SHORT_EVENT_WORDS,
                    output.weights.len()
                )));
            }
        }
        Ok(derived)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.device.max_rate)
    }
}

/// Fixed, ordered mapping from event position to stream label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamLabels([String; SHORT_EVENT_WORDS]);

impl StreamLabels {
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn get(&self, position: usize) -> Option<&str> {
        self.0.get(position).map(String::as_str)
    }
}

impl TryFrom<Vec<String>> for StreamLabels {
    type Error = DaqError;

    fn try_from(labels: Vec<String>) -> DaqResult<Self> {
        let labels: [String; SHORT_EVENT_WORDS] = labels.try_into().map_err(|v: Vec<String>| {
            DaqError::Config(format!(
                "events.labels needs exactly {} entries, got {}",
                SHORT_EVENT_WORDS,
                v.len()
            ))
        })?;
        for (i, label) in labels.iter().enumerate() {
            if label.trim().is_empty() || label.contains('/') {
                return Err(DaqError::Config(format!(
                    "events.labels[{i}] is not a valid dataset name: {label:?}"
                )));
            }
            if labels[..i].contains(label) {
                return Err(DaqError::Config(format!("duplicate label {label:?}")));
            }
        }
        Ok(Self(labels))
    }
}
