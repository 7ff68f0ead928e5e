use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use anyhow::Context;

use super::calibration::{CalibrationCurve, CalibrationTable, MAX_GAIN};
use super::platform;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub sink: SinkConfig,
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default = "default_channels")]
    pub channels: Vec<ChannelConfig>,
}

/// How a physical value is turned into a waveform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Encoding {
    /// Sine tone whose amplitude is the calibrated gain.
    #[default]
    Gain,
    /// Unipolar square wave whose duty cycle is the calibrated value.
    DutyCycle,
}

/// System metric that drives a channel in `run` mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Cpu,
    Ram,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Output device identifier, passed through to the sink untouched.
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default)]
    pub encoding: Encoding,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkConfig {
    #[serde(default = "default_sink_program")]
    pub program: String,
    /// Sink buffer size hint.  Close to the block duration keeps latency low
    /// without underruns.
    #[serde(default = "default_buffer_time_ms")]
    pub buffer_time_ms: u64,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric: Option<Metric>,
    #[serde(default = "default_curve")]
    pub calibration: CalibrationCurve,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            encoding: Encoding::default(),
        }
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            program: default_sink_program(),
            buffer_time_ms: default_buffer_time_ms(),
            retry_delay_ms: default_retry_delay_ms(),
            max_retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_device() -> String {
    "default".to_string()
}

fn default_sink_program() -> String {
    platform::DEFAULT_SINK_PROGRAM.to_string()
}

fn default_buffer_time_ms() -> u64 {
    100
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_curve() -> CalibrationCurve {
    CalibrationCurve::linear(MAX_GAIN)
}

fn default_channels() -> Vec<ChannelConfig> {
    vec![
        ChannelConfig {
            name: "CPU".to_string(),
            metric: Some(Metric::Cpu),
            calibration: default_curve(),
        },
        ChannelConfig {
            name: "RAM".to_string(),
            metric: Some(Metric::Ram),
            calibration: default_curve(),
        },
    ]
}

impl Config {
    /// Load from the default location, writing defaults on first run.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            let config = Self::default();
            config.save_to(path)?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content)?;
        if config.channels.is_empty() {
            anyhow::bail!("at least one channel must be configured");
        }
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn calibration_table(&self) -> CalibrationTable {
        self.channels
            .iter()
            .map(|channel| channel.calibration.clone())
            .collect()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            audio: AudioConfig::default(),
            sink: SinkConfig::default(),
            poll: PollConfig::default(),
            channels: default_channels(),
        }
    }
}

/// A config bound to a file, remembering what was last written so editors
/// can ask whether there is anything unsaved.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
    pub config: Config,
    last_saved: Config,
}

impl ConfigStore {
    /// Fresh defaults bound to `path`.  Nothing is read or written.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let config = Config::default();
        Self {
            path: path.into(),
            last_saved: config.clone(),
            config,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&mut self) -> anyhow::Result<()> {
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading {}", self.path.display()))?;
        let config = Config::from_toml_str(&content)
            .with_context(|| format!("parsing {}", self.path.display()))?;
        self.last_saved = config.clone();
        self.config = config;
        tracing::info!("Loaded config from {:?}", self.path);
        Ok(())
    }

    pub fn save(&mut self) -> anyhow::Result<()> {
        self.config.save_to(&self.path)?;
        self.last_saved = self.config.clone();
        tracing::info!("Saved config to {:?}", self.path);
        Ok(())
    }

    pub fn has_changed(&self) -> bool {
        self.config != self.last_saved
    }
}
