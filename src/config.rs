//! File configuration (`oledviz.toml`) and its conversion into the runtime
//! settings of each component. Every section and field is optional.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::analysis::spectrum::{
    DEFAULT_NOISE_REDUCTION, DEFAULT_SENSITIVITY, NOISE_REDUCTION_MAX, SENSITIVITY_MAX,
    SENSITIVITY_MIN,
};
use crate::analysis::stereo::STEREO_WINDOW;
use crate::audio::{AudioConfig, BASS_FFT_SIZE};
use crate::metadata::mpd::{DEFAULT_HOST, DEFAULT_PORT};
use crate::metadata::{MpdConnector, SyncTiming};

pub const DEFAULT_CONFIG_FILE: &str = "oledviz.toml";

/// Upper bound for `[audio] silence_timeout_secs` (one day).
pub const MAX_SILENCE_TIMEOUT_SECS: f64 = 86_400.0;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VisualizerConfig {
    #[serde(default)]
    pub audio: AudioSection,
    #[serde(default)]
    pub analyzer: AnalyzerSection,
    #[serde(default)]
    pub mpd: MpdSection,
    #[serde(default)]
    pub control: ControlSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
    pub json: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            filter: "oledviz=info".into(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioSection {
    pub devices: Vec<String>,
    pub sample_rate: u32,
    pub channels: u16,
    pub awake_block_frames: usize,
    pub asleep_block_frames: usize,
    pub read_timeout_ms: u64,
    pub silence_threshold: f32,
    pub silence_timeout_secs: f64,
}

impl Default for AudioSection {
    fn default() -> Self {
        let d = AudioConfig::default();
        Self {
            devices: d.devices,
            sample_rate: d.sample_rate,
            channels: d.channels,
            awake_block_frames: d.awake_block_frames,
            asleep_block_frames: d.asleep_block_frames,
            read_timeout_ms: d.read_timeout.as_millis() as u64,
            silence_threshold: d.silence_threshold,
            silence_timeout_secs: d.silence_timeout.as_secs_f64(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalyzerSection {
    pub sensitivity: u32,
    pub noise_reduction: u32,
    pub stereo_window: usize,
}

impl Default for AnalyzerSection {
    fn default() -> Self {
        Self {
            sensitivity: DEFAULT_SENSITIVITY,
            noise_reduction: DEFAULT_NOISE_REDUCTION,
            stereo_window: STEREO_WINDOW,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MpdSection {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub connect_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub reconnect_delay_ms: u64,
    pub suspend_poll_ms: u64,
    pub cancel_timeout_ms: u64,
}

impl Default for MpdSection {
    fn default() -> Self {
        Self {
            enabled: true,
            host: DEFAULT_HOST.into(),
            port: DEFAULT_PORT,
            connect_timeout_ms: 2000,
            idle_timeout_ms: 1000,
            reconnect_delay_ms: 5000,
            suspend_poll_ms: 500,
            cancel_timeout_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControlSection {
    pub awake_frame_ms: u64,
    pub asleep_frame_ms: u64,
}

impl Default for ControlSection {
    fn default() -> Self {
        Self {
            awake_frame_ms: 10,
            asleep_frame_ms: 100,
        }
    }
}

impl VisualizerConfig {
    /// Parse a TOML document. Out-of-range values are clamped, not rejected.
    pub fn from_toml_str(content: &str, origin: &Path) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })?;
        config.normalize();
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content, path)
    }

    /// Apply `MPD_HOST` / `MPD_PORT` from the environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup("MPD_HOST").filter(|h| !h.is_empty()) {
            self.mpd.host = host;
        }
        if let Some(port) = lookup("MPD_PORT") {
            match port.parse() {
                Ok(port) => self.mpd.port = port,
                Err(_) => warn!(value = %port, "ignoring invalid MPD_PORT"),
            }
        }
    }

    /// Bring every value into its valid range.
    pub fn normalize(&mut self) {
        let a = &mut self.analyzer;
        a.sensitivity = a.sensitivity.clamp(SENSITIVITY_MIN, SENSITIVITY_MAX);
        a.noise_reduction = a.noise_reduction.min(NOISE_REDUCTION_MAX);
        a.stereo_window = a.stereo_window.clamp(1, BASS_FFT_SIZE);

        let au = &mut self.audio;
        au.sample_rate = au.sample_rate.max(1);
        au.channels = au.channels.clamp(1, 2);
        au.awake_block_frames = au.awake_block_frames.clamp(1, BASS_FFT_SIZE);
        if au.asleep_block_frames == 0 || au.asleep_block_frames >= au.awake_block_frames {
            au.asleep_block_frames = (au.awake_block_frames / 8).max(1);
        }
        au.read_timeout_ms = au.read_timeout_ms.max(1);
        if !au.silence_threshold.is_finite() || au.silence_threshold < 0.0 {
            au.silence_threshold = AudioConfig::default().silence_threshold;
        }
        if !au.silence_timeout_secs.is_finite() || au.silence_timeout_secs <= 0.0 {
            au.silence_timeout_secs = AudioConfig::default().silence_timeout.as_secs_f64();
        }
        au.silence_timeout_secs = au.silence_timeout_secs.min(MAX_SILENCE_TIMEOUT_SECS);

        let m = &mut self.mpd;
        for ms in [
            &mut m.connect_timeout_ms,
            &mut m.idle_timeout_ms,
            &mut m.reconnect_delay_ms,
            &mut m.suspend_poll_ms,
            &mut m.cancel_timeout_ms,
        ] {
            *ms = (*ms).max(1);
        }

        let c = &mut self.control;
        c.awake_frame_ms = c.awake_frame_ms.max(1);
        c.asleep_frame_ms = c.asleep_frame_ms.max(c.awake_frame_ms);
    }

    pub fn audio_config(&self) -> AudioConfig {
        let a = &self.audio;
        AudioConfig {
            devices: a.devices.clone(),
            sample_rate: a.sample_rate,
            channels: a.channels,
            awake_block_frames: a.awake_block_frames,
            asleep_block_frames: a.asleep_block_frames,
            ring_capacity: BASS_FFT_SIZE * 2,
            read_timeout: Duration::from_millis(a.read_timeout_ms),
            silence_threshold: a.silence_threshold,
            silence_timeout: Duration::try_from_secs_f64(a.silence_timeout_secs)
                .ok()
                .filter(|d| !d.is_zero())
                .unwrap_or_else(|| AudioConfig::default().silence_timeout),
        }
    }

    pub fn sync_timing(&self) -> SyncTiming {
        SyncTiming {
            idle_timeout: Duration::from_millis(self.mpd.idle_timeout_ms),
            reconnect_delay: Duration::from_millis(self.mpd.reconnect_delay_ms),
            suspend_poll: Duration::from_millis(self.mpd.suspend_poll_ms),
        }
    }

    pub fn mpd_connector(&self) -> MpdConnector {
        MpdConnector::new(self.mpd.host.clone(), self.mpd.port).with_timeouts(
            Duration::from_millis(self.mpd.connect_timeout_ms),
            Duration::from_millis(self.mpd.cancel_timeout_ms),
        )
    }

    pub fn awake_frame_delay(&self) -> Duration {
        Duration::from_millis(self.control.awake_frame_ms)
    }

    pub fn asleep_frame_delay(&self) -> Duration {
        Duration::from_millis(self.control.asleep_frame_ms)
    }
}

/// Load `explicit` if given, else `./oledviz.toml` if it exists, else defaults.
pub fn load_config(explicit: Option<&Path>) -> Result<VisualizerConfig, ConfigError> {
    if let Some(path) = explicit {
        debug!(path = %path.display(), "loading config");
        return VisualizerConfig::from_file(path);
    }
    let local = PathBuf::from(DEFAULT_CONFIG_FILE);
    if local.exists() {
        debug!(path = %local.display(), "loading config");
        return VisualizerConfig::from_file(&local);
    }
    Ok(VisualizerConfig::default())
}
