pub mod announce;
pub mod api;
pub mod engine;
pub mod error;
pub mod events;
pub mod graph;
pub mod overlay;
pub mod schedule;
pub mod supervisor;

use std::path::{Path, PathBuf};
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};

pub use error::GraphError;

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub output: OutputConfig,
    pub video: VideoConfig,
    pub audio: AudioConfig,
    pub overlay: OverlayConfig,
    pub schedule: ScheduleConfig,
    pub announcer: AnnouncerConfig,
    pub events: EventsConfig,
    pub supervisor: SupervisorSettings,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Primary RTMP endpoint
    pub primary: String,
    /// Optional backup endpoint, fed from the same mux
    pub backup: Option<String>,
    /// Appended as the last path element of every endpoint when set
    pub stream_key: Option<String>,
    pub video_bitrate_kbps: u32,
    pub audio_bitrate_kbps: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    /// videotestsrc pattern used as the default picture
    pub pattern: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u32,
    /// Background music looped into the mixer; live silence when unset
    pub music_path: Option<PathBuf>,
    pub music_gain: f64,
    pub ducked_gain: f64,
    pub announcement_gain: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    /// Render target: file:// URL, plain path, or http(s) URL
    pub url: String,
    /// 0 disables reloading
    pub reload_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Empty disables program scheduling
    pub endpoint: String,
    pub poll_interval_secs: u64,
    pub timeout_ms: u64,
    /// Relative program paths are resolved against this directory
    pub media_root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnnouncerConfig {
    pub trigger_file: PathBuf,
    pub check_interval_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub error_policy: events::ErrorPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    /// Program launched as the stream subsystem; defaults to this executable
    pub command: Option<PathBuf>,
    pub args: Vec<String>,
    pub log_file: PathBuf,
    pub monitor_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
    pub stop_grace_secs: u64,
    /// Interval of the stream subsystem's own heartbeat line
    pub heartbeat_log_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            primary: String::new(),
            backup: None,
            stream_key: None,
            video_bitrate_kbps: 2000,
            audio_bitrate_kbps: 128,
        }
    }
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            framerate: 30,
            pattern: "ball".into(),
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
            music_path: None,
            music_gain: 1.0,
            ducked_gain: 0.15,
            announcement_gain: 1.5,
        }
    }
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            url: "overlay.png".into(),
            reload_interval_secs: 0,
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8123/api/programs/current".into(),
            poll_interval_secs: 5,
            timeout_ms: 2000,
            media_root: PathBuf::from("media"),
        }
    }
}

impl Default for AnnouncerConfig {
    fn default() -> Self {
        Self {
            trigger_file: PathBuf::from("tts_trigger.json"),
            check_interval_ms: 1000,
        }
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            log_file: PathBuf::from("stream_log.txt"),
            monitor_interval_secs: 5,
            heartbeat_timeout_secs: 30,
            stop_grace_secs: 5,
            heartbeat_log_secs: 10,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8124".into(),
        }
    }
}

impl Config {
    /// Load defaults, then the optional TOML file, then `ONAIR__*` variables,
    /// then the variables the supervisor hands to its child.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Config::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let mut config: Config = builder
            .add_source(
                config::Environment::with_prefix("ONAIR")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .map_err(|e| eyre!("Failed to load configuration: {}", e))?
            .try_deserialize()
            .map_err(|e| eyre!("Invalid configuration: {}", e))?;

        config.apply_process_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Applies the process-boundary variables set by the supervisor.
    pub fn apply_process_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = non_empty(supervisor::ENV_PRIMARY) {
            self.output.primary = url;
        }
        if let Some(url) = non_empty(supervisor::ENV_BACKUP) {
            self.output.backup = Some(url);
        }
        if let Some(key) = non_empty(supervisor::ENV_STREAM_KEY) {
            self.output.stream_key = Some(key);
        }
        if let Some(url) = non_empty(supervisor::ENV_OVERLAY) {
            self.overlay.url = url;
        }
    }

    /// Period of the overlay render timer
    pub fn frame_period(&self) -> Duration {
        Duration::from_millis(1000 / u64::from(self.video.framerate.max(1)))
    }
}
