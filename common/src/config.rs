use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub stream: StreamConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub window: WindowConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    Live,
    File,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_stream_mode")]
    pub mode: StreamMode,
    /// Input URL for the live decoder.
    #[serde(default)]
    pub url: String,
    /// Stored video for file mode.
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub offset_frames: u64,
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    /// Gaussian blur applied by the decoder before frames reach the scorer.
    #[serde(default)]
    pub blur_sigma: Option<f64>,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    /// Process every Nth decoded frame.
    #[serde(default = "default_frame_hop")]
    pub frame_hop: u64,
    #[serde(default)]
    pub max_reconnects: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectionConfig {
    #[serde(default = "default_sensitivity")]
    pub sensitivity: f64,
    #[serde(default = "default_decay")]
    pub decay: f64,
    #[serde(default)]
    pub min: i64,
    #[serde(default = "default_confidence_max")]
    pub max: i64,
    /// Confidence at or above which a frame logs a snow event.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WindowConfig {
    #[serde(default = "default_window_ticks")]
    pub window_ticks: u32,
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_notify_fraction")]
    pub notify_fraction: f64,
    #[serde(default = "default_no_snow_fraction")]
    pub no_snow_fraction: f64,
    #[serde(default = "default_refractory_ticks")]
    pub refractory_ticks: u32,
    /// Start with the refractory timer expired so the first onset notifies.
    #[serde(default = "default_true")]
    pub immediate_first_notify: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotifyConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Also report alerts through the log.
    #[serde(default = "default_true")]
    pub log: bool,
    #[serde(default)]
    pub webhooks: Vec<WebhookConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub form: BTreeMap<String, String>,
    #[serde(default = "default_webhook_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    Fifo,
    Encoder,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_sink_kind")]
    pub sink: SinkKind,
    #[serde(default = "default_pipe_path")]
    pub pipe_path: String,
    #[serde(default = "default_output_fps")]
    pub fps: f64,
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    /// Destination for the encoder sink, e.g. an RTMP ingest URL.
    #[serde(default)]
    pub publish_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            sensitivity: default_sensitivity(),
            decay: default_decay(),
            min: 0,
            max: default_confidence_max(),
            confidence_threshold: default_confidence_threshold(),
        }
    }
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            window_ticks: default_window_ticks(),
            tick_ms: default_tick_ms(),
            notify_fraction: default_notify_fraction(),
            no_snow_fraction: default_no_snow_fraction(),
            refractory_ticks: default_refractory_ticks(),
            immediate_first_notify: true,
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            log: true,
            webhooks: Vec::new(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sink: default_sink_kind(),
            pipe_path: default_pipe_path(),
            fps: default_output_fps(),
            buffer_capacity: default_buffer_capacity(),
            publish_url: String::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.stream;
        match s.mode {
            StreamMode::Live if s.url.is_empty() => {
                return Err(ConfigError::Invalid("stream.url is required in live mode".into()))
            }
            StreamMode::File if s.file.is_none() => {
                return Err(ConfigError::Invalid("stream.file is required in file mode".into()))
            }
            _ => {}
        }
        if s.width == 0 || s.height == 0 {
            return Err(ConfigError::Invalid("stream.width and stream.height must be non-zero".into()));
        }
        if s.frame_hop == 0 {
            return Err(ConfigError::Invalid("stream.frame_hop must be at least 1".into()));
        }
        if s.read_timeout_secs == 0 {
            return Err(ConfigError::Invalid("stream.read_timeout_secs must be at least 1".into()));
        }

        if self.detection.min > self.detection.max {
            return Err(ConfigError::Invalid("detection.min must not exceed detection.max".into()));
        }

        let w = &self.window;
        if w.window_ticks == 0 || w.tick_ms == 0 {
            return Err(ConfigError::Invalid("window.window_ticks and window.tick_ms must be non-zero".into()));
        }
        for (name, fraction) in [
            ("window.notify_fraction", w.notify_fraction),
            ("window.no_snow_fraction", w.no_snow_fraction),
        ] {
            if !(fraction > 0.0 && fraction <= 1.0) {
                return Err(ConfigError::Invalid(format!("{name} must be in (0, 1], got {fraction}")));
            }
        }

        if self.notify.max_attempts == 0 {
            return Err(ConfigError::Invalid("notify.max_attempts must be at least 1".into()));
        }

        let o = &self.output;
        if o.enabled {
            // the emission period 1/fps has to fit in a Duration
            let period = Duration::try_from_secs_f64(1.0 / o.fps).ok();
            if !(o.fps.is_finite() && o.fps > 0.0) || period.map_or(true, |p| p.is_zero()) {
                return Err(ConfigError::Invalid(format!(
                    "output.fps must be a positive rate with a representable period, got {}",
                    o.fps
                )));
            }
            if o.buffer_capacity == 0 {
                return Err(ConfigError::Invalid("output.buffer_capacity must be non-zero".into()));
            }
            if o.sink == SinkKind::Encoder && o.publish_url.is_empty() {
                return Err(ConfigError::Invalid("output.publish_url is required for the encoder sink".into()));
            }
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// Default value functions
fn default_stream_mode() -> StreamMode {
    StreamMode::Live
}
fn default_ffmpeg_path() -> String {
    "ffmpeg".into()
}
fn default_width() -> u32 {
    480
}
fn default_height() -> u32 {
    270
}
fn default_read_timeout() -> u64 {
    10
}
fn default_frame_hop() -> u64 {
    1
}
fn default_sensitivity() -> f64 {
    16.0
}
fn default_decay() -> f64 {
    10.0
}
fn default_confidence_max() -> i64 {
    255
}
fn default_confidence_threshold() -> i64 {
    100
}
fn default_window_ticks() -> u32 {
    60
}
fn default_tick_ms() -> u64 {
    1000
}
fn default_notify_fraction() -> f64 {
    0.5
}
fn default_no_snow_fraction() -> f64 {
    0.8
}
fn default_refractory_ticks() -> u32 {
    600
}
fn default_max_attempts() -> u32 {
    5
}
fn default_retry_backoff_ms() -> u64 {
    2000
}
fn default_webhook_timeout() -> u64 {
    10
}
fn default_sink_kind() -> SinkKind {
    SinkKind::Fifo
}
fn default_pipe_path() -> String {
    "/tmp/snowtify.pipe".into()
}
fn default_output_fps() -> f64 {
    10.0
}
fn default_buffer_capacity() -> usize {
    64
}
fn default_log_level() -> String {
    "info".into()
}
fn default_true() -> bool {
    true
}
