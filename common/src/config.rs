use serde::Deserialize;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub adaptive: AdaptiveConfig,
    #[serde(default)]
    pub beacon: BeaconConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Idle time before TCP keepalive starts checking the peer. Also advertised in
    /// the `Keep-Alive: timeout=` response header.
    #[serde(default = "default_keep_alive_idle")]
    pub keep_alive_idle_secs: u64,
    /// Time between unanswered TCP keepalive checks.
    #[serde(default = "default_keep_alive_interval")]
    pub keep_alive_interval_secs: u64,
    /// Unanswered checks before the kernel drops the connection.
    #[serde(default = "default_keep_alive_retries")]
    pub keep_alive_retries: u32,
    /// Advertised in the `Keep-Alive: max=` response header.
    #[serde(default = "default_keep_alive_count")]
    pub keep_alive_count: u32,
}

/// Which provider stands in for the camera sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Pull an upstream MJPEG stream over HTTP.
    Mjpeg,
    /// Cycle through JPEG files in a directory.
    Replay,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    #[serde(default = "default_source")]
    pub source: SourceKind,
    #[serde(default = "default_upstream_url")]
    pub url: String,
    #[serde(default = "default_replay_dir")]
    pub replay_dir: PathBuf,
    #[serde(default = "default_replay_fps")]
    pub replay_fps: f64,
    /// Number of frame buffers that may be held at once.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_ms: u64,
    /// Back-off after the source reports no frame.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
    /// Poll interval of the capture task while no client is attached.
    #[serde(default = "default_idle_poll")]
    pub idle_poll_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    /// The serving session pulls frames from the source itself.
    Direct,
    /// A capture task feeds a bounded queue drained by the session.
    Queued,
}

impl std::fmt::Display for StreamMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamMode::Direct => write!(f, "direct"),
            StreamMode::Queued => write!(f, "queued"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_mode")]
    pub mode: StreamMode,
    #[serde(default = "default_boundary")]
    pub boundary: String,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_delay")]
    pub chunk_delay_ms: u64,
    /// How long a queued session waits for a frame before sending a keep-alive.
    #[serde(default = "default_keepalive_timeout")]
    pub keepalive_timeout_ms: u64,
    /// Chunks buffered between the session task and the HTTP body.
    #[serde(default = "default_chunk_buffer")]
    pub chunk_buffer: usize,
    /// A chunk that cannot be buffered within this window counts as a transient error.
    #[serde(default = "default_send_timeout")]
    pub send_timeout_ms: u64,
    #[serde(default = "default_log_every")]
    pub log_every_frames: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
    #[serde(default = "default_queue_skip")]
    pub skip_modulus: u32,
    #[serde(default = "default_queue_max_frame")]
    pub max_frame_bytes: usize,
    /// Pause after each forwarded frame (roughly 10 fps at the default).
    #[serde(default = "default_frame_interval")]
    pub frame_interval_ms: u64,
    /// Pause after a skipped or oversized frame.
    #[serde(default = "default_reject_delay")]
    pub reject_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdaptiveConfig {
    #[serde(default = "default_baseline_skip")]
    pub baseline_skip: u32,
    #[serde(default = "default_degraded_skip")]
    pub degraded_skip: u32,
    /// The degraded skip modulus applies once the error count exceeds this.
    #[serde(default = "default_skip_escalation")]
    pub skip_escalation_errors: u32,
    #[serde(default = "default_max_frame")]
    pub max_frame_bytes: usize,
    /// The size ceiling is divided by this while any error is outstanding.
    #[serde(default = "default_ceiling_divisor")]
    pub ceiling_divisor: usize,
    #[serde(default = "default_base_frame_delay")]
    pub base_frame_delay_ms: u64,
    #[serde(default = "default_degraded_frame_delay")]
    pub degraded_frame_delay_ms: u64,
    #[serde(default = "default_header_backoff")]
    pub header_backoff_ms: u64,
    #[serde(default = "default_payload_backoff")]
    pub payload_backoff_ms: u64,
    #[serde(default = "default_max_errors")]
    pub max_errors: u32,
    #[serde(default = "default_cooldown")]
    pub cooldown_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BeaconConfig {
    #[serde(default = "default_beacon_enabled")]
    pub enabled: bool,
    #[serde(default = "default_beacon_port")]
    pub port: u16,
    #[serde(default = "default_beacon_interval")]
    pub interval_ms: u64,
    #[serde(default = "default_beacon_prefix")]
    pub prefix: String,
    /// Address to announce. Discovered from the default route when unset.
    #[serde(default)]
    pub advertise_ip: Option<Ipv4Addr>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            port: default_port(),
            keep_alive_idle_secs: default_keep_alive_idle(),
            keep_alive_interval_secs: default_keep_alive_interval(),
            keep_alive_retries: default_keep_alive_retries(),
            keep_alive_count: default_keep_alive_count(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            source: default_source(),
            url: default_upstream_url(),
            replay_dir: default_replay_dir(),
            replay_fps: default_replay_fps(),
            pool_size: default_pool_size(),
            acquire_timeout_ms: default_acquire_timeout(),
            retry_delay_ms: default_retry_delay(),
            idle_poll_ms: default_idle_poll(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            boundary: default_boundary(),
            chunk_size: default_chunk_size(),
            chunk_delay_ms: default_chunk_delay(),
            keepalive_timeout_ms: default_keepalive_timeout(),
            chunk_buffer: default_chunk_buffer(),
            send_timeout_ms: default_send_timeout(),
            log_every_frames: default_log_every(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
            skip_modulus: default_queue_skip(),
            max_frame_bytes: default_queue_max_frame(),
            frame_interval_ms: default_frame_interval(),
            reject_delay_ms: default_reject_delay(),
        }
    }
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            baseline_skip: default_baseline_skip(),
            degraded_skip: default_degraded_skip(),
            skip_escalation_errors: default_skip_escalation(),
            max_frame_bytes: default_max_frame(),
            ceiling_divisor: default_ceiling_divisor(),
            base_frame_delay_ms: default_base_frame_delay(),
            degraded_frame_delay_ms: default_degraded_frame_delay(),
            header_backoff_ms: default_header_backoff(),
            payload_backoff_ms: default_payload_backoff(),
            max_errors: default_max_errors(),
            cooldown_ms: default_cooldown(),
        }
    }
}

impl Default for BeaconConfig {
    fn default() -> Self {
        Self {
            enabled: default_beacon_enabled(),
            port: default_beacon_port(),
            interval_ms: default_beacon_interval(),
            prefix: default_beacon_prefix(),
            advertise_ip: None,
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
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let checks: [(&str, bool); 11] = [
            ("server.keep_alive_idle_secs", self.server.keep_alive_idle_secs == 0),
            ("server.keep_alive_interval_secs", self.server.keep_alive_interval_secs == 0),
            ("server.keep_alive_retries", self.server.keep_alive_retries == 0),
            ("adaptive.baseline_skip", self.adaptive.baseline_skip == 0),
            ("adaptive.degraded_skip", self.adaptive.degraded_skip == 0),
            ("adaptive.ceiling_divisor", self.adaptive.ceiling_divisor == 0),
            ("queue.skip_modulus", self.queue.skip_modulus == 0),
            ("queue.capacity", self.queue.capacity == 0),
            ("stream.chunk_size", self.stream.chunk_size == 0),
            ("stream.chunk_buffer", self.stream.chunk_buffer == 0),
            ("capture.pool_size", self.capture.pool_size == 0),
        ];
        if let Some((field, _)) = checks.iter().find(|(_, bad)| *bad) {
            return Err(ConfigError::Invalid(format!("{field} must be greater than zero")));
        }
        if self.stream.boundary.is_empty() {
            return Err(ConfigError::Invalid("stream.boundary must not be empty".into()));
        }
        if !(self.capture.replay_fps > 0.0) {
            return Err(ConfigError::Invalid("capture.replay_fps must be positive".into()));
        }
        Ok(())
    }
}

impl CaptureConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }
}

impl StreamConfig {
    pub fn chunk_delay(&self) -> Duration {
        Duration::from_millis(self.chunk_delay_ms)
    }
    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_millis(self.keepalive_timeout_ms)
    }
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

impl QueueConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }
    pub fn reject_delay(&self) -> Duration {
        Duration::from_millis(self.reject_delay_ms)
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
fn default_bind_addr() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8080
}
fn default_keep_alive_idle() -> u64 {
    5
}
fn default_keep_alive_interval() -> u64 {
    3
}
fn default_keep_alive_retries() -> u32 {
    5
}
fn default_keep_alive_count() -> u32 {
    100
}
fn default_source() -> SourceKind {
    SourceKind::Replay
}
fn default_upstream_url() -> String {
    "http://127.0.0.1:8081/stream".into()
}
fn default_replay_dir() -> PathBuf {
    PathBuf::from("frames")
}
fn default_replay_fps() -> f64 {
    20.0
}
fn default_pool_size() -> usize {
    2
}
fn default_acquire_timeout() -> u64 {
    1000
}
fn default_retry_delay() -> u64 {
    50
}
fn default_idle_poll() -> u64 {
    500
}
fn default_mode() -> StreamMode {
    StreamMode::Direct
}
fn default_boundary() -> String {
    "123456789000000000000987654321".into()
}
fn default_chunk_size() -> usize {
    2024
}
fn default_chunk_delay() -> u64 {
    5
}
fn default_keepalive_timeout() -> u64 {
    1000
}
fn default_chunk_buffer() -> usize {
    8
}
fn default_send_timeout() -> u64 {
    5000
}
fn default_log_every() -> u64 {
    20
}
fn default_queue_capacity() -> usize {
    5
}
fn default_queue_skip() -> u32 {
    2
}
fn default_queue_max_frame() -> usize {
    40 * 1024
}
fn default_frame_interval() -> u64 {
    100
}
fn default_reject_delay() -> u64 {
    50
}
fn default_baseline_skip() -> u32 {
    2
}
fn default_degraded_skip() -> u32 {
    12
}
fn default_skip_escalation() -> u32 {
    1
}
fn default_max_frame() -> usize {
    25 * 1024
}
fn default_ceiling_divisor() -> usize {
    2
}
fn default_base_frame_delay() -> u64 {
    50
}
fn default_degraded_frame_delay() -> u64 {
    200
}
fn default_header_backoff() -> u64 {
    500
}
fn default_payload_backoff() -> u64 {
    1000
}
fn default_max_errors() -> u32 {
    5
}
fn default_cooldown() -> u64 {
    5000
}
fn default_beacon_enabled() -> bool {
    true
}
fn default_beacon_port() -> u16 {
    45678
}
fn default_beacon_interval() -> u64 {
    3000
}
fn default_beacon_prefix() -> String {
    "ESP32CAM".into()
}
fn default_log_level() -> String {
    "info".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.stream.mode, StreamMode::Direct);
        assert_eq!(config.adaptive.max_frame_bytes, 25 * 1024);
        assert_eq!(config.adaptive.max_errors, 5);
        assert_eq!(config.queue.capacity, 5);
        assert_eq!(config.beacon.port, 45678);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::parse(
            r#"
            [stream]
            mode = "queued"
            chunk_size = 4096

            [capture]
            source = "mjpeg"
            url = "http://camera.local/stream"

            [beacon]
            advertise_ip = "192.168.4.7"
            "#,
        )
        .unwrap();
        assert_eq!(config.stream.mode, StreamMode::Queued);
        assert_eq!(config.stream.chunk_size, 4096);
        assert_eq!(config.stream.chunk_delay_ms, 5);
        assert_eq!(config.capture.source, SourceKind::Mjpeg);
        assert_eq!(config.capture.pool_size, 2);
        assert_eq!(config.beacon.advertise_ip, Some(Ipv4Addr::new(192, 168, 4, 7)));
    }

    #[test]
    fn zero_capacity_rejected() {
        let err = Config::parse("[queue]\ncapacity = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("queue.capacity")));
    }

    #[test]
    fn tcp_keepalive_defaults_and_validation() {
        let config = Config::parse("[server]\nkeep_alive_retries = 9\n").unwrap();
        assert_eq!(config.server.keep_alive_idle_secs, 5);
        assert_eq!(config.server.keep_alive_interval_secs, 3);
        assert_eq!(config.server.keep_alive_retries, 9);

        let err = Config::parse("[server]\nkeep_alive_interval_secs = 0\n").unwrap_err();
        assert!(
            matches!(err, ConfigError::Invalid(msg) if msg.contains("server.keep_alive_interval_secs"))
        );
    }

    #[test]
    fn unknown_mode_is_parse_error() {
        let err = Config::parse("[stream]\nmode = \"websocket\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn sample_config_parses() {
        let config = Config::parse(include_str!("../../config.toml")).unwrap();
        assert_eq!(config.stream.boundary, "123456789000000000000987654321");
        assert_eq!(config.adaptive.degraded_skip, 12);
    }

    #[test]
    fn missing_file_reports_path() {
        let err = Config::load(Path::new("/nonexistent/camlink.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/camlink.toml"));
    }
}
