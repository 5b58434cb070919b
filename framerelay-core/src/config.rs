//! Centralized configuration for the relay pipeline.
//!
//! All tunable parameters are defined here so the transcoder argument
//! contract, frame geometry and supervision timings can change per deployment
//! without touching relay logic.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::relay::MAX_FRAME_SIZE;
use crate::session::Direction;
use crate::transcoder::TranscoderSpec;

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Central configuration for all pipeline components.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub frame: FrameFormat,
    pub session: SessionConfig,
    pub input: TranscoderSpec,
    /// Output transcoder; `None` runs the relay in input-only mode and
    /// discards transformed frames.
    pub output: Option<TranscoderSpec>,
    pub supervisor: SupervisorConfig,
    pub network: NetworkTuning,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            frame: FrameFormat::default(),
            session: SessionConfig::default(),
            input: TranscoderSpec::default_input(),
            output: Some(TranscoderSpec::default_output()),
            supervisor: SupervisorConfig::default(),
            network: NetworkTuning::default(),
        }
    }
}

/// Geometry and cadence of the raw frames moved by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameFormat {
    pub width: u32,
    pub height: u32,
    pub bytes_per_pixel: u32,
    /// Frames per second
    pub frame_rate: u32,
    /// Pixel format name passed to the transcoders
    pub pixel_format: String,
}

impl Default for FrameFormat {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            bytes_per_pixel: 3,
            frame_rate: 30,
            pixel_format: "bgr24".to_string(),
        }
    }
}

impl FrameFormat {
    /// Size in bytes of one raw frame, saturating at `usize::MAX`.
    pub fn frame_size(&self) -> usize {
        self.checked_frame_size().unwrap_or(usize::MAX)
    }

    /// Size in bytes of one raw frame, `None` on overflow.
    pub fn checked_frame_size(&self) -> Option<usize> {
        (self.width as usize)
            .checked_mul(self.height as usize)?
            .checked_mul(self.bytes_per_pixel as usize)
    }

    /// Time budget of a single frame at the configured rate.
    pub fn frame_interval(&self) -> Duration {
        if self.frame_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs(1) / self.frame_rate
    }

    /// Frame dimensions formatted as `WIDTHxHEIGHT`.
    pub fn video_size(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

/// Media session parameters written into the session descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub session_name: String,
    /// Address the RTP stream arrives on
    pub address: String,
    pub port: u16,
    pub payload_type: u8,
    pub codec_name: String,
    pub clock_rate: u32,
    pub direction: Direction,
    /// Where the descriptor is written before every input spawn
    pub descriptor_path: PathBuf,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_name: "framerelay".to_string(),
            address: "127.0.0.1".to_string(),
            port: 6000,
            payload_type: 96,
            codec_name: "VP9".to_string(),
            clock_rate: 90_000,
            direction: Direction::ReceiveOnly,
            descriptor_path: std::env::temp_dir().join("framerelay").join("session.sdp"),
        }
    }
}

/// Restart and shutdown timings for the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Delay between a finished attempt and the next one
    #[serde(with = "duration_ms")]
    pub restart_delay: Duration,
    /// How long a transcoder gets to exit after a graceful stop request
    #[serde(with = "duration_ms")]
    pub termination_grace: Duration,
    /// Consecutive error lines tolerated before a restart is requested
    pub error_line_threshold: u32,
    /// Upper bound on joining diagnostic readers during drain
    #[serde(with = "duration_ms")]
    pub classifier_join_timeout: Duration,
    /// Minimum spacing between progress records from one transcoder
    #[serde(with = "duration_ms")]
    pub progress_log_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            restart_delay: Duration::from_secs(2),
            termination_grace: Duration::from_secs(3),
            error_line_threshold: 10,
            classifier_join_timeout: Duration::from_secs(2),
            progress_log_interval: Duration::from_secs(5),
        }
    }
}

/// OS-level tuning knobs forwarded to the input transcoder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkTuning {
    /// UDP socket receive buffer in bytes
    pub socket_buffer_size: usize,
    /// RTP packets held for reordering
    pub reorder_queue_size: usize,
    /// Maximum demux delay in microseconds
    pub max_delay_us: u64,
}

impl Default for NetworkTuning {
    fn default() -> Self {
        Self {
            socket_buffer_size: 4 * 1024 * 1024, // 4 MiB
            reorder_queue_size: 64,
            max_delay_us: 500_000,
        }
    }
}

impl RelayConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Variables are read once; values that do not parse are ignored and the
    /// default is kept.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Loads a configuration document from a JSON file.
    ///
    /// # Errors
    ///
    /// - `ConfigError::Read` - File cannot be read
    /// - `ConfigError::Parse` - File is not a valid configuration document
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Applies `FRAMERELAY_*` environment overrides on top of this config.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    /// Applies `FRAMERELAY_*` overrides resolved through `lookup`.
    ///
    /// Unparsable values are logged and ignored; a blank descriptor path
    /// keeps the configured one.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(size) = parsed_override::<usize>(&lookup, "FRAMERELAY_SOCKET_BUFFER_SIZE") {
            self.network.socket_buffer_size = size;
        }

        if let Some(size) = parsed_override::<usize>(&lookup, "FRAMERELAY_REORDER_QUEUE_SIZE") {
            self.network.reorder_queue_size = size;
        }

        if let Some(delay) = parsed_override::<u64>(&lookup, "FRAMERELAY_MAX_DELAY_US") {
            self.network.max_delay_us = delay;
        }

        if let Some(millis) = parsed_override::<u64>(&lookup, "FRAMERELAY_RESTART_DELAY_MS") {
            self.supervisor.restart_delay = Duration::from_millis(millis);
        }

        if let Some(threshold) = parsed_override::<u32>(&lookup, "FRAMERELAY_ERROR_THRESHOLD") {
            self.supervisor.error_line_threshold = threshold;
        }

        if let Some(path) = lookup("FRAMERELAY_DESCRIPTOR_PATH")
            && !path.trim().is_empty()
        {
            self.session.descriptor_path = PathBuf::from(path);
        }
    }

    /// Rejects values that would make the pipeline unable to start.
    ///
    /// # Errors
    ///
    /// - `ConfigError::Invalid` - A field holds an unusable value
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.frame.width == 0 || self.frame.height == 0 || self.frame.bytes_per_pixel == 0 {
            return Err(ConfigError::Invalid {
                field: "frame",
                reason: "width, height and bytes_per_pixel must be greater than 0".to_string(),
            });
        }

        if self
            .frame
            .checked_frame_size()
            .is_none_or(|size| size > MAX_FRAME_SIZE)
        {
            return Err(ConfigError::Invalid {
                field: "frame",
                reason: format!(
                    "{}x{} at {} bytes per pixel exceeds {} bytes per frame",
                    self.frame.width, self.frame.height, self.frame.bytes_per_pixel, MAX_FRAME_SIZE
                ),
            });
        }

        if self.frame.frame_rate == 0 {
            return Err(ConfigError::Invalid {
                field: "frame.frame_rate",
                reason: "must be greater than 0".to_string(),
            });
        }

        if self.session.port == 0 {
            return Err(ConfigError::Invalid {
                field: "session.port",
                reason: "must be greater than 0".to_string(),
            });
        }

        if self.session.payload_type > 127 {
            return Err(ConfigError::Invalid {
                field: "session.payload_type",
                reason: format!("{} is outside 0..=127", self.session.payload_type),
            });
        }

        if self.session.codec_name.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "session.codec_name",
                reason: "must not be empty".to_string(),
            });
        }

        for (field, value) in [
            ("session.session_name", &self.session.session_name),
            ("session.address", &self.session.address),
            ("session.codec_name", &self.session.codec_name),
        ] {
            if value.contains(['\r', '\n']) {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must not contain line breaks".to_string(),
                });
            }
        }

        if self.supervisor.error_line_threshold == 0 {
            return Err(ConfigError::Invalid {
                field: "supervisor.error_line_threshold",
                reason: "must be greater than 0".to_string(),
            });
        }

        if self.input.program.as_os_str().is_empty() {
            return Err(ConfigError::Invalid {
                field: "input.program",
                reason: "must not be empty".to_string(),
            });
        }

        Ok(())
    }
}

fn parsed_override<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Option<T> {
    let raw = lookup(name)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(variable = name, value = %raw, "Ignoring unparsable override");
            None
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = RelayConfig::default();

        assert_eq!(config.frame.frame_size(), 1280 * 720 * 3);
        assert_eq!(config.frame.video_size(), "1280x720");
        assert_eq!(config.session.port, 6000);
        assert_eq!(config.session.payload_type, 96);
        assert_eq!(config.session.direction, Direction::ReceiveOnly);
        assert_eq!(config.supervisor.error_line_threshold, 10);
        assert_eq!(config.supervisor.restart_delay, Duration::from_secs(2));
        assert!(config.output.is_some());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_frame_interval() {
        let frame = FrameFormat {
            frame_rate: 25,
            ..Default::default()
        };
        assert_eq!(frame.frame_interval(), Duration::from_millis(40));

        let stalled = FrameFormat {
            frame_rate: 0,
            ..Default::default()
        };
        assert_eq!(stalled.frame_interval(), Duration::ZERO);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = RelayConfig::default();
        config.session.payload_type = 200;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "session.payload_type",
                ..
            })
        ));

        let mut config = RelayConfig::default();
        config.session.codec_name = "VP9\r\nm=audio".to_string();
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.frame.width = 0;
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.supervisor.error_line_threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_oversized_geometry_rejected() {
        let mut config = RelayConfig::default();
        config.frame.width = u32::MAX;
        config.frame.height = u32::MAX;
        config.frame.bytes_per_pixel = u32::MAX;
        assert_eq!(config.frame.checked_frame_size(), None);
        assert_eq!(config.frame.frame_size(), usize::MAX);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "frame", .. })
        ));

        let mut config = RelayConfig::default();
        config.frame.width = 100_000;
        config.frame.height = 100_000;
        assert!(config.validate().is_err());

        // 8K BGRA still fits
        let mut config = RelayConfig::default();
        config.frame.width = 7680;
        config.frame.height = 4320;
        config.frame.bytes_per_pixel = 4;
        assert!(config.validate().is_ok());
    }

    fn overrides(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_every_override_applies() {
        let mut config = RelayConfig::default();

        config.apply_overrides_from(overrides(&[
            ("FRAMERELAY_SOCKET_BUFFER_SIZE", "1048576"),
            ("FRAMERELAY_REORDER_QUEUE_SIZE", " 128 "),
            ("FRAMERELAY_MAX_DELAY_US", "250000"),
            ("FRAMERELAY_RESTART_DELAY_MS", "750"),
            ("FRAMERELAY_ERROR_THRESHOLD", "25"),
            ("FRAMERELAY_DESCRIPTOR_PATH", "/run/framerelay/in.sdp"),
        ]));

        assert_eq!(config.network.socket_buffer_size, 1_048_576);
        assert_eq!(config.network.reorder_queue_size, 128);
        assert_eq!(config.network.max_delay_us, 250_000);
        assert_eq!(config.supervisor.restart_delay, Duration::from_millis(750));
        assert_eq!(config.supervisor.error_line_threshold, 25);
        assert_eq!(
            config.session.descriptor_path,
            PathBuf::from("/run/framerelay/in.sdp")
        );
    }

    #[test]
    fn test_unusable_overrides_keep_defaults() {
        let defaults = RelayConfig::default();
        let mut config = RelayConfig::default();

        config.apply_overrides_from(overrides(&[
            ("FRAMERELAY_ERROR_THRESHOLD", "abc"),
            ("FRAMERELAY_SOCKET_BUFFER_SIZE", "-1"),
            ("FRAMERELAY_RESTART_DELAY_MS", "2s"),
            ("FRAMERELAY_DESCRIPTOR_PATH", "   "),
        ]));

        assert_eq!(config.supervisor.error_line_threshold, 10);
        assert_eq!(
            config.network.socket_buffer_size,
            defaults.network.socket_buffer_size
        );
        assert_eq!(config.supervisor.restart_delay, defaults.supervisor.restart_delay);
        assert_eq!(
            config.session.descriptor_path,
            defaults.session.descriptor_path
        );
    }

    #[test]
    fn test_json_round_trip_uses_milliseconds() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("relay.json");
        std::fs::write(
            &path,
            r#"{
                "frame": { "width": 640, "height": 480 },
                "supervisor": { "restart_delay": 250 },
                "output": null
            }"#,
        )
        .unwrap();

        let config = RelayConfig::from_json_file(&path).unwrap();
        assert_eq!(config.frame.width, 640);
        assert_eq!(config.frame.bytes_per_pixel, 3);
        assert_eq!(config.supervisor.restart_delay, Duration::from_millis(250));
        assert!(config.output.is_none());
        assert_eq!(config.session.port, 6000);
    }

    #[test]
    fn test_missing_config_file() {
        let result = RelayConfig::from_json_file(Path::new("/nonexistent/relay.json"));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }
}
