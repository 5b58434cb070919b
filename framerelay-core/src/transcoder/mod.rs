//! External transcoder processes
//!
//! The transcoder binary is a black box reached through a small capability:
//! launch with an argument list, read its stdout and stderr, write its stdin,
//! and terminate it. `ProcessLauncher` backs the capability with real
//! subprocesses; tests swap in the in-memory `stub::StubLauncher`.

pub mod handle;
pub mod process;
#[cfg(any(test, feature = "test-utils"))]
pub mod stub;

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use handle::{
    BoxedReader, BoxedWriter, Liveness, ProcessControl, TerminationOutcome, TranscoderHandle,
};
pub use process::ProcessLauncher;

use crate::config::RelayConfig;

/// Errors that can occur while launching or controlling a transcoder
#[derive(Debug, thiserror::Error)]
pub enum TranscoderError {
    #[error("Failed to spawn {program}: {source}")]
    SpawnFailed {
        program: String,
        source: std::io::Error,
    },

    #[error("{role} transcoder has no {stream} stream")]
    MissingStream {
        role: TranscoderRole,
        stream: &'static str,
    },

    #[error("Failed to control {role} transcoder: {source}")]
    Control {
        role: TranscoderRole,
        source: std::io::Error,
    },
}

/// Position of a transcoder in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TranscoderRole {
    /// Decodes the network stream into raw frames on stdout
    Input,
    /// Encodes raw frames from stdin back onto the network
    Output,
    /// Synthesises a test stream; only stderr is read
    TestSource,
}

impl TranscoderRole {
    /// Whether the relay reads raw frames from this role's stdout
    pub fn pipes_stdout(&self) -> bool {
        matches!(self, TranscoderRole::Input)
    }

    /// Whether the relay writes raw frames into this role's stdin
    pub fn pipes_stdin(&self) -> bool {
        matches!(self, TranscoderRole::Output)
    }
}

impl std::fmt::Display for TranscoderRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TranscoderRole::Input => write!(f, "input"),
            TranscoderRole::Output => write!(f, "output"),
            TranscoderRole::TestSource => write!(f, "test-source"),
        }
    }
}

/// Everything a launcher needs to start one process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub role: TranscoderRole,
    pub program: PathBuf,
    pub args: Vec<String>,
}

/// Capability for starting transcoder processes.
#[async_trait]
pub trait TranscoderLauncher: Send + Sync {
    /// Starts a process and returns its handle with the stdio streams the
    /// role requires already attached.
    ///
    /// # Errors
    ///
    /// - `TranscoderError::SpawnFailed` - Binary missing or not executable
    async fn launch(&self, request: LaunchRequest) -> Result<TranscoderHandle, TranscoderError>;
}

/// Versioned command-line contract of one transcoder.
///
/// Arguments are templates; see [`ArgContext`] for the substituted tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscoderSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl TranscoderSpec {
    /// Receive-only contract: read the session descriptor, emit raw frames
    pub fn default_input() -> Self {
        Self {
            program: PathBuf::from("ffmpeg"),
            args: to_args(&[
                "-hide_banner",
                "-nostdin",
                "-protocol_whitelist",
                "file,rtp,udp",
                "-fflags",
                "nobuffer",
                "-flags",
                "low_delay",
                "-buffer_size",
                "{socket_buffer_size}",
                "-reorder_queue_size",
                "{reorder_queue_size}",
                "-max_delay",
                "{max_delay}",
                "-i",
                "{descriptor}",
                "-f",
                "rawvideo",
                "-pix_fmt",
                "{pixel_format}",
                "-s",
                "{video_size}",
                "pipe:1",
            ]),
        }
    }

    /// Send contract: raw frames on stdin, low-latency VP9 over RTP
    pub fn default_output() -> Self {
        Self {
            program: PathBuf::from("ffmpeg"),
            args: to_args(&[
                "-hide_banner",
                "-f",
                "rawvideo",
                "-pix_fmt",
                "{pixel_format}",
                "-s",
                "{video_size}",
                "-r",
                "{frame_rate}",
                "-i",
                "pipe:0",
                "-c:v",
                "libvpx-vp9",
                "-deadline",
                "realtime",
                "-cpu-used",
                "8",
                "-b:v",
                "2M",
                "-f",
                "rtp",
                "-payload_type",
                "{payload_type}",
                "rtp://127.0.0.1:8004",
            ]),
        }
    }

    /// Expands the argument templates into a launch request for `role`.
    pub fn to_request(&self, role: TranscoderRole, context: &ArgContext) -> LaunchRequest {
        LaunchRequest {
            role,
            program: self.program.clone(),
            args: self.args.iter().map(|arg| context.expand(arg)).collect(),
        }
    }
}

fn to_args(args: &[&str]) -> Vec<String> {
    args.iter().map(|arg| arg.to_string()).collect()
}

/// Values substituted into transcoder argument templates.
///
/// Tokens: `{descriptor}`, `{width}`, `{height}`, `{video_size}`,
/// `{frame_rate}`, `{pixel_format}`, `{payload_type}`,
/// `{socket_buffer_size}`, `{reorder_queue_size}`, `{max_delay}`.
#[derive(Debug, Clone)]
pub struct ArgContext {
    tokens: Vec<(&'static str, String)>,
}

impl ArgContext {
    pub fn from_config(config: &RelayConfig) -> Self {
        let frame = &config.frame;
        let tokens = vec![
            (
                "{descriptor}",
                config.session.descriptor_path.display().to_string(),
            ),
            ("{width}", frame.width.to_string()),
            ("{height}", frame.height.to_string()),
            ("{video_size}", frame.video_size()),
            ("{frame_rate}", frame.frame_rate.to_string()),
            ("{pixel_format}", frame.pixel_format.clone()),
            ("{payload_type}", config.session.payload_type.to_string()),
            (
                "{socket_buffer_size}",
                config.network.socket_buffer_size.to_string(),
            ),
            (
                "{reorder_queue_size}",
                config.network.reorder_queue_size.to_string(),
            ),
            ("{max_delay}", config.network.max_delay_us.to_string()),
        ];
        Self { tokens }
    }

    /// Replaces every known token in `template` in a single left-to-right
    /// pass; substituted values are never expanded again. Unknown braces
    /// are kept.
    pub fn expand(&self, template: &str) -> String {
        let mut expanded = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(open) = rest.find('{') {
            expanded.push_str(&rest[..open]);
            rest = &rest[open..];
            match self
                .tokens
                .iter()
                .find(|(token, _)| rest.starts_with(token))
            {
                Some((token, value)) => {
                    expanded.push_str(value);
                    rest = &rest[token.len()..];
                }
                None => {
                    expanded.push('{');
                    rest = &rest[1..];
                }
            }
        }
        expanded.push_str(rest);
        expanded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_contract_expansion() {
        let mut config = RelayConfig::default();
        config.session.descriptor_path = PathBuf::from("/run/relay/session.sdp");
        config.network.socket_buffer_size = 1024;
        let context = ArgContext::from_config(&config);

        let request = config.input.to_request(TranscoderRole::Input, &context);

        assert_eq!(request.role, TranscoderRole::Input);
        assert_eq!(request.program, PathBuf::from("ffmpeg"));
        let descriptor_pos = request.args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(request.args[descriptor_pos + 1], "/run/relay/session.sdp");
        assert!(request.args.contains(&"1280x720".to_string()));
        assert!(request.args.contains(&"1024".to_string()));
        assert_eq!(request.args.last().unwrap(), "pipe:1");
        assert!(!request.args.iter().any(|a| a.contains('{')));
    }

    #[test]
    fn test_output_contract_expansion() {
        let config = RelayConfig::default();
        let context = ArgContext::from_config(&config);
        let spec = TranscoderSpec::default_output();

        let request = spec.to_request(TranscoderRole::Output, &context);

        assert!(request.args.contains(&"pipe:0".to_string()));
        assert!(request.args.contains(&"30".to_string()));
        assert!(request.args.contains(&"96".to_string()));
        assert!(!request.args.iter().any(|a| a.contains('{')));
    }

    #[test]
    fn test_expand_keeps_unknown_tokens() {
        let context = ArgContext::from_config(&RelayConfig::default());
        assert_eq!(
            context.expand("scale={width}:{unknown}"),
            "scale=1280:{unknown}"
        );
        assert_eq!(context.expand("-y"), "-y");
    }

    #[test]
    fn test_substituted_values_are_not_expanded_again() {
        let mut config = RelayConfig::default();
        config.session.descriptor_path = PathBuf::from("/srv/{width}/session.sdp");
        let context = ArgContext::from_config(&config);

        assert_eq!(context.expand("{descriptor}"), "/srv/{width}/session.sdp");
        assert_eq!(
            context.expand("{{video_size}}-{height}"),
            "{1280x720}-720"
        );

        let request = config.input.to_request(TranscoderRole::Input, &context);
        let input = request.args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(request.args[input + 1], "/srv/{width}/session.sdp");
    }

    #[test]
    fn test_role_stdio_requirements() {
        assert!(TranscoderRole::Input.pipes_stdout());
        assert!(!TranscoderRole::Input.pipes_stdin());
        assert!(TranscoderRole::Output.pipes_stdin());
        assert!(!TranscoderRole::TestSource.pipes_stdout());
        assert_eq!(TranscoderRole::TestSource.to_string(), "test-source");
    }
}
