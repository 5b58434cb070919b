//! Synthetic test stream source
//!
//! Drives an external transcoder that renders a test pattern and sends it
//! over RTP, so a pipeline can be exercised without a camera or a remote
//! sender.

use std::path::PathBuf;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::classifier::{ClassifierReport, MonitorSettings, spawn_diagnostics_monitor};
use crate::config::{RelayConfig, SupervisorConfig};
use crate::supervisor::ShutdownListener;
use crate::transcoder::{LaunchRequest, TranscoderError, TranscoderLauncher, TranscoderRole};

/// RTP packet size that fits a typical MTU with headroom for tunnels
const DEFAULT_PACKET_SIZE: u32 = 1200;

/// Parameters of the synthesised stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestPatternSource {
    pub program: PathBuf,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    /// Encoder name understood by the transcoder, e.g. `libvpx-vp9`
    pub codec: String,
    pub bitrate: String,
    pub payload_type: u8,
    pub host: String,
    pub port: u16,
    pub packet_size: u32,
}

impl Default for TestPatternSource {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ffmpeg"),
            width: 640,
            height: 480,
            frame_rate: 30,
            codec: "libvpx-vp9".to_string(),
            bitrate: "2M".to_string(),
            payload_type: 96,
            host: "127.0.0.1".to_string(),
            port: 6000,
            packet_size: DEFAULT_PACKET_SIZE,
        }
    }
}

/// Why a test stream stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestStreamEnd {
    Shutdown,
    Exited(Option<i32>),
    FatalDiagnostics,
}

impl TestPatternSource {
    /// Targets the session a relay with `config` listens on.
    pub fn for_session(config: &RelayConfig) -> Self {
        Self {
            width: config.frame.width,
            height: config.frame.height,
            frame_rate: config.frame.frame_rate,
            payload_type: config.session.payload_type,
            host: config.session.address.clone(),
            port: config.session.port,
            ..Self::default()
        }
    }

    /// Destination URL including the packet size option
    pub fn destination(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        format!("rtp://{host}:{}?pkt_size={}", self.port, self.packet_size)
    }

    pub fn args(&self) -> Vec<String> {
        vec![
            "-hide_banner".to_string(),
            "-nostdin".to_string(),
            "-re".to_string(),
            "-f".to_string(),
            "lavfi".to_string(),
            "-i".to_string(),
            format!(
                "testsrc=size={}x{}:rate={}",
                self.width, self.height, self.frame_rate
            ),
            "-c:v".to_string(),
            self.codec.clone(),
            "-b:v".to_string(),
            self.bitrate.clone(),
            "-deadline".to_string(),
            "realtime".to_string(),
            "-cpu-used".to_string(),
            "4".to_string(),
            "-f".to_string(),
            "rtp".to_string(),
            "-payload_type".to_string(),
            self.payload_type.to_string(),
            self.destination(),
        ]
    }

    pub fn to_request(&self) -> LaunchRequest {
        LaunchRequest {
            role: TranscoderRole::TestSource,
            program: self.program.clone(),
            args: self.args(),
        }
    }

    /// Streams until shutdown, until the transcoder exits, or until its
    /// diagnostics turn fatal; the transcoder is stopped in every case.
    ///
    /// # Errors
    ///
    /// - `TranscoderError::SpawnFailed` - Transcoder could not be started
    /// - `TranscoderError::Control` - Transcoder could not be stopped
    pub async fn run<L: TranscoderLauncher + ?Sized>(
        &self,
        launcher: &L,
        mut shutdown: ShutdownListener,
        supervision: &SupervisorConfig,
    ) -> Result<(TestStreamEnd, Option<ClassifierReport>), TranscoderError> {
        let mut handle = launcher.launch(self.to_request()).await?;
        info!(
            destination = %self.destination(),
            codec = %self.codec,
            "Test stream started"
        );

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (fatal_tx, mut fatal_rx) = mpsc::channel(1);
        let monitor = handle.take_stderr().map(|stderr| {
            spawn_diagnostics_monitor(
                TranscoderRole::TestSource,
                stderr,
                MonitorSettings {
                    error_line_threshold: supervision.error_line_threshold,
                    progress_log_interval: supervision.progress_log_interval,
                },
                fatal_tx,
                cancel_rx,
            )
        });

        let end = tokio::select! {
            _ = shutdown.wait() => TestStreamEnd::Shutdown,
            Some(_) = fatal_rx.recv() => TestStreamEnd::FatalDiagnostics,
            code = handle.wait() => TestStreamEnd::Exited(code?),
        };
        info!(?end, "Test stream stopping");

        let termination = handle.terminate(supervision.termination_grace).await?;
        debug!(?termination, "Test stream transcoder stopped");
        cancel_tx.send_replace(true);

        let report = match monitor {
            Some(mut monitor) => {
                match tokio::time::timeout(supervision.classifier_join_timeout, &mut monitor).await
                {
                    Ok(Ok(report)) => Some(report),
                    Ok(Err(e)) => {
                        warn!("Diagnostics reader failed: {}", e);
                        None
                    }
                    Err(_) => {
                        monitor.abort();
                        None
                    }
                }
            }
            None => None,
        };

        Ok((end, report))
    }
}
