//! Shared fixtures for integration tests

use std::sync::Once;
use std::time::Duration;

use bytes::Bytes;
use framerelay_core::config::RelayConfig;
use framerelay_core::transcoder::stub::StubLauncher;
use framerelay_core::{
    FrameTransform, ShutdownTrigger, StateTransition, Supervisor, SupervisorContext,
    shutdown_channel,
};
use tempfile::TempDir;
use tokio::sync::mpsc;

static TRACING: Once = Once::new();

/// Routes pipeline logs through the test harness; `RUST_LOG` selects the level.
pub fn init_test_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Relay configuration with `frame_size`-byte frames (one byte per pixel)
/// and short supervision timings.
pub fn small_frame_config(dir: &TempDir, frame_size: u32) -> RelayConfig {
    let mut config = RelayConfig::default();
    config.frame.width = frame_size;
    config.frame.height = 1;
    config.frame.bytes_per_pixel = 1;
    config.frame.pixel_format = "gray".to_string();
    config.session.descriptor_path = dir.path().join("session.sdp");
    config.supervisor.restart_delay = Duration::from_millis(100);
    config.supervisor.termination_grace = Duration::from_millis(200);
    config.supervisor.classifier_join_timeout = Duration::from_millis(500);
    config
}

/// `count` frames of `size` bytes with a running byte pattern
pub fn patterned_frames(count: usize, size: usize) -> Bytes {
    Bytes::from(
        (0..count * size)
            .map(|i| (i % 251) as u8)
            .collect::<Vec<u8>>(),
    )
}

pub struct Harness {
    pub supervisor: Supervisor<StubLauncher>,
    pub trigger: ShutdownTrigger,
    pub transitions: mpsc::UnboundedReceiver<StateTransition>,
}

pub fn harness(
    config: RelayConfig,
    launcher: StubLauncher,
    transform: Box<dyn FrameTransform>,
) -> Harness {
    init_test_tracing();
    let (trigger, listener) = shutdown_channel();
    let (tx, transitions) = mpsc::unbounded_channel();
    let supervisor = Supervisor::new(
        config,
        launcher,
        transform,
        SupervisorContext::new(listener),
    )
    .with_transition_log(tx);

    Harness {
        supervisor,
        trigger,
        transitions,
    }
}
