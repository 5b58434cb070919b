//! Pipeline runs against real short-lived processes
//!
//! `sh` stands in for the transcoders: one shell emits raw frames on stdout,
//! the other copies its stdin into a file.

#![cfg(unix)]

use std::path::PathBuf;
use std::time::Duration;

use framerelay_core::config::RelayConfig;
use framerelay_core::transform::InvertTransform;
use framerelay_core::{
    AttemptOutcome, ProcessLauncher, Supervisor, SupervisorContext, TranscoderRole,
    TranscoderSpec, shutdown_channel,
};
use tempfile::TempDir;

use crate::common::{init_test_tracing, small_frame_config};

fn shell(script: String) -> TranscoderSpec {
    TranscoderSpec {
        program: PathBuf::from("sh"),
        args: vec!["-c".to_string(), script],
    }
}

fn supervisor(config: RelayConfig) -> Supervisor<ProcessLauncher> {
    init_test_tracing();
    let (_trigger, listener) = shutdown_channel();
    Supervisor::new(
        config,
        ProcessLauncher::new(),
        Box::new(InvertTransform),
        SupervisorContext::new(listener),
    )
}

#[tokio::test]
async fn test_frames_flow_between_processes() {
    let dir = TempDir::new().unwrap();
    let sink = dir.path().join("received.raw");
    let mut config = small_frame_config(&dir, 6);
    // Ten 6-byte frames of zeros
    config.input = shell("head -c 60 /dev/zero".to_string());
    // Ignore the stop request so everything already piped is written out
    config.output = Some(shell(format!(
        "trap '' TERM; cat > '{}'",
        sink.display()
    )));
    config.supervisor.termination_grace = Duration::from_secs(5);
    let mut supervisor = supervisor(config);

    let report = tokio::time::timeout(Duration::from_secs(10), supervisor.run_attempt())
        .await
        .unwrap();

    assert_eq!(report.outcome, AttemptOutcome::InputClosed);
    assert_eq!(report.relay_stats.frames_out, 10);
    let received = std::fs::read(&sink).unwrap();
    assert_eq!(received, vec![0xff; 60]);
}

#[tokio::test]
async fn test_missing_binary_is_spawn_failure() {
    let dir = TempDir::new().unwrap();
    let mut config = small_frame_config(&dir, 6);
    config.input.program = PathBuf::from("/nonexistent/ffmpeg");
    let mut supervisor = supervisor(config);

    let report = supervisor.run_attempt().await;

    assert_eq!(
        report.outcome,
        AttemptOutcome::SpawnFailed(TranscoderRole::Input)
    );
    assert!(report.terminations.is_empty());
}

#[tokio::test]
async fn test_diagnostics_from_real_stderr_are_classified() {
    let dir = TempDir::new().unwrap();
    let mut config = small_frame_config(&dir, 6);
    config.output = None;
    config.input = shell(
        "for i in 1 2 3 4 5 6 7 8 9 10 11 12; do echo 'Error while decoding' >&2; done; sleep 30"
            .to_string(),
    );
    let mut supervisor = supervisor(config);

    let report = tokio::time::timeout(Duration::from_secs(10), supervisor.run_attempt())
        .await
        .unwrap();

    assert_eq!(
        report.outcome,
        AttemptOutcome::FatalDiagnostics(TranscoderRole::Input)
    );
    assert_eq!(report.terminations.len(), 1);
}
