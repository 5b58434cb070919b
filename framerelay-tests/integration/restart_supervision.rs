//! Restart and shutdown behaviour of the supervision loop

use std::time::{Duration, Instant};

use bytes::Bytes;
use framerelay_core::transcoder::stub::{StubBehavior, StubLauncher};
use framerelay_core::transform::IdentityTransform;
use framerelay_core::{AttemptOutcome, PipelineState, StateTransition, TranscoderRole};
use tempfile::TempDir;
use tokio::sync::mpsc;

use crate::common::{Harness, harness, small_frame_config};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Waits for the next transition into `state`, returning it with its arrival time.
async fn next_entry(
    transitions: &mut mpsc::UnboundedReceiver<StateTransition>,
    state: PipelineState,
) -> (StateTransition, Instant) {
    tokio::time::timeout(TEST_TIMEOUT, async {
        loop {
            let transition = transitions
                .recv()
                .await
                .expect("supervisor dropped transition log");
            if transition.to == state {
                return (transition, Instant::now());
            }
        }
    })
    .await
    .expect("state not reached in time")
}

#[tokio::test]
async fn test_destination_closure_restarts_after_backoff() {
    let dir = TempDir::new().unwrap();
    let config = small_frame_config(&dir, 10);
    let restart_delay = config.supervisor.restart_delay;
    let launcher = StubLauncher::new()
        .with_input(StubBehavior {
            // Exceeds the pipe buffers so writes keep happening
            stdout: Bytes::from(vec![1u8; 10 * 20_000]),
            hold_stdout_open: true,
            ..Default::default()
        })
        .with_output(StubBehavior {
            accept_bytes: Some(50),
            ..Default::default()
        });
    let Harness {
        mut supervisor,
        trigger,
        mut transitions,
    } = harness(config, launcher.clone(), Box::new(IdentityTransform));

    let task = tokio::spawn(async move { supervisor.run().await });

    let (first, _) = next_entry(&mut transitions, PipelineState::Running).await;
    let (draining, drained_at) = next_entry(&mut transitions, PipelineState::Draining).await;
    assert_eq!(draining.from, PipelineState::Running);
    assert_eq!(draining.attempt, first.attempt);

    let (idle, _) = next_entry(&mut transitions, PipelineState::Idle).await;
    assert_eq!(idle.attempt, first.attempt);

    let (second, negotiated_at) =
        next_entry(&mut transitions, PipelineState::Negotiating).await;
    assert_eq!(second.from, PipelineState::Idle);
    assert_ne!(second.attempt, first.attempt);
    let gap = negotiated_at.duration_since(drained_at);
    assert!(gap >= restart_delay / 2, "restarted after only {gap:?}");
    assert!(gap < restart_delay + Duration::from_secs(3), "restart took {gap:?}");

    trigger.trigger();
    let attempts = tokio::time::timeout(TEST_TIMEOUT, task)
        .await
        .unwrap()
        .unwrap();
    assert!(attempts >= 2);

    // First output only ever saw the bytes it accepted
    assert_eq!(launcher.captured_stdin(TranscoderRole::Output, 0).len(), 50);
    assert!(launcher.has_exited(TranscoderRole::Input, 0));
}

#[tokio::test]
async fn test_spawn_failures_retry_indefinitely() {
    let dir = TempDir::new().unwrap();
    let mut config = small_frame_config(&dir, 10);
    config.supervisor.restart_delay = Duration::from_millis(10);
    let launcher = StubLauncher::new().with_input(StubBehavior {
        fail_spawn: true,
        ..Default::default()
    });
    let Harness {
        mut supervisor,
        trigger,
        mut transitions,
    } = harness(config, launcher.clone(), Box::new(IdentityTransform));

    let task = tokio::spawn(async move { supervisor.run().await });

    for _ in 0..3 {
        let (transition, _) = next_entry(&mut transitions, PipelineState::Idle).await;
        // Failed negotiation drains without ever running
        assert_ne!(transition.from, PipelineState::Running);
    }
    trigger.trigger();

    let attempts = tokio::time::timeout(TEST_TIMEOUT, task)
        .await
        .unwrap()
        .unwrap();
    assert!(attempts >= 3);
    // An attempt that starts as shutdown lands skips its launch
    let launches = launcher.launch_count(TranscoderRole::Input) as u64;
    assert!(launches == attempts || launches + 1 == attempts);
    assert_eq!(launcher.launch_count(TranscoderRole::Output), 0);
}

#[tokio::test]
async fn test_fatal_output_diagnostics_restart_pipeline() {
    let dir = TempDir::new().unwrap();
    let config = small_frame_config(&dir, 10);
    let mut stderr_lines = vec!["Input #0, rawvideo, from 'pipe:0':".to_string()];
    stderr_lines.extend(
        std::iter::repeat_n("[libvpx-vp9 @ 0x5581] Failed to encode frame".to_string(), 11),
    );
    let launcher = StubLauncher::new()
        .with_input(StubBehavior {
            hold_stdout_open: true,
            ..Default::default()
        })
        .with_output(StubBehavior {
            stderr_lines,
            ..Default::default()
        })
        .with_output(StubBehavior::default());
    let mut h = harness(config, launcher.clone(), Box::new(IdentityTransform));

    let first = tokio::time::timeout(TEST_TIMEOUT, h.supervisor.run_attempt())
        .await
        .unwrap();
    assert_eq!(
        first.outcome,
        AttemptOutcome::FatalDiagnostics(TranscoderRole::Output)
    );
    let output_report = first
        .classifiers
        .iter()
        .find(|report| report.role == Some(TranscoderRole::Output))
        .unwrap();
    assert_eq!(output_report.longest_error_run, 11);

    // Second output behaves; the run lasts until shutdown
    let trigger = h.trigger.clone();
    let stopper = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.trigger();
    });
    let second = tokio::time::timeout(TEST_TIMEOUT, h.supervisor.run_attempt())
        .await
        .unwrap();
    stopper.await.unwrap();

    assert_eq!(second.outcome, AttemptOutcome::Shutdown);
    assert_eq!(launcher.launch_count(TranscoderRole::Output), 2);
    assert!(launcher.has_exited(TranscoderRole::Output, 1));
}

#[tokio::test]
async fn test_shutdown_drains_running_pipeline() {
    let dir = TempDir::new().unwrap();
    let launcher = StubLauncher::new()
        .with_input(StubBehavior {
            hold_stdout_open: true,
            stderr_lines: vec!["Stream #0:0: Video: vp9".to_string()],
            ..Default::default()
        })
        .with_output(StubBehavior {
            // Stop requests are ignored; only the kill after the grace period works
            ignore_stop: true,
            ..Default::default()
        });
    let Harness {
        mut supervisor,
        trigger,
        mut transitions,
    } = harness(
        small_frame_config(&dir, 10),
        launcher.clone(),
        Box::new(IdentityTransform),
    );
    let mut state = supervisor.subscribe_state();

    let task = tokio::spawn(async move { supervisor.run().await });

    next_entry(&mut transitions, PipelineState::Running).await;
    assert_eq!(*state.borrow_and_update(), PipelineState::Running);
    trigger.trigger();

    let attempts = tokio::time::timeout(TEST_TIMEOUT, task)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(attempts, 1);
    assert_eq!(*state.borrow(), PipelineState::Idle);
    assert!(launcher.has_exited(TranscoderRole::Input, 0));
    assert!(launcher.has_exited(TranscoderRole::Output, 0));

    let (last, _) = next_entry(&mut transitions, PipelineState::Idle).await;
    assert_eq!(last.from, PipelineState::Draining);
    assert!(transitions.try_recv().is_err());
}
