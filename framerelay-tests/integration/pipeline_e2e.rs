//! End-to-end pipeline runs against stub transcoders

use bytes::Bytes;
use framerelay_core::transcoder::stub::{StubBehavior, StubLauncher};
use framerelay_core::transform::{GrayscaleTransform, IdentityTransform};
use framerelay_core::{AttemptOutcome, PipelineState, TranscoderRole};
use tempfile::TempDir;

use crate::common::{harness, patterned_frames, small_frame_config};

#[tokio::test]
async fn test_hundred_frames_arrive_in_order() {
    let dir = TempDir::new().unwrap();
    let payload = patterned_frames(100, 10);
    let launcher = StubLauncher::new()
        .with_input(StubBehavior {
            stdout: payload.clone(),
            // Ragged chunks so frames straddle reads
            stdout_chunk: 7,
            ..Default::default()
        })
        .with_output(StubBehavior::default());
    let mut h = harness(
        small_frame_config(&dir, 10),
        launcher.clone(),
        Box::new(IdentityTransform),
    );

    let report = h.supervisor.run_attempt().await;

    assert_eq!(report.outcome, AttemptOutcome::InputClosed);
    assert_eq!(report.relay_stats.frames_in, 100);
    assert_eq!(report.relay_stats.frames_out, 100);
    assert_eq!(report.relay_stats.bytes_out, 1000);

    launcher
        .wait_for_stdin_closed(TranscoderRole::Output, 0)
        .await;
    let received = launcher.captured_stdin(TranscoderRole::Output, 0);
    assert_eq!(received.len(), 1000);
    assert_eq!(received, payload.to_vec());
}

#[tokio::test]
async fn test_grayscale_pipeline_converts_every_frame() {
    let dir = TempDir::new().unwrap();
    let mut config = small_frame_config(&dir, 6);
    // 2x1 BGR24 frames
    config.frame.width = 2;
    config.frame.bytes_per_pixel = 3;
    config.frame.pixel_format = "bgr24".to_string();
    let blue_red: [u8; 6] = [255, 0, 0, 0, 0, 255];
    let payload: Vec<u8> = blue_red.iter().copied().cycle().take(6 * 4).collect();
    let launcher = StubLauncher::new()
        .with_input(StubBehavior {
            stdout: Bytes::from(payload),
            ..Default::default()
        })
        .with_output(StubBehavior::default());
    let mut h = harness(config, launcher.clone(), Box::new(GrayscaleTransform));

    let report = h.supervisor.run_attempt().await;

    assert_eq!(report.outcome, AttemptOutcome::InputClosed);
    launcher
        .wait_for_stdin_closed(TranscoderRole::Output, 0)
        .await;
    let received = launcher.captured_stdin(TranscoderRole::Output, 0);
    let expected: Vec<u8> = [29, 29, 29, 76, 76, 76]
        .iter()
        .copied()
        .cycle()
        .take(6 * 4)
        .collect();
    assert_eq!(received, expected);
}

#[tokio::test]
async fn test_descriptor_written_before_input_spawn() {
    let dir = TempDir::new().unwrap();
    let mut config = small_frame_config(&dir, 10);
    config.session.port = 6002;
    config.session.payload_type = 45;
    config.session.codec_name = "AV1".to_string();
    let descriptor_path = config.session.descriptor_path.clone();
    let launcher = StubLauncher::new()
        .with_input(StubBehavior::default())
        .with_output(StubBehavior::default());
    let mut h = harness(config, launcher.clone(), Box::new(IdentityTransform));

    h.supervisor.run_attempt().await;

    let sdp = std::fs::read_to_string(&descriptor_path).unwrap();
    assert!(sdp.contains("m=video 6002 RTP/AVP 45\r\n"));
    assert!(sdp.contains("a=rtpmap:45 AV1/90000\r\n"));
    assert!(sdp.contains("a=recvonly\r\n"));

    let input = &launcher.launches()[0];
    assert_eq!(input.role, TranscoderRole::Input);
    assert!(
        input
            .args
            .contains(&descriptor_path.display().to_string())
    );
}

#[tokio::test]
async fn test_transform_failures_do_not_stop_the_run() {
    use framerelay_core::{FrameTransform, TransformError};

    /// Rejects every third frame.
    struct FlakyTransform {
        seen: usize,
    }

    impl FrameTransform for FlakyTransform {
        fn name(&self) -> &'static str {
            "flaky"
        }

        fn apply(&mut self, frame: &[u8]) -> Result<Vec<u8>, TransformError> {
            self.seen += 1;
            if self.seen % 3 == 0 {
                return Err(TransformError::Failed {
                    reason: format!("frame {} rejected", self.seen),
                });
            }
            Ok(frame.to_vec())
        }
    }

    let dir = TempDir::new().unwrap();
    let launcher = StubLauncher::new()
        .with_input(StubBehavior {
            stdout: patterned_frames(9, 10),
            ..Default::default()
        })
        .with_output(StubBehavior::default());
    let mut h = harness(
        small_frame_config(&dir, 10),
        launcher.clone(),
        Box::new(FlakyTransform { seen: 0 }),
    );

    let report = h.supervisor.run_attempt().await;

    assert_eq!(report.outcome, AttemptOutcome::InputClosed);
    assert_eq!(report.relay_stats.frames_dropped, 3);
    assert_eq!(report.relay_stats.frames_out, 6);
    launcher
        .wait_for_stdin_closed(TranscoderRole::Output, 0)
        .await;
    assert_eq!(launcher.captured_stdin(TranscoderRole::Output, 0).len(), 60);
    assert_eq!(h.supervisor.state(), PipelineState::Idle);
}
