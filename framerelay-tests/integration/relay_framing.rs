//! Relay framing over scripted byte streams

use std::io;
use std::time::Duration;

use framerelay_core::config::FrameFormat;
use framerelay_core::transform::{GrayscaleTransform, IdentityTransform, TransformKind};
use framerelay_core::{FrameRelay, RelayError};
use tokio_test::io::Builder;

#[tokio::test]
async fn test_jitter_is_absorbed_and_order_kept() {
    let frame = FrameFormat {
        width: 2,
        height: 2,
        bytes_per_pixel: 1,
        ..Default::default()
    };
    // Three 4-byte frames delivered in uneven bursts
    let mut input = Builder::new()
        .read(&[0])
        .read(&[1, 2, 3, 4, 5])
        .wait(Duration::from_millis(5))
        .read(&[6, 7])
        .read(&[8, 9, 10, 11])
        .build();
    let mut output = Builder::new()
        .write(&[0, 1, 2, 3])
        .write(&[4, 5, 6, 7])
        .write(&[8, 9, 10, 11])
        .build();
    let mut relay = FrameRelay::new(frame.frame_size())
        .unwrap()
        .with_frame_interval(frame.frame_interval());

    let stats = relay
        .run(&mut input, &mut output, &mut IdentityTransform)
        .await
        .unwrap();

    assert_eq!(stats.frames_out, 3);
    assert_eq!(stats.bytes_in, 12);
}

#[tokio::test]
async fn test_ragged_tail_is_framing_error() {
    let mut input = Builder::new().read(&[1, 2, 3, 4, 5, 6]).read(&[7]).build();
    let mut output = Builder::new().write(&[1, 2, 3, 4, 5, 6]).build();
    let mut relay = FrameRelay::new(6).unwrap();

    let result = relay
        .run(&mut input, &mut output, &mut IdentityTransform)
        .await;

    assert!(matches!(
        result,
        Err(RelayError::TruncatedFrame {
            received: 1,
            expected: 6
        })
    ));
    assert_eq!(relay.stats().frames_out, 1);
}

#[tokio::test]
async fn test_reset_destination_ends_run() {
    let mut input = Builder::new().read(&[9; 6]).build();
    let mut output = Builder::new()
        .write_error(io::Error::from(io::ErrorKind::ConnectionReset))
        .build();
    let mut relay = FrameRelay::new(6).unwrap();

    let result = relay
        .run(&mut input, &mut output, &mut GrayscaleTransform)
        .await;

    assert!(matches!(result, Err(RelayError::DestinationClosed)));
    assert_eq!(relay.stats().frames_in, 1);
}

#[tokio::test]
async fn test_selected_transform_runs_in_relay() {
    let mut input: &[u8] = &[0x0f, 0xf0];
    let mut output = Vec::new();
    let mut transform = TransformKind::Invert.build();
    let mut relay = FrameRelay::new(1).unwrap();

    relay
        .run(&mut input, &mut output, &mut transform)
        .await
        .unwrap();

    assert_eq!(output, vec![0xf0, 0x0f]);
}
