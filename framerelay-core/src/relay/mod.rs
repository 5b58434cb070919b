//! Frame relay between the input and output transcoders
//!
//! Reads fixed-size raw frames from the input stream, runs each through the
//! transform and writes the result downstream. Exactly one frame is in
//! flight at a time, so frames leave in the order they arrived.

pub mod frame;

use std::io;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, trace, warn};

pub use frame::{FrameRead, read_frame, write_frame};

use crate::transform::{FrameTransform, TransformError};

/// Largest frame the relay will buffer, enough for 8K at 16 bytes per pixel
pub const MAX_FRAME_SIZE: usize = 512 * 1024 * 1024;

/// Errors that end a relay run
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Frame size must be between 1 and {} bytes", MAX_FRAME_SIZE)]
    InvalidFrameSize,

    #[error("Input ended inside a frame: {received} of {expected} bytes")]
    TruncatedFrame { received: usize, expected: usize },

    #[error("Failed to read from input transcoder: {0}")]
    Read(io::Error),

    #[error("Failed to write to output transcoder: {0}")]
    Write(io::Error),

    #[error("Output transcoder closed its input")]
    DestinationClosed,
}

/// Counters for one relay run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Complete frames read from the input
    pub frames_in: u64,
    /// Frames written downstream
    pub frames_out: u64,
    /// Frames skipped because the transform failed
    pub frames_dropped: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    /// Transforms that took longer than one frame interval
    pub slow_transforms: u64,
}

/// Moves frames from one stream to another through a transform.
#[derive(Debug)]
pub struct FrameRelay {
    frame_size: usize,
    frame_interval: Duration,
    stats: RelayStats,
}

impl FrameRelay {
    /// Creates a relay for frames of `frame_size` bytes.
    ///
    /// # Errors
    ///
    /// - `RelayError::InvalidFrameSize` - `frame_size` is zero or above
    ///   `MAX_FRAME_SIZE`
    pub fn new(frame_size: usize) -> Result<Self, RelayError> {
        if frame_size == 0 || frame_size > MAX_FRAME_SIZE {
            return Err(RelayError::InvalidFrameSize);
        }

        Ok(Self {
            frame_size,
            frame_interval: Duration::ZERO,
            stats: RelayStats::default(),
        })
    }

    /// Sets the per-frame time budget; transforms exceeding it are reported.
    pub fn with_frame_interval(mut self, frame_interval: Duration) -> Self {
        self.frame_interval = frame_interval;
        self
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Counters accumulated so far, also valid after a failed or cancelled run
    pub fn stats(&self) -> RelayStats {
        self.stats
    }

    /// Relays frames until the input closes on a frame boundary.
    ///
    /// Transform failures drop the affected frame and the run continues.
    ///
    /// # Errors
    ///
    /// - `RelayError::TruncatedFrame` - Input ended inside a frame
    /// - `RelayError::Read` - Input stream failed
    /// - `RelayError::DestinationClosed` - Output stopped accepting data
    /// - `RelayError::Write` - Output stream failed
    pub async fn run<R, W, T>(
        &mut self,
        input: &mut R,
        output: &mut W,
        transform: &mut T,
    ) -> Result<RelayStats, RelayError>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
        T: FrameTransform + ?Sized,
    {
        let mut buffer = vec![0u8; self.frame_size];
        let expected_output = transform.output_size(self.frame_size);

        debug!(
            frame_size = self.frame_size,
            output_size = expected_output,
            transform = transform.name(),
            "Frame relay started"
        );

        loop {
            match read_frame(input, &mut buffer).await {
                Ok(FrameRead::Complete) => {}
                Ok(FrameRead::Closed) => {
                    info!(
                        frames = self.stats.frames_out,
                        dropped = self.stats.frames_dropped,
                        "Input stream closed, relay complete"
                    );
                    return Ok(self.stats);
                }
                Err(e) => {
                    warn!(frames = self.stats.frames_out, "Frame relay stopped: {}", e);
                    return Err(e);
                }
            }

            self.stats.frames_in += 1;
            self.stats.bytes_in += self.frame_size as u64;

            let started = Instant::now();
            let result = transform.apply(&buffer);
            self.record_transform_time(started.elapsed());

            let transformed = match result.and_then(|frame| {
                if frame.len() == expected_output {
                    Ok(frame)
                } else {
                    Err(TransformError::OutputSize {
                        expected: expected_output,
                        actual: frame.len(),
                    })
                }
            }) {
                Ok(frame) => frame,
                Err(e) => {
                    self.stats.frames_dropped += 1;
                    warn!(
                        frame = self.stats.frames_in,
                        transform = transform.name(),
                        "Dropping frame: {}",
                        e
                    );
                    continue;
                }
            };

            if let Err(e) = write_frame(output, &transformed).await {
                warn!(frames = self.stats.frames_out, "Frame relay stopped: {}", e);
                return Err(e);
            }

            self.stats.frames_out += 1;
            self.stats.bytes_out += transformed.len() as u64;
            trace!(frame = self.stats.frames_out, "Relayed frame");
        }
    }

    fn record_transform_time(&mut self, elapsed: Duration) {
        if self.frame_interval.is_zero() || elapsed <= self.frame_interval {
            return;
        }

        self.stats.slow_transforms += 1;
        // First occurrence and then every 100th, to keep logs readable
        if self.stats.slow_transforms % 100 == 1 {
            warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                budget_ms = self.frame_interval.as_millis() as u64,
                slow_transforms = self.stats.slow_transforms,
                "Transform exceeded frame interval"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use tokio_test::io::Builder;

    use super::*;
    use crate::transform::{IdentityTransform, InvertTransform};

    /// Fails on frames whose first byte matches `poison`.
    struct PoisonTransform {
        poison: u8,
    }

    impl FrameTransform for PoisonTransform {
        fn name(&self) -> &'static str {
            "poison"
        }

        fn apply(&mut self, frame: &[u8]) -> Result<Vec<u8>, TransformError> {
            if frame[0] == self.poison {
                return Err(TransformError::Failed {
                    reason: "poisoned frame".to_string(),
                });
            }
            Ok(frame.to_vec())
        }
    }

    /// Declares a larger output than it produces.
    struct ShortTransform;

    impl FrameTransform for ShortTransform {
        fn name(&self) -> &'static str {
            "short"
        }

        fn output_size(&self, input_size: usize) -> usize {
            input_size * 2
        }

        fn apply(&mut self, frame: &[u8]) -> Result<Vec<u8>, TransformError> {
            Ok(frame.to_vec())
        }
    }

    fn frames(count: u8, size: usize) -> Vec<u8> {
        (0..count).flat_map(|i| vec![i; size]).collect()
    }

    #[tokio::test]
    async fn test_zero_frame_size_rejected() {
        assert!(matches!(
            FrameRelay::new(0),
            Err(RelayError::InvalidFrameSize)
        ));
        assert!(matches!(
            FrameRelay::new(MAX_FRAME_SIZE + 1),
            Err(RelayError::InvalidFrameSize)
        ));
        assert!(FrameRelay::new(MAX_FRAME_SIZE).is_ok());
    }

    #[tokio::test]
    async fn test_relays_frames_in_order() {
        let data = frames(5, 4);
        let mut input: &[u8] = &data;
        let mut output = Vec::new();
        let mut relay = FrameRelay::new(4).unwrap();

        let stats = relay
            .run(&mut input, &mut output, &mut IdentityTransform)
            .await
            .unwrap();

        assert_eq!(output, data);
        assert_eq!(stats.frames_in, 5);
        assert_eq!(stats.frames_out, 5);
        assert_eq!(stats.bytes_out, 20);
        assert_eq!(stats.frames_dropped, 0);
    }

    #[tokio::test]
    async fn test_empty_input_is_clean_close() {
        let mut input: &[u8] = &[];
        let mut output = Vec::new();
        let mut relay = FrameRelay::new(4).unwrap();

        let stats = relay
            .run(&mut input, &mut output, &mut IdentityTransform)
            .await
            .unwrap();

        assert_eq!(stats, RelayStats::default());
        assert!(output.is_empty());
    }

    #[tokio::test]
    async fn test_trailing_partial_frame_is_framing_error() {
        let mut data = frames(2, 4);
        data.extend_from_slice(&[9, 9]);
        let mut input: &[u8] = &data;
        let mut output = Vec::new();
        let mut relay = FrameRelay::new(4).unwrap();

        let result = relay
            .run(&mut input, &mut output, &mut IdentityTransform)
            .await;

        assert!(matches!(
            result,
            Err(RelayError::TruncatedFrame {
                received: 2,
                expected: 4
            })
        ));
        assert_eq!(relay.stats().frames_out, 2);
        assert_eq!(output, frames(2, 4));
    }

    #[tokio::test]
    async fn test_transform_failure_skips_one_frame() {
        let data = frames(4, 3);
        let mut input: &[u8] = &data;
        let mut output = Vec::new();
        let mut relay = FrameRelay::new(3).unwrap();

        let stats = relay
            .run(&mut input, &mut output, &mut PoisonTransform { poison: 1 })
            .await
            .unwrap();

        assert_eq!(output, vec![0, 0, 0, 2, 2, 2, 3, 3, 3]);
        assert_eq!(stats.frames_in, 4);
        assert_eq!(stats.frames_out, 3);
        assert_eq!(stats.frames_dropped, 1);
    }

    #[tokio::test]
    async fn test_output_size_mismatch_drops_frame() {
        let data = frames(2, 3);
        let mut input: &[u8] = &data;
        let mut output = Vec::new();
        let mut relay = FrameRelay::new(3).unwrap();

        let stats = relay
            .run(&mut input, &mut output, &mut ShortTransform)
            .await
            .unwrap();

        assert!(output.is_empty());
        assert_eq!(stats.frames_dropped, 2);
    }

    #[tokio::test]
    async fn test_jittery_input_reassembles_frames() {
        let mut input = Builder::new()
            .read(&[1, 2])
            .read(&[3, 4, 5])
            .read(&[6])
            .build();
        let mut output = Vec::new();
        let mut relay = FrameRelay::new(3).unwrap();

        relay
            .run(&mut input, &mut output, &mut InvertTransform)
            .await
            .unwrap();

        assert_eq!(output, vec![!1u8, !2, !3, !4, !5, !6]);
    }

    #[tokio::test]
    async fn test_destination_closed_mid_run() {
        let data = frames(3, 2);
        let mut input: &[u8] = &data;
        let mut output = Builder::new()
            .write(&[0, 0])
            .write_error(io::Error::from(io::ErrorKind::BrokenPipe))
            .build();
        let mut relay = FrameRelay::new(2).unwrap();

        let result = relay
            .run(&mut input, &mut output, &mut IdentityTransform)
            .await;

        assert!(matches!(result, Err(RelayError::DestinationClosed)));
        assert_eq!(relay.stats().frames_out, 1);
    }

    #[tokio::test]
    async fn test_slow_transform_is_counted() {
        struct SlowTransform;

        impl FrameTransform for SlowTransform {
            fn name(&self) -> &'static str {
                "slow"
            }

            fn apply(&mut self, frame: &[u8]) -> Result<Vec<u8>, TransformError> {
                std::thread::sleep(Duration::from_millis(5));
                Ok(frame.to_vec())
            }
        }

        let data = frames(2, 1);
        let mut input: &[u8] = &data;
        let mut output = Vec::new();
        let mut relay = FrameRelay::new(1)
            .unwrap()
            .with_frame_interval(Duration::from_millis(1));

        let stats = relay
            .run(&mut input, &mut output, &mut SlowTransform)
            .await
            .unwrap();

        assert_eq!(stats.slow_transforms, 2);
        assert_eq!(stats.frames_out, 2);
    }

    proptest! {
        #[test]
        fn prop_exact_multiples_relay_every_frame(frame_size in 1usize..64, count in 0usize..32) {
            let data: Vec<u8> = (0..frame_size * count).map(|i| (i % 251) as u8).collect();
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();

            let (output, stats) = runtime.block_on(async {
                let mut input: &[u8] = &data;
                let mut output = Vec::new();
                let mut relay = FrameRelay::new(frame_size).unwrap();
                let stats = relay
                    .run(&mut input, &mut output, &mut IdentityTransform)
                    .await
                    .unwrap();
                (output, stats)
            });

            prop_assert_eq!(stats.frames_in, count as u64);
            prop_assert_eq!(stats.frames_out, count as u64);
            prop_assert_eq!(output, data);
        }
    }
}
