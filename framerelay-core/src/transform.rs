//! Per-frame transforms applied between the transcoders
//!
//! A transform maps one raw frame to another of a fixed, possibly different
//! size. It runs on the relay's control flow, so it must finish well within
//! one frame interval; the relay reports transforms that do not.

/// Errors returned by a transform for a single frame
#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("Frame has {actual} bytes, transform expects {expected}")]
    InputSize { expected: usize, actual: usize },

    #[error("Transform produced {actual} bytes, declared {expected}")]
    OutputSize { expected: usize, actual: usize },

    #[error("Transform failed: {reason}")]
    Failed { reason: String },
}

/// Pure function from one raw frame to another.
pub trait FrameTransform: Send {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Size of the produced frame for an input frame of `input_size` bytes.
    fn output_size(&self, input_size: usize) -> usize {
        input_size
    }

    /// Transforms one frame.
    ///
    /// # Errors
    ///
    /// - `TransformError` - This frame cannot be transformed and is dropped
    fn apply(&mut self, frame: &[u8]) -> Result<Vec<u8>, TransformError>;
}

/// Passes frames through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityTransform;

impl FrameTransform for IdentityTransform {
    fn name(&self) -> &'static str {
        "identity"
    }

    fn apply(&mut self, frame: &[u8]) -> Result<Vec<u8>, TransformError> {
        Ok(frame.to_vec())
    }
}

/// Converts interleaved BGR24 frames to grey, keeping three channels so the
/// output transcoder's pixel format does not change.
#[derive(Debug, Clone, Copy, Default)]
pub struct GrayscaleTransform;

impl FrameTransform for GrayscaleTransform {
    fn name(&self) -> &'static str {
        "grayscale"
    }

    fn apply(&mut self, frame: &[u8]) -> Result<Vec<u8>, TransformError> {
        if frame.len() % 3 != 0 {
            return Err(TransformError::InputSize {
                expected: frame.len() - frame.len() % 3,
                actual: frame.len(),
            });
        }

        let mut output = Vec::with_capacity(frame.len());
        for pixel in frame.chunks_exact(3) {
            let (b, g, r) = (pixel[0] as u32, pixel[1] as u32, pixel[2] as u32);
            // ITU-R BT.601 luma in fixed point
            let luma = ((r * 299 + g * 587 + b * 114 + 500) / 1000) as u8;
            output.extend_from_slice(&[luma, luma, luma]);
        }
        Ok(output)
    }
}

/// Inverts every byte of the frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct InvertTransform;

impl FrameTransform for InvertTransform {
    fn name(&self) -> &'static str {
        "invert"
    }

    fn apply(&mut self, frame: &[u8]) -> Result<Vec<u8>, TransformError> {
        Ok(frame.iter().map(|byte| !byte).collect())
    }
}

/// Transforms selectable from the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum TransformKind {
    #[default]
    Identity,
    Grayscale,
    Invert,
}

impl TransformKind {
    pub fn build(self) -> Box<dyn FrameTransform> {
        match self {
            TransformKind::Identity => Box::new(IdentityTransform),
            TransformKind::Grayscale => Box::new(GrayscaleTransform),
            TransformKind::Invert => Box::new(InvertTransform),
        }
    }
}

impl<T: FrameTransform + ?Sized> FrameTransform for Box<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn output_size(&self, input_size: usize) -> usize {
        (**self).output_size(input_size)
    }

    fn apply(&mut self, frame: &[u8]) -> Result<Vec<u8>, TransformError> {
        (**self).apply(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_copies_frame() {
        let mut transform = IdentityTransform;
        assert_eq!(transform.apply(&[1, 2, 3]).unwrap(), vec![1, 2, 3]);
        assert_eq!(transform.output_size(3), 3);
    }

    #[test]
    fn test_grayscale_luma() {
        let mut transform = GrayscaleTransform;
        // Pure white and pure black stay put, pure red maps to its luma
        let frame = [255, 255, 255, 0, 0, 0, 0, 0, 255];
        let output = transform.apply(&frame).unwrap();

        assert_eq!(&output[0..3], &[255, 255, 255]);
        assert_eq!(&output[3..6], &[0, 0, 0]);
        assert_eq!(&output[6..9], &[76, 76, 76]);
    }

    #[test]
    fn test_grayscale_rejects_ragged_frame() {
        let mut transform = GrayscaleTransform;
        assert!(matches!(
            transform.apply(&[1, 2, 3, 4]),
            Err(TransformError::InputSize {
                expected: 3,
                actual: 4
            })
        ));
    }

    #[test]
    fn test_transform_kind_selection() {
        let mut transform = TransformKind::Invert.build();
        assert_eq!(transform.name(), "invert");
        assert_eq!(transform.apply(&[0x00, 0xff]).unwrap(), vec![0xff, 0x00]);
        assert_eq!(TransformKind::default(), TransformKind::Identity);
    }
}
