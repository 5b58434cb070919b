//! Framerelay Core - Frame relay and transcoder supervision
//!
//! This crate relays a live video stream between two external transcoder
//! processes: it writes the session descriptor the input transcoder consumes,
//! spawns and supervises the transcoders, moves fixed-size raw frames through
//! an in-process transform, classifies transcoder diagnostics and restarts the
//! whole pipeline when a run fails.

pub mod classifier;
pub mod config;
pub mod relay;
pub mod session;
pub mod supervisor;
pub mod test_pattern;
pub mod tracing_setup;
pub mod transcoder;
pub mod transform;

// Re-export main types for convenient access
pub use classifier::{ClassifierReport, LineClass, LogClassifier};
pub use config::{ConfigError, FrameFormat, RelayConfig};
pub use relay::{FrameRelay, RelayError, RelayStats};
pub use session::{DescriptorError, Direction, SessionDescriptor};
pub use supervisor::{
    AttemptOutcome, AttemptReport, PipelineState, ShutdownListener, ShutdownTrigger,
    StateTransition, Supervisor, SupervisorContext, shutdown_channel,
};
pub use test_pattern::TestPatternSource;
pub use transcoder::{
    ProcessLauncher, TranscoderError, TranscoderHandle, TranscoderLauncher, TranscoderRole,
    TranscoderSpec,
};
pub use transform::{FrameTransform, TransformError, TransformKind};

/// Errors that can bubble up from any pipeline subsystem.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Session descriptor error: {0}")]
    Descriptor(#[from] DescriptorError),

    #[error("Transcoder error: {0}")]
    Transcoder(#[from] TranscoderError),

    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Returns a short operator-facing description of the failure.
    pub fn user_message(&self) -> String {
        match self {
            PipelineError::Config(e) => format!("Invalid configuration: {e}"),
            PipelineError::Descriptor(DescriptorError::Unwritable { path, .. }) => {
                format!("Cannot write session descriptor to {}", path.display())
            }
            PipelineError::Transcoder(TranscoderError::SpawnFailed { program, .. }) => {
                format!("Could not start transcoder {program}")
            }
            PipelineError::Transcoder(_) => "Transcoder failure".to_string(),
            PipelineError::Relay(RelayError::DestinationClosed) => {
                "Output transcoder stopped accepting frames".to_string()
            }
            PipelineError::Relay(_) => "Frame relay failure".to_string(),
            PipelineError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if this error stems from configuration rather than runtime I/O.
    ///
    /// Configuration errors fail the current attempt but are still retried by
    /// the supervisor after its back-off delay.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            PipelineError::Config(_)
                | PipelineError::Descriptor(_)
                | PipelineError::Transcoder(TranscoderError::SpawnFailed { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
