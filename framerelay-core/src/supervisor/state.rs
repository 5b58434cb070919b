//! Pipeline lifecycle states and attempt bookkeeping

use std::fmt;

use uuid::Uuid;

use crate::classifier::ClassifierReport;
use crate::relay::{RelayError, RelayStats};
use crate::transcoder::{TerminationOutcome, TranscoderRole};

/// Lifecycle state of the supervised pipeline.
///
/// `Idle -> Negotiating -> Running -> Draining -> Idle`; a restart re-enters
/// `Negotiating` from `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PipelineState {
    #[default]
    Idle,
    /// Writing the descriptor and spawning transcoders
    Negotiating,
    /// Frames are flowing through the relay
    Running,
    /// Terminating transcoders and joining diagnostics readers
    Draining,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Idle => write!(f, "idle"),
            PipelineState::Negotiating => write!(f, "negotiating"),
            PipelineState::Running => write!(f, "running"),
            PipelineState::Draining => write!(f, "draining"),
        }
    }
}

/// One observed state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTransition {
    pub from: PipelineState,
    pub to: PipelineState,
    pub attempt: AttemptId,
}

/// Unique identifier for one Negotiating-to-Idle cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttemptId(pub Uuid);

impl AttemptId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AttemptId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why an attempt left the `Running` state (or never reached it)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Input transcoder closed its frame stream on a frame boundary
    InputClosed,
    /// Relay hit a framing error or the destination closed
    RelayFailed,
    /// A transcoder's error-line run crossed the threshold
    FatalDiagnostics(TranscoderRole),
    /// Session descriptor could not be written
    DescriptorFailed,
    /// A transcoder could not be started
    SpawnFailed(TranscoderRole),
    /// External shutdown request
    Shutdown,
}

impl AttemptOutcome {
    /// Whether the failure points at configuration rather than runtime
    /// conditions. Both kinds are retried.
    pub fn is_configuration_failure(&self) -> bool {
        matches!(
            self,
            AttemptOutcome::DescriptorFailed | AttemptOutcome::SpawnFailed(_)
        )
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptOutcome::InputClosed => write!(f, "input closed"),
            AttemptOutcome::RelayFailed => write!(f, "relay failed"),
            AttemptOutcome::FatalDiagnostics(role) => {
                write!(f, "fatal diagnostics from {role} transcoder")
            }
            AttemptOutcome::DescriptorFailed => write!(f, "session descriptor unwritable"),
            AttemptOutcome::SpawnFailed(role) => write!(f, "{role} transcoder failed to spawn"),
            AttemptOutcome::Shutdown => write!(f, "shutdown requested"),
        }
    }
}

/// Everything learned from one attempt
#[derive(Debug)]
pub struct AttemptReport {
    pub attempt: AttemptId,
    /// 1-based position of this attempt within the supervisor's lifetime
    pub sequence: u64,
    pub outcome: AttemptOutcome,
    pub relay_stats: RelayStats,
    pub relay_error: Option<RelayError>,
    pub classifiers: Vec<ClassifierReport>,
    pub terminations: Vec<(TranscoderRole, TerminationOutcome)>,
}

impl AttemptReport {
    pub(crate) fn new(attempt: AttemptId, sequence: u64, outcome: AttemptOutcome) -> Self {
        Self {
            attempt,
            sequence,
            outcome,
            relay_stats: RelayStats::default(),
            relay_error: None,
            classifiers: Vec::new(),
            terminations: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(PipelineState::default(), PipelineState::Idle);
        assert_eq!(PipelineState::Negotiating.to_string(), "negotiating");
        assert_eq!(PipelineState::Draining.to_string(), "draining");
    }

    #[test]
    fn test_configuration_failures() {
        assert!(AttemptOutcome::DescriptorFailed.is_configuration_failure());
        assert!(AttemptOutcome::SpawnFailed(TranscoderRole::Output).is_configuration_failure());
        assert!(!AttemptOutcome::RelayFailed.is_configuration_failure());
        assert_eq!(
            AttemptOutcome::FatalDiagnostics(TranscoderRole::Input).to_string(),
            "fatal diagnostics from input transcoder"
        );
    }

    #[test]
    fn test_attempt_ids_are_unique() {
        assert_ne!(AttemptId::new(), AttemptId::new());
    }
}
