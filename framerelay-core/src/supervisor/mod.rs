//! Pipeline supervision
//!
//! The supervisor owns every transcoder handle and diagnostics reader of an
//! attempt. Each attempt writes a fresh session descriptor, spawns the
//! configured transcoders, relays frames until something ends the run, then
//! drains: transcoders are stopped with a grace period, readers are cancelled
//! and joined. `run` repeats attempts after a fixed delay until shutdown.

pub mod shutdown;
pub mod state;

use futures::future::join_all;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, warn};

pub use shutdown::{ShutdownListener, ShutdownTrigger, SupervisorContext, shutdown_channel};
pub use state::{AttemptId, AttemptOutcome, AttemptReport, PipelineState, StateTransition};

use crate::PipelineError;
use crate::classifier::{
    ClassifierReport, FatalDiagnostics, MonitorSettings, spawn_diagnostics_monitor,
};
use crate::config::RelayConfig;
use crate::relay::FrameRelay;
use crate::session::SessionDescriptor;
use crate::transcoder::{
    ArgContext, BoxedWriter, TranscoderHandle, TranscoderLauncher, TranscoderRole,
};
use crate::transform::FrameTransform;

/// Pending fatal signals per attempt; one is enough to end the run
const FATAL_SIGNAL_CAPACITY: usize = 4;

/// Restarting supervisor for one relay pipeline.
pub struct Supervisor<L> {
    config: RelayConfig,
    launcher: L,
    transform: Box<dyn FrameTransform>,
    context: SupervisorContext,
    state_tx: watch::Sender<PipelineState>,
    transitions: Option<mpsc::UnboundedSender<StateTransition>>,
    attempts: u64,
}

impl<L: TranscoderLauncher> Supervisor<L> {
    pub fn new(
        config: RelayConfig,
        launcher: L,
        transform: Box<dyn FrameTransform>,
        context: SupervisorContext,
    ) -> Self {
        let (state_tx, _) = watch::channel(PipelineState::Idle);
        Self {
            config,
            launcher,
            transform,
            context,
            state_tx,
            transitions: None,
            attempts: 0,
        }
    }

    /// Publishes every state change on `tx`.
    pub fn with_transition_log(mut self, tx: mpsc::UnboundedSender<StateTransition>) -> Self {
        self.transitions = Some(tx);
        self
    }

    pub fn state(&self) -> PipelineState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PipelineState> {
        self.state_tx.subscribe()
    }

    /// Number of attempts started so far
    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    /// Runs attempts until shutdown is requested and returns how many ran.
    ///
    /// Every failure, configuration errors included, is followed by the
    /// restart delay and a new attempt.
    pub async fn run(&mut self) -> u64 {
        let span = self.context.span().clone();
        async {
            let mut shutdown = self.context.shutdown();
            let delay = self.config.supervisor.restart_delay;
            info!(
                transform = self.transform.name(),
                output = self.config.output.is_some(),
                restart_delay_ms = delay.as_millis() as u64,
                "Supervisor started"
            );

            loop {
                let report = self.run_attempt().await;
                if report.outcome == AttemptOutcome::Shutdown || shutdown.is_shutdown() {
                    break;
                }

                info!(
                    attempt = %report.attempt,
                    outcome = %report.outcome,
                    delay_ms = delay.as_millis() as u64,
                    "Restarting pipeline after delay"
                );

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.wait() => break,
                }
            }

            info!(attempts = self.attempts, "Supervisor stopped");
            self.attempts
        }
        .instrument(span)
        .await
    }

    /// Runs one Negotiating, Running, Draining cycle and returns to `Idle`.
    pub async fn run_attempt(&mut self) -> AttemptReport {
        self.attempts += 1;
        let attempt = AttemptId::new();
        let span = self.context.attempt_span(attempt, self.attempts);
        self.attempt(attempt).instrument(span).await
    }

    async fn attempt(&mut self, attempt: AttemptId) -> AttemptReport {
        let mut report = AttemptReport::new(attempt, self.attempts, AttemptOutcome::Shutdown);
        let mut handles = Vec::new();
        let mut monitors = Vec::new();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (fatal_tx, mut fatal_rx) = mpsc::channel(FATAL_SIGNAL_CAPACITY);

        self.transition(PipelineState::Negotiating, attempt);

        let outcome = match self.negotiate(&mut handles).await {
            Ok(()) => {
                let settings = MonitorSettings {
                    error_line_threshold: self.config.supervisor.error_line_threshold,
                    progress_log_interval: self.config.supervisor.progress_log_interval,
                };
                for handle in handles.iter_mut() {
                    if let Some(stderr) = handle.take_stderr() {
                        monitors.push(spawn_diagnostics_monitor(
                            handle.role(),
                            stderr,
                            settings,
                            fatal_tx.clone(),
                            cancel_rx.clone(),
                        ));
                    }
                }
                drop(fatal_tx);

                self.transition(PipelineState::Running, attempt);
                self.relay(&mut handles, &mut fatal_rx, &mut report).await
            }
            Err(outcome) => outcome,
        };
        report.outcome = outcome;

        self.transition(PipelineState::Draining, attempt);
        self.drain(handles, monitors, cancel_tx, &mut report).await;
        self.transition(PipelineState::Idle, attempt);

        info!(
            outcome = %report.outcome,
            frames = report.relay_stats.frames_out,
            dropped = report.relay_stats.frames_dropped,
            "Attempt finished"
        );
        report
    }

    /// Writes the descriptor and spawns the configured transcoders.
    async fn negotiate(
        &mut self,
        handles: &mut Vec<TranscoderHandle>,
    ) -> Result<(), AttemptOutcome> {
        if self.context.is_shutdown() {
            return Err(AttemptOutcome::Shutdown);
        }

        match SessionDescriptor::build(&self.config.session, &self.config.frame) {
            Ok(descriptor) => debug!(
                path = %self.config.session.descriptor_path.display(),
                port = descriptor.port,
                payload_type = descriptor.payload_type,
                "Session descriptor written"
            ),
            Err(e) => {
                let e = PipelineError::from(e);
                error!(error = %e, "{}", e.user_message());
                return Err(AttemptOutcome::DescriptorFailed);
            }
        }

        let args = ArgContext::from_config(&self.config);
        let mut requests = vec![self.config.input.to_request(TranscoderRole::Input, &args)];
        if let Some(output) = &self.config.output {
            requests.push(output.to_request(TranscoderRole::Output, &args));
        }

        for request in requests {
            let role = request.role;
            match self.launcher.launch(request).await {
                Ok(handle) => {
                    debug!(%role, pid = ?handle.id(), "Transcoder launched");
                    handles.push(handle);
                }
                Err(e) => {
                    let e = PipelineError::from(e);
                    error!(%role, error = %e, "{}", e.user_message());
                    return Err(AttemptOutcome::SpawnFailed(role));
                }
            }
        }

        Ok(())
    }

    /// Relays frames until input closes, the relay fails, diagnostics turn
    /// fatal or shutdown is requested.
    async fn relay(
        &mut self,
        handles: &mut [TranscoderHandle],
        fatal_rx: &mut mpsc::Receiver<FatalDiagnostics>,
        report: &mut AttemptReport,
    ) -> AttemptOutcome {
        let Some(input) = handles
            .iter_mut()
            .find(|handle| handle.role() == TranscoderRole::Input)
        else {
            error!("No input transcoder in this attempt");
            return AttemptOutcome::SpawnFailed(TranscoderRole::Input);
        };
        let mut reader = match input.take_stdout() {
            Ok(reader) => reader,
            Err(e) => {
                error!(error = %e, "Input transcoder has no frame stream");
                return AttemptOutcome::SpawnFailed(TranscoderRole::Input);
            }
        };

        let mut writer: BoxedWriter = match handles
            .iter_mut()
            .find(|handle| handle.role() == TranscoderRole::Output)
        {
            Some(output) => match output.take_stdin() {
                Ok(writer) => writer,
                Err(e) => {
                    error!(error = %e, "Output transcoder has no frame stream");
                    return AttemptOutcome::SpawnFailed(TranscoderRole::Output);
                }
            },
            None => {
                debug!("No output transcoder configured, discarding frames");
                Box::new(tokio::io::sink())
            }
        };

        let mut relay = match FrameRelay::new(self.config.frame.frame_size()) {
            Ok(relay) => relay.with_frame_interval(self.config.frame.frame_interval()),
            Err(e) => {
                error!(error = %e, "Cannot start frame relay");
                report.relay_error = Some(e);
                return AttemptOutcome::RelayFailed;
            }
        };

        let mut shutdown = self.context.shutdown();
        let transform = &mut self.transform;
        let outcome = tokio::select! {
            result = relay.run(&mut reader, &mut writer, transform) => match result {
                Ok(_) => AttemptOutcome::InputClosed,
                Err(e) => {
                    let e = PipelineError::from(e);
                    warn!(error = %e, "{}", e.user_message());
                    if let PipelineError::Relay(e) = e {
                        report.relay_error = Some(e);
                    }
                    AttemptOutcome::RelayFailed
                }
            },
            Some(signal) = fatal_rx.recv() => {
                warn!(
                    role = %signal.role,
                    consecutive_errors = signal.consecutive_errors,
                    "Abandoning run on fatal diagnostics"
                );
                AttemptOutcome::FatalDiagnostics(signal.role)
            }
            _ = shutdown.wait() => {
                info!("Shutdown requested while running");
                AttemptOutcome::Shutdown
            }
        };

        report.relay_stats = relay.stats();
        outcome
    }

    /// Stops transcoders, then cancels and joins their diagnostics readers.
    async fn drain(
        &mut self,
        mut handles: Vec<TranscoderHandle>,
        monitors: Vec<JoinHandle<ClassifierReport>>,
        cancel_tx: watch::Sender<bool>,
        report: &mut AttemptReport,
    ) {
        let grace = self.config.supervisor.termination_grace;
        let results = join_all(handles.iter_mut().map(|handle| async move {
            let role = handle.role();
            (role, handle.terminate(grace).await)
        }))
        .await;

        for (role, result) in results {
            match result {
                Ok(outcome) => {
                    debug!(%role, ?outcome, "Transcoder stopped");
                    report.terminations.push((role, outcome));
                }
                Err(e) => error!(%role, "Failed to stop transcoder: {}", e),
            }
        }
        drop(handles);

        cancel_tx.send_replace(true);

        let join_timeout = self.config.supervisor.classifier_join_timeout;
        for mut monitor in monitors {
            match tokio::time::timeout(join_timeout, &mut monitor).await {
                Ok(Ok(classifier)) => report.classifiers.push(classifier),
                Ok(Err(e)) => warn!("Diagnostics reader failed: {}", e),
                Err(_) => {
                    warn!(
                        timeout_ms = join_timeout.as_millis() as u64,
                        "Diagnostics reader did not finish, aborting"
                    );
                    monitor.abort();
                }
            }
        }
    }

    fn transition(&self, to: PipelineState, attempt: AttemptId) {
        let from = self.state_tx.send_replace(to);
        if from == to {
            return;
        }

        info!(%from, %to, "Pipeline state changed");
        if let Some(tx) = &self.transitions {
            // Observer gone; nothing else depends on delivery
            let _ = tx.send(StateTransition { from, to, attempt });
        }
    }
}
