//! Ownership and shutdown of one running transcoder.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use super::{TranscoderError, TranscoderRole};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Lifecycle control over a process, independent of its stdio.
#[async_trait]
pub trait ProcessControl: Send {
    /// OS process id, if the process has one and is not reaped yet
    fn id(&self) -> Option<u32>;

    /// Asks the process to exit on its own (SIGTERM on Unix).
    fn request_stop(&mut self) -> io::Result<()>;

    /// Forcibly terminates the process and reaps it.
    async fn kill(&mut self) -> io::Result<()>;

    /// Waits for exit and returns the exit code, `None` if killed by a signal.
    async fn wait(&mut self) -> io::Result<Option<i32>>;

    /// Returns `Some(code)` if the process already exited.
    fn try_wait(&mut self) -> io::Result<Option<Option<i32>>>;
}

/// Observed state of a transcoder process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Running,
    Exited(Option<i32>),
}

/// How a terminated transcoder went away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationOutcome {
    /// The process had already exited before termination was requested
    AlreadyExited(Option<i32>),
    /// The process honoured the stop request within the grace period
    Exited(Option<i32>),
    /// The grace period elapsed and the process was killed
    Killed,
}

/// One spawned transcoder, owned exclusively by the supervisor.
pub struct TranscoderHandle {
    role: TranscoderRole,
    args: Vec<String>,
    stdout: Option<BoxedReader>,
    stdin: Option<BoxedWriter>,
    stderr: Option<BoxedReader>,
    control: Box<dyn ProcessControl>,
    liveness: Liveness,
}

impl TranscoderHandle {
    pub fn new(role: TranscoderRole, args: Vec<String>, control: Box<dyn ProcessControl>) -> Self {
        Self {
            role,
            args,
            stdout: None,
            stdin: None,
            stderr: None,
            control,
            liveness: Liveness::Running,
        }
    }

    pub fn with_stdout(mut self, stdout: BoxedReader) -> Self {
        self.stdout = Some(stdout);
        self
    }

    pub fn with_stdin(mut self, stdin: BoxedWriter) -> Self {
        self.stdin = Some(stdin);
        self
    }

    pub fn with_stderr(mut self, stderr: BoxedReader) -> Self {
        self.stderr = Some(stderr);
        self
    }

    pub fn role(&self) -> TranscoderRole {
        self.role
    }

    /// Expanded argument list the process was started with
    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn id(&self) -> Option<u32> {
        self.control.id()
    }

    /// Takes the raw-frame output stream.
    ///
    /// # Errors
    ///
    /// - `TranscoderError::MissingStream` - Stream not piped or already taken
    pub fn take_stdout(&mut self) -> Result<BoxedReader, TranscoderError> {
        self.stdout.take().ok_or(TranscoderError::MissingStream {
            role: self.role,
            stream: "stdout",
        })
    }

    /// Takes the raw-frame input stream.
    ///
    /// # Errors
    ///
    /// - `TranscoderError::MissingStream` - Stream not piped or already taken
    pub fn take_stdin(&mut self) -> Result<BoxedWriter, TranscoderError> {
        self.stdin.take().ok_or(TranscoderError::MissingStream {
            role: self.role,
            stream: "stdin",
        })
    }

    /// Takes the diagnostic stream, if it was piped.
    pub fn take_stderr(&mut self) -> Option<BoxedReader> {
        self.stderr.take()
    }

    /// Polls the process without blocking.
    pub fn liveness(&mut self) -> Liveness {
        if self.liveness == Liveness::Running {
            match self.control.try_wait() {
                Ok(Some(code)) => self.liveness = Liveness::Exited(code),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(role = %self.role, "Failed to poll transcoder: {}", e);
                }
            }
        }
        self.liveness
    }

    /// Waits for the process to exit on its own.
    ///
    /// # Errors
    ///
    /// - `TranscoderError::Control` - Process could not be reaped
    pub async fn wait(&mut self) -> Result<Option<i32>, TranscoderError> {
        if let Liveness::Exited(code) = self.liveness {
            return Ok(code);
        }

        let code = self
            .control
            .wait()
            .await
            .map_err(|source| TranscoderError::Control {
                role: self.role,
                source,
            })?;
        self.liveness = Liveness::Exited(code);
        Ok(code)
    }

    /// Stops the process: graceful request first, forced kill after `grace`.
    ///
    /// Any stream still held by the handle is closed. Closing stdin first lets
    /// an encoder flush and exit on EOF before the stop request arrives.
    ///
    /// # Errors
    ///
    /// - `TranscoderError::Control` - Process could not be killed or reaped
    pub async fn terminate(
        &mut self,
        grace: Duration,
    ) -> Result<TerminationOutcome, TranscoderError> {
        drop(self.stdin.take());

        if let Liveness::Exited(code) = self.liveness() {
            self.close_streams();
            return Ok(TerminationOutcome::AlreadyExited(code));
        }

        if let Err(e) = self.control.request_stop() {
            tracing::warn!(role = %self.role, "Graceful stop request failed: {}", e);
        }

        let outcome = match tokio::time::timeout(grace, self.control.wait()).await {
            Ok(Ok(code)) => {
                self.liveness = Liveness::Exited(code);
                TerminationOutcome::Exited(code)
            }
            Ok(Err(source)) => {
                return Err(TranscoderError::Control {
                    role: self.role,
                    source,
                });
            }
            Err(_) => {
                tracing::warn!(
                    role = %self.role,
                    grace_ms = grace.as_millis() as u64,
                    "Transcoder ignored stop request, killing"
                );
                self.control
                    .kill()
                    .await
                    .map_err(|source| TranscoderError::Control {
                        role: self.role,
                        source,
                    })?;
                self.liveness = Liveness::Exited(None);
                TerminationOutcome::Killed
            }
        };

        self.close_streams();
        Ok(outcome)
    }

    fn close_streams(&mut self) {
        self.stdout = None;
        self.stdin = None;
        self.stderr = None;
    }
}

impl std::fmt::Debug for TranscoderHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranscoderHandle")
            .field("role", &self.role)
            .field("args", &self.args)
            .field("liveness", &self.liveness)
            .finish_non_exhaustive()
    }
}
