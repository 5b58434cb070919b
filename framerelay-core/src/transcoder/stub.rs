//! In-memory transcoders for testing the pipeline without a media engine.
//!
//! Each launch plays a scripted [`StubBehavior`]: bytes emitted on stdout,
//! lines emitted on stderr, and how much of stdin is accepted before the
//! destination closes. Streams stay open until the stub "process" exits, just
//! like pipes of a real child.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::watch;

use super::handle::{ProcessControl, TranscoderHandle};
use super::{LaunchRequest, TranscoderError, TranscoderLauncher, TranscoderRole};

const PIPE_CAPACITY: usize = 64 * 1024;

/// Scripted behaviour of one stub process.
#[derive(Debug, Clone)]
pub struct StubBehavior {
    /// Payload written to stdout (input role)
    pub stdout: Bytes,
    /// Size of individual stdout writes, to exercise partial reads
    pub stdout_chunk: usize,
    /// Keep stdout open after the payload until the process is stopped
    pub hold_stdout_open: bool,
    /// Lines written to stderr, each terminated by a line feed
    pub stderr_lines: Vec<String>,
    /// Close stdin after accepting this many bytes (output role)
    pub accept_bytes: Option<usize>,
    /// Refuse to start
    pub fail_spawn: bool,
    /// Ignore graceful stop requests; only a kill ends the process
    pub ignore_stop: bool,
    /// Exit code reported on graceful exit
    pub exit_code: i32,
}

impl Default for StubBehavior {
    fn default() -> Self {
        Self {
            stdout: Bytes::new(),
            stdout_chunk: 4096,
            hold_stdout_open: false,
            stderr_lines: Vec::new(),
            accept_bytes: None,
            fail_spawn: false,
            ignore_stop: false,
            exit_code: 0,
        }
    }
}

#[derive(Default)]
struct StubState {
    behaviors: Mutex<HashMap<TranscoderRole, Vec<StubBehavior>>>,
    launches: Mutex<Vec<LaunchRequest>>,
    captured: Mutex<HashMap<TranscoderRole, Vec<Capture>>>,
    exits: Mutex<HashMap<TranscoderRole, Vec<watch::Receiver<ExitState>>>>,
    next_pid: AtomicU32,
}

/// Stdin bytes of one stub process and whether its stdin reached EOF
#[derive(Clone)]
struct Capture {
    data: Arc<Mutex<Vec<u8>>>,
    closed: watch::Receiver<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitState {
    Running,
    Exited(Option<i32>),
}

/// Launcher that plays scripted behaviours instead of spawning processes.
///
/// Behaviours are consumed per role in launch order; the last one repeats
/// for every further launch.
#[derive(Clone, Default)]
pub struct StubLauncher {
    state: Arc<StubState>,
}

impl StubLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input(self, behavior: StubBehavior) -> Self {
        self.with_behavior(TranscoderRole::Input, behavior)
    }

    pub fn with_output(self, behavior: StubBehavior) -> Self {
        self.with_behavior(TranscoderRole::Output, behavior)
    }

    pub fn with_behavior(self, role: TranscoderRole, behavior: StubBehavior) -> Self {
        self.state
            .behaviors
            .lock()
            .entry(role)
            .or_default()
            .push(behavior);
        self
    }

    /// Number of launch attempts for `role`, failed spawns included.
    pub fn launch_count(&self, role: TranscoderRole) -> usize {
        self.state
            .launches
            .lock()
            .iter()
            .filter(|request| request.role == role)
            .count()
    }

    /// All launch requests in the order they were made.
    pub fn launches(&self) -> Vec<LaunchRequest> {
        self.state.launches.lock().clone()
    }

    /// Bytes received on stdin by the `index`-th process of `role`.
    pub fn captured_stdin(&self, role: TranscoderRole, index: usize) -> Vec<u8> {
        self.capture(role, index)
            .map(|capture| capture.data.lock().clone())
            .unwrap_or_default()
    }

    /// Waits until the `index`-th process of `role` stops reading stdin,
    /// either at end of stream or after its accepted byte count.
    pub async fn wait_for_stdin_closed(&self, role: TranscoderRole, index: usize) {
        if let Some(mut capture) = self.capture(role, index) {
            let _ = capture.closed.wait_for(|closed| *closed).await;
        }
    }

    fn capture(&self, role: TranscoderRole, index: usize) -> Option<Capture> {
        self.state
            .captured
            .lock()
            .get(&role)
            .and_then(|captures| captures.get(index))
            .cloned()
    }

    /// Whether the `index`-th process of `role` has exited.
    pub fn has_exited(&self, role: TranscoderRole, index: usize) -> bool {
        self.exit_receiver(role, index)
            .is_some_and(|rx| *rx.borrow() != ExitState::Running)
    }

    /// Waits until the `index`-th process of `role` exits.
    pub async fn wait_for_exit(&self, role: TranscoderRole, index: usize) {
        if let Some(mut rx) = self.exit_receiver(role, index) {
            let _ = rx.wait_for(|state| *state != ExitState::Running).await;
        }
    }

    fn exit_receiver(
        &self,
        role: TranscoderRole,
        index: usize,
    ) -> Option<watch::Receiver<ExitState>> {
        self.state
            .exits
            .lock()
            .get(&role)
            .and_then(|exits| exits.get(index))
            .cloned()
    }

    fn next_behavior(&self, role: TranscoderRole) -> StubBehavior {
        let launched = self.launch_count(role);
        self.state
            .behaviors
            .lock()
            .get(&role)
            .and_then(|behaviors| {
                behaviors
                    .get(launched)
                    .or_else(|| behaviors.last())
                    .cloned()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl TranscoderLauncher for StubLauncher {
    async fn launch(&self, request: LaunchRequest) -> Result<TranscoderHandle, TranscoderError> {
        let role = request.role;
        let behavior = self.next_behavior(role);
        self.state.launches.lock().push(request.clone());

        if behavior.fail_spawn {
            return Err(TranscoderError::SpawnFailed {
                program: request.program.display().to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "stub refused to start"),
            });
        }

        let (exit_tx, exit_rx) = watch::channel(ExitState::Running);
        let exit_tx = Arc::new(exit_tx);
        self.state
            .exits
            .lock()
            .entry(role)
            .or_default()
            .push(exit_rx.clone());

        let pid = 10_000 + self.state.next_pid.fetch_add(1, Ordering::Relaxed);
        let control = StubControl {
            pid,
            exit: Arc::clone(&exit_tx),
            exit_rx: exit_rx.clone(),
            ignore_stop: behavior.ignore_stop,
            exit_code: behavior.exit_code,
        };
        let mut handle = TranscoderHandle::new(role, request.args, Box::new(control));

        let (stderr_ours, stderr_theirs) = tokio::io::duplex(PIPE_CAPACITY);
        tokio::spawn(play_stderr(
            stderr_theirs,
            behavior.stderr_lines.clone(),
            exit_rx.clone(),
        ));
        handle = handle.with_stderr(Box::new(stderr_ours));

        if role.pipes_stdout() {
            let (stdout_ours, stdout_theirs) = tokio::io::duplex(PIPE_CAPACITY);
            tokio::spawn(play_stdout(
                stdout_theirs,
                behavior.clone(),
                Arc::clone(&exit_tx),
                exit_rx.clone(),
            ));
            handle = handle.with_stdout(Box::new(stdout_ours));
        }

        if role.pipes_stdin() {
            let data = Arc::new(Mutex::new(Vec::new()));
            let (closed_tx, closed_rx) = watch::channel(false);
            self.state
                .captured
                .lock()
                .entry(role)
                .or_default()
                .push(Capture {
                    data: Arc::clone(&data),
                    closed: closed_rx,
                });
            let (stdin_ours, stdin_theirs) = tokio::io::duplex(PIPE_CAPACITY);
            tokio::spawn(capture_stdin(
                stdin_theirs,
                data,
                behavior.accept_bytes,
                closed_tx,
            ));
            handle = handle.with_stdin(Box::new(stdin_ours));
        }

        Ok(handle)
    }
}

async fn play_stdout(
    mut pipe: DuplexStream,
    behavior: StubBehavior,
    exit: Arc<watch::Sender<ExitState>>,
    mut exit_rx: watch::Receiver<ExitState>,
) {
    let chunk_size = behavior.stdout_chunk.max(1);
    for chunk in behavior.stdout.chunks(chunk_size) {
        tokio::select! {
            result = pipe.write_all(chunk) => {
                if result.is_err() {
                    return;
                }
            }
            _ = exit_rx.wait_for(|state| *state != ExitState::Running) => return,
        }
    }

    if behavior.hold_stdout_open {
        let _ = exit_rx
            .wait_for(|state| *state != ExitState::Running)
            .await;
    } else {
        drop(pipe);
        // Stream ended, the process exits on its own
        exit.send_if_modified(|state| {
            if *state == ExitState::Running {
                *state = ExitState::Exited(Some(behavior.exit_code));
                true
            } else {
                false
            }
        });
    }
}

async fn play_stderr(
    mut pipe: DuplexStream,
    lines: Vec<String>,
    mut exit_rx: watch::Receiver<ExitState>,
) {
    for line in lines {
        let mut bytes = line.into_bytes();
        bytes.push(b'\n');
        tokio::select! {
            result = pipe.write_all(&bytes) => {
                if result.is_err() {
                    return;
                }
            }
            _ = exit_rx.wait_for(|state| *state != ExitState::Running) => return,
        }
    }
    let _ = exit_rx
        .wait_for(|state| *state != ExitState::Running)
        .await;
}

/// Reads stdin until EOF, like an encoder flushing its input on exit.
async fn capture_stdin(
    mut pipe: DuplexStream,
    capture: Arc<Mutex<Vec<u8>>>,
    accept_bytes: Option<usize>,
    closed: watch::Sender<bool>,
) {
    let mut buffer = vec![0u8; 8192];
    loop {
        let remaining = match accept_bytes {
            Some(limit) => {
                let taken = capture.lock().len();
                if taken >= limit {
                    // Destination closes; further writes see a broken pipe
                    break;
                }
                (limit - taken).min(buffer.len())
            }
            None => buffer.len(),
        };

        match pipe.read(&mut buffer[..remaining]).await {
            Ok(0) | Err(_) => break,
            Ok(n) => capture.lock().extend_from_slice(&buffer[..n]),
        }
    }
    drop(pipe);
    closed.send_replace(true);
}

struct StubControl {
    pid: u32,
    exit: Arc<watch::Sender<ExitState>>,
    exit_rx: watch::Receiver<ExitState>,
    ignore_stop: bool,
    exit_code: i32,
}

impl StubControl {
    fn mark_exited(&self, code: Option<i32>) {
        self.exit.send_if_modified(|state| {
            if *state == ExitState::Running {
                *state = ExitState::Exited(code);
                true
            } else {
                false
            }
        });
    }

    fn current(&self) -> ExitState {
        *self.exit_rx.borrow()
    }
}

#[async_trait]
impl ProcessControl for StubControl {
    fn id(&self) -> Option<u32> {
        match self.current() {
            ExitState::Running => Some(self.pid),
            ExitState::Exited(_) => None,
        }
    }

    fn request_stop(&mut self) -> io::Result<()> {
        if !self.ignore_stop {
            self.mark_exited(Some(self.exit_code));
        }
        Ok(())
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.mark_exited(None);
        Ok(())
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        let mut rx = self.exit_rx.clone();
        let state = *rx
            .wait_for(|state| *state != ExitState::Running)
            .await
            .map_err(|_| io::Error::other("stub process state dropped"))?;
        match state {
            ExitState::Exited(code) => Ok(code),
            ExitState::Running => Ok(None),
        }
    }

    fn try_wait(&mut self) -> io::Result<Option<Option<i32>>> {
        match self.current() {
            ExitState::Running => Ok(None),
            ExitState::Exited(code) => Ok(Some(code)),
        }
    }
}
