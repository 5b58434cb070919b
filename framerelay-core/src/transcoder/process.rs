//! Subprocess-backed transcoder launcher

use std::io;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};

use super::handle::{ProcessControl, TranscoderHandle};
use super::{LaunchRequest, TranscoderError, TranscoderLauncher};

/// Launches transcoders as child processes with piped stdio.
#[derive(Debug, Clone, Default)]
pub struct ProcessLauncher;

impl ProcessLauncher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TranscoderLauncher for ProcessLauncher {
    async fn launch(&self, request: LaunchRequest) -> Result<TranscoderHandle, TranscoderError> {
        let role = request.role;
        let program = request.program.display().to_string();

        let mut cmd = Command::new(&request.program);
        cmd.args(&request.args)
            .stdin(if role.pipes_stdin() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(if role.pipes_stdout() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::info!(%role, %program, "Starting transcoder");
        tracing::debug!("Transcoder command: {:?}", cmd);

        let mut child = cmd.spawn().map_err(|source| {
            tracing::error!(%role, %program, "Failed to spawn transcoder: {}", source);
            TranscoderError::SpawnFailed {
                program: program.clone(),
                source,
            }
        })?;

        let stdout = child.stdout.take();
        let stdin = child.stdin.take();
        let stderr = child.stderr.take();

        tracing::debug!(%role, pid = ?child.id(), "Transcoder started");

        let mut handle =
            TranscoderHandle::new(role, request.args, Box::new(ChildControl { child }));
        if let Some(stdout) = stdout {
            handle = handle.with_stdout(Box::new(stdout));
        }
        if let Some(stdin) = stdin {
            handle = handle.with_stdin(Box::new(stdin));
        }
        if let Some(stderr) = stderr {
            handle = handle.with_stderr(Box::new(stderr));
        }

        Ok(handle)
    }
}

struct ChildControl {
    child: Child,
}

#[async_trait]
impl ProcessControl for ChildControl {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn request_stop(&mut self) -> io::Result<()> {
        send_terminate(&mut self.child)
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.child.kill().await
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        self.child.wait().await.map(|status| status.code())
    }

    fn try_wait(&mut self) -> io::Result<Option<Option<i32>>> {
        Ok(self.child.try_wait()?.map(|status| status.code()))
    }
}

impl Drop for ChildControl {
    fn drop(&mut self) {
        // Best effort cleanup
        let _ = self.child.start_kill();
    }
}

#[cfg(unix)]
fn send_terminate(child: &mut Child) -> io::Result<()> {
    let Some(pid) = child.id() else {
        // Already reaped
        return Ok(());
    };
    // SAFETY: kill(2) has no memory-safety preconditions; the pid belongs to
    // a child we have not reaped yet.
    let ret = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) -> io::Result<()> {
    child.start_kill()
}
