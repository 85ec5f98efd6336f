//! Spawning external run, debug and terminal processes.
//!
//! A spawned process runs in its own process group. On timeout, on an
//! explicit kill and when the future is dropped, the whole group is
//! killed and the child is reaped before `spawn` returns. Output is
//! captured up to a per-stream limit; anything beyond it is drained and
//! discarded, and the result says so. Invalid UTF-8 is replaced and
//! flagged the same way.

use std::future::Future;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;

use crate::error::IdeError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessOutput {
    /// `None` when the process was ended by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    /// Invalid UTF-8 in the stream was replaced with U+FFFD.
    pub stdout_lossy: bool,
    pub stderr_lossy: bool,
    pub duration_ms: u64,
}

/// Something that can run a command to completion. The session talks to
/// processes only through this trait.
pub trait ProcessSandbox: Send + Sync + 'static {
    /// Run `request`. A send on `kill` ends the process early with
    /// [`IdeError::Killed`]; dropping the sender does not.
    fn spawn(
        &self,
        request: SpawnRequest,
        kill: oneshot::Receiver<()>,
    ) -> impl Future<Output = Result<ProcessOutput, IdeError>> + Send;
}

/// Runs real OS processes through `tokio::process`.
#[derive(Debug, Clone)]
pub struct OsSandbox {
    output_limit: usize,
}

impl OsSandbox {
    pub fn new(output_limit: usize) -> Self {
        OsSandbox { output_limit }
    }
}

enum Outcome {
    Exited(ExitStatus),
    TimedOut,
    Killed,
}

impl ProcessSandbox for OsSandbox {
    async fn spawn(
        &self,
        request: SpawnRequest,
        kill: oneshot::Receiver<()>,
    ) -> Result<ProcessOutput, IdeError> {
        let started = Instant::now();
        let mut command = Command::new(&request.program);
        command
            .args(&request.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);
        if let Some(cwd) = &request.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|source| IdeError::Spawn {
            program: request.program.clone(),
            source,
        })?;
        let pid = child.id();
        log::info!("spawned `{}` (pid {pid:?})", request.program);

        let mut group = GroupGuard { pid };
        let stdout = tokio::spawn(capture(child.stdout.take(), self.output_limit));
        let stderr = tokio::spawn(capture(child.stderr.take(), self.output_limit));

        let outcome = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => Outcome::Exited(status),
                Err(err) => {
                    reap(&mut child, &mut group).await;
                    return Err(IdeError::Process {
                        program: request.program,
                        message: err.to_string(),
                    });
                }
            },
            _ = tokio::time::sleep(request.timeout) => Outcome::TimedOut,
            Ok(()) = kill => Outcome::Killed,
        };

        let status = match outcome {
            Outcome::Exited(status) => {
                // Stragglers that inherited the pipes would keep capture open.
                group.kill();
                status
            }
            Outcome::TimedOut => {
                log::warn!(
                    "`{}` (pid {pid:?}) exceeded {:?}; killing",
                    request.program,
                    request.timeout
                );
                reap(&mut child, &mut group).await;
                return Err(IdeError::Timeout {
                    program: request.program,
                    timeout: request.timeout,
                    pid,
                });
            }
            Outcome::Killed => {
                log::info!("killing `{}` (pid {pid:?}) on request", request.program);
                reap(&mut child, &mut group).await;
                return Err(IdeError::Killed(request.program));
            }
        };

        let stdout = stdout.await.map_err(|err| IdeError::Worker(err.to_string()))?;
        let stderr = stderr.await.map_err(|err| IdeError::Worker(err.to_string()))?;
        if stdout.truncated || stderr.truncated {
            log::warn!(
                "output of `{}` truncated to {} bytes per stream",
                request.program,
                self.output_limit
            );
        }
        let (stdout_truncated, stderr_truncated) = (stdout.truncated, stderr.truncated);
        let (stdout, stdout_lossy) = stdout.into_text();
        let (stderr, stderr_lossy) = stderr.into_text();
        if stdout_lossy || stderr_lossy {
            log::warn!("output of `{}` is not valid UTF-8; replaced", request.program);
        }
        Ok(ProcessOutput {
            exit_code: status.code(),
            stdout,
            stderr,
            stdout_truncated,
            stderr_truncated,
            stdout_lossy,
            stderr_lossy,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }
}

/// Kill the process group and wait for the child so no zombie remains.
async fn reap(child: &mut Child, group: &mut GroupGuard) {
    group.kill();
    if let Err(err) = child.start_kill() {
        log::debug!("start_kill: {err}");
    }
    if let Err(err) = child.wait().await {
        log::error!("failed to reap child: {err}");
    }
}

/// Kills the child's process group once, at the latest when dropped.
struct GroupGuard {
    pid: Option<u32>,
}

impl GroupGuard {
    fn kill(&mut self) {
        let Some(pid) = self.pid.take() else {
            return;
        };
        #[cfg(unix)]
        {
            use nix::sys::signal::{Signal, killpg};
            use nix::unistd::Pid;

            // ESRCH once the whole group has exited.
            if let Err(err) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                log::trace!("killpg({pid}): {err}");
            }
        }
        #[cfg(not(unix))]
        let _ = pid;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        self.kill();
    }
}

struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

impl Captured {
    /// The text and whether any bytes had to be replaced.
    fn into_text(self) -> (String, bool) {
        match String::from_utf8(self.bytes) {
            Ok(text) => (text, false),
            Err(err) => (String::from_utf8_lossy(err.as_bytes()).into_owned(), true),
        }
    }
}

async fn capture<R: AsyncRead + Unpin>(reader: Option<R>, limit: usize) -> Captured {
    let mut captured = Captured {
        bytes: Vec::new(),
        truncated: false,
    };
    let Some(mut reader) = reader else {
        return captured;
    };
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                let room = limit.saturating_sub(captured.bytes.len());
                if n > room {
                    captured.truncated = true;
                }
                captured.bytes.extend_from_slice(&chunk[..n.min(room)]);
            }
            Err(err) => {
                log::warn!("output capture stopped: {err}");
                captured.truncated = true;
                break;
            }
        }
    }
    captured
}
