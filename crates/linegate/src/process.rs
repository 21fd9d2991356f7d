//! Child process adapter.
//!
//! Spawns the child with piped stdio and turns its lifecycle into a single
//! ordered event stream:
//! - stdout chunks as `ProcessEvent::Output`
//! - stderr chunks as `ProcessEvent::Diagnostic`
//! - exactly one `ProcessEvent::Exited`, sent after both pipes have drained
//!
//! Input goes through `ProcessHandle::write`, which queues a record for a
//! writer task that owns stdin.

use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::AsyncRead;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::bytes::Bytes;
use tokio_util::codec::FramedWrite;
use tokio_util::io::ReaderStream;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::bridge::{LineFramer, RawRecord};

const EVENT_BUFFER: usize = 256;
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] io::Error),
    #[error("child {0} not captured")]
    PipeNotCaptured(&'static str),
}

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("child stdin is closed (process exited)")]
    Closed,
}

/// How the child was launched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildCommand {
    program: String,
    args: Vec<String>,
}

impl ChildCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Run a full command line through the platform shell.
    pub fn shell(command_line: impl Into<String>) -> Self {
        #[cfg(windows)]
        let cmd = Self::new("cmd").arg("/C").arg(command_line);
        #[cfg(not(windows))]
        let cmd = Self::new("sh").arg("-c").arg(command_line);
        cmd
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }
}

impl std::fmt::Display for ChildCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Exit information reported once per child lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ChildExit {
    /// Exit status was not observable (wait failed or channel closed).
    pub fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }

    /// Host status to propagate: the child's code, else 1.
    pub fn status_code(&self) -> i32 {
        self.code.unwrap_or(1)
    }
}

impl From<ExitStatus> for ChildExit {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Output(Bytes),
    Diagnostic(Bytes),
    Exited(ChildExit),
}

pub type ProcessEvents = mpsc::Receiver<ProcessEvent>;

/// Handle to the running child. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: Option<u32>,
    stdin_tx: mpsc::UnboundedSender<RawRecord>,
    kill: CancellationToken,
    exited: CancellationToken,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Queue one line for the child's stdin. A newline is appended.
    pub fn write(&self, record: RawRecord) -> Result<(), WriteError> {
        if self.exited.is_cancelled() {
            return Err(WriteError::Closed);
        }
        self.stdin_tx.send(record).map_err(|_| WriteError::Closed)
    }

    /// Request termination. Safe to call repeatedly or after exit.
    pub fn kill(&self) {
        self.kill.cancel();
    }

    pub fn has_exited(&self) -> bool {
        self.exited.is_cancelled()
    }

    /// Resolves as soon as the child has been reaped, even while a
    /// descendant still holds its output pipes open.
    pub fn exited(&self) -> WaitForCancellationFutureOwned {
        self.exited.clone().cancelled_owned()
    }
}

/// Spawn the child and start forwarding its stdio.
pub fn start(command: &ChildCommand) -> Result<(ProcessHandle, ProcessEvents), SpawnError> {
    let mut child = command
        .to_command()
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let pid = child.id();
    let stdin = child
        .stdin
        .take()
        .ok_or(SpawnError::PipeNotCaptured("stdin"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or(SpawnError::PipeNotCaptured("stdout"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or(SpawnError::PipeNotCaptured("stderr"))?;

    tracing::debug!(?pid, %command, "Spawned child process");

    let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
    let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
    let kill = CancellationToken::new();
    let exited = CancellationToken::new();

    tokio::spawn(write_stdin(stdin, stdin_rx, exited.clone()));
    let stdout_task = tokio::spawn(forward_stream(
        stdout,
        event_tx.clone(),
        ProcessEvent::Output,
    ));
    let stderr_task = tokio::spawn(forward_stream(
        stderr,
        event_tx.clone(),
        ProcessEvent::Diagnostic,
    ));
    tokio::spawn(supervise(
        child,
        kill.clone(),
        exited.clone(),
        [stdout_task, stderr_task],
        event_tx,
    ));

    let handle = ProcessHandle {
        pid,
        stdin_tx,
        kill,
        exited,
    };
    Ok((handle, event_rx))
}

async fn write_stdin(
    stdin: ChildStdin,
    mut rx: mpsc::UnboundedReceiver<RawRecord>,
    exited: CancellationToken,
) {
    let mut writer = FramedWrite::new(stdin, LineFramer::new());
    loop {
        tokio::select! {
            record = rx.recv() => {
                let Some(record) = record else { break };
                if let Err(e) = writer.send(record).await {
                    tracing::warn!(error = %e, "Failed to write to child stdin");
                }
            }
            _ = exited.cancelled() => break,
        }
    }
    tracing::trace!("Child stdin writer exiting");
}

async fn forward_stream<R>(
    reader: R,
    events: mpsc::Sender<ProcessEvent>,
    wrap: fn(Bytes) -> ProcessEvent,
) where
    R: AsyncRead + Unpin,
{
    let mut stream = ReaderStream::new(reader);
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => {
                if events.send(wrap(bytes)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read child output");
                break;
            }
        }
    }
}

async fn supervise(
    mut child: Child,
    kill: CancellationToken,
    exited: CancellationToken,
    readers: [JoinHandle<()>; 2],
    events: mpsc::Sender<ProcessEvent>,
) {
    let waited = tokio::select! {
        status = child.wait() => Some(status),
        _ = kill.cancelled() => None,
    };
    let status = match waited {
        Some(status) => status,
        None => terminate(&mut child).await,
    };
    exited.cancel();

    let exit = match status {
        Ok(status) => ChildExit::from(status),
        Err(e) => {
            tracing::error!(error = %e, "Failed to wait for child process");
            ChildExit::unknown()
        }
    };

    // Relay whatever the child printed before exiting ahead of the exit event.
    let drain = async {
        for reader in readers {
            let _ = reader.await;
        }
    };
    if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, drain).await.is_err() {
        tracing::debug!("Child output still open after exit, not waiting further");
    }

    let _ = events.send(ProcessEvent::Exited(exit)).await;
}

/// SIGTERM first, SIGKILL if the child lingers past the grace period.
async fn terminate(child: &mut Child) -> io::Result<ExitStatus> {
    if request_termination(child)
        && let Ok(status) = tokio::time::timeout(TERMINATE_GRACE, child.wait()).await
    {
        return status;
    }
    if let Err(e) = child.start_kill() {
        tracing::debug!(error = %e, "Failed to kill child process");
    }
    child.wait().await
}

#[cfg(unix)]
fn request_termination(child: &Child) -> bool {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return false;
    };
    match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!(pid, error = %e, "Failed to send SIGTERM to child");
            false
        }
    }
}

#[cfg(not(unix))]
fn request_termination(_child: &Child) -> bool {
    false
}
