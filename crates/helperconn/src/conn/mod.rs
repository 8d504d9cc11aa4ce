//! Stream connection over a helper's stdin/stdout
//!
//! [`CommandConn`] turns a spawned helper into something a protocol client
//! can treat as a socket: bytes written go to the helper's stdin, bytes read
//! come from its stdout. Each half can be closed on its own, and closing the
//! whole connection reaps the helper exactly once.
//!
//! All operations take `&self`, so one task may read while another writes.
//! Each direction is serialized by its own lock; a second concurrent read
//! waits for the first rather than interleaving with it.
//!
//! # Deadlines
//!
//! Read and write deadlines are emulated by racing the pipe operation against
//! a timer. An expired read leaves the stream intact, since no bytes are
//! consumed by an abandoned read. An expired write may already have handed a
//! prefix of the buffer to the pipe; the connection stays usable, but the
//! caller cannot know how much of that buffer the helper received.

mod deadline;
mod io;

pub use deadline::ConnState;
pub use io::ConnIo;

use std::fmt;
use std::process::ExitStatus;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::{Mutex, OnceCell, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};

use crate::attributes::ProcessAttributes;
use crate::config::ConnConfig;
use crate::error::{ConnError, Result};
use crate::exit::{ExitState, StderrTail};
use crate::spawner::SpawnedProcess;
use deadline::{Deadline, Direction};

/// Upper bound on waiting for a helper that broke its stdin pipe to exit
const BROKEN_PIPE_EXIT_WAIT: Duration = Duration::from_secs(1);

/// Upper bound on waiting for the stderr drain once the helper has exited
const STDERR_SETTLE: Duration = Duration::from_millis(500);

/// Descriptive address of one end of a helper connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperAddr(String);

impl fmt::Display for HelperAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Bidirectional stream backed by a helper process
#[derive(Debug)]
pub struct CommandConn {
    command: String,
    pid: Option<u32>,
    stdin: Mutex<Option<ChildStdin>>,
    stdout: Mutex<Option<ChildStdout>>,
    child: Mutex<Child>,
    exit: OnceLock<ExitStatus>,
    stderr: Arc<StderrTail>,
    stderr_task: Mutex<Option<JoinHandle<()>>>,
    attributes: Arc<dyn ProcessAttributes>,
    state: watch::Sender<ConnState>,
    read_deadline: Deadline,
    write_deadline: Deadline,
    closed: OnceCell<Result<()>>,
    grace_period: Duration,
    exit_wait: Duration,
}

impl CommandConn {
    /// Wrap a spawned helper
    pub fn new(process: SpawnedProcess, config: &ConnConfig) -> Self {
        let SpawnedProcess {
            command,
            child,
            stdin,
            stdout,
            stderr,
            stderr_task,
            attributes,
        } = process;

        Self {
            command,
            pid: child.id(),
            stdin: Mutex::new(Some(stdin)),
            stdout: Mutex::new(Some(stdout)),
            child: Mutex::new(child),
            exit: OnceLock::new(),
            stderr,
            stderr_task: Mutex::new(Some(stderr_task)),
            attributes,
            state: watch::channel(ConnState::default()).0,
            read_deadline: Deadline::new(),
            write_deadline: Deadline::new(),
            closed: OnceCell::new(),
            grace_period: config.grace_period,
            exit_wait: config.exit_wait,
        }
    }

    /// Read bytes produced by the helper
    ///
    /// Returns `Ok(0)` once the helper has closed its stdout and exited with
    /// status 0. If it exited otherwise (or closed stdout without exiting
    /// within the configured wait) the end of stream is reported as
    /// [`ConnError::UnexpectedEof`] carrying the [`ExitState`].
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.check(Direction::Read)?;
        let mut stdout = self.stdout.lock().await;
        self.check(Direction::Read)?;
        let Some(pipe) = stdout.as_mut() else {
            return Err(ConnError::ClosedRead);
        };
        if buf.is_empty() {
            return Ok(0);
        }

        let n = self
            .read_deadline
            .race(Direction::Read, &self.state, async {
                Ok::<_, ConnError>(pipe.read(buf).await?)
            })
            .await?;
        if n > 0 {
            return Ok(n);
        }

        drop(stdout);
        let exit = self.exit_state(self.exit_wait).await;
        self.check(Direction::Read)?;
        if exit.success() {
            tracing::debug!(pid = self.pid, "helper stdout reached end of stream");
            Ok(0)
        } else {
            tracing::debug!(pid = self.pid, %exit, "helper ended its stream abnormally");
            Err(ConnError::UnexpectedEof(exit))
        }
    }

    /// Write bytes to the helper
    ///
    /// Completes once the whole buffer has been handed to the pipe. Writes
    /// are delivered in call order.
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        self.check(Direction::Write)?;
        let mut stdin = self.stdin.lock().await;
        self.check(Direction::Write)?;
        let Some(pipe) = stdin.as_mut() else {
            return Err(ConnError::ClosedWrite);
        };

        let res = self
            .write_deadline
            .race(Direction::Write, &self.state, async {
                pipe.write_all(buf).await?;
                pipe.flush().await?;
                Ok::<_, ConnError>(buf.len())
            })
            .await;

        match res {
            Err(ConnError::BrokenPipe(None)) => {
                drop(stdin);
                let exit = self.exit_state(BROKEN_PIPE_EXIT_WAIT.min(self.exit_wait)).await;
                tracing::debug!(pid = self.pid, %exit, "helper stdin is broken");
                Err(ConnError::BrokenPipe(exit.status.is_some().then_some(exit)))
            }
            other => other,
        }
    }

    /// Close the helper's stdin, signalling end of input
    ///
    /// Waits for an in-flight write to finish first. Reading is unaffected.
    /// Calling it again, or after [`close`](Self::close), is a no-op.
    pub async fn close_write(&self) -> Result<()> {
        let mut stdin = self.stdin.lock().await;
        let Some(mut pipe) = stdin.take() else {
            return Ok(());
        };
        self.state.send_if_modified(|s| !std::mem::replace(&mut s.write_closed, true));
        tracing::debug!(pid = self.pid, "closing helper stdin");

        match pipe.shutdown().await {
            Err(err) if err.kind() != std::io::ErrorKind::BrokenPipe => Err(err.into()),
            _ => Ok(()),
        }
    }

    /// Stop reading from the helper
    ///
    /// Later reads fail with [`ConnError::ClosedRead`]; an in-flight read is
    /// abandoned. Writing is unaffected.
    pub async fn close_read(&self) -> Result<()> {
        self.state.send_if_modified(|s| !std::mem::replace(&mut s.read_closed, true));
        if self.stdout.lock().await.take().is_some() {
            tracing::debug!(pid = self.pid, "closing helper stdout");
        }
        Ok(())
    }

    /// Close both halves and reap the helper
    ///
    /// Asks a still-running helper to terminate, forcibly kills it if it has
    /// not exited after the grace period, then waits for it. Only the first
    /// call does this work; every call returns the first call's outcome.
    pub async fn close(&self) -> Result<()> {
        self.closed.get_or_init(|| self.teardown()).await.clone()
    }

    async fn teardown(&self) -> Result<()> {
        self.state.send_if_modified(|s| !std::mem::replace(&mut s.closed, true));
        tracing::debug!(pid = self.pid, command = %self.command, "closing helper connection");

        drop(self.stdin.lock().await.take());
        drop(self.stdout.lock().await.take());

        let mut child = self.child.lock().await;
        let result = match child.try_wait() {
            Ok(Some(status)) => {
                self.record_exit(status);
                Ok(())
            }
            Ok(None) => self.terminate(&mut child).await,
            Err(err) => Err(err.into()),
        };
        drop(child);

        self.settle_stderr().await;
        result
    }

    async fn terminate(&self, child: &mut Child) -> Result<()> {
        if let Err(err) = self.attributes.terminate(child) {
            tracing::warn!(pid = self.pid, error = %err, "failed to request helper termination");
        }

        match timeout(self.grace_period, child.wait()).await {
            Ok(Ok(status)) => {
                self.record_exit(status);
                return Ok(());
            }
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => {
                tracing::warn!(
                    pid = self.pid,
                    grace_period = ?self.grace_period,
                    "helper ignored termination request, killing"
                );
            }
        }

        child.kill().await?;
        if let Ok(Some(status)) = child.try_wait() {
            self.record_exit(status);
        }
        Ok(())
    }

    /// Set both the read and write deadline
    ///
    /// `None` clears the deadline. Takes effect for operations already in
    /// flight.
    pub fn set_deadline(&self, at: Option<Instant>) {
        self.set_read_deadline(at);
        self.set_write_deadline(at);
    }

    /// Set the read deadline
    pub fn set_read_deadline(&self, at: Option<Instant>) {
        self.read_deadline.set(at);
    }

    /// Set the write deadline
    pub fn set_write_deadline(&self, at: Option<Instant>) {
        self.write_deadline.set(at);
    }

    /// Current read deadline
    pub fn read_deadline(&self) -> Option<Instant> {
        self.read_deadline.get()
    }

    /// Current write deadline
    pub fn write_deadline(&self) -> Option<Instant> {
        self.write_deadline.get()
    }

    /// Snapshot of the half-close flags
    pub fn state(&self) -> ConnState {
        *self.state.borrow()
    }

    /// OS process id of the helper
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Exit status, once the helper has been observed to exit
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit.get().copied()
    }

    /// What the helper has written to stderr so far (bounded tail)
    pub fn stderr(&self) -> String {
        self.stderr.snapshot()
    }

    /// Local end of the connection
    pub fn local_addr(&self) -> HelperAddr {
        HelperAddr("helper".to_string())
    }

    /// Remote end of the connection, described by the helper command line
    pub fn peer_addr(&self) -> HelperAddr {
        HelperAddr(self.command.clone())
    }

    /// Adapt into a tokio `AsyncRead + AsyncWrite` stream
    pub fn into_io(self) -> ConnIo {
        ConnIo::new(Arc::new(self))
    }

    fn check(&self, direction: Direction) -> Result<()> {
        match self.state.borrow().refusal(direction) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn record_exit(&self, status: ExitStatus) {
        if self.exit.set(status).is_ok() {
            tracing::debug!(pid = self.pid, %status, "helper exited");
        }
    }

    async fn wait_exit(&self, wait: Duration) -> Option<ExitStatus> {
        if let Some(status) = self.exit.get() {
            return Some(*status);
        }
        let mut state_rx = self.state.subscribe();
        let mut child = self.child.lock().await;
        let waited = tokio::select! {
            waited = timeout(wait, child.wait()) => waited,
            _ = state_rx.wait_for(|s| s.closed) => return None,
        };
        match waited {
            Ok(Ok(status)) => {
                self.record_exit(status);
                Some(status)
            }
            Ok(Err(err)) => {
                tracing::warn!(pid = self.pid, error = %err, "failed to wait for helper");
                None
            }
            Err(_) => None,
        }
    }

    async fn settle_stderr(&self) {
        let mut task = self.stderr_task.lock().await;
        if let Some(handle) = task.as_mut()
            && timeout(STDERR_SETTLE, handle).await.is_ok()
        {
            *task = None;
        }
    }

    async fn exit_state(&self, wait: Duration) -> ExitState {
        let status = self.wait_exit(wait).await;
        if status.is_some() {
            self.settle_stderr().await;
        }
        ExitState {
            command: self.command.clone(),
            status,
            stderr: self.stderr.snapshot(),
        }
    }
}
