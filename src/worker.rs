//! Long-lived worker processes.
//!
//! A [`Worker`] owns one child process that speaks the
//! [stdio protocol](crate::protocol). The runner assigns it one unit at a
//! time and polls it for completion; every status check is non-blocking so
//! one slow worker never stalls inspection of the others.
//!
//! # Lifecycle
//!
//! ```text
//!   start() ──► Running ──assign()──► busy ──FINISHED──► free ──┐
//!                  ▲                                            │
//!                  └──────────────── print_feedback() ◄─────────┘
//!
//!   stop() ──► Stopping ──EXITED + exit──► Stopped
//!   any state ──exit without EXITED──► Crashed
//! ```
//!
//! # Output handling
//!
//! Stdout and stderr are drained by background tasks. Stdout arrives as raw
//! chunks over a channel and is reassembled into lines by a
//! [`LineBuffer`](crate::protocol::LineBuffer); only complete lines are
//! scanned for sentinels. Stderr is accumulated in full for crash
//! diagnostics.
//!
//! # Crash detection
//!
//! A crash is noticed lazily, on the next [`is_free`](Worker::is_free),
//! [`is_running`](Worker::is_running) or [`is_crashed`](Worker::is_crashed)
//! call: the OS reports the process gone but no `EXITED` line was seen.
//! When the exit is observed, remaining stdout is first drained up to EOF
//! (bounded by [`EXIT_GRACE`]) so a sentinel written right before exiting is
//! never mistaken for a crash.

pub mod child;
pub mod tokens;

use std::fmt;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdin};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::aggregator::{ResultAggregator, UnitOutcome};
use crate::protocol::{self, LineBuffer, Message};
use crate::report::ReportError;
use crate::unit::{CommandTemplate, WorkUnit};

pub use tokens::{Token, TokenPool};

/// How long to wait for a dead worker's pipes to reach EOF.
pub const EXIT_GRACE: Duration = Duration::from_secs(2);

/// Result type for worker operations.
pub type WorkerResult<T> = Result<T, WorkerError>;

/// Errors raised by a worker.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// The OS refused to start the process.
    #[error("Failed to start worker `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    /// A unit was assigned while another one is still attributed to the
    /// worker. This is a bug in the caller.
    #[error("Worker {token} already has a test assigned")]
    AlreadyAssigned { token: usize },

    /// The unit's command line would span more than one protocol line.
    #[error("Cannot send {unit} to worker {token}: its command line contains a line break")]
    MultilineCommand { token: usize, unit: String },

    /// The worker's input stream is already closed.
    #[error("Worker {token} is not accepting commands")]
    NotAccepting { token: usize },

    /// The child process died without acknowledging.
    #[error("{0}")]
    Crashed(Box<CrashReport>),

    /// The unit's report could not be read.
    #[error(transparent)]
    Report(#[from] ReportError),

    /// I/O error talking to the process.
    #[error("Worker I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Everything known about a crashed worker.
#[derive(Debug, Clone)]
pub struct CrashReport {
    /// Token of the crashed worker.
    pub token: Option<usize>,

    /// The unit that was in flight, if any.
    pub unit: Option<String>,

    /// The last command line written to the worker.
    pub command: Option<String>,

    /// Exit status, if the process is gone.
    pub status: Option<ExitStatus>,

    /// All stdout captured from the worker.
    pub stdout: String,

    /// All stderr captured from the worker.
    pub stderr: String,
}

impl fmt::Display for CrashReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "The test runner process exited unexpectedly.")?;
        if let Some(token) = self.token {
            writeln!(f, "Worker token: {}", token)?;
        }
        if let Some(unit) = &self.unit {
            writeln!(f, "Unit: {}", unit)?;
        }
        writeln!(
            f,
            "Last executed command: {}",
            self.command.as_deref().unwrap_or("<none>")
        )?;
        match self.status {
            Some(status) => writeln!(f, "Exit status: {}", status)?,
            None => writeln!(f, "Exit status: <still running>")?,
        }
        writeln!(f)?;
        writeln!(f, "Standard output:")?;
        writeln!(f, "{}", self.stdout.trim_end())?;
        writeln!(f)?;
        writeln!(f, "Standard error:")?;
        write!(f, "{}", self.stderr.trim_end())
    }
}

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Accepting units.
    Running,
    /// `EXIT` was sent; waiting for the process to go away.
    Stopping,
    /// Exited gracefully and reaped.
    Stopped,
    /// Exited without `EXITED`.
    Crashed,
}

/// A unit handed back by [`Worker::print_feedback`].
#[derive(Debug)]
pub struct CompletedUnit {
    /// The unit, still owning its temp files.
    pub unit: WorkUnit,

    /// What the report said, or `None` if the unit produced no report.
    pub outcome: Option<UnitOutcome>,
}

/// Orchestrator-side handle to one long-lived child process.
pub struct Worker {
    token: Option<Token>,
    pid: Option<u32>,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    stdout_open: bool,
    stderr_buf: Arc<Mutex<Vec<u8>>>,
    stderr_task: Option<JoinHandle<()>>,
    lines: LineBuffer,
    captured_stdout: String,
    in_execution: usize,
    current: Option<WorkUnit>,
    last_command: Option<String>,
    assigned: usize,
    exited_seen: bool,
    exit_status: Option<ExitStatus>,
    state: WorkerState,
}

impl Worker {
    /// Spawns a worker running `command` (program followed by arguments).
    ///
    /// The child sees `SPLITRUN=1` and, if a token is given, `TEST_TOKEN`
    /// and `UNIQUE_TEST_TOKEN`. `env` is applied last.
    pub fn start(
        command: &[String],
        token: Option<Token>,
        env: &[(String, String)],
    ) -> WorkerResult<Self> {
        let command_line = shell_words::join(command);
        let Some((program, args)) = command.split_first() else {
            return Err(WorkerError::Spawn {
                command: command_line,
                source: io::Error::new(io::ErrorKind::InvalidInput, "empty worker command"),
            });
        };

        let mut process = tokio::process::Command::new(program);
        process
            .args(args)
            .env(protocol::ENV_MARKER, "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(token) = &token {
            process
                .env(protocol::ENV_TOKEN, token.id.to_string())
                .env(protocol::ENV_UNIQUE_TOKEN, &token.unique);
        }
        for (key, value) in env {
            process.env(key, value);
        }

        let mut child = process.spawn().map_err(|source| WorkerError::Spawn {
            command: command_line.clone(),
            source,
        })?;

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("worker stdout was not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::other("worker stderr was not captured"))?;

        let (tx, stdout_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut stdout = stdout;
            let mut buf = vec![0u8; 8192];
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let stderr_buf = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&stderr_buf);
        let stderr_task = tokio::spawn(async move {
            let mut stderr = stderr;
            let mut buf = vec![0u8; 8192];
            loop {
                match stderr.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if let Ok(mut sink) = sink.lock() {
                            sink.extend_from_slice(&buf[..n]);
                        }
                    }
                }
            }
        });

        let pid = child.id();
        debug!(
            token = token.as_ref().map(|t| t.id),
            pid, "Started worker: {}", command_line
        );

        Ok(Self {
            token,
            pid,
            child,
            stdin,
            stdout_rx,
            stdout_open: true,
            stderr_buf,
            stderr_task: Some(stderr_task),
            lines: LineBuffer::new(),
            captured_stdout: String::new(),
            in_execution: 0,
            current: None,
            last_command: None,
            assigned: 0,
            exited_seen: false,
            exit_status: None,
            state: WorkerState::Running,
        })
    }

    /// The worker's token, if it was started with one.
    pub fn token(&self) -> Option<&Token> {
        self.token.as_ref()
    }

    fn token_id(&self) -> usize {
        self.token.as_ref().map(|t| t.id).unwrap_or(0)
    }

    /// OS process id, as recorded at spawn time.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Number of units written to the worker and not yet acknowledged.
    pub fn in_execution(&self) -> usize {
        self.in_execution
    }

    /// Number of units assigned since the process started.
    pub fn assigned(&self) -> usize {
        self.assigned
    }

    /// The unit currently attributed to this worker.
    pub fn current_unit(&self) -> Option<&WorkUnit> {
        self.current.as_ref()
    }

    /// The last command line written to the worker.
    pub fn last_command(&self) -> Option<&str> {
        self.last_command.as_deref()
    }

    /// Writes `unit`'s command to the worker.
    ///
    /// Fails with [`WorkerError::AlreadyAssigned`] if a unit is still
    /// attributed to this worker (in flight, or finished but not yet
    /// flushed with [`print_feedback`](Self::print_feedback)).
    pub async fn assign(
        &mut self,
        mut unit: WorkUnit,
        template: &CommandTemplate,
    ) -> WorkerResult<()> {
        if self.current.is_some() || self.in_execution > 0 {
            return Err(WorkerError::AlreadyAssigned {
                token: self.token_id(),
            });
        }

        let token = self.token.as_ref().map(|t| t.id);
        let line = template.render_line(&mut unit, token)?;
        if line.contains(['\n', '\r']) {
            return Err(WorkerError::MultilineCommand {
                token: self.token_id(),
                unit: unit.to_string(),
            });
        }
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(WorkerError::NotAccepting {
                token: self.token_id(),
            });
        };
        protocol::write_line(stdin, &line).await?;

        debug!(token, unit = %unit, "Assigned: {}", line);
        self.in_execution += 1;
        self.assigned += 1;
        self.last_command = Some(line);
        self.current = Some(unit);
        Ok(())
    }

    /// Returns `true` if the worker has no unit in flight.
    ///
    /// Raises the crash diagnostics if the worker died.
    pub async fn is_free(&mut self) -> WorkerResult<bool> {
        self.check_crashed().await?;
        self.read_available();
        Ok(self.in_execution == 0)
    }

    /// Returns `true` while the process is alive and has not said `EXITED`.
    pub async fn is_running(&mut self) -> WorkerResult<bool> {
        self.read_available();
        if self.exited_seen {
            return Ok(false);
        }
        Ok(self.poll_exit().await?.is_none())
    }

    /// Returns `true` if the process exited without saying `EXITED`.
    pub async fn is_crashed(&mut self) -> WorkerResult<bool> {
        self.read_available();
        if self.state == WorkerState::Crashed {
            return Ok(true);
        }
        if self.poll_exit().await?.is_none() || self.exited_seen {
            return Ok(false);
        }
        warn!(
            token = self.token.as_ref().map(|t| t.id),
            pid = self.pid,
            "Worker exited without acknowledging"
        );
        self.state = WorkerState::Crashed;
        Ok(true)
    }

    /// Fails with the crash diagnostics if the worker crashed.
    pub async fn check_crashed(&mut self) -> WorkerResult<()> {
        if self.is_crashed().await? {
            Err(self.crash_error().await)
        } else {
            Ok(())
        }
    }

    /// Builds a [`WorkerError::Crashed`] from everything captured so far.
    pub async fn crash_error(&mut self) -> WorkerError {
        WorkerError::Crashed(Box::new(self.crash_report().await))
    }

    /// Collects the diagnostics for a crash.
    pub async fn crash_report(&mut self) -> CrashReport {
        self.read_available();
        if self.exit_status.is_some()
            && let Some(task) = self.stderr_task.take()
            && tokio::time::timeout(EXIT_GRACE, task).await.is_err()
        {
            debug!("Worker stderr did not close in time");
        }

        let stderr = self
            .stderr_buf
            .lock()
            .map(|buf| String::from_utf8_lossy(&buf).into_owned())
            .unwrap_or_default();
        let mut stdout = self.captured_stdout.clone();
        if let Some(rest) = self.lines.take_remainder() {
            stdout.push_str(&rest);
        }

        CrashReport {
            token: self.token.as_ref().map(|t| t.id),
            unit: self.current.as_ref().map(|u| u.to_string()),
            command: self.last_command.clone(),
            status: self.exit_status,
            stdout,
            stderr,
        }
    }

    /// Hands the finished unit to `aggregator` and clears the attribution.
    ///
    /// Returns `None` if no unit is attributed or it is still in flight. An
    /// empty report is treated as a crash of this worker.
    pub async fn print_feedback(
        &mut self,
        aggregator: &mut ResultAggregator,
    ) -> WorkerResult<Option<CompletedUnit>> {
        if self.in_execution > 0 {
            return Ok(None);
        }
        let Some(unit) = self.current.as_ref() else {
            return Ok(None);
        };

        match aggregator.consume(unit) {
            Ok(outcome) => {
                let unit = self.current.take().ok_or_else(|| io::Error::other("unit vanished"))?;
                Ok(Some(CompletedUnit { unit, outcome }))
            }
            Err(ReportError::EmptyReport { .. }) => {
                let error = self.crash_error().await;
                self.current = None;
                Err(error)
            }
            Err(e) => {
                self.current = None;
                Err(e.into())
            }
        }
    }

    /// Asks the worker to exit by sending `EXIT` and closing its input.
    ///
    /// Does not wait for the process.
    pub async fn stop(&mut self) -> WorkerResult<()> {
        if let Some(mut stdin) = self.stdin.take() {
            // The child may already be gone.
            if let Err(e) = protocol::write_line(&mut stdin, protocol::EXIT).await {
                debug!(token = self.token_id(), "Failed to send EXIT: {}", e);
            }
        }
        if self.state == WorkerState::Running {
            self.state = WorkerState::Stopping;
        }
        Ok(())
    }

    /// Waits for the process to exit and releases its resources.
    pub async fn wait(&mut self) -> WorkerResult<ExitStatus> {
        let status = match self.exit_status {
            Some(status) => status,
            None => {
                let status = self.child.wait().await?;
                self.exit_status = Some(status);
                self.drain_to_eof().await;
                status
            }
        };
        if self.state != WorkerState::Crashed {
            self.state = WorkerState::Stopped;
        }
        Ok(status)
    }

    /// Kills the process without waiting for it.
    pub fn kill(&mut self) {
        if let Err(e) = self.child.start_kill() {
            debug!(token = self.token_id(), "Failed to kill worker: {}", e);
        }
    }

    /// Drains whatever stdout is available without blocking.
    fn read_available(&mut self) {
        while self.stdout_open {
            match self.stdout_rx.try_recv() {
                Ok(chunk) => self.handle_chunk(&chunk),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => self.stdout_open = false,
            }
        }
    }

    /// Reads stdout until EOF, for a process that is known to be gone.
    async fn drain_to_eof(&mut self) {
        let deadline = tokio::time::Instant::now() + EXIT_GRACE;
        while self.stdout_open {
            match tokio::time::timeout_at(deadline, self.stdout_rx.recv()).await {
                Ok(Some(chunk)) => self.handle_chunk(&chunk),
                Ok(None) => self.stdout_open = false,
                Err(_) => {
                    warn!(
                        token = self.token_id(),
                        "Worker stdout still open {:?} after exit", EXIT_GRACE
                    );
                    break;
                }
            }
        }
    }

    fn handle_chunk(&mut self, chunk: &[u8]) {
        for line in self.lines.push(chunk) {
            self.captured_stdout.push_str(&line);
            self.captured_stdout.push('\n');

            match Message::parse(&line) {
                Message::Finished(prefix) => {
                    if !prefix.is_empty() {
                        debug!(token = self.token_id(), "{}", prefix);
                    }
                    self.in_execution = self.in_execution.saturating_sub(1);
                }
                Message::Exited(_) => self.exited_seen = true,
                Message::Output(text) => debug!(token = self.token_id(), "{}", text),
            }
        }
    }

    /// Probes the OS for the exit status without blocking.
    async fn poll_exit(&mut self) -> WorkerResult<Option<ExitStatus>> {
        if let Some(status) = self.exit_status {
            return Ok(Some(status));
        }
        match self.child.try_wait()? {
            None => Ok(None),
            Some(status) => {
                debug!(token = self.token_id(), pid = self.pid, "Worker exited: {}", status);
                self.exit_status = Some(status);
                self.drain_to_eof().await;
                Ok(Some(status))
            }
        }
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("token", &self.token)
            .field("pid", &self.pid)
            .field("state", &self.state)
            .field("in_execution", &self.in_execution)
            .field("assigned", &self.assigned)
            .field("last_command", &self.last_command)
            .finish()
    }
}
