/// Child process lifecycle: spawn, stream output, observe exit, restart.
///
/// At most one child exists at a time. A restart requested while a child
/// runs is remembered and applied when that child exits; the running
/// child is never killed to make room.
use crate::config::ChildConfig;
use crate::console::Console;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};

/// The fixed command line of the supervised program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ChildCommand {
    /// Relative programs with a path component resolve against `cwd`;
    /// bare names are left to `PATH` lookup.
    pub fn resolve(config: &ChildConfig, cwd: &Path) -> Self {
        let program = Path::new(&config.command);
        let program = if program.is_relative() && program.components().count() > 1 {
            cwd.join(program)
        } else {
            program.to_path_buf()
        };
        Self {
            program,
            args: config.args.clone(),
        }
    }
}

impl std::fmt::Display for ChildCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Starting,
    Running,
}

/// How a child ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    pub pid: u32,
    /// Exit code (None if killed by signal).
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub duration: Duration,
}

impl ExitReport {
    fn from_status(pid: u32, status: Option<ExitStatus>, duration: Duration) -> Self {
        Self {
            pid,
            exit_code: status.and_then(|s| s.code()),
            signal: status.and_then(|s| s.signal()),
            duration,
        }
    }
}

impl std::fmt::Display for ExitReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let secs = self.duration.as_secs_f64();
        match (self.exit_code, self.signal) {
            (Some(code), _) => write!(f, "process exited with code {code} after {secs:.1}s"),
            (None, Some(sig)) => write!(f, "process terminated by signal {sig} after {secs:.1}s"),
            (None, None) => write!(f, "process ended with unknown status after {secs:.1}s"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started { pid: u32 },
    /// A child is running; a restart will follow its exit.
    Queued,
    Failed,
}

#[derive(Debug)]
pub enum ChildEvent {
    Stdout(String),
    Stderr(String),
    Exited(ExitReport),
}

/// The child could not be spawned.
#[derive(Debug)]
pub struct SpawnError {
    pub program: PathBuf,
    pub source: std::io::Error,
}

impl std::fmt::Display for SpawnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "failed to spawn {}: {}", self.program.display(), self.source)
    }
}

impl std::error::Error for SpawnError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// How long pipe output is still read after the child's exit is observed.
/// A grandchild that inherited the pipes may keep them open indefinitely.
const EXIT_DRAIN: Duration = Duration::from_millis(200);

/// Line reader over a child pipe. Bytes are decoded lossily so that
/// non-UTF-8 output never closes the pipe under the child.
struct OutputPipe<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> OutputPipe<R> {
    fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            buf: Vec::new(),
        }
    }

    /// Next line without its terminator; `None` at EOF.
    ///
    /// Partial reads stay in `buf` across cancellation, so this is safe
    /// to race in `select!`.
    async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        let n = self.reader.read_until(b'\n', &mut self.buf).await?;
        if n == 0 && self.buf.is_empty() {
            return Ok(None);
        }
        let mut end = self.buf.len();
        if self.buf[..end].ends_with(b"\n") {
            end -= 1;
        }
        if self.buf[..end].ends_with(b"\r") {
            end -= 1;
        }
        let line = String::from_utf8_lossy(&self.buf[..end]).into_owned();
        self.buf.clear();
        Ok(Some(line))
    }
}

struct RunningChild {
    child: Child,
    pid: u32,
    stdout: Option<OutputPipe<ChildStdout>>,
    stderr: Option<OutputPipe<ChildStderr>>,
    started: Instant,
    /// Exit status once observed, with the deadline for draining the pipes.
    exited: Option<(Option<ExitStatus>, Duration, tokio::time::Instant)>,
}

async fn next_line<R: AsyncRead + Unpin>(
    pipe: &mut Option<OutputPipe<R>>,
) -> std::io::Result<Option<String>> {
    match pipe {
        Some(pipe) => pipe.next_line().await,
        None => std::future::pending().await,
    }
}

impl RunningChild {
    /// Exit is reported after the remaining pipe output has been read,
    /// so every line precedes the exit banner. Draining is bounded by
    /// `EXIT_DRAIN` once the child itself is gone.
    async fn next_event(&mut self) -> ChildEvent {
        loop {
            if let Some((status, duration, _)) = self.exited {
                if self.stdout.is_none() && self.stderr.is_none() {
                    return ChildEvent::Exited(ExitReport::from_status(self.pid, status, duration));
                }
            }
            let drain_deadline = self.exited.map(|(_, _, deadline)| deadline);

            tokio::select! {
                line = next_line(&mut self.stdout), if self.stdout.is_some() => match line {
                    Ok(Some(line)) => return ChildEvent::Stdout(line),
                    Ok(None) => self.stdout = None,
                    Err(e) => {
                        tracing::warn!(error = %e, pid = self.pid, "failed to read child stdout");
                        self.stdout = None;
                    }
                },
                line = next_line(&mut self.stderr), if self.stderr.is_some() => match line {
                    Ok(Some(line)) => return ChildEvent::Stderr(line),
                    Ok(None) => self.stderr = None,
                    Err(e) => {
                        tracing::warn!(error = %e, pid = self.pid, "failed to read child stderr");
                        self.stderr = None;
                    }
                },
                status = self.child.wait(), if self.exited.is_none() => {
                    let status = match status {
                        Ok(status) => Some(status),
                        Err(e) => {
                            tracing::warn!(error = %e, pid = self.pid, "failed to wait for child");
                            None
                        }
                    };
                    self.exited = Some((
                        status,
                        self.started.elapsed(),
                        tokio::time::Instant::now() + EXIT_DRAIN,
                    ));
                }
                () = tokio::time::sleep_until(drain_deadline.unwrap_or_else(tokio::time::Instant::now)),
                    if drain_deadline.is_some() =>
                {
                    tracing::debug!(pid = self.pid, "pipes still open after exit, leaving them to descendants");
                    self.stdout = None;
                    self.stderr = None;
                }
            }
        }
    }
}

pub struct Supervisor<C: Console> {
    command: ChildCommand,
    console: C,
    state: SupervisorState,
    child: Option<RunningChild>,
    restart_pending: bool,
    /// Child output is forwarded only while set.
    executing: bool,
    halted: bool,
    starts: u64,
    last_exit: Option<ExitReport>,
}

impl<C: Console> Supervisor<C> {
    pub fn new(command: ChildCommand, console: C) -> Self {
        Self {
            command,
            console,
            state: SupervisorState::Idle,
            child: None,
            restart_pending: false,
            executing: false,
            halted: false,
            starts: 0,
            last_exit: None,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn child_pid(&self) -> Option<u32> {
        self.child.as_ref().map(|c| c.pid)
    }

    pub fn restart_pending(&self) -> bool {
        self.restart_pending
    }

    /// Number of children successfully spawned.
    pub fn starts(&self) -> u64 {
        self.starts
    }

    pub fn last_exit(&self) -> Option<&ExitReport> {
        self.last_exit.as_ref()
    }

    /// Start the child now, or queue a restart if one is running.
    pub fn request_start(&mut self) -> StartOutcome {
        if self.halted {
            tracing::debug!("start requested after halt, ignoring");
            return StartOutcome::Failed;
        }
        if let Some(child) = &self.child {
            if !self.restart_pending {
                tracing::info!(pid = child.pid, "child still running, restart queued");
            }
            self.restart_pending = true;
            return StartOutcome::Queued;
        }
        self.start()
    }

    fn start(&mut self) -> StartOutcome {
        self.state = SupervisorState::Starting;
        tracing::info!(command = %self.command, "spawning child");

        let spawned = Command::new(&self.command.program)
            .args(&self.command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0) // Own process group so shutdown can signal the whole tree
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                let err = SpawnError {
                    program: self.command.program.clone(),
                    source: e,
                };
                tracing::error!(error = %err, "child spawn failed");
                self.console.error(&format!("error: {err}"));
                self.state = SupervisorState::Idle;
                return StartOutcome::Failed;
            }
        };

        let pid = child.id().unwrap_or(0);
        let stdout = child.stdout.take().map(OutputPipe::new);
        let stderr = child.stderr.take().map(OutputPipe::new);
        self.child = Some(RunningChild {
            child,
            pid,
            stdout,
            stderr,
            started: Instant::now(),
            exited: None,
        });
        self.state = SupervisorState::Running;
        self.executing = true;
        self.starts += 1;
        tracing::info!(pid, starts = self.starts, "child started");
        self.console
            .banner(&format!("starting {} (pid {pid})", self.command));
        StartOutcome::Started { pid }
    }

    /// Wait for the running child's next output line or exit.
    /// Never resolves while no child is running.
    pub async fn next_event(&mut self) -> ChildEvent {
        match &mut self.child {
            Some(child) => child.next_event().await,
            None => std::future::pending().await,
        }
    }

    /// Apply a child event. Returns the outcome of a queued restart, if one ran.
    pub fn handle_event(&mut self, event: ChildEvent) -> Option<StartOutcome> {
        match event {
            ChildEvent::Stdout(line) => {
                if self.executing {
                    self.console.child_stdout(&line);
                }
                None
            }
            ChildEvent::Stderr(line) => {
                if self.executing {
                    self.console.child_stderr(&line);
                }
                None
            }
            ChildEvent::Exited(report) => {
                tracing::info!(
                    pid = report.pid,
                    exit_code = ?report.exit_code,
                    signal = ?report.signal,
                    duration_ms = report.duration.as_millis() as u64,
                    "child exited"
                );
                if !self.halted {
                    self.console.banner(&report.to_string());
                }
                self.child = None;
                self.executing = false;
                self.state = SupervisorState::Idle;
                self.last_exit = Some(report);

                if self.restart_pending && !self.halted {
                    self.restart_pending = false;
                    return Some(self.start());
                }
                None
            }
        }
    }

    /// Stop forwarding output and refuse further starts.
    pub fn halt(&mut self) {
        self.halted = true;
        self.executing = false;
        self.restart_pending = false;
    }

    /// SIGTERM the running child's process group. Returns whether a signal was sent.
    pub fn terminate(&mut self) -> bool {
        let Some(child) = &self.child else {
            return false;
        };
        match killpg(Pid::from_raw(child.pid as i32), Signal::SIGTERM) {
            Ok(()) => {
                tracing::info!(pid = child.pid, "sent SIGTERM to child process group");
                true
            }
            Err(e) => {
                tracing::warn!(pid = child.pid, error = %e, "failed to signal child process group");
                false
            }
        }
    }
}
