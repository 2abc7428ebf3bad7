use std::ffi::OsStr;
use std::io::{self, BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use super::progress::{LogProgress, ProgressSink, ToolProgressParser};
use super::{CancellationToken, ToolError, ToolExecutor, ToolOutput, ToolSpec};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// How long output may stay open after the tool itself has exited
const STRAGGLER_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamKind {
    Stdout,
    Stderr,
}

#[derive(Debug)]
enum StreamEvent {
    Line(StreamKind, String),
    Closed(StreamKind),
}

/// Read `pipe` line by line into `sender` until it closes
fn drain_lines<R: Read>(pipe: Option<R>, kind: StreamKind, sender: Sender<StreamEvent>) {
    if let Some(pipe) = pipe {
        let mut reader = BufReader::new(pipe);
        let mut buffer = Vec::new();
        loop {
            buffer.clear();
            match reader.read_until(b'\n', &mut buffer) {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buffer)
                        .trim_end_matches(['\r', '\n'])
                        .to_string();
                    if sender.send(StreamEvent::Line(kind, line)).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Failed to read from {kind:?} of child process: {e}");
                    break;
                }
            }
        }
    }
    let _ = sender.send(StreamEvent::Closed(kind));
}

#[cfg(unix)]
fn kill_process_tree(pid: u32) -> io::Result<bool> {
    // Children are started as the leaders of their own process group
    Command::new("kill")
        .arg("-KILL")
        .arg("--")
        .arg(format!("-{pid}"))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
}

#[cfg(windows)]
fn kill_process_tree(pid: u32) -> io::Result<bool> {
    Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
}

#[cfg(not(any(unix, windows)))]
fn kill_process_tree(_pid: u32) -> io::Result<bool> {
    Ok(false)
}

#[cfg(unix)]
fn exit_code(status: &ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: &ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// Owns a running child and kills its whole process tree if dropped before
/// the child has been reaped.
struct ChildGuard<'a> {
    child: Child,
    tool: &'a str,
    reaped: bool,
}

impl<'a> ChildGuard<'a> {
    fn new(child: Child, tool: &'a str) -> Self {
        Self {
            child,
            tool,
            reaped: false,
        }
    }

    fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        let status = self.child.try_wait()?;
        if status.is_some() {
            self.reaped = true;
        }
        Ok(status)
    }

    fn kill_tree(&mut self) {
        if self.reaped {
            return;
        }
        let pid = self.child.id();
        match kill_process_tree(pid) {
            Ok(true) => debug!("Killed process tree of {} ({pid})", self.tool),
            Ok(false) => {}
            Err(e) => warn!("Failed to kill process tree of {} ({pid}): {e}", self.tool),
        }
        if let Err(e) = self.child.kill() {
            if e.kind() != io::ErrorKind::InvalidInput {
                warn!("Failed to kill {} ({pid}): {e}", self.tool);
            }
        }
        if let Err(e) = self.child.wait() {
            warn!("Failed to reap {} ({pid}): {e}", self.tool);
        }
        self.reaped = true;
    }

    /// Kill anything the tool left running in its process group after it exited
    #[cfg(unix)]
    fn kill_stragglers(&mut self) {
        let pid = self.child.id();
        match kill_process_tree(pid) {
            Ok(true) => warn!(
                "{} exited but left processes running, they have been killed",
                self.tool
            ),
            Ok(false) => {}
            Err(e) => warn!("Failed to check for processes left by {}: {e}", self.tool),
        }
    }

    #[cfg(not(unix))]
    fn kill_stragglers(&mut self) {}
}

impl Drop for ChildGuard<'_> {
    fn drop(&mut self) {
        if !self.reaped {
            warn!("{} is still running, killing it", self.tool);
            self.kill_tree();
        }
    }
}

/**
Runs TOPP tools as child processes.

Standard output and standard error are drained by two reader threads while the
calling thread waits, so a chatty tool can never block on a full pipe. Progress
lines on standard output are forwarded to the [`ProgressSink`]. Standard error
is kept and attached to [`ToolError::Execution`].

[`ToolExecutor::run_and_wait`] only returns once both streams are closed and the
process has exited. The [`CancellationToken`] is checked every poll interval; once
it is set the tool's whole process tree is killed before
[`ToolError::Cancelled`] is returned.
*/
#[derive(Debug, Clone)]
pub struct ProcessRunner<P: ProgressSink = LogProgress> {
    progress: P,
    poll_interval: Duration,
}

impl Default for ProcessRunner<LogProgress> {
    fn default() -> Self {
        Self::new(LogProgress)
    }
}

impl<P: ProgressSink> ProcessRunner<P> {
    pub fn new(progress: P) -> Self {
        Self {
            progress,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn command(&self, tool: &ToolSpec, args: &[&OsStr], working_dir: &Path) -> Command {
        let mut command = Command::new(&tool.executable);
        command
            .args(&tool.leading_args)
            .args(args)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(share_dir) = tool.share_dir.as_ref() {
            command.env(&tool.share_env_var, share_dir);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        command
    }

    /// Launch `tool` with `args` and supervise it to completion
    pub fn execute(
        &self,
        tool: &ToolSpec,
        args: &[&OsStr],
        working_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<ToolOutput, ToolError> {
        if cancel.is_cancelled() {
            return Err(ToolError::Cancelled {
                tool: tool.name.clone(),
            });
        }
        let mut command = self.command(tool, args, working_dir);
        debug!("Launching {} {:?} in {}", tool.executable.display(), args, working_dir.display());
        let started = Instant::now();
        let child = command.spawn().map_err(|e| ToolError::Invocation {
            tool: tool.name.clone(),
            reason: format!("failed to start {}", tool.executable.display()),
            source: Some(e),
        })?;
        let mut guard = ChildGuard::new(child, &tool.name);
        let stdout = guard.child.stdout.take();
        let stderr = guard.child.stderr.take();

        let (sender, receiver) = mpsc::channel();
        let result = thread::scope(|scope| {
            let stdout_sender = sender.clone();
            scope.spawn(move || drain_lines(stdout, StreamKind::Stdout, stdout_sender));
            scope.spawn(move || drain_lines(stderr, StreamKind::Stderr, sender));
            self.supervise(&mut guard, &receiver, tool, cancel)
        });

        let (stdout_lines, stderr, status) = result?;
        guard.kill_stragglers();
        let elapsed = started.elapsed();
        let code = exit_code(&status);
        if !status.success() {
            warn!("{} exited with code {code} after {:.2?}", tool.name, elapsed);
            return Err(ToolError::Execution {
                tool: tool.name.clone(),
                code,
                stderr,
            });
        }
        debug!("{} finished in {:.2?}", tool.name, elapsed);
        Ok(ToolOutput::new(stdout_lines, stderr, elapsed))
    }

    fn cancelled(&self, guard: &mut ChildGuard, tool: &ToolSpec) -> ToolError {
        warn!("Cancelling {}", tool.name);
        guard.kill_tree();
        ToolError::Cancelled {
            tool: tool.name.clone(),
        }
    }

    /// Consume both output streams until they close, then wait for the process to exit.
    /// Processes left holding the streams open after the tool exits are killed
    /// once [`STRAGGLER_GRACE`] has passed.
    fn supervise(
        &self,
        guard: &mut ChildGuard,
        receiver: &Receiver<StreamEvent>,
        tool: &ToolSpec,
        cancel: &CancellationToken,
    ) -> Result<(usize, String, ExitStatus), ToolError> {
        let mut parser = ToolProgressParser::new(tool.name.as_str());
        let mut open_streams = 2;
        let mut stdout_lines = 0;
        let mut stderr = String::new();
        let mut exited: Option<(ExitStatus, Instant)> = None;
        let mut stragglers_killed = false;

        while open_streams > 0 {
            if cancel.is_cancelled() {
                return Err(self.cancelled(guard, tool));
            }
            match receiver.recv_timeout(self.poll_interval) {
                Ok(StreamEvent::Line(StreamKind::Stdout, line)) => {
                    stdout_lines += 1;
                    trace!("{}: {line}", tool.name);
                    if let Some((fraction, text)) = parser.feed(&line) {
                        self.progress.report(fraction, &text);
                    }
                }
                Ok(StreamEvent::Line(StreamKind::Stderr, line)) => {
                    debug!("{} stderr: {line}", tool.name);
                    stderr.push_str(&line);
                    stderr.push('\n');
                }
                Ok(StreamEvent::Closed(kind)) => {
                    trace!("{} closed {kind:?}", tool.name);
                    open_streams -= 1;
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => open_streams = 0,
            }
            if open_streams == 0 {
                break;
            }
            match exited {
                None => match guard.try_wait() {
                    Ok(Some(status)) => exited = Some((status, Instant::now())),
                    Ok(None) => {}
                    Err(e) => return Err(self.wait_failed(guard, tool, e)),
                },
                Some((_, at)) if !stragglers_killed && at.elapsed() >= STRAGGLER_GRACE => {
                    debug!("{} exited but its output is still held open", tool.name);
                    guard.kill_stragglers();
                    stragglers_killed = true;
                }
                Some(_) => {}
            }
        }

        if let Some((status, _)) = exited {
            return Ok((stdout_lines, stderr, status));
        }
        loop {
            if cancel.is_cancelled() {
                return Err(self.cancelled(guard, tool));
            }
            match guard.try_wait() {
                Ok(Some(status)) => return Ok((stdout_lines, stderr, status)),
                Ok(None) => thread::sleep(self.poll_interval),
                Err(e) => return Err(self.wait_failed(guard, tool, e)),
            }
        }
    }

    fn wait_failed(&self, guard: &mut ChildGuard, tool: &ToolSpec, error: io::Error) -> ToolError {
        guard.kill_tree();
        ToolError::Invocation {
            tool: tool.name.clone(),
            reason: "failed to wait for the process".into(),
            source: Some(error),
        }
    }
}

impl<P: ProgressSink> ToolExecutor for ProcessRunner<P> {
    fn write_default_config(
        &self,
        tool: &ToolSpec,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), ToolError> {
        let working_dir = path.parent().unwrap_or_else(|| Path::new("."));
        let args = [OsStr::new("-write_ini"), path.as_os_str()];
        match self.execute(tool, &args, working_dir, cancel) {
            Ok(_) => Ok(()),
            Err(ToolError::Execution { tool, code, stderr }) => Err(ToolError::Invocation {
                reason: format!(
                    "writing the default configuration failed with exit code {code}: {}",
                    stderr.lines().last().unwrap_or_default()
                ),
                tool,
                source: None,
            }),
            Err(e) => Err(e),
        }
    }

    fn run_and_wait(
        &self,
        tool: &ToolSpec,
        config_path: &Path,
        working_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<ToolOutput, ToolError> {
        let args = [OsStr::new("-ini"), config_path.as_os_str()];
        self.execute(tool, &args, working_dir, cancel)
    }
}
