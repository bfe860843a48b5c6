//! Deadline-bounded supervision of external commands.
//!
//! The child runs in its own process group so a timeout can take down
//! everything it spawned. Output is pumped by background threads into shared
//! buffers, which lets a timed-out run still report what it printed.
use crate::util::{strip_ansi, truncate_bytes};
use crossbeam_channel::{bounded, Receiver, TryRecvError};
use serde::Serialize;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Cap on captured bytes per stream.
pub const MAX_CAPTURE_BYTES: usize = 4 * 1024 * 1024;

const TICK: Duration = Duration::from_millis(25);
const TERM_GRACE: Duration = Duration::from_millis(250);
/// Default bound on everything after the child ends: termination, reaping,
/// and draining both output streams.
pub const CLEANUP_WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Shell-quoted rendering for logs and reports.
    pub fn display(&self) -> String {
        let mut words = vec![self.program.display().to_string()];
        words.extend(self.args.iter().cloned());
        shell_words::join(words)
    }
}

/// How a supervised run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProcessExit {
    /// Exit code, or `None` when killed by a signal.
    Exited { code: Option<i32> },
    TimedOut,
    /// Terminated on request of the caller.
    Stopped,
    LaunchFailed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct SupervisedRun {
    pub exit: ProcessExit,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
    /// Problems that did not stop the run, e.g. a process group that could
    /// not be signalled.
    pub warnings: Vec<String>,
}

impl SupervisedRun {
    pub fn success(&self) -> bool {
        self.exit == ProcessExit::Exited { code: Some(0) }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self.exit {
            ProcessExit::Exited { code } => code,
            _ => None,
        }
    }
}

/// Run `spec` until it exits, `timeout` elapses, or `stop` fires.
///
/// Never returns an error: launch failures become
/// [`ProcessExit::LaunchFailed`].
pub fn supervise(spec: &CommandSpec, timeout: Duration, stop: Option<&Receiver<()>>) -> SupervisedRun {
    supervise_within(spec, timeout, stop, CLEANUP_WAIT)
}

/// [`supervise`] with an explicit bound on the cleanup phase.
///
/// Termination and both stream drains share one deadline, `cleanup` after
/// the child ends or is signalled. Output still buffered in an open stream
/// at that point is returned as-is and flagged in the warnings.
pub fn supervise_within(
    spec: &CommandSpec,
    timeout: Duration,
    stop: Option<&Receiver<()>>,
    cleanup: Duration,
) -> SupervisedRun {
    let start = Instant::now();
    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .current_dir(&spec.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            tracing::warn!(program = %spec.program.display(), error = %err, "launch failed");
            return SupervisedRun {
                exit: ProcessExit::LaunchFailed {
                    error: err.to_string(),
                },
                stdout: String::new(),
                stderr: String::new(),
                elapsed: start.elapsed(),
                warnings: Vec::new(),
            };
        }
    };
    tracing::debug!(pid = child.id(), command = %spec.display(), "process started");

    let stdout = Pump::start(child.stdout.take());
    let stderr = Pump::start(child.stderr.take());
    let mut warnings = Vec::new();

    let (exit, cleanup_deadline) = loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                break (ProcessExit::Exited { code: status.code() }, Instant::now() + cleanup);
            }
            Ok(None) => {}
            Err(err) => {
                warnings.push(format!("could not poll process status: {err}"));
                let deadline = Instant::now() + cleanup;
                terminate(&mut child, deadline, &mut warnings);
                break (ProcessExit::Exited { code: None }, deadline);
            }
        }
        if start.elapsed() >= timeout {
            let deadline = Instant::now() + cleanup;
            terminate(&mut child, deadline, &mut warnings);
            break (ProcessExit::TimedOut, deadline);
        }
        if let Some(stop) = stop {
            if !matches!(stop.try_recv(), Err(TryRecvError::Empty)) {
                let deadline = Instant::now() + cleanup;
                terminate(&mut child, deadline, &mut warnings);
                break (ProcessExit::Stopped, deadline);
            }
        }
        thread::sleep(TICK);
    };

    let (stdout, stdout_open) = stdout.finish(cleanup_deadline);
    let (mut stderr, stderr_open) = stderr.finish(cleanup_deadline);
    let open: Vec<&str> = [("stdout", stdout_open), ("stderr", stderr_open)]
        .into_iter()
        .filter_map(|(name, open)| open.then_some(name))
        .collect();
    if !open.is_empty() {
        let message = format!(
            "{} still open after process exit; output may be incomplete",
            open.join(" and ")
        );
        tracing::warn!(command = %spec.display(), "{message}");
        warnings.push(message);
    }
    if exit == ProcessExit::TimedOut {
        if !stderr.is_empty() && !stderr.ends_with('\n') {
            stderr.push('\n');
        }
        stderr.push_str("[timeout]");
    }
    let elapsed = start.elapsed();
    tracing::info!(
        elapsed_ms = elapsed.as_millis() as u64,
        exit = ?exit,
        stdout_bytes = stdout.len(),
        stderr_bytes = stderr.len(),
        "process finished"
    );

    SupervisedRun {
        exit,
        stdout,
        stderr,
        elapsed,
        warnings,
    }
}

/// Signal the child's process group, then reap the child.
///
/// The group gets `SIGTERM` first. `SIGKILL` follows once the child has
/// exited, after [`TERM_GRACE`], or at `deadline`, whichever comes first.
fn terminate(child: &mut Child, deadline: Instant, warnings: &mut Vec<String>) {
    let pid = child.id();
    #[cfg(unix)]
    if let Err(err) = signal_group(pid, libc::SIGTERM) {
        warnings.push(format!("could not signal process group {pid}: {err}"));
    }
    let grace_end = deadline.min(Instant::now() + TERM_GRACE);
    while Instant::now() < grace_end {
        if matches!(child.try_wait(), Ok(Some(_))) {
            break;
        }
        thread::sleep(TICK.min(grace_end.saturating_duration_since(Instant::now())));
    }
    #[cfg(unix)]
    if let Err(err) = signal_group(pid, libc::SIGKILL) {
        let message = format!("process group {pid} may still be running: {err}");
        tracing::warn!("{message}");
        warnings.push(message);
    }
    let _ = child.kill();
    if let Err(err) = child.wait() {
        warnings.push(format!("could not reap process {pid}: {err}"));
    }
}

/// Send `signal` to the process group led by `pgid`. A group that is
/// already gone is not an error.
#[cfg(unix)]
fn signal_group(pgid: u32, signal: libc::c_int) -> std::io::Result<()> {
    // SAFETY: killpg only reads its integer arguments.
    let rc = unsafe { libc::killpg(pgid as libc::pid_t, signal) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    // ESRCH: the whole group is already gone.
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}

/// Background reader for one output stream.
struct Pump {
    buffer: Arc<Mutex<Vec<u8>>>,
    done: Option<Receiver<()>>,
}

impl Pump {
    fn start<R: Read + Send + 'static>(stream: Option<R>) -> Self {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let Some(mut stream) = stream else {
            return Self { buffer, done: None };
        };
        let (done_tx, done_rx) = bounded(1);
        let sink = Arc::clone(&buffer);
        thread::spawn(move || {
            let mut chunk = [0u8; 8192];
            loop {
                match stream.read(&mut chunk) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if let Ok(mut buf) = sink.lock() {
                            let room = MAX_CAPTURE_BYTES.saturating_sub(buf.len());
                            buf.extend_from_slice(&chunk[..n.min(room)]);
                        }
                    }
                }
            }
            let _ = done_tx.send(());
        });
        Self {
            buffer,
            done: Some(done_rx),
        }
    }

    /// Wait until `deadline` for the stream to close, then take what was
    /// captured. The flag is set when the stream was still open.
    ///
    /// A descendant that escaped termination can hold the pipe open, so the
    /// buffer is read regardless.
    fn finish(self, deadline: Instant) -> (String, bool) {
        let still_open = match self.done {
            Some(done) => done.recv_deadline(deadline).is_err(),
            None => false,
        };
        let bytes = match self.buffer.lock() {
            Ok(buf) => buf.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        (strip_ansi(&truncate_bytes(&bytes, MAX_CAPTURE_BYTES)), still_open)
    }
}
