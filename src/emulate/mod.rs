//! Emulation run controller.
//!
//! One call drives one attempt: PENDING (resolve firmware) → RUNNING
//! (supervised process plus marker poller) → COMPLETED, TIMED_OUT, or
//! LAUNCH_ERROR. The process and the poller are independent bounded waits
//! joined by a deadline-bounded select; the run ends when the marker shows
//! up or the wait deadline passes, even if the process exited earlier.
mod marker;
mod scratch;

pub use marker::MarkerVerdict;
pub use scratch::{
    clean_scratch, collect_scratch_logs, latest_instance, numeric_instances, render_scratch_logs,
    ScratchLog,
};

use crate::classify::{classify, FailureHypothesis};
use crate::error::{FwError, FwResult};
use crate::paths::FirmaePaths;
use crate::process::{supervise_within, CommandSpec, ProcessExit, SupervisedRun};
use crate::settings::Settings;
use crate::util::{expand_home, expand_path};
use crossbeam_channel::{at, bounded, never, select, Receiver};
use marker::{MarkerPoller, PollConfig, PollEvent};
use serde::{Serialize, Serializer};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

/// Extra time allowed for a process stopped after its marker to hand back
/// its output.
const COLLECT_WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize)]
pub struct EmulationRequest {
    pub brand: String,
    /// Absolute, or relative to the framework home.
    pub firmware: PathBuf,
    #[serde(serialize_with = "as_secs")]
    pub timeout: Duration,
    /// How long to wait for the completion marker.
    #[serde(serialize_with = "as_secs")]
    pub wait: Duration,
    /// Scratch instance to watch instead of discovering a new one.
    pub instance_id: Option<String>,
}

impl EmulationRequest {
    /// `wait` falls back to `timeout`, which falls back to `default_timeout`.
    pub fn new(
        brand: impl Into<String>,
        firmware: impl Into<PathBuf>,
        timeout: Option<Duration>,
        wait: Option<Duration>,
        default_timeout: Duration,
    ) -> FwResult<Self> {
        let brand = brand.into();
        if brand.trim().is_empty() {
            return Err(FwError::validation("brand", "must not be empty"));
        }
        let firmware = firmware.into();
        if firmware.as_os_str().is_empty() {
            return Err(FwError::validation("firmware", "must not be empty"));
        }
        let timeout = timeout.unwrap_or(default_timeout);
        let wait = wait.unwrap_or(timeout);
        if timeout.is_zero() {
            return Err(FwError::validation("timeout", "must be positive"));
        }
        if wait.is_zero() {
            return Err(FwError::validation("wait", "must be positive"));
        }
        Ok(Self {
            brand,
            firmware,
            timeout,
            wait,
            instance_id: None,
        })
    }

    pub fn with_instance(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }
}

/// Terminal controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Completed,
    TimedOut,
    LaunchError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EmulationStatus {
    Success,
    Failure,
    Timeout,
    LaunchError,
}

/// Result of one attempt. Borrows the request that produced it.
#[derive(Debug, Serialize)]
pub struct EmulationOutcome<'req> {
    pub request: &'req EmulationRequest,
    pub state: RunState,
    pub status: EmulationStatus,
    pub instance_id: Option<String>,
    pub firmware_path: PathBuf,
    pub command: String,
    pub exit: Option<ProcessExit>,
    /// Raw marker content when one was observed.
    pub marker: Option<String>,
    pub stdout: String,
    pub stderr: String,
    pub scratch_logs: Vec<ScratchLog>,
    #[serde(serialize_with = "as_millis", rename = "elapsed_ms")]
    pub elapsed: Duration,
    pub hypotheses: Vec<FailureHypothesis>,
    pub warnings: Vec<String>,
}

impl EmulationOutcome<'_> {
    pub fn is_success(&self) -> bool {
        self.status == EmulationStatus::Success
    }

    /// A failure that no heuristic explains.
    pub fn unknown_cause(&self) -> bool {
        !self.is_success() && self.hypotheses.is_empty()
    }
}

/// Resolve the firmware image path.
///
/// Relative paths are tried against the framework home and the working
/// directory; two different existing candidates are refused rather than
/// guessed between.
pub fn resolve_firmware(input: &Path, base: &Path) -> FwResult<PathBuf> {
    let expanded = expand_home(input);
    let mut candidates: Vec<PathBuf> = Vec::new();
    if expanded.is_absolute() {
        candidates.push(expanded.clone());
    } else {
        candidates.push(base.join(&expanded));
        if let Ok(cwd) = std::env::current_dir() {
            candidates.push(cwd.join(&expanded));
        }
    }

    let mut found: Vec<PathBuf> = Vec::new();
    for candidate in candidates {
        if !candidate.exists() {
            continue;
        }
        let canonical = candidate
            .canonicalize()
            .map_err(|err| FwError::path("firmware image", &candidate, err.to_string()))?;
        if !found.contains(&canonical) {
            found.push(canonical);
        }
    }

    match found.as_slice() {
        [] => Err(FwError::path(
            "firmware image",
            &expanded,
            format!("not found as given or under {}", base.display()),
        )),
        [single] if single.is_file() => Ok(single.clone()),
        [single] => Err(FwError::path("firmware image", single, "not a regular file")),
        [first, second, ..] => Err(FwError::path(
            "firmware image",
            &expanded,
            format!(
                "ambiguous: matches both {} and {}",
                first.display(),
                second.display()
            ),
        )),
    }
}

enum Verdict {
    Marker(String),
    Expired,
    LaunchFailed,
}

/// Run one emulation attempt end to end.
pub fn run_emulation<'req>(
    request: &'req EmulationRequest,
    firmae: &FirmaePaths,
    settings: &Settings,
) -> FwResult<EmulationOutcome<'req>> {
    let firmware_path = resolve_firmware(&request.firmware, firmae.root())?;
    let tool = expand_path(Path::new(&settings.emulation_tool), firmae.root());
    let spec = CommandSpec::new(tool, firmae.root())
        .arg("-c")
        .arg(request.brand.clone())
        .arg(firmware_path.display().to_string());

    let mut outcome = EmulationOutcome {
        request,
        state: RunState::LaunchError,
        status: EmulationStatus::LaunchError,
        instance_id: request.instance_id.clone(),
        firmware_path: firmware_path.clone(),
        command: spec.display(),
        exit: None,
        marker: None,
        stdout: String::new(),
        stderr: String::new(),
        scratch_logs: Vec::new(),
        elapsed: Duration::ZERO,
        hypotheses: Vec::new(),
        warnings: Vec::new(),
    };

    let size = fs::metadata(&firmware_path)
        .map_err(|err| FwError::io(&firmware_path, err))?
        .len();
    if size == 0 {
        outcome
            .warnings
            .push(format!("firmware image {} is empty", firmware_path.display()));
        tracing::warn!(firmware = %firmware_path.display(), "refusing to launch empty firmware");
        return Ok(outcome);
    }

    let known: BTreeSet<u64> = numeric_instances(&firmae.scratch_dir()).into_iter().collect();
    let start = Instant::now();
    let deadline = start + request.wait;
    tracing::info!(command = %outcome.command, timeout_s = request.timeout.as_secs(), wait_s = request.wait.as_secs(), "emulation started");

    let (run_tx, run_rx) = bounded::<SupervisedRun>(1);
    let (stop_tx, stop_rx) = bounded::<()>(1);
    let timeout = request.timeout;
    // Stop plus cleanup must fit in one poll interval past the wait deadline.
    let cleanup = settings.poll_interval / 2;
    thread::spawn(move || {
        let run = supervise_within(&spec, timeout, Some(&stop_rx), cleanup);
        let _ = run_tx.send(run);
    });
    let poller = MarkerPoller::spawn(PollConfig {
        firmae: firmae.clone(),
        pinned: request.instance_id.clone(),
        known,
        interval: settings.poll_interval,
        deadline,
    });

    let expiry = at(deadline);
    let idle: Receiver<SupervisedRun> = never();
    let idle_events: Receiver<PollEvent> = never();
    let mut run: Option<SupervisedRun> = None;
    let mut process_gone = false;
    let mut poller_gone = false;

    let verdict = loop {
        let run_source = if process_gone { &idle } else { &run_rx };
        let event_source = if poller_gone { &idle_events } else { &poller.events };
        select! {
            recv(run_source) -> msg => {
                process_gone = true;
                match msg {
                    Ok(finished) => {
                        let launch_failed = matches!(finished.exit, ProcessExit::LaunchFailed { .. });
                        tracing::debug!(exit = ?finished.exit, "process ended before marker");
                        run = Some(finished);
                        if launch_failed {
                            break Verdict::LaunchFailed;
                        }
                    }
                    Err(_) => outcome.warnings.push("supervisor thread ended without a result".to_string()),
                }
            }
            recv(event_source) -> event => match event {
                Ok(PollEvent::Instance(id)) => outcome.instance_id = Some(id),
                Ok(PollEvent::Warning(message)) => {
                    tracing::warn!("{message}");
                    outcome.warnings.push(message);
                }
                Ok(PollEvent::Marker { instance_id, content }) => {
                    outcome.instance_id = Some(instance_id);
                    break Verdict::Marker(content);
                }
                // The poller only hangs up at its deadline; the expiry arm follows.
                Err(_) => poller_gone = true,
            },
            recv(expiry) -> _ => break Verdict::Expired,
        }
    };
    poller.shutdown();

    if run.is_none() && !process_gone {
        let collect_by = match verdict {
            Verdict::Expired => deadline + settings.poll_interval,
            _ => Instant::now() + settings.marker_grace + COLLECT_WAIT,
        };
        run = finish_process(
            &run_rx,
            &stop_tx,
            &verdict,
            settings.marker_grace,
            collect_by,
            &mut outcome.warnings,
        );
    }
    outcome.elapsed = start.elapsed();

    match &verdict {
        Verdict::Marker(content) => {
            outcome.state = RunState::Completed;
            outcome.status = match MarkerVerdict::parse(content) {
                MarkerVerdict::Success => EmulationStatus::Success,
                MarkerVerdict::Failure => EmulationStatus::Failure,
            };
            outcome.marker = Some(content.trim().to_string());
        }
        Verdict::Expired => {
            outcome.state = RunState::TimedOut;
            outcome.status = EmulationStatus::Timeout;
        }
        Verdict::LaunchFailed => {
            outcome.state = RunState::LaunchError;
            outcome.status = EmulationStatus::LaunchError;
        }
    }

    if let Some(run) = run {
        outcome.warnings.extend(run.warnings);
        outcome.stdout = run.stdout;
        outcome.stderr = run.stderr;
        outcome.exit = Some(run.exit);
    }

    if !outcome.is_success() {
        diagnose(&mut outcome, firmae);
    }
    tracing::info!(
        elapsed_ms = outcome.elapsed.as_millis() as u64,
        state = ?outcome.state,
        status = ?outcome.status,
        instance_id = outcome.instance_id.as_deref().unwrap_or("-"),
        hypotheses = outcome.hypotheses.len(),
        "emulation finished"
    );
    Ok(outcome)
}

/// Collect the process result once the run verdict is in.
///
/// After a marker the process gets `grace` to exit by itself; otherwise it
/// is stopped straight away. Nothing is waited for past `collect_by`.
fn finish_process(
    run_rx: &Receiver<SupervisedRun>,
    stop_tx: &crossbeam_channel::Sender<()>,
    verdict: &Verdict,
    grace: Duration,
    collect_by: Instant,
    warnings: &mut Vec<String>,
) -> Option<SupervisedRun> {
    if matches!(verdict, Verdict::Marker(_)) {
        if let Ok(run) = run_rx.recv_deadline(collect_by.min(Instant::now() + grace)) {
            return Some(run);
        }
    }
    let _ = stop_tx.send(());
    match run_rx.recv_deadline(collect_by) {
        Ok(run) => Some(run),
        Err(_) => {
            let message = "emulation process did not report back after stop; output unavailable";
            tracing::warn!("{message}");
            warnings.push(message.to_string());
            None
        }
    }
}

/// Attach scratch logs and ranked hypotheses to a non-successful outcome.
fn diagnose(outcome: &mut EmulationOutcome<'_>, firmae: &FirmaePaths) {
    if let Some(id) = &outcome.instance_id {
        outcome.scratch_logs = collect_scratch_logs(firmae, id);
    }
    if outcome.scratch_logs.is_empty() {
        outcome
            .warnings
            .push("emulation failed before logs were produced in scratch".to_string());
    }

    let mut text = String::new();
    for part in [&outcome.stdout, &outcome.stderr] {
        if !part.is_empty() {
            text.push_str(part);
            text.push('\n');
        }
    }
    text.push_str(&render_scratch_logs(&outcome.scratch_logs));
    if outcome.state == RunState::TimedOut {
        text.push_str(&format!(
            "[timeout] no completion marker within {}s\n",
            outcome.request.wait.as_secs()
        ));
    }
    outcome.hypotheses = classify(&text);
}

fn as_secs<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(value.as_secs())
}

fn as_millis<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(value.as_millis() as u64)
}

#[cfg(test)]
#[path = "controller_tests.rs"]
mod tests;
