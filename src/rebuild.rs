//! Rebuild of the device-environment tool's volume and container image.
use crate::error::{FwError, FwResult};
use crate::paths::EmuxPaths;
use crate::process::{supervise, CommandSpec, ProcessExit, SupervisedRun};
use serde::{Serialize, Serializer};
use std::time::Duration;

/// Build scripts, run in order from the installation root.
const STEPS: [&str; 2] = ["./build-emux-volume", "./build-emux-docker"];

#[derive(Debug, Serialize)]
pub struct RebuildStep {
    pub script: &'static str,
    pub command: String,
    pub exit: ProcessExit,
    pub stdout: String,
    pub stderr: String,
    /// Suggestion when sudo refused to run non-interactively.
    pub hint: Option<&'static str>,
    #[serde(serialize_with = "as_millis", rename = "elapsed_ms")]
    pub elapsed: Duration,
}

impl RebuildStep {
    pub fn success(&self) -> bool {
        self.exit == ProcessExit::Exited { code: Some(0) }
    }
}

#[derive(Debug, Serialize)]
pub struct RebuildReport {
    pub steps: Vec<RebuildStep>,
    pub warnings: Vec<String>,
}

impl RebuildReport {
    /// True when every step ran and succeeded.
    pub fn success(&self) -> bool {
        self.steps.len() == STEPS.len() && self.steps.iter().all(RebuildStep::success)
    }
}

/// Run the build scripts; a failing step stops the sequence.
pub fn rebuild(emux: &EmuxPaths, timeout: Duration, use_sudo: bool) -> FwResult<RebuildReport> {
    let mut report = RebuildReport {
        steps: Vec::new(),
        warnings: Vec::new(),
    };
    for script in STEPS {
        let spec = if use_sudo {
            CommandSpec::new("sudo", emux.root()).arg("-n").arg(script)
        } else {
            CommandSpec::new(script, emux.root())
        };
        let SupervisedRun {
            exit,
            stdout,
            stderr,
            elapsed,
            warnings,
        } = supervise(&spec, timeout, None);
        report.warnings.extend(warnings);

        if let ProcessExit::LaunchFailed { error } = &exit {
            return Err(FwError::Launch {
                program: spec.display(),
                source: std::io::Error::other(error.clone()),
            });
        }
        let step = RebuildStep {
            script,
            command: spec.display(),
            hint: sudo_hint(&stderr),
            exit,
            stdout,
            stderr,
            elapsed,
        };
        let ok = step.success();
        tracing::info!(script, elapsed_ms = step.elapsed.as_millis() as u64, ok, "rebuild step finished");
        report.steps.push(step);
        if !ok {
            break;
        }
    }
    Ok(report)
}

fn sudo_hint(stderr: &str) -> Option<&'static str> {
    let text = stderr.to_ascii_lowercase();
    if text.contains("a terminal is required") || text.contains("no tty present") {
        Some("sudo wants a TTY; configure NOPASSWD for the build scripts or rerun with --no-sudo")
    } else if text.contains("may not run sudo") || text.contains("password") {
        Some("sudo was denied or needs a password; configure NOPASSWD or rerun with --no-sudo")
    } else {
        None
    }
}

fn as_millis<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(value.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sudo_hints_match_common_refusals() {
        assert!(sudo_hint("sudo: a terminal is required to read the password").is_some());
        assert!(sudo_hint("sudo: a password is required").is_some());
        assert!(sudo_hint("build ok").is_none());
    }

    #[cfg(unix)]
    fn install(root: &std::path::Path, name: &str, body: &str) {
        use std::os::unix::fs::PermissionsExt;
        let path = root.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod");
    }

    #[cfg(unix)]
    #[test]
    fn runs_both_steps_without_sudo() {
        let dir = tempfile::tempdir().expect("tempdir");
        install(dir.path(), "build-emux-volume", "echo volume");
        install(dir.path(), "build-emux-docker", "echo docker");
        let emux = EmuxPaths::new(dir.path().to_path_buf());

        let report = rebuild(&emux, Duration::from_secs(10), false).expect("rebuild");
        assert!(report.success());
        assert_eq!(report.steps[1].stdout.trim(), "docker");
        assert_eq!(report.steps[0].command, "./build-emux-volume");
    }

    #[cfg(unix)]
    #[test]
    fn failing_volume_step_stops_sequence() {
        let dir = tempfile::tempdir().expect("tempdir");
        install(dir.path(), "build-emux-volume", "echo 'sudo: a password is required' >&2; exit 1");
        install(dir.path(), "build-emux-docker", "touch docker-ran");
        let emux = EmuxPaths::new(dir.path().to_path_buf());

        let report = rebuild(&emux, Duration::from_secs(10), false).expect("rebuild");
        assert!(!report.success());
        assert_eq!(report.steps.len(), 1);
        assert!(report.steps[0].hint.is_some());
        assert!(!dir.path().join("docker-ran").exists());
    }

    #[test]
    fn missing_script_is_a_launch_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let emux = EmuxPaths::new(dir.path().to_path_buf());
        let err = rebuild(&emux, Duration::from_secs(5), false).unwrap_err();
        assert!(matches!(err, FwError::Launch { .. }));
    }
}
