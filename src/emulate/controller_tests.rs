use super::*;
use std::fs;

fn settings() -> Settings {
    Settings {
        poll_interval: Duration::from_millis(100),
        marker_grace: Duration::from_millis(200),
        ..Settings::default()
    }
}

fn firmae_with_tool(body: &str) -> (tempfile::TempDir, FirmaePaths) {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = dir.path().to_path_buf();
    fs::create_dir_all(root.join("scratch")).expect("scratch");
    fs::create_dir_all(root.join("firmwares")).expect("firmwares");
    fs::write(root.join("firmwares").join("valid.bin"), b"\x27\x05\x19\x56firmware").expect("fw");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let tool = root.join("run.sh");
        fs::write(&tool, format!("#!/bin/sh\n{body}\n")).expect("write tool");
        fs::set_permissions(&tool, fs::Permissions::from_mode(0o755)).expect("chmod");
    }
    (dir, FirmaePaths::new(root))
}

fn request(timeout_secs: u64) -> EmulationRequest {
    EmulationRequest::new(
        "DLINK",
        "firmwares/valid.bin",
        Some(Duration::from_secs(timeout_secs)),
        None,
        Duration::from_secs(1800),
    )
    .expect("request")
}

#[test]
fn wait_defaults_to_timeout_and_must_be_positive() {
    let request = request(60);
    assert_eq!(request.wait, Duration::from_secs(60));

    let err = EmulationRequest::new(
        "DLINK",
        "fw.bin",
        Some(Duration::from_secs(60)),
        Some(Duration::ZERO),
        Duration::from_secs(1800),
    )
    .unwrap_err();
    assert!(matches!(err, FwError::Validation { what: "wait", .. }));

    let err = EmulationRequest::new("  ", "fw.bin", None, None, Duration::from_secs(1)).unwrap_err();
    assert!(matches!(err, FwError::Validation { what: "brand", .. }));
}

#[test]
fn firmware_resolution_rejects_missing_directories_and_ambiguity() {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::create_dir(dir.path().join("images")).expect("mkdir");
    fs::write(dir.path().join("fw.bin"), b"x").expect("write");

    let resolved = resolve_firmware(Path::new("fw.bin"), dir.path()).expect("resolve");
    assert!(resolved.is_absolute());
    assert!(resolved.ends_with("fw.bin"));

    let missing = resolve_firmware(Path::new("nope.bin"), dir.path()).unwrap_err();
    assert!(matches!(missing, FwError::PathResolution { .. }));

    let not_file = resolve_firmware(Path::new("images"), dir.path()).unwrap_err();
    assert!(not_file.to_string().contains("not a regular file"));

    // The test harness runs from the package root, which has its own manifest.
    fs::write(dir.path().join("Cargo.toml"), b"[package]").expect("write");
    let ambiguous = resolve_firmware(Path::new("Cargo.toml"), dir.path()).unwrap_err();
    assert!(ambiguous.to_string().contains("ambiguous"));
}

#[cfg(unix)]
#[test]
fn marker_success_completes_run() {
    let (_dir, firmae) = firmae_with_tool(
        "echo \"[*] $1 $2\"; mkdir -p scratch/1; sleep 1; echo true > scratch/1/result; sleep 30",
    );
    let request = request(60);

    let outcome = run_emulation(&request, &firmae, &settings()).expect("run");
    assert_eq!(outcome.state, RunState::Completed);
    assert_eq!(outcome.status, EmulationStatus::Success);
    assert_eq!(outcome.instance_id.as_deref(), Some("1"));
    assert_eq!(outcome.marker.as_deref(), Some("true"));
    assert!(outcome.elapsed >= Duration::from_millis(900));
    assert!(outcome.elapsed < Duration::from_secs(10));
    assert!(outcome.stdout.contains("-c DLINK"));
    assert!(outcome.hypotheses.is_empty());
    assert_eq!(outcome.exit, Some(ProcessExit::Stopped));
}

#[cfg(unix)]
#[test]
fn failure_marker_is_classified_from_scratch_logs() {
    let (_dir, firmae) = firmae_with_tool(
        "mkdir -p scratch/2\n\
         echo 'mke2fs: unable to set up image' > scratch/2/makeImage.log\n\
         echo false > scratch/2/result",
    );
    // A stale success from an earlier run must not be picked up.
    fs::create_dir_all(firmae.instance_dir("1")).expect("old instance");
    fs::write(firmae.marker_path("1"), "true").expect("old marker");
    let request = request(60);

    let outcome = run_emulation(&request, &firmae, &settings()).expect("run");
    assert_eq!(outcome.state, RunState::Completed);
    assert_eq!(outcome.status, EmulationStatus::Failure);
    assert_eq!(outcome.instance_id.as_deref(), Some("2"));
    assert_eq!(outcome.scratch_logs.len(), 1);
    assert_eq!(outcome.hypotheses[0].reason, "Filesystem image build error");
    assert_eq!(outcome.exit, Some(ProcessExit::Exited { code: Some(0) }));
}

#[cfg(unix)]
#[test]
fn missing_marker_times_out_with_partial_diagnosis() {
    let (_dir, firmae) = firmae_with_tool(
        "mkdir -p scratch/1\n\
         echo 'Kernel panic - not syncing' > scratch/1/qemu.final.serial.log\n\
         echo booting\n\
         sleep 30",
    );
    let request = request(1);
    let settings = settings();

    let started = Instant::now();
    let outcome = run_emulation(&request, &firmae, &settings).expect("run");
    let returned_after = started.elapsed();
    assert_eq!(outcome.state, RunState::TimedOut);
    assert_eq!(outcome.status, EmulationStatus::Timeout);
    assert!(
        returned_after < request.wait + settings.poll_interval + Duration::from_millis(100),
        "returned after {returned_after:?}"
    );
    assert!(outcome.elapsed <= returned_after);
    assert!(outcome.stdout.contains("booting"));
    let reasons: Vec<&str> = outcome.hypotheses.iter().map(|h| h.reason.as_str()).collect();
    assert_eq!(reasons, vec!["QEMU boot/kernel failure", "Timeout / watchdog"]);
}

#[cfg(unix)]
#[test]
fn escaped_descendant_does_not_delay_timeout() {
    if which::which("setsid").is_err() {
        return;
    }
    let (_dir, firmae) = firmae_with_tool("setsid sleep 30 &\necho booting\nsleep 30");
    let request = request(1);
    let settings = settings();

    let started = Instant::now();
    let outcome = run_emulation(&request, &firmae, &settings).expect("run");
    let returned_after = started.elapsed();
    assert_eq!(outcome.state, RunState::TimedOut);
    assert!(
        returned_after < request.wait + settings.poll_interval + Duration::from_millis(100),
        "returned after {returned_after:?}"
    );
    assert!(outcome.stdout.contains("booting"));
    assert!(outcome.warnings.iter().any(|w| w.contains("still open")));
}

#[cfg(unix)]
#[test]
fn process_exit_without_marker_keeps_waiting_until_deadline() {
    let (_dir, firmae) = firmae_with_tool("echo detached");
    let request = request(1);

    let outcome = run_emulation(&request, &firmae, &settings()).expect("run");
    assert_eq!(outcome.state, RunState::TimedOut);
    assert!(outcome.elapsed >= Duration::from_millis(900));
    assert_eq!(outcome.exit, Some(ProcessExit::Exited { code: Some(0) }));
    assert!(outcome
        .warnings
        .iter()
        .any(|w| w.contains("before logs were produced")));
}

#[test]
fn empty_firmware_is_a_launch_error() {
    let (_dir, firmae) = firmae_with_tool("exit 0");
    fs::write(firmae.root().join("firmwares").join("empty.bin"), b"").expect("write");
    let request = EmulationRequest::new(
        "DLINK",
        "firmwares/empty.bin",
        Some(Duration::from_secs(5)),
        None,
        Duration::from_secs(1800),
    )
    .expect("request");

    let outcome = run_emulation(&request, &firmae, &settings()).expect("run");
    assert_eq!(outcome.state, RunState::LaunchError);
    assert_eq!(outcome.status, EmulationStatus::LaunchError);
    assert!(outcome.exit.is_none());
}

#[test]
fn missing_tool_is_a_launch_error() {
    let (_dir, firmae) = firmae_with_tool("exit 0");
    let settings = Settings {
        emulation_tool: "./not-installed.sh".to_string(),
        ..settings()
    };
    let request = request(5);

    let outcome = run_emulation(&request, &firmae, &settings).expect("run");
    assert_eq!(outcome.state, RunState::LaunchError);
    assert!(matches!(outcome.exit, Some(ProcessExit::LaunchFailed { .. })));
    assert!(outcome.elapsed < Duration::from_secs(5));
}
