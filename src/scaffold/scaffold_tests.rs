use super::*;
use std::io::Write;
use std::time::Duration;

struct Fixture {
    dir: tempfile::TempDir,
    emux: EmuxPaths,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let emux = EmuxPaths::new(dir.path().join("emux"));
        let template = emux.template_dir();
        fs::create_dir_all(emux.kernel_catalog_dir()).expect("catalog");
        fs::write(template.join("config"), "id=template\nnvram=/tmp/nvram.ini\n").expect("config");
        fs::write(template.join("run-init"), "#!/bin/sh\n").expect("extra file");
        fs::write(emux.kernel_catalog_dir().join("zImage-x"), b"kernel-x").expect("kernel");
        fs::write(emux.kernel_catalog_dir().join("vmlinux-malta-le"), b"kernel-m").expect("kernel");
        Self { dir, emux }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn zip_image(&self, name: &str, members: &[(&str, &[u8])]) -> PathBuf {
        let path = self.path(name);
        let mut zip = zip::ZipWriter::new(fs::File::create(&path).expect("create zip"));
        for (member, data) in members {
            zip.start_file(*member, zip::write::FileOptions::default())
                .expect("start member");
            zip.write_all(data).expect("write member");
        }
        zip.finish().expect("finish zip");
        path
    }

    fn plan(&self, model: &str, image: &Path, kernel: KernelSelection) -> FwResult<ScaffoldPlan> {
        ScaffoldPlan::new(&self.emux, model, image, kernel, None, self.dir.path())
    }
}

fn catalog(name: &str) -> KernelSelection {
    KernelSelection::Catalog(name.to_string())
}

#[cfg(unix)]
fn fake_tool(dir: &Path, body: &str) -> String {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join("fake-binwalk");
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write tool");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod");
    path.display().to_string()
}

#[test]
fn kernel_selection_requires_exactly_one_source() {
    assert!(matches!(
        KernelSelection::from_options(None, None),
        Err(FwError::Configuration(_))
    ));
    assert!(matches!(
        KernelSelection::from_options(Some("zImage-x".into()), Some(PathBuf::from("/k"))),
        Err(FwError::Configuration(_))
    ));
    assert_eq!(
        KernelSelection::from_options(Some("zImage-x".into()), None).expect("choice"),
        catalog("zImage-x")
    );
}

#[test]
fn model_names_are_sanitized() {
    assert_eq!(safe_dir_name("Archer C7 v2").expect("name"), "Archer_C7_v2");
    assert_eq!(safe_dir_name("DIR-868L/rev<A>").expect("name"), "DIR-868LrevA");
    assert!(matches!(
        safe_dir_name("///"),
        Err(FwError::Validation { what: "model", .. })
    ));
    assert!(safe_dir_name("..").is_err());
}

#[test]
fn plan_validation_happens_before_any_write() {
    let fx = Fixture::new();
    let image = fx.zip_image("fw.zip", &[("a.txt", b"a")]);

    let err = fx.plan("DIR-868L", &image, catalog("zImage-missing")).unwrap_err();
    assert!(err.to_string().contains("zImage-x"));

    let err = fx
        .plan("DIR-868L", &fx.path("absent.zip"), catalog("zImage-x"))
        .unwrap_err();
    assert!(matches!(err, FwError::PathResolution { .. }));

    let err = ScaffoldPlan::new(
        &fx.emux,
        "DIR-868L",
        &image,
        catalog("zImage-x"),
        Some(Path::new("missing-nvram.ini")),
        fx.dir.path(),
    )
    .unwrap_err();
    assert!(matches!(err, FwError::PathResolution { what: "nvram file", .. }));
    assert!(!fx.emux.firmware_root().exists());
}

#[test]
fn missing_template_is_a_path_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let emux = EmuxPaths::new(dir.path().to_path_buf());
    let err = ScaffoldPlan::new(
        &emux,
        "R7000",
        Path::new("fw.bin"),
        catalog("zImage-x"),
        None,
        dir.path(),
    )
    .unwrap_err();
    assert!(matches!(err, FwError::PathResolution { what: "template directory", .. }));
}

#[test]
fn zip_image_builds_complete_environment() {
    let fx = Fixture::new();
    let image = fx.zip_image(
        "fw.zip",
        &[
            ("readme.txt", b"release notes"),
            ("_fw.extracted/squashfs-root/etc/passwd", b"root:x:0:0\n"),
            ("_fw.extracted/squashfs-root/bin/busybox", b"\x7fELF"),
        ],
    );
    fs::create_dir_all(fx.emux.firmware_root().join("DIR-868L")).expect("existing env");
    let nvram = fx.path("nvram.ini");
    fs::write(&nvram, "lan_ipaddr=192.168.0.1\n").expect("nvram");

    let plan = ScaffoldPlan::new(
        &fx.emux,
        "DIR-868L",
        &image,
        catalog("zImage-x"),
        Some(&nvram),
        fx.dir.path(),
    )
    .expect("plan");
    assert_eq!(plan.dir_name(), "DIR-868L-2");

    let report = scaffold(plan, &Settings::default()).expect("scaffold");
    let dest = fx.emux.firmware_root().join("DIR-868L-2");
    assert!(dest.join("run-init").is_file());
    assert!(dest.join("fw.zip").is_file());
    assert!(dest.join("readme.txt").is_file());
    assert!(report.carved.is_empty());
    assert_eq!(
        report.rootfs.as_deref(),
        Some(dest.join("_fw.extracted").join("squashfs-root").as_path())
    );
    assert_eq!(report.tarball.as_deref(), Some(dest.join(ROOTFS_TARBALL).as_path()));
    assert!(report.warnings.is_empty(), "{:?}", report.warnings);

    let kernels: Vec<_> = fs::read_dir(dest.join("kernel"))
        .expect("kernel dir")
        .map(|entry| entry.expect("entry").file_name())
        .collect();
    assert_eq!(kernels, vec![std::ffi::OsString::from("zImage-x")]);

    let config = fs::read_to_string(dest.join("config")).expect("config");
    assert!(config.starts_with("id=firmware/DIR-868L-2\n"));
    let nvram_abs = nvram.canonicalize().expect("canonical");
    assert!(config.contains(&format!("nvram={}", nvram_abs.display())));

    assert_eq!(report.suggested_row.id, "firmware/DIR-868L-2");
    assert_eq!(report.suggested_row.qemuopts, "VEXPRESS1");
    assert_eq!(report.suggested_row.description, "DIR-868L");
}

#[test]
fn repeated_scaffolds_never_share_a_destination() {
    let fx = Fixture::new();
    let image = fx.path("fw.squashfs");
    fs::write(&image, b"hsqs").expect("image");

    let mut destinations = Vec::new();
    for _ in 0..3 {
        let plan = fx.plan("R7000", &image, catalog("vmlinux-malta-le")).expect("plan");
        let report = scaffold(plan, &Settings::default()).expect("scaffold");
        destinations.push(report.plan.destination.clone());
        assert!(report.rootfs.is_none());
        assert!(report.tarball.is_none());
        assert!(report
            .warnings
            .iter()
            .any(|w| w.starts_with("no root filesystem found")));
        assert_eq!(report.nvram, NvramChange::Commented { lines: 1 });
    }
    let names: Vec<_> = destinations
        .iter()
        .map(|path| path.file_name().expect("name").to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["R7000", "R7000-2", "R7000-3"]);
}

#[test]
fn zip_slip_fails_stage_step_and_keeps_destination() {
    let fx = Fixture::new();
    let image = fx.zip_image("evil.zip", &[("../../escape.txt", b"bad")]);
    let plan = fx.plan("Evil", &image, catalog("zImage-x")).expect("plan");
    let dest = plan.destination.clone();

    let err = scaffold(plan, &Settings::default()).unwrap_err();
    assert!(matches!(
        err,
        FwError::ScaffoldStep {
            step: ScaffoldStep::StageFirmware,
            ..
        }
    ));
    assert!(dest.join("config").is_file());
    assert!(!fx.emux.root().join("files").join("escape.txt").exists());
}

#[test]
fn multiple_rootfs_candidates_pick_shallowest_and_warn() {
    let fx = Fixture::new();
    let image = fx.zip_image(
        "fw.zip",
        &[
            ("b/deep/cramfs-root/etc/inittab", b"x"),
            ("a/rootfs/etc/inittab", b"x"),
            ("z/squashfs-root/etc/inittab", b"x"),
        ],
    );
    let plan = fx.plan("Multi", &image, catalog("zImage-x")).expect("plan");
    let dest = plan.destination.clone();

    let report = scaffold(plan, &Settings::default()).expect("scaffold");
    assert_eq!(report.rootfs.as_deref(), Some(dest.join("a").join("rootfs").as_path()));
    let extra: Vec<&String> = report
        .warnings
        .iter()
        .filter(|w| w.starts_with("additional rootfs candidate"))
        .collect();
    assert_eq!(extra.len(), 2);
}

#[cfg(unix)]
#[test]
fn carving_tool_extracts_embedded_filesystem() {
    let fx = Fixture::new();
    let tool = fake_tool(
        fx.dir.path(),
        "mkdir -p \"_$2.extracted/squashfs-root/etc\" && echo root > \"_$2.extracted/squashfs-root/etc/passwd\"",
    );
    let image = fx.path("DIR868L_FW.bin");
    fs::write(&image, b"\x27\x05\x19\x56").expect("image");
    let plan = fx.plan("DIR-868L", &image, catalog("zImage-x")).expect("plan");
    let dest = plan.destination.clone();
    let settings = Settings {
        carve_tool: tool,
        ..Settings::default()
    };

    let report = scaffold(plan, &settings).expect("scaffold");
    assert_eq!(report.carved, vec![dest.join("DIR868L_FW.bin")]);
    assert_eq!(
        report.rootfs.as_deref(),
        Some(
            dest.join("_DIR868L_FW.bin.extracted")
                .join("squashfs-root")
                .as_path()
        )
    );
    assert!(dest.join(ROOTFS_TARBALL).is_file());
}

#[cfg(unix)]
#[test]
fn carving_failures_are_step_errors_or_warnings() {
    let fx = Fixture::new();
    let image = fx.path("fw.trx");
    fs::write(&image, b"HDR0").expect("image");

    let missing = Settings {
        carve_tool: fx.path("no-binwalk").display().to_string(),
        ..Settings::default()
    };
    let plan = fx.plan("Trx", &image, catalog("zImage-x")).expect("plan");
    let err = scaffold(plan, &missing).unwrap_err();
    assert!(matches!(
        err,
        FwError::ScaffoldStep {
            step: ScaffoldStep::CarveImages,
            ..
        }
    ));

    let slow = Settings {
        carve_tool: fake_tool(fx.dir.path(), "sleep 30"),
        carve_timeout: Duration::from_millis(300),
        ..Settings::default()
    };
    let plan = fx.plan("Trx", &image, catalog("zImage-x")).expect("plan");
    let err = scaffold(plan, &slow).unwrap_err();
    let source = std::error::Error::source(&err).expect("source");
    assert!(source.to_string().contains("deadline"));

    let failing = Settings {
        carve_tool: fake_tool(fx.dir.path(), "echo 'no signatures' >&2; exit 1"),
        ..Settings::default()
    };
    let plan = fx.plan("Trx", &image, catalog("zImage-x")).expect("plan");
    let report = scaffold(plan, &failing).expect("scaffold");
    assert!(report
        .warnings
        .iter()
        .any(|w| w.contains("carving fw.trx exited with Some(1)")));
}

#[test]
fn kernel_catalog_is_listed_by_name() {
    let fx = Fixture::new();
    assert_eq!(
        list_kernels(&fx.emux).expect("list"),
        vec!["vmlinux-malta-le".to_string(), "zImage-x".to_string()]
    );
}
