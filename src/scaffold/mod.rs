//! Environment scaffolding.
//!
//! [`ScaffoldPlan::new`] validates every input without touching disk;
//! [`scaffold`] then materializes the plan step by step. A failed step
//! leaves the destination in place for inspection and names the step in the
//! returned [`FwError::ScaffoldStep`].
mod config;
mod device;

pub use config::{patch_config, NvramChange};
pub use device::suggest_row;

use crate::devices::DeviceConfigRow;
use crate::error::{BoxError, FwError, FwResult, ScaffoldStep};
use crate::fsutil::{
    copy_tree, create_tar_bz2, extract_archive, find_marker_dirs, list_files, unique_path,
    ArchiveKind, WalkLimits,
};
use crate::paths::EmuxPaths;
use crate::process::{supervise, CommandSpec, ProcessExit};
use crate::settings::Settings;
use crate::util::{expand_path, truncate_string};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Directory names that identify an extracted root filesystem.
pub const ROOTFS_MARKERS: [&str; 5] = [
    "squashfs-root",
    "cramfs-root",
    "jffs2-root",
    "ubifs-root",
    "rootfs",
];

/// File name suffixes handed to the carving tool.
const CARVE_SUFFIXES: [&str; 6] = [".bin", ".img", ".trx", ".chk", ".bin.enc", ".bin.enc2"];

pub const ROOTFS_TARBALL: &str = "rootfs.tar.bz2";

/// Kernel to place into the new environment. Exactly one source is allowed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum KernelSelection {
    /// File name inside the template kernel catalog.
    Catalog(String),
    Path(PathBuf),
}

impl KernelSelection {
    pub fn from_options(choice: Option<String>, path: Option<PathBuf>) -> FwResult<Self> {
        match (choice, path) {
            (Some(choice), None) => Ok(Self::Catalog(choice)),
            (None, Some(path)) => Ok(Self::Path(path)),
            (None, None) => Err(FwError::Configuration(
                "a kernel is required: pass a catalog choice or a kernel path".to_string(),
            )),
            (Some(_), Some(_)) => Err(FwError::Configuration(
                "pass only one of a kernel catalog choice or a kernel path".to_string(),
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScaffoldPlan {
    pub model: String,
    pub destination: PathBuf,
    pub image: PathBuf,
    /// Where the image is copied inside the destination.
    pub firmware_staging: PathBuf,
    pub kernel: KernelSelection,
    /// Resolved kernel file.
    pub kernel_source: PathBuf,
    pub nvram: Option<PathBuf>,
    #[serde(skip)]
    template: PathBuf,
}

impl ScaffoldPlan {
    /// Resolve and validate all inputs. Nothing is created on disk.
    ///
    /// Relative paths are resolved against `base` (normally the working
    /// directory).
    pub fn new(
        emux: &EmuxPaths,
        model: &str,
        image: &Path,
        kernel: KernelSelection,
        nvram: Option<&Path>,
        base: &Path,
    ) -> FwResult<Self> {
        let dir_name = safe_dir_name(model)?;
        let template = emux.template_dir();
        if !template.is_dir() {
            return Err(FwError::path("template directory", template, "not found"));
        }

        let image = expand_path(image, base);
        if !image.is_file() {
            return Err(FwError::path("firmware image", image, "not found or not a file"));
        }
        let kernel_source = resolve_kernel(emux, &kernel, base)?;
        let nvram = match nvram {
            Some(path) => {
                let path = expand_path(path, base);
                if !path.exists() {
                    return Err(FwError::path("nvram file", path, "not found"));
                }
                Some(path)
            }
            None => None,
        };

        let destination = unique_path(&emux.firmware_root().join(&dir_name))
            .map_err(|err| step_error(ScaffoldStep::ResolveDestination, emux.firmware_root(), err))?;
        let image_name = image
            .file_name()
            .ok_or_else(|| FwError::path("firmware image", &image, "has no file name"))?;
        let firmware_staging = destination.join(image_name);

        Ok(Self {
            model: model.to_string(),
            destination,
            image,
            firmware_staging,
            kernel,
            kernel_source,
            nvram,
            template,
        })
    }

    pub fn dir_name(&self) -> String {
        self.destination
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Directory name for `model`: spaces become `_`, anything outside
/// `[A-Za-z0-9_.-]` is dropped.
pub fn safe_dir_name(model: &str) -> FwResult<String> {
    let name: String = model
        .replace(' ', "_")
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.'))
        .collect();
    if name.is_empty() || name.chars().all(|ch| ch == '.') {
        return Err(FwError::validation(
            "model",
            format!("{model:?} has no usable characters for a directory name"),
        ));
    }
    Ok(name)
}

/// Regular files in the template kernel catalog, by name.
pub fn list_kernels(emux: &EmuxPaths) -> FwResult<Vec<String>> {
    let dir = emux.kernel_catalog_dir();
    if !dir.is_dir() {
        return Err(FwError::path("kernel catalog", dir, "not found"));
    }
    let files = list_files(&dir).map_err(|err| FwError::path("kernel catalog", &dir, format!("{err:#}")))?;
    Ok(files
        .iter()
        .filter_map(|path| path.file_name())
        .map(|name| name.to_string_lossy().into_owned())
        .collect())
}

fn resolve_kernel(emux: &EmuxPaths, kernel: &KernelSelection, base: &Path) -> FwResult<PathBuf> {
    match kernel {
        KernelSelection::Catalog(choice) => {
            let available = list_kernels(emux)?;
            if !available.iter().any(|name| name == choice) {
                let listing = if available.is_empty() {
                    "(none)".to_string()
                } else {
                    available.join(", ")
                };
                return Err(FwError::Configuration(format!(
                    "kernel choice {choice:?} is not in the catalog; available: {listing}"
                )));
            }
            Ok(emux.kernel_catalog_dir().join(choice))
        }
        KernelSelection::Path(path) => {
            let path = expand_path(path, base);
            if !path.is_file() {
                return Err(FwError::path("kernel", path, "not found or not a file"));
            }
            Ok(path)
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ScaffoldReport {
    pub plan: ScaffoldPlan,
    /// Files extracted from an archive image.
    pub extracted: Vec<PathBuf>,
    /// Files passed to the carving tool.
    pub carved: Vec<PathBuf>,
    pub rootfs: Option<PathBuf>,
    pub tarball: Option<PathBuf>,
    pub kernel: PathBuf,
    pub config: PathBuf,
    pub nvram: NvramChange,
    /// Not persisted; pass to [`crate::devices::upsert`] to register it.
    pub suggested_row: DeviceConfigRow,
    pub warnings: Vec<String>,
}

/// Materialize `plan` under the firmware environments root.
pub fn scaffold(plan: ScaffoldPlan, settings: &Settings) -> FwResult<ScaffoldReport> {
    let dest = plan.destination.clone();
    let mut warnings = Vec::new();
    tracing::info!(model = %plan.model, dest = %dest.display(), "scaffolding environment");

    copy_tree(&plan.template, &dest).map_err(|err| step_error(ScaffoldStep::CopyTemplate, &dest, err))?;

    let extracted = stage_firmware(&plan).map_err(|err| step_error(ScaffoldStep::StageFirmware, &dest, err))?;

    let carved = carve_images(&dest, settings, &mut warnings)?;

    let discovery = find_marker_dirs(&dest, &ROOTFS_MARKERS, WalkLimits::default());
    if discovery.truncated {
        warn(&mut warnings, "rootfs search hit its depth or entry limit; results may be incomplete".to_string());
    }
    for dir in &discovery.unreadable {
        warn(&mut warnings, format!("could not read {} during rootfs search", dir.display()));
    }
    let rootfs = discovery.selected().map(Path::to_path_buf);
    match &rootfs {
        Some(selected) => {
            tracing::info!(rootfs = %selected.display(), step = %ScaffoldStep::DiscoverRootfs, "rootfs selected");
            for other in discovery.others() {
                warn(
                    &mut warnings,
                    format!("additional rootfs candidate ignored: {}", other.display()),
                );
            }
        }
        None => warn(
            &mut warnings,
            format!("no root filesystem found under {}", dest.display()),
        ),
    }

    let tarball = match &rootfs {
        Some(selected) => {
            let tarball = dest.join(ROOTFS_TARBALL);
            create_tar_bz2(selected, &tarball)
                .map_err(|err| step_error(ScaffoldStep::PackageRootfs, &dest, err))?;
            Some(tarball)
        }
        None => None,
    };

    let kernel = place_kernel(&dest, &plan.kernel_source)
        .map_err(|err| step_error(ScaffoldStep::PlaceKernel, &dest, err))?;

    let config = dest.join("config");
    let nvram = update_config(&config, &plan.dir_name(), plan.nvram.as_deref())
        .map_err(|err| step_error(ScaffoldStep::UpdateConfig, &dest, err))?;

    let kernel_name = kernel
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let suggested_row = suggest_row(&plan.dir_name(), &kernel_name, &plan.model);

    tracing::info!(dest = %dest.display(), carved = carved.len(), warnings = warnings.len(), "scaffold complete");
    Ok(ScaffoldReport {
        plan,
        extracted,
        carved,
        rootfs,
        tarball,
        kernel,
        config,
        nvram,
        suggested_row,
        warnings,
    })
}

fn warn(warnings: &mut Vec<String>, message: String) {
    tracing::warn!("{message}");
    warnings.push(message);
}

fn step_error(step: ScaffoldStep, dest: impl Into<PathBuf>, err: impl Into<BoxError>) -> FwError {
    FwError::ScaffoldStep {
        step,
        dest: dest.into(),
        source: err.into(),
    }
}

/// Copy the image in; unpack it next to itself when it is an archive.
fn stage_firmware(plan: &ScaffoldPlan) -> anyhow::Result<Vec<PathBuf>> {
    use anyhow::Context;
    fs::copy(&plan.image, &plan.firmware_staging).with_context(|| {
        format!(
            "copy {} -> {}",
            plan.image.display(),
            plan.firmware_staging.display()
        )
    })?;
    let Some(kind) = ArchiveKind::detect(&plan.firmware_staging) else {
        return Ok(Vec::new());
    };
    extract_archive(&plan.firmware_staging, kind, &plan.destination)
}

fn is_carve_candidate(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
        return false;
    };
    let name = name.to_ascii_lowercase();
    CARVE_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
}

/// Run the carving tool over image files at the top of `dest`.
fn carve_images(dest: &Path, settings: &Settings, warnings: &mut Vec<String>) -> FwResult<Vec<PathBuf>> {
    let step = ScaffoldStep::CarveImages;
    let candidates: Vec<PathBuf> = list_files(dest)
        .map_err(|err| step_error(step, dest, err))?
        .into_iter()
        .filter(|path| is_carve_candidate(path))
        .collect();
    if candidates.is_empty() {
        return Ok(candidates);
    }

    let tool = which::which(&settings.carve_tool).map_err(|err| {
        step_error(
            step,
            dest,
            FwError::Launch {
                program: settings.carve_tool.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, err.to_string()),
            },
        )
    })?;

    for candidate in &candidates {
        let name = candidate
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let spec = CommandSpec::new(&tool, dest).arg("-e").arg(name.clone());
        let run = supervise(&spec, settings.carve_timeout, None);
        warnings.extend(run.warnings.iter().cloned());
        match &run.exit {
            ProcessExit::LaunchFailed { error } => {
                return Err(step_error(
                    step,
                    dest,
                    FwError::Launch {
                        program: spec.display(),
                        source: std::io::Error::other(error.clone()),
                    },
                ));
            }
            ProcessExit::TimedOut => {
                return Err(step_error(
                    step,
                    dest,
                    FwError::Timeout {
                        operation: spec.display(),
                        timeout: settings.carve_timeout,
                    },
                ));
            }
            _ if !run.success() => {
                let detail = truncate_string(run.stderr.trim(), 300);
                warn(
                    warnings,
                    format!("carving {name} exited with {:?}: {detail}", run.exit_code()),
                );
            }
            _ => tracing::debug!(file = %name, elapsed_ms = run.elapsed.as_millis() as u64, "carved"),
        }
    }
    Ok(candidates)
}

/// Replace the files in `dest/kernel` with the chosen kernel.
fn place_kernel(dest: &Path, source: &Path) -> anyhow::Result<PathBuf> {
    use anyhow::{anyhow, Context};
    let kernel_dir = dest.join("kernel");
    fs::create_dir_all(&kernel_dir).with_context(|| format!("create {}", kernel_dir.display()))?;
    for stale in list_files(&kernel_dir)? {
        fs::remove_file(&stale).with_context(|| format!("remove {}", stale.display()))?;
    }
    let name = source
        .file_name()
        .ok_or_else(|| anyhow!("kernel {} has no file name", source.display()))?;
    let target = kernel_dir.join(name);
    fs::copy(source, &target)
        .with_context(|| format!("copy {} -> {}", source.display(), target.display()))?;
    Ok(target)
}

fn update_config(path: &Path, dir_name: &str, nvram: Option<&Path>) -> anyhow::Result<NvramChange> {
    use anyhow::Context;
    let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let nvram = nvram
        .map(|nvram| nvram.canonicalize().with_context(|| format!("resolve {}", nvram.display())))
        .transpose()?;
    let (patched, change) = patch_config(&text, dir_name, nvram.as_deref());
    fs::write(path, patched).with_context(|| format!("write {}", path.display()))?;
    Ok(change)
}

#[cfg(test)]
#[path = "scaffold_tests.rs"]
mod tests;
