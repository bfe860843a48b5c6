//! Typed failure taxonomy for the core operations.
//!
//! Every variant carries the path, identifier, or step name needed to act on
//! it without re-running. Timeouts and empty rootfs discovery are reported
//! results, not errors; `Timeout` only surfaces from helpers that have no
//! partial result to hand back.
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Boxed source for errors raised by anyhow-based helpers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum FwError {
    #[error("cannot resolve {what} {}: {detail}", path.display())]
    PathResolution {
        what: &'static str,
        path: PathBuf,
        detail: String,
    },

    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{operation} exceeded its {}s deadline", timeout.as_secs())]
    Timeout {
        operation: String,
        timeout: Duration,
    },

    #[error("scaffold step `{step}` failed (partial state left in {}): {source}", dest.display())]
    ScaffoldStep {
        step: ScaffoldStep,
        dest: PathBuf,
        #[source]
        source: BoxError,
    },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("device id {id:?} already exists in {} and updates are disabled", store.display())]
    DuplicateKey { id: String, store: PathBuf },

    #[error("{} is locked by another writer (gave up after {}ms)", store.display(), waited.as_millis())]
    Busy { store: PathBuf, waited: Duration },

    #[error("invalid {what}: {detail}")]
    Validation { what: &'static str, detail: String },

    #[error("I/O failure on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl FwError {
    pub fn validation(what: &'static str, detail: impl Into<String>) -> Self {
        Self::Validation {
            what,
            detail: detail.into(),
        }
    }

    pub fn path(what: &'static str, path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        Self::PathResolution {
            what,
            path: path.into(),
            detail: detail.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Named scaffolding steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaffoldStep {
    ResolveDestination,
    CopyTemplate,
    StageFirmware,
    CarveImages,
    DiscoverRootfs,
    PackageRootfs,
    PlaceKernel,
    UpdateConfig,
}

impl fmt::Display for ScaffoldStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScaffoldStep::ResolveDestination => "resolve-destination",
            ScaffoldStep::CopyTemplate => "copy-template",
            ScaffoldStep::StageFirmware => "stage-firmware",
            ScaffoldStep::CarveImages => "carve-images",
            ScaffoldStep::DiscoverRootfs => "discover-rootfs",
            ScaffoldStep::PackageRootfs => "package-rootfs",
            ScaffoldStep::PlaceKernel => "place-kernel",
            ScaffoldStep::UpdateConfig => "update-config",
        };
        f.write_str(name)
    }
}

pub type FwResult<T> = Result<T, FwError>;
