//! Fixed directory layouts of the two external installations.
use std::path::{Path, PathBuf};

/// Scratch log files the emulation framework writes per instance.
pub const SCRATCH_LOG_NAMES: [&str; 4] = [
    "makeImage.log",
    "makeNetwork.log",
    "qemu.final.serial.log",
    "emulation.log",
];

/// Layout of a FirmAE-style emulation framework installation.
#[derive(Debug, Clone)]
pub struct FirmaePaths {
    root: PathBuf,
}

impl FirmaePaths {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.root.join("scratch")
    }

    pub fn instance_dir(&self, instance_id: &str) -> PathBuf {
        self.scratch_dir().join(instance_id)
    }

    /// Completion marker written by the framework when an attempt finishes.
    pub fn marker_path(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id).join("result")
    }
}

/// Layout of an EMUX-style device environment installation.
#[derive(Debug, Clone)]
pub struct EmuxPaths {
    root: PathBuf,
}

impl EmuxPaths {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn emux_dir(&self) -> PathBuf {
        self.root.join("files").join("emux")
    }

    pub fn template_dir(&self) -> PathBuf {
        self.emux_dir().join("template")
    }

    pub fn kernel_catalog_dir(&self) -> PathBuf {
        self.template_dir().join("kernel")
    }

    pub fn firmware_root(&self) -> PathBuf {
        self.emux_dir().join("firmware")
    }

    pub fn devices_store(&self, target: DevicesTarget) -> PathBuf {
        self.emux_dir().join(target.file_name())
    }
}

/// Which shared devices store a row is written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum DevicesTarget {
    #[default]
    Devices,
    DevicesExtra,
}

impl DevicesTarget {
    pub fn file_name(self) -> &'static str {
        match self {
            DevicesTarget::Devices => "devices",
            DevicesTarget::DevicesExtra => "devices-extra",
        }
    }
}
