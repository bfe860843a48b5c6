//! Layered runtime configuration.
//!
//! Built-in defaults are overridden by an optional JSON file, then by the
//! `FIRMAE_HOME` / `EMUX_HOME` environment variables, then by CLI flags.
use crate::error::{FwError, FwResult};
use crate::paths::{EmuxPaths, FirmaePaths};
use crate::util::expand_home;
use serde::Deserialize;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const FIRMAE_HOME_ENV: &str = "FIRMAE_HOME";
pub const EMUX_HOME_ENV: &str = "EMUX_HOME";

/// On-disk shape of `config.json`. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SettingsFile {
    firmae_home: Option<PathBuf>,
    emux_home: Option<PathBuf>,
    emulation_tool: Option<String>,
    default_timeout_secs: Option<u64>,
    poll_interval_ms: Option<u64>,
    marker_grace_ms: Option<u64>,
    carve_tool: Option<String>,
    carve_timeout_secs: Option<u64>,
    lock_wait_ms: Option<u64>,
    rebuild_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub firmae_home: Option<PathBuf>,
    pub emux_home: Option<PathBuf>,
    /// Emulation entry point, resolved against `firmae_home` when relative.
    pub emulation_tool: String,
    pub default_timeout: Duration,
    pub poll_interval: Duration,
    pub marker_grace: Duration,
    pub carve_tool: String,
    pub carve_timeout: Duration,
    pub lock_wait: Duration,
    pub rebuild_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            firmae_home: None,
            emux_home: None,
            emulation_tool: "./run.sh".to_string(),
            default_timeout: Duration::from_secs(1800),
            poll_interval: Duration::from_millis(1000),
            marker_grace: Duration::from_millis(2000),
            carve_tool: "binwalk".to_string(),
            carve_timeout: Duration::from_secs(600),
            lock_wait: Duration::from_millis(5000),
            rebuild_timeout: Duration::from_secs(7200),
        }
    }
}

/// Both installation layouts, verified to exist.
#[derive(Debug, Clone)]
pub struct Homes {
    pub firmae: FirmaePaths,
    pub emux: EmuxPaths,
}

impl Settings {
    /// Load defaults, the config file, and the process environment.
    pub fn load(explicit_file: Option<&Path>) -> FwResult<Self> {
        let mut settings = Settings::default();
        match explicit_file {
            Some(path) => {
                if !path.is_file() {
                    return Err(FwError::Configuration(format!(
                        "config file {} does not exist",
                        path.display()
                    )));
                }
                settings.apply_file(path)?;
            }
            None => {
                if let Some(path) = default_config_path().filter(|path| path.is_file()) {
                    settings.apply_file(&path)?;
                }
            }
        }
        settings.apply_env(|key| std::env::var_os(key));
        Ok(settings)
    }

    fn apply_file(&mut self, path: &Path) -> FwResult<()> {
        let bytes = fs::read(path).map_err(|err| FwError::io(path, err))?;
        let file: SettingsFile = serde_json::from_slice(&bytes).map_err(|err| {
            FwError::Configuration(format!("parse {}: {err}", path.display()))
        })?;
        self.merge(file)
    }

    fn merge(&mut self, file: SettingsFile) -> FwResult<()> {
        if let Some(home) = file.firmae_home {
            self.firmae_home = Some(expand_home(&home));
        }
        if let Some(home) = file.emux_home {
            self.emux_home = Some(expand_home(&home));
        }
        if let Some(tool) = file.emulation_tool {
            self.emulation_tool = non_empty("emulation_tool", tool)?;
        }
        if let Some(tool) = file.carve_tool {
            self.carve_tool = non_empty("carve_tool", tool)?;
        }
        if let Some(secs) = file.default_timeout_secs {
            self.default_timeout = Duration::from_secs(positive("default_timeout_secs", secs)?);
        }
        if let Some(ms) = file.poll_interval_ms {
            self.poll_interval = Duration::from_millis(positive("poll_interval_ms", ms)?);
        }
        if let Some(ms) = file.marker_grace_ms {
            self.marker_grace = Duration::from_millis(positive("marker_grace_ms", ms)?);
        }
        if let Some(secs) = file.carve_timeout_secs {
            self.carve_timeout = Duration::from_secs(positive("carve_timeout_secs", secs)?);
        }
        if let Some(ms) = file.lock_wait_ms {
            self.lock_wait = Duration::from_millis(positive("lock_wait_ms", ms)?);
        }
        if let Some(secs) = file.rebuild_timeout_secs {
            self.rebuild_timeout = Duration::from_secs(positive("rebuild_timeout_secs", secs)?);
        }
        Ok(())
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<OsString>) {
        if let Some(home) = lookup(FIRMAE_HOME_ENV).filter(|value| !value.is_empty()) {
            self.firmae_home = Some(expand_home(Path::new(&home)));
        }
        if let Some(home) = lookup(EMUX_HOME_ENV).filter(|value| !value.is_empty()) {
            self.emux_home = Some(expand_home(Path::new(&home)));
        }
    }

    /// CLI overrides; applied last.
    pub fn override_homes(&mut self, firmae_home: Option<&Path>, emux_home: Option<&Path>) {
        if let Some(home) = firmae_home {
            self.firmae_home = Some(expand_home(home));
        }
        if let Some(home) = emux_home {
            self.emux_home = Some(expand_home(home));
        }
    }

    /// Resolve both installations. Called before any operation mutates disk.
    pub fn homes(&self) -> FwResult<Homes> {
        Ok(Homes {
            firmae: self.firmae()?,
            emux: self.emux()?,
        })
    }

    pub fn firmae(&self) -> FwResult<FirmaePaths> {
        require_home(self.firmae_home.as_deref(), FIRMAE_HOME_ENV).map(FirmaePaths::new)
    }

    pub fn emux(&self) -> FwResult<EmuxPaths> {
        require_home(self.emux_home.as_deref(), EMUX_HOME_ENV).map(EmuxPaths::new)
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("fwrig").join("config.json"))
}

fn require_home(value: Option<&Path>, env_name: &str) -> FwResult<PathBuf> {
    let Some(path) = value else {
        return Err(FwError::Configuration(format!(
            "{env_name} is not set (environment, config file, or flag)"
        )));
    };
    if !path.is_dir() {
        return Err(FwError::Configuration(format!(
            "{env_name} points to {}, which is not a directory",
            path.display()
        )));
    }
    Ok(path.to_path_buf())
}

fn positive(key: &'static str, value: u64) -> FwResult<u64> {
    if value == 0 {
        return Err(FwError::validation(key, "must be greater than zero"));
    }
    Ok(value)
}

fn non_empty(key: &'static str, value: String) -> FwResult<String> {
    if value.trim().is_empty() {
        return Err(FwError::validation(key, "must not be empty"));
    }
    Ok(value)
}
