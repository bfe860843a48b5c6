//! CLI argument parsing for the emulation workflow.
//!
//! The CLI only gathers inputs; every command maps onto one core operation.
use crate::paths::DevicesTarget;
use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;

/// Root CLI entrypoint.
#[derive(Parser, Debug)]
#[command(
    name = "fwrig",
    version,
    about = "Run, diagnose, and scaffold firmware emulation environments",
    after_help = "Examples:\n  fwrig emulate --brand dlink --firmware firmwares/DIR868L.zip --timeout 900\n  fwrig classify --instance 3\n  fwrig scaffold --model DIR-868L --image ./DIR868L.zip --kernel-choice zImage-vexpress\n  fwrig devices upsert --field ID=firmware/DIR-868L --field memory=256M",
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct RootArgs {
    /// JSON config file (default: <config dir>/fwrig/config.json)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Emulation framework installation (overrides FIRMAE_HOME)
    #[arg(long, global = true, value_name = "DIR")]
    pub firmae_home: Option<PathBuf>,

    /// Device-environment tool installation (overrides EMUX_HOME)
    #[arg(long, global = true, value_name = "DIR")]
    pub emux_home: Option<PathBuf>,

    /// Raise log verbosity (-v info, -vv debug); RUST_LOG takes precedence
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    Emulate(EmulateArgs),
    Classify(ClassifyArgs),
    Scaffold(ScaffoldArgs),
    Kernels(KernelsArgs),
    #[command(subcommand)]
    Devices(DevicesCommand),
    #[command(subcommand)]
    Scratch(ScratchCommand),
    Rebuild(RebuildArgs),
}

#[derive(Parser, Debug)]
#[command(about = "Run one emulation attempt and report its outcome")]
pub struct EmulateArgs {
    /// Brand selector passed to the emulation framework
    #[arg(long, value_name = "BRAND")]
    pub brand: String,

    /// Firmware image, absolute or relative to the framework home
    #[arg(long, value_name = "PATH")]
    pub firmware: PathBuf,

    /// Deadline for the emulation process in seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// How long to wait for the completion marker (default: --timeout)
    #[arg(long, value_name = "SECS")]
    pub wait: Option<u64>,

    /// Watch this scratch instance instead of discovering the new one
    /// (required when several emulations run at the same time)
    #[arg(long, value_name = "ID")]
    pub instance: Option<String>,

    /// Emit machine-readable JSON output
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
#[command(about = "Rank likely failure causes from emulation logs")]
pub struct ClassifyArgs {
    /// Log files to classify (repeatable)
    #[arg(long = "log", value_name = "FILE", conflicts_with = "instance")]
    pub logs: Vec<PathBuf>,

    /// Scratch instance whose logs to classify (default: latest)
    #[arg(long, value_name = "ID")]
    pub instance: Option<String>,

    /// Emit machine-readable JSON output
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
#[command(about = "Create a device environment from the template")]
pub struct ScaffoldArgs {
    /// Device model; becomes the environment directory name
    #[arg(long, value_name = "MODEL")]
    pub model: String,

    /// Firmware image or archive (.zip, .tar, .tar.bz2)
    #[arg(long, value_name = "PATH")]
    pub image: PathBuf,

    /// Kernel file name from the template catalog (see `fwrig kernels`)
    #[arg(long, value_name = "NAME")]
    pub kernel_choice: Option<String>,

    /// Explicit kernel file
    #[arg(long, value_name = "PATH")]
    pub kernel_path: Option<PathBuf>,

    /// NVRAM file referenced from the device config
    #[arg(long, value_name = "PATH")]
    pub nvram: Option<PathBuf>,

    /// Also append the suggested row to a devices store (never replaces)
    #[arg(long, value_name = "TARGET", value_enum)]
    pub register: Option<DevicesTarget>,

    /// Emit machine-readable JSON output
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
#[command(about = "List kernels available in the template catalog")]
pub struct KernelsArgs {
    /// Emit machine-readable JSON output
    #[arg(long)]
    pub json: bool,
}

#[derive(Subcommand, Debug)]
pub enum DevicesCommand {
    /// Insert or update one row in a devices store
    Upsert(UpsertArgs),
}

#[derive(Args, Debug)]
pub struct UpsertArgs {
    /// Store to write
    #[arg(long, value_enum, default_value_t = DevicesTarget::Devices)]
    pub target: DevicesTarget,

    /// Complete CSV row (9 fields)
    #[arg(long, value_name = "CSV", conflicts_with = "fields", required_unless_present = "fields")]
    pub row: Option<String>,

    /// Column value as KEY=VALUE (repeatable); columns omitted for an
    /// existing ID keep their values
    #[arg(long = "field", value_name = "KEY=VALUE")]
    pub fields: Vec<String>,

    /// Fail instead of replacing an existing ID
    #[arg(long)]
    pub no_update: bool,

    /// Skip the timestamped backup
    #[arg(long)]
    pub no_backup: bool,

    /// Emit machine-readable JSON output
    #[arg(long)]
    pub json: bool,
}

#[derive(Subcommand, Debug)]
pub enum ScratchCommand {
    /// Remove every entry in the framework scratch directory
    Clean,
}

#[derive(Parser, Debug)]
#[command(about = "Rebuild the device-environment volume and container")]
pub struct RebuildArgs {
    /// Deadline per build step in seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Run the build scripts directly instead of through `sudo -n`
    #[arg(long)]
    pub no_sudo: bool,

    /// Emit machine-readable JSON output
    #[arg(long)]
    pub json: bool,
}
