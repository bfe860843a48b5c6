mod classify;
mod cli;
mod devices;
mod emulate;
mod error;
mod fsutil;
mod paths;
mod process;
mod rebuild;
mod scaffold;
mod settings;
mod util;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{
    ClassifyArgs, Command, DevicesCommand, EmulateArgs, KernelsArgs, RebuildArgs, RootArgs,
    ScaffoldArgs, ScratchCommand, UpsertArgs,
};
use devices::{RowInput, UpsertOutcome};
use emulate::{EmulationOutcome, EmulationRequest};
use serde::Serialize;
use settings::Settings;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let args = RootArgs::parse();
    init_logging(args.verbose);
    match run(args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(1)
        }
    }
}

/// Logs go to stderr; stdout carries command results only.
fn init_logging(verbose: u8) {
    let fallback = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Returns whether the operation succeeded.
fn run(args: RootArgs) -> Result<bool> {
    let mut settings = Settings::load(args.config.as_deref())?;
    settings.override_homes(args.firmae_home.as_deref(), args.emux_home.as_deref());

    match args.command {
        Command::Emulate(cmd) => cmd_emulate(&settings, cmd),
        Command::Classify(cmd) => cmd_classify(&settings, cmd),
        Command::Scaffold(cmd) => cmd_scaffold(&settings, cmd),
        Command::Kernels(cmd) => cmd_kernels(&settings, cmd),
        Command::Devices(DevicesCommand::Upsert(cmd)) => cmd_upsert(&settings, cmd),
        Command::Scratch(ScratchCommand::Clean) => {
            let homes = settings.homes()?;
            let removed = emulate::clean_scratch(&homes.firmae)?;
            println!(
                "removed {removed} entr{} from {}",
                if removed == 1 { "y" } else { "ies" },
                homes.firmae.scratch_dir().display()
            );
            Ok(true)
        }
        Command::Rebuild(cmd) => cmd_rebuild(&settings, cmd),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("serialize result")?;
    println!("{text}");
    Ok(())
}

fn print_warnings(warnings: &[String]) {
    for warning in warnings {
        println!("warning: {warning}");
    }
}

fn cmd_emulate(settings: &Settings, args: EmulateArgs) -> Result<bool> {
    let homes = settings.homes()?;
    let mut request = EmulationRequest::new(
        args.brand,
        args.firmware,
        args.timeout.map(Duration::from_secs),
        args.wait.map(Duration::from_secs),
        settings.default_timeout,
    )?;
    if let Some(instance) = args.instance {
        request = request.with_instance(instance);
    }

    let outcome = emulate::run_emulation(&request, &homes.firmae, settings)?;
    if args.json {
        print_json(&outcome)?;
    } else {
        print_outcome(&outcome);
    }
    Ok(outcome.is_success())
}

fn print_outcome(outcome: &EmulationOutcome<'_>) {
    println!("status: {:?} ({:?})", outcome.status, outcome.state);
    println!("command: {}", outcome.command);
    println!(
        "instance: {}",
        outcome.instance_id.as_deref().unwrap_or("(not identified)")
    );
    println!("elapsed: {:.1}s", outcome.elapsed.as_secs_f64());
    if let Some(marker) = &outcome.marker {
        println!("marker: {marker}");
    }
    if outcome.unknown_cause() {
        println!("diagnosis: unknown failure cause (no heuristic matched)");
    }
    for (index, hypothesis) in outcome.hypotheses.iter().enumerate() {
        println!(
            "{}. [rank {}] {}\n   > {}",
            index + 1,
            hypothesis.rank,
            hypothesis.reason,
            hypothesis.excerpt
        );
    }
    for log in &outcome.scratch_logs {
        let lines = log.tail.lines().count();
        println!("scratch log: {} ({lines} lines kept)", log.name);
    }
    print_warnings(&outcome.warnings);
}

#[derive(Serialize)]
struct ClassifyReport {
    sources: Vec<String>,
    hypotheses: Vec<classify::FailureHypothesis>,
}

fn cmd_classify(settings: &Settings, args: ClassifyArgs) -> Result<bool> {
    let mut sources = Vec::new();
    let mut text = String::new();
    if args.logs.is_empty() {
        let firmae = settings.firmae()?;
        let instance = match args.instance {
            Some(instance) => instance,
            None => emulate::latest_instance(&firmae.scratch_dir())
                .with_context(|| format!("no instances under {}", firmae.scratch_dir().display()))?,
        };
        let logs = emulate::collect_scratch_logs(&firmae, &instance);
        sources.extend(
            logs.iter()
                .map(|log| firmae.instance_dir(&instance).join(&log.name).display().to_string()),
        );
        text = emulate::render_scratch_logs(&logs);
    } else {
        for path in &args.logs {
            let bytes = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
            text.push_str(&String::from_utf8_lossy(&bytes));
            text.push('\n');
            sources.push(path.display().to_string());
        }
    }

    let report = ClassifyReport {
        sources,
        hypotheses: classify::classify(&util::strip_ansi(&text)),
    };
    if args.json {
        print_json(&report)?;
    } else if report.hypotheses.is_empty() {
        println!("unknown failure cause (no heuristic matched)");
    } else {
        for hypothesis in &report.hypotheses {
            println!("[rank {}] {}: {}", hypothesis.rank, hypothesis.reason, hypothesis.excerpt);
        }
    }
    Ok(true)
}

fn cmd_scaffold(settings: &Settings, args: ScaffoldArgs) -> Result<bool> {
    let homes = settings.homes()?;
    let kernel = scaffold::KernelSelection::from_options(args.kernel_choice, args.kernel_path)?;
    let cwd = std::env::current_dir().context("resolve working directory")?;
    let plan = scaffold::ScaffoldPlan::new(
        &homes.emux,
        &args.model,
        &args.image,
        kernel,
        args.nvram.as_deref(),
        &cwd,
    )?;
    let report = scaffold::scaffold(plan, settings)?;

    let registered = match args.register {
        Some(target) => Some(devices::upsert(
            &homes.emux.devices_store(target),
            RowInput::Row(report.suggested_row.clone()),
            false,
            true,
            settings.lock_wait,
        )?),
        None => None,
    };

    if args.json {
        #[derive(Serialize)]
        struct Output<'a> {
            #[serde(flatten)]
            report: &'a scaffold::ScaffoldReport,
            registered: Option<&'a UpsertOutcome>,
        }
        print_json(&Output {
            report: &report,
            registered: registered.as_ref(),
        })?;
        return Ok(true);
    }

    println!("destination: {}", report.plan.destination.display());
    println!("firmware: {}", report.plan.firmware_staging.display());
    println!("kernel: {}", report.kernel.display());
    println!("config: {}", report.config.display());
    match &report.nvram {
        scaffold::NvramChange::Set { path } => println!("nvram: set to {path}"),
        scaffold::NvramChange::Commented { lines } => println!("nvram: {lines} line(s) commented"),
    }
    println!("carved: {} file(s)", report.carved.len());
    match (&report.rootfs, &report.tarball) {
        (Some(rootfs), Some(tarball)) => {
            println!("rootfs: {} -> {}", rootfs.display(), tarball.display())
        }
        _ => println!("rootfs: not found"),
    }
    println!("suggested row: {}", report.suggested_row.to_csv_line()?);
    if let Some(outcome) = &registered {
        println!("registered in {}", outcome.store.display());
    }
    print_warnings(&report.warnings);
    Ok(true)
}

fn cmd_kernels(settings: &Settings, args: KernelsArgs) -> Result<bool> {
    let emux = settings.emux()?;
    let kernels = scaffold::list_kernels(&emux)?;
    if args.json {
        print_json(&kernels)?;
    } else if kernels.is_empty() {
        println!("no kernels in {}", emux.kernel_catalog_dir().display());
    } else {
        for kernel in &kernels {
            println!("{kernel}");
        }
    }
    Ok(true)
}

fn cmd_upsert(settings: &Settings, args: UpsertArgs) -> Result<bool> {
    let homes = settings.homes()?;
    let store = homes.emux.devices_store(args.target);
    let input = match args.row {
        Some(row) => RowInput::Line(row),
        None => RowInput::Fields(devices::parse_field_args(&args.fields)?),
    };
    let outcome = devices::upsert(&store, input, !args.no_update, !args.no_backup, settings.lock_wait)?;
    if args.json {
        print_json(&outcome)?;
    } else {
        println!(
            "{} {} in {}",
            if outcome.updated() { "updated" } else { "appended" },
            outcome.row.id,
            outcome.store.display()
        );
        if let Some(backup) = &outcome.backup {
            println!("backup: {}", backup.display());
        }
    }
    Ok(true)
}

fn cmd_rebuild(settings: &Settings, args: RebuildArgs) -> Result<bool> {
    let homes = settings.homes()?;
    let timeout = match args.timeout {
        Some(0) => return Err(error::FwError::validation("timeout", "must be positive").into()),
        Some(secs) => Duration::from_secs(secs),
        None => settings.rebuild_timeout,
    };
    let report = rebuild::rebuild(&homes.emux, timeout, !args.no_sudo)?;
    if args.json {
        print_json(&report)?;
    } else {
        for step in &report.steps {
            println!("--- {} ---", step.script);
            println!("command: {}", step.command);
            if !step.stdout.is_empty() {
                println!("{}", step.stdout.trim_end());
            }
            if !step.stderr.is_empty() {
                println!("[stderr]\n{}", step.stderr.trim_end());
            }
            if let Some(hint) = step.hint {
                println!("hint: {hint}");
            }
            println!("exit: {:?} after {:.1}s", step.exit, step.elapsed.as_secs_f64());
        }
        print_warnings(&report.warnings);
    }
    Ok(report.success())
}
