//! piprovision - main entry point
//!
//! Loads the manifest, runs every unit in order, and exits 0 only when no
//! unit failed.

use std::process::ExitCode;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use piprovision::capabilities::{Capabilities, DryRunHost, SystemHost};
use piprovision::cli::Cli;
use piprovision::config::Config;
use piprovision::orchestrator::Orchestrator;
use piprovision::preflight;
use piprovision::state::StateTracker;

/// Initialize the logger with appropriate settings
fn init_logger(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    // RUST_LOG overrides the flag
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Main application entry point
fn main() -> ExitCode {
    let cli = Cli::parse_args();
    init_logger(cli.verbose);
    info!(version = env!("CARGO_PKG_VERSION"), "piprovision starting");
    debug!(?cli, "CLI arguments parsed");

    let mut orchestrator = Orchestrator::with_default_units();

    if cli.list_units {
        for unit in orchestrator.units() {
            println!("{:<12} {}", unit.name(), unit.description());
        }
        return ExitCode::SUCCESS;
    }

    let config = match orchestrator.load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("✗ {}", e);
            return ExitCode::from(1);
        }
    };

    if cli.check {
        return match serde_json::to_string_pretty(&config.redacted()) {
            Ok(json) => {
                println!("{}", json);
                println!("✓ Configuration is valid");
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("Failed to render configuration: {}", e);
                ExitCode::from(1)
            }
        };
    }

    match run(&cli, &mut orchestrator, &config) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{}", e);
            ExitCode::from(1)
        }
    }
}

/// Execute every unit against the real system, or a recording host in
/// dry-run mode. Returns the process exit code.
fn run(cli: &Cli, orchestrator: &mut Orchestrator, config: &Config) -> piprovision::Result<u8> {
    let known: Vec<&str> = orchestrator.units().iter().map(|u| u.name()).collect();
    for unit in &cli.reset {
        if !known.contains(&unit.as_str()) {
            warn!(unit = %unit, "--reset names an unknown unit");
        }
    }

    if cli.dry_run {
        info!("Dry-run mode: no changes will be made");
        let host = DryRunHost::over_system();
        let state = StateTracker::read_only(&cli.state_dir, cli.force);
        for unit in &cli.reset {
            info!(unit = %unit, "[DRY RUN] Would clear markers");
        }

        let caps = Capabilities::from_host(&host);
        preflight::verify_environment(caps.process).log_warnings();
        let report = orchestrator.execute(config, caps, &state)?;
        info!(actions = host.actions().len(), "Dry run complete");
        return Ok(report.exit_code());
    }

    let host = SystemHost::new();
    let state = orchestrator.open_state(&cli.state_dir, cli.force)?;
    for unit in &cli.reset {
        let removed = state.clear_unit(unit)?;
        info!(unit = %unit, removed, "Markers cleared");
    }

    let caps = Capabilities::from_host(&host);
    preflight::verify_environment(caps.process).log_warnings();
    let report = orchestrator.execute(config, caps, &state)?;
    Ok(report.exit_code())
}
