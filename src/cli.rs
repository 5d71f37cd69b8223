use clap::Parser;
use std::path::PathBuf;

use crate::state::DEFAULT_STATE_DIR;

/// piprovision - provision a Raspberry Pi from a YAML manifest
#[derive(Parser, Debug)]
#[command(name = "piprovision")]
#[command(about = "Provision a Raspberry Pi from a declarative YAML manifest")]
#[command(version)]
pub struct Cli {
    /// Path to the manifest (default: config.yml)
    pub config: Option<PathBuf>,

    /// Directory holding completion markers
    #[arg(long, default_value = DEFAULT_STATE_DIR)]
    pub state_dir: PathBuf,

    /// Re-apply every unit even if its marker is present.
    ///
    /// Markers are not deleted; a successful forced run rewrites them.
    #[arg(long)]
    pub force: bool,

    /// Delete the markers of UNIT (including per-service markers) before
    /// running. May be repeated.
    #[arg(long, value_name = "UNIT")]
    pub reset: Vec<String>,

    /// Dry-run mode: show what would be executed without making changes.
    ///
    /// Reads (files, installed packages, service state) still come from the
    /// running system so the preview is realistic. No markers are written.
    #[arg(long)]
    pub dry_run: bool,

    /// Load and validate the manifest, print the flattened values as JSON
    /// (passwords and tokens masked), and exit.
    #[arg(long)]
    pub check: bool,

    /// List the units in execution order and exit
    #[arg(long)]
    pub list_units: bool,

    /// Log at debug level (RUST_LOG overrides)
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
