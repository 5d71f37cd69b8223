//! piprovision library
//!
//! A small, reusable provisioning engine: an ordered registry of units,
//! each independently toggled by a flat YAML manifest, skipped once its
//! completion marker exists, and isolated so one failure does not stop the
//! rest of the run.

pub mod capabilities;
pub mod cli;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod preflight;
pub mod state;
pub mod unit;
pub mod units;

// Re-export main types for convenience
pub use capabilities::{Capabilities, Cmd, CommandOutput, DryRunHost, SystemHost};
pub use config::{Config, ConfigValue};
pub use error::{ConfigError, ProvisionError, Result};
pub use orchestrator::{Orchestrator, RunReport, RunStage};
pub use state::{StateKey, StateTracker};
pub use unit::{Outcome, Unit, UnitContext, UnitResult};
pub use units::default_units;
