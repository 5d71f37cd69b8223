//! Provisioning units.
//!
//! A unit is one named, independently toggled provisioning step. It declares
//! an enablement predicate over the configuration and an idempotent body that
//! acts only through the capability ports.
//!
//! # Failure Policy
//!
//! - Optional sub-steps that fail are SoftWarnings: logged through
//!   `UnitContext::soft` / `UnitContext::warn`, never affecting the outcome.
//! - A failure of the unit's primary objective is returned as `Err` from
//!   `provision` and folded into a `Failed` result by `apply`. It never
//!   escapes into the orchestrator as an abort.

use std::fmt;
use std::path::PathBuf;
use strum::{Display, EnumString};
use tracing::warn;

use crate::capabilities::Capabilities;
use crate::config::Config;
use crate::state::StateTracker;

/// Outcome of a single unit in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Outcome {
    Success,
    Skipped,
    Failed,
}

/// Result of one `apply` invocation. Never mutated after it is returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitResult {
    pub outcome: Outcome,
    pub reboot_required: bool,
    pub message: String,
    /// SoftWarnings logged while the unit ran.
    pub warnings: Vec<String>,
}

impl UnitResult {
    fn with_outcome(outcome: Outcome, message: impl Into<String>) -> Self {
        Self {
            outcome,
            reboot_required: false,
            message: message.into(),
            warnings: Vec::new(),
        }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::with_outcome(Outcome::Success, message)
    }

    pub fn skipped(message: impl Into<String>) -> Self {
        Self::with_outcome(Outcome::Skipped, message)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::with_outcome(Outcome::Failed, message)
    }

    /// Request a reboot at the end of the run when `required` is true.
    pub fn reboot_if(mut self, required: bool) -> Self {
        self.reboot_required |= required;
        self
    }

    pub fn is_failed(&self) -> bool {
        self.outcome == Outcome::Failed
    }

    pub fn is_skipped(&self) -> bool {
        self.outcome == Outcome::Skipped
    }
}

impl fmt::Display for UnitResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.outcome, self.message)?;
        if self.reboot_required {
            write!(f, " (reboot required)")?;
        }
        Ok(())
    }
}

/// Everything a unit may touch while it runs.
pub struct UnitContext<'a> {
    pub config: &'a Config,
    pub caps: Capabilities<'a>,
    pub state: &'a StateTracker,
    unit: &'static str,
    warnings: Vec<String>,
}

impl<'a> UnitContext<'a> {
    pub fn new(
        unit: &'static str,
        config: &'a Config,
        caps: Capabilities<'a>,
        state: &'a StateTracker,
    ) -> Self {
        Self {
            config,
            caps,
            state,
            unit,
            warnings: Vec::new(),
        }
    }

    /// Name of the unit this context was built for.
    pub fn unit(&self) -> &'static str {
        self.unit
    }

    /// Log a SoftWarning.
    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!(unit = self.unit, "{}", message);
        self.warnings.push(message);
    }

    /// Run an optional sub-step: on error, log a SoftWarning and carry on.
    pub fn soft<T>(&mut self, what: &str, result: anyhow::Result<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                self.warn(format!("{} failed: {:#}", what, e));
                None
            }
        }
    }

    pub fn take_warnings(&mut self) -> Vec<String> {
        std::mem::take(&mut self.warnings)
    }

    /// Home directory of the configured user (default `pi`).
    pub fn user_home(&self) -> PathBuf {
        PathBuf::from(format!("/home/{}", self.username()))
    }

    /// Configured login user, `pi` when unset.
    pub fn username(&self) -> String {
        self.config
            .get_nonempty("username")
            .unwrap_or_else(|| "pi".to_string())
    }
}

/// A named, independently configured provisioning step.
pub trait Unit {
    /// Stable, unique identifier. Also the marker name.
    fn name(&self) -> &'static str;

    /// One-line human description for `--list-units`.
    fn description(&self) -> &'static str;

    /// Pure predicate over the configuration. Units without a toggle are
    /// always enabled.
    fn enabled(&self, _config: &Config) -> bool {
        true
    }

    /// A failed critical unit stops the remaining units from running.
    fn critical(&self) -> bool {
        false
    }

    /// Units that keep finer-grained markers themselves opt out of the
    /// orchestrator's unit-level marker.
    fn tracks_own_state(&self) -> bool {
        false
    }

    /// Unit body. Must converge when called on an already provisioned host.
    fn provision(&self, ctx: &mut UnitContext<'_>) -> anyhow::Result<UnitResult>;

    /// Run the body and fold any error into a `Failed` result.
    fn apply(&self, ctx: &mut UnitContext<'_>) -> UnitResult {
        let mut result = match self.provision(ctx) {
            Ok(result) => result,
            Err(e) => UnitResult::failed(format!("{:#}", e)),
        };
        result.warnings.extend(ctx.take_warnings());
        result
    }
}

/// Return `content` with `line` appended if no existing line equals it.
///
/// Returns `None` when the line is already present, so callers can skip the
/// write entirely.
pub fn ensure_line(content: &str, line: &str) -> Option<String> {
    if content.lines().any(|existing| existing.trim() == line.trim()) {
        return None;
    }

    let mut updated = content.to_string();
    if !updated.is_empty() && !updated.ends_with('\n') {
        updated.push('\n');
    }
    updated.push_str(line);
    updated.push('\n');
    Some(updated)
}

/// Apply `unit` once against a simulated host.
#[cfg(test)]
pub(crate) fn apply_with(
    unit: &dyn Unit,
    config: &Config,
    host: &crate::capabilities::DryRunHost,
    state: &StateTracker,
) -> UnitResult {
    let mut ctx = UnitContext::new(unit.name(), config, Capabilities::from_host(host), state);
    unit.apply(&mut ctx)
}

/// Apply `unit` once with an inline manifest and no persisted markers.
#[cfg(test)]
pub(crate) fn apply_yaml(
    unit: &dyn Unit,
    yaml: &str,
    host: &crate::capabilities::DryRunHost,
) -> UnitResult {
    let config = Config::from_yaml(yaml).expect("test manifest parses");
    let state = StateTracker::read_only("/nonexistent/piprovision-test", false);
    apply_with(unit, &config, host, &state)
}
