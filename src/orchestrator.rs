//! Orchestrator
//!
//! Owns the unit registry and drives one provisioning run through a
//! forward-only stage machine.
//!
//! # Stage Flow
//!
//! ```text
//! Init        resolve and read the manifest        (missing/unreadable: Aborted)
//!   ↓
//! Loading     parse, validate, open state dir      (invalid: Aborted)
//!   ↓
//! Executing   every unit in registry order
//!   ↓
//! Finalizing  aggregate reboot requests, reboot if any
//!   ↓
//! Done
//! ```
//!
//! Only `Init` and `Loading` can abort a run. A failed unit is recorded and
//! the next unit runs, unless the failed unit is critical, in which case the
//! remaining units are recorded as skipped.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::capabilities::Capabilities;
use crate::config::{self, Config, DEFAULT_MANIFEST};
use crate::error::{ProvisionError, Result};
use crate::state::{StateKey, StateTracker};
use crate::unit::{Outcome, Unit, UnitContext, UnitResult};
use crate::units::default_units;

// ============================================================================
// Run stages
// ============================================================================

/// Stages of one run, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum RunStage {
    Init = 0,
    Loading = 1,
    Executing = 2,
    Finalizing = 3,
    /// Terminal: the run completed (possibly with failed units)
    Done = 4,
    /// Terminal: the manifest could not be loaded
    Aborted = 255,
}

impl RunStage {
    #[inline]
    pub const fn order(self) -> u8 {
        self as u8
    }

    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Aborted)
    }

    /// Next stage in sequence, or `None` at a terminal stage.
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Init => Some(Self::Loading),
            Self::Loading => Some(Self::Executing),
            Self::Executing => Some(Self::Finalizing),
            Self::Finalizing => Some(Self::Done),
            Self::Done | Self::Aborted => None,
        }
    }

    pub const fn description(self) -> &'static str {
        match self {
            Self::Init => "Resolving manifest",
            Self::Loading => "Loading configuration",
            Self::Executing => "Executing units",
            Self::Finalizing => "Finalizing",
            Self::Done => "Run complete",
            Self::Aborted => "Run aborted",
        }
    }
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Errors from driving the stage machine out of order.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunTransitionError {
    #[error("Cannot transition from terminal stage '{from}'")]
    FromTerminalStage { from: RunStage },

    #[error("Cannot go back from '{from}' to '{to}'")]
    BackwardTransition { from: RunStage, to: RunStage },
}

impl From<RunTransitionError> for ProvisionError {
    fn from(err: RunTransitionError) -> Self {
        ProvisionError::general(err.to_string())
    }
}

/// Current stage plus the history of every stage entered.
#[derive(Debug, Clone)]
pub struct RunState {
    current: RunStage,
    aborted_at: Option<RunStage>,
    history: Vec<(RunStage, u64)>,
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}

impl RunState {
    pub fn new() -> Self {
        let mut state = Self {
            current: RunStage::Init,
            aborted_at: None,
            history: Vec::with_capacity(5),
        };
        state.record(RunStage::Init);
        state
    }

    #[inline]
    pub fn current(&self) -> RunStage {
        self.current
    }

    /// Stage during which the run aborted, if it did.
    #[inline]
    pub fn aborted_at(&self) -> Option<RunStage> {
        self.aborted_at
    }

    /// Every stage entered, with UNIX timestamps.
    pub fn history(&self) -> &[(RunStage, u64)] {
        &self.history
    }

    /// Move to the next stage.
    pub fn advance(&mut self) -> std::result::Result<RunStage, RunTransitionError> {
        let next = self
            .current
            .next()
            .ok_or(RunTransitionError::FromTerminalStage { from: self.current })?;
        self.record(next);
        self.current = next;
        debug!(stage = %next, "Run stage entered");
        Ok(next)
    }

    /// Advance through every intermediate stage up to `target`.
    pub fn advance_to(&mut self, target: RunStage) -> std::result::Result<(), RunTransitionError> {
        if target.order() < self.current.order() {
            return Err(RunTransitionError::BackwardTransition {
                from: self.current,
                to: target,
            });
        }
        while self.current != target {
            self.advance()?;
        }
        Ok(())
    }

    /// Abort from any non-terminal stage.
    pub fn abort(&mut self) -> std::result::Result<(), RunTransitionError> {
        if self.current.is_terminal() {
            return Err(RunTransitionError::FromTerminalStage { from: self.current });
        }
        self.aborted_at = Some(self.current);
        self.record(RunStage::Aborted);
        self.current = RunStage::Aborted;
        Ok(())
    }

    fn record(&mut self, stage: RunStage) {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.history.push((stage, timestamp));
    }
}

// ============================================================================
// Run report
// ============================================================================

/// Result of one unit within a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitRecord {
    pub name: &'static str,
    pub result: UnitResult,
}

/// Ordered results of one run. Built once, never persisted.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub entries: Vec<UnitRecord>,
    /// Critical unit whose failure stopped the remaining units.
    pub halted_by: Option<&'static str>,
    /// A unit or the OS asked for a reboot.
    pub reboot_required: bool,
    pub rebooted: bool,
    /// Set when the reboot was requested but could not be issued.
    pub reboot_error: Option<String>,
    /// `disable_modules` entries that match no registered unit.
    pub unknown_disabled: Vec<String>,
}

impl RunReport {
    fn push(&mut self, name: &'static str, result: UnitResult) {
        self.entries.push(UnitRecord { name, result });
    }

    /// Result for `name`, if the unit is registered.
    pub fn get(&self, name: &str) -> Option<&UnitResult> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| &e.result)
    }

    pub fn count(&self, outcome: Outcome) -> usize {
        self.entries
            .iter()
            .filter(|e| e.result.outcome == outcome)
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.count(Outcome::Failed)
    }

    pub fn names_with(&self, outcome: Outcome) -> Vec<&'static str> {
        self.entries
            .iter()
            .filter(|e| e.result.outcome == outcome)
            .map(|e| e.name)
            .collect()
    }

    /// 0 when nothing failed, 1 otherwise.
    pub fn exit_code(&self) -> u8 {
        if self.failed_count() > 0 || self.reboot_error.is_some() {
            1
        } else {
            0
        }
    }

    /// Log the pass/fail summary.
    pub fn log_summary(&self) {
        info!(
            succeeded = self.count(Outcome::Success),
            skipped = self.count(Outcome::Skipped),
            failed = self.failed_count(),
            "==> Summary"
        );
        for entry in &self.entries {
            match entry.result.outcome {
                Outcome::Failed => error!(unit = entry.name, "{}", entry.result),
                _ => info!(unit = entry.name, "{}", entry.result),
            }
        }
        if let Some(unit) = self.halted_by {
            error!(unit, "Critical unit failed; later units were not run");
        }
        if self.failed_count() == 0 {
            info!("Provisioning finished without failures");
        } else {
            error!(
                failed = ?self.names_with(Outcome::Failed),
                "Provisioning finished with failures"
            );
        }
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Drives the registered units through one run.
pub struct Orchestrator {
    units: Vec<Box<dyn Unit>>,
    run: RunState,
}

impl Orchestrator {
    pub fn new(units: Vec<Box<dyn Unit>>) -> Self {
        Self {
            units,
            run: RunState::new(),
        }
    }

    /// Orchestrator over the fixed unit catalogue.
    pub fn with_default_units() -> Self {
        Self::new(default_units())
    }

    pub fn units(&self) -> &[Box<dyn Unit>] {
        &self.units
    }

    pub fn stage(&self) -> RunStage {
        self.run.current()
    }

    pub fn run_state(&self) -> &RunState {
        &self.run
    }

    /// Init and Loading: read, parse, and validate the manifest.
    ///
    /// `None` uses `config.yml` in the working directory. Any error aborts
    /// the run; no unit will execute.
    pub fn load(&mut self, manifest: Option<&Path>) -> Result<Config> {
        if self.run.current() != RunStage::Init {
            return Err(RunTransitionError::BackwardTransition {
                from: self.run.current(),
                to: RunStage::Init,
            }
            .into());
        }

        let path = manifest
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_MANIFEST));
        info!(path = %path.display(), "==> Reading manifest");

        let content = match config::read_manifest(&path) {
            Ok(content) => content,
            Err(e) => return Err(self.abort_with(e)),
        };
        self.run.advance()?;

        let loaded = Config::from_manifest(&path, &content).and_then(|config| {
            config.validate()?;
            Ok(config)
        });
        match loaded {
            Ok(config) => {
                info!(keys = config.len(), "Configuration loaded");
                Ok(config)
            }
            Err(e) => Err(self.abort_with(e)),
        }
    }

    /// Loading: open the marker directory.
    ///
    /// An unusable directory aborts the run like an invalid manifest, before
    /// any unit executes.
    pub fn open_state(&mut self, dir: &Path, force: bool) -> Result<StateTracker> {
        self.run.advance_to(RunStage::Loading)?;
        match StateTracker::open(dir, force) {
            Ok(state) => Ok(state),
            Err(e) => Err(self.abort_with(e)),
        }
    }

    fn abort_with(&mut self, err: impl Into<ProvisionError>) -> ProvisionError {
        let err = err.into();
        error!("{}", err);
        if let Err(e) = self.run.abort() {
            warn!("{}", e);
        }
        err
    }

    /// Executing and Finalizing.
    ///
    /// A config built in memory (rather than via `load`) skips straight past
    /// the file stages.
    pub fn execute(
        &mut self,
        config: &Config,
        caps: Capabilities<'_>,
        state: &StateTracker,
    ) -> Result<RunReport> {
        self.run.advance_to(RunStage::Executing)?;
        info!(
            state_dir = %state.dir().display(),
            forced = state.is_forced(),
            read_only = state.is_read_only(),
            units = self.units.len(),
            "==> Executing units"
        );
        let mut report = self.execute_units(config, caps, state);

        self.run.advance()?;
        self.finalize(&mut report, caps);

        self.run.advance()?;
        Ok(report)
    }

    fn execute_units(
        &self,
        config: &Config,
        caps: Capabilities<'_>,
        state: &StateTracker,
    ) -> RunReport {
        let disabled: HashSet<String> = config.get_list("disable_modules").into_iter().collect();
        let mut report = RunReport::default();

        let mut unknown: Vec<String> = disabled
            .iter()
            .filter(|name| !self.units.iter().any(|unit| unit.name() == name.as_str()))
            .cloned()
            .collect();
        unknown.sort();
        for name in &unknown {
            warn!(unit = %name, "disable_modules names an unknown unit");
        }
        report.unknown_disabled = unknown;

        for unit in &self.units {
            let name = unit.name();

            if let Some(critical) = report.halted_by {
                report.push(
                    name,
                    UnitResult::skipped(format!("not run: critical unit '{}' failed", critical)),
                );
                continue;
            }

            if disabled.contains(name) {
                info!(unit = name, "Disabled by disable_modules");
                report.push(name, UnitResult::skipped("disabled by disable_modules"));
                continue;
            }

            if !unit.enabled(config) {
                debug!(unit = name, "Not enabled");
                report.push(name, UnitResult::skipped("not enabled"));
                continue;
            }

            let key = StateKey::unit(name);
            let uses_marker = !unit.tracks_own_state();
            if uses_marker && state.is_done(&key) {
                info!(unit = name, "Already applied, skipping");
                report.push(name, UnitResult::skipped("already applied"));
                continue;
            }

            info!(unit = name, "==> {}", unit.description());
            let mut ctx = UnitContext::new(name, config, caps, state);
            let mut result = unit.apply(&mut ctx);

            if uses_marker && result.outcome == Outcome::Success {
                if let Err(e) = state.mark_done(&key) {
                    result = UnitResult {
                        outcome: Outcome::Failed,
                        message: format!("{} (marker not written: {})", result.message, e),
                        ..result
                    };
                }
            }

            match result.outcome {
                Outcome::Success => info!(unit = name, "{}", result.message),
                Outcome::Skipped => info!(unit = name, "Skipped: {}", result.message),
                Outcome::Failed => error!(unit = name, "Failed: {}", result.message),
            }

            if result.is_failed() && unit.critical() {
                report.halted_by = Some(name);
            }
            report.push(name, result);
        }

        report
    }

    fn finalize(&self, report: &mut RunReport, caps: Capabilities<'_>) {
        let requested: Vec<&'static str> = report
            .entries
            .iter()
            .filter(|e| e.result.reboot_required)
            .map(|e| e.name)
            .collect();
        let os_pending = caps.reboot.os_reboot_pending();
        report.reboot_required = !requested.is_empty() || os_pending;

        report.log_summary();

        if !report.reboot_required {
            return;
        }

        warn!(units = ?requested, os_pending, "==> Rebooting to apply changes");
        match caps.reboot.reboot() {
            Ok(()) => report.rebooted = true,
            Err(e) => {
                error!("Reboot failed: {:#}", e);
                report.reboot_error = Some(format!("{:#}", e));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::DryRunHost;
    use crate::error::ConfigError;
    use std::fs;
    use tempfile::tempdir;

    struct Probe {
        name: &'static str,
        outcome: Outcome,
        reboot: bool,
        critical: bool,
    }

    impl Probe {
        fn ok(name: &'static str) -> Box<dyn Unit> {
            Box::new(Self {
                name,
                outcome: Outcome::Success,
                reboot: false,
                critical: false,
            })
        }

        fn failing(name: &'static str, critical: bool) -> Box<dyn Unit> {
            Box::new(Self {
                name,
                outcome: Outcome::Failed,
                reboot: false,
                critical,
            })
        }
    }

    impl Unit for Probe {
        fn name(&self) -> &'static str {
            self.name
        }

        fn description(&self) -> &'static str {
            "probe"
        }

        fn critical(&self) -> bool {
            self.critical
        }

        fn provision(&self, _ctx: &mut UnitContext<'_>) -> anyhow::Result<UnitResult> {
            match self.outcome {
                Outcome::Failed => anyhow::bail!("{} broke", self.name),
                Outcome::Skipped => Ok(UnitResult::skipped("nothing")),
                Outcome::Success => Ok(UnitResult::success("ok").reboot_if(self.reboot)),
            }
        }
    }

    #[test]
    fn test_stage_machine_is_forward_only() {
        let mut run = RunState::new();
        assert_eq!(run.current(), RunStage::Init);

        run.advance_to(RunStage::Finalizing).unwrap();
        assert_eq!(run.history().len(), 4);
        assert!(run.advance_to(RunStage::Loading).is_err());

        run.advance().unwrap();
        assert_eq!(run.current(), RunStage::Done);
        assert!(run.advance().is_err());
        assert!(run.abort().is_err());
    }

    #[test]
    fn test_load_missing_manifest_aborts_in_init() {
        let dir = tempdir().unwrap();
        let mut orchestrator = Orchestrator::new(Vec::new());

        let err = orchestrator
            .load(Some(&dir.path().join("absent.yml")))
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Config(ConfigError::NotFound { .. })));
        assert_eq!(orchestrator.stage(), RunStage::Aborted);
        assert_eq!(orchestrator.run_state().aborted_at(), Some(RunStage::Init));
    }

    #[test]
    fn test_load_bad_syntax_aborts_in_loading() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yml");
        fs::write(&path, "hostname: [unclosed\n").unwrap();
        let mut orchestrator = Orchestrator::new(Vec::new());

        let err = orchestrator.load(Some(&path)).unwrap_err();
        assert!(matches!(err, ProvisionError::Config(ConfigError::InvalidSyntax { .. })));
        assert_eq!(orchestrator.run_state().aborted_at(), Some(RunStage::Loading));
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yml");
        fs::write(&path, "hostname: not_a_host!\n").unwrap();
        let mut orchestrator = Orchestrator::new(Vec::new());

        let err = orchestrator.load(Some(&path)).unwrap_err();
        assert!(err.is_config());
        assert!(matches!(err, ProvisionError::Config(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_unusable_state_dir_aborts_in_loading() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, "").unwrap();
        let mut orchestrator = Orchestrator::new(vec![Probe::ok("a")]);

        let err = orchestrator
            .open_state(&blocker.join("state"), false)
            .unwrap_err();

        assert!(matches!(err, ProvisionError::State(_)));
        assert_eq!(orchestrator.stage(), RunStage::Aborted);
        assert_eq!(orchestrator.run_state().aborted_at(), Some(RunStage::Loading));

        let host = DryRunHost::new();
        let state = StateTracker::read_only(dir.path(), false);
        assert!(orchestrator
            .execute(&Config::default(), Capabilities::from_host(&host), &state)
            .is_err());
    }

    #[test]
    fn test_open_state_after_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yml");
        fs::write(&path, "hostname: pi\n").unwrap();
        let mut orchestrator = Orchestrator::new(Vec::new());

        orchestrator.load(Some(&path)).unwrap();
        let state = orchestrator.open_state(&dir.path().join("state"), true).unwrap();

        assert!(state.is_forced());
        assert!(!state.is_read_only());
        assert_eq!(state.dir(), dir.path().join("state"));
        assert_eq!(orchestrator.stage(), RunStage::Loading);
    }

    #[test]
    fn test_failure_does_not_stop_later_units() {
        let host = DryRunHost::new();
        let dir = tempdir().unwrap();
        let state = StateTracker::open(dir.path(), false).unwrap();
        let mut orchestrator =
            Orchestrator::new(vec![Probe::failing("a", false), Probe::ok("b")]);

        let report = orchestrator
            .execute(&Config::default(), Capabilities::from_host(&host), &state)
            .unwrap();

        assert!(report.get("a").unwrap().is_failed());
        assert_eq!(report.get("b").unwrap().outcome, Outcome::Success);
        assert_eq!(report.exit_code(), 1);
        assert!(state.is_done(&StateKey::unit("b")));
        assert!(!state.is_done(&StateKey::unit("a")));
        assert_eq!(orchestrator.stage(), RunStage::Done);
    }

    #[test]
    fn test_critical_failure_halts_remaining_units() {
        let host = DryRunHost::new();
        let state = StateTracker::read_only("/nonexistent", false);
        let mut orchestrator =
            Orchestrator::new(vec![Probe::failing("core", true), Probe::ok("later")]);

        let report = orchestrator
            .execute(&Config::default(), Capabilities::from_host(&host), &state)
            .unwrap();

        assert_eq!(report.halted_by, Some("core"));
        assert!(report.get("later").unwrap().is_skipped());
    }

    #[test]
    fn test_reboot_requested_by_unit() {
        let host = DryRunHost::new();
        let state = StateTracker::read_only("/nonexistent", false);
        let mut orchestrator = Orchestrator::new(vec![
            Probe::ok("a"),
            Box::new(Probe {
                name: "b",
                outcome: Outcome::Success,
                reboot: true,
                critical: false,
            }),
        ]);

        let report = orchestrator
            .execute(&Config::default(), Capabilities::from_host(&host), &state)
            .unwrap();

        assert!(report.reboot_required);
        assert!(report.rebooted);
        assert!(host.rebooted());
        assert_eq!(report.exit_code(), 0);
    }

    #[test]
    fn test_unknown_disabled_module_is_reported() {
        let host = DryRunHost::new();
        let state = StateTracker::read_only("/nonexistent", false);
        let config = Config::from_yaml("disable_modules: b, tailscal, zz\n").unwrap();
        let mut orchestrator = Orchestrator::new(vec![Probe::ok("a"), Probe::ok("b")]);

        let report = orchestrator
            .execute(&config, Capabilities::from_host(&host), &state)
            .unwrap();

        assert_eq!(report.unknown_disabled, vec!["tailscal", "zz"]);
        assert!(report.get("b").unwrap().is_skipped());
        assert_eq!(report.get("a").unwrap().outcome, Outcome::Success);
    }

    #[test]
    fn test_execute_twice_is_an_error() {
        let host = DryRunHost::new();
        let state = StateTracker::read_only("/nonexistent", false);
        let mut orchestrator = Orchestrator::new(vec![Probe::ok("a")]);
        let caps = Capabilities::from_host(&host);

        orchestrator.execute(&Config::default(), caps, &state).unwrap();
        assert!(orchestrator.execute(&Config::default(), caps, &state).is_err());
    }
}
