//! Pre-flight checks for the runtime environment
//!
//! Verifies, before any unit runs:
//! - Running with root privileges (EUID 0)
//! - The package and service managers are on `PATH`
//!
//! Failures are reported as warnings only. A run without them will see
//! individual units fail, which the report already surfaces.

use tracing::{debug, warn};

use crate::capabilities::ProcessRunner;

/// Binaries nearly every unit depends on.
const REQUIRED_BINARIES: &[&str] = &["apt-get", "systemctl"];

/// Binaries only some units use (warn at debug level if missing).
const OPTIONAL_BINARIES: &[&str] = &["curl", "git", "nmcli"];

/// Result of environment verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreflightReport {
    pub missing_binaries: Vec<String>,
    pub is_root: bool,
}

impl PreflightReport {
    /// Returns true if all checks passed
    pub fn is_ok(&self) -> bool {
        self.missing_binaries.is_empty() && self.is_root
    }

    /// Log one warning per failed check.
    pub fn log_warnings(&self) {
        if !self.is_root {
            warn!("Not running as root; most units will fail (try: sudo piprovision)");
        }
        for binary in &self.missing_binaries {
            warn!(binary = %binary, "Required binary not found on PATH");
        }
    }
}

/// Check if running as root (EUID 0)
fn is_running_as_root() -> bool {
    nix::unistd::geteuid().is_root()
}

/// Perform all checks against `process` and the current EUID.
pub fn verify_environment(process: &dyn ProcessRunner) -> PreflightReport {
    let missing_binaries = REQUIRED_BINARIES
        .iter()
        .filter(|binary| !process.command_exists(binary))
        .map(|binary| binary.to_string())
        .collect();

    for binary in OPTIONAL_BINARIES {
        if !process.command_exists(binary) {
            debug!("Optional binary not found: {}", binary);
        }
    }

    PreflightReport {
        missing_binaries,
        is_root: is_running_as_root(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::DryRunHost;

    #[test]
    fn test_simulated_host_has_required_binaries() {
        let host = DryRunHost::new();
        let report = verify_environment(&host);
        assert!(report.missing_binaries.is_empty());
        assert_eq!(report.is_ok(), report.is_root);
    }

    #[test]
    fn test_report_is_not_ok_when_binaries_missing() {
        let report = PreflightReport {
            missing_binaries: vec!["apt-get".to_string()],
            is_root: true,
        };
        assert!(!report.is_ok());
    }
}
