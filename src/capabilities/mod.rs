//! Capability ports.
//!
//! Units never touch the OS directly. Every side effect goes through one of
//! the traits below, bundled into a `Capabilities` value that the
//! orchestrator hands to each unit.
//!
//! # Implementations
//!
//! - `system::SystemHost` - apt-get, systemctl, std::fs, curl
//! - `dry_run::DryRunHost` - in-memory simulation that records every call;
//!   backs `--dry-run` and the test suite
//!
//! # Contract
//!
//! - `install` and `write_file` are idempotent: repeating a call with the
//!   same arguments converges to the same end state.
//! - `run` returns `Ok` with a non-zero exit code for commands that ran and
//!   failed; `Err` is reserved for commands that could not be started.

pub mod dry_run;
pub mod system;

use anyhow::Result;
use std::fmt;
use std::path::Path;

pub use dry_run::DryRunHost;
pub use system::SystemHost;

// ============================================================================
// Commands
// ============================================================================

/// An external command: program, arguments, environment, optional stdin.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cmd {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub stdin: Option<String>,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Feed `input` to the command's standard input.
    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }
}

impl fmt::Display for Cmd {
    /// Command line without stdin or environment values, safe for logs.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Output from an external command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Standard output from the command.
    pub stdout: String,
    /// Standard error from the command.
    pub stderr: String,
    /// Exit code (None if terminated by signal).
    pub exit_code: Option<i32>,
    /// Whether the command exited successfully (exit code 0).
    pub success: bool,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: Some(0),
            success: true,
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code: Some(code),
            success: false,
        }
    }

    /// Check if the command succeeded and return an error if not.
    pub fn ensure_success(&self, context: &str) -> Result<()> {
        if self.success {
            Ok(())
        } else {
            let code = self.exit_code.unwrap_or(-1);
            anyhow::bail!(
                "{} failed (exit code {}): {}",
                context,
                code,
                self.stderr.trim()
            )
        }
    }
}

// ============================================================================
// Ports
// ============================================================================

/// Installs OS packages by name.
pub trait PackageInstaller {
    /// Refresh the package index.
    fn refresh(&self) -> Result<()>;

    /// Install packages; already-installed packages are a no-op.
    fn install(&self, packages: &[&str]) -> Result<()>;

    fn is_installed(&self, package: &str) -> bool;
}

/// Controls systemd units.
pub trait ServiceManager {
    fn daemon_reload(&self) -> Result<()>;

    /// Enable a unit, optionally starting it right away.
    fn enable(&self, unit: &str, now: bool) -> Result<()>;

    /// Disable and stop a unit.
    fn disable(&self, unit: &str) -> Result<()>;

    fn restart(&self, unit: &str) -> Result<()>;

    fn is_active(&self, unit: &str) -> bool;
}

/// Writes files and directories.
pub trait FileWriter {
    /// Write `content` to `path` with an optional octal mode, creating parent
    /// directories. Returns `true` if the file content changed.
    fn write_file(&self, path: &Path, content: &str, mode: Option<u32>) -> Result<bool>;

    fn create_dir(&self, path: &Path) -> Result<()>;

    /// Current file content, or `None` if the file is absent or unreadable.
    fn read_file(&self, path: &Path) -> Option<String>;

    fn exists(&self, path: &Path) -> bool;
}

/// Runs external commands to completion.
pub trait ProcessRunner {
    fn run(&self, cmd: &Cmd) -> Result<CommandOutput>;

    /// True if `program` is found on `PATH`.
    fn command_exists(&self, program: &str) -> bool;
}

/// Fetches a URL to a local path.
pub trait Downloader {
    fn download(&self, url: &str, dest: &Path) -> Result<()>;
}

/// Requests an OS reboot.
pub trait RebootSignal {
    /// True if the OS itself reports that a reboot is pending.
    fn os_reboot_pending(&self) -> bool;

    /// Reboot now. On a real host this does not return on success.
    fn reboot(&self) -> Result<()>;
}

/// Every port a unit may use, as borrowed trait objects.
#[derive(Clone, Copy)]
pub struct Capabilities<'a> {
    pub packages: &'a dyn PackageInstaller,
    pub services: &'a dyn ServiceManager,
    pub files: &'a dyn FileWriter,
    pub process: &'a dyn ProcessRunner,
    pub downloader: &'a dyn Downloader,
    pub reboot: &'a dyn RebootSignal,
}

impl<'a> Capabilities<'a> {
    /// Borrow every port from a single host implementation.
    pub fn from_host<H>(host: &'a H) -> Self
    where
        H: PackageInstaller + ServiceManager + FileWriter + ProcessRunner + Downloader + RebootSignal,
    {
        Self {
            packages: host,
            services: host,
            files: host,
            process: host,
            downloader: host,
            reboot: host,
        }
    }

    /// Run a command and fail unless it exits 0.
    pub fn run_checked(&self, cmd: &Cmd) -> Result<CommandOutput> {
        let output = self.process.run(cmd)?;
        output.ensure_success(&cmd.to_string())?;
        Ok(output)
    }
}

impl fmt::Debug for Capabilities<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capabilities").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cmd_builder_and_display() {
        let cmd = Cmd::new("git")
            .args(["-C", "/opt/kiauh"])
            .arg("pull")
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin("secret");

        assert_eq!(cmd.to_string(), "git -C /opt/kiauh pull");
        assert_eq!(cmd.env.len(), 1);
        assert_eq!(cmd.stdin.as_deref(), Some("secret"));
    }

    #[test]
    fn test_ensure_success() {
        assert!(CommandOutput::ok("").ensure_success("true").is_ok());

        let err = CommandOutput::failed(2, "boom\n")
            .ensure_success("apt-get install")
            .unwrap_err();
        assert_eq!(err.to_string(), "apt-get install failed (exit code 2): boom");
    }
}
