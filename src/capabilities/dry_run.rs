//! Recording capability host.
//!
//! Simulates packages, services, files, users, and command availability in
//! memory and records every mutating call as a one-line action. Two modes:
//!
//! - `DryRunHost::new()` - fully simulated, starts from an empty host
//! - `DryRunHost::over_system()` - reads (file contents, installed packages,
//!   `PATH` lookups, service state) pass through to the real system; writes
//!   stay in memory. Backs `--dry-run`.

use anyhow::{Result, anyhow};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::info;

use super::system::SystemHost;
use super::{
    Cmd, CommandOutput, Downloader, FileWriter, PackageInstaller, ProcessRunner, RebootSignal,
    ServiceManager,
};

/// Commands a freshly simulated host has on `PATH`. Container runtimes are
/// deliberately absent until their package is installed.
const BASE_COMMANDS: &[&str] = &[
    "sh", "bash", "apt-get", "dpkg-query", "systemctl", "git", "curl", "tar", "install", "id",
    "useradd", "usermod", "chpasswd", "chown", "hostnamectl", "timedatectl", "locale-gen",
    "update-locale", "nmcli", "uname",
];

/// Packages whose binary name differs from the package name.
const PACKAGE_BINARIES: &[(&str, &str)] = &[("docker.io", "docker")];

/// Observable end state of a simulated host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostState {
    pub files: BTreeMap<PathBuf, String>,
    pub modes: BTreeMap<PathBuf, u32>,
    pub dirs: BTreeSet<PathBuf>,
    pub packages: BTreeSet<String>,
    pub enabled_services: BTreeSet<String>,
    pub active_services: BTreeSet<String>,
    pub disabled_services: BTreeSet<String>,
    pub users: BTreeSet<String>,
    pub group_members: BTreeSet<(String, String)>,
    pub default_target: Option<String>,
}

/// In-memory host that records instead of acting.
#[derive(Debug)]
pub struct DryRunHost {
    state: RefCell<HostState>,
    actions: RefCell<Vec<String>>,
    commands: RefCell<BTreeSet<String>>,
    failing_programs: BTreeSet<String>,
    failing_packages: BTreeSet<String>,
    failing_urls: BTreeSet<String>,
    os_reboot_pending: bool,
    rebooted: Cell<bool>,
    system: Option<SystemHost>,
}

impl Default for DryRunHost {
    fn default() -> Self {
        Self::new()
    }
}

impl DryRunHost {
    /// Fully simulated host with a minimal Raspberry Pi OS toolset.
    pub fn new() -> Self {
        Self {
            state: RefCell::new(HostState::default()),
            actions: RefCell::new(Vec::new()),
            commands: RefCell::new(BASE_COMMANDS.iter().map(|c| c.to_string()).collect()),
            failing_programs: BTreeSet::new(),
            failing_packages: BTreeSet::new(),
            failing_urls: BTreeSet::new(),
            os_reboot_pending: false,
            rebooted: Cell::new(false),
            system: None,
        }
    }

    /// Host whose reads come from the running system.
    pub fn over_system() -> Self {
        Self {
            system: Some(SystemHost::new()),
            ..Self::new()
        }
    }

    // ------------------------------------------------------------------------
    // Builders
    // ------------------------------------------------------------------------

    /// Put `program` on the simulated `PATH`.
    pub fn with_command(self, program: &str) -> Self {
        self.commands.borrow_mut().insert(program.to_string());
        self
    }

    /// Make every invocation of `program` exit 1.
    pub fn with_failing_command(mut self, program: &str) -> Self {
        self.failing_programs.insert(program.to_string());
        self
    }

    /// Make installing `package` fail as if the archive lacked it.
    pub fn with_unavailable_package(mut self, package: &str) -> Self {
        self.failing_packages.insert(package.to_string());
        self
    }

    /// Make downloads of `url` fail.
    pub fn with_failing_url(mut self, url: &str) -> Self {
        self.failing_urls.insert(url.to_string());
        self
    }

    pub fn with_user(self, user: &str) -> Self {
        self.state.borrow_mut().users.insert(user.to_string());
        self
    }

    pub fn with_file(self, path: &str, content: &str) -> Self {
        self.state
            .borrow_mut()
            .files
            .insert(PathBuf::from(path), content.to_string());
        self
    }

    pub fn with_os_reboot_pending(mut self) -> Self {
        self.os_reboot_pending = true;
        self
    }

    /// Simulate a program becoming available mid-test (e.g. a runtime
    /// installed out of band between two runs).
    pub fn add_command(&self, program: &str) {
        self.commands.borrow_mut().insert(program.to_string());
    }

    // ------------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------------

    /// Snapshot of the simulated end state.
    pub fn snapshot(&self) -> HostState {
        self.state.borrow().clone()
    }

    /// Every recorded action, in order.
    pub fn actions(&self) -> Vec<String> {
        self.actions.borrow().clone()
    }

    /// Number of recorded actions starting with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.actions
            .borrow()
            .iter()
            .filter(|a| a.starts_with(prefix))
            .count()
    }

    /// True if any recorded action starts with `prefix`.
    pub fn did(&self, prefix: &str) -> bool {
        self.count(prefix) > 0
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.state.borrow().files.get(Path::new(path)).cloned()
    }

    pub fn rebooted(&self) -> bool {
        self.rebooted.get()
    }

    fn record(&self, action: String) {
        info!(target: "piprovision::dry_run", "[DRY RUN] {}", action);
        self.actions.borrow_mut().push(action);
    }

    fn simulate(&self, cmd: &Cmd) -> CommandOutput {
        let args: Vec<&str> = cmd.args.iter().map(String::as_str).collect();
        let mut state = self.state.borrow_mut();

        match (cmd.program.as_str(), args.as_slice()) {
            ("id", [.., user]) => {
                let known = state.users.contains(*user)
                    || self.system.as_ref().is_some_and(|s| {
                        s.run(cmd).map(|out| out.success).unwrap_or(false)
                    });
                if known {
                    CommandOutput::ok("1000\n")
                } else {
                    CommandOutput::failed(1, format!("id: '{}': no such user", user))
                }
            }
            ("useradd", [.., user]) => {
                if state.users.insert(user.to_string()) {
                    CommandOutput::ok("")
                } else {
                    CommandOutput::failed(9, format!("useradd: user '{}' already exists", user))
                }
            }
            ("usermod", ["-aG", group, user]) => {
                state
                    .group_members
                    .insert((group.to_string(), user.to_string()));
                CommandOutput::ok("")
            }
            ("git", ["clone", .., path]) => {
                let path = PathBuf::from(*path);
                state.dirs.insert(path.join(".git"));
                state.dirs.insert(path);
                CommandOutput::ok("")
            }
            ("uname", ["-m"]) => CommandOutput::ok("aarch64\n"),
            ("systemctl", ["get-default"]) => match &state.default_target {
                Some(target) => CommandOutput::ok(format!("{}\n", target)),
                None => self
                    .system
                    .as_ref()
                    .and_then(|s| s.run(cmd).ok())
                    .unwrap_or_else(|| CommandOutput::ok("multi-user.target\n")),
            },
            ("systemctl", ["set-default", target]) => {
                state.default_target = Some(target.to_string());
                CommandOutput::ok("")
            }
            _ => CommandOutput::ok(""),
        }
    }
}

impl ProcessRunner for DryRunHost {
    fn run(&self, cmd: &Cmd) -> Result<CommandOutput> {
        self.record(format!("run {}", cmd));

        if self.failing_programs.contains(&cmd.program) {
            return Ok(CommandOutput::failed(1, "simulated failure"));
        }
        Ok(self.simulate(cmd))
    }

    fn command_exists(&self, program: &str) -> bool {
        if self.commands.borrow().contains(program) {
            return true;
        }
        self.system
            .as_ref()
            .is_some_and(|s| s.command_exists(program))
    }
}

impl PackageInstaller for DryRunHost {
    fn refresh(&self) -> Result<()> {
        self.record("apt-get update".to_string());
        if self.failing_programs.contains("apt-get") {
            return Err(anyhow!("apt-get update failed (simulated)"));
        }
        Ok(())
    }

    fn install(&self, packages: &[&str]) -> Result<()> {
        if let Some(bad) = packages.iter().find(|p| self.failing_packages.contains(**p)) {
            self.record(format!("apt-get install {} (failed)", packages.join(" ")));
            return Err(anyhow!("E: Unable to locate package {}", bad));
        }

        let missing: Vec<&str> = packages
            .iter()
            .copied()
            .filter(|p| !self.is_installed(p))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }

        self.record(format!("apt-get install {}", missing.join(" ")));
        let mut state = self.state.borrow_mut();
        let mut commands = self.commands.borrow_mut();
        for package in missing {
            state.packages.insert(package.to_string());
            let binary = PACKAGE_BINARIES
                .iter()
                .find(|(p, _)| *p == package)
                .map(|(_, b)| *b)
                .unwrap_or(package);
            commands.insert(binary.to_string());
        }
        Ok(())
    }

    fn is_installed(&self, package: &str) -> bool {
        if self.state.borrow().packages.contains(package) {
            return true;
        }
        self.system
            .as_ref()
            .is_some_and(|s| s.is_installed(package))
    }
}

impl ServiceManager for DryRunHost {
    fn daemon_reload(&self) -> Result<()> {
        self.record("systemctl daemon-reload".to_string());
        Ok(())
    }

    fn enable(&self, unit: &str, now: bool) -> Result<()> {
        self.record(format!(
            "systemctl enable {}{}",
            if now { "--now " } else { "" },
            unit
        ));
        let mut state = self.state.borrow_mut();
        state.disabled_services.remove(unit);
        state.enabled_services.insert(unit.to_string());
        if now {
            state.active_services.insert(unit.to_string());
        }
        Ok(())
    }

    fn disable(&self, unit: &str) -> Result<()> {
        self.record(format!("systemctl disable --now {}", unit));
        let mut state = self.state.borrow_mut();
        state.enabled_services.remove(unit);
        state.active_services.remove(unit);
        state.disabled_services.insert(unit.to_string());
        Ok(())
    }

    fn restart(&self, unit: &str) -> Result<()> {
        self.record(format!("systemctl restart {}", unit));
        self.state
            .borrow_mut()
            .active_services
            .insert(unit.to_string());
        Ok(())
    }

    fn is_active(&self, unit: &str) -> bool {
        if self.state.borrow().active_services.contains(unit) {
            return true;
        }
        self.system.as_ref().is_some_and(|s| s.is_active(unit))
    }
}

impl FileWriter for DryRunHost {
    fn write_file(&self, path: &Path, content: &str, mode: Option<u32>) -> Result<bool> {
        let changed = self.read_file(path).as_deref() != Some(content);

        if changed {
            self.record(format!("write {}", path.display()));
            self.state
                .borrow_mut()
                .files
                .insert(path.to_path_buf(), content.to_string());
        }
        if let Some(mode) = mode {
            self.state
                .borrow_mut()
                .modes
                .insert(path.to_path_buf(), mode);
        }
        Ok(changed)
    }

    fn create_dir(&self, path: &Path) -> Result<()> {
        if self.exists(path) {
            return Ok(());
        }
        self.record(format!("mkdir {}", path.display()));
        self.state.borrow_mut().dirs.insert(path.to_path_buf());
        Ok(())
    }

    fn read_file(&self, path: &Path) -> Option<String> {
        if let Some(content) = self.state.borrow().files.get(path) {
            return Some(content.clone());
        }
        self.system.as_ref().and_then(|s| s.read_file(path))
    }

    fn exists(&self, path: &Path) -> bool {
        {
            let state = self.state.borrow();
            if state.files.contains_key(path) || state.dirs.contains(path) {
                return true;
            }
        }
        self.system.as_ref().is_some_and(|s| s.exists(path))
    }
}

impl Downloader for DryRunHost {
    fn download(&self, url: &str, dest: &Path) -> Result<()> {
        self.record(format!("download {} -> {}", url, dest.display()));
        if self.failing_urls.contains(url) {
            return Err(anyhow!("download {} failed (simulated)", url));
        }
        self.state
            .borrow_mut()
            .files
            .insert(dest.to_path_buf(), format!("# downloaded from {}\n", url));
        Ok(())
    }
}

impl RebootSignal for DryRunHost {
    fn os_reboot_pending(&self) -> bool {
        if self.os_reboot_pending {
            return true;
        }
        self.system
            .as_ref()
            .is_some_and(|s| s.os_reboot_pending())
    }

    fn reboot(&self) -> Result<()> {
        self.record("reboot".to_string());
        self.rebooted.set(true);
        Ok(())
    }
}
