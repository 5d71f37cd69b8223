//! OS-backed capability host.
//!
//! Thin pass-throughs to apt-get, systemctl, the filesystem, and curl. All
//! commands block until they finish; there are no timeouts.

use anyhow::{Context, Result};
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::{Command, Stdio};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use super::{
    Cmd, CommandOutput, Downloader, FileWriter, PackageInstaller, ProcessRunner, RebootSignal,
    ServiceManager,
};

/// Debian's "a reboot is pending" flag file.
pub const REBOOT_REQUIRED_FLAG: &str = "/var/run/reboot-required";

/// Capability host that acts on the running system.
#[derive(Debug, Default)]
pub struct SystemHost;

impl SystemHost {
    pub fn new() -> Self {
        Self
    }

    fn systemctl(&self, args: &[&str]) -> Result<()> {
        let cmd = Cmd::new("systemctl").args(args.iter().copied());
        self.run(&cmd)?.ensure_success(&cmd.to_string())
    }
}

impl ProcessRunner for SystemHost {
    fn run(&self, cmd: &Cmd) -> Result<CommandOutput> {
        debug!(command = %cmd, "Running command");

        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if cmd.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });

        for (key, value) in &cmd.env {
            command.env(key, value);
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to spawn: {}", cmd.program))?;

        if let Some(input) = &cmd.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(input.as_bytes())
                    .with_context(|| format!("Failed writing stdin of: {}", cmd.program))?;
            }
        }

        let output = child
            .wait_with_output()
            .with_context(|| format!("Failed waiting for: {}", cmd.program))?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code(),
            success: output.status.success(),
        })
    }

    fn command_exists(&self, program: &str) -> bool {
        Command::new("sh")
            .arg("-c")
            .arg(format!("command -v {} >/dev/null 2>&1", program))
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }
}

impl PackageInstaller for SystemHost {
    fn refresh(&self) -> Result<()> {
        let cmd = Cmd::new("apt-get")
            .args(["update", "-q"])
            .env("DEBIAN_FRONTEND", "noninteractive");
        self.run(&cmd)?.ensure_success("apt-get update")
    }

    fn install(&self, packages: &[&str]) -> Result<()> {
        let missing: Vec<&str> = packages
            .iter()
            .copied()
            .filter(|p| !self.is_installed(p))
            .collect();

        if missing.is_empty() {
            debug!(?packages, "Packages already installed");
            return Ok(());
        }

        info!(packages = ?missing, "Installing packages");
        let cmd = Cmd::new("apt-get")
            .args(["install", "-y", "-q", "--no-install-recommends"])
            .args(missing.iter().copied())
            .env("DEBIAN_FRONTEND", "noninteractive");
        self.run(&cmd)?
            .ensure_success(&format!("apt-get install {}", missing.join(" ")))
    }

    fn is_installed(&self, package: &str) -> bool {
        let cmd = Cmd::new("dpkg-query").args(["-W", "-f=${Status}", package]);
        self.run(&cmd)
            .map(|out| out.success && out.stdout.contains("install ok installed"))
            .unwrap_or(false)
    }
}

impl ServiceManager for SystemHost {
    fn daemon_reload(&self) -> Result<()> {
        self.systemctl(&["daemon-reload"])
    }

    fn enable(&self, unit: &str, now: bool) -> Result<()> {
        if now {
            self.systemctl(&["enable", "--now", unit])
        } else {
            self.systemctl(&["enable", unit])
        }
    }

    fn disable(&self, unit: &str) -> Result<()> {
        self.systemctl(&["disable", "--now", unit])
    }

    fn restart(&self, unit: &str) -> Result<()> {
        self.systemctl(&["restart", unit])
    }

    fn is_active(&self, unit: &str) -> bool {
        Command::new("systemctl")
            .args(["is-active", "--quiet", unit])
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }
}

impl FileWriter for SystemHost {
    fn write_file(&self, path: &Path, content: &str, mode: Option<u32>) -> Result<bool> {
        let unchanged = fs::read_to_string(path)
            .map(|current| current == content)
            .unwrap_or(false);
        let previous_mode = fs::metadata(path)
            .ok()
            .map(|meta| meta.permissions().mode() & 0o7777);

        if !unchanged {
            let parent = path.parent().unwrap_or_else(|| Path::new("/"));
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;

            let mut temp = NamedTempFile::new_in(parent)
                .with_context(|| format!("Failed to create temp file in {:?}", parent))?;
            temp.write_all(content.as_bytes())
                .with_context(|| format!("Failed to write {:?}", path))?;
            temp.as_file()
                .sync_all()
                .with_context(|| format!("Failed to fsync {:?}", path))?;
            temp.persist(path)
                .map_err(|e| e.error)
                .with_context(|| format!("Failed to replace {:?}", path))?;
            debug!(path = %path.display(), "File written");
        }

        // Temp files are created 0600; restore the old mode or fall back to 0644.
        let mode = mode.or(previous_mode).unwrap_or(0o644);
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .with_context(|| format!("Failed to chmod {:o} {:?}", mode, path))?;

        Ok(!unchanged)
    }

    fn create_dir(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path).with_context(|| format!("Failed to create directory {:?}", path))
    }

    fn read_file(&self, path: &Path) -> Option<String> {
        fs::read_to_string(path).ok()
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

impl Downloader for SystemHost {
    fn download(&self, url: &str, dest: &Path) -> Result<()> {
        info!(%url, dest = %dest.display(), "Downloading");
        let dest_str = dest.display().to_string();

        let cmd = if self.command_exists("curl") {
            Cmd::new("curl").args(["-fsSL", "--retry", "3", "-o", dest_str.as_str(), url])
        } else {
            Cmd::new("wget").args(["-q", "-O", dest_str.as_str(), url])
        };

        self.run(&cmd)?
            .ensure_success(&format!("download {}", url))
    }
}

impl RebootSignal for SystemHost {
    fn os_reboot_pending(&self) -> bool {
        Path::new(REBOOT_REQUIRED_FLAG).exists()
    }

    fn reboot(&self) -> Result<()> {
        info!("Flushing filesystems before reboot");
        nix::unistd::sync();
        self.systemctl(&["reboot"])
    }
}
