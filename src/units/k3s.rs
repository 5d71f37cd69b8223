//! Lightweight Kubernetes (k3s).
//!
//! The kernel needs the memory cgroup controller, enabled through
//! `cmdline.txt`; a change there requests a reboot. The install script reads
//! its role, server URL, and token from the environment.

use anyhow::{Context, Result, bail};
use std::path::Path;
use strum::{Display, EnumString};

use super::boot_file;
use crate::capabilities::Cmd;
use crate::config::Config;
use crate::unit::{Unit, UnitContext, UnitResult};

const INSTALL_SCRIPT_URL: &str = "https://get.k3s.io";
const INSTALL_SCRIPT_PATH: &str = "/tmp/k3s-install.sh";
const CGROUP_FLAGS: &[&str] = &["cgroup_memory=1", "cgroup_enable=memory"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum K3sRole {
    Server,
    Agent,
}

impl K3sRole {
    fn service(self) -> &'static str {
        match self {
            Self::Server => "k3s",
            Self::Agent => "k3s-agent",
        }
    }
}

pub struct K3sUnit;

impl Unit for K3sUnit {
    fn name(&self) -> &'static str {
        "k3s"
    }

    fn description(&self) -> &'static str {
        "Install k3s as server or agent"
    }

    fn enabled(&self, config: &Config) -> bool {
        config.get_bool("install_k3s")
    }

    fn provision(&self, ctx: &mut UnitContext<'_>) -> Result<UnitResult> {
        let caps = ctx.caps;
        let role = ctx.config.get_parsed("k3s_role", K3sRole::Server);
        let server = ctx.config.get_nonempty("k3s_server");
        let token = ctx.config.get_nonempty("k3s_token");

        if role == K3sRole::Agent && (server.is_none() || token.is_none()) {
            bail!("k3s agent role requires k3s_server and k3s_token");
        }

        let mut reboot = false;
        if let Some(path) = boot_file(&caps, "cmdline.txt") {
            let current = caps.files.read_file(&path).unwrap_or_default();
            if let Some(updated) = with_cgroup_flags(&current) {
                caps.files
                    .write_file(&path, &updated, None)
                    .with_context(|| format!("writing {}", path.display()))?;
                reboot = true;
            }
        } else {
            ctx.warn("cmdline.txt not found, memory cgroup flags not set");
        }

        if !caps.process.command_exists("k3s") {
            caps.downloader
                .download(INSTALL_SCRIPT_URL, Path::new(INSTALL_SCRIPT_PATH))
                .context("downloading k3s installer")?;

            let mut cmd = Cmd::new("sh")
                .arg(INSTALL_SCRIPT_PATH)
                .env("INSTALL_K3S_EXEC", role.to_string());
            if let Some(server) = &server {
                cmd = cmd.env("K3S_URL", server.as_str());
            }
            if let Some(token) = &token {
                cmd = cmd.env("K3S_TOKEN", token.as_str());
            }
            caps.run_checked(&cmd).context("running k3s installer")?;
        }

        caps.services
            .enable(role.service(), true)
            .with_context(|| format!("enabling {}", role.service()))?;

        Ok(UnitResult::success(format!("k3s {} installed", role)).reboot_if(reboot))
    }
}

/// Append the memory cgroup flags to the single-line kernel command line.
/// `None` when every flag is already present.
fn with_cgroup_flags(cmdline: &str) -> Option<String> {
    let line = cmdline.trim();
    let present: Vec<&str> = line.split_whitespace().collect();
    let missing: Vec<&str> = CGROUP_FLAGS
        .iter()
        .copied()
        .filter(|flag| !present.contains(flag))
        .collect();

    if missing.is_empty() {
        return None;
    }

    let mut parts = present;
    parts.extend(missing);
    Some(format!("{}\n", parts.join(" ")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::DryRunHost;
    use crate::unit::apply_yaml;

    #[test]
    fn test_cgroup_flags_appended_once() {
        let updated = with_cgroup_flags("console=tty1 rootwait\n").unwrap();
        assert_eq!(
            updated,
            "console=tty1 rootwait cgroup_memory=1 cgroup_enable=memory\n"
        );
        assert_eq!(with_cgroup_flags(&updated), None);
    }

    #[test]
    fn test_agent_without_token_fails() {
        let host = DryRunHost::new();
        let result = apply_yaml(
            &K3sUnit,
            "install_k3s: true\nk3s_role: agent\nk3s_server: https://10.0.0.1:6443\n",
            &host,
        );

        assert!(result.is_failed());
        assert!(host.actions().is_empty());
    }

    #[test]
    fn test_server_install_requests_reboot_once() {
        let host = DryRunHost::new().with_file("/boot/firmware/cmdline.txt", "console=tty1\n");

        let first = apply_yaml(&K3sUnit, "install_k3s: true", &host);
        assert!(first.reboot_required);
        assert!(host.did("run sh /tmp/k3s-install.sh"));
        assert!(host.snapshot().active_services.contains("k3s"));

        host.add_command("k3s");
        let second = apply_yaml(&K3sUnit, "install_k3s: true", &host);
        assert!(!second.reboot_required);
        assert_eq!(host.count("download"), 1);
    }

    #[test]
    fn test_agent_enables_agent_service() {
        let host = DryRunHost::new().with_command("k3s");
        let yaml = "install_k3s: true\nk3s_role: agent\nk3s_server: https://10.0.0.1:6443\nk3s_token: abc\n";
        let result = apply_yaml(&K3sUnit, yaml, &host);

        assert!(!result.is_failed(), "{}", result);
        assert!(host.snapshot().active_services.contains("k3s-agent"));
        assert_eq!(result.warnings.len(), 1);
    }
}
