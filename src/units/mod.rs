//! The fixed unit catalogue.
//!
//! Order is part of the contract: system basics first, then container
//! runtimes, then the services that run on top of them.
//!
//! # Modules
//!
//! - `base` - package index and base tooling (critical)
//! - `system` - hostname, timezone, locale, keyboard
//! - `user` - login user, password, SSH key
//! - `network` - Wi-Fi profile
//! - `updates` - unattended upgrades
//! - `security` - fail2ban, sshd hardening, service pruning
//! - `nvme` - PCIe/NVMe boot parameters
//! - `containers` - podman and/or docker, image pre-pull
//! - `tailscale`, `k3s` - network overlay and cluster agent
//! - `monitoring`, `health` - node_exporter and the health-check timer
//! - `desktop`, `autologin`, `devtools` - workstation extras
//! - `printing` - 3D-printing services with per-service markers

pub mod autologin;
pub mod base;
pub mod containers;
pub mod desktop;
pub mod devtools;
pub mod health;
pub mod k3s;
pub mod monitoring;
pub mod network;
pub mod nvme;
pub mod printing;
pub mod security;
pub mod system;
pub mod tailscale;
pub mod updates;
pub mod user;

use anyhow::Result;
use std::path::{Path, PathBuf};

use crate::capabilities::Capabilities;
use crate::unit::Unit;

/// Directory for unit files written by piprovision.
pub const SYSTEMD_DIR: &str = "/etc/systemd/system";

/// Every unit, in execution order.
pub fn default_units() -> Vec<Box<dyn Unit>> {
    vec![
        Box::new(base::BaseUnit),
        Box::new(system::SystemUnit),
        Box::new(user::UserUnit),
        Box::new(network::NetworkUnit),
        Box::new(updates::UpdatesUnit),
        Box::new(security::SecurityUnit),
        Box::new(nvme::NvmeUnit),
        Box::new(containers::ContainersUnit),
        Box::new(tailscale::TailscaleUnit),
        Box::new(k3s::K3sUnit),
        Box::new(monitoring::MonitoringUnit),
        Box::new(health::HealthUnit),
        Box::new(desktop::DesktopUnit),
        Box::new(autologin::AutologinUnit),
        Box::new(devtools::DevtoolsUnit),
        Box::new(printing::PrintingUnit),
    ]
}

/// Write a systemd unit file and reload the daemon if it changed.
pub(crate) fn write_systemd_unit(caps: &Capabilities<'_>, name: &str, content: &str) -> Result<bool> {
    let path = Path::new(SYSTEMD_DIR).join(name);
    let changed = caps.files.write_file(&path, content, Some(0o644))?;
    if changed {
        caps.services.daemon_reload()?;
    }
    Ok(changed)
}

/// Locate a boot partition file, preferring the Bookworm location.
pub(crate) fn boot_file(caps: &Capabilities<'_>, name: &str) -> Option<PathBuf> {
    ["/boot/firmware", "/boot"]
        .iter()
        .map(|dir| Path::new(dir).join(name))
        .find(|path| caps.files.exists(path))
}
