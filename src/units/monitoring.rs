//! Prometheus node_exporter from the upstream GitHub release.

use anyhow::{Context, Result, anyhow};
use std::path::Path;

use super::write_systemd_unit;
use crate::capabilities::{Capabilities, Cmd};
use crate::config::Config;
use crate::unit::{Unit, UnitContext, UnitResult};

pub const NODE_EXPORTER_VERSION: &str = "1.8.2";
pub const DEFAULT_PORT: u16 = 9100;

const BINARY_PATH: &str = "/usr/local/bin/node_exporter";
const SERVICE: &str = "node_exporter.service";
const SYSTEM_USER: &str = "node_exporter";

pub struct MonitoringUnit;

impl Unit for MonitoringUnit {
    fn name(&self) -> &'static str {
        "monitoring"
    }

    fn description(&self) -> &'static str {
        "Install Prometheus node_exporter"
    }

    fn enabled(&self, config: &Config) -> bool {
        config.get_bool("install_node_exporter")
    }

    fn provision(&self, ctx: &mut UnitContext<'_>) -> Result<UnitResult> {
        let caps = ctx.caps;
        let port = ctx.config.get_parsed("node_exporter_port", DEFAULT_PORT);

        if !caps.files.exists(Path::new(BINARY_PATH)) {
            install_binary(&caps).context("installing node_exporter")?;
        }

        let has_user = caps
            .process
            .run(&Cmd::new("id").args(["-u", SYSTEM_USER]))
            .map(|out| out.success)
            .unwrap_or(false);
        if !has_user {
            caps.run_checked(&Cmd::new("useradd").args([
                "--system",
                "--no-create-home",
                "--shell",
                "/usr/sbin/nologin",
                SYSTEM_USER,
            ]))
            .context("creating node_exporter user")?;
        }

        let changed = write_systemd_unit(&caps, SERVICE, &service_unit(port))
            .context("writing node_exporter unit")?;
        caps.services
            .enable(SERVICE, true)
            .context("enabling node_exporter")?;
        if changed {
            caps.services
                .restart(SERVICE)
                .context("restarting node_exporter")?;
        }

        Ok(UnitResult::success(format!(
            "node_exporter {} listening on :{}",
            NODE_EXPORTER_VERSION, port
        )))
    }
}

fn install_binary(caps: &Capabilities<'_>) -> Result<()> {
    let machine = caps.run_checked(&Cmd::new("uname").arg("-m"))?;
    let arch = release_arch(machine.stdout.trim())
        .ok_or_else(|| anyhow!("unsupported architecture {}", machine.stdout.trim()))?;

    let name = format!("node_exporter-{}.linux-{}", NODE_EXPORTER_VERSION, arch);
    let url = format!(
        "https://github.com/prometheus/node_exporter/releases/download/v{}/{}.tar.gz",
        NODE_EXPORTER_VERSION, name
    );
    let tarball = format!("/tmp/{}.tar.gz", name);

    caps.downloader.download(&url, Path::new(&tarball))?;
    caps.run_checked(&Cmd::new("tar").args(["-xzf", tarball.as_str(), "-C", "/tmp"]))?;

    let extracted = format!("/tmp/{}/node_exporter", name);
    caps.run_checked(&Cmd::new("install").args(["-m", "0755", extracted.as_str(), BINARY_PATH]))?;
    Ok(())
}

/// Map `uname -m` to the architecture suffix of the release tarballs.
fn release_arch(machine: &str) -> Option<&'static str> {
    match machine {
        "aarch64" | "arm64" => Some("arm64"),
        "armv7l" => Some("armv7"),
        "armv6l" => Some("armv6"),
        "x86_64" => Some("amd64"),
        _ => None,
    }
}

fn service_unit(port: u16) -> String {
    format!(
        "[Unit]\n\
         Description=Prometheus Node Exporter\n\
         Wants=network-online.target\n\
         After=network-online.target\n\n\
         [Service]\n\
         User={user}\n\
         Group={user}\n\
         Type=simple\n\
         ExecStart={bin} --web.listen-address=:{port}\n\
         Restart=on-failure\n\n\
         [Install]\n\
         WantedBy=multi-user.target\n",
        user = SYSTEM_USER,
        bin = BINARY_PATH,
        port = port,
    )
}
