//! Tailscale overlay network.

use anyhow::{Context, Result};
use std::path::Path;

use crate::capabilities::Cmd;
use crate::config::Config;
use crate::unit::{Unit, UnitContext, UnitResult};

const INSTALL_SCRIPT_URL: &str = "https://tailscale.com/install.sh";
const INSTALL_SCRIPT_PATH: &str = "/tmp/tailscale-install.sh";

pub struct TailscaleUnit;

impl Unit for TailscaleUnit {
    fn name(&self) -> &'static str {
        "tailscale"
    }

    fn description(&self) -> &'static str {
        "Install Tailscale and enable tailscaled"
    }

    fn enabled(&self, config: &Config) -> bool {
        config.get_bool("install_tailscale")
    }

    fn provision(&self, ctx: &mut UnitContext<'_>) -> Result<UnitResult> {
        let caps = ctx.caps;

        if !caps.process.command_exists("tailscale") {
            let script = Path::new(INSTALL_SCRIPT_PATH);
            caps.downloader
                .download(INSTALL_SCRIPT_URL, script)
                .context("downloading Tailscale installer")?;
            caps.run_checked(&Cmd::new("sh").arg(INSTALL_SCRIPT_PATH))
                .context("running Tailscale installer")?;
        }

        caps.services
            .enable("tailscaled", true)
            .context("enabling tailscaled")?;

        Ok(UnitResult::success(
            "tailscaled running; run `tailscale up` to join the tailnet",
        ))
    }
}
