//! Unattended security upgrades.

use anyhow::{Context, Result};
use std::path::Path;

use crate::config::Config;
use crate::unit::{Unit, UnitContext, UnitResult};

const PERIODIC_CONF: &str = "/etc/apt/apt.conf.d/20auto-upgrades";

const PERIODIC_SETTINGS: &str = "APT::Periodic::Update-Package-Lists \"1\";\n\
APT::Periodic::Unattended-Upgrade \"1\";\n\
APT::Periodic::AutocleanInterval \"7\";\n";

pub struct UpdatesUnit;

impl Unit for UpdatesUnit {
    fn name(&self) -> &'static str {
        "updates"
    }

    fn description(&self) -> &'static str {
        "Enable unattended upgrades"
    }

    fn enabled(&self, config: &Config) -> bool {
        config.get_bool("enable_auto_updates")
    }

    fn provision(&self, ctx: &mut UnitContext<'_>) -> Result<UnitResult> {
        let caps = ctx.caps;
        caps.packages
            .install(&["unattended-upgrades"])
            .context("installing unattended-upgrades")?;
        caps.files
            .write_file(Path::new(PERIODIC_CONF), PERIODIC_SETTINGS, Some(0o644))
            .context("writing apt periodic config")?;
        caps.services
            .enable("unattended-upgrades", true)
            .context("enabling unattended-upgrades")?;

        Ok(UnitResult::success("unattended upgrades enabled"))
    }
}
