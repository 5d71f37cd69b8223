//! Raspberry Pi desktop environment.

use anyhow::{Context, Result};

use crate::capabilities::Cmd;
use crate::config::Config;
use crate::unit::{Unit, UnitContext, UnitResult};

const DESKTOP_PACKAGES: &[&str] = &["raspberrypi-ui-mods", "lightdm"];

/// Nice to have; each one failing is a SoftWarning.
const OPTIONAL_PACKAGES: &[&str] = &["chromium-browser", "rpi-imager", "vlc"];

const GRAPHICAL_TARGET: &str = "graphical.target";

pub struct DesktopUnit;

impl Unit for DesktopUnit {
    fn name(&self) -> &'static str {
        "desktop"
    }

    fn description(&self) -> &'static str {
        "Install the desktop and boot to the graphical target"
    }

    fn enabled(&self, config: &Config) -> bool {
        config.get_bool("enable_desktop")
    }

    fn provision(&self, ctx: &mut UnitContext<'_>) -> Result<UnitResult> {
        let caps = ctx.caps;

        caps.packages
            .install(DESKTOP_PACKAGES)
            .context("installing desktop packages")?;

        for package in OPTIONAL_PACKAGES {
            let result = caps.packages.install(&[*package]);
            ctx.soft(&format!("installing {}", package), result);
        }

        let current = caps
            .run_checked(&Cmd::new("systemctl").arg("get-default"))
            .context("reading default target")?;
        let switch = current.stdout.trim() != GRAPHICAL_TARGET;
        if switch {
            caps.run_checked(&Cmd::new("systemctl").args(["set-default", GRAPHICAL_TARGET]))
                .context("setting graphical target")?;
        }

        let message = if switch {
            "desktop installed, booting to graphical target"
        } else {
            "desktop installed"
        };
        Ok(UnitResult::success(message).reboot_if(switch))
    }
}
