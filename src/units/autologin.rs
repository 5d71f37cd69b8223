//! Console and desktop autologin.
//!
//! Only acts when `enable_autologin` is true. There is no teardown: turning
//! the flag off later leaves existing drop-ins in place.

use anyhow::{Context, Result};
use std::path::Path;

use crate::config::Config;
use crate::unit::{Unit, UnitContext, UnitResult};

const GETTY_DROP_IN: &str = "/etc/systemd/system/getty@tty1.service.d/autologin.conf";
const LIGHTDM_DROP_IN: &str = "/etc/lightdm/lightdm.conf.d/60-piprovision-autologin.conf";

pub struct AutologinUnit;

impl Unit for AutologinUnit {
    fn name(&self) -> &'static str {
        "autologin"
    }

    fn description(&self) -> &'static str {
        "Log the user in automatically on tty1 and lightdm"
    }

    fn enabled(&self, config: &Config) -> bool {
        config.get_bool("enable_autologin")
    }

    fn provision(&self, ctx: &mut UnitContext<'_>) -> Result<UnitResult> {
        let caps = ctx.caps;
        let user = ctx.username();

        let getty = format!(
            "[Service]\nExecStart=\nExecStart=-/sbin/agetty --autologin {} --noclear %I $TERM\n",
            user
        );
        let mut changed = caps
            .files
            .write_file(Path::new(GETTY_DROP_IN), &getty, Some(0o644))
            .context("writing getty autologin drop-in")?;

        if caps.packages.is_installed("lightdm") {
            let lightdm = format!(
                "[Seat:*]\nautologin-user={}\nautologin-user-timeout=0\n",
                user
            );
            changed |= caps
                .files
                .write_file(Path::new(LIGHTDM_DROP_IN), &lightdm, Some(0o644))
                .context("writing lightdm autologin drop-in")?;
        }

        if changed {
            caps.services
                .daemon_reload()
                .context("reloading systemd")?;
        }

        Ok(UnitResult::success(format!("autologin as {}", user)).reboot_if(changed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{DryRunHost, PackageInstaller};
    use crate::unit::apply_yaml;

    #[test]
    fn test_disabled_by_default() {
        assert!(!AutologinUnit.enabled(&Config::default()));
        assert!(!AutologinUnit.enabled(&Config::from_yaml("enable_autologin: false").unwrap()));
    }

    #[test]
    fn test_lightdm_drop_in_only_with_lightdm() {
        let host = DryRunHost::new();
        apply_yaml(&AutologinUnit, "enable_autologin: true\nusername: kiosk", &host);
        assert!(host.file(GETTY_DROP_IN).unwrap().contains("--autologin kiosk"));
        assert!(host.file(LIGHTDM_DROP_IN).is_none());

        host.install(&["lightdm"]).unwrap();
        let result = apply_yaml(&AutologinUnit, "enable_autologin: true\nusername: kiosk", &host);
        assert!(result.reboot_required);
        assert!(host.file(LIGHTDM_DROP_IN).unwrap().contains("autologin-user=kiosk"));
    }

    #[test]
    fn test_no_reboot_when_unchanged() {
        let host = DryRunHost::new();
        apply_yaml(&AutologinUnit, "enable_autologin: true", &host);
        let second = apply_yaml(&AutologinUnit, "enable_autologin: true", &host);
        assert!(!second.reboot_required);
        assert_eq!(host.count("systemctl daemon-reload"), 1);
    }
}
