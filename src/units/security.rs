//! fail2ban, sshd hardening, and pruning of services a headless Pi does not
//! need.

use anyhow::{Context, Result};
use std::path::Path;

use crate::unit::{Unit, UnitContext, UnitResult};

const SSHD_DROP_IN: &str = "/etc/ssh/sshd_config.d/50-piprovision.conf";

/// Disabled when `disable_unnecessary_services` is true.
const UNNECESSARY_SERVICES: &[&str] = &[
    "bluetooth",
    "hciuart",
    "avahi-daemon",
    "triggerhappy",
    "cups",
];

pub struct SecurityUnit;

impl Unit for SecurityUnit {
    fn name(&self) -> &'static str {
        "security"
    }

    fn description(&self) -> &'static str {
        "Install fail2ban, harden sshd, disable unused services"
    }

    fn provision(&self, ctx: &mut UnitContext<'_>) -> Result<UnitResult> {
        let caps = ctx.caps;

        caps.packages
            .install(&["fail2ban"])
            .context("installing fail2ban")?;
        caps.services
            .enable("fail2ban", true)
            .context("enabling fail2ban")?;

        let key_login = ctx.config.get_nonempty("ssh_public_key").is_some();
        let changed = caps
            .files
            .write_file(Path::new(SSHD_DROP_IN), &sshd_drop_in(key_login), Some(0o644))
            .context("writing sshd drop-in")?;
        if changed {
            let result = caps.services.restart("ssh");
            ctx.soft("restarting ssh", result);
        }

        let mut disabled = 0;
        if ctx.config.get_bool("disable_unnecessary_services") {
            for service in UNNECESSARY_SERVICES {
                let result = caps.services.disable(service);
                if ctx.soft(&format!("disabling {}", service), result).is_some() {
                    disabled += 1;
                }
            }
        }

        let mut message = if key_login {
            "fail2ban active, sshd key-only".to_string()
        } else {
            "fail2ban active, sshd password login kept".to_string()
        };
        if disabled > 0 {
            message.push_str(&format!(", {} services disabled", disabled));
        }
        Ok(UnitResult::success(message))
    }
}

/// Password login stays on unless a key is configured.
fn sshd_drop_in(key_login: bool) -> String {
    format!(
        "PermitRootLogin no\nPasswordAuthentication {}\nMaxAuthTries 3\nX11Forwarding no\n",
        if key_login { "no" } else { "yes" }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::DryRunHost;
    use crate::unit::apply_yaml;

    #[test]
    fn test_password_login_depends_on_key() {
        assert!(sshd_drop_in(true).contains("PasswordAuthentication no"));
        assert!(sshd_drop_in(false).contains("PasswordAuthentication yes"));
    }

    #[test]
    fn test_security_restarts_ssh_only_on_change() {
        let host = DryRunHost::new();

        apply_yaml(&SecurityUnit, "", &host);
        apply_yaml(&SecurityUnit, "", &host);
        assert_eq!(host.count("systemctl restart ssh"), 1);
        assert!(host.snapshot().active_services.contains("fail2ban"));
    }

    #[test]
    fn test_disables_unnecessary_services() {
        let host = DryRunHost::new();
        let result = apply_yaml(&SecurityUnit, "disable_unnecessary_services: true", &host);

        assert!(result.message.ends_with("5 services disabled"));
        let state = host.snapshot();
        assert!(state.disabled_services.contains("bluetooth"));
        assert!(state.disabled_services.contains("cups"));
    }

    #[test]
    fn test_missing_fail2ban_fails_unit() {
        let host = DryRunHost::new().with_unavailable_package("fail2ban");
        let result = apply_yaml(&SecurityUnit, "", &host);
        assert!(result.is_failed());
    }
}
