//! Wi-Fi profile as a NetworkManager keyfile.

use anyhow::{Context, Result};
use std::path::PathBuf;

use crate::capabilities::Cmd;
use crate::config::Config;
use crate::state::sanitize;
use crate::unit::{Unit, UnitContext, UnitResult};

const CONNECTIONS_DIR: &str = "/etc/NetworkManager/system-connections";

pub struct NetworkUnit;

impl Unit for NetworkUnit {
    fn name(&self) -> &'static str {
        "network"
    }

    fn description(&self) -> &'static str {
        "Configure the Wi-Fi connection"
    }

    fn enabled(&self, config: &Config) -> bool {
        config.get_nonempty("wifi_ssid").is_some()
    }

    fn provision(&self, ctx: &mut UnitContext<'_>) -> Result<UnitResult> {
        let ssid = ctx.config.get("wifi_ssid", "");
        let password = ctx.config.get_nonempty("wifi_password");
        if password.is_none() {
            ctx.warn(format!("wifi_password not set, '{}' will be an open network", ssid));
        }

        let path = keyfile_path(&ssid);
        let changed = ctx
            .caps
            .files
            .write_file(&path, &keyfile(&ssid, password.as_deref()), Some(0o600))
            .with_context(|| format!("writing {}", path.display()))?;

        if changed && ctx.caps.process.command_exists("nmcli") {
            let result = ctx
                .caps
                .run_checked(&Cmd::new("nmcli").args(["connection", "reload"]))
                .map(|_| ());
            ctx.soft("nmcli connection reload", result);
        }

        Ok(UnitResult::success(format!("Wi-Fi profile for '{}'", ssid)))
    }
}

fn keyfile_path(ssid: &str) -> PathBuf {
    PathBuf::from(CONNECTIONS_DIR).join(format!("{}.nmconnection", sanitize(ssid)))
}

fn keyfile(ssid: &str, password: Option<&str>) -> String {
    let mut out = format!(
        "[connection]\nid={ssid}\ntype=wifi\nautoconnect=true\n\n\
         [wifi]\nmode=infrastructure\nssid={ssid}\n\n"
    );
    if let Some(psk) = password {
        out.push_str(&format!(
            "[wifi-security]\nkey-mgmt=wpa-psk\npsk={}\n\n",
            psk
        ));
    }
    out.push_str("[ipv4]\nmethod=auto\n\n[ipv6]\nmethod=auto\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::DryRunHost;
    use crate::unit::apply_yaml;

    #[test]
    fn test_keyfile_with_and_without_password() {
        let secured = keyfile("home", Some("secret"));
        assert!(secured.contains("ssid=home\n"));
        assert!(secured.contains("psk=secret\n"));

        let open = keyfile("cafe", None);
        assert!(!open.contains("[wifi-security]"));
    }

    #[test]
    fn test_missing_password_is_soft_warning() {
        let host = DryRunHost::new();
        let result = apply_yaml(&NetworkUnit, "wifi_ssid: My Cafe\n", &host);

        assert!(!result.is_failed());
        assert_eq!(result.warnings.len(), 1);
        assert!(host.file("/etc/NetworkManager/system-connections/My_Cafe.nmconnection").is_some());
    }

    #[test]
    fn test_reload_only_on_change() {
        let host = DryRunHost::new();
        let yaml = "wifi_ssid: home\nwifi_password: secret\n";

        apply_yaml(&NetworkUnit, yaml, &host);
        apply_yaml(&NetworkUnit, yaml, &host);
        assert_eq!(host.count("run nmcli connection reload"), 1);
    }
}
