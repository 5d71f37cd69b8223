//! Periodic health check as a systemd service/timer pair.

use anyhow::{Context, Result};
use std::path::Path;

use super::write_systemd_unit;
use crate::config::Config;
use crate::unit::{Unit, UnitContext, UnitResult};

const SCRIPT_PATH: &str = "/usr/local/bin/piprovision-health";
const SERVICE: &str = "piprovision-health.service";
const TIMER: &str = "piprovision-health.timer";

const HEALTH_SCRIPT: &str = r#"#!/bin/sh
# Log disk, memory, temperature, and failed units to the journal.
set -u
tag=piprovision-health

df -h / | tail -n 1 | logger -t "$tag"
free -m | awk '/^Mem:/ {print "mem used " $3 "/" $2 " MiB"}' | logger -t "$tag"

if command -v vcgencmd >/dev/null 2>&1; then
    vcgencmd measure_temp | logger -t "$tag"
fi

failed=$(systemctl --failed --no-legend | wc -l)
if [ "$failed" -gt 0 ]; then
    systemctl --failed --no-legend | logger -p user.warning -t "$tag"
    exit 1
fi
"#;

pub struct HealthUnit;

fn interval(config: &Config) -> u64 {
    config.get_parsed("health_check_interval", 0u64)
}

impl Unit for HealthUnit {
    fn name(&self) -> &'static str {
        "health"
    }

    fn description(&self) -> &'static str {
        "Install a periodic health-check timer"
    }

    fn enabled(&self, config: &Config) -> bool {
        interval(config) > 0
    }

    fn provision(&self, ctx: &mut UnitContext<'_>) -> Result<UnitResult> {
        let caps = ctx.caps;
        let seconds = interval(ctx.config);

        caps.files
            .write_file(Path::new(SCRIPT_PATH), HEALTH_SCRIPT, Some(0o755))
            .context("writing health script")?;

        let service = format!(
            "[Unit]\nDescription=piprovision health check\n\n\
             [Service]\nType=oneshot\nExecStart={}\n",
            SCRIPT_PATH
        );
        let timer = format!(
            "[Unit]\nDescription=Run piprovision health check every {secs}s\n\n\
             [Timer]\nOnBootSec=2min\nOnUnitActiveSec={secs}s\n\n\
             [Install]\nWantedBy=timers.target\n",
            secs = seconds
        );

        write_systemd_unit(&caps, SERVICE, &service).context("writing health service")?;
        write_systemd_unit(&caps, TIMER, &timer).context("writing health timer")?;
        caps.services
            .enable(TIMER, true)
            .context("enabling health timer")?;

        Ok(UnitResult::success(format!("health check every {}s", seconds)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::DryRunHost;
    use crate::unit::apply_yaml;

    #[test]
    fn test_enabled_by_positive_interval() {
        assert!(HealthUnit.enabled(&Config::from_yaml("health_check_interval: 300").unwrap()));
        assert!(!HealthUnit.enabled(&Config::from_yaml("health_check_interval: 0").unwrap()));
        assert!(!HealthUnit.enabled(&Config::default()));
    }

    #[test]
    fn test_writes_timer_with_interval() {
        let host = DryRunHost::new();
        let result = apply_yaml(&HealthUnit, "health_check_interval: 600", &host);

        assert!(!result.is_failed());
        let timer = host.file("/etc/systemd/system/piprovision-health.timer").unwrap();
        assert!(timer.contains("OnUnitActiveSec=600s"));
        assert_eq!(
            host.snapshot().modes.get(Path::new(SCRIPT_PATH)),
            Some(&0o755)
        );
        assert!(host.snapshot().active_services.contains(TIMER));
    }
}
