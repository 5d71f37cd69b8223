//! PCIe parameters for booting from an NVMe HAT.

use anyhow::{Context, Result, anyhow};

use super::boot_file;
use crate::config::Config;
use crate::unit::{Unit, UnitContext, UnitResult, ensure_line};

const PCIE_PARAMS: &[&str] = &["dtparam=pciex1", "dtparam=pciex1_gen=3"];

pub struct NvmeUnit;

impl Unit for NvmeUnit {
    fn name(&self) -> &'static str {
        "nvme"
    }

    fn description(&self) -> &'static str {
        "Enable the external PCIe port for NVMe"
    }

    fn enabled(&self, config: &Config) -> bool {
        config.get_bool("nvme_enable")
    }

    fn provision(&self, ctx: &mut UnitContext<'_>) -> Result<UnitResult> {
        let files = ctx.caps.files;
        let path = boot_file(&ctx.caps, "config.txt")
            .ok_or_else(|| anyhow!("config.txt not found in /boot/firmware or /boot"))?;

        let original = files.read_file(&path).unwrap_or_default();
        let updated = PCIE_PARAMS.iter().fold(original.clone(), |content, param| {
            ensure_line(&content, param).unwrap_or(content)
        });

        let changed = updated != original;
        if changed {
            files
                .write_file(&path, &updated, None)
                .with_context(|| format!("writing {}", path.display()))?;
        }

        let message = if changed {
            "PCIe enabled, reboot needed"
        } else {
            "PCIe already enabled"
        };
        Ok(UnitResult::success(message).reboot_if(changed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::DryRunHost;
    use crate::unit::apply_yaml;

    const YAML: &str = "nvme_enable: true";

    #[test]
    fn test_reboot_only_when_changed() {
        let host = DryRunHost::new().with_file("/boot/firmware/config.txt", "arm_64bit=1\n");

        let first = apply_yaml(&NvmeUnit, YAML, &host);
        assert!(first.reboot_required);
        assert_eq!(
            host.file("/boot/firmware/config.txt").as_deref(),
            Some("arm_64bit=1\ndtparam=pciex1\ndtparam=pciex1_gen=3\n")
        );

        let second = apply_yaml(&NvmeUnit, YAML, &host);
        assert!(!second.reboot_required);
        assert_eq!(host.count("write"), 1);
    }

    #[test]
    fn test_missing_config_txt_fails() {
        let host = DryRunHost::new();
        let result = apply_yaml(&NvmeUnit, YAML, &host);
        assert!(result.is_failed());
    }
}
