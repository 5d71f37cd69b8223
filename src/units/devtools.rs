//! Git identity and terminal for the login user.

use anyhow::{Context, Result};

use crate::capabilities::Cmd;
use crate::config::Config;
use crate::unit::{Unit, UnitContext, UnitResult};

/// Manifest key to `git config` key.
const GIT_SETTINGS: &[(&str, &str)] = &[
    ("git_name", "user.name"),
    ("git_email", "user.email"),
    ("git_default_branch", "init.defaultBranch"),
];

pub struct DevtoolsUnit;

impl Unit for DevtoolsUnit {
    fn name(&self) -> &'static str {
        "devtools"
    }

    fn description(&self) -> &'static str {
        "Write the user's git identity and install alacritty"
    }

    fn enabled(&self, config: &Config) -> bool {
        config.get_bool("install_alacritty")
            || GIT_SETTINGS
                .iter()
                .any(|(key, _)| config.get_nonempty(key).is_some())
    }

    fn provision(&self, ctx: &mut UnitContext<'_>) -> Result<UnitResult> {
        let caps = ctx.caps;
        let user = ctx.username();
        let gitconfig = ctx.user_home().join(".gitconfig");
        let gitconfig = gitconfig.display().to_string();

        let mut written = Vec::new();
        for (key, git_key) in GIT_SETTINGS {
            let Some(value) = ctx.config.get_nonempty(key) else {
                continue;
            };
            caps.run_checked(
                &Cmd::new("git").args(["config", "--file", gitconfig.as_str(), *git_key, value.as_str()]),
            )
            .with_context(|| format!("setting git {}", git_key))?;
            written.push(*git_key);
        }

        if !written.is_empty() {
            let owner = format!("{}:{}", user, user);
            let result = caps
                .run_checked(&Cmd::new("chown").args([owner.as_str(), gitconfig.as_str()]))
                .map(|_| ());
            ctx.soft("chown .gitconfig", result);
        }

        let mut message = if written.is_empty() {
            "no git settings".to_string()
        } else {
            format!("git {}", written.join(", "))
        };

        if ctx.config.get_bool("install_alacritty") {
            let result = caps.packages.install(&["alacritty"]);
            if ctx.soft("installing alacritty", result).is_some() {
                message.push_str(", alacritty installed");
            }
        }

        Ok(UnitResult::success(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::DryRunHost;
    use crate::unit::apply_yaml;

    #[test]
    fn test_enabled_by_any_git_key_or_alacritty() {
        assert!(!DevtoolsUnit.enabled(&Config::default()));
        assert!(DevtoolsUnit.enabled(&Config::from_yaml("git_email: a@b.c").unwrap()));
        assert!(DevtoolsUnit.enabled(&Config::from_yaml("install_alacritty: true").unwrap()));
    }

    #[test]
    fn test_writes_only_configured_git_keys() {
        let host = DryRunHost::new();
        let result = apply_yaml(
            &DevtoolsUnit,
            "username: alice\ngit_name: Alice\ngit_default_branch: main",
            &host,
        );

        assert_eq!(result.message, "git user.name, init.defaultBranch");
        assert!(host.did("run git config --file /home/alice/.gitconfig user.name Alice"));
        assert!(!host.did("run git config --file /home/alice/.gitconfig user.email"));
    }

    #[test]
    fn test_alacritty_unavailable_is_soft() {
        let host = DryRunHost::new().with_unavailable_package("alacritty");
        let result = apply_yaml(&DevtoolsUnit, "install_alacritty: true", &host);

        assert!(!result.is_failed());
        assert_eq!(result.message, "no git settings");
        assert_eq!(result.warnings.len(), 1);
    }
}
