//! Login user, password, and SSH key.

use anyhow::{Context, Result};

use crate::capabilities::Cmd;
use crate::config::Config;
use crate::unit::{Unit, UnitContext, UnitResult, ensure_line};

/// Supplementary groups for the login user.
const USER_GROUPS: &str = "sudo,adm,dialout,video,plugdev";

pub struct UserUnit;

impl Unit for UserUnit {
    fn name(&self) -> &'static str {
        "user"
    }

    fn description(&self) -> &'static str {
        "Create the login user and install its password and SSH key"
    }

    fn enabled(&self, config: &Config) -> bool {
        config.get_nonempty("username").is_some()
    }

    fn provision(&self, ctx: &mut UnitContext<'_>) -> Result<UnitResult> {
        let user = ctx.username();
        let caps = ctx.caps;

        let exists = caps
            .process
            .run(&Cmd::new("id").args(["-u", user.as_str()]))
            .map(|out| out.success)
            .unwrap_or(false);

        let mut message = if exists {
            format!("user {} present", user)
        } else {
            caps.run_checked(&Cmd::new("useradd").args([
                "-m",
                "-s",
                "/bin/bash",
                "-G",
                USER_GROUPS,
                user.as_str(),
            ]))
            .with_context(|| format!("creating user {}", user))?;
            format!("user {} created", user)
        };

        if let Some(password) = ctx.config.get_nonempty("user_password") {
            // chpasswd reads the secret from stdin, never argv.
            caps.run_checked(&Cmd::new("chpasswd").stdin(format!("{}:{}\n", user, password)))
                .context("setting user password")?;
        }

        if let Some(key) = ctx.config.get_nonempty("ssh_public_key") {
            install_ssh_key(ctx, &user, &key).context("installing SSH key")?;
            message.push_str(", SSH key installed");
        }

        Ok(UnitResult::success(message))
    }
}

fn install_ssh_key(ctx: &mut UnitContext<'_>, user: &str, key: &str) -> Result<()> {
    let files = ctx.caps.files;
    let ssh_dir = ctx.user_home().join(".ssh");
    let authorized = ssh_dir.join("authorized_keys");

    files.create_dir(&ssh_dir)?;
    let current = files.read_file(&authorized).unwrap_or_default();
    let content = ensure_line(&current, key).unwrap_or(current);
    let changed = files.write_file(&authorized, &content, Some(0o600))?;

    if changed {
        let owner = format!("{}:{}", user, user);
        let result = ctx
            .caps
            .run_checked(&Cmd::new("chown").args(["-R", owner.as_str()]).arg(ssh_dir.display().to_string()))
            .map(|_| ());
        ctx.soft("chown .ssh", result);
    }
    Ok(())
}
