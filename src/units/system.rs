//! Hostname, timezone, locale, and keyboard layout.
//!
//! Each sub-step only runs when its key is set, and each one is central:
//! a failure fails the unit. Only the live `hostnamectl`/`udevadm` nudges
//! are soft.

use anyhow::{Context, Result};
use std::path::Path;

use crate::capabilities::Cmd;
use crate::unit::{Unit, UnitContext, UnitResult, ensure_line};

const HOSTS_LOOPBACK: &str = "127.0.1.1";

pub struct SystemUnit;

impl Unit for SystemUnit {
    fn name(&self) -> &'static str {
        "system"
    }

    fn description(&self) -> &'static str {
        "Set hostname, timezone, locale, and keyboard layout"
    }

    fn provision(&self, ctx: &mut UnitContext<'_>) -> Result<UnitResult> {
        let mut applied = Vec::new();

        if let Some(hostname) = ctx.config.get_nonempty("hostname") {
            set_hostname(ctx, &hostname).context("setting hostname")?;
            applied.push(format!("hostname={}", hostname));
        }
        if let Some(timezone) = ctx.config.get_nonempty("timezone") {
            set_timezone(ctx, &timezone).context("setting timezone")?;
            applied.push(format!("timezone={}", timezone));
        }
        if let Some(locale) = ctx.config.get_nonempty("locale") {
            set_locale(ctx, &locale).context("setting locale")?;
            applied.push(format!("locale={}", locale));
        }
        if let Some(layout) = ctx.config.get_nonempty("keyboard_layout") {
            set_keyboard(ctx, &layout).context("setting keyboard layout")?;
            applied.push(format!("keyboard={}", layout));
        }

        if applied.is_empty() {
            return Ok(UnitResult::success("nothing to configure"));
        }
        Ok(UnitResult::success(applied.join(", ")))
    }
}

fn set_hostname(ctx: &mut UnitContext<'_>, hostname: &str) -> Result<()> {
    let files = ctx.caps.files;
    let changed = files.write_file(Path::new("/etc/hostname"), &format!("{}\n", hostname), None)?;

    let hosts_path = Path::new("/etc/hosts");
    let hosts = files.read_file(hosts_path).unwrap_or_default();
    files.write_file(hosts_path, &with_loopback_host(&hosts, hostname), None)?;

    if changed && ctx.caps.process.command_exists("hostnamectl") {
        let result = ctx
            .caps
            .run_checked(&Cmd::new("hostnamectl").args(["set-hostname", hostname]))
            .map(|_| ());
        ctx.soft("hostnamectl set-hostname", result);
    }
    Ok(())
}

fn set_timezone(ctx: &mut UnitContext<'_>, timezone: &str) -> Result<()> {
    let current = ctx
        .caps
        .files
        .read_file(Path::new("/etc/timezone"))
        .unwrap_or_default();
    if current.trim() == timezone {
        return Ok(());
    }
    ctx.caps
        .run_checked(&Cmd::new("timedatectl").args(["set-timezone", timezone]))?;
    ctx.caps
        .files
        .write_file(Path::new("/etc/timezone"), &format!("{}\n", timezone), None)?;
    Ok(())
}

fn set_locale(ctx: &mut UnitContext<'_>, locale: &str) -> Result<()> {
    let files = ctx.caps.files;
    let gen_path = Path::new("/etc/locale.gen");
    let current = files.read_file(gen_path).unwrap_or_default();

    let entry = locale_gen_entry(locale);
    if let Some(updated) = enable_locale(&current, &entry) {
        files.write_file(gen_path, &updated, None)?;
        ctx.caps.run_checked(&Cmd::new("locale-gen"))?;
    }

    files.write_file(
        Path::new("/etc/default/locale"),
        &format!("LANG={}\n", locale),
        None,
    )?;
    Ok(())
}

fn set_keyboard(ctx: &mut UnitContext<'_>, layout: &str) -> Result<()> {
    let content = format!(
        "XKBMODEL=\"pc105\"\nXKBLAYOUT=\"{}\"\nXKBVARIANT=\"\"\nXKBOPTIONS=\"\"\nBACKSPACE=\"guess\"\n",
        layout
    );
    let changed = ctx
        .caps
        .files
        .write_file(Path::new("/etc/default/keyboard"), &content, None)?;

    if changed {
        let result = ctx
            .caps
            .run_checked(&Cmd::new("udevadm").args(["trigger", "--subsystem-match=input"]))
            .map(|_| ());
        ctx.soft("udevadm trigger", result);
    }
    Ok(())
}

/// `en_US.UTF-8` becomes the locale.gen line `en_US.UTF-8 UTF-8`.
fn locale_gen_entry(locale: &str) -> String {
    let charset = locale.split_once('.').map(|(_, c)| c).unwrap_or("ISO-8859-1");
    format!("{} {}", locale, charset)
}

/// Uncomment `entry` in a locale.gen file, or append it.
fn enable_locale(content: &str, entry: &str) -> Option<String> {
    let mut found = false;
    let mut changed = false;
    let lines: Vec<String> = content
        .lines()
        .map(|line| {
            let uncommented = line.trim_start_matches('#').trim();
            if uncommented == entry {
                found = true;
                if line.trim() != entry {
                    changed = true;
                    return entry.to_string();
                }
            }
            line.to_string()
        })
        .collect();

    if !found {
        return ensure_line(content, entry);
    }
    if !changed {
        return None;
    }
    let mut updated = lines.join("\n");
    updated.push('\n');
    Some(updated)
}

/// Point the Debian `127.0.1.1` alias at `hostname`, replacing any existing
/// alias line.
fn with_loopback_host(hosts: &str, hostname: &str) -> String {
    let wanted = format!("{}\t{}", HOSTS_LOOPBACK, hostname);
    let mut replaced = false;
    let mut lines: Vec<String> = hosts
        .lines()
        .map(|line| {
            if line.split_whitespace().next() == Some(HOSTS_LOOPBACK) {
                replaced = true;
                wanted.clone()
            } else {
                line.to_string()
            }
        })
        .collect();

    if !replaced {
        lines.push(wanted);
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}
