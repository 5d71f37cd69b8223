//! Package index refresh and base tooling.

use anyhow::Context;

use crate::unit::{Unit, UnitContext, UnitResult};

/// Tools later units rely on.
const BASE_PACKAGES: &[&str] = &["ca-certificates", "curl", "git", "gnupg"];

pub struct BaseUnit;

impl Unit for BaseUnit {
    fn name(&self) -> &'static str {
        "base"
    }

    fn description(&self) -> &'static str {
        "Refresh the package index and install base tooling"
    }

    fn critical(&self) -> bool {
        true
    }

    fn provision(&self, ctx: &mut UnitContext<'_>) -> anyhow::Result<UnitResult> {
        ctx.caps
            .packages
            .refresh()
            .context("refreshing package index")?;
        ctx.caps
            .packages
            .install(BASE_PACKAGES)
            .context("installing base packages")?;

        Ok(UnitResult::success(format!(
            "base packages present: {}",
            BASE_PACKAGES.join(", ")
        )))
    }
}
