//! Container runtimes.
//!
//! `container_runtime` resolves to one of `none`, `podman`, `docker`, or
//! `both`. Tokens outside that set fall back to podman with a SoftWarning.
//! Installing the runtime is central; compose helpers, the docker group
//! membership, and the `extra_containers` pre-pulls are soft.

use anyhow::{Context, Result};
use strum::{Display, EnumString};

use crate::capabilities::{Capabilities, Cmd};
use crate::config::Config;
use crate::unit::{Unit, UnitContext, UnitResult};

/// Requested container runtime(s).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ContainerRuntime {
    None,
    Podman,
    Docker,
    Both,
}

impl ContainerRuntime {
    /// Parse a manifest token. Empty means `None`; unknown tokens yield
    /// `Option::None`.
    pub fn parse_known(token: &str) -> Option<Self> {
        let token = token.trim();
        if token.is_empty() {
            return Some(Self::None);
        }
        token.parse().ok()
    }

    /// Resolve a manifest token, falling back to `Podman` for unknown ones.
    pub fn resolve(token: &str) -> Self {
        Self::parse_known(token).unwrap_or(Self::Podman)
    }

    pub fn from_config(config: &Config) -> Self {
        Self::resolve(&config.get("container_runtime", "none"))
    }

    pub fn wants_podman(self) -> bool {
        matches!(self, Self::Podman | Self::Both)
    }

    pub fn wants_docker(self) -> bool {
        matches!(self, Self::Docker | Self::Both)
    }
}

/// A container engine present on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Engine {
    Podman,
    Docker,
}

impl Engine {
    /// Detect an installed engine, preferring podman.
    pub fn detect(caps: &Capabilities<'_>) -> Option<Self> {
        if caps.process.command_exists("podman") {
            Some(Self::Podman)
        } else if caps.process.command_exists("docker") {
            Some(Self::Docker)
        } else {
            None
        }
    }

    pub fn binary(self) -> &'static str {
        match self {
            Self::Podman => "podman",
            Self::Docker => "docker",
        }
    }

    /// Pull `image`.
    pub fn pull(self, caps: &Capabilities<'_>, image: &str) -> Result<()> {
        caps.run_checked(&Cmd::new(self.binary()).args(["pull", image]))?;
        Ok(())
    }
}

pub struct ContainersUnit;

impl Unit for ContainersUnit {
    fn name(&self) -> &'static str {
        "containers"
    }

    fn description(&self) -> &'static str {
        "Install podman and/or docker and pre-pull extra images"
    }

    fn enabled(&self, config: &Config) -> bool {
        ContainerRuntime::from_config(config) != ContainerRuntime::None
    }

    fn provision(&self, ctx: &mut UnitContext<'_>) -> Result<UnitResult> {
        let caps = ctx.caps;
        let requested = ctx.config.get("container_runtime", "none");
        let runtime = match ContainerRuntime::parse_known(&requested) {
            Some(runtime) => runtime,
            None => {
                ctx.warn(format!(
                    "unknown container_runtime '{}', using podman",
                    requested.trim()
                ));
                ContainerRuntime::Podman
            }
        };

        if runtime.wants_podman() {
            caps.packages
                .install(&["podman"])
                .context("installing podman")?;
            let result = caps.packages.install(&["podman-compose"]);
            ctx.soft("installing podman-compose", result);
        }

        if runtime.wants_docker() {
            caps.packages
                .install(&["docker.io"])
                .context("installing docker")?;
            caps.services
                .enable("docker", true)
                .context("enabling docker")?;

            let user = ctx.username();
            let result = caps
                .run_checked(&Cmd::new("usermod").args(["-aG", "docker", user.as_str()]))
                .map(|_| ());
            ctx.soft("adding user to docker group", result);
        }

        let mut pulled = 0;
        let images = ctx.config.get_list("extra_containers");
        if !images.is_empty() {
            match Engine::detect(&caps) {
                Some(engine) => {
                    for image in &images {
                        let result = engine.pull(&caps, image);
                        if ctx.soft(&format!("pulling {}", image), result).is_some() {
                            pulled += 1;
                        }
                    }
                }
                None => ctx.warn("no container engine found, skipping extra_containers"),
            }
        }

        let mut message = format!("runtime {}", runtime);
        if pulled > 0 {
            message.push_str(&format!(", {} images pulled", pulled));
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
    fn test_resolve_tokens() {
        assert_eq!(ContainerRuntime::resolve("docker"), ContainerRuntime::Docker);
        assert_eq!(ContainerRuntime::resolve(" Both "), ContainerRuntime::Both);
        assert_eq!(ContainerRuntime::resolve(""), ContainerRuntime::None);
        assert_eq!(ContainerRuntime::resolve("none"), ContainerRuntime::None);
        assert_eq!(ContainerRuntime::resolve("bogus"), ContainerRuntime::Podman);
        assert_eq!(ContainerRuntime::parse_known("bogus"), None);
        assert_eq!(ContainerRuntime::from_config(&Config::default()), ContainerRuntime::None);
    }

    #[test]
    fn test_unknown_runtime_falls_back_to_podman() {
        let host = DryRunHost::new();
        let result = apply_yaml(&ContainersUnit, "container_runtime: bogus", &host);

        assert!(!result.is_failed());
        assert_eq!(result.message, "runtime podman");
        assert_eq!(result.warnings, vec!["unknown container_runtime 'bogus', using podman"]);
        assert!(host.snapshot().packages.contains("podman"));
    }

    #[test]
    fn test_both_runtimes_pull_with_podman() {
        let host = DryRunHost::new();
        let yaml = "container_runtime: both\nextra_containers: alpine:3, busybox\nusername: alice\n";
        let result = apply_yaml(&ContainersUnit, yaml, &host);

        assert!(result.message.ends_with("2 images pulled"));
        assert!(host.did("run podman pull alpine:3"));
        assert!(!host.did("run docker pull"));
        assert!(host
            .snapshot()
            .group_members
            .contains(&("docker".to_string(), "alice".to_string())));
    }

    #[test]
    fn test_failed_pull_is_soft() {
        let host = DryRunHost::new().with_failing_command("podman");
        let result = apply_yaml(
            &ContainersUnit,
            "container_runtime: podman\nextra_containers: alpine",
            &host,
        );

        assert!(!result.is_failed());
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn test_optional_compose_missing_is_soft() {
        let host = DryRunHost::new().with_unavailable_package("podman-compose");
        let result = apply_yaml(&ContainersUnit, "container_runtime: podman", &host);
        assert!(!result.is_failed());
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn test_engine_detect_prefers_podman() {
        let host = DryRunHost::new().with_command("docker");
        let caps = Capabilities::from_host(&host);
        assert_eq!(Engine::detect(&caps), Some(Engine::Docker));

        host.add_command("podman");
        assert_eq!(Engine::detect(&caps), Some(Engine::Podman));
    }
}
