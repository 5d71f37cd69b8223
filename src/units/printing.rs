//! 3D-printing services.
//!
//! `3dprinter_services` is a comma list resolved entry by entry against a
//! fixed set of known services. Every member keeps its own marker
//! (`printing@<service>`), so a partially successful list is retried only
//! for the members that did not finish. `3dprinter_force_reconfigure`
//! bypasses those markers.
//!
//! # Members
//!
//! - `octoprint`, `octoklipper`, `orcaslicer`, `manyfold` run as containers
//!   under a systemd unit and need a detected container engine. Without one
//!   they are skipped, not failed.
//! - `fluidd` only ensures the KIAUH checkout (clone if absent, fast-forward
//!   if present). It never touches containers.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::PathBuf;
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator};
use tracing::{error, info};

use super::containers::Engine;
use super::write_systemd_unit;
use crate::capabilities::Cmd;
use crate::config::Config;
use crate::state::StateKey;
use crate::unit::{Unit, UnitContext, UnitResult};

pub const DEFAULT_KIAUH_REPO: &str = "https://github.com/dw-0/kiauh.git";

const OCTOPRINT_IMAGE: &str = "docker.io/octoprint/octoprint:latest";

/// Known 3D-printing services.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, AsRefStr, EnumIter,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum PrinterService {
    OctoPrint,
    OctoKlipper,
    OrcaSlicer,
    Manyfold,
    Fluidd,
}

/// How a containerised service is run.
#[derive(Debug, Clone, Copy)]
pub struct ContainerSpec {
    pub default_image: &'static str,
    pub ports: &'static [&'static str],
    pub volumes: &'static [&'static str],
    /// Needs the host's serial devices for printer control.
    pub serial: bool,
}

impl PrinterService {
    pub fn needs_container(self) -> bool {
        self.container_spec().is_some()
    }

    pub fn container_spec(self) -> Option<ContainerSpec> {
        match self {
            Self::OctoPrint => Some(ContainerSpec {
                default_image: OCTOPRINT_IMAGE,
                ports: &["5000:80"],
                volumes: &["octoprint:/octoprint"],
                serial: true,
            }),
            Self::OctoKlipper => Some(ContainerSpec {
                default_image: OCTOPRINT_IMAGE,
                ports: &["5001:80"],
                volumes: &["octoklipper:/octoprint"],
                serial: true,
            }),
            Self::OrcaSlicer => Some(ContainerSpec {
                default_image: "lscr.io/linuxserver/orcaslicer:latest",
                ports: &["3000:3000"],
                volumes: &["orcaslicer:/config"],
                serial: false,
            }),
            Self::Manyfold => Some(ContainerSpec {
                default_image: "ghcr.io/manyfold3d/manyfold-solo:latest",
                ports: &["3214:3214"],
                volumes: &["manyfold-config:/config", "manyfold-libraries:/libraries"],
                serial: false,
            }),
            Self::Fluidd => None,
        }
    }

    /// Manifest key overriding the container image.
    pub fn image_key(self) -> String {
        format!("3dprinter_{}_image", self)
    }

    pub fn image(self, config: &Config) -> Option<String> {
        let spec = self.container_spec()?;
        Some(
            config
                .get_nonempty(&self.image_key())
                .unwrap_or_else(|| spec.default_image.to_string()),
        )
    }

    fn systemd_unit_name(self) -> String {
        format!("3dprinter-{}.service", self)
    }
}

/// One entry of `3dprinter_services`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ServiceEntry {
    Known(PrinterService),
    Unknown(String),
}

impl ServiceEntry {
    pub fn resolve(token: &str) -> Self {
        let token = token.trim();
        match token.parse() {
            Ok(service) => Self::Known(service),
            Err(_) => Self::Unknown(token.to_string()),
        }
    }
}

/// Resolve a service list, keeping the first occurrence of each entry.
pub fn resolve_services(tokens: &[String]) -> Vec<ServiceEntry> {
    let mut seen = HashSet::new();
    tokens
        .iter()
        .map(|token| ServiceEntry::resolve(token))
        .filter(|entry| seen.insert(entry.clone()))
        .collect()
}

fn known_services() -> String {
    PrinterService::iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

pub struct PrintingUnit;

impl Unit for PrintingUnit {
    fn name(&self) -> &'static str {
        "printing"
    }

    fn description(&self) -> &'static str {
        "Deploy 3D-printing services (OctoPrint, OrcaSlicer, Manyfold, Fluidd)"
    }

    fn enabled(&self, config: &Config) -> bool {
        !config.get_list("3dprinter_services").is_empty()
    }

    fn tracks_own_state(&self) -> bool {
        true
    }

    fn provision(&self, ctx: &mut UnitContext<'_>) -> Result<UnitResult> {
        let entries = resolve_services(&ctx.config.get_list("3dprinter_services"));
        let force = ctx.config.get_bool("3dprinter_force_reconfigure");
        let engine = Engine::detect(&ctx.caps);

        let mut deployed = Vec::new();
        let mut failed = Vec::new();

        for entry in entries {
            let service = match entry {
                ServiceEntry::Known(service) => service,
                ServiceEntry::Unknown(name) => {
                    ctx.warn(format!(
                        "unknown 3D-printing service '{}' (known: {}), skipping",
                        name,
                        known_services()
                    ));
                    continue;
                }
            };

            let key = StateKey::sub(self.name(), service.as_ref());
            if ctx.state.is_done_with(&key, force) {
                info!(service = %service, "Already deployed, skipping");
                continue;
            }

            let result = if service.needs_container() {
                let Some(engine) = engine else {
                    ctx.warn(format!(
                        "{} needs a container runtime and none was found, skipping",
                        service
                    ));
                    continue;
                };
                deploy_container(ctx, service, engine)
            } else {
                sync_kiauh(ctx)
            };

            let result = result.and_then(|()| ctx.state.mark_done(&key).map_err(anyhow::Error::from));
            match result {
                Ok(()) => {
                    info!(service = %service, "Deployed");
                    deployed.push(service.to_string());
                }
                Err(e) => {
                    error!(service = %service, "Deployment failed: {:#}", e);
                    failed.push(format!("{}: {:#}", service, e));
                }
            }
        }

        if !failed.is_empty() {
            return Ok(UnitResult::failed(failed.join("; ")));
        }
        if deployed.is_empty() {
            return Ok(UnitResult::skipped("no service needed deploying"));
        }
        Ok(UnitResult::success(format!("deployed {}", deployed.join(", "))))
    }
}

fn deploy_container(ctx: &UnitContext<'_>, service: PrinterService, engine: Engine) -> Result<()> {
    let caps = &ctx.caps;
    let (Some(spec), Some(image)) = (service.container_spec(), service.image(ctx.config)) else {
        return Ok(());
    };

    engine
        .pull(caps, &image)
        .with_context(|| format!("pulling {}", image))?;

    let unit = service.systemd_unit_name();
    let content = container_unit(service, engine, &image, &spec);
    let changed = write_systemd_unit(caps, &unit, &content)
        .with_context(|| format!("writing {}", unit))?;

    if changed && caps.services.is_active(&unit) {
        caps.services
            .restart(&unit)
            .with_context(|| format!("restarting {}", unit))?;
    }
    caps.services
        .enable(&unit, true)
        .with_context(|| format!("enabling {}", unit))?;
    Ok(())
}

fn container_unit(
    service: PrinterService,
    engine: Engine,
    image: &str,
    spec: &ContainerSpec,
) -> String {
    let bin = format!("/usr/bin/{}", engine.binary());
    let name = format!("3dprinter-{}", service);

    let mut run = format!("{} run --rm --name {}", bin, name);
    for port in spec.ports {
        run.push_str(&format!(" -p {}", port));
    }
    for volume in spec.volumes {
        run.push_str(&format!(" -v {}", volume));
    }
    if spec.serial {
        run.push_str(" -v /dev:/dev --privileged");
    }
    run.push(' ');
    run.push_str(image);

    format!(
        "[Unit]\n\
         Description=3D printing: {service}\n\
         Wants=network-online.target\n\
         After=network-online.target\n\n\
         [Service]\n\
         Restart=always\n\
         ExecStartPre=-{bin} rm -f {name}\n\
         ExecStart={run}\n\
         ExecStop={bin} stop {name}\n\n\
         [Install]\n\
         WantedBy=multi-user.target\n"
    )
}

/// Clone the KIAUH repository, or fast-forward an existing checkout.
fn sync_kiauh(ctx: &mut UnitContext<'_>) -> Result<()> {
    let caps = ctx.caps;
    let repo = ctx.config.get("3dprinter_kiauh_repo", DEFAULT_KIAUH_REPO);
    let path = ctx
        .config
        .get_nonempty("3dprinter_kiauh_path")
        .map(PathBuf::from)
        .unwrap_or_else(|| ctx.user_home().join("kiauh"));
    let path_str = path.display().to_string();

    if caps.files.exists(&path.join(".git")) {
        caps.run_checked(&Cmd::new("git").args(["-C", path_str.as_str(), "pull", "--ff-only"]))
            .context("updating KIAUH")?;
        return Ok(());
    }

    caps.run_checked(&Cmd::new("git").args(["clone", repo.as_str(), path_str.as_str()]))
        .context("cloning KIAUH")?;

    let user = ctx.username();
    let owner = format!("{}:{}", user, user);
    let result = caps
        .run_checked(&Cmd::new("chown").args(["-R", owner.as_str(), path_str.as_str()]))
        .map(|_| ());
    ctx.soft("chown KIAUH checkout", result);
    Ok(())
}
