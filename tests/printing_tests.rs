//! Per-service marker behaviour of the 3D-printing unit across runs.

use piprovision::capabilities::{Capabilities, DryRunHost};
use piprovision::orchestrator::Orchestrator;
use piprovision::state::{StateKey, StateTracker};
use piprovision::unit::{Outcome, UnitResult};
use piprovision::units::printing::PrintingUnit;
use piprovision::Config;
use tempfile::tempdir;

const SERVICES: &str = "3dprinter_services: octoprint, badname, fluidd\n";

fn run_printing(yaml: &str, host: &DryRunHost, state: &StateTracker) -> UnitResult {
    let config = Config::from_yaml(yaml).unwrap();
    let mut orchestrator = Orchestrator::new(vec![Box::new(PrintingUnit)]);
    let report = orchestrator
        .execute(&config, Capabilities::from_host(host), state)
        .unwrap();
    report.get("printing").cloned().unwrap()
}

fn marker(service: &str) -> StateKey {
    StateKey::sub("printing", service)
}

#[test]
fn test_missing_runtime_skips_container_services_only() {
    let host = DryRunHost::new();
    let dir = tempdir().unwrap();
    let state = StateTracker::open(dir.path(), false).unwrap();

    let result = run_printing(SERVICES, &host, &state);

    assert_eq!(result.outcome, Outcome::Success);
    assert_eq!(result.message, "deployed fluidd");
    assert_eq!(result.warnings.len(), 2);
    assert!(result.warnings.iter().any(|w| w.contains("'badname'")));
    assert!(result.warnings.iter().any(|w| w.starts_with("octoprint needs a container runtime")));

    assert!(host.did("run git clone https://github.com/dw-0/kiauh.git /home/pi/kiauh"));
    assert!(state.is_done(&marker("fluidd")));
    assert!(!state.is_done(&marker("octoprint")));
    assert!(!state.is_done(&StateKey::unit("printing")));
}

#[test]
fn test_later_run_deploys_only_unfinished_services() {
    let host = DryRunHost::new();
    let dir = tempdir().unwrap();
    let state = StateTracker::open(dir.path(), false).unwrap();
    run_printing(SERVICES, &host, &state);

    host.add_command("podman");
    let result = run_printing(SERVICES, &host, &state);

    assert_eq!(result.message, "deployed octoprint");
    assert_eq!(host.count("run git"), 1);
    assert!(host.did("run podman pull docker.io/octoprint/octoprint:latest"));
    assert!(host
        .snapshot()
        .enabled_services
        .contains("3dprinter-octoprint.service"));
    assert!(state.is_done(&marker("octoprint")));

    let result = run_printing(SERVICES, &host, &state);
    assert!(result.is_skipped());
    assert_eq!(result.message, "no service needed deploying");
}

#[test]
fn test_force_reconfigure_redeploys_everything() {
    let host = DryRunHost::new().with_command("podman");
    let dir = tempdir().unwrap();
    let state = StateTracker::open(dir.path(), false).unwrap();
    run_printing(SERVICES, &host, &state);

    let forced = format!("{}3dprinter_force_reconfigure: true\n", SERVICES);
    let result = run_printing(&forced, &host, &state);

    assert_eq!(result.message, "deployed octoprint, fluidd");
    assert!(host.did("run git -C /home/pi/kiauh pull --ff-only"));
    assert_eq!(host.count("run podman pull"), 2);
}

#[test]
fn test_partial_failure_is_retried() {
    let dir = tempdir().unwrap();
    let state = StateTracker::open(dir.path(), false).unwrap();

    let broken = DryRunHost::new()
        .with_command("podman")
        .with_failing_command("podman");
    let result = run_printing(SERVICES, &broken, &state);

    assert!(result.is_failed());
    assert!(result.message.starts_with("octoprint: pulling"));
    assert!(state.is_done(&marker("fluidd")));
    assert!(!state.is_done(&marker("octoprint")));

    let healthy = DryRunHost::new().with_command("podman");
    let result = run_printing(SERVICES, &healthy, &state);

    assert_eq!(result.message, "deployed octoprint");
    assert!(!healthy.did("run git"));
}

#[test]
fn test_image_override_is_used() {
    let host = DryRunHost::new().with_command("docker");
    let state = StateTracker::read_only("/nonexistent/piprovision-it", false);
    let yaml = "3dprinter_services: manyfold\n3dprinter_manyfold_image: example.org/manyfold:1.0\n";

    let result = run_printing(yaml, &host, &state);

    assert_eq!(result.outcome, Outcome::Success);
    assert!(host.did("run docker pull example.org/manyfold:1.0"));
    let unit = host
        .file("/etc/systemd/system/3dprinter-manyfold.service")
        .unwrap();
    assert!(unit.contains("ExecStart=/usr/bin/docker run --rm --name 3dprinter-manyfold"));
}
