//! fray-helper
//!
//! Runs one fault against a list of containers on this node: resolve each
//! target, inject, hold for the chaos duration, revert, report. SIGINT and
//! SIGTERM abort the hold early; every installed fault is still reverted.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use fray_common::fault::FaultKind;
use fray_helper::abort::{AbortNotifier, abort_channel, spawn_signal_watcher};
use fray_helper::config::{HelperConfig, HelperConfigInput};
use fray_helper::controller::{Controller, ExecutionMode, RunReport};
use fray_helper::injector::{
    DiskFillInjector, Injector, NetworkRuleInjector, ProcessKillInjector, StressInjector,
    TrafficRedirectInjector,
};
use fray_helper::locator::Locator;
use fray_helper::locator::inspect::AnyInspector;
use fray_helper::probe::TcpProbe;
use fray_helper::reporter::LogReporter;
use fray_helper::workload::StartOptions;
use fray_netns::SystemRunner;

/// In-target fault injection helper.
#[derive(Parser, Debug)]
#[command(name = "fray-helper", about = "Inject, hold and revert a fault on local containers")]
struct Cli {
    /// TOML configuration file.
    #[arg(long, conflicts_with = "from_env")]
    config: Option<PathBuf>,

    /// Read the flat configuration map from the process environment.
    #[arg(long, default_value_t = false)]
    from_env: bool,

    /// Host procfs mount.
    #[arg(long, env = "FRAY_PROC_ROOT")]
    proc_root: Option<PathBuf>,

    /// Host cgroup filesystem mount.
    #[arg(long, env = "FRAY_CGROUP_ROOT")]
    cgroup_root: Option<PathBuf>,
}

fn load_config(cli: &Cli) -> anyhow::Result<HelperConfig> {
    let input = match (&cli.config, cli.from_env) {
        (Some(path), _) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            HelperConfigInput::from_toml_str(&text)?
        }
        (None, true) => {
            let vars: HashMap<String, String> = std::env::vars().collect();
            HelperConfigInput::from_env_map(&vars)?
        }
        (None, false) => anyhow::bail!("either --config or --from-env is required"),
    };
    let mut cfg = input.resolve()?;
    if let Some(root) = &cli.proc_root {
        cfg.proc_root = root.clone();
    }
    if let Some(root) = &cli.cgroup_root {
        cfg.cgroup_root = root.clone();
    }
    Ok(cfg)
}

async fn run_with<I: Injector>(
    cfg: &HelperConfig,
    locator: Locator<AnyInspector<SystemRunner>>,
    injector: I,
    abort: AbortNotifier,
) -> RunReport {
    let mut reporter = LogReporter::new();
    if let Some(sink) = &cfg.result_sink {
        reporter = reporter.with_sink(sink);
    }
    let controller = Controller::new(locator, injector, reporter, cfg.controller.clone(), abort);
    match &cfg.probe {
        Some(probe) if cfg.controller.mode == ExecutionMode::Serial => {
            controller
                .with_probe(TcpProbe::new(&probe.address, probe.timeout))
                .run(&cfg.targets)
                .await
        }
        Some(_) => {
            tracing::warn!("health probe is only run in serial mode");
            controller.run(&cfg.targets).await
        }
        None => controller.run(&cfg.targets).await,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = load_config(&cli)?;

    tracing::info!(
        fault = cfg.fault.name(),
        targets = cfg.targets.len(),
        runtime = %cfg.runtime,
        socket = %cfg.socket_path,
        mode = %cfg.controller.mode,
        "fray-helper starting"
    );

    let (abort_handle, abort) = abort_channel();
    spawn_signal_watcher(abort_handle).context("installing signal handlers")?;

    let runner = SystemRunner;
    let inspector = AnyInspector::for_runtime(cfg.runtime, runner, &cfg.socket_path);
    let locator = Locator::new(inspector.clone()).with_roots(&cfg.proc_root, &cfg.cgroup_root);

    let report = match cfg.fault.kind.clone() {
        FaultKind::ResourceStress(spec) => {
            let opts = StartOptions {
                proc_root: cfg.proc_root.clone(),
                ..StartOptions::default()
            };
            let injector = StressInjector::new(spec, cfg.fault.duration).with_options(opts);
            run_with(&cfg, locator, injector, abort).await
        }
        FaultKind::NetworkRule(spec) => {
            run_with(&cfg, locator, NetworkRuleInjector::new(runner, spec), abort).await
        }
        FaultKind::TrafficRedirect(spec) => {
            run_with(&cfg, locator, TrafficRedirectInjector::new(runner, spec), abort).await
        }
        FaultKind::ProcessKill(spec) => {
            run_with(&cfg, locator, ProcessKillInjector::new(inspector, spec), abort).await
        }
        FaultKind::DiskFill(spec) => {
            let injector = DiskFillInjector::new(runner, spec).with_proc_root(&cfg.proc_root);
            run_with(&cfg, locator, injector, abort).await
        }
    };

    for episode in &report.episodes {
        tracing::info!(
            episode = %episode.episode_id,
            target = %episode.target,
            state = %episode.state,
            revert_attempts = episode.revert_attempts,
            error = episode.error.as_deref().unwrap_or(""),
            "episode outcome"
        );
    }

    let code = report.exit_code();
    tracing::info!(run = %report.run_id, exit_code = code, "fray-helper stopped");
    std::process::exit(code);
}
