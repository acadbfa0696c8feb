//! mission_run - run one detection-to-documentation cycle and exit
//!
//! Submits a single detection, lets the coordinator fly it against the
//! simulated drone, prints the final status as JSON and exits with:
//!   0 success, 2 validation failure, 3 planning failure,
//!   4 execution failure, 1 anything else.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sortie::{
    config::SortieConfig,
    ingest::DetectionReport,
    Coordinator, Counters, DroneLink, DroneStateCell, InMemoryCooldownStore, IngestOutcome,
    Ingestor, MissionExecutor, MissionKind, MissionState, Planner, SimulatedDrone, Site,
};

const EXIT_OK: i32 = 0;
const EXIT_OTHER: i32 = 1;
const EXIT_PLANNING: i32 = 3;
const EXIT_EXECUTION: i32 = 4;

const ADHOC_SITE: &str = "adhoc";

#[derive(Parser, Debug)]
#[command(author, version, about = "Run a single detection-to-documentation mission")]
struct Args {
    /// Path to a TOML (or .json) config file.
    #[arg(long, env = "SORTIE_CONFIG")]
    config: Option<PathBuf>,

    /// Configured site id to report the detection from.
    #[arg(long, conflicts_with_all = ["lat", "lon"])]
    site: Option<String>,

    /// Target latitude for an ad-hoc site (requires --lon).
    #[arg(long, requires = "lon", allow_hyphen_values = true)]
    lat: Option<f64>,

    /// Target longitude for an ad-hoc site (requires --lat).
    #[arg(long, requires = "lat", allow_hyphen_values = true)]
    lon: Option<f64>,

    /// Detection confidence in [0, 1].
    #[arg(long, default_value_t = 1.0)]
    confidence: f64,

    /// Optional species label.
    #[arg(long)]
    species: Option<String>,

    /// Give up (and abort the active mission) after this many seconds.
    #[arg(long, default_value_t = 300)]
    timeout_secs: u64,

    /// Override the media output directory.
    #[arg(long)]
    media_root: Option<PathBuf>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let code = match run(&args) {
        Ok(code) => code,
        Err(err) => {
            log::error!("mission run failed: {:#}", err);
            EXIT_OTHER
        }
    };
    std::process::exit(code);
}

fn run(args: &Args) -> Result<i32> {
    let mut config = SortieConfig::load_from(args.config.as_deref())?;
    if let Some(root) = &args.media_root {
        config.storage.media_root = root.clone();
    }

    let mut registry = config.site_registry()?;
    let site_id = match (&args.site, args.lat, args.lon) {
        (Some(site), _, _) => site.clone(),
        (None, Some(lat), Some(lon)) => {
            registry
                .register_site(Site {
                    site_id: ADHOC_SITE.to_string(),
                    latitude: lat,
                    longitude: lon,
                    channel_key: format!("{}/detections", ADHOC_SITE),
                })
                .map_err(|err| anyhow!("ad-hoc site: {}", err))?;
            ADHOC_SITE.to_string()
        }
        _ => return Err(anyhow!("either --site or --lat/--lon is required")),
    };
    let registry = Arc::new(registry);

    let mut link: Box<dyn DroneLink> = Box::new(
        SimulatedDrone::new(config.simulator.battery_pct)
            .with_drain_per_op(config.simulator.drain_per_op_pct)
            .with_op_latency(config.simulator.op_latency),
    );
    let telemetry = link.telemetry().context("initial drone telemetry")?;
    let drone = DroneStateCell::new(&config.drone.drone_id, telemetry);

    let counters = Arc::new(Counters::default());
    let executor = MissionExecutor::new(link, drone.clone(), config.executor_settings());
    let coordinator = Coordinator::new(
        config.coordinator_settings(),
        Planner::new(config.planner_settings()),
        registry.clone(),
        drone,
        Arc::new(executor),
        counters.clone(),
    );
    let dispatcher = coordinator.spawn_dispatcher()?;
    let ingestor = Ingestor::new(
        registry,
        config.coordinator.cooldown,
        Box::new(InMemoryCooldownStore::new()),
        coordinator.clone(),
        counters,
    );

    let report = DetectionReport {
        site_id,
        lat: None,
        lon: None,
        confidence: args.confidence,
        species: args.species.clone(),
        timestamp: None,
    };
    let submitted = ingestor.ingest_report(&report, sortie::now_utc());
    let code = match submitted {
        Err(err) => {
            log::error!("detection rejected ({}): {}", err.kind(), err);
            err.category().exit_code()
        }
        Ok(IngestOutcome::Suppressed { .. }) => {
            log::error!("detection suppressed by cooldown");
            EXIT_OTHER
        }
        Ok(IngestOutcome::Queued { .. }) => {
            let timeout = Duration::from_secs(args.timeout_secs);
            if coordinator.wait_for_quiescence(timeout) {
                cycle_exit_code(&coordinator)
            } else {
                log::error!("cycle did not finish within {}s; aborting", args.timeout_secs);
                coordinator.abort_active();
                coordinator.wait_for_quiescence(timeout);
                EXIT_EXECUTION
            }
        }
    };

    coordinator.shutdown();
    dispatcher.join()?;
    println!("{}", serde_json::to_string_pretty(&coordinator.status())?);
    Ok(code)
}

fn cycle_exit_code(coordinator: &Coordinator) -> i32 {
    let status = coordinator.status();
    if let Some(rejection) = &status.last_planning_error {
        log::error!("planning rejected ({}): {}", rejection.kind, rejection.detail);
        return EXIT_PLANNING;
    }
    if let Some(failed) = status
        .recent
        .iter()
        .find(|mission| mission.state == MissionState::Failed)
    {
        log::error!(
            "{} {} failed: {:?}",
            failed.mission_id,
            failed.kind,
            failed.failure_reason()
        );
        return EXIT_EXECUTION;
    }
    let observed = status.recent.iter().find(|mission| {
        mission.kind == MissionKind::Observe && mission.state == MissionState::Completed
    });
    match observed {
        Some(mission) => {
            if let Some(dir) = mission
                .terminal_result
                .as_ref()
                .and_then(|result| result.outcome.artifact_dir())
            {
                log::info!("{} artifacts in {}", mission.mission_id, dir.display());
            }
            EXIT_OK
        }
        None => EXIT_OTHER,
    }
}
