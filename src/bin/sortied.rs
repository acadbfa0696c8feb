//! sortied - detection-to-documentation coordinator daemon
//!
//! This daemon:
//! 1. Loads the site registry and flight limits from configuration
//! 2. Subscribes to every site channel on the broker (when enabled)
//! 3. Queues accepted detections and dispatches them to the drone one at a time
//! 4. Serves the operator API until Ctrl-C

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;

use sortie::{
    api::ApiServer,
    config::SortieConfig,
    transport::DetectionSubscriber,
    Coordinator, CooldownStore, Counters, DroneLink, DroneStateCell, InMemoryCooldownStore,
    Ingestor, MissionExecutor, Planner, SimulatedDrone, SqliteCooldownStore,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Detection-to-documentation drone mission coordinator")]
struct Args {
    /// Path to a TOML (or .json) config file.
    #[arg(long, env = "SORTIE_CONFIG")]
    config: Option<PathBuf>,

    /// Skip the broker subscriber even if the config enables it.
    #[arg(long)]
    no_mqtt: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = SortieConfig::load_from(args.config.as_deref())?;
    let registry = Arc::new(config.site_registry()?);
    if registry.is_empty() {
        log::warn!("no sites configured; only API test detections can be dispatched");
    }

    let cooldown_store: Box<dyn CooldownStore> = match &config.storage.state_db {
        Some(path) => {
            log::info!("cooldown state persisted in {}", path.display());
            Box::new(SqliteCooldownStore::open(path)?)
        }
        None => Box::new(InMemoryCooldownStore::new()),
    };

    let sim = SimulatedDrone::new(config.simulator.battery_pct)
        .with_drain_per_op(config.simulator.drain_per_op_pct)
        .with_op_latency(config.simulator.op_latency);
    let mut link: Box<dyn DroneLink> = Box::new(sim);
    let telemetry = link.telemetry().context("initial drone telemetry")?;
    let drone = DroneStateCell::new(&config.drone.drone_id, telemetry);
    log::info!(
        "drone {} via {}: battery {:.0}%, gps {}, link {}",
        config.drone.drone_id,
        link.name(),
        telemetry.battery_pct,
        telemetry.gps_locked,
        telemetry.link_up
    );

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

    let ingestor = Arc::new(Ingestor::new(
        registry,
        config.coordinator.cooldown,
        cooldown_store,
        coordinator.clone(),
        counters,
    ));

    let subscriber = if config.mqtt.enabled && !args.no_mqtt {
        Some(DetectionSubscriber::new(&config.mqtt, ingestor.clone())?.spawn()?)
    } else {
        log::info!("broker subscriber disabled");
        None
    };

    let api_handle =
        ApiServer::new(&config.api_addr, coordinator.clone(), ingestor.clone()).spawn()?;
    log::info!(
        "sortied running: {} sites, threshold {:.2}, cooldown {}s, media in {}",
        ingestor.registry().len(),
        config.coordinator.confidence_threshold,
        config.coordinator.cooldown.as_secs(),
        config.storage.media_root.display()
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|err| anyhow!("error setting Ctrl-C handler: {}", err))?;

    let _ = rx.recv();
    log::info!("shutdown signal received, finishing any flight in progress...");
    api_handle.stop()?;
    if let Some(subscriber) = subscriber {
        subscriber.stop()?;
    }
    coordinator.shutdown();
    dispatcher.join()?;
    let counters = coordinator.status().counters;
    log::info!(
        "sortied stopped: {} missions dispatched, {} events dropped",
        counters.missions_dispatched,
        counters.events_dropped()
    );
    Ok(())
}
