use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::coordinator::CoordinatorSettings;
use crate::executor::ExecutorSettings;
use crate::planner::{valid_coordinate, NoFlyZone, PlannerSettings};
use crate::registry::SiteRegistry;
use crate::Site;

const DEFAULT_API_ADDR: &str = "127.0.0.1:2188";
const DEFAULT_MQTT_BROKER: &str = "127.0.0.1:1883";
const DEFAULT_MQTT_CLIENT_ID: &str = "sortied";
const DEFAULT_MQTT_QOS: u8 = 1;
const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.5;
const DEFAULT_COOLDOWN_SECS: u64 = 300;
const DEFAULT_QUEUE_DEPTH: usize = 8;
const DEFAULT_ARCHIVE_LEN: usize = 32;
const DEFAULT_DRONE_ID: &str = "drone-1";
const DEFAULT_ALTITUDE_M: f64 = 13.0;
const DEFAULT_MAX_DURATION_SECS: u64 = 180;
const DEFAULT_RETURN_MAX_DURATION_SECS: u64 = 120;
const DEFAULT_CRUISE_SPEED_MPS: f64 = 8.0;
const DEFAULT_ENDURANCE_SECS: f64 = 1500.0;
const DEFAULT_MAX_RANGE_M: f64 = 2000.0;
const DEFAULT_MIN_BATTERY_PCT: f64 = 30.0;
const DEFAULT_ABORT_BATTERY_PCT: f64 = 20.0;
const DEFAULT_RECORD_SECS: u64 = 25;
const DEFAULT_TELEMETRY_INTERVAL_MS: u64 = 500;
const DEFAULT_SETTLE_SECS: u64 = 15;
const DEFAULT_MEDIA_ROOT: &str = "missions";
const DEFAULT_SIM_BATTERY_PCT: f64 = 100.0;
const DEFAULT_SIM_DRAIN_PCT: f64 = 0.5;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SortieConfigFile {
    coordinator: Option<CoordinatorConfigFile>,
    drone: Option<DroneConfigFile>,
    #[serde(default)]
    no_fly_zones: Vec<NoFlyZoneFile>,
    #[serde(default)]
    sites: Vec<SiteFile>,
    api: Option<ApiConfigFile>,
    mqtt: Option<MqttConfigFile>,
    storage: Option<StorageConfigFile>,
    simulator: Option<SimulatorConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct CoordinatorConfigFile {
    confidence_threshold: Option<f64>,
    cooldown_secs: Option<u64>,
    queue_depth: Option<usize>,
    archive_len: Option<usize>,
    return_after_failure: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct DroneConfigFile {
    drone_id: Option<String>,
    home_lat: Option<f64>,
    home_lon: Option<f64>,
    altitude_m: Option<f64>,
    max_duration_secs: Option<u64>,
    return_max_duration_secs: Option<u64>,
    cruise_speed_mps: Option<f64>,
    endurance_secs: Option<f64>,
    max_range_m: Option<f64>,
    min_battery_pct: Option<f64>,
    abort_battery_pct: Option<f64>,
    record_secs: Option<u64>,
    telemetry_interval_ms: Option<u64>,
    settle_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct NoFlyZoneFile {
    name: String,
    polygon: Vec<[f64; 2]>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SiteFile {
    site_id: String,
    channel_key: String,
    lat: f64,
    lon: f64,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ApiConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct MqttConfigFile {
    enabled: Option<bool>,
    broker: Option<String>,
    client_id: Option<String>,
    qos: Option<u8>,
    use_tls: Option<bool>,
    allow_remote: Option<bool>,
    username: Option<String>,
    password: Option<String>,
    ca_path: Option<PathBuf>,
    client_cert_path: Option<PathBuf>,
    client_key_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct StorageConfigFile {
    media_root: Option<PathBuf>,
    state_db: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SimulatorConfigFile {
    battery_pct: Option<f64>,
    drain_per_op_pct: Option<f64>,
    op_latency_ms: Option<u64>,
}

/// Process-wide configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct SortieConfig {
    pub coordinator: CoordinatorConfig,
    pub drone: DroneConfig,
    pub no_fly_zones: Vec<NoFlyZone>,
    pub sites: Vec<Site>,
    pub api_addr: String,
    pub mqtt: MqttConfig,
    pub storage: StorageConfig,
    pub simulator: SimulatorConfig,
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub confidence_threshold: f64,
    pub cooldown: Duration,
    pub queue_depth: usize,
    pub archive_len: usize,
    pub return_after_failure: bool,
}

#[derive(Debug, Clone)]
pub struct DroneConfig {
    pub drone_id: String,
    pub home_lat: f64,
    pub home_lon: f64,
    pub altitude_m: f64,
    pub max_duration: Duration,
    pub return_max_duration: Duration,
    pub cruise_speed_mps: f64,
    pub endurance_secs: f64,
    pub max_range_m: f64,
    /// Battery needed to start a mission.
    pub min_battery_pct: f64,
    /// Battery floor in flight.
    pub abort_battery_pct: f64,
    pub record_duration: Duration,
    pub telemetry_interval: Duration,
    pub settle: Duration,
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub enabled: bool,
    pub broker: String,
    pub client_id: String,
    pub qos: u8,
    pub use_tls: bool,
    pub allow_remote: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ca_path: Option<PathBuf>,
    pub client_cert_path: Option<PathBuf>,
    pub client_key_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub media_root: PathBuf,
    /// Cooldown database; in-memory cooldowns when unset.
    pub state_db: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    pub battery_pct: f64,
    pub drain_per_op_pct: f64,
    pub op_latency: Duration,
}

impl SortieConfig {
    /// Load from `SORTIE_CONFIG` (defaults when unset), apply env overrides
    /// and validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("SORTIE_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => SortieConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: SortieConfigFile) -> Self {
        let coord = file.coordinator.unwrap_or_default();
        let coordinator = CoordinatorConfig {
            confidence_threshold: coord
                .confidence_threshold
                .unwrap_or(DEFAULT_CONFIDENCE_THRESHOLD),
            cooldown: Duration::from_secs(coord.cooldown_secs.unwrap_or(DEFAULT_COOLDOWN_SECS)),
            queue_depth: coord.queue_depth.unwrap_or(DEFAULT_QUEUE_DEPTH),
            archive_len: coord.archive_len.unwrap_or(DEFAULT_ARCHIVE_LEN),
            return_after_failure: coord.return_after_failure.unwrap_or(false),
        };

        let drone_file = file.drone.unwrap_or_default();
        let drone = DroneConfig {
            drone_id: drone_file
                .drone_id
                .unwrap_or_else(|| DEFAULT_DRONE_ID.to_string()),
            home_lat: drone_file.home_lat.unwrap_or(f64::NAN),
            home_lon: drone_file.home_lon.unwrap_or(f64::NAN),
            altitude_m: drone_file.altitude_m.unwrap_or(DEFAULT_ALTITUDE_M),
            max_duration: Duration::from_secs(
                drone_file
                    .max_duration_secs
                    .unwrap_or(DEFAULT_MAX_DURATION_SECS),
            ),
            return_max_duration: Duration::from_secs(
                drone_file
                    .return_max_duration_secs
                    .unwrap_or(DEFAULT_RETURN_MAX_DURATION_SECS),
            ),
            cruise_speed_mps: drone_file
                .cruise_speed_mps
                .unwrap_or(DEFAULT_CRUISE_SPEED_MPS),
            endurance_secs: drone_file.endurance_secs.unwrap_or(DEFAULT_ENDURANCE_SECS),
            max_range_m: drone_file.max_range_m.unwrap_or(DEFAULT_MAX_RANGE_M),
            min_battery_pct: drone_file.min_battery_pct.unwrap_or(DEFAULT_MIN_BATTERY_PCT),
            abort_battery_pct: drone_file
                .abort_battery_pct
                .unwrap_or(DEFAULT_ABORT_BATTERY_PCT),
            record_duration: Duration::from_secs(
                drone_file.record_secs.unwrap_or(DEFAULT_RECORD_SECS),
            ),
            telemetry_interval: Duration::from_millis(
                drone_file
                    .telemetry_interval_ms
                    .unwrap_or(DEFAULT_TELEMETRY_INTERVAL_MS),
            ),
            settle: Duration::from_secs(drone_file.settle_secs.unwrap_or(DEFAULT_SETTLE_SECS)),
        };

        let no_fly_zones = file
            .no_fly_zones
            .into_iter()
            .map(|zone| NoFlyZone {
                name: zone.name,
                polygon: zone.polygon,
            })
            .collect();
        let sites = file
            .sites
            .into_iter()
            .map(|site| Site {
                site_id: site.site_id,
                latitude: site.lat,
                longitude: site.lon,
                channel_key: site.channel_key,
            })
            .collect();

        let api_addr = file
            .api
            .and_then(|api| api.addr)
            .unwrap_or_else(|| DEFAULT_API_ADDR.to_string());

        let mqtt_file = file.mqtt.unwrap_or_default();
        let mqtt = MqttConfig {
            enabled: mqtt_file.enabled.unwrap_or(true),
            broker: mqtt_file
                .broker
                .unwrap_or_else(|| DEFAULT_MQTT_BROKER.to_string()),
            client_id: mqtt_file
                .client_id
                .unwrap_or_else(|| DEFAULT_MQTT_CLIENT_ID.to_string()),
            qos: mqtt_file.qos.unwrap_or(DEFAULT_MQTT_QOS),
            use_tls: mqtt_file.use_tls.unwrap_or(false),
            allow_remote: mqtt_file.allow_remote.unwrap_or(false),
            username: mqtt_file.username,
            password: mqtt_file.password,
            ca_path: mqtt_file.ca_path,
            client_cert_path: mqtt_file.client_cert_path,
            client_key_path: mqtt_file.client_key_path,
        };

        let storage_file = file.storage.unwrap_or_default();
        let storage = StorageConfig {
            media_root: storage_file
                .media_root
                .unwrap_or_else(|| PathBuf::from(DEFAULT_MEDIA_ROOT)),
            state_db: storage_file.state_db,
        };

        let sim = file.simulator.unwrap_or_default();
        let simulator = SimulatorConfig {
            battery_pct: sim.battery_pct.unwrap_or(DEFAULT_SIM_BATTERY_PCT),
            drain_per_op_pct: sim.drain_per_op_pct.unwrap_or(DEFAULT_SIM_DRAIN_PCT),
            op_latency: Duration::from_millis(sim.op_latency_ms.unwrap_or(0)),
        };

        Self {
            coordinator,
            drone,
            no_fly_zones,
            sites,
            api_addr,
            mqtt,
            storage,
            simulator,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(addr) = env_nonempty("SORTIE_API_ADDR") {
            self.api_addr = addr;
        }
        if let Some(broker) = env_nonempty("SORTIE_MQTT_BROKER") {
            self.mqtt.broker = broker;
        }
        if let Some(threshold) = env_nonempty("SORTIE_CONFIDENCE_THRESHOLD") {
            self.coordinator.confidence_threshold = threshold
                .parse()
                .map_err(|_| anyhow!("SORTIE_CONFIDENCE_THRESHOLD must be a number in [0, 1]"))?;
        }
        if let Some(cooldown) = env_nonempty("SORTIE_COOLDOWN_SECS") {
            let seconds: u64 = cooldown.parse().map_err(|_| {
                anyhow!("SORTIE_COOLDOWN_SECS must be an integer number of seconds")
            })?;
            self.coordinator.cooldown = Duration::from_secs(seconds);
        }
        if let Some(depth) = env_nonempty("SORTIE_QUEUE_DEPTH") {
            self.coordinator.queue_depth = depth
                .parse()
                .map_err(|_| anyhow!("SORTIE_QUEUE_DEPTH must be a positive integer"))?;
        }
        if let Some(root) = env_nonempty("SORTIE_MEDIA_ROOT") {
            self.storage.media_root = PathBuf::from(root);
        }
        if let Some(db) = env_nonempty("SORTIE_STATE_DB") {
            self.storage.state_db = Some(PathBuf::from(db));
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let threshold = self.coordinator.confidence_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(anyhow!(
                "coordinator.confidence_threshold must be in [0, 1], got {}",
                threshold
            ));
        }
        if self.coordinator.queue_depth == 0 {
            return Err(anyhow!("coordinator.queue_depth must be at least 1"));
        }

        let drone = &self.drone;
        if drone.drone_id.trim().is_empty() {
            return Err(anyhow!("drone.drone_id must not be empty"));
        }
        if !valid_coordinate(drone.home_lat, drone.home_lon) {
            return Err(anyhow!(
                "drone.home_lat/home_lon are required and must be valid coordinates"
            ));
        }
        if !(drone.altitude_m > 0.0) {
            return Err(anyhow!("drone.altitude_m must be greater than zero"));
        }
        if drone.max_duration.is_zero() || drone.return_max_duration.is_zero() {
            return Err(anyhow!("drone mission durations must be greater than zero"));
        }
        if !(drone.cruise_speed_mps > 0.0) || !(drone.endurance_secs > 0.0) || !(drone.max_range_m > 0.0) {
            return Err(anyhow!(
                "drone.cruise_speed_mps, endurance_secs and max_range_m must be positive"
            ));
        }
        for (name, pct) in [
            ("min_battery_pct", drone.min_battery_pct),
            ("abort_battery_pct", drone.abort_battery_pct),
        ] {
            if !(0.0..=100.0).contains(&pct) {
                return Err(anyhow!("drone.{} must be in [0, 100], got {}", name, pct));
            }
        }
        if drone.abort_battery_pct > drone.min_battery_pct {
            return Err(anyhow!(
                "drone.abort_battery_pct ({}) must not exceed min_battery_pct ({})",
                drone.abort_battery_pct,
                drone.min_battery_pct
            ));
        }

        for zone in &self.no_fly_zones {
            zone.validate().map_err(|err| anyhow!("no_fly_zones: {}", err))?;
        }
        for site in &self.sites {
            if site.site_id.trim().is_empty() || site.channel_key.trim().is_empty() {
                return Err(anyhow!("sites: site_id and channel_key must not be empty"));
            }
            if !valid_coordinate(site.latitude, site.longitude) {
                return Err(anyhow!(
                    "sites: '{}' has invalid coordinates ({}, {})",
                    site.site_id,
                    site.latitude,
                    site.longitude
                ));
            }
        }
        self.site_registry()?;

        if self.mqtt.qos > 2 {
            return Err(anyhow!("mqtt.qos must be 0, 1 or 2, got {}", self.mqtt.qos));
        }
        if self.mqtt.client_id.trim().is_empty() {
            return Err(anyhow!("mqtt.client_id must not be empty"));
        }
        if !(0.0..=100.0).contains(&self.simulator.battery_pct) {
            return Err(anyhow!("simulator.battery_pct must be in [0, 100]"));
        }
        Ok(())
    }

    pub fn site_registry(&self) -> Result<SiteRegistry> {
        SiteRegistry::from_sites(self.sites.iter().cloned()).map_err(|err| anyhow!("sites: {}", err))
    }

    pub fn planner_settings(&self) -> PlannerSettings {
        PlannerSettings {
            home_lat: self.drone.home_lat,
            home_lon: self.drone.home_lon,
            altitude_m: self.drone.altitude_m,
            max_duration_ms: self.drone.max_duration.as_millis() as u64,
            return_max_duration_ms: self.drone.return_max_duration.as_millis() as u64,
            max_range_m: self.drone.max_range_m,
            cruise_speed_mps: self.drone.cruise_speed_mps,
            endurance_secs: self.drone.endurance_secs,
            min_battery_pct: self.drone.min_battery_pct,
            no_fly_zones: self.no_fly_zones.clone(),
        }
    }

    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            confidence_threshold: self.coordinator.confidence_threshold,
            queue_depth: self.coordinator.queue_depth,
            archive_len: self.coordinator.archive_len,
            return_after_failure: self.coordinator.return_after_failure,
            settle: self.drone.settle,
        }
    }

    pub fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            abort_battery_pct: self.drone.abort_battery_pct,
            record_duration: self.drone.record_duration,
            telemetry_interval: self.drone.telemetry_interval,
            media_root: self.storage.media_root.clone(),
        }
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

/// TOML by default; a `.json` extension is read as JSON.
fn read_config_file(path: &Path) -> Result<SortieConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let is_json = path
        .extension()
        .map_or(false, |ext| ext.eq_ignore_ascii_case("json"));
    let cfg = if is_json {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> Result<SortieConfig> {
        let file: SortieConfigFile = toml::from_str(raw)?;
        let cfg = SortieConfig::from_file(file);
        cfg.validate()?;
        Ok(cfg)
    }

    const MINIMAL: &str = r#"
        [drone]
        home_lat = 40.0065
        home_lon = -83.0190
    "#;

    #[test]
    fn defaults_fill_missing_sections() {
        let cfg = parse(MINIMAL).unwrap();
        assert_eq!(cfg.coordinator.confidence_threshold, 0.5);
        assert_eq!(cfg.coordinator.cooldown, Duration::from_secs(300));
        assert_eq!(cfg.drone.altitude_m, 13.0);
        assert_eq!(cfg.drone.record_duration, Duration::from_secs(25));
        assert_eq!(cfg.api_addr, "127.0.0.1:2188");
        assert_eq!(cfg.mqtt.qos, 1);
        assert!(cfg.storage.state_db.is_none());
    }

    #[test]
    fn home_position_is_required() {
        let err = parse("").unwrap_err();
        assert!(err.to_string().contains("home_lat"));
    }

    #[test]
    fn rejects_threshold_out_of_range() {
        let raw = format!("{}\n[coordinator]\nconfidence_threshold = 1.5\n", MINIMAL);
        assert!(parse(&raw).is_err());
    }

    #[test]
    fn rejects_abort_floor_above_planning_floor() {
        let raw = r#"
            [drone]
            home_lat = 40.0065
            home_lon = -83.0190
            min_battery_pct = 25.0
            abort_battery_pct = 40.0
        "#;
        assert!(parse(raw).is_err());
    }

    #[test]
    fn rejects_degenerate_polygon() {
        let raw = format!(
            "{}\n[[no_fly_zones]]\nname = \"line\"\npolygon = [[40.0, -83.0], [40.1, -83.0]]\n",
            MINIMAL
        );
        assert!(parse(&raw).is_err());
    }

    #[test]
    fn rejects_duplicate_channels() {
        let raw = format!(
            "{}\n[[sites]]\nsite_id = \"a\"\nchannel_key = \"ct/x\"\nlat = 40.0\nlon = -83.0\n\
             [[sites]]\nsite_id = \"b\"\nchannel_key = \"ct/x\"\nlat = 40.0\nlon = -83.0\n",
            MINIMAL
        );
        let err = parse(&raw).unwrap_err();
        assert!(err.to_string().contains("already registered"));
    }

    #[test]
    fn rejects_unknown_keys() {
        let raw = MINIMAL.replace("[drone]", "[drone]\nspeed = 3");
        assert!(toml::from_str::<SortieConfigFile>(&raw).is_err());
    }
}
