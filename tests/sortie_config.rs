use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use sortie::config::SortieConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "SORTIE_CONFIG",
        "SORTIE_API_ADDR",
        "SORTIE_MQTT_BROKER",
        "SORTIE_CONFIDENCE_THRESHOLD",
        "SORTIE_COOLDOWN_SECS",
        "SORTIE_QUEUE_DEPTH",
        "SORTIE_MEDIA_ROOT",
        "SORTIE_STATE_DB",
    ] {
        std::env::remove_var(key);
    }
}

const FIELD_CONFIG: &str = r#"
[coordinator]
confidence_threshold = 0.6
cooldown_secs = 120
queue_depth = 4

[drone]
drone_id = "tello-7"
home_lat = 40.0070
home_lon = -83.0160
altitude_m = 12.0
max_duration_secs = 90
record_secs = 20

[[no_fly_zones]]
name = "stadium"
polygon = [[40.0010, -83.0220], [40.0010, -83.0190], [40.0030, -83.0190], [40.0030, -83.0220]]

[[sites]]
site_id = "pi-001"
channel_key = "sites/pi-001/detections"
lat = 40.0083
lon = -83.0175

[[sites]]
site_id = "pi-002"
channel_key = "sites/pi-002/detections"
lat = 40.0091
lon = -83.0150

[api]
addr = "127.0.0.1:9100"

[mqtt]
broker = "mqtts://gateway.local:8883"
allow_remote = true

[storage]
media_root = "/var/lib/sortie/missions"
"#;

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, contents.as_bytes()).expect("write config");
    file
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(FIELD_CONFIG);
    std::env::set_var("SORTIE_CONFIG", file.path());
    std::env::set_var("SORTIE_COOLDOWN_SECS", "30");
    std::env::set_var("SORTIE_QUEUE_DEPTH", "2");
    std::env::set_var("SORTIE_STATE_DB", "/tmp/sortie-state.db");

    let cfg = SortieConfig::load().expect("load config");

    assert_eq!(cfg.coordinator.confidence_threshold, 0.6);
    assert_eq!(cfg.coordinator.cooldown, Duration::from_secs(30));
    assert_eq!(cfg.coordinator.queue_depth, 2);
    assert_eq!(cfg.drone.drone_id, "tello-7");
    assert_eq!(cfg.drone.altitude_m, 12.0);
    assert_eq!(cfg.drone.max_duration, Duration::from_secs(90));
    assert_eq!(cfg.drone.record_duration, Duration::from_secs(20));
    assert_eq!(cfg.no_fly_zones.len(), 1);
    assert_eq!(cfg.no_fly_zones[0].name, "stadium");
    assert_eq!(cfg.api_addr, "127.0.0.1:9100");
    assert_eq!(cfg.mqtt.broker, "mqtts://gateway.local:8883");
    assert!(cfg.mqtt.allow_remote);
    assert_eq!(
        cfg.storage.state_db.as_deref(),
        Some(std::path::Path::new("/tmp/sortie-state.db"))
    );

    let registry = cfg.site_registry().expect("registry");
    assert_eq!(registry.len(), 2);
    let site = registry
        .lookup_channel("sites/pi-001/detections")
        .expect("pi-001 registered");
    assert_eq!(site.site_id, "pi-001");
    assert_eq!((site.latitude, site.longitude), (40.0083, -83.0175));

    let planner = cfg.planner_settings();
    assert_eq!(planner.max_duration_ms, 90_000);
    assert_eq!(cfg.coordinator_settings().queue_depth, 2);

    clear_env();
}

#[test]
fn missing_home_position_fails_fast() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config("[drone]\ndrone_id = \"tello-7\"\n");
    let err = SortieConfig::load_from(Some(file.path())).unwrap_err();
    assert!(err.to_string().contains("home_lat"), "{}", err);

    clear_env();
}

#[test]
fn duplicate_channels_are_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        r#"
[drone]
home_lat = 40.0
home_lon = -83.0

[[sites]]
site_id = "a"
channel_key = "sites/shared"
lat = 40.0
lon = -83.0

[[sites]]
site_id = "b"
channel_key = "sites/shared"
lat = 40.001
lon = -83.0
"#,
    );
    assert!(SortieConfig::load_from(Some(file.path())).is_err());

    clear_env();
}

#[test]
fn invalid_env_override_is_an_error() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(FIELD_CONFIG);
    std::env::set_var("SORTIE_CONFIDENCE_THRESHOLD", "very high");
    assert!(SortieConfig::load_from(Some(file.path())).is_err());

    std::env::set_var("SORTIE_CONFIDENCE_THRESHOLD", "1.5");
    assert!(SortieConfig::load_from(Some(file.path())).is_err());

    clear_env();
}

#[test]
fn bundled_example_config_is_valid() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("sortie.toml");
    let cfg = SortieConfig::load_from(Some(&path)).expect("example config loads");
    assert_eq!(cfg.sites.len(), 2);
    assert_eq!(cfg.storage.state_db.as_deref(), Some(std::path::Path::new("sortie-state.db")));
    assert_eq!(cfg.simulator.op_latency, Duration::from_millis(200));
}
