//! sortie - detection-to-documentation mission coordinator.
//!
//! Ground sensing sites publish detection events; the coordinator turns
//! each accepted detection into an observation flight on a single shared
//! drone, then flies the drone back to base. The pipeline is:
//!
//! 1. `ingest` maps a channel to a registered `Site`, parses the payload and
//!    applies the per-site cooldown window.
//! 2. `coordinator` queues the event (FIFO), owns the drone exclusivity lock
//!    and runs the dispatch loop.
//! 3. `planner` turns a target into an immutable `MissionPlan` or rejects it.
//! 4. `executor` flies the plan against a `DroneLink`, supervising telemetry
//!    and aborting to home when a safety floor is crossed.
//!
//! Only one non-terminal `Mission` may exist per drone at any time.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod api;
pub mod config;
pub mod coordinator;
pub mod counters;
pub mod drone;
pub mod error;
pub mod executor;
pub mod ingest;
pub mod mission;
pub mod planner;
pub mod registry;
pub mod transport;

pub use coordinator::{Coordinator, CoordinatorSettings, CoordinatorStatus, MissionLauncher};
pub use counters::{CounterSnapshot, Counters};
pub use drone::{DroneLink, DroneState, DroneStateCell, MediaArtifact, SimulatedDrone, Telemetry};
pub use error::{AbortReason, EnqueueError, ErrorCategory, IngestError, PlanningError};
pub use executor::{AbortSignal, ExecutorSettings, MissionExecutor};
pub use ingest::{CooldownStore, InMemoryCooldownStore, IngestOutcome, Ingestor, SqliteCooldownStore};
pub use mission::{Mission, MissionOutcome, MissionState, MissionUpdate, StatusSink};
pub use planner::{NoFlyZone, Planner, PlannerSettings};
pub use registry::SiteRegistry;

/// A registered ground sensing location.
///
/// Immutable once registered; `channel_key` is the MQTT topic the site
/// publishes detections on.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Site {
    pub site_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub channel_key: String,
}

/// A normalized detection report from a site.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DetectionEvent {
    pub site_id: String,
    pub observed_at: DateTime<Utc>,
    /// Coordinator clock at ingestion; cooldown and queue ordering use this.
    pub received_at: DateTime<Utc>,
    pub confidence: f64,
    pub species_label: Option<String>,
    pub raw_payload: String,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MissionKind {
    Observe,
    ReturnToBase,
}

impl fmt::Display for MissionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Observe => write!(f, "OBSERVE"),
            Self::ReturnToBase => write!(f, "RETURN_TO_BASE"),
        }
    }
}

/// Monotonic mission identifier, rendered as `mission-000042`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct MissionId(pub u64);

impl fmt::Display for MissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mission-{:06}", self.0)
    }
}

/// Output of the planner. Altitude and duration come from static
/// configuration, so the same inputs always produce the same plan.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MissionPlan {
    pub kind: MissionKind,
    pub target_lat: f64,
    pub target_lon: f64,
    pub altitude_m: f64,
    pub max_duration_ms: u64,
    /// Great-circle distance from home to target.
    pub distance_m: f64,
}

pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

pub(crate) fn to_epoch_ms(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_epoch_ms(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}
