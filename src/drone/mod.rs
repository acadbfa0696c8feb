//! Drone boundary.
//!
//! The concrete flight SDK is an external collaborator; it plugs in by
//! implementing `DroneLink`. `SimulatedDrone` implements it for tests and
//! for running the daemon without hardware.

mod sim;

pub use sim::{SimCommand, SimFault, SimJournal, SimOp, SimulatedDrone};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::MissionId;

/// One telemetry sample.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    pub battery_pct: f64,
    pub gps_locked: bool,
    pub link_up: bool,
}

/// A named blob captured during a mission (video segment, still frame).
#[derive(Clone, Debug, PartialEq)]
pub struct MediaArtifact {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// Capability interface to the physical aircraft.
///
/// Every call blocks until the aircraft acknowledges the command. The
/// executor only inspects telemetry and abort requests between calls.
pub trait DroneLink: Send {
    fn name(&self) -> &'static str;

    fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        Ok(())
    }

    fn takeoff(&mut self) -> Result<()>;

    fn goto(&mut self, lat: f64, lon: f64, altitude_m: f64) -> Result<()>;

    fn record(&mut self, duration: Duration) -> Result<Vec<MediaArtifact>>;

    fn return_to_home(&mut self) -> Result<()>;

    fn land(&mut self) -> Result<()>;

    /// Latest telemetry sample. An error means the sample could not be read.
    fn telemetry(&mut self) -> Result<Telemetry>;
}

/// Shared drone record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DroneState {
    pub drone_id: String,
    pub battery_pct: f64,
    pub gps_locked: bool,
    pub link_up: bool,
    pub current_mission_id: Option<MissionId>,
}

impl DroneState {
    pub fn is_idle(&self) -> bool {
        self.current_mission_id.is_none()
    }
}

/// Handle to the single `DroneState`.
///
/// Telemetry fields are written by the executor only. `current_mission_id`
/// is written only from the coordinator's dispatch critical section. Every
/// other component reads snapshots.
#[derive(Clone, Debug)]
pub struct DroneStateCell {
    inner: Arc<RwLock<DroneState>>,
}

impl DroneStateCell {
    pub fn new(drone_id: &str, telemetry: Telemetry) -> Self {
        Self {
            inner: Arc::new(RwLock::new(DroneState {
                drone_id: drone_id.to_string(),
                battery_pct: telemetry.battery_pct,
                gps_locked: telemetry.gps_locked,
                link_up: telemetry.link_up,
                current_mission_id: None,
            })),
        }
    }

    pub fn snapshot(&self) -> DroneState {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub(crate) fn record_telemetry(&self, telemetry: &Telemetry) {
        let mut state = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.battery_pct = telemetry.battery_pct;
        state.gps_locked = telemetry.gps_locked;
        state.link_up = telemetry.link_up;
    }

    pub(crate) fn mark_link_lost(&self) {
        let mut state = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.link_up = false;
    }

    /// Claim the drone for a mission. Returns false if it is already held.
    pub(crate) fn claim(&self, mission_id: MissionId) -> bool {
        let mut state = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if state.current_mission_id.is_some() {
            return false;
        }
        state.current_mission_id = Some(mission_id);
        true
    }

    pub(crate) fn release(&self, mission_id: MissionId) {
        let mut state = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if state.current_mission_id == Some(mission_id) {
            state.current_mission_id = None;
        } else {
            log::warn!(
                "release of {} ignored: drone held by {:?}",
                mission_id,
                state.current_mission_id
            );
        }
    }
}
